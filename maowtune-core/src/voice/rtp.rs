// File: maowtune-core/src/voice/rtp.rs
//
// RTP framing + `aead_aes256_gcm_rtpsize` encryption for outbound Opus.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::playback::sink::SAMPLES_PER_FRAME;
use crate::Error;

pub const ENCRYPTION_MODE: &str = "aead_aes256_gcm_rtpsize";
pub const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 0x80;
const OPUS_PAYLOAD_TYPE: u8 = 0x78;

/// Turns Opus frames into sealed RTP packets for one SSRC.
pub struct RtpSealer {
    cipher: Aes256Gcm,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    nonce: u32,
    samples_per_frame: u32,
}

impl RtpSealer {
    pub fn new(secret_key: &[u8], ssrc: u32) -> Result<Self, Error> {
        let cipher = Aes256Gcm::new_from_slice(secret_key)
            .map_err(|_| Error::Transport(format!("secret key must be 32 bytes, got {}", secret_key.len())))?;
        Ok(Self {
            cipher,
            ssrc,
            sequence: 0,
            timestamp: 0,
            nonce: 0,
            samples_per_frame: SAMPLES_PER_FRAME,
        })
    }

    pub fn set_samples_per_frame(&mut self, samples: u32) {
        self.samples_per_frame = samples;
    }

    /// Header, ciphertext + tag, then the 4-byte nonce counter.
    pub fn seal(&mut self, opus: &[u8]) -> Result<Vec<u8>, Error> {
        let header = self.header();

        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.nonce.to_be_bytes());

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: opus,
                    aad: &header,
                },
            )
            .map_err(|_| Error::Transport("RTP encryption failed".into()))?;

        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + sealed.len() + 4);
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&sealed);
        packet.extend_from_slice(&nonce[..4]);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_frame);
        self.nonce = self.nonce.wrapping_add(1);
        Ok(packet)
    }

    fn header(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION;
        header[1] = OPUS_PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }
}
