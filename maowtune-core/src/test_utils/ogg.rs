// File: maowtune-core/src/test_utils/ogg.rs

//! Builders for small, valid Ogg/Opus byte streams.

pub const FLAG_CONTINUED: u8 = 0x01;
pub const FLAG_BOS: u8 = 0x02;
pub const FLAG_EOS: u8 = 0x04;
const SERIAL: u32 = 0x6d61_6f77;

const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04c1_1db7
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
};

/// Ogg page checksum (CRC-32, poly 0x04c11db7, no reflection).
fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &b| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ b) as usize]
    })
}

/// Stereo 48 kHz identification header.
pub fn opus_head() -> Vec<u8> {
    let mut head = b"OpusHead".to_vec();
    head.extend_from_slice(&[1, 2, 0x38, 0x01, 0x80, 0xbb, 0, 0, 0, 0, 0]);
    head
}

pub fn opus_tags() -> Vec<u8> {
    let mut tags = b"OpusTags".to_vec();
    tags.extend_from_slice(&[8, 0, 0, 0]);
    tags.extend_from_slice(b"maowtune");
    tags.extend_from_slice(&[0, 0, 0, 0]);
    tags
}

/// One page with explicit lacing values and body. Granule position is zero.
pub fn raw_page(sequence: u32, header_type: u8, lacing: &[u8], body: &[u8]) -> Vec<u8> {
    build_page(sequence, 0, header_type, lacing, body)
}

/// One page holding `packets`, each terminated within the page.
pub fn page(sequence: u32, granule: u64, header_type: u8, packets: &[Vec<u8>]) -> Vec<u8> {
    let mut lacing = Vec::new();
    let mut body = Vec::new();
    for packet in packets {
        let mut remaining = packet.len();
        while remaining >= 255 {
            lacing.push(255);
            remaining -= 255;
        }
        lacing.push(remaining as u8);
        body.extend_from_slice(packet);
    }
    build_page(sequence, granule, header_type, &lacing, &body)
}

/// A complete stream: `OpusHead`, `OpusTags`, then one page per frame.
pub fn opus_stream(frames: &[Vec<u8>]) -> Vec<u8> {
    let mut out = page(0, 0, FLAG_BOS, &[opus_head()]);
    out.extend(page(1, 0, 0, &[opus_tags()]));
    for (i, frame) in frames.iter().enumerate() {
        let flags = if i + 1 == frames.len() { FLAG_EOS } else { 0 };
        let granule = (i as u64 + 1) * 2880;
        out.extend(page(i as u32 + 2, granule, flags, std::slice::from_ref(frame)));
    }
    out
}

fn build_page(sequence: u32, granule: u64, header_type: u8, lacing: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(27 + lacing.len() + body.len());
    out.extend_from_slice(b"OggS");
    out.push(0);
    out.push(header_type);
    out.extend_from_slice(&granule.to_le_bytes());
    out.extend_from_slice(&SERIAL.to_le_bytes());
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.push(lacing.len() as u8);
    out.extend_from_slice(lacing);
    out.extend_from_slice(body);

    let crc = crc32(&out);
    out[22..26].copy_from_slice(&crc.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_matches_reference_value() {
        // CRC-32/POSIX check value without its final xor.
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0x89a1_897f);
    }
}
