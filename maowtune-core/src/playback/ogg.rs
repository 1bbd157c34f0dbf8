//! playback/ogg.rs
//!
//! Ogg/Opus demuxing on top of symphonia's `OggReader`. The reader is
//! synchronous, so it runs on a blocking task fed through `SyncIoBridge`
//! and hands Opus packets back over a bounded channel. The `OpusHead` and
//! `OpusTags` header packets never reach the caller.

use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::default::formats::OggReader;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, trace, warn};

use crate::Error;

const PACKET_QUEUE: usize = 4;

type PacketResult = Result<Vec<u8>, Error>;

/// `ReadOnlySource` wants `Sync`; the gated reader is only `Send`. The
/// mutex is never contended since reads go through `get_mut`.
struct CountingReader<R> {
    inner: Mutex<R>,
    read: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.get_mut().read(buf)?;
        self.read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn is_opus_header(packet: &[u8]) -> bool {
    packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
}

fn is_end_of_stream(err: &SymphoniaError) -> bool {
    matches!(err, SymphoniaError::IoError(e) if e.kind() == ErrorKind::UnexpectedEof)
}

pub struct OggOpusDemuxer {
    packets: mpsc::Receiver<PacketResult>,
}

impl OggOpusDemuxer {
    /// Start demuxing `reader`. Must be called from within a tokio runtime.
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(PACKET_QUEUE);
        let source = CountingReader {
            inner: Mutex::new(SyncIoBridge::new(reader)),
            read: Arc::new(AtomicU64::new(0)),
        };
        tokio::task::spawn_blocking(move || demux_blocking(source, tx));
        Self { packets: rx }
    }

    /// Next Opus audio packet, or `None` once the input ends.
    pub async fn next_packet(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.packets.recv().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

fn demux_blocking<R>(source: CountingReader<R>, tx: mpsc::Sender<PacketResult>)
where
    R: Read + Send + 'static,
{
    let consumed = source.read.clone();
    let mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(source)), Default::default());

    let mut reader = match OggReader::try_new(mss, &FormatOptions::default()) {
        Ok(reader) => reader,
        Err(e) if is_end_of_stream(&e) && consumed.load(Ordering::Relaxed) == 0 => {
            debug!("demuxer input was empty");
            return;
        }
        Err(e) => {
            let _ = tx.blocking_send(Err(Error::Demux(format!("not an Ogg/Opus stream: {e}"))));
            return;
        }
    };

    let mut packets = 0u64;
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(e) if is_end_of_stream(&e) => {
                debug!("demuxer reached end of stream after {packets} packets");
                return;
            }
            Err(e) => {
                warn!("demuxer failed after {packets} packets: {e}");
                let _ = tx.blocking_send(Err(Error::Demux(e.to_string())));
                return;
            }
        };

        let data = packet.data.into_vec();
        if data.is_empty() || is_opus_header(&data) {
            trace!("skipping header/empty packet ({} bytes)", data.len());
            continue;
        }
        packets += 1;
        if tx.blocking_send(Ok(data)).is_err() {
            debug!("demuxer output dropped after {packets} packets");
            return;
        }
    }
}
