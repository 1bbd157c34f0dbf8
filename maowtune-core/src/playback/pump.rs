//! playback/pump.rs

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::playback::gate::{gate, GateHandle, GateState};
use crate::playback::ogg::OggOpusDemuxer;
use crate::playback::sink::FrameSink;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Source reached end-of-stream.
    Finished { frames: u64 },
    Cancelled { frames: u64 },
}

impl PumpOutcome {
    pub fn frames(&self) -> u64 {
        match self {
            PumpOutcome::Finished { frames } | PumpOutcome::Cancelled { frames } => *frames,
        }
    }
}

/// Move every packet from `demuxer` into `sink` until end-of-stream, an
/// error, or `cancel` fires. Writes hold while `gate` is paused; a closed
/// gate ends the stream.
pub async fn pump<S>(
    demuxer: &mut OggOpusDemuxer,
    sink: &mut S,
    gate: &GateHandle,
    cancel: &CancellationToken,
) -> Result<PumpOutcome, Error>
where
    S: FrameSink + ?Sized,
{
    let mut frames = 0u64;
    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("pump cancelled after {frames} frames");
                return Ok(PumpOutcome::Cancelled { frames });
            }
            packet = demuxer.next_packet() => packet?,
        };

        let Some(packet) = packet else {
            debug!("pump reached end of stream after {frames} frames");
            return Ok(PumpOutcome::Finished { frames });
        };

        if gate.state() != GateState::Playing {
            let state = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("pump cancelled while paused after {frames} frames");
                    return Ok(PumpOutcome::Cancelled { frames });
                }
                state = gate.wait_until_open() => state,
            };
            if state == GateState::Closed {
                debug!("gate closed after {frames} frames");
                return Ok(PumpOutcome::Finished { frames });
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("pump cancelled after {frames} frames");
                return Ok(PumpOutcome::Cancelled { frames });
            }
            written = sink.write_frame(&packet) => written?,
        }
        frames += 1;
    }
}

/// Demux `source` straight into `sink` with no way to cancel.
pub async fn decode<R, S>(sink: &mut S, source: R) -> Result<u64, Error>
where
    R: AsyncRead + Unpin + Send + 'static,
    S: FrameSink + ?Sized,
{
    let (handle, reader) = gate(source);
    let mut demuxer = OggOpusDemuxer::new(reader);
    let outcome = pump(&mut demuxer, sink, &handle, &CancellationToken::new()).await?;
    Ok(outcome.frames())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::VecSink;
    use crate::test_utils::ogg::opus_stream;
    use std::io::Cursor;
    use std::time::Duration;

    fn frames(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i; 8]).collect()
    }

    #[tokio::test]
    async fn test_decode_delivers_every_frame_in_order() {
        let mut sink = VecSink::default();
        let n = decode(&mut sink, Cursor::new(opus_stream(&frames(4)))).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(sink.frames, frames(4));
    }

    #[tokio::test]
    async fn test_demux_error_stops_the_pump() {
        let mut sink = VecSink::default();
        let result = decode(&mut sink, Cursor::new(b"junk that is not an ogg stream".to_vec())).await;
        assert!(matches!(result, Err(Error::Demux(_))));
        assert!(sink.frames.is_empty());
    }

    #[tokio::test]
    async fn test_trailing_junk_after_last_page_is_ignored() {
        let mut sink = VecSink::default();
        let mut bytes = opus_stream(&frames(2));
        bytes.extend_from_slice(b"junk that is not a page header");
        let n = decode(&mut sink, Cursor::new(bytes)).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(sink.frames, frames(2));
    }

    #[tokio::test]
    async fn test_cancel_releases_a_paused_pump() {
        let (handle, reader) = gate(Cursor::new(opus_stream(&frames(3))));
        handle.pause();
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut demuxer = OggOpusDemuxer::new(reader);
                let mut sink = VecSink::default();
                pump(&mut demuxer, &mut sink, &handle, &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("pump should observe cancellation")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PumpOutcome::Cancelled { frames: 0 });
    }

    #[tokio::test]
    async fn test_closed_gate_reads_as_end_of_stream() {
        let (handle, reader) = gate(Cursor::new(opus_stream(&frames(3))));
        handle.close();
        let mut sink = VecSink::default();
        let n = decode(&mut sink, reader).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_pause_holds_packets_already_demuxed() {
        let (handle, reader) = gate(Cursor::new(opus_stream(&frames(6))));
        let mut demuxer = OggOpusDemuxer::new(reader);
        // The input is tiny: give the demuxer time to read all of it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.pause();

        let task = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut sink = VecSink::default();
                let outcome = pump(&mut demuxer, &mut sink, &handle, &CancellationToken::new()).await;
                (outcome, sink.frames)
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        handle.resume();
        let (outcome, written) = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("resumed pump should finish")
            .unwrap();
        assert_eq!(outcome.unwrap(), PumpOutcome::Finished { frames: 6 });
        assert_eq!(written, frames(6));
    }
}
