//! playback/sink.rs
//!
//! Frame sink adapter: forwards demuxed Opus frames to the voice transport
//! at the encoder's frame cadence so playback runs in real time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, Interval, MissedTickBehavior};

use maowtune_common::traits::VoiceTransport;

use crate::Error;

pub const FRAME_DURATION: Duration = Duration::from_millis(60);
pub const SAMPLE_RATE: u32 = 48_000;
pub const SAMPLES_PER_FRAME: u32 = 2880;

const _: () = assert!(SAMPLES_PER_FRAME as u64 * 1000 == SAMPLE_RATE as u64 * 60);

#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error>;
}

/// Paces writes to one frame per tick.
pub struct PacedSink {
    transport: Arc<dyn VoiceTransport>,
    period: Duration,
    ticker: Option<Interval>,
    frames: u64,
}

impl PacedSink {
    pub fn new(transport: Arc<dyn VoiceTransport>) -> Self {
        Self::with_period(transport, FRAME_DURATION)
    }

    pub fn with_period(transport: Arc<dyn VoiceTransport>, period: Duration) -> Self {
        Self {
            transport,
            period,
            ticker: None,
            frames: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

#[async_trait]
impl FrameSink for PacedSink {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        // Created on the first frame so time spent paused before playback
        // starts is not counted as missed ticks.
        let period = self.period;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;

        self.transport.write_frame(frame).await?;
        self.frames += 1;
        Ok(())
    }
}
