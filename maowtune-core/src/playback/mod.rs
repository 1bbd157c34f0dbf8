//! The pausable streaming pipeline: transcoder output flows through a gate
//! into the Ogg demuxer and out to the voice transport at frame cadence.

pub mod gate;
pub mod ogg;
pub mod orchestrator;
pub mod pump;
pub mod registry;
pub mod sink;
pub mod transcode;

pub use gate::{gate, GateHandle, GateState, GatedReader};
pub use orchestrator::{
    select_format, PlayRequest, PlaybackConfig, PlaybackOrchestrator, PlaybackOutcome, PlaybackReport,
};
pub use registry::{GateRegistry, PlaybackHandle};
pub use sink::{FrameSink, PacedSink};
pub use transcode::{Transcoder, TranscoderConfig};
