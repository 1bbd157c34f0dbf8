// src/lib.rs

pub mod platforms;
pub mod playback;
pub mod services;
pub mod sources;
pub mod tasks;
pub mod test_utils;
pub mod voice;

pub use maowtune_common::error::Error;
pub use playback::{GateRegistry, PlaybackOrchestrator};
pub use voice::SessionController;
