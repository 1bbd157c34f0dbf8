//! playback/transcode.rs
//!
//! Supervises the external encoder: upstream audio is copied into its stdin
//! by a feeder task, Ogg/Opus comes out of its stdout. The child is killed
//! when the `Transcoder` is dropped, whichever phase fails.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Error;

pub const DEFAULT_BITRATE_KBPS: u32 = 96;
pub const DEFAULT_FRAME_DURATION_MS: u32 = 60;

#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl TranscoderConfig {
    /// Single-threaded, error-only logging, CBR libopus in an Ogg container
    /// on stdout.
    pub fn ffmpeg(program: impl Into<String>, bitrate_kbps: u32, frame_duration_ms: u32) -> Self {
        let bitrate = format!("{bitrate_kbps}k");
        let frame_duration = frame_duration_ms.to_string();
        let args: Vec<String> = [
            "-hide_banner",
            "-threads",
            "1",
            "-loglevel",
            "error",
            "-i",
            "-",
            "-c:a",
            "libopus",
            "-b:a",
            bitrate.as_str(),
            "-frame_duration",
            frame_duration.as_str(),
            "-vbr",
            "off",
            "-f",
            "opus",
            "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            program: program.into(),
            args,
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self::ffmpeg("ffmpeg", DEFAULT_BITRATE_KBPS, DEFAULT_FRAME_DURATION_MS)
    }
}

pub struct Transcoder {
    child: Child,
    output: Option<ChildStdout>,
    feeder: Option<JoinHandle<std::io::Result<u64>>>,
}

impl Transcoder {
    /// Spawn the encoder and start feeding it `input`.
    pub fn start<R>(config: &TranscoderConfig, mut input: R) -> Result<Self, Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TranscodeStart(format!("failed to spawn '{}': {e}", config.program)))?;

        // `child` is dropped (and killed) on the early returns below.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::TranscodeStart("encoder stdin was not piped".into()))?;
        let output = child
            .stdout
            .take()
            .ok_or_else(|| Error::TranscodeStart("encoder stdout was not piped".into()))?;

        info!("transcoder started: {} (pid={:?})", config.program, child.id());

        let feeder = tokio::spawn(async move {
            let copied = tokio::io::copy(&mut input, &mut stdin).await?;
            stdin.shutdown().await?;
            debug!("transcoder input exhausted after {copied} bytes");
            Ok(copied)
        });

        Ok(Self {
            child,
            output: Some(output),
            feeder: Some(feeder),
        })
    }

    /// Encoded Ogg/Opus output. Can only be taken once.
    pub fn take_output(&mut self) -> Result<ChildStdout, Error> {
        self.output
            .take()
            .ok_or_else(|| Error::TranscodeStart("transcoder output already taken".into()))
    }

    /// Wait for the encoder to exit. A non-zero status is a `TranscodeExit`.
    pub async fn wait(mut self) -> Result<(), Error> {
        self.finish().await
    }

    /// The exit result if the encoder stops within `grace`, else `None` and
    /// the encoder keeps running.
    pub async fn wait_timeout(&mut self, grace: Duration) -> Option<Result<(), Error>> {
        tokio::time::timeout(grace, self.finish()).await.ok()
    }

    async fn finish(&mut self) -> Result<(), Error> {
        let status = self.child.wait().await?;

        if let Some(feeder) = self.feeder.take() {
            match feeder.await {
                Ok(Ok(_)) => {}
                // The encoder may close stdin early; its exit status decides.
                Ok(Err(e)) => debug!("transcoder feeder stopped: {e}"),
                Err(e) => warn!("transcoder feeder task failed: {e}"),
            }
        }

        if status.success() {
            Ok(())
        } else {
            Err(Error::TranscodeExit(format!("encoder exited with {status}")))
        }
    }

    /// Tear the encoder down without waiting for it to finish.
    pub async fn kill(mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        if let Err(e) = self.child.kill().await {
            debug!("transcoder kill: {e}");
        }
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    fn passthrough(program: &str) -> TranscoderConfig {
        TranscoderConfig {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    #[test]
    fn test_default_arguments() {
        let config = TranscoderConfig::default();
        assert_eq!(config.program, "ffmpeg");
        let joined = config.args.join(" ");
        assert!(joined.contains("-threads 1"));
        assert!(joined.contains("-loglevel error"));
        assert!(joined.contains("-c:a libopus"));
        assert!(joined.contains("-b:a 96k"));
        assert!(joined.contains("-frame_duration 60"));
        assert!(joined.contains("-vbr off"));
        assert!(joined.ends_with("-f opus -"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_start_error() {
        let config = passthrough("maowtune-no-such-encoder");
        let result = Transcoder::start(&config, Cursor::new(Vec::<u8>::new()));
        assert!(matches!(result, Err(Error::TranscodeStart(_))));
    }

    #[tokio::test]
    async fn test_input_flows_through_the_process() {
        let config = passthrough("cat");
        let mut transcoder = Transcoder::start(&config, Cursor::new(b"opus bytes".to_vec())).unwrap();
        let mut output = transcoder.take_output().unwrap();
        assert!(transcoder.take_output().is_err());

        let mut out = Vec::new();
        output.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"opus bytes");
        transcoder.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let config = passthrough("false");
        let transcoder = Transcoder::start(&config, Cursor::new(Vec::<u8>::new())).unwrap();
        let result = transcoder.wait().await;
        assert!(matches!(result, Err(Error::TranscodeExit(_))));
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_a_running_encoder_alone() {
        let config = TranscoderConfig {
            program: "sleep".to_string(),
            args: vec!["5".to_string()],
        };
        let mut transcoder = Transcoder::start(&config, Cursor::new(Vec::<u8>::new())).unwrap();
        assert!(transcoder.wait_timeout(Duration::from_millis(50)).await.is_none());
        transcoder.kill().await;

        let mut failing = Transcoder::start(&passthrough("false"), Cursor::new(Vec::<u8>::new())).unwrap();
        let result = failing.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(result, Some(Err(Error::TranscodeExit(_)))));
    }
}
