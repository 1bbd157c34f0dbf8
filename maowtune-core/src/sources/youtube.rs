//! sources/youtube.rs
//!
//! Video-hosting collaborator backed by the `yt-dlp` extractor. Resolution
//! shells out once per query; the chosen format is then streamed with
//! reqwest using the headers yt-dlp says the CDN expects.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use url::Url;

use maowtune_common::models::{AudioFormat, VideoMetadata};
use maowtune_common::traits::{AudioStream, VideoSource};

use crate::Error;

#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub program: String,
    /// Arguments placed before the query.
    pub args: Vec<String>,
}

impl YtDlpConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: ["--dump-single-json", "--no-playlist", "--no-warnings"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

/// URLs and bare video ids go through unchanged; anything else is a search
/// for the first match.
pub fn normalize_query(query: &str) -> Result<String, Error> {
    let query = query.trim();
    if query.is_empty() {
        return Err(Error::Resolution("nothing to play: empty query".into()));
    }
    if let Ok(url) = Url::parse(query) {
        if matches!(url.scheme(), "http" | "https") {
            return Ok(query.to_string());
        }
    }
    if is_video_id(query) {
        return Ok(query.to_string());
    }
    Ok(format!("ytsearch1:{query}"))
}

fn is_video_id(s: &str) -> bool {
    s.len() == 11 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Deserialize)]
struct YtDlpVideo {
    id: Option<String>,
    title: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
    /// Present for `ytsearch` results.
    #[serde(default)]
    entries: Vec<YtDlpVideo>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    url: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    audio_channels: Option<u32>,
    abr: Option<f64>,
    quality: Option<f64>,
    #[serde(default)]
    http_headers: HashMap<String, String>,
}

impl YtDlpFormat {
    fn into_audio_format(self) -> Option<AudioFormat> {
        let url = self.url?;
        let acodec = self.acodec.filter(|c| c != "none");
        let video_less = self.vcodec.as_deref().is_none_or(|c| c == "none");
        let has_audio = acodec.is_some() && video_less;
        // yt-dlp omits the channel count for some extractors; assume mono
        // rather than discarding an audio format.
        let audio_channels = self
            .audio_channels
            .unwrap_or(if acodec.is_some() { 1 } else { 0 });
        let quality_rank = match self.abr {
            Some(abr) => (abr * 1000.0) as i64,
            None => self.quality.map(|q| q as i64).unwrap_or_default(),
        };

        Some(AudioFormat {
            format_id: self.format_id,
            url,
            has_audio,
            audio_channels,
            quality_rank,
            codec: acodec,
            http_headers: self.http_headers,
        })
    }
}

impl YtDlpVideo {
    fn into_metadata(mut self) -> Result<VideoMetadata, Error> {
        if self.formats.is_empty() && !self.entries.is_empty() {
            let first = self.entries.remove(0);
            return first.into_metadata();
        }
        let Some(id) = self.id else {
            return Err(Error::Resolution("no video found".into()));
        };
        Ok(VideoMetadata {
            title: self.title.unwrap_or_else(|| id.clone()),
            id,
            webpage_url: self.webpage_url,
            duration: self.duration.and_then(|d| Duration::try_from_secs_f64(d).ok()),
            formats: self
                .formats
                .into_iter()
                .filter_map(YtDlpFormat::into_audio_format)
                .collect(),
        })
    }
}

fn parse_extractor_output(stdout: &[u8]) -> Result<VideoMetadata, Error> {
    let video: YtDlpVideo = serde_json::from_slice(stdout)
        .map_err(|e| Error::Resolution(format!("unexpected extractor output: {e}")))?;
    video.into_metadata()
}

pub struct YtDlpSource {
    config: YtDlpConfig,
    client: reqwest::Client,
}

impl YtDlpSource {
    pub fn new(config: YtDlpConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VideoSource for YtDlpSource {
    async fn resolve_video(&self, query: &str) -> Result<VideoMetadata, Error> {
        let target = normalize_query(query)?;
        debug!("resolving '{target}' with {}", self.config.program);

        let output = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(&target)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Resolution(format!("failed to run '{}': {e}", self.config.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Resolution(format!(
                "extractor failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let video = parse_extractor_output(&output.stdout)?;
        info!("resolved '{query}' => {} ({} formats)", video.title, video.formats.len());
        Ok(video)
    }

    async fn list_formats(&self, video: &VideoMetadata) -> Result<Vec<AudioFormat>, Error> {
        Ok(video.formats.clone())
    }

    async fn open_stream(&self, video: &VideoMetadata, format: &AudioFormat) -> Result<AudioStream, Error> {
        let mut request = self.client.get(&format.url);
        for (key, value) in &format.http_headers {
            request = request.header(key, value);
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::StreamOpen(format!("{} [{}]: {e}", video.id, format.format_id)))?;

        debug!("streaming {} format {} ({:?} bytes)", video.id, format.format_id, response.content_length());
        let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
        Ok(Box::new(StreamReader::new(Box::pin(body))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Never Gonna Give You Up",
        "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        "duration": 212.0,
        "formats": [
            {"format_id": "sb0", "url": "https://i.ytimg.com/sb", "acodec": "none", "vcodec": "none"},
            {"format_id": "249", "url": "https://cdn/249", "acodec": "opus", "vcodec": "none",
             "audio_channels": 2, "abr": 50.3, "quality": 3},
            {"format_id": "251", "url": "https://cdn/251", "acodec": "opus", "vcodec": "none",
             "audio_channels": 2, "abr": 129.5, "quality": 3,
             "http_headers": {"User-Agent": "Mozilla/5.0"}},
            {"format_id": "18", "url": "https://cdn/18", "acodec": "mp4a.40.2", "vcodec": "avc1.42001E",
             "audio_channels": 2, "quality": 1},
            {"format_id": "manifest", "acodec": "opus", "vcodec": "none"}
        ]
    }"#;

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("dQw4w9WgXcQ").unwrap(), "dQw4w9WgXcQ");
        assert_eq!(
            normalize_query(" https://youtu.be/dQw4w9WgXcQ ").unwrap(),
            "https://youtu.be/dQw4w9WgXcQ"
        );
        assert_eq!(normalize_query("lofi hip hop").unwrap(), "ytsearch1:lofi hip hop");
        assert_eq!(normalize_query("ftp://example.org/x").unwrap(), "ytsearch1:ftp://example.org/x");
        assert!(matches!(normalize_query("   "), Err(Error::Resolution(_))));
    }

    #[test]
    fn test_extractor_json_maps_to_formats() {
        let video = parse_extractor_output(SAMPLE.as_bytes()).unwrap();
        assert_eq!(video.id, "dQw4w9WgXcQ");
        assert_eq!(video.duration, Some(Duration::from_secs(212)));
        // The url-less manifest entry is dropped.
        assert_eq!(video.formats.len(), 4);

        let by_id = |id: &str| video.formats.iter().find(|f| f.format_id == id).unwrap();
        assert!(!by_id("sb0").has_audio);
        assert!(!by_id("18").has_audio);
        assert!(by_id("251").has_audio);
        assert_eq!(by_id("251").quality_rank, 129_500);
        assert_eq!(by_id("251").http_headers["User-Agent"], "Mozilla/5.0");
        assert!(by_id("251").quality_rank > by_id("249").quality_rank);
    }

    #[test]
    fn test_out_of_range_duration_is_dropped() {
        for duration in ["-1.0", "1e300"] {
            let json = format!(r#"{{"id": "x", "title": "t", "duration": {duration}, "formats": []}}"#);
            let video = parse_extractor_output(json.as_bytes()).unwrap();
            assert_eq!(video.duration, None, "duration {duration}");
        }
    }

    #[test]
    fn test_search_results_use_first_entry() {
        let json = format!(r#"{{"id": "ytsearch1:x", "entries": [{SAMPLE}]}}"#);
        let video = parse_extractor_output(json.as_bytes()).unwrap();
        assert_eq!(video.title, "Never Gonna Give You Up");

        let empty = r#"{"entries": []}"#;
        assert!(matches!(parse_extractor_output(empty.as_bytes()), Err(Error::Resolution(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_reads_extractor_stdout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = YtDlpConfig {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                "cat \"$0\"".into(),
                file.path().to_string_lossy().into_owned(),
            ],
        };
        let source = YtDlpSource::new(config);
        let video = source.resolve_video("never gonna").await.unwrap();
        assert_eq!(video.id, "dQw4w9WgXcQ");
        assert_eq!(source.list_formats(&video).await.unwrap().len(), 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extractor_failure_is_a_resolution_error() {
        let config = YtDlpConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "echo 'ERROR: Video unavailable' >&2; exit 1".into()],
        };
        let err = YtDlpSource::new(config).resolve_video("dQw4w9WgXcQ").await.err().unwrap();
        match err {
            Error::Resolution(msg) => assert!(msg.contains("Video unavailable")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
