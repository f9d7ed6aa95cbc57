//! FFprobe video information.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::command::check_ffprobe;
use crate::error::{MediaError, MediaResult};

/// Video file information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    /// Duration in seconds
    pub duration: f64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Video codec
    pub codec: String,
}

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Probe a video file (or URL FFprobe can read) for information.
pub async fn probe_video(source: &str) -> MediaResult<VideoInfo> {
    if !is_remote(source) && !Path::new(source).exists() {
        return Err(MediaError::FileNotFound(source.into()));
    }

    check_ffprobe()?;

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(source)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(MediaError::FfprobeFailed {
            message: "FFprobe failed".to_string(),
            stderr: Some(String::from_utf8_lossy(&output.stderr).to_string()),
        });
    }

    parse_probe_output(&output.stdout)
}

/// Get video duration in seconds.
pub async fn get_duration(source: &str) -> MediaResult<f64> {
    let info = probe_video(source).await?;
    Ok(info.duration)
}

fn parse_probe_output(stdout: &[u8]) -> MediaResult<VideoInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;

    let video_stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| MediaError::InvalidVideo("No video stream found".to_string()))?;

    let duration = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| MediaError::InvalidVideo("Missing or zero duration".to_string()))?;

    Ok(VideoInfo {
        duration,
        width: video_stream.width.unwrap_or(0),
        height: video_stream.height.unwrap_or(0),
        codec: video_stream.codec_name.clone().unwrap_or_default(),
    })
}

fn is_remote(source: &str) -> bool {
    source.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{
            "format": {"duration": "310.040000"},
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080}
            ]
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert!((info.duration - 310.04).abs() < 1e-6);
        assert_eq!(info.codec, "h264");
        assert_eq!(info.width, 1920);
    }

    #[test]
    fn test_parse_probe_output_rejects_audio_only() {
        let json = br#"{"format": {"duration": "12.0"}, "streams": [{"codec_type": "audio"}]}"#;
        assert!(matches!(parse_probe_output(json), Err(MediaError::InvalidVideo(_))));
    }

    #[test]
    fn test_parse_probe_output_rejects_missing_duration() {
        let json = br#"{"format": {}, "streams": [{"codec_type": "video"}]}"#;
        assert!(matches!(parse_probe_output(json), Err(MediaError::InvalidVideo(_))));
    }

    #[tokio::test]
    async fn test_probe_missing_file() {
        let result = probe_video("/definitely/not/here.mp4").await;
        assert!(matches!(result, Err(MediaError::FileNotFound(_))));
    }
}
