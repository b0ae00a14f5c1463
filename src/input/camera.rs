//! 摄像头输入 - ffmpeg 子进程解码为 BGR24 原始帧
//!
//! 设备索引 `N` 映射为平台设备 (Linux: `/dev/videoN` + V4L2), 其他输入
//! (RTSP/文件/设备路径) 原样交给 ffmpeg.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::detection::Resolution;
use crate::error::{PipelineError, Result};

/// 帧源能力: 打开 / 读帧 / 关闭
///
/// `open(Some(size))` pins the output size so that every frame returned by
/// `read` holds exactly `size.frame_len()` bytes. `open(None)` keeps the
/// native size and reports it.
pub trait CameraSource: Send {
    fn source_id(&self) -> &str;

    fn open(&mut self, size: Option<Resolution>) -> Result<Resolution>;

    /// One BGR24 frame.
    fn read(&mut self) -> Result<Vec<u8>>;

    fn close(&mut self);
}

impl<S: CameraSource + ?Sized> CameraSource for Box<S> {
    fn source_id(&self) -> &str {
        (**self).source_id()
    }

    fn open(&mut self, size: Option<Resolution>) -> Result<Resolution> {
        (**self).open(size)
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        (**self).read()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// 设备索引 (`"0"`, `" 2 "`)
pub fn parse_device_index(source: &str) -> Option<usize> {
    source.trim().parse().ok()
}

/// ffmpeg 输入: (可选的 `-f` 格式, 输入地址)
pub fn format_camera_input(source: &str) -> (Option<&'static str>, String) {
    if let Some(index) = parse_device_index(source) {
        #[cfg(target_os = "windows")]
        {
            return (Some("dshow"), format!("video={index}"));
        }
        #[cfg(target_os = "macos")]
        {
            return (Some("avfoundation"), format!("{index}"));
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            return (Some("v4l2"), format!("/dev/video{index}"));
        }
    }
    let source = source.trim();
    if source.starts_with("/dev/video") {
        (Some("v4l2"), source.to_string())
    } else {
        (None, source.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

/// 解析 `ffprobe -show_entries stream=width,height -of json` 输出
pub fn parse_probe_output(source_id: &str, json: &[u8]) -> Result<Resolution> {
    let probe: ProbeOutput = serde_json::from_slice(json).map_err(|e| PipelineError::Probe {
        source_id: source_id.to_string(),
        reason: format!("unreadable ffprobe output: {e}"),
    })?;
    probe
        .streams
        .iter()
        .find_map(|s| match (s.width, s.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(Resolution::new(w, h)),
            _ => None,
        })
        .ok_or_else(|| PipelineError::Probe {
            source_id: source_id.to_string(),
            reason: "no video stream with a size".to_string(),
        })
}

/// ffmpeg 驱动的摄像头
pub struct FfmpegCamera {
    source: String,
    ffmpeg: String,
    ffprobe: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    size: Option<Resolution>,
}

impl FfmpegCamera {
    pub fn new(source: &str) -> Self {
        Self::with_binaries(source, "ffmpeg", "ffprobe")
    }

    pub fn with_binaries(source: &str, ffmpeg: &str, ffprobe: &str) -> Self {
        Self {
            source: source.trim().to_string(),
            ffmpeg: ffmpeg.to_string(),
            ffprobe: ffprobe.to_string(),
            child: None,
            stdout: None,
            size: None,
        }
    }

    pub fn ffprobe_args(&self) -> Vec<String> {
        let (format, input) = format_camera_input(&self.source);
        let mut args: Vec<String> = ["-v", "error", "-select_streams", "v:0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(["-show_entries".into(), "stream=width,height".into()]);
        args.extend(["-of".into(), "json".into()]);
        if let Some(format) = format {
            args.extend(["-f".into(), format.to_string()]);
        }
        args.push(input);
        args
    }

    /// rawvideo BGR24 到 stdout, 指定 `size` 时缩放到该尺寸
    pub fn ffmpeg_args(&self, size: Option<Resolution>) -> Vec<String> {
        let (format, input) = format_camera_input(&self.source);
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        if input.starts_with("rtsp://") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        if let Some(format) = format {
            args.extend(["-f".into(), format.to_string()]);
        }
        args.extend(["-i".into(), input]);
        if let Some(size) = size {
            args.extend(["-vf".into(), format!("scale={}:{}", size.width, size.height)]);
        }
        args.extend(
            ["-an", "-pix_fmt", "bgr24", "-f", "rawvideo", "-"]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }

    fn probe_native(&self) -> Result<Resolution> {
        let output = Command::new(&self.ffprobe)
            .args(self.ffprobe_args())
            .output()
            .map_err(|e| PipelineError::Spawn {
                what: self.ffprobe.clone(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(PipelineError::SourceUnavailable {
                source_id: self.source.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_probe_output(&self.source, &output.stdout)
    }
}

impl CameraSource for FfmpegCamera {
    fn source_id(&self) -> &str {
        &self.source
    }

    fn open(&mut self, size: Option<Resolution>) -> Result<Resolution> {
        self.close();

        // 固定尺寸时同样先探测: 源不可达必须在打开时报 SourceUnavailable
        let native = self.probe_native().map_err(|e| match e {
            PipelineError::Spawn { .. } | PipelineError::SourceUnavailable { .. } => e,
            other => PipelineError::SourceUnavailable {
                source_id: self.source.clone(),
                reason: other.to_string(),
            },
        })?;
        let resolution = size.unwrap_or(native);

        let mut child = Command::new(&self.ffmpeg)
            .args(self.ffmpeg_args(size))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PipelineError::SourceUnavailable {
                source_id: self.source.clone(),
                reason: format!("failed to spawn {}: {e}", self.ffmpeg),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| PipelineError::SourceUnavailable {
            source_id: self.source.clone(),
            reason: "ffmpeg stdout not captured".to_string(),
        })?;

        info!(source = %self.source, resolution = %resolution, "📷 camera opened");
        self.child = Some(child);
        self.stdout = Some(stdout);
        self.size = Some(resolution);
        Ok(resolution)
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        let (Some(stdout), Some(size)) = (self.stdout.as_mut(), self.size) else {
            return Err(PipelineError::ReadFailure {
                source_id: self.source.clone(),
                reason: "camera not open".to_string(),
            });
        };
        let mut buf = vec![0u8; size.frame_len()];
        stdout
            .read_exact(&mut buf)
            .map_err(|e| PipelineError::ReadFailure {
                source_id: self.source.clone(),
                reason: e.to_string(),
            })?;
        Ok(buf)
    }

    fn close(&mut self) {
        self.stdout = None;
        self.size = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(source = %self.source, "ffmpeg already exited: {e}");
            }
            if let Err(e) = child.wait() {
                warn!(source = %self.source, "failed to reap ffmpeg: {e}");
            }
        }
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.close();
    }
}
