//! 外部编码器 - ffmpeg 读取 stdin 原始帧, 输出 HLS 分片 + 播放列表

use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};

use tracing::{info, warn};

use crate::archive::SegmentDir;
use crate::config::EncoderSettings;
use crate::detection::CameraSession;
use crate::error::{PipelineError, Result};

/// 编码器输入通道
pub trait FrameEncoder: Send {
    /// Push one frame's raw pixels, in arrival order.
    fn write_frame(&mut self, pixels: &[u8]) -> Result<()>;

    /// Close the input and wait for the encoder to exit.
    fn finish(&mut self) -> Result<()>;
}

/// Starts one encoder per segment directory.
pub trait EncoderFactory: Send {
    fn launch(&mut self, dir: &SegmentDir, session: &CameraSession) -> Result<Box<dyn FrameEncoder>>;
}

/// ffmpeg 编码参数
#[derive(Clone, Debug)]
pub struct FfmpegEncoderFactory {
    settings: EncoderSettings,
    fps: f64,
    segment_secs: f64,
}

impl FfmpegEncoderFactory {
    pub fn new(settings: EncoderSettings, fps: f64, segment_secs: f64) -> Self {
        Self {
            settings,
            fps,
            segment_secs,
        }
    }

    /// rawvideo stdin → libx264 → HLS, keeping every chunk.
    pub fn hls_args(&self, dir: &SegmentDir, session: &CameraSession) -> Vec<String> {
        let s = &self.settings;
        let fps = self.fps.round().max(1.0) as u32;
        let gop = (self.fps * self.segment_secs).round().max(1.0) as u32;
        let hls_time = format_secs(self.segment_secs);

        vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pixel_format".into(),
            s.pixel_format.clone(),
            "-video_size".into(),
            session.resolution.video_size(),
            "-framerate".into(),
            fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-filter:v".into(),
            format!("scale=-2:{}", s.output_height),
            "-c:v".into(),
            s.codec.clone(),
            "-preset".into(),
            s.preset.clone(),
            "-b:v".into(),
            s.bitrate.clone(),
            "-g".into(),
            gop.to_string(),
            "-sc_threshold".into(),
            "0".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            hls_time,
            "-hls_list_size".into(),
            "0".into(),
            "-hls_flags".into(),
            "append_list+independent_segments".into(),
            "-hls_segment_filename".into(),
            dir.segment_pattern().to_string_lossy().into_owned(),
            dir.playlist_path().to_string_lossy().into_owned(),
        ]
    }
}

fn format_secs(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{secs}")
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn launch(&mut self, dir: &SegmentDir, session: &CameraSession) -> Result<Box<dyn FrameEncoder>> {
        let args = self.hls_args(dir, session);
        let mut child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PipelineError::Spawn {
                what: self.settings.binary.clone(),
                source: e,
            })?;
        let stdin = child.stdin.take().ok_or_else(|| PipelineError::EncoderChannel {
            camera_id: session.camera_id.clone(),
            source: std::io::Error::other("encoder stdin not captured"),
        })?;

        info!(camera = %session.camera_id, dir = %dir.path().display(), "🎬 encoder started");
        Ok(Box::new(FfmpegEncoder {
            camera_id: session.camera_id.clone(),
            child: Some(child),
            stdin: Some(stdin),
        }))
    }
}

pub struct FfmpegEncoder {
    camera_id: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl FrameEncoder for FfmpegEncoder {
    fn write_frame(&mut self, pixels: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| PipelineError::EncoderChannel {
            camera_id: self.camera_id.clone(),
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        })?;
        stdin
            .write_all(pixels)
            .map_err(|e| PipelineError::EncoderChannel {
                camera_id: self.camera_id.clone(),
                source: e,
            })
    }

    fn finish(&mut self) -> Result<()> {
        // 关闭 stdin, ffmpeg 收到 EOF 后写完最后一个分片
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let status = child.wait().map_err(|e| PipelineError::EncoderChannel {
                camera_id: self.camera_id.clone(),
                source: e,
            })?;
            if !status.success() {
                warn!(camera = %self.camera_id, %status, "encoder exited with failure");
            }
        }
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.finish() {
                warn!(camera = %self.camera_id, "failed to finish encoder: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Resolution;
    use chrono::NaiveDate;
    use std::path::Path;

    #[test]
    fn test_hls_args() {
        let factory = FfmpegEncoderFactory::new(EncoderSettings::default(), 30.0, 2.0);
        let dir = SegmentDir::new(
            Path::new("media"),
            NaiveDate::from_ymd_opt(2025, 6, 4).unwrap(),
            "cam0",
        );
        let session = CameraSession::new("cam0", Resolution::new(1920, 1080), 0.0);
        let args = factory.hls_args(&dir, &session).join(" ");

        assert!(args.contains("-f rawvideo -pixel_format bgr24 -video_size 1920x1080 -framerate 30 -i pipe:0"));
        assert!(args.contains("-filter:v scale=-2:720"));
        assert!(args.contains("-c:v libx264 -preset veryfast -b:v 2000k -g 60 -sc_threshold 0"));
        assert!(args.contains("-hls_time 2 -hls_list_size 0"));
        assert!(args.contains("append_list+independent_segments"));
        assert!(args.ends_with("media/2025-06-04/cam0/segment_%05d.ts media/2025-06-04/cam0/index.m3u8"));
    }

    #[test]
    fn test_fractional_segment_time() {
        assert_eq!(format_secs(6.0), "6");
        assert_eq!(format_secs(1.5), "1.5");
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let settings = EncoderSettings {
            binary: "/nonexistent/ffmpeg-for-tests".into(),
            ..Default::default()
        };
        let mut factory = FfmpegEncoderFactory::new(settings, 30.0, 2.0);
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = SegmentDir::new(tmp.path(), NaiveDate::from_ymd_opt(2025, 6, 4).unwrap(), "cam0");
        let session = CameraSession::new("cam0", Resolution::new(4, 4), 0.0);
        assert!(matches!(
            factory.launch(&dir, &session),
            Err(PipelineError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_encoder_breaks_the_channel() {
        // `true` 立即退出, 之后写入只会得到 broken pipe
        let settings = EncoderSettings {
            binary: "true".into(),
            ..Default::default()
        };
        let mut factory = FfmpegEncoderFactory::new(settings, 30.0, 2.0);
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = SegmentDir::new(tmp.path(), NaiveDate::from_ymd_opt(2025, 6, 4).unwrap(), "cam0");
        let session = CameraSession::new("cam0", Resolution::new(4, 4), 0.0);
        let mut encoder = factory.launch(&dir, &session).unwrap();

        // 大于管道缓冲区, 写入一定会碰到已关闭的读端
        let frame = vec![0u8; 8 << 20];
        let written = encoder.write_frame(&frame);
        assert!(
            matches!(written, Err(PipelineError::EncoderChannel { ref camera_id, .. }) if camera_id == "cam0"),
            "{written:?}"
        );
        encoder.finish().unwrap();
    }
}
