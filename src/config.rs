//! 录制配置 - 命令行参数 + JSON文件

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

pub use crate::archive::IndexCadence;
use crate::detection::Resolution;

/// 摄像头源
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSpec {
    pub id: String,
    /// 设备索引 (`0`), 设备路径或流地址
    pub source: String,
}

impl CameraSpec {
    /// `N` → `camN`; anything else is named after its position.
    pub fn from_source(position: usize, source: &str) -> Self {
        let id = match source.trim().parse::<usize>() {
            Ok(index) => format!("cam{index}"),
            Err(_) => format!("cam{position}"),
        };
        Self {
            id,
            source: source.trim().to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    #[default]
    Stub,
    Onnx,
}

/// 检测器参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub model: String,
    pub input_width: u32,
    pub input_height: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub seed: Option<u64>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Stub,
            model: "models/yolov8n.onnx".to_string(),
            input_width: 640,
            input_height: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            seed: None,
        }
    }
}

impl DetectorSettings {
    pub fn input_size(&self) -> Resolution {
        Resolution::new(self.input_width, self.input_height)
    }
}

/// 编码器参数 (ffmpeg HLS)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub binary: String,
    pub codec: String,
    pub preset: String,
    pub bitrate: String,
    pub output_height: u32,
    pub pixel_format: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            bitrate: "2000k".to_string(),
            output_height: 720,
            pixel_format: "bgr24".to_string(),
        }
    }
}

/// 录制流水线配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub cameras: Vec<CameraSpec>,
    pub target_fps: f64,
    pub segment_duration_secs: f64,
    pub frame_queue_capacity: usize,
    pub annotated_queue_capacity: usize,
    /// 每N帧检测一次, 1 = 每帧
    pub frame_skip: u32,
    pub index_cadence: IndexCadence,
    pub retry_interval_secs: f64,
    pub output_root: PathBuf,
    pub poll_interval_ms: u64,
    pub persist_attempts: u32,
    pub probe_attempts: u32,
    pub fallback_resolution: Resolution,
    pub ffprobe_binary: String,
    pub encoder: EncoderSettings,
    pub detector: DetectorSettings,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            cameras: vec![CameraSpec::from_source(0, "0")],
            target_fps: 30.0,
            segment_duration_secs: 2.0,
            frame_queue_capacity: 50,
            annotated_queue_capacity: 50,
            frame_skip: 1,
            index_cadence: IndexCadence::EverySegment,
            retry_interval_secs: 3.0,
            output_root: PathBuf::from("media"),
            poll_interval_ms: 100,
            persist_attempts: 3,
            probe_attempts: 3,
            fallback_resolution: Resolution::new(1280, 720),
            ffprobe_binary: "ffprobe".to_string(),
            encoder: EncoderSettings::default(),
            detector: DetectorSettings::default(),
        }
    }
}

impl RecorderConfig {
    /// 从JSON文件加载配置
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cameras.is_empty() {
            bail!("no cameras configured");
        }
        if !(self.target_fps > 0.0) {
            bail!("target_fps must be positive, got {}", self.target_fps);
        }
        if !(self.segment_duration_secs > 0.0) {
            bail!(
                "segment_duration_secs must be positive, got {}",
                self.segment_duration_secs
            );
        }
        if self.frame_queue_capacity == 0 || self.annotated_queue_capacity == 0 {
            bail!("queue capacities must be at least 1");
        }
        if self.frame_skip == 0 {
            bail!("frame_skip must be at least 1");
        }
        if let IndexCadence::Every(0) = self.index_cadence {
            bail!("index cadence must be at least 1 segment");
        }
        if self.retry_interval_secs < 0.0 {
            bail!("retry_interval_secs must not be negative");
        }
        let mut ids: Vec<&str> = self.cameras.iter().map(|c| c.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.cameras.len() {
            bail!("camera ids must be unique");
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.retry_interval_secs.max(0.0))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn print_summary(&self) {
        tracing::info!(
            cameras = self.cameras.len(),
            fps = self.target_fps,
            segment_secs = self.segment_duration_secs,
            frame_skip = self.frame_skip,
            index_cadence = ?self.index_cadence,
            output = %self.output_root.display(),
            detector = ?self.detector.kind,
            "🎛️ recorder configuration"
        );
    }
}

/// 多摄像头录制守护进程
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Sentinel - 多摄像头检测录制", long_about = None)]
pub struct Args {
    /// JSON配置文件
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 摄像头: 设备索引或流地址, 例如 --cameras 0 1 rtsp://host/stream
    #[arg(long, num_args = 1..)]
    pub cameras: Vec<String>,

    /// 目标采集帧率
    #[arg(long)]
    pub fps: Option<f64>,

    /// 分段时长(秒)
    #[arg(long)]
    pub segment_duration: Option<f64>,

    /// 每N帧检测一次
    #[arg(long)]
    pub frame_skip: Option<u32>,

    /// 每K个分段写一次索引 (1 = 每段)
    #[arg(long)]
    pub index_every: Option<u32>,

    /// 输出根目录
    #[arg(short, long)]
    pub output_root: Option<PathBuf>,

    /// 检测器类型
    #[arg(long, value_enum)]
    pub detector: Option<DetectorKind>,

    /// ONNX模型路径
    #[arg(short, long)]
    pub model: Option<String>,

    /// 桩检测器随机种子
    #[arg(long)]
    pub seed: Option<u64>,
}

impl Args {
    /// defaults ← config file ← command line
    pub fn into_config(self) -> anyhow::Result<RecorderConfig> {
        let mut config = match &self.config {
            Some(path) => RecorderConfig::load(path)?,
            None => RecorderConfig::default(),
        };

        if !self.cameras.is_empty() {
            config.cameras = self
                .cameras
                .iter()
                .enumerate()
                .map(|(i, source)| CameraSpec::from_source(i, source))
                .collect();
        }
        if let Some(fps) = self.fps {
            config.target_fps = fps;
        }
        if let Some(secs) = self.segment_duration {
            config.segment_duration_secs = secs;
        }
        if let Some(skip) = self.frame_skip {
            config.frame_skip = skip;
        }
        if let Some(every) = self.index_every {
            config.index_cadence = match every {
                1 => IndexCadence::EverySegment,
                k => IndexCadence::Every(k),
            };
        }
        if let Some(root) = self.output_root {
            config.output_root = root;
        }
        if let Some(kind) = self.detector {
            config.detector.kind = kind;
        }
        if let Some(model) = self.model {
            config.detector.model = model;
        }
        if self.seed.is_some() {
            config.detector.seed = self.seed;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_matches_recorder_defaults() {
        let config = RecorderConfig::default();
        assert_eq!(config.segment_duration_secs, 2.0);
        assert_eq!(config.target_fps, 30.0);
        assert_eq!(config.frame_queue_capacity, 50);
        assert_eq!(config.retry_interval(), Duration::from_secs(3));
        assert_eq!(config.cameras[0].id, "cam0");
        config.validate().unwrap();
    }

    #[test]
    fn test_camera_ids() {
        assert_eq!(CameraSpec::from_source(0, "2").id, "cam2");
        let rtsp = CameraSpec::from_source(1, "rtsp://10.0.0.5/stream");
        assert_eq!(rtsp.id, "cam1");
        assert_eq!(rtsp.source, "rtsp://10.0.0.5/stream");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RecorderConfig = serde_json::from_str(
            r#"{"segment_duration_secs": 6, "index_cadence": {"every": 10},
                "cameras": [{"id": "lobby", "source": "rtsp://lobby"}]}"#,
        )
        .unwrap();
        assert_eq!(config.segment_duration_secs, 6.0);
        assert_eq!(config.index_cadence, IndexCadence::Every(10));
        assert_eq!(config.cameras[0].id, "lobby");
        assert_eq!(config.frame_skip, 1);
        assert_eq!(config.encoder.bitrate, "2000k");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RecorderConfig {
            frame_skip: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.frame_skip = 1;
        config.index_cadence = IndexCadence::Every(0);
        assert!(config.validate().is_err());
        config.index_cadence = IndexCadence::EverySegment;
        config.cameras.push(CameraSpec::from_source(3, "0"));
        assert!(config.validate().is_err(), "duplicate cam0");
        config.cameras.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_args_override_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recorder.json");
        let file = RecorderConfig {
            target_fps: 10.0,
            frame_skip: 4,
            ..Default::default()
        };
        file.save(&path).unwrap();

        let args = Args::parse_from([
            "sentinel",
            "--config",
            path.to_str().unwrap(),
            "--cameras",
            "0",
            "rtsp://yard",
            "--frame-skip",
            "2",
            "--index-every",
            "10",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.target_fps, 10.0);
        assert_eq!(config.frame_skip, 2);
        assert_eq!(config.index_cadence, IndexCadence::Every(10));
        let ids: Vec<&str> = config.cameras.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cam0", "cam1"]);
    }
}
