/// 录制流水线数据结构定义
/// Data structures shared by the capture, inference and segment stages
use serde::{Deserialize, Serialize};

// ========== 公共常量 ==========

/// 原始帧像素格式 BGR24, 每像素3字节
pub const FRAME_CHANNELS: usize = 3;

// ========== 数据结构 ==========

/// 分辨率 (width, height)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte length of one BGR24 frame at this resolution.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * FRAME_CHANNELS
    }

    /// ffmpeg `-video_size` notation, `WxH`.
    pub fn video_size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 摄像头会话: 启动时探测一次, 之后三个阶段只读共享
#[derive(Clone, Debug, PartialEq)]
pub struct CameraSession {
    pub camera_id: String,
    pub resolution: Resolution,
    pub start_ts: f64,
}

impl CameraSession {
    pub fn new(camera_id: impl Into<String>, resolution: Resolution, start_ts: f64) -> Self {
        Self {
            camera_id: camera_id.into(),
            resolution,
            start_ts,
        }
    }
}

/// 原始帧 (采集线程 → 推理线程)
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>, // BGR24, width*height*3
    pub width: u32,
    pub height: u32,
    pub capture_ts: f64, // 读取时刻的UNIX时间(秒)
}

impl Frame {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// 检测框 (原图像素坐标)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub xmin: i32,
    pub ymin: i32,
    pub xmax: i32,
    pub ymax: i32,
}

/// 单帧元数据, 每个到达录制阶段的帧都有一条 (包括跳帧产生的空检测)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub capture_ts: f64,
    pub detections: Vec<Detection>,
}

impl FrameMetadata {
    pub fn empty(capture_ts: f64) -> Self {
        Self {
            capture_ts,
            detections: Vec::new(),
        }
    }
}

/// 带标注的帧 (推理线程 → 录制线程)
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub metadata: FrameMetadata,
}
