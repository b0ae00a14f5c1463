pub mod archive; // 录像归档目录与索引
pub mod config; // 录制配置参数
pub mod detection; // 检测能力与数据结构
pub mod error;
pub mod health; // 阶段健康状态
pub mod input; // 视频输入系统
pub mod pipeline; // 采集 → 推理 → 分段录制

pub use crate::config::{Args, RecorderConfig};
pub use crate::error::{PipelineError, Result};
pub use crate::pipeline::Supervisor;

/// 当前UNIX时间(秒), 用作帧的采集时间戳
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
