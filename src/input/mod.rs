/// 视频输入系统 (Video Input System)
///
/// - CameraSource: 帧源能力 (ffmpeg 驱动的摄像头/流)
/// - CaptureStage: 采集线程, 断线自动重连
pub mod camera;
pub mod capture;

pub use camera::{format_camera_input, parse_device_index, CameraSource, FfmpegCamera};
pub use capture::CaptureStage;
