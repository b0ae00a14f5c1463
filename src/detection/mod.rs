/// 检测系统 (Detection System)
///
/// - Types:    帧与检测结果数据结构
/// - Detector: 可替换的检测能力 (桩检测器 / ONNX模型)
pub mod detector;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod types;

pub use detector::{rescale, rescale_all, Detector, ScaleFactors, StubDetector};
#[cfg(feature = "onnx")]
pub use onnx::OnnxDetector;
pub use types::{AnnotatedFrame, CameraSession, Detection, Frame, FrameMetadata, Resolution};
