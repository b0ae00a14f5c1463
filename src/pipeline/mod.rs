/// 录制流水线 (Recording Pipeline)
///
/// 每个摄像头三个线程, 通过有界队列连接:
/// - Capture:   采集 (input::capture)
/// - Inference: 检测 + 坐标还原 (inference)
/// - Segment:   按采集时间分段, 编码 + 元数据落盘 (recorder)
///
/// Supervisor 负责探测分辨率、建队列、起线程.
pub mod encoder;
pub mod inference;
pub mod recorder;
pub mod segmenter;
pub mod supervisor;

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

pub use encoder::{EncoderFactory, FfmpegEncoder, FfmpegEncoderFactory, FrameEncoder};
pub use inference::{FrameSkip, InferenceStage};
pub use recorder::{RecorderSettings, SegmentRecorder};
pub use segmenter::{ClosedWindow, SegmentWindow};
pub use supervisor::Supervisor;

/// 队列轮询结果
#[derive(Debug)]
pub enum Poll<T> {
    Item(T),
    /// Nothing arrived within the poll interval.
    Idle,
    /// The producer is gone and the queue is drained.
    Closed,
}

/// Wait up to `interval` for the next item.
pub fn poll_recv<T>(rx: &Receiver<T>, interval: Duration) -> Poll<T> {
    match rx.recv_timeout(interval) {
        Ok(item) => Poll::Item(item),
        Err(RecvTimeoutError::Timeout) => Poll::Idle,
        Err(RecvTimeoutError::Disconnected) => Poll::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_poll_recv_states() {
        let (tx, rx) = bounded(1);
        assert!(matches!(poll_recv(&rx, Duration::from_millis(5)), Poll::Idle));
        tx.send(4).unwrap();
        drop(tx);
        assert!(matches!(poll_recv(&rx, Duration::from_millis(5)), Poll::Item(4)));
        assert!(matches!(poll_recv(&rx, Duration::from_millis(5)), Poll::Closed));
    }
}
