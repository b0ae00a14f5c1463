/// 推理阶段 (Inference)
/// 职责: 读原始帧 → 检测 (可跳帧) → 坐标还原 → 发送 AnnotatedFrame
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use super::{poll_recv, Poll};
use crate::detection::{
    rescale_all, AnnotatedFrame, CameraSession, Detector, Frame, FrameMetadata, ScaleFactors,
};
use crate::health::{HealthReporter, StageStatus};

/// 跳帧策略: 每 K 帧检测一次
#[derive(Clone, Debug)]
pub struct FrameSkip {
    every: u32,
    counter: u64,
}

impl FrameSkip {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            counter: 0,
        }
    }

    /// Advance by one frame; true when this frame goes through the detector.
    pub fn tick(&mut self) -> bool {
        let run = self.counter % self.every as u64 == 0;
        self.counter += 1;
        run
    }
}

pub struct InferenceStage<D: Detector> {
    session: CameraSession,
    detector: D,
    rx: Receiver<Frame>,
    tx: Sender<AnnotatedFrame>,
    skip: FrameSkip,
    health: HealthReporter,
    poll_interval: Duration,

    // 统计
    count: u64,
    last: Instant,
}

impl<D: Detector> InferenceStage<D> {
    pub fn new(
        session: CameraSession,
        detector: D,
        rx: Receiver<Frame>,
        tx: Sender<AnnotatedFrame>,
        frame_skip: u32,
        health: HealthReporter,
        poll_interval: Duration,
    ) -> Self {
        Self {
            session,
            detector,
            rx,
            tx,
            skip: FrameSkip::new(frame_skip),
            health,
            poll_interval,
            count: 0,
            last: Instant::now(),
        }
    }

    /// 单帧处理, 永不丢帧: 检测失败时该帧带空检测列表
    pub fn annotate(&mut self, frame: Frame) -> AnnotatedFrame {
        let mut metadata = FrameMetadata::empty(frame.capture_ts);
        if self.skip.tick() {
            match self.detector.detect(&frame) {
                Ok(detections) => {
                    let scale = ScaleFactors::between(frame.resolution(), self.detector.input_size());
                    metadata.detections = rescale_all(&detections, scale);
                }
                Err(e) => {
                    warn!(camera = %self.session.camera_id, detector = self.detector.name(), "detection failed: {e}");
                    self.health.report(StageStatus::Degraded {
                        reason: e.to_string(),
                    });
                }
            }
        }
        AnnotatedFrame { frame, metadata }
    }

    pub fn run(mut self) {
        let camera = self.session.camera_id.clone();
        info!(camera = %camera, detector = self.detector.name(), "🔍 inference stage started");
        self.health.report(StageStatus::Running);

        loop {
            let frame = match poll_recv(&self.rx, self.poll_interval) {
                Poll::Item(frame) => frame,
                Poll::Idle => continue,
                Poll::Closed => break,
            };

            let annotated = self.annotate(frame);
            if self.tx.send(annotated).is_err() {
                break;
            }

            self.count += 1;
            let elapsed = self.last.elapsed();
            if elapsed >= Duration::from_secs(5) {
                let fps = self.count as f64 / elapsed.as_secs_f64();
                debug!(camera = %camera, fps = (fps * 10.0).round() / 10.0, "inference throughput");
                self.count = 0;
                self.last = Instant::now();
            }
        }

        info!(camera = %camera, "inference stage stopped");
        self.health.report(StageStatus::Stopped);
    }
}
