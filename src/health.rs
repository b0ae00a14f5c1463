//! 阶段健康状态通道
//! Per-stage health/status reporting
//!
//! Every stage owns a [`HealthReporter`] and pushes [`StageEvent`]s into one
//! bounded channel per supervisor. Reporting never blocks a stage: events are
//! dropped while the channel is full or once the receiving side is gone, so a
//! caller that never drains it (no `pump_health`) loses events instead of
//! growing memory.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

/// 健康事件队列容量
pub const HEALTH_QUEUE_CAPACITY: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Capture,
    Inference,
    Segment,
}

impl StageKind {
    pub fn label(self) -> &'static str {
        match self {
            StageKind::Capture => "capture",
            StageKind::Inference => "inference",
            StageKind::Segment => "segment",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StageStatus {
    Running,
    /// 打开摄像头失败, 等待重试
    Retrying { attempt: u32, reason: String },
    /// 读帧失败, 关闭后重新打开
    Reconnecting { reason: String },
    SegmentClosed { index: u64 },
    /// Non-fatal failure, the stage keeps running.
    Degraded { reason: String },
    /// Upstream hung up; the stage exited cleanly.
    Stopped,
    Failed { reason: String },
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Stopped | StageStatus::Failed { .. })
    }
}

#[derive(Clone, Debug)]
pub struct StageEvent {
    pub camera_id: Arc<str>,
    pub stage: StageKind,
    pub status: StageStatus,
}

/// Sending half handed to one stage.
#[derive(Clone, Debug)]
pub struct HealthReporter {
    camera_id: Arc<str>,
    stage: StageKind,
    tx: Option<Sender<StageEvent>>,
}

impl HealthReporter {
    pub fn new(camera_id: &str, stage: StageKind, tx: Sender<StageEvent>) -> Self {
        Self {
            camera_id: Arc::from(camera_id),
            stage,
            tx: Some(tx),
        }
    }

    /// A reporter that drops every event.
    pub fn disabled(camera_id: &str, stage: StageKind) -> Self {
        Self {
            camera_id: Arc::from(camera_id),
            stage,
            tx: None,
        }
    }

    pub fn for_stage(&self, stage: StageKind) -> Self {
        Self {
            camera_id: self.camera_id.clone(),
            stage,
            tx: self.tx.clone(),
        }
    }

    pub fn report(&self, status: StageStatus) {
        if let Some(tx) = &self.tx {
            // 队列满或接收端已关闭时丢弃
            let _ = tx.try_send(StageEvent {
                camera_id: self.camera_id.clone(),
                stage: self.stage,
                status,
            });
        }
    }
}

pub fn health_channel() -> (Sender<StageEvent>, Receiver<StageEvent>) {
    health_channel_with_capacity(HEALTH_QUEUE_CAPACITY)
}

pub fn health_channel_with_capacity(capacity: usize) -> (Sender<StageEvent>, Receiver<StageEvent>) {
    bounded(capacity.max(1))
}

/// Latest status per (camera, stage).
#[derive(Debug, Default)]
pub struct HealthBoard {
    latest: HashMap<(String, StageKind), StageStatus>,
}

impl HealthBoard {
    pub fn apply(&mut self, event: &StageEvent) {
        self.latest
            .insert((event.camera_id.to_string(), event.stage), event.status.clone());
    }

    pub fn status(&self, camera_id: &str, stage: StageKind) -> Option<&StageStatus> {
        self.latest.get(&(camera_id.to_string(), stage))
    }

    /// Cameras with at least one stage in a terminal state.
    pub fn stalled_cameras(&self) -> Vec<String> {
        let mut cameras: Vec<String> = self
            .latest
            .iter()
            .filter(|(_, status)| status.is_terminal())
            .map(|((camera, _), _)| camera.clone())
            .collect();
        cameras.sort();
        cameras.dedup();
        cameras
    }

    pub fn snapshot(&self) -> HashMap<(String, StageKind), StageStatus> {
        self.latest.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_tags_events() {
        let (tx, rx) = health_channel();
        let capture = HealthReporter::new("cam0", StageKind::Capture, tx);
        let segment = capture.for_stage(StageKind::Segment);

        capture.report(StageStatus::Running);
        segment.report(StageStatus::SegmentClosed { index: 3 });

        let first = rx.try_recv().unwrap();
        assert_eq!(&*first.camera_id, "cam0");
        assert_eq!(first.stage, StageKind::Capture);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.stage, StageKind::Segment);
        assert_eq!(second.status, StageStatus::SegmentClosed { index: 3 });
    }

    #[test]
    fn test_report_after_receiver_dropped_is_silent() {
        let (tx, rx) = health_channel();
        drop(rx);
        HealthReporter::new("cam0", StageKind::Inference, tx).report(StageStatus::Stopped);
        HealthReporter::disabled("cam0", StageKind::Inference).report(StageStatus::Running);
    }

    #[test]
    fn test_undrained_channel_drops_instead_of_growing() {
        let (tx, rx) = health_channel_with_capacity(4);
        let reporter = HealthReporter::new("cam0", StageKind::Segment, tx);
        for index in 0..100 {
            reporter.report(StageStatus::SegmentClosed { index });
        }

        let kept: Vec<StageStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[0], StageStatus::SegmentClosed { index: 0 });

        // 排空后继续可用
        reporter.report(StageStatus::Stopped);
        assert_eq!(rx.try_recv().unwrap().status, StageStatus::Stopped);
    }

    #[test]
    fn test_board_tracks_latest_and_stalls() {
        let (tx, rx) = health_channel();
        let seg = HealthReporter::new("cam1", StageKind::Segment, tx.clone());
        let cap = HealthReporter::new("cam0", StageKind::Capture, tx);
        seg.report(StageStatus::Running);
        cap.report(StageStatus::Running);
        seg.report(StageStatus::Failed {
            reason: "broken pipe".into(),
        });

        let mut board = HealthBoard::default();
        for event in rx.try_iter() {
            board.apply(&event);
        }
        assert_eq!(
            board.status("cam0", StageKind::Capture),
            Some(&StageStatus::Running)
        );
        assert!(board
            .status("cam1", StageKind::Segment)
            .is_some_and(StageStatus::is_terminal));
        assert_eq!(board.stalled_cameras(), vec!["cam1".to_string()]);
    }
}
