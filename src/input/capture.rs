//! 采集阶段
//! Capture stage: camera → bounded frame queue
//!
//! Opens the source pinned to the session resolution and pushes timestamped
//! frames downstream, blocking when the queue is full. Open and read failures
//! are retried forever; the stage ends only when the frame queue hangs up.

use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{info, warn};

use super::camera::CameraSource;
use crate::detection::{CameraSession, Frame};
use crate::health::{HealthReporter, StageStatus};

pub struct CaptureStage<S: CameraSource> {
    session: CameraSession,
    source: S,
    tx: Sender<Frame>,
    health: HealthReporter,
    frame_interval: Duration,
    retry_interval: Duration,
    last_ts: f64,
}

impl<S: CameraSource> CaptureStage<S> {
    pub fn new(
        session: CameraSession,
        source: S,
        tx: Sender<Frame>,
        health: HealthReporter,
        frame_interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            session,
            source,
            tx,
            health,
            frame_interval,
            retry_interval,
            last_ts: f64::MIN,
        }
    }

    /// Non-decreasing capture clock.
    fn stamp(&mut self) -> f64 {
        self.last_ts = crate::now_ts().max(self.last_ts);
        self.last_ts
    }

    pub fn run(mut self) {
        let camera = self.session.camera_id.clone();
        let size = self.session.resolution;
        info!(camera = %camera, source = %self.source.source_id(), resolution = %size, "🎥 capture stage started");

        let mut attempt: u32 = 0;
        loop {
            match self.source.open(Some(size)) {
                Ok(actual) => {
                    if actual != size {
                        warn!(camera = %camera, expected = %size, actual = %actual, "source opened at a different size");
                    }
                    attempt = 0;
                    self.health.report(StageStatus::Running);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(camera = %camera, attempt, "⚠️ failed to open source: {e}");
                    self.health.report(StageStatus::Retrying {
                        attempt,
                        reason: e.to_string(),
                    });
                    thread::sleep(self.retry_interval);
                    continue;
                }
            }

            // 读帧直到失败, 失败后关闭重连
            loop {
                let data = match self.source.read() {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(camera = %camera, "🔄 frame read failed, reconnecting: {e}");
                        self.source.close();
                        self.health.report(StageStatus::Reconnecting {
                            reason: e.to_string(),
                        });
                        thread::sleep(self.retry_interval);
                        break;
                    }
                };

                let frame = Frame {
                    data,
                    width: size.width,
                    height: size.height,
                    capture_ts: self.stamp(),
                };
                if self.tx.send(frame).is_err() {
                    self.source.close();
                    info!(camera = %camera, "capture stage stopped: frame queue closed");
                    self.health.report(StageStatus::Stopped);
                    return;
                }
                thread::sleep(self.frame_interval);
            }
        }
    }
}
