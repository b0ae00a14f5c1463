/// 分段录制阶段 (Segment/Encode)
/// 职责: 读 AnnotatedFrame → 像素写入编码器 → 按采集时间切分段 → 写元数据 + 索引
///
/// 编码器通道写失败是致命的: 阶段持久化索引后退出, 不再关闭任何分段.
/// 持久化失败不是致命的: 目录打不开时上报 Degraded, 下一个窗口开始时重试.
/// 上游断开时把未满的窗口作为最后一个分段写出.
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use super::encoder::{EncoderFactory, FrameEncoder};
use super::segmenter::{ClosedWindow, SegmentWindow};
use super::{poll_recv, Poll};
use crate::archive::{date_of, write_segment_metadata, IndexCadence, MetadataIndex, SegmentDir};
use crate::config::RecorderConfig;
use crate::detection::{AnnotatedFrame, CameraSession};
use crate::error::{PipelineError, Result};
use crate::health::{HealthReporter, StageStatus};

#[derive(Clone, Debug)]
pub struct RecorderSettings {
    pub output_root: PathBuf,
    pub segment_secs: f64,
    pub cadence: IndexCadence,
    pub persist_attempts: u32,
    pub poll_interval: Duration,
}

impl RecorderSettings {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            output_root: config.output_root.clone(),
            segment_secs: config.segment_duration_secs,
            cadence: config.index_cadence,
            persist_attempts: config.persist_attempts,
            poll_interval: config.poll_interval(),
        }
    }
}

/// 当前日期目录及其索引
struct DayArchive {
    dir: SegmentDir,
    index: MetadataIndex,
}

pub struct SegmentRecorder<F: EncoderFactory> {
    session: CameraSession,
    rx: Receiver<AnnotatedFrame>,
    factory: F,
    settings: RecorderSettings,
    health: HealthReporter,
    window: SegmentWindow,
    day: Option<DayArchive>,
    encoder: Option<Box<dyn FrameEncoder>>,
}

impl<F: EncoderFactory> SegmentRecorder<F> {
    pub fn new(
        session: CameraSession,
        rx: Receiver<AnnotatedFrame>,
        factory: F,
        settings: RecorderSettings,
        health: HealthReporter,
    ) -> Self {
        let window = SegmentWindow::new(settings.segment_secs);
        Self {
            session,
            rx,
            factory,
            settings,
            health,
            window,
            day: None,
            encoder: None,
        }
    }

    /// Runs until the inbound queue closes (`Ok`) or the encoder channel breaks (`Err`).
    pub fn run(mut self) -> Result<()> {
        let camera = self.session.camera_id.clone();
        info!(camera = %camera, segment_secs = self.settings.segment_secs, "💾 segment stage started");
        self.health.report(StageStatus::Running);

        let outcome = loop {
            match poll_recv(&self.rx, self.settings.poll_interval) {
                Poll::Item(frame) => {
                    if let Err(e) = self.handle(frame) {
                        break Err(e);
                    }
                }
                Poll::Idle => continue,
                Poll::Closed => break Ok(()),
            }
        };

        match outcome {
            Ok(()) => {
                if let Some(closed) = self.window.flush() {
                    self.close_segment(closed);
                }
                self.sync_index();
                self.finish_encoder();
                info!(camera = %camera, "segment stage stopped");
                self.health.report(StageStatus::Stopped);
                Ok(())
            }
            Err(e) => {
                error!(camera = %camera, "❌ segment stage terminated: {e}");
                self.sync_index();
                self.finish_encoder();
                self.health.report(StageStatus::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn handle(&mut self, frame: AnnotatedFrame) -> Result<()> {
        let ts = frame.metadata.capture_ts;

        // 新窗口开始时检查日期, 跨天或上次打开失败则(重新)打开目录
        if self.window.is_empty() || self.window.closes_at(ts) {
            let date = date_of(ts);
            if self.day.as_ref().map(|d| d.dir.date()) != Some(date) {
                self.enter_day(date);
            }
        }

        // 没有目录时编码器无处落盘, 只保留元数据
        if self.encoder.is_some() || self.day.is_some() {
            self.encoder()?.write_frame(&frame.frame.data)?;
        }

        if let Some(closed) = self.window.push(frame.metadata) {
            self.close_segment(closed);
        }
        Ok(())
    }

    fn enter_day(&mut self, date: NaiveDate) {
        if self.day.is_none() {
            // 上一次打开失败期间累积的帧无处保存
            if let Some(lost) = self.window.flush() {
                warn!(camera = %self.session.camera_id, frames = lost.frames.len(), "discarding frames recorded without a directory");
            }
        }
        let dir = SegmentDir::new(&self.settings.output_root, date, &self.session.camera_id);
        if let Err(e) = self.open_day(dir) {
            warn!(camera = %self.session.camera_id, "segment directory unavailable, retrying next window: {e}");
            self.health.report(StageStatus::Degraded {
                reason: e.to_string(),
            });
        }
    }

    /// Finish the current day (window, index, encoder) and continue in `dir`.
    /// On error no day is open.
    fn open_day(&mut self, dir: SegmentDir) -> Result<()> {
        if self.day.is_some() {
            if let Some(closed) = self.window.flush() {
                self.close_segment(closed);
            }
            self.sync_index();
            self.finish_encoder();
            info!(camera = %self.session.camera_id, dir = %dir.path().display(), "📅 date rollover");
            self.day = None;
        }

        dir.create()?;
        let index = MetadataIndex::resume(&dir, self.settings.cadence)?;
        if index.next_index() > 0 {
            info!(
                camera = %self.session.camera_id,
                next = index.next_index(),
                "resuming existing segment directory"
            );
        }
        self.day = Some(DayArchive { dir, index });
        Ok(())
    }

    /// 首次使用时启动编码器
    fn encoder(&mut self) -> Result<&mut Box<dyn FrameEncoder>> {
        let encoder = match self.encoder.take() {
            Some(encoder) => encoder,
            None => {
                let Some(day) = self.day.as_ref() else {
                    return Err(PipelineError::Config("no segment directory open".to_string()));
                };
                self.factory.launch(&day.dir, &self.session)?
            }
        };
        Ok(self.encoder.insert(encoder))
    }

    fn close_segment(&mut self, closed: ClosedWindow) {
        let Some(day) = self.day.as_mut() else {
            warn!(camera = %self.session.camera_id, frames = closed.frames.len(), "segment dropped: no directory open");
            self.health.report(StageStatus::Degraded {
                reason: "segment dropped: no directory open".to_string(),
            });
            return;
        };
        let index = day.index.next_index();
        match write_segment_metadata(&day.dir, index, &closed.frames, self.settings.persist_attempts) {
            Ok(entry) => {
                if let Err(e) = day.index.record(entry) {
                    warn!(camera = %self.session.camera_id, "metadata index write failed, will retry: {e}");
                }
                debug!(
                    camera = %self.session.camera_id,
                    segment = index,
                    start_ts = closed.start_ts,
                    frames = closed.frames.len(),
                    "segment closed"
                );
                self.health.report(StageStatus::SegmentClosed { index });
            }
            Err(e) => {
                error!(camera = %self.session.camera_id, segment = index, "segment dropped: {e}");
                self.health.report(StageStatus::Degraded {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn sync_index(&mut self) {
        if let Some(day) = self.day.as_mut() {
            if day.index.is_dirty() {
                if let Err(e) = day.index.sync() {
                    error!(camera = %self.session.camera_id, "failed to persist metadata index: {e}");
                }
            }
        }
    }

    fn finish_encoder(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            if let Err(e) = encoder.finish() {
                warn!(camera = %self.session.camera_id, "encoder did not shut down cleanly: {e}");
            }
        }
    }
}
