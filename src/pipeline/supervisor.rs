/// 流水线监督器 (Supervisor)
/// 职责: 探测分辨率 → 建队列 → 每个摄像头起 采集/推理/录制 三个线程 → 汇总健康状态
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{error, info, warn};

use super::encoder::{EncoderFactory, FfmpegEncoderFactory};
use super::inference::InferenceStage;
use super::recorder::{RecorderSettings, SegmentRecorder};
use crate::config::{DetectorKind, DetectorSettings, RecorderConfig};
use crate::detection::{CameraSession, Detector, Resolution, StubDetector};
use crate::error::{PipelineError, Result};
use crate::health::{
    health_channel, HealthBoard, HealthReporter, StageEvent, StageKind, StageStatus,
};
use crate::input::{CameraSource, CaptureStage, FfmpegCamera};

static CTRL_HANDLER: Once = Once::new();

/// 按配置创建检测器
pub fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
    match settings.kind {
        DetectorKind::Stub => Ok(match settings.seed {
            Some(seed) => Box::new(StubDetector::seeded(settings.input_size(), seed)),
            None => Box::new(StubDetector::new(settings.input_size())),
        }),
        #[cfg(feature = "onnx")]
        DetectorKind::Onnx => Ok(Box::new(crate::detection::OnnxDetector::new(
            &settings.model,
            settings.input_size(),
            settings.conf_threshold,
            settings.iou_threshold,
        )?)),
        #[cfg(not(feature = "onnx"))]
        DetectorKind::Onnx => Err(PipelineError::Config(
            "ONNX detector requested but the `onnx` feature is disabled".to_string(),
        )),
    }
}

/// 一次性分辨率探测: 打开 → 读一帧 → 关闭; 全部失败时返回 None, 由调用方决定回退分辨率
pub fn probe_resolution<S: CameraSource + ?Sized>(
    source: &mut S,
    attempts: u32,
    retry_interval: Duration,
) -> Option<Resolution> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let probed = match source.open(None) {
            Ok(size) => source.read().map(|_| size),
            Err(e) => Err(e),
        };
        source.close();

        match probed {
            Ok(size) => return Some(size),
            Err(e) => {
                warn!(source = %source.source_id(), attempt, attempts, "resolution probe failed: {e}");
                if attempt < attempts {
                    thread::sleep(retry_interval);
                }
            }
        }
    }
    None
}

struct StageHandle {
    camera_id: String,
    name: String,
    handle: JoinHandle<()>,
}

/// 单个摄像头启动线程的结果
struct CameraSetup {
    session: Option<CameraSession>,
    stages: Vec<StageHandle>,
}

fn spawn_named<T>(camera_id: &str, name: String, body: T) -> Result<StageHandle>
where
    T: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|e| PipelineError::Spawn {
            what: name.clone(),
            source: e,
        })?;
    Ok(StageHandle {
        camera_id: camera_id.to_string(),
        name,
        handle,
    })
}

/// Probe one camera, wire its queues and spawn its three stages.
/// Runs on the camera's own setup thread; spawned stages land in `stages`
/// even when a later spawn fails.
fn start_camera<S, D, F>(
    camera_id: &str,
    mut source: S,
    detector: D,
    factory: F,
    config: &RecorderConfig,
    reporter: &HealthReporter,
    stages: &mut Vec<StageHandle>,
) -> Result<CameraSession>
where
    S: CameraSource + 'static,
    D: Detector + 'static,
    F: EncoderFactory + 'static,
{
    let resolution = match probe_resolution(&mut source, config.probe_attempts, config.retry_interval()) {
        Some(size) => size,
        None => {
            let fallback = config.fallback_resolution;
            warn!(camera = camera_id, fallback = %fallback, "⚠️ probe gave up, using fallback resolution");
            reporter.report(StageStatus::Degraded {
                reason: format!("resolution probe failed, using {fallback}"),
            });
            fallback
        }
    };
    let session = CameraSession::new(camera_id, resolution, crate::now_ts());
    info!(camera = camera_id, resolution = %resolution, "✅ camera session ready");

    let (frame_tx, frame_rx) = bounded(config.frame_queue_capacity);
    let (annotated_tx, annotated_rx) = bounded(config.annotated_queue_capacity);

    let capture = CaptureStage::new(
        session.clone(),
        source,
        frame_tx,
        reporter.clone(),
        config.frame_interval(),
        config.retry_interval(),
    );
    let inference = InferenceStage::new(
        session.clone(),
        detector,
        frame_rx,
        annotated_tx,
        config.frame_skip,
        reporter.for_stage(StageKind::Inference),
        config.poll_interval(),
    );
    let recorder = SegmentRecorder::new(
        session.clone(),
        annotated_rx,
        factory,
        RecorderSettings::from_config(config),
        reporter.for_stage(StageKind::Segment),
    );

    let name = |stage: StageKind| format!("{camera_id}-{}", stage.label());
    stages.push(spawn_named(camera_id, name(StageKind::Capture), move || capture.run())?);
    stages.push(spawn_named(camera_id, name(StageKind::Inference), move || inference.run())?);
    stages.push(spawn_named(camera_id, name(StageKind::Segment), move || {
        // 失败已通过健康通道上报
        let _ = recorder.run();
    })?);

    Ok(session)
}

pub struct Supervisor {
    config: RecorderConfig,
    health_tx: Sender<StageEvent>,
    health_rx: Receiver<StageEvent>,
    setup_tx: Sender<CameraSetup>,
    setup_rx: Receiver<CameraSetup>,
    /// 尚未回报的启动线程数
    pending_setups: usize,
    board: HealthBoard,
    sessions: Vec<CameraSession>,
    stages: Vec<StageHandle>,
}

impl Supervisor {
    pub fn new(config: RecorderConfig) -> Self {
        let (health_tx, health_rx) = health_channel();
        let (setup_tx, setup_rx) = unbounded();
        Self {
            config,
            health_tx,
            health_rx,
            setup_tx,
            setup_rx,
            pending_setups: 0,
            board: HealthBoard::default(),
            sessions: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Sessions of cameras whose setup has finished.
    pub fn sessions(&self) -> &[CameraSession] {
        &self.sessions
    }

    pub fn health(&self) -> &HealthBoard {
        &self.board
    }

    /// Start every configured camera with ffmpeg capture/encoding.
    pub fn launch_all(&mut self) -> Result<()> {
        for camera in self.config.cameras.clone() {
            let source = FfmpegCamera::with_binaries(
                &camera.source,
                &self.config.encoder.binary,
                &self.config.ffprobe_binary,
            );
            let detector = build_detector(&self.config.detector)?;
            let factory = FfmpegEncoderFactory::new(
                self.config.encoder.clone(),
                self.config.target_fps,
                self.config.segment_duration_secs,
            );
            self.launch(&camera.id, source, detector, factory)?;
        }
        Ok(())
    }

    /// Hand one camera to its own setup thread and return immediately.
    /// The session shows up in [`Supervisor::sessions`] once the probe is done.
    pub fn launch<S, D, F>(&mut self, camera_id: &str, source: S, detector: D, factory: F) -> Result<()>
    where
        S: CameraSource + 'static,
        D: Detector + 'static,
        F: EncoderFactory + 'static,
    {
        let reporter = HealthReporter::new(camera_id, StageKind::Capture, self.health_tx.clone());
        let config = self.config.clone();
        let setup_tx = self.setup_tx.clone();
        let id = camera_id.to_string();

        let setup = spawn_named(camera_id, format!("{camera_id}-setup"), move || {
            let mut stages = Vec::new();
            let session = match start_camera(&id, source, detector, factory, &config, &reporter, &mut stages) {
                Ok(session) => Some(session),
                Err(e) => {
                    error!(camera = %id, "camera setup failed: {e}");
                    reporter.report(StageStatus::Failed {
                        reason: e.to_string(),
                    });
                    None
                }
            };
            let _ = setup_tx.send(CameraSetup { session, stages });
        })?;
        self.stages.push(setup);
        self.pending_setups += 1;
        Ok(())
    }

    /// Adopt the sessions and stage threads of finished setup threads.
    fn collect_setups(&mut self) {
        for setup in self.setup_rx.try_iter() {
            self.pending_setups = self.pending_setups.saturating_sub(1);
            self.sessions.extend(setup.session);
            self.stages.extend(setup.stages);
        }
    }

    /// Drain pending health events, waiting up to `wait` for the first one.
    pub fn pump_health(&mut self, wait: Duration) -> usize {
        let first = self.health_rx.recv_timeout(wait);
        self.collect_setups();
        let first = match first {
            Ok(event) => event,
            Err(_) => return 0,
        };
        let mut count = 0;
        for event in std::iter::once(first).chain(self.health_rx.try_iter()) {
            match &event.status {
                StageStatus::Failed { reason } => {
                    error!(camera = %event.camera_id, stage = event.stage.label(), "stage failed: {reason}")
                }
                StageStatus::Stopped => {
                    info!(camera = %event.camera_id, stage = event.stage.label(), "stage stopped")
                }
                _ => {}
            }
            self.board.apply(&event);
            count += 1;
        }
        count
    }

    /// True once every setup has reported back and every thread has exited.
    pub fn all_stopped(&self) -> bool {
        self.pending_setups == 0 && self.stages.iter().all(|s| s.handle.is_finished())
    }

    /// Block until `stop` is set or every stage has exited.
    pub fn run_until(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            self.pump_health(self.config.poll_interval());
            if !self.stages.is_empty() && self.all_stopped() {
                warn!("all stages exited");
                break;
            }
        }
    }

    /// Block until Ctrl+C. Stages are not drained; frames in flight may be lost.
    pub fn run_until_interrupted(&mut self) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handler_shutdown = shutdown.clone();
        CTRL_HANDLER.call_once(move || {
            if let Err(err) = ctrlc::set_handler(move || {
                handler_shutdown.store(true, Ordering::SeqCst);
            }) {
                warn!("Failed to install Ctrl+C handler: {err}");
            }
        });

        info!(cameras = self.pending_setups + self.sessions.len(), "🚀 recording, press Ctrl+C to stop");
        self.run_until(&shutdown);
        info!("🛑 shutting down");
        self.pump_health(Duration::ZERO);
        self.reap();
        for camera in self.board.stalled_cameras() {
            warn!(camera = %camera, "camera pipeline had a terminated stage");
        }
    }

    /// Join every stage thread that has already exited.
    pub fn reap(&mut self) {
        self.collect_setups();
        let (done, running): (Vec<_>, Vec<_>) =
            self.stages.drain(..).partition(|s| s.handle.is_finished());
        self.stages = running;
        for stage in done {
            if stage.handle.join().is_err() {
                error!(camera = %stage.camera_id, thread = %stage.name, "stage thread panicked");
            }
        }
    }
}
