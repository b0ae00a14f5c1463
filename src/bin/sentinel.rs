/// 数字卫兵录制守护进程 (Digital Sentinel Recorder)
///
/// 每个摄像头:
/// 1. 采集线程: ffmpeg 解码, 断线重连
/// 2. 检测线程: 目标检测 (可跳帧)
/// 3. 录制线程: HLS 分段 + 元数据 JSON + 索引
use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sentinel_recorder::{Args, Supervisor};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Args::parse().into_config()?;
    config.print_summary();

    let mut supervisor = Supervisor::new(config);
    supervisor.launch_all()?;
    supervisor.run_until_interrupted();
    Ok(())
}
