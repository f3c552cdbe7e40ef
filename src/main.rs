//! camrelay: capture an encoded V4L2 stream and serve it through the
//! pull-based delivery interface

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camrelay::capture::V4l2Source;
use camrelay::pipeline::{ChannelWake, StreamPipeline};
use camrelay::{utils, Config};
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camrelay=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camrelay launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?.install();

    if config.encoder.enabled {
        return Err(eyre!(
            "encoder.enabled is set but this build has no vendor encoder backend"
        ));
    }

    // Auto-detect capture device if needed
    let mut capture_config = config.capture.clone();
    if capture_config.device.path.is_empty() {
        let preferred = capture_config.format;
        capture_config.device =
            tokio::task::spawn_blocking(move || utils::auto_detect_device(preferred)).await??;
        capture_config.format = capture_config.device.format;
    }
    info!("Using capture device: {:?}", capture_config.device);

    let source = tokio::task::spawn_blocking(move || V4l2Source::open(capture_config)).await??;

    let (wake, wake_rx) = ChannelWake::pair();
    let mut pipeline = StreamPipeline::start("main", source, Arc::new(wake), &config.pipeline)?;

    // Scheduler stand-in: deliver one access unit per wake-up
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let scheduler = tokio::task::spawn_blocking(move || {
        let settings = Config::current();
        let wait = Duration::from_millis(settings.pipeline.wait_timeout_ms);
        let mut out = vec![0u8; settings.pipeline.max_output_size];
        pipeline.request_keyframe();
        while !stop_flag.load(Ordering::Acquire) {
            match wake_rx.recv_timeout(wait) {
                Ok(()) => {
                    if let Some(delivery) = pipeline.deliver(&mut out) {
                        debug!(
                            "delivered {} bytes pts {}.{:06} key={}",
                            delivery.size,
                            delivery.pts.secs(),
                            delivery.pts.subsec_micros(),
                            delivery.keyframe
                        );
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    if !pipeline.is_running() {
                        warn!("capture thread exited");
                        break;
                    }
                }
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }
        pipeline.stop();
        pipeline.queue_stats()
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = wait_finished(&stop, &scheduler) => {}
    }
    stop.store(true, Ordering::Release);
    let stats = scheduler.await?;

    info!(
        "camrelay shutting down (written {}, delivered {}, dropped {})",
        stats.written, stats.read, stats.dropped
    );
    Ok(())
}

/// Resolves once the scheduler loop has returned on its own
async fn wait_finished<T>(stop: &AtomicBool, task: &tokio::task::JoinHandle<T>) {
    while !stop.load(Ordering::Acquire) && !task.is_finished() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
