//! AutoConv daemon - adaptive stereo convergence for injection rigs.
//!
//! The daemon watches the per-frame depth samples published by the stereo
//! injection host and feeds back a smoothed convergence ("popout") value,
//! replacing manual convergence tuning with a closed-loop adjustment.

mod config;
mod controller;
mod error;
mod frame_monitor;
mod ipc_server;
mod logging;
mod metrics;
mod profiles;
mod stereo;
mod stereo_output;

use config::ConfigManager;
use error::DaemonError;
use frame_monitor::{FrameReader, FrameSnapshot};
use ipc_server::{DaemonState, IpcServer};
use metrics::MetricsCollector;
use profiles::ProfileManager;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use stereo_output::StereoSink;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Frame segment polling interval in milliseconds
const FRAME_POLL_INTERVAL_MS: u64 = 2;

/// Retry interval for the host frame segment in seconds
const SHM_RETRY_INTERVAL_SECS: u64 = 5;

/// Graceful shutdown timeout in seconds
const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

/// Upper bound on a single frame's delta time in seconds; hitches and
/// debugger pauses are treated as one long-but-bounded frame.
const MAX_FRAME_DELTA_SECS: f32 = 0.25;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = logging::init_logging().map_err(|e| {
        eprintln!("Failed to initialize logging: {}", e);
        e
    })?;

    info!("AutoConv daemon starting...");

    let result = run_daemon().await;

    match &result {
        Ok(()) => info!("AutoConv daemon shut down gracefully"),
        Err(e) => error!("AutoConv daemon error: {}", e),
    }

    result.map_err(Into::into)
}

/// Main daemon entry point.
async fn run_daemon() -> Result<(), DaemonError> {
    // Load configuration; an invalid file disables the automatic loop and
    // leaves the host on static convergence, it never kills the daemon.
    let config_path = ConfigManager::default_path();
    let config_manager = match ConfigManager::load_or_default(&config_path) {
        Ok(manager) => {
            info!("Configuration loaded from {:?}", config_path);
            Arc::new(manager)
        }
        Err(e) => {
            error!(
                "Configuration at {:?} is invalid: {}; auto-convergence disabled, \
                 falling back to static convergence",
                config_path, e
            );
            Arc::new(ConfigManager::fallback(&config_path))
        }
    };

    let config = config_manager.get();

    // Per-title profiles; any load failure falls back to defaults
    let profiles = match ProfileManager::load_or_default() {
        Ok(profiles) => profiles,
        Err(e) => {
            warn!("Failed to load profiles: {}, using defaults", e);
            ProfileManager::default()
        }
    };

    // Create the output segments the host compositor and overlay map
    let sink = Arc::new(StereoSink::new(
        config.tunables.min_convergence,
        config.tunables.max_convergence,
    )?);

    let metrics = Arc::new(MetricsCollector::new());

    // Create shared daemon state
    let daemon_state = Arc::new(DaemonState::new(
        Arc::clone(&config_manager),
        profiles,
        Arc::clone(&metrics),
        Some(Arc::clone(&sink)),
    ));

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Set up signal handlers
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = setup_signal_handlers(shutdown_tx_clone).await {
            error!("Signal handler error: {}", e);
        }
    });

    // Spawn IPC server task
    let ipc_state = Arc::clone(&daemon_state);
    let ipc_shutdown_rx = shutdown_rx.clone();
    let ipc_handle =
        tokio::spawn(
            async move { run_ipc_server_with_panic_catch(ipc_state, ipc_shutdown_rx).await },
        );

    // Spawn the frame loop task
    let loop_state = Arc::clone(&daemon_state);
    let loop_shutdown_rx = shutdown_rx.clone();
    let loop_handle =
        tokio::spawn(async move { run_frame_loop(loop_state, loop_shutdown_rx).await });

    info!("AutoConv daemon initialized and running");

    // Wait for shutdown signal
    let mut shutdown_rx_main = shutdown_rx.clone();
    shutdown_rx_main.changed().await.ok();

    info!("Shutdown signal received, stopping tasks...");

    // Give tasks time to shut down gracefully
    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(ipc_handle, loop_handle);
    })
    .await;

    info!("All tasks stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown (SIGTERM and SIGINT).
#[cfg(unix)]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    // Signal shutdown to all tasks
    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Stub signal handler for non-Unix platforms (Windows development)
#[cfg(not(unix))]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // On Windows, just wait for Ctrl+C
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Run IPC server, restarting on errors until shutdown.
async fn run_ipc_server_with_panic_catch(
    state: Arc<DaemonState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("IPC server shutting down");
                    break;
                }
            }
            result = run_ipc_server_inner(Arc::clone(&state)) => {
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        error!("IPC server error: {}, restarting in 5 seconds", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }
}

/// Inner IPC server loop
#[cfg(unix)]
async fn run_ipc_server_inner(state: Arc<DaemonState>) -> Result<(), error::IpcError> {
    let server = IpcServer::new_default().await?;
    info!("IPC server listening on {:?}", server.socket_path());
    server.run(state).await
}

/// Stub IPC server for non-Unix platforms
#[cfg(not(unix))]
async fn run_ipc_server_inner(_state: Arc<DaemonState>) -> Result<(), error::IpcError> {
    warn!("IPC server not available on this platform");
    // Just wait indefinitely on non-Unix platforms
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

/// Poll the host frame segment and drive the controller, one update per
/// published frame, reconnecting when the host goes away.
async fn run_frame_loop(state: Arc<DaemonState>, mut shutdown_rx: watch::Receiver<bool>) {
    let poll_interval = Duration::from_millis(FRAME_POLL_INTERVAL_MS);
    let retry_interval = Duration::from_secs(SHM_RETRY_INTERVAL_SECS);

    loop {
        // Check for shutdown
        if *shutdown_rx.borrow() {
            info!("Frame loop shutting down");
            break;
        }

        // Try to connect to the host's frame segment
        let reader = match FrameReader::new() {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "Failed to open host frame segment: {}, retrying in {} seconds",
                    e, SHM_RETRY_INTERVAL_SECS
                );
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(retry_interval) => {}
                }
                continue;
            }
        };

        info!("Connected to host frame segment");

        // Poll loop
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Frame loop shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {
                    // Poll with panic catching
                    let poll_result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        reader.poll()
                    }));

                    match poll_result {
                        Ok(Ok(Some(snapshot))) => {
                            process_frame(&state, snapshot).await;
                        }
                        Ok(Ok(None)) => {
                            // No new frame published yet
                        }
                        Ok(Err(e)) => {
                            warn!("Frame poll error: {}, reconnecting...", e);
                            break; // Break inner loop to reconnect
                        }
                        Err(_) => {
                            error!("Panic during frame poll, continuing operation");
                        }
                    }
                }
            }
        }
    }
}

/// Run one controller update for a published frame and emit the result.
async fn process_frame(state: &Arc<DaemonState>, snapshot: FrameSnapshot) {
    let delta = snapshot.frame_time.clamp(0.0, MAX_FRAME_DELTA_SECS);
    let sample = controller::FrameSample {
        nearest_w: snapshot.nearest_w,
        frame_time: snapshot.frame_time,
    };

    let (value, locked, was_locked) = {
        let mut controller = state.controller.write().await;
        let was_locked = controller.is_locked_low();
        let value = controller.update(sample, delta);
        (value, controller.is_locked_low(), was_locked)
    };

    *state.last_nearest_w.write().await = snapshot.nearest_w;
    state.metrics.record_frame();

    if locked && !was_locked {
        state.metrics.record_lock();
        warn!(
            frame = snapshot.frame,
            "Convergence oscillation detected, locking to lower bound"
        );
    }

    // The sink skips the write when nothing changed, so a disabled or
    // settled controller costs nothing here.
    if let Some(sink) = &state.sink {
        if sink.set_convergence(value, locked) {
            state.metrics.record_write();
        }
    }
}
