//! IPC Server module for host and frontend communication.
//!
//! This module provides a Unix Domain Socket server receiving the host's
//! input-binding actions (toggle, manual nudges) and configuration commands,
//! and answering status/metrics queries.

use crate::config::{ConfigManager, Tunables};
use crate::controller::{AdjustDirection, ControlPhase, ConvergenceController};
use crate::error::IpcError;
use crate::metrics::MetricsCollector;
use crate::profiles::{ProfileListResponse, ProfileManager, TitleProfile};
use crate::stereo;
use crate::stereo_output::StereoSink;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Default socket path for IPC communication.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/autoconv.sock";

/// Commands that can be received via IPC.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "command")]
pub enum IpcCommand {
    /// Toggle the automatic loop on or off
    Toggle,
    /// Manual popout increase, one step
    Increase,
    /// Manual popout decrease, one step
    Decrease,
    /// Replace the global tuning set
    SetConfig { tunables: Tunables },
    /// Host reports the active title (None when returning to the desktop)
    SetTitle { app_id: Option<String> },
    /// Create or replace a per-title profile
    SetProfile { profile: TitleProfile },
    /// Remove a per-title profile
    RemoveProfile { app_id: String },
    ListProfiles,
    GetStatus,
    GetMetrics,
}

/// Status response sent to clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StatusResponse {
    pub enabled: bool,
    pub locked_low: bool,
    pub phase: String,
    pub current_popout: f32,
    pub target_popout: f32,
    /// Nearest depth seen on the last processed frame
    pub nearest_w: f32,
    /// Screen parallax the current popout produces at that depth
    pub parallax_at_nearest: f32,
    pub current_title: Option<String>,
    pub tunables: Tunables,
}

impl StatusResponse {
    /// Check if the response contains all required fields.
    /// Returns true if all fields are present and valid.
    pub fn is_complete(&self) -> bool {
        let valid_phases = ["Tracking", "LockedLow"];
        let phase_valid = valid_phases.contains(&self.phase.as_str());

        let popout_in_bounds = self.current_popout >= self.tunables.min_convergence
            && self.current_popout <= self.tunables.max_convergence;

        // locked_low must agree with the reported phase
        let lock_consistent = self.locked_low == (self.phase == "LockedLow");

        phase_valid && popout_in_bounds && lock_consistent
    }
}

/// Convert ControlPhase to string for status responses.
pub fn phase_to_string(phase: ControlPhase) -> String {
    match phase {
        ControlPhase::Tracking => "Tracking".to_string(),
        ControlPhase::LockedLow { .. } => "LockedLow".to_string(),
    }
}

/// Shared daemon state accessible by the IPC server and the frame loop.
pub struct DaemonState {
    /// Convergence controller driven once per frame
    pub controller: RwLock<ConvergenceController>,
    /// Nearest depth from the last processed frame
    pub last_nearest_w: RwLock<f32>,
    /// Configuration manager
    pub config_manager: Arc<ConfigManager>,
    /// Per-title profiles
    pub profiles: RwLock<ProfileManager>,
    /// Operational counters
    pub metrics: Arc<MetricsCollector>,
    /// Output sink, absent when the platform provides none
    pub sink: Option<Arc<StereoSink>>,
}

impl DaemonState {
    /// Create a new daemon state from loaded configuration.
    pub fn new(
        config_manager: Arc<ConfigManager>,
        profiles: ProfileManager,
        metrics: Arc<MetricsCollector>,
        sink: Option<Arc<StereoSink>>,
    ) -> Self {
        let config = config_manager.get();
        let mut controller = ConvergenceController::new(config.tunables);
        if !config.enabled {
            controller.set_enabled(false);
        }

        Self {
            controller: RwLock::new(controller),
            last_nearest_w: RwLock::new(f32::INFINITY),
            config_manager,
            profiles: RwLock::new(profiles),
            metrics,
            sink,
        }
    }

    /// Get the current status as a StatusResponse.
    pub async fn get_status(&self) -> StatusResponse {
        let controller = self.controller.read().await;
        let nearest_w = *self.last_nearest_w.read().await;
        let profiles = self.profiles.read().await;
        let tunables = controller.tunables().clone();

        StatusResponse {
            enabled: controller.is_enabled(),
            locked_low: controller.is_locked_low(),
            phase: phase_to_string(controller.phase()),
            current_popout: controller.current_popout(),
            target_popout: controller.target_popout(),
            nearest_w,
            parallax_at_nearest: stereo::screen_parallax(
                nearest_w,
                tunables.separation,
                controller.current_popout(),
            ),
            current_title: profiles.current_title().cloned(),
            tunables,
        }
    }
}

/// Unix Domain Socket server for IPC.
#[cfg(unix)]
pub struct IpcServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Unix listener for incoming connections
    listener: UnixListener,
}

#[cfg(unix)]
impl IpcServer {
    /// Create a new IPC server at the specified path.
    ///
    /// This will:
    /// 1. Remove any existing socket file at the path
    /// 2. Bind a new Unix socket at the path
    pub async fn new(path: &str) -> Result<Self, IpcError> {
        let socket_path = PathBuf::from(path);

        // Clean up existing socket file if it exists
        Self::cleanup_socket(&socket_path)?;

        // Bind the Unix socket
        let listener = UnixListener::bind(&socket_path).map_err(|e| IpcError::SocketBindFailed {
            path: path.to_string(),
            source: e,
        })?;

        Ok(Self {
            socket_path,
            listener,
        })
    }

    /// Create a new IPC server at the default path.
    pub async fn new_default() -> Result<Self, IpcError> {
        Self::new(DEFAULT_SOCKET_PATH).await
    }

    /// Clean up an existing socket file.
    fn cleanup_socket(path: &Path) -> Result<(), IpcError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| IpcError::SocketBindFailed {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept and handle incoming connections.
    ///
    /// This runs in a loop, accepting connections and spawning tasks to handle them.
    pub async fn run(&self, state: Arc<DaemonState>) -> Result<(), IpcError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, state).await {
                            tracing::warn!("Error handling IPC connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Error accepting IPC connection: {}", e);
                    // Continue accepting connections even after errors
                }
            }
        }
    }

    /// Handle a single client connection.
    async fn handle_connection(
        stream: UnixStream,
        state: Arc<DaemonState>,
    ) -> Result<(), IpcError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        // Read commands line by line (newline-delimited JSON)
        while reader.read_line(&mut line).await? > 0 {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                line.clear();
                continue;
            }

            // Parse and handle the command
            let response = match serde_json::from_str::<IpcCommand>(trimmed) {
                Ok(command) => Self::handle_command(command, &state).await,
                Err(e) => serde_json::json!({
                    "error": format!("Invalid command: {}", e)
                }),
            };

            // Send response
            let response_str = serde_json::to_string(&response)?;
            writer.write_all(response_str.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;

            line.clear();
        }

        Ok(())
    }

    /// Handle a single IPC command and return the response.
    pub async fn handle_command(command: IpcCommand, state: &Arc<DaemonState>) -> serde_json::Value {
        match command {
            IpcCommand::Toggle => {
                let enabled = {
                    let mut controller = state.controller.write().await;
                    controller.toggle_enabled();
                    controller.is_enabled()
                };
                state.metrics.record_toggle();
                tracing::info!(
                    "Auto-convergence {} via IPC",
                    if enabled { "enabled" } else { "disabled" }
                );
                serde_json::json!({ "success": true, "enabled": enabled })
            }

            IpcCommand::Increase => Self::handle_manual(state, AdjustDirection::Increase).await,

            IpcCommand::Decrease => Self::handle_manual(state, AdjustDirection::Decrease).await,

            IpcCommand::SetConfig { tunables } => {
                let mut config = state.config_manager.get();
                config.tunables = tunables.clone();

                // Update and persist
                match state.config_manager.update(config) {
                    Ok(()) => {
                        state.controller.write().await.retune(tunables.clone());
                        state.profiles.write().await.global_default = tunables.clone();
                        if let Some(sink) = &state.sink {
                            sink.set_range(tunables.min_convergence, tunables.max_convergence);
                        }
                        tracing::info!(
                            "Config updated via IPC: bounds=[{}, {}]",
                            tunables.min_convergence,
                            tunables.max_convergence
                        );
                        serde_json::json!({ "success": true, "message": "Configuration updated" })
                    }
                    Err(e) => {
                        tracing::warn!("Failed to update config via IPC: {}", e);
                        serde_json::json!({
                            "success": false,
                            "error": e.to_string()
                        })
                    }
                }
            }

            IpcCommand::SetTitle { app_id } => {
                let tunables = {
                    let mut profiles = state.profiles.write().await;
                    profiles.set_current_title(app_id.clone());
                    profiles.tunables_for_current()
                };

                if let Err(e) = tunables.validate() {
                    tracing::warn!("Profile tuning for {:?} invalid: {}, keeping current", app_id, e);
                    return serde_json::json!({ "success": false, "error": e.to_string() });
                }

                if let Some(sink) = &state.sink {
                    sink.set_range(tunables.min_convergence, tunables.max_convergence);
                }
                state.controller.write().await.retune(tunables);
                tracing::info!("Active title set via IPC: {:?}", app_id);
                serde_json::json!({ "success": true, "app_id": app_id })
            }

            IpcCommand::SetProfile { profile } => {
                if let Err(e) = profile.tunables.validate() {
                    return serde_json::json!({ "success": false, "error": e.to_string() });
                }

                let (applies_now, save_result) = {
                    let mut profiles = state.profiles.write().await;
                    let applies_now = profiles.current_title() == Some(&profile.app_id);
                    profiles.set_profile(profile.clone());
                    (applies_now, profiles.save())
                };

                if let Err(e) = save_result {
                    tracing::warn!("Failed to persist profiles: {}", e);
                }
                if applies_now {
                    if let Some(sink) = &state.sink {
                        sink.set_range(
                            profile.tunables.min_convergence,
                            profile.tunables.max_convergence,
                        );
                    }
                    state.controller.write().await.retune(profile.tunables);
                }
                serde_json::json!({ "success": true, "message": "Profile stored" })
            }

            IpcCommand::RemoveProfile { app_id } => {
                let (removed, save_result) = {
                    let mut profiles = state.profiles.write().await;
                    let removed = profiles.remove_profile(&app_id).is_some();
                    (removed, profiles.save())
                };
                if let Err(e) = save_result {
                    tracing::warn!("Failed to persist profiles: {}", e);
                }
                serde_json::json!({ "success": removed })
            }

            IpcCommand::ListProfiles => {
                let profiles = state.profiles.read().await;
                let response = ProfileListResponse::from(&*profiles);
                serde_json::to_value(response).unwrap_or_else(|e| {
                    serde_json::json!({
                        "error": format!("Failed to serialize profiles: {}", e)
                    })
                })
            }

            IpcCommand::GetStatus => {
                let status = state.get_status().await;
                serde_json::to_value(status).unwrap_or_else(|e| {
                    serde_json::json!({
                        "error": format!("Failed to serialize status: {}", e)
                    })
                })
            }

            IpcCommand::GetMetrics => {
                let metrics = state.metrics.get_metrics();
                serde_json::to_value(metrics).unwrap_or_else(|e| {
                    serde_json::json!({
                        "error": format!("Failed to serialize metrics: {}", e)
                    })
                })
            }
        }
    }

    /// Apply a manual nudge and surface the new target on the OSD.
    async fn handle_manual(state: &Arc<DaemonState>, direction: AdjustDirection) -> serde_json::Value {
        let (result, enabled, locked) = {
            let mut controller = state.controller.write().await;
            (
                controller.adjust_manual(direction),
                controller.is_enabled(),
                controller.is_locked_low(),
            )
        };

        match result {
            Some(target) => {
                state.metrics.record_manual(direction);
                if let Some(sink) = &state.sink {
                    sink.show_osd(&format!("popout {:.2}", target));
                }
                tracing::debug!("Manual adjustment via IPC: target={:.3}", target);
                serde_json::json!({ "success": true, "target_popout": target })
            }
            None => {
                let reason = if !enabled {
                    "auto-convergence is disabled"
                } else if locked {
                    "convergence is locked low"
                } else {
                    "adjustment rejected"
                };
                serde_json::json!({ "success": false, "error": reason })
            }
        }
    }
}

#[cfg(unix)]
impl Drop for IpcServer {
    fn drop(&mut self) {
        // Clean up socket file on drop
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}
