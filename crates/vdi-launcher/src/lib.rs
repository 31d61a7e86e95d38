//! External remoting-client launcher.
//!
//! The controller never speaks a remoting protocol itself — it hands a
//! negotiated [`DesktopConnection`] to an installed client binary (RDP
//! client, USB-redirection helper) and only knows "started" vs. "failed
//! to start". Launched processes are tracked so the front end can poll
//! liveness and clean up on exit.

use vdi_broker::{BrokerError, BrokerResult, DesktopConnection, WindowGeometry};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Default search paths for the RDP client.
#[cfg(target_os = "windows")]
static RDP_SEARCH_PATHS: &[&str] = &[
    r"C:\Program Files\FreeRDP\wfreerdp.exe",
    r"C:\Windows\System32\mstsc.exe",
];

#[cfg(not(target_os = "windows"))]
static RDP_SEARCH_PATHS: &[&str] = &[
    "/usr/bin/xfreerdp",
    "/usr/local/bin/xfreerdp",
    "/usr/bin/rdesktop",
];

/// Default search paths for the USB-redirection helper.
#[cfg(target_os = "windows")]
static USB_SEARCH_PATHS: &[&str] = &[r"C:\Program Files\VDI\vdi-usbd.exe"];

#[cfg(not(target_os = "windows"))]
static USB_SEARCH_PATHS: &[&str] = &[
    "/usr/bin/vdi-usbd",
    "/usr/local/bin/vdi-usbd",
    "/opt/vdi/bin/vdi-usbd",
];

#[cfg(target_os = "windows")]
const RDP_EXE: &str = "wfreerdp.exe";
#[cfg(not(target_os = "windows"))]
const RDP_EXE: &str = "xfreerdp";

#[cfg(target_os = "windows")]
const USB_EXE: &str = "vdi-usbd.exe";
#[cfg(not(target_os = "windows"))]
const USB_EXE: &str = "vdi-usbd";

/// PATH separator.
#[cfg(target_os = "windows")]
const PATH_SEP: char = ';';
#[cfg(not(target_os = "windows"))]
const PATH_SEP: char = ':';

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which external helper to launch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ClientKind {
    Rdp,
    UsbRedirect,
}

/// A launched client process, as reported to the front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedSession {
    pub session_id: String,
    pub kind: ClientKind,
    pub desktop: String,
    pub address: String,
    pub process_id: u32,
    pub started_at: String,
}

struct SessionInner {
    info: LaunchedSession,
    child: Option<tokio::process::Child>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Launcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawns and tracks external remoting-client processes.
pub struct RemotingLauncher {
    sessions: Arc<Mutex<HashMap<String, SessionInner>>>,
}

impl Default for RemotingLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl RemotingLauncher {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ── Launch ──────────────────────────────────────────────────────

    /// Launch the RDP client against a negotiated connection.
    pub async fn launch_rdp(
        &self,
        desktop: &str,
        connection: &DesktopConnection,
        geometry: WindowGeometry,
    ) -> BrokerResult<LaunchedSession> {
        let exe = Self::find_rdp_client().ok_or_else(|| {
            BrokerError::launcher(
                "No RDP client found. Install FreeRDP or ensure it is on PATH.",
            )
        })?;

        let mut cmd = Command::new(&exe);
        for arg in rdp_arguments(connection, geometry) {
            cmd.arg(arg);
        }

        self.spawn_and_track(cmd, ClientKind::Rdp, desktop, &connection.address)
            .await
    }

    /// Launch the USB-redirection helper for an established session.
    pub async fn launch_usb_helper(
        &self,
        desktop: &str,
        connection: &DesktopConnection,
    ) -> BrokerResult<LaunchedSession> {
        let exe = Self::find_usb_helper().ok_or_else(|| {
            BrokerError::launcher("USB-redirection helper not found.")
        })?;

        let mut cmd = Command::new(&exe);
        cmd.arg("--host")
            .arg(format!("{}:{}", connection.address, connection.port))
            .arg("--ticket")
            .arg(&connection.ticket);

        self.spawn_and_track(cmd, ClientKind::UsbRedirect, desktop, &connection.address)
            .await
    }

    async fn spawn_and_track(
        &self,
        mut cmd: Command,
        kind: ClientKind,
        desktop: &str,
        address: &str,
    ) -> BrokerResult<LaunchedSession> {
        let child = cmd
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| BrokerError::launcher(format!("Failed to launch process: {e}")))?;

        let pid = child.id().unwrap_or(0);
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let info = LaunchedSession {
            session_id: session_id.clone(),
            kind,
            desktop: desktop.to_string(),
            address: address.to_string(),
            process_id: pid,
            started_at: now,
        };

        log::info!("Launched {kind:?} client for desktop '{desktop}' (pid {pid})");

        self.sessions.lock().await.insert(
            session_id,
            SessionInner { info: info.clone(), child: Some(child) },
        );

        Ok(info)
    }

    // ── Session management ──────────────────────────────────────────

    /// List all tracked client sessions.
    pub async fn list_sessions(&self) -> Vec<LaunchedSession> {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|s| s.info.clone()).collect()
    }

    /// Get one tracked session.
    pub async fn get_session(&self, session_id: &str) -> BrokerResult<LaunchedSession> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|s| s.info.clone())
            .ok_or_else(|| {
                BrokerError::not_found(format!("Client session '{session_id}' not found"))
            })
    }

    /// Whether a tracked session's process is still running.
    pub async fn is_session_alive(&self, session_id: &str) -> BrokerResult<bool> {
        let mut sessions = self.sessions.lock().await;
        if let Some(inner) = sessions.get_mut(session_id) {
            if let Some(ref mut child) = inner.child {
                match child.try_wait() {
                    Ok(Some(_)) => Ok(false),
                    Ok(None) => Ok(true),
                    Err(_) => Ok(false),
                }
            } else {
                Ok(false)
            }
        } else {
            Err(BrokerError::not_found(format!(
                "Client session '{session_id}' not found"
            )))
        }
    }

    /// Kill a tracked session's process and forget it.
    pub async fn close_session(&self, session_id: &str) -> BrokerResult<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(mut inner) = sessions.remove(session_id) {
            if let Some(ref mut child) = inner.child {
                let _ = child.kill().await;
            }
            Ok(())
        } else {
            Err(BrokerError::not_found(format!(
                "Client session '{session_id}' not found"
            )))
        }
    }

    /// Kill everything still tracked. Returns the count.
    pub async fn close_all_sessions(&self) -> u32 {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len() as u32;
        for (_, mut inner) in sessions.drain() {
            if let Some(ref mut child) = inner.child {
                let _ = child.kill().await;
            }
        }
        count
    }

    /// Forget sessions whose process already exited. Returns the count.
    pub async fn prune_dead_sessions(&self) -> u32 {
        let mut sessions = self.sessions.lock().await;
        let mut dead_ids = Vec::new();

        for (id, inner) in sessions.iter_mut() {
            let is_dead = if let Some(ref mut child) = inner.child {
                matches!(child.try_wait(), Ok(Some(_)) | Err(_))
            } else {
                true
            };
            if is_dead {
                dead_ids.push(id.clone());
            }
        }

        let count = dead_ids.len() as u32;
        for id in dead_ids {
            sessions.remove(&id);
        }
        count
    }

    // ── Executable discovery ────────────────────────────────────────

    /// Find the RDP client on this system.
    pub fn find_rdp_client() -> Option<String> {
        Self::find_executable(RDP_SEARCH_PATHS, RDP_EXE)
    }

    /// Find the USB-redirection helper on this system.
    pub fn find_usb_helper() -> Option<String> {
        Self::find_executable(USB_SEARCH_PATHS, USB_EXE)
    }

    fn find_executable(known_paths: &[&str], exe_name: &str) -> Option<String> {
        for path in known_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }

        if let Ok(path_var) = std::env::var("PATH") {
            for dir in path_var.split(PATH_SEP) {
                let candidate = Path::new(dir.trim()).join(exe_name);
                if candidate.exists() {
                    return candidate.to_string_lossy().into_owned().into();
                }
            }
        }

        None
    }

    /// Whether an RDP client is installed.
    pub fn is_rdp_available() -> bool {
        Self::find_rdp_client().is_some()
    }
}

/// FreeRDP-style argument list for a negotiated connection.
///
/// The per-session ticket is presented as the password; the broker has
/// already authorized it for exactly this connection.
pub fn rdp_arguments(connection: &DesktopConnection, geometry: WindowGeometry) -> Vec<String> {
    let mut args = vec![
        format!("/v:{}:{}", connection.address, connection.port),
        format!("/p:{}", connection.ticket),
    ];
    match geometry {
        WindowGeometry::Fullscreen => args.push("/f".to_string()),
        WindowGeometry::Windowed { width, height } => {
            args.push(format!("/size:{width}x{height}"));
        }
    }
    args
}
