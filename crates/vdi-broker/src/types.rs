//! Shared types for the broker session controller.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection / Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for one broker session, read once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Broker hostname / IP (e.g. "view.corp.example")
    #[serde(default)]
    pub default_broker: String,
    /// Port (default 443)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pre-filled username hint
    #[serde(default)]
    pub default_user: String,
    /// Pre-filled domain hint
    #[serde(default)]
    pub default_domain: String,
    /// Unattended / kiosk mode: never prompt, fail fast on missing credentials
    #[serde(default)]
    pub non_interactive: bool,
    /// Disable reconnection retries (single attempt)
    #[serde(default)]
    pub once: bool,
    /// First reconnect backoff in seconds (default 30)
    #[serde(default = "default_initial_retry")]
    pub initial_retry_period: u64,
    /// Backoff ceiling in seconds (default 240)
    #[serde(default = "default_maximum_retry")]
    pub maximum_retry_period: u64,
    /// Skip TLS certificate verification (self-signed labs)
    #[serde(default)]
    pub insecure: bool,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Session cookie persistence path
    #[serde(default)]
    pub cookie_file: Option<String>,
}

fn default_port() -> u16 { 443 }
fn default_timeout() -> u64 { 30 }
fn default_initial_retry() -> u64 { 30 }
fn default_maximum_retry() -> u64 { 240 }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_broker: String::new(),
            port: 443,
            default_user: String::new(),
            default_domain: String::new(),
            non_interactive: false,
            once: false,
            initial_retry_period: 30,
            maximum_retry_period: 240,
            insecure: false,
            timeout_secs: 30,
            cookie_file: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Desktop lifecycle enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Server-reported desktop lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesktopStatus {
    AvailableRemote,
    AvailableLocal,
    LoggedOn,
    CheckedOutDisabled,
    RollingBack,
    ServerRollback,
    HandlingServerRollback,
    TransferCheckingIn,
    TransferCheckingOut,
    /// Unrecognised status from a newer broker
    #[serde(other)]
    Unknown,
}

impl Default for DesktopStatus {
    fn default() -> Self { Self::Unknown }
}

/// Client-side connection state, independent of the server status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self { Self::Disconnected }
}

/// Check-out state for offline-capable desktops.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfflineState {
    None,
    CheckedOut,
    CheckingIn,
    CheckingOut,
}

impl Default for OfflineState {
    fn default() -> Self { Self::None }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Desktop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One desktop entitlement returned by the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Desktop {
    /// Unique within the registry; stable identifier for preferences
    pub name: String,
    #[serde(default)]
    pub status: DesktopStatus,
    #[serde(default)]
    pub connection_state: ConnectionState,
    #[serde(default)]
    pub offline_state: OfflineState,
    /// Empty when no active session exists for this identity
    #[serde(default)]
    pub session_id: String,
    /// Supported remoting protocols, in server-preference order
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Member of `protocols`, or empty
    #[serde(default)]
    pub selected_protocol: String,
    /// Local-VM desktops bypass broker-mediated lifecycle actions
    #[serde(default)]
    pub is_local_vm: bool,
}

impl Desktop {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: DesktopStatus::Unknown,
            connection_state: ConnectionState::Disconnected,
            offline_state: OfflineState::None,
            session_id: String::new(),
            protocols: Vec::new(),
            selected_protocol: String::new(),
            is_local_vm: false,
        }
    }

    /// Whether an active broker session exists for this desktop.
    pub fn has_session(&self) -> bool {
        !self.session_id.is_empty()
    }

    /// Whether the desktop accepts Connect / Reconnect.
    pub fn can_connect(&self) -> bool {
        if self.is_local_vm {
            return false;
        }
        matches!(
            self.status,
            DesktopStatus::AvailableRemote
                | DesktopStatus::AvailableLocal
                | DesktopStatus::LoggedOn
                | DesktopStatus::TransferCheckingIn
                | DesktopStatus::TransferCheckingOut
        )
    }

    /// Whether the desktop accepts a Reset.
    pub fn can_reset(&self) -> bool {
        if self.is_local_vm || self.connection_state == ConnectionState::Connecting {
            return false;
        }
        matches!(
            self.status,
            DesktopStatus::AvailableRemote
                | DesktopStatus::AvailableLocal
                | DesktopStatus::LoggedOn
        )
    }

    /// Whether the desktop accepts a Rollback.
    ///
    /// Rollback discards the checked-out copy, so it is only valid while
    /// the desktop is actually checked out and no connection attempt is
    /// underway.
    pub fn can_rollback(&self) -> bool {
        !self.is_local_vm
            && self.offline_state == OfflineState::CheckedOut
            && self.connection_state != ConnectionState::Connecting
    }

    /// Whether the desktop's remote session can be killed.
    pub fn can_kill_session(&self) -> bool {
        !self.is_local_vm && self.has_session()
    }

    /// Whether the desktop's remote session can be logged off.
    pub fn can_logoff(&self) -> bool {
        !self.is_local_vm && self.has_session()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Desktop connection hand-off
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything an external remoting client needs to reach a desktop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesktopConnection {
    pub address: String,
    pub port: u16,
    /// One-time per-session ticket presented to the remoting host
    pub ticket: String,
    /// Remoting protocol the broker negotiated
    #[serde(default)]
    pub protocol: String,
}

/// Requested window geometry for the launched client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WindowGeometry {
    Fullscreen,
    Windowed { width: u32, height: u32 },
}

impl Default for WindowGeometry {
    fn default() -> Self {
        Self::Windowed { width: 1280, height: 800 }
    }
}
