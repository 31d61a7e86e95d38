//! Typed broker RPC surface.
//!
//! The broker conversation is an opaque structured exchange: the client
//! sends one [`BrokerRequest`] per round trip and receives one
//! [`BrokerReply`]. Authentication is pluggable — the broker answers
//! with whichever [`AuthChallenge`] the identity requires next, one
//! factor at a time, until it finally replies `Authenticated`.

use serde::{Deserialize, Serialize};

use crate::types::{Desktop, DesktopConnection};

/// One operation sent to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BrokerRequest {
    /// Open the negotiation; hints are optional pre-fill values.
    #[serde(rename_all = "camelCase")]
    StartSession {
        #[serde(default)]
        default_user: String,
        #[serde(default)]
        default_domain: String,
    },
    #[serde(rename_all = "camelCase")]
    SubmitPasscode { username: String, passcode: String },
    #[serde(rename_all = "camelCase")]
    SubmitNextTokencode { tokencode: String },
    #[serde(rename_all = "camelCase")]
    SubmitPin { pin: String },
    AcceptDisclaimer,
    #[serde(rename_all = "camelCase")]
    SubmitCertificate { identity: String },
    #[serde(rename_all = "camelCase")]
    SubmitPassword {
        username: String,
        password: String,
        domain: String,
    },
    #[serde(rename_all = "camelCase")]
    ChangePassword {
        old_password: String,
        new_password: String,
    },
    GetDesktops,
    /// Negotiate a remoting connection for one desktop.
    #[serde(rename_all = "camelCase")]
    GetDesktopConnection { name: String, protocol: String },
    #[serde(rename_all = "camelCase")]
    ResetDesktop { name: String },
    #[serde(rename_all = "camelCase")]
    RollbackDesktop { name: String },
    #[serde(rename_all = "camelCase")]
    KillSession { session_id: String },
    #[serde(rename_all = "camelCase")]
    LogoffSession { session_id: String },
    Logout,
}

impl BrokerRequest {
    /// Short operation name for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::StartSession { .. } => "startSession",
            Self::SubmitPasscode { .. } => "submitPasscode",
            Self::SubmitNextTokencode { .. } => "submitNextTokencode",
            Self::SubmitPin { .. } => "submitPin",
            Self::AcceptDisclaimer => "acceptDisclaimer",
            Self::SubmitCertificate { .. } => "submitCertificate",
            Self::SubmitPassword { .. } => "submitPassword",
            Self::ChangePassword { .. } => "changePassword",
            Self::GetDesktops => "getDesktops",
            Self::GetDesktopConnection { .. } => "getDesktopConnection",
            Self::ResetDesktop { .. } => "resetDesktop",
            Self::RollbackDesktop { .. } => "rollbackDesktop",
            Self::KillSession { .. } => "killSession",
            Self::LogoffSession { .. } => "logoffSession",
            Self::Logout => "logout",
        }
    }
}

/// One structured broker response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum BrokerReply {
    /// Another authentication factor is required.
    Challenge(AuthChallenge),
    /// Negotiation complete; the identity is authenticated.
    Authenticated,
    /// Entitled desktop list, in server display order.
    Desktops { desktops: Vec<Desktop> },
    /// Remoting hand-off for one desktop.
    Connection(DesktopConnection),
    /// Operation acknowledged, nothing further to report.
    Done,
}

/// The authentication factor the broker asks for next.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AuthChallenge {
    /// RSA-style passcode.
    #[serde(rename_all = "camelCase")]
    Passcode {
        #[serde(default)]
        username: String,
        /// Whether the user may change the pre-filled username
        #[serde(default)]
        user_selectable: bool,
    },
    /// Token drifted; the next tokencode is required.
    #[serde(rename_all = "camelCase")]
    NextTokencode {
        #[serde(default)]
        username: String,
    },
    /// PIN must be (re)set.
    #[serde(rename_all = "camelCase")]
    PinChange {
        /// System-proposed PIN, possibly empty
        #[serde(default)]
        pin: String,
        #[serde(default)]
        message: String,
        /// Whether the user may pick their own PIN
        #[serde(default)]
        user_selectable: bool,
    },
    /// Disclaimer text that must be accepted before continuing.
    #[serde(rename_all = "camelCase")]
    Disclaimer { text: String },
    /// Certificate-based authentication.
    #[serde(rename_all = "camelCase")]
    Certificate {
        #[serde(default)]
        issuers: Vec<String>,
    },
    /// AD password.
    #[serde(rename_all = "camelCase")]
    Password {
        #[serde(default)]
        username: String,
        /// Username field is locked to the pre-filled value
        #[serde(default)]
        read_only: bool,
        #[serde(default)]
        domains: Vec<String>,
        #[serde(default)]
        suggested_domain: String,
    },
    /// Password expired; a change is required.
    #[serde(rename_all = "camelCase")]
    PasswordChange {
        #[serde(default)]
        username: String,
        #[serde(default)]
        domain: String,
    },
}
