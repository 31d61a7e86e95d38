//! Session event channel.
//!
//! The state machine is the single producer; the UI / CLI front end is
//! the single consumer. Events are delivered in transition order over
//! one unbounded channel, exactly one event per logical transition —
//! the tagged enum replaces the wide one-method-per-event delegate
//! interface and lets the consumer's `match` prove exhaustiveness.

use tokio::sync::mpsc;

use crate::types::Desktop;

/// One notification from the session state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Negotiation with the broker has started.
    BrokerRequested,
    /// The broker wants an RSA-style passcode.
    PasscodeRequested { username: String, user_selectable: bool },
    /// The broker wants the token's next code.
    NextTokencodeRequested { username: String },
    /// The broker wants a PIN change.
    PinChangeRequested { pin: String, message: String, user_selectable: bool },
    /// Disclaimer text is ready and must be accepted.
    DisclaimerRequested { text: String },
    /// The broker wants a certificate identity.
    CertificateRequested { issuers: Vec<String> },
    /// The broker wants username / password / domain.
    PasswordRequested {
        username: String,
        read_only: bool,
        domains: Vec<String>,
        suggested_domain: String,
    },
    /// The broker requires a password change.
    PasswordChangeRequested { username: String, domain: String },
    /// Authentication finished; the desktop list request is pending.
    DesktopsRequested,
    /// The desktop registry has been (re)populated.
    DesktopsUpdated,
    /// A desktop connection was negotiated; hand off to the launcher.
    LaunchDesktop(Desktop),
    /// The broker session ended.
    Disconnected,
    /// The remoting tunnel dropped, independent of the broker session.
    TunnelDisconnected { reason: String },
    /// The session failed; retry policy may act on this.
    Failed { message: String },
}

/// Sending half held by the session state machine.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
/// Receiving half held by the front end.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create the session event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
