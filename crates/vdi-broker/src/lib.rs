//! # Broker Session & Desktop Lifecycle Controller
//!
//! Negotiates authentication with a remote connection broker through a
//! multi-step, broker-driven protocol, tracks the authenticated
//! identity's desktop entitlements, executes lifecycle actions against
//! them, and carries the reconnection policy for unattended operation.
//!
//! ## Modules
//!
//! - **types** — Desktop model, lifecycle enums, derived `can_*` predicates
//! - **error** — Crate-specific error types
//! - **protocol** — Typed broker RPC requests / replies / auth challenges
//! - **transport** — Cancellable HTTPS transport with cookie persistence
//! - **events** — Ordered session event channel consumed by the front end
//! - **session** — The negotiation state machine
//! - **registry** — Ordered desktop registry with selection preservation
//! - **actions** — Lifecycle action executor, serialized per desktop
//! - **retry** — Unattended reconnect backoff policy
//! - **prefs** — Key-value preference store + MRU broker list
//! - **service** — Aggregate façade

pub mod actions;
pub mod error;
pub mod events;
pub mod prefs;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod service;
pub mod session;
pub mod transport;
pub mod types;

pub use actions::{ActionExecutor, DesktopAction};
pub use error::{BrokerError, BrokerErrorKind, BrokerResult};
pub use events::{EventReceiver, EventSender, SessionEvent};
pub use protocol::{AuthChallenge, BrokerReply, BrokerRequest};
pub use registry::DesktopRegistry;
pub use retry::RetryPolicy;
pub use service::BrokerService;
pub use session::{BrokerSession, SessionStep};
pub use transport::{cancel_pair, CancelSource, CancelToken, HttpsTransport, Transport};
pub use types::{
    ConnectionState, Desktop, DesktopConnection, DesktopStatus, OfflineState, SessionConfig,
    WindowGeometry,
};
