//! Aggregate service façade.
//!
//! `BrokerService` owns the [`BrokerSession`] and its [`ActionExecutor`]
//! and exposes every controller operation to the front end. The front
//! end holds the service and the event receiver; the service holds no
//! reference back to the front end.

use std::sync::Arc;

use crate::actions::{ActionExecutor, DesktopAction};
use crate::error::{BrokerError, BrokerResult};
use crate::events::EventReceiver;
use crate::registry::DesktopRegistry;
use crate::session::{BrokerSession, SessionStep};
use crate::transport::{HttpsTransport, Transport};
use crate::types::{Desktop, DesktopConnection, SessionConfig};

/// Top-level handle over session, registry and lifecycle actions.
pub struct BrokerService {
    session: Arc<BrokerSession>,
    executor: ActionExecutor,
    config: SessionConfig,
}

impl BrokerService {
    /// Build a service with the production HTTPS transport.
    pub fn new(config: SessionConfig) -> BrokerResult<(Self, EventReceiver)> {
        let transport = HttpsTransport::new(
            &config.default_broker,
            config.port,
            config.insecure,
            config.timeout_secs,
        )?;
        if let Some(path) = &config.cookie_file {
            transport.set_cookie_file(path);
        }
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Build a service over any transport (tests use a double here).
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> (Self, EventReceiver) {
        let (session, receiver) = BrokerSession::new(transport.clone(), config.clone());
        let session = Arc::new(session);
        let executor = ActionExecutor::new(transport, session.registry().clone());
        (Self { session, executor, config }, receiver)
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<BrokerSession> {
        &self.session
    }

    /// The session's desktop registry.
    pub fn registry(&self) -> &Arc<DesktopRegistry> {
        self.session.registry()
    }

    /// Session configuration (read once at construction).
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current negotiation step.
    pub fn step(&self) -> SessionStep {
        self.session.step()
    }

    // ── Negotiation ─────────────────────────────────────────────────

    /// Connect to the configured default broker.
    pub async fn connect(&self) -> BrokerResult<()> {
        let address = self.config.default_broker.clone();
        if address.is_empty() {
            return Err(BrokerError::validation("No broker address configured"));
        }
        self.session.connect(&address).await
    }

    /// Connect to an explicit broker address.
    pub async fn connect_to(&self, address: &str) -> BrokerResult<()> {
        self.session.connect(address).await
    }

    pub fn cancel_requests(&self) -> usize {
        self.session.cancel_requests()
    }

    pub async fn submit_username_passcode(&self, username: &str, passcode: &str) -> BrokerResult<()> {
        self.session.submit_username_passcode(username, passcode).await
    }

    pub async fn submit_next_tokencode(&self, tokencode: &str) -> BrokerResult<()> {
        self.session.submit_next_tokencode(tokencode).await
    }

    pub async fn submit_pin(&self, pin1: &str, pin2: &str) -> BrokerResult<()> {
        self.session.submit_pin(pin1, pin2).await
    }

    pub async fn accept_disclaimer(&self) -> BrokerResult<()> {
        self.session.accept_disclaimer().await
    }

    pub async fn submit_certificate_identity(&self, identity: &str) -> BrokerResult<()> {
        self.session.submit_certificate_identity(identity).await
    }

    pub async fn submit_username_password(
        &self,
        username: &str,
        password: &str,
        domain: &str,
    ) -> BrokerResult<()> {
        self.session.submit_username_password(username, password, domain).await
    }

    pub async fn submit_password_change(
        &self,
        old_password: &str,
        new_password: &str,
        confirm: &str,
    ) -> BrokerResult<()> {
        self.session
            .submit_password_change(old_password, new_password, confirm)
            .await
    }

    pub async fn load_desktops(&self) -> BrokerResult<()> {
        self.session.load_desktops().await
    }

    pub async fn logout(&self) -> BrokerResult<()> {
        self.session.logout().await
    }

    // ── Desktop lifecycle ───────────────────────────────────────────

    /// Run one lifecycle action. Connect / Reconnect return the
    /// negotiated connection.
    pub async fn execute(
        &self,
        action: DesktopAction,
        name: &str,
    ) -> BrokerResult<Option<DesktopConnection>> {
        self.executor.execute(action, name).await
    }

    /// Negotiate a connection for `name` and announce it on the event
    /// channel so the front end hands it to the launcher.
    pub async fn connect_desktop(&self, name: &str) -> BrokerResult<DesktopConnection> {
        let connection = match self.executor.execute(DesktopAction::Connect, name).await? {
            Some(connection) => connection,
            None => {
                return Err(BrokerError::parse(
                    "Connect action produced no connection hand-off",
                ))
            }
        };
        self.session.mark_connecting(name);
        if let Some(desktop) = self.registry().get(name) {
            self.session.launch_ready(desktop);
        }
        Ok(connection)
    }

    /// Select the remoting protocol for one desktop.
    pub fn set_selected_protocol(&self, name: &str, protocol: &str) -> BrokerResult<()> {
        self.registry().set_selected_protocol(name, protocol)
    }

    /// Snapshot of the registry in server order.
    pub fn desktops(&self) -> Vec<Desktop> {
        self.registry().snapshot()
    }
}
