//! Desktop lifecycle actions against the broker.
//!
//! Preconditions are the `can_*` predicates on [`Desktop`] — a violated
//! precondition fails fast without touching the transport. Actions are
//! serialized per desktop name; different desktops run concurrently, so
//! a reset of one desktop never waits on (or observes partial effects
//! of) a reset of another.
//!
//! Confirmation of destructive actions (Reset, Rollback, KillSession)
//! belongs to the caller, before `execute` — the executor never prompts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};
use crate::protocol::{BrokerReply, BrokerRequest};
use crate::registry::DesktopRegistry;
use crate::transport::{cancel_pair, Transport};
use crate::types::{ConnectionState, Desktop, DesktopConnection};

/// Lifecycle command for one desktop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DesktopAction {
    Connect,
    Reconnect,
    Reset,
    Rollback,
    KillSession,
    Logoff,
}

/// Executes lifecycle actions, serialized per desktop name.
pub struct ActionExecutor {
    transport: Arc<dyn Transport>,
    registry: Arc<DesktopRegistry>,
    /// One lock per desktop name; created on first use.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ActionExecutor {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<DesktopRegistry>) -> Self {
        Self {
            transport,
            registry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run one action against the named desktop.
    ///
    /// Returns the negotiated [`DesktopConnection`] for Connect /
    /// Reconnect, `None` for everything else.
    pub async fn execute(
        &self,
        action: DesktopAction,
        name: &str,
    ) -> BrokerResult<Option<DesktopConnection>> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let desktop = self
            .registry
            .get(name)
            .ok_or_else(|| BrokerError::not_found(format!("No desktop named '{name}'")))?;

        Self::check_precondition(action, &desktop)?;

        log::info!("Executing {action:?} on desktop '{name}'");
        match action {
            DesktopAction::Connect | DesktopAction::Reconnect => {
                let connection = self.negotiate_connection(&desktop).await?;
                self.registry
                    .set_connection_state(name, ConnectionState::Connecting);
                Ok(Some(connection))
            }
            DesktopAction::Reset => {
                self.expect_done(BrokerRequest::ResetDesktop { name: name.to_string() })
                    .await?;
                Ok(None)
            }
            DesktopAction::Rollback => {
                self.expect_done(BrokerRequest::RollbackDesktop { name: name.to_string() })
                    .await?;
                Ok(None)
            }
            DesktopAction::KillSession => {
                self.expect_done(BrokerRequest::KillSession {
                    session_id: desktop.session_id.clone(),
                })
                .await?;
                Ok(None)
            }
            DesktopAction::Logoff => {
                self.expect_done(BrokerRequest::LogoffSession {
                    session_id: desktop.session_id.clone(),
                })
                .await?;
                Ok(None)
            }
        }
    }

    fn check_precondition(action: DesktopAction, desktop: &Desktop) -> BrokerResult<()> {
        let permitted = match action {
            DesktopAction::Connect | DesktopAction::Reconnect => desktop.can_connect(),
            DesktopAction::Reset => desktop.can_reset(),
            DesktopAction::Rollback => desktop.can_rollback(),
            DesktopAction::KillSession => desktop.can_kill_session(),
            DesktopAction::Logoff => desktop.can_logoff(),
        };
        if permitted {
            Ok(())
        } else {
            Err(BrokerError::not_permitted(format!(
                "{action:?} is not permitted for desktop '{}' (status {:?}, connection {:?}, offline {:?})",
                desktop.name, desktop.status, desktop.connection_state, desktop.offline_state
            )))
        }
    }

    async fn negotiate_connection(&self, desktop: &Desktop) -> BrokerResult<DesktopConnection> {
        let protocol = if desktop.selected_protocol.is_empty() {
            // Server-preference order: first listed protocol wins.
            desktop.protocols.first().cloned().unwrap_or_default()
        } else {
            desktop.selected_protocol.clone()
        };

        let reply = self
            .send(BrokerRequest::GetDesktopConnection {
                name: desktop.name.clone(),
                protocol,
            })
            .await?;
        match reply {
            BrokerReply::Connection(connection) => Ok(connection),
            other => Err(BrokerError::parse(format!(
                "Expected a desktop connection, got {other:?}"
            ))),
        }
    }

    async fn expect_done(&self, request: BrokerRequest) -> BrokerResult<()> {
        match self.send(request).await? {
            BrokerReply::Done => Ok(()),
            other => Err(BrokerError::parse(format!(
                "Expected an acknowledgement, got {other:?}"
            ))),
        }
    }

    async fn send(&self, request: BrokerRequest) -> BrokerResult<BrokerReply> {
        // Actions are not cancellable mid-flight; the pair lives for
        // the duration of the call.
        let (_source, token) = cancel_pair();
        self.transport.send(request, token).await
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CancelToken;
    use crate::types::{DesktopStatus, OfflineState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Transport double that counts calls and optionally sleeps to make
    /// overlap observable.
    struct CountingTransport {
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl CountingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), delay: None })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), delay: Some(delay) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(
            &self,
            request: BrokerRequest,
            _cancel: CancelToken,
        ) -> BrokerResult<BrokerReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(match request {
                BrokerRequest::GetDesktopConnection { protocol, .. } => {
                    BrokerReply::Connection(DesktopConnection {
                        address: "10.0.0.5".into(),
                        port: 4172,
                        ticket: "ticket-1".into(),
                        protocol,
                    })
                }
                _ => BrokerReply::Done,
            })
        }
    }

    fn registry_with(desktops: Vec<Desktop>) -> Arc<DesktopRegistry> {
        let registry = Arc::new(DesktopRegistry::new());
        registry.replace_all(desktops, "");
        registry
    }

    fn connectable(name: &str) -> Desktop {
        let mut d = Desktop::new(name);
        d.status = DesktopStatus::AvailableRemote;
        d.protocols = vec!["PCOIP".into(), "RDP".into()];
        d
    }

    #[tokio::test]
    async fn connect_returns_connection_and_marks_connecting() {
        let transport = CountingTransport::new();
        let registry = registry_with(vec![connectable("A")]);
        let executor = ActionExecutor::new(transport.clone(), registry.clone());

        let connection = executor
            .execute(DesktopAction::Connect, "A")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connection.port, 4172);
        // Server-preference order: first listed protocol.
        assert_eq!(connection.protocol, "PCOIP");
        assert_eq!(
            registry.get("A").unwrap().connection_state,
            ConnectionState::Connecting
        );
    }

    #[tokio::test]
    async fn selected_protocol_overrides_server_preference() {
        let transport = CountingTransport::new();
        let registry = registry_with(vec![connectable("A")]);
        registry.set_selected_protocol("A", "RDP").unwrap();
        let executor = ActionExecutor::new(transport, registry);

        let connection = executor
            .execute(DesktopAction::Connect, "A")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connection.protocol, "RDP");
    }

    #[tokio::test]
    async fn reset_while_connecting_is_rejected_without_a_broker_call() {
        let transport = CountingTransport::new();
        let mut d = connectable("A");
        d.connection_state = ConnectionState::Connecting;
        let registry = registry_with(vec![d]);
        let executor = ActionExecutor::new(transport.clone(), registry);

        let err = executor.execute(DesktopAction::Reset, "A").await.unwrap_err();
        assert_eq!(err.kind, crate::error::BrokerErrorKind::ActionNotPermitted);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn rollback_requires_checked_out() {
        let transport = CountingTransport::new();
        let registry = registry_with(vec![connectable("A")]);
        let executor = ActionExecutor::new(transport.clone(), registry.clone());

        let err = executor
            .execute(DesktopAction::Rollback, "A")
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::BrokerErrorKind::ActionNotPermitted);
        assert_eq!(transport.calls(), 0);

        let mut d = connectable("A");
        d.offline_state = OfflineState::CheckedOut;
        registry.replace_all(vec![d], "");
        executor.execute(DesktopAction::Rollback, "A").await.unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn kill_session_requires_a_session() {
        let transport = CountingTransport::new();
        let registry = registry_with(vec![connectable("A")]);
        let executor = ActionExecutor::new(transport.clone(), registry.clone());

        let err = executor
            .execute(DesktopAction::KillSession, "A")
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::BrokerErrorKind::ActionNotPermitted);

        let mut d = connectable("A");
        d.session_id = "sess-7".into();
        registry.replace_all(vec![d], "");
        executor
            .execute(DesktopAction::KillSession, "A")
            .await
            .unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_desktop_is_not_found() {
        let transport = CountingTransport::new();
        let registry = registry_with(vec![]);
        let executor = ActionExecutor::new(transport, registry);

        let err = executor.execute(DesktopAction::Connect, "ghost").await.unwrap_err();
        assert_eq!(err.kind, crate::error::BrokerErrorKind::NotFound);
    }

    #[tokio::test]
    async fn same_desktop_actions_are_serialized() {
        let transport = CountingTransport::slow(Duration::from_millis(50));
        let registry = registry_with(vec![connectable("A")]);
        let executor = Arc::new(ActionExecutor::new(transport, registry));

        let start = tokio::time::Instant::now();
        let a = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(DesktopAction::Connect, "A").await })
        };
        let b = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(DesktopAction::Connect, "A").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        // Two 50 ms calls on the same name cannot overlap.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn different_desktops_run_concurrently() {
        let transport = CountingTransport::slow(Duration::from_millis(50));
        let registry = registry_with(vec![connectable("A"), connectable("B")]);
        let executor = Arc::new(ActionExecutor::new(transport, registry));

        let start = tokio::time::Instant::now();
        let a = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(DesktopAction::Connect, "A").await })
        };
        let b = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(DesktopAction::Connect, "B").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        // Distinct names overlap; well under two serialized calls.
        assert!(start.elapsed() < Duration::from_millis(95));
    }
}
