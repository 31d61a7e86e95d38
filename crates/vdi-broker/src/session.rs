//! Broker session state machine.
//!
//! Drives the authentication conversation one server round trip at a
//! time. The broker decides which factor comes next (passcode, next
//! tokencode, PIN change, disclaimer, certificate, password, password
//! change) — the machine reacts to each challenge, parks in the matching
//! `*Requested` step, emits exactly one event, and resumes when the
//! matching `submit_*` operation supplies the answer.
//!
//! Cancellation uses a request generation counter: `cancel_requests`
//! bumps the generation and fires the watch channel; a round trip whose
//! generation is stale when it completes is dropped without an event, so
//! cancel always wins the race against an in-flight response.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{BrokerError, BrokerErrorKind, BrokerResult};
use crate::events::{EventReceiver, EventSender, SessionEvent};
use crate::protocol::{AuthChallenge, BrokerReply, BrokerRequest};
use crate::registry::DesktopRegistry;
use crate::transport::{cancel_pair, CancelSource, CancelToken, Transport};
use crate::types::{ConnectionState, SessionConfig};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the negotiation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    Idle,
    BrokerRequested,
    PasscodeRequested,
    TokencodeRequested,
    PinChangeRequested,
    DisclaimerRequested,
    CertificateRequested,
    PasswordRequested,
    PasswordChangeRequested,
    DesktopsRequested,
    Authenticated,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

struct StepState {
    step: SessionStep,
    /// A round trip is in flight; no second Submit is accepted.
    outstanding: bool,
    /// Broker address of the current negotiation.
    address: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One broker session: negotiation state, authenticated identity (held
/// as the transport's session cookie), and the desktop registry.
pub struct BrokerSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    registry: Arc<DesktopRegistry>,
    events: EventSender,
    state: Mutex<StepState>,
    cancel: Mutex<(CancelSource, CancelToken)>,
    generation: AtomicU64,
    in_flight: AtomicUsize,
}

impl BrokerSession {
    /// Create a session; the returned receiver is the event channel's
    /// consuming half.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = crate::events::channel();
        let session = Self {
            transport,
            config,
            registry: Arc::new(DesktopRegistry::new()),
            events,
            state: Mutex::new(StepState {
                step: SessionStep::Idle,
                outstanding: false,
                address: String::new(),
            }),
            cancel: Mutex::new(cancel_pair()),
            generation: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        };
        (session, receiver)
    }

    /// Current negotiation step.
    pub fn step(&self) -> SessionStep {
        self.state.lock().unwrap().step
    }

    /// Broker address of the current negotiation.
    pub fn address(&self) -> String {
        self.state.lock().unwrap().address.clone()
    }

    /// Whether the negotiation finished successfully.
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.step(),
            SessionStep::Authenticated
                | SessionStep::Connecting
                | SessionStep::Connected
                | SessionStep::Disconnected
        )
    }

    /// The session's desktop registry.
    pub fn registry(&self) -> &Arc<DesktopRegistry> {
        &self.registry
    }

    /// Session configuration (read-only).
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── Public operations ───────────────────────────────────────────

    /// Start the negotiation with the broker at `address`.
    ///
    /// Valid only from `Idle`. Emits one event per completed round trip;
    /// a transport failure fails the whole session (retrying is the
    /// caller's policy, never the machine's).
    pub async fn connect(&self, address: &str) -> BrokerResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.step != SessionStep::Idle {
                return Err(BrokerError::sequence(format!(
                    "Connect is only valid from Idle (currently {:?})",
                    state.step
                )));
            }
            if state.outstanding {
                return Err(BrokerError::sequence("A broker request is already in flight"));
            }
            state.step = SessionStep::BrokerRequested;
            state.outstanding = true;
            state.address = address.to_string();
        }

        log::info!("Connecting to broker {address}");
        self.emit(SessionEvent::BrokerRequested);

        let request = BrokerRequest::StartSession {
            default_user: self.config.default_user.clone(),
            default_domain: self.config.default_domain.clone(),
        };
        let result = self.round_trip(request).await;
        self.finish_round_trip(result, true).await
    }

    /// Abort any in-flight round trip and return to `Idle`.
    ///
    /// Returns the number of cancelled operations. A response arriving
    /// for a cancelled request is dropped without an event.
    pub fn cancel_requests(&self) -> usize {
        let cancelled = self.in_flight.load(Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut cancel = self.cancel.lock().unwrap();
            cancel.0.cancel();
            *cancel = cancel_pair();
        }
        {
            let mut state = self.state.lock().unwrap();
            state.step = SessionStep::Idle;
            state.outstanding = false;
        }
        if cancelled > 0 {
            log::info!("Cancelled {cancelled} in-flight broker request(s)");
        }
        cancelled
    }

    /// Answer a passcode challenge.
    pub async fn submit_username_passcode(
        &self,
        username: &str,
        passcode: &str,
    ) -> BrokerResult<()> {
        self.submit(
            SessionStep::PasscodeRequested,
            BrokerRequest::SubmitPasscode {
                username: username.to_string(),
                passcode: passcode.to_string(),
            },
        )
        .await
    }

    /// Answer a next-tokencode challenge.
    pub async fn submit_next_tokencode(&self, tokencode: &str) -> BrokerResult<()> {
        self.submit(
            SessionStep::TokencodeRequested,
            BrokerRequest::SubmitNextTokencode {
                tokencode: tokencode.to_string(),
            },
        )
        .await
    }

    /// Answer a PIN-change challenge. Both entries must match; a
    /// mismatch is a local validation failure and never reaches the
    /// broker.
    pub async fn submit_pin(&self, pin1: &str, pin2: &str) -> BrokerResult<()> {
        if pin1 != pin2 {
            return Err(BrokerError::validation("PINs do not match"));
        }
        if pin1.is_empty() {
            return Err(BrokerError::validation("PIN must not be empty"));
        }
        self.submit(
            SessionStep::PinChangeRequested,
            BrokerRequest::SubmitPin { pin: pin1.to_string() },
        )
        .await
    }

    /// Accept the broker's disclaimer text.
    pub async fn accept_disclaimer(&self) -> BrokerResult<()> {
        self.submit(SessionStep::DisclaimerRequested, BrokerRequest::AcceptDisclaimer)
            .await
    }

    /// Answer a certificate challenge with the chosen identity.
    pub async fn submit_certificate_identity(&self, identity: &str) -> BrokerResult<()> {
        self.submit(
            SessionStep::CertificateRequested,
            BrokerRequest::SubmitCertificate {
                identity: identity.to_string(),
            },
        )
        .await
    }

    /// Answer a password challenge.
    pub async fn submit_username_password(
        &self,
        username: &str,
        password: &str,
        domain: &str,
    ) -> BrokerResult<()> {
        self.submit(
            SessionStep::PasswordRequested,
            BrokerRequest::SubmitPassword {
                username: username.to_string(),
                password: password.to_string(),
                domain: domain.to_string(),
            },
        )
        .await
    }

    /// Answer a password-change challenge. The confirmation must equal
    /// the new password; a mismatch never reaches the broker.
    pub async fn submit_password_change(
        &self,
        old_password: &str,
        new_password: &str,
        confirm: &str,
    ) -> BrokerResult<()> {
        if new_password != confirm {
            return Err(BrokerError::validation("Password confirmation does not match"));
        }
        self.submit(
            SessionStep::PasswordChangeRequested,
            BrokerRequest::ChangePassword {
                old_password: old_password.to_string(),
                new_password: new_password.to_string(),
            },
        )
        .await
    }

    /// Refresh the desktop registry. Valid only once authenticated;
    /// replaces the registry atomically, preserving the current
    /// selection by name where possible.
    pub async fn load_desktops(&self) -> BrokerResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.step != SessionStep::Authenticated {
                return Err(BrokerError::sequence(format!(
                    "LoadDesktops requires an authenticated session (currently {:?})",
                    state.step
                )));
            }
            if state.outstanding {
                return Err(BrokerError::sequence("A broker request is already in flight"));
            }
            state.outstanding = true;
        }

        let result = self.round_trip(BrokerRequest::GetDesktops).await;
        match result {
            Ok(None) => Ok(()),
            Ok(Some(BrokerReply::Desktops { desktops })) => {
                let selected = self.registry.replace_all(desktops, "");
                log::info!(
                    "Desktop list refreshed: {} entries, selected {:?}",
                    self.registry.len(),
                    selected
                );
                self.emit(SessionEvent::DesktopsUpdated);
                Ok(())
            }
            Ok(Some(other)) => Err(BrokerError::parse(format!(
                "Expected a desktop list, got {other:?}"
            ))),
            Err(e) if e.is_retryable() => {
                self.fail_session(&e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// End the broker session. Best-effort at the broker; the session
    /// returns to `Idle` regardless of the broker's answer.
    pub async fn logout(&self) -> BrokerResult<()> {
        {
            let state = self.state.lock().unwrap();
            if !matches!(
                state.step,
                SessionStep::Authenticated
                    | SessionStep::Connecting
                    | SessionStep::Connected
                    | SessionStep::Disconnected
            ) {
                return Err(BrokerError::sequence(format!(
                    "Logout requires an authenticated session (currently {:?})",
                    state.step
                )));
            }
        }

        if let Err(e) = self.round_trip(BrokerRequest::Logout).await {
            log::warn!("Broker logout failed (ignored): {e}");
        }

        {
            let mut state = self.state.lock().unwrap();
            state.step = SessionStep::Idle;
            state.outstanding = false;
        }
        log::info!("Logged out of broker {}", self.address());
        self.emit(SessionEvent::Disconnected);
        Ok(())
    }

    // ── Connection bookkeeping (used by the service layer) ──────────

    /// A remoting launch for `name` has started.
    pub fn mark_connecting(&self, name: &str) {
        self.registry.set_connection_state(name, ConnectionState::Connecting);
        self.state.lock().unwrap().step = SessionStep::Connecting;
    }

    /// The remoting client for `name` is up.
    pub fn mark_connected(&self, name: &str) {
        self.registry.set_connection_state(name, ConnectionState::Connected);
        self.state.lock().unwrap().step = SessionStep::Connected;
    }

    /// The remoting client for `name` has gone away.
    pub fn mark_disconnected(&self, name: &str) {
        self.registry.set_connection_state(name, ConnectionState::Disconnected);
        self.state.lock().unwrap().step = SessionStep::Disconnected;
        self.emit(SessionEvent::Disconnected);
    }

    /// A remoting connection for `desktop` has been negotiated; tell
    /// the front end to hand it to the launcher.
    pub fn launch_ready(&self, desktop: crate::types::Desktop) {
        self.emit(SessionEvent::LaunchDesktop(desktop));
    }

    /// The remoting tunnel dropped; the broker session itself may still
    /// be alive.
    pub fn tunnel_disconnected(&self, reason: &str) {
        log::warn!("Tunnel disconnected: {reason}");
        self.emit(SessionEvent::TunnelDisconnected {
            reason: reason.to_string(),
        });
    }

    // ── Internals ───────────────────────────────────────────────────

    /// The step a challenge parks the session in.
    fn challenge_step(challenge: &AuthChallenge) -> SessionStep {
        match challenge {
            AuthChallenge::Passcode { .. } => SessionStep::PasscodeRequested,
            AuthChallenge::NextTokencode { .. } => SessionStep::TokencodeRequested,
            AuthChallenge::PinChange { .. } => SessionStep::PinChangeRequested,
            AuthChallenge::Disclaimer { .. } => SessionStep::DisclaimerRequested,
            AuthChallenge::Certificate { .. } => SessionStep::CertificateRequested,
            AuthChallenge::Password { .. } => SessionStep::PasswordRequested,
            AuthChallenge::PasswordChange { .. } => SessionStep::PasswordChangeRequested,
        }
    }

    fn challenge_event(challenge: AuthChallenge) -> SessionEvent {
        match challenge {
            AuthChallenge::Passcode { username, user_selectable } => {
                SessionEvent::PasscodeRequested { username, user_selectable }
            }
            AuthChallenge::NextTokencode { username } => {
                SessionEvent::NextTokencodeRequested { username }
            }
            AuthChallenge::PinChange { pin, message, user_selectable } => {
                SessionEvent::PinChangeRequested { pin, message, user_selectable }
            }
            AuthChallenge::Disclaimer { text } => SessionEvent::DisclaimerRequested { text },
            AuthChallenge::Certificate { issuers } => {
                SessionEvent::CertificateRequested { issuers }
            }
            AuthChallenge::Password { username, read_only, domains, suggested_domain } => {
                SessionEvent::PasswordRequested { username, read_only, domains, suggested_domain }
            }
            AuthChallenge::PasswordChange { username, domain } => {
                SessionEvent::PasswordChangeRequested { username, domain }
            }
        }
    }

    /// Submit skeleton shared by every credential operation: verify the
    /// session is parked in `expected` with nothing outstanding, run the
    /// round trip, then apply the broker's reply.
    async fn submit(&self, expected: SessionStep, request: BrokerRequest) -> BrokerResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.outstanding {
                return Err(BrokerError::sequence("A broker request is already in flight"));
            }
            if state.step != expected {
                return Err(BrokerError::sequence(format!(
                    "{} is not valid in step {:?}",
                    request.op_name(),
                    state.step
                )));
            }
            state.outstanding = true;
        }

        let result = self.round_trip(request).await;
        self.finish_round_trip(result, false).await
    }

    /// Common tail of `connect` and `submit`: fold the reply into the
    /// machine. The outstanding flag was already released by
    /// `round_trip` (current-generation completions only).
    ///
    /// `fail_on_any_error` is set for `connect`, where no `*Requested`
    /// step exists to return to.
    async fn finish_round_trip(
        &self,
        result: BrokerResult<Option<BrokerReply>>,
        fail_on_any_error: bool,
    ) -> BrokerResult<()> {
        match result {
            // Cancelled: cancel_requests already reset the machine.
            Ok(None) => Ok(()),
            Ok(Some(reply)) => self.apply_reply(reply).await,
            Err(e) if e.kind == BrokerErrorKind::AuthenticationRejected && !fail_on_any_error => {
                // Same *Requested step; the caller may correct input
                // and resubmit. No event.
                Err(e)
            }
            Err(e) if e.is_retryable() || fail_on_any_error => {
                self.fail_session(&e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Fold one broker reply into the machine, emitting its event.
    async fn apply_reply(&self, reply: BrokerReply) -> BrokerResult<()> {
        match reply {
            BrokerReply::Challenge(challenge) => {
                let step = Self::challenge_step(&challenge);
                log::debug!("Broker challenge → {step:?}");
                self.state.lock().unwrap().step = step;
                self.emit(Self::challenge_event(challenge));
                Ok(())
            }
            BrokerReply::Authenticated => {
                log::info!("Authenticated with broker {}", self.address());
                self.state.lock().unwrap().step = SessionStep::DesktopsRequested;
                self.emit(SessionEvent::DesktopsRequested);
                self.fetch_initial_desktops().await
            }
            other => {
                let e = BrokerError::parse(format!(
                    "Unexpected broker reply during negotiation: {other:?}"
                ));
                self.fail_session(&e);
                Err(e)
            }
        }
    }

    /// First desktop fetch, performed by the machine itself right after
    /// authentication (the `DesktopsRequested → Authenticated` leg).
    async fn fetch_initial_desktops(&self) -> BrokerResult<()> {
        let result = self.round_trip(BrokerRequest::GetDesktops).await;
        match result {
            Ok(None) => Ok(()),
            Ok(Some(BrokerReply::Desktops { desktops })) => {
                let selected = self.registry.replace_all(desktops, "");
                log::info!(
                    "Entitled to {} desktop(s), selected {:?}",
                    self.registry.len(),
                    selected
                );
                self.state.lock().unwrap().step = SessionStep::Authenticated;
                self.emit(SessionEvent::DesktopsUpdated);
                Ok(())
            }
            Ok(Some(other)) => {
                let e = BrokerError::parse(format!("Expected a desktop list, got {other:?}"));
                self.fail_session(&e);
                Err(e)
            }
            Err(e) => {
                self.fail_session(&e);
                Err(e)
            }
        }
    }

    /// One cancellable round trip. `Ok(None)` means the request was
    /// cancelled — the caller must not emit anything for it.
    async fn round_trip(&self, request: BrokerRequest) -> BrokerResult<Option<BrokerReply>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let token = self.cancel.lock().unwrap().1.clone();

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.transport.send(request, token).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // Cancel wins: a stale-generation response is silently dropped
        // even when it raced the cancellation and completed. It must
        // not touch the machine either — the outstanding flag may
        // already belong to a request started after the cancel.
        if self.generation.load(Ordering::SeqCst) != generation {
            return Ok(None);
        }
        self.clear_outstanding();
        match result {
            Ok(reply) => Ok(Some(reply)),
            Err(e) if e.kind == BrokerErrorKind::Cancelled => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn clear_outstanding(&self) {
        self.state.lock().unwrap().outstanding = false;
    }

    fn fail_session(&self, error: &BrokerError) {
        log::warn!("Session failed: {error}");
        self.state.lock().unwrap().step = SessionStep::Failed;
        self.emit(SessionEvent::Failed {
            message: error.message.clone(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            log::warn!("Session event dropped: receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AuthChallenge;
    use crate::types::Desktop;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Semaphore;

    /// Scripted transport double: pops one pre-programmed reply per
    /// call and records every operation name. When gated, each call
    /// waits for a permit before replying, so tests can hold a round
    /// trip in flight.
    struct ScriptedTransport {
        replies: Mutex<VecDeque<BrokerResult<BrokerReply>>>,
        calls: Mutex<Vec<String>>,
        gate: Option<Arc<Semaphore>>,
        honor_cancel: bool,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<BrokerResult<BrokerReply>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
                gate: None,
                honor_cancel: true,
            })
        }

        fn gated(replies: Vec<BrokerResult<BrokerReply>>) -> (Arc<Self>, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let t = Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
                gate: Some(gate.clone()),
                honor_cancel: true,
            });
            (t, gate)
        }

        /// Gated double that sits on the gate even after cancellation,
        /// standing in for a transport whose response races the cancel
        /// and completes late.
        fn gated_ignoring_cancel(
            replies: Vec<BrokerResult<BrokerReply>>,
        ) -> (Arc<Self>, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let t = Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
                gate: Some(gate.clone()),
                honor_cancel: false,
            });
            (t, gate)
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            request: BrokerRequest,
            mut cancel: CancelToken,
        ) -> BrokerResult<BrokerReply> {
            self.calls.lock().unwrap().push(request.op_name().to_string());
            if let Some(gate) = &self.gate {
                if self.honor_cancel {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(BrokerError::cancelled("gated call cancelled"));
                        }
                        permit = gate.acquire() => {
                            permit.unwrap().forget();
                        }
                    }
                } else {
                    gate.acquire().await.unwrap().forget();
                }
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BrokerError::transport("script exhausted")))
        }
    }

    fn password_challenge() -> BrokerResult<BrokerReply> {
        Ok(BrokerReply::Challenge(AuthChallenge::Password {
            username: "alice".into(),
            read_only: false,
            domains: vec!["CORP".into()],
            suggested_domain: "CORP".into(),
        }))
    }

    fn desktops_reply(names: &[&str]) -> BrokerResult<BrokerReply> {
        Ok(BrokerReply::Desktops {
            desktops: names.iter().map(|n| Desktop::new(*n)).collect(),
        })
    }

    fn drain(rx: &mut EventReceiver) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn password_flow_reaches_authenticated() {
        let transport = ScriptedTransport::new(vec![
            password_challenge(),
            Ok(BrokerReply::Authenticated),
            desktops_reply(&["Dev Desktop", "Win11"]),
        ]);
        let (session, mut rx) = BrokerSession::new(transport.clone(), SessionConfig::default());

        session.connect("view.corp.example").await.unwrap();
        assert_eq!(session.step(), SessionStep::PasswordRequested);

        session
            .submit_username_password("alice", "s3cret", "CORP")
            .await
            .unwrap();
        assert_eq!(session.step(), SessionStep::Authenticated);
        assert_eq!(session.registry().len(), 2);
        assert_eq!(session.registry().selected().as_deref(), Some("Dev Desktop"));

        let events = drain(&mut rx);
        assert!(matches!(events[0], SessionEvent::BrokerRequested));
        assert!(matches!(events[1], SessionEvent::PasswordRequested { .. }));
        assert!(matches!(events[2], SessionEvent::DesktopsRequested));
        assert!(matches!(events[3], SessionEvent::DesktopsUpdated));
        assert_eq!(events.len(), 4);

        assert_eq!(
            transport.calls(),
            vec!["startSession", "submitPassword", "getDesktops"]
        );
    }

    #[tokio::test]
    async fn multi_factor_chain_is_broker_driven() {
        let transport = ScriptedTransport::new(vec![
            Ok(BrokerReply::Challenge(AuthChallenge::Passcode {
                username: "alice".into(),
                user_selectable: true,
            })),
            Ok(BrokerReply::Challenge(AuthChallenge::NextTokencode {
                username: "alice".into(),
            })),
            Ok(BrokerReply::Challenge(AuthChallenge::Disclaimer {
                text: "Authorized use only".into(),
            })),
            Ok(BrokerReply::Authenticated),
            desktops_reply(&["Dev Desktop"]),
        ]);
        let (session, mut rx) = BrokerSession::new(transport, SessionConfig::default());

        session.connect("view.corp.example").await.unwrap();
        assert_eq!(session.step(), SessionStep::PasscodeRequested);
        session.submit_username_passcode("alice", "1234").await.unwrap();
        assert_eq!(session.step(), SessionStep::TokencodeRequested);
        session.submit_next_tokencode("5678").await.unwrap();
        assert_eq!(session.step(), SessionStep::DisclaimerRequested);
        session.accept_disclaimer().await.unwrap();
        assert_eq!(session.step(), SessionStep::Authenticated);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 6); // broker, passcode, tokencode, disclaimer, desktops req, updated
    }

    #[tokio::test]
    async fn wrong_submit_is_a_sequence_error_and_changes_nothing() {
        let transport = ScriptedTransport::new(vec![password_challenge()]);
        let (session, _rx) = BrokerSession::new(transport.clone(), SessionConfig::default());

        session.connect("view.corp.example").await.unwrap();
        let calls_before = transport.calls().len();

        let err = session.submit_pin("11", "11").await.unwrap_err();
        assert_eq!(err.kind, BrokerErrorKind::ProtocolSequence);
        assert_eq!(session.step(), SessionStep::PasswordRequested);
        assert_eq!(transport.calls().len(), calls_before);

        let err = session.accept_disclaimer().await.unwrap_err();
        assert_eq!(err.kind, BrokerErrorKind::ProtocolSequence);
        assert_eq!(session.step(), SessionStep::PasswordRequested);
    }

    #[tokio::test]
    async fn connect_requires_idle() {
        let transport = ScriptedTransport::new(vec![password_challenge()]);
        let (session, _rx) = BrokerSession::new(transport, SessionConfig::default());

        session.connect("view.corp.example").await.unwrap();
        let err = session.connect("other.example").await.unwrap_err();
        assert_eq!(err.kind, BrokerErrorKind::ProtocolSequence);
    }

    #[tokio::test]
    async fn pin_mismatch_never_reaches_the_broker() {
        let transport = ScriptedTransport::new(vec![Ok(BrokerReply::Challenge(
            AuthChallenge::PinChange {
                pin: String::new(),
                message: "Choose a PIN".into(),
                user_selectable: true,
            },
        ))]);
        let (session, _rx) = BrokerSession::new(transport.clone(), SessionConfig::default());

        session.connect("view.corp.example").await.unwrap();
        let calls_before = transport.calls().len();

        let err = session.submit_pin("1111", "2222").await.unwrap_err();
        assert_eq!(err.kind, BrokerErrorKind::Validation);
        assert_eq!(session.step(), SessionStep::PinChangeRequested);
        assert_eq!(transport.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn password_change_confirm_mismatch_is_local() {
        let transport = ScriptedTransport::new(vec![Ok(BrokerReply::Challenge(
            AuthChallenge::PasswordChange {
                username: "alice".into(),
                domain: "CORP".into(),
            },
        ))]);
        let (session, _rx) = BrokerSession::new(transport.clone(), SessionConfig::default());

        session.connect("view.corp.example").await.unwrap();
        let calls_before = transport.calls().len();

        let err = session
            .submit_password_change("old", "new1", "new2")
            .await
            .unwrap_err();
        assert_eq!(err.kind, BrokerErrorKind::Validation);
        assert_eq!(session.step(), SessionStep::PasswordChangeRequested);
        assert_eq!(transport.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn rejected_credentials_allow_reentry() {
        let transport = ScriptedTransport::new(vec![
            password_challenge(),
            Err(BrokerError::rejected("bad password")),
            Ok(BrokerReply::Authenticated),
            desktops_reply(&["Dev Desktop"]),
        ]);
        let (session, mut rx) = BrokerSession::new(transport, SessionConfig::default());

        session.connect("view.corp.example").await.unwrap();
        drain(&mut rx);

        let err = session
            .submit_username_password("alice", "wrong", "CORP")
            .await
            .unwrap_err();
        assert_eq!(err.kind, BrokerErrorKind::AuthenticationRejected);
        assert_eq!(session.step(), SessionStep::PasswordRequested);
        // Rejection produces no event.
        assert!(drain(&mut rx).is_empty());

        session
            .submit_username_password("alice", "right", "CORP")
            .await
            .unwrap();
        assert_eq!(session.step(), SessionStep::Authenticated);
    }

    #[tokio::test]
    async fn transport_failure_fails_the_session() {
        let transport =
            ScriptedTransport::new(vec![Err(BrokerError::transport("connection refused"))]);
        let (session, mut rx) = BrokerSession::new(transport, SessionConfig::default());

        let err = session.connect("view.corp.example").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.step(), SessionStep::Failed);

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(SessionEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn cancel_suppresses_stale_responses() {
        let (transport, gate) = ScriptedTransport::gated(vec![password_challenge()]);
        let (session, mut rx) = BrokerSession::new(transport, SessionConfig::default());
        let session = Arc::new(session);

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("view.corp.example").await })
        };

        // Wait for the round trip to be in flight, then cancel.
        while session.state.lock().unwrap().step != SessionStep::BrokerRequested
            || session.in_flight.load(Ordering::SeqCst) == 0
        {
            tokio::task::yield_now().await;
        }
        drain(&mut rx); // BrokerRequested fired before the round trip

        let cancelled = session.cancel_requests();
        assert_eq!(cancelled, 1);
        assert_eq!(session.step(), SessionStep::Idle);

        // Release the gated reply — it must be dropped, no event.
        gate.add_permits(1);
        task.await.unwrap().unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.step(), SessionStep::Idle);
    }

    #[tokio::test]
    async fn stale_completion_leaves_a_newer_requests_flag_alone() {
        let (transport, gate) = ScriptedTransport::gated_ignoring_cancel(vec![
            password_challenge(), // consumed by the cancelled attempt
            password_challenge(), // the live attempt
        ]);
        let (session, mut rx) = BrokerSession::new(transport, SessionConfig::default());
        let session = Arc::new(session);

        let stale = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("view.corp.example").await })
        };
        while session.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        // The transport ignores the token, so the old round trip stays
        // parked on the gate across the cancel.
        session.cancel_requests();

        let live = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("view.corp.example").await })
        };
        while session.in_flight.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert!(session.state.lock().unwrap().outstanding);

        // Semaphore permits are handed out in FIFO order: this releases
        // the stale round trip, whose completion must be dropped.
        gate.add_permits(1);
        stale.await.unwrap().unwrap();
        assert!(
            session.state.lock().unwrap().outstanding,
            "stale completion cleared the live request's flag"
        );

        gate.add_permits(1);
        live.await.unwrap().unwrap();
        assert_eq!(session.step(), SessionStep::PasswordRequested);
        assert!(!session.state.lock().unwrap().outstanding);
        drain(&mut rx);
    }

    #[tokio::test]
    async fn second_submit_while_outstanding_is_rejected() {
        let (transport, gate) = ScriptedTransport::gated(vec![
            password_challenge(),
            Ok(BrokerReply::Authenticated),
            desktops_reply(&["Dev Desktop"]),
        ]);
        gate.add_permits(1); // let connect through
        let (session, _rx) = BrokerSession::new(transport, SessionConfig::default());
        let session = Arc::new(session);

        session.connect("view.corp.example").await.unwrap();

        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                session.submit_username_password("alice", "pw", "CORP").await
            })
        };
        while session.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let err = session
            .submit_username_password("alice", "pw", "CORP")
            .await
            .unwrap_err();
        assert_eq!(err.kind, BrokerErrorKind::ProtocolSequence);

        gate.add_permits(2); // auth reply + desktop fetch
        task.await.unwrap().unwrap();
        assert_eq!(session.step(), SessionStep::Authenticated);
    }

    #[tokio::test]
    async fn load_desktops_preserves_selection() {
        let transport = ScriptedTransport::new(vec![
            Ok(BrokerReply::Authenticated),
            desktops_reply(&["A", "B", "C"]),
            desktops_reply(&["B", "C", "D"]),
        ]);
        let (session, _rx) = BrokerSession::new(transport, SessionConfig::default());

        session.connect("view.corp.example").await.unwrap();
        session.registry().select("B").unwrap();

        session.load_desktops().await.unwrap();
        assert_eq!(session.registry().selected().as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn load_desktops_requires_authentication() {
        let transport = ScriptedTransport::new(vec![]);
        let (session, _rx) = BrokerSession::new(transport, SessionConfig::default());
        let err = session.load_desktops().await.unwrap_err();
        assert_eq!(err.kind, BrokerErrorKind::ProtocolSequence);
    }

    #[tokio::test]
    async fn logout_is_best_effort() {
        let transport = ScriptedTransport::new(vec![
            Ok(BrokerReply::Authenticated),
            desktops_reply(&["A"]),
            Err(BrokerError::transport("broker went away")),
        ]);
        let (session, mut rx) = BrokerSession::new(transport, SessionConfig::default());

        session.connect("view.corp.example").await.unwrap();
        drain(&mut rx);

        session.logout().await.unwrap();
        assert_eq!(session.step(), SessionStep::Idle);
        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [SessionEvent::Disconnected]));
    }
}
