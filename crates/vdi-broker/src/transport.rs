//! Broker transport — cancellable HTTPS round trips with session-cookie
//! persistence.
//!
//! The session state machine talks to the broker exclusively through the
//! [`Transport`] trait, so tests can substitute a scripted double. The
//! production implementation, [`HttpsTransport`], POSTs typed requests to
//! `https://{host}:{port}/broker/request` and keeps the broker session
//! cookie across calls, optionally mirroring it to a cookie file so a
//! relaunched client can resume the same broker session.

use crate::error::{BrokerError, BrokerErrorKind, BrokerResult};
use crate::protocol::{BrokerReply, BrokerRequest};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fires every in-flight round trip issued under the paired tokens.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Clonable token observed by transport implementations.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a linked cancel source/token pair.
pub fn cancel_pair() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
}

impl CancelSource {
    /// Signal cancellation to every token cloned from this pair.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// Whether cancellation has already been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires (or the source is dropped).
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // An Err means the source is gone; treat that as cancellation
        // so no round trip can outlive its session cycle.
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One broker round trip. Implementations must honour the cancel token
/// promptly and return `Cancelled` rather than a late result.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: BrokerRequest,
        cancel: CancelToken,
    ) -> BrokerResult<BrokerReply>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  HTTPS implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persisted form of the broker session cookie.
#[derive(serde::Serialize, serde::Deserialize)]
struct CookieRecord {
    cookie: String,
}

/// Production transport over the broker's HTTPS endpoint.
pub struct HttpsTransport {
    client: Client,
    base_url: String,
    /// Broker session cookie, replayed on every call once obtained.
    cookie: RwLock<Option<String>>,
    cookie_file: RwLock<Option<PathBuf>>,
}

impl HttpsTransport {
    /// Build a new transport (no broker contact yet).
    pub fn new(host: &str, port: u16, insecure: bool, timeout_secs: u64) -> BrokerResult<Self> {
        // The session cookie is stored and replayed by hand (it must
        // survive in a cookie file); reqwest's own jar stays off so
        // only one Cookie header can ever be attached.
        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| BrokerError::transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            cookie: RwLock::new(None),
            cookie_file: RwLock::new(None),
        })
    }

    /// Base URL for broker calls.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Persist/replay the session cookie through `path`. Loads an
    /// existing cookie immediately, best-effort.
    pub fn set_cookie_file(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CookieRecord>(&raw) {
                Ok(rec) => {
                    log::debug!("Loaded broker session cookie from {}", path.display());
                    *self.cookie.write().unwrap() = Some(rec.cookie);
                }
                Err(e) => log::warn!("Ignoring malformed cookie file {}: {e}", path.display()),
            },
            Err(_) => {} // no cookie yet
        }
        *self.cookie_file.write().unwrap() = Some(path);
    }

    /// Current session cookie, if any.
    pub fn session_cookie(&self) -> Option<String> {
        self.cookie.read().unwrap().clone()
    }

    /// Drop the stored session cookie (and its file copy).
    pub fn clear_cookie(&self) {
        *self.cookie.write().unwrap() = None;
        if let Some(path) = self.cookie_file.read().unwrap().as_ref() {
            let _ = std::fs::remove_file(path);
        }
    }

    fn store_cookie(&self, value: String) {
        if let Some(path) = self.cookie_file.read().unwrap().as_ref() {
            let rec = CookieRecord { cookie: value.clone() };
            match serde_json::to_string(&rec) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(path, json) {
                        log::warn!("Failed to write cookie file {}: {e}", path.display());
                    }
                }
                Err(e) => log::warn!("Failed to encode cookie record: {e}"),
            }
        }
        *self.cookie.write().unwrap() = Some(value);
    }

    async fn post_request(&self, request: &BrokerRequest) -> BrokerResult<BrokerReply> {
        let url = format!("{}/broker/request", self.base_url);
        let mut builder = self.client.post(&url).json(request);
        if let Some(cookie) = self.session_cookie() {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }

        let resp = builder.send().await?;

        // Replay any refreshed broker session cookie on later calls.
        if let Some(set) = resp.headers().get(reqwest::header::SET_COOKIE) {
            if let Ok(value) = set.to_str() {
                // Keep only the name=value pair, not the attributes.
                if let Some(pair) = value.split(';').next() {
                    self.store_cookie(pair.to_string());
                }
            }
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED => {
                    BrokerError::rejected(format!("Broker rejected credentials: {body}"))
                }
                StatusCode::FORBIDDEN => BrokerError::not_permitted(format!(
                    "Broker refused the operation: {body}"
                )),
                StatusCode::NOT_FOUND => {
                    BrokerError::not_found(format!("Unknown broker resource: {body}"))
                }
                _ => BrokerError::api(status.as_u16(), format!("Broker error {status}: {body}")),
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| BrokerError::parse(format!("Failed to read broker response: {e}")))?;

        serde_json::from_str(&text).map_err(|e| {
            BrokerError::parse(format!(
                "Broker response decode error: {e} — body: {}",
                &text[..text.len().min(500)]
            ))
        })
    }
}

#[async_trait]
impl Transport for HttpsTransport {
    async fn send(
        &self,
        request: BrokerRequest,
        mut cancel: CancelToken,
    ) -> BrokerResult<BrokerReply> {
        if cancel.is_cancelled() {
            return Err(BrokerError::cancelled("Round trip cancelled before send"));
        }

        let op = request.op_name();
        log::debug!("Broker round trip: {op}");

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::debug!("Broker round trip cancelled: {op}");
                Err(BrokerError::cancelled(format!("Round trip cancelled: {op}")))
            }

            result = self.post_request(&request) => {
                match &result {
                    Ok(_) => log::debug!("Broker round trip complete: {op}"),
                    Err(e) if e.kind == BrokerErrorKind::Transport => {
                        log::warn!("Broker unreachable during {op}: {}", e.message)
                    }
                    Err(e) => log::debug!("Broker round trip failed: {op}: {e}"),
                }
                result
            }
        }
    }
}
