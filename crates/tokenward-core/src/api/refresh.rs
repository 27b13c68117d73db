//! Single-flight credential refresh.
//!
//! When a protected call fails because its access token expired, the
//! coordinator makes sure exactly one refresh exchange runs no matter how many
//! calls fail at the same time. Every failing caller is parked as a
//! [`PendingWaiter`] in a FIFO queue; when the exchange settles the whole
//! queue is resolved in arrival order, either with the new access token or
//! with the refresh error, and the coordinator returns to idle.
//!
//! Refresh tokens are often single-use, so N concurrent refreshes would
//! invalidate each other. The queue is flushed on every settlement, so no
//! waiter is ever dropped or resolved twice.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::auth::{Credential, TokenStore};
use crate::broadcast::{SessionBroadcast, SessionEvent};

use super::ApiError;

/// Identity-server call that trades a refresh token for a new credential pair.
#[async_trait]
pub trait RefreshExchange: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, ApiError>;
}

/// Why a refresh cycle ended without a new credential.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RefreshFailure {
    Denied(String),
    TimedOut,
}

impl From<RefreshFailure> for ApiError {
    fn from(failure: RefreshFailure) -> Self {
        match failure {
            RefreshFailure::Denied(reason) => ApiError::RefreshDenied(reason),
            RefreshFailure::TimedOut => ApiError::RefreshTimedOut,
        }
    }
}

type OnRefreshed = Box<dyn FnOnce(String) + Send>;
type SessionEndHook = Box<dyn Fn() + Send + Sync>;
type OnRefreshFailed = Box<dyn FnOnce(ApiError) + Send>;

/// A caller parked behind the in-flight refresh.
///
/// Consumed by value on resolution, so each waiter fires exactly one of its
/// two continuations. Continuations run on the refresh task in queue order,
/// after the coordinator is already idle again; re-enqueueing from inside one
/// starts a new cycle.
pub struct PendingWaiter {
    on_refreshed: OnRefreshed,
    on_refresh_failed: OnRefreshFailed,
}

impl PendingWaiter {
    pub fn new(
        on_refreshed: impl FnOnce(String) + Send + 'static,
        on_refresh_failed: impl FnOnce(ApiError) + Send + 'static,
    ) -> Self {
        Self {
            on_refreshed: Box::new(on_refreshed),
            on_refresh_failed: Box::new(on_refresh_failed),
        }
    }

    /// Waiter that forwards its outcome into a oneshot channel.
    fn channel() -> (Self, oneshot::Receiver<Result<String, ApiError>>) {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_failed = tx.clone();
        let waiter = Self::new(
            move |token| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(token));
                }
            },
            move |err| {
                if let Some(tx) = tx_failed.lock().take() {
                    let _ = tx.send(Err(err));
                }
            },
        );
        (waiter, rx)
    }

    fn resolve(self, outcome: &Result<String, RefreshFailure>) {
        match outcome {
            Ok(token) => (self.on_refreshed)(token.clone()),
            Err(failure) => (self.on_refresh_failed)(failure.clone().into()),
        }
    }
}

/// In-flight flag plus its waiter queue.
///
/// `waiters` is non-empty only while `in_flight` is true.
#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: VecDeque<PendingWaiter>,
}

struct Inner {
    store: Arc<dyn TokenStore>,
    exchange: Arc<dyn RefreshExchange>,
    broadcast: Option<SessionBroadcast>,
    timeout: Option<Duration>,
    default_token: RwLock<Option<String>>,
    /// Refreshed credential the store failed to persist; authoritative until
    /// a save succeeds or the session changes.
    unpersisted: Mutex<Option<Credential>>,
    session_end_hook: RwLock<Option<SessionEndHook>>,
    state: Mutex<RefreshState>,
}

/// Per-context refresh coordinator.
/// Clone is cheap - all clones share one refresh state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    /// Create a coordinator for one execution context.
    ///
    /// `broadcast` is `None` for contexts without siblings (server-side
    /// request handling); sign-out events are then not published.
    pub fn new(
        store: Arc<dyn TokenStore>,
        exchange: Arc<dyn RefreshExchange>,
        broadcast: Option<SessionBroadcast>,
    ) -> Self {
        let default_token = match store.load() {
            Ok(credential) => credential.map(|c| c.access_token),
            Err(e) => {
                warn!(error = %e, "Failed to load stored credential");
                None
            }
        };

        Self {
            inner: Arc::new(Inner {
                store,
                exchange,
                broadcast,
                timeout: None,
                default_token: RwLock::new(default_token),
                unpersisted: Mutex::new(None),
                session_end_hook: RwLock::new(None),
                state: Mutex::new(RefreshState::default()),
            }),
        }
    }

    /// Bound how long queued callers wait on a refresh exchange.
    ///
    /// Must be called before the coordinator is cloned or shared.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.timeout = Some(timeout),
            None => warn!("Refresh timeout ignored: coordinator already shared"),
        }
        self
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.store
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.state.lock().in_flight
    }

    /// Access token to attach to the next outbound call.
    ///
    /// Re-reads the store so a credential written by another context is
    /// picked up; falls back to the in-memory default if the store fails.
    /// A refreshed credential that could not be persisted wins over the
    /// store until it is saved.
    pub fn access_token(&self) -> Option<String> {
        let unpersisted = self.inner.unpersisted.lock().clone();
        if let Some(credential) = unpersisted {
            self.inner.persist(&credential);
            *self.inner.default_token.write() = Some(credential.access_token.clone());
            return Some(credential.access_token);
        }

        match self.inner.store.load() {
            Ok(credential) => {
                let token = credential.map(|c| c.access_token);
                *self.inner.default_token.write() = token.clone();
                token
            }
            Err(e) => {
                warn!(error = %e, "Failed to read credential store, using cached token");
                self.inner.default_token.read().clone()
            }
        }
    }

    /// Adopt a credential the caller has already persisted.
    pub fn set_access_token(&self, token: String) {
        *self.inner.unpersisted.lock() = None;
        *self.inner.default_token.write() = Some(token);
    }

    pub fn clear_access_token(&self) {
        *self.inner.unpersisted.lock() = None;
        *self.inner.default_token.write() = None;
    }

    /// Run `hook` in this context whenever the coordinator ends the session
    /// (refresh denied or credential rejected). Replaces any previous hook.
    pub fn on_session_end(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.session_end_hook.write() = Some(Box::new(hook));
    }

    /// Run a protected call, recovering transparently from token expiry.
    ///
    /// `call` receives the access token to attach. An `ExpiredCredential`
    /// failure parks this caller behind the (single) refresh and replays the
    /// call once with the new token. `Unauthorized` ends the session without
    /// a refresh attempt. Every other outcome is returned unchanged.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T, ApiError>
    where
        F: Fn(Option<String>) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match call(self.access_token()).await {
            Err(ApiError::ExpiredCredential) => {
                debug!("Access credential expired, waiting for refresh");
                let token = self.wait_for_refresh().await?;
                match call(Some(token)).await {
                    Err(ApiError::ExpiredCredential) => {
                        warn!("Replayed call rejected a freshly refreshed credential");
                        let err = ApiError::Unauthorized(
                            "refreshed credential rejected as expired".to_string(),
                        );
                        self.end_session(&err);
                        Err(err)
                    }
                    Err(err @ ApiError::Unauthorized(_)) => {
                        self.end_session(&err);
                        Err(err)
                    }
                    other => other,
                }
            }
            Err(err @ ApiError::Unauthorized(_)) => {
                self.end_session(&err);
                Err(err)
            }
            other => other,
        }
    }

    /// Park the caller until the current (or a newly started) refresh settles.
    pub async fn wait_for_refresh(&self) -> Result<String, ApiError> {
        let (waiter, rx) = PendingWaiter::channel();
        self.enqueue(waiter);
        rx.await.unwrap_or_else(|_| {
            Err(ApiError::RefreshDenied("refresh task ended without a result".to_string()))
        })
    }

    /// Queue `waiter` behind the refresh, starting one if none is in flight.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(&self, waiter: PendingWaiter) {
        let start = {
            let mut state = self.inner.state.lock();
            state.waiters.push_back(waiter);
            let start = !state.in_flight;
            state.in_flight = true;
            debug!(queued = state.waiters.len(), start, "Waiter enqueued");
            start
        };

        if start {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.run_refresh().await });
        }
    }

    /// Tear down the session after a fatal credential rejection.
    fn end_session(&self, reason: &ApiError) {
        info!(reason = %reason, "Ending session");
        self.inner.clear_session();
    }
}

impl Inner {
    async fn run_refresh(&self) {
        info!("Refreshing access credential");
        let outcome = self.exchange_once().await;

        match &outcome {
            Ok(credential) => {
                self.persist(credential);
                *self.default_token.write() = Some(credential.access_token.clone());
            }
            Err(RefreshFailure::Denied(reason)) => {
                warn!(reason = %reason, "Credential refresh denied");
                self.clear_session();
            }
            Err(RefreshFailure::TimedOut) => {
                warn!("Credential refresh timed out, keeping stored credential");
            }
        }

        let waiters = {
            let mut state = self.state.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        debug!(waiters = waiters.len(), success = outcome.is_ok(), "Refresh cycle settled");

        let resolution = outcome
            .as_ref()
            .map(|c| c.access_token.clone())
            .map_err(|f| f.clone());
        for (position, waiter) in waiters.into_iter().enumerate() {
            let resolved =
                std::panic::catch_unwind(AssertUnwindSafe(|| waiter.resolve(&resolution)));
            if resolved.is_err() {
                warn!(position, "Refresh waiter panicked while resolving");
            }
        }
    }

    /// Save `credential`, holding it in memory if the store refuses it.
    fn persist(&self, credential: &Credential) {
        match self.store.save(credential) {
            Ok(()) => *self.unpersisted.lock() = None,
            Err(e) => {
                warn!(error = %e, "Failed to persist refreshed credential, keeping it in memory");
                *self.unpersisted.lock() = Some(credential.clone());
            }
        }
    }

    /// Read the refresh token and run the exchange exactly once.
    async fn exchange_once(&self) -> Result<Credential, RefreshFailure> {
        let unpersisted = self.unpersisted.lock().as_ref().map(|c| c.refresh_token.clone());
        let refresh_token = match unpersisted {
            Some(refresh_token) => refresh_token,
            None => match self.store.load() {
                Ok(Some(credential)) => credential.refresh_token,
                Ok(None) => return Err(RefreshFailure::Denied("no refresh credential stored".to_string())),
                Err(e) => return Err(RefreshFailure::Denied(format!("{:#}", e))),
            },
        };

        let exchange = AssertUnwindSafe(self.exchange.refresh(&refresh_token)).catch_unwind();
        let settled = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(settled) => settled,
                Err(_) => return Err(RefreshFailure::TimedOut),
            },
            None => exchange.await,
        };

        match settled {
            Ok(Ok(credential)) => Ok(credential),
            Ok(Err(e)) => Err(RefreshFailure::Denied(e.to_string())),
            Err(_) => Err(RefreshFailure::Denied("refresh exchange panicked".to_string())),
        }
    }

    fn clear_session(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear credential store");
        }
        *self.unpersisted.lock() = None;
        *self.default_token.write() = None;
        if let Some(ref broadcast) = self.broadcast {
            broadcast.post(SessionEvent::SignedOut);
        }
        if let Some(ref hook) = *self.session_end_hook.read() {
            hook();
        }
    }
}
