use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::api::{ApiError, IdentityService, RefreshCoordinator, SignIn};
use crate::broadcast::{SessionBroadcast, SessionEvent, SessionEventHandlers, Subscription};
use crate::routes::{Navigator, Routes};

use super::capability::{evaluate, RequiredCapability};
use super::session::Session;

/// Session state and lifecycle for one execution context.
pub struct AuthContext {
    identity: Arc<dyn IdentityService>,
    coordinator: RefreshCoordinator,
    broadcast: SessionBroadcast,
    navigator: Arc<dyn Navigator>,
    routes: Routes,
    session: RwLock<Option<Session>>,
}

impl AuthContext {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        coordinator: RefreshCoordinator,
        broadcast: SessionBroadcast,
        navigator: Arc<dyn Navigator>,
        routes: Routes,
    ) -> Self {
        Self {
            identity,
            coordinator,
            broadcast,
            navigator,
            routes,
            session: RwLock::new(None),
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn user(&self) -> Option<Session> {
        self.session.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.read().is_some()
    }

    /// Whether the signed-in user holds `required`. False when signed out.
    pub fn can(&self, required: &RequiredCapability) -> bool {
        self.session
            .read()
            .as_ref()
            .is_some_and(|session| evaluate(session, required))
    }

    /// Exchange plaintext credentials for a token pair and open a session.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let SignIn { credential, session } = match self.identity.sign_in(email, password).await {
            Ok(sign_in) => sign_in,
            Err(e) => {
                warn!(email = email, error = %e, "Sign-in failed");
                return Err(e);
            }
        };

        self.coordinator
            .store()
            .save(&credential)
            .map_err(|e| ApiError::Storage(format!("{:#}", e)))?;
        self.coordinator.set_access_token(credential.access_token);
        *self.session.write() = Some(session.clone());

        info!(email = email, "Signed in");
        self.broadcast.post(SessionEvent::SignedIn);
        self.navigator.navigate(&self.routes.landing);
        Ok(session)
    }

    /// Drop the credential everywhere and tell sibling contexts.
    ///
    /// Safe to call when already signed out: the empty store is cleared again
    /// and `SignedOut` is still broadcast.
    pub fn sign_out(&self) {
        if let Err(e) = self.coordinator.store().clear() {
            warn!(error = %e, "Failed to clear credential store");
        }
        self.coordinator.clear_access_token();
        *self.session.write() = None;

        info!("Signed out");
        self.broadcast.post(SessionEvent::SignedOut);
        self.navigator.navigate(&self.routes.entry);
    }

    /// Rebuild the session from a stored credential, if there is one.
    ///
    /// The identity lookup runs through the coordinator, so an expired access
    /// token is refreshed first. Any failure signs the context out.
    pub async fn restore(&self) -> Option<Session> {
        match self.coordinator.store().load() {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("No stored credential to restore");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read credential store");
                return None;
            }
        }

        let identity = self.identity.as_ref();
        match self.coordinator.execute(move |token| identity.me(token)).await {
            Ok(session) => {
                debug!(email = %session.subject_email, "Session restored");
                *self.session.write() = Some(session.clone());
                Some(session)
            }
            // The coordinator already tore the session down
            Err(e @ (ApiError::RefreshDenied(_) | ApiError::Unauthorized(_))) => {
                warn!(error = %e, "Stored credential rejected");
                *self.session.write() = None;
                None
            }
            Err(e) => {
                warn!(error = %e, "Identity lookup failed");
                self.sign_out();
                None
            }
        }
    }

    /// Wire this context to its siblings and to the coordinator.
    ///
    /// - sibling `SignedOut`: drop the session, go to the entry point
    /// - sibling `SignedIn`: drop the session and reload everything, since the
    ///   other context's credential may differ from ours
    /// - coordinator ends the session: same as a sibling `SignedOut`
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let on_end = Arc::downgrade(self);
        self.coordinator.on_session_end(move || {
            if let Some(ctx) = on_end.upgrade() {
                ctx.handle_signed_out();
            }
        });

        let on_out = Arc::downgrade(self);
        let on_in = Arc::downgrade(self);
        self.broadcast.on_message(
            SessionEventHandlers::new()
                .on_signed_out(move || {
                    if let Some(ctx) = on_out.upgrade() {
                        ctx.handle_signed_out();
                    }
                })
                .on_signed_in(move || {
                    if let Some(ctx) = on_in.upgrade() {
                        ctx.handle_signed_in();
                    }
                }),
        )
    }

    fn handle_signed_out(&self) {
        debug!("Session ended elsewhere");
        self.coordinator.clear_access_token();
        *self.session.write() = None;
        self.navigator.navigate(&self.routes.entry);
    }

    fn handle_signed_in(&self) {
        debug!("Session started elsewhere, reloading");
        *self.session.write() = None;
        self.navigator.reload();
    }
}
