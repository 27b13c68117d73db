//! Gate for protected views rendered outside the client context.
//!
//! A server-side render cannot wait on a client-side refresh, so any
//! credential-class failure here ends the session outright.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::ApiError;
use crate::auth::{evaluate, Claims, Credential, RequiredCapability, TokenStore};
use crate::routes::{Redirect, Routes};

#[derive(Debug, PartialEq, Eq)]
pub enum GuardOutcome<T> {
    Render(T),
    Redirect(Redirect),
}

impl<T> GuardOutcome<T> {
    fn redirect(destination: &str) -> Self {
        GuardOutcome::Redirect(Redirect::to(destination))
    }

    pub fn destination(&self) -> Option<&str> {
        match self {
            GuardOutcome::Redirect(r) => Some(&r.destination),
            GuardOutcome::Render(_) => None,
        }
    }

    pub fn into_rendered(self) -> Option<T> {
        match self {
            GuardOutcome::Render(value) => Some(value),
            GuardOutcome::Redirect(_) => None,
        }
    }
}

pub struct RouteGuard {
    store: Arc<dyn TokenStore>,
    routes: Routes,
}

impl RouteGuard {
    pub fn new(store: Arc<dyn TokenStore>, routes: Routes) -> Self {
        Self { store, routes }
    }

    fn stored_credential(&self) -> Option<Credential> {
        match self.store.load() {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Failed to read credential store");
                None
            }
        }
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear credential store");
        }
    }

    /// Run `render` only for an authenticated caller holding `required`.
    ///
    /// - no credential: redirect to the entry point, `render` never runs
    /// - capability check fails: redirect to the landing page
    /// - undecodable token or credential failure from `render`: clear the
    ///   store and redirect to the entry point
    /// - any other failure: redirect to the error page
    pub async fn protect<T, F, Fut>(
        &self,
        required: Option<&RequiredCapability>,
        render: F,
    ) -> GuardOutcome<T>
    where
        F: FnOnce(Credential) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let Some(credential) = self.stored_credential() else {
            debug!("No stored credential, redirecting to entry");
            return GuardOutcome::redirect(&self.routes.entry);
        };

        if let Some(required) = required.filter(|r| !r.is_empty()) {
            match Claims::decode(&credential.access_token) {
                Ok(claims) if !evaluate(&claims, required) => {
                    debug!(subject = %claims.sub, ?required, "Insufficient capability");
                    return GuardOutcome::redirect(&self.routes.landing);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Stored access token is not decodable");
                    self.clear_store();
                    return GuardOutcome::redirect(&self.routes.entry);
                }
            }
        }

        match render(credential).await {
            Ok(value) => GuardOutcome::Render(value),
            Err(e) if e.is_credential_failure() => {
                debug!(error = %e, "Credential rejected during render");
                self.clear_store();
                GuardOutcome::redirect(&self.routes.entry)
            }
            Err(ApiError::InsufficientCapability) => GuardOutcome::redirect(&self.routes.landing),
            Err(e) => {
                warn!(error = %e, "Protected render failed");
                GuardOutcome::redirect(&self.routes.error)
            }
        }
    }

    /// Gate for views meant only for signed-out users, such as the sign-in
    /// form. A stored credential sends the caller to the landing page.
    pub async fn guest<T, F, Fut>(&self, render: F) -> GuardOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        if self.stored_credential().is_some() {
            return GuardOutcome::redirect(&self.routes.landing);
        }

        match render().await {
            Ok(value) => GuardOutcome::Render(value),
            Err(e) => {
                warn!(error = %e, "Guest render failed");
                GuardOutcome::redirect(&self.routes.error)
            }
        }
    }
}
