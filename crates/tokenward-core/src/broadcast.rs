//! Sign-in/sign-out propagation between execution contexts.
//!
//! Contexts that share one logical user session open the same named channel
//! on a [`BroadcastHub`]. Only events travel across it, never state. Delivery
//! is best effort: a slow subscriber that lags behind the channel capacity
//! skips the events it missed.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default channel identifier shared by all contexts of one session.
pub const DEFAULT_CHANNEL_NAME: &str = "auth";

/// Buffer size for each named channel.
/// Sign-in/out events are rare, 16 leaves room for bursts.
const CHANNEL_CAPACITY: usize = 16;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEvent {
    SignedIn,
    SignedOut,
}

impl SessionEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            SessionEvent::SignedIn => "signedIn",
            SessionEvent::SignedOut => "signedOut",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SessionEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signedIn" => Ok(SessionEvent::SignedIn),
            "signedOut" => Ok(SessionEvent::SignedOut),
            other => Err(format!("unknown session event tag: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Envelope {
    origin: u64,
    event: SessionEvent,
}

/// Registry of named cross-context channels.
#[derive(Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a handle on `name` for a new execution context.
    pub fn open(&self, name: &str) -> SessionBroadcast {
        let tx = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        SessionBroadcast {
            name: Arc::from(name),
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }
}

/// One execution context's handle on a session channel.
///
/// Clones share the same origin, so they never hear each other's posts.
#[derive(Clone)]
pub struct SessionBroadcast {
    name: Arc<str>,
    origin: u64,
    tx: broadcast::Sender<Envelope>,
}

impl SessionBroadcast {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget publish to every sibling context.
    pub fn post(&self, event: SessionEvent) {
        let envelope = Envelope {
            origin: self.origin,
            event,
        };
        match self.tx.send(envelope) {
            Ok(receivers) => debug!(channel = %self.name, %event, receivers, "Posted session event"),
            Err(_) => debug!(channel = %self.name, %event, "Posted session event with no listeners"),
        }
    }

    /// Raw stream of events posted by other contexts.
    pub fn subscribe(&self) -> SessionEvents {
        SessionEvents {
            name: self.name.clone(),
            origin: self.origin,
            rx: self.tx.subscribe(),
        }
    }

    /// Dispatch incoming events through `handlers` until the subscription drops.
    pub fn on_message(&self, handlers: SessionEventHandlers) -> Subscription {
        let mut events = self.subscribe();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                handlers.dispatch(event);
            }
        });
        Subscription { handle }
    }
}

/// Receiving half of a [`SessionBroadcast`].
pub struct SessionEvents {
    name: Arc<str>,
    origin: u64,
    rx: broadcast::Receiver<Envelope>,
}

impl SessionEvents {
    /// Next event from a sibling context, or `None` once the channel closes.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.origin == self.origin => continue,
                Ok(envelope) => return Some(envelope.event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.name, skipped, "Session event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if envelope.origin == self.origin => continue,
                Ok(envelope) => return Some(envelope.event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(channel = %self.name, skipped, "Session event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

type Handler = Box<dyn Fn() + Send + Sync>;

/// One handler per event variant.
#[derive(Default)]
pub struct SessionEventHandlers {
    signed_in: Option<Handler>,
    signed_out: Option<Handler>,
}

impl SessionEventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_signed_in(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.signed_in = Some(Box::new(handler));
        self
    }

    pub fn on_signed_out(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.signed_out = Some(Box::new(handler));
        self
    }

    pub fn dispatch(&self, event: SessionEvent) {
        let handler = match event {
            SessionEvent::SignedIn => &self.signed_in,
            SessionEvent::SignedOut => &self.signed_out,
        };
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// Listener task started by [`SessionBroadcast::on_message`]. Stops on drop.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_event_tags() {
        assert_eq!(SessionEvent::SignedIn.tag(), "signedIn");
        assert_eq!(SessionEvent::SignedOut.to_string(), "signedOut");
        assert_eq!("signedOut".parse::<SessionEvent>(), Ok(SessionEvent::SignedOut));
        assert!("signOut".parse::<SessionEvent>().is_err());
        assert_eq!(
            serde_json::to_string(&SessionEvent::SignedIn).unwrap(),
            "\"signedIn\""
        );
    }

    #[tokio::test]
    async fn test_sibling_receives_but_sender_does_not() {
        let hub = BroadcastHub::new();
        let tab_a = hub.open(DEFAULT_CHANNEL_NAME);
        let tab_b = hub.open(DEFAULT_CHANNEL_NAME);

        let mut a_events = tab_a.subscribe();
        let mut b_events = tab_b.subscribe();

        tab_a.post(SessionEvent::SignedOut);

        assert_eq!(b_events.recv().await, Some(SessionEvent::SignedOut));
        assert_eq!(a_events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_channels_are_isolated_by_name() {
        let hub = BroadcastHub::new();
        let auth = hub.open("auth");
        let other = hub.open("other");
        assert_eq!(auth.name(), "auth");
        assert_eq!(other.name(), "other");
        let mut other_events = other.subscribe();

        auth.post(SessionEvent::SignedIn);
        assert_eq!(other_events.try_recv(), None);
    }

    #[test]
    fn test_handler_table_dispatch() {
        let signed_in = Arc::new(AtomicUsize::new(0));
        let signed_out = Arc::new(AtomicUsize::new(0));

        let handlers = {
            let signed_in = signed_in.clone();
            let signed_out = signed_out.clone();
            SessionEventHandlers::new()
                .on_signed_in(move || {
                    signed_in.fetch_add(1, Ordering::SeqCst);
                })
                .on_signed_out(move || {
                    signed_out.fetch_add(1, Ordering::SeqCst);
                })
        };

        handlers.dispatch(SessionEvent::SignedOut);
        handlers.dispatch(SessionEvent::SignedOut);
        handlers.dispatch(SessionEvent::SignedIn);

        assert_eq!(signed_in.load(Ordering::SeqCst), 1);
        assert_eq!(signed_out.load(Ordering::SeqCst), 2);

        // Missing handlers are a no-op
        SessionEventHandlers::new().dispatch(SessionEvent::SignedIn);
    }

    #[tokio::test]
    async fn test_on_message_runs_handlers_until_dropped() {
        let hub = BroadcastHub::new();
        let tab_a = hub.open(DEFAULT_CHANNEL_NAME);
        let tab_b = hub.open(DEFAULT_CHANNEL_NAME);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = tab_b.on_message(SessionEventHandlers::new().on_signed_out(move || {
            let _ = tx.send(SessionEvent::SignedOut);
        }));
        assert!(subscription.is_active());

        tab_a.post(SessionEvent::SignedOut);
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(SessionEvent::SignedOut));

        drop(subscription);
        // Handler (and its sender) is gone once the task is aborted
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(closed, None);
    }
}
