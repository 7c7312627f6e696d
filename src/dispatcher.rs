//! The event dispatcher: a listener registry keyed by event name, plus
//! typed waiters built on top of `once` registration.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{error, trace};

use crate::envelope::Envelope;

/// The catch-all event name fired for every received frame, before the
/// typed event for the same frame.
pub const CATCH_ALL: &str = "message";

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;
pub type ListenerId = u64;

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    handler: Handler,
    once: bool,
}

/// Listener registry plus waiter helpers. Cheaply cloneable: all state is
/// behind a [`DashMap`], so handles can be shared across the reader task,
/// the protocol state machine, and caller code.
#[derive(Clone, Default)]
pub struct Dispatcher {
    listeners: Arc<DashMap<String, Vec<ListenerEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str, handler: Handler, once: bool) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .entry(name.to_string())
            .or_default()
            .push(ListenerEntry { id, handler, once });
        id
    }

    /// Register a persistent handler for `name`.
    pub fn on(&self, name: &str, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> ListenerId {
        self.register(name, Arc::new(handler), false)
    }

    /// Register a handler that fires at most once, removed after delivery.
    pub fn once(&self, name: &str, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> ListenerId {
        self.register(name, Arc::new(handler), true)
    }

    pub fn remove(&self, name: &str, id: ListenerId) {
        if let Some(mut entries) = self.listeners.get_mut(name) {
            entries.retain(|e| e.id != id);
        }
    }

    pub fn remove_all(&self, name: &str) {
        self.listeners.remove(name);
    }

    /// Invoke every handler registered for `name`, in registration order.
    /// A handler panic is caught and logged; it never stops subsequent
    /// handlers for the same event.
    pub fn emit(&self, name: &str, envelope: &Envelope) {
        let snapshot = match self.listeners.get(name) {
            Some(entries) => entries.clone(),
            None => return,
        };

        let mut fired_once = Vec::new();
        for entry in &snapshot {
            let handler = entry.handler.clone();
            let result = catch_unwind(AssertUnwindSafe(|| handler(envelope)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!(event = name, %message, "handler error");
            }
            if entry.once {
                fired_once.push(entry.id);
            }
        }

        if !fired_once.is_empty() {
            if let Some(mut entries) = self.listeners.get_mut(name) {
                entries.retain(|e| !fired_once.contains(&e.id));
            }
        }
    }

    /// Fire the catch-all `message` event, then the typed event named by
    /// the envelope's `msg_type`, and finally (for `BUS`/`SHARED_BUS`
    /// payloads) the nested event named by `BusMessage.msg_type`.
    pub fn dispatch_envelope(&self, envelope: &Envelope) {
        trace!(msg_type = %envelope.msg_type, "dispatching envelope");
        self.emit(CATCH_ALL, envelope);
        self.emit(&envelope.msg_type.to_string(), envelope);
        if let Some(nested) = envelope.payload.nested_msg_type() {
            self.emit(nested, envelope);
        }
    }

    /// Block up to `timeout` for the next envelope delivered under `name`.
    pub async fn wait_for_envelope(&self, name: &str, timeout: Duration) -> Option<Envelope> {
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let id = self.once(name, move |envelope| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(envelope.clone());
            }
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => Some(envelope),
            _ => {
                self.remove(name, id);
                None
            }
        }
    }

    /// Like [`wait_for_envelope`](Self::wait_for_envelope), but only
    /// resolves when the envelope's nested payload carries
    /// `payload_type` as its own `msg_type`; otherwise it re-arms for the
    /// same event.
    pub async fn wait_for_nested(
        &self,
        name: &str,
        payload_type: &str,
        timeout: Duration,
    ) -> Option<Envelope> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let current_id = Arc::new(AtomicU64::new(0));

        Self::arm_nested_waiter(
            self.clone(),
            name.to_string(),
            payload_type.to_string(),
            tx,
            current_id.clone(),
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => Some(envelope),
            _ => {
                self.remove(name, current_id.load(Ordering::SeqCst));
                None
            }
        }
    }

    /// Registers a `once` listener on `name` that re-arms itself on the same
    /// dispatcher handle until the nested payload type matches. `current_id`
    /// tracks whichever listener is presently armed, so a timed-out waiter
    /// only removes its own listener, not every handler registered on `name`.
    fn arm_nested_waiter(
        dispatcher: Dispatcher,
        name: String,
        payload_type: String,
        tx: Arc<std::sync::Mutex<Option<oneshot::Sender<Envelope>>>>,
        current_id: Arc<AtomicU64>,
    ) {
        let inner = dispatcher.clone();
        let id = dispatcher.once(&name.clone(), move |envelope| {
            if envelope.payload.nested_msg_type() == Some(payload_type.as_str()) {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(envelope.clone());
                }
            } else {
                Dispatcher::arm_nested_waiter(
                    inner.clone(),
                    name.clone(),
                    payload_type.clone(),
                    tx.clone(),
                    current_id.clone(),
                );
            }
        });
        current_id.store(id, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{BusMessage, Envelope};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_fire_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        dispatcher.on("BUS", move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        dispatcher.on("BUS", move |_| o2.lock().unwrap().push(2));

        let envelope = Envelope::from_bus(BusMessage::new("speak"));
        dispatcher.emit("BUS", &envelope);

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn once_listener_fires_exactly_once() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        dispatcher.once("PING", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let envelope = Envelope::new(crate::envelope::HiveMessageType::Ping, crate::envelope::Payload::Json(serde_json::Value::Null));
        dispatcher.emit("PING", &envelope);
        dispatcher.emit("PING", &envelope);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let dispatcher = Dispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));

        dispatcher.on("BUS", |_| panic!("boom"));
        let r = ran.clone();
        dispatcher.on("BUS", move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let envelope = Envelope::from_bus(BusMessage::new("speak"));
        dispatcher.emit("BUS", &envelope);

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_for_envelope_resolves_on_delivery() {
        let dispatcher = Dispatcher::new();
        let d = dispatcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            d.emit("HELLO", &Envelope::new(crate::envelope::HiveMessageType::Hello, crate::envelope::Payload::Json(serde_json::Value::Null)));
        });

        let result = dispatcher.wait_for_envelope("HELLO", Duration::from_secs(1)).await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn wait_for_envelope_times_out() {
        let dispatcher = Dispatcher::new();
        let result = dispatcher
            .wait_for_envelope("NEVER", Duration::from_millis(20))
            .await;
        assert!(result.is_none());
    }
}
