//! The slave side of the hive routing protocol: reacts to incoming
//! envelope variants and bridges them with a local message bus.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde_json::Value;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::envelope::{context_keys, BusMessage, Envelope, HiveMessageType, Payload};

/// The local inter-process bus a slave bridges hive envelopes into. A
/// collaborator contract (§6.4): this crate only describes what it
/// consumes from and produces onto it.
pub trait LocalBus: Send + Sync + 'static {
    fn emit(&self, msg_type: &str, data: Value, context: Value);
}

/// Default bus used when the caller doesn't bind one: logs and drops, per
/// "if no local bus is bound, log-and-drop".
pub struct NoopBus;

impl LocalBus for NoopBus {
    fn emit(&self, msg_type: &str, _data: Value, _context: Value) {
        warn!(msg_type, "no local bus bound; dropping");
    }
}

/// Slave-side protocol state machine. Binds to a [`Dispatcher`] by
/// registering handlers for each envelope variant it cares about, mirroring
/// the reference client's `bind()`.
pub struct SlaveProtocol {
    useragent: String,
    share_bus: bool,
    node_id: ArcSwapOption<String>,
    master_pubkey: ArcSwapOption<String>,
    master_peer: ArcSwapOption<String>,
    bus: Arc<dyn LocalBus>,
}

impl SlaveProtocol {
    pub fn new(useragent: impl Into<String>, share_bus: bool, bus: Arc<dyn LocalBus>) -> Arc<Self> {
        Arc::new(Self {
            useragent: useragent.into(),
            share_bus,
            node_id: ArcSwapOption::from(None),
            master_pubkey: ArcSwapOption::from(None),
            master_peer: ArcSwapOption::from(None),
            bus,
        })
    }

    pub fn node_id(&self) -> Option<String> {
        self.node_id.load_full().map(|s| (*s).clone())
    }

    /// Register this protocol's handlers on the dispatcher. Call once per
    /// connection.
    pub fn bind(self: &Arc<Self>, dispatcher: &Dispatcher) {
        let this = Arc::clone(self);
        dispatcher.on("HELLO", move |envelope| this.handle_hello(envelope));

        let this = Arc::clone(self);
        dispatcher.on("BUS", move |envelope| this.handle_bus(envelope));

        let this = Arc::clone(self);
        dispatcher.on("BROADCAST", move |envelope| this.handle_broadcast_or_propagate(envelope));

        let this = Arc::clone(self);
        dispatcher.on("PROPAGATE", move |envelope| this.handle_broadcast_or_propagate(envelope));

        let this = Arc::clone(self);
        dispatcher.on("ESCALATE", move |envelope| this.handle_illegal(envelope));
    }

    /// First `HELLO` binds the master's node id and pubkey; later ones
    /// (other hive members announcing themselves) are ignored.
    fn handle_hello(&self, envelope: &Envelope) {
        if self.node_id.load().is_some() {
            return;
        }
        let Some(hello) = envelope.payload.as_hello() else {
            warn!("HELLO envelope without HelloInfo payload");
            return;
        };
        self.master_pubkey.store(hello.pubkey.clone().map(Arc::new));
        self.master_peer.store(Some(Arc::new(hello.peer.clone())));
        self.node_id.store(Some(Arc::new(hello.node_id.clone())));
        info!(node_id = %hello.node_id, "connected to hive");
    }

    /// Master wants to inject a message into the local bus.
    fn handle_bus(&self, envelope: &Envelope) {
        let Some(bus_msg) = envelope.payload.as_bus() else {
            warn!("BUS envelope without BusMessage payload");
            return;
        };
        let node_id = self.node_id().unwrap_or_default();
        let mut context = bus_msg.context.clone();
        context.insert(context_keys::SOURCE.to_string(), Value::String(node_id));
        self.bus.emit(
            &bus_msg.msg_type,
            Value::Object(bus_msg.data.clone().into_iter().collect()),
            Value::Object(context.into_iter().collect()),
        );
    }

    /// `BROADCAST` and `PROPAGATE` are identical on the slave side: forward
    /// to any local master component by emitting `hive.send.downstream`.
    /// A slave never re-forwards onto the wire.
    fn handle_broadcast_or_propagate(&self, envelope: &Envelope) {
        let node_id = self.node_id().unwrap_or_default();
        let peer = self.master_peer.load_full().map(|p| (*p).clone());
        let serialized = crate::codec::serialize_envelope(envelope).unwrap_or_default();

        let mut context = serde_json::Map::new();
        context.insert(context_keys::SOURCE.to_string(), Value::String(node_id));
        if let Some(peer) = peer {
            context.insert(context_keys::PEER.to_string(), Value::String(peer));
        }

        self.bus.emit(
            "hive.send.downstream",
            Value::String(serialized),
            Value::Object(context),
        );
    }

    /// `ESCALATE` is illegal server->client traffic; log and drop.
    fn handle_illegal(&self, envelope: &Envelope) {
        warn!(msg_type = %envelope.msg_type, "illegal ESCALATE received from server; dropping");
    }

    /// Outgoing direction: a local `hive.send.upstream` event wants to send
    /// `msg_type`/`payload` upstream. `BROADCAST` from a slave is silently
    /// dropped — only masters may broadcast.
    pub fn build_outgoing(&self, msg_type: HiveMessageType, payload: Payload) -> Option<Envelope> {
        if matches!(msg_type, HiveMessageType::Broadcast) {
            return None;
        }
        Some(Envelope::new(msg_type, payload))
    }

    /// Outgoing direction: any local bus message. If `share_bus` is on, it's
    /// wrapped and sent as `SHARED_BUS` for passive master monitoring; if
    /// it's addressed to the master (`context.destination` contains our
    /// `node_id`), it's also sent as `BUS`.
    pub fn handle_outgoing_bus(&self, msg: &BusMessage) -> Vec<Envelope> {
        let mut out = Vec::new();

        if self.share_bus {
            out.push(
                Envelope::new(HiveMessageType::SharedBus, Payload::Bus(msg.clone()))
                    .with_source_peer(self.useragent.clone()),
            );
        }

        if let Some(node_id) = self.node_id() {
            if msg.destinations().iter().any(|d| d == &node_id) {
                out.push(Envelope::new(HiveMessageType::Bus, Payload::Bus(msg.clone())));
            }
        }

        out
    }

    /// Fills `context.source`, `.platform`, `.destination` on an outgoing
    /// `BUS` message if absent, never overwriting existing values.
    pub fn inject_context(&self, msg: &mut BusMessage) {
        msg.context
            .entry(context_keys::SOURCE.to_string())
            .or_insert_with(|| Value::String(self.useragent.clone()));
        msg.context
            .entry(context_keys::PLATFORM.to_string())
            .or_insert_with(|| Value::String(self.useragent.clone()));
        msg.context
            .entry(context_keys::DESTINATION.to_string())
            .or_insert_with(|| Value::String("HiveMind".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingBus {
        events: Mutex<Vec<(String, Value, Value)>>,
    }

    impl RecordingBus {
        fn new() -> Arc<Self> {
            Arc::new(Self { events: Mutex::new(Vec::new()) })
        }
    }

    impl LocalBus for RecordingBus {
        fn emit(&self, msg_type: &str, data: Value, context: Value) {
            self.events.lock().unwrap().push((msg_type.to_string(), data, context));
        }
    }

    #[test]
    fn first_hello_binds_node_id_later_ones_ignored() {
        let bus = RecordingBus::new();
        let protocol = SlaveProtocol::new("test-agent", false, bus);
        let dispatcher = Dispatcher::new();
        protocol.bind(&dispatcher);

        let hello_a = Envelope::new(
            HiveMessageType::Hello,
            Payload::Hello(crate::envelope::HelloInfo {
                node_id: "master-a".to_string(),
                peer: "peer-a".to_string(),
                pubkey: None,
            }),
        );
        dispatcher.emit("HELLO", &hello_a);
        assert_eq!(protocol.node_id(), Some("master-a".to_string()));

        let hello_b = Envelope::new(
            HiveMessageType::Hello,
            Payload::Hello(crate::envelope::HelloInfo {
                node_id: "master-b".to_string(),
                peer: "peer-b".to_string(),
                pubkey: None,
            }),
        );
        dispatcher.emit("HELLO", &hello_b);
        assert_eq!(protocol.node_id(), Some("master-a".to_string()));
    }

    #[test]
    fn broadcast_produces_exactly_one_downstream_event() {
        let bus = RecordingBus::new();
        let protocol = SlaveProtocol::new("test-agent", false, bus.clone());
        let dispatcher = Dispatcher::new();
        protocol.bind(&dispatcher);

        let envelope = Envelope::from_bus(BusMessage::new("speak")).with_source_peer("p1");
        dispatcher.emit("BROADCAST", &envelope);

        let events = bus.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "hive.send.downstream");
    }

    #[test]
    fn escalate_produces_no_bus_event() {
        let bus = RecordingBus::new();
        let protocol = SlaveProtocol::new("test-agent", false, bus.clone());
        let dispatcher = Dispatcher::new();
        protocol.bind(&dispatcher);

        let envelope = Envelope::new(HiveMessageType::Escalate, Payload::Json(Value::Null));
        dispatcher.emit("ESCALATE", &envelope);

        assert!(bus.events.lock().unwrap().is_empty());
    }

    #[test]
    fn build_outgoing_drops_broadcast() {
        let bus = RecordingBus::new();
        let protocol = SlaveProtocol::new("test-agent", false, bus);
        let result = protocol.build_outgoing(HiveMessageType::Broadcast, Payload::Json(Value::Null));
        assert!(result.is_none());
    }

    #[test]
    fn inject_context_fills_defaults_without_overwrite() {
        let bus = RecordingBus::new();
        let protocol = SlaveProtocol::new("test-agent", false, bus);
        let mut msg = BusMessage::new("speak");
        msg.context.insert(context_keys::SOURCE.to_string(), Value::String("explicit".to_string()));

        protocol.inject_context(&mut msg);

        assert_eq!(msg.context_str(context_keys::SOURCE), Some("explicit"));
        assert_eq!(msg.context_str(context_keys::PLATFORM), Some("test-agent"));
        assert_eq!(msg.context_str(context_keys::DESTINATION), Some("HiveMind"));
    }
}
