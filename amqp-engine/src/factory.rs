//! Application boundary: resolving attach requests to message endpoints.
//!
//! When a peer attaches a link, the session asks a [`LinkFactory`] to turn
//! the requested address into either a [`MessageSink`] (the peer sends, we
//! receive) or a [`MessageSource`] (we send). Factories are shared by every
//! connection thread and must be thread-safe; endpoints belong to one link
//! and are only touched from its connection's thread.
//!
//! [`QueueRegistry`] is the in-memory factory used by the server binary.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::delivery::Settlement;
use crate::protocol::{AmqpError, DeliveryId, DeliveryState, Role, SettleMode};
use crate::trace::{debug, warn};

/// A transfer being handed to a sink.
#[derive(Debug, Clone, Copy)]
pub struct InboundDelivery<'a> {
    pub link_name: &'a str,
    pub address: &'a str,
    pub delivery_id: DeliveryId,
    pub delivery_tag: &'a [u8],
    /// Pre-settled: the returned state is not reported back.
    pub settled: bool,
}

/// Consumes messages arriving on a receiving link.
pub trait MessageSink: Send {
    /// Takes one message, streaming its payload, and returns its outcome.
    fn receive(&mut self, delivery: &InboundDelivery<'_>, payload: &mut dyn Read) -> DeliveryState;

    /// The sender settled a delivery this sink already reported on.
    fn settled(&mut self, _settlement: &Settlement) {}

    /// The link is gone.
    fn close(&mut self) {}
}

/// A message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Echoed back in the [`Settlement`].
    pub correlation_id: u64,
    pub payload: Vec<u8>,
}

/// Produces messages for a sending link.
pub trait MessageSource: Send {
    /// Next message to send, if one is ready. Called only when the link has
    /// credit.
    fn next_message(&mut self) -> Option<OutboundMessage>;

    /// The receiver settled a message this source produced.
    fn settled(&mut self, settlement: &Settlement);

    /// The link is gone; anything still unsettled has been released.
    fn close(&mut self) {}
}

/// What a peer asked for in its `attach`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub name: String,
    /// `None` when the peer asks for a dynamic node.
    pub address: Option<String>,
    pub dynamic: bool,
    /// Role of our endpoint.
    pub role: Role,
    pub settle_mode: SettleMode,
}

/// Endpoint matching the local role.
pub enum LinkEndpoint {
    Sink(Box<dyn MessageSink>),
    Source(Box<dyn MessageSource>),
}

/// A successful resolution.
pub struct ResolvedLink {
    /// Node address, which for dynamic nodes was just created.
    pub address: String,
    pub endpoint: LinkEndpoint,
}

/// Why a factory refused an attach.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkRefusal {
    #[error("no node at address {0}")]
    NotFound(String),
    #[error("attach has no address")]
    MissingAddress,
    #[error("{0}")]
    Other(String),
}

impl LinkRefusal {
    /// Error to carry in the refusing `detach`.
    #[must_use]
    pub fn to_amqp_error(&self) -> AmqpError {
        AmqpError::not_found(self.to_string())
    }
}

/// Resolves peer attach requests to application endpoints.
pub trait LinkFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`LinkRefusal`] if the address cannot be served. The peer
    /// then sees its link detached with `amqp:not-found`.
    fn resolve(&self, request: &LinkRequest) -> Result<ResolvedLink, LinkRefusal>;
}

/// Nodes are locked briefly for queue operations; a panic while holding the
/// lock leaves the queue itself consistent, so poisoning is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message on a queue, stamped with its publish order.
#[derive(Debug)]
struct Queued {
    seq: u64,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct NodeState {
    /// Ascending by `seq`.
    messages: VecDeque<Queued>,
    next_seq: u64,
    /// Links currently attached to this node.
    attached: usize,
}

impl NodeState {
    fn push(&mut self, payload: Vec<u8>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.push_back(Queued { seq, payload });
    }

    /// Puts a message back at the position it was published in.
    fn requeue(&mut self, message: Queued) {
        let at = self.messages.partition_point(|m| m.seq < message.seq);
        self.messages.insert(at, message);
    }
}

#[derive(Debug)]
struct Node {
    address: String,
    state: Mutex<NodeState>,
    /// Created on demand; removed once idle and empty.
    transient: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    auto_create: bool,
}

/// In-memory queues keyed by address.
///
/// Receiving links append to a queue; sending links pop from it. Messages a
/// receiver releases or modifies, or that were in flight when their link
/// went away, go back to the place they were published in.
/// Transient nodes (dynamic ones, and auto-created ones once drained) are
/// removed when their last link detaches.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    inner: Arc<RegistryInner>,
}

impl QueueRegistry {
    /// Registry that only serves declared queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that creates a queue for any address attached to.
    #[must_use]
    pub fn with_auto_create() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                nodes: Mutex::default(),
                auto_create: true,
            }),
        }
    }

    /// Declares a durable queue. Declaring an existing address is a no-op.
    pub fn declare(&self, address: &str) {
        lock(&self.inner.nodes)
            .entry(address.to_owned())
            .or_insert_with(|| Arc::new(Self::node(address, false)));
    }

    /// Appends a message to a queue. Returns `false` if there is no such queue.
    pub fn publish(&self, address: &str, payload: Vec<u8>) -> bool {
        let Some(node) = lock(&self.inner.nodes).get(address).cloned() else {
            return false;
        };
        lock(&node.state).push(payload);
        true
    }

    /// Messages waiting in a queue.
    #[must_use]
    pub fn queue_len(&self, address: &str) -> Option<usize> {
        let node = lock(&self.inner.nodes).get(address).cloned()?;
        let len = lock(&node.state).messages.len();
        Some(len)
    }

    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        lock(&self.inner.nodes).contains_key(address)
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner.nodes).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node(address: &str, transient: bool) -> Node {
        Node {
            address: address.to_owned(),
            state: Mutex::default(),
            transient,
        }
    }

    /// Finds or creates the node for a request and counts the attach.
    fn attach(&self, request: &LinkRequest) -> Result<Arc<Node>, LinkRefusal> {
        let mut nodes = lock(&self.inner.nodes);
        let node = if request.dynamic {
            let address = loop {
                let candidate = format!("dynamic-{:016x}", rand::random::<u64>());
                if !nodes.contains_key(&candidate) {
                    break candidate;
                }
            };
            let node = Arc::new(Self::node(&address, true));
            nodes.insert(address, Arc::clone(&node));
            node
        } else {
            let address = request
                .address
                .as_deref()
                .ok_or(LinkRefusal::MissingAddress)?;
            match nodes.get(address) {
                Some(node) => Arc::clone(node),
                None if self.inner.auto_create => {
                    let node = Arc::new(Self::node(address, true));
                    nodes.insert(address.to_owned(), Arc::clone(&node));
                    node
                }
                None => return Err(LinkRefusal::NotFound(address.to_owned())),
            }
        };
        lock(&node.state).attached += 1;
        Ok(node)
    }

    /// Drops one attach from a node, removing it if it is transient and idle.
    fn detach(&self, node: &Node) {
        let mut nodes = lock(&self.inner.nodes);
        let mut state = lock(&node.state);
        state.attached = state.attached.saturating_sub(1);
        if node.transient && state.attached == 0 && state.messages.is_empty() {
            nodes.remove(&node.address);
            debug!(address = %node.address, "removed idle node");
        }
    }
}

impl LinkFactory for QueueRegistry {
    fn resolve(&self, request: &LinkRequest) -> Result<ResolvedLink, LinkRefusal> {
        let node = self.attach(request)?;
        let address = node.address.clone();
        let endpoint = match request.role {
            Role::Receiver => LinkEndpoint::Sink(Box::new(QueueSink {
                registry: self.clone(),
                node: Some(node),
            })),
            Role::Sender => LinkEndpoint::Source(Box::new(QueueSource {
                registry: self.clone(),
                node: Some(node),
                next_correlation: 0,
                in_flight: HashMap::new(),
            })),
        };
        Ok(ResolvedLink { address, endpoint })
    }
}

/// Appends received messages to a queue.
struct QueueSink {
    registry: QueueRegistry,
    node: Option<Arc<Node>>,
}

impl MessageSink for QueueSink {
    fn receive(&mut self, _delivery: &InboundDelivery<'_>, payload: &mut dyn Read) -> DeliveryState {
        let Some(node) = &self.node else {
            return DeliveryState::Released;
        };
        let mut message = Vec::new();
        if let Err(e) = payload.read_to_end(&mut message) {
            warn!(address = %node.address, error = %e, "failed to read payload");
            return DeliveryState::Rejected {
                error: Some(AmqpError::rejected(e.to_string())),
            };
        }
        lock(&node.state).push(message);
        DeliveryState::Accepted
    }

    fn close(&mut self) {
        if let Some(node) = self.node.take() {
            self.registry.detach(&node);
        }
    }
}

impl Drop for QueueSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pops messages off a queue, holding each until it is settled.
struct QueueSource {
    registry: QueueRegistry,
    node: Option<Arc<Node>>,
    next_correlation: u64,
    in_flight: HashMap<u64, Queued>,
}

impl MessageSource for QueueSource {
    fn next_message(&mut self) -> Option<OutboundMessage> {
        let node = self.node.as_ref()?;
        let message = lock(&node.state).messages.pop_front()?;
        let payload = message.payload.clone();
        let correlation_id = self.next_correlation;
        self.next_correlation += 1;
        self.in_flight.insert(correlation_id, message);
        Some(OutboundMessage {
            correlation_id,
            payload,
        })
    }

    fn settled(&mut self, settlement: &Settlement) {
        let Some(message) = self.in_flight.remove(&settlement.correlation_id) else {
            return;
        };
        let requeue = matches!(
            settlement.state,
            DeliveryState::Released
                | DeliveryState::Modified {
                    undeliverable_here: false,
                    ..
                }
        );
        if let (true, Some(node)) = (requeue, &self.node) {
            lock(&node.state).requeue(message);
        }
    }

    fn close(&mut self) {
        let Some(node) = self.node.take() else {
            return;
        };
        if !self.in_flight.is_empty() {
            let mut state = lock(&node.state);
            for (_, message) in self.in_flight.drain() {
                state.requeue(message);
            }
        }
        self.registry.detach(&node);
    }
}

impl Drop for QueueSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(address: Option<&str>, role: Role) -> LinkRequest {
        LinkRequest {
            name: "l".into(),
            address: address.map(str::to_owned),
            dynamic: address.is_none(),
            role,
            settle_mode: SettleMode::AtLeastOnce,
        }
    }

    fn delivery() -> InboundDelivery<'static> {
        InboundDelivery {
            link_name: "l",
            address: "q",
            delivery_id: DeliveryId(0),
            delivery_tag: b"t",
            settled: false,
        }
    }

    fn settlement(correlation_id: u64, state: DeliveryState) -> Settlement {
        Settlement {
            delivery_id: DeliveryId(correlation_id),
            correlation_id,
            txn_id: None,
            state,
        }
    }

    #[test]
    fn undeclared_address_is_refused() {
        let registry = QueueRegistry::new();
        let err = registry
            .resolve(&request(Some("nope"), Role::Receiver))
            .err()
            .unwrap();
        assert_eq!(err, LinkRefusal::NotFound("nope".into()));
        assert_eq!(err.to_amqp_error().condition, crate::protocol::condition::NOT_FOUND);
    }

    #[test]
    fn sink_feeds_source() {
        let registry = QueueRegistry::new();
        registry.declare("q");

        let LinkEndpoint::Sink(mut sink) = registry
            .resolve(&request(Some("q"), Role::Receiver))
            .unwrap()
            .endpoint
        else {
            panic!("expected sink");
        };
        let state = sink.receive(&delivery(), &mut &b"one"[..]);
        assert_eq!(state, DeliveryState::Accepted);
        assert_eq!(registry.queue_len("q"), Some(1));

        let LinkEndpoint::Source(mut source) = registry
            .resolve(&request(Some("q"), Role::Sender))
            .unwrap()
            .endpoint
        else {
            panic!("expected source");
        };
        let message = source.next_message().unwrap();
        assert_eq!(message.payload, b"one");
        assert!(source.next_message().is_none());

        source.settled(&settlement(message.correlation_id, DeliveryState::Accepted));
        assert_eq!(registry.queue_len("q"), Some(0));
    }

    #[test]
    fn released_and_unsettled_messages_requeue_in_order() {
        let registry = QueueRegistry::new();
        registry.declare("q");
        for payload in [b"a", b"b", b"c"] {
            registry.publish("q", payload.to_vec());
        }

        let LinkEndpoint::Source(mut source) = registry
            .resolve(&request(Some("q"), Role::Sender))
            .unwrap()
            .endpoint
        else {
            panic!("expected source");
        };
        let a = source.next_message().unwrap();
        let _b = source.next_message().unwrap();
        let _c = source.next_message().unwrap();

        source.settled(&settlement(a.correlation_id, DeliveryState::Released));
        assert_eq!(registry.queue_len("q"), Some(1));

        // b and c were never settled; closing puts them back after a.
        source.close();
        let LinkEndpoint::Source(mut again) = registry
            .resolve(&request(Some("q"), Role::Sender))
            .unwrap()
            .endpoint
        else {
            panic!("expected source");
        };
        let order: Vec<_> = std::iter::from_fn(|| again.next_message())
            .map(|m| m.payload)
            .collect();
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn releases_in_any_order_restore_publish_order() {
        let registry = QueueRegistry::new();
        registry.declare("q");
        for payload in [b"a", b"b", b"c", b"d"] {
            registry.publish("q", payload.to_vec());
        }
        let LinkEndpoint::Source(mut source) = registry
            .resolve(&request(Some("q"), Role::Sender))
            .unwrap()
            .endpoint
        else {
            panic!("expected source");
        };
        let sent: Vec<_> = (0..3).map(|_| source.next_message().unwrap()).collect();
        for message in &sent {
            source.settled(&settlement(message.correlation_id, DeliveryState::Released));
        }
        registry.publish("q", b"e".to_vec());

        let order: Vec<_> = std::iter::from_fn(|| source.next_message())
            .map(|m| m.payload)
            .collect();
        let expected: Vec<Vec<u8>> = [b"a", b"b", b"c", b"d", b"e"].map(|p| p.to_vec()).into();
        assert_eq!(order, expected);
    }

    #[test]
    fn dynamic_node_removed_after_last_detach() {
        let registry = QueueRegistry::new();
        let resolved = registry.resolve(&request(None, Role::Receiver)).unwrap();
        assert!(resolved.address.starts_with("dynamic-"));
        assert!(registry.contains(&resolved.address));

        drop(resolved);
        assert!(registry.is_empty());
    }

    #[test]
    fn auto_created_node_survives_while_holding_messages() {
        let registry = QueueRegistry::with_auto_create();
        let resolved = registry
            .resolve(&request(Some("auto"), Role::Receiver))
            .unwrap();
        let LinkEndpoint::Sink(mut sink) = resolved.endpoint else {
            panic!("expected sink");
        };
        sink.receive(&delivery(), &mut &b"kept"[..]);
        sink.close();
        assert_eq!(registry.queue_len("auto"), Some(1));

        registry.declare("plain");
        let LinkEndpoint::Sink(mut plain) = registry
            .resolve(&request(Some("plain"), Role::Receiver))
            .unwrap()
            .endpoint
        else {
            panic!("expected sink");
        };
        plain.close();
        assert!(registry.contains("plain"));
    }
}
