//! The envelope the core exchanges with the external signal hierarchy.
//!
//! The signal/command/event type hierarchy and its serialization live
//! outside this crate. The core only needs what the envelope carries:
//! a type string, headers, an optional entity address and an opaque
//! payload. Topic and acknowledgement extraction are supplied by the
//! caller through the [`ExtractTopics`] and [`ExtractAcks`] seams.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Signal headers: an ordered string map.
pub type Headers = BTreeMap<String, String>;

/// Well-known header names consumed by the core.
pub mod headers {
    /// Delivery channel marker (`live` or absent/`twin`).
    pub const CHANNEL: &str = "channel";
    /// The value of [`CHANNEL`] marking the live channel.
    pub const LIVE_CHANNEL: &str = "live";
    /// Comma-separated acknowledgement labels requested by the signal.
    pub const REQUESTED_ACKS: &str = "requested-acks";
}

/// Address of the entity a signal refers to.
///
/// Parsing and validation of entity addresses are the caller's concern;
/// the core only ever reads the namespace back out (for blocklist checks).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    namespace: String,
    name: String,
}

impl EntityId {
    /// Create an entity id from an already-validated namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The entity's namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The entity's name within its namespace.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// An opaque published unit.
///
/// `payload` is whatever the external layer serialized; the core never
/// inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    signal_type: String,
    entity: Option<EntityId>,
    headers: Headers,
    payload: Vec<u8>,
}

impl Signal {
    /// Create a signal of the given type with no entity, headers or payload.
    pub fn new(signal_type: impl Into<String>) -> Self {
        Self {
            signal_type: signal_type.into(),
            entity: None,
            headers: Headers::new(),
            payload: Vec::new(),
        }
    }

    /// Address the signal to an entity.
    pub fn entity_id(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Set a single header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replace all headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Attach the serialized payload.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// The signal's type string.
    pub fn signal_type(&self) -> &str {
        &self.signal_type
    }

    /// The entity the signal is addressed to, if any.
    pub fn entity(&self) -> Option<&EntityId> {
        self.entity.as_ref()
    }

    /// The signal's headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The opaque payload bytes.
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the signal is marked for the live channel.
    pub fn is_live(&self) -> bool {
        self.headers
            .get(headers::CHANNEL)
            .is_some_and(|v| v == headers::LIVE_CHANNEL)
    }

    /// Acknowledgement labels requested via the `requested-acks` header.
    pub fn requested_ack_labels(&self) -> Vec<String> {
        self.headers
            .get(headers::REQUESTED_ACKS)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Acknowledgement metadata extracted from a signal and attached to its
/// deliveries, so the receiving side can route ack responses back through
/// the label ownership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRequest {
    /// The requested acknowledgement labels.
    pub labels: Vec<String>,
    /// The entity the signal addresses, if any.
    pub entity: Option<EntityId>,
    /// The signal's original headers.
    pub headers: Headers,
}

/// Computes the set of topics a signal is published under.
///
/// Implementations must be pure: the same signal always yields the same
/// topics on every node.
pub trait ExtractTopics: Send + Sync + 'static {
    /// The topics for `signal`.
    fn topics(&self, signal: &Signal) -> BTreeSet<String>;
}

impl<F> ExtractTopics for F
where
    F: Fn(&Signal) -> BTreeSet<String> + Send + Sync + 'static,
{
    fn topics(&self, signal: &Signal) -> BTreeSet<String> {
        self(signal)
    }
}

/// Extracts acknowledgement requests from a signal.
pub trait ExtractAcks: Send + Sync + 'static {
    /// The ack request carried by `signal`, or `None` when it requests none.
    fn acks(&self, signal: &Signal) -> Option<AckRequest>;
}

/// Default ack extractor: reads the `requested-acks` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAckExtractor;

impl ExtractAcks for HeaderAckExtractor {
    fn acks(&self, signal: &Signal) -> Option<AckRequest> {
        let labels = signal.requested_ack_labels();
        if labels.is_empty() {
            return None;
        }
        Some(AckRequest {
            labels,
            entity: signal.entity().cloned(),
            headers: signal.headers().clone(),
        })
    }
}

/// Default topic extractor: reads a comma-separated `topics` header.
///
/// Real deployments supply their own extractor derived from the signal
/// hierarchy; the header form keeps small setups and tests self-contained.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderTopicExtractor;

/// Header read by [`HeaderTopicExtractor`].
pub const TOPICS_HEADER: &str = "topics";

impl ExtractTopics for HeaderTopicExtractor {
    fn topics(&self, signal: &Signal) -> BTreeSet<String> {
        signal
            .headers()
            .get(TOPICS_HEADER)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}
