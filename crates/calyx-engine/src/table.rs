//! Segment lifecycle bookkeeping.
//!
//! One [`SegmentTable`] tracks every (address, segment id) this node knows
//! about, across five exclusively-owned tables:
//!
//! - **pending** segments awaiting create/extend confirmation, with a
//!   per-address insertion-ordered index capped at `max_pending_segments`
//!   (oldest evicted first - the bounded-memory defense against
//!   unsolicited CREATE_REQUEST floods from a single peer)
//! - **outgoing established** segments this node initiated, each holding
//!   the ordered hop list of its routing path (index 0 = first hop)
//! - **incoming established** segments this node terminates
//! - **forwarding** mappings pairing two keys of a pure relay hop,
//!   always inserted and removed symmetrically
//! - **pending extensions** recording the next-hop address while an
//!   EXTEND_REQUEST is in flight
//!
//! The tables are not mutually exclusive: a relay translating an
//! extension keeps its near key incoming-established while it is also
//! pending, and later while it is half of a forwarding pair. Processing
//! precedence is the engine's business; this module only does the
//! bookkeeping.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use calyx_types::{Address, SegmentId, SourceKey};

/// How an inbound packet for a key must be processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// No established or forwarding state: the payload is plaintext.
    Plaintext,
    /// Established endpoint or forwarding pair: the payload is encrypted.
    Encrypted,
}

/// State attached to a pending segment.
///
/// Both optional fields are set by a relay translating an EXTEND_REQUEST
/// into a fresh CREATE_REQUEST: `forward_to` on the requesting side's key,
/// `original_source` on the newly created side's key.
#[derive(Clone, Debug, Default)]
pub struct PendingSegment {
    /// Where traffic for this key will be forwarded once the pair is
    /// promoted to a forwarding mapping.
    pub forward_to: Option<SourceKey>,
    /// The key whose EXTEND_REQUEST caused this segment to be created;
    /// a CREATE_RESPONSE here is re-emitted to it as an EXTEND_RESPONSE.
    pub original_source: Option<SourceKey>,
}

/// The five engine tables plus the pending-extension map.
#[derive(Debug)]
pub struct SegmentTable {
    max_pending_per_address: usize,
    pending: HashMap<SourceKey, PendingSegment>,
    pending_by_address: HashMap<Address, VecDeque<SegmentId>>,
    outgoing: HashMap<SourceKey, Vec<Address>>,
    incoming: HashSet<SourceKey>,
    forwarding: HashMap<SourceKey, SourceKey>,
    pending_extensions: HashMap<SourceKey, Address>,
}

impl SegmentTable {
    /// Empty table with the given per-address pending cap.
    pub fn new(max_pending_per_address: usize) -> Self {
        Self {
            max_pending_per_address,
            pending: HashMap::new(),
            pending_by_address: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashSet::new(),
            forwarding: HashMap::new(),
            pending_extensions: HashMap::new(),
        }
    }

    /// Whether packets for this key carry plaintext or encrypted payloads.
    pub fn classify(&self, key: &SourceKey) -> Classification {
        if self.outgoing.contains_key(key)
            || self.incoming.contains(key)
            || self.forwarding.contains_key(key)
        {
            Classification::Encrypted
        } else {
            Classification::Plaintext
        }
    }

    /// Record a segment as pending, evicting the oldest pending segment
    /// for the same address if the cap is exceeded.
    ///
    /// Idempotent: a previous pending entry for the same key is replaced
    /// and re-inserted at the back of the eviction queue.
    pub fn mark_pending(&mut self, key: SourceKey, data: PendingSegment) {
        self.unmark_pending(&key);
        self.pending.insert(key.clone(), data);
        let queue = self.pending_by_address.entry(key.address.clone()).or_default();
        queue.push_back(key.segment_id);
        if queue.len() > self.max_pending_per_address {
            if let Some(oldest) = queue.pop_front() {
                let evicted = SourceKey::new(&key.address, oldest);
                self.pending.remove(&evicted);
                trace!(key = %evicted, "Evicted oldest pending segment");
            }
        }
    }

    /// Forget a pending segment; no-op if absent.
    pub fn unmark_pending(&mut self, key: &SourceKey) {
        if self.pending.remove(key).is_none() {
            return;
        }
        if let Some(queue) = self.pending_by_address.get_mut(&key.address) {
            if let Some(pos) = queue.iter().position(|id| *id == key.segment_id) {
                queue.remove(pos);
            }
            if queue.is_empty() {
                self.pending_by_address.remove(&key.address);
            }
        }
    }

    /// The pending entry for a key, if any.
    pub fn pending(&self, key: &SourceKey) -> Option<&PendingSegment> {
        self.pending.get(key)
    }

    /// Whether the key is pending.
    pub fn is_pending(&self, key: &SourceKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of pending segments tracked for one address.
    pub fn pending_for_address(&self, address: &Address) -> usize {
        self.pending_by_address
            .get(address)
            .map_or(0, VecDeque::len)
    }

    /// First segment id not currently pending, outgoing, or incoming for
    /// this address, scanning the full 16-bit space in order. `None` means
    /// all 65536 ids are concurrently tracked.
    pub fn allocate_segment_id(&self, address: &Address) -> Option<SegmentId> {
        (0..=u16::MAX).map(SegmentId).find(|&id| {
            let key = SourceKey::new(address, id);
            !self.outgoing.contains_key(&key)
                && !self.pending.contains_key(&key)
                && !self.incoming.contains(&key)
        })
    }

    /// Promote a key to an outgoing established segment whose path starts
    /// at its own address.
    pub fn confirm_outgoing(&mut self, key: SourceKey) {
        self.unmark_pending(&key);
        let first_hop = key.address.clone();
        self.outgoing.insert(key, vec![first_hop]);
    }

    /// Promote a key to an incoming established segment.
    pub fn confirm_incoming(&mut self, key: SourceKey) {
        self.unmark_pending(&key);
        self.incoming.insert(key);
    }

    /// The ordered hop list of an outgoing path.
    pub fn outgoing_path(&self, key: &SourceKey) -> Option<&[Address]> {
        self.outgoing.get(key).map(Vec::as_slice)
    }

    /// Mutable hop list of an outgoing path.
    pub fn outgoing_path_mut(&mut self, key: &SourceKey) -> Option<&mut Vec<Address>> {
        self.outgoing.get_mut(key)
    }

    /// Whether the key is an outgoing established segment.
    pub fn is_outgoing(&self, key: &SourceKey) -> bool {
        self.outgoing.contains_key(key)
    }

    /// Drop an outgoing established segment entirely.
    pub fn remove_outgoing(&mut self, key: &SourceKey) {
        self.outgoing.remove(key);
    }

    /// Whether the key is an incoming established segment.
    pub fn is_incoming(&self, key: &SourceKey) -> bool {
        self.incoming.contains(key)
    }

    /// Drop an incoming established segment. Returns whether it existed.
    pub fn remove_incoming(&mut self, key: &SourceKey) -> bool {
        self.incoming.remove(key)
    }

    /// Pair two keys for relay forwarding, both directions at once.
    /// Any existing pairing involving either key is dissolved first.
    pub fn add_forwarding_pair(&mut self, a: SourceKey, b: SourceKey) {
        self.remove_forwarding_pair(&a);
        self.remove_forwarding_pair(&b);
        self.forwarding.insert(a.clone(), b.clone());
        self.forwarding.insert(b, a);
    }

    /// Dissolve the forwarding pair involving this key, removing both
    /// directions; no-op if the key is not paired.
    pub fn remove_forwarding_pair(&mut self, key: &SourceKey) {
        if let Some(other) = self.forwarding.remove(key) {
            self.forwarding.remove(&other);
        }
    }

    /// The key traffic for this key is forwarded to, if paired.
    pub fn forwarding_target(&self, key: &SourceKey) -> Option<&SourceKey> {
        self.forwarding.get(key)
    }

    /// Whether the key belongs to a forwarding pair.
    pub fn is_forwarding(&self, key: &SourceKey) -> bool {
        self.forwarding.contains_key(key)
    }

    /// Record the next-hop address of an in-flight EXTEND_REQUEST.
    pub fn set_pending_extension(&mut self, key: SourceKey, next_node_address: Address) {
        self.pending_extensions.insert(key, next_node_address);
    }

    /// Whether an extension is in flight for this key.
    pub fn has_pending_extension(&self, key: &SourceKey) -> bool {
        self.pending_extensions.contains_key(key)
    }

    /// Resolve (and forget) an in-flight extension.
    pub fn take_pending_extension(&mut self, key: &SourceKey) -> Option<Address> {
        self.pending_extensions.remove(key)
    }
}
