//! Shared harness for the Calyx integration tests.
//!
//! Builds a small in-process network of engines, one per node, with a
//! router that delivers queued `send` packets until the network goes
//! quiescent. Cryptography is simulated with byte-shift transforms that
//! honor the engine's length contracts: `encrypt` adds a constant shift
//! and appends marker bytes standing in for a MAC, `decrypt` verifies the
//! markers (which is what makes trial decryption reject wrong hops), and
//! `wrap`/`unwrap` add and remove a second shift without changing length.
//!
//! Shifts are registered per (segment key, target hop) pair, mirroring
//! how a real application would install negotiated key material on both
//! ends of every hop relationship.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use calyx_engine::{
    Address, Engine, EngineConfig, EventSink, LayerCrypto, Rejected, SegmentId, SourceKey,
};

pub const VERSION: u8 = 1;
pub const PACKET_SIZE: usize = 256;
pub const ADDRESS_LENGTH: usize = 8;
pub const MAC_LENGTH: usize = 4;

/// Shifts for the near hop relationship (initiator <-> first node).
pub const SEAL_NEAR: u8 = 3;
pub const LAYER_NEAR: u8 = 5;
/// Shifts for the far hop relationship (initiator <-> second node).
pub const SEAL_FAR: u8 = 7;
pub const LAYER_FAR: u8 = 11;

pub fn test_config() -> EngineConfig {
    EngineConfig::new(VERSION, PACKET_SIZE, ADDRESS_LENGTH, MAC_LENGTH)
}

pub fn addr(byte: u8) -> Address {
    Address::new(vec![byte; ADDRESS_LENGTH])
}

/// Byte-shift crypto with per-(key, hop) registered shifts.
#[derive(Default)]
pub struct ShiftCrypto {
    seal_shifts: Mutex<HashMap<(SourceKey, Address), u8>>,
    layer_shifts: Mutex<HashMap<(SourceKey, Address), u8>>,
}

impl ShiftCrypto {
    /// Install the seal (encrypt/decrypt) and layer (wrap/unwrap) shifts
    /// for one hop relationship of one segment.
    pub fn register(&self, key: &SourceKey, target: &Address, seal: u8, layer: u8) {
        self.seal_shifts
            .lock()
            .expect("lock")
            .insert((key.clone(), target.clone()), seal);
        self.layer_shifts
            .lock()
            .expect("lock")
            .insert((key.clone(), target.clone()), layer);
    }

    fn seal_shift(&self, key: &SourceKey, target: &Address) -> Option<u8> {
        self.seal_shifts
            .lock()
            .expect("lock")
            .get(&(key.clone(), target.clone()))
            .copied()
    }

    fn layer_shift(&self, key: &SourceKey, target: &Address) -> Option<u8> {
        self.layer_shifts
            .lock()
            .expect("lock")
            .get(&(key.clone(), target.clone()))
            .copied()
    }

    fn shifted(data: &[u8], shift: u8) -> Vec<u8> {
        data.iter().map(|b| b.wrapping_add(shift)).collect()
    }
}

#[async_trait]
impl LayerCrypto for ShiftCrypto {
    async fn encrypt(
        &self,
        key: &SourceKey,
        target: &Address,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Rejected> {
        let shift = self.seal_shift(key, target).ok_or(Rejected)?;
        let mut out = Self::shifted(plaintext, shift);
        out.extend_from_slice(&[shift; MAC_LENGTH]);
        Ok(out)
    }

    async fn decrypt(
        &self,
        key: &SourceKey,
        target: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Rejected> {
        let shift = self.seal_shift(key, target).ok_or(Rejected)?;
        if ciphertext.len() < MAC_LENGTH {
            return Err(Rejected);
        }
        let (body, marker) = ciphertext.split_at(ciphertext.len() - MAC_LENGTH);
        if marker.iter().any(|&b| b != shift) {
            return Err(Rejected);
        }
        Ok(Self::shifted(body, shift.wrapping_neg()))
    }

    async fn wrap(
        &self,
        key: &SourceKey,
        target: &Address,
        data: &[u8],
    ) -> Result<Vec<u8>, Rejected> {
        let shift = self.layer_shift(key, target).ok_or(Rejected)?;
        Ok(Self::shifted(data, shift))
    }

    async fn unwrap(
        &self,
        key: &SourceKey,
        target: &Address,
        data: &[u8],
    ) -> Result<Vec<u8>, Rejected> {
        let shift = self.layer_shift(key, target).ok_or(Rejected)?;
        Ok(Self::shifted(data, shift.wrapping_neg()))
    }
}

/// An engine notification captured by the harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    CreateRequest {
        address: Address,
        segment_id: SegmentId,
        command_data: Vec<u8>,
    },
    CreateResponse {
        address: Address,
        segment_id: SegmentId,
        command_data: Vec<u8>,
    },
    ExtendResponse {
        address: Address,
        segment_id: SegmentId,
        command_data: Vec<u8>,
    },
    Destroy {
        address: Address,
        segment_id: SegmentId,
    },
    Data {
        address: Address,
        segment_id: SegmentId,
        target_address: Address,
        command_data: Vec<u8>,
    },
}

/// Queues outbound packets for the router and records notifications.
#[derive(Default)]
pub struct NodeSink {
    outbox: Mutex<VecDeque<(Address, Vec<u8>)>>,
    events: Mutex<Vec<NodeEvent>>,
}

impl NodeSink {
    pub fn pop_packet(&self) -> Option<(Address, Vec<u8>)> {
        self.outbox.lock().expect("lock").pop_front()
    }

    /// All notifications since the last drain, in order.
    pub fn drain_events(&self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events.lock().expect("lock"))
    }
}

#[async_trait]
impl EventSink for NodeSink {
    async fn send(&self, address: &Address, packet: Vec<u8>) {
        self.outbox
            .lock()
            .expect("lock")
            .push_back((address.clone(), packet));
    }

    async fn create_request(&self, address: &Address, segment_id: SegmentId, command_data: Vec<u8>) {
        self.events.lock().expect("lock").push(NodeEvent::CreateRequest {
            address: address.clone(),
            segment_id,
            command_data,
        });
    }

    async fn create_response(
        &self,
        address: &Address,
        segment_id: SegmentId,
        command_data: Vec<u8>,
    ) {
        self.events.lock().expect("lock").push(NodeEvent::CreateResponse {
            address: address.clone(),
            segment_id,
            command_data,
        });
    }

    async fn extend_response(
        &self,
        address: &Address,
        segment_id: SegmentId,
        command_data: Vec<u8>,
    ) {
        self.events.lock().expect("lock").push(NodeEvent::ExtendResponse {
            address: address.clone(),
            segment_id,
            command_data,
        });
    }

    async fn destroy(&self, address: &Address, segment_id: SegmentId) {
        self.events.lock().expect("lock").push(NodeEvent::Destroy {
            address: address.clone(),
            segment_id,
        });
    }

    async fn data(
        &self,
        address: &Address,
        segment_id: SegmentId,
        target_address: &Address,
        command_data: Vec<u8>,
    ) {
        self.events.lock().expect("lock").push(NodeEvent::Data {
            address: address.clone(),
            segment_id,
            target_address: target_address.clone(),
            command_data,
        });
    }
}

/// One simulated node: its engine plus handles to the injected mocks.
pub struct Node {
    pub address: Address,
    pub engine: Engine,
    pub crypto: Arc<ShiftCrypto>,
    pub sink: Arc<NodeSink>,
}

impl Node {
    pub fn new(address: Address) -> Self {
        let crypto = Arc::new(ShiftCrypto::default());
        let sink = Arc::new(NodeSink::default());
        let engine =
            Engine::new(test_config(), crypto.clone(), sink.clone()).expect("valid test config");
        Self {
            address,
            engine,
            crypto,
            sink,
        }
    }
}

/// A set of nodes plus a router that shuttles packets between them.
pub struct Network {
    pub nodes: Vec<Node>,
}

impl Network {
    pub fn new(addresses: &[Address]) -> Self {
        Self {
            nodes: addresses.iter().cloned().map(Node::new).collect(),
        }
    }

    pub fn node(&mut self, address: &Address) -> &mut Node {
        self.nodes
            .iter_mut()
            .find(|node| &node.address == address)
            .expect("known node")
    }

    /// Deliver queued packets, in order, until no node has anything left
    /// to send. Packets addressed to unknown nodes are dropped.
    pub async fn settle(&mut self) {
        loop {
            let mut in_flight = Vec::new();
            for node in &self.nodes {
                while let Some((to, packet)) = node.sink.pop_packet() {
                    in_flight.push((node.address.clone(), to, packet));
                }
            }
            if in_flight.is_empty() {
                break;
            }
            for (from, to, packet) in in_flight {
                if let Some(target) = self.nodes.iter_mut().find(|node| node.address == to) {
                    target.engine.process_packet(&from, &packet).await;
                }
            }
        }
    }
}

/// A fully established two-hop path `a -> b -> c`, with `b` still holding
/// the pending forwarding pair (promotion happens on the first relayed
/// encrypted packet).
pub struct ThreeNodePath {
    pub net: Network,
    pub a: Address,
    pub b: Address,
    pub c: Address,
    /// Segment id on the a<->b link, allocated by `a`.
    pub sid_ab: SegmentId,
    /// Segment id on the b<->c link, allocated by `b`.
    pub sid_bc: SegmentId,
}

/// Run the whole create + extend handshake for a three-node path,
/// installing mirrored shifts as each hop relationship comes up.
pub async fn establish_three_node_path() -> ThreeNodePath {
    let (a, b, c) = (addr(0xA1), addr(0xB2), addr(0xC3));
    let mut net = Network::new(&[a.clone(), b.clone(), c.clone()]);

    let sid_ab = net
        .node(&a)
        .engine
        .create_request(&b, b"hs-near")
        .await
        .expect("create request");
    net.settle().await;

    let b_key = SourceKey::new(&a, sid_ab);
    net.node(&b).crypto.register(&b_key, &a, SEAL_NEAR, LAYER_NEAR);
    net.node(&b)
        .engine
        .create_response(&a, sid_ab, b"hs-near-ack")
        .await
        .expect("create response");
    net.node(&b)
        .engine
        .confirm_incoming_segment_established(&a, sid_ab);
    net.settle().await;

    let a_key = SourceKey::new(&b, sid_ab);
    net.node(&a).sink.drain_events();
    net.node(&a).crypto.register(&a_key, &b, SEAL_NEAR, LAYER_NEAR);
    net.node(&a)
        .engine
        .confirm_outgoing_segment_established(&b, sid_ab);

    net.node(&a)
        .engine
        .extend_request(&b, sid_ab, &c, b"hs-far")
        .await
        .expect("extend request");
    net.settle().await;

    let events = net.node(&c).sink.drain_events();
    let Some(NodeEvent::CreateRequest { segment_id: sid_bc, .. }) = events.first().cloned() else {
        panic!("expected relayed create request at c, got {events:?}");
    };
    let c_key = SourceKey::new(&b, sid_bc);
    net.node(&c).crypto.register(&c_key, &b, SEAL_FAR, LAYER_FAR);
    net.node(&c)
        .engine
        .create_response(&b, sid_bc, b"hs-far-ack")
        .await
        .expect("create response");
    net.node(&c)
        .engine
        .confirm_incoming_segment_established(&b, sid_bc);
    net.settle().await;

    net.node(&a).sink.drain_events();
    net.node(&a).crypto.register(&a_key, &c, SEAL_FAR, LAYER_FAR);
    net.node(&a)
        .engine
        .confirm_extended_path(&b, sid_ab)
        .expect("confirm extension");

    net.node(&b).sink.drain_events();

    ThreeNodePath {
        net,
        a,
        b,
        c,
        sid_ab,
        sid_bc,
    }
}
