//! The segment lifecycle state machine.
//!
//! All inbound traffic enters through [`Engine::process_packet`]; the
//! outbound API mirrors the six protocol commands plus the three lifecycle
//! confirmations the application issues after verifying handshake data.
//!
//! Path naming, from the initiator's point of view:
//!
//! ```text
//! initiator [outgoing segment] -> [incoming] relay 1 -> [incoming] relay 2 -> [incoming] responder
//! ```
//!
//! Callers of the outbound API only ever see the fast-fail errors
//! (length violations, unknown segments, id exhaustion). Anything that
//! goes wrong after the delegated transforms take over resolves to
//! silence: no `send` fires and no error escapes, so a remote peer cannot
//! probe segment state through response shape.

use std::sync::Arc;

use tracing::{debug, trace};

use calyx_types::{Address, Command, EngineConfig, SegmentId, SourceKey};

use crate::codec;
use crate::hooks::{EventSink, LayerCrypto};
use crate::table::{Classification, PendingSegment, SegmentTable};
use crate::{EngineError, Result};

/// A transport-agnostic onion-segment routing engine.
///
/// One `Engine` value owns all segment state for one node; an application
/// may hold several independent engines. Every mutating operation takes
/// `&mut self`, so overlapping operations on the same engine are ruled out
/// by construction - sequencing across engines is the application's job.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) table: SegmentTable,
    pub(crate) crypto: Arc<dyn LayerCrypto>,
    pub(crate) events: Arc<dyn EventSink>,
}

impl Engine {
    /// Build an engine from validated construction parameters and the two
    /// injected capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the parameters are inconsistent
    /// (packet too small for the framing and MAC, zero address length,
    /// zero pending cap, or a packet size beyond the 16-bit length field).
    pub fn new(
        config: EngineConfig,
        crypto: Arc<dyn LayerCrypto>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let table = SegmentTable::new(config.max_pending_segments);
        Ok(Self {
            config,
            table,
            crypto,
            events,
        })
    }

    /// The construction parameters.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read-only view of the segment tables, for introspection.
    pub fn table(&self) -> &SegmentTable {
        &self.table
    }

    /// How much command data fits in one packet.
    pub fn max_command_data_length(&self) -> usize {
        self.config.max_command_data_length()
    }

    /// Feed a packet that arrived from `address`.
    ///
    /// Packets of the wrong size or version are dropped without any
    /// observable effect - the first line of defense against malformed
    /// and foreign traffic.
    pub async fn process_packet(&mut self, address: &Address, packet: &[u8]) {
        if packet.len() != self.config.packet_size {
            trace!(peer = %address, len = packet.len(), "Dropped packet with wrong size");
            return;
        }
        let Some((version, segment_id, packet_data)) = codec::parse_packet(packet) else {
            return;
        };
        if version != self.config.version {
            trace!(peer = %address, version, "Dropped packet with foreign version");
            return;
        }
        let key = SourceKey::new(address, segment_id);
        match self.table.classify(&key) {
            Classification::Encrypted => self.process_encrypted(&key, packet_data).await,
            Classification::Plaintext => self.process_plaintext(&key, packet_data).await,
        }
    }

    /// Open a new routing path starting at `address`: allocates a segment
    /// id, sends a plaintext CREATE_REQUEST, and marks the segment
    /// pending. Returns the generated id for later extension.
    ///
    /// # Errors
    ///
    /// [`EngineError::LengthViolation`] if the command data does not fit,
    /// [`EngineError::SegmentIdsExhausted`] if all 65536 ids for this
    /// address are in use.
    pub async fn create_request(
        &mut self,
        address: &Address,
        command_data: &[u8],
    ) -> Result<SegmentId> {
        self.check_length(command_data, self.max_command_data_length())?;
        let segment_id = self
            .table
            .allocate_segment_id(address)
            .ok_or_else(|| EngineError::SegmentIdsExhausted(address.clone()))?;
        let packet = self.build_plaintext_packet(segment_id, Command::CreateRequest, command_data);
        self.events.send(address, packet).await;
        self.table
            .mark_pending(SourceKey::new(address, segment_id), PendingSegment::default());
        Ok(segment_id)
    }

    /// Answer an inbound CREATE_REQUEST with a plaintext CREATE_RESPONSE
    /// carrying the same segment id.
    ///
    /// # Errors
    ///
    /// [`EngineError::LengthViolation`] if the command data does not fit.
    pub async fn create_response(
        &self,
        address: &Address,
        segment_id: SegmentId,
        command_data: &[u8],
    ) -> Result<()> {
        self.check_length(command_data, self.max_command_data_length())?;
        let packet = self.build_plaintext_packet(segment_id, Command::CreateResponse, command_data);
        self.events.send(address, packet).await;
        Ok(())
    }

    /// Extend the routing path that starts at (`address`, `segment_id`)
    /// by one more node, sending an EXTEND_REQUEST to the path's current
    /// last hop. The extension is recorded as in flight and resolved by
    /// [`Engine::confirm_extended_path`].
    ///
    /// `next_node_address` is prepended to the command data on the wire,
    /// which is why the budget here is `address_length` smaller.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSuchSegment`] without an outgoing established
    /// path, [`EngineError::AddressLengthMismatch`] if the next-hop
    /// address has the wrong length, [`EngineError::LengthViolation`] if
    /// the command data does not fit.
    pub async fn extend_request(
        &mut self,
        address: &Address,
        segment_id: SegmentId,
        next_node_address: &Address,
        command_data: &[u8],
    ) -> Result<()> {
        let key = SourceKey::new(address, segment_id);
        let target = self
            .table
            .outgoing_path(&key)
            .and_then(|path| path.last().cloned())
            .ok_or_else(|| EngineError::NoSuchSegment(key.clone()))?;
        if next_node_address.len() != self.config.address_length {
            return Err(EngineError::AddressLengthMismatch {
                len: next_node_address.len(),
                expected: self.config.address_length,
            });
        }
        self.check_length(
            command_data,
            self.max_command_data_length()
                .saturating_sub(self.config.address_length),
        )?;

        let mut full = Vec::with_capacity(self.config.address_length + command_data.len());
        full.extend_from_slice(next_node_address.as_bytes());
        full.extend_from_slice(command_data);

        match self
            .build_encrypted_packet(&key, &target, Command::ExtendRequest, &full)
            .await
        {
            Ok(packet) => {
                self.events.send(address, packet).await;
                self.table
                    .set_pending_extension(key, next_node_address.clone());
            }
            Err(_) => trace!(key = %key, "Extend request dropped by transform"),
        }
        Ok(())
    }

    /// Tear down the last segment of the routing path that starts at
    /// (`address`, `segment_id`), sending a DESTROY to the current last
    /// hop and popping it from the path. Once the path is empty the whole
    /// outgoing entry is removed; repeated calls unwind the path hop by
    /// hop, farthest first.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSuchSegment`] without an outgoing established path.
    pub async fn destroy(&mut self, address: &Address, segment_id: SegmentId) -> Result<()> {
        let key = SourceKey::new(address, segment_id);
        let target = self
            .table
            .outgoing_path(&key)
            .and_then(|path| path.last().cloned())
            .ok_or_else(|| EngineError::NoSuchSegment(key.clone()))?;
        match self
            .build_encrypted_packet(&key, &target, Command::Destroy, &[])
            .await
        {
            Ok(packet) => {
                if let Some(path) = self.table.outgoing_path_mut(&key) {
                    path.pop();
                    if path.is_empty() {
                        self.table.remove_outgoing(&key);
                    }
                }
                self.events.send(address, packet).await;
            }
            Err(_) => trace!(key = %key, "Destroy dropped by transform"),
        }
        Ok(())
    }

    /// Send application data over an established segment.
    ///
    /// `target_address` selects which node in the path the payload is
    /// encrypted for; a responder sending data back to the initiator
    /// passes the initiator-facing `address` itself.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSuchSegment`] if the key is neither outgoing- nor
    /// incoming-established, [`EngineError::LengthViolation`] if the
    /// command data does not fit.
    pub async fn data(
        &self,
        address: &Address,
        segment_id: SegmentId,
        target_address: &Address,
        command_data: &[u8],
    ) -> Result<()> {
        let key = SourceKey::new(address, segment_id);
        if !self.table.is_outgoing(&key) && !self.table.is_incoming(&key) {
            return Err(EngineError::NoSuchSegment(key));
        }
        self.check_length(command_data, self.max_command_data_length())?;
        match self
            .build_encrypted_packet(&key, target_address, Command::Data, command_data)
            .await
        {
            Ok(packet) => self.events.send(address, packet).await,
            Err(_) => trace!(key = %key, "Data dropped by transform"),
        }
        Ok(())
    }

    /// Record a segment this node initiated as established, after the
    /// application verified the CREATE_RESPONSE. The outgoing path starts
    /// as the single hop `[address]`.
    pub fn confirm_outgoing_segment_established(&mut self, address: &Address, segment_id: SegmentId) {
        self.table
            .confirm_outgoing(SourceKey::new(address, segment_id));
    }

    /// Record a segment this node terminates as established, after the
    /// application accepted the CREATE_REQUEST and sent its response.
    pub fn confirm_incoming_segment_established(&mut self, address: &Address, segment_id: SegmentId) {
        self.table
            .confirm_incoming(SourceKey::new(address, segment_id));
    }

    /// Resolve an in-flight extension, appending the recorded next hop to
    /// the outgoing path. Called after the application verified the
    /// EXTEND_RESPONSE.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSuchSegment`] if there is no outgoing established
    /// path or no extension in flight for this key.
    pub fn confirm_extended_path(&mut self, address: &Address, segment_id: SegmentId) -> Result<()> {
        let key = SourceKey::new(address, segment_id);
        if !self.table.is_outgoing(&key) {
            return Err(EngineError::NoSuchSegment(key));
        }
        let next = self
            .table
            .take_pending_extension(&key)
            .ok_or_else(|| EngineError::NoSuchSegment(key.clone()))?;
        if let Some(path) = self.table.outgoing_path_mut(&key) {
            path.push(next);
        }
        Ok(())
    }

    async fn process_plaintext(&mut self, key: &SourceKey, packet_data: &[u8]) {
        let Some((command_byte, command_data)) = codec::parse_command_data(packet_data) else {
            return;
        };
        match Command::from_byte(command_byte) {
            Some(Command::CreateRequest) => {
                self.table.mark_pending(key.clone(), PendingSegment::default());
                self.events
                    .create_request(&key.address, key.segment_id, command_data.to_vec())
                    .await;
            }
            Some(Command::CreateResponse) => {
                let original_source = match self.table.pending(key) {
                    Some(pending) => pending.original_source.clone(),
                    // A response nobody asked for.
                    None => return,
                };
                if let Some(source) = original_source {
                    // This create was issued on behalf of a relayed
                    // extension; translate the answer back.
                    let command_data = command_data.to_vec();
                    self.send_extend_response(&source, &command_data).await;
                } else {
                    self.events
                        .create_response(&key.address, key.segment_id, command_data.to_vec())
                        .await;
                }
            }
            _ => trace!(key = %key, command = command_byte, "Ignored plaintext command"),
        }
    }

    async fn process_encrypted(&mut self, key: &SourceKey, packet_data: &[u8]) {
        // Re-key the bytes first so no two hops ever relay identical
        // ciphertext for the same logical cell.
        let rewrapped = match self.rewrap(key, packet_data).await {
            Ok(data) => data,
            Err(_) => {
                trace!(key = %key, "Rewrap failed, dropping packet");
                return;
            }
        };

        if !self.table.is_incoming(key) && self.table.is_forwarding(key) {
            self.forward_packet(key, &rewrapped).await;
            return;
        }

        match self.decrypt_and_unwrap(key, &rewrapped).await {
            Ok(peeled) => {
                let Some((command_byte, command_data)) =
                    codec::parse_command_data(&peeled.plaintext)
                else {
                    return;
                };
                let command_data = command_data.to_vec();
                match Command::from_byte(command_byte) {
                    Some(Command::ExtendRequest) => {
                        self.handle_extend_request(key, &command_data).await;
                    }
                    Some(Command::ExtendResponse) => {
                        if self.table.has_pending_extension(key) {
                            self.events
                                .extend_response(&key.address, key.segment_id, command_data)
                                .await;
                        }
                    }
                    Some(Command::Destroy) => {
                        if self.table.remove_incoming(key) {
                            self.table.remove_forwarding_pair(key);
                            debug!(key = %key, "Incoming segment destroyed by peer");
                            self.events.destroy(&key.address, key.segment_id).await;
                        }
                    }
                    Some(Command::Data) => {
                        self.events
                            .data(
                                &key.address,
                                key.segment_id,
                                &peeled.target_address,
                                command_data,
                            )
                            .await;
                    }
                    _ => trace!(key = %key, command = command_byte, "Ignored encrypted command"),
                }
            }
            // Not our endpoint: relay if we know (or just learned) where
            // this key's traffic belongs.
            Err(_) => {
                if self.table.is_forwarding(key) {
                    self.forward_packet(key, &rewrapped).await;
                } else if let Some(forward_to) =
                    self.table.pending(key).and_then(|p| p.forward_to.clone())
                {
                    // First packet after a successful extension through
                    // this node: promote the pending pair to a permanent
                    // forwarding mapping.
                    self.table.unmark_pending(key);
                    self.table.unmark_pending(&forward_to);
                    self.table.add_forwarding_pair(key.clone(), forward_to);
                    debug!(key = %key, "Promoted pending extension to forwarding mapping");
                    self.forward_packet(key, &rewrapped).await;
                }
            }
        }
    }

    /// Translate an inbound EXTEND_REQUEST into a fresh CREATE_REQUEST
    /// toward the named next hop, wiring both keys up as a pending
    /// forwarding pair. A request this node cannot satisfy is answered
    /// with an empty EXTEND_RESPONSE rather than an error.
    async fn handle_extend_request(&mut self, key: &SourceKey, command_data: &[u8]) {
        if command_data.len() < self.config.address_length {
            self.send_extend_response(key, &[]).await;
            return;
        }
        let next_node_address = Address::from(&command_data[..self.config.address_length]);
        let nested = &command_data[self.config.address_length..];
        match self.create_request(&next_node_address, nested).await {
            Ok(next_segment_id) => {
                let next_key = SourceKey::new(&next_node_address, next_segment_id);
                self.table.mark_pending(
                    key.clone(),
                    PendingSegment {
                        forward_to: Some(next_key.clone()),
                        original_source: None,
                    },
                );
                self.table.mark_pending(
                    next_key,
                    PendingSegment {
                        forward_to: None,
                        original_source: Some(key.clone()),
                    },
                );
            }
            Err(error) => {
                debug!(key = %key, %error, "Extension not possible, answering empty");
                self.send_extend_response(key, &[]).await;
            }
        }
    }

    async fn send_extend_response(&mut self, key: &SourceKey, command_data: &[u8]) {
        match self
            .build_encrypted_packet(key, &key.address.clone(), Command::ExtendResponse, command_data)
            .await
        {
            Ok(packet) => self.events.send(&key.address, packet).await,
            Err(_) => trace!(key = %key, "Extend response dropped by transform"),
        }
    }

    /// Re-label an encrypted payload with the paired key's segment id and
    /// send it out; silently does nothing if the pairing vanished.
    async fn forward_packet(&self, key: &SourceKey, packet_data: &[u8]) {
        let Some(target) = self.table.forwarding_target(key) else {
            return;
        };
        let packet = codec::build_packet(
            self.config.packet_size,
            self.config.version,
            target.segment_id,
            packet_data,
        );
        trace!(from = %key, to = %target, "Forwarding relay packet");
        self.events.send(&target.address, packet).await;
    }

    fn build_plaintext_packet(
        &self,
        segment_id: SegmentId,
        command: Command,
        command_data: &[u8],
    ) -> Vec<u8> {
        let packet_data =
            codec::build_command_data(command, command_data, self.max_command_data_length());
        codec::build_packet(
            self.config.packet_size,
            self.config.version,
            segment_id,
            &packet_data,
        )
    }

    async fn build_encrypted_packet(
        &self,
        key: &SourceKey,
        target_address: &Address,
        command: Command,
        command_data: &[u8],
    ) -> std::result::Result<Vec<u8>, crate::hooks::Rejected> {
        let packet_data =
            codec::build_command_data(command, command_data, self.max_command_data_length());
        let encrypted = self.encrypt_and_wrap(key, target_address, &packet_data).await?;
        Ok(codec::build_packet(
            self.config.packet_size,
            self.config.version,
            key.segment_id,
            &encrypted,
        ))
    }

    fn check_length(&self, command_data: &[u8], max: usize) -> Result<()> {
        if command_data.len() > max {
            return Err(EngineError::LengthViolation {
                len: command_data.len(),
                max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{EventSink, LayerCrypto, Rejected};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const PACKET_SIZE: usize = 64;
    const ADDRESS_LENGTH: usize = 4;
    const MAC_LENGTH: usize = 2;

    fn config() -> EngineConfig {
        EngineConfig::new(7, PACKET_SIZE, ADDRESS_LENGTH, MAC_LENGTH)
    }

    fn addr(byte: u8) -> Address {
        Address::new(vec![byte; ADDRESS_LENGTH])
    }

    /// Rejects every transform, for exercising the silent-failure paths.
    struct NullCrypto;

    #[async_trait]
    impl LayerCrypto for NullCrypto {
        async fn encrypt(&self, _: &SourceKey, _: &Address, _: &[u8]) -> Result2 {
            Err(Rejected)
        }
        async fn decrypt(&self, _: &SourceKey, _: &Address, _: &[u8]) -> Result2 {
            Err(Rejected)
        }
        async fn wrap(&self, _: &SourceKey, _: &Address, _: &[u8]) -> Result2 {
            Err(Rejected)
        }
        async fn unwrap(&self, _: &SourceKey, _: &Address, _: &[u8]) -> Result2 {
            Err(Rejected)
        }
    }

    type Result2 = std::result::Result<Vec<u8>, Rejected>;

    /// Transparent transforms: encrypt appends a zero MAC, decrypt strips
    /// it, wrap and unwrap are identity. Lets tests read command bytes
    /// straight out of "encrypted" packets.
    struct ZeroCrypto;

    #[async_trait]
    impl LayerCrypto for ZeroCrypto {
        async fn encrypt(&self, _: &SourceKey, _: &Address, plaintext: &[u8]) -> Result2 {
            let mut out = plaintext.to_vec();
            out.extend_from_slice(&[0u8; MAC_LENGTH]);
            Ok(out)
        }
        async fn decrypt(&self, _: &SourceKey, _: &Address, ciphertext: &[u8]) -> Result2 {
            Ok(ciphertext[..ciphertext.len() - MAC_LENGTH].to_vec())
        }
        async fn wrap(&self, _: &SourceKey, _: &Address, data: &[u8]) -> Result2 {
            Ok(data.to_vec())
        }
        async fn unwrap(&self, _: &SourceKey, _: &Address, data: &[u8]) -> Result2 {
            Ok(data.to_vec())
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Recorded {
        Send(Address, Vec<u8>),
        CreateRequest(Address, SegmentId, Vec<u8>),
        CreateResponse(Address, SegmentId, Vec<u8>),
        ExtendResponse(Address, SegmentId, Vec<u8>),
        Destroy(Address, SegmentId),
        Data(Address, SegmentId, Address, Vec<u8>),
    }

    #[derive(Default)]
    struct RecordingSink {
        recorded: Mutex<Vec<Recorded>>,
    }

    impl RecordingSink {
        fn push(&self, event: Recorded) {
            self.recorded.lock().expect("lock").push(event);
        }

        fn take(&self) -> Vec<Recorded> {
            std::mem::take(&mut self.recorded.lock().expect("lock"))
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, address: &Address, packet: Vec<u8>) {
            self.push(Recorded::Send(address.clone(), packet));
        }
        async fn create_request(&self, address: &Address, id: SegmentId, data: Vec<u8>) {
            self.push(Recorded::CreateRequest(address.clone(), id, data));
        }
        async fn create_response(&self, address: &Address, id: SegmentId, data: Vec<u8>) {
            self.push(Recorded::CreateResponse(address.clone(), id, data));
        }
        async fn extend_response(&self, address: &Address, id: SegmentId, data: Vec<u8>) {
            self.push(Recorded::ExtendResponse(address.clone(), id, data));
        }
        async fn destroy(&self, address: &Address, id: SegmentId) {
            self.push(Recorded::Destroy(address.clone(), id));
        }
        async fn data(&self, address: &Address, id: SegmentId, target: &Address, data: Vec<u8>) {
            self.push(Recorded::Data(address.clone(), id, target.clone(), data));
        }
    }

    fn engine_with(crypto: impl LayerCrypto + 'static) -> (Engine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let engine =
            Engine::new(config(), Arc::new(crypto), sink.clone()).expect("valid config");
        (engine, sink)
    }

    #[tokio::test]
    async fn test_wrong_size_and_version_dropped() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(1);

        engine.process_packet(&peer, &[7u8; PACKET_SIZE - 1]).await;
        engine.process_packet(&peer, &[7u8; PACKET_SIZE + 1]).await;

        let mut foreign = vec![0u8; PACKET_SIZE];
        foreign[0] = 99; // not version 7
        engine.process_packet(&peer, &foreign).await;

        assert!(sink.take().is_empty());
        assert_eq!(engine.table().pending_for_address(&peer), 0);
    }

    #[tokio::test]
    async fn test_create_request_sends_and_marks_pending() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(1);

        let segment_id = engine
            .create_request(&peer, b"hello")
            .await
            .expect("create request");
        assert_eq!(segment_id, SegmentId(0));
        assert!(engine.table().is_pending(&SourceKey::new(&peer, segment_id)));

        let events = sink.take();
        assert_eq!(events.len(), 1);
        let Recorded::Send(to, packet) = &events[0] else {
            panic!("expected send");
        };
        assert_eq!(to, &peer);
        assert_eq!(packet.len(), PACKET_SIZE);
        assert_eq!(packet[0], 7); // version
        assert_eq!(&packet[1..3], &[0, 0]); // segment id 0 big-endian
        assert_eq!(packet[3], Command::CreateRequest.as_byte());
        assert_eq!(&packet[4..6], &[0, 5]); // command data length
        assert_eq!(&packet[6..11], b"hello");
    }

    #[tokio::test]
    async fn test_create_request_length_violation() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let max = engine.max_command_data_length();
        let result = engine.create_request(&addr(1), &vec![0u8; max + 1]).await;
        assert!(matches!(result, Err(EngineError::LengthViolation { .. })));
        assert!(sink.take().is_empty(), "failed fast, nothing sent");
    }

    #[tokio::test]
    async fn test_inbound_create_request_notifies_and_marks_pending() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(2);

        let packet_data = codec::build_command_data(
            Command::CreateRequest,
            b"hs-data",
            engine.max_command_data_length(),
        );
        let packet = codec::build_packet(PACKET_SIZE, 7, SegmentId(5), &packet_data);
        engine.process_packet(&peer, &packet).await;

        assert!(engine.table().is_pending(&SourceKey::new(&peer, SegmentId(5))));
        assert_eq!(
            sink.take(),
            vec![Recorded::CreateRequest(peer, SegmentId(5), b"hs-data".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_unsolicited_create_response_ignored() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(2);

        let packet_data = codec::build_command_data(
            Command::CreateResponse,
            b"resp",
            engine.max_command_data_length(),
        );
        let packet = codec::build_packet(PACKET_SIZE, 7, SegmentId(5), &packet_data);
        engine.process_packet(&peer, &packet).await;

        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_create_response_roundtrip_to_notification() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(2);
        let segment_id = engine.create_request(&peer, b"go").await.expect("request");
        sink.take();

        let packet_data = codec::build_command_data(
            Command::CreateResponse,
            b"welcome",
            engine.max_command_data_length(),
        );
        let packet = codec::build_packet(PACKET_SIZE, 7, segment_id, &packet_data);
        engine.process_packet(&peer, &packet).await;

        assert_eq!(
            sink.take(),
            vec![Recorded::CreateResponse(peer.clone(), segment_id, b"welcome".to_vec())]
        );

        engine.confirm_outgoing_segment_established(&peer, segment_id);
        assert_eq!(
            engine.table().outgoing_path(&SourceKey::new(&peer, segment_id)),
            Some(&[peer][..])
        );
    }

    #[tokio::test]
    async fn test_pending_flood_is_bounded() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(3);

        for id in 0..11u16 {
            let packet_data = codec::build_command_data(
                Command::CreateRequest,
                &[],
                engine.max_command_data_length(),
            );
            let packet = codec::build_packet(PACKET_SIZE, 7, SegmentId(id), &packet_data);
            engine.process_packet(&peer, &packet).await;
        }

        assert_eq!(engine.table().pending_for_address(&peer), 10);
        assert!(!engine.table().is_pending(&SourceKey::new(&peer, SegmentId(0))));
        assert_eq!(sink.take().len(), 11, "every request still notified");
    }

    #[tokio::test]
    async fn test_outbound_ops_require_established_segment() {
        let (mut engine, _sink) = engine_with(ZeroCrypto);
        let peer = addr(1);

        let result = engine.extend_request(&peer, SegmentId(0), &addr(2), b"x").await;
        assert!(matches!(result, Err(EngineError::NoSuchSegment(_))));

        let result = engine.destroy(&peer, SegmentId(0)).await;
        assert!(matches!(result, Err(EngineError::NoSuchSegment(_))));

        let result = engine.data(&peer, SegmentId(0), &peer, b"x").await;
        assert!(matches!(result, Err(EngineError::NoSuchSegment(_))));
    }

    #[tokio::test]
    async fn test_extend_request_rejects_bad_next_hop_length() {
        let (mut engine, _sink) = engine_with(ZeroCrypto);
        let peer = addr(1);
        engine.confirm_outgoing_segment_established(&peer, SegmentId(0));

        let short = Address::new(vec![9]);
        let result = engine.extend_request(&peer, SegmentId(0), &short, b"").await;
        assert!(matches!(
            result,
            Err(EngineError::AddressLengthMismatch { len: 1, expected: 4 })
        ));
    }

    #[tokio::test]
    async fn test_extend_then_confirm_grows_path() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(1);
        let next = addr(2);
        engine.confirm_outgoing_segment_established(&peer, SegmentId(0));

        engine
            .extend_request(&peer, SegmentId(0), &next, b"hs2")
            .await
            .expect("extend");
        let events = sink.take();
        assert_eq!(events.len(), 1);
        let Recorded::Send(_, packet) = &events[0] else {
            panic!("expected send");
        };
        // ZeroCrypto is transparent: the EXTEND_REQUEST framing is visible,
        // with the next-hop address prepended to the command data.
        assert_eq!(packet[3], Command::ExtendRequest.as_byte());
        assert_eq!(&packet[6..10], next.as_bytes());
        assert_eq!(&packet[10..13], b"hs2");

        engine
            .confirm_extended_path(&peer, SegmentId(0))
            .expect("confirm");
        assert_eq!(
            engine.table().outgoing_path(&SourceKey::new(&peer, SegmentId(0))),
            Some(&[peer, next][..])
        );
    }

    #[tokio::test]
    async fn test_confirm_extended_path_without_pending_extension() {
        let (mut engine, _sink) = engine_with(ZeroCrypto);
        let peer = addr(1);
        assert!(engine.confirm_extended_path(&peer, SegmentId(0)).is_err());

        engine.confirm_outgoing_segment_established(&peer, SegmentId(0));
        assert!(engine.confirm_extended_path(&peer, SegmentId(0)).is_err());
    }

    #[tokio::test]
    async fn test_destroy_single_hop_removes_path() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(1);
        engine.confirm_outgoing_segment_established(&peer, SegmentId(0));

        engine.destroy(&peer, SegmentId(0)).await.expect("destroy");

        let events = sink.take();
        assert_eq!(events.len(), 1);
        let Recorded::Send(to, packet) = &events[0] else {
            panic!("expected send");
        };
        assert_eq!(to, &peer);
        assert_eq!(packet[3], Command::Destroy.as_byte());
        assert!(!engine.table().is_outgoing(&SourceKey::new(&peer, SegmentId(0))));
    }

    #[tokio::test]
    async fn test_transform_failure_resolves_to_silence() {
        let (mut engine, sink) = engine_with(NullCrypto);
        let peer = addr(1);
        engine.confirm_outgoing_segment_established(&peer, SegmentId(0));

        // Validation passed, so the caller sees success; the rejected
        // encrypt means nothing goes on the wire.
        engine
            .data(&peer, SegmentId(0), &peer, b"secret")
            .await
            .expect("silent");
        engine.destroy(&peer, SegmentId(0)).await.expect("silent");
        assert!(sink.take().is_empty());
        // The failed destroy did not pop the hop either.
        assert!(engine.table().is_outgoing(&SourceKey::new(&peer, SegmentId(0))));
    }

    #[tokio::test]
    async fn test_inbound_data_notification() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(1);
        engine.confirm_incoming_segment_established(&peer, SegmentId(4));

        let packet_data = codec::build_command_data(
            Command::Data,
            b"payload",
            engine.max_command_data_length(),
        );
        // ZeroCrypto: ciphertext == plaintext plus a zero MAC; the packet
        // body is the encrypted frame at full width.
        let mut encrypted = packet_data;
        encrypted.extend_from_slice(&[0u8; MAC_LENGTH]);
        let packet = codec::build_packet(PACKET_SIZE, 7, SegmentId(4), &encrypted);
        engine.process_packet(&peer, &packet).await;

        assert_eq!(
            sink.take(),
            vec![Recorded::Data(peer.clone(), SegmentId(4), peer, b"payload".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_inbound_destroy_clears_incoming() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(1);
        engine.confirm_incoming_segment_established(&peer, SegmentId(4));

        let packet_data = codec::build_command_data(
            Command::Destroy,
            &[],
            engine.max_command_data_length(),
        );
        let mut encrypted = packet_data;
        encrypted.extend_from_slice(&[0u8; MAC_LENGTH]);
        let packet = codec::build_packet(PACKET_SIZE, 7, SegmentId(4), &encrypted);
        engine.process_packet(&peer, &packet).await;

        assert!(!engine.table().is_incoming(&SourceKey::new(&peer, SegmentId(4))));
        assert_eq!(sink.take(), vec![Recorded::Destroy(peer, SegmentId(4))]);
    }

    #[tokio::test]
    async fn test_extend_request_translates_to_nested_create() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(1);
        let next = addr(9);
        engine.confirm_incoming_segment_established(&peer, SegmentId(4));

        let mut extend_payload = next.as_bytes().to_vec();
        extend_payload.extend_from_slice(b"nested-hs");
        let packet_data = codec::build_command_data(
            Command::ExtendRequest,
            &extend_payload,
            engine.max_command_data_length(),
        );
        let mut encrypted = packet_data;
        encrypted.extend_from_slice(&[0u8; MAC_LENGTH]);
        let packet = codec::build_packet(PACKET_SIZE, 7, SegmentId(4), &encrypted);
        engine.process_packet(&peer, &packet).await;

        // A fresh plaintext CREATE_REQUEST went out to the next node.
        let events = sink.take();
        assert_eq!(events.len(), 1);
        let Recorded::Send(to, out) = &events[0] else {
            panic!("expected send");
        };
        assert_eq!(to, &next);
        assert_eq!(out[3], Command::CreateRequest.as_byte());
        assert_eq!(&out[6..15], b"nested-hs");

        // Both sides are wired up as a pending pair.
        let local = SourceKey::new(&peer, SegmentId(4));
        let remote = SourceKey::new(&next, SegmentId(0));
        let pending = engine.table().pending(&local).expect("local pending");
        assert_eq!(pending.forward_to.as_ref(), Some(&remote));
        let pending = engine.table().pending(&remote).expect("remote pending");
        assert_eq!(pending.original_source.as_ref(), Some(&local));
    }

    #[tokio::test]
    async fn test_undersized_extend_request_answered_empty() {
        let (mut engine, sink) = engine_with(ZeroCrypto);
        let peer = addr(1);
        engine.confirm_incoming_segment_established(&peer, SegmentId(4));

        // Next-hop address truncated below address_length: the node
        // cannot extend, so it answers with an empty EXTEND_RESPONSE.
        let packet_data = codec::build_command_data(
            Command::ExtendRequest,
            &[0xEE; 2],
            engine.max_command_data_length(),
        );
        let mut encrypted = packet_data;
        encrypted.extend_from_slice(&[0u8; MAC_LENGTH]);
        let packet = codec::build_packet(PACKET_SIZE, 7, SegmentId(4), &encrypted);
        engine.process_packet(&peer, &packet).await;

        let events = sink.take();
        assert_eq!(events.len(), 1);
        let Recorded::Send(to, out) = &events[0] else {
            panic!("expected send");
        };
        assert_eq!(to, &peer);
        assert_eq!(out[3], Command::ExtendResponse.as_byte());
        assert_eq!(&out[4..6], &[0, 0], "empty response");
    }
}
