//! Injected capabilities: delegated crypto transforms and notifications.
//!
//! The engine never touches key material or sockets. The embedding
//! application supplies a [`LayerCrypto`] that performs the four transforms
//! and an [`EventSink`] that receives notifications - `send` being the one
//! that actually puts bytes on whatever substrate the application uses.
//!
//! ## Transform contracts
//!
//! | Operation | Output length |
//! |---|---|
//! | `encrypt` | `plaintext.len() + mac_length` |
//! | `decrypt` | `ciphertext.len() - mac_length` |
//! | `wrap` | unchanged |
//! | `unwrap` | unchanged |
//!
//! The engine verifies these after every call; a wrong-length buffer counts
//! as [`Rejected`]. `decrypt` doubles as the authenticity check during
//! trial decryption: it must reject ciphertext produced for a different
//! hop key, or the cumulative-peel algorithm cannot find the true sender.

use async_trait::async_trait;

use calyx_types::{Address, SegmentId, SourceKey};

/// A transform handler declined the operation (wrong key, failed
/// authentication, or a violated length contract).
///
/// Never surfaced to callers of the outbound API: a rejected transform
/// resolves to silence so response shape leaks nothing to remote peers.
#[derive(Debug, thiserror::Error)]
#[error("transform rejected")]
pub struct Rejected;

/// Delegated cryptography, keyed by the application.
///
/// `key` identifies the local segment endpoint the operation belongs to,
/// and `target_address` the hop whose key material applies - for a
/// multi-hop path these differ. How keys are negotiated and looked up is
/// entirely the application's business (a non-goal of the engine).
#[async_trait]
pub trait LayerCrypto: Send + Sync {
    /// Produce ciphertext of `plaintext.len() + mac_length` bytes for the
    /// target hop.
    async fn encrypt(
        &self,
        key: &SourceKey,
        target_address: &Address,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Rejected>;

    /// Recover plaintext of `ciphertext.len() - mac_length` bytes, or
    /// reject if the ciphertext was not produced for `target_address`'s
    /// key (this rejection drives trial decryption).
    async fn decrypt(
        &self,
        key: &SourceKey,
        target_address: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Rejected>;

    /// Apply one length-preserving, hop-keyed layer.
    async fn wrap(
        &self,
        key: &SourceKey,
        target_address: &Address,
        unwrapped: &[u8],
    ) -> Result<Vec<u8>, Rejected>;

    /// Peel one length-preserving, hop-keyed layer.
    async fn unwrap(
        &self,
        key: &SourceKey,
        target_address: &Address,
        wrapped: &[u8],
    ) -> Result<Vec<u8>, Rejected>;
}

/// Notifications emitted by the engine.
///
/// All methods default to no-ops so an application only implements the
/// events it cares about. Delivery is awaited in call order; the engine
/// ignores nothing here on purpose - `send` is how packets leave the node.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// A packet of exactly `packet_size` bytes must be delivered to the
    /// peer at `address`.
    async fn send(&self, address: &Address, packet: Vec<u8>) {
        let _ = (address, packet);
    }

    /// An unsolicited CREATE_REQUEST arrived; the application decides
    /// whether to answer with `create_response` and
    /// `confirm_incoming_segment_established`.
    async fn create_request(&self, address: &Address, segment_id: SegmentId, command_data: Vec<u8>) {
        let _ = (address, segment_id, command_data);
    }

    /// A CREATE_RESPONSE for a segment this node requested; the
    /// application should verify it and call
    /// `confirm_outgoing_segment_established`.
    async fn create_response(
        &self,
        address: &Address,
        segment_id: SegmentId,
        command_data: Vec<u8>,
    ) {
        let _ = (address, segment_id, command_data);
    }

    /// An EXTEND_RESPONSE for an in-flight extension; the application
    /// should verify it and call `confirm_extended_path`.
    async fn extend_response(
        &self,
        address: &Address,
        segment_id: SegmentId,
        command_data: Vec<u8>,
    ) {
        let _ = (address, segment_id, command_data);
    }

    /// The remote initiator destroyed an incoming established segment.
    async fn destroy(&self, address: &Address, segment_id: SegmentId) {
        let _ = (address, segment_id);
    }

    /// Application data arrived on an established segment;
    /// `target_address` is the hop it was decrypted from.
    async fn data(
        &self,
        address: &Address,
        segment_id: SegmentId,
        target_address: &Address,
        command_data: Vec<u8>,
    ) {
        let _ = (address, segment_id, target_address, command_data);
    }
}
