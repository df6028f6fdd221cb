//! # calyx-engine
//!
//! Transport-agnostic onion-segment routing engine.
//!
//! The engine builds and maintains multi-hop anonymized routing paths
//! ("segments") over any packet-delivery substrate. It owns:
//!
//! - [`codec`] - fixed-size packet and command framing
//! - [`table`] - per-(address, segment id) lifecycle state with bounded
//!   eviction of pending segments
//! - [`engine`] - the command state machine behind `process_packet` and the
//!   outbound API
//! - [`hooks`] - the injected capabilities: [`hooks::LayerCrypto`] for the
//!   delegated `encrypt`/`decrypt`/`wrap`/`unwrap` transforms and
//!   [`hooks::EventSink`] for notifications (including `send`, the only way
//!   bytes leave the engine)
//!
//! The engine performs no cryptography and no network I/O itself. Every
//! packet is exactly `packet_size` bytes; anything else (or a foreign
//! version byte) is dropped without a trace on the wire. Failures inside a
//! delegated transform are deliberately silent too, so a remote peer cannot
//! distinguish "wrong key" from "no such segment" by error shape.

pub mod codec;
pub mod engine;
pub mod hooks;
mod pipeline;
pub mod table;

pub use calyx_types::{
    Address, Command, ConfigError, EngineConfig, SegmentId, SourceKey,
    DEFAULT_MAX_PENDING_SEGMENTS,
};
pub use engine::Engine;
pub use hooks::{EventSink, LayerCrypto, Rejected};

/// Error types for engine operations.
///
/// Only the fast-fail categories reach callers: malformed inbound packets
/// are dropped silently and transform-stage failures resolve to silence
/// (no `send`, no notification) by design.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Command data exceeds what one packet can carry.
    #[error("command data too long: {len} bytes, max {max}")]
    LengthViolation { len: usize, max: usize },

    /// An address whose length does not match the configured
    /// `address_length` would corrupt framing on the remote side.
    #[error("address length {len} does not match configured {expected}")]
    AddressLengthMismatch { len: usize, expected: usize },

    /// The operation needs an established or pending entry that does not
    /// exist for this (address, segment id).
    #[error("no such segment: {0}")]
    NoSuchSegment(SourceKey),

    /// All 65536 segment ids for one address are concurrently tracked.
    #[error("segment id space exhausted for address {0}")]
    SegmentIdsExhausted(Address),

    /// Invalid construction parameters.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
