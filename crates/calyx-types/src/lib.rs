//! # calyx-types
//!
//! Shared domain types for the Calyx onion-segment routing engine.
//!
//! A *segment* is one hop-to-hop relationship identified by the pair
//! (peer address, segment id). An initiator chains segments into a *path*
//! by extending the first segment one node at a time. All types here are
//! plain data: the engine crate owns the state machine, and cryptography
//! is delegated entirely to the embedding application.

use serde::{Deserialize, Serialize};

/// Number of bytes in the packet envelope before `packet_data`
/// (`version(1) || segment_id(2)`).
pub const PACKET_HEADER_SIZE: usize = 3;

/// Number of bytes in the command framing before `command_data`
/// (`command(1) || command_data_length(2)`).
pub const COMMAND_HEADER_SIZE: usize = 3;

/// Default cap on concurrently pending segments per peer address.
pub const DEFAULT_MAX_PENDING_SEGMENTS: usize = 10;

/// Opaque node address of application-defined, fixed length.
///
/// The engine never interprets address bytes; it only compares them and
/// hands them back to the application. Two addresses are the same node iff
/// their bytes are equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(Vec<u8>);

impl Address {
    /// Wrap raw address bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw address bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Address length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the address is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Address {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", hex::encode(&self.0))
    }
}

/// Segment identifier, scoped per peer address.
///
/// Uniqueness of a segment is the pair (address, segment id) — see
/// [`SourceKey`] — never the id alone. Encoded big-endian on the wire.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SegmentId(pub u16);

impl SegmentId {
    /// Big-endian wire encoding.
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Decode from the two big-endian wire bytes.
    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical identity of a local segment endpoint: (address, segment id).
///
/// Used as the key for every engine table. This is a structural composite
/// key — equal iff both components are equal — so addresses of different
/// lengths can never collide the way concatenated string keys would.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub address: Address,
    pub segment_id: SegmentId,
}

impl SourceKey {
    /// Build a key from a peer address and segment id.
    pub fn new(address: &Address, segment_id: SegmentId) -> Self {
        Self {
            address: address.clone(),
            segment_id,
        }
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.segment_id)
    }
}

/// The six protocol commands.
///
/// Command bytes outside `1..=6` fail to parse and the packet carrying
/// them is ignored by the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    CreateRequest = 1,
    CreateResponse = 2,
    ExtendRequest = 3,
    ExtendResponse = 4,
    Destroy = 5,
    Data = 6,
}

impl Command {
    /// Decode a wire command byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::CreateRequest),
            2 => Some(Self::CreateResponse),
            3 => Some(Self::ExtendRequest),
            4 => Some(Self::ExtendResponse),
            5 => Some(Self::Destroy),
            6 => Some(Self::Data),
            _ => None,
        }
    }

    /// The wire byte for this command.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Errors from [`EngineConfig::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `packet_size` cannot hold the envelope, command framing, one byte of
    /// command data, and the MAC.
    #[error("packet size {packet_size} too small for mac length {mac_length}")]
    PacketSizeTooSmall {
        packet_size: usize,
        mac_length: usize,
    },

    /// `packet_size` is so large that the two-byte `command_data_length`
    /// field could not describe a full payload.
    #[error("packet size {packet_size} exceeds the 16-bit length field")]
    PacketSizeTooLarge { packet_size: usize },

    /// Addresses must have at least one byte.
    #[error("address length must be non-zero")]
    ZeroAddressLength,

    /// The pending-segment cap must allow at least one pending segment.
    #[error("max pending segments must be non-zero")]
    ZeroPendingCap,
}

/// Engine construction parameters.
///
/// `version` is application-specific; packets carrying any other version
/// byte are dropped. `packet_size` fixes the exact on-wire size of every
/// packet. `mac_length` is the overhead the delegated `encrypt` transform
/// adds to a plaintext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub version: u8,
    pub packet_size: usize,
    pub address_length: usize,
    pub mac_length: usize,
    pub max_pending_segments: usize,
}

impl EngineConfig {
    /// Config with the default pending-segment cap of
    /// [`DEFAULT_MAX_PENDING_SEGMENTS`].
    pub fn new(version: u8, packet_size: usize, address_length: usize, mac_length: usize) -> Self {
        Self {
            version,
            packet_size,
            address_length,
            mac_length,
            max_pending_segments: DEFAULT_MAX_PENDING_SEGMENTS,
        }
    }

    /// Override the per-address pending-segment cap.
    pub fn with_max_pending_segments(mut self, cap: usize) -> Self {
        self.max_pending_segments = cap;
        self
    }

    /// Maximum `command_data` length a single packet can carry:
    /// `packet_size - 1 - 2 - 1 - 2 - mac_length`.
    pub fn max_command_data_length(&self) -> usize {
        self.packet_size - PACKET_HEADER_SIZE - COMMAND_HEADER_SIZE - self.mac_length
    }

    /// Check the parameters are mutually consistent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the packet size cannot fit at least one
    /// byte of command data, the address length is zero, or the pending cap
    /// is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_size < PACKET_HEADER_SIZE + COMMAND_HEADER_SIZE + 1 + self.mac_length {
            return Err(ConfigError::PacketSizeTooSmall {
                packet_size: self.packet_size,
                mac_length: self.mac_length,
            });
        }
        if self.max_command_data_length() > usize::from(u16::MAX) {
            return Err(ConfigError::PacketSizeTooLarge {
                packet_size: self.packet_size,
            });
        }
        if self.address_length == 0 {
            return Err(ConfigError::ZeroAddressLength);
        }
        if self.max_pending_segments == 0 {
            return Err(ConfigError::ZeroPendingCap);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_hex() {
        let addr = Address::new(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(addr.to_string(), "deadbeef");
        assert_eq!(addr.len(), 4);
    }

    #[test]
    fn test_source_key_structural_equality() {
        let a = SourceKey::new(&Address::new(vec![1, 2]), SegmentId(3));
        let b = SourceKey::new(&Address::new(vec![1, 2]), SegmentId(3));
        let c = SourceKey::new(&Address::new(vec![1]), SegmentId(0x0203));
        assert_eq!(a, b);
        // A concatenated string key would confuse these two.
        assert_ne!(a, c);
    }

    #[test]
    fn test_segment_id_wire_roundtrip() {
        let id = SegmentId(0xABCD);
        assert_eq!(id.to_be_bytes(), [0xAB, 0xCD]);
        assert_eq!(SegmentId::from_be_bytes([0xAB, 0xCD]), id);
    }

    #[test]
    fn test_command_bytes() {
        for byte in 1..=6u8 {
            let cmd = Command::from_byte(byte).expect("valid command");
            assert_eq!(cmd.as_byte(), byte);
        }
        assert_eq!(Command::from_byte(0), None);
        assert_eq!(Command::from_byte(7), None);
        assert_eq!(Command::from_byte(255), None);
    }

    #[test]
    fn test_max_command_data_length() {
        let config = EngineConfig::new(1, 512, 32, 16);
        assert_eq!(config.max_command_data_length(), 512 - 6 - 16);
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::new(1, 512, 32, 16).validate().is_ok());
        // 6 + mac is one byte short of holding any command data.
        assert!(EngineConfig::new(1, 22, 32, 16).validate().is_err());
        assert!(EngineConfig::new(1, 23, 32, 16).validate().is_ok());
        assert!(EngineConfig::new(1, 512, 0, 16).validate().is_err());
        // 65541 + mac is the largest size the 16-bit length field supports.
        assert!(EngineConfig::new(1, 65541 + 16, 32, 16).validate().is_ok());
        assert!(EngineConfig::new(1, 65542 + 16, 32, 16).validate().is_err());
        assert!(EngineConfig::new(1, 512, 32, 16)
            .with_max_pending_segments(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_default_pending_cap() {
        let config = EngineConfig::new(0, 256, 8, 8);
        assert_eq!(config.max_pending_segments, DEFAULT_MAX_PENDING_SEGMENTS);
    }
}
