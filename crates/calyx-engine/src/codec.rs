//! Fixed-size packet and command-data framing.
//!
//! ## Wire layout
//!
//! ```text
//! packet      = [version:1][segment_id:2 BE][packet_data:packet_size-3]
//! packet_data = [command:1][command_data_length:2 BE][command_data][zero padding]
//! ```
//!
//! A packet is always exactly `packet_size` bytes. Padding bytes are
//! unspecified on decode and zero on encode; they are not authenticated
//! here - for encrypted payloads that is the crypto collaborator's job.
//! Decoding never fails on well-sized input: a truncated length field is
//! clamped to the bytes actually present, and unknown command bytes simply
//! match no state-machine case downstream.

use calyx_types::{Command, SegmentId, COMMAND_HEADER_SIZE, PACKET_HEADER_SIZE};

/// Split a packet into its envelope fields.
///
/// Returns `(version, segment_id, packet_data)`, or `None` if the buffer
/// cannot hold the three-byte envelope. Callers are expected to have
/// verified the exact packet size already.
pub fn parse_packet(packet: &[u8]) -> Option<(u8, SegmentId, &[u8])> {
    if packet.len() < PACKET_HEADER_SIZE {
        return None;
    }
    let version = packet[0];
    let segment_id = SegmentId::from_be_bytes([packet[1], packet[2]]);
    Some((version, segment_id, &packet[PACKET_HEADER_SIZE..]))
}

/// Split `packet_data` into command byte and command data.
///
/// The declared length is clamped to the bytes present so decode is total.
/// Returns `None` only if the buffer cannot hold the command framing.
pub fn parse_command_data(packet_data: &[u8]) -> Option<(u8, &[u8])> {
    if packet_data.len() < COMMAND_HEADER_SIZE {
        return None;
    }
    let command = packet_data[0];
    let declared = usize::from(u16::from_be_bytes([packet_data[1], packet_data[2]]));
    let available = packet_data.len() - COMMAND_HEADER_SIZE;
    let len = declared.min(available);
    Some((
        command,
        &packet_data[COMMAND_HEADER_SIZE..COMMAND_HEADER_SIZE + len],
    ))
}

/// Frame command data: `[command:1][len:2 BE][data][zero padding]`,
/// always `COMMAND_HEADER_SIZE + max_command_data_length` bytes.
///
/// Callers validate `command_data.len() <= max_command_data_length` first;
/// the length also fits `u16` because engine configs reject packet sizes
/// beyond the 16-bit length field.
pub fn build_command_data(
    command: Command,
    command_data: &[u8],
    max_command_data_length: usize,
) -> Vec<u8> {
    debug_assert!(command_data.len() <= max_command_data_length);
    let mut buf = vec![0u8; COMMAND_HEADER_SIZE + max_command_data_length];
    buf[0] = command.as_byte();
    buf[1..3].copy_from_slice(&(command_data.len() as u16).to_be_bytes());
    buf[COMMAND_HEADER_SIZE..COMMAND_HEADER_SIZE + command_data.len()]
        .copy_from_slice(command_data);
    buf
}

/// Assemble a full packet of exactly `packet_size` bytes, zero-padding
/// after `packet_data`.
pub fn build_packet(
    packet_size: usize,
    version: u8,
    segment_id: SegmentId,
    packet_data: &[u8],
) -> Vec<u8> {
    debug_assert!(packet_data.len() <= packet_size - PACKET_HEADER_SIZE);
    let mut buf = vec![0u8; packet_size];
    buf[0] = version;
    buf[1..3].copy_from_slice(&segment_id.to_be_bytes());
    buf[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + packet_data.len()].copy_from_slice(packet_data);
    buf
}
