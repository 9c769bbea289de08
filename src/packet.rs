//! Wire packet codec
//!
//! Packet format (little-endian, fixed 8-byte header + payload):
//!
//! ```text
//! ┌─────────────┬────────┬─────────────┬─────────┬───────┬─────────┐
//! │ UID (4)     │ LEN(1) │ FUNCTION(1) │ OPTS(1) │ FLAGS │ PAYLOAD │
//! │ 0=broadcast │ total  │ discrim.    │ seq/re  │ err   │ 0..64 B │
//! └─────────────┴────────┴─────────────┴─────────┴───────┴─────────┘
//! ```
//!
//! The options byte carries the 4-bit sequence number in bits 4-7 and the
//! response-expected flag in bit 3. The flags byte carries the error code in
//! bits 6-7. Sequence number 0 marks unsolicited callback packets.
//!
//! This module provides:
//! - [`encode_header`]: build a request header, caller appends the payload
//! - field extractors over raw packet bytes (caller guarantees a full header)
//! - [`EnumerateEvent`] and [`Identity`]: parsed discovery payloads

/// Fixed header size in bytes
pub const HEADER_LEN: usize = 8;

/// Largest packet the protocol family produces (firmware-write requests)
pub const MAX_PACKET_LEN: usize = 72;

/// UID addressing every device behind the daemon
pub const BROADCAST_UID: u32 = 0;

/// No-op request used by the disconnect prober
pub const FUNCTION_DISCONNECT_PROBE: u8 = 128;

/// Broadcast discovery request
pub const FUNCTION_ENUMERATE: u8 = 254;

/// Discovery result callback
pub const CALLBACK_ENUMERATE: u8 = 253;

/// Identity getter implemented by every device
pub const FUNCTION_GET_IDENTITY: u8 = 255;

/// Build an 8-byte request header. The caller appends payload bytes up to
/// `length` total.
pub fn encode_header(
    length: u8,
    function_id: u8,
    uid: u32,
    sequence_number: u8,
    response_expected: bool,
) -> [u8; HEADER_LEN] {
    let mut options = sequence_number << 4;
    if response_expected {
        options |= 1 << 3;
    }

    let uid_bytes = uid.to_le_bytes();
    [
        uid_bytes[0],
        uid_bytes[1],
        uid_bytes[2],
        uid_bytes[3],
        length,
        function_id,
        options,
        0,
    ]
}

/// Target device UID
#[inline]
pub fn uid(packet: &[u8]) -> u32 {
    u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]])
}

/// Total packet length including the header
#[inline]
pub fn length(packet: &[u8]) -> u8 {
    packet[4]
}

/// Request/response/callback discriminator
#[inline]
pub fn function_id(packet: &[u8]) -> u8 {
    packet[5]
}

/// 4-bit correlation tag, 0 for unsolicited callbacks
#[inline]
pub fn sequence_number(packet: &[u8]) -> u8 {
    (packet[6] >> 4) & 0x0F
}

/// Whether the sender expects a response to this packet
#[inline]
pub fn response_expected(packet: &[u8]) -> bool {
    (packet[6] >> 3) & 0x01 == 0x01
}

/// 2-bit error code from the flags byte (responses only)
#[inline]
pub fn error_code(packet: &[u8]) -> u8 {
    (packet[7] >> 6) & 0x03
}

/// Payload bytes after the header
#[inline]
pub fn payload(packet: &[u8]) -> &[u8] {
    &packet[HEADER_LEN..]
}

/// Decode a NUL-padded fixed-width ASCII field
fn fixed_str(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect()
}

/// Kind of change an enumerate callback describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationType {
    /// Device answered an explicit enumerate request
    Available,
    /// Device was plugged in or appeared after a reset
    Connected,
    /// Device was unplugged
    Disconnected,
}

impl EnumerationType {
    /// Map the raw wire byte, `None` for values outside the known set
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Available),
            1 => Some(Self::Connected),
            2 => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// Decoded enumerate callback payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerateEvent {
    /// Base58 UID of the answering device
    pub uid: String,
    /// Base58 UID of the brick the device is attached to, "0" for the root
    pub connected_uid: String,
    /// Port/position on the connected brick
    pub position: char,
    /// Hardware version triple (major, minor, revision)
    pub hardware_version: [u8; 3],
    /// Firmware version triple (major, minor, revision)
    pub firmware_version: [u8; 3],
    /// Numeric device type
    pub device_identifier: u16,
    /// Why this callback fired
    pub enumeration_type: EnumerationType,
}

impl EnumerateEvent {
    /// Expected payload size: 8 + 8 + 1 + 3 + 3 + 2 + 1
    pub const PAYLOAD_LEN: usize = 26;

    /// Parse an enumerate callback payload. Returns `None` for truncated
    /// payloads or unknown enumeration types.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::PAYLOAD_LEN {
            return None;
        }

        Some(Self {
            uid: fixed_str(&payload[0..8]),
            connected_uid: fixed_str(&payload[8..16]),
            position: payload[16] as char,
            hardware_version: [payload[17], payload[18], payload[19]],
            firmware_version: [payload[20], payload[21], payload[22]],
            device_identifier: u16::from_le_bytes([payload[23], payload[24]]),
            enumeration_type: EnumerationType::from_u8(payload[25])?,
        })
    }
}

/// Decoded identity response, shared by every device type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Base58 UID of the device
    pub uid: String,
    /// Base58 UID of the brick the device is attached to
    pub connected_uid: String,
    /// Port/position on the connected brick
    pub position: char,
    /// Hardware version triple
    pub hardware_version: [u8; 3],
    /// Firmware version triple
    pub firmware_version: [u8; 3],
    /// Numeric device type
    pub device_identifier: u16,
}

impl Identity {
    /// Expected payload size: 8 + 8 + 1 + 3 + 3 + 2
    pub const PAYLOAD_LEN: usize = 25;

    /// Parse an identity response payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::PAYLOAD_LEN {
            return None;
        }

        Some(Self {
            uid: fixed_str(&payload[0..8]),
            connected_uid: fixed_str(&payload[8..16]),
            position: payload[16] as char,
            hardware_version: [payload[17], payload[18], payload[19]],
            firmware_version: [payload[20], payload[21], payload[22]],
            device_identifier: u16::from_le_bytes([payload[23], payload[24]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        for seq in 1..=15u8 {
            for &re in &[false, true] {
                let header = encode_header(24, 17, 0x1234_5678, seq, re);
                assert_eq!(uid(&header), 0x1234_5678);
                assert_eq!(length(&header), 24);
                assert_eq!(function_id(&header), 17);
                assert_eq!(sequence_number(&header), seq);
                assert_eq!(response_expected(&header), re);
                assert_eq!(error_code(&header), 0);
            }
        }
    }

    #[test]
    fn test_broadcast_header() {
        let header = encode_header(8, FUNCTION_ENUMERATE, BROADCAST_UID, 3, false);
        assert_eq!(uid(&header), 0);
        assert_eq!(function_id(&header), FUNCTION_ENUMERATE);
        assert!(!response_expected(&header));
    }

    #[test]
    fn test_error_code_extraction() {
        let mut packet = encode_header(8, 1, 42, 5, true).to_vec();
        packet[7] = 0b0100_0000;
        assert_eq!(error_code(&packet), 1);
        packet[7] = 0b1000_0000;
        assert_eq!(error_code(&packet), 2);
        packet[7] = 0b1100_0011;
        assert_eq!(error_code(&packet), 3);
    }

    #[test]
    fn test_enumerate_event_parse() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"abc4\0\0\0\0");
        payload.extend_from_slice(b"6yLteY\0\0");
        payload.push(b'c');
        payload.extend_from_slice(&[1, 1, 0]);
        payload.extend_from_slice(&[2, 0, 4]);
        payload.extend_from_slice(&216u16.to_le_bytes());
        payload.push(0);

        let event = EnumerateEvent::parse(&payload).unwrap();
        assert_eq!(event.uid, "abc4");
        assert_eq!(event.connected_uid, "6yLteY");
        assert_eq!(event.position, 'c');
        assert_eq!(event.hardware_version, [1, 1, 0]);
        assert_eq!(event.firmware_version, [2, 0, 4]);
        assert_eq!(event.device_identifier, 216);
        assert_eq!(event.enumeration_type, EnumerationType::Available);
    }

    #[test]
    fn test_enumerate_event_rejects_truncated() {
        assert!(EnumerateEvent::parse(&[0u8; 25]).is_none());
    }

    #[test]
    fn test_enumerate_event_rejects_unknown_type() {
        let mut payload = vec![0u8; EnumerateEvent::PAYLOAD_LEN];
        payload[25] = 7;
        assert!(EnumerateEvent::parse(&payload).is_none());
    }

    #[test]
    fn test_identity_parse() {
        let mut payload = vec![0u8; Identity::PAYLOAD_LEN];
        payload[0..3].copy_from_slice(b"xyz");
        payload[8] = b'0';
        payload[16] = b'a';
        payload[23..25].copy_from_slice(&13u16.to_le_bytes());

        let identity = Identity::parse(&payload).unwrap();
        assert_eq!(identity.uid, "xyz");
        assert_eq!(identity.connected_uid, "0");
        assert_eq!(identity.position, 'a');
        assert_eq!(identity.device_identifier, 13);
    }
}
