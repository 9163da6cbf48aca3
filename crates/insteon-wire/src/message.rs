//! Fixed-layout views over the messages the IM forwards on its buffer.
//!
//! Every message starts with STX (0x02) followed by a type code; body lengths
//! are statically known per type. Bare ACK (0x06) and NAK (0x15) bytes appear
//! interleaved with messages as command echo terminators.

use crate::address::DeviceAddress;
use serde::{Deserialize, Serialize};

/// Start-of-message byte.
pub const STX: u8 = 0x02;
/// Bare acknowledge byte, terminates a successful IM echo.
pub const ACK: u8 = 0x06;
/// Bare negative-acknowledge byte.
pub const NAK: u8 = 0x15;

/// Length of the extended data block (Data1..Data14).
pub const EXTENDED_DATA_LEN: usize = 14;

// Message type codes (second header byte).
pub const MSG_STANDARD: u8 = 0x50;
pub const MSG_EXTENDED: u8 = 0x51;
pub const MSG_X10: u8 = 0x52;
pub const MSG_ALL_LINKING_COMPLETED: u8 = 0x53;
pub const MSG_BUTTON_EVENT: u8 = 0x54;
pub const MSG_USER_RESET: u8 = 0x55;
pub const MSG_CLEANUP_FAILURE: u8 = 0x56;
pub const MSG_ALL_LINK_RECORD: u8 = 0x57;
pub const MSG_CLEANUP_STATUS: u8 = 0x58;

// IM command codes echoed back with an ACK/NAK terminator.
pub const IM_CMD_SEND_MESSAGE: u8 = 0x62;
pub const IM_CMD_START_ALL_LINKING: u8 = 0x64;
pub const IM_CMD_CANCEL_ALL_LINKING: u8 = 0x65;
pub const IM_CMD_GET_FIRST_ALL_LINK_RECORD: u8 = 0x69;
pub const IM_CMD_GET_NEXT_ALL_LINK_RECORD: u8 = 0x6A;
pub const IM_CMD_MANAGE_ALL_LINK_RECORD: u8 = 0x6F;

/// Total on-the-wire length of a standard message including the 2-byte
/// header. The buffer-wrap recovery heuristic peeks exactly this far.
pub const STANDARD_MESSAGE_LEN: usize = 2 + 9;
/// Total length of an extended message including the header.
pub const EXTENDED_MESSAGE_LEN: usize = STANDARD_MESSAGE_LEN + EXTENDED_DATA_LEN;

/// Body length (bytes after the type code) for a given message type code,
/// `None` for codes this engine does not recognize.
pub fn body_len(type_code: u8) -> Option<usize> {
    match type_code {
        MSG_STANDARD => Some(9),
        MSG_EXTENDED => Some(9 + EXTENDED_DATA_LEN),
        MSG_X10 => Some(2),
        MSG_ALL_LINKING_COMPLETED => Some(8),
        MSG_BUTTON_EVENT => Some(1),
        MSG_USER_RESET => Some(0),
        MSG_CLEANUP_FAILURE => Some(5),
        MSG_ALL_LINK_RECORD => Some(8),
        MSG_CLEANUP_STATUS => Some(1),
        _ => None,
    }
}

/// Direction/type classification of a device message, decoded from the top
/// three bits of the message flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    Direct,
    DirectAck,
    DirectNak,
    Broadcast,
    AllLinkBroadcast,
    AllLinkCleanup,
    CleanupAck,
    CleanupNak,
}

impl MessageDirection {
    /// Decode from a raw flags byte.
    pub fn from_flags(flags: u8) -> Self {
        match flags >> 5 {
            0b000 => MessageDirection::Direct,
            0b001 => MessageDirection::DirectAck,
            0b101 => MessageDirection::DirectNak,
            0b100 => MessageDirection::Broadcast,
            0b110 => MessageDirection::AllLinkBroadcast,
            0b010 => MessageDirection::AllLinkCleanup,
            0b011 => MessageDirection::CleanupAck,
            _ => MessageDirection::CleanupNak,
        }
    }
}

/// The extended-message bit of the flags byte.
pub fn flags_extended(flags: u8) -> bool {
    flags & 0x10 != 0
}

/// A decoded standard message (type 0x50).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardMessage {
    pub from: DeviceAddress,
    pub to: DeviceAddress,
    pub flags: u8,
    pub cmd1: u8,
    pub cmd2: u8,
}

impl StandardMessage {
    /// Decode from the 9 body bytes following `02 50`.
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < 9 {
            return None;
        }
        Some(StandardMessage {
            from: DeviceAddress::from_bytes(&body[0..3])?,
            to: DeviceAddress::from_bytes(&body[3..6])?,
            flags: body[6],
            cmd1: body[7],
            cmd2: body[8],
        })
    }

    pub fn direction(&self) -> MessageDirection {
        MessageDirection::from_flags(self.flags)
    }
}

/// A decoded extended message (type 0x51).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedMessage {
    pub header: StandardMessage,
    pub data: [u8; EXTENDED_DATA_LEN],
}

impl ExtendedMessage {
    /// Decode from the 23 body bytes following `02 51`.
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < 9 + EXTENDED_DATA_LEN {
            return None;
        }
        let header = StandardMessage::decode(&body[0..9])?;
        let mut data = [0u8; EXTENDED_DATA_LEN];
        data.copy_from_slice(&body[9..9 + EXTENDED_DATA_LEN]);
        Some(ExtendedMessage { header, data })
    }

    /// Whether Data14 checks out against Command1/Command2 and Data1..Data13.
    pub fn checksum_ok(&self) -> bool {
        crate::checksum::verify_checksum(
            self.header.cmd1,
            self.header.cmd2,
            &self.data[..13],
            self.data[13],
        )
    }
}

/// An all-link database record as it appears in 0x57 messages and in the
/// payload of record-management commands:
/// `[flags][group][destination:3][data1][data2][data3]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllLinkRecordMessage {
    pub flags: u8,
    pub group: u8,
    pub destination: DeviceAddress,
    pub data: [u8; 3],
}

impl AllLinkRecordMessage {
    /// Decode from the 8 body bytes following `02 57`.
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < 8 {
            return None;
        }
        Some(AllLinkRecordMessage {
            flags: body[0],
            group: body[1],
            destination: DeviceAddress::from_bytes(&body[2..5])?,
            data: [body[5], body[6], body[7]],
        })
    }

    /// Encode into the 8-byte wire form.
    pub fn encode(&self) -> [u8; 8] {
        let d = self.destination.bytes();
        [
            self.flags,
            self.group,
            d[0],
            d[1],
            d[2],
            self.data[0],
            self.data[1],
            self.data[2],
        ]
    }
}

/// The asynchronous 0x53 broadcast that closes an all-linking session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllLinkingCompleted {
    /// Link code the session was started with (responder/controller/delete).
    pub link_code: u8,
    pub group: u8,
    /// The device that ended up linked.
    pub device: DeviceAddress,
    pub device_category: u8,
    pub device_subcategory: u8,
    pub firmware_version: u8,
}

impl AllLinkingCompleted {
    /// Decode from the 8 body bytes following `02 53`.
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < 8 {
            return None;
        }
        Some(AllLinkingCompleted {
            link_code: body[0],
            group: body[1],
            device: DeviceAddress::from_bytes(&body[2..5])?,
            device_category: body[5],
            device_subcategory: body[6],
            firmware_version: body[7],
        })
    }
}

/// The 0x56 all-link cleanup failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub group: u8,
    pub device: DeviceAddress,
}

impl CleanupFailure {
    /// Decode from the 5 body bytes following `02 56`.
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < 5 {
            return None;
        }
        Some(CleanupFailure {
            group: body[1],
            device: DeviceAddress::from_bytes(&body[2..5])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_lengths() {
        assert_eq!(body_len(MSG_STANDARD), Some(9));
        assert_eq!(body_len(MSG_EXTENDED), Some(23));
        assert_eq!(body_len(MSG_ALL_LINK_RECORD), Some(8));
        assert_eq!(body_len(MSG_USER_RESET), Some(0));
        assert_eq!(body_len(0x99), None);
    }

    #[test]
    fn test_direction_decoding() {
        assert_eq!(MessageDirection::from_flags(0x00), MessageDirection::Direct);
        assert_eq!(MessageDirection::from_flags(0x2F), MessageDirection::DirectAck);
        assert_eq!(MessageDirection::from_flags(0xAF), MessageDirection::DirectNak);
        assert_eq!(MessageDirection::from_flags(0x8F), MessageDirection::Broadcast);
        assert_eq!(
            MessageDirection::from_flags(0xCF),
            MessageDirection::AllLinkBroadcast
        );
        assert_eq!(
            MessageDirection::from_flags(0x41),
            MessageDirection::AllLinkCleanup
        );
        assert_eq!(MessageDirection::from_flags(0x65), MessageDirection::CleanupAck);
        assert_eq!(MessageDirection::from_flags(0xE5), MessageDirection::CleanupNak);
    }

    #[test]
    fn test_standard_decode() {
        let body = [0x1A, 0x2B, 0x3C, 0x11, 0x22, 0x33, 0x2F, 0x19, 0x02];
        let msg = StandardMessage::decode(&body).unwrap();
        assert_eq!(msg.from, DeviceAddress::new(0x1A, 0x2B, 0x3C));
        assert_eq!(msg.to, DeviceAddress::new(0x11, 0x22, 0x33));
        assert_eq!(msg.direction(), MessageDirection::DirectAck);
        assert_eq!((msg.cmd1, msg.cmd2), (0x19, 0x02));
        assert!(StandardMessage::decode(&body[..8]).is_none());
    }

    #[test]
    fn test_extended_decode_and_checksum() {
        let mut body = vec![0x1A, 0x2B, 0x3C, 0x11, 0x22, 0x33, 0x1F, 0x2F, 0x00];
        let mut data = [0u8; EXTENDED_DATA_LEN];
        data[1] = 0x01;
        data[2] = 0x0F;
        data[3] = 0xFF;
        data[13] = crate::checksum::compute_checksum(0x2F, 0x00, &data[..13]);
        body.extend_from_slice(&data);
        let msg = ExtendedMessage::decode(&body).unwrap();
        assert!(flags_extended(msg.header.flags));
        assert!(msg.checksum_ok());
    }

    #[test]
    fn test_record_roundtrip() {
        let rec = AllLinkRecordMessage {
            flags: 0xE2,
            group: 0x01,
            destination: DeviceAddress::new(0x0A, 0x0B, 0x0C),
            data: [1, 2, 3],
        };
        assert_eq!(AllLinkRecordMessage::decode(&rec.encode()), Some(rec));
    }

    #[test]
    fn test_linking_completed_decode() {
        let body = [0x01, 0x05, 0x1A, 0x2B, 0x3C, 0x02, 0x09, 0x41];
        let done = AllLinkingCompleted::decode(&body).unwrap();
        assert_eq!(done.link_code, 0x01);
        assert_eq!(done.group, 0x05);
        assert_eq!(done.device, DeviceAddress::new(0x1A, 0x2B, 0x3C));
    }
}
