//! Command values and their in-flight state.
//!
//! A [`Command`] is a plain value describing intent: how to frame the request
//! line, what the hub should echo back, and what completes it. The per-kind
//! completion logic lives in [`PendingCommand::handle_event`] as a pure
//! function from (event, state) to a [`Step`], which keeps the dispatcher
//! generic and the command set flat.

use crate::error::ErrorKind;
use crate::events::{Step, StreamEvent};
use insteon_wire::{
    compute_checksum, AllLinkRecordMessage, AllLinkingCompleted, ExtendedMessage,
    MessageDirection, StandardMessage, DeviceAddress, EXTENDED_DATA_LEN,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Default attempt budget for leaf commands.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default progress deadline for a response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for waits that involve a human pressing a SET button.
pub const LINKING_RESPONSE_TIMEOUT: Duration = Duration::from_secs(240);

/// Consecutive bad-checksum extended responses tolerated before the command
/// asks for a hub buffer clear.
const MAX_INVALID_EXTENDED: u32 = 3;

/// How the request line is assembled for the hub gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandClass {
    /// `/0?<code><params>=I=0`
    Bare,
    /// `/1?<code><params>=M=1`
    Hub,
    /// `/2?<code><params>` — no trailing suffix.
    HubConfig,
    /// `/3?02<code><params>=I=3` — raw IM message.
    RawIm,
}

impl CommandClass {
    fn token(&self) -> &'static str {
        match self {
            CommandClass::Bare => "0",
            CommandClass::Hub => "1",
            CommandClass::HubConfig => "2",
            CommandClass::RawIm => "3",
        }
    }

    fn direction_suffix(&self) -> Option<&'static str> {
        match self {
            CommandClass::Bare | CommandClass::RawIm => Some("I"),
            CommandClass::Hub => Some("M"),
            CommandClass::HubConfig => None,
        }
    }
}

/// The 2-byte device command plus optional 14-byte extended block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFrame {
    pub cmd1: u8,
    pub cmd2: u8,
    pub data: Option<[u8; EXTENDED_DATA_LEN]>,
}

impl DeviceFrame {
    /// A standard (ack/echo only) device command.
    pub fn standard(cmd1: u8, cmd2: u8) -> Self {
        DeviceFrame {
            cmd1,
            cmd2,
            data: None,
        }
    }

    /// An extended device command; Data14 gets the checksum.
    pub fn extended(cmd1: u8, cmd2: u8, data13: [u8; 13]) -> Self {
        let mut data = [0u8; EXTENDED_DATA_LEN];
        data[..13].copy_from_slice(&data13);
        data[13] = compute_checksum(cmd1, cmd2, &data13);
        DeviceFrame {
            cmd1,
            cmd2,
            data: Some(data),
        }
    }

    /// Message flags byte for a direct send: 0x0F standard, 0x1F extended.
    pub fn flags(&self) -> u8 {
        if self.data.is_some() {
            0x1F
        } else {
            0x0F
        }
    }
}

/// What completes a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Complete on the IM echo ACK (or bare ACK for bare/hub classes).
    ImAck,
    /// Hub-config requests get no readable response; sending is completing.
    FireAndForget,
    /// Echo ACK, then a standard direct-ACK from the target device.
    DeviceStandard,
    /// Echo ACK, then an extended message from the target device.
    DeviceExtended,
    /// Echo ACK, then a stream of extended messages; the quiet deadline ends
    /// the stream. Used by the unreliable bulk database read.
    ExtendedStream,
    /// Echo ACK, then a follow-on 0x57 all-link record.
    AllLinkRecord,
    /// Echo ACK, then the asynchronous 0x53 all-linking-completed broadcast.
    AllLinkingCompleted,
}

/// A command value: everything the state machine needs to frame, send and
/// complete one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Short name for traces.
    pub name: &'static str,
    pub class: CommandClass,
    /// Command code as it appears on the request line ("62", "XB", ...).
    pub code: String,
    /// Hex parameter string appended after the code.
    pub params: String,
    /// Target device; `NONE` for hub-addressed commands.
    pub target: DeviceAddress,
    /// Device command framing, present on device-addressed sends.
    pub frame: Option<DeviceFrame>,
    pub kind: CommandKind,
    pub max_attempts: u32,
    pub response_timeout: Duration,
}

impl Command {
    /// A raw-IM command with a hex code byte.
    pub fn raw_im(name: &'static str, code: u8, params: String, kind: CommandKind) -> Self {
        Command {
            name,
            class: CommandClass::RawIm,
            code: format!("{:02X}", code),
            params,
            target: DeviceAddress::NONE,
            frame: None,
            kind,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// A hub-class command (e.g. buffer management).
    pub fn hub(name: &'static str, code: impl Into<String>, params: impl Into<String>) -> Self {
        Command {
            name,
            class: CommandClass::Hub,
            code: code.into(),
            params: params.into(),
            target: DeviceAddress::NONE,
            frame: None,
            kind: CommandKind::ImAck,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// A hub-config command; completes on send.
    pub fn hub_config(name: &'static str, code: impl Into<String>, params: impl Into<String>) -> Self {
        Command {
            name,
            class: CommandClass::HubConfig,
            code: code.into(),
            params: params.into(),
            target: DeviceAddress::NONE,
            frame: None,
            kind: CommandKind::FireAndForget,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// A device-addressed send (IM 0x62) framing Command1/Command2 and the
    /// optional extended block.
    pub fn device(name: &'static str, target: DeviceAddress, frame: DeviceFrame) -> Self {
        let mut params = format!(
            "{}{:02X}{:02X}{:02X}",
            target.to_hex(),
            frame.flags(),
            frame.cmd1,
            frame.cmd2
        );
        if let Some(data) = &frame.data {
            for b in data {
                params.push_str(&format!("{:02X}", b));
            }
        }
        let kind = if frame.data.is_some() {
            CommandKind::DeviceExtended
        } else {
            CommandKind::DeviceStandard
        };
        Command {
            name,
            class: CommandClass::RawIm,
            code: format!("{:02X}", insteon_wire::message::IM_CMD_SEND_MESSAGE),
            params,
            target,
            frame: Some(frame),
            kind,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Assemble the request line, byte-for-byte what the gateway expects.
    pub fn request_line(&self) -> String {
        let token = self.class.token();
        let prefix = match self.class {
            CommandClass::RawIm => "02",
            _ => "",
        };
        match self.class.direction_suffix() {
            Some(dir) => format!(
                "/{}?{}{}{}={}={}",
                token, prefix, self.code, self.params, dir, token
            ),
            None => format!("/{}?{}{}{}", token, prefix, self.code, self.params),
        }
    }

    /// The echo type byte the IM will use, when the code is a hex byte.
    pub fn echo_code(&self) -> Option<u8> {
        u8::from_str_radix(&self.code, 16).ok()
    }

    /// Bytes of parameters the IM echoes back before the ACK/NAK terminator.
    pub fn echo_body_len(&self) -> usize {
        self.params.len() / 2
    }
}

/// Captured responses, exposed as typed accessors instead of
/// panicking "accessed before completion" properties.
#[derive(Debug, Clone, Default)]
pub struct ResponseSlot {
    pub standard: Option<StandardMessage>,
    pub extended: Option<ExtendedMessage>,
    pub extended_stream: Vec<ExtendedMessage>,
    pub record: Option<AllLinkRecordMessage>,
    pub linking: Option<AllLinkingCompleted>,
}

/// A completed command: its outcome plus whatever responses were captured.
#[derive(Debug)]
pub struct CommandReply {
    pub outcome: crate::error::CommandOutcome,
    pub response: ResponseSlot,
}

/// A command in flight: the value plus its parse state for one attempt.
#[derive(Debug)]
pub struct PendingCommand {
    pub command: Command,
    pub response: ResponseSlot,
    echo_acked: bool,
    invalid_extended: u32,
}

impl PendingCommand {
    pub fn new(command: Command) -> Self {
        PendingCommand {
            command,
            response: ResponseSlot::default(),
            echo_acked: false,
            invalid_extended: 0,
        }
    }

    /// Reset per-attempt state so the same command can be retried.
    pub fn reset(&mut self) {
        self.response = ResponseSlot::default();
        self.echo_acked = false;
        self.invalid_extended = 0;
    }

    pub fn echo_acked(&self) -> bool {
        self.echo_acked
    }

    /// Which kind a progress timeout maps to, given how far we got.
    pub fn timeout_kind(&self) -> ErrorKind {
        if !self.echo_acked {
            return ErrorKind::NoHubResponse;
        }
        match self.command.kind {
            CommandKind::DeviceStandard => ErrorKind::NoDeviceStandardResponse,
            CommandKind::DeviceExtended => {
                // distinguish "no reply at all" from "acked but no payload"
                if self.response.standard.is_some() {
                    ErrorKind::NoDeviceExtendedResponse
                } else {
                    ErrorKind::NoDeviceResponse
                }
            }
            CommandKind::ExtendedStream => ErrorKind::NoDeviceExtendedResponse,
            CommandKind::AllLinkRecord => ErrorKind::NoRecordResponse,
            CommandKind::AllLinkingCompleted => ErrorKind::Timeout,
            CommandKind::ImAck | CommandKind::FireAndForget => ErrorKind::NoHubResponse,
        }
    }

    /// The per-kind completion function: (event, state) -> step.
    pub fn handle_event(&mut self, event: &StreamEvent) -> Step {
        match event {
            StreamEvent::ImAck { code } | StreamEvent::ImNak { code }
                if Some(*code) != self.command.echo_code() =>
            {
                // stale echo from an earlier exchange; not ours
                debug!(command = self.command.name, code, "ignoring foreign echo");
                Step::Continue
            }
            StreamEvent::ImAck { .. } | StreamEvent::HubAck => {
                self.echo_acked = true;
                match self.command.kind {
                    CommandKind::ImAck | CommandKind::FireAndForget => Step::Complete,
                    _ => Step::Continue,
                }
            }
            StreamEvent::ImNak { .. } | StreamEvent::HubNak => Step::Fail(ErrorKind::Nak),
            StreamEvent::Standard(msg) => self.on_standard(msg),
            StreamEvent::Extended(msg) => self.on_extended(msg),
            StreamEvent::AllLinkRecord(rec) => {
                if self.command.kind == CommandKind::AllLinkRecord {
                    self.response.record = Some(*rec);
                    Step::Complete
                } else {
                    Step::Continue
                }
            }
            StreamEvent::AllLinkingCompleted(done) => {
                if self.command.kind == CommandKind::AllLinkingCompleted {
                    self.response.linking = Some(done.clone());
                    Step::Complete
                } else {
                    Step::Continue
                }
            }
            // informational traffic; progress, but not ours to complete on
            StreamEvent::CleanupFailure(_)
            | StreamEvent::ButtonEvent { .. }
            | StreamEvent::UserReset
            | StreamEvent::CleanupStatus { .. }
            | StreamEvent::X10 { .. } => Step::Continue,
        }
    }

    fn on_standard(&mut self, msg: &StandardMessage) -> Step {
        if !self.command.target.is_none() && msg.from != self.command.target {
            return Step::Continue;
        }
        match msg.direction() {
            MessageDirection::DirectAck => {
                self.response.standard = Some(msg.clone());
                match self.command.kind {
                    CommandKind::DeviceStandard => Step::Complete,
                    // keep waiting for the extended payload
                    _ => Step::Continue,
                }
            }
            MessageDirection::DirectNak => {
                let same_echo = self
                    .command
                    .frame
                    .map(|f| f.cmd2 == msg.cmd2)
                    .unwrap_or(false);
                if matches!(
                    self.command.kind,
                    CommandKind::DeviceExtended | CommandKind::ExtendedStream
                ) && same_echo
                {
                    // some devices NAK the echo of an extended request and
                    // then answer anyway; observed quirk, not a failure
                    debug!(command = self.command.name, "ignoring same-echo direct NAK");
                    Step::Continue
                } else {
                    Step::Fail(ErrorKind::Nak)
                }
            }
            // broadcast/cleanup traffic: progress only
            _ => Step::Continue,
        }
    }

    fn on_extended(&mut self, msg: &ExtendedMessage) -> Step {
        if !self.command.target.is_none() && msg.header.from != self.command.target {
            return Step::Continue;
        }
        if !matches!(
            self.command.kind,
            CommandKind::DeviceExtended | CommandKind::ExtendedStream
        ) {
            return Step::Continue;
        }
        if !msg.checksum_ok() {
            self.invalid_extended += 1;
            warn!(
                command = self.command.name,
                count = self.invalid_extended,
                "extended response failed checksum"
            );
            if self.invalid_extended >= MAX_INVALID_EXTENDED {
                self.invalid_extended = 0;
                return Step::ClearBuffer;
            }
            return Step::Continue;
        }
        self.invalid_extended = 0;
        match self.command.kind {
            CommandKind::DeviceExtended => {
                self.response.extended = Some(msg.clone());
                Step::Complete
            }
            _ => {
                self.response.extended_stream.push(msg.clone());
                Step::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insteon_wire::message::{IM_CMD_GET_FIRST_ALL_LINK_RECORD, IM_CMD_SEND_MESSAGE};

    fn dest() -> DeviceAddress {
        DeviceAddress::new(0x1A, 0x2B, 0x3C)
    }

    #[test]
    fn test_request_line_classes() {
        let bare = Command {
            name: "bare",
            class: CommandClass::Bare,
            code: "FF".into(),
            params: String::new(),
            target: DeviceAddress::NONE,
            frame: None,
            kind: CommandKind::ImAck,
            max_attempts: 1,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        };
        assert_eq!(bare.request_line(), "/0?FF=I=0");

        let hub = Command::hub("clear", "XB", "");
        assert_eq!(hub.request_line(), "/1?XB=M=1");

        let cfg = Command::hub_config("cfg", "S2", "14");
        assert_eq!(cfg.request_line(), "/2?S214");

        let im = Command::raw_im(
            "get_first",
            IM_CMD_GET_FIRST_ALL_LINK_RECORD,
            String::new(),
            CommandKind::AllLinkRecord,
        );
        assert_eq!(im.request_line(), "/3?0269=I=3");
    }

    #[test]
    fn test_device_command_framing() {
        let cmd = Command::device("on", dest(), DeviceFrame::standard(0x11, 0xFF));
        assert_eq!(cmd.request_line(), "/3?02621A2B3C0F11FF=I=3");
        assert_eq!(cmd.kind, CommandKind::DeviceStandard);
        assert_eq!(cmd.echo_code(), Some(IM_CMD_SEND_MESSAGE));
        assert_eq!(cmd.echo_body_len(), 6);
    }

    #[test]
    fn test_extended_framing_carries_checksum() {
        let mut data13 = [0u8; 13];
        data13[1] = 0x00;
        data13[2] = 0x0F;
        data13[3] = 0xFF;
        data13[4] = 0x01;
        let frame = DeviceFrame::extended(0x2F, 0x00, data13);
        let data = frame.data.unwrap();
        assert_eq!(data[13], compute_checksum(0x2F, 0x00, &data13));
        let cmd = Command::device("read_record", dest(), frame);
        assert_eq!(cmd.kind, CommandKind::DeviceExtended);
        // 3 addr + flags + cmd1 + cmd2 + 14 data
        assert_eq!(cmd.echo_body_len(), 20);
        assert!(cmd.request_line().starts_with("/3?02621A2B3C1F2F00"));
    }

    #[test]
    fn test_standard_ack_completes_device_standard() {
        let mut pending = PendingCommand::new(Command::device(
            "on",
            dest(),
            DeviceFrame::standard(0x11, 0xFF),
        ));
        assert_eq!(
            pending.handle_event(&StreamEvent::ImAck { code: 0x62 }),
            Step::Continue
        );
        assert!(pending.echo_acked());
        let ack = StandardMessage {
            from: dest(),
            to: DeviceAddress::new(1, 1, 1),
            flags: 0x2F,
            cmd1: 0x11,
            cmd2: 0xFF,
        };
        assert_eq!(
            pending.handle_event(&StreamEvent::Standard(ack)),
            Step::Complete
        );
        assert!(pending.response.standard.is_some());
    }

    #[test]
    fn test_foreign_device_traffic_ignored() {
        let mut pending = PendingCommand::new(Command::device(
            "on",
            dest(),
            DeviceFrame::standard(0x11, 0xFF),
        ));
        let other = StandardMessage {
            from: DeviceAddress::new(9, 9, 9),
            to: DeviceAddress::new(1, 1, 1),
            flags: 0x2F,
            cmd1: 0x11,
            cmd2: 0xFF,
        };
        assert_eq!(
            pending.handle_event(&StreamEvent::Standard(other)),
            Step::Continue
        );
    }

    #[test]
    fn test_same_echo_direct_nak_ignored_for_extended() {
        let frame = DeviceFrame::extended(0x2F, 0x00, [0; 13]);
        let mut pending = PendingCommand::new(Command::device("read", dest(), frame));
        let nak = StandardMessage {
            from: dest(),
            to: DeviceAddress::new(1, 1, 1),
            flags: 0xAF,
            cmd1: 0x2F,
            cmd2: 0x00,
        };
        assert_eq!(
            pending.handle_event(&StreamEvent::Standard(nak.clone())),
            Step::Continue
        );
        // a NAK with a different cmd2 is a real failure
        let real_nak = StandardMessage { cmd2: 0xFD, ..nak };
        assert_eq!(
            pending.handle_event(&StreamEvent::Standard(real_nak)),
            Step::Fail(ErrorKind::Nak)
        );
    }

    #[test]
    fn test_bad_checksums_request_buffer_clear() {
        let frame = DeviceFrame::extended(0x2F, 0x00, [0; 13]);
        let mut pending = PendingCommand::new(Command::device("read", dest(), frame));
        let mut msg = ExtendedMessage {
            header: StandardMessage {
                from: dest(),
                to: DeviceAddress::new(1, 1, 1),
                flags: 0x1F,
                cmd1: 0x2F,
                cmd2: 0x00,
            },
            data: [0u8; EXTENDED_DATA_LEN],
        };
        msg.data[13] = 0x55; // wrong checksum
        assert_eq!(pending.handle_event(&StreamEvent::Extended(msg.clone())), Step::Continue);
        assert_eq!(pending.handle_event(&StreamEvent::Extended(msg.clone())), Step::Continue);
        assert_eq!(pending.handle_event(&StreamEvent::Extended(msg)), Step::ClearBuffer);
    }

    #[test]
    fn test_timeout_kind_progression() {
        let frame = DeviceFrame::extended(0x2F, 0x00, [0; 13]);
        let mut pending = PendingCommand::new(Command::device("read", dest(), frame));
        assert_eq!(pending.timeout_kind(), ErrorKind::NoHubResponse);
        pending.handle_event(&StreamEvent::ImAck { code: 0x62 });
        assert_eq!(pending.timeout_kind(), ErrorKind::NoDeviceResponse);
        let ack = StandardMessage {
            from: dest(),
            to: DeviceAddress::new(1, 1, 1),
            flags: 0x2F,
            cmd1: 0x2F,
            cmd2: 0x00,
        };
        pending.handle_event(&StreamEvent::Standard(ack));
        assert_eq!(pending.timeout_kind(), ErrorKind::NoDeviceExtendedResponse);
    }
}
