//! All-linking session orchestration (IM 0x64 / 0x65).
//!
//! Entering linking mode arms the IM and then waits for the asynchronous
//! 0x53 all-linking-completed broadcast, which normally arrives only after a
//! human presses a SET button; the wait runs with the long button deadline.
//! A target device can be pre-armed remotely with the enter-linking command
//! so no button press is needed on that end.

use crate::command::{Command, CommandKind, DeviceFrame, LINKING_RESPONSE_TIMEOUT};
use crate::error::CommandOutcome;
use crate::session::{CancelToken, HubSession};
use insteon_wire::message::{IM_CMD_CANCEL_ALL_LINKING, IM_CMD_START_ALL_LINKING};
use insteon_wire::{AllLinkingCompleted, DeviceAddress};
use tracing::{info, warn};

/// Remote enter-linking-mode device command.
const CMD_ENTER_LINKING: u8 = 0x09;
/// Remote enter-unlinking-mode device command.
const CMD_ENTER_UNLINKING: u8 = 0x0A;

/// Link code passed to start-all-linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkingMode {
    /// The IM responds to the other device.
    Responder = 0x00,
    /// The IM controls the other device.
    Controller = 0x01,
    /// Whichever side initiates second becomes the responder.
    Auto = 0x03,
    /// Delete the link instead of creating it.
    Delete = 0xFF,
}

/// Result of a linking session.
#[derive(Debug)]
pub struct LinkingReport {
    pub outcome: CommandOutcome,
    /// The completion broadcast, when one arrived.
    pub completed: Option<AllLinkingCompleted>,
}

fn start_linking_command(mode: LinkingMode, group: u8) -> Command {
    let params = format!("{:02X}{:02X}", mode as u8, group);
    // completion depends on a button press; retrying would re-arm the IM
    Command::raw_im(
        "start_all_linking",
        IM_CMD_START_ALL_LINKING,
        params,
        CommandKind::AllLinkingCompleted,
    )
    .with_max_attempts(1)
    .with_response_timeout(LINKING_RESPONSE_TIMEOUT)
}

fn pre_arm_command(device: DeviceAddress, mode: LinkingMode, group: u8) -> Command {
    let cmd1 = match mode {
        LinkingMode::Delete => CMD_ENTER_UNLINKING,
        _ => CMD_ENTER_LINKING,
    };
    // extended frame (i2cs devices require the checksum) but the reply is a
    // plain standard ACK
    Command::device(
        "enter_linking_mode",
        device,
        DeviceFrame::extended(cmd1, group, [0u8; 13]),
    )
    .with_kind(CommandKind::DeviceStandard)
}

/// Put the IM into all-linking mode and wait for the session to complete.
///
/// With a `device`, that device is first told to enter linking mode itself,
/// so the whole link forms without anyone touching hardware. On
/// cancellation the IM is told to stand down with 0x65 before returning.
pub async fn start_linking(
    session: &HubSession,
    mode: LinkingMode,
    group: u8,
    device: Option<DeviceAddress>,
    cancel: &CancelToken,
) -> LinkingReport {
    let guard = session.gate.acquire("start_linking").await;

    if let Some(target) = device {
        let reply = session
            .run_sub(pre_arm_command(target, mode, group), cancel)
            .await;
        if !reply.outcome.success {
            warn!(device = %target, error = %reply.outcome.error, "device refused linking mode");
            drop(guard);
            return LinkingReport {
                outcome: reply.outcome,
                completed: None,
            };
        }
    }

    let reply = session
        .run_sub(start_linking_command(mode, group), cancel)
        .await;

    if reply.outcome.is_cancelled() || (!reply.outcome.success && device.is_some()) {
        // stand the IM down so it does not link with the next button press;
        // the session token is already tripped, so use a fresh one
        let cancel_im = Command::raw_im(
            "cancel_all_linking",
            IM_CMD_CANCEL_ALL_LINKING,
            String::new(),
            CommandKind::ImAck,
        );
        let stand_down = session.run_sub(cancel_im, &CancelToken::new()).await;
        if !stand_down.outcome.success {
            warn!(error = %stand_down.outcome.error, "failed to cancel all-linking");
        }
    }
    drop(guard);

    if let Some(done) = &reply.response.linking {
        info!(
            device = %done.device,
            group = done.group,
            link_code = done.link_code,
            "all-linking completed"
        );
    }
    LinkingReport {
        outcome: reply.outcome,
        completed: reply.response.linking,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_linking_framing() {
        let cmd = start_linking_command(LinkingMode::Controller, 0x2A);
        assert_eq!(cmd.request_line(), "/3?0264012A=I=3");
        assert_eq!(cmd.kind, CommandKind::AllLinkingCompleted);
        assert_eq!(cmd.max_attempts, 1);
        assert_eq!(cmd.response_timeout, LINKING_RESPONSE_TIMEOUT);

        let del = start_linking_command(LinkingMode::Delete, 0x01);
        assert!(del.request_line().starts_with("/3?0264FF01"));
    }

    #[test]
    fn test_pre_arm_uses_unlink_command_for_delete() {
        let dev = DeviceAddress::new(0x1A, 0x2B, 0x3C);
        let link = pre_arm_command(dev, LinkingMode::Auto, 0x01);
        assert_eq!(link.frame.unwrap().cmd1, CMD_ENTER_LINKING);
        assert_eq!(link.kind, CommandKind::DeviceStandard);
        let unlink = pre_arm_command(dev, LinkingMode::Delete, 0x01);
        assert_eq!(unlink.frame.unwrap().cmd1, CMD_ENTER_UNLINKING);
    }
}
