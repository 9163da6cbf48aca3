//! A scripted in-memory hub for tests.
//!
//! `FakeHub` implements [`HubTransport`] and is injected at session
//! construction, the same seam the HTTP transport uses. Each
//! `send_request` consumes the next scripted [`Reply`]; `read_buffer`
//! serves whatever the script placed in the shared buffer. The fake also
//! instruments transport-call concurrency so tests can assert that the
//! execution gate keeps command windows from overlapping.

use crate::error::TransportError;
use crate::transport::HubTransport;
use async_trait::async_trait;
use insteon_wire::message::{
    MSG_ALL_LINKING_COMPLETED, MSG_ALL_LINK_RECORD, MSG_EXTENDED, MSG_STANDARD,
};
use insteon_wire::{
    compute_checksum, AllLinkRecordMessage, DeviceAddress, HexString, ACK, NAK, STX,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What the fake does in response to one `send_request`.
pub enum Reply {
    /// Place these bytes in the response buffer.
    Buffer(Vec<u8>),
    /// Accept the request but answer nothing.
    Silence,
    /// Fail the send itself.
    Fail(TransportError),
}

#[derive(Default)]
struct Inner {
    buffer: Vec<u8>,
    sent: Vec<String>,
    script: VecDeque<Reply>,
    clears: usize,
}

/// Scripted hub transport with concurrency instrumentation.
#[derive(Default)]
pub struct FakeHub {
    inner: Mutex<Inner>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    /// Simulated wire time per transport call, keeps call windows wide
    /// enough for overlap detection.
    wire_delay_ms: AtomicUsize,
}

impl FakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate `ms` of wire time inside every transport call.
    pub fn with_wire_delay_ms(self, ms: usize) -> Self {
        self.wire_delay_ms.store(ms, Ordering::SeqCst);
        self
    }

    /// Queue the reply to the next unanswered `send_request`.
    pub fn push_reply(&self, reply: Reply) {
        self.inner.lock().expect("fake hub lock").script.push_back(reply);
    }

    /// Shorthand for `push_reply(Reply::Buffer(bytes))`.
    pub fn push_buffer(&self, bytes: Vec<u8>) {
        self.push_reply(Reply::Buffer(bytes));
    }

    /// Append bytes to the buffer out-of-band, as an asynchronous broadcast
    /// (e.g. all-linking-completed) would.
    pub fn append_to_buffer(&self, bytes: &[u8]) {
        self.inner
            .lock()
            .expect("fake hub lock")
            .buffer
            .extend_from_slice(bytes);
    }

    /// Request lines seen so far, in order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.inner.lock().expect("fake hub lock").sent.clone()
    }

    /// How many times the buffer was cleared.
    pub fn clear_count(&self) -> usize {
        self.inner.lock().expect("fake hub lock").clears
    }

    /// Highest number of concurrently active transport calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> CallWindow<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = self.wire_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        CallWindow { hub: self }
    }
}

struct CallWindow<'a> {
    hub: &'a FakeHub,
}

impl Drop for CallWindow<'_> {
    fn drop(&mut self) {
        self.hub.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HubTransport for FakeHub {
    async fn send_request(&self, line: &str) -> Result<(), TransportError> {
        let _window = self.enter().await;
        let reply = {
            let mut inner = self.inner.lock().expect("fake hub lock");
            inner.sent.push(line.to_string());
            inner.script.pop_front()
        };
        match reply {
            Some(Reply::Buffer(bytes)) => {
                self.inner.lock().expect("fake hub lock").buffer = bytes;
                Ok(())
            }
            Some(Reply::Silence) | None => Ok(()),
            Some(Reply::Fail(err)) => Err(err),
        }
    }

    async fn read_buffer(&self) -> Result<HexString, TransportError> {
        let _window = self.enter().await;
        let inner = self.inner.lock().expect("fake hub lock");
        Ok(HexString::from_bytes(inner.buffer.clone()))
    }

    async fn clear_buffer(&self) -> Result<(), TransportError> {
        let _window = self.enter().await;
        let mut inner = self.inner.lock().expect("fake hub lock");
        inner.buffer.clear();
        inner.clears += 1;
        Ok(())
    }
}

// -- response byte builders ------------------------------------------------

/// The IM echo of `command` terminated with ACK.
pub fn echo_ack(command: &crate::command::Command) -> Vec<u8> {
    echo_with(command, ACK)
}

/// The IM echo of `command` terminated with NAK.
pub fn echo_nak(command: &crate::command::Command) -> Vec<u8> {
    echo_with(command, NAK)
}

fn echo_with(command: &crate::command::Command, terminator: u8) -> Vec<u8> {
    let code = command.echo_code().expect("command code is not a hex byte");
    let mut bytes = vec![STX, code];
    bytes.extend_from_slice(&hex::decode(&command.params).expect("command params are hex"));
    bytes.push(terminator);
    bytes
}

/// An 0x50 standard message.
pub fn standard_message(
    from: DeviceAddress,
    to: DeviceAddress,
    flags: u8,
    cmd1: u8,
    cmd2: u8,
) -> Vec<u8> {
    let mut bytes = vec![STX, MSG_STANDARD];
    bytes.extend_from_slice(&from.bytes());
    bytes.extend_from_slice(&to.bytes());
    bytes.extend_from_slice(&[flags, cmd1, cmd2]);
    bytes
}

/// A direct ACK from `from`.
pub fn direct_ack(from: DeviceAddress, to: DeviceAddress, cmd1: u8, cmd2: u8) -> Vec<u8> {
    standard_message(from, to, 0x2F, cmd1, cmd2)
}

/// An 0x51 extended message with a valid Data14 checksum.
pub fn extended_message(
    from: DeviceAddress,
    to: DeviceAddress,
    cmd1: u8,
    cmd2: u8,
    data13: [u8; 13],
) -> Vec<u8> {
    let mut bytes = vec![STX, MSG_EXTENDED];
    bytes.extend_from_slice(&from.bytes());
    bytes.extend_from_slice(&to.bytes());
    bytes.extend_from_slice(&[0x1F, cmd1, cmd2]);
    bytes.extend_from_slice(&data13);
    bytes.push(compute_checksum(cmd1, cmd2, &data13));
    bytes
}

/// The extended record-read response a device sends for the record at
/// `address`.
pub fn record_read_response(
    device: DeviceAddress,
    hub: DeviceAddress,
    address: u16,
    record: &AllLinkRecordMessage,
) -> Vec<u8> {
    let mut data13 = [0u8; 13];
    data13[1] = 0x01; // record response
    data13[2] = (address >> 8) as u8;
    data13[3] = (address & 0xFF) as u8;
    data13[5..13].copy_from_slice(&record.encode());
    extended_message(device, hub, 0x2F, 0x00, data13)
}

/// An 0x57 all-link record message.
pub fn all_link_record(record: &AllLinkRecordMessage) -> Vec<u8> {
    let mut bytes = vec![STX, MSG_ALL_LINK_RECORD];
    bytes.extend_from_slice(&record.encode());
    bytes
}

/// An 0x53 all-linking-completed broadcast.
pub fn all_linking_completed(link_code: u8, group: u8, device: DeviceAddress) -> Vec<u8> {
    let mut bytes = vec![STX, MSG_ALL_LINKING_COMPLETED, link_code, group];
    bytes.extend_from_slice(&device.bytes());
    bytes.extend_from_slice(&[0x01, 0x0E, 0x43]);
    bytes
}
