//! The command state machine: attempts, gating, backoff.

use crate::command::{Command, CommandKind, CommandReply, PendingCommand};
use crate::dispatch::Dispatcher;
use crate::error::{CommandOutcome, ErrorKind};
use crate::session::{CancelToken, HubSession};
use tracing::{debug, warn};

/// Whether this execution owns the gate or runs inside a holder's call tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateMode {
    /// Acquire (and release) the gate around every attempt.
    Acquire,
    /// The gate is already held by an ancestor; run bare.
    Inherited,
}

impl HubSession {
    /// Run a command to completion with a fresh cancellation token.
    pub async fn run(&self, command: Command) -> CommandReply {
        self.run_cancellable(command, &CancelToken::new()).await
    }

    /// Run a command to completion, honoring the caller's token.
    pub async fn run_cancellable(&self, command: Command, cancel: &CancelToken) -> CommandReply {
        self.try_run(command, GateMode::Acquire, cancel).await
    }

    /// Run a sub-command of a macro whose call tree already holds the gate.
    pub(crate) async fn run_sub(&self, command: Command, cancel: &CancelToken) -> CommandReply {
        self.try_run(command, GateMode::Inherited, cancel).await
    }

    /// The retry/attempt loop.
    ///
    /// The gate is taken before each attempt and dropped right after it, so
    /// it is never held across the inter-attempt backoff. Backoff is linear:
    /// `base_delay * attempt_number`, nothing before the first attempt.
    pub(crate) async fn try_run(
        &self,
        command: Command,
        gate: GateMode,
        cancel: &CancelToken,
    ) -> CommandReply {
        let max_attempts = command.max_attempts.max(1);
        let base_delay = self.config.retry_base_delay();
        let mut pending = PendingCommand::new(command);
        let mut last_error = ErrorKind::Unknown;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = base_delay * (attempt - 1);
                debug!(
                    command = pending.command.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return reply(CommandOutcome::cancelled(attempt - 1), pending)
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                pending.reset();
            }
            if cancel.is_cancelled() {
                return reply(CommandOutcome::cancelled(attempt - 1), pending);
            }

            let result = match gate {
                GateMode::Acquire => {
                    let _guard = self.gate.acquire(pending.command.name).await;
                    self.attempt_once(&mut pending, cancel).await
                    // guard drops here, before any backoff sleep
                }
                GateMode::Inherited => self.attempt_once(&mut pending, cancel).await,
            };

            match result {
                Ok(()) => return reply(CommandOutcome::success(attempt), pending),
                Err(ErrorKind::Cancelled) => {
                    return reply(CommandOutcome::cancelled(attempt), pending)
                }
                Err(kind) => {
                    last_error = kind;
                    if !kind.is_recoverable() {
                        return reply(CommandOutcome::failure(kind, attempt), pending);
                    }
                    if attempt < max_attempts {
                        warn!(
                            command = pending.command.name,
                            attempt,
                            error = %kind,
                            "attempt failed, will retry"
                        );
                    }
                }
            }
        }
        reply(CommandOutcome::failure(last_error, max_attempts), pending)
    }

    /// One transport exchange: pace, clear the shared buffer, send, dispatch.
    async fn attempt_once(
        &self,
        pending: &mut PendingCommand,
        cancel: &CancelToken,
    ) -> Result<(), ErrorKind> {
        self.pacing.pace().await;
        if cancel.is_cancelled() {
            return Err(ErrorKind::Cancelled);
        }

        let line = pending.command.request_line();
        debug!(command = pending.command.name, request = %line, "sending");

        // start each attempt from a clean shared buffer; leftover bytes from
        // the previous exchange would alias into this command's responses
        self.transport
            .clear_buffer()
            .await
            .map_err(|e| e.kind())?;

        let send = self.transport.send_request(&line);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
            result = send => result.map_err(|e| e.kind())?,
        }
        self.pacing.mark_exchange();

        if pending.command.kind == CommandKind::FireAndForget {
            return Ok(());
        }

        let mut dispatcher =
            Dispatcher::new(self.transport.as_ref(), self.config.poll_interval());
        let result = dispatcher.drive(pending, cancel).await;
        self.pacing.mark_exchange();

        // the unreliable bulk read "succeeds" when the quiet deadline hits
        // with at least one record collected
        if let Err(kind) = &result {
            if pending.command.kind == CommandKind::ExtendedStream
                && *kind == ErrorKind::NoDeviceExtendedResponse
                && !pending.response.extended_stream.is_empty()
            {
                return Ok(());
            }
        }
        result
    }
}

fn reply(outcome: CommandOutcome, pending: PendingCommand) -> CommandReply {
    CommandReply {
        outcome,
        response: pending.response,
    }
}
