//! The per-gateway session: execution gate, pacing and cancellation.
//!
//! The hub's response buffer is one shared stateful resource, so at most one
//! command may be on the wire at a time. The gate enforcing that is owned by
//! the session, never by a static, so independent sessions (and tests) do not
//! share hidden state.

use crate::transport::{HubTransport, SessionConfig};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Cooperative cancellation token.
///
/// Cancellation flips the command into its `Cancelled` terminal state; the
/// runner checks the token at every suspension point (transport await,
/// buffer poll, backoff sleep).
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelToken { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // sender kept alive by self; unreachable, but never busy-spin
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The session-scoped mutual-exclusion gate plus the identity of its holder.
#[derive(Debug)]
pub struct ExecutionGate {
    lock: Arc<Mutex<()>>,
    holder: StdMutex<Option<&'static str>>,
}

/// Holds the gate; releases it (and clears the holder label) on drop.
pub struct GateGuard<'a> {
    gate: &'a ExecutionGate,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        *self.gate.holder.lock().expect("holder label lock") = None;
    }
}

impl ExecutionGate {
    pub fn new() -> Self {
        ExecutionGate {
            lock: Arc::new(Mutex::new(())),
            holder: StdMutex::new(None),
        }
    }

    /// Block until the gate is free, then hold it for `name`.
    pub async fn acquire(&self, name: &'static str) -> GateGuard<'_> {
        let guard = self.lock.clone().lock_owned().await;
        *self.holder.lock().expect("holder label lock") = Some(name);
        debug!(command = name, "execution gate acquired");
        GateGuard {
            gate: self,
            _guard: guard,
        }
    }

    /// Name of the command currently holding the gate, if any.
    pub fn holder(&self) -> Option<&'static str> {
        *self.holder.lock().expect("holder label lock")
    }
}

impl Default for ExecutionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the end of the last exchange to enforce minimum command spacing.
#[derive(Debug)]
pub(crate) struct Pacing {
    last_exchange: StdMutex<Option<Instant>>,
    spacing: Duration,
}

impl Pacing {
    pub(crate) fn new(spacing: Duration) -> Self {
        Pacing {
            last_exchange: StdMutex::new(None),
            spacing,
        }
    }

    /// Sleep out whatever remains of the spacing window.
    pub(crate) async fn pace(&self) {
        let wait = {
            let last = self.last_exchange.lock().expect("pacing lock");
            last.map(|t| (t + self.spacing).saturating_duration_since(Instant::now()))
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    pub(crate) fn mark_exchange(&self) {
        *self.last_exchange.lock().expect("pacing lock") = Some(Instant::now());
    }
}

/// One logical session against one hub gateway.
///
/// Owns the transport, the execution gate and the pacing clock. Commands and
/// macro protocols all run through [`HubSession::run`] and friends (see the
/// `runner` module).
pub struct HubSession {
    pub(crate) transport: Arc<dyn HubTransport>,
    pub(crate) config: SessionConfig,
    pub(crate) gate: ExecutionGate,
    pub(crate) pacing: Pacing,
}

impl HubSession {
    /// Build a session over an injected transport. This is the seam the hub
    /// simulator uses in tests.
    pub fn new(transport: Arc<dyn HubTransport>, config: SessionConfig) -> Self {
        let pacing = Pacing::new(config.command_spacing());
        HubSession {
            transport,
            config,
            gate: ExecutionGate::new(),
            pacing,
        }
    }

    /// Build a session speaking HTTP to a physical hub.
    pub fn connect_http(config: SessionConfig) -> Result<Self, crate::error::TransportError> {
        let transport = Arc::new(crate::transport::HttpHubTransport::new(&config)?);
        Ok(Self::new(transport, config))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Name of the command currently on the wire, if any.
    pub fn current_command(&self) -> Option<&'static str> {
        self.gate.holder()
    }
}
