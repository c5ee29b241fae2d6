//! Connection lifecycle: authenticate, sign, open, subscribe, stream, and
//! reconnect with bounded backoff.
//!
//! One worker task owns the transport at any time. `connect()` spawns it,
//! `disconnect()` cancels it and waits for the teardown to finish.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    backoff::ReconnectPolicy,
    envelope::{self, Decoded, MessageHandler},
};
use crate::{
    aws::{AuthorizationBinder, CredentialBroker, RequestSigner},
    clock::Clock,
    error::{AuthorizationWarning, ConnectionError, TransportError},
    transport::{Transport, TransportSession},
};

/// A quiet session that stays up this long counts as a successful connection
const STABLE_SESSION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Retries exhausted; only `reset()` or an explicit `connect()` leaves this state
    Failed,
}

impl ConnectionState {
    /// A worker task is alive for this state
    fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Disconnected | Self::Reconnecting
        )
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub endpoint_host: String,
    pub region: String,
    pub service_name: String,
    pub topic: String,
    pub client_id_prefix: String,
    pub reconnect: ReconnectPolicy,
}

pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: ManagerSettings,
    broker: Arc<CredentialBroker>,
    binder: AuthorizationBinder,
    signer: RequestSigner,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    control: Mutex<Control>,
}

struct Control {
    policy: ReconnectPolicy,
    handler: Option<Arc<dyn MessageHandler>>,
    last_error: Option<ConnectionError>,
    worker: Option<Worker>,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(
        settings: ManagerSettings,
        broker: Arc<CredentialBroker>,
        binder: AuthorizationBinder,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let control = Control {
            policy: settings.reconnect.clone(),
            handler: None,
            last_error: None,
            worker: None,
        };

        Self {
            inner: Arc::new(Inner {
                settings,
                broker,
                binder,
                signer: RequestSigner::new(clock),
                transport,
                state,
                control: Mutex::new(control),
            }),
        }
    }

    /// Register the consumer of decoded messages; kept across reconnects until `disconnect()`.
    ///
    /// Returns `false` if a handler is already registered.
    pub fn register_message_handler(&self, handler: impl MessageHandler) -> bool {
        let mut control = self.inner.control();
        if control.handler.is_some() {
            warn!("Message handler already registered, keeping the existing one");
            return false;
        }
        control.handler = Some(Arc::new(handler));
        true
    }

    /// Start connecting in the background. A no-op while a connection is in progress or live.
    pub fn connect(&self) {
        let mut control = self.inner.control();

        let state = self.state();
        if state.is_active() {
            debug!(?state, "Connection already in progress, ignoring connect()");
            return;
        }
        if state == ConnectionState::Failed {
            control.policy.reset();
        }

        let cancel = CancellationToken::new();
        self.inner.set_state(ConnectionState::Connecting);
        let handle = tokio::spawn(run(self.inner.clone(), cancel.clone()));
        control.worker = Some(Worker { cancel, handle });
    }

    /// Tear everything down: pending reconnect, live transport, and the registered handler
    pub async fn disconnect(&self) {
        let worker = {
            let mut control = self.inner.control();
            control.handler = None;
            control.worker.take()
        };

        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Connection worker ended abnormally");
            }
        }

        self.inner.set_state(ConnectionState::Idle);
        info!("Disconnected");
    }

    /// Leave the terminal `Failed` state. Returns `false` in any other state.
    pub fn reset(&self) -> bool {
        let mut control = self.inner.control();
        if self.state() != ConnectionState::Failed {
            return false;
        }
        control.policy.reset();
        control.last_error = None;
        control.worker = None;
        self.inner.set_state(ConnectionState::Idle);
        true
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Most recent failure, retained after the manager gives up
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.inner.control().last_error.clone()
    }

    /// Reconnect attempts consumed since the last successful connection
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.control().policy.attempt()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(worker) = self.inner.control().worker.take() {
            worker.cancel.cancel();
        }
    }
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "Connection state changed");
        }
    }

    fn record_error(&self, err: ConnectionError) {
        self.control().last_error = Some(err);
    }

    /// Policy, credentials, signature, transport; in that order
    async fn establish(&self) -> Result<Box<dyn TransportSession>, ConnectionError> {
        match self.binder.ensure_policy_attached(&self.broker).await {
            Ok(()) => {}
            // Same exchange the credential step would repeat
            Err(AuthorizationWarning::Identity(err)) => return Err(err.into()),
            Err(warning) => warn!(%warning, "Continuing without confirmed policy attachment"),
        }

        let credentials = self.broker.get_access_credentials().await?;
        let url = self.signer.sign(
            &credentials,
            &self.settings.endpoint_host,
            &self.settings.region,
            &self.settings.service_name,
        )?;

        let client_id = format!(
            "{}-{}",
            self.settings.client_id_prefix,
            Uuid::new_v4().simple()
        );

        match self.transport.open(&url, &client_id).await {
            Ok(session) => Ok(session),
            Err(err) => {
                if err.is_auth_related() {
                    self.broker.invalidate_access_credentials().await;
                }
                Err(err.into())
            }
        }
    }

    /// Subscribe and pump messages until the transport fails.
    ///
    /// The attempt counter resets once the session proves live: a delivered
    /// message, or staying up for [`STABLE_SESSION`].
    async fn serve(&self, session: &mut dyn TransportSession) -> TransportError {
        if let Err(err) = session.subscribe(&self.settings.topic).await {
            return err;
        }
        self.set_state(ConnectionState::Connected);

        let live_since = Instant::now();
        let mut settled = false;
        loop {
            match session.next_message().await {
                Ok(message) => {
                    if !settled {
                        settled = true;
                        self.control().policy.reset();
                    }
                    self.dispatch(&message.payload);
                }
                Err(err) => {
                    if !settled && live_since.elapsed() >= STABLE_SESSION {
                        self.control().policy.reset();
                    }
                    return err;
                }
            }
        }
    }

    fn dispatch(&self, payload: &[u8]) {
        match envelope::decode(payload) {
            Ok(Decoded::Telemetry(message)) => {
                let handler = self.control().handler.clone();
                match handler {
                    Some(handler) => handler.on_message(message),
                    None => debug!("No message handler registered, dropping message"),
                }
            }
            Ok(Decoded::Control(kind)) => debug!(%kind, "Skipping control message"),
            Err(err) => warn!(error = %err, "Dropping malformed message"),
        }
    }
}

async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        inner.set_state(ConnectionState::Connecting);

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            attempt = inner.establish() => attempt,
        };

        match attempt {
            Ok(mut session) => {
                let ended = tokio::select! {
                    _ = cancel.cancelled() => None,
                    err = inner.serve(session.as_mut()) => Some(err),
                };
                session.close().await;

                let Some(err) = ended else {
                    return;
                };
                let was_live = *inner.state.borrow() == ConnectionState::Connected;
                if was_live {
                    inner.set_state(ConnectionState::Disconnected);
                    warn!(error = %err, "Connection lost");
                } else {
                    warn!(error = %err, "Subscription failed");
                }
                inner.record_error(err.into());
            }
            Err(err) => {
                warn!(error = %err, "Connection attempt failed");
                inner.record_error(err);
            }
        }

        let (delay, attempt, max_attempts) = {
            let mut control = inner.control();
            let delay = control.policy.next_delay();
            (delay, control.policy.attempt(), control.policy.max_attempts())
        };

        let Some(delay) = delay else {
            error!(max_attempts, "Reconnect attempts exhausted, giving up");
            inner.set_state(ConnectionState::Failed);
            return;
        };

        inner.set_state(ConnectionState::Reconnecting);
        info!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = time::sleep(delay) => {}
        }
    }
}
