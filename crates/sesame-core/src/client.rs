//! Async device handle
//!
//! [`SesameDevice`] drives a [`SesameSession`] over a [`Transport`]. One spawned
//! task per connection pumps notified frames and deadlines into the engine; caller
//! operations take the same lock, so every encrypt-and-write and every
//! decrypt-and-apply runs to completion before the next one starts.
//!
//! Each connection attempt gets a new generation number. A pump only acts while
//! its generation is current, and `disconnect()` bumps the generation, which also
//! cancels a transport connect still in progress.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::advertisement::Advertisement;
use crate::config::SessionConfig;
use crate::crypto::KeyMaterial;
use crate::dispatcher::{CommandKind, CommandOutcome};
use crate::engine::{SesameSession, SessionOutput};
use crate::errors::AuthFailure;
use crate::model::{MechanicalStatus, StatusSnapshot};
use crate::session::SessionState;
use crate::transport::Transport;
use crate::types::{DeviceIdentity, DeviceKind, Timestamp};
use crate::{Result, SesameError};

/// Buffered status updates per subscriber
const STATUS_CHANNEL_CAPACITY: usize = 32;
/// Pump wake-up interval when no deadline is pending
const IDLE_POLL: Duration = Duration::from_secs(1);

type StatusCallback = Arc<dyn Fn(&MechanicalStatus) + Send + Sync>;

// ----------------------------------------------------------------------------
// Device Handle
// ----------------------------------------------------------------------------

/// Connection-managing handle for one lock or bot
pub struct SesameDevice<T: Transport> {
    shared: Arc<Shared<T>>,
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    identity: DeviceIdentity,
    config: SessionConfig,
    inner: Mutex<Inner<T::Link>>,
    state_tx: watch::Sender<SessionState>,
    status_tx: broadcast::Sender<MechanicalStatus>,
}

struct Inner<L> {
    session: SesameSession,
    link: Option<L>,
    waiter: Option<oneshot::Sender<CommandOutcome>>,
    callbacks: Vec<StatusCallback>,
    pump: Option<JoinHandle<()>>,
    last_error: Option<SesameError>,
    registered: bool,
    /// Current connection attempt
    generation: u64,
    /// Cancels a transport connect in progress
    connecting: Option<oneshot::Sender<()>>,
}

impl<T: Transport> SesameDevice<T> {
    /// Bind `keys` to the device at `identity`
    pub fn new(
        transport: Arc<T>,
        keys: KeyMaterial,
        identity: DeviceIdentity,
        kind: DeviceKind,
        config: SessionConfig,
    ) -> Result<Self> {
        let session = SesameSession::new(keys, identity, kind, config.clone())?;
        Self::with_session(transport, session, config, true)
    }

    /// Bind `keys` to an advertised device
    pub fn from_advertisement(
        transport: Arc<T>,
        keys: KeyMaterial,
        advertisement: &Advertisement,
        config: SessionConfig,
    ) -> Result<Self> {
        let kind = advertisement.product.device_kind().ok_or_else(|| {
            SesameError::config_error(format!(
                "{} devices cannot be controlled",
                advertisement.product.model_name()
            ))
        })?;
        let mut session =
            SesameSession::new(keys, advertisement.identity, kind, config.clone())?;
        session.model_mut().observe_advertisement(advertisement);
        Self::with_session(transport, session, config, advertisement.is_registered())
    }

    fn with_session(
        transport: Arc<T>,
        session: SesameSession,
        config: SessionConfig,
        registered: bool,
    ) -> Result<Self> {
        let max_frame_size = transport.capabilities().max_frame_size;
        if config.max_frame_size > max_frame_size {
            return Err(SesameError::config_error(format!(
                "max_frame_size {} exceeds transport limit {}",
                config.max_frame_size, max_frame_size
            )));
        }

        let identity = *session.identity();
        let (state_tx, _) = watch::channel(session.state());
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                identity,
                config,
                inner: Mutex::new(Inner {
                    session,
                    link: None,
                    waiter: None,
                    callbacks: Vec::new(),
                    pump: None,
                    last_error: None,
                    registered,
                    generation: 0,
                    connecting: None,
                }),
                state_tx,
                status_tx,
            }),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch lifecycle changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Receive every applied status update
    pub fn subscribe(&self) -> broadcast::Receiver<MechanicalStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Register a callback invoked with every applied status update
    pub async fn on_status_changed<F>(&self, callback: F)
    where
        F: Fn(&MechanicalStatus) + Send + Sync + 'static,
    {
        self.shared.inner.lock().await.callbacks.push(Arc::new(callback));
    }

    /// Last known status with its staleness flag
    pub async fn current_status(&self) -> StatusSnapshot {
        self.shared.inner.lock().await.session.snapshot()
    }

    /// Feed an advertisement seen while scanning
    pub async fn observe_advertisement(&self, advertisement: &Advertisement) {
        if advertisement.identity.address != self.shared.identity.address {
            return;
        }
        let mut inner = self.shared.inner.lock().await;
        inner.registered = advertisement.is_registered();
        inner.session.model_mut().observe_advertisement(advertisement);
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Connect and log in; returns once the session is ready
    ///
    /// The session lock is not held while the transport connects, so
    /// [`disconnect`](Self::disconnect) can abort the attempt at any point.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state_rx = shared.state_tx.subscribe();
        let attempt = {
            let mut inner = shared.inner.lock().await;
            if !inner.registered {
                return Err(SesameError::NotRegistered);
            }
            if inner.connecting.is_some() {
                return Err(SesameError::connection_failed(
                    shared.identity.address.to_string(),
                    "connection attempt already in progress",
                ));
            }
            if inner.session.state().is_linked() {
                None
            } else {
                inner.generation += 1;
                let (cancel_tx, cancel_rx) = oneshot::channel();
                inner.connecting = Some(cancel_tx);
                Some((inner.generation, cancel_rx))
            }
        };
        if let Some((generation, cancel_rx)) = attempt {
            shared.open_link(generation, cancel_rx).await?;
        }

        let settled = match timeout(
            shared.config.connect_timeout + shared.config.handshake_timeout,
            state_rx.wait_for(|state| state.is_ready() || !state.is_linked()),
        )
        .await
        {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) => return Err(SesameError::disconnected("device handle dropped")),
            Err(_) => None,
        };
        let Some(state) = settled else {
            self.disconnect().await?;
            return Err(SesameError::auth_failed(AuthFailure::HandshakeTimeout));
        };

        if state.is_ready() {
            return Ok(());
        }
        let mut inner = shared.inner.lock().await;
        Err(inner
            .last_error
            .take()
            .unwrap_or_else(|| SesameError::disconnected("link closed during login")))
    }

    /// Close the link or abort a connect in progress; a pending command fails
    /// with `Disconnected`
    pub async fn disconnect(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if let Some(cancel) = inner.connecting.take() {
            // the attempt may have finished already
            let _ = cancel.send(());
        }
        inner.generation += 1;
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        let outputs = inner
            .session
            .on_link_lost("disconnected by host", Timestamp::now());
        self.shared.process(&mut inner, outputs).await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub async fn lock(&self) -> Result<MechanicalStatus> {
        self.execute(CommandKind::Lock).await
    }

    pub async fn unlock(&self) -> Result<MechanicalStatus> {
        self.execute(CommandKind::Unlock).await
    }

    pub async fn toggle(&self) -> Result<MechanicalStatus> {
        self.execute(CommandKind::Toggle).await
    }

    pub async fn click(&self) -> Result<MechanicalStatus> {
        self.execute(CommandKind::Click).await
    }

    /// Send `command` and wait for the status report that completes it
    pub async fn execute(&self, command: CommandKind) -> Result<MechanicalStatus> {
        self.run_command(command, None).await
    }

    /// As [`execute`](Self::execute), labelling this operation in the device
    /// history with `history_tag` instead of the configured default
    pub async fn execute_with_tag(
        &self,
        command: CommandKind,
        history_tag: &str,
    ) -> Result<MechanicalStatus> {
        self.run_command(command, Some(history_tag)).await
    }

    async fn run_command(
        &self,
        command: CommandKind,
        history_tag: Option<&str>,
    ) -> Result<MechanicalStatus> {
        let outcome = {
            let mut inner = self.shared.inner.lock().await;
            if inner.link.is_none() {
                return Err(SesameError::NotReady {
                    state: inner.session.state().state_name(),
                });
            }
            let now = Timestamp::now();
            let frames = match history_tag {
                Some(tag) => inner.session.begin_command_with_tag(command, tag, now)?,
                None => inner.session.begin_command(command, now)?,
            };
            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);
            self.shared
                .process(&mut inner, vec![SessionOutput::Transmit(frames)])
                .await;
            rx
        };

        match outcome.await {
            Ok(outcome) => outcome.result,
            Err(_) => Err(SesameError::disconnected("session dropped")),
        }
    }
}

// ----------------------------------------------------------------------------
// Engine Driver
// ----------------------------------------------------------------------------

impl<T: Transport> Shared<T> {
    async fn open_link(
        self: &Arc<Self>,
        generation: u64,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<()> {
        let address = self.identity.address;
        info!("Connecting to {}", address);

        let connected = tokio::select! {
            connected = timeout(self.config.connect_timeout, self.transport.connect(&address)) => {
                match connected {
                    Ok(result) => result,
                    Err(_) => Err(SesameError::transport_timeout(
                        self.config.connect_timeout.as_millis() as u64,
                    )),
                }
            }
            _ = &mut cancel => Err(connect_cancelled()),
        };
        let opened = match connected {
            Ok(link) => match self.transport.notifications(&link).await {
                Ok(frames) => Ok((link, frames)),
                Err(e) => {
                    self.close_link(&link).await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            if let Ok((link, _)) = &opened {
                self.close_link(link).await;
            }
            return Err(connect_cancelled());
        }
        inner.connecting = None;
        let (link, frames) = opened?;

        inner.last_error = None;
        let outputs = match inner.session.on_link_established(Timestamp::now()) {
            Ok(outputs) => outputs,
            Err(e) => {
                self.close_link(&link).await;
                return Err(e);
            }
        };
        inner.link = Some(link);
        if let Some(previous) = inner.pump.take() {
            previous.abort();
        }
        self.process(&mut inner, outputs).await;
        inner.pump = Some(tokio::spawn(run_pump(Arc::clone(self), frames, generation)));
        Ok(())
    }

    async fn close_link(&self, link: &T::Link) {
        if let Err(e) = self.transport.disconnect(link).await {
            debug!("Disconnect from {} failed: {}", self.identity, e);
        }
    }

    /// Act on engine outputs while holding the session lock
    async fn process(&self, inner: &mut Inner<T::Link>, outputs: Vec<SessionOutput>) {
        let mut queue: VecDeque<SessionOutput> = outputs.into();
        while let Some(output) = queue.pop_front() {
            match output {
                SessionOutput::Transmit(frames) => {
                    let Some(link) = inner.link.clone() else {
                        continue;
                    };
                    for frame in &frames {
                        if let Err(e) = self.transport.write(&link, frame).await {
                            warn!("Write to {} failed: {}", self.identity, e);
                            queue.extend(
                                inner
                                    .session
                                    .on_link_lost(&e.to_string(), Timestamp::now()),
                            );
                            break;
                        }
                    }
                }
                SessionOutput::StateChanged(state) => {
                    self.state_tx.send_replace(state);
                }
                SessionOutput::StatusChanged(status) => {
                    for callback in &inner.callbacks {
                        callback(&status);
                    }
                    // no receivers is fine
                    let _ = self.status_tx.send(status);
                }
                SessionOutput::CommandFinished(outcome) => match inner.waiter.take() {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => debug!("Command {:?} finished with no waiter", outcome.command),
                },
                SessionOutput::Closed(error) => {
                    info!("Session with {} closed: {}", self.identity, error);
                    inner.last_error = Some(error);
                    if let Some(link) = inner.link.take() {
                        self.close_link(&link).await;
                    }
                }
            }
        }
    }

    /// Returns whether the pump should keep running
    async fn on_frame(&self, generation: u64, frame: &[u8]) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return false;
        }
        let outputs = inner.session.handle_frame(frame, Timestamp::now());
        self.process(&mut inner, outputs).await;
        inner.link.is_some()
    }

    async fn on_tick(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return false;
        }
        let outputs = inner.session.poll_timeouts(Timestamp::now());
        self.process(&mut inner, outputs).await;
        inner.link.is_some()
    }

    async fn on_stream_closed(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.link.is_none() {
            return;
        }
        let outputs = inner
            .session
            .on_link_lost("notification stream closed", Timestamp::now());
        self.process(&mut inner, outputs).await;
    }

    async fn time_until_deadline(&self) -> Duration {
        let inner = self.inner.lock().await;
        match inner.session.next_deadline() {
            Some(deadline) => Duration::from_millis(deadline - Timestamp::now()),
            None => IDLE_POLL,
        }
    }
}

fn connect_cancelled() -> SesameError {
    SesameError::disconnected("connection attempt cancelled")
}

async fn run_pump<T: Transport>(
    shared: Arc<Shared<T>>,
    mut frames: BoxStream<'static, Vec<u8>>,
    generation: u64,
) {
    loop {
        let wait = shared.time_until_deadline().await;
        let open = tokio::select! {
            frame = frames.next() => match frame {
                Some(frame) => shared.on_frame(generation, &frame).await,
                None => {
                    shared.on_stream_closed(generation).await;
                    false
                }
            },
            _ = tokio::time::sleep(wait) => shared.on_tick(generation).await,
        };
        if !open {
            break;
        }
    }
    debug!("Notification pump for {} stopped", shared.identity);
}
