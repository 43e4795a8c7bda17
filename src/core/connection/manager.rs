//! Connection Manager: peer lifecycle state machine and inbound routing.
//!
//! ```text
//!                create / join
//!  disconnected ───────────────▶ connecting ──connect──▶ connected
//!       ▲  ▲                        │   │                   │
//!       │  └──────── close ─────────┼───┼───────────────────┤
//!       │                 timeout / │   │ rejected          │ error
//!       │                   error   ▼   ▼                   ▼
//!       └──── disconnect ───────  failed ◀──────────────────┘
//! ```
//!
//! `disconnect()` is accepted in every state and always lands in
//! `disconnected`. `failed` is terminal for the current peer; a new
//! `create_session`/`join_session` releases it and starts over.
//!
//! One driver task per peer consumes the primitive's [`PeerEvent`]s. It is
//! the only writer of the inbound transfer and, outside of the public
//! operations, of the session state.

use crate::core::config::SessionConfig;
use crate::core::connection::{
    PeerChannel, PeerEvent, PeerEvents, PeerFactory, SignalPayload, WebRtcFactory,
};
use crate::core::error::SessionError;
use crate::core::events::{AbandonReason, EventBus, EventStream, SessionEvent};
use crate::core::protocol::receiver::{ReceiveOutcome, TransferReceiver};
use crate::core::protocol::{sender, FileSource, TransferMessage};
use crate::core::session::{ConnectionState, Role, SessionInfo};
use crate::core::stats::TransferStats;
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// ── Shared state ─────────────────────────────────────────────────────────────

/// Progress of the local signal payload of one peer.
#[derive(Debug, Clone)]
enum SignalSlot {
    Pending,
    Ready(SignalPayload),
    Failed(SessionError),
}

type SignalTx = Arc<watch::Sender<SignalSlot>>;

struct Shared {
    info: RwLock<SessionInfo>,
    receiver: Mutex<TransferReceiver>,
    events: EventBus,
    sending: AtomicBool,
}

impl Shared {
    async fn state(&self) -> ConnectionState {
        self.info.read().await.connection_state
    }

    /// Move to `state`. Publishes and returns the new snapshot only when the
    /// state actually changed.
    async fn set_state(&self, state: ConnectionState) -> Option<SessionInfo> {
        let info = {
            let mut info = self.info.write().await;
            if info.connection_state == state {
                return None;
            }
            info!(
                event = "state_changed",
                session = %info.session_id,
                from = %info.connection_state,
                to = %state,
                "Session state changed"
            );
            info.connection_state = state;
            info.clone()
        };
        self.events.publish(SessionEvent::StateChanged(info.clone()));
        Some(info)
    }

    async fn abandon_inbound(&self, reason: AbandonReason) {
        if let Some(abandoned) = self.receiver.lock().await.abandon(reason) {
            self.events.publish(SessionEvent::TransferAbandoned(abandoned));
        }
    }

    fn report(&self, error: SessionError) {
        self.events.publish(SessionEvent::Error(error));
    }
}

/// Resolve a still-pending local signal with `error`.
fn fail_pending(signal: &watch::Sender<SignalSlot>, error: &SessionError) {
    signal.send_if_modified(|slot| {
        if matches!(slot, SignalSlot::Pending) {
            *slot = SignalSlot::Failed(error.clone());
            true
        } else {
            false
        }
    });
}

async fn wait_for_signal(mut rx: watch::Receiver<SignalSlot>) -> Result<SignalPayload, SessionError> {
    loop {
        let slot = rx.borrow_and_update().clone();
        match slot {
            SignalSlot::Ready(payload) => return Ok(payload),
            SignalSlot::Failed(error) => return Err(error),
            SignalSlot::Pending => {}
        }
        if rx.changed().await.is_err() {
            // Peer released without ever producing a signal.
            return match rx.borrow().clone() {
                SignalSlot::Ready(payload) => Ok(payload),
                SignalSlot::Failed(error) => Err(error),
                SignalSlot::Pending => Err(SessionError::NotConnected),
            };
        }
    }
}

struct ActivePeer {
    channel: Arc<dyn PeerChannel>,
    stop: SignalOfStop,
    signal: SignalTx,
    driver: JoinHandle<()>,
}

impl ActivePeer {
    async fn shutdown(self) {
        self.stop.cancel();
        self.channel.close().await;
        if let Err(e) = self.driver.await {
            if !e.is_cancelled() {
                error!(event = "driver_panic", error = %e, "Session driver panicked");
            }
        }
    }
}

/// Resets the single-sender flag when `send_file` returns.
struct SendingGuard<'a>(&'a AtomicBool);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Owns one peer connection at a time and everything attached to it.
///
/// All operations take `&self`; wrap the manager in an `Arc` to share it
/// between tasks.
pub struct ConnectionManager {
    factory: Arc<dyn PeerFactory>,
    config: SessionConfig,
    shared: Arc<Shared>,
    active: Mutex<Option<ActivePeer>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn PeerFactory>, config: SessionConfig) -> Self {
        let shared = Arc::new(Shared {
            info: RwLock::new(SessionInfo::default()),
            receiver: Mutex::new(TransferReceiver::new(config.transfer.clone())),
            events: EventBus::new(config.event_capacity),
            sending: AtomicBool::new(false),
        });
        Self {
            factory,
            config,
            shared,
            active: Mutex::new(None),
        }
    }

    /// Manager backed by real WebRTC peer connections.
    pub fn webrtc(config: SessionConfig) -> Self {
        Self::new(Arc::new(WebRtcFactory::new(&config)), config)
    }

    pub fn subscribe(&self) -> EventStream {
        self.shared.events.subscribe()
    }

    pub async fn connection_info(&self) -> SessionInfo {
        self.shared.info.read().await.clone()
    }

    /// Start a session as initiator and wait for the local offer.
    pub async fn create_session(&self, session_id: &str) -> Result<SignalPayload, SessionError> {
        let signal = self.open(session_id, Role::Initiator).await?;
        wait_for_signal(signal).await
    }

    /// Start a session as responder. The answer becomes available through
    /// [`local_signal`](Self::local_signal) once the remote offer is accepted.
    pub async fn join_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.open(session_id, Role::Responder).await.map(|_| ())
    }

    /// Wait for the local signal payload of the current session.
    pub async fn local_signal(&self) -> Result<SignalPayload, SessionError> {
        let signal = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(peer) => peer.signal.subscribe(),
                None => {
                    return Err(SessionError::InvalidState {
                        operation: "local_signal",
                        state: self.shared.state().await,
                    })
                }
            }
        };
        wait_for_signal(signal).await
    }

    /// Hand the remote side's signal payload to the local primitive.
    pub async fn accept_signal(&self, payload: SignalPayload) -> Result<(), SessionError> {
        let state = self.shared.state().await;
        if state != ConnectionState::Connecting {
            return Err(SessionError::InvalidState {
                operation: "accept_signal",
                state,
            });
        }

        let channel = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(peer) => peer.channel.clone(),
                None => return Err(SessionError::NotConnected),
            }
        };

        match channel.accept_signal(payload).await {
            Ok(()) => {
                debug!(event = "signal_accepted", "Remote signal accepted");
                Ok(())
            }
            Err(e) => {
                let error = SessionError::SignalRejected(format!("{e:#}"));
                warn!(event = "signal_rejected", error = %error, "Remote signal rejected");
                self.fail(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Stream `source` to the connected peer.
    ///
    /// Progress is published as [`SessionEvent::TransferProgress`]; the final
    /// inactive snapshot is also returned.
    pub async fn send_file(&self, source: &dyn FileSource) -> Result<TransferStats, SessionError> {
        if self.shared.state().await != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let (channel, stop) = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(peer) => (peer.channel.clone(), peer.stop.clone()),
                None => return Err(SessionError::NotConnected),
            }
        };

        if self.shared.sending.swap(true, Ordering::AcqRel) {
            return Err(SessionError::TransferInProgress);
        }
        let _guard = SendingGuard(&self.shared.sending);

        let events = self.shared.events.clone();
        let result = sender::send_file(
            channel.as_ref(),
            source,
            &self.config.transfer,
            &stop,
            |stats| events.publish(SessionEvent::TransferProgress(stats)),
        )
        .await;

        if let Err(error) = &result {
            warn!(event = "send_failed", file = %source.name(), error = %error, "File send failed");
            if !matches!(error, SessionError::TransferCancelled) {
                self.shared.report(error.clone());
            }
        }
        result
    }

    /// Tear everything down and return to `disconnected`. Always succeeds
    /// and may be called any number of times.
    pub async fn disconnect(&self) {
        // Held until the state is reset so a concurrent create/join cannot
        // open a peer in between.
        let mut active = self.active.lock().await;
        let released = active.take();
        let had_peer = released.is_some();
        if let Some(peer) = released {
            peer.shutdown().await;
        }

        self.shared.abandon_inbound(AbandonReason::Disconnected).await;

        let previous = self.shared.state().await;
        if let Some(info) = self.shared.set_state(ConnectionState::Disconnected).await {
            if previous == ConnectionState::Connected {
                self.shared.events.publish(SessionEvent::PeerDisconnected(info));
            }
        }
        if had_peer {
            info!(event = "session_disconnected", "Session disconnected");
        }
    }

    /// Open a fresh primitive in `role` and start its driver.
    async fn open(&self, session_id: &str, role: Role) -> Result<watch::Receiver<SignalSlot>, SessionError> {
        let operation = match role {
            Role::Initiator => "create_session",
            Role::Responder => "join_session",
        };

        let mut active = self.active.lock().await;
        let state = self.shared.state().await;
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Err(SessionError::InvalidState { operation, state });
        }
        if let Some(stale) = active.take() {
            stale.shutdown().await;
        }
        self.shared.abandon_inbound(AbandonReason::Disconnected).await;

        let (channel, peer_events) = match self.factory.open(role).await {
            Ok(opened) => opened,
            Err(e) => {
                let error = SessionError::PeerError(format!("{e:#}"));
                error!(event = "peer_open_failure", error = %error, "Failed to open peer connection");
                let info = SessionInfo {
                    connection_state: ConnectionState::Failed,
                    ..SessionInfo::new(session_id, role)
                };
                *self.shared.info.write().await = info.clone();
                self.shared.events.publish(SessionEvent::StateChanged(info));
                self.shared.report(error.clone());
                return Err(error);
            }
        };

        let info = SessionInfo::new(session_id, role);
        *self.shared.info.write().await = info.clone();
        info!(event = "session_opened", session = %session_id, ?role, "Session opened");
        self.shared.events.publish(SessionEvent::StateChanged(info));

        let stop = SignalOfStop::new();
        let (signal_tx, signal_rx) = watch::channel(SignalSlot::Pending);
        let signal = Arc::new(signal_tx);
        let timeout = match role {
            Role::Initiator => self.config.initiator_signal_timeout(),
            Role::Responder => self.config.responder_signal_timeout(),
        };

        let driver = Driver {
            shared: self.shared.clone(),
            channel: channel.clone(),
            events: peer_events,
            stop: stop.clone(),
            signal: signal.clone(),
            signal_deadline: timeout.map(|t| (Instant::now() + t, t)),
        };

        *active = Some(ActivePeer {
            channel,
            stop,
            signal,
            driver: tokio::spawn(driver.run()),
        });
        Ok(signal_rx)
    }

    /// Connection-level failure reported by a public operation: move to
    /// `failed`, publish, release the peer.
    async fn fail(&self, error: SessionError) {
        let mut active = self.active.lock().await;
        if let Some(peer) = active.take() {
            fail_pending(&peer.signal, &error);
            peer.shutdown().await;
        }
        self.shared.abandon_inbound(AbandonReason::Disconnected).await;
        self.shared.set_state(ConnectionState::Failed).await;
        self.shared.report(error);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(peer) = self.active.get_mut().take() {
            peer.stop.cancel();
            peer.driver.abort();
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

struct Driver {
    shared: Arc<Shared>,
    channel: Arc<dyn PeerChannel>,
    events: PeerEvents,
    stop: SignalOfStop,
    signal: SignalTx,
    signal_deadline: Option<(Instant, Duration)>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let awaiting_signal = matches!(*self.signal.borrow(), SignalSlot::Pending);
            let deadline = self.signal_deadline.filter(|_| awaiting_signal);
            let expiry = async move {
                match deadline {
                    Some((at, _)) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let flow = tokio::select! {
                biased;
                _ = self.stop.wait() => ControlFlow::Break(()),
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => self.on_close().await,
                },
                _ = expiry => self.on_signal_timeout().await,
            };

            if flow.is_break() {
                break;
            }
        }
        debug!(event = "driver_stopped", "Session driver stopped");
    }

    async fn handle(&self, event: PeerEvent) -> ControlFlow<()> {
        if self.stop.cancelled() {
            return ControlFlow::Break(());
        }
        match event {
            PeerEvent::Signal(payload) => {
                debug!(event = "local_signal", bytes = payload.as_str().len(), "Local signal ready");
                self.signal.send_replace(SignalSlot::Ready(payload.clone()));
                self.shared.events.publish(SessionEvent::Signal(payload));
                ControlFlow::Continue(())
            }
            PeerEvent::Connect => {
                if let Some(info) = self.shared.set_state(ConnectionState::Connected).await {
                    self.shared.events.publish(SessionEvent::PeerConnected(info));
                }
                ControlFlow::Continue(())
            }
            PeerEvent::Data(raw) => {
                self.on_data(raw).await;
                ControlFlow::Continue(())
            }
            PeerEvent::Close => self.on_close().await,
            PeerEvent::Error(reason) => self.on_error(reason).await,
        }
    }

    async fn on_data(&self, raw: Bytes) {
        let msg = match TransferMessage::decode(&raw) {
            Ok(msg) => msg,
            Err(error) => {
                warn!(event = "malformed_message", bytes = raw.len(), error = %error, "Dropping malformed message");
                self.shared.report(error);
                return;
            }
        };

        let outcome = self.shared.receiver.lock().await.handle(msg);
        let events = &self.shared.events;
        match outcome {
            ReceiveOutcome::Started { stats, superseded } => {
                if let Some(old) = superseded {
                    events.publish(SessionEvent::TransferAbandoned(old));
                }
                events.publish(SessionEvent::TransferProgress(stats));
            }
            ReceiveOutcome::Progress(stats) => {
                events.publish(SessionEvent::TransferProgress(stats));
            }
            ReceiveOutcome::Completed { file, stats } => {
                events.publish(SessionEvent::TransferProgress(stats));
                events.publish(SessionEvent::FileReceived(file));
            }
            ReceiveOutcome::Rejected { error, abandoned } => {
                warn!(event = "message_rejected", error = %error, "Inbound message rejected");
                if let Some(abandoned) = abandoned {
                    events.publish(SessionEvent::TransferAbandoned(abandoned));
                }
                self.shared.report(error);
            }
            ReceiveOutcome::Ignored => {}
        }
    }

    /// Remote side went away.
    async fn on_close(&self) -> ControlFlow<()> {
        info!(event = "peer_closed", "Remote peer closed the connection");
        self.shared.abandon_inbound(AbandonReason::Disconnected).await;

        let previous = self.shared.state().await;
        if previous != ConnectionState::Failed {
            if let Some(info) = self.shared.set_state(ConnectionState::Disconnected).await {
                self.shared.events.publish(SessionEvent::PeerDisconnected(info));
            }
        }
        self.release(&SessionError::NotConnected).await;
        ControlFlow::Break(())
    }

    async fn on_error(&self, reason: String) -> ControlFlow<()> {
        let error = SessionError::PeerError(reason);
        error!(event = "peer_error", error = %error, "Peer connection error");
        self.fail(error).await
    }

    async fn on_signal_timeout(&self) -> ControlFlow<()> {
        let secs = self.signal_deadline.map(|(_, t)| t.as_secs()).unwrap_or_default();
        warn!(event = "signal_timeout", secs, "No local signal produced in time");
        self.fail(SessionError::SessionTimeout { secs }).await
    }

    /// State and event go out before the pending signal resolves, so a
    /// caller woken by it already observes `failed`.
    async fn fail(&self, error: SessionError) -> ControlFlow<()> {
        self.shared.abandon_inbound(AbandonReason::Disconnected).await;
        self.shared.set_state(ConnectionState::Failed).await;
        self.shared.report(error.clone());
        self.release(&error).await;
        ControlFlow::Break(())
    }

    /// Stop this peer from the inside. The `ActivePeer` slot is cleared by
    /// the next public operation.
    async fn release(&self, error: &SessionError) {
        fail_pending(&self.signal, error);
        self.stop.cancel();
        self.channel.close().await;
    }
}
