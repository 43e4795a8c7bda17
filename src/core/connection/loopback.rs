//! In-process peer primitive.
//!
//! Every peer opened from the same [`LoopbackNetwork`] can reach every
//! other. Signals are small JSON blobs naming the sending peer; accepting
//! the responder's answer links both ends and fires `Connect` on each.
//!
//! Faults can be injected network-wide: suppress signal production, reject
//! every remote signal, or fail all live peers with a transport error.

use crate::core::connection::{PeerChannel, PeerEvent, PeerEvents, PeerFactory, SignalPayload};
use crate::core::protocol::WireFrame;
use crate::core::session::Role;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

type EventTx = mpsc::UnboundedSender<PeerEvent>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SignalKind {
    Offer,
    Answer,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackSignal {
    #[serde(rename = "type")]
    kind: SignalKind,
    peer: Uuid,
}

#[derive(Default)]
struct Registry {
    /// Event sender of every live peer, by id.
    peers: HashMap<Uuid, EventTx>,
    silent: bool,
    reject_signals: bool,
}

/// A shared in-memory "network" that hands out linked peer pairs.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, peers never produce a local signal.
    pub fn set_silent(&self, silent: bool) {
        self.with_registry(|r| r.silent = silent);
    }

    /// When set, every `accept_signal` fails.
    pub fn set_reject_signals(&self, reject: bool) {
        self.with_registry(|r| r.reject_signals = reject);
    }

    /// Deliver a transport error to every live peer.
    pub fn fail_all(&self, reason: &str) {
        let peers: Vec<_> = self.with_registry(|r| r.peers.values().cloned().collect());
        for events in peers {
            let _ = events.send(PeerEvent::Error(reason.to_string()));
        }
    }

    /// Number of peers that have not been closed.
    pub fn live_peers(&self) -> usize {
        self.with_registry(|r| r.peers.len())
    }

    fn with_registry<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        // A poisoned lock only means a panicking test; the map is still usable.
        let mut guard = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn lookup(&self, id: Uuid) -> Result<EventTx> {
        self.with_registry(|r| r.peers.get(&id).cloned())
            .ok_or_else(|| anyhow!("no loopback peer {id}"))
    }

    fn signal(&self, kind: SignalKind, peer: Uuid) -> Result<Option<PeerEvent>> {
        if self.with_registry(|r| r.silent) {
            return Ok(None);
        }
        let json = serde_json::to_string(&LoopbackSignal { kind, peer })?;
        Ok(Some(PeerEvent::Signal(SignalPayload::new(json))))
    }
}

#[async_trait]
impl PeerFactory for LoopbackNetwork {
    async fn open(&self, role: Role) -> Result<(Arc<dyn PeerChannel>, PeerEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(LoopbackPeer {
            id: Uuid::new_v4(),
            role,
            network: self.clone(),
            events: tx,
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.with_registry(|r| r.peers.insert(peer.id, peer.events.clone()));
        debug!(event = "loopback_open", peer = %peer.id, ?role, "Loopback peer opened");

        if role == Role::Initiator {
            if let Some(offer) = self.signal(SignalKind::Offer, peer.id)? {
                let _ = peer.events.send(offer);
            }
        }
        Ok((peer as Arc<dyn PeerChannel>, rx))
    }
}

struct LoopbackPeer {
    id: Uuid,
    role: Role,
    network: LoopbackNetwork,
    events: EventTx,
    remote: Mutex<Option<EventTx>>,
    closed: AtomicBool,
}

impl LoopbackPeer {
    fn remote(&self) -> Option<EventTx> {
        self.remote.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn link(&self, remote: EventTx) {
        *self.remote.lock().unwrap_or_else(|e| e.into_inner()) = Some(remote);
    }
}

#[async_trait]
impl PeerChannel for LoopbackPeer {
    async fn accept_signal(&self, signal: SignalPayload) -> Result<()> {
        if self.network.with_registry(|r| r.reject_signals) {
            bail!("signal rejected by loopback network");
        }
        let remote: LoopbackSignal =
            serde_json::from_str(signal.as_str()).context("malformed loopback signal")?;

        match (self.role, remote.kind) {
            (Role::Responder, SignalKind::Offer) => {
                let initiator = self.network.lookup(remote.peer)?;
                self.link(initiator);
                if let Some(answer) = self.network.signal(SignalKind::Answer, self.id)? {
                    let _ = self.events.send(answer);
                }
            }
            (Role::Initiator, SignalKind::Answer) => {
                // The responder linked itself when it accepted our offer.
                let responder = self.network.lookup(remote.peer)?;
                self.link(responder.clone());
                let _ = self.events.send(PeerEvent::Connect);
                let _ = responder.send(PeerEvent::Connect);
            }
            (role, kind) => bail!("unexpected {kind:?} signal for {role:?}"),
        }
        Ok(())
    }

    async fn send(&self, frame: WireFrame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("loopback peer closed");
        }
        let remote = self.remote().ok_or_else(|| anyhow!("loopback peer not connected"))?;
        let data = match frame {
            WireFrame::Text(text) => Bytes::from(text),
            WireFrame::Binary(data) => data,
        };
        remote
            .send(PeerEvent::Data(data))
            .map_err(|_| anyhow!("remote loopback peer gone"))
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(remote) = self.remote() {
            let _ = remote.send(PeerEvent::Close);
        }
        self.network.with_registry(|r| r.peers.remove(&self.id));
        debug!(event = "loopback_close", peer = %self.id, "Loopback peer closed");
    }
}
