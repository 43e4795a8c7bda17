//! WebRTC data-channel primitive.
//!
//! Signaling is non-trickle: each side waits for ICE gathering to finish and
//! ships its complete session description, candidates included, as a single
//! [`SignalPayload`] (the JSON form of `RTCSessionDescription`).
//!
//! The initiator creates the one ordered, reliable data channel and the
//! offer. The responder learns about the channel through `on_data_channel`
//! and answers once the offer is accepted.

use crate::core::config::{IceServerConfig, SessionConfig, DATA_CHANNEL_LABEL, ICE_GATHER_TIMEOUT};
use crate::core::connection::{PeerChannel, PeerEvent, PeerEvents, PeerFactory, SignalPayload};
use crate::core::protocol::WireFrame;
use crate::core::session::Role;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type EventTx = mpsc::UnboundedSender<PeerEvent>;

// ── Factory ──────────────────────────────────────────────────────────────────

/// Opens real WebRTC peer connections.
#[derive(Debug, Clone)]
pub struct WebRtcFactory {
    ice_servers: Vec<RTCIceServer>,
    gather_timeout: Duration,
}

impl WebRtcFactory {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.iter().map(ice_server).collect(),
            gather_timeout: ICE_GATHER_TIMEOUT,
        }
    }

    fn create_api() -> Result<webrtc::api::API> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;

        Ok(APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build())
    }
}

fn ice_server(cfg: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: cfg.urls.clone(),
        username: cfg.username.clone(),
        credential: cfg.credential.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl PeerFactory for WebRtcFactory {
    async fn open(&self, role: Role) -> Result<(Arc<dyn PeerChannel>, PeerEvents)> {
        let api = Self::create_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await
            .context("failed to create peer connection")?,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        watch_connection_state(&pc, tx.clone(), role);

        let peer = Arc::new(WebRtcPeer {
            pc: pc.clone(),
            role,
            dc: Arc::new(RwLock::new(None)),
            events: tx.clone(),
            gather_timeout: self.gather_timeout,
        });

        match role {
            Role::Initiator => {
                // Ordered + fully reliable (SCTP default, no partial reliability).
                let dc = pc
                    .create_data_channel(
                        DATA_CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await
                    .context("failed to create data channel")?;
                attach_dc_handlers(&dc, tx);
                *peer.dc.write().await = Some(dc);

                let offer = pc.create_offer(None).await?;
                let gathered = arm_gathering(&pc);
                pc.set_local_description(offer).await?;
                peer.spawn_signal(gathered);
            }
            Role::Responder => {
                let slot = peer.dc.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let tx = tx.clone();
                    Box::pin(async move {
                        info!(event = "dc_announced", channel = %dc.label(), "Remote data channel announced");
                        attach_dc_handlers(&dc, tx.clone());
                        if dc.ready_state() == RTCDataChannelState::Open {
                            let _ = tx.send(PeerEvent::Connect);
                        }
                        *slot.write().await = Some(dc);
                    })
                }));
            }
        }

        Ok((peer as Arc<dyn PeerChannel>, rx))
    }
}

// ── Peer ─────────────────────────────────────────────────────────────────────

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    role: Role,
    dc: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    events: EventTx,
    gather_timeout: Duration,
}

impl WebRtcPeer {
    /// Wait for gathering in the background and emit the full description.
    fn spawn_signal(&self, gathered: oneshot::Receiver<()>) {
        let pc = self.pc.clone();
        let tx = self.events.clone();
        let limit = self.gather_timeout;
        tokio::spawn(async move {
            match gather_local_description(&pc, gathered, limit).await {
                Ok(sdp) => {
                    debug!(event = "local_description_ready", bytes = sdp.len(), "Local description gathered");
                    let _ = tx.send(PeerEvent::Signal(SignalPayload::new(sdp)));
                }
                Err(e) => {
                    error!(event = "ice_gather_failure", error = %e, "Failed to gather local description");
                    let _ = tx.send(PeerEvent::Error(format!("{e:#}")));
                }
            }
        });
    }

    async fn channel(&self) -> Result<Arc<RTCDataChannel>> {
        let dc = self
            .dc
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("data channel not established"))?;
        let state = dc.ready_state();
        if state != RTCDataChannelState::Open {
            bail!("data channel not open: {state:?}");
        }
        Ok(dc)
    }
}

#[async_trait]
impl PeerChannel for WebRtcPeer {
    async fn accept_signal(&self, signal: SignalPayload) -> Result<()> {
        let desc: RTCSessionDescription =
            serde_json::from_str(signal.as_str()).context("signal is not a session description")?;

        match (self.role, desc.sdp_type) {
            (Role::Responder, RTCSdpType::Offer) => {
                self.pc
                    .set_remote_description(desc)
                    .await
                    .context("remote offer rejected")?;
                let answer = self.pc.create_answer(None).await?;
                let gathered = arm_gathering(&self.pc);
                self.pc.set_local_description(answer).await?;
                self.spawn_signal(gathered);
            }
            (Role::Initiator, RTCSdpType::Answer) => {
                self.pc
                    .set_remote_description(desc)
                    .await
                    .context("remote answer rejected")?;
            }
            (role, other) => bail!("unexpected {other:?} description for {role:?}"),
        }
        Ok(())
    }

    async fn send(&self, frame: WireFrame) -> Result<()> {
        let dc = self.channel().await?;
        match frame {
            WireFrame::Text(text) => dc.send_text(text).await?,
            WireFrame::Binary(data) => dc.send(&data).await?,
        };
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        match self.dc.read().await.as_ref() {
            Some(dc) => dc.buffered_amount().await as usize,
            None => 0,
        }
    }

    async fn close(&self) {
        if let Some(dc) = self.dc.write().await.take() {
            if let Err(e) = dc.close().await {
                debug!(event = "dc_close_failure", error = %e, "Data channel close failed");
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!(event = "pc_close_failure", error = %e, "Peer connection close failed");
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

fn watch_connection_state(pc: &Arc<RTCPeerConnection>, tx: EventTx, role: Role) {
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", ?role, "WebRTC connection established");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", ?role, "WebRTC connection failed");
                    let _ = tx.send(PeerEvent::Error("peer connection failed".into()));
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        ?role,
                        "WebRTC transient disconnect (ICE may recover)"
                    );
                }
                RTCPeerConnectionState::Closed => {
                    info!(event = "webrtc_closed", ?role, "WebRTC connection closed");
                }
                _ => {}
            }
        })
    }));
}

/// Forward data channel callbacks as [`PeerEvent`]s.
fn attach_dc_handlers(dc: &Arc<RTCDataChannel>, tx: EventTx) {
    let label = dc.label().to_string();

    let open_tx = tx.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        let tx = open_tx.clone();
        let label = open_label.clone();
        Box::pin(async move {
            info!(event = "dc_open", channel = %label, "DataChannel open");
            let _ = tx.send(PeerEvent::Connect);
        })
    }));

    let close_tx = tx.clone();
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let tx = close_tx.clone();
        let label = close_label.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
            let _ = tx.send(PeerEvent::Close);
        })
    }));

    let error_tx = tx.clone();
    dc.on_error(Box::new(move |err| {
        let tx = error_tx.clone();
        let label = label.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
            let _ = tx.send(PeerEvent::Error(err.to_string()));
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::Data(msg.data));
        })
    }));
}

// ── ICE gathering ────────────────────────────────────────────────────────────

/// Register for gathering completion. Must run before
/// `set_local_description`, which starts gathering.
fn arm_gathering(pc: &Arc<RTCPeerConnection>) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel::<()>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            if state == RTCIceGathererState::Complete {
                if let Ok(mut guard) = tx.lock() {
                    if let Some(tx) = guard.take() {
                        let _ = tx.send(());
                    }
                }
            }
        })
    }));
    rx
}

async fn gather_local_description(
    pc: &Arc<RTCPeerConnection>,
    gathered: oneshot::Receiver<()>,
    limit: Duration,
) -> Result<String> {
    match timeout(limit, gathered).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => bail!("ICE gathering channel closed"),
        // Ship whatever was gathered so far; host candidates may be enough.
        Err(_) => warn!(event = "ice_gather_timeout", ?limit, "ICE gathering timed out"),
    }

    let desc = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("no local description after ICE gathering"))?;
    Ok(serde_json::to_string(&desc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_from_config() {
        let factory = WebRtcFactory::new(&SessionConfig::default());
        assert_eq!(factory.ice_servers.len(), 1);
        assert_eq!(
            factory.ice_servers[0].urls,
            vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_non_description_signal() {
        let factory = WebRtcFactory::new(&SessionConfig {
            ice_servers: Vec::new(),
            ..SessionConfig::default()
        });
        let (peer, _events) = factory.open(Role::Responder).await.unwrap();
        assert!(peer.accept_signal(SignalPayload::new("not json")).await.is_err());
        assert!(peer
            .accept_signal(SignalPayload::new(r#"{"type":"answer","sdp":""}"#))
            .await
            .is_err());
        assert!(peer.send(WireFrame::Text("x".into())).await.is_err());
        peer.close().await;
    }
}
