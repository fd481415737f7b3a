//! [`MediaTransport`] on top of webrtc-rs.
//!
//! This crate does not capture or encode media. Local tracks are
//! `TrackLocalStaticRTP`s the application writes RTP packets into (see
//! [`LocalMedia`]); remote RTP is fanned out on a broadcast channel per track
//! (see [`RemoteMedia`]).

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::transport::{
    MediaTransport, SignalingState, TransportEvent, TransportEvents, TransportFactory,
};
use crate::config::Config;
use crate::internal::data_types::{LocalTrack, PeerId, RemoteTrack, TrackDescriptor, TrackKind};
use crate::signaling::SessionDescription;

// fan-out buffer for remote RTP, in packets
const REMOTE_RTP_BUFFER: usize = 512;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The RTP sinks for local tracks, shared by every connection so one write
/// reaches all remote peers.
#[derive(Clone, Default)]
pub struct LocalMedia {
    tracks: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticRTP>>>>,
}

impl LocalMedia {
    /// where the application writes RTP for the local track `id`
    pub fn track(&self, id: &str) -> Option<Arc<TrackLocalStaticRTP>> {
        lock(&self.tracks).get(id).cloned()
    }

    fn get_or_create(&self, track: &LocalTrack) -> Arc<TrackLocalStaticRTP> {
        lock(&self.tracks)
            .entry(track.id.clone())
            .or_insert_with(|| {
                let codec = match track.kind {
                    TrackKind::Audio => RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        ..Default::default()
                    },
                    TrackKind::Video => RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                };
                Arc::new(TrackLocalStaticRTP::new(
                    codec,
                    track.id.clone(),
                    track.stream_id.clone(),
                ))
            })
            .clone()
    }
}

/// A received track and the fan-out of its RTP packets.
#[derive(Clone)]
pub struct RemoteMedia {
    pub track: Arc<TrackRemote>,
    packets: broadcast::Sender<rtp::packet::Packet>,
}

impl RemoteMedia {
    pub fn subscribe(&self) -> broadcast::Receiver<rtp::packet::Packet> {
        self.packets.subscribe()
    }
}

pub struct RtcTransportFactory {
    api: webrtc::api::API,
    ice_servers: Vec<String>,
    local_media: LocalMedia,
}

impl RtcTransportFactory {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            api: create_api()?,
            ice_servers: config.ice_servers.clone(),
            local_media: LocalMedia::default(),
        })
    }

    pub fn local_media(&self) -> LocalMedia {
        self.local_media.clone()
    }
}

// todo: add support for more codecs. perhaps make it configurable
fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;

    // NACKs, RTCP reports and the rest of the default RTP/RTCP pipeline
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    type Transport = RtcTransport;

    async fn create(
        &self,
        remote: &PeerId,
        events: TransportEvents<RemoteMedia>,
    ) -> Result<Self::Transport> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let connection = Arc::new(self.api.new_peer_connection(config).await?);

        // send discovered ice candidates (for self) to the remote peer
        let tx = events.clone();
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = c {
                    match candidate.to_json() {
                        Ok(init) => tx.emit(TransportEvent::LocalCandidate(init)),
                        Err(e) => log::error!(
                            "failed to serialize ice candidate for {}: {}",
                            tx.remote(),
                            e
                        ),
                    }
                }
            })
        }));

        let tx = events.clone();
        connection.on_ice_connection_state_change(Box::new(
            move |connection_state: RTCIceConnectionState| {
                log::info!(
                    "ice connection state for peer {} has changed: {}",
                    tx.remote(),
                    connection_state
                );
                if connection_state == RTCIceConnectionState::Failed {
                    tx.emit(TransportEvent::Failed);
                }
                Box::pin(async {})
            },
        ));

        let tx = events.clone();
        connection.on_negotiation_needed(Box::new(move || {
            tx.emit(TransportEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let tx = events;
        connection.on_track(Box::new(
            move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
                let tx = tx.clone();
                Box::pin(async move {
                    if let Some(track) = track {
                        forward_remote_track(track, tx).await;
                    }
                })
            },
        ));

        Ok(RtcTransport {
            remote: remote.clone(),
            connection,
            local_media: self.local_media.clone(),
            senders: tokio::sync::Mutex::new(HashMap::new()),
        })
    }
}

/// Reports the track, then pumps its RTP into the broadcast channel until
/// the track ends.
async fn forward_remote_track(track: Arc<TrackRemote>, tx: TransportEvents<RemoteMedia>) {
    let id = track.id().await;
    let stream_id = track.stream_id().await;
    let kind = match track.kind() {
        RTPCodecType::Audio => TrackKind::Audio,
        RTPCodecType::Video => TrackKind::Video,
        other => {
            log::warn!("ignoring remote track {} of kind {:?}", id, other);
            return;
        }
    };

    let (packets, _) = broadcast::channel(REMOTE_RTP_BUFFER);
    tx.emit(TransportEvent::Track(RemoteTrack {
        stream_id: stream_id.clone(),
        descriptor: TrackDescriptor::new(id.clone(), kind),
        media: RemoteMedia {
            track: track.clone(),
            packets: packets.clone(),
        },
    }));

    tokio::spawn(async move {
        while let Ok((packet, _)) = track.read_rtp().await {
            // nobody listening is fine
            let _ = packets.send(packet);
        }
        log::debug!("remote track {} of {} ended", id, tx.remote());
        tx.emit(TransportEvent::TrackEnded {
            stream_id,
            track_id: id,
        });
    });
}

pub struct RtcTransport {
    remote: PeerId,
    connection: Arc<RTCPeerConnection>,
    local_media: LocalMedia,
    senders: tokio::sync::Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    // both sides use the browser JSON shape
    Ok(serde_json::from_value(serde_json::to_value(desc)?)?)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    Ok(serde_json::from_value(serde_json::to_value(desc)?)?)
}

fn rollback_description() -> Result<RTCSessionDescription> {
    Ok(serde_json::from_value(
        serde_json::json!({"type": "rollback", "sdp": ""}),
    )?)
}

#[async_trait]
impl MediaTransport for RtcTransport {
    type Media = RemoteMedia;

    fn signaling_state(&self) -> SignalingState {
        match self.connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.connection.remote_description().await.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.connection.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.connection.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        // Sets the LocalDescription, and starts our UDP listeners
        // Note: this will start the gathering of ICE candidates
        self.connection.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.connection.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        match self.signaling_state() {
            SignalingState::HaveLocalOffer => {
                self.connection
                    .set_local_description(rollback_description()?)
                    .await?
            }
            SignalingState::HaveRemoteOffer => {
                self.connection
                    .set_remote_description(rollback_description()?)
                    .await?
            }
            other => bail!("nothing to roll back in {}", other),
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let rtp_track = self.local_media.get_or_create(track);
        let sender = self
            .connection
            .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Read incoming RTCP packets
        // Before these packets are returned they are processed by interceptors. For things
        // like NACK this needs to be called.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtcp_sender.read(&mut rtcp_buf).await {}
        });

        if self
            .senders
            .lock()
            .await
            .insert(track.id.clone(), sender)
            .is_some()
        {
            log::warn!("overwriting sender for track {} to {}", track.id, self.remote);
        }
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let sender = match self.senders.lock().await.remove(track_id) {
            Some(sender) => sender,
            None => bail!("no local track {} on link to {}", track_id, self.remote),
        };
        self.connection.remove_track(&sender).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().await.clear();
        self.connection.close().await?;
        Ok(())
    }
}
