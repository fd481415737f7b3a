//! A transport that never touches the network. The "SDP" it produces is a
//! JSON list of the sender's tracks; applying a remote description diffs that
//! list and reports added and removed tracks the way a real peer connection
//! fires `on_track`. Signaling state follows the JSEP transitions, so glare,
//! stale answers and early ICE behave as they would on a real connection.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use super::transport::{
    MediaTransport, SignalingState, TransportEvent, TransportEvents, TransportFactory,
};
use crate::internal::data_types::{LocalTrack, PeerId, RemoteTrack, StreamId, TrackDescriptor};
use crate::signaling::{SdpType, SessionDescription};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AnnouncedTrack {
    stream_id: StreamId,
    descriptor: TrackDescriptor,
}

#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    version: u64,
    tracks: Vec<AnnouncedTrack>,
}

struct State {
    signaling: SignalingState,
    has_remote: bool,
    local_tracks: Vec<LocalTrack>,
    remote_tracks: Vec<AnnouncedTrack>,
    applied_candidates: Vec<String>,
    gathered: usize,
    version: u64,
    offers_created: usize,
    answers_created: usize,
    rollbacks: usize,
    fail_next_offer: bool,
    closed: bool,
}

/// Cloning shares the underlying connection; tests keep a clone to inspect it.
#[derive(Clone)]
pub struct LoopbackTransport {
    state: Arc<Mutex<State>>,
    events: TransportEvents<()>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LoopbackTransport {
    pub fn new(events: TransportEvents<()>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                signaling: SignalingState::Stable,
                has_remote: false,
                local_tracks: Vec::new(),
                remote_tracks: Vec::new(),
                applied_candidates: Vec::new(),
                gathered: 0,
                version: 0,
                offers_created: 0,
                answers_created: 0,
                rollbacks: 0,
                fail_next_offer: false,
                closed: false,
            })),
            events,
        }
    }

    /// the next `create_offer` fails once
    pub fn fail_next_offer(&self) {
        lock(&self.state).fail_next_offer = true;
    }

    /// reports an ICE failure, as a dropped network would
    pub fn simulate_failure(&self) {
        self.events.emit(TransportEvent::Failed);
    }

    pub fn fire_negotiation_needed(&self) {
        self.events.emit(TransportEvent::NegotiationNeeded);
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.state).applied_candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        lock(&self.state).offers_created
    }

    pub fn answers_created(&self) -> usize {
        lock(&self.state).answers_created
    }

    pub fn rollbacks(&self) -> usize {
        lock(&self.state).rollbacks
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn local_track_ids(&self) -> Vec<String> {
        lock(&self.state)
            .local_tracks
            .iter()
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn remote_track_ids(&self) -> Vec<String> {
        lock(&self.state)
            .remote_tracks
            .iter()
            .map(|t| t.descriptor.id.clone())
            .collect()
    }

    fn describe(state: &State) -> Result<String> {
        let tracks = state
            .local_tracks
            .iter()
            .map(|t| AnnouncedTrack {
                stream_id: t.stream_id.clone(),
                descriptor: TrackDescriptor::new(t.id.clone(), t.kind),
            })
            .collect();
        Ok(serde_json::to_string(&Announcement {
            version: state.version,
            tracks,
        })?)
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    type Media = ();

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.state).has_remote
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = lock(&self.state);
        if state.closed {
            bail!("transport closed");
        }
        if std::mem::take(&mut state.fail_next_offer) {
            bail!("offer creation failed");
        }
        state.version += 1;
        state.offers_created += 1;
        Ok(SessionDescription::offer(Self::describe(&state)?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = lock(&self.state);
        if state.signaling != SignalingState::HaveRemoteOffer {
            bail!("cannot answer in {}", state.signaling);
        }
        state.version += 1;
        state.answers_created += 1;
        Ok(SessionDescription::answer(Self::describe(&state)?))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let candidate = {
            let mut state = lock(&self.state);
            state.signaling = match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (sdp_type, current) => {
                    bail!("cannot set local {:?} in {}", sdp_type, current)
                }
            };
            state.gathered += 1;
            RTCIceCandidateInit {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    state.gathered,
                    50000 + state.gathered
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                ..Default::default()
            }
        };
        self.events.emit(TransportEvent::LocalCandidate(candidate));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.sdp_type == SdpType::Rollback {
            return self.rollback().await;
        }
        let announcement: Announcement = serde_json::from_str(&desc.sdp)?;

        let (added, removed) = {
            let mut state = lock(&self.state);
            state.signaling = match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (sdp_type, current) => {
                    bail!("cannot set remote {:?} in {}", sdp_type, current)
                }
            };
            state.has_remote = true;

            let added: Vec<AnnouncedTrack> = announcement
                .tracks
                .iter()
                .filter(|t| !state.remote_tracks.contains(t))
                .cloned()
                .collect();
            let removed: Vec<AnnouncedTrack> = state
                .remote_tracks
                .iter()
                .filter(|t| !announcement.tracks.contains(t))
                .cloned()
                .collect();
            state.remote_tracks = announcement.tracks;
            (added, removed)
        };

        for track in removed {
            self.events.emit(TransportEvent::TrackEnded {
                stream_id: track.stream_id,
                track_id: track.descriptor.id,
            });
        }
        for track in added {
            self.events.emit(TransportEvent::Track(RemoteTrack {
                stream_id: track.stream_id,
                descriptor: track.descriptor,
                media: (),
            }));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match state.signaling {
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {
                state.signaling = SignalingState::Stable;
                state.rollbacks += 1;
                Ok(())
            }
            other => bail!("nothing to roll back in {}", other),
        }
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.has_remote {
            bail!("remote description not set");
        }
        if !candidate.candidate.is_empty() {
            state.applied_candidates.push(candidate.candidate);
        }
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            bail!("transport closed");
        }
        state.local_tracks.retain(|t| t.id != track.id);
        state.local_tracks.push(track.clone());
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let before = state.local_tracks.len();
        state.local_tracks.retain(|t| t.id != track_id);
        if state.local_tracks.len() == before {
            bail!("no local track {}", track_id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Creates loopback transports and remembers the latest one per remote id.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    created: Arc<Mutex<HashMap<PeerId, LoopbackTransport>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, remote: &str) -> Option<LoopbackTransport> {
        match self.created.lock() {
            Ok(created) => created.get(remote).cloned(),
            Err(poisoned) => poisoned.into_inner().get(remote).cloned(),
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    type Transport = LoopbackTransport;

    async fn create(&self, remote: &PeerId, events: TransportEvents<()>) -> Result<Self::Transport> {
        let transport = LoopbackTransport::new(events);
        let mut created = match self.created.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if created.insert(remote.clone(), transport.clone()).is_some() {
            log::debug!("replacing loopback transport for {}", remote);
        }
        Ok(transport)
    }
}
