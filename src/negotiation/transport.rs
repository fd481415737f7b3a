use anyhow::Result;
use async_trait::async_trait;
use derive_more::Display;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::internal::data_types::{LocalTrack, PeerId, RemoteTrack, StreamId};
use crate::signaling::SessionDescription;

/// Negotiation phase of the underlying transport. The pranswer states of
/// webrtc fold into the matching offer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SignalingState {
    #[display(fmt = "stable")]
    Stable,
    #[display(fmt = "have-local-offer")]
    HaveLocalOffer,
    #[display(fmt = "have-remote-offer")]
    HaveRemoteOffer,
    #[display(fmt = "closed")]
    Closed,
}

/// What a transport reports back while it runs.
#[derive(Debug, Clone)]
pub enum TransportEvent<M> {
    /// ICE gathering found a local candidate
    LocalCandidate(RTCIceCandidateInit),
    Track(RemoteTrack<M>),
    TrackEnded {
        stream_id: StreamId,
        track_id: String,
    },
    NegotiationNeeded,
    /// ICE failed; the link is unusable
    Failed,
}

/// Sender half handed to a transport at creation. Tags every event with the
/// remote id the transport belongs to.
pub struct TransportEvents<M> {
    remote: PeerId,
    tx: mpsc::UnboundedSender<(PeerId, TransportEvent<M>)>,
}

impl<M> Clone for TransportEvents<M> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<M> TransportEvents<M> {
    pub fn new(remote: PeerId, tx: mpsc::UnboundedSender<(PeerId, TransportEvent<M>)>) -> Self {
        Self { remote, tx }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn emit(&self, event: TransportEvent<M>) {
        if self.tx.send((self.remote.clone(), event)).is_err() {
            log::debug!("transport event for {} after engine shutdown", self.remote);
        }
    }
}

/// The offer/answer/ICE surface the negotiation engine drives. One instance
/// per PeerLink.
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    /// handle for a received track, passed through to rendering
    type Media: Clone + Send + Sync + 'static;

    fn signaling_state(&self) -> SignalingState;
    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    /// abandons the outstanding local offer
    async fn rollback(&self) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;
    async fn remove_track(&self, track_id: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: MediaTransport;

    async fn create(
        &self,
        remote: &PeerId,
        events: TransportEvents<<Self::Transport as MediaTransport>::Media>,
    ) -> Result<Self::Transport>;
}
