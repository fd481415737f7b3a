//! Signaling relay contract and the message catalog carried over it.
//!
//! The relay is a dumb addressed bus: it moves [`Envelope`]s between peer ids
//! and never looks inside the payload. Delivery is FIFO per sender/receiver
//! pair and nothing more; loss and duplicates are handled by the negotiation
//! layer.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::internal::data_types::PeerId;

mod local;
pub use local::LocalRelay;

/// sender id stamped on everything the session registry emits
pub const REGISTRY_ID: &str = "registry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Rollback,
}

/// An SDP document in the shape browsers put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalMessage {
    // client -> registry
    CreateSession,
    JoinSession {
        code: String,
    },
    StartNext {
        code: String,
    },
    EndInterview {
        code: String,
    },
    DeleteSession {
        code: String,
    },

    // registry -> clients
    SessionCreated {
        code: String,
    },
    QueueUpdate {
        queue: Vec<PeerId>,
        /// 1-based position of the receiving candidate, absent for the host
        #[serde(default, skip_serializing_if = "Option::is_none")]
        you: Option<usize>,
    },
    CandidateSelected {
        candidate: PeerId,
    },
    InterviewStart {
        #[serde(rename = "hostId")]
        host_id: PeerId,
    },
    InterviewEnded,
    InterviewEndedHost,
    SessionDeleted {
        code: String,
    },

    // peer -> peer
    HostReady,
    WebrtcOffer {
        sdp: SessionDescription,
    },
    WebrtcAnswer {
        sdp: SessionDescription,
    },
    WebrtcIce {
        candidate: RTCIceCandidateInit,
    },
    ScreenShareStarted,
    ScreenShareStopped,
    CandidateStartedScreen,
    CandidateStoppedScreen,
}

impl SignalMessage {
    /// the wire name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            SignalMessage::CreateSession => "create_session",
            SignalMessage::JoinSession { .. } => "join_session",
            SignalMessage::StartNext { .. } => "start_next",
            SignalMessage::EndInterview { .. } => "end_interview",
            SignalMessage::DeleteSession { .. } => "delete_session",
            SignalMessage::SessionCreated { .. } => "session_created",
            SignalMessage::QueueUpdate { .. } => "queue_update",
            SignalMessage::CandidateSelected { .. } => "candidate_selected",
            SignalMessage::InterviewStart { .. } => "interview_start",
            SignalMessage::InterviewEnded => "interview_ended",
            SignalMessage::InterviewEndedHost => "interview_ended_host",
            SignalMessage::SessionDeleted { .. } => "session_deleted",
            SignalMessage::HostReady => "host_ready",
            SignalMessage::WebrtcOffer { .. } => "webrtc_offer",
            SignalMessage::WebrtcAnswer { .. } => "webrtc_answer",
            SignalMessage::WebrtcIce { .. } => "webrtc_ice",
            SignalMessage::ScreenShareStarted => "screen_share_started",
            SignalMessage::ScreenShareStopped => "screen_share_stopped",
            SignalMessage::CandidateStartedScreen => "candidate_started_screen",
            SignalMessage::CandidateStoppedScreen => "candidate_stopped_screen",
        }
    }

    /// requests the registry answers instead of forwarding
    pub fn is_registry_request(&self) -> bool {
        matches!(
            self,
            SignalMessage::CreateSession
                | SignalMessage::JoinSession { .. }
                | SignalMessage::StartNext { .. }
                | SignalMessage::EndInterview { .. }
                | SignalMessage::DeleteSession { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PeerId,
    pub to: PeerId,
    pub message: SignalMessage,
}

impl Envelope {
    pub fn new(from: impl Into<PeerId>, to: impl Into<PeerId>, message: SignalMessage) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message,
        }
    }
}

/// Answer to a registry request: `{ok}` or `{ok: false, error}` plus whatever
/// the request produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Relay: Send + Sync {
    /// hands the envelope to the bus. a missing recipient is not an error
    async fn send(&self, envelope: Envelope) -> Result<()>;
    /// opens the mailbox for `id`. a newer subscription for the same id
    /// replaces the older one
    async fn subscribe(&self, id: &PeerId) -> Result<Subscription>;
}

/// Mailbox handle returned by [`Relay::subscribe`]. Releasing it (explicitly
/// or by dropping it) detaches the mailbox; nothing is delivered afterwards.
pub struct Subscription {
    id: PeerId,
    rx: mpsc::UnboundedReceiver<Envelope>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(
        id: PeerId,
        rx: mpsc::UnboundedReceiver<Envelope>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        if !self.is_active() {
            return None;
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        if !self.is_active() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// idempotent
    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            self.rx.close();
            log::debug!("released relay subscription for {}", self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
