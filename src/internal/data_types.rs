use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// uniquely identifies peers on the relay
pub type PeerId = String;

/// identifies a remote media stream (the msid stream id)
pub type StreamId = String;

/// which end of an interview the local peer is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[display(fmt = "host")]
    Host,
    #[display(fmt = "candidate")]
    Candidate,
}

impl Side {
    /// the host always yields on glare, the candidate never does
    pub fn role(self) -> Role {
        match self {
            Side::Host => Role::Polite,
            Side::Candidate => Role::Impolite,
        }
    }
}

/// fixed glare resolution role of a PeerLink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Role {
    #[display(fmt = "polite")]
    Polite,
    #[display(fmt = "impolite")]
    Impolite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

/// what a capture device reports as its display surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceHint {
    Monitor,
    Window,
    Browser,
    #[serde(rename = "none")]
    Unspecified,
}

/// the label handed to rendering/recording for a remote stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    #[display(fmt = "camera")]
    Camera,
    #[display(fmt = "screen")]
    Screen,
}

/// Everything the classifier may look at for one remote track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: String,
    pub kind: TrackKind,
    pub surface: Option<SurfaceHint>,
    pub label: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// a role the sending side attached to the track itself
    pub declared_role: Option<StreamRole>,
}

impl TrackDescriptor {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            surface: None,
            label: String::new(),
            width: None,
            height: None,
            declared_role: None,
        }
    }

    pub fn audio(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Audio)
    }

    pub fn video(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Video)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_surface(mut self, surface: SurfaceHint) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn with_role(mut self, role: StreamRole) -> Self {
        self.declared_role = Some(role);
        self
    }

    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }
}

/// A track delivered by the transport. `media` is whatever handle the
/// transport uses for the raw track (an `Arc<TrackRemote>` for webrtc-rs).
#[derive(Debug, Clone)]
pub struct RemoteTrack<M> {
    pub stream_id: StreamId,
    pub descriptor: TrackDescriptor,
    pub media: M,
}

/// A locally captured track. Capture itself happens outside this crate; the
/// stop flag is shared by every clone so stopping one stops them all.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    pub stream_id: StreamId,
    pub kind: TrackKind,
    pub role: StreamRole,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(
        id: impl Into<String>,
        stream_id: impl Into<StreamId>,
        kind: TrackKind,
        role: StreamRole,
    ) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            role,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            log::debug!("stopped local {} track {}", self.kind, self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
