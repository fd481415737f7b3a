//! interview-rtc
//!
//! Signaling and media negotiation for one-on-one video interviews. A host
//! opens a session and gets a short code; candidates join with the code and
//! wait in a FIFO queue; the host pulls them into the interview one at a time.
//!
//! The pieces:
//! - [`registry::SessionRegistry`] owns sessions, queues and the active
//!   interview, and tells peers about changes over the relay.
//! - [`signaling`] defines the message catalog and the [`signaling::Relay`]
//!   contract. The relay moves envelopes and nothing else.
//! - [`negotiation`] runs one engine per local peer. It pairs with the other
//!   side when the registry says so and keeps the connection negotiated
//!   through glare, renegotiation and lost messages ("perfect negotiation"
//!   with the host as the polite side).
//! - [`classifier`] labels incoming streams as camera or screen.
//!
//! This library does not capture or render media. With the webrtc-rs
//! transport the application writes RTP into the local tracks and reads RTP
//! from the remote ones.

pub mod classifier;
pub mod config;
pub mod error;
pub mod negotiation;
pub mod registry;
pub mod signaling;

mod internal;

#[cfg(feature = "server")]
pub mod server;

// public exports
pub use classifier::{ClassificationRule, ClassifiedStream, StreamClassifier};
pub use config::Config;
pub use error::{RegistryError, RegistryResult};
pub use internal::data_types::*;
pub use internal::events::EmittedEvents;
pub use negotiation::loopback::{LoopbackFactory, LoopbackTransport};
pub use negotiation::rtc_transport::{LocalMedia, RemoteMedia, RtcTransport, RtcTransportFactory};
pub use negotiation::{
    start as start_engine, CaptureFn, EngineArgs, EngineHandle, LinkState, MediaTransport,
    TransportFactory,
};
pub use registry::{normalize_code, Session, SessionRegistry};
pub use signaling::{
    Envelope, LocalRelay, Relay, Reply, SessionDescription, SignalMessage, Subscription,
    REGISTRY_ID,
};
pub use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
