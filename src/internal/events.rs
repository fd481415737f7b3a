use crate::classifier::ClassifiedStream;
use crate::internal::data_types::{PeerId, StreamId, StreamRole};
use crate::signaling::SignalMessage;

/// Everything the engine reports to the embedding application.
#[derive(Debug, Clone)]
pub enum EmittedEvents<M> {
    /// a link to `peer` was created and its local tracks attached
    LinkOpened { peer: PeerId },
    /// a remote stream got its role. re-emitted when late tracks join it
    StreamClassified {
        peer: PeerId,
        stream: ClassifiedStream<M>,
    },
    /// the stream should no longer be rendered
    StreamRetired {
        peer: PeerId,
        stream_id: StreamId,
        role: StreamRole,
    },
    /// the remote side announced or ended a screen share
    RemoteScreenShare { peer: PeerId, active: bool },
    /// ICE failed. the link has already been torn down
    Disconnected { peer: PeerId },
    LinkClosed { peer: PeerId },
    /// registry traffic (queue updates, session lifecycle) for the UI
    Session {
        from: PeerId,
        message: SignalMessage,
    },
}

impl<M> EmittedEvents<M> {
    pub fn peer(&self) -> &PeerId {
        match self {
            EmittedEvents::LinkOpened { peer }
            | EmittedEvents::StreamClassified { peer, .. }
            | EmittedEvents::StreamRetired { peer, .. }
            | EmittedEvents::RemoteScreenShare { peer, .. }
            | EmittedEvents::Disconnected { peer }
            | EmittedEvents::LinkClosed { peer } => peer,
            EmittedEvents::Session { from, .. } => from,
        }
    }
}
