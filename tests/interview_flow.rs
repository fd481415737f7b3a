use interview_rtc::{
    start_engine, CaptureFn, Config, EmittedEvents, EngineArgs, EngineHandle, LinkState,
    LocalRelay, LocalTrack, LoopbackFactory, RegistryError, SessionRegistry, Side, SignalMessage,
    StreamRole, TrackKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Peer {
    id: String,
    handle: EngineHandle,
    factory: LoopbackFactory,
    events: mpsc::UnboundedReceiver<EmittedEvents<()>>,
}

impl Peer {
    async fn start(relay: &LocalRelay, id: &str, side: Side) -> Self {
        let factory = LoopbackFactory::new();
        let (tx, events) = mpsc::unbounded_channel();
        let (handle, _) = start_engine(EngineArgs {
            id: id.into(),
            side,
            factory: factory.clone(),
            relay: Arc::new(relay.clone()),
            capture: camera(id),
            config: Config::default(),
            emitted_event_chan: tx,
        })
        .await
        .unwrap();
        Self {
            id: id.into(),
            handle,
            factory,
            events,
        }
    }

    fn drain(&mut self) -> Vec<EmittedEvents<()>> {
        let mut out = vec![];
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn camera(id: &str) -> CaptureFn {
    let id = id.to_string();
    Box::new(move || {
        let stream = format!("{}-cam", id);
        vec![
            LocalTrack::new(format!("{}-mic", id), stream.clone(), TrackKind::Audio, StreamRole::Camera),
            LocalTrack::new(format!("{}-video", id), stream, TrackKind::Video, StreamRole::Camera),
        ]
    })
}

fn classified(events: &[EmittedEvents<()>]) -> Vec<(String, StreamRole)> {
    events
        .iter()
        .filter_map(|e| match e {
            EmittedEvents::StreamClassified { stream, .. } => {
                Some((stream.stream_id.clone(), stream.role))
            }
            _ => None,
        })
        .collect()
}

fn last_position(events: &[EmittedEvents<()>]) -> Option<usize> {
    events.iter().rev().find_map(|e| match e {
        EmittedEvents::Session {
            message: SignalMessage::QueueUpdate { you, .. },
            ..
        } => *you,
        _ => None,
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn two_candidates_are_interviewed_in_join_order() {
    let relay = LocalRelay::new();
    let registry = SessionRegistry::new(Arc::new(relay.clone()), &Config::default())
        .with_code_source(|_| "7XQK2A".to_string());
    let mut host = Peer::start(&relay, "host", Side::Host).await;
    let mut first = Peer::start(&relay, "ana", Side::Candidate).await;
    let mut second = Peer::start(&relay, "ben", Side::Candidate).await;

    let code = registry.create_session(&host.id).await.unwrap();
    assert_eq!(registry.join_session("7xq k2a ", &first.id).await.unwrap(), 1);
    assert_eq!(registry.join_session(&code, &second.id).await.unwrap(), 2);
    assert_eq!(
        registry.start_next(&code).await.unwrap(),
        first.id,
        "queue is first come first served"
    );
    settle().await;

    assert_eq!(first.handle.link_state("host").await.unwrap(), Some(LinkState::Stable));
    assert_eq!(host.handle.link_state("ana").await.unwrap(), Some(LinkState::Stable));
    assert_eq!(second.handle.link_state("host").await.unwrap(), None);
    assert_eq!(classified(&host.drain()), vec![("ana-cam".to_string(), StreamRole::Camera)]);
    assert_eq!(classified(&first.drain()), vec![("host-cam".to_string(), StreamRole::Camera)]);
    assert_eq!(last_position(&second.drain()), Some(1));

    // only one interview at a time
    assert!(matches!(
        registry.start_next(&code).await,
        Err(RegistryError::InterviewInProgress(_))
    ));

    registry.end_interview(&code).await.unwrap();
    settle().await;
    assert_eq!(host.handle.link_state("ana").await.unwrap(), None);
    assert!(first.factory.transport("host").unwrap().is_closed());
    let ended = first.drain();
    assert!(ended
        .iter()
        .any(|e| matches!(e, EmittedEvents::LinkClosed { peer } if peer == "host")));

    assert_eq!(registry.start_next(&code).await.unwrap(), second.id);
    settle().await;
    assert_eq!(host.handle.link_state("ben").await.unwrap(), Some(LinkState::Stable));
    assert_eq!(classified(&host.drain()), vec![("ben-cam".to_string(), StreamRole::Camera)]);
    // the host got a fresh transport for the second interview
    assert!(!host.factory.transport("ben").unwrap().is_closed());
}

#[tokio::test(start_paused = true)]
async fn screen_shares_in_both_directions() {
    let relay = LocalRelay::new();
    let registry = SessionRegistry::new(Arc::new(relay.clone()), &Config::default());
    let mut host = Peer::start(&relay, "host", Side::Host).await;
    let mut candidate = Peer::start(&relay, "ana", Side::Candidate).await;

    let code = registry.create_session(&host.id).await.unwrap();
    registry.join_session(&code, &candidate.id).await.unwrap();
    registry.start_next(&code).await.unwrap();
    settle().await;
    host.drain();
    candidate.drain();

    // both start sharing before either hears about the other
    let host_screen = LocalTrack::new("host-screen", "host-screen", TrackKind::Video, StreamRole::Screen);
    let ana_screen = LocalTrack::new("ana-screen", "ana-screen", TrackKind::Video, StreamRole::Screen);
    let (a, b) = tokio::join!(
        host.handle.start_screen_share("ana", host_screen),
        candidate.handle.start_screen_share("host", ana_screen),
    );
    a.unwrap();
    b.unwrap();
    settle().await;

    assert_eq!(host.handle.link_state("ana").await.unwrap(), Some(LinkState::Stable));
    assert_eq!(candidate.handle.link_state("host").await.unwrap(), Some(LinkState::Stable));
    assert_eq!(classified(&host.drain()), vec![("ana-screen".to_string(), StreamRole::Screen)]);
    assert_eq!(
        classified(&candidate.drain()),
        vec![("host-screen".to_string(), StreamRole::Screen)]
    );

    candidate.handle.stop_screen_share("host").await.unwrap();
    settle().await;
    let events = host.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        EmittedEvents::StreamRetired { stream_id, .. } if stream_id == "ana-screen"
    )));
}

#[tokio::test(start_paused = true)]
async fn deleting_the_session_tears_everything_down() {
    let relay = LocalRelay::new();
    let registry = SessionRegistry::new(Arc::new(relay.clone()), &Config::default());
    let mut host = Peer::start(&relay, "host", Side::Host).await;
    let mut active = Peer::start(&relay, "ana", Side::Candidate).await;
    let mut waiting = Peer::start(&relay, "ben", Side::Candidate).await;

    let code = registry.create_session(&host.id).await.unwrap();
    registry.join_session(&code, &active.id).await.unwrap();
    registry.join_session(&code, &waiting.id).await.unwrap();
    registry.start_next(&code).await.unwrap();
    settle().await;

    registry.delete_session(&code).await.unwrap();
    settle().await;

    assert_eq!(host.handle.link_state("ana").await.unwrap(), None);
    assert_eq!(active.handle.link_state("host").await.unwrap(), None);
    for peer in [&mut active, &mut waiting] {
        let events = peer.drain();
        assert!(
            events.iter().any(|e| matches!(
                e,
                EmittedEvents::Session { message: SignalMessage::SessionDeleted { .. }, .. }
            )),
            "{} was not told",
            peer.id
        );
    }
    assert!(registry.snapshot(&code).await.is_none());
    host.drain();
}
