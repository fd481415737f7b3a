//! The negotiation engine: one actor task per local identity. It owns every
//! [`PeerLink`] of that identity and is driven by four inputs: commands from
//! the application, envelopes from the relay, link timers and transport
//! events. Everything runs on the actor task, so a link never sees two inputs
//! at once.

use anyhow::{bail, Result};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::classifier::Thresholds;
use crate::config::Config;
use crate::internal::data_types::{LocalTrack, PeerId, Side};
use crate::internal::events::EmittedEvents;
use crate::signaling::{Envelope, Relay, SignalMessage, Subscription, REGISTRY_ID};

pub mod link;
pub mod loopback;
pub mod rtc_transport;
pub mod transport;

pub use link::{LinkState, PeerLink};
pub use transport::{MediaTransport, SignalingState, TransportEvent, TransportEvents, TransportFactory};

use link::{LinkArgs, TimerFired};

/// media handle type produced by a factory's transports
pub type MediaOf<F> = <<F as TransportFactory>::Transport as MediaTransport>::Media;

/// Produces fresh local tracks for each new link. Capture itself is the
/// application's business.
pub type CaptureFn = Box<dyn Fn() -> Vec<LocalTrack> + Send + Sync>;

pub type GenericResponse = Result<()>;

pub enum EngineCmd {
    Open {
        remote: PeerId,
        response: oneshot::Sender<GenericResponse>,
    },
    Close {
        remote: PeerId,
        response: oneshot::Sender<GenericResponse>,
    },
    StartScreenShare {
        remote: PeerId,
        track: LocalTrack,
        response: oneshot::Sender<GenericResponse>,
    },
    StopScreenShare {
        remote: PeerId,
        response: oneshot::Sender<GenericResponse>,
    },
    Renegotiate {
        remote: PeerId,
        response: oneshot::Sender<GenericResponse>,
    },
    LinkState {
        remote: PeerId,
        response: oneshot::Sender<Option<LinkState>>,
    },
    Shutdown {
        response: oneshot::Sender<GenericResponse>,
    },
}

// a lazy version of the builder pattern
pub struct EngineArgs<F: TransportFactory> {
    pub id: PeerId,
    pub side: Side,
    pub factory: F,
    pub relay: Arc<dyn Relay>,
    pub capture: CaptureFn,
    pub config: Config,
    pub emitted_event_chan: mpsc::UnboundedSender<EmittedEvents<MediaOf<F>>>,
}

/// Cheap to clone; every call is a command to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    id: PeerId,
    tx: mpsc::UnboundedSender<EngineCmd>,
}

impl EngineHandle {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// opens a link outside of the session flow
    pub async fn open(&self, remote: &str) -> Result<()> {
        self.request(|response| EngineCmd::Open {
            remote: remote.into(),
            response,
        })
        .await
    }

    pub async fn close(&self, remote: &str) -> Result<()> {
        self.request(|response| EngineCmd::Close {
            remote: remote.into(),
            response,
        })
        .await
    }

    pub async fn start_screen_share(&self, remote: &str, track: LocalTrack) -> Result<()> {
        self.request(|response| EngineCmd::StartScreenShare {
            remote: remote.into(),
            track,
            response,
        })
        .await
    }

    pub async fn stop_screen_share(&self, remote: &str) -> Result<()> {
        self.request(|response| EngineCmd::StopScreenShare {
            remote: remote.into(),
            response,
        })
        .await
    }

    pub async fn renegotiate(&self, remote: &str) -> Result<()> {
        self.request(|response| EngineCmd::Renegotiate {
            remote: remote.into(),
            response,
        })
        .await
    }

    pub async fn link_state(&self, remote: &str) -> Result<Option<LinkState>> {
        let (response, rx) = oneshot::channel();
        let cmd = EngineCmd::LinkState {
            remote: remote.into(),
            response,
        };
        if self.tx.send(cmd).is_err() {
            bail!("negotiation engine for {} is gone", self.id);
        }
        Ok(rx.await?)
    }

    /// closes every link and releases the relay subscription
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|response| EngineCmd::Shutdown { response })
            .await
    }

    async fn request(
        &self,
        cmd: impl FnOnce(oneshot::Sender<GenericResponse>) -> EngineCmd,
    ) -> Result<()> {
        let (response, rx) = oneshot::channel();
        if self.tx.send(cmd(response)).is_err() {
            bail!("negotiation engine for {} is gone", self.id);
        }
        rx.await?
    }
}

struct NegotiationEngine<F: TransportFactory> {
    id: PeerId,
    side: Side,
    factory: F,
    relay: Arc<dyn Relay>,
    capture: CaptureFn,
    config: Config,
    emitted_event_chan: mpsc::UnboundedSender<EmittedEvents<MediaOf<F>>>,
    links: HashMap<PeerId, PeerLink<F::Transport>>,
    /// host_ready that arrived before the link to its sender existed
    early_ready: HashSet<PeerId>,
    next_generation: u64,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    transport_tx: mpsc::UnboundedSender<(PeerId, TransportEvent<MediaOf<F>>)>,
}

/// Subscribes `args.id` on the relay and spawns the engine task.
pub async fn start<F: TransportFactory>(
    args: EngineArgs<F>,
) -> Result<(EngineHandle, JoinHandle<()>)> {
    let subscription = args.relay.subscribe(&args.id).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();

    let handle = EngineHandle {
        id: args.id.clone(),
        tx,
    };
    let engine = NegotiationEngine {
        id: args.id,
        side: args.side,
        factory: args.factory,
        relay: args.relay,
        capture: args.capture,
        config: args.config,
        emitted_event_chan: args.emitted_event_chan,
        links: HashMap::new(),
        early_ready: HashSet::new(),
        next_generation: 0,
        timer_tx,
        transport_tx,
    };
    let join = tokio::spawn(engine.run(subscription, rx, timer_rx, transport_rx));
    Ok((handle, join))
}

impl<F: TransportFactory> NegotiationEngine<F> {
    async fn run(
        mut self,
        mut subscription: Subscription,
        mut rx: mpsc::UnboundedReceiver<EngineCmd>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerFired>,
        mut transport_rx: mpsc::UnboundedReceiver<(PeerId, TransportEvent<MediaOf<F>>)>,
    ) {
        log::info!("negotiation engine for {} ({}) started", self.id, self.side);
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(EngineCmd::Shutdown { response }) => {
                        self.close_all().await;
                        subscription.unsubscribe();
                        let _ = response.send(Ok(()));
                        break;
                    }
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => {
                        log::debug!("all handles for {} dropped", self.id);
                        self.close_all().await;
                        break;
                    }
                },
                envelope = subscription.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        log::warn!("relay subscription for {} ended", self.id);
                        self.close_all().await;
                        break;
                    }
                },
                Some(fired) = timer_rx.recv() => {
                    match self.links.get_mut(&fired.remote) {
                        Some(link) => link.on_timer(fired).await,
                        None => log::debug!("timer for closed link {}", fired.remote),
                    }
                }
                Some((remote, event)) = transport_rx.recv() => {
                    self.handle_transport_event(remote, event).await;
                }
            }
        }
        log::info!("negotiation engine for {} stopped", self.id);
    }

    async fn handle_cmd(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::Open { remote, response } => {
                let result = self.open_link(remote).await;
                let _ = response.send(result);
            }
            EngineCmd::Close { remote, response } => {
                self.close_link(&remote).await;
                let _ = response.send(Ok(()));
            }
            EngineCmd::StartScreenShare {
                remote,
                track,
                response,
            } => {
                let result = match self.links.get_mut(&remote) {
                    Some(link) => link.start_screen_share(track).await,
                    None => Err(anyhow::anyhow!("no link to {}", remote)),
                };
                let _ = response.send(result);
            }
            EngineCmd::StopScreenShare { remote, response } => {
                let result = match self.links.get_mut(&remote) {
                    Some(link) => link.stop_screen_share().await,
                    None => Err(anyhow::anyhow!("no link to {}", remote)),
                };
                let _ = response.send(result);
            }
            EngineCmd::Renegotiate { remote, response } => {
                let result = match self.links.get_mut(&remote) {
                    Some(link) => {
                        link.negotiate("renegotiate requested").await;
                        Ok(())
                    }
                    None => Err(anyhow::anyhow!("no link to {}", remote)),
                };
                let _ = response.send(result);
            }
            EngineCmd::LinkState { remote, response } => {
                let _ = response.send(self.links.get(&remote).map(|l| l.state()));
            }
            // handled by the run loop
            EngineCmd::Shutdown { response } => {
                let _ = response.send(Ok(()));
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope { from, message, .. } = envelope;
        log::debug!("{} <- {}: {}", self.id, from, message.name());

        if from == REGISTRY_ID {
            self.handle_session_message(&message).await;
            self.emit(EmittedEvents::Session { from, message });
            return;
        }

        match self.links.get_mut(&from) {
            Some(link) => link.handle_message(message).await,
            None if message == SignalMessage::HostReady && self.side == Side::Candidate => {
                log::debug!("host_ready from {} before interview_start", from);
                self.early_ready.insert(from);
            }
            None => log::debug!("no link to {}, dropped {}", from, message.name()),
        }
    }

    async fn handle_session_message(&mut self, message: &SignalMessage) {
        match (message, self.side) {
            (SignalMessage::InterviewStart { host_id }, Side::Candidate) => {
                if let Err(e) = self.open_link(host_id.clone()).await {
                    log::error!("failed to open link to host {}: {}", host_id, e);
                }
            }
            (SignalMessage::CandidateSelected { candidate }, Side::Host) => {
                if let Err(e) = self.open_link(candidate.clone()).await {
                    log::error!("failed to open link to candidate {}: {}", candidate, e);
                }
            }
            (
                SignalMessage::InterviewEnded
                | SignalMessage::InterviewEndedHost
                | SignalMessage::SessionDeleted { .. },
                _,
            ) => self.close_all().await,
            _ => {}
        }
    }

    async fn handle_transport_event(&mut self, remote: PeerId, event: TransportEvent<MediaOf<F>>) {
        if matches!(event, TransportEvent::Failed) {
            if self.links.contains_key(&remote) {
                log::warn!("connection to {} failed", remote);
                self.emit(EmittedEvents::Disconnected {
                    peer: remote.clone(),
                });
                self.close_link(&remote).await;
            }
            return;
        }
        match self.links.get_mut(&remote) {
            Some(link) => link.on_transport_event(event).await,
            None => log::debug!("transport event for closed link {}", remote),
        }
    }

    async fn open_link(&mut self, remote: PeerId) -> Result<()> {
        if remote == self.id {
            bail!("cannot link {} to itself", remote);
        }
        if self.links.contains_key(&remote) {
            log::debug!("link to {} already open", remote);
            return Ok(());
        }

        let events = TransportEvents::new(remote.clone(), self.transport_tx.clone());
        let transport = self.factory.create(&remote, events).await?;
        self.next_generation += 1;
        let mut link = PeerLink::new(LinkArgs {
            local: self.id.clone(),
            remote: remote.clone(),
            side: self.side,
            generation: self.next_generation,
            transport,
            relay: self.relay.clone(),
            emitted_event_chan: self.emitted_event_chan.clone(),
            timer_chan: self.timer_tx.clone(),
            thresholds: Thresholds::from(&self.config),
            debounce_window: self.config.debounce_window,
        });

        if let Err(e) = link.open((self.capture)(), self.config.ready_timeout).await {
            link.close().await;
            return Err(e);
        }
        self.emit(EmittedEvents::LinkOpened {
            peer: remote.clone(),
        });
        let ready = self.early_ready.remove(&remote);
        if self.links.insert(remote.clone(), link).is_some() {
            log::warn!("overwriting link to {}", remote);
        }
        if ready {
            if let Some(link) = self.links.get_mut(&remote) {
                link.on_host_ready().await;
            }
        }
        Ok(())
    }

    async fn close_link(&mut self, remote: &str) {
        match self.links.remove(remote) {
            Some(mut link) => link.close().await,
            None => log::debug!("no link to {} to close", remote),
        }
    }

    async fn close_all(&mut self) {
        self.early_ready.clear();
        let mut links: Vec<_> = self.links.drain().map(|(_, link)| link).collect();
        join_all(links.iter_mut().map(|link| link.close())).await;
    }

    fn emit(&self, event: EmittedEvents<MediaOf<F>>) {
        if self.emitted_event_chan.send(event).is_err() {
            log::debug!("no listener for events of {}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackFactory;
    use super::*;
    use crate::classifier::ClassificationRule;
    use crate::internal::data_types::{StreamRole, TrackKind};
    use crate::registry::SessionRegistry;
    use crate::signaling::LocalRelay;
    use std::time::Duration;

    struct Peer {
        handle: EngineHandle,
        factory: LoopbackFactory,
        events: mpsc::UnboundedReceiver<EmittedEvents<()>>,
    }

    fn camera(prefix: &'static str) -> CaptureFn {
        Box::new(move || {
            let stream = format!("{}-cam", prefix);
            vec![
                LocalTrack::new(format!("{}-mic", prefix), stream.clone(), TrackKind::Audio, StreamRole::Camera),
                LocalTrack::new(format!("{}-video", prefix), stream, TrackKind::Video, StreamRole::Camera),
            ]
        })
    }

    async fn peer(relay: &LocalRelay, id: &str, side: Side, prefix: &'static str) -> Peer {
        let factory = LoopbackFactory::new();
        let (tx, events) = mpsc::unbounded_channel();
        let (handle, _join) = start(EngineArgs {
            id: id.into(),
            side,
            factory: factory.clone(),
            relay: Arc::new(relay.clone()),
            capture: camera(prefix),
            config: Config::default(),
            emitted_event_chan: tx,
        })
        .await
        .unwrap();
        Peer {
            handle,
            factory,
            events,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<EmittedEvents<()>>) -> Vec<EmittedEvents<()>> {
        let mut out = vec![];
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn streams(events: &[EmittedEvents<()>]) -> Vec<(String, StreamRole)> {
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

    #[tokio::test(start_paused = true)]
    async fn start_next_pairs_host_and_candidate() {
        let relay = LocalRelay::new();
        let registry = SessionRegistry::new(Arc::new(relay.clone()), &Config::default());
        let mut host = peer(&relay, "host", Side::Host, "h").await;
        let mut candidate = peer(&relay, "cand", Side::Candidate, "c").await;

        let code = registry.create_session(&"host".to_string()).await.unwrap();
        registry.join_session(&code, &"cand".to_string()).await.unwrap();
        registry.start_next(&code).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(host.handle.link_state("cand").await.unwrap(), Some(LinkState::Stable));
        assert_eq!(candidate.handle.link_state("host").await.unwrap(), Some(LinkState::Stable));
        // host_ready came well before the fallback, so exactly one offer
        let transport = candidate.factory.transport("host").unwrap();
        assert_eq!(transport.offers_created(), 1);

        let on_host = drain(&mut host.events);
        assert_eq!(streams(&on_host), vec![("c-cam".to_string(), StreamRole::Camera)]);
        assert!(on_host.iter().any(|e| matches!(
            e,
            EmittedEvents::Session { message: SignalMessage::CandidateSelected { .. }, .. }
        )));
        let on_candidate = drain(&mut candidate.events);
        assert_eq!(streams(&on_candidate), vec![("h-cam".to_string(), StreamRole::Camera)]);

        registry.end_interview(&code).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(host.handle.link_state("cand").await.unwrap(), None);
        assert_eq!(candidate.handle.link_state("host").await.unwrap(), None);
        assert!(candidate.factory.transport("host").unwrap().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn screen_share_is_labelled_then_retired() {
        let relay = LocalRelay::new();
        let host = peer(&relay, "host", Side::Host, "h").await;
        let mut candidate = peer(&relay, "cand", Side::Candidate, "c").await;

        candidate.handle.open("host").await.unwrap();
        host.handle.open("cand").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        drain(&mut candidate.events);

        let screen = LocalTrack::new("h-screen", "h-screen", TrackKind::Video, StreamRole::Screen);
        host.handle.start_screen_share("cand", screen.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let events = drain(&mut candidate.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, EmittedEvents::RemoteScreenShare { active: true, .. })));
        let classified: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EmittedEvents::StreamClassified { stream, .. } => Some(stream.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(classified.len(), 1);
        assert_eq!(classified[0].stream_id, "h-screen");
        assert_eq!(classified[0].role, StreamRole::Screen);
        assert_eq!(classified[0].rule, ClassificationRule::PendingSignal);

        host.handle.stop_screen_share("cand").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(screen.is_stopped());
        let events = drain(&mut candidate.events);
        assert!(events.iter().any(|e| matches!(
            e,
            EmittedEvents::StreamRetired { stream_id, role: StreamRole::Screen, .. } if stream_id == "h-screen"
        )));
        assert_eq!(
            candidate.handle.link_state("host").await.unwrap(),
            Some(LinkState::Stable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_offers_after_the_fallback_when_host_ready_is_lost() {
        let relay = LocalRelay::new();
        let mut candidate = peer(&relay, "cand", Side::Candidate, "c").await;
        candidate.handle.open("host").await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let transport = candidate.factory.transport("host").unwrap();
        assert_eq!(transport.offers_created(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(transport.offers_created(), 1);
        assert_eq!(
            candidate.handle.link_state("host").await.unwrap(),
            Some(LinkState::Negotiating)
        );
        drain(&mut candidate.events);
    }

    #[tokio::test(start_paused = true)]
    async fn host_opening_after_the_fallback_still_converges() {
        let relay = LocalRelay::new();
        let host = peer(&relay, "host", Side::Host, "h").await;
        let candidate = peer(&relay, "cand", Side::Candidate, "c").await;

        // the fallback offer reaches a host engine with no link to the candidate
        candidate.handle.open("host").await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(host.handle.link_state("cand").await.unwrap(), None);

        host.handle.open("cand").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(host.handle.link_state("cand").await.unwrap(), Some(LinkState::Stable));
        assert_eq!(candidate.handle.link_state("host").await.unwrap(), Some(LinkState::Stable));
        let transport = candidate.factory.transport("host").unwrap();
        assert_eq!(transport.offers_created(), 2);
        assert_eq!(transport.rollbacks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn early_host_ready_is_remembered() {
        let relay = LocalRelay::new();
        let candidate = peer(&relay, "cand", Side::Candidate, "c").await;
        relay
            .send(Envelope::new("host", "cand", SignalMessage::HostReady))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        candidate.handle.open("host").await.unwrap();
        let transport = candidate.factory.transport("host").unwrap();
        assert_eq!(transport.offers_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ice_failure_disconnects_the_link() {
        let relay = LocalRelay::new();
        let mut host = peer(&relay, "host", Side::Host, "h").await;
        host.handle.open("cand").await.unwrap();

        host.factory.transport("cand").unwrap().simulate_failure();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(host.handle.link_state("cand").await.unwrap(), None);
        let events = drain(&mut host.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, EmittedEvents::Disconnected { peer } if peer == "cand")));
        assert!(host.factory.transport("cand").unwrap().is_closed());
    }

    #[tokio::test]
    async fn shutdown_releases_the_subscription() {
        let relay = LocalRelay::new();
        let host = peer(&relay, "host", Side::Host, "h").await;
        assert!(relay.is_subscribed("host"));
        host.handle.shutdown().await.unwrap();
        assert!(!relay.is_subscribed("host"));
        assert!(host.handle.open("cand").await.is_err());
    }
}
