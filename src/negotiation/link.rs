use anyhow::{bail, Result};
use derive_more::Display;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use super::transport::{MediaTransport, SignalingState, TransportEvent};
use crate::classifier::{StreamClassifier, Thresholds};
use crate::internal::data_types::{LocalTrack, PeerId, Role, Side, StreamRole};
use crate::internal::events::EmittedEvents;
use crate::signaling::{Envelope, Relay, SessionDescription, SignalMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LinkState {
    /// waiting for the first exchange
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "negotiating")]
    Negotiating,
    #[display(fmt = "stable")]
    Stable,
    #[display(fmt = "closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTimer {
    /// candidate gives up waiting for host_ready
    ReadyFallback,
    /// debounce window for arriving tracks
    Debounce,
}

/// Delivered to the engine when a link timer expires. `generation` tells a
/// timer of a torn down link apart from one of its replacement.
#[derive(Debug, Clone)]
pub struct TimerFired {
    pub remote: PeerId,
    pub generation: u64,
    pub kind: LinkTimer,
}

pub struct LinkArgs<T: MediaTransport> {
    pub local: PeerId,
    pub remote: PeerId,
    pub side: Side,
    pub generation: u64,
    pub transport: T,
    pub relay: Arc<dyn Relay>,
    pub emitted_event_chan: mpsc::UnboundedSender<EmittedEvents<T::Media>>,
    pub timer_chan: mpsc::UnboundedSender<TimerFired>,
    pub thresholds: Thresholds,
    pub debounce_window: Duration,
}

/// One negotiated connection between the local peer and one remote peer.
///
/// Glare is resolved with fixed roles: the host side is polite and rolls back
/// its own offer when one collides, the candidate side ignores colliding
/// offers. Every negotiation trigger goes through [`PeerLink::negotiate`].
pub struct PeerLink<T: MediaTransport> {
    local: PeerId,
    remote: PeerId,
    side: Side,
    role: Role,
    generation: u64,
    transport: T,
    relay: Arc<dyn Relay>,
    emitted_event_chan: mpsc::UnboundedSender<EmittedEvents<T::Media>>,
    timer_chan: mpsc::UnboundedSender<TimerFired>,
    debounce_window: Duration,

    making_offer: bool,
    /// set once the initial exchange may start
    armed: bool,
    /// a remote description has been applied at least once
    exchanged: bool,
    renegotiate_pending: bool,
    /// the last remote offer was dropped, its candidates will not apply
    ignoring_offer: bool,
    pending_ice: VecDeque<RTCIceCandidateInit>,

    local_tracks: Vec<LocalTrack>,
    classifier: StreamClassifier<T::Media>,
    fallback: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    closed: bool,
}

impl<T: MediaTransport> PeerLink<T> {
    pub fn new(args: LinkArgs<T>) -> Self {
        Self {
            role: args.side.role(),
            local: args.local,
            remote: args.remote,
            side: args.side,
            generation: args.generation,
            transport: args.transport,
            relay: args.relay,
            emitted_event_chan: args.emitted_event_chan,
            timer_chan: args.timer_chan,
            debounce_window: args.debounce_window,
            making_offer: false,
            armed: false,
            exchanged: false,
            renegotiate_pending: false,
            ignoring_offer: false,
            pending_ice: VecDeque::new(),
            local_tracks: Vec::new(),
            classifier: StreamClassifier::new(args.thresholds),
            fallback: None,
            debounce: None,
            closed: false,
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn state(&self) -> LinkState {
        if self.closed {
            return LinkState::Closed;
        }
        match self.transport.signaling_state() {
            SignalingState::Closed => LinkState::Closed,
            SignalingState::Stable if self.making_offer => LinkState::Negotiating,
            SignalingState::Stable if self.armed => LinkState::Stable,
            SignalingState::Stable => LinkState::Idle,
            _ => LinkState::Negotiating,
        }
    }

    pub fn pending_ice(&self) -> usize {
        self.pending_ice.len()
    }

    /// Attaches the local tracks. The host then announces it is ready; the
    /// candidate starts its fallback timer and waits for that announcement.
    pub async fn open(&mut self, tracks: Vec<LocalTrack>, ready_timeout: Duration) -> Result<()> {
        for track in &tracks {
            self.transport.add_track(track).await?;
        }
        self.local_tracks = tracks;

        match self.side {
            Side::Host => self.signal(SignalMessage::HostReady).await,
            Side::Candidate => {
                let timer = self.arm_timer(LinkTimer::ReadyFallback, ready_timeout);
                self.fallback = Some(timer);
            }
        }
        log::info!(
            "link to {} opened as {} ({} local tracks)",
            self.remote,
            self.role,
            self.local_tracks.len()
        );
        Ok(())
    }

    /// The single entry point for every negotiation trigger.
    pub async fn negotiate(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        if !self.armed {
            log::debug!("{}: {} before first exchange, absorbed", self.remote, reason);
            return;
        }
        let state = self.transport.signaling_state();
        if self.making_offer || state != SignalingState::Stable {
            log::debug!("{}: {} while {}, deferred", self.remote, reason, state);
            self.renegotiate_pending = true;
            return;
        }

        self.renegotiate_pending = false;
        self.making_offer = true;
        let result = self.send_offer().await;
        self.making_offer = false;

        if let Err(e) = result {
            log::error!("failed to send offer to {}: {}", self.remote, e);
            if self.transport.signaling_state() == SignalingState::HaveLocalOffer {
                if let Err(e) = self.transport.rollback().await {
                    log::error!("failed to roll back unsent offer to {}: {}", self.remote, e);
                }
            }
        } else {
            log::debug!("{}: offer sent ({})", self.remote, reason);
        }
    }

    async fn send_offer(&mut self) -> Result<()> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.relay
            .send(self.envelope(SignalMessage::WebrtcOffer { sdp: offer }))
            .await
    }

    async fn send_answer(&mut self) -> Result<()> {
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.relay
            .send(self.envelope(SignalMessage::WebrtcAnswer { sdp: answer }))
            .await
    }

    pub async fn handle_offer(&mut self, offer: SessionDescription) {
        if self.closed {
            return;
        }
        let state = self.transport.signaling_state();
        let collision = self.making_offer || state != SignalingState::Stable;

        if collision {
            match self.role {
                Role::Impolite => {
                    log::debug!("{}: ignoring colliding offer in {}", self.remote, state);
                    self.ignoring_offer = true;
                    return;
                }
                Role::Polite => {
                    log::debug!("{}: offer collision in {}, rolling back", self.remote, state);
                    if let Err(e) = self.transport.rollback().await {
                        log::error!("failed to roll back for {}: {}", self.remote, e);
                        return;
                    }
                    if state == SignalingState::HaveLocalOffer {
                        self.renegotiate_pending = true;
                    }
                }
            }
        }
        self.ignoring_offer = false;

        if let Err(e) = self.transport.set_remote_description(offer).await {
            log::error!("failed to set remote offer from {}: {}", self.remote, e);
            return;
        }
        // the host's first exchange starts here
        self.armed = true;
        self.exchanged = true;
        self.flush_pending_ice().await;

        if let Err(e) = self.send_answer().await {
            log::error!("failed to answer {}: {}", self.remote, e);
            return;
        }
        self.replay_pending().await;
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) {
        if self.closed {
            return;
        }
        let state = self.transport.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            log::warn!("{}: stale answer in {}, dropped", self.remote, state);
            return;
        }
        if let Err(e) = self.transport.set_remote_description(answer).await {
            log::error!("failed to set remote answer from {}: {}", self.remote, e);
            return;
        }
        self.exchanged = true;
        self.flush_pending_ice().await;
        self.replay_pending().await;
    }

    /// Applies a remote candidate, or queues it until a remote description
    /// exists.
    pub async fn handle_remote_ice(&mut self, candidate: RTCIceCandidateInit) {
        if self.closed {
            return;
        }
        if !self.transport.has_remote_description().await {
            self.pending_ice.push_back(candidate);
            log::debug!(
                "{}: queued remote candidate ({} pending)",
                self.remote,
                self.pending_ice.len()
            );
            return;
        }
        self.apply_ice(candidate).await;
    }

    async fn apply_ice(&mut self, candidate: RTCIceCandidateInit) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            if self.ignoring_offer {
                log::debug!("{}: candidate of ignored offer rejected: {}", self.remote, e);
            } else {
                log::warn!("failed to add ice candidate from {}: {}", self.remote, e);
            }
        }
    }

    async fn flush_pending_ice(&mut self) {
        while let Some(candidate) = self.pending_ice.pop_front() {
            self.apply_ice(candidate).await;
        }
    }

    async fn replay_pending(&mut self) {
        if self.renegotiate_pending && self.transport.signaling_state() == SignalingState::Stable {
            self.negotiate("deferred trigger").await;
        }
    }

    pub async fn on_host_ready(&mut self) {
        if self.side != Side::Candidate {
            log::warn!("unexpected host_ready from {}", self.remote);
            return;
        }
        if let Some(timer) = self.fallback.take() {
            timer.abort();
        }
        if !self.armed {
            self.armed = true;
            self.negotiate("host ready").await;
            return;
        }
        if self.exchanged || self.making_offer {
            log::debug!("{}: host_ready after exchange started", self.remote);
            return;
        }

        // our first offer went unanswered, most likely sent before the host
        // had a link to receive it
        log::info!("{}: host_ready with no answer yet, offering again", self.remote);
        if self.transport.signaling_state() == SignalingState::HaveLocalOffer {
            if let Err(e) = self.transport.rollback().await {
                log::error!("failed to roll back unanswered offer to {}: {}", self.remote, e);
                return;
            }
        }
        self.negotiate("host ready again").await;
    }

    pub async fn on_timer(&mut self, fired: TimerFired) {
        if self.closed || fired.generation != self.generation {
            log::debug!("{}: stale {:?} timer", self.remote, fired.kind);
            return;
        }
        match fired.kind {
            LinkTimer::ReadyFallback => {
                self.fallback = None;
                if !self.armed {
                    log::warn!("no host_ready from {}, offering anyway", self.remote);
                    self.armed = true;
                    self.negotiate("ready fallback").await;
                }
            }
            LinkTimer::Debounce => {
                self.debounce = None;
                self.flush_streams();
            }
        }
    }

    pub async fn on_transport_event(&mut self, event: TransportEvent<T::Media>) {
        if self.closed {
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.signal(SignalMessage::WebrtcIce { candidate }).await;
            }
            TransportEvent::Track(track) => {
                log::info!(
                    "{}: remote {} track {} on stream {}",
                    self.remote,
                    track.descriptor.kind,
                    track.descriptor.id,
                    track.stream_id
                );
                if self.classifier.ingest(track, Instant::now()) {
                    let timer = self.arm_timer(LinkTimer::Debounce, self.debounce_window);
                    if let Some(old) = self.debounce.replace(timer) {
                        old.abort();
                    }
                }
            }
            TransportEvent::TrackEnded {
                stream_id,
                track_id,
            } => {
                if let Some(stream) = self.classifier.track_ended(&stream_id, &track_id) {
                    self.emit(EmittedEvents::StreamRetired {
                        peer: self.remote.clone(),
                        stream_id: stream.stream_id,
                        role: stream.role,
                    });
                }
            }
            TransportEvent::NegotiationNeeded => self.negotiate("negotiation needed").await,
            TransportEvent::Failed => {
                log::warn!("transport to {} failed", self.remote);
            }
        }
    }

    /// Routes one peer-to-peer message from the remote side.
    pub async fn handle_message(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::HostReady => self.on_host_ready().await,
            SignalMessage::WebrtcOffer { sdp } => self.handle_offer(sdp).await,
            SignalMessage::WebrtcAnswer { sdp } => self.handle_answer(sdp).await,
            SignalMessage::WebrtcIce { candidate } => self.handle_remote_ice(candidate).await,
            SignalMessage::ScreenShareStarted | SignalMessage::CandidateStartedScreen => {
                self.handle_screen_signal(true)
            }
            SignalMessage::ScreenShareStopped | SignalMessage::CandidateStoppedScreen => {
                self.handle_screen_signal(false)
            }
            other => log::warn!("{}: {} is not link traffic", self.remote, other.name()),
        }
    }

    fn handle_screen_signal(&mut self, active: bool) {
        if self.closed {
            return;
        }
        if active {
            self.classifier.screen_share_started();
        } else {
            for stream in self.classifier.screen_share_stopped() {
                self.emit(EmittedEvents::StreamRetired {
                    peer: self.remote.clone(),
                    stream_id: stream.stream_id,
                    role: stream.role,
                });
            }
        }
        self.emit(EmittedEvents::RemoteScreenShare {
            peer: self.remote.clone(),
            active,
        });
    }

    /// Adds a screen track. The out-of-band signal goes out before the offer
    /// so the remote classifier has it when the tracks arrive.
    pub async fn start_screen_share(&mut self, track: LocalTrack) -> Result<()> {
        if self.closed {
            bail!("link to {} is closed", self.remote);
        }
        self.transport.add_track(&track).await?;
        self.local_tracks.push(track);

        let signal = match self.side {
            Side::Host => SignalMessage::ScreenShareStarted,
            Side::Candidate => SignalMessage::CandidateStartedScreen,
        };
        self.signal(signal).await;
        self.negotiate("screen share started").await;
        Ok(())
    }

    pub async fn stop_screen_share(&mut self) -> Result<()> {
        if self.closed {
            bail!("link to {} is closed", self.remote);
        }
        let (screens, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.local_tracks)
            .into_iter()
            .partition(|t| t.role == StreamRole::Screen);
        self.local_tracks = rest;
        if screens.is_empty() {
            log::debug!("{}: no screen share to stop", self.remote);
            return Ok(());
        }

        for track in &screens {
            track.stop();
            self.transport.remove_track(&track.id).await?;
        }
        let signal = match self.side {
            Side::Host => SignalMessage::ScreenShareStopped,
            Side::Candidate => SignalMessage::CandidateStoppedScreen,
        };
        self.signal(signal).await;
        self.negotiate("screen share stopped").await;
        Ok(())
    }

    /// Idempotent teardown.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for timer in [self.fallback.take(), self.debounce.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        for track in self.local_tracks.drain(..) {
            track.stop();
        }
        if let Err(e) = self.transport.close().await {
            log::error!("failed to close transport to {}: {}", self.remote, e);
        }
        self.pending_ice.clear();
        self.classifier.clear();
        self.making_offer = false;
        self.renegotiate_pending = false;

        self.emit(EmittedEvents::LinkClosed {
            peer: self.remote.clone(),
        });
        log::info!("link to {} closed", self.remote);
    }

    fn flush_streams(&mut self) {
        for stream in self.classifier.flush() {
            self.emit(EmittedEvents::StreamClassified {
                peer: self.remote.clone(),
                stream,
            });
        }
    }

    fn arm_timer(&self, kind: LinkTimer, after: Duration) -> JoinHandle<()> {
        let tx = self.timer_chan.clone();
        let fired = TimerFired {
            remote: self.remote.clone(),
            generation: self.generation,
            kind,
        };
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Err(e) = tx.send(fired) {
                log::debug!("timer fired after engine shutdown: {:?}", e.0.kind);
            }
        })
    }

    fn envelope(&self, message: SignalMessage) -> Envelope {
        Envelope::new(self.local.clone(), self.remote.clone(), message)
    }

    async fn signal(&self, message: SignalMessage) {
        let name = message.name();
        if let Err(e) = self.relay.send(self.envelope(message)).await {
            log::error!("failed to send {} to {}: {}", name, self.remote, e);
        }
    }

    fn emit(&self, event: EmittedEvents<T::Media>) {
        if self.emitted_event_chan.send(event).is_err() {
            log::debug!("no listener for events of link {}", self.remote);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassificationRule;
    use crate::internal::data_types::TrackKind;
    use crate::negotiation::loopback::LoopbackTransport;
    use crate::negotiation::transport::TransportEvents;
    use crate::signaling::{LocalRelay, Subscription};

    const WINDOW: Duration = Duration::from_millis(200);

    struct End {
        link: PeerLink<LoopbackTransport>,
        transport: LoopbackTransport,
        inbox: Subscription,
        events: mpsc::UnboundedReceiver<EmittedEvents<()>>,
        timers: mpsc::UnboundedReceiver<TimerFired>,
        transport_events: mpsc::UnboundedReceiver<(PeerId, TransportEvent<()>)>,
    }

    impl End {
        async fn new(relay: &LocalRelay, local: &str, remote: &str, side: Side) -> Self {
            let inbox = relay.subscribe(&local.to_string()).await.unwrap();
            let (event_tx, events) = mpsc::unbounded_channel();
            let (timer_tx, timers) = mpsc::unbounded_channel();
            let (transport_tx, transport_events) = mpsc::unbounded_channel();
            let transport = LoopbackTransport::new(TransportEvents::new(remote.into(), transport_tx));
            let link = PeerLink::new(LinkArgs {
                local: local.into(),
                remote: remote.into(),
                side,
                generation: 1,
                transport: transport.clone(),
                relay: Arc::new(relay.clone()),
                emitted_event_chan: event_tx,
                timer_chan: timer_tx,
                thresholds: Thresholds::default(),
                debounce_window: WINDOW,
            });
            Self {
                link,
                transport,
                inbox,
                events,
                timers,
                transport_events,
            }
        }

        /// handles whatever is queued locally; true if anything was
        async fn step(&mut self) -> bool {
            let mut progressed = false;
            while let Ok((_, event)) = self.transport_events.try_recv() {
                self.link.on_transport_event(event).await;
                progressed = true;
            }
            while let Ok(fired) = self.timers.try_recv() {
                self.link.on_timer(fired).await;
                progressed = true;
            }
            if let Some(envelope) = self.inbox.try_recv() {
                self.link.handle_message(envelope.message).await;
                progressed = true;
            }
            progressed
        }

        fn drain_events(&mut self) -> Vec<EmittedEvents<()>> {
            let mut out = vec![];
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn camera(prefix: &str) -> Vec<LocalTrack> {
        let stream = format!("{}-cam", prefix);
        vec![
            LocalTrack::new(format!("{}-mic", prefix), stream.clone(), TrackKind::Audio, StreamRole::Camera),
            LocalTrack::new(format!("{}-video", prefix), stream, TrackKind::Video, StreamRole::Camera),
        ]
    }

    fn screen(prefix: &str) -> LocalTrack {
        LocalTrack::new(
            format!("{}-screen", prefix),
            format!("{}-screen", prefix),
            TrackKind::Video,
            StreamRole::Screen,
        )
    }

    fn ice(n: u32) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:{} 1 udp 1 10.0.0.{} 9 typ host", n, n),
            ..Default::default()
        }
    }

    async fn pump(host: &mut End, candidate: &mut End) {
        loop {
            let a = host.step().await;
            let b = candidate.step().await;
            if !a && !b {
                break;
            }
        }
    }

    /// pumps, lets the debounce window pass, pumps again
    async fn settle(host: &mut End, candidate: &mut End) {
        pump(host, candidate).await;
        tokio::time::sleep(WINDOW * 2).await;
        pump(host, candidate).await;
    }

    async fn pair() -> (End, End) {
        let relay = LocalRelay::new();
        let mut host = End::new(&relay, "host", "cand", Side::Host).await;
        let mut candidate = End::new(&relay, "cand", "host", Side::Candidate).await;
        host.link.open(camera("h"), Duration::from_secs(3)).await.unwrap();
        candidate.link.open(camera("c"), Duration::from_secs(3)).await.unwrap();
        (host, candidate)
    }

    fn classified(events: &[EmittedEvents<()>]) -> Vec<(String, StreamRole, ClassificationRule)> {
        events
            .iter()
            .filter_map(|e| match e {
                EmittedEvents::StreamClassified { stream, .. } => {
                    Some((stream.stream_id.clone(), stream.role, stream.rule))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn host_ready_starts_the_candidate_offer() {
        let (mut host, mut candidate) = pair().await;
        assert_eq!(candidate.link.state(), LinkState::Idle);

        settle(&mut host, &mut candidate).await;

        assert_eq!(candidate.transport.offers_created(), 1);
        assert_eq!(host.transport.answers_created(), 1);
        assert_eq!(host.transport.offers_created(), 0);
        assert_eq!(host.link.state(), LinkState::Stable);
        assert_eq!(candidate.link.state(), LinkState::Stable);

        let seen = classified(&host.drain_events());
        assert_eq!(seen, vec![("c-cam".to_string(), StreamRole::Camera, ClassificationRule::Fallback)]);
        let seen = classified(&candidate.drain_events());
        assert_eq!(seen, vec![("h-cam".to_string(), StreamRole::Camera, ClassificationRule::Fallback)]);
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_screen_shares_converge() {
        let (mut host, mut candidate) = pair().await;
        settle(&mut host, &mut candidate).await;
        host.drain_events();
        candidate.drain_events();

        // both sides offer before either sees the other's offer
        host.link.start_screen_share(screen("h")).await.unwrap();
        candidate.link.start_screen_share(screen("c")).await.unwrap();
        assert_eq!(host.transport.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(candidate.transport.signaling_state(), SignalingState::HaveLocalOffer);

        settle(&mut host, &mut candidate).await;

        assert_eq!(host.transport.signaling_state(), SignalingState::Stable);
        assert_eq!(candidate.transport.signaling_state(), SignalingState::Stable);
        // only the polite side gave up its offer
        assert_eq!(host.transport.rollbacks(), 1);
        assert_eq!(candidate.transport.rollbacks(), 0);
        assert!(host.transport.remote_track_ids().contains(&"c-screen".to_string()));
        assert!(candidate.transport.remote_track_ids().contains(&"h-screen".to_string()));

        let on_host = classified(&host.drain_events());
        assert_eq!(
            on_host,
            vec![("c-screen".to_string(), StreamRole::Screen, ClassificationRule::PendingSignal)]
        );
        let on_candidate = classified(&candidate.drain_events());
        assert_eq!(
            on_candidate,
            vec![("h-screen".to_string(), StreamRole::Screen, ClassificationRule::PendingSignal)]
        );
    }

    #[tokio::test]
    async fn early_candidates_apply_once_in_order() {
        let relay = LocalRelay::new();
        let mut host = End::new(&relay, "host", "cand", Side::Host).await;
        let mut candidate = End::new(&relay, "cand", "host", Side::Candidate).await;
        host.link.open(camera("h"), Duration::from_secs(3)).await.unwrap();

        for n in 1..=3 {
            host.link.handle_remote_ice(ice(n)).await;
        }
        assert_eq!(host.link.pending_ice(), 3);
        assert!(host.transport.applied_candidates().is_empty());

        candidate.link.open(camera("c"), Duration::from_secs(3)).await.unwrap();
        candidate.link.on_host_ready().await;
        let offer = next_offer(&mut host).expect("candidate offered");
        host.link.handle_offer(offer).await;
        host.link.handle_remote_ice(ice(4)).await;

        assert_eq!(host.link.pending_ice(), 0);
        let applied = host.transport.applied_candidates();
        assert_eq!(applied, vec![ice(1).candidate, ice(2).candidate, ice(3).candidate, ice(4).candidate]);
    }

    fn next_offer(end: &mut End) -> Option<SessionDescription> {
        while let Some(envelope) = end.inbox.try_recv() {
            if let SignalMessage::WebrtcOffer { sdp } = envelope.message {
                return Some(sdp);
            }
        }
        None
    }

    #[tokio::test]
    async fn failed_offer_clears_the_flag() {
        let relay = LocalRelay::new();
        let mut candidate = End::new(&relay, "cand", "host", Side::Candidate).await;
        candidate.link.open(camera("c"), Duration::from_secs(3)).await.unwrap();
        candidate.transport.fail_next_offer();

        candidate.link.on_host_ready().await;
        assert!(!candidate.link.making_offer);
        assert_eq!(candidate.transport.signaling_state(), SignalingState::Stable);

        candidate.link.negotiate("retry").await;
        assert_eq!(candidate.transport.offers_created(), 1);
        assert_eq!(candidate.transport.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn triggers_before_arming_are_absorbed() {
        let relay = LocalRelay::new();
        let mut candidate = End::new(&relay, "cand", "host", Side::Candidate).await;
        candidate.link.open(camera("c"), Duration::from_secs(3)).await.unwrap();

        candidate.link.negotiate("track added").await;
        candidate.transport.fire_negotiation_needed();
        candidate.step().await;
        assert_eq!(candidate.transport.offers_created(), 0);

        candidate.link.on_host_ready().await;
        assert_eq!(candidate.transport.offers_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_during_negotiation_collapse_into_one_offer() {
        let (mut host, mut candidate) = pair().await;
        settle(&mut host, &mut candidate).await;
        assert_eq!(candidate.transport.offers_created(), 1);

        candidate.link.negotiate("first").await;
        assert_eq!(candidate.link.state(), LinkState::Negotiating);
        for reason in ["second", "third", "fourth"] {
            candidate.link.negotiate(reason).await;
        }
        assert_eq!(candidate.transport.offers_created(), 2);

        settle(&mut host, &mut candidate).await;
        assert_eq!(candidate.transport.offers_created(), 3);
        assert_eq!(candidate.link.state(), LinkState::Stable);
    }

    #[tokio::test]
    async fn impolite_side_drops_colliding_offers() {
        let relay = LocalRelay::new();
        let mut host = End::new(&relay, "host", "cand", Side::Host).await;
        let mut candidate = End::new(&relay, "cand", "host", Side::Candidate).await;
        host.link.open(vec![], Duration::from_secs(3)).await.unwrap();
        candidate.link.open(camera("c"), Duration::from_secs(3)).await.unwrap();
        candidate.link.on_host_ready().await;
        assert_eq!(candidate.transport.signaling_state(), SignalingState::HaveLocalOffer);

        let foreign = host.transport.create_offer().await.unwrap();
        candidate.link.handle_offer(foreign).await;

        assert_eq!(candidate.transport.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(candidate.transport.rollbacks(), 0);
        assert_eq!(candidate.transport.answers_created(), 0);
    }

    #[tokio::test]
    async fn stale_answer_is_dropped() {
        let relay = LocalRelay::new();
        let mut host = End::new(&relay, "host", "cand", Side::Host).await;
        host.link.open(camera("h"), Duration::from_secs(3)).await.unwrap();

        host.link
            .handle_answer(SessionDescription::answer(r#"{"version":9,"tracks":[]}"#))
            .await;
        assert_eq!(host.transport.signaling_state(), SignalingState::Stable);
        assert!(!host.transport.has_remote_description().await);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_offers_are_answered_and_the_extra_answer_dropped() {
        let (mut host, mut candidate) = pair().await;
        settle(&mut host, &mut candidate).await;
        assert_eq!(host.transport.answers_created(), 1);

        // the candidate's offer reaches the polite host twice
        candidate.link.negotiate("renegotiate").await;
        let offer = next_offer(&mut host).expect("candidate offered");
        host.link.handle_offer(offer.clone()).await;
        host.link.handle_offer(offer).await;
        assert_eq!(host.transport.answers_created(), 3);
        settle(&mut host, &mut candidate).await;
        assert_eq!(host.link.state(), LinkState::Stable);
        assert_eq!(candidate.link.state(), LinkState::Stable);
        assert_eq!(candidate.transport.offers_created(), 2);

        // and the host's offer reaches the impolite candidate twice
        host.link.negotiate("renegotiate").await;
        let offer = next_offer(&mut candidate).expect("host offered");
        candidate.link.handle_offer(offer.clone()).await;
        candidate.link.handle_offer(offer).await;
        assert_eq!(candidate.transport.answers_created(), 2);
        settle(&mut host, &mut candidate).await;
        assert_eq!(host.link.state(), LinkState::Stable);
        assert_eq!(candidate.link.state(), LinkState::Stable);
        assert_eq!(host.transport.offers_created(), 1);
        assert_eq!(host.transport.rollbacks(), 0);
        assert_eq!(candidate.transport.rollbacks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_falls_back_without_host_ready() {
        let relay = LocalRelay::new();
        let mut candidate = End::new(&relay, "cand", "host", Side::Candidate).await;
        candidate.link.open(camera("c"), Duration::from_millis(3000)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(!candidate.step().await);
        assert_eq!(candidate.transport.offers_created(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(candidate.step().await);
        assert_eq!(candidate.transport.offers_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_host_ready_replaces_an_unanswered_offer() {
        let relay = LocalRelay::new();
        let mut candidate = End::new(&relay, "cand", "host", Side::Candidate).await;
        candidate.link.open(camera("c"), Duration::from_millis(3000)).await.unwrap();

        // the fallback offer goes out while nobody listens for the host
        tokio::time::sleep(Duration::from_millis(3500)).await;
        candidate.step().await;
        assert_eq!(candidate.transport.offers_created(), 1);
        assert_eq!(candidate.link.state(), LinkState::Negotiating);

        let mut host = End::new(&relay, "host", "cand", Side::Host).await;
        host.link.open(camera("h"), Duration::from_secs(3)).await.unwrap();
        settle(&mut host, &mut candidate).await;

        assert_eq!(candidate.transport.offers_created(), 2);
        assert_eq!(candidate.transport.rollbacks(), 1);
        assert_eq!(host.transport.answers_created(), 1);
        assert_eq!(candidate.link.state(), LinkState::Stable);
        assert_eq!(host.link.state(), LinkState::Stable);

        // once answered, a repeated host_ready changes nothing
        candidate.link.on_host_ready().await;
        assert_eq!(candidate.transport.offers_created(), 2);
        assert_eq!(candidate.link.state(), LinkState::Stable);
    }

    #[tokio::test]
    async fn timers_of_an_older_link_are_ignored() {
        let relay = LocalRelay::new();
        let mut candidate = End::new(&relay, "cand", "host", Side::Candidate).await;
        candidate.link.open(camera("c"), Duration::from_secs(3)).await.unwrap();
        candidate
            .link
            .on_timer(TimerFired {
                remote: "host".into(),
                generation: 0,
                kind: LinkTimer::ReadyFallback,
            })
            .await;
        assert_eq!(candidate.transport.offers_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_a_screen_share_retires_it_remotely() {
        let (mut host, mut candidate) = pair().await;
        settle(&mut host, &mut candidate).await;
        candidate.link.start_screen_share(screen("c")).await.unwrap();
        settle(&mut host, &mut candidate).await;
        host.drain_events();

        candidate.link.stop_screen_share().await.unwrap();
        settle(&mut host, &mut candidate).await;

        let events = host.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EmittedEvents::StreamRetired { stream_id, role: StreamRole::Screen, .. } if stream_id == "c-screen"
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, EmittedEvents::RemoteScreenShare { active: false, .. })));
        assert!(!host.transport.remote_track_ids().contains(&"c-screen".to_string()));
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let relay = LocalRelay::new();
        let mut host = End::new(&relay, "host", "cand", Side::Host).await;
        let tracks = camera("h");
        host.link.open(tracks.clone(), Duration::from_secs(3)).await.unwrap();

        host.link.close().await;
        host.link.close().await;

        assert!(tracks.iter().all(|t| t.is_stopped()));
        assert!(host.transport.is_closed());
        assert_eq!(host.link.state(), LinkState::Closed);
        let closed = host
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, EmittedEvents::LinkClosed { .. }))
            .count();
        assert_eq!(closed, 1);

        host.link
            .handle_offer(SessionDescription::offer(r#"{"version":1,"tracks":[]}"#))
            .await;
        assert_eq!(host.transport.answers_created(), 0);
    }
}
