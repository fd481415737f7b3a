//! Session registry: session codes, the candidate queue and the single active
//! interview per session.
//!
//! Every mutation runs under one lock and emits its notifications before the
//! lock is released, so the snapshots peers receive follow mutation order.

use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{RegistryError, RegistryResult};
use crate::internal::data_types::PeerId;
use crate::signaling::{Envelope, Relay, Reply, SignalMessage, REGISTRY_ID};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

type CodeSource = Box<dyn Fn(usize) -> String + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub code: String,
    pub host_id: PeerId,
    pub queue: VecDeque<PeerId>,
    pub active_candidate: Option<PeerId>,
}

impl Session {
    fn new(code: String, host_id: PeerId) -> Self {
        Self {
            code,
            host_id,
            queue: VecDeque::new(),
            active_candidate: None,
        }
    }

    /// 1-based
    pub fn position_of(&self, candidate: &str) -> Option<usize> {
        self.queue.iter().position(|c| c == candidate).map(|i| i + 1)
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Session>,
    /// candidate -> code of the session it is queued in or active in
    memberships: HashMap<PeerId, String>,
}

pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    relay: Arc<dyn Relay>,
    code_length: usize,
    code_attempts: usize,
    code_source: CodeSource,
}

/// Uppercases and drops all whitespace, so `"7xq k2a "` finds `7XQK2A`.
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn random_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

impl SessionRegistry {
    pub fn new(relay: Arc<dyn Relay>, config: &Config) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            relay,
            code_length: config.code_length,
            code_attempts: config.code_attempts.max(1),
            code_source: Box::new(random_code),
        }
    }

    /// replaces the random code generator, mostly for tests
    pub fn with_code_source(
        mut self,
        source: impl Fn(usize) -> String + Send + Sync + 'static,
    ) -> Self {
        self.code_source = Box::new(source);
        self
    }

    pub async fn create_session(&self, host: &PeerId) -> RegistryResult<String> {
        let mut state = self.state.lock().await;

        let mut code = None;
        for attempt in 1..=self.code_attempts {
            let candidate = normalize_code(&(self.code_source)(self.code_length));
            if !candidate.is_empty() && !state.sessions.contains_key(&candidate) {
                code = Some(candidate);
                break;
            }
            log::debug!("session code collision on attempt {}", attempt);
        }
        let code = code.ok_or(RegistryError::CodeSpaceExhausted(self.code_attempts))?;

        state
            .sessions
            .insert(code.clone(), Session::new(code.clone(), host.clone()));
        log::info!("host {} created session {}", host, code);

        self.notify(host, SignalMessage::SessionCreated { code: code.clone() })
            .await;
        Ok(code)
    }

    /// Appends the candidate to the queue and returns its 1-based position.
    /// Joining twice returns the existing position.
    pub async fn join_session(&self, code: &str, candidate: &PeerId) -> RegistryResult<usize> {
        let code = normalize_code(code);
        let mut state = self.state.lock().await;

        match state.sessions.get(&code) {
            None => return Err(RegistryError::NotFound(code)),
            Some(session) if &session.host_id == candidate => {
                return Err(RegistryError::OwnSession(code))
            }
            Some(_) => {}
        }

        if let Some(current) = state.memberships.get(candidate).cloned() {
            let session = state.sessions.get(&current);
            if session.and_then(|s| s.active_candidate.as_ref()) == Some(candidate) {
                return Err(RegistryError::InterviewInProgress(current));
            }
            if current == code {
                if let Some(position) = session.and_then(|s| s.position_of(candidate)) {
                    log::debug!("{} already queued in {} at {}", candidate, code, position);
                    return Ok(position);
                }
            } else {
                log::info!("{} moves from session {} to {}", candidate, current, code);
                if let Some(old) = state.sessions.get_mut(&current) {
                    old.queue.retain(|c| c != candidate);
                    let old = old.clone();
                    self.broadcast_queue(&old).await;
                }
            }
        }

        let session = match state.sessions.get_mut(&code) {
            Some(session) => session,
            None => return Err(RegistryError::NotFound(code)),
        };
        session.queue.push_back(candidate.clone());
        let position = session.queue.len();
        let snapshot = session.clone();
        state.memberships.insert(candidate.clone(), code.clone());
        log::info!("{} joined session {} at position {}", candidate, code, position);

        self.broadcast_queue(&snapshot).await;
        Ok(position)
    }

    /// Moves the head of the queue into the interview.
    pub async fn start_next(&self, code: &str) -> RegistryResult<PeerId> {
        let code = normalize_code(code);
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&code)
            .ok_or_else(|| RegistryError::NotFound(code.clone()))?;

        if session.active_candidate.is_some() {
            return Err(RegistryError::InterviewInProgress(code));
        }
        let candidate = match session.queue.pop_front() {
            Some(candidate) => candidate,
            None => {
                log::info!("start_next on session {} with an empty queue", code);
                return Err(RegistryError::EmptyQueue(code));
            }
        };
        session.active_candidate = Some(candidate.clone());
        let snapshot = session.clone();
        log::info!("session {} starts interview with {}", code, candidate);

        self.notify(
            &candidate,
            SignalMessage::InterviewStart {
                host_id: snapshot.host_id.clone(),
            },
        )
        .await;
        self.notify(
            &snapshot.host_id,
            SignalMessage::CandidateSelected {
                candidate: candidate.clone(),
            },
        )
        .await;
        self.broadcast_queue(&snapshot).await;
        Ok(candidate)
    }

    /// Clears the active candidate, if any, and tells both sides to tear down.
    pub async fn end_interview(&self, code: &str) -> RegistryResult<Option<PeerId>> {
        let code = normalize_code(code);
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&code)
            .ok_or_else(|| RegistryError::NotFound(code.clone()))?;

        let candidate = match session.active_candidate.take() {
            Some(candidate) => candidate,
            None => {
                log::debug!("end_interview on session {} with nobody active", code);
                return Ok(None);
            }
        };
        let host = session.host_id.clone();
        state.memberships.remove(&candidate);
        log::info!("session {} ended interview with {}", code, candidate);

        self.notify(&candidate, SignalMessage::InterviewEnded).await;
        self.notify(&host, SignalMessage::InterviewEndedHost).await;
        Ok(Some(candidate))
    }

    /// Removes the session; everyone in it is sent back to the start.
    pub async fn delete_session(&self, code: &str) -> RegistryResult<()> {
        let code = normalize_code(code);
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .remove(&code)
            .ok_or_else(|| RegistryError::NotFound(code.clone()))?;
        self.drop_session(&mut state, session).await;
        Ok(())
    }

    /// A peer went away. Hosts lose their sessions, candidates lose their
    /// place or their interview.
    pub async fn disconnect(&self, peer: &PeerId) {
        let mut state = self.state.lock().await;

        let hosted: Vec<String> = state
            .sessions
            .values()
            .filter(|s| &s.host_id == peer)
            .map(|s| s.code.clone())
            .collect();
        for code in hosted {
            if let Some(session) = state.sessions.remove(&code) {
                log::info!("host {} disconnected, deleting session {}", peer, code);
                self.drop_session(&mut state, session).await;
            }
        }

        let code = match state.memberships.remove(peer) {
            Some(code) => code,
            None => return,
        };
        let session = match state.sessions.get_mut(&code) {
            Some(session) => session,
            None => return,
        };
        if session.active_candidate.as_ref() == Some(peer) {
            session.active_candidate = None;
            let host = session.host_id.clone();
            log::info!("active candidate {} left session {}", peer, code);
            self.notify(&host, SignalMessage::InterviewEndedHost).await;
        } else {
            session.queue.retain(|c| c != peer);
            let snapshot = session.clone();
            log::info!("queued candidate {} left session {}", peer, code);
            self.broadcast_queue(&snapshot).await;
        }
    }

    pub async fn snapshot(&self, code: &str) -> Option<Session> {
        let code = normalize_code(code);
        self.state.lock().await.sessions.get(&code).cloned()
    }

    /// Answers a registry request arriving over the relay. Returns `None`
    /// for messages that are not registry requests. Session control is
    /// refused unless it comes from the session's host.
    pub async fn handle_request(&self, from: &PeerId, message: &SignalMessage) -> Option<Reply> {
        if let SignalMessage::StartNext { code }
        | SignalMessage::EndInterview { code }
        | SignalMessage::DeleteSession { code } = message
        {
            if !self.is_host(code, from).await {
                log::warn!("{} sent {} for a session it does not host", from, message.name());
                let error = RegistryError::NotHost(normalize_code(code));
                return Some(Reply::error(error.to_string()));
            }
        }

        let reply = match message {
            SignalMessage::CreateSession => match self.create_session(from).await {
                Ok(code) => Reply {
                    code: Some(code),
                    ..Reply::ok()
                },
                Err(e) => Reply::error(e.to_string()),
            },
            SignalMessage::JoinSession { code } => match self.join_session(code, from).await {
                Ok(position) => Reply {
                    position: Some(position),
                    ..Reply::ok()
                },
                Err(e) => Reply::error(e.to_string()),
            },
            SignalMessage::StartNext { code } => match self.start_next(code).await {
                Ok(candidate) => Reply {
                    candidate: Some(candidate),
                    ..Reply::ok()
                },
                Err(e) => Reply::error(e.to_string()),
            },
            SignalMessage::EndInterview { code } => match self.end_interview(code).await {
                Ok(candidate) => Reply {
                    candidate,
                    ..Reply::ok()
                },
                Err(e) => Reply::error(e.to_string()),
            },
            SignalMessage::DeleteSession { code } => match self.delete_session(code).await {
                Ok(()) => Reply::ok(),
                Err(e) => Reply::error(e.to_string()),
            },
            _ => return None,
        };
        Some(reply)
    }

    /// An unknown code passes, so the request itself reports `NotFound`.
    async fn is_host(&self, code: &str, peer: &PeerId) -> bool {
        let code = normalize_code(code);
        match self.state.lock().await.sessions.get(&code) {
            Some(session) => &session.host_id == peer,
            None => true,
        }
    }

    async fn drop_session(&self, state: &mut RegistryState, session: Session) {
        let mut members: Vec<PeerId> = session.queue.iter().cloned().collect();
        members.extend(session.active_candidate.iter().cloned());
        for member in &members {
            state.memberships.remove(member);
            self.notify(
                member,
                SignalMessage::SessionDeleted {
                    code: session.code.clone(),
                },
            )
            .await;
        }
        self.notify(
            &session.host_id,
            SignalMessage::SessionDeleted {
                code: session.code.clone(),
            },
        )
        .await;
        log::info!(
            "session {} deleted, {} candidate(s) released",
            session.code,
            members.len()
        );
    }

    async fn broadcast_queue(&self, session: &Session) {
        let queue: Vec<PeerId> = session.queue.iter().cloned().collect();
        self.notify(
            &session.host_id,
            SignalMessage::QueueUpdate {
                queue: queue.clone(),
                you: None,
            },
        )
        .await;
        for (i, candidate) in queue.iter().enumerate() {
            self.notify(
                candidate,
                SignalMessage::QueueUpdate {
                    queue: queue.clone(),
                    you: Some(i + 1),
                },
            )
            .await;
        }
    }

    async fn notify(&self, to: &PeerId, message: SignalMessage) {
        let name = message.name();
        if let Err(e) = self
            .relay
            .send(Envelope::new(REGISTRY_ID, to.clone(), message))
            .await
        {
            log::error!("failed to send {} to {}: {}", name, to, e);
        }
    }
}
