//! HTTP signaling relay. Hosts the session registry and moves envelopes
//! between connected peers:
//!
//! - `POST /connect` -> `{"id": "..."}`, opens a mailbox for a fresh id
//! - `POST /message` with an [`Envelope`]. Envelopes addressed to the
//!   registry are answered with a [`Reply`]; everything else is forwarded.
//! - `GET /poll/<id>` long-polls the mailbox, returns a JSON array
//! - `POST /disconnect/<id>` closes the mailbox and leaves the registry
//!
//! Peers that neither poll nor send for `idle_timeout` are disconnected by a
//! sweeper, so a crashed host does not keep its sessions alive.

use anyhow::Result;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::internal::data_types::PeerId;
use crate::registry::SessionRegistry;
use crate::signaling::{Envelope, LocalRelay, Relay, Reply, Subscription, REGISTRY_ID};

#[derive(Debug, Serialize, Deserialize)]
pub struct Connected {
    pub id: PeerId,
}

struct Mailbox {
    subscription: Arc<Mutex<Subscription>>,
    last_seen: Instant,
}

pub struct RelayServer {
    config: Config,
    relay: LocalRelay,
    registry: SessionRegistry,
    mailboxes: Mutex<HashMap<PeerId, Mailbox>>,
}

impl RelayServer {
    pub fn new(config: Config) -> Self {
        let relay = LocalRelay::new();
        let registry = SessionRegistry::new(Arc::new(relay.clone()), &config);
        Self {
            config,
            relay,
            registry,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        match (&method, path.as_str()) {
            (&Method::POST, "/connect") => self.connect().await,
            (&Method::POST, "/message") => {
                let body = hyper::body::to_bytes(req.into_body()).await?;
                let envelope = match serde_json::from_slice::<Envelope>(&body) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        log::error!("deserialize error: {}", err);
                        return Ok(status(StatusCode::BAD_REQUEST));
                    }
                };
                self.message(envelope).await
            }
            (&Method::GET, p) if p.starts_with("/poll/") => {
                let id = &p["/poll/".len()..];
                match self.poll(id).await {
                    Some(envelopes) => Ok(json(StatusCode::OK, &envelopes)),
                    None => Ok(status(StatusCode::NOT_FOUND)),
                }
            }
            (&Method::POST, p) if p.starts_with("/disconnect/") => {
                let id = &p["/disconnect/".len()..];
                if self.disconnect(id).await {
                    Ok(status(StatusCode::OK))
                } else {
                    Ok(status(StatusCode::NOT_FOUND))
                }
            }
            // Return the 404 Not Found for other routes.
            _ => Ok(status(StatusCode::NOT_FOUND)),
        }
    }

    async fn connect(&self) -> Result<Response<Body>, hyper::Error> {
        let id = Uuid::new_v4().to_string();
        let subscription = match self.relay.subscribe(&id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                log::error!("failed to open mailbox for {}: {}", id, e);
                return Ok(status(StatusCode::INTERNAL_SERVER_ERROR));
            }
        };
        let mailbox = Mailbox {
            subscription: Arc::new(Mutex::new(subscription)),
            last_seen: Instant::now(),
        };
        self.mailboxes.lock().await.insert(id.clone(), mailbox);
        log::info!("peer {} connected", id);
        Ok(json(StatusCode::OK, &Connected { id }))
    }

    async fn message(&self, envelope: Envelope) -> Result<Response<Body>, hyper::Error> {
        if self.touch(&envelope.from).await.is_none() {
            log::warn!("message from unknown peer {}", envelope.from);
            return Ok(status(StatusCode::NOT_FOUND));
        }

        if envelope.to == REGISTRY_ID {
            return match self
                .registry
                .handle_request(&envelope.from, &envelope.message)
                .await
            {
                Some(reply) => Ok(json(StatusCode::OK, &reply)),
                None => {
                    log::warn!(
                        "{} sent {} to the registry",
                        envelope.from,
                        envelope.message.name()
                    );
                    Ok(json(
                        StatusCode::BAD_REQUEST,
                        &Reply::error("not a registry request"),
                    ))
                }
            };
        }

        if let Err(e) = self.relay.send(envelope).await {
            log::error!("failed to forward envelope: {}", e);
            return Ok(status(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok(json(StatusCode::OK, &Reply::ok()))
    }

    /// Waits up to the poll timeout for the first envelope, then returns it
    /// with everything else already queued.
    async fn poll(&self, id: &str) -> Option<Vec<Envelope>> {
        let mailbox = self.touch(id).await?;
        let mut subscription = mailbox.lock().await;

        let mut envelopes = vec![];
        if let Ok(Some(envelope)) =
            tokio::time::timeout(self.config.poll_timeout, subscription.recv()).await
        {
            envelopes.push(envelope);
        }
        while let Some(envelope) = subscription.try_recv() {
            envelopes.push(envelope);
        }
        drop(subscription);
        self.touch(id).await;
        Some(envelopes)
    }

    /// marks the peer as alive and hands out its mailbox
    async fn touch(&self, id: &str) -> Option<Arc<Mutex<Subscription>>> {
        let mut mailboxes = self.mailboxes.lock().await;
        let mailbox = mailboxes.get_mut(id)?;
        mailbox.last_seen = Instant::now();
        Some(mailbox.subscription.clone())
    }

    /// Disconnects every peer that has been silent for longer than the idle
    /// timeout and returns their ids. An open long poll counts as activity.
    pub async fn sweep(&self) -> Vec<PeerId> {
        let idle = self.config.idle_timeout.max(self.config.poll_timeout * 2);
        let now = Instant::now();
        let silent: Vec<PeerId> = self
            .mailboxes
            .lock()
            .await
            .iter()
            .filter(|(_, mailbox)| now.duration_since(mailbox.last_seen) > idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &silent {
            log::info!("peer {} silent for over {:?}", id, idle);
            self.disconnect(id).await;
        }
        silent
    }

    /// A poll in flight keeps the mailbox until it returns.
    async fn disconnect(&self, id: &str) -> bool {
        let mailbox = match self.mailboxes.lock().await.remove(id) {
            Some(mailbox) => mailbox,
            None => return false,
        };
        if let Ok(mut subscription) = mailbox.subscription.try_lock() {
            subscription.unsubscribe();
        }
        self.registry.disconnect(&id.to_string()).await;
        log::info!("peer {} disconnected", id);
        true
    }
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}

fn json<T: Serialize>(code: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_string(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = code;
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            log::error!("failed to serialize response: {}", e);
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn serve(config: Config) -> Result<()> {
    let addr = SocketAddr::from_str(&config.listen_addr)?;
    let server = Arc::new(RelayServer::new(config));

    let sweeper = server.clone();
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(sweeper.config.poll_timeout);
        loop {
            ticks.tick().await;
            sweeper.sweep().await;
        }
    });

    let service = make_service_fn(move |_| {
        let server = server.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let server = server.clone();
                async move { server.handle(req).await }
            }))
        }
    });

    let http = hyper::Server::try_bind(&addr)?.serve(service);
    log::info!("signaling relay listening on {}", addr);
    if let Err(e) = http.await {
        log::error!("server error: {}", e);
    }
    Ok(())
}
