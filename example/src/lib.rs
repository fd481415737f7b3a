use anyhow::{bail, Result};
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use interview_rtc::server::Connected;
use interview_rtc::{Envelope, PeerId, Relay, Reply, SignalMessage, Subscription, REGISTRY_ID};
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_logger(level: log::LevelFilter) {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%3f"),
                record.args()
            )
        })
        .filter(None, level)
        .init();
}

/// Talks to the relay server over HTTP: envelopes are POSTed, the mailbox is
/// long-polled.
#[derive(Clone)]
pub struct HttpRelay {
    server: String,
    client: Client<HttpConnector>,
    /// pause before polling again after a failed poll
    retry: Duration,
}

impl HttpRelay {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            client: Client::new(),
            retry: Duration::from_secs(1),
        }
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// asks the server for an id and a mailbox
    pub async fn connect(&self) -> Result<PeerId> {
        let (status, body) = self.call(Method::POST, "/connect", Body::empty()).await?;
        if status != StatusCode::OK {
            bail!("connect failed: {}", status);
        }
        Ok(serde_json::from_slice::<Connected>(&body)?.id)
    }

    /// sends a request to the session registry and waits for its reply
    pub async fn request(&self, from: &PeerId, message: SignalMessage) -> Result<Reply> {
        let envelope = Envelope::new(from.clone(), REGISTRY_ID, message);
        let (_, body) = self
            .call(Method::POST, "/message", Body::from(serde_json::to_string(&envelope)?))
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn call(&self, method: Method, path: &str, body: Body) -> Result<(StatusCode, Bytes)> {
        let req = match Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.server, path))
            .header("content-type", "application/json; charset=utf-8")
            .body(body)
        {
            Ok(req) => req,
            Err(err) => {
                log::error!("failed to create request : {}", err);
                return Err(err.into());
            }
        };
        let response = self.client.request(req).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, bytes))
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let payload = serde_json::to_string(&envelope)?;
        let (status, _) = self.call(Method::POST, "/message", Body::from(payload)).await?;
        if status != StatusCode::OK {
            log::warn!("relay refused {}: {}", envelope.message.name(), status);
        }
        Ok(())
    }

    async fn subscribe(&self, id: &PeerId) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = self.clone();
        let path = format!("/poll/{}", id);
        let poller = tokio::spawn(async move {
            loop {
                match relay.call(Method::GET, &path, Body::empty()).await {
                    Ok((status, body)) if status == StatusCode::OK => {
                        let envelopes: Vec<Envelope> = match serde_json::from_slice(&body) {
                            Ok(envelopes) => envelopes,
                            Err(e) => {
                                log::error!("bad poll response: {}", e);
                                tokio::time::sleep(relay.retry).await;
                                continue;
                            }
                        };
                        for envelope in envelopes {
                            if tx.send(envelope).is_err() {
                                return;
                            }
                        }
                    }
                    Ok((status, _)) => {
                        log::warn!("mailbox closed by the server: {}", status);
                        return;
                    }
                    Err(e) => {
                        log::warn!("poll failed: {}", e);
                        tokio::time::sleep(relay.retry).await;
                    }
                }
            }
        });

        let relay = self.clone();
        let disconnect = format!("/disconnect/{}", id);
        Ok(Subscription::new(id.clone(), rx, move || {
            poller.abort();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = relay.call(Method::POST, &disconnect, Body::empty()).await {
                        log::error!("failed to disconnect: {}", e);
                    }
                });
            }
        }))
    }
}
