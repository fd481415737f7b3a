use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{Envelope, Relay, Subscription};
use crate::internal::data_types::PeerId;

/// In-process relay: one unbounded mailbox per subscribed id.
#[derive(Clone, Default)]
pub struct LocalRelay {
    inner: Arc<Mutex<Mailboxes>>,
}

#[derive(Default)]
struct Mailboxes {
    next_token: u64,
    // token guards against a stale handle removing a newer mailbox
    by_id: HashMap<PeerId, (u64, mpsc::UnboundedSender<Envelope>)>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        lock(&self.inner).by_id.contains_key(id)
    }
}

fn lock(inner: &Mutex<Mailboxes>) -> MutexGuard<'_, Mailboxes> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let mailboxes = lock(&self.inner);
        match mailboxes.by_id.get(&envelope.to) {
            Some((_, tx)) => {
                let to = envelope.to.clone();
                let name = envelope.message.name();
                if tx.send(envelope).is_err() {
                    log::debug!("dropped {} for closed mailbox {}", name, to);
                }
            }
            None => {
                log::debug!(
                    "dropped {} for unknown peer {}",
                    envelope.message.name(),
                    envelope.to
                );
            }
        }
        Ok(())
    }

    async fn subscribe(&self, id: &PeerId) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = {
            let mut mailboxes = lock(&self.inner);
            mailboxes.next_token += 1;
            let token = mailboxes.next_token;
            if mailboxes.by_id.insert(id.clone(), (token, tx)).is_some() {
                log::warn!("replacing relay subscription for {}", id);
            }
            token
        };

        let inner = self.inner.clone();
        let key = id.clone();
        Ok(Subscription::new(id.clone(), rx, move || {
            let mut mailboxes = lock(&inner);
            if matches!(mailboxes.by_id.get(&key), Some((t, _)) if *t == token) {
                mailboxes.by_id.remove(&key);
            }
        }))
    }
}
