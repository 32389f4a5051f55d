//! In-process request/reply bus keyed by channel name.

use std::sync::RwLock;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("no responders on {0}")]
    NoResponders(String),
    #[error("only one subscription per subject supported: {0}")]
    AlreadySubscribed(String),
    #[error("responder on {0} dropped the request")]
    Closed(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("subscription table poisoned")]
    Poisoned,
}

/// Request/reply capability per named channel.
#[async_trait::async_trait]
pub trait RequestReply: Send + Sync {
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, BusError>;
}

/// A request delivered to a subscriber; answer it with [`BusMessage::respond`].
#[derive(Debug)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

impl BusMessage {
    /// Returns false when the requester already gave up.
    pub fn respond(self, body: Vec<u8>) -> bool {
        self.reply.send(body).is_ok()
    }
}

pub struct LocalBus {
    subs: RwLock<FxHashMap<String, mpsc::Sender<BusMessage>>>,
    cap: usize,
}

impl LocalBus {
    pub fn new(cap: usize) -> Self {
        Self { subs: RwLock::new(FxHashMap::default()), cap: cap.max(1) }
    }

    /// One subscription per subject; subscribing twice fails and keeps the first.
    pub fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let mut subs = self.subs.write().map_err(|_| BusError::Poisoned)?;
        if subs.get(subject).is_some_and(|tx| !tx.is_closed()) {
            return Err(BusError::AlreadySubscribed(subject.to_string()));
        }
        let (tx, rx) = mpsc::channel(self.cap);
        subs.insert(subject.to_string(), tx);
        Ok(rx)
    }

    /// No-op when the subject has no subscription.
    pub fn unsubscribe(&self, subject: &str) -> Result<(), BusError> {
        self.subs.write().map_err(|_| BusError::Poisoned)?.remove(subject);
        Ok(())
    }

    /// Subscribe `subject` and acknowledge every request positively.
    pub fn spawn_acknowledger(&self, subject: &str) -> Result<JoinHandle<()>, BusError> {
        let mut rx = self.subscribe(subject)?;
        let subject = subject.to_string();
        info!(subject = %subject, "acknowledger subscribed");
        Ok(tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                debug!(subject = %subject, bytes = msg.payload.len(), "acknowledging batch");
                if !msg.respond(br#"{"accepted":true}"#.to_vec()) {
                    warn!(subject = %subject, "requester gone before ack");
                }
            }
        }))
    }

    fn sender(&self, subject: &str) -> Result<mpsc::Sender<BusMessage>, BusError> {
        let subs = self.subs.read().map_err(|_| BusError::Poisoned)?;
        subs.get(subject).cloned().ok_or_else(|| BusError::NoResponders(subject.to_string()))
    }
}

impl Default for LocalBus {
    fn default() -> Self { Self::new(256) }
}

#[async_trait::async_trait]
impl RequestReply for LocalBus {
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, BusError> {
        let tx = self.sender(subject)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = BusMessage { subject: subject.to_string(), payload, reply: reply_tx };
        let exchange = async {
            tx.send(msg).await.map_err(|_| BusError::NoResponders(subject.to_string()))?;
            reply_rx.await.map_err(|_| BusError::Closed(subject.to_string()))
        };
        tokio::time::timeout(timeout, exchange).await.map_err(|_| BusError::Timeout(timeout))?
    }
}
