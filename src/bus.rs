//! Message bus abstraction covering both the internal (host<->guest) and
//! external (control plane) buses described in §6.
//!
//! Subjects are plain strings; the internal bus uses the `agentint.*` namespace,
//! the external bus uses the control-API prefix and `$NEX.*` for events/logs.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// A single bus message: a subject, an opaque payload, and header map used to
/// carry out-of-band fields like `x-nex-trigger-subject`, `x-nex-runtime-ns`,
/// and W3C trace-context (`traceparent`/`tracestate`).
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }
}

/// A live subscription. Dropping or calling `unsubscribe` stops delivery of
/// further messages; in-flight handler invocations are not interrupted.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Stop delivering new messages. Idempotent.
    async fn unsubscribe(&self);

    fn subject(&self) -> &str;
}

/// A handler invoked for each message delivered to a subscription.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: Message) -> Option<Message>;
}

/// Subject-addressed publish/subscribe and request/reply transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message with no reply expected.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Send a request and await a single reply, or time out.
    async fn request(&self, message: Message, timeout: std::time::Duration) -> Result<Message>;

    /// Subscribe to a subject; `handler` is invoked for every inbound message.
    /// If `handler` returns `Some(reply)`, it is sent back as the request's
    /// response (for subjects used in request/reply style).
    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<Box<dyn Subscription>>;
}

/// In-process fake bus for tests: an exact-subject router over async channels.
/// No wildcard matching — the manager never subscribes on sink-wildcard
/// subjects that it owns (wildcard subjects like `agentint.*.logs` are a guest
/// publish surface, out of this crate's scope).
#[derive(Default, Clone)]
pub struct LocalBus {
    inner: Arc<Mutex<HashMap<String, Arc<dyn Handler>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalSubscription {
    subject: String,
    inner: Arc<Mutex<HashMap<String, Arc<dyn Handler>>>>,
}

#[async_trait]
impl Subscription for LocalSubscription {
    async fn unsubscribe(&self) {
        self.inner.lock().await.remove(&self.subject);
    }

    fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, message: Message) -> Result<()> {
        let handler = self.inner.lock().await.get(&message.subject).cloned();
        if let Some(handler) = handler {
            handler.handle(message).await;
        }
        Ok(())
    }

    async fn request(&self, message: Message, timeout: std::time::Duration) -> Result<Message> {
        let handler = self.inner.lock().await.get(&message.subject).cloned();
        let Some(handler) = handler else {
            anyhow::bail!("no subscriber for subject {}", message.subject);
        };
        let subject = message.subject.clone();
        let fut = handler.handle(message);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => anyhow::bail!("no reply for subject {}", subject),
            Err(_) => anyhow::bail!("request to {} timed out", subject),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<Box<dyn Subscription>> {
        self.inner
            .lock()
            .await
            .insert(subject.to_string(), handler);
        Ok(Box::new(LocalSubscription {
            subject: subject.to_string(),
            inner: self.inner.clone(),
        }))
    }
}

/// `async-nats`-backed bus for production use. Wraps a single shared client
/// connection; subjects map directly onto NATS subjects.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }
}

struct NatsSubscription {
    subject: String,
    cancel: mpsc::Sender<()>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn unsubscribe(&self) {
        let _ = self.cancel.send(()).await;
    }

    fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, message: Message) -> Result<()> {
        self.client
            .publish(message.subject, message.payload)
            .await?;
        Ok(())
    }

    async fn request(&self, message: Message, timeout: std::time::Duration) -> Result<Message> {
        let mut headers = async_nats::HeaderMap::new();
        for (k, v) in &message.headers {
            headers.insert(k.as_str(), v.as_str());
        }
        let fut = self
            .client
            .request_with_headers(message.subject.clone(), headers, message.payload);
        let reply = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("request to {} timed out", message.subject))??;
        let mut out = Message::new(reply.subject.to_string(), reply.payload);
        if let Some(headers) = reply.headers {
            for (name, value) in headers.iter() {
                if let Some(v) = value.iter().next() {
                    out.headers.insert(name.to_string(), v.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<Box<dyn Subscription>> {
        let mut subscriber = self.client.subscribe(subject.to_string()).await?;
        let client = self.client.clone();
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => break,
                    next = subscriber.next() => {
                        let Some(msg) = next else { break };
                        let reply_subject = msg.reply.clone();
                        let mut inbound = Message::new(msg.subject.to_string(), msg.payload);
                        if let Some(headers) = &msg.headers {
                            for (name, value) in headers.iter() {
                                if let Some(v) = value.iter().next() {
                                    inbound.headers.insert(name.to_string(), v.to_string());
                                }
                            }
                        }
                        if let Some(reply) = handler.handle(inbound).await
                            && let Some(reply_subject) = reply_subject
                        {
                            let _ = client.publish(reply_subject, reply.payload).await;
                        }
                    }
                }
            }
        });

        Ok(Box::new(NatsSubscription {
            subject: subject.to_string(),
            cancel: cancel_tx,
        }))
    }
}
