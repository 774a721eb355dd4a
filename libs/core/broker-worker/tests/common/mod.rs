//! Shared helpers for broker-worker integration tests.

#![allow(dead_code)]

use broker_worker::{
    BrokerError, CloseSignal, CompletionHandle, Delivery, DeliveryStream, Handler, HandlerError,
    async_trait,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Acked,
    Rejected { requeue: bool },
}

/// Shared log of completions, in the order they happened.
#[derive(Clone, Default)]
pub struct CompletionLog {
    entries: Arc<Mutex<Vec<(String, Resolved)>>>,
}

impl CompletionLog {
    pub fn entries(&self) -> Vec<(String, Resolved)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn count(&self, resolved: Resolved) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| *r == resolved)
            .count()
    }

    pub fn resolution_of(&self, id: &str) -> Vec<Resolved> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(entry, _)| entry == id)
            .map(|(_, r)| *r)
            .collect()
    }

    /// Build a delivery whose completion is recorded under `id`.
    pub fn delivery(&self, id: &str, payload: &[u8]) -> Delivery {
        Delivery::new(
            payload.to_vec(),
            HashMap::new(),
            RecordingCompletion {
                id: id.to_string(),
                log: self.clone(),
            },
        )
        .with_delivery_id(id)
    }
}

struct RecordingCompletion {
    id: String,
    log: CompletionLog,
}

#[async_trait]
impl CompletionHandle for RecordingCompletion {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        self.log
            .entries
            .lock()
            .unwrap()
            .push((self.id.clone(), Resolved::Acked));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.log
            .entries
            .lock()
            .unwrap()
            .push((self.id.clone(), Resolved::Rejected { requeue }));
        Ok(())
    }
}

/// Delivery stream fed from the test through a channel.
pub struct ScriptedSource {
    pub sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
    pub signal: Arc<CloseSignal>,
}

impl ScriptedSource {
    pub fn new() -> (Self, DeliveryStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed();
        let source = Self {
            sender,
            signal: Arc::new(CloseSignal::default()),
        };
        (source, stream)
    }

    pub fn send(&self, delivery: Delivery) {
        self.sender.send(Ok(delivery)).unwrap();
    }
}

/// Handler that records concurrency and follows payload-driven scripts:
/// payloads starting with `fail` return an error, `panic` panics.
#[derive(Clone)]
pub struct RecordingHandler {
    pub delay: Duration,
    pub current: Arc<AtomicUsize>,
    pub max_seen: Arc<AtomicUsize>,
    pub invocations: Arc<AtomicUsize>,
    pub started: Arc<AtomicUsize>,
    pub gate: Option<Arc<Notify>>,
}

impl RecordingHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: Arc::default(),
            max_seen: Arc::default(),
            invocations: Arc::default(),
            started: Arc::default(),
            gate: None,
        }
    }

    /// Block every invocation until the gate is notified once per invocation.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn max_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle_message(
        &self,
        payload: &[u8],
        _attributes: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if payload.starts_with(b"panic") {
            panic!("recording handler asked to panic");
        }
        if payload.starts_with(b"fail") {
            return Err(HandlerError::failed("recording handler asked to fail"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording_handler"
    }
}
