use super::{build_envelope, GatewayClient, GatewayError, GatewayStatus, SubmissionReceipt};
use async_trait::async_trait;
use rand::Rng;
use sri_einv_core::models::DocumentType;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{sleep, Duration};

/// What the mock answers to one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    Authorize,
    Receive,
    Reject(String),
    Unavailable,
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub document_type: DocumentType,
    pub envelope: serde_json::Value,
}

/// Scripted in-process gateway. Queued behaviours are consumed one per call;
/// once the queue is empty the fallback answers.
pub struct MockGateway {
    fallback: Mutex<MockBehavior>,
    script: Mutex<VecDeque<MockBehavior>>,
    status_script: Mutex<VecDeque<MockBehavior>>,
    submissions: Mutex<Vec<RecordedSubmission>>,
    available: AtomicBool,
    latency: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn authorization_number() -> String {
    let mut rng = rand::thread_rng();
    (0..37).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect()
}

impl MockGateway {
    fn build(fallback: MockBehavior, latency: Duration) -> Self {
        Self {
            fallback: Mutex::new(fallback),
            script: Mutex::new(VecDeque::new()),
            status_script: Mutex::new(VecDeque::new()),
            submissions: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            latency,
        }
    }

    pub fn new(fallback: MockBehavior) -> Arc<Self> {
        Arc::new(Self::build(fallback, Duration::ZERO))
    }

    pub fn authorizing() -> Arc<Self> {
        Self::new(MockBehavior::Authorize)
    }

    /// Simulated network latency on every call.
    pub fn with_latency(fallback: MockBehavior, latency: Duration) -> Arc<Self> {
        Arc::new(Self::build(fallback, latency))
    }

    pub fn push(&self, behavior: MockBehavior) {
        lock(&self.script).push_back(behavior);
    }

    pub fn push_status(&self, behavior: MockBehavior) {
        lock(&self.status_script).push_back(behavior);
    }

    pub fn set_fallback(&self, behavior: MockBehavior) {
        *lock(&self.fallback) = behavior;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        lock(&self.submissions).clone()
    }

    fn next(&self, queue: &Mutex<VecDeque<MockBehavior>>) -> MockBehavior {
        lock(queue)
            .pop_front()
            .unwrap_or_else(|| lock(&self.fallback).clone())
    }

    fn answer(behavior: MockBehavior, access_key: Option<String>) -> Result<SubmissionReceipt, GatewayError> {
        match behavior {
            MockBehavior::Authorize => Ok(SubmissionReceipt {
                status: GatewayStatus::Authorized,
                access_key_confirmed: access_key,
                authorization_number: Some(authorization_number()),
                message: Some("AUTORIZADO".to_string()),
            }),
            MockBehavior::Receive => Ok(SubmissionReceipt {
                status: GatewayStatus::Received,
                access_key_confirmed: access_key,
                authorization_number: None,
                message: Some("RECIBIDA".to_string()),
            }),
            MockBehavior::Reject(reason) => Err(GatewayError::Rejected {
                status: "DEVUELTA".to_string(),
                reason,
            }),
            MockBehavior::Unavailable => {
                Err(GatewayError::Unavailable("mock gateway offline".to_string()))
            }
            MockBehavior::Protocol(detail) => Err(GatewayError::Protocol(detail)),
        }
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn submit(
        &self,
        document_type: DocumentType,
        document: &serde_json::Value,
    ) -> Result<SubmissionReceipt, GatewayError> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let behavior = self.next(&self.script);
        lock(&self.submissions).push(RecordedSubmission {
            document_type,
            envelope: build_envelope(document_type, document),
        });
        let access_key = document
            .get("access_key")
            .and_then(|k| k.as_str())
            .map(str::to_string);
        tracing::debug!(doc_type = %document_type, ?behavior, "Mock gateway submission");
        Self::answer(behavior, access_key)
    }

    async fn status(&self, access_key: &str) -> Result<SubmissionReceipt, GatewayError> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let behavior = self.next(&self.status_script);
        Self::answer(behavior, Some(access_key.to_string()))
    }
}
