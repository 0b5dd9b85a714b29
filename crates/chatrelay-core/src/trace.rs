use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: Duration,
    pub user_agent: String,
    pub client_ip: Option<String>,
    pub model: Option<String>,
    /// `None` until the request body was parsed and its mode is known.
    pub streaming: Option<bool>,
    pub message_count: usize,
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn record(&self, outcome: RequestOutcome);
}

/// Timing and metadata for one inbound request, reported to a [`StatsSink`] when finished.
///
/// `finish` consumes the trace so a request is recorded at most once; the write itself runs on
/// a detached task and never holds up the response.
pub struct RequestTrace {
    sink: Arc<dyn StatsSink>,
    started: Instant,
    method: String,
    path: String,
    user_agent: String,
    client_ip: Option<String>,
    model: Option<String>,
    streaming: Option<bool>,
    message_count: usize,
}

impl RequestTrace {
    pub fn start(
        sink: Arc<dyn StatsSink>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            started: Instant::now(),
            method: method.into(),
            path: path.into(),
            user_agent: String::new(),
            client_ip: None,
            model: None,
            streaming: None,
            message_count: 0,
        }
    }

    pub fn with_client(mut self, user_agent: Option<&str>, client_ip: Option<String>) -> Self {
        self.user_agent = user_agent.unwrap_or_default().to_string();
        self.client_ip = client_ip;
        self
    }

    pub fn describe_request(&mut self, model: &str, streaming: bool, message_count: usize) {
        self.model = Some(model.to_string());
        self.streaming = Some(streaming);
        self.message_count = message_count;
    }

    pub fn outcome(&self, status: u16) -> RequestOutcome {
        RequestOutcome {
            method: self.method.clone(),
            path: self.path.clone(),
            status,
            duration: self.started.elapsed(),
            user_agent: self.user_agent.clone(),
            client_ip: self.client_ip.clone(),
            model: self.model.clone(),
            streaming: self.streaming,
            message_count: self.message_count,
        }
    }

    pub fn finish(self, status: u16) {
        let outcome = self.outcome(status);
        debug!(
            event = "stats.request.finished",
            path = %outcome.path,
            status = outcome.status,
            duration_ms = outcome.duration.as_millis() as u64,
            streaming = ?outcome.streaming
        );
        let sink = self.sink;
        tokio::spawn(async move {
            sink.record(outcome).await;
        });
    }
}
