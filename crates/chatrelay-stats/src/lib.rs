use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatrelay_contracts::{
    DailyBucket, HistoryPoint, HourlyBucket, LiveRequestEntry, ModelUsage, RequestPage,
    StatsSnapshot,
};
use chatrelay_core::{RequestOutcome, StatsSink};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::debug;

pub const LIVE_CAPACITY: usize = 100;
pub const HISTORY_CAPACITY: usize = 60;
pub const HOURLY_RETENTION_HOURS: i64 = 7 * 24;
pub const MAX_PAGE_SIZE: usize = 100;
const TOP_MODELS: usize = 3;

const CHAT_PATH: &str = "/v1/chat/completions";
const MODELS_PATH: &str = "/v1/models";

fn hour_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d-%H").to_string()
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Model usage only counts requests that were actually served.
fn served_model(outcome: &RequestOutcome) -> Option<&str> {
    outcome.model.as_deref().filter(|_| outcome.is_success())
}

/// `new = (old * (n - 1) + sample) / n`, with `n` already counting the sample.
fn running_average(old: f64, count: u64, sample: f64) -> f64 {
    if count <= 1 {
        return sample;
    }
    (old * (count - 1) as f64 + sample) / count as f64
}

#[derive(Default)]
struct HourState {
    total: u64,
    success: u64,
    failed: u64,
    average_ms: f64,
    streaming: u64,
    non_streaming: u64,
    messages: u64,
    clients: HashSet<String>,
    models: BTreeMap<String, u64>,
    error_statuses: BTreeMap<String, u64>,
}

impl HourState {
    fn record(&mut self, outcome: &RequestOutcome, duration_ms: f64) {
        self.total += 1;
        if outcome.is_success() {
            self.success += 1;
        } else {
            self.failed += 1;
            *self.error_statuses.entry(outcome.status.to_string()).or_default() += 1;
        }
        self.average_ms = running_average(self.average_ms, self.total, duration_ms);
        match outcome.streaming {
            Some(true) => self.streaming += 1,
            Some(false) => self.non_streaming += 1,
            None => {}
        }
        self.messages += outcome.message_count as u64;
        let client = outcome.client_ip.as_deref().filter(|ip| !ip.is_empty() && *ip != "unknown");
        if let Some(ip) = client {
            self.clients.insert(ip.to_string());
        }
        if let Some(model) = served_model(outcome) {
            *self.models.entry(model.to_string()).or_default() += 1;
        }
    }

    fn view(&self, hour: &str) -> HourlyBucket {
        HourlyBucket {
            hour: hour.to_string(),
            total_requests: self.total,
            successful_requests: self.success,
            failed_requests: self.failed,
            average_response_time: self.average_ms,
            streaming_requests: self.streaming,
            non_streaming_requests: self.non_streaming,
            total_messages: self.messages,
            unique_clients: self.clients.len(),
            models: self.models.clone(),
            error_statuses: self.error_statuses.clone(),
        }
    }
}

struct StatsState {
    start: DateTime<Utc>,
    last_request: Option<DateTime<Utc>>,
    total: u64,
    success: u64,
    failed: u64,
    average_ms: f64,
    fastest_ms: f64,
    slowest_ms: f64,
    api_calls: u64,
    models_calls: u64,
    streaming: u64,
    non_streaming: u64,
    model_usage: BTreeMap<String, u64>,
    live: VecDeque<LiveRequestEntry>,
    hours: BTreeMap<String, HourState>,
    history: VecDeque<HistoryPoint>,
    sequence: u64,
}

impl StatsState {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            last_request: None,
            total: 0,
            success: 0,
            failed: 0,
            average_ms: 0.0,
            fastest_ms: f64::INFINITY,
            slowest_ms: 0.0,
            api_calls: 0,
            models_calls: 0,
            streaming: 0,
            non_streaming: 0,
            model_usage: BTreeMap::new(),
            live: VecDeque::with_capacity(LIVE_CAPACITY),
            hours: BTreeMap::new(),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            sequence: 0,
        }
    }

    fn record(&mut self, outcome: RequestOutcome, at: DateTime<Utc>) {
        let duration_ms = outcome.duration.as_micros() as f64 / 1000.0;

        self.total += 1;
        self.last_request = Some(at);
        if outcome.is_success() {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        match (outcome.path.as_str(), outcome.streaming) {
            (CHAT_PATH, Some(true)) => {
                self.api_calls += 1;
                self.streaming += 1;
            }
            (CHAT_PATH, Some(false)) => {
                self.api_calls += 1;
                self.non_streaming += 1;
            }
            (CHAT_PATH, None) => self.api_calls += 1,
            (MODELS_PATH, _) => self.models_calls += 1,
            _ => {}
        }
        if let Some(model) = served_model(&outcome) {
            *self.model_usage.entry(model.to_string()).or_default() += 1;
        }
        self.fastest_ms = self.fastest_ms.min(duration_ms);
        self.slowest_ms = self.slowest_ms.max(duration_ms);
        self.average_ms = running_average(self.average_ms, self.total, duration_ms);

        self.hours.entry(hour_key(at)).or_default().record(&outcome, duration_ms);
        self.prune_hours(at);

        self.sequence += 1;
        if self.live.len() == LIVE_CAPACITY {
            self.live.pop_front();
        }
        self.live.push_back(LiveRequestEntry {
            id: format!("{}-{}", at.timestamp_millis(), self.sequence),
            timestamp: timestamp(at),
            method: outcome.method,
            path: outcome.path,
            status: outcome.status,
            duration_ms,
            user_agent: outcome.user_agent,
            model: outcome.model,
            streaming: outcome.streaming.unwrap_or(false),
        });
    }

    fn prune_hours(&mut self, now: DateTime<Utc>) {
        let cutoff = hour_key(now - TimeDelta::hours(HOURLY_RETENTION_HOURS));
        let before = self.hours.len();
        self.hours = self.hours.split_off(&cutoff);
        let pruned = before - self.hours.len();
        if pruned > 0 {
            debug!(event = "stats.hourly.pruned", buckets = pruned, cutoff = %cutoff);
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let mut ranked = self
            .model_usage
            .iter()
            .map(|(model, count)| (model.clone(), *count))
            .collect::<Vec<_>>();
        // Stable sort keeps alphabetical order among equal counts.
        ranked.sort_by(|left, right| right.1.cmp(&left.1));
        let top_models = ranked
            .into_iter()
            .take(TOP_MODELS)
            .map(|(model, count)| ModelUsage { model, count })
            .collect();

        StatsSnapshot {
            total_requests: self.total,
            successful_requests: self.success,
            failed_requests: self.failed,
            average_response_time: self.average_ms,
            fastest_response: self.fastest_ms.is_finite().then_some(self.fastest_ms),
            slowest_response: self.slowest_ms,
            api_calls_count: self.api_calls,
            models_calls_count: self.models_calls,
            streaming_requests: self.streaming,
            non_streaming_requests: self.non_streaming,
            model_usage: self.model_usage.clone(),
            top_models,
            start_time: timestamp(self.start),
            last_request_time: self.last_request.map(timestamp),
            uptime_seconds: (now - self.start).num_seconds().max(0) as u64,
        }
    }

    fn sample_history(&mut self, at: DateTime<Utc>) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(HistoryPoint {
            timestamp: timestamp(at),
            total_requests: self.total,
            successful_requests: self.success,
            failed_requests: self.failed,
            average_response_time: self.average_ms,
        });
    }

    fn daily(&self, days: usize) -> Vec<DailyBucket> {
        let mut by_date: BTreeMap<&str, Vec<(&str, &HourState)>> = BTreeMap::new();
        for (hour, state) in &self.hours {
            by_date.entry(&hour[..10]).or_default().push((hour.as_str(), state));
        }

        by_date
            .into_iter()
            .rev()
            .take(days)
            .map(|(date, hours)| {
                let mut bucket = DailyBucket {
                    date: date.to_string(),
                    total_requests: 0,
                    successful_requests: 0,
                    failed_requests: 0,
                    average_response_time: 0.0,
                    streaming_requests: 0,
                    non_streaming_requests: 0,
                    total_messages: 0,
                    unique_clients: 0,
                    peak_hour: None,
                    models: BTreeMap::new(),
                };
                let mut clients = HashSet::new();
                let mut weighted_ms = 0.0;
                let mut peak = 0;
                for (hour, state) in hours {
                    bucket.total_requests += state.total;
                    bucket.successful_requests += state.success;
                    bucket.failed_requests += state.failed;
                    bucket.streaming_requests += state.streaming;
                    bucket.non_streaming_requests += state.non_streaming;
                    bucket.total_messages += state.messages;
                    weighted_ms += state.average_ms * state.total as f64;
                    clients.extend(state.clients.iter().cloned());
                    for (model, count) in &state.models {
                        *bucket.models.entry(model.clone()).or_default() += count;
                    }
                    if state.total > peak {
                        peak = state.total;
                        bucket.peak_hour = Some(hour.to_string());
                    }
                }
                if bucket.total_requests > 0 {
                    bucket.average_response_time = weighted_ms / bucket.total_requests as f64;
                }
                bucket.unique_clients = clients.len();
                bucket
            })
            .collect()
    }
}

/// Process-local request statistics behind the dashboard endpoints. Lost on restart.
#[derive(Clone)]
pub struct InMemoryStats {
    inner: Arc<Mutex<StatsState>>,
}

impl Default for InMemoryStats {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStats {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { inner: Arc::new(Mutex::new(StatsState::new(start))) }
    }

    pub async fn record_at(&self, outcome: RequestOutcome, at: DateTime<Utc>) {
        let mut guard = self.inner.lock().await;
        guard.record(outcome, at);
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Utc::now()).await
    }

    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let guard = self.inner.lock().await;
        guard.snapshot(now)
    }

    /// Newest first. `page` is 1-based; `page_size` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn recent_requests(&self, page: usize, page_size: usize) -> RequestPage {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let guard = self.inner.lock().await;
        let total = guard.live.len();
        let requests = guard
            .live
            .iter()
            .rev()
            .skip((page - 1) * page_size)
            .take(page_size)
            .cloned()
            .collect();
        RequestPage { requests, total, page, page_size, total_pages: total.div_ceil(page_size) }
    }

    pub async fn history(&self) -> Vec<HistoryPoint> {
        let guard = self.inner.lock().await;
        guard.history.iter().cloned().collect()
    }

    pub async fn sample_history_at(&self, at: DateTime<Utc>) {
        let mut guard = self.inner.lock().await;
        guard.sample_history(at);
    }

    /// Most recent hour first, at most `hours` buckets.
    pub async fn hourly(&self, hours: usize) -> Vec<HourlyBucket> {
        let guard = self.inner.lock().await;
        guard.hours.iter().rev().take(hours).map(|(hour, state)| state.view(hour)).collect()
    }

    /// Most recent day first, rolled up from the retained hourly buckets.
    pub async fn daily(&self, days: usize) -> Vec<DailyBucket> {
        let guard = self.inner.lock().await;
        guard.daily(days)
    }

    pub fn spawn_history_sampler(&self, period: Duration) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.sample_history_at(Utc::now()).await;
            }
        })
    }
}

#[async_trait]
impl StatsSink for InMemoryStats {
    async fn record(&self, outcome: RequestOutcome) {
        self.record_at(outcome, Utc::now()).await;
    }
}
