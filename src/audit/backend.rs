//! # Audit Backends
//!
//! A backend receives audit events from the request pipeline. The contract:
//!
//! - `run` is called once before serving starts and must not block
//! - `process_events` must not mutate the events it is given; callers keep and
//!   reuse them. The same audit id may arrive one to three times (request
//!   received, response complete, panic), so a backend treats every delivery
//!   as a cumulative snapshot rather than a unique record
//! - `shutdown` is awaited only after the stop signal fired and returns once
//!   every pending event has been handed off
//!
//! ## Backends
//! - [`LogBackend`]: writes each event as a log line (legacy or JSON format)
//! - [`BufferedBackend`]: bounded channel with a batching task in front of another backend
//! - [`UnionBackend`]: fans events out to several backends
//! - [`InMemoryBackend`]: keeps every delivery, for inspection

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::event::AuditEvent;
use crate::core::error::ApiServerResult;
use crate::observability::metrics;

#[async_trait]
pub trait AuditBackend: Send + Sync {
    /// Short name used in logs and the `plugin` metric label
    fn name(&self) -> &str;

    /// Start any background work. Must return promptly.
    fn run(&self, stop: CancellationToken) -> ApiServerResult<()>;

    /// Deliver events. Must not block on slow sinks for long.
    fn process_events(&self, events: &[AuditEvent]);

    /// Flush and release resources; called after the stop signal.
    async fn shutdown(&self);
}

/// Output format of [`LogBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Legacy,
    Json,
}

/// Writes events to the `audit` tracing target
#[derive(Debug, Clone, Default)]
pub struct LogBackend {
    format: LogFormat,
}

impl LogBackend {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }

    /// Single-line rendering in the classic `AUDIT:` layout
    pub fn legacy_line(event: &AuditEvent) -> String {
        let ips = event.source_ips.join(",");
        let groups = quoted_list(&event.user.groups);
        let (as_user, as_groups) = match &event.impersonated_user {
            Some(user) => (user.name.clone(), quoted_list(&user.groups)),
            None => ("<self>".to_string(), "<lookup>".to_string()),
        };
        let namespace = event
            .object_ref
            .as_ref()
            .map(|r| r.namespace.as_str())
            .filter(|ns| !ns.is_empty())
            .unwrap_or("<none>");
        let response = event
            .response_status
            .as_ref()
            .map(|s| s.code.to_string())
            .unwrap_or_else(|| "<deferred>".to_string());

        format!(
            "{} AUDIT: id=\"{}\" stage=\"{}\" ip=\"{}\" method=\"{}\" user=\"{}\" groups={} as=\"{}\" asgroups={} namespace=\"{}\" uri=\"{}\" response=\"{}\"",
            event.stage_timestamp.to_rfc3339(),
            event.audit_id,
            event.stage.as_str(),
            ips,
            event.verb,
            event.user.name,
            groups,
            as_user,
            as_groups,
            namespace,
            event.request_uri,
            response
        )
    }
}

fn quoted_list(values: &[String]) -> String {
    if values.is_empty() {
        return "<none>".to_string();
    }
    values
        .iter()
        .map(|v| format!("\"{}\"", v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl AuditBackend for LogBackend {
    fn name(&self) -> &str {
        "log"
    }

    fn run(&self, _stop: CancellationToken) -> ApiServerResult<()> {
        Ok(())
    }

    fn process_events(&self, events: &[AuditEvent]) {
        for event in events {
            match self.format {
                LogFormat::Legacy => info!(target: "audit", "{}", Self::legacy_line(event)),
                LogFormat::Json => match serde_json::to_string(event) {
                    Ok(line) => info!(target: "audit", "{}", line),
                    Err(e) => {
                        metrics::record_audit_error(self.name(), 1);
                        warn!(audit_id = %event.audit_id, error = %e, "Failed to encode audit event");
                    }
                },
            }
        }
    }

    async fn shutdown(&self) {}
}

/// Keeps every delivered event in arrival order
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Deliveries recorded for one audit id, oldest first
    pub fn events_for(&self, audit_id: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.audit_id == audit_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn run(&self, _stop: CancellationToken) -> ApiServerResult<()> {
        Ok(())
    }

    fn process_events(&self, events: &[AuditEvent]) {
        self.events.lock().extend_from_slice(events);
    }

    async fn shutdown(&self) {}
}

/// Delivers to every wrapped backend
pub struct UnionBackend {
    backends: Vec<Arc<dyn AuditBackend>>,
}

impl UnionBackend {
    pub fn new(backends: Vec<Arc<dyn AuditBackend>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl AuditBackend for UnionBackend {
    fn name(&self) -> &str {
        "union"
    }

    fn run(&self, stop: CancellationToken) -> ApiServerResult<()> {
        for backend in &self.backends {
            backend.run(stop.clone())?;
        }
        Ok(())
    }

    fn process_events(&self, events: &[AuditEvent]) {
        for backend in &self.backends {
            backend.process_events(events);
        }
    }

    async fn shutdown(&self) {
        for backend in &self.backends {
            backend.shutdown().await;
        }
    }
}

/// Settings for [`BufferedBackend`]
#[derive(Debug, Clone, Copy)]
pub struct BufferSettings {
    pub buffer_size: usize,
    pub max_batch_size: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            max_batch_size: 400,
        }
    }
}

/// Queues events on a bounded channel and delivers them to `delegate` in batches
/// from a background task. When the channel is full, events are dropped and counted.
pub struct BufferedBackend {
    delegate: Arc<dyn AuditBackend>,
    settings: BufferSettings,
    sender: Mutex<Option<mpsc::Sender<AuditEvent>>>,
    receiver: Mutex<Option<mpsc::Receiver<AuditEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedBackend {
    pub fn new(delegate: Arc<dyn AuditBackend>, settings: BufferSettings) -> Self {
        let (sender, receiver) = mpsc::channel(settings.buffer_size.max(1));
        Self {
            delegate,
            settings,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
        }
    }
}

async fn deliver_batches(
    mut receiver: mpsc::Receiver<AuditEvent>,
    delegate: Arc<dyn AuditBackend>,
    max_batch_size: usize,
) {
    let mut batch = Vec::with_capacity(max_batch_size);
    while let Some(event) = receiver.recv().await {
        batch.push(event);
        while batch.len() < max_batch_size {
            match receiver.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        delegate.process_events(&batch);
        batch.clear();
    }
    debug!(backend = delegate.name(), "Audit buffer drained");
}

#[async_trait]
impl AuditBackend for BufferedBackend {
    fn name(&self) -> &str {
        "buffered"
    }

    fn run(&self, stop: CancellationToken) -> ApiServerResult<()> {
        self.delegate.run(stop)?;

        if let Some(receiver) = self.receiver.lock().take() {
            let handle = tokio::spawn(deliver_batches(
                receiver,
                Arc::clone(&self.delegate),
                self.settings.max_batch_size.max(1),
            ));
            *self.worker.lock() = Some(handle);
        }
        Ok(())
    }

    fn process_events(&self, events: &[AuditEvent]) {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            metrics::record_audit_error(self.name(), events.len() as u64);
            warn!(count = events.len(), "Audit backend shut down, dropping events");
            return;
        };

        for event in events {
            if let Err(e) = sender.try_send(event.clone()) {
                metrics::record_audit_error(self.name(), 1);
                warn!(audit_id = %event.audit_id, error = %e, "Audit buffer rejected event");
            }
        }
    }

    async fn shutdown(&self) {
        // closing the channel lets the worker drain what is queued and exit
        self.sender.lock().take();

        let worker = self.worker.lock().take();
        match worker {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Audit delivery task failed");
                }
            }
            None => {
                // never started: hand any queued events over directly
                let receiver = self.receiver.lock().take();
                if let Some(mut receiver) = receiver {
                    let mut pending = Vec::new();
                    while let Ok(event) = receiver.try_recv() {
                        pending.push(event);
                    }
                    if !pending.is_empty() {
                        self.delegate.process_events(&pending);
                    }
                }
            }
        }

        self.delegate.shutdown().await;
    }
}
