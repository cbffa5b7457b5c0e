//! Workflow events and their observers.
//!
//! The engine reports progress through an injected [`Observer`]; nothing in
//! the workflow holds a global client. [`LangfuseObserver`] forwards events to
//! a Langfuse server as ingestion batches on a background task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use specextract_shared::{LangfuseSettings, Result, SpecExtractError};

use crate::graph::{GraphMode, StageId};
use crate::swarm::{AgentRole, RefinementStatus};

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        document: String,
        mode: GraphMode,
        model: String,
    },
    StageStarted {
        run_id: Uuid,
        stage: StageId,
    },
    StageFinished {
        run_id: Uuid,
        stage: StageId,
        elapsed: Duration,
        error: Option<String>,
    },
    SwarmTurn {
        run_id: Uuid,
        session_id: String,
        role: AgentRole,
        turn: u32,
        handoff: bool,
    },
    RefinementFinished {
        run_id: Uuid,
        session_id: String,
        status: RefinementStatus,
        turns: u32,
    },
    RunFinished {
        run_id: Uuid,
        document: String,
        elapsed: Duration,
        error: Option<String>,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageFinished { run_id, .. }
            | Self::SwarmTurn { run_id, .. }
            | Self::RefinementFinished { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }
}

/// Receives workflow events. Must not block.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &WorkflowEvent);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl Observer for SilentObserver {
    fn on_event(&self, _event: &WorkflowEvent) {}
}

/// Forwards every event to each inner observer in order.
#[derive(Default, Clone)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl Observer for FanoutObserver {
    fn on_event(&self, event: &WorkflowEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Observer for RecordingObserver {
    fn on_event(&self, event: &WorkflowEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Langfuse
// ---------------------------------------------------------------------------

const MAX_BATCH: usize = 50;

/// Ships events to Langfuse's public ingestion API.
pub struct LangfuseObserver {
    tx: Mutex<Option<mpsc::UnboundedSender<(DateTime<Utc>, WorkflowEvent)>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
struct LangfuseClient {
    client: reqwest::Client,
    settings: LangfuseSettings,
}

impl LangfuseClient {
    fn new(settings: LangfuseSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("specextract/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SpecExtractError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.settings
            .host
            .join(path)
            .map_err(|e| SpecExtractError::config(format!("invalid Langfuse host: {e}")))
    }

    async fn auth_check(&self) -> Result<bool> {
        let url = self.endpoint("/api/public/projects")?;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.settings.public_key, Some(&self.settings.secret_key))
            .send()
            .await
            .map_err(|e| SpecExtractError::Network(format!("Langfuse auth check failed: {e}")))?;
        Ok(response.status().is_success())
    }

    async fn ingest(&self, batch: Vec<Value>) -> Result<()> {
        let url = self.endpoint("/api/public/ingestion")?;
        let response = self
            .client
            .post(url)
            .basic_auth(&self.settings.public_key, Some(&self.settings.secret_key))
            .json(&json!({ "batch": batch }))
            .send()
            .await
            .map_err(|e| SpecExtractError::Network(format!("Langfuse ingestion failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SpecExtractError::Network(format!(
                "Langfuse ingestion returned HTTP {status}"
            )));
        }
        Ok(())
    }
}

impl LangfuseObserver {
    /// Spawn the background sender. Requires a running tokio runtime.
    pub fn spawn(settings: LangfuseSettings) -> Result<Self> {
        let client = LangfuseClient::new(settings)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward_events(client, rx));
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Verify the configured keys. Never fails processing: the result is
    /// only logged by callers.
    pub async fn auth_check(settings: &LangfuseSettings) -> Result<bool> {
        LangfuseClient::new(settings.clone())?.auth_check().await
    }

    /// Stop accepting events and wait until everything queued was sent.
    pub async fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Langfuse forwarder task failed");
            }
        }
    }
}

impl Observer for LangfuseObserver {
    fn on_event(&self, event: &WorkflowEvent) {
        if let Ok(tx) = self.tx.lock() {
            if let Some(tx) = tx.as_ref() {
                let _ = tx.send((Utc::now(), event.clone()));
            }
        }
    }
}

async fn forward_events(
    client: LangfuseClient,
    mut rx: mpsc::UnboundedReceiver<(DateTime<Utc>, WorkflowEvent)>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::new();
        batch.extend(ingestion_entry(first.0, &first.1));
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok((at, event)) => batch.extend(ingestion_entry(at, &event)),
                Err(_) => break,
            }
        }
        if batch.is_empty() {
            continue;
        }

        let count = batch.len();
        match client.ingest(batch).await {
            Ok(()) => debug!(count, "sent Langfuse batch"),
            Err(e) => warn!(error = %e, count, "dropping Langfuse batch"),
        }
    }
    info!("Langfuse forwarder stopped");
}

/// Map one event to a Langfuse ingestion entry. Stage starts are folded into
/// the span written when the stage finishes.
fn ingestion_entry(at: DateTime<Utc>, event: &WorkflowEvent) -> Option<Value> {
    let timestamp = at.to_rfc3339();
    let trace_id = event.run_id().to_string();

    let (kind, body) = match event {
        WorkflowEvent::RunStarted {
            document,
            mode,
            model,
            ..
        } => (
            "trace-create",
            json!({
                "id": trace_id,
                "name": "process_document",
                "timestamp": timestamp,
                "input": { "document": document },
                "metadata": { "mode": mode.to_string(), "model": model },
            }),
        ),
        WorkflowEvent::StageStarted { .. } => return None,
        WorkflowEvent::StageFinished {
            stage,
            elapsed,
            error,
            ..
        } => {
            let start = at - chrono::Duration::from_std(*elapsed).unwrap_or(chrono::Duration::zero());
            let mut body = json!({
                "id": Uuid::now_v7().to_string(),
                "traceId": trace_id,
                "name": stage.as_str(),
                "startTime": start.to_rfc3339(),
                "endTime": timestamp,
            });
            if let Some(error) = error {
                body["level"] = json!("ERROR");
                body["statusMessage"] = json!(error);
            }
            ("span-create", body)
        }
        WorkflowEvent::SwarmTurn {
            session_id,
            role,
            turn,
            handoff,
            ..
        } => (
            "event-create",
            json!({
                "id": Uuid::now_v7().to_string(),
                "traceId": trace_id,
                "name": "swarm_turn",
                "startTime": timestamp,
                "metadata": {
                    "session_id": session_id,
                    "role": role.as_str(),
                    "turn": turn,
                    "handoff": handoff,
                },
            }),
        ),
        WorkflowEvent::RefinementFinished {
            session_id,
            status,
            turns,
            ..
        } => {
            let level = match status {
                RefinementStatus::Exhausted => "WARNING",
                RefinementStatus::Converged => "DEFAULT",
            };
            (
                "event-create",
                json!({
                    "id": Uuid::now_v7().to_string(),
                    "traceId": trace_id,
                    "name": "refinement_finished",
                    "startTime": timestamp,
                    "level": level,
                    "metadata": {
                        "session_id": session_id,
                        "status": status.as_str(),
                        "turns": turns,
                    },
                }),
            )
        }
        WorkflowEvent::RunFinished {
            document,
            elapsed,
            error,
            ..
        } => (
            "trace-create",
            json!({
                "id": trace_id,
                "name": "process_document",
                "timestamp": timestamp,
                "output": {
                    "document": document,
                    "ok": error.is_none(),
                    "error": error,
                    "elapsed_ms": elapsed.as_millis() as u64,
                },
            }),
        ),
    };

    Some(json!({
        "id": Uuid::now_v7().to_string(),
        "type": kind,
        "timestamp": timestamp,
        "body": body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(host: &str) -> LangfuseSettings {
        LangfuseSettings {
            public_key: "pk-test".into(),
            secret_key: "sk-test".into(),
            host: Url::parse(host).unwrap(),
        }
    }

    fn started(run_id: Uuid) -> WorkflowEvent {
        WorkflowEvent::RunStarted {
            run_id,
            document: "spec.html".into(),
            mode: GraphMode::Direct,
            model: "m".into(),
        }
    }

    #[test]
    fn fanout_reaches_every_observer() {
        let a = Arc::new(RecordingObserver::default());
        let b = Arc::new(RecordingObserver::default());
        let fanout = FanoutObserver::new().with(a.clone()).with(b.clone());
        assert_eq!(fanout.len(), 2);

        fanout.on_event(&started(Uuid::now_v7()));
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[test]
    fn stage_span_carries_error_level() {
        let run_id = Uuid::now_v7();
        let entry = ingestion_entry(
            Utc::now(),
            &WorkflowEvent::StageFinished {
                run_id,
                stage: StageId::Extract,
                elapsed: Duration::from_millis(1500),
                error: Some("schema validation error: bad".into()),
            },
        )
        .unwrap();
        assert_eq!(entry["type"], "span-create");
        assert_eq!(entry["body"]["traceId"], run_id.to_string());
        assert_eq!(entry["body"]["name"], "extract");
        assert_eq!(entry["body"]["level"], "ERROR");
    }

    #[test]
    fn stage_start_is_not_sent() {
        let event = WorkflowEvent::StageStarted {
            run_id: Uuid::now_v7(),
            stage: StageId::Validate,
        };
        assert!(ingestion_entry(Utc::now(), &event).is_none());
    }

    #[tokio::test]
    async fn auth_check_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/public/projects"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        assert!(LangfuseObserver::auth_check(&settings(&server.uri())).await.unwrap());
    }

    #[tokio::test]
    async fn auth_check_rejected_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/public/projects"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(!LangfuseObserver::auth_check(&settings(&server.uri())).await.unwrap());
    }

    #[tokio::test]
    async fn events_are_flushed_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/public/ingestion"))
            .respond_with(ResponseTemplate::new(207).set_body_json(json!({ "successes": [], "errors": [] })))
            .mount(&server)
            .await;

        let observer = LangfuseObserver::spawn(settings(&server.uri())).unwrap();
        let run_id = Uuid::now_v7();
        observer.on_event(&started(run_id));
        observer.on_event(&WorkflowEvent::RunFinished {
            run_id,
            document: "spec.html".into(),
            elapsed: Duration::from_millis(10),
            error: None,
        });
        observer.shutdown().await;

        let requests = server.received_requests().await.unwrap();
        let entries: usize = requests
            .iter()
            .map(|r| {
                let body: Value = serde_json::from_slice(&r.body).unwrap();
                body["batch"].as_array().unwrap().len()
            })
            .sum();
        assert_eq!(entries, 2);

        // Events after shutdown are dropped silently
        observer.on_event(&started(run_id));
    }
}
