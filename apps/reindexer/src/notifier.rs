use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::index::PostgresIndex;
use crate::ledger::{ActionState, ReindexActionRow};

#[derive(Clone, Debug)]
pub struct GrafanaTarget {
    pub api_url: String,
    pub api_key: String,
    pub additional_tag: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
enum AnnotationError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("grafana returned http {status}: {body}")]
    Status { status: u16, body: String },
}

/// Best-effort dashboard annotations around each rebuild. Delivery failures are logged
/// here and never reach the caller.
#[derive(Clone)]
pub struct ProgressNotifier {
    target: Option<GrafanaTarget>,
    client: reqwest::Client,
}

impl ProgressNotifier {
    pub fn new(target: Option<GrafanaTarget>) -> Self {
        Self {
            target,
            client: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Returns whether the annotation was delivered.
    pub async fn notify_start(&self, index: &PostgresIndex, action: &ReindexActionRow) -> bool {
        let Some(target) = &self.target else {
            return false;
        };
        let payload = start_annotation(target, index, action);
        self.deliver(target, index, "start", &payload).await
    }

    pub async fn notify_end(&self, index: &PostgresIndex, action: &ReindexActionRow) -> bool {
        let Some(target) = &self.target else {
            return false;
        };
        let payload = end_annotation(target, index, action);
        self.deliver(target, index, "end", &payload).await
    }

    async fn deliver(
        &self,
        target: &GrafanaTarget,
        index: &PostgresIndex,
        phase: &'static str,
        payload: &Value,
    ) -> bool {
        match self.post(target, payload).await {
            Ok(()) => {
                debug!(index = %index.id, phase, "posted reindex annotation");
                true
            }
            Err(error) => {
                warn!(index = %index.id, phase, reason = %error, "failed to post reindex annotation");
                false
            }
        }
    }

    async fn post(&self, target: &GrafanaTarget, payload: &Value) -> Result<(), AnnotationError> {
        let url = format!("{}/api/annotations", target.api_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url.as_str())
            .timeout(target.timeout)
            .header("authorization", format!("Bearer {}", target.api_key))
            .json(payload)
            .send()
            .await
            .map_err(|error| AnnotationError::Transport(error.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(AnnotationError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn tags(target: &GrafanaTarget, index: &PostgresIndex) -> Vec<String> {
    let mut tags = vec!["reindex".to_string()];
    if let Some(extra) = target
        .additional_tag
        .as_deref()
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
    {
        tags.push(extra.to_string());
    }
    tags.push(index.table.clone());
    tags.push(index.id.name.clone());
    tags
}

fn start_annotation(target: &GrafanaTarget, index: &PostgresIndex, action: &ReindexActionRow) -> Value {
    json!({
        "time": action.action_start.timestamp_millis(),
        "tags": tags(target, index),
        "text": format!("Started reindex of {}", index.id),
    })
}

fn end_annotation(target: &GrafanaTarget, index: &PostgresIndex, action: &ReindexActionRow) -> Value {
    let verb = match action.state {
        ActionState::Finished => "Finished",
        ActionState::Failed => "Failed",
        ActionState::Started => "Ended",
    };
    let end = action.action_end.unwrap_or(action.action_start);
    json!({
        "time": action.action_start.timestamp_millis(),
        "timeEnd": end.timestamp_millis(),
        "isRegion": true,
        "tags": tags(target, index),
        "text": format!("{verb} reindex of {}", index.id),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::post,
    };
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tokio::net::TcpListener;
    use tokio::sync::{Mutex, oneshot};

    use super::*;
    use crate::index::IndexId;

    #[derive(Clone)]
    struct StubState {
        status: StatusCode,
        received: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    struct StubHandle {
        base_url: String,
        received: Arc<Mutex<Vec<(Option<String>, Value)>>>,
        shutdown: oneshot::Sender<()>,
    }

    async fn spawn_grafana_stub(status: StatusCode) -> Result<StubHandle> {
        let state = StubState {
            status,
            received: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/api/annotations", post(annotations))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Ok(StubHandle {
            base_url: format!("http://{addr}"),
            received: state.received,
            shutdown: shutdown_tx,
        })
    }

    async fn annotations(
        State(state): State<StubState>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        state.received.lock().await.push((auth, body));
        (state.status, Json(json!({ "id": 1 })))
    }

    fn target(api_url: String) -> GrafanaTarget {
        GrafanaTarget {
            api_url,
            api_key: "grafana-key".to_string(),
            additional_tag: Some("gprd".to_string()),
            timeout: Duration::from_secs(2),
        }
    }

    fn sample() -> Result<(PostgresIndex, ReindexActionRow)> {
        let start = Utc
            .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("bad timestamp"))?;
        let index = PostgresIndex {
            id: IndexId::new("public", "orders_idx"),
            table: "orders".to_string(),
            definition: "CREATE INDEX orders_idx ON public.orders USING btree (id)".to_string(),
            access_method: "btree".to_string(),
            is_unique: false,
            is_valid: true,
            is_expression: false,
            is_exclusion: false,
            is_partitioned: false,
            ondisk_size_bytes: 800,
            bloat_estimate_bytes: 300,
        };
        let action = ReindexActionRow {
            id: 7,
            index_identifier: "public.orders_idx".to_string(),
            state: ActionState::Finished,
            action_start: start,
            action_end: Some(start + ChronoDuration::minutes(5)),
            ondisk_size_bytes_start: 800,
            ondisk_size_bytes_end: Some(500),
            bloat_estimate_bytes_start: 300,
            error_code: None,
            error_message: None,
        };
        Ok((index, action))
    }

    #[tokio::test]
    async fn posts_start_and_region_annotations() -> Result<()> {
        let stub = spawn_grafana_stub(StatusCode::OK).await?;
        let notifier = ProgressNotifier::new(Some(target(format!("{}/", stub.base_url))));
        let (index, action) = sample()?;

        assert!(notifier.notify_start(&index, &action).await);
        assert!(notifier.notify_end(&index, &action).await);

        let received = stub.received.lock().await.clone();
        assert_eq!(received.len(), 2);
        let (auth, start) = &received[0];
        assert_eq!(auth.as_deref(), Some("Bearer grafana-key"));
        assert_eq!(
            start.get("tags"),
            Some(&json!(["reindex", "gprd", "orders", "orders_idx"]))
        );
        assert_eq!(
            start.get("time").and_then(Value::as_i64),
            Some(action.action_start.timestamp_millis())
        );
        assert!(start.get("timeEnd").is_none());

        let (_, end) = &received[1];
        assert_eq!(end.get("isRegion").and_then(Value::as_bool), Some(true));
        assert_eq!(
            end.get("timeEnd").and_then(Value::as_i64),
            action.action_end.map(|end| end.timestamp_millis())
        );
        assert_eq!(
            end.get("text").and_then(Value::as_str),
            Some("Finished reindex of public.orders_idx")
        );

        let _ = stub.shutdown.send(());
        Ok(())
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() -> Result<()> {
        let stub = spawn_grafana_stub(StatusCode::INTERNAL_SERVER_ERROR).await?;
        let notifier = ProgressNotifier::new(Some(target(stub.base_url.clone())));
        let (index, action) = sample()?;

        assert!(!notifier.notify_start(&index, &action).await);
        assert_eq!(stub.received.lock().await.len(), 1);
        let _ = stub.shutdown.send(());

        // Nothing is listening on a closed port either.
        let unreachable = ProgressNotifier::new(Some(target("http://127.0.0.1:9".to_string())));
        assert!(!unreachable.notify_end(&index, &action).await);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_notifier_does_nothing() -> Result<()> {
        let notifier = ProgressNotifier::disabled();
        let (index, action) = sample()?;

        assert!(!notifier.is_enabled());
        assert!(!notifier.notify_start(&index, &action).await);
        assert!(!notifier.notify_end(&index, &action).await);
        Ok(())
    }
}
