//! Control API handlers.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Form,
};
use loadfleet_core::{
    collection_topic, CollectionId, LoadfleetError, Payload, PlanEnginesConfig, PlanId,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::files::{prepare_start, required_engines, FormFileKey, UploadedFile, ENGINE_DATA_FIELD};
use crate::progress::Progress;
use crate::server::AppState;

/// Error returned by a handler: a status and a plain-text message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// An error answered with `status`.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// A `400 Bad Request`.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<LoadfleetError> for ApiError {
    fn from(error: LoadfleetError) -> Self {
        let status = match &error {
            LoadfleetError::Precondition(_) | LoadfleetError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "Request failed");
        }
        (self.status, self.message).into_response()
    }
}

/// `?engines=N` on the health check.
#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    engines: usize,
}

/// Optional `?engines=N` on the plan progress query.
#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    engines: Option<usize>,
}

/// `?plans=1,2` on collection terminate.
#[derive(Debug, Deserialize)]
pub struct TermQuery {
    plans: String,
}

/// Engine self-report form body.
#[derive(Debug, Deserialize)]
pub struct ReportForm {
    running: bool,
}

/// `POST /api/collections/{collection_id}`
pub async fn trigger_collection(
    State(state): State<Arc<AppState>>,
    Path(collection_id): Path<CollectionId>,
    mut multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let mut configs: Option<BTreeMap<PlanId, PlanEnginesConfig>> = None;
    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == ENGINE_DATA_FIELD {
            let raw = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            configs = Some(
                serde_json::from_str(&raw)
                    .map_err(|e| ApiError::bad_request(format!("invalid engine_data: {e}")))?,
            );
            continue;
        }
        let key: FormFileKey = name.parse()?;
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request(format!("field {name} carries no file")))?;
        let content = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?
            .to_vec();
        uploads.push(UploadedFile {
            key,
            filename,
            content,
        });
    }
    let configs = configs.ok_or_else(|| ApiError::bad_request("missing engine_data"))?;

    let topic = collection_topic(collection_id);
    let connected = state.broker.subscriber_count(&topic).await;
    let required = required_engines(&configs);
    if connected != required {
        warn!(collection_id, connected, required, "Trigger rejected");
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("engine number mismatch, connected {connected}, required {required}"),
        ));
    }

    let payload = prepare_start(&state.files_root, collection_id, &configs, &uploads).await?;
    for (plan_id, pec) in &configs {
        state
            .progress
            .add(Progress::new(collection_id, *plan_id, pec.engine_count()));
    }
    state.broker.broadcast(&topic, &payload).await?;
    info!(collection_id, plans = configs.len(), engines = required, "Collection triggered");
    Ok(StatusCode::OK)
}

/// `GET /api/collections/{collection_id}?engines=N`
pub async fn collection_health(
    State(state): State<Arc<AppState>>,
    Path(collection_id): Path<CollectionId>,
    Query(query): Query<HealthQuery>,
) -> StatusCode {
    let subscribers = state
        .broker
        .subscriber_count(&collection_topic(collection_id))
        .await;
    let endpoints = state.inventory.count_for_collection(collection_id);
    if subscribers == query.engines && endpoints == query.engines {
        return StatusCode::OK;
    }
    debug!(
        collection_id,
        expected = query.engines,
        subscribers,
        endpoints,
        "Collection not healthy"
    );
    StatusCode::NOT_FOUND
}

/// `DELETE /api/collections/{collection_id}?plans=1,2,3`
pub async fn term_collection(
    State(state): State<Arc<AppState>>,
    Path(collection_id): Path<CollectionId>,
    Query(query): Query<TermQuery>,
) -> Result<StatusCode, ApiError> {
    let plan_ids = query
        .plans
        .split(',')
        .map(|raw| {
            raw.trim()
                .parse::<PlanId>()
                .map_err(|_| ApiError::bad_request(format!("invalid plan id '{raw}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    stop_plans(&state, collection_id, plan_ids).await?;
    Ok(StatusCode::OK)
}

/// `DELETE /api/collections/{collection_id}/{plan_id}`
pub async fn term_plan(
    State(state): State<Arc<AppState>>,
    Path((collection_id, plan_id)): Path<(CollectionId, PlanId)>,
) -> Result<StatusCode, ApiError> {
    stop_plans(&state, collection_id, vec![plan_id]).await?;
    Ok(StatusCode::OK)
}

async fn stop_plans(
    state: &Arc<AppState>,
    collection_id: CollectionId,
    plan_ids: Vec<PlanId>,
) -> Result<(), ApiError> {
    let payload = Payload::stop(plan_ids.iter().copied());
    state
        .broker
        .broadcast(&collection_topic(collection_id), &payload)
        .await?;
    for plan_id in plan_ids {
        let progress = state.progress.clone();
        tokio::spawn(async move { progress.terminate(collection_id, plan_id).await });
    }
    Ok(())
}

/// `GET /api/collections/{collection_id}/{plan_id}?engines=N`
pub async fn plan_progress(
    State(state): State<Arc<AppState>>,
    Path((collection_id, plan_id)): Path<(CollectionId, PlanId)>,
    Query(query): Query<ProgressQuery>,
) -> StatusCode {
    let Some(progress) = state.progress.get(collection_id, plan_id) else {
        return StatusCode::NOT_FOUND;
    };
    if query.engines.is_some_and(|n| n != progress.len()) {
        return StatusCode::NOT_FOUND;
    }
    if progress.is_running() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// `PUT /api/collections/{collection_id}/{plan_id}/{engine_id}` with form `running=true|false`
pub async fn engine_report(
    State(state): State<Arc<AppState>>,
    Path((collection_id, plan_id, engine_id)): Path<(CollectionId, PlanId, usize)>,
    Form(form): Form<ReportForm>,
) -> StatusCode {
    state
        .progress
        .set_engine_status(collection_id, plan_id, engine_id, form.running);
    debug!(collection_id, plan_id, engine_id, running = form.running, "Engine report");
    StatusCode::OK
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let e: ApiError = LoadfleetError::Precondition("missing".into()).into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        let e: ApiError = LoadfleetError::Storage("disk".into()).into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
