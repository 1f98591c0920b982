//! Collection endpoints: reads from the replica and optimistic writes.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use courtside_engine::{OperationId, Payload, Record, RecordFilter, RecordId, RecordOrder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::feed::Liveness;
use crate::service::Submitted;
use crate::AppState;

/// Create collection routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/collections/{name}", get(list_records).post(create_record))
        .route("/collections/{name}/liveness", get(collection_liveness))
        .route(
            "/collections/{name}/{id}",
            get(get_record).patch(update_record).delete(delete_record),
        )
}

/// Query of a write.
#[derive(Debug, Default, Deserialize)]
pub struct WriteQuery {
    /// Answer only once the backing store has accepted or refused the write
    #[serde(default)]
    pub wait: bool,
}

/// Answer to a write.
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub op_id: OperationId,
    pub id: RecordId,
    /// `pending` until the backing store answered, then `confirmed`
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
}

/// Split list query parameters into an order and equality filters.
///
/// Filter values are read as JSON where they parse, so `court=1` matches
/// the number and `court="1"` the string.
pub fn parse_list_query(params: HashMap<String, String>) -> Result<(RecordFilter, RecordOrder)> {
    let mut order = RecordOrder::new();
    let mut terms: Vec<(String, Value)> = Vec::new();
    for (name, raw) in params {
        if name == "order" {
            order = raw.parse().map_err(|e| AppError::BadRequest(format!("{}", e)))?;
        } else {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            terms.push((name, value));
        }
    }
    terms.sort_by(|a, b| a.0.cmp(&b.0));

    let filter = terms
        .into_iter()
        .fold(RecordFilter::new(), |filter, (name, value)| filter.field_eq(name, value));
    Ok((filter, order))
}

/// GET /collections/{name} - Visible records, optimistic ones included.
async fn list_records(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Record>>> {
    let (filter, order) = parse_list_query(params)?;
    let records = state.sync.list(&name, filter, order).await?;
    Ok(Json(records))
}

/// GET /collections/{name}/{id} - One visible record.
async fn get_record(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<Record>> {
    let id = RecordId::from(id.as_str());
    state
        .sync
        .get(&name, id.clone())
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("record {} in {}", id, name)))
}

/// POST /collections/{name} - Create optimistically.
async fn create_record(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<WriteQuery>,
    Json(payload): Json<Payload>,
) -> Result<(StatusCode, Json<MutationResponse>)> {
    let submitted = state.sync.create_optimistic(&name, payload).await?;
    respond(&state, &name, submitted, query.wait).await
}

/// PATCH /collections/{name}/{id} - Update optimistically.
async fn update_record(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Query(query): Query<WriteQuery>,
    Json(patch): Json<Payload>,
) -> Result<(StatusCode, Json<MutationResponse>)> {
    let submitted = state
        .sync
        .update_optimistic(&name, RecordId::from(id.as_str()), patch)
        .await?;
    respond(&state, &name, submitted, query.wait).await
}

/// DELETE /collections/{name}/{id} - Delete optimistically.
async fn delete_record(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Query(query): Query<WriteQuery>,
) -> Result<(StatusCode, Json<MutationResponse>)> {
    let submitted = state
        .sync
        .delete_optimistic(&name, RecordId::from(id.as_str()))
        .await?;
    respond(&state, &name, submitted, query.wait).await
}

async fn respond(
    state: &AppState,
    collection: &str,
    submitted: Submitted,
    wait: bool,
) -> Result<(StatusCode, Json<MutationResponse>)> {
    if !wait {
        return Ok((
            StatusCode::ACCEPTED,
            Json(MutationResponse {
                op_id: submitted.op_id.clone(),
                id: submitted.id.clone(),
                status: "pending",
                record: submitted.record.clone(),
            }),
        ));
    }

    let op_id = submitted.op_id.clone();
    let provisional = submitted.id.clone();
    submitted.outcome().await?;

    // A provisional id now finds the confirmed record
    let record = state.sync.get(collection, provisional.clone()).await?;
    Ok((
        StatusCode::OK,
        Json(MutationResponse {
            op_id,
            id: record.as_ref().map(|r| r.id.clone()).unwrap_or(provisional),
            status: "confirmed",
            record,
        }),
    ))
}

/// GET /collections/{name}/liveness - Whether the collection is live.
async fn collection_liveness(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Liveness>> {
    Ok(Json(state.sync.liveness(&name).await?))
}
