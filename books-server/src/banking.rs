use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use books_allocate::AdjustmentInput;
use books_allocate::Allocation;
use books_allocate::AllocationRequest;
use books_ledger::JournalEntry;
use books_reconcile::MatchSuggestion;
use books_reconcile::SuggestionScoring;
use books_reconcile::suggest_for_transaction;
use chrono::Utc;
use serde::Deserialize;

use crate::ApiError;
use crate::AppState;
use crate::acting_user;
use crate::tenant_from_headers;

#[derive(Debug, Deserialize)]
pub(crate) struct AllocateBody {
    allocations: Vec<Allocation>,
    #[serde(default)]
    fees: Option<AdjustmentInput>,
    #[serde(default)]
    rounding: Option<AdjustmentInput>,
    #[serde(default)]
    overpayment: Option<AdjustmentInput>,
    #[serde(default)]
    tolerance_minor: Option<i64>,
    #[serde(default)]
    operation_id: Option<String>,
}

pub(crate) async fn allocate_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tx_id): Path<String>,
    Json(body): Json<AllocateBody>,
) -> Result<Json<JournalEntry>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let request = AllocationRequest {
        bank_transaction_id: tx_id,
        allocations: body.allocations,
        fees: body.fees,
        rounding: body.rounding,
        overpayment: body.overpayment,
        user: acting_user(&headers),
        tolerance_minor: body.tolerance_minor,
        operation_id: body.operation_id,
    };
    let entry = books_allocate::allocate(state.store.as_ref(), &tenant.id, request)?;
    state.stories.mark_dirty(&tenant.id, Utc::now())?;
    Ok(Json(entry))
}

pub(crate) async fn suggestions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tx_id): Path<String>,
) -> Result<Json<Vec<MatchSuggestion>>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let suggestions = suggest_for_transaction(
        state.store.as_ref(),
        &tenant.id,
        &tx_id,
        &[],
        &SuggestionScoring::default(),
    )?;
    Ok(Json(suggestions))
}
