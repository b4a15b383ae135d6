use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use books_advisor::CriticInput;
use books_advisor::CriticVerdict;
use books_advisor::audit_high_risk_transaction;
use books_ledger::AuditVerdict;
use books_ledger::BankTransaction;
use books_ledger::JournalEntry;
use books_ledger::Tenant;
use books_ledger::TransactionAudit;
use books_reconcile::PeriodBucket;
use books_reconcile::SessionOverview;
use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::ApiError;
use crate::AppState;
use crate::acting_user;
use crate::is_staff;
use crate::tenant_from_headers;

#[derive(Debug, Serialize)]
pub(crate) struct BankAccountPayload {
    id: String,
    name: String,
    currency: String,
}

pub(crate) async fn list_accounts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<BankAccountPayload>>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let accounts = state
        .store
        .list_bank_accounts(&tenant.id)?
        .into_iter()
        .filter(|account| account.is_active)
        .map(|account| BankAccountPayload {
            id: account.id,
            name: account.name,
            currency: tenant.currency.clone(),
        })
        .collect();
    Ok(Json(accounts))
}

pub(crate) async fn list_periods(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<PeriodBucket>>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let periods = state.sessions.periods_for_account(
        &tenant.id,
        &account_id,
        Utc::now().date_naive(),
    )?;
    Ok(Json(periods))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionQuery {
    account: String,
    #[serde(default)]
    start: Option<NaiveDate>,
    #[serde(default)]
    end: Option<NaiveDate>,
}

fn current_month_window(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = today.with_day(1).unwrap_or(today);
    let end = if start.month() == 12 {
        NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
    }
    .and_then(|next| next.pred_opt())
    .unwrap_or(today);
    (start, end)
}

pub(crate) async fn resolve_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SessionOverview>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let (start, end) = match (query.start, query.end) {
        (Some(start), Some(end)) => (start, end),
        (None, None) => current_month_window(Utc::now().date_naive()),
        _ => return Err(ApiError::bad_request("start and end must be provided together")),
    };
    let session = state
        .sessions
        .resolve_session(&tenant.id, &query.account, start, end)?;
    let overview = state.sessions.overview(&tenant.id, &session.id)?;
    Ok(Json(overview))
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatementBalanceBody {
    #[serde(default)]
    opening_balance_minor: Option<i64>,
    #[serde(default)]
    statement_ending_balance_minor: Option<i64>,
}

pub(crate) async fn set_statement_balance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<StatementBalanceBody>,
) -> Result<Json<SessionOverview>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let overview = state.sessions.set_statement_balance(
        &tenant.id,
        &session_id,
        body.opening_balance_minor,
        body.statement_ending_balance_minor,
    )?;
    Ok(Json(overview))
}

#[derive(Debug, Deserialize)]
pub(crate) struct MatchBody {
    transaction_id: String,
    journal_entry_id: String,
}

/// Run the high-risk critic for a freshly reconciled transaction when the
/// companion is enabled. Advisory only; the match has already been
/// committed by the time this runs.
async fn maybe_audit_high_risk(
    state: &AppState,
    tenant: &Tenant,
    tx_id: &str,
    is_bulk_adjustment: bool,
) -> Result<(), ApiError> {
    if !tenant.companion_enabled {
        return Ok(());
    }
    let tx: BankTransaction = state.store.bank_transaction(&tenant.id, &tx_id.to_string())?;
    if tx.high_risk_audit.is_some() {
        return Ok(());
    }
    if tx.abs_amount_minor() <= books_advisor::CRITIC_AMOUNT_THRESHOLD_MINOR && !is_bulk_adjustment
    {
        return Ok(());
    }

    let mut accounts: Vec<String> = Vec::new();
    let bank_account = state.store.bank_account(&tenant.id, &tx.bank_account_id)?;
    if let Some(account_id) = &bank_account.ledger_account_id
        && let Ok(account) = state.store.account(&tenant.id, account_id)
    {
        accounts.push(account.code);
    }
    if let Some(account_id) = &tx.category_account_id
        && let Ok(account) = state.store.account(&tenant.id, account_id)
    {
        accounts.push(account.code);
    }

    let report = audit_high_risk_transaction(
        state.advisor.as_ref(),
        state.config.advisor_timeout,
        &CriticInput {
            amount_minor: tx.abs_amount_minor(),
            currency: tenant.currency.clone(),
            accounts,
            memo: tx.description.clone(),
            source: "bank_reconciliation".into(),
            is_bulk_adjustment,
        },
    )
    .await;

    let verdict = match report.verdict {
        CriticVerdict::Ok => AuditVerdict::Ok,
        CriticVerdict::Warn => AuditVerdict::Warn,
        CriticVerdict::Fail => AuditVerdict::Fail,
    };
    state.sessions.attach_high_risk_audit(
        &tenant.id,
        &tx.id,
        TransactionAudit {
            verdict,
            reasons: report.reasons,
            created_at: Utc::now(),
        },
    )?;
    Ok(())
}

pub(crate) async fn match_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<MatchBody>,
) -> Result<Json<SessionOverview>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let user = acting_user(&headers);
    state.sessions.match_transaction(
        &tenant.id,
        &session_id,
        &body.transaction_id,
        &body.journal_entry_id,
        user.as_deref(),
    )?;
    maybe_audit_high_risk(&state, &tenant, &body.transaction_id, false).await?;
    state.stories.mark_dirty(&tenant.id, Utc::now())?;
    let overview = state.sessions.overview(&tenant.id, &session_id)?;
    Ok(Json(overview))
}

#[derive(Debug, Deserialize)]
pub(crate) struct TransactionBody {
    transaction_id: String,
}

pub(crate) async fn unmatch_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<TransactionBody>,
) -> Result<Json<SessionOverview>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let overview =
        state
            .sessions
            .unmatch_transaction(&tenant.id, &session_id, &body.transaction_id)?;
    state.stories.mark_dirty(&tenant.id, Utc::now())?;
    Ok(Json(overview))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExcludeBody {
    transaction_id: String,
    #[serde(default = "default_excluded")]
    excluded: bool,
}

fn default_excluded() -> bool {
    true
}

pub(crate) async fn exclude_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<ExcludeBody>,
) -> Result<Json<SessionOverview>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let overview = state.sessions.set_excluded(
        &tenant.id,
        &session_id,
        &body.transaction_id,
        body.excluded,
    )?;
    Ok(Json(overview))
}

pub(crate) async fn complete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<SessionOverview>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let overview = state.sessions.complete(&tenant.id, &session_id)?;
    state.stories.mark_dirty(&tenant.id, Utc::now())?;
    Ok(Json(overview))
}

pub(crate) async fn reopen_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<SessionOverview>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    if !is_staff(&headers) {
        return Err(ApiError::forbidden("Reopening a session is a staff action"));
    }
    let overview = state.sessions.reopen(&tenant.id, &session_id)?;
    Ok(Json(overview))
}

pub(crate) async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    if !is_staff(&headers) {
        return Err(ApiError::forbidden("Deleting a session is a staff action"));
    }
    state.sessions.delete_session(&tenant.id, &session_id)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "detail": "Session deleted. You can now start a fresh reconciliation for this period.",
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct AddAsNewBody {
    transaction_id: String,
}

pub(crate) async fn add_as_new(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AddAsNewBody>,
) -> Result<Json<JournalEntry>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let user = acting_user(&headers);
    let entry = state
        .sessions
        .add_as_new(&tenant.id, &body.transaction_id, user.as_deref())?;
    maybe_audit_high_risk(&state, &tenant, &body.transaction_id, false).await?;
    state.stories.mark_dirty(&tenant.id, Utc::now())?;
    Ok(Json(entry))
}
