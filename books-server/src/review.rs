use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use books_advisor::reason_about_bank_review;
use books_advisor::reason_about_books_review;
use books_advisor::reason_about_invoices_run;
use books_advisor::reason_about_receipts_run;
use books_companion::IssueDraft;
use books_ledger::SUSPENSE_ACCOUNT_CODE;
use books_ledger::Tenant;
use books_ledger::ensure_default_accounts;
use books_review::AdvisorOutcome;
use books_review::ReviewItem;
use books_review::ReviewRun;
use books_review::RunKind;
use books_review::bank::BankLineInput;
use books_review::bank::advisor_transactions;
use books_review::bank::run_bank_review;
use books_review::books::advisor_journal_samples;
use books_review::books::run_books_review;
use books_review::invoices::InvoiceInput;
use books_review::invoices::run_invoices_review;
use books_review::receipts::ReceiptInput;
use books_review::receipts::advisor_documents;
use books_review::receipts::run_receipts_review;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::ApiError;
use crate::AppState;
use crate::tenant_from_headers;

const ADVISOR_DOCUMENT_LIMIT: usize = 20;
const ADVISOR_TRANSACTION_LIMIT: usize = 15;
const ADVISOR_JOURNAL_SAMPLE_LIMIT: usize = 20;

#[derive(Debug, Serialize)]
pub(crate) struct RunDetail {
    run: ReviewRun,
    items: Vec<ReviewItem>,
}

fn persist_issues(
    state: &AppState,
    tenant: &Tenant,
    drafts: Vec<IssueDraft>,
) -> Result<(), ApiError> {
    if drafts.is_empty() {
        return Ok(());
    }
    let now = Utc::now();
    state.issues.bulk_insert(&tenant.id, drafts, now)?;
    state.stories.mark_dirty(&tenant.id, now)?;
    Ok(())
}

/// Persist deterministic results, then consult the advisor and store its
/// outcome in a second pass. Advisor failures leave the fields empty.
async fn finish_run(
    state: &AppState,
    tenant: &Tenant,
    run: ReviewRun,
    items: Vec<ReviewItem>,
    drafts: Vec<IssueDraft>,
    advice_inputs: Option<(Value, Vec<Value>)>,
) -> Result<RunDetail, ApiError> {
    let kind = run.kind;
    let run = state.runs.insert_run(run, items)?;
    persist_issues(state, tenant, drafts)?;

    if tenant.companion_enabled
        && let Some((metrics, subset)) = advice_inputs
    {
        let timeout = state.config.advisor_timeout;
        let client = state.advisor.as_ref();
        let outcome = match kind {
            RunKind::Receipts => reason_about_receipts_run(client, timeout, &metrics, &subset)
                .await
                .map(|advice| AdvisorOutcome {
                    explanations: advice.explanations,
                    rankings: serde_json::to_value(advice.ranked_documents)
                        .unwrap_or(Value::Null),
                    classifications: serde_json::to_value(advice.suggested_classifications)
                        .unwrap_or(Value::Null),
                    followups: advice.suggested_followups,
                }),
            RunKind::Invoices => reason_about_invoices_run(client, timeout, &metrics, &subset)
                .await
                .map(|advice| AdvisorOutcome {
                    explanations: advice.explanations,
                    rankings: serde_json::to_value(advice.ranked_documents)
                        .unwrap_or(Value::Null),
                    classifications: serde_json::to_value(advice.suggested_classifications)
                        .unwrap_or(Value::Null),
                    followups: advice.suggested_followups,
                }),
            RunKind::BankReview => reason_about_bank_review(client, timeout, &metrics, &subset)
                .await
                .map(|advice| AdvisorOutcome {
                    explanations: advice.explanations,
                    rankings: serde_json::to_value(advice.ranked_transactions)
                        .unwrap_or(Value::Null),
                    classifications: Value::Null,
                    followups: advice.suggested_followups,
                }),
            RunKind::BooksReview => {
                let findings = serde_json::to_value(&run.findings).unwrap_or(Value::Null);
                reason_about_books_review(client, timeout, &metrics, &findings, &subset)
                    .await
                    .map(|advice| AdvisorOutcome {
                        explanations: advice.explanations,
                        rankings: serde_json::to_value(advice.ranked_issues)
                            .unwrap_or(Value::Null),
                        classifications: Value::Null,
                        followups: advice.suggested_checks,
                    })
            }
        };
        if let Some(outcome) = outcome {
            state.runs.attach_advice(&tenant.id, &run.id, outcome)?;
        }
    }

    let (run, items) = state.runs.run(&tenant.id, &run.id)?;
    Ok(RunDetail { run, items })
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReceiptsRunBody {
    documents: Vec<ReceiptInput>,
    #[serde(default)]
    as_of: Option<NaiveDate>,
}

pub(crate) async fn run_receipts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ReceiptsRunBody>,
) -> Result<Json<RunDetail>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let defaults = ensure_default_accounts(state.store.as_ref(), &tenant.id)?;
    let today = body.as_of.unwrap_or_else(|| Utc::now().date_naive());

    let (run, items) = run_receipts_review(&tenant, &defaults, &body.documents, today);
    let drafts = books_companion::build_receipts_issues(&run);
    let advice_inputs = Some((
        run.metrics.clone(),
        advisor_documents(&items, ADVISOR_DOCUMENT_LIMIT),
    ));
    let detail = finish_run(&state, &tenant, run, items, drafts, advice_inputs).await?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
pub(crate) struct InvoicesRunBody {
    documents: Vec<InvoiceInput>,
    #[serde(default)]
    as_of: Option<NaiveDate>,
}

pub(crate) async fn run_invoices(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<InvoicesRunBody>,
) -> Result<Json<RunDetail>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let defaults = ensure_default_accounts(state.store.as_ref(), &tenant.id)?;
    let today = body.as_of.unwrap_or_else(|| Utc::now().date_naive());

    let (run, items) = run_invoices_review(&tenant, &defaults, &body.documents, today);
    let drafts = books_companion::build_invoices_issues(&run);
    let advice_inputs = Some((
        run.metrics.clone(),
        advisor_documents(&items, ADVISOR_DOCUMENT_LIMIT),
    ));
    let detail = finish_run(&state, &tenant, run, items, drafts, advice_inputs).await?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
pub(crate) struct BooksRunBody {
    period_start: NaiveDate,
    period_end: NaiveDate,
}

pub(crate) async fn run_books(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BooksRunBody>,
) -> Result<Json<RunDetail>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    if body.period_start > body.period_end {
        return Err(ApiError::bad_request("period_start must be on or before period_end"));
    }
    let entries = state.store.list_entries(&tenant.id)?;
    let accounts = state.store.list_accounts(&tenant.id)?;

    let run = run_books_review(&tenant, &entries, body.period_start, body.period_end);

    let suspense_balance = match state
        .store
        .account_by_code(&tenant.id, SUSPENSE_ACCOUNT_CODE)?
    {
        Some(account) => state
            .store
            .balance_as_of(&tenant.id, &account.id, body.period_end)?,
        None => 0,
    };
    let drafts = books_companion::build_books_issues(&run, suspense_balance);
    let samples = advisor_journal_samples(
        &entries,
        &accounts,
        body.period_start,
        body.period_end,
        ADVISOR_JOURNAL_SAMPLE_LIMIT,
    );
    let advice_inputs = Some((run.metrics.clone(), samples));
    let detail = finish_run(&state, &tenant, run, Vec::new(), drafts, advice_inputs).await?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
pub(crate) struct BankRunBody {
    lines: Vec<BankLineInput>,
    #[serde(default)]
    period_start: Option<NaiveDate>,
    #[serde(default)]
    period_end: Option<NaiveDate>,
}

pub(crate) async fn run_bank(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BankRunBody>,
) -> Result<Json<RunDetail>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let entries = state.store.list_entries(&tenant.id)?;

    let (run, items) = run_bank_review(
        &tenant,
        &body.lines,
        &entries,
        body.period_start,
        body.period_end,
    );
    let drafts = books_companion::build_bank_issues(&run);
    let advice_inputs = Some((
        run.metrics.clone(),
        advisor_transactions(&items, ADVISOR_TRANSACTION_LIMIT),
    ));
    let detail = finish_run(&state, &tenant, run, items, drafts, advice_inputs).await?;
    Ok(Json(detail))
}

fn parse_kind(kind: &str) -> Option<RunKind> {
    match kind {
        "receipts" => Some(RunKind::Receipts),
        "invoices" => Some(RunKind::Invoices),
        "books-review" => Some(RunKind::BooksReview),
        "bank-review" => Some(RunKind::BankReview),
        _ => None,
    }
}

pub(crate) async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(kind): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let kind = parse_kind(&kind)
        .ok_or_else(|| ApiError::not_found(format!("unknown run kind {kind}")))?;
    let runs = state.runs.list_runs(&tenant.id, Some(kind))?;
    Ok(Json(json!({"runs": runs})))
}

pub(crate) async fn run_detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let (run, items) = state.runs.run(&tenant.id, &run_id)?;
    Ok(Json(RunDetail { run, items }))
}
