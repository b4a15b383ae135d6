use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use books_companion::CloseReadiness;
use books_companion::CloseReadinessInputs;
use books_companion::CompanionIssue;
use books_companion::Coverage;
use books_companion::CoverageInputs;
use books_companion::ISSUE_WINDOW_DAYS;
use books_companion::IssueSeverity;
use books_companion::IssueStatus;
use books_companion::PlaybookStep;
use books_companion::Radar;
use books_companion::Story;
use books_companion::Surface;
use books_companion::build_coverage;
use books_companion::build_playbook;
use books_companion::build_radar;
use books_companion::cached_story;
use books_companion::evaluate_close_readiness;
use books_companion::rank_issues_for_summary;
use books_ledger::BankTxStatus;
use books_ledger::InvoiceStatus;
use books_ledger::Tenant;
use books_review::ItemState;
use books_review::RunKind;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::ApiError;
use crate::AppState;
use crate::tenant_from_headers;

#[derive(Debug, Deserialize)]
pub(crate) struct IssueListQuery {
    #[serde(default)]
    status: Option<IssueStatus>,
}

pub(crate) async fn list_issues(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IssueListQuery>,
) -> Result<Json<Vec<CompanionIssue>>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let issues = state.issues.list_issues(&tenant.id, query.status, None)?;
    Ok(Json(rank_issues_for_summary(issues)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct IssueUpdateBody {
    status: IssueStatus,
}

pub(crate) async fn update_issue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(issue_id): Path<String>,
    Json(body): Json<IssueUpdateBody>,
) -> Result<Json<CompanionIssue>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let issue = state
        .issues
        .update_status(&tenant.id, &issue_id, body.status)?;
    state.stories.mark_dirty(&tenant.id, Utc::now())?;
    Ok(Json(issue))
}

fn coverage_inputs(
    state: &AppState,
    tenant: &Tenant,
    open_issues: &[CompanionIssue],
    since: DateTime<Utc>,
) -> Result<CoverageInputs, ApiError> {
    let mut inputs = CoverageInputs::default();

    let receipt_runs = state.runs.list_runs(&tenant.id, Some(RunKind::Receipts))?;
    if let Some(run) = receipt_runs.first() {
        let (_, items) = state.runs.run(&tenant.id, &run.id)?;
        inputs.receipts_total = items.len();
        inputs.receipts_covered = items
            .iter()
            .filter(|item| item.state == ItemState::Processed)
            .count();
    }

    let since_date = since.date_naive();
    for invoice in state.store.list_invoices(&tenant.id)? {
        if invoice.status == InvoiceStatus::Void || invoice.issue_date < since_date {
            continue;
        }
        inputs.invoices_total += 1;
        if matches!(
            invoice.status,
            InvoiceStatus::Sent | InvoiceStatus::Partial | InvoiceStatus::Paid
        ) {
            inputs.invoices_covered += 1;
        }
    }

    for account in state.store.list_bank_accounts(&tenant.id)? {
        for tx in state.store.list_bank_transactions(&tenant.id, &account.id)? {
            if tx.date < since_date {
                continue;
            }
            inputs.banking_total += 1;
            if tx.status != BankTxStatus::New {
                inputs.banking_covered += 1;
            }
        }
    }

    inputs.open_books_issues = open_issues
        .iter()
        .filter(|issue| issue.surface == Surface::Books)
        .count();
    Ok(inputs)
}

const SUSPENSE_CODES: &[&str] = &["9999", "2999", "3999"];

fn readiness_inputs(
    state: &AppState,
    tenant: &Tenant,
    open_issues: &[CompanionIssue],
    coverage: &CoverageInputs,
    now: DateTime<Utc>,
) -> Result<CloseReadinessInputs, ApiError> {
    let mut suspense_balances = Vec::new();
    for code in SUSPENSE_CODES {
        if let Some(account) = state.store.account_by_code(&tenant.id, code)? {
            let balance =
                state
                    .store
                    .balance_as_of(&tenant.id, &account.id, now.date_naive())?;
            if balance != 0 {
                suspense_balances.push((account.name, balance));
            }
        }
    }

    Ok(CloseReadinessInputs {
        unreconciled_count: coverage.banking_total - coverage.banking_covered,
        total_bank_transactions: coverage.banking_total,
        suspense_balances,
        open_high_issues_bank_books: open_issues
            .iter()
            .filter(|issue| {
                issue.severity == IssueSeverity::High
                    && matches!(issue.surface, Surface::Bank | Surface::Books)
            })
            .count(),
    })
}

#[derive(Debug, Serialize)]
pub(crate) struct CompanionSummary {
    issues: Vec<CompanionIssue>,
    radar: Radar,
    coverage: Coverage,
    close_readiness: CloseReadiness,
    playbook: Vec<PlaybookStep>,
    story: Story,
}

/// Composite companion view: all deterministic derivations plus the cached
/// story. This endpoint never calls the advisor.
pub(crate) async fn summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CompanionSummary>, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let now = Utc::now();
    let since = now - Duration::days(ISSUE_WINDOW_DAYS);

    let open_issues =
        state
            .issues
            .list_issues(&tenant.id, Some(IssueStatus::Open), Some(since))?;
    let radar = build_radar(&open_issues, now);
    let coverage_counts = coverage_inputs(&state, &tenant, &open_issues, since)?;
    let coverage = build_coverage(&coverage_counts);
    let close_readiness = evaluate_close_readiness(&readiness_inputs(
        &state,
        &tenant,
        &open_issues,
        &coverage_counts,
        now,
    )?);
    let ranked = rank_issues_for_summary(open_issues);
    let playbook = build_playbook(&ranked, &coverage, books_companion::DEFAULT_PLAYBOOK_STEPS);
    let story = cached_story(state.stories.as_ref(), &tenant.id, now)?;

    Ok(Json(CompanionSummary {
        issues: ranked,
        radar,
        coverage,
        close_readiness,
        playbook,
        story,
    }))
}
