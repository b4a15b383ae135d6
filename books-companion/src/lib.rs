#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Companion derivations over the deterministic review surfaces: issue
//! synthesis, the stability radar, coverage, close readiness, the daily
//! playbook, and the fingerprint-gated story cache.

use std::collections::HashMap;
use std::sync::RwLock;

use books_review::ReviewRun;
use chrono::DateTime;
use chrono::Utc;
use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

mod coverage;
mod playbook;
mod radar;
mod readiness;
mod story;

pub use coverage::Coverage;
pub use coverage::CoverageAxis;
pub use coverage::CoverageInputs;
pub use coverage::build_coverage;
pub use playbook::DEFAULT_PLAYBOOK_STEPS;
pub use playbook::PlaybookStep;
pub use playbook::build_playbook;
pub use radar::Radar;
pub use radar::RadarAxis;
pub use radar::build_radar;
pub use readiness::CloseReadiness;
pub use readiness::CloseReadinessInputs;
pub use readiness::CloseStatus;
pub use readiness::evaluate_close_readiness;
pub use story::CompanionStory;
pub use story::InMemoryStoryStore;
pub use story::STORY_DEBOUNCE;
pub use story::Story;
pub use story::StoryStore;
pub use story::cached_story;
pub use story::compute_fingerprint;
pub use story::fallback_story;
pub use story::regenerate_story;

pub type IssueId = String;
pub type CompanionResult<T> = Result<T, CompanionError>;

#[derive(Debug, Error)]
pub enum CompanionError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Issue window considered by the radar, coverage and playbook.
pub const ISSUE_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Snoozed,
    Resolved,
    Dismissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Bank,
    Invoices,
    Receipts,
    Books,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionIssue {
    pub id: IssueId,
    pub tenant_id: String,
    pub surface: Surface,
    pub run_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub severity: IssueSeverity,
    pub status: IssueStatus,
    pub title: String,
    pub description: String,
    pub recommended_action: String,
    pub estimated_impact: String,
    pub data: Value,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

/// Issue payload before persistence assigns identity and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDraft {
    pub surface: Surface,
    pub run_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub severity: IssueSeverity,
    pub title: String,
    pub description: String,
    pub recommended_action: String,
    pub estimated_impact: String,
    pub data: Value,
    pub trace_id: String,
}

impl IssueDraft {
    fn new(surface: Surface, run_type: &str, run: &ReviewRun, title: &str, description: String) -> Self {
        Self {
            surface,
            run_type: run_type.into(),
            run_id: Some(run.id.clone()),
            severity: IssueSeverity::Low,
            title: title.into(),
            description,
            recommended_action: String::new(),
            estimated_impact: String::new(),
            data: json!({}),
            trace_id: run.trace_id.clone(),
        }
    }
}

/// Severity from materiality, compliance risk and recurrence. Amounts are
/// minor units.
#[must_use]
pub fn severity_from_materiality(
    amount_minor: i64,
    compliance_risk: bool,
    recurring: bool,
) -> IssueSeverity {
    if compliance_risk || amount_minor >= 100_000 || (recurring && amount_minor >= 50_000) {
        IssueSeverity::High
    } else if amount_minor >= 25_000 || recurring {
        IssueSeverity::Medium
    } else {
        IssueSeverity::Low
    }
}

fn metric_u64(run: &ReviewRun, key: &str) -> u64 {
    run.metrics.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn metric_i64(run: &ReviewRun, key: &str) -> i64 {
    run.metrics.get(key).and_then(Value::as_i64).unwrap_or(0)
}

#[must_use]
pub fn build_receipts_issues(run: &ReviewRun) -> Vec<IssueDraft> {
    let mut issues = Vec::new();
    let high = metric_u64(run, "documents_high_risk");
    let errors = run.error_count;
    let warnings = run.warning_count;
    let total_amount = metric_i64(run, "total_amount_minor");

    if high > 0 {
        let mut issue = IssueDraft::new(
            Surface::Receipts,
            "receipts",
            run,
            "High-risk receipts detected",
            format!("{high} receipts flagged high risk."),
        );
        issue.severity = severity_from_materiality(total_amount, false, high > 1);
        issue.recommended_action = "Review high-risk receipts and confirm classifications.".into();
        issue.data = json!({"high_risk": high});
        issues.push(issue);
    }
    if errors > 0 {
        let mut issue = IssueDraft::new(
            Surface::Receipts,
            "receipts",
            run,
            "Receipts failed processing",
            format!("{errors} receipts failed processing."),
        );
        issue.severity = severity_from_materiality(total_amount, true, false);
        issue.recommended_action = "Open the run and resolve the errored receipts.".into();
        issue.data = json!({"errors": errors});
        issues.push(issue);
    }
    if warnings > 0 && high == 0 {
        let mut issue = IssueDraft::new(
            Surface::Receipts,
            "receipts",
            run,
            "Receipts need review",
            format!("{warnings} receipts have warnings."),
        );
        issue.severity = severity_from_materiality(total_amount / 4, false, warnings > 1);
        issue.recommended_action = "Check warning receipts and confirm vendors/categories.".into();
        issue.data = json!({"warnings": warnings});
        issues.push(issue);
    }
    issues
}

#[must_use]
pub fn build_invoices_issues(run: &ReviewRun) -> Vec<IssueDraft> {
    let mut issues = Vec::new();
    let high = metric_u64(run, "documents_high_risk");
    let errors = run.error_count;
    let overdue_total = metric_i64(run, "overdue_total_minor");
    let overdue_count = metric_u64(run, "overdue_count");

    if high > 0 {
        let mut issue = IssueDraft::new(
            Surface::Invoices,
            "invoices",
            run,
            "High-risk invoices detected",
            format!("{high} invoices flagged high risk."),
        );
        let materiality = if overdue_total > 0 {
            overdue_total
        } else {
            high as i64 * 50_000
        };
        issue.severity = severity_from_materiality(materiality, false, high > 1);
        issue.recommended_action = "Review high-risk invoices and verify amounts/dates.".into();
        issue.data = json!({"high_risk": high});
        issues.push(issue);
    }
    if errors > 0 {
        let mut issue = IssueDraft::new(
            Surface::Invoices,
            "invoices",
            run,
            "Invoices failed processing",
            format!("{errors} invoices failed processing."),
        );
        let materiality = if overdue_total > 0 {
            overdue_total
        } else {
            errors as i64 * 50_000
        };
        issue.severity = severity_from_materiality(materiality, true, false);
        issue.recommended_action = "Open the run and resolve the errored invoices.".into();
        issue.data = json!({"errors": errors});
        issues.push(issue);
    }
    if overdue_total > 0 {
        let mut issue = IssueDraft::new(
            Surface::Invoices,
            "invoices",
            run,
            "Overdue invoices impacting cash flow",
            format!(
                "Overdue total ≈ {} across {overdue_count} invoices.",
                format_amount(overdue_total)
            ),
        );
        issue.severity = severity_from_materiality(overdue_total, false, overdue_count > 1);
        issue.recommended_action =
            "Prioritize collection: send reminders or set payment plans.".into();
        issue.estimated_impact = format!("≈ {}", format_amount(overdue_total));
        issue.data = json!({
            "overdue_total_minor": overdue_total,
            "overdue_count": overdue_count,
        });
        issues.push(issue);
    }
    issues
}

#[must_use]
pub fn build_books_issues(run: &ReviewRun, suspense_balance_minor: i64) -> Vec<IssueDraft> {
    let mut issues = Vec::new();
    let high = metric_u64(run, "journals_high_risk");
    let findings = metric_u64(run, "findings_count");

    if high > 0 {
        let mut issue = IssueDraft::new(
            Surface::Books,
            "books_review",
            run,
            "High-risk journals detected",
            format!("{high} journals flagged high risk in this period."),
        );
        let materiality = if suspense_balance_minor != 0 {
            suspense_balance_minor.abs()
        } else {
            high as i64 * 100_000
        };
        issue.severity = severity_from_materiality(materiality, true, false);
        issue.recommended_action = "Open the Books Review and inspect high-risk journals.".into();
        issue.data = json!({"journals_high_risk": high});
        issues.push(issue);
    }
    if findings > 0 && high == 0 {
        let mut issue = IssueDraft::new(
            Surface::Books,
            "books_review",
            run,
            "Findings require review",
            format!("{findings} findings generated in this review."),
        );
        issue.severity = severity_from_materiality(findings as i64 * 10_000, false, findings > 1);
        issue.recommended_action =
            "Review findings for the period and confirm any adjustments manually.".into();
        issue.data = json!({"findings": findings});
        issues.push(issue);
    }
    if suspense_balance_minor != 0 {
        let mut issue = IssueDraft::new(
            Surface::Books,
            "books_review",
            run,
            "Suspense balance present",
            format!(
                "Suspense/clearing balance ≈ {}.",
                format_amount(suspense_balance_minor)
            ),
        );
        issue.severity =
            severity_from_materiality(suspense_balance_minor.abs(), true, true);
        issue.recommended_action =
            "Clear suspense to proper accounts; investigate source transactions.".into();
        issue.estimated_impact = format!("≈ {}", format_amount(suspense_balance_minor));
        issue.data = json!({"suspense_balance_minor": suspense_balance_minor});
        issues.push(issue);
    }
    issues
}

#[must_use]
pub fn build_bank_issues(run: &ReviewRun) -> Vec<IssueDraft> {
    let mut issues = Vec::new();
    let unreconciled = metric_u64(run, "transactions_unreconciled");
    let high = metric_u64(run, "transactions_high_risk");
    let unmatched_total = metric_i64(run, "unmatched_total_minor");
    let duplicates = metric_u64(run, "transactions_duplicate");

    if unreconciled > 0 {
        let mut issue = IssueDraft::new(
            Surface::Bank,
            "bank_review",
            run,
            "Unreconciled bank transactions",
            format!("{unreconciled} transactions remain unreconciled."),
        );
        let materiality = if unmatched_total > 0 {
            unmatched_total
        } else {
            unreconciled as i64 * 20_000
        };
        issue.severity = severity_from_materiality(materiality, false, unreconciled > 2);
        issue.recommended_action = "Match or explain unreconciled transactions.".into();
        if unmatched_total > 0 {
            issue.estimated_impact = format!("≈ {}", format_amount(unmatched_total));
        }
        issue.data = json!({
            "unreconciled": unreconciled,
            "unmatched_total_minor": unmatched_total,
        });
        issues.push(issue);
    }
    if high > 0 {
        let mut issue = IssueDraft::new(
            Surface::Bank,
            "bank_review",
            run,
            "High-risk bank lines",
            format!("{high} bank lines flagged high risk."),
        );
        let materiality = if unmatched_total > 0 {
            unmatched_total
        } else {
            high as i64 * 50_000
        };
        issue.severity = severity_from_materiality(materiality, true, high > 1);
        issue.recommended_action = "Review high-risk bank lines and confirm matches.".into();
        issue.data = json!({"high_risk": high});
        issues.push(issue);
    }
    if duplicates > 0 {
        let mut issue = IssueDraft::new(
            Surface::Bank,
            "bank_review",
            run,
            "Possible duplicate bank lines",
            format!("{duplicates} lines look duplicated."),
        );
        issue.severity =
            severity_from_materiality(duplicates as i64 * 10_000, false, duplicates > 1);
        issue.recommended_action = "Deduplicate bank lines and ensure GL reflects reality.".into();
        issue.data = json!({"duplicates": duplicates});
        issues.push(issue);
    }
    issues
}

fn format_amount(amount_minor: i64) -> String {
    books_ledger::format_minor(amount_minor)
}

/// Parse the leading numeric of an impact string like `≈ 1,234.56` for
/// display ordering.
fn impact_value(estimated_impact: &str) -> f64 {
    let cleaned = estimated_impact.replace(',', "");
    Regex::new(r"(\d+(?:\.\d+)?)")
        .ok()
        .and_then(|re| re.captures(&cleaned))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Display ordering: severity (high first), estimated impact magnitude
/// (descending), then creation time.
#[must_use]
pub fn rank_issues_for_summary(mut issues: Vec<CompanionIssue>) -> Vec<CompanionIssue> {
    issues.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| {
                impact_value(&b.estimated_impact)
                    .partial_cmp(&impact_value(&a.estimated_impact))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    issues
}

pub trait IssueStore: Send + Sync {
    fn bulk_insert(
        &self,
        tenant_id: &str,
        drafts: Vec<IssueDraft>,
        now: DateTime<Utc>,
    ) -> CompanionResult<Vec<CompanionIssue>>;
    fn issue(&self, tenant_id: &str, issue_id: &IssueId) -> CompanionResult<CompanionIssue>;
    fn list_issues(
        &self,
        tenant_id: &str,
        status: Option<IssueStatus>,
        since: Option<DateTime<Utc>>,
    ) -> CompanionResult<Vec<CompanionIssue>>;
    fn update_status(
        &self,
        tenant_id: &str,
        issue_id: &IssueId,
        status: IssueStatus,
    ) -> CompanionResult<CompanionIssue>;
}

#[derive(Default)]
pub struct InMemoryIssueStore {
    issues: RwLock<HashMap<IssueId, CompanionIssue>>,
}

impl InMemoryIssueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IssueStore for InMemoryIssueStore {
    fn bulk_insert(
        &self,
        tenant_id: &str,
        drafts: Vec<IssueDraft>,
        now: DateTime<Utc>,
    ) -> CompanionResult<Vec<CompanionIssue>> {
        let mut guard = self
            .issues
            .write()
            .map_err(|_| CompanionError::Storage("issue store poisoned".into()))?;
        let mut created = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let issue = CompanionIssue {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                surface: draft.surface,
                run_type: draft.run_type,
                run_id: draft.run_id,
                severity: draft.severity,
                status: IssueStatus::Open,
                title: draft.title,
                description: draft.description,
                recommended_action: draft.recommended_action,
                estimated_impact: draft.estimated_impact,
                data: draft.data,
                trace_id: draft.trace_id,
                created_at: now,
            };
            guard.insert(issue.id.clone(), issue.clone());
            created.push(issue);
        }
        Ok(created)
    }

    fn issue(&self, tenant_id: &str, issue_id: &IssueId) -> CompanionResult<CompanionIssue> {
        let guard = self
            .issues
            .read()
            .map_err(|_| CompanionError::Storage("issue store poisoned".into()))?;
        guard
            .get(issue_id)
            .filter(|issue| issue.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| CompanionError::NotFound(format!("issue {issue_id}")))
    }

    fn list_issues(
        &self,
        tenant_id: &str,
        status: Option<IssueStatus>,
        since: Option<DateTime<Utc>>,
    ) -> CompanionResult<Vec<CompanionIssue>> {
        let guard = self
            .issues
            .read()
            .map_err(|_| CompanionError::Storage("issue store poisoned".into()))?;
        let mut issues: Vec<CompanionIssue> = guard
            .values()
            .filter(|issue| issue.tenant_id == tenant_id)
            .filter(|issue| status.is_none_or(|status| issue.status == status))
            .filter(|issue| since.is_none_or(|since| issue.created_at >= since))
            .cloned()
            .collect();
        issues.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(issues)
    }

    fn update_status(
        &self,
        tenant_id: &str,
        issue_id: &IssueId,
        status: IssueStatus,
    ) -> CompanionResult<CompanionIssue> {
        let mut guard = self
            .issues
            .write()
            .map_err(|_| CompanionError::Storage("issue store poisoned".into()))?;
        let issue = guard
            .get_mut(issue_id)
            .filter(|issue| issue.tenant_id == tenant_id)
            .ok_or_else(|| CompanionError::NotFound(format!("issue {issue_id}")))?;
        issue.status = status;
        Ok(issue.clone())
    }
}
