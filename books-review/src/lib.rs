#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The four deterministic review pipelines. Each run collects inputs,
//! scores them with rule-based audits, and persists a run plus per-item
//! rows; the advisor layer is additive and applied by the caller after the
//! deterministic results are stored.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub mod bank;
pub mod books;
mod extract;
pub mod invoices;
pub mod receipts;

pub type RunId = String;
pub type ReviewResult<T> = Result<T, ReviewError>;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

pub const RISK_WARNING_THRESHOLD: f64 = 40.0;
pub const RISK_HIGH_THRESHOLD: f64 = 70.0;
/// Document-level high-risk cut-off for the receipts/invoices pipelines.
pub const AUDIT_HIGH_RISK_THRESHOLD: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFlag {
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

impl AuditFlag {
    #[must_use]
    pub fn new(code: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Receipts,
    Invoices,
    BooksReview,
    BankReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Quantize a running score to two decimals and cap it at 100.
#[must_use]
pub fn clamp_score(score: f64) -> f64 {
    let capped = score.clamp(0.0, 100.0);
    (capped * 100.0).round() / 100.0
}

/// Run-level risk: `5 + 20·high + 10·medium`, capped at 100.
#[must_use]
pub fn overall_risk(high: usize, medium: usize) -> f64 {
    clamp_score(5.0 + 20.0 * high as f64 + 10.0 * medium as f64)
}

#[must_use]
pub fn risk_level(score: f64) -> RiskLevel {
    if score >= RISK_HIGH_THRESHOLD {
        RiskLevel::High
    } else if score >= RISK_WARNING_THRESHOLD {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// A run-level finding (books review); item-level problems live on the
/// item's audit flags instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub references: Value,
}

/// Per-item state across pipelines: documents end Processed/Error, bank
/// lines end in a match classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Processed,
    Error,
    Matched,
    PartialMatch,
    Unmatched,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: String,
    pub run_id: RunId,
    /// Caller-supplied identity: document id or bank line reference.
    pub reference_id: String,
    pub state: ItemState,
    pub extracted: Value,
    pub proposed_posting: Value,
    pub audit_flags: Vec<AuditFlag>,
    pub audit_score: f64,
    pub audit_status: AuditStatus,
    #[serde(default)]
    pub explanations: Vec<String>,
    #[serde(default)]
    pub matched_journal_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Advisor output persisted on a run after the deterministic pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvisorOutcome {
    #[serde(default)]
    pub explanations: Vec<String>,
    #[serde(default)]
    pub rankings: Value,
    #[serde(default)]
    pub classifications: Value,
    #[serde(default)]
    pub followups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRun {
    pub id: RunId,
    pub tenant_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end: Option<NaiveDate>,
    pub trace_id: String,
    pub metrics: Value,
    pub findings: Vec<Finding>,
    pub overall_risk_score: f64,
    pub risk_level: RiskLevel,
    pub error_count: usize,
    pub warning_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisor: Option<AdvisorOutcome>,
    pub created_at: DateTime<Utc>,
}

impl ReviewRun {
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, kind: RunKind) -> Self {
        let token = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            kind,
            status: RunStatus::Running,
            period_start: None,
            period_end: None,
            trace_id: format!("{}-trace-{token}", kind_slug(kind)),
            metrics: Value::Null,
            findings: Vec::new(),
            overall_risk_score: 0.0,
            risk_level: RiskLevel::Low,
            error_count: 0,
            warning_count: 0,
            advisor: None,
            created_at: Utc::now(),
        }
    }
}

fn kind_slug(kind: RunKind) -> &'static str {
    match kind {
        RunKind::Receipts => "receipt",
        RunKind::Invoices => "invoice",
        RunKind::BooksReview => "books-review",
        RunKind::BankReview => "bank-review",
    }
}

pub trait RunStore: Send + Sync {
    fn insert_run(&self, run: ReviewRun, items: Vec<ReviewItem>) -> ReviewResult<ReviewRun>;
    fn run(&self, tenant_id: &str, run_id: &RunId) -> ReviewResult<(ReviewRun, Vec<ReviewItem>)>;
    fn list_runs(&self, tenant_id: &str, kind: Option<RunKind>) -> ReviewResult<Vec<ReviewRun>>;
    fn attach_advice(
        &self,
        tenant_id: &str,
        run_id: &RunId,
        advice: AdvisorOutcome,
    ) -> ReviewResult<()>;
}

#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, (ReviewRun, Vec<ReviewItem>)>>,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_write<F, T>(&self, f: F) -> ReviewResult<T>
    where
        F: FnOnce(&mut HashMap<RunId, (ReviewRun, Vec<ReviewItem>)>) -> ReviewResult<T>,
    {
        let mut guard = self
            .runs
            .write()
            .map_err(|_| ReviewError::Storage("run store poisoned".into()))?;
        f(&mut guard)
    }
}

impl RunStore for InMemoryRunStore {
    fn insert_run(&self, run: ReviewRun, items: Vec<ReviewItem>) -> ReviewResult<ReviewRun> {
        self.with_write(|runs| {
            runs.insert(run.id.clone(), (run.clone(), items));
            Ok(run)
        })
    }

    fn run(&self, tenant_id: &str, run_id: &RunId) -> ReviewResult<(ReviewRun, Vec<ReviewItem>)> {
        let guard = self
            .runs
            .read()
            .map_err(|_| ReviewError::Storage("run store poisoned".into()))?;
        guard
            .get(run_id)
            .filter(|(run, _)| run.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| ReviewError::NotFound(format!("run {run_id}")))
    }

    fn list_runs(&self, tenant_id: &str, kind: Option<RunKind>) -> ReviewResult<Vec<ReviewRun>> {
        let guard = self
            .runs
            .read()
            .map_err(|_| ReviewError::Storage("run store poisoned".into()))?;
        let mut runs: Vec<ReviewRun> = guard
            .values()
            .map(|(run, _)| run)
            .filter(|run| run.tenant_id == tenant_id)
            .filter(|run| kind.is_none_or(|kind| run.kind == kind))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    fn attach_advice(
        &self,
        tenant_id: &str,
        run_id: &RunId,
        advice: AdvisorOutcome,
    ) -> ReviewResult<()> {
        self.with_write(|runs| {
            let (run, _) = runs
                .get_mut(run_id)
                .filter(|(run, _)| run.tenant_id == tenant_id)
                .ok_or_else(|| ReviewError::NotFound(format!("run {run_id}")))?;
            run.advisor = Some(advice);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn risk_score_caps_and_bands() {
        assert_eq!(overall_risk(0, 0), 5.0);
        assert_eq!(overall_risk(2, 1), 55.0);
        assert_eq!(overall_risk(10, 10), 100.0);

        assert_eq!(risk_level(5.0), RiskLevel::Low);
        assert_eq!(risk_level(40.0), RiskLevel::Medium);
        assert_eq!(risk_level(70.0), RiskLevel::High);
    }

    #[test]
    fn clamp_score_quantizes_to_two_decimals() {
        assert_eq!(clamp_score(33.333), 33.33);
        assert_eq!(clamp_score(150.0), 100.0);
        assert_eq!(clamp_score(-3.0), 0.0);
    }

    #[test]
    fn run_store_scopes_by_tenant() {
        let store = InMemoryRunStore::new();
        let run = store
            .insert_run(ReviewRun::new("tenant-1", RunKind::Receipts), Vec::new())
            .expect("run");

        assert!(store.run("tenant-1", &run.id).is_ok());
        assert!(matches!(
            store.run("tenant-2", &run.id),
            Err(ReviewError::NotFound(_))
        ));

        let listed = store
            .list_runs("tenant-1", Some(RunKind::Receipts))
            .expect("runs");
        assert_eq!(listed.len(), 1);
        assert!(
            store
                .list_runs("tenant-1", Some(RunKind::Invoices))
                .expect("runs")
                .is_empty()
        );
    }

    #[test]
    fn advice_attaches_after_the_deterministic_pass() {
        let store = InMemoryRunStore::new();
        let run = store
            .insert_run(ReviewRun::new("tenant-1", RunKind::BankReview), Vec::new())
            .expect("run");

        store
            .attach_advice(
                "tenant-1",
                &run.id,
                AdvisorOutcome {
                    explanations: vec!["looks fine".into()],
                    ..AdvisorOutcome::default()
                },
            )
            .expect("attach");

        let (stored, _) = store.run("tenant-1", &run.id).expect("run");
        let advisor = stored.advisor.expect("advisor fields");
        assert_eq!(advisor.explanations, vec!["looks fine".to_string()]);
    }
}
