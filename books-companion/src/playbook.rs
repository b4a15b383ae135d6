use serde::Deserialize;
use serde::Serialize;

use crate::CompanionIssue;
use crate::Coverage;
use crate::IssueSeverity;
use crate::Surface;

pub const DEFAULT_PLAYBOOK_STEPS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybookStep {
    pub label: String,
    pub surface: Surface,
    pub severity: IssueSeverity,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
}

fn surface_url(surface: Surface) -> &'static str {
    match surface {
        Surface::Bank => "/bank-review/",
        Surface::Receipts => "/receipts/",
        Surface::Invoices => "/invoices/ai/",
        Surface::Books => "/books-review/",
    }
}

fn coverage_gap_step(coverage: &Coverage) -> Option<PlaybookStep> {
    let (domain, axis) = coverage.lowest();
    if axis.coverage_percent >= 80.0 {
        return None;
    }
    let uncovered = axis.total_items.saturating_sub(axis.covered_items);
    let (label, surface) = match domain {
        "receipts" => (format!("Process {uncovered} pending receipts"), Surface::Receipts),
        "invoices" => (
            format!("Follow up on {uncovered} draft/unpaid invoices"),
            Surface::Invoices,
        ),
        "banking" => (
            format!("Match {uncovered} unmatched bank transactions"),
            Surface::Bank,
        ),
        _ => (format!("Review {uncovered} open books items"), Surface::Books),
    };
    Some(PlaybookStep {
        label,
        surface,
        severity: IssueSeverity::Medium,
        url: surface_url(surface).into(),
        issue_id: None,
    })
}

/// Up to `max_steps` prioritized actions: the top open issues by severity
/// and recency, then a coverage-gap action when the weakest domain is
/// below 80 %.
#[must_use]
pub fn build_playbook(
    open_issues: &[CompanionIssue],
    coverage: &Coverage,
    max_steps: usize,
) -> Vec<PlaybookStep> {
    let mut ranked: Vec<&CompanionIssue> = open_issues.iter().collect();
    ranked.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });

    let mut playbook: Vec<PlaybookStep> = ranked
        .into_iter()
        .take(max_steps)
        .map(|issue| PlaybookStep {
            label: issue.title.chars().take(100).collect(),
            surface: issue.surface,
            severity: issue.severity,
            url: surface_url(issue.surface).into(),
            issue_id: Some(issue.id.clone()),
        })
        .collect();

    if playbook.len() < max_steps
        && let Some(step) = coverage_gap_step(coverage)
    {
        playbook.push(step);
    }
    playbook.truncate(max_steps);
    playbook
}
