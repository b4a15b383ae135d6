use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::CompanionIssue;
use crate::ISSUE_WINDOW_DAYS;
use crate::IssueSeverity;
use crate::IssueStatus;
use crate::Surface;

const AGE_PENALTY_PER_WEEK: i64 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadarAxis {
    pub score: i64,
    pub open_issues: usize,
}

impl RadarAxis {
    fn fresh() -> Self {
        Self {
            score: 100,
            open_issues: 0,
        }
    }
}

/// Four-axis stability score, 0-100 per axis. Each axis starts at 100 and
/// loses points per open issue by severity, plus an age penalty per week
/// the issue has stayed open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Radar {
    pub cash_reconciliation: RadarAxis,
    pub revenue_invoices: RadarAxis,
    pub expenses_receipts: RadarAxis,
    pub tax_compliance: RadarAxis,
}

impl Radar {
    fn axis_mut(&mut self, surface: Surface) -> &mut RadarAxis {
        match surface {
            Surface::Bank => &mut self.cash_reconciliation,
            Surface::Invoices => &mut self.revenue_invoices,
            Surface::Receipts => &mut self.expenses_receipts,
            Surface::Books => &mut self.tax_compliance,
        }
    }

    #[must_use]
    pub fn average_score(&self) -> f64 {
        let total = self.cash_reconciliation.score
            + self.revenue_invoices.score
            + self.expenses_receipts.score
            + self.tax_compliance.score;
        total as f64 / 4.0
    }
}

fn severity_deduction(severity: IssueSeverity) -> i64 {
    match severity {
        IssueSeverity::High => 15,
        IssueSeverity::Medium => 8,
        IssueSeverity::Low => 3,
    }
}

#[must_use]
pub fn build_radar(issues: &[CompanionIssue], now: DateTime<Utc>) -> Radar {
    let since = now - Duration::days(ISSUE_WINDOW_DAYS);
    let mut radar = Radar {
        cash_reconciliation: RadarAxis::fresh(),
        revenue_invoices: RadarAxis::fresh(),
        expenses_receipts: RadarAxis::fresh(),
        tax_compliance: RadarAxis::fresh(),
    };

    for issue in issues {
        if issue.status != IssueStatus::Open || issue.created_at < since {
            continue;
        }
        let axis = radar.axis_mut(issue.surface);
        axis.open_issues += 1;

        let age_days = (now - issue.created_at).num_days().max(0);
        let deduction = severity_deduction(issue.severity) + (age_days / 7) * AGE_PENALTY_PER_WEEK;
        axis.score = (axis.score - deduction).max(0);
    }
    radar
}
