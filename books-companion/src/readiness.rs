use serde::Deserialize;
use serde::Serialize;

use books_ledger::format_minor;

/// At or above either bound, unreconciled bank activity blocks the close.
pub const MAX_UNRECONCILED_COUNT: usize = 5;
pub const MAX_UNRECONCILED_RATIO: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Ready,
    NotReady,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseReadinessInputs {
    pub unreconciled_count: usize,
    pub total_bank_transactions: usize,
    /// `(account name, balance)` for each suspense/clearing account.
    pub suspense_balances: Vec<(String, i64)>,
    pub open_high_issues_bank_books: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReadiness {
    pub status: CloseStatus,
    pub blocking_reasons: Vec<String>,
}

/// Deterministic close-readiness verdict: unreconciled activity below both
/// bounds, suspense accounts flat, and no open high-severity issues in the
/// bank or books surfaces.
#[must_use]
pub fn evaluate_close_readiness(inputs: &CloseReadinessInputs) -> CloseReadiness {
    let mut blocking_reasons: Vec<String> = Vec::new();

    if inputs.unreconciled_count > 0 {
        let ratio = inputs.unreconciled_count as f64
            / (inputs.total_bank_transactions.max(1) as f64);
        if inputs.unreconciled_count >= MAX_UNRECONCILED_COUNT || ratio >= MAX_UNRECONCILED_RATIO {
            blocking_reasons.push(format!(
                "{} unreconciled bank transactions in the last 30 days.",
                inputs.unreconciled_count
            ));
        }
    }

    for (name, balance_minor) in &inputs.suspense_balances {
        if balance_minor.abs() > 0 {
            blocking_reasons.push(format!(
                "{name} has a balance of {}.",
                format_minor(*balance_minor)
            ));
        }
    }

    if inputs.open_high_issues_bank_books > 0 {
        blocking_reasons.push(format!(
            "{} high-severity issue(s) in Books or Banking.",
            inputs.open_high_issues_bank_books
        ));
    }

    CloseReadiness {
        status: if blocking_reasons.is_empty() {
            CloseStatus::Ready
        } else {
            CloseStatus::NotReady
        },
        blocking_reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clean_books_are_ready() {
        let verdict = evaluate_close_readiness(&CloseReadinessInputs::default());
        assert_eq!(verdict.status, CloseStatus::Ready);
        assert!(verdict.blocking_reasons.is_empty());
    }

    #[test]
    fn a_few_unreconciled_among_many_still_passes() {
        let verdict = evaluate_close_readiness(&CloseReadinessInputs {
            unreconciled_count: 3,
            total_bank_transactions: 400,
            ..CloseReadinessInputs::default()
        });
        assert_eq!(verdict.status, CloseStatus::Ready);
    }

    #[test]
    fn unreconciled_count_bound_blocks() {
        let verdict = evaluate_close_readiness(&CloseReadinessInputs {
            unreconciled_count: 5,
            total_bank_transactions: 1_000,
            ..CloseReadinessInputs::default()
        });
        assert_eq!(verdict.status, CloseStatus::NotReady);
        assert_eq!(verdict.blocking_reasons.len(), 1);
    }

    #[test]
    fn unreconciled_ratio_bound_blocks() {
        let verdict = evaluate_close_readiness(&CloseReadinessInputs {
            unreconciled_count: 2,
            total_bank_transactions: 40,
            ..CloseReadinessInputs::default()
        });
        assert_eq!(verdict.status, CloseStatus::NotReady);
    }

    #[test]
    fn suspense_and_high_issues_block_with_reasons() {
        let verdict = evaluate_close_readiness(&CloseReadinessInputs {
            suspense_balances: vec![("Uncategorized Transactions".into(), -1_250)],
            open_high_issues_bank_books: 2,
            ..CloseReadinessInputs::default()
        });
        assert_eq!(verdict.status, CloseStatus::NotReady);
        assert_eq!(verdict.blocking_reasons.len(), 2);
        assert!(verdict.blocking_reasons[0].contains("-12.50"));
    }
}
