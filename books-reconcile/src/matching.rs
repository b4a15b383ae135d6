use std::collections::BTreeSet;

use books_ledger::AccountId;
use books_ledger::BankTransaction;
use books_ledger::LedgerStore;
use books_ledger::TenantId;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;

use crate::ReconcileResult;

/// Merchant-pattern rule: a feed description containing the pattern maps
/// straight to a category account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankRule {
    pub id: String,
    pub tenant_id: TenantId,
    pub merchant_pattern: String,
    pub account_id: AccountId,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "match_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionCandidate {
    Rule {
        rule_id: String,
        merchant_pattern: String,
        account_id: AccountId,
    },
    JournalEntry {
        journal_entry_id: String,
        date: NaiveDate,
        description: String,
        amount_minor: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSuggestion {
    pub candidate: SuggestionCandidate,
    pub confidence: f32,
    pub reason: String,
}

/// Weights and tolerances for candidate ranking. Amount dominates, date
/// proximity is secondary, description overlap breaks ties.
#[derive(Debug, Clone)]
pub struct SuggestionScoring {
    amount_weight: f32,
    date_weight: f32,
    description_weight: f32,
    amount_tolerance_minor: i64,
    date_window_days: i64,
}

impl SuggestionScoring {
    #[must_use]
    pub fn new(
        amount_weight: f32,
        date_weight: f32,
        description_weight: f32,
        amount_tolerance_minor: i64,
        date_window_days: i64,
    ) -> Self {
        Self {
            amount_weight,
            date_weight,
            description_weight,
            amount_tolerance_minor: amount_tolerance_minor.max(1),
            date_window_days: date_window_days.max(1),
        }
    }

    fn normalize_amount(&self, delta: i64) -> f32 {
        let ratio = (delta.abs() as f32) / (self.amount_tolerance_minor as f32);
        (1.0 - ratio).clamp(0.0, 1.0)
    }

    fn normalize_date(&self, delta_days: i64) -> f32 {
        let ratio = (delta_days.abs() as f32) / (self.date_window_days as f32);
        (1.0 - ratio).clamp(0.0, 1.0)
    }

    fn score(&self, amount_delta: i64, date_delta_days: i64, tx_desc: &str, entry_desc: &str) -> f32 {
        let total = self.amount_weight + self.date_weight + self.description_weight;
        if total <= f32::EPSILON {
            return 0.0;
        }
        let weighted = self.normalize_amount(amount_delta) * self.amount_weight
            + self.normalize_date(date_delta_days) * self.date_weight
            + description_similarity(tx_desc, entry_desc) * self.description_weight;
        (weighted / total).clamp(0.0, 1.0)
    }
}

impl Default for SuggestionScoring {
    fn default() -> Self {
        Self::new(0.5, 0.3, 0.2, 500, 15)
    }
}

fn description_similarity(left: &str, right: &str) -> f32 {
    let tokenize = |input: &str| -> BTreeSet<String> {
        input
            .split_whitespace()
            .map(str::to_ascii_lowercase)
            .collect()
    };
    let left_tokens = tokenize(left);
    let right_tokens = tokenize(right);
    if left_tokens.is_empty() || right_tokens.is_empty() {
        return 0.0;
    }
    let intersection = left_tokens.intersection(&right_tokens).count() as f32;
    let union = left_tokens.union(&right_tokens).count() as f32;
    if union <= f32::EPSILON {
        0.0
    } else {
        (intersection / union).clamp(0.0, 1.0)
    }
}

fn reason_for(amount_delta: i64, date_delta_days: i64, similarity: f32) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if amount_delta == 0 {
        parts.push("amount matches exactly");
    } else {
        parts.push("amount is close");
    }
    if date_delta_days == 0 {
        parts.push("same date");
    } else if date_delta_days.abs() <= 3 {
        parts.push("dates within a few days");
    }
    if similarity >= 0.5 {
        parts.push("descriptions overlap");
    }
    let mut reason = parts.join(", ");
    if let Some(first) = reason.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    reason
}

/// Rank candidate journal entries (and short-circuiting bank rules) for a
/// bank transaction, persisting the top suggestion's confidence and reason
/// on the transaction for later display.
pub fn suggest_for_transaction(
    store: &dyn LedgerStore,
    tenant_id: &TenantId,
    tx_id: &str,
    rules: &[BankRule],
    scoring: &SuggestionScoring,
) -> ReconcileResult<Vec<MatchSuggestion>> {
    let mut tx = store.bank_transaction(tenant_id, &tx_id.to_string())?;
    let mut suggestions: Vec<MatchSuggestion> = Vec::new();

    let description_lower = tx.description.to_ascii_lowercase();
    for rule in rules {
        if !rule.is_active || &rule.tenant_id != tenant_id {
            continue;
        }
        if description_lower.contains(&rule.merchant_pattern.to_ascii_lowercase()) {
            suggestions.push(MatchSuggestion {
                candidate: SuggestionCandidate::Rule {
                    rule_id: rule.id.clone(),
                    merchant_pattern: rule.merchant_pattern.clone(),
                    account_id: rule.account_id.clone(),
                },
                confidence: 0.9,
                reason: format!("Matches rule for {}", rule.merchant_pattern),
            });
        }
    }

    let abs_amount = tx.abs_amount_minor();
    for entry in store.list_entries(tenant_id)? {
        if entry.is_void {
            continue;
        }
        let date_delta = (entry.date - tx.date).num_days();
        if date_delta.abs() > scoring.date_window_days {
            continue;
        }
        let amount_delta = entry.amount_minor() - abs_amount;
        let confidence = scoring.score(amount_delta, date_delta, &tx.description, &entry.description);
        if confidence < 0.4 {
            continue;
        }
        let similarity = description_similarity(&tx.description, &entry.description);
        suggestions.push(MatchSuggestion {
            candidate: SuggestionCandidate::JournalEntry {
                journal_entry_id: entry.id.clone(),
                date: entry.date,
                description: entry.description.clone(),
                amount_minor: entry.amount_minor(),
            },
            confidence,
            reason: reason_for(amount_delta, date_delta, similarity),
        });
    }

    suggestions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    match suggestions.first() {
        Some(top) => {
            tx.suggestion_confidence = Some(top.confidence);
            tx.suggestion_reason = Some(top.reason.clone());
        }
        None => {
            tx.suggestion_confidence = None;
            tx.suggestion_reason = None;
        }
    }
    store.save_bank_transaction(&tx)?;

    Ok(suggestions)
}
