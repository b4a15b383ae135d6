use std::collections::HashMap;
use std::collections::HashSet;

use books_ledger::JournalEntry;
use books_ledger::Tenant;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::AuditFlag;
use crate::AuditStatus;
use crate::ItemState;
use crate::RISK_HIGH_THRESHOLD;
use crate::RISK_WARNING_THRESHOLD;
use crate::ReviewItem;
use crate::ReviewRun;
use crate::RunKind;
use crate::RunStatus;
use crate::Severity;
use crate::clamp_score;
use crate::overall_risk;
use crate::risk_level;

/// One statement line under review; already parsed by the import
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankLineInput {
    pub date: NaiveDate,
    pub description: String,
    pub amount_minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

fn score_flags(flags: &[AuditFlag]) -> f64 {
    let mut score = 5.0_f64;
    for flag in flags {
        score += match flag.severity {
            Severity::High => 40.0,
            Severity::Medium => 20.0,
            Severity::Low => 5.0,
        };
    }
    clamp_score(score)
}

/// Review-only reconciliation pass: classify each statement line against
/// the period's ledger entries keyed by `(date, |amount|)`, with a fuzzy
/// description fallback when the companion is enabled.
pub fn run_bank_review(
    tenant: &Tenant,
    lines: &[BankLineInput],
    entries: &[JournalEntry],
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
) -> (ReviewRun, Vec<ReviewItem>) {
    let mut run = ReviewRun::new(tenant.id.clone(), RunKind::BankReview);
    run.period_start = period_start;
    run.period_end = period_end;

    let in_period: Vec<&JournalEntry> = entries
        .iter()
        .filter(|entry| !entry.is_void)
        .filter(|entry| period_start.is_none_or(|start| entry.date >= start))
        .filter(|entry| period_end.is_none_or(|end| entry.date <= end))
        .collect();

    let mut journal_map: HashMap<(NaiveDate, i64), Vec<String>> = HashMap::new();
    let mut journal_desc_map: Vec<(String, Vec<String>)> = Vec::new();
    for entry in &in_period {
        journal_map
            .entry((entry.date, entry.amount_minor()))
            .or_default()
            .push(entry.id.clone());
        if !entry.description.is_empty() {
            journal_desc_map.push((entry.description.to_lowercase(), vec![entry.id.clone()]));
        }
    }

    let mut items: Vec<ReviewItem> = Vec::new();
    let mut seen_external_ids: HashSet<String> = HashSet::new();
    let mut agent_retries = 0_usize;
    let mut unmatched_total_minor = 0_i64;

    for (index, line) in lines.iter().enumerate() {
        let mut flags: Vec<AuditFlag> = Vec::new();
        let mut explanations: Vec<String> = Vec::new();
        let mut matched_ids: Vec<String> = Vec::new();
        let mut state = ItemState::Unmatched;
        let reference_id = line
            .external_id
            .clone()
            .unwrap_or_else(|| format!("line-{index}"));

        if let Some(external_id) = &line.external_id
            && !seen_external_ids.insert(external_id.clone())
        {
            flags.push(AuditFlag::new(
                "DUPLICATE_LINE",
                Severity::High,
                "Duplicate external bank id detected.",
            ));
            state = ItemState::Duplicate;
        }

        if state != ItemState::Duplicate {
            let key = (line.date, line.amount_minor.abs());
            if let Some(ids) = journal_map.get(&key) {
                matched_ids.extend(ids.iter().cloned());
                state = ItemState::Matched;
            } else {
                flags.push(AuditFlag::new(
                    "UNMATCHED_TRANSACTION",
                    Severity::High,
                    "No ledger match found.",
                ));
            }
        }

        if tenant.companion_enabled && state != ItemState::Matched {
            let tokens: Vec<String> = line
                .description
                .to_lowercase()
                .split_whitespace()
                .map(str::to_string)
                .collect();
            if !tokens.is_empty()
                && let Some((_, ids)) = journal_desc_map
                    .iter()
                    .find(|(desc, _)| tokens.iter().any(|token| desc.contains(token)))
            {
                matched_ids.extend(ids.iter().cloned());
                state = ItemState::PartialMatch;
                flags.push(AuditFlag::new(
                    "POTENTIAL_MATCH",
                    Severity::Medium,
                    "Description similarity suggests a potential match.",
                ));
            }
            if !flags.is_empty() {
                agent_retries += 1;
                explanations
                    .push("Companion reflection attempted fuzzy matching on unmatched lines.".into());
            }
        }

        if matches!(state, ItemState::Unmatched | ItemState::Duplicate) {
            unmatched_total_minor += line.amount_minor.abs();
        }

        let audit_score = score_flags(&flags);
        let has_high = flags.iter().any(|f| f.severity == Severity::High);
        let audit_status = if state == ItemState::Duplicate {
            AuditStatus::Error
        } else if has_high || audit_score >= RISK_WARNING_THRESHOLD {
            AuditStatus::Warning
        } else {
            AuditStatus::Ok
        };

        items.push(ReviewItem {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            reference_id,
            state,
            extracted: json!({
                "date": line.date,
                "description": line.description,
                "amount_minor": line.amount_minor,
                "external_id": line.external_id,
            }),
            proposed_posting: Value::Null,
            audit_flags: flags,
            audit_score,
            audit_status,
            explanations,
            matched_journal_ids: matched_ids,
            error: (state == ItemState::Duplicate).then(|| "Duplicate line".to_string()),
        });
    }

    let total = items.len();
    let reconciled = items
        .iter()
        .filter(|item| item.state == ItemState::Matched)
        .count();
    let unmatched = items
        .iter()
        .filter(|item| matches!(item.state, ItemState::Unmatched | ItemState::Duplicate))
        .count();
    let duplicates = items
        .iter()
        .filter(|item| item.state == ItemState::Duplicate)
        .count();
    let high_risk = items
        .iter()
        .filter(|item| item.audit_score >= RISK_HIGH_THRESHOLD)
        .count();
    let medium = items
        .iter()
        .filter(|item| {
            item.audit_score < RISK_HIGH_THRESHOLD
                && item
                    .audit_flags
                    .iter()
                    .any(|f| f.severity == Severity::Medium)
        })
        .count();

    run.status = RunStatus::Completed;
    run.error_count = duplicates;
    run.warning_count = items
        .iter()
        .filter(|item| item.audit_status == AuditStatus::Warning)
        .count();
    run.overall_risk_score = overall_risk(high_risk, medium);
    run.risk_level = risk_level(run.overall_risk_score);
    run.metrics = json!({
        "transactions_total": total,
        "transactions_reconciled": reconciled,
        "transactions_unreconciled": unmatched,
        "transactions_high_risk": high_risk,
        "transactions_duplicate": duplicates,
        "unmatched_total_minor": unmatched_total_minor,
        "agent_retries": agent_retries,
    });
    (run, items)
}

/// Bounded advisor subset: unmatched and errored lines first, then by
/// descending audit score.
#[must_use]
pub fn advisor_transactions(items: &[ReviewItem], limit: usize) -> Vec<Value> {
    let mut ranked: Vec<&ReviewItem> = items.iter().collect();
    ranked.sort_by(|a, b| {
        let a_unmatched = matches!(a.state, ItemState::Unmatched | ItemState::Duplicate);
        let b_unmatched = matches!(b.state, ItemState::Unmatched | ItemState::Duplicate);
        b_unmatched
            .cmp(&a_unmatched)
            .then_with(|| {
                b.audit_score
                    .partial_cmp(&a.audit_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });
    ranked
        .into_iter()
        .take(limit)
        .map(|item| {
            json!({
                "transaction_id": item.reference_id,
                "payload": item.extracted,
                "status": item.state,
                "audit_flags": item.audit_flags,
                "audit_score": item.audit_score,
                "audit_explanations": item.explanations,
                "matched_journal_ids": item.matched_journal_ids,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use books_ledger::JournalLine;
    use pretty_assertions::assert_eq;

    fn tenant(companion_enabled: bool) -> Tenant {
        Tenant {
            id: "tenant-1".into(),
            name: "Demo Books".into(),
            currency: "USD".into(),
            fiscal_year_start_month: 1,
            companion_enabled,
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).expect("valid date")
    }

    fn entry(day: u32, amount_minor: i64, description: &str) -> JournalEntry {
        let mut entry = JournalEntry::new("tenant-1", date(day), description);
        entry.lines = vec![
            JournalLine::new("cash", amount_minor, 0),
            JournalLine::new("sales", 0, amount_minor),
        ];
        entry
    }

    fn line(day: u32, amount_minor: i64, description: &str, external_id: Option<&str>) -> BankLineInput {
        BankLineInput {
            date: date(day),
            description: description.into(),
            amount_minor,
            external_id: external_id.map(str::to_string),
        }
    }

    #[test]
    fn exact_date_amount_keys_match() {
        let entries = vec![entry(10, 9_900, "Utilities")];
        let lines = vec![line(10, -9_900, "UTILITIES CO", Some("ext-1"))];
        let (run, items) = run_bank_review(&tenant(false), &lines, &entries, None, None);

        assert_eq!(items[0].state, ItemState::Matched);
        assert_eq!(items[0].matched_journal_ids.len(), 1);
        assert_eq!(items[0].audit_score, 5.0);
        assert_eq!(
            run.metrics
                .get("transactions_reconciled")
                .and_then(Value::as_u64),
            Some(1)
        );
        assert_eq!(run.overall_risk_score, 5.0);
    }

    #[test]
    fn unmatched_lines_are_high_flags() {
        let lines = vec![line(10, -9_900, "Mystery charge", Some("ext-1"))];
        let (run, items) = run_bank_review(&tenant(false), &lines, &[], None, None);

        assert_eq!(items[0].state, ItemState::Unmatched);
        assert_eq!(items[0].audit_score, 45.0);
        assert_eq!(items[0].audit_status, AuditStatus::Warning);
        assert_eq!(
            run.metrics
                .get("unmatched_total_minor")
                .and_then(Value::as_i64),
            Some(9_900)
        );
    }

    #[test]
    fn repeated_external_ids_are_duplicates() {
        let entries = vec![entry(10, 9_900, "Utilities")];
        let lines = vec![
            line(10, -9_900, "UTILITIES CO", Some("ext-1")),
            line(10, -9_900, "UTILITIES CO", Some("ext-1")),
        ];
        let (run, items) = run_bank_review(&tenant(false), &lines, &entries, None, None);

        assert_eq!(items[0].state, ItemState::Matched);
        assert_eq!(items[1].state, ItemState::Duplicate);
        assert_eq!(items[1].audit_status, AuditStatus::Error);
        assert_eq!(
            run.metrics
                .get("transactions_duplicate")
                .and_then(Value::as_u64),
            Some(1)
        );
    }

    #[test]
    fn companion_fuzzy_matches_by_description() {
        let entries = vec![entry(8, 5_000, "Monthly software subscription")];
        let lines = vec![line(10, -5_100, "software vendor", Some("ext-9"))];

        let (_, items) = run_bank_review(&tenant(true), &lines, &entries, None, None);
        assert_eq!(items[0].state, ItemState::PartialMatch);
        let codes: Vec<&str> = items[0]
            .audit_flags
            .iter()
            .map(|f| f.code.as_str())
            .collect();
        assert!(codes.contains(&"POTENTIAL_MATCH"));

        let (_, deterministic) = run_bank_review(&tenant(false), &lines, &entries, None, None);
        assert_eq!(deterministic[0].state, ItemState::Unmatched);
    }

    #[test]
    fn period_bounds_filter_candidate_entries() {
        let entries = vec![entry(10, 9_900, "Utilities")];
        let lines = vec![line(10, -9_900, "UTILITIES CO", None)];
        let (_, items) = run_bank_review(
            &tenant(false),
            &lines,
            &entries,
            Some(date(15)),
            Some(date(31)),
        );
        assert_eq!(items[0].state, ItemState::Unmatched);
    }

    #[test]
    fn advisor_subset_prioritizes_unmatched() {
        let entries = vec![entry(10, 9_900, "Utilities")];
        let lines = vec![
            line(10, -9_900, "UTILITIES CO", Some("ok-1")),
            line(11, -123, "Mystery", Some("bad-1")),
        ];
        let (_, items) = run_bank_review(&tenant(false), &lines, &entries, None, None);
        let subset = advisor_transactions(&items, 15);
        assert_eq!(
            subset[0].get("transaction_id").and_then(Value::as_str),
            Some("bad-1")
        );
    }
}
