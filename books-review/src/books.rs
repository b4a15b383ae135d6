use std::collections::HashMap;
use std::collections::HashSet;

use books_ledger::Account;
use books_ledger::JournalEntry;
use books_ledger::Tenant;
use books_ledger::format_minor;
use chrono::NaiveDate;
use serde_json::Value;
use serde_json::json;

use crate::Finding;
use crate::ReviewRun;
use crate::RunKind;
use crate::RunStatus;
use crate::Severity;
use crate::overall_risk;
use crate::risk_level;

/// Entries at or above this size are always findings.
pub const LARGE_ENTRY_THRESHOLD_MINOR: i64 = 500_000;

/// Ledger-wide, read-only review of a period: totals, large entries,
/// adjustment descriptions, duplicates, and (companion only) outliers
/// against the period average.
pub fn run_books_review(
    tenant: &Tenant,
    entries: &[JournalEntry],
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> ReviewRun {
    let mut run = ReviewRun::new(tenant.id.clone(), RunKind::BooksReview);
    run.period_start = Some(period_start);
    run.period_end = Some(period_end);

    let in_period: Vec<&JournalEntry> = entries
        .iter()
        .filter(|entry| !entry.is_void)
        .filter(|entry| entry.date >= period_start && entry.date <= period_end)
        .collect();

    let accounts_touched: HashSet<&str> = in_period
        .iter()
        .flat_map(|entry| entry.lines.iter())
        .map(|line| line.account_id.as_str())
        .collect();

    let amounts: Vec<i64> = in_period.iter().map(|entry| entry.amount_minor()).collect();
    let avg_amount_minor = if amounts.is_empty() {
        0
    } else {
        amounts.iter().sum::<i64>() / amounts.len() as i64
    };

    let mut findings: Vec<Finding> = Vec::new();
    let mut push_finding = |code: &str, severity: Severity, message: String, refs: Value| {
        findings.push(Finding {
            code: code.into(),
            severity,
            message,
            references: refs,
        });
    };

    for entry in &in_period {
        let amount = entry.amount_minor();
        if amount >= LARGE_ENTRY_THRESHOLD_MINOR {
            push_finding(
                "LARGE_ENTRY",
                Severity::High,
                format!(
                    "Large journal entry {} ({}) on {}",
                    entry.id,
                    format_minor(amount),
                    entry.date
                ),
                json!({"journal_entry_id": entry.id}),
            );
        }
        if entry.description.to_lowercase().starts_with("adjustment") {
            push_finding(
                "ADJUSTMENT_ENTRY",
                Severity::Medium,
                format!("Adjustment entry {} on {}", entry.id, entry.date),
                json!({"journal_entry_id": entry.id}),
            );
        }
    }

    let mut duplicate_cache: HashMap<(String, NaiveDate, i64), Vec<String>> = HashMap::new();
    for entry in &in_period {
        duplicate_cache
            .entry((entry.description.clone(), entry.date, entry.amount_minor()))
            .or_default()
            .push(entry.id.clone());
    }
    let mut duplicate_groups: Vec<(&(String, NaiveDate, i64), &Vec<String>)> =
        duplicate_cache.iter().filter(|(_, ids)| ids.len() > 1).collect();
    duplicate_groups.sort_by(|a, b| a.0.cmp(b.0));
    for (key, ids) in duplicate_groups {
        push_finding(
            "POSSIBLE_DUPLICATE",
            Severity::Medium,
            format!(
                "{} entries share desc/date/amount ({} / {} / {})",
                ids.len(),
                key.0,
                key.1,
                format_minor(key.2)
            ),
            json!({"journal_entry_ids": ids}),
        );
    }

    let mut agent_retries = 0_usize;
    if tenant.companion_enabled {
        let outlier_threshold = if avg_amount_minor > 0 {
            avg_amount_minor * 3
        } else {
            300_000
        };
        for entry in &in_period {
            let amount = entry.amount_minor();
            if avg_amount_minor > 0 && amount > outlier_threshold {
                push_finding(
                    "OUTLIER_AMOUNT",
                    Severity::High,
                    format!(
                        "Entry {} amount {} is an outlier vs avg {}",
                        entry.id,
                        format_minor(amount),
                        format_minor(avg_amount_minor)
                    ),
                    json!({"journal_entry_id": entry.id}),
                );
            }
        }
        if !findings.is_empty() {
            agent_retries += 1;
        }
    }

    let high = findings
        .iter()
        .filter(|f| f.severity == Severity::High)
        .count();
    let warnings = findings
        .iter()
        .filter(|f| f.severity == Severity::Medium)
        .count();

    run.status = RunStatus::Completed;
    run.error_count = 0;
    run.warning_count = warnings;
    run.overall_risk_score = overall_risk(high, warnings);
    run.risk_level = risk_level(run.overall_risk_score);
    run.metrics = json!({
        "journals_total": in_period.len(),
        "journals_high_risk": high,
        "journals_with_warnings": warnings,
        "findings_count": findings.len(),
        "accounts_touched": accounts_touched.len(),
        "avg_amount_minor": avg_amount_minor,
        "agent_retries": agent_retries,
    });
    run.findings = findings;
    run
}

/// Bounded sample of period journals for the advisor, largest first, with
/// the account codes the whitelist filter allows.
#[must_use]
pub fn advisor_journal_samples(
    entries: &[JournalEntry],
    accounts: &[Account],
    period_start: NaiveDate,
    period_end: NaiveDate,
    limit: usize,
) -> Vec<Value> {
    let code_by_id: HashMap<&str, &str> = accounts
        .iter()
        .map(|account| (account.id.as_str(), account.code.as_str()))
        .collect();

    let mut in_period: Vec<&JournalEntry> = entries
        .iter()
        .filter(|entry| !entry.is_void)
        .filter(|entry| entry.date >= period_start && entry.date <= period_end)
        .collect();
    in_period.sort_by(|a, b| b.amount_minor().cmp(&a.amount_minor()));

    in_period
        .into_iter()
        .take(limit)
        .map(|entry| {
            let codes: Vec<Value> = entry
                .lines
                .iter()
                .filter_map(|line| code_by_id.get(line.account_id.as_str()))
                .map(|code| json!({"code": code}))
                .collect();
            json!({
                "id": entry.id,
                "date": entry.date,
                "description": entry.description,
                "amount_minor": entry.amount_minor(),
                "accounts": codes,
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

    #[test]
    fn large_and_adjustment_entries_become_findings() {
        let entries = vec![
            entry(3, 750_000, "Equipment purchase"),
            entry(5, 20_000, "Adjustment for rounding"),
            entry(7, 4_000, "Coffee"),
        ];
        let run = run_books_review(&tenant(false), &entries, date(1), date(31));

        let codes: Vec<&str> = run.findings.iter().map(|f| f.code.as_str()).collect();
        assert!(codes.contains(&"LARGE_ENTRY"));
        assert!(codes.contains(&"ADJUSTMENT_ENTRY"));
        // 5 + 20*1 + 10*1
        assert_eq!(run.overall_risk_score, 35.0);
        assert_eq!(
            run.metrics.get("journals_total").and_then(Value::as_u64),
            Some(3)
        );
    }

    #[test]
    fn duplicates_are_grouped_by_desc_date_amount() {
        let entries = vec![
            entry(10, 9_900, "Utilities"),
            entry(10, 9_900, "Utilities"),
            entry(11, 9_900, "Utilities"),
        ];
        let run = run_books_review(&tenant(false), &entries, date(1), date(31));

        let duplicates: Vec<&Finding> = run
            .findings
            .iter()
            .filter(|f| f.code == "POSSIBLE_DUPLICATE")
            .collect();
        assert_eq!(duplicates.len(), 1);
        let ids = duplicates[0]
            .references
            .get("journal_entry_ids")
            .and_then(Value::as_array)
            .expect("ids");
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn void_and_out_of_period_entries_are_ignored() {
        let mut voided = entry(10, 900_000, "Voided purchase");
        voided.is_void = true;
        let outside = entry(10, 900_000, "April purchase");
        let entries = vec![voided, outside];
        let run = run_books_review(&tenant(false), &entries, date(15), date(31));
        assert!(run.findings.is_empty());
        assert_eq!(
            run.metrics.get("journals_total").and_then(Value::as_u64),
            Some(0)
        );
    }

    #[test]
    fn companion_flags_outliers_against_the_average() {
        let mut entries: Vec<JournalEntry> = (0..5).map(|i| entry(3 + i, 10_000, "Sale")).collect();
        entries.push(entry(20, 90_000, "Big sale"));
        let run = run_books_review(&tenant(true), &entries, date(1), date(31));

        let codes: Vec<&str> = run.findings.iter().map(|f| f.code.as_str()).collect();
        assert!(codes.contains(&"OUTLIER_AMOUNT"));
        assert_eq!(
            run.metrics.get("agent_retries").and_then(Value::as_u64),
            Some(1)
        );

        let without_companion = run_books_review(&tenant(false), &entries, date(1), date(31));
        assert!(without_companion.findings.is_empty());
    }

    #[test]
    fn journal_samples_carry_account_codes() {
        let accounts = vec![
            Account {
                id: "cash".into(),
                tenant_id: "tenant-1".into(),
                code: "1010".into(),
                name: "Cash at Bank".into(),
                account_type: books_ledger::AccountType::Asset,
                is_active: true,
            },
            Account {
                id: "sales".into(),
                tenant_id: "tenant-1".into(),
                code: "4010".into(),
                name: "Sales".into(),
                account_type: books_ledger::AccountType::Income,
                is_active: true,
            },
        ];
        let entries = vec![entry(3, 10_000, "Sale"), entry(4, 90_000, "Big sale")];
        let samples = advisor_journal_samples(&entries, &accounts, date(1), date(31), 1);

        assert_eq!(samples.len(), 1);
        assert_eq!(
            samples[0].get("amount_minor").and_then(Value::as_i64),
            Some(90_000)
        );
        let codes = samples[0].get("accounts").and_then(Value::as_array).expect("codes");
        assert_eq!(codes.len(), 2);
    }

    #[test]
    fn duplicate_groups_are_in_duplicate_count() {
        let entries = vec![entry(10, 9_900, "Utilities"), entry(10, 9_900, "Utilities")];
        let run = run_books_review(&tenant(false), &entries, date(1), date(31));
        assert_eq!(
            run.metrics.get("findings_count").and_then(Value::as_u64),
            Some(1)
        );
        assert_eq!(run.warning_count, 1);
    }
}
