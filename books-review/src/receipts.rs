use books_ledger::DefaultAccounts;
use books_ledger::Tenant;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::AUDIT_HIGH_RISK_THRESHOLD;
use crate::AuditFlag;
use crate::AuditStatus;
use crate::ItemState;
use crate::RISK_WARNING_THRESHOLD;
use crate::ReviewItem;
use crate::ReviewRun;
use crate::RunKind;
use crate::RunStatus;
use crate::Severity;
use crate::clamp_score;
use crate::extract::infer_amount_from_filename;
use crate::extract::parse_iso_date;
use crate::overall_risk;
use crate::risk_level;

/// Payload handed over by the extraction collaborator; all fields are
/// best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedReceipt {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub total_minor: Option<i64>,
    #[serde(default)]
    pub date_raw: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptInput {
    pub document_id: String,
    #[serde(default)]
    pub original_filename: String,
    #[serde(default)]
    pub extracted: Option<ExtractedReceipt>,
    #[serde(default)]
    pub vendor_hint: Option<String>,
    #[serde(default)]
    pub amount_hint_minor: Option<i64>,
    #[serde(default)]
    pub date_hint: Option<NaiveDate>,
    #[serde(default)]
    pub currency_hint: Option<String>,
    #[serde(default)]
    pub category_hint: Option<String>,
}

struct EffectiveReceipt {
    vendor: String,
    total_minor: i64,
    date_raw: Option<String>,
    currency: String,
    category: String,
}

fn effective_fields(doc: &ReceiptInput, tenant_currency: &str) -> EffectiveReceipt {
    let extracted = doc.extracted.clone().unwrap_or_default();
    let vendor = extracted
        .vendor
        .or_else(|| doc.vendor_hint.clone())
        .unwrap_or_default();
    let total_minor = extracted
        .total_minor
        .or(doc.amount_hint_minor)
        .or_else(|| infer_amount_from_filename(&doc.original_filename, 0))
        .unwrap_or(0);
    let date_raw = extracted
        .date_raw
        .or_else(|| doc.date_hint.map(|d| d.to_string()));
    let currency = extracted
        .currency
        .or_else(|| doc.currency_hint.clone())
        .unwrap_or_else(|| tenant_currency.to_string())
        .to_uppercase();
    let category = extracted
        .category
        .or_else(|| doc.category_hint.clone())
        .unwrap_or_default();
    EffectiveReceipt {
        vendor,
        total_minor,
        date_raw,
        currency,
        category,
    }
}

struct Audit {
    flags: Vec<AuditFlag>,
    score: f64,
    status: AuditStatus,
    explanations: Vec<String>,
    retries: usize,
}

fn audit_document(
    effective: &EffectiveReceipt,
    companion_enabled: bool,
    tenant_currency: &str,
    today: NaiveDate,
) -> Audit {
    let mut flags: Vec<AuditFlag> = Vec::new();
    let mut explanations: Vec<String> = Vec::new();
    let mut score = 5.0_f64;
    let mut retries = 0_usize;

    if !effective.currency.is_empty()
        && !tenant_currency.is_empty()
        && effective.currency != tenant_currency
    {
        flags.push(AuditFlag::new(
            "CURRENCY_MISMATCH",
            Severity::Medium,
            format!(
                "Document currency {} differs from business default {tenant_currency}.",
                effective.currency
            ),
        ));
        explanations.push("Currency differs from defaults; flagged for review.".into());
        score += 18.0;
    }

    if effective.total_minor <= 0 {
        flags.push(AuditFlag::new(
            "MISSING_AMOUNT",
            Severity::High,
            "Unable to determine a valid total amount.",
        ));
        explanations.push("Amount missing or zero.".into());
        score += 45.0;
    } else if effective.total_minor >= 100_000 {
        flags.push(AuditFlag::new(
            "UNUSUAL_AMOUNT",
            Severity::High,
            "Amount above the normal threshold for receipts.",
        ));
        score += 60.0;
    } else if effective.total_minor >= 25_000 {
        flags.push(AuditFlag::new(
            "LARGE_AMOUNT",
            Severity::Medium,
            "Amount is higher than typical spend.",
        ));
        score += 18.0;
    }

    if effective.vendor.trim().is_empty() {
        flags.push(AuditFlag::new(
            "MISSING_VENDOR",
            Severity::High,
            "Vendor is missing from extraction.",
        ));
        score += 30.0;
    }

    match effective.date_raw.as_deref().and_then(parse_iso_date) {
        Some(date) if date > today => {
            flags.push(AuditFlag::new(
                "FUTURE_DATE",
                Severity::Medium,
                "Receipt date is in the future.",
            ));
            score += 10.0;
        }
        Some(_) => {}
        None => {
            flags.push(AuditFlag::new(
                "INVALID_DATE",
                Severity::Medium,
                "Date could not be parsed.",
            ));
            explanations.push("Date parsing failed during validation.".into());
            score += 12.0;
        }
    }

    if companion_enabled {
        let vendor_lower = effective.vendor.to_lowercase();
        if !vendor_lower.is_empty()
            && ["wire", "transfer", "refund", "manual"]
                .iter()
                .any(|term| vendor_lower.contains(term))
        {
            flags.push(AuditFlag::new(
                "VENDOR_PATTERN",
                Severity::Medium,
                "Vendor name pattern requires human confirmation.",
            ));
            score += 12.0;
        }
        let category_lower = effective.category.to_lowercase();
        if !effective.vendor.is_empty()
            && matches!(category_lower.as_str(), "uncategorized" | "misc")
        {
            flags.push(AuditFlag::new(
                "CATEGORY_WEAK",
                Severity::Low,
                "Category is too generic; companion recommends review.",
            ));
            score += 6.0;
        }
        if !flags.is_empty() {
            retries += 1;
            if score >= RISK_WARNING_THRESHOLD {
                explanations
                    .push("Companion performed a second-pass reflection on anomalous signals.".into());
            } else {
                explanations.push(
                    "Companion reviewed hints and extracted fields for potential mismatches."
                        .into(),
                );
            }
        }
    }

    let has_high = flags.iter().any(|f| f.severity == Severity::High);
    let mut status = AuditStatus::Ok;
    if score >= RISK_WARNING_THRESHOLD || has_high {
        status = AuditStatus::Warning;
    }
    if flags
        .iter()
        .any(|f| f.severity == Severity::High && matches!(f.code.as_str(), "MISSING_AMOUNT" | "MISSING_VENDOR"))
    {
        status = AuditStatus::Error;
    }

    Audit {
        flags,
        score: clamp_score(score),
        status,
        explanations,
        retries,
    }
}

fn intake_failed(filename: &str) -> bool {
    let lowered = filename.to_lowercase();
    ["error", "fail", "corrupt"]
        .iter()
        .any(|term| lowered.contains(term))
}

/// Deterministic receipts pipeline: per document, apply audit rules over
/// the extracted payload (falling back to hints and the filename), propose
/// a posting against the default accounts, and roll up run metrics.
pub fn run_receipts_review(
    tenant: &Tenant,
    defaults: &DefaultAccounts,
    documents: &[ReceiptInput],
    today: NaiveDate,
) -> (ReviewRun, Vec<ReviewItem>) {
    let mut run = ReviewRun::new(tenant.id.clone(), RunKind::Receipts);
    let mut items: Vec<ReviewItem> = Vec::new();
    let mut retries_total = 0_usize;
    let mut total_amount_minor = 0_i64;
    let tenant_currency = tenant.currency.to_uppercase();

    for doc in documents {
        if intake_failed(&doc.original_filename) {
            items.push(ReviewItem {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: run.id.clone(),
                reference_id: doc.document_id.clone(),
                state: ItemState::Error,
                extracted: json!({"filename": doc.original_filename}),
                proposed_posting: Value::Null,
                audit_flags: vec![AuditFlag::new(
                    "INTAKE_FAILURE",
                    Severity::High,
                    "Document could not be auto-processed.",
                )],
                audit_score: 100.0,
                audit_status: AuditStatus::Error,
                explanations: Vec::new(),
                matched_journal_ids: Vec::new(),
                error: Some("Document could not be auto-processed.".into()),
            });
            continue;
        }

        let effective = effective_fields(doc, &tenant_currency);
        let audit = audit_document(&effective, tenant.companion_enabled, &tenant_currency, today);
        retries_total += audit.retries;
        total_amount_minor += effective.total_minor.max(0);

        let proposed = json!({
            "memo": format!("Receipt from {}", if effective.vendor.is_empty() { "unknown vendor" } else { &effective.vendor }),
            "lines": [
                {"account_code": defaults.operating_expenses.code, "debit_minor": effective.total_minor, "credit_minor": 0},
                {"account_code": defaults.cash.code, "debit_minor": 0, "credit_minor": effective.total_minor},
            ],
        });

        items.push(ReviewItem {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            reference_id: doc.document_id.clone(),
            state: if audit.status == AuditStatus::Error {
                ItemState::Error
            } else {
                ItemState::Processed
            },
            extracted: json!({
                "filename": doc.original_filename,
                "vendor": effective.vendor,
                "total_minor": effective.total_minor,
                "date": effective.date_raw,
                "currency": effective.currency,
                "category": effective.category,
            }),
            proposed_posting: proposed,
            audit_flags: audit.flags,
            audit_score: audit.score,
            audit_status: audit.status,
            explanations: audit.explanations,
            matched_journal_ids: Vec::new(),
            error: None,
        });
    }

    let high = items
        .iter()
        .filter(|item| item.audit_score >= AUDIT_HIGH_RISK_THRESHOLD)
        .count();
    let warnings = items
        .iter()
        .filter(|item| {
            item.audit_status == AuditStatus::Warning
                && item.audit_score < AUDIT_HIGH_RISK_THRESHOLD
        })
        .count();
    let errors = items
        .iter()
        .filter(|item| item.audit_status == AuditStatus::Error)
        .count();

    run.status = RunStatus::Completed;
    run.error_count = errors;
    run.warning_count = warnings;
    run.overall_risk_score = overall_risk(high, warnings);
    run.risk_level = risk_level(run.overall_risk_score);
    run.metrics = json!({
        "documents_total": items.len(),
        "documents_high_risk": high,
        "error_count": errors,
        "warning_count": warnings,
        "total_amount_minor": total_amount_minor,
        "agent_retries": retries_total,
    });
    (run, items)
}

/// Bounded advisor subset: the riskiest documents first.
#[must_use]
pub fn advisor_documents(items: &[ReviewItem], limit: usize) -> Vec<Value> {
    let mut ranked: Vec<&ReviewItem> = items.iter().collect();
    ranked.sort_by(|a, b| {
        b.audit_score
            .partial_cmp(&a.audit_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
        .into_iter()
        .take(limit)
        .map(|item| {
            json!({
                "document_id": item.reference_id,
                "extracted": item.extracted,
                "audit_flags": item.audit_flags,
                "audit_score": item.audit_score,
                "audit_status": item.audit_status,
                "status": item.state,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use books_ledger::InMemoryLedgerStore;
    use books_ledger::LedgerStore;
    use books_ledger::ensure_default_accounts;
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

    fn defaults() -> DefaultAccounts {
        let store = InMemoryLedgerStore::new();
        store.insert_tenant(tenant(false)).expect("tenant");
        ensure_default_accounts(&store, &"tenant-1".to_string()).expect("defaults")
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, 15).expect("valid date")
    }

    fn doc(document_id: &str, extracted: ExtractedReceipt) -> ReceiptInput {
        ReceiptInput {
            document_id: document_id.into(),
            original_filename: "receipt.jpg".into(),
            extracted: Some(extracted),
            ..ReceiptInput::default()
        }
    }

    #[test]
    fn clean_receipt_audits_ok() {
        let (run, items) = run_receipts_review(
            &tenant(false),
            &defaults(),
            &[doc(
                "doc-1",
                ExtractedReceipt {
                    vendor: Some("Blue Bottle".into()),
                    total_minor: Some(1_450),
                    date_raw: Some("2025-04-10".into()),
                    currency: Some("USD".into()),
                    category: Some("Meals".into()),
                },
            )],
            today(),
        );

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].audit_status, AuditStatus::Ok);
        assert_eq!(items[0].audit_score, 5.0);
        assert!(items[0].audit_flags.is_empty());
        assert_eq!(run.error_count, 0);
        assert_eq!(run.overall_risk_score, 5.0);
    }

    #[test]
    fn missing_amount_and_vendor_is_an_error() {
        let (run, items) = run_receipts_review(
            &tenant(false),
            &defaults(),
            &[doc("doc-1", ExtractedReceipt::default())],
            today(),
        );

        let item = &items[0];
        assert_eq!(item.audit_status, AuditStatus::Error);
        assert_eq!(item.state, ItemState::Error);
        let codes: Vec<&str> = item.audit_flags.iter().map(|f| f.code.as_str()).collect();
        assert!(codes.contains(&"MISSING_AMOUNT"));
        assert!(codes.contains(&"MISSING_VENDOR"));
        assert!(codes.contains(&"INVALID_DATE"));
        assert_eq!(run.error_count, 1);
    }

    #[test]
    fn unusual_amount_is_high_risk() {
        let (run, items) = run_receipts_review(
            &tenant(false),
            &defaults(),
            &[doc(
                "doc-1",
                ExtractedReceipt {
                    vendor: Some("Dell".into()),
                    total_minor: Some(250_000),
                    date_raw: Some("2025-04-01".into()),
                    currency: Some("USD".into()),
                    category: None,
                },
            )],
            today(),
        );

        assert_eq!(items[0].audit_status, AuditStatus::Warning);
        assert!(items[0].audit_score >= AUDIT_HIGH_RISK_THRESHOLD);
        assert_eq!(
            run.metrics.get("documents_high_risk").and_then(Value::as_u64),
            Some(1)
        );
    }

    #[test]
    fn currency_mismatch_and_future_date_warn() {
        let (_, items) = run_receipts_review(
            &tenant(false),
            &defaults(),
            &[doc(
                "doc-1",
                ExtractedReceipt {
                    vendor: Some("Air Canada".into()),
                    total_minor: Some(9_900),
                    date_raw: Some("2025-07-01".into()),
                    currency: Some("CAD".into()),
                    category: None,
                },
            )],
            today(),
        );

        let codes: Vec<&str> = items[0]
            .audit_flags
            .iter()
            .map(|f| f.code.as_str())
            .collect();
        assert!(codes.contains(&"CURRENCY_MISMATCH"));
        assert!(codes.contains(&"FUTURE_DATE"));
        // 5 + 18 + 10
        assert_eq!(items[0].audit_score, 33.0);
    }

    #[test]
    fn companion_adds_reflective_flags_and_retries() {
        let (run, items) = run_receipts_review(
            &tenant(true),
            &defaults(),
            &[doc(
                "doc-1",
                ExtractedReceipt {
                    vendor: Some("Wire Transfer Services".into()),
                    total_minor: Some(4_000),
                    date_raw: Some("2025-04-01".into()),
                    currency: Some("USD".into()),
                    category: Some("Misc".into()),
                },
            )],
            today(),
        );

        let codes: Vec<&str> = items[0]
            .audit_flags
            .iter()
            .map(|f| f.code.as_str())
            .collect();
        assert!(codes.contains(&"VENDOR_PATTERN"));
        assert!(codes.contains(&"CATEGORY_WEAK"));
        assert_eq!(
            run.metrics.get("agent_retries").and_then(Value::as_u64),
            Some(1)
        );
    }

    #[test]
    fn hints_fill_extraction_gaps() {
        let input = ReceiptInput {
            document_id: "doc-1".into(),
            original_filename: "scan-0012.pdf".into(),
            extracted: None,
            vendor_hint: Some("Office Depot".into()),
            amount_hint_minor: Some(3_200),
            date_hint: Some(NaiveDate::from_ymd_opt(2025, 4, 2).expect("valid date")),
            currency_hint: None,
            category_hint: None,
        };
        let (_, items) = run_receipts_review(&tenant(false), &defaults(), &[input], today());
        assert_eq!(items[0].audit_status, AuditStatus::Ok);
    }

    #[test]
    fn intake_failures_short_circuit() {
        let input = ReceiptInput {
            document_id: "doc-1".into(),
            original_filename: "corrupt-scan.pdf".into(),
            ..ReceiptInput::default()
        };
        let (run, items) = run_receipts_review(&tenant(false), &defaults(), &[input], today());
        assert_eq!(items[0].state, ItemState::Error);
        assert_eq!(items[0].audit_score, 100.0);
        assert_eq!(run.error_count, 1);
    }

    #[test]
    fn advisor_subset_is_bounded_and_ranked() {
        let documents: Vec<ReceiptInput> = (0..30)
            .map(|i| {
                doc(
                    &format!("doc-{i}"),
                    ExtractedReceipt {
                        vendor: Some("Vendor".into()),
                        total_minor: Some(1_000 + i * 10_000),
                        date_raw: Some("2025-04-01".into()),
                        currency: Some("USD".into()),
                        category: None,
                    },
                )
            })
            .collect();
        let (_, items) = run_receipts_review(&tenant(false), &defaults(), &documents, today());
        let subset = advisor_documents(&items, 20);
        assert_eq!(subset.len(), 20);
        let first_score = subset[0].get("audit_score").and_then(Value::as_f64);
        let last_score = subset[19].get("audit_score").and_then(Value::as_f64);
        assert!(first_score >= last_score);
    }
}
