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

pub use crate::receipts::advisor_documents;

/// Inbound invoice payload from the extraction collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedInvoice {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub total_minor: Option<i64>,
    #[serde(default)]
    pub date_raw: Option<String>,
    #[serde(default)]
    pub due_date_raw: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceInput {
    pub document_id: String,
    #[serde(default)]
    pub original_filename: String,
    #[serde(default)]
    pub extracted: Option<ExtractedInvoice>,
    #[serde(default)]
    pub vendor_hint: Option<String>,
    #[serde(default)]
    pub amount_hint_minor: Option<i64>,
    #[serde(default)]
    pub date_hint: Option<NaiveDate>,
    #[serde(default)]
    pub currency_hint: Option<String>,
}

/// Filename amounts below 50.00 are treated as noise for invoices.
const FILENAME_AMOUNT_FLOOR_MINOR: i64 = 5_000;

struct Audit {
    flags: Vec<AuditFlag>,
    score: f64,
    status: AuditStatus,
    explanations: Vec<String>,
    retries: usize,
}

fn audit_invoice(
    vendor: &str,
    invoice_number: &str,
    total_minor: i64,
    date_raw: Option<&str>,
    due_date_raw: Option<&str>,
    currency: &str,
    companion_enabled: bool,
    tenant_currency: &str,
    today: NaiveDate,
) -> Audit {
    let mut flags: Vec<AuditFlag> = Vec::new();
    let mut explanations: Vec<String> = Vec::new();
    let mut score = 5.0_f64;
    let mut retries = 0_usize;

    if !currency.is_empty() && !tenant_currency.is_empty() && currency != tenant_currency {
        flags.push(AuditFlag::new(
            "CURRENCY_MISMATCH",
            Severity::Medium,
            format!("Invoice currency {currency} differs from business default {tenant_currency}."),
        ));
        score += 18.0;
    }

    if total_minor <= 0 {
        flags.push(AuditFlag::new(
            "MISSING_AMOUNT",
            Severity::High,
            "No total amount detected.",
        ));
        explanations.push("Amount missing or zero.".into());
        score += 50.0;
    } else if total_minor >= 500_000 {
        flags.push(AuditFlag::new(
            "UNUSUAL_AMOUNT",
            Severity::High,
            "Amount above normal threshold.",
        ));
        score += 55.0;
    } else if total_minor >= 150_000 {
        flags.push(AuditFlag::new(
            "LARGE_AMOUNT",
            Severity::Medium,
            "Invoice larger than typical.",
        ));
        score += 25.0;
    }

    if invoice_number.trim().is_empty() {
        flags.push(AuditFlag::new(
            "MISSING_INVOICE_NUMBER",
            Severity::High,
            "Invoice number missing.",
        ));
        score += 35.0;
    }

    if vendor.trim().is_empty() {
        flags.push(AuditFlag::new(
            "MISSING_VENDOR",
            Severity::High,
            "Vendor missing.",
        ));
        score += 35.0;
    }

    match date_raw.and_then(parse_iso_date) {
        Some(date) if date > today => {
            flags.push(AuditFlag::new(
                "FUTURE_DATE",
                Severity::Medium,
                "Invoice date is in the future.",
            ));
            score += 15.0;
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

    if let Some(due) = due_date_raw.and_then(parse_iso_date)
        && due < today
    {
        flags.push(AuditFlag::new(
            "OVERDUE",
            Severity::Medium,
            "Invoice appears overdue.",
        ));
        score += 10.0;
    }

    if companion_enabled {
        if total_minor > 0 && total_minor < FILENAME_AMOUNT_FLOOR_MINOR {
            flags.push(AuditFlag::new(
                "SMALL_AMOUNT",
                Severity::Low,
                "Amount unusually small for an invoice.",
            ));
            score += 5.0;
        }
        if !flags.is_empty() {
            retries += 1;
            explanations.push("Companion reviewed extracted fields for mismatches.".into());
        }
    }

    let has_high = flags.iter().any(|f| f.severity == Severity::High);
    let mut status = AuditStatus::Ok;
    if score >= RISK_WARNING_THRESHOLD || has_high {
        status = AuditStatus::Warning;
    }
    if flags.iter().any(|f| {
        f.severity == Severity::High
            && matches!(
                f.code.as_str(),
                "MISSING_AMOUNT" | "MISSING_VENDOR" | "MISSING_INVOICE_NUMBER"
            )
    }) {
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

/// Deterministic invoices pipeline; mirrors the receipts flow with
/// invoice-specific thresholds, invoice-number and due-date checks.
pub fn run_invoices_review(
    tenant: &Tenant,
    defaults: &DefaultAccounts,
    documents: &[InvoiceInput],
    today: NaiveDate,
) -> (ReviewRun, Vec<ReviewItem>) {
    let mut run = ReviewRun::new(tenant.id.clone(), RunKind::Invoices);
    let mut items: Vec<ReviewItem> = Vec::new();
    let mut retries_total = 0_usize;
    let mut total_amount_minor = 0_i64;
    let mut overdue_total_minor = 0_i64;
    let mut overdue_count = 0_usize;
    let tenant_currency = tenant.currency.to_uppercase();

    for doc in documents {
        let extracted = doc.extracted.clone().unwrap_or_default();
        let vendor = extracted
            .vendor
            .or_else(|| doc.vendor_hint.clone())
            .unwrap_or_default();
        let invoice_number = extracted.invoice_number.unwrap_or_default();
        let total_minor = extracted
            .total_minor
            .or(doc.amount_hint_minor)
            .or_else(|| {
                infer_amount_from_filename(&doc.original_filename, FILENAME_AMOUNT_FLOOR_MINOR)
            })
            .unwrap_or(0);
        let date_raw = extracted
            .date_raw
            .or_else(|| doc.date_hint.map(|d| d.to_string()));
        let currency = extracted
            .currency
            .or_else(|| doc.currency_hint.clone())
            .unwrap_or_else(|| tenant_currency.clone())
            .to_uppercase();

        let audit = audit_invoice(
            &vendor,
            &invoice_number,
            total_minor,
            date_raw.as_deref(),
            extracted.due_date_raw.as_deref(),
            &currency,
            tenant.companion_enabled,
            &tenant_currency,
            today,
        );
        retries_total += audit.retries;
        total_amount_minor += total_minor.max(0);
        if audit.flags.iter().any(|f| f.code == "OVERDUE") {
            overdue_total_minor += total_minor.max(0);
            overdue_count += 1;
        }

        let proposed = json!({
            "memo": format!("Invoice {} from {}",
                if invoice_number.is_empty() { "(unnumbered)" } else { &invoice_number },
                if vendor.is_empty() { "unknown vendor" } else { &vendor }),
            "lines": [
                {"account_code": defaults.operating_expenses.code, "debit_minor": total_minor, "credit_minor": 0},
                {"account_code": defaults.payable.code, "debit_minor": 0, "credit_minor": total_minor},
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
                "vendor": vendor,
                "invoice_number": invoice_number,
                "total_minor": total_minor,
                "date": date_raw,
                "due_date": extracted.due_date_raw,
                "currency": currency,
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
        "overdue_total_minor": overdue_total_minor,
        "overdue_count": overdue_count,
        "agent_retries": retries_total,
    });
    (run, items)
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

    fn invoice(document_id: &str, extracted: ExtractedInvoice) -> InvoiceInput {
        InvoiceInput {
            document_id: document_id.into(),
            original_filename: "invoice.pdf".into(),
            extracted: Some(extracted),
            ..InvoiceInput::default()
        }
    }

    #[test]
    fn complete_invoice_audits_ok() {
        let (run, items) = run_invoices_review(
            &tenant(false),
            &defaults(),
            &[invoice(
                "doc-1",
                ExtractedInvoice {
                    vendor: Some("Acme Supplies".into()),
                    invoice_number: Some("INV-001".into()),
                    total_minor: Some(48_000),
                    date_raw: Some("2025-04-01".into()),
                    due_date_raw: Some("2025-05-01".into()),
                    currency: Some("USD".into()),
                },
            )],
            today(),
        );

        assert_eq!(items[0].audit_status, AuditStatus::Ok);
        assert_eq!(items[0].audit_score, 5.0);
        assert_eq!(run.error_count, 0);
    }

    #[test]
    fn missing_invoice_number_is_an_error() {
        let (_, items) = run_invoices_review(
            &tenant(false),
            &defaults(),
            &[invoice(
                "doc-1",
                ExtractedInvoice {
                    vendor: Some("Acme".into()),
                    invoice_number: None,
                    total_minor: Some(48_000),
                    date_raw: Some("2025-04-01".into()),
                    due_date_raw: None,
                    currency: Some("USD".into()),
                },
            )],
            today(),
        );

        assert_eq!(items[0].audit_status, AuditStatus::Error);
        let codes: Vec<&str> = items[0]
            .audit_flags
            .iter()
            .map(|f| f.code.as_str())
            .collect();
        assert!(codes.contains(&"MISSING_INVOICE_NUMBER"));
    }

    #[test]
    fn overdue_invoices_roll_into_metrics() {
        let (run, items) = run_invoices_review(
            &tenant(false),
            &defaults(),
            &[invoice(
                "doc-1",
                ExtractedInvoice {
                    vendor: Some("Acme".into()),
                    invoice_number: Some("INV-002".into()),
                    total_minor: Some(80_000),
                    date_raw: Some("2025-02-15".into()),
                    due_date_raw: Some("2025-03-15".into()),
                    currency: Some("USD".into()),
                },
            )],
            today(),
        );

        let codes: Vec<&str> = items[0]
            .audit_flags
            .iter()
            .map(|f| f.code.as_str())
            .collect();
        assert!(codes.contains(&"OVERDUE"));
        assert_eq!(
            run.metrics.get("overdue_count").and_then(Value::as_u64),
            Some(1)
        );
        assert_eq!(
            run.metrics
                .get("overdue_total_minor")
                .and_then(Value::as_i64),
            Some(80_000)
        );
    }

    #[test]
    fn unusual_amount_uses_invoice_thresholds() {
        let (_, items) = run_invoices_review(
            &tenant(false),
            &defaults(),
            &[invoice(
                "doc-1",
                ExtractedInvoice {
                    vendor: Some("Acme".into()),
                    invoice_number: Some("INV-003".into()),
                    // Above the receipts threshold but below the invoice one.
                    total_minor: Some(200_000),
                    date_raw: Some("2025-04-01".into()),
                    due_date_raw: None,
                    currency: Some("USD".into()),
                },
            )],
            today(),
        );

        let codes: Vec<&str> = items[0]
            .audit_flags
            .iter()
            .map(|f| f.code.as_str())
            .collect();
        assert!(codes.contains(&"LARGE_AMOUNT"));
        assert!(!codes.contains(&"UNUSUAL_AMOUNT"));
        // 5 + 25
        assert_eq!(items[0].audit_score, 30.0);
    }

    #[test]
    fn companion_flags_small_amounts() {
        let (_, items) = run_invoices_review(
            &tenant(true),
            &defaults(),
            &[invoice(
                "doc-1",
                ExtractedInvoice {
                    vendor: Some("Acme".into()),
                    invoice_number: Some("INV-004".into()),
                    total_minor: Some(1_200),
                    date_raw: Some("2025-04-01".into()),
                    due_date_raw: None,
                    currency: Some("USD".into()),
                },
            )],
            today(),
        );

        let codes: Vec<&str> = items[0]
            .audit_flags
            .iter()
            .map(|f| f.code.as_str())
            .collect();
        assert!(codes.contains(&"SMALL_AMOUNT"));
    }
}
