use books_ledger::BankAccount;
use books_ledger::BankTransaction;
use books_ledger::Invoice;
use books_ledger::InvoiceStatus;
use books_ledger::JournalEntry;
use books_ledger::JournalLine;
use books_ledger::LedgerResult;
use books_ledger::TaxRate;
use books_ledger::Tenant;
use books_ledger::ensure_default_accounts;
use chrono::Datelike;
use chrono::Utc;

use crate::AppState;

/// Seed a small demo tenant so the server is explorable out of the box.
/// Idempotent per process: the tenant insert fails on a second call and
/// the existing data is kept.
pub fn seed_demo_data(state: &AppState) -> LedgerResult<Tenant> {
    let tenant = state.store.insert_tenant(Tenant {
        id: "demo".into(),
        name: "Demo Books".into(),
        currency: "USD".into(),
        fiscal_year_start_month: 1,
        companion_enabled: true,
    })?;
    let defaults = ensure_default_accounts(state.store.as_ref(), &tenant.id)?;

    state.store.insert_bank_account(BankAccount {
        id: "demo-operating".into(),
        tenant_id: tenant.id.clone(),
        name: "Operating".into(),
        ledger_account_id: Some(defaults.cash.id.clone()),
        is_active: true,
    })?;

    state.store.insert_tax_rate(TaxRate {
        id: "demo-standard".into(),
        tenant_id: tenant.id.clone(),
        name: "Standard 15%".into(),
        rate_bps: 1_500,
        applies_to_sales: true,
        applies_to_purchases: true,
        is_active: true,
    })?;

    let today = Utc::now().date_naive();
    let month_start = today.with_day(1).unwrap_or(today);

    let mut sale = JournalEntry::new(tenant.id.clone(), month_start, "Storefront sales");
    sale.lines = vec![
        JournalLine::new(defaults.cash.id.clone(), 48_250, 0),
        JournalLine::new(defaults.sales.id.clone(), 0, 48_250),
    ];
    state.store.insert_entry(sale)?;

    state.store.insert_bank_transaction(BankTransaction::new(
        "demo-operating",
        month_start,
        "POS settlement",
        48_250,
    ))?;
    state.store.insert_bank_transaction(BankTransaction::new(
        "demo-operating",
        month_start,
        "Coffee supplies",
        -6_300,
    ))?;

    state.store.insert_invoice(Invoice {
        id: "demo-inv-1".into(),
        tenant_id: tenant.id.clone(),
        number: "INV-1001".into(),
        customer: "Riverside Cafe".into(),
        issue_date: month_start,
        due_date: None,
        grand_total_minor: 125_000,
        amount_paid_minor: 0,
        status: InvoiceStatus::Sent,
    })?;

    tracing::info!(tenant = %tenant.id, "seeded demo data");
    Ok(tenant)
}
