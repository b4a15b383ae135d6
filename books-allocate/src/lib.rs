#![deny(clippy::print_stdout, clippy::print_stderr)]

use books_ledger::Account;
use books_ledger::AccountId;
use books_ledger::AccountType;
use books_ledger::BankMatch;
use books_ledger::BankTxId;
use books_ledger::BankTxStatus;
use books_ledger::Bill;
use books_ledger::BillStatus;
use books_ledger::Invoice;
use books_ledger::InvoiceStatus;
use books_ledger::JournalEntry;
use books_ledger::JournalLine;
use books_ledger::LedgerError;
use books_ledger::LedgerStore;
use books_ledger::MatchType;
use books_ledger::TaxRateId;
use books_ledger::TaxTreatment;
use books_ledger::TenantId;
use books_ledger::ensure_default_accounts;
use books_ledger::recompute_transaction_status;
use books_ledger::split_amount;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub type AllocateResult<T> = Result<T, AllocateError>;

pub const DEFAULT_TOLERANCE_MINOR: i64 = 2;

#[derive(Debug, Error)]
pub enum AllocateError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn invalid(message: impl Into<String>) -> AllocateError {
    AllocateError::Validation(message.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationKind {
    Invoice,
    Bill,
    DirectIncome,
    DirectExpense,
    CreditNote,
}

/// One caller-supplied allocation: "this much of the bank transaction goes
/// to that target". `target_id` carries the invoice/bill id; `account_id`
/// carries the direct/credit-note account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub kind: AllocationKind,
    pub amount_minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_treatment: Option<TaxTreatment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_rate_id: Option<TaxRateId>,
}

/// Fee, rounding or overpayment side amount with its posting account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentInput {
    pub amount_minor: i64,
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub bank_transaction_id: BankTxId,
    pub allocations: Vec<Allocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees: Option<AdjustmentInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounding: Option<AdjustmentInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overpayment: Option<AdjustmentInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

fn require_account(
    store: &dyn LedgerStore,
    tenant_id: &TenantId,
    account_id: Option<&AccountId>,
) -> AllocateResult<Account> {
    let account_id =
        account_id.ok_or_else(|| invalid("An account_id is required for this allocation."))?;
    match store.account(tenant_id, account_id) {
        Ok(account) => Ok(account),
        Err(LedgerError::NotFound(_)) => {
            Err(invalid("Account does not belong to this business."))
        }
        Err(err) => Err(err.into()),
    }
}

/// Proportional share of `effect`, truncated toward zero; the final match
/// row absorbs residual cents.
fn proportional_share(amount: i64, effect: i64, base_total: i64) -> i64 {
    if base_total == 0 {
        return 0;
    }
    ((i128::from(amount) * i128::from(effect)) / i128::from(base_total)) as i64
}

/// Convert a bank transaction plus allocation targets into one balanced
/// journal entry, update the targets' paid amounts, and write the match
/// rows that drive the transaction status.
///
/// Every validation error is raised before the first write; the store is
/// untouched on failure.
pub fn allocate(
    store: &dyn LedgerStore,
    tenant_id: &TenantId,
    request: AllocationRequest,
) -> AllocateResult<JournalEntry> {
    if request.allocations.is_empty() {
        return Err(invalid("Provide at least one allocation."));
    }
    let tolerance = request.tolerance_minor.unwrap_or(DEFAULT_TOLERANCE_MINOR);
    if tolerance < 0 {
        return Err(invalid("Tolerance cannot be negative."));
    }

    let mut bank_tx = store.bank_transaction(tenant_id, &request.bank_transaction_id)?;
    let abs_amount = bank_tx.abs_amount_minor();
    if abs_amount == 0 {
        return Err(invalid("Cannot allocate a zero-amount transaction."));
    }

    if let Some(operation_id) = request.operation_id.as_deref()
        && let Some(existing) = store.entry_by_operation_id(tenant_id, operation_id)?
    {
        let linked = store
            .matches_for_transaction(&bank_tx.id)?
            .iter()
            .any(|m| m.journal_entry_id == existing.id);
        if linked {
            return Ok(existing);
        }
        return Err(invalid("Operation ID already used for another transaction."));
    }

    let bank_portion = abs_amount - bank_tx.allocated_minor;
    if bank_portion <= 0 {
        return Err(invalid(
            "This bank transaction has no remaining amount to allocate.",
        ));
    }
    if bank_tx.status == BankTxStatus::Excluded {
        return Err(invalid("Excluded transactions cannot be allocated."));
    }
    if !store.matches_for_transaction(&bank_tx.id)?.is_empty() {
        return Err(invalid("This bank transaction already has allocations."));
    }

    let is_deposit = bank_tx.is_deposit();
    let defaults = ensure_default_accounts(store, tenant_id)?;
    let bank_account = store.bank_account(tenant_id, &bank_tx.bank_account_id)?;
    let bank_ledger_account = match &bank_account.ledger_account_id {
        Some(account_id) => store.account(tenant_id, account_id)?,
        None => defaults.cash.clone(),
    };

    let mut allocation_sum = 0_i64;
    let mut invoice_allocations: Vec<(Invoice, i64)> = Vec::new();
    let mut bill_allocations: Vec<(Bill, i64)> = Vec::new();
    let mut credit_lines: Vec<(Account, i64)> = Vec::new();
    let mut debit_lines: Vec<(Account, i64)> = Vec::new();
    let mut tax_lines: Vec<(Account, i64, i64)> = Vec::new();
    let mut direct_count = 0_usize;
    // Gross amounts for direct/credit-note targets, in feed order; invoice
    // and bill amounts are appended after persistence, matching row order.
    let mut match_targets: Vec<i64> = Vec::new();

    for alloc in &request.allocations {
        let amount = alloc.amount_minor;
        if amount <= 0 {
            return Err(invalid("Allocation amounts must be positive."));
        }

        match alloc.kind {
            AllocationKind::Invoice => {
                if !is_deposit {
                    return Err(invalid("Invoice allocations require a deposit transaction."));
                }
                let invoice_id = alloc
                    .target_id
                    .as_deref()
                    .ok_or_else(|| invalid("Invoice allocations require an id."))?;
                let invoice = match store.invoice(tenant_id, &invoice_id.to_string()) {
                    Ok(invoice) => invoice,
                    Err(LedgerError::NotFound(_)) => {
                        return Err(invalid("Invoice not found for this business."));
                    }
                    Err(err) => return Err(err.into()),
                };
                if amount - invoice.remaining_minor() > tolerance {
                    return Err(invalid("Allocation exceeds the invoice balance."));
                }
                invoice_allocations.push((invoice, amount));
                allocation_sum += amount;
            }
            AllocationKind::Bill => {
                if is_deposit {
                    return Err(invalid("Bill allocations require a withdrawal transaction."));
                }
                let bill_id = alloc
                    .target_id
                    .as_deref()
                    .ok_or_else(|| invalid("Bill allocations require an id."))?;
                let bill = match store.bill(tenant_id, &bill_id.to_string()) {
                    Ok(bill) => bill,
                    Err(LedgerError::NotFound(_)) => {
                        return Err(invalid("Bill not found for this business."));
                    }
                    Err(err) => return Err(err.into()),
                };
                if amount - bill.remaining_minor() > tolerance {
                    return Err(invalid("Allocation exceeds the bill balance."));
                }
                bill_allocations.push((bill, amount));
                allocation_sum += amount;
            }
            AllocationKind::DirectIncome
            | AllocationKind::DirectExpense
            | AllocationKind::CreditNote => {
                let expects_deposit = alloc.kind != AllocationKind::DirectExpense;
                if expects_deposit && !is_deposit {
                    let message = match alloc.kind {
                        AllocationKind::DirectIncome => {
                            "Direct income requires a deposit transaction."
                        }
                        _ => "Credit note allocations require a deposit transaction.",
                    };
                    return Err(invalid(message));
                }
                if !expects_deposit && is_deposit {
                    return Err(invalid("Direct expense allocations require a withdrawal."));
                }

                let mut account = require_account(store, tenant_id, alloc.account_id.as_ref())?;
                // Categories are user editable and drift; never post income
                // to a non-income account or expense to a non-expense one.
                match alloc.kind {
                    AllocationKind::DirectIncome
                        if account.account_type != AccountType::Income =>
                    {
                        tracing::warn!(
                            account_code = %account.code,
                            "direct income allocation routed to default income account"
                        );
                        account = defaults.sales.clone();
                    }
                    AllocationKind::DirectExpense
                        if account.account_type != AccountType::Expense =>
                    {
                        tracing::warn!(
                            account_code = %account.code,
                            "direct expense allocation routed to default expense account"
                        );
                        account = defaults.operating_expenses.clone();
                    }
                    _ => {}
                }

                let taxable = matches!(
                    alloc.kind,
                    AllocationKind::DirectIncome | AllocationKind::DirectExpense
                ) && (alloc.tax_treatment.is_some() || alloc.tax_rate_id.is_some());
                let breakdown = if taxable {
                    let treatment = alloc.tax_treatment.unwrap_or(TaxTreatment::None);
                    if treatment == TaxTreatment::None {
                        split_amount(amount, TaxTreatment::None, 0)?
                    } else {
                        let rate_id = alloc
                            .tax_rate_id
                            .as_ref()
                            .ok_or_else(|| invalid("Tax rate is required when tax is enabled."))?;
                        let rate = match store.tax_rate(tenant_id, rate_id) {
                            Ok(rate) => rate,
                            Err(LedgerError::NotFound(_)) => {
                                return Err(invalid("Tax rate not found for this business."));
                            }
                            Err(err) => return Err(err.into()),
                        };
                        if !rate.is_active {
                            return Err(invalid("This tax rate is inactive."));
                        }
                        if alloc.kind == AllocationKind::DirectIncome && !rate.applies_to_sales {
                            return Err(invalid("This tax rate is not configured for sales."));
                        }
                        if alloc.kind == AllocationKind::DirectExpense
                            && !rate.applies_to_purchases
                        {
                            return Err(invalid("This tax rate is not configured for purchases."));
                        }
                        split_amount(amount, treatment, rate.rate_bps)?
                    }
                } else {
                    split_amount(amount, TaxTreatment::None, 0)?
                };

                match alloc.kind {
                    AllocationKind::DirectIncome => {
                        credit_lines.push((account, breakdown.net_minor));
                        if breakdown.tax_minor != 0 {
                            tax_lines.push((defaults.sales_tax.clone(), 0, breakdown.tax_minor));
                        }
                    }
                    AllocationKind::DirectExpense => {
                        debit_lines.push((account, breakdown.net_minor));
                        if breakdown.tax_minor != 0 {
                            tax_lines.push((
                                defaults.tax_recoverable.clone(),
                                breakdown.tax_minor,
                                0,
                            ));
                        }
                    }
                    AllocationKind::CreditNote => {
                        credit_lines.push((account, breakdown.net_minor));
                    }
                    _ => unreachable!("handled above"),
                }
                direct_count += 1;
                match_targets.push(breakdown.gross_minor);
                allocation_sum += breakdown.gross_minor;
            }
        }
    }

    let mut fee_amount = 0_i64;
    let mut fee_account: Option<Account> = None;
    if let Some(fees) = &request.fees {
        if fees.amount_minor <= 0 {
            return Err(invalid("Fee amount must be positive."));
        }
        fee_amount = fees.amount_minor;
        fee_account = Some(require_account(store, tenant_id, Some(&fees.account_id))?);
    }

    let mut rounding_amount = 0_i64;
    let mut rounding_account: Option<Account> = None;
    if let Some(rounding) = &request.rounding
        && rounding.amount_minor != 0
    {
        rounding_amount = rounding.amount_minor;
        rounding_account = Some(require_account(store, tenant_id, Some(&rounding.account_id))?);
    }

    let mut overpayment_amount = 0_i64;
    let mut overpayment_account: Option<Account> = None;
    if let Some(overpayment) = &request.overpayment {
        if !is_deposit {
            return Err(invalid("Overpayments are not valid for withdrawals."));
        }
        if overpayment.amount_minor <= 0 {
            return Err(invalid("Overpayment amount must be positive."));
        }
        overpayment_amount = overpayment.amount_minor;
        overpayment_account = Some(require_account(
            store,
            tenant_id,
            Some(&overpayment.account_id),
        )?);
    }

    let expected_bank = if is_deposit {
        allocation_sum + overpayment_amount - fee_amount - rounding_amount
    } else {
        allocation_sum + fee_amount + rounding_amount
    };
    let difference = bank_portion - expected_bank;
    if difference != 0 {
        if difference.abs() > tolerance {
            return Err(invalid("Allocations do not reconcile with the bank amount."));
        }
        // Cent-level residue is folded into rounding so the entry closes.
        if rounding_account.is_none() {
            rounding_account = Some(if is_deposit {
                defaults.sales.clone()
            } else {
                defaults.operating_expenses.clone()
            });
        }
        if is_deposit {
            rounding_amount -= difference;
        } else {
            rounding_amount += difference;
        }
    }

    let description_base = if bank_tx.description.is_empty() {
        "Bank reconciliation"
    } else {
        bank_tx.description.as_str()
    };
    let mut description: String = description_base.chars().take(200).collect();
    if let Some(user) = request.user.as_deref() {
        description = format!("{description} · {user}");
    }

    let mut entry = JournalEntry::new(tenant_id.clone(), bank_tx.date, description);
    entry.allocation_operation_id = request.operation_id.clone();

    let mut push_line = |account: &Account, debit: i64, credit: i64| {
        entry.lines.push(
            JournalLine::new(account.id.clone(), debit, credit),
        );
    };

    if is_deposit {
        push_line(&bank_ledger_account, bank_portion, 0);
    } else {
        push_line(&bank_ledger_account, 0, bank_portion);
    }
    for (_, amount) in &invoice_allocations {
        push_line(&defaults.receivable, 0, *amount);
    }
    for (_, amount) in &bill_allocations {
        push_line(&defaults.payable, *amount, 0);
    }
    for (account, amount) in &credit_lines {
        push_line(account, 0, *amount);
    }
    for (account, amount) in &debit_lines {
        push_line(account, *amount, 0);
    }
    for (account, debit, credit) in &tax_lines {
        push_line(account, *debit, *credit);
    }
    if let Some(account) = &fee_account
        && fee_amount > 0
    {
        push_line(account, fee_amount, 0);
    }
    if let Some(account) = &rounding_account
        && rounding_amount != 0
    {
        if rounding_amount > 0 {
            push_line(account, rounding_amount, 0);
        } else {
            push_line(account, 0, rounding_amount.abs());
        }
    }
    if let Some(account) = &overpayment_account
        && overpayment_amount > 0
    {
        push_line(account, 0, overpayment_amount);
    }

    // insert_entry re-checks balance and line signs; an imbalance here is
    // an engine bug, surfaced as an invariant error.
    let entry = store.insert_entry(entry)?;

    for (invoice, amount) in &mut invoice_allocations {
        invoice.amount_paid_minor += *amount;
        invoice.status = if invoice.remaining_minor() <= 0 {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Partial
        };
        store.save_invoice(invoice)?;
        match_targets.push(*amount);
    }
    for (bill, amount) in &mut bill_allocations {
        bill.amount_paid_minor += *amount;
        bill.status = if bill.remaining_minor() <= 0 {
            BillStatus::Paid
        } else {
            BillStatus::Partial
        };
        store.save_bill(bill)?;
        match_targets.push(*amount);
    }

    bank_tx.posted_entry_id = Some(entry.id.clone());
    let single_invoice = invoice_allocations.len() == 1
        && bill_allocations.is_empty()
        && direct_count == 0;
    let single_bill = bill_allocations.len() == 1
        && invoice_allocations.is_empty()
        && direct_count == 0;
    bank_tx.matched_invoice_id = single_invoice
        .then(|| invoice_allocations[0].0.id.clone());
    bank_tx.matched_bill_id = single_bill.then(|| bill_allocations[0].0.id.clone());

    // Spread fees and rounding across match rows so each row reflects net
    // cash received for its target; the last row absorbs residual cents.
    let mut match_amounts: Vec<i64> = Vec::new();
    if !match_targets.is_empty() {
        let base_total: i64 = match_targets.iter().sum();
        let desired_total = if is_deposit {
            bank_portion - overpayment_amount
        } else {
            bank_portion
        };
        let adjustment_delta = fee_amount + rounding_amount;
        let adjustment_effect = if is_deposit {
            -adjustment_delta
        } else {
            adjustment_delta
        };
        let mut running_total = 0_i64;
        for amount in &match_targets {
            let adjusted = amount + proportional_share(*amount, adjustment_effect, base_total);
            match_amounts.push(adjusted);
            running_total += adjusted;
        }
        if let Some(last) = match_amounts.last_mut() {
            *last += desired_total - running_total;
        }
    }
    if overpayment_amount > 0 {
        match_amounts.push(overpayment_amount);
    }
    if match_amounts.is_empty() {
        match_amounts.push(bank_portion);
    }

    for amount in match_amounts {
        let amount = amount.max(0);
        if amount == 0 {
            continue;
        }
        let mut row = BankMatch::new(
            bank_tx.id.clone(),
            entry.id.clone(),
            MatchType::OneToOne,
            1.0,
            amount,
        );
        row.reconciled_by = request.user.clone();
        store.insert_match(row)?;
    }

    let matches = store.matches_for_transaction(&bank_tx.id)?;
    recompute_transaction_status(&mut bank_tx, &matches)?;
    store.save_bank_transaction(&bank_tx)?;

    tracing::info!(
        tenant = %tenant_id,
        bank_transaction = %bank_tx.id,
        entry = %entry.id,
        status = ?bank_tx.status,
        "allocated bank transaction"
    );
    Ok(entry)
}
