use std::collections::HashMap;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;

use crate::Account;
use crate::AccountId;
use crate::AccountType;
use crate::BankAccount;
use crate::BankAccountId;
use crate::BankMatch;
use crate::BankTransaction;
use crate::BankTxId;
use crate::Bill;
use crate::BillId;
use crate::EntryId;
use crate::Invoice;
use crate::InvoiceId;
use crate::JournalEntry;
use crate::LedgerError;
use crate::LedgerResult;
use crate::LedgerStore;
use crate::ReconciliationSession;
use crate::SessionId;
use crate::TaxRate;
use crate::TaxRateId;
use crate::Tenant;
use crate::TenantId;

#[derive(Debug, Default)]
struct LedgerState {
    tenants: HashMap<TenantId, Tenant>,
    accounts: HashMap<AccountId, Account>,
    entries: HashMap<EntryId, JournalEntry>,
    bank_accounts: HashMap<BankAccountId, BankAccount>,
    bank_transactions: HashMap<BankTxId, BankTransaction>,
    matches: HashMap<String, BankMatch>,
    sessions: HashMap<SessionId, ReconciliationSession>,
    invoices: HashMap<InvoiceId, Invoice>,
    bills: HashMap<BillId, Bill>,
    tax_rates: HashMap<TaxRateId, TaxRate>,
}

impl LedgerState {
    fn tenant_of_transaction(&self, tx: &BankTransaction) -> Option<&TenantId> {
        self.bank_accounts
            .get(&tx.bank_account_id)
            .map(|account| &account.tenant_id)
    }
}

/// In-memory system of record. Mutating operations take the write lock for
/// their full duration, so a request's writes are applied as one unit.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<LedgerState>,
}

impl InMemoryLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_read<F, T>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&LedgerState) -> LedgerResult<T>,
    {
        let guard = self
            .state
            .read()
            .map_err(|_| LedgerError::Storage("ledger store poisoned".into()))?;
        f(&guard)
    }

    fn with_write<F, T>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut LedgerState) -> LedgerResult<T>,
    {
        let mut guard = self
            .state
            .write()
            .map_err(|_| LedgerError::Storage("ledger store poisoned".into()))?;
        f(&mut guard)
    }
}

fn not_found(kind: &str, id: &str) -> LedgerError {
    LedgerError::NotFound(format!("{kind} {id}"))
}

impl LedgerStore for InMemoryLedgerStore {
    fn insert_tenant(&self, tenant: Tenant) -> LedgerResult<Tenant> {
        self.with_write(|state| {
            if state.tenants.contains_key(&tenant.id) {
                return Err(LedgerError::Validation(format!(
                    "tenant {} already exists",
                    tenant.id
                )));
            }
            state.tenants.insert(tenant.id.clone(), tenant.clone());
            Ok(tenant)
        })
    }

    fn tenant(&self, tenant_id: &TenantId) -> LedgerResult<Tenant> {
        self.with_read(|state| {
            state
                .tenants
                .get(tenant_id)
                .cloned()
                .ok_or_else(|| not_found("tenant", tenant_id))
        })
    }

    fn upsert_account(&self, account: Account) -> LedgerResult<Account> {
        self.with_write(|state| {
            if !state.tenants.contains_key(&account.tenant_id) {
                return Err(not_found("tenant", &account.tenant_id));
            }
            state.accounts.insert(account.id.clone(), account.clone());
            Ok(account)
        })
    }

    fn account(&self, tenant_id: &TenantId, account_id: &AccountId) -> LedgerResult<Account> {
        self.with_read(|state| {
            state
                .accounts
                .get(account_id)
                .filter(|account| &account.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| not_found("account", account_id))
        })
    }

    fn account_by_code(&self, tenant_id: &TenantId, code: &str) -> LedgerResult<Option<Account>> {
        self.with_read(|state| {
            Ok(state
                .accounts
                .values()
                .find(|account| &account.tenant_id == tenant_id && account.code == code)
                .cloned())
        })
    }

    fn get_or_create_account(
        &self,
        tenant_id: &TenantId,
        code: &str,
        name: &str,
        account_type: AccountType,
    ) -> LedgerResult<Account> {
        self.with_write(|state| {
            if !state.tenants.contains_key(tenant_id) {
                return Err(not_found("tenant", tenant_id));
            }
            if let Some(existing) = state
                .accounts
                .values()
                .find(|account| &account.tenant_id == tenant_id && account.code == code)
            {
                return Ok(existing.clone());
            }
            let account = Account {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: tenant_id.clone(),
                code: code.to_string(),
                name: name.to_string(),
                account_type,
                is_active: true,
            };
            state.accounts.insert(account.id.clone(), account.clone());
            Ok(account)
        })
    }

    fn list_accounts(&self, tenant_id: &TenantId) -> LedgerResult<Vec<Account>> {
        self.with_read(|state| {
            let mut accounts: Vec<Account> = state
                .accounts
                .values()
                .filter(|account| &account.tenant_id == tenant_id)
                .cloned()
                .collect();
            accounts.sort_by(|a, b| a.code.cmp(&b.code));
            Ok(accounts)
        })
    }

    fn balance_as_of(
        &self,
        tenant_id: &TenantId,
        account_id: &AccountId,
        as_of: NaiveDate,
    ) -> LedgerResult<i64> {
        self.with_read(|state| {
            let account = state
                .accounts
                .get(account_id)
                .filter(|account| &account.tenant_id == tenant_id)
                .ok_or_else(|| not_found("account", account_id))?;

            let mut debit = 0_i64;
            let mut credit = 0_i64;
            for entry in state.entries.values() {
                if &entry.tenant_id != tenant_id || entry.is_void || entry.date > as_of {
                    continue;
                }
                for line in &entry.lines {
                    if &line.account_id == account_id {
                        debit += line.debit_minor;
                        credit += line.credit_minor;
                    }
                }
            }
            if account.account_type.debit_normal() {
                Ok(debit - credit)
            } else {
                Ok(credit - debit)
            }
        })
    }

    fn insert_entry(&self, mut entry: JournalEntry) -> LedgerResult<JournalEntry> {
        entry.normalize_lines()?;
        if !entry.is_balanced() {
            return Err(LedgerError::Invariant(format!(
                "journal entry {} is not balanced",
                entry.id
            )));
        }
        self.with_write(|state| {
            if !state.tenants.contains_key(&entry.tenant_id) {
                return Err(not_found("tenant", &entry.tenant_id));
            }
            for line in &entry.lines {
                let known = state
                    .accounts
                    .get(&line.account_id)
                    .is_some_and(|account| account.tenant_id == entry.tenant_id);
                if !known {
                    return Err(not_found("account", &line.account_id));
                }
            }
            state.entries.insert(entry.id.clone(), entry.clone());
            Ok(entry)
        })
    }

    fn save_entry(&self, entry: &JournalEntry) -> LedgerResult<()> {
        self.with_write(|state| {
            if !state.entries.contains_key(&entry.id) {
                return Err(not_found("journal entry", &entry.id));
            }
            state.entries.insert(entry.id.clone(), entry.clone());
            Ok(())
        })
    }

    fn entry(&self, tenant_id: &TenantId, entry_id: &EntryId) -> LedgerResult<JournalEntry> {
        self.with_read(|state| {
            state
                .entries
                .get(entry_id)
                .filter(|entry| &entry.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| not_found("journal entry", entry_id))
        })
    }

    fn entry_by_operation_id(
        &self,
        tenant_id: &TenantId,
        operation_id: &str,
    ) -> LedgerResult<Option<JournalEntry>> {
        self.with_read(|state| {
            Ok(state
                .entries
                .values()
                .find(|entry| {
                    &entry.tenant_id == tenant_id
                        && entry.allocation_operation_id.as_deref() == Some(operation_id)
                })
                .cloned())
        })
    }

    fn list_entries(&self, tenant_id: &TenantId) -> LedgerResult<Vec<JournalEntry>> {
        self.with_read(|state| {
            let mut entries: Vec<JournalEntry> = state
                .entries
                .values()
                .filter(|entry| &entry.tenant_id == tenant_id)
                .cloned()
                .collect();
            entries.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
            Ok(entries)
        })
    }

    fn set_lines_reconciled(
        &self,
        entry_id: &EntryId,
        account_id: &AccountId,
        session_id: Option<SessionId>,
        reconciled: bool,
        at: Option<DateTime<Utc>>,
    ) -> LedgerResult<()> {
        self.with_write(|state| {
            let entry = state
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| not_found("journal entry", entry_id))?;
            for line in &mut entry.lines {
                if &line.account_id == account_id {
                    line.is_reconciled = reconciled;
                    line.reconciled_at = if reconciled { at } else { None };
                    line.reconciliation_session_id =
                        if reconciled { session_id.clone() } else { None };
                }
            }
            Ok(())
        })
    }

    fn clear_session_line_flags(&self, session_id: &SessionId) -> LedgerResult<()> {
        self.with_write(|state| {
            for entry in state.entries.values_mut() {
                for line in &mut entry.lines {
                    if line.reconciliation_session_id.as_ref() == Some(session_id) {
                        line.is_reconciled = false;
                        line.reconciled_at = None;
                        line.reconciliation_session_id = None;
                    }
                }
            }
            Ok(())
        })
    }

    fn insert_bank_account(&self, account: BankAccount) -> LedgerResult<BankAccount> {
        self.with_write(|state| {
            if !state.tenants.contains_key(&account.tenant_id) {
                return Err(not_found("tenant", &account.tenant_id));
            }
            state
                .bank_accounts
                .insert(account.id.clone(), account.clone());
            Ok(account)
        })
    }

    fn bank_account(
        &self,
        tenant_id: &TenantId,
        bank_account_id: &BankAccountId,
    ) -> LedgerResult<BankAccount> {
        self.with_read(|state| {
            state
                .bank_accounts
                .get(bank_account_id)
                .filter(|account| &account.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| not_found("bank account", bank_account_id))
        })
    }

    fn list_bank_accounts(&self, tenant_id: &TenantId) -> LedgerResult<Vec<BankAccount>> {
        self.with_read(|state| {
            let mut accounts: Vec<BankAccount> = state
                .bank_accounts
                .values()
                .filter(|account| &account.tenant_id == tenant_id)
                .cloned()
                .collect();
            accounts.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(accounts)
        })
    }

    fn insert_bank_transaction(&self, tx: BankTransaction) -> LedgerResult<BankTransaction> {
        self.with_write(|state| {
            if !state.bank_accounts.contains_key(&tx.bank_account_id) {
                return Err(not_found("bank account", &tx.bank_account_id));
            }
            state
                .bank_transactions
                .insert(tx.id.clone(), tx.clone());
            Ok(tx)
        })
    }

    fn save_bank_transaction(&self, tx: &BankTransaction) -> LedgerResult<()> {
        self.with_write(|state| {
            if !state.bank_transactions.contains_key(&tx.id) {
                return Err(not_found("bank transaction", &tx.id));
            }
            state.bank_transactions.insert(tx.id.clone(), tx.clone());
            Ok(())
        })
    }

    fn bank_transaction(
        &self,
        tenant_id: &TenantId,
        tx_id: &BankTxId,
    ) -> LedgerResult<BankTransaction> {
        self.with_read(|state| {
            state
                .bank_transactions
                .get(tx_id)
                .filter(|tx| state.tenant_of_transaction(tx) == Some(tenant_id))
                .cloned()
                .ok_or_else(|| not_found("bank transaction", tx_id))
        })
    }

    fn list_bank_transactions(
        &self,
        tenant_id: &TenantId,
        bank_account_id: &BankAccountId,
    ) -> LedgerResult<Vec<BankTransaction>> {
        self.with_read(|state| {
            let owned = state
                .bank_accounts
                .get(bank_account_id)
                .is_some_and(|account| &account.tenant_id == tenant_id);
            if !owned {
                return Err(not_found("bank account", bank_account_id));
            }
            let mut transactions: Vec<BankTransaction> = state
                .bank_transactions
                .values()
                .filter(|tx| &tx.bank_account_id == bank_account_id)
                .cloned()
                .collect();
            transactions.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));
            Ok(transactions)
        })
    }

    fn insert_match(&self, bank_match: BankMatch) -> LedgerResult<BankMatch> {
        if bank_match.matched_amount_minor <= 0 {
            return Err(LedgerError::Validation(
                "matched amount must be positive".into(),
            ));
        }
        self.with_write(|state| {
            if !state
                .bank_transactions
                .contains_key(&bank_match.bank_transaction_id)
            {
                return Err(not_found(
                    "bank transaction",
                    &bank_match.bank_transaction_id,
                ));
            }
            state
                .matches
                .insert(bank_match.id.clone(), bank_match.clone());
            Ok(bank_match)
        })
    }

    fn matches_for_transaction(&self, tx_id: &BankTxId) -> LedgerResult<Vec<BankMatch>> {
        self.with_read(|state| {
            let mut matches: Vec<BankMatch> = state
                .matches
                .values()
                .filter(|m| &m.bank_transaction_id == tx_id)
                .cloned()
                .collect();
            matches.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(matches)
        })
    }

    fn delete_matches_for_transaction(&self, tx_id: &BankTxId) -> LedgerResult<Vec<BankMatch>> {
        self.with_write(|state| {
            let removed: Vec<BankMatch> = state
                .matches
                .values()
                .filter(|m| &m.bank_transaction_id == tx_id)
                .cloned()
                .collect();
            state.matches.retain(|_, m| &m.bank_transaction_id != tx_id);
            Ok(removed)
        })
    }

    fn insert_session(
        &self,
        session: ReconciliationSession,
    ) -> LedgerResult<ReconciliationSession> {
        self.with_write(|state| {
            if !state.tenants.contains_key(&session.tenant_id) {
                return Err(not_found("tenant", &session.tenant_id));
            }
            state.sessions.insert(session.id.clone(), session.clone());
            Ok(session)
        })
    }

    fn save_session(&self, session: &ReconciliationSession) -> LedgerResult<()> {
        self.with_write(|state| {
            if !state.sessions.contains_key(&session.id) {
                return Err(not_found("reconciliation session", &session.id));
            }
            state.sessions.insert(session.id.clone(), session.clone());
            Ok(())
        })
    }

    fn session(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
    ) -> LedgerResult<ReconciliationSession> {
        self.with_read(|state| {
            state
                .sessions
                .get(session_id)
                .filter(|session| &session.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| not_found("reconciliation session", session_id))
        })
    }

    fn find_session(
        &self,
        tenant_id: &TenantId,
        bank_account_id: &BankAccountId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> LedgerResult<Option<ReconciliationSession>> {
        self.with_read(|state| {
            Ok(state
                .sessions
                .values()
                .find(|session| {
                    &session.tenant_id == tenant_id
                        && &session.bank_account_id == bank_account_id
                        && session.statement_start_date == start
                        && session.statement_end_date == end
                })
                .cloned())
        })
    }

    fn delete_session(&self, tenant_id: &TenantId, session_id: &SessionId) -> LedgerResult<()> {
        self.with_write(|state| {
            let owned = state
                .sessions
                .get(session_id)
                .is_some_and(|session| &session.tenant_id == tenant_id);
            if !owned {
                return Err(not_found("reconciliation session", session_id));
            }
            state.sessions.remove(session_id);
            Ok(())
        })
    }

    fn insert_invoice(&self, invoice: Invoice) -> LedgerResult<Invoice> {
        self.with_write(|state| {
            if !state.tenants.contains_key(&invoice.tenant_id) {
                return Err(not_found("tenant", &invoice.tenant_id));
            }
            state.invoices.insert(invoice.id.clone(), invoice.clone());
            Ok(invoice)
        })
    }

    fn save_invoice(&self, invoice: &Invoice) -> LedgerResult<()> {
        self.with_write(|state| {
            if !state.invoices.contains_key(&invoice.id) {
                return Err(not_found("invoice", &invoice.id));
            }
            state.invoices.insert(invoice.id.clone(), invoice.clone());
            Ok(())
        })
    }

    fn invoice(&self, tenant_id: &TenantId, invoice_id: &InvoiceId) -> LedgerResult<Invoice> {
        self.with_read(|state| {
            state
                .invoices
                .get(invoice_id)
                .filter(|invoice| &invoice.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| not_found("invoice", invoice_id))
        })
    }

    fn list_invoices(&self, tenant_id: &TenantId) -> LedgerResult<Vec<Invoice>> {
        self.with_read(|state| {
            let mut invoices: Vec<Invoice> = state
                .invoices
                .values()
                .filter(|invoice| &invoice.tenant_id == tenant_id)
                .cloned()
                .collect();
            invoices.sort_by(|a, b| a.issue_date.cmp(&b.issue_date).then_with(|| a.id.cmp(&b.id)));
            Ok(invoices)
        })
    }

    fn insert_bill(&self, bill: Bill) -> LedgerResult<Bill> {
        self.with_write(|state| {
            if !state.tenants.contains_key(&bill.tenant_id) {
                return Err(not_found("tenant", &bill.tenant_id));
            }
            state.bills.insert(bill.id.clone(), bill.clone());
            Ok(bill)
        })
    }

    fn save_bill(&self, bill: &Bill) -> LedgerResult<()> {
        self.with_write(|state| {
            if !state.bills.contains_key(&bill.id) {
                return Err(not_found("bill", &bill.id));
            }
            state.bills.insert(bill.id.clone(), bill.clone());
            Ok(())
        })
    }

    fn bill(&self, tenant_id: &TenantId, bill_id: &BillId) -> LedgerResult<Bill> {
        self.with_read(|state| {
            state
                .bills
                .get(bill_id)
                .filter(|bill| &bill.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| not_found("bill", bill_id))
        })
    }

    fn list_bills(&self, tenant_id: &TenantId) -> LedgerResult<Vec<Bill>> {
        self.with_read(|state| {
            let mut bills: Vec<Bill> = state
                .bills
                .values()
                .filter(|bill| &bill.tenant_id == tenant_id)
                .cloned()
                .collect();
            bills.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
            Ok(bills)
        })
    }

    fn insert_tax_rate(&self, rate: TaxRate) -> LedgerResult<TaxRate> {
        self.with_write(|state| {
            if !state.tenants.contains_key(&rate.tenant_id) {
                return Err(not_found("tenant", &rate.tenant_id));
            }
            state.tax_rates.insert(rate.id.clone(), rate.clone());
            Ok(rate)
        })
    }

    fn tax_rate(&self, tenant_id: &TenantId, rate_id: &TaxRateId) -> LedgerResult<TaxRate> {
        self.with_read(|state| {
            state
                .tax_rates
                .get(rate_id)
                .filter(|rate| &rate.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| not_found("tax rate", rate_id))
        })
    }
}
