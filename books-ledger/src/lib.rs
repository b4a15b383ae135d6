#![deny(clippy::print_stdout, clippy::print_stderr)]

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

mod defaults;
mod memory;
mod tax;

pub use defaults::DEFAULT_CHART;
pub use defaults::DefaultAccounts;
pub use defaults::SUSPENSE_ACCOUNT_CODE;
pub use defaults::ensure_default_accounts;
pub use defaults::ensure_suspense_account;
pub use memory::InMemoryLedgerStore;
pub use tax::TaxBreakdown;
pub use tax::TaxTreatment;
pub use tax::split_amount;

pub type TenantId = String;
pub type AccountId = String;
pub type EntryId = String;
pub type LineId = String;
pub type BankAccountId = String;
pub type BankTxId = String;
pub type MatchId = String;
pub type SessionId = String;
pub type InvoiceId = String;
pub type BillId = String;
pub type TaxRateId = String;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Render a minor-unit amount as a 2-dp decimal string, e.g. `-115.00`.
#[must_use]
pub fn format_minor(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub currency: String,
    pub fiscal_year_start_month: u8,
    pub companion_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl AccountType {
    /// Asset and expense balances grow with debits; the rest with credits.
    #[must_use]
    pub fn debit_normal(self) -> bool {
        matches!(self, AccountType::Asset | AccountType::Expense)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub tenant_id: TenantId,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    pub id: LineId,
    pub account_id: AccountId,
    pub debit_minor: i64,
    pub credit_minor: i64,
    pub description: String,
    pub is_reconciled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_session_id: Option<SessionId>,
}

impl JournalLine {
    #[must_use]
    pub fn new(account_id: impl Into<AccountId>, debit_minor: i64, credit_minor: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            debit_minor,
            credit_minor,
            description: String::new(),
            is_reconciled: false,
            reconciled_at: None,
            reconciliation_session_id: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub date: NaiveDate,
    pub description: String,
    pub is_void: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_operation_id: Option<String>,
    pub lines: Vec<JournalLine>,
}

impl JournalEntry {
    #[must_use]
    pub fn new(tenant_id: impl Into<TenantId>, date: NaiveDate, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            date,
            description: description.into(),
            is_void: false,
            allocation_operation_id: None,
            lines: Vec::new(),
        }
    }

    #[must_use]
    pub fn total_debit_minor(&self) -> i64 {
        self.lines.iter().map(|line| line.debit_minor).sum()
    }

    #[must_use]
    pub fn total_credit_minor(&self) -> i64 {
        self.lines.iter().map(|line| line.credit_minor).sum()
    }

    /// The entry's nominal size: the larger of the two column totals.
    #[must_use]
    pub fn amount_minor(&self) -> i64 {
        self.total_debit_minor().max(self.total_credit_minor())
    }

    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.total_debit_minor() == self.total_credit_minor()
    }

    /// Drop no-op lines and reject negative columns. Called before persisting.
    pub fn normalize_lines(&mut self) -> LedgerResult<()> {
        for line in &self.lines {
            if line.debit_minor < 0 || line.credit_minor < 0 {
                return Err(LedgerError::Invariant(
                    "debit and credit values must be non-negative".into(),
                ));
            }
        }
        self.lines
            .retain(|line| line.debit_minor != 0 || line.credit_minor != 0);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: BankAccountId,
    pub tenant_id: TenantId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_account_id: Option<AccountId>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankTxStatus {
    New,
    Partial,
    MatchedSingle,
    MatchedMulti,
    Excluded,
}

impl BankTxStatus {
    /// Transition table for the transaction state machine. Identity
    /// transitions are always allowed.
    #[must_use]
    pub fn can_transition_to(self, next: BankTxStatus) -> bool {
        use BankTxStatus::*;
        if self == next {
            return true;
        }
        match self {
            New => matches!(next, Partial | MatchedSingle | MatchedMulti | Excluded),
            Partial => matches!(next, MatchedSingle | MatchedMulti | New),
            MatchedSingle | MatchedMulti => matches!(next, New),
            Excluded => matches!(next, New),
        }
    }

    /// Statuses that count toward the session's cleared set. Excluded lines
    /// clear the feed but contribute zero to the cleared sum.
    #[must_use]
    pub fn counts_as_cleared(self) -> bool {
        !matches!(self, BankTxStatus::New)
    }

    #[must_use]
    pub fn is_reconciled(self) -> bool {
        matches!(
            self,
            BankTxStatus::Partial | BankTxStatus::MatchedSingle | BankTxStatus::MatchedMulti
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditVerdict {
    Ok,
    Warn,
    Fail,
}

/// Advisory verdict from the high-risk critic, attached to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAudit {
    pub verdict: AuditVerdict,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: BankTxId,
    pub bank_account_id: BankAccountId,
    pub date: NaiveDate,
    pub description: String,
    /// Signed amount: positive for deposits, negative for withdrawals.
    pub amount_minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub status: BankTxStatus,
    pub allocated_minor: i64,
    pub is_reconciled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_invoice_id: Option<InvoiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_bill_id: Option<BillId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_entry_id: Option<EntryId>,
    /// Category chosen during import; used as the offset for add-as-new.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_risk_audit: Option<TransactionAudit>,
}

impl BankTransaction {
    #[must_use]
    pub fn new(
        bank_account_id: impl Into<BankAccountId>,
        date: NaiveDate,
        description: impl Into<String>,
        amount_minor: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            bank_account_id: bank_account_id.into(),
            date,
            description: description.into(),
            amount_minor,
            external_id: None,
            status: BankTxStatus::New,
            allocated_minor: 0,
            is_reconciled: false,
            reconciled_at: None,
            reconciliation_session_id: None,
            matched_invoice_id: None,
            matched_bill_id: None,
            posted_entry_id: None,
            category_account_id: None,
            suggestion_confidence: None,
            suggestion_reason: None,
            high_risk_audit: None,
        }
    }

    #[must_use]
    pub fn is_deposit(&self) -> bool {
        self.amount_minor >= 0
    }

    #[must_use]
    pub fn abs_amount_minor(&self) -> i64 {
        self.amount_minor.abs()
    }

    /// Stable deduplication key for imported feed lines:
    /// `sha256(bank_account_id | iso_date | description | amount)[..32]`.
    #[must_use]
    pub fn dedupe_key(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.bank_account_id.as_str(),
            &self.date.to_string(),
            &self.description,
            &format_minor(self.amount_minor),
        ] {
            hasher.update(field.as_bytes());
            hasher.update(b"|");
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..32].to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    OneToOne,
    OneToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankMatch {
    pub id: MatchId,
    pub bank_transaction_id: BankTxId,
    pub journal_entry_id: EntryId,
    pub match_type: MatchType,
    pub match_confidence: f32,
    pub matched_amount_minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment_entry_id: Option<EntryId>,
}

impl BankMatch {
    #[must_use]
    pub fn new(
        bank_transaction_id: impl Into<BankTxId>,
        journal_entry_id: impl Into<EntryId>,
        match_type: MatchType,
        match_confidence: f32,
        matched_amount_minor: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            bank_transaction_id: bank_transaction_id.into(),
            journal_entry_id: journal_entry_id.into(),
            match_type,
            match_confidence,
            matched_amount_minor,
            reconciled_by: None,
            adjustment_entry_id: None,
        }
    }
}

/// Recalculate status + allocated amount from the transaction's match rows.
///
/// Excluded transactions keep their status but still record the allocated
/// amount for auditing. An allocated sum above the absolute amount is an
/// invariant violation, never a user error.
pub fn recompute_transaction_status(
    tx: &mut BankTransaction,
    matches: &[BankMatch],
) -> LedgerResult<()> {
    let allocated: i64 = matches.iter().map(|m| m.matched_amount_minor).sum();
    let abs_amount = tx.abs_amount_minor();

    if tx.status == BankTxStatus::Excluded {
        tx.allocated_minor = allocated;
        return Ok(());
    }

    let status = if allocated == 0 {
        BankTxStatus::New
    } else if abs_amount == 0 {
        BankTxStatus::MatchedSingle
    } else if allocated < abs_amount {
        BankTxStatus::Partial
    } else if allocated == abs_amount {
        if matches.len() <= 1 {
            BankTxStatus::MatchedSingle
        } else {
            BankTxStatus::MatchedMulti
        }
    } else {
        return Err(LedgerError::Invariant(format!(
            "allocated amount {} exceeds bank amount {} for transaction {}",
            format_minor(allocated),
            format_minor(abs_amount),
            tx.id
        )));
    };

    if !tx.status.can_transition_to(status) {
        return Err(LedgerError::Invariant(format!(
            "transaction {} cannot move from {:?} to {status:?}",
            tx.id, tx.status
        )));
    }
    tx.status = status;
    tx.allocated_minor = allocated;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Draft,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSession {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub bank_account_id: BankAccountId,
    pub statement_start_date: NaiveDate,
    pub statement_end_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening_balance_minor: Option<i64>,
    pub closing_balance_minor: i64,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReconciliationSession {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.statement_start_date && date <= self.statement_end_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Partial,
    Paid,
    Overdue,
    Void,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub tenant_id: TenantId,
    pub number: String,
    pub customer: String,
    pub issue_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub grand_total_minor: i64,
    pub amount_paid_minor: i64,
    pub status: InvoiceStatus,
}

impl Invoice {
    #[must_use]
    pub fn remaining_minor(&self) -> i64 {
        self.grand_total_minor - self.amount_paid_minor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Unpaid,
    Partial,
    Paid,
    Void,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub id: BillId,
    pub tenant_id: TenantId,
    pub vendor: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub amount_minor: i64,
    pub amount_paid_minor: i64,
    pub status: BillStatus,
}

impl Bill {
    #[must_use]
    pub fn remaining_minor(&self) -> i64 {
        self.amount_minor - self.amount_paid_minor
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRate {
    pub id: TaxRateId,
    pub tenant_id: TenantId,
    pub name: String,
    pub rate_bps: i64,
    pub applies_to_sales: bool,
    pub applies_to_purchases: bool,
    pub is_active: bool,
}

/// Persistence boundary for the reconciliation core. Every getter is tenant
/// scoped: an id that exists under another tenant answers `NotFound`.
pub trait LedgerStore: Send + Sync {
    fn insert_tenant(&self, tenant: Tenant) -> LedgerResult<Tenant>;
    fn tenant(&self, tenant_id: &TenantId) -> LedgerResult<Tenant>;

    fn upsert_account(&self, account: Account) -> LedgerResult<Account>;
    fn account(&self, tenant_id: &TenantId, account_id: &AccountId) -> LedgerResult<Account>;
    fn account_by_code(&self, tenant_id: &TenantId, code: &str) -> LedgerResult<Option<Account>>;
    fn get_or_create_account(
        &self,
        tenant_id: &TenantId,
        code: &str,
        name: &str,
        account_type: AccountType,
    ) -> LedgerResult<Account>;
    fn list_accounts(&self, tenant_id: &TenantId) -> LedgerResult<Vec<Account>>;
    /// Account balance over non-void entries dated on or before `as_of`,
    /// signed by the account's normal balance side.
    fn balance_as_of(
        &self,
        tenant_id: &TenantId,
        account_id: &AccountId,
        as_of: NaiveDate,
    ) -> LedgerResult<i64>;

    fn insert_entry(&self, entry: JournalEntry) -> LedgerResult<JournalEntry>;
    fn save_entry(&self, entry: &JournalEntry) -> LedgerResult<()>;
    fn entry(&self, tenant_id: &TenantId, entry_id: &EntryId) -> LedgerResult<JournalEntry>;
    fn entry_by_operation_id(
        &self,
        tenant_id: &TenantId,
        operation_id: &str,
    ) -> LedgerResult<Option<JournalEntry>>;
    fn list_entries(&self, tenant_id: &TenantId) -> LedgerResult<Vec<JournalEntry>>;
    /// Flip reconciliation flags on an entry's lines hitting `account_id`.
    fn set_lines_reconciled(
        &self,
        entry_id: &EntryId,
        account_id: &AccountId,
        session_id: Option<SessionId>,
        reconciled: bool,
        at: Option<DateTime<Utc>>,
    ) -> LedgerResult<()>;
    /// Clear reconciliation flags on every line attached to a session.
    fn clear_session_line_flags(&self, session_id: &SessionId) -> LedgerResult<()>;

    fn insert_bank_account(&self, account: BankAccount) -> LedgerResult<BankAccount>;
    fn bank_account(
        &self,
        tenant_id: &TenantId,
        bank_account_id: &BankAccountId,
    ) -> LedgerResult<BankAccount>;
    fn list_bank_accounts(&self, tenant_id: &TenantId) -> LedgerResult<Vec<BankAccount>>;

    fn insert_bank_transaction(&self, tx: BankTransaction) -> LedgerResult<BankTransaction>;
    fn save_bank_transaction(&self, tx: &BankTransaction) -> LedgerResult<()>;
    fn bank_transaction(
        &self,
        tenant_id: &TenantId,
        tx_id: &BankTxId,
    ) -> LedgerResult<BankTransaction>;
    fn list_bank_transactions(
        &self,
        tenant_id: &TenantId,
        bank_account_id: &BankAccountId,
    ) -> LedgerResult<Vec<BankTransaction>>;

    fn insert_match(&self, bank_match: BankMatch) -> LedgerResult<BankMatch>;
    fn matches_for_transaction(&self, tx_id: &BankTxId) -> LedgerResult<Vec<BankMatch>>;
    fn delete_matches_for_transaction(&self, tx_id: &BankTxId) -> LedgerResult<Vec<BankMatch>>;

    fn insert_session(&self, session: ReconciliationSession) -> LedgerResult<ReconciliationSession>;
    fn save_session(&self, session: &ReconciliationSession) -> LedgerResult<()>;
    fn session(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
    ) -> LedgerResult<ReconciliationSession>;
    fn find_session(
        &self,
        tenant_id: &TenantId,
        bank_account_id: &BankAccountId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> LedgerResult<Option<ReconciliationSession>>;
    fn delete_session(&self, tenant_id: &TenantId, session_id: &SessionId) -> LedgerResult<()>;

    fn insert_invoice(&self, invoice: Invoice) -> LedgerResult<Invoice>;
    fn save_invoice(&self, invoice: &Invoice) -> LedgerResult<()>;
    fn invoice(&self, tenant_id: &TenantId, invoice_id: &InvoiceId) -> LedgerResult<Invoice>;
    fn list_invoices(&self, tenant_id: &TenantId) -> LedgerResult<Vec<Invoice>>;

    fn insert_bill(&self, bill: Bill) -> LedgerResult<Bill>;
    fn save_bill(&self, bill: &Bill) -> LedgerResult<()>;
    fn bill(&self, tenant_id: &TenantId, bill_id: &BillId) -> LedgerResult<Bill>;
    fn list_bills(&self, tenant_id: &TenantId) -> LedgerResult<Vec<Bill>>;

    fn insert_tax_rate(&self, rate: TaxRate) -> LedgerResult<TaxRate>;
    fn tax_rate(&self, tenant_id: &TenantId, rate_id: &TaxRateId) -> LedgerResult<TaxRate>;
}
