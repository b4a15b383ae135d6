#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::sync::Arc;

use books_ledger::BankAccountId;
use books_ledger::BankMatch;
use books_ledger::BankTransaction;
use books_ledger::BankTxId;
use books_ledger::BankTxStatus;
use books_ledger::EntryId;
use books_ledger::JournalEntry;
use books_ledger::JournalLine;
use books_ledger::LedgerError;
use books_ledger::LedgerStore;
use books_ledger::MatchType;
use books_ledger::ReconciliationSession;
use books_ledger::SessionId;
use books_ledger::SessionStatus;
use books_ledger::TenantId;
use books_ledger::TransactionAudit;
use books_ledger::ensure_suspense_account;
use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod matching;

pub use matching::BankRule;
pub use matching::MatchSuggestion;
pub use matching::SuggestionCandidate;
pub use matching::SuggestionScoring;
pub use matching::suggest_for_transaction;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Completion gate tolerance: one minor unit (0.01).
pub const COMPLETION_TOLERANCE_MINOR: i64 = 1;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(
        "This reconciliation period is completed and cannot be modified. Reopen the period to make changes."
    )]
    SessionCompleted,
    #[error("Difference must be zero before completing this period.")]
    DifferenceNotZero,
    #[error("You still have unreconciled transactions in this period.")]
    UnreconciledTransactionsRemaining,
    #[error("Only completed sessions can be reopened.")]
    ReopenRequiresCompleted,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ReconcileError {
    /// Stable machine-readable code carried in HTTP error bodies.
    #[must_use]
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ReconcileError::SessionCompleted => Some("session_completed"),
            ReconcileError::DifferenceNotZero => Some("difference_not_zero"),
            ReconcileError::UnreconciledTransactionsRemaining => {
                Some("unreconciled_transactions_remaining")
            }
            ReconcileError::ReopenRequiresCompleted => Some("invalid_state"),
            ReconcileError::Validation(_) | ReconcileError::Ledger(_) => None,
        }
    }
}

fn invalid(message: impl Into<String>) -> ReconcileError {
    ReconcileError::Validation(message.into())
}

/// Feed buckets shown in the reconciliation workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFeed {
    pub new: Vec<BankTransaction>,
    pub matched: Vec<BankTransaction>,
    pub partial: Vec<BankTransaction>,
    pub excluded: Vec<BankTransaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOverview {
    pub session: ReconciliationSession,
    pub ledger_ending_minor: i64,
    pub cleared_balance_minor: i64,
    pub difference_minor: i64,
    pub total_transactions: usize,
    pub reconciled_count: usize,
    pub unreconciled_count: usize,
    pub excluded_count: usize,
    pub reconciled_percent: f32,
    pub feed: SessionFeed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodBucket {
    pub id: String,
    pub label: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_current: bool,
    pub is_locked: bool,
}

fn month_window(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = date.with_day(1).unwrap_or(date);
    let next_month = if start.month() == 12 {
        NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
    };
    let end = next_month
        .and_then(|d| d.pred_opt())
        .unwrap_or(start);
    (start, end)
}

/// Drives the reconciliation workspace: session lifecycle, matching and the
/// completion gate. All mutations are rejected on COMPLETED sessions.
pub struct SessionEngine {
    store: Arc<dyn LedgerStore>,
}

impl SessionEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Return-or-create the session for `(bank_account, start, end)`. On
    /// first creation the opening balance is seeded from the ledger as of
    /// the day before the window and the closing balance from the window
    /// end; a null opening on an existing session is backfilled the same
    /// way. Orphan transactions inside the window are attached.
    pub fn resolve_session(
        &self,
        tenant_id: &TenantId,
        bank_account_id: &BankAccountId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> ReconcileResult<ReconciliationSession> {
        if start > end {
            return Err(invalid("start must be on or before end"));
        }
        let bank_account = self.store.bank_account(tenant_id, bank_account_id)?;

        let ledger_balance = |as_of: NaiveDate| -> ReconcileResult<i64> {
            match &bank_account.ledger_account_id {
                Some(account_id) => Ok(self.store.balance_as_of(tenant_id, account_id, as_of)?),
                None => Ok(0),
            }
        };

        let mut session = match self
            .store
            .find_session(tenant_id, bank_account_id, start, end)?
        {
            Some(session) => session,
            None => {
                let opening = start
                    .pred_opt()
                    .map(&ledger_balance)
                    .transpose()?
                    .unwrap_or(0);
                let session = ReconciliationSession {
                    id: uuid::Uuid::new_v4().to_string(),
                    tenant_id: tenant_id.clone(),
                    bank_account_id: bank_account_id.clone(),
                    statement_start_date: start,
                    statement_end_date: end,
                    opening_balance_minor: Some(opening),
                    closing_balance_minor: ledger_balance(end)?,
                    status: SessionStatus::Draft,
                    completed_at: None,
                };
                self.store.insert_session(session.clone())?;
                tracing::info!(
                    tenant = %tenant_id,
                    bank_account = %bank_account_id,
                    session = %session.id,
                    "created reconciliation session"
                );
                session
            }
        };

        if session.opening_balance_minor.is_none() {
            session.opening_balance_minor = Some(
                start
                    .pred_opt()
                    .map(&ledger_balance)
                    .transpose()?
                    .unwrap_or(0),
            );
            self.store.save_session(&session)?;
        }

        self.attach_orphan_transactions(tenant_id, &session)?;
        Ok(session)
    }

    fn attach_orphan_transactions(
        &self,
        tenant_id: &TenantId,
        session: &ReconciliationSession,
    ) -> ReconcileResult<()> {
        let transactions = self
            .store
            .list_bank_transactions(tenant_id, &session.bank_account_id)?;
        for mut tx in transactions {
            if tx.reconciliation_session_id.is_some() || !session.contains(tx.date) {
                continue;
            }
            tx.reconciliation_session_id = Some(session.id.clone());
            tx.is_reconciled = tx.status.counts_as_cleared();
            self.store.save_bank_transaction(&tx)?;
        }
        Ok(())
    }

    fn mutable_session(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
    ) -> ReconcileResult<ReconciliationSession> {
        let session = self.store.session(tenant_id, session_id)?;
        if session.is_completed() {
            return Err(ReconcileError::SessionCompleted);
        }
        Ok(session)
    }

    fn mark_in_progress(&self, session: &mut ReconciliationSession) -> ReconcileResult<()> {
        if session.status == SessionStatus::Draft {
            session.status = SessionStatus::InProgress;
            self.store.save_session(session)?;
        }
        Ok(())
    }

    pub fn set_statement_balance(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
        opening_minor: Option<i64>,
        closing_minor: Option<i64>,
    ) -> ReconcileResult<SessionOverview> {
        let mut session = self.mutable_session(tenant_id, session_id)?;
        if opening_minor.is_none() && closing_minor.is_none() {
            return Err(invalid(
                "opening_balance or statement_ending_balance is required",
            ));
        }
        if let Some(opening) = opening_minor {
            session.opening_balance_minor = Some(opening);
        }
        if let Some(closing) = closing_minor {
            session.closing_balance_minor = closing;
        }
        self.mark_in_progress(&mut session)?;
        self.store.save_session(&session)?;
        self.overview(tenant_id, &session.id)
    }

    fn assert_tx_in_period(
        tx: &BankTransaction,
        session: &ReconciliationSession,
    ) -> ReconcileResult<()> {
        if !session.contains(tx.date) {
            return Err(invalid("Transaction is out of period for this session."));
        }
        Ok(())
    }

    fn assert_tx_owned_by(
        tx: &BankTransaction,
        session: &ReconciliationSession,
    ) -> ReconcileResult<()> {
        match &tx.reconciliation_session_id {
            Some(owner) if owner != &session.id => Err(invalid(
                "Transaction belongs to another reconciliation session.",
            )),
            _ => Ok(()),
        }
    }

    /// Link a bank transaction to a journal entry, replacing any existing
    /// matches, and mark both sides reconciled.
    pub fn match_transaction(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
        tx_id: &BankTxId,
        entry_id: &EntryId,
        user: Option<&str>,
    ) -> ReconcileResult<SessionOverview> {
        let mut session = self.mutable_session(tenant_id, session_id)?;
        let tx = self.store.bank_transaction(tenant_id, tx_id)?;
        if tx.bank_account_id != session.bank_account_id {
            return Err(ReconcileError::Ledger(LedgerError::NotFound(format!(
                "bank transaction {tx_id}"
            ))));
        }
        Self::assert_tx_owned_by(&tx, &session)?;
        Self::assert_tx_in_period(&tx, &session)?;
        let entry = self.store.entry(tenant_id, entry_id)?;
        if !session.contains(entry.date) {
            return Err(invalid("Journal entry is out of period for this session."));
        }

        self.mark_in_progress(&mut session)?;
        self.apply_match(tenant_id, &session, tx, &entry, user)?;
        self.overview(tenant_id, &session.id)
    }

    fn apply_match(
        &self,
        tenant_id: &TenantId,
        session: &ReconciliationSession,
        mut tx: BankTransaction,
        entry: &JournalEntry,
        user: Option<&str>,
    ) -> ReconcileResult<()> {
        self.store.delete_matches_for_transaction(&tx.id)?;
        let now = Utc::now();
        let mut row = BankMatch::new(
            tx.id.clone(),
            entry.id.clone(),
            MatchType::OneToOne,
            1.0,
            tx.abs_amount_minor(),
        );
        row.reconciled_by = user.map(str::to_string);
        self.store.insert_match(row)?;

        if !tx.status.can_transition_to(BankTxStatus::MatchedSingle) {
            return Err(ReconcileError::Ledger(LedgerError::Invariant(format!(
                "transaction {} cannot be matched from {:?}",
                tx.id, tx.status
            ))));
        }
        tx.status = BankTxStatus::MatchedSingle;
        tx.is_reconciled = true;
        tx.reconciled_at = Some(now);
        tx.allocated_minor = tx.abs_amount_minor();
        tx.posted_entry_id = Some(entry.id.clone());
        tx.reconciliation_session_id = Some(session.id.clone());
        self.store.save_bank_transaction(&tx)?;

        let bank_account = self.store.bank_account(tenant_id, &tx.bank_account_id)?;
        if let Some(account_id) = &bank_account.ledger_account_id {
            self.store.set_lines_reconciled(
                &entry.id,
                account_id,
                Some(session.id.clone()),
                true,
                Some(now),
            )?;
        }
        Ok(())
    }

    /// Remove all matches for a transaction and reset it to NEW.
    pub fn unmatch_transaction(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
        tx_id: &BankTxId,
    ) -> ReconcileResult<SessionOverview> {
        let mut session = self.mutable_session(tenant_id, session_id)?;
        let mut tx = self.store.bank_transaction(tenant_id, tx_id)?;
        if tx.bank_account_id != session.bank_account_id {
            return Err(ReconcileError::Ledger(LedgerError::NotFound(format!(
                "bank transaction {tx_id}"
            ))));
        }
        Self::assert_tx_owned_by(&tx, &session)?;

        let removed = self.store.delete_matches_for_transaction(&tx.id)?;
        tx.allocated_minor = 0;
        tx.posted_entry_id = None;
        tx.matched_invoice_id = None;
        tx.matched_bill_id = None;
        tx.is_reconciled = false;
        tx.reconciled_at = None;
        if !tx.status.can_transition_to(BankTxStatus::New) {
            return Err(ReconcileError::Ledger(LedgerError::Invariant(format!(
                "transaction {} cannot be reset from {:?}",
                tx.id, tx.status
            ))));
        }
        tx.status = BankTxStatus::New;
        self.store.save_bank_transaction(&tx)?;

        let bank_account = self.store.bank_account(tenant_id, &tx.bank_account_id)?;
        if let Some(account_id) = &bank_account.ledger_account_id {
            for row in &removed {
                self.store.set_lines_reconciled(
                    &row.journal_entry_id,
                    account_id,
                    None,
                    false,
                    None,
                )?;
            }
        }
        self.mark_in_progress(&mut session)?;
        self.overview(tenant_id, &session.id)
    }

    /// Toggle EXCLUDED. Excluding clears any matches first; including
    /// returns the transaction to NEW.
    pub fn set_excluded(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
        tx_id: &BankTxId,
        excluded: bool,
    ) -> ReconcileResult<SessionOverview> {
        let mut session = self.mutable_session(tenant_id, session_id)?;
        let mut tx = self.store.bank_transaction(tenant_id, tx_id)?;
        if tx.bank_account_id != session.bank_account_id {
            return Err(ReconcileError::Ledger(LedgerError::NotFound(format!(
                "bank transaction {tx_id}"
            ))));
        }
        Self::assert_tx_in_period(&tx, &session)?;
        Self::assert_tx_owned_by(&tx, &session)?;

        if excluded {
            self.store.delete_matches_for_transaction(&tx.id)?;
            tx.allocated_minor = 0;
            tx.posted_entry_id = None;
            // Match-free after the delete, equivalent to NEW, the only
            // state the table allows into EXCLUDED.
            tx.status = BankTxStatus::Excluded;
            tx.is_reconciled = true;
            tx.reconciliation_session_id = Some(session.id.clone());
        } else {
            if tx.status == BankTxStatus::Excluded {
                tx.status = BankTxStatus::New;
            }
            tx.is_reconciled = false;
            tx.reconciled_at = None;
        }
        self.store.save_bank_transaction(&tx)?;
        self.mark_in_progress(&mut session)?;
        self.overview(tenant_id, &session.id)
    }

    fn session_transactions(
        &self,
        tenant_id: &TenantId,
        session: &ReconciliationSession,
    ) -> ReconcileResult<Vec<BankTransaction>> {
        Ok(self
            .store
            .list_bank_transactions(tenant_id, &session.bank_account_id)?
            .into_iter()
            .filter(|tx| tx.reconciliation_session_id.as_ref() == Some(&session.id))
            .collect())
    }

    /// Signed sum of cleared session transactions. Excluded rows clear the
    /// feed but add zero; partial rows contribute their allocated amount
    /// with the sign of the underlying transaction.
    fn cleared_sum<'a>(transactions: impl Iterator<Item = &'a BankTransaction>) -> i64 {
        transactions
            .filter(|tx| tx.status.counts_as_cleared())
            .map(|tx| match tx.status {
                BankTxStatus::Excluded => 0,
                BankTxStatus::Partial => {
                    if tx.amount_minor < 0 {
                        -tx.allocated_minor
                    } else {
                        tx.allocated_minor
                    }
                }
                _ => tx.amount_minor,
            })
            .sum()
    }

    pub fn overview(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
    ) -> ReconcileResult<SessionOverview> {
        let session = self.store.session(tenant_id, session_id)?;
        let bank_account = self
            .store
            .bank_account(tenant_id, &session.bank_account_id)?;
        let ledger_ending_minor = match &bank_account.ledger_account_id {
            Some(account_id) => {
                self.store
                    .balance_as_of(tenant_id, account_id, session.statement_end_date)?
            }
            None => 0,
        };

        let in_window: Vec<BankTransaction> = self
            .store
            .list_bank_transactions(tenant_id, &session.bank_account_id)?
            .into_iter()
            .filter(|tx| session.contains(tx.date))
            .filter(|tx| {
                tx.reconciliation_session_id.is_none()
                    || tx.reconciliation_session_id.as_ref() == Some(&session.id)
            })
            .collect();

        let mut feed = SessionFeed::default();
        for tx in &in_window {
            let in_session = tx.reconciliation_session_id.as_ref() == Some(&session.id);
            match tx.status {
                BankTxStatus::Excluded if in_session => feed.excluded.push(tx.clone()),
                BankTxStatus::Partial if in_session => feed.partial.push(tx.clone()),
                BankTxStatus::MatchedSingle | BankTxStatus::MatchedMulti if in_session => {
                    feed.matched.push(tx.clone());
                }
                _ => feed.new.push(tx.clone()),
            }
        }

        let session_txs: Vec<&BankTransaction> = in_window
            .iter()
            .filter(|tx| tx.reconciliation_session_id.as_ref() == Some(&session.id))
            .collect();
        let total_transactions = session_txs.len();
        let reconciled_count = session_txs
            .iter()
            .filter(|tx| tx.status.counts_as_cleared())
            .count();
        let excluded_count = session_txs
            .iter()
            .filter(|tx| tx.status == BankTxStatus::Excluded)
            .count();
        let unreconciled_count = total_transactions - reconciled_count;
        let reconciled_percent = if total_transactions == 0 {
            0.0
        } else {
            (reconciled_count as f32 / total_transactions as f32) * 100.0
        };

        let cleared = Self::cleared_sum(session_txs.into_iter());
        let cleared_balance_minor = session.opening_balance_minor.unwrap_or(0) + cleared;
        let difference_minor = session.closing_balance_minor - cleared_balance_minor;

        Ok(SessionOverview {
            session,
            ledger_ending_minor,
            cleared_balance_minor,
            difference_minor,
            total_transactions,
            reconciled_count,
            unreconciled_count,
            excluded_count,
            reconciled_percent,
            feed,
        })
    }

    /// Completion gate: difference within tolerance and no unreconciled,
    /// non-excluded transactions left in the session.
    pub fn complete(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
    ) -> ReconcileResult<SessionOverview> {
        let mut session = self.mutable_session(tenant_id, session_id)?;
        let overview = self.overview(tenant_id, session_id)?;
        if overview.difference_minor.abs() > COMPLETION_TOLERANCE_MINOR {
            return Err(ReconcileError::DifferenceNotZero);
        }
        if overview.unreconciled_count > 0 {
            return Err(ReconcileError::UnreconciledTransactionsRemaining);
        }
        session.status = SessionStatus::Completed;
        session.completed_at = Some(Utc::now());
        self.store.save_session(&session)?;
        tracing::info!(tenant = %tenant_id, session = %session.id, "completed reconciliation session");
        self.overview(tenant_id, session_id)
    }

    /// Staff-only recovery action; authorization is the caller's concern.
    pub fn reopen(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
    ) -> ReconcileResult<SessionOverview> {
        let mut session = self.store.session(tenant_id, session_id)?;
        if session.status != SessionStatus::Completed {
            return Err(ReconcileError::ReopenRequiresCompleted);
        }
        session.status = SessionStatus::InProgress;
        session.completed_at = None;
        self.store.save_session(&session)?;
        tracing::info!(tenant = %tenant_id, session = %session.id, "reopened reconciliation session");
        self.overview(tenant_id, session_id)
    }

    /// Detach and reset every session transaction, drop the period's
    /// matches and line flags, then remove the session record.
    pub fn delete_session(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
    ) -> ReconcileResult<()> {
        let session = self.store.session(tenant_id, session_id)?;
        for mut tx in self.session_transactions(tenant_id, &session)? {
            self.store.delete_matches_for_transaction(&tx.id)?;
            tx.reconciliation_session_id = None;
            tx.is_reconciled = false;
            tx.reconciled_at = None;
            tx.status = BankTxStatus::New;
            tx.allocated_minor = 0;
            tx.posted_entry_id = None;
            self.store.save_bank_transaction(&tx)?;
        }
        self.store.clear_session_line_flags(&session.id)?;
        self.store.delete_session(tenant_id, session_id)?;
        tracing::info!(tenant = %tenant_id, session = %session_id, "deleted reconciliation session");
        Ok(())
    }

    /// Resolve the session that should own a transaction: its current
    /// session if set, else the month bucket containing its date.
    pub fn session_for_transaction(
        &self,
        tenant_id: &TenantId,
        tx: &BankTransaction,
    ) -> ReconcileResult<ReconciliationSession> {
        if let Some(session_id) = &tx.reconciliation_session_id {
            return Ok(self.store.session(tenant_id, session_id)?);
        }
        let (start, end) = month_window(tx.date);
        self.resolve_session(tenant_id, &tx.bank_account_id, start, end)
    }

    /// Create a balanced two-line entry for an uncategorized bank line and
    /// reconcile it through the match path. The offset account is the
    /// transaction's category account, falling back to the per-tenant
    /// suspense account.
    pub fn add_as_new(
        &self,
        tenant_id: &TenantId,
        tx_id: &BankTxId,
        user: Option<&str>,
    ) -> ReconcileResult<JournalEntry> {
        let tx = self.store.bank_transaction(tenant_id, tx_id)?;
        let mut session = self.session_for_transaction(tenant_id, &tx)?;
        if session.is_completed() {
            return Err(ReconcileError::SessionCompleted);
        }

        let bank_account = self.store.bank_account(tenant_id, &tx.bank_account_id)?;
        let bank_ledger_id = bank_account.ledger_account_id.clone().ok_or_else(|| {
            invalid(format!(
                "Bank account {} has no linked ledger account",
                bank_account.name
            ))
        })?;

        let offset_account = match &tx.category_account_id {
            Some(account_id) => self.store.account(tenant_id, account_id)?,
            None => ensure_suspense_account(self.store.as_ref(), tenant_id)?,
        };

        let abs_amount = tx.abs_amount_minor();
        let line_description = format!(
            "Auto-matched: {}",
            if tx.description.is_empty() {
                "Bank transaction"
            } else {
                &tx.description
            }
        );
        let mut entry = JournalEntry::new(
            tenant_id.clone(),
            tx.date,
            if tx.description.is_empty() {
                "Bank transaction".to_string()
            } else {
                tx.description.clone()
            },
        );
        if tx.amount_minor < 0 {
            entry.lines = vec![
                JournalLine::new(offset_account.id.clone(), abs_amount, 0)
                    .with_description(line_description.clone()),
                JournalLine::new(bank_ledger_id, 0, abs_amount)
                    .with_description(line_description),
            ];
        } else {
            entry.lines = vec![
                JournalLine::new(bank_ledger_id, abs_amount, 0)
                    .with_description(line_description.clone()),
                JournalLine::new(offset_account.id.clone(), 0, abs_amount)
                    .with_description(line_description),
            ];
        }
        let entry = self.store.insert_entry(entry)?;

        self.mark_in_progress(&mut session)?;
        self.apply_match(tenant_id, &session, tx, &entry, user)?;
        Ok(entry)
    }

    /// Persist an advisory critic verdict on a transaction. Never blocks
    /// posting; the verdict is display-only.
    pub fn attach_high_risk_audit(
        &self,
        tenant_id: &TenantId,
        tx_id: &BankTxId,
        audit: TransactionAudit,
    ) -> ReconcileResult<()> {
        let mut tx = self.store.bank_transaction(tenant_id, tx_id)?;
        tx.high_risk_audit = Some(audit);
        self.store.save_bank_transaction(&tx)?;
        Ok(())
    }

    /// Month buckets spanning the account's transaction history, most
    /// recent first, with lock flags from completed sessions.
    pub fn periods_for_account(
        &self,
        tenant_id: &TenantId,
        bank_account_id: &BankAccountId,
        today: NaiveDate,
    ) -> ReconcileResult<Vec<PeriodBucket>> {
        let transactions = self
            .store
            .list_bank_transactions(tenant_id, bank_account_id)?;

        let bucket = |start: NaiveDate| -> ReconcileResult<PeriodBucket> {
            let (start, end) = month_window(start);
            let id = format!("{}-{:02}", start.year(), start.month());
            let is_locked = self
                .store
                .find_session(tenant_id, bank_account_id, start, end)?
                .is_some_and(|session| session.is_completed());
            Ok(PeriodBucket {
                id: id.clone(),
                label: start.format("%B %Y").to_string(),
                start_date: start,
                end_date: end,
                is_current: id == format!("{}-{:02}", today.year(), today.month()),
                is_locked,
            })
        };

        let dates: Vec<NaiveDate> = transactions.iter().map(|tx| tx.date).collect();
        let (Some(first), Some(last)) = (dates.iter().min(), dates.iter().max()) else {
            return Ok(vec![bucket(today)?]);
        };

        let mut periods = Vec::new();
        let mut cursor = first.with_day(1).unwrap_or(*first);
        let last_month = last.with_day(1).unwrap_or(*last);
        while cursor <= last_month {
            periods.push(bucket(cursor)?);
            match month_window(cursor).1.succ_opt() {
                Some(next) => cursor = next,
                None => break,
            }
        }
        periods.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(periods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use books_ledger::Account;
    use books_ledger::AccountType;
    use books_ledger::BankAccount;
    use books_ledger::InMemoryLedgerStore;
    use books_ledger::Tenant;
    use pretty_assertions::assert_eq;

    struct Fixture {
        engine: SessionEngine,
        store: Arc<InMemoryLedgerStore>,
        tenant_id: TenantId,
        bank_account_id: BankAccountId,
        cash: Account,
        sales: Account,
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        store
            .insert_tenant(Tenant {
                id: "tenant-1".into(),
                name: "Demo Books".into(),
                currency: "USD".into(),
                fiscal_year_start_month: 1,
                companion_enabled: true,
            })
            .expect("tenant");
        let cash = store
            .get_or_create_account(&"tenant-1".to_string(), "1010", "Cash at Bank", AccountType::Asset)
            .expect("cash");
        let sales = store
            .get_or_create_account(&"tenant-1".to_string(), "4010", "Sales", AccountType::Income)
            .expect("sales");
        store
            .insert_bank_account(BankAccount {
                id: "bank-1".into(),
                tenant_id: "tenant-1".into(),
                name: "Operating".into(),
                ledger_account_id: Some(cash.id.clone()),
                is_active: true,
            })
            .expect("bank account");
        Fixture {
            engine: SessionEngine::new(store.clone()),
            store,
            tenant_id: "tenant-1".into(),
            bank_account_id: "bank-1".into(),
            cash,
            sales,
        }
    }

    fn insert_tx(f: &Fixture, day: u32, amount_minor: i64) -> BankTransaction {
        f.store
            .insert_bank_transaction(BankTransaction::new(
                f.bank_account_id.clone(),
                date(2025, 3, day),
                "deposit",
                amount_minor,
            ))
            .expect("transaction")
    }

    fn insert_entry(f: &Fixture, day: u32, amount_minor: i64) -> JournalEntry {
        let mut entry = JournalEntry::new(f.tenant_id.clone(), date(2025, 3, day), "cash sale");
        entry.lines = vec![
            JournalLine::new(f.cash.id.clone(), amount_minor, 0),
            JournalLine::new(f.sales.id.clone(), 0, amount_minor),
        ];
        f.store.insert_entry(entry).expect("entry")
    }

    fn march_session(f: &Fixture) -> ReconciliationSession {
        f.engine
            .resolve_session(&f.tenant_id, &f.bank_account_id, date(2025, 3, 1), date(2025, 3, 31))
            .expect("session")
    }

    #[test]
    fn resolve_session_seeds_balances_and_attaches_orphans() {
        let f = fixture();
        insert_entry(&f, 10, 12_000);
        let tx = insert_tx(&f, 10, 12_000);

        let session = march_session(&f);
        assert_eq!(session.status, SessionStatus::Draft);
        assert_eq!(session.opening_balance_minor, Some(0));
        assert_eq!(session.closing_balance_minor, 12_000);

        let attached = f
            .store
            .bank_transaction(&f.tenant_id, &tx.id)
            .expect("transaction");
        assert_eq!(attached.reconciliation_session_id, Some(session.id.clone()));

        let again = march_session(&f);
        assert_eq!(session.id, again.id);
    }

    #[test]
    fn match_links_both_sides_and_flags_ledger_lines() {
        let f = fixture();
        let entry = insert_entry(&f, 12, 9_900);
        let tx = insert_tx(&f, 12, 9_900);
        let session = march_session(&f);

        let overview = f
            .engine
            .match_transaction(&f.tenant_id, &session.id, &tx.id, &entry.id, Some("ana"))
            .expect("match");

        assert_eq!(overview.feed.matched.len(), 1);
        let matched = &overview.feed.matched[0];
        assert_eq!(matched.status, BankTxStatus::MatchedSingle);
        assert_eq!(matched.allocated_minor, 9_900);
        assert!(matched.is_reconciled);

        let stored_entry = f.store.entry(&f.tenant_id, &entry.id).expect("entry");
        let cash_line = stored_entry
            .lines
            .iter()
            .find(|line| line.account_id == f.cash.id)
            .expect("cash line");
        assert!(cash_line.is_reconciled);
        assert_eq!(
            cash_line.reconciliation_session_id,
            Some(session.id.clone())
        );

        let rows = f.store.matches_for_transaction(&tx.id).expect("matches");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reconciled_by.as_deref(), Some("ana"));
    }

    #[test]
    fn unmatch_resets_transaction_and_lines() {
        let f = fixture();
        let entry = insert_entry(&f, 12, 9_900);
        let tx = insert_tx(&f, 12, 9_900);
        let session = march_session(&f);
        f.engine
            .match_transaction(&f.tenant_id, &session.id, &tx.id, &entry.id, None)
            .expect("match");

        let overview = f
            .engine
            .unmatch_transaction(&f.tenant_id, &session.id, &tx.id)
            .expect("unmatch");

        assert_eq!(overview.feed.new.len(), 1);
        assert_eq!(overview.feed.new[0].status, BankTxStatus::New);
        assert_eq!(overview.feed.new[0].allocated_minor, 0);
        assert!(overview.feed.new[0].posted_entry_id.is_none());

        let stored_entry = f.store.entry(&f.tenant_id, &entry.id).expect("entry");
        assert!(
            stored_entry
                .lines
                .iter()
                .all(|line| !line.is_reconciled)
        );
        assert!(
            f.store
                .matches_for_transaction(&tx.id)
                .expect("matches")
                .is_empty()
        );
    }

    #[test]
    fn out_of_period_matches_are_rejected() {
        let f = fixture();
        let entry = insert_entry(&f, 12, 5_000);
        let tx = f
            .store
            .insert_bank_transaction(BankTransaction::new(
                f.bank_account_id.clone(),
                date(2025, 4, 2),
                "april deposit",
                5_000,
            ))
            .expect("transaction");
        let session = march_session(&f);

        let err = f
            .engine
            .match_transaction(&f.tenant_id, &session.id, &tx.id, &entry.id, None)
            .expect_err("out-of-period transaction must fail");
        assert!(matches!(err, ReconcileError::Validation(_)));
    }

    #[test]
    fn exclude_clears_matches_and_is_reversible() {
        let f = fixture();
        let entry = insert_entry(&f, 14, 2_500);
        let tx = insert_tx(&f, 14, 2_500);
        let session = march_session(&f);
        f.engine
            .match_transaction(&f.tenant_id, &session.id, &tx.id, &entry.id, None)
            .expect("match");

        let overview = f
            .engine
            .set_excluded(&f.tenant_id, &session.id, &tx.id, true)
            .expect("exclude");
        assert_eq!(overview.feed.excluded.len(), 1);
        assert_eq!(overview.feed.excluded[0].status, BankTxStatus::Excluded);
        // Excluded lines clear the feed but contribute zero.
        assert_eq!(overview.cleared_balance_minor, 0);

        let overview = f
            .engine
            .set_excluded(&f.tenant_id, &session.id, &tx.id, false)
            .expect("include");
        assert_eq!(overview.feed.new.len(), 1);
        assert_eq!(overview.feed.new[0].status, BankTxStatus::New);
    }

    #[test]
    fn completion_gate_enforces_difference_and_unreconciled() {
        let f = fixture();
        let entry = insert_entry(&f, 5, 10_000);
        let matched = insert_tx(&f, 5, 10_000);
        let stray = insert_tx(&f, 6, 1_500);
        let session = march_session(&f);

        f.engine
            .match_transaction(&f.tenant_id, &session.id, &matched.id, &entry.id, None)
            .expect("match");

        let err = f
            .engine
            .complete(&f.tenant_id, &session.id)
            .expect_err("unreconciled transaction must block completion");
        assert!(matches!(
            err,
            ReconcileError::UnreconciledTransactionsRemaining
        ));
        assert_eq!(err.code(), Some("unreconciled_transactions_remaining"));

        f.engine
            .set_excluded(&f.tenant_id, &session.id, &stray.id, true)
            .expect("exclude stray");

        // Statement balance still shows the ledger closing balance of
        // 10_000; the cleared sum matches, so the difference is zero.
        let overview = f.engine.complete(&f.tenant_id, &session.id).expect("complete");
        assert_eq!(overview.session.status, SessionStatus::Completed);
        assert!(overview.session.completed_at.is_some());
    }

    #[test]
    fn completion_rejects_nonzero_difference() {
        let f = fixture();
        let entry = insert_entry(&f, 5, 10_000);
        let tx = insert_tx(&f, 5, 10_000);
        let session = march_session(&f);
        f.engine
            .match_transaction(&f.tenant_id, &session.id, &tx.id, &entry.id, None)
            .expect("match");
        f.engine
            .set_statement_balance(&f.tenant_id, &session.id, None, Some(10_500))
            .expect("set balance");

        let err = f
            .engine
            .complete(&f.tenant_id, &session.id)
            .expect_err("difference must block completion");
        assert!(matches!(err, ReconcileError::DifferenceNotZero));
        assert_eq!(err.code(), Some("difference_not_zero"));
    }

    #[test]
    fn completed_sessions_reject_mutations_with_code() {
        let f = fixture();
        let entry = insert_entry(&f, 5, 10_000);
        let tx = insert_tx(&f, 5, 10_000);
        let session = march_session(&f);
        f.engine
            .match_transaction(&f.tenant_id, &session.id, &tx.id, &entry.id, None)
            .expect("match");
        f.engine.complete(&f.tenant_id, &session.id).expect("complete");

        let err = f
            .engine
            .unmatch_transaction(&f.tenant_id, &session.id, &tx.id)
            .expect_err("completed session must be immutable");
        assert!(matches!(err, ReconcileError::SessionCompleted));
        assert_eq!(err.code(), Some("session_completed"));

        let err = f
            .engine
            .set_statement_balance(&f.tenant_id, &session.id, Some(0), None)
            .expect_err("completed session must be immutable");
        assert_eq!(err.code(), Some("session_completed"));

        // Reopen unlocks the session again.
        let overview = f.engine.reopen(&f.tenant_id, &session.id).expect("reopen");
        assert_eq!(overview.session.status, SessionStatus::InProgress);
        assert!(overview.session.completed_at.is_none());
        f.engine
            .unmatch_transaction(&f.tenant_id, &session.id, &tx.id)
            .expect("mutation after reopen");
    }

    #[test]
    fn reopen_requires_completed_session() {
        let f = fixture();
        let session = march_session(&f);
        let err = f
            .engine
            .reopen(&f.tenant_id, &session.id)
            .expect_err("reopen on draft must fail");
        assert!(matches!(err, ReconcileError::ReopenRequiresCompleted));
        assert_eq!(err.code(), Some("invalid_state"));
    }

    #[test]
    fn add_as_new_posts_to_suspense_without_category() {
        let f = fixture();
        let tx = f
            .store
            .insert_bank_transaction(BankTransaction::new(
                f.bank_account_id.clone(),
                date(2025, 3, 20),
                "unknown card charge",
                -4_200,
            ))
            .expect("transaction");
        march_session(&f);

        let entry = f
            .engine
            .add_as_new(&f.tenant_id, &tx.id, Some("ana"))
            .expect("add as new");

        assert!(entry.is_balanced());
        let suspense = f
            .store
            .account_by_code(&f.tenant_id, books_ledger::SUSPENSE_ACCOUNT_CODE)
            .expect("lookup")
            .expect("suspense exists");
        let suspense_line = entry
            .lines
            .iter()
            .find(|line| line.account_id == suspense.id)
            .expect("suspense line");
        assert_eq!(suspense_line.debit_minor, 4_200);

        let updated = f
            .store
            .bank_transaction(&f.tenant_id, &tx.id)
            .expect("transaction");
        assert_eq!(updated.status, BankTxStatus::MatchedSingle);
        assert_eq!(updated.posted_entry_id, Some(entry.id));
    }

    #[test]
    fn delete_session_resets_everything() {
        let f = fixture();
        let entry = insert_entry(&f, 12, 9_900);
        let tx = insert_tx(&f, 12, 9_900);
        let session = march_session(&f);
        f.engine
            .match_transaction(&f.tenant_id, &session.id, &tx.id, &entry.id, None)
            .expect("match");

        f.engine
            .delete_session(&f.tenant_id, &session.id)
            .expect("delete");

        assert!(f.store.session(&f.tenant_id, &session.id).is_err());
        let reset = f
            .store
            .bank_transaction(&f.tenant_id, &tx.id)
            .expect("transaction");
        assert_eq!(reset.status, BankTxStatus::New);
        assert!(reset.reconciliation_session_id.is_none());
        assert!(
            f.store
                .matches_for_transaction(&tx.id)
                .expect("matches")
                .is_empty()
        );
        let stored_entry = f.store.entry(&f.tenant_id, &entry.id).expect("entry");
        assert!(stored_entry.lines.iter().all(|line| !line.is_reconciled));
    }

    #[test]
    fn periods_span_history_with_lock_flags() {
        let f = fixture();
        insert_tx(&f, 5, 1_000);
        f.store
            .insert_bank_transaction(BankTransaction::new(
                f.bank_account_id.clone(),
                date(2025, 1, 15),
                "january",
                2_000,
            ))
            .expect("transaction");

        let periods = f
            .engine
            .periods_for_account(&f.tenant_id, &f.bank_account_id, date(2025, 3, 18))
            .expect("periods");
        assert_eq!(periods.len(), 3);
        assert_eq!(periods[0].id, "2025-03");
        assert!(periods[0].is_current);
        assert_eq!(periods[2].id, "2025-01");
        assert!(periods.iter().all(|p| !p.is_locked));
    }
}
