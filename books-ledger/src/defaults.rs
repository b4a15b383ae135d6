use crate::Account;
use crate::AccountType;
use crate::LedgerResult;
use crate::LedgerStore;
use crate::TenantId;

/// Baseline chart-of-accounts template materialized for every tenant.
pub const DEFAULT_CHART: &[(&str, &str, AccountType)] = &[
    ("1010", "Cash at Bank", AccountType::Asset),
    ("1200", "Accounts Receivable", AccountType::Asset),
    ("1300", "Tax Recoverable", AccountType::Asset),
    ("2000", "Accounts Payable", AccountType::Liability),
    ("2200", "Sales Tax Payable", AccountType::Liability),
    ("4010", "Sales", AccountType::Income),
    ("5010", "Operating Expenses", AccountType::Expense),
];

/// Holding account for bank lines posted without a category.
pub const SUSPENSE_ACCOUNT_CODE: &str = "9999";

/// Resolved handles to the tenant's baseline accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultAccounts {
    pub cash: Account,
    pub receivable: Account,
    pub tax_recoverable: Account,
    pub payable: Account,
    pub sales_tax: Account,
    pub sales: Account,
    pub operating_expenses: Account,
}

/// Ensure the baseline accounts exist for the tenant and return them.
/// Idempotent: existing accounts are matched by `(tenant, code)` and left
/// untouched.
pub fn ensure_default_accounts(
    store: &dyn LedgerStore,
    tenant_id: &TenantId,
) -> LedgerResult<DefaultAccounts> {
    let mut resolved = Vec::with_capacity(DEFAULT_CHART.len());
    for (code, name, account_type) in DEFAULT_CHART {
        resolved.push(store.get_or_create_account(tenant_id, code, name, *account_type)?);
    }
    let mut accounts = resolved.into_iter();
    let mut next = || {
        accounts
            .next()
            .ok_or_else(|| crate::LedgerError::Invariant("default chart incomplete".into()))
    };
    Ok(DefaultAccounts {
        cash: next()?,
        receivable: next()?,
        tax_recoverable: next()?,
        payable: next()?,
        sales_tax: next()?,
        sales: next()?,
        operating_expenses: next()?,
    })
}

/// Get or create the per-tenant "Uncategorized Transactions" holding account.
pub fn ensure_suspense_account(
    store: &dyn LedgerStore,
    tenant_id: &TenantId,
) -> LedgerResult<Account> {
    store.get_or_create_account(
        tenant_id,
        SUSPENSE_ACCOUNT_CODE,
        "Uncategorized Transactions",
        AccountType::Expense,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryLedgerStore;
    use crate::Tenant;
    use pretty_assertions::assert_eq;

    fn store_with_tenant() -> (InMemoryLedgerStore, TenantId) {
        let store = InMemoryLedgerStore::new();
        let tenant = store
            .insert_tenant(Tenant {
                id: "tenant-1".into(),
                name: "Demo Books".into(),
                currency: "USD".into(),
                fiscal_year_start_month: 1,
                companion_enabled: true,
            })
            .expect("tenant");
        (store, tenant.id)
    }

    #[test]
    fn materializes_the_full_chart_once() {
        let (store, tenant_id) = store_with_tenant();
        let first = ensure_default_accounts(&store, &tenant_id).expect("defaults");
        let second = ensure_default_accounts(&store, &tenant_id).expect("defaults again");

        assert_eq!(first.cash.id, second.cash.id);
        assert_eq!(first.sales.code, "4010");
        assert_eq!(first.sales.account_type, AccountType::Income);
        assert_eq!(first.payable.account_type, AccountType::Liability);

        let all = store.list_accounts(&tenant_id).expect("accounts");
        assert_eq!(all.len(), DEFAULT_CHART.len());
    }

    #[test]
    fn suspense_account_is_created_on_demand() {
        let (store, tenant_id) = store_with_tenant();
        let suspense = ensure_suspense_account(&store, &tenant_id).expect("suspense");
        assert_eq!(suspense.code, SUSPENSE_ACCOUNT_CODE);
        assert_eq!(suspense.account_type, AccountType::Expense);

        let again = ensure_suspense_account(&store, &tenant_id).expect("suspense again");
        assert_eq!(suspense.id, again.id);
    }
}
