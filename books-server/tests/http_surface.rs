use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use books_advisor::NullAdvisorClient;
use books_ledger::AccountType;
use books_ledger::BankAccount;
use books_ledger::BankTransaction;
use books_ledger::JournalEntry;
use books_ledger::JournalLine;
use books_ledger::TaxRate;
use books_ledger::Tenant;
use books_server::AppState;
use books_server::ServerConfig;
use books_server::router;
use chrono::NaiveDate;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tower::ServiceExt;

struct Harness {
    state: Arc<AppState>,
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

impl Harness {
    fn new() -> Self {
        let state = Arc::new(AppState::with_advisor(
            ServerConfig::default(),
            Arc::new(NullAdvisorClient),
        ));
        Self { state }
    }

    fn seed_tenant(&self, tenant_id: &str, companion_enabled: bool) -> Tenant {
        self.state
            .store
            .insert_tenant(Tenant {
                id: tenant_id.into(),
                name: format!("{tenant_id} Books"),
                currency: "USD".into(),
                fiscal_year_start_month: 1,
                companion_enabled,
            })
            .expect("tenant")
    }

    fn seed_bank_account(&self, tenant_id: &str, bank_account_id: &str) {
        let cash = self
            .state
            .store
            .get_or_create_account(
                &tenant_id.to_string(),
                "1010",
                "Cash at Bank",
                AccountType::Asset,
            )
            .expect("cash account");
        self.state
            .store
            .insert_bank_account(BankAccount {
                id: bank_account_id.into(),
                tenant_id: tenant_id.into(),
                name: "Operating".into(),
                ledger_account_id: Some(cash.id),
                is_active: true,
            })
            .expect("bank account");
    }

    fn seed_transaction(
        &self,
        bank_account_id: &str,
        day: u32,
        amount_minor: i64,
    ) -> BankTransaction {
        self.state
            .store
            .insert_bank_transaction(BankTransaction::new(
                bank_account_id,
                date(2025, 3, day),
                "card settlement",
                amount_minor,
            ))
            .expect("transaction")
    }

    fn seed_entry(&self, tenant_id: &str, day: u32, amount_minor: i64) -> JournalEntry {
        let cash = self
            .state
            .store
            .account_by_code(&tenant_id.to_string(), "1010")
            .expect("lookup")
            .expect("cash exists");
        let sales = self
            .state
            .store
            .get_or_create_account(&tenant_id.to_string(), "4010", "Sales", AccountType::Income)
            .expect("sales account");
        let mut entry = JournalEntry::new(tenant_id, date(2025, 3, day), "cash sale");
        entry.lines = vec![
            JournalLine::new(cash.id, amount_minor, 0),
            JournalLine::new(sales.id, 0, amount_minor),
        ];
        self.state.store.insert_entry(entry).expect("entry")
    }

    async fn send(
        &self,
        method: &str,
        uri: &str,
        tenant: &str,
        staff: bool,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-tenant-id", tenant);
        if staff {
            builder = builder.header("x-user-role", "staff");
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = router(self.state.clone())
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    async fn resolve_march_session(&self, tenant: &str, account: &str) -> Value {
        let (status, body) = self
            .send(
                "GET",
                &format!(
                    "/reconciliation/session?account={account}&start=2025-03-01&end=2025-03-31"
                ),
                tenant,
                false,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body
    }
}

fn session_id(overview: &Value) -> String {
    overview
        .pointer("/session/id")
        .and_then(Value::as_str)
        .expect("session id")
        .to_string()
}

#[tokio::test]
async fn missing_tenant_header_is_rejected() {
    let harness = Harness::new();
    let request = Request::builder()
        .method("GET")
        .uri("/reconciliation/accounts")
        .body(Body::empty())
        .expect("request");
    let response = router(harness.state.clone())
        .oneshot(request)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_tenants_read_as_not_found() {
    let harness = Harness::new();
    let (status, body) = harness
        .send("GET", "/reconciliation/accounts", "ghost", false, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body.get("error").and_then(Value::as_str), Some("not_found"));
}

#[tokio::test]
async fn cross_tenant_ids_are_never_confirmed() {
    let harness = Harness::new();
    harness.seed_tenant("tenant-1", false);
    harness.seed_tenant("tenant-2", false);
    harness.seed_bank_account("tenant-1", "bank-1");
    let tx = harness.seed_transaction("bank-1", 10, -11_500);

    // The other tenant cannot see tenant-1's bank account or transaction.
    let (status, _) = harness
        .send(
            "GET",
            "/reconciliation/accounts/bank-1/periods",
            "tenant-2",
            false,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = harness
        .send(
            "POST",
            &format!("/banking/transactions/{}/allocate", tx.id),
            "tenant-2",
            false,
            Some(json!({"allocations": [{"kind": "DIRECT_EXPENSE", "amount_minor": 11_500, "account_id": "whatever"}]})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn allocation_endpoint_posts_a_balanced_entry() {
    let harness = Harness::new();
    harness.seed_tenant("tenant-1", false);
    harness.seed_bank_account("tenant-1", "bank-1");
    let tx = harness.seed_transaction("bank-1", 12, -11_500);
    harness
        .state
        .store
        .insert_tax_rate(TaxRate {
            id: "rate-15".into(),
            tenant_id: "tenant-1".into(),
            name: "Standard 15%".into(),
            rate_bps: 1_500,
            applies_to_sales: true,
            applies_to_purchases: true,
            is_active: true,
        })
        .expect("tax rate");
    let expense = harness
        .state
        .store
        .get_or_create_account(
            &"tenant-1".to_string(),
            "5010",
            "Operating Expenses",
            AccountType::Expense,
        )
        .expect("expense account");

    let (status, body) = harness
        .send(
            "POST",
            &format!("/banking/transactions/{}/allocate", tx.id),
            "tenant-1",
            false,
            Some(json!({
                "allocations": [{
                    "kind": "DIRECT_EXPENSE",
                    "amount_minor": 10_000,
                    "account_id": expense.id,
                    "tax_treatment": "ON_TOP",
                    "tax_rate_id": "rate-15",
                }],
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "allocation failed: {body}");
    let lines = body.get("lines").and_then(Value::as_array).expect("lines");
    assert_eq!(lines.len(), 3);
    let total_debit: i64 = lines
        .iter()
        .filter_map(|line| line.get("debit_minor").and_then(Value::as_i64))
        .sum();
    let total_credit: i64 = lines
        .iter()
        .filter_map(|line| line.get("credit_minor").and_then(Value::as_i64))
        .sum();
    assert_eq!(total_debit, total_credit);

    let updated = harness
        .state
        .store
        .bank_transaction(&"tenant-1".to_string(), &tx.id)
        .expect("transaction");
    assert_eq!(updated.allocated_minor, 11_500);
}

#[tokio::test]
async fn completion_gate_reports_codes() {
    let harness = Harness::new();
    harness.seed_tenant("tenant-1", false);
    harness.seed_bank_account("tenant-1", "bank-1");
    let entry = harness.seed_entry("tenant-1", 5, 10_000);
    let matched = harness.seed_transaction("bank-1", 5, 10_000);
    let stray = harness.seed_transaction("bank-1", 6, 1_500);

    let overview = harness.resolve_march_session("tenant-1", "bank-1").await;
    let sid = session_id(&overview);

    let (status, _) = harness
        .send(
            "POST",
            &format!("/reconciliation/session/{sid}/match"),
            "tenant-1",
            false,
            Some(json!({
                "transaction_id": matched.id,
                "journal_entry_id": entry.id,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = harness
        .send(
            "POST",
            &format!("/reconciliation/session/{sid}/complete"),
            "tenant-1",
            false,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body.get("code").and_then(Value::as_str),
        Some("unreconciled_transactions_remaining")
    );

    let (status, _) = harness
        .send(
            "POST",
            &format!("/reconciliation/session/{sid}/exclude"),
            "tenant-1",
            false,
            Some(json!({"transaction_id": stray.id})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // A statement balance above the cleared ledger blocks completion.
    let (status, _) = harness
        .send(
            "POST",
            &format!("/reconciliation/session/{sid}/set_statement_balance"),
            "tenant-1",
            false,
            Some(json!({"statement_ending_balance_minor": 10_500})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = harness
        .send(
            "POST",
            &format!("/reconciliation/session/{sid}/complete"),
            "tenant-1",
            false,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body.get("code").and_then(Value::as_str),
        Some("difference_not_zero")
    );

    let (status, _) = harness
        .send(
            "POST",
            &format!("/reconciliation/session/{sid}/set_statement_balance"),
            "tenant-1",
            false,
            Some(json!({"statement_ending_balance_minor": 10_000})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = harness
        .send(
            "POST",
            &format!("/reconciliation/session/{sid}/complete"),
            "tenant-1",
            false,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "completion failed: {body}");
    assert_eq!(
        body.pointer("/session/status").and_then(Value::as_str),
        Some("COMPLETED")
    );

    // Completed sessions reject every mutation with the session code.
    let (status, body) = harness
        .send(
            "POST",
            &format!("/reconciliation/session/{sid}/unmatch"),
            "tenant-1",
            false,
            Some(json!({"transaction_id": matched.id})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body.get("code").and_then(Value::as_str),
        Some("session_completed")
    );
}

#[tokio::test]
async fn reopen_is_staff_only() {
    let harness = Harness::new();
    harness.seed_tenant("tenant-1", false);
    harness.seed_bank_account("tenant-1", "bank-1");
    let overview = harness.resolve_march_session("tenant-1", "bank-1").await;
    let sid = session_id(&overview);

    // Empty session completes trivially (no transactions, zero balances).
    let (status, _) = harness
        .send(
            "POST",
            &format!("/reconciliation/session/{sid}/complete"),
            "tenant-1",
            false,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = harness
        .send(
            "POST",
            &format!("/reconciliation/sessions/{sid}/reopen"),
            "tenant-1",
            false,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = harness
        .send(
            "POST",
            &format!("/reconciliation/sessions/{sid}/reopen"),
            "tenant-1",
            true,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body.pointer("/session/status").and_then(Value::as_str),
        Some("IN_PROGRESS")
    );
}

#[tokio::test]
async fn review_runs_persist_and_surface_issues() {
    let harness = Harness::new();
    harness.seed_tenant("tenant-1", false);

    let (status, body) = harness
        .send(
            "POST",
            "/agentic/receipts/run",
            "tenant-1",
            false,
            Some(json!({
                "as_of": "2025-04-15",
                "documents": [
                    {"document_id": "doc-1", "original_filename": "receipt.jpg"},
                    {
                        "document_id": "doc-2",
                        "original_filename": "lunch.jpg",
                        "extracted": {
                            "vendor": "Blue Bottle",
                            "total_minor": 1_450,
                            "date_raw": "2025-04-10",
                            "currency": "USD",
                        },
                    },
                ],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "run failed: {body}");
    let run_id = body
        .pointer("/run/id")
        .and_then(Value::as_str)
        .expect("run id")
        .to_string();
    assert_eq!(
        body.pointer("/run/status").and_then(Value::as_str),
        Some("completed")
    );

    let (status, body) = harness
        .send("GET", "/agentic/receipts/runs", "tenant-1", false, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body.get("runs").and_then(Value::as_array).map(Vec::len),
        Some(1)
    );

    let (status, _) = harness
        .send(
            "GET",
            &format!("/agentic/run/{run_id}"),
            "tenant-1",
            false,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // The errored document became a companion issue.
    let (status, body) = harness
        .send(
            "GET",
            "/agentic/companion/issues?status=open",
            "tenant-1",
            false,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let issues = body.as_array().expect("issues");
    assert!(!issues.is_empty());
    let issue_id = issues[0]
        .get("id")
        .and_then(Value::as_str)
        .expect("issue id")
        .to_string();

    let (status, body) = harness
        .send(
            "PATCH",
            &format!("/agentic/companion/issues/{issue_id}"),
            "tenant-1",
            false,
            Some(json!({"status": "resolved"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.get("status").and_then(Value::as_str), Some("resolved"));

    // Cross-tenant issue access is 404.
    harness.seed_tenant("tenant-2", false);
    let (status, _) = harness
        .send(
            "PATCH",
            &format!("/agentic/companion/issues/{issue_id}"),
            "tenant-2",
            false,
            Some(json!({"status": "dismissed"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn companion_summary_is_deterministic_and_cached() {
    let harness = Harness::new();
    harness.seed_tenant("tenant-1", true);
    harness.seed_bank_account("tenant-1", "bank-1");
    harness.seed_transaction("bank-1", 10, -9_900);

    let (status, body) = harness
        .send("GET", "/agentic/companion/summary", "tenant-1", false, None)
        .await;
    assert_eq!(status, StatusCode::OK);

    for key in ["issues", "radar", "coverage", "close_readiness", "playbook", "story"] {
        assert!(body.get(key).is_some(), "summary missing {key}");
    }
    // No generated story yet: the read path serves the fallback and marks
    // the tenant dirty without calling the advisor.
    assert_eq!(
        body.pointer("/story/overall_summary").and_then(Value::as_str),
        Some("Your financial data is being analyzed. Check back soon for personalized insights.")
    );
    assert_eq!(
        body.pointer("/radar/cash_reconciliation/score")
            .and_then(Value::as_i64),
        Some(100)
    );
}
