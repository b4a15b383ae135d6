#![deny(clippy::print_stdout, clippy::print_stderr)]

//! HTTP surface for the reconciliation and review core: request parsing,
//! tenant scoping, and response shaping. All ledger mutations run through
//! the engine crates; advisor calls always happen after the deterministic
//! results are persisted, never inside a store mutation.

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::patch;
use axum::routing::post;
use books_advisor::AdvisorClient;
use books_advisor::HttpAdvisorClient;
use books_advisor::NullAdvisorClient;
use books_allocate::AllocateError;
use books_companion::CompanionError;
use books_companion::InMemoryIssueStore;
use books_companion::InMemoryStoryStore;
use books_companion::IssueStore;
use books_companion::StoryStore;
use books_ledger::InMemoryLedgerStore;
use books_ledger::LedgerError;
use books_ledger::LedgerStore;
use books_ledger::Tenant;
use books_reconcile::ReconcileError;
use books_reconcile::SessionEngine;
use books_review::InMemoryRunStore;
use books_review::ReviewError;
use books_review::RunStore;
use serde_json::json;

mod banking;
mod companion;
pub mod config;
pub mod demo;
mod reconciliation;
mod review;
pub mod worker;

pub use config::ServerConfig;

pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub sessions: SessionEngine,
    pub runs: Arc<dyn RunStore>,
    pub issues: Arc<dyn IssueStore>,
    pub stories: Arc<dyn StoryStore>,
    pub advisor: Arc<dyn AdvisorClient>,
    pub config: ServerConfig,
}

impl AppState {
    /// Wire the in-memory stores and the advisor client selected by the
    /// configuration.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let advisor: Arc<dyn AdvisorClient> = match &config.advisor_url {
            Some(url) => Arc::new(HttpAdvisorClient::new(
                url.clone(),
                config.advisor_api_key.clone(),
                config.advisor_model.clone(),
            )),
            None => Arc::new(NullAdvisorClient),
        };
        Self::with_advisor(config, advisor)
    }

    #[must_use]
    pub fn with_advisor(config: ServerConfig, advisor: Arc<dyn AdvisorClient>) -> Self {
        let store: Arc<InMemoryLedgerStore> = Arc::new(InMemoryLedgerStore::new());
        Self {
            sessions: SessionEngine::new(store.clone()),
            store,
            runs: Arc::new(InMemoryRunStore::new()),
            issues: Arc::new(InMemoryIssueStore::new()),
            stories: Arc::new(InMemoryStoryStore::new()),
            advisor,
            config,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    detail: String,
    code: Option<&'static str>,
}

impl ApiError {
    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "bad_request",
            detail: detail.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            detail: detail.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            error: "forbidden",
            detail: detail.into(),
            code: None,
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal_error",
            detail: detail.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: Option<&'static str>) -> Self {
        self.code = code;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.error,
            "detail": self.detail,
        });
        if let Some(code) = self.code
            && let Some(map) = body.as_object_mut()
        {
            map.insert("code".into(), json!(code));
        }
        (self.status, axum::Json(body)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => Self::not_found(err.to_string()),
            LedgerError::Validation(_) => Self::bad_request(err.to_string()),
            LedgerError::Invariant(_) | LedgerError::Storage(_) => {
                tracing::error!(error = %err, "ledger failure");
                Self::internal(err.to_string())
            }
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        let code = err.code();
        match err {
            ReconcileError::Ledger(inner) => inner.into(),
            other => Self::bad_request(other.to_string()).with_code(code),
        }
    }
}

impl From<AllocateError> for ApiError {
    fn from(err: AllocateError) -> Self {
        match err {
            AllocateError::Ledger(inner) => inner.into(),
            AllocateError::Validation(detail) => Self::bad_request(detail),
        }
    }
}

impl From<ReviewError> for ApiError {
    fn from(err: ReviewError) -> Self {
        match err {
            ReviewError::NotFound(_) => Self::not_found(err.to_string()),
            ReviewError::Storage(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<CompanionError> for ApiError {
    fn from(err: CompanionError) -> Self {
        match err {
            CompanionError::NotFound(_) => Self::not_found(err.to_string()),
            CompanionError::Storage(_) => Self::internal(err.to_string()),
        }
    }
}

/// Resolve the caller's tenant from the `x-tenant-id` header. Unknown
/// tenants read as 404; ids are never confirmed across tenants.
pub fn tenant_from_headers(state: &AppState, headers: &HeaderMap) -> Result<Tenant, ApiError> {
    let tenant_id = headers
        .get("x-tenant-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("x-tenant-id header is required"))?;
    Ok(state.store.tenant(&tenant_id.to_string())?)
}

/// Staff-only recovery actions are keyed off the `x-user-role` header.
#[must_use]
pub fn is_staff(headers: &HeaderMap) -> bool {
    headers
        .get("x-user-role")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|role| role.eq_ignore_ascii_case("staff"))
}

#[must_use]
pub fn acting_user(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-name")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/reconciliation/accounts", get(reconciliation::list_accounts))
        .route(
            "/reconciliation/accounts/{id}/periods",
            get(reconciliation::list_periods),
        )
        .route("/reconciliation/session", get(reconciliation::resolve_session))
        .route(
            "/reconciliation/session/{id}/set_statement_balance",
            post(reconciliation::set_statement_balance),
        )
        .route(
            "/reconciliation/session/{id}/match",
            post(reconciliation::match_transaction),
        )
        .route(
            "/reconciliation/session/{id}/unmatch",
            post(reconciliation::unmatch_transaction),
        )
        .route(
            "/reconciliation/session/{id}/exclude",
            post(reconciliation::exclude_transaction),
        )
        .route(
            "/reconciliation/session/{id}/complete",
            post(reconciliation::complete_session),
        )
        .route(
            "/reconciliation/sessions/{id}/reopen",
            post(reconciliation::reopen_session),
        )
        .route(
            "/reconciliation/sessions/{id}",
            delete(reconciliation::delete_session),
        )
        .route("/reconciliation/add-as-new", post(reconciliation::add_as_new))
        .route(
            "/banking/transactions/{id}/allocate",
            post(banking::allocate_transaction),
        )
        .route(
            "/banking/transactions/{id}/suggestions",
            get(banking::suggestions),
        )
        .route("/agentic/receipts/run", post(review::run_receipts))
        .route("/agentic/invoices/run", post(review::run_invoices))
        .route("/agentic/books-review/run", post(review::run_books))
        .route("/agentic/bank-review/run", post(review::run_bank))
        .route("/agentic/{kind}/runs", get(review::list_runs))
        .route("/agentic/run/{id}", get(review::run_detail))
        .route("/agentic/companion/issues", get(companion::list_issues))
        .route(
            "/agentic/companion/issues/{id}",
            patch(companion::update_issue),
        )
        .route("/agentic/companion/summary", get(companion::summary))
        .with_state(state)
}
