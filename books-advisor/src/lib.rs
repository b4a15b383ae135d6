#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Guardrailed access to the language-model advisor.
//!
//! The advisor is never authoritative: every entry point here returns
//! `Option<T>`, where `None` means "advisor unavailable" and the caller
//! proceeds with its deterministic output alone. Responses are fence
//! stripped, schema validated, and whitelist filtered so the advisor can
//! only ever reference ids that were in the request payload.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

mod critic;
mod story;

pub use critic::CRITIC_AMOUNT_THRESHOLD_MINOR;
pub use critic::CriticInput;
pub use critic::CriticReport;
pub use critic::CriticVerdict;
pub use critic::audit_high_risk_transaction;
pub use story::StoryDraft;
pub use story::generate_companion_story;

pub type AdvisorResult<T> = Result<T, AdvisorError>;

/// Default watchdog for review-time advisor calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
/// Generous watchdog for background story generation.
pub const STORY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor is not configured")]
    Disabled,
    #[error("advisor request failed: {0}")]
    Http(String),
    #[error("advisor returned an unusable response: {0}")]
    BadResponse(String),
}

#[async_trait]
pub trait AdvisorClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> AdvisorResult<String>;
}

/// Stand-in when no advisor endpoint is configured; every call reports
/// the advisor as unavailable.
#[derive(Default)]
pub struct NullAdvisorClient;

#[async_trait]
impl AdvisorClient for NullAdvisorClient {
    async fn complete(&self, _prompt: &str) -> AdvisorResult<String> {
        Err(AdvisorError::Disabled)
    }
}

/// OpenAI-compatible chat-completions client.
pub struct HttpAdvisorClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpAdvisorClient {
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait]
impl AdvisorClient for HttpAdvisorClient {
    async fn complete(&self, prompt: &str) -> AdvisorResult<String> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.2,
        });
        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| AdvisorError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AdvisorError::Http(format!(
                "status {}",
                response.status()
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| AdvisorError::BadResponse(err.to_string()))?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdvisorError::BadResponse("missing message content".into()))
    }
}

/// Test double that replays canned responses and counts invocations.
pub struct StaticAdvisorClient {
    responses: Mutex<Vec<String>>,
    fallback: Option<String>,
    calls: AtomicUsize,
}

impl StaticAdvisorClient {
    /// Always answer with the same body.
    #[must_use]
    pub fn always(response: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: Some(response.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer with the queued bodies in order, erroring when exhausted.
    #[must_use]
    pub fn queue(responses: Vec<String>) -> Self {
        let mut ordered = responses;
        ordered.reverse();
        Self {
            responses: Mutex::new(ordered),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdvisorClient for StaticAdvisorClient {
    async fn complete(&self, _prompt: &str) -> AdvisorResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let queued = self
            .responses
            .lock()
            .map_err(|_| AdvisorError::Http("response queue poisoned".into()))?
            .pop();
        queued
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| AdvisorError::Http("no canned response left".into()))
    }
}

/// Run the advisor under a hard deadline. Timeouts and transport errors
/// both collapse to `None`; deterministic callers never see them.
pub async fn invoke_with_watchdog(
    client: &dyn AdvisorClient,
    prompt: &str,
    timeout: Duration,
) -> Option<String> {
    match tokio::time::timeout(timeout, client.complete(prompt)).await {
        Ok(Ok(raw)) => Some(raw),
        Ok(Err(AdvisorError::Disabled)) => None,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "advisor call failed");
            None
        }
        Err(_) => {
            tracing::warn!(timeout_seconds = timeout.as_secs(), "advisor call timed out");
            None
        }
    }
}

/// Strip a leading/trailing markdown code fence; advisors routinely wrap
/// JSON in ```json blocks.
#[must_use]
pub fn strip_markdown_fences(raw: &str) -> &str {
    let text = raw.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = match rest.find('\n') {
        Some(index) => &rest[index + 1..],
        None => rest,
    };
    rest.trim_end()
        .strip_suffix("```")
        .map_or(rest, str::trim_end)
        .trim()
}

async fn guarded_call<T: DeserializeOwned>(
    client: &dyn AdvisorClient,
    timeout: Duration,
    system_prompt: &str,
    payload: &Value,
    surface: &str,
) -> Option<T> {
    let prompt = format!(
        "{system_prompt}\n\nDATA:\n{}",
        serde_json::to_string(payload).ok()?
    );
    let raw = invoke_with_watchdog(client, &prompt, timeout).await?;
    let stripped = strip_markdown_fences(&raw);
    let parsed: Value = match serde_json::from_str(stripped) {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(surface, "advisor returned non-JSON response");
            return None;
        }
    };
    match serde_json::from_value(parsed) {
        Ok(result) => Some(result),
        Err(err) => {
            tracing::warn!(surface, error = %err, "advisor response failed validation");
            None
        }
    }
}

fn allowed_ids(items: &[Value], key: &str) -> HashSet<String> {
    items
        .iter()
        .filter_map(|item| item.get(key))
        .filter_map(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisorSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisorPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedBookIssue {
    pub severity: AdvisorSeverity,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub related_journal_ids: Vec<String>,
    #[serde(default)]
    pub related_accounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BooksAdvice {
    #[serde(default)]
    pub explanations: Vec<String>,
    #[serde(default)]
    pub ranked_issues: Vec<RankedBookIssue>,
    #[serde(default)]
    pub suggested_checks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTransaction {
    pub transaction_id: String,
    pub priority: AdvisorPriority,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BankAdvice {
    #[serde(default)]
    pub explanations: Vec<String>,
    #[serde(default)]
    pub ranked_transactions: Vec<RankedTransaction>,
    #[serde(default)]
    pub suggested_followups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDocument {
    pub document_id: String,
    pub priority: AdvisorPriority,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedClassification {
    pub document_id: String,
    #[serde(default)]
    pub suggested_account_code: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentsAdvice {
    #[serde(default)]
    pub explanations: Vec<String>,
    #[serde(default)]
    pub ranked_documents: Vec<RankedDocument>,
    #[serde(default)]
    pub suggested_classifications: Vec<SuggestedClassification>,
    #[serde(default)]
    pub suggested_followups: Vec<String>,
}

impl DocumentsAdvice {
    fn confidences_in_range(&self) -> bool {
        self.suggested_classifications
            .iter()
            .filter_map(|c| c.confidence)
            .all(|value| (0.0..=1.0).contains(&value))
    }
}

/// Guardrailed reasoning over a books review run.
pub async fn reason_about_books_review(
    client: &dyn AdvisorClient,
    timeout: Duration,
    metrics: &Value,
    findings: &Value,
    sample_journals: &[Value],
) -> Option<BooksAdvice> {
    let allowed_journals = allowed_ids(sample_journals, "id");
    let allowed_accounts: HashSet<String> = sample_journals
        .iter()
        .filter_map(|journal| journal.get("accounts"))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|account| account.get("code"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    let system_prompt = "You are an accounting QA companion. Only reason about the JSON provided. \
        Do not invent transactions, dates, or amounts. Do not change numbers. \
        Only reference journal_entry_ids or account codes that appear in the input. \
        Respond with JSON only and no extra text.";
    let payload = json!({
        "metrics": metrics,
        "findings": findings,
        "sample_journals": sample_journals,
        "output_schema": {
            "explanations": ["short narrative sentences about the ledger health"],
            "ranked_issues": [{
                "severity": "low|medium|high",
                "title": "short title",
                "message": "explain the pattern using only provided numbers",
                "related_journal_ids": ["must come from input sample_journals"],
                "related_accounts": ["account codes present in input"],
            }],
            "suggested_checks": ["short suggestions on where to look next"],
        },
        "rules": [
            "Do not fabricate transactions, IDs, dates, or amounts.",
            "Only cite journal ids and account codes from sample_journals.",
            "Use concise, factual language.",
            "Return ONLY the JSON object described by output_schema.",
        ],
    });

    let mut advice: BooksAdvice =
        guarded_call(client, timeout, system_prompt, &payload, "books_review").await?;
    for issue in &mut advice.ranked_issues {
        issue
            .related_journal_ids
            .retain(|id| allowed_journals.contains(id));
        issue
            .related_accounts
            .retain(|code| allowed_accounts.contains(code));
    }
    Some(advice)
}

/// Guardrailed reasoning over a bank review run.
pub async fn reason_about_bank_review(
    client: &dyn AdvisorClient,
    timeout: Duration,
    metrics: &Value,
    transactions: &[Value],
) -> Option<BankAdvice> {
    let allowed = allowed_ids(transactions, "transaction_id");

    let system_prompt = "You are an audit-focused bank reconciliation assistant. Only reason \
        about the JSON provided. Do not invent transactions, IDs, dates, or amounts. Return ONLY \
        JSON with explanations, ranked_transactions, and suggested_followups.";
    let payload = json!({
        "metrics": metrics,
        "transactions": transactions,
        "output_schema": {
            "explanations": ["1-2 sentence narrative about reconciliation status"],
            "ranked_transactions": [{
                "transaction_id": "<existing id from input>",
                "priority": "high|medium|low",
                "reason": "why this line matters",
            }],
            "suggested_followups": ["concise next steps for a human reviewer"],
        },
        "rules": [
            "Only reference transaction_id values that were provided.",
            "Do not invent new amounts or balances; treat numerics descriptively.",
            "Keep reasons short and actionable.",
            "Respond with ONLY the JSON object described by output_schema.",
        ],
    });

    let mut advice: BankAdvice =
        guarded_call(client, timeout, system_prompt, &payload, "bank_review").await?;
    advice
        .ranked_transactions
        .retain(|tx| allowed.contains(&tx.transaction_id));
    Some(advice)
}

async fn reason_about_documents(
    client: &dyn AdvisorClient,
    timeout: Duration,
    metrics: &Value,
    documents: &[Value],
    surface: &str,
    system_prompt: &str,
) -> Option<DocumentsAdvice> {
    let allowed = allowed_ids(documents, "document_id");
    let payload = json!({
        "metrics": metrics,
        "documents": documents,
        "output_schema": {
            "explanations": ["short sentences summarizing risk and focus areas"],
            "ranked_documents": [{
                "document_id": "<existing id from input>",
                "priority": "high|medium|low",
                "reason": "why to review",
            }],
            "suggested_classifications": [{
                "document_id": "<existing id from input>",
                "suggested_account_code": "string code if any",
                "confidence": "0-1",
                "reason": "short rationale",
            }],
            "suggested_followups": ["concise next steps for a human reviewer"],
        },
        "rules": [
            "Only reference document_id values that were provided.",
            "Do not invent new amounts or vendors; rely only on the provided JSON.",
            "Suggested classifications are proposals only.",
            "Respond with ONLY the JSON object described by output_schema.",
        ],
    });

    let mut advice: DocumentsAdvice =
        guarded_call(client, timeout, system_prompt, &payload, surface).await?;
    if !advice.confidences_in_range() {
        tracing::warn!(surface, "advisor suggested out-of-range confidence");
        return None;
    }
    advice
        .ranked_documents
        .retain(|doc| allowed.contains(&doc.document_id));
    advice
        .suggested_classifications
        .retain(|c| allowed.contains(&c.document_id));
    Some(advice)
}

/// Guardrailed reasoning over a receipts run.
pub async fn reason_about_receipts_run(
    client: &dyn AdvisorClient,
    timeout: Duration,
    metrics: &Value,
    documents: &[Value],
) -> Option<DocumentsAdvice> {
    reason_about_documents(
        client,
        timeout,
        metrics,
        documents,
        "receipts",
        "You are a receipts audit companion. Only reason about the JSON provided. Do not invent \
         receipts, amounts, vendors, or account codes. Return ONLY JSON with explanations, \
         ranked_documents, suggested_classifications, suggested_followups.",
    )
    .await
}

/// Guardrailed reasoning over an invoices run.
pub async fn reason_about_invoices_run(
    client: &dyn AdvisorClient,
    timeout: Duration,
    metrics: &Value,
    documents: &[Value],
) -> Option<DocumentsAdvice> {
    reason_about_documents(
        client,
        timeout,
        metrics,
        documents,
        "invoices",
        "You are an invoices audit companion. Only reason about the JSON provided. Do not invent \
         invoices, amounts, vendors, or account codes. Return ONLY JSON with explanations, \
         ranked_documents, suggested_classifications, suggested_followups.",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fence_stripping_handles_plain_and_wrapped_json() {
        assert_eq!(strip_markdown_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(
            strip_markdown_fences("```json\n{\"a\":1}\n```"),
            "{\"a\":1}"
        );
        assert_eq!(strip_markdown_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_markdown_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn whitelist_filter_drops_unknown_ids() {
        let client = StaticAdvisorClient::always(
            r#"{
                "explanations": ["two documents reviewed"],
                "ranked_documents": [
                    {"document_id": "1", "priority": "high", "reason": "missing vendor"},
                    {"document_id": "99", "priority": "high", "reason": "fabricated"}
                ],
                "suggested_classifications": [],
                "suggested_followups": []
            }"#,
        );
        let documents = vec![
            json!({"document_id": "1", "vendor": "Acme"}),
            json!({"document_id": "2", "vendor": "Globex"}),
        ];
        let advice = reason_about_receipts_run(
            &client,
            DEFAULT_TIMEOUT,
            &json!({"documents_total": 2}),
            &documents,
        )
        .await
        .expect("advice");

        assert_eq!(advice.ranked_documents.len(), 1);
        assert_eq!(advice.ranked_documents[0].document_id, "1");
    }

    #[tokio::test]
    async fn invalid_priority_rejects_the_whole_response() {
        let client = StaticAdvisorClient::always(
            r#"{"ranked_documents": [{"document_id": "1", "priority": "urgent", "reason": "x"}]}"#,
        );
        let documents = vec![json!({"document_id": "1"})];
        let advice =
            reason_about_receipts_run(&client, DEFAULT_TIMEOUT, &json!({}), &documents).await;
        assert!(advice.is_none());
    }

    #[tokio::test]
    async fn out_of_range_confidence_rejects_the_whole_response() {
        let client = StaticAdvisorClient::always(
            r#"{
                "ranked_documents": [],
                "suggested_classifications": [
                    {"document_id": "1", "suggested_account_code": "5010", "confidence": 1.7, "reason": "x"}
                ]
            }"#,
        );
        let documents = vec![json!({"document_id": "1"})];
        let advice =
            reason_about_receipts_run(&client, DEFAULT_TIMEOUT, &json!({}), &documents).await;
        assert!(advice.is_none());
    }

    #[tokio::test]
    async fn non_json_response_collapses_to_none() {
        let client = StaticAdvisorClient::always("I think everything looks fine!");
        let advice =
            reason_about_bank_review(&client, DEFAULT_TIMEOUT, &json!({}), &[]).await;
        assert!(advice.is_none());
    }

    #[tokio::test]
    async fn books_filter_keeps_known_journals_and_accounts() {
        let client = StaticAdvisorClient::always(
            r#"{
                "explanations": [],
                "ranked_issues": [{
                    "severity": "medium",
                    "title": "Duplicates",
                    "message": "two entries look alike",
                    "related_journal_ids": ["je-1", "je-404"],
                    "related_accounts": ["1010", "7777"]
                }],
                "suggested_checks": []
            }"#,
        );
        let samples = vec![json!({
            "id": "je-1",
            "accounts": [{"code": "1010"}, {"code": "4010"}],
        })];
        let advice = reason_about_books_review(
            &client,
            DEFAULT_TIMEOUT,
            &json!({}),
            &json!([]),
            &samples,
        )
        .await
        .expect("advice");

        assert_eq!(advice.ranked_issues[0].related_journal_ids, vec!["je-1"]);
        assert_eq!(advice.ranked_issues[0].related_accounts, vec!["1010"]);
    }

    #[tokio::test]
    async fn null_client_reports_unavailable() {
        let advice =
            reason_about_bank_review(&NullAdvisorClient, DEFAULT_TIMEOUT, &json!({}), &[]).await;
        assert!(advice.is_none());
    }
}
