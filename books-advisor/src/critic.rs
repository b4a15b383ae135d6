use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

use crate::AdvisorClient;
use crate::invoke_with_watchdog;
use crate::strip_markdown_fences;

/// Transactions at or below this absolute amount skip the critic entirely
/// unless flagged as a bulk adjustment.
pub const CRITIC_AMOUNT_THRESHOLD_MINOR: i64 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriticVerdict {
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticInput {
    pub amount_minor: i64,
    pub currency: String,
    pub accounts: Vec<String>,
    pub memo: String,
    pub source: String,
    pub is_bulk_adjustment: bool,
}

/// Advisory outcome; `called_llm` records whether the model was consulted
/// at all, which the threshold short-circuit avoids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticReport {
    pub verdict: CriticVerdict,
    pub reasons: Vec<String>,
    pub called_llm: bool,
}

#[derive(Debug, Deserialize)]
struct CriticResponse {
    verdict: CriticVerdict,
    #[serde(default)]
    reasons: Vec<String>,
}

/// Second-opinion review of a large or bulk posting. The verdict never
/// blocks the posting; it is attached to the transaction for display.
pub async fn audit_high_risk_transaction(
    client: &dyn AdvisorClient,
    timeout: Duration,
    input: &CriticInput,
) -> CriticReport {
    if input.amount_minor.abs() <= CRITIC_AMOUNT_THRESHOLD_MINOR && !input.is_bulk_adjustment {
        return CriticReport {
            verdict: CriticVerdict::Ok,
            reasons: vec!["Amount below high-risk thresholds.".into()],
            called_llm: false,
        };
    }

    let payload = json!({
        "amount": major_units(input.amount_minor),
        "currency": input.currency,
        "accounts": input.accounts,
        "memo": input.memo,
        "source": input.source,
        "is_bulk_adjustment": input.is_bulk_adjustment,
        "output_schema": {"verdict": "ok|warn|fail", "reasons": ["short factual reasons"]},
        "rules": [
            "Judge only the risk of this posting as described.",
            "Do not invent accounts, amounts, or policies.",
            "Respond with ONLY the JSON object described by output_schema.",
        ],
    });
    let prompt = format!(
        "You are a skeptical accounting reviewer. Flag postings that look risky or unusual. \
         Respond with JSON only.\n\nDATA:\n{payload}"
    );

    let parsed = match invoke_with_watchdog(client, &prompt, timeout).await {
        Some(raw) => serde_json::from_str::<CriticResponse>(strip_markdown_fences(&raw)).ok(),
        None => None,
    };
    match parsed {
        Some(response) => CriticReport {
            verdict: response.verdict,
            reasons: response.reasons,
            called_llm: true,
        },
        None => {
            tracing::warn!(source = %input.source, "high-risk critic unavailable");
            CriticReport {
                verdict: CriticVerdict::Warn,
                reasons: vec!["High-value posting; reviewer advisor unavailable.".into()],
                called_llm: true,
            }
        }
    }
}

fn major_units(amount_minor: i64) -> f64 {
    amount_minor as f64 / 100.0
}
