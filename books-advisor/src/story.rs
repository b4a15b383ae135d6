use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::AdvisorClient;
use crate::invoke_with_watchdog;
use crate::strip_markdown_fences;

/// Narrative produced for the companion home surface. Cached and
/// fingerprint gated by the story cache; never generated on a read path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryDraft {
    pub overall_summary: String,
    #[serde(default)]
    pub timeline_bullets: Vec<String>,
}

/// Generate the companion story from the radar and recent issues. Returns
/// `None` when the advisor is unavailable; the caller persists a fallback.
pub async fn generate_companion_story(
    client: &dyn AdvisorClient,
    timeout: Duration,
    first_name: &str,
    radar: &Value,
    recent_issues: &[Value],
    focus_mode: &str,
) -> Option<StoryDraft> {
    let payload = json!({
        "first_name": first_name,
        "focus_mode": focus_mode,
        "radar": radar,
        "recent_issues": recent_issues,
        "output_schema": {
            "overall_summary": "2-3 friendly sentences about the books, addressed to first_name",
            "timeline_bullets": ["short chronological bullets, newest first"],
        },
        "rules": [
            "Use only the radar scores and issues provided.",
            "Do not invent amounts, vendors, or dates.",
            "Match the tone to focus_mode: fire_drill is urgent, watchlist is attentive, all_clear is relaxed.",
            "Respond with ONLY the JSON object described by output_schema.",
        ],
    });
    let prompt = format!(
        "You are a bookkeeping companion writing a short status story for a business owner. \
         Respond with JSON only.\n\nDATA:\n{payload}"
    );

    let raw = invoke_with_watchdog(client, &prompt, timeout).await?;
    match serde_json::from_str::<StoryDraft>(strip_markdown_fences(&raw)) {
        Ok(draft) => Some(draft),
        Err(err) => {
            tracing::warn!(error = %err, "story generation returned an invalid payload");
            None
        }
    }
}
