use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration as StdDuration;

use books_advisor::AdvisorClient;
use books_advisor::generate_companion_story;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;

use crate::CompanionError;
use crate::CompanionIssue;
use crate::CompanionResult;
use crate::IssueSeverity;
use crate::Radar;

/// Minimum interval between regenerations for one tenant.
pub const STORY_DEBOUNCE: StdDuration = StdDuration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub overall_summary: String,
    #[serde(default)]
    pub timeline_bullets: Vec<String>,
}

/// Shown while no generated story exists (or generation failed).
#[must_use]
pub fn fallback_story() -> Story {
    Story {
        overall_summary:
            "Your financial data is being analyzed. Check back soon for personalized insights."
                .into(),
        timeline_bullets: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionStory {
    pub tenant_id: String,
    pub story: Story,
    pub data_fingerprint: String,
    pub generated_at: DateTime<Utc>,
}

impl CompanionStory {
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.story.overall_summary == fallback_story().overall_summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StoryState {
    needs_regeneration: bool,
    last_requested_at: Option<DateTime<Utc>>,
}

pub trait StoryStore: Send + Sync {
    fn story(&self, tenant_id: &str) -> CompanionResult<Option<CompanionStory>>;
    fn upsert_story(&self, story: CompanionStory) -> CompanionResult<CompanionStory>;
    /// Flag the tenant for the periodic worker; keeps the earliest request
    /// time while the flag is already set.
    fn mark_dirty(&self, tenant_id: &str, now: DateTime<Utc>) -> CompanionResult<()>;
    fn clear_dirty(&self, tenant_id: &str) -> CompanionResult<()>;
    fn dirty_tenants(&self) -> CompanionResult<Vec<String>>;
}

#[derive(Default)]
pub struct InMemoryStoryStore {
    stories: RwLock<HashMap<String, CompanionStory>>,
    states: RwLock<HashMap<String, StoryState>>,
}

impl InMemoryStoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoryStore for InMemoryStoryStore {
    fn story(&self, tenant_id: &str) -> CompanionResult<Option<CompanionStory>> {
        let guard = self
            .stories
            .read()
            .map_err(|_| CompanionError::Storage("story store poisoned".into()))?;
        Ok(guard.get(tenant_id).cloned())
    }

    fn upsert_story(&self, story: CompanionStory) -> CompanionResult<CompanionStory> {
        let mut guard = self
            .stories
            .write()
            .map_err(|_| CompanionError::Storage("story store poisoned".into()))?;
        guard.insert(story.tenant_id.clone(), story.clone());
        Ok(story)
    }

    fn mark_dirty(&self, tenant_id: &str, now: DateTime<Utc>) -> CompanionResult<()> {
        let mut guard = self
            .states
            .write()
            .map_err(|_| CompanionError::Storage("story state store poisoned".into()))?;
        let state = guard.entry(tenant_id.to_string()).or_default();
        if !state.needs_regeneration {
            state.needs_regeneration = true;
            state.last_requested_at = Some(now);
        }
        Ok(())
    }

    fn clear_dirty(&self, tenant_id: &str) -> CompanionResult<()> {
        let mut guard = self
            .states
            .write()
            .map_err(|_| CompanionError::Storage("story state store poisoned".into()))?;
        if let Some(state) = guard.get_mut(tenant_id) {
            state.needs_regeneration = false;
        }
        Ok(())
    }

    fn dirty_tenants(&self) -> CompanionResult<Vec<String>> {
        let guard = self
            .states
            .read()
            .map_err(|_| CompanionError::Storage("story state store poisoned".into()))?;
        let mut tenants: Vec<String> = guard
            .iter()
            .filter(|(_, state)| state.needs_regeneration)
            .map(|(tenant, _)| tenant.clone())
            .collect();
        tenants.sort();
        Ok(tenants)
    }
}

/// Stable hash of the inputs the story depends on: the radar plus a
/// minimal projection of the top issues. First 16 hex chars of sha256.
#[must_use]
pub fn compute_fingerprint(radar: &Radar, issues: &[CompanionIssue]) -> String {
    let projection: Vec<Value> = issues
        .iter()
        .take(10)
        .map(|issue| json!({"title": issue.title, "severity": issue.severity}))
        .collect();
    let data = json!({"radar": radar, "issues": projection});
    let serialized = data.to_string();
    let digest = format!("{:x}", Sha256::digest(serialized.as_bytes()));
    digest[..16].to_string()
}

fn focus_mode(radar: &Radar, issues: &[CompanionIssue]) -> &'static str {
    let has_high = issues
        .iter()
        .any(|issue| issue.severity == IssueSeverity::High);
    let avg = radar.average_score();
    if avg < 50.0 || has_high {
        "fire_drill"
    } else if avg < 80.0 {
        "watchlist"
    } else {
        "all_clear"
    }
}

/// Regenerate the tenant's story unless the fingerprint is unchanged or a
/// recent non-fallback story is inside the debounce window. Advisor
/// failure persists the fallback story. Background only; the read path is
/// `cached_story`.
pub async fn regenerate_story(
    store: &dyn StoryStore,
    client: &dyn AdvisorClient,
    tenant_id: &str,
    first_name: &str,
    radar: &Radar,
    open_issues: &[CompanionIssue],
    timeout: StdDuration,
    debounce: StdDuration,
    now: DateTime<Utc>,
) -> CompanionResult<CompanionStory> {
    let fingerprint = compute_fingerprint(radar, open_issues);

    if let Some(existing) = store.story(tenant_id)? {
        let is_fallback = existing.is_fallback();
        if existing.data_fingerprint == fingerprint && !is_fallback {
            tracing::info!(tenant = %tenant_id, "story fingerprint unchanged; skipping regeneration");
            return Ok(existing);
        }
        let age = now - existing.generated_at;
        if age.num_seconds() >= 0
            && (age.num_seconds() as u64) < debounce.as_secs()
            && !is_fallback
        {
            tracing::info!(tenant = %tenant_id, "story regenerated recently; debouncing");
            return Ok(existing);
        }
    }

    let issue_payloads: Vec<Value> = open_issues
        .iter()
        .take(10)
        .map(|issue| {
            json!({
                "title": issue.title,
                "severity": issue.severity,
                "surface": issue.surface,
                "description": issue.description,
            })
        })
        .collect();
    let radar_value = serde_json::to_value(radar)
        .map_err(|err| CompanionError::Storage(err.to_string()))?;
    let draft = generate_companion_story(
        client,
        timeout,
        first_name,
        &radar_value,
        &issue_payloads,
        focus_mode(radar, open_issues),
    )
    .await;

    let story = match draft {
        Some(draft) => Story {
            overall_summary: draft.overall_summary,
            timeline_bullets: draft.timeline_bullets,
        },
        None => {
            tracing::warn!(tenant = %tenant_id, "story generation unavailable; storing fallback");
            fallback_story()
        }
    };

    store.upsert_story(CompanionStory {
        tenant_id: tenant_id.to_string(),
        story,
        data_fingerprint: fingerprint,
        generated_at: now,
    })
}

/// Read path: cached JSON only. A missing story marks the tenant dirty for
/// the next worker pass and returns the fallback.
pub fn cached_story(
    store: &dyn StoryStore,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> CompanionResult<Story> {
    match store.story(tenant_id)? {
        Some(story) => Ok(story.story),
        None => {
            store.mark_dirty(tenant_id, now)?;
            Ok(fallback_story())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IssueStatus;
    use crate::Surface;
    use crate::build_radar;
    use books_advisor::StaticAdvisorClient;
    use pretty_assertions::assert_eq;

    fn issue(title: &str, severity: IssueSeverity, now: DateTime<Utc>) -> CompanionIssue {
        CompanionIssue {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: "tenant-1".into(),
            surface: Surface::Bank,
            run_type: "bank_review".into(),
            run_id: None,
            severity,
            status: IssueStatus::Open,
            title: title.into(),
            description: String::new(),
            recommended_action: String::new(),
            estimated_impact: String::new(),
            data: json!({}),
            trace_id: String::new(),
            created_at: now,
        }
    }

    fn story_response() -> String {
        r#"{"overall_summary": "Hi Sam, books look good.", "timeline_bullets": []}"#.to_string()
    }

    #[tokio::test]
    async fn unchanged_inputs_do_not_call_the_advisor_twice() {
        let store = InMemoryStoryStore::new();
        let client = StaticAdvisorClient::always(story_response());
        let now = Utc::now();
        let radar = build_radar(&[], now);

        let first = regenerate_story(
            &store,
            &client,
            "tenant-1",
            "Sam",
            &radar,
            &[],
            STORY_DEBOUNCE,
            STORY_DEBOUNCE,
            now,
        )
        .await
        .expect("story");
        let second = regenerate_story(
            &store,
            &client,
            "tenant-1",
            "Sam",
            &radar,
            &[],
            STORY_DEBOUNCE,
            STORY_DEBOUNCE,
            now + chrono::Duration::seconds(10),
        )
        .await
        .expect("story");

        assert_eq!(client.calls(), 1);
        assert_eq!(first.data_fingerprint, second.data_fingerprint);
    }

    #[tokio::test]
    async fn changed_inputs_regenerate_after_debounce() {
        let store = InMemoryStoryStore::new();
        let client = StaticAdvisorClient::always(story_response());
        let now = Utc::now();
        let radar = build_radar(&[], now);

        regenerate_story(
            &store, &client, "tenant-1", "Sam", &radar, &[], STORY_DEBOUNCE, STORY_DEBOUNCE, now,
        )
        .await
        .expect("story");

        let later = now + chrono::Duration::seconds(301);
        let issues = vec![issue("New problem", IssueSeverity::High, later)];
        let radar_with_issue = build_radar(&issues, later);
        let updated = regenerate_story(
            &store,
            &client,
            "tenant-1",
            "Sam",
            &radar_with_issue,
            &issues,
            STORY_DEBOUNCE,
            STORY_DEBOUNCE,
            later,
        )
        .await
        .expect("story");

        assert_eq!(client.calls(), 2);
        assert_ne!(
            updated.data_fingerprint,
            compute_fingerprint(&radar, &[])
        );
    }

    #[tokio::test]
    async fn debounce_holds_even_when_fingerprint_changes() {
        let store = InMemoryStoryStore::new();
        let client = StaticAdvisorClient::always(story_response());
        let now = Utc::now();
        let radar = build_radar(&[], now);

        regenerate_story(
            &store, &client, "tenant-1", "Sam", &radar, &[], STORY_DEBOUNCE, STORY_DEBOUNCE, now,
        )
        .await
        .expect("story");

        let soon = now + chrono::Duration::seconds(30);
        let issues = vec![issue("New problem", IssueSeverity::High, soon)];
        let radar_with_issue = build_radar(&issues, soon);
        regenerate_story(
            &store,
            &client,
            "tenant-1",
            "Sam",
            &radar_with_issue,
            &issues,
            STORY_DEBOUNCE,
            STORY_DEBOUNCE,
            soon,
        )
        .await
        .expect("story");

        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn advisor_failure_stores_the_fallback_and_retries_later() {
        let store = InMemoryStoryStore::new();
        let failing = StaticAdvisorClient::queue(Vec::new());
        let now = Utc::now();
        let radar = build_radar(&[], now);

        let stored = regenerate_story(
            &store, &failing, "tenant-1", "Sam", &radar, &[], STORY_DEBOUNCE, STORY_DEBOUNCE, now,
        )
        .await
        .expect("story");
        assert!(stored.is_fallback());

        // A fallback story is regenerated as soon as the advisor recovers,
        // debounce and fingerprint notwithstanding.
        let healthy = StaticAdvisorClient::always(story_response());
        let recovered = regenerate_story(
            &store,
            &healthy,
            "tenant-1",
            "Sam",
            &radar,
            &[],
            STORY_DEBOUNCE,
            STORY_DEBOUNCE,
            now + chrono::Duration::seconds(5),
        )
        .await
        .expect("story");
        assert!(!recovered.is_fallback());
        assert_eq!(healthy.calls(), 1);
    }

    #[test]
    fn read_path_returns_fallback_and_marks_dirty() {
        let store = InMemoryStoryStore::new();
        let story = cached_story(&store, "tenant-1", Utc::now()).expect("story");
        assert_eq!(story, fallback_story());
        assert_eq!(
            store.dirty_tenants().expect("dirty"),
            vec!["tenant-1".to_string()]
        );

        store.clear_dirty("tenant-1").expect("clear");
        assert!(store.dirty_tenants().expect("dirty").is_empty());
    }
}
