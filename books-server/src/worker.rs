use std::sync::Arc;

use books_companion::IssueStatus;
use books_companion::build_radar;
use books_companion::rank_issues_for_summary;
use books_companion::regenerate_story;
use chrono::Duration;
use chrono::Utc;

use crate::AppState;

/// Periodic background loop that drains dirty story states. Story
/// generation never runs on a read path; this worker is the only caller.
pub async fn run_story_worker(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(state.config.story_worker_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match drain_dirty_stories(&state).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "regenerated companion stories"),
            Err(err) => tracing::error!(error = %err, "story worker pass failed"),
        }
    }
}

/// One worker pass: regenerate the story for every tenant whose inputs
/// changed since the last pass. Returns the number of stories refreshed.
pub async fn drain_dirty_stories(state: &AppState) -> anyhow::Result<usize> {
    let now = Utc::now();
    let since = now - Duration::days(books_companion::ISSUE_WINDOW_DAYS);
    let mut refreshed = 0_usize;

    for tenant_id in state.stories.dirty_tenants()? {
        let tenant = match state.store.tenant(&tenant_id) {
            Ok(tenant) => tenant,
            Err(err) => {
                tracing::warn!(tenant = %tenant_id, error = %err, "dropping dirty story for unknown tenant");
                state.stories.clear_dirty(&tenant_id)?;
                continue;
            }
        };

        let open_issues =
            state
                .issues
                .list_issues(&tenant_id, Some(IssueStatus::Open), Some(since))?;
        let ranked = rank_issues_for_summary(open_issues);
        let radar = build_radar(&ranked, now);

        regenerate_story(
            state.stories.as_ref(),
            state.advisor.as_ref(),
            &tenant_id,
            &tenant.name,
            &radar,
            &ranked,
            state.config.story_timeout,
            state.config.story_debounce,
            now,
        )
        .await?;
        state.stories.clear_dirty(&tenant_id)?;
        refreshed += 1;
    }
    Ok(refreshed)
}
