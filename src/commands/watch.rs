use std::time::{Duration, Instant};

use poise::CreateReply;
use tracing::{info, warn};

use survey_watch::job::Job;
use survey_watch::watch::{ProgressWatcher, WatchEvent, WatchPhase, WatchSnapshot};

use crate::commands::{split_chunks, CHUNK_LIMIT};
use crate::state::Context;

const BAR_WIDTH: usize = 20;

/// Discord interaction tokens (and so follow-up messages) expire after 15 minutes.
const INTERACTION_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
/// Headroom for the time it takes to post a multi-chunk survey.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

/// Follow a survey until it is generated, then post it with its sources
#[poise::command(slash_command, guild_only)]
pub async fn watch(
    ctx: Context<'_>,
    #[description = "Survey id returned when the survey was submitted"] survey_id: String,
) -> Result<(), anyhow::Error> {
    let started = Instant::now();
    let config = ctx.data().watch_config.read().await.clone();
    let watcher = ProgressWatcher::new(ctx.data().api.clone(), config);

    let mut handle = match watcher.start(&survey_id) {
        Ok(handle) => handle,
        Err(e) => {
            ctx.say(format!("{}\n{}", e, progress_line("-", &WatchSnapshot::idle())))
                .await?;
            return Ok(());
        }
    };
    let job_id = handle.job_id().to_string();

    info!(user = %ctx.author().name, job_id = %job_id, "Watch requested");

    // Only track the watch once there is a message to report into
    let reply = ctx.say(progress_line(&job_id, &handle.snapshot())).await?;
    let stopper = handle.stopper();
    ctx.data().watches.insert(&job_id, stopper.clone()).await;
    let mut snapshots = handle.subscribe();

    let event = loop {
        tokio::select! {
            event = handle.next_event() => break event,
            Ok(()) = snapshots.changed() => {
                let snapshot = snapshots.borrow_and_update().clone();
                let edit = CreateReply::default().content(progress_line(&job_id, &snapshot));
                // Interaction tokens expire; keep watching even if edits start failing
                if let Err(e) = reply.edit(ctx, edit).await {
                    warn!(job_id = %job_id, error = %e, "Failed to update progress message");
                }
            }
        }
    };

    ctx.data().watches.release(&job_id, &stopper).await;
    let final_line = progress_line(&job_id, &handle.snapshot());
    if let Err(e) = reply.edit(ctx, CreateReply::default().content(final_line)).await {
        warn!(job_id = %job_id, error = %e, "Failed to update progress message");
    }

    let text = match event {
        Some(WatchEvent::Completed(job)) => {
            info!(job_id = %job_id, "Posting completed survey");
            render_survey(&job)
        }
        Some(WatchEvent::Failed { message }) => {
            format!("Survey `{}` failed: {}", job_id, message)
        }
        Some(WatchEvent::Cancelled { message }) => {
            format!("Survey `{}` was cancelled: {}", job_id, message)
        }
        Some(WatchEvent::Errored(e)) => format!(
            "Stopped watching `{}` after a failed status check: {}",
            job_id, e
        ),
        None => format!("Stopped watching `{}`.", job_id),
    };

    post_result(ctx, started, &text).await
}

/// How a message reaches the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Interaction follow-up, valid while the token is.
    FollowUp,
    /// Plain channel message.
    Channel,
}

fn delivery_for(elapsed: Duration) -> Delivery {
    if elapsed + TOKEN_MARGIN < INTERACTION_TOKEN_TTL {
        Delivery::FollowUp
    } else {
        Delivery::Channel
    }
}

/// Post a terminal message in chunks. Falls back to the channel once the
/// interaction token is (or turns out to be) expired.
async fn post_result(ctx: Context<'_>, started: Instant, text: &str) -> Result<(), anyhow::Error> {
    let mut delivery = delivery_for(started.elapsed());
    for chunk in split_chunks(text, CHUNK_LIMIT) {
        if delivery == Delivery::FollowUp {
            match ctx.say(chunk).await {
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Follow-up failed, posting to channel instead");
                    delivery = Delivery::Channel;
                }
            }
        }
        ctx.channel_id().say(ctx, chunk).await?;
    }
    Ok(())
}

/// One-line status for the progress message.
fn progress_line(job_id: &str, snapshot: &WatchSnapshot) -> String {
    let filled = snapshot.progress_percent as usize * BAR_WIDTH / 100;
    let bar = format!("{}{}", "▰".repeat(filled), "▱".repeat(BAR_WIDTH - filled));

    let state = match (snapshot.phase, snapshot.status) {
        (WatchPhase::Idle, _) => "not watching".to_string(),
        (WatchPhase::Errored, _) => "status unavailable".to_string(),
        (_, Some(status)) => status.to_string(),
        (_, None) => "waiting for first update".to_string(),
    };
    let spinner = if snapshot.is_loading { " ⏳" } else { "" };

    let mut line = format!(
        "**Survey** `{}` | {} {} {}%{}",
        job_id, state, bar, snapshot.progress_percent, spinner
    );
    if !snapshot.progress_message.is_empty() {
        line.push_str(&format!("\n> {}", snapshot.progress_message));
    }
    line
}

/// Completed survey with citations as `[N]` and a numbered source list.
fn render_survey(job: &Job) -> String {
    let Some(doc) = job.processed_document() else {
        return format!("Survey `{}` finished without a document.", job.job_id);
    };

    let mut out = match &job.title {
        Some(title) => format!("# {}\n\n", title),
        None => String::new(),
    };
    out.push_str(doc.display_document.trim());

    let references = doc.references();
    if !references.is_empty() {
        out.push_str("\n\n**Sources:**\n");
        for (number, label) in references {
            out.push_str(&format!("[{}] {}\n", number, label));
        }
    }
    out
}
