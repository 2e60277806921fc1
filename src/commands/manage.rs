use tracing::info;

use crate::state::Context;

/// Stop following a survey (the survey itself keeps running)
#[poise::command(slash_command, guild_only)]
pub async fn stop(
    ctx: Context<'_>,
    #[description = "Survey id"] survey_id: String,
) -> Result<(), anyhow::Error> {
    let survey_id = survey_id.trim();
    if ctx.data().watches.stop(survey_id).await {
        info!(user = %ctx.author().name, survey_id, "Watch stopped by user");
        ctx.say(format!("Stopping watch on `{}`.", survey_id)).await?;
    } else {
        ctx.say(format!("No active watch on `{}`.", survey_id))
            .await?;
    }
    Ok(())
}

/// Cancel a pending or running survey on the backend
#[poise::command(slash_command, guild_only)]
pub async fn cancel(
    ctx: Context<'_>,
    #[description = "Survey id"] survey_id: String,
) -> Result<(), anyhow::Error> {
    let survey_id = survey_id.trim();
    match ctx.data().api.cancel(survey_id).await {
        Ok(message) => {
            info!(user = %ctx.author().name, survey_id, "Survey cancelled");
            ctx.say(format!("Survey `{}`: {}", survey_id, message))
                .await?;
        }
        Err(e) => {
            ctx.say(format!("Could not cancel `{}`: {}", survey_id, e))
                .await?;
        }
    }
    Ok(())
}

/// Delete a survey from the backend history
#[poise::command(slash_command, guild_only)]
pub async fn delete(
    ctx: Context<'_>,
    #[description = "Survey id"] survey_id: String,
) -> Result<(), anyhow::Error> {
    let survey_id = survey_id.trim();
    if survey_id.is_empty() {
        ctx.say("A survey id is required.").await?;
        return Ok(());
    }

    match ctx.data().api.delete_record(survey_id).await {
        Ok(()) => {
            let stopped = ctx.data().watches.stop(survey_id).await;
            info!(user = %ctx.author().name, survey_id, stopped, "Survey record deleted");
            ctx.say(format!("Deleted survey `{}`.", survey_id)).await?;
        }
        Err(e) => {
            ctx.say(format!("Could not delete `{}`: {}", survey_id, e))
                .await?;
        }
    }
    Ok(())
}

/// List surveys currently being watched
#[poise::command(slash_command, guild_only)]
pub async fn active(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let ids = ctx.data().watches.active().await;
    if ids.is_empty() {
        ctx.say("No surveys are being watched.").await?;
        return Ok(());
    }

    let mut output = String::from("**Watching:**\n");
    for id in ids {
        output.push_str(&format!("- `{}`\n", id));
    }
    ctx.say(output).await?;
    Ok(())
}
