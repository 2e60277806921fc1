use std::time::Duration;

use tracing::info;

use crate::state::Context;

/// Configure survey polling (admin only)
#[poise::command(slash_command, guild_only)]
pub async fn config(
    ctx: Context<'_>,
    #[description = "poll_interval_ms | retry_limit"] param: Option<String>,
    #[description = "New value"] value: Option<u32>,
) -> Result<(), anyhow::Error> {
    let user_id = ctx.author().id.get();
    if !ctx.data().is_admin(user_id) {
        ctx.say("This command is admin-only.").await?;
        return Ok(());
    }

    match (param.as_deref(), value) {
        // Show current config
        (None, _) => {
            let config = ctx.data().watch_config.read().await;
            ctx.say(format!(
                "**Watch Configuration:**\n\
                 `poll_interval_ms`: {}\n\
                 `retry_limit`: {}\n\
                 Backend: {}",
                config.poll_interval.as_millis(),
                config.retry_limit,
                ctx.data().api.base_url()
            ))
            .await?;
        }
        // Set a parameter
        (Some(key), Some(val)) => {
            let mut config = ctx.data().watch_config.write().await;
            match key {
                "poll_interval_ms" if val == 0 => {
                    ctx.say("`poll_interval_ms` must be greater than 0.").await?;
                }
                "poll_interval_ms" => {
                    config.poll_interval = Duration::from_millis(val as u64);
                    info!(user_id, poll_interval_ms = val, "Watch config changed");
                    ctx.say(format!("`poll_interval_ms` set to {}", val)).await?;
                }
                "retry_limit" => {
                    config.retry_limit = val;
                    info!(user_id, retry_limit = val, "Watch config changed");
                    ctx.say(format!("`retry_limit` set to {}", val)).await?;
                }
                _ => {
                    ctx.say(format!(
                        "Unknown param `{}`. Valid: `poll_interval_ms`, `retry_limit`",
                        key
                    ))
                    .await?;
                }
            }
        }
        (Some(_), None) => {
            ctx.say("Provide both `param` and `value`. Example: `/survey config poll_interval_ms 5000`")
                .await?;
        }
    }

    Ok(())
}
