use poise::serenity_prelude as serenity;
use poise::CreateReply;
use tracing::info;

use survey_watch::job::JobStatus;

use crate::state::Context;

const DEFAULT_FORMAT: &str = "docx";

/// Download the generated survey document
#[poise::command(slash_command, guild_only)]
pub async fn download(
    ctx: Context<'_>,
    #[description = "Survey id"] survey_id: String,
    #[description = "Document format (default: docx)"] format: Option<String>,
) -> Result<(), anyhow::Error> {
    ctx.defer().await?;

    let survey_id = survey_id.trim();
    let api = &ctx.data().api;

    // Documents only exist for completed surveys
    let report = match api.progress(survey_id).await {
        Ok(report) => report,
        Err(e) => {
            ctx.say(format!("Could not check `{}`: {}", survey_id, e))
                .await?;
            return Ok(());
        }
    };
    if report.status != JobStatus::Completed {
        ctx.say(format!(
            "Survey `{}` is {} ({}%), nothing to download yet.",
            survey_id,
            report.status,
            (report.progress * 100.0).round()
        ))
        .await?;
        return Ok(());
    }

    let format = format
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| DEFAULT_FORMAT.to_string());

    match api.download(survey_id, &format).await {
        Ok(file) => {
            info!(survey_id, filename = %file.filename, size = file.bytes.len(), "Sending survey document");
            let caption = format!("**{}**", file.filename);
            let attachment = serenity::CreateAttachment::bytes(file.bytes, file.filename);
            ctx.send(CreateReply::default().content(caption).attachment(attachment))
                .await?;
        }
        Err(e) => {
            ctx.say(format!("Download failed for `{}`: {}", survey_id, e))
                .await?;
        }
    }

    Ok(())
}
