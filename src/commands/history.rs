use survey_watch::api::SurveyHistory;

use crate::commands::send_chunked;
use crate::state::Context;

const PAGE_SIZE: u32 = 10;

/// List previously generated surveys
#[poise::command(slash_command, guild_only)]
pub async fn history(
    ctx: Context<'_>,
    #[description = "Page number (default: 1)"] page: Option<u32>,
    #[description = "Filter by title"] keyword: Option<String>,
) -> Result<(), anyhow::Error> {
    ctx.defer().await?;

    let page = page.unwrap_or(1).max(1);
    let keyword = keyword.as_deref().map(str::trim).filter(|k| !k.is_empty());

    match ctx
        .data()
        .api
        .survey_history(page, PAGE_SIZE, keyword)
        .await
    {
        Ok(history) => send_chunked(&ctx, &format_history(&history, page)).await,
        Err(e) => {
            ctx.say(format!("Could not load survey history: {}", e))
                .await?;
            Ok(())
        }
    }
}

fn format_history(history: &SurveyHistory, page: u32) -> String {
    if history.records.is_empty() {
        return "No surveys found.".to_string();
    }

    let pages = history.total.div_ceil(PAGE_SIZE as u64).max(1);
    let mut output = format!(
        "**Surveys** (page {}/{}, {} total)\n\n",
        page, pages, history.total
    );
    for record in &history.records {
        let title = record.survey_title.as_deref().unwrap_or("Untitled survey");
        let created = record
            .created()
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "unknown date".to_string());
        output.push_str(&format!(
            "- **{}** | {} | {}\n  `{}`\n",
            title, record.status, created, record.id
        ));
    }
    output
}
