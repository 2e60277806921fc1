mod config;
mod download;
mod history;
mod manage;
mod watch;

use crate::state::Context;

/// Discord messages are capped at 2000 chars; leave room for formatting.
pub(crate) const CHUNK_LIMIT: usize = 1990;

/// Watch and fetch literature surveys
#[poise::command(
    slash_command,
    subcommands(
        "watch::watch",
        "manage::stop",
        "manage::cancel",
        "manage::delete",
        "manage::active",
        "download::download",
        "history::history",
        "config::config"
    )
)]
pub async fn survey(_ctx: Context<'_>) -> Result<(), anyhow::Error> {
    Ok(())
}

/// Send a message in Discord-safe chunks.
/// Uses ctx.say() for all chunks; poise routes follow-ups through the
/// interaction webhook, which doesn't require Send Messages channel permission.
pub(crate) async fn send_chunked(ctx: &Context<'_>, text: &str) -> Result<(), anyhow::Error> {
    for chunk in split_chunks(text, CHUNK_LIMIT) {
        ctx.say(chunk).await?;
    }
    Ok(())
}

/// Split on the last newline (or space) before `limit` bytes.
pub(crate) fn split_chunks(text: &str, limit: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let mut chunk_len = remaining.len().min(limit);
        while !remaining.is_char_boundary(chunk_len) {
            chunk_len -= 1;
        }
        let split_at = if chunk_len < remaining.len() {
            remaining[..chunk_len]
                .rfind('\n')
                .or_else(|| remaining[..chunk_len].rfind(' '))
                .map(|i| i + 1)
                .unwrap_or(chunk_len)
        } else {
            chunk_len
        };
        chunks.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }
    chunks
}
