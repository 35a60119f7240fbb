use anyhow::Result;

use crate::conversation::{Part, DEFAULT_CONVERSATION_TITLE};
use crate::llm_client::{GenerationService, SingleShotOptions};

pub const DEFAULT_TITLE_MAX_CHARS: usize = 30;

pub fn title_prompt(user_message: &str, max_chars: usize) -> String {
    format!(
        "Summarize the following user message as a conversation title. Reply with one short sentence of at most {} characters and nothing else.\n\n{}",
        max_chars, user_message
    )
}

/// Cleans a model-proposed title; `None` if nothing usable is left.
pub fn sanitize_title(raw: &str, max_chars: usize) -> Option<String> {
    let stripped = raw.trim().replace(['"', '\u{201c}', '\u{201d}'], "");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed.chars().count() > max_chars {
        return None;
    }
    Some(collapsed)
}

/// Appends ` (1)`, ` (2)`, … until `title` no longer collides.
pub fn unique_title<'a>(title: &str, existing: impl IntoIterator<Item = &'a str> + Clone) -> String {
    let taken = |candidate: &str| existing.clone().into_iter().any(|t| t == candidate);
    if !taken(title) {
        return title.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{} ({})", title, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Asks the model for a title. Any failure, or an unusable reply, falls back
/// to the default title.
pub async fn summarize_title(
    service: &dyn GenerationService,
    model: &str,
    user_message: &str,
    max_chars: usize,
) -> String {
    match request_title(service, model, user_message, max_chars).await {
        Ok(Some(title)) => title,
        Ok(None) => {
            tracing::debug!("Title suggestion unusable, keeping default");
            DEFAULT_CONVERSATION_TITLE.to_string()
        }
        Err(e) => {
            tracing::warn!("Title summarization failed: {:#}", e);
            DEFAULT_CONVERSATION_TITLE.to_string()
        }
    }
}

async fn request_title(
    service: &dyn GenerationService,
    model: &str,
    user_message: &str,
    max_chars: usize,
) -> Result<Option<String>> {
    let reply = service
        .single_shot(
            model,
            vec![Part::text(title_prompt(user_message, max_chars))],
            &SingleShotOptions::default(),
        )
        .await?;
    Ok(sanitize_title(&reply, max_chars))
}
