//! Safety rewrite advisor: turns a blocked image prompt into a PG-safe
//! restatement, biased away from every phrasing that already failed.
use crate::gateway::{ChatMessage, ModelGateway};
use crate::prompts;
use tracing::{instrument, warn};

/// Ask the text model for a rewritten prompt. The failure history is always
/// an explicitly passed, caller-owned slice; attempt N carries exactly the
/// N-1 prompts that were already rejected.
#[instrument(skip_all, fields(failures = previous_failures.len()))]
pub async fn rewrite_prompt(
    gateway: &dyn ModelGateway,
    original: &str,
    previous_failures: &[String],
) -> String {
    let instruction = prompts::safety_rewrite(previous_failures);
    let messages = [
        ChatMessage::user(instruction),
        ChatMessage::user(format!("Original Prompt: {original}")),
    ];
    // Low temperature for strict adherence to the rewrite rules.
    match gateway.generate_text(&messages, 0.3).await {
        Ok(rewritten) => rewritten.trim().replace("Prompt:", "").trim().to_string(),
        Err(err) => {
            warn!(?err, "advisor rewrite failed; using deterministic fallback");
            scrub_prompt(original)
        }
    }
}

/// Deterministic fallback when the advisor itself fails: scrub the most
/// common filter triggers instead of aborting the page.
pub fn scrub_prompt(prompt: &str) -> String {
    prompt.replace("year-old", "young").replace("child", "character")
}
