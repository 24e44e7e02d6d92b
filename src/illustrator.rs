//! Per-page illustration worker: generate an image for one storyboard entry,
//! retrying past safety blocks with advisor rewrites, degrading to a
//! placeholder when the attempt budget runs out. A page never fails the
//! story; any internal error becomes a failure-flagged page.
use crate::advisor;
use crate::blob::BlobStore;
use crate::db::{self, Pool, KEEP_PROGRESS};
use crate::gateway::ModelGateway;
use crate::model::{MaturityTier, Page, StoryStatus, StoryboardPage};
use anyhow::Result;
use tracing::{info, instrument, warn};

/// Total attempt ceiling per page, counting the original prompt.
pub const MAX_ATTEMPTS: u32 = 4;

/// Served when every attempt was safety-blocked.
pub const PLACEHOLDER_IMAGE_URL: &str =
    "https://placehold.co/1024x1024/EEE/31343C.png?text=Illustration+Unavailable&font=lora";

/// Served when the worker itself failed (upload error, transport error).
pub const ERROR_IMAGE_URL: &str = "https://placehold.co/512x512/EEE/31343C.png?text=Error";

pub struct IllustrationContext<'a> {
    pub story_id: &'a str,
    pub maturity: MaturityTier,
    /// Transient-retry budget handed down to the gateway per generation call.
    pub image_retries: u32,
}

/// Reading-duration estimate in seconds, floored at 4 so a page never
/// flashes past. Deliberately simple: words over tier reading pace.
pub fn estimate_reading_secs(text: &str, tier: MaturityTier) -> i64 {
    let words = text.split_whitespace().count() as u64;
    let wpm = tier.words_per_minute() as u64;
    let seconds = (words * 60).div_ceil(wpm) as i64;
    seconds.max(4)
}

/// Illustrate one page. Infallible at the signature: every failure mode is
/// folded into the returned [`Page`].
#[instrument(skip_all, fields(story_id = %ctx.story_id, page = spec.page_number))]
pub async fn illustrate_page(
    gateway: &dyn ModelGateway,
    blob: &dyn BlobStore,
    pool: &Pool,
    ctx: &IllustrationContext<'_>,
    spec: &StoryboardPage,
) -> Page {
    let mut current_prompt = spec.image_prompt_description.clone();
    match run_attempts(gateway, blob, pool, ctx, spec, &mut current_prompt).await {
        Ok(image_url) => {
            let success = image_url.is_some();
            if !success {
                warn!("using fallback image after exhausting attempts");
            }
            Page {
                page_number: spec.page_number,
                text_content: spec.text_content.clone(),
                image_url: image_url.unwrap_or_else(|| PLACEHOLDER_IMAGE_URL.to_string()),
                image_prompt: current_prompt,
                duration: estimate_reading_secs(&spec.text_content, ctx.maturity),
                audio_url: None,
                success,
            }
        }
        Err(err) => {
            // A single page's failure must never abort sibling workers.
            warn!(?err, "page worker failed; emitting error placeholder");
            Page {
                page_number: spec.page_number,
                text_content: spec.text_content.clone(),
                image_url: ERROR_IMAGE_URL.to_string(),
                image_prompt: current_prompt,
                duration: estimate_reading_secs(&spec.text_content, ctx.maturity),
                audio_url: None,
                success: false,
            }
        }
    }
}

/// The bounded retry loop. Returns the uploaded image URL, or `None` when
/// every attempt was safety-blocked. `current_prompt` is left holding the
/// prompt in play when the loop ended.
async fn run_attempts(
    gateway: &dyn ModelGateway,
    blob: &dyn BlobStore,
    pool: &Pool,
    ctx: &IllustrationContext<'_>,
    spec: &StoryboardPage,
    current_prompt: &mut String,
) -> Result<Option<String>> {
    let mut failed_prompts: Vec<String> = Vec::new();
    let mut attempt = 0u32;

    while attempt < MAX_ATTEMPTS {
        info!(attempt = attempt + 1, max = MAX_ATTEMPTS, "generating illustration");

        match gateway.generate_image(current_prompt, ctx.image_retries).await? {
            Some(bytes) => {
                let url = blob.put(&bytes, "image/png").await?;
                if attempt > 0 {
                    // Best-effort notice; the progress bar must not move.
                    let _ = db::append_status(
                        pool,
                        ctx.story_id,
                        StoryStatus::Illustrating,
                        KEEP_PROGRESS,
                        &format!("Fixed page {} after {} retries.", spec.page_number, attempt),
                    )
                    .await;
                }
                return Ok(Some(url));
            }
            None => {
                warn!(attempt = attempt + 1, "illustration blocked by safety filter");
                failed_prompts.push(current_prompt.clone());
                attempt += 1;

                if attempt < MAX_ATTEMPTS {
                    let _ = db::append_status(
                        pool,
                        ctx.story_id,
                        StoryStatus::Illustrating,
                        KEEP_PROGRESS,
                        &format!(
                            "Safety block on page {}. Rewriting prompt (try {}/{})...",
                            spec.page_number, attempt, MAX_ATTEMPTS
                        ),
                    )
                    .await;

                    *current_prompt = advisor::rewrite_prompt(
                        gateway,
                        &spec.image_prompt_description,
                        &failed_prompts,
                    )
                    .await;
                }
            }
        }
    }

    Ok(None)
}
