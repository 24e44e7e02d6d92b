//! The story pipeline: queued → analyzing_narrative → storyboarding →
//! illustrating → completed, with `failed` absorbing from any stage. Stages
//! 1–2 run sequentially on the coordinating task; illustration fans out to a
//! bounded pool and joins fully before pages are written.
use crate::blob::BlobStore;
use crate::db::{self, Pool};
use crate::gateway::{ChatMessage, ModelGateway};
use crate::illustrator::{self, IllustrationContext};
use crate::model::{CreationMetadata, NarrativeAnalysis, StoryStatus, StoryboardPage};
use crate::prompts;
use anyhow::{ensure, Context, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Worker-pool width for the illustration stage; balances throughput
/// against upstream rate limits.
pub const ILLUSTRATION_CONCURRENCY: usize = 2;

/// Everything a story run needs; constructed once at process start and
/// injected (no global client).
#[derive(Clone)]
pub struct PipelineDeps {
    pub pool: Pool,
    pub gateway: Arc<dyn ModelGateway>,
    pub blob: Arc<dyn BlobStore>,
    pub image_retries: u32,
}

/// Audio intake payload, held for stage 1 only.
pub struct AudioInput {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Drive one story run to a terminal state. Never returns an error: any
/// stage failure is recorded on the story itself.
pub async fn run(
    deps: PipelineDeps,
    story_id: String,
    metadata: CreationMetadata,
    audio: Option<AudioInput>,
) {
    if let Err(err) = run_stages(&deps, &story_id, &metadata, audio).await {
        error!(%story_id, ?err, "story pipeline failed");
        let _ = db::append_status(
            &deps.pool,
            &story_id,
            StoryStatus::Failed,
            0,
            &format!("Error: {err:#}"),
        )
        .await;
    }
}

#[instrument(skip_all, fields(story_id = %story_id))]
async fn run_stages(
    deps: &PipelineDeps,
    story_id: &str,
    metadata: &CreationMetadata,
    audio: Option<AudioInput>,
) -> Result<()> {
    let pool = &deps.pool;
    let gateway = deps.gateway.as_ref();

    // Stage 1: narrative analysis.
    db::append_status(
        pool,
        story_id,
        StoryStatus::AnalyzingNarrative,
        10,
        "Listening to the story and extracting themes...",
    )
    .await?;
    let analysis = analyze(gateway, metadata, audio).await?;
    db::store_analysis(pool, story_id, &analysis).await?;
    info!(title = %analysis.title, "narrative analysis complete");

    // Stage 2: storyboard decomposition.
    db::append_status(
        pool,
        story_id,
        StoryStatus::Storyboarding,
        30,
        "Splitting story into pages...",
    )
    .await?;
    let page_count = metadata.maturity.page_count();
    let raw = gateway
        .generate_text(
            &[ChatMessage::user(prompts::storyboard(page_count, &analysis))],
            0.7,
        )
        .await
        .context("storyboard generation failed")?;
    let storyboard: Vec<StoryboardPage> =
        serde_json::from_str(&prompts::strip_code_fences(&raw))
            .context("storyboard output was not valid JSON")?;
    ensure!(
        storyboard.len() == page_count,
        "storyboard returned {} pages, expected {}",
        storyboard.len(),
        page_count
    );

    // Stage 3: parallel illustration, fan-out then full join.
    db::append_status(
        pool,
        story_id,
        StoryStatus::Illustrating,
        30,
        "Starting parallel image generation...",
    )
    .await?;
    let total = storyboard.len();

    let mut pages = Vec::with_capacity(total);
    {
        let mut results = stream::iter(storyboard.clone())
            .map(|spec| {
                let gateway = deps.gateway.clone();
                let blob = deps.blob.clone();
                let pool = pool.clone();
                let story_id = story_id.to_string();
                let maturity = metadata.maturity;
                let image_retries = deps.image_retries;
                // Each worker runs on its own task so it keeps making
                // progress (including its own status writes) while the
                // coordinator is awaiting a status write of its own.
                async move {
                    tokio::spawn(async move {
                        let ctx = IllustrationContext {
                            story_id: &story_id,
                            maturity,
                            image_retries,
                        };
                        illustrator::illustrate_page(
                            gateway.as_ref(),
                            blob.as_ref(),
                            &pool,
                            &ctx,
                            &spec,
                        )
                        .await
                    })
                    .await
                }
            })
            .buffer_unordered(ILLUSTRATION_CONCURRENCY);

        // Arrival order, not page order.
        let mut completed = 0usize;
        while let Some(joined) = results.next().await {
            let page = joined.context("illustration worker panicked")?;
            pages.push(page);
            completed += 1;
            let progress = 30 + (60 * completed / total) as i64;
            db::append_status(
                pool,
                story_id,
                StoryStatus::Illustrating,
                progress,
                &format!("Finished page {completed} of {total}..."),
            )
            .await?;
        }
    }

    // Mandatory re-sort: simple pages finish first.
    pages.sort_by_key(|p| p.page_number);
    db::store_pages(pool, story_id, &pages, &serde_json::to_value(&storyboard)?).await?;
    db::append_status(pool, story_id, StoryStatus::Completed, 100, "Story ready!").await?;
    Ok(())
}

/// Stage 1 body: transcribe first when audio is present, then request the
/// analysis grounded in the transcript or the prompt text.
async fn analyze(
    gateway: &dyn ModelGateway,
    metadata: &CreationMetadata,
    audio: Option<AudioInput>,
) -> Result<NarrativeAnalysis> {
    let raw = if let Some(audio) = audio {
        let transcript = gateway
            .transcribe_audio(&audio.bytes, &audio.mime_type, "Transcribe the audio exactly.")
            .await
            .context("audio transcription failed")?;
        let system = prompts::narrative_analysis(metadata.maturity, &metadata.theme, true);
        gateway
            .generate_text(
                &[ChatMessage::user(format!(
                    "{system}\n\nHere is the transcript:\n{transcript}"
                ))],
                0.4,
            )
            .await
            .context("narrative analysis generation failed")?
    } else {
        let system = prompts::narrative_analysis(metadata.maturity, &metadata.theme, false);
        let concept = metadata.prompt_text.as_deref().unwrap_or_default();
        gateway
            .generate_text(
                &[ChatMessage::user(format!("{system}\n\nStory Concept: {concept}"))],
                0.4,
            )
            .await
            .context("narrative analysis generation failed")?
    };

    serde_json::from_str(&prompts::strip_code_fences(&raw))
        .context("narrative analysis output was not valid JSON")
}
