use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use storyloom::api::{self, AppState};
use storyloom::blob::BlobStore;
use storyloom::db;
use storyloom::gateway::{ChatMessage, GatewayError, ModelGateway};
use storyloom::illustrator::{ERROR_IMAGE_URL, PLACEHOLDER_IMAGE_URL};
use storyloom::model::{CreationMetadata, MaturityTier, StoryRecord, StoryStatus};
use storyloom::pipeline::{self, AudioInput, PipelineDeps};
use tokio::sync::Mutex;
use uuid::Uuid;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// File-backed pool through the production constructor, for scenarios where
/// worker and coordinator status writes contend on real connections.
async fn setup_file_pool(dir: &tempfile::TempDir) -> sqlx::SqlitePool {
    let url = format!("sqlite://{}/stories.db?mode=rwc", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

fn analysis_json() -> String {
    serde_json::json!({
        "title": "Robo Finds a Friend",
        "plot_summary": "A tiny robot searches the forest for a friend.",
        "moral_lesson": "Friendship takes courage",
        "art_style": "whimsical watercolor",
        "character_desc": "a small curious robot",
        "visual_signature": "tiny blue robot with rusty antenna",
        "setting_signature": "magical glowing forest"
    })
    .to_string()
}

fn storyboard_json(prompts: &[&str]) -> String {
    let pages: Vec<_> = prompts
        .iter()
        .enumerate()
        .map(|(i, prompt)| {
            serde_json::json!({
                "page_number": i + 1,
                "text_content": format!("Page {} of the story.", i + 1),
                "image_prompt_description": prompt,
            })
        })
        .collect();
    serde_json::to_string(&pages).unwrap()
}

fn five_prompts() -> Vec<String> {
    (1..=5).map(|i| format!("scene for page {i}")).collect()
}

#[derive(Clone, Copy, PartialEq)]
enum ImageOutcome {
    Image,
    Blocked,
    Fail,
}

type ImageRule = Arc<dyn Fn(&str) -> ImageOutcome + Send + Sync>;

#[derive(Clone)]
struct ScriptedGateway {
    analysis_json: String,
    analysis_fails: bool,
    storyboard_json: String,
    rewrite_reply: String,
    transcript: String,
    image_rule: ImageRule,
    slow_marker: Option<String>,
    text_calls: Arc<Mutex<Vec<String>>>,
    rewrite_instructions: Arc<Mutex<Vec<String>>>,
    image_prompts: Arc<Mutex<Vec<String>>>,
    transcribe_calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedGateway {
    fn new(storyboard: String) -> Self {
        Self {
            analysis_json: analysis_json(),
            analysis_fails: false,
            storyboard_json: storyboard,
            rewrite_reply: "Digital art illustration, gentle storybook scene".to_string(),
            transcript: "Once there was a robot.".to_string(),
            image_rule: Arc::new(|_| ImageOutcome::Image),
            slow_marker: None,
            text_calls: Arc::default(),
            rewrite_instructions: Arc::default(),
            image_prompts: Arc::default(),
            transcribe_calls: Arc::default(),
        }
    }

    fn with_image_rule(mut self, rule: ImageRule) -> Self {
        self.image_rule = rule;
        self
    }

    fn with_failing_analysis(mut self) -> Self {
        self.analysis_fails = true;
        self
    }

    fn with_slow_prompt(mut self, marker: &str) -> Self {
        self.slow_marker = Some(marker.to_string());
        self
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn generate_text(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<String, GatewayError> {
        let content = messages
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        self.text_calls.lock().await.push(content.clone());

        if content.contains("Content Safety and Compliance") {
            self.rewrite_instructions
                .lock()
                .await
                .push(messages[0].content.clone());
            return Ok(self.rewrite_reply.clone());
        }
        if content.contains("Storyboard Artist") {
            return Ok(self.storyboard_json.clone());
        }
        if content.contains("Children's Book Editor") {
            if self.analysis_fails {
                return Err(GatewayError::Upstream {
                    status: 400,
                    detail: "bad request".to_string(),
                });
            }
            return Ok(self.analysis_json.clone());
        }
        Ok("{}".to_string())
    }

    async fn generate_image(
        &self,
        prompt: &str,
        _retries: u32,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        self.image_prompts.lock().await.push(prompt.to_string());
        if let Some(marker) = &self.slow_marker {
            if prompt.contains(marker.as_str()) {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        }
        match (self.image_rule)(prompt) {
            ImageOutcome::Image => Ok(Some(vec![0u8; 16])),
            ImageOutcome::Blocked => Ok(None),
            ImageOutcome::Fail => Err(GatewayError::Upstream {
                status: 400,
                detail: "invalid argument".to_string(),
            }),
        }
    }

    async fn transcribe_audio(
        &self,
        _audio: &[u8],
        mime_type: &str,
        _prompt: &str,
    ) -> Result<String, GatewayError> {
        self.transcribe_calls.lock().await.push(mime_type.to_string());
        Ok(self.transcript.clone())
    }
}

#[derive(Clone, Default)]
struct MemoryBlob {
    puts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BlobStore for MemoryBlob {
    async fn put(&self, _bytes: &[u8], content_type: &str) -> Result<String> {
        let mut puts = self.puts.lock().await;
        puts.push(content_type.to_string());
        Ok(format!("mem://blob-{}", puts.len()))
    }
}

fn deps(pool: sqlx::SqlitePool, gateway: ScriptedGateway) -> PipelineDeps {
    PipelineDeps {
        pool,
        gateway: Arc::new(gateway),
        blob: Arc::new(MemoryBlob::default()),
        image_retries: 1,
    }
}

async fn queue_story(pool: &sqlx::SqlitePool, maturity: MaturityTier) -> (String, CreationMetadata) {
    let metadata = CreationMetadata {
        prompt_text: Some("a robot looking for a friend".to_string()),
        theme: "Friendship".to_string(),
        maturity,
        audio_url: None,
    };
    let record = StoryRecord::new(Uuid::new_v4().to_string(), metadata.clone());
    db::insert_story(pool, &record).await.unwrap();
    (record.id, metadata)
}

fn assert_progress_non_decreasing(record: &StoryRecord) {
    let mut last = 0;
    for entry in &record.status_history {
        assert!(
            entry.progress >= last,
            "progress went backwards: {} after {} ({})",
            entry.progress,
            last,
            entry.message
        );
        last = entry.progress;
    }
}

#[tokio::test]
async fn completed_story_has_sorted_pages() {
    let pool = setup_pool().await;
    let prompts = five_prompts();
    let prompt_refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    // Page 1 is slow so completion order differs from page order.
    let gateway =
        ScriptedGateway::new(storyboard_json(&prompt_refs)).with_slow_prompt("scene for page 1");
    let (id, metadata) = queue_story(&pool, MaturityTier::Toddler).await;

    pipeline::run(deps(pool.clone(), gateway), id.clone(), metadata, None).await;

    let record = db::get_story(&pool, &id).await.unwrap().unwrap();
    assert_eq!(record.status, StoryStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.pages.len(), 5);
    for (i, page) in record.pages.iter().enumerate() {
        assert_eq!(page.page_number, i as i64 + 1);
        assert!(page.success);
        assert_eq!(page.image_prompt, format!("scene for page {}", i + 1));
        assert!(page.image_url.starts_with("mem://"));
        assert!(page.duration >= 4);
        assert!(page.audio_url.is_none());
    }
    assert_progress_non_decreasing(&record);
    let last = record.status_history.last().unwrap();
    assert_eq!(last.stage, "completed");
    assert_eq!(last.progress, 100);
}

#[tokio::test]
async fn run_completes_from_detached_task() {
    let pool = setup_pool().await;
    let prompts = five_prompts();
    let prompt_refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let gateway = ScriptedGateway::new(storyboard_json(&prompt_refs));
    let (id, metadata) = queue_story(&pool, MaturityTier::Toddler).await;

    // The run must be spawnable exactly as the request surface spawns it.
    let handle = tokio::spawn(pipeline::run(
        deps(pool.clone(), gateway),
        id.clone(),
        metadata,
        None,
    ));
    handle.await.unwrap();

    let record = db::get_story(&pool, &id).await.unwrap().unwrap();
    assert_eq!(record.status, StoryStatus::Completed);
    assert_eq!(record.pages.len(), 5);
}

#[tokio::test]
async fn malformed_storyboard_fails_run() {
    let pool = setup_pool().await;
    let gateway = ScriptedGateway::new("this is not json".to_string());
    let (id, metadata) = queue_story(&pool, MaturityTier::Toddler).await;

    pipeline::run(deps(pool.clone(), gateway), id.clone(), metadata, None).await;

    let record = db::get_story(&pool, &id).await.unwrap().unwrap();
    assert_eq!(record.status, StoryStatus::Failed);
    assert_eq!(record.progress, 0);
    assert!(record.pages.is_empty());
    let last = record.status_history.last().unwrap();
    assert_eq!(last.stage, "failed");
    assert!(last.message.contains("Error:"));
}

#[tokio::test]
async fn wrong_page_count_fails_run() {
    let pool = setup_pool().await;
    // Toddler tier expects 5 pages; return 3.
    let gateway = ScriptedGateway::new(storyboard_json(&["a", "b", "c"]));
    let (id, metadata) = queue_story(&pool, MaturityTier::Toddler).await;

    pipeline::run(deps(pool.clone(), gateway), id.clone(), metadata, None).await;

    let record = db::get_story(&pool, &id).await.unwrap().unwrap();
    assert_eq!(record.status, StoryStatus::Failed);
    assert!(record.pages.is_empty());
}

#[tokio::test]
async fn analysis_gateway_error_fails_run() {
    let pool = setup_pool().await;
    let prompts = five_prompts();
    let prompt_refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let gateway = ScriptedGateway::new(storyboard_json(&prompt_refs)).with_failing_analysis();
    let (id, metadata) = queue_story(&pool, MaturityTier::Toddler).await;

    pipeline::run(deps(pool.clone(), gateway), id.clone(), metadata, None).await;

    let record = db::get_story(&pool, &id).await.unwrap().unwrap();
    assert_eq!(record.status, StoryStatus::Failed);
    assert_eq!(record.progress, 0);
    assert!(record.title.is_none());
}

fn failure_count(instruction: &str) -> usize {
    if !instruction.contains("ALREADY FAILED") {
        return 0;
    }
    1 + instruction.matches("\n- ").count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_pages_fall_back_to_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let pool = setup_file_pool(&dir).await;
    let prompts = five_prompts();
    let prompt_refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let gateway = ScriptedGateway::new(storyboard_json(&prompt_refs))
        .with_image_rule(Arc::new(|_| ImageOutcome::Blocked));
    let rewrite_instructions = gateway.rewrite_instructions.clone();
    let (id, metadata) = queue_story(&pool, MaturityTier::Toddler).await;

    pipeline::run(deps(pool.clone(), gateway), id.clone(), metadata, None).await;

    let record = db::get_story(&pool, &id).await.unwrap().unwrap();
    // Degraded but complete: the story never drops a page.
    assert_eq!(record.status, StoryStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.pages.len(), 5);
    for page in &record.pages {
        assert!(!page.success);
        assert_eq!(page.image_url, PLACEHOLDER_IMAGE_URL);
    }
    assert_progress_non_decreasing(&record);

    // 4 attempts per page means 3 rewrites, with failure histories of
    // exactly 1, 2, and 3 prior prompts.
    let instructions = rewrite_instructions.lock().await;
    assert_eq!(instructions.len(), 15);
    for expected in 1..=3usize {
        let seen = instructions
            .iter()
            .filter(|i| failure_count(i) == expected)
            .count();
        assert_eq!(seen, 5, "expected 5 rewrites with {expected} prior failures");
    }
}

#[tokio::test]
async fn retry_then_success_records_fix_notice() {
    let pool = setup_pool().await;
    let gateway = ScriptedGateway::new(storyboard_json(&[
        "scene for page 1",
        "tricky scene for page 2",
        "scene for page 3",
        "scene for page 4",
        "scene for page 5",
    ]))
    .with_image_rule(Arc::new(|prompt| {
        if prompt.contains("tricky") {
            ImageOutcome::Blocked
        } else {
            ImageOutcome::Image
        }
    }));
    let rewrite_reply = gateway.rewrite_reply.clone();
    let (id, metadata) = queue_story(&pool, MaturityTier::Toddler).await;

    pipeline::run(deps(pool.clone(), gateway), id.clone(), metadata, None).await;

    let record = db::get_story(&pool, &id).await.unwrap().unwrap();
    assert_eq!(record.status, StoryStatus::Completed);
    let page2 = &record.pages[1];
    assert_eq!(page2.page_number, 2);
    assert!(page2.success);
    assert_eq!(page2.image_prompt, rewrite_reply);
    assert_eq!(record.pages[0].image_prompt, "scene for page 1");

    assert!(record
        .status_history
        .iter()
        .any(|e| e.message.contains("Safety block on page 2")));
    assert!(record
        .status_history
        .iter()
        .any(|e| e.message.contains("Fixed page 2 after 1 retries")));
    assert_progress_non_decreasing(&record);
}

#[tokio::test]
async fn worker_error_is_isolated() {
    let pool = setup_pool().await;
    let gateway = ScriptedGateway::new(storyboard_json(&[
        "scene for page 1",
        "scene for page 2",
        "cursed scene for page 3",
        "scene for page 4",
        "scene for page 5",
    ]))
    .with_image_rule(Arc::new(|prompt| {
        if prompt.contains("cursed") {
            ImageOutcome::Fail
        } else {
            ImageOutcome::Image
        }
    }));
    let (id, metadata) = queue_story(&pool, MaturityTier::Toddler).await;

    pipeline::run(deps(pool.clone(), gateway), id.clone(), metadata, None).await;

    let record = db::get_story(&pool, &id).await.unwrap().unwrap();
    assert_eq!(record.status, StoryStatus::Completed);
    assert_eq!(record.pages.len(), 5);
    let page3 = &record.pages[2];
    assert!(!page3.success);
    assert_eq!(page3.image_url, ERROR_IMAGE_URL);
    for page in record.pages.iter().filter(|p| p.page_number != 3) {
        assert!(page.success);
    }
}

#[tokio::test]
async fn audio_intake_transcribes_before_analysis() {
    let pool = setup_pool().await;
    let prompts = five_prompts();
    let prompt_refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let gateway = ScriptedGateway::new(storyboard_json(&prompt_refs));
    let transcribe_calls = gateway.transcribe_calls.clone();
    let text_calls = gateway.text_calls.clone();

    let metadata = CreationMetadata {
        prompt_text: Some("Audio Input".to_string()),
        theme: "Bedtime".to_string(),
        maturity: MaturityTier::Toddler,
        audio_url: Some("mem://blob-0".to_string()),
    };
    let record = StoryRecord::new(Uuid::new_v4().to_string(), metadata.clone());
    db::insert_story(&pool, &record).await.unwrap();

    let audio = AudioInput {
        bytes: vec![1, 2, 3],
        mime_type: "audio/webm".to_string(),
    };
    pipeline::run(
        deps(pool.clone(), gateway),
        record.id.clone(),
        metadata,
        Some(audio),
    )
    .await;

    let stored = db::get_story(&pool, &record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, StoryStatus::Completed);
    assert_eq!(*transcribe_calls.lock().await, vec!["audio/webm".to_string()]);

    let calls = text_calls.lock().await;
    let analysis_call = calls
        .iter()
        .find(|c| c.contains("Children's Book Editor"))
        .expect("analysis call");
    assert!(analysis_call.contains("Here is the transcript:"));
    assert!(analysis_call.contains("Once there was a robot."));
}

#[tokio::test]
async fn empty_audio_rejected_before_any_record() {
    let pool = setup_pool().await;
    let prompts = five_prompts();
    let prompt_refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let state = AppState {
        deps: deps(pool.clone(), ScriptedGateway::new(storyboard_json(&prompt_refs))),
    };

    let err = api::audio_intake(
        &state,
        Vec::new(),
        "audio/webm".to_string(),
        "Fun".to_string(),
        MaturityTier::Toddler,
    )
    .await
    .unwrap_err();
    assert_eq!(err.0, axum::http::StatusCode::BAD_REQUEST);

    // No orphan queued record.
    assert!(db::list_stories(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn audio_intake_stores_blob_and_queues_record() {
    let pool = setup_pool().await;
    let prompts = five_prompts();
    let prompt_refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let state = AppState {
        deps: deps(pool.clone(), ScriptedGateway::new(storyboard_json(&prompt_refs))),
    };

    let record = api::audio_intake(
        &state,
        vec![9, 9, 9],
        "audio/webm".to_string(),
        "Fun".to_string(),
        MaturityTier::Child,
    )
    .await
    .unwrap();

    assert_eq!(record.status, StoryStatus::Queued);
    assert_eq!(record.progress, 0);
    assert_eq!(record.creation_metadata.audio_url.as_deref(), Some("mem://blob-1"));

    let stored = db::get_story(&pool, &record.id).await.unwrap().unwrap();
    assert_eq!(stored.creation_metadata.theme, "Fun");
}
