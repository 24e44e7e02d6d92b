use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reading tier of the target audience; drives page count and pacing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MaturityTier {
    #[default]
    Toddler,
    Child,
    Youth,
}

impl MaturityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaturityTier::Toddler => "toddler",
            MaturityTier::Child => "child",
            MaturityTier::Youth => "youth",
        }
    }

    pub fn parse(s: &str) -> Option<MaturityTier> {
        match s {
            "toddler" => Some(MaturityTier::Toddler),
            "child" => Some(MaturityTier::Child),
            "youth" => Some(MaturityTier::Youth),
            _ => None,
        }
    }

    /// Coarse page-count policy; not user-configurable.
    pub fn page_count(&self) -> usize {
        match self {
            MaturityTier::Toddler => 5,
            _ => 8,
        }
    }

    /// Assumed read-aloud pace for the duration estimate.
    pub fn words_per_minute(&self) -> u32 {
        match self {
            MaturityTier::Toddler => 100,
            _ => 150,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Queued,
    AnalyzingNarrative,
    Storyboarding,
    Illustrating,
    Completed,
    Failed,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Queued => "queued",
            StoryStatus::AnalyzingNarrative => "analyzing_narrative",
            StoryStatus::Storyboarding => "storyboarding",
            StoryStatus::Illustrating => "illustrating",
            StoryStatus::Completed => "completed",
            StoryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> StoryStatus {
        match s {
            "queued" => StoryStatus::Queued,
            "analyzing_narrative" => StoryStatus::AnalyzingNarrative,
            "storyboarding" => StoryStatus::Storyboarding,
            "illustrating" => StoryStatus::Illustrating,
            "completed" => StoryStatus::Completed,
            _ => StoryStatus::Failed,
        }
    }
}

/// One entry of the append-only status timeline. Each entry carries its own
/// progress snapshot so the history replays without external state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEntry {
    pub stage: String,
    pub message: String,
    pub progress: i64,
    pub timestamp: DateTime<Utc>,
}

/// Original request parameters; immutable after intake.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreationMetadata {
    pub prompt_text: Option<String>,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub maturity: MaturityTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

fn default_theme() -> String {
    "Fun".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page {
    pub page_number: i64,
    pub text_content: String,
    pub image_url: String,
    /// The prompt that produced the accepted image; differs from the
    /// storyboard prompt when a safety rewrite succeeded.
    pub image_prompt: String,
    /// Estimated seconds a reader needs for this page.
    pub duration: i64,
    pub audio_url: Option<String>,
    /// Whether a real image was produced, as opposed to the placeholder.
    pub success: bool,
}

/// Client-facing projection of a story run. Internal process context
/// (analysis, raw storyboard) is persisted separately and never served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryRecord {
    pub id: String,
    pub status: StoryStatus,
    pub progress: i64,
    pub current_stage_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub creation_metadata: CreationMetadata,
    pub status_history: Vec<StatusEntry>,
    pub pages: Vec<Page>,
    pub created_at: DateTime<Utc>,
}

impl StoryRecord {
    pub fn new(id: String, metadata: CreationMetadata) -> Self {
        Self {
            id,
            status: StoryStatus::Queued,
            progress: 0,
            current_stage_message: "Queued...".to_string(),
            title: None,
            creation_metadata: metadata,
            status_history: Vec::new(),
            pages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Synthetic record served when an id is unknown.
    pub fn not_found(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: StoryStatus::Failed,
            progress: 0,
            current_stage_message: "Not found".to_string(),
            title: None,
            creation_metadata: CreationMetadata::default(),
            status_history: Vec::new(),
            pages: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Stage-1 output: the story bible everything downstream is grounded in.
/// The visual and setting signatures must appear verbatim in every page's
/// image prompt; the storyboard template enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeAnalysis {
    #[serde(default = "untitled")]
    pub title: String,
    #[serde(default)]
    pub plot_summary: String,
    #[serde(default)]
    pub moral_lesson: String,
    #[serde(default = "default_art_style")]
    pub art_style: String,
    #[serde(default)]
    pub character_desc: String,
    #[serde(default = "default_visual_signature")]
    pub visual_signature: String,
    #[serde(default = "default_setting_signature")]
    pub setting_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

fn untitled() -> String {
    "Untitled Story".to_string()
}

fn default_art_style() -> String {
    "digital illustration".to_string()
}

fn default_visual_signature() -> String {
    "a cute character".to_string()
}

fn default_setting_signature() -> String {
    "a colorful background".to_string()
}

/// One storyboard entry as returned by the stage-2 model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryboardPage {
    pub page_number: i64,
    pub text_content: String,
    pub image_prompt_description: String,
}
