//! Prompt templates for the three generation stages. The visual and setting
//! signatures produced by stage 1 must be embedded verbatim in every page's
//! image prompt; that cross-page consistency contract lives in these
//! templates, not in code.
use crate::model::{MaturityTier, NarrativeAnalysis};

/// Strip markdown code-fence markers around a model's JSON payload.
pub fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

fn maturity_guideline(tier: MaturityTier) -> &'static str {
    match tier {
        MaturityTier::Toddler => {
            "Use very simple words, repetition, and 3-word sentences. Focus on sensory details (colors, sounds). Low stakes."
        }
        MaturityTier::Child => {
            "Use complete sentences, clear cause-and-effect, and a distinct beginning/middle/end. Moderate stakes (e.g., getting lost, making friends)."
        }
        MaturityTier::Youth => {
            "Use complex vocabulary, metaphors, and emotional depth. Higher stakes and moral ambiguity allowed."
        }
    }
}

/// Stage 1: analyze the intake into the story bible.
pub fn narrative_analysis(tier: MaturityTier, theme: &str, from_audio: bool) -> String {
    let guideline = maturity_guideline(tier);

    let mut schema = serde_json::json!({
        "title": "A catchy, age-appropriate title",
        "plot_summary": "A 2-sentence summary of the narrative arc",
        "moral_lesson": "The underlying lesson or theme derived from the story",
        "art_style": "A specific, cohesive art style description (e.g., 'whimsical watercolor', 'vibrant 3D', 'crayon drawing')",
        "character_desc": "A detailed textual description of the main character",
        "visual_signature": "A concise, reusable image prompt slug for the main character (e.g., 'tiny blue robot with rusty antenna and red rubber boots'). This MUST be consistent.",
        "setting_signature": "A reusable description of the main setting (e.g., 'magical glowing forest with purple trees')."
    });
    if from_audio {
        schema["transcript"] = serde_json::json!(
            "The verbatim transcript of the audio. If silent/unclear, state '[Audio Unclear]'."
        );
    }
    let schema = serde_json::to_string_pretty(&schema).expect("static schema");

    let read_step = if from_audio {
        "LISTEN & TRANSCRIBE: First, accurately transcribe the user's audio.".to_string()
    } else {
        "READ: Analyze the user's text prompt.".to_string()
    };
    let audio_rule = if from_audio {
        format!(
            "\n       - CRITICAL: If the audio is silent, garbled, or just background noise, INVENT a new story entirely based on the Theme: '{theme}'."
        )
    } else {
        String::new()
    };

    format!(
        r#"You are an elite Children's Book Editor and Art Director.

INPUT CONTEXT:
- Target Audience: {maturity} ({guideline})
- Core Theme: {theme}

YOUR MISSION:
1. {read_step}
2. ANALYZE & FILL GAPS:
   - If the input is a complete story, refine it.
   - If the input is a rambling memory, structure it into a narrative.{audio_rule}
3. CREATE THE 'STORY BIBLE':
   - Define a **Visual Signature**: A specific, unchanging description of the protagonist to ensure they look exactly the same on every page.
   - Define an **Art Style**: Choose a style that fits the mood (e.g., 'Soft Pastel' for Bedtime, 'High Contrast Comic' for Action).

OUTPUT FORMAT:
Return ONLY a valid JSON object. Do not include markdown formatting (like ```json).

JSON STRUCTURE:
{schema}"#,
        maturity = tier.as_str(),
    )
}

/// Stage 2: split the analyzed story into per-page text and image prompts.
pub fn storyboard(page_count: usize, analysis: &NarrativeAnalysis) -> String {
    let NarrativeAnalysis {
        title,
        plot_summary,
        art_style,
        visual_signature,
        setting_signature,
        ..
    } = analysis;

    format!(
        r#"You are a professional Storyboard Artist and Children's Book Author.

PROJECT: "{title}"
SUMMARY: {plot_summary}
STYLE GUIDE: {art_style}
CHARACTER SIGNATURE: "{visual_signature}"
SETTING SIGNATURE: "{setting_signature}"

TASK:
Create a {page_count}-page storyboard.

RULES FOR TEXT:
- Divide the story into exactly {page_count} sequential pages.
- The text per page must be suitable for the target audience.
- Ensure a clear Beginning, Middle, and End.

RULES FOR IMAGE PROMPTS (CRITICAL):
1. **Consistency is Key**: EVERY image prompt MUST include the 'CHARACTER SIGNATURE' and 'STYLE GUIDE'.
2. **Variety**: Use different camera angles. (e.g., "Close-up of...", "Wide shot of...", "Overhead view of...").
3. **Composition**: Describe the action clearly.
4. **Avoid Text**: Do not describe text appearing inside the image itself.

OUTPUT FORMAT:
Return ONLY a strictly valid JSON LIST of objects.

EXAMPLE OUTPUT:
[
    {{
        "page_number": 1,
        "text_content": "Once upon a time, in a magical forest...",
        "image_prompt_description": "{art_style} style wide shot of {visual_signature} standing in {setting_signature}, sunlight streaming through leaves, high detail."
    }},
    {{
        "page_number": 2,
        "text_content": "Suddenly, a loud noise was heard!",
        "image_prompt_description": "{art_style} style close-up of {visual_signature} looking surprised, eyes wide open, {setting_signature} in background, expressive face."
    }}
]"#
    )
}

/// Stage 3 fallback: rewrite an image prompt that tripped the safety filter,
/// steering away from every phrasing that already failed.
pub fn safety_rewrite(previous_failures: &[String]) -> String {
    let failure_context = if previous_failures.is_empty() {
        String::new()
    } else {
        let failure_list = previous_failures
            .iter()
            .map(|p| format!("\"{p}\""))
            .collect::<Vec<_>>()
            .join("\n- ");
        format!(
            "\n\nCONTEXT - THE FOLLOWING REWRITES ALREADY FAILED (SAFETY BLOCK):\n{failure_list}\n\n\
             INSTRUCTION: The safety filter is strict. Do not repeat the phrasing above. \
             Try a drastically different angle (e.g., zoom out, focus on environment vs character, \
             remove all action verbs) to ensure an image will get generated but stick to the \
             original visual intent and art style."
        )
    };

    format!(
        r#"You are an expert AI Prompt Engineer specializing in Content Safety and Compliance.

CONTEXT:
The user is trying to generate an innocent illustration for a children's book, but the prompt triggered a safety filter (likely due to strict rules on child safety, violence, or sensitive terms).

YOUR TASK:
Rewrite the prompt to be 100% Safe-For-Work (PG-rated) while preserving the original **visual intent** and **art style**.
{failure_context}

SAFETY REWRITE RULES:
1. **Age Ambiguity**: Change specific ages (e.g., "8-year-old girl") to generic artistic terms (e.g., "young storybook character", "tiny adventurer", "youthful hero").
2. **Clothing Sanitation**: Replace archaic or specific clothing terms that trigger filters (e.g., replace "bloomers", "swimsuit", "leotard", "rags") with neutral terms (e.g., "overalls", "shorts", "outfit", "patchwork clothes").
3. **Hygiene/Gore**: Replace "dirty", "stained", "blood", or "hurt" with "messy", "dusty", "scuffed", or "bandaged".
4. **Style Enforcement**: PREPEND the phrase "Digital art illustration, gentle storybook style" to ensure the model treats it as art, not a photorealistic fake.
5. **Action Softening**: If the character is "fighting" or "attacking", change it to "facing", "posturing", or "in an action pose".

OUTPUT:
Return ONLY the rewritten prompt string. Do not add "Here is the prompt" or any explanations."#
    )
}
