//! Conversational style calibration: a short model-led interview that ends
//! with a `StyleProfile` the recipe steps can use.

use crate::{
    extraction::{DataModel, data_model::FieldStats},
    llm::{AiError, AiService, Effort, UsageLedger},
    models::{StyleProfile, display_value},
    storage::{JobDir, StoreError, read_json, write_json_atomic},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const INTERVIEW_PROMPT: &str = "\
You are a marketplace listing expert helping a seller define their brand and \
listing style. Run a SHORT interview (3-5 exchanges at most).

RULES:
- Never ask what the data summary below already answers.
- Show what you already inferred before asking, so the seller can confirm or correct.
- Cover, skipping anything already clear: selling platform, target buyer, brand \
voice, pricing approach, mandatory mentions, description structure.
- Wrap up as soon as you have enough.

WHEN YOU HAVE ENOUGH: give a 2-3 sentence summary of the profile, ask nothing \
further, then end with a ```json fenced block of exactly this shape:
{\"platform\": \"etsy\", \"seller_type\": \"...\", \"target_buyer\": \"...\", \
\"brand_voice\": \"...\", \"description_structure\": \"...\", \
\"avg_description_length\": \"...\", \"pricing_strategy\": \"...\", \
\"tags_style\": \"...\", \"title_format\": \"...\", \"always_mention\": [\"...\"], \
\"example_listings\": []}
Only output the JSON block once the profile is complete.";

const READY_FALLBACK: &str =
    "Great, I have everything I need and saved your style profile. Next up: drafting the recipe.";

static PROFILE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*\n(.*?)```").expect("profile block regex"));
static OPEN_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```\s*\n(\{.*)").expect("open block regex"));

#[derive(Debug, Error)]
pub enum InterviewError {
    #[error("the interview has already started; send a message to continue")]
    MessageRequired,
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Interviewing,
    ProfileReady,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterviewReply {
    /// The model's message with any profile block removed.
    pub response: String,
    pub phase: Phase,
    pub style_profile: Option<StyleProfile>,
}

/// One job's interview. The transcript lives in `conversation.json`; a
/// finished profile is written to the job's style file.
pub struct StyleInterview<'a> {
    ai: &'a dyn AiService,
    ledger: &'a UsageLedger,
}

impl<'a> StyleInterview<'a> {
    pub fn new(ai: &'a dyn AiService, ledger: &'a UsageLedger) -> Self {
        Self { ai, ledger }
    }

    /// Opens the interview when there is no transcript (or `restart` is set),
    /// otherwise answers `message` in context.
    pub async fn turn(
        &self,
        job: &JobDir,
        model: Option<&DataModel>,
        message: Option<&str>,
        restart: bool,
    ) -> Result<InterviewReply, InterviewError> {
        let mut history: Vec<Turn> = if restart {
            Vec::new()
        } else {
            read_json(&job.conversation_path())?.unwrap_or_default()
        };
        let message = message.map(str::trim).filter(|text| !text.is_empty());
        if message.is_none() && !history.is_empty() {
            return Err(InterviewError::MessageRequired);
        }

        let context = data_context(model);
        let mut prompt = conversation_prompt(&context, &history, message);
        if message.is_none() {
            prompt.push_str(
                " Begin the interview. Greet the seller briefly, summarise what you already \
know from their data, and ask your first question.",
            );
        }
        let generation = self.ai.generate_text(&prompt, Effort::High).await?;
        self.ledger.record(generation.usage);
        let text = generation.value;

        if let Some(content) = message {
            history.push(Turn {
                role: Role::User,
                content: content.to_string(),
            });
        }
        history.push(Turn {
            role: Role::Assistant,
            content: text.clone(),
        });
        write_json_atomic(&job.conversation_path(), &history)?;

        let reply = match extract_profile(&text) {
            Some(profile) => {
                write_json_atomic(&job.style_path(), &profile)?;
                info!(
                    target = "listing.recipe",
                    job_id = %job.id(),
                    platform = ?profile.platform,
                    turns = history.len(),
                    "style_profile_ready"
                );
                let visible = strip_profile_block(&text);
                InterviewReply {
                    response: if visible.is_empty() {
                        READY_FALLBACK.to_string()
                    } else {
                        visible
                    },
                    phase: Phase::ProfileReady,
                    style_profile: Some(profile),
                }
            }
            None => InterviewReply {
                response: text,
                phase: Phase::Interviewing,
                style_profile: None,
            },
        };
        Ok(reply)
    }
}

/// What the interviewer should already know about the catalog.
fn data_context(model: Option<&DataModel>) -> String {
    let Some(model) = model else {
        return "DATA SUMMARY: no catalog has been extracted yet.".to_string();
    };
    let mut lines = vec![
        "DATA SUMMARY:".to_string(),
        format!("- Total products: {}", model.items.len()),
        format!("- Fields: {}", model.fields_discovered.join(", ")),
    ];
    match model.field_stats.get("price") {
        Some(FieldStats::Numeric { min, max, .. }) => {
            lines.push(format!("- Prices already provided: yes (range {min:.2} - {max:.2})"))
        }
        _ => lines.push(
            "- Prices already provided: no (ask how the seller wants prices estimated)".into(),
        ),
    }
    let with_images = model
        .items
        .iter()
        .filter(|item| !item.image_files.is_empty())
        .count();
    lines.push(format!(
        "- Images linked to products: {}",
        if with_images > 0 { "yes" } else { "no" }
    ));
    let mut categories: Vec<String> = model
        .items
        .iter()
        .filter_map(|item| item.fields.get("category"))
        .map(display_value)
        .filter(|category| !category.is_empty())
        .collect();
    categories.sort();
    categories.dedup();
    if !categories.is_empty() {
        categories.truncate(10);
        lines.push(format!("- Categories found: {}", categories.join(", ")));
    }
    if !model.matching_strategy.is_empty() {
        lines.push(format!("- Image matching strategy: {}", model.matching_strategy));
    }
    if !model.unmatched_images.is_empty() {
        lines.push(format!("- Unmatched images: {}", model.unmatched_images.len()));
    }
    lines.join("\n")
}

fn conversation_prompt(context: &str, history: &[Turn], message: Option<&str>) -> String {
    let mut parts = vec![
        INTERVIEW_PROMPT.to_string(),
        String::new(),
        context.to_string(),
        String::new(),
        "CONVERSATION SO FAR:".to_string(),
    ];
    for turn in history {
        let role = match turn.role {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
        };
        parts.push(format!("{role}: {}", turn.content));
    }
    if let Some(message) = message {
        parts.push(format!("USER: {message}"));
    }
    parts.push(String::new());
    parts.push("ASSISTANT:".to_string());
    parts.join("\n")
}

/// The profile from a ```json block, if the reply carries a complete one.
fn extract_profile(text: &str) -> Option<StyleProfile> {
    let body = PROFILE_BLOCK
        .captures(text)
        .or_else(|| OPEN_BLOCK.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().trim_end_matches('`').trim())?;
    match serde_json::from_str::<StyleProfile>(body) {
        Ok(mut profile) => {
            if profile.platform.as_deref().is_none_or(str::is_empty) {
                profile.platform = Some("general".to_string());
            }
            Some(profile)
        }
        Err(err) => {
            warn!(target = "listing.recipe", error = %err, "style_profile_unparseable");
            None
        }
    }
}

fn strip_profile_block(text: &str) -> String {
    PROFILE_BLOCK.replace_all(text, "").trim().to_string()
}
