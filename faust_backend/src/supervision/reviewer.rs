use std::num::IntErrorKind;
use std::sync::Arc;

use crate::conversation::{ConversationTurn, Part};
use crate::llm_client::{GenerationService, SingleShotOptions};

use super::ScoringError;

/// Score used whenever a reviewer call fails or its reply is not an integer.
pub const FALLBACK_SCORE: u8 = 50;

pub const REVIEW_TEMPERATURE: f32 = 0.01;
pub const REVIEW_TOP_P: f32 = 1.0;
pub const REVIEW_TOP_K: u32 = 1;

pub const SUPERVISOR_RUBRIC: &str = r#"You are the supervisor who evaluates and scores the quality of the chatbot's answer. Use the criteria below to rate the answer, where 100 is the maximum.

**Evaluation criteria:**

1. **Understanding of user intent (30 points):**
    * Did the answer grasp the core of the user's question or request? (5 points)
    * Did the answer address the user's request clearly and directly? (5 points)
    * Did the answer supply everything the user asked for without omissions? (5 points)
    * Does the answer fit the purpose the user intended? (5 points)
    * Did the answer offer additional help or information the user may need? (5 points)
    * Is the answer pitched at an appropriate level for the user's request? (5 points)

2. **Compliance with the system instruction (30 points):**
    * Did the answer stay consistent with the persona the system instruction defines? (5 points)
    * Did the answer follow the tone and style the system instruction asks for? (5 points)
    * Did the answer respect what the system instruction says to include or exclude? (5 points)
    * Did the answer follow the format the system instruction specifies? (5 points)
    * Did the answer carry out the system instruction's directives appropriately? (5 points)
    * Are there no grammar or spelling mistakes in the answer? (5 points)

3. **Conversational flow (20 points):**
    * Did the answer correctly understand the earlier conversation and the user's prior questions? (5 points)
    * Does the answer connect naturally to the earlier conversation? (5 points)
    * Does the answer avoid any inappropriate or unnatural content for this conversation? (10 points)

4. **Accuracy and usefulness (20 points):**
    * Is the information in the answer factually correct? (5 points)
    * Is the information in the answer current? (5 points)
    * Is the information in the answer based on reliable sources? (5 points)
    * Is the information in the answer practically useful to the user? (5 points)

5. **Penalties:**
    * Subtract 40 points if the answer contains hallucinated information.
    * Subtract 20 points if the answer forgets or contradicts content from earlier in the conversation.
    * Subtract 10 points if the answer ignores the required output format.

**Output:**

Print the total score between 0 and 100 as a single integer and nothing else. Do not print a breakdown or any explanation. For example, if the answer earns 75 points, print only "75"."#;

/// Everything one reviewer needs to judge a candidate.
#[derive(Debug, Clone, Copy)]
pub struct ReviewRequest<'a> {
    pub user_input: &'a str,
    pub history: &'a [ConversationTurn],
    pub system_instruction: &'a str,
    pub candidate: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewResult {
    pub score: u8,
    /// True when the score is the fallback rather than a parsed reply.
    pub fallback: bool,
}

/// Persona plus rubric. Reviewer calls do not get the principles and
/// step-by-step framing that candidate generation gets.
pub fn reviewer_instruction(persona: &str) -> String {
    format!("{}\n{}", persona, SUPERVISOR_RUBRIC)
}

/// Renders the material under review. Unframed: reviewers judge the candidate
/// against the instruction the user actually wrote.
pub fn build_evaluation_context(request: &ReviewRequest<'_>) -> String {
    let mut history = String::new();
    for turn in request.history {
        history.push('\n');
        history.push_str(turn.speaker.as_str());
        history.push_str(": ");
        history.push_str(&turn.text);
    }

    format!(
        "---\nUser input: {}\n---\nChatbot conversation history so far:\n{}\n---\nChatbot system instruction (original): {}\n---\nChatbot answer: {}\n\nUsing the information above, score the chatbot's answer from 0 to 100.",
        request.user_input, history, request.system_instruction, request.candidate
    )
}

/// Extracts the integer score from a reviewer reply. Surrounding whitespace is
/// tolerated; anything else is a parse failure. Integers too large for `i64`
/// saturate so they still clamp to 0 or 100.
pub fn parse_score(reply: &str) -> Result<i64, ScoringError> {
    let trimmed = reply.trim();
    match trimmed.parse::<i64>() {
        Ok(score) => Ok(score),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Ok(i64::MAX),
            IntErrorKind::NegOverflow => Ok(i64::MIN),
            _ => Err(ScoringError::Unparseable(trimmed.to_string())),
        },
    }
}

pub fn clamp_score(raw: i64) -> u8 {
    raw.clamp(0, 100) as u8
}

pub fn review_options(persona: &str) -> SingleShotOptions {
    SingleShotOptions {
        system_instruction: Some(reviewer_instruction(persona)),
        temperature: Some(REVIEW_TEMPERATURE),
        top_p: Some(REVIEW_TOP_P),
        top_k: Some(REVIEW_TOP_K),
    }
}

/// One supervisor call per invocation. Failures never escape: they degrade to
/// [`FALLBACK_SCORE`].
#[derive(Clone)]
pub struct Reviewer {
    service: Arc<dyn GenerationService>,
}

impl Reviewer {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self { service }
    }

    pub async fn score(
        &self,
        model: &str,
        request: &ReviewRequest<'_>,
        persona: &str,
    ) -> ReviewResult {
        match self.try_score(model, request, persona).await {
            Ok(raw) => {
                let score = clamp_score(raw);
                if i64::from(score) != raw {
                    tracing::warn!("Reviewer score {} out of range, clamped to {}", raw, score);
                }
                ReviewResult {
                    score,
                    fallback: false,
                }
            }
            Err(e) => {
                tracing::warn!("Reviewer fell back to {}: {}", FALLBACK_SCORE, e);
                ReviewResult {
                    score: FALLBACK_SCORE,
                    fallback: true,
                }
            }
        }
    }

    async fn try_score(
        &self,
        model: &str,
        request: &ReviewRequest<'_>,
        persona: &str,
    ) -> Result<i64, ScoringError> {
        let prompt = build_evaluation_context(request);
        let reply = self
            .service
            .single_shot(model, vec![Part::text(prompt)], &review_options(persona))
            .await
            .map_err(ScoringError::Service)?;
        parse_score(&reply)
    }
}
