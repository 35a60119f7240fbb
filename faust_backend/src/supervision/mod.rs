//! Supervised response generation.
//!
//! A candidate reply is generated, scored by a panel of reviewer personas and,
//! if the mean score misses the acceptance threshold, generated again. The best
//! scored candidate is kept across attempts so an exhausted loop still has
//! something to return.

pub mod generator;
pub mod personas;
pub mod reviewer;

use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::{bail, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::conversation::{first_text, ConversationTurn, Part};
use crate::llm_client::GenerationService;

pub use generator::{compose_system_instruction, ResponseGenerator};
pub use personas::PersonaPool;
pub use reviewer::{ReviewRequest, ReviewResult, Reviewer};

pub const MAX_RETRIES_RANGE: RangeInclusive<u32> = 1..=5;
pub const REVIEWER_COUNT_RANGE: RangeInclusive<u32> = 1..=5;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("no input parts to submit")]
    EmptyInput,
    #[error("generation request failed: {0:#}")]
    Service(anyhow::Error),
    #[error("generation stream broke after {received} bytes: {cause:#}")]
    Stream {
        received: usize,
        cause: anyhow::Error,
    },
    #[error("generation cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("reviewer request failed: {0:#}")]
    Service(anyhow::Error),
    #[error("reviewer reply is not an integer: {0:?}")]
    Unparseable(String),
    #[error("review cancelled")]
    Cancelled,
}

fn default_max_retries() -> u32 {
    3
}

fn default_reviewer_count() -> u32 {
    3
}

fn default_accept_threshold() -> u8 {
    50
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reviewer_count")]
    pub reviewer_count: u32,
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: u8,
    /// Issue reviewer calls concurrently instead of one after another.
    #[serde(default)]
    pub parallel_reviews: bool,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
            reviewer_count: default_reviewer_count(),
            accept_threshold: default_accept_threshold(),
            parallel_reviews: false,
        }
    }
}

impl SupervisionConfig {
    pub fn validate(&self) -> Result<()> {
        if !MAX_RETRIES_RANGE.contains(&self.max_retries) {
            bail!(
                "max_retries must be between {} and {}, got {}",
                MAX_RETRIES_RANGE.start(),
                MAX_RETRIES_RANGE.end(),
                self.max_retries
            );
        }
        if !REVIEWER_COUNT_RANGE.contains(&self.reviewer_count) {
            bail!(
                "reviewer_count must be between {} and {}, got {}",
                REVIEWER_COUNT_RANGE.start(),
                REVIEWER_COUNT_RANGE.end(),
                self.reviewer_count
            );
        }
        if self.accept_threshold > 100 {
            bail!(
                "accept_threshold must be between 0 and 100, got {}",
                self.accept_threshold
            );
        }
        Ok(())
    }

    /// Forces every knob into its legal range.
    pub fn clamped(self) -> Self {
        Self {
            max_retries: self
                .max_retries
                .clamp(*MAX_RETRIES_RANGE.start(), *MAX_RETRIES_RANGE.end()),
            reviewer_count: self
                .reviewer_count
                .clamp(*REVIEWER_COUNT_RANGE.start(), *REVIEWER_COUNT_RANGE.end()),
            accept_threshold: self.accept_threshold.min(100),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionState {
    Idle,
    Generating,
    Scoring,
    Retrying,
    Accepted,
    Exhausted,
    /// The loop stopped early on a generation failure or cancellation.
    Aborted,
}

impl SupervisionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SupervisionState::Accepted | SupervisionState::Exhausted | SupervisionState::Aborted
        )
    }

    pub fn can_transition_to(self, next: SupervisionState) -> bool {
        use SupervisionState::*;
        matches!(
            (self, next),
            (Idle, Generating)
                | (Generating, Scoring)
                | (Generating, Accepted)
                | (Generating, Aborted)
                | (Scoring, Accepted)
                | (Scoring, Retrying)
                | (Scoring, Exhausted)
                | (Scoring, Aborted)
                | (Retrying, Generating)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    BestEffort,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationAttempt {
    pub candidate_text: String,
    pub average_score: Option<f64>,
}

/// Running best-of-N across attempts. Ties keep the earlier attempt.
#[derive(Debug, Clone, Default)]
pub struct AttemptTracker {
    best: Option<GenerationAttempt>,
}

impl AttemptTracker {
    pub fn record(self, attempt: GenerationAttempt) -> Self {
        let Some(score) = attempt.average_score else {
            return self;
        };
        match &self.best {
            Some(best) if best.average_score.unwrap_or(f64::MIN) >= score => self,
            _ => Self {
                best: Some(attempt),
            },
        }
    }

    pub fn best(&self) -> Option<&GenerationAttempt> {
        self.best.as_ref()
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best.as_ref().and_then(|attempt| attempt.average_score)
    }

    pub fn into_best(self) -> Option<GenerationAttempt> {
        self.best
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisionResult {
    /// `None` only when the outcome is [`Outcome::Failed`].
    pub final_text: Option<String>,
    /// Mean reviewer score of the returned text; `None` when unsupervised.
    pub final_score: Option<f64>,
    pub outcome: Outcome,
    pub attempts: u32,
    pub reviewer_calls: u32,
    pub cancelled: bool,
}

/// Progress notifications for anyone watching a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SupervisionEvent {
    StateChanged {
        conversation_id: String,
        attempt: u32,
        state: SupervisionState,
    },
    CandidateChunk {
        conversation_id: String,
        attempt: u32,
        delta: String,
    },
    ReviewerScored {
        conversation_id: String,
        attempt: u32,
        reviewer: u32,
        persona: usize,
        score: u8,
        fallback: bool,
    },
    AttemptScored {
        conversation_id: String,
        attempt: u32,
        average: f64,
        accepted: bool,
    },
    Finished {
        conversation_id: String,
        outcome: Outcome,
        score: Option<f64>,
        attempts: u32,
        cancelled: bool,
    },
}

/// One user turn as the controller sees it.
#[derive(Debug, Clone, Copy)]
pub struct TurnInput<'a> {
    pub conversation_id: &'a str,
    pub model: &'a str,
    /// Transcript before `new_input`.
    pub history: &'a [ConversationTurn],
    pub new_input: &'a [Part],
    /// The user's instruction, unframed.
    pub system_instruction: &'a str,
}

#[derive(Clone)]
pub struct SupervisionController {
    generator: ResponseGenerator,
    reviewer: Reviewer,
    personas: PersonaPool,
    events: Option<flume::Sender<SupervisionEvent>>,
}

impl SupervisionController {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self {
            generator: ResponseGenerator::new(service.clone()),
            reviewer: Reviewer::new(service),
            personas: PersonaPool::default(),
            events: None,
        }
    }

    pub fn with_personas(mut self, personas: PersonaPool) -> Self {
        self.personas = personas;
        self
    }

    pub fn with_events(mut self, events: flume::Sender<SupervisionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: SupervisionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Runs one turn to completion. Never fails: generation failures surface
    /// as [`Outcome::Failed`] and reviewer failures as fallback scores.
    pub async fn run<R: Rng + Send>(
        &self,
        config: &SupervisionConfig,
        turn: &TurnInput<'_>,
        rng: &mut R,
        cancel: &CancellationToken,
    ) -> SupervisionResult {
        let mut cursor = StateCursor::new(self, turn.conversation_id);

        let result = if config.enabled {
            self.run_supervised(&config.clamped(), turn, rng, cancel, &mut cursor)
                .await
        } else {
            self.run_unsupervised(turn, cancel, &mut cursor).await
        };

        tracing::info!(
            "Turn {} finished: {:?} after {} attempt(s), score {:?}{}",
            turn.conversation_id,
            result.outcome,
            result.attempts,
            result.final_score,
            if result.cancelled { " (cancelled)" } else { "" }
        );
        self.emit(SupervisionEvent::Finished {
            conversation_id: turn.conversation_id.to_string(),
            outcome: result.outcome,
            score: result.final_score,
            attempts: result.attempts,
            cancelled: result.cancelled,
        });
        result
    }

    async fn run_unsupervised(
        &self,
        turn: &TurnInput<'_>,
        cancel: &CancellationToken,
        cursor: &mut StateCursor<'_>,
    ) -> SupervisionResult {
        cursor.enter(SupervisionState::Generating, 1);
        match self.generate_candidate(turn, 1, cancel).await {
            Ok(text) => {
                cursor.enter(SupervisionState::Accepted, 1);
                SupervisionResult {
                    final_text: Some(text),
                    final_score: None,
                    outcome: Outcome::Accepted,
                    attempts: 1,
                    reviewer_calls: 0,
                    cancelled: false,
                }
            }
            Err(e) => {
                tracing::warn!("Generation failed for {}: {}", turn.conversation_id, e);
                cursor.enter(SupervisionState::Aborted, 1);
                SupervisionResult {
                    final_text: None,
                    final_score: None,
                    outcome: Outcome::Failed,
                    attempts: 1,
                    reviewer_calls: 0,
                    cancelled: matches!(e, GenerationError::Cancelled),
                }
            }
        }
    }

    async fn run_supervised<R: Rng + Send>(
        &self,
        config: &SupervisionConfig,
        turn: &TurnInput<'_>,
        rng: &mut R,
        cancel: &CancellationToken,
        cursor: &mut StateCursor<'_>,
    ) -> SupervisionResult {
        let mut tracker = AttemptTracker::default();
        let mut attempts = 0;
        let mut reviewer_calls = 0;
        let mut accepted = false;
        let mut cancelled = false;

        while attempts < config.max_retries {
            attempts += 1;
            if attempts > 1 {
                cursor.enter(SupervisionState::Retrying, attempts - 1);
            }
            cursor.enter(SupervisionState::Generating, attempts);

            let candidate = match self.generate_candidate(turn, attempts, cancel).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(
                        "Generation failed for {} on attempt {}: {}",
                        turn.conversation_id,
                        attempts,
                        e
                    );
                    cancelled = matches!(e, GenerationError::Cancelled);
                    break;
                }
            };

            cursor.enter(SupervisionState::Scoring, attempts);
            let scores = match self
                .review_candidate(config, turn, &candidate, attempts, rng, cancel)
                .await
            {
                Ok(scores) => scores,
                Err(e) => {
                    tracing::info!("Scoring stopped for {}: {}", turn.conversation_id, e);
                    cancelled = true;
                    break;
                }
            };
            reviewer_calls += scores.len() as u32;

            let average = mean_score(&scores);
            let is_accepted = average >= f64::from(config.accept_threshold);
            tracing::info!(
                "Attempt {} for {} averaged {:.2} (threshold {}): {}",
                attempts,
                turn.conversation_id,
                average,
                config.accept_threshold,
                if is_accepted { "accept" } else { "retry" }
            );
            self.emit(SupervisionEvent::AttemptScored {
                conversation_id: turn.conversation_id.to_string(),
                attempt: attempts,
                average,
                accepted: is_accepted,
            });
            tracker = tracker.record(GenerationAttempt {
                candidate_text: candidate,
                average_score: Some(average),
            });

            if is_accepted {
                accepted = true;
                break;
            }
        }

        let terminal = if accepted {
            SupervisionState::Accepted
        } else if cursor.state == SupervisionState::Scoring && !cancelled {
            SupervisionState::Exhausted
        } else {
            SupervisionState::Aborted
        };
        cursor.enter(terminal, attempts);

        let outcome = match (accepted, tracker.best()) {
            (true, _) => Outcome::Accepted,
            (false, Some(_)) => Outcome::BestEffort,
            (false, None) => Outcome::Failed,
        };
        let final_score = tracker.best_score();
        SupervisionResult {
            final_text: tracker.into_best().map(|attempt| attempt.candidate_text),
            final_score,
            outcome,
            attempts,
            reviewer_calls,
            cancelled,
        }
    }

    async fn generate_candidate(
        &self,
        turn: &TurnInput<'_>,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let events = self.events.clone();
        let conversation_id = turn.conversation_id.to_string();
        let mut on_chunk = move |delta: &str| {
            if let Some(tx) = &events {
                let _ = tx.send(SupervisionEvent::CandidateChunk {
                    conversation_id: conversation_id.clone(),
                    attempt,
                    delta: delta.to_string(),
                });
            }
        };

        self.generator
            .generate(
                turn.model,
                turn.history,
                turn.system_instruction,
                turn.new_input,
                cancel,
                &mut on_chunk,
            )
            .await
    }

    /// Scores one candidate with `reviewer_count` freshly drawn personas.
    /// Only cancellation is an error; individual reviewer failures have
    /// already degraded to the fallback score.
    async fn review_candidate<R: Rng + Send>(
        &self,
        config: &SupervisionConfig,
        turn: &TurnInput<'_>,
        candidate: &str,
        attempt: u32,
        rng: &mut R,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ScoringError> {
        let request = ReviewRequest {
            user_input: first_text(turn.new_input),
            history: turn.history,
            system_instruction: turn.system_instruction,
            candidate,
        };
        let drawn: Vec<usize> = (0..config.reviewer_count)
            .map(|_| self.personas.draw_index(rng))
            .collect();

        let results: Vec<Result<ReviewResult, ScoringError>> = if config.parallel_reviews {
            futures_util::future::join_all(
                drawn
                    .iter()
                    .map(|persona| self.review_once(turn.model, &request, *persona, cancel)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(drawn.len());
            for persona in &drawn {
                let result = self
                    .review_once(turn.model, &request, *persona, cancel)
                    .await;
                let stop = result.is_err();
                results.push(result);
                if stop {
                    break;
                }
            }
            results
        };

        let mut scores = Vec::with_capacity(results.len());
        for (index, (result, persona)) in results.into_iter().zip(drawn).enumerate() {
            let review = result?;
            tracing::debug!(
                "Reviewer {} (persona {}) scored attempt {}: {}",
                index + 1,
                persona,
                attempt,
                review.score
            );
            self.emit(SupervisionEvent::ReviewerScored {
                conversation_id: turn.conversation_id.to_string(),
                attempt,
                reviewer: index as u32 + 1,
                persona,
                score: review.score,
                fallback: review.fallback,
            });
            scores.push(review.score);
        }
        Ok(scores)
    }

    async fn review_once(
        &self,
        model: &str,
        request: &ReviewRequest<'_>,
        persona: usize,
        cancel: &CancellationToken,
    ) -> Result<ReviewResult, ScoringError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScoringError::Cancelled),
            review = self.reviewer.score(model, request, self.personas.get(persona)) => Ok(review),
        }
    }
}

fn mean_score(scores: &[u8]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|s| f64::from(*s)).sum::<f64>() / scores.len() as f64
}

/// Tracks the controller's state and broadcasts each change.
struct StateCursor<'a> {
    controller: &'a SupervisionController,
    conversation_id: &'a str,
    state: SupervisionState,
}

impl<'a> StateCursor<'a> {
    fn new(controller: &'a SupervisionController, conversation_id: &'a str) -> Self {
        Self {
            controller,
            conversation_id,
            state: SupervisionState::Idle,
        }
    }

    fn enter(&mut self, next: SupervisionState, attempt: u32) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal supervision transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        self.controller.emit(SupervisionEvent::StateChanged {
            conversation_id: self.conversation_id.to_string(),
            attempt,
            state: next,
        });
    }
}
