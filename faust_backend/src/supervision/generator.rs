use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::conversation::{ConversationTurn, Part};
use crate::llm_client::{create_session, GenerationService};

use super::GenerationError;

pub const PRINCIPLES_PREAMBLE: &str = r#"Make sure to think step-by-step when answering.

Follow these first principles in every answer:
1. If you do not know something, say "I don't know" instead of inventing an answer.
2. When you have to guess, say clearly that it is a guess.
3. When you are unsure whether a source is reliable, say so.
4. Back up claims with evidence wherever you can.
5. If the request lacks the context you need, ask the user for it.
6. When you draw on sources, summarize them for the user.

Below is the instruction for this conversation:
"#;

pub const STEP_BY_STEP_EPILOGUE: &str = "\nthink about it step-by-step always";

/// Wraps the user's instruction in the fixed framing blocks.
pub fn compose_system_instruction(user_instruction: &str) -> String {
    format!(
        "{}{}{}",
        PRINCIPLES_PREAMBLE, user_instruction, STEP_BY_STEP_EPILOGUE
    )
}

/// Produces one candidate reply by draining a streamed generation.
#[derive(Clone)]
pub struct ResponseGenerator {
    service: Arc<dyn GenerationService>,
}

impl ResponseGenerator {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self { service }
    }

    /// `history` must not contain `new_input`. Every received chunk is handed
    /// to `on_chunk` in order; the return value is their concatenation.
    pub async fn generate(
        &self,
        model: &str,
        history: &[ConversationTurn],
        system_instruction: &str,
        new_input: &[Part],
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String, GenerationError> {
        if new_input.is_empty() {
            return Err(GenerationError::EmptyInput);
        }

        let session = create_session(
            model,
            history,
            &compose_system_instruction(system_instruction),
        );

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            opened = self.service.send_streaming(&session, new_input.to_vec()) => {
                opened.map_err(GenerationError::Service)?
            }
        };

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    on_chunk(&chunk);
                    text.push_str(&chunk);
                }
                Some(Err(cause)) => {
                    return Err(GenerationError::Stream {
                        received: text.len(),
                        cause,
                    })
                }
                None => break,
            }
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{GenerationSession, SingleShotOptions, TextStream};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ChunkedService {
        chunks: Vec<Result<String, String>>,
        seen: Mutex<Vec<GenerationSession>>,
    }

    #[async_trait]
    impl GenerationService for ChunkedService {
        async fn send_streaming(
            &self,
            session: &GenerationSession,
            _parts: Vec<Part>,
        ) -> Result<TextStream> {
            self.seen.lock().unwrap().push(session.clone());
            let items: Vec<Result<String>> = self
                .chunks
                .iter()
                .cloned()
                .map(|item| item.map_err(|e| anyhow!(e)))
                .collect();
            Ok(Box::pin(futures_util::stream::iter(items)))
        }

        async fn single_shot(
            &self,
            _model: &str,
            _parts: Vec<Part>,
            _options: &SingleShotOptions,
        ) -> Result<String> {
            Ok(String::new())
        }
    }

    fn service(chunks: Vec<Result<String, String>>) -> Arc<ChunkedService> {
        Arc::new(ChunkedService {
            chunks,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn concatenates_chunks_and_frames_instruction() {
        let fake = service(vec![
            Ok("Hel".to_string()),
            Ok(String::new()),
            Ok("lo".to_string()),
        ]);
        let generator = ResponseGenerator::new(fake.clone());
        let history = vec![ConversationTurn::user("earlier"), ConversationTurn::assistant("ok")];
        let mut received = Vec::new();

        let text = generator
            .generate(
                "gemini-2.5-flash",
                &history,
                "be kind",
                &[Part::text("hi")],
                &CancellationToken::new(),
                &mut |chunk| received.push(chunk.to_string()),
            )
            .await
            .unwrap();

        assert_eq!(text, "Hello");
        assert_eq!(received, vec!["Hel".to_string(), "lo".to_string()]);

        let seen = fake.seen.lock().unwrap();
        assert_eq!(seen[0].history, history);
        assert!(seen[0].system_instruction.starts_with(PRINCIPLES_PREAMBLE));
        assert!(seen[0]
            .system_instruction
            .ends_with("be kind\nthink about it step-by-step always"));
    }

    #[tokio::test]
    async fn broken_stream_reports_failure() {
        let generator = ResponseGenerator::new(service(vec![
            Ok("partial".to_string()),
            Err("connection reset".to_string()),
        ]));

        let err = generator
            .generate(
                "m",
                &[],
                "",
                &[Part::text("hi")],
                &CancellationToken::new(),
                &mut |_| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::Stream { received: 7, .. }));
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let generator = ResponseGenerator::new(service(vec![]));
        let err = generator
            .generate("m", &[], "", &[], &CancellationToken::new(), &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::EmptyInput));
    }

    #[tokio::test]
    async fn cancelled_token_stops_generation() {
        let generator = ResponseGenerator::new(service(vec![Ok("never".to_string())]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = generator
            .generate("m", &[], "", &[Part::text("hi")], &cancel, &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Cancelled));
    }
}
