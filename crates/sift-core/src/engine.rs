use std::time::Duration;

use crate::batch::{BatchEvent, BatchReporter};
use crate::error::StageError;
use crate::json_recovery;
use crate::page::{Page, StageOutput};
use crate::stage::Stage;
use crate::traits::{GenerateRequest, Generator, GeneratorOutcome, PageStore, Sleeper};

/// Retry policy for one candidate: bounded attempts with a constant
/// backoff unit between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Terminal state of one candidate run.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// Output persisted; `attempts` includes the successful one.
    Completed { attempts: u32 },
    /// All attempts consumed; nothing was written. Batch continues.
    Exhausted { attempts: u32, last_error: StageError },
    /// Dependency outage (or a broken store). Aborts the whole batch.
    Fatal(StageError),
    /// The page is missing this stage's input. The selector normally
    /// filters these out; nothing is attempted and nothing is recorded
    /// as a failure.
    NotEligible,
}

/// Drives one candidate through request → validate → persist.
///
/// The generator, page store, and backoff sleep are injected, following the
/// same dependency-injection shape as the rest of the pipeline.
#[derive(Clone)]
pub struct ExtractionRetryEngine<G, S, SL>
where
    G: Generator,
    S: PageStore,
    SL: Sleeper,
{
    generator: G,
    store: S,
    sleeper: SL,
    policy: RetryPolicy,
}

impl<G, S, SL> ExtractionRetryEngine<G, S, SL>
where
    G: Generator,
    S: PageStore,
    SL: Sleeper,
{
    pub fn new(generator: G, store: S, sleeper: SL, policy: RetryPolicy) -> Self {
        Self {
            generator,
            store,
            sleeper,
            policy,
        }
    }

    /// Run the state machine for one candidate.
    ///
    /// Loops `Requesting → Validating` up to `max_attempts`, sleeping the
    /// backoff unit between attempts. A transport-level failure (or an API
    /// error with no HTTP status) short-circuits to [`StageOutcome::Fatal`]
    /// with no backoff sleep, so a downed dependency is not hammered.
    pub async fn run<R: BatchReporter>(
        &self,
        page: &Page,
        stage: Stage,
        reporter: &R,
    ) -> StageOutcome {
        if !stage.generator_driven() {
            return StageOutcome::Fatal(StageError::ConfigError(format!(
                "stage {stage} is not generator-driven"
            )));
        }
        let Some(user_content) = stage.user_content(page) else {
            return StageOutcome::NotEligible;
        };

        let mut attempt = 1u32;
        loop {
            reporter.report(BatchEvent::AttemptStarted {
                page_id: page.id,
                stage,
                attempt,
            });

            let outcome = self
                .generator
                .generate(GenerateRequest {
                    system_prompt: stage.system_prompt(),
                    user_content: &user_content,
                    image_ref: if stage.uses_image() {
                        page.image_ref.as_deref()
                    } else {
                        None
                    },
                })
                .await;

            let attempt_result = match outcome {
                GeneratorOutcome::Transport(message) => {
                    Err(StageError::TransportUnavailable(message))
                }
                GeneratorOutcome::Api {
                    status: None,
                    message,
                    ..
                } => Err(StageError::TransportUnavailable(message)),
                GeneratorOutcome::Api {
                    status: Some(status),
                    message,
                    ..
                } => Err(StageError::HttpError { status, message }),
                GeneratorOutcome::Content(text) if text.trim().is_empty() => {
                    Err(StageError::EmptyResponse)
                }
                GeneratorOutcome::Content(text) => validate(stage, &text),
            };

            match attempt_result {
                Ok(output) => {
                    if let Err(e) = self.store.complete_stage(page.id, &output).await {
                        // A broken store fails every later candidate too.
                        return StageOutcome::Fatal(e);
                    }
                    reporter.report(BatchEvent::StageCompleted {
                        page_id: page.id,
                        stage,
                        attempts: attempt,
                    });
                    return StageOutcome::Completed { attempts: attempt };
                }
                Err(error) => {
                    reporter.report(BatchEvent::AttemptFailed {
                        page_id: page.id,
                        stage,
                        attempt,
                        error: &error,
                    });
                    if error.is_fatal() {
                        return StageOutcome::Fatal(error);
                    }
                    if attempt >= self.policy.max_attempts {
                        return StageOutcome::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        };
                    }
                    self.sleeper.sleep(self.policy.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Parse generator text and coerce it into the stage's output shape.
///
/// "Valid JSON, wrong shape" and "invalid JSON" are the same kind of
/// failure here: retryable.
fn validate(stage: Stage, text: &str) -> Result<StageOutput, StageError> {
    let Some(value) = json_recovery::parse(text) else {
        return Err(StageError::InvalidJson);
    };
    let Some(object) = value.as_object() else {
        return Err(StageError::ShapeError("response is not a JSON object".into()));
    };
    stage.output_from(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn engine(
        generator: MockGenerator,
        store: MemoryPageStore,
        sleeper: CountingSleeper,
        max_attempts: u32,
    ) -> ExtractionRetryEngine<MockGenerator, MemoryPageStore, CountingSleeper> {
        ExtractionRetryEngine::new(
            generator,
            store,
            sleeper,
            RetryPolicy {
                max_attempts,
                backoff: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_with_two_sleeps() {
        let generator = MockGenerator::with_outcomes(vec![
            GeneratorOutcome::Content("not json at all".into()),
            GeneratorOutcome::Content("still not json".into()),
            GeneratorOutcome::Content(r#"{"recap": "a fine summary"}"#.into()),
        ]);
        let store = MemoryPageStore::new(vec![make_test_page(1)]);
        let sleeper = CountingSleeper::new();
        let reporter = RecordingReporter::new();

        let page = make_test_page(1);
        let outcome = engine(generator, store.clone(), sleeper.clone(), 3)
            .run(&page, Stage::Recap, &reporter)
            .await;

        assert!(matches!(outcome, StageOutcome::Completed { attempts: 3 }));
        assert_eq!(sleeper.count(), 2);
        assert_eq!(store.completed().len(), 1);
        let updated = store.get(1).unwrap();
        assert_eq!(updated.recap.as_deref(), Some("a fine summary"));
        assert!(updated.recap_at.is_some());
        assert!(updated.last_processed_at.is_some());
    }

    #[tokio::test]
    async fn transport_failure_is_fatal_with_zero_sleeps() {
        let generator = MockGenerator::with_outcomes(vec![GeneratorOutcome::Transport(
            "dns lookup failed".into(),
        )]);
        let store = MemoryPageStore::new(vec![make_test_page(1)]);
        let sleeper = CountingSleeper::new();

        let page = make_test_page(1);
        let outcome = engine(generator, store.clone(), sleeper.clone(), 3)
            .run(&page, Stage::Recap, &RecordingReporter::new())
            .await;

        assert!(matches!(
            outcome,
            StageOutcome::Fatal(StageError::TransportUnavailable(_))
        ));
        assert_eq!(sleeper.count(), 0);
        assert!(store.completed().is_empty());
    }

    #[tokio::test]
    async fn api_error_without_status_is_fatal() {
        let generator = MockGenerator::with_outcomes(vec![GeneratorOutcome::Api {
            status: None,
            message: "socket hang up".into(),
            body: String::new(),
        }]);
        let store = MemoryPageStore::new(vec![make_test_page(1)]);

        let page = make_test_page(1);
        let outcome = engine(generator, store, CountingSleeper::new(), 3)
            .run(&page, Stage::Recap, &RecordingReporter::new())
            .await;

        assert!(matches!(
            outcome,
            StageOutcome::Fatal(StageError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn exhaustion_writes_nothing() {
        let generator = MockGenerator::with_outcomes(vec![
            GeneratorOutcome::Content("garbage".into()),
            GeneratorOutcome::Content("garbage".into()),
        ]);
        let store = MemoryPageStore::new(vec![make_test_page(1)]);
        let sleeper = CountingSleeper::new();

        let page = make_test_page(1);
        let outcome = engine(generator, store.clone(), sleeper.clone(), 2)
            .run(&page, Stage::Recap, &RecordingReporter::new())
            .await;

        match outcome {
            StageOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, StageError::InvalidJson);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(sleeper.count(), 1);
        assert!(store.completed().is_empty());
        assert!(store.get(1).unwrap().recap.is_none());
    }

    #[tokio::test]
    async fn store_write_failure_is_fatal() {
        let generator = MockGenerator::with_outcomes(vec![GeneratorOutcome::Content(
            r#"{"recap": "a fine summary"}"#.into(),
        )]);
        let store = MemoryPageStore::with_write_error(
            vec![make_test_page(1)],
            StageError::StoreError("connection reset".into()),
        );

        let page = make_test_page(1);
        let outcome = engine(generator, store.clone(), CountingSleeper::new(), 3)
            .run(&page, Stage::Recap, &RecordingReporter::new())
            .await;

        // A dead store would fail every later candidate too, so the batch
        // aborts instead of retrying.
        assert!(matches!(
            outcome,
            StageOutcome::Fatal(StageError::StoreError(_))
        ));
        assert!(store.completed().is_empty());
        assert!(store.get(1).unwrap().recap.is_none());
    }

    #[tokio::test]
    async fn http_error_and_empty_content_are_retried() {
        let generator = MockGenerator::with_outcomes(vec![
            GeneratorOutcome::Api {
                status: Some(503),
                message: "overloaded".into(),
                body: String::new(),
            },
            GeneratorOutcome::Content("   ".into()),
            GeneratorOutcome::Content(r#"{"recap": "third time lucky"}"#.into()),
        ]);
        let store = MemoryPageStore::new(vec![make_test_page(1)]);
        let sleeper = CountingSleeper::new();
        let reporter = RecordingReporter::new();

        let page = make_test_page(1);
        let outcome = engine(generator, store, sleeper.clone(), 3)
            .run(&page, Stage::Recap, &reporter)
            .await;

        assert!(matches!(outcome, StageOutcome::Completed { attempts: 3 }));
        assert_eq!(sleeper.count(), 2);
        assert_eq!(
            reporter.labels(),
            vec![
                "AttemptStarted",
                "AttemptFailed",
                "AttemptStarted",
                "AttemptFailed",
                "AttemptStarted",
                "StageCompleted",
            ]
        );
    }

    #[tokio::test]
    async fn wrong_shape_is_retryable_like_invalid_json() {
        let generator = MockGenerator::with_outcomes(vec![
            GeneratorOutcome::Content(r#"{"attributes": "not an object"}"#.into()),
            GeneratorOutcome::Content(r#"{"attributes": {"color": "red"}}"#.into()),
        ]);
        let mut page = make_test_page(1);
        page.categorized_at = Some(chrono::Utc::now());
        page.is_product = Some(true);
        let store = MemoryPageStore::new(vec![page.clone()]);

        let outcome = engine(generator, store.clone(), CountingSleeper::new(), 3)
            .run(&page, Stage::Attributes, &RecordingReporter::new())
            .await;

        assert!(matches!(outcome, StageOutcome::Completed { attempts: 2 }));
        assert_eq!(
            store.get(1).unwrap().attributes,
            Some(serde_json::json!({"color": "red"}))
        );
    }

    #[tokio::test]
    async fn missing_stage_input_is_not_an_attempt() {
        let generator = MockGenerator::with_outcomes(vec![]);
        let store = MemoryPageStore::new(vec![]);

        let mut page = make_test_page(1);
        page.content_text = None;
        let outcome = engine(generator.clone(), store, CountingSleeper::new(), 3)
            .run(&page, Stage::Recap, &RecordingReporter::new())
            .await;

        assert!(matches!(outcome, StageOutcome::NotEligible));
        assert_eq!(generator.calls(), 0);
    }
}
