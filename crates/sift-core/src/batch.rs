use crate::engine::{ExtractionRetryEngine, StageOutcome};
use crate::error::StageError;
use crate::lock::{LockStore, StageLockManager};
use crate::page::Page;
use crate::selector::{CandidateOrder, CandidateQuery, CandidateSelector};
use crate::stage::Stage;
use crate::traits::{Generator, PageStore, Sleeper};

/// Events emitted while a batch runs, for monitoring/logging.
#[derive(Debug)]
pub enum BatchEvent<'a> {
    BatchStarted {
        stage: Stage,
        limit: usize,
    },
    CandidateSelected {
        page: &'a Page,
        stage: Stage,
    },
    LockDenied {
        page_id: i64,
        stage: Stage,
    },
    AttemptStarted {
        page_id: i64,
        stage: Stage,
        attempt: u32,
    },
    AttemptFailed {
        page_id: i64,
        stage: Stage,
        attempt: u32,
        error: &'a StageError,
    },
    StageCompleted {
        page_id: i64,
        stage: Stage,
        attempts: u32,
    },
    CandidateExhausted {
        page_id: i64,
        stage: Stage,
        attempts: u32,
        error: &'a StageError,
    },
    CandidateIneligible {
        page_id: i64,
        stage: Stage,
    },
    BatchAborted {
        stage: Stage,
        error: &'a StageError,
    },
    BatchFinished {
        summary: &'a BatchSummary,
    },
}

/// Trait for receiving batch events (decoupled logging).
pub trait BatchReporter: Send + Sync {
    fn report(&self, event: BatchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl BatchReporter for TracingReporter {
    fn report(&self, event: BatchEvent<'_>) {
        match event {
            BatchEvent::BatchStarted { stage, limit } => {
                tracing::info!(%stage, %limit, "Batch started");
            }
            BatchEvent::CandidateSelected { page, stage } => {
                tracing::debug!(page_id = %page.id, url = %page.url, %stage, "Candidate selected");
            }
            BatchEvent::LockDenied { page_id, stage } => {
                tracing::debug!(%page_id, %stage, "Lock held elsewhere, skipping");
            }
            BatchEvent::AttemptStarted {
                page_id,
                stage,
                attempt,
            } => {
                tracing::debug!(%page_id, %stage, %attempt, "Attempt started");
            }
            BatchEvent::AttemptFailed {
                page_id,
                stage,
                attempt,
                error,
            } => {
                tracing::warn!(%page_id, %stage, %attempt, %error, "Attempt failed");
            }
            BatchEvent::StageCompleted {
                page_id,
                stage,
                attempts,
            } => {
                tracing::info!(%page_id, %stage, %attempts, "Stage completed");
            }
            BatchEvent::CandidateExhausted {
                page_id,
                stage,
                attempts,
                error,
            } => {
                tracing::warn!(%page_id, %stage, %attempts, %error, "Attempts exhausted");
            }
            BatchEvent::CandidateIneligible { page_id, stage } => {
                tracing::debug!(%page_id, %stage, "Page not eligible for stage");
            }
            BatchEvent::BatchAborted { stage, error } => {
                tracing::error!(%stage, %error, "Batch aborted");
            }
            BatchEvent::BatchFinished { summary } => {
                tracing::info!(
                    stage = %summary.stage,
                    succeeded = %summary.succeeded,
                    failed = %summary.failed,
                    skipped_locked = %summary.skipped_locked,
                    "Batch finished"
                );
            }
        }
    }
}

/// Invocation surface for one batch run of one stage.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub stage: Stage,
    /// Max candidates processed (skips do not count against it).
    pub limit: usize,
    pub domain: Option<String>,
    /// Process exactly this page, bypassing the selector.
    pub page_id: Option<i64>,
    pub force: bool,
    pub order: CandidateOrder,
}

impl BatchOptions {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            limit: 10,
            domain: None,
            page_id: None,
            force: false,
            order: CandidateOrder::IdAscending,
        }
    }
}

/// Result of a batch run. The exit signal is failure when any candidate
/// exhausted its attempts or the batch aborted on a fatal error.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub stage: Stage,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped_locked: u32,
    pub fatal: Option<StageError>,
}

impl BatchSummary {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            succeeded: 0,
            failed: 0,
            skipped_locked: 0,
            fatal: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.fatal.is_none()
    }
}

/// Runs one stage batch: candidate feed → stage lock → retry engine.
pub struct BatchRunner<G, S, L, SL>
where
    G: Generator,
    S: PageStore,
    L: LockStore,
    SL: Sleeper,
{
    engine: ExtractionRetryEngine<G, S, SL>,
    selector: CandidateSelector<S>,
    locks: StageLockManager<L>,
}

impl<G, S, L, SL> BatchRunner<G, S, L, SL>
where
    G: Generator,
    S: PageStore,
    L: LockStore,
    SL: Sleeper,
{
    pub fn new(
        engine: ExtractionRetryEngine<G, S, SL>,
        store: S,
        locks: StageLockManager<L>,
    ) -> Self {
        Self {
            engine,
            selector: CandidateSelector::new(store.clone()),
            locks,
        }
    }

    /// Run the batch to completion.
    ///
    /// Stops when `limit` candidates are processed, candidates are
    /// exhausted, or a fatal failure aborts the run. Lock contention never
    /// fails the batch; contended candidates are skipped and counted.
    pub async fn run<R: BatchReporter>(&self, options: &BatchOptions, reporter: &R) -> BatchSummary {
        let mut summary = BatchSummary::new(options.stage);
        reporter.report(BatchEvent::BatchStarted {
            stage: options.stage,
            limit: options.limit,
        });

        let mut query = CandidateQuery::new(options.stage);
        query.domain = options.domain.clone();
        query.force = options.force;
        query.order = options.order.clone();

        if let Some(page_id) = options.page_id {
            self.run_single(page_id, &query, reporter, &mut summary).await;
        } else {
            self.run_loop(options.limit, &mut query, reporter, &mut summary)
                .await;
        }

        reporter.report(BatchEvent::BatchFinished { summary: &summary });
        summary
    }

    /// Operator-requested single page: the selector is bypassed, the
    /// eligibility predicate and the stage lock are not.
    async fn run_single<R: BatchReporter>(
        &self,
        page_id: i64,
        query: &CandidateQuery,
        reporter: &R,
        summary: &mut BatchSummary,
    ) {
        let page = match self.selector.get(page_id).await {
            Ok(Some(page)) => page,
            Ok(None) => {
                summary.fatal = Some(StageError::ConfigError(format!(
                    "page {page_id} does not exist"
                )));
                return;
            }
            Err(e) => {
                summary.fatal = Some(e);
                return;
            }
        };
        if !query.matches(&page, chrono::Utc::now()) {
            reporter.report(BatchEvent::CandidateIneligible {
                page_id,
                stage: query.stage,
            });
            return;
        }
        self.process(&page, query.stage, reporter, summary).await;
    }

    async fn run_loop<R: BatchReporter>(
        &self,
        limit: usize,
        query: &mut CandidateQuery,
        reporter: &R,
        summary: &mut BatchSummary,
    ) {
        let mut processed = 0usize;
        while processed < limit {
            let page = match self.selector.next(query).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    reporter.report(BatchEvent::BatchAborted {
                        stage: query.stage,
                        error: &e,
                    });
                    summary.fatal = Some(e);
                    break;
                }
            };
            reporter.report(BatchEvent::CandidateSelected {
                page: &page,
                stage: query.stage,
            });

            // Never hand this id out again within the run, whether it gets
            // processed or skipped on contention.
            query.after_id = page.id;
            query.exclude_ids.push(page.id);

            if !self.process(&page, query.stage, reporter, summary).await {
                break;
            }
            // Skips (lock contention, ineligible) do not consume the limit.
            processed = (summary.succeeded + summary.failed) as usize;
        }
    }

    /// Lock, run the engine, release. Returns `false` when the batch must
    /// abort.
    async fn process<R: BatchReporter>(
        &self,
        page: &Page,
        stage: Stage,
        reporter: &R,
        summary: &mut BatchSummary,
    ) -> bool {
        match self.locks.acquire(page.id, stage).await {
            Ok(true) => {}
            Ok(false) => {
                reporter.report(BatchEvent::LockDenied {
                    page_id: page.id,
                    stage,
                });
                summary.skipped_locked += 1;
                return true;
            }
            Err(e) => {
                reporter.report(BatchEvent::BatchAborted {
                    stage,
                    error: &e,
                });
                summary.fatal = Some(e);
                return false;
            }
        }

        let outcome = self.engine.run(page, stage, reporter).await;

        if let Err(e) = self.locks.release(page.id, stage).await {
            tracing::error!(page_id = %page.id, %stage, error = %e, "Failed to release stage lock");
        }

        match outcome {
            StageOutcome::Completed { .. } => {
                summary.succeeded += 1;
                true
            }
            StageOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                reporter.report(BatchEvent::CandidateExhausted {
                    page_id: page.id,
                    stage,
                    attempts,
                    error: &last_error,
                });
                summary.failed += 1;
                true
            }
            StageOutcome::Fatal(error) => {
                reporter.report(BatchEvent::BatchAborted {
                    stage,
                    error: &error,
                });
                summary.fatal = Some(error);
                false
            }
            StageOutcome::NotEligible => {
                reporter.report(BatchEvent::CandidateIneligible {
                    page_id: page.id,
                    stage,
                });
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::RetryPolicy;
    use crate::lock::MemoryLockStore;
    use crate::testutil::*;
    use crate::traits::GeneratorOutcome;

    const LOCK_TTL: Duration = Duration::from_secs(60);

    fn runner(
        generator: MockGenerator,
        store: MemoryPageStore,
        locks: StageLockManager<MemoryLockStore>,
        max_attempts: u32,
    ) -> BatchRunner<MockGenerator, MemoryPageStore, MemoryLockStore, CountingSleeper> {
        let engine = ExtractionRetryEngine::new(
            generator,
            store.clone(),
            CountingSleeper::new(),
            RetryPolicy {
                max_attempts,
                backoff: Duration::from_millis(1),
            },
        );
        BatchRunner::new(engine, store, locks)
    }

    fn recap_reply(text: &str) -> GeneratorOutcome {
        GeneratorOutcome::Content(format!(r#"{{"recap": "{text}"}}"#))
    }

    #[tokio::test]
    async fn processes_candidates_up_to_limit() {
        let store = MemoryPageStore::new(vec![
            make_test_page(1),
            make_test_page(2),
            make_test_page(3),
        ]);
        let generator =
            MockGenerator::with_outcomes(vec![recap_reply("one"), recap_reply("two")]);
        let locks = StageLockManager::new(MemoryLockStore::new(), LOCK_TTL);

        let options = BatchOptions {
            limit: 2,
            ..BatchOptions::new(Stage::Recap)
        };
        let summary = runner(generator, store.clone(), locks, 3)
            .run(&options, &RecordingReporter::new())
            .await;

        assert!(summary.is_success());
        assert_eq!(summary.succeeded, 2);
        assert_eq!(store.completed().len(), 2);
        // The third page was never touched.
        assert!(store.get(3).unwrap().recap.is_none());
    }

    #[tokio::test]
    async fn locked_candidate_is_skipped_not_failed() {
        let store = MemoryPageStore::new(vec![make_test_page(1), make_test_page(2)]);
        let generator = MockGenerator::with_outcomes(vec![recap_reply("two")]);
        let lock_store = MemoryLockStore::new();
        let locks = StageLockManager::new(lock_store.clone(), LOCK_TTL);

        // Another worker holds page 1's recap lock.
        assert!(locks.acquire(1, Stage::Recap).await.unwrap());

        let summary = runner(generator, store.clone(), locks.clone(), 3)
            .run(&BatchOptions::new(Stage::Recap), &RecordingReporter::new())
            .await;

        assert!(summary.is_success());
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped_locked, 1);
        assert!(store.get(1).unwrap().recap.is_none());
        assert_eq!(store.get(2).unwrap().recap.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn fatal_failure_aborts_without_consuming_later_candidates() {
        let store = MemoryPageStore::new(vec![make_test_page(1), make_test_page(2)]);
        let generator = MockGenerator::with_outcomes(vec![GeneratorOutcome::Transport(
            "connect refused".into(),
        )]);
        let locks = StageLockManager::new(MemoryLockStore::new(), LOCK_TTL);
        let reporter = RecordingReporter::new();

        let summary = runner(generator.clone(), store.clone(), locks, 3)
            .run(&BatchOptions::new(Stage::Recap), &reporter)
            .await;

        assert!(!summary.is_success());
        assert!(matches!(
            summary.fatal,
            Some(StageError::TransportUnavailable(_))
        ));
        // Only the failing candidate was ever attempted.
        assert_eq!(generator.calls(), 1);
        assert!(store.completed().is_empty());
        assert!(reporter.labels().contains(&"BatchAborted".to_string()));
    }

    #[tokio::test]
    async fn exhausted_candidate_fails_batch_but_later_candidates_run() {
        let store = MemoryPageStore::new(vec![make_test_page(1), make_test_page(2)]);
        let generator = MockGenerator::with_outcomes(vec![
            GeneratorOutcome::Content("garbage".into()),
            GeneratorOutcome::Content("garbage".into()),
            recap_reply("second page"),
        ]);
        let locks = StageLockManager::new(MemoryLockStore::new(), LOCK_TTL);

        let summary = runner(generator, store.clone(), locks, 2)
            .run(&BatchOptions::new(Stage::Recap), &RecordingReporter::new())
            .await;

        assert!(!summary.is_success());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        assert!(store.get(1).unwrap().recap.is_none());
        assert_eq!(store.get(2).unwrap().recap.as_deref(), Some("second page"));
    }

    #[tokio::test]
    async fn lock_released_after_processing() {
        let store = MemoryPageStore::new(vec![make_test_page(1)]);
        let generator = MockGenerator::with_outcomes(vec![recap_reply("done")]);
        let locks = StageLockManager::new(MemoryLockStore::new(), LOCK_TTL);

        runner(generator, store, locks.clone(), 3)
            .run(&BatchOptions::new(Stage::Recap), &RecordingReporter::new())
            .await;

        assert!(locks.acquire(1, Stage::Recap).await.unwrap());
    }

    #[tokio::test]
    async fn single_page_bypasses_selector_but_not_eligibility() {
        let mut done = make_test_page(5);
        done.recap = Some("already".into());
        done.recap_at = Some(chrono::Utc::now());
        let store = MemoryPageStore::new(vec![done]);
        let generator = MockGenerator::with_outcomes(vec![recap_reply("again")]);
        let locks = StageLockManager::new(MemoryLockStore::new(), LOCK_TTL);

        // Not forced: already-completed page is a no-op.
        let options = BatchOptions {
            page_id: Some(5),
            ..BatchOptions::new(Stage::Recap)
        };
        let summary = runner(generator.clone(), store.clone(), locks.clone(), 3)
            .run(&options, &RecordingReporter::new())
            .await;
        assert!(summary.is_success());
        assert_eq!(summary.succeeded, 0);
        assert_eq!(store.get(5).unwrap().recap.as_deref(), Some("already"));

        // Forced: reprocessed.
        let options = BatchOptions {
            page_id: Some(5),
            force: true,
            ..BatchOptions::new(Stage::Recap)
        };
        let summary = runner(generator, store.clone(), locks, 3)
            .run(&options, &RecordingReporter::new())
            .await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(store.get(5).unwrap().recap.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn missing_single_page_is_a_config_failure() {
        let store = MemoryPageStore::new(vec![]);
        let generator = MockGenerator::with_outcomes(vec![]);
        let locks = StageLockManager::new(MemoryLockStore::new(), LOCK_TTL);

        let options = BatchOptions {
            page_id: Some(99),
            ..BatchOptions::new(Stage::Recap)
        };
        let summary = runner(generator, store, locks, 3)
            .run(&options, &RecordingReporter::new())
            .await;
        assert!(!summary.is_success());
        assert!(matches!(summary.fatal, Some(StageError::ConfigError(_))));
    }
}
