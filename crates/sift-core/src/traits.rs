use std::future::Future;
use std::time::Duration;

use crate::error::StageError;
use crate::page::{Page, StageOutput};
use crate::selector::CandidateQuery;

/// One generator request: a stage prompt plus the candidate's context.
#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    pub system_prompt: &'a str,
    pub user_content: &'a str,
    /// Reference to a stored page image, for vision stages.
    pub image_ref: Option<&'a str>,
}

/// The three outcome shapes of a generator call.
///
/// `Api` with `status: None` means the reply carried no HTTP status at all
/// (unreachable/DNS/timeout wrapped by a middle layer) and is treated like
/// `Transport`: fatal for the whole batch.
#[derive(Debug, Clone)]
pub enum GeneratorOutcome {
    Content(String),
    Api {
        status: Option<u16>,
        message: String,
        body: String,
    },
    Transport(String),
}

/// External text/vision generation service. Opaque beyond the three-outcome
/// contract above; never returns an error the caller must unwrap.
pub trait Generator: Send + Sync + Clone {
    fn generate(
        &self,
        request: GenerateRequest<'_>,
    ) -> impl Future<Output = GeneratorOutcome> + Send;
}

/// Read/write access to the page store.
pub trait PageStore: Send + Sync + Clone {
    /// First eligible page under the query's ordering, or `None` when the
    /// stage has no remaining candidates.
    fn next_candidate(
        &self,
        query: &CandidateQuery,
    ) -> impl Future<Output = Result<Option<Page>, StageError>> + Send;

    fn get_page(&self, id: i64)
    -> impl Future<Output = Result<Option<Page>, StageError>> + Send;

    /// Persist stage output fields, the stage completion timestamp, and
    /// `last_processed_at` as one atomic update. Never a partial write.
    fn complete_stage(
        &self,
        page_id: i64,
        output: &StageOutput,
    ) -> impl Future<Output = Result<(), StageError>> + Send;
}

/// Injected backoff sleep, so tests can count sleeps instead of waiting.
pub trait Sleeper: Send + Sync + Clone {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
