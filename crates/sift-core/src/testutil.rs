//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability, allowing test assertions on
//! recorded calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::batch::{BatchEvent, BatchReporter};
use crate::error::StageError;
use crate::page::{Page, StageOutput};
use crate::selector::{CandidateOrder, CandidateQuery};
use crate::traits::{GenerateRequest, Generator, GeneratorOutcome, PageStore, Sleeper};

// ---------------------------------------------------------------------------
// MockGenerator
// ---------------------------------------------------------------------------

/// Mock generator that replays a scripted sequence of outcomes.
#[derive(Clone)]
pub struct MockGenerator {
    /// Queue of outcomes. Each call pops the first element; an exhausted
    /// queue yields a transport failure so runaway loops fail loudly.
    outcomes: Arc<Mutex<Vec<GeneratorOutcome>>>,
    calls: Arc<Mutex<u32>>,
}

impl MockGenerator {
    pub fn with_outcomes(outcomes: Vec<GeneratorOutcome>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Number of generate calls observed.
    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl Generator for MockGenerator {
    async fn generate(&self, _request: GenerateRequest<'_>) -> GeneratorOutcome {
        *self.calls.lock().unwrap() += 1;
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            GeneratorOutcome::Transport("mock generator script exhausted".into())
        } else {
            outcomes.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryPageStore
// ---------------------------------------------------------------------------

/// In-memory page store sharing the canonical eligibility predicate with
/// the SQL implementation.
#[derive(Clone, Default)]
pub struct MemoryPageStore {
    pages: Arc<Mutex<Vec<Page>>>,
    /// `(page_id, output)` pairs, in completion order.
    completed: Arc<Mutex<Vec<(i64, StageOutput)>>>,
    fail_writes: Arc<Mutex<Option<StageError>>>,
}

impl MemoryPageStore {
    pub fn new(pages: Vec<Page>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(pages)),
            completed: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(Mutex::new(None)),
        }
    }

    /// Store whose next `complete_stage` returns the given error.
    pub fn with_write_error(pages: Vec<Page>, error: StageError) -> Self {
        let store = Self::new(pages);
        *store.fail_writes.lock().unwrap() = Some(error);
        store
    }

    pub fn get(&self, id: i64) -> Option<Page> {
        self.pages.lock().unwrap().iter().find(|p| p.id == id).cloned()
    }

    pub fn completed(&self) -> Vec<(i64, StageOutput)> {
        self.completed.lock().unwrap().clone()
    }
}

impl PageStore for MemoryPageStore {
    async fn next_candidate(&self, query: &CandidateQuery) -> Result<Option<Page>, StageError> {
        let now = Utc::now();
        let pages = self.pages.lock().unwrap();
        let mut matches: Vec<&Page> = pages.iter().filter(|p| query.matches(p, now)).collect();
        match &query.order {
            CandidateOrder::IdAscending => matches.sort_by_key(|p| p.id),
            CandidateOrder::RecrawlPriority(config) => {
                matches.sort_by(|a, b| config.cmp_priority(a, b, now));
            }
        }
        Ok(matches.first().map(|p| (*p).clone()))
    }

    async fn get_page(&self, id: i64) -> Result<Option<Page>, StageError> {
        Ok(self.get(id))
    }

    async fn complete_stage(&self, page_id: i64, output: &StageOutput) -> Result<(), StageError> {
        if let Some(e) = self.fail_writes.lock().unwrap().take() {
            return Err(e);
        }
        let mut pages = self.pages.lock().unwrap();
        let page = pages
            .iter_mut()
            .find(|p| p.id == page_id)
            .ok_or_else(|| StageError::StoreError(format!("no page {page_id}")))?;

        let now = Utc::now();
        match output {
            StageOutput::Extract { content_text } => {
                page.content_text = Some(content_text.clone());
                page.extracted_at = Some(now);
            }
            StageOutput::Recap { recap } => {
                page.recap = Some(recap.clone());
                page.recap_at = Some(now);
            }
            StageOutput::Categorize {
                product_type,
                is_product,
            } => {
                page.product_type = Some(product_type.clone());
                page.is_product = Some(*is_product);
                page.categorized_at = Some(now);
            }
            StageOutput::Attributes { attributes } => {
                page.attributes = Some(attributes.clone());
                page.attributes_at = Some(now);
            }
        }
        page.last_processed_at = Some(now);

        self.completed
            .lock()
            .unwrap()
            .push((page_id, output.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CountingSleeper
// ---------------------------------------------------------------------------

/// Sleeper that records requested sleeps and returns immediately.
#[derive(Clone, Default)]
pub struct CountingSleeper {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl CountingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.sleeps.lock().unwrap().len()
    }
}

impl Sleeper for CountingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that records event labels for assertions.
#[derive(Default)]
pub struct RecordingReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl BatchReporter for RecordingReporter {
    fn report(&self, event: BatchEvent<'_>) {
        let label = match &event {
            BatchEvent::BatchStarted { .. } => "BatchStarted",
            BatchEvent::CandidateSelected { .. } => "CandidateSelected",
            BatchEvent::LockDenied { .. } => "LockDenied",
            BatchEvent::AttemptStarted { .. } => "AttemptStarted",
            BatchEvent::AttemptFailed { .. } => "AttemptFailed",
            BatchEvent::StageCompleted { .. } => "StageCompleted",
            BatchEvent::CandidateExhausted { .. } => "CandidateExhausted",
            BatchEvent::CandidateIneligible { .. } => "CandidateIneligible",
            BatchEvent::BatchAborted { .. } => "BatchAborted",
            BatchEvent::BatchFinished { .. } => "BatchFinished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// A page with content and an image, no stage output yet.
pub fn make_test_page(id: i64) -> Page {
    Page {
        id,
        url: format!("https://shop.example/p/{id}"),
        domain: "shop.example".to_string(),
        image_ref: Some(format!("pages/{id}.png")),
        content_text: Some("Oak coffee table, 90x60cm, lacquered finish.".to_string()),
        extracted_at: None,
        recap: None,
        recap_at: None,
        product_type: None,
        is_product: None,
        categorized_at: None,
        attributes: None,
        attributes_at: None,
        embedded_at: None,
        inbound_links_count: 0,
        last_processed_at: None,
        created_at: Utc::now(),
    }
}
