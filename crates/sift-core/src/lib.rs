pub mod batch;
pub mod engine;
pub mod error;
pub mod json_recovery;
pub mod lock;
pub mod page;
pub mod recrawl;
pub mod selector;
pub mod stage;
pub mod testutil;
pub mod traits;

pub use batch::{BatchOptions, BatchRunner, BatchSummary};
pub use engine::{ExtractionRetryEngine, RetryPolicy, StageOutcome};
pub use error::StageError;
pub use page::{Page, StageOutput};
pub use recrawl::RecrawlConfig;
pub use stage::Stage;
