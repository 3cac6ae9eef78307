use chrono::{DateTime, Utc};

use crate::error::StageError;
use crate::page::Page;
use crate::recrawl::RecrawlConfig;
use crate::stage::Stage;
use crate::traits::PageStore;

/// Ordering applied when picking the next candidate.
#[derive(Debug, Clone)]
pub enum CandidateOrder {
    /// Ascending page id; the `after_id` cursor guarantees forward progress.
    IdAscending,
    /// Never-processed pages first, then descending effective age. Used by
    /// the extract stage; staleness also re-qualifies completed pages.
    RecrawlPriority(RecrawlConfig),
}

/// A per-stage eligibility + ordering query over the page store.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub stage: Stage,
    /// Cursor for [`CandidateOrder::IdAscending`]: only ids above this are
    /// considered, so lock-contended candidates are not re-scanned.
    pub after_id: i64,
    /// Ids already handled or skipped in this batch. This is how forward
    /// progress works under [`CandidateOrder::RecrawlPriority`], where an
    /// id cursor would be meaningless.
    pub exclude_ids: Vec<i64>,
    pub domain: Option<String>,
    /// Reprocess pages whose stage output is already present. Upstream
    /// input requirements are never bypassed.
    pub force: bool,
    pub order: CandidateOrder,
}

impl CandidateQuery {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            after_id: 0,
            exclude_ids: Vec::new(),
            domain: None,
            force: false,
            order: CandidateOrder::IdAscending,
        }
    }

    /// Full predicate: cursor, domain scope, and stage eligibility.
    ///
    /// This is the canonical eligibility definition; the SQL candidate
    /// query in the database layer mirrors it clause for clause.
    pub fn matches(&self, page: &Page, now: DateTime<Utc>) -> bool {
        if self.exclude_ids.contains(&page.id) {
            return false;
        }
        if matches!(self.order, CandidateOrder::IdAscending) && page.id <= self.after_id {
            return false;
        }
        if let Some(domain) = &self.domain {
            if &page.domain != domain {
                return false;
            }
        }
        is_eligible(page, self.stage, self.force, &self.order, now)
    }
}

/// Stage eligibility: upstream inputs present, this stage's output absent
/// (or bypassed), and stage-specific exclusion rules.
///
/// A page with missing upstream inputs is "not yet eligible" — it is never
/// handed out, and never surfaced as an attempt failure.
pub fn is_eligible(
    page: &Page,
    stage: Stage,
    force: bool,
    order: &CandidateOrder,
    now: DateTime<Utc>,
) -> bool {
    let output_wanted = force || page.completed_at(stage).is_none() || {
        match (stage, order) {
            (Stage::Extract, CandidateOrder::RecrawlPriority(config)) => {
                config.needs_recrawl(page, now)
            }
            _ => false,
        }
    };
    if !output_wanted {
        return false;
    }

    match stage {
        Stage::Extract => page.image_ref.is_some(),
        Stage::Recap | Stage::Categorize => has_content(page),
        // Only pages already categorized as products carry attributes.
        Stage::Attributes => {
            has_content(page) && page.categorized_at.is_some() && page.is_product == Some(true)
        }
        Stage::Embed => page.recap.as_deref().is_some_and(|r| !r.trim().is_empty()),
    }
}

fn has_content(page: &Page) -> bool {
    page.content_text
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty())
}

/// Per-stage candidate feed over a [`PageStore`].
#[derive(Clone)]
pub struct CandidateSelector<S: PageStore> {
    store: S,
}

impl<S: PageStore> CandidateSelector<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Next eligible page, or `None` when the stage is drained. `None` is
    /// distinct from "all candidates locked": lock contention is observed by
    /// the caller after selection, never here.
    pub async fn next(&self, query: &CandidateQuery) -> Result<Option<Page>, StageError> {
        self.store.next_candidate(query).await
    }

    /// Direct lookup for operator-requested single-page runs.
    pub async fn get(&self, page_id: i64) -> Result<Option<Page>, StageError> {
        self.store.get_page(page_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemoryPageStore, make_test_page};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn recap_requires_content_and_no_prior_output() {
        let query = CandidateQuery::new(Stage::Recap);

        let mut page = make_test_page(1);
        assert!(query.matches(&page, now()));

        page.recap = Some("done".into());
        page.recap_at = Some(now());
        assert!(!query.matches(&page, now()));

        let forced = CandidateQuery {
            force: true,
            ..CandidateQuery::new(Stage::Recap)
        };
        assert!(forced.matches(&page, now()));

        page.content_text = None;
        // force never bypasses missing upstream input
        assert!(!forced.matches(&page, now()));
    }

    #[test]
    fn attributes_excluded_for_non_products() {
        let query = CandidateQuery::new(Stage::Attributes);

        let mut page = make_test_page(1);
        page.categorized_at = Some(now());
        page.is_product = Some(true);
        assert!(query.matches(&page, now()));

        page.is_product = Some(false);
        assert!(!query.matches(&page, now()));

        page.is_product = None;
        assert!(!query.matches(&page, now()));
    }

    #[test]
    fn cursor_and_exclusions_apply() {
        let query = CandidateQuery {
            after_id: 5,
            exclude_ids: vec![7],
            ..CandidateQuery::new(Stage::Recap)
        };
        assert!(!query.matches(&make_test_page(4), now()));
        assert!(!query.matches(&make_test_page(7), now()));
        assert!(query.matches(&make_test_page(8), now()));
    }

    #[test]
    fn domain_scoping() {
        let query = CandidateQuery {
            domain: Some("shop.example".into()),
            ..CandidateQuery::new(Stage::Recap)
        };
        let mut page = make_test_page(1);
        page.domain = "other.example".into();
        assert!(!query.matches(&page, now()));
        page.domain = "shop.example".into();
        assert!(query.matches(&page, now()));
    }

    #[test]
    fn recrawl_order_requalifies_stale_extract() {
        let config = RecrawlConfig::default();
        let query = CandidateQuery {
            order: CandidateOrder::RecrawlPriority(config),
            ..CandidateQuery::new(Stage::Extract)
        };

        let mut page = make_test_page(1);
        page.extracted_at = Some(now());
        page.last_processed_at = Some(now() - chrono::Duration::hours(48));
        assert!(query.matches(&page, now()));

        page.last_processed_at = Some(now() - chrono::Duration::hours(1));
        assert!(!query.matches(&page, now()));
    }

    #[tokio::test]
    async fn selector_walks_ids_in_order() {
        let store = MemoryPageStore::new(vec![
            make_test_page(1),
            make_test_page(2),
            make_test_page(3),
        ]);
        let selector = CandidateSelector::new(store);

        let mut query = CandidateQuery::new(Stage::Recap);
        let first = selector.next(&query).await.unwrap().unwrap();
        assert_eq!(first.id, 1);

        query.after_id = first.id;
        let second = selector.next(&query).await.unwrap().unwrap();
        assert_eq!(second.id, 2);

        query.after_id = 3;
        assert!(selector.next(&query).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn selector_prefers_stalest_under_recrawl_order() {
        let mut fresh = make_test_page(1);
        fresh.image_ref = Some("img/1.png".into());
        fresh.extracted_at = Some(now());
        fresh.last_processed_at = Some(now() - chrono::Duration::hours(30));

        let mut staler = make_test_page(2);
        staler.image_ref = Some("img/2.png".into());
        staler.extracted_at = Some(now());
        staler.last_processed_at = Some(now() - chrono::Duration::hours(90));

        let store = MemoryPageStore::new(vec![fresh, staler]);
        let selector = CandidateSelector::new(store);

        let query = CandidateQuery {
            order: CandidateOrder::RecrawlPriority(RecrawlConfig::default()),
            ..CandidateQuery::new(Stage::Extract)
        };
        let picked = selector.next(&query).await.unwrap().unwrap();
        assert_eq!(picked.id, 2);
    }
}
