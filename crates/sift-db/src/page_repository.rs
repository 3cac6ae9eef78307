use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use sift_core::error::StageError;
use sift_core::page::{Page, StageOutput};
use sift_core::recrawl::RecrawlConfig;
use sift_core::selector::{CandidateOrder, CandidateQuery};
use sift_core::stage::Stage;
use sift_core::traits::PageStore;

/// PostgreSQL-backed page store.
///
/// The candidate SELECT mirrors the canonical eligibility predicate in
/// `sift_core::selector` clause for clause; stage completion is a single
/// UPDATE so a page is never partially written.
#[derive(Clone)]
pub struct PgPageStore {
    pool: Pool<Postgres>,
}

impl PgPageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct PageRow {
    id: i64,
    url: String,
    domain: String,
    image_ref: Option<String>,
    content_text: Option<String>,
    extracted_at: Option<DateTime<Utc>>,
    recap: Option<String>,
    recap_at: Option<DateTime<Utc>>,
    product_type: Option<String>,
    is_product: Option<bool>,
    categorized_at: Option<DateTime<Utc>>,
    attributes: Option<serde_json::Value>,
    attributes_at: Option<DateTime<Utc>>,
    embedded_at: Option<DateTime<Utc>>,
    inbound_links_count: i32,
    last_processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<PageRow> for Page {
    fn from(row: PageRow) -> Self {
        Page {
            id: row.id,
            url: row.url,
            domain: row.domain,
            image_ref: row.image_ref,
            content_text: row.content_text,
            extracted_at: row.extracted_at,
            recap: row.recap,
            recap_at: row.recap_at,
            product_type: row.product_type,
            is_product: row.is_product,
            categorized_at: row.categorized_at,
            attributes: row.attributes,
            attributes_at: row.attributes_at,
            embedded_at: row.embedded_at,
            inbound_links_count: row.inbound_links_count,
            last_processed_at: row.last_processed_at,
            created_at: row.created_at,
        }
    }
}

/// WHERE fragment for one stage's eligibility.
///
/// `$3` is the optional domain scope, `$4` the force flag. Upstream input
/// requirements are never bypassed by force, matching
/// `sift_core::selector::is_eligible`.
fn eligibility_sql(stage: Stage) -> &'static str {
    match stage {
        Stage::Extract => "image_ref IS NOT NULL AND ($4 OR extracted_at IS NULL)",
        Stage::Recap => "btrim(coalesce(content_text, '')) <> '' AND ($4 OR recap_at IS NULL)",
        Stage::Categorize => {
            "btrim(coalesce(content_text, '')) <> '' AND ($4 OR categorized_at IS NULL)"
        }
        Stage::Attributes => {
            "btrim(coalesce(content_text, '')) <> '' AND categorized_at IS NOT NULL \
             AND is_product = TRUE AND ($4 OR attributes_at IS NULL)"
        }
        Stage::Embed => "btrim(coalesce(recap, '')) <> '' AND ($4 OR embedded_at IS NULL)",
    }
}

/// Effective age in hours, popularity-discounted. `$4` is hours_per_link.
const EFFECTIVE_AGE_SQL: &str =
    "(EXTRACT(EPOCH FROM (NOW() - last_processed_at)) / 3600.0 - inbound_links_count * $4)";

impl PgPageStore {
    async fn next_by_id(&self, query: &CandidateQuery) -> Result<Option<Page>, StageError> {
        let sql = format!(
            r#"
            SELECT * FROM pages
            WHERE id > $1
              AND id <> ALL($2)
              AND ($3::text IS NULL OR domain = $3)
              AND {}
            ORDER BY id ASC
            LIMIT 1
            "#,
            eligibility_sql(query.stage)
        );

        let row = sqlx::query_as::<_, PageRow>(&sql)
            .bind(query.after_id)
            .bind(&query.exclude_ids)
            .bind(&query.domain)
            .bind(query.force)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StageError::StoreError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Recrawl-priority selection for the extract stage: staleness also
    /// re-qualifies completed pages, never-processed pages rank first, then
    /// descending effective age. The id cursor does not apply here; the
    /// exclusion list alone guarantees forward progress.
    async fn next_by_recrawl_priority(
        &self,
        query: &CandidateQuery,
        config: &RecrawlConfig,
    ) -> Result<Option<Page>, StageError> {
        let sql = format!(
            r#"
            SELECT * FROM pages
            WHERE id <> ALL($1)
              AND ($2::text IS NULL OR domain = $2)
              AND image_ref IS NOT NULL
              AND ($3 OR extracted_at IS NULL
                   OR last_processed_at IS NULL
                   OR ({age} > $5 AND NOW() - last_processed_at >= make_interval(secs => $6 * 60.0)))
            ORDER BY (last_processed_at IS NULL) DESC, {age} DESC
            LIMIT 1
            "#,
            age = EFFECTIVE_AGE_SQL
        );

        let row = sqlx::query_as::<_, PageRow>(&sql)
            .bind(&query.exclude_ids)
            .bind(&query.domain)
            .bind(query.force)
            .bind(config.hours_per_link)
            .bind(config.max_interval_hours)
            .bind(config.min_interval_minutes)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StageError::StoreError(e.to_string()))?;

        Ok(row.map(Into::into))
    }
}

impl PageStore for PgPageStore {
    async fn next_candidate(&self, query: &CandidateQuery) -> Result<Option<Page>, StageError> {
        match &query.order {
            CandidateOrder::IdAscending => self.next_by_id(query).await,
            CandidateOrder::RecrawlPriority(config) => {
                self.next_by_recrawl_priority(query, config).await
            }
        }
    }

    async fn get_page(&self, id: i64) -> Result<Option<Page>, StageError> {
        let row = sqlx::query_as::<_, PageRow>(r#"SELECT * FROM pages WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StageError::StoreError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn complete_stage(&self, page_id: i64, output: &StageOutput) -> Result<(), StageError> {
        let result = match output {
            StageOutput::Extract { content_text } => {
                sqlx::query(
                    r#"
                    UPDATE pages
                    SET content_text = $2, extracted_at = NOW(), last_processed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(page_id)
                .bind(content_text)
                .execute(&self.pool)
                .await
            }
            StageOutput::Recap { recap } => {
                sqlx::query(
                    r#"
                    UPDATE pages
                    SET recap = $2, recap_at = NOW(), last_processed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(page_id)
                .bind(recap)
                .execute(&self.pool)
                .await
            }
            StageOutput::Categorize {
                product_type,
                is_product,
            } => {
                sqlx::query(
                    r#"
                    UPDATE pages
                    SET product_type = $2, is_product = $3, categorized_at = NOW(),
                        last_processed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(page_id)
                .bind(product_type)
                .bind(is_product)
                .execute(&self.pool)
                .await
            }
            StageOutput::Attributes { attributes } => {
                sqlx::query(
                    r#"
                    UPDATE pages
                    SET attributes = $2, attributes_at = NOW(), last_processed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(page_id)
                .bind(attributes)
                .execute(&self.pool)
                .await
            }
        };

        let result = result.map_err(|e| StageError::StoreError(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StageError::StoreError(format!("no page {page_id}")));
        }
        Ok(())
    }
}
