use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::page::Page;

/// Staleness/priority policy for re-running the extract stage.
///
/// A page's effective age is its time since last processing, discounted by
/// popularity: each inbound link subtracts `hours_per_link` hours, so
/// heavily-linked pages stale out more slowly. All constants come from
/// configuration, never hard-coded call sites.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecrawlConfig {
    /// Hours of age forgiven per inbound link.
    pub hours_per_link: f64,
    /// Effective age beyond which a page needs recrawling.
    pub max_interval_hours: f64,
    /// Floor preventing thrash on pages processed moments ago.
    pub min_interval_minutes: f64,
}

impl Default for RecrawlConfig {
    fn default() -> Self {
        Self {
            hours_per_link: 1.0,
            max_interval_hours: 24.0,
            min_interval_minutes: 5.0,
        }
    }
}

impl RecrawlConfig {
    /// Age in hours discounted by popularity. `None` means never processed,
    /// which ranks above any finite age.
    pub fn effective_age_hours(&self, page: &Page, now: DateTime<Utc>) -> Option<f64> {
        let last = page.last_processed_at?;
        let hours_since = (now - last).num_seconds() as f64 / 3600.0;
        Some(hours_since - page.inbound_links_count as f64 * self.hours_per_link)
    }

    /// Whether the page is due for another crawl.
    pub fn needs_recrawl(&self, page: &Page, now: DateTime<Utc>) -> bool {
        let Some(last) = page.last_processed_at else {
            return true;
        };
        let hours_since = (now - last).num_seconds() as f64 / 3600.0;
        let effective_age = hours_since - page.inbound_links_count as f64 * self.hours_per_link;
        effective_age > self.max_interval_hours && hours_since >= self.min_interval_minutes / 60.0
    }

    /// Ordering for candidate selection: never-processed pages first, then
    /// descending effective age. `Less` means `a` runs before `b`.
    pub fn cmp_priority(&self, a: &Page, b: &Page, now: DateTime<Utc>) -> Ordering {
        match (
            self.effective_age_hours(a, now),
            self.effective_age_hours(b, now),
        ) {
            (None, None) => a.id.cmp(&b.id),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(age_a), Some(age_b)) => {
                age_b.partial_cmp(&age_a).unwrap_or(Ordering::Equal)
            }
        }
    }
}
