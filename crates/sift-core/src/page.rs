use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Maximum length kept for generator-produced scalar strings.
pub const MAX_TEXT_FIELD_LEN: usize = 4000;

/// A crawled page, the unit of work for every stage.
///
/// Owned by the page store; mutated only through
/// [`PageStore::complete_stage`](crate::traits::PageStore::complete_stage),
/// which writes the stage output and its completion timestamp together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: i64,
    pub url: String,
    pub domain: String,

    /// Screenshot or rendered-page reference consumed by the extract stage.
    pub image_ref: Option<String>,

    pub content_text: Option<String>,
    pub extracted_at: Option<DateTime<Utc>>,

    pub recap: Option<String>,
    pub recap_at: Option<DateTime<Utc>>,

    pub product_type: Option<String>,
    pub is_product: Option<bool>,
    pub categorized_at: Option<DateTime<Utc>>,

    pub attributes: Option<serde_json::Value>,
    pub attributes_at: Option<DateTime<Utc>>,

    pub embedded_at: Option<DateTime<Utc>>,

    pub inbound_links_count: i32,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Page {
    /// Completion timestamp for a stage, if set.
    pub fn completed_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Extract => self.extracted_at,
            Stage::Recap => self.recap_at,
            Stage::Categorize => self.categorized_at,
            Stage::Attributes => self.attributes_at,
            Stage::Embed => self.embedded_at,
        }
    }
}

/// Validated output of one successful stage attempt.
///
/// Persisted as a single atomic update together with the stage timestamp;
/// a page is never left partially written.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Extract {
        content_text: String,
    },
    Recap {
        recap: String,
    },
    Categorize {
        product_type: String,
        is_product: bool,
    },
    Attributes {
        attributes: serde_json::Value,
    },
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Extract { .. } => Stage::Extract,
            StageOutput::Recap { .. } => Stage::Recap,
            StageOutput::Categorize { .. } => Stage::Categorize,
            StageOutput::Attributes { .. } => Stage::Attributes,
        }
    }
}

/// Trim whitespace and cap a generator-produced string at
/// [`MAX_TEXT_FIELD_LEN`] characters.
pub fn normalize_text(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= MAX_TEXT_FIELD_LEN {
        trimmed.to_string()
    } else {
        trimmed.chars().take(MAX_TEXT_FIELD_LEN).collect()
    }
}

/// Coerce the loose boolean representations generators produce.
///
/// Accepts JSON booleans, 0/1 numbers, and the usual yes/no strings.
pub fn coerce_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_trims_and_caps() {
        assert_eq!(normalize_text("  hello  "), "hello");
        let long = "x".repeat(MAX_TEXT_FIELD_LEN + 100);
        assert_eq!(normalize_text(&long).chars().count(), MAX_TEXT_FIELD_LEN);
    }

    #[test]
    fn loose_booleans() {
        assert_eq!(coerce_bool(&json!(true)), Some(true));
        assert_eq!(coerce_bool(&json!("Yes")), Some(true));
        assert_eq!(coerce_bool(&json!("no")), Some(false));
        assert_eq!(coerce_bool(&json!(1)), Some(true));
        assert_eq!(coerce_bool(&json!(0)), Some(false));
        assert_eq!(coerce_bool(&json!("maybe")), None);
        assert_eq!(coerce_bool(&json!([true])), None);
    }

    #[test]
    fn output_reports_its_stage() {
        let out = StageOutput::Recap {
            recap: "short".into(),
        };
        assert_eq!(out.stage(), Stage::Recap);
    }
}
