use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StageError;
use crate::page::{Page, StageOutput, coerce_bool, normalize_text};

const EXTRACT_PROMPT: &str = "You are a page content extraction assistant. You are given a rendered screenshot of a web page. Respond ONLY with a JSON object of the form {\"content\": \"...\"} containing the readable text content of the page. Do not include explanations.";
const RECAP_PROMPT: &str = "You are a summarization assistant. Summarize the provided page content in a few sentences. Respond ONLY with a JSON object of the form {\"recap\": \"...\"}. Do not include explanations.";
const CATEGORIZE_PROMPT: &str = "You are a product classification assistant. Decide whether the provided page describes a product and, if so, its product type. Respond ONLY with a JSON object of the form {\"product_type\": \"...\", \"is_product\": true|false}. Do not include explanations.";
const ATTRIBUTES_PROMPT: &str = "You are a product data extraction assistant. Extract the product attributes mentioned in the provided page content. Respond ONLY with a JSON object of the form {\"attributes\": {\"name\": \"value\", ...}}. Do not include explanations.";

/// One step of the enrichment pipeline.
///
/// Each stage has its own lock namespace, eligibility rule, and output
/// fields. All stages except [`Stage::Embed`] are driven by the generator;
/// embedding is scheduled here but executed by an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Recap,
    Categorize,
    Attributes,
    Embed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Recap => "recap",
            Stage::Categorize => "categorize",
            Stage::Attributes => "attributes",
            Stage::Embed => "embed",
        }
    }

    /// True if the extraction retry engine can run this stage.
    pub fn generator_driven(&self) -> bool {
        !matches!(self, Stage::Embed)
    }

    /// Whether the generator request carries the page image.
    pub fn uses_image(&self) -> bool {
        matches!(self, Stage::Extract)
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Stage::Extract => EXTRACT_PROMPT,
            Stage::Recap => RECAP_PROMPT,
            Stage::Categorize => CATEGORIZE_PROMPT,
            Stage::Attributes => ATTRIBUTES_PROMPT,
            Stage::Embed => "",
        }
    }

    /// Keys that must be present in the recovered generator object.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            Stage::Extract => &["content"],
            Stage::Recap => &["recap"],
            Stage::Categorize => &["product_type"],
            Stage::Attributes => &["attributes"],
            Stage::Embed => &[],
        }
    }

    /// User-side content for the generator request.
    ///
    /// `None` means the page is missing this stage's input, which the
    /// candidate selector is supposed to have excluded already.
    pub fn user_content(&self, page: &Page) -> Option<String> {
        match self {
            Stage::Extract => page
                .image_ref
                .as_ref()
                .map(|_| format!("Extract the content of the page at {}", page.url)),
            Stage::Recap | Stage::Categorize | Stage::Attributes => {
                page.content_text.clone().filter(|t| !t.trim().is_empty())
            }
            Stage::Embed => None,
        }
    }

    /// Validate the recovered object and assemble the stage output,
    /// normalizing scalar fields along the way.
    ///
    /// Wrong-shaped required keys yield [`StageError::ShapeError`], which the
    /// retry engine treats exactly like invalid JSON.
    pub fn output_from(&self, object: &Map<String, Value>) -> Result<StageOutput, StageError> {
        match self {
            Stage::Extract => {
                let content = required_string(object, "content")?;
                Ok(StageOutput::Extract {
                    content_text: content,
                })
            }
            Stage::Recap => {
                let recap = required_string(object, "recap")?;
                Ok(StageOutput::Recap { recap })
            }
            Stage::Categorize => {
                let product_type = required_string(object, "product_type")?;
                let is_product = match object.get("is_product") {
                    None => true,
                    Some(v) => coerce_bool(v).ok_or_else(|| {
                        StageError::ShapeError(format!("is_product is not a boolean: {v}"))
                    })?,
                };
                Ok(StageOutput::Categorize {
                    product_type,
                    is_product,
                })
            }
            Stage::Attributes => match object.get("attributes") {
                Some(Value::Object(attrs)) => Ok(StageOutput::Attributes {
                    attributes: Value::Object(attrs.clone()),
                }),
                Some(other) => Err(StageError::ShapeError(format!(
                    "attributes is not an object: {other}"
                ))),
                None => Err(StageError::MissingKey("attributes".into())),
            },
            Stage::Embed => Err(StageError::ConfigError(
                "embed stage is not generator-driven".into(),
            )),
        }
    }
}

fn required_string(object: &Map<String, Value>, key: &str) -> Result<String, StageError> {
    match object.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(normalize_text(s)),
        Some(Value::String(_)) => Err(StageError::ShapeError(format!("{key} is empty"))),
        Some(other) => Err(StageError::ShapeError(format!(
            "{key} is not a string: {other}"
        ))),
        None => Err(StageError::MissingKey(key.into())),
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "extract" => Ok(Stage::Extract),
            "recap" => Ok(Stage::Recap),
            "categorize" => Ok(Stage::Categorize),
            "attributes" => Ok(Stage::Attributes),
            "embed" => Ok(Stage::Embed),
            _ => Err(format!("Unknown stage: {s}")),
        }
    }
}
