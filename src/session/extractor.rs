//! Extractors turn one work item into records
//!
//! The engine knows nothing about what a page means. An [`Extractor`] drives
//! the worker's session to whatever the item's method requires and returns
//! the records it found. The built-in [`HttpExtractor`] fetches a templated URL
//! and emits one record describing the page.

use super::SessionManager;
use crate::config::TargetConfig;
use crate::{ConfigError, FetchError, FetchResult, WorkItem};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Acquires one work item through a session
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fetches `item` under its current method
    ///
    /// Errors are classified by the engine; returning the most specific
    /// [`FetchError`] variant keeps retries cheap.
    async fn fetch(&self, item: &WorkItem, session: &mut SessionManager) -> FetchResult<Vec<Value>>;
}

/// Fetches one URL per item and checks the page looks right
pub struct HttpExtractor {
    url_templates: BTreeMap<String, String>,
    expect_text: Option<String>,
    expect_selector: Option<Selector>,
}

impl HttpExtractor {
    pub fn new(target: &TargetConfig) -> Result<Self, ConfigError> {
        let expect_selector = target
            .expect_selector
            .as_deref()
            .map(|s| {
                Selector::parse(s).map_err(|e| {
                    ConfigError::Validation(format!("invalid expect_selector '{}': {:?}", s, e))
                })
            })
            .transpose()?;

        Ok(Self {
            url_templates: target.url_templates.clone(),
            expect_text: target.expect_text.clone(),
            expect_selector,
        })
    }

    /// URL for `item` under its current method, with the key percent-encoded
    pub fn url_for(&self, item: &WorkItem) -> FetchResult<String> {
        let template = self.url_templates.get(&item.method).ok_or_else(|| {
            FetchError::DataInvalid(format!("no url template for method '{}'", item.method))
        })?;
        let key: String = url::form_urlencoded::byte_serialize(item.key.as_bytes()).collect();
        Ok(template.replace("{key}", &key))
    }

    /// Checks a page body against the expected text and selector
    pub fn validate(&self, body: &str) -> FetchResult<()> {
        if let Some(text) = &self.expect_text {
            if !body.contains(text.as_str()) {
                return Err(FetchError::DataInvalid(format!(
                    "page does not contain '{}'",
                    text
                )));
            }
        }

        if let Some(selector) = &self.expect_selector {
            let document = Html::parse_document(body);
            if document.select(selector).next().is_none() {
                return Err(FetchError::DataInvalid(
                    "expected element not found".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn fetch(&self, item: &WorkItem, session: &mut SessionManager) -> FetchResult<Vec<Value>> {
        let url = self.url_for(item)?;
        let body = session
            .navigate_with_retry(&url, |body| self.validate(body))
            .await?;

        Ok(vec![json!({
            "url": url,
            "title": extract_title(&body),
            "bytes": body.len(),
        })])
    }
}

/// Extracts the page title from an HTML body
fn extract_title(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    let selector = Selector::parse("title").ok()?;

    document
        .select(&selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}
