//! Mapping-driven record extraction
//!
//! An `Extractor` is compiled once per `PageMapping` and reused for every page
//! fetched with that mapping. Extraction happens in two steps: `extract`
//! parses the document, and `ParsedPage::records` walks the record containers
//! lazily, building one `Record` per container.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::config::{IdentityScope, PageMapping, RenderMode};
use crate::crawler::FetchResult;
use crate::dedup::{compute_content_hash, compute_identity_key};
use crate::extract::transform::{collapse_whitespace, Transform};
use crate::extract::{ExtractError, FieldDiagnostic, FieldValue, Record};
use crate::url::{host_key, resolve_link};
use crate::ConfigError;

#[derive(Debug, Clone)]
struct CompiledField {
    name: String,
    selector: Selector,
    attribute: Option<String>,
    transform: Transform,
}

#[derive(Debug, Clone)]
struct CompiledFollow {
    selector: Selector,
    mapping: String,
    priority: Option<u32>,
}

/// A link discovered through a mapping's follow rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLink {
    pub url: Url,
    pub mapping: String,
    pub priority: Option<u32>,
}

/// Compiled form of a `PageMapping`
#[derive(Debug, Clone)]
pub struct Extractor {
    mapping: String,
    render_mode: RenderMode,
    ready_selector: Option<String>,
    record_selector: Option<Selector>,
    fields: Vec<CompiledField>,
    identity_fields: Vec<String>,
    tracked_fields: Vec<String>,
    follow: Vec<CompiledFollow>,
    scope: IdentityScope,
}

impl Extractor {
    /// Compiles the selectors and transforms of `mapping`
    ///
    /// # Arguments
    ///
    /// * `mapping` - The page mapping to compile
    /// * `scope` - Whether identity keys include the source host
    ///
    /// # Returns
    ///
    /// * `Ok(Extractor)` - Ready to extract pages
    /// * `Err(ConfigError)` - A selector or pattern failed to compile
    pub fn from_mapping(mapping: &PageMapping, scope: IdentityScope) -> Result<Self, ConfigError> {
        let fields = mapping
            .fields
            .iter()
            .map(|field| {
                Ok(CompiledField {
                    name: field.name.clone(),
                    selector: compile_selector(&field.selector)?,
                    attribute: field.attribute.clone(),
                    transform: Transform::compile(field.transform.as_ref())?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let follow = mapping
            .follow
            .iter()
            .map(|rule| {
                Ok(CompiledFollow {
                    selector: compile_selector(&rule.selector)?,
                    mapping: rule.mapping.clone(),
                    priority: rule.priority,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let tracked_fields = if mapping.tracked_fields.is_empty() {
            mapping.fields.iter().map(|f| f.name.clone()).collect()
        } else {
            mapping.tracked_fields.clone()
        };

        Ok(Self {
            mapping: mapping.name.clone(),
            render_mode: mapping.render_mode,
            ready_selector: mapping.ready_selector.clone(),
            record_selector: mapping
                .record_selector
                .as_deref()
                .map(compile_selector)
                .transpose()?,
            fields,
            identity_fields: mapping.identity_fields.clone(),
            tracked_fields,
            follow,
            scope,
        })
    }

    pub fn render_mode(&self) -> RenderMode {
        self.render_mode
    }

    pub fn ready_selector(&self) -> Option<&str> {
        self.ready_selector.as_deref()
    }

    /// Parses a fetched document
    ///
    /// Fails with `MalformedDocument` only when the content cannot be treated
    /// as markup at all (a non-text content type or binary bytes). A page that
    /// matches none of the mapping's selectors is not an error; it simply
    /// yields no records.
    pub fn extract(&self, fetched: &FetchResult) -> Result<ParsedPage<'_>, ExtractError> {
        if let Some(content_type) = fetched.content_type.as_deref() {
            if !is_markup(content_type) {
                return Err(ExtractError::MalformedDocument {
                    url: fetched.url.to_string(),
                    reason: format!("content type '{}' is not markup", content_type),
                });
            }
        }

        if fetched.raw_content.contains(&0) {
            return Err(ExtractError::MalformedDocument {
                url: fetched.url.to_string(),
                reason: "body contains binary data".to_string(),
            });
        }

        let body = String::from_utf8_lossy(&fetched.raw_content);

        Ok(ParsedPage {
            extractor: self,
            document: Html::parse_document(&body),
            page_url: fetched.url.clone(),
            extracted_at: Utc::now(),
        })
    }
}

/// A parsed document bound to the extractor that will walk it
///
/// Holds a `scraper::Html`, so it must be consumed before the next `.await`
/// in async code.
pub struct ParsedPage<'a> {
    extractor: &'a Extractor,
    document: Html,
    page_url: Url,
    extracted_at: DateTime<Utc>,
}

impl<'a> ParsedPage<'a> {
    /// Lazily yields one record per container, in document order
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        let containers: Box<dyn Iterator<Item = ElementRef<'_>> + '_> =
            match &self.extractor.record_selector {
                Some(selector) => Box::new(self.document.select(selector)),
                None => Box::new(std::iter::once(self.document.root_element())),
            };

        containers.filter_map(move |container| self.build_record(container))
    }

    /// Links selected by the mapping's follow rules, resolved against the page URL
    pub fn follow_links(&self) -> Vec<DiscoveredLink> {
        let mut links = Vec::new();

        for rule in &self.extractor.follow {
            for element in self.document.select(&rule.selector) {
                if element.value().attr("download").is_some() {
                    continue;
                }
                let Some(href) = element.value().attr("href") else {
                    continue;
                };
                if let Some(url) = resolve_link(href, &self.page_url) {
                    links.push(DiscoveredLink {
                        url,
                        mapping: rule.mapping.clone(),
                        priority: rule.priority,
                    });
                }
            }
        }

        links
    }

    fn build_record(&self, container: ElementRef<'_>) -> Option<Record> {
        let extractor = self.extractor;
        let mut fields = BTreeMap::new();
        let mut diagnostics = Vec::new();

        for field in &extractor.fields {
            let raw = container.select(&field.selector).next().and_then(|el| {
                match &field.attribute {
                    Some(attr) => el.value().attr(attr).map(str::to_string),
                    None => Some(el.text().collect::<String>()),
                }
            });

            let value = match raw {
                None => FieldValue::Missing,
                Some(raw) => match field.transform.apply(&raw, &self.page_url) {
                    Ok(value) => value,
                    Err(message) => {
                        let raw = collapse_whitespace(&raw);
                        diagnostics.push(FieldDiagnostic {
                            field: field.name.clone(),
                            raw: raw.clone(),
                            message,
                        });
                        FieldValue::Unparsed(raw)
                    }
                },
            };

            fields.insert(field.name.clone(), value);
        }

        if fields.values().all(FieldValue::is_missing) {
            return None;
        }

        // without one usable identity value every such record would share a key
        let identified = extractor
            .identity_fields
            .iter()
            .any(|name| fields.get(name).is_some_and(FieldValue::is_parsed));
        if !identified {
            tracing::warn!(
                url = %self.page_url,
                mapping = %extractor.mapping,
                "Skipping record with no usable identity field"
            );
            return None;
        }

        let site = match extractor.scope {
            IdentityScope::Content => None,
            IdentityScope::Site => host_key(&self.page_url),
        };

        Some(Record {
            identity_key: compute_identity_key(&extractor.identity_fields, &fields, site.as_deref()),
            content_hash: compute_content_hash(&extractor.tracked_fields, &fields),
            mapping: extractor.mapping.clone(),
            fields,
            tracked_fields: extractor.tracked_fields.clone(),
            source_url: self.page_url.to_string(),
            extracted_at: self.extracted_at,
            diagnostics,
        })
    }
}

fn compile_selector(selector: &str) -> Result<Selector, ConfigError> {
    Selector::parse(selector).map_err(|e| ConfigError::InvalidSelector {
        selector: selector.to_string(),
        message: format!("{:?}", e),
    })
}

fn is_markup(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime.is_empty() || mime.starts_with("text/") || mime.contains("html") || mime.contains("xml")
}
