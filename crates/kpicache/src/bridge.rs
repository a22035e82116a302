// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Translation of domain events into cache tags.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ConfigError;

const SUPPORTED_VERSION: u32 = 1;

/// Maps `(source, event_type)` pairs to the tags they invalidate.
///
/// Tag templates may reference event attributes as `{name}`. A rule whose
/// source is `*` matches events from any source.
///
/// # Examples
///
/// ```
/// use kpicache::EventMappingTable;
///
/// let table = EventMappingTable::from_json(
///     r#"{
///         "version": 1,
///         "rules": [
///             { "source": "etl", "event_type": "leads_updated", "tags": ["leads", "dealership_{dealership_id}"] }
///         ]
///     }"#,
/// )
/// .unwrap();
///
/// let tags = table.tags_for("etl", "leads_updated", &serde_json::json!({ "dealership_id": 42 }));
/// assert_eq!(tags, ["leads", "dealership_42"]);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMappingTable {
    /// Format version; only `1` is understood.
    pub version: u32,
    /// Rules, evaluated in order.
    pub rules: Vec<EventRule>,
}

/// One row of an [`EventMappingTable`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRule {
    /// Event source, or `*` for any.
    pub source: String,
    /// Event type.
    pub event_type: String,
    /// Tag templates.
    pub tags: Vec<String>,
}

impl EventRule {
    /// Creates a rule.
    pub fn new<I, T>(source: impl Into<String>, event_type: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            source: source.into(),
            event_type: event_type.into(),
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, source: &str, event_type: &str) -> bool {
        (self.source == "*" || self.source == source) && self.event_type == event_type
    }
}

impl Default for EventMappingTable {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            rules: vec![
                EventRule::new("etl", "kpi_data_updated", ["kpi"]),
                EventRule::new("etl", "leads_updated", ["leads", "dealership_{dealership_id}"]),
                EventRule::new("crm", "record_updated", ["dealership_{dealership_id}"]),
            ],
        }
    }
}

impl EventMappingTable {
    /// Creates a version 1 table from rules.
    ///
    /// # Errors
    ///
    /// Returns an error if a tag template is malformed.
    pub fn new(rules: Vec<EventRule>) -> Result<Self, ConfigError> {
        let table = Self {
            version: SUPPORTED_VERSION,
            rules,
        };
        table.validate()?;
        Ok(table)
    }

    /// Parses and validates a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed, the version is not `1`, or a
    /// tag template is malformed.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let table: Self = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    /// Checks the version and every template.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.version));
        }
        for template in self.rules.iter().flat_map(|rule| &rule.tags) {
            parse(template).map_err(|reason| ConfigError::InvalidTemplate {
                template: template.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Renders the tags for an event.
    ///
    /// Templates referencing an attribute that is missing, null or not a
    /// scalar are skipped with a warning. Unknown events yield no tags.
    #[must_use]
    pub fn tags_for(&self, source: &str, event_type: &str, attributes: &Value) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        let mut matched = false;

        for rule in self.rules.iter().filter(|rule| rule.matches(source, event_type)) {
            matched = true;
            for template in &rule.tags {
                match render(template, attributes) {
                    Ok(tag) => {
                        if !tags.contains(&tag) {
                            tags.push(tag);
                        }
                    }
                    Err(missing) => {
                        tracing::warn!(source, event_type, template = template.as_str(), attribute = missing, "event is missing a template attribute, tag skipped");
                    }
                }
            }
        }

        if !matched {
            tracing::info!(source, event_type, "no invalidation rule for event, ignored");
        }
        tags
    }
}

/// Holds the active mapping table and allows it to be replaced at runtime.
#[derive(Debug, Default)]
pub(crate) struct InvalidationBridge {
    table: RwLock<EventMappingTable>,
}

impl InvalidationBridge {
    pub fn new(table: EventMappingTable) -> Self {
        Self { table: RwLock::new(table) }
    }

    pub fn tags_for(&self, source: &str, event_type: &str, attributes: &Value) -> Vec<String> {
        self.table.read().tags_for(source, event_type, attributes)
    }

    pub fn replace(&self, table: EventMappingTable) {
        *self.table.write() = table;
    }

    pub fn table(&self) -> EventMappingTable {
        self.table.read().clone()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Attribute(&'a str),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, &'static str> {
    let mut segments = Vec::new();
    let mut rest = template;

    while !rest.is_empty() {
        match rest.find(|c: char| c == '{' || c == '}') {
            None => {
                segments.push(Segment::Literal(rest));
                break;
            }
            Some(index) if rest.as_bytes()[index] == b'}' => return Err("unmatched '}'"),
            Some(index) => {
                if index > 0 {
                    segments.push(Segment::Literal(&rest[..index]));
                }
                let after = &rest[index + 1..];
                let close = after.find('}').ok_or("unclosed '{'")?;
                let name = &after[..close];
                if name.is_empty() {
                    return Err("empty placeholder");
                }
                if name.contains('{') {
                    return Err("nested '{'");
                }
                segments.push(Segment::Attribute(name));
                rest = &after[close + 1..];
            }
        }
    }

    if segments.is_empty() {
        return Err("template is empty");
    }
    Ok(segments)
}

/// Renders `template`, or returns the name of the first unusable attribute.
fn render<'a>(template: &'a str, attributes: &Value) -> Result<String, &'a str> {
    // Unvalidated tables can reach here; unparsable templates render verbatim.
    let Ok(segments) = parse(template) else {
        return Ok(template.to_owned());
    };

    let mut tag = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => tag.push_str(text),
            Segment::Attribute(name) => match attributes.get(name) {
                Some(Value::String(text)) => tag.push_str(text),
                Some(value @ (Value::Number(_) | Value::Bool(_))) => tag.push_str(&value.to_string()),
                _ => return Err(name),
            },
        }
    }
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_table() {
        let table = EventMappingTable::default();
        table.validate().unwrap();

        assert_eq!(table.tags_for("etl", "kpi_data_updated", &json!({})), ["kpi"]);
        assert_eq!(
            table.tags_for("etl", "leads_updated", &json!({ "dealership_id": "7" })),
            ["leads", "dealership_7"]
        );
        assert_eq!(table.tags_for("crm", "record_updated", &json!({ "dealership_id": 3 })), ["dealership_3"]);
    }

    #[test]
    fn unknown_event_yields_nothing() {
        let table = EventMappingTable::default();
        assert!(table.tags_for("billing", "invoice_paid", &json!({})).is_empty());
        assert!(table.tags_for("crm", "kpi_data_updated", &json!({})).is_empty());
    }

    #[test]
    fn missing_attribute_skips_only_that_template() {
        let table = EventMappingTable::default();
        assert_eq!(table.tags_for("etl", "leads_updated", &json!({})), ["leads"]);
        assert_eq!(table.tags_for("etl", "leads_updated", &json!({ "dealership_id": null })), ["leads"]);
        assert_eq!(table.tags_for("etl", "leads_updated", &json!("not an object")), ["leads"]);
    }

    #[test]
    fn wildcard_source_and_deduplication() {
        let table = EventMappingTable::new(vec![
            EventRule::new("*", "tenant_reset", ["dealership_{id}", "kpi"]),
            EventRule::new("admin", "tenant_reset", ["kpi", "{id}_{region}"]),
        ])
        .unwrap();

        assert_eq!(table.tags_for("crm", "tenant_reset", &json!({ "id": 1 })), ["dealership_1", "kpi"]);
        assert_eq!(
            table.tags_for("admin", "tenant_reset", &json!({ "id": 1, "region": "eu" })),
            ["dealership_1", "kpi", "1_eu"]
        );
    }

    #[test]
    fn rejects_unsupported_version() {
        let error = EventMappingTable::from_json(r#"{ "version": 2, "rules": [] }"#).unwrap_err();
        assert!(matches!(error, ConfigError::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_malformed_templates() {
        for template in ["dealership_{id", "dealership_}", "{}", "{a{b}", ""] {
            let error = EventMappingTable::new(vec![EventRule::new("etl", "x", [template])]).unwrap_err();
            assert!(
                matches!(error, ConfigError::InvalidTemplate { .. }),
                "template {template:?} should be rejected, got {error:?}"
            );
        }
    }

    #[test]
    fn round_trips_through_json() {
        let json = serde_json::to_string(&EventMappingTable::default()).unwrap();
        assert_eq!(EventMappingTable::from_json(&json).unwrap(), EventMappingTable::default());
    }

    #[test]
    fn parse_segments() {
        assert_eq!(
            parse("a_{b}_c").unwrap(),
            [Segment::Literal("a_"), Segment::Attribute("b"), Segment::Literal("_c")]
        );
        assert_eq!(parse("{x}").unwrap(), [Segment::Attribute("x")]);
    }

    #[test]
    fn bridge_replaces_table() {
        let bridge = InvalidationBridge::new(EventMappingTable::default());
        assert_eq!(bridge.tags_for("etl", "kpi_data_updated", &json!({})), ["kpi"]);

        bridge.replace(EventMappingTable::new(vec![EventRule::new("etl", "kpi_data_updated", ["all_kpis"])]).unwrap());
        assert_eq!(bridge.tags_for("etl", "kpi_data_updated", &json!({})), ["all_kpis"]);
        assert_eq!(bridge.table().rules.len(), 1);
    }
}
