//! Structured records and the payload parser interface

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::consumer::error::{ConsumerError, ConsumerResult};

/// A structured record produced from a message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Measurement name
    pub name: String,
    /// String-valued dimensions
    pub tags: BTreeMap<String, String>,
    /// Values
    pub fields: Map<String, Value>,
    /// Event time, if the payload carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    /// Create an empty record
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: Map::new(),
            timestamp: None,
        }
    }

    /// Set a tag, replacing any previous value
    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Set a field, replacing any previous value
    pub fn add_field(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }
}

/// Turns a payload into zero or more records
pub trait RecordParser: Send + Sync + Debug + 'static {
    /// Parse a payload
    fn parse(&self, payload: &[u8]) -> ConsumerResult<Vec<Record>>;

    /// Get parser name for logs
    fn name(&self) -> &str {
        "RecordParser"
    }
}

/// JSON payload parser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonParserConfig {
    /// Record name used when `name_key` is unset or missing
    pub name: String,
    /// Top-level key whose value becomes the record name
    pub name_key: Option<String>,
    /// Top-level keys moved from fields to tags
    pub tag_keys: Vec<String>,
    /// Top-level key holding the event time (RFC 3339 string or epoch milliseconds)
    pub time_key: Option<String>,
}

impl Default for JsonParserConfig {
    fn default() -> Self {
        Self {
            name: "kafka_consumer".to_string(),
            name_key: None,
            tag_keys: Vec::new(),
            time_key: None,
        }
    }
}

/// Parses a JSON object into one record, or a JSON array of objects into one
/// record per element
#[derive(Debug, Clone, Default)]
pub struct JsonParser {
    config: JsonParserConfig,
}

impl JsonParser {
    /// Create a parser
    pub fn new(config: JsonParserConfig) -> Self {
        Self { config }
    }

    fn record_from_object(&self, mut object: Map<String, Value>) -> ConsumerResult<Record> {
        let name = self
            .config
            .name_key
            .as_ref()
            .and_then(|key| object.remove(key))
            .and_then(|value| match value {
                Value::String(s) => Some(s),
                _ => None,
            })
            .unwrap_or_else(|| self.config.name.clone());

        let mut record = Record::new(name);

        if let Some(time_key) = &self.config.time_key {
            if let Some(value) = object.remove(time_key) {
                record.timestamp = Some(parse_timestamp(&value)?);
            }
        }

        for key in &self.config.tag_keys {
            if let Some(value) = object.remove(key) {
                match value {
                    Value::String(s) => record.add_tag(key.clone(), s),
                    Value::Number(n) => record.add_tag(key.clone(), n.to_string()),
                    Value::Bool(b) => record.add_tag(key.clone(), b.to_string()),
                    Value::Null => {}
                    other => {
                        return Err(ConsumerError::ParseError(format!(
                            "tag key '{}' holds a non-scalar value: {}",
                            key, other
                        )))
                    }
                }
            }
        }

        record.fields = object;
        Ok(record)
    }
}

impl RecordParser for JsonParser {
    fn parse(&self, payload: &[u8]) -> ConsumerResult<Vec<Record>> {
        let json: Value = serde_json::from_slice(payload)
            .map_err(|e| ConsumerError::ParseError(format!("JSON parse error: {}", e)))?;

        match json {
            Value::Object(object) => Ok(vec![self.record_from_object(object)?]),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(object) => self.record_from_object(object),
                    other => Err(ConsumerError::ParseError(format!(
                        "expected JSON object in array, found {}",
                        json_kind(&other)
                    ))),
                })
                .collect(),
            other => Err(ConsumerError::ParseError(format!(
                "expected JSON object or array, found {}",
                json_kind(&other)
            ))),
        }
    }

    fn name(&self) -> &str {
        "json"
    }
}

fn parse_timestamp(value: &Value) -> ConsumerResult<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ConsumerError::ParseError(format!("invalid timestamp '{}': {}", s, e))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(|| ConsumerError::ParseError(format!("invalid epoch timestamp {}", n))),
        other => Err(ConsumerError::ParseError(format!(
            "timestamp must be a string or number, found {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
