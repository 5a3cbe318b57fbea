use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};


/// StateChangeEvent is one observed transition of a hub entity.
///
/// Built once by the hub adapter and never mutated afterwards. The display
/// fields (`friendly_name`, `device_class`, `unit_of_measurement`, `icon`)
/// are lifted out of the attribute map at construction and default to
/// empty strings when absent.
#[derive(Clone, Debug, PartialEq)]
pub struct StateChangeEvent {
    /// Full entity id in `domain.object_id` form (e.g., "sensor.kitchen_temp")
    pub entity_id: String,

    /// Prefix of `entity_id` before the first dot
    pub domain: String,

    /// New state string; `None` when the hub reported no state
    pub new_state: Option<String>,

    /// Previous state string; `None` for the first observation
    pub old_state: Option<String>,

    /// Numeric parse of `new_state`, 0 when not a finite number
    pub state_float: f64,

    /// When the pipeline observed the change
    pub timestamp: DateTime<Utc>,

    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,

    /// Arbitrary attribute mapping (opaque to the pipeline)
    pub attributes: Map<String, Value>,

    pub friendly_name: String,
    pub device_class: String,
    pub unit_of_measurement: String,
    pub icon: String,
}

impl StateChangeEvent {
    /// Build an event, deriving `domain`, `state_float` and the display fields.
    ///
    /// Never fails: an empty or dotless `entity_id` yields a domain equal to
    /// the whole id, and a non-numeric state yields `state_float == 0.0`.
    pub fn new(
        entity_id: impl Into<String>,
        new_state: Option<String>,
        old_state: Option<String>,
        last_changed: DateTime<Utc>,
        last_updated: DateTime<Utc>,
        attributes: Map<String, Value>,
    ) -> Self {
        let entity_id = entity_id.into();
        let domain = domain_of(&entity_id).to_string();
        let state_float = parse_state_float(new_state.as_deref());

        Self {
            friendly_name: attribute_string(&attributes, "friendly_name"),
            device_class: attribute_string(&attributes, "device_class"),
            unit_of_measurement: attribute_string(&attributes, "unit_of_measurement"),
            icon: attribute_string(&attributes, "icon"),
            entity_id,
            domain,
            new_state,
            old_state,
            state_float,
            timestamp: Utc::now(),
            last_changed,
            last_updated,
            attributes,
        }
    }

    /// Override the observation time (replay, tests).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Borrowing view in the write-schema shape of the `ha_state_history` transform.
    pub fn to_record(&self) -> IngestRecord<'_> {
        IngestRecord {
            timestamp: format_timestamp(&self.timestamp),
            entity_id: &self.entity_id,
            domain: &self.domain,
            state: self.new_state.as_deref().unwrap_or(""),
            old_state: self.old_state.as_deref().unwrap_or(""),
            state_float: self.state_float,
            last_changed: format_timestamp(&self.last_changed),
            last_updated: format_timestamp(&self.last_updated),
            friendly_name: &self.friendly_name,
            device_class: &self.device_class,
            unit_of_measurement: &self.unit_of_measurement,
            icon: &self.icon,
            attributes: &self.attributes,
        }
    }
}

/// One ingest row. Field order and names match the write-schema.
#[derive(Debug, Serialize)]
pub struct IngestRecord<'a> {
    pub timestamp: String,
    pub entity_id: &'a str,
    pub domain: &'a str,
    pub state: &'a str,
    pub old_state: &'a str,
    pub state_float: f64,
    pub last_changed: String,
    pub last_updated: String,
    pub friendly_name: &'a str,
    pub device_class: &'a str,
    pub unit_of_measurement: &'a str,
    pub icon: &'a str,
    pub attributes: &'a Map<String, Value>,
}

/// State change as emitted by the hub's event bus, one JSON object per change.
#[derive(Debug, Clone, Deserialize)]
pub struct HubStateChange {
    pub entity_id: String,
    #[serde(default)]
    pub new_state: Option<String>,
    #[serde(default)]
    pub old_state: Option<String>,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl HubStateChange {
    /// Convert into a pipeline event.
    ///
    /// Returns `None` when `new_state` is missing: the hub reports entity
    /// removal that way and there is nothing to record.
    pub fn into_event(self) -> Option<StateChangeEvent> {
        let new_state = self.new_state?;
        let now = Utc::now();

        Some(StateChangeEvent::new(
            self.entity_id,
            Some(new_state),
            self.old_state,
            self.last_changed.unwrap_or(now),
            self.last_updated.unwrap_or(now),
            self.attributes,
        ))
    }
}

/// Domain part of an entity id ("light.porch" → "light").
pub fn domain_of(entity_id: &str) -> &str {
    entity_id
        .split_once('.')
        .map(|(domain, _)| domain)
        .unwrap_or(entity_id)
}

/// Numeric value of a state string; 0 for missing, non-numeric or non-finite states.
pub fn parse_state_float(state: Option<&str>) -> f64 {
    state
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// ISO-8601 with millisecond fraction and explicit offset.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, false)
}

fn attribute_string(attributes: &Map<String, Value>, key: &str) -> String {
    match attributes.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
