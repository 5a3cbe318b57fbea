//! Fixed write-schema and table settings for Home Assistant state history.
//!
//! The column list mirrors `IngestRecord` field for field. Datetime columns
//! parse the ingest timestamps with a Go-style layout at millisecond
//! resolution.

use serde_json::{json, Value};

/// Name of the write-schema (transform) attached to the history table.
pub const TRANSFORM_NAME: &str = "ha_state_history";

pub const DEFAULT_PROJECT: &str = "homeassistant";
pub const DEFAULT_TABLE: &str = "state_history";

const DATETIME_FORMAT: &str = "2006-01-02T15:04:05.000000Z07:00";

/// Output columns of the transform, in record order.
pub fn output_columns() -> Value {
    json!([
        {
            "name": "timestamp",
            "datatype": {
                "type": "datetime",
                "primary": true,
                "format": DATETIME_FORMAT,
                "resolution": "ms"
            }
        },
        { "name": "entity_id", "datatype": { "type": "string", "index": true } },
        { "name": "domain", "datatype": { "type": "string", "index": true } },
        { "name": "state", "datatype": { "type": "string", "index": true } },
        { "name": "old_state", "datatype": { "type": "string", "index": true, "default": "" } },
        { "name": "state_float", "datatype": { "type": "double", "index": false, "default": "0" } },
        {
            "name": "last_changed",
            "datatype": {
                "type": "datetime",
                "format": DATETIME_FORMAT,
                "resolution": "ms",
                "index": true
            }
        },
        {
            "name": "last_updated",
            "datatype": {
                "type": "datetime",
                "format": DATETIME_FORMAT,
                "resolution": "ms",
                "index": true
            }
        },
        { "name": "friendly_name", "datatype": { "type": "string", "index": true, "default": "" } },
        { "name": "device_class", "datatype": { "type": "string", "index": true, "default": "" } },
        { "name": "unit_of_measurement", "datatype": { "type": "string", "index": true, "default": "" } },
        { "name": "icon", "datatype": { "type": "string", "index": true, "default": "" } },
        { "name": "attributes", "datatype": { "type": "json" } }
    ])
}

/// Create-transform payload. Marked as the table default so ingest
/// requests resolve it without naming it.
pub fn transform_body() -> Value {
    json!({
        "name": TRANSFORM_NAME,
        "description": "Home Assistant state change events, created by hydrolix-history",
        "type": "json",
        "settings": {
            "is_default": true,
            "output_columns": output_columns(),
            "format_details": {
                "flattening": { "active": false, "map_flattening_strategy": null }
            }
        }
    })
}

pub fn project_body(name: &str) -> Value {
    json!({
        "name": name,
        "description": "Home Assistant history data"
    })
}

/// Create-table payload: streaming partition limits, unbounded retention,
/// merge enabled, sorted by entity.
pub fn table_body(name: &str) -> Value {
    json!({
        "name": name,
        "description": "Home Assistant state change history",
        "settings": {
            "stream": {
                "hot_data_max_age_minutes": 5,
                "hot_data_max_active_partitions": 3,
                "hot_data_max_rows_per_partition": 12_288_000,
                "hot_data_max_minutes_per_partition": 5,
                "hot_data_max_open_seconds": 60,
                "hot_data_max_idle_seconds": 30,
                "cold_data_max_age_days": 3650,
                "cold_data_max_active_partitions": 50,
                "cold_data_max_rows_per_partition": 12_288_000,
                "cold_data_max_minutes_per_partition": 60,
                "cold_data_max_open_seconds": 30,
                "cold_data_max_idle_seconds": 60
            },
            "age": { "max_age_days": 0 },
            "merge": { "enabled": true },
            "sort_keys": ["entity_id"],
            "max_future_days": 0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StateChangeEvent;
    use chrono::Utc;
    use serde_json::Map;

    #[test]
    fn test_columns_match_ingest_record() {
        let now = Utc::now();
        let event = StateChangeEvent::new("sensor.x", Some("1".into()), None, now, now, Map::new());
        let record = serde_json::to_value(event.to_record()).unwrap();
        let record_keys: Vec<&String> = record.as_object().unwrap().keys().collect();

        let columns = output_columns();
        let column_names: Vec<&str> = columns
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();

        assert_eq!(column_names.len(), 13);
        for key in record_keys {
            assert!(column_names.contains(&key.as_str()), "missing column {}", key);
        }
    }

    #[test]
    fn test_timestamp_is_primary() {
        let columns = output_columns();
        let primaries: Vec<&Value> = columns
            .as_array()
            .unwrap()
            .iter()
            .filter(|c| c["datatype"]["primary"] == true)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0]["name"], "timestamp");
        assert_eq!(primaries[0]["datatype"]["resolution"], "ms");
    }

    #[test]
    fn test_transform_is_default() {
        let body = transform_body();
        assert_eq!(body["name"], TRANSFORM_NAME);
        assert_eq!(body["type"], "json");
        assert_eq!(body["settings"]["is_default"], true);
        assert_eq!(body["settings"]["format_details"]["flattening"]["active"], false);
    }

    #[test]
    fn test_table_body_settings() {
        let body = table_body("state_history");
        assert_eq!(body["name"], "state_history");
        assert_eq!(body["settings"]["sort_keys"], json!(["entity_id"]));
        assert_eq!(body["settings"]["merge"]["enabled"], true);
        assert_eq!(body["settings"]["stream"]["cold_data_max_age_days"], 3650);
    }
}
