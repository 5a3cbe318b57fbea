use super::*;
use chrono::Utc;
use serde_json::{json, Map};

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn event(entity_id: &str, state: &str) -> StateChangeEvent {
    let now = Utc::now();
    StateChangeEvent::new(entity_id, Some(state.to_string()), None, now, now, Map::new())
}

fn event_with_class(entity_id: &str, device_class: &str) -> StateChangeEvent {
    let now = Utc::now();
    let attributes = json!({ "device_class": device_class })
        .as_object()
        .cloned()
        .unwrap();
    StateChangeEvent::new(entity_id, Some("1".to_string()), None, now, now, attributes)
}

// --- precedence, one test per rule ---

#[test]
fn test_rule1_exact_exclude_beats_exact_include() {
    let filter = EntityFilter::new(&FilterConfig {
        include_entities: set(&["sensor.temp"]),
        exclude_entities: set(&["sensor.temp"]),
        ..Default::default()
    });
    assert_eq!(filter.evaluate("sensor.temp", ""), FilterRule::ExcludedEntity);
}

#[test]
fn test_rule2_exact_include_beats_glob_exclude() {
    let filter = EntityFilter::new(&FilterConfig {
        include_entities: set(&["sensor.temp"]),
        exclude_entities: set(&["sensor.*"]),
        ..Default::default()
    });
    assert_eq!(filter.evaluate("sensor.temp", ""), FilterRule::IncludedEntity);
    assert_eq!(filter.evaluate("sensor.humidity", ""), FilterRule::ExcludedGlob);
}

#[test]
fn test_rule3_glob_exclude_beats_glob_include() {
    let filter = EntityFilter::new(&FilterConfig {
        include_entities: set(&["sensor.*"]),
        exclude_entities: set(&["*_battery"]),
        ..Default::default()
    });
    assert_eq!(filter.evaluate("sensor.phone_battery", ""), FilterRule::ExcludedGlob);
}

#[test]
fn test_rule4_glob_include_beats_domain_exclude() {
    let filter = EntityFilter::new(&FilterConfig {
        include_entities: set(&["sensor.kitchen_*"]),
        exclude_domains: set(&["sensor"]),
        ..Default::default()
    });
    assert_eq!(filter.evaluate("sensor.kitchen_temp", ""), FilterRule::IncludedGlob);
    assert_eq!(filter.evaluate("sensor.garage_temp", ""), FilterRule::ExcludedDomain);
}

#[test]
fn test_rule5_domain_exclude_beats_domain_include() {
    let filter = EntityFilter::new(&FilterConfig {
        include_domains: set(&["light"]),
        exclude_domains: set(&["light"]),
        ..Default::default()
    });
    assert_eq!(filter.evaluate("light.porch", ""), FilterRule::ExcludedDomain);
}

#[test]
fn test_rule6_domain_include() {
    let filter = EntityFilter::new(&FilterConfig {
        include_domains: set(&["light"]),
        ..Default::default()
    });
    assert_eq!(filter.evaluate("light.porch", ""), FilterRule::IncludedDomain);
}

#[test]
fn test_rule7_include_list_makes_membership_mandatory() {
    let by_domain = EntityFilter::new(&FilterConfig {
        include_domains: set(&["light"]),
        ..Default::default()
    });
    assert_eq!(by_domain.evaluate("switch.fan", ""), FilterRule::NotInIncludeList);

    let by_entity = EntityFilter::new(&FilterConfig {
        include_entities: set(&["sensor.temp"]),
        ..Default::default()
    });
    assert_eq!(by_entity.evaluate("sensor.other", ""), FilterRule::NotInIncludeList);

    let by_glob = EntityFilter::new(&FilterConfig {
        include_entities: set(&["sensor.*"]),
        ..Default::default()
    });
    assert_eq!(by_glob.evaluate("light.porch", ""), FilterRule::NotInIncludeList);
}

#[test]
fn test_rule8_default_admits() {
    let filter = EntityFilter::new(&FilterConfig::default());
    assert_eq!(filter.evaluate("anything.at_all", ""), FilterRule::Default);

    let exclude_only = EntityFilter::new(&FilterConfig {
        exclude_domains: set(&["automation"]),
        exclude_entities: set(&["sensor.noisy"]),
        ..Default::default()
    });
    assert_eq!(exclude_only.evaluate("light.porch", ""), FilterRule::Default);
}

// --- device class extension ---

#[test]
fn test_device_class_sits_between_globs_and_domains() {
    let filter = EntityFilter::new(&FilterConfig {
        exclude_device_classes: set(&["battery"]),
        include_domains: set(&["sensor"]),
        include_entities: set(&["sensor.keep_*"]),
        ..Default::default()
    });
    assert_eq!(filter.evaluate("sensor.phone", "battery"), FilterRule::ExcludedDeviceClass);
    assert_eq!(filter.evaluate("sensor.keep_me", "battery"), FilterRule::IncludedGlob);
    assert_eq!(filter.evaluate("sensor.temp", "temperature"), FilterRule::IncludedDomain);
}

#[test]
fn test_device_class_include_counts_as_include_list() {
    let filter = EntityFilter::new(&FilterConfig {
        include_device_classes: set(&["temperature"]),
        exclude_domains: set(&["climate"]),
        ..Default::default()
    });
    assert!(filter.admit(&event_with_class("sensor.kitchen", "temperature")));
    assert_eq!(filter.evaluate("sensor.kitchen", "humidity"), FilterRule::NotInIncludeList);
    // device class include wins over domain exclude
    assert_eq!(
        filter.evaluate("climate.hall", "temperature"),
        FilterRule::IncludedDeviceClass
    );
}

// --- globs from the dedicated lists ---

#[test]
fn test_dedicated_glob_lists_merge_with_entity_globs() {
    let filter = EntityFilter::new(&FilterConfig {
        exclude_entity_globs: vec!["sensor.*_rssi".to_string()],
        include_entity_globs: vec!["sensor.*".to_string()],
        ..Default::default()
    });
    assert_eq!(filter.evaluate("sensor.wifi_rssi", ""), FilterRule::ExcludedGlob);
    assert_eq!(filter.evaluate("sensor.temp", ""), FilterRule::IncludedGlob);
    assert_eq!(filter.evaluate("light.porch", ""), FilterRule::NotInIncludeList);
}

// --- properties and scenarios ---

#[test]
fn test_entity_exclude_overrides_domain_include() {
    let config = FilterConfig {
        include_domains: set(&["sensor", "light"]),
        exclude_entities: set(&["sensor.noisy", "light.*_debug"]),
        ..Default::default()
    };
    let filter = EntityFilter::new(&config);
    for id in ["sensor.noisy", "light.hall_debug"] {
        assert!(!filter.admit(&event(id, "1")), "{} should be rejected", id);
    }
    assert!(filter.admit(&event("sensor.quiet", "1")));
}

#[test]
fn test_scenario_exclude_automation_domain() {
    let config = FilterConfig {
        exclude_domains: set(&["automation"]),
        ..Default::default()
    };
    let events = vec![event("sensor.temp", "21.5"), event("automation.x", "on")];

    let admitted: Vec<_> = events
        .iter()
        .filter(|e| admit(e, &config))
        .map(|e| e.entity_id.as_str())
        .collect();

    assert_eq!(admitted, vec!["sensor.temp"]);
}

#[test]
fn test_unavailable_state_is_admitted() {
    let filter = EntityFilter::new(&FilterConfig::default());
    let e = event("sensor.outdoor", "unavailable");
    assert!(filter.admit(&e));
    assert_eq!(e.state_float, 0.0);
}

#[test]
fn test_empty_entity_id_falls_through() {
    let open = EntityFilter::new(&FilterConfig {
        exclude_entities: set(&["", "*"]),
        exclude_domains: set(&[""]),
        ..Default::default()
    });
    assert_eq!(open.evaluate("", ""), FilterRule::Default);

    let closed = EntityFilter::new(&FilterConfig {
        include_entities: set(&[""]),
        ..Default::default()
    });
    // "" is an exact include entry, but empty ids never match entity rules
    assert_eq!(closed.evaluate("", ""), FilterRule::NotInIncludeList);
}

#[test]
fn test_odd_patterns_do_not_panic() {
    let filter = EntityFilter::new(&FilterConfig {
        exclude_entities: set(&["[", "**", "?", "sensor.[a-"]),
        ..Default::default()
    });
    assert_eq!(filter.evaluate("sensor.temp", ""), FilterRule::ExcludedGlob);
    assert_eq!(filter.evaluate("x", ""), FilterRule::ExcludedGlob);

    let only_bracket = EntityFilter::new(&FilterConfig {
        exclude_entities: set(&["sensor.[a-"]),
        ..Default::default()
    });
    assert_eq!(only_bracket.evaluate("sensor.a", ""), FilterRule::Default);
}

#[test]
fn test_rule_admits_table() {
    assert!(!FilterRule::ExcludedEntity.admits());
    assert!(FilterRule::IncludedEntity.admits());
    assert!(!FilterRule::ExcludedGlob.admits());
    assert!(FilterRule::IncludedGlob.admits());
    assert!(!FilterRule::ExcludedDomain.admits());
    assert!(FilterRule::IncludedDomain.admits());
    assert!(!FilterRule::NotInIncludeList.admits());
    assert!(FilterRule::Default.admits());
}

#[test]
fn test_filter_config_deserializes_from_lists() {
    let config: FilterConfig = toml::from_str(
        r#"
        include_domains = ["sensor", "light"]
        exclude_entities = ["sensor.noisy", "sensor.*_rssi"]
        "#,
    )
    .unwrap();
    assert_eq!(config.include_domains, set(&["sensor", "light"]));
    assert!(config.exclude_domains.is_empty());
    assert_eq!(config.exclude_entities.len(), 2);
}
