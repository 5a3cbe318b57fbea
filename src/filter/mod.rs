use crate::event::StateChangeEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

mod glob;
#[cfg(test)]
mod tests;

pub use glob::GlobPattern;

/// Which entities get shipped.
///
/// Entries in `include_entities` / `exclude_entities` that contain `*` or `?`
/// are glob patterns; all other entries are exact entity ids. The `*_globs`
/// and `*_device_classes` lists are optional extras. Immutable after load:
/// reconfiguration builds a new filter from a new `FilterConfig`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub include_domains: HashSet<String>,
    pub exclude_domains: HashSet<String>,
    pub include_entities: HashSet<String>,
    pub exclude_entities: HashSet<String>,
    pub include_entity_globs: Vec<String>,
    pub exclude_entity_globs: Vec<String>,
    pub include_device_classes: HashSet<String>,
    pub exclude_device_classes: HashSet<String>,
}

/// Rule that decided an entity's fate, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRule {
    ExcludedEntity,
    IncludedEntity,
    ExcludedGlob,
    IncludedGlob,
    ExcludedDeviceClass,
    IncludedDeviceClass,
    ExcludedDomain,
    IncludedDomain,
    NotInIncludeList,
    Default,
}

impl FilterRule {
    pub fn admits(self) -> bool {
        matches!(
            self,
            FilterRule::IncludedEntity
                | FilterRule::IncludedGlob
                | FilterRule::IncludedDeviceClass
                | FilterRule::IncludedDomain
                | FilterRule::Default
        )
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterRule::ExcludedEntity => "excluded_entity",
            FilterRule::IncludedEntity => "included_entity",
            FilterRule::ExcludedGlob => "excluded_glob",
            FilterRule::IncludedGlob => "included_glob",
            FilterRule::ExcludedDeviceClass => "excluded_device_class",
            FilterRule::IncludedDeviceClass => "included_device_class",
            FilterRule::ExcludedDomain => "excluded_domain",
            FilterRule::IncludedDomain => "included_domain",
            FilterRule::NotInIncludeList => "not_in_include_list",
            FilterRule::Default => "default",
        };
        f.write_str(name)
    }
}

/// Compiled form of a `FilterConfig`.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    include_domains: HashSet<String>,
    exclude_domains: HashSet<String>,
    include_entities: HashSet<String>,
    exclude_entities: HashSet<String>,
    include_globs: Vec<GlobPattern>,
    exclude_globs: Vec<GlobPattern>,
    include_device_classes: HashSet<String>,
    exclude_device_classes: HashSet<String>,
    has_include: bool,
}

impl EntityFilter {
    pub fn new(config: &FilterConfig) -> Self {
        let (include_entities, include_globs) =
            split_entities(&config.include_entities, &config.include_entity_globs);
        let (exclude_entities, exclude_globs) =
            split_entities(&config.exclude_entities, &config.exclude_entity_globs);

        let has_include = !config.include_domains.is_empty()
            || !include_entities.is_empty()
            || !include_globs.is_empty()
            || !config.include_device_classes.is_empty();

        Self {
            include_domains: config.include_domains.clone(),
            exclude_domains: config.exclude_domains.clone(),
            include_entities,
            exclude_entities,
            include_globs,
            exclude_globs,
            include_device_classes: config.include_device_classes.clone(),
            exclude_device_classes: config.exclude_device_classes.clone(),
            has_include,
        }
    }

    /// Decide whether the event is shipped.
    pub fn admit(&self, event: &StateChangeEvent) -> bool {
        self.evaluate(&event.entity_id, &event.device_class).admits()
    }

    /// Walk the precedence list; first matching rule wins.
    ///
    /// 1. exact entity exclude      2. exact entity include
    /// 3. glob exclude              4. glob include
    /// 4a. device class exclude     4b. device class include
    /// 5. domain exclude            6. domain include
    /// 7. any include list present → reject
    /// 8. admit
    ///
    /// An empty entity id never matches the entity, glob or domain rules.
    pub fn evaluate(&self, entity_id: &str, device_class: &str) -> FilterRule {
        if !entity_id.is_empty() {
            if self.exclude_entities.contains(entity_id) {
                return FilterRule::ExcludedEntity;
            }
            if self.include_entities.contains(entity_id) {
                return FilterRule::IncludedEntity;
            }
            if !self.exclude_globs.is_empty() || !self.include_globs.is_empty() {
                let text: Vec<char> = entity_id.chars().collect();
                if self.exclude_globs.iter().any(|p| p.matches_chars(&text)) {
                    return FilterRule::ExcludedGlob;
                }
                if self.include_globs.iter().any(|p| p.matches_chars(&text)) {
                    return FilterRule::IncludedGlob;
                }
            }
        }

        if !device_class.is_empty() {
            if self.exclude_device_classes.contains(device_class) {
                return FilterRule::ExcludedDeviceClass;
            }
            if self.include_device_classes.contains(device_class) {
                return FilterRule::IncludedDeviceClass;
            }
        }

        let domain = crate::event::domain_of(entity_id);
        if !domain.is_empty() {
            if self.exclude_domains.contains(domain) {
                return FilterRule::ExcludedDomain;
            }
            if self.include_domains.contains(domain) {
                return FilterRule::IncludedDomain;
            }
        }

        if self.has_include {
            return FilterRule::NotInIncludeList;
        }

        FilterRule::Default
    }
}

/// Compile and evaluate in one call. Hot paths keep an `EntityFilter` instead.
pub fn admit(event: &StateChangeEvent, config: &FilterConfig) -> bool {
    EntityFilter::new(config).admit(event)
}

fn split_entities(
    entries: &HashSet<String>,
    extra_globs: &[String],
) -> (HashSet<String>, Vec<GlobPattern>) {
    let mut exact = HashSet::new();
    let mut globs = Vec::new();

    for entry in entries {
        if GlobPattern::is_glob(entry) {
            globs.push(GlobPattern::new(entry));
        } else {
            exact.insert(entry.clone());
        }
    }
    globs.extend(extra_globs.iter().map(|p| GlobPattern::new(p)));

    (exact, globs)
}
