// Entity include/exclude rules
// Glob patterns over entity ids; exclude always wins

use crate::error::{MedicError, MedicResult};
use glob::Pattern;

/// Compiled include/exclude rule set
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl EntityFilter {
    pub fn new(include: &[String], exclude: &[String]) -> MedicResult<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Whether the detector should evaluate this entity
    pub fn allows(&self, entity_id: &str) -> bool {
        if self.exclude.iter().any(|p| p.matches(entity_id)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches(entity_id))
    }
}

fn compile(patterns: &[String]) -> MedicResult<Vec<Pattern>> {
    patterns
        .iter()
        .map(|raw| {
            Pattern::new(raw).map_err(|e| MedicError::Config(format!("invalid pattern {raw:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(include: &[&str], exclude: &[&str]) -> EntityFilter {
        let own = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        EntityFilter::new(&own(include), &own(exclude)).unwrap()
    }

    #[test]
    fn test_empty_include_allows_everything() {
        let filter = rules(&[], &[]);
        assert!(filter.allows("light.kitchen"));
        assert!(filter.allows("sensor.anything"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = rules(&["sensor.*"], &["sensor.*_rssi"]);
        assert!(filter.allows("sensor.outdoor_temp"));
        assert!(!filter.allows("sensor.plug_rssi"));
        assert!(!filter.allows("light.kitchen"));
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let err = EntityFilter::new(&["light.[".to_string()], &[]).unwrap_err();
        assert!(matches!(err, MedicError::Config(_)));
    }
}
