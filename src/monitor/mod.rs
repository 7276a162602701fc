// Issue Detector
// Classifies entity states and debounces issues through a per-entity grace period

pub mod filter;

pub use filter::EntityFilter;

use crate::config::MonitoringConfig;
use crate::error::MedicResult;
use crate::state::{AttributeValue, Attributes, EntityState, STATE_UNAVAILABLE, STATE_UNKNOWN};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Kind of problem reported for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Unavailable,
    Unknown,
    Stale,
    Recovered,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Unavailable => "unavailable",
            IssueKind::Unknown => "unknown",
            IssueKind::Stale => "stale",
            IssueKind::Recovered => "recovered",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unavailable" => Ok(IssueKind::Unavailable),
            "unknown" => Ok(IssueKind::Unknown),
            "stale" => Ok(IssueKind::Stale),
            "recovered" => Ok(IssueKind::Recovered),
            other => Err(format!("unknown issue kind {other:?}")),
        }
    }
}

/// Debounced issue or recovery event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub entity_id: String,
    pub kind: IssueKind,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub details: Attributes,
}

/// Public view of an open tracker
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedIssue {
    pub entity_id: String,
    pub kind: IssueKind,
    pub first_seen: DateTime<Utc>,
    pub reported: bool,
}

#[derive(Debug, Clone)]
struct Tracker {
    kind: IssueKind,
    first_seen: DateTime<Utc>,
    reported: bool,
}

/// Detector thresholds and filters for one instance
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub grace_period: Duration,

    /// None disables staleness
    pub stale_threshold: Option<Duration>,

    pub grace_overrides: HashMap<String, Duration>,

    pub filter: EntityFilter,
}

impl DetectorSettings {
    pub fn from_config(config: &MonitoringConfig) -> MedicResult<Self> {
        Ok(Self {
            grace_period: secs(config.grace_period_secs),
            stale_threshold: (config.stale_threshold_secs > 0).then(|| secs(config.stale_threshold_secs)),
            grace_overrides: config
                .grace_overrides
                .iter()
                .map(|(id, grace)| (id.clone(), secs(*grace)))
                .collect(),
            filter: EntityFilter::new(&config.include, &config.exclude)?,
        })
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

/// Per-instance issue detector
///
/// Holds one tracker per entity that currently classifies as unhealthy. An
/// issue is emitted once per (entity, kind) episode after the grace period;
/// a kind change restarts the clock.
#[derive(Debug)]
pub struct IssueDetector {
    settings: DetectorSettings,
    trackers: HashMap<String, Tracker>,
}

impl IssueDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            settings,
            trackers: HashMap::new(),
        }
    }

    pub fn from_config(config: &MonitoringConfig) -> MedicResult<Self> {
        Ok(Self::new(DetectorSettings::from_config(config)?))
    }

    /// Pure classification of one state at `now`
    pub fn classify(&self, state: &EntityState, now: DateTime<Utc>) -> Option<IssueKind> {
        match state.state.as_str() {
            STATE_UNAVAILABLE => Some(IssueKind::Unavailable),
            STATE_UNKNOWN => Some(IssueKind::Unknown),
            _ => match self.settings.stale_threshold {
                Some(threshold) if now - state.last_updated > threshold => Some(IssueKind::Stale),
                _ => None,
            },
        }
    }

    /// Grace period that applies to one entity
    pub fn grace_for(&self, entity_id: &str) -> Duration {
        self.settings
            .grace_overrides
            .get(entity_id)
            .copied()
            .unwrap_or(self.settings.grace_period)
    }

    pub fn is_monitored(&self, entity_id: &str) -> bool {
        self.settings.filter.allows(entity_id)
    }

    /// Run the debounce step for one state
    pub fn evaluate(&mut self, state: &EntityState, now: DateTime<Utc>) -> Option<HealthIssue> {
        if !self.is_monitored(&state.entity_id) {
            self.trackers.remove(&state.entity_id);
            return None;
        }

        let classified = self.classify(state, now);
        let grace = self.grace_for(&state.entity_id);

        match classified {
            None => {
                let tracker = self.trackers.remove(&state.entity_id)?;
                if !tracker.reported {
                    debug!(entity_id = %state.entity_id, kind = %tracker.kind, "issue cleared inside grace period");
                    return None;
                }
                info!(entity_id = %state.entity_id, previous = %tracker.kind, "entity recovered");
                let mut details = base_details(state);
                details.insert("previous_kind".into(), tracker.kind.as_str().into());
                details.insert(
                    "open_secs".into(),
                    AttributeValue::Number((now - tracker.first_seen).num_seconds() as f64),
                );
                Some(HealthIssue {
                    entity_id: state.entity_id.clone(),
                    kind: IssueKind::Recovered,
                    detected_at: now,
                    details,
                })
            }
            Some(kind) => {
                let restart = self
                    .trackers
                    .get(&state.entity_id)
                    .map_or(true, |tracker| tracker.kind != kind);
                if restart {
                    debug!(entity_id = %state.entity_id, %kind, "issue tracker started");
                    self.trackers.insert(
                        state.entity_id.clone(),
                        Tracker {
                            kind,
                            first_seen: now,
                            reported: false,
                        },
                    );
                    return None;
                }

                let tracker = self.trackers.get_mut(&state.entity_id)?;

                if tracker.reported || now - tracker.first_seen < grace {
                    return None;
                }

                tracker.reported = true;
                info!(
                    entity_id = %state.entity_id,
                    %kind,
                    open_secs = (now - tracker.first_seen).num_seconds(),
                    "health issue detected"
                );
                let mut details = base_details(state);
                details.insert("first_seen".into(), tracker.first_seen.to_rfc3339().into());
                details.insert(
                    "grace_period_secs".into(),
                    AttributeValue::Number(grace.num_seconds() as f64),
                );
                Some(HealthIssue {
                    entity_id: state.entity_id.clone(),
                    kind,
                    detected_at: now,
                    details,
                })
            }
        }
    }

    /// Evaluate a whole snapshot; catches grace crossings and staleness without events
    pub fn sweep<'a, I>(&mut self, states: I, now: DateTime<Utc>) -> Vec<HealthIssue>
    where
        I: IntoIterator<Item = &'a EntityState>,
    {
        states
            .into_iter()
            .filter_map(|state| self.evaluate(state, now))
            .collect()
    }

    /// Drop the tracker of a deleted entity
    pub fn forget(&mut self, entity_id: &str) -> bool {
        self.trackers.remove(entity_id).is_some()
    }

    /// Drop the tracker after a successful remediation
    pub fn resolve(&mut self, entity_id: &str) -> bool {
        let resolved = self.trackers.remove(entity_id).is_some();
        if resolved {
            debug!(%entity_id, "issue resolved by remediation");
        }
        resolved
    }

    pub fn open_issues(&self) -> Vec<TrackedIssue> {
        let mut issues: Vec<_> = self
            .trackers
            .iter()
            .map(|(entity_id, t)| TrackedIssue {
                entity_id: entity_id.clone(),
                kind: t.kind,
                first_seen: t.first_seen,
                reported: t.reported,
            })
            .collect();
        issues.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        issues
    }
}

fn base_details(state: &EntityState) -> Attributes {
    let mut details = Attributes::new();
    details.insert("state".into(), state.state.clone().into());
    details.insert("friendly_name".into(), state.friendly_name().into());
    details.insert("last_updated".into(), state.last_updated.to_rfc3339().into());
    details
}
