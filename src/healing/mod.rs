// Healing Engine
// Per-target cooldown and circuit breaker around integration reloads

pub mod breaker;

pub use breaker::{BreakerState, CircuitState};

use crate::clock::SharedClock;
use crate::config::HealingConfig;
use crate::discovery::{is_heuristic, DiscoverySource, IntegrationDirectory, IntegrationRecord};
use crate::error::{MedicError, MedicResult};
use crate::network::Controller;
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// One remediation attempt, append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAction {
    pub instance_id: String,
    pub entry_id: String,
    pub entity_id: Option<String>,

    /// "reload_config_entry" or "reload_domain"
    pub action: String,

    /// Monotonic per target for the life of the process
    pub attempt_number: u64,

    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub timestamp: DateTime<Utc>,
}

/// Why an attempt was not made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefusalReason {
    Cooldown { retry_after: DateTime<Utc> },
    CircuitOpen { until: DateTime<Utc> },
    Disabled,
}

/// Result of one healing request
///
/// Only `Failed` is an attempted-and-failed remediation; refusals and
/// missing targets never count toward the breaker and are never escalated.
#[derive(Debug, Clone, PartialEq)]
pub enum HealOutcome {
    Healed {
        target: String,
        attempt: u64,
        dry_run: bool,
    },
    Failed {
        target: String,
        attempt: u64,
        error: String,
        consecutive_failures: u32,
        /// Set when this failure opened the breaker
        circuit_opened_until: Option<DateTime<Utc>>,
    },
    Refused {
        target: String,
        reason: RefusalReason,
    },
    TargetNotFound {
        target: String,
    },
}

impl HealOutcome {
    pub fn is_healed(&self) -> bool {
        matches!(self, HealOutcome::Healed { .. })
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, HealOutcome::Refused { .. })
    }

    /// Whether a remote remediation call was actually made (or simulated)
    pub fn was_attempted(&self) -> bool {
        matches!(self, HealOutcome::Healed { .. } | HealOutcome::Failed { .. })
    }

    pub fn target(&self) -> &str {
        match self {
            HealOutcome::Healed { target, .. }
            | HealOutcome::Failed { target, .. }
            | HealOutcome::Refused { target, .. }
            | HealOutcome::TargetNotFound { target } => target,
        }
    }

    /// Human-readable reason for manual callers
    pub fn reason(&self) -> String {
        match self {
            HealOutcome::Healed { target, attempt, dry_run: false } => {
                format!("healed: reloaded {target} (attempt {attempt})")
            }
            HealOutcome::Healed { target, attempt, dry_run: true } => {
                format!("healed (dry run): would reload {target} (attempt {attempt})")
            }
            HealOutcome::Failed {
                target,
                attempt,
                error,
                consecutive_failures,
                circuit_opened_until,
            } => {
                let mut reason = format!(
                    "attempted and failed: reload of {target} failed on attempt {attempt} \
                     ({consecutive_failures} consecutive): {error}"
                );
                if let Some(until) = circuit_opened_until {
                    reason.push_str(&format!("; circuit open until {}", until.to_rfc3339()));
                }
                reason
            }
            HealOutcome::Refused { target, reason } => match reason {
                RefusalReason::Cooldown { retry_after } => {
                    format!("refused (cooldown): {target} may be retried after {}", retry_after.to_rfc3339())
                }
                RefusalReason::CircuitOpen { until } => {
                    format!("refused (circuit open): {target} is suspended until {}", until.to_rfc3339())
                }
                RefusalReason::Disabled => "refused: healing is disabled".to_string(),
            },
            HealOutcome::TargetNotFound { target } => {
                format!("target not found: no integration is known for {target}")
            }
        }
    }
}

#[derive(Debug, Default)]
struct TargetState {
    breaker: BreakerState,
    last_attempt: Option<DateTime<Utc>>,
    attempts: u64,
}

enum Reservation {
    Proceed { record: IntegrationRecord, attempt: u64 },
    Done(HealOutcome),
}

/// Healing engine for one instance
pub struct HealingEngine {
    instance_id: String,
    config: HealingConfig,
    directory: Arc<IntegrationDirectory>,
    controller: Arc<dyn Controller>,
    store: Option<Store>,
    clock: SharedClock,

    /// Breaker and cooldown table; never held across an await
    targets: Mutex<HashMap<String, TargetState>>,
}

impl HealingEngine {
    pub fn new(
        instance_id: impl Into<String>,
        config: HealingConfig,
        directory: Arc<IntegrationDirectory>,
        controller: Arc<dyn Controller>,
        store: Option<Store>,
        clock: SharedClock,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            config,
            directory,
            controller,
            store,
            clock,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// In-memory breaker of a target, if it has been touched
    pub fn breaker(&self, target: &str) -> Option<BreakerState> {
        self.targets.lock().get(target).map(|t| t.breaker.clone())
    }

    /// Heal the target owning an entity
    pub async fn heal_entity(&self, entity_id: &str) -> HealOutcome {
        match self.directory.integration_for_entity(entity_id) {
            Some(record) => self.heal_target(&record.entry_id, Some(entity_id)).await,
            None => {
                info!(instance = %self.instance_id, %entity_id, "no integration mapped for entity");
                HealOutcome::TargetNotFound {
                    target: entity_id.to_string(),
                }
            }
        }
    }

    /// Attempt one remediation against a target
    #[instrument(skip(self), fields(instance = %self.instance_id))]
    pub async fn heal_target(&self, target: &str, entity_id: Option<&str>) -> HealOutcome {
        if !self.config.enabled {
            return HealOutcome::Refused {
                target: target.to_string(),
                reason: RefusalReason::Disabled,
            };
        }

        if self.directory.resolve(target).is_none() {
            debug!(instance = %self.instance_id, %target, "healing not attempted: unknown target");
            return HealOutcome::TargetNotFound {
                target: target.to_string(),
            };
        }
        self.ensure_loaded(target).await;

        let (record, attempt) = match self.reserve(target, self.clock.now()) {
            Reservation::Proceed { record, attempt } => (record, attempt),
            Reservation::Done(outcome) => {
                debug!(instance = %self.instance_id, %target, reason = %outcome.reason(), "healing not attempted");
                return outcome;
            }
        };

        let action = if uses_domain_reload(&record) {
            "reload_domain"
        } else {
            "reload_config_entry"
        };
        info!(instance = %self.instance_id, %target, attempt, action, dry_run = self.config.dry_run, "attempting remediation");

        let started = Instant::now();
        let result = if self.config.dry_run {
            Ok(())
        } else {
            self.remediate(&record).await
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let finished = self.clock.now();

        let (outcome, breaker) = {
            let mut targets = self.targets.lock();
            let state = targets.entry(target.to_string()).or_default();
            state.last_attempt = Some(finished);

            let outcome = match &result {
                Ok(()) => {
                    state.breaker.record_success(finished);
                    HealOutcome::Healed {
                        target: target.to_string(),
                        attempt,
                        dry_run: self.config.dry_run,
                    }
                }
                Err(e) => {
                    let opened = state.breaker.record_failure(
                        finished,
                        self.config.failure_threshold,
                        Duration::seconds(self.config.circuit_reset_secs as i64),
                    );
                    HealOutcome::Failed {
                        target: target.to_string(),
                        attempt,
                        error: e.to_string(),
                        consecutive_failures: state.breaker.consecutive_failures,
                        circuit_opened_until: opened,
                    }
                }
            };
            (outcome, state.breaker.clone())
        };

        match &outcome {
            HealOutcome::Healed { .. } => info!(instance = %self.instance_id, %target, attempt, duration_ms, "remediation succeeded"),
            _ => warn!(instance = %self.instance_id, %target, attempt, duration_ms, reason = %outcome.reason(), "remediation failed"),
        }

        let action = HealingAction {
            instance_id: self.instance_id.clone(),
            entry_id: target.to_string(),
            entity_id: entity_id.map(str::to_string),
            action: action.to_string(),
            attempt_number: attempt,
            success: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
            duration_ms,
            dry_run: self.config.dry_run,
            timestamp: finished,
        };
        self.persist(&record, breaker, action).await;

        outcome
    }

    /// Resolution, then cooldown check, breaker check and reservation in one critical section
    fn reserve(&self, target: &str, now: DateTime<Utc>) -> Reservation {
        // Directory lookups never regress, so an unknown target has no state to check
        let Some(record) = self.directory.resolve(target) else {
            return Reservation::Done(HealOutcome::TargetNotFound {
                target: target.to_string(),
            });
        };

        let mut targets = self.targets.lock();
        let state = targets.entry(target.to_string()).or_default();

        if let Some(last) = state.last_attempt {
            let retry_after = last + Duration::seconds(self.config.cooldown_secs as i64);
            if now < retry_after {
                return Reservation::Done(HealOutcome::Refused {
                    target: target.to_string(),
                    reason: RefusalReason::Cooldown { retry_after },
                });
            }
        }

        if let CircuitState::Open { until } = state.breaker.state(now) {
            return Reservation::Done(HealOutcome::Refused {
                target: target.to_string(),
                reason: RefusalReason::CircuitOpen { until },
            });
        }
        state.breaker.try_close(now);

        state.last_attempt = Some(now);
        state.attempts += 1;
        Reservation::Proceed {
            record,
            attempt: state.attempts,
        }
    }

    /// Seed the breaker of an untouched target from the store
    async fn ensure_loaded(&self, target: &str) {
        if self.targets.lock().contains_key(target) {
            return;
        }

        let mut breaker = BreakerState::default();
        if let Some(store) = &self.store {
            let (instance, entry) = (self.instance_id.clone(), target.to_string());
            match store.run_blocking(move |s| s.load_integration(&instance, &entry)).await {
                Ok(Some(record)) => breaker = record.breaker,
                Ok(None) => {}
                Err(e) => warn!(instance = %self.instance_id, %target, error = %e, "failed to load breaker state"),
            }
        }

        self.targets
            .lock()
            .entry(target.to_string())
            .or_insert_with(|| TargetState {
                breaker,
                ..Default::default()
            });
    }

    async fn remediate(&self, record: &IntegrationRecord) -> MedicResult<()> {
        let timeout = self.config.remediation_timeout();
        let call = async {
            if uses_domain_reload(record) {
                self.controller
                    .call_service(&record.domain, "reload", serde_json::json!({}))
                    .await
            } else {
                self.controller.reload_config_entry(&record.entry_id).await
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(MedicError::Connection(format!(
                "remediation timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Best-effort write of breaker fields and the attempt record
    async fn persist(&self, record: &IntegrationRecord, breaker: BreakerState, action: HealingAction) {
        let Some(store) = &self.store else {
            return;
        };

        let instance = self.instance_id.clone();
        let (entry, domain) = (record.entry_id.clone(), record.domain.clone());
        let result = store
            .run_blocking(move |s| {
                s.save_breaker(&instance, &entry, &domain, &breaker)?;
                s.record_healing_action(&action)
            })
            .await;
        if let Err(e) = result {
            warn!(instance = %self.instance_id, target = %record.entry_id, error = %e, "failed to persist healing attempt");
        }
    }
}

fn uses_domain_reload(record: &IntegrationRecord) -> bool {
    record.source == DiscoverySource::Heuristic || is_heuristic(&record.entry_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::testing::FakeController;

    struct Harness {
        engine: Arc<HealingEngine>,
        controller: Arc<FakeController>,
        clock: ManualClock,
        store: Store,
    }

    async fn harness(config: HealingConfig) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let directory = Arc::new(IntegrationDirectory::new("home", None, Some(store.clone())));
        directory.add_manual_mapping("light.kitchen", "hue01").await.unwrap();

        let controller = Arc::new(FakeController::default());
        let clock = ManualClock::new(Utc::now());
        let engine = Arc::new(HealingEngine::new(
            "home",
            config,
            directory,
            controller.clone(),
            Some(store.clone()),
            Arc::new(clock.clone()),
        ));
        Harness {
            engine,
            controller,
            clock,
            store,
        }
    }

    fn config(cooldown: u64, threshold: u32) -> HealingConfig {
        HealingConfig {
            cooldown_secs: cooldown,
            failure_threshold: threshold,
            circuit_reset_secs: 600,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let h = harness(config(300, 5)).await;

        let outcome = h.engine.heal_entity("light.kitchen").await;
        assert!(outcome.is_healed(), "{}", outcome.reason());
        assert_eq!(h.controller.reload_count("hue01"), 1);

        let breaker = h.engine.breaker("hue01").unwrap();
        assert_eq!(breaker.consecutive_failures, 0);
        assert!(breaker.last_successful_heal.is_some());

        let actions = h.store.healing_actions("home", 10).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].entity_id.as_deref(), Some("light.kitchen"));
        assert!(actions[0].success);
    }

    #[tokio::test]
    async fn test_threshold_opens_breaker_and_refuses() {
        let h = harness(config(0, 3)).await;
        h.controller.fail("reload:hue01");

        for expected in 1..=3u32 {
            match h.engine.heal_target("hue01", None).await {
                HealOutcome::Failed { consecutive_failures, circuit_opened_until, .. } => {
                    assert_eq!(consecutive_failures, expected);
                    assert_eq!(circuit_opened_until.is_some(), expected == 3);
                }
                other => panic!("unexpected {other:?}"),
            }
            h.clock.advance_secs(1);
        }

        let outcome = h.engine.heal_target("hue01", None).await;
        assert!(matches!(
            outcome,
            HealOutcome::Refused { reason: RefusalReason::CircuitOpen { .. }, .. }
        ));
        assert_eq!(h.controller.reload_count("hue01"), 3);

        // Reset elapsed: breaker clears and the attempt is a normal one
        h.clock.advance_secs(600);
        h.controller.succeed("reload:hue01");
        let outcome = h.engine.heal_target("hue01", None).await;
        assert!(outcome.is_healed());
        assert_eq!(h.controller.reload_count("hue01"), 4);
        assert_eq!(h.engine.breaker("hue01").unwrap(), BreakerState {
            consecutive_failures: 0,
            circuit_open_until: None,
            last_successful_heal: Some(h.clock.now()),
        });
    }

    #[tokio::test]
    async fn test_cooldown_allows_one_call() {
        let h = harness(config(300, 5)).await;

        assert!(h.engine.heal_target("hue01", None).await.is_healed());
        h.clock.advance_secs(299);
        let second = h.engine.heal_target("hue01", None).await;
        assert!(matches!(
            second,
            HealOutcome::Refused { reason: RefusalReason::Cooldown { .. }, .. }
        ));
        assert_eq!(h.controller.reload_count("hue01"), 1);

        h.clock.advance_secs(1);
        assert!(h.engine.heal_target("hue01", None).await.is_healed());
    }

    #[tokio::test]
    async fn test_concurrent_callers_single_remote_call() {
        let h = harness(config(300, 5)).await;

        let (a, b) = tokio::join!(
            h.engine.heal_target("hue01", None),
            h.engine.heal_target("hue01", None)
        );
        assert_eq!([a.is_healed(), b.is_healed()].iter().filter(|x| **x).count(), 1);
        assert!(a.is_refused() || b.is_refused());
        assert_eq!(h.controller.reload_count("hue01"), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_never_counts() {
        let h = harness(config(0, 1)).await;

        let outcome = h.engine.heal_target("ghost", None).await;
        assert_eq!(outcome, HealOutcome::TargetNotFound { target: "ghost".into() });
        assert!(outcome.reason().starts_with("target not found"));
        assert!(h.engine.breaker("ghost").is_none());
        assert_eq!(h.controller.command_count(), 0);

        // Repeated unknown targets leave the table untouched
        for n in 0..20 {
            h.engine.heal_target(&format!("ghost-{n}"), None).await;
        }
        assert_eq!(h.engine.targets.lock().len(), 0);

        let unmapped = h.engine.heal_entity("switch.unknown").await;
        assert!(matches!(unmapped, HealOutcome::TargetNotFound { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_keeps_bookkeeping() {
        let h = harness(HealingConfig {
            dry_run: true,
            ..config(0, 5)
        })
        .await;

        let outcome = h.engine.heal_target("hue01", None).await;
        assert_eq!(outcome, HealOutcome::Healed { target: "hue01".into(), attempt: 1, dry_run: true });
        assert_eq!(h.controller.command_count(), 0);
        assert!(h.store.healing_actions("home", 1).unwrap()[0].dry_run);
    }

    #[tokio::test]
    async fn test_disabled_refuses() {
        let h = harness(HealingConfig {
            enabled: false,
            ..config(0, 5)
        })
        .await;
        let outcome = h.engine.heal_target("hue01", None).await;
        assert_eq!(outcome, HealOutcome::Refused { target: "hue01".into(), reason: RefusalReason::Disabled });
        assert_eq!(h.controller.command_count(), 0);
    }

    #[tokio::test]
    async fn test_heuristic_target_reloads_domain() {
        let h = harness(config(0, 5)).await;
        h.engine
            .directory
            .add_manual_mapping("sensor.power", "heuristic:sensor")
            .await
            .unwrap();

        assert!(h.engine.heal_entity("sensor.power").await.is_healed());
        assert_eq!(h.controller.service_count("sensor", "reload"), 1);
        assert_eq!(h.controller.reload_count("heuristic:sensor"), 0);
    }

    #[tokio::test]
    async fn test_breaker_loaded_from_store() {
        let h = harness(config(0, 5)).await;
        h.store
            .save_breaker("home", "hue01", "light", &BreakerState {
                consecutive_failures: 4,
                ..Default::default()
            })
            .unwrap();
        h.controller.fail("reload:hue01");

        match h.engine.heal_target("hue01", None).await {
            HealOutcome::Failed { consecutive_failures, circuit_opened_until, attempt, .. } => {
                assert_eq!(consecutive_failures, 5);
                assert_eq!(attempt, 1);
                assert_eq!(circuit_opened_until, Some(h.clock.now() + Duration::seconds(600)));
            }
            other => panic!("unexpected {other:?}"),
        }

        let persisted = h.store.load_integration("home", "hue01").unwrap().unwrap();
        assert_eq!(persisted.breaker.consecutive_failures, 5);
        assert!(persisted.breaker.circuit_open_until.is_some());
    }
}
