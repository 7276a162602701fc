// Escalation Policy
// Entity action, then device reload, then integration reload; first success wins

use crate::clock::SharedClock;
use crate::config::CascadeConfig;
use crate::discovery::IntegrationDirectory;
use crate::error::{MedicError, MedicResult};
use crate::healing::{HealOutcome, HealingEngine};
use crate::monitor::IssueDetector;
use crate::network::Controller;
use crate::state::{Attributes, EntityCache};
use crate::store::Store;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What started a cascade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeTrigger {
    pub entity_id: String,

    #[serde(default)]
    pub automation_id: Option<String>,

    #[serde(default)]
    pub context: Attributes,
}

impl CascadeTrigger {
    pub fn for_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            automation_id: None,
            context: Attributes::new(),
        }
    }
}

/// Outcome of one escalation level; not attempted means skipped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelResult {
    pub attempted: bool,
    pub succeeded: bool,
    pub detail: Option<String>,
}

impl LevelResult {
    fn skipped(detail: impl Into<String>) -> Self {
        Self {
            attempted: false,
            succeeded: false,
            detail: Some(detail.into()),
        }
    }

    fn ran(succeeded: bool, detail: impl Into<String>) -> Self {
        Self {
            attempted: true,
            succeeded,
            detail: Some(detail.into()),
        }
    }
}

/// One logical remediation request, append-only once completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeExecution {
    pub id: Uuid,
    pub instance_id: String,
    pub entity_id: String,
    pub automation_id: Option<String>,
    pub context: Attributes,

    pub entity_level: LevelResult,
    pub device_level: LevelResult,
    pub integration_level: LevelResult,

    pub final_success: bool,

    /// No level succeeded and no refusal or unknown target cut the escalation short
    pub exhausted: bool,

    pub total_duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Execution this one replays
    pub replay_of: Option<Uuid>,
}

impl CascadeExecution {
    pub fn trigger(&self) -> CascadeTrigger {
        CascadeTrigger {
            entity_id: self.entity_id.clone(),
            automation_id: self.automation_id.clone(),
            context: self.context.clone(),
        }
    }
}

/// Completed execution plus the integration-level engine outcome, if that level ran
#[derive(Debug, Clone)]
pub struct CascadeReport {
    pub execution: CascadeExecution,
    pub integration_outcome: Option<HealOutcome>,
}

/// Runs cascades for one instance
pub struct CascadeOrchestrator {
    instance_id: String,
    config: CascadeConfig,
    controller: Arc<dyn Controller>,
    directory: Arc<IntegrationDirectory>,
    engine: Arc<HealingEngine>,
    cache: Arc<EntityCache>,
    detector: Arc<Mutex<IssueDetector>>,
    store: Option<Store>,
    clock: SharedClock,
}

impl CascadeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: impl Into<String>,
        config: CascadeConfig,
        controller: Arc<dyn Controller>,
        directory: Arc<IntegrationDirectory>,
        engine: Arc<HealingEngine>,
        cache: Arc<EntityCache>,
        detector: Arc<Mutex<IssueDetector>>,
        store: Option<Store>,
        clock: SharedClock,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            config,
            controller,
            directory,
            engine,
            cache,
            detector,
            store,
            clock,
        }
    }

    pub async fn run(&self, trigger: CascadeTrigger) -> CascadeReport {
        self.execute(trigger, None).await
    }

    /// Rerun a stored execution's trigger as a new execution
    pub async fn replay(&self, execution_id: Uuid) -> MedicResult<CascadeReport> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| MedicError::NotFound(format!("cascade {execution_id}")))?;

        let instance = self.instance_id.clone();
        let original = store
            .run_blocking(move |s| s.load_cascade(&instance, execution_id))
            .await?
            .ok_or_else(|| MedicError::NotFound(format!("cascade {execution_id}")))?;

        info!(instance = %self.instance_id, original = %execution_id, entity_id = %original.entity_id, "replaying cascade");
        Ok(self.execute(original.trigger(), Some(execution_id)).await)
    }

    #[instrument(skip(self, trigger), fields(instance = %self.instance_id, entity_id = %trigger.entity_id))]
    async fn execute(&self, trigger: CascadeTrigger, replay_of: Option<Uuid>) -> CascadeReport {
        let id = Uuid::new_v4();
        let started_at = self.clock.now();
        let started = Instant::now();
        let entity_id = trigger.entity_id.as_str();

        let entity_level = if self.config.entity_level {
            self.entity_action(entity_id).await
        } else {
            LevelResult::skipped("entity level disabled")
        };

        let device_level = if entity_level.succeeded {
            LevelResult::default()
        } else if !self.config.device_level {
            LevelResult::skipped("device level disabled")
        } else {
            self.device_action(entity_id).await
        };

        let mut integration_outcome: Option<HealOutcome> = None;
        let integration_level = if entity_level.succeeded || device_level.succeeded {
            LevelResult::default()
        } else if !self.config.integration_level {
            LevelResult::skipped("integration level disabled")
        } else {
            let outcome = self.engine.heal_entity(entity_id).await;
            let level = LevelResult {
                attempted: outcome.was_attempted(),
                succeeded: outcome.is_healed(),
                detail: Some(outcome.reason()),
            };
            integration_outcome = Some(outcome);
            level
        };

        let final_success = entity_level.succeeded || device_level.succeeded || integration_level.succeeded;
        // A refused or unknown integration target blocks escalation rather than exhausting it
        let blocked = integration_outcome.as_ref().is_some_and(|o| !o.was_attempted());
        let any_attempted = entity_level.attempted || device_level.attempted || integration_level.attempted;
        let exhausted = !final_success && any_attempted && !blocked;
        let execution = CascadeExecution {
            id,
            instance_id: self.instance_id.clone(),
            entity_id: trigger.entity_id,
            automation_id: trigger.automation_id,
            context: trigger.context,
            entity_level,
            device_level,
            integration_level,
            final_success,
            exhausted,
            total_duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            completed_at: self.clock.now(),
            replay_of,
        };

        if final_success {
            info!(instance = %self.instance_id, cascade = %id, entity_id = %execution.entity_id, "cascade succeeded");
        } else if exhausted {
            warn!(instance = %self.instance_id, cascade = %id, entity_id = %execution.entity_id, "cascade exhausted every level");
        } else {
            info!(instance = %self.instance_id, cascade = %id, entity_id = %execution.entity_id, "cascade stopped without an attempt to escalate");
        }

        self.persist(&execution).await;
        CascadeReport {
            execution,
            integration_outcome,
        }
    }

    async fn entity_action(&self, entity_id: &str) -> LevelResult {
        let result = self
            .controller
            .call_service("homeassistant", "update_entity", json!({ "entity_id": entity_id }))
            .await;
        self.settle(entity_id, "update_entity", result).await
    }

    async fn device_action(&self, entity_id: &str) -> LevelResult {
        let Some(device_id) = self.directory.device_for_entity(entity_id) else {
            return LevelResult::skipped("no device known for entity");
        };

        let result = self
            .controller
            .call_service("homeassistant", "reload_config_entry", json!({ "device_id": device_id }))
            .await;
        self.settle(entity_id, &format!("reload device {device_id}"), result).await
    }

    /// Turn a remote result into a level result; a level only succeeds once the entity is healthy
    ///
    /// With a verify delay the cached state is checked after waiting, otherwise
    /// the current state is fetched from the controller right away.
    async fn settle(&self, entity_id: &str, action: &str, result: MedicResult<()>) -> LevelResult {
        if let Err(e) = result {
            return LevelResult::ran(false, format!("{action} failed: {e}"));
        }

        let state = if self.config.verify_delay_ms == 0 {
            match self.controller.get_state(entity_id).await {
                Ok(state) => state,
                Err(e) => return LevelResult::ran(false, format!("{action} succeeded but state is unverified: {e}")),
            }
        } else {
            tokio::time::sleep(Duration::from_millis(self.config.verify_delay_ms)).await;
            match self.cache.get(entity_id) {
                Some(state) => state,
                None => return LevelResult::ran(false, format!("{action} succeeded but entity is gone")),
            }
        };
        let classified = self.detector.lock().classify(&state, self.clock.now());
        match classified {
            None => LevelResult::ran(true, format!("{action} succeeded and entity is healthy")),
            Some(kind) => LevelResult::ran(false, format!("{action} succeeded but entity is still {kind}")),
        }
    }

    async fn persist(&self, execution: &CascadeExecution) {
        let Some(store) = &self.store else {
            return;
        };
        let record = execution.clone();
        if let Err(e) = store.run_blocking(move |s| s.record_cascade(&record)).await {
            warn!(instance = %self.instance_id, cascade = %execution.id, error = %e, "failed to persist cascade");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{HealingConfig, MonitoringConfig};
    use crate::healing::BreakerState;
    use crate::state::EntityState;
    use crate::testing::{ControllerCall, FakeController};

    struct Harness {
        cascade: CascadeOrchestrator,
        controller: Arc<FakeController>,
        cache: Arc<EntityCache>,
        store: Store,
    }

    async fn harness(config: CascadeConfig) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let controller = Arc::new(FakeController::with_entities(&["light.kitchen"]));
        let directory = Arc::new(IntegrationDirectory::new("home", None, Some(store.clone())));
        directory.add_manual_mapping("light.kitchen", "hue01").await.unwrap();
        harness_with(config, store, controller, directory)
    }

    fn harness_with(
        config: CascadeConfig,
        store: Store,
        controller: Arc<FakeController>,
        directory: Arc<IntegrationDirectory>,
    ) -> Harness {
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));

        let engine = Arc::new(HealingEngine::new(
            "home",
            HealingConfig {
                cooldown_secs: 0,
                ..Default::default()
            },
            directory.clone(),
            controller.clone(),
            Some(store.clone()),
            clock.clone(),
        ));
        let cache = Arc::new(EntityCache::new("home"));
        let detector = Arc::new(Mutex::new(IssueDetector::from_config(&MonitoringConfig::default()).unwrap()));

        let cascade = CascadeOrchestrator::new(
            "home",
            config,
            controller.clone(),
            directory,
            engine,
            cache.clone(),
            detector,
            Some(store.clone()),
            clock,
        );
        Harness {
            cascade,
            controller,
            cache,
            store,
        }
    }

    #[tokio::test]
    async fn test_entity_success_stops_escalation() {
        let h = harness(CascadeConfig::default()).await;

        let report = h.cascade.run(CascadeTrigger::for_entity("light.kitchen")).await;
        let execution = report.execution;
        assert!(execution.final_success);
        assert!(execution.entity_level.attempted && execution.entity_level.succeeded);
        assert!(!execution.device_level.attempted);
        assert!(!execution.integration_level.attempted);
        assert!(report.integration_outcome.is_none());
        assert_eq!(h.controller.reload_count("hue01"), 0);
    }

    #[tokio::test]
    async fn test_integration_level_decides_outcome() {
        let h = harness(CascadeConfig::default()).await;
        h.controller.fail("service:homeassistant.update_entity");

        // No device known: device level skipped, integration level attempted
        let execution = h.cascade.run(CascadeTrigger::for_entity("light.kitchen")).await.execution;
        assert!(execution.entity_level.attempted && !execution.entity_level.succeeded);
        assert!(!execution.device_level.attempted);
        assert!(execution.integration_level.attempted && execution.integration_level.succeeded);
        assert!(execution.final_success);
        assert!(!execution.exhausted);

        h.controller.fail("reload:hue01");
        let report = h.cascade.run(CascadeTrigger::for_entity("light.kitchen")).await;
        assert!(!report.execution.final_success);
        assert!(report.execution.exhausted);
        assert!(matches!(report.integration_outcome, Some(HealOutcome::Failed { .. })));
    }

    #[tokio::test]
    async fn test_refused_integration_level_is_not_attempted() {
        let h = harness(CascadeConfig {
            entity_level: false,
            device_level: false,
            ..Default::default()
        })
        .await;

        let execution = h.cascade.run(CascadeTrigger::for_entity("switch.unmapped")).await.execution;
        assert!(!execution.entity_level.attempted);
        assert_eq!(execution.entity_level.detail.as_deref(), Some("entity level disabled"));
        assert!(!execution.integration_level.attempted);
        assert!(execution.integration_level.detail.unwrap().starts_with("target not found"));
        assert!(!execution.final_success);
        assert!(!execution.exhausted);
    }

    #[tokio::test]
    async fn test_open_circuit_blocks_without_exhausting() {
        let h = harness(CascadeConfig::default()).await;
        h.controller.fail("service:homeassistant.update_entity");
        h.store
            .save_breaker("home", "hue01", "light", &BreakerState {
                consecutive_failures: 5,
                circuit_open_until: Some(Utc::now() + chrono::Duration::hours(1)),
                last_successful_heal: None,
            })
            .unwrap();

        let report = h.cascade.run(CascadeTrigger::for_entity("light.kitchen")).await;
        assert!(matches!(report.integration_outcome, Some(HealOutcome::Refused { .. })));
        assert!(!report.execution.integration_level.attempted);
        assert!(!report.execution.final_success);
        assert!(!report.execution.exhausted);
        assert_eq!(h.controller.reload_count("hue01"), 0);

        let stored = h.store.load_cascade("home", report.execution.id).unwrap().unwrap();
        assert!(!stored.exhausted);
    }

    #[tokio::test]
    async fn test_accepted_action_on_unhealthy_entity_escalates() {
        let h = harness(CascadeConfig::default()).await;
        h.controller
            .set_states(vec![EntityState::new("light.kitchen", "unavailable", Utc::now())]);

        let execution = h.cascade.run(CascadeTrigger::for_entity("light.kitchen")).await.execution;
        assert!(execution.entity_level.attempted && !execution.entity_level.succeeded);
        assert!(execution.entity_level.detail.unwrap().contains("still unavailable"));
        assert!(execution.integration_level.succeeded);
        assert_eq!(h.controller.service_count("homeassistant", "update_entity"), 1);
        assert_eq!(h.controller.reload_count("hue01"), 1);
    }

    #[tokio::test]
    async fn test_device_reload_precedes_integration_reload() {
        let dir = tempfile::tempdir().unwrap();
        crate::discovery::registry::fixtures::write_registry(dir.path());
        let store = Store::open_in_memory().unwrap();
        let controller = Arc::new(FakeController::with_entities(&["light.kitchen"]));
        let directory = Arc::new(IntegrationDirectory::new(
            "home",
            Some(dir.path().to_path_buf()),
            Some(store.clone()),
        ));
        directory.discover_all(controller.as_ref()).await.unwrap();
        controller.fail("service:homeassistant.update_entity");
        controller.fail("service:homeassistant.reload_config_entry");

        let h = harness_with(CascadeConfig::default(), store, controller, directory);
        let execution = h.cascade.run(CascadeTrigger::for_entity("light.kitchen")).await.execution;

        assert!(execution.entity_level.attempted && !execution.entity_level.succeeded);
        assert!(execution.device_level.attempted && !execution.device_level.succeeded);
        assert!(execution.integration_level.attempted && execution.integration_level.succeeded);
        assert!(execution.final_success);

        let device_call = h
            .controller
            .calls()
            .into_iter()
            .find(|c| matches!(c, ControllerCall::Service { service, .. } if service == "reload_config_entry"))
            .unwrap();
        assert_eq!(
            device_call,
            ControllerCall::Service {
                domain: "homeassistant".into(),
                service: "reload_config_entry".into(),
                data: json!({ "device_id": "dev-kitchen" }),
            }
        );
        assert_eq!(h.controller.reload_count("hue01"), 1);

        // Every level attempted and failed
        h.controller.fail("reload:hue01");
        let execution = h.cascade.run(CascadeTrigger::for_entity("light.kitchen")).await.execution;
        assert!(execution.entity_level.attempted && execution.device_level.attempted);
        assert!(execution.integration_level.attempted && !execution.integration_level.succeeded);
        assert!(execution.exhausted);
    }

    #[tokio::test]
    async fn test_verification_requires_healthy_state() {
        let h = harness(CascadeConfig {
            verify_delay_ms: 5,
            device_level: false,
            integration_level: false,
            ..Default::default()
        })
        .await;
        h.cache.put(EntityState::new("light.kitchen", "unavailable", Utc::now()));

        let execution = h.cascade.run(CascadeTrigger::for_entity("light.kitchen")).await.execution;
        assert!(execution.entity_level.attempted);
        assert!(!execution.entity_level.succeeded);
        assert!(execution.entity_level.detail.unwrap().contains("still unavailable"));

        h.cache.put(EntityState::new("light.kitchen", "on", Utc::now()));
        let execution = h.cascade.run(CascadeTrigger::for_entity("light.kitchen")).await.execution;
        assert!(execution.final_success);
    }

    #[tokio::test]
    async fn test_replay_creates_new_execution() {
        let h = harness(CascadeConfig::default()).await;
        let mut trigger = CascadeTrigger::for_entity("light.kitchen");
        trigger.automation_id = Some("automation.morning".into());
        trigger.context.insert("issue_kind".into(), "unavailable".into());

        let original = h.cascade.run(trigger.clone()).await.execution;
        let replayed = h.cascade.replay(original.id).await.unwrap().execution;

        assert_ne!(replayed.id, original.id);
        assert_eq!(replayed.replay_of, Some(original.id));
        assert_eq!(replayed.trigger(), trigger);

        let stored = h.store.load_cascade("home", original.id).unwrap().unwrap();
        assert_eq!(stored, original);
        assert_eq!(h.store.cascades("home", 10).unwrap().len(), 2);

        let missing = h.cascade.replay(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(missing, MedicError::NotFound(_)));
    }
}
