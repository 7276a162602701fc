// In-memory controller for tests and offline runs
// Records every command and fails the ones it is told to

use crate::error::{MedicError, MedicResult};
use crate::network::Controller;
use crate::state::EntityState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Command observed by [`FakeController`]
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCall {
    Reload(String),
    Service {
        domain: String,
        service: String,
        data: serde_json::Value,
    },
    Notification {
        title: String,
        message: String,
    },
}

/// Controller double with scripted failures
///
/// Failure keys are `reload:<entry_id>` and `service:<domain>.<service>`.
#[derive(Default)]
pub struct FakeController {
    states: Mutex<Vec<EntityState>>,
    fail_states: AtomicBool,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<ControllerCall>>,

    /// Runs after each snapshot is taken, before it is returned
    states_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl FakeController {
    /// Controller whose snapshot holds the given ids, all "on"
    pub fn with_entities(entity_ids: &[&str]) -> Self {
        let controller = Self::default();
        controller.set_states(
            entity_ids
                .iter()
                .map(|id| EntityState::new(*id, "on", Utc::now()))
                .collect(),
        );
        controller
    }

    pub fn set_states(&self, states: Vec<EntityState>) {
        *self.states.lock() = states;
    }

    /// Make snapshot queries fail with a connection error
    pub fn fail_states(&self, fail: bool) {
        self.fail_states.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` between taking a snapshot and returning it
    pub fn on_get_states(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.states_hook.lock() = Some(Box::new(hook));
    }

    pub fn fail(&self, key: &str) {
        self.failing.lock().insert(key.to_string());
    }

    pub fn succeed(&self, key: &str) {
        self.failing.lock().remove(key);
    }

    pub fn calls(&self) -> Vec<ControllerCall> {
        self.calls.lock().clone()
    }

    pub fn reload_count(&self, entry_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, ControllerCall::Reload(id) if id == entry_id))
            .count()
    }

    pub fn service_count(&self, domain: &str, service: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, ControllerCall::Service { domain: d, service: s, .. } if d == domain && s == service))
            .count()
    }

    /// Total remediation commands (reloads and service calls)
    pub fn command_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| !matches!(c, ControllerCall::Notification { .. }))
            .count()
    }

    fn outcome(&self, key: String) -> MedicResult<()> {
        if self.failing.lock().contains(&key) {
            Err(MedicError::Remote {
                status: 500,
                message: format!("{key} failed"),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Controller for FakeController {
    async fn get_states(&self) -> MedicResult<Vec<EntityState>> {
        if self.fail_states.load(Ordering::SeqCst) {
            return Err(MedicError::Connection("controller offline".into()));
        }
        let snapshot = self.states.lock().clone();
        if let Some(hook) = self.states_hook.lock().as_ref() {
            hook();
        }
        Ok(snapshot)
    }

    async fn get_state(&self, entity_id: &str) -> MedicResult<EntityState> {
        self.states
            .lock()
            .iter()
            .find(|s| s.entity_id == entity_id)
            .cloned()
            .ok_or_else(|| MedicError::NotFound(entity_id.to_string()))
    }

    async fn call_service(&self, domain: &str, service: &str, data: serde_json::Value) -> MedicResult<()> {
        self.calls.lock().push(ControllerCall::Service {
            domain: domain.to_string(),
            service: service.to_string(),
            data,
        });
        self.outcome(format!("service:{domain}.{service}"))
    }

    async fn reload_config_entry(&self, entry_id: &str) -> MedicResult<()> {
        self.calls.lock().push(ControllerCall::Reload(entry_id.to_string()));
        self.outcome(format!("reload:{entry_id}"))
    }

    async fn create_notification(
        &self,
        title: &str,
        message: &str,
        _notification_id: Option<&str>,
    ) -> MedicResult<()> {
        self.calls.lock().push(ControllerCall::Notification {
            title: title.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn history(&self, entity_id: &str, start: DateTime<Utc>) -> MedicResult<Vec<EntityState>> {
        Ok(self
            .states
            .lock()
            .iter()
            .filter(|s| s.entity_id == entity_id && s.last_updated >= start)
            .cloned()
            .collect())
    }
}
