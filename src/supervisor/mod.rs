// Fleet Supervisor Module
// Owns one pipeline per monitored instance and the administrative surface over them

mod workers;

use crate::cascade::{CascadeExecution, CascadeOrchestrator, CascadeReport, CascadeTrigger};
use crate::clock::{self, SharedClock};
use crate::config::{InstanceConfig, MedicConfig, SinkKind};
use crate::discovery::IntegrationDirectory;
use crate::error::{MedicError, MedicResult};
use crate::healing::{HealOutcome, HealingAction, HealingEngine};
use crate::ingest::{run_reconciliation, InstanceHealth, RealtimeChannel};
use crate::monitor::{IssueDetector, TrackedIssue};
use crate::network::{Controller, HomeAssistantClient};
use crate::notify::{run_notification_worker, ControllerSink, LogSink, NotificationSink};
use crate::signals::ShutdownCoordinator;
use crate::state::EntityCache;
use crate::store::Store;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use workers::Pipeline;

/// Point-in-time status of one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub health: InstanceHealth,
    pub entities: usize,
    pub integrations: usize,
    pub open_issues: usize,
}

/// One supervised controller and its task group
pub struct Instance {
    id: String,
    pipeline: Arc<Pipeline>,
    status_rx: watch::Receiver<InstanceHealth>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Cache persistence writer, awaited last
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn health(&self) -> InstanceHealth {
        self.status_rx.borrow().clone()
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.pipeline.cache
    }

    pub fn directory(&self) -> &Arc<IntegrationDirectory> {
        &self.pipeline.directory
    }

    pub fn engine(&self) -> &Arc<HealingEngine> {
        &self.pipeline.engine
    }

    pub fn open_issues(&self) -> Vec<TrackedIssue> {
        self.pipeline.detector.lock().open_issues()
    }

    /// Cancel every task, wait for them, then drain the persistence writer
    async fn stop(&self) {
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(instance = %self.id, error = %e, "instance task panicked");
            }
        }

        self.pipeline.cache.close();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!(instance = %self.id, error = %e, "persistence writer panicked");
            }
        }
        info!(instance = %self.id, "instance stopped");
    }
}

/// Fleet supervisor
///
/// Instances share the store and the clock and nothing else; a failure in
/// one instance's tasks never reaches another.
pub struct Supervisor {
    config: MedicConfig,
    store: Store,
    clock: SharedClock,
    instances: DashMap<String, Arc<Instance>>,
    shutdown: ShutdownCoordinator,
}

impl Supervisor {
    pub fn new(config: MedicConfig, store: Store, clock: SharedClock) -> Self {
        info!(instances = config.instances.len(), "Initializing fleet supervisor");
        Self {
            config,
            store,
            clock,
            instances: DashMap::new(),
            shutdown: ShutdownCoordinator::new(),
        }
    }

    /// Supervisor over the configured database with the wall clock
    pub fn from_config(config: MedicConfig) -> MedicResult<Self> {
        let store = Store::open(&config.database.path)?;
        Ok(Self::new(config, store, clock::system()))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Start every configured instance; returns how many came up
    pub async fn start_all(&self) -> MedicResult<usize> {
        let mut started = 0;
        for instance in self.config.instances.clone() {
            let id = instance.id.clone();
            match self.add_instance(instance).await {
                Ok(()) => started += 1,
                Err(e) => error!(instance = %id, error = %e, "failed to start instance"),
            }
        }

        if started == 0 && !self.config.instances.is_empty() {
            return Err(MedicError::Config("no instance could be started".into()));
        }
        Ok(started)
    }

    /// Start monitoring a controller over its REST and websocket APIs
    pub async fn add_instance(&self, config: InstanceConfig) -> MedicResult<()> {
        let controller: Arc<dyn Controller> =
            Arc::new(HomeAssistantClient::new(&config.url, &config.token, &self.config.rest)?);
        let sink: Arc<dyn NotificationSink> = match self.config.notifications.sink {
            SinkKind::PersistentNotification => Arc::new(ControllerSink::new(controller.clone())),
            SinkKind::Log => Arc::new(LogSink),
        };
        self.add_instance_with(config, controller, sink).await
    }

    /// Start an instance against an explicit controller and notification sink
    #[instrument(skip_all, fields(instance = %config.id))]
    pub async fn add_instance_with(
        &self,
        config: InstanceConfig,
        controller: Arc<dyn Controller>,
        sink: Arc<dyn NotificationSink>,
    ) -> MedicResult<()> {
        if self.instances.contains_key(&config.id) {
            return Err(MedicError::Config(format!("instance '{}' is already running", config.id)));
        }
        let id = config.id.clone();
        let monitoring = config.monitoring_or(&self.config.monitoring).clone();
        let detector = Arc::new(Mutex::new(IssueDetector::from_config(&monitoring)?));

        let capacity = monitoring.channel_capacity;
        let (changes_tx, changes_rx) = mpsc::channel(capacity);
        let (issues_tx, issues_rx) = mpsc::channel(capacity);
        let (notify_tx, notify_rx) = mpsc::channel(capacity);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);

        let (cache, writer) = EntityCache::with_store(id.clone(), self.store.clone(), Some(changes_tx));
        let cache = Arc::new(cache);
        let warm_id = id.clone();
        match self.store.run_blocking(move |store| store.load_entities(&warm_id)).await {
            Ok(states) => {
                info!(entities = states.len(), "warmed entity cache from store");
                cache.warm(states);
            }
            Err(e) => warn!(error = %e, "could not warm entity cache"),
        }

        let directory = Arc::new(IntegrationDirectory::new(
            id.clone(),
            config.registry_path.clone(),
            Some(self.store.clone()),
        ));
        if let Err(e) = directory.load_persisted().await {
            warn!(error = %e, "could not load persisted discovery");
        }
        match directory.discover_all(controller.as_ref()).await {
            Ok(result) => info!(
                source = result.source.as_str(),
                integrations = result.integrations.len(),
                mappings = result.mappings.len(),
                "discovery complete"
            ),
            Err(e) => warn!(error = %e, "discovery failed - healing limited to manual mappings"),
        }

        let engine = Arc::new(HealingEngine::new(
            id.clone(),
            self.config.healing.clone(),
            directory.clone(),
            controller.clone(),
            Some(self.store.clone()),
            self.clock.clone(),
        ));
        let cascade = Arc::new(CascadeOrchestrator::new(
            id.clone(),
            self.config.cascade.clone(),
            controller.clone(),
            directory.clone(),
            engine.clone(),
            cache.clone(),
            detector.clone(),
            Some(self.store.clone()),
            self.clock.clone(),
        ));

        let notifications = self.config.notifications.enabled;
        let pipeline = Arc::new(Pipeline {
            instance_id: id.clone(),
            controller: controller.clone(),
            cache: cache.clone(),
            directory,
            detector,
            engine,
            cascade,
            cascade_enabled: self.config.cascade.enabled,
            notify_tx: notifications.then_some(notify_tx),
            store: self.store.clone(),
            clock: self.clock.clone(),
        });

        let token = self.shutdown.child();
        let (status_tx, status_rx) = watch::channel(InstanceHealth::Starting);
        let mut tasks = Vec::new();

        if config.realtime {
            let channel = RealtimeChannel::new(
                id.clone(),
                &config.url,
                config.token.clone(),
                self.config.websocket.clone(),
                cache.clone(),
                status_tx,
            )?
            .with_refresh(refresh_tx);
            tasks.push(tokio::spawn(workers::run_ingest(pipeline.clone(), channel, token.clone())));
        } else {
            status_tx.send_replace(InstanceHealth::Polling);
            drop(refresh_tx);
        }

        tasks.push(tokio::spawn(run_reconciliation(
            id.clone(),
            controller,
            cache,
            monitoring.reconcile_interval(),
            token.clone(),
        )));
        tasks.push(tokio::spawn(workers::run_detection_worker(
            pipeline.clone(),
            changes_rx,
            issues_tx,
            monitoring.sweep_interval(),
            token.clone(),
        )));
        tasks.push(tokio::spawn(workers::run_healing_worker(
            pipeline.clone(),
            issues_rx,
            token.clone(),
        )));
        if notifications {
            tasks.push(tokio::spawn(run_notification_worker(
                id.clone(),
                sink,
                notify_rx,
                token.clone(),
            )));
        }
        tasks.push(tokio::spawn(workers::run_discovery_refresh(
            pipeline.clone(),
            refresh_rx,
            Duration::from_secs(self.config.websocket.discovery_refresh_min_interval_secs),
            token.clone(),
        )));

        let instance = Arc::new(Instance {
            id: id.clone(),
            pipeline,
            status_rx,
            token,
            tasks: Mutex::new(tasks),
            writer: Mutex::new(Some(writer)),
        });
        self.instances.insert(id, instance);
        info!("instance started");
        Ok(())
    }

    pub fn instance(&self, instance_id: &str) -> MedicResult<Arc<Instance>> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MedicError::NotFound(format!("instance {instance_id}")))
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Manually heal the integration owning an entity
    pub async fn heal_entity(&self, instance_id: &str, entity_id: &str) -> MedicResult<HealOutcome> {
        let instance = self.instance(instance_id)?;
        let pipeline = &instance.pipeline;
        let outcome = pipeline.engine.heal_entity(entity_id).await;
        if outcome.is_healed() {
            pipeline.resolve(entity_id);
        }
        pipeline.notify_outcome(entity_id, None, &outcome).await;
        info!(instance = %instance_id, %entity_id, reason = %outcome.reason(), "manual heal finished");
        Ok(outcome)
    }

    /// Manually run the escalation policy for an entity
    pub async fn trigger_cascade(&self, instance_id: &str, trigger: CascadeTrigger) -> MedicResult<CascadeReport> {
        let instance = self.instance(instance_id)?;
        let pipeline = &instance.pipeline;
        let entity_id = trigger.entity_id.clone();
        let report = pipeline.cascade.run(trigger).await;
        if report.execution.final_success {
            pipeline.resolve(&entity_id);
        }
        pipeline.notify_cascade(None, &report).await;
        Ok(report)
    }

    pub async fn replay_cascade(&self, instance_id: &str, execution_id: Uuid) -> MedicResult<CascadeReport> {
        let instance = self.instance(instance_id)?;
        let pipeline = &instance.pipeline;
        let report = pipeline.cascade.replay(execution_id).await?;
        if report.execution.final_success {
            pipeline.resolve(&report.execution.entity_id);
        }
        pipeline.notify_cascade(None, &report).await;
        Ok(report)
    }

    /// Pin an entity to an integration entry; persisted before it takes effect
    pub async fn add_manual_mapping(&self, instance_id: &str, entity_id: &str, entry_id: &str) -> MedicResult<()> {
        let instance = self.instance(instance_id)?;
        instance.pipeline.directory.add_manual_mapping(entity_id, entry_id).await
    }

    pub fn instance_status(&self, instance_id: &str) -> MedicResult<InstanceStatus> {
        let instance = self.instance(instance_id)?;
        Ok(InstanceStatus {
            instance_id: instance.id.clone(),
            health: instance.health(),
            entities: instance.pipeline.cache.len(),
            integrations: instance.pipeline.directory.integrations().len(),
            open_issues: instance.open_issues().len(),
        })
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.instance_ids()
            .iter()
            .filter_map(|id| self.instance_status(id).ok())
            .collect()
    }

    pub async fn recent_healing_actions(&self, instance_id: &str, limit: usize) -> MedicResult<Vec<HealingAction>> {
        self.instance(instance_id)?;
        let id = instance_id.to_string();
        Ok(self
            .store
            .run_blocking(move |store| store.healing_actions(&id, limit))
            .await?)
    }

    pub async fn recent_cascades(&self, instance_id: &str, limit: usize) -> MedicResult<Vec<CascadeExecution>> {
        self.instance(instance_id)?;
        let id = instance_id.to_string();
        Ok(self.store.run_blocking(move |store| store.cascades(&id, limit)).await?)
    }

    /// Stop one instance and forget it
    pub async fn remove_instance(&self, instance_id: &str) -> MedicResult<()> {
        let (_, instance) = self
            .instances
            .remove(instance_id)
            .ok_or_else(|| MedicError::NotFound(format!("instance {instance_id}")))?;
        instance.stop().await;
        Ok(())
    }

    /// Cancel every instance and wait for their tasks to drain
    pub async fn shutdown(&self) {
        info!("Stopping fleet supervisor");
        self.shutdown.trigger();

        let instances: Vec<Arc<Instance>> = self.instances.iter().map(|e| e.value().clone()).collect();
        self.instances.clear();
        for instance in instances {
            instance.stop().await;
        }
        info!("Fleet supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MonitoringConfig;
    use crate::notify::MemorySink;
    use crate::state::EntityState;
    use crate::testing::FakeController;
    use chrono::Utc;

    fn offline_instance(id: &str) -> InstanceConfig {
        InstanceConfig {
            id: id.to_string(),
            url: "http://127.0.0.1:9".into(),
            token: "token".into(),
            registry_path: None,
            realtime: false,
            monitoring: None,
        }
    }

    fn supervisor() -> (Supervisor, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let mut config = MedicConfig::default();
        config.monitoring = MonitoringConfig {
            grace_period_secs: 0,
            ..MonitoringConfig::default()
        };
        config.healing.cooldown_secs = 0;
        let store = Store::open_in_memory().unwrap();
        (Supervisor::new(config, store, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_duplicate_instance_rejected() {
        let (supervisor, _) = supervisor();
        let controller = Arc::new(FakeController::with_entities(&["light.kitchen"]));
        let sink = Arc::new(MemorySink::default());

        supervisor
            .add_instance_with(offline_instance("home"), controller.clone(), sink.clone())
            .await
            .unwrap();
        let err = supervisor
            .add_instance_with(offline_instance("home"), controller, sink)
            .await
            .unwrap_err();
        assert!(matches!(err, MedicError::Config(_)));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let (supervisor, _) = supervisor();
        assert!(matches!(
            supervisor.heal_entity("nowhere", "light.kitchen").await,
            Err(MedicError::NotFound(_))
        ));
        assert!(supervisor.instance_status("nowhere").is_err());
    }

    #[tokio::test]
    async fn test_status_and_manual_heal() {
        let (supervisor, _) = supervisor();
        let controller = Arc::new(FakeController::with_entities(&["light.kitchen", "light.hall"]));
        supervisor
            .add_instance_with(offline_instance("home"), controller.clone(), Arc::new(MemorySink::default()))
            .await
            .unwrap();

        // Heuristic discovery maps every light to the domain target
        let outcome = supervisor.heal_entity("home", "light.kitchen").await.unwrap();
        assert!(outcome.is_healed());
        assert_eq!(controller.service_count("light", "reload"), 1);

        let status = supervisor.instance_status("home").unwrap();
        assert_eq!(status.health, InstanceHealth::Polling);
        assert_eq!(status.integrations, 1);

        let actions = supervisor.recent_healing_actions("home", 10).await.unwrap();
        assert_eq!(actions.len(), 1);

        supervisor.remove_instance("home").await.unwrap();
        assert!(supervisor.instance_ids().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_persistence() {
        let (supervisor, _) = supervisor();
        let controller = Arc::new(FakeController::with_entities(&["sensor.power"]));
        supervisor
            .add_instance_with(offline_instance("home"), controller, Arc::new(MemorySink::default()))
            .await
            .unwrap();

        let instance = supervisor.instance("home").unwrap();
        instance
            .cache()
            .put(EntityState::new("sensor.power", "12", Utc::now()));
        supervisor.shutdown().await;

        let persisted = supervisor.store().load_entities("home").unwrap();
        assert!(persisted.iter().any(|s| s.entity_id == "sensor.power"));
    }
}
