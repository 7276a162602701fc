// Per-instance pipeline workers
// state changes -> detection -> issues -> healing -> notifications

use crate::cascade::{CascadeOrchestrator, CascadeReport, CascadeTrigger};
use crate::clock::SharedClock;
use crate::discovery::IntegrationDirectory;
use crate::healing::{HealOutcome, HealingEngine};
use crate::ingest::{ChannelExit, RealtimeChannel};
use crate::monitor::{HealthIssue, IssueDetector, IssueKind};
use crate::network::Controller;
use crate::notify::Notification;
use crate::observability;
use crate::state::{AttributeValue, EntityCache, StateChange};
use crate::store::Store;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Everything the workers of one instance share
pub(crate) struct Pipeline {
    pub instance_id: String,
    pub controller: Arc<dyn Controller>,
    pub cache: Arc<EntityCache>,
    pub directory: Arc<IntegrationDirectory>,
    pub detector: Arc<Mutex<IssueDetector>>,
    pub engine: Arc<HealingEngine>,
    pub cascade: Arc<CascadeOrchestrator>,
    pub cascade_enabled: bool,
    pub notify_tx: Option<mpsc::Sender<Notification>>,
    pub store: Store,
    pub clock: SharedClock,
}

impl Pipeline {
    /// Clear the detector tracker after a successful remediation
    pub fn resolve(&self, entity_id: &str) {
        self.detector.lock().resolve(entity_id);
    }

    pub async fn notify(&self, notification: Notification) {
        let Some(tx) = &self.notify_tx else {
            return;
        };
        if tx.send(notification).await.is_err() {
            debug!(instance = %self.instance_id, "notification worker gone - dropping notification");
        }
    }

    /// Notifications owed for an engine outcome; refusals and unknown targets owe none
    pub async fn notify_outcome(&self, entity_id: &str, issue_kind: Option<IssueKind>, outcome: &HealOutcome) {
        if let HealOutcome::Failed {
            target,
            attempt,
            error,
            consecutive_failures,
            circuit_opened_until,
        } = outcome
        {
            self.notify(Notification::healing_failed(
                &self.instance_id,
                entity_id,
                issue_kind,
                *attempt,
                error,
            ))
            .await;

            if let Some(until) = circuit_opened_until {
                self.notify(Notification::circuit_opened(
                    &self.instance_id,
                    target,
                    Some(entity_id),
                    *consecutive_failures,
                    *until,
                ))
                .await;
            }
        }
    }

    pub async fn notify_cascade(&self, issue_kind: Option<IssueKind>, report: &CascadeReport) {
        let execution = &report.execution;
        match &report.integration_outcome {
            Some(outcome) => self.notify_outcome(&execution.entity_id, issue_kind, outcome).await,
            None if execution.exhausted => {
                self.notify(Notification::cascade_exhausted(
                    &self.instance_id,
                    &execution.entity_id,
                    issue_kind,
                    execution.id,
                ))
                .await;
            }
            None => {}
        }
    }

    async fn record_issue(&self, issue: &HealthIssue) {
        let instance_id = self.instance_id.clone();
        let persisted = issue.clone();
        if let Err(e) = self
            .store
            .run_blocking(move |store| store.record_health_issue(&instance_id, &persisted))
            .await
        {
            warn!(instance = %self.instance_id, error = %e, "failed to record health event");
        }
    }
}

/// Detection worker: evaluates changed entities and sweeps the cache on an interval
pub(crate) async fn run_detection_worker(
    pipeline: Arc<Pipeline>,
    mut changes: mpsc::Receiver<StateChange>,
    issues_tx: mpsc::Sender<HealthIssue>,
    sweep_interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let issues = tokio::select! {
            _ = token.cancelled() => break,
            change = changes.recv() => match change {
                Some(StateChange::Updated(entity_id)) => {
                    let Some(state) = pipeline.cache.get(&entity_id) else {
                        continue;
                    };
                    let now = pipeline.clock.now();
                    let issue = pipeline.detector.lock().evaluate(&state, now);
                    issue.into_iter().collect::<Vec<_>>()
                }
                Some(StateChange::Removed(entity_id)) => {
                    pipeline.detector.lock().forget(&entity_id);
                    continue;
                }
                None => break,
            },
            _ = ticker.tick() => {
                let snapshot = pipeline.cache.all();
                let now = pipeline.clock.now();
                let found = pipeline.detector.lock().sweep(snapshot.values(), now);
                found
            }
        };

        for issue in issues {
            pipeline.record_issue(&issue).await;
            if issues_tx.send(issue).await.is_err() {
                debug!(instance = %pipeline.instance_id, "healing worker gone");
                return;
            }
        }
    }
    info!(instance = %pipeline.instance_id, "detection worker stopped");
}

/// Healing worker: routes each issue through the cascade or straight to the engine
pub(crate) async fn run_healing_worker(
    pipeline: Arc<Pipeline>,
    mut issues: mpsc::Receiver<HealthIssue>,
    token: CancellationToken,
) {
    loop {
        let issue = tokio::select! {
            _ = token.cancelled() => break,
            next = issues.recv() => match next {
                Some(issue) => issue,
                None => break,
            },
        };

        if issue.kind == IssueKind::Recovered {
            info!(instance = %pipeline.instance_id, entity_id = %issue.entity_id, "entity recovered");
            continue;
        }

        let span = observability::healing_span(&pipeline.instance_id, &issue.entity_id);
        handle_issue(&pipeline, issue).instrument(span).await;
    }
    info!(instance = %pipeline.instance_id, "healing worker stopped");
}

async fn handle_issue(pipeline: &Pipeline, issue: HealthIssue) {
    warn!(
        instance = %pipeline.instance_id,
        entity_id = %issue.entity_id,
        kind = %issue.kind,
        "health issue detected"
    );

    if pipeline.cascade_enabled {
        let mut trigger = CascadeTrigger::for_entity(issue.entity_id.clone());
        trigger
            .context
            .insert("issue_kind".into(), AttributeValue::from(issue.kind.as_str()));
        let report = pipeline.cascade.run(trigger).await;
        if report.execution.final_success {
            pipeline.resolve(&issue.entity_id);
        }
        pipeline.notify_cascade(Some(issue.kind), &report).await;
    } else {
        let outcome = pipeline.engine.heal_entity(&issue.entity_id).await;
        if outcome.is_healed() {
            pipeline.resolve(&issue.entity_id);
        }
        debug!(instance = %pipeline.instance_id, entity_id = %issue.entity_id, reason = %outcome.reason());
        pipeline.notify_outcome(&issue.entity_id, Some(issue.kind), &outcome).await;
    }
}

/// Realtime channel wrapper surfacing a permanent stop as a degraded-instance notification
pub(crate) async fn run_ingest(pipeline: Arc<Pipeline>, channel: RealtimeChannel, token: CancellationToken) {
    let reason = match channel.run(token).await {
        ChannelExit::Cancelled => return,
        ChannelExit::AuthFailed(message) => format!("authentication rejected ({message})"),
        ChannelExit::Exhausted { attempts } => format!("reconnect attempts exhausted after {attempts} tries"),
    };
    warn!(instance = %pipeline.instance_id, %reason, "instance degraded - continuing on reconciliation only");
    pipeline
        .notify(Notification::instance_degraded(&pipeline.instance_id, &reason))
        .await;
}

/// Discovery refresh on reload signals, at most once per `min_interval`
pub(crate) async fn run_discovery_refresh(
    pipeline: Arc<Pipeline>,
    mut refresh_rx: mpsc::Receiver<()>,
    min_interval: Duration,
    token: CancellationToken,
) {
    let mut last_refresh: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            signal = refresh_rx.recv() => if signal.is_none() { break },
        }

        if let Some(last) = last_refresh {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(min_interval - elapsed) => {}
                }
            }
        }
        // Signals that arrived while waiting are covered by this refresh
        while refresh_rx.try_recv().is_ok() {}

        last_refresh = Some(Instant::now());
        match pipeline.directory.discover_all(pipeline.controller.as_ref()).await {
            Ok(result) => info!(
                instance = %pipeline.instance_id,
                source = result.source.as_str(),
                integrations = result.integrations.len(),
                "discovery refreshed"
            ),
            Err(e) => warn!(instance = %pipeline.instance_id, error = %e, "discovery refresh failed"),
        }
    }
    info!(instance = %pipeline.instance_id, "discovery refresh stopped");
}
