// Persistent store shared by every monitored instance
// SQLite behind one connection; all instance-scoped queries filter on instance_id

pub mod schema;

use crate::cascade::{CascadeExecution, LevelResult};
use crate::discovery::{DiscoverySource, EntityMapping, IntegrationRecord};
use crate::error::{StoreError, StoreResult};
use crate::healing::{BreakerState, HealingAction};
use crate::monitor::{HealthIssue, IssueKind};
use crate::state::{Attributes, EntityState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Row of the entity value history
#[derive(Debug, Clone)]
pub struct StateHistoryRow {
    pub entity_id: String,
    pub old_state: Option<String>,
    pub new_state: String,
    pub changed_at: DateTime<Utc>,
}

/// Thread-safe handle to the shared SQLite database
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database file and bootstrap the schema
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Open(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        let store = Self::bootstrap(conn)?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Ephemeral database for tests and dry runs
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::bootstrap(conn)
    }

    /// Run a store operation on the blocking pool
    pub async fn run_blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> StoreResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn bootstrap(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(schema::SCHEMA_SQL)?;
        debug!("store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Entities ───────────────────────────────────────────────────

    pub fn upsert_entity(&self, instance_id: &str, state: &EntityState) -> StoreResult<()> {
        let attributes = serde_json::to_string(&state.attributes)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entities (instance_id, entity_id, state, attributes, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (instance_id, entity_id) DO UPDATE SET
                state = excluded.state,
                attributes = excluded.attributes,
                last_updated = excluded.last_updated",
            params![
                instance_id,
                state.entity_id,
                state.state,
                attributes,
                state.last_updated.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn delete_entity(&self, instance_id: &str, entity_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM entities WHERE instance_id = ?1 AND entity_id = ?2",
            params![instance_id, entity_id],
        )?;
        Ok(())
    }

    pub fn load_entities(&self, instance_id: &str) -> StoreResult<Vec<EntityState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_id, state, attributes, last_updated
             FROM entities WHERE instance_id = ?1 ORDER BY entity_id",
        )?;
        let rows = stmt.query_map(params![instance_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut states = Vec::new();
        for row in rows {
            let (entity_id, state, attributes, last_updated) = row?;
            states.push(EntityState {
                entity_id,
                state,
                attributes: serde_json::from_str::<Attributes>(&attributes)?,
                last_updated: parse_ts(&last_updated)?,
            });
        }
        Ok(states)
    }

    pub fn record_state_change(
        &self,
        instance_id: &str,
        entity_id: &str,
        old_state: Option<&str>,
        new_state: &str,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO state_history (instance_id, entity_id, old_state, new_state, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![instance_id, entity_id, old_state, new_state, changed_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most recent value changes of one entity, newest first
    pub fn state_history(
        &self,
        instance_id: &str,
        entity_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<StateHistoryRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_id, old_state, new_state, changed_at FROM state_history
             WHERE instance_id = ?1 AND entity_id = ?2 ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![instance_id, entity_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (entity_id, old_state, new_state, changed_at) = row?;
            history.push(StateHistoryRow {
                entity_id,
                old_state,
                new_state,
                changed_at: parse_ts(&changed_at)?,
            });
        }
        Ok(history)
    }

    // ── Health events ──────────────────────────────────────────────

    pub fn record_health_issue(&self, instance_id: &str, issue: &HealthIssue) -> StoreResult<()> {
        let details = serde_json::to_string(&issue.details)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO health_events (instance_id, entity_id, kind, detected_at, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                instance_id,
                issue.entity_id,
                issue.kind.as_str(),
                issue.detected_at.to_rfc3339(),
                details
            ],
        )?;
        Ok(())
    }

    /// Most recent health events, newest first
    pub fn health_events(&self, instance_id: &str, limit: usize) -> StoreResult<Vec<HealthIssue>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_id, kind, detected_at, details FROM health_events
             WHERE instance_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![instance_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (entity_id, kind, detected_at, details) = row?;
            let kind = kind
                .parse::<IssueKind>()
                .map_err(StoreError::Corrupt)?;
            events.push(HealthIssue {
                entity_id,
                kind,
                detected_at: parse_ts(&detected_at)?,
                details: serde_json::from_str(&details)?,
            });
        }
        Ok(events)
    }

    // ── Integrations ───────────────────────────────────────────────

    /// Merge discovery fields; breaker columns of an existing row are kept
    pub fn upsert_integration(&self, instance_id: &str, record: &IntegrationRecord) -> StoreResult<()> {
        let entity_ids = serde_json::to_string(&record.entity_ids)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO integrations (instance_id, entry_id, domain, title, entity_ids, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (instance_id, entry_id) DO UPDATE SET
                domain = excluded.domain,
                title = excluded.title,
                entity_ids = excluded.entity_ids,
                source = excluded.source",
            params![
                instance_id,
                record.entry_id,
                record.domain,
                record.title,
                entity_ids,
                record.source.as_str()
            ],
        )?;
        Ok(())
    }

    pub fn upsert_entity_mapping(&self, instance_id: &str, mapping: &EntityMapping) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entity_integrations (instance_id, entity_id, entry_id, device_id, source)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (instance_id, entity_id) DO UPDATE SET
                entry_id = excluded.entry_id,
                device_id = COALESCE(excluded.device_id, entity_integrations.device_id),
                source = excluded.source",
            params![
                instance_id,
                mapping.entity_id,
                mapping.entry_id,
                mapping.device_id,
                mapping.source.as_str()
            ],
        )?;
        Ok(())
    }

    /// Persist a whole discovery result in one transaction
    pub fn merge_discovery(
        &self,
        instance_id: &str,
        records: &[IntegrationRecord],
        mappings: &[EntityMapping],
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO integrations (instance_id, entry_id, domain, title, entity_ids, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (instance_id, entry_id) DO UPDATE SET
                    domain = excluded.domain,
                    title = excluded.title,
                    entity_ids = excluded.entity_ids,
                    source = excluded.source",
                params![
                    instance_id,
                    record.entry_id,
                    record.domain,
                    record.title,
                    serde_json::to_string(&record.entity_ids)?,
                    record.source.as_str()
                ],
            )?;
        }
        for mapping in mappings {
            tx.execute(
                "INSERT INTO entity_integrations (instance_id, entity_id, entry_id, device_id, source)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (instance_id, entity_id) DO UPDATE SET
                    entry_id = excluded.entry_id,
                    device_id = COALESCE(excluded.device_id, entity_integrations.device_id),
                    source = excluded.source",
                params![
                    instance_id,
                    mapping.entity_id,
                    mapping.entry_id,
                    mapping.device_id,
                    mapping.source.as_str()
                ],
            )?;
        }
        tx.commit()?;
        debug!(
            instance = %instance_id,
            integrations = records.len(),
            mappings = mappings.len(),
            "discovery persisted"
        );
        Ok(())
    }

    pub fn load_integrations(&self, instance_id: &str) -> StoreResult<Vec<IntegrationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entry_id, domain, title, entity_ids, source, consecutive_failures,
                    circuit_open_until, last_successful_heal
             FROM integrations WHERE instance_id = ?1 ORDER BY entry_id",
        )?;
        let rows = stmt.query_map(params![instance_id], integration_columns)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(integration_from_columns(row?)?);
        }
        Ok(records)
    }

    pub fn load_integration(&self, instance_id: &str, entry_id: &str) -> StoreResult<Option<IntegrationRecord>> {
        let conn = self.conn.lock();
        let columns = conn
            .query_row(
                "SELECT entry_id, domain, title, entity_ids, source, consecutive_failures,
                        circuit_open_until, last_successful_heal
                 FROM integrations WHERE instance_id = ?1 AND entry_id = ?2",
                params![instance_id, entry_id],
                integration_columns,
            )
            .optional()?;
        columns.map(integration_from_columns).transpose()
    }

    pub fn load_entity_mappings(&self, instance_id: &str) -> StoreResult<Vec<EntityMapping>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_id, entry_id, device_id, source FROM entity_integrations
             WHERE instance_id = ?1 ORDER BY entity_id",
        )?;
        let rows = stmt.query_map(params![instance_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut mappings = Vec::new();
        for row in rows {
            let (entity_id, entry_id, device_id, source) = row?;
            mappings.push(EntityMapping {
                entity_id,
                entry_id,
                device_id,
                source: source.parse().map_err(StoreError::Corrupt)?,
            });
        }
        Ok(mappings)
    }

    /// Write breaker fields, creating a placeholder row for unknown targets
    pub fn save_breaker(
        &self,
        instance_id: &str,
        entry_id: &str,
        domain: &str,
        breaker: &BreakerState,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO integrations (instance_id, entry_id, domain, title, entity_ids, source,
                                       consecutive_failures, circuit_open_until, last_successful_heal)
             VALUES (?1, ?2, ?3, ?2, '[]', ?4, ?5, ?6, ?7)
             ON CONFLICT (instance_id, entry_id) DO UPDATE SET
                consecutive_failures = excluded.consecutive_failures,
                circuit_open_until = excluded.circuit_open_until,
                last_successful_heal = excluded.last_successful_heal",
            params![
                instance_id,
                entry_id,
                domain,
                DiscoverySource::Persisted.as_str(),
                breaker.consecutive_failures as i64,
                breaker.circuit_open_until.map(|t| t.to_rfc3339()),
                breaker.last_successful_heal.map(|t| t.to_rfc3339())
            ],
        )?;
        Ok(())
    }

    // ── Healing actions ────────────────────────────────────────────

    pub fn record_healing_action(&self, action: &HealingAction) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO healing_actions (instance_id, entry_id, entity_id, action, attempt_number,
                                          success, error, duration_ms, dry_run, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                action.instance_id,
                action.entry_id,
                action.entity_id,
                action.action,
                action.attempt_number as i64,
                action.success,
                action.error,
                action.duration_ms as i64,
                action.dry_run,
                action.timestamp.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Most recent healing attempts, newest first
    pub fn healing_actions(&self, instance_id: &str, limit: usize) -> StoreResult<Vec<HealingAction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT instance_id, entry_id, entity_id, action, attempt_number, success, error,
                    duration_ms, dry_run, timestamp
             FROM healing_actions WHERE instance_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![instance_id, limit as i64], |row| {
            Ok((
                HealingAction {
                    instance_id: row.get(0)?,
                    entry_id: row.get(1)?,
                    entity_id: row.get(2)?,
                    action: row.get(3)?,
                    attempt_number: row.get::<_, i64>(4)? as u64,
                    success: row.get(5)?,
                    error: row.get(6)?,
                    duration_ms: row.get::<_, i64>(7)? as u64,
                    dry_run: row.get(8)?,
                    timestamp: Utc::now(),
                },
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut actions = Vec::new();
        for row in rows {
            let (mut action, timestamp) = row?;
            action.timestamp = parse_ts(&timestamp)?;
            actions.push(action);
        }
        Ok(actions)
    }

    // ── Cascades ───────────────────────────────────────────────────

    pub fn record_cascade(&self, execution: &CascadeExecution) -> StoreResult<()> {
        let context = serde_json::to_string(&execution.context)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cascade_executions (
                id, instance_id, entity_id, automation_id, context,
                entity_attempted, entity_succeeded, entity_detail,
                device_attempted, device_succeeded, device_detail,
                integration_attempted, integration_succeeded, integration_detail,
                final_success, exhausted, total_duration_ms, started_at, completed_at, replay_of)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                execution.id.to_string(),
                execution.instance_id,
                execution.entity_id,
                execution.automation_id,
                context,
                execution.entity_level.attempted,
                execution.entity_level.succeeded,
                execution.entity_level.detail,
                execution.device_level.attempted,
                execution.device_level.succeeded,
                execution.device_level.detail,
                execution.integration_level.attempted,
                execution.integration_level.succeeded,
                execution.integration_level.detail,
                execution.final_success,
                execution.exhausted,
                execution.total_duration_ms as i64,
                execution.started_at.to_rfc3339(),
                execution.completed_at.to_rfc3339(),
                execution.replay_of.map(|id| id.to_string())
            ],
        )?;
        Ok(())
    }

    pub fn load_cascade(&self, instance_id: &str, id: Uuid) -> StoreResult<Option<CascadeExecution>> {
        let conn = self.conn.lock();
        let columns = conn
            .query_row(
                &format!("{CASCADE_SELECT} WHERE instance_id = ?1 AND id = ?2"),
                params![instance_id, id.to_string()],
                cascade_columns,
            )
            .optional()?;
        columns.map(cascade_from_columns).transpose()
    }

    /// Most recent cascades, newest first
    pub fn cascades(&self, instance_id: &str, limit: usize) -> StoreResult<Vec<CascadeExecution>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{CASCADE_SELECT} WHERE instance_id = ?1 ORDER BY started_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![instance_id, limit as i64], cascade_columns)?;

        let mut executions = Vec::new();
        for row in rows {
            executions.push(cascade_from_columns(row?)?);
        }
        Ok(executions)
    }
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

type IntegrationColumns = (
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
);

fn integration_columns(row: &Row<'_>) -> rusqlite::Result<IntegrationColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn integration_from_columns(columns: IntegrationColumns) -> StoreResult<IntegrationRecord> {
    let (entry_id, domain, title, entity_ids, source, failures, open_until, last_success) = columns;
    Ok(IntegrationRecord {
        entry_id,
        domain,
        title,
        entity_ids: serde_json::from_str::<BTreeSet<String>>(&entity_ids)?,
        source: source.parse().map_err(StoreError::Corrupt)?,
        breaker: BreakerState {
            consecutive_failures: failures.max(0) as u32,
            circuit_open_until: parse_opt_ts(open_until)?,
            last_successful_heal: parse_opt_ts(last_success)?,
        },
    })
}

const CASCADE_SELECT: &str = "SELECT id, instance_id, entity_id, automation_id, context,
        entity_attempted, entity_succeeded, entity_detail,
        device_attempted, device_succeeded, device_detail,
        integration_attempted, integration_succeeded, integration_detail,
        final_success, exhausted, total_duration_ms, started_at, completed_at, replay_of
    FROM cascade_executions";

struct CascadeColumns {
    id: String,
    instance_id: String,
    entity_id: String,
    automation_id: Option<String>,
    context: String,
    levels: [LevelResult; 3],
    final_success: bool,
    exhausted: bool,
    total_duration_ms: i64,
    started_at: String,
    completed_at: String,
    replay_of: Option<String>,
}

fn cascade_columns(row: &Row<'_>) -> rusqlite::Result<CascadeColumns> {
    let level = |offset: usize| -> rusqlite::Result<LevelResult> {
        Ok(LevelResult {
            attempted: row.get(offset)?,
            succeeded: row.get(offset + 1)?,
            detail: row.get(offset + 2)?,
        })
    };

    Ok(CascadeColumns {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        entity_id: row.get(2)?,
        automation_id: row.get(3)?,
        context: row.get(4)?,
        levels: [level(5)?, level(8)?, level(11)?],
        final_success: row.get(14)?,
        exhausted: row.get(15)?,
        total_duration_ms: row.get(16)?,
        started_at: row.get(17)?,
        completed_at: row.get(18)?,
        replay_of: row.get(19)?,
    })
}

fn cascade_from_columns(columns: CascadeColumns) -> StoreResult<CascadeExecution> {
    let parse_uuid = |raw: &str| {
        Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("cascade id {raw:?}: {e}")))
    };
    let [entity_level, device_level, integration_level] = columns.levels;

    Ok(CascadeExecution {
        id: parse_uuid(&columns.id)?,
        instance_id: columns.instance_id,
        entity_id: columns.entity_id,
        automation_id: columns.automation_id,
        context: serde_json::from_str(&columns.context)?,
        entity_level,
        device_level,
        integration_level,
        final_success: columns.final_success,
        exhausted: columns.exhausted,
        total_duration_ms: columns.total_duration_ms.max(0) as u64,
        started_at: parse_ts(&columns.started_at)?,
        completed_at: parse_ts(&columns.completed_at)?,
        replay_of: columns.replay_of.as_deref().map(parse_uuid).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(entry_id: &str, source: DiscoverySource) -> IntegrationRecord {
        IntegrationRecord {
            entry_id: entry_id.to_string(),
            domain: "hue".to_string(),
            title: "Hue Bridge".to_string(),
            entity_ids: ["light.kitchen".to_string()].into_iter().collect(),
            source,
            breaker: BreakerState::default(),
        }
    }

    #[test]
    fn test_breaker_survives_discovery_merge() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_integration("home", &record("abc", DiscoverySource::Registry)).unwrap();

        let open_until = Utc::now() + Duration::minutes(30);
        let breaker = BreakerState {
            consecutive_failures: 5,
            circuit_open_until: Some(open_until),
            last_successful_heal: None,
        };
        store.save_breaker("home", "abc", "hue", &breaker).unwrap();

        // Rediscovery must not reset breaker columns
        store.upsert_integration("home", &record("abc", DiscoverySource::Registry)).unwrap();

        let loaded = store.load_integration("home", "abc").unwrap().unwrap();
        assert_eq!(loaded.breaker.consecutive_failures, 5);
        assert_eq!(loaded.breaker.circuit_open_until.unwrap().timestamp(), open_until.timestamp());
        assert_eq!(loaded.source, DiscoverySource::Registry);
    }

    #[test]
    fn test_save_breaker_creates_unknown_target() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_breaker("home", "ghost", "zwave", &BreakerState { consecutive_failures: 1, ..Default::default() })
            .unwrap();

        let loaded = store.load_integration("home", "ghost").unwrap().unwrap();
        assert_eq!(loaded.domain, "zwave");
        assert_eq!(loaded.breaker.consecutive_failures, 1);
        assert!(loaded.entity_ids.is_empty());
    }

    #[test]
    fn test_queries_are_instance_scoped() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_integration("home", &record("abc", DiscoverySource::Registry)).unwrap();
        store
            .upsert_entity_mapping(
                "home",
                &EntityMapping {
                    entity_id: "light.kitchen".into(),
                    entry_id: "abc".into(),
                    device_id: None,
                    source: DiscoverySource::Registry,
                },
            )
            .unwrap();
        store
            .record_healing_action(&HealingAction {
                instance_id: "home".into(),
                entry_id: "abc".into(),
                entity_id: Some("light.kitchen".into()),
                action: "reload_config_entry".into(),
                attempt_number: 1,
                success: true,
                error: None,
                duration_ms: 12,
                dry_run: false,
                timestamp: Utc::now(),
            })
            .unwrap();

        assert!(store.load_integrations("cabin").unwrap().is_empty());
        assert!(store.load_integration("cabin", "abc").unwrap().is_none());
        assert!(store.load_entity_mappings("cabin").unwrap().is_empty());
        assert!(store.healing_actions("cabin", 10).unwrap().is_empty());

        let actions = store.healing_actions("home", 10).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].duration_ms, 12);
    }

    #[test]
    fn test_mapping_keeps_known_device() {
        let store = Store::open_in_memory().unwrap();
        let mut mapping = EntityMapping {
            entity_id: "light.kitchen".into(),
            entry_id: "abc".into(),
            device_id: Some("dev-1".into()),
            source: DiscoverySource::Registry,
        };
        store.upsert_entity_mapping("home", &mapping).unwrap();

        mapping.device_id = None;
        mapping.source = DiscoverySource::Manual;
        store.upsert_entity_mapping("home", &mapping).unwrap();

        let loaded = store.load_entity_mappings("home").unwrap();
        assert_eq!(loaded[0].device_id.as_deref(), Some("dev-1"));
        assert_eq!(loaded[0].source, DiscoverySource::Manual);
    }

    #[test]
    fn test_health_events_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        for (i, kind) in [IssueKind::Unavailable, IssueKind::Recovered].into_iter().enumerate() {
            store
                .record_health_issue(
                    "home",
                    &HealthIssue {
                        entity_id: "sensor.door".into(),
                        kind,
                        detected_at: now + Duration::seconds(i as i64),
                        details: Attributes::new(),
                    },
                )
                .unwrap();
        }

        let events = store.health_events("home", 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, IssueKind::Recovered);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("medic.db");
        {
            let store = Store::open(&path).unwrap();
            store
                .upsert_entity("home", &EntityState::new("sensor.a", "1", Utc::now()))
                .unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.load_entities("home").unwrap().len(), 1);
    }
}
