// SQLite schema for the shared store
// Every table carries instance_id; every query filters on it

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    instance_id   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    state         TEXT NOT NULL,
    attributes    TEXT NOT NULL,
    last_updated  TEXT NOT NULL,
    PRIMARY KEY (instance_id, entity_id)
);

CREATE TABLE IF NOT EXISTS state_history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    old_state     TEXT,
    new_state     TEXT NOT NULL,
    changed_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_state_history_entity
    ON state_history (instance_id, entity_id, id);

CREATE TABLE IF NOT EXISTS health_events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    kind          TEXT NOT NULL,
    detected_at   TEXT NOT NULL,
    details       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_health_events_instance
    ON health_events (instance_id, id);

CREATE TABLE IF NOT EXISTS integrations (
    instance_id           TEXT NOT NULL,
    entry_id              TEXT NOT NULL,
    domain                TEXT NOT NULL,
    title                 TEXT NOT NULL,
    entity_ids            TEXT NOT NULL,
    source                TEXT NOT NULL,
    consecutive_failures  INTEGER NOT NULL DEFAULT 0,
    circuit_open_until    TEXT,
    last_successful_heal  TEXT,
    PRIMARY KEY (instance_id, entry_id)
);

CREATE TABLE IF NOT EXISTS entity_integrations (
    instance_id   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    entry_id      TEXT NOT NULL,
    device_id     TEXT,
    source        TEXT NOT NULL,
    PRIMARY KEY (instance_id, entity_id)
);

CREATE TABLE IF NOT EXISTS healing_actions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id     TEXT NOT NULL,
    entry_id        TEXT NOT NULL,
    entity_id       TEXT,
    action          TEXT NOT NULL,
    attempt_number  INTEGER NOT NULL,
    success         INTEGER NOT NULL,
    error           TEXT,
    duration_ms     INTEGER NOT NULL,
    dry_run         INTEGER NOT NULL,
    timestamp       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_healing_actions_instance
    ON healing_actions (instance_id, id);

CREATE TABLE IF NOT EXISTS cascade_executions (
    id                     TEXT PRIMARY KEY,
    instance_id            TEXT NOT NULL,
    entity_id              TEXT NOT NULL,
    automation_id          TEXT,
    context                TEXT NOT NULL,
    entity_attempted       INTEGER NOT NULL,
    entity_succeeded       INTEGER NOT NULL,
    entity_detail          TEXT,
    device_attempted       INTEGER NOT NULL,
    device_succeeded       INTEGER NOT NULL,
    device_detail          TEXT,
    integration_attempted  INTEGER NOT NULL,
    integration_succeeded  INTEGER NOT NULL,
    integration_detail     TEXT,
    final_success          INTEGER NOT NULL,
    exhausted              INTEGER NOT NULL,
    total_duration_ms      INTEGER NOT NULL,
    started_at             TEXT NOT NULL,
    completed_at           TEXT NOT NULL,
    replay_of              TEXT
);
CREATE INDEX IF NOT EXISTS idx_cascade_instance
    ON cascade_executions (instance_id, started_at);
"#;
