//! SQLite schema and migrations for the FSM store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // Enable WAL mode for better concurrent access
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // Enable foreign keys
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            target_url TEXT NOT NULL,
            started_at TEXT NOT NULL DEFAULT (datetime('now')),
            ended_at TEXT,
            status TEXT NOT NULL DEFAULT 'running',
            config TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS page_states (
            state_hash TEXT PRIMARY KEY,
            session_id TEXT REFERENCES sessions(id),
            url TEXT NOT NULL,
            page_title TEXT,
            accessibility_tree TEXT,
            first_seen TEXT NOT NULL,
            visit_count INTEGER NOT NULL DEFAULT 1,
            is_dead_end INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT REFERENCES sessions(id),
            from_state_hash TEXT NOT NULL REFERENCES page_states(state_hash),
            to_state_hash TEXT NOT NULL REFERENCES page_states(state_hash),
            action_kind TEXT NOT NULL,
            action_target TEXT NOT NULL,
            action_data TEXT,
            observation_ids TEXT,
            timestamp TEXT NOT NULL,
            success INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS observations (
            id TEXT PRIMARY KEY,
            session_id TEXT REFERENCES sessions(id),
            interaction_id INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            request_headers TEXT,
            request_body TEXT,
            status_code INTEGER NOT NULL,
            response_headers TEXT,
            response_body TEXT,
            page_url TEXT,
            ui_action TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS hypotheses (
            id TEXT PRIMARY KEY,
            session_id TEXT REFERENCES sessions(id),
            kind TEXT NOT NULL,
            description TEXT NOT NULL,
            endpoint_pattern TEXT,
            method TEXT,
            body TEXT NOT NULL,
            confidence REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS probe_results (
            id TEXT PRIMARY KEY,
            session_id TEXT REFERENCES sessions(id),
            hypothesis_id TEXT REFERENCES hypotheses(id),
            probe_kind TEXT NOT NULL,
            request TEXT,
            response_status INTEGER NOT NULL,
            response_body TEXT,
            outcome TEXT NOT NULL,
            confidence_delta REAL NOT NULL DEFAULT 0,
            notes TEXT,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;

    // Indexes for common queries
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transitions_from ON transitions(from_state_hash)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transitions_to ON transitions(to_state_hash)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observations_session_url ON observations(session_id, url)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_hypotheses_session ON hypotheses(session_id, kind, confidence)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_probe_results_hypothesis ON probe_results(hypothesis_id)",
        [],
    )?;

    // Record migration
    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='page_states'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
