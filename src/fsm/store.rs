//! SQLite-backed FSM store implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::browser::ActionKind;
use crate::error::{Error, Result};
use crate::fsm::schema::{initialize_schema, is_initialized};
use crate::hypothesis::{Hypothesis, ProbeResult};
use crate::interceptor::Observation;
use crate::statehash::StateHash;

/// SQLite-backed store for sessions, page states, transitions, observations,
/// hypotheses, and probe results.
pub struct FsmStore {
    conn: Arc<Mutex<Connection>>,
}

impl FsmStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| Error::storage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::storage(e.to_string()))
    }

    /// Run a write, retrying once synchronously on storage failure.
    fn write_with_retry<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        match self.with_conn(&f) {
            Ok(value) => Ok(value),
            Err(Error::Storage(_)) => self.with_conn(&f),
            Err(other) => Err(other),
        }
    }

    // ==================== Session Operations ====================

    /// Create a session row.
    pub fn create_session(&self, session_id: &str, target_url: &str, config: &Value) -> Result<()> {
        let config_json = serde_json::to_string(config)?;
        self.write_with_retry(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, target_url, started_at, status, config)
                 VALUES (?1, ?2, ?3, 'running', ?4)",
                params![session_id, target_url, Utc::now().to_rfc3339(), config_json],
            )?;
            Ok(())
        })
    }

    /// Update a session's status; completed/failed sessions get an end time.
    pub fn update_session_status(&self, session_id: &str, status: &str) -> Result<()> {
        let ended_at = if matches!(status, "completed" | "failed") {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        self.write_with_retry(move |conn| {
            conn.execute(
                "UPDATE sessions SET status = ?2, ended_at = COALESCE(?3, ended_at) WHERE id = ?1",
                params![session_id, status, ended_at],
            )?;
            Ok(())
        })
    }

    /// Get a session by id.
    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, target_url, started_at, ended_at, status, config
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        target_url: row.get(1)?,
                        started_at: parse_datetime(row.get::<_, String>(2)?),
                        ended_at: row.get::<_, Option<String>>(3)?.map(parse_datetime),
                        status: row.get(4)?,
                        config: row
                            .get::<_, Option<String>>(5)?
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or(Value::Null),
                    })
                },
            )
            .optional()
        })
    }

    // ==================== State Operations ====================

    /// Add a page state. Returns true iff the state is new; a duplicate
    /// insert increments the visit count and leaves every other field
    /// unchanged.
    pub fn add_state(
        &self,
        hash: StateHash,
        session_id: &str,
        url: &str,
        title: &str,
        accessibility_tree: Option<&Value>,
    ) -> Result<bool> {
        let tree_json = match accessibility_tree {
            Some(tree) => Some(serde_json::to_string(tree)?),
            None => None,
        };
        let hash_text = hash.to_string();

        self.write_with_retry(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO page_states
                 (state_hash, session_id, url, page_title, accessibility_tree, first_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    hash_text,
                    session_id,
                    url,
                    title,
                    tree_json,
                    Utc::now().to_rfc3339()
                ],
            )?;

            if inserted == 0 {
                conn.execute(
                    "UPDATE page_states SET visit_count = visit_count + 1 WHERE state_hash = ?1",
                    params![hash_text],
                )?;
                Ok(false)
            } else {
                Ok(true)
            }
        })
    }

    /// Get a state by hash.
    pub fn get_state(&self, hash: StateHash) -> Result<Option<PageStateRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT state_hash, session_id, url, page_title, first_seen, visit_count, is_dead_end
                 FROM page_states WHERE state_hash = ?1",
                params![hash.to_string()],
                row_to_state,
            )
            .optional()
        })
    }

    /// Mark a state as a dead end.
    pub fn mark_dead_end(&self, hash: StateHash) -> Result<()> {
        self.write_with_retry(move |conn| {
            conn.execute(
                "UPDATE page_states SET is_dead_end = 1 WHERE state_hash = ?1",
                params![hash.to_string()],
            )?;
            Ok(())
        })
    }

    /// All states recorded for a session.
    pub fn session_states(&self, session_id: &str) -> Result<Vec<PageStateRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state_hash, session_id, url, page_title, first_seen, visit_count, is_dead_end
                 FROM page_states WHERE session_id = ?1 ORDER BY first_seen",
            )?;
            let states = stmt
                .query_map(params![session_id], row_to_state)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(states)
        })
    }

    /// Find an existing state within the Hamming threshold of the given hash.
    pub fn find_similar_state(
        &self,
        session_id: &str,
        hash: StateHash,
        threshold: u32,
    ) -> Result<Option<StateHash>> {
        let states = self.session_states(session_id)?;
        Ok(states
            .iter()
            .filter_map(|state| StateHash::parse(&state.state_hash))
            .min_by_key(|candidate| candidate.distance(&hash))
            .filter(|candidate| candidate.same_state(&hash, threshold)))
    }

    // ==================== Transition Operations ====================

    /// Insert a transition. Both endpoint states must already exist
    /// (invariant I5); violating that is fatal for the session.
    #[allow(clippy::too_many_arguments)]
    pub fn add_transition(
        &self,
        session_id: &str,
        from: StateHash,
        to: StateHash,
        action_kind: ActionKind,
        action_target: &str,
        action_data: Option<&Value>,
        observation_ids: &[String],
        success: bool,
    ) -> Result<i64> {
        for (label, hash) in [("from", from), ("to", to)] {
            if self.get_state(hash)?.is_none() {
                return Err(Error::invariant(format!(
                    "transition references unknown {} state {}",
                    label, hash
                )));
            }
        }

        let action_json = match action_data {
            Some(data) => Some(serde_json::to_string(data)?),
            None => None,
        };
        let observation_csv = observation_ids.join(",");

        self.write_with_retry(move |conn| {
            conn.execute(
                "INSERT INTO transitions
                 (session_id, from_state_hash, to_state_hash, action_kind, action_target,
                  action_data, observation_ids, timestamp, success)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session_id,
                    from.to_string(),
                    to.to_string(),
                    action_kind.to_string(),
                    action_target,
                    action_json,
                    observation_csv,
                    Utc::now().to_rfc3339(),
                    success as i32,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Whether this outgoing action has been attempted from a state.
    pub fn has_transition(
        &self,
        from: StateHash,
        action_kind: ActionKind,
        action_target: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM transitions
                 WHERE from_state_hash = ?1 AND action_kind = ?2 AND action_target = ?3
                 LIMIT 1",
                params![from.to_string(), action_kind.to_string(), action_target],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })
    }

    /// Filter candidate actions down to those never attempted from a state.
    pub fn unexplored_actions(
        &self,
        from: StateHash,
        candidates: &[(ActionKind, String)],
    ) -> Result<Vec<(ActionKind, String)>> {
        let mut unexplored = Vec::new();
        for (kind, target) in candidates {
            if !self.has_transition(from, *kind, target)? {
                unexplored.push((*kind, target.clone()));
            }
        }
        Ok(unexplored)
    }

    /// All transitions leaving a state.
    pub fn transitions_from(&self, from: StateHash) -> Result<Vec<TransitionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, from_state_hash, to_state_hash, action_kind,
                        action_target, action_data, observation_ids, timestamp, success
                 FROM transitions WHERE from_state_hash = ?1 ORDER BY id",
            )?;
            let transitions = stmt
                .query_map(params![from.to_string()], row_to_transition)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(transitions)
        })
    }

    // ==================== Observation Operations ====================

    /// Persist an observation. Observations are append-only and never
    /// deleted, so evidence references always stay resolvable.
    pub fn insert_observation(&self, observation: &Observation) -> Result<()> {
        let request_headers = serde_json::to_string(&observation.request_headers)?;
        let response_headers = serde_json::to_string(&observation.response_headers)?;
        let ui_action = match &observation.ui_action {
            Some(action) => Some(serde_json::to_string(action)?),
            None => None,
        };

        self.write_with_retry(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO observations
                 (id, session_id, interaction_id, timestamp, method, url,
                  request_headers, request_body, status_code, response_headers,
                  response_body, page_url, ui_action)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    observation.id.to_string(),
                    observation.session_id,
                    observation.interaction_id as i64,
                    observation.timestamp.to_rfc3339(),
                    observation.method,
                    observation.url,
                    request_headers,
                    observation.request_body,
                    observation.status as i64,
                    response_headers,
                    observation.response_body,
                    observation.page_url,
                    ui_action,
                ],
            )?;
            Ok(())
        })
    }

    /// Count observations recorded for a session.
    pub fn observation_count(&self, session_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM observations WHERE session_id = ?1",
                params![session_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count as u64)
        })
    }

    // ==================== Hypothesis / Probe Persistence ====================

    /// Upsert a hypothesis snapshot. The full structure is stored as a JSON
    /// blob; hot columns are broken out for indexed queries.
    pub fn upsert_hypothesis(&self, session_id: &str, hypothesis: &Hypothesis) -> Result<()> {
        let body = serde_json::to_string(hypothesis)?;
        self.write_with_retry(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO hypotheses
                 (id, session_id, kind, description, endpoint_pattern, method, body,
                  confidence, status, created_by, created_at, updated_at, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    hypothesis.id.to_string(),
                    session_id,
                    hypothesis.kind.to_string(),
                    hypothesis.description,
                    hypothesis.endpoint_pattern,
                    hypothesis.method,
                    body,
                    hypothesis.confidence,
                    hypothesis.status.to_string(),
                    hypothesis.created_by,
                    hypothesis.created_at.to_rfc3339(),
                    hypothesis.updated_at.to_rfc3339(),
                    hypothesis.revision as i64,
                ],
            )?;
            Ok(())
        })
    }

    /// Load all hypotheses recorded for a session.
    pub fn load_hypotheses(&self, session_id: &str) -> Result<Vec<Hypothesis>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT body FROM hypotheses WHERE session_id = ?1 ORDER BY created_at")?;
            let hypotheses = stmt
                .query_map(params![session_id], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .filter_map(|body| serde_json::from_str(&body).ok())
                .collect();
            Ok(hypotheses)
        })
    }

    /// Persist a probe result.
    pub fn insert_probe_result(&self, session_id: &str, result: &ProbeResult) -> Result<()> {
        let request = serde_json::to_string(&result.request)?;
        self.write_with_retry(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO probe_results
                 (id, session_id, hypothesis_id, probe_kind, request, response_status,
                  response_body, outcome, confidence_delta, notes, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    result.id.to_string(),
                    session_id,
                    result.hypothesis_id.to_string(),
                    result.probe_kind.to_string(),
                    request,
                    result.response_status as i64,
                    result.response_body,
                    result.outcome.to_string(),
                    result.confidence_delta,
                    result.notes,
                    result.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    // ==================== FSM Analysis ====================

    /// Full node/edge view of the session graph for visualization.
    pub fn graph(&self, session_id: &str) -> Result<FsmGraph> {
        self.with_conn(|conn| {
            let mut nodes = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT state_hash, url, page_title, visit_count, is_dead_end
                     FROM page_states WHERE session_id = ?1",
                )?;
                let rows = stmt.query_map(params![session_id], |row| {
                    Ok(GraphNode {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        title: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        visits: row.get::<_, i64>(3)? as u32,
                        dead_end: row.get::<_, i64>(4)? != 0,
                    })
                })?;
                for row in rows {
                    nodes.push(row?);
                }
            }

            let mut edges = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT from_state_hash, to_state_hash, action_kind, action_target, success
                     FROM transitions WHERE session_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![session_id], |row| {
                    Ok(GraphEdge {
                        from: row.get(0)?,
                        to: row.get(1)?,
                        action: format!(
                            "{}({})",
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?
                        ),
                        success: row.get::<_, i64>(4)? != 0,
                    })
                })?;
                for row in rows {
                    edges.push(row?);
                }
            }

            Ok(FsmGraph { nodes, edges })
        })
    }

    /// Detect cycles in the success-only edge subgraph via DFS back-edges.
    pub fn detect_cycles(&self, session_id: &str) -> Result<Vec<Vec<String>>> {
        let adjacency: HashMap<String, Vec<String>> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT from_state_hash, to_state_hash
                 FROM transitions WHERE session_id = ?1 AND success = 1",
            )?;
            let mut graph: HashMap<String, Vec<String>> = HashMap::new();
            let rows = stmt.query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (from, to) = row?;
                graph.entry(from).or_default().push(to);
            }
            Ok(graph)
        })?;

        let mut cycles = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        let mut roots: Vec<&String> = adjacency.keys().collect();
        roots.sort();
        for root in roots {
            if !visited.contains(root.as_str()) {
                dfs_cycles(root, &adjacency, &mut visited, &mut stack, &mut cycles);
            }
        }

        Ok(cycles)
    }
}

fn dfs_cycles(
    node: &str,
    graph: &HashMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    stack: &mut Vec<String>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(node.to_string());
    stack.push(node.to_string());

    if let Some(neighbors) = graph.get(node) {
        for neighbor in neighbors {
            if !visited.contains(neighbor.as_str()) {
                dfs_cycles(neighbor, graph, visited, stack, cycles);
            } else if let Some(start) = stack.iter().position(|n| n == neighbor) {
                // Back edge: the slice from the first occurrence closes a cycle
                let mut cycle: Vec<String> = stack[start..].to_vec();
                cycle.push(neighbor.clone());
                cycles.push(cycle);
            }
        }
    }

    stack.pop();
}

fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<PageStateRow> {
    Ok(PageStateRow {
        state_hash: row.get(0)?,
        session_id: row.get(1)?,
        url: row.get(2)?,
        page_title: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        first_seen: parse_datetime(row.get::<_, String>(4)?),
        visit_count: row.get::<_, i64>(5)? as u32,
        is_dead_end: row.get::<_, i64>(6)? != 0,
    })
}

fn row_to_transition(row: &rusqlite::Row) -> rusqlite::Result<TransitionRow> {
    Ok(TransitionRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        from_state_hash: row.get(2)?,
        to_state_hash: row.get(3)?,
        action_kind: row.get(4)?,
        action_target: row.get(5)?,
        action_data: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        observation_ids: row
            .get::<_, Option<String>>(7)?
            .map(|csv| {
                csv.split(',')
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        timestamp: parse_datetime(row.get::<_, String>(8)?),
        success: row.get::<_, i64>(9)? != 0,
    })
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// A persisted session row.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub target_url: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub config: Value,
}

/// A persisted page state.
#[derive(Debug, Clone)]
pub struct PageStateRow {
    pub state_hash: String,
    pub session_id: String,
    pub url: String,
    pub page_title: String,
    pub first_seen: DateTime<Utc>,
    pub visit_count: u32,
    pub is_dead_end: bool,
}

/// A persisted transition edge.
#[derive(Debug, Clone)]
pub struct TransitionRow {
    pub id: i64,
    pub session_id: String,
    pub from_state_hash: String,
    pub to_state_hash: String,
    pub action_kind: String,
    pub action_target: String,
    pub action_data: Option<Value>,
    pub observation_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Node/edge view for visualization.
#[derive(Debug, Clone, Default)]
pub struct FsmGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub url: String,
    pub title: String,
    pub visits: u32,
    pub dead_end: bool,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub action: String,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_session() -> FsmStore {
        let store = FsmStore::in_memory().unwrap();
        store
            .create_session("sess-1", "https://example.com", &json!({"headless": true}))
            .unwrap();
        store
    }

    #[test]
    fn test_session_lifecycle() {
        let store = store_with_session();
        let session = store.get_session("sess-1").unwrap().unwrap();
        assert_eq!(session.status, "running");
        assert!(session.ended_at.is_none());

        store.update_session_status("sess-1", "completed").unwrap();
        let session = store.get_session("sess-1").unwrap().unwrap();
        assert_eq!(session.status, "completed");
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_add_state_dedup_increments_visits() {
        let store = store_with_session();
        let hash = StateHash(0xabc);

        assert!(store
            .add_state(hash, "sess-1", "https://example.com/a", "A", None)
            .unwrap());
        // Second visit of the same logical page
        assert!(!store
            .add_state(hash, "sess-1", "https://example.com/a", "A", None)
            .unwrap());

        let state = store.get_state(hash).unwrap().unwrap();
        assert_eq!(state.visit_count, 2);
        assert_eq!(state.url, "https://example.com/a");
        assert!(!state.is_dead_end);
    }

    #[test]
    fn test_transition_requires_known_states() {
        let store = store_with_session();
        let a = StateHash(1);
        let b = StateHash(2);
        store.add_state(a, "sess-1", "https://h/a", "A", None).unwrap();

        let missing = store.add_transition(
            "sess-1",
            a,
            b,
            ActionKind::Click,
            "[3]",
            None,
            &[],
            true,
        );
        assert!(matches!(missing, Err(Error::Invariant(_))));

        store.add_state(b, "sess-1", "https://h/b", "B", None).unwrap();
        let id = store
            .add_transition("sess-1", a, b, ActionKind::Click, "[3]", None, &[], true)
            .unwrap();
        assert!(id > 0);
    }

    #[test]
    fn test_has_transition_and_unexplored() {
        let store = store_with_session();
        let a = StateHash(1);
        let b = StateHash(2);
        store.add_state(a, "sess-1", "https://h/a", "A", None).unwrap();
        store.add_state(b, "sess-1", "https://h/b", "B", None).unwrap();
        store
            .add_transition("sess-1", a, b, ActionKind::Click, "[0]", None, &[], true)
            .unwrap();

        assert!(store.has_transition(a, ActionKind::Click, "[0]").unwrap());
        assert!(!store.has_transition(a, ActionKind::Click, "[1]").unwrap());

        let candidates = vec![
            (ActionKind::Click, "[0]".to_string()),
            (ActionKind::Click, "[1]".to_string()),
            (ActionKind::Type, "[0]".to_string()),
        ];
        let unexplored = store.unexplored_actions(a, &candidates).unwrap();
        assert_eq!(unexplored.len(), 2);
    }

    #[test]
    fn test_transition_endpoints_predate_it() {
        let store = store_with_session();
        let a = StateHash(1);
        let b = StateHash(2);
        store.add_state(a, "sess-1", "https://h/a", "A", None).unwrap();
        store.add_state(b, "sess-1", "https://h/b", "B", None).unwrap();
        store
            .add_transition("sess-1", a, b, ActionKind::Click, "[0]", None, &[], true)
            .unwrap();

        let transition = &store.transitions_from(a).unwrap()[0];
        let state_a = store.get_state(a).unwrap().unwrap();
        let state_b = store.get_state(b).unwrap().unwrap();
        assert!(state_a.first_seen <= transition.timestamp);
        assert!(state_b.first_seen <= transition.timestamp);
    }

    #[test]
    fn test_detect_cycles_success_only() {
        let store = store_with_session();
        let (a, b, c) = (StateHash(1), StateHash(2), StateHash(3));
        for (hash, url) in [(a, "a"), (b, "b"), (c, "c")] {
            store
                .add_state(hash, "sess-1", &format!("https://h/{}", url), url, None)
                .unwrap();
        }

        store
            .add_transition("sess-1", a, b, ActionKind::Click, "[0]", None, &[], true)
            .unwrap();
        store
            .add_transition("sess-1", b, a, ActionKind::Back, "back", None, &[], true)
            .unwrap();
        // Failed edge closing a second cycle is ignored
        store
            .add_transition("sess-1", b, c, ActionKind::Click, "[1]", None, &[], true)
            .unwrap();
        store
            .add_transition("sess-1", c, b, ActionKind::Click, "[2]", None, &[], false)
            .unwrap();

        let cycles = store.detect_cycles("sess-1").unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].first(), cycles[0].last());
    }

    #[test]
    fn test_graph_view() {
        let store = store_with_session();
        let a = StateHash(1);
        let b = StateHash(2);
        store.add_state(a, "sess-1", "https://h/a", "A", None).unwrap();
        store.add_state(b, "sess-1", "https://h/b", "B", None).unwrap();
        store.mark_dead_end(b).unwrap();
        store
            .add_transition("sess-1", a, b, ActionKind::Click, "[0]", None, &[], true)
            .unwrap();

        let graph = store.graph("sess-1").unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert!(graph.nodes.iter().any(|n| n.dead_end));
        assert_eq!(graph.edges[0].action, "click([0])");
    }

    #[test]
    fn test_observation_round_trip() {
        let store = store_with_session();
        let observation = crate::interceptor::Observation {
            id: crate::interceptor::ObservationId::new(),
            session_id: "sess-1".to_string(),
            interaction_id: 7,
            timestamp: Utc::now(),
            method: "GET".to_string(),
            url: "https://h/api/users/42".to_string(),
            request_headers: HashMap::new(),
            request_body: None,
            status: 200,
            response_headers: HashMap::new(),
            response_body: Some("{\"id\":42}".to_string()),
            page_url: "https://h/users".to_string(),
            ui_action: None,
        };

        store.insert_observation(&observation).unwrap();
        // Re-insert is a no-op, not an error
        store.insert_observation(&observation).unwrap();
        assert_eq!(store.observation_count("sess-1").unwrap(), 1);
    }

    #[test]
    fn test_hypothesis_persistence_round_trip() {
        let store = store_with_session();
        let hypothesis_store = crate::hypothesis::HypothesisStore::new();
        let hypothesis = hypothesis_store
            .create(
                crate::hypothesis::NewHypothesis::new(
                    crate::hypothesis::HypothesisKind::EndpointSchema,
                    "users endpoint",
                    "analyst",
                )
                .with_endpoint("/api/users/{id}", "GET"),
            )
            .unwrap();

        store.upsert_hypothesis("sess-1", &hypothesis).unwrap();
        let loaded = store.load_hypotheses("sess-1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, hypothesis.id);
        assert_eq!(loaded[0].confidence, hypothesis.confidence);
    }

    #[test]
    fn test_reopen_preserves_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apiscope.db");

        {
            let store = FsmStore::open(&path).unwrap();
            store
                .create_session("sess-1", "https://example.com", &json!({}))
                .unwrap();
            store
                .add_state(StateHash(7), "sess-1", "https://example.com", "Home", None)
                .unwrap();
            store.update_session_status("sess-1", "completed").unwrap();
        }

        let reopened = FsmStore::open(&path).unwrap();
        let session = reopened.get_session("sess-1").unwrap().unwrap();
        assert_eq!(session.status, "completed");
        assert_eq!(reopened.session_states("sess-1").unwrap().len(), 1);
    }

    #[test]
    fn test_find_similar_state() {
        let store = store_with_session();
        let base = StateHash(0b1111_0000);
        store
            .add_state(base, "sess-1", "https://h/a", "A", None)
            .unwrap();

        // Within Hamming 3 of the stored hash
        let close = StateHash(0b1111_0001);
        assert_eq!(
            store.find_similar_state("sess-1", close, 3).unwrap(),
            Some(base)
        );

        let far = StateHash(!base.0);
        assert_eq!(store.find_similar_state("sess-1", far, 3).unwrap(), None);
    }
}
