use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use wm_core::{
    Branch, CommitId, MemoryNodeStore, SemanticNode, TemporalNode, TemporalSnapshot,
    constants::MAIN_BRANCH, time::now_unix_secs,
};

use crate::error::{Result, StoreError};
use crate::schema;

const KEY_CURRENT_BRANCH: &str = "trm_current_branch";
const KEY_LAMBDA: &str = "trm_lambda";
const KEY_MAX_DEPTH: &str = "trm_max_recursion_depth";
const KEY_LAST_COMMIT: &str = "trm_last_commit";

/// Row counts for `wm stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub nodes: i64,
    pub active_nodes: i64,
    pub edges: i64,
    pub branches: i64,
    pub temporal_nodes: i64,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata_on(&self.conn, key, value)
    }

    // --- Semantic graph ---

    /// Insert a fact under a fresh id and return it.
    pub fn add_node(&self, label: &str, value: &str, salience: f32, embedding: &[f32]) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO nodes (label, value, embedding, salience, is_active, last_accessed)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                label,
                value,
                serde_json::to_string(embedding)?,
                salience as f64,
                now_unix_secs() as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert or replace a node under its own id.
    pub fn insert_node(&self, node: &SemanticNode) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO nodes
             (id, label, value, embedding, salience, is_active, last_accessed, is_hypothetical, decay_multiplier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                node.id,
                node.label,
                node.value,
                serde_json::to_string(&node.embedding)?,
                node.salience as f64,
                node.is_active as i32,
                node.last_accessed as i64,
                node.is_hypothetical as i32,
                node.hypothetical_decay_multiplier.map(f64::from),
            ],
        )?;
        Ok(())
    }

    /// Add or reweight a directed edge. Both endpoints must exist.
    pub fn add_edge(&self, from: i64, to: i64, weight: f32) -> Result<()> {
        for id in [from, to] {
            if !self.node_exists(id)? {
                return Err(StoreError::InvalidData(format!("node not found: {id}")));
            }
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO edges (from_id, to_id, weight) VALUES (?1, ?2, ?3)",
            params![from, to, weight as f64],
        )?;
        Ok(())
    }

    fn node_exists(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT id FROM nodes WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Load the whole graph. Nodes come back in id order, which is the
    /// allocator's tie-break order.
    pub fn load_node_store(&self) -> Result<MemoryNodeStore> {
        let mut stmt = self.conn.prepare(
            "SELECT id, label, value, embedding, salience, is_active, last_accessed,
                    is_hypothetical, decay_multiplier
             FROM nodes ORDER BY id",
        )?;
        let rows: Vec<(i64, String, String, String, f64, i32, i64, i32, Option<f64>)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut store = MemoryNodeStore::new();
        for (id, label, value, embedding, salience, active, accessed, hypothetical, multiplier) in rows {
            let embedding = parse_embedding(id, &embedding)?;
            let mut node = SemanticNode::new(id, &label, &value, salience as f32)
                .with_embedding(embedding)
                .accessed_at(accessed.max(0) as u64);
            node.is_active = active != 0;
            node.is_hypothetical = hypothetical != 0;
            node.hypothetical_decay_multiplier = multiplier.map(|m| m as f32);
            store.insert(node);
        }

        let mut edge_stmt = self
            .conn
            .prepare("SELECT from_id, to_id, weight FROM edges ORDER BY rowid")?;
        let edges: Vec<(i64, i64, f64)> = edge_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<_, _>>()?;
        for (from, to, weight) in edges {
            store.link(from, to, weight as f32);
        }

        Ok(store)
    }

    /// Write back salience and access times after a turn.
    pub fn save_salience(&self, nodes: &[SemanticNode]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut updated = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE nodes SET salience = ?1, last_accessed = ?2 WHERE id = ?3")?;
            for node in nodes {
                updated += stmt.execute(params![
                    node.salience as f64,
                    node.last_accessed as i64,
                    node.id
                ])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    // --- Temporal memory ---

    /// Replace the persisted temporal memory with `snapshot`.
    pub fn save_temporal(&self, snapshot: &TemporalSnapshot) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch("DELETE FROM trm_nodes; DELETE FROM trm_branches;")?;

        for branch in &snapshot.branches {
            let branch_id = branch.branch_id.to_string();
            tx.execute(
                "INSERT INTO trm_branches (id, name, base_commit, created_at, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    branch_id,
                    branch.branch_name,
                    branch.base_commit.map(|c| c.0 as i64),
                    branch.created_at,
                    branch.is_active as i32,
                ],
            )?;

            let mut stmt = tx.prepare(
                "INSERT INTO trm_nodes
                 (branch_id, position, commit_id, parent_id, content, timestamp, energy, depth, source_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (position, node) in branch.timeline.iter().enumerate() {
                stmt.execute(params![
                    branch_id,
                    position as i64,
                    node.commit_id.0 as i64,
                    node.parent_id.map(|c| c.0 as i64),
                    node.content,
                    node.timestamp,
                    node.activation_energy as f64,
                    node.recursion_depth,
                    node.source_id,
                ])?;
            }
        }

        set_metadata_on(&tx, KEY_CURRENT_BRANCH, &snapshot.current_branch)?;
        set_metadata_on(&tx, KEY_LAMBDA, &snapshot.lambda.to_string())?;
        set_metadata_on(&tx, KEY_MAX_DEPTH, &snapshot.max_recursion_depth.to_string())?;
        set_metadata_on(&tx, KEY_LAST_COMMIT, &snapshot.last_commit.to_string())?;
        tx.commit()?;
        Ok(())
    }

    /// Load the persisted temporal memory, or `None` if nothing was saved.
    pub fn load_temporal(&self) -> Result<Option<TemporalSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, base_commit, created_at, is_active FROM trm_branches ORDER BY rowid",
        )?;
        let rows: Vec<(String, String, Option<i64>, f64, i32)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut branches = Vec::with_capacity(rows.len());
        for (id_str, name, base, created_at, active) in rows {
            let timeline = self.load_timeline(&id_str)?;
            branches.push(Branch {
                branch_id: parse_uuid(&id_str)?,
                branch_name: name,
                base_commit: base.map(|c| CommitId(c as u64)),
                timeline,
                created_at,
                is_active: active != 0,
            });
        }

        let current_branch = self
            .get_metadata(KEY_CURRENT_BRANCH)?
            .unwrap_or_else(|| MAIN_BRANCH.to_string());
        let lambda = parse_metadata(KEY_LAMBDA, self.get_metadata(KEY_LAMBDA)?)?;
        let max_recursion_depth = parse_metadata(KEY_MAX_DEPTH, self.get_metadata(KEY_MAX_DEPTH)?)?;
        let last_commit = parse_metadata(KEY_LAST_COMMIT, self.get_metadata(KEY_LAST_COMMIT)?)?;

        Ok(Some(TemporalSnapshot {
            current_branch,
            lambda: lambda.unwrap_or(wm_core::constants::DEFAULT_LAMBDA),
            max_recursion_depth: max_recursion_depth
                .unwrap_or(wm_core::constants::DEFAULT_MAX_RECURSION_DEPTH),
            last_commit: last_commit.unwrap_or(0),
            branches,
        }))
    }

    fn load_timeline(&self, branch_id: &str) -> Result<Vec<TemporalNode>> {
        let mut stmt = self.conn.prepare(
            "SELECT commit_id, parent_id, content, timestamp, energy, depth, source_id
             FROM trm_nodes WHERE branch_id = ?1 ORDER BY position",
        )?;
        let nodes = stmt
            .query_map([branch_id], |row| {
                Ok(TemporalNode {
                    commit_id: CommitId(row.get::<_, i64>(0)? as u64),
                    parent_id: row.get::<_, Option<i64>>(1)?.map(|c| CommitId(c as u64)),
                    content: row.get(2)?,
                    timestamp: row.get(3)?,
                    activation_energy: row.get::<_, f64>(4)? as f32,
                    recursion_depth: row.get(5)?,
                    source_id: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(nodes)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |row| row.get(0))?) };
        Ok(StoreStats {
            nodes: count("SELECT COUNT(*) FROM nodes")?,
            active_nodes: count("SELECT COUNT(*) FROM nodes WHERE is_active = 1")?,
            edges: count("SELECT COUNT(*) FROM edges")?,
            branches: count("SELECT COUNT(*) FROM trm_branches")?,
            temporal_nodes: count("SELECT COUNT(*) FROM trm_nodes")?,
        })
    }
}

fn set_metadata_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("invalid UUID '{s}': {e}")))
}

fn parse_embedding(id: i64, json: &str) -> Result<Vec<f32>> {
    serde_json::from_str(json)
        .map_err(|e| StoreError::InvalidData(format!("bad embedding on node {id}: {e}")))
}

fn parse_metadata<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| StoreError::InvalidData(format!("bad metadata value for {key}: '{v}'")))
        })
        .transpose()
}
