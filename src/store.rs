// Graph store: labeled nodes with JSON properties in one SQLite file, one
// namespace ("graph") per dataset.
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::model::{now_millis, Record};

pub type Props = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to prepare graph database directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("graph database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid node properties: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid property name '{0}'")]
    PropertyName(String),
}

impl StoreError {
    /// Transient lock contention, worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Dataset namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Graph {
    Bugs,
    Mutations,
    Memory,
}

impl Graph {
    pub fn name(self) -> &'static str {
        match self {
            Graph::Bugs => "kata_bugs",
            Graph::Mutations => "kata_mutations",
            Graph::Memory => "kata_memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub props: Props,
}

impl Node {
    pub fn decode<T: Record>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.props.clone()))?)
    }
}

/// One row of a grouped count.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub keys: Vec<Value>,
    pub count: u64,
    pub avg: Option<f64>,
}

impl Group {
    pub fn key_str(&self, idx: usize) -> Option<&str> {
        self.keys.get(idx).and_then(Value::as_str)
    }

    pub fn key_u64(&self, idx: usize) -> Option<u64> {
        self.keys.get(idx).and_then(Value::as_u64)
    }
}

/// Persistence seam used by every component. Implementations are not assumed
/// to be thread-safe; each worker owns its own store.
pub trait GraphStore {
    fn create(&self, label: &str, props: &Props) -> Result<i64, StoreError>;

    /// Create many nodes in one transaction.
    fn create_batch(&self, label: &str, items: &[Props]) -> Result<usize, StoreError>;

    /// Nodes with `label` whose properties equal every entry of `filter`,
    /// in creation order.
    fn match_nodes(&self, label: &str, filter: &Props) -> Result<Vec<Node>, StoreError>;

    /// Read-modify-write every matching node in one transaction. An error
    /// from `apply` rolls the whole update back.
    fn update(
        &self,
        label: &str,
        filter: &Props,
        apply: &mut dyn FnMut(&mut Props) -> Result<(), StoreError>,
    ) -> Result<usize, StoreError>;

    /// `COUNT(*)` (and optionally `AVG(avg_of)`) grouped by property values,
    /// largest groups first. With no `group_by`, a single total row.
    fn aggregate(
        &self,
        label: &str,
        group_by: &[&str],
        filter: &Props,
        avg_of: Option<&str>,
    ) -> Result<Vec<Group>, StoreError>;

    fn count(&self, label: &str, filter: &Props) -> Result<u64, StoreError> {
        Ok(self
            .aggregate(label, &[], filter, None)?
            .first()
            .map(|g| g.count)
            .unwrap_or(0))
    }
}

/// Build a property filter from `(name, value)` pairs.
pub fn filter<const N: usize>(pairs: [(&str, Value); N]) -> Props {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub fn to_props<T: serde::Serialize>(value: &T) -> Result<Props, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Ok(Map::from_iter([("value".to_string(), other)])),
    }
}

/// Typed access on top of any [`GraphStore`].
pub trait RecordStore {
    fn create_record<T: Record>(&self, record: &T) -> Result<i64, StoreError>;
    fn create_records<T: Record>(&self, records: &[T]) -> Result<usize, StoreError>;
    fn match_records<T: Record>(&self, filter: &Props) -> Result<Vec<T>, StoreError>;
    fn update_records<T: Record>(
        &self,
        filter: &Props,
        apply: impl FnMut(&mut T),
    ) -> Result<usize, StoreError>;
}

impl<S: GraphStore + ?Sized> RecordStore for S {
    fn create_record<T: Record>(&self, record: &T) -> Result<i64, StoreError> {
        self.create(T::LABEL, &to_props(record)?)
    }

    fn create_records<T: Record>(&self, records: &[T]) -> Result<usize, StoreError> {
        let items = records
            .iter()
            .map(to_props)
            .collect::<Result<Vec<_>, _>>()?;
        self.create_batch(T::LABEL, &items)
    }

    fn match_records<T: Record>(&self, filter: &Props) -> Result<Vec<T>, StoreError> {
        self.match_nodes(T::LABEL, filter)?
            .iter()
            .map(Node::decode)
            .collect()
    }

    fn update_records<T: Record>(
        &self,
        filter: &Props,
        mut apply: impl FnMut(&mut T),
    ) -> Result<usize, StoreError> {
        self.update(T::LABEL, filter, &mut |props: &mut Props| {
            let mut record: T = serde_json::from_value(Value::Object(props.clone()))?;
            apply(&mut record);
            *props = to_props(&record)?;
            Ok(())
        })
    }
}

// ── SQLite backend ───────────────────────────────────────────────────────────

/// Connection factory. Cheap to clone; every [`GraphSession`] gets its own
/// connection so workers never share one.
#[derive(Debug, Clone)]
pub struct GraphClient {
    db_path: PathBuf,
    max_retries: u32,
    busy_timeout: Duration,
}

impl GraphClient {
    pub fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::init(Self {
            db_path: config.resolved_db_path(),
            max_retries: config.max_retries,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        })
    }

    /// Open a database at an exact path, ignoring environment overrides.
    #[cfg(test)]
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let defaults = StoreConfig::default();
        Self::init(Self {
            db_path: db_path.into(),
            max_retries: defaults.max_retries,
            busy_timeout: Duration::from_millis(defaults.busy_timeout_ms),
        })
    }

    // Create the file and schema up front so sessions only open.
    fn init(client: Self) -> Result<Self, StoreError> {
        drop(client.open_connection()?);
        Ok(client)
    }

    pub fn session(&self, graph: Graph) -> Result<GraphSession, StoreError> {
        Ok(GraphSession {
            conn: self.open_connection()?,
            graph,
            max_retries: self.max_retries,
        })
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        init_schema(&conn)?;
        Ok(conn)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS nodes (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            graph      TEXT    NOT NULL,
            label      TEXT    NOT NULL,
            props      TEXT    NOT NULL,
            created_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_nodes_graph_label
             ON nodes(graph, label);",
    )?;
    Ok(())
}

/// A connection bound to one graph namespace.
pub struct GraphSession {
    conn: Connection,
    graph: Graph,
    max_retries: u32,
}

impl GraphSession {
    fn retry<T>(&self, op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
        with_retry(self.max_retries, op)
    }

    /// `WHERE graph = ? AND label = ? AND json_extract(props, ?) = ? ...`
    fn where_clause(
        &self,
        label: &str,
        filter: &Props,
        args: &mut Vec<SqlValue>,
    ) -> Result<String, StoreError> {
        let mut sql = String::from("graph = ? AND label = ?");
        args.push(SqlValue::Text(self.graph.name().to_string()));
        args.push(SqlValue::Text(label.to_string()));
        for (key, value) in filter {
            sql.push_str(" AND json_extract(props, ?) = ?");
            args.push(SqlValue::Text(json_path(key)?));
            args.push(to_sql_value(value));
        }
        Ok(sql)
    }
}

impl GraphStore for GraphSession {
    fn create(&self, label: &str, props: &Props) -> Result<i64, StoreError> {
        let json = serde_json::to_string(props)?;
        self.retry(|| {
            self.conn.execute(
                "INSERT INTO nodes (graph, label, props, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![self.graph.name(), label, json, now_millis()],
            )?;
            Ok(self.conn.last_insert_rowid())
        })
    }

    fn create_batch(&self, label: &str, items: &[Props]) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }
        let rows = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.retry(|| {
            let tx = self.conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO nodes (graph, label, props, created_at) VALUES (?1, ?2, ?3, ?4)",
                )?;
                let now = now_millis();
                for json in &rows {
                    stmt.execute(params![self.graph.name(), label, json, now])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
    }

    fn match_nodes(&self, label: &str, filter: &Props) -> Result<Vec<Node>, StoreError> {
        let mut args = Vec::new();
        let where_sql = self.where_clause(label, filter, &mut args)?;
        let sql = format!("SELECT props FROM nodes WHERE {where_sql} ORDER BY id ASC");
        self.retry(|| {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows =
                stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;
            let mut nodes = Vec::new();
            for row in rows {
                let props: Props = serde_json::from_str(&row?)?;
                nodes.push(Node { props });
            }
            Ok(nodes)
        })
    }

    fn update(
        &self,
        label: &str,
        filter: &Props,
        apply: &mut dyn FnMut(&mut Props) -> Result<(), StoreError>,
    ) -> Result<usize, StoreError> {
        let mut args = Vec::new();
        let where_sql = self.where_clause(label, filter, &mut args)?;
        let select = format!("SELECT id, props FROM nodes WHERE {where_sql} ORDER BY id ASC");
        self.retry(|| {
            let tx = self.conn.unchecked_transaction()?;
            let targets: Vec<(i64, String)> = {
                let mut stmt = tx.prepare_cached(&select)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect::<Result<_, _>>()?
            };
            for (id, json) in &targets {
                let mut props: Props = serde_json::from_str(json)?;
                apply(&mut props)?;
                tx.execute(
                    "UPDATE nodes SET props = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&props)?, id],
                )?;
            }
            tx.commit()?;
            Ok(targets.len())
        })
    }

    fn aggregate(
        &self,
        label: &str,
        group_by: &[&str],
        filter: &Props,
        avg_of: Option<&str>,
    ) -> Result<Vec<Group>, StoreError> {
        let mut args = Vec::new();
        let mut select = Vec::new();
        for key in group_by {
            select.push("json_extract(props, ?)".to_string());
            args.push(SqlValue::Text(json_path(key)?));
        }
        select.push("COUNT(*)".to_string());
        match avg_of {
            Some(key) => {
                select.push("AVG(json_extract(props, ?))".to_string());
                args.push(SqlValue::Text(json_path(key)?));
            }
            None => select.push("NULL".to_string()),
        }
        let where_sql = self.where_clause(label, filter, &mut args)?;
        let mut sql = format!("SELECT {} FROM nodes WHERE {where_sql}", select.join(", "));
        if !group_by.is_empty() {
            let positions: Vec<String> = (1..=group_by.len()).map(|i| i.to_string()).collect();
            let count_pos = group_by.len() + 1;
            sql.push_str(&format!(
                " GROUP BY {} ORDER BY {count_pos} DESC, {}",
                positions.join(", "),
                positions.join(", ")
            ));
        }
        debug!(graph = self.graph.name(), %sql, "aggregate");

        let width = group_by.len();
        self.retry(|| {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                let mut keys = Vec::with_capacity(width);
                for idx in 0..width {
                    keys.push(from_sql_value(row.get::<_, SqlValue>(idx)?));
                }
                Ok(Group {
                    keys,
                    count: row.get::<_, i64>(width)? as u64,
                    avg: row.get::<_, Option<f64>>(width + 1)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

/// Retry `op` on lock contention with exponential backoff (100, 200, 400ms…).
pub fn with_retry<T>(
    max_retries: u32,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_busy() || attempt >= max_retries {
                    return Err(e);
                }
                attempt += 1;
                let backoff_ms = 100 * (1u64 << (attempt - 1));
                warn!(attempt, backoff_ms, "graph store busy, retrying");
                std::thread::sleep(Duration::from_millis(backoff_ms));
            }
        }
    }
}

fn json_path(key: &str) -> Result<String, StoreError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::PropertyName(key.to_string()));
    }
    Ok(format!("$.{key}"))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null | SqlValue::Blob(_) => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Value::from(f),
        SqlValue::Text(s) => Value::String(s),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) struct TestStore {
        pub client: GraphClient,
        _dir: TempDir,
    }

    /// Fresh database in a temp dir, dropped with the guard.
    pub(crate) fn isolated_store() -> TestStore {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = GraphClient::open(dir.path().join("graph.db")).expect("open store");
        TestStore { client, _dir: dir }
    }

    fn props(value: Value) -> Props {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn create_and_match_by_properties() {
        let store = isolated_store();
        let s = store.client.session(Graph::Bugs).unwrap();
        s.create("Bug", &props(json!({"type": "A", "line": 3}))).unwrap();
        s.create("Bug", &props(json!({"type": "B", "line": 3}))).unwrap();
        s.create("Note", &props(json!({"type": "A"}))).unwrap();

        let found = s.match_nodes("Bug", &filter([("type", json!("A"))])).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].props["line"], 3);

        let by_line = s.match_nodes("Bug", &filter([("line", json!(3))])).unwrap();
        assert_eq!(by_line.len(), 2);
    }

    #[test]
    fn graphs_are_isolated_namespaces() {
        let store = isolated_store();
        let bugs = store.client.session(Graph::Bugs).unwrap();
        let memory = store.client.session(Graph::Memory).unwrap();
        bugs.create("Bug", &props(json!({"type": "A"}))).unwrap();
        assert_eq!(bugs.count("Bug", &Props::new()).unwrap(), 1);
        assert_eq!(memory.count("Bug", &Props::new()).unwrap(), 0);
    }

    #[test]
    fn boolean_filter_matches_json_booleans() {
        let store = isolated_store();
        let s = store.client.session(Graph::Mutations).unwrap();
        s.create("Mutation", &props(json!({"survived": true}))).unwrap();
        s.create("Mutation", &props(json!({"survived": false}))).unwrap();
        s.create("Mutation", &props(json!({"survived": true}))).unwrap();
        let survived = s
            .count("Mutation", &filter([("survived", json!(true))]))
            .unwrap();
        assert_eq!(survived, 2);
    }

    #[test]
    fn aggregate_groups_and_orders_by_count() {
        let store = isolated_store();
        let s = store.client.session(Graph::Bugs).unwrap();
        let items: Vec<Props> = [("A", 1), ("B", 10), ("B", 20), ("B", 30), ("A", 5)]
            .iter()
            .map(|(t, l)| props(json!({"type": t, "line": l})))
            .collect();
        assert_eq!(s.create_batch("Bug", &items).unwrap(), 5);

        let groups = s
            .aggregate("Bug", &["type"], &Props::new(), Some("line"))
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key_str(0), Some("B"));
        assert_eq!(groups[0].count, 3);
        assert_eq!(groups[0].avg, Some(20.0));
        assert_eq!(groups[1].key_str(0), Some("A"));
        assert_eq!(groups[1].count, 2);
    }

    #[test]
    fn aggregate_without_grouping_returns_single_total() {
        let store = isolated_store();
        let s = store.client.session(Graph::Memory).unwrap();
        let groups = s.aggregate("Rule", &[], &Props::new(), Some("confidence")).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 0);
        assert_eq!(groups[0].avg, None);
    }

    #[test]
    fn update_rewrites_only_matching_nodes() {
        let store = isolated_store();
        let s = store.client.session(Graph::Memory).unwrap();
        s.create("Rule", &props(json!({"type": "A", "confidence": 10}))).unwrap();
        s.create("Rule", &props(json!({"type": "B", "confidence": 10}))).unwrap();

        let n = s
            .update("Rule", &filter([("type", json!("A"))]), &mut |p: &mut Props| {
                p.insert("confidence".into(), json!(12));
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 1);

        let a = s.match_nodes("Rule", &filter([("type", json!("A"))])).unwrap();
        let b = s.match_nodes("Rule", &filter([("type", json!("B"))])).unwrap();
        assert_eq!(a[0].props["confidence"], 12);
        assert_eq!(b[0].props["confidence"], 10);
    }

    #[test]
    fn failing_update_rolls_back() {
        let store = isolated_store();
        let s = store.client.session(Graph::Memory).unwrap();
        s.create("Rule", &props(json!({"type": "A", "n": 1}))).unwrap();
        s.create("Rule", &props(json!({"type": "A", "n": 2}))).unwrap();

        let mut seen = 0;
        let result = s.update("Rule", &Props::new(), &mut |p: &mut Props| {
            seen += 1;
            if seen == 2 {
                return Err(StoreError::PropertyName("boom".into()));
            }
            p.insert("n".into(), json!(99));
            Ok(())
        });
        assert!(result.is_err());
        let nodes = s.match_nodes("Rule", &Props::new()).unwrap();
        assert_eq!(nodes[0].props["n"], 1, "first update must be rolled back");
    }

    #[test]
    fn property_names_are_validated() {
        let store = isolated_store();
        let s = store.client.session(Graph::Bugs).unwrap();
        let err = s
            .match_nodes("Bug", &filter([("a') OR 1=1 --", json!(1))]))
            .unwrap_err();
        assert!(matches!(err, StoreError::PropertyName(_)));
    }

    #[test]
    fn with_retry_gives_up_on_non_busy_errors() {
        let mut calls = 0;
        let result: Result<(), StoreError> = with_retry(3, || {
            calls += 1;
            Err(StoreError::PropertyName("x".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
