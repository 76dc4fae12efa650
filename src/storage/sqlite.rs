/// SQLite compatibility shim
///
/// Presents the same document-shaped surface as the document store on top of
/// normalized tables. Logical fields are translated through the collection's
/// [`FieldMap`], filters are compiled to parameterized SQL, and embedded arrays
/// are spread over child tables and re-attached on every read.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::StorageConfig;
use crate::storage::aggregate::{self, GroupSpec};
use crate::storage::field_map::{self, ChildTable, FieldMap};
use crate::storage::query::{BatchWrite, Filter, FindOptions, Op, SortOrder, Update, WriteOp};
use crate::storage::schema::{self, SQLITE_SCHEMA};
use crate::storage::{
    now_stamp, seed_default_categories, stamp_new, Collection, CollectionStore, Document,
    StorageAdapter, StorageError, StorageKind, StorageStats,
};

/// Ids bound per `IN (...)` list
const ID_CHUNK: usize = 500;

/// SQLite-backed collection store
///
/// A single connection is shared by every operation; it sits behind an async
/// mutex that is never held across an await point.
pub struct SqliteStore {
    db_path: PathBuf,
    schema_path: Option<PathBuf>,
    connect_attempts: u32,
    connect_delay: Duration,
    conn: Mutex<Option<Connection>>,
    connected: AtomicBool,
}

impl SqliteStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            db_path: config.sqlite_path(),
            schema_path: config.sqlite_schema.clone(),
            connect_attempts: config.connect_attempts.max(1),
            connect_delay: config.connect_delay,
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send,
        T: Send,
    {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StorageError::NotConnected)?;
        f(conn)
    }

    /// Run `f` inside a transaction
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&SqliteTx<'_>) -> Result<T, StorageError> + Send,
        T: Send,
    {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let value = f(&SqliteTx { conn: &tx })?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    async fn load_schema(&self) -> Result<String, StorageError> {
        match &self.schema_path {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                StorageError::Initialization(format!(
                    "Cannot read schema file {}: {}",
                    path.display(),
                    e
                ))
            }),
            None => Ok(SQLITE_SCHEMA.to_string()),
        }
    }
}

/// Collection operations bound to an open transaction
pub struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl SqliteTx<'_> {
    pub fn insert(&self, collection: Collection, document: Document) -> Result<Document, StorageError> {
        insert_row(self.conn, FieldMap::for_collection(collection), document)
    }

    pub fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
        multi: bool,
    ) -> Result<u64, StorageError> {
        update_rows(self.conn, FieldMap::for_collection(collection), filter, update, multi)
    }

    pub fn remove(&self, collection: Collection, filter: &Filter, multi: bool) -> Result<u64, StorageError> {
        remove_rows(self.conn, FieldMap::for_collection(collection), filter, multi)
    }

    /// Run one batched write, returning how many documents it touched
    pub fn apply(&self, write: BatchWrite) -> Result<u64, StorageError> {
        let collection = write.collection;
        match write.op {
            WriteOp::Insert(document) => {
                self.insert(collection, document)?;
                Ok(1)
            }
            WriteOp::Update {
                filter,
                update,
                multi,
            } => self.update(collection, &filter, &update, multi),
            WriteOp::Upsert {
                filter,
                update,
                document,
            } => {
                if self.update(collection, &filter, &update, false)? == 0 {
                    self.insert(collection, document)?;
                }
                Ok(1)
            }
            WriteOp::Remove { filter, multi } => self.remove(collection, &filter, multi),
        }
    }
}

/// Open the database file, apply engine settings and bring the schema up to date
fn open_connection(path: &Path, schema_sql: &str) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)
        .map_err(|e| StorageError::Connection(format!("Failed to open database: {}", e)))?;

    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.busy_timeout(Duration::from_millis(30_000))?;
    register_regexp(&conn)?;

    schema::initialize_database(&conn, schema_sql)?;

    tracing::debug!("SQLite journal mode: {}", journal_mode);
    Ok(conn)
}

/// `X REGEXP Y` calls `regexp(Y, X)`; non-text values never match
fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: String = ctx.get(0)?;
            let regex =
                Regex::new(&pattern).map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Text(bytes) => std::str::from_utf8(bytes).map_or(false, |text| regex.is_match(text)),
                _ => false,
            };
            Ok(matched)
        },
    )
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Row id carried by an `_id` value, if it is one
fn row_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn id_param(value: &Value) -> SqlValue {
    match row_id(value) {
        Some(id) => SqlValue::Integer(id),
        None => to_sql_value(value),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Map unique and primary-key violations to `DuplicateKey`
fn classify(collection: Collection, error: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &error {
        let code = failure.extended_code;
        if code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return StorageError::DuplicateKey {
                collection: collection.name().to_string(),
                key: message.clone().unwrap_or_else(|| failure.to_string()),
            };
        }
    }
    StorageError::Sqlite(error)
}

fn column_for(map: &FieldMap, field: &str) -> Result<&'static str, StorageError> {
    map.column(field).ok_or_else(|| {
        StorageError::Query(format!("Unknown field {} in {}", field, map.collection))
    })
}

/// Compile a filter to a `WHERE` clause and its parameters
fn compile_filter(map: &FieldMap, filter: &Filter) -> Result<(String, Vec<SqlValue>), StorageError> {
    if filter.is_empty() {
        return Ok(("1 = 1".to_string(), Vec::new()));
    }

    let mut clauses = Vec::with_capacity(filter.conditions().len());
    let mut params = Vec::new();

    for condition in filter.conditions() {
        let column = column_for(map, &condition.field)?;
        let bind = |value: &Value| {
            if column == "id" {
                id_param(value)
            } else {
                to_sql_value(value)
            }
        };

        let clause = match &condition.op {
            Op::Eq(Value::Null) => format!("{} IS NULL", column),
            Op::Eq(value) => {
                params.push(bind(value));
                format!("{} = ?", column)
            }
            Op::Ne(Value::Null) => format!("{} IS NOT NULL", column),
            Op::Ne(value) => {
                params.push(bind(value));
                format!("({0} != ? OR {0} IS NULL)", column)
            }
            Op::Gt(value) => {
                params.push(bind(value));
                format!("{} > ?", column)
            }
            Op::Gte(value) => {
                params.push(bind(value));
                format!("{} >= ?", column)
            }
            Op::Lt(value) => {
                params.push(bind(value));
                format!("{} < ?", column)
            }
            Op::Lte(value) => {
                params.push(bind(value));
                format!("{} <= ?", column)
            }
            Op::Exists(true) => format!("{} IS NOT NULL", column),
            Op::Exists(false) => format!("{} IS NULL", column),
            Op::In(values) => {
                let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
                let with_null = present.len() < values.len();
                let mut parts = Vec::new();
                if !present.is_empty() {
                    parts.push(format!(
                        "{} IN ({})",
                        column,
                        vec!["?"; present.len()].join(", ")
                    ));
                    params.extend(present.into_iter().map(|v| bind(v)));
                }
                if with_null {
                    parts.push(format!("{} IS NULL", column));
                }
                match parts.len() {
                    0 => "0 = 1".to_string(),
                    1 => parts.remove(0),
                    _ => format!("({})", parts.join(" OR ")),
                }
            }
            Op::Regex {
                pattern,
                case_insensitive,
            } => {
                let pattern = if *case_insensitive {
                    format!("(?i){}", pattern)
                } else {
                    pattern.clone()
                };
                params.push(SqlValue::Text(pattern));
                format!("{} REGEXP ?", column)
            }
        };
        clauses.push(clause);
    }

    Ok((clauses.join(" AND "), params))
}

fn compile_order(map: &FieldMap, options: &FindOptions) -> Result<String, StorageError> {
    let mut terms = Vec::with_capacity(options.sort.len() + 1);
    for (field, order) in &options.sort {
        let direction = match order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        terms.push(format!("{} {}", column_for(map, field)?, direction));
    }
    // Ties fall back to insertion order
    terms.push("id ASC".to_string());
    Ok(format!(" ORDER BY {}", terms.join(", ")))
}

fn compile_page(options: &FindOptions) -> String {
    match (options.limit, options.skip) {
        (Some(limit), skip) => format!(" LIMIT {} OFFSET {}", limit, skip),
        (None, 0) => String::new(),
        (None, skip) => format!(" LIMIT -1 OFFSET {}", skip),
    }
}

/// Parent rows matching a filter, without their child arrays
fn select_rows(
    conn: &Connection,
    map: &FieldMap,
    filter: &Filter,
    options: &FindOptions,
) -> Result<Vec<Document>, StorageError> {
    filter.validate()?;
    let (clause, params) = compile_filter(map, filter)?;
    let columns: Vec<&str> = map.columns().collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE {}{}{}",
        columns.join(", "),
        map.table,
        clause,
        compile_order(map, options)?,
        compile_page(options)
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut documents = Vec::new();
    while let Some(row) = rows.next()? {
        let mut document = Document::new();
        for (i, (field, column)) in map.fields.iter().enumerate() {
            let value = match (*column, row.get_ref(i)?) {
                ("id", ValueRef::Integer(id)) => Value::String(id.to_string()),
                (_, raw) => from_sql_value(raw),
            };
            document.insert(field.to_string(), value);
        }
        documents.push(document);
    }
    Ok(documents)
}

fn find_rows(
    conn: &Connection,
    map: &FieldMap,
    filter: &Filter,
    options: &FindOptions,
) -> Result<Vec<Document>, StorageError> {
    let mut documents = select_rows(conn, map, filter, options)?;
    attach_children(conn, map, &mut documents)?;
    Ok(documents)
}

/// Re-attach every child array with one `IN (...)` query per child table
fn attach_children(
    conn: &Connection,
    map: &FieldMap,
    documents: &mut [Document],
) -> Result<(), StorageError> {
    if documents.is_empty() || map.children.is_empty() {
        return Ok(());
    }

    let ids: Vec<i64> = documents
        .iter()
        .filter_map(|document| document.get("_id").and_then(row_id))
        .collect();

    for child in map.children {
        let columns: Vec<&str> = child.fields.iter().map(|(_, column)| *column).collect();
        let mut grouped: HashMap<i64, Vec<Value>> = HashMap::new();

        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {}, {} FROM {} WHERE {} IN ({}) ORDER BY id",
                child.foreign_key,
                columns.join(", "),
                child.table,
                child.foreign_key,
                vec!["?"; chunk.len()].join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                let parent: i64 = row.get(0)?;
                let mut element = Document::new();
                for (i, (field, _)) in child.fields.iter().enumerate() {
                    element.insert(field.to_string(), from_sql_value(row.get_ref(i + 1)?));
                }
                grouped.entry(parent).or_default().push(Value::Object(element));
            }
        }

        for document in documents.iter_mut() {
            let items = document
                .get("_id")
                .and_then(row_id)
                .and_then(|id| grouped.remove(&id))
                .unwrap_or_default();
            document.insert(child.array_field.to_string(), Value::Array(items));
        }
    }
    Ok(())
}

fn insert_children(
    conn: &Connection,
    child: &ChildTable,
    parent_id: i64,
    items: &Value,
) -> Result<(), StorageError> {
    let items = match items {
        Value::Null => return Ok(()),
        Value::Array(items) => items,
        other => {
            return Err(StorageError::Query(format!(
                "{} must be an array, got {}",
                child.array_field, other
            )))
        }
    };
    if items.is_empty() {
        return Ok(());
    }

    let columns: Vec<&str> = child.fields.iter().map(|(_, column)| *column).collect();
    let sql = format!(
        "INSERT INTO {} ({}, {}) VALUES (?{})",
        child.table,
        child.foreign_key,
        columns.join(", "),
        ", ?".repeat(columns.len())
    );
    let mut stmt = conn.prepare(&sql)?;

    for item in items {
        let element = item.as_object().ok_or_else(|| {
            StorageError::Query(format!("{} elements must be objects", child.array_field))
        })?;
        let mut values = Vec::with_capacity(columns.len() + 1);
        values.push(SqlValue::Integer(parent_id));
        for (field, _) in child.fields {
            values.push(to_sql_value(element.get(*field).unwrap_or(&Value::Null)));
        }
        stmt.execute(params_from_iter(values.iter()))?;
    }
    Ok(())
}

/// Insert the parent row, then its child rows, and read the result back
fn insert_row(conn: &Connection, map: &FieldMap, mut document: Document) -> Result<Document, StorageError> {
    stamp_new(&mut document);

    let mut columns = Vec::new();
    let mut values = Vec::new();
    if let Some(id) = document.get("_id").and_then(row_id) {
        columns.push("id");
        values.push(SqlValue::Integer(id));
    }
    for (field, value) in &document {
        if field == "_id" || map.child(field).is_some() {
            continue;
        }
        columns.push(column_for(map, field)?);
        values.push(to_sql_value(value));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        map.table,
        columns.join(", "),
        vec!["?"; columns.len()].join(", ")
    );
    conn.execute(&sql, params_from_iter(values.iter()))
        .map_err(|e| classify(map.collection, e))?;
    let id = conn.last_insert_rowid();

    for child in map.children {
        if let Some(items) = document.get(child.array_field) {
            insert_children(conn, child, id, items)?;
        }
    }

    find_rows(conn, map, &Filter::new().eq("_id", id), &FindOptions::new())?
        .pop()
        .ok_or_else(|| StorageError::Query(format!("Inserted row {} vanished from {}", id, map.table)))
}

fn matching_ids(
    conn: &Connection,
    map: &FieldMap,
    filter: &Filter,
    multi: bool,
) -> Result<Vec<i64>, StorageError> {
    filter.validate()?;
    let (clause, params) = compile_filter(map, filter)?;
    let limit = if multi { "" } else { " LIMIT 1" };
    let sql = format!("SELECT id FROM {} WHERE {} ORDER BY id{}", map.table, clause, limit);

    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// `$set` on matching rows; array fields replace the child rows wholesale
fn update_rows(
    conn: &Connection,
    map: &FieldMap,
    filter: &Filter,
    update: &Update,
    multi: bool,
) -> Result<u64, StorageError> {
    let ids = matching_ids(conn, map, filter, multi)?;
    if ids.is_empty() {
        return Ok(0);
    }

    let mut assignments = Vec::new();
    let mut values = Vec::new();
    let mut replaced_children = Vec::new();
    for (field, value) in update.fields() {
        if field == "_id" || field == "updatedAt" {
            continue;
        }
        if let Some(child) = map.child(field) {
            replaced_children.push((child, value));
            continue;
        }
        assignments.push(format!("{} = ?", column_for(map, field)?));
        values.push(to_sql_value(value));
    }
    assignments.push("updated_at = ?".to_string());
    values.push(to_sql_value(&now_stamp()));

    for chunk in ids.chunks(ID_CHUNK) {
        let sql = format!(
            "UPDATE {} SET {} WHERE id IN ({})",
            map.table,
            assignments.join(", "),
            vec!["?"; chunk.len()].join(", ")
        );
        let params = values
            .iter()
            .cloned()
            .chain(chunk.iter().map(|id| SqlValue::Integer(*id)));
        conn.execute(&sql, params_from_iter(params))
            .map_err(|e| classify(map.collection, e))?;
    }

    for (child, items) in replaced_children {
        let delete = format!("DELETE FROM {} WHERE {} = ?", child.table, child.foreign_key);
        for id in &ids {
            conn.execute(&delete, [*id])?;
            insert_children(conn, child, *id, items)?;
        }
    }

    Ok(ids.len() as u64)
}

/// Delete matching rows; child rows go with them through `ON DELETE CASCADE`
fn remove_rows(conn: &Connection, map: &FieldMap, filter: &Filter, multi: bool) -> Result<u64, StorageError> {
    let ids = matching_ids(conn, map, filter, multi)?;
    for chunk in ids.chunks(ID_CHUNK) {
        let sql = format!(
            "DELETE FROM {} WHERE id IN ({})",
            map.table,
            vec!["?"; chunk.len()].join(", ")
        );
        conn.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    Ok(ids.len() as u64)
}

fn count_rows(conn: &Connection, map: &FieldMap, filter: &Filter) -> Result<u64, StorageError> {
    filter.validate()?;
    let (clause, params) = compile_filter(map, filter)?;
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", map.table, clause);
    let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Sqlite
    }

    async fn connect(&self) -> Result<(), StorageError> {
        if self.is_connected() {
            return Ok(());
        }

        field_map::validate_all()?;
        let schema_sql = self.load_schema().await?;
        if let Some(parent) = self.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!("Opening SQLite database at {}", self.db_path.display());

        let mut attempt = 0;
        let conn = loop {
            attempt += 1;
            match open_connection(&self.db_path, &schema_sql) {
                Ok(conn) => break conn,
                Err(e) if attempt < self.connect_attempts => {
                    tracing::warn!(
                        "SQLite initialization failed (attempt {}/{}): {}",
                        attempt,
                        self.connect_attempts,
                        e
                    );
                    tokio::time::sleep(self.connect_delay).await;
                }
                Err(e) => {
                    return Err(StorageError::Initialization(format!(
                        "Failed to open SQLite database after {} attempts: {}",
                        attempt, e
                    )))
                }
            }
        };

        *self.conn.lock().await = Some(conn);
        self.connected.store(true, Ordering::SeqCst);

        self.initialize_default_data().await?;
        tracing::info!("SQLite database ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
            tracing::info!("SQLite database closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> bool {
        let result = self
            .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("SQLite health check failed: {}", e);
                false
            }
        }
    }

    async fn initialize_default_data(&self) -> Result<(), StorageError> {
        seed_default_categories(self).await?;
        Ok(())
    }

    async fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let tables: Vec<&'static str> = Collection::ALL
            .iter()
            .flat_map(|c| {
                let map = FieldMap::for_collection(*c);
                std::iter::once(map.table).chain(map.children.iter().map(|child| child.table))
            })
            .collect();

        let collections = self
            .with_conn(|conn| {
                tables
                    .iter()
                    .map(|table| -> Result<(String, u64), StorageError> {
                        let count: i64 = conn.query_row(
                            &format!("SELECT COUNT(*) FROM {}", table),
                            [],
                            |row| row.get(0),
                        )?;
                        Ok((table.to_string(), count.max(0) as u64))
                    })
                    .collect::<Result<BTreeMap<_, _>, StorageError>>()
            })
            .await?;

        Ok(StorageStats {
            backend: StorageKind::Sqlite,
            location: self.db_path.display().to_string(),
            collections,
        })
    }
}

#[async_trait]
impl CollectionStore for SqliteStore {
    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StorageError> {
        let map = FieldMap::for_collection(collection);
        self.with_conn(|conn| find_rows(conn, map, filter, options)).await
    }

    async fn insert(
        &self,
        collection: Collection,
        document: Document,
    ) -> Result<Document, StorageError> {
        let stored = self
            .with_transaction(|tx| tx.insert(collection, document))
            .await?;
        tracing::debug!("Inserted into {}", FieldMap::for_collection(collection).table);
        Ok(stored)
    }

    /// One transaction for the whole batch
    async fn insert_many(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<Vec<Document>, StorageError> {
        let stored = self
            .with_transaction(|tx| {
                documents
                    .into_iter()
                    .map(|document| tx.insert(collection, document))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;
        tracing::debug!(
            "Inserted {} row(s) into {}",
            stored.len(),
            FieldMap::for_collection(collection).table
        );
        Ok(stored)
    }

    async fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
        multi: bool,
    ) -> Result<u64, StorageError> {
        self.with_transaction(|tx| tx.update(collection, filter, update, multi))
            .await
    }

    async fn remove(
        &self,
        collection: Collection,
        filter: &Filter,
        multi: bool,
    ) -> Result<u64, StorageError> {
        self.with_transaction(|tx| tx.remove(collection, filter, multi))
            .await
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64, StorageError> {
        let map = FieldMap::for_collection(collection);
        self.with_conn(|conn| count_rows(conn, map, filter)).await
    }

    /// One transaction for the whole batch
    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<Vec<u64>, StorageError> {
        let counts = self
            .with_transaction(|tx| {
                writes
                    .into_iter()
                    .map(|write| tx.apply(write))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;
        tracing::debug!("Applied a batch of {} write(s)", counts.len());
        Ok(counts)
    }

    async fn aggregate(
        &self,
        collection: Collection,
        spec: &GroupSpec,
    ) -> Result<Vec<Document>, StorageError> {
        let map = FieldMap::for_collection(collection);
        let rows = self
            .with_conn(|conn| select_rows(conn, map, &spec.filter, &FindOptions::new()))
            .await?;
        Ok(aggregate::group(&rows, spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn open_store(dir: &TempDir) -> SqliteStore {
        let store = SqliteStore::new(&StorageConfig::new(dir.path()));
        store.connect().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_connect_applies_settings_and_seeds() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let (foreign_keys, journal_mode) = store
            .with_conn(|conn| {
                let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
                let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
                Ok((fk, mode))
            })
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.collections["categories"], 6);
        assert_eq!(stats.collections["timestamps"], 0);
        assert!(store.health_check().await);
    }

    #[tokio::test]
    async fn test_insert_reads_back_with_children() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let stored = store
            .insert(
                Collection::AppUsage,
                doc(json!({
                    "date": "2024-07-03",
                    "hour": 11,
                    "appName": "code.exe",
                    "timeSpent": 500,
                    "category": "Code",
                    "timestamps": [
                        { "start": "2024-07-03T11:00:00.000Z", "duration": 300 },
                        { "start": "2024-07-03T11:10:00.000Z", "duration": 200 }
                    ]
                })),
            )
            .await
            .unwrap();

        assert!(stored["_id"].is_string());
        assert_eq!(stored["appName"], "code.exe");
        assert_eq!(stored["timestamps"].as_array().unwrap().len(), 2);
        assert_eq!(stored["timestamps"][1]["duration"], 200);
        assert!(stored["createdAt"].is_string());

        let id = stored["_id"].as_str().unwrap();
        let found = store
            .find_one(Collection::AppUsage, &Filter::by_id(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, stored);
    }

    #[tokio::test]
    async fn test_update_replaces_child_rows() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let session = store
            .insert(
                Collection::FocusSessions,
                doc(json!({
                    "type": "focus",
                    "startTime": "2024-07-03T09:00:00.000Z",
                    "plannedDuration": 1500000,
                    "status": "active",
                    "date": "2024-07-03",
                    "interruptions": [{ "timestamp": "2024-07-03T09:05:00.000Z", "reason": "mail" }]
                })),
            )
            .await
            .unwrap();
        let filter = Filter::by_id(session["_id"].as_str().unwrap());

        let matched = store
            .update(
                Collection::FocusSessions,
                &filter,
                &Update::new().set("status", "paused").set(
                    "interruptions",
                    json!([
                        { "timestamp": "2024-07-03T09:05:00.000Z", "reason": "mail" },
                        { "timestamp": "2024-07-03T09:07:00.000Z", "appName": "slack" }
                    ]),
                ),
                false,
            )
            .await
            .unwrap();
        assert_eq!(matched, 1);

        let updated = store
            .find_one(Collection::FocusSessions, &filter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["status"], "paused");
        let interruptions = updated["interruptions"].as_array().unwrap();
        assert_eq!(interruptions.len(), 2);
        assert_eq!(interruptions[1]["appName"], "slack");
        assert_eq!(interruptions[1]["reason"], Value::Null);
    }

    #[tokio::test]
    async fn test_remove_cascades_to_children() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .insert(
                Collection::AppUsage,
                doc(json!({
                    "date": "2024-07-03",
                    "appName": "code.exe",
                    "timeSpent": 1,
                    "timestamps": [{ "start": "2024-07-03T11:00:00.000Z", "duration": 1 }]
                })),
            )
            .await
            .unwrap();

        let removed = store
            .remove(Collection::AppUsage, &Filter::new().eq("appName", "code.exe"), true)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.collections["timestamps"], 0);
    }

    #[tokio::test]
    async fn test_daily_and_hour_zero_keys_coexist() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let daily = doc(json!({ "date": "2024-07-03", "hour": null, "appName": "code.exe", "timeSpent": 1 }));
        let midnight = doc(json!({ "date": "2024-07-03", "hour": 0, "appName": "code.exe", "timeSpent": 2 }));
        store.insert(Collection::AppUsage, daily.clone()).await.unwrap();
        store.insert(Collection::AppUsage, midnight).await.unwrap();

        let again = store.insert(Collection::AppUsage, daily).await;
        assert!(matches!(again, Err(StorageError::DuplicateKey { .. })));

        let found = store
            .find_one(
                Collection::AppUsage,
                &Filter::new().eq("appName", "code.exe").eq("hour", Value::Null),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["timeSpent"], 1);
    }

    #[tokio::test]
    async fn test_filter_operators() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let names = |documents: Vec<Document>| -> Vec<String> {
            documents
                .into_iter()
                .map(|d| d["name"].as_str().unwrap().to_string())
                .collect()
        };

        let found = store
            .find(
                Collection::Categories,
                &Filter::new().regex("name", "^co", true),
                &FindOptions::new().sort_by("name", SortOrder::Ascending),
            )
            .await
            .unwrap();
        assert_eq!(names(found), vec!["Code", "Communication"]);

        let found = store
            .find(
                Collection::Categories,
                &Filter::new()
                    .is_in("type", ["productive", "distracted"])
                    .ne("name", "Code"),
                &FindOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(names(found), vec!["Entertainment"]);

        let paged = store
            .find(
                Collection::Categories,
                &Filter::new(),
                &FindOptions::new().sort_by("name", SortOrder::Descending).skip(1).limit(2),
            )
            .await
            .unwrap();
        assert_eq!(names(paged), vec!["Miscellaneous", "Entertainment"]);

        let unknown = store
            .find(Collection::Categories, &Filter::new().eq("colour", "red"), &FindOptions::new())
            .await;
        assert!(matches!(unknown, Err(StorageError::Query(_))));
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let result: Result<(), _> = store
            .with_transaction(|tx| {
                tx.insert(
                    Collection::CustomCategoryMappings,
                    doc(json!({ "appIdentifier": "code.exe", "customCategory": "Code" })),
                )?;
                Err(StorageError::Query("abort".to_string()))
            })
            .await;
        assert!(result.is_err());

        let count = store
            .count(Collection::CustomCategoryMappings, &Filter::new())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_write_batch_is_one_transaction() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let code = Filter::new().eq("appName", "code.exe");
        let bucket = |time: i64| {
            doc(json!({ "date": "2024-07-03", "hour": 11, "appName": "code.exe", "timeSpent": time }))
        };

        let counts = store
            .write_batch(vec![
                BatchWrite::upsert(
                    Collection::AppUsage,
                    code.clone(),
                    Update::new().set("timeSpent", 100),
                    bucket(100),
                ),
                BatchWrite::upsert(
                    Collection::AppUsage,
                    code.clone(),
                    Update::new().set("timeSpent", 200),
                    bucket(200),
                ),
            ])
            .await
            .unwrap();
        assert_eq!(counts, vec![1, 1]);

        let result = store
            .write_batch(vec![
                BatchWrite::remove(Collection::Categories, Filter::new(), true),
                BatchWrite::upsert(
                    Collection::AppUsage,
                    code.clone(),
                    Update::new().set("timeSpent", 900),
                    bucket(900),
                ),
                BatchWrite::insert(Collection::Categories, doc(json!({ "name": "Code", "type": "productive" }))),
                BatchWrite::insert(Collection::Categories, doc(json!({ "name": "Code", "type": "neutral" }))),
            ])
            .await;
        assert!(matches!(result, Err(StorageError::DuplicateKey { .. })));

        assert_eq!(store.count(Collection::Categories, &Filter::new()).await.unwrap(), 6);
        let stored = store.find_one(Collection::AppUsage, &code).await.unwrap().unwrap();
        assert_eq!(stored["timeSpent"], 200);
    }

    #[tokio::test]
    async fn test_aggregate_groups_rows() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .insert_many(
                Collection::AppUsage,
                vec![
                    doc(json!({ "date": "2024-07-01", "appName": "a", "timeSpent": 5, "category": "Code" })),
                    doc(json!({ "date": "2024-07-01", "appName": "b", "timeSpent": 7, "category": "Code" })),
                    doc(json!({ "date": "2024-07-01", "appName": "c", "timeSpent": 1, "category": "Browsing" })),
                ],
            )
            .await
            .unwrap();

        let groups = store
            .aggregate(
                Collection::AppUsage,
                &GroupSpec::new(&["category"]).sum("totalTime", "timeSpent"),
            )
            .await
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0]["category"], "Browsing");
        assert_eq!(groups[1]["totalTime"], 12);
    }
}
