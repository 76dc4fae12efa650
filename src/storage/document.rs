/// JSON-lines document store
///
/// Each collection lives in its own file (`appUsage.db`, `categories.db`, ...)
/// holding one JSON document per line. The whole collection is kept in memory
/// and the file is rewritten atomically after every mutation. Files written by
/// NeDB load unchanged: a later line with the same `_id` replaces the earlier
/// one, `{"$$deleted": true}` lines remove a document, index declarations are
/// ignored and `{"$$date": ms}` values become canonical timestamps.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::StorageConfig;
use crate::domain::{format_instant, instant_from_value};
use crate::storage::aggregate::{self, GroupSpec};
use crate::storage::query::{BatchWrite, Filter, FindOptions, Update, WriteOp};
use crate::storage::{
    document_id, now_stamp, seed_default_categories, stamp_new, Collection, CollectionStore,
    Document, StorageAdapter, StorageError, StorageKind, StorageStats,
};

/// Index declarations per collection: (fields, unique)
fn index_definitions(collection: Collection) -> &'static [(&'static [&'static str], bool)] {
    match collection {
        Collection::AppUsage => &[
            (&["date"], false),
            (&["appName"], false),
            (&["category"], false),
            (&["hour"], false),
            (&["date", "hour"], false),
            (&["date", "appName"], false),
        ],
        Collection::Categories => &[(&["name"], true), (&["type"], false)],
        Collection::CustomCategoryMappings => &[(&["appIdentifier"], true)],
        Collection::FocusSessions => &[
            (&["startTime"], false),
            (&["date"], false),
            (&["type"], false),
            (&["status"], false),
        ],
    }
}

/// Index-key form of a value: missing and null coincide, and integral
/// numbers hash the same whether they were written as `5` or `5.0`
fn key_value(value: Option<&Value>) -> Value {
    match value {
        None | Some(Value::Null) => Value::Null,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => json!(f as i64),
            _ => Value::Number(n.clone()),
        },
        Some(other) => other.clone(),
    }
}

struct FieldIndex {
    fields: &'static [&'static str],
    unique: bool,
    entries: HashMap<String, BTreeSet<u64>>,
}

impl FieldIndex {
    fn new(fields: &'static [&'static str], unique: bool) -> Self {
        Self {
            fields,
            unique,
            entries: HashMap::new(),
        }
    }

    fn key(&self, document: &Document) -> String {
        Value::Array(
            self.fields
                .iter()
                .map(|field| key_value(document.get(*field)))
                .collect(),
        )
        .to_string()
    }

    /// Key for a filter whose equality conditions cover every indexed field
    fn filter_key(&self, filter: &Filter) -> Option<String> {
        let values = self
            .fields
            .iter()
            .map(|field| filter.equality_on(field).map(|v| key_value(Some(v))))
            .collect::<Option<Vec<_>>>()?;
        Some(Value::Array(values).to_string())
    }

    fn add(&mut self, seq: u64, document: &Document) {
        let key = self.key(document);
        self.entries.entry(key).or_default().insert(seq);
    }

    fn remove(&mut self, seq: u64, document: &Document) {
        let key = self.key(document);
        if let Some(seqs) = self.entries.get_mut(&key) {
            seqs.remove(&seq);
            if seqs.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Another document already holding this document's key
    fn conflict(&self, document: &Document, ignore: Option<u64>) -> Option<String> {
        if !self.unique {
            return None;
        }
        let key = self.key(document);
        let taken = self
            .entries
            .get(&key)
            .map_or(false, |seqs| seqs.iter().any(|seq| Some(*seq) != ignore));
        taken.then(|| format!("{}={}", self.fields.join(","), key))
    }
}

/// How to take back one in-memory change
enum Undo {
    Added(u64),
    Replaced(u64, Document),
    Deleted(u64, Document),
}

/// One loaded collection
struct CollectionData {
    collection: Collection,
    path: PathBuf,
    /// Documents in insertion order
    docs: BTreeMap<u64, Document>,
    ids: HashMap<String, u64>,
    indexes: Vec<FieldIndex>,
    next_seq: u64,
}

impl CollectionData {
    fn new(collection: Collection, path: PathBuf) -> Self {
        Self {
            collection,
            path,
            docs: BTreeMap::new(),
            ids: HashMap::new(),
            indexes: index_definitions(collection)
                .iter()
                .map(|(fields, unique)| FieldIndex::new(fields, *unique))
                .collect(),
            next_seq: 0,
        }
    }

    fn duplicate(&self, key: String) -> StorageError {
        StorageError::DuplicateKey {
            collection: self.collection.name().to_string(),
            key,
        }
    }

    fn check_unique(&self, document: &Document, ignore: Option<u64>) -> Result<(), StorageError> {
        match self.indexes.iter().find_map(|index| index.conflict(document, ignore)) {
            Some(key) => Err(self.duplicate(key)),
            None => Ok(()),
        }
    }

    /// Add a document that already carries its `_id`
    fn add(&mut self, document: Document) -> Result<u64, StorageError> {
        let id = document_id(&document).ok_or_else(|| {
            StorageError::Query(format!("{} document without _id", self.collection))
        })?;
        if self.ids.contains_key(&id) {
            return Err(self.duplicate(format!("_id={}", id)));
        }
        self.check_unique(&document, None)?;

        let seq = self.next_seq;
        self.next_seq += 1;
        for index in &mut self.indexes {
            index.add(seq, &document);
        }
        self.ids.insert(id, seq);
        self.docs.insert(seq, document);
        Ok(seq)
    }

    /// Swap the document stored at `seq`, returning the previous version
    fn replace(&mut self, seq: u64, document: Document) -> Result<Document, StorageError> {
        self.check_unique(&document, Some(seq))?;
        let previous = self
            .docs
            .insert(seq, document)
            .ok_or_else(|| StorageError::Query(format!("Unknown document slot {}", seq)))?;
        if let Some(current) = self.docs.get(&seq) {
            for index in &mut self.indexes {
                index.remove(seq, &previous);
                index.add(seq, current);
            }
        }
        Ok(previous)
    }

    fn delete(&mut self, seq: u64) -> Option<Document> {
        let document = self.docs.remove(&seq)?;
        for index in &mut self.indexes {
            index.remove(seq, &document);
        }
        if let Some(id) = document_id(&document) {
            self.ids.remove(&id);
        }
        Some(document)
    }

    /// Put `document` back into `seq`, replacing whatever is there
    ///
    /// Only used to undo writes, so unique indexes are not rechecked.
    fn restore(&mut self, seq: u64, document: Document) {
        self.delete(seq);
        for index in &mut self.indexes {
            index.add(seq, &document);
        }
        if let Some(id) = document_id(&document) {
            self.ids.insert(id, seq);
        }
        self.docs.insert(seq, document);
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Added(seq) => {
                self.delete(seq);
            }
            Undo::Replaced(seq, previous) | Undo::Deleted(seq, previous) => {
                self.restore(seq, previous)
            }
        }
    }

    /// Revert `undo` newest first
    fn rollback(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            self.revert(step);
        }
    }

    fn insert_documents(
        &mut self,
        documents: Vec<Document>,
        undo: &mut Vec<Undo>,
    ) -> Result<Vec<Document>, StorageError> {
        let mut stored = Vec::with_capacity(documents.len());
        for mut document in documents {
            if document_id(&document).is_none() {
                document.insert("_id".to_string(), Value::String(new_id()));
            }
            stamp_new(&mut document);

            let seq = self.add(document.clone())?;
            undo.push(Undo::Added(seq));
            stored.push(document);
        }
        Ok(stored)
    }

    fn update_matching(
        &mut self,
        filter: &Filter,
        update: &Update,
        multi: bool,
        undo: &mut Vec<Undo>,
    ) -> Result<u64, StorageError> {
        filter.validate()?;
        let mut matched = self.matching(filter);
        if !multi {
            matched.truncate(1);
        }

        let stamp = now_stamp();
        let mut updated = 0;
        for seq in matched {
            let Some(mut document) = self.docs.get(&seq).cloned() else {
                continue;
            };
            update.apply(&mut document);
            document.insert("updatedAt".to_string(), stamp.clone());

            let previous = self.replace(seq, document)?;
            undo.push(Undo::Replaced(seq, previous));
            updated += 1;
        }
        Ok(updated)
    }

    fn remove_matching(
        &mut self,
        filter: &Filter,
        multi: bool,
        undo: &mut Vec<Undo>,
    ) -> Result<u64, StorageError> {
        filter.validate()?;
        let mut matched = self.matching(filter);
        if !multi {
            matched.truncate(1);
        }

        let mut removed = 0;
        for seq in matched {
            if let Some(document) = self.delete(seq) {
                undo.push(Undo::Deleted(seq, document));
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn apply(&mut self, op: WriteOp, undo: &mut Vec<Undo>) -> Result<u64, StorageError> {
        match op {
            WriteOp::Insert(document) => {
                self.insert_documents(vec![document], undo)?;
                Ok(1)
            }
            WriteOp::Update {
                filter,
                update,
                multi,
            } => self.update_matching(&filter, &update, multi, undo),
            WriteOp::Upsert {
                filter,
                update,
                document,
            } => {
                if self.update_matching(&filter, &update, false, undo)? == 0 {
                    self.insert_documents(vec![document], undo)?;
                }
                Ok(1)
            }
            WriteOp::Remove { filter, multi } => self.remove_matching(&filter, multi, undo),
        }
    }

    /// Write the in-memory changes recorded in `undo` to disk
    ///
    /// On any error the changes are reverted so memory keeps matching the file.
    async fn commit<T>(
        &mut self,
        result: Result<T, StorageError>,
        undo: Vec<Undo>,
    ) -> Result<T, StorageError> {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.rollback(undo);
                return Err(e);
            }
        };
        if undo.is_empty() {
            return Ok(value);
        }
        if let Err(e) = self.persist().await {
            self.rollback(undo);
            return Err(e);
        }
        Ok(value)
    }

    /// Slots worth evaluating the filter against, in insertion order
    fn candidates(&self, filter: &Filter) -> Vec<u64> {
        if let Some(Value::String(id)) = filter.equality_on("_id") {
            return self.ids.get(id).copied().into_iter().collect();
        }

        let narrowest = self
            .indexes
            .iter()
            .filter_map(|index| index.filter_key(filter).map(|key| (index, key)))
            .max_by_key(|(index, _)| index.fields.len());

        match narrowest {
            Some((index, key)) => index
                .entries
                .get(&key)
                .map(|seqs| seqs.iter().copied().collect())
                .unwrap_or_default(),
            None => self.docs.keys().copied().collect(),
        }
    }

    fn matching(&self, filter: &Filter) -> Vec<u64> {
        self.candidates(filter)
            .into_iter()
            .filter(|seq| self.docs.get(seq).map_or(false, |doc| filter.matches(doc)))
            .collect()
    }

    fn load_line(&mut self, line: &str) -> Result<(), StorageError> {
        let mut document = match serde_json::from_str::<Value>(line)? {
            Value::Object(map) => map,
            other => {
                return Err(StorageError::Query(format!(
                    "Expected a JSON object, got {}",
                    other
                )))
            }
        };

        if document.contains_key("$$indexCreated") {
            return Ok(());
        }

        let id = document_id(&document);
        if document.get("$$deleted").and_then(Value::as_bool) == Some(true) {
            if let Some(seq) = id.and_then(|id| self.ids.get(&id).copied()) {
                self.delete(seq);
            }
            return Ok(());
        }

        revive_dates(&mut document);
        match id {
            Some(id) => match self.ids.get(&id).copied() {
                Some(seq) => {
                    self.replace(seq, document)?;
                }
                None => {
                    self.add(document)?;
                }
            },
            None => {
                document.insert("_id".to_string(), Value::String(new_id()));
                self.add(document)?;
            }
        }
        Ok(())
    }

    fn serialize(&self) -> Result<String, StorageError> {
        let mut contents = String::new();
        for document in self.docs.values() {
            contents.push_str(&serde_json::to_string(document)?);
            contents.push('\n');
        }
        Ok(contents)
    }

    async fn persist(&self) -> Result<(), StorageError> {
        let contents = self.serialize()?;
        let staging = self.path.with_extension("db~");
        tokio::fs::write(&staging, contents).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

/// Replace NeDB `{"$$date": ms}` objects with canonical timestamps
fn revive_dates(document: &mut Document) {
    for value in document.values_mut() {
        revive_value(value);
    }
}

fn revive_value(value: &mut Value) {
    let is_date = matches!(value, Value::Object(map) if map.len() == 1 && map.contains_key("$$date"));
    if is_date {
        if let Ok(instant) = instant_from_value(value) {
            *value = Value::String(format_instant(&instant));
        }
        return;
    }

    match value {
        Value::Object(map) => revive_dates(map),
        Value::Array(items) => items.iter_mut().for_each(revive_value),
        _ => {}
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

struct StoreState {
    collections: BTreeMap<Collection, CollectionData>,
}

impl StoreState {
    fn get(&self, collection: Collection) -> Result<&CollectionData, StorageError> {
        self.collections
            .get(&collection)
            .ok_or(StorageError::NotConnected)
    }

    fn get_mut(&mut self, collection: Collection) -> Result<&mut CollectionData, StorageError> {
        self.collections
            .get_mut(&collection)
            .ok_or(StorageError::NotConnected)
    }

    fn rollback(&mut self, undo: Vec<(Collection, Undo)>) {
        for (collection, step) in undo.into_iter().rev() {
            if let Some(data) = self.collections.get_mut(&collection) {
                data.revert(step);
            }
        }
    }
}

/// File-backed document store, the default local backend
pub struct DocumentStore {
    data_dir: PathBuf,
    connect_attempts: u32,
    connect_delay: Duration,
    state: RwLock<Option<StoreState>>,
    connected: AtomicBool,
}

impl DocumentStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            connect_attempts: config.connect_attempts.max(1),
            connect_delay: config.connect_delay,
            state: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// File holding a collection
    pub fn file_path(&self, collection: Collection) -> PathBuf {
        self.data_dir.join(format!("{}.db", collection.name()))
    }

    async fn open(&self) -> Result<StoreState, StorageError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;

        let mut collections = BTreeMap::new();
        for collection in Collection::ALL {
            let path = self.file_path(collection);
            let mut data = CollectionData::new(collection, path.clone());

            if tokio::fs::try_exists(&path).await? {
                let contents = tokio::fs::read_to_string(&path).await?;
                for (number, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match data.load_line(line) {
                        Ok(()) => {}
                        Err(e @ StorageError::DuplicateKey { .. }) => return Err(e),
                        Err(e) => tracing::warn!(
                            "Skipping unreadable line {} of {}: {}",
                            number + 1,
                            path.display(),
                            e
                        ),
                    }
                }
                // Compact tombstones and overridden versions
                data.persist().await?;
            }

            tracing::debug!("Loaded {} ({} documents)", collection, data.docs.len());
            collections.insert(collection, data);
        }

        Ok(StoreState { collections })
    }
}

#[async_trait]
impl StorageAdapter for DocumentStore {
    fn kind(&self) -> StorageKind {
        StorageKind::DocumentStore
    }

    async fn connect(&self) -> Result<(), StorageError> {
        if self.is_connected() {
            return Ok(());
        }

        tracing::info!("Opening document store at {}", self.data_dir.display());

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.open().await {
                Ok(state) => {
                    *self.state.write().await = Some(state);
                    self.connected.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) if attempt < self.connect_attempts => {
                    tracing::warn!(
                        "Document store initialization failed (attempt {}/{}): {}",
                        attempt,
                        self.connect_attempts,
                        e
                    );
                    tokio::time::sleep(self.connect_delay).await;
                }
                Err(e) => {
                    return Err(StorageError::Initialization(format!(
                        "Failed to open document store after {} attempts: {}",
                        attempt, e
                    )))
                }
            }
        }

        self.initialize_default_data().await?;
        tracing::info!("Document store ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        *self.state.write().await = None;
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!("Document store closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.count(Collection::AppUsage, &Filter::new()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Document store health check failed: {}", e);
                false
            }
        }
    }

    async fn initialize_default_data(&self) -> Result<(), StorageError> {
        seed_default_categories(self).await?;
        Ok(())
    }

    async fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let guard = self.state.read().await;
        let state = guard.as_ref().ok_or(StorageError::NotConnected)?;

        Ok(StorageStats {
            backend: StorageKind::DocumentStore,
            location: self.data_dir.display().to_string(),
            collections: state
                .collections
                .iter()
                .map(|(collection, data)| (collection.name().to_string(), data.docs.len() as u64))
                .collect(),
        })
    }
}

#[async_trait]
impl CollectionStore for DocumentStore {
    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StorageError> {
        filter.validate()?;
        let guard = self.state.read().await;
        let data = guard.as_ref().ok_or(StorageError::NotConnected)?.get(collection)?;

        let mut documents: Vec<Document> = data
            .matching(filter)
            .into_iter()
            .filter_map(|seq| data.docs.get(&seq).cloned())
            .collect();
        options.sort_documents(&mut documents);
        Ok(options.page(documents))
    }

    async fn insert(
        &self,
        collection: Collection,
        document: Document,
    ) -> Result<Document, StorageError> {
        let mut stored = self.insert_many(collection, vec![document]).await?;
        stored
            .pop()
            .ok_or_else(|| StorageError::Query(format!("Insert into {} stored nothing", collection)))
    }

    /// All-or-nothing: a rejected document leaves the collection unchanged
    async fn insert_many(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<Vec<Document>, StorageError> {
        let mut guard = self.state.write().await;
        let data = guard
            .as_mut()
            .ok_or(StorageError::NotConnected)?
            .get_mut(collection)?;

        let mut undo = Vec::new();
        let result = data.insert_documents(documents, &mut undo);
        let stored = data.commit(result, undo).await?;
        tracing::debug!("Inserted {} document(s) into {}", stored.len(), collection);
        Ok(stored)
    }

    async fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
        multi: bool,
    ) -> Result<u64, StorageError> {
        let mut guard = self.state.write().await;
        let data = guard
            .as_mut()
            .ok_or(StorageError::NotConnected)?
            .get_mut(collection)?;

        let mut undo = Vec::new();
        let result = data.update_matching(filter, update, multi, &mut undo);
        let updated = data.commit(result, undo).await?;
        if updated > 0 {
            tracing::debug!("Updated {} document(s) in {}", updated, collection);
        }
        Ok(updated)
    }

    async fn remove(
        &self,
        collection: Collection,
        filter: &Filter,
        multi: bool,
    ) -> Result<u64, StorageError> {
        let mut guard = self.state.write().await;
        let data = guard
            .as_mut()
            .ok_or(StorageError::NotConnected)?
            .get_mut(collection)?;

        let mut undo = Vec::new();
        let result = data.remove_matching(filter, multi, &mut undo);
        let removed = data.commit(result, undo).await?;
        if removed > 0 {
            tracing::debug!("Removed {} document(s) from {}", removed, collection);
        }
        Ok(removed)
    }

    /// Writes are applied in memory first, then every touched collection is
    /// rewritten. A failure at either stage restores memory and the files
    /// already rewritten.
    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<Vec<u64>, StorageError> {
        let mut guard = self.state.write().await;
        let state = guard.as_mut().ok_or(StorageError::NotConnected)?;

        let mut undo: Vec<(Collection, Undo)> = Vec::new();
        let mut counts = Vec::with_capacity(writes.len());
        for BatchWrite { collection, op } in writes {
            let mut steps = Vec::new();
            let result = match state.get_mut(collection) {
                Ok(data) => data.apply(op, &mut steps),
                Err(e) => Err(e),
            };
            undo.extend(steps.into_iter().map(|step| (collection, step)));
            match result {
                Ok(count) => counts.push(count),
                Err(e) => {
                    state.rollback(undo);
                    return Err(e);
                }
            }
        }

        let changed: BTreeSet<Collection> = undo.iter().map(|(collection, _)| *collection).collect();
        let mut persisted = Vec::with_capacity(changed.len());
        for collection in changed {
            let result = match state.get(collection) {
                Ok(data) => data.persist().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                state.rollback(undo);
                for collection in persisted {
                    if let Ok(data) = state.get(collection) {
                        if let Err(restore) = data.persist().await {
                            tracing::warn!(
                                "Failed to restore {} after a failed batch: {}",
                                collection,
                                restore
                            );
                        }
                    }
                }
                return Err(e);
            }
            persisted.push(collection);
        }

        tracing::debug!("Applied a batch of {} write(s)", counts.len());
        Ok(counts)
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64, StorageError> {
        filter.validate()?;
        let guard = self.state.read().await;
        let data = guard.as_ref().ok_or(StorageError::NotConnected)?.get(collection)?;
        Ok(data.matching(filter).len() as u64)
    }

    async fn aggregate(
        &self,
        collection: Collection,
        spec: &GroupSpec,
    ) -> Result<Vec<Document>, StorageError> {
        spec.filter.validate()?;
        let guard = self.state.read().await;
        let data = guard.as_ref().ok_or(StorageError::NotConnected)?.get(collection)?;

        let documents = data
            .matching(&spec.filter)
            .into_iter()
            .filter_map(|seq| data.docs.get(&seq));
        Ok(aggregate::group(documents, spec))
    }
}
