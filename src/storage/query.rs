/// Filter, update and sort descriptions shared by the local backends
///
/// A [`Filter`] is a conjunction of per-field conditions. The document store
/// evaluates it directly with [`Filter::matches`]; the SQLite shim compiles the
/// same conditions to a parameterized `WHERE` clause. Both follow one set of
/// rules:
///
/// * equality with `null` matches a missing field as well as an explicit null
/// * `$ne` matches documents where the field is missing
/// * ordered comparisons never match null, missing or differently typed values
/// * `$exists` treats an explicit null as absent
use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Map, Value};

use crate::storage::{Collection, Document, StorageError};

/// A single comparison against a field's value
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Exists(bool),
    In(Vec<Value>),
    Regex {
        pattern: String,
        case_insensitive: bool,
    },
}

/// `field <op>`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: Op,
}

/// Conjunction of conditions; the empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter selecting a document by its `_id`
    pub fn by_id(id: &str) -> Self {
        Self::new().eq("_id", id)
    }

    pub fn with(mut self, field: &str, op: Op) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op,
        });
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Op::Eq(value.into()))
    }

    pub fn ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Op::Ne(value.into()))
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Op::Gt(value.into()))
    }

    pub fn gte(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Op::Gte(value.into()))
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Op::Lt(value.into()))
    }

    pub fn lte(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Op::Lte(value.into()))
    }

    pub fn exists(self, field: &str, exists: bool) -> Self {
        self.with(field, Op::Exists(exists))
    }

    pub fn is_in<V: Into<Value>>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.with(field, Op::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn regex(self, field: &str, pattern: &str, case_insensitive: bool) -> Self {
        self.with(
            field,
            Op::Regex {
                pattern: pattern.to_string(),
                case_insensitive,
            },
        )
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Value of the first equality condition on `field`, if any
    pub fn equality_on(&self, field: &str) -> Option<&Value> {
        self.conditions.iter().find_map(|c| match &c.op {
            Op::Eq(value) if c.field == field => Some(value),
            _ => None,
        })
    }

    /// Reject filters that cannot be evaluated (currently: bad regexes)
    pub fn validate(&self) -> Result<(), StorageError> {
        for condition in &self.conditions {
            if let Op::Regex { pattern, .. } = &condition.op {
                regex::Regex::new(pattern).map_err(|e| {
                    StorageError::Query(format!("Invalid regex on {}: {}", condition.field, e))
                })?;
            }
        }
        Ok(())
    }

    /// Evaluate the filter against a document
    pub fn matches(&self, document: &Document) -> bool {
        self.conditions
            .iter()
            .all(|c| condition_matches(&c.op, document.get(&c.field)))
    }

    /// Parse a MongoDB-style filter object such as
    /// `{"date": {"$gte": "2024-07-01"}, "appName": "code.exe"}`
    pub fn from_json(value: &Value) -> Result<Self, StorageError> {
        let object = value
            .as_object()
            .ok_or_else(|| StorageError::Query("Filter must be a JSON object".to_string()))?;

        let mut filter = Filter::new();
        for (field, spec) in object {
            match spec {
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    filter = parse_operators(filter, field, ops)?;
                }
                other => filter = filter.eq(field, other.clone()),
            }
        }
        Ok(filter)
    }
}

fn parse_operators(
    mut filter: Filter,
    field: &str,
    ops: &Map<String, Value>,
) -> Result<Filter, StorageError> {
    for (op, operand) in ops {
        filter = match op.as_str() {
            "$eq" => filter.eq(field, operand.clone()),
            "$ne" => filter.ne(field, operand.clone()),
            "$gt" => filter.gt(field, operand.clone()),
            "$gte" => filter.gte(field, operand.clone()),
            "$lt" => filter.lt(field, operand.clone()),
            "$lte" => filter.lte(field, operand.clone()),
            "$exists" => filter.exists(field, operand.as_bool().unwrap_or(true)),
            "$in" => {
                let values = operand.as_array().ok_or_else(|| {
                    StorageError::Query(format!("$in on {} expects an array", field))
                })?;
                filter.is_in(field, values.iter().cloned())
            }
            "$regex" => {
                let pattern = operand.as_str().ok_or_else(|| {
                    StorageError::Query(format!("$regex on {} expects a string", field))
                })?;
                let case_insensitive = ops
                    .get("$options")
                    .and_then(Value::as_str)
                    .map_or(false, |o| o.contains('i'));
                filter.regex(field, pattern, case_insensitive)
            }
            "$options" => filter,
            unknown => {
                return Err(StorageError::Query(format!(
                    "Unsupported operator {} on {}",
                    unknown, field
                )))
            }
        };
    }
    Ok(filter)
}

fn is_absent(value: Option<&Value>) -> bool {
    value.map_or(true, Value::is_null)
}

fn condition_matches(op: &Op, actual: Option<&Value>) -> bool {
    match op {
        Op::Eq(expected) => values_equal(actual, expected),
        Op::Ne(expected) => !values_equal(actual, expected),
        Op::Gt(bound) => ordered(actual, bound).map_or(false, |o| o == Ordering::Greater),
        Op::Gte(bound) => ordered(actual, bound).map_or(false, |o| o != Ordering::Less),
        Op::Lt(bound) => ordered(actual, bound).map_or(false, |o| o == Ordering::Less),
        Op::Lte(bound) => ordered(actual, bound).map_or(false, |o| o != Ordering::Greater),
        Op::Exists(expected) => !is_absent(actual) == *expected,
        Op::In(candidates) => candidates.iter().any(|c| values_equal(actual, c)),
        Op::Regex {
            pattern,
            case_insensitive,
        } => match actual {
            Some(Value::String(text)) => RegexBuilder::new(pattern)
                .case_insensitive(*case_insensitive)
                .build()
                .map_or(false, |re| re.is_match(text)),
            _ => false,
        },
    }
}

fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    if expected.is_null() {
        return is_absent(actual);
    }
    match (actual, expected) {
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(a), b) => a == b,
        (None, _) => false,
    }
}

/// Ordering for range operators: only numbers with numbers and strings with
/// strings are comparable
fn ordered(actual: Option<&Value>, bound: &Value) -> Option<Ordering> {
    match (actual?, bound) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values used for sorting and grouping
///
/// Missing and null sort first, which matches SQLite's `NULLS FIRST` default.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ordering = compare_values(Some(left), Some(right));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sorting and paging for `find`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
    pub skip: usize,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort_by(mut self, field: &str, order: SortOrder) -> Self {
        self.sort.push((field.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Sort in place; ties keep their existing (insertion) order
    pub fn sort_documents(&self, documents: &mut [Document]) {
        if self.sort.is_empty() {
            return;
        }
        documents.sort_by(|a, b| {
            for (field, order) in &self.sort {
                let ordering = compare_values(a.get(field), b.get(field));
                let ordering = match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    /// Apply skip and limit to an already sorted list
    pub fn page(&self, documents: Vec<Document>) -> Vec<Document> {
        let iter = documents.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// `$set` style update: listed fields are overwritten, others left alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.retain(|(existing, _)| existing != field);
        self.set.push((field.to_string(), value.into()));
        self
    }

    /// Every field of `document` except `_id`
    pub fn from_document(document: Document) -> Self {
        document
            .into_iter()
            .filter(|(field, _)| field != "_id")
            .fold(Update::new(), |update, (field, value)| update.set(&field, value))
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.set
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Apply the update to a document; `_id` is never rewritten
    pub fn apply(&self, document: &mut Document) {
        for (field, value) in &self.set {
            if field == "_id" {
                continue;
            }
            document.insert(field.clone(), value.clone());
        }
    }
}

/// One write inside a [`CollectionStore::write_batch`](crate::storage::CollectionStore::write_batch)
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(Document),
    Update {
        filter: Filter,
        update: Update,
        multi: bool,
    },
    /// Update the first match, or insert `document` when nothing matches
    Upsert {
        filter: Filter,
        update: Update,
        document: Document,
    },
    Remove {
        filter: Filter,
        multi: bool,
    },
}

/// A write addressed to one collection
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWrite {
    pub collection: Collection,
    pub op: WriteOp,
}

impl BatchWrite {
    pub fn insert(collection: Collection, document: Document) -> Self {
        Self {
            collection,
            op: WriteOp::Insert(document),
        }
    }

    pub fn upsert(collection: Collection, filter: Filter, update: Update, document: Document) -> Self {
        Self {
            collection,
            op: WriteOp::Upsert {
                filter,
                update,
                document,
            },
        }
    }

    pub fn remove(collection: Collection, filter: Filter, multi: bool) -> Self {
        Self {
            collection,
            op: WriteOp::Remove { filter, multi },
        }
    }
}
