/// In-memory grouping used for statistics
///
/// A [`GroupSpec`] is the small aggregation pipeline the services need:
/// filter, group by one or more fields, then fold each group with a list of
/// accumulators. Each output document carries the group fields under their
/// own names plus one field per accumulator.
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde_json::{json, Value};

use crate::storage::query::{compare_values, Filter};
use crate::storage::Document;

/// How a group folds one field (or its members) into an output value
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// Sum of a numeric field; missing values count as 0
    Sum(String),
    /// Number of documents in the group
    Count,
    /// Number of distinct values of a field
    DistinctCount(String),
    Max(String),
    Min(String),
}

/// Filter, grouping fields and named accumulators
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSpec {
    pub filter: Filter,
    pub group_by: Vec<String>,
    pub accumulators: Vec<(String, Accumulator)>,
}

impl GroupSpec {
    pub fn new(group_by: &[&str]) -> Self {
        Self {
            filter: Filter::new(),
            group_by: group_by.iter().map(|f| f.to_string()).collect(),
            accumulators: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sum(self, output: &str, field: &str) -> Self {
        self.accumulate(output, Accumulator::Sum(field.to_string()))
    }

    pub fn count(self, output: &str) -> Self {
        self.accumulate(output, Accumulator::Count)
    }

    pub fn distinct(self, output: &str, field: &str) -> Self {
        self.accumulate(output, Accumulator::DistinctCount(field.to_string()))
    }

    pub fn max(self, output: &str, field: &str) -> Self {
        self.accumulate(output, Accumulator::Max(field.to_string()))
    }

    pub fn min(self, output: &str, field: &str) -> Self {
        self.accumulate(output, Accumulator::Min(field.to_string()))
    }

    fn accumulate(mut self, output: &str, accumulator: Accumulator) -> Self {
        self.accumulators.push((output.to_string(), accumulator));
        self
    }
}

enum State {
    Sum { int: i64, float: f64, is_float: bool },
    Count(u64),
    Distinct(BTreeSet<String>),
    Extreme { best: Option<Value>, want: Ordering },
}

impl State {
    fn for_accumulator(accumulator: &Accumulator) -> Self {
        match accumulator {
            Accumulator::Sum(_) => State::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
            },
            Accumulator::Count => State::Count(0),
            Accumulator::DistinctCount(_) => State::Distinct(BTreeSet::new()),
            Accumulator::Max(_) => State::Extreme {
                best: None,
                want: Ordering::Greater,
            },
            Accumulator::Min(_) => State::Extreme {
                best: None,
                want: Ordering::Less,
            },
        }
    }

    fn feed(&mut self, accumulator: &Accumulator, document: &Document) {
        match (self, accumulator) {
            (State::Sum { int, float, is_float }, Accumulator::Sum(field)) => {
                if let Some(Value::Number(n)) = document.get(field) {
                    match n.as_i64() {
                        Some(i) => {
                            *int += i;
                            *float += i as f64;
                        }
                        None => {
                            *is_float = true;
                            *float += n.as_f64().unwrap_or(0.0);
                        }
                    }
                }
            }
            (State::Count(count), Accumulator::Count) => *count += 1,
            (State::Distinct(seen), Accumulator::DistinctCount(field)) => {
                if let Some(value) = document.get(field).filter(|v| !v.is_null()) {
                    seen.insert(value.to_string());
                }
            }
            (State::Extreme { best, want }, Accumulator::Max(field) | Accumulator::Min(field)) => {
                if let Some(value) = document.get(field).filter(|v| !v.is_null()) {
                    let replace = match best.as_ref() {
                        None => true,
                        Some(current) => compare_values(Some(value), Some(current)) == *want,
                    };
                    if replace {
                        *best = Some(value.clone());
                    }
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Value {
        match self {
            State::Sum {
                int,
                float,
                is_float,
            } => {
                if is_float {
                    json!(float)
                } else {
                    json!(int)
                }
            }
            State::Count(count) => json!(count),
            State::Distinct(seen) => json!(seen.len() as u64),
            State::Extreme { best, .. } => best.unwrap_or(Value::Null),
        }
    }
}

/// Group already-filtered documents according to `spec`
///
/// Groups come back ordered by their key values.
pub fn group<'a>(documents: impl IntoIterator<Item = &'a Document>, spec: &GroupSpec) -> Vec<Document> {
    let mut keys: Vec<Vec<Value>> = Vec::new();
    let mut states: Vec<Vec<State>> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for document in documents {
        let key: Vec<Value> = spec
            .group_by
            .iter()
            .map(|field| document.get(field).cloned().unwrap_or(Value::Null))
            .collect();
        let key_text = Value::Array(key.clone()).to_string();

        let position = match positions.get(&key_text) {
            Some(position) => *position,
            None => {
                keys.push(key);
                states.push(
                    spec.accumulators
                        .iter()
                        .map(|(_, acc)| State::for_accumulator(acc))
                        .collect(),
                );
                positions.insert(key_text, keys.len() - 1);
                keys.len() - 1
            }
        };

        for (state, (_, accumulator)) in states[position].iter_mut().zip(&spec.accumulators) {
            state.feed(accumulator, document);
        }
    }

    let mut groups: Vec<(Vec<Value>, Document)> = keys
        .into_iter()
        .zip(states)
        .map(|(key, group_states)| {
            let mut output = Document::new();
            for (field, value) in spec.group_by.iter().zip(&key) {
                output.insert(field.clone(), value.clone());
            }
            for ((name, _), state) in spec.accumulators.iter().zip(group_states) {
                output.insert(name.clone(), state.finish());
            }
            (key, output)
        })
        .collect();

    groups.sort_by(|(a, _), (b, _)| {
        compare_values(Some(&Value::Array(a.clone())), Some(&Value::Array(b.clone())))
    });
    groups.into_iter().map(|(_, output)| output).collect()
}
