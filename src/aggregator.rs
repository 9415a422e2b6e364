//! Numeric aggregation of shards and partials.
//!
//! Shards hold sparse, possibly nested numeric increments. Partials hold an
//! append-only `_updates_` array whose entries are `{_id_, _data_}` with
//! `_data_` a flat `field.path -> delta` map. Everything here is pure; the
//! worker decides what to write.

use crate::sharding::UPDATES_FIELD;
use crate::store::Snapshot;
use crate::value::{numeric_leaves, Fields, Number, Value};
use std::collections::BTreeMap;

const ENTRY_ID_FIELD: &str = "_id_";
const ENTRY_DATA_FIELD: &str = "_data_";

/// Running sum of numeric deltas keyed by dotted field path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NumericUpdate {
    fields: BTreeMap<String, Number>,
}

impl NumericUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every numeric leaf of `from`. Non-numeric leaves are ignored.
    pub fn merge_from(&mut self, from: &Fields) {
        for (path, number) in numeric_leaves(from) {
            self.add(&path, number);
        }
    }

    pub fn subtract_from(&mut self, from: &Fields) {
        for (path, number) in numeric_leaves(from) {
            self.add(&path, -number);
        }
    }

    /// Add one delta. A path that collides with a shorter or longer path
    /// (`a` vs `a.b`) replaces it, mirroring a nested object overwriting a
    /// number and the other way around.
    pub fn add(&mut self, path: &str, delta: Number) {
        if let Some(current) = self.fields.get_mut(path) {
            *current = *current + delta;
            return;
        }
        let nested = format!("{path}.");
        self.fields.retain(|existing, _| {
            !existing.starts_with(&nested) && !path.starts_with(&format!("{existing}."))
        });
        self.fields.insert(path.to_string(), delta);
    }

    /// Zero net effect (also true when empty).
    pub fn is_noop(&self) -> bool {
        self.fields.values().all(|number| number.is_zero())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &BTreeMap<String, Number> {
        &self.fields
    }

    pub fn get(&self, path: &str) -> Option<Number> {
        self.fields.get(path).copied()
    }

    /// Absolute field values for a counter: each touched field gets the
    /// counter's current numeric value added. Non-numeric current values
    /// are overwritten.
    pub fn to_counter_update(&self, counter: &Fields) -> BTreeMap<String, Number> {
        self.fields
            .iter()
            .map(|(path, delta)| {
                let current = crate::value::get_field(counter, path).and_then(Value::as_number);
                let value = match current {
                    Some(current) => current + *delta,
                    None => *delta,
                };
                (path.clone(), value)
            })
            .collect()
    }

    /// Flat `_data_` map for a partial entry.
    pub fn to_data(&self) -> Fields {
        self.fields
            .iter()
            .map(|(path, number)| (path.clone(), Value::from(*number)))
            .collect()
    }
}

/// One element of a partial's `_updates_` array. The id keeps array-union
/// from collapsing two equal deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialEntry {
    pub id: String,
    pub update: NumericUpdate,
}

impl PartialEntry {
    pub fn new(update: NumericUpdate) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            update,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut entry = Fields::new();
        entry.insert(ENTRY_ID_FIELD.to_string(), Value::String(self.id.clone()));
        entry.insert(ENTRY_DATA_FIELD.to_string(), Value::Map(self.update.to_data()));
        Value::Map(entry)
    }
}

/// What an aggregation should write to its target.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateUpdate {
    /// Absolute values for dotted fields of the counter document.
    Counter(BTreeMap<String, Number>),
    /// One entry to append to the target partial's `_updates_`.
    Partial(NumericUpdate),
}

impl AggregateUpdate {
    /// Nothing worth writing.
    pub fn is_noop(&self) -> bool {
        match self {
            AggregateUpdate::Counter(fields) => fields.is_empty(),
            AggregateUpdate::Partial(update) => update.is_noop(),
        }
    }
}

/// `_data_` maps of every entry in a partial document.
pub fn partial_entries(fields: &Fields) -> impl Iterator<Item = &Fields> {
    fields
        .get(UPDATES_FIELD)
        .and_then(Value::as_array)
        .unwrap_or(&[])
        .iter()
        .filter_map(|entry| entry.as_map()?.get(ENTRY_DATA_FIELD)?.as_map())
}

/// Net delta a partial currently holds.
pub fn partial_sum(fields: &Fields) -> NumericUpdate {
    let mut update = NumericUpdate::new();
    for data in partial_entries(fields) {
        update.merge_from(data);
    }
    update
}

/// Merge shard increments and partial entries. With a counter snapshot the
/// result is an absolute counter update; with `None` the target is a partial
/// and the result is a single entry to append.
pub fn aggregate(
    counter: Option<&Snapshot>,
    partials: &[&Snapshot],
    shards: &[Snapshot],
) -> AggregateUpdate {
    let mut update = NumericUpdate::new();
    for data in shards.iter().filter_map(|shard| shard.data.as_ref()) {
        update.merge_from(data);
    }
    for data in partials.iter().filter_map(|partial| partial.data.as_ref()) {
        for entry in partial_entries(data) {
            update.merge_from(entry);
        }
    }

    match counter {
        None => AggregateUpdate::Partial(update),
        Some(counter) => {
            let empty = Fields::new();
            let current = counter.data.as_ref().unwrap_or(&empty);
            AggregateUpdate::Counter(update.to_counter_update(current))
        }
    }
}

/// Entry that cancels everything a partial snapshot holds.
pub fn subtract_partial(partial: &Snapshot) -> NumericUpdate {
    let mut update = NumericUpdate::new();
    if let Some(data) = partial.data.as_ref() {
        for entry in partial_entries(data) {
            update.subtract_from(entry);
        }
    }
    update
}

/// A partial (or empty document) whose entries net to zero.
pub fn is_empty_partial(fields: &Fields) -> bool {
    match fields.len() {
        0 => true,
        1 if fields.contains_key(UPDATES_FIELD) => partial_sum(fields).is_noop(),
        _ => false,
    }
}

/// The partial's update log has grown past `threshold` entries.
pub fn contains_many_updates(fields: &Fields, threshold: usize) -> bool {
    fields
        .get(UPDATES_FIELD)
        .and_then(Value::as_array)
        .map(|entries| entries.len() > threshold)
        .unwrap_or(false)
}
