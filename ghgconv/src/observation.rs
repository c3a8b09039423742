//! The long-format observation table and its atomic values.

use std::borrow::Cow;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString};

/// Documented non-numeric notation keys. These are carried through every stage untouched and
/// are never coerced into numbers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    StrumDisplay,
    EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum Marker {
    /// Not estimated
    NE,
    /// Not applicable
    NA,
    /// Not occurring
    NO,
    /// Confidential
    C,
    /// Included elsewhere
    IE,
}

/// The value of a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Marker(Marker),
    Missing,
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// Parses a raw cell: empty and `nan` become `Missing`, notation keys become markers and
    /// anything else must be a number. Thousands separators are stripped.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
            return Some(Value::Missing);
        }
        if let Ok(marker) = Marker::from_str(raw) {
            return Some(Value::Marker(marker));
        }
        raw.replace(',', "").parse::<f64>().ok().map(Value::from)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        if value.is_nan() {
            Value::Missing
        } else {
            Value::Number(value)
        }
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map(Value::from).unwrap_or(Value::Missing)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Marker(m) => write!(f, "{m}"),
            Value::Missing => write!(f, ""),
        }
    }
}

/// The dimensions of the observation table other than `value`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    StrumDisplay,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Dimension {
    Area,
    Source,
    Scenario,
    Category,
    Entity,
    Unit,
    Time,
}

/// Identifies one observation. Two rows with equal keys describe the same logical quantity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub area: String,
    pub source: String,
    pub scenario: String,
    pub category: String,
    pub entity: String,
    pub unit: String,
    pub time: i32,
}

impl Key {
    pub fn new(
        area: &str,
        source: &str,
        scenario: &str,
        category: &str,
        entity: &str,
        unit: &str,
        time: i32,
    ) -> Self {
        Self {
            area: area.into(),
            source: source.into(),
            scenario: scenario.into(),
            category: category.into(),
            entity: entity.into(),
            unit: unit.into(),
            time,
        }
    }

    pub fn get(&self, dimension: Dimension) -> Cow<'_, str> {
        match dimension {
            Dimension::Area => Cow::Borrowed(&self.area),
            Dimension::Source => Cow::Borrowed(&self.source),
            Dimension::Scenario => Cow::Borrowed(&self.scenario),
            Dimension::Category => Cow::Borrowed(&self.category),
            Dimension::Entity => Cow::Borrowed(&self.entity),
            Dimension::Unit => Cow::Borrowed(&self.unit),
            Dimension::Time => Cow::Owned(self.time.to_string()),
        }
    }

    /// Returns a copy of the key with one string dimension replaced.
    ///
    /// `Dimension::Time` is replaced only if `value` parses as a year; otherwise the key is
    /// returned unchanged.
    pub fn with(&self, dimension: Dimension, value: &str) -> Self {
        let mut key = self.clone();
        match dimension {
            Dimension::Area => key.area = value.into(),
            Dimension::Source => key.source = value.into(),
            Dimension::Scenario => key.scenario = value.into(),
            Dimension::Category => key.category = value.into(),
            Dimension::Entity => key.entity = value.into(),
            Dimension::Unit => key.unit = value.into(),
            Dimension::Time => {
                if let Ok(time) = value.parse() {
                    key.time = time;
                }
            }
        }
        key
    }

    pub fn with_category(&self, category: &str) -> Self {
        self.with(Dimension::Category, category)
    }

    pub fn with_entity(&self, entity: &str) -> Self {
        self.with(Dimension::Entity, entity)
    }

    pub fn at_time(&self, time: i32) -> Self {
        Self {
            time,
            ..self.clone()
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}/{}",
            self.area, self.source, self.scenario, self.category, self.entity, self.unit, self.time
        )
    }
}

/// A key and its value, the row shape used at the crate boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(flatten)]
    pub key: Key,
    pub value: Value,
}

/// The outcome of merging a value into a table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Merge {
    /// No row existed at the key.
    Inserted,
    /// A missing value was replaced.
    Filled,
    /// The incoming value was identical or missing; nothing changed.
    Unchanged,
    /// Both values are present and differ. The existing value was kept.
    Conflict { existing: Value, incoming: Value },
}

/// The in-memory long-format table. Rows are unique by [`Key`] and ordered, so every stage
/// produces deterministic output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationTable {
    rows: BTreeMap<Key, Value>,
}

impl ObservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table, returning the rows that collided with an earlier row with a different
    /// value.
    pub fn from_observations<I>(observations: I) -> (Self, Vec<(Key, Value, Value)>)
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut table = Self::new();
        let mut conflicts = vec![];
        for obs in observations {
            if let Merge::Conflict { existing, incoming } = table.merge(obs.key.clone(), obs.value)
            {
                conflicts.push((obs.key, existing, incoming));
            }
        }
        (table, conflicts)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.rows.get(key)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.rows.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.rows.iter()
    }

    /// Overwrites unconditionally. Stages use [`ObservationTable::merge`] instead.
    pub fn insert(&mut self, key: Key, value: Value) -> Option<Value> {
        self.rows.insert(key, value)
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Key, &Value) -> bool,
    {
        self.rows.retain(|k, v| keep(k, v));
    }

    /// Adds a value without ever overwriting a present value.
    pub fn merge(&mut self, key: Key, incoming: Value) -> Merge {
        match self.rows.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(incoming);
                Merge::Inserted
            }
            Entry::Occupied(mut entry) => {
                let existing = *entry.get();
                if incoming.is_missing() || existing == incoming {
                    Merge::Unchanged
                } else if existing.is_missing() {
                    entry.insert(incoming);
                    Merge::Filled
                } else {
                    Merge::Conflict { existing, incoming }
                }
            }
        }
    }
}

impl FromIterator<(Key, Value)> for ObservationTable {
    /// Later rows overwrite earlier ones. Use [`ObservationTable::from_observations`] to detect
    /// collisions.
    fn from_iter<T: IntoIterator<Item = (Key, Value)>>(iter: T) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ObservationTable {
    type Item = (Key, Value);
    type IntoIter = std::collections::btree_map::IntoIter<Key, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a ObservationTable {
    type Item = (&'a Key, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, Key, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
