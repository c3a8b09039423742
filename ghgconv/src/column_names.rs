//! This module stores the column names of the long-format interchange table, which are used when
//! converting an `ObservationTable` to and from a polars `DataFrame`. Note that these must be
//! synchronised with the column names written by the upstream extraction scripts!

pub const AREA: &str = "area";
pub const SOURCE: &str = "source";
pub const SCENARIO: &str = "scenario";
pub const CATEGORY: &str = "category";
pub const ENTITY: &str = "entity";
pub const UNIT: &str = "unit";
pub const TIME: &str = "time";
pub const VALUE: &str = "value";

/// Optional column carrying a non-numeric marker when `VALUE` is numeric (or null).
pub const MARKER: &str = "marker";

/// The key columns, in output order.
pub const KEY_COLUMNS: [&str; 7] = [AREA, SOURCE, SCENARIO, CATEGORY, ENTITY, UNIT, TIME];
