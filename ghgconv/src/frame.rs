//! Conversion between [`ObservationTable`] and the long-format interchange `DataFrame`.

use std::str::FromStr;

use log::debug;
use polars::prelude::*;

use crate::column_names as COL;
use crate::error::{ConversionError, Result};
use crate::observation::{Key, Marker, Observation, ObservationTable, Value};
use crate::report::Conflict;

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let column = df.column(name)?.cast(&DataType::String)?;
    column
        .str()?
        .into_iter()
        .enumerate()
        .map(|(row, cell)| {
            cell.map(str::to_string).ok_or_else(|| {
                ConversionError::InvalidTable(format!("null in column '{name}' at row {row}"))
            })
        })
        .collect()
}

fn time_column(df: &DataFrame) -> Result<Vec<i32>> {
    let column = df.column(COL::TIME)?.cast(&DataType::Int32)?;
    column
        .i32()?
        .into_iter()
        .enumerate()
        .map(|(row, cell)| {
            cell.ok_or_else(|| {
                ConversionError::InvalidTable(format!(
                    "missing or non-integer '{}' at row {row}",
                    COL::TIME
                ))
            })
        })
        .collect()
}

/// Numeric value columns are taken as they are; string columns may mix numbers and markers.
fn value_column(df: &DataFrame) -> Result<Vec<Value>> {
    let column = df.column(COL::VALUE)?;
    if column.dtype() == &DataType::String {
        column
            .str()?
            .into_iter()
            .map(|cell| match cell {
                None => Ok(Value::Missing),
                Some(raw) => Value::parse(raw).ok_or_else(|| {
                    ConversionError::InvalidTable(format!("unparseable value '{raw}'"))
                }),
            })
            .collect()
    } else {
        let column = column.cast(&DataType::Float64)?;
        Ok(column.f64()?.into_iter().map(Value::from).collect())
    }
}

/// Markers from the optional marker column, used where the value column is empty.
fn marker_column(df: &DataFrame) -> Result<Option<Vec<Option<Marker>>>> {
    let Ok(column) = df.column(COL::MARKER) else {
        return Ok(None);
    };
    let column = column.cast(&DataType::String)?;
    let markers = column
        .str()?
        .into_iter()
        .map(|cell| match cell.map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Marker::from_str(raw)
                .map(Some)
                .map_err(|_| ConversionError::InvalidTable(format!("unknown marker '{raw}'"))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(markers))
}

impl ObservationTable {
    /// Reads the interchange table. Rows repeating a key with a different value are dropped
    /// (the first one wins) and returned as conflicts.
    pub fn from_dataframe(df: &DataFrame) -> Result<(Self, Vec<Conflict>)> {
        let areas = string_column(df, COL::AREA)?;
        let sources = string_column(df, COL::SOURCE)?;
        let scenarios = string_column(df, COL::SCENARIO)?;
        let categories = string_column(df, COL::CATEGORY)?;
        let entities = string_column(df, COL::ENTITY)?;
        let units = string_column(df, COL::UNIT)?;
        let times = time_column(df)?;
        let mut values = value_column(df)?;
        if let Some(markers) = marker_column(df)? {
            for (value, marker) in values.iter_mut().zip(markers) {
                if let (Value::Missing, Some(marker)) = (*value, marker) {
                    *value = Value::Marker(marker);
                }
            }
        }

        let observations = (0..df.height()).map(|i| Observation {
            key: Key::new(
                &areas[i],
                &sources[i],
                &scenarios[i],
                &categories[i],
                &entities[i],
                &units[i],
                times[i],
            ),
            value: values[i],
        });
        let (table, duplicates) = Self::from_observations(observations);
        let conflicts = duplicates
            .into_iter()
            .map(|(key, kept, discarded)| Conflict {
                key,
                stage: "input".into(),
                kept,
                discarded,
            })
            .collect::<Vec<_>>();
        debug!(
            "Read {} rows into {} observations ({} conflicting duplicates)",
            df.height(),
            table.len(),
            conflicts.len()
        );
        Ok((table, conflicts))
    }

    /// Writes the table with a numeric `value` column and markers in a separate column.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let mut columns: [Vec<&str>; 6] = Default::default();
        let mut times = Vec::with_capacity(self.len());
        let mut values = Vec::with_capacity(self.len());
        let mut markers = Vec::with_capacity(self.len());
        for (key, value) in self.iter() {
            for (column, field) in columns.iter_mut().zip([
                &key.area,
                &key.source,
                &key.scenario,
                &key.category,
                &key.entity,
                &key.unit,
            ]) {
                column.push(field.as_str());
            }
            times.push(key.time);
            values.push(value.as_number());
            markers.push(match value {
                Value::Marker(m) => Some(m.to_string()),
                _ => None,
            });
        }
        let mut series = columns
            .into_iter()
            .zip(COL::KEY_COLUMNS)
            .map(|(column, name)| Series::new(name, column))
            .collect::<Vec<_>>();
        series.push(Series::new(COL::TIME, times));
        series.push(Series::new(COL::VALUE, values));
        series.push(Series::new(COL::MARKER, markers));
        Ok(DataFrame::new(series)?)
    }
}
