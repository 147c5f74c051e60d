//! Columnar trajectory tables.
//!
//! A table is an ordered set of named columns of equal length, serialized
//! as a JSON object mapping column name to its values. Column order and row
//! order are preserved through a round trip.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{GridCacheError, Result};

pub const TIMESTAMP: &str = "timestamp";
pub const LATITUDE: &str = "latitude";
pub const LONGITUDE: &str = "longitude";
pub const ALTITUDE: &str = "altitude";

/// Numeric timestamps at or above this magnitude are taken as milliseconds.
const MILLIS_THRESHOLD: f64 = 1e11;

/// One parsed trajectory row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlightPoint {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    /// As supplied, not normalized.
    pub longitude: f64,
    /// In the configured altitude unit.
    pub altitude: f64,
}

impl FlightPoint {
    /// Timestamp as fractional Unix seconds.
    pub fn unix_seconds(&self) -> f64 {
        self.timestamp.timestamp() as f64 + self.timestamp.timestamp_subsec_nanos() as f64 * 1e-9
    }
}

/// Ordered named columns of equal length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrajectoryTable {
    columns: Vec<(String, Vec<Value>)>,
}

impl TrajectoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from columns, checking they all have the same length and
    /// distinct names.
    pub fn from_columns(columns: Vec<(String, Vec<Value>)>) -> Result<Self> {
        let mut table = Self::new();
        for (name, values) in columns {
            if table.column(&name).is_some() {
                return Err(GridCacheError::invalid_trajectory(format!(
                    "duplicate column {}",
                    name
                )));
            }
            table.set_column(name, values)?;
        }
        Ok(table)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, |(_, v)| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Replace a column in place, or append it if new.
    pub fn set_column(&mut self, name: impl Into<String>, values: Vec<Value>) -> Result<()> {
        let name = name.into();
        if !self.columns.is_empty() && values.len() != self.len() {
            return Err(GridCacheError::invalid_trajectory(format!(
                "column {} has {} rows, table has {}",
                name,
                values.len(),
                self.len()
            )));
        }

        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = values,
            None => self.columns.push((name, values)),
        }
        Ok(())
    }

    /// Parse the required columns into flight points.
    pub fn flight_points(&self) -> Result<Vec<FlightPoint>> {
        let timestamps = self.required(TIMESTAMP)?;
        let latitudes = self.required(LATITUDE)?;
        let longitudes = self.required(LONGITUDE)?;
        let altitudes = self.required(ALTITUDE)?;

        (0..self.len())
            .map(|row| {
                Ok(FlightPoint {
                    timestamp: parse_timestamp(&timestamps[row]).map_err(|e| at_row(row, e))?,
                    latitude: parse_number(LATITUDE, &latitudes[row]).map_err(|e| at_row(row, e))?,
                    longitude: parse_number(LONGITUDE, &longitudes[row])
                        .map_err(|e| at_row(row, e))?,
                    altitude: parse_number(ALTITUDE, &altitudes[row]).map_err(|e| at_row(row, e))?,
                })
            })
            .collect()
    }

    /// A copy of this table with interpolated columns merged in by row
    /// position. Missing values become `null`.
    pub fn with_field_columns(&self, fields: BTreeMap<String, Vec<Option<f64>>>) -> Result<Self> {
        let mut table = self.clone();
        for (name, values) in fields {
            let values = values
                .into_iter()
                .map(|v| {
                    v.and_then(serde_json::Number::from_f64)
                        .map_or(Value::Null, Value::Number)
                })
                .collect();
            table.set_column(name, values)?;
        }
        Ok(table)
    }

    fn required(&self, name: &str) -> Result<&[Value]> {
        self.column(name).ok_or_else(|| {
            GridCacheError::invalid_trajectory(format!("missing required column {}", name))
        })
    }
}

fn at_row(row: usize, err: GridCacheError) -> GridCacheError {
    match err {
        GridCacheError::InvalidTrajectory(msg) => {
            GridCacheError::invalid_trajectory(format!("row {}: {}", row, msg))
        }
        other => other,
    }
}

/// Normalize a longitude into `[0, 360)`.
pub fn normalize_longitude(lon: f64) -> f64 {
    let lon = lon.rem_euclid(360.0);
    if lon >= 360.0 {
        0.0
    } else {
        lon
    }
}

/// Parse a timestamp cell.
///
/// Accepts RFC 3339 strings, naive ISO-8601 strings (taken as UTC), and
/// numbers as Unix seconds (or milliseconds for very large magnitudes).
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Ok(naive.and_utc());
                }
            }
            if let Ok(secs) = s.parse::<f64>() {
                return from_unix(secs);
            }
            Err(GridCacheError::invalid_trajectory(format!(
                "unparseable timestamp {:?}",
                s
            )))
        }
        Value::Number(n) => match n.as_f64() {
            Some(secs) => from_unix(secs),
            None => Err(GridCacheError::invalid_trajectory("timestamp out of range")),
        },
        other => Err(GridCacheError::invalid_trajectory(format!(
            "timestamp must be a string or number, got {}",
            other
        ))),
    }
}

fn from_unix(value: f64) -> Result<DateTime<Utc>> {
    let millis = if value.abs() >= MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    if !millis.is_finite() {
        return Err(GridCacheError::invalid_trajectory("timestamp is not finite"));
    }
    DateTime::from_timestamp_millis(millis.round() as i64)
        .ok_or_else(|| GridCacheError::invalid_trajectory("timestamp out of range"))
}

fn parse_number(column: &str, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(GridCacheError::invalid_trajectory(format!(
            "{} must be a finite number, got {}",
            column, value
        ))),
    }
}

impl Serialize for TrajectoryTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, values) in &self.columns {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

/// A column given either as a list or as `{"<row index>": value}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ColumnInput {
    List(Vec<Value>),
    Indexed(BTreeMap<String, Value>),
}

impl ColumnInput {
    /// Values in row order, plus the sorted row index for indexed columns.
    fn into_values(self, column: &str) -> std::result::Result<(Option<Vec<u64>>, Vec<Value>), String> {
        match self {
            Self::List(values) => Ok((None, values)),
            Self::Indexed(map) => {
                let mut rows = map
                    .into_iter()
                    .map(|(key, value)| {
                        key.trim()
                            .parse::<u64>()
                            .map(|idx| (idx, value))
                            .map_err(|_| format!("column {} has non-numeric row index {:?}", column, key))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.sort_by_key(|(idx, _)| *idx);
                let (index, values): (Vec<u64>, Vec<Value>) = rows.into_iter().unzip();
                Ok((Some(index), values))
            }
        }
    }
}

struct TableVisitor;

impl<'de> Visitor<'de> for TableVisitor {
    type Value = TrajectoryTable;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of column name to a list or index map of values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut columns = Vec::with_capacity(access.size_hint().unwrap_or(0));
        // Indexed columns are aligned by key, so they must share one index.
        let mut row_index: Option<(String, Vec<u64>)> = None;
        while let Some((name, column)) = access.next_entry::<String, ColumnInput>()? {
            let (index, values) = column.into_values(&name).map_err(de::Error::custom)?;
            if let Some(index) = index {
                match &row_index {
                    Some((first, expected)) if *expected != index => {
                        return Err(de::Error::custom(format!(
                            "column {} has a different row index than column {}",
                            name, first
                        )));
                    }
                    Some(_) => {}
                    None => row_index = Some((name.clone(), index)),
                }
            }
            columns.push((name, values));
        }
        TrajectoryTable::from_columns(columns).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for TrajectoryTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(TableVisitor)
    }
}
