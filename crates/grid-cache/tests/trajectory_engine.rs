//! Integration tests for trajectory interpolation against a synced store.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use grid_cache::aero;
use grid_cache::testdata::SyntheticGridSource;
use grid_cache::{LocalCacheStore, TrajectoryEngine, TrajectoryTable};
use serde_json::Value;
use tempfile::TempDir;

const FIELDS: [&str; 4] = [
    "u_component_of_wind",
    "v_component_of_wind",
    "temperature",
    "specific_humidity",
];

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 10, 12, h, m, 0).unwrap()
}

fn level_hpa(altitude_ft: f64) -> f64 {
    aero::pressure(altitude_ft * aero::FT) / 100.0
}

fn flight() -> TrajectoryTable {
    serde_json::from_str(
        r#"{
            "flight_id": ["AFR1234", "AFR1234"],
            "timestamp": ["2021-10-12T01:10:00", "2021-10-12T01:20:00"],
            "latitude": [40.3, 42.5],
            "longitude": [4.2, 6.6],
            "altitude": [25000, 30000]
        }"#,
    )
    .expect("Failed to parse trajectory")
}

fn number(value: &Value) -> f64 {
    value.as_f64().unwrap_or_else(|| panic!("expected a number, got {}", value))
}

// =============================================================================
// Concrete scenario
// =============================================================================

#[tokio::test]
async fn test_two_point_flight() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(SyntheticGridSource::regional());
    let engine = TrajectoryEngine::new(
        source.cache_config(dir.path().join("cache.zarr")),
        source.clone(),
    );

    let table = flight();
    let out = engine.interpolate(&table).await.expect("Interpolation failed");

    assert_eq!(out.len(), 2);
    let names: Vec<&str> = out.column_names().collect();
    assert_eq!(names.len(), 9);
    assert_eq!(
        &names[..5],
        &["flight_id", "timestamp", "latitude", "longitude", "altitude"]
    );
    for field in FIELDS {
        assert!(names.contains(&field), "missing column {}", field);
    }

    // Hours bracketing both points: 01:00 (bootstrap) and 02:00.
    assert_eq!(source.requested_hours(), vec![at(1, 0), at(2, 0)]);

    // Fields are linear, so interpolation reproduces them.
    let rows = [
        (at(1, 10), level_hpa(25000.0), 40.3, 4.2),
        (at(1, 20), level_hpa(30000.0), 42.5, 6.6),
    ];
    for field in FIELDS {
        let column = out.column(field).unwrap();
        for (row, (time, level, lat, lon)) in rows.iter().enumerate() {
            let expected = source.expected(field, *time, *level, *lat, *lon).unwrap();
            let actual = number(&column[row]);
            assert!(
                (actual - expected).abs() < 1e-3,
                "{} row {}: expected {}, got {}",
                field,
                row,
                expected,
                actual
            );
        }
    }
}

#[tokio::test]
async fn test_repeated_request_uses_cache() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(SyntheticGridSource::regional());
    let engine = TrajectoryEngine::new(
        source.cache_config(dir.path().join("cache.zarr")),
        source.clone(),
    );

    let first = engine.interpolate(&flight()).await.unwrap();
    let second = engine.interpolate(&flight()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(source.requested_hours().len(), 2);
}

// =============================================================================
// Exact nodes, out-of-range points, column preservation
// =============================================================================

#[tokio::test]
async fn test_exact_grid_node() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(SyntheticGridSource::regional());
    let mut config = source.cache_config(dir.path().join("cache.zarr"));
    config.altitude_unit = grid_cache::AltitudeUnit::Meters;
    let engine = TrajectoryEngine::new(config, source.clone());

    // Altitude of the 500 hPa surface in the standard atmosphere.
    let altitude = aero::T0 / aero::BETA
        * ((50_000.0 / aero::P0).powf(-aero::BETA * aero::R / aero::G0) - 1.0);

    let table: TrajectoryTable = serde_json::from_str(&format!(
        r#"{{
            "timestamp": ["2021-10-12T02:00:00"],
            "latitude": [40.0],
            "longitude": [5.0],
            "altitude": [{}]
        }}"#,
        altitude
    ))
    .unwrap();
    let out = engine.interpolate(&table).await.unwrap();

    let grid = source
        .grid(at(2, 0), &["temperature".to_string()], &[500.0])
        .unwrap()
        .unwrap();
    let lat = 40; // 50 - 0.25 * 40
    let lon = 20; // 0.25 * 20
    let stored = grid.fields["temperature"][lat * 61 + lon] as f64;

    let actual = number(&out.column("temperature").unwrap()[0]);
    assert!((actual - stored).abs() < 1e-4, "{} != {}", actual, stored);
}

#[tokio::test]
async fn test_out_of_range_points_are_null() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(SyntheticGridSource::regional());
    let engine = TrajectoryEngine::new(
        source.cache_config(dir.path().join("cache.zarr")),
        source.clone(),
    );

    let table: TrajectoryTable = serde_json::from_str(
        r#"{
            "timestamp": ["2021-10-12T01:10:00", "2021-10-12T01:20:00", "2021-10-12T01:30:00"],
            "latitude": [40.3, 80.0, 41.0],
            "longitude": [4.2, 5.0, 5.0],
            "altitude": [25000, 25000, 60000]
        }"#,
    )
    .unwrap();
    let out = engine.interpolate(&table).await.expect("Out-of-range must not fail");

    for field in FIELDS {
        let column = out.column(field).unwrap();
        assert!(column[0].is_number(), "{} row 0 should be set", field);
        // North of the grid.
        assert!(column[1].is_null(), "{} row 1 should be null", field);
        // Above the highest cached level.
        assert!(column[2].is_null(), "{} row 2 should be null", field);
    }
}

#[tokio::test]
async fn test_original_columns_are_preserved() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(SyntheticGridSource::regional());
    let engine = TrajectoryEngine::new(
        source.cache_config(dir.path().join("cache.zarr")),
        source.clone(),
    );

    let table: TrajectoryTable = serde_json::from_str(
        r#"{
            "callsign": ["X1", null, "X3"],
            "timestamp": [1634001000, 1634001600, 1634002200],
            "latitude": [42.0, 41.0, 40.0],
            "longitude": [-0.5, 1.0, 2.0],
            "altitude": [30000, 31000, 32000],
            "note": [{"a": 1}, [1, 2], true]
        }"#,
    )
    .unwrap();
    let out = engine.interpolate(&table).await.unwrap();

    let in_names: Vec<&str> = table.column_names().collect();
    let out_names: Vec<&str> = out.column_names().collect();
    assert_eq!(&out_names[..in_names.len()], &in_names[..]);
    for name in in_names {
        assert_eq!(out.column(name), table.column(name), "column {} changed", name);
    }
    // The longitude column is returned as given, not normalized.
    assert_eq!(number(&out.column("longitude").unwrap()[0]), -0.5);
}

// =============================================================================
// Unavailable data and longitude wrap
// =============================================================================

#[tokio::test]
async fn test_unavailable_range_returns_table_unchanged() {
    let dir = TempDir::new().unwrap();
    let source = SyntheticGridSource::regional()
        .with_missing(at(1, 0))
        .with_missing(at(2, 0));
    let config = source.cache_config(dir.path().join("cache.zarr"));
    let engine = TrajectoryEngine::new(config, Arc::new(source));

    let table = flight();
    let out = engine.interpolate(&table).await.expect("Unavailable data must not fail");

    assert_eq!(out, table);
    assert!(!LocalCacheStore::exists(&engine.config().local_store));
}

#[tokio::test]
async fn test_interpolation_across_antimeridian() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(SyntheticGridSource::global());
    let mut config = source.cache_config(dir.path().join("cache.zarr"));
    config.spatial_margin_deg = 30.0;
    let engine = TrajectoryEngine::new(config, source.clone());

    let table: TrajectoryTable = serde_json::from_str(
        r#"{
            "timestamp": ["2021-10-12T03:00:00"],
            "latitude": [30.0],
            "longitude": [-10.0],
            "altitude": [25000]
        }"#,
    )
    .unwrap();
    let out = engine.interpolate(&table).await.unwrap();

    // -10 is 350, two thirds of the way from the 330 column to the 0 column.
    let level = level_hpa(25000.0);
    let west = source.expected("temperature", at(3, 0), level, 30.0, 330.0).unwrap();
    let east = source.expected("temperature", at(3, 0), level, 30.0, 0.0).unwrap();
    let expected = west / 3.0 + east * 2.0 / 3.0;

    let actual = number(&out.column("temperature").unwrap()[0]);
    assert!((actual - expected).abs() < 1e-3, "{} != {}", actual, expected);
}
