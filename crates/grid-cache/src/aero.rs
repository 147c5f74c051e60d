//! International Standard Atmosphere conversions.
//!
//! Trajectory altitudes are geometric heights; the grid is indexed by
//! pressure level, so every point's level coordinate is derived here.

use crate::config::AltitudeUnit;

/// Meters per foot.
pub const FT: f64 = 0.3048;

/// Sea-level pressure (Pa).
pub const P0: f64 = 101_325.0;

/// Sea-level temperature (K).
pub const T0: f64 = 288.15;

/// Standard gravity (m/s^2).
pub const G0: f64 = 9.80665;

/// Specific gas constant of dry air (J/(kg K)).
pub const R: f64 = 287.05287;

/// Tropospheric temperature lapse rate (K/m).
pub const BETA: f64 = -0.0065;

/// Tropopause height (m).
pub const H_TROPOPAUSE: f64 = 11_000.0;

/// Tropopause temperature (K).
pub const T_TROPOPAUSE: f64 = T0 + BETA * H_TROPOPAUSE;

/// ISA temperature (K) at geometric height `h` meters.
pub fn temperature(h: f64) -> f64 {
    (T0 + BETA * h).max(T_TROPOPAUSE)
}

/// ISA pressure (Pa) at geometric height `h` meters.
///
/// Uses the lapse-rate law below the tropopause and the isothermal law
/// above it, so the function is continuous and strictly decreasing.
/// Negative heights are valid and give pressures above `P0`.
pub fn pressure(h: f64) -> f64 {
    if h < H_TROPOPAUSE {
        P0 * (temperature(h) / T0).powf(-G0 / (BETA * R))
    } else {
        tropopause_pressure() * (-G0 / (R * T_TROPOPAUSE) * (h - H_TROPOPAUSE)).exp()
    }
}

fn tropopause_pressure() -> f64 {
    P0 * (T_TROPOPAUSE / T0).powf(-G0 / (BETA * R))
}

/// Pressure levels (hPa) for a whole altitude column.
pub fn pressure_levels_hpa(altitudes: &[f64], unit: AltitudeUnit) -> Vec<f64> {
    altitudes
        .iter()
        .map(|&alt| pressure(unit.to_meters(alt)) / 100.0)
        .collect()
}
