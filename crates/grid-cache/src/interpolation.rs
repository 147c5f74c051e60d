//! Multilinear interpolation over a cropped 4D grid.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::types::{GridCoordinate, GridCube};

/// Linear stencil on one axis: the two bracketing node indices (in the
/// axis' own storage order) and the weight given to `upper`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stencil {
    pub lower: usize,
    pub upper: usize,
    pub weight: f64,
}

impl Stencil {
    /// (index, weight) pairs with non-zero weight.
    fn nodes(&self) -> impl Iterator<Item = (usize, f64)> {
        [(self.lower, 1.0 - self.weight), (self.upper, self.weight)]
            .into_iter()
            .filter(|(_, w)| *w > 0.0)
    }
}

/// One grid axis with its values in any order.
#[derive(Debug, Clone)]
pub struct Axis {
    /// Sorted ascending.
    sorted: Vec<f64>,
    /// Storage index of each entry of `sorted`.
    order: Vec<usize>,
}

impl Axis {
    /// Build from axis values in storage order. NaN nodes are ignored.
    pub fn new(values: &[f64]) -> Self {
        let mut order: Vec<usize> = (0..values.len()).filter(|&i| !values[i].is_nan()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        let sorted = order.iter().map(|&i| values[i]).collect();
        Self { sorted, order }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Bracket `x` between two nodes.
    ///
    /// Returns `None` outside `[min, max]` (no extrapolation). A single-node
    /// axis only matches its own value.
    pub fn locate(&self, x: f64) -> Option<Stencil> {
        if x.is_nan() {
            return None;
        }
        let (first, last) = (*self.sorted.first()?, *self.sorted.last()?);
        let eps = 1e-9 * x.abs().max(1.0);

        if x < first - eps || x > last + eps {
            return None;
        }
        if self.sorted.len() == 1 {
            return Some(Stencil {
                lower: self.order[0],
                upper: self.order[0],
                weight: 0.0,
            });
        }

        let n = self.sorted.len();
        let k = self
            .sorted
            .partition_point(|v| *v <= x)
            .saturating_sub(1)
            .min(n - 2);
        let (lo, hi) = (self.sorted[k], self.sorted[k + 1]);
        let span = hi - lo;
        let weight = if span > 0.0 {
            ((x - lo) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Some(Stencil {
            lower: self.order[k],
            upper: self.order[k + 1],
            weight,
        })
    }
}

/// Interpolated values of several fields at the same coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldColumns {
    /// One value per coordinate for each field; `None` where missing.
    pub columns: BTreeMap<String, Vec<Option<f64>>>,
    /// Coordinates outside the cube on at least one axis.
    pub out_of_range: usize,
}

/// Interpolates fields of a [`GridCube`] at arbitrary coordinates.
pub struct Interpolator<'a> {
    cube: &'a GridCube,
    axes: [Axis; 4],
}

impl<'a> Interpolator<'a> {
    pub fn new(cube: &'a GridCube) -> Self {
        let times: Vec<f64> = cube.times.iter().map(|t| t.timestamp() as f64).collect();
        Self {
            cube,
            axes: [
                Axis::new(&times),
                Axis::new(&cube.levels),
                Axis::new(&cube.latitudes),
                Axis::new(&cube.longitudes),
            ],
        }
    }

    /// Stencils on the time, level, latitude and longitude axes, or `None`
    /// if the coordinate lies outside the cube on any of them.
    pub fn locate(&self, coord: &GridCoordinate) -> Option<[Stencil; 4]> {
        Some([
            self.axes[0].locate(coord.time)?,
            self.axes[1].locate(coord.level)?,
            self.axes[2].locate(coord.latitude)?,
            self.axes[3].locate(coord.longitude)?,
        ])
    }

    /// Interpolate one field at a single coordinate.
    ///
    /// `None` when the coordinate is outside the cube, or when a node with a
    /// non-zero weight holds no data.
    pub fn value(&self, field: &str, coord: &GridCoordinate) -> Option<f64> {
        let data = self.cube.fields.get(field)?;
        let stencils = self.locate(coord)?;
        self.blend(data, &stencils)
    }

    /// Interpolate one field at every coordinate, in parallel.
    pub fn interpolate(&self, field: &str, coords: &[GridCoordinate]) -> Vec<Option<f64>> {
        let Some(data) = self.cube.fields.get(field) else {
            return vec![None; coords.len()];
        };

        coords
            .par_iter()
            .map(|coord| {
                let stencils = self.locate(coord)?;
                self.blend(data, &stencils)
            })
            .collect()
    }

    /// Interpolate several fields, keyed by field name.
    ///
    /// Each coordinate is located once and its stencils shared by every field.
    pub fn interpolate_all(&self, fields: &[String], coords: &[GridCoordinate]) -> FieldColumns {
        let stencils: Vec<Option<[Stencil; 4]>> =
            coords.par_iter().map(|coord| self.locate(coord)).collect();
        let out_of_range = stencils.iter().filter(|s| s.is_none()).count();

        let columns = fields
            .iter()
            .map(|field| {
                let values = match self.cube.fields.get(field) {
                    Some(data) => stencils
                        .par_iter()
                        .map(|s| s.as_ref().and_then(|s| self.blend(data, s)))
                        .collect(),
                    None => vec![None; coords.len()],
                };
                (field.clone(), values)
            })
            .collect();

        FieldColumns {
            columns,
            out_of_range,
        }
    }

    fn blend(&self, data: &[f32], stencils: &[Stencil; 4]) -> Option<f64> {
        let mut sum = 0.0;
        for (t, wt) in stencils[0].nodes() {
            for (l, wl) in stencils[1].nodes() {
                for (y, wy) in stencils[2].nodes() {
                    for (x, wx) in stencils[3].nodes() {
                        let value = *data.get(self.cube.offset([t, l, y, x]))?;
                        if value.is_nan() {
                            return None;
                        }
                        sum += wt * wl * wy * wx * value as f64;
                    }
                }
            }
        }
        Some(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::from_seconds;

    #[test]
    fn test_locate_ascending() {
        let axis = Axis::new(&[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(
            axis.locate(1.25),
            Some(Stencil {
                lower: 1,
                upper: 2,
                weight: 0.25
            })
        );
        let end = axis.locate(3.0).unwrap();
        assert_eq!((end.lower, end.upper), (2, 3));
        assert!((end.weight - 1.0).abs() < 1e-12);
        assert_eq!(axis.locate(3.5), None);
        assert_eq!(axis.locate(-0.1), None);
        assert_eq!(axis.locate(f64::NAN), None);
    }

    #[test]
    fn test_locate_descending() {
        // Latitudes are usually stored north to south.
        let axis = Axis::new(&[45.0, 44.0, 43.0]);
        let s = axis.locate(43.5).unwrap();
        assert_eq!((s.lower, s.upper), (2, 1));
        assert!((s.weight - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_locate_single_node() {
        let axis = Axis::new(&[300.0]);
        assert_eq!(axis.locate(300.0).map(|s| s.lower), Some(0));
        assert_eq!(axis.locate(300.5), None);
        assert_eq!(Axis::new(&[]).locate(0.0), None);
    }

    fn cube() -> GridCube {
        // value = t_index * 1000 + level + lat * 10 + lon
        let mut cube = GridCube {
            times: vec![from_seconds(0), from_seconds(3600)],
            levels: vec![400.0, 300.0],
            latitudes: vec![41.0, 40.0],
            longitudes: vec![4.0, 5.0],
            fields: BTreeMap::new(),
        };
        let mut values = Vec::new();
        for t in 0..2 {
            for &l in &cube.levels {
                for &y in &cube.latitudes {
                    for &x in &cube.longitudes {
                        values.push((t as f64 * 1000.0 + l + y * 10.0 + x) as f32);
                    }
                }
            }
        }
        cube.fields.insert("t".to_string(), values);
        cube
    }

    #[test]
    fn test_exact_node_and_midpoint() {
        let cube = cube();
        let interp = Interpolator::new(&cube);

        let node = GridCoordinate {
            time: 3600.0,
            level: 300.0,
            latitude: 40.0,
            longitude: 5.0,
        };
        assert_eq!(interp.value("t", &node), Some(1000.0 + 300.0 + 400.0 + 5.0));

        let mid = GridCoordinate {
            time: 1800.0,
            level: 350.0,
            latitude: 40.5,
            longitude: 4.5,
        };
        let v = interp.value("t", &mid).unwrap();
        assert!((v - (500.0 + 350.0 + 405.0 + 4.5)).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_range_is_missing() {
        let cube = cube();
        let interp = Interpolator::new(&cube);
        let coords = [
            GridCoordinate {
                time: 1800.0,
                level: 350.0,
                latitude: 42.0,
                longitude: 4.5,
            },
            GridCoordinate {
                time: 7200.0,
                level: 350.0,
                latitude: 40.5,
                longitude: 4.5,
            },
        ];
        assert_eq!(interp.interpolate("t", &coords), vec![None, None]);
        assert_eq!(interp.interpolate("unknown", &coords), vec![None, None]);
    }

    #[test]
    fn test_interpolate_all_counts_out_of_range_once() {
        let cube = cube();
        let interp = Interpolator::new(&cube);
        let coords = [
            GridCoordinate {
                time: 1800.0,
                level: 350.0,
                latitude: 40.5,
                longitude: 4.5,
            },
            GridCoordinate {
                time: 1800.0,
                level: 350.0,
                latitude: 42.0,
                longitude: 4.5,
            },
        ];
        let fields = vec!["t".to_string(), "unknown".to_string()];
        let result = interp.interpolate_all(&fields, &coords);

        assert_eq!(result.out_of_range, 1);
        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.columns["t"][0], interp.value("t", &coords[0]));
        assert_eq!(result.columns["t"][1], None);
        assert_eq!(result.columns["unknown"], vec![None, None]);
    }

    #[test]
    fn test_nan_node_only_matters_with_weight() {
        let mut cube = cube();
        let at = cube.offset([1, 1, 1, 1]);
        cube.fields.get_mut("t").unwrap()[at] = f32::NAN;
        let interp = Interpolator::new(&cube);

        let touching = GridCoordinate {
            time: 1800.0,
            level: 350.0,
            latitude: 40.5,
            longitude: 4.5,
        };
        assert_eq!(interp.value("t", &touching), None);

        let away = GridCoordinate {
            time: 0.0,
            level: 350.0,
            latitude: 40.5,
            longitude: 4.5,
        };
        assert!(interp.value("t", &away).is_some());
    }
}
