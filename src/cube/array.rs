//! Labelled multi-dimensional array values and their verbs.
//!
//! A [`Cube`] is a dense row-major array over named dimensions with
//! coordinate labels, a declared value type, and an optional label
//! dictionary for categorical data. `f64::NAN` is the missing sentinel.
//! Verbs never mutate in place — every transformation yields a new cube.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::collection::Collection;
use super::{SPACE, X, Y};
use crate::error::QueryError;

/// Statistical value type of a cube.
///
/// `Nominal` and `Ordinal` are the categorical types and may carry a label
/// dictionary; `Discrete` and `Continuous` are the numeric types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Binary,
    Nominal,
    Ordinal,
    Discrete,
    Continuous,
}

impl ValueType {
    pub fn is_categorical(self) -> bool {
        matches!(self, Self::Nominal | Self::Ordinal)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Discrete | Self::Continuous)
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Nominal => write!(f, "nominal"),
            Self::Ordinal => write!(f, "ordinal"),
            Self::Discrete => write!(f, "discrete"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// A coordinate along a dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Coord {
    /// Temporal coordinate, epoch seconds.
    Time(i64),
    /// Stacked spatial coordinate: cell center in integer CRS units.
    Space { y: i64, x: i64 },
    /// Plain integer coordinate on an auxiliary axis.
    Int(i64),
    /// Named coordinate on an auxiliary axis (e.g. a band or group name).
    Str(String),
}

impl std::fmt::Display for Coord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Time(t) => write!(f, "t{t}"),
            Self::Space { y, x } => write!(f, "({y}, {x})"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A named dimension with ordered coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    name: String,
    coords: Vec<Coord>,
}

impl Dimension {
    pub fn new(name: &str, coords: Vec<Coord>) -> Self {
        Self { name: name.to_string(), coords }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coords(&self) -> &[Coord] {
        &self.coords
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }
}

/// Method for the fill verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMethod {
    /// Closest valid value along the dimension (ties resolve backwards).
    Nearest,
    /// Carry the last valid value forwards.
    Forward,
    /// Carry the next valid value backwards.
    Backward,
}

/// A labelled multi-dimensional array value.
#[derive(Debug, Clone)]
pub struct Cube {
    name: Option<String>,
    vtype: Option<ValueType>,
    labels: Option<BTreeMap<i64, String>>,
    dims: Vec<Dimension>,
    values: Vec<f64>,
}

fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn truthy(v: f64) -> bool {
    v.is_finite() && v != 0.0
}

/// Format a value for group and coordinate names.
pub(crate) fn format_value(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

impl Cube {
    /// Build a cube from dimensions and row-major values.
    pub fn new(dims: Vec<Dimension>, values: Vec<f64>) -> Self {
        debug_assert_eq!(
            dims.iter().map(Dimension::len).product::<usize>(),
            values.len(),
            "value buffer does not match dimension shape"
        );
        Self { name: None, vtype: None, labels: None, dims, values }
    }

    /// Build a cube filled with a single value.
    pub fn filled(dims: Vec<Dimension>, value: f64) -> Self {
        let len = dims.iter().map(Dimension::len).product();
        Self::new(dims, vec![value; len])
    }

    /// Build a zero-dimensional cube holding a single value.
    pub fn scalar(value: f64) -> Self {
        Self::new(Vec::new(), vec![value])
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_vtype(mut self, vtype: Option<ValueType>) -> Self {
        self.vtype = vtype;
        self
    }

    pub fn with_labels(mut self, labels: Option<BTreeMap<i64, String>>) -> Self {
        self.labels = labels;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn name_or(&self, fallback: &str) -> String {
        self.name.clone().unwrap_or_else(|| fallback.to_string())
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn vtype(&self) -> Option<ValueType> {
        self.vtype
    }

    pub fn labels(&self) -> Option<&BTreeMap<i64, String>> {
        self.labels.as_ref()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(Dimension::len).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name() == name)
    }

    /// A cube is empty when it holds no cells or only missing values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() || self.values.iter().all(|v| !v.is_finite())
    }

    /// Bitwise identity of metadata and values, including missing cells.
    pub fn identical(&self, other: &Cube) -> bool {
        self.name == other.name
            && self.vtype == other.vtype
            && self.labels == other.labels
            && self.dims == other.dims
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    /// Position along dimension `dim` for a flat index.
    fn pos_along(&self, flat: usize, dim: usize, strides: &[usize], shape: &[usize]) -> usize {
        (flat / strides[dim]) % shape[dim]
    }

    fn keep_meta(&self, values: Vec<f64>) -> Cube {
        Cube {
            name: self.name.clone(),
            vtype: self.vtype,
            labels: self.labels.clone(),
            dims: self.dims.clone(),
            values,
        }
    }

    /// New cube with the same name and dimensions but untyped values; the
    /// type promoter stamps the output type afterwards.
    fn untyped(&self, values: Vec<f64>) -> Cube {
        Cube {
            name: self.name.clone(),
            vtype: None,
            labels: None,
            dims: self.dims.clone(),
            values,
        }
    }

    //
    // ALIGNMENT
    //

    /// Align this cube to the shape of another cube: a left join on shared
    /// dimensions followed by a broadcast over the missing ones. Every
    /// dimension of the input must be present in the other cube.
    pub fn align_with(&self, other: &Cube) -> Result<Cube, QueryError> {
        if self.dims.is_empty() {
            let value = self.values.first().copied().unwrap_or(f64::NAN);
            return Ok(Cube {
                name: self.name.clone(),
                vtype: self.vtype,
                labels: self.labels.clone(),
                dims: other.dims.clone(),
                values: vec![value; other.len()],
            });
        }
        let mut own_dim_in_other = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match other.dim_index(dim.name()) {
                Some(i) => own_dim_in_other.push(i),
                None => {
                    return Err(QueryError::Alignment {
                        input: other.name_or("x"),
                        other: self.name_or("y"),
                    })
                }
            }
        }
        let coord_maps: Vec<FxHashMap<&Coord, usize>> = self
            .dims
            .iter()
            .map(|d| d.coords().iter().enumerate().map(|(i, c)| (c, i)).collect())
            .collect();
        let own_shape = self.shape();
        let own_strides = strides_of(&own_shape);
        let other_shape = other.shape();
        let other_strides = strides_of(&other_shape);
        let mut values = Vec::with_capacity(other.len());
        'cells: for flat in 0..other.len() {
            let mut src = 0usize;
            for (k, &d) in own_dim_in_other.iter().enumerate() {
                let pos = other.pos_along(flat, d, &other_strides, &other_shape);
                let coord = &other.dims[d].coords()[pos];
                match coord_maps[k].get(coord) {
                    Some(&p) => src += p * own_strides[k],
                    None => {
                        values.push(f64::NAN);
                        continue 'cells;
                    }
                }
            }
            values.push(self.values[src]);
        }
        Ok(Cube {
            name: self.name.clone(),
            vtype: self.vtype,
            labels: self.labels.clone(),
            dims: other.dims.clone(),
            values,
        })
    }

    //
    // ELEMENTWISE KERNEL PLUMBING
    //

    /// Apply a unary kernel cell-wise. Missing cells stay missing.
    pub fn map_unary(&self, f: impl Fn(f64) -> f64) -> Cube {
        let values = self
            .values
            .iter()
            .map(|&v| if v.is_finite() { f(v) } else { f64::NAN })
            .collect();
        self.untyped(values)
    }

    /// Apply a binary kernel against a constant right-hand side.
    pub fn zip_scalar(&self, y: f64, f: impl Fn(f64, f64) -> f64) -> Cube {
        let values = self
            .values
            .iter()
            .map(|&v| if v.is_finite() { f(v, y) } else { f64::NAN })
            .collect();
        self.untyped(values)
    }

    /// Apply a binary kernel against another cube, aligning it first.
    pub fn zip_cube(&self, y: &Cube, f: impl Fn(f64, f64) -> f64) -> Result<Cube, QueryError> {
        let aligned = y.align_with(self)?;
        let values = self
            .values
            .iter()
            .zip(&aligned.values)
            .map(|(&a, &b)| if a.is_finite() { f(a, b) } else { f64::NAN })
            .collect();
        Ok(self.untyped(values))
    }

    /// Apply a membership kernel against a list of constants.
    pub fn zip_list(&self, ys: &[f64], f: impl Fn(f64, &[f64]) -> f64) -> Cube {
        let values = self
            .values
            .iter()
            .map(|&v| if v.is_finite() { f(v, ys) } else { f64::NAN })
            .collect();
        self.untyped(values)
    }

    //
    // VERBS
    //

    /// Extract coordinate labels of a dimension as a new one-dimensional
    /// cube, optionally a specific component of them (e.g. the year of the
    /// temporal coordinates, computed in the output timezone).
    pub fn extract(
        &self,
        dimension: &str,
        component: Option<&str>,
        tz_offset: i32,
    ) -> Result<Cube, QueryError> {
        let d = self
            .dim_index(dimension)
            .ok_or_else(|| QueryError::UnknownDimension(dimension.to_string()))?;
        let dim = &self.dims[d];
        let bad_component = |component: &str| QueryError::UnknownComponent {
            dimension: dimension.to_string(),
            component: component.to_string(),
        };
        let mut labels: Option<BTreeMap<i64, String>> = None;
        let mut vtype = Some(ValueType::Discrete);
        let mut values = Vec::with_capacity(dim.len());
        for (i, coord) in dim.coords().iter().enumerate() {
            let value = match (coord, component) {
                (Coord::Time(t), None) => {
                    vtype = Some(ValueType::Ordinal);
                    *t as f64
                }
                (Coord::Time(t), Some(c)) => {
                    time_component_name_check(c).ok_or_else(|| bad_component(c))?;
                    time_component(*t, c, tz_offset).unwrap_or(f64::NAN)
                }
                (Coord::Space { .. }, None) => i as f64,
                (Coord::Space { x, .. }, Some(c)) if c == X => {
                    vtype = Some(ValueType::Continuous);
                    *x as f64
                }
                (Coord::Space { y, .. }, Some(c)) if c == Y => {
                    vtype = Some(ValueType::Continuous);
                    *y as f64
                }
                (Coord::Space { .. }, Some(c)) => return Err(bad_component(c)),
                (Coord::Int(v), None) => *v as f64,
                (Coord::Str(s), None) => {
                    vtype = Some(ValueType::Nominal);
                    labels
                        .get_or_insert_with(BTreeMap::new)
                        .insert(i as i64, s.clone());
                    i as f64
                }
                (_, Some(c)) => return Err(bad_component(c)),
            };
            values.push(value);
        }
        Ok(Cube::new(vec![dim.clone()], values)
            .with_vtype(vtype)
            .with_labels(labels)
            .with_name(Some(dimension.to_string())))
    }

    /// Keep cells where the (aligned) binary filterer is true, drop the
    /// rest to missing. Missing filterer cells do not pass.
    pub fn filter(&self, filterer: &Cube, track_types: bool) -> Result<Cube, QueryError> {
        if track_types {
            if let Some(vt) = filterer.vtype {
                if vt != ValueType::Binary {
                    return Err(QueryError::InvalidValueType {
                        operation: "filter".to_string(),
                        input_types: vec![Some(vt)],
                    });
                }
            }
        }
        let aligned = filterer.align_with(self)?;
        let values = self
            .values
            .iter()
            .zip(&aligned.values)
            .map(|(&v, &keep)| if truthy(keep) { v } else { f64::NAN })
            .collect();
        Ok(self.keep_meta(values))
    }

    /// Assign new values to non-missing cells, optionally only where the
    /// binary `at` mask is true. No computation is involved.
    pub(crate) fn assign_values(
        &self,
        y: &AssignSource,
        at: Option<&Cube>,
        track_types: bool,
    ) -> Result<Cube, QueryError> {
        let mask = match at {
            Some(m) => {
                if track_types {
                    if let Some(vt) = m.vtype {
                        if vt != ValueType::Binary {
                            return Err(QueryError::InvalidValueType {
                                operation: "assign".to_string(),
                                input_types: vec![Some(vt)],
                            });
                        }
                    }
                }
                Some(m.align_with(self)?)
            }
            None => None,
        };
        let y_aligned = match y {
            AssignSource::Cube(c) => Some(c.align_with(self)?),
            AssignSource::Scalar(_) => None,
        };
        let values = self
            .values
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                if !x.is_finite() {
                    return f64::NAN;
                }
                if let Some(m) = &mask {
                    if !truthy(m.values[i]) {
                        return x;
                    }
                }
                match y {
                    AssignSource::Scalar(v) => *v,
                    AssignSource::Cube(_) => match &y_aligned {
                        Some(c) => c.values[i],
                        None => f64::NAN,
                    },
                }
            })
            .collect();
        Ok(self.untyped(values))
    }

    /// Split the cube into groups along a shared one-dimensional grouper
    /// axis. Group names come from the groupers' value labels when defined.
    pub fn groupby(&self, groupers: &[Cube], labels_as_names: bool) -> Result<Collection, QueryError> {
        if groupers.is_empty() {
            return Err(QueryError::InvalidRecipe("groupby requires a grouper".to_string()));
        }
        for g in groupers {
            if g.dims.len() != 1 {
                return Err(QueryError::TooManyDimensions {
                    operation: "groupby".to_string(),
                    dimensions: g.dims.iter().map(|d| d.name().to_string()).collect(),
                });
            }
        }
        let dim_name = groupers[0].dims[0].name().to_string();
        if groupers.iter().any(|g| g.dims[0].name() != dim_name) {
            return Err(QueryError::MixedDimensions(
                "dimensions of grouper arrays do not match".to_string(),
            ));
        }
        let d = self.dim_index(&dim_name).ok_or_else(|| QueryError::MissingDimension {
            operation: "groupby".to_string(),
            dimension: dim_name.clone(),
        })?;
        // Grouper value per coordinate of the grouped dimension, matched by
        // coordinate rather than position.
        let coords = self.dims[d].coords();
        let mut keys: Vec<Option<Vec<f64>>> = Vec::with_capacity(coords.len());
        for coord in coords {
            let mut key = Vec::with_capacity(groupers.len());
            let mut valid = true;
            for g in groupers {
                let gpos = g.dims[0].coords().iter().position(|c| c == coord);
                let value = gpos.map(|p| g.values[p]).unwrap_or(f64::NAN);
                if !value.is_finite() {
                    valid = false;
                    break;
                }
                key.push(value);
            }
            keys.push(if valid { Some(key) } else { None });
        }
        // Distinct keys in ascending order, as a grouped index would yield.
        let mut distinct: Vec<Vec<f64>> = Vec::new();
        for key in keys.iter().flatten() {
            if !distinct.contains(key) {
                distinct.push(key.clone());
            }
        }
        distinct.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mut groups = Vec::with_capacity(distinct.len());
        for key in &distinct {
            let keep: Vec<usize> = keys
                .iter()
                .enumerate()
                .filter(|(_, k)| k.as_deref() == Some(key.as_slice()))
                .map(|(i, _)| i)
                .collect();
            let mut group = self.select_along(d, &keep);
            group.set_name(Some(group_name(key, groupers, labels_as_names)));
            groups.push(group);
        }
        Ok(Collection::new(groups))
    }

    /// Reduce along one dimension (or all of them) with a reducer kernel.
    pub fn reduce_with(
        &self,
        dimension: Option<&str>,
        f: &dyn Fn(&[f64]) -> f64,
    ) -> Result<Cube, QueryError> {
        let d = match dimension {
            None => {
                let mut out = Cube::scalar(f(&self.values));
                out.name = self.name.clone();
                return Ok(out);
            }
            Some(name) => self
                .dim_index(name)
                .ok_or_else(|| QueryError::UnknownDimension(name.to_string()))?,
        };
        let shape = self.shape();
        let strides = strides_of(&shape);
        let kept: Vec<usize> = (0..self.dims.len()).filter(|&i| i != d).collect();
        let out_dims: Vec<Dimension> = kept.iter().map(|&i| self.dims[i].clone()).collect();
        let out_shape: Vec<usize> = kept.iter().map(|&i| shape[i]).collect();
        let out_strides = strides_of(&out_shape);
        let out_len = out_shape.iter().product::<usize>();
        let mut values = Vec::with_capacity(out_len);
        let mut line = Vec::with_capacity(shape[d]);
        for flat in 0..out_len {
            let mut base = 0usize;
            for (k, &i) in kept.iter().enumerate() {
                let pos = (flat / out_strides[k]) % out_shape[k];
                base += pos * strides[i];
            }
            line.clear();
            for j in 0..shape[d] {
                line.push(self.values[base + j * strides[d]]);
            }
            values.push(f(&line));
        }
        let mut out = Cube::new(out_dims, values);
        out.name = self.name.clone();
        Ok(out)
    }

    /// Select a subset of coordinate positions along one dimension.
    pub(crate) fn select_along(&self, d: usize, keep: &[usize]) -> Cube {
        let shape = self.shape();
        let strides = strides_of(&shape);
        let mut dims = self.dims.clone();
        dims[d] = Dimension::new(
            self.dims[d].name(),
            keep.iter().map(|&i| self.dims[d].coords()[i].clone()).collect(),
        );
        let out_shape: Vec<usize> = dims.iter().map(Dimension::len).collect();
        let out_strides = strides_of(&out_shape);
        let out_len = out_shape.iter().product::<usize>();
        let mut values = Vec::with_capacity(out_len);
        for flat in 0..out_len {
            let mut src = 0usize;
            for (i, dim_len) in out_shape.iter().enumerate() {
                let pos = (flat / out_strides[i]) % dim_len;
                let src_pos = if i == d { keep[pos] } else { pos };
                src += src_pos * strides[i];
            }
            values.push(self.values[src]);
        }
        Cube {
            name: self.name.clone(),
            vtype: self.vtype,
            labels: self.labels.clone(),
            dims,
            values,
        }
    }

    /// Shift values a number of steps along a dimension. Vacated cells
    /// become missing. For the spatial dimension a `coord` of `"x"` or
    /// `"y"` shifts along that axis of the grid instead of the stacked
    /// pixel order.
    pub fn shift(&self, dimension: &str, steps: i64, coord: Option<&str>) -> Result<Cube, QueryError> {
        let d = self
            .dim_index(dimension)
            .ok_or_else(|| QueryError::UnknownDimension(dimension.to_string()))?;
        if dimension == SPACE && coord.is_some() {
            return self.shift_spatial(d, steps, coord.unwrap_or_default());
        }
        let shape = self.shape();
        let strides = strides_of(&shape);
        let mut values = Vec::with_capacity(self.len());
        for flat in 0..self.len() {
            let pos = self.pos_along(flat, d, &strides, &shape) as i64;
            let src = pos - steps;
            if src < 0 || src >= shape[d] as i64 {
                values.push(f64::NAN);
            } else {
                let rebased = flat as i64 + (src - pos) * strides[d] as i64;
                values.push(self.values[rebased as usize]);
            }
        }
        Ok(self.keep_meta(values))
    }

    fn shift_spatial(&self, d: usize, steps: i64, coord: &str) -> Result<Cube, QueryError> {
        let grid = SpaceGrid::build(&self.dims[d]).ok_or_else(|| QueryError::UnknownComponent {
            dimension: SPACE.to_string(),
            component: coord.to_string(),
        })?;
        if coord != X && coord != Y {
            return Err(QueryError::UnknownComponent {
                dimension: SPACE.to_string(),
                component: coord.to_string(),
            });
        }
        let shape = self.shape();
        let strides = strides_of(&shape);
        let mut values = Vec::with_capacity(self.len());
        for flat in 0..self.len() {
            let pos = self.pos_along(flat, d, &strides, &shape);
            let (r, c) = grid.rc[pos];
            let (sr, sc) = if coord == Y {
                (r as i64 - steps, c as i64)
            } else {
                (r as i64, c as i64 - steps)
            };
            let src_pos = grid.position(sr, sc);
            match src_pos {
                Some(p) => {
                    let rebased = flat as i64 + (p as i64 - pos as i64) * strides[d] as i64;
                    values.push(self.values[rebased as usize]);
                }
                None => values.push(f64::NAN),
            }
        }
        Ok(self.keep_meta(values))
    }

    /// Smooth with a centered rolling window of half-size `size` reduced by
    /// a reducer kernel. On the spatial dimension without a `coord` the
    /// window is a square over the grid.
    pub fn smooth(
        &self,
        dimension: &str,
        size: usize,
        coord: Option<&str>,
        f: &dyn Fn(&[f64]) -> f64,
    ) -> Result<Cube, QueryError> {
        let d = self
            .dim_index(dimension)
            .ok_or_else(|| QueryError::UnknownDimension(dimension.to_string()))?;
        let k = size as i64;
        let shape = self.shape();
        let strides = strides_of(&shape);
        let mut values = Vec::with_capacity(self.len());
        let mut window = Vec::new();
        if dimension == SPACE {
            let grid = SpaceGrid::build(&self.dims[d]).ok_or_else(|| {
                QueryError::UnknownDimension("space dimension has non-spatial coordinates".to_string())
            })?;
            if let Some(c) = coord {
                if c != X && c != Y {
                    return Err(QueryError::UnknownComponent {
                        dimension: SPACE.to_string(),
                        component: c.to_string(),
                    });
                }
            }
            for flat in 0..self.len() {
                let pos = self.pos_along(flat, d, &strides, &shape);
                let (r, c) = grid.rc[pos];
                window.clear();
                match coord {
                    None => {
                        for dy in -k..=k {
                            for dx in -k..=k {
                                self.push_grid_value(
                                    &grid, flat, pos, d, &strides,
                                    r as i64 + dy, c as i64 + dx, &mut window,
                                );
                            }
                        }
                    }
                    Some(axis) => {
                        for step in -k..=k {
                            let (nr, nc) = if axis == Y {
                                (r as i64 + step, c as i64)
                            } else {
                                (r as i64, c as i64 + step)
                            };
                            self.push_grid_value(&grid, flat, pos, d, &strides, nr, nc, &mut window);
                        }
                    }
                }
                values.push(f(&window));
            }
        } else {
            for flat in 0..self.len() {
                let pos = self.pos_along(flat, d, &strides, &shape) as i64;
                window.clear();
                for step in -k..=k {
                    let src = pos + step;
                    if src < 0 || src >= shape[d] as i64 {
                        window.push(f64::NAN);
                    } else {
                        let rebased = flat as i64 + (src - pos) * strides[d] as i64;
                        window.push(self.values[rebased as usize]);
                    }
                }
                values.push(f(&window));
            }
        }
        Ok(self.untyped(values))
    }

    fn push_grid_value(
        &self,
        grid: &SpaceGrid,
        flat: usize,
        pos: usize,
        d: usize,
        strides: &[usize],
        r: i64,
        c: i64,
        window: &mut Vec<f64>,
    ) {
        match grid.position(r, c) {
            Some(p) => {
                let rebased = flat as i64 + (p as i64 - pos as i64) * strides[d] as i64;
                window.push(self.values[rebased as usize]);
            }
            None => window.push(f64::NAN),
        }
    }

    /// Drop coordinates for which every value is missing. The spatial
    /// dimension trims only at its edges so the grid stays regular.
    pub fn trim(&self, dimension: Option<&str>, force_regular: bool) -> Result<Cube, QueryError> {
        let trim_dims: Vec<usize> = match dimension {
            None => (0..self.dims.len()).collect(),
            Some(name) => vec![self
                .dim_index(name)
                .ok_or_else(|| QueryError::UnknownDimension(name.to_string()))?],
        };
        let mut out = self.clone();
        for &d0 in &trim_dims {
            // Trimming never removes a dimension, only coordinates, so
            // indices stay valid; re-resolve by name anyway.
            let name = self.dims[d0].name().to_string();
            let d = match out.dim_index(&name) {
                Some(i) => i,
                None => continue,
            };
            if name == SPACE && force_regular {
                out = out.trim_space_edges(d)?;
            } else {
                let keep = out.populated_positions(d);
                out = out.select_along(d, &keep);
            }
        }
        Ok(out)
    }

    /// Positions along dimension `d` holding at least one valid value.
    fn populated_positions(&self, d: usize) -> Vec<usize> {
        let shape = self.shape();
        let strides = strides_of(&shape);
        let mut counts = vec![0usize; shape[d]];
        for (flat, v) in self.values.iter().enumerate() {
            if v.is_finite() {
                counts[self.pos_along(flat, d, &strides, &shape)] += 1;
            }
        }
        counts
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(i, _)| i)
            .collect()
    }

    fn trim_space_edges(&self, d: usize) -> Result<Cube, QueryError> {
        let grid = match SpaceGrid::build(&self.dims[d]) {
            Some(g) => g,
            None => {
                // Non-spatial coordinates on a dimension named "space":
                // fall back to regular trimming.
                let keep = self.populated_positions(d);
                return Ok(self.select_along(d, &keep));
            }
        };
        let shape = self.shape();
        let strides = strides_of(&shape);
        let mut row_counts = vec![0usize; grid.ys.len()];
        let mut col_counts = vec![0usize; grid.xs.len()];
        for (flat, v) in self.values.iter().enumerate() {
            if v.is_finite() {
                let (r, c) = grid.rc[self.pos_along(flat, d, &strides, &shape)];
                row_counts[r] += 1;
                col_counts[c] += 1;
            }
        }
        let bounds = |counts: &[usize]| -> Option<(usize, usize)> {
            let lo = counts.iter().position(|&n| n > 0)?;
            let hi = counts.iter().rposition(|&n| n > 0)?;
            Some((lo, hi))
        };
        let (rlo, rhi) = match bounds(&row_counts) {
            Some(b) => b,
            None => return Ok(self.select_along(d, &[])),
        };
        let (clo, chi) = match bounds(&col_counts) {
            Some(b) => b,
            None => return Ok(self.select_along(d, &[])),
        };
        let keep: Vec<usize> = grid
            .rc
            .iter()
            .enumerate()
            .filter(|(_, &(r, c))| r >= rlo && r <= rhi && c >= clo && c <= chi)
            .map(|(i, _)| i)
            .collect();
        Ok(self.select_along(d, &keep))
    }

    /// Label spatio-temporally connected groups of true values in a binary
    /// cube. Adjacency is the 8-neighbourhood within a timestep plus the
    /// same cell in the previous and next timestep.
    pub fn delineate(&self) -> Result<Cube, QueryError> {
        let dim_names: Vec<&str> = self.dims.iter().map(Dimension::name).collect();
        if self.dims.is_empty() || dim_names.iter().any(|n| *n != super::TIME && *n != SPACE) {
            return Err(QueryError::MissingDimension {
                operation: "delineate".to_string(),
                dimension: format!("{}/{}", super::TIME, SPACE),
            });
        }
        if self.dims.len() > 2 {
            return Err(QueryError::TooManyDimensions {
                operation: "delineate".to_string(),
                dimensions: dim_names.iter().map(|s| s.to_string()).collect(),
            });
        }
        let shape = self.shape();
        let strides = strides_of(&shape);
        let space_d = self.dim_index(SPACE);
        let time_d = self.dim_index(super::TIME);
        let grid = match space_d {
            Some(d) => SpaceGrid::build(&self.dims[d]),
            None => None,
        };
        let neighbours = |flat: usize| -> Vec<usize> {
            let mut out = Vec::new();
            if let Some(td) = time_d {
                let pos = self.pos_along(flat, td, &strides, &shape) as i64;
                for step in [-1i64, 1] {
                    let next = pos + step;
                    if next >= 0 && next < shape[td] as i64 {
                        let rebased = flat as i64 + (next - pos) * strides[td] as i64;
                        out.push(rebased as usize);
                    }
                }
            }
            if let (Some(sd), Some(g)) = (space_d, grid.as_ref()) {
                let pos = self.pos_along(flat, sd, &strides, &shape);
                let (r, c) = g.rc[pos];
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dy == 0 && dx == 0 {
                            continue;
                        }
                        if let Some(p) = g.position(r as i64 + dy, c as i64 + dx) {
                            let rebased = flat as i64 + (p as i64 - pos as i64) * strides[sd] as i64;
                            out.push(rebased as usize);
                        }
                    }
                }
            }
            out
        };
        let mut codes = vec![0i64; self.len()];
        let mut next_code = 0i64;
        let mut stack = Vec::new();
        for start in 0..self.len() {
            if codes[start] != 0 || !truthy(self.values[start]) {
                continue;
            }
            next_code += 1;
            codes[start] = next_code;
            stack.push(start);
            while let Some(cell) = stack.pop() {
                for nb in neighbours(cell) {
                    if codes[nb] == 0 && truthy(self.values[nb]) {
                        codes[nb] = next_code;
                        stack.push(nb);
                    }
                }
            }
        }
        let values: Vec<f64> = self
            .values
            .iter()
            .enumerate()
            .map(|(i, &v)| if v.is_finite() { codes[i] as f64 } else { f64::NAN })
            .collect();
        let mut labels = BTreeMap::new();
        labels.insert(0, "background".to_string());
        for code in 1..=next_code {
            labels.insert(code, format!("object_{code}"));
        }
        Ok(Cube {
            name: self.name.clone(),
            vtype: Some(ValueType::Nominal),
            labels: Some(labels),
            dims: self.dims.clone(),
            values,
        })
    }

    /// Fill missing values along a dimension from their valid neighbours.
    pub fn fill(&self, dimension: &str, method: FillMethod) -> Result<Cube, QueryError> {
        let d = self
            .dim_index(dimension)
            .ok_or_else(|| QueryError::UnknownDimension(dimension.to_string()))?;
        let shape = self.shape();
        let strides = strides_of(&shape);
        let mut values = self.values.clone();
        let n = shape[d];
        let lines = self.len() / n.max(1);
        // Walk every 1-D line along the fill dimension.
        let kept: Vec<usize> = (0..self.dims.len()).filter(|&i| i != d).collect();
        let line_shape: Vec<usize> = kept.iter().map(|&i| shape[i]).collect();
        let line_strides = strides_of(&line_shape);
        let mut buf = Vec::with_capacity(n);
        for line in 0..lines {
            let mut base = 0usize;
            for (k, &i) in kept.iter().enumerate() {
                let pos = (line / line_strides[k]) % line_shape[k];
                base += pos * strides[i];
            }
            buf.clear();
            for j in 0..n {
                buf.push(self.values[base + j * strides[d]]);
            }
            let filled = fill_line(&buf, method);
            for (j, v) in filled.iter().enumerate() {
                values[base + j * strides[d]] = *v;
            }
        }
        Ok(self.keep_meta(values))
    }
}

/// Right-hand side of the assign verb.
pub(crate) enum AssignSource {
    Scalar(f64),
    Cube(Cube),
}

/// Lookup structure for the stacked spatial dimension.
struct SpaceGrid {
    ys: Vec<i64>,
    xs: Vec<i64>,
    pos: FxHashMap<(i64, i64), usize>,
    rc: Vec<(usize, usize)>,
}

impl SpaceGrid {
    fn build(dim: &Dimension) -> Option<Self> {
        let mut ys = Vec::new();
        let mut xs = Vec::new();
        for coord in dim.coords() {
            match coord {
                Coord::Space { y, x } => {
                    if !ys.contains(y) {
                        ys.push(*y);
                    }
                    if !xs.contains(x) {
                        xs.push(*x);
                    }
                }
                _ => return None,
            }
        }
        ys.sort_unstable_by(|a, b| b.cmp(a)); // north-up: top row first
        xs.sort_unstable();
        let mut pos = FxHashMap::default();
        let mut rc = Vec::with_capacity(dim.len());
        for (i, coord) in dim.coords().iter().enumerate() {
            if let Coord::Space { y, x } = coord {
                pos.insert((*y, *x), i);
                let r = ys.iter().position(|v| v == y).unwrap_or(0);
                let c = xs.iter().position(|v| v == x).unwrap_or(0);
                rc.push((r, c));
            }
        }
        Some(Self { ys, xs, pos, rc })
    }

    /// Position along the space dimension for grid indices, if the cell
    /// exists.
    fn position(&self, r: i64, c: i64) -> Option<usize> {
        if r < 0 || c < 0 || r as usize >= self.ys.len() || c as usize >= self.xs.len() {
            return None;
        }
        self.pos.get(&(self.ys[r as usize], self.xs[c as usize])).copied()
    }
}

fn time_component_name_check(component: &str) -> Option<()> {
    matches!(
        component,
        "year" | "month" | "day" | "hour" | "minute" | "second" | "day_of_year" | "day_of_week"
    )
    .then_some(())
}

fn time_component(t: i64, component: &str, tz_offset: i32) -> Option<f64> {
    let utc = DateTime::<Utc>::from_timestamp(t, 0)?;
    let offset = FixedOffset::east_opt(tz_offset)?;
    let local = utc.with_timezone(&offset);
    let value = match component {
        "year" => local.year() as f64,
        "month" => local.month() as f64,
        "day" => local.day() as f64,
        "hour" => local.hour() as f64,
        "minute" => local.minute() as f64,
        "second" => local.second() as f64,
        "day_of_year" => local.ordinal() as f64,
        "day_of_week" => local.weekday().num_days_from_monday() as f64,
        _ => return None,
    };
    Some(value)
}

fn fill_line(line: &[f64], method: FillMethod) -> Vec<f64> {
    let n = line.len();
    let mut forward = vec![f64::NAN; n];
    let mut fwd_dist = vec![i64::MAX; n];
    let mut last = f64::NAN;
    let mut last_at = i64::MIN / 2;
    for i in 0..n {
        if line[i].is_finite() {
            last = line[i];
            last_at = i as i64;
        }
        forward[i] = last;
        fwd_dist[i] = i as i64 - last_at;
    }
    let mut backward = vec![f64::NAN; n];
    let mut bwd_dist = vec![i64::MAX; n];
    let mut next = f64::NAN;
    let mut next_at = i64::MAX / 2;
    for i in (0..n).rev() {
        if line[i].is_finite() {
            next = line[i];
            next_at = i as i64;
        }
        backward[i] = next;
        bwd_dist[i] = next_at - i as i64;
    }
    (0..n)
        .map(|i| {
            if line[i].is_finite() {
                return line[i];
            }
            match method {
                FillMethod::Forward => forward[i],
                FillMethod::Backward => backward[i],
                FillMethod::Nearest => {
                    if forward[i].is_finite() && (fwd_dist[i] <= bwd_dist[i] || !backward[i].is_finite()) {
                        forward[i]
                    } else {
                        backward[i]
                    }
                }
            }
        })
        .collect()
}

fn group_name(key: &[f64], groupers: &[Cube], labels_as_names: bool) -> String {
    let parts: Vec<String> = key
        .iter()
        .zip(groupers)
        .map(|(&v, g)| {
            if labels_as_names {
                if let Some(labels) = g.labels() {
                    if let Some(name) = labels.get(&(v as i64)) {
                        return name.clone();
                    }
                }
            }
            format_value(v)
        })
        .collect();
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", parts.join(", "))
    }
}
