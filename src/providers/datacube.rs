//! Datacube provider — retrieval of raw data layers for an extent.
//!
//! The resolver only depends on the [`Datacube`] trait; concrete adapters
//! for raster archives or remote catalogs live outside this crate. The
//! in-memory implementation stores dense layers on their own grid and
//! resamples to the requested extent by nearest neighbour, which is
//! enough for both the full-resolution pass and the coarse preview pass.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::cube::{Coord, Cube, Extent, ValueType};
use crate::error::QueryError;

/// Metadata of a data layer.
#[derive(Debug, Clone)]
pub struct LayerMeta {
    pub vtype: ValueType,
    pub labels: Option<BTreeMap<i64, String>>,
    pub description: Option<String>,
}

impl LayerMeta {
    pub fn continuous() -> Self {
        Self { vtype: ValueType::Continuous, labels: None, description: None }
    }

    pub fn categorical(labels: BTreeMap<i64, String>) -> Self {
        Self { vtype: ValueType::Nominal, labels: Some(labels), description: None }
    }

    pub fn binary() -> Self {
        Self { vtype: ValueType::Binary, labels: None, description: None }
    }
}

/// Retrieval interface the reference resolver consults for raw layers.
pub trait Datacube {
    /// Look up layer metadata without retrieving data.
    fn lookup(&self, reference: &[String]) -> Result<LayerMeta, QueryError>;

    /// Retrieve a layer laid out on the requested extent.
    fn retrieve(&self, reference: &[String], extent: &Extent) -> Result<Cube, QueryError>;
}

/// A dense data layer on its own grid, time-major.
#[derive(Debug, Clone)]
pub struct Layer {
    meta: LayerMeta,
    extent: Extent,
    values: Vec<f64>,
}

impl Layer {
    pub fn new(meta: LayerMeta, extent: Extent, values: Vec<f64>) -> Self {
        debug_assert_eq!(
            extent.instants().len() * extent.rows() * extent.cols(),
            values.len(),
            "layer buffer does not match its extent"
        );
        Self { meta, extent, values }
    }

    /// Nearest source time index for an instant, if any source times exist.
    fn nearest_instant(&self, t: i64) -> Option<usize> {
        self.extent
            .instants()
            .iter()
            .enumerate()
            .min_by_key(|(_, &s)| (s - t).abs())
            .map(|(i, _)| i)
    }

    /// Source cell index for a cell center, or None outside the bounding
    /// box.
    fn cell_at(&self, y: i64, x: i64) -> Option<usize> {
        let e = &self.extent;
        let dx = x - self.origin_x();
        let dy = self.origin_y() - y;
        if dx < 0 || dy < 0 {
            return None;
        }
        let col = dx / e.cell_size();
        let row = dy / e.cell_size();
        if col >= e.cols() as i64 || row >= e.rows() as i64 {
            return None;
        }
        Some(row as usize * e.cols() + col as usize)
    }

    fn origin_x(&self) -> i64 {
        // Cell centers are offset by half a cell from the grid origin.
        match self.extent.space_dim().coords().first() {
            Some(Coord::Space { x, .. }) => *x - self.extent.cell_size() / 2,
            _ => 0,
        }
    }

    fn origin_y(&self) -> i64 {
        match self.extent.space_dim().coords().first() {
            Some(Coord::Space { y, .. }) => *y + self.extent.cell_size() / 2,
            _ => 0,
        }
    }

    /// Resample the layer onto a requested extent.
    fn sample(&self, extent: &Extent) -> Vec<f64> {
        let space = extent.space_dim();
        let cells: Vec<Option<usize>> = space
            .coords()
            .iter()
            .map(|c| match c {
                Coord::Space { y, x } => self.cell_at(*y, *x),
                _ => None,
            })
            .collect();
        let per_step = self.extent.rows() * self.extent.cols();
        let mut values = Vec::with_capacity(extent.instants().len() * cells.len());
        for &t in extent.instants() {
            match self.nearest_instant(t) {
                Some(step) => {
                    let base = step * per_step;
                    for cell in &cells {
                        values.push(match cell {
                            Some(i) => self.values[base + i],
                            None => f64::NAN,
                        });
                    }
                }
                None => values.extend(std::iter::repeat(f64::NAN).take(cells.len())),
            }
        }
        values
    }
}

/// In-memory datacube keyed by layer reference path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatacube {
    layers: FxHashMap<Vec<String>, Layer>,
}

impl InMemoryDatacube {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_layer(&mut self, reference: &[&str], layer: Layer) {
        let key = reference.iter().map(|s| s.to_string()).collect();
        self.layers.insert(key, layer);
    }

    fn layer(&self, reference: &[String]) -> Result<&Layer, QueryError> {
        self.layers
            .get(reference)
            .ok_or_else(|| QueryError::UnknownResource(QueryError::join_path(reference)))
    }
}

impl Datacube for InMemoryDatacube {
    fn lookup(&self, reference: &[String]) -> Result<LayerMeta, QueryError> {
        Ok(self.layer(reference)?.meta.clone())
    }

    fn retrieve(&self, reference: &[String], extent: &Extent) -> Result<Cube, QueryError> {
        let layer = self.layer(reference)?;
        let values = layer.sample(extent);
        let dims = vec![extent.time_dim(), extent.space_dim()];
        let name = reference.last().cloned();
        let cube = Cube::new(dims, values)
            .with_vtype(Some(layer.meta.vtype))
            .with_labels(layer.meta.labels.clone())
            .with_name(name);
        if cube.is_empty() {
            return Err(QueryError::EmptyData(QueryError::join_path(reference)));
        }
        Ok(cube)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent_4x4() -> Extent {
        Extent::new(3857, 0, 40, 10, 4, 4, vec![0, 100, 200], 0)
    }

    fn colortype_layer() -> Layer {
        // 3 timesteps over a 4x4 grid; value 21 marks "water-like" cells.
        let mut values = vec![1.0; 48];
        values[16] = 21.0; // t1, cell 0
        values[33] = 21.0; // t2, cell 1
        values[34] = 21.0; // t2, cell 2
        let mut labels = BTreeMap::new();
        labels.insert(1, "land".to_string());
        labels.insert(21, "deep water".to_string());
        Layer::new(LayerMeta::categorical(labels), extent_4x4(), values)
    }

    #[test]
    fn test_retrieve_full_resolution_passthrough() {
        let mut cube_store = InMemoryDatacube::new();
        cube_store.add_layer(&["appearance", "colortype"], colortype_layer());
        let reference = vec!["appearance".to_string(), "colortype".to_string()];
        let out = cube_store.retrieve(&reference, &extent_4x4()).unwrap();
        assert_eq!(out.shape(), vec![3, 16]);
        assert_eq!(out.vtype(), Some(ValueType::Nominal));
        assert_eq!(out.name(), Some("colortype"));
        assert_eq!(out.values()[16], 21.0);
        assert_eq!(out.values()[0], 1.0);
    }

    #[test]
    fn test_retrieve_coarsened_extent() {
        let mut cube_store = InMemoryDatacube::new();
        cube_store.add_layer(&["appearance", "colortype"], colortype_layer());
        let reference = vec!["appearance".to_string(), "colortype".to_string()];
        let coarse = extent_4x4().coarsen(2);
        let out = cube_store.retrieve(&reference, &coarse).unwrap();
        assert_eq!(out.shape(), vec![3, 4]);
        // Every coarse cell center still falls inside the layer bbox.
        assert!(out.values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_unknown_resource() {
        let cube_store = InMemoryDatacube::new();
        let reference = vec!["appearance".to_string(), "ghost".to_string()];
        let err = cube_store.retrieve(&reference, &extent_4x4()).unwrap_err();
        assert_eq!(
            err,
            QueryError::UnknownResource("appearance.ghost".to_string())
        );
    }

    #[test]
    fn test_disjoint_extent_is_empty_data() {
        let mut cube_store = InMemoryDatacube::new();
        cube_store.add_layer(&["appearance", "colortype"], colortype_layer());
        let reference = vec!["appearance".to_string(), "colortype".to_string()];
        let far_away = Extent::new(3857, 100_000, 100_000, 10, 4, 4, vec![0], 0);
        let err = cube_store.retrieve(&reference, &far_away).unwrap_err();
        assert!(matches!(err, QueryError::EmptyData(_)));
    }
}
