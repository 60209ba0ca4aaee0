//! Ordered collections of cubes and the verbs that combine them.

use std::collections::BTreeMap;

use super::array::{Coord, Cube, Dimension, ValueType};
use crate::error::QueryError;

/// An ordered sequence of cubes, semantically still to be combined.
/// Members need not share dimensions until a combining verb resolves them
/// into a single cube.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    members: Vec<Cube>,
}

impl Collection {
    pub fn new(members: Vec<Cube>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[Cube] {
        &self.members
    }

    pub fn into_members(self) -> Vec<Cube> {
        self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() || self.members.iter().all(Cube::is_empty)
    }

    /// Bitwise value identity across all members, in order.
    pub fn identical(&self, other: &Collection) -> bool {
        self.members.len() == other.members.len()
            && self
                .members
                .iter()
                .zip(&other.members)
                .all(|(a, b)| a.identical(b))
    }

    /// Apply a fallible cube transformation to every member.
    pub fn try_map(
        self,
        mut f: impl FnMut(Cube) -> Result<Cube, QueryError>,
    ) -> Result<Collection, QueryError> {
        let mut members = Vec::with_capacity(self.members.len());
        for cube in self.members {
            members.push(f(cube)?);
        }
        Ok(Collection::new(members))
    }

    /// Stack binary members into one nominal cube: member *i* claims code
    /// *i + 1* wherever it is true, earlier members take precedence, and
    /// the label dictionary is derived from member names. Dimensions are
    /// combined by outer join; unclaimed cells stay missing.
    pub fn compose(&self, track_types: bool) -> Result<Cube, QueryError> {
        if track_types {
            for member in &self.members {
                if let Some(vt) = member.vtype() {
                    if vt != ValueType::Binary {
                        return Err(QueryError::InvalidValueType {
                            operation: "compose".to_string(),
                            input_types: self.members.iter().map(Cube::vtype).collect(),
                        });
                    }
                }
            }
        }
        let dims = self.union_dims();
        let template = Cube::filled(dims, f64::NAN);
        let mut values = vec![f64::NAN; template.len()];
        let mut labels = BTreeMap::new();
        for (i, member) in self.members.iter().enumerate() {
            let code = i as i64 + 1;
            labels.insert(code, member.name_or(&format!("cube_{code}")));
            let aligned = member.align_with(&template)?;
            for (cell, &v) in aligned.values().iter().enumerate() {
                if values[cell].is_nan() && v.is_finite() && v != 0.0 {
                    values[cell] = code as f64;
                }
            }
        }
        Ok(Cube::new(template.dims().to_vec(), values)
            .with_vtype(Some(ValueType::Nominal))
            .with_labels(Some(labels)))
    }

    /// Concatenate members along a dimension. When the dimension exists in
    /// every member, all other dimensions must match exactly and the
    /// coordinates are joined (first occurrence wins, sorted afterwards).
    /// When it exists in none, members must share identical dimensions and
    /// a new outermost axis is created, labelled by member names.
    pub fn concatenate(&self, dimension: &str, track_types: bool) -> Result<Cube, QueryError> {
        let first = self.members.first().ok_or_else(|| {
            QueryError::InvalidRecipe("concatenate requires a non-empty collection".to_string())
        })?;
        let out_vtype = if track_types {
            let vtype = first.vtype();
            if self.members.iter().any(|m| m.vtype().is_some() && m.vtype() != vtype) {
                return Err(QueryError::InvalidValueType {
                    operation: "concatenate".to_string(),
                    input_types: self.members.iter().map(Cube::vtype).collect(),
                });
            }
            vtype
        } else {
            first.vtype()
        };
        let have_dim: Vec<bool> = self
            .members
            .iter()
            .map(|m| m.dim_index(dimension).is_some())
            .collect();
        let out = if have_dim.iter().all(|&b| b) {
            self.concat_existing(dimension)?
        } else if have_dim.iter().all(|&b| !b) {
            self.concat_new(dimension)?
        } else {
            return Err(QueryError::MixedDimensions(format!(
                "dimension '{dimension}' is present in some collection members but not all"
            )));
        };
        // Member label dictionaries may disagree after concatenation, so
        // they are dropped rather than guessed.
        Ok(out.with_vtype(out_vtype).with_labels(None))
    }

    fn check_aligned_dims(
        &self,
        reference: &[Dimension],
        skip: Option<&str>,
    ) -> Result<(), QueryError> {
        for member in &self.members {
            let own: Vec<&Dimension> =
                member.dims().iter().filter(|d| Some(d.name()) != skip).collect();
            let want: Vec<&Dimension> =
                reference.iter().filter(|d| Some(d.name()) != skip).collect();
            if own.len() != want.len() || own.iter().zip(&want).any(|(a, b)| a != b) {
                return Err(QueryError::MixedDimensions(
                    "collection members have differing dimensions".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn concat_existing(&self, dimension: &str) -> Result<Cube, QueryError> {
        let first = &self.members[0];
        self.check_aligned_dims(first.dims(), Some(dimension))?;
        // Combined coordinates: first occurrence wins, then sorted.
        let mut coords: Vec<Coord> = Vec::new();
        for member in &self.members {
            if let Some(d) = member.dim_index(dimension) {
                for coord in member.dims()[d].coords() {
                    if !coords.contains(coord) {
                        coords.push(coord.clone());
                    }
                }
            }
        }
        coords.sort();
        let mut dims = first.dims().to_vec();
        let d = first.dim_index(dimension).unwrap_or(0);
        dims[d] = Dimension::new(dimension, coords);
        let template = Cube::filled(dims.clone(), f64::NAN);
        let mut values = vec![f64::NAN; template.len()];
        let mut written = vec![false; template.len()];
        for member in &self.members {
            let aligned = member.align_with(&template)?;
            for (cell, &v) in aligned.values().iter().enumerate() {
                if !written[cell] && v.is_finite() {
                    values[cell] = v;
                    written[cell] = true;
                }
            }
        }
        let mut out = Cube::new(dims, values);
        out.set_name(first.name().map(String::from));
        Ok(out)
    }

    fn concat_new(&self, dimension: &str) -> Result<Cube, QueryError> {
        let first = &self.members[0];
        self.check_aligned_dims(first.dims(), None)?;
        let names: Vec<String> = self
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| m.name_or(&format!("cube_{}", i + 1)))
            .collect();
        let coords = names.into_iter().map(Coord::Str).collect();
        let mut dims = vec![Dimension::new(dimension, coords)];
        dims.extend(first.dims().iter().cloned());
        let mut values = Vec::with_capacity(first.len() * self.members.len());
        for member in &self.members {
            values.extend_from_slice(member.values());
        }
        let mut out = Cube::new(dims, values);
        out.set_name(first.name().map(String::from));
        Ok(out)
    }

    /// Outer join of all member dimensions: dimension order and coordinate
    /// order follow first appearance across the collection.
    fn union_dims(&self) -> Vec<Dimension> {
        let mut dims: Vec<Dimension> = Vec::new();
        for member in &self.members {
            for dim in member.dims() {
                match dims.iter_mut().find(|d| d.name() == dim.name()) {
                    Some(existing) => {
                        let mut coords = existing.coords().to_vec();
                        for coord in dim.coords() {
                            if !coords.contains(coord) {
                                coords.push(coord.clone());
                            }
                        }
                        *existing = Dimension::new(dim.name(), coords);
                    }
                    None => dims.push(dim.clone()),
                }
            }
        }
        dims
    }

    /// Merge members pairwise into a single cube with a binary combiner
    /// (e.g. a registered operator applied with type promotion at each
    /// step).
    pub fn merge_with(
        self,
        mut combine: impl FnMut(Cube, &Cube) -> Result<Cube, QueryError>,
    ) -> Result<Cube, QueryError> {
        let mut members = self.members.into_iter();
        let mut acc = members.next().ok_or_else(|| {
            QueryError::InvalidRecipe("merge requires a non-empty collection".to_string())
        })?;
        for member in members {
            acc = combine(acc, &member)?;
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::TIME;

    fn time_dim(n: usize) -> Dimension {
        Dimension::new(TIME, (0..n).map(|i| Coord::Time(i as i64 * 60)).collect())
    }

    fn binary(name: &str, values: Vec<f64>) -> Cube {
        Cube::new(vec![time_dim(values.len())], values)
            .with_vtype(Some(ValueType::Binary))
            .with_name(Some(name.to_string()))
    }

    #[test]
    fn test_compose_earlier_members_win() {
        let coll = Collection::new(vec![
            binary("water", vec![1.0, 0.0, 1.0]),
            binary("land", vec![1.0, 1.0, 0.0]),
        ]);
        let out = coll.compose(true).unwrap();
        assert_eq!(out.vtype(), Some(ValueType::Nominal));
        assert_eq!(out.values()[0], 1.0); // water claims first
        assert_eq!(out.values()[1], 2.0); // land fills the gap
        assert_eq!(out.values()[2], 1.0);
        let labels = out.labels().unwrap();
        assert_eq!(labels.get(&1).map(String::as_str), Some("water"));
        assert_eq!(labels.get(&2).map(String::as_str), Some("land"));
    }

    #[test]
    fn test_compose_rejects_non_binary() {
        let coll = Collection::new(vec![
            binary("a", vec![1.0]).with_vtype(Some(ValueType::Continuous)),
        ]);
        assert!(matches!(
            coll.compose(true),
            Err(QueryError::InvalidValueType { .. })
        ));
    }

    #[test]
    fn test_concatenate_new_dimension() {
        let coll = Collection::new(vec![
            binary("red", vec![1.0, 0.0]),
            binary("nir", vec![0.0, 1.0]),
        ]);
        let out = coll.concatenate("band", true).unwrap();
        assert_eq!(out.shape(), vec![2, 2]);
        assert_eq!(out.dims()[0].name(), "band");
        assert_eq!(out.dims()[0].coords()[0], Coord::Str("red".to_string()));
        assert_eq!(out.values(), &[1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_concatenate_existing_dimension_joins_coords() {
        let a = Cube::new(vec![Dimension::new(TIME, vec![Coord::Time(0)])], vec![1.0])
            .with_name(Some("a".to_string()));
        let b = Cube::new(vec![Dimension::new(TIME, vec![Coord::Time(60)])], vec![2.0]);
        let out = Collection::new(vec![a, b]).concatenate(TIME, false).unwrap();
        assert_eq!(out.shape(), vec![2]);
        assert_eq!(out.values(), &[1.0, 2.0]);
    }

    #[test]
    fn test_concatenate_mismatched_other_dims() {
        let a = binary("a", vec![1.0, 0.0]);
        let b = binary("b", vec![1.0, 0.0, 1.0]);
        let err = Collection::new(vec![a, b]).concatenate("band", false).unwrap_err();
        assert!(matches!(err, QueryError::MixedDimensions(_)));
    }

    #[test]
    fn test_concatenate_mixed_vtypes_rejected() {
        let a = binary("a", vec![1.0]);
        let b = binary("b", vec![2.0]).with_vtype(Some(ValueType::Continuous));
        let err = Collection::new(vec![a, b]).concatenate("band", true).unwrap_err();
        assert!(matches!(err, QueryError::InvalidValueType { .. }));
    }

    #[test]
    fn test_merge_pairwise() {
        let coll = Collection::new(vec![
            binary("a", vec![1.0, 0.0]),
            binary("b", vec![1.0, 1.0]),
            binary("c", vec![1.0, 1.0]),
        ]);
        let out = coll
            .merge_with(|acc, next| {
                acc.zip_cube(next, |x, y| if x != 0.0 && y != 0.0 { 1.0 } else { 0.0 })
            })
            .unwrap();
        assert_eq!(out.values(), &[1.0, 0.0]);
    }

    #[test]
    fn test_merge_empty_collection_fails() {
        let coll = Collection::new(vec![]);
        assert!(coll.merge_with(|acc, _| Ok(acc)).is_err());
    }
}
