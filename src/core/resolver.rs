//! Reference resolution — the four reference kinds become cubes or
//! collections.
//!
//! Concepts go through the mapping collaborator and their rules are
//! executed recursively; raw layers go through the datacube collaborator,
//! consulting the look-ahead cache when one is active; results read from
//! the current execution's named outputs; "self" reads the active
//! evaluation object.

use super::executor::QueryProcessor;
use super::planner::{reference_digest, CacheDecision};
use super::types::{TypeInfo, TypePromoter};
use crate::cube::{Cube, EvalObject};
use crate::error::QueryError;

impl QueryProcessor<'_> {
    /// Resolve a semantic concept through the mapping rules.
    ///
    /// Each property rule is itself a small expression executed with the
    /// current active object as its local "self". A concept defined by
    /// several properties is true only where all of them hold, so the
    /// property cubes are combined with a logical "and".
    pub(crate) fn resolve_concept(
        &mut self,
        reference: &[String],
        property: Option<&str>,
    ) -> Result<EvalObject, QueryError> {
        tracing::debug!(concept = %QueryError::join_path(reference), "resolving concept");
        let ruleset = self.mapping.lookup(reference)?;
        let rules: Vec<(String, crate::core::recipe::Expr)> = match property {
            Some(name) => {
                let rule = ruleset.get(name).ok_or_else(|| {
                    QueryError::UnknownConcept(format!(
                        "property '{name}' is not defined for concept '{}'",
                        QueryError::join_path(reference)
                    ))
                })?;
                vec![(name.to_string(), rule.clone())]
            }
            None => ruleset.into_iter().collect(),
        };
        let mut cubes = Vec::with_capacity(rules.len());
        for (_, rule) in &rules {
            cubes.push(self.eval_expr(rule)?.into_cube("a concept property rule")?);
        }
        let mut iter = cubes.into_iter();
        let mut out = iter.next().ok_or_else(|| {
            QueryError::UnknownConcept(format!(
                "concept '{}' has no properties",
                QueryError::join_path(reference)
            ))
        })?;
        for next in iter {
            out = self.and_combine(out, &next)?;
        }
        if let Some(leaf) = reference.last() {
            out.set_name(Some(leaf.clone()));
        }
        Ok(out.into())
    }

    /// Conjunction of two property cubes, type-checked like any operator
    /// application.
    fn and_combine(&self, x: Cube, y: &Cube) -> Result<Cube, QueryError> {
        let operator = self.registry.operator("and")?;
        let promotion = if self.config.track_types {
            Some(TypePromoter::check(
                "and",
                &operator.manual,
                &[TypeInfo::of_cube(&x), TypeInfo::of_cube(y)],
            )?)
        } else {
            None
        };
        let out = x.zip_cube(y, |a, b| {
            if a != 0.0 && b.is_finite() && b != 0.0 {
                1.0
            } else {
                0.0
            }
        })?;
        Ok(match promotion {
            Some(p) => p.apply(out),
            None => out,
        })
    }

    /// Resolve a raw data layer, consulting the cache when one is active.
    ///
    /// The canonical reference identity is recorded by the preview pass
    /// before resolving, so the real pass knows the full resolution order
    /// in advance.
    pub(crate) fn resolve_resource(&mut self, reference: &[String]) -> Result<EvalObject, QueryError> {
        let key = reference_digest("resource", reference);
        if let Some(recorder) = &mut self.recorder {
            recorder.push(key.clone());
        }
        tracing::debug!(resource = %QueryError::join_path(reference), "resolving resource");
        let decision = self.cache.as_mut().map(|cache| cache.decide(&key));
        match decision {
            Some(CacheDecision::Hit(cube)) => Ok(cube.into()),
            Some(CacheDecision::Miss { remaining_uses }) => {
                let cube = self.datacube.retrieve(reference, &self.extent)?;
                if remaining_uses > 0 {
                    if let Some(cache) = &mut self.cache {
                        cache.store(key, cube.clone(), remaining_uses);
                    }
                }
                Ok(cube.into())
            }
            None => {
                let cube = self.datacube.retrieve(reference, &self.extent)?;
                Ok(cube.into())
            }
        }
    }

    /// Resolve a named result computed earlier in this execution. Forward
    /// references are not supported.
    pub(crate) fn resolve_result(&mut self, name: &str) -> Result<EvalObject, QueryError> {
        self.response
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::UnknownResult(name.to_string()))
    }

    /// Resolve the active evaluation object; at top level this is the
    /// query's spatio-temporal extent cube.
    pub(crate) fn resolve_self(&mut self) -> Result<EvalObject, QueryError> {
        self.eval_stack
            .last()
            .cloned()
            .ok_or_else(|| QueryError::InvalidRecipe("no active evaluation object".to_string()))
    }
}
