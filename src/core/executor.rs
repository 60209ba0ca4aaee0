//! Query processor — the recipe interpreter.
//!
//! Walks the recipe's result definitions in declaration order, folds each
//! processing chain over the active-evaluation-object stack, type-checks
//! every verb application before its kernel runs, and records named
//! results for later `result` references. With caching enabled it first
//! runs the preview pass to prime the look-ahead cache (§ planner), then
//! executes the real pass against it.

use indexmap::IndexMap;

use super::planner::{Cache, ReferenceSequence};
use super::recipe::{Expr, Param, Recipe, VerbNode};
use super::registry::{Operator, OperatorKernel, Registry};
use super::response::{self, Response};
use super::types::{self, TypeInfo, TypePromoter};
use crate::cube::{Collection, Cube, EvalObject, Extent, ValueType};
use crate::error::QueryError;
use crate::providers::{Datacube, Mapping};

/// Failure handling for a recipe execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the whole execution on the first failing result.
    #[default]
    StopOnFirst,
    /// Keep completed results, record the failure, continue with the
    /// remaining result chains.
    ContinueIndependent,
}

/// Execution configuration.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Coordinate reference system override. Reprojection machinery lives
    /// outside this crate; the value is recorded for data-source adapters.
    pub crs: Option<u32>,
    /// Output timezone, seconds east of UTC.
    pub tz_offset: Option<i32>,
    /// Spatial resolution override in CRS units.
    pub spatial_resolution: Option<i64>,
    /// Run the two-pass preview + cached execution.
    pub caching: bool,
    /// Track and promote value types per verb application.
    pub track_types: bool,
    pub failure: FailurePolicy,
    /// Trim result cubes to their minimal bounding extent.
    pub trim_results: bool,
    /// Explode collection results into individually named entries.
    pub unstack_collections: bool,
    /// Side length of the preview grid.
    pub preview_grid: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            crs: None,
            tz_offset: None,
            spatial_resolution: None,
            caching: false,
            track_types: true,
            failure: FailurePolicy::default(),
            trim_results: true,
            unstack_collections: false,
            preview_grid: 5,
        }
    }
}

/// A resolved verb operand: a constant, a list of constants, or a cube.
pub(crate) struct Operand {
    pub values: OperandValues,
    pub info: TypeInfo,
}

pub(crate) enum OperandValues {
    Scalar(f64),
    List(Vec<f64>),
    Cube(Cube),
}

/// The recipe interpreter.
pub struct QueryProcessor<'a> {
    pub(crate) recipe: &'a Recipe,
    pub(crate) mapping: &'a dyn Mapping,
    pub(crate) datacube: &'a dyn Datacube,
    pub(crate) extent: Extent,
    pub(crate) config: ExecConfig,
    pub(crate) registry: Registry,
    pub(crate) eval_stack: Vec<EvalObject>,
    pub(crate) response: IndexMap<String, EvalObject>,
    pub(crate) failures: Vec<(String, QueryError)>,
    pub(crate) cache: Option<Cache>,
    pub(crate) recorder: Option<ReferenceSequence>,
}

impl<'a> QueryProcessor<'a> {
    pub fn new(
        recipe: &'a Recipe,
        mapping: &'a dyn Mapping,
        datacube: &'a dyn Datacube,
        extent: Extent,
        config: ExecConfig,
    ) -> Self {
        let mut extent = extent;
        if let Some(res) = config.spatial_resolution {
            extent = extent.with_resolution(res);
        }
        if let Some(tz) = config.tz_offset {
            extent = extent.with_tz_offset(tz);
        }
        let eval_stack = vec![EvalObject::Cube(extent.cube())];
        Self {
            recipe,
            mapping,
            datacube,
            extent,
            config,
            registry: Registry::with_builtins(),
            eval_stack,
            response: IndexMap::new(),
            failures: Vec::new(),
            cache: None,
            recorder: None,
        }
    }

    /// Registry of operators, reducers and custom verbs for this instance.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Execute the recipe. With `caching` enabled this performs the
    /// preview pass first and hands the primed cache to the real pass.
    pub fn execute(mut self) -> Result<Response, QueryError> {
        if self.config.caching {
            let sequence = self.build_cache()?;
            tracing::debug!(references = sequence.len(), "preview pass recorded reference sequence");
            self.cache = Some(Cache::from_sequence(sequence));
        }
        self.run()
    }

    /// Execute the recipe against an explicitly provided cache.
    pub fn execute_with_cache(mut self, cache: Cache) -> Result<Response, QueryError> {
        self.cache = Some(cache);
        self.run()
    }

    /// Run the interpreter over a coarsened extent purely to observe the
    /// order of layer resolutions. Results are discarded.
    pub fn build_cache(&self) -> Result<ReferenceSequence, QueryError> {
        let preview_extent = self.extent.coarsen(self.config.preview_grid);
        let mut preview_config = self.config.clone();
        preview_config.caching = false;
        preview_config.trim_results = false;
        preview_config.unstack_collections = false;
        let mut preview = QueryProcessor {
            recipe: self.recipe,
            mapping: self.mapping,
            datacube: self.datacube,
            extent: preview_extent.clone(),
            config: preview_config,
            registry: self.registry.clone(),
            eval_stack: vec![EvalObject::Cube(preview_extent.cube())],
            response: IndexMap::new(),
            failures: Vec::new(),
            cache: None,
            recorder: Some(ReferenceSequence::new()),
        };
        preview.run()?;
        Ok(preview.recorder.take().unwrap_or_default())
    }

    fn run(&mut self) -> Result<Response, QueryError> {
        let recipe = self.recipe;
        for (name, expr) in &recipe.results {
            tracing::debug!(result = name.as_str(), "computing result");
            match self.eval_expr(expr) {
                Ok(mut obj) => {
                    obj.set_name(name);
                    self.response.insert(name.clone(), obj);
                }
                Err(e) => match self.config.failure {
                    FailurePolicy::StopOnFirst => return Err(e),
                    FailurePolicy::ContinueIndependent => {
                        tracing::warn!(result = name.as_str(), error = %e, "result failed, continuing");
                        self.failures.push((name.clone(), e));
                        // Sibling chains start from a fresh resolution path.
                        self.eval_stack.clear();
                        self.eval_stack.push(EvalObject::Cube(self.extent.cube()));
                    }
                },
            }
        }
        let results = std::mem::take(&mut self.response);
        let failures = std::mem::take(&mut self.failures);
        Ok(response::assemble(results, failures, &self.config))
    }

    /// Evaluate one expression node.
    pub(crate) fn eval_expr(&mut self, expr: &Expr) -> Result<EvalObject, QueryError> {
        match expr {
            Expr::Concept { reference, property } => {
                self.resolve_concept(reference, property.as_deref())
            }
            Expr::Resource { reference } => self.resolve_resource(reference),
            Expr::Result { name } => self.resolve_result(name),
            Expr::SelfRef => self.resolve_self(),
            Expr::Collection { elements } => {
                let mut members = Vec::with_capacity(elements.len());
                for element in elements {
                    members.push(self.eval_expr(element)?.into_cube("a collection element")?);
                }
                Ok(Collection::new(members).into())
            }
            Expr::ProcessingChain { with, steps } => {
                let base = self.eval_expr(with)?;
                self.eval_stack.push(base.clone());
                let mut out = Ok(base);
                for step in steps {
                    match self.apply_verb(step) {
                        Ok(obj) => {
                            if let Some(top) = self.eval_stack.last_mut() {
                                *top = obj.clone();
                            }
                            out = Ok(obj);
                        }
                        Err(e) => {
                            out = Err(e);
                            break;
                        }
                    }
                }
                self.eval_stack.pop();
                out
            }
        }
    }

    /// Apply one verb to the active evaluation object.
    pub(crate) fn apply_verb(&mut self, verb: &VerbNode) -> Result<EvalObject, QueryError> {
        let active = self.eval_stack.last().cloned().ok_or_else(|| {
            QueryError::InvalidRecipe("verb applied outside of a processing chain".to_string())
        })?;
        tracing::debug!(verb = verb.name(), "applying verb");
        let track = self.config.track_types;
        let tz = self.extent.tz_offset();
        let out = match verb {
            VerbNode::Evaluate { operator, y } => self.verb_evaluate(active, operator, y.as_ref())?,
            VerbNode::Extract { dimension, component } => {
                map_cubewise(active, |c| c.extract(dimension, component.as_deref(), tz))?
            }
            VerbNode::Filter { filterer } => {
                let predicate = self.eval_expr(filterer)?.into_cube("the filter predicate")?;
                map_cubewise(active, |c| c.filter(&predicate, track))?
            }
            VerbNode::Assign { y, at } => self.verb_assign(active, y, at.as_deref())?,
            VerbNode::Groupby { grouper } => self.verb_groupby(active, grouper)?,
            VerbNode::Reduce { reducer, dimension } => {
                self.verb_reduce(active, reducer, dimension.as_deref())?
            }
            VerbNode::Shift { dimension, steps, coord } => {
                map_cubewise(active, |c| c.shift(dimension, *steps, coord.as_deref()))?
            }
            VerbNode::Smooth { reducer, dimension, size, coord } => {
                self.verb_smooth(active, reducer, dimension, *size, coord.as_deref())?
            }
            VerbNode::Trim { dimension } => {
                map_cubewise(active, |c| c.trim(dimension.as_deref(), true))?
            }
            VerbNode::Delineate => map_cubewise(active, |c| c.delineate())?,
            VerbNode::Fill { dimension, method } => {
                map_cubewise(active, |c| c.fill(dimension, *method))?
            }
            VerbNode::Name { value } => map_cubewise(active, |c| Ok(c.with_name(Some(value.clone()))))?,
            VerbNode::Label { label } => map_cubewise(active, |c| Ok(c.with_name(Some(label.clone()))))?,
            VerbNode::Compose => collection_only(active, "compose")?.compose(track)?.into(),
            VerbNode::Concatenate { dimension } => {
                collection_only(active, "concatenate")?.concatenate(dimension, track)?.into()
            }
            VerbNode::Merge { operator } => self.verb_merge(active, operator)?,
            VerbNode::Custom { name, params } => {
                let custom = self.registry.verb(name)?.clone();
                custom(active, params)?
            }
        };
        if out.is_empty() {
            tracing::warn!(verb = verb.name(), "verb returned an empty result");
        }
        Ok(out)
    }

    fn verb_evaluate(
        &mut self,
        active: EvalObject,
        name: &str,
        y: Option<&Param>,
    ) -> Result<EvalObject, QueryError> {
        let operator = self.registry.operator(name)?.clone();
        let operand = match y {
            Some(param) => Some(self.resolve_operand(param, &active)?),
            None => None,
        };
        match active {
            EvalObject::Cube(x) => {
                Ok(self.evaluate_cube(&x, name, &operator, operand.as_ref())?.into())
            }
            EvalObject::Collection(c) => Ok(c
                .try_map(|x| self.evaluate_cube(&x, name, &operator, operand.as_ref()))?
                .into()),
        }
    }

    fn evaluate_cube(
        &self,
        x: &Cube,
        name: &str,
        operator: &Operator,
        operand: Option<&Operand>,
    ) -> Result<Cube, QueryError> {
        let promotion = if self.config.track_types {
            let mut inputs = vec![TypeInfo::of_cube(x)];
            if let Some(o) = operand {
                inputs.push(o.info.clone());
            }
            Some(TypePromoter::check(name, &operator.manual, &inputs)?)
        } else {
            None
        };
        let out = match (&operator.kernel, operand) {
            (OperatorKernel::Unary(f), None) => x.map_unary(|v| f(v)),
            (OperatorKernel::Unary(_), Some(_)) => {
                return Err(QueryError::InvalidRecipe(format!(
                    "operator '{name}' is univariate and takes no operand 'y'"
                )))
            }
            (OperatorKernel::Binary(f), Some(o)) => match &o.values {
                OperandValues::Scalar(s) => x.zip_scalar(*s, |a, b| f(a, b)),
                OperandValues::Cube(c) => x.zip_cube(c, |a, b| f(a, b))?,
                OperandValues::List(_) => {
                    return Err(QueryError::InvalidRecipe(format!(
                        "operator '{name}' expects a single operand, not a list"
                    )))
                }
            },
            (OperatorKernel::Binary(_), None) => {
                return Err(QueryError::InvalidRecipe(format!(
                    "operator '{name}' requires an operand 'y'"
                )))
            }
            (OperatorKernel::Membership(f), Some(o)) => match &o.values {
                OperandValues::List(l) => x.zip_list(l, |a, ys| f(a, ys)),
                OperandValues::Scalar(s) => x.zip_list(std::slice::from_ref(s), |a, ys| f(a, ys)),
                OperandValues::Cube(_) => {
                    return Err(QueryError::InvalidRecipe(format!(
                        "operator '{name}' expects a list of constants"
                    )))
                }
            },
            (OperatorKernel::Membership(_), None) => {
                return Err(QueryError::InvalidRecipe(format!(
                    "operator '{name}' requires an operand 'y'"
                )))
            }
        };
        Ok(match promotion {
            Some(p) => p.apply(out),
            None => out,
        })
    }

    fn verb_assign(
        &mut self,
        active: EvalObject,
        y: &Param,
        at: Option<&Expr>,
    ) -> Result<EvalObject, QueryError> {
        let operand = self.resolve_operand(y, &active)?;
        let mask = match at {
            Some(expr) => Some(self.eval_expr(expr)?.into_cube("the assign mask")?),
            None => None,
        };
        let track = self.config.track_types;
        let manual = types::assign_manual();
        let assign_one = |x: Cube| -> Result<Cube, QueryError> {
            let promotion = if track {
                Some(TypePromoter::check(
                    "assign",
                    &manual,
                    &[TypeInfo::of_cube(&x), operand.info.clone()],
                )?)
            } else {
                None
            };
            let source = match &operand.values {
                OperandValues::Scalar(s) => crate::cube::array::AssignSource::Scalar(*s),
                OperandValues::Cube(c) => crate::cube::array::AssignSource::Cube(c.clone()),
                OperandValues::List(_) => {
                    return Err(QueryError::InvalidRecipe(
                        "assign expects a constant or a cube, not a list".to_string(),
                    ))
                }
            };
            let out = x.assign_values(&source, mask.as_ref(), track)?;
            Ok(match &promotion {
                Some(p) => p.apply(out),
                None => out,
            })
        };
        match active {
            EvalObject::Cube(x) => Ok(assign_one(x)?.into()),
            EvalObject::Collection(c) => Ok(c.try_map(assign_one)?.into()),
        }
    }

    fn verb_groupby(&mut self, active: EvalObject, grouper: &Expr) -> Result<EvalObject, QueryError> {
        let groupers = match self.eval_expr(grouper)? {
            EvalObject::Cube(c) => vec![c],
            EvalObject::Collection(c) => {
                let members = c.into_members();
                let dims: Vec<&str> = members
                    .iter()
                    .filter_map(|m| m.dims().first().map(|d| d.name()))
                    .collect();
                if members.len() > 1 && dims.windows(2).any(|w| w[0] != w[1]) {
                    return Err(QueryError::MixedDimensions(
                        "dimensions of grouper arrays do not match".to_string(),
                    ));
                }
                members
            }
        };
        let x = active.into_cube("groupby")?;
        Ok(x.groupby(&groupers, true)?.into())
    }

    fn verb_reduce(
        &mut self,
        active: EvalObject,
        name: &str,
        dimension: Option<&str>,
    ) -> Result<EvalObject, QueryError> {
        let reducer = self.registry.reducer(name)?.clone();
        let track = self.config.track_types;
        let reduce_one = |x: Cube| -> Result<Cube, QueryError> {
            let promotion = if track {
                Some(TypePromoter::check(name, &reducer.manual, &[TypeInfo::of_cube(&x)])?)
            } else {
                None
            };
            let out = x.reduce_with(dimension, reducer.kernel.as_ref())?;
            Ok(match &promotion {
                Some(p) => p.apply(out),
                None => out,
            })
        };
        match active {
            EvalObject::Cube(x) => Ok(reduce_one(x)?.into()),
            EvalObject::Collection(c) => Ok(c.try_map(reduce_one)?.into()),
        }
    }

    fn verb_smooth(
        &mut self,
        active: EvalObject,
        name: &str,
        dimension: &str,
        size: usize,
        coord: Option<&str>,
    ) -> Result<EvalObject, QueryError> {
        let reducer = self.registry.reducer(name)?.clone();
        let track = self.config.track_types;
        let smooth_one = |x: Cube| -> Result<Cube, QueryError> {
            let promotion = if track {
                Some(TypePromoter::check(name, &reducer.manual, &[TypeInfo::of_cube(&x)])?)
            } else {
                None
            };
            let out = x.smooth(dimension, size, coord, reducer.kernel.as_ref())?;
            Ok(match &promotion {
                Some(p) => p.apply(out),
                None => out,
            })
        };
        match active {
            EvalObject::Cube(x) => Ok(smooth_one(x)?.into()),
            EvalObject::Collection(c) => Ok(c.try_map(smooth_one)?.into()),
        }
    }

    fn verb_merge(&mut self, active: EvalObject, name: &str) -> Result<EvalObject, QueryError> {
        let collection = collection_only(active, "merge")?;
        let operator = self.registry.operator(name)?.clone();
        let track = self.config.track_types;
        let merged = collection.merge_with(|acc, next| {
            let promotion = if track {
                Some(TypePromoter::check(
                    name,
                    &operator.manual,
                    &[TypeInfo::of_cube(&acc), TypeInfo::of_cube(next)],
                )?)
            } else {
                None
            };
            let out = match &operator.kernel {
                OperatorKernel::Binary(f) => acc.zip_cube(next, |a, b| f(a, b))?,
                _ => {
                    return Err(QueryError::InvalidRecipe(format!(
                        "merge requires a binary operator, '{name}' is not one"
                    )))
                }
            };
            Ok(match &promotion {
                Some(p) => p.apply(out),
                None => out,
            })
        })?;
        Ok(merged.into())
    }

    /// Resolve a verb parameter into a constant, list or cube operand,
    /// with the current active object as the local "self".
    pub(crate) fn resolve_operand(
        &mut self,
        param: &Param,
        active: &EvalObject,
    ) -> Result<Operand, QueryError> {
        match param {
            Param::Number(n) => Ok(Operand {
                values: OperandValues::Scalar(*n),
                info: TypeInfo::plain(number_vtype(*n)),
            }),
            Param::Bool(b) => Ok(Operand {
                values: OperandValues::Scalar(if *b { 1.0 } else { 0.0 }),
                info: TypeInfo::plain(ValueType::Binary),
            }),
            Param::Text(label) => {
                let (vtype, code) = lookup_label(active, label)?;
                Ok(Operand {
                    values: OperandValues::Scalar(code),
                    info: TypeInfo { vtype, labels: active_labels(active) },
                })
            }
            Param::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut info = TypeInfo::untyped();
                for item in items {
                    let resolved = self.resolve_operand(item, active)?;
                    match resolved.values {
                        OperandValues::Scalar(v) => values.push(v),
                        _ => {
                            return Err(QueryError::InvalidRecipe(
                                "list operands may only contain constants".to_string(),
                            ))
                        }
                    }
                    info = resolved.info;
                }
                // A list of mixed-integrality numbers compares as continuous.
                if info.vtype == Some(ValueType::Discrete)
                    && values.iter().any(|v| v.fract() != 0.0)
                {
                    info.vtype = Some(ValueType::Continuous);
                }
                Ok(Operand { values: OperandValues::List(values), info })
            }
            Param::Expr(expr) => {
                let cube = self.eval_expr(expr)?.into_cube("an operand expression")?;
                let info = TypeInfo::of_cube(&cube);
                Ok(Operand { values: OperandValues::Cube(cube), info })
            }
        }
    }
}

fn number_vtype(n: f64) -> ValueType {
    if n.fract() == 0.0 {
        ValueType::Discrete
    } else {
        ValueType::Continuous
    }
}

fn active_cube(active: &EvalObject) -> Option<&Cube> {
    match active {
        EvalObject::Cube(c) => Some(c),
        EvalObject::Collection(c) => c.members().first(),
    }
}

fn active_labels(active: &EvalObject) -> Option<std::collections::BTreeMap<i64, String>> {
    active_cube(active).and_then(|c| c.labels().cloned())
}

/// Resolve a textual constant against the active object's label
/// dictionary, yielding the numeric code it stands for.
fn lookup_label(active: &EvalObject, label: &str) -> Result<(Option<ValueType>, f64), QueryError> {
    let cube = active_cube(active).ok_or_else(|| {
        QueryError::InvalidRecipe(format!("label '{label}' used without an active cube"))
    })?;
    let labels = cube.labels().ok_or_else(|| {
        QueryError::InvalidRecipe(format!(
            "label '{label}' used on an object without a label dictionary"
        ))
    })?;
    for (code, name) in labels {
        if name == label {
            return Ok((cube.vtype(), *code as f64));
        }
    }
    Err(QueryError::InvalidRecipe(format!(
        "label '{label}' is not defined for the active object"
    )))
}

fn map_cubewise(
    active: EvalObject,
    f: impl Fn(Cube) -> Result<Cube, QueryError>,
) -> Result<EvalObject, QueryError> {
    match active {
        EvalObject::Cube(c) => Ok(f(c)?.into()),
        EvalObject::Collection(c) => Ok(c.try_map(f)?.into()),
    }
}

fn collection_only(active: EvalObject, verb: &str) -> Result<Collection, QueryError> {
    match active {
        EvalObject::Collection(c) => Ok(c),
        EvalObject::Cube(_) => Err(QueryError::InvalidRecipe(format!(
            "verb '{verb}' requires a collection"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::providers::{InMemoryDatacube, Layer, LayerMeta, RuleMapping};

    /// 4x4 grid of 10-unit cells, three daily timesteps.
    fn extent() -> Extent {
        Extent::new(3857, 0, 40, 10, 4, 4, vec![0, 86_400, 172_800], 0)
    }

    fn colortype_labels() -> BTreeMap<i64, String> {
        let mut labels = BTreeMap::new();
        labels.insert(1, "land".to_string());
        labels.insert(4, "vegetation".to_string());
        labels.insert(21, "deep water".to_string());
        labels.insert(22, "shallow water".to_string());
        labels.insert(23, "turbid water".to_string());
        labels
    }

    /// Colortype layer with water at 0, 1 and 2 pixels across the three
    /// timesteps.
    fn colortype_layer() -> Layer {
        let mut values = vec![1.0; 48];
        values[16] = 21.0; // t1, pixel 0
        values[33] = 22.0; // t2, pixel 1
        values[34] = 23.0; // t2, pixel 2
        values[5] = 4.0; // some vegetation at t0
        Layer::new(LayerMeta::categorical(colortype_labels()), extent(), values)
    }

    fn ndvi_layer() -> Layer {
        let values: Vec<f64> = (0..48).map(|i| (i % 16) as f64 / 16.0).collect();
        Layer::new(LayerMeta::continuous(), extent(), values)
    }

    fn datacube() -> InMemoryDatacube {
        let mut store = InMemoryDatacube::new();
        store.add_layer(&["appearance", "colortype"], colortype_layer());
        store.add_layer(&["reflectance", "ndvi"], ndvi_layer());
        store
    }

    fn mapping() -> RuleMapping {
        RuleMapping::parse(
            r#"{
            "entity": {
                "water": {
                    "color": {
                        "type": "processing_chain",
                        "with": {"type": "resource", "reference": ["appearance", "colortype"]},
                        "do": [{"verb": "evaluate", "operator": "in", "y": [21, 22, 23]}]
                    }
                },
                "lake": {
                    "color": {
                        "type": "processing_chain",
                        "with": {"type": "resource", "reference": ["appearance", "colortype"]},
                        "do": [{"verb": "evaluate", "operator": "equal", "y": 21}]
                    }
                },
                "vegetation": {
                    "color": {
                        "type": "processing_chain",
                        "with": {"type": "resource", "reference": ["appearance", "colortype"]},
                        "do": [{"verb": "evaluate", "operator": "equal", "y": 4}]
                    },
                    "greenness": {
                        "type": "processing_chain",
                        "with": {"type": "resource", "reference": ["reflectance", "ndvi"]},
                        "do": [{"verb": "evaluate", "operator": "greater", "y": 0.3}]
                    }
                }
            }
        }"#,
        )
        .unwrap()
    }

    /// Datacube wrapper recording every retrieval with its grid width, so
    /// tests can tell preview retrievals (coarse) from real ones.
    struct CountingDatacube {
        inner: InMemoryDatacube,
        log: RefCell<Vec<(String, usize)>>,
    }

    impl CountingDatacube {
        fn new() -> Self {
            Self { inner: datacube(), log: RefCell::new(Vec::new()) }
        }

        fn real_retrievals(&self, reference: &str) -> usize {
            self.log
                .borrow()
                .iter()
                .filter(|(r, cols)| r == reference && *cols == extent().cols())
                .count()
        }

        fn preview_retrievals(&self) -> usize {
            self.log
                .borrow()
                .iter()
                .filter(|(_, cols)| *cols != extent().cols())
                .count()
        }
    }

    impl crate::providers::Datacube for CountingDatacube {
        fn lookup(&self, reference: &[String]) -> Result<LayerMeta, QueryError> {
            self.inner.lookup(reference)
        }

        fn retrieve(&self, reference: &[String], extent: &Extent) -> Result<Cube, QueryError> {
            self.log
                .borrow_mut()
                .push((QueryError::join_path(reference), extent.cols()));
            self.inner.retrieve(reference, extent)
        }
    }

    fn run_recipe(json: &str, config: ExecConfig) -> Result<Response, QueryError> {
        let recipe = Recipe::parse(json).unwrap();
        let mapping = mapping();
        let store = datacube();
        QueryProcessor::new(&recipe, &mapping, &store, extent(), config).execute()
    }

    const WATER_COUNT: &str = r#"{
        "water_count": {
            "type": "processing_chain",
            "with": {"type": "concept", "reference": ["entity", "water"]},
            "do": [{"verb": "reduce", "reducer": "count", "dimension": "time"}]
        }
    }"#;

    #[test]
    fn test_water_count_scenario() {
        let response = run_recipe(WATER_COUNT, ExecConfig::default()).unwrap();
        match response.get("water_count") {
            Some(EvalObject::Cube(c)) => {
                assert_eq!(c.vtype(), Some(ValueType::Discrete));
                assert_eq!(c.dims().len(), 1);
                assert_eq!(c.dims()[0].name(), crate::cube::SPACE);
                let total: f64 = c.values().iter().filter(|v| v.is_finite()).sum();
                assert_eq!(total, 3.0);
                assert_eq!(c.values()[0], 1.0); // water at t1 only
                assert_eq!(c.values()[1], 1.0); // water at t2 only
                assert_eq!(c.values()[3], 0.0); // never water
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_multi_property_concept_is_conjunction() {
        let json = r#"{
            "veg": {"type": "concept", "reference": ["entity", "vegetation"]}
        }"#;
        let response = run_recipe(json, ExecConfig::default()).unwrap();
        match response.get("veg") {
            Some(EvalObject::Cube(c)) => {
                assert_eq!(c.vtype(), Some(ValueType::Binary));
                // Pixel 5 at t0 has color 4 and ndvi 5/16 > 0.3.
                assert_eq!(c.values()[5], 1.0);
                // Pixel 4 at t0 has ndvi 0.25 < 0.3 and land color.
                assert_eq!(c.values()[4], 0.0);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_concept_and_property() {
        let json = r#"{"x": {"type": "concept", "reference": ["entity", "lava"]}}"#;
        let err = run_recipe(json, ExecConfig::default()).unwrap_err();
        assert_eq!(err, QueryError::UnknownConcept("entity.lava".to_string()));

        let json = r#"{"x": {"type": "concept", "reference": ["entity", "water"], "property": "depth"}}"#;
        let err = run_recipe(json, ExecConfig::default()).unwrap_err();
        assert!(matches!(err, QueryError::UnknownConcept(m) if m.contains("depth")));
    }

    #[test]
    fn test_result_reference_and_forward_reference() {
        let json = r#"{
            "water": {"type": "concept", "reference": ["entity", "water"]},
            "again": {
                "type": "processing_chain",
                "with": {"type": "result", "name": "water"},
                "do": [{"verb": "reduce", "reducer": "any", "dimension": "time"}]
            }
        }"#;
        let response = run_recipe(json, ExecConfig::default()).unwrap();
        assert!(response.get("again").is_some());

        let forward = r#"{"x": {"type": "result", "name": "later"}}"#;
        let err = run_recipe(forward, ExecConfig::default()).unwrap_err();
        assert_eq!(err, QueryError::UnknownResult("later".to_string()));
    }

    #[test]
    fn test_self_defaults_to_extent_cube() {
        let json = r#"{
            "everywhere": {
                "type": "processing_chain",
                "with": {"type": "self"},
                "do": [{"verb": "reduce", "reducer": "count", "dimension": "time"}]
            }
        }"#;
        let response = run_recipe(json, ExecConfig::default()).unwrap();
        match response.get("everywhere") {
            Some(EvalObject::Cube(c)) => {
                assert!(c.values().iter().all(|&v| v == 3.0));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_alignment_error_before_reduction() {
        // Second collection member has no spatial dimension, so the
        // spatial water predicate cannot be aligned to it.
        let json = r#"{
            "bad": {
                "type": "processing_chain",
                "with": {"type": "collection", "elements": [
                    {"type": "resource", "reference": ["appearance", "colortype"]},
                    {
                        "type": "processing_chain",
                        "with": {"type": "resource", "reference": ["appearance", "colortype"]},
                        "do": [{"verb": "reduce", "reducer": "first", "dimension": "space"}]
                    }
                ]},
                "do": [
                    {"verb": "filter", "filterer": {"type": "concept", "reference": ["entity", "water"]}},
                    {"verb": "reduce", "reducer": "median", "dimension": "time"}
                ]
            }
        }"#;
        let err = run_recipe(json, ExecConfig::default()).unwrap_err();
        assert!(matches!(err, QueryError::Alignment { .. }));
    }

    #[test]
    fn test_type_violation_aborts_execution() {
        // Counting a nominal layer is not admissible.
        let json = r#"{
            "bad": {
                "type": "processing_chain",
                "with": {"type": "resource", "reference": ["appearance", "colortype"]},
                "do": [{"verb": "reduce", "reducer": "count", "dimension": "time"}]
            }
        }"#;
        let err = run_recipe(json, ExecConfig::default()).unwrap_err();
        match err {
            QueryError::InvalidValueType { operation, input_types } => {
                assert_eq!(operation, "count");
                assert_eq!(input_types, vec![Some(ValueType::Nominal)]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // With type tracking off the same recipe runs through.
        let config = ExecConfig { track_types: false, ..ExecConfig::default() };
        assert!(run_recipe(json, config).is_ok());
    }

    #[test]
    fn test_continue_independent_keeps_completed_results() {
        let json = r#"{
            "water": {"type": "concept", "reference": ["entity", "water"]},
            "broken": {"type": "concept", "reference": ["entity", "lava"]},
            "veg": {"type": "concept", "reference": ["entity", "vegetation"]}
        }"#;
        let config =
            ExecConfig { failure: FailurePolicy::ContinueIndependent, ..ExecConfig::default() };
        let response = run_recipe(json, config).unwrap();
        assert!(response.get("water").is_some());
        assert!(response.get("veg").is_some());
        assert!(response.get("broken").is_none());
        assert_eq!(response.failures.len(), 1);
        assert_eq!(response.failures[0].0, "broken");
    }

    #[test]
    fn test_label_verb_is_alias_of_name() {
        let json = r#"{
            "named": {
                "type": "processing_chain",
                "with": {"type": "concept", "reference": ["entity", "water"]},
                "do": [{"verb": "label", "label": "aqua"}]
            }
        }"#;
        let response = run_recipe(json, ExecConfig::default()).unwrap();
        match response.get("named") {
            // The result name wins at storage time, like any other result.
            Some(EvalObject::Cube(c)) => assert_eq!(c.name(), Some("named")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_groupby_and_unstacked_response() {
        let json = r#"{
            "seasonal": {
                "type": "processing_chain",
                "with": {"type": "concept", "reference": ["entity", "water"]},
                "do": [
                    {"verb": "groupby", "grouper": {
                        "type": "processing_chain",
                        "with": {"type": "self"},
                        "do": [{"verb": "extract", "dimension": "time", "component": "day"}]
                    }},
                    {"verb": "reduce", "reducer": "count", "dimension": "time"}
                ]
            }
        }"#;
        let config = ExecConfig { unstack_collections: true, ..ExecConfig::default() };
        let response = run_recipe(json, config).unwrap();
        // Three daily groups, one per timestep.
        assert_eq!(response.results.len(), 3);
        assert!(response.get("seasonal:1").is_some());
    }

    #[test]
    fn test_custom_verb_registration() {
        let recipe = Recipe::parse(
            r#"{
            "shouted": {
                "type": "processing_chain",
                "with": {"type": "concept", "reference": ["entity", "water"]},
                "do": [{"verb": "custom", "name": "scale", "params": {"factor": 10}}]
            }
        }"#,
        )
        .unwrap();
        let mapping = mapping();
        let store = datacube();
        let mut processor =
            QueryProcessor::new(&recipe, &mapping, &store, extent(), ExecConfig::default());
        processor.registry_mut().register_verb(
            "scale",
            Arc::new(|active, params| {
                let factor = params
                    .get("factor")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(1.0);
                match active {
                    EvalObject::Cube(c) => Ok(EvalObject::Cube(c.map_unary(|v| v * factor))),
                    other => Ok(other),
                }
            }),
        );
        let response = processor.execute().unwrap();
        match response.get("shouted") {
            Some(EvalObject::Cube(c)) => {
                assert!(c.values().iter().any(|&v| v == 10.0));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let unregistered = run_recipe(
            r#"{"x": {"type": "processing_chain", "with": {"type": "self"},
                 "do": [{"verb": "custom", "name": "scale"}]}}"#,
            ExecConfig::default(),
        );
        assert_eq!(unregistered.unwrap_err(), QueryError::UnknownVerb("scale".to_string()));
    }

    //
    // CACHING
    //

    /// Recipe touching the colortype layer twice via sibling concepts.
    const SIBLING_CONCEPTS: &str = r#"{
        "water": {"type": "concept", "reference": ["entity", "water"]},
        "lake": {"type": "concept", "reference": ["entity", "lake"]}
    }"#;

    fn run_counted(json: &str, config: ExecConfig) -> (Response, CountingDatacube) {
        let recipe = Recipe::parse(json).unwrap();
        let mapping = mapping();
        let store = CountingDatacube::new();
        let response =
            QueryProcessor::new(&recipe, &mapping, &store, extent(), config).execute().unwrap();
        (response, store)
    }

    #[test]
    fn test_shared_layer_fetched_once_under_caching() {
        let cached = ExecConfig { caching: true, ..ExecConfig::default() };
        let (with_cache, counted) = run_counted(SIBLING_CONCEPTS, cached);
        assert_eq!(counted.real_retrievals("appearance.colortype"), 1);
        // The preview pass touched the layer twice, at coarse resolution.
        assert_eq!(counted.preview_retrievals(), 2);

        let (without_cache, counted) = run_counted(SIBLING_CONCEPTS, ExecConfig::default());
        assert_eq!(counted.real_retrievals("appearance.colortype"), 2);
        assert_eq!(counted.preview_retrievals(), 0);

        // Cache transparency: identical values either way.
        assert!(with_cache.identical(&without_cache));
    }

    #[test]
    fn test_preview_sequence_covers_real_pass() {
        let recipe = Recipe::parse(SIBLING_CONCEPTS).unwrap();
        let mapping = mapping();
        let store = CountingDatacube::new();
        let processor =
            QueryProcessor::new(&recipe, &mapping, &store, extent(), ExecConfig::default());
        let sequence = processor.build_cache().unwrap();
        assert_eq!(sequence.len(), 2);
        assert_eq!(sequence.entries()[0], sequence.entries()[1]);
        let real = processor
            .execute_with_cache(super::Cache::from_sequence(sequence.clone()))
            .unwrap();
        assert!(real.get("water").is_some());
        // Sequence length bounds the number of real retrievals.
        let real_count = store
            .log
            .borrow()
            .iter()
            .filter(|(_, cols)| *cols == extent().cols())
            .count();
        assert!(sequence.len() >= real_count);
        assert_eq!(real_count, 1);
    }

    #[test]
    fn test_caching_with_single_use_layers_stores_nothing() {
        let cached = ExecConfig { caching: true, ..ExecConfig::default() };
        let (_, counted) = run_counted(WATER_COUNT, cached);
        // One preview retrieval, one real retrieval, no reuse to exploit.
        assert_eq!(counted.real_retrievals("appearance.colortype"), 1);
        assert_eq!(counted.preview_retrievals(), 1);
    }

    #[test]
    fn test_determinism_without_caching() {
        let a = run_recipe(WATER_COUNT, ExecConfig::default()).unwrap();
        let b = run_recipe(WATER_COUNT, ExecConfig::default()).unwrap();
        assert!(a.identical(&b));
    }

    #[test]
    fn test_cache_transparency_for_multi_layer_recipe() {
        let json = r#"{
            "veg": {"type": "concept", "reference": ["entity", "vegetation"]},
            "water": {"type": "concept", "reference": ["entity", "water"]},
            "veg_again": {"type": "concept", "reference": ["entity", "vegetation"]}
        }"#;
        let plain = run_recipe(json, ExecConfig::default()).unwrap();
        let cached =
            run_recipe(json, ExecConfig { caching: true, ..ExecConfig::default() }).unwrap();
        assert!(plain.identical(&cached));
    }

    //
    // PROPERTY TESTS
    //

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Layer values drawn from the colortype code space.
        fn layer_values() -> impl Strategy<Value = Vec<f64>> {
            proptest::collection::vec(
                prop_oneof![Just(1.0), Just(4.0), Just(21.0), Just(22.0), Just(23.0)],
                48,
            )
        }

        fn run_with_layer(values: Vec<f64>, config: ExecConfig) -> Response {
            let recipe = Recipe::parse(WATER_COUNT).unwrap();
            let mapping = mapping();
            let mut store = InMemoryDatacube::new();
            store.add_layer(
                &["appearance", "colortype"],
                Layer::new(LayerMeta::categorical(colortype_labels()), extent(), values),
            );
            store.add_layer(&["reflectance", "ndvi"], ndvi_layer());
            QueryProcessor::new(&recipe, &mapping, &store, extent(), config).execute().unwrap()
        }

        proptest! {
            #[test]
            fn prop_execution_is_deterministic(values in layer_values()) {
                let a = run_with_layer(values.clone(), ExecConfig::default());
                let b = run_with_layer(values, ExecConfig::default());
                prop_assert!(a.identical(&b));
            }

            #[test]
            fn prop_caching_never_changes_values(values in layer_values()) {
                let plain = run_with_layer(values.clone(), ExecConfig::default());
                let cached = run_with_layer(
                    values,
                    ExecConfig { caching: true, ..ExecConfig::default() },
                );
                prop_assert!(plain.identical(&cached));
            }
        }
    }
}
