//! Operator, reducer and custom-verb registries.
//!
//! Registries are owned by each processor instance rather than living in
//! global state: they are constructed with the built-in catalog and
//! extended through explicit registration calls, so concurrent processor
//! instances can carry different extensions.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::types::PromotionManual;
use crate::cube::EvalObject;
use crate::error::QueryError;
use crate::ops::{operators, reducers};

/// Cell-wise kernel of an operator.
#[derive(Clone)]
pub enum OperatorKernel {
    Unary(Arc<dyn Fn(f64) -> f64 + Send + Sync>),
    Binary(Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>),
    /// Binary against a list right-hand side (`in`, `not_in`).
    Membership(Arc<dyn Fn(f64, &[f64]) -> f64 + Send + Sync>),
}

/// A value transform applicable through the evaluate verb.
#[derive(Clone)]
pub struct Operator {
    pub manual: PromotionManual,
    pub kernel: OperatorKernel,
}

impl Operator {
    pub fn new(manual: PromotionManual, kernel: OperatorKernel) -> Self {
        Self { manual, kernel }
    }
}

/// A dimension-reducing aggregation applicable through the reduce, smooth
/// and merge verbs.
#[derive(Clone)]
pub struct Reducer {
    pub manual: PromotionManual,
    pub kernel: Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>,
}

impl Reducer {
    pub fn new(manual: PromotionManual, kernel: Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>) -> Self {
        Self { manual, kernel }
    }
}

/// A user-defined verb: receives the active evaluation object and the raw
/// verb parameters.
pub type CustomVerb = Arc<
    dyn Fn(EvalObject, &serde_json::Map<String, serde_json::Value>) -> Result<EvalObject, QueryError>
        + Send
        + Sync,
>;

/// Name → callable mapping for operators, reducers and custom verbs.
#[derive(Clone, Default)]
pub struct Registry {
    operators: FxHashMap<String, Operator>,
    reducers: FxHashMap<String, Reducer>,
    verbs: FxHashMap<String, CustomVerb>,
}

impl Registry {
    /// An empty registry without built-ins.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry populated with the built-in catalog.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        for (name, op) in operators::builtin_operators() {
            registry.register_operator(name, op);
        }
        for (name, red) in reducers::builtin_reducers() {
            registry.register_reducer(name, red);
        }
        registry
    }

    pub fn register_operator(&mut self, name: &str, operator: Operator) {
        self.operators.insert(name.to_string(), operator);
    }

    pub fn register_reducer(&mut self, name: &str, reducer: Reducer) {
        self.reducers.insert(name.to_string(), reducer);
    }

    pub fn register_verb(&mut self, name: &str, verb: CustomVerb) {
        self.verbs.insert(name.to_string(), verb);
    }

    pub fn operator(&self, name: &str) -> Result<&Operator, QueryError> {
        self.operators
            .get(name)
            .ok_or_else(|| QueryError::UnknownOperator(name.to_string()))
    }

    pub fn reducer(&self, name: &str) -> Result<&Reducer, QueryError> {
        self.reducers
            .get(name)
            .ok_or_else(|| QueryError::UnknownReducer(name.to_string()))
    }

    pub fn verb(&self, name: &str) -> Result<&CustomVerb, QueryError> {
        self.verbs
            .get(name)
            .ok_or_else(|| QueryError::UnknownVerb(name.to_string()))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("operators", &self.operators.len())
            .field("reducers", &self.reducers.len())
            .field("verbs", &self.verbs.len())
            .finish()
    }
}
