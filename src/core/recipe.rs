//! Recipe data model — an ordered mapping from result names to expression
//! trees, parsed from JSON.
//!
//! Reference and verb kinds are closed tagged unions so the interpreter
//! dispatches with an exhaustive match. Nested expression parameters (the
//! right-hand operand of evaluate, the filter predicate, the grouper) are
//! themselves full expression trees evaluated with the chain's current
//! active object as their local "self".

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::cube::FillMethod;

/// An ordered mapping from result name to processing-chain expression.
/// Immutable once execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recipe {
    pub results: IndexMap<String, Expr>,
}

impl Recipe {
    pub fn new() -> Self {
        Self { results: IndexMap::new() }
    }

    /// Parse a recipe from a JSON string.
    pub fn parse(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("recipe parse error: {e}"))
    }

    /// Add a result definition, keeping declaration order.
    pub fn with_result(mut self, name: &str, expr: Expr) -> Self {
        self.results.insert(name.to_string(), expr);
        self
    }
}

impl Default for Recipe {
    fn default() -> Self {
        Self::new()
    }
}

/// One node of a recipe expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    /// A semantic concept resolved through the mapping, optionally a
    /// single named property of it.
    Concept {
        reference: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
    },
    /// A raw data layer resolved through the datacube.
    Resource { reference: Vec<String> },
    /// A previously computed result of the same recipe.
    Result { name: String },
    /// The active evaluation object; the query extent at top level.
    #[serde(rename = "self")]
    SelfRef,
    /// An ordered collection of cubes still to be combined.
    Collection { elements: Vec<Expr> },
    /// A reference followed by verbs applied left to right.
    ProcessingChain {
        with: Box<Expr>,
        #[serde(rename = "do")]
        steps: Vec<VerbNode>,
    },
}

impl Expr {
    pub fn concept(path: &[&str]) -> Self {
        Self::Concept {
            reference: path.iter().map(|s| s.to_string()).collect(),
            property: None,
        }
    }

    pub fn resource(path: &[&str]) -> Self {
        Self::Resource { reference: path.iter().map(|s| s.to_string()).collect() }
    }

    pub fn result(name: &str) -> Self {
        Self::Result { name: name.to_string() }
    }

    /// Append a verb, starting a processing chain when needed.
    pub fn then(self, verb: VerbNode) -> Self {
        match self {
            Self::ProcessingChain { with, mut steps } => {
                steps.push(verb);
                Self::ProcessingChain { with, steps }
            }
            other => Self::ProcessingChain { with: Box::new(other), steps: vec![verb] },
        }
    }
}

/// A verb applied to the active evaluation object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum VerbNode {
    /// Evaluate an operator expression for each cell.
    Evaluate {
        operator: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<Param>,
    },
    /// Extract coordinate labels of a dimension.
    Extract {
        dimension: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component: Option<String>,
    },
    /// Keep cells where a binary predicate holds.
    Filter { filterer: Box<Expr> },
    /// Assign new values without computation, optionally under a mask.
    Assign {
        y: Param,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<Box<Expr>>,
    },
    /// Split into groups along a shared dimension.
    Groupby { grouper: Box<Expr> },
    /// Reduce one dimension (or all) with a named reducer.
    Reduce {
        reducer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dimension: Option<String>,
    },
    /// Shift values along a dimension.
    Shift {
        dimension: String,
        steps: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coord: Option<String>,
    },
    /// Reduce a centered rolling window along a dimension.
    Smooth {
        reducer: String,
        dimension: String,
        size: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coord: Option<String>,
    },
    /// Drop all-missing coordinates.
    Trim {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dimension: Option<String>,
    },
    /// Label spatio-temporally connected groups of true values.
    Delineate,
    /// Fill missing values along a dimension.
    Fill { dimension: String, method: FillMethod },
    /// Name the active object.
    Name { value: String },
    /// Deprecated alias of `name`, kept for older recipes.
    Label { label: String },
    /// Stack a collection into one nominal cube.
    Compose,
    /// Join a collection along a dimension.
    Concatenate { dimension: String },
    /// Combine a collection pairwise with a binary operator.
    Merge { operator: String },
    /// Apply a registered user-defined verb.
    Custom {
        name: String,
        #[serde(default)]
        params: serde_json::Map<String, serde_json::Value>,
    },
}

impl VerbNode {
    /// Verb name for dispatch traces and error context.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Evaluate { .. } => "evaluate",
            Self::Extract { .. } => "extract",
            Self::Filter { .. } => "filter",
            Self::Assign { .. } => "assign",
            Self::Groupby { .. } => "groupby",
            Self::Reduce { .. } => "reduce",
            Self::Shift { .. } => "shift",
            Self::Smooth { .. } => "smooth",
            Self::Trim { .. } => "trim",
            Self::Delineate => "delineate",
            Self::Fill { .. } => "fill",
            Self::Name { .. } => "name",
            Self::Label { .. } => "label",
            Self::Compose => "compose",
            Self::Concatenate { .. } => "concatenate",
            Self::Merge { .. } => "merge",
            Self::Custom { .. } => "custom",
        }
    }
}

/// A verb parameter: a scalar constant, a list of constants, or a nested
/// expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Param>),
    Expr(Box<Expr>),
}
