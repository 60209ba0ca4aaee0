//! Value-type tracking and promotion.
//!
//! Every operator and reducer declares a promotion manual: an ordered list
//! of admissible input-type tuples with their resulting output type,
//! matched most-specific-first, plus a label propagation policy. The
//! promoter checks the actual operand types against the manual before a
//! kernel runs, merging categorical label dictionaries where the manual
//! requires them to be compatible.

use std::collections::BTreeMap;

use crate::cube::{Cube, ValueType};
use crate::error::QueryError;

/// Pattern an operand value type can be matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypePattern {
    Exact(ValueType),
    /// Either of the numeric types (discrete, continuous).
    Numeric,
    /// Either of the categorical types (nominal, ordinal).
    Categorical,
    Any,
}

impl TypePattern {
    fn matches(self, vtype: ValueType) -> bool {
        match self {
            Self::Exact(t) => t == vtype,
            Self::Numeric => vtype.is_numeric(),
            Self::Categorical => vtype.is_categorical(),
            Self::Any => true,
        }
    }
}

/// One admissible input combination and its output type.
#[derive(Debug, Clone)]
pub struct ManualRule {
    pub inputs: Vec<TypePattern>,
    pub output: ValueType,
}

impl ManualRule {
    pub fn unary(input: TypePattern, output: ValueType) -> Self {
        Self { inputs: vec![input], output }
    }

    pub fn binary(x: TypePattern, y: TypePattern, output: ValueType) -> Self {
        Self { inputs: vec![x, y], output }
    }
}

/// How output labels derive from input labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPolicy {
    /// Output carries no label dictionary.
    Drop,
    /// Output keeps the first operand's labels.
    First,
    /// Output keeps the second operand's labels.
    Second,
}

/// Promotion manual of one operator or reducer.
#[derive(Debug, Clone)]
pub struct PromotionManual {
    pub rules: Vec<ManualRule>,
    pub labels: LabelPolicy,
    /// Require the operands' label dictionaries to be mergeable (used by
    /// equality and relational operators over categorical data).
    pub merge_labels: bool,
}

impl PromotionManual {
    pub fn new(rules: Vec<ManualRule>, labels: LabelPolicy) -> Self {
        Self { rules, labels, merge_labels: false }
    }

    pub fn with_label_merge(mut self) -> Self {
        self.merge_labels = true;
        self
    }
}

/// Value type and labels of one operand, as seen by the promoter.
#[derive(Debug, Clone, Default)]
pub struct TypeInfo {
    pub vtype: Option<ValueType>,
    pub labels: Option<BTreeMap<i64, String>>,
}

impl TypeInfo {
    pub fn of_cube(cube: &Cube) -> Self {
        Self { vtype: cube.vtype(), labels: cube.labels().cloned() }
    }

    pub fn untyped() -> Self {
        Self::default()
    }

    pub fn plain(vtype: ValueType) -> Self {
        Self { vtype: Some(vtype), labels: None }
    }
}

/// Result of a successful promotion check.
#[derive(Debug, Clone)]
pub struct Promotion {
    pub vtype: Option<ValueType>,
    pub labels: Option<BTreeMap<i64, String>>,
}

impl Promotion {
    /// Stamp the promoted type and labels onto a kernel output.
    pub fn apply(&self, cube: Cube) -> Cube {
        cube.with_vtype(self.vtype).with_labels(self.labels.clone())
    }
}

/// Merge two label dictionaries; a code mapped to conflicting names fails.
pub fn merge_labels(
    a: &BTreeMap<i64, String>,
    b: &BTreeMap<i64, String>,
) -> Result<BTreeMap<i64, String>, QueryError> {
    let mut out = a.clone();
    for (code, name) in b {
        match out.get(code) {
            Some(existing) if existing != name => {
                return Err(QueryError::LabelConflict {
                    code: *code,
                    left: existing.clone(),
                    right: name.clone(),
                });
            }
            _ => {
                out.insert(*code, name.clone());
            }
        }
    }
    Ok(out)
}

/// Worker that checks operand types against a manual and derives the
/// output type and labels.
pub struct TypePromoter;

impl TypePromoter {
    /// Check the operand types against the manual, most-specific-first.
    ///
    /// An operand without a value type short-circuits the check: the
    /// output is untyped as well. Label dictionaries are merged first when
    /// the manual demands compatibility, then propagated per policy.
    pub fn check(
        operation: &str,
        manual: &PromotionManual,
        inputs: &[TypeInfo],
    ) -> Result<Promotion, QueryError> {
        if manual.merge_labels {
            if let [TypeInfo { labels: Some(a), .. }, TypeInfo { labels: Some(b), .. }] = inputs {
                merge_labels(a, b)?;
            }
        }
        let labels = match manual.labels {
            LabelPolicy::Drop => None,
            LabelPolicy::First => inputs.first().and_then(|i| i.labels.clone()),
            LabelPolicy::Second => inputs.get(1).and_then(|i| i.labels.clone()),
        };
        if inputs.iter().any(|i| i.vtype.is_none()) {
            return Ok(Promotion { vtype: None, labels });
        }
        let vtypes: Vec<ValueType> = inputs.iter().filter_map(|i| i.vtype).collect();
        for rule in &manual.rules {
            if rule.inputs.len() == vtypes.len()
                && rule.inputs.iter().zip(&vtypes).all(|(p, &t)| p.matches(t))
            {
                return Ok(Promotion { vtype: Some(rule.output), labels });
            }
        }
        Err(QueryError::InvalidValueType {
            operation: operation.to_string(),
            input_types: inputs.iter().map(|i| i.vtype).collect(),
        })
    }
}

//
// MANUAL TEMPLATES
//
// Shared by families of operators and reducers, the way the built-in
// catalog declares them.
//

use LabelPolicy::{Drop, First, Second};
use TypePattern::{Any, Categorical, Exact, Numeric};
use ValueType::{Binary, Continuous, Discrete, Nominal, Ordinal};

/// add, subtract, multiply, divide, power
pub fn algebraic_binary() -> PromotionManual {
    PromotionManual::new(
        vec![
            ManualRule::binary(Exact(Discrete), Exact(Discrete), Discrete),
            ManualRule::binary(Numeric, Numeric, Continuous),
        ],
        Drop,
    )
}

/// square_root, natural_logarithm, exponential, cube_root
pub fn algebraic_unary() -> PromotionManual {
    PromotionManual::new(vec![ManualRule::unary(Numeric, Continuous)], Drop)
}

/// absolute keeps discreteness
pub fn absolute_manual() -> PromotionManual {
    PromotionManual::new(
        vec![
            ManualRule::unary(Exact(Discrete), Discrete),
            ManualRule::unary(Numeric, Continuous),
        ],
        Drop,
    )
}

/// and, or, exclusive_or
pub fn boolean_binary() -> PromotionManual {
    PromotionManual::new(
        vec![ManualRule::binary(Exact(Binary), Exact(Binary), Binary)],
        First,
    )
}

/// not
pub fn boolean_unary() -> PromotionManual {
    PromotionManual::new(vec![ManualRule::unary(Exact(Binary), Binary)], First)
}

/// equal, not_equal, in, not_in — matching categories compare against
/// each other or against plain numeric codes; label dictionaries must be
/// compatible.
pub fn equality() -> PromotionManual {
    PromotionManual::new(
        vec![
            ManualRule::binary(Exact(Binary), Exact(Binary), Binary),
            ManualRule::binary(Exact(Nominal), Exact(Nominal), Binary),
            ManualRule::binary(Exact(Ordinal), Exact(Ordinal), Binary),
            ManualRule::binary(Categorical, Numeric, Binary),
            ManualRule::binary(Numeric, Categorical, Binary),
            ManualRule::binary(Numeric, Numeric, Binary),
        ],
        Drop,
    )
    .with_label_merge()
}

/// greater, greater_equal, less, less_equal — ordered types only;
/// ordinal data also compares against plain numeric codes.
pub fn relational() -> PromotionManual {
    PromotionManual::new(
        vec![
            ManualRule::binary(Exact(Binary), Exact(Binary), Binary),
            ManualRule::binary(Exact(Ordinal), Exact(Ordinal), Binary),
            ManualRule::binary(Exact(Ordinal), Numeric, Binary),
            ManualRule::binary(Numeric, Exact(Ordinal), Binary),
            ManualRule::binary(Numeric, Numeric, Binary),
        ],
        Drop,
    )
    .with_label_merge()
}

/// assign — the replacement's type and labels win.
pub fn assign_manual() -> PromotionManual {
    let mut rules = Vec::new();
    for output in [Binary, Nominal, Ordinal, Discrete, Continuous] {
        rules.push(ManualRule::binary(Any, Exact(output), output));
    }
    PromotionManual::new(rules, Second)
}

/// sum, product
pub fn additive_reducer() -> PromotionManual {
    PromotionManual::new(
        vec![
            ManualRule::unary(Exact(Discrete), Discrete),
            ManualRule::unary(Numeric, Continuous),
        ],
        Drop,
    )
}

/// mean, median, standard_deviation, variance
pub fn numeric_reducer() -> PromotionManual {
    PromotionManual::new(vec![ManualRule::unary(Numeric, Continuous)], Drop)
}

/// all, any
pub fn boolean_reducer() -> PromotionManual {
    PromotionManual::new(vec![ManualRule::unary(Exact(Binary), Binary)], First)
}

/// count yields discrete counts, percentage a continuous share.
pub fn count_reducer(output: ValueType) -> PromotionManual {
    PromotionManual::new(vec![ManualRule::unary(Exact(Binary), output)], Drop)
}

/// min, max — ordered types keep their type and labels.
pub fn ordered_reducer() -> PromotionManual {
    PromotionManual::new(
        vec![
            ManualRule::unary(Exact(Binary), Binary),
            ManualRule::unary(Exact(Ordinal), Ordinal),
            ManualRule::unary(Exact(Discrete), Discrete),
            ManualRule::unary(Exact(Continuous), Continuous),
        ],
        First,
    )
}

/// first, last, mode — every type passes through unchanged.
pub fn universal_reducer() -> PromotionManual {
    PromotionManual::new(
        vec![
            ManualRule::unary(Exact(Binary), Binary),
            ManualRule::unary(Exact(Nominal), Nominal),
            ManualRule::unary(Exact(Ordinal), Ordinal),
            ManualRule::unary(Exact(Discrete), Discrete),
            ManualRule::unary(Exact(Continuous), Continuous),
        ],
        First,
    )
}
