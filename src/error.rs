//! Error taxonomy for recipe execution.
//!
//! Every failure is raised synchronously at the point of detection and
//! carries enough context (the failing verb, operation name, offending
//! types or dimensions) to be actionable. Nothing is retried here; retry
//! policy belongs to the data-source adapter, not this crate.

use crate::cube::ValueType;

/// Errors raised while resolving references or applying verbs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// A referenced semantic concept (or one of its properties) is not
    /// defined in the mapping the query is processed against.
    #[error("mapping does not contain concept '{0}'")]
    UnknownConcept(String),

    /// A referenced data layer is not present in the datacube layout.
    #[error("datacube does not contain resource '{0}'")]
    UnknownResource(String),

    /// A referenced result has not been computed earlier in the same
    /// recipe. Forward references are not supported.
    #[error("result '{0}' is not computed yet")]
    UnknownResult(String),

    #[error("operator '{0}' is not defined")]
    UnknownOperator(String),

    #[error("reducer '{0}' is not defined")]
    UnknownReducer(String),

    #[error("custom verb '{0}' is not defined")]
    UnknownVerb(String),

    /// A dimension with the given name is not present in the input cube.
    #[error("dimension '{0}' is not present in the input object")]
    UnknownDimension(String),

    /// The given dimension does not carry the requested coordinate
    /// component (e.g. asking for "year" on the spatial dimension).
    #[error("component '{component}' is not defined for dimension '{dimension}'")]
    UnknownComponent { dimension: String, component: String },

    /// The operand value types are not admissible for the operation.
    #[error("unsupported operand value types for '{operation}': {input_types:?}")]
    InvalidValueType {
        operation: String,
        input_types: Vec<Option<ValueType>>,
    },

    /// Two label dictionaries assign different names to the same code.
    #[error("conflicting labels for code {code}: '{left}' vs '{right}'")]
    LabelConflict {
        code: i64,
        left: String,
        right: String,
    },

    /// Cubes in a collection have differing dimensions where identical
    /// dimensions are required.
    #[error("mixed dimensions in collection: {0}")]
    MixedDimensions(String),

    #[error("too many dimensions for '{operation}': {dimensions:?}")]
    TooManyDimensions {
        operation: String,
        dimensions: Vec<String>,
    },

    #[error("missing dimension for '{operation}': '{dimension}'")]
    MissingDimension {
        operation: String,
        dimension: String,
    },

    /// A secondary cube cannot be aligned to the shape of the input cube.
    #[error("cube '{other}' cannot be aligned with input cube '{input}'")]
    Alignment { input: String, other: String },

    /// An operation yielded no data where data is required.
    #[error("no valid data for '{0}' within the given spatio-temporal extent")]
    EmptyData(String),

    /// The recipe contains a building block the interpreter cannot handle.
    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),
}

impl QueryError {
    /// Format a multi-segment reference path for error messages.
    pub(crate) fn join_path(path: &[String]) -> String {
        path.join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_offender() {
        let e = QueryError::UnknownConcept("entity.water".to_string());
        assert_eq!(e.to_string(), "mapping does not contain concept 'entity.water'");

        let e = QueryError::InvalidValueType {
            operation: "count".to_string(),
            input_types: vec![Some(ValueType::Continuous)],
        };
        assert!(e.to_string().contains("count"));
        assert!(e.to_string().contains("Continuous"));
    }

    #[test]
    fn test_label_conflict_reports_both_names() {
        let e = QueryError::LabelConflict {
            code: 3,
            left: "water".to_string(),
            right: "snow".to_string(),
        };
        let msg = e.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains("water"));
        assert!(msg.contains("snow"));
    }

    #[test]
    fn test_join_path() {
        let path = vec!["entity".to_string(), "water".to_string()];
        assert_eq!(QueryError::join_path(&path), "entity.water");
    }
}
