//! Mapping provider — rules that connect semantic concepts to data.
//!
//! Mappings are nested JSON: categories branch into sub-categories and
//! leaf concepts hold an ordered set of properties, each defined by a
//! recipe expression. Concept truth requires all properties to hold, so
//! the resolver combines multi-property concepts with a logical "and".

use indexmap::IndexMap;

use crate::core::recipe::Expr;
use crate::error::QueryError;

/// The rule set of one concept: property name → defining expression.
pub type RuleSet = IndexMap<String, Expr>;

/// Lookup interface the reference resolver consults for concepts.
pub trait Mapping {
    /// Look up the rule set of a referenced concept.
    fn lookup(&self, reference: &[String]) -> Result<RuleSet, QueryError>;
}

/// Mapping backed by a nested JSON rule tree.
#[derive(Debug, Clone)]
pub struct RuleMapping {
    rules: serde_json::Value,
}

impl RuleMapping {
    pub fn new(rules: serde_json::Value) -> Self {
        Self { rules }
    }

    /// Parse a mapping from a JSON string.
    pub fn parse(json: &str) -> Result<Self, String> {
        let rules = serde_json::from_str(json).map_err(|e| format!("mapping parse error: {e}"))?;
        Ok(Self::new(rules))
    }
}

impl Mapping for RuleMapping {
    fn lookup(&self, reference: &[String]) -> Result<RuleSet, QueryError> {
        let missing = || QueryError::UnknownConcept(QueryError::join_path(reference));
        let mut node = &self.rules;
        for key in reference {
            node = node.get(key).ok_or_else(missing)?;
        }
        serde_json::from_value(node.clone()).map_err(|_| missing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING_JSON: &str = r#"{
        "entity": {
            "water": {
                "color": {
                    "type": "processing_chain",
                    "with": {"type": "resource", "reference": ["appearance", "colortype"]},
                    "do": [{"verb": "evaluate", "operator": "in", "y": [21, 22, 23]}]
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
    }"#;

    #[test]
    fn test_lookup_single_property_concept() {
        let mapping = RuleMapping::parse(MAPPING_JSON).unwrap();
        let rules = mapping
            .lookup(&["entity".to_string(), "water".to_string()])
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules.contains_key("color"));
    }

    #[test]
    fn test_lookup_multi_property_concept_keeps_order() {
        let mapping = RuleMapping::parse(MAPPING_JSON).unwrap();
        let rules = mapping
            .lookup(&["entity".to_string(), "vegetation".to_string()])
            .unwrap();
        let props: Vec<&String> = rules.keys().collect();
        assert_eq!(props, vec!["color", "greenness"]);
    }

    #[test]
    fn test_lookup_unknown_concept() {
        let mapping = RuleMapping::parse(MAPPING_JSON).unwrap();
        let err = mapping
            .lookup(&["entity".to_string(), "lava".to_string()])
            .unwrap_err();
        assert_eq!(err, QueryError::UnknownConcept("entity.lava".to_string()));
    }

    #[test]
    fn test_category_node_is_not_a_concept() {
        let mapping = RuleMapping::parse(MAPPING_JSON).unwrap();
        // "entity" is a category, its children are not expressions.
        assert!(mapping.lookup(&["entity".to_string()]).is_err());
    }
}
