//! Response assembly — the final named-result mapping.

use indexmap::IndexMap;

use super::executor::ExecConfig;
use crate::cube::EvalObject;
use crate::error::QueryError;

/// Result of one recipe execution, in recipe-declaration order.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub results: IndexMap<String, EvalObject>,
    /// Failed results, present only under
    /// [`FailurePolicy::ContinueIndependent`](super::executor::FailurePolicy).
    pub failures: Vec<(String, QueryError)>,
}

impl Response {
    pub fn get(&self, name: &str) -> Option<&EvalObject> {
        self.results.get(name)
    }

    /// Bitwise value identity of two responses, entry by entry.
    pub fn identical(&self, other: &Response) -> bool {
        self.results.len() == other.results.len()
            && self
                .results
                .iter()
                .zip(&other.results)
                .all(|((an, av), (bn, bv))| an == bn && av.identical(bv))
    }
}

/// Collect named results, applying the configured post-processing:
/// trimming cubes to their minimal bounding extent and optionally
/// unstacking collections into individually named entries.
pub(crate) fn assemble(
    results: IndexMap<String, EvalObject>,
    failures: Vec<(String, QueryError)>,
    config: &ExecConfig,
) -> Response {
    let mut out = IndexMap::with_capacity(results.len());
    for (name, obj) in results {
        let obj = if config.trim_results { trim_object(obj) } else { obj };
        match obj {
            EvalObject::Collection(collection) if config.unstack_collections => {
                for (i, member) in collection.into_members().into_iter().enumerate() {
                    let entry = format!("{name}:{}", member.name_or(&format!("cube_{}", i + 1)));
                    out.insert(entry, EvalObject::Cube(member));
                }
            }
            other => {
                out.insert(name, other);
            }
        }
    }
    Response { results: out, failures }
}

fn trim_object(obj: EvalObject) -> EvalObject {
    match obj {
        EvalObject::Cube(cube) => match cube.trim(None, true) {
            Ok(trimmed) => EvalObject::Cube(trimmed),
            Err(_) => EvalObject::Cube(cube),
        },
        EvalObject::Collection(collection) => {
            match collection.clone().try_map(|c| c.trim(None, true)) {
                Ok(trimmed) => EvalObject::Collection(trimmed),
                Err(_) => EvalObject::Collection(collection),
            }
        }
    }
}
