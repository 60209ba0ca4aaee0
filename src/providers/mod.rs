//! External collaborators: the mapping (ontology) and datacube (data
//! source) providers the resolver consults. The crate ships in-memory
//! reference implementations; network and on-disk adapters live outside.

pub mod datacube;
pub mod mapping;

pub use datacube::{Datacube, InMemoryDatacube, Layer, LayerMeta};
pub use mapping::{Mapping, RuleMapping, RuleSet};
