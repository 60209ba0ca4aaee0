//! cubeql — semantic querying of Earth observation data cubes.
//!
//! Recipes reference real-world concepts ("water", "vegetation") that
//! mapping rules translate into derived array results. A two-pass
//! preview/look-ahead cache keeps memory bounded when raw layers are
//! expensive to fetch.

pub mod core;
pub mod cube;
pub mod error;
pub mod ops;
pub mod providers;

pub use crate::core::executor::{ExecConfig, FailurePolicy, QueryProcessor};
pub use crate::core::recipe::{Expr, Param, Recipe, VerbNode};
pub use crate::core::response::Response;
pub use crate::cube::{Collection, Cube, EvalObject, Extent, ValueType};
pub use crate::error::QueryError;
