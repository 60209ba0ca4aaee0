//! Cube and collection value model — the two shapes flowing through the
//! interpreter, plus the spatio-temporal extent they are laid out on.

pub mod array;
pub mod collection;
pub mod extent;

pub use array::{Coord, Cube, Dimension, FillMethod, ValueType};
pub use collection::Collection;
pub use extent::Extent;

use crate::error::QueryError;

/// Name of the temporal dimension.
pub const TIME: &str = "time";

/// Name of the (stacked) spatial dimension.
pub const SPACE: &str = "space";

/// Name of the spatial X axis within the stacked spatial dimension.
pub const X: &str = "x";

/// Name of the spatial Y axis within the stacked spatial dimension.
pub const Y: &str = "y";

/// The active evaluation object: a single cube or an ordered collection of
/// cubes still to be combined. Verbs are polymorphic over this closed set.
#[derive(Debug, Clone)]
pub enum EvalObject {
    Cube(Cube),
    Collection(Collection),
}

impl EvalObject {
    /// Whether the object holds no valid data at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Cube(c) => c.is_empty(),
            Self::Collection(c) => c.is_empty(),
        }
    }

    /// Attach a result name. Collections name their members' container only
    /// implicitly, so naming is a no-op for them.
    pub fn set_name(&mut self, name: &str) {
        if let Self::Cube(c) = self {
            c.set_name(Some(name.to_string()));
        }
    }

    /// Unwrap a cube, failing with an actionable recipe error otherwise.
    pub fn into_cube(self, context: &str) -> Result<Cube, QueryError> {
        match self {
            Self::Cube(c) => Ok(c),
            Self::Collection(_) => Err(QueryError::InvalidRecipe(format!(
                "{context} expects a single cube, got a collection"
            ))),
        }
    }

    /// Bitwise value identity, including missing cells. Used by the
    /// determinism and cache-transparency contracts.
    pub fn identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cube(a), Self::Cube(b)) => a.identical(b),
            (Self::Collection(a), Self::Collection(b)) => a.identical(b),
            _ => false,
        }
    }
}

impl From<Cube> for EvalObject {
    fn from(value: Cube) -> Self {
        Self::Cube(value)
    }
}

impl From<Collection> for EvalObject {
    fn from(value: Collection) -> Self {
        Self::Collection(value)
    }
}
