//! Cached entities that can be mutated optimistically.

use crate::error::ReservationError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// A value cached on the client and owned by the remote authority.
///
/// The serde bounds exist because mutations cross the gateway as JSON
/// documents: the provisional value goes out, the canonical value comes back.
pub trait Entity:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifier type
    type Id: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static;

    /// Label the gateway uses to route mutations (e.g. `"event"`)
    const KIND: &'static str;

    /// Returns the entity's identifier
    fn id(&self) -> &Self::Id;

    /// Local invariant check applied to every value before it enters the cache.
    ///
    /// # Errors
    ///
    /// Returns error if the value breaks an invariant of its type.
    fn validate(&self) -> Result<(), ReservationError> {
        Ok(())
    }
}
