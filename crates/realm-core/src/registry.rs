//! Closed registry of factories keyed by stable ids.
//!
//! Every id a configuration may name is registered up front; building an id
//! nobody registered is an error, never a lookup by type name.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::task::BoxError;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No factory under this id.
    #[error("Unknown id {id:?}, expected one of: {known}")]
    Unknown { id: String, known: String },

    /// The factory ran and failed.
    #[error("Failed to build {id:?}: {source}")]
    Build {
        id: String,
        #[source]
        source: BoxError,
    },
}

type Factory<C, T> = Box<dyn Fn(&C) -> Result<T, BoxError> + Send + Sync>;

/// Factories producing `T` from a context `C`.
pub struct Registry<C, T> {
    factories: BTreeMap<&'static str, Factory<C, T>>,
}

impl<C, T> Registry<C, T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Add a factory. A later registration under the same id replaces it.
    #[must_use]
    pub fn register<F>(mut self, id: &'static str, factory: F) -> Self
    where
        F: Fn(&C) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.factories.insert(id, Box::new(factory));
        self
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Registered ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Build the entry registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unknown`] for unregistered ids and
    /// [`RegistryError::Build`] when the factory fails.
    pub fn build(&self, id: &str, context: &C) -> Result<T, RegistryError> {
        let factory = self.factories.get(id).ok_or_else(|| RegistryError::Unknown {
            id: id.to_string(),
            known: self.ids().collect::<Vec<_>>().join(", "),
        })?;
        factory(context).map_err(|source| RegistryError::Build {
            id: id.to_string(),
            source,
        })
    }

    /// Build every id, failing on the first unknown or failing entry.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_all<I, S>(&self, ids: I, context: &C) -> Result<Vec<T>, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .map(|id| self.build(id.as_ref(), context))
            .collect()
    }
}

impl<C, T> Default for Registry<C, T> {
    fn default() -> Self {
        Self::new()
    }
}
