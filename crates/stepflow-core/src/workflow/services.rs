use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;

use crate::{Result, StepflowError};

/// Collaborator clients injected into workflow bodies.
///
/// Built once at startup and shared read-only by every run. Values are looked
/// up by type, so register trait objects behind an `Arc`:
///
/// ```ignore
/// let services = Services::new().with::<Arc<dyn TextGenerator>>(Arc::new(client));
/// let generator = ctx.service::<Arc<dyn TextGenerator>>()?;
/// ```
#[derive(Default)]
pub struct Services {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value, replacing any previous value of the same type.
    pub fn with<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.entries.insert(TypeId::of::<T>(), Box::new(value));
        self
    }

    /// Get a clone of the registered value.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Result<T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
            .ok_or_else(|| {
                StepflowError::NotFound(format!("service '{}' is not registered", type_name::<T>()))
            })
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("len", &self.entries.len())
            .finish()
    }
}
