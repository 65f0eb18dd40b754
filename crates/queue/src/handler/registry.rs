//! Handler registry
//!
//! Maps `job_type` strings to handler instances. Job types are plain data in
//! the jobs table, so resolution happens at run time and an unknown type is
//! an ordinary job failure rather than a worker crash.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::JobHandler;

/// Registry of job handlers
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = HandlerRegistry::new();
    /// registry.register("SendInvoice", SendInvoice::new(mailer))?;
    /// ```
    pub fn register<H: JobHandler>(
        &mut self,
        job_type: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_arc(job_type, Arc::new(handler))
    }

    /// Register an already shared handler
    pub fn register_arc(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            return Err(RegistryError::DuplicateHandler(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    /// Look up the handler for a job type
    pub fn resolve(&self, job_type: &str) -> Result<Arc<dyn JobHandler>, RegistryError> {
        self.handlers
            .get(job_type)
            .cloned()
            .ok_or_else(|| RegistryError::HandlerNotFound(job_type.to_string()))
    }

    /// Check if a job type is registered
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Get the number of registered job types
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Get all registered job type names
    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Job type not registered
    #[error("no handler registered for job type: {0}")]
    HandlerNotFound(String),

    /// Job type registered twice
    #[error("handler already registered for job type: {0}")]
    DuplicateHandler(String),
}
