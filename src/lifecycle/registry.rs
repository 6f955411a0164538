//! Service registrations collected before the listener starts.

use std::sync::Arc;

use thiserror::Error;

use crate::net::ServiceRegistrar;

/// A registered service.
pub type ServiceRegistration = Arc<dyn ServiceRegistrar>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("service registrar must have a non-empty service name")]
    InvalidRegistrar,

    #[error("cannot register service {0:?}: server is already serving")]
    AlreadyServing(String),
}

/// Ordered list of registrations.
///
/// Not internally synchronized; the lifecycle controller guards it with its
/// state lock. Once sealed it rejects further registrations.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: Vec<ServiceRegistration>,
    sealed: bool,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: ServiceRegistration) -> Result<(), RegistryError> {
        let name = registration.service_name().trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidRegistrar);
        }
        if self.sealed {
            return Err(RegistryError::AlreadyServing(name.to_string()));
        }
        self.entries.push(registration);
        Ok(())
    }

    /// Reject all later registrations.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Registrations in the order they were made.
    pub fn snapshot(&self) -> Vec<ServiceRegistration> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.service_name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .field("sealed", &self.sealed)
            .finish()
    }
}
