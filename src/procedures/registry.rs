use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{ErasedProcedure, Procedure, ProcedureKind, Registered};
use crate::error::SyncError;

/// Two-phase procedure table: open for registration, then sealed for lookups.
#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<&'static str, Arc<dyn ErasedProcedure>>,
    sealed: bool,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Procedure>(&mut self, procedure: P) -> Result<&mut Self, SyncError> {
        let name = procedure.name();
        if self.sealed {
            return Err(SyncError::Registry(format!(
                "cannot register '{}': registry is sealed",
                name
            )));
        }
        if self.procedures.contains_key(name) {
            return Err(SyncError::Registry(format!("'{}' is already registered", name)));
        }
        self.procedures.insert(name, Arc::new(Registered::new(procedure)));
        Ok(self)
    }

    /// Close registration. Idempotent.
    pub fn seal(&mut self) {
        if !self.sealed {
            info!(procedures = self.procedures.len(), "Procedure registry sealed");
        }
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    pub fn kind(&self, name: &str) -> Option<ProcedureKind> {
        self.procedures.get(name).map(|p| p.kind())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.procedures.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn get(&self, name: &str) -> Result<Arc<dyn ErasedProcedure>, SyncError> {
        if !self.sealed {
            return Err(SyncError::Registry("registry must be sealed before dispatch".into()));
        }
        self.procedures
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownProcedure(name.to_string()))
    }
}

impl std::fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("procedures", &self.names())
            .field("sealed", &self.sealed)
            .finish()
    }
}
