/// Hot-swappable program registry using ArcSwap
///
/// Compiled programs are keyed by flow version id. Every update swaps the whole
/// map pointer, so lookups never block while programs are being published.

use crate::error::DispatchError;
use crate::runtime::program::{CompiledProgram, PROGRAM_INTERFACE_VERSION};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
enum ProgramSlot {
    Ready(Arc<dyn CompiledProgram>),
    /// Known version whose artifact could not be built
    Broken { reason: String },
}

/// Lock-free version → program map
pub struct ProgramRegistry {
    programs: ArcSwap<HashMap<String, ProgramSlot>>,
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramRegistry")
            .field("versions", &self.list_version_ids())
            .finish()
    }
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self {
            programs: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Publish (or replace) a program under its own version id
    pub fn register(&self, program: Arc<dyn CompiledProgram>) {
        let version_id = program.version_id().to_string();
        self.swap_in(version_id.clone(), ProgramSlot::Ready(program));
        tracing::info!("📦 Registered program version: {}", version_id);
    }

    /// Record a version whose build failed so loads report why
    pub fn register_broken(&self, version_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("⚠️ Program version {} is broken: {}", version_id, reason);
        self.swap_in(version_id.to_string(), ProgramSlot::Broken { reason });
    }

    pub fn remove(&self, version_id: &str) -> bool {
        if !self.contains(version_id) {
            return false;
        }

        self.programs.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(version_id);
            next
        });
        tracing::info!("🗑️ Removed program version: {}", version_id);
        true
    }

    /// Resolve a loadable program for `version_id`
    pub fn load(&self, version_id: &str) -> Result<Arc<dyn CompiledProgram>, DispatchError> {
        let programs = self.programs.load();
        match programs.get(version_id) {
            None => Err(DispatchError::NotFound(format!("Program version '{}'", version_id))),
            Some(ProgramSlot::Broken { reason }) => Err(DispatchError::LoadFailure {
                version_id: version_id.to_string(),
                details: reason.clone(),
            }),
            Some(ProgramSlot::Ready(program)) => {
                let found = program.interface_version();
                if found != PROGRAM_INTERFACE_VERSION {
                    return Err(DispatchError::LoadFailure {
                        version_id: version_id.to_string(),
                        details: format!(
                            "Program interface version {} is not supported (expected {})",
                            found, PROGRAM_INTERFACE_VERSION
                        ),
                    });
                }
                Ok(Arc::clone(program))
            }
        }
    }

    pub fn contains(&self, version_id: &str) -> bool {
        self.programs.load().contains_key(version_id)
    }

    pub fn list_version_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.programs.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.programs.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn swap_in(&self, version_id: String, slot: ProgramSlot) {
        self.programs.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(version_id.clone(), slot.clone());
            next
        });
    }
}
