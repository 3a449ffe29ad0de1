//! Schema migration steps
//!
//! A migration from version `old` to `target` runs the registered step for
//! every version in `old + 1 ..= target`, in ascending order. Versions with
//! no registered step are skipped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use custodian_core::{EngineResult, MigrationCallback, MigrationContext, SchemaVersion};
use tracing::debug;

/// One migration step, called with the version it migrates to
pub type MigrationStep =
    Arc<dyn Fn(&mut dyn MigrationContext, SchemaVersion) -> EngineResult<()> + Send + Sync>;

/// Per-version migration steps
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    steps: BTreeMap<SchemaVersion, MigrationStep>,
}

impl MigrationRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step that migrates to `version`, replacing any previous one.
    pub fn register<F>(&mut self, version: u64, step: F)
    where
        F: Fn(&mut dyn MigrationContext, SchemaVersion) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.steps.insert(SchemaVersion::new(version), Arc::new(step));
    }

    /// Number of registered steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if no step is registered
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step after `old` up to the context's target version.
    pub fn run(&self, ctx: &mut dyn MigrationContext, old: SchemaVersion) -> EngineResult<()> {
        let target = ctx.new_version();
        if old >= target {
            return Ok(());
        }
        for (version, step) in self.steps.range(old.next()..=target) {
            debug!(target: "custodian::db", from = %old, to = %version, "applying migration step");
            step(ctx, *version)?;
        }
        Ok(())
    }

    /// Convert into the engine's migration callback.
    pub fn into_callback(self) -> MigrationCallback {
        Arc::new(move |ctx: &mut dyn MigrationContext, old: SchemaVersion| self.run(ctx, old))
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("versions", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}
