//! Ordered set of known migrations.

use std::collections::{BTreeMap, HashMap};

use super::definition::MigrationDefinition;
use crate::error::{MigrationError, Result};

/// All migration definitions, ordered by version key.
///
/// Registration validates each definition and rejects name or version
/// collisions before any database is touched.
#[derive(Debug, Default, Clone)]
pub struct MigrationRegistry {
    by_version: BTreeMap<u64, MigrationDefinition>,
    versions: HashMap<String, u64>,
}

impl MigrationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every definition in `definitions`, stopping at the first failure.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = MigrationDefinition>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    /// Add a definition.
    pub fn register(&mut self, definition: MigrationDefinition) -> Result<()> {
        definition.validate()?;

        if self.versions.contains_key(definition.name()) {
            return Err(MigrationError::DuplicateMigration {
                name: definition.name().to_string(),
            });
        }
        if let Some(existing) = self.by_version.get(&definition.version()) {
            return Err(MigrationError::DuplicateVersion {
                version: definition.version(),
                existing: existing.name().to_string(),
                name: definition.name().to_string(),
            });
        }

        tracing::trace!(migration = definition.name(), version = definition.version(), "registered");
        self.versions
            .insert(definition.name().to_string(), definition.version());
        self.by_version.insert(definition.version(), definition);
        Ok(())
    }

    /// Every definition, ascending by version.
    pub fn all(&self) -> impl Iterator<Item = &MigrationDefinition> {
        self.by_version.values()
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<&MigrationDefinition> {
        self.versions
            .get(name)
            .and_then(|version| self.by_version.get(version))
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.versions.contains_key(name)
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.by_version.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.by_version.is_empty()
    }
}
