// ABOUTME: Catalog of capability extensions and per-session enabled sets
// ABOUTME: Only registration metadata lives here; extension implementations belong to the engine

use crate::config::CustomExtension;
use crate::error::{Result, RoostError};
use crate::store::SessionStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Registration metadata for one extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub name: String,
    pub description: String,
}

/// In-memory extension catalog backed by the session store for enabled sets.
pub struct ExtensionRegistry {
    catalog: BTreeMap<String, ExtensionInfo>,
    store: SessionStore,
}

impl ExtensionRegistry {
    /// Registry with the built-in catalog
    pub fn new(store: SessionStore) -> Self {
        let mut registry = Self {
            catalog: BTreeMap::new(),
            store,
        };
        for (name, description) in [
            ("developer", "Code analysis, debugging, file operations"),
            ("github", "GitHub repository operations"),
            ("computer", "System control and automation"),
            ("screen", "Screen capture and OCR"),
        ] {
            registry.register(name, description);
        }
        registry
    }

    /// Registry with the built-in catalog plus configured entries
    pub fn with_custom(store: SessionStore, custom: &[CustomExtension]) -> Self {
        let mut registry = Self::new(store);
        for ext in custom {
            registry.register(&ext.name, &ext.description);
        }
        registry
    }

    /// Add or replace a catalog entry
    pub fn register(&mut self, name: &str, description: &str) {
        let name = normalize(name);
        if name.is_empty() {
            return;
        }
        self.catalog.insert(
            name.clone(),
            ExtensionInfo {
                name,
                description: description.to_string(),
            },
        );
    }

    pub fn available(&self) -> Vec<ExtensionInfo> {
        self.catalog.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionInfo> {
        self.catalog.get(&normalize(name))
    }

    /// Normalize and check a requested set of names against the catalog
    pub fn validate<I, S>(&self, names: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut resolved = BTreeSet::new();
        for name in names {
            let name = normalize(name.as_ref());
            if name.is_empty() {
                continue;
            }
            if !self.catalog.contains_key(&name) {
                return Err(RoostError::UnknownExtension(name));
            }
            resolved.insert(name);
        }
        Ok(resolved)
    }

    /// Metadata for the enabled names, skipping ones no longer in the catalog
    pub fn resolve(&self, names: &BTreeSet<String>) -> Vec<ExtensionInfo> {
        names
            .iter()
            .filter_map(|name| match self.catalog.get(name) {
                Some(info) => Some(info.clone()),
                None => {
                    tracing::warn!(extension = %name, "Enabled extension missing from catalog");
                    None
                }
            })
            .collect()
    }

    /// Enabled extension names for a session
    pub async fn enabled(&self, session_id: &str) -> Result<BTreeSet<String>> {
        Ok(self.store.require(session_id).await?.extensions)
    }

    /// Replace the enabled set for a session; returns the stored names
    pub async fn set_enabled<I, S>(&self, session_id: &str, names: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = self.validate(names)?;
        self.store.set_extensions(session_id, &names).await?;
        tracing::info!(session_id = %session_id, extensions = ?names, "Extensions configured");
        Ok(names)
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}
