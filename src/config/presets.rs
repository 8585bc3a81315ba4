//! Preset store: named, persisted filter expressions
//!
//! Presets live in a single `presets.json` under the config directory and are
//! resolved by inbound sessions via `?preset=<name>`. A preset that fails to
//! load never fails the session; the caller falls back to "all".

use crate::config::filter::FilterExpression;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Matching strategy recorded with a preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetStrategy {
    Or,
    And,
    Advanced,
}

/// One stored preset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetDefinition {
    pub strategy: PresetStrategy,
    /// Tag list for `or` / `and` strategies
    #[serde(default)]
    pub tags: Vec<String>,
    /// Expression source for the `advanced` strategy
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

impl PresetDefinition {
    /// Compile the stored definition into a filter
    pub fn to_filter(&self) -> Result<FilterExpression> {
        match self.strategy {
            PresetStrategy::Or => Ok(FilterExpression::any_of(&self.tags)),
            PresetStrategy::And => Ok(FilterExpression::all_of(&self.tags)),
            PresetStrategy::Advanced => {
                let source = self.expression.as_deref().ok_or_else(|| {
                    GatewayError::validation("Advanced preset is missing its expression")
                })?;
                FilterExpression::parse(source)
            }
        }
    }
}

/// File-backed preset collection
pub struct PresetStore {
    path: PathBuf,
}

impl PresetStore {
    /// Create a store rooted at `config_dir/presets.json`
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join("presets.json"),
        }
    }

    /// Resolve a preset name to a filter; load failures degrade to `None`
    pub fn resolve(&self, name: &str) -> Option<FilterExpression> {
        let presets = match self.load_all() {
            Ok(presets) => presets,
            Err(e) => {
                warn!("Failed to load presets from '{}': {}", self.path.display(), e);
                return None;
            }
        };
        let definition = match presets.get(name) {
            Some(definition) => definition.clone(),
            None => {
                debug!("Preset '{}' not found", name);
                return None;
            }
        };
        match definition.to_filter() {
            Ok(filter) => Some(filter),
            Err(e) => {
                warn!("Preset '{}' is invalid: {}", name, e);
                None
            }
        }
    }

    /// Load every stored preset
    pub fn load_all(&self) -> Result<HashMap<String, PresetDefinition>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let presets: HashMap<String, PresetDefinition> = serde_json::from_str(&raw)?;
        Ok(presets)
    }

    /// Create or replace a preset
    pub fn save(&self, name: &str, definition: PresetDefinition) -> Result<()> {
        definition.to_filter()?;
        let mut presets = self.load_all().unwrap_or_default();
        presets.insert(name.to_string(), definition);
        self.write_all(&presets)
    }

    /// Remove a preset; returns whether it existed
    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut presets = self.load_all().unwrap_or_default();
        let existed = presets.remove(name).is_some();
        if existed {
            self.write_all(&presets)?;
        }
        Ok(existed)
    }

    fn write_all(&self, presets: &HashMap<String, PresetDefinition>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, serde_json::to_vec_pretty(presets)?)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
