//! Task template registry.
//!
//! Templates live one per TOML file under a directory, each with a
//! `[template]` table. An event is routed to the template with the longest
//! `match_prefix` that covers its resource id and lists its event kind.

use crate::error::{Error, Result};
use crate::model::{CanonicalEvent, TaskTemplate};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct TemplateFile {
    template: TaskTemplate,
}

/// Registry of loaded templates, indexed by name.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, TaskTemplate>,
}

impl TemplateRegistry {
    /// Create an empty registry. Every event is unroutable.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a registry from templates already in memory.
    pub fn from_templates(templates: impl IntoIterator<Item = TaskTemplate>) -> Result<Self> {
        let mut registry = Self::empty();
        for template in templates {
            registry.insert(template)?;
        }
        Ok(registry)
    }

    fn insert(&mut self, template: TaskTemplate) -> Result<()> {
        if template.event_kinds.is_empty() {
            return Err(Error::Config(format!(
                "template {} lists no event kinds",
                template.name
            )));
        }
        if self.templates.contains_key(&template.name) {
            return Err(Error::Config(format!(
                "duplicate template name: {}",
                template.name
            )));
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read template dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: TemplateFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad template {}: {e}", path.display()))
                })?;
                debug!(template = %file.template.name, path = %path.display(), "template loaded");
                registry.insert(file.template)?;
            }
        }

        Ok(registry)
    }

    /// Look up a template by name.
    pub fn get(&self, name: &str) -> Option<&TaskTemplate> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// The template this event should run, if any.
    ///
    /// Ties on prefix length go to the lexically smallest name so routing
    /// does not depend on directory order.
    pub fn match_event(&self, event: &CanonicalEvent) -> Option<&TaskTemplate> {
        let resource_id = event.resource.to_string();
        self.templates
            .values()
            .filter(|t| t.event_kinds.contains(&event.kind))
            .filter(|t| resource_id.starts_with(t.match_prefix.as_str()))
            .min_by(|a, b| {
                b.match_prefix
                    .len()
                    .cmp(&a.match_prefix.len())
                    .then_with(|| a.name.cmp(&b.name))
            })
    }
}
