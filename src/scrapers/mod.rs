pub mod command;

pub use command::CommandScraper;

use crate::automation::registry::ScraperRegistry;
use crate::config::SourceCommand;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a registry with one [`CommandScraper`] per configured source.
pub fn registry_from_sources(
    sources: &BTreeMap<String, SourceCommand>,
) -> Result<ScraperRegistry, String> {
    let mut registry = ScraperRegistry::new();
    for (name, command) in sources {
        if command.program.trim().is_empty() {
            return Err(format!("Source '{}' has no program configured", name));
        }
        registry.register(name, Arc::new(CommandScraper::new(name, command.clone())))?;
    }
    Ok(registry)
}
