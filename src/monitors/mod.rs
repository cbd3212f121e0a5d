use anyhow::Result;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::registry::ModuleCatalog;

pub mod internal;
pub mod samples;

/// Builds the module catalogue for this process: internal monitors
/// always, samples behind `load_sample_monitors`. Plugin modules would
/// be appended here by the embedding process.
pub fn catalog(config: &AppConfig) -> Result<ModuleCatalog> {
    let mut catalog = ModuleCatalog::new();
    catalog.insert(Arc::new(internal::MonitorErrorsMonitor::new(
        config.internal_monitors_notification.clone(),
    )))?;
    if config.load_sample_monitors {
        catalog.insert(Arc::new(samples::QueueBacklogMonitor::default()))?;
    }
    Ok(catalog)
}
