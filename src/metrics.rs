use std::fmt;
use std::sync::Arc;

use prometheus::{CounterVec, Gauge, Opts, Registry};

/// Engine metrics collector
pub struct EngineMetrics {
    /// Files written into source layers
    pub files_ingested: CounterVec,
    /// Files removed from source layers
    pub files_removed: CounterVec,
    /// Pages that failed to decode or encode
    pub page_errors: CounterVec,
    /// Plugin dispatch failures and timeouts
    pub plugin_errors: CounterVec,
    /// Refreshes dropped because the previous one was still running
    pub refresh_skipped: CounterVec,
    /// Non-fatal errors reported by sources
    pub source_errors: CounterVec,
    /// Layers currently mounted in the union view
    pub layers_mounted: Gauge,
}

impl EngineMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let files_ingested = CounterVec::new(
            Opts::new("docweave_files_ingested_total", "Files written into source layers"),
            &["source"],
        )?;

        let files_removed = CounterVec::new(
            Opts::new("docweave_files_removed_total", "Files removed from source layers"),
            &["source"],
        )?;

        let page_errors = CounterVec::new(
            Opts::new("docweave_page_errors_total", "Pages that failed to decode or encode"),
            &["source"],
        )?;

        let plugin_errors = CounterVec::new(
            Opts::new("docweave_plugin_errors_total", "Plugin dispatch failures"),
            &["plugin"],
        )?;

        let refresh_skipped = CounterVec::new(
            Opts::new("docweave_refresh_skipped_total", "Refreshes skipped while busy"),
            &["source"],
        )?;

        let source_errors = CounterVec::new(
            Opts::new("docweave_source_errors_total", "Errors reported by sources"),
            &["source"],
        )?;

        let layers_mounted = Gauge::new("docweave_layers_mounted", "Layers in the union view")?;

        registry.register(Box::new(files_ingested.clone()))?;
        registry.register(Box::new(files_removed.clone()))?;
        registry.register(Box::new(page_errors.clone()))?;
        registry.register(Box::new(plugin_errors.clone()))?;
        registry.register(Box::new(refresh_skipped.clone()))?;
        registry.register(Box::new(source_errors.clone()))?;
        registry.register(Box::new(layers_mounted.clone()))?;

        Ok(Self {
            files_ingested,
            files_removed,
            page_errors,
            plugin_errors,
            refresh_skipped,
            source_errors,
            layers_mounted,
        })
    }

    pub fn record_ingested(&self, source: &str) {
        self.files_ingested.with_label_values(&[source]).inc();
    }

    pub fn record_removed(&self, source: &str) {
        self.files_removed.with_label_values(&[source]).inc();
    }

    pub fn record_page_error(&self, source: &str) {
        self.page_errors.with_label_values(&[source]).inc();
    }

    pub fn record_plugin_error(&self, plugin: &str) {
        self.plugin_errors.with_label_values(&[plugin]).inc();
    }

    pub fn record_refresh_skipped(&self, source: &str) {
        self.refresh_skipped.with_label_values(&[source]).inc();
    }

    pub fn record_source_error(&self, source: &str) {
        self.source_errors.with_label_values(&[source]).inc();
    }

    pub fn set_layers(&self, count: usize) {
        self.layers_mounted.set(count as f64);
    }
}

impl fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("layers_mounted", &self.layers_mounted.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics_creation() {
        let registry = Arc::new(Registry::new());
        let metrics = EngineMetrics::new(registry.clone()).unwrap();

        metrics.record_ingested("docs");
        metrics.record_ingested("docs");
        assert_eq!(metrics.files_ingested.with_label_values(&["docs"]).get(), 2.0);
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn test_layer_gauge() {
        let metrics = EngineMetrics::new(Arc::new(Registry::new())).unwrap();

        metrics.set_layers(3);
        assert_eq!(metrics.layers_mounted.get(), 3.0);
        metrics.set_layers(0);
        assert_eq!(metrics.layers_mounted.get(), 0.0);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Arc::new(Registry::new());
        EngineMetrics::new(registry.clone()).unwrap();
        assert!(EngineMetrics::new(registry).is_err());
    }
}
