use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::Value;
use sink_core::{
    BulkMode, OptionError, Registry, SinkError, SinkFactory, SinkStream, StreamOptions,
    MODE_OPTION,
};
use tracing::{debug, info, warn};

/// Versioned destination configuration as published by the configuration
/// source. `updated_at` distinguishes versions of the same destination.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    #[serde(default)]
    pub updated_at: String,
    /// Tables this node consumes for; one primary topic each.
    #[serde(default)]
    pub tables: Vec<String>,
    /// Raw stream options, parsed through the option registry.
    #[serde(default)]
    pub options: serde_json::Map<String, Value>,
}

/// A destination: versioned config, parsed stream options, and the sink
/// factory. Reference-counted via lease/release so a superseded version
/// stays alive until every consumer using it has moved off.
pub struct Destination {
    config: DestinationConfig,
    stream_options: StreamOptions,
    sink: Arc<dyn SinkFactory>,
    leases: AtomicUsize,
    retired: AtomicBool,
}

impl Destination {
    pub fn new(
        config: DestinationConfig,
        sink: Arc<dyn SinkFactory>,
    ) -> Result<Self, OptionError> {
        let mut stream_options = StreamOptions::new();
        for (key, raw) in &config.options {
            stream_options.add(Registry::global().parse(key, raw)?);
        }
        Ok(Self {
            config,
            stream_options,
            sink,
            leases: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn updated_at(&self) -> &str {
        &self.config.updated_at
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    pub fn stream_options(&self) -> &StreamOptions {
        &self.stream_options
    }

    pub fn mode(&self) -> BulkMode {
        MODE_OPTION.get(&self.stream_options)
    }

    pub fn lease(&self) {
        self.leases.fetch_add(1, Ordering::SeqCst);
    }

    /// Safe to call exactly once per matching `lease`.
    pub fn release(&self) {
        let previous = self.leases.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "release without a matching lease");
        if previous == 1 && self.retired.load(Ordering::SeqCst) {
            debug!(
                destination = self.id(),
                version = self.updated_at(),
                "last lease released from superseded destination"
            );
        }
    }

    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Creates a sink stream, replaying the recorded option mutators onto a
    /// fresh bag inside the factory.
    pub async fn create_stream(
        &self,
        topic_id: &str,
        table_name: &str,
        mode: BulkMode,
    ) -> Result<Box<dyn SinkStream>, SinkError> {
        self.sink
            .create_stream(topic_id, table_name, mode, self.stream_options.mutators())
            .await
    }
}

/// Live destinations by id. The configuration source publishes new versions
/// here; consumers lease the current version for the duration of a run.
#[derive(Default)]
pub struct Repository {
    destinations: RwLock<HashMap<String, Arc<Destination>>>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, destination_id: &str) -> Option<Arc<Destination>> {
        self.destinations
            .read()
            .unwrap()
            .get(destination_id)
            .cloned()
    }

    /// Current version with a lease already taken; the caller must `release`.
    pub fn lease_destination(&self, destination_id: &str) -> Option<Arc<Destination>> {
        let destination = self.get(destination_id)?;
        destination.lease();
        Some(destination)
    }

    /// Installs a destination version, superseding any previous one. The old
    /// version is marked retired but stays alive until its leases drain.
    pub fn publish(&self, destination: Arc<Destination>) -> Option<Arc<Destination>> {
        let old = self
            .destinations
            .write()
            .unwrap()
            .insert(destination.id().to_string(), destination.clone());
        if let Some(old) = &old {
            old.retire();
            info!(
                destination = old.id(),
                old_version = old.updated_at(),
                new_version = destination.updated_at(),
                leases = old.lease_count(),
                "destination superseded"
            );
        }
        old
    }

    pub fn remove(&self, destination_id: &str) -> Option<Arc<Destination>> {
        let old = self.destinations.write().unwrap().remove(destination_id);
        if let Some(old) = &old {
            old.retire();
            if old.lease_count() > 0 {
                warn!(
                    destination = destination_id,
                    leases = old.lease_count(),
                    "removed destination still leased"
                );
            }
        }
        old
    }

    pub fn ids(&self) -> Vec<String> {
        self.destinations.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{destination_with_options, RecordingSinkFactory};
    use serde_json::json;
    use sink_core::{BATCH_SIZE_OPTION, PRIMARY_KEY_OPTION};

    #[test]
    fn destination_parses_options_through_the_registry() {
        let destination = destination_with_options(
            "d1",
            json!({"mode": "batch", "batchSize": 2000, "primaryKey": ["id"]}),
        );
        assert_eq!(destination.mode(), BulkMode::Batch);
        assert_eq!(BATCH_SIZE_OPTION.get(destination.stream_options()), 2000);
        assert!(PRIMARY_KEY_OPTION
            .get(destination.stream_options())
            .contains("id"));
    }

    #[test]
    fn unknown_options_fail_destination_construction() {
        let config = DestinationConfig {
            id: "d1".to_string(),
            options: json!({"turbo": true}).as_object().unwrap().clone(),
            ..Default::default()
        };
        assert!(Destination::new(config, Arc::new(RecordingSinkFactory::default())).is_err());
    }

    #[test]
    fn publish_supersedes_but_keeps_leased_versions() {
        let repository = Repository::new();
        repository.publish(destination_with_options("d1", json!({"mode": "stream"})));

        let leased = repository.lease_destination("d1").unwrap();
        assert_eq!(leased.lease_count(), 1);

        let v2 = destination_with_options("d1", json!({"mode": "stream", "batchSize": 1}));
        let old = repository.publish(v2).unwrap();
        assert!(Arc::ptr_eq(&old, &leased));
        // New consumers see the new version; the leased one is still alive.
        let current = repository.get("d1").unwrap();
        assert!(!Arc::ptr_eq(&current, &leased));
        assert_eq!(leased.lease_count(), 1);

        leased.release();
        assert_eq!(leased.lease_count(), 0);
    }

    #[test]
    fn lease_destination_on_missing_id_is_none() {
        let repository = Repository::new();
        assert!(repository.lease_destination("ghost").is_none());
    }
}
