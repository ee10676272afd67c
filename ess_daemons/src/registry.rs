// ========== Plugin Registry ==========

use crate::config::PluginSlots;
use crate::plugins::{
    DirUsageChecker, FirstFitBroker, HttpEventSender, HttpObjectStoreStager, LocalDiskPreCacher,
    LogEventSender, ManifestDataFinder, MaxFreeSpaceBroker, PassthroughStager, ProcessSplitter,
    RangeRefSplitter, StaticUsageChecker,
};
use ess_lib::{
    DataFinder, EssError, EssResult, MessagingSender, PreCacher, RequestBroker, ResourceChecker,
    Splitter, Stager,
};
use log::{info, warn};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

pub const SLOT_DATA_FINDER: &str = "datafinder";
pub const SLOT_REQUEST_BROKER: &str = "requestbroker";
pub const SLOT_RESOURCE_CHECKER: &str = "resourcechecker";
pub const SLOT_PRE_CACHER: &str = "precache";
pub const SLOT_SPLITTER: &str = "splitter";
pub const SLOT_STAGER: &str = "stager";
pub const SLOT_MESSAGING: &str = "messaging";

pub type PluginFactory<T> = Box<dyn Fn(&toml::Table) -> EssResult<Arc<T>> + Send + Sync>;

/// Decodes a slot's settings table into a plugin's own settings struct.
pub fn plugin_settings<T: DeserializeOwned>(kind: &str, settings: &toml::Table) -> EssResult<T> {
    toml::Value::Table(settings.clone())
        .try_into()
        .map_err(|e| EssError::InvalidParam(format!("{} plugin settings: {}", kind, e)))
}

struct Capability<T: ?Sized> {
    slot: &'static str,
    factories: HashMap<String, PluginFactory<T>>,
}

impl<T: ?Sized> Capability<T> {
    fn new(slot: &'static str) -> Self {
        Self {
            slot,
            factories: HashMap::new(),
        }
    }

    fn register(&mut self, kind: &str, factory: PluginFactory<T>) {
        if self.factories.insert(kind.to_string(), factory).is_some() {
            warn!("plugin registry: {} kind {} replaced", self.slot, kind);
        }
    }

    fn optional(&self, slots: &PluginSlots) -> EssResult<Option<Arc<T>>> {
        let Some(config) = slots.get(self.slot) else {
            return Ok(None);
        };
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            EssError::PluginUnavailable(format!(
                "{}: no plugin of kind '{}' is registered",
                self.slot, config.kind
            ))
        })?;
        let plugin = factory(&config.settings).map_err(|e| {
            warn!(
                "plugin registry: load failed: slot={}, kind={}, err={}",
                self.slot, config.kind, e
            );
            EssError::PluginUnavailable(format!("{} ({}): {}", self.slot, config.kind, e))
        })?;
        info!(
            "plugin registry: loaded: slot={}, kind={}",
            self.slot, config.kind
        );
        Ok(Some(plugin))
    }

    fn required(&self, slots: &PluginSlots) -> EssResult<Arc<T>> {
        self.optional(slots)?.ok_or_else(|| {
            EssError::PluginUnavailable(format!("required plugin slot '{}' is not configured", self.slot))
        })
    }
}

/// Maps the `kind` named in a plugin slot to the constructor of one capability.
/// Plugins are built once when a daemon is created and never re-resolved.
pub struct PluginRegistry {
    data_finders: Capability<dyn DataFinder>,
    request_brokers: Capability<dyn RequestBroker>,
    resource_checkers: Capability<dyn ResourceChecker>,
    pre_cachers: Capability<dyn PreCacher>,
    splitters: Capability<dyn Splitter>,
    stagers: Capability<dyn Stager>,
    messaging: Capability<dyn MessagingSender>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            data_finders: Capability::new(SLOT_DATA_FINDER),
            request_brokers: Capability::new(SLOT_REQUEST_BROKER),
            resource_checkers: Capability::new(SLOT_RESOURCE_CHECKER),
            pre_cachers: Capability::new(SLOT_PRE_CACHER),
            splitters: Capability::new(SLOT_SPLITTER),
            stagers: Capability::new(SLOT_STAGER),
            messaging: Capability::new(SLOT_MESSAGING),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_data_finder("manifest", |s| {
            Ok(Arc::new(ManifestDataFinder::from_settings(s)?))
        });
        registry.register_request_broker("max_free_space", |s| {
            Ok(Arc::new(MaxFreeSpaceBroker::from_settings(s)?))
        });
        registry.register_request_broker("first_fit", |_| Ok(Arc::new(FirstFitBroker)));
        registry.register_resource_checker("dir_usage", |s| {
            Ok(Arc::new(DirUsageChecker::from_settings(s)?))
        });
        registry.register_resource_checker("static", |s| {
            Ok(Arc::new(StaticUsageChecker::from_settings(s)?))
        });
        registry.register_pre_cacher("local_disk", |s| {
            Ok(Arc::new(LocalDiskPreCacher::from_settings(s)?))
        });
        registry.register_splitter("process", |s| {
            Ok(Arc::new(ProcessSplitter::from_settings(s)?))
        });
        registry.register_splitter("range_ref", |s| {
            Ok(Arc::new(RangeRefSplitter::from_settings(s)?))
        });
        registry.register_stager("http_object_store", |s| {
            Ok(Arc::new(HttpObjectStoreStager::from_settings(s)?))
        });
        registry.register_stager("passthrough", |s| {
            Ok(Arc::new(PassthroughStager::from_settings(s)?))
        });
        registry.register_messaging_sender("log", |_| Ok(Arc::new(LogEventSender)));
        registry.register_messaging_sender("http", |s| {
            Ok(Arc::new(HttpEventSender::from_settings(s)?))
        });
        registry
    }

    pub fn register_data_finder<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Table) -> EssResult<Arc<dyn DataFinder>> + Send + Sync + 'static,
    {
        self.data_finders.register(kind, Box::new(factory));
    }

    pub fn register_request_broker<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Table) -> EssResult<Arc<dyn RequestBroker>> + Send + Sync + 'static,
    {
        self.request_brokers.register(kind, Box::new(factory));
    }

    pub fn register_resource_checker<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Table) -> EssResult<Arc<dyn ResourceChecker>> + Send + Sync + 'static,
    {
        self.resource_checkers.register(kind, Box::new(factory));
    }

    pub fn register_pre_cacher<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Table) -> EssResult<Arc<dyn PreCacher>> + Send + Sync + 'static,
    {
        self.pre_cachers.register(kind, Box::new(factory));
    }

    pub fn register_splitter<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Table) -> EssResult<Arc<dyn Splitter>> + Send + Sync + 'static,
    {
        self.splitters.register(kind, Box::new(factory));
    }

    pub fn register_stager<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Table) -> EssResult<Arc<dyn Stager>> + Send + Sync + 'static,
    {
        self.stagers.register(kind, Box::new(factory));
    }

    pub fn register_messaging_sender<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Table) -> EssResult<Arc<dyn MessagingSender>> + Send + Sync + 'static,
    {
        self.messaging.register(kind, Box::new(factory));
    }

    pub fn data_finder(&self, slots: &PluginSlots) -> EssResult<Arc<dyn DataFinder>> {
        self.data_finders.required(slots)
    }

    pub fn request_broker(&self, slots: &PluginSlots) -> EssResult<Option<Arc<dyn RequestBroker>>> {
        self.request_brokers.optional(slots)
    }

    pub fn resource_checker(
        &self,
        slots: &PluginSlots,
    ) -> EssResult<Option<Arc<dyn ResourceChecker>>> {
        self.resource_checkers.optional(slots)
    }

    pub fn pre_cacher(&self, slots: &PluginSlots) -> EssResult<Arc<dyn PreCacher>> {
        self.pre_cachers.required(slots)
    }

    pub fn splitter(&self, slots: &PluginSlots) -> EssResult<Arc<dyn Splitter>> {
        self.splitters.required(slots)
    }

    pub fn stager(&self, slots: &PluginSlots) -> EssResult<Arc<dyn Stager>> {
        self.stagers.required(slots)
    }

    pub fn messaging_sender(
        &self,
        slots: &PluginSlots,
    ) -> EssResult<Option<Arc<dyn MessagingSender>>> {
        self.messaging.optional(slots)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;

    fn slots(slot: &str, kind: &str, settings: &[(&str, &str)]) -> PluginSlots {
        let mut table = toml::Table::new();
        for (key, value) in settings {
            table.insert(key.to_string(), toml::Value::String(value.to_string()));
        }
        let mut slots = PluginSlots::new();
        slots.insert(
            slot.to_string(),
            PluginConfig {
                kind: kind.to_string(),
                settings: table,
            },
        );
        slots
    }

    #[test]
    fn test_missing_required_slot_is_unavailable() {
        let registry = PluginRegistry::with_builtins();
        let err = registry
            .pre_cacher(&PluginSlots::new())
            .err()
            .expect("missing slot");
        assert!(matches!(err, EssError::PluginUnavailable(_)));
        assert!(registry
            .resource_checker(&PluginSlots::new())
            .expect("optional")
            .is_none());
    }

    #[test]
    fn test_unknown_kind_and_bad_settings() {
        let registry = PluginRegistry::with_builtins();
        let err = registry
            .stager(&slots(SLOT_STAGER, "ftp", &[]))
            .err()
            .expect("unknown kind");
        assert!(err.to_string().contains("ftp"));

        // local_disk needs both manifest_path and cache_dir.
        let err = registry
            .pre_cacher(&slots(SLOT_PRE_CACHER, "local_disk", &[("manifest_path", "/m.json")]))
            .err()
            .expect("bad settings");
        assert!(matches!(err, EssError::PluginUnavailable(_)));
    }

    #[test]
    fn test_builtins_load() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry
            .request_broker(&slots(SLOT_REQUEST_BROKER, "max_free_space", &[("tie_break", "name")]))
            .expect("broker")
            .is_some());
        assert!(registry
            .resource_checker(&slots(SLOT_RESOURCE_CHECKER, "static", &[("used_space", "1G")]))
            .expect("checker")
            .is_some());
        registry
            .splitter(&slots(SLOT_SPLITTER, "range_ref", &[]))
            .expect("splitter");
        assert!(registry
            .messaging_sender(&slots(SLOT_MESSAGING, "log", &[]))
            .expect("sender")
            .is_some());
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = PluginRegistry::new();
        registry.register_request_broker("always_first", |_| Ok(Arc::new(FirstFitBroker)));
        assert!(registry
            .request_broker(&slots(SLOT_REQUEST_BROKER, "always_first", &[]))
            .expect("custom")
            .is_some());
        assert!(registry
            .request_broker(&slots(SLOT_REQUEST_BROKER, "max_free_space", &[]))
            .is_err());
    }
}
