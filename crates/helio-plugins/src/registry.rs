//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Maps `plugin_type` strings from the configuration to constructors.

use std::collections::HashMap;

use helio_common::config::{InstanceConfig, InverterSystemConfig};
use tracing::info;

use crate::{DevicePlugin, PluginError, Result};

/// Ambient data a plugin may consult at construction time.
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    pub system: InverterSystemConfig,
}

/// Builds one plugin instance from its configuration.
pub type PluginConstructor = fn(&InstanceConfig, &PluginContext) -> Result<Box<dyn DevicePlugin>>;

/// Registry of available plugin types.
pub struct PluginRegistry {
    constructors: HashMap<&'static str, PluginConstructor>,
}

impl PluginRegistry {
    /// Registry with every built-in plugin type.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register("inverter.deye", crate::inverter::deye::construct);
        registry.register("inverter.eg4", crate::inverter::eg4::construct);
        registry.register("inverter.powmr", crate::inverter::powmr::construct);
        registry.register("bms.seplos", crate::battery::seplos::construct);
        registry
    }

    pub fn register(&mut self, plugin_type: &'static str, constructor: PluginConstructor) {
        self.constructors.insert(plugin_type, constructor);
    }

    pub fn known_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.constructors.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Instantiate the plugin for one configured instance.
    pub fn build(
        &self,
        instance: &InstanceConfig,
        context: &PluginContext,
    ) -> Result<Box<dyn DevicePlugin>> {
        let constructor = self
            .constructors
            .get(instance.plugin_type.as_str())
            .ok_or_else(|| {
                PluginError::Config(format!(
                    "unknown plugin_type '{}' (known: {})",
                    instance.plugin_type,
                    self.known_types().join(", ")
                ))
            })?;
        let plugin = constructor(instance, context)?;
        info!(
            instance = %instance.name,
            plugin = plugin.name(),
            pretty = plugin.pretty_name(),
            "plugin instantiated"
        );
        Ok(plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(plugin_type: &str) -> InstanceConfig {
        let config: helio_common::AppConfig = format!(
            "[general]\nplugin_instances = x\n[plugin_x]\nplugin_type = {plugin_type}\n"
        )
        .parse()
        .unwrap();
        config.instances["x"].clone()
    }

    #[test]
    fn builtin_types_are_constructible() {
        let registry = PluginRegistry::with_builtins();
        let context = PluginContext::default();
        for plugin_type in ["inverter.deye", "inverter.eg4", "inverter.powmr", "bms.seplos"] {
            let plugin = registry.build(&instance(plugin_type), &context).unwrap();
            assert!(!plugin.name().is_empty());
            assert!(!plugin.configurable_params().is_empty());
        }
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        let registry = PluginRegistry::with_builtins();
        let err = registry
            .build(&instance("inverter.nonexistent"), &PluginContext::default())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
