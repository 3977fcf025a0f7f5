//! Composition of the registered chaos plugins
//!
//! Plugins run sequentially in registration order; later plugins observe
//! earlier plugins' transformations. A plugin that fails is logged and
//! skipped, never aborting the pipeline. The controller's enabled flag is
//! global and distinct from each plugin's own flag.

use crate::{ChaosContext, ChaosError, ChaosPlugin, DuplicateSend, SendOutcome};
use faultline_transport::WireMessage;
use serde_json::Value;
use tracing::{debug, info, warn};

/// What the send pipeline decided for one outbound message
#[derive(Debug)]
pub enum SendDisposition {
    /// Write this (possibly transformed) message, then fire the duplicates
    Send {
        message: WireMessage,
        duplicates: Vec<DuplicateSend>,
    },
    /// Do not write; the caller's send completes silently
    Withheld,
    /// Deliberate loss; surfaces to the caller as an injected-drop error
    Dropped { plugin: String },
}

pub struct ChaosController {
    plugins: Vec<Box<dyn ChaosPlugin>>,
    enabled: bool,
}

impl ChaosController {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            enabled: false,
        }
    }

    /// Controller pre-loaded with the four built-in plugins
    pub fn with_builtin_plugins() -> Self {
        let mut controller = Self::new();
        controller.register(Box::new(crate::NetworkChaosPlugin::new()));
        controller.register(Box::new(crate::ProtocolChaosPlugin::new()));
        controller.register(Box::new(crate::TimingChaosPlugin::new()));
        controller.register(Box::new(crate::StreamChaosPlugin::new()));
        controller
    }

    pub fn register(&mut self, plugin: Box<dyn ChaosPlugin>) {
        debug!(plugin = plugin.name(), "registered chaos plugin");
        self.plugins.push(plugin);
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Initialize every plugin and arm the controller
    ///
    /// A plugin whose initialize fails is logged and stays dormant; the rest
    /// of the pipeline still arms. The controller only arms at all when the
    /// config's master switch is on.
    pub async fn initialize_all(&mut self, context: &ChaosContext) {
        for plugin in &mut self.plugins {
            if let Err(e) = plugin.initialize(context).await {
                warn!(plugin = plugin.name(), error = %e, "chaos plugin failed to initialize");
            }
        }
        self.enabled = context.config.enabled;
        info!(
            enabled = self.enabled,
            seed = context.seed,
            plugins = self.plugins.len(),
            "chaos controller initialized"
        );
    }

    /// Thread one outbound message through every enabled plugin
    pub async fn apply_send_chaos(&mut self, message: WireMessage) -> SendDisposition {
        if !self.enabled {
            return SendDisposition::Send {
                message,
                duplicates: Vec::new(),
            };
        }

        let mut current = message;
        let mut duplicates = Vec::new();
        for plugin in &mut self.plugins {
            if !plugin.is_enabled() || !plugin.capabilities().before_send {
                continue;
            }
            match plugin.before_send(current.clone()).await {
                Ok(SendOutcome {
                    message: Some(next),
                    duplicates: extra,
                }) => {
                    duplicates.extend(extra);
                    current = next;
                }
                Ok(SendOutcome {
                    message: None,
                    duplicates: extra,
                }) => {
                    duplicates.extend(extra);
                    debug!(plugin = plugin.name(), "message withheld by chaos pipeline");
                    return SendDisposition::Withheld;
                }
                Err(ChaosError::InjectedDrop(name)) => {
                    return SendDisposition::Dropped { plugin: name };
                }
                Err(e) => {
                    // Isolated: the message continues unmodified from here.
                    warn!(plugin = plugin.name(), error = %e, "chaos plugin failed, skipping");
                }
            }
        }
        SendDisposition::Send {
            message: current,
            duplicates,
        }
    }

    /// Thread one inbound message through every enabled plugin
    ///
    /// Transformation only: an inbound message cannot be dropped or
    /// duplicated, and any plugin error (including a stray injected drop)
    /// is isolated to a warning.
    pub async fn apply_receive_chaos(&mut self, message: Value) -> Value {
        if !self.enabled {
            return message;
        }

        let mut current = message;
        for plugin in &mut self.plugins {
            if !plugin.is_enabled() || !plugin.capabilities().after_receive {
                continue;
            }
            match plugin.after_receive(current.clone()).await {
                Ok(next) => current = next,
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "chaos plugin failed, skipping");
                }
            }
        }
        current
    }

    /// Run every connection-phase hook
    pub async fn apply_connection_chaos(&mut self) {
        if !self.enabled {
            return;
        }
        for plugin in &mut self.plugins {
            if !plugin.is_enabled() || !plugin.capabilities().during_connection {
                continue;
            }
            if let Err(e) = plugin.during_connection().await {
                warn!(plugin = plugin.name(), error = %e, "connection chaos failed, skipping");
            }
        }
    }

    /// Restore every plugin, failures isolated, then disable the controller
    pub async fn restore(&mut self) {
        for plugin in &mut self.plugins {
            if let Err(e) = plugin.restore().await {
                warn!(plugin = plugin.name(), error = %e, "chaos plugin restore failed");
            }
        }
        self.enabled = false;
        info!("chaos controller restored");
    }
}

impl Default for ChaosController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChaosConfig, PluginCapabilities};
    use async_trait::async_trait;
    use serde_json::json;

    /// Scripted plugin for pipeline-shape tests
    struct ScriptedPlugin {
        name: &'static str,
        on_send: fn(WireMessage) -> Result<SendOutcome, ChaosError>,
    }

    #[async_trait]
    impl ChaosPlugin for ScriptedPlugin {
        fn name(&self) -> &'static str {
            self.name
        }

        fn capabilities(&self) -> PluginCapabilities {
            PluginCapabilities {
                before_send: true,
                after_receive: true,
                during_connection: false,
            }
        }

        fn is_enabled(&self) -> bool {
            true
        }

        async fn initialize(&mut self, _context: &ChaosContext) -> Result<(), ChaosError> {
            Ok(())
        }

        async fn before_send(&mut self, message: WireMessage) -> Result<SendOutcome, ChaosError> {
            (self.on_send)(message)
        }

        async fn after_receive(&mut self, mut message: Value) -> Result<Value, ChaosError> {
            if let Value::Object(map) = &mut message {
                map.insert(self.name.to_string(), json!(true));
            }
            Ok(message)
        }

        async fn restore(&mut self) -> Result<(), ChaosError> {
            Ok(())
        }
    }

    fn tag(message: WireMessage, key: &str) -> Result<SendOutcome, ChaosError> {
        let WireMessage::Json(mut value) = message else {
            return Ok(SendOutcome::forward(message));
        };
        value[key] = json!(true);
        Ok(SendOutcome::forward(value.into()))
    }

    async fn armed(plugins: Vec<Box<dyn ChaosPlugin>>) -> ChaosController {
        let mut controller = ChaosController::new();
        for plugin in plugins {
            controller.register(plugin);
        }
        let config = ChaosConfig {
            enabled: true,
            ..ChaosConfig::default()
        };
        controller.initialize_all(&ChaosContext::new(config, "test")).await;
        controller
    }

    #[tokio::test]
    async fn plugins_compose_in_registration_order() {
        let mut controller = armed(vec![
            Box::new(ScriptedPlugin {
                name: "first",
                on_send: |m| tag(m, "first"),
            }),
            Box::new(ScriptedPlugin {
                name: "second",
                on_send: |m| {
                    // Later plugins observe earlier transformations.
                    if let WireMessage::Json(value) = &m {
                        assert_eq!(value["first"], true);
                    }
                    tag(m, "second")
                },
            }),
        ])
        .await;

        let disposition = controller.apply_send_chaos(json!({"id": 1}).into()).await;
        let SendDisposition::Send { message, .. } = disposition else {
            panic!("expected send");
        };
        let WireMessage::Json(value) = message else {
            panic!("expected structured message");
        };
        assert_eq!(value["first"], true);
        assert_eq!(value["second"], true);
    }

    #[tokio::test]
    async fn withheld_message_short_circuits_remaining_plugins() {
        let mut controller = armed(vec![
            Box::new(ScriptedPlugin {
                name: "withholder",
                on_send: |_| Ok(SendOutcome::withhold()),
            }),
            Box::new(ScriptedPlugin {
                name: "unreachable",
                on_send: |_| panic!("must not run after withhold"),
            }),
        ])
        .await;

        let disposition = controller.apply_send_chaos(json!({"id": 1}).into()).await;
        assert!(matches!(disposition, SendDisposition::Withheld));
    }

    #[tokio::test]
    async fn injected_drop_short_circuits_and_names_the_plugin() {
        let mut controller = armed(vec![
            Box::new(ScriptedPlugin {
                name: "dropper",
                on_send: |_| Err(ChaosError::InjectedDrop("dropper".to_string())),
            }),
            Box::new(ScriptedPlugin {
                name: "unreachable",
                on_send: |_| panic!("must not run after drop"),
            }),
        ])
        .await;

        let disposition = controller.apply_send_chaos(json!({"id": 1}).into()).await;
        let SendDisposition::Dropped { plugin } = disposition else {
            panic!("expected drop");
        };
        assert_eq!(plugin, "dropper");
    }

    #[tokio::test]
    async fn failing_plugin_is_skipped_not_fatal() {
        let mut controller = armed(vec![
            Box::new(ScriptedPlugin {
                name: "broken",
                on_send: |_| {
                    Err(ChaosError::PluginFailure {
                        plugin: "broken".to_string(),
                        message: "internal bug".to_string(),
                    })
                },
            }),
            Box::new(ScriptedPlugin {
                name: "survivor",
                on_send: |m| tag(m, "survivor"),
            }),
        ])
        .await;

        let disposition = controller.apply_send_chaos(json!({"id": 1}).into()).await;
        let SendDisposition::Send { message, .. } = disposition else {
            panic!("expected send");
        };
        let WireMessage::Json(value) = message else {
            panic!("expected structured message");
        };
        // The broken plugin contributed nothing; the survivor still ran.
        assert_eq!(value["survivor"], true);
        assert_eq!(value.get("broken"), None);
    }

    #[tokio::test]
    async fn duplicates_accumulate_across_plugins() {
        let duplicate = |m: WireMessage| {
            Ok(SendOutcome {
                duplicates: vec![DuplicateSend {
                    message: m.clone(),
                    delay_ms: 5,
                }],
                message: Some(m),
            })
        };
        let mut controller = armed(vec![
            Box::new(ScriptedPlugin {
                name: "dup-a",
                on_send: duplicate,
            }),
            Box::new(ScriptedPlugin {
                name: "dup-b",
                on_send: duplicate,
            }),
        ])
        .await;

        let disposition = controller.apply_send_chaos(json!({"id": 1}).into()).await;
        let SendDisposition::Send { duplicates, .. } = disposition else {
            panic!("expected send");
        };
        assert_eq!(duplicates.len(), 2);
    }

    #[tokio::test]
    async fn receive_chaos_transforms_in_order() {
        let mut controller = armed(vec![
            Box::new(ScriptedPlugin {
                name: "first",
                on_send: |m| Ok(SendOutcome::forward(m)),
            }),
            Box::new(ScriptedPlugin {
                name: "second",
                on_send: |m| Ok(SendOutcome::forward(m)),
            }),
        ])
        .await;

        let value = controller.apply_receive_chaos(json!({"id": 1})).await;
        assert_eq!(value["first"], true);
        assert_eq!(value["second"], true);
    }

    #[tokio::test]
    async fn disabled_controller_is_a_no_op() {
        let mut controller = ChaosController::with_builtin_plugins();
        // Master switch off in the config.
        let config = ChaosConfig {
            enabled: false,
            ..ChaosConfig::default()
        };
        controller.initialize_all(&ChaosContext::new(config, "test")).await;
        assert!(!controller.is_enabled());

        let payload = json!({"id": 1});
        let disposition = controller.apply_send_chaos(payload.clone().into()).await;
        let SendDisposition::Send { message, duplicates } = disposition else {
            panic!("expected send");
        };
        assert_eq!(message, payload.clone().into());
        assert!(duplicates.is_empty());
        assert_eq!(controller.apply_receive_chaos(payload.clone()).await, payload);
    }

    #[tokio::test]
    async fn restore_disables_the_controller() {
        let mut controller = armed(Vec::new()).await;
        assert!(controller.is_enabled());
        controller.restore().await;
        assert!(!controller.is_enabled());
    }
}
