use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use qgate_channel::default_registry;
use qgate_relay::{
    Channel, LogUsageSink, MemoryLedger, PricingOracle, Relay, RelayDeps, TiktokenCounter,
};

use crate::config::GatewayConfig;

#[derive(Debug, Clone)]
pub(crate) struct AuthedKey {
    pub(crate) user_id: i64,
    pub(crate) key_id: i64,
    pub(crate) group: String,
}

/// Read-mostly routing state; admin changes publish a new snapshot whole.
pub(crate) struct GatewaySnapshot {
    keys: HashMap<String, AuthedKey>,
    channels: Vec<Arc<Channel>>,
}

pub(crate) struct AppState {
    pub(crate) relay: Relay,
    pub(crate) snapshot: ArcSwap<GatewaySnapshot>,
}

impl AppState {
    pub(crate) async fn from_config(config: GatewayConfig) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let mut keys = HashMap::new();
        let mut key_id = 0i64;
        for user in &config.users {
            ledger.credit_user(user.id, user.quota).await;
            for key in &user.keys {
                key_id += 1;
                keys.insert(
                    key.clone(),
                    AuthedKey {
                        user_id: user.id,
                        key_id,
                        group: user.group.clone(),
                    },
                );
            }
        }

        let channels = config.channels.into_iter().map(Arc::new).collect();

        let relay = Relay::new(RelayDeps {
            settings: Arc::new(ArcSwap::from_pointee(config.settings)),
            counter: Arc::new(TiktokenCounter),
            pricing: Arc::new(PricingOracle::new(config.prices)),
            ledger,
            registry: Arc::new(default_registry()),
            usage_sink: Arc::new(LogUsageSink),
        });

        Self {
            relay,
            snapshot: ArcSwap::from_pointee(GatewaySnapshot { keys, channels }),
        }
    }

    pub(crate) fn authenticate(&self, key: &str) -> Option<AuthedKey> {
        self.snapshot.load().keys.get(key).cloned()
    }

    /// First enabled channel whose allowlist covers the model.
    pub(crate) fn select_channel(&self, model: &str) -> Option<Arc<Channel>> {
        self.snapshot
            .load()
            .channels
            .iter()
            .find(|channel| channel.serves_model(model))
            .cloned()
    }
}
