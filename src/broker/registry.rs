// =============================================================================
// Broker Registry — per-user broker client lookup
// =============================================================================
//
// Each broker client is owned by a per-user broker registry. This module
// provides the narrow trait the strategy manager depends on plus a simple
// in-memory implementation suitable for a single-process deployment and for
// tests; a real deployment plugs in credential-backed client construction
// behind the same trait without the manager ever knowing the difference.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::broker::BrokerClient;
use crate::types::{Broker, Environment, UserId};

/// Resolves the shared broker client for a `(user, broker, environment)`
/// tuple. Returns `None` if the user has no connected client for that
/// broker/environment — the caller (C6) must treat that as `NotConnected`.
pub trait BrokerRegistry: Send + Sync {
    fn client_for(
        &self,
        user: &UserId,
        broker: Broker,
        environment: Environment,
    ) -> Option<Arc<dyn BrokerClient>>;
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct RegistryKey {
    user_id: UserId,
    broker: Broker,
    environment: Environment,
}

/// In-memory broker registry: clients are registered explicitly (e.g. after
/// the (external) credential layer establishes a connection) and looked up
/// by key. Internally synchronised so registration and lookup never race.
#[derive(Debug, Default)]
pub struct InMemoryBrokerRegistry {
    clients: RwLock<HashMap<RegistryKey, Arc<dyn BrokerClient>>>,
}

impl InMemoryBrokerRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        user: UserId,
        broker: Broker,
        environment: Environment,
        client: Arc<dyn BrokerClient>,
    ) {
        self.clients.write().insert(
            RegistryKey {
                user_id: user,
                broker,
                environment,
            },
            client,
        );
    }

    pub fn deregister(&self, user: &UserId, broker: Broker, environment: Environment) {
        self.clients.write().remove(&RegistryKey {
            user_id: user.clone(),
            broker,
            environment,
        });
    }
}

impl BrokerRegistry for InMemoryBrokerRegistry {
    fn client_for(
        &self,
        user: &UserId,
        broker: Broker,
        environment: Environment,
    ) -> Option<Arc<dyn BrokerClient>> {
        let key = RegistryKey {
            user_id: user.clone(),
            broker,
            environment,
        };
        self.clients.read().get(&key).cloned()
    }
}
