//! Registry of publisher and player instances
//!
//! Instances are addressed by [`InstanceId`]. The registry remembers the
//! most recently created publisher and player as the active ones; commands
//! routed to an instance that is not registered do nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::player::{spawn_player, PlayerHandle};
use super::publisher::{spawn_publisher, PublisherHandle};
use super::InstanceId;
use crate::config::Config;
use crate::engine::{DestinationConnector, PlayerEngine, PublisherEngine};

#[derive(Default)]
struct Instances {
    publishers: HashMap<InstanceId, PublisherHandle>,
    players: HashMap<InstanceId, PlayerHandle>,
    active_publisher: Option<InstanceId>,
    active_player: Option<InstanceId>,
}

pub struct SessionRegistry {
    config: Config,
    next_id: AtomicU64,
    instances: RwLock<Instances>,
}

impl SessionRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            instances: RwLock::new(Instances::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Instances> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Instances> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate(&self) -> InstanceId {
        InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn a publisher and make it the active one
    pub fn create_publisher(
        &self,
        engine: Box<dyn PublisherEngine>,
        connector: Arc<dyn DestinationConnector>,
    ) -> PublisherHandle {
        let id = self.allocate();
        let handle = spawn_publisher(id, &self.config, engine, connector);

        let mut instances = self.write();
        instances.publishers.insert(id, handle.clone());
        instances.active_publisher = Some(id);
        info!("Registered publisher {}", id);
        handle
    }

    /// Spawn a player and make it the active one
    pub fn create_player(&self, engine: Box<dyn PlayerEngine>) -> PlayerHandle {
        let id = self.allocate();
        let handle = spawn_player(id, &self.config, engine);

        let mut instances = self.write();
        instances.players.insert(id, handle.clone());
        instances.active_player = Some(id);
        info!("Registered player {}", id);
        handle
    }

    pub fn publisher(&self, id: InstanceId) -> Option<PublisherHandle> {
        self.read().publishers.get(&id).cloned()
    }

    pub fn player(&self, id: InstanceId) -> Option<PlayerHandle> {
        self.read().players.get(&id).cloned()
    }

    pub fn active_publisher(&self) -> Option<PublisherHandle> {
        let instances = self.read();
        instances
            .active_publisher
            .and_then(|id| instances.publishers.get(&id).cloned())
    }

    pub fn active_player(&self) -> Option<PlayerHandle> {
        let instances = self.read();
        instances
            .active_player
            .and_then(|id| instances.players.get(&id).cloned())
    }

    /// Run `f` against a publisher if it is registered
    pub fn with_publisher<F>(&self, id: InstanceId, f: F) -> bool
    where
        F: FnOnce(&PublisherHandle),
    {
        match self.publisher(id) {
            Some(handle) => {
                f(&handle);
                true
            }
            None => {
                debug!("No publisher {}; command dropped", id);
                false
            }
        }
    }

    /// Run `f` against a player if it is registered
    pub fn with_player<F>(&self, id: InstanceId, f: F) -> bool
    where
        F: FnOnce(&PlayerHandle),
    {
        match self.player(id) {
            Some(handle) => {
                f(&handle);
                true
            }
            None => {
                debug!("No player {}; command dropped", id);
                false
            }
        }
    }

    /// Unregister an instance and tear its session down
    pub fn remove(&self, id: InstanceId) -> bool {
        let mut instances = self.write();

        if let Some(handle) = instances.publishers.remove(&id) {
            if instances.active_publisher == Some(id) {
                instances.active_publisher = None;
            }
            handle.shutdown();
            info!("Unregistered publisher {}", id);
            return true;
        }
        if let Some(handle) = instances.players.remove(&id) {
            if instances.active_player == Some(id) {
                instances.active_player = None;
            }
            handle.shutdown();
            info!("Unregistered player {}", id);
            return true;
        }
        false
    }

    /// Tear down every instance
    pub fn shutdown_all(&self) {
        let mut instances = self.write();
        for (_, handle) in instances.publishers.drain() {
            handle.shutdown();
        }
        for (_, handle) in instances.players.drain() {
            handle.shutdown();
        }
        instances.active_publisher = None;
        instances.active_player = None;
    }

    pub fn len(&self) -> usize {
        let instances = self.read();
        instances.publishers.len() + instances.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
