//! Shared controller context

use crate::allocator::IdAllocator;
use crate::config::OperatorSettings;
use crate::error::Result;
use crate::nodes::Registry;
use crate::store::{KubeStore, ObjectStore};
use kube::Client;
use std::sync::Arc;

/// Everything a reconcile pass needs besides the Lab itself.
pub struct Context {
    pub client: Client,
    pub store: Arc<dyn ObjectStore>,
    pub allocator: IdAllocator,
    pub registry: Registry,
    pub settings: OperatorSettings,
}

impl Context {
    pub fn new(client: Client, settings: OperatorSettings) -> Result<Self> {
        Ok(Self {
            store: Arc::new(KubeStore::new(client.clone())),
            client,
            allocator: IdAllocator::new(),
            registry: Registry::builtin()?,
            settings,
        })
    }
}
