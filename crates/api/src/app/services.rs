//! Engine wiring shared by every handler.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use tether_core::{ConnectionId, MutationEvent, Schema};
use tether_events::{EventBus, InMemoryEventBus};
use tether_infra::cache::{CacheBackend, CacheStore, InMemoryCacheBackend};
use tether_infra::{
    ChannelTransport, ConsistencySweep, InMemoryStore, LinkedStore, PrimaryStore, Propagator,
    RelationGraph, SubscriptionRegistry, SweepHandle, TetherConfig,
};

pub struct AppServices {
    pub store: Arc<LinkedStore>,
    pub transport: Arc<ChannelTransport>,
    pub registry: Arc<SubscriptionRegistry>,
    pub bus: Arc<dyn EventBus<MutationEvent>>,
    pub cache: Arc<CacheStore>,
    sweep: Mutex<Option<SweepHandle>>,
}

impl AppServices {
    /// Wire the engine over an in-memory primary store.
    pub async fn build(config: &TetherConfig, schema: Schema) -> anyhow::Result<Self> {
        let store: Arc<dyn PrimaryStore> = Arc::new(InMemoryStore::new(schema));
        Self::build_with_store(config, store).await
    }

    pub async fn build_with_store(
        config: &TetherConfig,
        store: Arc<dyn PrimaryStore>,
    ) -> anyhow::Result<Self> {
        let schema = store.schema();
        let graph = Arc::new(RelationGraph::resolve(&schema)?);
        let propagator =
            Arc::new(Propagator::new(store.clone(), graph.clone()).with_retry(config.retry_policy()));
        let bus: Arc<dyn EventBus<MutationEvent>> = Arc::new(InMemoryEventBus::new());
        let transport = Arc::new(ChannelTransport::new());

        let linked = Arc::new(LinkedStore::new(store.clone(), propagator.clone(), bus.clone()));
        let registry = SubscriptionRegistry::new(store.clone(), bus.clone(), transport.clone(), graph.clone());

        let attach = Arc::downgrade(&registry);
        transport.on_connect(Arc::new(move |connection: ConnectionId| {
            let Some(registry) = attach.upgrade() else {
                return;
            };
            if let Err(err) = registry.attach(connection) {
                warn!(connection_id = %connection, error = %err, "could not attach connection");
            }
        }));

        let mut cache = CacheStore::new(cache_backend(config).await?, schema.clone());
        if let Some(prefix) = &config.cache_prefix {
            cache = cache.with_prefix(prefix.clone());
        }
        let cache = Arc::new(cache);

        let sweep = config.sweep_interval.map(|interval| {
            info!(interval_secs = interval.as_secs(), "consistency sweep enabled");
            Arc::new(ConsistencySweep::new(store.clone(), propagator.clone(), bus.clone())).spawn(interval)
        });

        info!(
            collections = schema.collections().count(),
            linked_fields = graph.linked_collections().map(|c| graph.edges(c).len()).sum::<usize>(),
            "engine wired"
        );

        Ok(Self {
            store: linked,
            transport,
            registry,
            bus,
            cache,
            sweep: Mutex::new(sweep),
        })
    }

    /// Stop background work.
    pub async fn shutdown(&self) {
        let sweep = self.sweep.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = sweep {
            handle.shutdown().await;
        }
    }
}

#[cfg(feature = "redis")]
async fn cache_backend(config: &TetherConfig) -> anyhow::Result<Arc<dyn CacheBackend>> {
    match &config.redis_url {
        Some(url) => {
            let backend = tether_infra::cache::RedisCacheBackend::connect(url).await?;
            info!("redis cache backend connected");
            Ok(Arc::new(backend))
        }
        None => Ok(Arc::new(InMemoryCacheBackend::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn cache_backend(config: &TetherConfig) -> anyhow::Result<Arc<dyn CacheBackend>> {
    if config.redis_url.is_some() {
        warn!("TETHER_REDIS_URL is set but the redis feature is off; using the in-memory cache");
    }
    Ok(Arc::new(InMemoryCacheBackend::new()))
}
