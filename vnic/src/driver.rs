//! Driver-level registry: owns every adapter, the failover registry and the
//! known paths, and routes path discovery to the adapters that want it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::adapter::Adapter;
use crate::bundle::FailoverRegistry;
use crate::config::VnicConfig;
use crate::error::{Result, VnicError};
use crate::transport::Transport;
use crate::types::{AdapterId, IocGuid, PathKey, PathRecord};
use crate::upstream::UpstreamSink;

/// What a new virtual interface attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub ioc: IocGuid,
    /// Interface instance on the controller; selects the service ids.
    pub instance: u8,
    /// Failover bundle; 0 for none.
    pub bundle: u32,
}

struct Entry {
    adapter: Arc<Adapter>,
    bundle: u32,
    glue: Option<JoinHandle<()>>,
}

pub struct VnicDriver {
    transport: Arc<dyn Transport>,
    config: Arc<VnicConfig>,
    registry: Arc<FailoverRegistry>,
    adapters: Mutex<HashMap<AdapterId, Entry>>,
    paths: Mutex<HashMap<IocGuid, BTreeMap<PathKey, PathRecord>>>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Relay an adapter's health into its bundle and the bundle's decision
/// back into the adapter.
fn spawn_bundle_glue(
    registry: Arc<FailoverRegistry>,
    adapter: &Arc<Adapter>,
    bundle: u32,
    mut role: tokio::sync::watch::Receiver<crate::bundle::BundleRole>,
) -> JoinHandle<()> {
    let id = adapter.id();
    let mut healthy = adapter.subscribe_healthy();
    let weak = Arc::downgrade(adapter);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = healthy.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let h = *healthy.borrow_and_update();
                    registry.health_changed(bundle, id, h);
                }
                changed = role.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let r = *role.borrow_and_update();
                    let Some(adapter) = weak.upgrade() else {
                        break;
                    };
                    adapter.set_role(r);
                }
            }
        }
    })
}

impl VnicDriver {
    pub fn new(transport: Arc<dyn Transport>, config: VnicConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            config: Arc::new(config),
            registry: Arc::new(FailoverRegistry::new()),
            adapters: Mutex::new(HashMap::new()),
            paths: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &VnicConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FailoverRegistry> {
        &self.registry
    }

    /// Create a virtual interface and hand it every path already known for
    /// its controller.
    pub fn create_interface(
        &self,
        spec: InterfaceSpec,
        upstream: Arc<dyn UpstreamSink>,
    ) -> Result<Arc<Adapter>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let adapter = Arc::new(Adapter::new(
            id,
            spec.ioc,
            spec.instance,
            Arc::clone(&self.transport),
            Arc::clone(&self.config),
            upstream,
        ));
        let role = self.registry.join(spec.bundle, id, false);
        adapter.set_role(*role.borrow());
        let glue = (spec.bundle != 0)
            .then(|| spawn_bundle_glue(Arc::clone(&self.registry), &adapter, spec.bundle, role));
        lock(&self.adapters).insert(
            id,
            Entry {
                adapter: Arc::clone(&adapter),
                bundle: spec.bundle,
                glue,
            },
        );
        tracing::info!(
            adapter = id,
            ioc = spec.ioc.0,
            instance = spec.instance,
            bundle = spec.bundle,
            "interface created"
        );

        let known: Vec<PathRecord> = lock(&self.paths)
            .get(&spec.ioc)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        for path in known {
            adapter.path_added(path);
        }
        Ok(adapter)
    }

    pub async fn destroy_interface(&self, id: AdapterId) -> Result<()> {
        let entry = lock(&self.adapters)
            .remove(&id)
            .ok_or(VnicError::UnknownInterface(id))?;
        Self::retire(&self.registry, entry).await;
        tracing::info!(adapter = id, "interface destroyed");
        Ok(())
    }

    async fn retire(registry: &FailoverRegistry, entry: Entry) {
        if let Some(glue) = entry.glue {
            glue.abort();
        }
        if entry.bundle != 0 {
            registry.leave(entry.bundle, entry.adapter.id());
        }
        entry.adapter.shutdown().await;
    }

    fn adapters_for(&self, ioc: IocGuid) -> Vec<Arc<Adapter>> {
        lock(&self.adapters)
            .values()
            .filter(|e| e.adapter.ioc() == ioc)
            .map(|e| Arc::clone(&e.adapter))
            .collect()
    }

    /// Record a discovered path and offer it to every adapter bound to its
    /// controller. Returns how many adapters took it.
    pub fn path_added(&self, path: PathRecord) -> usize {
        let ioc = path.ioc_guid;
        lock(&self.paths)
            .entry(ioc)
            .or_default()
            .insert(path.key(), path.clone());
        let taken = self
            .adapters_for(ioc)
            .iter()
            .filter(|a| a.path_added(path.clone()))
            .count();
        tracing::debug!(ioc = ioc.0, dest = %path.dest_gid, adapters = taken, "path discovered");
        taken
    }

    pub fn path_removed(&self, ioc: IocGuid, key: PathKey) -> usize {
        if let Some(paths) = lock(&self.paths).get_mut(&ioc) {
            paths.remove(&key);
        }
        let affected = self
            .adapters_for(ioc)
            .iter()
            .filter(|a| a.path_removed(key))
            .count();
        tracing::debug!(ioc = ioc.0, adapters = affected, "path lost");
        affected
    }

    pub fn adapter(&self, id: AdapterId) -> Option<Arc<Adapter>> {
        lock(&self.adapters).get(&id).map(|e| Arc::clone(&e.adapter))
    }

    /// All adapters, oldest first.
    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        let mut all: Vec<_> = lock(&self.adapters)
            .values()
            .map(|e| Arc::clone(&e.adapter))
            .collect();
        all.sort_by_key(|a| a.id());
        all
    }

    /// Destroy every interface.
    pub async fn shutdown(&self) {
        let entries: Vec<Entry> = lock(&self.adapters).drain().map(|(_, e)| e).collect();
        let count = entries.len();
        futures::future::join_all(entries.into_iter().map(|e| Self::retire(&self.registry, e)))
            .await;
        lock(&self.paths).clear();
        tracing::info!(interfaces = count, "driver shut down");
    }
}

impl std::fmt::Debug for VnicDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VnicDriver")
            .field("adapters", &lock(&self.adapters).len())
            .field("controllers", &lock(&self.paths).len())
            .finish()
    }
}
