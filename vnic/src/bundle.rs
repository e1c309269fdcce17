//! Failover bundles: adapters sharing a nonzero bundle id elect one primary.
//!
//! Each member gets a `watch` channel carrying its role. Election keeps a
//! healthy incumbent; otherwise the earliest-joined healthy member wins. A
//! bundle with no healthy member keeps (or picks) a primary anyway so that
//! exactly one member holds the role while the bundle is non-empty.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::types::AdapterId;

/// An adapter's role within its failover bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleRole {
    /// Not part of any bundle; behaves as a primary.
    Unbundled,
    Primary,
    /// Standby: keeps its paths connected but reports no carrier.
    Secondary,
}

#[derive(Debug)]
struct Member {
    adapter: AdapterId,
    healthy: bool,
    role: watch::Sender<BundleRole>,
}

#[derive(Debug, Default)]
pub struct FailoverRegistry {
    bundles: Mutex<HashMap<u32, Vec<Member>>>,
}

fn elect(bundle: u32, members: &[Member]) {
    let incumbent = members
        .iter()
        .position(|m| *m.role.borrow() == BundleRole::Primary);
    let winner = match incumbent {
        Some(i) if members[i].healthy => Some(i),
        _ => members
            .iter()
            .position(|m| m.healthy)
            .or(incumbent)
            .or((!members.is_empty()).then_some(0)),
    };
    for (i, m) in members.iter().enumerate() {
        let role = if Some(i) == winner {
            BundleRole::Primary
        } else {
            BundleRole::Secondary
        };
        m.role.send_if_modified(|r| {
            let changed = *r != role;
            *r = role;
            changed
        });
    }
    if let Some(w) = winner
        && incumbent != winner
    {
        tracing::info!(
            bundle,
            primary = members[w].adapter,
            healthy = members[w].healthy,
            "bundle primary elected"
        );
    }
}

impl FailoverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bundles(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Vec<Member>>> {
        self.bundles.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add `adapter` to `bundle` and return its role channel. Bundle 0 means
    /// unbundled and never changes.
    pub fn join(&self, bundle: u32, adapter: AdapterId, healthy: bool) -> watch::Receiver<BundleRole> {
        if bundle == 0 {
            let (_tx, rx) = watch::channel(BundleRole::Unbundled);
            return rx;
        }
        let (tx, rx) = watch::channel(BundleRole::Secondary);
        let mut bundles = self.bundles();
        let members = bundles.entry(bundle).or_default();
        members.retain(|m| m.adapter != adapter);
        members.push(Member {
            adapter,
            healthy,
            role: tx,
        });
        tracing::debug!(bundle, adapter, members = members.len(), "joined bundle");
        elect(bundle, members);
        rx
    }

    pub fn leave(&self, bundle: u32, adapter: AdapterId) {
        let mut bundles = self.bundles();
        let Some(members) = bundles.get_mut(&bundle) else {
            return;
        };
        members.retain(|m| m.adapter != adapter);
        if members.is_empty() {
            bundles.remove(&bundle);
        } else {
            elect(bundle, members);
        }
    }

    pub fn health_changed(&self, bundle: u32, adapter: AdapterId, healthy: bool) {
        let mut bundles = self.bundles();
        let Some(members) = bundles.get_mut(&bundle) else {
            return;
        };
        let Some(m) = members.iter_mut().find(|m| m.adapter == adapter) else {
            return;
        };
        if m.healthy == healthy {
            return;
        }
        m.healthy = healthy;
        elect(bundle, members);
    }

    pub fn role(&self, bundle: u32, adapter: AdapterId) -> Option<BundleRole> {
        if bundle == 0 {
            return Some(BundleRole::Unbundled);
        }
        self.bundles()
            .get(&bundle)?
            .iter()
            .find(|m| m.adapter == adapter)
            .map(|m| *m.role.borrow())
    }

    pub fn primary(&self, bundle: u32) -> Option<AdapterId> {
        self.bundles()
            .get(&bundle)?
            .iter()
            .find(|m| *m.role.borrow() == BundleRole::Primary)
            .map(|m| m.adapter)
    }

    pub fn members(&self, bundle: u32) -> Vec<AdapterId> {
        self.bundles()
            .get(&bundle)
            .map(|ms| ms.iter().map(|m| m.adapter).collect())
            .unwrap_or_default()
    }
}
