//! Adapter: one virtual interface to one remote controller, with a primary
//! and an optional secondary netpath.
//!
//! All netpath and path-record state sits behind one lock. Viport status
//! arrives on a channel drained by the adapter task, which applies it under
//! that lock and then makes the upstream calls with the lock released.
//!
//! Carrier is derived, never stored: it is up exactly when the current
//! netpath is connected with the remote link up and the adapter is not a
//! bundle secondary. Promotion of the standby happens under the same lock
//! acquisition that removed the failed netpath, so an observer sees no
//! down/up flap when the standby takes over.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bundle::BundleRole;
use crate::config::VnicConfig;
use crate::data::ReceivedFrame;
use crate::error::{Result, VnicError};
use crate::netpath::Netpath;
use crate::types::{
    AdapterId, FrameId, IocGuid, LinkIndication, MacAddress, NetpathKind, OffloadCaps,
    PacketFilter, PathKey, PathRecord, SendStatus, TransmitOutcome, TxFrame,
};
use crate::transport::Transport;
use crate::upstream::UpstreamSink;
use crate::viport::{
    LinkSettings, TeardownReason, Viport, ViportNotice, ViportParams, ViportStatistics,
    ViportStatus,
};

enum AdapterEvent {
    Reconnect(NetpathKind),
    Shutdown,
}

enum Upcall {
    Link(LinkIndication),
    Receive(Vec<ReceivedFrame>),
    SendComplete(FrameId, SendStatus),
    Resumed,
}

struct AdapterState {
    primary: Netpath,
    secondary: Netpath,
    current: Option<NetpathKind>,
    paths: BTreeMap<PathKey, PathRecord>,
    link: LinkSettings,
    offloads: OffloadCaps,
    tx_stopped: bool,
    announced: LinkIndication,
    role: BundleRole,
    next_generation: u64,
    shutting_down: bool,
}

impl AdapterState {
    fn netpath(&self, kind: NetpathKind) -> &Netpath {
        match kind {
            NetpathKind::Primary => &self.primary,
            NetpathKind::Secondary => &self.secondary,
        }
    }

    fn netpath_mut(&mut self, kind: NetpathKind) -> &mut Netpath {
        match kind {
            NetpathKind::Primary => &mut self.primary,
            NetpathKind::Secondary => &mut self.secondary,
        }
    }

    fn current_viport(&self) -> Option<Arc<Viport>> {
        let kind = self.current?;
        self.netpath(kind).viport().cloned()
    }

    fn viports(&self) -> impl Iterator<Item = &Arc<Viport>> {
        [&self.primary, &self.secondary]
            .into_iter()
            .filter_map(Netpath::viport)
    }
}

/// Pick a known path for a netpath: never the one the other netpath uses,
/// and the one that last failed here only if nothing else is left.
fn choose_path(
    paths: &BTreeMap<PathKey, PathRecord>,
    taken: Option<PathKey>,
    avoid: Option<PathKey>,
) -> Option<PathRecord> {
    let candidates: Vec<&PathRecord> = paths
        .iter()
        .filter(|(k, _)| Some(**k) != taken)
        .map(|(_, p)| p)
        .collect();
    candidates
        .iter()
        .find(|p| Some(p.key()) != avoid)
        .or(candidates.first())
        .map(|p| (*p).clone())
}

struct Inner {
    id: AdapterId,
    ioc: IocGuid,
    instance: u8,
    transport: Arc<dyn Transport>,
    config: Arc<VnicConfig>,
    upstream: Arc<dyn UpstreamSink>,
    state: Mutex<AdapterState>,
    carrier: watch::Sender<bool>,
    healthy: watch::Sender<bool>,
    notices: mpsc::UnboundedSender<ViportNotice>,
    events: mpsc::UnboundedSender<AdapterEvent>,
}

pub struct Adapter {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn deliver(&self, upcalls: Vec<Upcall>) {
        for u in upcalls {
            match u {
                Upcall::Link(link) => self.upstream.link_changed(link),
                Upcall::Receive(frames) => self.upstream.receive(frames),
                Upcall::SendComplete(id, status) => self.upstream.send_complete(id, status),
                Upcall::Resumed => self.upstream.transmit_resumed(),
            }
        }
    }

    fn start_viport(&self, st: &mut AdapterState, kind: NetpathKind, path: PathRecord) {
        st.next_generation += 1;
        let generation = st.next_generation;
        tracing::info!(
            adapter = self.id,
            netpath = %kind,
            dest = %path.dest_gid,
            generation,
            "starting viport"
        );
        let params = ViportParams {
            path_id: (self.id << 32) | (generation & 0xffff_ffff),
            instance: self.instance,
            kind,
            path,
            generation,
            link: st.link.clone(),
            accepting: false,
            offloads: st.offloads,
        };
        let viport = Viport::spawn(
            Arc::clone(&self.transport),
            Arc::clone(&self.config),
            params,
            self.notices.clone(),
        );
        st.netpath_mut(kind).attach(Arc::new(viport));
    }

    fn fill_netpaths(&self, st: &mut AdapterState) {
        if st.shutting_down {
            return;
        }
        for kind in [NetpathKind::Primary, NetpathKind::Secondary] {
            if kind == NetpathKind::Secondary && !self.config.adapter.secondary_path {
                continue;
            }
            let np = st.netpath(kind);
            if np.viport().is_some() || np.reconnect_pending() {
                continue;
            }
            let taken = st.netpath(kind.other()).path_key();
            let avoid = np.last_failed();
            match choose_path(&st.paths, taken, avoid) {
                Some(path) => self.start_viport(st, kind, path),
                None => tracing::debug!(adapter = self.id, netpath = %kind, "no usable path"),
            }
        }
    }

    fn schedule_reconnect(&self, st: &mut AdapterState, kind: NetpathKind) {
        st.netpath_mut(kind).set_reconnect_pending(true);
        let delay = self.config.adapter.reconnect_delay;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(AdapterEvent::Reconnect(kind));
        });
    }

    /// Make `kind` the only netpath whose frames go upstream.
    fn activate(&self, st: &AdapterState, kind: NetpathKind) {
        let accepting = st.link.filter.is_enabled();
        if let Some(v) = st.netpath(kind).viport() {
            v.set_accepting(accepting);
        }
        if let Some(v) = st.netpath(kind.other()).viport() {
            v.set_accepting(false);
        }
    }

    /// Restore the invariants after any change: both netpaths filled where
    /// possible, a connected current netpath if there is one, and carrier
    /// published.
    fn reconcile(&self, st: &mut AdapterState) -> Vec<Upcall> {
        let mut upcalls = Vec::new();
        self.fill_netpaths(st);

        let current_ok = st.current.is_some_and(|k| st.netpath(k).is_connected());
        let mut promoted = false;
        if !current_ok && !st.shutting_down {
            let previous = st.current.take();
            let order = match previous {
                Some(k) => [k.other(), k],
                None => [NetpathKind::Primary, NetpathKind::Secondary],
            };
            if let Some(k) = order.into_iter().find(|k| st.netpath(*k).is_connected()) {
                st.current = Some(k);
                promoted = true;
                self.activate(st, k);
                match previous {
                    Some(old) => tracing::info!(
                        adapter = self.id,
                        from = %old,
                        to = %k,
                        "failed over to standby netpath"
                    ),
                    None => tracing::info!(adapter = self.id, netpath = %k, "netpath active"),
                }
            } else if previous.is_some() {
                tracing::warn!(adapter = self.id, "no connected netpath");
            }
        }
        if promoted && st.tx_stopped {
            st.tx_stopped = false;
            upcalls.push(Upcall::Resumed);
        }
        self.publish(st, promoted, &mut upcalls);
        upcalls
    }

    fn publish(&self, st: &mut AdapterState, reannounce: bool, upcalls: &mut Vec<Upcall>) {
        let active = st
            .current
            .map(|k| st.netpath(k))
            .filter(|np| np.is_connected());
        let healthy = active.is_some();
        let link = match active {
            Some(np) => {
                let l = np.link();
                LinkIndication {
                    up: l.up && st.role != BundleRole::Secondary,
                    ..l
                }
            }
            None => LinkIndication {
                up: false,
                ..st.announced
            },
        };
        self.carrier.send_if_modified(|c| {
            let changed = *c != link.up;
            *c = link.up;
            changed
        });
        self.healthy.send_if_modified(|h| {
            let changed = *h != healthy;
            *h = healthy;
            changed
        });
        if link != st.announced || (reannounce && link.up) {
            if link.up != st.announced.up {
                tracing::info!(adapter = self.id, up = link.up, mtu = link.mtu, "carrier changed");
            }
            st.announced = link;
            upcalls.push(Upcall::Link(link));
        }
    }

    fn on_viport_down(
        &self,
        st: &mut AdapterState,
        kind: NetpathKind,
        reason: TeardownReason,
        error: Option<String>,
    ) {
        let np = st.netpath_mut(kind);
        let key = np.path_key();
        np.detach();
        match reason {
            TeardownReason::Failed => {
                np.set_last_failed(key);
                tracing::warn!(
                    adapter = self.id,
                    netpath = %kind,
                    error = error.as_deref().unwrap_or("unknown"),
                    "viport failed"
                );
                self.schedule_reconnect(st, kind);
            }
            TeardownReason::Reset => {
                tracing::info!(adapter = self.id, netpath = %kind, "viport reset, reconnecting");
            }
            TeardownReason::Shutdown => {}
        }
    }

    fn on_notice(&self, notice: ViportNotice) {
        let ViportNotice {
            kind,
            generation,
            status,
        } = notice;
        let upcalls = {
            let mut st = self.state();
            if let ViportStatus::SendComplete(id, s) = status {
                vec![Upcall::SendComplete(id, s)]
            } else if !st.netpath(kind).holds(generation) {
                tracing::debug!(adapter = self.id, netpath = %kind, generation, "stale viport notice");
                Vec::new()
            } else {
                match status {
                    ViportStatus::Connected(link) => {
                        st.netpath_mut(kind).on_connected(link);
                        self.reconcile(&mut st)
                    }
                    ViportStatus::LinkChanged(link) => {
                        st.netpath_mut(kind).on_link(link);
                        self.reconcile(&mut st)
                    }
                    ViportStatus::BuffersAvailable if st.current == Some(kind) => {
                        st.tx_stopped = false;
                        vec![Upcall::Resumed]
                    }
                    ViportStatus::Received(frames) if st.current == Some(kind) => {
                        vec![Upcall::Receive(frames)]
                    }
                    ViportStatus::Down { reason, error } => {
                        self.on_viport_down(&mut st, kind, reason, error);
                        self.reconcile(&mut st)
                    }
                    _ => Vec::new(),
                }
            }
        };
        self.deliver(upcalls);
    }

    fn on_reconnect(&self, kind: NetpathKind) {
        let upcalls = {
            let mut st = self.state();
            st.netpath_mut(kind).set_reconnect_pending(false);
            self.reconcile(&mut st)
        };
        self.deliver(upcalls);
    }

    async fn run(
        self: Arc<Self>,
        mut notices: mpsc::UnboundedReceiver<ViportNotice>,
        mut events: mpsc::UnboundedReceiver<AdapterEvent>,
    ) {
        loop {
            tokio::select! {
                Some(n) = notices.recv() => self.on_notice(n),
                ev = events.recv() => match ev {
                    Some(AdapterEvent::Reconnect(kind)) => self.on_reconnect(kind),
                    Some(AdapterEvent::Shutdown) | None => break,
                },
            }
        }
        // completions of frames aborted by the teardown
        while let Ok(n) = notices.try_recv() {
            self.on_notice(n);
        }
        tracing::debug!(adapter = self.id, "adapter task exiting");
    }
}

impl Adapter {
    /// Create an adapter with no paths. Must be called inside a tokio
    /// runtime.
    pub fn new(
        id: AdapterId,
        ioc: IocGuid,
        instance: u8,
        transport: Arc<dyn Transport>,
        config: Arc<VnicConfig>,
        upstream: Arc<dyn UpstreamSink>,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mtu = config.adapter.mtu;
        let inner = Arc::new(Inner {
            id,
            ioc,
            instance,
            transport,
            upstream,
            state: Mutex::new(AdapterState {
                primary: Netpath::new(NetpathKind::Primary),
                secondary: Netpath::new(NetpathKind::Secondary),
                current: None,
                paths: BTreeMap::new(),
                link: LinkSettings {
                    mtu,
                    filter: PacketFilter::standard(),
                    multicast: Vec::new(),
                },
                offloads: OffloadCaps::default(),
                tx_stopped: false,
                announced: LinkIndication {
                    up: false,
                    mtu,
                    mac: MacAddress::ZERO,
                },
                role: BundleRole::Unbundled,
                next_generation: 0,
                shutting_down: false,
            }),
            config,
            carrier: watch::channel(false).0,
            healthy: watch::channel(false).0,
            notices: notices_tx,
            events: events_tx,
        });
        let task = tokio::spawn(Arc::clone(&inner).run(notices_rx, events_rx));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> AdapterId {
        self.inner.id
    }

    pub fn ioc(&self) -> IocGuid {
        self.inner.ioc
    }

    pub fn carrier(&self) -> bool {
        *self.inner.carrier.borrow()
    }

    pub fn subscribe_carrier(&self) -> watch::Receiver<bool> {
        self.inner.carrier.subscribe()
    }

    /// True while some netpath is connected, regardless of bundle role.
    pub fn subscribe_healthy(&self) -> watch::Receiver<bool> {
        self.inner.healthy.subscribe()
    }

    /// The netpath whose viport carries traffic.
    pub fn current_path(&self) -> Option<NetpathKind> {
        self.inner.state().current
    }

    pub fn netpath_connected(&self, kind: NetpathKind) -> bool {
        self.inner.state().netpath(kind).is_connected()
    }

    /// The path the netpath's viport uses, connected or not.
    pub fn netpath_path(&self, kind: NetpathKind) -> Option<PathRecord> {
        self.inner.state().netpath(kind).path().cloned()
    }

    pub fn known_paths(&self) -> Vec<PathRecord> {
        self.inner.state().paths.values().cloned().collect()
    }

    pub fn role(&self) -> BundleRole {
        self.inner.state().role
    }

    /// A discovered path to this adapter's controller. Returns false for
    /// paths to other controllers.
    pub fn path_added(&self, path: PathRecord) -> bool {
        if path.ioc_guid != self.inner.ioc {
            return false;
        }
        let upcalls = {
            let mut st = self.inner.state();
            if st.shutting_down {
                return false;
            }
            tracing::debug!(adapter = self.inner.id, dest = %path.dest_gid, "path added");
            st.paths.insert(path.key(), path);
            self.inner.reconcile(&mut st)
        };
        self.inner.deliver(upcalls);
        true
    }

    /// A path disappeared. A netpath using it loses its viport at once and
    /// reconnects on another known path.
    pub fn path_removed(&self, key: PathKey) -> bool {
        let upcalls = {
            let mut st = self.inner.state();
            if st.paths.remove(&key).is_none() {
                return false;
            }
            for kind in [NetpathKind::Primary, NetpathKind::Secondary] {
                if st.netpath(kind).path_key() != Some(key) {
                    continue;
                }
                tracing::info!(adapter = self.inner.id, netpath = %kind, "path removed, dropping viport");
                if let Some(v) = st.netpath_mut(kind).detach() {
                    v.shutdown();
                }
            }
            self.inner.reconcile(&mut st)
        };
        self.inner.deliver(upcalls);
        true
    }

    /// Transmit on the current netpath. `BufferExhausted` hands the frame
    /// back; retry after [`UpstreamSink::transmit_resumed`].
    pub fn transmit(&self, frame: TxFrame) -> Result<TransmitOutcome> {
        let viport = {
            let st = self.inner.state();
            if st.shutting_down {
                return Err(VnicError::ShutDown);
            }
            st.current_viport().ok_or(VnicError::NotConnected)?
        };
        let out = viport.transmit(frame)?;
        if matches!(out, TransmitOutcome::BufferExhausted(_)) {
            self.inner.state().tx_stopped = true;
        }
        Ok(out)
    }

    /// Transmit in order until the first exhaustion. Returns the frames not
    /// sent.
    pub fn transmit_batch(&self, frames: Vec<TxFrame>) -> Result<Vec<TxFrame>> {
        let mut rest = frames.into_iter();
        while let Some(frame) = rest.next() {
            if let TransmitOutcome::BufferExhausted(f) = self.transmit(frame)? {
                let mut unsent = vec![f];
                unsent.extend(rest);
                return Ok(unsent);
            }
        }
        Ok(Vec::new())
    }

    pub fn cancel(&self, id: FrameId) -> bool {
        let viports: Vec<_> = self.inner.state().viports().cloned().collect();
        viports.iter().any(|v| v.cancel(id))
    }

    fn push_link(&self, st: &AdapterState) {
        for v in st.viports() {
            v.set_link(st.link.clone());
        }
        if let Some(kind) = st.current {
            self.inner.activate(st, kind);
        }
    }

    pub fn set_multicast_list(&self, list: Vec<MacAddress>) {
        let mut st = self.inner.state();
        st.link.multicast = list;
        self.push_link(&st);
    }

    pub fn set_packet_filter(&self, filter: PacketFilter) {
        let mut st = self.inner.state();
        st.link.filter = filter;
        self.push_link(&st);
    }

    /// Offloads the current viport's controller supports.
    pub fn offload_capabilities(&self) -> OffloadCaps {
        self.inner
            .state()
            .current_viport()
            .and_then(|v| v.negotiated())
            .map(|n| n.offloads())
            .unwrap_or_default()
    }

    /// Enable the requested offloads where supported. Returns those enabled
    /// on the current viport.
    pub fn set_offloads(&self, caps: OffloadCaps) -> OffloadCaps {
        let mut st = self.inner.state();
        st.offloads = caps;
        let mut enabled = OffloadCaps::default();
        for v in st.viports() {
            let on = v.set_offloads(caps);
            if Some(v.kind()) == st.current {
                enabled = on;
            }
        }
        enabled
    }

    pub async fn query_statistics(&self) -> Result<ViportStatistics> {
        let viport = self
            .inner
            .state()
            .current_viport()
            .ok_or(VnicError::NotConnected)?;
        viport.query_statistics().await
    }

    /// Reset the current viport; the adapter reconnects once it is down.
    pub fn reset(&self) -> Result<()> {
        let viport = self
            .inner
            .state()
            .current_viport()
            .ok_or(VnicError::NotConnected)?;
        tracing::info!(adapter = self.inner.id, netpath = %viport.kind(), "reset requested");
        viport.reset();
        Ok(())
    }

    pub fn set_role(&self, role: BundleRole) {
        let upcalls = {
            let mut st = self.inner.state();
            if st.role == role {
                return;
            }
            tracing::info!(adapter = self.inner.id, ?role, "bundle role changed");
            st.role = role;
            let mut upcalls = Vec::new();
            self.inner.publish(&mut st, false, &mut upcalls);
            upcalls
        };
        self.inner.deliver(upcalls);
    }

    /// Tear down both viports and stop the adapter task.
    pub async fn shutdown(&self) {
        let (viports, upcalls) = {
            let mut st = self.inner.state();
            st.shutting_down = true;
            let viports: Vec<Arc<Viport>> = [NetpathKind::Primary, NetpathKind::Secondary]
                .into_iter()
                .filter_map(|k| st.netpath_mut(k).detach())
                .collect();
            st.current = None;
            let mut upcalls = Vec::new();
            self.inner.publish(&mut st, false, &mut upcalls);
            (viports, upcalls)
        };
        self.inner.deliver(upcalls);
        futures::future::join_all(viports.iter().map(|v| v.close())).await;
        let _ = self.inner.events.send(AdapterEvent::Shutdown);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!(adapter = self.inner.id, "adapter shut down");
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        let _ = self.inner.events.send(AdapterEvent::Shutdown);
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state();
        f.debug_struct("Adapter")
            .field("id", &self.inner.id)
            .field("ioc", &self.inner.ioc)
            .field("current", &st.current)
            .field("paths", &st.paths.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Gid;

    fn path(dest: u64) -> PathRecord {
        PathRecord {
            ioc_guid: IocGuid(1),
            source_gid: Gid::new(0xfe80 << 48, 1),
            dest_gid: Gid::new(0xfe80 << 48, dest),
            source_lid: 1,
            dest_lid: dest as u16,
            pkey: 0xffff,
            service_level: 0,
            rate: 3,
            mtu: 4,
            packet_lifetime: 18,
        }
    }

    fn table(dests: &[u64]) -> BTreeMap<PathKey, PathRecord> {
        dests.iter().map(|d| (path(*d).key(), path(*d))).collect()
    }

    #[test]
    fn test_choose_path_skips_other_netpath() {
        let paths = table(&[2, 3]);
        let chosen = choose_path(&paths, Some(path(2).key()), None).unwrap();
        assert_eq!(chosen.dest_gid, path(3).dest_gid);
        assert!(choose_path(&table(&[2]), Some(path(2).key()), None).is_none());
    }

    #[test]
    fn test_choose_path_avoids_last_failure_when_possible() {
        let paths = table(&[2, 3]);
        let chosen = choose_path(&paths, None, Some(path(2).key())).unwrap();
        assert_eq!(chosen.dest_gid, path(3).dest_gid);
        // falls back to the failed path when it is the only one
        let only = table(&[2]);
        let chosen = choose_path(&only, None, Some(path(2).key())).unwrap();
        assert_eq!(chosen.dest_gid, path(2).dest_gid);
    }

    #[test]
    fn test_choose_path_is_deterministic() {
        let paths = table(&[5, 3, 4]);
        let chosen = choose_path(&paths, None, None).unwrap();
        assert_eq!(chosen.dest_gid, path(3).dest_gid);
    }
}
