//! Endpoint change to forwarding table reconciliation
//!
//! Every watched service keeps the last address set contributed by each of
//! its endpoint slices. An event only touches the addresses that changed at
//! the service level: an address still contributed by a sibling slice is
//! neither re-added nor removed. Since the kernel keys flood entries by IP
//! alone, installed addresses are also reference counted across services so
//! an entry shared by two services survives until both have dropped it.

use crate::error::KubelanError;
use crate::hooks::{change_env, HookRunner};
use crate::types::{EndpointChangeEvent, ServiceIdentity, SliceKey, WatchSet};
use crate::vxlan::PeerTable;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use tracing::{debug, info, instrument, warn};

/// Service-level result of one handled event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub service: ServiceIdentity,
    /// Full peer list of the service after the event
    pub peers: Vec<IpAddr>,
    pub added: Vec<IpAddr>,
    pub removed: Vec<IpAddr>,
    /// True when the event only removed peers
    pub deleted: bool,
}

/// Receives service membership changes after the forwarding table was updated
#[cfg_attr(test, mockall::automock)]
pub trait MembershipObserver {
    fn membership_changed(&mut self, change: &MembershipChange);
}

/// Observer running the configured change hook
#[derive(Debug, Clone)]
pub struct ChangeHook {
    runner: HookRunner,
    interface: String,
    command: Vec<String>,
}

impl ChangeHook {
    pub fn new(runner: HookRunner, interface: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            runner,
            interface: interface.into(),
            command,
        }
    }
}

impl MembershipObserver for ChangeHook {
    fn membership_changed(&mut self, change: &MembershipChange) {
        let env = change_env(&self.interface, &change.service, &change.peers, change.deleted);
        match self.runner.fire("change", &self.command, env) {
            Ok(()) => {}
            Err(KubelanError::HookRunnerStopped) => {
                debug!(service = %change.service, "Hook runner stopped, change hook skipped");
            }
            Err(e) => {
                warn!(service = %change.service, error = %e, "Failed to fire change hook");
            }
        }
    }
}

/// Address sets contributed by each slice of one service
type ServicePeerState = HashMap<SliceKey, BTreeSet<IpAddr>>;

/// Translates endpoint change events into forwarding table mutations.
pub struct MembershipReconciler<P: PeerTable, O: MembershipObserver> {
    watch_set: WatchSet,
    local_ip: IpAddr,
    table: P,
    observer: O,
    services: HashMap<ServiceIdentity, ServicePeerState>,
    /// Number of services contributing each installed address
    installed: HashMap<IpAddr, usize>,
}

impl<P: PeerTable, O: MembershipObserver> MembershipReconciler<P, O> {
    pub fn new(watch_set: WatchSet, local_ip: IpAddr, table: P, observer: O) -> Self {
        Self {
            watch_set,
            local_ip,
            table,
            observer,
            services: HashMap::new(),
            installed: HashMap::new(),
        }
    }

    /// Apply one event. Returns the service-level change, or None when the
    /// event was discarded or changed nothing.
    #[instrument(skip(self, event), fields(service = %event.service(), slice = %event.slice()))]
    pub fn handle_event(&mut self, event: &EndpointChangeEvent) -> Option<MembershipChange> {
        let service = event.service();
        if !self.watch_set.contains(service) {
            debug!("Service not watched, ignoring");
            return None;
        }

        let new_addrs = match event {
            EndpointChangeEvent::Deleted(_) => BTreeSet::new(),
            EndpointChangeEvent::Added(change) | EndpointChangeEvent::Updated(change) => {
                self.parse_addresses(&change.addresses)
            }
        };

        let state = self.services.entry(service.clone()).or_default();
        let before = union(state);

        if new_addrs.is_empty() {
            state.remove(event.slice());
        } else {
            state.insert(event.slice().clone(), new_addrs);
        }

        let after = union(state);
        if state.is_empty() {
            self.services.remove(service);
        }

        let added: Vec<IpAddr> = after.difference(&before).copied().collect();
        let removed: Vec<IpAddr> = before.difference(&after).copied().collect();

        if added.is_empty() && removed.is_empty() {
            debug!("No membership change");
            return None;
        }

        // New peers are installed before departed ones are withdrawn
        for ip in &added {
            self.retain_peer(service, *ip);
        }
        for ip in &removed {
            self.release_peer(service, *ip);
        }

        let change = MembershipChange {
            service: service.clone(),
            peers: after.into_iter().collect(),
            deleted: added.is_empty(),
            added,
            removed,
        };

        info!(
            added = ?change.added,
            removed = ?change.removed,
            peers = change.peers.len(),
            "Service membership changed"
        );
        self.observer.membership_changed(&change);

        Some(change)
    }

    /// Current peers contributed by `service`, sorted
    pub fn peers(&self, service: &ServiceIdentity) -> Vec<IpAddr> {
        self.services
            .get(service)
            .map(|state| union(state).into_iter().collect())
            .unwrap_or_default()
    }

    /// Every address currently installed in the peer table
    pub fn installed(&self) -> BTreeSet<IpAddr> {
        self.installed.keys().copied().collect()
    }

    /// Services with at least one contributing slice
    pub fn tracked_services(&self) -> impl Iterator<Item = &ServiceIdentity> {
        self.services.keys()
    }

    pub fn peer_table(&self) -> &P {
        &self.table
    }

    /// Consume the reconciler, handing back the peer table
    pub fn into_peer_table(self) -> P {
        self.table
    }

    fn parse_addresses(&self, raw: &[String]) -> BTreeSet<IpAddr> {
        let mut addrs = BTreeSet::new();
        for addr in raw {
            match addr.parse::<IpAddr>() {
                Ok(ip) if ip == self.local_ip => {}
                Ok(ip) => {
                    addrs.insert(ip);
                }
                Err(e) => {
                    warn!(address = %addr, error = %e, "Dropping malformed endpoint address");
                }
            }
        }
        addrs
    }

    fn retain_peer(&mut self, service: &ServiceIdentity, ip: IpAddr) {
        let count = self.installed.entry(ip).or_insert(0);
        *count += 1;
        if *count > 1 {
            debug!(ip = %ip, "Peer already installed by another service");
            return;
        }

        if let Err(e) = self.table.add_peer(ip) {
            warn!(service = %service, ip = %ip, error = %e, "Failed to add peer");
        }
    }

    fn release_peer(&mut self, service: &ServiceIdentity, ip: IpAddr) {
        match self.installed.get_mut(&ip) {
            Some(count) if *count > 1 => {
                *count -= 1;
                debug!(ip = %ip, "Peer still installed by another service");
                return;
            }
            _ => {
                self.installed.remove(&ip);
            }
        }

        if let Err(e) = self.table.remove_peer(ip) {
            warn!(service = %service, ip = %ip, error = %e, "Failed to remove peer");
        }
    }
}

fn union(state: &ServicePeerState) -> BTreeSet<IpAddr> {
    state.values().flatten().copied().collect()
}
