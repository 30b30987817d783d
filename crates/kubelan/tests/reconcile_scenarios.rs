//! Reconciliation scenarios against an in-memory peer table

use kubelan::{
    EndpointChangeEvent, MembershipChange, MembershipObserver, MembershipReconciler, PeerTable,
    Result, ServiceIdentity, SliceChange, SliceKey, WatchSet,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::net::IpAddr;

const LOCAL: &str = "192.168.1.10";

/// Peer table keeping the installed set and a log of calls
#[derive(Default)]
struct MemoryTable {
    installed: BTreeSet<IpAddr>,
    log: Vec<String>,
}

impl PeerTable for MemoryTable {
    fn add_peer(&mut self, ip: IpAddr) -> Result<()> {
        self.log.push(format!("add {}", ip));
        self.installed.insert(ip);
        Ok(())
    }

    fn remove_peer(&mut self, ip: IpAddr) -> Result<()> {
        self.log.push(format!("remove {}", ip));
        self.installed.remove(&ip);
        Ok(())
    }
}

#[derive(Default)]
struct Changes(Vec<MembershipChange>);

impl MembershipObserver for Changes {
    fn membership_changed(&mut self, change: &MembershipChange) {
        self.0.push(change.clone());
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn ips(list: &[&str]) -> BTreeSet<IpAddr> {
    list.iter().map(|s| ip(s)).collect()
}

fn payload(service: &str, slice: &str, addrs: &[&str]) -> SliceChange {
    SliceChange {
        service: ServiceIdentity::new("ns1", service),
        slice: SliceKey::new(slice),
        addresses: addrs.iter().map(|a| a.to_string()).collect(),
    }
}

fn reconciler() -> MembershipReconciler<MemoryTable, Changes> {
    let watch_set: WatchSet = [
        ServiceIdentity::new("ns1", "svcA"),
        ServiceIdentity::new("ns1", "svcB"),
    ]
    .into_iter()
    .collect();
    MembershipReconciler::new(watch_set, ip(LOCAL), MemoryTable::default(), Changes::default())
}

#[test]
fn test_final_state_matches_last_event() {
    let mut reconciler = reconciler();
    let events = [
        EndpointChangeEvent::Added(payload("svcA", "s1", &["10.0.0.1"])),
        EndpointChangeEvent::Added(payload("svcA", "s1", &["10.0.0.1"])),
        EndpointChangeEvent::Updated(payload("svcA", "s1", &["10.0.0.1", "10.0.0.4", LOCAL])),
        EndpointChangeEvent::Updated(payload("svcA", "s1", &["10.0.0.4", "10.0.0.4"])),
        EndpointChangeEvent::Updated(payload("svcA", "s1", &["10.0.0.5", "10.0.0.6"])),
        EndpointChangeEvent::Updated(payload("svcA", "s1", &["10.0.0.5", "10.0.0.6"])),
    ];

    for event in &events {
        reconciler.handle_event(event);
    }

    assert_eq!(
        reconciler.peers(&ServiceIdentity::new("ns1", "svcA")),
        vec![ip("10.0.0.5"), ip("10.0.0.6")]
    );
    assert_eq!(reconciler.peer_table().installed, ips(&["10.0.0.5", "10.0.0.6"]));
    assert!(!reconciler.peer_table().log.iter().any(|call| call.contains(LOCAL)));
}

#[test]
fn test_scenario_call_order() {
    let mut reconciler = reconciler();

    reconciler.handle_event(&EndpointChangeEvent::Added(payload(
        "svcA",
        "slice1",
        &["10.0.0.1", "10.0.0.2"],
    )));
    reconciler.handle_event(&EndpointChangeEvent::Updated(payload(
        "svcA",
        "slice1",
        &["10.0.0.2", "10.0.0.3"],
    )));
    reconciler.handle_event(&EndpointChangeEvent::Deleted(payload("svcA", "slice1", &[])));

    let table = reconciler.into_peer_table();
    assert_eq!(
        table.log,
        vec![
            "add 10.0.0.1",
            "add 10.0.0.2",
            "add 10.0.0.3",
            "remove 10.0.0.1",
            "remove 10.0.0.2",
            "remove 10.0.0.3",
        ]
    );
    assert!(table.installed.is_empty());
}

#[test]
fn test_deleted_payload_is_ignored() {
    let mut reconciler = reconciler();

    reconciler.handle_event(&EndpointChangeEvent::Added(payload(
        "svcA",
        "slice1",
        &["10.0.0.1"],
    )));
    // Deleted removes everything the slice contributed whatever it carries
    reconciler.handle_event(&EndpointChangeEvent::Deleted(payload(
        "svcA",
        "slice1",
        &["10.0.0.1", "10.0.0.7"],
    )));

    assert!(reconciler.peer_table().installed.is_empty());
}

#[test]
fn test_sibling_slices_and_hook_flags() {
    let mut reconciler = reconciler();
    let svc_a = ServiceIdentity::new("ns1", "svcA");

    reconciler.handle_event(&EndpointChangeEvent::Added(payload(
        "svcA",
        "slice1",
        &["10.0.0.1", "10.0.0.2"],
    )));
    reconciler.handle_event(&EndpointChangeEvent::Added(payload(
        "svcA",
        "slice2",
        &["10.0.0.2"],
    )));

    // slice2 only repeats an address slice1 already contributes
    assert_eq!(reconciler.peer_table().log.len(), 2);

    let change = reconciler
        .handle_event(&EndpointChangeEvent::Deleted(payload("svcA", "slice1", &[])))
        .unwrap();
    assert_eq!(change.removed, vec![ip("10.0.0.1")]);
    assert_eq!(change.peers, vec![ip("10.0.0.2")]);
    assert!(change.deleted);

    assert_eq!(reconciler.peers(&svc_a), vec![ip("10.0.0.2")]);
    assert_eq!(reconciler.peer_table().installed, ips(&["10.0.0.2"]));
}

#[test]
fn test_services_sharing_an_address() {
    let mut reconciler = reconciler();

    reconciler.handle_event(&EndpointChangeEvent::Added(payload(
        "svcA",
        "a1",
        &["10.0.0.1"],
    )));
    reconciler.handle_event(&EndpointChangeEvent::Added(payload(
        "svcB",
        "b1",
        &["10.0.0.1", "10.0.0.2"],
    )));
    reconciler.handle_event(&EndpointChangeEvent::Deleted(payload("svcB", "b1", &[])));

    assert_eq!(reconciler.peer_table().installed, ips(&["10.0.0.1"]));
    assert_eq!(
        reconciler.peer_table().log,
        vec!["add 10.0.0.1", "add 10.0.0.2", "remove 10.0.0.2"]
    );
}

#[test]
fn test_unwatched_events_change_nothing() {
    let mut reconciler = reconciler();

    let event = EndpointChangeEvent::Added(SliceChange {
        service: ServiceIdentity::new("other", "svcA"),
        slice: SliceKey::new("other/slice1"),
        addresses: vec!["10.0.0.1".to_string()],
    });
    assert!(reconciler.handle_event(&event).is_none());
    assert!(reconciler.peer_table().log.is_empty());
}
