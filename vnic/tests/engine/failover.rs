use std::time::Duration;

use vnic::{IocBehavior, NetpathKind, UpstreamEvent};

use super::helpers::{IOC, carrier, eventually, path_to, rig, test_config};

#[tokio::test]
async fn test_both_netpaths_connect_on_distinct_ports() {
    let r = rig(2, IocBehavior::default(), test_config(true));
    let host = r.interface(0, 0);
    r.add_paths();
    let a = &host.adapter;
    eventually("both netpaths connected", || {
        a.netpath_connected(NetpathKind::Primary) && a.netpath_connected(NetpathKind::Secondary)
    })
    .await;
    assert!(a.current_path().is_some());
    let p = a.netpath_path(NetpathKind::Primary).unwrap();
    let s = a.netpath_path(NetpathKind::Secondary).unwrap();
    assert_ne!(p.dest_gid, s.dest_gid);
    assert_eq!(r.ioc.session_count(), 2);
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_standby_takes_over_without_carrier_flap() {
    let r = rig(2, IocBehavior::default(), test_config(true));
    let mut host = r.interface(0, 0);
    r.add_paths();
    let a = host.adapter.clone();
    eventually("both netpaths connected", || {
        a.netpath_connected(NetpathKind::Primary) && a.netpath_connected(NetpathKind::Secondary)
    })
    .await;
    carrier(&a, true).await;
    host.take_events();
    let active = a.current_path().unwrap();
    let standby = active.other();
    let active_port = a.netpath_path(active).unwrap().dest_gid;
    let mut carrier_rx = a.subscribe_carrier();
    carrier_rx.borrow_and_update();

    r.fabric.fail_port(active_port);
    eventually("standby current", || a.current_path() == Some(standby))
    .await;
    assert!(a.carrier());
    assert!(!carrier_rx.has_changed().unwrap());
    for ev in host.take_events() {
        if let UpstreamEvent::Link(link) = ev {
            assert!(link.up, "carrier dropped during failover");
        }
    }

    // traffic flows on the new current netpath
    let before = r.ioc.received_frames().len();
    a.transmit(vnic::TxFrame::new(1, super::helpers::frame(1, 64)))
        .unwrap();
    eventually("frame over standby", || {
        r.ioc.received_frames().len() == before + 1
    })
    .await;

    // the recovered port refills the failed slot without failing back
    r.fabric.restore_port(active_port);
    eventually("failed netpath reconnected", || a.netpath_connected(active)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.current_path(), Some(standby));
    assert!(a.carrier());
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_single_netpath_moves_to_another_path() {
    let r = rig(2, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    let a = &host.adapter;
    carrier(a, true).await;
    let first = a.netpath_path(NetpathKind::Primary).unwrap().dest_gid;

    r.fabric.fail_port(first);
    carrier(a, false).await;
    carrier(a, true).await;
    let second = a.netpath_path(NetpathKind::Primary).unwrap().dest_gid;
    assert_ne!(first, second);
    assert!(a.netpath_path(NetpathKind::Secondary).is_none());
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_removed_path_reconnects_immediately() {
    let r = rig(2, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    let a = &host.adapter;
    carrier(a, true).await;
    let first = a.netpath_path(NetpathKind::Primary).unwrap();

    assert_eq!(r.driver.path_removed(IOC, first.key()), 1);
    // the replacement viport is started before path_removed returns
    let next = a.netpath_path(NetpathKind::Primary).unwrap();
    assert_ne!(next.key(), first.key());
    assert_eq!(a.known_paths().len(), 1);
    carrier(a, true).await;

    // removing an unknown path is a no-op
    assert_eq!(r.driver.path_removed(IOC, first.key()), 0);
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_late_path_fills_empty_secondary() {
    let r = rig(2, IocBehavior::default(), test_config(true));
    let host = r.interface(0, 0);
    let a = &host.adapter;
    r.driver.path_added(path_to(r.ports[0]));
    carrier(a, true).await;
    assert!(a.netpath_path(NetpathKind::Secondary).is_none());

    r.driver.path_added(path_to(r.ports[1]));
    eventually("secondary connected", || {
        a.netpath_connected(NetpathKind::Secondary)
    })
    .await;
    assert_eq!(a.current_path(), Some(NetpathKind::Primary));
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_destroyed_interface_releases_sessions() {
    let r = rig(2, IocBehavior::default(), test_config(true));
    let host = r.interface(0, 0);
    r.add_paths();
    eventually("two sessions", || r.ioc.session_count() == 2).await;

    r.driver.destroy_interface(host.adapter.id()).await.unwrap();
    assert!(!host.adapter.carrier());
    assert!(host.adapter.current_path().is_none());
    eventually("sessions closed", || r.ioc.session_count() == 0).await;
    assert!(matches!(
        host.adapter.transmit(vnic::TxFrame::new(1, vec![0; 64])),
        Err(vnic::VnicError::ShutDown)
    ));
}
