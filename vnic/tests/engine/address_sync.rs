use vnic::protocol::{Command, ControlRequest, LinkFlags};
use vnic::{IocBehavior, MacAddress, PacketFilter, UpstreamEvent};

use super::helpers::{carrier, eventually, frame, rig, test_config};

fn group(i: u8) -> MacAddress {
    MacAddress([0x01, 0x00, 0x5e, 0x00, 0x01, i])
}

fn link_flags(r: &super::helpers::Rig) -> LinkFlags {
    r.ioc.last_link().expect("no link configured").flags
}

#[tokio::test]
async fn test_multicast_list_synced_in_batches() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;
    eventually("initial table", || r.ioc.addresses().len() == 2).await;
    r.ioc.clear_requests();

    let list: Vec<MacAddress> = (0..40).map(group).collect();
    host.adapter.set_multicast_list(list.clone());
    eventually("40 groups installed", || r.ioc.addresses().len() == 42).await;

    let batches: Vec<usize> = r
        .ioc
        .requests()
        .into_iter()
        .filter_map(|req| match req {
            ControlRequest::ConfigAddresses(c) => Some(c.ops.len()),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![16, 16, 8]);
    let installed: Vec<MacAddress> = r.ioc.addresses().iter().map(|a| a.mac).collect();
    for mac in &list {
        assert!(installed.contains(mac), "{mac} missing");
    }
    assert!(!link_flags(&r).contains(LinkFlags::ENABLE_MCAST_ALL));
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_shrinking_list_withdraws_entries() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    host.adapter.set_multicast_list((0..10).map(group).collect());
    eventually("10 groups installed", || r.ioc.addresses().len() == 12).await;
    host.adapter.set_multicast_list(vec![group(3)]);
    eventually("one group left", || r.ioc.addresses().len() == 3).await;
    assert!(r.ioc.addresses().iter().any(|a| a.mac == group(3)));
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_overflow_falls_back_to_all_multicast() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    host.adapter.set_multicast_list((0..40).map(group).collect());
    eventually("40 groups installed", || r.ioc.addresses().len() == 42).await;

    // 64 entries leave room for 62 groups
    host.adapter.set_multicast_list((0..70).map(group).collect());
    eventually("groups withdrawn", || r.ioc.addresses().len() == 2).await;
    eventually("all-multicast enabled", || {
        link_flags(&r).contains(LinkFlags::ENABLE_MCAST_ALL)
    })
    .await;

    host.adapter.set_multicast_list((0..4).map(group).collect());
    eventually("exact filtering restored", || {
        r.ioc.addresses().len() == 6 && link_flags(&r).contains(LinkFlags::DISABLE_MCAST_ALL)
    })
    .await;
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_table_resynced_after_reconnect() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;
    host.adapter.set_multicast_list((0..5).map(group).collect());
    eventually("5 groups installed", || r.ioc.addresses().len() == 7).await;

    r.ioc.clear_requests();
    host.adapter.reset().unwrap();
    eventually("table resent", || {
        r.ioc.commands().contains(&Command::InitVnic)
            && r.ioc.commands().contains(&Command::ConfigAddresses)
    })
    .await;
    carrier(&host.adapter, true).await;
    assert_eq!(r.ioc.addresses().len(), 7);
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_packet_filter_drives_link_flags() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let mut host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;
    assert!(link_flags(&r).contains(LinkFlags::ENABLE_NIC | LinkFlags::SET_MTU));

    host.adapter.set_packet_filter(PacketFilter {
        promiscuous: true,
        ..PacketFilter::standard()
    });
    eventually("promiscuous", || {
        link_flags(&r).contains(LinkFlags::ENABLE_PROMISC)
    })
    .await;

    host.adapter.set_packet_filter(PacketFilter::default());
    eventually("nic disabled", || {
        link_flags(&r).contains(LinkFlags::DISABLE_NIC)
    })
    .await;

    // a disabled filter keeps frames from reaching the stack
    host.take_events();
    assert_eq!(r.ioc.inject(&frame(1, 64)).unwrap(), 1);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(
        !host
            .take_events()
            .iter()
            .any(|e| matches!(e, UpstreamEvent::Receive(_)))
    );
    r.driver.shutdown().await;
}
