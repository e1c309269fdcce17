use vnic::protocol::trailer::{rx_csum, tx_csum};
use vnic::protocol::{Command, IocStatistics, StatusReport, status};
use vnic::{
    IocBehavior, OffloadCaps, SendStatus, TransmitOutcome, TxChecksum, TxFrame, UpstreamEvent,
};

use super::helpers::{carrier, eventually, frame, rig, test_config};

#[tokio::test]
async fn test_transmit_reaches_controller() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let mut host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    let data = frame(7, 100);
    let out = host.adapter.transmit(TxFrame::new(7, data.clone())).unwrap();
    assert_eq!(out, TransmitOutcome::Queued);

    eventually("frame at controller", || r.ioc.received_frames().len() == 1).await;
    let got = &r.ioc.received_frames()[0];
    assert_eq!(got.data, data);
    assert_eq!(got.dest_mac.0, [0x02, 0, 0, 0, 0, 0x99]);
    assert_eq!(got.vlan, None);

    let ev = host
        .next_event(|e| matches!(e, UpstreamEvent::SendComplete(..)))
        .await;
    assert!(matches!(ev, UpstreamEvent::SendComplete(7, SendStatus::Success)));
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_vlan_tag_carried_in_trailer() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    let mut f = TxFrame::new(1, frame(1, 80));
    f.vlan = Some(42);
    host.adapter.transmit(f).unwrap();
    eventually("frame at controller", || r.ioc.received_frames().len() == 1).await;
    assert_eq!(r.ioc.received_frames()[0].vlan, Some(42));
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_injected_frame_delivered_upstream() {
    let r = rig(
        1,
        IocBehavior {
            rx_csum_flags: rx_csum::IP_OK | rx_csum::TCP_OK,
            ..Default::default()
        },
        test_config(false),
    );
    let mut host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    let data = frame(3, 60);
    assert_eq!(r.ioc.inject(&data).unwrap(), 1);
    let ev = host
        .next_event(|e| matches!(e, UpstreamEvent::Receive(_)))
        .await;
    let UpstreamEvent::Receive(frames) = ev else {
        unreachable!()
    };
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data(), &data[..]);
    let csum = frames[0].checksum();
    assert!(csum.ip_ok && csum.tcp_ok);
    assert!(!csum.failed);
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_receive_ring_recycles_buffers() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let mut host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    // more frames than the host ring holds, released as they arrive
    let mut received = 0;
    for i in 0..150u64 {
        let data = frame(i, 64);
        let mut waits = 0;
        while r.ioc.inject(&data).unwrap() == 0 {
            waits += 1;
            assert!(waits < 5000, "host never returned a receive buffer");
            for ev in host.take_events() {
                if let UpstreamEvent::Receive(frames) = ev {
                    received += frames.len();
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
    while received < 150 {
        let ev = host
            .next_event(|e| matches!(e, UpstreamEvent::Receive(_)))
            .await;
        if let UpstreamEvent::Receive(frames) = ev {
            received += frames.len();
        }
    }
    assert_eq!(received, 150);
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_exhaustion_then_resume() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let mut host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;
    r.ioc.set_behavior(|b| b.hold_xmit_buffers = true);

    // the controller advertised 16 buffers and returns none of them
    for id in 1..=16 {
        let out = host.adapter.transmit(TxFrame::new(id, frame(id, 64))).unwrap();
        assert_eq!(out, TransmitOutcome::Queued, "frame {id}");
    }
    eventually("16 frames at controller", || {
        r.ioc.received_frames().len() == 16
    })
    .await;
    match host.adapter.transmit(TxFrame::new(17, frame(17, 64))).unwrap() {
        TransmitOutcome::BufferExhausted(f) => assert_eq!(f.id, 17),
        other => panic!("expected exhaustion, got {other:?}"),
    }

    assert_eq!(r.ioc.release_xmit_buffers().unwrap(), 16);
    host.next_event(|e| matches!(e, UpstreamEvent::TransmitResumed))
        .await;
    let out = host.adapter.transmit(TxFrame::new(17, frame(17, 64))).unwrap();
    assert_eq!(out, TransmitOutcome::Queued);
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_batch_returns_unsent_tail() {
    let r = rig(
        1,
        IocBehavior {
            hold_xmit_buffers: true,
            ..Default::default()
        },
        test_config(false),
    );
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    let frames: Vec<TxFrame> = (1..=3).map(|id| TxFrame::new(id, frame(id, 64))).collect();
    let unsent = host.adapter.transmit_batch(frames).unwrap();
    assert_eq!(unsent.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_checksum_offload_negotiated_and_applied() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    let caps = host.adapter.offload_capabilities();
    assert!(caps.ipv4_tx && caps.tcp_tx && caps.udp_tx);
    assert!(caps.ipv4_rx && caps.tcp_rx && caps.udp_rx);

    let enabled = host.adapter.set_offloads(OffloadCaps {
        ipv4_tx: true,
        tcp_tx: true,
        ..Default::default()
    });
    assert!(enabled.ipv4_tx && enabled.tcp_tx && !enabled.udp_tx);

    let mut f = TxFrame::new(5, frame(5, 120));
    f.checksum = TxChecksum {
        ipv4: true,
        tcp: true,
        udp: true,
    };
    host.adapter.transmit(f).unwrap();
    eventually("frame at controller", || r.ioc.received_frames().len() == 1).await;
    assert_eq!(
        r.ioc.received_frames()[0].tx_csum_flags,
        tx_csum::IPV4 | tx_csum::TCP
    );
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_offloads_limited_by_controller_features() {
    let r = rig(
        1,
        IocBehavior {
            features: 0,
            ..Default::default()
        },
        test_config(false),
    );
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    assert_eq!(host.adapter.offload_capabilities(), OffloadCaps::default());
    let enabled = host.adapter.set_offloads(OffloadCaps {
        ipv4_tx: true,
        ..Default::default()
    });
    assert_eq!(enabled, OffloadCaps::default());
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_statistics_combine_controller_and_local_counters() {
    let r = rig(
        1,
        IocBehavior {
            stats: IocStatistics {
                in_octets: 1234,
                out_ucast_pkts: 9,
                ..Default::default()
            },
            ..Default::default()
        },
        test_config(false),
    );
    let mut host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    host.adapter.transmit(TxFrame::new(1, frame(1, 64))).unwrap();
    host.next_event(|e| matches!(e, UpstreamEvent::SendComplete(..)))
        .await;

    let stats = host.adapter.query_statistics().await.unwrap();
    assert_eq!(stats.ioc.in_octets, 1234);
    assert_eq!(stats.ioc.out_ucast_pkts, 9);
    assert_eq!(stats.data.tx_packets, 1);
    assert!(r.ioc.commands().contains(&Command::ReportStatistics));
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_reset_reconnects() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;
    r.ioc.clear_requests();

    host.adapter.reset().unwrap();
    eventually("reconnect after reset", || {
        let cmds = r.ioc.commands();
        let reset = cmds.iter().position(|c| *c == Command::Reset);
        let init = cmds.iter().rposition(|c| *c == Command::InitVnic);
        matches!((reset, init), (Some(a), Some(b)) if a < b)
    })
    .await;
    carrier(&host.adapter, true).await;
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_remote_link_status_toggles_carrier() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    r.ioc
        .send_status(StatusReport {
            status: status::LINK_DOWN,
            ..Default::default()
        })
        .unwrap();
    carrier(&host.adapter, false).await;
    // the viport stays up; only the carrier dropped
    assert!(host.adapter.netpath_connected(vnic::NetpathKind::Primary));

    r.ioc
        .send_status(StatusReport {
            status: status::LINK_UP,
            ..Default::default()
        })
        .unwrap();
    carrier(&host.adapter, true).await;
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_fatal_status_fails_viport() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;
    r.ioc.clear_requests();

    r.ioc.set_behavior(|b| b.reject_control = true);
    r.ioc
        .send_status(StatusReport {
            status: status::IOC_SHUTDOWN,
            ..Default::default()
        })
        .unwrap();
    carrier(&host.adapter, false).await;

    r.ioc.set_behavior(|b| b.reject_control = false);
    carrier(&host.adapter, true).await;
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_transmit_without_connection() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let host = r.interface(0, 0);
    assert!(matches!(
        host.adapter.transmit(TxFrame::new(1, frame(1, 64))),
        Err(vnic::VnicError::NotConnected)
    ));
    r.driver.shutdown().await;
}
