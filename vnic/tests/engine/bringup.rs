use vnic::protocol::{Command, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use vnic::viport::TeardownReason;
use vnic::{IocBehavior, MacAddress, UpstreamEvent};

use super::helpers::{carrier, eventually, rig, test_config, viport, viport_down};

fn without_heartbeats(cmds: Vec<Command>) -> Vec<Command> {
    cmds.into_iter().filter(|c| *c != Command::Heartbeat).collect()
}

#[tokio::test]
async fn test_bring_up_runs_commands_in_order() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let mut host = r.interface(0, 0);
    r.add_paths();
    carrier(&host.adapter, true).await;

    let cmds = without_heartbeats(r.ioc.commands());
    assert_eq!(
        &cmds[..3],
        &[Command::InitVnic, Command::ConfigDataPath, Command::ExchangePools]
    );
    assert!(cmds[3..].contains(&Command::ConfigLink));
    assert!(cmds[3..].contains(&Command::ConfigAddresses));

    let ev = host.next_event(|e| matches!(e, UpstreamEvent::Link(_))).await;
    let UpstreamEvent::Link(link) = ev else {
        unreachable!()
    };
    assert!(link.up);
    assert_eq!(link.mtu, 1500);
    assert_eq!(link.mac, IocBehavior::default().mac);

    // broadcast and unicast only
    let addrs = r.ioc.addresses();
    assert_eq!(addrs.len(), 2);
    assert!(addrs.iter().any(|a| a.mac == MacAddress::BROADCAST));
    assert_eq!(r.ioc.session_count(), 1);
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_version_mismatch_fails_after_init() {
    let r = rig(
        1,
        IocBehavior {
            version: (PROTOCOL_MAJOR + 1, PROTOCOL_MINOR),
            ..Default::default()
        },
        test_config(false),
    );
    let (_v, mut notices) = viport(&r.fabric, test_config(false), r.ports[0]);
    let (reason, error) = viport_down(&mut notices).await;
    assert_eq!(reason, TeardownReason::Failed);
    assert!(error.unwrap().contains("version mismatch"));
    assert_eq!(r.ioc.commands(), vec![Command::InitVnic]);
}

#[tokio::test]
async fn test_older_minor_version_rejected() {
    let r = rig(
        1,
        IocBehavior {
            version: (PROTOCOL_MAJOR, PROTOCOL_MINOR - 1),
            ..Default::default()
        },
        test_config(false),
    );
    let (_v, mut notices) = viport(&r.fabric, test_config(false), r.ports[0]);
    let (_, error) = viport_down(&mut notices).await;
    assert!(error.unwrap().contains("version mismatch"));
}

#[tokio::test(start_paused = true)]
async fn test_silent_controller_times_out_after_retries() {
    let mut behavior = IocBehavior::default();
    behavior.silent.insert(Command::InitVnic);
    let r = rig(1, behavior, test_config(false));
    let (_v, mut notices) = viport(&r.fabric, test_config(false), r.ports[0]);
    let (reason, error) = viport_down(&mut notices).await;
    assert_eq!(reason, TeardownReason::Failed);
    assert_eq!(error.as_deref(), Some("InitVnic timed out after 2 retries"));
    // first send plus one per retry
    assert_eq!(r.ioc.commands(), vec![Command::InitVnic; 3]);
}

#[tokio::test]
async fn test_mismatched_response_fails_viport() {
    let mut behavior = IocBehavior::default();
    behavior.mismatch.insert(Command::ConfigDataPath);
    let r = rig(1, behavior, test_config(false));
    let (_v, mut notices) = viport(&r.fabric, test_config(false), r.ports[0]);
    let (_, error) = viport_down(&mut notices).await;
    assert_eq!(
        error.as_deref(),
        Some("unexpected response: expected ConfigDataPath, got Heartbeat")
    );
    assert_eq!(
        r.ioc.commands(),
        vec![Command::InitVnic, Command::ConfigDataPath]
    );
}

#[tokio::test]
async fn test_error_packet_fails_viport() {
    let mut behavior = IocBehavior::default();
    behavior.error_packet.insert(Command::ExchangePools);
    let r = rig(1, behavior, test_config(false));
    let (_v, mut notices) = viport(&r.fabric, test_config(false), r.ports[0]);
    let (_, error) = viport_down(&mut notices).await;
    assert_eq!(
        error.as_deref(),
        Some("peer returned an error packet for ExchangePools")
    );
}

#[tokio::test]
async fn test_multiple_data_paths_refused() {
    let r = rig(
        1,
        IocBehavior {
            num_data_paths: Some(2),
            ..Default::default()
        },
        test_config(false),
    );
    let (_v, mut notices) = viport(&r.fabric, test_config(false), r.ports[0]);
    let (reason, error) = viport_down(&mut notices).await;
    assert_eq!(reason, TeardownReason::Failed);
    assert!(error.is_some());
    assert_eq!(r.ioc.commands(), vec![Command::InitVnic]);
}

#[tokio::test]
async fn test_rejected_control_connection() {
    let r = rig(
        1,
        IocBehavior {
            reject_control: true,
            ..Default::default()
        },
        test_config(false),
    );
    let (_v, mut notices) = viport(&r.fabric, test_config(false), r.ports[0]);
    let (_, error) = viport_down(&mut notices).await;
    assert!(error.unwrap().starts_with("connection rejected by peer"));
    assert!(r.ioc.commands().is_empty());
}

#[tokio::test]
async fn test_rejected_data_connection() {
    let r = rig(
        1,
        IocBehavior {
            reject_data: true,
            ..Default::default()
        },
        test_config(false),
    );
    let (_v, mut notices) = viport(&r.fabric, test_config(false), r.ports[0]);
    let (_, error) = viport_down(&mut notices).await;
    assert!(error.unwrap().starts_with("connection rejected by peer"));
    assert!(!r.ioc.commands().contains(&Command::ExchangePools));
}

#[tokio::test]
async fn test_adapter_retries_until_controller_accepts() {
    let r = rig(
        1,
        IocBehavior {
            reject_control: true,
            ..Default::default()
        },
        test_config(false),
    );
    let host = r.interface(0, 0);
    r.add_paths();
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert!(!host.adapter.carrier());

    r.ioc.set_behavior(|b| b.reject_control = false);
    carrier(&host.adapter, true).await;
    eventually("one live session", || r.ioc.session_count() == 1).await;
    r.driver.shutdown().await;
}
