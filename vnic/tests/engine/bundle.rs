use vnic::{BundleRole, EmulatedIoc, IocBehavior};

use super::helpers::{carrier, eventually, rig, test_config};

const BUNDLE: u32 = 9;

#[tokio::test]
async fn test_bundle_secondary_takes_over() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let ioc_b = EmulatedIoc::start(&r.fabric, &r.ports, 1, IocBehavior::default()).unwrap();
    let a = r.interface(0, BUNDLE).adapter;
    r.add_paths();
    carrier(&a, true).await;
    // joins after the primary is healthy and picks up the known path
    let b = r.interface(1, BUNDLE).adapter;
    let healthy = b.subscribe_healthy();
    eventually("standby healthy", || *healthy.borrow()).await;
    assert_eq!(a.role(), BundleRole::Primary);
    assert_eq!(b.role(), BundleRole::Secondary);
    assert!(!b.carrier());
    assert_eq!(r.driver.registry().primary(BUNDLE), Some(a.id()));
    assert_eq!(ioc_b.session_count(), 1);

    r.ioc.set_behavior(|x| x.reject_control = true);
    r.ioc.disconnect_all();
    carrier(&b, true).await;
    assert_eq!(r.driver.registry().primary(BUNDLE), Some(b.id()));
    assert_eq!(a.role(), BundleRole::Secondary);
    assert!(!a.carrier());

    // the recovered member stays standby
    r.ioc.set_behavior(|x| x.reject_control = false);
    let healthy = a.subscribe_healthy();
    eventually("former primary healthy", || *healthy.borrow()).await;
    assert_eq!(b.role(), BundleRole::Primary);
    assert!(!a.carrier());
    r.driver.shutdown().await;
}

#[tokio::test]
async fn test_unbundled_interfaces_are_independent() {
    let r = rig(1, IocBehavior::default(), test_config(false));
    let _ioc_b = EmulatedIoc::start(&r.fabric, &r.ports, 1, IocBehavior::default()).unwrap();
    let a = r.interface(0, 0).adapter;
    let b = r.interface(1, 0).adapter;
    r.add_paths();
    carrier(&a, true).await;
    carrier(&b, true).await;
    assert_eq!(a.role(), BundleRole::Unbundled);
    assert_eq!(b.role(), BundleRole::Unbundled);
    r.driver.shutdown().await;
}
