mod engine {
    pub mod helpers;

    mod address_sync;
    mod bringup;
    mod bundle;
    mod datapath;
    mod failover;
}
