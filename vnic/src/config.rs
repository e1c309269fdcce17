//! Runtime-configurable tuning parameters for the vnic engine.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `VNIC_`) or by constructing a custom `VnicConfig`.

use std::time::Duration;

use crate::control::params::{ParamBounds, PoolBounds};
use crate::error::{Result, VnicError};
use crate::protocol::PoolParams;
use crate::protocol::trailer::{BUFFER_ALIGNMENT, TRAILER_SIZE, align_up};

/// Ethernet header plus one VLAN tag.
const ETH_OVERHEAD: usize = 14 + 4;

pub const MIN_MTU: u16 = 68;
pub const MAX_MTU: u16 = 9500;

/// Buffer size needed to carry a frame of `mtu` payload bytes.
pub const fn buffer_size(mtu: u16) -> u32 {
    (align_up(mtu as usize + ETH_OVERHEAD, BUFFER_ALIGNMENT) + TRAILER_SIZE) as u32
}

/// Control-channel tunables.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// How long to wait for a response before retransmitting.
    pub response_timeout: Duration,
    /// Retransmissions before the channel is declared failed.
    pub max_retries: u32,
    /// Receive buffers kept posted on the control connection.
    pub recv_buffers: u32,
    /// Smallest address table the controller may grant.
    pub min_address_entries: u16,
    /// Address table size requested from the controller.
    pub max_address_entries: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(1),
            max_retries: 3,
            recv_buffers: 4,
            min_address_entries: 16,
            max_address_entries: 64,
        }
    }
}

/// Data-channel pool proposals and the bounds responses are held to.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Proposal for the pool the controller writes received frames into.
    pub host_pool: PoolParams,
    pub host_bounds: PoolBounds,
    /// Proposal for the pool the host writes transmitted frames into.
    pub ioc_pool: PoolParams,
    pub ioc_bounds: PoolBounds,
    /// Local staging buffers for frames in flight to the controller.
    pub xmit_buffers: u32,
    /// Receives kept posted for kick messages from the controller.
    pub kick_recvs: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        let entry_size = buffer_size(1500);
        let size_bounds = ParamBounds::new(buffer_size(MIN_MTU), buffer_size(MAX_MTU));
        Self {
            host_pool: PoolParams {
                entry_size,
                entry_count: 512,
                kick_timeout_us: 100,
                kick_entries: 16,
                kick_bytes: 16 * 1024,
                free_per_update: 8,
            },
            host_bounds: PoolBounds {
                entry_size: size_bounds,
                entry_count: ParamBounds::new(64, 4096),
                kick_timeout_us: ParamBounds::new(10, 1000),
                kick_entries: ParamBounds::new(1, 64),
                kick_bytes: ParamBounds::new(0, 1 << 20),
                free_per_update: ParamBounds::new(1, 64),
            },
            ioc_pool: PoolParams {
                entry_size,
                entry_count: 256,
                kick_timeout_us: 100,
                kick_entries: 16,
                kick_bytes: 16 * 1024,
                free_per_update: 8,
            },
            ioc_bounds: PoolBounds {
                entry_size: size_bounds,
                entry_count: ParamBounds::new(16, 4096),
                kick_timeout_us: ParamBounds::new(10, 1000),
                kick_entries: ParamBounds::new(1, 64),
                kick_bytes: ParamBounds::new(0, 1 << 20),
                free_per_update: ParamBounds::new(1, 64),
            },
            xmit_buffers: 256,
            kick_recvs: 16,
        }
    }
}

/// Per-viport supervision.
#[derive(Debug, Clone)]
pub struct ViportConfig {
    pub heartbeat_interval: Duration,
    /// Timeout the controller is asked to apply to our heartbeats.
    pub heartbeat_timeout: Duration,
    /// Periodic statistics refresh; `None` disables it.
    pub stats_interval: Option<Duration>,
    /// Bound on a synchronous statistics query.
    pub stats_query_timeout: Duration,
    /// Name sent in connection private data.
    pub node_name: String,
}

impl Default for ViportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(20),
            stats_interval: None,
            stats_query_timeout: Duration::from_secs(5),
            node_name: "vnic-host".to_string(),
        }
    }
}

/// Adapter and failover behaviour.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub mtu: u16,
    /// Keep a standby viport on a second path.
    pub secondary_path: bool,
    /// Delay before reconnecting after a viport failure.
    pub reconnect_delay: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            secondary_path: true,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Tuning parameters for the whole engine.
#[derive(Debug, Clone, Default)]
pub struct VnicConfig {
    pub control: ControlConfig,
    pub data: DataConfig,
    pub viport: ViportConfig,
    pub adapter: AdapterConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl VnicConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `VNIC_CONTROL_TIMEOUT_MS`
    /// - `VNIC_CONTROL_RETRIES`
    /// - `VNIC_HEARTBEAT_INTERVAL_MS`
    /// - `VNIC_HEARTBEAT_TIMEOUT_MS`
    /// - `VNIC_STATS_INTERVAL_MS` (0 disables)
    /// - `VNIC_MTU`
    /// - `VNIC_SECONDARY_PATH` (`0`/`1`/`true`/`false`)
    /// - `VNIC_RECONNECT_DELAY_MS`
    /// - `VNIC_HOST_RECV_BUFFERS`
    /// - `VNIC_XMIT_BUFFERS`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = env_parse::<u64>("VNIC_CONTROL_TIMEOUT_MS") {
            cfg.control.response_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("VNIC_CONTROL_RETRIES") {
            cfg.control.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("VNIC_HEARTBEAT_INTERVAL_MS") {
            cfg.viport.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("VNIC_HEARTBEAT_TIMEOUT_MS") {
            cfg.viport.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("VNIC_STATS_INTERVAL_MS") {
            cfg.viport.stats_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(mtu) = env_parse::<u16>("VNIC_MTU") {
            cfg.set_mtu(mtu);
        }
        if let Ok(v) = std::env::var("VNIC_SECONDARY_PATH") {
            match v.as_str() {
                "1" | "true" | "yes" => cfg.adapter.secondary_path = true,
                "0" | "false" | "no" => cfg.adapter.secondary_path = false,
                _ => {}
            }
        }
        if let Some(ms) = env_parse::<u64>("VNIC_RECONNECT_DELAY_MS") {
            cfg.adapter.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("VNIC_HOST_RECV_BUFFERS") {
            cfg.data.host_pool.entry_count = n;
        }
        if let Some(n) = env_parse::<u32>("VNIC_XMIT_BUFFERS") {
            cfg.data.xmit_buffers = n;
        }

        cfg
    }

    /// Set the MTU and size both pools' buffers to carry it.
    pub fn set_mtu(&mut self, mtu: u16) {
        self.adapter.mtu = mtu;
        self.data.host_pool.entry_size = buffer_size(mtu);
        self.data.ioc_pool.entry_size = buffer_size(mtu);
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.control.max_retries == 0 {
            return Err(VnicError::Config("control retry limit must be non-zero".into()));
        }
        // the retry count travels in a one-byte header field
        if self.control.max_retries > u32::from(u8::MAX) {
            return Err(VnicError::Config(format!(
                "control retry limit {} exceeds {}",
                self.control.max_retries,
                u8::MAX
            )));
        }
        if self.control.response_timeout.is_zero() {
            return Err(VnicError::Config("control response timeout must be non-zero".into()));
        }
        if self.control.recv_buffers == 0 {
            return Err(VnicError::Config("control receive buffers must be non-zero".into()));
        }
        if self.control.min_address_entries > self.control.max_address_entries {
            return Err(VnicError::Config(format!(
                "address entries: min {} exceeds max {}",
                self.control.min_address_entries, self.control.max_address_entries
            )));
        }
        // broadcast and unicast take the first two slots
        if self.control.min_address_entries < 2 {
            return Err(VnicError::Config("address table needs at least 2 entries".into()));
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.adapter.mtu) {
            return Err(VnicError::Config(format!(
                "mtu {} outside [{MIN_MTU}, {MAX_MTU}]",
                self.adapter.mtu
            )));
        }
        self.data.host_bounds.validate("host")?;
        self.data.ioc_bounds.validate("ioc")?;
        let needed = buffer_size(self.adapter.mtu);
        for (name, pool, bounds) in [
            ("host", &self.data.host_pool, &self.data.host_bounds),
            ("ioc", &self.data.ioc_pool, &self.data.ioc_bounds),
        ] {
            if bounds.entry_size.max < needed {
                return Err(VnicError::Config(format!(
                    "{name} pool: mtu {} needs {needed}-byte buffers, max is {}",
                    self.adapter.mtu, bounds.entry_size.max
                )));
            }
            if pool.entry_size < needed {
                return Err(VnicError::Config(format!(
                    "{name} pool: proposed entry size {} below {needed} needed for mtu {}",
                    pool.entry_size, self.adapter.mtu
                )));
            }
            if pool.entry_count == 0 || pool.free_per_update == 0 {
                return Err(VnicError::Config(format!(
                    "{name} pool: buffer counts must be non-zero"
                )));
            }
        }
        if self.data.xmit_buffers == 0 || self.data.kick_recvs == 0 {
            return Err(VnicError::Config("data channel buffer counts must be non-zero".into()));
        }
        Ok(())
    }
}
