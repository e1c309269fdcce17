pub mod adapter;
pub mod bundle;
pub mod config;
pub mod control;
pub mod data;
pub mod driver;
pub mod emulated_ioc;
pub mod error;
pub mod netpath;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod upstream;
pub mod viport;

pub use adapter::Adapter;
pub use bundle::{BundleRole, FailoverRegistry};
pub use config::{AdapterConfig, ControlConfig, DataConfig, VnicConfig, ViportConfig};
pub use control::ControlChannel;
pub use data::{DataChannel, DataStatistics, ReceivedFrame};
pub use driver::{InterfaceSpec, VnicDriver};
pub use emulated_ioc::{EmulatedIoc, IocBehavior, IocFrame};
pub use error::{ErrorClass, Result, VnicError};
pub use netpath::Netpath;
pub use transport::loopback::LoopbackFabric;
pub use transport::{MemoryRegion, QueuePair, Transport};
pub use types::{
    AdapterId, FrameId, Gid, IocGuid, LinkIndication, MacAddress, NetpathKind, OffloadCaps,
    PacketFilter, PathKey, PathRecord, RxChecksum, SendStatus, TransmitOutcome, TxChecksum,
    TxFrame,
};
pub use upstream::{ChannelSink, UpstreamEvent, UpstreamSink};
pub use viport::{Viport, ViportState, ViportStatistics};
