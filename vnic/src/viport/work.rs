use std::sync::atomic::{AtomicU32, Ordering};

use crate::protocol::Command;

/// Steady-state work a viport performs one request at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    Reset,
    ConfigLink,
    ConfigAddresses,
    Statistics,
    Heartbeat,
}

impl WorkItem {
    /// Drain order: earlier items go first.
    const ALL: [WorkItem; 5] = [
        WorkItem::Reset,
        WorkItem::ConfigLink,
        WorkItem::ConfigAddresses,
        WorkItem::Statistics,
        WorkItem::Heartbeat,
    ];

    const fn bit(self) -> u32 {
        match self {
            WorkItem::Reset => 1 << 0,
            WorkItem::ConfigLink => 1 << 1,
            WorkItem::ConfigAddresses => 1 << 2,
            WorkItem::Statistics => 1 << 3,
            WorkItem::Heartbeat => 1 << 4,
        }
    }

    pub const fn command(self) -> Command {
        match self {
            WorkItem::Reset => Command::Reset,
            WorkItem::ConfigLink => Command::ConfigLink,
            WorkItem::ConfigAddresses => Command::ConfigAddresses,
            WorkItem::Statistics => Command::ReportStatistics,
            WorkItem::Heartbeat => Command::Heartbeat,
        }
    }

    pub fn from_command(cmd: Command) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.command() == cmd)
    }
}

/// Pending-work bitmask. Any thread may add work; the viport task drains
/// it one item at a time.
#[derive(Debug, Default)]
pub struct PendingWork(AtomicU32);

impl PendingWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, item: WorkItem) {
        self.0.fetch_or(item.bit(), Ordering::AcqRel);
    }

    pub fn is_pending(&self, item: WorkItem) -> bool {
        self.0.load(Ordering::Acquire) & item.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    /// Remove and return the highest-priority pending item.
    pub fn take_next(&self) -> Option<WorkItem> {
        let mut taken = None;
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                taken = WorkItem::ALL.into_iter().find(|w| bits & w.bit() != 0);
                taken.map(|w| bits & !w.bit())
            });
        taken
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}
