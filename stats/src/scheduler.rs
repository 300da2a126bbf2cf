use super::mem::PerKind;
use serde::{Deserialize, Serialize};

/// Admission and arbitration counters of one channel scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduler {
    pub admitted: PerKind,
    pub rejected: PerKind,
    pub issued: PerKind,
    pub completed: PerKind,
    pub delivered: PerKind,
    pub cancelled: u64,
    /// Number of times the channel entered write drain mode
    pub write_drain_switches: u64,
    /// Cycles in which nothing was queued
    pub idle_cycles: u64,
    /// Cycles in which requests were queued but none could issue
    pub stall_cycles: u64,
    pub stall_bank_busy: u64,
    pub stall_resp_full: u64,
    pub stall_device_busy: u64,
    pub retries_signalled: u64,
    /// Sum of cycles between admission and issue
    pub queue_cycles: u64,
    /// Sum of cycles between issue and completion
    pub service_cycles: u64,
}

impl std::ops::AddAssign for Scheduler {
    fn add_assign(&mut self, other: Self) {
        self.admitted += other.admitted;
        self.rejected += other.rejected;
        self.issued += other.issued;
        self.completed += other.completed;
        self.delivered += other.delivered;
        self.cancelled += other.cancelled;
        self.write_drain_switches += other.write_drain_switches;
        self.idle_cycles += other.idle_cycles;
        self.stall_cycles += other.stall_cycles;
        self.stall_bank_busy += other.stall_bank_busy;
        self.stall_resp_full += other.stall_resp_full;
        self.stall_device_busy += other.stall_device_busy;
        self.retries_signalled += other.retries_signalled;
        self.queue_cycles += other.queue_cycles;
        self.service_cycles += other.service_cycles;
    }
}

impl Scheduler {
    #[must_use]
    pub fn avg_queue_cycles(&self) -> Option<f64> {
        let issued = self.issued.total();
        (issued > 0).then(|| self.queue_cycles as f64 / issued as f64)
    }

    #[must_use]
    pub fn avg_service_cycles(&self) -> Option<f64> {
        let completed = self.completed.total();
        (completed > 0).then(|| self.service_cycles as f64 / completed as f64)
    }
}
