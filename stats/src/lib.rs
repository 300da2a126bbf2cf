#![allow(non_camel_case_types, clippy::upper_case_acronyms)]

pub mod dram;
pub mod mem;
pub mod scheduler;

pub use dram::DRAM;
pub use mem::{AccessKind, PerKind};
pub use scheduler::Scheduler;

use serde::{Deserialize, Serialize};

/// Statistics of a single channel.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: usize,
    pub scheduler: Scheduler,
    pub dram: DRAM,
}

impl Channel {
    #[must_use]
    pub fn new(channel_id: usize, num_banks: usize) -> Self {
        Self {
            channel_id,
            scheduler: Scheduler::default(),
            dram: DRAM::new(num_banks),
        }
    }
}

impl std::ops::AddAssign for Channel {
    fn add_assign(&mut self, other: Self) {
        self.scheduler += other.scheduler;
        self.dram += other.dram;
    }
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub cycles: u64,
    pub channels: Vec<Channel>,
}

impl Stats {
    #[must_use]
    pub fn new(num_channels: usize, num_banks: usize) -> Self {
        Self {
            cycles: 0,
            channels: (0..num_channels)
                .map(|channel_id| Channel::new(channel_id, num_banks))
                .collect(),
        }
    }

    /// Sum over all channels.
    #[must_use]
    pub fn reduce(&self) -> Channel {
        let num_banks = self.channels.first().map_or(0, |c| c.dram.num_banks);
        let mut total = Channel::new(0, num_banks);
        for channel in &self.channels {
            total += channel.clone();
        }
        total
    }
}
