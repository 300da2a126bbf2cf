use super::mem::AccessKind;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum::EnumCount;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccessesRow {
    /// Channel ID
    pub channel_id: usize,
    /// Bank ID
    pub bank_id: usize,
    /// Access kind
    pub access_kind: AccessKind,
    /// Number of accesses
    pub num_accesses: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowOutcome {
    Hit,
    Miss,
    Conflict,
}

/// Row buffer outcomes observed when issuing to a bank.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBuffer {
    /// Target row was already open
    pub hits: u64,
    /// Bank was closed (activate only)
    pub misses: u64,
    /// Another row was open (precharge + activate)
    pub conflicts: u64,
}

impl RowBuffer {
    pub fn inc(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Hit => self.hits += 1,
            RowOutcome::Miss => self.misses += 1,
            RowOutcome::Conflict => self.conflicts += 1,
        }
    }

    #[must_use]
    pub fn accesses(&self) -> u64 {
        self.hits + self.misses + self.conflicts
    }

    #[must_use]
    pub fn hit_rate(&self) -> Option<f64> {
        let accesses = self.accesses();
        if accesses == 0 {
            None
        } else {
            Some(self.hits as f64 / accesses as f64)
        }
    }
}

impl std::ops::AddAssign for RowBuffer {
    fn add_assign(&mut self, other: Self) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.conflicts += other.conflicts;
    }
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DRAM {
    /// Bank accesses (bank x access kind)
    pub bank_accesses: ndarray::Array2<u64>,
    /// Row buffer outcomes
    pub row_buffer: RowBuffer,
    /// Number of banks
    pub num_banks: usize,
}

impl std::ops::AddAssign for DRAM {
    fn add_assign(&mut self, other: Self) {
        assert_eq!(self.num_banks, other.num_banks);
        self.bank_accesses += &other.bank_accesses;
        self.row_buffer += other.row_buffer;
    }
}

impl DRAM {
    #[must_use]
    pub fn new(num_banks: usize) -> Self {
        Self {
            bank_accesses: ndarray::Array2::zeros((num_banks, AccessKind::COUNT)),
            row_buffer: RowBuffer::default(),
            num_banks,
        }
    }

    pub fn inc_bank_access(&mut self, bank: usize, kind: AccessKind) {
        self.bank_accesses[[bank, kind as usize]] += 1;
    }

    #[must_use]
    pub fn bank_accesses_rows(&self, channel_id: usize, full: bool) -> Vec<BankAccessesRow> {
        let mut out = Vec::new();
        for ((bank_id, access_kind), num_accesses) in self.bank_accesses.indexed_iter() {
            if !full && *num_accesses < 1 {
                continue;
            }
            let Some(access_kind) = AccessKind::from_repr(access_kind) else {
                continue;
            };
            out.push(BankAccessesRow {
                channel_id,
                bank_id,
                access_kind,
                num_accesses: *num_accesses,
            });
        }
        out
    }

    #[must_use]
    pub fn total_reads(&self) -> u64 {
        AccessKind::reads()
            .map(|kind| self.bank_accesses.slice(s![.., kind as usize]).sum())
            .sum()
    }

    #[must_use]
    pub fn total_writes(&self) -> u64 {
        AccessKind::writes()
            .map(|kind| self.bank_accesses.slice(s![.., kind as usize]).sum())
            .sum()
    }
}
