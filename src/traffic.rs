use crate::{
    address,
    interleave::{AddressInterleaver, PhysicalAddress},
    request::{Kind, Request, RequesterId},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    /// Sequential blocks from `min_addr`, wrapping at `max_addr`
    #[default]
    Linear,
    /// Uniformly random blocks in `[min_addr, max_addr)`
    Random,
    /// Runs of sequential bursts within one row of a random bank
    Dram,
    /// Block `iteration * stride + index`, so that generators with
    /// consecutive indices interleave on neighbouring blocks
    Strided,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pattern: Pattern,
    pub min_addr: address,
    pub max_addr: address,
    pub block_size: u32,
    pub min_period: u64,
    pub max_period: u64,
    /// Percentage of reads
    pub read_percent: u8,
    /// Total number of requests to generate
    pub num_requests: usize,
    /// Consecutive bursts per row (dram pattern)
    pub num_seq_pkts: u64,
    /// Number of banks targeted (dram pattern)
    pub num_banks: u64,
    /// Blocks between consecutive requests of one generator (strided pattern)
    pub stride: u64,
    /// Block offset of the generator (strided pattern), defaults to its id
    pub index: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pattern: Pattern::Linear,
            min_addr: 0,
            max_addr: 1 << 20,
            block_size: 64,
            min_period: 1,
            max_period: 1,
            read_percent: 70,
            num_requests: 1000,
            num_seq_pkts: 4,
            num_banks: 8,
            stride: 32,
            index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    tlx: PhysicalAddress,
    kind: Kind,
    remaining: u64,
}

/// A synthetic request source.
///
/// A generator produces one request at a time. A rejected request is kept
/// and offered again once the scheduler signals a retry.
#[derive(Debug, Clone)]
pub struct Generator {
    pub id: RequesterId,
    config: Config,
    interleaver: AddressInterleaver,
    rng: StdRng,

    cursor: address,
    iteration: u64,
    run: Option<Run>,
    next_at: u64,
    generated: usize,
    stalled: Option<Request>,
    blocked: bool,
    pub completed: usize,
}

impl Generator {
    #[must_use]
    pub fn new(id: RequesterId, config: Config, interleaver: AddressInterleaver, seed: u64) -> Self {
        let rng = StdRng::seed_from_u64(seed.wrapping_add(id as u64));
        Self {
            id,
            cursor: config.min_addr,
            iteration: 0,
            config,
            interleaver,
            rng,
            run: None,
            next_at: 0,
            generated: 0,
            stalled: None,
            blocked: false,
            completed: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// All requests have been generated and admitted.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.generated >= self.config.num_requests && self.stalled.is_none()
    }

    /// All admitted requests have been answered.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.is_exhausted() && self.completed >= self.generated
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// The request to offer at `cycle`, if any.
    pub fn next_request(&mut self, cycle: u64) -> Option<Request> {
        if self.blocked {
            return None;
        }
        if let Some(stalled) = self.stalled.take() {
            return Some(stalled);
        }
        if self.generated >= self.config.num_requests || cycle < self.next_at {
            return None;
        }
        self.generated += 1;
        let (kind, addr) = match self.config.pattern {
            Pattern::Linear => (self.random_kind(), self.next_linear()),
            Pattern::Random => (self.random_kind(), self.next_random()),
            Pattern::Dram => self.next_dram(),
            Pattern::Strided => (self.random_kind(), self.next_strided()),
        };
        Some(Request::new(kind, addr, self.id, cycle).with_size(self.config.block_size))
    }

    pub fn accepted(&mut self, cycle: u64) {
        let min = self.config.min_period;
        let max = self.config.max_period.max(min);
        self.next_at = cycle + self.rng.gen_range(min..=max);
    }

    /// Keeps `request` until the next retry.
    pub fn rejected(&mut self, request: Request) {
        self.stalled = Some(request);
        self.blocked = true;
    }

    pub fn retry(&mut self) {
        self.blocked = false;
    }

    fn random_kind(&mut self) -> Kind {
        if self.rng.gen_range(0..100u8) < self.config.read_percent {
            Kind::Read
        } else {
            Kind::Write
        }
    }

    fn next_linear(&mut self) -> address {
        let addr = self.cursor;
        self.cursor += u64::from(self.config.block_size);
        if self.cursor >= self.config.max_addr {
            self.cursor = self.config.min_addr;
        }
        addr
    }

    fn next_random(&mut self) -> address {
        let block = u64::from(self.config.block_size).max(1);
        let blocks = ((self.config.max_addr - self.config.min_addr) / block).max(1);
        self.config.min_addr + self.rng.gen_range(0..blocks) * block
    }

    fn next_strided(&mut self) -> address {
        let block = u64::from(self.config.block_size).max(1);
        let blocks = ((self.config.max_addr - self.config.min_addr) / block).max(1);
        let index = self.config.index.unwrap_or(self.id as u64);
        let n = self
            .iteration
            .wrapping_mul(self.config.stride)
            .wrapping_add(index)
            % blocks;
        self.iteration += 1;
        self.config.min_addr + n * block
    }

    fn next_dram(&mut self) -> (Kind, address) {
        let run = match self.run.take() {
            Some(run) if run.remaining > 0 => run,
            _ => self.start_run(),
        };
        let addr = self.interleaver.encode(&run.tlx);
        let block = u64::from(self.config.block_size);
        self.run = Some(Run {
            tlx: PhysicalAddress {
                column: run.tlx.column + block,
                ..run.tlx
            },
            remaining: run.remaining - 1,
            ..run
        });
        (run.kind, addr)
    }

    /// Picks a bank, row and starting column so that the whole run stays within one row.
    fn start_run(&mut self) -> Run {
        let block = u64::from(self.config.block_size).max(1);
        let row_size = self.interleaver.row_size();
        let num_seq = self.config.num_seq_pkts.clamp(1, (row_size / block).max(1));
        let columns = (row_size / block).saturating_sub(num_seq) + 1;

        let min = self.interleaver.decode(self.config.min_addr);
        let max = self.interleaver.decode(self.config.max_addr.saturating_sub(1));
        let rows = (max.row.saturating_sub(min.row)).max(1);
        let banks = self.config.num_banks.clamp(1, self.interleaver.num_banks());

        let tlx = PhysicalAddress {
            channel: self.rng.gen_range(0..self.interleaver.num_channels()),
            rank: self.rng.gen_range(0..self.interleaver.num_ranks()),
            bank: self.rng.gen_range(0..banks),
            row: min.row + self.rng.gen_range(0..rows),
            column: self.rng.gen_range(0..columns) * block,
        };
        Run {
            tlx,
            kind: self.random_kind(),
            remaining: num_seq,
        }
    }
}
