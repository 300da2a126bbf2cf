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
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PagePolicy {
    /// Leave the row open after an access
    #[default]
    Open,
    /// Precharge after every access
    Close,
}

/// Row buffer state seen by a request at the time it is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
pub enum RowOutcome {
    /// Target row already open
    Hit,
    /// Bank closed, activate only
    Miss,
    /// Another row open, precharge then activate
    Conflict,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BankState {
    pub open_row: Option<u64>,
    pub last_access: Option<u64>,
}

impl BankState {
    #[must_use]
    pub fn outcome(&self, row: u64) -> RowOutcome {
        match self.open_row {
            Some(open) if open == row => RowOutcome::Hit,
            Some(_) => RowOutcome::Conflict,
            None => RowOutcome::Miss,
        }
    }
}

impl From<RowOutcome> for stats::dram::RowOutcome {
    fn from(outcome: RowOutcome) -> Self {
        match outcome {
            RowOutcome::Hit => stats::dram::RowOutcome::Hit,
            RowOutcome::Miss => stats::dram::RowOutcome::Miss,
            RowOutcome::Conflict => stats::dram::RowOutcome::Conflict,
        }
    }
}

/// Open row tracking for all banks of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banks {
    policy: PagePolicy,
    banks: Vec<BankState>,
}

impl Banks {
    #[must_use]
    pub fn new(policy: PagePolicy, num_banks: usize) -> Self {
        Self {
            policy,
            banks: vec![BankState::default(); num_banks],
        }
    }

    #[must_use]
    pub fn policy(&self) -> PagePolicy {
        self.policy
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.banks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    #[must_use]
    pub fn get(&self, bank: usize) -> Option<&BankState> {
        self.banks.get(bank)
    }

    #[must_use]
    pub fn outcome(&self, bank: usize, row: u64) -> RowOutcome {
        self.banks[bank].outcome(row)
    }

    /// Under a close page policy no row is ever open, so this is always false.
    #[must_use]
    pub fn is_row_hit(&self, bank: usize, row: u64) -> bool {
        self.outcome(bank, row) == RowOutcome::Hit
    }

    /// Records an access to `row` of `bank` and applies the page policy.
    pub fn access(&mut self, bank: usize, row: u64, cycle: u64) -> RowOutcome {
        let state = &mut self.banks[bank];
        let outcome = state.outcome(row);
        state.open_row = match self.policy {
            PagePolicy::Open => Some(row),
            PagePolicy::Close => None,
        };
        state.last_access = Some(cycle);
        log::trace!(
            "bank {}: access row {} => {} (open row now {:?})",
            bank,
            row,
            outcome,
            state.open_row
        );
        outcome
    }
}
