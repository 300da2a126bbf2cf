use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    strum::EnumIter,
    strum::EnumCount,
    strum::FromRepr,
    strum::Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(usize)]
pub enum AccessKind {
    READ = 0,
    WRITE = 1,
}

impl AccessKind {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, AccessKind::WRITE)
    }

    pub fn reads() -> impl Iterator<Item = AccessKind> {
        <Self as strum::IntoEnumIterator>::iter().filter(|kind| !kind.is_write())
    }

    pub fn writes() -> impl Iterator<Item = AccessKind> {
        <Self as strum::IntoEnumIterator>::iter().filter(|kind| kind.is_write())
    }
}

/// Counter split by access kind.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerKind {
    pub reads: u64,
    pub writes: u64,
}

impl PerKind {
    pub fn inc(&mut self, kind: impl Into<AccessKind>, count: u64) {
        match kind.into() {
            AccessKind::READ => self.reads += count,
            AccessKind::WRITE => self.writes += count,
        }
    }

    #[must_use]
    pub fn get(&self, kind: impl Into<AccessKind>) -> u64 {
        match kind.into() {
            AccessKind::READ => self.reads,
            AccessKind::WRITE => self.writes,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.reads + self.writes
    }
}

impl std::ops::AddAssign for PerKind {
    fn add_assign(&mut self, other: Self) {
        self.reads += other.reads;
        self.writes += other.writes;
    }
}
