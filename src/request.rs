use crate::{address, interleave::PhysicalAddress, page::RowOutcome};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type RequesterId = usize;

/// Payload carried by a response.
pub type Data = SmallVec<[u8; 64]>;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
pub enum Kind {
    Read,
    Write,
}

impl Kind {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Kind::Write)
    }

    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Kind::Read => Kind::Write,
            Kind::Write => Kind::Read,
        }
    }
}

impl From<Kind> for stats::AccessKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Read => stats::AccessKind::READ,
            Kind::Write => stats::AccessKind::WRITE,
        }
    }
}

/// A memory request as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub addr: address,
    pub kind: Kind,
    pub requester: RequesterId,
    /// Cycle at which the requester issued the request
    pub time: u64,
    pub size: u32,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({:#x}, {} bytes, requester={})",
            self.kind, self.addr, self.size, self.requester
        )
    }
}

impl Request {
    pub const DEFAULT_SIZE: u32 = 64;

    #[must_use]
    pub fn new(kind: Kind, addr: address, requester: RequesterId, time: u64) -> Self {
        Self {
            addr,
            kind,
            requester,
            time,
            size: Self::DEFAULT_SIZE,
        }
    }

    #[must_use]
    pub fn read(addr: address, requester: RequesterId, time: u64) -> Self {
        Self::new(Kind::Read, addr, requester, time)
    }

    #[must_use]
    pub fn write(addr: address, requester: RequesterId, time: u64) -> Self {
        Self::new(Kind::Write, addr, requester, time)
    }

    #[must_use]
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }
}

/// Admission sequence number, unique per scheduler.
///
/// Ids are handed out in admission order, so comparing ids compares age.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completion token handed to a device when a request is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token {
    pub channel: usize,
    pub id: RequestId,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@ch{}", self.id, self.channel)
    }
}

/// A request that has been dispatched to a device this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issued {
    pub token: Token,
    pub request: Request,
    pub tlx: PhysicalAddress,
    pub row: RowOutcome,
    pub cycle: u64,
}

/// A completed request waiting to be picked up by its requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub request: Request,
    pub tlx: PhysicalAddress,
    pub row: RowOutcome,
    pub issued_at: u64,
    pub completed_at: u64,
    pub data: Data,
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Response({} {} {:?} issued={} completed={})",
            self.id, self.request, self.row, self.issued_at, self.completed_at
        )
    }
}

/// Where a request was when the scheduler was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
pub enum Stage {
    Queued,
    InFlight,
    Buffered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancelled {
    pub id: RequestId,
    pub request: Request,
    pub stage: Stage,
}
