use crate::{
    config,
    fifo::Fifo,
    interleave::PhysicalAddress,
    request::{Kind, Request, RequestId, RequesterId},
};

/// A request waiting in a channel queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub id: RequestId,
    pub request: Request,
    pub tlx: PhysicalAddress,
    /// Bank index within the channel (rank-major)
    pub bank: usize,
    /// Cycle at which the request was admitted
    pub admitted_at: u64,
}

impl std::fmt::Display for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} bank={} row={}",
            self.id, self.request, self.bank, self.tlx.row
        )
    }
}

#[derive(Debug, Clone)]
enum Layout {
    /// Reads and writes share one queue in arrival order.
    Unified(Fifo<Pending>),
    /// Reads and writes are bounded independently.
    Split {
        reads: Fifo<Pending>,
        writes: Fifo<Pending>,
    },
}

/// Bounded admission queue of one channel.
///
/// Arrival order is preserved within each operation class. The only
/// reordering happens when the scheduling policy removes an entry that is
/// not at the head.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    layout: Layout,
    /// Entries of one class a single requester may hold
    quota: Option<usize>,
}

impl RequestQueue {
    #[must_use]
    pub fn new(config: &config::Config) -> Self {
        let layout = if config.unified_queue {
            Layout::Unified(Fifo::new(Some(config.unified_buffer_size())))
        } else {
            Layout::Split {
                reads: Fifo::new(Some(config.read_buffer_size)),
                writes: Fifo::new(Some(config.write_buffer_size)),
            }
        };
        Self {
            layout,
            quota: config.per_requester_quota,
        }
    }

    #[must_use]
    pub fn is_unified(&self) -> bool {
        matches!(self.layout, Layout::Unified(_))
    }

    fn fifo(&self, kind: Kind) -> &Fifo<Pending> {
        match (&self.layout, kind) {
            (Layout::Unified(queue), _) => queue,
            (Layout::Split { reads, .. }, Kind::Read) => reads,
            (Layout::Split { writes, .. }, Kind::Write) => writes,
        }
    }

    fn fifo_mut(&mut self, kind: Kind) -> &mut Fifo<Pending> {
        match (&mut self.layout, kind) {
            (Layout::Unified(queue), _) => queue,
            (Layout::Split { reads, .. }, Kind::Read) => reads,
            (Layout::Split { writes, .. }, Kind::Write) => writes,
        }
    }

    /// Capacity available to requests of `kind`.
    #[must_use]
    pub fn capacity(&self, kind: Kind) -> usize {
        self.fifo(kind).max_size().unwrap_or(usize::MAX)
    }

    /// Number of queued requests of `kind`.
    #[must_use]
    pub fn len_of(&self, kind: Kind) -> usize {
        match &self.layout {
            Layout::Unified(queue) => queue.iter().filter(|p| p.request.kind == kind).count(),
            Layout::Split { .. } => self.fifo(kind).len(),
        }
    }

    /// Entries counted against the capacity that `kind` is admitted into.
    #[must_use]
    pub fn occupancy(&self, kind: Kind) -> usize {
        self.fifo(kind).len()
    }

    /// Whether the occupancy of the `kind` queue is at least `percent` of its capacity.
    #[must_use]
    pub fn occupancy_reaches(&self, kind: Kind, percent: u8) -> bool {
        let fifo = self.fifo(kind);
        let capacity = fifo.max_size().unwrap_or(usize::MAX);
        fifo.len() * 100 >= usize::from(percent) * capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.layout {
            Layout::Unified(queue) => queue.len(),
            Layout::Split { reads, writes } => reads.len() + writes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn can_admit(&self, kind: Kind) -> bool {
        !self.fifo(kind).full()
    }

    #[must_use]
    pub fn quota(&self) -> Option<usize> {
        self.quota
    }

    /// Number of queued requests of `kind` from `requester`.
    #[must_use]
    pub fn held_by(&self, requester: RequesterId, kind: Kind) -> usize {
        self.iter_kind(kind)
            .filter(|pending| pending.request.requester == requester)
            .count()
    }

    /// Whether `requester` holds fewer entries of `kind` than its quota.
    #[must_use]
    pub fn within_quota(&self, requester: RequesterId, kind: Kind) -> bool {
        self.quota
            .map_or(true, |quota| self.held_by(requester, kind) < quota)
    }

    #[must_use]
    pub fn can_admit_for(&self, requester: RequesterId, kind: Kind) -> bool {
        self.can_admit(kind) && self.within_quota(requester, kind)
    }

    /// Enqueues `entry`, returning `false` without side effects when full
    /// or when its requester exhausted its quota.
    #[must_use]
    pub fn admit(&mut self, entry: Pending) -> bool {
        let kind = entry.request.kind;
        if !self.can_admit_for(entry.request.requester, kind) {
            return false;
        }
        self.fifo_mut(kind).enqueue(entry);
        true
    }

    /// Queued requests of `kind` in arrival order.
    pub fn iter_kind(&self, kind: Kind) -> impl Iterator<Item = &Pending> + '_ {
        self.fifo(kind)
            .iter()
            .filter(move |pending| pending.request.kind == kind)
    }

    /// All queued requests (arrival order within each class).
    pub fn iter(&self) -> impl Iterator<Item = &Pending> + '_ {
        let (first, second) = match &self.layout {
            Layout::Unified(queue) => (queue.iter(), None),
            Layout::Split { reads, writes } => (reads.iter(), Some(writes.iter())),
        };
        first.chain(second.into_iter().flatten())
    }

    /// The oldest queued request of any class.
    #[must_use]
    pub fn oldest(&self) -> Option<&Pending> {
        match &self.layout {
            Layout::Unified(queue) => queue.first(),
            Layout::Split { reads, writes } => match (reads.first(), writes.first()) {
                (Some(read), Some(write)) => Some(if read.id < write.id { read } else { write }),
                (read, write) => read.or(write),
            },
        }
    }

    /// The oldest request of `kind` accepted by `eligible`.
    pub fn peek_eligible<P>(&self, kind: Kind, mut eligible: P) -> Option<&Pending>
    where
        P: FnMut(&Pending) -> bool,
    {
        self.iter_kind(kind).find(|pending| eligible(pending))
    }

    pub fn remove(&mut self, id: RequestId) -> Option<Pending> {
        match &mut self.layout {
            Layout::Unified(queue) => queue.remove_first(|pending| pending.id == id),
            Layout::Split { reads, writes } => reads
                .remove_first(|pending| pending.id == id)
                .or_else(|| writes.remove_first(|pending| pending.id == id)),
        }
    }

    /// Whether an older request from the same requester to the same bank is
    /// still queued.
    #[must_use]
    pub fn has_older_same_bank(&self, entry: &Pending) -> bool {
        self.iter().any(|other| {
            other.id < entry.id
                && other.bank == entry.bank
                && other.request.requester == entry.request.requester
        })
    }

    pub fn drain(&mut self) -> Vec<Pending> {
        let mut drained: Vec<Pending> = match &mut self.layout {
            Layout::Unified(queue) => queue.drain().collect(),
            Layout::Split { reads, writes } => reads.drain().chain(writes.drain()).collect(),
        };
        drained.sort_by_key(|pending| pending.id);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::{Pending, RequestQueue};
    use crate::{
        config::Config,
        interleave::PhysicalAddress,
        request::{Kind, Request, RequestId},
    };

    fn pending(id: u64, kind: Kind, bank: usize, requester: usize) -> Pending {
        Pending {
            id: RequestId(id),
            request: Request::new(kind, id * 64, requester, id),
            tlx: PhysicalAddress {
                bank: bank as u64,
                ..PhysicalAddress::default()
            },
            bank,
            admitted_at: id,
        }
    }

    #[test]
    fn test_split_capacity() {
        let config = Config {
            read_buffer_size: 2,
            write_buffer_size: 4,
            ..Config::default()
        };
        let mut queue = RequestQueue::new(&config);
        assert!(queue.admit(pending(0, Kind::Read, 0, 0)));
        assert!(queue.admit(pending(1, Kind::Read, 0, 0)));
        assert!(!queue.can_admit(Kind::Read));
        assert!(!queue.admit(pending(2, Kind::Read, 0, 0)));
        assert_eq!(queue.len_of(Kind::Read), 2);

        // writes are bounded independently
        for id in 3..7 {
            assert!(queue.admit(pending(id, Kind::Write, 1, 0)));
        }
        assert!(!queue.admit(pending(7, Kind::Write, 1, 0)));
        assert_eq!(queue.len(), 6);
        assert!(queue.occupancy_reaches(Kind::Write, 100));
    }

    #[test]
    fn test_unified_capacity_is_shared() {
        let config = Config {
            unified_queue: true,
            read_buffer_size: 1,
            write_buffer_size: 2,
            ..Config::default()
        };
        let mut queue = RequestQueue::new(&config);
        assert!(queue.is_unified());
        assert_eq!(queue.capacity(Kind::Read), 3);
        assert!(queue.admit(pending(0, Kind::Read, 0, 0)));
        assert!(queue.admit(pending(1, Kind::Read, 0, 0)));
        assert!(queue.admit(pending(2, Kind::Write, 0, 0)));
        assert!(!queue.can_admit(Kind::Write));
        assert_eq!(queue.len_of(Kind::Read), 2);
        assert_eq!(queue.len_of(Kind::Write), 1);
        assert_eq!(
            queue.iter_kind(Kind::Write).map(|p| p.id).collect::<Vec<_>>(),
            vec![RequestId(2)]
        );
    }

    #[test]
    fn test_occupancy_threshold() {
        let config = Config {
            write_buffer_size: 32,
            ..Config::default()
        };
        let mut queue = RequestQueue::new(&config);
        // 60% of 32 is 19.2 entries
        for id in 0..19 {
            assert!(queue.admit(pending(id, Kind::Write, 0, 0)));
        }
        assert!(!queue.occupancy_reaches(Kind::Write, 60));
        assert!(queue.admit(pending(19, Kind::Write, 0, 0)));
        assert!(queue.occupancy_reaches(Kind::Write, 60));
    }

    #[test]
    fn test_oldest_and_remove() {
        let mut queue = RequestQueue::new(&Config::default());
        assert!(queue.admit(pending(5, Kind::Write, 0, 0)));
        assert!(queue.admit(pending(6, Kind::Read, 0, 0)));
        assert!(queue.admit(pending(7, Kind::Write, 0, 0)));
        assert_eq!(queue.oldest().map(|p| p.id), Some(RequestId(5)));
        assert!(queue.remove(RequestId(7)).is_some());
        assert!(queue.remove(RequestId(7)).is_none());
        assert!(queue.remove(RequestId(5)).is_some());
        assert_eq!(queue.oldest().map(|p| p.id), Some(RequestId(6)));
    }

    #[test]
    fn test_peek_eligible_is_oldest_first() {
        let mut queue = RequestQueue::new(&Config::default());
        for id in 0..4 {
            assert!(queue.admit(pending(id, Kind::Write, id as usize, 0)));
        }
        let eligible = queue.peek_eligible(Kind::Write, |p| p.bank >= 2);
        assert_eq!(eligible.map(|p| p.id), Some(RequestId(2)));
        assert!(queue.peek_eligible(Kind::Read, |_| true).is_none());
    }

    #[test]
    fn test_ordering_hazard() {
        let mut queue = RequestQueue::new(&Config::default());
        let first = pending(0, Kind::Write, 3, 1);
        let same_bank = pending(1, Kind::Read, 3, 1);
        let other_requester = pending(2, Kind::Read, 3, 2);
        let other_bank = pending(3, Kind::Write, 4, 1);
        for entry in [&first, &same_bank, &other_requester, &other_bank] {
            assert!(queue.admit(entry.clone()));
        }
        assert!(!queue.has_older_same_bank(&first));
        assert!(queue.has_older_same_bank(&same_bank));
        assert!(!queue.has_older_same_bank(&other_requester));
        assert!(!queue.has_older_same_bank(&other_bank));
    }

    #[test]
    fn test_per_requester_quota() {
        let config = Config {
            read_buffer_size: 4,
            per_requester_quota: Some(2),
            ..Config::default()
        };
        let mut queue = RequestQueue::new(&config);
        assert_eq!(queue.quota(), Some(2));
        assert!(queue.admit(pending(0, Kind::Read, 0, 7)));
        assert!(queue.admit(pending(1, Kind::Read, 1, 7)));
        assert!(queue.can_admit(Kind::Read));
        assert!(!queue.can_admit_for(7, Kind::Read));
        assert!(!queue.admit(pending(2, Kind::Read, 2, 7)));
        assert_eq!(queue.held_by(7, Kind::Read), 2);

        // the quota is per class and per requester
        assert!(queue.admit(pending(3, Kind::Write, 0, 7)));
        assert!(queue.admit(pending(4, Kind::Read, 3, 8)));
        assert!(queue.remove(RequestId(0)).is_some());
        assert!(queue.can_admit_for(7, Kind::Read));
    }

    #[test]
    fn test_drain_in_admission_order() {
        let mut queue = RequestQueue::new(&Config::default());
        assert!(queue.admit(pending(1, Kind::Write, 0, 0)));
        assert!(queue.admit(pending(2, Kind::Read, 0, 0)));
        assert!(queue.admit(pending(3, Kind::Write, 0, 0)));
        let ids: Vec<_> = queue.drain().into_iter().map(|p| p.id.0).collect();
        similar_asserts::assert_eq!(have: ids, want: vec![1, 2, 3]);
        assert!(queue.is_empty());
    }
}
