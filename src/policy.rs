use crate::{
    config,
    page::Banks,
    queue::{Pending, RequestQueue},
    request::{Kind, RequestId, RequesterId},
};
use console::style;
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
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Oldest eligible request of the selected class
    Fifo,
    /// First ready, first come first served: row hits before older requests
    #[default]
    FrFcfs,
}

/// Precedence between read/write class selection and row-hit preference.
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
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationOrder {
    /// Select the class first, then prefer row hits within it.
    #[default]
    ClassFirst,
    /// Prefer row hits of either class, then fall back to the class order.
    RowHitFirst,
}

/// Whether a queued request could be issued right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Availability {
    Ready,
    /// Target bank is mid-access
    BankBusy,
    /// The device behind the bank refuses new requests
    DeviceBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum StallReason {
    BankBusy,
    RespFull,
    DeviceBusy,
}

impl From<Availability> for Option<StallReason> {
    fn from(availability: Availability) -> Self {
        match availability {
            Availability::Ready => None,
            Availability::BankBusy => Some(StallReason::BankBusy),
            Availability::DeviceBusy => Some(StallReason::DeviceBusy),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Issue { id: RequestId, row_hit: bool },
    /// Nothing queued
    Idle,
    /// Requests are queued but none can issue
    Stalled(StallReason),
}

/// Read to write switching with hysteresis.
///
/// Draining starts once the write occupancy reaches `high` percent and stops
/// when it falls below `low` percent or no writes are left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteDrain {
    pub high: u8,
    pub low: u8,
    pub active: bool,
}

impl WriteDrain {
    #[must_use]
    pub fn new(config: &config::Config) -> Self {
        Self {
            high: config.service_write_threshold,
            low: config.write_low_threshold(),
            active: false,
        }
    }

    /// Updates the drain state from the current split queue occupancy.
    pub fn update(&mut self, queue: &RequestQueue) {
        let writes = queue.len_of(Kind::Write);
        if self.active {
            if writes == 0 || !queue.occupancy_reaches(Kind::Write, self.low) {
                self.active = false;
            }
        } else if writes > 0 && queue.occupancy_reaches(Kind::Write, self.high) {
            self.active = true;
        }
    }
}

pub trait SchedulingPolicy: Send + Sync + std::fmt::Debug + 'static {
    fn kind(&self) -> SchedulerKind;

    /// Picks at most one queued request to issue.
    ///
    /// `availability` reports whether the bank and device of a request can
    /// take it this cycle.
    fn select(
        &mut self,
        queue: &RequestQueue,
        banks: &Banks,
        availability: &dyn Fn(&Pending) -> Availability,
    ) -> Decision;

    /// Whether writes are currently preferred over reads.
    fn write_drain(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct Base {
    pub drain: WriteDrain,
    pub order: ArbitrationOrder,
    /// Rotate the first requester considered among equally ranked candidates
    pub round_robin: bool,
    /// Requester considered first by the next round-robin pick
    pub next_requester: RequesterId,
}

impl Base {
    #[must_use]
    pub fn new(config: &config::Config) -> Self {
        Self {
            drain: WriteDrain::new(config),
            order: config.arbitration_order,
            round_robin: config.per_requester_quota.is_some(),
            next_requester: 0,
        }
    }

    /// Picks one of equally ranked candidates.
    ///
    /// Without round-robin this is the oldest. Otherwise the requester at or
    /// after `next_requester` (wrapping around) wins, oldest first.
    fn pick<'a>(&self, tier: &[&'a Pending]) -> Option<&'a Pending> {
        if !self.round_robin {
            return tier.first().copied();
        }
        tier.iter()
            .copied()
            .min_by_key(|pending| {
                (
                    pending.request.requester.wrapping_sub(self.next_requester),
                    pending.id,
                )
            })
    }

    /// The class served first this cycle.
    ///
    /// With a unified queue there is only one occupancy figure, so the class
    /// of the oldest request is preferred instead.
    pub fn preferred_class(&mut self, queue: &RequestQueue) -> Option<Kind> {
        if queue.is_unified() {
            self.drain.active = false;
            return queue.oldest().map(|oldest| oldest.request.kind);
        }
        self.drain.update(queue);
        if self.drain.active {
            Some(Kind::Write)
        } else {
            Some(Kind::Read)
        }
    }

    pub fn select(
        &mut self,
        queue: &RequestQueue,
        banks: &Banks,
        availability: &dyn Fn(&Pending) -> Availability,
        prefer_row_hits: bool,
    ) -> Decision {
        if queue.is_empty() {
            return Decision::Idle;
        }
        let Some(preferred) = self.preferred_class(queue) else {
            return Decision::Idle;
        };
        let classes = [preferred, preferred.other()];

        let mut stall: Option<StallReason> = None;
        let mut eligible = |pending: &Pending| -> bool {
            if queue.has_older_same_bank(pending) {
                return false;
            }
            match availability(pending) {
                Availability::Ready => true,
                blocked => {
                    stall = stall.or(blocked.into());
                    false
                }
            }
        };
        let row_hit = |pending: &Pending| banks.is_row_hit(pending.bank, pending.tlx.row);

        let mut candidates: Vec<(Kind, &Pending)> = Vec::new();
        for kind in classes {
            candidates.extend(
                queue
                    .iter_kind(kind)
                    .filter(|pending| eligible(*pending))
                    .map(|pending| (kind, pending)),
            );
        }

        let in_class = |class: Kind, hits_only: bool| {
            candidates
                .iter()
                .filter(|(kind, pending)| *kind == class && (!hits_only || row_hit(*pending)))
                .map(|(_, pending)| *pending)
                .collect::<Vec<_>>()
        };
        let [first, second] = classes;
        let tiers = match (prefer_row_hits, self.order) {
            (false, _) => vec![in_class(first, false), in_class(second, false)],
            (true, ArbitrationOrder::ClassFirst) => vec![
                in_class(first, true),
                in_class(first, false),
                in_class(second, true),
                in_class(second, false),
            ],
            (true, ArbitrationOrder::RowHitFirst) => vec![
                in_class(first, true),
                in_class(second, true),
                in_class(first, false),
                in_class(second, false),
            ],
        };
        let chosen = tiers
            .iter()
            .find(|tier| !tier.is_empty())
            .and_then(|tier| self.pick(tier));

        match chosen {
            Some(pending) => {
                let row_hit = row_hit(pending);
                log::trace!(
                    "select {} ({} preferred, row hit={}, drain={})",
                    style(pending).cyan(),
                    preferred,
                    row_hit,
                    self.drain.active
                );
                if self.round_robin {
                    self.next_requester = pending.request.requester.wrapping_add(1);
                }
                Decision::Issue {
                    id: pending.id,
                    row_hit,
                }
            }
            None => Decision::Stalled(stall.unwrap_or(StallReason::BankBusy)),
        }
    }
}

/// Serves the oldest eligible request of the preferred class.
#[derive(Debug)]
pub struct Fifo {
    inner: Base,
}

impl Fifo {
    #[must_use]
    pub fn new(config: &config::Config) -> Self {
        Self {
            inner: Base::new(config),
        }
    }
}

impl SchedulingPolicy for Fifo {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Fifo
    }

    fn select(
        &mut self,
        queue: &RequestQueue,
        banks: &Banks,
        availability: &dyn Fn(&Pending) -> Availability,
    ) -> Decision {
        self.inner.select(queue, banks, availability, false)
    }

    fn write_drain(&self) -> bool {
        self.inner.drain.active
    }
}

/// Prefers requests hitting an open row, then the oldest.
#[derive(Debug)]
pub struct FrFcfs {
    inner: Base,
}

impl FrFcfs {
    #[must_use]
    pub fn new(config: &config::Config) -> Self {
        Self {
            inner: Base::new(config),
        }
    }
}

impl SchedulingPolicy for FrFcfs {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::FrFcfs
    }

    fn select(
        &mut self,
        queue: &RequestQueue,
        banks: &Banks,
        availability: &dyn Fn(&Pending) -> Availability,
    ) -> Decision {
        self.inner.select(queue, banks, availability, true)
    }

    fn write_drain(&self) -> bool {
        self.inner.drain.active
    }
}

#[must_use]
pub fn new(config: &config::Config) -> Box<dyn SchedulingPolicy> {
    match config.scheduler {
        SchedulerKind::Fifo => Box::new(Fifo::new(config)),
        SchedulerKind::FrFcfs => Box::new(FrFcfs::new(config)),
    }
}
