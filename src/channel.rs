use crate::{
    address, config,
    device::Device,
    dispatch::{Dispatcher, InFlight, ResponseError},
    fifo::Fifo,
    interleave::PhysicalAddress,
    page::Banks,
    policy::{self, Decision, SchedulingPolicy, StallReason},
    queue::{Pending, RequestQueue},
    request::{Cancelled, Data, Issued, Kind, Request, RequestId, RequesterId, Response, Stage, Token},
};
use console::style;
use indexmap::IndexSet;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionRejected {
    #[error("channel {channel} {kind} queue is full")]
    QueueFull { channel: usize, kind: Kind },

    #[error("requester {requester} holds its quota of {kind} entries in channel {channel}")]
    QuotaExceeded {
        channel: usize,
        requester: RequesterId,
        kind: Kind,
    },

    #[error("address {addr:#x} is outside the served range")]
    OutOfRange { addr: address },
}

/// A requester that was turned away and may now retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Retry {
    pub channel: usize,
    pub requester: RequesterId,
    pub kind: Kind,
}

/// One independent memory channel.
///
/// Owns its queue, bank state, scheduling policy, device endpoints and
/// statistics. Nothing is shared between channels.
#[derive(Debug)]
pub struct Channel {
    pub id: usize,
    banks_per_rank: usize,
    resp_buffer_size: usize,

    queue: RequestQueue,
    banks: Banks,
    policy: Box<dyn SchedulingPolicy>,
    dispatcher: Dispatcher,
    responses: Fifo<Response>,

    /// Requesters rejected since the last time their class had space
    rejected: IndexSet<(RequesterId, Kind)>,
    retries: Vec<Retry>,

    cycle: u64,
    stats: stats::Channel,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Channel({}, queued={}, in flight={}, responses={})",
            self.id,
            self.queue.len(),
            self.dispatcher.len(),
            self.responses.len()
        )
    }
}

impl Channel {
    #[must_use]
    pub fn new(id: usize, endpoints: Vec<Box<dyn Device>>, config: &config::Config) -> Self {
        let num_banks = config.num_banks();
        Self {
            id,
            banks_per_rank: config.banks_per_channel,
            resp_buffer_size: config.resp_buffer_size,
            queue: RequestQueue::new(config),
            banks: Banks::new(config.page_policy, num_banks),
            policy: policy::new(config),
            dispatcher: Dispatcher::new(id, endpoints, num_banks),
            responses: Fifo::new(Some(config.resp_buffer_size)),
            rejected: IndexSet::new(),
            retries: Vec::new(),
            cycle: 0,
            stats: stats::Channel::new(id, num_banks),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    #[must_use]
    pub fn banks(&self) -> &Banks {
        &self.banks
    }

    #[must_use]
    pub fn policy(&self) -> &dyn SchedulingPolicy {
        self.policy.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> &stats::Channel {
        &self.stats
    }

    /// Requests in flight plus buffered responses.
    #[must_use]
    pub fn response_credits_used(&self) -> usize {
        self.dispatcher.len() + self.responses.len()
    }

    pub fn admit(
        &mut self,
        id: RequestId,
        request: Request,
        tlx: PhysicalAddress,
    ) -> Result<(), AdmissionRejected> {
        let kind = request.kind;
        let requester = request.requester;
        let entry = Pending {
            id,
            bank: tlx.bank_index(self.banks_per_rank),
            request,
            tlx,
            admitted_at: self.cycle,
        };
        log::trace!("channel {}: admit {}", self.id, entry);
        if !self.queue.admit(entry) {
            self.stats.scheduler.rejected.inc(kind, 1);
            self.rejected.insert((requester, kind));
            let rejection = if self.queue.can_admit(kind) {
                AdmissionRejected::QuotaExceeded {
                    channel: self.id,
                    requester,
                    kind,
                }
            } else {
                AdmissionRejected::QueueFull {
                    channel: self.id,
                    kind,
                }
            };
            log::debug!(
                "channel {}: rejecting requester {}: {}",
                self.id,
                requester,
                style(&rejection).red()
            );
            return Err(rejection);
        }
        debug_assert!(self.queue.occupancy(kind) <= self.queue.capacity(kind));
        self.stats.scheduler.admitted.inc(kind, 1);
        Ok(())
    }

    /// Advances the channel by one scheduling opportunity.
    ///
    /// Completions reported by devices are collected first, then at most one
    /// request is issued.
    #[tracing::instrument(name = "channel_cycle", skip(self), fields(channel = self.id))]
    pub fn cycle(&mut self, cycle: u64) -> Option<Issued> {
        self.cycle = cycle;
        for (token, data) in self.dispatcher.poll(cycle) {
            if let Err(err) = self.complete(token, data, cycle) {
                log::warn!("channel {}: {}", self.id, err);
            }
        }

        if self.queue.is_empty() {
            self.stats.scheduler.idle_cycles += 1;
            return None;
        }
        // every issued request must find room in the response queue
        if self.response_credits_used() >= self.resp_buffer_size {
            self.stall(StallReason::RespFull);
            return None;
        }

        let was_draining = self.policy.write_drain();
        let dispatcher = &self.dispatcher;
        let decision = self.policy.select(&self.queue, &self.banks, &|pending| {
            dispatcher.availability(pending)
        });
        if self.policy.write_drain() != was_draining {
            self.stats.scheduler.write_drain_switches += 1;
            log::debug!(
                "channel {}: write drain {}",
                self.id,
                if self.policy.write_drain() {
                    style("on").yellow()
                } else {
                    style("off").yellow()
                }
            );
        }

        match decision {
            Decision::Issue { id, .. } => self.issue(id, cycle),
            Decision::Stalled(reason) => {
                self.stall(reason);
                None
            }
            Decision::Idle => {
                self.stats.scheduler.idle_cycles += 1;
                None
            }
        }
    }

    fn stall(&mut self, reason: StallReason) {
        let stats = &mut self.stats.scheduler;
        stats.stall_cycles += 1;
        match reason {
            StallReason::BankBusy => stats.stall_bank_busy += 1,
            StallReason::RespFull => stats.stall_resp_full += 1,
            StallReason::DeviceBusy => stats.stall_device_busy += 1,
        }
        log::trace!("channel {}: stalled ({})", self.id, reason);
    }

    fn issue(&mut self, id: RequestId, cycle: u64) -> Option<Issued> {
        let Some(entry) = self.queue.remove(id) else {
            debug_assert!(false, "selected request {id} is not queued");
            return None;
        };
        let kind = entry.request.kind;
        let row = self.banks.access(entry.bank, entry.tlx.row, cycle);

        let stats = &mut self.stats;
        stats.scheduler.issued.inc(kind, 1);
        stats.scheduler.queue_cycles += cycle.saturating_sub(entry.admitted_at);
        stats.dram.inc_bank_access(entry.bank, kind.into());
        stats.dram.row_buffer.inc(row.into());

        let request = entry.request.clone();
        let tlx = entry.tlx;
        let token = self.dispatcher.dispatch(entry, row, cycle);
        self.signal_retries();

        Some(Issued {
            token,
            request,
            tlx,
            row,
            cycle,
        })
    }

    /// Reports rejected requesters whose class has space again.
    fn signal_retries(&mut self) {
        let queue = &self.queue;
        let channel = self.id;
        let mut ready = Vec::new();
        self.rejected.retain(|&(requester, kind)| {
            if queue.can_admit_for(requester, kind) {
                ready.push(Retry {
                    channel,
                    requester,
                    kind,
                });
                false
            } else {
                true
            }
        });
        if !ready.is_empty() {
            log::debug!("channel {}: retry {:?}", self.id, ready);
        }
        self.stats.scheduler.retries_signalled += ready.len() as u64;
        self.retries.extend(ready);
    }

    fn complete(&mut self, token: Token, data: Data, cycle: u64) -> Result<(), ResponseError> {
        let InFlight {
            id,
            request,
            tlx,
            row,
            issued_at,
            ..
        } = self.dispatcher.complete(token)?;
        let kind = request.kind;
        self.stats.scheduler.completed.inc(kind, 1);
        self.stats.scheduler.service_cycles += cycle.saturating_sub(issued_at);

        debug_assert!(!self.responses.full(), "response slot was reserved at issue");
        log::debug!(
            "channel {}: {} completed after {} cycles",
            self.id,
            style(&request).green(),
            cycle.saturating_sub(issued_at)
        );
        self.responses.enqueue(Response {
            id,
            request,
            tlx,
            row,
            issued_at,
            completed_at: cycle,
            data,
        });
        Ok(())
    }

    pub fn on_device_response(&mut self, token: Token, data: Data) -> Result<(), ResponseError> {
        let cycle = self.cycle;
        self.complete(token, data, cycle)
    }

    /// Untimed access to the device serving `tlx`.
    ///
    /// Queues, bank state and statistics are left untouched.
    pub fn functional(&mut self, request: &Request, tlx: &PhysicalAddress) -> Data {
        let bank = tlx.bank_index(self.banks_per_rank);
        self.dispatcher.functional(bank, request, tlx)
    }

    /// Oldest buffered response of `requester`.
    pub fn pop_response(&mut self, requester: RequesterId) -> Option<Response> {
        let response = self
            .responses
            .remove_first(|response| response.request.requester == requester)?;
        self.stats.scheduler.delivered.inc(response.request.kind, 1);
        Some(response)
    }

    pub fn drain_responses(&mut self) -> Vec<Response> {
        let responses: Vec<_> = self.responses.drain().collect();
        for response in &responses {
            self.stats.scheduler.delivered.inc(response.request.kind, 1);
        }
        responses
    }

    pub fn take_retries(&mut self) -> Vec<Retry> {
        std::mem::take(&mut self.retries)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.dispatcher.is_empty() && self.responses.is_empty()
    }

    /// Tears the channel down, returning everything not yet delivered.
    pub fn shutdown(mut self) -> (Vec<Cancelled>, stats::Channel) {
        let queued = self.queue.drain().into_iter().map(|pending| Cancelled {
            id: pending.id,
            request: pending.request,
            stage: Stage::Queued,
        });
        let in_flight = self.dispatcher.drain().into_iter().map(|in_flight| Cancelled {
            id: in_flight.id,
            request: in_flight.request,
            stage: Stage::InFlight,
        });
        let buffered = self.responses.drain().map(|response| Cancelled {
            id: response.id,
            request: response.request,
            stage: Stage::Buffered,
        });
        let mut cancelled: Vec<_> = queued.chain(in_flight).chain(buffered).collect();
        cancelled.sort_by_key(|cancelled| cancelled.id);
        self.stats.scheduler.cancelled += cancelled.len() as u64;
        if !cancelled.is_empty() {
            log::warn!(
                "channel {}: cancelled {} requests at shutdown",
                self.id,
                cancelled.len()
            );
        }
        (cancelled, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::{AdmissionRejected, Channel, Retry};
    use crate::{
        config::Config,
        device::{Detached, Device, FixedLatency},
        interleave::AddressInterleaver,
        page::RowOutcome,
        request::{Kind, Request, RequestId, Stage},
    };
    use color_eyre::eyre;

    struct Setup {
        channel: Channel,
        interleaver: AddressInterleaver,
        next_id: u64,
    }

    impl Setup {
        fn new(config: Config, device: Box<dyn Device>) -> eyre::Result<Self> {
            crate::testing::init_logging();
            let interleaver = AddressInterleaver::new(&config)?;
            let channel = Channel::new(0, vec![device], &config);
            Ok(Self {
                channel,
                interleaver,
                next_id: 0,
            })
        }

        fn admit(&mut self, request: Request) -> Result<RequestId, AdmissionRejected> {
            let id = RequestId(self.next_id);
            self.next_id += 1;
            let tlx = self.interleaver.decode(request.addr);
            self.channel.admit(id, request, tlx).map(|()| id)
        }
    }

    #[test]
    fn test_issue_and_complete() -> eyre::Result<()> {
        let mut setup = Setup::new(Config::default(), Box::new(FixedLatency::new(3)))?;
        let id = setup.admit(Request::read(0x40, 1, 0))?;

        let issued = setup.channel.cycle(0).unwrap();
        assert_eq!(issued.token.id, id);
        assert_eq!(issued.row, RowOutcome::Miss);
        assert!(setup.channel.cycle(1).is_none());
        assert!(setup.channel.pop_response(1).is_none());

        setup.channel.cycle(3);
        let response = setup.channel.pop_response(1).unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.issued_at, 0);
        assert_eq!(response.completed_at, 3);
        assert_eq!(response.data.len(), 64);
        assert!(setup.channel.is_idle());

        let stats = setup.channel.stats();
        assert_eq!(stats.scheduler.issued.get(Kind::Read), 1);
        assert_eq!(stats.scheduler.delivered.get(Kind::Read), 1);
        assert_eq!(stats.dram.row_buffer.misses, 1);
        Ok(())
    }

    #[test]
    fn test_response_queue_backpressure() -> eyre::Result<()> {
        let config = Config {
            resp_buffer_size: 2,
            write_buffer_size: 8,
            ..Config::default()
        };
        let mut setup = Setup::new(config, Box::new(FixedLatency::new(1)))?;
        // three writes to different banks
        for bank in 0..3u64 {
            setup.admit(Request::write(bank * 2048, 0, 0))?;
        }
        assert!(setup.channel.cycle(0).is_some());
        assert!(setup.channel.cycle(1).is_some());
        // two responses buffered, nobody picks them up
        assert!(setup.channel.cycle(2).is_none());
        assert!(setup.channel.cycle(3).is_none());
        assert_eq!(setup.channel.stats().scheduler.stall_resp_full, 2);

        assert!(setup.channel.pop_response(0).is_some());
        assert!(setup.channel.cycle(4).is_some());
        Ok(())
    }

    #[test]
    fn test_bank_busy_until_response() -> eyre::Result<()> {
        let mut setup = Setup::new(Config::default(), Box::new(Detached::new()))?;
        // same bank, different rows
        setup.admit(Request::read(0, 0, 0))?;
        setup.admit(Request::read(1 << 16, 1, 0))?;
        let first = setup.channel.cycle(0).unwrap();
        assert!(setup.channel.cycle(1).is_none());
        assert_eq!(setup.channel.stats().scheduler.stall_bank_busy, 1);

        setup.channel.on_device_response(first.token, Default::default())?;
        let second = setup.channel.cycle(2).unwrap();
        assert_eq!(second.row, RowOutcome::Conflict);
        assert!(setup
            .channel
            .on_device_response(first.token, Default::default())
            .is_err());
        Ok(())
    }

    #[test]
    fn test_retry_signalled_once_space_frees() -> eyre::Result<()> {
        let config = Config {
            read_buffer_size: 1,
            ..Config::default()
        };
        let mut setup = Setup::new(config, Box::new(Detached::new()))?;
        setup.admit(Request::read(0, 0, 0))?;
        assert_eq!(
            setup.admit(Request::read(64, 7, 0)),
            Err(AdmissionRejected::QueueFull {
                channel: 0,
                kind: Kind::Read
            })
        );
        assert!(setup.admit(Request::read(64, 7, 0)).is_err());
        assert!(setup.channel.take_retries().is_empty());

        setup.channel.cycle(0);
        similar_asserts::assert_eq!(
            have: setup.channel.take_retries(),
            want: vec![Retry {
                channel: 0,
                requester: 7,
                kind: Kind::Read
            }]
        );
        assert!(setup.channel.take_retries().is_empty());
        assert_eq!(setup.channel.stats().scheduler.rejected.reads, 2);
        Ok(())
    }

    #[test]
    fn test_quota_rejects_and_retries_requester() -> eyre::Result<()> {
        let config = Config {
            read_buffer_size: 4,
            per_requester_quota: Some(1),
            ..Config::default()
        };
        let mut setup = Setup::new(config, Box::new(Detached::new()))?;
        let first = setup.admit(Request::read(0, 3, 0))?;
        assert_eq!(
            setup.admit(Request::read(64, 3, 0)),
            Err(AdmissionRejected::QuotaExceeded {
                channel: 0,
                requester: 3,
                kind: Kind::Read
            })
        );
        // other requesters still find room
        setup.admit(Request::read(128, 4, 0))?;
        setup.admit(Request::write(192, 3, 0))?;

        let issued = setup.channel.cycle(0).unwrap();
        assert_eq!(issued.token.id, first);
        similar_asserts::assert_eq!(
            have: setup.channel.take_retries(),
            want: vec![Retry {
                channel: 0,
                requester: 3,
                kind: Kind::Read
            }]
        );
        Ok(())
    }

    #[test]
    fn test_shutdown_reports_all_stages() -> eyre::Result<()> {
        let mut setup = Setup::new(Config::default(), Box::new(FixedLatency::new(2)))?;
        let buffered = setup.admit(Request::write(0, 0, 0))?;
        setup.channel.cycle(0);
        let in_flight = setup.admit(Request::write(2048, 0, 0))?;
        setup.channel.cycle(2);
        let queued = setup.admit(Request::read(2048, 0, 0))?;

        let (cancelled, stats) = setup.channel.shutdown();
        let stages: Vec<_> = cancelled.iter().map(|c| (c.id, c.stage)).collect();
        similar_asserts::assert_eq!(
            have: stages,
            want: vec![
                (buffered, Stage::Buffered),
                (in_flight, Stage::InFlight),
                (queued, Stage::Queued),
            ]
        );
        assert_eq!(stats.scheduler.cancelled, 3);
        Ok(())
    }
}
