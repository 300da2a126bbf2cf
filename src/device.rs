use crate::{
    interleave::PhysicalAddress,
    request::{Data, Kind, Request, Token},
};
use std::collections::VecDeque;

/// A downstream memory device behind one or more banks of a channel.
pub trait Device: Send + std::fmt::Debug {
    /// Whether the device takes a new request for `bank` this cycle.
    fn can_accept(&self, bank: usize) -> bool;

    fn send(&mut self, token: Token, request: &Request, tlx: &PhysicalAddress, cycle: u64);

    /// Pops one request that completed by `cycle`.
    ///
    /// Devices completed by an external model always return `None` and
    /// report completions through the scheduler instead.
    fn pop_completed(&mut self, cycle: u64) -> Option<(Token, Data)>;

    /// Called once the scheduler resolved the completion of `token`,
    /// whichever way it was reported.
    fn completed(&mut self, _token: Token) {}

    /// Number of requests accepted but not yet completed.
    fn pending(&self) -> usize;

    /// Performs `request` immediately, outside of the timed path.
    fn functional(&mut self, request: &Request, tlx: &PhysicalAddress) -> Data;
}

/// Read data is derived from the address so responses can be told apart.
fn address_data(request: &Request) -> Data {
    match request.kind {
        Kind::Read => (0..u64::from(request.size))
            .map(|offset| request.addr.wrapping_add(offset) as u8)
            .collect(),
        Kind::Write => Data::new(),
    }
}

/// Completes every request after a constant number of cycles.
#[derive(Debug, Clone)]
pub struct FixedLatency {
    latency: u64,
    capacity: Option<usize>,
    queue: VecDeque<(u64, Token, Data)>,
}

impl FixedLatency {
    #[must_use]
    pub fn new(latency: u64) -> Self {
        Self {
            latency,
            capacity: None,
            queue: VecDeque::new(),
        }
    }

    /// Limits the number of requests the device holds at a time.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

}

impl Device for FixedLatency {
    fn can_accept(&self, _bank: usize) -> bool {
        self.capacity.map_or(true, |cap| self.queue.len() < cap)
    }

    fn send(&mut self, token: Token, request: &Request, tlx: &PhysicalAddress, cycle: u64) {
        let data = address_data(request);
        let ready_at = cycle + self.latency;
        log::trace!(
            "device: {} {} at {} ready at {}",
            token,
            request,
            tlx,
            ready_at
        );
        self.queue.push_back((ready_at, token, data));
    }

    fn pop_completed(&mut self, cycle: u64) -> Option<(Token, Data)> {
        match self.queue.front() {
            Some((ready_at, _, _)) if *ready_at <= cycle => {
                self.queue.pop_front().map(|(_, token, data)| (token, data))
            }
            _ => None,
        }
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn functional(&mut self, request: &Request, tlx: &PhysicalAddress) -> Data {
        log::trace!("device: functional {} at {}", request, tlx);
        address_data(request)
    }
}

/// Accepts everything and never completes on its own.
///
/// Used when the harness models the device and calls
/// [`Scheduler::on_device_response`](crate::scheduler::Scheduler::on_device_response).
/// Requests stay in `sent` until their completion was resolved.
#[derive(Debug, Clone, Default)]
pub struct Detached {
    pub sent: Vec<(Token, Request)>,
    /// Functional accesses seen so far
    pub functional: Vec<Request>,
}

impl Detached {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Device for Detached {
    fn can_accept(&self, _bank: usize) -> bool {
        true
    }

    fn send(&mut self, token: Token, request: &Request, _tlx: &PhysicalAddress, _cycle: u64) {
        self.sent.push((token, request.clone()));
    }

    fn pop_completed(&mut self, _cycle: u64) -> Option<(Token, Data)> {
        None
    }

    fn completed(&mut self, token: Token) {
        self.sent.retain(|(sent, _)| *sent != token);
    }

    fn pending(&self) -> usize {
        self.sent.len()
    }

    fn functional(&mut self, request: &Request, _tlx: &PhysicalAddress) -> Data {
        self.functional.push(request.clone());
        address_data(request)
    }
}
