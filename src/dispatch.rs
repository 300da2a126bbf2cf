use crate::{
    device::Device,
    interleave::PhysicalAddress,
    page::RowOutcome,
    policy::Availability,
    queue::Pending,
    request::{Data, Request, RequestId, Token},
};
use console::style;
use indexmap::IndexMap;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("no request in flight for token {0}")]
    UnknownToken(Token),
}

/// A request handed to a device, waiting for its completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub id: RequestId,
    pub request: Request,
    pub tlx: PhysicalAddress,
    pub bank: usize,
    pub row: RowOutcome,
    pub admitted_at: u64,
    pub issued_at: u64,
}

/// Fans the requests of one channel out to its device endpoints and maps
/// completion tokens back to the original requests.
#[derive(Debug)]
pub struct Dispatcher {
    channel: usize,
    endpoints: Vec<Box<dyn Device>>,
    in_flight: IndexMap<RequestId, InFlight>,
    busy_banks: Vec<bool>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(channel: usize, endpoints: Vec<Box<dyn Device>>, num_banks: usize) -> Self {
        debug_assert!(!endpoints.is_empty());
        debug_assert_eq!(num_banks % endpoints.len(), 0);
        Self {
            channel,
            endpoints,
            in_flight: IndexMap::new(),
            busy_banks: vec![false; num_banks],
        }
    }

    /// Endpoint serving `bank`.
    #[must_use]
    pub fn endpoint(&self, bank: usize) -> usize {
        bank % self.endpoints.len()
    }

    #[must_use]
    pub fn is_bank_busy(&self, bank: usize) -> bool {
        self.busy_banks[bank]
    }

    #[must_use]
    pub fn availability(&self, pending: &Pending) -> Availability {
        if self.busy_banks[pending.bank] {
            return Availability::BankBusy;
        }
        let endpoint = &self.endpoints[self.endpoint(pending.bank)];
        if !endpoint.can_accept(pending.bank) {
            return Availability::DeviceBusy;
        }
        Availability::Ready
    }

    /// Hands `pending` to the device serving its bank.
    ///
    /// The bank stays busy until the completion for the returned token arrives.
    pub fn dispatch(&mut self, pending: Pending, row: RowOutcome, cycle: u64) -> Token {
        let token = Token {
            channel: self.channel,
            id: pending.id,
        };
        debug_assert!(!self.busy_banks[pending.bank], "dispatch to busy bank");
        self.busy_banks[pending.bank] = true;

        let endpoint = self.endpoint(pending.bank);
        log::debug!(
            "{}: {} to endpoint {} ({:?})",
            style(format!("dispatch {token}")).green(),
            pending,
            endpoint,
            row
        );
        self.endpoints[endpoint].send(token, &pending.request, &pending.tlx, cycle);
        self.in_flight.insert(
            pending.id,
            InFlight {
                id: pending.id,
                request: pending.request,
                tlx: pending.tlx,
                bank: pending.bank,
                row,
                admitted_at: pending.admitted_at,
                issued_at: cycle,
            },
        );
        token
    }

    /// Resolves a completion token and frees its bank.
    pub fn complete(&mut self, token: Token) -> Result<InFlight, ResponseError> {
        if token.channel != self.channel {
            return Err(ResponseError::UnknownToken(token));
        }
        let in_flight = self
            .in_flight
            .shift_remove(&token.id)
            .ok_or(ResponseError::UnknownToken(token))?;
        self.busy_banks[in_flight.bank] = false;
        let endpoint = self.endpoint(in_flight.bank);
        self.endpoints[endpoint].completed(token);
        Ok(in_flight)
    }

    /// Forwards an untimed access to the device serving `bank`.
    pub fn functional(&mut self, bank: usize, request: &Request, tlx: &PhysicalAddress) -> Data {
        let endpoint = self.endpoint(bank);
        log::debug!("functional {} to endpoint {}", request, endpoint);
        self.endpoints[endpoint].functional(request, tlx)
    }

    /// Collects the completions of devices that finish on their own.
    pub fn poll(&mut self, cycle: u64) -> Vec<(Token, Data)> {
        let mut completed = Vec::new();
        for endpoint in &mut self.endpoints {
            while let Some(done) = endpoint.pop_completed(cycle) {
                completed.push(done);
            }
        }
        completed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Forgets all in-flight requests, oldest issue first.
    pub fn drain(&mut self) -> Vec<InFlight> {
        self.busy_banks.fill(false);
        self.in_flight.drain(..).map(|(_, in_flight)| in_flight).collect()
    }
}
