use crate::{
    address,
    channel::{AdmissionRejected, Channel, Retry},
    config::{Config, ConfigError},
    device::{Detached, Device, FixedLatency},
    dispatch::ResponseError,
    interleave::{AddressInterleaver, PhysicalAddress},
    page::BankState,
    request::{Cancelled, Data, Issued, Request, RequestId, RequesterId, Response, Token},
};

use itertools::Itertools;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Downstream devices of every channel.
///
/// Each channel has between one and `banks_per_channel` endpoints. Bank `b`
/// of a channel is served by endpoint `b % endpoints`.
#[derive(Debug, Default)]
pub struct Topology {
    pub channels: Vec<Vec<Box<dyn Device>>>,
}

impl Topology {
    /// One endpoint per channel built by `device`.
    pub fn uniform<F>(config: &Config, mut device: F) -> Self
    where
        F: FnMut(usize) -> Box<dyn Device>,
    {
        Self {
            channels: (0..config.channel_count)
                .map(|channel| vec![device(channel)])
                .collect(),
        }
    }

    /// One endpoint per bank, each built by `device(channel, bank)`.
    pub fn per_bank<F>(config: &Config, mut device: F) -> Self
    where
        F: FnMut(usize, usize) -> Box<dyn Device>,
    {
        let num_banks = config.num_banks();
        Self {
            channels: (0..config.channel_count)
                .map(|channel| (0..num_banks).map(|bank| device(channel, bank)).collect())
                .collect(),
        }
    }

    #[must_use]
    pub fn fixed_latency(config: &Config, latency: u64) -> Self {
        Self::uniform(config, |_| Box::new(FixedLatency::new(latency)))
    }

    #[must_use]
    pub fn detached(config: &Config) -> Self {
        Self::uniform(config, |_| Box::new(Detached::new()))
    }

    pub fn validate(&self, config: &Config) -> Result<(), ConfigError> {
        if self.channels.len() != config.channel_count {
            return Err(ConfigError::TopologyChannels {
                have: self.channels.len(),
                want: config.channel_count,
            });
        }
        let banks = config.num_banks();
        for (channel, endpoints) in self.channels.iter().enumerate() {
            if endpoints.is_empty() || banks % endpoints.len() != 0 {
                return Err(ConfigError::TopologyEndpoints {
                    channel,
                    endpoints: endpoints.len(),
                    banks,
                });
            }
        }
        Ok(())
    }
}

/// Multi-channel memory request scheduler.
///
/// Requests are admitted into the queue of the channel their address decodes
/// to. Every [`Scheduler::tick`] gives each channel one scheduling
/// opportunity. Channels never share mutable state.
#[derive(Debug)]
pub struct Scheduler {
    config: Config,
    interleaver: AddressInterleaver,
    channels: Vec<Channel>,
    next_id: u64,
    cycles: u64,
}

impl Scheduler {
    pub fn new(config: Config, topology: Topology) -> Result<Self, ConfigError> {
        config.validate()?;
        topology.validate(&config)?;
        let interleaver = AddressInterleaver::new(&config)?;
        let channels = topology
            .channels
            .into_iter()
            .enumerate()
            .map(|(id, endpoints)| Channel::new(id, endpoints, &config))
            .collect();
        log::info!("memory scheduler: {}", config);
        log::debug!(
            "interleave {} with {} rows of {} bytes per bank",
            interleaver.order().iter().join(""),
            interleaver.num_rows(),
            interleaver.row_size()
        );
        Ok(Self {
            config,
            interleaver,
            channels,
            next_id: 0,
            cycles: 0,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn interleaver(&self) -> &AddressInterleaver {
        &self.interleaver
    }

    #[must_use]
    pub fn decode(&self, addr: address) -> PhysicalAddress {
        self.interleaver.decode(addr)
    }

    #[must_use]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    #[must_use]
    pub fn channel(&self, id: usize) -> Option<&Channel> {
        self.channels.get(id)
    }

    #[must_use]
    pub fn bank_state(&self, channel: usize, bank: usize) -> Option<&BankState> {
        self.channels.get(channel)?.banks().get(bank)
    }

    /// The address range served by the scheduler.
    #[must_use]
    pub fn addr_range(&self) -> std::ops::Range<address> {
        let start = self.config.base_address;
        start..start + self.config.memory_size
    }

    /// Whether `request` would be admitted right now.
    #[must_use]
    pub fn can_admit(&self, request: &Request) -> bool {
        if !self.interleaver.contains(request.addr) {
            return false;
        }
        let tlx = self.interleaver.decode(request.addr);
        self.channels[tlx.channel as usize]
            .queue()
            .can_admit_for(request.requester, request.kind)
    }

    /// Admits a request into its channel queue.
    ///
    /// Rejection is synchronous and leaves no state behind other than the
    /// pending retry notification for the requester.
    pub fn admit(&mut self, request: Request) -> Result<RequestId, AdmissionRejected> {
        if !self.interleaver.contains(request.addr) {
            log::warn!("rejecting {}: outside of the served range", request);
            return Err(AdmissionRejected::OutOfRange { addr: request.addr });
        }
        let tlx = self.interleaver.decode(request.addr);
        let id = RequestId(self.next_id);
        self.channels[tlx.channel as usize].admit(id, request, tlx)?;
        self.next_id += 1;
        Ok(id)
    }

    /// Gives every channel one scheduling opportunity at `cycle`.
    ///
    /// Returns the requests issued to devices, in channel order.
    #[cfg(feature = "parallel")]
    pub fn tick(&mut self, cycle: u64) -> Vec<Issued> {
        self.cycles += 1;
        self.channels
            .par_iter_mut()
            .filter_map(|channel| channel.cycle(cycle))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    pub fn tick(&mut self, cycle: u64) -> Vec<Issued> {
        self.tick_serial(cycle)
    }

    /// Same as [`Scheduler::tick`] but always visits channels one after another.
    pub fn tick_serial(&mut self, cycle: u64) -> Vec<Issued> {
        self.cycles += 1;
        self.channels
            .iter_mut()
            .filter_map(|channel| channel.cycle(cycle))
            .collect()
    }

    /// Performs an untimed access on the device serving `request.addr`.
    ///
    /// Nothing is queued and neither bank state nor statistics change.
    pub fn functional(&mut self, request: &Request) -> Result<Data, AdmissionRejected> {
        if !self.interleaver.contains(request.addr) {
            return Err(AdmissionRejected::OutOfRange { addr: request.addr });
        }
        let tlx = self.interleaver.decode(request.addr);
        Ok(self.channels[tlx.channel as usize].functional(request, &tlx))
    }

    pub fn on_device_response(&mut self, token: Token, data: Data) -> Result<(), ResponseError> {
        self.channels
            .get_mut(token.channel)
            .ok_or(ResponseError::UnknownToken(token))?
            .on_device_response(token, data)
    }

    /// Oldest buffered response of `requester` from the first channel holding one.
    pub fn pop_response(&mut self, requester: RequesterId) -> Option<Response> {
        self.channels
            .iter_mut()
            .find_map(|channel| channel.pop_response(requester))
    }

    pub fn drain_responses(&mut self) -> Vec<Response> {
        self.channels
            .iter_mut()
            .flat_map(Channel::drain_responses)
            .collect()
    }

    /// Requesters that were rejected and whose queue has space again.
    pub fn take_retries(&mut self) -> Vec<Retry> {
        self.channels
            .iter_mut()
            .flat_map(Channel::take_retries)
            .collect()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.channels.iter().all(Channel::is_idle)
    }

    #[must_use]
    pub fn stats(&self) -> stats::Stats {
        stats::Stats {
            cycles: self.cycles,
            channels: self
                .channels
                .iter()
                .map(|channel| channel.stats().clone())
                .collect(),
        }
    }

    /// Tears the scheduler down.
    ///
    /// Every admitted request that was not delivered is returned with the
    /// stage it was in, oldest first.
    #[must_use]
    pub fn shutdown(self) -> Vec<Cancelled> {
        let mut cancelled: Vec<_> = self
            .channels
            .into_iter()
            .flat_map(|channel| channel.shutdown().0)
            .collect();
        cancelled.sort_by_key(|cancelled| cancelled.id);
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::{Scheduler, Topology};
    use crate::{
        channel::AdmissionRejected,
        config::{Config, ConfigError},
        device::{Device, FixedLatency},
        request::{Kind, Request},
    };
    use color_eyre::eyre;

    #[test]
    fn test_topology_mismatch() {
        let config = Config {
            channel_count: 2,
            ..Config::default()
        };
        let topology = Topology::fixed_latency(&Config::default(), 1);
        assert_eq!(
            Scheduler::new(config.clone(), topology).err(),
            Some(ConfigError::TopologyChannels { have: 1, want: 2 })
        );

        let topology = Topology {
            channels: (0..2)
                .map(|_| {
                    (0..3)
                        .map(|_| Box::new(FixedLatency::new(1)) as Box<dyn Device>)
                        .collect()
                })
                .collect(),
        };
        assert!(matches!(
            Scheduler::new(config, topology),
            Err(ConfigError::TopologyEndpoints { endpoints: 3, .. })
        ));
    }

    #[test]
    fn test_requests_routed_by_channel() -> eyre::Result<()> {
        crate::testing::init_logging();
        let config = Config {
            channel_count: 4,
            ..Config::default()
        };
        let mut scheduler = Scheduler::new(config.clone(), Topology::fixed_latency(&config, 2))?;
        for line in 0..4 {
            scheduler.admit(Request::read(line * 64, line as usize, 0))?;
        }
        let issued = scheduler.tick(0);
        assert_eq!(issued.len(), 4);
        let channels: Vec<_> = issued.iter().map(|issued| issued.token.channel).collect();
        similar_asserts::assert_eq!(have: channels, want: vec![0, 1, 2, 3]);

        scheduler.tick(1);
        scheduler.tick(2);
        for requester in 0..4 {
            let response = scheduler.pop_response(requester).unwrap();
            assert_eq!(response.request.addr, requester as u64 * 64);
        }
        assert!(scheduler.is_idle());
        let stats = scheduler.stats();
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.reduce().scheduler.completed.get(Kind::Read), 4);
        Ok(())
    }

    #[test]
    fn test_out_of_range() -> eyre::Result<()> {
        let config = Config {
            base_address: 0x1000_0000,
            memory_size: 1 << 20,
            ..Config::default()
        };
        let mut scheduler = Scheduler::new(config.clone(), Topology::detached(&config))?;
        assert_eq!(
            scheduler.admit(Request::write(0x40, 0, 0)),
            Err(AdmissionRejected::OutOfRange { addr: 0x40 })
        );
        assert_eq!(scheduler.addr_range(), 0x1000_0000..0x1010_0000);
        assert!(!scheduler.can_admit(&Request::write(0x40, 0, 0)));
        assert!(scheduler.can_admit(&Request::write(0x1000_0040, 0, 0)));
        assert!(scheduler.functional(&Request::read(0x40, 0, 0)).is_err());
        assert!(scheduler.admit(Request::write(0x1000_0040, 0, 0)).is_ok());
        Ok(())
    }

    #[test]
    fn test_per_bank_endpoints() -> eyre::Result<()> {
        let config = Config::default();
        let topology = Topology::per_bank(&config, |_, _| Box::new(FixedLatency::new(1)));
        let mut scheduler = Scheduler::new(config, topology)?;
        // bank field starts at bit 11 with the default layout
        for bank in 0..4u64 {
            scheduler.admit(Request::write(bank << 11, 0, 0))?;
        }
        let (responses, _) = crate::testing::run_until_idle(&mut scheduler, 0, 16);
        assert_eq!(responses.len(), 4);
        let banks: Vec<_> = responses.iter().map(|response| response.tlx.bank).collect();
        similar_asserts::assert_eq!(have: banks, want: vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_tick_matches_serial_tick() -> eyre::Result<()> {
        use rand::{Rng, SeedableRng};

        let config = Config {
            channel_count: 4,
            read_buffer_size: 4,
            write_buffer_size: 8,
            ..Config::default()
        };
        let build = || -> eyre::Result<Scheduler> {
            let topology = Topology::uniform(&config, |channel| {
                Box::new(FixedLatency::new(3 + channel as u64).with_capacity(2))
            });
            Ok(Scheduler::new(config.clone(), topology)?)
        };
        let mut parallel = build()?;
        let mut serial = build()?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);

        for cycle in 0..500 {
            let addr = rng.gen_range(0..1u64 << 16) & !63;
            let request = if rng.gen_bool(0.3) {
                Request::write(addr, rng.gen_range(0..4), cycle)
            } else {
                Request::read(addr, rng.gen_range(0..4), cycle)
            };
            assert_eq!(parallel.admit(request.clone()), serial.admit(request));
            assert_eq!(parallel.tick(cycle), serial.tick_serial(cycle));
            assert_eq!(parallel.drain_responses(), serial.drain_responses());
            assert_eq!(parallel.take_retries(), serial.take_retries());
        }
        similar_asserts::assert_eq!(have: parallel.stats(), want: serial.stats());
        Ok(())
    }

    #[test]
    fn test_functional_access_is_untimed() -> eyre::Result<()> {
        let config = Config {
            channel_count: 2,
            ..Config::default()
        };
        let mut scheduler = Scheduler::new(config.clone(), Topology::detached(&config))?;
        let before = scheduler.stats();
        let addr = 3 << 12 | 64;
        let tlx = scheduler.decode(addr);

        let data = scheduler.functional(&Request::read(addr, 0, 0).with_size(4))?;
        assert_eq!(data.as_slice(), &[0x40u8, 0x41, 0x42, 0x43]);
        assert!(scheduler
            .functional(&Request::write(addr, 0, 0))?
            .is_empty());

        assert!(scheduler.is_idle());
        assert_eq!(scheduler.stats(), before);
        let bank = scheduler
            .bank_state(tlx.channel as usize, tlx.bank as usize)
            .unwrap();
        assert_eq!(bank.open_row, None);
        assert_eq!(bank.last_access, None);
        Ok(())
    }
}
