use crate::{
    channel::AdmissionRejected,
    config::Config,
    scheduler::{Scheduler, Topology},
    traffic::{self, Generator},
};
use color_eyre::eyre;
use console::style;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub traffic: traffic::Config,
    pub num_requesters: usize,
    /// Device latency in cycles
    pub latency: u64,
    pub seed: u64,
    pub max_cycles: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            traffic: traffic::Config::default(),
            num_requesters: 4,
            latency: 20,
            seed: 0,
            max_cycles: None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("no completion after {cycles} cycles ({outstanding} requests outstanding)")]
    Deadlock { cycles: u64, outstanding: usize },

    #[error("reached the cycle limit of {0}")]
    CycleLimit(u64),
}

/// Runs synthetic traffic through a scheduler with fixed latency devices until
/// every generated request has been answered.
pub fn run(config: &Config, options: &Options) -> eyre::Result<stats::Stats> {
    let topology = Topology::fixed_latency(config, options.latency);
    let mut scheduler = Scheduler::new(config.clone(), topology)?;

    let mut generators: Vec<Generator> = (0..options.num_requesters)
        .map(|id| {
            Generator::new(
                id,
                options.traffic.clone(),
                scheduler.interleaver().clone(),
                options.seed,
            )
        })
        .collect();

    // a request waits at most for every queue, the devices and the responses ahead of it
    let deadlock_window = 100 * (options.latency + 1) * (config.unified_buffer_size() as u64 + 1);
    let mut last_progress = 0;
    let mut cycle: u64 = 0;

    while !(generators.iter().all(Generator::is_done) && scheduler.is_idle()) {
        if let Some(max_cycles) = options.max_cycles {
            if cycle >= max_cycles {
                return Err(SimError::CycleLimit(max_cycles).into());
            }
        }

        for generator in &mut generators {
            let Some(request) = generator.next_request(cycle) else {
                continue;
            };
            match scheduler.admit(request.clone()) {
                Ok(_) => generator.accepted(cycle),
                Err(
                    AdmissionRejected::QueueFull { .. } | AdmissionRejected::QuotaExceeded { .. },
                ) => generator.rejected(request),
                Err(err @ AdmissionRejected::OutOfRange { .. }) => return Err(err.into()),
            }
        }

        scheduler.tick(cycle);

        for retry in scheduler.take_retries() {
            generators[retry.requester].retry();
        }
        for generator in &mut generators {
            while scheduler.pop_response(generator.id).is_some() {
                generator.completed += 1;
                last_progress = cycle;
            }
        }

        if cycle - last_progress > deadlock_window {
            let outstanding = scheduler
                .channels()
                .iter()
                .map(|channel| channel.queue().len() + channel.response_credits_used())
                .sum();
            return Err(SimError::Deadlock {
                cycles: cycle,
                outstanding,
            }
            .into());
        }
        cycle += 1;
    }

    let stats = scheduler.stats();
    log::info!(
        "completed {} requests in {} cycles",
        style(stats.reduce().scheduler.completed.total()).green(),
        cycle
    );
    Ok(stats)
}
