use crate::{request::Response, scheduler::Scheduler};

static LOGGER: std::sync::Once = std::sync::Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        env_logger::builder().is_test(true).init();
    });
}

/// Ticks `scheduler` from `start` and collects responses until it is idle.
///
/// Returns the responses and the first cycle at which the scheduler was idle.
pub fn run_until_idle(
    scheduler: &mut Scheduler,
    start: u64,
    max_cycles: u64,
) -> (Vec<Response>, u64) {
    let mut responses = Vec::new();
    let mut cycle = start;
    while !scheduler.is_idle() {
        assert!(
            cycle < start + max_cycles,
            "scheduler not idle after {max_cycles} cycles"
        );
        scheduler.tick(cycle);
        responses.extend(scheduler.drain_responses());
        cycle += 1;
    }
    (responses, cycle)
}
