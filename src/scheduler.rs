//! Timer threads for checks and the heal loop.
//!
//! Each check owns a timer thread; tick bodies run on worker threads so a
//! slow script never stalls the cadence. Jittered start offsets keep a fleet
//! restarted in unison from stampeding its Consul agents in lockstep.

use rand::Rng;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{info, warn};

use crate::config::CheckSpec;
use crate::daemon::Daemon;
use crate::error::ApolloError;
use crate::heal;
use crate::ledger;
use crate::report;

/// Delay before the first firing of every check timer.
const INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Delay before the first heal firing.
const HEAL_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Draws per-check start offsets in milliseconds: sub-services uniformly in
/// [10, 200), the main service in [max_sub + 100, max_sub + 300).
fn assign_jitter(specs: Vec<CheckSpec>) -> Vec<(CheckSpec, Duration)> {
    let mut rng = rand::thread_rng();
    let mut max_sub: u64 = 0;

    specs
        .into_iter()
        .map(|spec| {
            let offset_ms = if spec.is_main {
                rng.gen_range(max_sub + 100..max_sub + 300)
            } else {
                let offset = rng.gen_range(10..200);
                max_sub = max_sub.max(offset);
                offset
            };
            (spec, Duration::from_millis(offset_ms))
        })
        .collect()
}

/// Arms every timer and returns their join handles. The timers run until the
/// process exits.
pub struct Scheduler {
    daemon: Arc<Daemon>,
}

impl Scheduler {
    /// Creates a scheduler over the shared daemon state.
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon }
    }

    /// Wipes the track directory, then arms one timer per check plus the
    /// heal timer.
    pub fn start(&self) -> Result<Vec<thread::JoinHandle<()>>, ApolloError> {
        let config = self.daemon.config();
        ledger::reset_track_directory(&config.track_directory)
            .map_err(|source| ApolloError::TrackDirectory { source })?;

        let specs = config.check_specs();
        info!(
            "scheduling {} check(s) and a heal loop every {}s",
            specs.len(),
            config.heal_frequency
        );

        let mut handles = Vec::new();
        for (spec, jitter) in assign_jitter(specs) {
            handles.push(spawn_check_timer(Arc::clone(&self.daemon), spec, jitter));
        }
        handles.push(spawn_heal_timer(Arc::clone(&self.daemon)));
        Ok(handles)
    }
}

fn spawn_check_timer(
    daemon: Arc<Daemon>,
    spec: CheckSpec,
    jitter: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let frequency = Duration::from_secs(spec.frequency.max(1));
        let in_flight = Arc::new(AtomicBool::new(false));

        thread::sleep(INITIAL_DELAY);
        loop {
            thread::sleep(jitter);

            if in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let daemon = Arc::clone(&daemon);
                let spec = spec.clone();
                let in_flight = Arc::clone(&in_flight);
                thread::spawn(move || {
                    daemon.run_check_tick(&spec);
                    in_flight.store(false, Ordering::SeqCst);
                });
            } else {
                warn!("check '{}' still running, dropping this tick", spec.name);
            }

            thread::sleep(frequency);
        }
    })
}

fn spawn_heal_timer(daemon: Arc<Daemon>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let frequency = Duration::from_secs(daemon.config().heal_frequency.max(1));

        thread::sleep(HEAL_INITIAL_DELAY);
        loop {
            heal::run_heal(&daemon, false);
            report::write_report(&daemon);
            thread::sleep(frequency);
        }
    })
}
