//! The sampling timer loop: fires per-core sampling deadlines.
//!
//! Deadlines are deferrable. A core inside an idle period is not woken for
//! its deadline; it is sampled when it leaves idle, or once the slack timer
//! runs out if it holds its domain above the minimum.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};

use crate::governor::{Governor, Shared};
use crate::platform::{CoreId, Platform};
use crate::tunables::TunableConfig;

// us
const MIN_WAIT_US: u64 = 1_000;

pub struct SamplingTimer {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SamplingTimer {
    pub fn spawn<P: Platform>(governor: Arc<Governor<P>>) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("impulse-timer".into())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    let wait = governor.shared().poll_timers();
                    thread::sleep(Duration::from_micros(wait));
                }
                debug!("sampling timer exiting");
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("sampling timer panicked");
            }
        }
    }
}

impl<P: Platform> Shared<P> {
    /// Samples every core whose deadline has passed and returns how long the
    /// loop may sleep before the next one.
    pub(crate) fn poll_timers(&self) -> u64 {
        let tunables = self.tunables();
        let wait = (0..self.slots.len())
            .filter_map(|id| self.poll_core(id, &tunables))
            .fold(tunables.timer_rate_us, u64::min);
        wait.clamp(MIN_WAIT_US, tunables.timer_rate_us.max(MIN_WAIT_US))
    }

    /// Time until this core wants polling again, `None` if it has no
    /// pending deadline.
    fn poll_core(&self, id: CoreId, tunables: &TunableConfig) -> Option<u64> {
        let cluster = self.cluster_of(id)?;
        let now = self.platform.now_us();
        {
            let mut core = self.slots[id].try_active()?;
            let next = core.next_sample_at;
            match next {
                None => {
                    // without idle hooks nothing else would re-arm the core
                    if !self.platform.reports_idle_transitions() {
                        self.rearm(&mut core, id, tunables);
                    }
                    return core.next_sample_at.map(|d| d.saturating_sub(now));
                }
                Some(deadline) if now < deadline => return Some(deadline - now),
                Some(deadline) if core.idle => {
                    let slack = tunables.timer_slack_us?;
                    if core.target_freq <= cluster.limits().min {
                        return None;
                    }
                    let expires = deadline.saturating_add(slack);
                    if now < expires {
                        return Some(expires - now);
                    }
                }
                Some(_) => {}
            }
        }
        self.sample(id);
        None
    }
}
