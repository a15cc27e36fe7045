//! The speed-change worker: the only context that calls the platform's
//! frequency setter.

use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, warn};

use crate::error::GovernorError;
use crate::freq_table::Relation;
use crate::governor::Shared;
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerSignal {
    Wake,
    Shutdown,
}

pub(crate) struct SpeedChangeWorker {
    handle: Option<JoinHandle<()>>,
}

impl SpeedChangeWorker {
    /// Spawns the worker thread and installs its wake channel in `shared`.
    pub(crate) fn spawn<P: Platform>(shared: Arc<Shared<P>>) -> Result<Self, GovernorError> {
        let (send, mut recv) = watch::channel(WorkerSignal::Wake);
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("impulse-speedchange".into())
            .spawn(move || {
                loop {
                    match recv.wait() {
                        WorkerSignal::Shutdown => break,
                        WorkerSignal::Wake => worker_shared.apply_pending(),
                    }
                }
                debug!("speed-change worker exiting");
            })
            .map_err(GovernorError::WorkerSpawn)?;
        shared.install_waker(send);
        // work queued before the waker existed
        shared.wake_worker();
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Signals the thread to exit and waits for it.
    pub(crate) fn shutdown<P: Platform>(mut self, shared: &Shared<P>) {
        if let Some(send) = shared.take_waker() {
            send.send(WorkerSignal::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("speed-change worker panicked");
            }
        }
    }
}

impl<P: Platform> Shared<P> {
    /// One drain pass over every cluster with pending work.
    pub(crate) fn apply_pending(&self) {
        let relation = if self.tunables().powersave_bias {
            Relation::Ceiling
        } else {
            Relation::High
        };

        for cluster in &self.clusters {
            if cluster.take_dirty() == 0 {
                continue;
            }
            let Some(aggregate) = cluster.aggregate(&self.slots) else {
                continue;
            };
            let cur = cluster.cur();
            if aggregate.freq == cur {
                continue;
            }

            match self
                .platform
                .set_frequency(cluster.id, aggregate.freq, relation)
            {
                Ok(()) => {
                    debug!(
                        "[FREQ] domain {} {} kHz -> {} kHz",
                        cluster.id, cur, aggregate.freq
                    );
                    self.account_transition(cluster, aggregate.freq);
                }
                Err(e) => {
                    warn!(
                        "domain {}: setting {} kHz failed: {e}",
                        cluster.id, aggregate.freq
                    );
                }
            }
        }
    }
}
