use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{info, trace, warn};
use watch::WatchSender;

use crate::boost::{self, BoostSnapshot, BoostState};
use crate::cluster::ClusterState;
use crate::constants::MAX_CORES;
use crate::error::GovernorError;
use crate::freq_table::{FreqLimits, Relation};
use crate::gate::{self, Decision};
use crate::platform::{CoreId, DomainId, Platform};
use crate::sampler::{CoreSlot, CoreState};
use crate::tunables::TunableConfig;
use crate::worker::{SpeedChangeWorker, WorkerSignal};

/// State shared by the caller-facing API, the sampling timer and the
/// speed-change worker.
pub(crate) struct Shared<P> {
    pub(crate) platform: P,
    tunables: RwLock<Arc<TunableConfig>>,
    pub(crate) boost: BoostState,
    /// Indexed by core id.
    pub(crate) slots: Vec<CoreSlot>,
    /// Index into `clusters` for every core id.
    core_cluster: Vec<Option<usize>>,
    pub(crate) clusters: Vec<ClusterState>,
    waker: Mutex<Option<WatchSender<WorkerSignal>>>,
}

impl<P: Platform> Shared<P> {
    pub(crate) fn tunables(&self) -> Arc<TunableConfig> {
        Arc::clone(&self.tunables.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn cluster_of(&self, core: CoreId) -> Option<&ClusterState> {
        let index = (*self.core_cluster.get(core)?)?;
        self.clusters.get(index)
    }

    pub(crate) fn cluster_by_id(&self, domain: DomainId) -> Option<&ClusterState> {
        self.clusters.iter().find(|c| c.id == domain)
    }

    pub(crate) fn install_waker(&self, send: WatchSender<WorkerSignal>) {
        *self.waker.lock().unwrap_or_else(PoisonError::into_inner) = Some(send);
    }

    pub(crate) fn take_waker(&self) -> Option<WatchSender<WorkerSignal>> {
        self.waker.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub(crate) fn wake_worker(&self) {
        if let Some(send) = self
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            send.send(WorkerSignal::Wake);
        }
    }

    /// Arms the core's timer one period from now and starts a fresh
    /// accounting window.
    pub(crate) fn rearm(&self, core: &mut CoreState, id: CoreId, tunables: &TunableConfig) {
        let reading = self.platform.idle_time(id, tunables.io_is_busy);
        let rate = tunables.timer_rate_us;
        let deadline = if tunables.align_windows {
            (reading.wall_us / rate + 1) * rate
        } else {
            reading.wall_us + rate
        };
        core.next_sample_at = Some(deadline);
        core.restart_window(reading);
    }

    /// Runs the timer callback of one core. `None` if the core is disabled or
    /// busy with a lifecycle transition.
    pub(crate) fn sample(&self, id: CoreId) -> Option<Decision> {
        let cluster = self.cluster_of(id)?;
        let mut core = self.slots.get(id)?.try_active()?;
        let tunables = self.tunables();
        let boost = self.boost.snapshot();

        let reading = self.platform.idle_time(id, tunables.io_is_busy);
        let now = core.update_load(reading, cluster.cur());
        let decision = gate::evaluate(&mut core, &tunables, &cluster.view(), &boost, now);
        trace!("core {id}: {decision:?}");

        core.next_sample_at = None;
        if let Decision::Commit { .. } = decision {
            cluster.mark_dirty(id);
        }
        if decision.rearm() {
            self.rearm(&mut core, id, &tunables);
        }
        drop(core);

        if let Decision::Commit { .. } = decision {
            self.wake_worker();
        }
        Some(decision)
    }

    /// Accounts the load every member ran at the old frequency, then records
    /// the new one.
    pub(crate) fn account_transition(&self, cluster: &ClusterState, new_freq: u32) {
        let io_is_busy = self.tunables().io_is_busy;
        let old_freq = cluster.cur();
        for &id in &cluster.cores {
            if let Some(mut core) = self.slots.get(id).and_then(CoreSlot::try_active) {
                let reading = self.platform.idle_time(id, io_is_busy);
                core.update_load(reading, old_freq);
            }
        }
        cluster.set_cur(new_freq);
    }

    fn raise_all_to_hispeed(&self, now: u64) {
        let tunables = self.tunables();
        let mut any = false;
        for cluster in &self.clusters {
            let limits = cluster.limits();
            let hispeed = tunables.hispeed_for(limits.max);
            let Some(freq) = cluster
                .table
                .resolve(u64::from(hispeed), Relation::Low, limits)
            else {
                continue;
            };
            for &id in &cluster.cores {
                let Some(mut core) = self.slots.get(id).and_then(CoreSlot::try_active) else {
                    continue;
                };
                if boost::raise_to_hispeed(&mut core, freq, now) {
                    cluster.mark_dirty(id);
                    any = true;
                }
            }
        }
        if any {
            self.wake_worker();
        }
    }
}

/// An impulse governor instance managing the cores of one platform.
pub struct Governor<P: Platform> {
    shared: Arc<Shared<P>>,
    worker: Mutex<Option<SpeedChangeWorker>>,
}

impl<P: Platform> Governor<P> {
    pub fn new(platform: P, tunables: TunableConfig) -> Result<Self, GovernorError> {
        tunables.validate()?;
        let domains = platform.domains()?;

        let mut core_cluster: Vec<Option<usize>> = Vec::new();
        for (index, domain) in domains.iter().enumerate() {
            if domain.table.is_empty() {
                return Err(GovernorError::Config(format!(
                    "frequency domain {} has an empty frequency table",
                    domain.id
                )));
            }
            for &core in &domain.cores {
                if core >= MAX_CORES {
                    return Err(GovernorError::CoreOutOfRange {
                        core,
                        max: MAX_CORES,
                    });
                }
                if core >= core_cluster.len() {
                    core_cluster.resize(core + 1, None);
                }
                core_cluster[core] = Some(index);
            }
        }

        let slots = (0..core_cluster.len()).map(|_| CoreSlot::new()).collect();
        let clusters = domains.into_iter().map(ClusterState::new).collect();

        Ok(Self {
            shared: Arc::new(Shared {
                platform,
                tunables: RwLock::new(Arc::new(tunables)),
                boost: BoostState::new(),
                slots,
                core_cluster,
                clusters,
                waker: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<P>> {
        &self.shared
    }

    pub fn platform(&self) -> &P {
        &self.shared.platform
    }

    /// Every core that belongs to a frequency domain.
    pub fn cores(&self) -> Vec<CoreId> {
        self.shared
            .core_cluster
            .iter()
            .enumerate()
            .filter_map(|(id, cluster)| cluster.map(|_| id))
            .collect()
    }

    /// Whether the speed-change worker is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Starts managing `cores`. Fails without enabling anything if the
    /// speed-change worker cannot be spawned.
    pub fn start(&self, cores: &[CoreId]) -> Result<(), GovernorError> {
        let clusters = cores
            .iter()
            .map(|&id| self.shared.cluster_of(id).ok_or(GovernorError::UnknownCore(id)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_none() {
            *worker = Some(SpeedChangeWorker::spawn(Arc::clone(&self.shared))?);
            info!("speed-change worker started");
        }

        let tunables = self.tunables();
        for (&id, cluster) in cores.iter().zip(clusters) {
            let mut core = self.shared.slots[id].transition();
            if core.enabled {
                continue;
            }
            let limits = cluster.limits();
            if tunables.hispeed_freq == 0 {
                info!(
                    "core {id}: hispeed_freq unset, using the policy maximum of {} kHz",
                    limits.max
                );
            }
            let cur = cluster.cur();
            let target = cluster
                .table
                .resolve(u64::from(cur), Relation::Low, limits)
                .unwrap_or(cur);
            *core = CoreState::started(target, limits.max, self.shared.platform.now_us());
            self.shared.rearm(&mut core, id, &tunables);
            info!("core {id}: governor started at {target} kHz");
        }
        Ok(())
    }

    /// Stops managing `cores`; pending speed changes they requested are
    /// discarded. The worker exits once no core is left.
    pub fn stop(&self, cores: &[CoreId]) -> Result<(), GovernorError> {
        let clusters = cores
            .iter()
            .map(|&id| self.shared.cluster_of(id).ok_or(GovernorError::UnknownCore(id)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        for (&id, cluster) in cores.iter().zip(clusters) {
            let mut core = self.shared.slots[id].transition();
            if !core.enabled {
                continue;
            }
            core.enabled = false;
            core.idle = false;
            core.next_sample_at = None;
            cluster.discard_dirty(id);
            info!("core {id}: governor stopped");
        }

        let any_enabled = self.shared.slots.iter().any(|s| s.snapshot().enabled);
        if !any_enabled {
            if let Some(w) = worker.take() {
                w.shutdown(&self.shared);
                info!("speed-change worker stopped");
            }
        }
        Ok(())
    }

    /// New policy bounds for the domain of `core`. Targets are clamped into
    /// them and the worker moves the domain; a raised ceiling restarts the
    /// sampling window of each member.
    pub fn limits_changed(&self, core: CoreId, min: u32, max: u32) -> Result<(), GovernorError> {
        if min > max {
            return Err(GovernorError::InvalidTunable {
                name: "limits",
                reason: format!("min {min} kHz is above max {max} kHz"),
            });
        }
        let cluster = self
            .shared
            .cluster_of(core)
            .ok_or(GovernorError::UnknownCore(core))?;
        let limits = FreqLimits::new(min, max);
        cluster.set_limits(limits);
        info!("domain {}: limits now {min}..={max} kHz", cluster.id);

        let tunables = self.tunables();
        let mut any = false;
        for &id in &cluster.cores {
            let Some(mut core) = self.shared.slots[id].try_active() else {
                continue;
            };
            let clamped = if core.target_freq > max {
                cluster
                    .table
                    .resolve(u64::from(max), Relation::High, limits)
            } else if core.target_freq < min {
                cluster.table.resolve(u64::from(min), Relation::Low, limits)
            } else {
                None
            };
            if let Some(freq) = clamped {
                core.target_freq = freq;
            }
            if max > core.max_freq {
                self.shared.rearm(&mut core, id, &tunables);
            }
            core.max_freq = max;
            cluster.mark_dirty(id);
            any = true;
        }
        if any {
            self.shared.wake_worker();
        }
        Ok(())
    }

    /// Runs one sample of `core` right away.
    pub fn sample(&self, core: CoreId) -> Option<Decision> {
        self.shared.sample(core)
    }

    pub fn idle_enter(&self, id: CoreId) {
        let Some(cluster) = self.shared.cluster_of(id) else {
            return;
        };
        let Some(mut core) = self.shared.slots[id].try_active() else {
            return;
        };
        core.idle = true;
        let limits = cluster.limits();
        if core.target_freq >= limits.max {
            core.max_freq_idle_start_time = self.shared.platform.now_us();
        }
        // Idle above the minimum still holds the domain up; keep sampling so
        // the core can let go.
        if core.target_freq != limits.min && core.next_sample_at.is_none() {
            self.shared.rearm(&mut core, id, &self.tunables());
        }
    }

    pub fn idle_exit(&self, id: CoreId) {
        let overdue = {
            let Some(mut core) = self.shared.slots.get(id).and_then(CoreSlot::try_active) else {
                return;
            };
            core.idle = false;
            match core.next_sample_at {
                None => {
                    self.shared.rearm(&mut core, id, &self.tunables());
                    false
                }
                Some(deadline) => self.shared.platform.now_us() >= deadline,
            }
        };
        if overdue {
            self.shared.sample(id);
        }
    }

    /// Notification that `domain` now runs at `freq`, whoever changed it.
    pub fn frequency_changed(&self, domain: DomainId, freq: u32) -> Result<(), GovernorError> {
        let cluster = self
            .shared
            .cluster_by_id(domain)
            .ok_or_else(|| GovernorError::Config(format!("unknown frequency domain {domain}")))?;
        self.shared.account_transition(cluster, freq);
        Ok(())
    }

    pub fn tunables(&self) -> Arc<TunableConfig> {
        self.shared.tunables()
    }

    /// Replaces every tunable at once; on error the previous set stays.
    pub fn set_tunables(&self, tunables: TunableConfig) -> Result<(), GovernorError> {
        self.update_tunables(|t| *t = tunables)
    }

    /// Applies `update` to a copy of the current tunables and publishes it if
    /// it validates.
    pub fn update_tunables(
        &self,
        update: impl FnOnce(&mut TunableConfig),
    ) -> Result<(), GovernorError> {
        let mut current = self
            .shared
            .tunables
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = TunableConfig::clone(&current);
        update(&mut next);
        if let Err(e) = next.validate() {
            warn!("rejected tunables update: {e}");
            return Err(e);
        }
        *current = Arc::new(next);
        Ok(())
    }

    pub fn boost(&self) -> BoostSnapshot {
        self.shared.boost.snapshot()
    }

    /// Indefinite boost. Turning it off lets the next samples drop normally.
    pub fn set_boost(&self, enabled: bool) {
        let now = self.shared.platform.now_us();
        self.shared.boost.set_indefinite(enabled, now);
        if enabled {
            self.shared.raise_all_to_hispeed(now);
        }
        info!("boost {}", if enabled { "on" } else { "off" });
    }

    /// Boosts for `duration_us`, or the configured pulse duration.
    pub fn boost_pulse(&self, duration_us: Option<u64>) {
        let duration = duration_us.unwrap_or_else(|| self.tunables().boostpulse_duration_us);
        let now = self.shared.platform.now_us();
        self.shared.boost.start_pulse(now.saturating_add(duration));
        self.shared.raise_all_to_hispeed(now);
        trace!("boost pulse for {duration} us");
    }

    /// External co-boost signal, e.g. from input events.
    pub fn set_coboost(&self, enabled: bool) {
        self.shared.boost.set_coboost(enabled);
    }

    pub fn core_state(&self, core: CoreId) -> Option<CoreState> {
        self.shared.slots.get(core).map(CoreSlot::snapshot)
    }

    /// Frequency `domain` runs at, as last applied or notified.
    pub fn domain_freq(&self, domain: DomainId) -> Option<u32> {
        self.shared.cluster_by_id(domain).map(ClusterState::cur)
    }
}

impl<P: Platform> Drop for Governor<P> {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.shutdown(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freq_table::FrequencyTable;
    use crate::gate::HoldReason;
    use crate::platform::DomainInfo;
    use crate::sim::SimPlatform;
    use crate::tunables::ThresholdTable;

    const RATE: u64 = 20_000;

    fn platform() -> SimPlatform {
        SimPlatform::new(vec![DomainInfo {
            id: 0,
            cores: vec![0, 1],
            table: FrequencyTable::new([200, 400, 800, 1200, 1600]),
            limits: FreqLimits::new(200, 1600),
            cur: 400,
        }])
    }

    fn tunables() -> TunableConfig {
        TunableConfig {
            target_loads: ThresholdTable::single(90),
            above_hispeed_delay: ThresholdTable::single(0),
            hispeed_freq: 1200,
            go_lowspeed_load: 5,
            timer_rate_us: RATE,
            ..TunableConfig::default()
        }
    }

    fn started() -> Governor<SimPlatform> {
        let gov = Governor::new(platform(), tunables()).unwrap();
        gov.start(&[0, 1]).unwrap();
        gov
    }

    #[test]
    fn test_start_initializes_cores() {
        let gov = started();
        assert!(gov.is_running());
        let core = gov.core_state(0).unwrap();
        assert!(core.enabled);
        assert_eq!(core.target_freq, 400);
        assert_eq!(core.floor_freq, 400);
        assert_eq!(core.next_sample_at, Some(RATE));
    }

    #[test]
    fn test_start_rejects_unknown_core() {
        let gov = Governor::new(platform(), tunables()).unwrap();
        assert!(matches!(gov.start(&[0, 7]), Err(GovernorError::UnknownCore(7))));
        assert!(!gov.core_state(0).unwrap().enabled);
        assert!(!gov.is_running());
    }

    #[test]
    fn test_unset_hispeed_resolves_per_domain() {
        let platform = SimPlatform::new(vec![
            DomainInfo {
                id: 0,
                cores: vec![0],
                table: FrequencyTable::new([200, 800, 1600]),
                limits: FreqLimits::new(200, 1600),
                cur: 200,
            },
            DomainInfo {
                id: 4,
                cores: vec![1],
                table: FrequencyTable::new([300, 900, 2400]),
                limits: FreqLimits::new(300, 2400),
                cur: 300,
            },
        ]);
        let t = TunableConfig {
            hispeed_freq: 0,
            ..tunables()
        };
        let gov = Governor::new(platform, t).unwrap();
        gov.start(&[0, 1]).unwrap();
        assert_eq!(gov.tunables().hispeed_freq, 0);

        gov.set_boost(true);
        assert_eq!(gov.core_state(0).unwrap().target_freq, 1600);
        assert_eq!(gov.core_state(1).unwrap().target_freq, 2400);
        assert_eq!(gov.core_state(1).unwrap().floor_freq, 2400);
    }

    /// Cores enabled without a worker, so the domain only moves through
    /// `frequency_changed`.
    fn enabled() -> Governor<SimPlatform> {
        let gov = Governor::new(platform(), tunables()).unwrap();
        for id in [0, 1] {
            let mut core = gov.shared.slots[id].transition();
            *core = CoreState::started(400, 1600, 0);
            gov.shared.rearm(&mut core, id, &gov.tunables());
        }
        gov
    }

    #[test]
    fn test_sample_commits_and_marks_dirty() {
        let gov = enabled();
        gov.platform().set_load(0, 95);
        gov.platform().advance(RATE);
        assert_eq!(gov.sample(0), Some(Decision::Commit { freq: 800, rearm: true }));
        assert_eq!(gov.shared.clusters[0].take_dirty(), 0b01);
        assert_eq!(gov.core_state(0).unwrap().next_sample_at, Some(2 * RATE));
    }

    #[test]
    fn test_sample_same_instant_holds() {
        let gov = started();
        assert_eq!(gov.sample(0), Some(Decision::Hold(HoldReason::NoElapsedTime)));
        assert!(gov.core_state(0).unwrap().next_sample_at.is_some());
    }

    #[test]
    fn test_stopped_core_is_not_sampled() {
        let gov = started();
        gov.stop(&[1]).unwrap();
        gov.platform().advance(RATE);
        assert_eq!(gov.sample(1), None);
        assert!(gov.is_running());
        gov.stop(&[0]).unwrap();
        assert!(!gov.is_running());
    }

    #[test]
    fn test_rejected_tunables_keep_previous() {
        let gov = started();
        let err = gov.update_tunables(|t| t.go_hispeed_load = 0);
        assert!(err.is_err());
        assert_eq!(gov.tunables().go_hispeed_load, tunables().go_hispeed_load);
        gov.update_tunables(|t| t.go_hispeed_load = 85).unwrap();
        assert_eq!(gov.tunables().go_hispeed_load, 85);
    }

    #[test]
    fn test_limits_clamp_targets() {
        let gov = started();
        gov.limits_changed(0, 200, 800).unwrap();
        gov.platform().set_load(0, 100);
        gov.platform().set_load(1, 100);
        gov.platform().advance(RATE);
        assert!(matches!(gov.sample(0), Some(Decision::Commit { freq: 800, .. })));
        assert!(gov.limits_changed(0, 900, 800).is_err());
    }

    #[test]
    fn test_limits_lowered_below_target() {
        let gov = started();
        gov.shared.slots[0].transition().target_freq = 1600;
        gov.limits_changed(1, 200, 1200).unwrap();
        assert_eq!(gov.core_state(0).unwrap().target_freq, 1200);
        assert_eq!(gov.core_state(0).unwrap().max_freq, 1200);
    }

    #[test]
    fn test_boost_raises_targets_and_floor() {
        let gov = started();
        gov.platform().advance(1_000);
        gov.boost_pulse(None);
        let core = gov.core_state(1).unwrap();
        assert_eq!(core.target_freq, 1200);
        assert_eq!(core.floor_freq, 1200);
        assert_eq!(core.floor_validate_time, 1_000);
        assert_eq!(gov.boost().pulse_end_us, 1_000 + tunables().boostpulse_duration_us);
    }

    #[test]
    fn test_pulse_keeps_moderate_load_at_hispeed() {
        let gov = enabled();
        gov.boost_pulse(Some(1_000_000));
        gov.frequency_changed(0, 1200).unwrap();
        gov.platform().set_load(0, 30);

        for _ in 0..39 {
            gov.platform().advance(RATE);
            assert_eq!(gov.sample(0), Some(Decision::Unchanged { rearm: true }));
            let core = gov.core_state(0).unwrap();
            assert!(core.target_freq >= 1200, "dropped to {}", core.target_freq);
            assert_eq!(core.floor_validate_time, 0);
        }
    }

    #[test]
    fn test_core_drops_once_pulse_ends() {
        let gov = enabled();
        // a floor refreshed by the boosted samples would hold until 160 ms
        gov.boost_pulse(Some(5 * RATE));
        gov.frequency_changed(0, 1200).unwrap();
        gov.platform().set_load(0, 30);

        for _ in 0..4 {
            gov.platform().advance(RATE);
            gov.sample(0);
            assert_eq!(gov.core_state(0).unwrap().target_freq, 1200);
        }
        gov.platform().advance(RATE);
        assert!(!gov.boost().is_active(5 * RATE));
        assert_eq!(gov.sample(0), Some(Decision::Commit { freq: 400, rearm: true }));
        assert_eq!(gov.core_state(0).unwrap().floor_freq, 400);
    }

    #[test]
    fn test_coboost_sample_commits_hispeed() {
        let gov = enabled();
        gov.set_coboost(true);
        gov.platform().set_load(0, 30);
        gov.platform().advance(RATE);
        assert_eq!(gov.sample(0), Some(Decision::Commit { freq: 1200, rearm: true }));
        // floor stays where it was before the boost
        assert_eq!(gov.core_state(0).unwrap().floor_freq, 400);

        gov.set_coboost(false);
        gov.frequency_changed(0, 1200).unwrap();
        gov.platform().advance(RATE);
        assert_eq!(gov.sample(0), Some(Decision::Commit { freq: 400, rearm: true }));
    }

    #[test]
    fn test_boost_off_ends_pulse() {
        let gov = started();
        gov.set_boost(true);
        assert!(gov.boost().indefinite);
        gov.platform().advance(5_000);
        gov.set_boost(false);
        let boost = gov.boost();
        assert!(!boost.indefinite);
        assert_eq!(boost.pulse_end_us, 5_000);
    }

    #[test]
    fn test_idle_exit_samples_overdue_core() {
        let gov = started();
        gov.idle_enter(0);
        assert!(gov.core_state(0).unwrap().idle);
        gov.platform().advance(3 * RATE);
        gov.idle_exit(0);
        let core = gov.core_state(0).unwrap();
        assert!(!core.idle);
        assert_eq!(core.next_sample_at, Some(4 * RATE));
    }

    #[test]
    fn test_idle_enter_at_max_stamps_time() {
        let gov = started();
        gov.shared.slots[0].transition().target_freq = 1600;
        gov.platform().advance(7_000);
        gov.idle_enter(0);
        assert_eq!(gov.core_state(0).unwrap().max_freq_idle_start_time, 7_000);
    }

    #[test]
    fn test_frequency_change_accounts_old_speed() {
        let gov = started();
        gov.platform().set_load(0, 100);
        gov.platform().advance(RATE / 2);
        gov.frequency_changed(0, 800).unwrap();
        assert_eq!(gov.domain_freq(0), Some(800));
        let core = gov.core_state(0).unwrap();
        assert_eq!(core.cputime_speedadj, (RATE / 2) * 400);
        assert!(gov.frequency_changed(9, 800).is_err());
    }
}
