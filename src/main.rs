use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use impulse_governor::{
    Governor, Platform,
    config::load_config,
    status::{GovernorStatus, write_status},
    sysfs::SysfsPlatform,
    timer::SamplingTimer,
};
use log::{error, info, warn};

/// Rate limit for the periodic summary and status file.
struct LogThrottle {
    last_log: Instant,
    min_interval: Duration,
}

impl LogThrottle {
    fn new(min_interval_secs: u64) -> Self {
        let min_interval = Duration::from_secs(min_interval_secs);
        Self {
            last_log: Instant::now()
                .checked_sub(min_interval)
                .unwrap_or_else(Instant::now),
            min_interval,
        }
    }

    fn should_log(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_log) >= self.min_interval {
            self.last_log = now;
            true
        } else {
            false
        }
    }
}

fn summary(status: &GovernorStatus) -> String {
    status
        .domains
        .iter()
        .map(|d| {
            let enabled = d.cores.iter().filter(|c| c.state.enabled).count();
            format!(
                "policy{}: {} kHz [{}..={}] target {} ({enabled}/{} cores)",
                d.id,
                d.cur,
                d.limits.min,
                d.limits.max,
                d.max_target()
                    .map_or_else(|| "-".to_string(), |t| t.to_string()),
                d.cores.len()
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path.as_deref())?;

    let platform = SysfsPlatform::new();
    platform.take_control()?;
    for domain in platform.domains()? {
        info!(
            "policy{}: cpus {:?}, {} frequencies, limits {}..={} kHz",
            domain.id,
            domain.cores,
            domain.table.len(),
            domain.limits.min,
            domain.limits.max
        );
    }

    let governor = Arc::new(Governor::new(platform, config.tunables)?);
    let cores = governor.cores();
    governor.start(&cores)?;
    let timer = SamplingTimer::spawn(Arc::clone(&governor))?;
    info!("governing {} cores", cores.len());

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || r.store(false, Ordering::Release))?;

    let mut log_throttle = LogThrottle::new(config.log_interval_secs);
    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(200));
        if log_throttle.should_log() {
            let status = governor.status();
            info!("{}", summary(&status));
            if let Err(e) = write_status(&config.status_file, &status) {
                warn!(
                    "writing status to {} failed: {e}",
                    config.status_file.display()
                );
            }
        }
    }

    info!("shutting down");
    timer.stop();
    if let Err(e) = governor.stop(&cores) {
        error!("stopping the governor failed: {e}");
    }
    Ok(())
}
