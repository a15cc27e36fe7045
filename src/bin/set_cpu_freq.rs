use std::io::{Error as IoError, ErrorKind};

use impulse_governor::{Platform, Relation, sysfs::SysfsPlatform};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments: program <policy> <frequency_khz>
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} <policy> <frequency_khz>", args[0]);
        eprintln!("  policy: cpufreq policy number (policyN under /sys/devices/system/cpu/cpufreq)");
        eprintln!("  frequency_khz: Target frequency, snapped up to the next available one");
        eprintln!();
        eprintln!("Example: sudo {} 0 1800000", args[0]);
        std::process::exit(1);
    }

    let policy: usize = args[1]
        .parse()
        .map_err(|_| IoError::new(ErrorKind::InvalidInput, "policy must be a valid number"))?;
    let target_freq: u32 = args[2]
        .parse()
        .map_err(|_| IoError::new(ErrorKind::InvalidInput, "frequency must be a valid number"))?;

    let platform = SysfsPlatform::new();
    let domain = platform
        .domains()?
        .into_iter()
        .find(|d| d.id == policy)
        .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("policy{policy} not found")))?;

    let Some(freq) = domain
        .table
        .resolve(u64::from(target_freq), Relation::Low, domain.limits)
    else {
        eprintln!(
            "Error: no frequency of policy{policy} lies within its limits [{} - {}] kHz",
            domain.limits.min, domain.limits.max
        );
        std::process::exit(1);
    };
    if freq != target_freq {
        eprintln!("Note: {target_freq} kHz is not available, using {freq} kHz");
    }

    platform.take_control()?;
    platform.set_frequency(policy, freq, Relation::Low)?;

    println!("policy{policy} ({:?}) set to {freq} kHz", domain.cores);

    Ok(())
}
