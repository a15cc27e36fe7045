use std::io::Write;

use impulse_governor::config::load_config;
use impulse_governor::sim::SimPlatform;
use impulse_governor::{
    DomainInfo, FreqLimits, FrequencyTable, Governor, GovernorError, TunableConfig,
};

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_config_from_file() {
    let file = write_config(
        r#"
        [timing]
        timer-rate = 30000

        [frequency]
        hispeed = 900

        [[target-loads]]
        frequency = 0
        load = 70

        [[target-loads]]
        frequency = 900
        load = 95
        "#,
    );
    let config = load_config(Some(file.path())).unwrap();
    assert_eq!(config.tunables.timer_rate_us, 30_000);
    assert_eq!(config.tunables.target_load(600), 70);
    assert_eq!(config.tunables.target_load(900), 95);

    let platform = SimPlatform::new(vec![DomainInfo {
        id: 0,
        cores: vec![0],
        table: FrequencyTable::new([300, 600, 900]),
        limits: FreqLimits::new(300, 900),
        cur: 300,
    }]);
    let gov = Governor::new(platform, config.tunables).unwrap();
    assert_eq!(gov.show_attr("target_loads").unwrap(), "0:70 900:95");
    assert_eq!(gov.show_attr("hispeed_freq").unwrap(), "900");
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, GovernorError::Io(_)));
}

#[test]
fn test_rejected_config_names_the_table() {
    let file = write_config("[[above-hispeed-delays]]\nfrequency = 10\ndelay = 0\n");
    let err = load_config(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("above-hispeed-delays"), "{err}");
}

#[test]
fn test_governor_rejects_invalid_tunables() {
    let platform = SimPlatform::new(Vec::new());
    let tunables = TunableConfig {
        timer_rate_us: 0,
        ..TunableConfig::default()
    };
    assert!(matches!(
        Governor::new(platform, tunables),
        Err(GovernorError::InvalidTunable { name: "timer_rate", .. })
    ));
}
