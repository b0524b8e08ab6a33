use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tollgate_config::{
    ConfigGuardRailError, ConfigLoadError, ConfigLoader, EnvConfig,
};
use tollgate_model::{DegradedPolicy, RateLimitRule};

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("tollgate.toml");
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn full_file_resolves_every_section() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[redis]
url = "redis://cache:6379/2"

[queue]
name = "email"
default_max_attempts = 5
lease_timeout = "2m"

[worker]
poll_interval = "2s"
error_backoff = "500ms"
heartbeat_ttl = "15s"
lease_renewal = "30s"

[reaper]
interval = "10s"

[[rate_limiters]]
name = "login"
rate = 3
per = "5m"

[[rate_limiters]]
name = "search"
rate = 50
per = "1m"
degraded = "bypass"
"#,
    );

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap();
    let config = load.config;

    assert_eq!(config.redis.as_ref().unwrap().url, "redis://cache:6379/2");
    assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));

    let settings = config.queue_settings();
    assert_eq!(settings.name, "email");
    assert_eq!(settings.default_max_attempts, 5);
    assert_eq!(settings.lease_timeout, Duration::from_secs(120));

    let worker = config.worker_config();
    assert_eq!(worker.poll_interval, Duration::from_secs(2));
    assert_eq!(worker.error_backoff, Duration::from_millis(500));
    assert_eq!(worker.heartbeat_ttl, Duration::from_secs(15));
    assert_eq!(worker.lease_renewal, Some(Duration::from_secs(30)));
    assert_eq!(config.reaper.interval, Duration::from_secs(10));

    let rules = config.rate_limit_rules();
    assert_eq!(
        rules,
        vec![
            RateLimitRule::new("login", 3, Duration::from_secs(300)),
            RateLimitRule::new("search", 50, Duration::from_secs(60))
                .with_degraded(DegradedPolicy::Bypass),
        ]
    );
    assert!(load.warnings.is_empty(), "{:?}", load.warnings);
}

#[test]
fn environment_overrides_the_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[redis]
url = "redis://file:6379"

[queue]
name = "from-file"
"#,
    );

    let env = EnvConfig {
        config_path: None,
        redis_url: Some("redis://env:6379".into()),
        queue_name: Some("from-env".into()),
    };
    let config = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env)
        .unwrap()
        .config;

    assert_eq!(config.redis.unwrap().url, "redis://env:6379");
    assert_eq!(config.queue.name, "from-env");
}

#[test]
fn config_path_from_environment_is_used() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[queue]\nname = \"analytics\"\n");

    let env = EnvConfig {
        config_path: Some(path),
        ..EnvConfig::default()
    };
    let config = ConfigLoader::new().load_with_env(env).unwrap().config;
    assert_eq!(config.queue.name, "analytics");
}

#[test]
fn defaults_apply_without_a_file() {
    let load = ConfigLoader::new()
        .load_with_env(EnvConfig::default())
        .unwrap();

    assert!(load.config.redis.is_none());
    assert!(load.config.metadata.config_path.is_none());
    assert_eq!(load.config.queue.name, "default");
    assert_eq!(load.config.rate_limit_rules(), RateLimitRule::presets());
    // Missing file plus missing Redis.
    assert_eq!(load.warnings.len(), 2);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = ConfigLoader::new()
        .with_config_path(dir.path().join("absent.toml"))
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn malformed_duration_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[queue]\nlease_timeout = \"eventually\"\n");
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Parse { .. }));
}

#[test]
fn guard_rails_reject_bad_limiters() {
    let cases = [
        (
            "[[rate_limiters]]\nname = \"a\"\nrate = 0\nper = \"1m\"\n",
            ConfigGuardRailError::ZeroRate { name: "a".into() },
        ),
        (
            "[[rate_limiters]]\nname = \"a\"\nrate = 1\nper = \"0s\"\n",
            ConfigGuardRailError::ZeroWindow { name: "a".into() },
        ),
        (
            concat!(
                "[[rate_limiters]]\nname = \"a\"\nrate = 1\nper = \"1m\"\n\n",
                "[[rate_limiters]]\nname = \"a\"\nrate = 2\nper = \"1m\"\n",
            ),
            ConfigGuardRailError::DuplicateLimiter { name: "a".into() },
        ),
        ("[queue]\nname = \"  \"\n", ConfigGuardRailError::EmptyQueueName),
        (
            "[queue]\nlease_timeout = \"0s\"\n",
            ConfigGuardRailError::ZeroDuration {
                field: "queue.lease_timeout",
            },
        ),
    ];

    for (contents, expected) in cases {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, contents);
        let err = ConfigLoader::new()
            .with_config_path(&path)
            .load_with_env(EnvConfig::default())
            .unwrap_err();
        match err {
            ConfigLoadError::GuardRail(actual) => assert_eq!(actual, expected),
            other => panic!("expected guard rail error, got {other:?}"),
        }
    }
}

#[test]
fn renewal_not_shorter_than_lease_warns() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        concat!(
            "[redis]\nurl = \"redis://cache\"\n\n",
            "[queue]\nlease_timeout = \"30s\"\n\n",
            "[worker]\nlease_renewal = \"30s\"\n",
        ),
    );
    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap();
    assert_eq!(load.warnings.len(), 1);
    assert!(load.warnings.iter().next().unwrap().message.contains("lease_renewal"));
}

#[test]
fn env_file_values_are_loaded() {
    let dir = TempDir::new().unwrap();
    let config_path = write_config(&dir, "[queue]\nname = \"cleanup\"\n");
    let env_path = dir.path().join(".env");
    fs::write(&env_path, "TOLLGATE_TEST_ENV_FILE_MARKER=1\n").unwrap();

    let load = ConfigLoader::new()
        .with_config_path(&config_path)
        .with_env_file(&env_path)
        .load()
        .unwrap();
    assert!(load.config.metadata.env_file_loaded);
    assert_eq!(
        std::env::var("TOLLGATE_TEST_ENV_FILE_MARKER").as_deref(),
        Ok("1")
    );
}
