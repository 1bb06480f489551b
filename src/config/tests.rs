use serial_test::serial;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.directory = Some(PathBuf::from("/var/cache/from-file"));
    raw.logging.level = Some("info".to_string());

    let overrides = CacheOverrides {
        cache_dir: Some(PathBuf::from("/srv/cache")),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.directory, Path::new("/srv/cache"));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let cache = &settings.cache;

    assert_eq!(cache.backend, BackendKind::Disk);
    assert_eq!(cache.directory, Path::new("cache/pagehold"));
    assert_eq!(cache.state_directory, Path::new("cache/pagehold-state"));
    assert_eq!(cache.policy, CachePolicy::default());
    assert_eq!(cache.preload.concurrency.get(), 2);
    assert_eq!(cache.preload.user_agent, "pagehold-preload/1.0");
    assert_eq!(cache.preload.timeout, Duration::from_secs(10));
    assert_eq!(cache.namespace, "pagehold");
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = CacheOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn unknown_backend_is_rejected_at_load() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("couchbase".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid backend");
    assert!(matches!(err, LoadError::Invalid { key: "cache.backend", .. }));
}

#[test]
fn empty_directory_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.directory = Some(PathBuf::new());

    let err = Settings::from_raw(raw).expect_err("empty directory");
    assert!(matches!(err, LoadError::Invalid { key: "cache.directory", .. }));
}

#[test]
fn non_positive_ttls_are_allowed() {
    let mut raw = RawSettings::default();
    raw.cache.ttl_default = Some(0);
    raw.cache.ttl_feed = Some(-5);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.policy.ttl_default, 0);
    assert_eq!(settings.cache.policy.ttl_feed, -5);
}

#[test]
fn zero_preload_concurrency_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.preload_concurrency = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero concurrency");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.preload_concurrency",
            ..
        }
    ));
}

#[test]
fn logged_in_mode_parses_case_insensitively() {
    let mut raw = RawSettings::default();
    raw.cache.logged_in_mode = Some("Private".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.policy.logged_in_mode, LoggedInMode::Private);
}

#[test]
fn snapshot_mirrors_policy() {
    let mut raw = RawSettings::default();
    raw.cache.exclude_urls = Some(vec!["/cart*".to_string()]);
    let settings = Settings::from_raw(raw).expect("valid settings");

    let snapshot = settings.cache.snapshot();
    assert_eq!(snapshot.policy, settings.cache.policy);
    assert_eq!(snapshot.cache_dir.as_deref(), Some(settings.cache.directory.as_path()));
    assert_eq!(
        settings.cache.snapshot_path(),
        Path::new("cache/pagehold-state/config_snapshot.json")
    );
}

#[test]
#[serial]
fn file_values_are_layered_under_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pagehold.toml");
    std::fs::write(
        &path,
        "[cache]\nbackend = \"redis\"\nttl_default = 120\nexclude_cookies = [\"cart\"]\n",
    )
    .expect("write config");

    let args = CliArgs::parse_from([
        "pagehold",
        "--config-file",
        path.to_str().expect("utf-8 path"),
        "stats",
    ]);
    let settings = load(&args).expect("load settings");

    assert_eq!(settings.cache.backend, BackendKind::Redis);
    assert_eq!(settings.cache.policy.ttl_default, 120);
    assert_eq!(settings.cache.policy.exclude_cookies, vec!["cart"]);
    assert_eq!(settings.cache.policy.ttl_front_page, 600);
}

#[test]
#[serial]
fn environment_overrides_file_and_cli_overrides_environment() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pagehold.toml");
    std::fs::write(&path, "[cache]\nnamespace = \"from-file\"\ndirectory = \"/from/file\"\n")
        .expect("write config");

    // SAFETY: every test that reads the process environment runs under `#[serial]`.
    unsafe {
        std::env::set_var("PAGEHOLD__CACHE__NAMESPACE", "from-env");
        std::env::set_var("PAGEHOLD__CACHE__DIRECTORY", "/from/env");
    }
    let args = CliArgs::parse_from([
        "pagehold",
        "--config-file",
        path.to_str().expect("utf-8 path"),
        "--cache-dir",
        "/from/cli",
        "stats",
    ]);
    let result = load(&args);
    unsafe {
        std::env::remove_var("PAGEHOLD__CACHE__NAMESPACE");
        std::env::remove_var("PAGEHOLD__CACHE__DIRECTORY");
    }

    let settings = result.expect("load settings");
    assert_eq!(settings.cache.namespace, "from-env");
    assert_eq!(settings.cache.directory, Path::new("/from/cli"));
}

#[test]
fn parse_purge_tag_arguments() {
    let args = CliArgs::parse_from(["pagehold", "purge-tag", "post:1", "term:4"]);

    match args.command {
        Command::PurgeTag(purge) => assert_eq!(purge.tags, vec!["post:1", "term:4"]),
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn global_overrides_follow_subcommand() {
    let args = CliArgs::parse_from([
        "pagehold",
        "purge-url",
        "https://example.com/a",
        "--cache-backend",
        "memcached",
        "--log-json",
        "yes",
    ]);

    assert_eq!(args.overrides.cache_backend.as_deref(), Some("memcached"));
    assert_eq!(args.overrides.log_json, Some(true));
    match args.command {
        Command::PurgeUrl(purge) => assert_eq!(purge.url, "https://example.com/a"),
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn preload_run_limit_is_optional() {
    let args = CliArgs::parse_from(["pagehold", "preload-run"]);
    assert!(matches!(args.command, Command::PreloadRun(PreloadRunArgs { limit: None })));

    let args = CliArgs::parse_from(["pagehold", "preload-run", "--limit", "5"]);
    assert!(matches!(args.command, Command::PreloadRun(PreloadRunArgs { limit: Some(5) })));
}
