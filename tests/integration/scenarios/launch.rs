//! Launch builder tests: argument assembly, config rewriting and socket handoff,
//! checked through fake server binaries that report what they were given.

use crate::integration::{
    fast_timeouts, refused_port, wait_for_stdout, wait_until, write_script, FAKE_MOCK_SERVER,
    FAKE_PROXY,
};
use mcharness::{ConfigError, HarnessConfig, MockServerBuilder, ProcessError, ProxyBuilder, RewriteError};

const ROUTE_CONFIG: &str =
    r#"{"pools":{"A":{"servers":["localhost:4000","localhost:4001"]}},"route":"PoolRoute|PREFIX"}"#;

#[tokio::test]
async fn test_proxy_launch_with_rewritten_config() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "mcrouter", FAKE_PROXY);
    let config = dir.path().join("route.json");
    std::fs::write(&config, ROUTE_CONFIG).unwrap();

    let mut proxy = ProxyBuilder::new(binary.to_str().unwrap(), &config)
        .substitute_ports(vec![9101, 9102])
        .replace("PREFIX", "A")
        .default_route("/region/cluster/")
        .arg("--num-proxies=2")
        .timeouts(fast_timeouts())
        .launch()
        .await
        .unwrap();

    assert_eq!(proxy.label(), "mcrouter");
    assert!(!proxy.is_daemonized());

    // The active config is a rewritten copy; the original is untouched
    let active = proxy.config_file().unwrap().to_path_buf();
    assert!(active.starts_with(proxy.work_dir()));
    assert_eq!(
        std::fs::read_to_string(&active).unwrap(),
        r#"{"pools":{"A":{"servers":["localhost:9101","localhost:9102"]}},"route":"PoolRoute|A"}"#
    );
    assert_eq!(std::fs::read_to_string(&config).unwrap(), ROUTE_CONFIG);

    let spool = proxy.spool_dir().unwrap();
    assert!(spool.is_dir());
    let log = proxy.log_file().unwrap().to_path_buf();
    assert_eq!(log.file_name().unwrap(), "mcrouter.log");

    let dump = wait_for_stdout(&proxy, "malloc:").await;
    let expected_prefix = format!(
        "args: -f {} -L {} -a {} --listen-sock-fd ",
        active.display(),
        log.display(),
        spool.display()
    );
    assert!(
        dump.stdout.contains(&expected_prefix),
        "unexpected arguments:\n{}",
        dump.stdout
    );
    assert!(dump.stdout.contains("-R /region/cluster/ --num-proxies=2"));
    assert!(dump.stdout.contains("malloc: junk:true"));

    #[cfg(target_os = "linux")]
    wait_for_stdout(&proxy, "open").await;

    // The fake proxy holds the inherited socket, so connecting succeeds
    proxy.ensure_connected().await.unwrap();

    let termination = proxy.terminate().await.unwrap();
    assert!(termination.is_some());
}

#[tokio::test]
async fn test_proxy_fixed_port_without_junk_fill() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "mcrouter", FAKE_PROXY);
    let config = dir.path().join("route.json");
    std::fs::write(&config, ROUTE_CONFIG).unwrap();
    let port = refused_port();

    let mut proxy = ProxyBuilder::new(binary.to_str().unwrap(), &config)
        .port(port)
        .junk_fill(false)
        .env("MCROUTER_TEST_MARKER", "1")
        .timeouts(fast_timeouts())
        .launch()
        .await
        .unwrap();

    assert_eq!(proxy.port(), port);
    // No rewriting requested: the caller's config stays the active one
    assert_eq!(proxy.config_file(), Some(config.as_path()));

    let dump = wait_for_stdout(&proxy, "malloc:").await;
    assert!(dump.stdout.contains(&format!("-p {}", port)));
    assert!(!dump.stdout.contains("--listen-sock-fd"));
    assert!(!dump.stdout.contains("malloc: junk:true"));

    proxy.terminate().await.unwrap();
}

#[tokio::test]
async fn test_proxy_daemonize_flag_adds_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "mcrouter", FAKE_PROXY);
    let config = dir.path().join("route.json");
    std::fs::write(&config, ROUTE_CONFIG).unwrap();

    let mut proxy = ProxyBuilder::new(binary.to_str().unwrap(), &config)
        .arg("-b")
        .timeouts(fast_timeouts())
        .launch()
        .await
        .unwrap();
    assert!(proxy.is_daemonized());

    let pid_file = proxy.work_dir().join("mcrouter.pid");
    let dump = wait_for_stdout(&proxy, "args:").await;
    assert!(dump
        .stdout
        .contains(&format!("-b -P {}", pid_file.display())));

    let p = &proxy;
    wait_until("daemon pid", || async move { p.pid().is_some() && p.work_dir().join("mcrouter.pid").exists() })
        .await;
    assert!(proxy.is_alive());

    let termination = proxy.terminate().await.unwrap().unwrap();
    assert!(termination.pid.is_some());
    assert!(!proxy.is_alive());
}

#[tokio::test]
async fn test_proxy_rewrite_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("route.json");
    std::fs::write(&config, ROUTE_CONFIG).unwrap();

    let result = ProxyBuilder::new("/nonexistent/mcrouter", &config)
        .substitute_ports(vec![9101])
        .launch()
        .await;
    assert!(matches!(
        result,
        Err(ProcessError::Rewrite(RewriteError::TooManyPorts { .. }))
    ));
}

#[tokio::test]
async fn test_proxy_missing_binary() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("route.json");
    std::fs::write(&config, ROUTE_CONFIG).unwrap();

    let result = ProxyBuilder::new("/nonexistent/mcrouter", &config)
        .launch()
        .await;
    assert!(matches!(result, Err(ProcessError::Spawn { .. })));
}

#[tokio::test]
async fn test_builders_from_config() {
    let config = HarnessConfig::from_yaml_str("junk_fill: false").unwrap();
    assert!(matches!(
        ProxyBuilder::from_config(&config, "/tmp/route.json"),
        Err(ConfigError::MissingBinary(_))
    ));
    assert!(matches!(
        MockServerBuilder::from_config(&config),
        Err(ConfigError::MissingBinary(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "mock_mc_server", FAKE_MOCK_SERVER);
    let yaml = format!(
        "binaries:\n  mock_server: \"{}\"\ntimeouts:\n  terminate_timeout_secs: 2\n",
        binary.display()
    );
    let config = HarnessConfig::from_yaml_str(&yaml).unwrap();

    let mut server = MockServerBuilder::from_config(&config)
        .unwrap()
        .launch()
        .unwrap();
    assert_eq!(server.label(), "mock_mc_server");

    let dump = wait_for_stdout(&server, "args: -t ").await;
    #[cfg(target_os = "linux")]
    wait_for_stdout(&server, "open").await;
    assert!(dump.log.is_empty());

    server.ensure_connected().await.unwrap();
    server.terminate().await.unwrap();
}

#[tokio::test]
async fn test_mock_server_fixed_port() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "mock_mc_server", FAKE_MOCK_SERVER);
    let port = refused_port();

    let mut server = MockServerBuilder::new(binary.to_str().unwrap())
        .port(port)
        .timeouts(fast_timeouts())
        .launch()
        .unwrap();

    wait_for_stdout(&server, &format!("args: -P {}", port)).await;
    assert_eq!(server.endpoint().port(), port);
    server.terminate().await.unwrap();
}
