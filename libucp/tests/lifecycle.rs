mod common;

use common::{connected_pair, init_logging, local, TestFactory};
use libucp::config::{filter_env_overrides, ConfigMap};
use libucp::engine::loopback::{LoopbackFactory, OPT_EAGER_LIMIT};
use libucp::engine::EngineFactory;
use libucp::{ApplicationContext, ProgressMode, UcpError};
use std::rc::Rc;

fn options(pairs: &[(&str, &str)]) -> ConfigMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn env_keys_are_dropped_from_options() {
    let mut opts = options(&[("UCP_A", "1"), ("UCP_B", "2"), ("UCP_C", "3")]);
    let env = ["UCP_B", "PATH", "UCP_C"];
    let dropped = filter_env_overrides(&mut opts, env);
    assert_eq!(dropped.len(), 2);
    for key in env {
        assert!(!opts.contains_key(key));
    }
    assert_eq!(opts.get("UCP_A").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn explicit_option_wins_unless_env_takes_precedence() {
    init_logging();
    local(async {
        const KEY: &str = "OPT_A";
        libucp::set_engine_factory(Rc::new(TestFactory::new(KEY))).unwrap();

        std::env::remove_var(KEY);
        libucp::init(options(&[(KEY, "1")]), false).unwrap();
        assert_eq!(libucp::get_config().unwrap()[KEY], "1");
        libucp::reset().unwrap();

        std::env::set_var(KEY, "2");
        libucp::init(options(&[(KEY, "1")]), true).unwrap();
        assert_eq!(libucp::get_config().unwrap()[KEY], "2");
        libucp::reset().unwrap();

        libucp::init(options(&[(KEY, "1")]), false).unwrap();
        assert_eq!(libucp::get_config().unwrap()[KEY], "1");
        libucp::reset().unwrap();
        std::env::remove_var(KEY);
    })
    .await;
}

#[tokio::test]
async fn double_init_is_rejected() {
    init_logging();
    local(async {
        libucp::init(ConfigMap::new(), false).unwrap();
        assert!(libucp::is_initialized());
        assert!(matches!(libucp::init(ConfigMap::new(), false), Err(UcpError::AlreadyInitialized)));
        assert!(matches!(libucp::set_progress_mode(ProgressMode::Manual), Err(UcpError::AlreadyInitialized)));
        libucp::reset().unwrap();
        assert!(!libucp::is_initialized());
        libucp::init(ConfigMap::new(), false).unwrap();
        libucp::reset().unwrap();
    })
    .await;
}

#[tokio::test]
async fn reset_restores_default_configuration() {
    init_logging();
    local(async {
        let defaults = libucp::get_config().unwrap();
        assert!(!libucp::is_initialized(), "get_config must not create a context");
        libucp::init(options(&[(OPT_EAGER_LIMIT, "64")]), false).unwrap();
        assert_eq!(libucp::get_config().unwrap()[OPT_EAGER_LIMIT], "64");
        libucp::reset().unwrap();
        libucp::get_or_create().unwrap();
        assert_eq!(libucp::get_config().unwrap(), defaults);
        libucp::reset().unwrap();
    })
    .await;
}

#[tokio::test]
async fn version_does_not_create_a_context() {
    let version = libucp::get_version().unwrap();
    assert_eq!(version, LoopbackFactory.version());
    assert!(!libucp::is_initialized());
}

#[tokio::test]
async fn unknown_option_fails_creation_only() {
    init_logging();
    local(async {
        let err = libucp::init(options(&[("UCP_NO_SUCH_OPTION", "1")]), false).unwrap_err();
        assert!(matches!(err, UcpError::Config(_)));
        assert!(!libucp::is_initialized());
        libucp::get_or_create().unwrap();
        libucp::reset().unwrap();
    })
    .await;
}

#[tokio::test]
async fn reset_with_live_endpoint_reports_leak() {
    init_logging();
    local(async {
        let ctx = libucp::get_or_create().unwrap();
        let (listener, client, server) = connected_pair(&ctx).await;
        drop(ctx);

        let err = libucp::reset().unwrap_err();
        let UcpError::ResourceLeak(report) = &err else {
            panic!("expected a resource leak, got {err}");
        };
        assert!(report.contains("not all Endpoints and/or Listeners are closed"));
        assert!(report.contains("Endpoint #"), "{report}");
        assert!(report.contains("Listener #"), "{report}");

        // The old context is still alive, so no new one may be created.
        assert!(matches!(libucp::get_or_create(), Err(UcpError::ResourceLeak(_))));
        assert!(matches!(libucp::init(ConfigMap::new(), false), Err(UcpError::ResourceLeak(_))));

        client.close();
        drop(server);
        listener.close();
        assert!(libucp::reset().is_ok());
        libucp::get_or_create().unwrap();
        libucp::reset().unwrap();
    })
    .await;
}

#[tokio::test]
async fn teardown_names_every_live_referent() {
    init_logging();
    local(async {
        let factory = TestFactory::new("UCP_TEST_TEARDOWN");
        let counters = Rc::clone(&factory.counters);
        let ctx = ApplicationContext::from_factory(&factory, &ConfigMap::new(), ProgressMode::Auto).unwrap();
        let listener = ctx.create_listener(|_ep| async {}, None).unwrap();
        let port = listener.port().unwrap();
        assert_eq!(ctx.live_referents().len(), 1);

        let err = ctx.teardown().unwrap_err();
        assert!(err.to_string().contains(&format!("listening on port {port}")));
        assert_eq!(counters.destroys.get(), 0, "engine destroyed while still referenced");

        drop(listener);
        assert_eq!(counters.destroys.get(), 1);
    })
    .await;
}

#[tokio::test]
async fn teardown_of_unused_context_destroys_the_engine() {
    init_logging();
    local(async {
        let factory = TestFactory::new("UCP_TEST_CLEAN_TEARDOWN");
        let counters = Rc::clone(&factory.counters);
        let ctx = ApplicationContext::from_factory(&factory, &ConfigMap::new(), ProgressMode::Polling).unwrap();
        let (listener, client, server) = connected_pair(&ctx).await;
        drop((listener, client, server));
        assert!(ctx.live_referents().is_empty());
        ctx.teardown().unwrap();
        assert_eq!(counters.destroys.get(), 1);
    })
    .await;
}

#[tokio::test]
async fn worker_handle_is_shared_by_endpoints() {
    init_logging();
    local(async {
        let handle = libucp::get_worker_handle().unwrap();
        assert_ne!(handle, 0);
        let ctx = libucp::get_or_create().unwrap();
        let (listener, client, server) = connected_pair(&ctx).await;
        assert_eq!(client.worker_handle().unwrap(), handle);
        assert!(client.info().unwrap().contains("loopback"));
        assert_ne!(client.uid(), server.uid());
        drop((ctx, listener, client, server));
        libucp::reset().unwrap();
    })
    .await;
}
