//! Persistent storage through the script bridge

mod common;

use common::TestBench;
use script_host::runtime::CallContext;

#[tokio::test]
async fn test_json_values_round_trip() {
    let bench = TestBench::with_db(true);
    let host = bench.runtime.host();
    let ctx = CallContext::default();

    let bucket = host.persistent_name(&ctx, "settings").unwrap();
    assert_eq!(bucket, "settings");

    for value in [
        serde_json::json!(null),
        serde_json::json!(true),
        serde_json::json!(42),
        serde_json::json!(21.5),
        serde_json::json!("text"),
        serde_json::json!([1, 2, 3]),
        serde_json::json!({"nested": {"k": "v"}, "list": [false, 0.5]}),
    ] {
        host.persistent_set(&bucket, "key", &value);
        assert_eq!(host.persistent_get(&bucket, "key"), Some(value));
    }
}

#[tokio::test]
async fn test_missing_key_is_undefined() {
    let bench = TestBench::with_db(true);
    let host = bench.runtime.host();
    assert_eq!(host.persistent_get("settings", "never-set"), None);
}

#[tokio::test]
async fn test_module_scoped_buckets_are_namespaced() {
    let bench = TestBench::with_db(true);
    let host = bench.runtime.host();

    let module_ctx = CallContext {
        module: Some(bench.dir.path().join("modules/m.js")),
        ..CallContext::default()
    };
    let scoped = host.persistent_name(&module_ctx, "state").unwrap();
    assert!(scoped.starts_with('_'));
    assert!(scoped.ends_with("state"));
    assert_ne!(scoped, "state");

    host.persistent_set(&scoped, "k", &serde_json::json!(1));
    host.persistent_set("state", "k", &serde_json::json!(2));
    assert_eq!(host.persistent_get(&scoped, "k"), Some(serde_json::json!(1)));
    assert_eq!(
        host.persistent_get("state", "k"),
        Some(serde_json::json!(2))
    );
}

#[tokio::test]
async fn test_storage_disabled_without_db() {
    let bench = TestBench::new();
    let host = bench.runtime.host();
    assert!(host
        .persistent_name(&CallContext::default(), "settings")
        .is_err());
    // set is silent, get yields undefined
    host.persistent_set("settings", "k", &serde_json::json!(1));
    assert_eq!(host.persistent_get("settings", "k"), None);
}

#[tokio::test]
async fn test_values_survive_reopen() {
    let dir = {
        let bench = TestBench::with_db(true);
        let host = bench.runtime.host();
        host.persistent_set("settings", "k", &serde_json::json!({"kept": true}));
        bench.dir
    };

    // a fresh engine over the same database file sees the value
    let bench = common::TestBench::over_dir(dir, true);
    let host = bench.runtime.host();
    assert_eq!(
        host.persistent_get("settings", "k"),
        Some(serde_json::json!({"kept": true}))
    );
}
