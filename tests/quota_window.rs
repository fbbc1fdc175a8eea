use quotabox::{BucketConfig, BucketManager, Data, Decision};
use serde_json::json;
use std::time::Duration;

fn cfg(max: u32, window_ms: u64) -> BucketConfig {
    BucketConfig::new(max, Duration::from_millis(window_ms), Duration::from_secs(60))
        .expect("valid config")
}

fn data(pairs: &[(&str, serde_json::Value)]) -> Data {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[tokio::test(start_paused = true)]
async fn two_requests_then_denied_then_refreshed() {
    let manager = BucketManager::new();
    manager.create("k", &cfg(2, 30_000)).unwrap();

    assert_eq!(manager.put("k", Data::new()).await.unwrap(), Decision::Allowed(()));
    assert_eq!(manager.put("k", Data::new()).await.unwrap(), Decision::Allowed(()));
    assert_eq!(
        manager.put("k", Data::new()).await.unwrap(),
        Decision::Denied { retry_after: Duration::from_millis(30_000) }
    );

    tokio::time::advance(Duration::from_millis(30_000)).await;
    assert_eq!(manager.put("k", Data::new()).await.unwrap(), Decision::Allowed(()));
    let usage = manager.check("k").await.unwrap().allowed().unwrap();
    assert_eq!(usage.used, 1);
    assert_eq!(usage.max_requests, 2);
}

#[tokio::test(start_paused = true)]
async fn never_admits_more_than_max_per_window() {
    let manager = BucketManager::new();
    let handle = manager.ensure("k", &cfg(5, 1_000));

    let mut admitted = 0;
    for i in 0..20 {
        let decision = if i % 2 == 0 {
            handle.put(Data::new()).await.unwrap().is_allowed()
        } else {
            handle.get(vec![]).await.unwrap().is_allowed()
        };
        if decision {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}

#[tokio::test(start_paused = true)]
async fn check_neither_consumes_nor_blocks_when_exhausted() {
    let manager = BucketManager::new();
    let handle = manager.ensure("k", &cfg(1, 1_000));

    for _ in 0..3 {
        let usage = handle.check().await.unwrap().allowed().unwrap();
        assert_eq!(usage.used, 0);
    }
    handle.put(Data::new()).await.unwrap();

    tokio::time::advance(Duration::from_millis(250)).await;
    let decision = handle.check().await.unwrap();
    assert_eq!(decision, Decision::Denied { retry_after: Duration::from_millis(750) });
}

#[tokio::test(start_paused = true)]
async fn check_observes_reset_after_window() {
    let manager = BucketManager::new();
    let handle = manager.ensure("k", &cfg(3, 5_000));
    for _ in 0..3 {
        handle.put(Data::new()).await.unwrap();
    }
    assert!(!handle.check().await.unwrap().is_allowed());

    tokio::time::advance(Duration::from_millis(5_000)).await;
    let usage = handle.check().await.unwrap().allowed().unwrap();
    assert_eq!(usage.used, 0);
    assert_eq!(usage.time_until_refresh, Duration::from_millis(5_000));
}

#[tokio::test(start_paused = true)]
async fn keys_are_isolated() {
    let manager = BucketManager::new();
    manager.create("small", &cfg(1, 10_000)).unwrap();
    manager.create("large", &cfg(10, 10_000)).unwrap();

    assert!(manager.put("small", Data::new()).await.unwrap().is_allowed());
    assert!(!manager.put("small", Data::new()).await.unwrap().is_allowed());

    for _ in 0..4 {
        assert!(manager.put("large", Data::new()).await.unwrap().is_allowed());
    }
    let large = manager.check("large").await.unwrap().allowed().unwrap();
    assert_eq!(large.used, 4);
    assert_eq!(large.remaining(), 6);
    assert!(!manager.check("small").await.unwrap().is_allowed());
}

#[tokio::test(start_paused = true)]
async fn get_projects_requested_fields() {
    let manager = BucketManager::new();
    manager.create("k", &cfg(5, 10_000)).unwrap();
    manager.put("k", data(&[("a", json!(1)), ("b", json!(2))])).await.unwrap();

    let projected = manager
        .get("k", vec!["a".to_string(), "c".to_string()])
        .await
        .unwrap()
        .allowed()
        .unwrap();
    assert_eq!(projected, data(&[("a", json!(1))]));

    let all = manager.get("k", vec![]).await.unwrap().allowed().unwrap();
    assert_eq!(all, data(&[("a", json!(1)), ("b", json!(2))]));

    let usage = manager.check("k").await.unwrap().allowed().unwrap();
    assert_eq!(usage.used, 3);
}

#[tokio::test(start_paused = true)]
async fn put_merges_and_overwrites() {
    let manager = BucketManager::new();
    let handle = manager.ensure("k", &cfg(5, 10_000));
    handle.put(data(&[("name", json!("ada")), ("tier", json!("free"))])).await.unwrap();
    handle.put(data(&[("tier", json!("pro"))])).await.unwrap();

    let stored = handle.get(vec![]).await.unwrap().allowed().unwrap();
    assert_eq!(stored, data(&[("name", json!("ada")), ("tier", json!("pro"))]));
}

#[tokio::test(start_paused = true)]
async fn denied_put_leaves_data_untouched() {
    let manager = BucketManager::new();
    let handle = manager.ensure("k", &cfg(1, 10_000));
    handle.put(data(&[("a", json!(1))])).await.unwrap();
    let denied = handle.put(data(&[("a", json!(2)), ("b", json!(3))])).await.unwrap();
    assert!(!denied.is_allowed());

    tokio::time::advance(Duration::from_millis(10_000)).await;
    let stored = handle.get(vec![]).await.unwrap().allowed().unwrap();
    assert_eq!(stored, data(&[("a", json!(1))]));
}

#[tokio::test(start_paused = true)]
async fn shortest_window_still_enforces_the_limit() {
    assert!(BucketConfig::new(1, Duration::from_micros(500), Duration::from_secs(60)).is_err());

    let manager = BucketManager::new();
    manager.create("k", &cfg(1, 1)).unwrap();
    let mut admitted = 0;
    for _ in 0..10 {
        if manager.put("k", Data::new()).await.unwrap().is_allowed() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(manager.put("k", Data::new()).await.unwrap().is_allowed());
}
