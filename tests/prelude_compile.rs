//! Compile-time prelude coverage test.
use quotabox::prelude::*;
use std::time::Duration;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let manager: BucketManager = BucketManager::new();
    let cfg = BucketConfig::new(1, Duration::from_secs(1), Duration::from_secs(1))
        .expect("valid config");
    let handle: BucketHandle = manager.ensure("prelude", &cfg);
    let decision: Decision<()> = handle.put(Data::new()).await.expect("live bucket");
    assert!(decision.is_allowed());
    let err: QuotaError = manager.check("absent").await.unwrap_err();
    assert!(err.is_invalid_key());
}
