//! Racing conditional updates against one record: exactly one writer wins
//! per version.

use std::sync::Arc;

use futures_util::future::join_all;
use octofhir_db_memory::InMemoryStorage;
use octofhir_storage::FhirStorage;
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_compare_and_set_wins() {
    let storage = Arc::new(InMemoryStorage::new());
    let created = storage
        .create(&json!({"resourceType": "Subscription", "id": "s1", "status": "requested"}))
        .await
        .unwrap();

    let attempts = (0..16).map(|i| {
        let storage = storage.clone();
        let version = created.version_id.clone();
        tokio::spawn(async move {
            let body = json!({
                "resourceType": "Subscription",
                "id": "s1",
                "status": "active",
                "reason": format!("writer {i}")
            });
            storage.update(&body, Some(&version)).await
        })
    });

    let results = join_all(attempts).await;
    let wins = results
        .iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(e)) if e.is_version_conflict()))
        .count();

    assert_eq!(wins, 1);
    assert_eq!(conflicts, 15);
}
