//! Day-by-day replay of an on-disk archive.

use std::sync::Arc;

use relay_history::fanout::{correlate_by_day, latest_for_fingerprints};
use relay_history::{DocumentKind, DocumentStore, Error};

use crate::{at, Archive, Relay};

#[tokio::test]
async fn test_days_replayed_in_parallel() {
    let archive = Archive::new();
    let alpha = Relay::new("alpha", 1);
    let beta = Relay::new("beta", 2);
    archive.add_consensus(at(1, 15, 6), &[alpha.clone()]);
    archive.add_consensus(at(1, 16, 6), &[alpha.clone().bandwidth(500), beta.clone()]);
    archive.add_consensus(at(1, 17, 22), &[beta.clone()]);
    archive.add_descriptor(DocumentKind::ServerDescriptor, at(1, 1, 0), &alpha, "0.4.8.10");

    let config = archive.config(at(1, 15, 0), at(1, 17, 23));
    let store: Arc<dyn DocumentStore> = Arc::new(config.directory_store());
    let days = correlate_by_day(&config, store, at(1, 15, 0), at(1, 17, 23))
        .await
        .unwrap();

    let starts: Vec<_> = days.iter().map(|day| day.day).collect();
    assert_eq!(starts, vec![at(1, 15, 0), at(1, 16, 0), at(1, 17, 0)]);
    assert_eq!(days[0].relays.len(), 1);
    assert_eq!(days[1].relays.len(), 2);
    assert!(days[1].relays[&alpha.fingerprint()].has_descriptor());
    assert_eq!(days[2].relays[&beta.fingerprint()].last_seen_in, at(1, 17, 22));

    let selection = latest_for_fingerprints(
        &days,
        [alpha.fingerprint().to_lowercase(), beta.fingerprint(), "F".repeat(40)],
    );
    assert_eq!(selection.found[&alpha.fingerprint()].bandwidth, 500);
    assert_eq!(selection.found[&beta.fingerprint()].last_seen_in, at(1, 17, 22));
    assert_eq!(selection.missing.len(), 1);
    assert!(selection.missing.contains(&"F".repeat(40)));
}

#[tokio::test]
async fn test_partial_first_and_last_day() {
    let archive = Archive::new();
    let alpha = Relay::new("alpha", 1);
    archive.add_consensus(at(1, 15, 1), &[alpha.clone()]);
    archive.add_consensus(at(1, 15, 20), &[alpha.clone()]);
    archive.add_consensus(at(1, 16, 5), &[alpha.clone().bandwidth(9)]);

    let config = archive.config(at(1, 15, 0), at(1, 16, 23));
    let store: Arc<dyn DocumentStore> = Arc::new(config.directory_store());
    let days = correlate_by_day(&config, store, at(1, 15, 12), at(1, 16, 3))
        .await
        .unwrap();

    assert_eq!(days.len(), 2);
    assert_eq!(days[0].relays[&alpha.fingerprint()].last_seen_in, at(1, 15, 20));
    assert!(days[1].relays.is_empty());
}

#[tokio::test]
async fn test_rejects_range_outside_config() {
    let archive = Archive::new();
    let config = archive.config(at(1, 15, 0), at(1, 15, 23));
    let store: Arc<dyn DocumentStore> = Arc::new(config.directory_store());
    let result = correlate_by_day(&config, store, at(1, 15, 0), at(1, 16, 0)).await;
    assert!(matches!(result, Err(Error::OutOfRange { .. })));
}
