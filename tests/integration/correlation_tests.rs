//! End-to-end replays merging status entries with their descriptors.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use relay_history::{
    CorrelationEngine, DocumentId, DocumentKind, Error, MemoryStore, Network,
};

use crate::{at, status_document, Archive, Relay};

#[test]
fn test_later_document_wins() {
    let archive = Archive::new();
    let alpha = Relay::new("alpha", 1);
    let beta = Relay::new("beta", 2);
    archive.add_consensus(at(1, 15, 3), &[alpha.clone(), beta.clone()]);
    archive.add_consensus(at(1, 15, 5), &[alpha.clone().bandwidth(300)]);

    let config = archive.config(at(1, 15, 0), at(1, 15, 23));
    let mut engine = CorrelationEngine::open(&config).unwrap();
    let relays = engine.correlate(at(1, 15, 3), at(1, 15, 5)).unwrap();

    assert_eq!(relays.len(), 2);
    let merged = &relays[&alpha.fingerprint()];
    assert_eq!(merged.bandwidth, 300);
    assert_eq!(merged.last_seen_in, at(1, 15, 5));
    assert_eq!(relays[&beta.fingerprint()].last_seen_in, at(1, 15, 3));
}

#[test]
fn test_descriptor_fields_are_attached() {
    let archive = Archive::new();
    let relay = Relay::new("alpha", 1);
    archive.add_consensus(at(1, 15, 3), &[relay.clone()]);
    archive.add_descriptor(DocumentKind::ServerDescriptor, at(1, 1, 0), &relay, "0.4.8.10");

    let config = archive.config(at(1, 15, 0), at(1, 15, 23));
    let mut engine = CorrelationEngine::open(&config).unwrap();
    let relays = engine.correlate(at(1, 15, 3), at(1, 15, 3)).unwrap();

    let snapshot = &relays[&relay.fingerprint()];
    assert!(snapshot.has_descriptor());
    assert_eq!(snapshot.version.as_deref(), Some("0.4.8.10"));
    assert_eq!(snapshot.platform(), Some("Tor 0.4.8.10 on Linux"));
    assert_eq!(snapshot.contact(), Some("ops@example.org"));
    assert_eq!(snapshot.dir_port, Some(9030));
    assert_eq!(snapshot.flags, vec!["Fast", "Running", "Valid"]);
}

#[test]
fn test_status_version_takes_precedence() {
    let archive = Archive::new();
    let relay = Relay::new("alpha", 1).version("0.4.9.1");
    archive.add_consensus(at(1, 15, 3), &[relay.clone()]);
    archive.add_descriptor(DocumentKind::ServerDescriptor, at(1, 1, 0), &relay, "0.4.8.10");

    let config = archive.config(at(1, 15, 0), at(1, 15, 23));
    let mut engine = CorrelationEngine::open(&config).unwrap();
    let relays = engine.correlate(at(1, 15, 3), at(1, 15, 3)).unwrap();

    let snapshot = &relays[&relay.fingerprint()];
    assert_eq!(snapshot.version.as_deref(), Some("0.4.9.1"));
    assert!(snapshot.has_descriptor());
}

#[test]
fn test_descriptor_from_previous_month() {
    let archive = Archive::new();
    let december = Utc.with_ymd_and_hms(2023, 12, 31, 22, 0, 0).unwrap();
    let relay = Relay::new("alpha", 1).published(december);
    archive.add_consensus(at(1, 1, 0), &[relay.clone()]);
    archive.add_descriptor(DocumentKind::ServerDescriptor, december, &relay, "0.4.8.9");

    let config = archive.config(at(1, 1, 0), at(1, 1, 23));
    let mut engine = CorrelationEngine::open(&config).unwrap();
    let relays = engine.correlate(at(1, 1, 0), at(1, 1, 0)).unwrap();

    assert_eq!(relays[&relay.fingerprint()].version.as_deref(), Some("0.4.8.9"));
}

#[test]
fn test_unresolved_descriptor_keeps_relay() {
    let archive = Archive::new();
    let relay = Relay::new("ghost", 7);
    archive.add_consensus(at(1, 15, 3), &[relay.clone()]);

    let config = archive.config(at(1, 15, 0), at(1, 15, 23));
    let mut engine = CorrelationEngine::open(&config).unwrap();
    let relays = engine.correlate(at(1, 15, 3), at(1, 15, 3)).unwrap();

    let snapshot = &relays[&relay.fingerprint()];
    assert!(!snapshot.has_descriptor());
    assert!(snapshot.platform().is_none());
    assert!(snapshot.version.is_none());
    assert_eq!(snapshot.bandwidth, 100);
}

#[test]
fn test_lookback_depth_is_configurable() {
    let archive = Archive::new();
    let relay = Relay::new("alpha", 1).published(at(3, 2, 0));
    archive.add_consensus(at(3, 2, 1), &[relay.clone()]);
    archive.add_descriptor(DocumentKind::ServerDescriptor, at(1, 1, 0), &relay, "0.4.8.10");

    let shallow = archive.config(at(3, 1, 0), at(3, 2, 23));
    let relays = CorrelationEngine::open(&shallow)
        .unwrap()
        .correlate(at(3, 2, 1), at(3, 2, 1))
        .unwrap();
    assert!(!relays[&relay.fingerprint()].has_descriptor());

    let deep = archive
        .builder(at(3, 1, 0), at(3, 2, 23))
        .descriptor_lookback_months(2u32)
        .build()
        .unwrap();
    let relays = CorrelationEngine::open(&deep)
        .unwrap()
        .correlate(at(3, 2, 1), at(3, 2, 1))
        .unwrap();
    assert!(relays[&relay.fingerprint()].has_descriptor());
}

#[test]
fn test_bridge_network_replay() {
    let archive = Archive::new();
    let bridge = Relay::new("bridge", 9);
    archive.add_bridge_status(at(1, 15, 4), &[bridge.clone()]);
    archive.add_descriptor(DocumentKind::BridgeDescriptor, at(1, 1, 0), &bridge, "0.4.8.12");

    let config = archive
        .builder(at(1, 15, 0), at(1, 15, 23))
        .network(Network::Bridge)
        .build()
        .unwrap();
    let mut engine = CorrelationEngine::open(&config).unwrap();
    let relays = engine.correlate(at(1, 15, 0), at(1, 15, 23)).unwrap();

    assert_eq!(relays.len(), 1);
    let snapshot = &relays[&bridge.fingerprint()];
    assert_eq!(snapshot.last_seen_in, at(1, 15, 4));
    assert_eq!(snapshot.version.as_deref(), Some("0.4.8.12"));
}

#[test]
fn test_range_outside_timespan() {
    let archive = Archive::new();
    let config = archive.config(at(1, 15, 0), at(1, 15, 23));
    let mut engine = CorrelationEngine::open(&config).unwrap();
    assert!(matches!(
        engine.correlate(at(1, 14, 23), at(1, 15, 2)),
        Err(Error::OutOfRange { .. })
    ));
}

#[test]
fn test_descriptor_reloaded_once_per_ttl_window() {
    let relay = Relay::new("alpha", 1);
    let store = Arc::new(MemoryStore::new());
    for hour in 0..4 {
        store.insert(
            &DocumentId::consensus(at(1, 15, hour)),
            status_document(at(1, 15, hour), &[relay.clone()], ""),
        );
    }
    let descriptor_id =
        DocumentId::descriptor(DocumentKind::ServerDescriptor, at(1, 1, 0), &relay.digest());
    store.insert(&descriptor_id, relay.descriptor("0.4.8.10"));

    let archive = Archive::new();
    let long_lived = archive.config(at(1, 15, 0), at(1, 15, 23));
    let mut engine = CorrelationEngine::from_config(&long_lived, store.clone()).unwrap();
    engine.correlate(at(1, 15, 0), at(1, 15, 3)).unwrap();
    assert_eq!(store.read_count(&descriptor_id), 1);

    // a TTL of three survives a single sweep, so every other document reloads
    let short_lived = archive
        .builder(at(1, 15, 0), at(1, 15, 23))
        .initial_ttl(3u32)
        .build()
        .unwrap();
    let mut engine = CorrelationEngine::from_config(&short_lived, store.clone()).unwrap();
    let relays = engine.correlate(at(1, 15, 0), at(1, 15, 3)).unwrap();
    assert_eq!(store.read_count(&descriptor_id), 3);
    assert!(relays[&relay.fingerprint()].has_descriptor());
}

#[test]
fn test_replay_serializes_to_json() {
    let archive = Archive::new();
    let relay = Relay::new("alpha", 1);
    archive.add_consensus(at(1, 15, 3), &[relay.clone()]);

    let config = archive.config(at(1, 15, 0), at(1, 15, 23));
    let relays = CorrelationEngine::open(&config)
        .unwrap()
        .correlate(at(1, 15, 3), at(1, 15, 3))
        .unwrap();

    let json = serde_json::to_value(&relays).unwrap();
    let entry = &json[relay.fingerprint()];
    assert_eq!(entry["nickname"], "alpha");
    assert_eq!(entry["bandwidth"], 100);
    assert!(entry.get("descriptor").is_none());
}
