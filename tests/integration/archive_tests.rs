//! Reading an on-disk archive through the store and the caches.

use std::sync::Arc;

use relay_history::descriptor::{DocumentStatus, RouterStatusRecord};
use relay_history::{
    DirectoryStore, DocumentId, DocumentKind, DocumentStore, Error, Network, WindowedCache,
};

use crate::{at, Archive, Relay};

fn status_cache(archive: &Archive) -> WindowedCache<RouterStatusRecord> {
    let store: Arc<dyn DocumentStore> = Arc::new(DirectoryStore::new(archive.root()));
    WindowedCache::new(DocumentKind::Consensus, store, at(1, 15, 0), at(1, 15, 23))
}

#[test]
fn test_read_consensus_from_disk() {
    let archive = Archive::new();
    archive.add_consensus(at(1, 15, 3), &[Relay::new("alpha", 1), Relay::new("beta", 2)]);

    let mut cache = status_cache(&archive);
    let documents = cache.get_range(at(1, 15, 2), at(1, 15, 4)).unwrap();
    assert_eq!(documents.len(), 3);

    let populated = &documents[&DocumentId::consensus(at(1, 15, 3))];
    assert_eq!(populated.status(), DocumentStatus::Populated(2));
    assert_eq!(populated.records()[1].nickname, "beta");
    assert_eq!(populated.records()[0].fingerprint, Relay::new("alpha", 1).fingerprint());

    let absent = &documents[&DocumentId::consensus(at(1, 15, 2))];
    assert_eq!(absent.status(), DocumentStatus::Missing);
}

#[test]
fn test_store_reports_missing_file() {
    let archive = Archive::new();
    let store = DirectoryStore::new(archive.root());
    let result = store.read_document(&DocumentId::consensus(at(1, 15, 3)));
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
fn test_empty_consensus_is_not_missing() {
    let archive = Archive::new();
    archive.add_consensus(at(1, 15, 5), &[]);

    let mut cache = status_cache(&archive);
    let documents = cache.get_range(at(1, 15, 5), at(1, 15, 5)).unwrap();
    let document = &documents[&DocumentId::consensus(at(1, 15, 5))];
    assert_eq!(document.status(), DocumentStatus::Empty);
    assert!(!document.is_missing());
}

#[cfg(feature = "compression")]
#[test]
fn test_gzipped_consensus_is_transparent() {
    let archive = Archive::new();
    archive.add_gzipped_consensus(at(1, 15, 7), &[Relay::new("zipped", 3)]);

    let mut cache = status_cache(&archive);
    let documents = cache.get_range(at(1, 15, 7), at(1, 15, 7)).unwrap();
    let document = &documents[&DocumentId::consensus(at(1, 15, 7))];
    assert_eq!(document.records().len(), 1);
    assert_eq!(document.records()[0].nickname, "zipped");
}

#[test]
fn test_footer_attributes_from_disk() {
    let archive = Archive::new();
    archive.add_consensus_with_weights(at(1, 15, 9), &[Relay::new("alpha", 1)], "Wbd=7 Wgg=-1");
    archive.add_consensus(at(1, 15, 10), &[]);

    let mut cache = status_cache(&archive);
    let footer = cache.footer_attributes(at(1, 15, 9)).unwrap();
    assert_eq!(footer["Wbd"], 7);
    assert_eq!(footer["Wgg"], -1);

    assert!(matches!(cache.footer_attributes(at(1, 15, 10)), Err(Error::Empty(_))));
    assert!(matches!(cache.footer_attributes(at(1, 15, 11)), Err(Error::NotFound(_))));
}

#[test]
fn test_bridge_statuses_found_by_prefix() {
    let archive = Archive::new();
    archive.add_bridge_status(at(1, 15, 4), &[Relay::new("bridge", 4)]);
    archive.add_bridge_status(at(1, 15, 6), &[Relay::new("bridge", 4)]);
    archive.write("bridge-statuses/README", "not a status");

    let store = Arc::new(DirectoryStore::new(archive.root()));
    let mut cache: WindowedCache<RouterStatusRecord> = WindowedCache::new(
        Network::Bridge.status_kind(),
        store.clone(),
        at(1, 15, 0),
        at(1, 15, 23),
    );

    let documents = cache.get_range(at(1, 15, 3), at(1, 15, 6)).unwrap();
    let hours: Vec<_> = documents.keys().map(|id| id.valid_after).collect();
    assert_eq!(hours, vec![at(1, 15, 4), at(1, 15, 6)]);
    assert!(documents.values().all(|doc| doc.records().len() == 1));

    // one directory listing served every hourly prefix
    let listings = store.listing_stats();
    assert_eq!(listings.misses, 1);
    assert!(listings.hits >= 3);
}

#[test]
fn test_descriptor_month_directories() {
    let archive = Archive::new();
    let relay = Relay::new("alpha", 1);
    archive.add_descriptor(DocumentKind::ServerDescriptor, at(1, 1, 0), &relay, "0.4.8.10");
    archive.add_descriptor(
        DocumentKind::ServerDescriptor,
        at(2, 1, 0),
        &Relay::new("beta", 2),
        "0.4.8.11",
    );

    let config = archive.config(at(2, 1, 0), at(2, 28, 23));
    let resolver = config.resolver(Arc::new(config.directory_store()));

    let descriptors = resolver.descriptors_in_months(at(1, 1, 0), at(2, 1, 0)).unwrap();
    let nicknames: Vec<_> = descriptors.iter().map(|d| d.nickname.as_str()).collect();
    assert_eq!(nicknames, vec!["alpha", "beta"]);
    assert!(descriptors[0].family.contains("0101010101010101010101010101010101010101"));

    assert!(matches!(
        resolver.descriptors_in_months(at(1, 1, 0), at(2, 28, 0)),
        Ok(ref found) if found.len() == 2
    ));
    assert!(matches!(
        resolver.descriptors_in_months(at(10, 1, 0), at(10, 2, 0)),
        Err(Error::OutOfRange { .. })
    ));
}

#[test]
fn test_missing_descriptor_month_is_not_found() {
    let archive = Archive::new();
    let config = archive.config(at(3, 1, 0), at(3, 31, 23));
    let resolver = config.resolver(Arc::new(config.directory_store()));
    assert!(matches!(
        resolver.descriptors_in_months(at(3, 1, 0), at(3, 2, 0)),
        Err(Error::NotFound(_))
    ));
}
