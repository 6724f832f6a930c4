//! Trust pinning on first use and restoring trusted state from the cache.

mod common;

use std::sync::Arc;

use common::repo::{self, gun, key, sign, Repo};
use trust_metadata_core::{
    MemoryCache, MemoryTransport, MetadataCache, RoleName, SledCache, TrustConfig, TrustEngine,
    TrustError, TrustPin,
};

#[tokio::test]
/// Fingerprint hints the root does not satisfy fail the bootstrap.
async fn pin_with_unknown_fingerprints_is_refused() {
    let repo = Repo::new(2);
    let engine = repo::engine(Arc::new(MemoryTransport::new()));
    let pin = TrustPin::new(repo.pinned_root(&key(1))).with_pinned_keys([key(3).key().id().clone()]);

    match engine.bootstrap(&gun(), pin).await.unwrap_err() {
        TrustError::PinMismatch(reason) => assert!(reason.contains("pinned keys")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(engine.trusted(&gun()).is_none());
}

#[tokio::test]
async fn pin_below_minimum_threshold_is_refused() {
    let repo = Repo::new(4);
    let engine = repo::engine(Arc::new(MemoryTransport::new()));
    let pin = TrustPin::new(repo.pinned_root(&key(1))).with_min_threshold(2);
    let err = engine.bootstrap(&gun(), pin).await.unwrap_err();
    assert!(matches!(err, TrustError::PinMismatch(_)));
    assert!(err.is_security_relevant());
}

#[tokio::test]
/// State persisted in sled survives an engine restart and keeps blocking rollbacks.
async fn sled_cache_restores_trusted_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trust-cache");
    let repo = Repo::new(5);

    let committed = {
        let transport = Arc::new(MemoryTransport::new());
        let cache = Arc::new(SledCache::open(&path).unwrap());
        let engine = TrustEngine::new(transport.clone(), cache);
        engine
            .bootstrap(&gun(), TrustPin::new(repo.pinned_root(&key(1))))
            .await
            .unwrap();
        repo.documents(6).publish(&transport, &gun());
        engine.update(&gun()).await.unwrap().versions()
    };

    let transport = Arc::new(MemoryTransport::new());
    let cache = Arc::new(SledCache::open(&path).unwrap());
    assert_eq!(cache.list(&gun()).await.unwrap().len(), 4);
    let engine = TrustEngine::new(transport.clone(), cache);
    let restored = engine.open(&gun(), None).await.unwrap();
    assert_eq!(restored.versions(), committed);

    repo.documents(5).publish(&transport, &gun());
    let err = engine.update(&gun()).await.unwrap_err();
    assert!(matches!(err, TrustError::VersionRollback { .. }));

    repo.documents(7).publish(&transport, &gun());
    assert_eq!(engine.update(&gun()).await.unwrap().versions().timestamp, Some(7));
}

#[tokio::test]
/// Cached documents that no longer verify are discarded in favour of the pin.
async fn tampered_cache_falls_back_to_pin() {
    let repo = Repo::new(6);
    let cache = Arc::new(MemoryCache::new());
    {
        let transport = Arc::new(MemoryTransport::new());
        let engine = TrustEngine::new(transport.clone(), cache.clone());
        engine
            .bootstrap(&gun(), TrustPin::new(repo.pinned_root(&key(1))))
            .await
            .unwrap();
        repo.documents(3).publish(&transport, &gun());
        engine.update(&gun()).await.unwrap();
    }
    let forged = repo.documents(9);
    cache.insert_raw(&gun(), RoleName::snapshot(), forged.snapshot);

    let engine = TrustEngine::new(Arc::new(MemoryTransport::new()), cache.clone());
    match engine.open(&gun(), None).await.unwrap_err() {
        TrustError::DescriptorMismatch { role, .. } => assert_eq!(role, RoleName::snapshot()),
        other => panic!("unexpected error: {other:?}"),
    }

    let pin = TrustPin::new(repo.pinned_root(&key(1)));
    let state = engine.open(&gun(), Some(pin)).await.unwrap();
    assert_eq!(state.root().version, 1);
    assert!(state.timestamp().is_none());
    assert_eq!(cache.list(&gun()).await.unwrap().len(), 1);
}

#[tokio::test]
/// A self-signed root written into the cache does not override the operator's pin.
async fn cached_root_unrelated_to_pin_is_replaced() {
    let repo = Repo::new(8);
    let intruder = Repo::new(67);
    let cache = Arc::new(MemoryCache::new());
    cache.insert_raw(&gun(), RoleName::root(), intruder.pinned_root(&key(66)));

    let engine = TrustEngine::new(Arc::new(MemoryTransport::new()), cache.clone());
    let pin = TrustPin::new(repo.pinned_root(&key(1))).with_pinned_keys([key(1).key().id().clone()]);
    let state = engine.open(&gun(), Some(pin)).await.unwrap();

    let root_role = state.role(&RoleName::root()).unwrap();
    assert!(root_role.key(key(1).key().id()).is_some());
    assert!(root_role.key(key(66).key().id()).is_none());
    assert_eq!(state.root().raw(), repo.pinned_root(&key(1)).as_slice());
    assert_eq!(
        cache.get(&gun(), &RoleName::root()).await.unwrap(),
        Some(repo.pinned_root(&key(1)))
    );
}

#[tokio::test]
/// A cached root that rotated past the pin is restored when the published
/// roots chain from the pin to it, and abandoned for the pin when they cannot
/// be fetched.
async fn cached_rotation_is_restored_through_the_root_chain() {
    let (a, b) = (key(81), key(82));
    let repo = Repo::new(88);
    let transport = Arc::new(MemoryTransport::new());
    let cache = Arc::new(MemoryCache::new());
    let pin = || TrustPin::new(repo.pinned_root(&a));
    {
        let engine = TrustEngine::new(transport.clone(), cache.clone());
        engine.bootstrap(&gun(), pin()).await.unwrap();
        let v2 = sign(repo::root(2, &[&b], 1, &repo.online), &[&a, &b]);
        transport.publish(&gun(), &RoleName::root(), Some(2), v2);
        repo.documents(4).publish(&transport, &gun());
        engine.update(&gun()).await.unwrap();
    }

    let restarted = TrustEngine::new(transport.clone(), cache.clone());
    let state = restarted.open(&gun(), Some(pin())).await.unwrap();
    assert_eq!(state.root().version, 2);
    assert_eq!(state.versions().timestamp, Some(4));

    transport.set_unavailable(true);
    let offline = TrustEngine::new(transport.clone(), cache.clone());
    let state = offline.open(&gun(), Some(pin())).await.unwrap();
    assert_eq!(state.root().version, 1);
    assert!(state.timestamp().is_none());
    assert_eq!(cache.list(&gun()).await.unwrap().len(), 1);
}

#[tokio::test]
/// Root bytes cached for a version must be the ones published for that version.
async fn cached_root_diverging_from_published_chain_is_replaced() {
    let (a, b, c) = (key(91), key(92), key(93));
    let repo = Repo::new(98);
    let transport = Arc::new(MemoryTransport::new());
    let published = sign(repo::root(2, &[&b], 1, &repo.online), &[&a, &b]);
    transport.publish(&gun(), &RoleName::root(), Some(2), published);

    let cache = Arc::new(MemoryCache::new());
    let forged = sign(repo::root(2, &[&c], 1, &repo.online), &[&c]);
    cache.insert_raw(&gun(), RoleName::root(), forged);

    let engine = TrustEngine::new(transport, cache);
    let state = engine
        .open(&gun(), Some(TrustPin::new(repo.pinned_root(&a))))
        .await
        .unwrap();
    assert_eq!(state.root().version, 1);
}

#[tokio::test]
async fn cache_restore_can_be_disabled() {
    let repo = Repo::new(7);
    let cache = Arc::new(MemoryCache::new());
    cache.insert_raw(&gun(), RoleName::root(), repo.pinned_root(&key(1)));

    let config = TrustConfig {
        restore_from_cache: false,
        ..TrustConfig::default()
    };
    let engine = TrustEngine::new(Arc::new(MemoryTransport::new()), cache).with_config(config);
    match engine.open(&gun(), None).await.unwrap_err() {
        TrustError::BootstrapRequired(g) => assert_eq!(g, gun()),
        other => panic!("unexpected error: {other:?}"),
    }
}
