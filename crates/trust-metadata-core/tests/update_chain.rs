//! Update ordering and the rollback, freeze and mix-and-match defenses.

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use common::repo::{self, gun, key, Delegation, Repo, Versions};
use trust_metadata_core::{
    MemoryCache, MemoryTransport, RoleName, RoleVersions, TrustConfig, TrustEngine, TrustError,
    TrustPin,
};

async fn pinned(repo: &Repo, transport: &Arc<MemoryTransport>) -> TrustEngine {
    let engine = repo::engine(transport.clone());
    engine
        .bootstrap(&gun(), TrustPin::new(repo.pinned_root(&key(1))))
        .await
        .unwrap();
    engine
}

#[tokio::test]
/// A snapshot that differs from the one the timestamp describes is refused.
async fn snapshot_must_match_timestamp_descriptor() {
    let repo = Repo::new(2);
    let transport = Arc::new(MemoryTransport::new());
    let engine = pinned(&repo, &transport).await;

    let described = repo.documents(1);
    let substituted = repo.documents_with(Versions {
        targets: 2,
        ..Versions::all(1)
    });
    described.publish(&transport, &gun());
    transport.publish(&gun(), &RoleName::snapshot(), Some(1), substituted.snapshot);

    match engine.update(&gun()).await.unwrap_err() {
        TrustError::DescriptorMismatch { role, .. } => assert_eq!(role, RoleName::snapshot()),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(engine.trusted(&gun()).unwrap().snapshot().is_none());
}

#[tokio::test]
/// Targets bytes must match what the snapshot recorded for them.
async fn targets_must_match_snapshot_descriptor() {
    let repo = Repo::new(3);
    let transport = Arc::new(MemoryTransport::new());
    let engine = pinned(&repo, &transport).await;

    repo.documents(1).publish(&transport, &gun());
    let other = repo.documents_with(Versions {
        targets: 7,
        ..Versions::all(1)
    });
    transport.publish(&gun(), &RoleName::targets(), None, other.targets);

    match engine.update(&gun()).await.unwrap_err() {
        TrustError::DescriptorMismatch { role, .. } => assert_eq!(role, RoleName::targets()),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
/// After trusting snapshot v10, a timestamp pointing at snapshot v9 is a rollback.
async fn snapshot_version_cannot_go_back() {
    let repo = Repo::new(4);
    let transport = Arc::new(MemoryTransport::new());
    let engine = pinned(&repo, &transport).await;

    repo.documents(10).publish(&transport, &gun());
    engine.update(&gun()).await.unwrap();

    repo.documents_with(Versions {
        timestamp: 11,
        snapshot: 9,
        ..Versions::all(10)
    })
    .publish(&transport, &gun());
    match engine.update(&gun()).await.unwrap_err() {
        TrustError::VersionRollback {
            role,
            trusted,
            offered,
        } => {
            assert_eq!(role, RoleName::snapshot());
            assert_eq!((trusted, offered), (10, 9));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(engine.trusted(&gun()).unwrap().versions().snapshot, Some(10));
}

#[tokio::test]
/// A newer snapshot may not list an older targets version than the trusted one.
async fn targets_version_recorded_in_snapshot_cannot_go_back() {
    let repo = Repo::new(5);
    let transport = Arc::new(MemoryTransport::new());
    let engine = pinned(&repo, &transport).await;

    repo.documents(3).publish(&transport, &gun());
    engine.update(&gun()).await.unwrap();

    repo.documents_with(Versions {
        targets: 2,
        ..Versions::all(4)
    })
    .publish(&transport, &gun());
    match engine.update(&gun()).await.unwrap_err() {
        TrustError::VersionRollback { role, trusted, offered } => {
            assert_eq!(role, RoleName::targets());
            assert_eq!((trusted, offered), (3, 2));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
/// A stale but validly signed timestamp is refused once it has expired.
async fn expired_timestamp_is_a_freeze_attack() {
    let mut repo = Repo::new(6);
    repo.expires = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let now = Utc.with_ymd_and_hms(2031, 6, 1, 0, 0, 0).unwrap();
    let engine = TrustEngine::new(transport.clone(), Arc::new(MemoryCache::new()))
        .with_clock(Arc::new(move || now));
    engine
        .bootstrap(&gun(), TrustPin::new(repo.pinned_root(&key(1))))
        .await
        .unwrap();

    repo.documents(1).publish(&transport, &gun());
    match engine.update(&gun()).await.unwrap_err() {
        TrustError::Expired { role, expires } => {
            assert_eq!(role, RoleName::timestamp());
            assert_eq!(expires, repo.expires);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
/// Across a history of updates, accepted and rejected alike, no role version
/// ever decreases, delegated targets included.
async fn trusted_versions_are_monotonic() {
    let releases = RoleName::new("targets/releases").unwrap();
    let repo = Repo::new(7).with_delegation(
        Delegation::new("targets", "targets/releases", 70, &["releases/"])
            .providing(&["releases/app.tar"]),
    );
    let transport = Arc::new(MemoryTransport::new());
    let engine = pinned(&repo, &transport).await;

    let mut history: Vec<RoleVersions> = vec![engine.trusted(&gun()).unwrap().versions()];
    let published = [(1, 1), (2, 2), (2, 2), (4, 4), (3, 3), (7, 7), (8, 6), (9, 9)];
    for (version, delegated) in published {
        let before = history[history.len() - 1].clone();
        repo.documents_with(Versions {
            delegated,
            ..Versions::all(version)
        })
        .publish(&transport, &gun());
        let outcome = engine.update(&gun()).await;
        let current = engine.trusted(&gun()).unwrap().versions();

        let stale = Some(version) < before.timestamp
            || Some(delegated) < before.delegations.get(&releases).copied();
        if stale {
            assert!(matches!(outcome, Err(TrustError::VersionRollback { .. })));
            assert_eq!(current, before);
        } else {
            assert_eq!(outcome.unwrap().versions(), current);
        }
        assert!(current.never_regress_from(&before), "{current:?} < {before:?}");
        history.push(current);
    }
    let last = &history[history.len() - 1];
    assert_eq!(last.timestamp, Some(9));
    assert_eq!(last.delegations.get(&releases), Some(&9));
}

#[tokio::test]
/// Documents supplied by the caller go through the same checks as fetched ones.
async fn bundle_updates_work_with_transport_offline() {
    let repo = Repo::new(8);
    let transport = Arc::new(MemoryTransport::new());
    let engine = pinned(&repo, &transport).await;
    transport.set_unavailable(true);

    let state = engine
        .update_from_bundle(&gun(), &repo.documents(2).bundle())
        .await
        .unwrap();
    assert_eq!(state.versions().targets, Some(2));
    assert!(engine.update(&gun()).await.is_err());
    assert_eq!(engine.trusted(&gun()).unwrap().versions().targets, Some(2));
}

#[tokio::test]
/// Documents over the configured size limit are refused before parsing.
async fn oversized_documents_are_refused() {
    let mut repo = Repo::new(9);
    repo.targets = (0..200).map(|i| format!("app/file-{i:04}.json")).collect();
    let transport = Arc::new(MemoryTransport::new());
    let config = TrustConfig {
        max_document_bytes: 4096,
        ..TrustConfig::default()
    };
    let engine = TrustEngine::new(transport.clone(), Arc::new(MemoryCache::new())).with_config(config);
    engine
        .bootstrap(&gun(), TrustPin::new(repo.pinned_root(&key(1))))
        .await
        .unwrap();

    repo.documents(1).publish(&transport, &gun());
    match engine.update(&gun()).await.unwrap_err() {
        TrustError::Encoding(reason) => assert!(reason.contains("targets")),
        other => panic!("unexpected error: {other:?}"),
    }
}
