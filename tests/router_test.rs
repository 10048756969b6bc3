//! Event router scenarios against the in-memory platform

mod common;

use std::time::Duration;
use tokio::time::Instant;

use common::{codes, identities, positions, settle, shared, Call, FakePlatform, DEAD, LIVING};
use proximity_bridge::link::{IdentityMap, LinkFailure, LinkResponse};
use proximity_bridge::platform::VoicePolicy;
use proximity_bridge::proximity::StabilizerConfig;
use proximity_bridge::types::{ChannelId, MemberId};
use proximity_bridge::{ActionReport, EventOutcome, EventRouter, RouterSettings};
use serde_json::json;
use std::sync::Arc;

const A: u64 = 101;
const B: u64 = 102;
const C: u64 = 103;

fn settings() -> RouterSettings {
    RouterSettings::new(ChannelId(LIVING), ChannelId(DEAD))
}

/// Platform with the living and dead channels, and A, B, C connected to living
fn platform() -> Arc<FakePlatform> {
    let platform = FakePlatform::new();
    platform.add_channel(LIVING, "Living", None);
    platform.add_channel(DEAD, "Dead", None);
    for member in [A, B, C] {
        platform.connect(member, LIVING);
    }
    platform
}

fn router(settings: RouterSettings, platform: &Arc<FakePlatform>) -> EventRouter {
    EventRouter::new(
        settings,
        shared(platform),
        identities(&[("sa", A), ("sb", B), ("sc", C)]),
        codes(),
    )
}

fn handled(outcome: EventOutcome) -> ActionReport {
    match outcome {
        EventOutcome::Handled(report) => report,
        other => panic!("expected Handled, got {:?}", other),
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[tokio::test]
async fn test_clusters_move_after_stability_and_slot_cooldown() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    platform.add_channel(12, "Cluster-2", None);
    let mut router = router(settings(), &platform);

    let batch = positions(&[("sa", 0.0, 0.0, 0.0), ("sb", 100.0, 0.0, 0.0), ("sc", 5000.0, 0.0, 0.0)]);
    let t0 = Instant::now();

    for i in 0..2 {
        let report = handled(router.handle_at(&batch, t0 + secs(i)).await);
        assert_eq!(report.moved, 0);
    }
    assert!(platform.moves().is_empty());

    // Third batch: A and C are stable. B shares A's slot, which A claimed.
    let report = handled(router.handle_at(&batch, t0 + secs(2)).await);
    assert_eq!(report.moved, 2);
    assert_eq!(platform.channel_of(A), Some(ChannelId(11)));
    assert_eq!(platform.channel_of(B), Some(ChannelId(LIVING)));
    assert_eq!(platform.channel_of(C), Some(ChannelId(12)));

    // Slot 1 is still cooling down.
    let report = handled(router.handle_at(&batch, t0 + secs(3)).await);
    assert_eq!(report.moved, 0);

    let report = handled(router.handle_at(&batch, t0 + secs(7)).await);
    assert_eq!(report.moved, 1);
    assert_eq!(platform.channel_of(B), Some(ChannelId(11)));
    assert_eq!(platform.moves().len(), 3);
}

#[tokio::test]
async fn test_oscillating_player_is_never_moved() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    platform.add_channel(12, "Cluster-2", None);
    let mut router = router(settings(), &platform);

    let near = positions(&[("sa", 0.0, 0.0, 0.0), ("sb", 100.0, 0.0, 0.0)]);
    let far = positions(&[("sa", 0.0, 0.0, 0.0), ("sb", 5000.0, 0.0, 0.0)]);
    let t0 = Instant::now();

    for i in 0..6 {
        let batch = if i % 2 == 0 { &near } else { &far };
        router.handle_at(batch, t0 + secs(10 * i)).await;
    }

    // A is stable in slot 1 and moves once, B flips every batch.
    assert_eq!(platform.moves(), vec![(MemberId(A), ChannelId(11))]);
}

#[tokio::test]
async fn test_members_not_in_voice_are_filtered() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    platform.with(|s| s.voice.remove(&MemberId(C)));

    let mut settings = settings();
    settings.stabilizer = StabilizerConfig::default().fast();
    let mut router = router(settings, &platform);

    let batch = positions(&[("sa", 0.0, 0.0, 0.0), ("sc", 1.0, 0.0, 0.0), ("unlinked", 2.0, 0.0, 0.0)]);
    let report = handled(router.handle_at(&batch, Instant::now()).await);

    assert_eq!(report.moved, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(platform.moves(), vec![(MemberId(A), ChannelId(11))]);
    assert!(router.stabilizer().record(&MemberId(C)).is_none());
}

#[tokio::test]
async fn test_failed_voice_lookup_keeps_partition() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    platform.add_channel(12, "Cluster-2", None);
    platform.with(|s| s.failing_lookups.insert(MemberId(B)));

    let mut settings = settings();
    settings.stabilizer = StabilizerConfig::default().fast();
    let mut router = router(settings, &platform);

    // B leads the first cluster; dropping B would shift C into slot 2.
    let batch = positions(&[("sb", 5000.0, 0.0, 0.0), ("sa", 0.0, 0.0, 0.0), ("sc", 5100.0, 0.0, 0.0)]);
    let report = handled(router.handle_at(&batch, Instant::now()).await);

    assert_eq!(report.moved, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(platform.channel_of(C), Some(ChannelId(11)));
    assert_eq!(platform.channel_of(A), Some(ChannelId(12)));
    assert_eq!(platform.channel_of(B), Some(ChannelId(LIVING)));
    assert!(router.stabilizer().record(&MemberId(B)).is_none());
}

#[tokio::test]
async fn test_clustering_disabled_ignores_positions() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    let mut settings = settings();
    settings.clustering_enabled = false;
    settings.stabilizer = StabilizerConfig::default().fast();
    let mut router = router(settings, &platform);

    let report = handled(router.handle_at(&positions(&[("sa", 0.0, 0.0, 0.0)]), Instant::now()).await);
    assert_eq!(report, ActionReport::default());
    assert!(platform.calls().is_empty());
}

#[tokio::test]
async fn test_missing_slot_is_created_in_background() {
    let platform = platform();
    let mut settings = settings();
    settings.stabilizer = StabilizerConfig::default().fast();
    let mut router = router(settings, &platform);
    let batch = positions(&[("sa", 0.0, 0.0, 0.0)]);
    let t0 = Instant::now();

    // No slot yet: the batch is handled without waiting for creation.
    let report = handled(router.handle_at(&batch, t0).await);
    assert_eq!(report.moved, 0);

    // Same batch again before the task ran: no second creation.
    router.handle_at(&batch, t0 + secs(1)).await;

    settle().await;
    assert_eq!(platform.creates(), vec!["Cluster-1".to_string()]);

    let report = handled(router.handle_at(&batch, t0 + secs(2)).await);
    assert_eq!(report.moved, 1);
    let slot = platform.channel_named("Cluster-1").unwrap();
    assert_eq!(platform.channel_of(A), Some(slot.id));
    assert_eq!(platform.creates().len(), 1);
}

#[tokio::test]
async fn test_creation_falls_back_to_root_then_places_in_category() {
    let platform = platform();
    platform.add_channel(50, "Category", None);
    platform.with(|s| s.deny_create_with_parent = true);

    let mut settings = settings();
    settings.topology.parent = Some(ChannelId(50));
    settings.stabilizer = StabilizerConfig::default().fast();
    let mut router = router(settings, &platform);

    router.handle_at(&positions(&[("sa", 0.0, 0.0, 0.0)]), Instant::now()).await;
    settle().await;

    let slot = platform.channel_named("Cluster-1").unwrap();
    assert_eq!(slot.parent, Some(ChannelId(50)));
    assert_eq!(
        platform.calls(),
        vec![
            Call::Create {
                name: "Cluster-1".to_string(),
                parent: Some(ChannelId(50))
            },
            Call::Create {
                name: "Cluster-1".to_string(),
                parent: None
            },
            Call::SetParent(slot.id, ChannelId(50)),
        ]
    );
}

#[tokio::test]
async fn test_creation_falls_back_to_cloning_slot_one() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    platform.with(|s| s.deny_create = true);

    let mut settings = settings();
    settings.stabilizer = StabilizerConfig::default().fast();
    let mut router = router(settings, &platform);

    let batch = positions(&[("sa", 0.0, 0.0, 0.0), ("sb", 5000.0, 0.0, 0.0)]);
    router.handle_at(&batch, Instant::now()).await;
    settle().await;

    assert!(platform.calls().contains(&Call::Clone {
        source: ChannelId(11),
        name: "Cluster-2".to_string()
    }));
    assert!(platform.channel_named("Cluster-2").is_some());
}

#[tokio::test]
async fn test_failed_creation_waits_for_retry_interval() {
    let platform = platform();
    platform.with(|s| s.deny_create = true);

    let mut settings = settings();
    settings.stabilizer = StabilizerConfig::default().fast();
    let mut router = router(settings, &platform);
    let batch = positions(&[("sa", 0.0, 0.0, 0.0)]);
    let t0 = Instant::now();

    router.handle_at(&batch, t0).await;
    settle().await;
    router.handle_at(&batch, t0 + secs(5)).await;
    settle().await;
    assert_eq!(platform.creates().len(), 1);

    // The denial seen at t0+5 also closes the capability gate for 60s.
    router.handle_at(&batch, t0 + secs(66)).await;
    settle().await;
    assert_eq!(platform.creates().len(), 2);
}

#[tokio::test]
async fn test_permission_denial_suppresses_moves_until_recheck() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    platform.with(|s| s.deny_moves = true);

    let mut settings = settings();
    settings.stabilizer = StabilizerConfig::default().fast();
    let mut router = router(settings, &platform);
    let batch = positions(&[("sa", 0.0, 0.0, 0.0)]);
    let t0 = Instant::now();

    let report = handled(router.handle_at(&batch, t0).await);
    assert_eq!(report.failed, 1);

    for i in 1..5 {
        router.handle_at(&batch, t0 + secs(10 * i)).await;
    }
    assert_eq!(platform.moves().len(), 1);

    // One attempt after the recheck interval; it succeeds and moves resume.
    platform.with(|s| s.deny_moves = false);
    let report = handled(router.handle_at(&batch, t0 + secs(61)).await);
    assert_eq!(report.moved, 1);
    assert_eq!(platform.channel_of(A), Some(ChannelId(11)));
}

#[tokio::test]
async fn test_death_moves_to_dead_with_policy() {
    let platform = platform();
    let mut settings = settings();
    settings.dead_policy = VoicePolicy {
        mute: Some(true),
        deafen: None,
    };
    let mut router = router(settings, &platform);

    let report = handled(
        router
            .handle_at(&json!({"type": "player_death", "player": {"steamid64": "sa"}}), Instant::now())
            .await,
    );
    assert_eq!(report.moved, 1);
    assert_eq!(platform.channel_of(A), Some(ChannelId(DEAD)));
    assert_eq!(
        platform.calls(),
        vec![
            Call::Policy(
                MemberId(A),
                VoicePolicy {
                    mute: Some(true),
                    deafen: None
                }
            ),
            Call::Move(MemberId(A), ChannelId(DEAD)),
        ]
    );
}

#[tokio::test]
async fn test_death_of_unlinked_or_disconnected_player() {
    let platform = platform();
    platform.with(|s| s.voice.remove(&MemberId(B)));
    let mut router = router(settings(), &platform);
    let now = Instant::now();

    let report = handled(
        router
            .handle_at(&json!({"type": "player_death", "player": {"steamid64": "nobody"}}), now)
            .await,
    );
    assert_eq!(report.skipped, 1);

    let report = handled(
        router
            .handle_at(&json!({"type": "player_death", "victim": {"steamid64": "sb"}}), now)
            .await,
    );
    assert_eq!(report.skipped, 1);
    assert!(platform.calls().is_empty());
}

#[tokio::test]
async fn test_death_resets_stability() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    let mut router = router(settings(), &platform);
    let t0 = Instant::now();

    router.handle_at(&positions(&[("sa", 0.0, 0.0, 0.0)]), t0).await;
    assert!(router.stabilizer().record(&MemberId(A)).is_some());

    router
        .handle_at(&json!({"type": "player_death", "player": {"steamid64": "sa"}}), t0 + secs(1))
        .await;
    assert!(router.stabilizer().record(&MemberId(A)).is_none());
}

#[tokio::test]
async fn test_round_end_returns_everyone_and_cleans_up() {
    let platform = FakePlatform::new();
    platform.add_channel(LIVING, "Cluster Lobby", None);
    platform.add_channel(DEAD, "Cluster-dead", None);
    platform.add_channel(11, "Cluster-1", None);
    platform.add_channel(12, "Cluster-2", None);
    platform.add_channel(20, "General", None);
    platform.connect(A, 11);
    platform.connect(B, LIVING);

    let mut router = router(settings(), &platform);
    let report = handled(router.handle_at(&json!({"type": "round_end"}), Instant::now()).await);

    assert_eq!(report.moved, 1);
    // B already in place, C not in voice
    assert_eq!(report.skipped, 2);
    assert_eq!(report.deleted, 2);

    assert_eq!(platform.channel_of(A), Some(ChannelId(LIVING)));
    let calls = platform.calls();
    assert!(calls.contains(&Call::Policy(MemberId(A), VoicePolicy::CLEAR)));
    assert!(calls.contains(&Call::Policy(MemberId(B), VoicePolicy::CLEAR)));

    let mut deleted = platform.deletes();
    deleted.sort();
    assert_eq!(deleted, vec![ChannelId(11), ChannelId(12)]);
    assert!(platform.channel_named("Cluster-dead").is_some());
    assert!(platform.channel_named("General").is_some());
}

#[tokio::test]
async fn test_cleanup_keeps_occupied_and_foreign_category_channels() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", Some(50));
    platform.add_channel(12, "Cluster-2", Some(50));
    platform.add_channel(13, "Cluster-3", None);
    // Not linked, so nobody moves it out.
    platform.connect(999, 12);

    let mut settings = settings();
    settings.topology.parent = Some(ChannelId(50));
    let mut router = router(settings, &platform);

    let report = handled(router.handle_at(&json!({"type": "round_end"}), Instant::now()).await);
    assert_eq!(report.deleted, 1);
    assert_eq!(platform.deletes(), vec![ChannelId(11)]);
}

#[tokio::test]
async fn test_round_end_deletes_nothing_when_occupancy_unknown() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    platform.connect(A, 11);
    platform.with(|s| s.occupancy_unknown = true);
    let mut router = router(settings(), &platform);

    let report = handled(router.handle_at(&json!({"type": "round_end"}), Instant::now()).await);
    assert_eq!(report.moved, 1);
    assert_eq!(report.deleted, 0);
    assert!(platform.deletes().is_empty());
    assert!(platform.channel_named("Cluster-1").is_some());
}

#[tokio::test]
async fn test_round_end_without_cleanup() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    let mut settings = settings();
    settings.cleanup_on_round_end = false;
    let mut router = router(settings, &platform);

    let report = handled(router.handle_at(&json!({"type": "round_end"}), Instant::now()).await);
    assert_eq!(report.deleted, 0);
    assert!(platform.deletes().is_empty());
}

#[tokio::test]
async fn test_round_start_normalizes_when_enabled() {
    let platform = platform();
    platform.add_channel(11, "Cluster-1", None);
    platform.connect(A, 11);

    let mut router_off = router(settings(), &platform);
    let report = handled(router_off.handle_at(&json!({"type": "round_start"}), Instant::now()).await);
    assert_eq!(report, ActionReport::default());
    assert_eq!(platform.channel_of(A), Some(ChannelId(11)));

    let mut settings = settings();
    settings.normalize_on_round_start = true;
    let mut router_on = router(settings, &platform);
    let report = handled(router_on.handle_at(&json!({"type": "round_start"}), Instant::now()).await);
    assert_eq!(report.moved, 1);
    assert_eq!(platform.channel_of(A), Some(ChannelId(LIVING)));
    assert!(!platform.calls().iter().any(|c| matches!(c, Call::Policy(..))));
}

#[tokio::test]
async fn test_unknown_and_malformed_events() {
    let platform = platform();
    let mut router = router(settings(), &platform);
    let now = Instant::now();

    assert_eq!(
        router.handle_at(&json!({"type": "bomb_planted"}), now).await,
        EventOutcome::Ignored {
            kind: "bomb_planted".to_string()
        }
    );
    assert!(matches!(
        router.handle_at(&json!({"type": "player_death"}), now).await,
        EventOutcome::Rejected(_)
    ));
    assert!(matches!(
        router.handle_at(&json!({"no_type": true}), now).await,
        EventOutcome::Rejected(_)
    ));
    assert!(platform.calls().is_empty());
}

fn link_attempt(steamid: &str, code: &str) -> serde_json::Value {
    json!({"type": "link_attempt", "player": {"steamid64": steamid}, "code": code})
}

#[tokio::test]
async fn test_link_attempt_success_and_replay() {
    let platform = platform();
    let identities = identities(&[]);
    let codes = codes();
    let mut router = EventRouter::new(settings(), shared(&platform), identities.clone(), codes.clone());
    let now = Instant::now();

    let code = codes.issue(MemberId(500), now);
    assert_eq!(
        router.handle_at(&link_attempt("765", &code), now).await,
        EventOutcome::Link(LinkResponse::linked())
    );
    assert_eq!(identities.get("765"), Some(MemberId(500)));

    assert_eq!(
        router.handle_at(&link_attempt("765", &code), now).await,
        EventOutcome::Link(LinkResponse::failed(LinkFailure::CodeNotFound))
    );
}

#[tokio::test]
async fn test_link_attempt_expired_and_invalid() {
    let platform = platform();
    let codes = codes();
    let mut router = EventRouter::new(settings(), shared(&platform), identities(&[]), codes.clone());
    let now = Instant::now();

    let code = codes.issue(MemberId(500), now);
    assert_eq!(
        router.handle_at(&link_attempt("765", &code), now + secs(600)).await,
        EventOutcome::Link(LinkResponse::failed(LinkFailure::CodeExpired))
    );

    assert_eq!(
        router
            .handle_at(&json!({"type": "link_attempt", "code": "ABCDEF"}), now)
            .await,
        EventOutcome::Link(LinkResponse::failed(LinkFailure::InvalidPayload))
    );
}

#[tokio::test]
async fn test_link_attempt_persistence_failure_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();
    let identities = Arc::new(IdentityMap::load(blocker.join("mapping.json")).unwrap());

    let platform = platform();
    let codes = codes();
    let mut router = EventRouter::new(settings(), shared(&platform), identities.clone(), codes.clone());
    let now = Instant::now();

    let code = codes.issue(MemberId(500), now);
    assert_eq!(
        router.handle_at(&link_attempt("765", &code), now).await,
        EventOutcome::Link(LinkResponse::failed(LinkFailure::Exception))
    );
    assert_eq!(identities.get("765"), None);
}
