mod common;

use common::*;
use samcom_common::types::reason;
use samcom_common::{AuthStatus, Body, LogoutStatus, Packet};
use std::time::Duration;

#[tokio::test]
async fn station_authenticates_through_relay() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;
    assert!(center.state.center.registry().get("bms_001").is_some());

    let mut station = TestStation::connect(&relay).await;
    let result = station.authenticate("A", "k1").await;
    assert_eq!(result, Packet::auth_result("A", AuthStatus::Authenticated, None));
    assert_eq!(
        center.state.center.users().owning_relay("A").as_deref(),
        Some("bms_001")
    );
    assert!(relay.state.sessions.contains("A"));
}

#[tokio::test]
async fn wrong_key_fails_and_retry_succeeds() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;
    let mut station = TestStation::connect(&relay).await;

    let failed = station.authenticate("B", "wrong").await;
    assert_eq!(
        failed,
        Packet::auth_result("B", AuthStatus::Failed, Some(reason::BAD_RESPONSE))
    );
    assert!(!center.state.center.users().is_authenticated("B"));

    let ok = station.authenticate("B", "k2").await;
    assert_eq!(ok, Packet::auth_result("B", AuthStatus::Authenticated, None));
}

#[tokio::test]
async fn second_session_for_same_user_is_rejected() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;

    let mut first = TestStation::connect(&relay).await;
    first.authenticate("A", "k1").await;

    let mut second = TestStation::connect(&relay).await;
    second.send(Packet::auth("A")).await;
    assert_eq!(
        second.recv().await,
        Packet::user_error("A", reason::ALREADY_CONNECTED)
    );

    // The first session is untouched.
    assert!(center.state.center.users().is_pinned_to("A", "bms_001"));
    assert_eq!(relay.state.sessions.len(), 1);
}

#[tokio::test]
async fn text_crosses_two_relays() {
    let center = start_center().await;
    let r1 = start_relay(&center, "r1").await;
    let r2 = start_relay(&center, "r2").await;

    let mut alice = TestStation::connect(&r1).await;
    let mut bob = TestStation::connect(&r2).await;
    alice.authenticate("A", "k1").await;
    bob.authenticate("B", "k2").await;

    alice
        .send(Packet::text("A", "B", "hello via the center").with_packet_id(Some(9)))
        .await;
    assert_eq!(
        alice.recv().await,
        Packet::text_ack("A", "B").with_packet_id(Some(9))
    );

    let delivered = bob.recv().await;
    assert_eq!(delivered.body, Packet::text("A", "B", "hello via the center").body);
    assert_eq!(delivered.relay_id, None);
}

#[tokio::test]
async fn relay_overwrites_claimed_source_user() {
    let center = start_center().await;
    let r1 = start_relay(&center, "r1").await;
    let r2 = start_relay(&center, "r2").await;

    let mut alice = TestStation::connect(&r1).await;
    let mut bob = TestStation::connect(&r2).await;
    alice.authenticate("A", "k1").await;
    bob.authenticate("B", "k2").await;

    alice.send(Packet::text("C", "B", "spoofed?")).await;
    let delivered = bob.recv().await;
    let Body::Text { source_user, .. } = delivered.body else {
        panic!("expected text, got {delivered:?}");
    };
    assert_eq!(source_user, "A");
}

#[tokio::test]
async fn users_on_the_same_relay_route_through_center() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;

    let mut alice = TestStation::connect(&relay).await;
    let mut bob = TestStation::connect(&relay).await;
    alice.authenticate("A", "k1").await;
    bob.authenticate("B", "k2").await;

    alice.send(Packet::text("A", "B", "next door")).await;
    assert_eq!(alice.recv().await, Packet::text_ack("A", "B"));
    assert_eq!(bob.recv().await.body, Packet::text("A", "B", "next door").body);
}

#[tokio::test]
async fn disconnect_clears_routing() {
    let center = start_center().await;
    let r1 = start_relay(&center, "r1").await;
    let r2 = start_relay(&center, "r2").await;

    let mut alice = TestStation::connect(&r1).await;
    let mut bob = TestStation::connect(&r2).await;
    alice.authenticate("A", "k1").await;
    bob.authenticate("B", "k2").await;

    bob.close().await;
    assert!(wait_until(|| !center.state.center.users().is_authenticated("B")).await);
    assert!(wait_until(|| !r2.state.sessions.contains("B")).await);

    alice.send(Packet::text("A", "B", "still there?")).await;
    assert_eq!(
        alice.recv().await,
        Packet::user_error("A", reason::TARGET_NOT_AUTHENTICATED)
    );
}

#[tokio::test]
async fn explicit_logout_completes_and_closes() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;
    let mut station = TestStation::connect(&relay).await;
    station.authenticate("A", "k1").await;

    station.send(Packet::auth_logout("A")).await;
    assert_eq!(
        station.recv().await,
        Packet::logout_result("A", LogoutStatus::LoggedOut, None)
    );
    station.expect_closed().await;

    assert!(!center.state.center.users().is_authenticated("A"));
    assert!(wait_until(|| relay.state.sessions.is_empty()).await);
}

#[tokio::test]
async fn same_user_can_log_in_again_after_disconnect() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;

    let mut first = TestStation::connect(&relay).await;
    first.authenticate("A", "k1").await;
    first.close().await;
    assert!(wait_until(|| relay.state.sessions.is_empty()).await);

    let mut second = TestStation::connect(&relay).await;
    let result = second.authenticate("A", "k1").await;
    assert_eq!(result, Packet::auth_result("A", AuthStatus::Authenticated, None));
}

#[tokio::test]
async fn packets_before_auth_are_refused() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;
    let mut station = TestStation::connect(&relay).await;

    station.send(Packet::text("A", "B", "too early")).await;
    assert_eq!(station.recv().await, Packet::error(reason::AUTHENTICATE_FIRST));

    station.send_text(r#"{"type":"auth","user_id":""}"#).await;
    assert!(matches!(station.recv().await.body, Body::Error { user_id: None, .. }));

    station.send_text("not json").await;
    assert!(matches!(station.recv().await.body, Body::Error { .. }));

    let ok = station.authenticate("A", "k1").await;
    assert_eq!(ok, Packet::auth_result("A", AuthStatus::Authenticated, None));
}

#[tokio::test]
async fn auth_for_another_user_is_refused() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;
    let mut station = TestStation::connect(&relay).await;
    station.authenticate("A", "k1").await;

    station.send(Packet::auth("B")).await;
    assert_eq!(
        station.recv().await,
        Packet::user_error("A", reason::USER_MISMATCH)
    );
    assert!(!relay.state.sessions.contains("B"));
}

#[tokio::test]
async fn silent_station_is_dropped_after_auth_timeout() {
    let center = start_center().await;
    let relay = start_relay_with(&center, "bms_001", |c| c.auth_timeout = 1).await;
    let mut station = TestStation::connect(&relay).await;

    assert_eq!(station.recv().await, Packet::error(reason::AUTH_TIMEOUT));
    station.expect_closed().await;
}

#[tokio::test]
async fn center_loss_closes_sessions() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;
    let mut station = TestStation::connect(&relay).await;
    station.authenticate("A", "k1").await;

    center.shutdown.send(true).unwrap();

    assert_eq!(
        station.recv().await,
        Packet::user_error("A", reason::CENTER_UNAVAILABLE)
    );
    station.expect_closed().await;
    assert!(wait_until(|| !relay.state.is_upstream_ready()).await);
    assert!(relay.state.sessions.is_empty());
}

#[tokio::test]
async fn auth_while_center_is_down_is_refused() {
    let center = start_center().await;
    let relay = start_relay(&center, "bms_001").await;
    center.shutdown.send(true).unwrap();
    assert!(wait_until(|| !relay.state.is_upstream_ready()).await);

    let mut station = TestStation::connect(&relay).await;
    station.send(Packet::auth("A")).await;
    assert_eq!(
        station.recv().await,
        Packet::user_error("A", reason::CENTER_UNAVAILABLE)
    );
    assert!(relay.state.sessions.is_empty());
}

#[tokio::test]
async fn duplicate_relay_id_replaces_registration() {
    let center = start_center().await;
    let _first = start_relay(&center, "bms_001").await;
    let second = start_relay(&center, "bms_001").await;

    let mut station = TestStation::connect(&second).await;
    let result = station.authenticate("A", "k1").await;
    assert_eq!(result, Packet::auth_result("A", AuthStatus::Authenticated, None));
    assert!(station.recv_timeout(Duration::from_millis(100)).await.is_none());
}
