use super::*;
use shared::conversation::GroupSettings;

async fn setup(users: &[&str]) -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ctx = ApiContext {
        storage,
        auth: AuthConfig {
            secret: "test-secret".into(),
            ttl_seconds: 3600,
        },
    };
    for user in users {
        register_user(
            &ctx,
            &UserProfile {
                id: UserId::new(*user),
                display_name: format!("{user} display"),
            },
        )
        .await
        .expect("register");
    }
    ctx
}

fn uid(name: &str) -> UserId {
    UserId::new(name)
}

#[test]
fn issued_token_round_trips_through_verification() {
    let cfg = AuthConfig {
        secret: "secret".into(),
        ttl_seconds: 60,
    };
    let profile = UserProfile {
        id: uid("alice"),
        display_name: "Alice".into(),
    };
    let token = auth::issue_token(&cfg, &profile, Utc::now()).expect("token");
    let verified = auth::verify_token(&cfg, &token).expect("verify");
    assert_eq!(verified, profile);

    let other = AuthConfig {
        secret: "different".into(),
        ttl_seconds: 60,
    };
    let err = auth::verify_token(&other, &token).expect_err("wrong secret");
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[test]
fn expired_token_is_rejected() {
    let cfg = AuthConfig {
        secret: "secret".into(),
        ttl_seconds: 60,
    };
    let profile = UserProfile {
        id: uid("alice"),
        display_name: "Alice".into(),
    };
    let issued = Utc::now() - chrono::Duration::hours(2);
    let token = auth::issue_token(&cfg, &profile, issued).expect("token");
    let err = auth::verify_token(&cfg, &token).expect_err("expired");
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[test]
fn bearer_header_parsing() {
    assert_eq!(auth::bearer_token("Bearer abc"), Some("abc"));
    assert_eq!(auth::bearer_token("Bearer   "), None);
    assert_eq!(auth::bearer_token("Basic abc"), None);
}

#[tokio::test]
async fn open_direct_returns_same_record_for_both_users() {
    let ctx = setup(&["alice", "bob"]).await;
    let from_alice = open_direct(&ctx, &uid("alice"), &uid("bob"))
        .await
        .expect("open");
    let from_bob = open_direct(&ctx, &uid("bob"), &uid("alice"))
        .await
        .expect("open");
    assert_eq!(from_alice.conversation.id, from_bob.conversation.id);
    assert_eq!(from_alice.participants.len(), 2);

    let err = open_direct(&ctx, &uid("alice"), &uid("alice"))
        .await
        .expect_err("self");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = open_direct(&ctx, &uid("alice"), &uid("ghost"))
        .await
        .expect_err("unknown user");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn send_message_replays_nonce_and_counts_unread() {
    let ctx = setup(&["alice", "bob"]).await;
    let record = open_direct(&ctx, &uid("alice"), &uid("bob"))
        .await
        .expect("open");
    let nonce = Nonce::new("n-1");

    let first = send_message(&ctx, &uid("alice"), &record.conversation.id, " hello ", &nonce)
        .await
        .expect("send");
    let replay = send_message(&ctx, &uid("alice"), &record.conversation.id, "hello", &nonce)
        .await
        .expect("replay");
    assert!(first.fresh);
    assert!(!replay.fresh);
    assert_eq!(first.message.id, replay.message.id);
    assert_eq!(first.message.content, "hello");

    let listed = list_conversations(&ctx, &uid("bob"), &ListFilter::default())
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].unread_count, 1);
    assert_eq!(
        listed[0].last_message.as_ref().map(|m| m.id.clone()),
        Some(first.message.id)
    );
}

#[tokio::test]
async fn send_message_rejects_empty_and_outsiders() {
    let ctx = setup(&["alice", "bob", "mallory"]).await;
    let record = open_direct(&ctx, &uid("alice"), &uid("bob"))
        .await
        .expect("open");

    let err = send_message(&ctx, &uid("alice"), &record.conversation.id, "   ", &Nonce::generate())
        .await
        .expect_err("empty");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = send_message(&ctx, &uid("mallory"), &record.conversation.id, "hi", &Nonce::generate())
        .await
        .expect_err("outsider");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = list_messages(&ctx, &uid("mallory"), &record.conversation.id, 50, None)
        .await
        .expect_err("outsider history");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn admins_only_group_blocks_member_posts() {
    let ctx = setup(&["alice", "bob", "carol"]).await;
    let settings = GroupSettings {
        admins_only_messages: true,
        ..GroupSettings::default()
    };
    let record = create_group(
        &ctx,
        &uid("alice"),
        CreateGroupRequest {
            name: "announcements".into(),
            members: vec![uid("bob"), uid("carol")],
            settings,
        },
    )
    .await
    .expect("group");
    let id = record.conversation.id;

    let err = send_message(&ctx, &uid("bob"), &id, "hi", &Nonce::generate())
        .await
        .expect_err("member post");
    assert_eq!(err.code, ErrorCode::Forbidden);

    send_message(&ctx, &uid("alice"), &id, "welcome", &Nonce::generate())
        .await
        .expect("admin post");
}

#[tokio::test]
async fn membership_violations_map_to_error_codes() {
    let ctx = setup(&["alice", "bob", "carol", "dave"]).await;
    let record = create_group(
        &ctx,
        &uid("alice"),
        CreateGroupRequest {
            name: "crew".into(),
            members: vec![uid("bob"), uid("carol")],
            settings: GroupSettings::default(),
        },
    )
    .await
    .expect("group");
    let id = record.conversation.id;

    let err = add_participant(&ctx, &uid("bob"), &id, &uid("dave"))
        .await
        .expect_err("non-admin add");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = add_participant(&ctx, &uid("alice"), &id, &uid("bob"))
        .await
        .expect_err("already member");
    assert_eq!(err.code, ErrorCode::Conflict);

    let added = add_participant(&ctx, &uid("alice"), &id, &uid("dave"))
        .await
        .expect("add");
    assert_eq!(added.participants.len(), 4);

    remove_participant(&ctx, &uid("alice"), &id, &uid("dave"))
        .await
        .expect("remove");
    let err = list_messages(&ctx, &uid("dave"), &id, 10, None)
        .await
        .expect_err("removed member");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let direct = open_direct(&ctx, &uid("alice"), &uid("bob"))
        .await
        .expect("direct");
    let err = add_participant(&ctx, &uid("alice"), &direct.conversation.id, &uid("carol"))
        .await
        .expect_err("direct add");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn admin_grants_persist() {
    let ctx = setup(&["alice", "bob"]).await;
    let record = create_group(
        &ctx,
        &uid("alice"),
        CreateGroupRequest {
            name: "pair".into(),
            members: vec![uid("bob")],
            settings: GroupSettings::default(),
        },
    )
    .await
    .expect("group");
    let id = record.conversation.id;

    let granted = set_admin(&ctx, &uid("alice"), &id, &uid("bob"))
        .await
        .expect("grant");
    assert!(granted.conversation.is_admin(&uid("bob")));

    let revoked = revoke_admin(&ctx, &uid("bob"), &id, &uid("alice"))
        .await
        .expect("revoke");
    assert!(!revoked.conversation.is_admin(&uid("alice")));

    let err = revoke_admin(&ctx, &uid("bob"), &id, &uid("bob"))
        .await
        .expect_err("last admin");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn overlay_patch_only_touches_caller() {
    let ctx = setup(&["alice", "bob"]).await;
    let record = open_direct(&ctx, &uid("alice"), &uid("bob"))
        .await
        .expect("open");
    let id = record.conversation.id;

    let patched = update_overlay(
        &ctx,
        &uid("alice"),
        &id,
        OverlayPatch {
            archived: Some(true),
            pinned: Some(true),
            ..OverlayPatch::default()
        },
    )
    .await
    .expect("patch");
    let alice_state = patched.conversation.overlay(&uid("alice")).expect("alice");
    let bob_state = patched.conversation.overlay(&uid("bob")).expect("bob");
    assert!(alice_state.archived && alice_state.pinned);
    assert!(!bob_state.archived && !bob_state.pinned);

    let archived_only = ListFilter {
        archived: Some(false),
        ..ListFilter::default()
    };
    let visible = list_conversations(&ctx, &uid("alice"), &archived_only)
        .await
        .expect("list");
    assert!(visible.is_empty());
}

#[tokio::test]
async fn mark_read_emits_receipt_once() {
    let ctx = setup(&["alice", "bob"]).await;
    let record = open_direct(&ctx, &uid("alice"), &uid("bob"))
        .await
        .expect("open");
    let id = record.conversation.id;
    let sent = send_message(&ctx, &uid("alice"), &id, "ping", &Nonce::generate())
        .await
        .expect("send");

    let own = mark_read(&ctx, &uid("alice"), &id, &sent.message.id, Utc::now())
        .await
        .expect("own read");
    assert!(own.is_none());

    let frame = mark_read(&ctx, &uid("bob"), &id, &sent.message.id, Utc::now())
        .await
        .expect("read");
    assert!(matches!(frame, Some(ServerFrame::MessageRead { .. })));

    let again = mark_read(&ctx, &uid("bob"), &id, &sent.message.id, Utc::now())
        .await
        .expect("read again");
    assert!(again.is_none());

    let err = mark_read(&ctx, &uid("bob"), &id, &MessageId::new("missing"), Utc::now())
        .await
        .expect_err("missing message");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn overlay_patch_racing_a_send_keeps_last_message() {
    let ctx = setup(&["alice", "bob"]).await;
    let record = open_direct(&ctx, &uid("alice"), &uid("bob"))
        .await
        .expect("open");
    let id = record.conversation.id;

    let bob = uid("bob");
    let alice = uid("alice");
    let nonce = Nonce::generate();
    let (sent, patched) = tokio::join!(
        send_message(&ctx, &bob, &id, "hi", &nonce),
        update_overlay(
            &ctx,
            &alice,
            &id,
            OverlayPatch {
                muted: Some(true),
                ..OverlayPatch::default()
            },
        ),
    );
    let sent = sent.expect("send");
    patched.expect("patch");

    let stored = ctx
        .storage
        .load_conversation(&id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored.last_message_id, Some(sent.message.id));
    assert!(stored.overlay(&uid("alice")).expect("alice").muted);
}
