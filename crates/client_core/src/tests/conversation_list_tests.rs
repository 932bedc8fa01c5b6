use super::*;
use chrono::{Duration, TimeZone};
use shared::{
    conversation::GroupSettings,
    domain::MessageId,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid time")
}

fn me() -> UserId {
    UserId::new("alice")
}

fn profile(id: &str, name: &str) -> UserProfile {
    UserProfile {
        id: UserId::new(id),
        display_name: name.into(),
    }
}

fn direct(id: &str, peer: &str, at: DateTime<Utc>) -> ConversationRecord {
    let conversation =
        Conversation::new_direct(ConversationId::new(id), me(), UserId::new(peer), at)
            .expect("direct");
    ConversationRecord {
        conversation,
        participants: vec![profile("alice", "Alice"), profile(peer, &peer.to_uppercase())],
        unread_count: 0,
        last_message: None,
    }
}

fn group(id: &str, name: &str, at: DateTime<Utc>) -> ConversationRecord {
    let conversation = Conversation::new_group(
        ConversationId::new(id),
        me(),
        [UserId::new("bob"), UserId::new("carol")],
        name,
        GroupSettings::default(),
        at,
    )
    .expect("group");
    ConversationRecord {
        conversation,
        participants: vec![profile("alice", "Alice"), profile("bob", "Bob")],
        unread_count: 0,
        last_message: None,
    }
}

fn message(conversation: &str, id: &str, sender: &str, content: &str, at: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new(sender),
        content: content.into(),
        timestamp: at,
        read_by: Vec::new(),
        nonce: None,
    }
}

fn order(list: &ConversationList) -> Vec<&str> {
    list.summaries().iter().map(|s| s.id().as_str()).collect()
}

fn c(id: &str) -> ConversationId {
    ConversationId::new(id)
}

#[test]
fn listing_is_sorted_newest_first_with_seeded_counters() {
    let mut list = ConversationList::new(me());
    let mut older = direct("d1", "bob", t0());
    older.unread_count = 3;
    list.replace_all(vec![older, group("g1", "Hikers", t0() + Duration::hours(1))]);

    assert_eq!(order(&list), vec!["g1", "d1"]);
    assert_eq!(list.unread(&c("d1")), 3);
    assert_eq!(list.total_unread(), 3);
    assert_eq!(list.get(&c("d1")).expect("d1").display_name, "BOB");
    assert_eq!(list.get(&c("g1")).expect("g1").display_name, "Hikers");
}

#[test]
fn incoming_message_reorders_and_counts() {
    let mut list = ConversationList::new(me());
    list.replace_all(vec![
        direct("d1", "bob", t0()),
        group("g1", "Hikers", t0() + Duration::hours(1)),
    ]);

    let update = list.apply_message(&message("d1", "m1", "bob", "ping", t0() + Duration::hours(2)));
    assert_eq!(update, ListUpdate::Updated { incremented: true });
    assert_eq!(order(&list), vec!["d1", "g1"]);
    assert_eq!(list.unread(&c("d1")), 1);
    assert_eq!(list.get(&c("d1")).and_then(|s| s.preview()), Some("ping"));

    let own = list.apply_message(&message("g1", "m2", "alice", "mine", t0() + Duration::hours(3)));
    assert_eq!(own, ListUpdate::Updated { incremented: false });
    assert_eq!(list.unread(&c("g1")), 0);
}

#[test]
fn open_conversation_never_counts_and_opening_zeroes() {
    let mut list = ConversationList::new(me());
    let mut record = direct("d1", "bob", t0());
    record.unread_count = 7;
    list.replace_all(vec![record]);

    list.open(&c("d1")).expect("open");
    assert_eq!(list.unread(&c("d1")), 0);
    let update = list.apply_message(&message("d1", "m1", "bob", "hey", t0() + Duration::minutes(1)));
    assert_eq!(update, ListUpdate::Updated { incremented: false });
    assert_eq!(list.unread(&c("d1")), 0);

    let mut reloaded = direct("d1", "bob", t0());
    reloaded.unread_count = 2;
    list.replace_all(vec![reloaded]);
    assert_eq!(list.unread(&c("d1")), 0, "open conversation stays read across reloads");

    assert_eq!(list.close(), Some(c("d1")));
    list.apply_message(&message("d1", "m2", "bob", "again", t0() + Duration::minutes(2)));
    assert_eq!(list.unread(&c("d1")), 1);
}

#[test]
fn unknown_conversations_are_reported() {
    let mut list = ConversationList::new(me());
    assert_eq!(
        list.apply_message(&message("nope", "m1", "bob", "x", t0())),
        ListUpdate::Unknown
    );
    assert_eq!(
        list.open(&c("nope")),
        Err(ChatError::InvalidConversationReference(c("nope")))
    );
    assert_eq!(list.open_conversation(), None);
}

#[test]
fn older_message_does_not_replace_preview() {
    let mut list = ConversationList::new(me());
    list.replace_all(vec![direct("d1", "bob", t0())]);
    list.apply_message(&message("d1", "m2", "bob", "newer", t0() + Duration::minutes(5)));
    list.apply_message(&message("d1", "m1", "bob", "older", t0() + Duration::minutes(1)));

    let summary = list.get(&c("d1")).expect("d1");
    assert_eq!(summary.preview(), Some("newer"));
    assert_eq!(summary.conversation.last_activity, t0() + Duration::minutes(5));
}

#[test]
fn search_matches_name_or_preview_case_insensitively() {
    let mut list = ConversationList::new(me());
    list.replace_all(vec![
        direct("d1", "bob", t0()),
        group("g1", "Weekend Hikers", t0()),
    ]);
    list.apply_message(&message("d1", "m1", "bob", "Lunch tomorrow?", t0()));

    let hits: Vec<_> = list.search("hik").iter().map(|s| s.id().clone()).collect();
    assert_eq!(hits, vec![c("g1")]);
    let hits: Vec<_> = list.search("LUNCH").iter().map(|s| s.id().clone()).collect();
    assert_eq!(hits, vec![c("d1")]);
    assert_eq!(list.search("  ").len(), 2);
    assert!(list.search("zzz").is_empty());
}

#[test]
fn nickname_overrides_peer_name() {
    let mut record = direct("d1", "bob", t0());
    record
        .conversation
        .set_nickname(&me(), Some("Bobby".into()))
        .expect("nickname");
    let mut list = ConversationList::new(me());
    list.upsert(record);
    assert_eq!(list.get(&c("d1")).expect("d1").display_name, "Bobby");
}

#[test]
fn filter_uses_local_overlay() {
    let mut list = ConversationList::new(me());
    let mut pinned = group("g1", "Pinned", t0());
    pinned.conversation.pin(&me()).expect("pin");
    list.replace_all(vec![pinned, direct("d1", "bob", t0() + Duration::minutes(1))]);

    let only_pinned = ListFilter {
        pinned: Some(true),
        ..ListFilter::default()
    };
    let ids: Vec<_> = list
        .filter(&only_pinned, t0())
        .iter()
        .map(|s| s.id().clone())
        .collect();
    assert_eq!(ids, vec![c("g1")]);

    let directs = ListFilter {
        kind: Some(ConversationKind::Direct),
        ..ListFilter::default()
    };
    assert_eq!(list.filter(&directs, t0()).len(), 1);
}

#[test]
fn removal_clears_open_state() {
    let mut list = ConversationList::new(me());
    list.replace_all(vec![direct("d1", "bob", t0())]);
    list.open(&c("d1")).expect("open");
    assert!(list.remove(&c("d1")));
    assert_eq!(list.open_conversation(), None);
    assert!(!list.contains(&c("d1")));
}
