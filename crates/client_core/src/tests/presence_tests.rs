use super::*;

fn tracker() -> PresenceTracker {
    PresenceTracker::new(Duration::from_secs(3), Duration::from_secs(1))
}

fn u(id: &str) -> UserId {
    UserId::new(id)
}

fn c(id: &str) -> ConversationId {
    ConversationId::new(id)
}

#[test]
fn online_set_tracks_events() {
    let mut p = tracker();
    assert!(p.user_online(u("bob"), "Bob".into()));
    assert!(!p.user_online(u("bob"), "Bobby".into()));
    assert!(p.is_online(&u("bob")));
    let online = p.online_users();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].id, u("bob"));
    assert_eq!(online[0].display_name, "Bobby");

    p.user_offline(&u("bob"));
    assert!(!p.is_online(&u("bob")));
    assert!(p.online_users().is_empty());
}

#[test]
fn typing_implies_online_and_offline_clears_typing() {
    let mut p = tracker();
    let now = Instant::now();
    assert!(p.remote_typing(&c("c1"), &u("bob"), "Bob", true, now));
    assert!(!p.remote_typing(&c("c1"), &u("bob"), "Bob", true, now));
    assert!(p.is_online(&u("bob")));
    assert_eq!(p.typing_users(&c("c1")), vec![u("bob")]);

    assert_eq!(p.user_offline(&u("bob")), vec![c("c1")]);
    assert!(p.typing_users(&c("c1")).is_empty());
    assert!(p.typing_conversations().is_empty());
}

#[test]
fn outsiders_cannot_show_as_typing() {
    let mut p = tracker();
    assert!(!p.remote_typing(&c("c1"), &u("mallory"), "M", false, Instant::now()));
    assert!(p.typing_users(&c("c1")).is_empty());
    assert!(!p.is_online(&u("mallory")));
}

#[test]
fn stopping_the_last_typer_drops_the_conversation_key() {
    let mut p = tracker();
    let now = Instant::now();
    p.remote_typing(&c("c1"), &u("bob"), "Bob", true, now);
    p.remote_typing(&c("c1"), &u("carol"), "Carol", true, now);

    assert!(p.remote_stopped(&c("c1"), &u("bob")));
    assert_eq!(p.typing_users(&c("c1")), vec![u("carol")]);
    assert!(p.remote_stopped(&c("c1"), &u("carol")));
    assert!(!p.typing_conversations().contains(&c("c1")));
    assert!(!p.remote_stopped(&c("c1"), &u("carol")));
}

#[test]
fn remote_indicator_lapses_after_debounce_plus_grace() {
    let mut p = tracker();
    let now = Instant::now();
    p.remote_typing(&c("c1"), &u("bob"), "Bob", true, now);

    assert!(p.expire_remote(now + Duration::from_secs(3)).is_empty());
    assert_eq!(p.expire_remote(now + Duration::from_secs(4)), vec![c("c1")]);
    assert!(p.typing_conversations().is_empty());
    assert!(p.is_online(&u("bob")), "expiry does not mean offline");
}

#[test]
fn local_keystrokes_collapse_into_one_start() {
    let mut p = tracker();
    let now = Instant::now();
    assert_eq!(
        p.local_keystroke(&c("c1"), now),
        Some(ClientFrame::TypingStart {
            conversation_id: c("c1")
        })
    );
    assert_eq!(p.local_keystroke(&c("c1"), now + Duration::from_secs(2)), None);

    assert!(p.poll_local_expiry(now + Duration::from_secs(4)).is_empty());
    assert_eq!(
        p.poll_local_expiry(now + Duration::from_secs(5)),
        vec![ClientFrame::TypingStop {
            conversation_id: c("c1")
        }]
    );
    assert!(p.local_keystroke(&c("c1"), now + Duration::from_secs(6)).is_some());
}

#[test]
fn sending_stops_typing_immediately() {
    let mut p = tracker();
    let now = Instant::now();
    p.local_keystroke(&c("c1"), now);
    assert_eq!(
        p.local_sent(&c("c1")),
        Some(ClientFrame::TypingStop {
            conversation_id: c("c1")
        })
    );
    assert_eq!(p.local_sent(&c("c1")), None);
    assert!(p.poll_local_expiry(now + Duration::from_secs(10)).is_empty());
}
