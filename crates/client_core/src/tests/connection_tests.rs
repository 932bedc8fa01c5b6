use super::*;
use std::sync::{Arc, Mutex};

fn manager() -> ConnectionManager {
    ConnectionManager::new(ReconnectPolicy::default())
}

fn drain(rx: &mut mpsc::Receiver<ClientFrame>) -> Vec<ClientFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Drives a manager to ready on a fresh link.
fn connect_ready(mgr: &mut ConnectionManager) -> mpsc::Receiver<ClientFrame> {
    let generation = match mgr.status() {
        ConnectionStatus::Degraded => mgr.retry_due(mgr.generation()),
        _ => mgr.start("token"),
    }
    .expect("connect begins");
    let (tx, rx) = mpsc::channel(32);
    assert!(mgr.transport_established(generation, tx, Instant::now()));
    mgr.authenticated(Instant::now());
    rx
}

fn c(id: &str) -> ConversationId {
    ConversationId::new(id)
}

#[test]
fn walks_the_happy_path_and_sends_credential_first() {
    let mut mgr = manager();
    assert_eq!(mgr.status(), ConnectionStatus::Disconnected);

    let generation = mgr.start("secret-token").expect("generation");
    assert_eq!(mgr.status(), ConnectionStatus::Connecting);

    let (tx, mut rx) = mpsc::channel(8);
    assert!(mgr.transport_established(generation, tx, Instant::now()));
    assert_eq!(mgr.status(), ConnectionStatus::Authenticating);
    assert_eq!(
        drain(&mut rx),
        vec![ClientFrame::Authenticate {
            credential: "secret-token".into()
        }]
    );

    assert!(!mgr.send(ClientFrame::Ping), "not ready yet");
    mgr.authenticated(Instant::now());
    assert_eq!(mgr.status(), ConnectionStatus::Ready);
    assert!(mgr.send(ClientFrame::Ping));
    assert_eq!(drain(&mut rx), vec![ClientFrame::Ping]);
}

#[test]
fn send_returns_false_unless_ready() {
    let mut mgr = manager();
    assert!(!mgr.send(ClientFrame::Ping));
    mgr.start("t");
    assert!(!mgr.send(ClientFrame::Ping));
}

#[test]
fn subscribing_twice_emits_one_join() {
    let mut mgr = manager();
    let mut rx = connect_ready(&mut mgr);
    drain(&mut rx);

    assert!(mgr.subscribe(c("c1")));
    assert!(!mgr.subscribe(c("c1")));
    assert_eq!(
        drain(&mut rx),
        vec![ClientFrame::JoinChat {
            conversation_id: c("c1")
        }]
    );

    assert!(mgr.unsubscribe(&c("c1")));
    assert!(!mgr.unsubscribe(&c("c1")));
    assert_eq!(
        drain(&mut rx),
        vec![ClientFrame::LeaveChat {
            conversation_id: c("c1")
        }]
    );
}

#[test]
fn ready_transition_rejoins_known_rooms() {
    let mut mgr = manager();
    mgr.subscribe(c("c2"));
    mgr.subscribe(c("c1"));

    let mut rx = connect_ready(&mut mgr);
    let frames = drain(&mut rx);
    assert_eq!(
        frames[1..],
        [
            ClientFrame::JoinChat {
                conversation_id: c("c1")
            },
            ClientFrame::JoinChat {
                conversation_id: c("c2")
            },
        ]
    );

    let generation = mgr.generation();
    assert!(matches!(
        mgr.transport_dropped(generation),
        Some(ReconnectDecision::RetryAfter { attempt: 1, .. })
    ));
    assert_eq!(mgr.status(), ConnectionStatus::Degraded);

    let mut rx = connect_ready(&mut mgr);
    let joins = drain(&mut rx)
        .into_iter()
        .filter(|f| matches!(f, ClientFrame::JoinChat { .. }))
        .count();
    assert_eq!(joins, 2, "each room joined exactly once per connection");
    assert_eq!(mgr.attempts(), 0);
}

#[test]
fn backoff_grows_then_exhausts() {
    let mut mgr = manager();
    let mut generation = mgr.start("t").expect("start");
    let mut delays = Vec::new();
    loop {
        match mgr.transport_dropped(generation) {
            Some(ReconnectDecision::RetryAfter { delay, .. }) => {
                delays.push(delay.as_secs());
                generation = mgr.retry_due(generation).expect("retry");
            }
            Some(ReconnectDecision::Exhausted) => break,
            None => panic!("drop should be recognised"),
        }
    }
    assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    assert_eq!(mgr.status(), ConnectionStatus::Degraded);
    assert_eq!(mgr.retry_due(generation), None, "no timer-driven retry after exhaustion");

    let generation = mgr.request_reconnect().expect("explicit reconnect");
    assert_eq!(mgr.status(), ConnectionStatus::Connecting);
    assert_eq!(mgr.attempts(), 0);
    assert!(matches!(
        mgr.transport_dropped(generation),
        Some(ReconnectDecision::RetryAfter { attempt: 1, .. })
    ));
}

#[test]
fn stale_generation_signals_are_ignored() {
    let mut mgr = manager();
    let old = mgr.start("t").expect("start");
    let new = mgr.request_reconnect().expect("reconnect");
    assert_ne!(old, new);

    let (tx, _rx) = mpsc::channel(4);
    assert!(!mgr.transport_established(old, tx, Instant::now()));
    assert_eq!(mgr.transport_dropped(old), None);
    assert_eq!(mgr.status(), ConnectionStatus::Connecting);
}

#[test]
fn duplicate_drop_for_same_link_counts_once() {
    let mut mgr = manager();
    connect_ready(&mut mgr);
    let generation = mgr.generation();
    assert!(mgr.transport_dropped(generation).is_some());
    assert_eq!(mgr.transport_dropped(generation), None);
    assert_eq!(mgr.attempts(), 1);
}

#[test]
fn rejection_is_terminal() {
    let mut mgr = manager();
    let generation = mgr.start("bad").expect("start");
    let (tx, _rx) = mpsc::channel(4);
    mgr.transport_established(generation, tx, Instant::now());
    mgr.authentication_rejected();

    assert_eq!(mgr.status(), ConnectionStatus::Disconnected);
    assert_eq!(mgr.transport_dropped(generation), None);
    assert_eq!(mgr.request_reconnect(), None, "needs a new credential");
    assert!(mgr.start("good").is_some());
}

#[test]
fn logout_forgets_rooms_and_credential() {
    let mut mgr = manager();
    mgr.subscribe(c("c1"));
    connect_ready(&mut mgr);
    mgr.logout();
    assert_eq!(mgr.status(), ConnectionStatus::Disconnected);
    assert_eq!(mgr.rooms().count(), 0);
    assert_eq!(mgr.request_reconnect(), None);
}

#[test]
fn heartbeat_pings_then_expires() {
    let mut mgr = manager();
    let mut rx = connect_ready(&mut mgr);
    drain(&mut rx);
    let interval = Duration::from_secs(15);
    let timeout = Duration::from_secs(45);
    let start = Instant::now();

    assert_eq!(mgr.heartbeat(start, interval, timeout), HeartbeatAction::Idle);
    assert_eq!(
        mgr.heartbeat(start + Duration::from_secs(16), interval, timeout),
        HeartbeatAction::PingSent
    );
    assert_eq!(drain(&mut rx), vec![ClientFrame::Ping]);

    mgr.note_inbound(start + Duration::from_secs(20));
    assert_eq!(
        mgr.heartbeat(start + Duration::from_secs(50), interval, timeout),
        HeartbeatAction::PingSent
    );
    assert_eq!(
        mgr.heartbeat(start + Duration::from_secs(66), interval, timeout),
        HeartbeatAction::Expired
    );
}

#[test]
fn dispatch_invokes_handlers_by_kind() {
    let mut mgr = manager();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    mgr.on_event(
        ServerFrameKind::Pong,
        Box::new(move |frame| sink.lock().expect("lock").push(frame.clone())),
    );

    mgr.dispatch(&ServerFrame::Pong);
    mgr.dispatch(&ServerFrame::AuthenticationError {
        message: "nope".into(),
    });
    assert_eq!(*seen.lock().expect("lock"), vec![ServerFrame::Pong]);
}
