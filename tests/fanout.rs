use std::sync::Arc;
use std::time::Duration;

use roomcast::db::{RoomId, User};
use roomcast::hub::{Action, ConnectionSession, Datastore, Group, Hub, HubError, MemoryStore};
use serde_json::Value;
use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;

struct Client {
    session: ConnectionSession,
    rx: Receiver<String>,
}

impl Client {
    fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(payload) = self.rx.try_recv() {
            out.push(serde_json::from_str(&payload).unwrap());
        }
        out
    }

    fn presence(&mut self) -> Vec<Vec<String>> {
        self.drain()
            .into_iter()
            .filter_map(|p| {
                let users = p.get("users")?.as_array()?.clone();
                Some(users.iter().map(|u| u["id"].as_str().unwrap().to_owned()).collect())
            })
            .collect()
    }

    fn activity(&mut self) -> Vec<Value> {
        self.drain()
            .into_iter()
            .filter(|p| p.get("requestId").is_some())
            .collect()
    }
}

async fn setup() -> (Arc<MemoryStore>, Arc<Hub>, RoomId) {
    setup_with_buffer(64).await
}

async fn setup_with_buffer(outbound_buffer: usize) -> (Arc<MemoryStore>, Arc<Hub>, RoomId) {
    let store = Arc::new(MemoryStore::new());
    let room = store.create_room("seven").await.unwrap().id;
    let hub = Hub::new(store.clone(), outbound_buffer);
    (store, hub, room)
}

async fn client(store: &MemoryStore, hub: &Arc<Hub>, id: &str) -> Client {
    store.insert_user(User { id: id.into(), alias: id.to_uppercase() });
    let user = store.ensure_user(id).await.unwrap();
    let (session, rx) = hub.connect(user);
    Client { session, rx }
}

#[tokio::test]
async fn two_subscribers_one_message() {
    let (store, hub, room) = setup().await;
    let group = Group::Room(room);
    let mut a = client(&store, &hub, "a").await;
    let mut b = client(&store, &hub, "b").await;

    a.session.join_room(room).await.unwrap();
    a.session.subscribe(group, "r1").await.unwrap();
    b.session.join_room(room).await.unwrap();
    b.session.subscribe(group, "r2").await.unwrap();

    let mut members = hub.registry().members(&group);
    members.sort();
    let mut expected = vec![a.session.id(), b.session.id()];
    expected.sort();
    assert_eq!(members, expected);

    // both see the roster with both users after b joined
    assert_eq!(a.presence().last().unwrap(), &["a", "b"]);
    assert_eq!(b.presence().last().unwrap(), &["a", "b"]);

    a.session.create_message("hi").await.unwrap();

    let to_a = a.activity();
    let to_b = b.activity();
    assert_eq!(to_a.len(), 1);
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_a[0]["requestId"], "r1");
    assert_eq!(to_b[0]["requestId"], "r2");
    assert_eq!(to_a[0]["action"], "create");
    assert_eq!(to_a[0]["data"]["text"], "hi");
    assert_eq!(to_a[0]["data"], to_b[0]["data"]);
}

#[tokio::test]
async fn registry_follows_the_last_join_or_leave() {
    let (store, hub, room) = setup().await;
    let mut a = client(&store, &hub, "a").await;
    let group = Group::Room(room);

    let steps = [true, true, false, true, false, false, true];
    for join in steps {
        if join {
            a.session.join_room(room).await.unwrap();
        } else {
            a.session.leave_room(room).await.unwrap();
        }
        assert_eq!(hub.registry().is_member(&group, a.session.id()), join);
    }
}

#[tokio::test]
async fn disconnect_twice_broadcasts_once() {
    let (store, hub, room) = setup().await;
    let mut a = client(&store, &hub, "a").await;
    let mut watcher = client(&store, &hub, "w").await;

    watcher.session.join_room(room).await.unwrap();
    a.session.join_room(room).await.unwrap();
    a.session.subscribe(Group::Room(room), "r1").await.unwrap();
    watcher.drain();

    a.session.disconnect().await.unwrap();
    let groups_after_first = hub.registry().groups_of(a.session.id());
    let members_after_first = hub.registry().members(&Group::Room(room));

    a.session.disconnect().await.unwrap();
    assert_eq!(hub.registry().groups_of(a.session.id()), groups_after_first);
    assert_eq!(hub.registry().members(&Group::Room(room)), members_after_first);
    assert!(groups_after_first.is_empty());

    let rosters = watcher.presence();
    assert_eq!(rosters, vec![vec!["w".to_owned()]]);
    assert_eq!(store.get_room(room).await.unwrap().members, ["w"]);
}

#[tokio::test]
async fn message_without_room_reaches_nobody() {
    let (store, hub, room) = setup().await;
    let mut a = client(&store, &hub, "a").await;
    let mut watcher = client(&store, &hub, "w").await;
    watcher.session.subscribe(Group::Room(room), "w1").await.unwrap();

    let err = a.session.create_message("hello?").await.unwrap_err();
    assert!(matches!(err, HubError::NoActiveRoom));
    assert!(store.messages().is_empty());
    assert!(watcher.drain().is_empty());
}

#[tokio::test]
async fn resubscribing_supersedes_the_request_id() {
    let (store, hub, room) = setup().await;
    let mut a = client(&store, &hub, "a").await;
    let group = Group::Room(room);

    a.session.join_room(room).await.unwrap();
    a.session.subscribe(group, "x").await.unwrap();
    a.session.subscribe(group, "y").await.unwrap();
    a.drain();

    a.session.create_message("one").await.unwrap();
    a.session.create_message("two").await.unwrap();

    let ids: Vec<_> = a.activity().iter().map(|p| p["requestId"].clone()).collect();
    assert_eq!(ids, ["y", "y"]);
}

#[tokio::test]
async fn presence_counts_every_join_and_leave() {
    let (store, hub, room) = setup().await;
    let mut watcher = client(&store, &hub, "w").await;
    watcher.session.subscribe(Group::Room(room), "w").await.unwrap();

    let mut clients = Vec::new();
    for id in ["a", "b", "c", "d"] {
        let mut c = client(&store, &hub, id).await;
        c.session.join_room(room).await.unwrap();
        clients.push(c);
    }
    for c in clients.iter_mut().take(2) {
        c.session.leave_room(room).await.unwrap();
    }

    let rosters = watcher.presence();
    assert_eq!(rosters.len(), 4 + 2);
    assert_eq!(rosters[0], ["a"]);
    assert_eq!(rosters[3], ["a", "b", "c", "d"]);
    assert_eq!(rosters[4], ["b", "c", "d"]);
    assert_eq!(rosters.last().unwrap(), &["c", "d"]);
}

#[tokio::test]
async fn rejoining_is_idempotent_but_still_broadcasts() {
    let (store, hub, room) = setup().await;
    let mut a = client(&store, &hub, "a").await;

    a.session.join_room(room).await.unwrap();
    a.session.join_room(room).await.unwrap();
    a.session.leave_room(room).await.unwrap();
    a.session.leave_room(room).await.unwrap();

    // a is out of the room group by the time each leave broadcasts
    assert_eq!(a.presence(), vec![vec!["a".to_owned()], vec!["a".to_owned()]]);
    assert!(store.get_room(room).await.unwrap().members.is_empty());
}

#[tokio::test]
async fn message_group_subscriptions_get_their_own_payload() {
    let (store, hub, room) = setup().await;
    let mut a = client(&store, &hub, "a").await;
    a.session.join_room(room).await.unwrap();
    a.session.subscribe(Group::Room(room), "room-req").await.unwrap();

    let message = a.session.create_message("first").await.unwrap();
    a.session
        .subscribe(Group::Message(message.id), "msg-req")
        .await
        .unwrap();
    a.drain();

    let fanout = hub.notify_message(&message, Action::Updated).await;
    assert_eq!(fanout.delivered, 2);

    let payloads = a.activity();
    let ids: Vec<_> = payloads.iter().map(|p| p["requestId"].clone()).collect();
    assert_eq!(ids, ["room-req", "msg-req"]);
    assert!(payloads.iter().all(|p| p["action"] == "update"));
}

#[tokio::test]
async fn joined_but_unsubscribed_gets_presence_only() {
    let (store, hub, room) = setup().await;
    let mut a = client(&store, &hub, "a").await;
    let mut lurker = client(&store, &hub, "l").await;

    lurker.session.join_room(room).await.unwrap();
    a.session.join_room(room).await.unwrap();
    lurker.drain();

    a.session.create_message("anyone?").await.unwrap();
    assert!(lurker.drain().is_empty());
}

#[tokio::test]
async fn unknown_rooms_are_not_found() {
    let (store, hub, _) = setup().await;
    let mut a = client(&store, &hub, "a").await;

    assert!(matches!(a.session.join_room(404).await, Err(HubError::NotFound(_))));
    assert!(matches!(a.session.leave_room(404).await, Err(HubError::NotFound(_))));
    assert!(a.drain().is_empty());
}

#[tokio::test]
async fn concurrent_connections_each_get_one_delivery() {
    let (store, hub, room) = setup().await;
    let mut sender = client(&store, &hub, "sender").await;
    sender.session.join_room(room).await.unwrap();

    let mut tasks = Vec::new();
    for n in 0..16 {
        let mut c = client(&store, &hub, &format!("u{n}")).await;
        tasks.push(tokio::spawn(async move {
            c.session.join_room(room).await.unwrap();
            c.session.subscribe(Group::Room(room), format!("req-{n}")).await.unwrap();
            c
        }));
    }
    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    sender.session.create_message("fan out").await.unwrap();
    for (n, c) in clients.iter_mut().enumerate() {
        let activity = c.activity();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0]["requestId"], format!("req-{n}"));
    }
}

#[tokio::test]
async fn stalled_subscriber_does_not_block_senders() {
    let (store, hub, room) = setup_with_buffer(1).await;
    let mut stalled = client(&store, &hub, "stalled").await;
    let mut a = client(&store, &hub, "a").await;
    let mut b = client(&store, &hub, "b").await;

    stalled.session.subscribe(Group::Room(room), "s").await.unwrap();
    a.session.join_room(room).await.unwrap();
    a.session.subscribe(Group::Room(room), "ra").await.unwrap();
    a.drain();

    // stalled never reads; its single slot already holds a's roster
    let limit = Duration::from_secs(2);
    for text in ["one", "two"] {
        timeout(limit, a.session.create_message(text)).await.unwrap().unwrap();
        assert_eq!(a.activity().len(), 1);
    }
    timeout(limit, b.session.join_room(room)).await.unwrap().unwrap();
    timeout(limit, b.session.disconnect()).await.unwrap().unwrap();

    a.drain();
    let message = store.messages().pop().unwrap();
    let fanout = hub.notify_message(&message, Action::Updated).await;
    assert_eq!(fanout.delivered, 1);
    assert_eq!(fanout.dropped, 1);

    assert_eq!(stalled.presence(), vec![vec!["a".to_owned()]]);
}

#[tokio::test]
async fn switching_rooms_leaves_the_previous_one() {
    let (store, hub, first) = setup().await;
    let second = store.create_room("eight").await.unwrap().id;
    let mut a = client(&store, &hub, "a").await;
    let mut watcher = client(&store, &hub, "w").await;
    watcher.session.subscribe(Group::Room(first), "w").await.unwrap();

    a.session.join_room(first).await.unwrap();
    a.session.join_room(second).await.unwrap();

    assert_eq!(a.session.primary_room(), Some(second));
    assert!(!hub.registry().is_member(&Group::Room(first), a.session.id()));
    assert!(hub.registry().is_member(&Group::Room(second), a.session.id()));
    assert!(store.get_room(first).await.unwrap().members.is_empty());
    assert_eq!(watcher.presence(), vec![vec!["a".to_owned()], vec![]]);

    // rosters of the first room no longer reach a
    a.drain();
    hub.broadcast_presence(first).await.unwrap();
    assert!(a.drain().is_empty());
    watcher.drain();

    a.session.disconnect().await.unwrap();
    assert!(store.get_room(second).await.unwrap().members.is_empty());
    assert!(watcher.presence().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_during_dispatch_never_fails_the_sender() {
    for _ in 0..32 {
        let (store, hub, room) = setup().await;
        let mut sender = client(&store, &hub, "sender").await;
        let mut leaving = client(&store, &hub, "leaving").await;
        sender.session.join_room(room).await.unwrap();
        leaving.session.subscribe(Group::Room(room), "l").await.unwrap();

        let dispatch = tokio::spawn(async move {
            let message = sender.session.create_message("racing").await.unwrap();
            (sender, message)
        });
        let hangup = tokio::spawn(async move {
            leaving.session.disconnect().await.unwrap();
            leaving
        });

        let limit = Duration::from_secs(2);
        let (_sender, message) = timeout(limit, dispatch).await.unwrap().unwrap();
        let mut leaving = timeout(limit, hangup).await.unwrap().unwrap();

        assert!(leaving.activity().len() <= 1);
        assert!(hub.registry().groups_of(leaving.session.id()).is_empty());
        let after = hub.notify_message(&message, Action::Updated).await;
        assert_eq!(after.delivered, 0);
    }
}
