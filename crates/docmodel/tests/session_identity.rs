mod support;

use std::sync::Arc;

use asupersync::runtime::RuntimeBuilder;
use docmodel::prelude::*;
use serde_json::json;

use support::{InMemoryTransport, Server, unwrap_outcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: Option<String>,
    name: String,
}

impl Entity for User {}

fn seeded_session() -> (Arc<std::sync::Mutex<Server>>, Session<InMemoryTransport>) {
    let server = Server::shared();
    {
        let mut guard = server.lock().unwrap();
        guard.put("users/a", json!({"name": "A"}));
        guard.put("users/c", json!({"name": "C"}));
        guard.put("users/legacy", json!({"name": "Old", "nickname": "kept"}));
    }
    let transport = InMemoryTransport {
        server: Arc::clone(&server),
    };
    (server, Session::new(transport, Arc::new(Conventions::default())))
}

#[test]
fn repeated_load_returns_one_instance_for_one_request() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (server, mut session) = seeded_session();

    rt.block_on(async {
        let first = unwrap_outcome(session.load::<User>(&cx, "users/a").await).unwrap();
        let second = unwrap_outcome(session.load::<User>(&cx, "USERS/A").await).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.read().unwrap().id.as_deref(), Some("users/a"));
    });

    assert_eq!(server.lock().unwrap().requests(), 1);
    assert_eq!(session.number_of_requests(), 1);
}

#[test]
fn load_many_keeps_request_order_and_shares_duplicates() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (server, mut session) = seeded_session();

    rt.block_on(async {
        let ids = ["users/a", "users/b", "users/a", "users/c"];
        let loaded = unwrap_outcome(session.load_many::<User, _>(&cx, &ids).await);
        assert_eq!(loaded.len(), 4);

        let a = loaded[0].as_ref().unwrap();
        assert!(loaded[1].is_none());
        assert!(Arc::ptr_eq(a, loaded[2].as_ref().unwrap()));
        assert_eq!(a.read().unwrap().name, "A");
        assert_eq!(loaded[3].as_ref().unwrap().read().unwrap().name, "C");

        // Missing keys are remembered.
        let again = unwrap_outcome(session.load::<User>(&cx, "users/b").await);
        assert!(again.is_none());
    });

    assert_eq!(server.lock().unwrap().requests(), 1);
}

#[test]
fn unmapped_fields_survive_a_save() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (server, mut session) = seeded_session();

    rt.block_on(async {
        let user = unwrap_outcome(session.load::<User>(&cx, "users/legacy").await).unwrap();
        user.write().unwrap().name = "New".to_string();
        assert!(session.has_changes().unwrap());

        let saved = unwrap_outcome(session.save_changes(&cx).await);
        assert_eq!(saved, 1);
        assert!(!session.has_changes().unwrap());
    });

    let guard = server.lock().unwrap();
    let stored = guard.get("users/legacy").unwrap();
    assert_eq!(stored.get("name"), Some(&json!("New")));
    assert_eq!(stored.get("nickname"), Some(&json!("kept")));
}

#[test]
fn stored_entity_gets_key_and_etag_after_save() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (server, mut session) = seeded_session();

    let user = session
        .store(User {
            id: None,
            name: "Fresh".to_string(),
        })
        .unwrap();
    let key = session.key_for(&user).unwrap();
    assert_eq!(user.read().unwrap().id.as_deref(), Some(key.as_str()));
    assert!(session.etag_for(&user).unwrap().is_none());

    rt.block_on(async {
        unwrap_outcome(session.save_changes(&cx).await);
    });

    assert!(session.etag_for(&user).unwrap().is_some());
    assert!(server.lock().unwrap().get(&key).is_some());
}
