mod support;

use std::sync::Arc;
use std::time::Duration;

use asupersync::runtime::RuntimeBuilder;
use docmodel::prelude::*;
use docmodel::{QueryResult, QueryStateErrorKind};
use serde_json::json;

use support::{InMemoryTransport, Server, expect_err, unwrap_outcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: Option<String>,
    name: String,
}

impl Entity for User {}

fn session_for(server: &Arc<std::sync::Mutex<Server>>) -> Session<InMemoryTransport> {
    let transport = InMemoryTransport {
        server: Arc::clone(server),
    };
    Session::new(transport, Arc::new(Conventions::default()))
}

fn answer(stale: bool, names: &[(&str, &str)]) -> QueryResult {
    let results = names
        .iter()
        .map(|(id, name)| {
            Some(
                Document::from_json(json!({
                    "name": name,
                    "@metadata": {"@id": id, "@etag": 1}
                }))
                .unwrap(),
            )
        })
        .collect::<Vec<_>>();
    QueryResult {
        total_results: results.len() as u64,
        results,
        is_stale: stale,
        index_name: "Auto/Users/Byname".into(),
        ..QueryResult::default()
    }
}

#[test]
fn rendering_is_deterministic() {
    let session = session_for(&Server::shared());
    let query = session
        .query::<User>()
        .where_equals("x", "y")
        .unwrap()
        .where_equals("z", "w")
        .unwrap();

    let first = query.to_query_text().unwrap();
    assert_eq!(first, "FROM Users WHERE x = $p0 AND z = $p1");
    assert_eq!(query.to_query_text().unwrap(), first);
    assert_eq!(query.parameters().get("p0"), Some(&json!("y")));
    assert_eq!(query.parameters().get("p1"), Some(&json!("w")));
}

#[test]
fn unclosed_subclause_fails_to_render() {
    let session = session_for(&Server::shared());
    let query = session
        .query::<User>()
        .open_subclause()
        .unwrap()
        .where_equals("name", "A")
        .unwrap();

    match query.to_query_text() {
        Err(Error::InvalidQueryState(err)) => {
            assert_eq!(err.kind, QueryStateErrorKind::UnbalancedSubclause);
        }
        other => panic!("expected an invalid query state, got {other:?}"),
    }
}

#[test]
fn zero_timeout_fails_on_stale_results() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = Server::shared();
    server.lock().unwrap().queries = vec![answer(true, &[])].into();
    let mut session = session_for(&server);

    rt.block_on(async {
        let mut query = session
            .query::<User>()
            .wait_for_non_stale_results(Some(Duration::ZERO));
        let err = expect_err(session.to_list(&cx, &mut query).await);
        assert!(matches!(err, Error::StalenessTimeout(_)));
    });

    assert_eq!(server.lock().unwrap().requests(), 1);
}

#[test]
fn stale_then_fresh_succeeds_on_second_attempt() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = Server::shared();
    server.lock().unwrap().queries =
        vec![answer(true, &[]), answer(false, &[("users/a", "A")])].into();
    let mut session = session_for(&server);

    rt.block_on(async {
        let mut query = session
            .query::<User>()
            .wait_for_non_stale_results(Some(Duration::from_secs(30)));
        let users = unwrap_outcome(session.to_list(&cx, &mut query).await);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].read().unwrap().name, "A");
        assert!(session.is_loaded("users/a"));
    });

    let guard = server.lock().unwrap();
    assert_eq!(guard.requests(), 2);
    assert_eq!(guard.commands[0], guard.commands[1]);
}
