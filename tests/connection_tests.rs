//! Connection lifecycle and submission tests against a scripted server.

mod support;

use std::time::Duration;

use reql::{r, ConnectOptions, Connection, Datum, ReqlDriverError, ReqlError, RunResult};
use serde_json::json;

fn options(addr: std::net::SocketAddr) -> ConnectOptions {
  ConnectOptions::new()
    .host(addr.ip().to_string())
    .port(addr.port())
    .timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_add_query_round_trips() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;

    let (token, query) = support::read_frame(&mut stream).await;
    assert_eq!(token, 0);
    assert_eq!(query, json!([1, [24, [1, 2]], {}]));
    support::write_response(&mut stream, token, json!({"t": 1, "r": [3]})).await;

    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  let result = (r::expr(1) + 2).run(&conn).await.unwrap();
  let Some(RunResult::Atom(value)) = result else {
    panic!("expected an atom");
  };
  assert_eq!(value.as_i64(), Some(3));

  conn.close(false).await.unwrap();
  server.await.unwrap();
}

#[tokio::test]
async fn test_get_on_a_missing_row_returns_null() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;

    let (token, query) = support::read_frame(&mut stream).await;
    assert_eq!(query, json!([1, [16, [[15, ["m"]], 1]], {}]));
    support::write_response(&mut stream, token, json!({"t": 1, "r": [null]})).await;

    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  let result = r::table("m").get(1).run(&conn).await.unwrap();
  let Some(RunResult::Atom(value)) = result else {
    panic!("expected an atom");
  };
  assert!(value.is_null());

  conn.close(false).await.unwrap();
  server.await.unwrap();
}

#[tokio::test]
async fn test_tokens_increase_query_by_query() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;

    for expected in 0..3u64 {
      let (token, _) = support::read_frame(&mut stream).await;
      assert_eq!(token, expected);
      support::write_response(&mut stream, token, json!({"t": 1, "r": [expected]})).await;
    }
    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  for i in 0..3i64 {
    let result = r::expr(i).run(&conn).await.unwrap();
    let Some(RunResult::Atom(value)) = result else {
      panic!("expected an atom");
    };
    assert_eq!(value.as_i64(), Some(i));
  }

  conn.close(false).await.unwrap();
  server.await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_is_an_auth_error() {
  let (addr, server) = support::server(|mut stream| async move {
    support::reject_handshake(&mut stream).await;
  })
  .await;

  let err = Connection::connect(options(addr).password("nope"))
    .await
    .unwrap_err();
  let ReqlError::Driver(ReqlDriverError::Auth(message)) = err else {
    panic!("expected an auth error, got {err:?}");
  };
  assert!(message.contains("Wrong password"), "{message}");

  server.await.unwrap();
}

#[tokio::test]
async fn test_runs_after_close_are_rejected() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;
    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  conn.close(false).await.unwrap();

  let err = r::expr(1).run(&conn).await.unwrap_err();
  assert_eq!(err.to_string(), "Connection is closed.");
  assert!(!conn.is_open());

  server.await.unwrap();
}

#[tokio::test]
async fn test_noreply_runs_return_immediately() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;

    let (_, query) = support::read_frame(&mut stream).await;
    assert_eq!(query[2]["noreply"], json!(true));
    // No response is sent for a noreply run.
    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  let result = r::table("m")
    .insert(r::expr(json!({"id": 1})))
    .run_with_opts(&conn, reql::RunOptions::new().noreply(true))
    .await
    .unwrap();
  assert!(result.is_none());

  conn.close(false).await.unwrap();
  server.await.unwrap();
}

#[tokio::test]
async fn test_noreply_wait_round_trip() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;

    let (token, query) = support::read_frame(&mut stream).await;
    assert_eq!(query, json!([4]));
    support::write_response(&mut stream, token, json!({"t": 4, "r": []})).await;

    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  conn.noreply_wait().await.unwrap();

  conn.close(false).await.unwrap();
  server.await.unwrap();
}

#[tokio::test]
async fn test_close_drains_noreply_writes() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;

    // The noreply insert arrives first, then the close barrier.
    let (_, query) = support::read_frame(&mut stream).await;
    assert_eq!(query[2]["noreply"], json!(true));
    let (token, query) = support::read_frame(&mut stream).await;
    assert_eq!(query, json!([4]));
    support::write_response(&mut stream, token, json!({"t": 4, "r": []})).await;

    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  let result = r::table("m")
    .insert(r::expr(json!({"id": 1})))
    .run_with_opts(&conn, reql::RunOptions::new().noreply(true))
    .await
    .unwrap();
  assert!(result.is_none());

  conn.close(true).await.unwrap();
  server.await.unwrap();
}

#[tokio::test]
async fn test_server_info_parses_identity() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;

    let (token, query) = support::read_frame(&mut stream).await;
    assert_eq!(query, json!([5]));
    support::write_response(
      &mut stream,
      token,
      json!({"t": 5, "r": [{"id": "a2b3", "name": "thorium", "proxy": false}]}),
    )
    .await;

    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  let info = conn.server().await.unwrap();
  assert_eq!(info.id, "a2b3");
  assert_eq!(info.name, "thorium");
  assert!(!info.proxy);

  conn.close(false).await.unwrap();
  server.await.unwrap();
}

#[tokio::test]
async fn test_pending_run_fails_on_eof() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;
    // Read the query, then drop the socket without answering.
    let _ = support::read_frame(&mut stream).await;
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  let err = r::expr(1).run(&conn).await.unwrap_err();
  assert_eq!(err.to_string(), "Connection is closed.");

  server.await.unwrap();
}

#[tokio::test]
async fn test_connect_times_out_on_a_silent_server() {
  let (addr, _server) = support::server(|mut stream| async move {
    // Swallow the client's first message and never answer.
    let _ = support::read_nul(&mut stream).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
  })
  .await;

  let err = Connection::connect(options(addr).timeout(Duration::from_millis(200)))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    ReqlError::Driver(ReqlDriverError::Timeout(_))
  ));
}

#[tokio::test]
async fn test_default_db_global_opt() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;

    let (token, query) = support::read_frame(&mut stream).await;
    assert_eq!(query[2]["db"], json!([14, ["app"]]));
    support::write_response(&mut stream, token, json!({"t": 1, "r": [1]})).await;

    // use_db swaps the default for later runs.
    let (token, query) = support::read_frame(&mut stream).await;
    assert_eq!(query[2]["db"], json!([14, ["other"]]));
    support::write_response(&mut stream, token, json!({"t": 1, "r": [1]})).await;

    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr).db("app")).await.unwrap();
  r::table("t").count().run(&conn).await.unwrap();
  conn.use_db("other");
  r::table("t").count().run(&conn).await.unwrap();

  conn.close(false).await.unwrap();
  server.await.unwrap();
}

#[tokio::test]
async fn test_profile_data_is_attached_to_atoms() {
  let (addr, server) = support::server(|mut stream| async move {
    support::serve_handshake(&mut stream, "").await;

    let (token, query) = support::read_frame(&mut stream).await;
    assert_eq!(query[2]["profile"], json!(true));
    support::write_response(
      &mut stream,
      token,
      json!({"t": 1, "r": [3], "p": [{"description": "evaluating add"}]}),
    )
    .await;

    assert!(support::try_read_frame(&mut stream).await.is_none());
  })
  .await;

  let conn = Connection::connect(options(addr)).await.unwrap();
  let result = (r::expr(1) + 2)
    .run_with_opts(&conn, reql::RunOptions::new().profile(true))
    .await
    .unwrap();
  let Some(RunResult::Atom(value)) = result else {
    panic!("expected an atom");
  };
  assert_eq!(value.get("value").and_then(Datum::as_i64), Some(3));
  assert!(value.get("profile").is_some());

  conn.close(false).await.unwrap();
  server.await.unwrap();
}
