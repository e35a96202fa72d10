use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use hanapp_messaging::{
    api::ApiServer,
    entity::{Session, UserProfile},
    store::Store,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct TestUser {
    id: Uuid,
    token: String,
}

struct TestApp {
    router: Router,
    store: Store,
}

impl TestApp {
    async fn new() -> Result<Self> {
        let store = Store::in_memory().await?;
        store.init().await?;
        let router = ApiServer::new(store.clone(), 4000).router();
        Ok(Self { router, store })
    }

    async fn user(&self, name: &str) -> Result<TestUser> {
        let id = Uuid::new_v4();
        let token = format!("tok-{}", Uuid::new_v4().simple());
        self.store
            .save_user(&UserProfile::new(id, name).with_avatar(format!("https://cdn.hanapp.ph/{}.png", name)))
            .await?;
        self.store.save_session(&Session::new(token.clone(), id)).await?;
        Ok(TestUser { id, token })
    }

    async fn call(&self, request: Request<Body>) -> Result<(StatusCode, Value)> {
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, body))
    }

    async fn send(&self, from: &TestUser, to: Uuid, content: &str) -> Result<(StatusCode, Value)> {
        self.call(post_message(from, json!({ "receiver_id": to, "content": content })))
            .await
    }

    async fn get(&self, caller: &TestUser, uri: &str) -> Result<(StatusCode, Value)> {
        self.call(authed(caller, "GET", uri).body(Body::empty())?).await
    }
}

fn authed(caller: &TestUser, method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", caller.token))
        .header("x-user-id", caller.id.to_string())
}

fn post_message(from: &TestUser, body: Value) -> Request<Body> {
    authed(from, "POST", "/messages")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn contents(page: &Value) -> Vec<String> {
    page["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn hello_round_trip_between_client_and_provider() -> Result<()> {
    let app = TestApp::new().await?;
    let u1 = app.user("maria").await?;
    let u2 = app.user("jose").await?;

    let (status, created) = app.send(&u1, u2.id, "Hello").await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["sender_id"], json!(u1.id));
    assert_eq!(created["receiver_id"], json!(u2.id));
    assert_eq!(created["content"], "Hello");
    assert!(created["id"].as_str().is_some());
    assert!(created["created_at"].as_str().is_some());

    let (status, threads) = app.get(&u1, "/messages/threads").await?;
    assert_eq!(status, StatusCode::OK);
    let threads = threads.as_array().unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0]["other_user_id"], json!(u2.id));
    assert_eq!(threads[0]["other_user_name"], "jose");
    assert_eq!(threads[0]["other_user_avatar"], "https://cdn.hanapp.ph/jose.png");
    assert_eq!(threads[0]["last_message"], "Hello");
    assert_eq!(threads[0]["last_message_at"], created["created_at"]);

    let (status, page) = app.get(&u1, &format!("/messages/threads/{}", u2.id)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["messages"], json!([created]));
    Ok(())
}

#[tokio::test]
async fn threads_are_ordered_by_most_recent_activity() -> Result<()> {
    let app = TestApp::new().await?;
    let me = app.user("client").await?;
    let plumber = app.user("plumber").await?;
    let tutor = app.user("tutor").await?;

    app.send(&me, plumber.id, "Can you fix a leak?").await?;
    app.send(&me, tutor.id, "Math lessons?").await?;

    let (_, threads) = app.get(&me, "/messages/threads").await?;
    let order: Vec<_> = threads.as_array().unwrap().iter().map(|t| t["other_user_id"].clone()).collect();
    assert_eq!(order, vec![json!(tutor.id), json!(plumber.id)]);

    app.send(&plumber, me.id, "On my way").await?;

    let (_, threads) = app.get(&me, "/messages/threads").await?;
    let threads = threads.as_array().unwrap();
    assert_eq!(threads[0]["other_user_id"], json!(plumber.id));
    assert_eq!(threads[0]["last_message"], "On my way");
    assert_eq!(threads[1]["other_user_id"], json!(tutor.id));

    // The provider sees a single thread with the client.
    let (_, theirs) = app.get(&plumber, "/messages/threads").await?;
    assert_eq!(theirs.as_array().unwrap().len(), 1);
    assert_eq!(theirs[0]["other_user_id"], json!(me.id));
    Ok(())
}

#[tokio::test]
async fn conversation_is_complete_and_symmetric() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;
    let b = app.user("b").await?;
    let c = app.user("c").await?;

    app.send(&a, b.id, "a->b 1").await?;
    app.send(&b, a.id, "b->a 1").await?;
    app.send(&a, c.id, "a->c").await?;
    app.send(&c, b.id, "c->b").await?;
    app.send(&a, b.id, "a->b 2").await?;

    let (_, from_a) = app.get(&a, &format!("/messages/threads/{}", b.id)).await?;
    let (_, from_b) = app.get(&b, &format!("/messages/threads/{}", a.id)).await?;

    assert_eq!(contents(&from_a), ["a->b 1", "b->a 1", "a->b 2"]);
    assert_eq!(from_a, from_b);
    assert_eq!(from_a["total"], 3);
    Ok(())
}

#[tokio::test]
async fn limit_keeps_newest_messages_in_chronological_order() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;
    let b = app.user("b").await?;

    for i in 0..6 {
        let (from, to) = if i % 2 == 0 { (&a, b.id) } else { (&b, a.id) };
        app.send(from, to, &format!("m{}", i)).await?;
    }

    let (status, page) = app.get(&a, &format!("/messages/threads/{}?limit=3", b.id)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(contents(&page), ["m3", "m4", "m5"]);
    assert_eq!(page["total"], 6);

    let (_, page) = app.get(&a, &format!("/messages/threads/{}?limit=50", b.id)).await?;
    assert_eq!(contents(&page).len(), 6);
    Ok(())
}

#[tokio::test]
async fn bad_limit_values_are_rejected() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;
    let b = app.user("b").await?;

    for limit in ["0", "-3", "abc", "1.5"] {
        let (status, body) = app
            .get(&a, &format!("/messages/threads/{}?limit={}", b.id, limit))
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST, "limit={limit}");
        assert_eq!(body["kind"], "validation_error");
    }
    Ok(())
}

#[tokio::test]
async fn reads_are_repeatable_without_writes() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;
    let b = app.user("b").await?;
    app.send(&a, b.id, "first").await?;
    app.send(&b, a.id, "second").await?;

    let uri = format!("/messages/threads/{}", b.id);
    assert_eq!(app.get(&a, "/messages/threads").await?, app.get(&a, "/messages/threads").await?);
    assert_eq!(app.get(&a, &uri).await?, app.get(&a, &uri).await?);
    Ok(())
}

#[tokio::test]
async fn invalid_messages_are_rejected_and_not_stored() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;
    let b = app.user("b").await?;

    let cases = [
        json!({ "receiver_id": b.id, "content": "" }),
        json!({ "receiver_id": b.id, "content": "   " }),
        json!({ "receiver_id": b.id }),
        json!({ "receiver_id": "U2", "content": "hi" }),
        json!({ "content": "hi" }),
        json!({ "receiver_id": a.id, "content": "note to self" }),
    ];

    for body in cases {
        let (status, err) = app.call(post_message(&a, body.clone())).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(err["kind"], "validation_error");
    }

    let (_, threads) = app.get(&a, "/messages/threads").await?;
    assert_eq!(threads, json!([]));
    let (_, page) = app.get(&a, &format!("/messages/threads/{}", b.id)).await?;
    assert_eq!(page, json!({ "messages": [], "total": 0 }));
    Ok(())
}

#[tokio::test]
async fn validation_errors_name_the_offending_field() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;

    let (_, err) = app
        .call(post_message(&a, json!({ "receiver_id": "nope", "content": "hi" })))
        .await?;
    assert!(err["message"].as_str().unwrap().contains("receiver_id"));

    let (_, err) = app
        .call(post_message(&a, json!({ "receiver_id": Uuid::new_v4(), "content": "" })))
        .await?;
    assert!(err["message"].as_str().unwrap().contains("content"));
    Ok(())
}

#[tokio::test]
async fn malformed_json_body_is_a_validation_error() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;

    let request = authed(&a, "POST", "/messages")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))?;
    let (status, err) = app.call(request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["kind"], "validation_error");
    Ok(())
}

#[tokio::test]
async fn unknown_receiver_is_not_found() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;

    let (status, err) = app.send(&a, Uuid::new_v4(), "anyone there?").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["kind"], "not_found");
    Ok(())
}

#[tokio::test]
async fn malformed_other_user_id_is_rejected() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;

    let (status, err) = app.get(&a, "/messages/threads/not-a-uuid").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["message"].as_str().unwrap().contains("otherUserId"));
    Ok(())
}

#[tokio::test]
async fn requests_without_valid_token_are_unauthenticated() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;
    let b = app.user("b").await?;

    let expired = TestUser {
        id: a.id,
        token: "tok-expired".to_string(),
    };
    app.store
        .save_session(&Session::new("tok-expired", a.id).expiring_at(Utc::now() - Duration::hours(1)))
        .await?;
    let unknown = TestUser {
        id: a.id,
        token: "tok-does-not-exist".to_string(),
    };

    for caller in [&expired, &unknown] {
        let (status, err) = app.send(caller, b.id, "sneaky").await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(err["kind"], "authentication_error");

        let (status, _) = app.get(caller, "/messages/threads").await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    let anonymous = Request::builder()
        .method("GET")
        .uri("/messages/threads")
        .body(Body::empty())?;
    let (status, err) = app.call(anonymous).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(err["message"].as_str().unwrap().contains("Authorization"));

    // Nothing from the rejected sends was stored.
    let (_, page) = app.get(&b, &format!("/messages/threads/{}", a.id)).await?;
    assert_eq!(page["total"], 0);
    Ok(())
}

#[tokio::test]
async fn bearer_scheme_is_case_insensitive() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;

    for scheme in ["bearer", "BEARER", "Bearer"] {
        let request = Request::builder()
            .uri("/messages/threads")
            .header("authorization", format!("{} {}", scheme, a.token))
            .body(Body::empty())?;
        let (status, _) = app.call(request).await?;
        assert_eq!(status, StatusCode::OK, "scheme {scheme}");
    }
    Ok(())
}

#[tokio::test]
async fn revoked_session_is_unauthenticated() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;

    let mut session = Session::new(a.token.clone(), a.id);
    session.revoked = true;
    app.store.save_session(&session).await?;

    let (status, _) = app.get(&a, "/messages/threads").await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn spoofed_user_id_header_is_forbidden() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;
    let b = app.user("b").await?;

    // a's token, claiming to be b
    let spoof = TestUser {
        id: b.id,
        token: a.token.clone(),
    };
    let (status, err) = app.get(&spoof, "/messages/threads").await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["kind"], "authorization_error");

    let (status, _) = app.send(&spoof, a.id, "impersonation").await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::builder()
        .uri("/messages/threads")
        .header("authorization", format!("Bearer {}", a.token))
        .header("x-user-id", "U1")
        .body(Body::empty())?;
    let (status, _) = app.call(request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn identity_comes_from_token_when_header_is_absent() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;
    let b = app.user("b").await?;

    let request = Request::builder()
        .method("POST")
        .uri("/messages")
        .header("authorization", format!("Bearer {}", a.token))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "receiver_id": b.id, "content": "hi" }).to_string()))?;
    let (status, created) = app.call(request).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["sender_id"], json!(a.id));
    Ok(())
}

#[tokio::test]
async fn idempotency_key_prevents_duplicate_messages() -> Result<()> {
    let app = TestApp::new().await?;
    let a = app.user("a").await?;
    let b = app.user("b").await?;

    let request = || {
        authed(&a, "POST", "/messages")
            .header("content-type", "application/json")
            .header("idempotency-key", "booking-42")
            .body(Body::from(json!({ "receiver_id": b.id, "content": "Booking confirmed" }).to_string()))
            .unwrap()
    };

    let (status, first) = app.call(request()).await?;
    assert_eq!(status, StatusCode::CREATED);
    let (status, retry) = app.call(request()).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first, retry);

    let (_, page) = app.get(&a, &format!("/messages/threads/{}", b.id)).await?;
    assert_eq!(page["total"], 1);

    // Same key, different receiver and content: refused, and nothing reaches c.
    let c = app.user("c").await?;
    let reused = authed(&a, "POST", "/messages")
        .header("content-type", "application/json")
        .header("idempotency-key", "booking-42")
        .body(Body::from(json!({ "receiver_id": c.id, "content": "Different booking" }).to_string()))?;
    let (status, err) = app.call(reused).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["kind"], "conflict");
    let (_, page) = app.get(&c, &format!("/messages/threads/{}", a.id)).await?;
    assert_eq!(page["total"], 0);

    let bad_key = authed(&a, "POST", "/messages")
        .header("content-type", "application/json")
        .header("idempotency-key", "has spaces")
        .body(Body::from(json!({ "receiver_id": b.id, "content": "x" }).to_string()))?;
    let (status, _) = app.call(bad_key).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn health_reports_ok() -> Result<()> {
    let app = TestApp::new().await?;
    let (status, body) = app
        .call(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    Ok(())
}
