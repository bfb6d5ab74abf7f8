use std::time::Duration;

use qlympics_e2e::api::{ApiClient, IdentityApi, LobbyApi};
use qlympics_e2e::error::E2eError;
use qlympics_e2e::identity::IdentityBootstrapper;
use qlympics_e2e::pow::{compute_pow_hash, meets_difficulty};
use qlympics_e2e::snapshot::{HttpSnapshotStore, SnapshotStore};
use qlympics_e2e::types::{Direction, VerifyRequest};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn client(server: &MockServer) -> ApiClient {
    ApiClient::new(server.uri(), Duration::from_secs(5)).expect("client builds")
}

#[tokio::test]
async fn register_solves_challenge_and_returns_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/agents/challenge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "challenge_id": "ch-1",
            "nonce": "abc",
            "difficulty": 1
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agents/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "agent_id": "agent-9",
            "api_key": "key-9"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server);
    let agent = IdentityBootstrapper::new(&api, 10_000)
        .register("0xpayout", "S001")
        .await
        .expect("registration succeeds");
    assert_eq!(agent.agent_id, "agent-9");
    assert_eq!(agent.token, "key-9");

    let requests = server.received_requests().await.expect("recording enabled");
    let verify: &Request = requests
        .iter()
        .find(|request| request.url.path() == "/agents/verify")
        .expect("verify was called");
    let body: serde_json::Value = serde_json::from_slice(&verify.body).expect("json body");
    let solution = body["solution"].as_str().expect("solution string");
    assert!(meets_difficulty(&compute_pow_hash("abc", solution), 1));
    assert_eq!(body["payout_address"], "0xpayout");
    assert_eq!(body["runtime_identity"], "S001");
}

#[tokio::test]
async fn verify_accepts_token_alias() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/agents/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "tok" })))
        .mount(&server)
        .await;

    let verified = client(&server)
        .verify(&VerifyRequest {
            challenge_id: "c".to_string(),
            solution: "0".to_string(),
            payout_address: "0x1".to_string(),
            runtime_identity: "p1".to_string(),
            name: "E2E P1".to_string(),
            version: "v1".to_string(),
        })
        .await
        .expect("verify succeeds");
    assert_eq!(verified.api_key, "tok");
}

#[tokio::test]
async fn join_and_input_send_the_api_key_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/lobbies/join"))
        .and(header("x-api-key", "key-1"))
        .and(body_json(json!({ "game_mode_id": "gm-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lobby_id": "lobby-1",
            "watch_code": "ABC123",
            "status": "WAITING",
            "slot": "0"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/lobbies/lobby-1/input"))
        .and(header("x-api-key", "key-1"))
        .and(body_json(json!({ "direction": "left" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server);
    let joined = api.join_lobby("key-1", "gm-1").await.expect("join succeeds");
    assert_eq!(joined.lobby_id, "lobby-1");
    assert_eq!(joined.watch_code.as_deref(), Some("ABC123"));
    assert_eq!(joined.slot, 0);

    api.send_input("key-1", "lobby-1", Direction::Left)
        .await
        .expect("input accepted");
}

#[tokio::test]
async fn rejected_input_surfaces_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/lobbies/lobby-1/input"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let error = client(&server)
        .send_input("key-1", "lobby-1", Direction::Up)
        .await
        .expect_err("input rejected");
    match error {
        E2eError::Api { status, url, body } => {
            assert_eq!(status, 429);
            assert!(url.ends_with("/lobbies/lobby-1/input"));
            assert_eq!(body, "slow down");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn results_and_payout_responses_accept_loose_numbers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/lobbies/lobby-1/result"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lobby_id": "lobby-1",
            "results": [
                { "agent_id": "a", "final_coins": 2, "final_reward": "2.0" },
                { "agent_id": "b", "final_coins": "1", "final_reward": 1 }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/payouts/execute"))
        .and(body_json(json!({ "lobby_id": "lobby-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sent": "2", "failed": 0 })))
        .mount(&server)
        .await;

    let api = client(&server);
    let result = api.lobby_result("lobby-1").await.expect("result parses");
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.results[1].final_coins, 1);
    assert_eq!(result.results[1].final_reward, "1");

    let executed = api.execute_payout("lobby-1").await.expect("payout parses");
    assert_eq!(executed.sent, 2);
    assert_eq!(executed.failed, 0);
}

#[tokio::test]
async fn player_rows_map_slots_to_agents() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/lobbies/lobby-1/players"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "agent_id": "a", "slot": 0 },
            { "agent_id": "b", "slot": 1 }
        ])))
        .mount(&server)
        .await;

    let rows = client(&server)
        .lobby_players("lobby-1")
        .await
        .expect("rows parse");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].agent_id, "b");
    assert_eq!(rows[1].slot, 1);
}

#[tokio::test]
async fn http_snapshot_store_treats_404_as_unpublished() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/lobbies/missing/state"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/lobbies/lobby-1/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ACTIVE",
            "tick": 12,
            "width": 20,
            "height": 10,
            "players": { "a": { "x": 1, "y": 2, "score": 0 } },
            "coins": [ { "id": 5, "x": 3, "y": 4 } ]
        })))
        .mount(&server)
        .await;

    let store = HttpSnapshotStore::new(client(&server));
    assert!(store.fetch("missing").await.expect("404 is not an error").is_none());

    let snapshot = store
        .fetch("lobby-1")
        .await
        .expect("fetch succeeds")
        .expect("state published");
    assert_eq!(snapshot.tick, 12);
    assert_eq!(snapshot.grid.width, 20);
    assert_eq!(snapshot.players.len(), 1);
    assert_eq!(snapshot.coins[0].id, 5);
}

#[tokio::test]
async fn health_and_leave_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/lobbies/leave"))
        .and(header("x-api-key", "key-1"))
        .and(body_json(json!({ "lobby_id": "lobby-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "left": true })))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server);
    let health = api.health().await.expect("healthy");
    assert_eq!(health["ok"], true);
    api.leave_lobby("key-1", "lobby-1").await.expect("left");
}

#[tokio::test]
async fn unhealthy_api_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let error = client(&server).health().await.expect_err("unhealthy");
    assert!(matches!(error, E2eError::Api { status: 503, .. }));
}
