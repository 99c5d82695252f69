//! Mock Tautulli server

use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::API_KEY;

/// Wrap `data` in a successful API envelope
pub fn success(data: Value) -> Value {
    json!({"response": {"result": "success", "message": null, "data": data}})
}

/// Wrap `message` in a failed API envelope
pub fn failure(message: &str) -> Value {
    json!({"response": {"result": "error", "message": message, "data": {}}})
}

/// `count` play records starting at `first_id`
pub fn plays(first_id: u64, count: u64) -> Vec<Value> {
    (first_id..first_id + count)
        .map(|id| {
            json!({
                "id": id,
                "date": 1_760_745_600 + id * 60,
                "user": if id % 2 == 0 { "alice" } else { "bob" },
                "platform": "Chrome",
                "media_type": "movie"
            })
        })
        .collect()
}

/// One page of play history
pub fn history_page(records: Vec<Value>, total: u64) -> Value {
    success(json!({
        "data": records,
        "recordsFiltered": total,
        "recordsTotal": total
    }))
}

/// Mock matching `cmd`, authenticated with the test key
pub fn command(cmd: &str) -> wiremock::MockBuilder {
    Mock::given(method("GET"))
        .and(path("/api/v2"))
        .and(query_param("apikey", API_KEY))
        .and(query_param("cmd", cmd))
}

/// Mount the responses of a small, healthy server
///
/// History holds `records` plays in a single page; every mock expects to be hit
/// exactly `cycles` times.
pub async fn mount_healthy_server(server: &MockServer, records: u64, cycles: u64) {
    command("get_history")
        .respond_with(ResponseTemplate::new(200).set_body_json(history_page(plays(0, records), records)))
        .expect(cycles)
        .mount(server)
        .await;
    command("get_plays_per_month")
        .and(query_param("time_range", "12"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success(json!({
            "categories": ["2026-09", "2026-10"],
            "series": [{"name": "Movies", "data": [4, 9]}]
        }))))
        .expect(cycles)
        .mount(server)
        .await;
}

/// Mount a user listing containing alice (id 11) and bob (id 12)
pub async fn mount_users(server: &MockServer) {
    command("get_users")
        .respond_with(ResponseTemplate::new(200).set_body_json(success(json!([
            {"user_id": 11, "email": "Alice@Example.com", "username": "alice"},
            {"user_id": 12, "email": "bob@example.com", "username": "bob"}
        ]))))
        .mount(server)
        .await;
}
