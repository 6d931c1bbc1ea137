//! HTTP API tests against a server spawned on an ephemeral port.

use serde_json::{json, Value};
use signal_link::config::Config;
use signal_link::db;
use signal_link::import::{import_issues, import_signals};
use signal_link::migrate;
use signal_link::models::NewAssociation;
use signal_link::server;
use signal_link::store::SqliteStore;
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> Config {
    let config_content = format!(
        r#"
[db]
path = "{}"

[association]
min_score = 0.0

[server]
bind = "127.0.0.1:0"
"#,
        tmp.path().join("siglink.sqlite").display()
    );
    toml::from_str(&config_content).unwrap()
}

async fn seed(cfg: &Config) {
    let pool = db::connect(cfg).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let signals: Vec<Value> = (1..=3)
        .map(|id| {
            json!({
                "id": id,
                "summary": format!("signal {}", id),
                "context": "context",
                "sentiment": 0,
                "severity": id,
                "bias": 0,
                "date": format!("2024-05-0{}", id),
                "boundary": "external",
                "method": "survey"
            })
        })
        .collect();
    import_signals(&pool, &signals).await.unwrap();
    import_issues(
        &pool,
        &[json!({
            "id": "uuid-1",
            "identifier": "ENG-1",
            "title": "Login button unresponsive",
            "createdAt": "2024-04-01",
            "updatedAt": "2024-04-01"
        })],
    )
    .await
    .unwrap();

    let store = SqliteStore::new(pool);
    store
        .insert_associations(&[
            NewAssociation::new(1, "ENG-1", 0.62, "exhaustive-test-model"),
            NewAssociation::new(2, "ENG-1", 0.91, "exhaustive-test-model"),
            NewAssociation::new(3, "ENG-1", 0.75, "exhaustive-test-model"),
        ])
        .await
        .unwrap();
    store.close().await;
}

async fn spawn(cfg: Config) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server::serve(listener, &cfg).await.ok();
    });
    let base = format!("http://{}", addr);
    wait_for_server(&base).await;
    base
}

async fn wait_for_server(base: &str) {
    let client = reqwest::Client::new();
    let url = format!("{}/health", base);
    for _ in 0..50 {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("Server did not become ready within 5 seconds");
}

async fn get(base: &str, path: &str) -> (u16, Value) {
    let resp = reqwest::get(format!("{}{}", base, path)).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn test_health_and_status() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    seed(&cfg).await;
    let base = spawn(cfg).await;

    let (status, body) = get(&base, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (status, body) = get(&base, "/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["signal_total"], 3);
    assert_eq!(body["signal_embedded"], 0);
    assert_eq!(body["issue_total"], 1);
    assert_eq!(body["associations_count"], 3);
}

#[tokio::test]
async fn test_issue_signals_ordered_and_filtered() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    seed(&cfg).await;
    let base = spawn(cfg).await;

    let (status, body) = get(&base, "/issues/ENG-1/signals").await;
    assert_eq!(status, 200);
    let ids: Vec<i64> = body["signals"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["signal_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![2, 3, 1]);

    let (_, body) = get(&base, "/issues/ENG-1/signals?min_score=0.7").await;
    assert_eq!(body["min_score"], 0.7);
    assert_eq!(body["signals"].as_array().unwrap().len(), 2);

    let (status, body) = get(&base, "/issues/ENG-1/signals?min_score=high").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_lookups_and_not_found() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    seed(&cfg).await;
    let base = spawn(cfg).await;

    let (status, body) = get(&base, "/issues").await;
    assert_eq!(status, 200);
    assert_eq!(body["issues"][0]["identifier"], "ENG-1");
    assert_eq!(body["issues"][0]["association_count"], 3);

    let (_, body) = get(&base, "/signals?limit=2").await;
    assert_eq!(body["signals"].as_array().unwrap().len(), 2);

    let (status, body) = get(&base, "/signals/2").await;
    assert_eq!(status, 200);
    assert_eq!(body["summary"], "signal 2");

    let (_, body) = get(&base, "/signals/2/issues").await;
    assert_eq!(body["issues"][0]["issue_id"], "ENG-1");

    let (status, body) = get(&base, "/signals/2/issues/ENG-1").await;
    assert_eq!(status, 200);
    assert_eq!(body["reason"], "Semantic similarity: 0.91");

    let (status, body) = get(&base, "/issues/ENG-1/signals/1").await;
    assert_eq!(status, 200);
    assert_eq!(body["score"], 0.62);

    let (status, body) = get(&base, "/issues/ENG-9").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = get(&base, "/signals/99/issues").await;
    assert_eq!(status, 404);

    let (status, body) = get(&base, "/signals/abc").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}
