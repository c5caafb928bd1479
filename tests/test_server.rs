//! HTTP surface against a fake worker on an ephemeral port.

mod common;

use std::time::Duration;
use tokio::io::AsyncWriteExt;

use rigd::server::{self, SHUTDOWN_GRACE};

use common::{gzip, TestDaemon, FAIL_MARKER};

async fn get_text(client: &reqwest::Client, url: String) -> String {
    client.get(url).send().await.unwrap().text().await.unwrap()
}

async fn wait_for_flash(client: &reqwest::Client, daemon: &TestDaemon) -> String {
    for _ in 0..100 {
        let state = get_text(client, daemon.url("/dut/flashState")).await;
        if state != "PENDING" {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("background flash never finished");
}

#[tokio::test]
async fn test_session_over_http() {
    let daemon = TestDaemon::start().await;
    let client = reqwest::Client::new();

    assert_eq!(get_text(&client, daemon.url("/state")).await, "IDLE");
    assert_eq!(get_text(&client, daemon.url("/start")).await, "OK");
    assert_eq!(get_text(&client, daemon.url("/start")).await, "BUSY");
    assert_eq!(get_text(&client, daemon.url("/state")).await, "BUSY");
    assert_eq!(get_text(&client, daemon.url("/heartbeat")).await, "OK");

    let resp = client.post(daemon.url("/teardown")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "OK");
    assert_eq!(get_text(&client, daemon.url("/state")).await, "IDLE");
    assert_eq!(daemon.calls.teardowns(), 1);
}

#[tokio::test]
async fn test_contract_reports_tags() {
    let daemon = TestDaemon::start().await;
    let contract: serde_json::Value = reqwest::get(daemon.url("/contract"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(contract["uuid"], "0123abcd");
    assert_eq!(contract["workerType"], "manual");
    assert_eq!(contract["supportedFeatures"]["dut"], true);
    assert_eq!(contract["supportedFeatures"]["modem"], false);
}

#[tokio::test]
async fn test_background_flash_done() {
    let daemon = TestDaemon::start().await;
    let client = reqwest::Client::new();
    let image = b"a perfectly good image".to_vec();

    let resp = client
        .post(daemon.url("/dut/sendImage"))
        .body(gzip(&image))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "OK");

    let resp: serde_json::Value = client
        .post(daemon.url("/dut/flashImage"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["timeoutTries"], 60);

    assert_eq!(wait_for_flash(&client, &daemon).await, "DONE");
    assert_eq!(*daemon.calls.flashed.lock().unwrap(), vec![image]);
    assert!(!daemon.workdir.path().join("os.img.gz").exists());

    // Teardown resets the tracker
    client.post(daemon.url("/teardown")).send().await.unwrap();
    assert_eq!(get_text(&client, daemon.url("/dut/flashState")).await, "IDLE");
}

#[tokio::test]
async fn test_background_flash_error() {
    let daemon = TestDaemon::start().await;
    let client = reqwest::Client::new();

    let mut image = b"corrupt ".to_vec();
    image.extend_from_slice(FAIL_MARKER);
    client
        .post(daemon.url("/dut/sendImage"))
        .body(gzip(&image))
        .send()
        .await
        .unwrap();
    client.post(daemon.url("/dut/flashImage")).send().await.unwrap();

    assert_eq!(wait_for_flash(&client, &daemon).await, "ERROR");
    assert!(daemon.calls.flashed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_streamed_flash_reports_done() {
    let daemon = TestDaemon::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(daemon.url("/dut/flash"))
        .body(gzip(b"streamed image"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let body = resp.text().await.unwrap();
    assert!(body.ends_with("status: done\n"), "body was {:?}", body);
    assert!(!body.contains("error:"));
    assert_eq!(
        *daemon.calls.flashed.lock().unwrap(),
        vec![b"streamed image".to_vec()]
    );
}

#[tokio::test]
async fn test_streamed_flash_reports_error_line() {
    let daemon = TestDaemon::start().await;
    let client = reqwest::Client::new();

    let body = client
        .post(daemon.url("/dut/flash"))
        .body(gzip(FAIL_MARKER))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let lines: Vec<&str> = body.lines().collect();
    assert!(lines.iter().any(|l| l.starts_with("error: ")));
    assert_eq!(lines.last(), Some(&"status: done"));
}

#[tokio::test]
async fn test_power_and_network() {
    let daemon = TestDaemon::start().await;
    let client = reqwest::Client::new();

    let body = client
        .post(daemon.url("/dut/on"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body.lines().last(), Some("OK"));

    let resp = client
        .post(daemon.url("/dut/network"))
        .json(&serde_json::json!({ "wired": { "nat": true } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "OK");

    let diag: serde_json::Value = reqwest::get(daemon.url("/dut/diagnostics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(diag["fake"], true);
    assert_eq!(*daemon.calls.powered.lock().unwrap(), vec![true]);
}

#[tokio::test]
async fn test_ip_requires_target() {
    let daemon = TestDaemon::start().await;

    let resp = reqwest::get(daemon.url("/dut/ip")).await.unwrap();
    assert_eq!(resp.status(), 500);
    assert!(resp.text().await.unwrap().contains("Target missing"));

    // Plain addresses skip mDNS entirely
    let resp = reqwest::get(daemon.url("/dut/ip?target=10.0.0.9")).await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "10.0.0.9");
}

#[tokio::test]
async fn test_serial_log_served() {
    let daemon = TestDaemon::start().await;
    std::fs::write(daemon.workdir.path().join("dut-serial.txt"), "login:\n").unwrap();

    let resp = reqwest::get(daemon.url("/dut/serial")).await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "login:\n");
}

#[tokio::test]
async fn test_corrupt_staged_image_is_an_error() {
    let daemon = TestDaemon::start().await;
    let client = reqwest::Client::new();

    client
        .post(daemon.url("/dut/sendImage"))
        .body(gzip(b"old image"))
        .send()
        .await
        .unwrap();
    client.post(daemon.url("/dut/flashImage")).send().await.unwrap();
    assert_eq!(wait_for_flash(&client, &daemon).await, "DONE");

    // The inflated image from the last flash must not be written again
    let resp = client
        .post(daemon.url("/dut/sendImage"))
        .body(b"not gzip at all".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "OK");
    client.post(daemon.url("/dut/flashImage")).send().await.unwrap();

    assert_eq!(wait_for_flash(&client, &daemon).await, "ERROR");
    assert_eq!(
        *daemon.calls.flashed.lock().unwrap(),
        vec![b"old image".to_vec()]
    );
}

#[tokio::test]
async fn test_shutdown_not_held_up_by_open_upload() {
    let workdir = tempfile::tempdir().unwrap();
    let (state, _calls) = common::app_state(workdir.path());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let served = tokio::spawn(server::serve(listener, state, async move {
        let _ = stop_rx.await;
    }));

    // An upload that announces far more than it ever sends
    let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
    conn.write_all(
        b"POST /dut/flash HTTP/1.1\r\nHost: rig\r\nContent-Length: 100000000\r\n\r\npartial",
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(5), served)
        .await
        .expect("serve kept draining past the shutdown grace");
    result.unwrap().unwrap();
    drop(conn);
}
