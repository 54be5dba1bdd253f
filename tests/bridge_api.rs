//! Whole bridge against mock LMS endpoints, observed through the HTTP API

mod mock_servers;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lms_sync_bridge::api::{router, AppState};
use lms_sync_bridge::bridge::Bridge;
use lms_sync_bridge::bus::create_bus;
use lms_sync_bridge::config::Config;
use lms_sync_bridge::player::{HeadlessHost, HostAction};

use mock_servers::{MockCliServer, MockLmsServer, MockTrack};

const PLAYER: &str = "00:04:20:12:34:56";
const PLAYER_REF: &str = "00%3A04%3A20%3A12%3A34%3A56";

async fn has_refreshed(bridge: &Bridge) -> bool {
    for _ in 0..150 {
        if bridge.status().await.remote.last_refresh.is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn queue_filled(host: &HeadlessHost, len: usize) -> bool {
    for _ in 0..150 {
        if host.queue().len() == len {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn cli_notification_drives_sync_and_status_reports_it() {
    let lms = MockLmsServer::start().await;
    lms.add_player(PLAYER, "Kitchen").await;
    lms.set_playlist(PLAYER, (0..3).map(MockTrack::file).collect())
        .await;
    let cli = MockCliServer::start(None).await;

    let mut config = Config::default();
    config.lms.host = Some("127.0.0.1".to_string());
    config.lms.port = lms.addr().port();
    config.lms.cli_port = cli.addr().port();
    config.lms.cli_read_timeout_ms = 100;
    // Only the immediate first tick and CLI wake-ups run within the test
    config.sync.tick_ms = 60_000;
    config.sync.seek_settle_ms = 1;

    let bus = create_bus();
    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);
    let host = Arc::new(HeadlessHost::new(tx));

    let bridge = Arc::new(
        Bridge::connect(config, bus, host.clone(), &shutdown)
            .await
            .unwrap(),
    );
    assert_eq!(bridge.player_id(), PLAYER);
    bridge.start(rx).await.unwrap();

    assert!(cli.wait_for_subscriptions(1).await);
    assert_eq!(
        cli.received().await,
        vec!["subscribe playlist,power,client"]
    );
    assert!(has_refreshed(&bridge).await);
    assert!(host.actions().is_empty());

    lms.set_mode(PLAYER, "play").await;
    cli.notify(&format!("{} playlist play", PLAYER_REF));
    assert!(queue_filled(&host, 3).await);
    assert_eq!(
        host.actions(),
        vec![
            HostAction::PlayQueue { len: 1, start: 0 },
            HostAction::Append { len: 2 }
        ]
    );

    let app = router(AppState::new(bridge.clone(), Duration::from_millis(100)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let status: Value = reqwest::get(format!("http://{}/status", api_addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(status["server"]["port"], lms.addr().port());
    assert_eq!(status["remote"]["player_id"], PLAYER);
    assert_eq!(status["remote"]["status"]["mode"], "play");
    assert_eq!(status["remote"]["stale"], false);
    assert_eq!(status["local"]["is_playing"], true);
    assert_eq!(status["local"]["queue_len"], 3);
    assert_eq!(status["media"], "audio");
    assert_eq!(status["auto_powered_off"], false);

    let mut running: Vec<&str> = status["components"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| c["running"] == true)
        .filter_map(|c| c["name"].as_str())
        .collect();
    running.sort_unstable();
    assert_eq!(running, vec!["lms-cli", "mirror", "sync"]);

    tokio::time::timeout(Duration::from_secs(5), bridge.shutdown())
        .await
        .expect("bridge shuts down promptly");
    let status = bridge.status().await;
    assert!(status.components.iter().all(|c| !c.running));
    assert!(!bridge.fatal().is_cancelled());

    server.abort();
}

#[tokio::test]
async fn rejected_credentials_stop_the_bridge() {
    let lms = MockLmsServer::start().await;
    lms.add_player(PLAYER, "Kitchen").await;
    let cli = MockCliServer::start(Some(("admin", "secret"))).await;

    let mut config = Config::default();
    config.lms.host = Some("127.0.0.1".to_string());
    config.lms.port = lms.addr().port();
    config.lms.cli_port = cli.addr().port();
    config.lms.player_id = Some(PLAYER.to_string());
    config.lms.username = Some("admin".to_string());
    config.lms.password = Some("wrong".to_string());

    let (tx, rx) = mpsc::channel(64);
    let bridge = Bridge::connect(
        config,
        create_bus(),
        Arc::new(HeadlessHost::new(tx)),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    bridge.start(rx).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), bridge.fatal().cancelled())
        .await
        .expect("login rejection is fatal");

    tokio::time::timeout(Duration::from_secs(5), bridge.shutdown())
        .await
        .expect("bridge shuts down promptly");
}

#[tokio::test]
async fn waits_for_a_player_to_appear() {
    let lms = Arc::new(MockLmsServer::start().await);

    let mut config = Config::default();
    config.lms.host = Some("127.0.0.1".to_string());
    config.lms.port = lms.addr().port();
    config.discovery.rescan_interval_ms = 50;

    let late = lms.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        late.add_player(PLAYER, "Kitchen").await;
    });

    let (tx, _rx) = mpsc::channel(64);
    let bridge = tokio::time::timeout(
        Duration::from_secs(5),
        Bridge::connect(
            config,
            create_bus(),
            Arc::new(HeadlessHost::new(tx)),
            &CancellationToken::new(),
        ),
    )
    .await
    .expect("player shows up within the wait")
    .unwrap();

    assert_eq!(bridge.player_id(), PLAYER);
}
