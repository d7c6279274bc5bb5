//! Tests for the daemon loop
//!
//! A recording manager runs behind a real hub router on a Unix socket in a
//! temp directory, with a plain agent router as the peer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pony_rpc::{Backoff, ConnectOptions, Router, RouterEvent};
use serde::Deserialize;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{Daemon, Dispatch, Error, EventDispatcher, Identity, Manager, State};

const WAIT: Duration = Duration::from_secs(5);

fn id(s: &str) -> Identity {
    Identity::new(s).unwrap()
}

#[derive(Debug, Clone, Default)]
struct Journal {
    events: Arc<Mutex<Vec<String>>>,
    cleanups: Arc<AtomicUsize>,
    ticks: Arc<AtomicUsize>,
}

impl Journal {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    async fn wait_for(&self, event: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.events().iter().any(|e| e == event) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {event:?}, saw {:?}",
                self.events()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[derive(Deserialize)]
struct Note {
    text: String,
}

struct Recording {
    journal: Journal,
    fail_start: bool,
    tick: Option<Duration>,
}

impl Recording {
    fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            fail_start: false,
            tick: None,
        }
    }
}

impl Manager for Recording {
    fn register(dispatcher: &mut EventDispatcher<Self>) {
        dispatcher.on("note", |manager: &mut Self, sender, note: Note| {
            manager.journal.push(format!("{sender}:{}", note.text));
            Ok(())
        });
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("database unreachable");
        }
        self.journal.push("start");
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.journal.push("stop");
        Ok(())
    }

    fn cleanup(&mut self) {
        self.journal.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn on_peer_connected(&mut self, peer: &Identity) {
        self.journal.push(format!("connected:{peer}"));
    }

    fn on_peer_disconnected(&mut self, peer: &Identity) {
        self.journal.push(format!("disconnected:{peer}"));
    }

    fn on_tick(&mut self) {
        self.journal.ticks.fetch_add(1, Ordering::SeqCst);
    }

    fn tick_interval(&self) -> Option<Duration> {
        self.tick
    }
}

fn socket_address(dir: &TempDir) -> String {
    format!("ipc://{}", dir.path().join("hub.sock").display())
}

async fn hub(dir: &TempDir) -> Router {
    Router::bind(&socket_address(dir), id("sparkle"))
        .await
        .unwrap()
}

async fn connected_agent(dir: &TempDir, identity: &str) -> Router {
    let mut agent = Router::connect(ConnectOptions {
        address: socket_address(dir),
        identity: Some(id(identity)),
        default_recipient: id("sparkle"),
        backoff: Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            factor: 2,
        },
    })
    .unwrap();

    let event = tokio::time::timeout(WAIT, agent.recv())
        .await
        .expect("agent never connected");
    assert_eq!(event, Some(RouterEvent::PeerConnected(id("sparkle"))));
    agent
}

#[tokio::test]
async fn test_run_dispatches_in_order_and_shuts_down() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::default();
    let daemon = Daemon::new("sparkle", hub(&dir).await, Recording::new(&journal));

    let token = CancellationToken::new();
    let task = tokio::spawn(daemon.run(token.clone()));

    let agent = connected_agent(&dir, "twilight").await;
    let handle = agent.handle();
    handle.send("note", json!({"text": "hi"}), None).unwrap();
    handle.send("reboot", json!({}), None).unwrap();
    handle.send("note", json!({"text": 5}), None).unwrap();
    handle.send("note", json!({"text": "still here"}), None).unwrap();

    journal.wait_for("twilight:still here").await;

    token.cancel();
    tokio::time::timeout(WAIT, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(
        journal.events(),
        vec![
            "start",
            "connected:twilight",
            "twilight:hi",
            "twilight:still here",
            "stop",
        ]
    );
    assert_eq!(journal.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_peer_disconnect_reaches_manager() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::default();
    let daemon = Daemon::new("sparkle", hub(&dir).await, Recording::new(&journal));

    let token = CancellationToken::new();
    let task = tokio::spawn(daemon.run(token.clone()));

    let mut agent = connected_agent(&dir, "luna").await;
    journal.wait_for("connected:luna").await;

    agent.close();
    journal.wait_for("disconnected:luna").await;

    token.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handle_event_reports_dispatch_outcome() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::default();
    let mut daemon = Daemon::new("sparkle", hub(&dir).await, Recording::new(&journal));
    daemon.start().unwrap();

    let message = |kind: &str, payload| {
        RouterEvent::Message(pony_rpc::Message::new(id("luna"), None, kind, payload))
    };

    assert_eq!(
        daemon.handle_event(message("note", json!({"text": "a"}))),
        Some(Dispatch::Handled)
    );
    assert_eq!(
        daemon.handle_event(message("note", json!([]))),
        Some(Dispatch::Malformed)
    );
    assert_eq!(
        daemon.handle_event(message("other", json!(null))),
        Some(Dispatch::Unknown)
    );
    assert_eq!(
        daemon.handle_event(RouterEvent::PeerConnected(id("luna"))),
        None
    );
}

#[tokio::test]
async fn test_tick_fires_while_running() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::default();
    let mut manager = Recording::new(&journal);
    manager.tick = Some(Duration::from_millis(10));
    let daemon = Daemon::new("twilight", hub(&dir).await, manager);

    let token = CancellationToken::new();
    let task = tokio::spawn(daemon.run(token.clone()));

    tokio::time::sleep(Duration::from_millis(120)).await;
    token.cancel();
    task.await.unwrap().unwrap();

    assert!(journal.ticks.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_failed_start_stops_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::default();
    let mut manager = Recording::new(&journal);
    manager.fail_start = true;
    let daemon = Daemon::new("sparkle", hub(&dir).await, manager);

    let result = daemon.run(CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::Manager(_))));
    assert_eq!(journal.cleanups.load(Ordering::SeqCst), 1);
    assert!(
        !dir.path().join("hub.sock").exists(),
        "router should release its socket"
    );
}

#[tokio::test]
async fn test_lifecycle_transitions() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::default();
    let mut daemon = Daemon::new("sparkle", hub(&dir).await, Recording::new(&journal));

    assert_eq!(daemon.state(), State::Created);
    assert!(matches!(daemon.stop(), Err(Error::Lifecycle(_))));

    daemon.start().unwrap();
    assert_eq!(daemon.state(), State::Running);
    assert!(daemon.start().is_err());

    daemon.stop().unwrap();
    assert_eq!(daemon.state(), State::Stopped);
    assert!(daemon.stop().is_err());
    assert!(daemon.start().is_err());
}

#[tokio::test]
async fn test_cleanup_is_idempotent_and_guaranteed_on_drop() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::default();

    let mut daemon = Daemon::new("sparkle", hub(&dir).await, Recording::new(&journal));
    daemon.cleanup();
    daemon.cleanup();
    drop(daemon);
    assert_eq!(journal.cleanups.load(Ordering::SeqCst), 1);

    let dropped = Daemon::new("sparkle", hub(&dir).await, Recording::new(&journal));
    drop(dropped);
    assert_eq!(journal.cleanups.load(Ordering::SeqCst), 2);
}
