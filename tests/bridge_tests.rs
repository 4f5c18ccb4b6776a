//! Bridge controller tests driven by in-process fakes of both connections.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use printer_scene_bridge::{
    ActionClient, ActionError, Bridge, BridgeError, BridgeReport, BridgeState, BridgeStats, Config,
    ConnectionState, EventKind, TelemetryConnection, TelemetryConnector, TelemetryError,
};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ActionLog {
    connects: AtomicUsize,
    listed: AtomicUsize,
    disconnects: AtomicUsize,
    activations: Mutex<Vec<String>>,
}

impl ActionLog {
    fn activations(&self) -> Vec<String> {
        self.activations.lock().unwrap().clone()
    }
}

/// How the fake answers `connect()`.
#[derive(Clone)]
enum ConnectBehavior {
    Succeed,
    Fail,
    Hang,
}

struct FakeAction {
    log: Arc<ActionLog>,
    state: ConnectionState,
    connect: ConnectBehavior,
    /// Used for every `connect()` after the first.
    reconnect: ConnectBehavior,
    /// Scenes whose activation is rejected.
    rejected: HashSet<String>,
    /// Scenes whose activation drops the connection.
    dropping: HashSet<String>,
}

impl FakeAction {
    fn new(log: Arc<ActionLog>) -> Self {
        Self {
            log,
            state: ConnectionState::Disconnected,
            connect: ConnectBehavior::Succeed,
            reconnect: ConnectBehavior::Succeed,
            rejected: HashSet::new(),
            dropping: HashSet::new(),
        }
    }
}

impl ActionClient for FakeAction {
    async fn connect(&mut self) -> Result<(), ActionError> {
        let previous = self.log.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = if previous == 0 { self.connect.clone() } else { self.reconnect.clone() };
        match behavior {
            ConnectBehavior::Succeed => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            ConnectBehavior::Fail => Err(ActionError::ConnectFailed {
                endpoint: "ws://fake".into(),
                detail: "refused".into(),
            }),
            ConnectBehavior::Hang => {
                self.state = ConnectionState::Connecting;
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn activate(&mut self, action: &str) -> Result<(), ActionError> {
        if self.state != ConnectionState::Connected {
            return Err(ActionError::NotConnected);
        }
        self.log.activations.lock().unwrap().push(action.to_string());
        if self.rejected.contains(action) {
            return Err(ActionError::ActionRejected {
                action: action.to_string(),
                code: 600,
                comment: None,
            });
        }
        if self.dropping.contains(action) {
            self.state = ConnectionState::Disconnected;
            return Err(ActionError::TransportError("connection reset".into()));
        }
        Ok(())
    }

    async fn available_actions(&mut self) -> Result<Vec<String>, ActionError> {
        self.log.listed.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["Toolhead".into(), "Printing".into()])
    }

    async fn disconnect(&mut self) {
        self.log.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

/// One scripted step of a fake telemetry connection.
#[derive(Clone)]
enum Step {
    Message(String),
    /// Connection closes cleanly.
    Close,
    /// Connection fails with a transport error.
    Fail,
    /// Request shutdown, then block forever.
    Shutdown,
}

struct FakeConnector {
    /// One entry per `connect()` call: a script, or a connect failure.
    scripts: Mutex<VecDeque<Option<Vec<Step>>>>,
    connects: Arc<AtomicUsize>,
    shutdown: Arc<watch::Sender<bool>>,
}

struct FakeConnection {
    steps: VecDeque<Step>,
    shutdown: Arc<watch::Sender<bool>>,
    state: ConnectionState,
}

impl TelemetryConnector for FakeConnector {
    type Connection = FakeConnection;

    fn endpoint(&self) -> String {
        "ws://fake/websocket".into()
    }

    async fn connect(&self) -> Result<FakeConnection, TelemetryError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(Some(steps)) => Ok(FakeConnection {
                steps: steps.into(),
                shutdown: Arc::clone(&self.shutdown),
                state: ConnectionState::Connected,
            }),
            Some(None) => Err(TelemetryError::ConnectFailed {
                url: self.endpoint(),
                detail: "refused".into(),
            }),
            None => {
                let _ = self.shutdown.send(true);
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

impl TelemetryConnection for FakeConnection {
    async fn next_message(&mut self) -> Option<Result<String, TelemetryError>> {
        match self.steps.pop_front() {
            Some(Step::Message(text)) => Some(Ok(text)),
            Some(Step::Close) => None,
            Some(Step::Fail) => Some(Err(TelemetryError::Transport("reset by peer".into()))),
            Some(Step::Shutdown) | None => {
                let _ = self.shutdown.send(true);
                std::future::pending::<()>().await;
                None
            }
        }
    }

    async fn close(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BASE_CONFIG: &str = r#"
[printer]
host = "printer"
port = 7125

[obs]
host = "obs"
port = 4455

[scenes]
tool_change_started = "Toolhead"
tool_change_completed = "Printing"

[reconnect]
initial_delay_ms = 1
max_delay_ms = 5
jitter = false
"#;

fn config(extra: &str) -> Arc<Config> {
    let text = format!("{BASE_CONFIG}\n{extra}");
    Arc::new(Config::from_toml_str(&text, Path::new("test.toml")).unwrap())
}

fn gcode(lines: &[&str]) -> Step {
    Step::Message(
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notify_gcode_response",
            "params": lines,
        })
        .to_string(),
    )
}

fn start() -> Step {
    gcode(&["echo: Toolchange Starting"])
}

fn complete() -> Step {
    gcode(&["echo: Toolchange Completed"])
}

struct Harness {
    connector: FakeConnector,
    telemetry_connects: Arc<AtomicUsize>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

fn harness(scripts: Vec<Option<Vec<Step>>>) -> Harness {
    let (tx, rx) = watch::channel(false);
    let shutdown_tx = Arc::new(tx);
    let telemetry_connects = Arc::new(AtomicUsize::new(0));
    Harness {
        connector: FakeConnector {
            scripts: Mutex::new(scripts.into()),
            connects: Arc::clone(&telemetry_connects),
            shutdown: Arc::clone(&shutdown_tx),
        },
        telemetry_connects,
        shutdown_tx,
        shutdown_rx: rx,
    }
}

async fn run_bridge(
    config: Arc<Config>,
    action: FakeAction,
    h: Harness,
) -> Result<BridgeReport, BridgeError> {
    let bridge = Bridge::new(config, action, h.connector);
    tokio::time::timeout(Duration::from_secs(5), bridge.run(h.shutdown_rx))
        .await
        .expect("bridge did not stop in time")
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_switches_scenes_in_order() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![Some(vec![start(), complete(), Step::Shutdown])]);

    let report = run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    assert_eq!(log.activations(), vec!["Toolhead", "Printing"]);
    assert_eq!(
        report.transitions,
        vec![
            BridgeState::Starting,
            BridgeState::Connecting,
            BridgeState::Running,
            BridgeState::Stopping,
            BridgeState::Stopped,
        ]
    );
    assert_eq!(report.stats.messages, 2);
    assert_eq!(report.stats.events, 2);
    assert_eq!(report.stats.activations_ok, 2);
    assert_eq!(log.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_and_complete_in_one_message_are_applied_in_sequence() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![Some(vec![
        gcode(&["echo: Toolchange Starting", "noise", "echo: Toolchange Completed"]),
        Step::Shutdown,
    ])]);

    run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    assert_eq!(log.activations(), vec!["Toolhead", "Printing"]);
}

#[tokio::test]
async fn test_action_connect_failure_at_startup_is_fatal() {
    let log = Arc::new(ActionLog::default());
    let mut action = FakeAction::new(Arc::clone(&log));
    action.connect = ConnectBehavior::Fail;
    let h = harness(vec![Some(vec![start(), Step::Shutdown])]);
    let telemetry_connects = Arc::clone(&h.telemetry_connects);

    let err = run_bridge(config(""), action, h).await.unwrap_err();

    assert!(matches!(err, BridgeError::ActionConnect(ActionError::ConnectFailed { .. })), "{err:?}");
    assert_eq!(telemetry_connects.load(Ordering::SeqCst), 0);
    assert!(log.activations().is_empty());
}

#[tokio::test]
async fn test_shutdown_during_action_connect_stops_cleanly() {
    let log = Arc::new(ActionLog::default());
    let mut action = FakeAction::new(Arc::clone(&log));
    action.connect = ConnectBehavior::Hang;
    let h = harness(vec![]);
    let trigger = Arc::clone(&h.shutdown_tx);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = trigger.send(true);
    });
    let report = run_bridge(config(""), action, h).await.unwrap();

    assert_eq!(
        report.transitions,
        vec![
            BridgeState::Starting,
            BridgeState::Connecting,
            BridgeState::Stopping,
            BridgeState::Stopped,
        ]
    );
}

#[tokio::test]
async fn test_shutdown_while_telemetry_keeps_failing_stops_cleanly() {
    let log = Arc::new(ActionLog::default());
    // Every connect fails, then the exhausted connector requests shutdown.
    let h = harness(vec![None, None, None]);
    let telemetry_connects = Arc::clone(&h.telemetry_connects);

    let report = run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    assert_eq!(report.final_state(), BridgeState::Stopped);
    assert!(!report.transitions.contains(&BridgeState::Running));
    assert_eq!(telemetry_connects.load(Ordering::SeqCst), 4);
    assert_eq!(log.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_initial_telemetry_failure_is_retried() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![None, Some(vec![start(), Step::Shutdown])]);
    let telemetry_connects = Arc::clone(&h.telemetry_connects);

    let report = run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    assert_eq!(telemetry_connects.load(Ordering::SeqCst), 2);
    assert_eq!(log.activations(), vec!["Toolhead"]);
    assert_eq!(report.stats.reconnects, 0);
}

#[tokio::test]
async fn test_scenes_are_verified_at_startup() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![Some(vec![Step::Shutdown])]);
    run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();
    assert_eq!(log.listed.load(Ordering::SeqCst), 1);

    let log = Arc::new(ActionLog::default());
    let h = harness(vec![Some(vec![Step::Shutdown])]);
    let mut cfg = config("").as_ref().clone();
    cfg.obs.verify_scenes = false;
    run_bridge(Arc::new(cfg), FakeAction::new(Arc::clone(&log)), h).await.unwrap();
    assert_eq!(log.listed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_scene_map_is_a_config_error() {
    let log = Arc::new(ActionLog::default());
    let mut cfg = config("").as_ref().clone();
    cfg.scenes.clear();
    let h = harness(vec![]);

    let err = run_bridge(Arc::new(cfg), FakeAction::new(Arc::clone(&log)), h).await.unwrap_err();

    assert!(matches!(err, BridgeError::Config(_)), "{err:?}");
    assert_eq!(log.connects.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Running
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_activation_does_not_stop_processing() {
    let log = Arc::new(ActionLog::default());
    let mut action = FakeAction::new(Arc::clone(&log));
    action.rejected.insert("Toolhead".into());
    let h = harness(vec![Some(vec![start(), complete(), Step::Shutdown])]);

    let report = run_bridge(config(""), action, h).await.unwrap();

    assert_eq!(log.activations(), vec!["Toolhead", "Printing"]);
    assert_eq!(report.stats.activations_failed, 1);
    assert_eq!(report.stats.activations_ok, 1);
    assert!(!report.transitions.contains(&BridgeState::Reconnecting));
    assert_eq!(report.final_state(), BridgeState::Stopped);
}

#[tokio::test]
async fn test_malformed_message_is_skipped() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![Some(vec![
        Step::Message("{not json".into()),
        start(),
        Step::Shutdown,
    ])]);

    let report = run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    assert_eq!(report.stats.malformed, 1);
    assert_eq!(report.stats.messages, 2);
    assert_eq!(log.activations(), vec!["Toolhead"]);
}

#[tokio::test]
async fn test_unrelated_methods_trigger_nothing() {
    let log = Arc::new(ActionLog::default());
    let status = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "notify_status_update",
        "params": ["echo: Toolchange Starting"],
    })
    .to_string();
    let h = harness(vec![Some(vec![Step::Message(status), Step::Shutdown])]);

    let report = run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    assert_eq!(report.stats.events, 0);
    assert!(log.activations().is_empty());
}

#[tokio::test]
async fn test_unmapped_event_is_ignored() {
    let log = Arc::new(ActionLog::default());
    let mut cfg = config("").as_ref().clone();
    cfg.scenes.remove(&EventKind::ToolChangeCompleted);
    let h = harness(vec![Some(vec![complete(), start(), Step::Shutdown])]);

    let report = run_bridge(Arc::new(cfg), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    assert_eq!(report.stats.events, 2);
    assert_eq!(log.activations(), vec!["Toolhead"]);
    assert_eq!(report.stats.activations_failed, 0);
}

#[tokio::test]
async fn test_auto_switch_disabled_only_observes() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![Some(vec![start(), complete(), Step::Shutdown])]);

    let report = run_bridge(
        config("[software]\nauto_switch = false\n"),
        FakeAction::new(Arc::clone(&log)),
        h,
    )
    .await
    .unwrap();

    assert_eq!(report.stats.events, 2);
    assert!(log.activations().is_empty());
}

#[tokio::test]
async fn test_custom_triggers_are_used() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![Some(vec![
        gcode(&["echo: TC begin T1"]),
        start(),
        gcode(&["TC end"]),
        Step::Shutdown,
    ])]);

    run_bridge(
        config("[triggers]\ntool_change_started = \"TC begin\"\ntool_change_completed = \"TC end\"\n"),
        FakeAction::new(Arc::clone(&log)),
        h,
    )
    .await
    .unwrap();

    assert_eq!(log.activations(), vec!["Toolhead", "Printing"]);
}

#[tokio::test]
async fn test_dropped_action_connection_is_reopened_on_next_event() {
    let log = Arc::new(ActionLog::default());
    let mut action = FakeAction::new(Arc::clone(&log));
    action.dropping.insert("Toolhead".into());
    let h = harness(vec![Some(vec![start(), complete(), Step::Shutdown])]);

    let report = run_bridge(config(""), action, h).await.unwrap();

    assert_eq!(log.connects.load(Ordering::SeqCst), 2);
    assert_eq!(log.activations(), vec!["Toolhead", "Printing"]);
    assert_eq!(report.stats.activations_failed, 1);
    assert_eq!(report.stats.activations_ok, 1);
}

#[tokio::test]
async fn test_shutdown_abandons_action_reconnect_during_dispatch() {
    let log = Arc::new(ActionLog::default());
    let mut action = FakeAction::new(Arc::clone(&log));
    action.dropping.insert("Toolhead".into());
    action.reconnect = ConnectBehavior::Hang;
    // The completed event finds the action client down and hangs reconnecting.
    let h = harness(vec![Some(vec![start(), complete(), Step::Shutdown])]);
    let trigger = Arc::clone(&h.shutdown_tx);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = trigger.send(true);
    });
    let report = run_bridge(config(""), action, h).await.unwrap();

    assert_eq!(report.final_state(), BridgeState::Stopped);
    assert_eq!(log.connects.load(Ordering::SeqCst), 2);
    assert_eq!(log.activations(), vec!["Toolhead"]);
    assert_eq!(log.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_new_bridge_starts_idle() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![]);
    let bridge = Bridge::new(config(""), FakeAction::new(log), h.connector);

    assert_eq!(bridge.state(), BridgeState::Starting);
    assert_eq!(*bridge.stats(), BridgeStats::default());
}

// ---------------------------------------------------------------------------
// Reconnecting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_telemetry_close_reconnects_without_touching_action() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![
        Some(vec![start(), Step::Close]),
        Some(vec![complete(), Step::Shutdown]),
    ]);
    let telemetry_connects = Arc::clone(&h.telemetry_connects);

    let report = run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    assert_eq!(
        report.transitions,
        vec![
            BridgeState::Starting,
            BridgeState::Connecting,
            BridgeState::Running,
            BridgeState::Reconnecting,
            BridgeState::Running,
            BridgeState::Stopping,
            BridgeState::Stopped,
        ]
    );
    assert_eq!(telemetry_connects.load(Ordering::SeqCst), 2);
    assert_eq!(log.connects.load(Ordering::SeqCst), 1);
    assert_eq!(log.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(log.activations(), vec!["Toolhead", "Printing"]);
    assert_eq!(report.stats.reconnects, 1);
}

#[tokio::test]
async fn test_telemetry_error_reconnects_through_failed_attempts() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![
        Some(vec![Step::Fail]),
        None,
        None,
        Some(vec![start(), Step::Shutdown]),
    ]);
    let telemetry_connects = Arc::clone(&h.telemetry_connects);

    let report = run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    assert_eq!(telemetry_connects.load(Ordering::SeqCst), 4);
    assert_eq!(report.stats.reconnects, 1);
    assert_eq!(log.connects.load(Ordering::SeqCst), 1);
    assert_eq!(log.activations(), vec!["Toolhead"]);
    assert_eq!(report.final_state(), BridgeState::Stopped);
}

#[tokio::test]
async fn test_repeated_drops_each_pass_through_reconnecting() {
    let log = Arc::new(ActionLog::default());
    let h = harness(vec![
        Some(vec![Step::Close]),
        Some(vec![Step::Close]),
        Some(vec![Step::Shutdown]),
    ]);

    let report = run_bridge(config(""), FakeAction::new(Arc::clone(&log)), h).await.unwrap();

    let reconnecting = report
        .transitions
        .iter()
        .filter(|s| **s == BridgeState::Reconnecting)
        .count();
    assert_eq!(reconnecting, 2);
    assert_eq!(report.stats.reconnects, 2);
    assert_eq!(report.final_state(), BridgeState::Stopped);
}
