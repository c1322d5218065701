use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use rumqttc::{AsyncClient, ClientError, Event, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tracing::{info, warn};

use fermenter_common::{
    Dispatcher, FileReply, FlashStore, Outcome, Program, ProgramTable, Regulator, RegulatorStatus,
    RelayAction, RuntimeConfig, ALIVE_RUNNING, ALIVE_STARTING, TOPIC_ALIVE, TOPIC_FILE,
    TOPIC_FILES, TOPIC_STATE, TOPIC_SUBSCRIPTION,
};

use crate::relay::{RelayBank, RelayDiagnostics};

const ALIVE_OFFLINE: &str = "Offline";
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct AppState {
    regulator: Arc<Mutex<Regulator>>,
    dispatcher: Dispatcher,
    relays: Arc<Mutex<RelayBank>>,
    mqtt: AsyncClient,
    mqtt_connected: Arc<AtomicBool>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    data_dir: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    regulator: RegulatorStatus,
    #[serde(rename = "mqttConnected")]
    mqtt_connected: bool,
    relays: RelayDiagnostics,
}

#[derive(Debug, Serialize)]
struct ProgramView {
    program: Program,
    flag: char,
    #[serde(rename = "minTemp")]
    min_temp: f32,
    #[serde(rename = "maxTemp")]
    max_temp: f32,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    apply_env_overrides(&mut runtime);

    let flash = FlashStore::new(store.data_dir.join("flash"));
    flash
        .ensure_root()
        .with_context(|| format!("failed to prepare flash area {}", flash.root().display()))?;
    let dispatcher = Dispatcher::new(flash, runtime.storage.clone());

    let mut regulator = Regulator::new(
        runtime.regulator.clone(),
        runtime.programs.clone(),
        Program::default(),
    );
    match dispatcher.restore_program(&mut regulator) {
        Ok(Some(program)) => log_program_loaded(&regulator, program),
        Ok(None) => info!(
            "no stored program; regulating for {}",
            regulator.program().as_str()
        ),
        Err(err) => warn!("stored program unusable, keeping default: {err:#}"),
    }

    let mut mqtt_options = MqttOptions::new(
        runtime.network.mqtt_client_id.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_last_will(LastWill::new(
        TOPIC_ALIVE,
        ALIVE_OFFLINE.as_bytes().to_vec(),
        QoS::AtLeastOnce,
        true,
    ));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        regulator: Arc::new(Mutex::new(regulator)),
        dispatcher,
        relays: Arc::new(Mutex::new(RelayBank::simulated(&runtime.relays))),
        mqtt,
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        store,
    };

    let mqtt_task = spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());
    spawn_heartbeat_loop(app_state.clone());
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/program",
            get(handle_get_program).post(handle_set_program),
        )
        .route(
            "/api/programs",
            get(handle_get_programs).put(handle_put_programs),
        )
        .route("/api/files", get(handle_get_files))
        .with_state(app_state.clone());

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    warn!("shutting down; releasing relays");
    let actions = {
        let mut regulator = app_state.regulator.lock().await;
        regulator.shutdown(monotonic_ms())
    };
    execute_relay_actions(&app_state, actions).await;
    if let Err(err) = app_state.relays.lock().await.all_off() {
        warn!("failed to release relays on shutdown: {err:#}");
    }

    close_session(&app_state, mqtt_task).await;
    Ok(())
}

/// Announces `Offline`, then disconnects and waits for the event loop to
/// flush both before the runtime goes away.
async fn close_session(app_state: &AppState, mut mqtt_task: JoinHandle<()>) {
    if !app_state.mqtt_connected.load(Ordering::Relaxed) {
        mqtt_task.abort();
        return;
    }

    let queued = async {
        app_state
            .mqtt
            .publish(TOPIC_ALIVE, QoS::AtLeastOnce, true, ALIVE_OFFLINE)
            .await?;
        app_state.mqtt.disconnect().await
    };
    match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, queued).await {
        Ok(Ok(())) => {
            if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, &mut mqtt_task)
                .await
                .is_err()
            {
                warn!("mqtt session did not close in time");
            }
        }
        Ok(Err(err)) => warn!("offline announcement failed: {err}"),
        Err(_) => warn!("offline announcement timed out"),
    }
    mqtt_task.abort();
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

fn log_program_loaded(regulator: &Regulator, program: Program) {
    let thresholds = regulator.thresholds();
    info!(
        "program loaded: {} (min {:.1}C, max {:.1}C)",
        program.as_str(),
        thresholds.min_c,
        thresholds.max_c
    );
}

fn on_connected(app_state: &AppState) -> JoinHandle<()> {
    app_state.mqtt_connected.store(true, Ordering::Relaxed);
    info!("mqtt connected; subscribing to {TOPIC_SUBSCRIPTION}");

    // Requests are drained by the event loop, so they cannot be awaited on it.
    let mqtt = app_state.mqtt.clone();
    tokio::spawn(async move {
        if let Err(err) = announce_session(&mqtt).await {
            warn!("mqtt session setup failed: {err}");
        }
    })
}

/// The broker may have dropped the session, so this runs on every connect.
async fn announce_session(mqtt: &AsyncClient) -> Result<(), ClientError> {
    mqtt.subscribe(TOPIC_SUBSCRIPTION, QoS::AtMostOnce).await?;
    mqtt.publish(TOPIC_ALIVE, QoS::AtLeastOnce, true, ALIVE_STARTING)
        .await
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reconnect_delay = {
            let regulator = app_state.regulator.lock().await;
            Duration::from_millis(regulator.config.reconnect_delay_ms)
        };

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error on {}: {err:#}", message.topic);
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    on_connected(&app_state);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    app_state.mqtt_connected.store(false, Ordering::Relaxed);
                    info!("mqtt session closed");
                    break;
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    app_state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt broker disconnected");
                }
                Ok(_) => {}
                Err(err) => {
                    if app_state.mqtt_connected.swap(false, Ordering::Relaxed) {
                        warn!("mqtt broker disconnected: {err}");
                    } else {
                        warn!("mqtt broker unreachable: {err}");
                    }
                    tokio::time::sleep(reconnect_delay).await;
                }
            }
        }
    })
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let actions = {
                let mut regulator = app_state.regulator.lock().await;
                regulator.tick(now_ms)
            };

            if !actions.is_empty() {
                execute_relay_actions(&app_state, actions).await;
            }
        }
    });
}

fn spawn_heartbeat_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = {
            let regulator = app_state.regulator.lock().await;
            Duration::from_millis(regulator.config.alive_interval_ms)
        };
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            if !app_state.mqtt_connected.load(Ordering::Relaxed) {
                continue;
            }
            if let Err(err) = app_state
                .mqtt
                .publish(TOPIC_ALIVE, QoS::AtLeastOnce, false, ALIVE_RUNNING)
                .await
            {
                warn!("alive publish failed: {err}");
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = {
            let regulator = app_state.regulator.lock().await;
            Duration::from_millis(regulator.config.state_publish_interval_ms)
        };
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            if let Err(err) = publish_state(&app_state).await {
                warn!("regulator state publish failed: {err:#}");
            }
        }
    });
}

/// Skipped while offline so stale snapshots never fill the request queue.
async fn publish_state(app_state: &AppState) -> anyhow::Result<bool> {
    if !app_state.mqtt_connected.load(Ordering::Relaxed) {
        return Ok(false);
    }

    let body = {
        let regulator = app_state.regulator.lock().await;
        serde_json::to_vec(&regulator.state_payload()).context("state serialization")?
    };
    app_state
        .mqtt
        .publish(TOPIC_STATE, QoS::AtLeastOnce, true, body)
        .await?;
    Ok(true)
}

async fn execute_relay_actions(app_state: &AppState, actions: Vec<RelayAction>) {
    let result = app_state.relays.lock().await.apply_all(actions);
    if let Err(err) = result {
        warn!("relay actuation failed, releasing both relays: {err:#}");
        let mut regulator = app_state.regulator.lock().await;
        regulator.shutdown(monotonic_ms());
    }
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    let now_ms = monotonic_ms();

    let outcome = {
        let mut regulator = app_state.regulator.lock().await;
        app_state
            .dispatcher
            .handle(&mut regulator, topic, payload, now_ms)?
    };

    match outcome {
        Outcome::ProgramApplied(program) => {
            let regulator = app_state.regulator.lock().await;
            log_program_loaded(&regulator, program);
        }
        Outcome::ReadingAccepted(temp_c) => info!("temperature reading {temp_c:.2}C"),
        Outcome::Files(files) => {
            for file in &files {
                info!("flash file {} - {} bytes", file.name, file.size);
            }
            let body = serde_json::to_vec(&files).context("file listing serialization")?;
            app_state
                .mqtt
                .publish(TOPIC_FILES, QoS::AtMostOnce, false, body)
                .await
                .context("failed to publish file listing")?;
        }
        Outcome::File(reply) => {
            match &reply {
                FileReply::Found { name, content, .. } => {
                    info!("flash file {name} contains `{content}`")
                }
                FileReply::NotFound { name, files } => {
                    warn!("flash file {name} not found; {} files present", files.len())
                }
            }
            let body = serde_json::to_vec(&reply).context("file reply serialization")?;
            app_state
                .mqtt
                .publish(TOPIC_FILE, QoS::AtMostOnce, false, body)
                .await
                .context("failed to publish file reply")?;
        }
        Outcome::Ignored => {}
    }

    Ok(())
}

async fn build_status(state: &AppState) -> StatusView {
    let regulator = state.regulator.lock().await.status(monotonic_ms());
    let relays = state.relays.lock().await.diagnostics();
    StatusView {
        regulator,
        mqtt_connected: state.mqtt_connected.load(Ordering::Relaxed),
        relays,
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(build_status(&state).await)
}

async fn handle_get_program(State(state): State<AppState>) -> impl IntoResponse {
    let regulator = state.regulator.lock().await;
    let thresholds = regulator.thresholds();
    Json(ProgramView {
        program: regulator.program(),
        flag: regulator.program().flag() as char,
        min_temp: thresholds.min_c,
        max_temp: thresholds.max_c,
    })
}

async fn handle_set_program(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(program) = Program::from_message(value.as_bytes()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid program. Use 'F', 'M' or 'P'",
        );
    };

    let result = {
        let mut regulator = state.regulator.lock().await;
        state.dispatcher.define_program(&mut regulator, program)
    };

    match result {
        Ok(program) => {
            let regulator = state.regulator.lock().await;
            log_program_loaded(&regulator, program);
        }
        Err(err) => {
            warn!("failed to persist program update: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist program",
            );
        }
    }

    handle_get_program(State(state)).await.into_response()
}

async fn handle_get_programs(State(state): State<AppState>) -> impl IntoResponse {
    let programs = state.regulator.lock().await.programs().clone();
    Json(programs)
}

async fn handle_put_programs(
    State(state): State<AppState>,
    Json(programs): Json<ProgramTable>,
) -> impl IntoResponse {
    if !programs.validate() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Each program needs minC <= maxC within -20..60",
        );
    }

    let changed = {
        let mut regulator = state.regulator.lock().await;
        regulator.set_programs(programs)
    };

    if changed {
        if let Err(err) = persist_runtime_from_state(&state).await {
            warn!("failed to persist program table: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist runtime settings",
            );
        }
    }

    handle_get_programs(State(state)).await.into_response()
}

async fn handle_get_files(State(state): State<AppState>) -> impl IntoResponse {
    match state.dispatcher.flash().list() {
        Ok(files) => Json(files).into_response(),
        Err(err) => {
            warn!("failed to list flash files: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list files")
        }
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("FERMENTER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.fermenter"));
        Self::at(data_dir)
    }

    fn at(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            data_dir: Arc::new(data_dir),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let programs = state.regulator.lock().await.programs().clone();

    let mut runtime = state.store.load_runtime_config().await?;
    runtime.programs = programs;
    state.store.save_runtime_config(&runtime).await
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
