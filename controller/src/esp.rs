use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use fermenter_common::{
    config::NetworkConfig, dispatch::EVENT_NETWORK_FAILURE, storage::FLASH_MOUNT_PREFIX,
    Dispatcher, FileReply, FlashStore, Outcome, Program, Regulator, RelayAction, RuntimeConfig,
    ALIVE_RUNNING, ALIVE_STARTING, TOPIC_ALIVE, TOPIC_FILE, TOPIC_FILES, TOPIC_STATE,
    TOPIC_SUBSCRIPTION,
};

use crate::relay::RelayBank;

const NVS_NAMESPACE: &str = "fermenter";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const ALIVE_OFFLINE: &str = "Offline";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SPIFFS_MAX_FILES: usize = 5;
const CONTROL_LOOP_PERIOD_MS: u64 = 500;

#[derive(Clone)]
struct SharedState {
    regulator: Arc<Mutex<Regulator>>,
    dispatcher: Dispatcher,
    relays: Arc<Mutex<RelayBank>>,
    mqtt_connected: Arc<AtomicBool>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`",
        runtime.network.wifi_ssid, runtime.network.mqtt_host, runtime.network.mqtt_port,
    );

    mount_flash().context("failed to mount flash file system")?;
    let flash = FlashStore::new(FLASH_MOUNT_PREFIX.trim_end_matches('/'));
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

    let relays = RelayBank::gpio(&runtime.relays).unwrap_or_else(|err| {
        warn!("failed to initialize relays, running simulated: {err:#}");
        RelayBank::simulated(&runtime.relays)
    });

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => {
            info!("wifi connected");
            wifi
        }
        Err(err) => {
            warn!("wifi startup failed: {err:#}");
            restart_after_network_failure(&dispatcher);
        }
    };

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let shared_state = SharedState {
        regulator: Arc::new(Mutex::new(regulator)),
        dispatcher,
        relays: Arc::new(Mutex::new(relays)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
    };

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));

    spawn_mqtt_receiver(shared_state.clone(), mqtt_conn, mqtt_client.clone())?;
    spawn_control_loop(shared_state, mqtt_client)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
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

fn mount_flash() -> anyhow::Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: c"/flash".as_ptr(),
        partition_label: core::ptr::null(),
        max_files: SPIFFS_MAX_FILES,
        format_if_mount_failed: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        info!("flash file system mounted at {FLASH_MOUNT_PREFIX}");
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

fn restart_after_network_failure(dispatcher: &Dispatcher) -> ! {
    if let Err(err) = dispatcher.log_event(EVENT_NETWORK_FAILURE) {
        warn!("failed to record network failure: {err:#}");
    }
    warn!("network unavailable; restarting device");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.disconnect();
        let _ = wifi.stop();
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.mqtt_client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        keep_alive_interval: Some(Duration::from_secs(30)),
        lwt: Some(LwtConfiguration {
            topic: TOPIC_ALIVE,
            payload: ALIVE_OFFLINE.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn on_connected(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    info!("mqtt connected; subscribing to {TOPIC_SUBSCRIPTION}");
    let mut client = mqtt.lock().unwrap();
    client.subscribe(TOPIC_SUBSCRIPTION, QoS::AtMostOnce)?;
    client.publish(TOPIC_ALIVE, QoS::AtLeastOnce, true, ALIVE_STARTING.as_bytes())?;
    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    let reconnect_delay = {
        let regulator = state.regulator.lock().unwrap();
        Duration::from_millis(regulator.config.reconnect_delay_ms)
    };

    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        state.mqtt_connected.store(true, Ordering::Relaxed);
                        if let Err(err) = on_connected(&mqtt) {
                            warn!("mqtt subscribe failed: {err:#}");
                        }
                    }
                    EventPayload::Disconnected => {
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                        warn!("mqtt broker disconnected");
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // Only full payloads are dispatched.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if let Err(err) = handle_mqtt_message(&state, &mqtt, topic, data) {
                            warn!("mqtt message handling error on {topic}: {err:#}");
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(reconnect_delay);
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;

    Ok(())
}

fn handle_mqtt_message(
    state: &SharedState,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    let now_ms = monotonic_ms();

    let outcome = {
        let mut regulator = state.regulator.lock().unwrap();
        state
            .dispatcher
            .handle(&mut regulator, topic, payload, now_ms)?
    };

    match outcome {
        Outcome::ProgramApplied(program) => {
            let regulator = state.regulator.lock().unwrap();
            log_program_loaded(&regulator, program);
        }
        Outcome::ReadingAccepted(temp_c) => info!("temperature reading {temp_c:.2}C"),
        Outcome::Files(files) => {
            for file in &files {
                info!("flash file {} - {} bytes", file.name, file.size);
            }
            let body = serde_json::to_vec(&files)?;
            mqtt.lock()
                .unwrap()
                .publish(TOPIC_FILES, QoS::AtMostOnce, false, &body)?;
        }
        Outcome::File(reply) => {
            if let FileReply::NotFound { name, files } = &reply {
                warn!("flash file {name} not found; {} files present", files.len());
            }
            let body = serde_json::to_vec(&reply)?;
            mqtt.lock()
                .unwrap()
                .publish(TOPIC_FILE, QoS::AtMostOnce, false, &body)?;
        }
        Outcome::Ignored => {}
    }

    Ok(())
}

fn spawn_control_loop(
    state: SharedState,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    let (state_interval_ms, alive_interval_ms) = {
        let regulator = state.regulator.lock().unwrap();
        (
            regulator.config.state_publish_interval_ms,
            regulator.config.alive_interval_ms,
        )
    };

    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_state_publish_ms = 0_u64;
            let mut last_alive_ms = 0_u64;
            let mut wifi_disconnected_since_ms: Option<u64> = None;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if is_wifi_station_connected() {
                    wifi_disconnected_since_ms = None;
                } else if let Some(since_ms) = wifi_disconnected_since_ms {
                    if now_ms.saturating_sub(since_ms) >= WIFI_RESTART_GRACE_MS {
                        warn!(
                            "wifi disconnected for {}s",
                            WIFI_RESTART_GRACE_MS / 1000
                        );
                        let actions = state.regulator.lock().unwrap().shutdown(now_ms);
                        execute_relay_actions(&state, actions);
                        restart_after_network_failure(&state.dispatcher);
                    }
                } else {
                    wifi_disconnected_since_ms = Some(now_ms);
                }

                let actions = {
                    let mut regulator = state.regulator.lock().unwrap();
                    regulator.tick(now_ms)
                };
                execute_relay_actions(&state, actions);

                if state.mqtt_connected.load(Ordering::Relaxed) {
                    if now_ms.saturating_sub(last_state_publish_ms) >= state_interval_ms {
                        last_state_publish_ms = now_ms;
                        if let Err(err) = publish_state(&state, &mqtt) {
                            warn!("state publish failed: {err:#}");
                        }
                    }

                    if now_ms.saturating_sub(last_alive_ms) >= alive_interval_ms {
                        last_alive_ms = now_ms;
                        let result = mqtt.lock().unwrap().publish(
                            TOPIC_ALIVE,
                            QoS::AtLeastOnce,
                            false,
                            ALIVE_RUNNING.as_bytes(),
                        );
                        if let Err(err) = result {
                            warn!("alive publish failed: {err:?}");
                        }
                    }
                }

                thread::sleep(Duration::from_millis(CONTROL_LOOP_PERIOD_MS));
            }
        })
        .context("failed to spawn control loop thread")?;

    Ok(())
}

fn publish_state(
    state: &SharedState,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    let payload = {
        let regulator = state.regulator.lock().unwrap();
        serde_json::to_vec(&regulator.state_payload())?
    };

    let mut client = mqtt.lock().unwrap();
    client.publish(TOPIC_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn execute_relay_actions(state: &SharedState, actions: Vec<RelayAction>) {
    if actions.is_empty() {
        return;
    }

    let result = state.relays.lock().unwrap().apply_all(actions);
    if let Err(err) = result {
        warn!("relay actuation failed, releasing both relays: {err:#}");
        state.regulator.lock().unwrap().shutdown(monotonic_ms());
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
