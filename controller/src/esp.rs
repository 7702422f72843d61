use core::convert::TryInto;
use std::{
    ffi::{CStr, CString},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Gpio34, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        adc::{
            attenuation::DB_11,
            oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
            ADC1,
        },
        delay::TickType,
        i2c::{I2cConfig, I2cDriver},
        ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, CHANNEL1, TIMER1},
        modem::Modem,
        prelude::Peripherals as ChipPeripherals,
        units::Hertz,
    },
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    sys::{esp_err_t, EspError, ESP_OK},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use multitool_common::{
    state::SENSOR_MAX, well_known_device_name, ApiRequest, ApiResponse, ChunkSource,
    ConfigStore, ControllerConfig, Credentials, Dispatcher, DutyOutput, FirmwareInfo,
    FlashUpdate, HardwareConfig, HardwareError, HttpMethod, I2cBus, I2cScanner,
    NamespaceStore, NetworkInfo, OtaError, Peripherals, Platform, PostAction, PwmDimmer,
    ServoDriver, ServoOutput, SourceError, StateStore, StoreError, StoredValue, API_PATHS,
    KEY_WIFI_PASS, KEY_WIFI_SSID, NS_WIFI, PATH_UPDATE,
};

const SETUP_AP_SSID: &str = "ESP32-Multitool-Setup";
const SETUP_AP_PASSWORD: &str = "multitool-setup";
const WIFI_JOIN_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY: Duration = Duration::from_secs(3);
const MAX_NVS_STR_LEN: usize = 256;
const I2C_PROBE_TIMEOUT_MS: u64 = 20;
const I2C_BAUDRATE_HZ: u32 = 100_000;
const SERVO_FREQ_HZ: u32 = 50;
const SERVO_PERIOD_US: u32 = 20_000;
const SERVO_MIN_PULSE_US: u32 = 500;
const SERVO_MAX_PULSE_US: u32 = 2_500;
const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
const POST_ACTION_STACK_SIZE: usize = 8 * 1024;

type SharedDispatcher = Arc<Mutex<Dispatcher<EspFlash>>>;

struct WifiLink {
    wifi: EspWifi<'static>,
    ssid: String,
    ip: String,
}

struct StationCredentials {
    ssid: String,
    pass: String,
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
    let nvs_store = Arc::new(NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    });
    let store = ConfigStore::new(nvs_store.clone());

    let config = ControllerConfig::default();
    let mut hardware = HardwareConfig::default();
    hardware.sanitize();

    let credentials = store
        .load_credentials(Credentials::default())
        .unwrap_or_else(|err| {
            warn!("failed to load credentials from NVS: {err}");
            Credentials::default()
        });
    let station = load_station_credentials(&nvs_store);

    info!(
        "NVS config loaded: ssid=`{}`, user=`{}`, relay=GPIO{}, dimmer=GPIO{}@{}Hz, servo=GPIO{}, i2c=GPIO{}/GPIO{}",
        station.ssid,
        credentials.web_username,
        hardware.relay_pin,
        hardware.dimmer_pin,
        hardware.dimmer_freq_hz,
        hardware.servo_pin,
        hardware.i2c_sda_pin,
        hardware.i2c_scl_pin,
    );

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let ChipPeripherals {
        modem,
        pins,
        ledc,
        i2c0,
        adc1,
        ..
    } = ChipPeripherals::take()?;

    let WifiLink { wifi, ssid, ip } = start_wifi(modem, sys_loop, nvs_partition, &station)
        .context("wifi startup failed")?;

    let dimmer_timer = LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig::new()
            .frequency(Hertz(hardware.dimmer_freq_hz))
            .resolution(Resolution::Bits8),
    )
    .context("failed to configure dimmer timer")?;
    let dimmer = LedcDriver::new(
        ledc.channel0,
        dimmer_timer,
        unsafe { AnyOutputPin::new(hardware.dimmer_pin) },
    )
    .context("failed to configure dimmer channel")?;

    let i2c = I2cDriver::new(
        i2c0,
        unsafe { AnyIOPin::new(hardware.i2c_sda_pin) },
        unsafe { AnyIOPin::new(hardware.i2c_scl_pin) },
        &I2cConfig::new().baudrate(Hertz(I2C_BAUDRATE_HZ)),
    )
    .context("failed to configure I2C bus")?;

    let state = StateStore::new(Duration::from_millis(config.state_lock_timeout_ms));
    let sensor = AdcChannelDriver::new(
        AdcDriver::new(adc1)?,
        pins.gpio34,
        &AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        },
    )
    .context("failed to configure sensor ADC")?;
    let relay = PinDriver::output(unsafe { AnyOutputPin::new(hardware.relay_pin) })
        .context("failed to configure relay output")?;
    spawn_sampler(state.clone(), sensor, relay, ip.clone());

    let peripherals = Peripherals {
        dimmer: PwmDimmer::new(Box::new(LedcDimmer { channel: dimmer })),
        servo: ServoDriver::new(Box::new(LedcServo {
            pending: Some((
                ledc.channel1,
                ledc.timer1,
                unsafe { AnyOutputPin::new(hardware.servo_pin) },
            )),
            channel: None,
        })),
        scanner: Arc::new(I2cScanner::new(
            Box::new(EspI2cBus { driver: i2c }),
            Box::new(well_known_device_name),
            Duration::from_millis(config.bus_lock_timeout_ms),
        )),
    };

    let restart_delay = Duration::from_millis(config.restart_delay_ms);
    let max_body = config.max_http_body;
    let dispatcher: SharedDispatcher = Arc::new(Mutex::new(Dispatcher::new(
        config,
        credentials,
        state,
        store.clone(),
        peripherals,
        Box::new(EspPlatform { ssid, ip }),
        EspFlash::default(),
    )));

    let server = create_http_server(dispatcher, store, restart_delay, max_body)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn load_station_credentials(nvs_store: &NvsStore) -> StationCredentials {
    let read = |key: &str| match nvs_store.read(NS_WIFI, key) {
        Ok(value) => value
            .as_ref()
            .and_then(StoredValue::as_str)
            .map(str::to_string)
            .unwrap_or_default(),
        Err(err) => {
            warn!("failed to read wifi/{key} from NVS: {err}");
            String::new()
        }
    };

    let mut station = StationCredentials {
        ssid: read(KEY_WIFI_SSID),
        pass: read(KEY_WIFI_PASS),
    };

    if station.ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            station.ssid = ssid.to_string();
        }
    }

    if station.pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            station.pass = pass.to_string();
        }
    }

    station
}

fn create_http_server(
    dispatcher: SharedDispatcher,
    store: ConfigStore,
    restart_delay: Duration,
    max_body: usize,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        max_uri_handlers: 32,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in API_PATHS.into_iter().filter(|path| *path != PATH_UPDATE) {
        for method in [Method::Get, Method::Post] {
            let dispatcher = dispatcher.clone();
            let store = store.clone();
            server.fn_handler::<anyhow::Error, _>(path, method, move |mut req| {
                let head = RequestHead::from_request(&req, method);
                let response = match read_request_body(&mut req, max_body)? {
                    Some(body) => lock(&dispatcher).handle(&head.request(&body)),
                    None => {
                        let size = head.content_length.unwrap_or(max_body + 1);
                        lock(&dispatcher).handle_oversized(&head.request(&[]), size)
                    }
                };
                write_response(req, &response)?;
                if let Some(action) = response.after {
                    schedule_post_action(action, store.clone(), restart_delay);
                }
                Ok(())
            })?;
        }
    }

    for method in [Method::Get, Method::Post] {
        let dispatcher = dispatcher.clone();
        let store = store.clone();
        server.fn_handler::<anyhow::Error, _>(PATH_UPDATE, method, move |mut req| {
            let head = RequestHead::from_request(&req, method);
            let response = {
                let mut body = RequestBody {
                    reader: &mut req,
                    remaining: head.content_length,
                };
                lock(&dispatcher).handle_upload(&head.request(&[]), &mut body)
            };
            write_response(req, &response)?;
            if let Some(action) = response.after {
                schedule_post_action(action, store.clone(), restart_delay);
            }
            Ok(())
        })?;
    }

    Ok(server)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RequestHead {
    method: HttpMethod,
    path: String,
    authorization: Option<String>,
    content_type: Option<String>,
    content_length: Option<usize>,
}

impl RequestHead {
    fn from_request(req: &Request<&mut EspHttpConnection<'_>>, method: Method) -> Self {
        let uri = req.uri();
        let path = uri.split_once('?').map_or(uri, |(path, _)| path);

        Self {
            method: match method {
                Method::Get => HttpMethod::Get,
                Method::Post => HttpMethod::Post,
                Method::Put => HttpMethod::Put,
                Method::Delete => HttpMethod::Delete,
                _ => HttpMethod::Other,
            },
            path: path.to_string(),
            authorization: req.header("Authorization").map(str::to_string),
            content_type: req.header("Content-Type").map(str::to_string),
            content_length: req.content_len().and_then(|len| len.try_into().ok()),
        }
    }

    fn request<'a>(&'a self, body: &'a [u8]) -> ApiRequest<'a> {
        ApiRequest {
            method: self.method,
            path: &self.path,
            authorization: self.authorization.as_deref(),
            content_type: self.content_type.as_deref(),
            body,
        }
    }
}

/// `None` when the declared body exceeds `max_body`; the body is then left
/// unread.
fn read_request_body(
    req: &mut Request<&mut EspHttpConnection<'_>>,
    max_body: usize,
) -> anyhow::Result<Option<Vec<u8>>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > max_body {
        return Ok(None);
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)
            .map_err(|err| anyhow!("failed to read request body: {err:?}"))?;
    }
    Ok(Some(body))
}

fn write_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: &ApiResponse,
) -> anyhow::Result<()> {
    let mut headers = vec![("Content-Type", response.content_type)];
    if let Some(challenge) = &response.challenge {
        headers.push(("WWW-Authenticate", challenge.as_str()));
    }

    req.into_response(response.status, None, &headers)?
        .write_all(&response.body)?;
    Ok(())
}

/// Request body as a chunk source. A body that ends before its declared
/// length counts as a dropped connection.
struct RequestBody<'r, R> {
    reader: &'r mut R,
    remaining: Option<usize>,
}

impl<R: Read> ChunkSource for RequestBody<'_, R> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        if self.remaining == Some(0) {
            return Ok(0);
        }

        let read = self
            .reader
            .read(buf)
            .map_err(|err| SourceError(format!("{err:?}")))?;

        match self.remaining.as_mut() {
            Some(remaining) if read == 0 => Err(SourceError(format!(
                "connection closed with {remaining} bytes outstanding"
            ))),
            Some(remaining) => {
                *remaining = remaining.saturating_sub(read);
                Ok(read)
            }
            None => Ok(read),
        }
    }
}

fn schedule_post_action(action: PostAction, store: ConfigStore, delay: Duration) {
    info!("{action:?} scheduled in {delay:?}");
    thread::Builder::new()
        .name("post-action".into())
        .stack_size(POST_ACTION_STACK_SIZE)
        .spawn(move || {
            thread::sleep(delay);
            if action == PostAction::ResetProvisioning {
                if let Err(err) = store.clear_namespace(NS_WIFI) {
                    warn!("failed to clear wifi credentials: {err}");
                }
                let rc = unsafe { esp_idf_svc::sys::esp_wifi_restore() };
                if rc != ESP_OK {
                    warn!("esp_wifi_restore failed: {}", esp_err_name(rc));
                }
            }
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .expect("failed to spawn restart thread");
}

/// Joins the stored network when one is configured. Without credentials, or
/// once the join attempts run out, a setup access point keeps the API
/// reachable.
fn start_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    station: &StationCredentials,
) -> anyhow::Result<WifiLink> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let joined = !station.ssid.is_empty() && join_station(&mut wifi, station)?;
    if !joined {
        wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
            ssid: SETUP_AP_SSID
                .try_into()
                .map_err(|_| anyhow!("setup AP ssid too long"))?,
            password: SETUP_AP_PASSWORD
                .try_into()
                .map_err(|_| anyhow!("setup AP password too long"))?,
            auth_method: AuthMethod::WPA2Personal,
            ..Default::default()
        }))?;
        wifi.start()?;
        wifi.wait_netif_up()?;
    }
    drop(wifi);

    let (ssid, ip) = if joined {
        (station.ssid.clone(), esp_wifi.sta_netif().get_ip_info()?.ip)
    } else {
        warn!("no station link; serving on setup AP `{SETUP_AP_SSID}`");
        (SETUP_AP_SSID.to_string(), esp_wifi.ap_netif().get_ip_info()?.ip)
    };
    info!("network up: ssid=`{ssid}`, ip {ip}");

    Ok(WifiLink {
        wifi: esp_wifi,
        ssid,
        ip: ip.to_string(),
    })
}

fn join_station(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    station: &StationCredentials,
) -> anyhow::Result<bool> {
    let auth_method = if station.pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: station
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("stored ssid too long"))?,
        password: station
            .pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("stored wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;

    for attempt in 1..=WIFI_JOIN_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => return Ok(true),
            Err(err) => {
                warn!(
                    "join `{}` attempt {attempt}/{WIFI_JOIN_ATTEMPTS}: {err}",
                    station.ssid
                );
                let _ = wifi.disconnect();
                thread::sleep(WIFI_RETRY_DELAY);
            }
        }
    }

    wifi.stop()?;
    Ok(false)
}

/// Reads the sensor and AP client count into the state store and drives the
/// relay from the commanded state.
fn spawn_sampler(
    state: StateStore,
    mut sensor: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
    mut relay: PinDriver<'static, AnyOutputPin, Output>,
    ip: String,
) {
    thread::Builder::new()
        .name("sampler".into())
        .spawn(move || {
            let mut relay_applied = None;
            loop {
                let reading = match sensor.read_raw() {
                    Ok(raw) => raw.min(SENSOR_MAX),
                    Err(err) => {
                        warn!("sensor read failed: {err}");
                        0
                    }
                };
                let clients = connected_clients();
                state.update(|device| {
                    device.sensor_value = reading;
                    device.wifi_clients = clients;
                    device.ip_address.clone_from(&ip);
                });

                if let Some(snapshot) = state.read() {
                    if relay_applied != Some(snapshot.relay_state) {
                        let applied = if snapshot.relay_state {
                            relay.set_high()
                        } else {
                            relay.set_low()
                        };
                        match applied {
                            Ok(()) => relay_applied = Some(snapshot.relay_state),
                            Err(err) => warn!("relay output failed: {err}"),
                        }
                    }
                }

                thread::sleep(SAMPLE_INTERVAL);
            }
        })
        .expect("failed to spawn sampler thread");
}

fn connected_clients() -> u32 {
    let mut list = esp_idf_svc::sys::wifi_sta_list_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_ap_get_sta_list(&mut list) };
    if rc == ESP_OK {
        u32::try_from(list.num).unwrap_or(0)
    } else {
        0
    }
}

fn esp_err_name(rc: esp_err_t) -> String {
    EspError::from(rc).map_or_else(|| format!("esp_err_t={rc}"), |err| err.to_string())
}

fn nvs_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl NvsStore {
    fn open(&self, namespace: &str) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), namespace, true).map_err(nvs_error)
    }
}

impl NamespaceStore for NvsStore {
    fn read(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let _guard = lock(&self.lock);
        let nvs = self.open(namespace)?;
        let mut buffer = [0_u8; MAX_NVS_STR_LEN];

        // A key stored as u32 fails the string lookup.
        if let Ok(Some(value)) = nvs.get_str(key, &mut buffer) {
            return Ok(Some(StoredValue::Str(value.to_string())));
        }
        Ok(nvs.get_u32(key).map_err(nvs_error)?.map(StoredValue::U32))
    }

    fn write_all(
        &self,
        namespace: &str,
        entries: &[(&str, StoredValue)],
    ) -> Result<(), StoreError> {
        let _guard = lock(&self.lock);
        let mut nvs = self.open(namespace)?;
        for (key, value) in entries {
            let written = match value {
                StoredValue::Str(text) => nvs.set_str(key, text),
                StoredValue::U32(number) => nvs.set_u32(key, *number),
            };
            written.map_err(nvs_error)?;
        }
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        let _guard = lock(&self.lock);
        let name = CString::new(namespace).map_err(nvs_error)?;
        let mut handle: esp_idf_svc::sys::nvs_handle_t = 0;

        let rc = unsafe {
            esp_idf_svc::sys::nvs_open(
                name.as_ptr(),
                esp_idf_svc::sys::nvs_open_mode_t_NVS_READWRITE,
                &mut handle,
            )
        };
        if rc != ESP_OK {
            return Err(nvs_error(esp_err_name(rc)));
        }

        let mut rc = unsafe { esp_idf_svc::sys::nvs_erase_all(handle) };
        if rc == ESP_OK {
            rc = unsafe { esp_idf_svc::sys::nvs_commit(handle) };
        }
        unsafe { esp_idf_svc::sys::nvs_close(handle) };

        if rc == ESP_OK {
            info!("NVS namespace `{namespace}` erased");
            Ok(())
        } else {
            Err(nvs_error(esp_err_name(rc)))
        }
    }
}

fn driver_error(err: EspError) -> HardwareError {
    HardwareError::Driver(err.to_string())
}

struct LedcDimmer {
    channel: LedcDriver<'static>,
}

impl DutyOutput for LedcDimmer {
    fn set_duty(&mut self, duty: u8) -> Result<(), HardwareError> {
        let scaled = u32::from(duty) * self.channel.get_max_duty() / u32::from(u8::MAX);
        self.channel.set_duty(scaled).map_err(driver_error)
    }
}

/// The 50 Hz channel is only configured on the first servo command.
struct LedcServo {
    pending: Option<(CHANNEL1, TIMER1, AnyOutputPin)>,
    channel: Option<LedcDriver<'static>>,
}

impl ServoOutput for LedcServo {
    fn attach(&mut self) -> Result<(), HardwareError> {
        if self.channel.is_some() {
            return Ok(());
        }
        let (channel, timer, pin) = self
            .pending
            .take()
            .ok_or_else(|| HardwareError::Driver("servo peripherals unavailable".to_string()))?;

        let timer = LedcTimerDriver::new(
            timer,
            &TimerConfig::new()
                .frequency(Hertz(SERVO_FREQ_HZ))
                .resolution(Resolution::Bits14),
        )
        .map_err(driver_error)?;
        self.channel = Some(LedcDriver::new(channel, timer, pin).map_err(driver_error)?);
        info!("servo attached at {SERVO_FREQ_HZ} Hz");
        Ok(())
    }

    fn write_angle(&mut self, angle: u8) -> Result<(), HardwareError> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| HardwareError::Driver("servo not attached".to_string()))?;

        let pulse_us = SERVO_MIN_PULSE_US
            + u32::from(angle) * (SERVO_MAX_PULSE_US - SERVO_MIN_PULSE_US) / 180;
        let duty = pulse_us * channel.get_max_duty() / SERVO_PERIOD_US;
        channel.set_duty(duty).map_err(driver_error)
    }
}

struct EspI2cBus {
    driver: I2cDriver<'static>,
}

impl I2cBus for EspI2cBus {
    fn probe(&mut self, address: u8) -> bool {
        self.driver
            .write(address, &[], TickType::new_millis(I2C_PROBE_TIMEOUT_MS).ticks())
            .is_ok()
    }
}

struct EspPlatform {
    ssid: String,
    ip: String,
}

impl EspPlatform {
    fn ap_record() -> Option<esp_idf_svc::sys::wifi_ap_record_t> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == ESP_OK).then_some(ap_info)
    }
}

impl Platform for EspPlatform {
    fn free_heap(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
    }

    fn uptime_ms(&self) -> u64 {
        let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        u64::try_from(micros / 1_000).unwrap_or(0)
    }

    fn rssi(&self) -> i32 {
        Self::ap_record().map_or(0, |ap| i32::from(ap.rssi))
    }

    fn network_info(&self) -> NetworkInfo {
        let ap = Self::ap_record();
        let mut mac = [0_u8; 6];
        let rc = unsafe {
            esp_idf_svc::sys::esp_wifi_get_mac(
                esp_idf_svc::sys::wifi_interface_t_WIFI_IF_STA,
                mac.as_mut_ptr(),
            )
        };
        if rc != ESP_OK {
            warn!("esp_wifi_get_mac failed: {}", esp_err_name(rc));
        }

        NetworkInfo {
            ssid: self.ssid.clone(),
            ip: self.ip.clone(),
            mac: mac
                .iter()
                .map(|byte| format!("{byte:02X}"))
                .collect::<Vec<_>>()
                .join(":"),
            rssi: ap.as_ref().map_or(0, |ap| i32::from(ap.rssi)),
            channel: ap.map_or(0, |ap| ap.primary),
        }
    }

    fn firmware_info(&self) -> FirmwareInfo {
        let partition_size = |partition: *const esp_idf_svc::sys::esp_partition_t| {
            if partition.is_null() {
                0
            } else {
                unsafe { (*partition).size }
            }
        };
        let sdk_version = unsafe { CStr::from_ptr(esp_idf_svc::sys::esp_get_idf_version()) }
            .to_string_lossy()
            .into_owned();

        FirmwareInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_date: env!("MULTITOOL_BUILD_DATE").to_string(),
            sketch_size: partition_size(unsafe {
                esp_idf_svc::sys::esp_ota_get_running_partition()
            }),
            free_space: partition_size(unsafe {
                esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null())
            }),
            sdk_version,
            cpu_freq_mhz: unsafe { esp_idf_svc::sys::ets_get_cpu_frequency() },
        }
    }
}

/// OTA partition writer over the raw `esp_ota_*` API. Only the update
/// handle is kept between calls.
#[derive(Default)]
struct EspFlash {
    handle: Option<esp_idf_svc::sys::esp_ota_handle_t>,
}

impl FlashUpdate for EspFlash {
    fn begin(&mut self) -> Result<(), OtaError> {
        let partition =
            unsafe { esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null()) };
        if partition.is_null() {
            return Err(OtaError::Begin("no OTA update partition".to_string()));
        }

        let mut handle: esp_idf_svc::sys::esp_ota_handle_t = 0;
        let rc = unsafe {
            esp_idf_svc::sys::esp_ota_begin(
                partition,
                esp_idf_svc::sys::OTA_SIZE_UNKNOWN as usize,
                &mut handle,
            )
        };
        if rc != ESP_OK {
            return Err(OtaError::Begin(esp_err_name(rc)));
        }

        self.handle = Some(handle);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> usize {
        let Some(handle) = self.handle else {
            return 0;
        };
        let rc = unsafe {
            esp_idf_svc::sys::esp_ota_write(handle, chunk.as_ptr().cast(), chunk.len())
        };
        if rc == ESP_OK {
            chunk.len()
        } else {
            warn!("esp_ota_write failed: {}", esp_err_name(rc));
            0
        }
    }

    fn end(&mut self) -> Result<(), OtaError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| OtaError::Finalize("no update in progress".to_string()))?;

        let rc = unsafe { esp_idf_svc::sys::esp_ota_end(handle) };
        if rc != ESP_OK {
            return Err(OtaError::Finalize(esp_err_name(rc)));
        }

        let partition =
            unsafe { esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null()) };
        let rc = unsafe { esp_idf_svc::sys::esp_ota_set_boot_partition(partition) };
        if rc != ESP_OK {
            return Err(OtaError::Finalize(esp_err_name(rc)));
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            let rc = unsafe { esp_idf_svc::sys::esp_ota_abort(handle) };
            if rc != ESP_OK {
                warn!("esp_ota_abort failed: {}", esp_err_name(rc));
            }
        }
    }
}
