use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{ErrorKind, Write},
    net::SocketAddr,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{Request, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex, Notify},
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use multitool_common::{
    state::SENSOR_MAX, well_known_device_name, ApiRequest, ApiResponse, ChunkSource,
    ConfigStore, ControllerConfig, Credentials, Dispatcher, DutyOutput, FirmwareInfo,
    FlashUpdate, HardwareError, HttpMethod, I2cBus, I2cScanner, NamespaceStore, NetworkInfo,
    OtaError, Peripherals, Platform, PostAction, PwmDimmer, ServoDriver, ServoOutput,
    SourceError, StateStore, StoreError, StoredValue, NS_WIFI, PATH_UPDATE,
};

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_I2C_DEVICES: &str = "0x3C,0x68";
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
const UPLOAD_QUEUE_DEPTH: usize = 8;
const SIMULATED_FREE_HEAP: u32 = 256 * 1024;
const SIMULATED_RSSI: i32 = -50;
const ESP_IMAGE_MAGIC: u8 = 0xE9;

type Namespaces = BTreeMap<String, BTreeMap<String, StoredValue>>;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Mutex<Dispatcher<FileFlash>>>,
    store: ConfigStore,
    restart: Arc<Notify>,
    restart_delay: Duration,
    max_body: usize,
}

#[derive(Debug)]
struct HostSettings {
    data_dir: PathBuf,
    http_port: u16,
    i2c_devices: Vec<u8>,
    web_dir: PathBuf,
}

impl HostSettings {
    fn from_env() -> Self {
        let data_dir = std::env::var("MULTITOOL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.multitool"));
        let http_port = std::env::var("MULTITOOL_HTTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_HTTP_PORT);
        let i2c_devices = parse_address_list(
            &std::env::var("MULTITOOL_I2C_DEVICES")
                .unwrap_or_else(|_| DEFAULT_I2C_DEVICES.to_string()),
        );
        let web_dir = std::env::var("MULTITOOL_WEB_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(format!("{}/web", env!("CARGO_MANIFEST_DIR"))));

        Self {
            data_dir,
            http_port,
            i2c_devices,
            web_dir,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    let config = ControllerConfig::default();

    let store = ConfigStore::new(Arc::new(JsonFileStore::new(
        settings.data_dir.join("config.json"),
    )));
    let credentials = store
        .load_credentials(Credentials::default())
        .unwrap_or_else(|err| {
            warn!("failed to load credentials from store: {err}");
            Credentials::default()
        });

    info!(
        "host config: data_dir=`{}`, port={}, simulated i2c devices={:02X?}, user=`{}`",
        settings.data_dir.display(),
        settings.http_port,
        settings.i2c_devices,
        credentials.web_username,
    );

    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let state = StateStore::new(Duration::from_millis(config.state_lock_timeout_ms));
    spawn_sampler(state.clone(), addr.ip().to_string());

    let peripherals = Peripherals {
        dimmer: PwmDimmer::new(Box::new(SimulatedDimmer)),
        servo: ServoDriver::new(Box::new(SimulatedServo)),
        scanner: Arc::new(I2cScanner::new(
            Box::new(SimulatedBus {
                acks: settings.i2c_devices.clone(),
            }),
            Box::new(well_known_device_name),
            Duration::from_millis(config.bus_lock_timeout_ms),
        )),
    };
    let platform = HostPlatform {
        started: Instant::now(),
        ip: addr.ip().to_string(),
    };

    let app_state = AppState {
        restart: Arc::new(Notify::new()),
        restart_delay: Duration::from_millis(config.restart_delay_ms),
        max_body: config.max_http_body,
        store: store.clone(),
        dispatcher: Arc::new(Mutex::new(Dispatcher::new(
            config,
            credentials,
            state,
            store,
            peripherals,
            Box::new(platform),
            FileFlash::new(settings.data_dir.clone()),
        ))),
    };
    let restart = app_state.restart.clone();

    let app = Router::new()
        .route(PATH_UPDATE, any(handle_update))
        .route("/api/{*path}", any(handle_api))
        .fallback_service(ServeDir::new(settings.web_dir))
        .with_state(app_state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind multitool server at {addr}"))?;

    info!("multitool listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("ctrl-c received, shutting down"),
                _ = restart.notified() => info!("restart requested; exiting for the supervisor to relaunch"),
            }
        })
        .await?;
    Ok(())
}

/// Owned copy of the request line and headers the dispatcher needs.
struct RequestHead {
    method: HttpMethod,
    path: String,
    authorization: Option<String>,
    content_type: Option<String>,
    content_length: Option<usize>,
}

impl RequestHead {
    fn from_parts(parts: &Parts) -> Self {
        let header_str = |name: header::HeaderName| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            method: HttpMethod::parse(parts.method.as_str()),
            path: parts.uri.path().to_string(),
            authorization: header_str(header::AUTHORIZATION),
            content_type: header_str(header::CONTENT_TYPE),
            content_length: header_str(header::CONTENT_LENGTH)
                .and_then(|value| value.parse::<usize>().ok()),
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

async fn handle_api(State(app): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let head = RequestHead::from_parts(&parts);

    let body = match axum::body::to_bytes(body, app.max_body).await {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            debug!("request body for {} not buffered: {err}", head.path);
            None
        }
    };

    let dispatcher = app.dispatcher.clone();
    let max_body = app.max_body;
    let result = tokio::task::spawn_blocking(move || {
        let mut dispatcher = dispatcher.blocking_lock();
        match body {
            Some(bytes) => dispatcher.handle(&head.request(&bytes)),
            None => {
                let size = head.content_length.unwrap_or(max_body + 1);
                dispatcher.handle_oversized(&head.request(&[]), size)
            }
        }
    })
    .await;

    match result {
        Ok(response) => finish(&app, response),
        Err(err) => {
            warn!("request handler task failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Firmware upload. The body is forwarded chunk by chunk to a blocking
/// worker that owns the dispatcher for the whole exchange.
async fn handle_update(State(app): State<AppState>, request: Request) -> Response {
    let (parts, mut body) = request.into_parts();
    let head = RequestHead::from_parts(&parts);
    let (tx, rx) = mpsc::channel(UPLOAD_QUEUE_DEPTH);

    let dispatcher = app.dispatcher.clone();
    let worker = tokio::task::spawn_blocking(move || {
        let mut source = ChannelSource {
            rx,
            pending: Bytes::new(),
        };
        let mut dispatcher = dispatcher.blocking_lock();
        dispatcher.handle_upload(&head.request(&[]), &mut source)
    });

    while let Some(frame) = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
        let item = match frame {
            Ok(frame) => match frame.into_data() {
                Ok(data) => Ok(data),
                Err(_trailers) => continue,
            },
            Err(err) => Err(SourceError(err.to_string())),
        };
        let failed = item.is_err();
        // A closed channel means the worker already answered, e.g. with 401.
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
    drop(tx);

    match worker.await {
        Ok(response) => finish(&app, response),
        Err(err) => {
            warn!("upload worker failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn finish(app: &AppState, response: ApiResponse) -> Response {
    if let Some(action) = response.after {
        schedule_post_action(app, action);
    }

    let mut builder = Response::builder()
        .status(response.status)
        .header(header::CONTENT_TYPE, response.content_type);
    if let Some(challenge) = &response.challenge {
        builder = builder.header(header::WWW_AUTHENTICATE, challenge.as_str());
    }

    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|err| {
            warn!("failed to build response: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Runs after the response had `restart_delay` to reach the client.
fn schedule_post_action(app: &AppState, action: PostAction) {
    let store = app.store.clone();
    let restart = app.restart.clone();
    let delay = app.restart_delay;

    info!("{action:?} scheduled in {delay:?}");
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if action == PostAction::ResetProvisioning {
            match store.clear_namespace(NS_WIFI) {
                Ok(()) => info!("wifi provisioning cleared"),
                Err(err) => warn!("failed to clear wifi provisioning: {err}"),
            }
        }
        restart.notify_one();
    });
}

struct ChannelSource {
    rx: mpsc::Receiver<Result<Bytes, SourceError>>,
    pending: Bytes,
}

impl ChunkSource for ChannelSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        while self.pending.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(bytes)) => self.pending = bytes,
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }

        let take = self.pending.len().min(buf.len());
        let chunk = self.pending.split_to(take);
        buf[..take].copy_from_slice(&chunk);
        Ok(take)
    }
}

/// One JSON document mapping namespace -> key -> value, rewritten through a
/// temp file on every namespace write.
struct JsonFileStore {
    path: PathBuf,
    lock: StdMutex<()>,
}

impl JsonFileStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: StdMutex::new(()),
        }
    }

    fn load(&self) -> Result<Namespaces, StoreError> {
        match fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(backend_error),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Namespaces::new()),
            Err(err) => Err(backend_error(err)),
        }
    }

    fn persist(&self, namespaces: &Namespaces) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(backend_error)?;
        }
        let payload = serde_json::to_vec_pretty(namespaces).map_err(backend_error)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, payload).map_err(backend_error)?;
        fs::rename(&staging, &self.path).map_err(backend_error)
    }
}

impl NamespaceStore for JsonFileStore {
    fn read(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let namespaces = self.load()?;
        Ok(namespaces
            .get(namespace)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn write_all(
        &self,
        namespace: &str,
        entries: &[(&str, StoredValue)],
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut namespaces = self.load()?;
        let target = namespaces.entry(namespace.to_string()).or_default();
        for (key, value) in entries {
            target.insert((*key).to_string(), value.clone());
        }
        self.persist(&namespaces)
    }

    fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut namespaces = self.load()?;
        if namespaces.remove(namespace).is_some() {
            self.persist(&namespaces)?;
        }
        Ok(())
    }
}

fn backend_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

struct SimulatedDimmer;

impl DutyOutput for SimulatedDimmer {
    fn set_duty(&mut self, duty: u8) -> Result<(), HardwareError> {
        debug!("dimmer duty -> {duty}/255");
        Ok(())
    }
}

struct SimulatedServo;

impl ServoOutput for SimulatedServo {
    fn attach(&mut self) -> Result<(), HardwareError> {
        info!("simulated servo attached");
        Ok(())
    }

    fn write_angle(&mut self, angle: u8) -> Result<(), HardwareError> {
        debug!("servo angle -> {angle}");
        Ok(())
    }
}

struct SimulatedBus {
    acks: Vec<u8>,
}

impl I2cBus for SimulatedBus {
    fn probe(&mut self, address: u8) -> bool {
        self.acks.contains(&address)
    }
}

struct HostPlatform {
    started: Instant,
    ip: String,
}

impl Platform for HostPlatform {
    fn free_heap(&self) -> u32 {
        SIMULATED_FREE_HEAP
    }

    fn uptime_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn rssi(&self) -> i32 {
        SIMULATED_RSSI
    }

    fn network_info(&self) -> NetworkInfo {
        NetworkInfo {
            ssid: "host".to_string(),
            ip: self.ip.clone(),
            mac: "00:00:00:00:00:00".to_string(),
            rssi: SIMULATED_RSSI,
            channel: 0,
        }
    }

    fn firmware_info(&self) -> FirmwareInfo {
        let sketch_size = std::env::current_exe()
            .and_then(fs::metadata)
            .map(|meta| u32::try_from(meta.len()).unwrap_or(u32::MAX))
            .unwrap_or(0);

        FirmwareInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_date: env!("MULTITOOL_BUILD_DATE").to_string(),
            sketch_size,
            free_space: 0,
            sdk_version: "host".to_string(),
            cpu_freq_mhz: 0,
        }
    }
}

/// Writes uploads to `<data_dir>/firmware.bin.part` and promotes them to
/// `firmware.bin` once the image header checks out.
struct FileFlash {
    dir: PathBuf,
    file: Option<File>,
    first_byte: Option<u8>,
}

impl FileFlash {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            file: None,
            first_byte: None,
        }
    }

    fn staging_path(&self) -> PathBuf {
        self.dir.join("firmware.bin.part")
    }

    fn image_path(&self) -> PathBuf {
        self.dir.join("firmware.bin")
    }
}

impl FlashUpdate for FileFlash {
    fn begin(&mut self) -> Result<(), OtaError> {
        fs::create_dir_all(&self.dir).map_err(|err| OtaError::Begin(err.to_string()))?;
        let file =
            File::create(self.staging_path()).map_err(|err| OtaError::Begin(err.to_string()))?;
        self.file = Some(file);
        self.first_byte = None;
        info!("staging firmware at `{}`", self.staging_path().display());
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> usize {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        match file.write_all(chunk) {
            Ok(()) => {
                if self.first_byte.is_none() {
                    self.first_byte = chunk.first().copied();
                }
                chunk.len()
            }
            Err(err) => {
                warn!("firmware staging write failed: {err}");
                0
            }
        }
    }

    fn end(&mut self) -> Result<(), OtaError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| OtaError::Finalize("no image open".to_string()))?;
        file.sync_all()
            .map_err(|err| OtaError::Finalize(err.to_string()))?;
        drop(file);

        if self.first_byte != Some(ESP_IMAGE_MAGIC) {
            let _ = fs::remove_file(self.staging_path());
            return Err(OtaError::Finalize(format!(
                "invalid image magic byte (expected 0x{ESP_IMAGE_MAGIC:02X})"
            )));
        }

        fs::rename(self.staging_path(), self.image_path())
            .map_err(|err| OtaError::Finalize(err.to_string()))?;
        info!("firmware image stored at `{}`", self.image_path().display());
        Ok(())
    }

    fn abort(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(self.staging_path());
        }
    }
}

/// Stands in for the hardware sampling task: publishes a synthetic ADC
/// reading and applies the commanded relay state.
fn spawn_sampler(state: StateStore, ip: String) {
    thread::Builder::new()
        .name("sampler".into())
        .spawn(move || {
            let started = Instant::now();
            let mut relay_applied = None;
            loop {
                let sensor = simulated_sensor(started.elapsed());
                state.update(|device| {
                    device.sensor_value = sensor;
                    device.wifi_clients = 0;
                    device.ip_address.clone_from(&ip);
                });

                if let Some(snapshot) = state.read() {
                    if relay_applied != Some(snapshot.relay_state) {
                        info!(
                            "relay output -> {}",
                            if snapshot.relay_state { "ON" } else { "OFF" }
                        );
                        relay_applied = Some(snapshot.relay_state);
                    }
                }

                thread::sleep(SAMPLE_INTERVAL);
            }
        })
        .expect("failed to spawn sampler thread");
}

/// Triangle wave spanning the full 12-bit range every ~80 s.
fn simulated_sensor(elapsed: Duration) -> u16 {
    let period = 2 * u128::from(SENSOR_MAX);
    let phase = ((elapsed.as_millis() / 10) % period) as u16;
    if phase > SENSOR_MAX {
        2 * SENSOR_MAX - phase
    } else {
        phase
    }
}

fn parse_address_list(raw: &str) -> Vec<u8> {
    let mut addresses: Vec<u8> = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| {
            let parsed = match item.strip_prefix("0x").or_else(|| item.strip_prefix("0X")) {
                Some(hex) => u8::from_str_radix(hex, 16),
                None => item.parse::<u8>(),
            };
            match parsed {
                Ok(address) if (1..=126).contains(&address) => Some(address),
                _ => {
                    warn!("ignoring simulated i2c address `{item}`");
                    None
                }
            }
        })
        .collect();
    addresses.sort_unstable();
    addresses.dedup();
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn address_list_accepts_hex_and_decimal() {
        assert_eq!(parse_address_list("0x68, 60,0x3c"), vec![0x3C, 0x68]);
        assert_eq!(parse_address_list("0x00,0x7F,zz"), Vec::<u8>::new());
    }

    #[test]
    fn simulated_sensor_stays_in_adc_range() {
        for ms in (0..200_000).step_by(997) {
            assert!(simulated_sensor(Duration::from_millis(ms)) <= SENSOR_MAX);
        }
    }

    #[test]
    fn file_store_round_trips_namespaces() {
        let dir = std::env::temp_dir().join(format!("multitool-store-{}", std::process::id()));
        let store = JsonFileStore::new(dir.join("config.json"));

        store
            .write_all("mqtt", &[("port", StoredValue::U32(1883))])
            .unwrap();
        store
            .write_all("wifi", &[("ssid", StoredValue::Str("lab".to_string()))])
            .unwrap();
        store.clear("wifi").unwrap();

        assert_eq!(store.read("mqtt", "port").unwrap(), Some(StoredValue::U32(1883)));
        assert_eq!(store.read("wifi", "ssid").unwrap(), None);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn file_flash_rejects_image_without_magic_byte() {
        let dir = std::env::temp_dir().join(format!("multitool-flash-{}", std::process::id()));
        let mut flash = FileFlash::new(dir.clone());

        flash.begin().unwrap();
        assert_eq!(flash.write(b"MZ-not-firmware"), 15);
        assert!(matches!(flash.end(), Err(OtaError::Finalize(_))));
        assert!(!flash.image_path().exists());

        flash.begin().unwrap();
        flash.write(&[ESP_IMAGE_MAGIC, 0x01, 0x02]);
        flash.end().unwrap();
        assert!(flash.image_path().exists());
        let _ = fs::remove_dir_all(dir);
    }
}
