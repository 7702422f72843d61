use std::sync::Arc;

use log::{info, warn};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    actuators::{I2cScanner, PwmDimmer, ServoDriver},
    auth::{constant_time_eq, is_authorized},
    config::{
        clamp_pwm_percent, clamp_servo_angle, ControllerConfig, Credentials, MqttConfig,
        AUTH_REALM, MIN_PASSWORD_LEN,
    },
    error::{HardwareError, StoreError},
    ota::{FlashUpdate, OtaOutcome, OtaSession},
    routes::*,
    state::StateStore,
    store::ConfigStore,
    types::{
        ErrorBody, FirmwareInfo, MqttUpdate, NetworkInfo, PasswordUpdate, PwmCommand,
        RelayCommand, ScanPayload, ServoCommand, StatusAck, StatusPayload,
    },
    upload::{stream_upload, ChunkSource, SliceSource},
};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Other,
}

impl HttpMethod {
    pub fn parse(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ApiRequest<'a> {
    pub method: HttpMethod,
    pub path: &'a str,
    pub authorization: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// Work the HTTP binding performs once the response has been flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    Restart,
    /// Forget WiFi station credentials, then restart.
    ResetProvisioning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    /// `WWW-Authenticate` value, set only on authentication failures.
    pub challenge: Option<String>,
    pub after: Option<PostAction>,
}

impl ApiResponse {
    pub fn json<T: Serialize>(status: u16, payload: &T) -> Self {
        match serde_json::to_vec(payload) {
            Ok(body) => Self {
                status,
                content_type: CONTENT_TYPE_JSON,
                body,
                challenge: None,
                after: None,
            },
            Err(err) => {
                warn!("failed to encode response: {err}");
                Self::text(500, "Internal Server Error")
            }
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_TEXT,
            body: body.into().into_bytes(),
            challenge: None,
            after: None,
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, &ErrorBody { error: message })
    }

    fn followed_by(mut self, action: PostAction) -> Self {
        self.after = Some(action);
        self
    }

    pub fn body_text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("not found")]
    NotFound,
    #[error("payload too large: {size} > {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("current password incorrect")]
    CurrentPasswordMismatch,
    #[error("password shorter than {min} characters", min = MIN_PASSWORD_LEN)]
    PasswordTooShort,
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl ApiError {
    pub fn into_response(self) -> ApiResponse {
        match self {
            Self::Unauthorized => ApiResponse {
                challenge: Some(format!("Basic realm=\"{AUTH_REALM}\"")),
                ..ApiResponse::text(401, "Unauthorized")
            },
            Self::MethodNotAllowed => ApiResponse::text(405, "Method Not Allowed"),
            Self::NotFound => ApiResponse::error(404, "Not found"),
            Self::PayloadTooLarge { .. } => ApiResponse::error(400, "Payload too large"),
            Self::MalformedPayload(_) => ApiResponse::error(400, "Invalid JSON"),
            Self::CurrentPasswordMismatch => ApiResponse::error(401, "Current password incorrect"),
            Self::PasswordTooShort => {
                ApiResponse::error(400, "Passwords must be at least 8 characters")
            }
            Self::Persistence(err) => ApiResponse::error(500, &err.to_string()),
            Self::Hardware(err) => ApiResponse::error(500, &err.to_string()),
        }
    }
}

/// Device facts that only the running platform knows.
pub trait Platform: Send {
    fn free_heap(&self) -> u32;
    fn uptime_ms(&self) -> u64;
    fn rssi(&self) -> i32;
    fn network_info(&self) -> NetworkInfo;
    fn firmware_info(&self) -> FirmwareInfo;
}

pub struct Peripherals {
    pub dimmer: PwmDimmer,
    pub servo: ServoDriver,
    pub scanner: Arc<I2cScanner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Status,
    Relay,
    Pwm,
    Servo,
    I2cScan,
    Password,
    Mqtt,
    Network,
    Firmware,
    WifiReset,
    Reboot,
    Update,
}

impl Endpoint {
    fn from_path(path: &str) -> Option<Self> {
        let endpoint = match path {
            PATH_STATUS => Self::Status,
            PATH_RELAY => Self::Relay,
            PATH_PWM => Self::Pwm,
            PATH_SERVO => Self::Servo,
            PATH_I2C_SCAN => Self::I2cScan,
            PATH_PASSWORD => Self::Password,
            PATH_MQTT => Self::Mqtt,
            PATH_NETWORK => Self::Network,
            PATH_FIRMWARE => Self::Firmware,
            PATH_WIFI_RESET => Self::WifiReset,
            PATH_REBOOT => Self::Reboot,
            PATH_UPDATE => Self::Update,
            _ => return None,
        };
        Some(endpoint)
    }

    fn method(self) -> HttpMethod {
        match self {
            Self::Status | Self::I2cScan | Self::Network | Self::Firmware => HttpMethod::Get,
            _ => HttpMethod::Post,
        }
    }
}

/// Routes authenticated requests to the state store, the configuration
/// store, the actuators and the OTA session. Requests are handled one at a
/// time; callers hold the dispatcher behind a single lock.
pub struct Dispatcher<F: FlashUpdate> {
    config: ControllerConfig,
    credentials: Credentials,
    state: StateStore,
    store: ConfigStore,
    peripherals: Peripherals,
    platform: Box<dyn Platform>,
    ota: OtaSession<F>,
}

impl<F: FlashUpdate> Dispatcher<F> {
    pub fn new(
        config: ControllerConfig,
        credentials: Credentials,
        state: StateStore,
        store: ConfigStore,
        peripherals: Peripherals,
        platform: Box<dyn Platform>,
        flash: F,
    ) -> Self {
        Self {
            config,
            credentials,
            state,
            store,
            peripherals,
            platform,
            ota: OtaSession::new(flash),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn ota_session(&self) -> &OtaSession<F> {
        &self.ota
    }

    /// Handles a request whose body is already in memory.
    pub fn handle(&mut self, request: &ApiRequest<'_>) -> ApiResponse {
        if is_upload_path(request.path) {
            let mut source = SliceSource::new(request.body, self.config.upload_chunk_size);
            return self.handle_upload(request, &mut source);
        }

        match self.route(request) {
            Ok(response) => response,
            Err(err) => {
                info!("{} {} rejected: {err}", method_label(request.method), request.path);
                err.into_response()
            }
        }
    }

    /// Streams the firmware body from `source`. Credentials are checked once
    /// for the whole exchange.
    pub fn handle_upload(
        &mut self,
        request: &ApiRequest<'_>,
        source: &mut dyn ChunkSource,
    ) -> ApiResponse {
        if let Err(err) = self.authorize(request.authorization) {
            return err.into_response();
        }
        if request.method != HttpMethod::Post {
            return ApiError::MethodNotAllowed.into_response();
        }

        let outcome = stream_upload(
            &mut self.ota,
            source,
            request.content_type,
            self.config.upload_chunk_size,
        );
        match outcome {
            OtaOutcome::Complete { bytes_written, .. } => {
                info!("ota: {bytes_written} bytes accepted, restart scheduled");
                ApiResponse::text(200, "Update OK - Rebooting...").followed_by(PostAction::Restart)
            }
            OtaOutcome::Failed(err) => ApiResponse::text(500, format!("Update Failed: {err}")),
        }
    }

    /// Answers a request whose body the binding refused to buffer. The usual
    /// authentication, routing and method checks still come first.
    pub fn handle_oversized(&self, request: &ApiRequest<'_>, size: usize) -> ApiResponse {
        let limit = self.config.max_http_body;
        match self.admit(request) {
            Ok(_) => ApiError::PayloadTooLarge { size, limit }.into_response(),
            Err(err) => err.into_response(),
        }
    }

    fn admit(&self, request: &ApiRequest<'_>) -> Result<Endpoint, ApiError> {
        self.authorize(request.authorization)?;

        let endpoint = Endpoint::from_path(request.path).ok_or(ApiError::NotFound)?;
        if request.method != endpoint.method() {
            return Err(ApiError::MethodNotAllowed);
        }
        Ok(endpoint)
    }

    fn route(&mut self, request: &ApiRequest<'_>) -> Result<ApiResponse, ApiError> {
        let endpoint = self.admit(request)?;

        let control_limit = self.config.control_body_limit;
        let settings_limit = self.config.settings_body_limit;

        match endpoint {
            Endpoint::Status => Ok(ApiResponse::json(200, &self.status())),
            Endpoint::Relay => {
                let command: RelayCommand = decode(request.body, control_limit)?;
                self.state.update(|state| state.relay_state = command.state);
                info!("relay -> {}", command.state);
                Ok(ApiResponse::json(200, &StatusAck::OK))
            }
            Endpoint::Pwm => {
                let command: PwmCommand = decode(request.body, control_limit)?;
                let percent = clamp_pwm_percent(command.value);
                let duty = self.peripherals.dimmer.set_percent(percent)?;
                self.state.update(|state| state.pwm_value = percent);
                info!("pwm -> {percent}% (duty {duty})");
                Ok(ApiResponse::json(200, &StatusAck::OK))
            }
            Endpoint::Servo => {
                let command: ServoCommand = decode(request.body, control_limit)?;
                let angle = clamp_servo_angle(command.angle);
                self.peripherals.servo.set_angle(angle)?;
                self.state.update(|state| state.servo_angle = angle);
                info!("servo -> {angle} deg");
                Ok(ApiResponse::json(200, &StatusAck::OK))
            }
            Endpoint::I2cScan => {
                let devices = self.peripherals.scanner.scan();
                Ok(ApiResponse::json(200, &ScanPayload { devices }))
            }
            Endpoint::Password => {
                let update: PasswordUpdate = decode(request.body, settings_limit)?;
                self.update_password(update)?;
                Ok(ApiResponse::json(200, &StatusAck::OK))
            }
            Endpoint::Mqtt => {
                let update: MqttUpdate = decode(request.body, settings_limit)?;
                self.store.save_mqtt(&mqtt_with_defaults(update))?;
                Ok(ApiResponse::json(200, &StatusAck::OK))
            }
            Endpoint::Network => Ok(ApiResponse::json(200, &self.platform.network_info())),
            Endpoint::Firmware => Ok(ApiResponse::json(200, &self.platform.firmware_info())),
            Endpoint::WifiReset => {
                info!("wifi reset requested");
                Ok(ApiResponse::json(200, &StatusAck::RESETTING).followed_by(PostAction::ResetProvisioning))
            }
            Endpoint::Reboot => {
                info!("reboot requested");
                Ok(ApiResponse::json(200, &StatusAck::REBOOTING).followed_by(PostAction::Restart))
            }
            // Routed through `handle_upload` before we get here.
            Endpoint::Update => Err(ApiError::MethodNotAllowed),
        }
    }

    fn authorize(&self, authorization: Option<&str>) -> Result<(), ApiError> {
        if is_authorized(authorization, &self.credentials) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    fn status(&self) -> StatusPayload {
        let snapshot = self.state.read();
        StatusPayload {
            relay: snapshot.as_ref().map(|state| state.relay_state),
            sensor: snapshot.as_ref().map(|state| state.sensor_value),
            clients: snapshot.as_ref().map(|state| state.wifi_clients),
            ip: snapshot.map(|state| state.ip_address),
            heap: self.platform.free_heap(),
            uptime: self.platform.uptime_ms(),
            rssi: self.platform.rssi(),
            pwm: self.peripherals.dimmer.percent(),
            servo: self.peripherals.servo.angle(),
        }
    }

    /// Durable store first, runtime mirror second; nothing changes unless
    /// every precondition holds.
    fn update_password(&mut self, update: PasswordUpdate) -> Result<(), ApiError> {
        if !constant_time_eq(
            update.current.as_bytes(),
            self.credentials.web_password.as_bytes(),
        ) {
            return Err(ApiError::CurrentPasswordMismatch);
        }
        if update.new_password.chars().count() < MIN_PASSWORD_LEN
            || update.ota_password.chars().count() < MIN_PASSWORD_LEN
        {
            return Err(ApiError::PasswordTooShort);
        }

        self.store
            .save_auth(&update.new_password, &update.ota_password)?;
        self.credentials.web_password = update.new_password;
        self.credentials.ota_password = update.ota_password;
        info!("credentials rotated");
        Ok(())
    }
}

/// Firmware uploads bypass body buffering and go to [`Dispatcher::handle_upload`].
pub fn is_upload_path(path: &str) -> bool {
    path == PATH_UPDATE
}

fn decode<T: DeserializeOwned>(body: &[u8], limit: usize) -> Result<T, ApiError> {
    if body.len() > limit {
        return Err(ApiError::PayloadTooLarge {
            size: body.len(),
            limit,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

fn mqtt_with_defaults(update: MqttUpdate) -> MqttConfig {
    let defaults = MqttConfig::default();
    MqttConfig {
        server: update.server.unwrap_or(defaults.server),
        port: update.port.unwrap_or(defaults.port),
        client_id: update.client.unwrap_or(defaults.client_id),
        username: update.user.unwrap_or(defaults.username),
        password: update.pass.unwrap_or(defaults.password),
    }
}

fn method_label(method: HttpMethod) -> &'static str {
    match method {
        HttpMethod::Get => "GET",
        HttpMethod::Post => "POST",
        HttpMethod::Put => "PUT",
        HttpMethod::Delete => "DELETE",
        HttpMethod::Other => "?",
    }
}
