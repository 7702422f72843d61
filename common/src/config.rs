pub const PWM_MAX_PERCENT: i64 = 100;
pub const SERVO_MAX_ANGLE: i64 = 180;
pub const SERVO_DEFAULT_ANGLE: u8 = 90;
pub const MIN_PASSWORD_LEN: usize = 8;

pub const DEFAULT_MQTT_SERVER: &str = "broker.hivemq.com";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_CLIENT_ID: &str = "ESP32_Multitool";

pub const AUTH_REALM: &str = "ESP32 Multitool";

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub state_lock_timeout_ms: u64,
    pub bus_lock_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub control_body_limit: usize,
    pub settings_body_limit: usize,
    pub upload_chunk_size: usize,
    pub max_http_body: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_lock_timeout_ms: 100,
            bus_lock_timeout_ms: 500,
            restart_delay_ms: 1_000,
            control_body_limit: 128,
            settings_body_limit: 512,
            upload_chunk_size: 4_096,
            max_http_body: 4_096,
        }
    }
}

/// Runtime credential mirror. The username is compiled in; both passwords are
/// overlaid from the `auth` namespace at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub web_username: String,
    pub web_password: String,
    pub ota_password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            web_username: "admin".to_string(),
            web_password: "multitool".to_string(),
            ota_password: "multitool-ota".to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("web_username", &self.web_username)
            .field("web_password", &"<redacted>")
            .field("ota_password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub server: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_MQTT_SERVER.to_string(),
            port: DEFAULT_MQTT_PORT,
            client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareConfig {
    pub relay_pin: i32,
    pub dimmer_pin: i32,
    pub dimmer_freq_hz: u32,
    pub servo_pin: i32,
    pub sensor_pin: i32,
    pub i2c_sda_pin: i32,
    pub i2c_scl_pin: i32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relay_pin: 26,
            dimmer_pin: 25,
            dimmer_freq_hz: 5_000,
            servo_pin: 13,
            sensor_pin: 34,
            i2c_sda_pin: 21,
            i2c_scl_pin: 22,
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        for (pin, fallback) in [
            (&mut self.relay_pin, defaults.relay_pin),
            (&mut self.dimmer_pin, defaults.dimmer_pin),
            (&mut self.servo_pin, defaults.servo_pin),
            (&mut self.sensor_pin, defaults.sensor_pin),
            (&mut self.i2c_sda_pin, defaults.i2c_sda_pin),
            (&mut self.i2c_scl_pin, defaults.i2c_scl_pin),
        ] {
            if !(0..=48).contains(pin) {
                *pin = fallback;
            }
        }

        self.dimmer_freq_hz = self.dimmer_freq_hz.clamp(100, 40_000);
    }
}

pub fn clamp_pwm_percent(value: i64) -> u8 {
    value.clamp(0, PWM_MAX_PERCENT) as u8
}

pub fn clamp_servo_angle(angle: i64) -> u8 {
    angle.clamp(0, SERVO_MAX_ANGLE) as u8
}
