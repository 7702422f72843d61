use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

use crate::{actuators::I2cDeviceRecord, config::SERVO_DEFAULT_ANGLE};

/// `GET /api/status`. State-sourced fields vanish when the state lock
/// could not be taken in time; the platform and adapter fields never do.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub heap: u32,
    pub uptime: u64,
    pub rssi: i32,
    pub pwm: u8,
    pub servo: u8,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NetworkInfo {
    pub ssid: String,
    pub ip: String,
    pub mac: String,
    pub rssi: i32,
    pub channel: u8,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub version: String,
    #[serde(rename = "buildDate")]
    pub build_date: String,
    #[serde(rename = "sketchSize")]
    pub sketch_size: u32,
    #[serde(rename = "freeSpace")]
    pub free_space: u32,
    #[serde(rename = "sdkVersion")]
    pub sdk_version: String,
    #[serde(rename = "cpuFreq")]
    pub cpu_freq_mhz: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScanPayload {
    pub devices: Vec<I2cDeviceRecord>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusAck {
    pub status: &'static str,
}

impl StatusAck {
    pub const OK: Self = Self { status: "ok" };
    pub const RESETTING: Self = Self {
        status: "resetting",
    };
    pub const REBOOTING: Self = Self {
        status: "rebooting",
    };
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody<'a> {
    pub error: &'a str,
}

// Request bodies. Absent fields take the documented defaults. Numeric
// controls accept any JSON number: fractions truncate toward zero and
// magnitudes beyond i64 saturate, so the caller can clamp instead of reject.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayCommand {
    #[serde(default)]
    pub state: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PwmCommand {
    #[serde(default, deserialize_with = "lenient_integer")]
    pub value: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServoCommand {
    #[serde(default = "default_servo_angle", deserialize_with = "lenient_integer")]
    pub angle: i64,
}

fn default_servo_angle() -> i64 {
    i64::from(SERVO_DEFAULT_ANGLE)
}

fn lenient_integer<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Number::deserialize(deserializer).map(|number| saturating_i64(&number))
}

fn saturating_i64(number: &Number) -> i64 {
    if let Some(value) = number.as_i64() {
        value
    } else if number.as_u64().is_some() {
        i64::MAX
    } else {
        // `as` saturates at the i64 bounds and maps NaN to 0.
        number.as_f64().map_or(0, |value| value as i64)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PasswordUpdate {
    #[serde(default)]
    pub current: String,
    #[serde(default, rename = "newpass")]
    pub new_password: String,
    #[serde(default, rename = "otapass")]
    pub ota_password: String,
}

/// Mirrors `MqttConfig` with every field optional. A `port` that is not an
/// integer in 0..=65535 counts as absent and takes the default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MqttUpdate {
    pub server: Option<String>,
    #[serde(default, deserialize_with = "lenient_port")]
    pub port: Option<u16>,
    pub client: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

fn lenient_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_omits_state_fields_when_absent() {
        let payload = StatusPayload {
            relay: None,
            sensor: None,
            clients: None,
            ip: None,
            heap: 123_456,
            uptime: 42,
            rssi: -61,
            pwm: 0,
            servo: 90,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"heap":123456,"uptime":42,"rssi":-61,"pwm":0,"servo":90})
        );
    }

    #[test]
    fn command_defaults_apply_to_empty_object() {
        let servo: ServoCommand = serde_json::from_str("{}").unwrap();
        let pwm: PwmCommand = serde_json::from_str("{}").unwrap();
        let relay: RelayCommand = serde_json::from_str("{}").unwrap();

        assert_eq!(servo.angle, 90);
        assert_eq!(pwm.value, 0);
        assert!(!relay.state);
    }

    #[test]
    fn firmware_uses_camel_case_keys() {
        let info = FirmwareInfo {
            version: "2.0.0".to_string(),
            build_date: "Jan  1 2026 00:00:00".to_string(),
            sketch_size: 1,
            free_space: 2,
            sdk_version: "v5.2".to_string(),
            cpu_freq_mhz: 240,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["buildDate"], "Jan  1 2026 00:00:00");
        assert_eq!(json["cpuFreq"], 240);
    }

    #[test]
    fn numeric_controls_truncate_and_saturate() {
        let parse_pwm = |body: &str| serde_json::from_str::<PwmCommand>(body).unwrap().value;
        let parse_servo = |body: &str| serde_json::from_str::<ServoCommand>(body).unwrap().angle;

        assert_eq!(parse_pwm(r#"{"value":55.5}"#), 55);
        assert_eq!(parse_pwm(r#"{"value":-3.9}"#), -3);
        assert_eq!(parse_pwm(r#"{"value":1e20}"#), i64::MAX);
        assert_eq!(parse_pwm(r#"{"value":10000000000000000000}"#), i64::MAX);
        assert_eq!(parse_pwm(r#"{"value":-1e20}"#), i64::MIN);
        assert_eq!(parse_servo(r#"{"angle":200.0}"#), 200);
    }

    #[test]
    fn non_numeric_control_is_still_rejected() {
        assert!(serde_json::from_str::<PwmCommand>(r#"{"value":"high"}"#).is_err());
    }

    #[test]
    fn unusable_mqtt_port_counts_as_absent() {
        let parse_port = |body: &str| serde_json::from_str::<MqttUpdate>(body).unwrap().port;

        assert_eq!(parse_port(r#"{"port":8883}"#), Some(8883));
        assert_eq!(parse_port(r#"{"port":70000}"#), None);
        assert_eq!(parse_port(r#"{"port":-1}"#), None);
        assert_eq!(parse_port(r#"{"port":"1883"}"#), None);
        assert_eq!(parse_port(r#"{"port":null}"#), None);
        assert_eq!(parse_port(r#"{}"#), None);
    }
}
