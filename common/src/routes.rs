pub const PATH_STATUS: &str = "/api/status";
pub const PATH_RELAY: &str = "/api/relay";
pub const PATH_PWM: &str = "/api/pwm";
pub const PATH_SERVO: &str = "/api/servo";
pub const PATH_I2C_SCAN: &str = "/api/i2c/scan";

pub const PATH_PASSWORD: &str = "/api/password";
pub const PATH_MQTT: &str = "/api/mqtt";
pub const PATH_NETWORK: &str = "/api/network";
pub const PATH_FIRMWARE: &str = "/api/firmware";
pub const PATH_WIFI_RESET: &str = "/api/wifi/reset";
pub const PATH_REBOOT: &str = "/api/reboot";

pub const PATH_UPDATE: &str = "/update";

pub const API_PATHS: [&str; 12] = [
    PATH_STATUS,
    PATH_RELAY,
    PATH_PWM,
    PATH_SERVO,
    PATH_I2C_SCAN,
    PATH_PASSWORD,
    PATH_MQTT,
    PATH_NETWORK,
    PATH_FIRMWARE,
    PATH_WIFI_RESET,
    PATH_REBOOT,
    PATH_UPDATE,
];

pub const NS_AUTH: &str = "auth";
pub const KEY_AUTH_PASS: &str = "pass";
pub const KEY_AUTH_OTA_PASS: &str = "otapass";

pub const NS_MQTT: &str = "mqtt";
pub const KEY_MQTT_SERVER: &str = "server";
pub const KEY_MQTT_PORT: &str = "port";
pub const KEY_MQTT_CLIENT: &str = "client";
pub const KEY_MQTT_USER: &str = "user";
pub const KEY_MQTT_PASS: &str = "pass";

pub const NS_WIFI: &str = "wifi";
pub const KEY_WIFI_SSID: &str = "ssid";
pub const KEY_WIFI_PASS: &str = "pass";
