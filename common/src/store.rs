use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    config::{Credentials, MqttConfig},
    error::StoreError,
    routes::{
        KEY_AUTH_OTA_PASS, KEY_AUTH_PASS, KEY_MQTT_CLIENT, KEY_MQTT_PASS, KEY_MQTT_PORT,
        KEY_MQTT_SERVER, KEY_MQTT_USER, NS_AUTH, NS_MQTT,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    U32(u32),
    Str(String),
}

impl StoredValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            Self::U32(_) => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(value) => Some(*value),
            Self::Str(_) => None,
        }
    }
}

/// Namespaced durable key-value storage.
///
/// `write_all` opens the namespace, writes every entry and closes it again;
/// there is no per-field update path.
pub trait NamespaceStore: Send + Sync {
    fn read(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError>;

    fn write_all(&self, namespace: &str, entries: &[(&str, StoredValue)])
        -> Result<(), StoreError>;

    fn clear(&self, namespace: &str) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct ConfigStore {
    backend: Arc<dyn NamespaceStore>,
}

impl ConfigStore {
    pub fn new(backend: Arc<dyn NamespaceStore>) -> Self {
        Self { backend }
    }

    /// Compiled defaults overlaid with whatever the `auth` namespace holds.
    pub fn load_credentials(&self, defaults: Credentials) -> Result<Credentials, StoreError> {
        let mut credentials = defaults;
        if let Some(pass) = self.read_str(NS_AUTH, KEY_AUTH_PASS)? {
            credentials.web_password = pass;
        }
        if let Some(pass) = self.read_str(NS_AUTH, KEY_AUTH_OTA_PASS)? {
            credentials.ota_password = pass;
        }
        Ok(credentials)
    }

    pub fn save_auth(&self, web_password: &str, ota_password: &str) -> Result<(), StoreError> {
        self.backend.write_all(
            NS_AUTH,
            &[
                (KEY_AUTH_PASS, StoredValue::Str(web_password.to_string())),
                (KEY_AUTH_OTA_PASS, StoredValue::Str(ota_password.to_string())),
            ],
        )?;
        info!("auth namespace updated");
        Ok(())
    }

    pub fn save_mqtt(&self, mqtt: &MqttConfig) -> Result<(), StoreError> {
        self.backend.write_all(
            NS_MQTT,
            &[
                (KEY_MQTT_SERVER, StoredValue::Str(mqtt.server.clone())),
                (KEY_MQTT_PORT, StoredValue::U32(u32::from(mqtt.port))),
                (KEY_MQTT_CLIENT, StoredValue::Str(mqtt.client_id.clone())),
                (KEY_MQTT_USER, StoredValue::Str(mqtt.username.clone())),
                (KEY_MQTT_PASS, StoredValue::Str(mqtt.password.clone())),
            ],
        )?;
        info!("mqtt namespace updated: `{}:{}`", mqtt.server, mqtt.port);
        Ok(())
    }

    /// Read side for the MQTT client collaborator; the dispatcher never
    /// consults it.
    pub fn load_mqtt(&self) -> Result<MqttConfig, StoreError> {
        let mut mqtt = MqttConfig::default();
        if let Some(server) = self.read_str(NS_MQTT, KEY_MQTT_SERVER)? {
            mqtt.server = server;
        }
        if let Some(port) = self.read_u32(NS_MQTT, KEY_MQTT_PORT)? {
            mqtt.port = u16::try_from(port).unwrap_or(mqtt.port);
        }
        if let Some(client) = self.read_str(NS_MQTT, KEY_MQTT_CLIENT)? {
            mqtt.client_id = client;
        }
        if let Some(user) = self.read_str(NS_MQTT, KEY_MQTT_USER)? {
            mqtt.username = user;
        }
        if let Some(pass) = self.read_str(NS_MQTT, KEY_MQTT_PASS)? {
            mqtt.password = pass;
        }
        Ok(mqtt)
    }

    pub fn clear_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        self.backend.clear(namespace)
    }

    fn read_str(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        match self.backend.read(namespace, key)? {
            None => Ok(None),
            Some(StoredValue::Str(value)) => Ok(Some(value)),
            Some(StoredValue::U32(_)) => Err(type_mismatch(namespace, key)),
        }
    }

    fn read_u32(&self, namespace: &str, key: &str) -> Result<Option<u32>, StoreError> {
        match self.backend.read(namespace, key)? {
            None => Ok(None),
            Some(StoredValue::U32(value)) => Ok(Some(value)),
            Some(StoredValue::Str(_)) => Err(type_mismatch(namespace, key)),
        }
    }
}

fn type_mismatch(namespace: &str, key: &str) -> StoreError {
    StoreError::TypeMismatch {
        namespace: namespace.to_string(),
        key: key.to_string(),
    }
}
