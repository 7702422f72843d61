pub mod actuators;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod ota;
pub mod routes;
pub mod state;
pub mod store;
pub mod types;
pub mod upload;

pub use actuators::{
    well_known_device_name, DutyOutput, I2cBus, I2cDeviceRecord, I2cScanner, PwmDimmer,
    ServoAttachment, ServoDriver, ServoOutput,
};
pub use config::{ControllerConfig, Credentials, HardwareConfig, MqttConfig};
pub use dispatch::{
    is_upload_path, ApiError, ApiRequest, ApiResponse, Dispatcher, HttpMethod, Peripherals,
    Platform, PostAction,
};
pub use error::{HardwareError, OtaError, SourceError, StoreError};
pub use ota::{FlashUpdate, OtaOutcome, OtaSession, OtaStatus};
pub use routes::*;
pub use state::{DeviceState, DeviceStateSnapshot, StateStore};
pub use store::{ConfigStore, NamespaceStore, StoredValue};
pub use types::{FirmwareInfo, NetworkInfo, StatusPayload};
pub use upload::ChunkSource;
