use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::{config::SERVO_DEFAULT_ANGLE, error::HardwareError, lock::BoundedLock};

const GAMMA: f32 = 2.8;
pub const I2C_FIRST_ADDRESS: u8 = 1;
pub const I2C_LAST_ADDRESS: u8 = 126;

/// 8-bit duty sink for the dimmer MOSFET.
pub trait DutyOutput: Send {
    fn set_duty(&mut self, duty: u8) -> Result<(), HardwareError>;
}

/// Servo peripheral. `attach` claims the underlying timer/pin.
pub trait ServoOutput: Send {
    fn attach(&mut self) -> Result<(), HardwareError>;
    fn write_angle(&mut self, angle: u8) -> Result<(), HardwareError>;
}

pub trait I2cBus: Send {
    /// Address-only transaction; `true` when a device acknowledged.
    fn probe(&mut self, address: u8) -> bool;
}

pub trait DeviceNameLookup: Send + Sync {
    fn device_name(&self, address: u8) -> &'static str;
}

impl<F> DeviceNameLookup for F
where
    F: Fn(u8) -> &'static str + Send + Sync,
{
    fn device_name(&self, address: u8) -> &'static str {
        self(address)
    }
}

pub fn percent_to_duty(percent: u8) -> u8 {
    (u16::from(percent.min(100)) * 255 / 100) as u8
}

pub fn gamma_correct(level: u8) -> u8 {
    let normalized = f32::from(level) / 255.0;
    (normalized.powf(GAMMA) * 255.0 + 0.5) as u8
}

pub struct PwmDimmer {
    output: Box<dyn DutyOutput>,
    percent: u8,
}

impl PwmDimmer {
    pub fn new(output: Box<dyn DutyOutput>) -> Self {
        Self { output, percent: 0 }
    }

    /// Last commanded percentage.
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// `percent` must already be clamped to 0..=100. Returns the corrected
    /// duty. The recorded percentage only moves once the output accepted it.
    pub fn set_percent(&mut self, percent: u8) -> Result<u8, HardwareError> {
        let duty = gamma_correct(percent_to_duty(percent));
        self.output.set_duty(duty)?;
        self.percent = percent;
        Ok(duty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoAttachment {
    Uninitialized,
    Attached,
}

pub struct ServoDriver {
    output: Box<dyn ServoOutput>,
    attachment: ServoAttachment,
    angle: u8,
}

impl ServoDriver {
    pub fn new(output: Box<dyn ServoOutput>) -> Self {
        Self {
            output,
            attachment: ServoAttachment::Uninitialized,
            angle: SERVO_DEFAULT_ANGLE,
        }
    }

    pub fn attachment(&self) -> ServoAttachment {
        self.attachment
    }

    pub fn angle(&self) -> u8 {
        self.angle
    }

    /// `angle` must already be clamped to 0..=180. Attaches on first use and
    /// stays attached afterwards.
    pub fn set_angle(&mut self, angle: u8) -> Result<(), HardwareError> {
        if self.attachment == ServoAttachment::Uninitialized {
            self.output.attach()?;
            self.attachment = ServoAttachment::Attached;
            info!("servo attached");
        }
        self.output.write_angle(angle)?;
        self.angle = angle;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct I2cDeviceRecord {
    #[serde(rename = "addr")]
    pub address: u8,
    pub name: String,
}

/// Bus scanner guarded by its own lock, disjoint from the state store lock.
pub struct I2cScanner {
    bus: BoundedLock<Box<dyn I2cBus>>,
    names: Box<dyn DeviceNameLookup>,
    timeout: Duration,
}

impl I2cScanner {
    pub fn new(
        bus: Box<dyn I2cBus>,
        names: Box<dyn DeviceNameLookup>,
        timeout: Duration,
    ) -> Self {
        Self {
            bus: BoundedLock::new(bus),
            names,
            timeout,
        }
    }

    /// Probes 1..=126 in ascending order. An unavailable bus yields an empty
    /// list rather than an error.
    pub fn scan(&self) -> Vec<I2cDeviceRecord> {
        let Some(mut bus) = self.bus.lock_within(self.timeout) else {
            warn!("i2c scan skipped: bus lock busy for {:?}", self.timeout);
            return Vec::new();
        };

        let mut devices = Vec::new();
        for address in I2C_FIRST_ADDRESS..=I2C_LAST_ADDRESS {
            if bus.probe(address) {
                devices.push(I2cDeviceRecord {
                    address,
                    name: self.names.device_name(address).to_string(),
                });
            }
        }
        drop(bus);

        info!("i2c scan found {} device(s)", devices.len());
        devices
    }

    #[cfg(test)]
    pub(crate) fn with_bus<R>(&self, f: impl FnOnce(&mut dyn I2cBus) -> R) -> Option<R> {
        let mut bus = self.bus.lock_within(self.timeout)?;
        Some(f(&mut **bus))
    }
}

pub fn well_known_device_name(address: u8) -> &'static str {
    match address {
        0x23 => "BH1750 Light Sensor",
        0x20..=0x27 => "PCF8574 I/O Expander",
        0x3C | 0x3D => "SSD1306 OLED",
        0x40 => "INA219 Power Monitor",
        0x48..=0x4B => "ADS1115 ADC",
        0x50..=0x57 => "AT24C EEPROM",
        0x68 => "MPU6050 / DS3231",
        0x76 | 0x77 => "BME280",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{mpsc, Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingDuty(Arc<Mutex<Vec<u8>>>);

    impl DutyOutput for RecordingDuty {
        fn set_duty(&mut self, duty: u8) -> Result<(), HardwareError> {
            self.0.lock().unwrap().push(duty);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct CountingServo {
        attaches: Arc<Mutex<u32>>,
        angles: Arc<Mutex<Vec<u8>>>,
        fail_attach: bool,
    }

    impl ServoOutput for CountingServo {
        fn attach(&mut self) -> Result<(), HardwareError> {
            if self.fail_attach {
                return Err(HardwareError::Driver("no free timer".to_string()));
            }
            *self.attaches.lock().unwrap() += 1;
            Ok(())
        }

        fn write_angle(&mut self, angle: u8) -> Result<(), HardwareError> {
            self.angles.lock().unwrap().push(angle);
            Ok(())
        }
    }

    struct RejectingDuty;

    impl DutyOutput for RejectingDuty {
        fn set_duty(&mut self, _duty: u8) -> Result<(), HardwareError> {
            Err(HardwareError::Driver("ledc channel stalled".to_string()))
        }
    }

    struct AckBus(Vec<u8>);

    impl I2cBus for AckBus {
        fn probe(&mut self, address: u8) -> bool {
            self.0.contains(&address)
        }
    }

    #[test]
    fn gamma_preserves_endpoints_and_is_monotonic() {
        assert_eq!(gamma_correct(0), 0);
        assert_eq!(gamma_correct(255), 255);
        assert!(gamma_correct(128) < 128);

        let mut previous = 0;
        for level in 0..=255_u8 {
            let corrected = gamma_correct(level);
            assert!(corrected >= previous);
            previous = corrected;
        }
    }

    #[test]
    fn percent_scales_linearly_to_eight_bits() {
        assert_eq!(percent_to_duty(0), 0);
        assert_eq!(percent_to_duty(50), 127);
        assert_eq!(percent_to_duty(100), 255);
    }

    #[test]
    fn dimmer_writes_gamma_corrected_duty() {
        let output = RecordingDuty::default();
        let mut dimmer = PwmDimmer::new(Box::new(output.clone()));

        let duty = dimmer.set_percent(100).unwrap();
        dimmer.set_percent(0).unwrap();

        assert_eq!(duty, 255);
        assert_eq!(dimmer.percent(), 0);
        assert_eq!(*output.0.lock().unwrap(), vec![255, 0]);
    }

    #[test]
    fn servo_attaches_once_on_first_command() {
        let output = CountingServo::default();
        let mut servo = ServoDriver::new(Box::new(output.clone()));
        assert_eq!(servo.attachment(), ServoAttachment::Uninitialized);

        servo.set_angle(10).unwrap();
        servo.set_angle(170).unwrap();

        assert_eq!(servo.attachment(), ServoAttachment::Attached);
        assert_eq!(*output.attaches.lock().unwrap(), 1);
        assert_eq!(*output.angles.lock().unwrap(), vec![10, 170]);
    }

    #[test]
    fn failed_attach_stays_uninitialized() {
        let output = CountingServo {
            fail_attach: true,
            ..CountingServo::default()
        };
        let mut servo = ServoDriver::new(Box::new(output.clone()));

        assert!(servo.set_angle(45).is_err());
        assert_eq!(servo.attachment(), ServoAttachment::Uninitialized);
        assert!(output.angles.lock().unwrap().is_empty());
        assert_eq!(servo.angle(), SERVO_DEFAULT_ANGLE);
    }

    #[test]
    fn rejected_duty_keeps_previous_percentage() {
        let mut dimmer = PwmDimmer::new(Box::new(RejectingDuty));

        assert!(dimmer.set_percent(60).is_err());
        assert_eq!(dimmer.percent(), 0);
    }

    #[test]
    fn scan_reports_acks_in_ascending_order() {
        let scanner = I2cScanner::new(
            Box::new(AckBus(vec![0x68, 0x3C])),
            Box::new(well_known_device_name),
            Duration::from_millis(50),
        );

        let devices = scanner.scan();
        let addresses: Vec<u8> = devices.iter().map(|device| device.address).collect();

        assert_eq!(addresses, vec![0x3C, 0x68]);
        assert_eq!(devices[0].name, "SSD1306 OLED");
    }

    #[test]
    fn scan_never_probes_reserved_addresses() {
        let scanner = I2cScanner::new(
            Box::new(AckBus(vec![0x00, 0x7F])),
            Box::new(well_known_device_name),
            Duration::from_millis(50),
        );
        assert!(scanner.scan().is_empty());
    }

    #[test]
    fn busy_bus_yields_empty_scan() {
        let scanner = Arc::new(I2cScanner::new(
            Box::new(AckBus(vec![0x3C])),
            Box::new(well_known_device_name),
            Duration::from_millis(15),
        ));
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let scanner = scanner.clone();
            std::thread::spawn(move || {
                scanner.with_bus(|_| {
                    held_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                });
            })
        };

        held_rx.recv().unwrap();
        assert!(scanner.scan().is_empty());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(scanner.scan().len(), 1);
    }
}
