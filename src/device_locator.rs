use crate::config::{MonsoonConfig, RetryPolicy};
use crate::monsoon::Monsoon;
use crate::serial_link::{open_serial, LinkError, Transport};
use serialport::SerialPort;
use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Serial device names a Monsoon shows up under.
const CANDIDATE_PATTERN: &str = "ttyACM";

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Serial link error: {0}")]
    Link(#[from] LinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device {port} is in use by another process")]
    DeviceBusy { port: String },

    #[error("Device {port} is not a Monsoon or did not answer")]
    InvalidPort { port: String },

    #[error("No Monsoon device found. Please connect a Monsoon or specify the device manually")]
    DeviceNotFound,

    #[error("Device search cancelled")]
    Cancelled,
}

/// Exclusive advisory lock on a meter, held through a lock file.
///
/// Released when dropped or when the process exits.
#[derive(Debug)]
pub struct DeviceLock {
    _file: File,
    path: PathBuf,
}

impl DeviceLock {
    /// Try to lock `device` without blocking. `Ok(None)` means another
    /// process holds it.
    pub fn try_acquire(lock_dir: &Path, device: &str) -> io::Result<Option<Self>> {
        let path = Self::lock_path(lock_dir, device);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        // Other users must be able to take the lock after us.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666));
        }

        match file.try_lock() {
            Ok(()) => Ok(Some(Self { _file: file, path })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }

    pub fn lock_path(lock_dir: &Path, device: &str) -> PathBuf {
        let name = Path::new(device)
            .file_name()
            .map_or_else(|| device.to_string(), |n| n.to_string_lossy().to_string());
        lock_dir.join(format!("monsoon.{}.{}", std::env::consts::OS, name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Source of candidate device paths and the ports behind them.
pub trait PortProvider {
    type Port: Transport;

    fn candidates(&mut self) -> Result<Vec<String>, ConnectorError>;

    fn open(&mut self, path: &str) -> Result<Self::Port, ConnectorError>;
}

/// Real serial ports as enumerated by the OS.
#[derive(Debug, Clone)]
pub struct SerialPortProvider {
    timeout: Duration,
}

impl SerialPortProvider {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PortProvider for SerialPortProvider {
    type Port = Box<dyn SerialPort>;

    fn candidates(&mut self) -> Result<Vec<String>, ConnectorError> {
        let mut ports: Vec<String> = serialport::available_ports()
            .map_err(LinkError::from)?
            .into_iter()
            .map(|p| p.port_name)
            .filter(|name| name.contains(CANDIDATE_PATTERN))
            .collect();
        ports.sort();
        Ok(ports)
    }

    fn open(&mut self, path: &str) -> Result<Self::Port, ConnectorError> {
        Ok(open_serial(path, self.timeout)?)
    }
}

enum Probe<T: Transport> {
    Found(Monsoon<T>),
    Busy,
    NoResponse,
    OtherDevice,
}

/// Finds one accessible meter and locks it for exclusive use.
pub struct DeviceLocator<P> {
    provider: P,
    config: MonsoonConfig,
    sleep: Box<dyn FnMut(Duration)>,
    cancel: Option<Arc<AtomicBool>>,
}

impl DeviceLocator<SerialPortProvider> {
    pub fn new(config: MonsoonConfig) -> Self {
        let provider = SerialPortProvider::new(config.read_timeout);
        Self::with_provider(provider, config)
    }
}

impl<P: PortProvider> DeviceLocator<P> {
    pub fn with_provider(provider: P, config: MonsoonConfig) -> Self {
        Self {
            provider,
            config,
            sleep: Box::new(thread::sleep),
            cancel: None,
        }
    }

    /// Replace the function used to wait between scans.
    pub fn with_sleep(mut self, sleep: impl FnMut(Duration) + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    /// Abort waiting as soon as `cancel` is set.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn locate(mut self) -> Result<Monsoon<P::Port>, ConnectorError> {
        let _span = tracing::debug_span!("locate", device = ?self.config.device).entered();

        if let Some(device) = self.config.device.clone() {
            log::debug!("Connecting to Monsoon on {}", device);
            return match self.probe(&device)? {
                Probe::Found(monsoon) => Ok(monsoon),
                Probe::Busy => Err(ConnectorError::DeviceBusy { port: device }),
                Probe::NoResponse | Probe::OtherDevice => {
                    Err(ConnectorError::InvalidPort { port: device })
                }
            };
        }

        let mut scans = 0u32;
        loop {
            if self.cancelled() {
                return Err(ConnectorError::Cancelled);
            }

            let candidates = self.provider.candidates().unwrap_or_else(|e| {
                log::warn!("Failed to list serial ports: {}", e);
                Vec::new()
            });
            for candidate in candidates {
                match self.probe(&candidate) {
                    Ok(Probe::Found(monsoon)) => {
                        log::info!("Connected to Monsoon on {}", candidate);
                        return Ok(monsoon);
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Error opening device {}: {}", candidate, e),
                }
            }
            scans += 1;

            let interval = match self.config.retry {
                RetryPolicy::NoWait => return Err(ConnectorError::DeviceNotFound),
                RetryPolicy::Attempts { attempts, .. } if scans >= attempts => {
                    return Err(ConnectorError::DeviceNotFound)
                }
                RetryPolicy::Attempts { interval, .. } | RetryPolicy::Forever { interval } => {
                    interval
                }
            };
            log::info!("Waiting for device...");
            (self.sleep)(interval);
        }
    }

    fn probe(&mut self, path: &str) -> Result<Probe<P::Port>, ConnectorError> {
        let Some(lock) = DeviceLock::try_acquire(&self.config.lock_dir, path)? else {
            log::warn!("Device {} is in use", path);
            return Ok(Probe::Busy);
        };

        let port = self.provider.open(path)?;
        let mut monsoon = Monsoon::new(port, &self.config);
        // A previous user may have left collection running.
        monsoon.stop_data_collection()?;
        monsoon.flush_input()?;

        let Some(status) = monsoon.status()? else {
            log::warn!("No response from device {}", path);
            return Ok(Probe::NoResponse);
        };

        if let Some(wanted) = self.config.serial_number {
            if status.serial_number() != wanted {
                log::info!(
                    "Note: another device serial #{} seen on {}",
                    status.serial_number(),
                    path
                );
                return Ok(Probe::OtherDevice);
            }
        }

        monsoon.attach(lock, status.voltage1());
        Ok(Probe::Found(monsoon))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_codec::encode_frame;
    use crate::serial_link::mock::ScriptedTransport;
    use crate::status::testing::raw_status;
    use crate::status::STATUS_REQUEST;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};
    use zerocopy::byteorder::big_endian::U16;

    /// Ports that answer a status request with the given serial number and
    /// voltage. Ports with no entry stay silent.
    #[derive(Default)]
    struct FakeProvider {
        ports: Vec<String>,
        answers: HashMap<String, (u16, u16)>,
        enumeration_fails: bool,
    }

    impl FakeProvider {
        fn with_meter(mut self, port: &str, serial: u16, voltage_raw: u16) -> Self {
            self.ports.push(port.to_string());
            self.answers.insert(port.to_string(), (serial, voltage_raw));
            self
        }

        fn with_silent(mut self, port: &str) -> Self {
            self.ports.push(port.to_string());
            self
        }
    }

    impl PortProvider for FakeProvider {
        type Port = ScriptedTransport;

        fn candidates(&mut self) -> Result<Vec<String>, ConnectorError> {
            if self.enumeration_fails {
                return Err(io::Error::other("no port enumeration").into());
            }
            Ok(self.ports.clone())
        }

        fn open(&mut self, path: &str) -> Result<Self::Port, ConnectorError> {
            // Stale bytes that the probe must flush before asking for status.
            let mut port = ScriptedTransport::with_input([0x07, 0x20]);
            if let Some(&(serial, voltage)) = self.answers.get(path) {
                let status = raw_status(|s| {
                    s.serial_number = U16::new(serial);
                    s.voltage1 = U16::new(voltage);
                });
                port = port.reply_to(encode_frame(&STATUS_REQUEST), encode_frame(&status));
            }
            Ok(port)
        }
    }

    fn config(dir: &TempDir) -> MonsoonConfig {
        MonsoonConfig::new().lock_dir(dir.path()).no_wait()
    }

    #[test]
    fn test_no_device_without_waiting() {
        let dir = tempdir().unwrap();
        let result = DeviceLocator::with_provider(FakeProvider::default(), config(&dir))
            .with_sleep(|_| unreachable!())
            .locate();
        assert!(matches!(result, Err(ConnectorError::DeviceNotFound)));
    }

    #[test]
    fn test_finds_first_answering_device() {
        let dir = tempdir().unwrap();
        let provider = FakeProvider::default()
            .with_silent("/dev/ttyACM0")
            .with_meter("/dev/ttyACM1", 7, 32_000);

        let monsoon = DeviceLocator::with_provider(provider, config(&dir))
            .locate()
            .unwrap();
        assert!((monsoon.start_voltage() - 4.0).abs() < 1e-9);

        // Probing stops any running collection, then asks for status.
        let mut expected = encode_frame(&[0x03, 0x00]);
        expected.extend(encode_frame(&STATUS_REQUEST));
        assert_eq!(monsoon.link().transport().written, expected);
    }

    #[test]
    fn test_skips_locked_device() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let _held = DeviceLock::try_acquire(&config.lock_dir, "/dev/ttyACM0")
            .unwrap()
            .unwrap();

        let provider = FakeProvider::default()
            .with_meter("/dev/ttyACM0", 1, 8000)
            .with_meter("/dev/ttyACM1", 2, 16_000);
        let monsoon = DeviceLocator::with_provider(provider, config)
            .locate()
            .unwrap();
        assert!((monsoon.start_voltage() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let lock = DeviceLock::try_acquire(dir.path(), "/dev/ttyACM5").unwrap();
        assert!(lock.is_some());
        assert!(DeviceLock::try_acquire(dir.path(), "/dev/ttyACM5").unwrap().is_none());
        drop(lock);
        assert!(DeviceLock::try_acquire(dir.path(), "/dev/ttyACM5").unwrap().is_some());
    }

    #[test]
    fn test_serial_number_filter() {
        let dir = tempdir().unwrap();
        let provider = FakeProvider::default()
            .with_meter("/dev/ttyACM0", 100, 8000)
            .with_meter("/dev/ttyACM1", 200, 16_000);
        let monsoon = DeviceLocator::with_provider(provider, config(&dir).serial_number(200))
            .locate()
            .unwrap();
        assert!((monsoon.start_voltage() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_bounded_retries_sleep_between_scans() {
        let dir = tempdir().unwrap();
        let sleeps = Rc::new(RefCell::new(Vec::new()));
        let recorded = Rc::clone(&sleeps);
        let interval = Duration::from_millis(250);

        let result = DeviceLocator::with_provider(
            FakeProvider::default().with_silent("/dev/ttyACM0"),
            config(&dir).retry(RetryPolicy::Attempts {
                attempts: 3,
                interval,
            }),
        )
        .with_sleep(move |d| recorded.borrow_mut().push(d))
        .locate();

        assert!(matches!(result, Err(ConnectorError::DeviceNotFound)));
        assert_eq!(*sleeps.borrow(), vec![interval, interval]);
    }

    #[test]
    fn test_cancel_stops_waiting() {
        let dir = tempdir().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let result = DeviceLocator::with_provider(
            FakeProvider::default(),
            config(&dir).retry(RetryPolicy::default()),
        )
        .with_cancel(Arc::clone(&cancel))
        .with_sleep(move |_| flag.store(true, Ordering::SeqCst))
        .locate();

        assert!(matches!(result, Err(ConnectorError::Cancelled)));
    }

    #[test]
    fn test_enumeration_failure_is_retried() {
        let dir = tempdir().unwrap();
        let scans = Rc::new(RefCell::new(0));
        let counted = Rc::clone(&scans);
        let provider = FakeProvider {
            enumeration_fails: true,
            ..FakeProvider::default()
        };

        let result = DeviceLocator::with_provider(
            provider,
            config(&dir).retry(RetryPolicy::Attempts {
                attempts: 3,
                interval: Duration::ZERO,
            }),
        )
        .with_sleep(move |_| *counted.borrow_mut() += 1)
        .locate();

        assert!(matches!(result, Err(ConnectorError::DeviceNotFound)));
        assert_eq!(*scans.borrow(), 2);
    }

    #[test]
    fn test_explicit_device_busy() {
        let dir = tempdir().unwrap();
        let config = config(&dir).device("/dev/ttyACM2");
        let _held = DeviceLock::try_acquire(&config.lock_dir, "/dev/ttyACM2")
            .unwrap()
            .unwrap();

        let provider = FakeProvider::default().with_meter("/dev/ttyACM2", 1, 8000);
        let result = DeviceLocator::with_provider(provider, config).locate();
        assert!(matches!(
            result,
            Err(ConnectorError::DeviceBusy { port }) if port == "/dev/ttyACM2"
        ));
    }
}
