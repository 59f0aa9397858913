//! Drivers and the global driver registry.
//!
//! Drivers can be registered from any crate by name. Backend crates also
//! contribute a registrar to [`DRIVER_REGISTRARS`], which
//! [`ensure_drivers_registered`] runs once.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock, RwLock};

use super::device::{Device, DeviceInfo};
use super::error::{HalError, HalResult};

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one driver instance. Device infos remember the instance that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(u64);

impl DriverId {
    pub fn next() -> Self {
        DriverId(NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enumerates and constructs devices of one backend family.
pub trait Driver: Send + Sync {
    fn id(&self) -> DriverId;

    fn name(&self) -> &str;

    /// Side-effect-free query; `Unavailable` when the native dependency is missing.
    fn enumerate_devices(&self) -> HalResult<Vec<DeviceInfo>>;

    /// Fails with `InvalidArgument` for infos from another driver instance or stale ordinals.
    fn create_device(&self, info: &DeviceInfo) -> HalResult<Arc<dyn Device>>;

    fn create_default_device(&self) -> HalResult<Arc<dyn Device>> {
        self.create_device_by_ordinal(0)
    }

    fn create_device_by_ordinal(&self, ordinal: usize) -> HalResult<Arc<dyn Device>> {
        let devices = self.enumerate_devices()?;
        let info = devices.get(ordinal).ok_or_else(|| {
            HalError::invalid_argument(format!(
                "driver '{}' has {} devices, ordinal {ordinal} requested",
                self.name(),
                devices.len()
            ))
        })?;
        self.create_device(info)
    }
}

/// Shared `create_device` precondition: the info must come from this driver
/// instance and still be among its enumerated devices.
pub fn validate_device_info(driver: &dyn Driver, info: &DeviceInfo) -> HalResult<()> {
    if info.driver != driver.id() {
        return Err(HalError::invalid_argument(format!(
            "device info '{}' was produced by driver instance {} ('{}'), not by this '{}' instance {}",
            info.name,
            info.driver,
            info.driver_name,
            driver.name(),
            driver.id()
        )));
    }
    let current = driver.enumerate_devices()?;
    if !current.iter().any(|candidate| candidate == info) {
        return Err(HalError::invalid_argument(format!(
            "device info '{}' (ordinal {}) is stale for driver '{}'",
            info.name,
            info.ordinal,
            driver.name()
        )));
    }
    Ok(())
}

/// Factory that creates a new driver instance.
pub type DriverConstructor = Arc<dyn Fn() -> HalResult<Arc<dyn Driver>> + Send + Sync>;

struct DriverRegistry {
    drivers: RwLock<HashMap<String, DriverConstructor>>,
}

impl DriverRegistry {
    fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: DriverConstructor) {
        let mut drivers = self
            .drivers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!(driver = %name, "driver registered");
        drivers.insert(name, constructor);
    }

    /// Runs the constructor registered under `name` outside the registry lock,
    /// so constructors may themselves register or create drivers.
    fn create(&self, name: &str) -> Option<HalResult<Arc<dyn Driver>>> {
        let constructor = Arc::clone(
            self.drivers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(name)?,
        );
        Some(constructor())
    }

    fn list(&self) -> Vec<String> {
        let drivers = self
            .drivers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = drivers.keys().cloned().collect();
        names.sort();
        names
    }

    fn contains(&self, name: &str) -> bool {
        self.drivers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();

fn global_registry() -> &'static DriverRegistry {
    GLOBAL_REGISTRY.get_or_init(DriverRegistry::new)
}

/// Link-time registrars contributed by backend crates.
///
/// ```ignore
/// #[halrt::linkme::distributed_slice(halrt::hal::DRIVER_REGISTRARS)]
/// static REGISTER_MY_DRIVER: fn() = register_my_driver;
/// ```
#[linkme::distributed_slice]
pub static DRIVER_REGISTRARS: [fn()] = [..];

static REGISTRARS_RUN: Once = Once::new();

/// Runs every link-time registrar exactly once.
pub fn ensure_drivers_registered() {
    REGISTRARS_RUN.call_once(|| {
        for registrar in DRIVER_REGISTRARS {
            registrar();
        }
    });
}

/// Registers a driver constructor under `name`, replacing any previous one.
pub fn register_driver<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> HalResult<Arc<dyn Driver>> + Send + Sync + 'static,
{
    global_registry().register(name.into(), Arc::new(constructor));
}

/// Creates a fresh driver instance by name.
pub fn create_driver(name: &str) -> HalResult<Arc<dyn Driver>> {
    ensure_drivers_registered();
    global_registry().create(name).unwrap_or_else(|| {
        Err(HalError::invalid_argument(format!(
            "unknown driver '{name}' (registered: {})",
            list_drivers().join(", ")
        )))
    })
}

/// Registered driver names, sorted.
pub fn list_drivers() -> Vec<String> {
    ensure_drivers_registered();
    global_registry().list()
}

pub fn has_driver(name: &str) -> bool {
    ensure_drivers_registered();
    global_registry().contains(name)
}

/// Backend selection string: `"<driver>"` or `"<driver>:<ordinal>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub driver: String,
    pub ordinal: Option<usize>,
}

impl DeviceDescriptor {
    pub fn parse(text: &str) -> HalResult<Self> {
        let text = text.trim();
        let (driver, ordinal) = match text.split_once(':') {
            Some((driver, ordinal)) => {
                let ordinal = ordinal.trim().parse::<usize>().map_err(|_| {
                    HalError::invalid_argument(format!(
                        "device descriptor '{text}' has a non-numeric ordinal"
                    ))
                })?;
                (driver.trim(), Some(ordinal))
            }
            None => (text, None),
        };
        if driver.is_empty() {
            return Err(HalError::invalid_argument(format!(
                "device descriptor '{text}' names no driver"
            )));
        }
        Ok(Self {
            driver: driver.to_string(),
            ordinal,
        })
    }

    /// Creates a driver instance and a device from the registry.
    pub fn create_device(&self) -> HalResult<Arc<dyn Device>> {
        let driver = create_driver(&self.driver)?;
        driver.create_device_by_ordinal(self.ordinal.unwrap_or(0))
    }
}

impl FromStr for DeviceDescriptor {
    type Err = HalError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        DeviceDescriptor::parse(text)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ordinal {
            Some(ordinal) => write!(f, "{}:{ordinal}", self.driver),
            None => f.write_str(&self.driver),
        }
    }
}

/// Parses a descriptor and creates the device it names.
pub fn create_device_from_descriptor(descriptor: &str) -> HalResult<Arc<dyn Device>> {
    DeviceDescriptor::parse(descriptor)?.create_device()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_parse_driver_and_ordinal() {
        assert_eq!(
            DeviceDescriptor::parse("cuda:1").unwrap(),
            DeviceDescriptor {
                driver: "cuda".into(),
                ordinal: Some(1)
            }
        );
        assert_eq!(DeviceDescriptor::parse(" interp ").unwrap().ordinal, None);
        assert!(DeviceDescriptor::parse("cuda:x").is_err());
        assert!(DeviceDescriptor::parse(":0").is_err());
        assert_eq!(DeviceDescriptor::parse("dylib:0").unwrap().to_string(), "dylib:0");
    }

    #[test]
    fn constructors_may_register_other_drivers() {
        register_driver("registry-test-outer", || {
            register_driver("registry-test-inner", || {
                Err(HalError::unavailable("inner driver has no devices"))
            });
            Err(HalError::unavailable("outer driver has no devices"))
        });
        let err = create_driver("registry-test-outer").err().unwrap();
        assert!(matches!(err, HalError::Unavailable(_)));
        assert!(has_driver("registry-test-inner"));
    }

    #[test]
    fn unknown_driver_is_invalid_argument() {
        let err = create_driver("no-such-driver").err().unwrap();
        assert!(matches!(err, HalError::InvalidArgument(_)));
        assert!(!has_driver("no-such-driver"));
    }
}
