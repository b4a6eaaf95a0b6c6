//! Process-wide driver registry.
//!
//! Drivers register once (append-only, behind a global mutex) and are
//! immutable thereafter. Device creation goes through the registry so
//! the CLI and tests can select backends by name.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tensile_base::{Status, StatusResult};

use crate::device::Device;
use crate::local::LocalDevice;

/// A factory for devices of one backend.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;
    fn create_device(&self) -> StatusResult<Arc<dyn Device>>;
}

static REGISTRY: Lazy<Mutex<Vec<Arc<dyn Driver>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Registers a driver. Duplicate names are rejected.
pub fn register_driver(driver: Arc<dyn Driver>) -> StatusResult<()> {
    let mut registry = REGISTRY.lock().expect("driver registry poisoned");
    if registry.iter().any(|existing| existing.name() == driver.name()) {
        return Err(Status::already_exists(format!(
            "driver '{}' is already registered",
            driver.name()
        )));
    }
    tracing::debug!(driver = driver.name(), "registering driver");
    registry.push(driver);
    Ok(())
}

/// Names of all registered drivers.
pub fn driver_names() -> Vec<String> {
    REGISTRY
        .lock()
        .expect("driver registry poisoned")
        .iter()
        .map(|driver| driver.name().to_string())
        .collect()
}

/// Creates a device from the named driver.
pub fn create_device(name: &str) -> StatusResult<Arc<dyn Device>> {
    let driver = REGISTRY
        .lock()
        .expect("driver registry poisoned")
        .iter()
        .find(|driver| driver.name() == name)
        .map(Arc::clone)
        .ok_or_else(|| Status::not_found(format!("no driver named '{name}'")))?;
    // The registry lock is released before the device call.
    driver.create_device()
}

struct LocalDriver;

impl Driver for LocalDriver {
    fn name(&self) -> &str {
        "local"
    }

    fn create_device(&self) -> StatusResult<Arc<dyn Device>> {
        Ok(LocalDevice::new() as Arc<dyn Device>)
    }
}

/// Registers the built-in local driver, ignoring a duplicate
/// registration.
pub fn register_local_driver() {
    let _ = register_driver(Arc::new(LocalDriver));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_driver_roundtrip() {
        register_local_driver();
        register_local_driver();
        assert!(driver_names().contains(&"local".to_string()));
        let device = create_device("local").unwrap();
        assert_eq!(device.id(), "host-loop");
        assert!(create_device("missing").is_err());
    }
}
