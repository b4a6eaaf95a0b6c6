//! Process-wide registry of executable payload loaders.
//!
//! A loader turns a serialized per-target payload into a live
//! [`Executable`] for a given device. The compiler's host backend
//! registers a loader for its loop-nest format; GPU formats register
//! loaders that validate the binary and carry it to the driver.
//!
//! The registry is append-only: a mutex guards registration, reads
//! clone the current table.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tensile_base::{Ref, Status, StatusResult};

use crate::device::Device;
use crate::executable::Executable;

/// Loads a serialized payload into an executable for a device.
pub trait ExecutableLoader: Send + Sync {
    fn load(&self, device: &dyn Device, data: &[u8]) -> StatusResult<Ref<Executable>>;
}

static LOADERS: Lazy<Mutex<Vec<(String, Arc<dyn ExecutableLoader>)>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Registers a loader for a payload format. A later registration for
/// the same format wins, mirroring module override semantics.
pub fn register_executable_format(format: impl Into<String>, loader: Arc<dyn ExecutableLoader>) {
    LOADERS
        .lock()
        .expect("executable format registry poisoned")
        .push((format.into(), loader));
}

/// Finds the loader for a format.
pub fn loader_for(format: &str) -> StatusResult<Arc<dyn ExecutableLoader>> {
    LOADERS
        .lock()
        .expect("executable format registry poisoned")
        .iter()
        .rev()
        .find(|(name, _)| name == format)
        .map(|(_, loader)| Arc::clone(loader))
        .ok_or_else(|| {
            Status::not_found(format!("no loader registered for format '{format}'"))
        })
}

/// Loads a payload by format name.
pub fn load_executable(
    device: &dyn Device,
    format: &str,
    data: &[u8],
) -> StatusResult<Ref<Executable>> {
    loader_for(format)?.load(device, data)
}
