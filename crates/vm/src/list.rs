//! Ref-typed list values.
//!
//! A `VmList` is the uniform-ABI list type: an ordered, growable
//! sequence of VM values carried by reference. The HAL module uses lists
//! for dispatch binding tables.

use std::sync::Mutex;

use tensile_base::{ref_object, Status, StatusResult};

use crate::value::Value;

/// An ordered, growable sequence of VM values.
pub struct VmList {
    items: Mutex<Vec<Value>>,
}

ref_object!(VmList);

impl VmList {
    /// Creates an empty list with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.lock().expect("list poisoned").len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a value.
    pub fn push(&self, value: Value) {
        self.items.lock().expect("list poisoned").push(value);
    }

    /// Reads the value at `index`.
    pub fn get(&self, index: usize) -> StatusResult<Value> {
        self.items
            .lock()
            .expect("list poisoned")
            .get(index)
            .cloned()
            .ok_or_else(|| {
                Status::out_of_range(format!("list index {index} out of range"))
            })
    }

    /// Replaces the value at `index`.
    pub fn set(&self, index: usize, value: Value) -> StatusResult<()> {
        let mut items = self.items.lock().expect("list poisoned");
        let len = items.len();
        let slot = items.get_mut(index).ok_or_else(|| {
            Status::out_of_range(format!("list index {index} out of range for length {len}"))
        })?;
        *slot = value;
        Ok(())
    }

    /// Snapshots the contents.
    pub fn to_vec(&self) -> Vec<Value> {
        self.items.lock().expect("list poisoned").clone()
    }
}
