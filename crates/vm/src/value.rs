//! Values carried across the VM boundary.

use bytes::Bytes;
use tensile_base::{ref_object, AnyRef, Status, StatusResult};

/// The type of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    Ref,
}

impl ValueType {
    /// Canonical single-letter used in calling-convention strings.
    pub fn conv_letter(self) -> char {
        match self {
            ValueType::I32 => 'i',
            ValueType::I64 => 'I',
            ValueType::F32 => 'f',
            ValueType::F64 => 'F',
            ValueType::Ref => 'r',
        }
    }

    /// Bytes a value of this type occupies in a frame payload.
    pub fn payload_size(self) -> usize {
        std::mem::size_of::<Value>()
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::Ref => "ref",
        };
        f.write_str(name)
    }
}

/// A single VM value: a fixed-width scalar or a reference.
#[derive(Debug, Clone)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(AnyRef),
}

impl Value {
    /// The value's type.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Ref(_) => ValueType::Ref,
        }
    }

    /// The zero value of the given type (null for refs).
    pub fn default_for(ty: ValueType) -> Self {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
            ValueType::Ref => Value::Ref(AnyRef::null()),
        }
    }

    /// Narrows to i32.
    pub fn as_i32(&self) -> StatusResult<i32> {
        match self {
            Value::I32(v) => Ok(*v),
            other => Err(type_mismatch(ValueType::I32, other)),
        }
    }

    /// Narrows to i64.
    pub fn as_i64(&self) -> StatusResult<i64> {
        match self {
            Value::I64(v) => Ok(*v),
            other => Err(type_mismatch(ValueType::I64, other)),
        }
    }

    /// Narrows to f32.
    pub fn as_f32(&self) -> StatusResult<f32> {
        match self {
            Value::F32(v) => Ok(*v),
            other => Err(type_mismatch(ValueType::F32, other)),
        }
    }

    /// Narrows to f64.
    pub fn as_f64(&self) -> StatusResult<f64> {
        match self {
            Value::F64(v) => Ok(*v),
            other => Err(type_mismatch(ValueType::F64, other)),
        }
    }

    /// Narrows to a reference.
    pub fn as_ref_value(&self) -> StatusResult<&AnyRef> {
        match self {
            Value::Ref(v) => Ok(v),
            other => Err(type_mismatch(ValueType::Ref, other)),
        }
    }

    /// Consumes into a reference.
    pub fn into_ref(self) -> StatusResult<AnyRef> {
        match self {
            Value::Ref(v) => Ok(v),
            other => Err(type_mismatch(ValueType::Ref, &other)),
        }
    }
}

fn type_mismatch(wanted: ValueType, have: &Value) -> Status {
    Status::invalid_argument(format!(
        "value type mismatch: wanted {wanted}, have {}",
        have.value_type()
    ))
}

/// An immutable byte blob carried by reference, used for rodata segments
/// and serialized executable payloads.
pub struct VmBytes {
    data: Bytes,
}

ref_object!(VmBytes);

impl VmBytes {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensile_base::{Ref, StatusKind};

    #[test]
    fn test_value_types() {
        assert_eq!(Value::I32(1).value_type(), ValueType::I32);
        assert_eq!(Value::F64(1.0).value_type(), ValueType::F64);
        assert_eq!(
            Value::Ref(AnyRef::null()).value_type(),
            ValueType::Ref
        );
    }

    #[test]
    fn test_narrowing() {
        assert_eq!(Value::I32(7).as_i32().unwrap(), 7);
        let err = Value::I32(7).as_f32().unwrap_err();
        assert!(err.is(StatusKind::InvalidArgument));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Value::default_for(ValueType::I32).as_i32().unwrap(), 0);
        assert!(Value::default_for(ValueType::Ref)
            .as_ref_value()
            .unwrap()
            .is_null());
    }

    #[test]
    fn test_vm_bytes_ref() {
        let blob: AnyRef = Ref::new(VmBytes::from_vec(vec![1, 2, 3])).into();
        let narrowed = blob.downcast::<VmBytes>().unwrap();
        assert_eq!(narrowed.get().unwrap().data(), &[1, 2, 3]);
    }
}
