//! Buffer views: a buffer observed through a shape and element type.
//! Views do not own memory.

use tensile_base::{ref_object, Ref, Status, StatusResult};

use crate::buffer::Buffer;
use crate::element_type::ElementType;

/// A buffer plus a shape and an element type descriptor.
pub struct BufferView {
    buffer: Ref<Buffer>,
    shape: Vec<usize>,
    element_type: ElementType,
}

ref_object!(BufferView);

impl BufferView {
    /// Creates a view, validating that the buffer's byte length equals
    /// element count times element size.
    pub fn create(
        buffer: Ref<Buffer>,
        shape: Vec<usize>,
        element_type: ElementType,
    ) -> StatusResult<Ref<BufferView>> {
        let element_count: usize = shape.iter().product();
        let expected = element_count * element_type.byte_size();
        let actual = buffer.get()?.byte_length();
        if expected != actual {
            return Err(Status::invalid_argument(format!(
                "buffer view shape {shape:?} of {element_type} needs {expected} bytes, \
                 buffer has {actual}"
            )));
        }
        Ok(Ref::new(Self {
            buffer,
            shape,
            element_type,
        }))
    }

    pub fn buffer(&self) -> &Ref<Buffer> {
        &self.buffer
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_length(&self) -> usize {
        self.element_count() * self.element_type.byte_size()
    }
}
