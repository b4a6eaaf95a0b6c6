//! Device buffers: typed byte regions with usage and memory-type bits.
//!
//! A buffer may be a subrange of another buffer; subranges share the
//! backing allocation, so the allocation lives as long as any range over
//! it. Host mapping requires host-visible memory and mapping usage;
//! keeping mapped access and device access apart is the caller's barrier
//! responsibility.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;
use tensile_base::{ref_object, Ref, Status, StatusResult};

bitflags! {
    /// Allowed uses of a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const TRANSFER = 1 << 0;
        const DISPATCH = 1 << 1;
        const MAPPING  = 1 << 2;
    }
}

bitflags! {
    /// Memory placement and coherence bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryType: u32 {
        const HOST_VISIBLE  = 1 << 0;
        const DEVICE_LOCAL  = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED   = 1 << 3;
    }
}

/// A byte region on a device allocation.
pub struct Buffer {
    allocator: String,
    storage: Arc<RwLock<Vec<u8>>>,
    byte_offset: usize,
    byte_length: usize,
    usage: BufferUsage,
    memory_type: MemoryType,
}

ref_object!(Buffer);

impl Buffer {
    /// Allocates a zeroed buffer.
    pub fn allocate(
        allocator: impl Into<String>,
        byte_length: usize,
        usage: BufferUsage,
        memory_type: MemoryType,
    ) -> Ref<Buffer> {
        Ref::new(Self {
            allocator: allocator.into(),
            storage: Arc::new(RwLock::new(vec![0u8; byte_length])),
            byte_offset: 0,
            byte_length,
            usage,
            memory_type,
        })
    }

    /// The owning allocator's name.
    pub fn allocator(&self) -> &str {
        &self.allocator
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Creates a subrange sharing this buffer's allocation.
    pub fn subspan(&self, byte_offset: usize, byte_length: usize) -> StatusResult<Ref<Buffer>> {
        let end = byte_offset.checked_add(byte_length).ok_or_else(|| {
            Status::out_of_range("subspan range overflows")
        })?;
        if end > self.byte_length {
            return Err(Status::out_of_range(format!(
                "subspan [{byte_offset}, {end}) out of range for buffer of {} bytes",
                self.byte_length
            )));
        }
        Ok(Ref::new(Self {
            allocator: self.allocator.clone(),
            storage: Arc::clone(&self.storage),
            byte_offset: self.byte_offset + byte_offset,
            byte_length,
            usage: self.usage,
            memory_type: self.memory_type,
        }))
    }

    fn check_range(&self, byte_offset: usize, byte_length: usize) -> StatusResult<()> {
        let end = byte_offset
            .checked_add(byte_length)
            .ok_or_else(|| Status::out_of_range("buffer range overflows"))?;
        if end > self.byte_length {
            return Err(Status::out_of_range(format!(
                "range [{byte_offset}, {end}) out of range for buffer of {} bytes",
                self.byte_length
            )));
        }
        Ok(())
    }

    fn check_mappable(&self) -> StatusResult<()> {
        if !self.memory_type.contains(MemoryType::HOST_VISIBLE) {
            return Err(Status::failed_precondition(
                "buffer memory is not host-visible",
            ));
        }
        if !self.usage.contains(BufferUsage::MAPPING) {
            return Err(Status::failed_precondition(
                "buffer was not allocated for mapping",
            ));
        }
        Ok(())
    }

    /// Maps a range for host reading.
    pub fn map_read(&self, byte_offset: usize, byte_length: usize) -> StatusResult<Vec<u8>> {
        self.check_mappable()?;
        self.read_bytes(byte_offset, byte_length)
    }

    /// Maps a range and overwrites it with host data.
    pub fn map_write(&self, byte_offset: usize, data: &[u8]) -> StatusResult<()> {
        self.check_mappable()?;
        self.write_bytes(byte_offset, data)
    }

    /// Device-side read; no memory-type checks. Kernel implementations
    /// use this under the queue's ordering guarantees.
    pub fn read_bytes(
        &self,
        byte_offset: usize,
        byte_length: usize,
    ) -> StatusResult<Vec<u8>> {
        self.check_range(byte_offset, byte_length)?;
        let storage = self.storage.read();
        let start = self.byte_offset + byte_offset;
        Ok(storage[start..start + byte_length].to_vec())
    }

    /// Device-side write; no memory-type checks. Kernel implementations
    /// use this under the queue's ordering guarantees.
    pub fn write_bytes(&self, byte_offset: usize, data: &[u8]) -> StatusResult<()> {
        self.check_range(byte_offset, data.len())?;
        let mut storage = self.storage.write();
        let start = self.byte_offset + byte_offset;
        storage[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensile_base::StatusKind;

    fn host_buffer(len: usize) -> Ref<Buffer> {
        Buffer::allocate(
            "test",
            len,
            BufferUsage::TRANSFER | BufferUsage::DISPATCH | BufferUsage::MAPPING,
            MemoryType::HOST_VISIBLE | MemoryType::HOST_COHERENT,
        )
    }

    #[test]
    fn test_allocate_zeroed() {
        let buffer = host_buffer(8);
        assert_eq!(buffer.get().unwrap().map_read(0, 8).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn test_subspan_shares_allocation() {
        let buffer = host_buffer(16);
        let sub = buffer.get().unwrap().subspan(4, 8).unwrap();
        sub.get().unwrap().map_write(0, &[7u8; 8]).unwrap();
        let full = buffer.get().unwrap().map_read(0, 16).unwrap();
        assert_eq!(&full[4..12], &[7u8; 8]);
        assert_eq!(full[0], 0);
        assert_eq!(sub.get().unwrap().byte_offset(), 4);
        assert_eq!(sub.get().unwrap().byte_length(), 8);
    }

    #[test]
    fn test_nested_subspan_offsets_compose() {
        let buffer = host_buffer(16);
        let sub = buffer.get().unwrap().subspan(4, 8).unwrap();
        let nested = sub.get().unwrap().subspan(2, 4).unwrap();
        assert_eq!(nested.get().unwrap().byte_offset(), 6);
        nested.get().unwrap().map_write(0, &[1, 2, 3, 4]).unwrap();
        let full = buffer.get().unwrap().map_read(0, 16).unwrap();
        assert_eq!(&full[6..10], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_subspan_bounds() {
        let buffer = host_buffer(8);
        let err = buffer.get().unwrap().subspan(4, 8).unwrap_err();
        assert!(err.is(StatusKind::OutOfRange));
    }

    #[test]
    fn test_mapping_requires_host_visible() {
        let buffer = Buffer::allocate(
            "test",
            8,
            BufferUsage::DISPATCH | BufferUsage::MAPPING,
            MemoryType::DEVICE_LOCAL,
        );
        let err = buffer.get().unwrap().map_read(0, 8).unwrap_err();
        assert!(err.is(StatusKind::FailedPrecondition));
    }

    #[test]
    fn test_mapping_requires_mapping_usage() {
        let buffer = Buffer::allocate(
            "test",
            8,
            BufferUsage::DISPATCH,
            MemoryType::HOST_VISIBLE,
        );
        assert!(buffer.get().unwrap().map_read(0, 8).is_err());
    }
}
