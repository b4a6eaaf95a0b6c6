//! The execution stack: a dynamically growable arena of call frames.
//!
//! Frames are pushed and popped in strict LIFO order. Frame storage is
//! byte-accounted against a single arena whose capacity starts at a
//! minimum reservation and doubles on demand up to a hard cap; exceeding
//! the cap is `resource-exhausted`. Externally provided storage that
//! cannot grow in place is copied into a fresh owned arena on first
//! growth when an allocator is available, and fails growth otherwise.
//!
//! The stack is not safe for concurrent access; one stack per logical
//! fiber.

use std::sync::Arc;

use tensile_base::{Status, StatusResult};

use crate::function::ResolvedFunction;
use crate::module::{StateResolver, WeakState};
use crate::value::Value;

/// Byte cost accounted for each frame header in the arena.
pub const FRAME_HEADER_SIZE: usize = 96;

/// Default minimum arena reservation, enough for typical invocations.
pub const MIN_STACK_CAPACITY: usize = 16 * 1024;

/// Default hard cap on arena growth.
pub const MAX_STACK_CAPACITY: usize = 1024 * 1024;

/// Frame provenance tag, shown in backtraces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// The host boundary of an invocation.
    External,
    /// A host-provided (native) function.
    Native,
    /// A compiled bytecode function.
    Bytecode,
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            FrameType::External => "external",
            FrameType::Native => "native",
            FrameType::Bytecode => "bytecode",
        };
        f.write_str(tag)
    }
}

/// Cleanup hook invoked when a frame is left, on both the success and
/// the error path. Responsible for releasing any refs the payload holds
/// beyond the registers themselves.
pub type FrameCleanup = Box<dyn FnOnce(&mut Vec<Value>) + Send>;

/// A stack record for one in-flight function call.
pub struct Frame {
    pub function: ResolvedFunction,
    pub frame_type: FrameType,
    /// Weak reference to the callee module's per-context state.
    pub state: WeakState,
    /// Program counter, maintained by the executing module.
    pub pc: usize,
    /// Distance from the invocation's first frame.
    pub depth: u32,
    /// Registers and locals.
    pub registers: Vec<Value>,
    parent: Option<usize>,
    size: usize,
    cleanup: Option<FrameCleanup>,
}

impl Frame {
    /// Index of the parent frame, if any.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Bytes this frame accounts for in the arena.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("function", &self.function)
            .field("frame_type", &self.frame_type)
            .field("pc", &self.pc)
            .field("depth", &self.depth)
            .field("registers", &self.registers)
            .field("parent", &self.parent)
            .field("size", &self.size)
            .finish()
    }
}

/// Limits and policy for one stack.
#[derive(Debug, Clone)]
pub struct StackLimits {
    pub initial_capacity: usize,
    pub max_capacity: usize,
    /// When false, backtrace lines are never formatted or attached.
    pub capture_backtraces: bool,
}

impl Default for StackLimits {
    fn default() -> Self {
        Self {
            initial_capacity: MIN_STACK_CAPACITY,
            max_capacity: MAX_STACK_CAPACITY,
            capture_backtraces: true,
        }
    }
}

enum StorageKind {
    /// Arena owned by the stack; grows by doubling.
    Owned,
    /// Caller-provided storage of fixed capacity. With an allocator the
    /// first growth copies into a fresh owned arena; without one,
    /// growth fails.
    Static { with_allocator: bool },
}

/// An execution thread's frame stack.
pub struct Stack {
    frames: Vec<Frame>,
    resolver: Arc<dyn StateResolver>,
    limits: StackLimits,
    storage: StorageKind,
    capacity: usize,
    used: usize,
}

impl Stack {
    /// Creates a stack with an owned arena at the minimum reservation.
    pub fn new(resolver: Arc<dyn StateResolver>, limits: StackLimits) -> Self {
        let capacity = limits.initial_capacity;
        Self {
            frames: Vec::new(),
            resolver,
            limits,
            storage: StorageKind::Owned,
            capacity,
            used: 0,
        }
    }

    /// Creates a stack over caller-provided storage of `capacity` bytes.
    /// When `with_allocator` is false, any growth beyond the provided
    /// capacity fails with `resource-exhausted`.
    pub fn with_static_storage(
        resolver: Arc<dyn StateResolver>,
        limits: StackLimits,
        capacity: usize,
        with_allocator: bool,
    ) -> Self {
        Self {
            frames: Vec::new(),
            resolver,
            limits,
            storage: StorageKind::Static { with_allocator },
            capacity,
            used: 0,
        }
    }

    /// Bytes currently accounted to live frames.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Current arena capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    /// Number of live frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The current top frame.
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// The current top frame, mutable.
    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Whether backtrace capture is enabled for this stack.
    pub fn captures_backtraces(&self) -> bool {
        self.limits.capture_backtraces
    }

    fn grow(&mut self, required: usize) -> StatusResult<()> {
        if let StorageKind::Static { with_allocator } = self.storage {
            if !with_allocator {
                return Err(Status::resource_exhausted(format!(
                    "stack storage of {} bytes cannot grow without an allocator \
                     ({required} bytes required)",
                    self.capacity
                )));
            }
            // First growth abandons the caller's storage for an owned
            // arena; the live prefix is the frame list itself.
            self.storage = StorageKind::Owned;
            if self.capacity < self.limits.initial_capacity {
                self.capacity = self.limits.initial_capacity;
            }
        }
        let mut capacity = self.capacity.max(1);
        while capacity < required {
            capacity = match capacity.checked_mul(2) {
                Some(doubled) => doubled,
                None => {
                    return Err(Status::resource_exhausted(format!(
                        "stack growth to {required} bytes overflows"
                    )))
                }
            };
        }
        if capacity > self.limits.max_capacity {
            return Err(Status::resource_exhausted(format!(
                "stack of {required} bytes exceeds the {}-byte cap",
                self.limits.max_capacity
            )));
        }
        log::trace!(
            "stack grow: {} -> {capacity} bytes ({} frames live)",
            self.capacity,
            self.frames.len()
        );
        self.capacity = capacity;
        Ok(())
    }

    /// Pushes a frame for `function`.
    ///
    /// The callee's module state is resolved through the context state
    /// resolver; when the caller's frame belongs to the same module, its
    /// resolved state is reused without re-querying. The payload is
    /// zero-initialized to `register_count` default values.
    pub fn function_enter(
        &mut self,
        function: ResolvedFunction,
        frame_type: FrameType,
        register_count: usize,
        cleanup: Option<FrameCleanup>,
    ) -> StatusResult<&mut Frame> {
        let payload_bytes = register_count * std::mem::size_of::<Value>();
        let required = self
            .used
            .checked_add(FRAME_HEADER_SIZE + payload_bytes)
            .ok_or_else(|| Status::resource_exhausted("stack size overflows"))?;
        if required > self.capacity {
            self.grow(required)?;
        }

        let module_name = function.module.name();
        let state = match self.frames.last() {
            Some(parent) if parent.function.module.name() == module_name => {
                parent.state.clone()
            }
            _ => Arc::downgrade(&self.resolver.resolve_state(module_name)?),
        };

        let parent = self.frames.len().checked_sub(1);
        let depth = parent.map_or(0, |index| self.frames[index].depth + 1);
        let mut registers = Vec::new();
        registers.resize_with(register_count, || Value::I32(0));

        self.frames.push(Frame {
            function,
            frame_type,
            state,
            pc: 0,
            depth,
            registers,
            parent,
            size: FRAME_HEADER_SIZE + payload_bytes,
            cleanup,
        });
        self.used = required;
        Ok(self.frames.last_mut().expect("frame just pushed"))
    }

    /// Pops the top frame, running its cleanup. Leave with no top frame
    /// is a contract violation.
    pub fn function_leave(&mut self) -> StatusResult<()> {
        let mut frame = self.frames.pop().ok_or_else(|| {
            debug_assert!(false, "function_leave with no live frame");
            Status::failed_precondition("unbalanced function_leave with no live frame")
        })?;
        if let Some(cleanup) = frame.cleanup.take() {
            cleanup(&mut frame.registers);
        }
        self.used -= frame.size;
        Ok(())
    }

    /// Formats the backtrace line for the current top frame, resolving
    /// the source location through the owning module's hook. Returns
    /// `None` when capture is disabled or the stack is empty.
    pub fn format_top_frame_line(&self) -> Option<String> {
        if !self.limits.capture_backtraces {
            return None;
        }
        let frame = self.frames.last()?;
        let source = frame
            .function
            .module
            .resolve_source_location(frame)
            .map_or_else(|| "-".to_string(), |loc| loc.to_string());
        Some(format!(
            "#{} {} {}@{} {}",
            frame.depth,
            frame.frame_type,
            frame.function.qualified_name(),
            frame.pc,
            source
        ))
    }

    /// Annotates a failing status with the top frame's backtrace line.
    /// No-op when capture is disabled.
    pub fn annotate_failure(&self, status: Status) -> Status {
        match self.format_top_frame_line() {
            Some(line) => status.annotate(line),
            None => status,
        }
    }
}
