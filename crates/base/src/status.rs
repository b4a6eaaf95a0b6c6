//! Status errors for the Tensile runtime and compiler.
//!
//! Every fallible operation in the system returns a [`Status`]: an error
//! kind plus an optional message, an optional source location, and an
//! ordered chain of annotation frames accumulated as the error propagates
//! outward (for example, a formatted VM backtrace).

use std::fmt;

/// The kind of a [`Status`].
///
/// Kinds are the only part of a status that callers are expected to match
/// on; messages and annotations are for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    /// A caller-supplied argument was malformed or out of contract.
    InvalidArgument,
    /// The named entity does not exist.
    NotFound,
    /// The entity being created already exists.
    AlreadyExists,
    /// The operation was rejected because system state forbids it.
    FailedPrecondition,
    /// An index or value fell outside its valid range.
    OutOfRange,
    /// A resource (memory, stack space, pool slots) was exhausted.
    ResourceExhausted,
    /// The operation is not implemented or not supported here.
    Unimplemented,
    /// An invariant the implementation relies on was violated.
    Internal,
    /// A wall-clock deadline expired before the operation completed.
    DeadlineExceeded,
    /// The operation was aborted by a concurrent actor.
    Aborted,
    /// The service or device is currently unavailable.
    Unavailable,
}

impl StatusKind {
    /// Canonical lower-case name, as it appears in rendered statuses.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::InvalidArgument => "invalid-argument",
            StatusKind::NotFound => "not-found",
            StatusKind::AlreadyExists => "already-exists",
            StatusKind::FailedPrecondition => "failed-precondition",
            StatusKind::OutOfRange => "out-of-range",
            StatusKind::ResourceExhausted => "resource-exhausted",
            StatusKind::Unimplemented => "unimplemented",
            StatusKind::Internal => "internal",
            StatusKind::DeadlineExceeded => "deadline-exceeded",
            StatusKind::Aborted => "aborted",
            StatusKind::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved source location attached to a status or a stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Source file path as recorded by the producing module.
    pub file: String,
    /// 1-based line number.
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A kind-typed error with optional message, source location, and
/// annotation chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    kind: StatusKind,
    message: Option<String>,
    location: Option<SourceLocation>,
    annotations: Vec<String>,
}

/// Result alias used across the workspace.
pub type StatusResult<T> = std::result::Result<T, Status>;

macro_rules! status_ctor {
    ($name:ident, $kind:ident) => {
        #[doc = concat!("Creates a `", stringify!($kind), "` status with a message.")]
        pub fn $name(message: impl Into<String>) -> Self {
            Self::with_message(StatusKind::$kind, message)
        }
    };
}

impl Status {
    /// Creates a status of the given kind with no message.
    pub fn new(kind: StatusKind) -> Self {
        Self {
            kind,
            message: None,
            location: None,
            annotations: Vec::new(),
        }
    }

    /// Creates a status of the given kind carrying a message.
    pub fn with_message(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            location: None,
            annotations: Vec::new(),
        }
    }

    status_ctor!(invalid_argument, InvalidArgument);
    status_ctor!(not_found, NotFound);
    status_ctor!(already_exists, AlreadyExists);
    status_ctor!(failed_precondition, FailedPrecondition);
    status_ctor!(out_of_range, OutOfRange);
    status_ctor!(resource_exhausted, ResourceExhausted);
    status_ctor!(unimplemented, Unimplemented);
    status_ctor!(internal, Internal);
    status_ctor!(deadline_exceeded, DeadlineExceeded);
    status_ctor!(aborted, Aborted);
    status_ctor!(unavailable, Unavailable);

    /// The status kind.
    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    /// The message, if one was attached.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The source location, if one was attached.
    pub fn location(&self) -> Option<&SourceLocation> {
        self.location.as_ref()
    }

    /// The annotation frames, oldest first.
    pub fn annotations(&self) -> &[String] {
        &self.annotations
    }

    /// Returns true if the status has the given kind.
    pub fn is(&self, kind: StatusKind) -> bool {
        self.kind == kind
    }

    /// Attaches a source location, replacing any existing one.
    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Appends one annotation frame.
    pub fn annotate(mut self, frame: impl Into<String>) -> Self {
        self.annotations.push(frame.into());
        self
    }

    /// Appends several annotation frames in order.
    pub fn annotate_all<I, S>(mut self, frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.annotations.extend(frames.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(location) = &self.location {
            write!(f, " (at {location})")?;
        }
        for frame in &self.annotations {
            write!(f, "\n  {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}
