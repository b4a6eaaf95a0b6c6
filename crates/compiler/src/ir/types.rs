//! Tensor types: ordered dimensions plus an element type.

use std::fmt;

use tensile_hal::ElementType;

/// One tensor dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Static(usize),
    Dynamic,
}

impl Dim {
    pub fn as_static(self) -> Option<usize> {
        match self {
            Dim::Static(extent) => Some(extent),
            Dim::Dynamic => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(extent) => write!(f, "{extent}"),
            Dim::Dynamic => f.write_str("?"),
        }
    }
}

/// A tensor type: shape plus element type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub dims: Vec<Dim>,
    pub element: ElementType,
}

impl TensorType {
    pub fn new(dims: Vec<Dim>, element: ElementType) -> Self {
        Self { dims, element }
    }

    /// A fully static tensor type.
    pub fn static_shape(extents: &[usize], element: ElementType) -> Self {
        Self {
            dims: extents.iter().copied().map(Dim::Static).collect(),
            element,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_fully_static(&self) -> bool {
        self.dims.iter().all(|dim| matches!(dim, Dim::Static(_)))
    }

    /// Static extents, or `None` when any dimension is dynamic.
    pub fn static_extents(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(|dim| dim.as_static()).collect()
    }

    /// Total element count for a fully static shape.
    pub fn element_count(&self) -> Option<usize> {
        self.static_extents()
            .map(|extents| extents.iter().product())
    }

    /// Total byte size for a fully static shape.
    pub fn byte_size(&self) -> Option<usize> {
        self.element_count()
            .map(|count| count * self.element.byte_size())
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<")?;
        for dim in &self.dims {
            write!(f, "{dim}x")?;
        }
        write!(f, "{}>", self.element)
    }
}
