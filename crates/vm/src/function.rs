//! Function declarations, signatures, and resolved references.

use std::sync::Arc;

use tensile_base::{Status, StatusResult};

use crate::module::Module;
use crate::value::{Value, ValueType};

/// Linkage of a function within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    /// Declared here, defined by some earlier-registered module.
    Import,
    /// Defined and callable only within the module.
    Internal,
    /// Defined here and visible to other modules and the host.
    Export,
}

impl std::fmt::Display for Linkage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Linkage::Import => "import",
            Linkage::Internal => "internal",
            Linkage::Export => "export",
        };
        f.write_str(name)
    }
}

/// Argument and result types of a function, with an optional variadic
/// tail segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    args: Vec<ValueType>,
    results: Vec<ValueType>,
    variadic: Vec<ValueType>,
}

impl Signature {
    pub fn new(args: Vec<ValueType>, results: Vec<ValueType>) -> Self {
        Self {
            args,
            results,
            variadic: Vec::new(),
        }
    }

    pub fn with_variadic(
        args: Vec<ValueType>,
        results: Vec<ValueType>,
        variadic: Vec<ValueType>,
    ) -> Self {
        Self {
            args,
            results,
            variadic,
        }
    }

    pub fn args(&self) -> &[ValueType] {
        &self.args
    }

    pub fn results(&self) -> &[ValueType] {
        &self.results
    }

    pub fn variadic(&self) -> &[ValueType] {
        &self.variadic
    }

    /// Validates a caller-supplied argument list against this signature.
    pub fn check_arguments(&self, function_name: &str, values: &[Value]) -> StatusResult<()> {
        if self.variadic.is_empty() {
            if values.len() != self.args.len() {
                return Err(Status::invalid_argument(format!(
                    "'{function_name}' expects {} arguments, got {}",
                    self.args.len(),
                    values.len()
                )));
            }
        } else {
            let extra = values.len().checked_sub(self.args.len()).ok_or_else(|| {
                Status::invalid_argument(format!(
                    "'{function_name}' expects at least {} arguments, got {}",
                    self.args.len(),
                    values.len()
                ))
            })?;
            if extra % self.variadic.len() != 0 {
                return Err(Status::invalid_argument(format!(
                    "'{function_name}' variadic tail of {extra} values is not a multiple \
                     of the segment arity {}",
                    self.variadic.len()
                )));
            }
        }
        for (index, value) in values.iter().enumerate() {
            let expected = if index < self.args.len() {
                self.args[index]
            } else {
                self.variadic[(index - self.args.len()) % self.variadic.len()]
            };
            if value.value_type() != expected {
                return Err(Status::invalid_argument(format!(
                    "'{function_name}' argument {index} expects {expected}, got {}",
                    value.value_type()
                )));
            }
        }
        Ok(())
    }

    /// Validates produced results against this signature.
    pub fn check_results(&self, function_name: &str, values: &[Value]) -> StatusResult<()> {
        if values.len() != self.results.len() {
            return Err(Status::internal(format!(
                "'{function_name}' produced {} results, signature declares {}",
                values.len(),
                self.results.len()
            )));
        }
        for (index, (value, expected)) in values.iter().zip(&self.results).enumerate() {
            if value.value_type() != *expected {
                return Err(Status::internal(format!(
                    "'{function_name}' result {index} is {}, signature declares {expected}",
                    value.value_type()
                )));
            }
        }
        Ok(())
    }
}

/// A function as declared by its module.
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    /// Unqualified name within the module.
    pub name: String,
    pub linkage: Linkage,
    /// Ordinal within the linkage table.
    pub ordinal: usize,
    pub signature: Signature,
    /// Calling-convention descriptor; empty opts out of matching.
    pub conv: String,
}

/// A function bound to the concrete module that defines it.
#[derive(Clone)]
pub struct ResolvedFunction {
    pub module: Arc<dyn Module>,
    pub decl: Arc<FunctionDecl>,
}

impl ResolvedFunction {
    /// `module.function` form used in diagnostics and lookups.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module.name(), self.decl.name)
    }
}

impl std::fmt::Debug for ResolvedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ResolvedFunction({}.{})",
            self.module.name(),
            self.decl.name
        )
    }
}
