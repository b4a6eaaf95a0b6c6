//! The sole host entry point into the VM.

use std::sync::Arc;

use tensile_base::StatusResult;

use crate::context::Context;
use crate::module::{CallRecord, StateResolver};
use crate::stack::{FrameType, Stack, StackLimits};
use crate::value::Value;

/// Per-invocation policy.
#[derive(Debug, Clone, Default)]
pub struct InvocationPolicy {
    pub limits: StackLimits,
}

/// Invokes an exported function by qualified `module.function` name.
///
/// Inputs are validated against the function's signature before any
/// frame is pushed; a mismatch is `invalid-argument`. On failure the
/// returned status carries the message and the formatted backtrace of
/// the frames that were live at the point of failure.
pub fn invoke(
    context: &Arc<Context>,
    qualified_name: &str,
    policy: &InvocationPolicy,
    inputs: Vec<Value>,
) -> StatusResult<Vec<Value>> {
    let function = context.resolve_function(qualified_name)?;
    function
        .decl
        .signature
        .check_arguments(&function.decl.name, &inputs)?;

    let mut stack = Stack::new(
        Arc::clone(context) as Arc<dyn StateResolver>,
        policy.limits.clone(),
    );

    // The external frame marks the host boundary of the invocation.
    stack.function_enter(function.clone(), FrameType::External, 0, None)?;
    let outcome = function.module.begin_call(
        &mut stack,
        CallRecord {
            function: function.clone(),
            arguments: inputs,
        },
    );
    stack.function_leave()?;

    let outputs = outcome?;
    function
        .decl
        .signature
        .check_results(&function.decl.name, &outputs)?;
    debug_assert_eq!(stack.used_bytes(), 0, "invocation left frames behind");
    Ok(outputs)
}
