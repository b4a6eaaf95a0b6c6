//! Property tests for the execution stack.

use std::sync::Arc;

use proptest::prelude::*;
use tensile_vm::{invoke, Instance, InvocationPolicy, Module, NativeModule, Signature, Value};
use tensile_vm::bytecode::{FunctionBuilder, ModuleBuilder};
use tensile_vm::ValueType;

/// Builds a module whose export calls through `depth` nested internal
/// functions, each with `registers` live registers, before returning.
fn nested_module(depth: u32, registers: u16) -> Arc<dyn Module> {
    let mut builder = ModuleBuilder::new("nest");
    let mut previous: Option<u32> = None;
    for level in 0..depth {
        let mut f = FunctionBuilder::new(
            format!("level_{level}"),
            Signature::new(vec![], vec![ValueType::I32]),
        );
        let mut last = f.const_i32(level as i32);
        for _ in 0..registers {
            last = f.add_i32(last, last);
        }
        match previous {
            Some(callee) => {
                let results = f.call_internal(callee, &[], 1);
                f.ret(&results);
            }
            None => f.ret(&[last]),
        }
        previous = Some(builder.internal_function(f));
    }
    let mut entry = FunctionBuilder::new("entry", Signature::new(vec![], vec![ValueType::I32]));
    match previous {
        Some(callee) => {
            let results = entry.call_internal(callee, &[], 1);
            entry.ret(&results);
        }
        None => {
            let zero = entry.const_i32(0);
            entry.ret(&[zero]);
        }
    }
    builder.export_function(entry);
    builder.build().unwrap() as Arc<dyn Module>
}

proptest! {
    #[test]
    fn balanced_invocations_drain_the_stack(
        depth in 0u32..12,
        registers in 0u16..24,
        repeats in 1usize..4,
    ) {
        let instance = Instance::new();
        let context = instance
            .create_context_with_modules(&[nested_module(depth, registers)])
            .unwrap();
        for _ in 0..repeats {
            // A successful invocation implies every enter was matched by
            // a leave: invoke() debug-asserts the arena drained to zero.
            let outputs = invoke(
                &context,
                "nest.entry",
                &InvocationPolicy::default(),
                vec![],
            ).unwrap();
            prop_assert_eq!(outputs.len(), 1);
        }
    }

    #[test]
    fn failing_invocations_also_drain_the_stack(depth in 1u32..10) {
        let mut builder = ModuleBuilder::new("failing");
        let mut inner = FunctionBuilder::new("inner", Signature::new(vec![], vec![]));
        inner.fail(tensile_base::StatusKind::Aborted, "stop");
        let mut callee = builder.internal_function(inner);
        for level in 0..depth {
            let mut f = FunctionBuilder::new(
                format!("mid_{level}"),
                Signature::new(vec![], vec![]),
            );
            f.call_internal(callee, &[], 0);
            f.ret(&[]);
            callee = builder.internal_function(f);
        }
        let mut entry = FunctionBuilder::new("entry", Signature::new(vec![], vec![]));
        entry.call_internal(callee, &[], 0);
        entry.ret(&[]);
        builder.export_function(entry);
        let module = builder.build().unwrap() as Arc<dyn Module>;

        let instance = Instance::new();
        let context = instance.create_context_with_modules(&[module]).unwrap();
        let err = invoke(&context, "failing.entry", &InvocationPolicy::default(), vec![])
            .unwrap_err();
        // Every live frame contributed one backtrace line.
        prop_assert_eq!(err.annotations().len(), depth as usize + 2);
    }
}

#[test]
fn native_and_bytecode_frames_interleave() {
    let host = NativeModule::builder("host")
        .export(
            "double",
            Signature::new(vec![ValueType::I32], vec![ValueType::I32]),
            |args| Ok(vec![Value::I32(args[0].as_i32()? * 2)]),
        )
        .build();

    let mut builder = ModuleBuilder::new("caller");
    let double = builder.import(
        "host.double",
        Signature::new(vec![ValueType::I32], vec![ValueType::I32]),
    );
    let mut f = FunctionBuilder::new(
        "quadruple",
        Signature::new(vec![ValueType::I32], vec![ValueType::I32]),
    );
    let once = f.call_import(double, &[f.arg(0)], 1);
    let twice = f.call_import(double, &[once[0]], 1);
    f.ret(&twice);
    builder.export_function(f);
    let module = builder.build().unwrap();

    let instance = Instance::new();
    let context = instance
        .create_context_with_modules(&[
            host as Arc<dyn Module>,
            module as Arc<dyn Module>,
        ])
        .unwrap();
    let outputs = invoke(
        &context,
        "caller.quadruple",
        &InvocationPolicy::default(),
        vec![Value::I32(5)],
    )
    .unwrap();
    assert_eq!(outputs[0].as_i32().unwrap(), 20);
}
