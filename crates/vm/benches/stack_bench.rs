//! Benchmarks for the hot stack path: frame enter/leave and small
//! bytecode invocations.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use tensile_vm::bytecode::{FunctionBuilder, ModuleBuilder};
use tensile_vm::{invoke, Instance, InvocationPolicy, Module, Signature, Value, ValueType};

fn bench_invoke_add(c: &mut Criterion) {
    let mut builder = ModuleBuilder::new("bench");
    let mut f = FunctionBuilder::new(
        "add",
        Signature::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]),
    );
    let sum = f.add_i32(f.arg(0), f.arg(1));
    f.ret(&[sum]);
    builder.export_function(f);
    let module = builder.build().unwrap();

    let instance = Instance::new();
    let context = instance
        .create_context_with_modules(&[module as Arc<dyn Module>])
        .unwrap();
    let policy = InvocationPolicy::default();

    c.bench_function("invoke_add", |b| {
        b.iter(|| {
            invoke(
                &context,
                "bench.add",
                &policy,
                vec![Value::I32(2), Value::I32(3)],
            )
            .unwrap()
        })
    });
}

fn bench_nested_calls(c: &mut Criterion) {
    let mut builder = ModuleBuilder::new("bench");
    let mut leaf = FunctionBuilder::new("leaf", Signature::new(vec![], vec![ValueType::I32]));
    let one = leaf.const_i32(1);
    leaf.ret(&[one]);
    let mut callee = builder.internal_function(leaf);
    for level in 0..16 {
        let mut f = FunctionBuilder::new(
            format!("mid_{level}"),
            Signature::new(vec![], vec![ValueType::I32]),
        );
        let results = f.call_internal(callee, &[], 1);
        f.ret(&results);
        callee = builder.internal_function(f);
    }
    let mut entry = FunctionBuilder::new("entry", Signature::new(vec![], vec![ValueType::I32]));
    let results = entry.call_internal(callee, &[], 1);
    entry.ret(&results);
    builder.export_function(entry);
    let module = builder.build().unwrap();

    let instance = Instance::new();
    let context = instance
        .create_context_with_modules(&[module as Arc<dyn Module>])
        .unwrap();
    let policy = InvocationPolicy::default();

    c.bench_function("nested_calls_16", |b| {
        b.iter(|| invoke(&context, "bench.entry", &policy, vec![]).unwrap())
    });
}

criterion_group!(benches, bench_invoke_add, bench_nested_calls);
criterion_main!(benches);
