//! Cross-module integration tests: import resolution, backtraces,
//! artifact round-trips, and stack balance.

use std::sync::Arc;

use tensile_base::StatusKind;
use tensile_vm::bytecode::{FunctionBuilder, ModuleBuilder};
use tensile_vm::{
    invoke, Instance, InvocationPolicy, Linkage, Module, NativeModule, Signature, Value,
    ValueType,
};

fn exporter_module(name: &str, result: i32) -> Arc<dyn Module> {
    let mut builder = ModuleBuilder::new(name);
    let mut f = FunctionBuilder::new("foo", Signature::new(vec![], vec![ValueType::I32]));
    let value = f.const_i32(result);
    f.ret(&[value]);
    builder.export_function(f);
    builder.build().unwrap() as Arc<dyn Module>
}

fn importer_module() -> Arc<dyn Module> {
    let mut builder = ModuleBuilder::new("y");
    let import = builder.import("x.foo", Signature::new(vec![], vec![ValueType::I32]));
    let mut f = FunctionBuilder::new("call_foo", Signature::new(vec![], vec![ValueType::I32]));
    let results = f.call_import(import, &[], 1);
    f.ret(&results);
    builder.export_function(f);
    builder.build().unwrap() as Arc<dyn Module>
}

#[test]
fn test_import_resolution_routes_to_exporter() {
    let instance = Instance::new();
    let context = instance
        .create_context_with_modules(&[exporter_module("x", 11), importer_module()])
        .unwrap();
    let outputs = invoke(&context, "y.call_foo", &InvocationPolicy::default(), vec![]).unwrap();
    assert_eq!(outputs[0].as_i32().unwrap(), 11);
}

#[test]
fn test_reregistration_routes_to_later_module() {
    // A fresh context with a different exporter of the same name routes
    // the importer to the later registration under reverse-scan lookup.
    let instance = Instance::new();
    let context = instance
        .create_context_with_modules(&[
            exporter_module("x", 11),
            exporter_module("x", 22),
            importer_module(),
        ])
        .unwrap();
    let outputs = invoke(&context, "y.call_foo", &InvocationPolicy::default(), vec![]).unwrap();
    assert_eq!(outputs[0].as_i32().unwrap(), 22);
}

#[test]
fn test_missing_import_rolls_back() {
    let instance = Instance::new();
    let context = instance.create_context();
    let err = context
        .register_modules(&[importer_module()])
        .unwrap_err();
    assert!(err.is(StatusKind::NotFound));
    // The partial registration is not observable.
    assert_eq!(context.module_count(), 0);
}

#[test]
fn test_conv_string_mismatch_names_both_modules() {
    // The exporter declares foo as () -> i32; this importer declares it
    // as () -> i64, so the conv strings differ byte-for-byte.
    let mut builder = ModuleBuilder::new("y");
    let import = builder.import("x.foo", Signature::new(vec![], vec![ValueType::I64]));
    let mut f = FunctionBuilder::new("call_foo", Signature::new(vec![], vec![ValueType::I64]));
    let results = f.call_import(import, &[], 1);
    f.ret(&results);
    builder.export_function(f);
    let importer = builder.build().unwrap() as Arc<dyn Module>;

    let instance = Instance::new();
    let err = instance
        .create_context_with_modules(&[exporter_module("x", 1), importer])
        .unwrap_err();
    assert!(err.is(StatusKind::FailedPrecondition));
    let message = err.message().unwrap_or_default();
    assert!(message.contains("'y'") && message.contains("'x'"));
    assert!(message.contains("0v_I") && message.contains("0v_i"));
}

/// One module with C -> B -> A where A raises `invalid-argument`.
fn backtrace_module() -> Arc<dyn Module> {
    let mut builder = ModuleBuilder::new("chain");

    let mut a = FunctionBuilder::new("a", Signature::new(vec![], vec![]));
    a.source_file("chain.tsl");
    a.source_line(10);
    let zero = a.const_i32(0);
    let _ = zero;
    a.source_line(11);
    a.fail(StatusKind::InvalidArgument, "bad input");
    let a_ordinal = builder.internal_function(a);

    let mut b = FunctionBuilder::new("b", Signature::new(vec![], vec![]));
    b.call_internal(a_ordinal, &[], 0);
    b.ret(&[]);
    let b_ordinal = builder.internal_function(b);

    let mut c = FunctionBuilder::new("c", Signature::new(vec![], vec![]));
    c.call_internal(b_ordinal, &[], 0);
    c.ret(&[]);
    builder.export_function(c);

    builder.build().unwrap() as Arc<dyn Module>
}

#[test]
fn test_backtrace_on_failure() {
    let instance = Instance::new();
    let context = instance
        .create_context_with_modules(&[backtrace_module()])
        .unwrap();
    let err = invoke(&context, "chain.c", &InvocationPolicy::default(), vec![]).unwrap_err();

    assert!(err.is(StatusKind::InvalidArgument));
    assert_eq!(err.message(), Some("bad input"));

    // Three frames, innermost first, each with its PC; A carries its
    // resolved source location, B and C have none.
    let annotations = err.annotations();
    assert_eq!(annotations.len(), 3);
    assert!(annotations[0].contains("chain.a@1"));
    assert!(annotations[0].contains("chain.tsl:11"));
    assert!(annotations[1].contains("chain.b@0"));
    assert!(annotations[1].ends_with("-"));
    assert!(annotations[2].contains("chain.c@0"));
}

#[test]
fn test_backtrace_disabled_by_policy() {
    let instance = Instance::new();
    let context = instance
        .create_context_with_modules(&[backtrace_module()])
        .unwrap();
    let mut policy = InvocationPolicy::default();
    policy.limits.capture_backtraces = false;
    let err = invoke(&context, "chain.c", &policy, vec![]).unwrap_err();
    assert!(err.annotations().is_empty());
}

#[test]
fn test_artifact_roundtrip_invokes_identically() {
    let mut builder = ModuleBuilder::new("math");
    let mut f = FunctionBuilder::new(
        "mac",
        Signature::new(
            vec![ValueType::I32, ValueType::I32, ValueType::I32],
            vec![ValueType::I32],
        ),
    );
    let product = f.mul_i32(f.arg(0), f.arg(1));
    let sum = f.add_i32(product, f.arg(2));
    f.ret(&[sum]);
    builder.export_function(f);
    let module = builder.build().unwrap();

    let bytes = tensile_vm::archive::serialize_module(&module).unwrap();
    let loaded = tensile_vm::archive::deserialize_module(&bytes).unwrap();

    let instance = Instance::new();
    let direct = instance
        .create_context_with_modules(&[module as Arc<dyn Module>])
        .unwrap();
    let reloaded = instance
        .create_context_with_modules(&[loaded as Arc<dyn Module>])
        .unwrap();

    let inputs = vec![Value::I32(6), Value::I32(7), Value::I32(3)];
    let policy = InvocationPolicy::default();
    let a = invoke(&direct, "math.mac", &policy, inputs.clone()).unwrap();
    let b = invoke(&reloaded, "math.mac", &policy, inputs).unwrap();
    assert_eq!(a[0].as_i32().unwrap(), 45);
    assert_eq!(b[0].as_i32().unwrap(), 45);
}

#[test]
fn test_init_export_runs_at_registration() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let counter = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&counter);
    let host = NativeModule::builder("host")
        .export("tick", Signature::new(vec![], vec![]), move |_| {
            observer.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        })
        .build();

    let mut builder = ModuleBuilder::new("inited");
    let tick = builder.import("host.tick", Signature::new(vec![], vec![]));
    let mut init = FunctionBuilder::new("__init", Signature::new(vec![], vec![]));
    init.call_import(tick, &[], 0);
    init.ret(&[]);
    builder.export_function(init);
    let module = builder.build().unwrap();

    let instance = Instance::new();
    let _context = instance
        .create_context_with_modules(&[host as Arc<dyn Module>, module as Arc<dyn Module>])
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lookup_by_ordinal_tables() {
    let module = backtrace_module();
    let signature = module.signature();
    assert_eq!(signature.export_count, 1);
    assert_eq!(signature.internal_count, 2);
    let decl = module
        .lookup_function_by_ordinal(Linkage::Internal, 0)
        .unwrap();
    assert_eq!(decl.name, "a");
    assert!(module
        .lookup_function_by_ordinal(Linkage::Export, 5)
        .is_err());
}
