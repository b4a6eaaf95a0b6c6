//! End-to-end execution: graphs compiled to bytecode, loaded next to
//! the HAL module, and driven through the local device.

use std::sync::Arc;

use tensile_base::Ref;
use tensile_compiler::ir::{
    ConstantData, EwOp, GraphFunc, GraphModule, Operation, ScalarValue, TensorType,
};
use tensile_compiler::{compile, CompileOptions};
use tensile_hal::{
    create_hal_module, Buffer, BufferUsage, Device, ElementType, LocalDevice, MemoryType,
};
use tensile_vm::{invoke, Instance, InvocationPolicy, Module, Value};

fn f32_tensor(extents: &[usize]) -> TensorType {
    TensorType::static_shape(extents, ElementType::F32)
}

fn input_buffer(device: &Arc<LocalDevice>, data: &[f32]) -> Ref<Buffer> {
    let buffer = device
        .create_buffer(
            data.len() * 4,
            BufferUsage::TRANSFER | BufferUsage::DISPATCH | BufferUsage::MAPPING,
            MemoryType::HOST_VISIBLE | MemoryType::HOST_COHERENT,
        )
        .unwrap();
    let bytes: Vec<u8> = data.iter().flat_map(|value| value.to_le_bytes()).collect();
    buffer.get().unwrap().map_write(0, &bytes).unwrap();
    buffer
}

fn read_f32s(value: &Value) -> Vec<f32> {
    let buffer = value
        .as_ref_value()
        .unwrap()
        .downcast::<Buffer>()
        .unwrap();
    let buffer = buffer.get().unwrap();
    let bytes = buffer.map_read(0, buffer.byte_length()).unwrap();
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compiles and runs a graph on the local device.
fn run_graph(
    graph: GraphModule,
    options: &CompileOptions,
    inputs: &[&[f32]],
) -> (tensile_compiler::CompileOutput, Vec<Vec<f32>>) {
    let output = compile(graph, options).unwrap();

    let device = LocalDevice::new();
    let hal = create_hal_module(Arc::clone(&device) as Arc<dyn Device>);
    let instance = Instance::new();
    let context = instance
        .create_context_with_modules(&[
            hal as Arc<dyn Module>,
            Arc::clone(&output.vm_module) as Arc<dyn Module>,
        ])
        .unwrap();

    let arguments: Vec<Value> = inputs
        .iter()
        .map(|data| Value::Ref(input_buffer(&device, data).into()))
        .collect();
    let results = invoke(
        &context,
        "model.main",
        &InvocationPolicy::default(),
        arguments,
    )
    .unwrap();
    let outputs = results.iter().map(read_f32s).collect();
    (output, outputs)
}

fn matmul_reference(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0f64;
            for inner in 0..k {
                acc += (a[row * k + inner] as f64) * (b[inner * n + col] as f64);
            }
            out[row * n + col] = acc as f32;
        }
    }
    out
}

#[test]
fn test_elementwise_add() {
    // Two rank-1 buffers of 16 f32 values; one region, one executable,
    // workgroup count (16, 1, 1) with one invocation per workgroup.
    let mut func = GraphFunc::new("main");
    let a = func.add_parameter("a", f32_tensor(&[16]));
    let b = func.add_parameter("b", f32_tensor(&[16]));
    let sum = func
        .add_node(Operation::Elementwise { op: EwOp::Add }, vec![a, b])
        .unwrap();
    func.add_result(sum);
    let mut graph = GraphModule::new("model");
    graph.funcs.push(func);

    let lhs: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let rhs: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    let (output, results) = run_graph(graph, &CompileOptions::default(), &[&lhs, &rhs]);

    assert_eq!(output.module.executables.len(), 1);
    let dispatch = &output.module.funcs[0].dispatches[0];
    assert_eq!(dispatch.workgroup_count, [16, 1, 1]);

    let expected: Vec<f32> = (0..16).map(|v| (2 * v + 1) as f32).collect();
    assert_eq!(results[0], expected);
}

#[test]
fn test_matmul_with_fusion() {
    // dot(A:16x32, B:32x48) + C:16x48 * D:16x48 with C a small splat
    // constant: a single region, workload 768, C rematerialized.
    let mut func = GraphFunc::new("main");
    let a = func.add_parameter("a", f32_tensor(&[16, 32]));
    let b = func.add_parameter("b", f32_tensor(&[32, 48]));
    let d = func.add_parameter("d", f32_tensor(&[16, 48]));
    let c = func
        .add_constant(
            ConstantData::Splat(ScalarValue::F32(0.5)),
            f32_tensor(&[16, 48]),
        )
        .unwrap();
    let product = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
    let scaled = func
        .add_node(Operation::Elementwise { op: EwOp::Mul }, vec![c, d])
        .unwrap();
    let total = func
        .add_node(
            Operation::Elementwise { op: EwOp::Add },
            vec![product, scaled],
        )
        .unwrap();
    func.add_result(total);
    let mut graph = GraphModule::new("model");
    graph.funcs.push(func);

    let lhs: Vec<f32> = (0..16 * 32).map(|v| ((v % 7) as f32) - 3.0).collect();
    let rhs: Vec<f32> = (0..32 * 48).map(|v| ((v % 5) as f32) * 0.25).collect();
    let dee: Vec<f32> = (0..16 * 48).map(|v| (v % 3) as f32).collect();

    let (output, results) = run_graph(graph, &CompileOptions::default(), &[&lhs, &rhs, &dee]);

    // One region holding all three compute ops; the splat constant was
    // rematerialized, not captured or outlined.
    assert_eq!(output.module.executables.len(), 1);
    assert!(output.module.variables.is_empty());
    let dispatch = &output.module.funcs[0].dispatches[0];
    let workload: usize = dispatch
        .workload
        .iter()
        .map(|extent| extent.as_static().unwrap())
        .product();
    assert_eq!(workload, 768);

    let mut expected = matmul_reference(&lhs, &rhs, 16, 32, 48);
    for (index, value) in expected.iter_mut().enumerate() {
        *value += 0.5 * dee[index];
    }
    assert_eq!(results[0], expected);
}

#[test]
fn test_two_chained_dispatches() {
    // R1 = dot(A:5x3, B:3x5); R2 = dot(B, R1). Two executables with
    // distinct signatures survive deduplication, and the first result
    // flows into the second dispatch.
    let mut func = GraphFunc::new("main");
    let a = func.add_parameter("a", f32_tensor(&[5, 3]));
    let b = func.add_parameter("b", f32_tensor(&[3, 5]));
    let r1 = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
    let r2 = func.add_node(Operation::Matmul, vec![b, r1]).unwrap();
    func.add_result(r2);
    let mut graph = GraphModule::new("model");
    graph.funcs.push(func);

    let lhs: Vec<f32> = (0..15).map(|v| v as f32).collect();
    let rhs: Vec<f32> = (0..15).map(|v| (v as f32) * 0.5).collect();
    let (output, results) = run_graph(graph, &CompileOptions::default(), &[&lhs, &rhs]);

    assert_eq!(output.module.executables.len(), 2);
    assert_eq!(output.dedup_removed, 0);
    let dispatches = &output.module.funcs[0].dispatches;
    assert!(dispatches[1].operands.contains(&dispatches[0].results[0]));

    let first = matmul_reference(&lhs, &rhs, 5, 3, 5);
    let expected = matmul_reference(&rhs, &first, 3, 5, 5);
    assert_eq!(results[0], expected);
}

#[test]
fn test_large_constant_outlined_as_variable() {
    // A dense constant above the threshold stays captured and becomes a
    // module-level variable initialized at context registration.
    let extent = 256usize;
    let constant_values: Vec<f32> = (0..extent).map(|v| (v as f32) * 0.125).collect();
    let constant_bytes: Vec<u8> = constant_values
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect();

    let mut func = GraphFunc::new("main");
    let a = func.add_parameter("a", f32_tensor(&[extent]));
    let c = func
        .add_constant(
            ConstantData::Dense(constant_bytes.into()),
            f32_tensor(&[extent]),
        )
        .unwrap();
    let sum = func
        .add_node(Operation::Elementwise { op: EwOp::Add }, vec![a, c])
        .unwrap();
    func.add_result(sum);
    let mut graph = GraphModule::new("model");
    graph.funcs.push(func);

    let input: Vec<f32> = (0..extent).map(|v| v as f32).collect();
    let (output, results) = run_graph(graph, &CompileOptions::default(), &[&input]);

    assert_eq!(output.module.variables.len(), 1);
    let expected: Vec<f32> = input
        .iter()
        .zip(&constant_values)
        .map(|(a, c)| a + c)
        .collect();
    assert_eq!(results[0], expected);
}

#[test]
fn test_constrained_workgroup_count_still_correct() {
    let extent = 1000usize;
    let mut func = GraphFunc::new("main");
    let a = func.add_parameter("a", f32_tensor(&[extent]));
    let b = func.add_parameter("b", f32_tensor(&[extent]));
    let sum = func
        .add_node(Operation::Elementwise { op: EwOp::Mul }, vec![a, b])
        .unwrap();
    func.add_result(sum);
    let mut graph = GraphModule::new("model");
    graph.funcs.push(func);

    let options = CompileOptions {
        constrained_workgroup_count: true,
        ..CompileOptions::default()
    };
    let lhs: Vec<f32> = (0..extent).map(|v| v as f32).collect();
    let rhs: Vec<f32> = (0..extent).map(|v| (v % 9) as f32).collect();
    let (output, results) = run_graph(graph, &options, &[&lhs, &rhs]);

    // Cyclic distribution over a capped workgroup count.
    let dispatch = &output.module.funcs[0].dispatches[0];
    assert!(dispatch.workgroup_count[0] < extent as u32);

    let expected: Vec<f32> = lhs.iter().zip(&rhs).map(|(a, b)| a * b).collect();
    assert_eq!(results[0], expected);
}

#[test]
fn test_artifact_roundtrip_runs_identically() {
    // Serializing then loading the compiled module produces
    // byte-identical results to running the freshly compiled module.
    let mut func = GraphFunc::new("main");
    let a = func.add_parameter("a", f32_tensor(&[8, 8]));
    let b = func.add_parameter("b", f32_tensor(&[8, 8]));
    let product = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
    func.add_result(product);
    let mut graph = GraphModule::new("model");
    graph.funcs.push(func);

    let output = compile(graph, &CompileOptions::default()).unwrap();
    let artifact = tensile_vm::archive::serialize_module(&output.vm_module).unwrap();
    let reloaded = tensile_vm::archive::deserialize_module(&artifact).unwrap();

    let lhs: Vec<f32> = (0..64).map(|v| (v as f32) * 0.5 - 8.0).collect();
    let rhs: Vec<f32> = (0..64).map(|v| ((v * 3) % 11) as f32).collect();

    let mut runs = Vec::new();
    for module in [Arc::clone(&output.vm_module), reloaded] {
        let device = LocalDevice::new();
        let hal = create_hal_module(Arc::clone(&device) as Arc<dyn Device>);
        let instance = Instance::new();
        let context = instance
            .create_context_with_modules(&[hal as Arc<dyn Module>, module as Arc<dyn Module>])
            .unwrap();
        let results = invoke(
            &context,
            "model.main",
            &InvocationPolicy::default(),
            vec![
                Value::Ref(input_buffer(&device, &lhs).into()),
                Value::Ref(input_buffer(&device, &rhs).into()),
            ],
        )
        .unwrap();
        runs.push(read_f32s(&results[0]));
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0], matmul_reference(&lhs, &rhs, 8, 8, 8));
}
