//! The `tensile` driver: compiles graph descriptions into artifacts and
//! runs artifact exports on a local device.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tensile_base::{Ref, Status, StatusResult};
use tensile_compiler::ir::GraphDesc;
use tensile_compiler::preprocess::PreprocessOptions;
use tensile_compiler::{compile, CompileOptions};
use tensile_hal::{
    create_hal_module, driver, Buffer, BufferUsage, Device, MemoryType,
};
use tensile_vm::{archive, invoke, Instance, InvocationPolicy, Module, Value};

#[derive(Parser)]
#[command(name = "tensile", version, about = "Tensile tensor-program compiler and runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a graph description into a bytecode artifact.
    Compile(CompileArgs),
    /// Run an exported function of a compiled artifact.
    Run(RunArgs),
}

#[derive(Args)]
struct CompileArgs {
    /// Input graph description.
    input: PathBuf,

    /// Input format selector.
    #[arg(long, default_value = "json-graph")]
    input_type: String,

    /// Output artifact path.
    #[arg(short, long)]
    output: PathBuf,

    /// Target backends; may be given more than once.
    #[arg(long = "target", default_value = "host-loop")]
    targets: Vec<String>,

    /// Emit zero-input benchmark wrappers for every export.
    #[arg(long)]
    emit_benchmark_funcs: bool,

    /// Log every formed dispatch.
    #[arg(long)]
    dispatch_trace: bool,

    /// Rewrite 1x1 convolutions into matmuls.
    #[arg(long)]
    conv1x1_to_matmul: bool,

    /// Rewrite convolutions through im2col.
    #[arg(long)]
    conv_to_img2col: bool,

    /// Pad matmul dimensions up to multiples of this size.
    #[arg(long)]
    padding_size: Option<usize>,

    /// Rewrite matmuls into mmt4d; requires the three tile sizes.
    #[arg(long)]
    matmul_to_mmt4d: bool,

    /// mmt4d tile size M0.
    #[arg(long)]
    mmt4d_m0: Option<usize>,

    /// mmt4d tile size K0.
    #[arg(long)]
    mmt4d_k0: Option<usize>,

    /// mmt4d tile size N0.
    #[arg(long)]
    mmt4d_n0: Option<usize>,

    /// Distribute cyclically under a fixed workgroup count.
    #[arg(long)]
    constrained_workgroup_count: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Compiled artifact path.
    artifact: PathBuf,

    /// Export to invoke, as `module.function` or a bare function name.
    #[arg(long, default_value = "main")]
    function: String,

    /// JSON array of f32 input arrays, e.g. `[[1,2],[3,4]]`.
    #[arg(long, default_value = "[]")]
    inputs: String,
}

fn mmt4d_tiles(args: &CompileArgs) -> StatusResult<Option<(usize, usize, usize)>> {
    if !args.matmul_to_mmt4d {
        if args.mmt4d_m0.is_some() || args.mmt4d_k0.is_some() || args.mmt4d_n0.is_some() {
            return Err(Status::invalid_argument(
                "mmt4d tile sizes require --matmul-to-mmt4d",
            ));
        }
        return Ok(None);
    }
    match (args.mmt4d_m0, args.mmt4d_k0, args.mmt4d_n0) {
        (Some(m0), Some(k0), Some(n0)) if m0 > 0 && k0 > 0 && n0 > 0 => {
            Ok(Some((m0, k0, n0)))
        }
        (Some(_), Some(_), Some(_)) => Err(Status::invalid_argument(
            "mmt4d tile sizes M0/K0/N0 must all be nonzero",
        )),
        _ => Err(Status::invalid_argument(
            "--matmul-to-mmt4d requires --mmt4d-m0, --mmt4d-k0, and --mmt4d-n0 together",
        )),
    }
}

fn run_compile(args: &CompileArgs) -> StatusResult<()> {
    if args.input_type != "json-graph" {
        return Err(Status::unimplemented(format!(
            "unknown input type '{}'",
            args.input_type
        )));
    }
    let text = std::fs::read_to_string(&args.input)
        .map_err(|e| Status::not_found(format!("cannot read {}: {e}", args.input.display())))?;
    let graph = GraphDesc::from_json(&text)?.build()?;

    let options = CompileOptions {
        preprocess: PreprocessOptions {
            conv1x1_to_matmul: args.conv1x1_to_matmul,
            conv_to_img2col: args.conv_to_img2col,
            padding_size: args.padding_size,
            mmt4d_tiles: mmt4d_tiles(args)?,
        },
        targets: args.targets.clone(),
        constrained_workgroup_count: args.constrained_workgroup_count,
        emit_benchmark_funcs: args.emit_benchmark_funcs,
        dispatch_trace: args.dispatch_trace,
        ..CompileOptions::default()
    };

    let output = compile(graph, &options)?;
    tracing::info!(
        executables = output.module.executables.len(),
        deduplicated = output.dedup_removed,
        "compiled"
    );

    let bytes = archive::serialize_module(&output.vm_module)?;
    std::fs::write(&args.output, &bytes).map_err(|e| {
        Status::internal(format!("cannot write {}: {e}", args.output.display()))
    })?;
    println!(
        "wrote {} ({} bytes, {} executables)",
        args.output.display(),
        bytes.len(),
        output.module.executables.len()
    );
    Ok(())
}

fn parse_inputs(text: &str) -> StatusResult<Vec<Vec<f32>>> {
    let parsed: Vec<Vec<f32>> = serde_json::from_str(text)
        .map_err(|e| Status::invalid_argument(format!("malformed --inputs JSON: {e}")))?;
    Ok(parsed)
}

fn input_buffer(device: &Arc<dyn Device>, data: &[f32]) -> StatusResult<Ref<Buffer>> {
    let buffer = device.create_buffer(
        data.len() * 4,
        BufferUsage::TRANSFER | BufferUsage::DISPATCH | BufferUsage::MAPPING,
        MemoryType::HOST_VISIBLE | MemoryType::HOST_COHERENT,
    )?;
    let bytes: Vec<u8> = data.iter().flat_map(|value| value.to_le_bytes()).collect();
    buffer.get()?.map_write(0, &bytes)?;
    Ok(buffer)
}

fn run_artifact(args: &RunArgs) -> StatusResult<()> {
    let bytes = std::fs::read(&args.artifact).map_err(|e| {
        Status::not_found(format!("cannot read {}: {e}", args.artifact.display()))
    })?;
    let module = archive::deserialize_module(&bytes)?;
    let module_name = module.name().to_string();

    driver::register_local_driver();
    let device = driver::create_device("local")?;
    let hal = create_hal_module(Arc::clone(&device));

    let instance = Instance::new();
    let context = instance.create_context_with_modules(&[
        hal as Arc<dyn Module>,
        module as Arc<dyn Module>,
    ])?;

    let qualified = if args.function.contains('.') {
        args.function.clone()
    } else {
        format!("{module_name}.{}", args.function)
    };
    let inputs = parse_inputs(&args.inputs)?
        .iter()
        .map(|data| Ok(Value::Ref(input_buffer(&device, data)?.into())))
        .collect::<StatusResult<Vec<_>>>()?;

    let results = invoke(&context, &qualified, &InvocationPolicy::default(), inputs)?;

    let mut rendered = Vec::new();
    for result in &results {
        let buffer = result.as_ref_value()?.downcast::<Buffer>()?;
        let buffer = buffer.get()?;
        let bytes = buffer.map_read(0, buffer.byte_length())?;
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        rendered.push(values);
    }
    println!(
        "{}",
        serde_json::to_string(&rendered)
            .map_err(|e| Status::internal(format!("cannot render outputs: {e}")))?
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match &cli.command {
        Command::Compile(args) => run_compile(args),
        Command::Run(args) => run_artifact(args),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(status) => {
            eprintln!("error: {status}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_args(matmul_to_mmt4d: bool, tiles: [Option<usize>; 3]) -> CompileArgs {
        CompileArgs {
            input: PathBuf::from("model.json"),
            input_type: "json-graph".into(),
            output: PathBuf::from("model.tsla"),
            targets: vec!["host-loop".into()],
            emit_benchmark_funcs: false,
            dispatch_trace: false,
            conv1x1_to_matmul: false,
            conv_to_img2col: false,
            padding_size: None,
            matmul_to_mmt4d,
            mmt4d_m0: tiles[0],
            mmt4d_k0: tiles[1],
            mmt4d_n0: tiles[2],
            constrained_workgroup_count: false,
        }
    }

    #[test]
    fn test_mmt4d_tile_validation() {
        assert_eq!(
            mmt4d_tiles(&compile_args(false, [None, None, None])).unwrap(),
            None
        );
        assert_eq!(
            mmt4d_tiles(&compile_args(true, [Some(8), Some(4), Some(8)])).unwrap(),
            Some((8, 4, 8))
        );
        // All three are required together.
        assert!(mmt4d_tiles(&compile_args(true, [Some(8), None, Some(8)])).is_err());
        // Zero tiles are rejected.
        assert!(mmt4d_tiles(&compile_args(true, [Some(8), Some(0), Some(8)])).is_err());
        // Tiles without the toggle are rejected.
        assert!(mmt4d_tiles(&compile_args(false, [Some(8), Some(4), Some(8)])).is_err());
    }

    #[test]
    fn test_parse_inputs() {
        assert_eq!(
            parse_inputs("[[1, 2.5], [3]]").unwrap(),
            vec![vec![1.0, 2.5], vec![3.0]]
        );
        assert!(parse_inputs("not json").is_err());
    }
}
