use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use colconv::config::load_layer;
use colconv::{AnyBlob, AnyConvLayer, Blob, ConvMode, Dims3, Element};

/// Run single convolution and deconvolution layers from the command line.
///
/// A layer is described by a JSON file naming its type, its parameters and
/// the blob files holding its weight and optional bias:
///
///   { "type": "Convolution", "params": { "kernel_size": 3, "pad": 1,
///     "num_output": 8 }, "blobs": ["w.cgb", "b.cgb"] }
///
/// Blob paths are relative to the description file.
#[derive(Parser)]
#[command(name = "colconv", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the output shape a layer produces for an input shape.
    Shape {
        /// Layer description (JSON).
        layer: PathBuf,

        /// Input shape as NxCxHxW (e.g. 1x3x224x224).
        #[arg(long, value_parser = parse_shape)]
        input: [usize; 4],

        /// Override the layer type given in the description.
        #[arg(long, value_enum)]
        mode: Option<ConvMode>,
    },

    /// Run a layer on an input blob and write the result.
    Run {
        /// Layer description (JSON).
        layer: PathBuf,

        /// Input blob file.
        #[arg(short, long)]
        input: PathBuf,

        /// Output blob file.
        #[arg(short, long, default_value = "./out.cgb")]
        output: PathBuf,

        /// Override the layer type given in the description.
        #[arg(long, value_enum)]
        mode: Option<ConvMode>,
    },

    /// Show the shape, element type and value range of a blob file.
    Info {
        /// Blob file.
        path: PathBuf,
    },
}

fn parse_shape(s: &str) -> std::result::Result<[usize; 4], String> {
    let dims = s
        .split(['x', 'X', ','])
        .map(|d| d.trim().parse::<usize>().map_err(|e| format!("bad dimension `{d}`: {e}")))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    <[usize; 4]>::try_from(dims).map_err(|d| format!("expected 4 dimensions, got {}", d.len()))
}

fn load(path: &Path, mode_override: Option<ConvMode>) -> Result<AnyConvLayer> {
    let (described, params) = load_layer(path)?;
    let mode = mode_override.unwrap_or(described);
    if mode != described {
        log::info!("{}: running as {mode} instead of {described}", path.display());
    }
    AnyConvLayer::new(mode, &params)
        .with_context(|| format!("failed to build layer from {}", path.display()))
}

fn run_shape(layer: &Path, input: [usize; 4], mode: Option<ConvMode>) -> Result<()> {
    let layer = load(layer, mode)?;
    let derived = layer.infer(Dims3::of(input))?;
    let top = derived.top_shape(input[0]);
    println!("{} ({})", layer.mode(), layer.elem_type());
    println!("  input:  {}x{}x{}x{}", input[0], input[1], input[2], input[3]);
    println!("  output: {}x{}x{}x{}", top[0], top[1], top[2], top[3]);
    println!(
        "  groups: {} in / {} out channels per group",
        derived.inp_group_cn, derived.out_group_cn
    );
    Ok(())
}

fn run_layer(layer: &Path, input: &Path, output: &Path, mode: Option<ConvMode>) -> Result<()> {
    let mut layer = load(layer, mode)?;
    let blob = AnyBlob::read(input)?;
    if blob.elem_type() != layer.elem_type() {
        bail!(
            "input {} is {} but the layer weights are {}",
            input.display(),
            blob.elem_type(),
            layer.elem_type()
        );
    }

    let mut outputs = layer.allocate(&[&blob])?;
    layer.forward(&[&blob], &mut outputs)?;
    let Some(result) = outputs.pop() else {
        bail!("layer produced no output");
    };
    result.write(output)?;
    println!("{} {blob} -> {result}", layer.mode());
    println!("  written to {}", output.display());
    Ok(())
}

fn value_range<T: Element>(blob: &Blob<T>) -> Option<(T, T)> {
    let mut values = blob.as_slice().iter().copied();
    let first = values.next()?;
    Some(values.fold((first, first), |(lo, hi), v| {
        (if v < lo { v } else { lo }, if v > hi { v } else { hi })
    }))
}

fn run_info(path: &Path) -> Result<()> {
    let blob = AnyBlob::read(path)?;
    println!("{}", path.display());
    println!("  shape:    {blob}");
    println!("  elements: {}", blob.total());
    let range = match &blob {
        AnyBlob::F32(b) => value_range(b).map(|(lo, hi)| (lo as f64, hi as f64)),
        AnyBlob::F64(b) => value_range(b),
    };
    if let Some((lo, hi)) = range {
        println!("  range:    [{lo}, {hi}]");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Shape { layer, input, mode } => run_shape(&layer, input, mode)?,
        Commands::Run {
            layer,
            input,
            output,
            mode,
        } => run_layer(&layer, &input, &output, mode)?,
        Commands::Info { path } => run_info(&path)?,
    }

    Ok(())
}
