//! Rastercube CLI - evaluate a serialized cube graph into GeoTIFF files.

use anyhow::{bail, Context, Result};
use rastercube::prelude::*;
use std::path::PathBuf;

/// Parsed command line.
#[derive(Debug, Default)]
struct Options {
    graph: PathBuf,
    out_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    prefix: String,
    cog: bool,
    info: bool,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("rastercube");

    match args.get(1).map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => {
            print_usage(program);
            Ok(())
        }
        Some("version") | Some("--version") => {
            println!("{} {}", rastercube::NAME, rastercube::VERSION);
            Ok(())
        }
        Some(_) => {
            let options = parse_options(&args[1..])?;
            run(options)
        }
    }
}

fn print_usage(program: &str) {
    println!("Usage: {} <graph.json> <out_dir> [options]", program);
    println!("       {} version", program);
    println!();
    println!("Options:");
    println!("  --config <file>   Engine configuration (TOML)");
    println!("  --prefix <name>   Output file prefix (default: cube)");
    println!("  --cog             Also write one overview GeoTIFF per time step");
    println!("  --info            Print the cube summary as JSON instead of writing files");
    println!();
    println!("Graphs may only reference image collections known to the registry;");
    println!("graphs built from dummy cubes and operators run without any.");
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options {
        prefix: "cube".to_string(),
        ..Options::default()
    };
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter.next().context("--config needs a file")?;
                options.config = Some(PathBuf::from(value));
            }
            "--prefix" => {
                options.prefix = iter.next().context("--prefix needs a value")?.clone();
            }
            "--cog" => options.cog = true,
            "--info" => options.info = true,
            flag if flag.starts_with("--") => bail!("Unknown option: {}", flag),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let mut positional = positional.into_iter();
    options.graph = positional.next().context("Missing graph file")?;
    options.out_dir = positional.next();
    if let Some(extra) = positional.next() {
        bail!("Unexpected argument: {}", extra.display());
    }
    if options.out_dir.is_none() && !options.info {
        bail!("Missing output directory");
    }
    Ok(options)
}

fn run(options: Options) -> Result<()> {
    let config = match &options.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let engine = Engine::init(config)?;

    let json = std::fs::read_to_string(&options.graph)
        .with_context(|| format!("Cannot read graph {}", options.graph.display()))?;
    let graph = SerializedCube::from_json(&json)
        .with_context(|| format!("Cannot parse graph {}", options.graph.display()))?;
    let cube = engine.registry().build(&graph.root)?;

    if options.info {
        println!("{}", serde_json::to_string_pretty(&CubeInfo::of(cube.as_ref()))?);
        engine.teardown();
        return Ok(());
    }

    let out_dir = options.out_dir.context("Missing output directory")?;
    let mut sink = GeoTiffSink::new(&out_dir, options.prefix).with_bounds_sidecar(true);
    if options.cog {
        sink = sink.with_cog(CogOptions::default());
    }

    let report = engine.scheduler().run(&cube, ChunkSelection::All, &mut sink)?;
    println!(
        "Wrote {} of {} chunks to {} in {:.1} s",
        report.chunks_written,
        report.chunks_total,
        out_dir.display(),
        report.duration.as_secs_f64()
    );
    if !report.failed_chunks.is_empty() {
        println!(
            "{} chunks failed and were written as nodata: {:?}",
            report.failed_chunks.len(),
            report.failed_chunks
        );
    }
    engine.teardown();
    Ok(())
}
