//! halrt - compile, run and cross-check modules on the available backends.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use halrt::compare::{parse_target_backends, run_on_backends, HostValue};
use halrt::compiler::Pipeline;
use halrt_cli::{
    compile_source, list_devices, parse_arg, read_module, read_source, register_backends,
    run_module, write_module,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "halrt")]
#[command(about = "Hardware-abstraction runtime for compiled tensor programs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered drivers and their devices
    Devices,
    /// Lower a JSON source module into a compiled module blob
    Compile {
        /// Path to the JSON source module
        #[arg(value_name = "SOURCE")]
        source: PathBuf,

        /// Output module path
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Lowering pipeline: hal or vm
        #[arg(long, default_value = "hal")]
        pipeline: Pipeline,
    },
    /// Run one function of a compiled module and print its check report
    Run {
        #[arg(value_name = "MODULE")]
        module: PathBuf,

        #[arg(short, long)]
        function: String,

        /// Backends to try in order (e.g. "cuda,dylib,interp")
        #[arg(short, long)]
        driver: Option<String>,

        /// Function argument, e.g. i32:3 or f32[4]:1,2,3,4 (repeatable)
        #[arg(short = 'a', long = "arg", value_parser = parse_arg)]
        args: Vec<HostValue>,
    },
    /// Run one function on several backends and compare the results
    Compare {
        #[arg(value_name = "MODULE")]
        module: PathBuf,

        #[arg(short, long)]
        function: String,

        /// Comma-separated backends, e.g. "interp,dylib"
        #[arg(long)]
        target_backends: String,

        #[arg(long, default_value_t = 1e-5)]
        rtol: f64,

        #[arg(long, default_value_t = 1e-6)]
        atol: f64,

        #[arg(short = 'a', long = "arg", value_parser = parse_arg)]
        args: Vec<HostValue>,
    },
}

fn main() -> Result<ExitCode> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
    register_backends();

    let cli = Cli::parse();
    match cli.command {
        Commands::Devices => cmd_devices(),
        Commands::Compile {
            source,
            output,
            pipeline,
        } => cmd_compile(source, output, pipeline),
        Commands::Run {
            module,
            function,
            driver,
            args,
        } => cmd_run(module, &function, driver, &args),
        Commands::Compare {
            module,
            function,
            target_backends,
            rtol,
            atol,
            args,
        } => cmd_compare(module, &function, &target_backends, rtol, atol, &args),
    }
}

fn cmd_devices() -> Result<ExitCode> {
    for listing in list_devices() {
        match listing.devices {
            Ok(devices) => {
                println!("{}:", listing.driver);
                for info in devices {
                    let features: Vec<&str> = info.features.iter().map(String::as_str).collect();
                    println!(
                        "  {}:{}  {}  [{}]  {}",
                        info.driver_name,
                        info.ordinal,
                        info.name,
                        info.backend,
                        features.join(", ")
                    );
                }
            }
            Err(err) => println!("{}: {err}", listing.driver),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_compile(source: PathBuf, output: PathBuf, pipeline: Pipeline) -> Result<ExitCode> {
    let module = compile_source(&read_source(&source)?, pipeline)?;
    write_module(&module, &output)?;
    eprintln!(
        "Wrote module '{}' ({} functions, {} imports) to {}",
        module.name,
        module.functions.len(),
        module.imports.len(),
        output.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_run(
    module: PathBuf,
    function: &str,
    driver: Option<String>,
    args: &[HostValue],
) -> Result<ExitCode> {
    let module = read_module(&module)?;
    let drivers = driver.unwrap_or_else(|| halrt::RuntimeConfig::global().default_driver.clone());
    let outcome = run_module(module, function, args, &drivers)?;

    println!("backend: {}", outcome.backend);
    for (index, value) in outcome.values.iter().enumerate() {
        println!("result #{index}: {value}");
    }
    for check in &outcome.checks.outcomes {
        println!("{check}");
    }
    if outcome.checks.all_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!(
            "{} of {} checks failed",
            outcome.checks.failure_count(),
            outcome.checks.len()
        );
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_compare(
    module: PathBuf,
    function: &str,
    target_backends: &str,
    rtol: f64,
    atol: f64,
    args: &[HostValue],
) -> Result<ExitCode> {
    let module = read_module(&module)?;
    let backends = parse_target_backends(target_backends)?;
    let results = run_on_backends(&module, function, args, &backends)
        .with_context(|| format!("failed to run '{function}' on {}", backends.join(", ")))?;

    for run in &results.runs {
        println!(
            "{}: {} results, {} of {} checks passed",
            run.backend,
            run.values.len(),
            run.checks.len() - run.checks.failure_count(),
            run.checks.len()
        );
    }
    let disagreements = results.collect_disagreements(rtol, atol);
    if disagreements.is_empty() {
        println!("all backends agree (rtol={rtol}, atol={atol})");
        return Ok(ExitCode::SUCCESS);
    }
    for disagreement in &disagreements {
        println!("{disagreement}");
    }
    Ok(ExitCode::FAILURE)
}
