//! Netlist compiler CLI
//!
//! Usage:
//!   netlistc netlist.json
//!   netlistc netlist.json --arch wormhole_b0 --json
//!   netlistc netlist.json --run main --param '$count=4'

use std::collections::BTreeMap;

use clap::Parser as ClapParser;
use colored::Colorize;
use log::info;

use netlist_frontend::program::ExecuteInstruction;
use netlist_frontend::{
    compile_file, Arch, CompileOptions, CompileResult, ExecutionHooks, Netlist, ProgramExecutor,
    StepOutcome,
};

#[derive(ClapParser, Debug)]
#[command(name = "netlistc")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Parses, derives and verifies dataflow netlists")]
struct Args {
    /// Netlist JSON file
    #[arg(value_name = "NETLIST")]
    netlist: String,

    /// Target architecture; overrides ARCH_NAME
    #[arg(short = 'a', long = "arch")]
    arch: Option<Arch>,

    /// Dump the derived netlist as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Drive a program through the execution engine
    #[arg(short = 'r', long = "run", value_name = "PROGRAM")]
    run: Option<String>,

    /// Runtime parameter for --run (e.g. "$count=4")
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Bind every program parameter to 1
    #[arg(long = "ignore-params")]
    ignore_params: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid parameter format: {}", s))?;
    if name.is_empty() {
        return Err(format!("Missing parameter name: {}", s));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Prints every execute with its resolved queue pointers
struct PrintingHooks;

impl ExecutionHooks for PrintingHooks {
    fn execute(&mut self, executor: &ProgramExecutor<'_>, instruction: &ExecuteInstruction) -> CompileResult<()> {
        println!(
            "  {} {} {} {}",
            "pc".dimmed(),
            executor.pc(),
            "execute".green(),
            instruction.graph_name.bold()
        );
        for setting in &instruction.queue_settings {
            let mut fields = Vec::new();
            for (key, value) in [
                ("rd_ptr_local", &setting.rd_ptr_local),
                ("rd_ptr_global", &setting.rd_ptr_global),
                ("wr_ptr_global", &setting.wr_ptr_global),
            ] {
                if let Some(text) = value {
                    fields.push(format!("{}={}", key, executor.resolve_setting(text)?));
                }
            }
            println!("      {}: {}", setting.name.cyan(), fields.join(" "));
        }
        Ok(())
    }
}

fn fail(what: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", what.red(), err);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let mut options = CompileOptions::from_env().unwrap_or_else(|e| fail("Configuration error", e));
    if let Some(arch) = args.arch {
        options = options.with_arch(arch);
    }
    options.ignore_runtime_parameters = args.ignore_params;

    if args.verbose {
        println!("{}", "Netlist Compiler".bold().blue());
        println!("{}", "=".repeat(35));
        println!("{}: {}", "Input".green(), args.netlist);
        println!();
    }

    let netlist = compile_file(&args.netlist, &options).unwrap_or_else(|e| fail("Error", e));

    if args.json_output {
        match netlist.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => fail("Error", format!("Failed to serialize to JSON: {}", e)),
        }
    } else {
        print_summary(&netlist, args.verbose);
    }

    if let Some(name) = &args.run {
        let program = netlist
            .program_by_name(name)
            .unwrap_or_else(|| fail("Error", format!("Program {} is not declared", name)));
        let params: BTreeMap<String, String> = args.params.iter().cloned().collect();
        let mut executor = ProgramExecutor::new(program)
            .with_parameters(params)
            .ignore_runtime_parameters(options.ignore_runtime_parameters);

        println!();
        println!("{} {}", "Running program".bold().yellow(), name.bold());
        match executor.run(&mut PrintingHooks) {
            Ok(StepOutcome::Done) => info!("Program {} finished", name),
            Ok(other) => info!("Program {} stopped: {:?}", name, other),
            Err(e) => fail("Program error", e),
        }
    }
}

fn print_summary(netlist: &Netlist, verbose: bool) {
    println!("{}", "Compilation Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    println!("{}: {}", "Arch".cyan(), netlist.arch());
    println!("{}: {}", "Queues".cyan(), netlist.queues().len());
    println!("{}: {}", "Graphs".cyan(), netlist.graphs().len());
    println!("{}: {}", "Ops".cyan(), netlist.ops().len());
    println!("{}: {}", "Programs".cyan(), netlist.programs().len());
    println!();

    println!("{}", "Temporal Epochs".bold().yellow());
    println!("{}", "-".repeat(50));
    for epoch in 0..netlist.temporal.num_epochs() {
        let graphs: Vec<&str> = netlist.temporal.graphs_in(epoch).collect();
        println!("  {} {}: {}", "Epoch".bold(), epoch, graphs.join(", "));
    }

    if verbose {
        println!();
        println!("{}", "Ops".bold().yellow());
        println!("{}", "-".repeat(50));
        for op in netlist.ops() {
            let dim = &op.output_dim;
            println!(
                "  {} ({}) in {}: grid {} ublock [{},{}] mblock [{},{}] t={}",
                op.name.bold(),
                op.op_type(),
                netlist.graph_of(op).name,
                op.grid_size,
                dim.ublock_rt,
                dim.ublock_ct,
                dim.mblock_m,
                dim.mblock_n,
                dim.t
            );
        }
    }
}
