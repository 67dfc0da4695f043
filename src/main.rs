use colored::*;
use log::{error, info, LevelFilter};
use std::path::Path;

use lumpsim::cli::{self, build_cli, CliArgs};
use lumpsim::{Simulator, SimulatorConfig};

fn main() {
    let matches = build_cli().get_matches();
    init_logging(matches.get_count("verbose"));

    if let Err(e) = run_application(&matches) {
        error!("{}", format!("Error: {:#}", e).red());
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins when set; otherwise each `-v` raises the level
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn run_application(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let args = CliArgs::from_matches(matches)?;

    info!("{}", "Starting lumpsim".green().bold());
    info!("Input file: {}", args.input_file.bright_blue());

    if !Path::new(&args.input_file).exists() {
        return Err(anyhow::anyhow!("Input file '{}' not found", args.input_file));
    }

    let config = SimulatorConfig {
        toolkit: args.toolkit,
        ..SimulatorConfig::default()
    };
    let mut simulator = Simulator::with_config(config);
    simulator.load_netlist(&args.input_file)?;

    match args.analysis_type {
        cli::AnalysisType::Transient { tstep, tstop, method } => {
            simulator.run_transient_analysis(tstep, tstop, method)?;
        }
        cli::AnalysisType::Ac(sweep) => {
            simulator.run_ac_analysis(sweep)?;
        }
        cli::AnalysisType::Netlist => {
            let count = simulator.run_all()?;
            info!("Ran {} analyses from the netlist", count);
        }
    }

    if let Some(output_file) = args.output_file {
        simulator.export_results(&output_file, args.output_format)?;
        println!("{} {}", "Results exported to:".green(), output_file.bright_green());
    } else {
        simulator.print_summary();
    }

    info!("{}", "Simulation completed successfully!".green().bold());
    Ok(())
}
