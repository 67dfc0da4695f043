use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::parser::{parse_spice_value, FrequencySweep, IntegrationMethod};
use crate::solver::ToolkitKind;

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub input_file: String,
    pub output_file: Option<String>,
    pub analysis_type: AnalysisType,
    pub output_format: OutputFormat,
    pub toolkit: ToolkitKind,
    pub verbose_level: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisType {
    /// Whatever the netlist's directives request
    Netlist,
    Transient {
        tstep: f64,
        tstop: f64,
        method: IntegrationMethod,
    },
    Ac(FrequencySweep),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

pub fn build_cli() -> Command {
    Command::new("lumpsim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Lumped-element circuit simulator: transient, AC and noise analyses")
        .arg(
            Arg::new("input")
                .help("Input SPICE netlist file (.sp)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output file for simulation results"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .default_value("csv")
                .value_parser(["csv", "json"])
                .help("Output format"),
        )
        .arg(
            Arg::new("tran")
                .long("tran")
                .value_names(["TSTEP", "TSTOP"])
                .num_args(2)
                .conflicts_with("ac")
                .help("Transient analysis: time step and stop time"),
        )
        .arg(
            Arg::new("method")
                .long("method")
                .value_name("METHOD")
                .default_value("implicit")
                .value_parser(["explicit", "implicit"])
                .help("Transient integration method"),
        )
        .arg(
            Arg::new("ac")
                .long("ac")
                .value_names(["SWEEP", "POINTS", "FSTART", "FSTOP"])
                .num_args(4)
                .help("AC analysis: dec|oct|lin, points, start and stop frequency"),
        )
        .arg(
            Arg::new("toolkit")
                .long("toolkit")
                .value_name("TOOLKIT")
                .default_value("dense")
                .value_parser(["dense", "sparse"])
                .help("Linear algebra backend"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase verbosity level"),
        )
}

impl CliArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let input_file = matches
            .get_one::<String>("input")
            .ok_or_else(|| anyhow!("Input file is required"))?
            .clone();

        let output_file = matches.get_one::<String>("output").cloned();
        let verbose_level = matches.get_count("verbose");

        let output_format = match matches.get_one::<String>("format").map(String::as_str) {
            Some("json") => OutputFormat::Json,
            Some("csv") | None => OutputFormat::Csv,
            Some(other) => return Err(anyhow!("Invalid output format '{}'", other)),
        };

        let toolkit = match matches.get_one::<String>("toolkit") {
            Some(name) => name.parse::<ToolkitKind>().map_err(|e| anyhow!("{}", e))?,
            None => ToolkitKind::default(),
        };

        let method = match matches.get_one::<String>("method") {
            Some(name) => name.parse::<IntegrationMethod>()?,
            None => IntegrationMethod::default(),
        };

        let analysis_type = if let Some(tran_values) = matches.get_many::<String>("tran") {
            let values: Vec<&String> = tran_values.collect();
            if values.len() != 2 {
                return Err(anyhow!("Transient analysis requires exactly 2 parameters: tstep and tstop"));
            }

            let tstep = parse_spice_value(values[0])?;
            let tstop = parse_spice_value(values[1])?;

            if tstep <= 0.0 || tstop <= 0.0 || tstep >= tstop {
                return Err(anyhow!("Invalid time parameters: tstep must be positive and less than tstop"));
            }

            AnalysisType::Transient { tstep, tstop, method }
        } else if let Some(ac_values) = matches.get_many::<String>("ac") {
            let values: Vec<&String> = ac_values.collect();
            if values.len() != 4 {
                return Err(anyhow!("AC analysis requires exactly 4 parameters: sweep, points, fstart, fstop"));
            }

            let sweep = values[0].parse()?;
            let points = values[1]
                .parse::<usize>()
                .map_err(|_| anyhow!("Invalid number of points '{}'", values[1]))?;
            let fstart = parse_spice_value(values[2])?;
            let fstop = parse_spice_value(values[3])?;

            AnalysisType::Ac(FrequencySweep::new(sweep, points, fstart, fstop)?)
        } else {
            AnalysisType::Netlist
        };

        Ok(CliArgs {
            input_file,
            output_file,
            analysis_type,
            output_format,
            toolkit,
            verbose_level,
        })
    }
}
