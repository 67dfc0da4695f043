use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Instant;

use crate::analysis::{
    Ac, AnalysisOptions, ExplicitTransient, ImplicitTransient, Noise, NoiseConfig, OutputQuantity, TransientParams,
};
use crate::circuit::{Circuit, EvalParams};
use crate::cli::OutputFormat;
use crate::newton::NewtonConfig;
use crate::parser::{Analysis, FrequencySweep, IntegrationMethod, SpiceNetlist, SpiceParser};
use crate::result::{NoiseKey, TransientResult, Waveform};
use crate::solver::ToolkitKind;

/// One named column of a result table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    pub values: Vec<f64>,
}

/// Simulation results container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub analysis: Analysis,
    /// Label of the independent variable, `time` or `frequency`
    pub xlabel: String,
    pub sweep_points: Vec<f64>,
    pub signals: Vec<Signal>,
    pub total_time: f64,
}

impl SimulationResult {
    pub fn signal(&self, name: &str) -> Option<&[f64]> {
        self.signals
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.values.as_slice())
    }

    pub fn len(&self) -> usize {
        self.sweep_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweep_points.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    pub toolkit: ToolkitKind,
    pub newton: NewtonConfig,
    pub params: EvalParams,
}

/// Main simulator engine
#[derive(Debug, Default)]
pub struct Simulator {
    circuit: Option<Circuit>,
    analyses: Vec<Analysis>,
    results: Vec<SimulationResult>,
    config: SimulatorConfig,
}

impl Simulator {
    /// Create a new simulator with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        Simulator {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Load a SPICE netlist from file
    pub fn load_netlist<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        info!("Loading netlist from: {}", path.as_ref().display());
        let netlist = SpiceParser::new().parse_file(path)?;
        self.load_netlist_from_parsed(netlist)
    }

    /// Load a netlist held in memory
    pub fn load_str(&mut self, content: &str) -> Result<()> {
        let netlist = SpiceParser::new().parse_netlist(content)?;
        self.load_netlist_from_parsed(netlist)
    }

    pub fn load_netlist_from_parsed(&mut self, netlist: SpiceNetlist) -> Result<()> {
        let circuit = netlist.to_circuit()?;

        if let Some(kelvin) = netlist.temperature_kelvin() {
            info!("Temperature set to {:.2} K by .temp", kelvin);
            self.config.params.temperature = kelvin;
        }

        info!("Loaded circuit: {}", circuit.title);
        circuit.print_summary();

        self.circuit = Some(circuit);
        self.analyses = netlist.analyses;
        self.results.clear();
        Ok(())
    }

    pub fn circuit(&self) -> Option<&Circuit> {
        self.circuit.as_ref()
    }

    /// Analyses requested by the netlist
    pub fn analyses(&self) -> &[Analysis] {
        &self.analyses
    }

    fn options(&self) -> AnalysisOptions {
        AnalysisOptions::default()
            .with_toolkit(self.config.toolkit.build())
            .with_params(self.config.params.clone())
    }

    fn loaded_circuit(&self) -> Result<&Circuit> {
        self.circuit.as_ref().ok_or_else(|| anyhow!("No circuit loaded"))
    }

    /// Run every analysis of the netlist in order
    pub fn run_all(&mut self) -> Result<usize> {
        if self.analyses.is_empty() {
            return Err(anyhow!("The netlist requests no analysis"));
        }
        let analyses = self.analyses.clone();
        for analysis in &analyses {
            self.run(analysis)?;
        }
        Ok(analyses.len())
    }

    /// Run one analysis and keep its result
    pub fn run(&mut self, analysis: &Analysis) -> Result<&SimulationResult> {
        let start_time = Instant::now();
        let circuit = self.loaded_circuit()?;
        let options = self.options();

        let (xlabel, sweep_points, signals) = match analysis {
            Analysis::Transient { tstep, tstop, method } => {
                info!("Starting {} transient analysis: tstep={}, tstop={}", method, tstep, tstop);
                let params = TransientParams::new(*tstop, *tstep);
                match method {
                    IntegrationMethod::Explicit => {
                        let mut transient = ExplicitTransient::new(circuit, options)?;
                        transient_signals(circuit, transient.solve(&params)?)?
                    }
                    IntegrationMethod::Implicit => {
                        let mut transient =
                            ImplicitTransient::new(circuit, options)?.with_newton(self.config.newton.clone());
                        transient_signals(circuit, transient.solve(&params)?)?
                    }
                }
            }
            Analysis::Ac(sweep) => {
                info!("Starting AC analysis over {} .. {} Hz", sweep.fstart, sweep.fstop);
                ac_signals(circuit, options, sweep)?
            }
            Analysis::Noise { output, source, sweep } => {
                info!("Starting noise analysis: input {}, output {:?}", source, output);
                let config = analysis
                    .noise_config()
                    .ok_or_else(|| anyhow!("Not a noise analysis"))?;
                noise_signals(circuit, options, config, sweep)?
            }
        };

        let total_time = start_time.elapsed().as_secs_f64();
        info!(
            "Analysis completed with {} points in {:.3}ms",
            sweep_points.len(),
            total_time * 1000.0
        );

        self.results.push(SimulationResult {
            analysis: analysis.clone(),
            xlabel: xlabel.to_string(),
            sweep_points,
            signals,
            total_time,
        });
        self.results.last().ok_or_else(|| anyhow!("No simulation results available"))
    }

    pub fn run_transient_analysis(&mut self, tstep: f64, tstop: f64, method: IntegrationMethod) -> Result<&SimulationResult> {
        if tstep <= 0.0 || tstop <= tstep {
            return Err(anyhow!("Invalid time parameters: tstep must be positive and less than tstop"));
        }
        self.run(&Analysis::Transient { tstep, tstop, method })
    }

    pub fn run_ac_analysis(&mut self, sweep: FrequencySweep) -> Result<&SimulationResult> {
        self.run(&Analysis::Ac(sweep))
    }

    pub fn results(&self) -> &[SimulationResult] {
        &self.results
    }

    /// Export results to `path`, or to numbered siblings of it when there are several
    pub fn export_results<P: AsRef<Path>>(&self, path: P, format: OutputFormat) -> Result<()> {
        let path = path.as_ref();
        match self.results.len() {
            0 => Err(anyhow!("No simulation results available")),
            1 => export_result(&self.results[0], path, format),
            _ => {
                for (k, result) in self.results.iter().enumerate() {
                    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("results");
                    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or(format.extension());
                    let numbered = path.with_file_name(format!("{}_{}.{}", stem, k + 1, extension));
                    export_result(result, &numbered, format)?;
                }
                Ok(())
            }
        }
    }

    /// Print simulation summary
    pub fn print_summary(&self) {
        if self.results.is_empty() {
            println!("No simulation results available");
            return;
        }

        for result in &self.results {
            println!("\n=== Simulation Summary ===");
            println!("Analysis: {:?}", result.analysis);
            println!("Total simulation time: {:.3}ms", result.total_time * 1000.0);
            println!("Number of {} points: {}", result.xlabel, result.len());

            if let Some(&x) = result.sweep_points.last() {
                println!("\nFinal values at {} = {:.6e}:", result.xlabel, x);
                for signal in &result.signals {
                    if let Some(&value) = signal.values.last() {
                        println!("  {}: {:.6e}", signal.name, value);
                    }
                }
            }
        }
    }
}

type Columns = (&'static str, Vec<f64>, Vec<Signal>);

fn signal(name: impl Into<String>, values: Vec<f64>) -> Signal {
    Signal {
        name: name.into(),
        values,
    }
}

fn exported_nodes(circuit: &Circuit) -> impl Iterator<Item = &str> {
    circuit
        .nodes
        .iter()
        .filter(|node| !node.is_ground())
        .map(|node| node.name.as_str())
}

fn transient_signals(circuit: &Circuit, result: &TransientResult<'_, Circuit>) -> Result<Columns> {
    let mut signals = Vec::new();
    for node in exported_nodes(circuit) {
        signals.push(signal(format!("v({})", node), result.v(node, None)?.y));
    }
    for branch in &circuit.branches {
        let current = result.i(&format!("{}.plus", branch.element))?;
        signals.push(signal(format!("i({})", branch.element), current.y));
    }
    Ok(("time", result.times().to_vec(), signals))
}

fn ac_signals(circuit: &Circuit, options: AnalysisOptions, sweep: &FrequencySweep) -> Result<Columns> {
    let frequencies = sweep.frequencies();
    let ac = Ac::new(circuit, options)?;
    let result = ac.solve(&frequencies)?;

    let mut signals = Vec::new();
    for node in exported_nodes(circuit) {
        let v = result.v(node, None)?;
        signals.push(signal(format!("vm({})", node), v.magnitude().y));
        signals.push(signal(format!("vp({})", node), v.phase().y));
    }
    for branch in &circuit.branches {
        let i = result.i(&format!("{}.plus", branch.element))?;
        signals.push(signal(format!("im({})", branch.element), i.magnitude().y));
        signals.push(signal(format!("ip({})", branch.element), i.phase().y));
    }
    Ok(("frequency", frequencies, signals))
}

fn noise_signals(
    circuit: &Circuit,
    options: AnalysisOptions,
    config: NoiseConfig,
    sweep: &FrequencySweep,
) -> Result<Columns> {
    let frequencies = sweep.frequencies();
    let noise = Noise::new(circuit, config, options)?;
    if let OutputQuantity::Current { element } = noise.output() {
        info!("Noise output is the current through {}", element);
    }
    let result = noise.solve_sweep(&frequencies)?;

    let mut signals = Vec::new();
    for key in result.keys() {
        let waveform: Waveform<_> = result.get(key)?;
        if key == NoiseKey::Gain {
            signals.push(signal("gain_mag", waveform.magnitude().y));
            signals.push(signal("gain_phase", waveform.phase().y));
        } else {
            if waveform.y.iter().any(|v| !v.re.is_finite()) {
                warn!("{} is not finite at some frequencies", key);
            }
            signals.push(signal(key.as_str(), waveform.y.iter().map(|v| v.re).collect()));
        }
    }
    Ok(("frequency", frequencies, signals))
}

fn export_result(result: &SimulationResult, path: &Path, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Csv => export_csv(result, path),
        OutputFormat::Json => export_json(result, path),
    }
}

/// Export results to CSV format
fn export_csv(result: &SimulationResult, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header = vec![result.xlabel.clone()];
    header.extend(result.signals.iter().map(|s| s.name.clone()));
    writer.write_record(&header)?;

    for (k, x) in result.sweep_points.iter().enumerate() {
        let mut record = vec![x.to_string()];
        for signal in &result.signals {
            record.push(signal.values.get(k).map(|v| v.to_string()).unwrap_or_default());
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    info!("Results exported to CSV: {}", path.display());
    Ok(())
}

/// Export results to JSON format
fn export_json(result: &SimulationResult, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, result)?;
    info!("Results exported to JSON: {}", path.display());
    Ok(())
}
