use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::transimpedance::{adjoint_excitation, reciprocal_system, solve_adjoint};
use super::{Analysis, AnalysisOptions, Frequency, OutputQuantity};
use crate::circuit::{CircuitModel, SourceKind};
use crate::error::{AnalysisError, Result};
use crate::result::{NoiseKey, NoiseResult, NoiseSweep};

/// Where noise is measured and which source it is referred to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Independent source the noise is referred to
    pub inputsrc: Option<String>,
    /// Output voltage as `(plus, minus)`; `minus` defaults to the reference
    pub outputnodes: Option<(String, Option<String>)>,
    /// Voltage source or inductor whose branch current is the output
    pub outputsrc: Option<String>,
}

impl NoiseConfig {
    pub fn voltage_output(inputsrc: impl Into<String>, plus: impl Into<String>, minus: Option<&str>) -> Self {
        NoiseConfig {
            inputsrc: Some(inputsrc.into()),
            outputnodes: Some((plus.into(), minus.map(str::to_string))),
            outputsrc: None,
        }
    }

    pub fn current_output(inputsrc: impl Into<String>, outputsrc: impl Into<String>) -> Self {
        NoiseConfig {
            inputsrc: Some(inputsrc.into()),
            outputnodes: None,
            outputsrc: Some(outputsrc.into()),
        }
    }
}

/// Adjoint noise analysis.
///
/// The output noise PSD is `z·CY·zᴴ` where `z` is the transimpedance vector
/// of the output; dividing by `|gain|²` refers it to the input source.
pub struct Noise<'a, M: CircuitModel + ?Sized> {
    analysis: Analysis<'a, M>,
    inputsrc: String,
    input_kind: SourceKind,
    output: OutputQuantity,
}

impl<'a, M: CircuitModel + ?Sized> Noise<'a, M> {
    /// Validate `config` against the circuit and bind the analysis
    pub fn new(circuit: &'a M, config: NoiseConfig, options: AnalysisOptions) -> Result<Self> {
        let output = match (config.outputnodes, config.outputsrc) {
            (Some(_), Some(_)) => {
                return Err(AnalysisError::configuration(
                    "cannot measure both output current and voltage noise",
                ))
            }
            (None, None) => return Err(AnalysisError::configuration("output is not specified")),
            (Some((plus, minus)), None) => {
                circuit.get_node_index(&plus)?;
                if let Some(minus) = &minus {
                    circuit.get_node_index(minus)?;
                }
                OutputQuantity::Voltage { plus, minus }
            }
            (None, Some(element)) => {
                circuit.get_branch_index(&element)?;
                OutputQuantity::Current { element }
            }
        };

        let inputsrc = config
            .inputsrc
            .ok_or_else(|| AnalysisError::configuration("input source is not specified"))?;
        let input_kind = circuit.source_kind(&inputsrc)?.ok_or_else(|| {
            AnalysisError::configuration(format!("input '{}' is not an independent source", inputsrc))
        })?;

        Ok(Noise {
            analysis: Analysis::new(circuit, options)?,
            inputsrc,
            input_kind,
            output,
        })
    }

    pub fn output(&self) -> &OutputQuantity {
        &self.output
    }

    fn keys(&self) -> (NoiseKey, NoiseKey) {
        match self.output {
            OutputQuantity::Voltage { .. } => (NoiseKey::Svnout, NoiseKey::Svninp),
            OutputQuantity::Current { .. } => (NoiseKey::Sinout, NoiseKey::Sininp),
        }
    }

    /// Output, input-referred noise and gain at one frequency
    pub fn solve(&self, frequency: Frequency) -> Result<NoiseResult> {
        let circuit = self.analysis.circuit();
        let params = self.analysis.params();
        let refnode = self.analysis.refnode();
        let s = frequency.s();
        let x0 = self.analysis.zero_state();

        let cy = refnode.matrix(&circuit.cy(&x0, frequency.omega(), params)?)?;
        let reciprocal = reciprocal_system(&self.analysis, s)?;
        let u = adjoint_excitation(circuit, &self.output)?;
        let z = solve_adjoint(&self.analysis, reciprocal.as_ref(), &u)?;

        let output = output_psd(&z, &cy);

        let z_full = refnode.reinsert(&z)?;
        let gain = self.gain(&z_full, &x0)?;
        let gain_sqr = gain.norm_sqr();
        let input = if gain_sqr > 0.0 {
            output / gain_sqr
        } else {
            warn!("zero gain from '{}' to the output, input noise is infinite", self.inputsrc);
            f64::INFINITY
        };

        debug!("noise at s = {}: out = {:.4e}, gain = {}", s, output, gain);
        let (output_key, input_key) = self.keys();
        Ok(NoiseResult::new(output_key, output, input_key, input, gain))
    }

    /// Noise over a sweep of frequencies in Hz
    pub fn solve_sweep(&self, frequencies: &[f64]) -> Result<NoiseSweep> {
        info!("noise sweep over {} points", frequencies.len());
        let points = frequencies
            .iter()
            .map(|&f| self.solve(Frequency::Hz(f)))
            .collect::<Result<Vec<_>>>()?;
        Ok(NoiseSweep {
            frequencies: frequencies.to_vec(),
            points,
        })
    }

    /// Transfer from the input source to the output, read off the adjoint solution
    fn gain(&self, z: &DVector<Complex64>, x0: &DVector<f64>) -> Result<Complex64> {
        let circuit = self.analysis.circuit();
        let plus = format!("{}.plus", self.inputsrc);
        match self.input_kind {
            SourceKind::Voltage => circuit.extract_i_linearized(z, &plus, None, x0, self.analysis.params()),
            SourceKind::Current => {
                // Source current is injected at its minus terminal
                let minus = format!("{}.minus", self.inputsrc);
                Ok(z[circuit.get_node(&minus)?] - z[circuit.get_node(&plus)?])
            }
        }
    }
}

/// `zᵀ·CY·z̄`, real for the Hermitian `CY` every circuit produces
fn output_psd(z: &DVector<Complex64>, cy: &DMatrix<Complex64>) -> f64 {
    let psd = (z.transpose() * cy * z.conjugate())[(0, 0)];
    debug_assert!(
        psd.im.abs() <= 1e-9 * psd.norm(),
        "noise quadratic form is not real: {}",
        psd
    );
    psd.re
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{Circuit, Component, EvalParams};
    use approx::assert_relative_eq;

    fn s(v: &str) -> String {
        v.to_string()
    }

    fn divider(r1: f64, r2: f64) -> Circuit {
        let mut circuit = Circuit::new(s("divider"));
        circuit
            .add_component(Component::new_voltage_source(s("vs"), s("in"), s("gnd"), 0.0).with_ac(1.0))
            .unwrap();
        circuit
            .add_component(Component::new_resistor(s("R1"), s("in"), s("out"), r1))
            .unwrap();
        circuit
            .add_component(Component::new_resistor(s("R2"), s("out"), s("gnd"), r2))
            .unwrap();
        circuit
    }

    #[test]
    fn test_divider_at_dc() {
        let circuit = divider(9e3, 1e3);
        let noise = Noise::new(
            &circuit,
            NoiseConfig::voltage_output("vs", "out", None),
            AnalysisOptions::default(),
        )
        .unwrap();
        let result = noise.solve(Frequency::Hz(0.0)).unwrap();

        let four_kt = 4.0 * EvalParams::default().kt();
        let gain = result.gain();
        let svnout = result.psd(NoiseKey::Svnout).unwrap();
        let svninp = result.psd(NoiseKey::Svninp).unwrap();

        assert_relative_eq!(gain.re, 0.1, max_relative = 1e-12);
        assert_relative_eq!(gain.im, 0.0, epsilon = 1e-15);
        assert_relative_eq!(svnout, four_kt * 900.0, max_relative = 1e-12);
        assert_relative_eq!(svnout, 1.4904e-17, max_relative = 1e-3);
        assert_relative_eq!(svninp, 1.4904e-15, max_relative = 1e-3);
        assert_relative_eq!(svninp * gain.norm_sqr(), svnout, max_relative = 1e-12);
        assert_eq!(result.get(NoiseKey::Sinout), None);
    }

    #[test]
    fn test_output_psd_of_hermitian_form() {
        let z = DVector::from_vec(vec![Complex64::new(1.0, 2.0), Complex64::new(3.0, -1.0)]);
        let cy = DMatrix::from_row_slice(
            2,
            2,
            &[
                Complex64::new(2.0, 0.0),
                Complex64::new(1.0, 1.0),
                Complex64::new(1.0, -1.0),
                Complex64::new(3.0, 0.0),
            ],
        );
        assert_relative_eq!(output_psd(&z, &cy), 28.0, max_relative = 1e-15);
    }

    #[test]
    fn test_rc_lowpass_at_corner() {
        let (r, c) = (1e3, 1e-9);
        let mut circuit = Circuit::new(s("rc lowpass"));
        circuit
            .add_component(Component::new_voltage_source(s("vs"), s("in"), s("gnd"), 0.0).with_ac(1.0))
            .unwrap();
        circuit
            .add_component(Component::new_resistor(s("R1"), s("in"), s("out"), r))
            .unwrap();
        circuit
            .add_component(Component::new_capacitor(s("C1"), s("out"), s("gnd"), c))
            .unwrap();

        let noise = Noise::new(
            &circuit,
            NoiseConfig::voltage_output("vs", "out", None),
            AnalysisOptions::default(),
        )
        .unwrap();
        let corner = 1.0 / (2.0 * std::f64::consts::PI * r * c);
        let result = noise.solve(Frequency::Hz(corner)).unwrap();

        // Half the resistor's thermal noise survives at the corner
        let four_kt = 4.0 * EvalParams::default().kt();
        assert_relative_eq!(result.psd(NoiseKey::Svnout).unwrap(), four_kt * r / 2.0, max_relative = 1e-9);
        assert_relative_eq!(result.gain().norm_sqr(), 0.5, max_relative = 1e-9);
        assert!(result.gain().im.abs() > 0.1);
    }

    #[test]
    fn test_thermal_noise_closed_form() {
        for &r1 in &[1.0, 470.0, 9e3, 2.2e6] {
            for &r2 in &[10.0, 1e3, 33e3] {
                for &temperature in &[77.0, 300.0, 400.0] {
                    let circuit = divider(r1, r2);
                    let params = EvalParams {
                        temperature,
                        ..EvalParams::default()
                    };
                    let options = AnalysisOptions::default().with_params(params.clone());
                    let noise = Noise::new(&circuit, NoiseConfig::voltage_output("vs", "out", None), options).unwrap();
                    let result = noise.solve(Frequency::Hz(0.0)).unwrap();

                    let expected = 4.0 * params.kt() * r1 * r2 / (r1 + r2);
                    assert_relative_eq!(result.psd(NoiseKey::Svnout).unwrap(), expected, max_relative = 1e-9);
                    assert_relative_eq!(result.gain().re, r2 / (r1 + r2), max_relative = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_input_referral_consistency() {
        let mut circuit = divider(4.7e3, 10e3);
        circuit
            .add_component(Component::new_capacitor(s("C1"), s("out"), s("gnd"), 10e-9))
            .unwrap();
        circuit
            .add_component(Component::new_inductor(s("L1"), s("out"), s("mid"), 1e-3))
            .unwrap();
        circuit
            .add_component(Component::new_resistor(s("R3"), s("mid"), s("gnd"), 50.0))
            .unwrap();

        let noise = Noise::new(
            &circuit,
            NoiseConfig::voltage_output("vs", "out", Some("mid")),
            AnalysisOptions::default(),
        )
        .unwrap();
        let sweep = noise.solve_sweep(&[10.0, 1e3, 1e5, 1e7]).unwrap();

        assert_eq!(sweep.keys(), vec![NoiseKey::Svnout, NoiseKey::Svninp, NoiseKey::Gain]);
        for point in &sweep.points {
            let out = point.psd(NoiseKey::Svnout).unwrap();
            let inp = point.psd(NoiseKey::Svninp).unwrap();
            assert!(out > 0.0);
            assert_relative_eq!(inp * point.gain().norm_sqr(), out, max_relative = 1e-12);
        }
        assert_eq!(sweep.get(NoiseKey::Gain).unwrap().len(), 4);
    }

    #[test]
    fn test_current_output() {
        let circuit = divider(9e3, 1e3);
        let noise = Noise::new(&circuit, NoiseConfig::current_output("vs", "vs"), AnalysisOptions::default()).unwrap();
        let result = noise.solve(Frequency::Hz(0.0)).unwrap();
        let four_kt = 4.0 * EvalParams::default().kt();

        // Short-circuit current noise of the 10 kΩ string, referred back to a source voltage
        assert_relative_eq!(result.psd(NoiseKey::Sinout).unwrap(), four_kt / 10e3, max_relative = 1e-12);
        assert_relative_eq!(result.psd(NoiseKey::Sininp).unwrap(), four_kt * 10e3, max_relative = 1e-12);
        assert_relative_eq!(result.gain().re, -1e-4, max_relative = 1e-12);
        assert_eq!(result.get(NoiseKey::Svnout), None);
    }

    #[test]
    fn test_current_source_input() {
        let mut circuit = Circuit::new(s("norton"));
        circuit
            .add_component(Component::new_current_source(s("is"), s("0"), s("n1"), 0.0).with_ac(1.0))
            .unwrap();
        circuit
            .add_component(Component::new_resistor(s("R1"), s("n1"), s("0"), 1e3))
            .unwrap();

        let noise = Noise::new(&circuit, NoiseConfig::voltage_output("is", "n1", None), AnalysisOptions::default()).unwrap();
        let result = noise.solve(Frequency::Hz(1e3)).unwrap();
        let four_kt = 4.0 * EvalParams::default().kt();

        assert_relative_eq!(result.gain().re, 1e3, max_relative = 1e-12);
        assert_relative_eq!(result.psd(NoiseKey::Svnout).unwrap(), four_kt * 1e3, max_relative = 1e-12);
        assert_relative_eq!(result.psd(NoiseKey::Svninp).unwrap(), four_kt / 1e3, max_relative = 1e-12);
    }

    #[test]
    fn test_configuration_errors() {
        let circuit = divider(9e3, 1e3);
        let options = AnalysisOptions::default;

        let err = Noise::new(
            &circuit,
            NoiseConfig {
                inputsrc: Some(s("vs")),
                ..NoiseConfig::default()
            },
            options(),
        )
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "configuration error: output is not specified");

        let both = NoiseConfig {
            inputsrc: Some(s("vs")),
            outputnodes: Some((s("out"), None)),
            outputsrc: Some(s("vs")),
        };
        let err = Noise::new(&circuit, both, options()).err().unwrap();
        assert_eq!(
            err.to_string(),
            "configuration error: cannot measure both output current and voltage noise"
        );

        let no_input = NoiseConfig {
            outputnodes: Some((s("out"), None)),
            ..NoiseConfig::default()
        };
        assert!(matches!(
            Noise::new(&circuit, no_input, options()),
            Err(AnalysisError::Configuration(_))
        ));

        assert!(matches!(
            Noise::new(&circuit, NoiseConfig::voltage_output("vx", "out", None), options()),
            Err(AnalysisError::UnknownElement(_))
        ));
        assert!(matches!(
            Noise::new(&circuit, NoiseConfig::voltage_output("R1", "out", None), options()),
            Err(AnalysisError::Configuration(_))
        ));
        assert!(matches!(
            Noise::new(&circuit, NoiseConfig::voltage_output("vs", "nowhere", None), options()),
            Err(AnalysisError::UnknownNode(_))
        ));
        assert!(matches!(
            Noise::new(&circuit, NoiseConfig::current_output("vs", "R2"), options()),
            Err(AnalysisError::Configuration(_))
        ));
    }
}
