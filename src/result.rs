use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use nalgebra::DVector;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::circuit::{CircuitModel, EvalParams};
use crate::error::{AnalysisError, Result};

/// Values of one quantity over a sweep variable (time or frequency)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waveform<T> {
    pub xlabel: String,
    pub ylabel: String,
    pub x: Vec<f64>,
    pub y: Vec<T>,
}

impl<T: Clone> Waveform<T> {
    pub fn new(xlabel: impl Into<String>, ylabel: impl Into<String>, x: Vec<f64>, y: Vec<T>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(AnalysisError::DimensionMismatch {
                expected: x.len(),
                actual: y.len(),
            });
        }
        Ok(Waveform {
            xlabel: xlabel.into(),
            ylabel: ylabel.into(),
            x,
            y,
        })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Final sample, if any
    pub fn last(&self) -> Option<(f64, T)> {
        Some((*self.x.last()?, self.y.last()?.clone()))
    }

    /// Apply `f` to every sample value
    pub fn map<U: Clone>(&self, ylabel: impl Into<String>, f: impl Fn(&T) -> U) -> Waveform<U> {
        Waveform {
            xlabel: self.xlabel.clone(),
            ylabel: ylabel.into(),
            x: self.x.clone(),
            y: self.y.iter().map(f).collect(),
        }
    }
}

impl Waveform<Complex64> {
    pub fn magnitude(&self) -> Waveform<f64> {
        self.map(format!("|{}|", self.ylabel), |v| v.norm())
    }

    /// Phase in degrees
    pub fn phase(&self) -> Waveform<f64> {
        self.map(format!("arg({})", self.ylabel), |v| v.arg().to_degrees())
    }
}

/// Names of the unknowns in state order: node names, then `i<k>` per branch
pub fn state_keys<M: CircuitModel + ?Sized>(circuit: &M) -> Vec<String> {
    let mut keys = circuit.node_names();
    keys.extend((0..circuit.branch_count()).map(|k| format!("i{}", k)));
    keys
}

fn key_index<M: CircuitModel + ?Sized>(circuit: &M, key: &str) -> Result<usize> {
    state_keys(circuit)
        .iter()
        .position(|k| k == key)
        .ok_or_else(|| AnalysisError::UnknownNode(key.to_string()))
}

/// Accepted states of a transient run, full size with the reference at zero
#[derive(Debug, Clone)]
pub struct TransientResult<'a, M: CircuitModel + ?Sized> {
    circuit: &'a M,
    params: EvalParams,
    times: Vec<f64>,
    states: Vec<DVector<f64>>,
}

impl<'a, M: CircuitModel + ?Sized> TransientResult<'a, M> {
    pub fn new(circuit: &'a M, params: EvalParams) -> Self {
        TransientResult {
            circuit,
            params,
            times: Vec::new(),
            states: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, time: f64, state: DVector<f64>) {
        self.times.push(time);
        self.states.push(state);
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[DVector<f64>] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn last_state(&self) -> Option<&DVector<f64>> {
        self.states.last()
    }

    /// Voltage of `plus` against `minus` (or the reference) over time
    pub fn v(&self, plus: &str, minus: Option<&str>) -> Result<Waveform<f64>> {
        let y = self
            .states
            .iter()
            .map(|x| self.circuit.extract_v(x, plus, minus))
            .collect::<Result<Vec<_>>>()?;
        let label = match minus {
            Some(minus) => format!("v({},{})", plus, minus),
            None => format!("v({})", plus),
        };
        Waveform::new("time", label, self.times.clone(), y)
    }

    /// Current into a terminal over time, with `dx/dt` from backward differences
    pub fn i(&self, terminal: &str) -> Result<Waveform<f64>> {
        let mut y = Vec::with_capacity(self.states.len());
        for (k, x) in self.states.iter().enumerate() {
            let xdot = if k == 0 {
                None
            } else {
                let dt = self.times[k] - self.times[k - 1];
                Some((x - &self.states[k - 1]) / dt)
            };
            y.push(self.circuit.extract_i(x, terminal, xdot.as_ref(), &self.params)?);
        }
        Waveform::new("time", format!("i({})", terminal), self.times.clone(), y)
    }

    /// Waveform of one unknown, addressed by node name or `i<k>`
    pub fn get(&self, key: &str) -> Result<Waveform<f64>> {
        let index = key_index(self.circuit, key)?;
        let y = self.states.iter().map(|x| x[index]).collect();
        Waveform::new("time", key, self.times.clone(), y)
    }

    /// All unknowns keyed as in [`state_keys`]
    pub fn waveforms(&self) -> Result<Vec<(String, Waveform<f64>)>> {
        state_keys(self.circuit)
            .into_iter()
            .map(|key| self.get(&key).map(|w| (key, w)))
            .collect()
    }
}

/// Small-signal solution at one complex frequency
#[derive(Debug, Clone)]
pub struct AcPoint<'a, M: CircuitModel + ?Sized> {
    circuit: &'a M,
    params: EvalParams,
    pub xdcop: DVector<f64>,
    pub s: Complex64,
    pub x: DVector<Complex64>,
    pub xdot: DVector<Complex64>,
}

impl<'a, M: CircuitModel + ?Sized> AcPoint<'a, M> {
    pub(crate) fn new(
        circuit: &'a M,
        params: EvalParams,
        xdcop: DVector<f64>,
        s: Complex64,
        x: DVector<Complex64>,
    ) -> Self {
        let xdot = &x * s;
        AcPoint {
            circuit,
            params,
            xdcop,
            s,
            x,
            xdot,
        }
    }

    pub fn v(&self, plus: &str, minus: Option<&str>) -> Result<Complex64> {
        self.circuit.extract_v(&self.x, plus, minus)
    }

    pub fn i(&self, terminal: &str) -> Result<Complex64> {
        self.circuit
            .extract_i_linearized(&self.x, terminal, Some(&self.xdot), &self.xdcop, &self.params)
    }

    pub fn get(&self, key: &str) -> Result<Complex64> {
        Ok(self.x[key_index(self.circuit, key)?])
    }
}

/// Small-signal solutions over a frequency sweep
#[derive(Debug, Clone)]
pub struct AcResult<'a, M: CircuitModel + ?Sized> {
    circuit: &'a M,
    /// Sweep variable in Hz (`Im(s) / 2π` for complex sweeps)
    frequencies: Vec<f64>,
    points: Vec<AcPoint<'a, M>>,
}

impl<'a, M: CircuitModel + ?Sized> AcResult<'a, M> {
    pub(crate) fn new(circuit: &'a M, frequencies: Vec<f64>, points: Vec<AcPoint<'a, M>>) -> Self {
        AcResult {
            circuit,
            frequencies,
            points,
        }
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn points(&self) -> &[AcPoint<'a, M>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn v(&self, plus: &str, minus: Option<&str>) -> Result<Waveform<Complex64>> {
        let y = self
            .points
            .iter()
            .map(|p| p.v(plus, minus))
            .collect::<Result<Vec<_>>>()?;
        let label = match minus {
            Some(minus) => format!("v({},{})", plus, minus),
            None => format!("v({})", plus),
        };
        Waveform::new("frequency", label, self.frequencies.clone(), y)
    }

    pub fn i(&self, terminal: &str) -> Result<Waveform<Complex64>> {
        let y = self.points.iter().map(|p| p.i(terminal)).collect::<Result<Vec<_>>>()?;
        Waveform::new("frequency", format!("i({})", terminal), self.frequencies.clone(), y)
    }

    pub fn get(&self, key: &str) -> Result<Waveform<Complex64>> {
        let index = key_index(self.circuit, key)?;
        let y = self.points.iter().map(|p| p.x[index]).collect();
        Waveform::new("frequency", key, self.frequencies.clone(), y)
    }

    pub fn waveforms(&self) -> Result<Vec<(String, Waveform<Complex64>)>> {
        state_keys(self.circuit)
            .into_iter()
            .map(|key| self.get(&key).map(|w| (key, w)))
            .collect()
    }
}

/// Keys of a noise result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NoiseKey {
    /// Output voltage noise PSD (V²/Hz)
    Svnout,
    /// Input-referred noise PSD for a voltage output
    Svninp,
    /// Output current noise PSD (A²/Hz)
    Sinout,
    /// Input-referred noise PSD for a current output
    Sininp,
    /// Transfer from the input source to the output
    Gain,
}

impl NoiseKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseKey::Svnout => "Svnout",
            NoiseKey::Svninp => "Svninp",
            NoiseKey::Sinout => "Sinout",
            NoiseKey::Sininp => "Sininp",
            NoiseKey::Gain => "gain",
        }
    }
}

impl fmt::Display for NoiseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoiseKey {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Svnout" => Ok(NoiseKey::Svnout),
            "Svninp" => Ok(NoiseKey::Svninp),
            "Sinout" => Ok(NoiseKey::Sinout),
            "Sininp" => Ok(NoiseKey::Sininp),
            "gain" => Ok(NoiseKey::Gain),
            other => Err(AnalysisError::configuration(format!("unknown noise key '{}'", other))),
        }
    }
}

/// Noise at one frequency: output PSD, input-referred PSD and gain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoiseResult {
    values: BTreeMap<NoiseKey, Complex64>,
}

impl NoiseResult {
    pub(crate) fn new(output_key: NoiseKey, output: f64, input_key: NoiseKey, input: f64, gain: Complex64) -> Self {
        let mut values = BTreeMap::new();
        values.insert(output_key, Complex64::new(output, 0.0));
        values.insert(input_key, Complex64::new(input, 0.0));
        values.insert(NoiseKey::Gain, gain);
        NoiseResult { values }
    }

    pub fn get(&self, key: NoiseKey) -> Option<Complex64> {
        self.values.get(&key).copied()
    }

    /// Real part of a PSD entry
    pub fn psd(&self, key: NoiseKey) -> Option<f64> {
        self.get(key).map(|v| v.re)
    }

    pub fn gain(&self) -> Complex64 {
        self.values.get(&NoiseKey::Gain).copied().unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = NoiseKey> + '_ {
        self.values.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NoiseKey, Complex64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

/// Noise results over a frequency sweep
#[derive(Debug, Clone, Serialize)]
pub struct NoiseSweep {
    pub frequencies: Vec<f64>,
    pub points: Vec<NoiseResult>,
}

impl NoiseSweep {
    pub fn get(&self, key: NoiseKey) -> Result<Waveform<Complex64>> {
        let y = self
            .points
            .iter()
            .map(|p| p.get(key))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| AnalysisError::configuration(format!("noise result has no '{}' entry", key)))?;
        Waveform::new("frequency", key.as_str(), self.frequencies.clone(), y)
    }

    pub fn keys(&self) -> Vec<NoiseKey> {
        self.points.first().map(|p| p.keys().collect()).unwrap_or_default()
    }
}
