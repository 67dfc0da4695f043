use log::trace;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;

use crate::circuit::{
    check_state_len, AnalysisMode, Circuit, CircuitModel, Component, ComponentType, EvalParams, SourceKind,
};
use crate::error::{AnalysisError, Result};

/// Diode exponent beyond which the characteristic continues linearly
const MAX_EXP_ARG: f64 = 80.0;

/// MNA contributions of a set of elements evaluated at one state:
/// `i(x) + C·dx/dt + u = 0` with `G = ∂i/∂x`
#[derive(Debug, Clone)]
pub struct MnaSystem {
    /// Resistive Jacobian
    pub g: DMatrix<f64>,
    /// Reactive Jacobian
    pub c: DMatrix<f64>,
    /// Independent sources
    pub u: DVector<f64>,
    /// Static currents at the evaluation state
    pub i: DVector<f64>,
    /// Total system size (nodes plus branches)
    pub size: usize,
}

impl MnaSystem {
    pub fn new(size: usize) -> Self {
        MnaSystem {
            g: DMatrix::zeros(size, size),
            c: DMatrix::zeros(size, size),
            u: DVector::zeros(size),
            i: DVector::zeros(size),
            size,
        }
    }

    /// Assemble the contributions of `components` at state `x`
    pub fn assemble<'c>(
        circuit: &Circuit,
        components: impl IntoIterator<Item = &'c Component> + Clone,
        x: &DVector<f64>,
        mode: AnalysisMode,
        params: &EvalParams,
    ) -> Result<Self> {
        let size = circuit.n();
        check_state_len(size, x.len())?;
        let mut system = MnaSystem::new(size);

        // Linear elements first so that i = G·x before the nonlinear currents land
        for component in components.clone() {
            if component.component_type.is_linear() {
                system.add_linear_component(circuit, component, mode)?;
            }
        }
        system.i = &system.g * x;

        for component in components {
            if let ComponentType::Diode { emission_coefficient } = component.component_type {
                system.add_diode(circuit, component, emission_coefficient, x, params)?;
            }
        }

        Ok(system)
    }

    /// Noise-correlation matrix of `components` at state `x`.
    ///
    /// Resistor thermal noise and diode shot noise are white, so `omega` only
    /// enters through the signature.
    pub fn assemble_noise<'c>(
        circuit: &Circuit,
        components: impl IntoIterator<Item = &'c Component>,
        x: &DVector<f64>,
        _omega: f64,
        params: &EvalParams,
    ) -> Result<DMatrix<Complex64>> {
        let size = circuit.n();
        check_state_len(size, x.len())?;
        let mut cy = DMatrix::from_element(size, size, Complex64::new(0.0, 0.0));

        for component in components {
            let (a, b) = terminal_nodes(circuit, component)?;
            let psd = match component.component_type {
                ComponentType::Resistor => 4.0 * params.kt() * component.conductance().map_err(|_| {
                    AnalysisError::configuration(format!("resistor {} has invalid resistance", component.name))
                })?,
                ComponentType::Diode { emission_coefficient } => {
                    let (id, _) = diode_characteristic(
                        x[a] - x[b],
                        component.value,
                        emission_coefficient * params.thermal_voltage(),
                    );
                    2.0 * params.electron_charge * id.abs()
                }
                _ => continue,
            };
            stamp_symmetric(&mut cy, a, b, Complex64::new(psd, 0.0));
        }

        Ok(cy)
    }

    /// Add a linear component (R, C, L, V, I) to the system
    fn add_linear_component(&mut self, circuit: &Circuit, component: &Component, mode: AnalysisMode) -> Result<()> {
        let (a, b) = terminal_nodes(circuit, component)?;

        match component.component_type {
            ComponentType::Resistor => {
                let conductance = 1.0 / component.value;
                stamp_symmetric(&mut self.g, a, b, conductance);
            }
            ComponentType::Capacitor => {
                stamp_symmetric(&mut self.c, a, b, component.value);
            }
            ComponentType::Inductor => {
                // Branch row: v(a) - v(b) - L·di/dt = 0
                let br = branch_of(circuit, component)?;
                self.stamp_incidence(a, b, br);
                self.c[(br, br)] -= component.value;
            }
            ComponentType::VoltageSource => {
                // Branch row: v(a) - v(b) - V = 0
                let br = branch_of(circuit, component)?;
                self.stamp_incidence(a, b, br);
                self.u[br] -= source_value(component, mode);
            }
            ComponentType::CurrentSource => {
                // Current flows through the source from a to b
                let current = source_value(component, mode);
                self.u[a] += current;
                self.u[b] -= current;
            }
            ComponentType::Diode { .. } => {}
        }

        Ok(())
    }

    /// Add a diode linearised at `x`
    fn add_diode(
        &mut self,
        circuit: &Circuit,
        component: &Component,
        emission_coefficient: f64,
        x: &DVector<f64>,
        params: &EvalParams,
    ) -> Result<()> {
        let (a, b) = terminal_nodes(circuit, component)?;
        let vd = x[a] - x[b];
        let (id, gd) = diode_characteristic(vd, component.value, emission_coefficient * params.thermal_voltage());
        trace!("diode {} at vd = {:.4}: id = {:.3e}, gd = {:.3e}", component.name, vd, id, gd);

        stamp_symmetric(&mut self.g, a, b, gd);
        self.i[a] += id;
        self.i[b] -= id;

        Ok(())
    }

    /// Couple branch current `br` to nodes `a` (+) and `b` (-)
    fn stamp_incidence(&mut self, a: usize, b: usize, br: usize) {
        self.g[(a, br)] += 1.0;
        self.g[(b, br)] -= 1.0;
        self.g[(br, a)] += 1.0;
        self.g[(br, b)] -= 1.0;
    }
}

/// Two-terminal stamp: `+v` on the diagonal, `-v` off the diagonal
fn stamp_symmetric<T>(matrix: &mut DMatrix<T>, a: usize, b: usize, value: T)
where
    T: nalgebra::Scalar + Copy + std::ops::AddAssign + std::ops::SubAssign,
{
    matrix[(a, a)] += value;
    matrix[(b, b)] += value;
    matrix[(a, b)] -= value;
    matrix[(b, a)] -= value;
}

/// Shockley diode current and conductance at `vd`
fn diode_characteristic(vd: f64, is: f64, nvt: f64) -> (f64, f64) {
    let arg = vd / nvt;
    if arg > MAX_EXP_ARG {
        let e = MAX_EXP_ARG.exp();
        (is * (e * (1.0 + arg - MAX_EXP_ARG) - 1.0), is * e / nvt)
    } else {
        let e = arg.exp();
        (is * (e - 1.0), is * e / nvt)
    }
}

fn source_value(component: &Component, mode: AnalysisMode) -> f64 {
    match mode {
        AnalysisMode::Ac => component.ac_value,
        AnalysisMode::Dc | AnalysisMode::Tran => component.value,
    }
}

fn terminal_nodes(circuit: &Circuit, component: &Component) -> Result<(usize, usize)> {
    Ok((
        circuit.get_node_index(&component.nodes[0])?,
        circuit.get_node_index(&component.nodes[1])?,
    ))
}

fn branch_of(circuit: &Circuit, component: &Component) -> Result<usize> {
    circuit.get_branch_index(&component.name)
}

impl CircuitModel for Circuit {
    fn n(&self) -> usize {
        self.nodes.len() + self.branches.len()
    }

    fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.name.clone()).collect()
    }

    fn branch_count(&self) -> usize {
        self.branches.len()
    }

    fn reference_index(&self, name: Option<&str>) -> Result<usize> {
        match name {
            Some(name) => self.get_node_index(name),
            None => self
                .ground_node
                .ok_or_else(|| AnalysisError::configuration("circuit has no ground node")),
        }
    }

    fn g(&self, x: &DVector<f64>, params: &EvalParams) -> Result<DMatrix<f64>> {
        Ok(MnaSystem::assemble(self, &self.components, x, AnalysisMode::Dc, params)?.g)
    }

    fn c(&self, x: &DVector<f64>, params: &EvalParams) -> Result<DMatrix<f64>> {
        Ok(MnaSystem::assemble(self, &self.components, x, AnalysisMode::Dc, params)?.c)
    }

    fn u(&self, x: &DVector<f64>, mode: AnalysisMode, params: &EvalParams) -> Result<DVector<f64>> {
        Ok(MnaSystem::assemble(self, &self.components, x, mode, params)?.u)
    }

    fn i(&self, x: &DVector<f64>, params: &EvalParams) -> Result<DVector<f64>> {
        Ok(MnaSystem::assemble(self, &self.components, x, AnalysisMode::Dc, params)?.i)
    }

    fn cy(&self, x: &DVector<f64>, omega: f64, params: &EvalParams) -> Result<DMatrix<Complex64>> {
        MnaSystem::assemble_noise(self, &self.components, x, omega, params)
    }

    fn get_node_index(&self, node: &str) -> Result<usize> {
        self.get_node_id(node)
            .ok_or_else(|| AnalysisError::UnknownNode(node.to_string()))
    }

    fn get_branch_index(&self, element: &str) -> Result<usize> {
        if self.component(element).is_none() {
            return Err(AnalysisError::UnknownElement(element.to_string()));
        }
        self.branch_position(element)
            .map(|pos| self.nodes.len() + pos)
            .ok_or_else(|| AnalysisError::configuration(format!("element '{}' does not own a branch", element)))
    }

    fn get_node(&self, terminal: &str) -> Result<usize> {
        let (component, slot) = self.resolve_terminal(terminal)?;
        self.get_node_index(&component.nodes[slot])
    }

    fn get_terminal_branch(&self, terminal: &str) -> Result<usize> {
        let (component, _) = self.resolve_terminal(terminal)?;
        self.get_branch_index(&component.name)
    }

    fn source_kind(&self, element: &str) -> Result<Option<SourceKind>> {
        self.component(element)
            .map(|component| component.component_type.source_kind())
            .ok_or_else(|| AnalysisError::UnknownElement(element.to_string()))
    }

    fn extract_i(
        &self,
        x: &DVector<f64>,
        terminal: &str,
        xdot: Option<&DVector<f64>>,
        params: &EvalParams,
    ) -> Result<f64> {
        let (component, slot) = self.resolve_terminal(terminal)?;
        let row = self.get_node_index(&component.nodes[slot])?;
        let local = MnaSystem::assemble(self, std::iter::once(component), x, AnalysisMode::Tran, params)?;

        let mut current = local.i[row] + local.u[row];
        if let Some(xdot) = xdot {
            check_state_len(self.n(), xdot.len())?;
            current += (local.c.row(row) * xdot)[0];
        }
        Ok(current)
    }

    fn extract_i_linearized(
        &self,
        x: &DVector<Complex64>,
        terminal: &str,
        xdot: Option<&DVector<Complex64>>,
        xdcop: &DVector<f64>,
        params: &EvalParams,
    ) -> Result<Complex64> {
        check_state_len(self.n(), x.len())?;
        let (component, slot) = self.resolve_terminal(terminal)?;
        let row = self.get_node_index(&component.nodes[slot])?;
        let local = MnaSystem::assemble(self, std::iter::once(component), xdcop, AnalysisMode::Ac, params)?;

        let mut current = Complex64::new(local.u[row], 0.0);
        for (col, value) in x.iter().enumerate() {
            current += value * local.g[(row, col)];
        }
        if let Some(xdot) = xdot {
            check_state_len(self.n(), xdot.len())?;
            for (col, value) in xdot.iter().enumerate() {
                current += value * local.c[(row, col)];
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    fn divider() -> Circuit {
        let mut circuit = Circuit::new("divider".to_string());
        circuit
            .add_component(Component::new_voltage_source("vs".to_string(), "in".to_string(), "gnd".to_string(), 1.0))
            .unwrap();
        circuit
            .add_component(Component::new_resistor("R1".to_string(), "in".to_string(), "out".to_string(), 9e3))
            .unwrap();
        circuit
            .add_component(Component::new_resistor("R2".to_string(), "out".to_string(), "gnd".to_string(), 1e3))
            .unwrap();
        circuit
    }

    #[test]
    fn test_layout() {
        let circuit = divider();
        assert_eq!(circuit.n(), 4);
        assert_eq!(circuit.node_names(), vec!["in", "gnd", "out"]);
        assert_eq!(circuit.reference_index(None).unwrap(), 1);
        assert_eq!(circuit.reference_index(Some("out")).unwrap(), 2);
        assert_eq!(circuit.get_branch_index("vs").unwrap(), 3);
        assert_eq!(circuit.get_terminal_branch("vs.minus").unwrap(), 3);
        assert_eq!(circuit.get_node("vs.plus").unwrap(), 0);
        assert_eq!(circuit.source_kind("vs").unwrap(), Some(SourceKind::Voltage));
        assert_eq!(circuit.source_kind("R1").unwrap(), None);

        assert!(matches!(circuit.get_node_index("x"), Err(AnalysisError::UnknownNode(_))));
        assert!(matches!(circuit.get_branch_index("Rx"), Err(AnalysisError::UnknownElement(_))));
        assert!(matches!(circuit.get_branch_index("R1"), Err(AnalysisError::Configuration(_))));
    }

    #[test]
    fn test_voltage_source_and_resistor_stamps() {
        let circuit = divider();
        let params = EvalParams::default();
        let x = DVector::zeros(4);
        let g = circuit.g(&x, &params).unwrap();
        let u = circuit.u(&x, AnalysisMode::Dc, &params).unwrap();

        assert_eq!(g[(0, 3)], 1.0);
        assert_eq!(g[(1, 3)], -1.0);
        assert_eq!(g[(3, 0)], 1.0);
        assert_eq!(g[(3, 1)], -1.0);
        assert_relative_eq!(g[(0, 0)], 1.0 / 9e3);
        assert_relative_eq!(g[(2, 2)], 1.0 / 9e3 + 1.0 / 1e3);
        assert_relative_eq!(g[(0, 2)], -1.0 / 9e3);
        assert_eq!(u[3], -1.0);

        // The DC solution satisfies i(x) + u = 0
        let solved = dvector![1.0, 0.0, 0.1, -1e-4];
        let residual = circuit.i(&solved, &params).unwrap() + circuit.u(&solved, AnalysisMode::Dc, &params).unwrap();
        assert!(residual.amax() < 1e-12);
    }

    #[test]
    fn test_current_source_and_reactive_stamps() {
        let mut circuit = Circuit::new("rlc".to_string());
        circuit
            .add_component(Component::new_current_source("Is".to_string(), "gnd".to_string(), "a".to_string(), 0.1).with_ac(2.0))
            .unwrap();
        circuit
            .add_component(Component::new_capacitor("C1".to_string(), "a".to_string(), "gnd".to_string(), 1e-6))
            .unwrap();
        circuit
            .add_component(Component::new_inductor("L1".to_string(), "a".to_string(), "gnd".to_string(), 1e-3))
            .unwrap();

        let params = EvalParams::default();
        let x = DVector::zeros(circuit.n());
        let c = circuit.c(&x, &params).unwrap();
        let u_dc = circuit.u(&x, AnalysisMode::Tran, &params).unwrap();
        let u_ac = circuit.u(&x, AnalysisMode::Ac, &params).unwrap();

        // nodes: gnd = 0, a = 1, branch of L1 = 2
        assert_eq!(u_dc[1], -0.1);
        assert_eq!(u_dc[0], 0.1);
        assert_eq!(u_ac[1], -2.0);
        assert_eq!(c[(1, 1)], 1e-6);
        assert_eq!(c[(1, 0)], -1e-6);
        assert_eq!(c[(2, 2)], -1e-3);
    }

    #[test]
    fn test_diode_linearisation() {
        let mut circuit = Circuit::new("diode".to_string());
        circuit
            .add_component(Component::new_diode("D1".to_string(), "a".to_string(), "0".to_string(), 1e-14))
            .unwrap();
        let params = EvalParams::default();
        let vt = params.thermal_voltage();
        let x = dvector![0.6, 0.0];

        let i = circuit.i(&x, &params).unwrap();
        let g = circuit.g(&x, &params).unwrap();
        let expected = 1e-14 * ((0.6 / vt).exp() - 1.0);

        assert_relative_eq!(i[0], expected, max_relative = 1e-12);
        assert_relative_eq!(i[1], -expected, max_relative = 1e-12);
        assert_relative_eq!(g[(0, 0)], (expected + 1e-14) / vt, max_relative = 1e-12);

        // Finite-difference check of G against i
        let h = 1e-7;
        let ip = circuit.i(&dvector![0.6 + h, 0.0], &params).unwrap();
        assert_relative_eq!((ip[0] - i[0]) / h, g[(0, 0)], max_relative = 1e-5);
    }

    #[test]
    fn test_noise_correlation() {
        let circuit = divider();
        let params = EvalParams::default();
        let cy = circuit.cy(&DVector::zeros(4), 0.0, &params).unwrap();
        let four_kt = 4.0 * params.kt();

        assert_relative_eq!(cy[(0, 0)].re, four_kt / 9e3, max_relative = 1e-12);
        assert_relative_eq!(cy[(2, 2)].re, four_kt / 9e3 + four_kt / 1e3, max_relative = 1e-12);
        assert_relative_eq!(cy[(0, 2)].re, -four_kt / 9e3, max_relative = 1e-12);
        assert_eq!(cy[(3, 3)], Complex64::new(0.0, 0.0));
    }

    #[test]
    fn test_terminal_currents() {
        let circuit = divider();
        let params = EvalParams::default();
        let x = dvector![1.0, 0.0, 0.1, -1e-4];

        // 0.1 mA flows from in through R1
        assert_relative_eq!(circuit.extract_i(&x, "R1.plus", None, &params).unwrap(), 1e-4, epsilon = 1e-15);
        assert_relative_eq!(circuit.extract_i(&x, "R1.minus", None, &params).unwrap(), -1e-4, epsilon = 1e-15);
        assert_relative_eq!(circuit.extract_i(&x, "vs.minus", None, &params).unwrap(), 1e-4, epsilon = 1e-15);

        let xc = x.map(|v| Complex64::new(v, 0.0));
        let i_lin = circuit
            .extract_i_linearized(&xc, "vs.plus", None, &DVector::zeros(4), &params)
            .unwrap();
        assert_relative_eq!(i_lin.re, -1e-4, epsilon = 1e-15);

        assert_relative_eq!(circuit.extract_v(&x, "in", Some("out")).unwrap(), 0.9);
        assert!(matches!(
            circuit.extract_i(&x, "R1.gate", None, &params),
            Err(AnalysisError::UnknownTerminal(_))
        ));
        assert!(matches!(
            circuit.extract_v(&dvector![1.0], "in", None),
            Err(AnalysisError::DimensionMismatch { .. })
        ));
    }
}
