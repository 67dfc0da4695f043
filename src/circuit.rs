use std::collections::HashMap;
use std::fmt;

use anyhow::{anyhow, Result};
use nalgebra::{ComplexField, DMatrix, DVector};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Represents a node in the circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub id: usize,
}

impl Node {
    pub fn new(name: String) -> Self {
        Node { name, id: 0 }
    }

    pub fn with_id(name: String, id: usize) -> Self {
        Node { name, id }
    }

    pub fn is_ground(&self) -> bool {
        self.name == "0" || self.name.to_lowercase() == "gnd" || self.name.to_lowercase() == "ground"
    }
}

/// An extra unknown (branch current) owned by a voltage source or inductor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub element: String,
}

/// Types of circuit components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComponentType {
    Resistor,
    Capacitor,
    Inductor,
    VoltageSource,
    CurrentSource,
    Diode { emission_coefficient: f64 },
}

/// Kind of an independent source, carried explicitly by the element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Voltage,
    Current,
}

impl ComponentType {
    /// Returns true if this component is linear
    pub fn is_linear(&self) -> bool {
        !matches!(self, ComponentType::Diode { .. })
    }

    pub fn source_kind(&self) -> Option<SourceKind> {
        match self {
            ComponentType::VoltageSource => Some(SourceKind::Voltage),
            ComponentType::CurrentSource => Some(SourceKind::Current),
            _ => None,
        }
    }

    /// Components whose current is an extra MNA unknown
    pub fn tracks_current(&self) -> bool {
        matches!(self, ComponentType::VoltageSource | ComponentType::Inductor)
    }
}

/// Selects which source values `u(x)` carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisMode {
    Dc,
    Ac,
    Tran,
}

/// Physical parameters the element stamps are evaluated with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalParams {
    /// Temperature in Kelvin
    pub temperature: f64,
    /// Boltzmann constant (J/K)
    pub boltzmann: f64,
    /// Elementary charge (C)
    pub electron_charge: f64,
}

impl Default for EvalParams {
    fn default() -> Self {
        EvalParams {
            temperature: 300.0,
            boltzmann: 1.380649e-23,
            electron_charge: 1.602176634e-19,
        }
    }
}

impl EvalParams {
    pub fn kt(&self) -> f64 {
        self.boltzmann * self.temperature
    }

    /// Thermal voltage kT/q
    pub fn thermal_voltage(&self) -> f64 {
        self.kt() / self.electron_charge
    }
}

/// Circuit component/element
///
/// Terminals are named `<name>.plus` and `<name>.minus` after `nodes[0]` and
/// `nodes[1]`. For a current source, `value` flows through the source from
/// `plus` to `minus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub component_type: ComponentType,
    pub nodes: Vec<String>,
    pub value: f64,
    /// Small-signal amplitude, used by sources in AC analysis
    pub ac_value: f64,
}

impl Component {
    fn two_terminal(name: String, component_type: ComponentType, node1: String, node2: String, value: f64) -> Self {
        Component {
            name,
            component_type,
            nodes: vec![node1, node2],
            value,
            ac_value: 0.0,
        }
    }

    pub fn new_resistor(name: String, node1: String, node2: String, resistance: f64) -> Self {
        Self::two_terminal(name, ComponentType::Resistor, node1, node2, resistance)
    }

    pub fn new_capacitor(name: String, node1: String, node2: String, capacitance: f64) -> Self {
        Self::two_terminal(name, ComponentType::Capacitor, node1, node2, capacitance)
    }

    pub fn new_inductor(name: String, node1: String, node2: String, inductance: f64) -> Self {
        Self::two_terminal(name, ComponentType::Inductor, node1, node2, inductance)
    }

    pub fn new_voltage_source(name: String, node_pos: String, node_neg: String, voltage: f64) -> Self {
        Self::two_terminal(name, ComponentType::VoltageSource, node_pos, node_neg, voltage)
    }

    pub fn new_current_source(name: String, node_pos: String, node_neg: String, current: f64) -> Self {
        Self::two_terminal(name, ComponentType::CurrentSource, node_pos, node_neg, current)
    }

    /// Junction diode with saturation current `is` and unit emission coefficient
    pub fn new_diode(name: String, anode: String, cathode: String, is: f64) -> Self {
        Self::two_terminal(
            name,
            ComponentType::Diode { emission_coefficient: 1.0 },
            anode,
            cathode,
            is,
        )
    }

    /// Set the AC amplitude of a source
    pub fn with_ac(mut self, amplitude: f64) -> Self {
        self.ac_value = amplitude;
        self
    }

    /// Get the conductance for resistive elements
    pub fn conductance(&self) -> Result<f64> {
        match self.component_type {
            ComponentType::Resistor => {
                if self.value <= 0.0 {
                    Err(anyhow!("Resistor {} has non-positive resistance: {}", self.name, self.value))
                } else {
                    Ok(1.0 / self.value)
                }
            }
            _ => Err(anyhow!("Component {} is not a resistor", self.name)),
        }
    }

    /// Validate that the component has two nodes and a sensible value
    pub fn validate(&self) -> Result<()> {
        if self.nodes.len() != 2 {
            return Err(anyhow!(
                "Component {} expects 2 nodes, but has {}",
                self.name,
                self.nodes.len()
            ));
        }
        if self.name.contains('.') {
            return Err(anyhow!("Component name {} must not contain '.'", self.name));
        }

        match self.component_type {
            ComponentType::Resistor => {
                if self.value <= 0.0 {
                    return Err(anyhow!("Resistor {} must have positive resistance", self.name));
                }
            }
            ComponentType::Capacitor => {
                if self.value <= 0.0 {
                    return Err(anyhow!("Capacitor {} must have positive capacitance", self.name));
                }
            }
            ComponentType::Inductor => {
                if self.value <= 0.0 {
                    return Err(anyhow!("Inductor {} must have positive inductance", self.name));
                }
            }
            ComponentType::Diode { emission_coefficient } => {
                if self.value <= 0.0 || emission_coefficient <= 0.0 {
                    return Err(anyhow!("Diode {} must have positive IS and N", self.name));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Complete circuit representation
///
/// Nodes keep insertion order and include the ground node. Branches are
/// created in component order for every voltage source and inductor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Circuit {
    pub title: String,
    pub nodes: Vec<Node>,
    pub branches: Vec<Branch>,
    pub components: Vec<Component>,
    pub node_map: HashMap<String, usize>,
    pub ground_node: Option<usize>,
    component_map: HashMap<String, usize>,
    branch_map: HashMap<String, usize>,
}

impl Circuit {
    pub fn new(title: String) -> Self {
        Circuit {
            title,
            nodes: Vec::new(),
            branches: Vec::new(),
            components: Vec::new(),
            node_map: HashMap::new(),
            ground_node: None,
            component_map: HashMap::new(),
            branch_map: HashMap::new(),
        }
    }

    /// Add a node to the circuit and return its ID
    pub fn add_node(&mut self, name: String) -> usize {
        if let Some(&existing_id) = self.node_map.get(&name) {
            return existing_id;
        }

        let node_id = self.nodes.len();
        let node = Node::with_id(name.clone(), node_id);

        if node.is_ground() && self.ground_node.is_none() {
            self.ground_node = Some(node_id);
        }

        self.nodes.push(node);
        self.node_map.insert(name, node_id);
        node_id
    }

    /// Add a component to the circuit
    pub fn add_component(&mut self, component: Component) -> Result<()> {
        component.validate()?;

        if self.component_map.contains_key(&component.name) {
            return Err(anyhow!("Duplicate component name '{}'", component.name));
        }

        for node_name in &component.nodes {
            self.add_node(node_name.clone());
        }

        if component.component_type.tracks_current() {
            self.branch_map.insert(component.name.clone(), self.branches.len());
            self.branches.push(Branch {
                element: component.name.clone(),
            });
        }

        self.component_map.insert(component.name.clone(), self.components.len());
        self.components.push(component);
        Ok(())
    }

    /// Get node by name
    pub fn get_node_by_name(&self, name: &str) -> Option<&Node> {
        self.node_map.get(name).and_then(|&id| self.nodes.get(id))
    }

    /// Get node ID by name
    pub fn get_node_id(&self, name: &str) -> Option<usize> {
        self.node_map.get(name).copied()
    }

    /// Look up a component by instance name
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.component_map.get(name).map(|&idx| &self.components[idx])
    }

    /// Position of the element's branch among the branches
    pub fn branch_position(&self, element: &str) -> Option<usize> {
        self.branch_map.get(element).copied()
    }

    /// Split `"<element>.<terminal>"` into the component and its terminal slot
    pub fn resolve_terminal(&self, terminal: &str) -> std::result::Result<(&Component, usize), AnalysisError> {
        let unknown = || AnalysisError::UnknownTerminal(terminal.to_string());
        let (element, pin) = terminal.rsplit_once('.').ok_or_else(unknown)?;
        let component = self.component(element).ok_or_else(unknown)?;
        let slot = match pin {
            "plus" => 0,
            "minus" => 1,
            _ => return Err(unknown()),
        };
        Ok((component, slot))
    }

    /// Validate the entire circuit
    pub fn validate(&self) -> Result<()> {
        if self.ground_node.is_none() {
            return Err(anyhow!("Circuit must have a ground node (named '0', 'gnd', or 'ground')"));
        }

        for component in &self.components {
            component.validate()?;
        }

        let mut connected_nodes = std::collections::HashSet::new();
        for component in &self.components {
            for node_name in &component.nodes {
                if let Some(node_id) = self.get_node_id(node_name) {
                    connected_nodes.insert(node_id);
                }
            }
        }

        for node in &self.nodes {
            if !connected_nodes.contains(&node.id) && Some(node.id) != self.ground_node {
                return Err(anyhow!("Floating node detected: {}", node.name));
            }
        }

        Ok(())
    }

    /// Print circuit summary
    pub fn print_summary(&self) {
        println!("Circuit: {}", self.title);
        println!("Nodes: {}", self.nodes.len());
        println!("Branches: {}", self.branches.len());
        println!("Components: {}", self.components.len());

        if let Some(ground_id) = self.ground_node {
            println!("Ground node: {}", self.nodes[ground_id].name);
        }

        let mut type_counts = HashMap::new();
        for component in &self.components {
            let type_name = match component.component_type {
                ComponentType::Resistor => "Resistors",
                ComponentType::Capacitor => "Capacitors",
                ComponentType::Inductor => "Inductors",
                ComponentType::VoltageSource => "Voltage Sources",
                ComponentType::CurrentSource => "Current Sources",
                ComponentType::Diode { .. } => "Diodes",
            };
            *type_counts.entry(type_name).or_insert(0) += 1;
        }

        for (type_name, count) in type_counts {
            println!("  {}: {}", type_name, count);
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Voltage => write!(f, "voltage source"),
            SourceKind::Current => write!(f, "current source"),
        }
    }
}

/// What the analysis engine needs from a circuit.
///
/// The circuit equation is `i(x) + C(x)·dx/dt + u(x) = 0` with `G = ∂i/∂x`.
/// All matrices are `n x n` and vectors length `n`, ordered as the nodes
/// (ground included) followed by the branch currents.
pub trait CircuitModel {
    /// Number of unknowns: nodes plus branches
    fn n(&self) -> usize;

    /// Node names in unknown order
    fn node_names(&self) -> Vec<String>;

    fn branch_count(&self) -> usize;

    /// Index of the named reference node, or of the ground node when `None`
    fn reference_index(&self, name: Option<&str>) -> crate::Result<usize>;

    fn g(&self, x: &DVector<f64>, params: &EvalParams) -> crate::Result<DMatrix<f64>>;

    fn c(&self, x: &DVector<f64>, params: &EvalParams) -> crate::Result<DMatrix<f64>>;

    fn u(&self, x: &DVector<f64>, mode: AnalysisMode, params: &EvalParams) -> crate::Result<DVector<f64>>;

    /// Static (resistive and nonlinear) currents at `x`
    fn i(&self, x: &DVector<f64>, params: &EvalParams) -> crate::Result<DVector<f64>>;

    /// Noise-correlation matrix at angular frequency `omega`
    fn cy(&self, x: &DVector<f64>, omega: f64, params: &EvalParams) -> crate::Result<DMatrix<Complex64>>;

    fn get_node_index(&self, node: &str) -> crate::Result<usize>;

    /// Unknown index of the branch owned by `element`
    fn get_branch_index(&self, element: &str) -> crate::Result<usize>;

    /// Node index a terminal (`"<element>.<terminal>"`) is connected to
    fn get_node(&self, terminal: &str) -> crate::Result<usize>;

    /// Unknown index of the branch carrying a terminal's current
    fn get_terminal_branch(&self, terminal: &str) -> crate::Result<usize>;

    /// Source kind of an element looked up by instance name
    fn source_kind(&self, element: &str) -> crate::Result<Option<SourceKind>>;

    /// Voltage between two nodes of a solved state vector
    fn extract_v<T: ComplexField>(&self, x: &DVector<T>, plus: &str, minus: Option<&str>) -> crate::Result<T> {
        check_state_len(self.n(), x.len())?;
        let vp = x[self.get_node_index(plus)?].clone();
        match minus {
            Some(minus) => Ok(vp - x[self.get_node_index(minus)?].clone()),
            None => Ok(vp),
        }
    }

    /// Current flowing into an element at one of its terminals (large signal)
    fn extract_i(
        &self,
        x: &DVector<f64>,
        terminal: &str,
        xdot: Option<&DVector<f64>>,
        params: &EvalParams,
    ) -> crate::Result<f64>;

    /// Terminal current of a small-signal solution linearized around `xdcop`
    fn extract_i_linearized(
        &self,
        x: &DVector<Complex64>,
        terminal: &str,
        xdot: Option<&DVector<Complex64>>,
        xdcop: &DVector<f64>,
        params: &EvalParams,
    ) -> crate::Result<Complex64>;
}

pub(crate) fn check_state_len(expected: usize, actual: usize) -> crate::Result<()> {
    if expected != actual {
        return Err(AnalysisError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let node = Node::new("test".to_string());
        assert_eq!(node.name, "test");
        assert!(!node.is_ground());

        let ground_node = Node::new("gnd".to_string());
        assert!(ground_node.is_ground());
    }

    #[test]
    fn test_component_creation() {
        let resistor = Component::new_resistor("R1".to_string(), "1".to_string(), "2".to_string(), 1000.0);
        assert_eq!(resistor.name, "R1");
        assert_eq!(resistor.value, 1000.0);
        assert_eq!(resistor.conductance().unwrap(), 0.001);

        let vs = Component::new_voltage_source("vs".to_string(), "1".to_string(), "0".to_string(), 0.0).with_ac(1.5);
        assert_eq!(vs.ac_value, 1.5);
        assert_eq!(vs.component_type.source_kind(), Some(SourceKind::Voltage));
    }

    #[test]
    fn test_circuit_building() {
        let mut circuit = Circuit::new("Test Circuit".to_string());

        let node1 = circuit.add_node("1".to_string());
        let node2 = circuit.add_node("2".to_string());
        let ground = circuit.add_node("0".to_string());

        assert_eq!(node1, 0);
        assert_eq!(node2, 1);
        assert_eq!(ground, 2);
        assert_eq!(circuit.ground_node, Some(2));

        let resistor = Component::new_resistor("R1".to_string(), "1".to_string(), "2".to_string(), 1000.0);
        circuit.add_component(resistor).unwrap();
        circuit
            .add_component(Component::new_inductor("L1".to_string(), "2".to_string(), "0".to_string(), 1e-3))
            .unwrap();

        assert_eq!(circuit.components.len(), 2);
        assert_eq!(circuit.branches.len(), 1);
        assert_eq!(circuit.branch_position("L1"), Some(0));
        assert!(circuit.validate().is_ok());
    }

    #[test]
    fn test_duplicate_and_invalid_components() {
        let mut circuit = Circuit::new("dup".to_string());
        let r = Component::new_resistor("R1".to_string(), "1".to_string(), "0".to_string(), 1.0);
        circuit.add_component(r.clone()).unwrap();
        assert!(circuit.add_component(r).is_err());

        let bad = Component::new_capacitor("C1".to_string(), "1".to_string(), "0".to_string(), -1.0);
        assert!(circuit.add_component(bad).is_err());
    }

    #[test]
    fn test_resolve_terminal() {
        let mut circuit = Circuit::new("t".to_string());
        circuit
            .add_component(Component::new_voltage_source("vs".to_string(), "a".to_string(), "gnd".to_string(), 1.0))
            .unwrap();

        let (component, slot) = circuit.resolve_terminal("vs.minus").unwrap();
        assert_eq!(component.name, "vs");
        assert_eq!(slot, 1);
        assert!(matches!(
            circuit.resolve_terminal("vs.gate"),
            Err(AnalysisError::UnknownTerminal(_))
        ));
        assert!(circuit.resolve_terminal("nope.plus").is_err());
    }
}
