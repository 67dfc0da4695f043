use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{alpha0, char, digit1, space0, space1},
    combinator::{all_consuming, map, map_opt, map_res, opt, recognize, rest, value, verify},
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::analysis::{NoiseConfig, OutputQuantity};
use crate::circuit::{Circuit, Component, ComponentType};

lazy_static! {
    static ref ELEMENT_PATTERN: Regex = Regex::new(r"^([RCLVIDrclvid]\w*)\s+(\S+)\s+(\S+)\s*(.*)$").unwrap();
    static ref DIODE_PARAM_PATTERN: Regex = Regex::new(r"(?i)\b(is|n)\s*=\s*([^\s=]+)").unwrap();
}

/// Default diode saturation current when `IS=` is omitted
pub const DEFAULT_SATURATION_CURRENT: f64 = 1e-14;

/// Time integration scheme of a transient run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMethod {
    Explicit,
    #[default]
    Implicit,
}

impl FromStr for IntegrationMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "explicit" => Ok(IntegrationMethod::Explicit),
            "implicit" => Ok(IntegrationMethod::Implicit),
            other => Err(anyhow!("Unknown integration method '{}'", other)),
        }
    }
}

impl fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrationMethod::Explicit => write!(f, "explicit"),
            IntegrationMethod::Implicit => write!(f, "implicit"),
        }
    }
}

/// Spacing of frequency points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepType {
    /// Points per decade
    Dec,
    /// Points per octave
    Oct,
    /// Points in total, evenly spaced
    Lin,
}

impl FromStr for SweepType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dec" => Ok(SweepType::Dec),
            "oct" => Ok(SweepType::Oct),
            "lin" => Ok(SweepType::Lin),
            other => Err(anyhow!("Unknown sweep type '{}'", other)),
        }
    }
}

/// A frequency sweep as written in `.ac` and `.noise`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencySweep {
    pub sweep: SweepType,
    pub points: usize,
    pub fstart: f64,
    pub fstop: f64,
}

impl FrequencySweep {
    pub fn new(sweep: SweepType, points: usize, fstart: f64, fstop: f64) -> Result<Self> {
        if points == 0 {
            return Err(anyhow!("Frequency sweep needs at least one point"));
        }
        if fstop < fstart || fstart < 0.0 {
            return Err(anyhow!("Invalid frequency range {} .. {}", fstart, fstop));
        }
        if sweep != SweepType::Lin && fstart <= 0.0 {
            return Err(anyhow!("Logarithmic sweep must start above 0 Hz"));
        }
        Ok(FrequencySweep {
            sweep,
            points,
            fstart,
            fstop,
        })
    }

    /// Frequencies in Hz, `fstart` first and never beyond `fstop`
    pub fn frequencies(&self) -> Vec<f64> {
        match self.sweep {
            SweepType::Lin => {
                if self.points == 1 {
                    return vec![self.fstart];
                }
                let step = (self.fstop - self.fstart) / (self.points - 1) as f64;
                (0..self.points).map(|k| self.fstart + k as f64 * step).collect()
            }
            SweepType::Dec | SweepType::Oct => {
                let base: f64 = if self.sweep == SweepType::Dec { 10.0 } else { 2.0 };
                let ratio = base.powf(1.0 / self.points as f64);
                // Small slack so the end point survives rounding
                let limit = self.fstop * (1.0 + 1e-9);
                let mut frequencies = Vec::new();
                let mut k = 0;
                loop {
                    let f = self.fstart * ratio.powi(k);
                    if f > limit {
                        break;
                    }
                    frequencies.push(f);
                    k += 1;
                }
                frequencies
            }
        }
    }
}

/// Analysis directives found in a netlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Analysis {
    Transient {
        tstep: f64,
        tstop: f64,
        method: IntegrationMethod,
    },
    Ac(FrequencySweep),
    Noise {
        output: OutputQuantity,
        source: String,
        sweep: FrequencySweep,
    },
}

impl Analysis {
    /// Noise configuration of a `.noise` directive
    pub fn noise_config(&self) -> Option<NoiseConfig> {
        match self {
            Analysis::Noise { output, source, .. } => Some(match output {
                OutputQuantity::Voltage { plus, minus } => {
                    NoiseConfig::voltage_output(source.as_str(), plus.as_str(), minus.as_deref())
                }
                OutputQuantity::Current { element } => NoiseConfig::current_output(source.as_str(), element.as_str()),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpiceNetlist {
    pub title: String,
    pub components: Vec<Component>,
    pub analyses: Vec<Analysis>,
    /// Temperature from `.temp`, in °C
    pub temperature: Option<f64>,
}

impl SpiceNetlist {
    /// Build a validated circuit from the element lines
    pub fn to_circuit(&self) -> Result<Circuit> {
        let mut circuit = Circuit::new(self.title.clone());
        for component in &self.components {
            circuit.add_component(component.clone())?;
        }
        circuit.validate()?;
        Ok(circuit)
    }

    /// `.temp` converted to kelvin
    pub fn temperature_kelvin(&self) -> Option<f64> {
        self.temperature.map(|t| t + 273.15)
    }
}

#[derive(Debug, Default)]
pub struct SpiceParser;

impl SpiceParser {
    pub fn new() -> Self {
        SpiceParser
    }

    pub fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<SpiceNetlist> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read file '{}'", path.display()))?;
        self.parse_netlist(&content)
    }

    pub fn parse_netlist(&self, content: &str) -> Result<SpiceNetlist> {
        let mut lines = self.preprocess_lines(content).into_iter();
        let title = lines.next().map(|(_, line)| line).unwrap_or_default();

        let mut components = Vec::new();
        let mut analyses = Vec::new();
        let mut temperature = None;

        for (line_num, line) in lines {
            if line.starts_with('.') {
                let directive = self
                    .parse_directive_line(&line)
                    .with_context(|| format!("line {}: '{}'", line_num, line))?;
                match directive {
                    Directive::Analysis(analysis) => analyses.push(analysis),
                    Directive::Temperature(t) => temperature = Some(t),
                    Directive::End => break,
                    Directive::Ignored => warn!("line {}: ignoring unsupported directive '{}'", line_num, line),
                }
                continue;
            }

            let component = self
                .parse_component_line(&line)
                .with_context(|| format!("line {}: '{}'", line_num, line))?;
            debug!("parsed {:?} {}", component.component_type, component.name);
            components.push(component);
        }

        Ok(SpiceNetlist {
            title,
            components,
            analyses,
            temperature,
        })
    }

    /// Drop comments and blank lines, fold `+` continuations.
    /// Lines keep their 1-based number in the source.
    fn preprocess_lines(&self, content: &str) -> Vec<(usize, String)> {
        let mut lines: Vec<(usize, String)> = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line = match raw.find(';') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('*') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('+') {
                if let Some((_, previous)) = lines.last_mut() {
                    previous.push(' ');
                    previous.push_str(rest.trim());
                    continue;
                }
            }
            lines.push((index + 1, line.to_string()));
        }

        lines
    }

    pub fn parse_component_line(&self, line: &str) -> Result<Component> {
        let captures = ELEMENT_PATTERN
            .captures(line)
            .ok_or_else(|| anyhow!("Unrecognised element line"))?;

        let name = captures[1].to_string();
        let node1 = captures[2].to_string();
        let node2 = captures[3].to_string();
        let rest = captures[4].trim();

        let prefix = name.chars().next().map(|c| c.to_ascii_uppercase());
        match prefix {
            Some('R') => Ok(Component::new_resistor(name, node1, node2, parse_spice_value(rest)?)),
            Some('C') => Ok(Component::new_capacitor(name, node1, node2, parse_spice_value(rest)?)),
            Some('L') => Ok(Component::new_inductor(name, node1, node2, parse_spice_value(rest)?)),
            Some('V') => {
                let (dc, ac) = parse_source_values(rest)?;
                Ok(Component::new_voltage_source(name, node1, node2, dc).with_ac(ac))
            }
            Some('I') => {
                let (dc, ac) = parse_source_values(rest)?;
                Ok(Component::new_current_source(name, node1, node2, dc).with_ac(ac))
            }
            Some('D') => {
                let mut component = Component::new_diode(name, node1, node2, DEFAULT_SATURATION_CURRENT);
                for param in DIODE_PARAM_PATTERN.captures_iter(rest) {
                    let value = parse_spice_value(&param[2])?;
                    match param[1].to_ascii_lowercase().as_str() {
                        "is" => component.value = value,
                        _ => {
                            component.component_type = ComponentType::Diode {
                                emission_coefficient: value,
                            }
                        }
                    }
                }
                Ok(component)
            }
            _ => Err(anyhow!("Unsupported element '{}'", line)),
        }
    }

    fn parse_directive_line(&self, line: &str) -> Result<Directive> {
        match directive(line) {
            Ok((_, directive)) => Ok(directive),
            Err(e) => Err(anyhow!("Malformed directive: {}", e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Directive {
    Analysis(Analysis),
    Temperature(f64),
    End,
    Ignored,
}

/// `[DC] v [AC a]` or `AC a` alone
fn parse_source_values(rest: &str) -> Result<(f64, f64)> {
    let mut dc = 0.0;
    let mut ac = 0.0;
    let mut tokens = rest.split_whitespace();

    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("dc") {
            let v = tokens.next().ok_or_else(|| anyhow!("DC without a value"))?;
            dc = parse_spice_value(v)?;
        } else if token.eq_ignore_ascii_case("ac") {
            let v = tokens.next().ok_or_else(|| anyhow!("AC without a value"))?;
            ac = parse_spice_value(v)?;
        } else {
            dc = parse_spice_value(token)?;
        }
    }

    Ok((dc, ac))
}

/// Multiplier for an SI suffix; trailing unit letters are ignored
/// Decimal exponent of an SI suffix; anything unrecognized is a unit
fn scale_exponent(suffix: &str) -> i32 {
    let suffix = suffix.to_ascii_lowercase();
    if suffix.starts_with("meg") {
        return 6;
    }
    match suffix.chars().next() {
        Some('f') => -15,
        Some('p') => -12,
        Some('n') => -9,
        Some('u') => -6,
        Some('m') => -3,
        Some('k') => 3,
        Some('g') => 9,
        Some('t') => 12,
        _ => 0,
    }
}

/// Moves the suffix into the decimal exponent so `10u` parses as the
/// literal `10e-6` instead of a rounded product
fn scaled(number: &str, shift: i32) -> Option<f64> {
    if shift == 0 {
        return number.parse().ok();
    }
    let (mantissa, exponent) = match number.find(|c: char| c == 'e' || c == 'E') {
        Some(pos) => (&number[..pos], number[pos + 1..].parse::<i32>().ok()?),
        None => (number, 0),
    };
    format!("{}e{}", mantissa, exponent + shift).parse().ok()
}

/// Number with an optional SI suffix: `4.7k`, `10uF`, `1meg`, `1e-14`
fn spice_value(input: &str) -> IResult<&str, f64> {
    map_opt(pair(recognize(double), alpha0), |(number, suffix)| {
        scaled(number, scale_exponent(suffix))
    })(input)
}

/// Parse a whole token as a value with unit
pub fn parse_spice_value(token: &str) -> Result<f64> {
    all_consuming(spice_value)(token.trim())
        .map(|(_, v)| v)
        .map_err(|_| anyhow!("Invalid value '{}'", token))
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn arg<'a, O>(inner: impl FnMut(&'a str) -> IResult<&'a str, O>) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    preceded(space1, inner)
}

fn method(input: &str) -> IResult<&str, IntegrationMethod> {
    alt((
        value(IntegrationMethod::Explicit, tag_no_case("explicit")),
        value(IntegrationMethod::Implicit, tag_no_case("implicit")),
    ))(input)
}

fn sweep(input: &str) -> IResult<&str, FrequencySweep> {
    map_res(
        tuple((
            alt((
                value(SweepType::Dec, tag_no_case("dec")),
                value(SweepType::Oct, tag_no_case("oct")),
                value(SweepType::Lin, tag_no_case("lin")),
            )),
            arg(map_res(digit1, str::parse::<usize>)),
            arg(spice_value),
            arg(spice_value),
        )),
        |(kind, points, fstart, fstop)| FrequencySweep::new(kind, points, fstart, fstop),
    )(input)
}

fn tran(input: &str) -> IResult<&str, Analysis> {
    map(
        preceded(
            tag_no_case(".tran"),
            tuple((arg(spice_value), arg(spice_value), opt(arg(method)))),
        ),
        |(tstep, tstop, method)| Analysis::Transient {
            tstep,
            tstop,
            method: method.unwrap_or_default(),
        },
    )(input)
}

fn ac(input: &str) -> IResult<&str, Analysis> {
    map(preceded(tag_no_case(".ac"), arg(sweep)), Analysis::Ac)(input)
}

/// `v(out)`, `v(out,ref)` or `i(vsrc)`
fn noise_output(input: &str) -> IResult<&str, OutputQuantity> {
    alt((
        map(
            delimited(
                tag_no_case("v("),
                pair(
                    delimited(space0, identifier, space0),
                    opt(preceded(char(','), delimited(space0, identifier, space0))),
                ),
                char(')'),
            ),
            |(plus, minus)| OutputQuantity::Voltage {
                plus: plus.to_string(),
                minus: minus.map(str::to_string),
            },
        ),
        map(
            delimited(tag_no_case("i("), delimited(space0, identifier, space0), char(')')),
            OutputQuantity::current,
        ),
    ))(input)
}

fn noise(input: &str) -> IResult<&str, Analysis> {
    map(
        preceded(
            tag_no_case(".noise"),
            tuple((arg(noise_output), arg(identifier), arg(sweep))),
        ),
        |(output, source, sweep)| Analysis::Noise {
            output,
            source: source.to_string(),
            sweep,
        },
    )(input)
}

fn temp(input: &str) -> IResult<&str, f64> {
    preceded(tag_no_case(".temp"), arg(spice_value))(input)
}

fn is_known_directive(name: &str) -> bool {
    ["tran", "ac", "noise", "temp", "end"]
        .iter()
        .any(|known| known.eq_ignore_ascii_case(name))
}

fn directive(input: &str) -> IResult<&str, Directive> {
    all_consuming(terminated(
        alt((
            map(tran, Directive::Analysis),
            map(ac, Directive::Analysis),
            map(noise, Directive::Analysis),
            map(temp, Directive::Temperature),
            value(Directive::End, tag_no_case(".end")),
            value(
                Directive::Ignored,
                tuple((char('.'), verify(identifier, |name: &str| !is_known_directive(name)), rest)),
            ),
        )),
        space0,
    ))(input)
}
