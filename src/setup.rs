//! Parse input configuration file

use std::fmt;
use std::path::Path;
use yaml_rust::{YamlLoader, yaml::Yaml};
use meval::Context;

use crate::constants::*;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("invalid input file: {0}\nUsage: mpirun -n np ./tessera input-file")]
    InvalidInputFile(&'static str),
    #[error("unable to parse '{0}' = '{1}' in configuration file")]
    CouldNotParse(String, String),
    #[error("unable to find '{1}' in section '{0}' with correct type in configuration file")]
    MissingField(String, String),
}

/// Builds the default evaluation context: physical constants, unit
/// prefixes and a handful of profile-shaping functions, followed by
/// any user-defined `constants`.
fn default_context<'a>(constants: &[(String, f64)]) -> Context<'a> {
    let mut ctx = Context::new();
    ctx
        .var("m", ELECTRON_MASS)
        .var("me", ELECTRON_MASS)
        .var("mp", PROTON_MASS)
        .var("c", SPEED_OF_LIGHT)
        .var("e", ELEMENTARY_CHARGE)
        .var("eV", ELEMENTARY_CHARGE)
        .var("keV", 1.0e3 * ELEMENTARY_CHARGE)
        .var("MeV", 1.0e6 * ELEMENTARY_CHARGE)
        .var("femto", 1.0e-15)
        .var("pico", 1.0e-12)
        .var("nano", 1.0e-9)
        .var("micro", 1.0e-6)
        .var("milli", 1.0e-3)
        .func3("step", |x, min, max| if x >= min && x < max {1.0} else {0.0})
        .func3("gauss", |x, mu, sigma| (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp())
        .func("critical", |omega| VACUUM_PERMITTIVITY * ELECTRON_MASS * omega.powi(2) / ELEMENTARY_CHARGE.powi(2));

    for (name, value) in constants {
        ctx.var(name.as_str(), *value);
    }

    ctx
}

/// Represents the input configuration, can be queried
/// for desired parameters.
///
/// Sections are addressed by dotted paths, e.g. `species.electron`.
pub struct Configuration {
    input: Yaml,
    constants: Vec<(String, f64)>,
}

impl Configuration {
    pub fn from_file(path: &Path) -> Result<Configuration, InputError> {
        let contents = std::fs::read_to_string(path).map_err(|_e| InputError::InvalidInputFile("unable to read file"))?;
        Configuration::from_string(&contents)
    }

    pub fn from_string(contents: &str) -> Result<Configuration, InputError> {
        let input = YamlLoader::load_from_str(contents).map_err(|_e| InputError::InvalidInputFile("yaml trouble"))?;
        let input = input.first().ok_or(InputError::InvalidInputFile("yaml trouble"))?;
        Ok(Configuration {
            input: input.clone(),
            constants: Vec::new(),
        })
    }

    /// Reads the named block of constants into the evaluation context.
    /// Each constant may depend on those defined before it.
    pub fn with_context(&mut self, section: &str) -> Result<&mut Self, InputError> {
        let entries = match self.lookup(section).as_hash() {
            Some(hash) => hash.clone(),
            None => return Ok(self), // no constants block
        };

        for (a, b) in entries.iter() {
            let name = match a {
                Yaml::String(s) => s.clone(),
                _ => continue,
            };
            let value = match b {
                Yaml::Real(v) | Yaml::String(v) => {
                    let ctx = default_context(&self.constants);
                    v.parse::<meval::Expr>()
                        .ok()
                        .and_then(|expr| expr.eval_with_context(&ctx).ok())
                        .ok_or_else(|| InputError::CouldNotParse(name.clone(), v.clone()))?
                },
                Yaml::Integer(i) => *i as f64,
                _ => return Err(InputError::CouldNotParse(name, format!("{:?}", b))),
            };
            self.constants.push((name, value));
        }

        Ok(self)
    }

    fn lookup(&self, section: &str) -> &Yaml {
        section.split('.').fold(&self.input, |yaml, key| &yaml[key])
    }

    /// Returns true if the named section exists.
    pub fn has(&self, section: &str) -> bool {
        !self.lookup(section).is_badvalue()
    }

    /// Names of the entries in a mapping section, in file order.
    pub fn names(&self, section: &str) -> Result<Vec<String>, InputError> {
        let hash = self.lookup(section)
            .as_hash()
            .ok_or_else(|| InputError::MissingField(section.to_owned(), "".to_owned()))?;
        Ok(hash.keys().filter_map(|k| k.as_str().map(str::to_owned)).collect())
    }

    fn evaluate(&self, field: &str, yaml: &Yaml) -> Result<f64, InputError> {
        let name = field.to_owned();
        match yaml {
            Yaml::Real(s) => s.parse::<f64>().map_err(|_| InputError::CouldNotParse(name.clone(), s.clone())),
            Yaml::Integer(i) => Ok(*i as f64),
            Yaml::String(s) => {
                let expr = s.parse::<meval::Expr>().map_err(|_| InputError::CouldNotParse(name.clone(), s.clone()))?;
                let ctx = default_context(&self.constants);
                expr.eval_with_context(&ctx).map_err(|_| InputError::CouldNotParse(name.clone(), s.clone()))
            },
            _ => Err(InputError::CouldNotParse(name, format!("{:?}", yaml))),
        }
    }

    pub fn real(&self, section: &str, field: &str) -> Result<f64, InputError> {
        match &self.lookup(section)[field] {
            Yaml::BadValue => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
            yaml => self.evaluate(field, yaml),
        }
    }

    /// A list of reals, each of which may be an expression.
    pub fn reals(&self, section: &str, field: &str) -> Result<Vec<f64>, InputError> {
        match &self.lookup(section)[field] {
            Yaml::Array(array) => array.iter().map(|y| self.evaluate(field, y)).collect(),
            Yaml::BadValue => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
            yaml => Ok(vec![self.evaluate(field, yaml)?]),
        }
    }

    pub fn integer(&self, section: &str, field: &str) -> Result<i64, InputError> {
        match &self.lookup(section)[field] {
            Yaml::Integer(i) => Ok(*i),
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn integers(&self, section: &str, field: &str) -> Result<Vec<i64>, InputError> {
        match &self.lookup(section)[field] {
            Yaml::Integer(i) => Ok(vec![*i]),
            Yaml::Array(array) => array.iter()
                .map(|y| y.as_i64().ok_or_else(|| InputError::CouldNotParse(field.to_owned(), format!("{:?}", y))))
                .collect(),
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn bool(&self, section: &str, field: &str) -> Result<bool, InputError> {
        match &self.lookup(section)[field] {
            Yaml::Boolean(b) => Ok(*b),
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn strings(&self, section: &str, field: &str) -> Result<Vec<String>, InputError> {
        let name = field.to_owned();
        match &self.lookup(section)[field] {
            Yaml::String(s) => {
                Ok(vec![s.clone()])
            },
            Yaml::Array(array) => {
                let take_yaml_string = |y: &Yaml| -> Option<String> {
                    match y {
                        Yaml::String(s) => Some(s.clone()),
                        _ => None
                    }
                };
                let got: Vec<String> = array.iter().filter_map(take_yaml_string).collect();
                if got.is_empty() || got.len() != array.len() {
                    Err(InputError::CouldNotParse(section.to_owned(), name))
                } else {
                    Ok(got)
                }
            },
            _ => Err(InputError::MissingField(section.to_owned(), name))
        }
    }

    pub fn string(&self, section: &str, field: &str) -> Result<String, InputError> {
        let mut strs = self.strings(section, field)?;
        Ok(strs.swap_remove(0))
    }

    /// A `[min, max]` pair of strings. A single entry applies to both sides.
    pub fn string_pair(&self, section: &str, field: &str) -> Result<[String; 2], InputError> {
        let strs = self.strings(section, field)?;
        match strs.len() {
            1 => Ok([strs[0].clone(), strs[0].clone()]),
            2 => Ok([strs[0].clone(), strs[1].clone()]),
            _ => Err(InputError::CouldNotParse(field.to_owned(), strs.join(", "))),
        }
    }

    /// An expression of the given variables, to be evaluated later.
    pub fn profile(&self, section: &str, field: &str) -> Result<Profile, InputError> {
        match &self.lookup(section)[field] {
            Yaml::String(s) | Yaml::Real(s) => {
                let expr = s.parse::<meval::Expr>().map_err(|_| InputError::CouldNotParse(field.to_owned(), s.clone()))?;
                Ok(Profile {
                    name: field.to_owned(),
                    source: s.clone(),
                    expr,
                    constants: self.constants.clone(),
                })
            },
            Yaml::Integer(i) => self.profile_from_value(field, *i as f64),
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned()))
        }
    }

    fn profile_from_value(&self, field: &str, value: f64) -> Result<Profile, InputError> {
        let source = format!("{:e}", value);
        let expr = source.parse::<meval::Expr>().map_err(|_| InputError::CouldNotParse(field.to_owned(), source.clone()))?;
        Ok(Profile {name: field.to_owned(), source, expr, constants: self.constants.clone()})
    }
}

/// A user-supplied expression, such as a density profile or
/// the temporal envelope of an antenna.
///
/// The evaluation context is rebuilt on demand, so a `Profile` can be
/// shared freely between threads.
#[derive(Clone)]
pub struct Profile {
    name: String,
    source: String,
    expr: meval::Expr,
    constants: Vec<(String, f64)>,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} = '{}'", self.name, self.source)
    }
}

impl Profile {
    /// Binds the expression as a function of `x`, `y` and `z` and hands
    /// it to `sample`.
    pub fn with_space<R, F>(&self, sample: F) -> Result<R, InputError>
    where F: FnOnce(&dyn Fn(f64, f64, f64) -> f64) -> R {
        let ctx = default_context(&self.constants);
        let func = self.expr.clone()
            .bind3_with_context(&ctx, "x", "y", "z")
            .map_err(|_| InputError::CouldNotParse(self.name.clone(), self.source.clone()))?;
        Ok(sample(&func))
    }

    /// Evaluates the expression as a function of time `t`.
    pub fn at_time(&self, t: f64) -> Result<f64, InputError> {
        let ctx = default_context(&self.constants);
        let func = self.expr.clone()
            .bind_with_context(&ctx, "t")
            .map_err(|_| InputError::CouldNotParse(self.name.clone(), self.source.clone()))?;
        Ok(func(t))
    }
}

#[rustversion::since(1.38)]
pub fn ettc (start: std::time::Instant, current: usize, total: usize) -> std::time::Duration {
    let rt = start.elapsed().as_secs_f64();
    let ettc = rt * ((total - current) as f64) / (current as f64);
    std::time::Duration::from_secs_f64(ettc)
}

#[rustversion::before(1.38)]
pub fn ettc (start: std::time::Instant, current: usize, total: usize) -> std::time::Duration {
    let rt = start.elapsed();
    let rt = (rt.as_secs() as f64) + (rt.subsec_nanos() as f64) * 1.0e-9;
    let ettc = rt * ((total - current) as f64) / (current as f64);
    std::time::Duration::from_secs(ettc as u64)
}

pub struct PrettyDuration {
    pub duration: std::time::Duration,
}

impl From<std::time::Duration> for PrettyDuration {
    fn from(duration: std::time::Duration) -> PrettyDuration {
        PrettyDuration {duration: duration}
    }
}

impl fmt::Display for PrettyDuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut t = self.duration.as_secs();
        let s = t % 60;
        t /= 60;
        let min = t % 60;
        t /= 60;
        let hr = t % 24;
        let d = t / 24;
        if d > 0 {
            write!(f, "{}d {:02}:{:02}:{:02}", d, hr, min, s)
        } else {
            write!(f, "{:02}:{:02}:{:02}", hr, min, s)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "
constants:
  wavelength: 0.8 * micro
  omega: 2.0 * pi * c / wavelength
control:
  steps: 20
  cell_length: [0.1 * micro, wavelength / 16]
  boundaries: periodic
species:
  electron:
    mass: me
    density: 2.0 * step(x, 0.0, wavelength)
    boundaries:
      x: [remove, reflective]
";

    #[test]
    fn constants_can_refer_to_each_other() {
        let mut input = Configuration::from_string(TEXT).unwrap();
        input.with_context("constants").unwrap();
        let dx = input.reals("control", "cell_length").unwrap();
        println!("dx = {:?}", dx);
        assert_eq!(dx.len(), 2);
        assert!(((dx[1] - 0.05e-6) / 0.05e-6).abs() < 1.0e-12);
        assert_eq!(input.integer("control", "steps").unwrap(), 20);
    }

    #[test]
    fn dotted_sections_and_pairs() {
        let mut input = Configuration::from_string(TEXT).unwrap();
        input.with_context("constants").unwrap();
        let mass = input.real("species.electron", "mass").unwrap();
        assert_eq!(mass, ELECTRON_MASS);
        let pair = input.string_pair("species.electron.boundaries", "x").unwrap();
        assert_eq!(pair, ["remove".to_owned(), "reflective".to_owned()]);
        let single = input.string_pair("control", "boundaries").unwrap();
        assert_eq!(single, ["periodic".to_owned(), "periodic".to_owned()]);
        assert_eq!(input.names("species").unwrap(), vec!["electron".to_owned()]);
        assert!(input.has("species.electron"));
        assert!(!input.has("species.positron"));
    }

    #[test]
    fn profiles_evaluate_on_demand() {
        let mut input = Configuration::from_string(TEXT).unwrap();
        input.with_context("constants").unwrap();
        let density = input.profile("species.electron", "density").unwrap();
        let (inside, outside) = density.with_space(|n| (n(0.1e-6, 0.0, 0.0), n(1.0e-6, 0.0, 0.0))).unwrap();
        assert_eq!(inside, 2.0);
        assert_eq!(outside, 0.0);
    }

    #[test]
    fn missing_fields_are_reported() {
        let input = Configuration::from_string(TEXT).unwrap();
        match input.real("control", "cfl") {
            Err(InputError::MissingField(section, field)) => {
                assert_eq!(section, "control");
                assert_eq!(field, "cfl");
            },
            _ => panic!("expected a missing field"),
        }
    }
}
