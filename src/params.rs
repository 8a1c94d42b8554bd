//! Simulation parameters, read and validated once at startup

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::decomposition::{Decomposition, Geometry, AXIS_NAMES};
use crate::error::ConfigError;
use crate::grid::{Component, FieldBoundary};
use crate::particle::{BoundaryTable, Carrier, Species};
use crate::schedule::TimeSelection;
use crate::setup::{Configuration, InputError, Profile};

/// Treats a missing field as absent rather than as an error.
fn optional<T>(r: Result<T, InputError>) -> Result<Option<T>, InputError> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(InputError::MissingField(..)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// A current source, `space(x, y, z) * time(t)`, added to one component.
#[derive(Clone, Debug)]
pub struct Antenna {
    pub component: Component,
    pub space: Profile,
    pub time: Profile,
}

#[derive(Clone, Debug)]
pub struct WindowParams {
    pub velocity: f64,
    pub start: f64,
}

#[derive(Clone, Debug)]
pub struct CheckpointParams {
    pub directory: PathBuf,
    pub dump_step: TimeSelection,
    /// Number of dumps kept on disk before the oldest is overwritten.
    pub keep: usize,
    pub exit_after: Option<Duration>,
    pub restart: bool,
}

#[derive(Clone, Debug)]
pub struct Parameters {
    pub decomposition: Decomposition,
    pub species: Vec<Species>,
    pub field_boundaries: [[FieldBoundary; 2]; 3],
    pub dt: f64,
    pub n_time: usize,
    pub seed: u64,
    pub antennas: Vec<Antenna>,
    /// The field solver is not called before this time.
    pub fields_frozen_until: f64,
    pub load_balancing: TimeSelection,
    /// Cost of an empty cell, relative to that of a macroparticle.
    pub cell_load: f64,
    pub scalars: TimeSelection,
    pub print_every: usize,
    pub checkpoint: CheckpointParams,
    pub window: Option<WindowParams>,
    pub output: PathBuf,
}

impl Parameters {
    /// Reads the input file, with output going alongside it.
    pub fn load(path: &Path) -> Result<Parameters, ConfigError> {
        let mut input = Configuration::from_file(path)?;
        input.with_context("constants")?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        Parameters::from_config(&input, dir)
    }

    pub fn from_config(input: &Configuration, dir: &Path) -> Result<Parameters, ConfigError> {
        let geometry = Geometry::parse(&input.string("control", "geometry")?)?;
        let ndim = geometry.ndim();

        let patches: Vec<usize> = input.integers("control", "patches")?.iter().map(|&v| v.max(0) as usize).collect();
        let cells: Vec<usize> = input.integers("control", "cells_per_patch")?.iter().map(|&v| v.max(0) as usize).collect();
        let cell_length = input.reals("control", "cell_length")?;
        let oversize = optional(input.integer("control", "oversize"))?.unwrap_or(2).max(0) as usize;

        let mut field_boundaries = [[FieldBoundary::Periodic; 2]; 3];
        let mut periodic = [false; 3];
        for axis in 0..ndim {
            let pair = input.string_pair("control.field_boundaries", &AXIS_NAMES[axis].to_string())?;
            let min = FieldBoundary::parse(&pair[0])?;
            let max = FieldBoundary::parse(&pair[1])?;
            if (min == FieldBoundary::Periodic) != (max == FieldBoundary::Periodic) {
                return Err(ConfigError::Decomposition(format!(
                    "field boundaries along {} must be periodic on both sides or neither", AXIS_NAMES[axis]
                )));
            }
            field_boundaries[axis] = [min, max];
            periodic[axis] = min == FieldBoundary::Periodic;
        }

        let window = if input.has("moving_window") {
            if periodic[0] {
                return Err(ConfigError::PeriodicWindow);
            }
            Some(WindowParams {
                velocity: input.real("moving_window", "velocity")?,
                start: optional(input.real("moving_window", "start"))?.unwrap_or(0.0),
            })
        } else {
            None
        };

        let decomposition = Decomposition::new(geometry, &patches, &cells, &cell_length, oversize, periodic)?;

        let cfl = optional(input.real("control", "cfl"))?.unwrap_or(0.95);
        let dt = cfl / (SPEED_OF_LIGHT * (0..ndim).map(|a| decomposition.cell_length[a].powi(-2)).sum::<f64>().sqrt());
        let n_time = input.integer("control", "steps")?.max(0) as usize;
        let seed = optional(input.integer("control", "seed"))?.unwrap_or(0) as u64;
        let fields_frozen_until = optional(input.real("control", "fields_frozen_until"))?.unwrap_or(0.0);
        let print_every = optional(input.integer("control", "print_every"))?.unwrap_or(((n_time / 10).max(1)) as i64).max(1) as usize;

        let species = if input.has("species") {
            input.names("species")?
                .iter()
                .map(|name| Parameters::read_species(input, name, geometry, &periodic))
                .collect::<Result<Vec<Species>, ConfigError>>()?
        } else {
            Vec::new()
        };

        let mut antennas = Vec::new();
        if input.has("antennas") {
            for name in input.names("antennas")? {
                let section = format!("antennas.{}", name);
                let antenna = Antenna {
                    component: Component::parse(&input.string(&section, "component")?)?,
                    space: input.profile(&section, "space")?,
                    time: input.profile(&section, "time")?,
                };
                antenna.space.with_space(|f| f(0.0, 0.0, 0.0))?;
                antenna.time.at_time(0.0)?;
                antennas.push(antenna);
            }
        }

        let load_balancing = TimeSelection::from_config(input, "load_balancing", "every")?;
        let cell_load = optional(input.real("load_balancing", "cell_load"))?.unwrap_or(1.0);
        let scalars = TimeSelection::from_config(input, "diagnostics", "scalars")?;

        let output = match optional(input.string("control", "output"))? {
            Some(s) => dir.join(s),
            None => dir.to_path_buf(),
        };

        let checkpoint = CheckpointParams {
            directory: output.join(optional(input.string("checkpoint", "directory"))?.unwrap_or_else(|| "checkpoints".to_owned())),
            dump_step: TimeSelection::from_config(input, "checkpoint", "dump_step")?,
            keep: optional(input.integer("checkpoint", "keep"))?.unwrap_or(2).max(1) as usize,
            exit_after: optional(input.real("checkpoint", "exit_after_minutes"))?
                .filter(|&m| m > 0.0)
                .map(|m| Duration::from_secs_f64(60.0 * m)),
            restart: optional(input.bool("checkpoint", "restart"))?.unwrap_or(false),
        };

        Ok(Parameters {
            decomposition,
            species,
            field_boundaries,
            dt,
            n_time,
            seed,
            antennas,
            fields_frozen_until,
            load_balancing,
            cell_load,
            scalars,
            print_every,
            checkpoint,
            window,
            output,
        })
    }

    fn read_species(input: &Configuration, name: &str, geometry: Geometry, periodic: &[bool; 3]) -> Result<Species, ConfigError> {
        let section = format!("species.{}", name);
        let carrier = Carrier {
            mass: input.real(&section, "mass")?,
            charge: input.real(&section, "charge")?,
        };

        let density = optional(input.profile(&section, "density"))?;
        if let Some(d) = &density {
            d.with_space(|f| f(0.0, 0.0, 0.0))?;
        }

        let drift = match optional(input.reals(&section, "drift"))? {
            Some(v) if v.len() == 3 => [v[0], v[1], v[2]],
            Some(v) => return Err(InputError::CouldNotParse("drift".to_owned(), format!("{:?}", v)).into()),
            None => [0.0; 3],
        };

        let boundary_section = format!("{}.boundaries", section);
        let pairs = (0..geometry.ndim())
            .map(|axis| input.string_pair(&boundary_section, &AXIS_NAMES[axis].to_string()))
            .collect::<Result<Vec<[String; 2]>, InputError>>()?;
        let thermal_temperature = optional(input.real(&section, "thermal_temperature"))?;
        let boundaries = BoundaryTable::build(name, geometry, &pairs, periodic, &carrier, thermal_temperature)?;

        Ok(Species {
            name: name.to_owned(),
            carrier,
            npc: optional(input.integer(&section, "npc"))?.unwrap_or(0).max(0) as usize,
            density,
            temperature: optional(input.real(&section, "temperature"))?.unwrap_or(0.0),
            drift,
            boundaries,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small two-dimensional plasma, periodic in y.
    pub const PLASMA_2D: &str = "
constants:
  n0: 1.0e25
control:
  geometry: 2d
  patches: [4, 4]
  cells_per_patch: [8, 8]
  cell_length: [0.1 * micro, 0.1 * micro]
  steps: 10
  seed: 17
  field_boundaries:
    x: absorbing
    y: periodic
species:
  electron:
    mass: me
    charge: -e
    npc: 2
    density: n0 * step(x, 0.4 * micro, 2.8 * micro)
    temperature: 1.0 * keV
    boundaries:
      x: [reflective, remove]
      y: periodic
  ion:
    mass: mp
    charge: e
    npc: 1
    density: n0 * step(x, 0.4 * micro, 2.8 * micro)
    boundaries:
      x: remove
      y: periodic
load_balancing:
  every: 4
  cell_load: 0.1
";

    pub fn parameters(text: &str) -> Parameters {
        let mut input = Configuration::from_string(text).unwrap();
        input.with_context("constants").unwrap();
        Parameters::from_config(&input, Path::new("")).unwrap()
    }

    #[test]
    fn reads_a_complete_input() {
        let params = parameters(PLASMA_2D);
        assert_eq!(params.decomposition.total_patches(), 16);
        assert_eq!(params.species.len(), 2);
        assert_eq!(params.species[0].name, "electron");
        assert_eq!(params.field_boundaries[1], [FieldBoundary::Periodic; 2]);
        assert!(params.decomposition.periodic[1] && !params.decomposition.periodic[0]);
        let dt = 0.95 * 0.1e-6 / (SPEED_OF_LIGHT * 2.0f64.sqrt());
        assert!(((params.dt - dt) / dt).abs() < 1.0e-12);
        assert!(params.load_balancing.the_time_is_now(8));
        assert!(params.window.is_none());
        assert!(params.checkpoint.dump_step.is_never());
    }

    #[test]
    fn periodic_fields_need_periodic_particles() {
        let text = PLASMA_2D.replace("      x: [reflective, remove]\n      y: periodic", "      x: [reflective, remove]\n      y: thermalize");
        let mut input = Configuration::from_string(&text).unwrap();
        input.with_context("constants").unwrap();
        match Parameters::from_config(&input, Path::new("")) {
            Err(ConfigError::PeriodicMismatch {axis, ..}) => assert_eq!(axis, 'y'),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn window_needs_open_x_axis() {
        let text = format!("{}moving_window:\n  velocity: c\n", PLASMA_2D.replace("x: absorbing", "x: periodic"));
        let mut input = Configuration::from_string(&text).unwrap();
        input.with_context("constants").unwrap();
        match Parameters::from_config(&input, Path::new("")) {
            Err(ConfigError::PeriodicWindow) => {},
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("expected a configuration error"),
        }

        let text = format!("{}moving_window:\n  velocity: c\n  start: 10.0 * femto\n", PLASMA_2D);
        let params = parameters(&text);
        let window = params.window.unwrap();
        assert_eq!(window.velocity, SPEED_OF_LIGHT);
        assert!((window.start - 1.0e-14).abs() < 1.0e-20);
    }
}
