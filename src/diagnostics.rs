//! Scalar diagnostics
//!
//! Global totals reduced over all ranks and appended, one line per
//! output step, to `scalars.txt` in the output directory.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use crate::collection::PatchCollection;
use crate::comm::Messenger;
use crate::error::SimError;
use crate::params::Parameters;
use crate::particle::BoundaryFlux;
use crate::schedule::TimeSelection;
use crate::simulation::SimContext;

/// Number of values per species.
const PER_SPECIES: usize = 7;

pub struct Scalars {
    selection: TimeSelection,
    path: PathBuf,
    names: Vec<String>,
}

impl Scalars {
    pub fn new(params: &Parameters) -> Self {
        let mut names = vec!["field_energy".to_owned()];
        for sp in params.species.iter() {
            for quantity in &["count", "weight", "kinetic_energy", "lost_count", "lost_weight", "lost_charge", "lost_energy"] {
                names.push(format!("{}_{}", sp.name, quantity));
            }
        }
        Scalars {
            selection: params.scalars,
            path: params.output.join("scalars.txt"),
            names,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Collective: the global totals, in the order given by
    /// [`Scalars::names`], on every rank.
    pub fn compute<M: Messenger>(&self, ctx: &SimContext<M>, collection: &PatchCollection) -> Vec<f64> {
        let params = ctx.params;
        let mut local = vec![collection.field_energy(params)];

        for (s, sp) in params.species.iter().enumerate() {
            let mut count = 0;
            let mut weight = 0.0;
            let mut kinetic = 0.0;
            let mut lost = collection.retired().get(s).copied().unwrap_or_default();
            for p in collection.patches() {
                let pop = &p.species[s];
                count += pop.size();
                weight += pop.weight();
                kinetic += pop.kinetic_energy(&sp.carrier);
                lost += *pop.flux();
            }
            local.extend_from_slice(&[count as f64, weight, kinetic]);
            local.extend_from_slice(&flux_totals(&lost));
        }

        ctx.comm.all_sum(&local)
    }

    /// Writes the totals if they are due at `itime`. Every rank returns
    /// the same result.
    pub fn write<M: Messenger>(&mut self, ctx: &SimContext<M>, collection: &PatchCollection, itime: usize, time: f64) -> Result<(), SimError> {
        if !self.selection.the_time_is_now(itime) {
            return Ok(());
        }

        let values = self.compute(ctx, collection);
        let written = if ctx.comm.rank() == 0 {
            tracing::info!(
                "step {}: field energy = {:.4e} J, {}",
                itime, values[0],
                ctx.params.species.iter().enumerate()
                    .map(|(s, sp)| format!("{} = {}", sp.name, values[1 + PER_SPECIES * s]))
                    .collect::<Vec<String>>()
                    .join(", "),
            );
            self.append(itime, time, &values)
        } else {
            Ok(())
        };

        // every rank must fail with the same kind of error
        if ctx.comm.any(written.is_err()) {
            let e = written.err().unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "scalar output failed on rank 0"));
            return Err(SimError::Diagnostics(e));
        }
        Ok(())
    }

    /// Appends one line, after a header if the file is new. A restarted
    /// run continues the file it finds.
    fn append(&self, itime: usize, time: f64, values: &[f64]) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "# step time {}", self.names.join(" "))?;
        }
        let line: Vec<String> = values.iter().map(|v| format!("{:.6e}", v)).collect();
        writeln!(file, "{} {:.6e} {}", itime, time, line.join(" "))
    }
}

fn flux_totals(flux: &BoundaryFlux) -> [f64; 4] {
    [flux.count as f64, flux.weight, flux.charge, flux.energy]
}
