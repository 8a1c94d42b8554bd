use std::error::Error;
use std::path::PathBuf;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod constants;
mod setup;
mod error;
mod comm;
mod decomposition;
mod schedule;
mod ownership;
mod grid;
mod particle;
mod patch;
mod params;
mod collection;
mod balance;
mod domain;
mod checkpoint;
mod window;
mod diagnostics;
mod simulation;

use comm::{Messenger, ThreadWorld};
use error::{FatalError, SimError};
use params::Parameters;
use setup::InputError;
use simulation::Simulation;

/// Command line: the input file, and optionally `--ranks N` to run
/// N ranks as threads of this process instead of as MPI processes.
struct Arguments {
    path: PathBuf,
    ranks: Option<usize>,
}

impl Arguments {
    fn parse() -> Result<Arguments, InputError> {
        let mut path = None;
        let mut ranks = None;
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "--ranks" {
                let n = args.next()
                    .and_then(|s| s.parse::<usize>().ok())
                    .filter(|&n| n > 0)
                    .ok_or(InputError::InvalidInputFile("--ranks needs a positive integer"))?;
                ranks = Some(n);
            } else if path.is_none() {
                path = Some(PathBuf::from(arg));
            } else {
                return Err(InputError::InvalidInputFile("more than one input file supplied"));
            }
        }
        let path = path.ok_or(InputError::InvalidInputFile("no file supplied"))?;
        Ok(Arguments {path, ranks})
    }
}

fn run<M: Messenger>(comm: &M, params: &Parameters) -> Result<(), SimError> {
    let mut sim = Simulation::initialize(comm, params)?;
    sim.run()
}

/// Reports the error of the rank that actually failed, rather than
/// one of the ranks that stopped because of it.
fn run_threads(params: &Parameters, ranks: usize) -> Result<(), SimError> {
    let mut errors: Vec<SimError> = ThreadWorld::run(ranks, |world| run(&world, params))
        .into_iter()
        .filter_map(Result::err)
        .collect();
    let origin = errors.iter()
        .position(|e| !matches!(e, SimError::Fatal(FatalError::PeerFailed)))
        .unwrap_or(0);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.swap_remove(origin))
    }
}

#[cfg(feature = "distributed")]
fn run_mpi(params: &Parameters) -> Result<(), Box<dyn Error>> {
    let universe = mpi::initialize().ok_or(InputError::InvalidInputFile("MPI could not be initialized"))?;
    let world = comm::MpiWorld::new(universe.world());
    if let Err(e) = run(&world, params) {
        tracing::error!("rank {}: {}", world.rank(), e);
        world.abort(1);
    }
    Ok(())
}

#[cfg(not(feature = "distributed"))]
fn run_mpi(params: &Parameters) -> Result<(), Box<dyn Error>> {
    run_threads(params, 1)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let args = Arguments::parse()?;
    let params = Parameters::load(&args.path)?;

    match args.ranks {
        Some(n) => run_threads(&params, n)?,
        None => run_mpi(&params)?,
    }

    Ok(())
}
