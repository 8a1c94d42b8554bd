//! The main loop
//!
//! Every rank runs the same sequence of phases on its own patches. A
//! phase that fails on one rank is made to fail on all of them, so that
//! no rank is left waiting in a collective that the others have
//! abandoned.

use std::time::Instant;

use tracing::{info, warn};

use crate::balance::LoadBalancer;
use crate::checkpoint::Checkpoint;
use crate::collection::PatchCollection;
use crate::comm::Messenger;
use crate::diagnostics::Scalars;
use crate::domain::DomainSyncBridge;
use crate::error::{FatalError, SimError};
use crate::ownership::OwnershipMap;
use crate::params::Parameters;
use crate::setup::{ettc, PrettyDuration};
use crate::window::SimWindow;

/// What every phase needs to know: who it is talking to, and the
/// configuration of the run.
pub struct SimContext<'a, M: Messenger> {
    pub comm: &'a M,
    pub params: &'a Parameters,
}

impl<'a, M: Messenger> Clone for SimContext<'a, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, M: Messenger> Copy for SimContext<'a, M> {}

impl<'a, M: Messenger> SimContext<'a, M> {
    pub fn new(comm: &'a M, params: &'a Parameters) -> Self {
        SimContext {comm, params}
    }

    /// Collective: succeeds only if `r` succeeded on every rank. A rank
    /// that did not fail itself gets [`FatalError::PeerFailed`].
    pub fn agree<T>(&self, r: Result<T, SimError>) -> Result<T, SimError> {
        if self.comm.any(r.is_err()) {
            match r {
                Err(e) => Err(e),
                Ok(_) => Err(FatalError::PeerFailed.into()),
            }
        } else {
            r
        }
    }
}

pub struct Simulation<'a, M: Messenger> {
    ctx: SimContext<'a, M>,
    collection: PatchCollection,
    domain: DomainSyncBridge,
    balancer: LoadBalancer,
    checkpoint: Checkpoint,
    window: SimWindow,
    scalars: Scalars,
    /// The last completed step.
    itime: usize,
}

impl<'a, M: Messenger> Simulation<'a, M> {
    /// Loads the initial plasma, or, if asked to, picks up from the
    /// newest complete checkpoint.
    pub fn initialize(comm: &'a M, params: &'a Parameters) -> Result<Self, SimError> {
        let ctx = SimContext::new(comm, params);
        let mut checkpoint = Checkpoint::new(params);

        let (collection, itime) = if params.checkpoint.restart {
            let restart = checkpoint.read_ownership(&ctx)?;
            let mut collection = PatchCollection::new(&ctx, restart.map.clone(), restart.n_moved, false)?;
            checkpoint.restore_all(&ctx, &restart, &mut collection)?;
            if comm.rank() == 0 {
                info!("restarting from step {} ({} window shifts)", restart.time_index, restart.n_moved);
            }
            (collection, restart.time_index)
        } else {
            let map = OwnershipMap::even(params.decomposition.total_patches(), comm.size())?;
            let mut collection = PatchCollection::new(&ctx, map, 0, true)?;
            collection.compute_charge(&ctx)?;
            collection.finalize_sync_and_bc_fields(&ctx)?;
            (collection, 0)
        };

        let domain = DomainSyncBridge::build(&ctx, collection.map())?;

        if comm.rank() == 0 {
            let d = &params.decomposition;
            info!(
                "{} geometry, {:?} patches of {:?} cells, on {} ranks with {} threads each",
                d.geometry, &d.patches[..d.ndim()], &d.cells[..d.ndim()], comm.size(), rayon::current_num_threads(),
            );
            info!("dt = {:.3e} s, running to step {}", params.dt, params.n_time);
        }

        Ok(Simulation {
            ctx,
            collection,
            domain,
            balancer: LoadBalancer::new(params.load_balancing, params.cell_load),
            checkpoint,
            window: SimWindow::new(params),
            scalars: Scalars::new(params),
            itime,
        })
    }

    pub fn collection(&self) -> &PatchCollection {
        &self.collection
    }

    pub fn itime(&self) -> usize {
        self.itime
    }

    /// Advances the simulation by one timestep, to `itime`.
    pub fn step(&mut self, itime: usize) -> Result<(), SimError> {
        let ctx = self.ctx;
        let params = ctx.params;
        let time_dual = (itime as f64 + 0.5) * params.dt;

        self.collection.dynamics(&ctx);
        self.collection.sum_densities(&ctx)?;
        let antennas = self.collection.apply_antennas(&ctx, time_dual);
        ctx.agree(antennas.map_err(SimError::from))?;
        ctx.comm.barrier();

        if time_dual > params.fields_frozen_until {
            self.domain.gather(&ctx, &self.collection)?;
            let solved = self.domain.solve(params);
            ctx.agree(solved.map_err(SimError::from))?;
            self.domain.scatter(&ctx, &mut self.collection)?;
        }

        self.collection.finalize_and_sort_particles(&ctx)?;
        self.collection.finalize_sync_and_bc_fields(&ctx)?;

        // a failure to write output is reported once the state is
        // consistent again
        let diagnostics = self.scalars.write(&ctx, &self.collection, itime, time_dual);

        if self.window.is_moving(time_dual) {
            let shifts = self.window.operate(&ctx, &mut self.collection, time_dual)?;
            if shifts > 0 {
                self.domain.rebuild(&ctx, self.collection.map())?;
            }
        }

        diagnostics
    }

    /// Runs to the final step, or until an exit is requested.
    pub fn run(&mut self) -> Result<(), SimError> {
        let ctx = self.ctx;
        let params = ctx.params;
        let first = self.itime + 1;
        let runtime = Instant::now();

        for itime in first..=params.n_time {
            if let Err(e) = self.step(itime) {
                if e.state_is_intact() {
                    warn!("step {} failed ({}), attempting a final checkpoint", itime, e);
                    if let Err(dump) = self.checkpoint.dump(&ctx, &self.collection, itime, true) {
                        warn!("final checkpoint failed: {}", dump);
                    }
                }
                return Err(e);
            }
            self.itime = itime;

            let exit = self.checkpoint.exit_requested(&ctx);
            self.checkpoint.dump(&ctx, &self.collection, itime, exit)?;

            if !exit && self.balancer.is_due(itime) && self.balancer.run(&ctx, &mut self.collection)? {
                self.domain.rebuild(&ctx, self.collection.map())?;
            }

            let done = itime + 1 - first;
            if ctx.comm.rank() == 0 && (itime % params.print_every.max(1) == 0 || itime == params.n_time) {
                info!(
                    "step {: >6} of {} at t = {: >8.2} fs, RT = {}, ETTC = {}",
                    itime, params.n_time, 1.0e15 * itime as f64 * params.dt,
                    PrettyDuration::from(runtime.elapsed()),
                    PrettyDuration::from(ettc(runtime, done, params.n_time + 1 - first)),
                );
            }

            if exit {
                self.checkpoint.clear_stop_request(&ctx);
                if ctx.comm.rank() == 0 {
                    info!("exit requested, stopping after step {}", itime);
                }
                break;
            }
        }

        Ok(())
    }
}
