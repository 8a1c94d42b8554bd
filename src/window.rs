//! The moving window
//!
//! The simulation domain follows the plasma along x one patch length at
//! a time. A shift drops the trailing column of patches, relabels the
//! rest, and creates a fresh column at the leading edge.

use rayon::prelude::*;

use crate::collection::PatchCollection;
use crate::comm::Messenger;
use crate::error::SimError;
use crate::params::Parameters;
use crate::patch::Patch;
use crate::simulation::SimContext;

#[derive(Clone, Debug)]
pub struct SimWindow {
    velocity: f64,
    start: f64,
    patch_length: f64,
    enabled: bool,
}

impl SimWindow {
    pub fn new(params: &Parameters) -> Self {
        let patch_length = params.decomposition.patch_length(0);
        match &params.window {
            Some(w) => SimWindow {velocity: w.velocity, start: w.start, patch_length, enabled: w.velocity > 0.0},
            None => SimWindow {velocity: 0.0, start: 0.0, patch_length, enabled: false},
        }
    }

    pub fn is_moving(&self, time: f64) -> bool {
        self.enabled && time > self.start
    }

    /// Number of shifts the window should have made by `time`.
    fn shifts_by(&self, time: f64) -> usize {
        if !self.is_moving(time) {
            return 0;
        }
        (self.velocity * (time - self.start) / self.patch_length).floor() as usize
    }

    /// Shifts the window as many times as needed to catch up with `time`,
    /// returning the number of shifts made.
    pub fn operate<M: Messenger>(&self, ctx: &SimContext<M>, collection: &mut PatchCollection, time: f64) -> Result<usize, SimError> {
        let mut count = 0;
        while collection.n_moved() < self.shifts_by(time) {
            self.shift(ctx, collection)?;
            count += 1;
        }
        Ok(count)
    }

    /// Moves the domain forward by one patch length.
    pub fn shift<M: Messenger>(&self, ctx: &SimContext<M>, collection: &mut PatchCollection) -> Result<(), SimError> {
        let params = ctx.params;
        let d = &params.decomposition;
        let rank = ctx.comm.rank();
        let n_moved = collection.n_moved() + 1;
        let map = collection.map().clone();

        let (trailing, mut kept): (Vec<Patch>, Vec<Patch>) = collection.take_patches()
            .into_iter()
            .partition(|p| p.coords()[0] == 0);

        let retired: Vec<_> = trailing.into_iter()
            .map(|p| p.retire(params))
            .collect();

        for p in kept.iter_mut() {
            let mut coords = p.coords();
            coords[0] -= 1;
            p.relocate(d.index_of(coords), d, n_moved);
        }

        // the new leading edge is created by whoever owns it under the
        // current map, and moved on by the redistribution below
        let leading: Vec<usize> = (0..d.total_patches())
            .filter(|&i| d.coords_of(i)[0] == d.patches[0] - 1 && map.owner(i) == rank)
            .collect();
        let fresh: Result<Vec<Patch>, _> = leading.into_par_iter()
            .map(|i| Patch::new(i, params, n_moved, true))
            .collect();
        let mut fresh = ctx.agree(fresh.map_err(SimError::from))?;

        kept.append(&mut fresh);
        let moved = kept.len() + retired.len();
        collection.install(kept, n_moved, &retired);
        tracing::debug!("rank {}: window shift {}, {} patches moved", rank, n_moved, moved);

        collection.redistribute(ctx, map)
    }
}
