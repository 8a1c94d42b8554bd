//! Dynamic load balancing

use crate::collection::PatchCollection;
use crate::comm::Messenger;
use crate::error::SimError;
use crate::ownership::OwnershipMap;
use crate::schedule::TimeSelection;
use crate::simulation::SimContext;

/// Redistributes patches so that every rank carries roughly the same
/// share of the total cost, where a patch costs one unit per
/// macroparticle plus `cell_load` per cell.
#[derive(Clone, Debug)]
pub struct LoadBalancer {
    selection: TimeSelection,
    cell_load: f64,
}

impl LoadBalancer {
    pub fn new(selection: TimeSelection, cell_load: f64) -> Self {
        LoadBalancer {selection, cell_load}
    }

    pub fn is_due(&self, itime: usize) -> bool {
        self.selection.the_time_is_now(itime)
    }

    /// The cost of every patch, in curve order.
    pub fn global_costs<M: Messenger>(&self, ctx: &SimContext<M>, collection: &PatchCollection) -> Vec<f64> {
        // each rank holds a contiguous range of the curve, so concatenating
        // in rank order restores curve order
        ctx.comm.all_gather(&collection.costs(self.cell_load))
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn propose<M: Messenger>(&self, ctx: &SimContext<M>, collection: &PatchCollection) -> Result<OwnershipMap, SimError> {
        let costs = self.global_costs(ctx, collection);
        let map = OwnershipMap::balanced(&costs, ctx.comm.size())?;
        Ok(map)
    }

    /// Moves patches to the balanced ownership, returning true if
    /// anything changed.
    pub fn run<M: Messenger>(&self, ctx: &SimContext<M>, collection: &mut PatchCollection) -> Result<bool, SimError> {
        let map = self.propose(ctx, collection)?;
        if &map == collection.map() {
            return Ok(false);
        }
        if ctx.comm.rank() == 0 {
            tracing::info!("rebalancing: {:?} -> {:?} patches per rank", collection.map().counts(), map.counts());
        }
        collection.redistribute(ctx, map)?;
        Ok(true)
    }
}
