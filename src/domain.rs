//! The unified grid: one Cartesian block of the global field grid per
//! rank, on which the field solver runs
//!
//! The blocks are laid out independently of patch ownership, so a rank
//! generally needs field values from patches it does not own (its
//! "additional" patches) and must supply values from patches it owns
//! to the ranks whose blocks contain them (its "missing" patches).

use std::ops::Range;

use crate::comm::{tags, Messenger};
use crate::decomposition::Decomposition;
use crate::error::{keep_first, ConfigError, FatalError, SimError};
use crate::grid::{self, Combine, Component, FieldSet};
use crate::ownership::OwnershipMap;
use crate::collection::PatchCollection;
use crate::params::Parameters;
use crate::simulation::SimContext;

/// Cartesian arrangement of the rank blocks over the patch lattice.
#[derive(Clone, Debug, PartialEq)]
pub struct DomainLayout {
    dims: [usize; 3],
    /// Lattice coordinate at which each block starts, per axis,
    /// with the end of the lattice appended.
    cuts: [Vec<usize>; 3],
}

impl DomainLayout {
    /// Splits `nranks` into one factor per axis, no larger than the
    /// number of patches along it. Of all such splits, the one with the
    /// largest blocks along their narrowest axis is used; ties go to the
    /// split with more blocks along the lower axes.
    ///
    /// A count that has no such split, such as a prime larger than every
    /// axis, is rejected.
    pub fn new(d: &Decomposition, nranks: usize) -> Result<DomainLayout, ConfigError> {
        let ndim = d.ndim();
        let narrowest = |dims: &[usize; 3]| -> f64 {
            (0..ndim)
                .map(|a| d.patches[a] as f64 / dims[a] as f64)
                .fold(f64::INFINITY, f64::min)
        };

        let mut best: Option<[usize; 3]> = None;
        let divisors = |n: usize, limit: usize| (1..=n.min(limit)).filter(move |f| n % f == 0);
        for x in divisors(nranks, d.patches[0]) {
            for y in divisors(nranks / x, d.patches[1]) {
                let z = nranks / (x * y);
                if z > d.patches[2] {
                    continue;
                }
                let dims = [x, y, z];
                let better = match &best {
                    None => true,
                    Some(b) => {
                        let (n, nb) = (narrowest(&dims), narrowest(b));
                        n > nb || (n == nb && dims > *b)
                    },
                };
                if better {
                    best = Some(dims);
                }
            }
        }

        let dims = best.ok_or_else(|| ConfigError::Decomposition(format!(
            "cannot arrange {} ranks in blocks over a {:?} patch lattice", nranks, &d.patches[..ndim]
        )))?;

        let split = |axis: usize| -> Vec<usize> {
            let n = d.patches[axis];
            let base = n / dims[axis];
            let rem = n % dims[axis];
            let mut cuts = vec![0];
            for b in 0..dims[axis] {
                let len = base + if b < rem {1} else {0};
                cuts.push(cuts[b] + len);
            }
            cuts
        };

        Ok(DomainLayout {
            dims,
            cuts: [split(0), split(1), split(2)],
        })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    fn block_coords(&self, rank: usize) -> [usize; 3] {
        [
            rank % self.dims[0],
            (rank / self.dims[0]) % self.dims[1],
            rank / (self.dims[0] * self.dims[1]),
        ]
    }

    /// Lattice coordinates covered by the block of `rank`.
    pub fn patch_range(&self, rank: usize) -> [Range<usize>; 3] {
        let b = self.block_coords(rank);
        let r = |a: usize| self.cuts[a][b[a]]..self.cuts[a][b[a] + 1];
        [r(0), r(1), r(2)]
    }

    /// Rank whose block contains the patch at `coords`.
    pub fn block_rank(&self, coords: [usize; 3]) -> usize {
        let mut b = [0; 3];
        for a in 0..3 {
            // cuts are sorted, the block is the last one starting at or before coords
            b[a] = self.cuts[a].iter().rposition(|&c| c <= coords[a]).unwrap_or(0).min(self.dims[a] - 1);
        }
        b[0] + self.dims[0] * (b[1] + self.dims[1] * b[2])
    }

    /// Curve indices of the patches in the block of `rank`.
    pub fn patches_of(&self, d: &Decomposition, rank: usize) -> Vec<usize> {
        let r = self.patch_range(rank);
        let mut v = Vec::new();
        for i in r[0].clone() {
            for j in r[1].clone() {
                for k in r[2].clone() {
                    v.push(d.index_of([i, j, k]));
                }
            }
        }
        v.sort_unstable();
        v
    }
}

/// Patches in `block` that `rank` does not own, paired with their owners.
pub fn identify_additional_patches<F>(block: &[usize], owner: F, rank: usize) -> Vec<(usize, usize)>
where F: Fn(usize) -> usize {
    let mut v: Vec<(usize, usize)> = block.iter()
        .map(|&index| (index, owner(index)))
        .filter(|&(_, source)| source != rank)
        .collect();
    v.sort_unstable();
    v
}

/// Patches owned by `rank` that lie in another rank's block, paired with that rank.
pub fn identify_missing_patches<F>(owned: &[usize], block_rank: F, rank: usize) -> Vec<(usize, usize)>
where F: Fn(usize) -> usize {
    let mut v: Vec<(usize, usize)> = owned.iter()
        .map(|&index| (index, block_rank(index)))
        .filter(|&(_, recipient)| recipient != rank)
        .collect();
    v.sort_unstable();
    v
}

fn patches_from(pairs: &[(usize, usize)], rank: usize) -> Vec<usize> {
    let mut v: Vec<usize> = pairs.iter().filter(|p| p.1 == rank).map(|p| p.0).collect();
    v.sort_unstable();
    v
}

/// Checks, given every rank's maps, that `(P, Q)` is in `additional[R]`
/// exactly when `(P, R)` is in `missing[Q]`.
pub fn check_reciprocity(additional: &[Vec<(usize, usize)>], missing: &[Vec<(usize, usize)>]) -> Result<(), FatalError> {
    let nranks = additional.len().max(missing.len());
    let empty = Vec::new();
    for r in 0..nranks {
        for q in 0..nranks {
            let found = patches_from(additional.get(r).unwrap_or(&empty), q);
            let expected = patches_from(missing.get(q).unwrap_or(&empty), r);
            if found != expected {
                return Err(FatalError::Reciprocity {rank: r, peer: q, expected, found});
            }
        }
    }
    Ok(())
}

/// Collective reciprocity check: every rank tells each of its sources
/// which patches it expects, and the sources compare that with their
/// own obligations.
pub fn verify_reciprocity<M: Messenger>(comm: &M, additional: &[(usize, usize)], missing: &[(usize, usize)]) -> Result<(), FatalError> {
    let (me, size) = (comm.rank(), comm.size());
    let requests: Vec<Vec<u64>> = (0..size)
        .map(|q| patches_from(additional, q).into_iter().map(|i| i as u64).collect())
        .collect();
    let received = comm.exchange(tags::OBLIGATIONS, requests);

    let mut status = Ok(());
    for (peer, asked) in received.into_iter().enumerate() {
        let found: Vec<usize> = asked.into_iter().map(|i| i as usize).collect();
        let expected = patches_from(missing, peer);
        if found != expected {
            keep_first(&mut status, Err(FatalError::Reciprocity {rank: me, peer, expected, found}));
        }
    }

    if comm.any(status.is_err()) {
        status.and(Err(FatalError::PeerFailed))
    } else {
        Ok(())
    }
}

/// Whether the unified grid holds the current fields.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SyncState {
    Stale,
    Gathered,
}

pub struct DomainSyncBridge {
    layout: DomainLayout,
    rank: usize,
    /// Lattice coordinates of this rank's block.
    block: [Range<usize>; 3],
    grid: FieldSet,
    additional: Vec<(usize, usize)>,
    missing: Vec<(usize, usize)>,
    state: SyncState,
}

impl DomainSyncBridge {
    pub fn build<M: Messenger>(ctx: &SimContext<M>, map: &OwnershipMap) -> Result<DomainSyncBridge, SimError> {
        let d = &ctx.params.decomposition;
        let rank = ctx.comm.rank();
        let layout = DomainLayout::new(d, ctx.comm.size())?;
        let block = layout.patch_range(rank);

        let mut interior = [1; 3];
        let mut ghost = [0; 3];
        for a in 0..3 {
            interior[a] = block[a].len() * d.cells[a];
            ghost[a] = d.ghost(a);
        }

        let mut bridge = DomainSyncBridge {
            layout,
            rank,
            block,
            grid: FieldSet::new(interior, ghost),
            additional: Vec::new(),
            missing: Vec::new(),
            state: SyncState::Stale,
        };
        bridge.rebuild(ctx, map)?;
        Ok(bridge)
    }

    /// Recomputes the additional and missing patches for a new ownership
    /// map, and checks them against those of every other rank.
    pub fn rebuild<M: Messenger>(&mut self, ctx: &SimContext<M>, map: &OwnershipMap) -> Result<(), SimError> {
        let d = &ctx.params.decomposition;
        let block = self.layout.patches_of(d, self.rank);
        let owned: Vec<usize> = map.range(self.rank).collect();
        self.additional = identify_additional_patches(&block, |i| map.owner(i), self.rank);
        self.missing = identify_missing_patches(&owned, |i| self.layout.block_rank(d.coords_of(i)), self.rank);
        self.state = SyncState::Stale;
        tracing::debug!(
            "rank {}: block of {} patches, {} additional, {} missing",
            self.rank, block.len(), self.additional.len(), self.missing.len()
        );
        verify_reciprocity(ctx.comm, &self.additional, &self.missing)?;
        Ok(())
    }

    pub fn layout(&self) -> &DomainLayout {
        &self.layout
    }

    pub fn additional(&self) -> &[(usize, usize)] {
        &self.additional
    }

    pub fn missing(&self) -> &[(usize, usize)] {
        &self.missing
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn grid(&self) -> &FieldSet {
        &self.grid
    }

    /// Index ranges in a patch array, and in the block array of
    /// `block`, of the part of the patch that belongs to the block.
    /// Ghost cells are included on the outer faces of the block.
    fn copy_ranges(d: &Decomposition, coords: [usize; 3], block: &[Range<usize>; 3], with_ghosts: bool) -> ([Range<usize>; 3], [Range<usize>; 3]) {
        let mut patch = [0..1, 0..1, 0..1];
        let mut grid = [0..1, 0..1, 0..1];
        for a in 0..3 {
            let (g, n) = (d.ghost(a), d.cells[a]);
            let mut start = g;
            let mut end = g + n;
            if with_ghosts && g > 0 {
                if coords[a] == block[a].start {
                    start = 0;
                }
                if coords[a] + 1 == block[a].end {
                    end = n + 2 * g;
                }
            }
            let shift = (coords[a] - block[a].start) * n;
            patch[a] = start..end;
            grid[a] = (start + shift)..(end + shift);
        }
        (patch, grid)
    }

    /// Copies E, B and J of every patch in the block into the unified grid.
    pub fn gather<M: Messenger>(&mut self, ctx: &SimContext<M>, collection: &PatchCollection) -> Result<(), SimError> {
        let d = &ctx.params.decomposition;
        let size = ctx.comm.size();
        let components = &Component::SOLVER;
        let mut status = Ok(());

        // owned patches needed elsewhere
        let mut outgoing: Vec<Vec<(usize, Vec<f64>)>> = vec![Vec::new(); size];
        for &(index, recipient) in &self.missing {
            match collection.get(index) {
                Some(p) => {
                    let block = self.layout.patch_range(recipient);
                    let (src, _) = Self::copy_ranges(d, p.coords(), &block, true);
                    outgoing[recipient].push((index, p.fields.pack(components, &src)));
                },
                None => keep_first(&mut status, Err(self.not_held(index))),
            }
        }

        // owned patches in the local block
        for p in collection.patches() {
            if self.layout.block_rank(p.coords()) == self.rank {
                let (src, dst) = Self::copy_ranges(d, p.coords(), &self.block, true);
                let data = p.fields.pack(components, &src);
                let r = self.grid.unpack(components, &dst, &data, Combine::Assign)
                    .map_err(|reason| FatalError::SyncMismatch {rank: self.rank, index: p.index(), reason});
                keep_first(&mut status, r);
            }
        }

        for (index, data) in exchange_blocks(ctx.comm, outgoing) {
            let (_, dst) = Self::copy_ranges(d, d.coords_of(index), &self.block, true);
            let r = self.grid.unpack(components, &dst, &data, Combine::Assign)
                .map_err(|reason| FatalError::SyncMismatch {rank: self.rank, index, reason});
            keep_first(&mut status, r);
        }

        self.state = SyncState::Gathered;
        ctx.agree(status.map_err(SimError::from))
    }

    /// Advances the unified grid by one timestep.
    pub fn solve(&mut self, params: &Parameters) -> Result<(), FatalError> {
        if self.state != SyncState::Gathered {
            return Err(FatalError::StaleDomain);
        }
        let d = &params.decomposition;
        grid::advance(&mut self.grid, params.dt, &d.cell_length, d.ndim());
        Ok(())
    }

    /// Writes the interior E and B of the unified grid back into every
    /// patch of the block, returning values of additional patches to
    /// their owners. The grid is stale afterwards.
    pub fn scatter<M: Messenger>(&mut self, ctx: &SimContext<M>, collection: &mut PatchCollection) -> Result<(), SimError> {
        let stale = self.state != SyncState::Gathered;
        if ctx.comm.any(stale) {
            return Err(if stale {FatalError::StaleDomain} else {FatalError::PeerFailed}.into());
        }

        let d = &ctx.params.decomposition;
        let size = ctx.comm.size();
        let components = &Component::EM;
        let mut status = Ok(());

        let mut outgoing: Vec<Vec<(usize, Vec<f64>)>> = vec![Vec::new(); size];
        for &(index, source) in &self.additional {
            let (_, src) = Self::copy_ranges(d, d.coords_of(index), &self.block, false);
            outgoing[source].push((index, self.grid.pack(components, &src)));
        }

        for p in collection.patches_mut() {
            if self.layout.block_rank(p.coords()) == self.rank {
                let (dst, src) = Self::copy_ranges(d, p.coords(), &self.block, false);
                let data = self.grid.pack(components, &src);
                let r = p.fields.unpack(components, &dst, &data, Combine::Assign)
                    .map_err(|reason| FatalError::SyncMismatch {rank: self.rank, index: p.index(), reason});
                keep_first(&mut status, r);
            }
        }

        for (index, data) in exchange_blocks(ctx.comm, outgoing) {
            let r = match collection.get_mut(index) {
                Some(p) => {
                    let block = self.layout.patch_range(self.layout.block_rank(p.coords()));
                    let (dst, _) = Self::copy_ranges(d, p.coords(), &block, false);
                    p.fields.unpack(components, &dst, &data, Combine::Assign)
                        .map_err(|reason| FatalError::SyncMismatch {rank: self.rank, index, reason})
                },
                None => Err(self.not_held(index)),
            };
            keep_first(&mut status, r);
        }

        self.state = SyncState::Stale;
        ctx.agree(status.map_err(SimError::from))
    }

    fn not_held(&self, index: usize) -> FatalError {
        FatalError::SyncMismatch {
            rank: self.rank,
            index,
            reason: "patch is not held by this rank".to_owned(),
        }
    }
}

/// Sends each rank its list of (patch, values) pairs; returns what
/// arrived here, from every rank.
fn exchange_blocks<M: Messenger>(comm: &M, outgoing: Vec<Vec<(usize, Vec<f64>)>>) -> Vec<(usize, Vec<f64>)> {
    let mut headers: Vec<Vec<u64>> = Vec::with_capacity(outgoing.len());
    let mut data: Vec<Vec<f64>> = Vec::with_capacity(outgoing.len());
    for blocks in outgoing {
        let mut h = Vec::new();
        let mut v = Vec::new();
        for (index, values) in blocks {
            h.extend_from_slice(&[index as u64, values.len() as u64]);
            v.extend(values);
        }
        headers.push(h);
        data.push(v);
    }

    let headers = comm.exchange(tags::DOMAIN_HEADERS, headers);
    let data = comm.exchange(tags::DOMAIN_DATA, data);

    let mut received = Vec::new();
    for (h, values) in headers.iter().zip(data) {
        let mut offset = 0;
        for chunk in h.chunks(2) {
            let end = (offset + chunk[1] as usize).min(values.len());
            received.push((chunk[0] as usize, values[offset..end].to_vec()));
            offset = end;
        }
    }
    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadWorld;
    use crate::decomposition::Geometry;
    use crate::params::tests::*;

    #[test]
    fn blocks_tile_the_lattice() {
        let params = parameters(PLASMA_2D);
        let d = &params.decomposition;
        for &nranks in &[1, 2, 3, 4, 6, 8, 16] {
            let layout = DomainLayout::new(d, nranks).unwrap();
            let mut seen = vec![0; d.total_patches()];
            for rank in 0..nranks {
                for index in layout.patches_of(d, rank) {
                    seen[index] += 1;
                    assert_eq!(layout.block_rank(d.coords_of(index)), rank);
                }
            }
            println!("{} ranks: blocks {:?}", nranks, layout.dims());
            assert!(seen.iter().all(|&n| n == 1));
        }
        assert!(DomainLayout::new(d, 5).is_err());
    }

    #[test]
    fn every_factorization_is_considered() {
        let d = Decomposition::new(Geometry::Cartesian2D, &[4, 3], &[8, 8], &[0.1, 0.1], 2, [false; 3]).unwrap();
        let layout = DomainLayout::new(&d, 12).unwrap();
        assert_eq!(layout.dims(), [4, 3, 1]);
        let mut seen = vec![0; d.total_patches()];
        for rank in 0..12 {
            let block = layout.patches_of(&d, rank);
            assert_eq!(block.len(), 1);
            seen[block[0]] += 1;
        }
        assert!(seen.iter().all(|&n| n == 1));

        // 3x2 keeps every block at least a patch and a third wide, 2x3 does not
        assert_eq!(DomainLayout::new(&d, 6).unwrap().dims(), [3, 2, 1]);
        assert!(DomainLayout::new(&d, 24).is_err());
        assert!(DomainLayout::new(&d, 7).is_err());
    }

    #[test]
    fn derived_maps_are_reciprocal() {
        let params = parameters(PLASMA_2D);
        let d = &params.decomposition;
        for &nranks in &[1, 2, 3, 4, 6, 8] {
            let layout = DomainLayout::new(d, nranks).unwrap();
            let map = OwnershipMap::even(d.total_patches(), nranks).unwrap();
            let additional: Vec<_> = (0..nranks)
                .map(|r| identify_additional_patches(&layout.patches_of(d, r), |i| map.owner(i), r))
                .collect();
            let missing: Vec<_> = (0..nranks)
                .map(|r| {
                    let owned: Vec<usize> = map.range(r).collect();
                    identify_missing_patches(&owned, |i| layout.block_rank(d.coords_of(i)), r)
                })
                .collect();
            check_reciprocity(&additional, &missing).unwrap();
        }
    }

    /// Four ranks, where rank 0's block is the whole lattice and
    /// the other ranks own three-quarters of it between them.
    #[test]
    fn four_rank_fixture() {
        let owner = |i: usize| match i {
            0..=3 => 3,
            4..=7 => 2,
            8..=11 => 1,
            _ => 0,
        };
        let everything: Vec<usize> = (0..16).collect();
        let additional: Vec<Vec<(usize, usize)>> = vec![
            identify_additional_patches(&everything, owner, 0),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        ];
        assert_eq!(additional[0].len(), 12);
        for q in 1..4 {
            assert_eq!(patches_from(&additional[0], q).len(), 4);
        }
        assert_eq!(patches_from(&additional[0], 3), vec![0, 1, 2, 3]);

        let missing: Vec<Vec<(usize, usize)>> = (0..4)
            .map(|r| {
                let owned: Vec<usize> = (0..16).filter(|&i| owner(i) == r).collect();
                identify_missing_patches(&owned, |_| 0, r)
            })
            .collect();
        assert!(missing[0].is_empty());
        let mut listed: Vec<(usize, usize)> = missing[1..].iter().flatten().copied().collect();
        listed.sort_unstable();
        assert_eq!(listed, (0..12).map(|i| (i, 0)).collect::<Vec<_>>());
        check_reciprocity(&additional, &missing).unwrap();

        // an orphaned obligation is caught
        let mut broken = missing.clone();
        broken[2].push((13, 0));
        match check_reciprocity(&additional, &broken) {
            Err(FatalError::Reciprocity {rank, peer, ..}) => assert_eq!((rank, peer), (0, 2)),
            other => panic!("expected a reciprocity failure, got {:?}", other),
        }
    }

    #[test]
    fn gather_then_scatter_changes_nothing() {
        let params = parameters(PLASMA_2D);
        ThreadWorld::run(4, |world| {
            let ctx = SimContext::new(&world, &params);
            let map = OwnershipMap::from_counts(vec![1, 7, 5, 3]).unwrap();
            let mut collection = PatchCollection::new(&ctx, map.clone(), 0, false).unwrap();
            for p in collection.patches_mut() {
                let offset = 100.0 * p.index() as f64;
                for c in Component::EM.iter() {
                    p.fields.component_mut(*c).indexed_iter_mut()
                        .for_each(|((i, j, _), v)| *v = offset + (10 * i + j) as f64);
                }
            }
            collection.finalize_sync_and_bc_fields(&ctx).unwrap();
            let before: Vec<FieldSet> = collection.patches().iter().map(|p| p.fields.clone()).collect();

            let mut bridge = DomainSyncBridge::build(&ctx, &map).unwrap();
            assert!(bridge.solve(&params).is_err());
            bridge.gather(&ctx, &collection).unwrap();
            assert_eq!(bridge.state(), SyncState::Gathered);
            bridge.scatter(&ctx, &mut collection).unwrap();
            assert_eq!(bridge.state(), SyncState::Stale);

            for (p, f) in collection.patches().iter().zip(before.iter()) {
                for c in Component::ALL.iter() {
                    assert_eq!(p.fields.component(*c), f.component(*c), "patch {} changed", p.index());
                }
            }
        });
    }

    #[test]
    fn unified_grid_holds_every_patch() {
        let params = parameters(PLASMA_2D);
        let d = &params.decomposition;
        ThreadWorld::run(2, |world| {
            let ctx = SimContext::new(&world, &params);
            let map = OwnershipMap::from_counts(vec![12, 4]).unwrap();
            let mut collection = PatchCollection::new(&ctx, map.clone(), 0, false).unwrap();
            for p in collection.patches_mut() {
                let value = p.index() as f64;
                p.fields.component_mut(Component::Jx).fill(value);
            }
            let bridge = {
                let mut b = DomainSyncBridge::build(&ctx, &map).unwrap();
                b.gather(&ctx, &collection).unwrap();
                b
            };
            // patches this rank borrows are owned elsewhere, and every
            // borrowed patch is lent by exactly one rank
            assert!(bridge.additional().iter().all(|&(i, q)| map.owner(i) == q && q != world.rank()));
            assert!(bridge.missing().iter().all(|&(i, _)| map.owner(i) == world.rank()));
            let lent = world.all_sum(&[bridge.additional().len() as f64, bridge.missing().len() as f64]);
            assert_eq!(lent[0], lent[1]);

            let block = bridge.layout().patch_range(world.rank());
            let g = bridge.grid();
            let jx = g.component(Component::Jx);
            for index in bridge.layout().patches_of(d, world.rank()) {
                let c = d.coords_of(index);
                let i = 2 + (c[0] - block[0].start) * 8 + 3;
                let j = 2 + (c[1] - block[1].start) * 8 + 5;
                assert_eq!(jx[[i, j, 0]], index as f64);
            }
        });
    }
}
