//! The patches owned by one rank, and the exchanges that keep them
//! consistent with their neighbours

use rayon::prelude::*;

use crate::comm::{tags, Messenger, Tag};
use crate::decomposition::Side;
use crate::error::{keep_first, FatalError, SimError};
use crate::grid::{Combine, Component, Layer};
use crate::ownership::{verify_partition, OwnershipMap};
use crate::params::Parameters;
use crate::particle::{BoundaryFlux, Particle, Transit};
use crate::patch::{Patch, PatchState};
use crate::setup::InputError;
use crate::simulation::SimContext;

/// A block of field values bound for one face of a patch.
struct FacePacket {
    target: usize,
    side: Side,
    data: Vec<f64>,
}

/// Header words per face packet: target, side, length.
const FACE_HEADER: usize = 3;

pub struct PatchCollection {
    /// Sorted by curve index.
    patches: Vec<Patch>,
    map: OwnershipMap,
    n_moved: usize,
    /// Boundary fluxes of patches that no longer exist, per species.
    retired: Vec<BoundaryFlux>,
}

impl PatchCollection {
    /// Creates the patches this rank owns under `map`, then checks
    /// that the ranks between them hold every patch exactly once.
    pub fn new<M: Messenger>(ctx: &SimContext<M>, map: OwnershipMap, n_moved: usize, load: bool) -> Result<Self, SimError> {
        let params = ctx.params;
        let patches = map.range(ctx.comm.rank())
            .into_par_iter()
            .map(|index| Patch::new(index, params, n_moved, load))
            .collect::<Result<Vec<Patch>, InputError>>()?;

        let collection = PatchCollection {
            patches,
            map,
            n_moved,
            retired: vec![BoundaryFlux::default(); params.species.len()],
        };
        verify_partition(ctx.comm, &collection.map, &collection.indices())?;
        Ok(collection)
    }

    pub fn map(&self) -> &OwnershipMap {
        &self.map
    }

    pub fn n_moved(&self) -> usize {
        self.n_moved
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn patches_mut(&mut self) -> &mut [Patch] {
        &mut self.patches
    }

    pub fn indices(&self) -> Vec<usize> {
        self.patches.iter().map(|p| p.index()).collect()
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.patches.binary_search_by_key(&index, |p| p.index()).ok()
    }

    pub fn get(&self, index: usize) -> Option<&Patch> {
        self.position(index).map(|i| &self.patches[i])
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Patch> {
        match self.position(index) {
            Some(i) => Some(&mut self.patches[i]),
            None => None,
        }
    }

    pub fn retired(&self) -> &[BoundaryFlux] {
        &self.retired
    }

    pub(crate) fn set_retired(&mut self, retired: Vec<BoundaryFlux>) {
        self.retired = retired;
    }

    /// Removes every patch from the collection, leaving it empty
    /// until [`PatchCollection::install`] is called.
    pub(crate) fn take_patches(&mut self) -> Vec<Patch> {
        std::mem::take(&mut self.patches)
    }

    /// Replaces the contents of the collection, which need not match
    /// the ownership map until the next call to `redistribute`.
    pub(crate) fn install(&mut self, mut patches: Vec<Patch>, n_moved: usize, retired: &[Vec<BoundaryFlux>]) {
        patches.sort_by_key(|p| p.index());
        self.patches = patches;
        self.n_moved = n_moved;
        for flux in retired {
            for (total, f) in self.retired.iter_mut().zip(flux.iter()) {
                *total += *f;
            }
        }
    }

    /// Costs of the owned patches, in curve order.
    pub fn costs(&self, cell_load: f64) -> Vec<f64> {
        self.patches.iter().map(|p| p.cost(cell_load)).collect()
    }

    pub fn particle_count(&self) -> usize {
        self.patches.iter().map(|p| p.particle_count()).sum()
    }

    /// Deposits the charge density of all species, including
    /// contributions that spill over into neighbouring patches.
    pub fn compute_charge<M: Messenger>(&mut self, ctx: &SimContext<M>) -> Result<(), SimError> {
        let params = ctx.params;
        self.patches.par_iter_mut().for_each(|p| p.compute_charge(params));
        self.sum_densities(ctx)
    }

    pub fn dynamics<M: Messenger>(&mut self, ctx: &SimContext<M>) {
        let params = ctx.params;
        self.patches.par_iter_mut().for_each(|p| p.dynamics(params));
    }

    /// Adds the antenna currents at time `t`.
    pub fn apply_antennas<M: Messenger>(&mut self, ctx: &SimContext<M>, t: f64) -> Result<(), InputError> {
        let amplitudes = ctx.params.antennas.iter()
            .map(|antenna| antenna.time.at_time(t).map(|a| (antenna.component, a)))
            .collect::<Result<Vec<_>, _>>()?;

        self.patches.par_iter_mut().for_each(|p| {
            for (n, (component, amplitude)) in amplitudes.iter().enumerate() {
                p.apply_antenna(n, *component, *amplitude);
            }
        });

        Ok(())
    }

    /// Adds the currents and charge deposited in ghost cells onto the
    /// neighbouring patches, then copies the totals back out to the ghosts.
    pub fn sum_densities<M: Messenger>(&mut self, ctx: &SimContext<M>) -> Result<(), SimError> {
        let ndim = ctx.params.decomposition.ndim();
        let mut status = Ok(());
        for axis in 0..ndim {
            let r = self.exchange_faces(ctx, &Component::SOURCES, axis, Layer::Ghost, Layer::Border, Combine::Add);
            keep_first(&mut status, r);
        }
        for axis in 0..ndim {
            let r = self.exchange_faces(ctx, &Component::SOURCES, axis, Layer::Border, Layer::Ghost, Combine::Assign);
            keep_first(&mut status, r);
        }
        ctx.agree(status.map_err(SimError::from))
    }

    /// Refreshes the electromagnetic field in every ghost cell, from the
    /// neighbouring patch or from the boundary condition.
    pub fn finalize_sync_and_bc_fields<M: Messenger>(&mut self, ctx: &SimContext<M>) -> Result<(), SimError> {
        let ndim = ctx.params.decomposition.ndim();
        let mut status = Ok(());
        for axis in 0..ndim {
            let r = self.exchange_faces(ctx, &Component::EM, axis, Layer::Border, Layer::Ghost, Combine::Assign);
            keep_first(&mut status, r);

            let boundaries = ctx.params.field_boundaries[axis];
            self.patches.par_iter_mut().for_each(|p| {
                for side in Side::BOTH.iter() {
                    if p.is_exterior(axis, *side) {
                        p.fields.apply_boundary(axis, *side, boundaries[side.id()]);
                    }
                }
            });
        }
        ctx.agree(status.map_err(SimError::from))
    }

    /// Sends the `from` layer at every face along `axis` to the patch
    /// across it, where it is combined into the `to` layer of the
    /// opposite face.
    fn exchange_faces<M: Messenger>(
        &mut self, ctx: &SimContext<M>, components: &[Component],
        axis: usize, from: Layer, to: Layer, combine: Combine
    ) -> Result<(), FatalError> {
        let (me, size) = (ctx.comm.rank(), ctx.comm.size());

        let packets: Vec<FacePacket> = self.patches
            .par_iter()
            .map(|p| {
                Side::BOTH.iter()
                    .filter_map(|&side| {
                        p.neighbor(axis, side).map(|target| FacePacket {
                            target,
                            side: side.opposite(),
                            data: p.fields.pack(components, &p.fields.face_ranges(axis, side, from)),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .flatten()
            .collect();

        let mut local: Vec<FacePacket> = Vec::new();
        let mut headers: Vec<Vec<u64>> = vec![Vec::new(); size];
        let mut data: Vec<Vec<f64>> = vec![Vec::new(); size];
        for packet in packets {
            let owner = self.map.owner(packet.target);
            if owner == me {
                local.push(packet);
            } else {
                headers[owner].extend_from_slice(&[packet.target as u64, packet.side.id() as u64, packet.data.len() as u64]);
                data[owner].extend(packet.data);
            }
        }

        let received = exchange_packets(ctx.comm, tags::FACE_HEADERS, tags::FACE_DATA, headers, data);

        let mut status = Ok(());
        for packet in local.into_iter().chain(received) {
            let r = match self.position(packet.target) {
                Some(i) => {
                    let fields = &mut self.patches[i].fields;
                    let ranges = fields.face_ranges(axis, packet.side, to);
                    fields.unpack(components, &ranges, &packet.data, combine)
                        .map_err(|reason| FatalError::SyncMismatch {rank: me, index: packet.target, reason})
                },
                None => Err(FatalError::SyncMismatch {
                    rank: me,
                    index: packet.target,
                    reason: "face data arrived for a patch owned elsewhere".to_owned(),
                }),
            };
            keep_first(&mut status, r);
        }
        status
    }

    /// Moves every particle that left its patch during `dynamics` to
    /// the patch that now contains it, wherever that is.
    pub fn finalize_and_sort_particles<M: Messenger>(&mut self, ctx: &SimContext<M>) -> Result<(), SimError> {
        let (me, size) = (ctx.comm.rank(), ctx.comm.size());
        let d = &ctx.params.decomposition;
        let n_moved = self.n_moved;

        let leaving: Vec<(Option<usize>, usize, Particle)> = self.patches
            .par_iter_mut()
            .map(|p| {
                let mut v = Vec::new();
                for (s, pop) in p.species.iter_mut().enumerate() {
                    for mut pt in pop.take_exits() {
                        d.wrap(&mut pt.position, n_moved);
                        let g = d.geometry.grid_position(&pt.position);
                        v.push((d.locate(&g, n_moved), s, pt));
                    }
                }
                v
            })
            .flatten()
            .collect();

        let mut lost = 0;
        let mut outgoing: Vec<Vec<Transit>> = vec![Vec::new(); size];
        for (target, species, particle) in leaving {
            match target {
                Some(index) => outgoing[self.map.owner(index)].push(Transit {
                    patch: index as u64,
                    species: species as u64,
                    particle,
                }),
                None => lost += 1,
            }
        }

        let incoming = ctx.comm.exchange(tags::PARTICLES, outgoing);

        let mut status = Ok(());
        for t in incoming.into_iter().flatten() {
            let index = t.patch as usize;
            match self.get_mut(index) {
                Some(p) if (t.species as usize) < p.species.len() => p.accept(t.species as usize, t.particle),
                _ => keep_first(&mut status, Err(FatalError::StrayParticle {rank: me, index})),
            }
        }

        if lost > 0 {
            keep_first(&mut status, Err(FatalError::LostParticles {rank: me, count: lost}));
        }

        ctx.agree(status.map_err(SimError::from))
    }

    /// Moves patches between ranks so that ownership matches `map`.
    ///
    /// Patch state travels as bincode-encoded [`PatchState`]s. Every rank
    /// must call this, between timesteps, with the same map.
    pub fn redistribute<M: Messenger>(&mut self, ctx: &SimContext<M>, map: OwnershipMap) -> Result<(), SimError> {
        let (me, size) = (ctx.comm.rank(), ctx.comm.size());
        ctx.comm.barrier();

        let (stay, leave): (Vec<Patch>, Vec<Patch>) = self.take_patches()
            .into_iter()
            .partition(|p| map.owner(p.index()) == me);

        let mut status: Result<(), SimError> = Ok(());
        let mut headers: Vec<Vec<u64>> = vec![Vec::new(); size];
        let mut data: Vec<Vec<u8>> = vec![Vec::new(); size];
        for patch in leave {
            let dest = map.owner(patch.index());
            let index = patch.index();
            match bincode::serialize(&patch.into_state()) {
                Ok(bytes) => {
                    headers[dest].extend_from_slice(&[index as u64, bytes.len() as u64]);
                    data[dest].extend(bytes);
                },
                Err(e) => keep_first(&mut status, Err(FatalError::from(e).into())),
            }
        }
        let nsent = headers.iter().map(|h| h.len() / 2).sum::<usize>();

        let headers = ctx.comm.exchange(tags::MIGRATION_HEADERS, headers);
        let data = ctx.comm.exchange(tags::MIGRATION_DATA, data);

        let mut patches = stay;
        let mut nreceived = 0;
        for (h, bytes) in headers.iter().zip(data.iter()) {
            let mut offset = 0;
            for chunk in h.chunks(2) {
                let (index, len) = (chunk[0] as usize, chunk[1] as usize);
                let slice = match bytes.get(offset..(offset + len)) {
                    Some(s) => s,
                    None => {
                        keep_first(&mut status, Err(FatalError::SyncMismatch {
                            rank: me,
                            index,
                            reason: "migration data is shorter than advertised".to_owned(),
                        }.into()));
                        break;
                    },
                };
                offset += len;

                let patch = bincode::deserialize::<PatchState>(slice)
                    .map_err(|e| SimError::from(FatalError::from(e)))
                    .and_then(|state| Patch::from_state(state, ctx.params, self.n_moved));
                match patch {
                    Ok(p) => {
                        patches.push(p);
                        nreceived += 1;
                    },
                    Err(e) => keep_first(&mut status, Err(e)),
                }
            }
        }

        patches.sort_by_key(|p| p.index());
        let found: Vec<usize> = patches.iter().map(|p| p.index()).collect();
        let expected: Vec<usize> = map.range(me).collect();
        if found != expected {
            keep_first(&mut status, Err(FatalError::MigrationMismatch {rank: me, expected, found}.into()));
        }

        tracing::debug!("rank {} sent {} patches and received {}", me, nsent, nreceived);
        self.patches = patches;
        self.map = map;

        ctx.agree(status)?;
        ctx.comm.barrier();
        verify_partition(ctx.comm, &self.map, &self.indices())?;
        Ok(())
    }

    /// Total electromagnetic energy of the owned patches.
    pub fn field_energy(&self, params: &Parameters) -> f64 {
        self.patches.iter().map(|p| p.field_energy(&params.decomposition)).sum()
    }
}

/// Delivers face packets to the ranks that own their targets, and
/// returns the ones sent here.
fn exchange_packets<M: Messenger>(
    comm: &M, header_tag: Tag, data_tag: Tag, headers: Vec<Vec<u64>>, data: Vec<Vec<f64>>
) -> Vec<FacePacket> {
    let headers = comm.exchange(header_tag, headers);
    let data = comm.exchange(data_tag, data);

    let mut packets = Vec::new();
    for (h, values) in headers.iter().zip(data) {
        let mut offset = 0;
        for chunk in h.chunks(FACE_HEADER) {
            let len = chunk[2] as usize;
            let end = (offset + len).min(values.len());
            packets.push(FacePacket {
                target: chunk[0] as usize,
                side: Side::from_id(chunk[1] as usize),
                data: values[offset..end].to_vec(),
            });
            offset = end;
        }
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadWorld;
    use crate::params::tests::*;
    use crate::constants::*;

    #[test]
    fn migration_conserves_particles_and_energy() {
        let params = parameters(PLASMA_2D);
        ThreadWorld::run(3, |world| {
            let ctx = SimContext::new(&world, &params);
            let map = OwnershipMap::even(16, 3).unwrap();
            let mut collection = PatchCollection::new(&ctx, map, 0, true).unwrap();
            for p in collection.patches_mut() {
                let value = p.index() as f64;
                p.fields.component_mut(Component::Ey).fill(value);
            }

            let before = world.all_sum(&[collection.particle_count() as f64, collection.field_energy(&params)]);
            let map = OwnershipMap::from_counts(vec![2, 10, 4]).unwrap();
            collection.redistribute(&ctx, map.clone()).unwrap();
            let after = world.all_sum(&[collection.particle_count() as f64, collection.field_energy(&params)]);

            println!("rank {}: {:?} -> {:?}", world.rank(), before, after);
            assert_eq!(collection.indices(), map.range(world.rank()).collect::<Vec<_>>());
            assert_eq!(before[0], after[0]);
            assert!(((before[1] - after[1]) / before[1]).abs() < 1.0e-12);
            for p in collection.patches() {
                assert_eq!(p.fields.component(Component::Ey)[[3, 3, 0]], p.index() as f64);
            }
        });
    }

    #[test]
    fn particles_find_their_new_patch() {
        let params = parameters(PLASMA_2D);
        ThreadWorld::run(2, |world| {
            let ctx = SimContext::new(&world, &params);
            let map = OwnershipMap::even(16, 2).unwrap();
            let mut collection = PatchCollection::new(&ctx, map, 0, true).unwrap();
            let count = |c: &PatchCollection| -> f64 {
                let removed: u64 = c.patches().iter()
                    .flat_map(|p| p.species.iter().map(|pop| pop.flux().count))
                    .sum();
                world.all_sum(&[c.particle_count() as f64 + removed as f64])[0]
            };
            let initial = count(&collection);

            for _ in 0..20 {
                collection.dynamics(&ctx);
                collection.finalize_and_sort_particles(&ctx).unwrap();
            }

            assert_eq!(count(&collection), initial);
            for p in collection.patches() {
                for pop in p.species.iter() {
                    assert!(pop.all().iter().all(|pt| p.owns_position(&pt.position, 2)));
                }
            }
        });
    }

    #[test]
    fn deposits_near_corners_are_summed() {
        let params = parameters(PLASMA_2D);
        let d = &params.decomposition;
        let target = d.index_of([1, 1, 0]);
        ThreadWorld::run(4, |world| {
            let ctx = SimContext::new(&world, &params);
            let map = OwnershipMap::even(16, 4).unwrap();
            let mut collection = PatchCollection::new(&ctx, map, 0, false).unwrap();
            if let Some(p) = collection.get_mut(target) {
                let (_, max) = p.bounds();
                let pt = Particle {position: [max[0] - 0.03e-6, max[1] - 0.03e-6, 0.0], momentum: [0.0; 3], weight: 1.0};
                p.accept(0, pt);
            }
            collection.compute_charge(&ctx).unwrap();

            let interior: f64 = collection.patches().iter()
                .map(|p| {
                    let r = p.fields.interior_ranges();
                    p.fields.component(Component::Rho)
                        .slice(ndarray::s![r[0].clone(), r[1].clone(), r[2].clone()])
                        .sum()
                })
                .sum();
            let total = world.all_sum(&[interior])[0];
            let expected = -ELEMENTARY_CHARGE / (0.1e-6 * 0.1e-6);
            println!("total charge density {:.6e}, expected {:.6e}", total, expected);
            assert!(((total - expected) / expected).abs() < 1.0e-12);
        });
    }

    #[test]
    fn ghosts_mirror_neighbours() {
        let params = parameters(PLASMA_2D);
        let d = &params.decomposition;
        ThreadWorld::run(2, |world| {
            let ctx = SimContext::new(&world, &params);
            let map = OwnershipMap::even(16, 2).unwrap();
            let mut collection = PatchCollection::new(&ctx, map, 0, false).unwrap();
            for p in collection.patches_mut() {
                let value = 1.0 + p.index() as f64;
                p.fields.component_mut(Component::Bz).fill(value);
            }
            collection.finalize_sync_and_bc_fields(&ctx).unwrap();

            for p in collection.patches() {
                let c = p.coords();
                let bz = p.fields.component(Component::Bz);
                // y is periodic, so there is always a neighbour below
                let below = d.neighbor(c, 1, Side::Min).unwrap();
                assert_eq!(bz[[4, 0, 0]], 1.0 + below as f64);
                match d.neighbor(c, 0, Side::Max) {
                    Some(n) => assert_eq!(bz[[11, 4, 0]], 1.0 + n as f64),
                    // absorbing copies the last interior node
                    None => assert_eq!(bz[[11, 4, 0]], 1.0 + p.index() as f64),
                }
            }
        });
    }
}
