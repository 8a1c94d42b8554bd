//! A patch: one cell of the patch lattice, with its own fields and particles

use ndarray::prelude::*;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256StarStar;
use serde::{Deserialize, Serialize};

use crate::decomposition::{Decomposition, Geometry, Side};
use crate::error::{FatalError, SimError};
use crate::grid::{Component, FieldSet};
use crate::params::Parameters;
use crate::particle::*;
use crate::setup::InputError;

/// Everything needed to rebuild a patch elsewhere: on another rank,
/// or from a checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchState {
    pub index: usize,
    pub fields: Vec<Vec<f64>>,
    pub species: Vec<Population>,
    pub rng: Xoshiro256StarStar,
}

#[derive(Clone, Debug)]
pub struct Patch {
    index: usize,
    coords: [usize; 3],
    min: [f64; 3],
    max: [f64; 3],
    pub fields: FieldSet,
    pub species: Vec<Population>,
    neighbors: [[Option<usize>; 2]; 3],
    exterior: [[bool; 2]; 3],
    /// Spatial profile of each antenna, sampled at the nodes of this patch.
    antennas: Vec<Array3<f64>>,
    rng: Xoshiro256StarStar,
}

impl Patch {
    /// Creates the patch with curve index `index`, loading particles
    /// if `load` is set.
    ///
    /// Every patch draws from its own stream of random numbers, so the
    /// result does not depend on which rank or thread builds it.
    pub fn new(index: usize, params: &Parameters, n_moved: usize, load: bool) -> Result<Patch, InputError> {
        let d = &params.decomposition;
        let ndim = d.ndim();

        let mut rng = Xoshiro256StarStar::seed_from_u64(params.seed.wrapping_add(n_moved as u64));
        for _ in 0..index {
            rng.jump(); // avoid overlapping sequences of randoms
        }

        let coords = d.coords_of(index);
        let (min, max) = d.bounds(coords, n_moved);
        let ghost = [d.ghost(0), d.ghost(1), d.ghost(2)];
        let fields = FieldSet::new(d.cells, ghost);

        let species = if load {
            params.species.iter()
                .map(|sp| Population::load(sp, d, &min, &mut rng))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            params.species.iter().map(|_| Population::new_empty()).collect()
        };

        let antennas = params.antennas.iter()
            .map(|antenna| {
                antenna.space.with_space(|f| {
                    Array3::from_shape_fn(fields.shape(), |(i, j, k)| {
                        let idx = [i, j, k];
                        let mut r = [0.0; 3];
                        for a in 0..ndim {
                            r[a] = min[a] + (idx[a] as f64 - ghost[a] as f64) * d.cell_length[a];
                        }
                        f(r[0], r[1], r[2])
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut patch = Patch {
            index,
            coords,
            min,
            max,
            fields,
            species,
            neighbors: [[None; 2]; 3],
            exterior: [[false; 2]; 3],
            antennas,
            rng,
        };
        patch.connect(d);
        Ok(patch)
    }

    fn connect(&mut self, d: &Decomposition) {
        for axis in 0..3 {
            for side in Side::BOTH.iter() {
                self.neighbors[axis][side.id()] = d.neighbor(self.coords, axis, *side);
                self.exterior[axis][side.id()] = d.is_exterior(self.coords, axis, *side);
            }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn coords(&self) -> [usize; 3] {
        self.coords
    }

    pub fn bounds(&self) -> ([f64; 3], [f64; 3]) {
        (self.min, self.max)
    }

    pub fn neighbor(&self, axis: usize, side: Side) -> Option<usize> {
        self.neighbors[axis][side.id()]
    }

    pub fn is_exterior(&self, axis: usize, side: Side) -> bool {
        self.exterior[axis][side.id()]
    }

    /// Gives the patch a new curve index after the lattice has moved
    /// underneath it. Its contents, and its place in space, are unchanged.
    pub fn relocate(&mut self, index: usize, d: &Decomposition, n_moved: usize) {
        self.index = index;
        self.coords = d.coords_of(index);
        let (min, max) = d.bounds(self.coords, n_moved);
        self.min = min;
        self.max = max;
        self.connect(d);
    }

    pub fn particle_count(&self) -> usize {
        self.species.iter().map(|pop| pop.size()).sum()
    }

    /// Relative computational cost of the patch.
    pub fn cost(&self, cell_load: f64) -> f64 {
        let cells: usize = self.fields.interior().iter().product();
        self.particle_count() as f64 + cell_load * cells as f64
    }

    fn cell_volume(d: &Decomposition, g: &[f64; 3]) -> f64 {
        let dx = d.cell_length;
        match d.geometry {
            Geometry::Axisymmetric => 2.0 * std::f64::consts::PI * g[1].max(0.5 * dx[1]) * dx[0] * dx[1],
            _ => (0..d.ndim()).map(|a| dx[a]).product(),
        }
    }

    /// Advances every particle by one timestep, applying boundary
    /// conditions at the exterior faces of the patch, and deposits
    /// the current they carry. Particles that end up outside the patch
    /// are left in the exit buffer of their population.
    pub fn dynamics(&mut self, params: &Parameters) {
        let d = &params.decomposition;
        let ndim = d.ndim();
        let geometry = d.geometry;
        let (min, max, exterior) = (self.min, self.max, self.exterior);
        let ghost = self.fields.ghost();
        let fields = &mut self.fields;
        let rng = &mut self.rng;
        fields.clear_sources();

        for (sp, pop) in params.species.iter().zip(self.species.iter_mut()) {
            let particles = pop.take_all();
            let mut kept: Vec<Particle> = Vec::with_capacity(particles.len());

            'particles: for mut pt in particles {
                let g = geometry.grid_position(&pt.position);
                let (e, b) = fields.fields_at(&array_position(&g, &min, &ghost, d));
                pt.push(&e, &b, &sp.carrier, params.dt);

                for axis in 0..ndim {
                    for side in Side::BOTH.iter() {
                        if !exterior[axis][side.id()] {
                            continue;
                        }
                        let g = geometry.grid_position(&pt.position);
                        let (crossed, bound) = match side {
                            Side::Min => (g[axis] < min[axis], min[axis]),
                            Side::Max => (g[axis] > max[axis], max[axis]),
                        };
                        if !crossed {
                            continue;
                        }
                        let outcome = apply_policy(
                            sp.boundaries.policy(axis, *side), &mut pt, axis, *side, bound,
                            &sp.carrier, sp.boundaries.thermal_momentum(), rng, pop.flux_mut(),
                        );
                        if outcome == Outcome::Removed {
                            continue 'particles;
                        }
                    }
                }

                let g = geometry.grid_position(&pt.position);
                let q = sp.carrier.charge * pt.weight / Patch::cell_volume(d, &g);
                if q != 0.0 {
                    let v = pt.velocity(&sp.carrier);
                    fields.deposit(&array_position(&g, &min, &ghost, d), [q * v[0], q * v[1], q * v[2]], q);
                }

                if contains(&g, &min, &max, &exterior, ndim) {
                    kept.push(pt);
                } else {
                    pop.exit(pt);
                }
            }

            pop.replace(kept);
        }
    }

    /// Deposits the charge density of every species, leaving the
    /// current density zero.
    pub fn compute_charge(&mut self, params: &Parameters) {
        let d = &params.decomposition;
        self.fields.clear_sources();
        for (sp, pop) in params.species.iter().zip(self.species.iter()) {
            for pt in pop.all() {
                let g = d.geometry.grid_position(&pt.position);
                let q = sp.carrier.charge * pt.weight / Patch::cell_volume(d, &g);
                let s = array_position(&g, &self.min, &self.fields.ghost(), d);
                self.fields.deposit(&s, [0.0; 3], q);
            }
        }
    }

    /// Adds `amplitude` times the `n`th antenna's profile to `component`.
    pub fn apply_antenna(&mut self, n: usize, component: Component, amplitude: f64) {
        if let Some(profile) = self.antennas.get(n) {
            self.fields.component_mut(component).scaled_add(amplitude, profile);
        }
    }

    /// Receives particles arriving from elsewhere, which must lie
    /// within the patch.
    pub fn accept(&mut self, species: usize, pt: Particle) {
        self.species[species].push(pt);
    }

    /// Whether a grid-space position belongs to this patch.
    pub fn owns_position(&self, g: &[f64; 3], ndim: usize) -> bool {
        contains(g, &self.min, &self.max, &self.exterior, ndim)
    }

    /// Total electromagnetic energy (J) of the interior nodes.
    pub fn field_energy(&self, d: &Decomposition) -> f64 {
        let ghost = self.fields.ghost();
        let ranges = self.fields.interior_ranges();
        let mut total = 0.0;
        for i in ranges[0].clone() {
            for j in ranges[1].clone() {
                for k in ranges[2].clone() {
                    let r = self.min[1] + (j as f64 - ghost[1] as f64 + 0.5) * d.cell_length[1];
                    let volume = Patch::cell_volume(d, &[0.0, r, 0.0]);
                    total += volume * self.fields.energy_density([i, j, k]);
                }
            }
        }
        total
    }

    pub fn to_state(&self) -> PatchState {
        PatchState {
            index: self.index,
            fields: self.fields.to_state(),
            species: self.species.clone(),
            rng: self.rng.clone(),
        }
    }

    pub fn into_state(self) -> PatchState {
        PatchState {
            index: self.index,
            fields: self.fields.to_state(),
            species: self.species,
            rng: self.rng,
        }
    }

    /// Overwrites the patch contents with a saved state, which
    /// must have been taken from a patch with the same index and shape.
    pub fn restore(&mut self, state: PatchState) -> Result<(), FatalError> {
        if state.index != self.index {
            return Err(FatalError::RestartMismatch(format!(
                "state of patch {} cannot be loaded into patch {}", state.index, self.index
            )));
        }
        if state.species.len() != self.species.len() {
            return Err(FatalError::RestartMismatch(format!(
                "patch {} has {} species, state has {}", self.index, self.species.len(), state.species.len()
            )));
        }
        self.fields.restore(state.fields)
            .map_err(|e| FatalError::RestartMismatch(format!("patch {}: {}", self.index, e)))?;
        self.species = state.species;
        self.rng = state.rng;
        Ok(())
    }

    /// Rebuilds a patch from its saved state.
    pub fn from_state(state: PatchState, params: &Parameters, n_moved: usize) -> Result<Patch, SimError> {
        let mut patch = Patch::new(state.index, params, n_moved, false)?;
        patch.restore(state)?;
        Ok(patch)
    }

    /// Empties the patch, recording every particle it still holds as lost,
    /// and returns the per-species boundary fluxes.
    pub fn retire(mut self, params: &Parameters) -> Vec<BoundaryFlux> {
        params.species.iter()
            .zip(self.species.iter_mut())
            .map(|(sp, pop)| {
                let mut flux = *pop.flux();
                for pt in pop.take_all() {
                    sp.carrier.record_loss(&pt, &mut flux);
                }
                flux
            })
            .collect()
    }
}

/// Position in array-index units, for interpolation and deposition.
fn array_position(g: &[f64; 3], min: &[f64; 3], ghost: &[usize; 3], d: &Decomposition) -> [f64; 3] {
    let mut s = [0.0; 3];
    for a in 0..d.ndim() {
        s[a] = (g[a] - min[a]) / d.cell_length[a] + ghost[a] as f64;
    }
    s
}

// Half-open along each axis, except on the upper face of the domain.
fn contains(g: &[f64; 3], min: &[f64; 3], max: &[f64; 3], exterior: &[[bool; 2]; 3], ndim: usize) -> bool {
    (0..ndim).all(|a| g[a] >= min[a] && (g[a] < max[a] || (g[a] == max[a] && exterior[a][1])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::*;
    use crate::params::tests::*;

    #[test]
    fn patches_tile_the_domain() {
        let params = parameters(PLASMA_2D);
        let d = &params.decomposition;
        let mut count = 0;
        let mut weight = 0.0;
        for index in 0..d.total_patches() {
            let patch = Patch::new(index, &params, 0, true).unwrap();
            let (min, max) = patch.bounds();
            assert_eq!(patch.coords(), d.coords_of(index));
            for pt in patch.species[0].all() {
                assert!(patch.owns_position(&pt.position, 2));
                assert!(pt.position[0] >= min[0] && pt.position[1] < max[1]);
            }
            count += patch.species[0].size();
            weight += patch.species[0].weight();
        }
        // plasma from 0.4 to 2.8 micron, the full height of 3.2 micron
        let target = 1.0e25 * 2.4e-6 * 3.2e-6;
        println!("loaded {} electrons, weight {:.3e} (expected {:.3e})", count, weight, target);
        assert_eq!(count, 24 * 32 * 2);
        assert!(((weight - target) / target).abs() < 1.0e-9);
    }

    #[test]
    fn patch_streams_are_reproducible() {
        let params = parameters(PLASMA_2D);
        let a = Patch::new(5, &params, 0, true).unwrap();
        let b = Patch::new(5, &params, 0, true).unwrap();
        assert_eq!(a.species[0].all(), b.species[0].all());
        let c = Patch::new(6, &params, 0, true).unwrap();
        assert!(c.species[0].size() == 0 || a.species[0].all()[0].momentum != c.species[0].all()[0].momentum);
    }

    #[test]
    fn exterior_faces_apply_boundaries() {
        let params = parameters(PLASMA_2D);
        let d = &params.decomposition;
        let index = d.index_of([0, 1, 0]);
        let mut patch = Patch::new(index, &params, 0, false).unwrap();
        assert!(patch.is_exterior(0, Side::Min));
        assert!(!patch.is_exterior(1, Side::Min));

        // electrons reflect at x = 0, ions are removed
        let (min, _) = patch.bounds();
        let speeding = Particle {position: [1.0e-9, min[1] + 1.0e-7, 0.0], momentum: [-10.0, 0.0, 0.0], weight: 2.0};
        patch.accept(0, speeding);
        patch.accept(1, speeding);
        patch.dynamics(&params);

        assert_eq!(patch.species[0].size(), 1);
        assert!(patch.species[0].all()[0].momentum[0] > 0.0);
        assert_eq!(patch.species[1].size(), 0);
        assert_eq!(patch.species[1].pending_exits(), 0);
        assert_eq!(patch.species[1].flux().count, 1);
        assert_eq!(patch.species[1].flux().weight, 2.0);

        let rho: f64 = patch.fields.component(Component::Rho).sum();
        let target = -ELEMENTARY_CHARGE * 2.0 / (0.1e-6 * 0.1e-6);
        assert!(((rho - target) / target).abs() < 1.0e-9);
    }

    #[test]
    fn leavers_wait_in_exit_buffer() {
        let params = parameters(PLASMA_2D);
        let d = &params.decomposition;
        let mut patch = Patch::new(d.index_of([1, 1, 0]), &params, 0, false).unwrap();
        let (min, max) = patch.bounds();
        let pt = Particle {position: [max[0] - 1.0e-12, 0.5 * (min[1] + max[1]), 0.0], momentum: [1.0, 0.0, 0.0], weight: 1.0};
        patch.accept(0, pt);
        patch.dynamics(&params);
        assert_eq!(patch.species[0].size(), 0);
        assert_eq!(patch.species[0].take_exits().len(), 1);
    }

    #[test]
    fn state_round_trip() {
        let params = parameters(PLASMA_2D);
        let mut patch = Patch::new(3, &params, 0, true).unwrap();
        patch.fields.component_mut(Component::Ez).fill(2.5);
        let state = patch.to_state();
        let copy = Patch::from_state(state.clone(), &params, 0).unwrap();
        assert_eq!(copy.species[1].all(), patch.species[1].all());
        assert_eq!(copy.fields.component(Component::Ez), patch.fields.component(Component::Ez));

        let mut other = Patch::new(4, &params, 0, false).unwrap();
        assert!(other.restore(state).is_err());
    }

    #[test]
    fn retired_particles_are_counted_as_lost() {
        let params = parameters(PLASMA_2D);
        let d = &params.decomposition;
        let patch = Patch::new(d.index_of([0, 0, 0]), &params, 0, true).unwrap();
        let n = patch.species[0].size();
        let w = patch.species[0].weight();
        let flux = patch.retire(&params);
        assert_eq!(flux[0].count as usize, n);
        assert!(((flux[0].weight - w) / w).abs() < 1.0e-12);
    }
}
