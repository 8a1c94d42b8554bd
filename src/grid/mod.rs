//! Representation of the electromagnetic field on a patch, or on
//! a rank's block of the unified grid

use std::ops::Range;
use ndarray::prelude::*;

use crate::constants::*;
use crate::decomposition::Side;
use crate::error::ConfigError;

mod yee;
pub use self::yee::*;

/// Boundary conditions for the electromagnetic field on the faces of
/// the global simulation domain.
///
/// - `Periodic`: fields wrap around the domain.
/// - `Absorbing`: ghost cells copy the outermost interior cell, so that
/// outgoing waves leave with little reflection.
/// - `Conducting`: the boundary is a perfect electric conductor; ghost
/// cells are mirror images with tangential E and normal B reversed.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FieldBoundary {
    Periodic,
    Absorbing,
    Conducting,
}

impl FieldBoundary {
    pub fn parse(s: &str) -> Result<FieldBoundary, ConfigError> {
        match s {
            "periodic" => Ok(FieldBoundary::Periodic),
            "absorbing" | "silver-muller" => Ok(FieldBoundary::Absorbing),
            "conducting" | "reflective" => Ok(FieldBoundary::Conducting),
            _ => Err(ConfigError::UnknownFieldBoundary(s.to_owned())),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Component {
    Ex, Ey, Ez,
    Bx, By, Bz,
    Jx, Jy, Jz,
    Rho,
}

impl Component {
    pub const ALL: [Component; 10] = [
        Component::Ex, Component::Ey, Component::Ez,
        Component::Bx, Component::By, Component::Bz,
        Component::Jx, Component::Jy, Component::Jz,
        Component::Rho,
    ];

    pub const EM: [Component; 6] = [
        Component::Ex, Component::Ey, Component::Ez,
        Component::Bx, Component::By, Component::Bz,
    ];

    /// What the field solver reads and writes.
    pub const SOLVER: [Component; 9] = [
        Component::Ex, Component::Ey, Component::Ez,
        Component::Bx, Component::By, Component::Bz,
        Component::Jx, Component::Jy, Component::Jz,
    ];

    pub const SOURCES: [Component; 4] = [
        Component::Jx, Component::Jy, Component::Jz, Component::Rho,
    ];

    pub fn parse(s: &str) -> Result<Component, ConfigError> {
        Component::ALL.iter()
            .find(|c| format!("{:?}", c) == s)
            .copied()
            .ok_or_else(|| ConfigError::UnknownComponent(s.to_owned()))
    }
}

/// Which cells adjacent to a face: the ghost cells outside it,
/// or the same number of interior cells just inside it.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Layer {
    Ghost,
    Border,
}

/// How incoming values are combined with those already stored.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Combine {
    Assign,
    Add,
}

/// Fields, currents and charge density, all stored at the nodes of
/// a grid with `ghost` extra cells on both sides of every axis.
/// Array index `ghost[a]` along axis `a` is the first interior node.
#[derive(Clone, Debug)]
pub struct FieldSet {
    e: [Array3<f64>; 3],
    b: [Array3<f64>; 3],
    j: [Array3<f64>; 3],
    rho: Array3<f64>,
    interior: [usize; 3],
    ghost: [usize; 3],
}

impl FieldSet {
    pub fn new(interior: [usize; 3], ghost: [usize; 3]) -> FieldSet {
        let shape = [
            interior[0] + 2 * ghost[0],
            interior[1] + 2 * ghost[1],
            interior[2] + 2 * ghost[2],
        ];
        let zeros = || Array3::<f64>::zeros(shape);
        FieldSet {
            e: [zeros(), zeros(), zeros()],
            b: [zeros(), zeros(), zeros()],
            j: [zeros(), zeros(), zeros()],
            rho: zeros(),
            interior,
            ghost,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        let s = self.rho.shape();
        [s[0], s[1], s[2]]
    }

    pub fn interior(&self) -> [usize; 3] {
        self.interior
    }

    pub fn ghost(&self) -> [usize; 3] {
        self.ghost
    }

    pub fn component(&self, c: Component) -> &Array3<f64> {
        use Component::*;
        match c {
            Ex => &self.e[0], Ey => &self.e[1], Ez => &self.e[2],
            Bx => &self.b[0], By => &self.b[1], Bz => &self.b[2],
            Jx => &self.j[0], Jy => &self.j[1], Jz => &self.j[2],
            Rho => &self.rho,
        }
    }

    pub fn component_mut(&mut self, c: Component) -> &mut Array3<f64> {
        use Component::*;
        match c {
            Ex => &mut self.e[0], Ey => &mut self.e[1], Ez => &mut self.e[2],
            Bx => &mut self.b[0], By => &mut self.b[1], Bz => &mut self.b[2],
            Jx => &mut self.j[0], Jy => &mut self.j[1], Jz => &mut self.j[2],
            Rho => &mut self.rho,
        }
    }

    /// Zeroes out the charges and currents, in preparation for a new
    /// deposition phase.
    pub fn clear_sources(&mut self) {
        for c in Component::SOURCES.iter() {
            self.component_mut(*c).fill(0.0);
        }
    }

    pub fn interior_range(&self, axis: usize) -> Range<usize> {
        self.ghost[axis]..(self.ghost[axis] + self.interior[axis])
    }

    pub fn interior_ranges(&self) -> [Range<usize>; 3] {
        [self.interior_range(0), self.interior_range(1), self.interior_range(2)]
    }

    pub fn full_ranges(&self) -> [Range<usize>; 3] {
        let shape = self.shape();
        [0..shape[0], 0..shape[1], 0..shape[2]]
    }

    /// Index range along `axis` of the given layer at a face.
    pub fn face(&self, axis: usize, side: Side, layer: Layer) -> Range<usize> {
        let (g, n) = (self.ghost[axis], self.interior[axis]);
        match (side, layer) {
            (Side::Min, Layer::Ghost) => 0..g,
            (Side::Min, Layer::Border) => g..2*g,
            (Side::Max, Layer::Border) => n..(n + g),
            (Side::Max, Layer::Ghost) => (n + g)..(n + 2*g),
        }
    }

    /// The slab of the layer at a face, spanning the whole array
    /// along the other axes.
    pub fn face_ranges(&self, axis: usize, side: Side, layer: Layer) -> [Range<usize>; 3] {
        let mut ranges = self.full_ranges();
        ranges[axis] = self.face(axis, side, layer);
        ranges
    }

    /// Copies the named components within `ranges` into a flat buffer.
    pub fn pack(&self, components: &[Component], ranges: &[Range<usize>; 3]) -> Vec<f64> {
        let mut data = Vec::new();
        for c in components {
            let view = self.component(*c).slice(s![ranges[0].clone(), ranges[1].clone(), ranges[2].clone()]);
            data.extend(view.iter());
        }
        data
    }

    /// Inverse of [`FieldSet::pack`]. Fails, changing nothing, if the
    /// buffer is the wrong size for `ranges`.
    pub fn unpack(&mut self, components: &[Component], ranges: &[Range<usize>; 3], data: &[f64], combine: Combine) -> Result<(), String> {
        let per_component: usize = ranges.iter().map(|r| r.len()).product();
        if data.len() != per_component * components.len() {
            return Err(format!("expected {} values, got {}", per_component * components.len(), data.len()));
        }
        for (c, chunk) in components.iter().zip(data.chunks(per_component.max(1))) {
            let mut view = self.component_mut(*c).slice_mut(s![ranges[0].clone(), ranges[1].clone(), ranges[2].clone()]);
            match combine {
                Combine::Assign => view.iter_mut().zip(chunk).for_each(|(v, x)| *v = *x),
                Combine::Add => view.iter_mut().zip(chunk).for_each(|(v, x)| *v += *x),
            }
        }
        Ok(())
    }

    /// Loads a boundary condition into the ghost cells of an exterior face.
    pub fn apply_boundary(&mut self, axis: usize, side: Side, kind: FieldBoundary) {
        let g = self.ghost[axis];
        let n = self.interior[axis];
        if g == 0 || kind == FieldBoundary::Periodic {
            return;
        }

        for d in 1..=g {
            // ghost node and the interior node it takes its value from
            let (ghost, source) = match (side, kind) {
                (Side::Min, FieldBoundary::Absorbing) => (g - d, g),
                (Side::Max, FieldBoundary::Absorbing) => (g + n - 1 + d, g + n - 1),
                (Side::Min, _) => (g - d, g + d),
                (Side::Max, _) => (g + n - 1 + d, g + n - 1 - d),
            };
            for c in Component::EM.iter() {
                let sign = match kind {
                    FieldBoundary::Conducting => Self::mirror_sign(*c, axis),
                    _ => 1.0,
                };
                let array = self.component_mut(*c);
                let values = array.index_axis(Axis(axis), source).to_owned();
                array.index_axis_mut(Axis(axis), ghost).zip_mut_with(&values, |v, s| *v = sign * s);
            }
        }
    }

    // Image charges in a perfect conductor reverse tangential E and normal B.
    fn mirror_sign(c: Component, axis: usize) -> f64 {
        use Component::*;
        let (is_electric, dir) = match c {
            Ex => (true, 0), Ey => (true, 1), Ez => (true, 2),
            Bx => (false, 0), By => (false, 1), Bz => (false, 2),
            _ => return 1.0,
        };
        let normal = dir == axis;
        if is_electric != normal {-1.0} else {1.0}
    }

    /// Energy density (J/m^3) of the field at a node.
    pub fn energy_density(&self, idx: [usize; 3]) -> f64 {
        let e2: f64 = self.e.iter().map(|a| a[idx].powi(2)).sum();
        let b2: f64 = self.b.iter().map(|a| a[idx].powi(2)).sum();
        0.5 * VACUUM_PERMITTIVITY * e2 + 0.5 * b2 / VACUUM_PERMEABILITY
    }

    /*------------------------------------------------------------------------------------

    Particles are cloud-in-cell: a top-hat of one cell width. `s` is the particle
    position measured in array-index units, so the node at index i receives weight
    1 - |s - i| for the two nodes bracketing the particle along each active axis.
    Inactive axes (no ghost cells) always use node 0.

    ------------------------------------------------------------------------------------*/

    fn stencil(&self, s: &[f64; 3]) -> [(isize, [f64; 2]); 3] {
        let mut st = [(0isize, [1.0, 0.0]); 3];
        for axis in 0..3 {
            if self.ghost[axis] > 0 {
                let base = s[axis].floor();
                let frac = s[axis] - base;
                st[axis] = (base as isize, [1.0 - frac, frac]);
            }
        }
        st
    }

    fn for_each_node<F: FnMut([usize; 3], f64)>(&self, s: &[f64; 3], mut f: F) {
        let shape = self.shape();
        let st = self.stencil(s);
        for di in 0..2 {
            for dj in 0..2 {
                for dk in 0..2 {
                    let w = st[0].1[di] * st[1].1[dj] * st[2].1[dk];
                    if w == 0.0 {
                        continue;
                    }
                    let idx = [st[0].0 + di as isize, st[1].0 + dj as isize, st[2].0 + dk as isize];
                    if (0..3).all(|a| idx[a] >= 0 && (idx[a] as usize) < shape[a]) {
                        f([idx[0] as usize, idx[1] as usize, idx[2] as usize], w);
                    }
                }
            }
        }
    }

    /// Returns a tuple of (E, B), the electric and magnetic field
    /// vectors at array position `s`.
    #[allow(non_snake_case)]
    pub fn fields_at(&self, s: &[f64; 3]) -> ([f64; 3], [f64; 3]) {
        let mut E = [0.0; 3];
        let mut B = [0.0; 3];
        self.for_each_node(s, |idx, w| {
            for c in 0..3 {
                E[c] += w * self.e[c][idx];
                B[c] += w * self.b[c][idx];
            }
        });
        (E, B)
    }

    /// Adds current density `j` and charge density `rho`, already divided
    /// by the cell volume, at array position `s`.
    pub fn deposit(&mut self, s: &[f64; 3], j: [f64; 3], rho: f64) {
        let mut nodes: [([usize; 3], f64); 8] = [([0; 3], 0.0); 8];
        let mut count = 0;
        self.for_each_node(s, |idx, w| {
            nodes[count] = (idx, w);
            count += 1;
        });
        for &(idx, w) in &nodes[..count] {
            for c in 0..3 {
                self.j[c][idx] += w * j[c];
            }
            self.rho[idx] += w * rho;
        }
    }

    /// Flattened copies of every component, in [`Component::ALL`] order.
    pub fn to_state(&self) -> Vec<Vec<f64>> {
        Component::ALL.iter()
            .map(|c| self.component(*c).iter().copied().collect())
            .collect()
    }

    pub fn restore(&mut self, state: Vec<Vec<f64>>) -> Result<(), String> {
        let shape = self.shape();
        let len: usize = shape.iter().product();
        if state.len() != Component::ALL.len() || state.iter().any(|v| v.len() != len) {
            return Err(format!("expected {} components of {} values", Component::ALL.len(), len));
        }
        for (c, values) in Component::ALL.iter().zip(state) {
            let array = Array3::from_shape_vec(shape, values).map_err(|e| e.to_string())?;
            *self.component_mut(*c) = array;
        }
        Ok(())
    }
}
