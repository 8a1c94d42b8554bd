//! Division of the simulation domain into a lattice of patches

use std::fmt;

use crate::error::ConfigError;

mod hilbert;
pub use self::hilbert::*;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Geometry {
    Cartesian1D,
    Cartesian2D,
    Cartesian3D,
    /// Cylindrical coordinates (x, r), assuming symmetry in the azimuth.
    Axisymmetric,
}

impl Geometry {
    pub fn parse(s: &str) -> Result<Geometry, ConfigError> {
        match s {
            "1d" | "1D" | "1Dcartesian" => Ok(Geometry::Cartesian1D),
            "2d" | "2D" | "2Dcartesian" => Ok(Geometry::Cartesian2D),
            "3d" | "3D" | "3Dcartesian" => Ok(Geometry::Cartesian3D),
            "axisymmetric" | "AMcylindrical" => Ok(Geometry::Axisymmetric),
            _ => Err(ConfigError::Geometry(s.to_owned())),
        }
    }

    /// Number of axes along which the domain is divided.
    pub fn ndim(&self) -> usize {
        match self {
            Geometry::Cartesian1D => 1,
            Geometry::Cartesian2D | Geometry::Axisymmetric => 2,
            Geometry::Cartesian3D => 3,
        }
    }

    /// Maps a particle's Cartesian position onto the axes of the grid.
    /// In axisymmetric geometry the second grid axis is the radius.
    pub fn grid_position(&self, r: &[f64; 3]) -> [f64; 3] {
        match self {
            Geometry::Axisymmetric => [r[0], r[1].hypot(r[2]), 0.0],
            _ => *r,
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Geometry::Cartesian1D => "1D Cartesian",
            Geometry::Cartesian2D => "2D Cartesian",
            Geometry::Cartesian3D => "3D Cartesian",
            Geometry::Axisymmetric => "axisymmetric",
        };
        write!(f, "{}", name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Min,
    Max,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Min, Side::Max];

    pub fn opposite(self) -> Side {
        match self {
            Side::Min => Side::Max,
            Side::Max => Side::Min,
        }
    }

    pub fn id(self) -> usize {
        match self {
            Side::Min => 0,
            Side::Max => 1,
        }
    }

    pub fn from_id(id: usize) -> Side {
        if id == 0 {Side::Min} else {Side::Max}
    }
}

pub const AXIS_NAMES: [char; 3] = ['x', 'y', 'z'];

/// The global patch lattice: how many patches there are along each
/// axis, how many cells each contains, and the order in which the
/// patches are numbered.
///
/// Axes beyond `geometry.ndim()` are inactive: they have one patch of
/// one cell and no ghost cells.
#[derive(Clone, Debug)]
pub struct Decomposition {
    pub geometry: Geometry,
    pub patches: [usize; 3],
    pub cells: [usize; 3],
    pub cell_length: [f64; 3],
    pub oversize: usize,
    pub periodic: [bool; 3],
    curve: CurveOrder,
}

impl Decomposition {
    pub fn new(geometry: Geometry, patches: &[usize], cells: &[usize], cell_length: &[f64], oversize: usize, periodic: [bool; 3]) -> Result<Self, ConfigError> {
        let ndim = geometry.ndim();
        if patches.len() != ndim || cells.len() != ndim || cell_length.len() != ndim {
            return Err(ConfigError::Decomposition(format!(
                "{} geometry needs {} entries each for patches, cells and cell length", geometry, ndim
            )));
        }

        let mut p = [1; 3];
        let mut c = [1; 3];
        let mut dx = [1.0; 3];
        for axis in 0..ndim {
            if patches[axis] == 0 || cells[axis] == 0 || !(cell_length[axis] > 0.0) {
                return Err(ConfigError::Decomposition(format!("axis {} is empty", AXIS_NAMES[axis])));
            }
            if cells[axis] < oversize {
                return Err(ConfigError::Decomposition(format!(
                    "patches must be at least {} cells wide along {}, the ghost width", oversize, AXIS_NAMES[axis]
                )));
            }
            p[axis] = patches[axis];
            c[axis] = cells[axis];
            dx[axis] = cell_length[axis];
        }

        if oversize < 2 {
            return Err(ConfigError::Decomposition("the ghost width must be at least 2 cells".to_owned()));
        }

        if geometry == Geometry::Axisymmetric && periodic[1] {
            return Err(ConfigError::Decomposition("the radial axis cannot be periodic".to_owned()));
        }

        let mut periodic = periodic;
        for axis in ndim..3 {
            periodic[axis] = false;
        }

        Ok(Decomposition {
            geometry,
            patches: p,
            cells: c,
            cell_length: dx,
            oversize,
            periodic,
            curve: CurveOrder::hilbert(p, ndim),
        })
    }

    pub fn ndim(&self) -> usize {
        self.geometry.ndim()
    }

    pub fn total_patches(&self) -> usize {
        self.patches.iter().product()
    }

    pub fn cells_per_patch(&self) -> usize {
        self.cells.iter().product()
    }

    pub fn patch_length(&self, axis: usize) -> f64 {
        (self.cells[axis] as f64) * self.cell_length[axis]
    }

    pub fn global_length(&self, axis: usize) -> f64 {
        (self.patches[axis] as f64) * self.patch_length(axis)
    }

    /// Number of ghost cells on either side of a patch along `axis`.
    pub fn ghost(&self, axis: usize) -> usize {
        if axis < self.ndim() {self.oversize} else {0}
    }

    pub fn coords_of(&self, index: usize) -> [usize; 3] {
        self.curve.coords_of(index)
    }

    pub fn index_of(&self, coords: [usize; 3]) -> usize {
        self.curve.index_of(coords)
    }

    /// Index of the patch adjacent to `coords` across the given face,
    /// wrapping around periodic axes.
    pub fn neighbor(&self, coords: [usize; 3], axis: usize, side: Side) -> Option<usize> {
        if axis >= self.ndim() {
            return None;
        }
        let n = self.patches[axis];
        let c = coords[axis];
        let next = match side {
            Side::Min if c > 0 => Some(c - 1),
            Side::Min if self.periodic[axis] => Some(n - 1),
            Side::Max if c + 1 < n => Some(c + 1),
            Side::Max if self.periodic[axis] => Some(0),
            _ => None,
        };
        next.map(|v| {
            let mut other = coords;
            other[axis] = v;
            self.index_of(other)
        })
    }

    /// A face is exterior if it lies on the boundary of the simulation
    /// domain along a non-periodic axis.
    pub fn is_exterior(&self, coords: [usize; 3], axis: usize, side: Side) -> bool {
        axis < self.ndim() && self.neighbor(coords, axis, side).is_none()
    }

    /// Lower edge of the domain along `axis`, which moves with the window.
    pub fn global_min(&self, axis: usize, n_moved: usize) -> f64 {
        if axis == 0 {(n_moved as f64) * self.patch_length(0)} else {0.0}
    }

    /// Physical extent of the patch at `coords`.
    pub fn bounds(&self, coords: [usize; 3], n_moved: usize) -> ([f64; 3], [f64; 3]) {
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for axis in 0..3 {
            min[axis] = self.global_min(axis, n_moved) + (coords[axis] as f64) * self.patch_length(axis);
            max[axis] = min[axis] + self.patch_length(axis);
        }
        (min, max)
    }

    /// Brings a Cartesian position back into the domain along periodic axes.
    pub fn wrap(&self, r: &mut [f64; 3], n_moved: usize) {
        for axis in 0..self.ndim() {
            if self.periodic[axis] {
                let min = self.global_min(axis, n_moved);
                let length = self.global_length(axis);
                let mut x = (r[axis] - min).rem_euclid(length);
                if x >= length {
                    x = 0.0;
                }
                r[axis] = min + x;
            }
        }
    }

    /// Index of the patch containing a grid-space position, if it
    /// lies inside the domain.
    pub fn locate(&self, g: &[f64; 3], n_moved: usize) -> Option<usize> {
        let mut coords = [0; 3];
        for axis in 0..self.ndim() {
            let n = self.patches[axis] as i64;
            let s = (g[axis] - self.global_min(axis, n_moved)) / self.patch_length(axis);
            let mut c = s.floor() as i64;
            if c < 0 || c >= n {
                if self.periodic[axis] {
                    c = c.rem_euclid(n);
                } else if c == n && s <= (n as f64) * (1.0 + 1.0e-12) {
                    // on the closed upper face
                    c = n - 1;
                } else {
                    return None;
                }
            }
            coords[axis] = c as usize;
        }
        Some(self.index_of(coords))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice(periodic: [bool; 3]) -> Decomposition {
        Decomposition::new(Geometry::Cartesian2D, &[4, 3], &[8, 8], &[0.5, 0.25], 2, periodic).unwrap()
    }

    #[test]
    fn neighbours_wrap_only_when_periodic() {
        let d = lattice([true, false, false]);
        let corner = [0, 0, 0];
        assert_eq!(d.neighbor(corner, 0, Side::Min), Some(d.index_of([3, 0, 0])));
        assert_eq!(d.neighbor(corner, 0, Side::Max), Some(d.index_of([1, 0, 0])));
        assert_eq!(d.neighbor(corner, 1, Side::Min), None);
        assert!(d.is_exterior(corner, 1, Side::Min));
        assert!(!d.is_exterior(corner, 0, Side::Min));
        assert!(!d.is_exterior(corner, 2, Side::Min));
    }

    #[test]
    fn location_of_positions() {
        let d = lattice([true, false, false]);
        let (min, max) = d.bounds([2, 1, 0], 0);
        assert_eq!(min, [8.0, 2.0, 0.0]);
        assert_eq!(max, [12.0, 4.0, 1.0]);

        assert_eq!(d.locate(&[9.0, 3.0, 0.0], 0), Some(d.index_of([2, 1, 0])));
        // periodic in x
        assert_eq!(d.locate(&[-1.0, 3.0, 0.0], 0), Some(d.index_of([3, 1, 0])));
        // upper face of y is closed
        assert_eq!(d.locate(&[1.0, 6.0, 0.0], 0), Some(d.index_of([0, 2, 0])));
        assert_eq!(d.locate(&[1.0, 6.5, 0.0], 0), None);

        let mut r = [17.0, 1.0, 0.0];
        d.wrap(&mut r, 0);
        assert_eq!(r, [1.0, 1.0, 0.0]);
    }

    #[test]
    fn window_offsets_bounds() {
        let d = lattice([false; 3]);
        let (min, _) = d.bounds([0, 0, 0], 3);
        assert_eq!(min[0], 12.0);
        assert_eq!(d.locate(&[12.5, 0.5, 0.0], 3), Some(d.index_of([0, 0, 0])));
        assert_eq!(d.locate(&[11.5, 0.5, 0.0], 3), None);
    }

    #[test]
    fn rejects_bad_lattices() {
        assert!(Decomposition::new(Geometry::Cartesian2D, &[4], &[8, 8], &[0.5, 0.5], 2, [false; 3]).is_err());
        assert!(Decomposition::new(Geometry::Cartesian1D, &[4], &[1], &[0.5], 2, [false; 3]).is_err());
        assert!(Decomposition::new(Geometry::Axisymmetric, &[4, 2], &[8, 8], &[0.5, 0.5], 2, [false, true, false]).is_err());
        assert!(Geometry::parse("4d").is_err());
        assert_eq!(Geometry::parse("AMcylindrical").unwrap(), Geometry::Axisymmetric);
    }
}
