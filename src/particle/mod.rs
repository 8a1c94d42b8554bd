//! Macroparticles and the species they belong to

use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

#[cfg(feature = "distributed")]
use mpi::traits::*;
#[cfg(feature = "distributed")]
use mpi::datatype::UserDatatype;
#[cfg(feature = "distributed")]
use memoffset::*;

mod vec3;
mod boundary;

pub use self::boundary::*;
use self::vec3::*;

use crate::constants::*;
use crate::decomposition::{Decomposition, Geometry};
use crate::setup::{InputError, Profile};

/// A macroparticle, representing `weight` real particles.
///
/// The position is Cartesian, in metres, even in axisymmetric geometry.
/// The momentum is normalized, p/(mc), with the electron mass standing
/// in for `m` if the species is massless.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[repr(C)]
pub struct Particle {
    pub position: [f64; 3],
    pub momentum: [f64; 3],
    pub weight: f64,
}

#[cfg(feature = "distributed")]
unsafe impl Equivalence for Particle {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        let blocklengths = [3, 3, 1];
        let displacements = [
            offset_of!(Particle, position) as mpi::Address,
            offset_of!(Particle, momentum) as mpi::Address,
            offset_of!(Particle, weight) as mpi::Address,
        ];
        let mpi_double = f64::equivalent_datatype();
        let types: [&dyn Datatype; 3] = [&mpi_double; 3];
        UserDatatype::structured(3, &blocklengths, &displacements, &types)
    }
}

/// A particle on its way to the patch that now contains it.
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct Transit {
    pub patch: u64,
    pub species: u64,
    pub particle: Particle,
}

#[cfg(feature = "distributed")]
unsafe impl Equivalence for Transit {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        let blocklengths = [1, 1, 1];
        let displacements = [
            offset_of!(Transit, patch) as mpi::Address,
            offset_of!(Transit, species) as mpi::Address,
            offset_of!(Transit, particle) as mpi::Address,
        ];
        let mpi_u64 = u64::equivalent_datatype();
        let mpi_particle = Particle::equivalent_datatype();
        let types: [&dyn Datatype; 3] = [&mpi_u64, &mpi_u64, &mpi_particle];
        UserDatatype::structured(3, &blocklengths, &displacements, &types)
    }
}

impl Particle {
    pub fn gamma(&self) -> f64 {
        Vec3::from(self.momentum).norm_sqr().sqrt().hypot(1.0)
    }

    /// Advances the particle momentum and position using
    /// the leapfrog pusher developed by Vay et al.,
    /// see https://doi.org/10.1063/1.2837054.
    ///
    /// Massless particles travel in a straight line at the speed of light.
    #[allow(non_snake_case)]
    pub fn push(&mut self, E: &[f64; 3], B: &[f64; 3], carrier: &Carrier, dt: f64) {
        let u = Vec3::from(self.momentum);

        if !(carrier.mass > 0.0) {
            let mag = u.norm_sqr().sqrt();
            if mag > 0.0 {
                let v: [f64; 3] = (SPEED_OF_LIGHT * u / mag).into();
                for i in 0..3 {
                    self.position[i] += v[i] * dt;
                }
            }
            return;
        }

        let E = Vec3::from(*E);
        let B = Vec3::from(*B);
        let gamma = (1.0 + u.norm_sqr()).sqrt();

        // velocity in SI units
        let v = SPEED_OF_LIGHT * u / gamma;

        // u_i = u_{i-1/2} + (q dt/2 m c) (E + v_{i-1/2} x B)
        let alpha = carrier.charge * dt / (2.0 * carrier.mass * SPEED_OF_LIGHT);
        let u_half = u + alpha * (E + v.cross(B));

        // u' =  u_{i-1/2} + (q dt/2 m c) (2 E + v_{i-1/2} x B)
        let u_prime = u_half + alpha * E;
        let gamma_prime_sqd = 1.0 + u_prime * u_prime;

        // update Lorentz factor
        let tau = alpha * SPEED_OF_LIGHT * B;
        let u_star = u_prime * tau;
        let sigma = gamma_prime_sqd - tau * tau;

        let gamma = (
            0.5 * sigma +
            (0.25 * sigma.powi(2) + tau * tau + u_star.powi(2)).sqrt()
        ).sqrt();

        // and momentum
        let t = tau / gamma;
        let s = 1.0 / (1.0 + t * t);

        let u = s * (u_prime + (u_prime * t) * t + u_prime.cross(t));
        self.momentum = u.into();

        // then the position
        let v = SPEED_OF_LIGHT * u / gamma;
        self.position[0] += v.x * dt;
        self.position[1] += v.y * dt;
        self.position[2] += v.z * dt;
    }

    /// Velocity in m/s.
    pub fn velocity(&self, carrier: &Carrier) -> [f64; 3] {
        let u = Vec3::from(self.momentum);
        let scale = if carrier.mass > 0.0 {
            SPEED_OF_LIGHT / (1.0 + u.norm_sqr()).sqrt()
        } else {
            let mag = u.norm_sqr().sqrt();
            if mag > 0.0 {SPEED_OF_LIGHT / mag} else {0.0}
        };
        (scale * u).into()
    }
}

/// Everything about a species that does not change during the run.
#[derive(Clone, Debug)]
pub struct Species {
    pub name: String,
    pub carrier: Carrier,
    /// Macroparticles per cell
    pub npc: usize,
    /// Number density, as a function of position
    pub density: Option<Profile>,
    /// Temperature (J) of the initial distribution
    pub temperature: f64,
    /// Initial mean momentum, p/(mc)
    pub drift: [f64; 3],
    pub boundaries: BoundaryTable,
}

impl Species {
    fn thermal_momentum(&self) -> f64 {
        if self.carrier.mass > 0.0 {
            (self.temperature / (self.carrier.mass * SPEED_OF_LIGHT_SQD)).sqrt()
        } else {
            0.0
        }
    }
}

/// The particles of one species on one patch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Population {
    store: Vec<Particle>,
    /// Particles that have left the patch and await delivery.
    #[serde(skip)]
    exits: Vec<Particle>,
    flux: BoundaryFlux,
}

impl Population {
    pub fn all(&self) -> &[Particle] {
        &self.store[..]
    }

    pub fn new_empty() -> Population {
        Population::default()
    }

    /// Loads `npc` macroparticles in every cell of the box `min`..`min + cells * dx`
    /// where the species' density is positive, with weights chosen
    /// to reproduce that density and momenta drawn from a drifting
    /// Maxwellian.
    pub fn load<R: Rng>(species: &Species, decomposition: &Decomposition, min: &[f64; 3], rng: &mut R) -> Result<Population, InputError> {
        let density = match &species.density {
            Some(d) if species.npc > 0 => d,
            _ => return Ok(Population::new_empty()),
        };

        let ndim = decomposition.ndim();
        let dx = decomposition.cell_length;
        let cells = decomposition.cells;
        let axisymmetric = decomposition.geometry == Geometry::Axisymmetric;
        let u_th = species.thermal_momentum();

        density.with_space(|number_density| {
            let mut pt: Vec<Particle> = Vec::new();
            for i in 0..cells[0] {
                for j in 0..cells[1] {
                    for k in 0..cells[2] {
                        let idx = [i, j, k];
                        let mut lo = [0.0; 3];
                        let mut center = [0.0; 3];
                        for a in 0..ndim {
                            lo[a] = min[a] + (idx[a] as f64) * dx[a];
                            center[a] = lo[a] + 0.5 * dx[a];
                        }

                        let volume = if axisymmetric {
                            2.0 * std::f64::consts::PI * center[1] * dx[0] * dx[1]
                        } else {
                            (0..ndim).map(|a| dx[a]).product::<f64>()
                        };

                        let nreal = number_density(center[0], center[1], center[2]) * volume; // number of real particles
                        if !(nreal > 0.0) {
                            continue;
                        }
                        let weight = nreal / (species.npc as f64);

                        let mut sub: Vec<Particle> = (0..species.npc)
                            .map(|_| {
                                let mut position = [0.0; 3];
                                for a in 0..ndim {
                                    position[a] = lo[a] + rng.gen::<f64>() * dx[a];
                                }
                                if axisymmetric {
                                    // uniform in volume: density of r is proportional to r
                                    let (r0, r1) = (lo[1], lo[1] + dx[1]);
                                    let r = (r0 * r0 + rng.gen::<f64>() * (r1 * r1 - r0 * r0)).sqrt();
                                    let theta = 2.0 * std::f64::consts::PI * rng.gen::<f64>();
                                    position[1] = r * theta.cos();
                                    position[2] = r * theta.sin();
                                }
                                let mut momentum = species.drift;
                                for m in momentum.iter_mut() {
                                    let n: f64 = rng.sample(StandardNormal);
                                    *m += u_th * n;
                                }
                                Particle {position, momentum, weight}
                            })
                            .collect();
                        pt.append(&mut sub);
                    }
                }
            }
            Population {
                store: pt,
                exits: Vec::new(),
                flux: BoundaryFlux::default(),
            }
        })
    }

    pub fn size(&self) -> usize {
        self.store.len()
    }

    pub fn push(&mut self, pt: Particle) {
        self.store.push(pt);
    }

    pub fn take_all(&mut self) -> Vec<Particle> {
        std::mem::take(&mut self.store)
    }

    pub fn replace(&mut self, store: Vec<Particle>) {
        self.store = store;
    }

    pub fn exit(&mut self, pt: Particle) {
        self.exits.push(pt);
    }

    pub fn take_exits(&mut self) -> Vec<Particle> {
        std::mem::take(&mut self.exits)
    }

    pub fn pending_exits(&self) -> usize {
        self.exits.len()
    }

    pub fn flux(&self) -> &BoundaryFlux {
        &self.flux
    }

    pub fn flux_mut(&mut self) -> &mut BoundaryFlux {
        &mut self.flux
    }

    /// Total number of real particles.
    pub fn weight(&self) -> f64 {
        self.store.iter().map(|pt| pt.weight).sum()
    }

    pub fn kinetic_energy(&self, carrier: &Carrier) -> f64 {
        self.store.iter().map(|pt| carrier.kinetic_energy(pt)).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts;
    use super::*;
    use rand_xoshiro::Xoshiro256StarStar;
    use crate::setup::Configuration;

    const ELECTRON: Carrier = Carrier {mass: ELECTRON_MASS, charge: -ELEMENTARY_CHARGE};

    #[test]
    fn static_magnetic_field() {
        let b0 = 1.0;
        let u0 = 1.0;
        let r_c = ELECTRON_MASS * SPEED_OF_LIGHT * u0 / (ELEMENTARY_CHARGE * b0);
        let omega_c = SPEED_OF_LIGHT * u0 / ((1.0 + u0 * u0).sqrt() * r_c);
        println!("r_c = {}, omega_c = {}", r_c, omega_c);
        let dt = 0.01 * 2.0 * consts::PI / omega_c;
        let mut e = Particle {position: [0.0; 3], momentum: [u0, 0.0, 0.0], weight: 1.0};
        for _i in 0..100 {
            e.push(&[0.0, 0.0, 0.0], &[0.0, 0.0, b0], &ELECTRON, dt);
        }
        println!("Got {:?}", e);
        // back to the start after one gyration
        assert!((e.gamma() - 2.0f64.sqrt()).abs() / 2.0f64.sqrt() < 1.0e-6);
        assert!(e.position[0].hypot(e.position[1]) < 1.0e-2 * r_c);
    }

    /// Analytical solution to motion of charge, initially
    /// at rest in a static electric field Ex is
    ///     gamma(t) = [1 + (e Ex t / m c)^2]^(1/2)
    #[test]
    fn static_electric_field() {
        let e0 = 1.0e3;
        let dt = 1.0e-12;
        let mut e = Particle {position: [0.0; 3], momentum: [0.0; 3], weight: 1.0};
        for _i in 0..1000 {
            e.push(&[e0, 0.0, 0.0], &[0.0; 3], &ELECTRON, dt);
        }
        let t = 1000.0 * dt;
        let target = (1.0 + (ELEMENTARY_CHARGE * e0 * t / (ELECTRON_MASS * SPEED_OF_LIGHT)).powi(2)).sqrt();
        println!("gamma = {}, expected {}", e.gamma(), target);
        assert!(((e.gamma() - target) / target).abs() < 1.0e-3);
        assert!(e.momentum[0] < 0.0);
    }

    #[test]
    fn photons_travel_at_c() {
        let photon = Carrier {mass: 0.0, charge: 0.0};
        let mut pt = Particle {position: [0.0; 3], momentum: [0.0, 3.0, 4.0], weight: 1.0};
        pt.push(&[1.0e12, 0.0, 0.0], &[0.0, 0.0, 1.0e3], &photon, 1.0e-9);
        let d = (pt.position[1].powi(2) + pt.position[2].powi(2)).sqrt();
        assert!(((d - SPEED_OF_LIGHT * 1.0e-9) / d).abs() < 1.0e-12);
    }

    #[test]
    fn loading_reproduces_density() {
        let text = "
control:
  density: 1.0e24 * step(x, 0.0, 5.0e-6)
";
        let input = Configuration::from_string(text).unwrap();
        let decomposition = Decomposition::new(Geometry::Cartesian1D, &[1], &[20], &[0.5e-6], 2, [false; 3]).unwrap();
        let species = Species {
            name: "electron".to_owned(),
            carrier: ELECTRON,
            npc: 8,
            density: Some(input.profile("control", "density").unwrap()),
            temperature: 0.0,
            drift: [0.5, 0.0, 0.0],
            boundaries: BoundaryTable::build(
                "electron", Geometry::Cartesian1D, &[["remove".to_owned(), "remove".to_owned()]],
                &[false; 3], &ELECTRON, None
            ).unwrap(),
        };
        let mut rng = Xoshiro256StarStar::seed_from_u64(3);
        let pop = Population::load(&species, &decomposition, &[0.0; 3], &mut rng).unwrap();
        assert_eq!(pop.size(), 10 * 8);
        let target = 1.0e24 * 5.0e-6;
        assert!(((pop.weight() - target) / target).abs() < 1.0e-12);
        assert!(pop.all().iter().all(|pt| pt.position[0] < 5.0e-6 && pt.momentum[0] == 0.5));
    }
}
