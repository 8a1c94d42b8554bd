//! What happens to a particle that crosses the edge of the simulation domain

use std::ops::AddAssign;
use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::decomposition::{Geometry, Side, AXIS_NAMES};
use crate::error::ConfigError;
use crate::particle::Particle;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoundaryPolicy {
    Reflective,
    Remove,
    Stop,
    Thermalize,
    Periodic,
}

const POLICIES: [(&str, BoundaryPolicy); 5] = [
    ("reflective", BoundaryPolicy::Reflective),
    ("remove", BoundaryPolicy::Remove),
    ("stop", BoundaryPolicy::Stop),
    ("thermalize", BoundaryPolicy::Thermalize),
    ("periodic", BoundaryPolicy::Periodic),
];

impl BoundaryPolicy {
    pub fn lookup(name: &str) -> Option<BoundaryPolicy> {
        POLICIES.iter().find(|(s, _)| *s == name).map(|(_, p)| *p)
    }
}

/// Did the particle survive its encounter with the boundary?
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Outcome {
    Kept,
    Removed,
}

/// Running totals of what a species has lost through `remove` boundaries.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundaryFlux {
    /// Number of macroparticles
    pub count: u64,
    /// Number of real particles
    pub weight: f64,
    /// Charge, in C
    pub charge: f64,
    /// Momentum, in kg m/s
    pub momentum: [f64; 3],
    /// Kinetic energy, in J
    pub energy: f64,
}

impl AddAssign for BoundaryFlux {
    fn add_assign(&mut self, other: BoundaryFlux) {
        self.count += other.count;
        self.weight += other.weight;
        self.charge += other.charge;
        for i in 0..3 {
            self.momentum[i] += other.momentum[i];
        }
        self.energy += other.energy;
    }
}

/// The properties of a species that boundaries need to know about.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Carrier {
    pub mass: f64,
    pub charge: f64,
}

impl Carrier {
    /// Massless carriers have their momentum normalized to the electron
    /// mass instead.
    pub fn reference_mass(&self) -> f64 {
        if self.mass > 0.0 {self.mass} else {ELECTRON_MASS}
    }

    /// Kinetic energy of all the real particles represented by `pt`.
    pub fn kinetic_energy(&self, pt: &Particle) -> f64 {
        let u2: f64 = pt.momentum.iter().map(|u| u * u).sum();
        let mc2 = self.reference_mass() * SPEED_OF_LIGHT_SQD;
        if self.mass > 0.0 {
            // gamma - 1 = u^2 / (gamma + 1)
            pt.weight * mc2 * u2 / ((1.0 + u2).sqrt() + 1.0)
        } else {
            pt.weight * mc2 * u2.sqrt()
        }
    }

    pub fn record_loss(&self, pt: &Particle, flux: &mut BoundaryFlux) {
        let mc = self.reference_mass() * SPEED_OF_LIGHT;
        flux.count += 1;
        flux.weight += pt.weight;
        flux.charge += pt.weight * self.charge;
        for i in 0..3 {
            flux.momentum[i] += pt.weight * mc * pt.momentum[i];
        }
        flux.energy += self.kinetic_energy(pt);
    }
}

/// Boundary conditions for one species, resolved once from the input
/// configuration into one policy per axis and side.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundaryTable {
    policies: [[BoundaryPolicy; 2]; 3],
    /// Thermal momentum, p/(mc), of particles re-injected by `thermalize`.
    thermal_momentum: f64,
}

impl BoundaryTable {
    /// Builds the table from one `[min, max]` pair of names per active
    /// axis, checking it against the field boundaries.
    pub fn build(
        species: &str, geometry: Geometry, pairs: &[[String; 2]], field_periodic: &[bool; 3],
        carrier: &Carrier, thermal_temperature: Option<f64>
    ) -> Result<BoundaryTable, ConfigError> {
        let ndim = geometry.ndim();
        let mut policies = [[BoundaryPolicy::Remove; 2]; 3];

        if pairs.len() != ndim {
            return Err(ConfigError::BoundaryAxes {
                species: species.to_owned(),
                expected: ndim,
                found: pairs.len(),
            });
        }

        for (axis, pair) in pairs.iter().enumerate() {
            for side in Side::BOTH.iter() {
                let name = &pair[side.id()];
                policies[axis][side.id()] = BoundaryPolicy::lookup(name)
                    .ok_or_else(|| ConfigError::UnknownPolicy {
                        species: species.to_owned(),
                        axis: AXIS_NAMES[axis],
                        policy: name.clone(),
                    })?;
            }

            // the inner radial face is the axis of symmetry, never crossed
            if geometry == Geometry::Axisymmetric && axis == 1 {
                if policies[1][1] != BoundaryPolicy::Remove {
                    return Err(ConfigError::AxisymmetricPolicy {species: species.to_owned(), policy: pair[1].clone()});
                }
                continue;
            }

            let particle_periodic = policies[axis].iter().all(|&p| p == BoundaryPolicy::Periodic);
            let any_periodic = policies[axis].iter().any(|&p| p == BoundaryPolicy::Periodic);
            if field_periodic[axis] != particle_periodic || any_periodic != particle_periodic {
                return Err(ConfigError::PeriodicMismatch {
                    species: species.to_owned(),
                    axis: AXIS_NAMES[axis],
                    fields: if field_periodic[axis] {"periodic"} else {"non-periodic"},
                    min: pair[0].clone(),
                    max: pair[1].clone(),
                });
            }
        }

        let thermalizes = policies.iter().flatten().any(|&p| p == BoundaryPolicy::Thermalize);
        if thermalizes && !(carrier.mass > 0.0) {
            return Err(ConfigError::MasslessThermalize(species.to_owned()));
        }
        if thermalizes && thermal_temperature.is_none() {
            return Err(ConfigError::MissingThermalTemperature(species.to_owned()));
        }

        let thermal_momentum = match thermal_temperature {
            Some(t) if carrier.mass > 0.0 => (t / (carrier.mass * SPEED_OF_LIGHT_SQD)).sqrt(),
            _ => 0.0,
        };

        Ok(BoundaryTable {policies, thermal_momentum})
    }

    pub fn policy(&self, axis: usize, side: Side) -> BoundaryPolicy {
        self.policies[axis][side.id()]
    }

    pub fn thermal_momentum(&self) -> f64 {
        self.thermal_momentum
    }
}

/// Applies `policy` to a particle that has crossed the exterior face
/// `side` of `axis`, located at `bound`.
pub fn apply_policy<R: Rng>(
    policy: BoundaryPolicy, pt: &mut Particle, axis: usize, side: Side, bound: f64,
    carrier: &Carrier, thermal_momentum: f64, rng: &mut R, flux: &mut BoundaryFlux
) -> Outcome {
    // direction pointing back into the domain
    let inward = match side {
        Side::Min => 1.0,
        Side::Max => -1.0,
    };

    match policy {
        BoundaryPolicy::Reflective => {
            pt.position[axis] = 2.0 * bound - pt.position[axis];
            pt.momentum[axis] = -pt.momentum[axis];
            Outcome::Kept
        },
        BoundaryPolicy::Remove => {
            carrier.record_loss(pt, flux);
            Outcome::Removed
        },
        BoundaryPolicy::Stop => {
            pt.position[axis] = bound;
            pt.momentum[axis] = 0.0;
            Outcome::Kept
        },
        BoundaryPolicy::Thermalize => {
            pt.position[axis] = bound;
            for i in 0..3 {
                pt.momentum[i] = if i == axis {
                    // flux-weighted Maxwellian normal to the face
                    let u: f64 = rng.gen();
                    inward * thermal_momentum * (-2.0 * (1.0 - u).ln()).sqrt()
                } else {
                    let n: f64 = rng.sample(StandardNormal);
                    thermal_momentum * n
                };
            }
            Outcome::Kept
        },
        BoundaryPolicy::Periodic => Outcome::Kept, // the exchange wraps the particle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xoshiro::Xoshiro256StarStar;

    fn pairs(v: &[(&str, &str)]) -> Vec<[String; 2]> {
        v.iter().map(|(a, b)| [a.to_string(), b.to_string()]).collect()
    }

    const ELECTRON: Carrier = Carrier {mass: ELECTRON_MASS, charge: -ELEMENTARY_CHARGE};

    #[test]
    fn reflection_flips_normal_momentum() {
        let mut pt = Particle {position: [-0.1, 0.5, 0.0], momentum: [-0.3, 0.2, 0.1], weight: 1.0};
        let mut flux = BoundaryFlux::default();
        let mut rng = Xoshiro256StarStar::seed_from_u64(0);
        let outcome = apply_policy(BoundaryPolicy::Reflective, &mut pt, 0, Side::Min, 0.0, &ELECTRON, 0.0, &mut rng, &mut flux);
        assert_eq!(outcome, Outcome::Kept);
        assert!((pt.position[0] - 0.1).abs() < 1.0e-15);
        assert_eq!(pt.momentum, [0.3, 0.2, 0.1]);
        assert_eq!(flux, BoundaryFlux::default());
    }

    #[test]
    fn removal_is_recorded_once() {
        let mut pt = Particle {position: [1.1, 0.0, 0.0], momentum: [1.0, 0.0, 0.0], weight: 2.0};
        let mut flux = BoundaryFlux::default();
        let mut rng = Xoshiro256StarStar::seed_from_u64(0);
        let outcome = apply_policy(BoundaryPolicy::Remove, &mut pt, 0, Side::Max, 1.0, &ELECTRON, 0.0, &mut rng, &mut flux);
        assert_eq!(outcome, Outcome::Removed);
        assert_eq!(flux.count, 1);
        assert_eq!(flux.weight, 2.0);
        assert!(((flux.charge + 2.0 * ELEMENTARY_CHARGE) / ELEMENTARY_CHARGE).abs() < 1.0e-12);
        let target = 2.0 * ELECTRON_MASS * SPEED_OF_LIGHT_SQD * (2.0f64.sqrt() - 1.0);
        assert!(((flux.energy - target) / target).abs() < 1.0e-12);

        // photons carry no charge
        let photon = Carrier {mass: 0.0, charge: 0.0};
        let mut flux = BoundaryFlux::default();
        apply_policy(BoundaryPolicy::Remove, &mut pt, 0, Side::Max, 1.0, &photon, 0.0, &mut rng, &mut flux);
        assert_eq!(flux.charge, 0.0);
        let target = 2.0 * ELECTRON_MASS * SPEED_OF_LIGHT_SQD;
        assert!(((flux.energy - target) / target).abs() < 1.0e-12);
    }

    #[test]
    fn stop_and_thermalize_clamp_position() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(7);
        let mut flux = BoundaryFlux::default();
        let mut pt = Particle {position: [0.0, 2.5, 0.0], momentum: [0.1, 0.4, 0.0], weight: 1.0};
        apply_policy(BoundaryPolicy::Stop, &mut pt, 1, Side::Max, 2.0, &ELECTRON, 0.0, &mut rng, &mut flux);
        assert_eq!(pt.position[1], 2.0);
        assert_eq!(pt.momentum, [0.1, 0.0, 0.0]);

        for _ in 0..100 {
            let mut pt = Particle {position: [0.0, 2.5, 0.0], momentum: [0.1, 0.4, 0.0], weight: 1.0};
            apply_policy(BoundaryPolicy::Thermalize, &mut pt, 1, Side::Max, 2.0, &ELECTRON, 0.01, &mut rng, &mut flux);
            assert_eq!(pt.position[1], 2.0);
            assert!(pt.momentum[1] <= 0.0);
        }
        assert_eq!(flux.count, 0);
    }

    #[test]
    fn table_validation() {
        let ok = BoundaryTable::build(
            "electron", Geometry::Cartesian2D, &pairs(&[("remove", "reflective"), ("periodic", "periodic")]),
            &[false, true, false], &ELECTRON, None
        ).unwrap();
        assert_eq!(ok.policy(0, Side::Max), BoundaryPolicy::Reflective);

        let unknown = BoundaryTable::build(
            "electron", Geometry::Cartesian1D, &pairs(&[("remove", "bounce")]), &[false; 3], &ELECTRON, None
        );
        match unknown {
            Err(ConfigError::UnknownPolicy {policy, ..}) => assert_eq!(policy, "bounce"),
            _ => panic!("expected an unknown policy"),
        }

        // thermalize on a periodic axis
        let mismatch = BoundaryTable::build(
            "electron", Geometry::Cartesian1D, &pairs(&[("thermalize", "thermalize")]), &[true, false, false], &ELECTRON, Some(1.0e-17)
        );
        assert!(matches!(mismatch, Err(ConfigError::PeriodicMismatch {..})));

        let half_periodic = BoundaryTable::build(
            "electron", Geometry::Cartesian1D, &pairs(&[("periodic", "remove")]), &[false; 3], &ELECTRON, None
        );
        assert!(half_periodic.is_err());

        let radial = BoundaryTable::build(
            "electron", Geometry::Axisymmetric, &pairs(&[("remove", "remove"), ("remove", "reflective")]), &[false; 3], &ELECTRON, None
        );
        assert!(matches!(radial, Err(ConfigError::AxisymmetricPolicy {..})));

        let photon = Carrier {mass: 0.0, charge: 0.0};
        let massless = BoundaryTable::build(
            "photon", Geometry::Cartesian1D, &pairs(&[("thermalize", "remove")]), &[false; 3], &photon, Some(1.0)
        );
        assert!(matches!(massless, Err(ConfigError::MasslessThermalize(_))));

        let wrong_axes = BoundaryTable::build(
            "electron", Geometry::Cartesian2D, &pairs(&[("remove", "remove")]), &[false; 3], &ELECTRON, None
        );
        match wrong_axes {
            Err(ConfigError::BoundaryAxes {species, expected, found}) => {
                assert_eq!(species, "electron");
                assert_eq!((expected, found), (2, 1));
            },
            other => panic!("expected a boundary axis count error, got {:?}", other),
        }
    }

    #[test]
    fn thermalize_needs_a_temperature() {
        let cold = BoundaryTable::build(
            "e", Geometry::Cartesian2D, &pairs(&[("thermalize", "thermalize"), ("periodic", "periodic")]),
            &[false, true, false], &ELECTRON, None
        );
        match cold {
            Err(ConfigError::MissingThermalTemperature(species)) => assert_eq!(species, "e"),
            other => panic!("expected a missing temperature error, got {:?}", other),
        }

        let temperature = 1.0e3 * ELEMENTARY_CHARGE;
        let warm = BoundaryTable::build(
            "e", Geometry::Cartesian2D, &pairs(&[("thermalize", "thermalize"), ("periodic", "periodic")]),
            &[false, true, false], &ELECTRON, Some(temperature)
        ).unwrap();
        let target = (temperature / (ELECTRON_MASS * SPEED_OF_LIGHT_SQD)).sqrt();
        println!("thermal momentum = {:.6e}", warm.thermal_momentum());
        assert!(((warm.thermal_momentum() - target) / target).abs() < 1.0e-12);
    }
}
