//! Physical constants in SI units

pub const SPEED_OF_LIGHT: f64 = 299792458.0;
pub const SPEED_OF_LIGHT_SQD: f64 = SPEED_OF_LIGHT * SPEED_OF_LIGHT;
pub const ELEMENTARY_CHARGE: f64 = 1.602176634e-19;
pub const ELECTRON_MASS: f64 = 9.1093837015e-31;
pub const PROTON_MASS: f64 = 1.67262192369e-27;
pub const VACUUM_PERMITTIVITY: f64 = 8.8541878128e-12;
pub const VACUUM_PERMEABILITY: f64 = 1.25663706212e-6;
