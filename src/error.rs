//! Errors raised while configuring and running a simulation
//!
//! Configuration problems are detected before the first timestep and
//! reported as [`ConfigError`]. A violated runtime invariant is a
//! [`FatalError`]: it is never retried, and under MPI the whole job
//! is aborted once it reaches `main`.

use crate::setup::InputError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("unsupported geometry '{0}'")]
    Geometry(String),
    #[error("invalid decomposition: {0}")]
    Decomposition(String),
    #[error("unknown field boundary '{0}'")]
    UnknownFieldBoundary(String),
    #[error("species '{species}': unknown particle boundary '{policy}' on axis {axis}")]
    UnknownPolicy {species: String, axis: char, policy: String},
    #[error("species '{species}': axis {axis} has {fields} field boundaries, but particle boundaries '{min}' and '{max}'")]
    PeriodicMismatch {species: String, axis: char, fields: &'static str, min: String, max: String},
    #[error("species '{species}': the outer radial boundary must be 'remove' in axisymmetric geometry, not '{policy}'")]
    AxisymmetricPolicy {species: String, policy: String},
    #[error("species '{0}' is massless and cannot be thermalized")]
    MasslessThermalize(String),
    #[error("species '{0}' has a thermalizing boundary but no thermal_temperature")]
    MissingThermalTemperature(String),
    #[error("species '{species}': particle boundaries given for {found} axes, expected {expected}")]
    BoundaryAxes {species: String, expected: usize, found: usize},
    #[error("the moving window requires a non-periodic x axis")]
    PeriodicWindow,
    #[error("unknown field component '{0}'")]
    UnknownComponent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("ownership is not a partition: {0}")]
    OwnershipNotPartition(String),
    #[error("rank {rank}: additional/missing patch maps are not reciprocal with rank {peer}: expected {expected:?}, found {found:?}")]
    Reciprocity {rank: usize, peer: usize, expected: Vec<usize>, found: Vec<usize>},
    #[error("rank {rank}: after migration holds patches {found:?}, expected {expected:?}")]
    MigrationMismatch {rank: usize, expected: Vec<usize>, found: Vec<usize>},
    #[error("rank {rank}: received a particle for patch {index}, which it does not own")]
    StrayParticle {rank: usize, index: usize},
    #[error("rank {rank}: {count} particle(s) left the simulation domain without a boundary condition")]
    LostParticles {rank: usize, count: usize},
    #[error("rank {rank}: field exchange inconsistent for patch {index}: {reason}")]
    SyncMismatch {rank: usize, index: usize, reason: String},
    #[error("the unified grid was used while stale")]
    StaleDomain,
    #[error("restart does not match checkpoint: {0}")]
    RestartMismatch(String),
    #[error("failed to write checkpoint: {0}")]
    CheckpointWrite(String),
    #[error("failed to read checkpoint: {0}")]
    CheckpointRead(String),
    #[error("another rank reported a fatal error")]
    PeerFailed,
    #[error("patch state could not be encoded: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Anything that can end a run.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("failed to write diagnostics: {0}")]
    Diagnostics(#[from] std::io::Error),
}

impl From<InputError> for SimError {
    fn from(e: InputError) -> SimError {
        SimError::Config(ConfigError::Input(e))
    }
}

impl SimError {
    /// True if the physical state of the simulation is still consistent,
    /// so that it is worth attempting a final checkpoint.
    pub fn state_is_intact(&self) -> bool {
        match self {
            SimError::Diagnostics(_) => true,
            _ => false,
        }
    }
}

/// Records `r` in `status` unless an earlier error is already there.
pub fn keep_first<E>(status: &mut Result<(), E>, r: Result<(), E>) {
    if status.is_ok() {
        *status = r;
    }
}
