//! Checkpointing and restart
//!
//! A dump is a directory holding one record per rank and a header,
//! written by rank 0 once every record is safely on disk. A slot without
//! a readable header is incomplete and is never restarted from.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::collection::PatchCollection;
use crate::comm::Messenger;
use crate::error::{FatalError, SimError};
use crate::ownership::OwnershipMap;
use crate::params::Parameters;
use crate::particle::BoundaryFlux;
use crate::patch::PatchState;
use crate::schedule::TimeSelection;
use crate::simulation::SimContext;

const MAGIC: [u8; 8] = *b"TESSERA\0";
const VERSION: u32 = 1;
const HEADER: &str = "header.bin";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Header {
    magic: [u8; 8],
    version: u32,
    time_index: usize,
    n_moved: usize,
    nranks: usize,
    map: OwnershipMap,
}

#[derive(Serialize, Deserialize)]
struct RankRecord {
    rank: usize,
    patches: Vec<PatchState>,
    retired: Vec<BoundaryFlux>,
}

/// Where, and in what state, a restarted simulation picks up.
#[derive(Clone, Debug, PartialEq)]
pub struct Restart {
    pub time_index: usize,
    pub n_moved: usize,
    pub map: OwnershipMap,
    slot: usize,
}

pub struct Checkpoint {
    directory: PathBuf,
    selection: TimeSelection,
    keep: usize,
    exit_after: Option<Duration>,
    stop_file: PathBuf,
    started: Instant,
    /// Number of dumps made, including those of earlier runs.
    dumps: usize,
}

fn write_error(path: &Path, e: impl std::fmt::Display) -> FatalError {
    FatalError::CheckpointWrite(format!("{}: {}", path.display(), e))
}

fn read_error(path: &Path, e: impl std::fmt::Display) -> FatalError {
    FatalError::CheckpointRead(format!("{}: {}", path.display(), e))
}

/// Writes via a temporary file, so that `path` is either absent,
/// or complete.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), FatalError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| write_error(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| write_error(path, e))
}

impl Checkpoint {
    pub fn new(params: &Parameters) -> Self {
        let cp = &params.checkpoint;
        Checkpoint {
            directory: cp.directory.clone(),
            selection: cp.dump_step,
            keep: cp.keep.max(1),
            exit_after: cp.exit_after,
            stop_file: params.output.join("STOP"),
            started: Instant::now(),
            dumps: 0,
        }
    }

    fn slot_dir(&self, slot: usize) -> PathBuf {
        self.directory.join(format!("slot_{}", slot))
    }

    fn record_path(&self, slot: usize, rank: usize) -> PathBuf {
        self.slot_dir(slot).join(format!("rank_{}.bin", rank))
    }

    /// Saves the state of every rank, if a dump is due at `time_index`
    /// or `force` is set. Returns true if a dump was made.
    pub fn dump<M: Messenger>(&mut self, ctx: &SimContext<M>, collection: &PatchCollection, time_index: usize, force: bool) -> Result<bool, SimError> {
        if !force && !self.selection.the_time_is_now(time_index) {
            return Ok(false);
        }

        let rank = ctx.comm.rank();
        let slot = self.dumps % self.keep;
        let dir = self.slot_dir(slot);

        // invalidate the slot before overwriting any of it
        let prepared = fs::create_dir_all(&dir)
            .map_err(|e| write_error(&dir, e))
            .and_then(|_| {
                let header = dir.join(HEADER);
                if rank == 0 && header.exists() {
                    fs::remove_file(&header).map_err(|e| write_error(&header, e))
                } else {
                    Ok(())
                }
            });
        ctx.agree(prepared.map_err(SimError::from))?;

        let record = RankRecord {
            rank,
            patches: collection.patches().iter().map(|p| p.to_state()).collect(),
            retired: collection.retired().to_vec(),
        };
        let path = self.record_path(slot, rank);
        let written = bincode::serialize(&record)
            .map_err(FatalError::from)
            .and_then(|bytes| write_atomically(&path, &bytes));
        ctx.agree(written.map_err(SimError::from))?;

        let finished = if rank == 0 {
            let header = Header {
                magic: MAGIC,
                version: VERSION,
                time_index,
                n_moved: collection.n_moved(),
                nranks: ctx.comm.size(),
                map: collection.map().clone(),
            };
            bincode::serialize(&header)
                .map_err(FatalError::from)
                .and_then(|bytes| write_atomically(&dir.join(HEADER), &bytes))
        } else {
            Ok(())
        };
        ctx.agree(finished.map_err(SimError::from))?;

        self.dumps += 1;
        if rank == 0 {
            tracing::info!("checkpoint at step {} written to {}", time_index, dir.display());
        }
        Ok(true)
    }

    fn read_header(&self, slot: usize) -> Result<Header, FatalError> {
        let path = self.slot_dir(slot).join(HEADER);
        let bytes = fs::read(&path).map_err(|e| read_error(&path, e))?;
        let header: Header = bincode::deserialize(&bytes).map_err(|e| read_error(&path, e))?;
        if header.magic != MAGIC {
            return Err(read_error(&path, "not a checkpoint header"));
        }
        if header.version != VERSION {
            return Err(read_error(&path, format!("format version {} is not supported", header.version)));
        }
        Ok(header)
    }

    /// Finds the newest complete dump and returns the ownership map
    /// it was written with. Later dumps continue the slot rotation.
    pub fn read_ownership<M: Messenger>(&mut self, ctx: &SimContext<M>) -> Result<Restart, SimError> {
        let newest = (0..self.keep)
            .filter_map(|slot| self.read_header(slot).ok().map(|h| (slot, h)))
            .max_by_key(|(_, h)| h.time_index);

        let found = match newest {
            Some((slot, h)) if h.nranks == ctx.comm.size() && h.map.nranks() == h.nranks => Ok((slot, h)),
            Some((_, h)) => Err(FatalError::RestartMismatch(format!(
                "checkpoint was written by {} ranks, running on {}", h.nranks, ctx.comm.size()
            ))),
            None => Err(FatalError::CheckpointRead(format!(
                "no complete checkpoint in {}", self.directory.display()
            ))),
        };
        let (slot, header) = ctx.agree(found.map_err(SimError::from))?;

        self.dumps = slot + 1;
        Ok(Restart {
            time_index: header.time_index,
            n_moved: header.n_moved,
            map: header.map,
            slot,
        })
    }

    /// Loads this rank's record into a collection that was created,
    /// empty, from the restored ownership map.
    pub fn restore_all<M: Messenger>(&self, ctx: &SimContext<M>, restart: &Restart, collection: &mut PatchCollection) -> Result<(), SimError> {
        let rank = ctx.comm.rank();
        let path = self.record_path(restart.slot, rank);

        let restored = self.load_record(rank, &path, restart, collection);
        ctx.agree(restored.map_err(SimError::from))
    }

    fn load_record(&self, rank: usize, path: &Path, restart: &Restart, collection: &mut PatchCollection) -> Result<(), FatalError> {
        if collection.map() != &restart.map || collection.n_moved() != restart.n_moved {
            return Err(FatalError::RestartMismatch("collection was not allocated from the checkpointed map".to_owned()));
        }

        let bytes = fs::read(path).map_err(|e| read_error(path, e))?;
        let record: RankRecord = bincode::deserialize(&bytes).map_err(|e| read_error(path, e))?;
        if record.rank != rank {
            return Err(FatalError::RestartMismatch(format!("{} belongs to rank {}", path.display(), record.rank)));
        }

        let indices: Vec<usize> = record.patches.iter().map(|s| s.index).collect();
        if indices != collection.indices() {
            return Err(FatalError::RestartMismatch(format!(
                "rank {} holds patches {:?}, checkpoint has {:?}", rank, collection.indices(), indices
            )));
        }

        for state in record.patches {
            match collection.get_mut(state.index) {
                Some(p) => p.restore(state)?,
                None => return Err(FatalError::RestartMismatch(format!("patch {} is not held", state.index))),
            }
        }
        collection.set_retired(record.retired);
        Ok(())
    }

    /// True, on every rank, if any rank has run out of wall-clock time
    /// or the operator has asked the run to stop.
    pub fn exit_requested<M: Messenger>(&self, ctx: &SimContext<M>) -> bool {
        let out_of_time = self.exit_after.map_or(false, |limit| self.started.elapsed() >= limit);
        let asked = self.stop_file.exists();
        ctx.comm.any(out_of_time || asked)
    }

    /// Deletes the stop file once the final dump has been made, so that
    /// a restart from that dump runs on. Only rank 0 touches it.
    pub fn clear_stop_request<M: Messenger>(&self, ctx: &SimContext<M>) {
        ctx.comm.barrier();
        if ctx.comm.rank() == 0 && self.stop_file.exists() {
            if let Err(e) = fs::remove_file(&self.stop_file) {
                tracing::warn!("could not remove {}: {}", self.stop_file.display(), e);
            }
        }
        ctx.comm.barrier();
    }
}
