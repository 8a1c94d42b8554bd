//! Ranks as MPI processes

use mpi::collective::SystemOperation;
use mpi::topology::SystemCommunicator;
use mpi::traits::*;

use super::{Exchangeable, Messenger, Tag};

pub struct MpiWorld {
    world: SystemCommunicator,
}

impl MpiWorld {
    pub fn new(world: SystemCommunicator) -> MpiWorld {
        MpiWorld {world}
    }

    /// Terminates every process in the job.
    pub fn abort(&self, code: i32) -> ! {
        self.world.abort(code)
    }
}

impl Messenger for MpiWorld {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn barrier(&self) {
        self.world.barrier();
    }

    fn send<T: Exchangeable>(&self, dest: usize, tag: Tag, data: &[T]) {
        self.world
            .process_at_rank(dest as i32)
            .synchronous_send_with_tag(data, tag);
    }

    fn receive<T: Exchangeable>(&self, source: usize, tag: Tag) -> Vec<T> {
        self.world
            .process_at_rank(source as i32)
            .receive_vec_with_tag::<T>(tag)
            .0
    }

    fn all_sum(&self, local: &[f64]) -> Vec<f64> {
        let mut total = vec![0.0; local.len()];
        self.world.all_reduce_into(local, &mut total[..], SystemOperation::sum());
        total
    }
}
