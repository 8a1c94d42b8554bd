//! Message passing between ranks
//!
//! Every cross-rank operation in the simulation goes through the
//! [`Messenger`] trait, which has two implementations: [`MpiWorld`],
//! backed by an MPI communicator, and [`ThreadWorld`], where each rank
//! is an OS thread of the same process.

mod threads;
pub use self::threads::*;

#[cfg(feature = "distributed")]
mod mpi_world;
#[cfg(feature = "distributed")]
pub use self::mpi_world::*;

pub type Tag = i32;

/// Message tags, one per kind of exchange. Messages between a given
/// pair of ranks with the same tag are received in the order sent.
pub mod tags {
    use super::Tag;
    pub const FACE_HEADERS: Tag = 10;
    pub const FACE_DATA: Tag = 11;
    pub const PARTICLES: Tag = 20;
    pub const MIGRATION_HEADERS: Tag = 30;
    pub const MIGRATION_DATA: Tag = 31;
    pub const DOMAIN_HEADERS: Tag = 40;
    pub const DOMAIN_DATA: Tag = 41;
    pub const OBLIGATIONS: Tag = 50;
    pub const GATHER: Tag = 60;
}

/// Plain data that can be shipped between ranks.
#[cfg(feature = "distributed")]
pub trait Exchangeable: mpi::datatype::Equivalence + Copy + Send + 'static {}

#[cfg(feature = "distributed")]
impl<T> Exchangeable for T where T: mpi::datatype::Equivalence + Copy + Send + 'static {}

/// Plain data that can be shipped between ranks.
#[cfg(not(feature = "distributed"))]
pub trait Exchangeable: Copy + Send + 'static {}

#[cfg(not(feature = "distributed"))]
impl<T> Exchangeable for T where T: Copy + Send + 'static {}

/// A group of cooperating ranks.
///
/// `send` and `receive` block. All the provided methods are collective:
/// they must be called by every rank, in the same order.
pub trait Messenger {
    /// Rank of the calling process.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Blocks until all ranks have reached this point.
    fn barrier(&self);

    fn send<T: Exchangeable>(&self, dest: usize, tag: Tag, data: &[T]);

    fn receive<T: Exchangeable>(&self, source: usize, tag: Tag) -> Vec<T>;

    /// Personalized all-to-all: `outgoing[r]` is delivered to rank `r`,
    /// and the returned `incoming[r]` is what rank `r` sent here.
    ///
    /// Pairs are visited in a single global order (the lower rank of
    /// each pair sends first), so blocking sends cannot deadlock.
    fn exchange<T: Exchangeable>(&self, tag: Tag, mut outgoing: Vec<Vec<T>>) -> Vec<Vec<T>> {
        let (me, size) = (self.rank(), self.size());
        assert_eq!(outgoing.len(), size, "exchange needs one buffer per rank");

        let mut incoming: Vec<Vec<T>> = (0..size).map(|_| Vec::new()).collect();
        incoming[me] = std::mem::take(&mut outgoing[me]);

        for peer in (0..size).filter(|&p| p != me) {
            if me < peer {
                self.send(peer, tag, &outgoing[peer]);
                incoming[peer] = self.receive(peer, tag);
            } else {
                incoming[peer] = self.receive(peer, tag);
                self.send(peer, tag, &outgoing[peer]);
            }
        }

        incoming
    }

    /// Every rank's contribution, indexed by rank.
    fn all_gather<T: Exchangeable>(&self, local: &[T]) -> Vec<Vec<T>> {
        let outgoing = vec![local.to_vec(); self.size()];
        self.exchange(tags::GATHER, outgoing)
    }

    /// Element-wise sum over all ranks.
    fn all_sum(&self, local: &[f64]) -> Vec<f64> {
        self.all_gather(local)
            .iter()
            .fold(vec![0.0; local.len()], |mut total, v| {
                total.iter_mut().zip(v.iter()).for_each(|(t, x)| *t += x);
                total
            })
    }

    /// True if `flag` is set on any rank.
    fn any(&self, flag: bool) -> bool {
        let count = self.all_sum(&[if flag {1.0} else {0.0}]);
        count[0] > 0.0
    }
}
