//! Ranks as threads of a single process, exchanging messages through
//! in-memory mailboxes.

use std::any::Any;
use std::sync::{Arc, Barrier, Condvar, Mutex, PoisonError};

use super::{Exchangeable, Messenger, Tag};

struct Letter {
    source: usize,
    tag: Tag,
    payload: Box<dyn Any + Send>,
}

#[derive(Default)]
struct Mailbox {
    letters: Mutex<Vec<Letter>>,
    delivered: Condvar,
}

struct Shared {
    mailboxes: Vec<Mailbox>,
    barrier: Barrier,
}

/// One rank of a group of threads.
pub struct ThreadWorld {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadWorld {
    /// Runs `f` on `size` ranks, each on its own thread, and returns
    /// their results in rank order.
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where F: Fn(ThreadWorld) -> R + Sync, R: Send {
        assert!(size > 0, "need at least one rank");
        let shared = Arc::new(Shared {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            barrier: Barrier::new(size),
        });

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let world = ThreadWorld {rank, shared: Arc::clone(&shared)};
                    let f = &f;
                    s.spawn(move || f(world))
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }
}

impl Messenger for ThreadWorld {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn send<T: Exchangeable>(&self, dest: usize, tag: Tag, data: &[T]) {
        let mailbox = &self.shared.mailboxes[dest];
        let mut letters = mailbox.letters.lock().unwrap_or_else(PoisonError::into_inner);
        letters.push(Letter {
            source: self.rank,
            tag,
            payload: Box::new(data.to_vec()),
        });
        mailbox.delivered.notify_all();
    }

    fn receive<T: Exchangeable>(&self, source: usize, tag: Tag) -> Vec<T> {
        let mailbox = &self.shared.mailboxes[self.rank];
        let mut letters = mailbox.letters.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            // first match, so messages are not overtaken
            if let Some(i) = letters.iter().position(|l| l.source == source && l.tag == tag) {
                let letter = letters.remove(i);
                return match letter.payload.downcast::<Vec<T>>() {
                    Ok(data) => *data,
                    Err(_) => panic!("rank {} received a message of unexpected type from {} (tag {})", self.rank, source, tag),
                };
            }
            letters = mailbox.delivered.wait(letters).unwrap_or_else(PoisonError::into_inner);
        }
    }
}
