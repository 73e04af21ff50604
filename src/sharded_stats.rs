use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thread_local::ThreadLocal;

/// Statistics which can be accumulated per thread and merged on demand.
pub trait Stats: Send {
    fn clear(&mut self);
    fn combine(&mut self, other: &Self);
}

type Shard<S> = Arc<Mutex<S>>;

/// A sharded statistics structure.
///
/// Every thread accounts its operations in its own instance of the stats,
/// so concurrent tasks do not fight for one lock. When it is time to report,
/// all shards are locked one at a time, merged into a fresh instance
/// and cleared.
pub struct ShardedStats<S: Stats> {
    shards: ThreadLocal<Shard<S>>,
    all: Mutex<Vec<Shard<S>>>,
    make: Box<dyn Fn() -> S + Send + Sync>,
}

impl<S: Stats> ShardedStats<S> {
    /// Creates sharded stats whose shards are built with `make`.
    pub fn new(make: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            shards: ThreadLocal::new(),
            all: Mutex::new(Vec::new()),
            make: Box::new(make),
        }
    }

    /// Creates an empty instance of the stats.
    pub fn create(&self) -> S {
        (self.make)()
    }

    /// Gets and locks access to this thread's stats.
    pub fn get_shard_mut(&self) -> MutexGuard<'_, S> {
        self.shards
            .get_or(|| {
                let shard = Arc::new(Mutex::new(self.create()));
                self.all.lock().push(Arc::clone(&shard));
                shard
            })
            .lock()
    }

    /// Combines statistics from all threads and clears all threads' stats.
    pub fn get_combined_and_clear(&self) -> S {
        let mut combined = self.create();
        for shard in self.all.lock().iter() {
            let shard = &mut shard.lock();
            combined.combine(shard);
            shard.clear();
        }
        combined
    }
}
