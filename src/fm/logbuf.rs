use std::collections::VecDeque;
use std::sync::Mutex;

/// Fixed-capacity, insertion-ordered ring of entries. Oldest entries are evicted on overflow.
///
/// Entries are tagged with a generation: [`BoundedLog::reset`] clears the ring and bumps the
/// generation, and [`BoundedLog::push_for`] drops entries written for an older generation. A
/// capture task that was signaled to stop but is still mid-write can therefore never leak its
/// output into the next run's buffer.
#[derive(Debug)]
pub struct BoundedLog<T> {
    capacity: usize,
    inner: Mutex<Ring<T>>,
}

#[derive(Debug)]
struct Ring<T> {
    generation: u64,
    entries: VecDeque<T>,
}

impl<T: Clone> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Ring {
                generation: 0,
                entries: VecDeque::with_capacity(capacity.min(4096)),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current generation. Writers capture it once and pass it to [`BoundedLog::push_for`].
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Append to the current generation.
    pub fn push(&self, entry: T) {
        let mut g = self.lock();
        Self::push_locked(&mut g, self.capacity, entry);
    }

    /// Append only if `generation` is still current. Returns false if the entry was dropped.
    pub fn push_for(&self, generation: u64, entry: T) -> bool {
        let mut g = self.lock();
        if g.generation != generation {
            return false;
        }
        Self::push_locked(&mut g, self.capacity, entry);
        true
    }

    /// Clear all entries and start a new generation, returning it.
    pub fn reset(&self) -> u64 {
        let mut g = self.lock();
        g.entries.clear();
        g.generation = g.generation.wrapping_add(1);
        g.generation
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_locked(g: &mut Ring<T>, capacity: usize, entry: T) {
        g.entries.push_back(entry);
        while g.entries.len() > capacity {
            g.entries.pop_front();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ring<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
