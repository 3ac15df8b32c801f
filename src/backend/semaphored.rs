//! Bounds concurrent backend calls to `connections()` with a tiny
//! futex-based counting semaphore, rather than a full mutex - backend calls
//! are meant to overlap, just not unboundedly.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use atomic_wait::{wait, wake_one};

use super::{Backend, FileKind};

struct Semaphore {
    count: AtomicU32,
}

impl Semaphore {
    fn new(permits: u32) -> Self {
        Self {
            count: AtomicU32::new(permits),
        }
    }

    fn acquire(&self) {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current > 0 {
                if self
                    .count
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            } else {
                wait(&self.count, 0);
            }
        }
    }

    fn release(&self) {
        self.count.fetch_add(1, Ordering::Release);
        wake_one(&self.count);
    }
}

/// Wraps any [`Backend`], limiting the number of in-flight calls to the
/// wrapped backend's own `connections()` hint.
pub struct SemaphoredBackend<B> {
    inner: B,
    sem: Semaphore,
    connections: usize,
}

impl<B: Backend> SemaphoredBackend<B> {
    pub fn new(inner: B) -> Self {
        let connections = inner.connections();
        Self {
            inner,
            sem: Semaphore::new(connections as u32),
            connections,
        }
    }

    fn guarded<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.sem.acquire();
        let result = f();
        self.sem.release();
        result
    }
}

impl<B: Backend> Backend for SemaphoredBackend<B> {
    fn save(&self, kind: FileKind, name: &str, reader: &mut dyn std::io::Read) -> Result<()> {
        self.guarded(|| self.inner.save(kind, name, reader))
    }

    fn load(&self, kind: FileKind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.guarded(|| self.inner.load(kind, name, offset, length))
    }

    fn stat(&self, kind: FileKind, name: &str) -> Result<u64> {
        self.guarded(|| self.inner.stat(kind, name))
    }

    fn remove(&self, kind: FileKind, name: &str) -> Result<()> {
        self.guarded(|| self.inner.remove(kind, name))
    }

    fn list(&self, kind: FileKind) -> Result<Vec<String>> {
        self.guarded(|| self.inner.list(kind))
    }

    fn connections(&self) -> usize {
        self.connections
    }

    fn is_not_exist(&self, err: &anyhow::Error) -> bool {
        self.inner.is_not_exist(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[test]
    fn passes_calls_through() {
        let wrapped = SemaphoredBackend::new(MemoryBackend::default());
        let mut data: &[u8] = b"hello";
        wrapped.save(FileKind::Lock, "x", &mut data).unwrap();
        assert_eq!(wrapped.load(FileKind::Lock, "x", 0, 0).unwrap(), b"hello");
    }
}
