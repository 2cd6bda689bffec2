// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Process-wide pool of reusable `Vec<f32>` scratch buffers.
//!
//! The reconstruction pipeline needs around twenty transient FOV-sized
//! float buffers per frame; allocating them on the heap every frame
//! dominates the runtime otherwise. [`scoped`] hands out a size-matched
//! vector wrapped in an RAII guard that returns it to the pool on drop.
//!
//! Buffers come back with their previous contents; callers that need
//! zeroed memory fill explicitly, exactly like a freshly dequeued frame
//! buffer.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

static FREE: OnceLock<Mutex<Vec<Vec<f32>>>> = OnceLock::new();
static BUSY: AtomicUsize = AtomicUsize::new(0);

fn free_list() -> &'static Mutex<Vec<Vec<f32>>> {
    FREE.get_or_init(|| Mutex::new(Vec::new()))
}

/// RAII handle over a pooled `Vec<f32>`. Dereferences to the vector;
/// dropping the guard returns the buffer to the pool.
pub struct ScopedVec {
    vec: Option<Vec<f32>>,
}

impl Deref for ScopedVec {
    type Target = Vec<f32>;

    fn deref(&self) -> &Vec<f32> {
        self.vec.as_ref().unwrap()
    }
}

impl DerefMut for ScopedVec {
    fn deref_mut(&mut self) -> &mut Vec<f32> {
        self.vec.as_mut().unwrap()
    }
}

impl Drop for ScopedVec {
    fn drop(&mut self) {
        if let Some(vec) = self.vec.take() {
            BUSY.fetch_sub(1, Ordering::Relaxed);
            free_list().lock().unwrap().push(vec);
        }
    }
}

/// Acquire a buffer of exactly `size` elements.
///
/// An idle buffer of matching size is reused when available; otherwise a
/// new zeroed vector is allocated and joins the pool on release.
pub fn scoped(size: usize) -> ScopedVec {
    let mut free = free_list().lock().unwrap();
    let vec = match free.iter().position(|v| v.len() == size) {
        Some(idx) => free.swap_remove(idx),
        None => vec![0.0; size],
    };
    BUSY.fetch_add(1, Ordering::Relaxed);
    ScopedVec { vec: Some(vec) }
}

/// Drop every idle buffer. Buffers currently held by a [`ScopedVec`] are
/// unaffected and return to the pool as usual. Called when FOV geometry
/// changes and the cached sizes are no longer useful.
pub fn clear() {
    free_list().lock().unwrap().clear();
}

/// Number of idle buffers currently pooled.
pub fn idle() -> usize {
    free_list().lock().unwrap().len()
}

/// Number of buffers currently checked out.
pub fn busy() -> usize {
    BUSY.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The pool is process-global and shared with every other test in
    // the binary, so these assertions stay local to the handles they
    // hold rather than reading absolute pool sizes.

    #[test]
    fn test_scoped_sizes() {
        let a = scoped(100);
        let b = scoped(200);
        assert_eq!(a.len(), 100);
        assert_eq!(b.len(), 200);
        drop(a);
        // Same-size re-acquisition always yields the requested length,
        // whether or not the freed buffer was reused.
        let c = scoped(100);
        assert_eq!(c.len(), 100);
    }

    #[test]
    fn test_busy_counts_held_handles() {
        let before = busy();
        let guard = scoped(64);
        assert!(busy() > before);
        drop(guard);
    }

    #[test]
    fn test_contents_are_writable() {
        let mut v = scoped(16);
        v.fill(0.0);
        v[3] = 7.5;
        assert_eq!(v[3], 7.5);
    }
}
