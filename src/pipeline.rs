// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Memory pools and the chunk hand-off queue of the output pipeline.
//!
//! Everything the network path touches is preallocated: slab pools of
//! CPI tiles and raw-ROI buffers, recycled through a fixed population of
//! return chunks. The producer thread fills a chunk and hands it to the
//! per-stream worker through a bounded circular queue; a full queue
//! means upstream pacing is broken and is treated as fatal.

use crate::metadata::ROI_SIZE;
use crate::wire::CpiReturn;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use tracing::error;

/// Fixed-size free list of boxed slabs.
pub struct Pool<T> {
    free: Mutex<Vec<Box<T>>>,
    capacity: usize,
}

impl<T: Default> Pool<T> {
    pub fn new(capacity: usize) -> Pool<T> {
        let free = (0..capacity).map(|_| Box::new(T::default())).collect();
        Pool {
            free: Mutex::new(free),
            capacity,
        }
    }

    /// Take a slab; `None` when the pool is exhausted.
    pub fn get(&self) -> Option<Box<T>> {
        self.free.lock().unwrap().pop()
    }

    /// Return a slab to the pool.
    pub fn put(&self, slab: Box<T>) {
        let mut free = self.free.lock().unwrap();
        debug_assert!(free.len() < self.capacity);
        free.push(slab);
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A raw ROI in flight to the raw stream.
pub struct RoiReturn {
    pub roi: Vec<u8>,
}

impl Default for RoiReturn {
    fn default() -> Self {
        RoiReturn {
            roi: vec![0; ROI_SIZE],
        }
    }
}

/// Unit of hand-off to a network worker: either a scene of CPI tiles or
/// one raw ROI. The chunk owns the slabs it has drawn from the pools.
#[derive(Default)]
pub struct ReturnChunk {
    pub cpis: Vec<Box<CpiReturn>>,
    pub roi: Option<Box<RoiReturn>>,
}

/// The pool family backing one output stream.
pub struct PipelinePools {
    pub chunks: Pool<ReturnChunk>,
    pub cpis: Pool<CpiReturn>,
    pub rois: Pool<RoiReturn>,
}

impl PipelinePools {
    pub fn new(chunk_count: usize, cpi_count: usize, roi_count: usize) -> PipelinePools {
        PipelinePools {
            chunks: Pool::new(chunk_count),
            cpis: Pool::new(cpi_count),
            rois: Pool::new(roi_count),
        }
    }

    /// Release a chunk and everything it owns back to the pools.
    pub fn dispose_chunk(&self, mut chunk: Box<ReturnChunk>) {
        for mut cpi in chunk.cpis.drain(..) {
            cpi.clean();
            self.cpis.put(cpi);
        }
        if let Some(roi) = chunk.roi.take() {
            self.rois.put(roi);
        }
        self.chunks.put(chunk);
    }
}

/// Bounded circular buffer between producer and network worker.
pub struct ChunkQueue {
    inner: Mutex<QueueState>,
    cond: Condvar,
    capacity: usize,
}

struct QueueState {
    chunks: VecDeque<Box<ReturnChunk>>,
    quit: bool,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> ChunkQueue {
        ChunkQueue {
            inner: Mutex::new(QueueState {
                chunks: VecDeque::with_capacity(capacity),
                quit: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Transfer a chunk to the worker. Overrun terminates the process:
    /// a full queue indicates upstream pacing is broken.
    pub fn hand_in(&self, chunk: Box<ReturnChunk>) {
        let mut state = self.inner.lock().unwrap();
        if state.chunks.len() >= self.capacity {
            error!("output circular buffer is full");
            std::process::exit(1);
        }
        state.chunks.push_back(chunk);
        drop(state);
        self.cond.notify_one();
    }

    /// Block until a chunk arrives; `None` after shutdown.
    pub fn pop(&self) -> Option<Box<ReturnChunk>> {
        let mut state = self.inner.lock().unwrap();
        loop {
            if let Some(chunk) = state.chunks.pop_front() {
                return Some(chunk);
            }
            if state.quit {
                return None;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn shutdown(&self) {
        self.inner.lock().unwrap().quit = true;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
