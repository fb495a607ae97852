// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tracing::trace;

use super::ByteCursor;

/// Handle to a cursor borrowed from a [`BufferPool`].
///
/// Not `Clone`: releasing consumes the handle, so a buffer has exactly one holder.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle(usize);

/// Arena of frame buffers addressed by handle.
///
/// Each frame decode (and each outbound encode) borrows one cursor for its
/// exclusive duration and hands it back afterwards, so no two readers ever
/// see the same bytes through different offsets.
/// The arena starts with `count` buffers and adds more when every buffer is out.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<ByteCursor>,
    in_use: Vec<bool>,
    free: Vec<usize>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let count = count.max(1);
        BufferPool {
            buffers: (0..count).map(|_| ByteCursor::growable(buffer_size)).collect(),
            in_use: vec![false; count],
            free: (0..count).rev().collect(),
            buffer_size,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of buffers owned by the arena.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of buffers currently borrowed.
    pub fn in_use(&self) -> usize {
        self.in_use.iter().filter(|used| **used).count()
    }

    pub fn acquire(&mut self) -> BufferHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                trace!(
                    "buffer pool exhausted, adding buffer #{}",
                    self.buffers.len()
                );
                self.buffers.push(ByteCursor::growable(self.buffer_size));
                self.in_use.push(false);
                self.buffers.len() - 1
            }
        };
        self.in_use[index] = true;
        BufferHandle(index)
    }

    pub fn get(&self, handle: &BufferHandle) -> &ByteCursor {
        assert!(self.in_use[handle.0], "buffer {} is not borrowed", handle.0);
        &self.buffers[handle.0]
    }

    pub fn get_mut(&mut self, handle: &BufferHandle) -> &mut ByteCursor {
        assert!(self.in_use[handle.0], "buffer {} is not borrowed", handle.0);
        &mut self.buffers[handle.0]
    }

    /// Returns the buffer to the arena, rewound and writable again.
    pub fn release(&mut self, handle: BufferHandle) {
        let index = handle.0;
        assert!(self.in_use[index], "buffer {} released twice", index);
        let cursor = &mut self.buffers[index];
        cursor.set_read_only(false);
        cursor.reset_read_write();
        self.in_use[index] = false;
        self.free.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reuses_buffers() {
        let mut pool = BufferPool::new(2, 64);
        let first = pool.acquire();
        let second = pool.acquire();
        assert_ne!(first, second);
        assert_eq!(pool.in_use(), 2);

        pool.get_mut(&first).put_slice(b"frame");
        pool.get_mut(&first).set_read_only(true);
        pool.release(first);

        let again = pool.acquire();
        assert_eq!(again, BufferHandle(0));
        let cursor = pool.get(&again);
        assert_eq!(cursor.readable_len(), 0);
        assert!(!cursor.is_read_only());
        pool.release(again);
        pool.release(second);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn exhausted_pool_grows() {
        let mut pool = BufferPool::new(1, 16);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.len(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    #[should_panic(expected = "not borrowed")]
    fn stale_access_panics() {
        let mut pool = BufferPool::new(1, 16);
        let handle = pool.acquire();
        let stale = BufferHandle(handle.0);
        pool.release(handle);
        pool.get(&stale);
    }
}
