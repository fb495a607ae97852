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

use bytes::{Buf, Bytes, BytesMut};

/// A byte region with independent read and write offsets.
///
/// The region is `[0, capacity)`, and the offsets always satisfy
/// `0 <= read_offset <= write_offset <= capacity`. Bytes between the two offsets are
/// readable; bytes after the write offset are writable.
///
/// Every bound violation is a programming error, not a protocol error, so the cursor
/// panics instead of returning a `Result`. Frame codecs only ever ask for what the
/// frame header told them is there.
///
/// When growth is enabled a write past the end reallocates the storage to
/// `max(2 * capacity, capacity + n)`, copying the unread bytes to the front of the new
/// region and rebasing both offsets.
#[derive(Debug)]
pub struct ByteCursor {
    storage: BytesMut,
    read_offset: usize,
    write_offset: usize,
    growable: bool,
    read_only: bool,
}

impl ByteCursor {
    /// Fixed-size cursor. Writing past `capacity` panics.
    pub fn with_capacity(capacity: usize) -> Self {
        ByteCursor {
            storage: BytesMut::zeroed(capacity),
            read_offset: 0,
            write_offset: 0,
            growable: false,
            read_only: false,
        }
    }

    /// Cursor that reallocates when a write does not fit.
    pub fn growable(capacity: usize) -> Self {
        ByteCursor {
            growable: true,
            ..ByteCursor::with_capacity(capacity)
        }
    }

    /// Fixed-size cursor whose whole region is already written with `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut cursor = ByteCursor::with_capacity(data.len());
        cursor.put_slice(data);
        cursor
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    /// Number of written but not yet read bytes.
    pub fn readable_len(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// Number of bytes that can still be written without growing.
    pub fn writable_len(&self) -> usize {
        self.storage.len() - self.write_offset
    }

    pub fn is_growable(&self) -> bool {
        self.growable
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Marks the cursor read-only; any write attempt panics until it is cleared.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// The unread bytes.
    pub fn readable(&self) -> &[u8] {
        &self.storage[self.read_offset..self.write_offset]
    }

    /// The free space after the write offset. Call [`ByteCursor::append_write`] after
    /// filling it.
    pub fn writable(&mut self) -> &mut [u8] {
        self.assert_writable();
        let start = self.write_offset;
        &mut self.storage[start..]
    }

    /// Makes sure `n` more bytes fit after the write offset, growing if allowed.
    pub fn ensure_writable(&mut self, n: usize) {
        self.assert_writable();
        if n <= self.writable_len() {
            return;
        }
        assert!(
            self.growable,
            "write of {} bytes exceeds cursor capacity ({} writable of {})",
            n,
            self.writable_len(),
            self.capacity()
        );
        self.grow(n);
    }

    /// Advances the write offset by `n`.
    pub fn append_write(&mut self, n: usize) {
        self.ensure_writable(n);
        self.write_offset += n;
    }

    /// Advances the read offset by `n`.
    pub fn complete_read(&mut self, n: usize) {
        assert!(
            n <= self.readable_len(),
            "read of {} bytes exceeds {} unread bytes",
            n,
            self.readable_len()
        );
        self.read_offset += n;
    }

    /// Rewinds both offsets to the start of the region.
    pub fn reset_read_write(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;
    }

    /// Repositions both offsets at once so that `[read_offset, read_offset + length)`
    /// becomes the readable window.
    pub fn adjust_position(&mut self, read_offset: usize, length: usize) {
        let end = read_offset.saturating_add(length);
        assert!(
            end <= self.capacity(),
            "position {}+{} outside cursor of capacity {}",
            read_offset,
            length,
            self.capacity()
        );
        self.read_offset = read_offset;
        self.write_offset = end;
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put_slice(&[value]);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_offset;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.write_offset += data.len();
    }

    /// Overwrites a big-endian `u32` at an absolute, already written position.
    /// Used to backpatch length prefixes.
    pub fn patch_u32(&mut self, position: usize, value: u32) {
        self.assert_writable();
        assert!(
            position + 4 <= self.write_offset,
            "patch at {} outside written region ending at {}",
            position,
            self.write_offset
        );
        self.storage[position..position + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Copies the unread bytes out without consuming them.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.readable())
    }

    fn assert_writable(&self) {
        assert!(!self.read_only, "write to a read-only cursor");
    }

    fn grow(&mut self, n: usize) {
        let capacity = self.capacity();
        let new_capacity = usize::max(capacity * 2, capacity + n);
        let unread = self.readable_len();
        let mut storage = BytesMut::zeroed(new_capacity);
        storage[..unread].copy_from_slice(self.readable());
        self.storage = storage;
        self.read_offset = 0;
        self.write_offset = unread;
    }
}

impl Buf for ByteCursor {
    fn remaining(&self) -> usize {
        self.readable_len()
    }

    fn chunk(&self) -> &[u8] {
        self.readable()
    }

    fn advance(&mut self, cnt: usize) {
        self.complete_read(cnt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let mut cursor = ByteCursor::with_capacity(16);
        cursor.put_u32(0xDEAD_BEEF);
        cursor.put_u8(7);
        assert_eq!(cursor.readable_len(), 5);
        assert_eq!(cursor.writable_len(), 11);

        assert_eq!(cursor.get_u32(), 0xDEAD_BEEF);
        assert_eq!(cursor.get_u8(), 7);
        assert_eq!(cursor.readable_len(), 0);
        assert_eq!(cursor.read_offset(), 5);
    }

    #[test]
    fn writable_then_append_write() {
        let mut cursor = ByteCursor::with_capacity(8);
        cursor.writable()[..3].copy_from_slice(b"abc");
        cursor.append_write(3);
        assert_eq!(cursor.readable(), b"abc");
    }

    #[test]
    #[should_panic(expected = "exceeds cursor capacity")]
    fn fixed_cursor_rejects_overflow() {
        let mut cursor = ByteCursor::with_capacity(4);
        cursor.append_write(5);
    }

    #[test]
    #[should_panic(expected = "exceeds 2 unread bytes")]
    fn read_never_passes_write_offset() {
        let mut cursor = ByteCursor::from_slice(b"ab");
        cursor.complete_read(3);
    }

    #[test]
    fn growth_keeps_unread_bytes_and_rebases() {
        let mut cursor = ByteCursor::growable(4);
        cursor.put_slice(b"wxyz");
        cursor.complete_read(2);
        cursor.put_slice(b"12345");

        // max(2 * 4, 4 + 5)
        assert_eq!(cursor.capacity(), 9);
        assert_eq!(cursor.read_offset(), 0);
        assert_eq!(cursor.readable(), b"yz12345");
    }

    #[test]
    fn growth_doubles_for_small_writes() {
        let mut cursor = ByteCursor::growable(8);
        cursor.put_slice(&[0; 8]);
        cursor.put_u8(1);
        assert_eq!(cursor.capacity(), 16);
    }

    #[test]
    fn reset_and_adjust_position() {
        let mut cursor = ByteCursor::with_capacity(10);
        cursor.put_slice(b"0123456789");
        cursor.complete_read(4);

        cursor.adjust_position(2, 3);
        assert_eq!(cursor.readable(), b"234");

        cursor.reset_read_write();
        assert_eq!(cursor.readable_len(), 0);
        assert_eq!(cursor.writable_len(), 10);
    }

    #[test]
    #[should_panic(expected = "outside cursor")]
    fn adjust_position_respects_end() {
        let mut cursor = ByteCursor::with_capacity(4);
        cursor.adjust_position(2, 3);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn read_only_cursor_rejects_writes() {
        let mut cursor = ByteCursor::from_slice(b"frame");
        cursor.set_read_only(true);
        cursor.put_u8(0);
    }

    #[test]
    fn patch_length_prefix() {
        let mut cursor = ByteCursor::growable(4);
        cursor.put_u32(0);
        cursor.put_slice(b"body");
        cursor.patch_u32(0, 8);
        assert_eq!(cursor.get_u32(), 8);
        assert_eq!(cursor.readable(), b"body");
    }
}
