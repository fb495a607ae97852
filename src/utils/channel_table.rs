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

use crate::{AppError, AppResult};

/// Hard upper bound of any table, channel numbers are 16-bit.
pub const MAX_TABLE_CAPACITY: usize = 65536;

///
/// Index-addressable table of optional values, used for channel numbers
/// (connection level) and link handles (session level).
///
/// Storage grows geometrically up to `max_capacity`. Assigning an index past the
/// current length extends the length, assigning past `max_capacity` fails.
/// [`ChannelTable::first_empty_slot`] hands out the lowest retired index again, so
/// numbers only get reused once the previous holder is fully gone.
#[derive(Debug)]
pub struct ChannelTable<T> {
    slots: Vec<Option<T>>,
    max_capacity: usize,
    occupied: usize,
}

impl<T> ChannelTable<T> {
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        let max_capacity = max_capacity.min(MAX_TABLE_CAPACITY);
        ChannelTable {
            slots: Vec::with_capacity(initial_capacity.min(max_capacity)),
            max_capacity,
            occupied: 0,
        }
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Logical length: one past the highest index ever assigned.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Number of slots currently holding a value.
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Stores `value` at `index` and returns the previous occupant.
    pub fn set(&mut self, index: usize, value: T) -> AppResult<Option<T>> {
        if index >= self.max_capacity {
            return Err(AppError::ResourceLimitExceeded(format!(
                "index {} exceeds table capacity {}",
                index, self.max_capacity
            )));
        }
        if index >= self.slots.len() {
            self.extend_to(index + 1);
        }
        let previous = self.slots[index].replace(value);
        if previous.is_none() {
            self.occupied += 1;
        }
        Ok(previous)
    }

    /// Clears the slot at `index`, making it eligible for reuse.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let removed = self.slots.get_mut(index).and_then(Option::take);
        if removed.is_some() {
            self.occupied -= 1;
        }
        removed
    }

    /// Lowest index holding no value, or `None` when the table is full.
    pub fn first_empty_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(Option::is_none)
            .or_else(|| (self.slots.len() < self.max_capacity).then_some(self.slots.len()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index, value)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|value| (index, value)))
    }

    /// Removes every value, returning them in index order.
    pub fn drain(&mut self) -> Vec<(usize, T)> {
        self.occupied = 0;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.take().map(|value| (index, value)))
            .collect()
    }

    fn extend_to(&mut self, len: usize) {
        if len > self.slots.capacity() {
            let target = (self.slots.capacity().max(1) * 2)
                .max(len)
                .min(self.max_capacity);
            self.slots.reserve_exact(target - self.slots.len());
        }
        self.slots.resize_with(len, || None);
    }
}
