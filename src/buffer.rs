//! Bounded per-channel sample buffers.

use std::collections::VecDeque;

use crate::types::{Channel, ChannelReadings};

/// FIFO of normalized samples that never grows past `capacity`.
///
/// Appending past capacity drops the oldest samples first, so the buffer
/// always holds the most recent `capacity` values in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl ChannelBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Append `samples`, then evict from the front down to `capacity`.
    pub fn append(&mut self, samples: &[f32]) {
        self.samples.extend(samples.iter().copied());
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<f32> {
        self.samples.back().copied()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = f32> + ExactSizeIterator + '_ {
        self.samples.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.samples.iter().copied().collect()
    }
}

/// The four channel buffers of one device session.
///
/// A channel's buffer is created the first time samples arrive for it, so a
/// left/right-only sensor never allocates up/down storage.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBuffers {
    capacity: usize,
    left: Option<ChannelBuffer>,
    right: Option<ChannelBuffer>,
    up: Option<ChannelBuffer>,
    down: Option<ChannelBuffer>,
}

impl DeviceBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            left: None,
            right: None,
            up: None,
            down: None,
        }
    }

    fn slot_mut(&mut self, channel: Channel) -> &mut Option<ChannelBuffer> {
        match channel {
            Channel::Left => &mut self.left,
            Channel::Right => &mut self.right,
            Channel::Up => &mut self.up,
            Channel::Down => &mut self.down,
        }
    }

    pub fn get(&self, channel: Channel) -> Option<&ChannelBuffer> {
        match channel {
            Channel::Left => self.left.as_ref(),
            Channel::Right => self.right.as_ref(),
            Channel::Up => self.up.as_ref(),
            Channel::Down => self.down.as_ref(),
        }
    }

    /// Samples of `channel`, empty when nothing has arrived yet.
    pub fn samples(&self, channel: Channel) -> Vec<f32> {
        self.get(channel).map(ChannelBuffer::to_vec).unwrap_or_default()
    }

    /// Append one decoded notification to the matching channel buffers.
    pub fn append(&mut self, readings: &ChannelReadings) {
        let capacity = self.capacity;
        for (channel, samples) in readings.iter() {
            self.slot_mut(channel)
                .get_or_insert_with(|| ChannelBuffer::new(capacity))
                .append(samples);
        }
    }

    /// Buffer used for loudness statistics: left, or right when left is empty.
    pub fn level_source(&self) -> Option<&ChannelBuffer> {
        self.get(Channel::Left)
            .filter(|b| !b.is_empty())
            .or_else(|| self.get(Channel::Right).filter(|b| !b.is_empty()))
    }

    /// Channels that have a buffer, in wire order.
    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        Channel::ALL.into_iter().filter(|&c| self.get(c).is_some())
    }
}
