//! Bounded queue for received frames.
//!
//! The interrupt handler copies each demultiplexed data fragment into one of
//! a fixed set of buffers; the cooperative context drains them later, in
//! arrival order. When every buffer is in use, new frames are dropped and
//! counted, never blocking the interrupt path.

use core::cell::RefCell;

use embassy_sync::blocking_mutex;

use crate::DefaultRawMutex;

/// Why a frame was not queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnqueueError {
    /// All buffers are waiting to be drained.
    QueueFull,
    /// The fragment does not fit a queue buffer.
    Oversized,
}

/// Backing storage for the pending-frame queue.
///
/// Statically sized by the caller; the driver only ever borrows it. A
/// `BUFFER_SIZE` of the maximum MPDU length and a handful of buffers is
/// plenty, since the cooperative scheduler drains the queue every loop.
pub struct RxQueueResources<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> {
    buffers: [[u8; BUFFER_SIZE]; BUFFER_COUNT],
    lengths: [usize; BUFFER_COUNT],
}
impl<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize>
    RxQueueResources<BUFFER_SIZE, BUFFER_COUNT>
{
    pub const fn new() -> Self {
        Self {
            buffers: [[0u8; BUFFER_SIZE]; BUFFER_COUNT],
            lengths: [0; BUFFER_COUNT],
        }
    }
    /// Initialize the queue over this storage.
    pub(crate) fn init(
        &mut self,
    ) -> blocking_mutex::Mutex<DefaultRawMutex, RefCell<FrameQueue<'_>>> {
        blocking_mutex::Mutex::new(RefCell::new(FrameQueue {
            storage: self.buffers.as_flattened_mut(),
            lengths: &mut self.lengths,
            buffer_size: BUFFER_SIZE,
            head: 0,
            pending: 0,
        }))
    }
}
impl<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> Default
    for RxQueueResources<BUFFER_SIZE, BUFFER_COUNT>
{
    fn default() -> Self {
        Self::new()
    }
}

/// Ring of frame buffers over borrowed storage.
pub(crate) struct FrameQueue<'res> {
    storage: &'res mut [u8],
    lengths: &'res mut [usize],
    buffer_size: usize,
    /// Index of the oldest pending frame.
    head: usize,
    pending: usize,
}
impl FrameQueue<'_> {
    fn capacity(&self) -> usize {
        self.lengths.len()
    }
    pub fn len(&self) -> usize {
        self.pending
    }
    fn slot(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.buffer_size;
        &mut self.storage[start..start + self.buffer_size]
    }
    /// Copy a frame into the next free buffer. Interrupt context.
    pub fn enqueue(&mut self, frame: &[u8]) -> Result<(), EnqueueError> {
        if frame.len() > self.buffer_size {
            return Err(EnqueueError::Oversized);
        }
        if self.pending == self.capacity() {
            return Err(EnqueueError::QueueFull);
        }
        let index = (self.head + self.pending) % self.capacity();
        self.slot(index)[..frame.len()].copy_from_slice(frame);
        self.lengths[index] = frame.len();
        self.pending += 1;
        Ok(())
    }
    /// Hand the oldest pending frame to `f` and release its buffer.
    pub fn dequeue<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        if self.pending == 0 {
            return None;
        }
        let index = self.head;
        let len = self.lengths[index];
        let result = f(&self.slot(index)[..len]);
        self.head = (self.head + 1) % self.capacity();
        self.pending -= 1;
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_come_back_in_arrival_order() {
        let mut resources = RxQueueResources::<64, 4>::new();
        let queue = resources.init();
        queue.lock(|queue| {
            let mut queue = queue.borrow_mut();
            queue.enqueue(&[1; 10]).unwrap();
            queue.enqueue(&[2; 20]).unwrap();
            queue.enqueue(&[3; 30]).unwrap();
            assert_eq!(queue.len(), 3);
            assert_eq!(queue.dequeue(|frame| (frame[0], frame.len())), Some((1, 10)));
            assert_eq!(queue.dequeue(|frame| (frame[0], frame.len())), Some((2, 20)));
            queue.enqueue(&[4; 40]).unwrap();
            assert_eq!(queue.dequeue(|frame| (frame[0], frame.len())), Some((3, 30)));
            assert_eq!(queue.dequeue(|frame| (frame[0], frame.len())), Some((4, 40)));
            assert_eq!(queue.dequeue(|frame| frame.len()), None);
        });
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let mut resources = RxQueueResources::<16, 2>::new();
        let queue = resources.init();
        queue.lock(|queue| {
            let mut queue = queue.borrow_mut();
            queue.enqueue(&[0; 16]).unwrap();
            queue.enqueue(&[0; 16]).unwrap();
            assert_eq!(queue.enqueue(&[0; 1]), Err(EnqueueError::QueueFull));
            queue.dequeue(|_| ()).unwrap();
            assert_eq!(queue.enqueue(&[0; 1]), Ok(()));
        });
    }

    #[test]
    fn oversized_frames_are_refused() {
        let mut resources = RxQueueResources::<8, 2>::new();
        let queue = resources.init();
        queue.lock(|queue| {
            assert_eq!(
                queue.borrow_mut().enqueue(&[0; 9]),
                Err(EnqueueError::Oversized)
            );
        });
    }
}
