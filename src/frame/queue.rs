//! C2 Frame Queue (spec.md §3, §4.2).
//!
//! Grounded on `examples/original_source/src/frame_queue.{h,cc}`
//! (`FrameQueue::WriteBack`/`ReadFront`, `kEventWaitPeriod = 30`).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::buffer::{BufferError, FrameBuffer, FrameFlags};

/// Minimal wait period between successive `read_front` polls, per spec.md §4.2.
pub const EVENT_WAIT_PERIOD: Duration = Duration::from_millis(30);

struct Inner {
    free: VecDeque<FrameBuffer>,
    /// At most one entry: the access unit currently being assembled.
    pending: Option<FrameBuffer>,
    ready: VecDeque<FrameBuffer>,
    capacity: usize,
    buffer_size: usize,
    stopped: bool,
}

/// Pool + ready-queue + pending-assembly slot. Constructed when the encoder
/// initializes, destroyed on teardown (spec.md §3).
pub struct FrameQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl FrameQueue {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            free.push_back(FrameBuffer::new(buffer_size));
        }
        FrameQueue {
            inner: Mutex::new(Inner {
                free,
                pending: None,
                ready: VecDeque::new(),
                capacity,
                buffer_size,
                stopped: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Releases the drain thread's `read_front` wait immediately (spec.md §5
    /// cancellation: "release() must cause the drain thread to observe a
    /// stop flag and exit within one kEventWaitPeriod").
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        self.not_empty.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn pending_count(&self) -> usize {
        if self.inner.lock().pending.is_some() {
            1
        } else {
            0
        }
    }

    pub fn ready_count(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Write path: called from the encoder's segment callback (spec.md
    /// §4.2). Must stay short — no blocking work beyond the copy/append.
    pub fn write_back(&self, segment: &[u8], flags: FrameFlags) {
        let mut inner = self.inner.lock();

        // 1. zero-length, flagless segment: EOS heartbeat, ignore.
        if segment.is_empty() && flags.is_empty() {
            return;
        }

        // 2. segment too large for any buffer: log and drop.
        if segment.len() >= inner.buffer_size {
            warn!(len = segment.len(), capacity = inner.buffer_size, "segment exceeds buffer capacity, dropped");
            return;
        }

        // 3. pending assembly in progress: append to it.
        if let Some(mut buf) = inner.pending.take() {
            match buf.append(segment, flags) {
                Ok(()) => {
                    if buf.is_frame_end() {
                        inner.ready.push_back(buf);
                        self.not_empty.notify_one();
                    } else {
                        inner.pending = Some(buf);
                    }
                }
                Err(BufferError::TooLarge { len, capacity }) => {
                    warn!(len, capacity, "pending access unit overflowed on append, dropped");
                    // buf is dropped; pending assembly resets (failure semantics, §4.2).
                }
            }
            return;
        }

        // 4. no pending assembly: take a free buffer, or allocate a temporary one.
        let mut buf = match inner.free.pop_front() {
            Some(buf) => buf,
            None => {
                debug!("frame pool exhausted, allocating temporary buffer");
                FrameBuffer::new_temporary(inner.buffer_size)
            }
        };
        buf.reset();
        if let Err(BufferError::TooLarge { len, capacity }) = buf.copy(segment, flags) {
            warn!(len, capacity, "segment rejected by fresh buffer, dropped");
            self.recycle(&mut inner, buf);
            return;
        }

        if buf.is_config() && !buf.is_frame_end() {
            // SPS/PPS prepended to the next IDR: defer to pending.
            inner.pending = Some(buf);
        } else {
            inner.ready.push_back(buf);
            self.not_empty.notify_one();
        }
    }

    fn recycle(&self, inner: &mut Inner, buf: FrameBuffer) {
        if !buf.is_temporary() && inner.free.len() < inner.capacity {
            inner.free.push_back(buf);
        }
        // temporary buffers (or pool overflow) are simply dropped.
    }

    /// Read path: blocks up to `EVENT_WAIT_PERIOD` for a ready access unit
    /// (spec.md §4.2). Returns `None` on timeout or after `stop()`.
    pub fn read_front(&self, wait_until_timeout: bool) -> Option<FrameBuffer> {
        let mut inner = self.inner.lock();
        if inner.ready.is_empty() && wait_until_timeout && !inner.stopped {
            let deadline = Instant::now() + EVENT_WAIT_PERIOD;
            loop {
                let timed_out = self
                    .not_empty
                    .wait_until(&mut inner, deadline)
                    .timed_out();
                if !inner.ready.is_empty() || inner.stopped || timed_out {
                    break;
                }
            }
        }
        let buf = inner.ready.pop_front()?;
        Some(buf)
    }

    /// Returns a dequeued (and already reset) buffer to the free list, or
    /// drops it if it was temporary. Call after the consumer has finished
    /// reading the bytes out of the buffer returned by `read_front`.
    pub fn release(&self, mut buf: FrameBuffer) {
        let mut inner = self.inner.lock();
        buf.reset();
        self.recycle(&mut inner, buf);
    }

    pub fn size(&self) -> usize {
        self.inner.lock().ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_config_keyframe_pair() {
        // Scenario 1 (spec.md §8): CONFIG, FRAME_START|KEYFRAME, FRAME_END|KEYFRAME
        // lengths 7, 1000, 800 -> one ready access unit, length 1807, is_keyframe.
        let queue = FrameQueue::new(4, 4096);
        let config = vec![0xAAu8; 7];
        let start = vec![0xBBu8; 1000];
        let end = vec![0xCCu8; 800];

        queue.write_back(&config, FrameFlags::CONFIG);
        queue.write_back(&start, FrameFlags::FRAME_START | FrameFlags::KEYFRAME);
        queue.write_back(&end, FrameFlags::FRAME_END | FrameFlags::KEYFRAME);

        assert_eq!(queue.ready_count(), 1);
        let unit = queue.read_front(false).expect("access unit ready");
        assert_eq!(unit.length(), 1807);
        assert!(unit.is_keyframe());
        assert_eq!(&unit.as_bytes()[..7], &config[..]);
        assert_eq!(&unit.as_bytes()[7..1007], &start[..]);
        assert_eq!(&unit.as_bytes()[1007..], &end[..]);
    }

    #[test]
    fn eos_heartbeat_is_ignored() {
        let queue = FrameQueue::new(2, 64);
        queue.write_back(&[], FrameFlags::NONE);
        assert_eq!(queue.ready_count(), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn oversized_segment_is_dropped() {
        let queue = FrameQueue::new(2, 16);
        queue.write_back(&[0u8; 32], FrameFlags::FRAME_START | FrameFlags::FRAME_END);
        assert_eq!(queue.ready_count(), 0);
    }

    #[test]
    fn pool_exhaustion_allocates_temporary_buffer_without_growing_pool() {
        let queue = FrameQueue::new(1, 64);
        // exhaust the single free buffer, leaving it in `pending` via CONFIG
        queue.write_back(&[1, 2, 3], FrameFlags::CONFIG);
        // second access unit must come from a temporary buffer
        queue.write_back(&[4, 5], FrameFlags::FRAME_START | FrameFlags::FRAME_END);
        assert_eq!(queue.free_count(), 0);
        assert_eq!(queue.ready_count(), 1);
    }

    #[test]
    fn pool_invariant_holds_after_full_round_trip() {
        let capacity = 3;
        let queue = FrameQueue::new(capacity, 64);
        for _ in 0..5 {
            queue.write_back(&[9, 9], FrameFlags::FRAME_START | FrameFlags::FRAME_END);
            let buf = queue.read_front(false).unwrap();
            queue.release(buf);
            assert_eq!(queue.free_count() + queue.pending_count() + queue.ready_count(), capacity);
        }
    }

    #[test]
    fn ordering_guarantee_fifo_by_frame_end_arrival() {
        let queue = FrameQueue::new(4, 64);
        queue.write_back(b"first", FrameFlags::FRAME_START | FrameFlags::FRAME_END);
        queue.write_back(b"second", FrameFlags::FRAME_START | FrameFlags::FRAME_END);
        let a = queue.read_front(false).unwrap();
        let b = queue.read_front(false).unwrap();
        assert_eq!(a.as_bytes(), b"first");
        assert_eq!(b.as_bytes(), b"second");
    }

    #[test]
    fn read_front_times_out_when_empty() {
        let queue = FrameQueue::new(2, 64);
        let started = Instant::now();
        let result = queue.read_front(true);
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn stop_wakes_blocked_reader_immediately() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(FrameQueue::new(2, 64));
        let reader_queue = queue.clone();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let result = reader_queue.read_front(true);
            (result.is_none(), started.elapsed())
        });
        thread::sleep(Duration::from_millis(5));
        queue.stop();
        let (was_none, elapsed) = handle.join().unwrap();
        assert!(was_none);
        assert!(elapsed < EVENT_WAIT_PERIOD);
    }
}
