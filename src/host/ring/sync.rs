//! Modular arithmetic and sizing rules for keeping a software cursor in phase with a circular
//! hardware buffer.
//!
//! All positions are byte offsets into the hardware buffer.

use std::ops::Range;
use std::time::Duration;

use crate::StreamFlags;

/// The smallest hardware buffer allocated, in bytes.
pub const MIN_BUFFER_BYTES: usize = 32768;
pub const DEFAULT_BUFFER_COUNT: usize = 3;
pub const MIN_BUFFER_COUNT: usize = 2;
pub const DEFAULT_BUFFER_FRAMES: usize = 256;
pub const MIN_BUFFER_FRAMES: usize = 32;
/// Length of the duplex startup window during which captured audio is replaced by silence.
pub const DUPLEX_PREROLL_SECONDS: f64 = 0.5;
/// How long the duplex startup waits for both hardware cursors to move.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(2);
pub const STARTUP_POLL: Duration = Duration::from_millis(1);
/// How long pacing waits on a hardware cursor that does not move before giving up.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(2);
/// The shortest pacing sleep.
pub const MIN_PACING: Duration = Duration::from_millis(1);

/// The number of sub-buffers the hardware buffer is divided into.
pub fn buffer_count(requested: usize, flags: StreamFlags) -> usize {
    if flags.contains(StreamFlags::MINIMIZE_LATENCY) {
        return MIN_BUFFER_COUNT;
    }
    if requested < MIN_BUFFER_COUNT {
        DEFAULT_BUFFER_COUNT
    } else {
        requested
    }
}

/// The period size in frames for a requested size; `0` asks for the default.
pub fn buffer_frames(requested: usize) -> usize {
    match requested {
        0 => DEFAULT_BUFFER_FRAMES,
        frames => frames.max(MIN_BUFFER_FRAMES),
    }
}

/// The distance software keeps from the hardware's safe position.
pub fn lead_time_bytes(buffer_count: usize, buffer_frames: usize, bytes_per_frame: usize) -> usize {
    buffer_count * buffer_frames * bytes_per_frame
}

/// The hardware buffer size: the minimum doubled until it holds at least twice the lead time.
pub fn ring_buffer_size(lead_time: usize) -> usize {
    let mut size = MIN_BUFFER_BYTES;
    while lead_time * 2 > size {
        size *= 2;
    }
    size
}

/// Whether `pointer` lies in `[earlier, later)` on a ring of `size` bytes.
///
/// `pointer` may be unwrapped by at most one buffer length.
pub fn pointer_between(pointer: usize, later: usize, earlier: usize, size: usize) -> bool {
    let mut pointer = pointer;
    let mut later = later;
    if pointer > size {
        pointer -= size;
    }
    if later < earlier {
        later += size;
    }
    if pointer < earlier {
        pointer += size;
    }
    pointer >= earlier && pointer < later
}

/// Splits `len` bytes starting at `offset` into the regions they occupy on a ring of `size`
/// bytes. The second region is empty unless the transfer wraps.
pub fn split_region(offset: usize, len: usize, size: usize) -> [Range<usize>; 2] {
    let offset = offset % size;
    let first = len.min(size - offset);
    [offset..offset + first, 0..len - first]
}

/// How long to sleep before `remaining` bytes have been consumed or produced by the hardware.
pub fn pacing_delay(remaining: usize, bytes_per_second: usize) -> Duration {
    if bytes_per_second == 0 {
        return MIN_PACING;
    }
    Duration::from_secs_f64(remaining as f64 / bytes_per_second as f64).max(MIN_PACING)
}

/// Bytes of duplex input replaced by silence after the stream starts.
pub fn duplex_preroll_bytes(sample_rate: u32, bytes_per_frame: usize) -> usize {
    (DUPLEX_PREROLL_SECONDS * sample_rate as f64).ceil() as usize * bytes_per_frame
}

/// Where a duplex input cursor resumes after the hardware overran it.
///
/// `safe` is the read boundary unwrapped so that it is not behind the cursor, and `end_read` the
/// end of the region software wanted to read. A gap of two periods or more snaps to exactly two
/// periods behind the boundary; a smaller gap backs off by one period plus the gap.
pub fn overflow_resync(safe: usize, end_read: usize, period: usize, size: usize) -> usize {
    let adjustment = end_read.saturating_sub(safe);
    let back = if adjustment >= 2 * period {
        2 * period
    } else {
        period + adjustment
    };
    wrap(safe as isize - back as isize, size)
}

/// Reduces a possibly negative or unwrapped position onto the ring.
pub fn wrap(position: isize, size: usize) -> usize {
    position.rem_euclid(size as isize) as usize
}

/// Accumulates pacing sleeps spent on a hardware position that does not move.
#[derive(Debug, Default)]
pub struct StallWatch {
    position: Option<usize>,
    waited: Duration,
}

impl StallWatch {
    /// Records a `delay` about to be slept at `position`. Returns `true` once the position has
    /// been stuck for longer than [`STALL_TIMEOUT`].
    pub fn waited(&mut self, position: usize, delay: Duration) -> bool {
        if self.position != Some(position) {
            self.position = Some(position);
            self.waited = Duration::ZERO;
        }
        self.waited += delay;
        self.waited > STALL_TIMEOUT
    }
}
