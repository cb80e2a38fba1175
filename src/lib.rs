//! # How to use rtstream
//!
//! Here are some concepts rtstream exposes:
//!
//! - A [`Host`] provides access to the audio devices of one native sound subsystem. Every
//!   platform compiles at least the [`HostId::Virtual`] software host and the [`HostId::Dummy`]
//!   host, which has no devices and is always tried last.
//! - A [`Stream`] is the controller for at most one open flow of audio data. A stream carries an
//!   output direction, an input direction, or both (duplex). The user's data callback is invoked
//!   once per period by a dedicated worker thread.
//!
//! The first step is to create a stream controller. `Stream::new(None)` picks the first compiled
//! host that has at least one device:
//!
//! ```no_run
//! use rtstream::{CallbackResult, SampleFormat, Stream, StreamConfig, StreamParameters};
//!
//! let mut stream = Stream::new(None);
//! let device_id = stream.default_output_device();
//! let mut config = StreamConfig {
//!     output: Some(StreamParameters { device_id, channels: 2, first_channel: 0 }),
//!     format: SampleFormat::F32,
//!     sample_rate: 44100,
//!     buffer_frames: 512,
//!     ..StreamConfig::default()
//! };
//!
//! stream.open(
//!     &mut config,
//!     |output, _input, _info| {
//!         if let Some(samples) = output.and_then(|data| data.as_slice_mut::<f32>()) {
//!             samples.fill(0.0);
//!         }
//!         CallbackResult::Continue
//!     },
//!     None,
//! )?;
//! println!("negotiated {} frames per period", config.buffer_frames);
//!
//! stream.start()?;
//! // ...
//! stream.stop()?;
//! stream.close();
//! # Ok::<(), rtstream::Error>(())
//! ```
//!
//! `buffer_frames` and `options.number_of_buffers` are written back with the values the host
//! negotiated.
//!
//! Returning [`CallbackResult::Drain`] from the data callback lets the queued output finish
//! playing and then stops the stream; [`CallbackResult::Abort`] stops it immediately.
//!
//! Errors either return from the operation that raised them or, when an error callback was passed
//! to [`Stream::open`], are delivered to that callback. Non-warning errors delivered to the
//! callback abort the stream first.

#![cfg_attr(docsrs, feature(doc_cfg))]

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

pub use error::{BackendSpecificError, Error, ErrorKind, Result};
pub use host::virtual_device::{
    Clock, ManualClock, SystemClock, VirtualDevice, VirtualHardware, VirtualHost, VirtualStats,
    VirtualStream,
};
pub use platform::{compiled_hosts, host_from_id, Host, HostId, StreamHandle, ALL_HOSTS};
pub use samples_formats::{NativeFormats, Packed24, SampleFormat, SizedSample, I24};
pub use stream::Stream;

pub mod conversions;
pub mod descriptor;
mod error;
pub mod host;
pub mod platform;
mod samples_formats;
mod stream;
pub mod traits;

/// The version of this library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// The device and channel selection for one direction of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StreamParameters {
    /// Index of the device, in `0..Stream::device_count()`.
    pub device_id: usize,
    pub channels: usize,
    /// The first device channel the stream's channel 0 is mapped to.
    pub first_channel: usize,
}

macro_rules! impl_bitmask {
    ($name:ident) => {
        impl $name {
            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(&self) -> u32 {
                self.0
            }

            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub const fn contains(&self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }
    };
}

/// Options that change how a stream is opened.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamFlags(u32);

impl StreamFlags {
    /// User buffers hold one plane per channel instead of interleaved frames.
    pub const NONINTERLEAVED: StreamFlags = StreamFlags(0x1);
    /// Use the smallest buffer count the host supports.
    pub const MINIMIZE_LATENCY: StreamFlags = StreamFlags(0x2);
    /// Ask for exclusive use of the device where the host supports it.
    pub const EXCLUSIVE: StreamFlags = StreamFlags(0x4);
    /// Promote the worker thread to realtime priority.
    pub const SCHEDULE_REALTIME: StreamFlags = StreamFlags(0x8);
}

impl_bitmask!(StreamFlags);

impl fmt::Debug for StreamFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (StreamFlags::NONINTERLEAVED, "NONINTERLEAVED"),
            (StreamFlags::MINIMIZE_LATENCY, "MINIMIZE_LATENCY"),
            (StreamFlags::EXCLUSIVE, "EXCLUSIVE"),
            (StreamFlags::SCHEDULE_REALTIME, "SCHEDULE_REALTIME"),
        ];
        f.debug_set()
            .entries(names.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| name))
            .finish()
    }
}

/// Overrun/underrun conditions reported to the data callback.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamStatus(u32);

impl StreamStatus {
    /// Captured data was discarded because the callback did not keep up.
    pub const INPUT_OVERFLOW: StreamStatus = StreamStatus(0x1);
    /// The hardware ran out of output data before the callback provided more.
    pub const OUTPUT_UNDERFLOW: StreamStatus = StreamStatus(0x2);
}

impl_bitmask!(StreamStatus);

impl fmt::Debug for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(StreamStatus::INPUT_OVERFLOW) {
            set.entry(&"INPUT_OVERFLOW");
        }
        if self.contains(StreamStatus::OUTPUT_UNDERFLOW) {
            set.entry(&"OUTPUT_UNDERFLOW");
        }
        set.finish()
    }
}

/// Stream options beyond the device selection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub flags: StreamFlags,
    /// Requested number of hardware sub-buffers; `0` for the host default. Written back with the
    /// negotiated count.
    pub number_of_buffers: usize,
    /// Ignored by the ring-buffer hosts.
    pub stream_name: String,
    /// Realtime priority hint. A worker promoted through [`StreamFlags::SCHEDULE_REALTIME`]
    /// derives its priority from the period length instead.
    pub priority: i32,
}

/// Everything needed to open a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    pub output: Option<StreamParameters>,
    pub input: Option<StreamParameters>,
    pub format: SampleFormat,
    pub sample_rate: u32,
    /// Frames per period; `0` lets the host pick. Written back with the negotiated size.
    pub buffer_frames: usize,
    pub options: StreamOptions,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            output: None,
            input: None,
            format: SampleFormat::F32,
            sample_rate: 44100,
            buffer_frames: 256,
            options: StreamOptions::default(),
        }
    }
}

/// What the data callback wants the stream to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackResult {
    Continue,
    /// Play out the queued output, then stop.
    Drain,
    /// Stop immediately, discarding queued output.
    Abort,
}

/// Timing information passed to the data callback alongside the buffers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CallbackInfo {
    pub frames: usize,
    /// Seconds of audio serviced since the stream was opened, advanced one period at a time.
    pub stream_time: f64,
    pub status: StreamStatus,
}

/// One period of audio in the user's format and layout.
///
/// Output callbacks receive `&mut Data` to fill, input callbacks `&Data` to read.
#[derive(Debug)]
pub struct Data<'a> {
    bytes: &'a mut [u8],
    sample_format: SampleFormat,
    channels: usize,
    frames: usize,
    interleaved: bool,
}

impl<'a> Data<'a> {
    pub(crate) fn new(
        bytes: &'a mut [u8],
        sample_format: SampleFormat,
        channels: usize,
        frames: usize,
        interleaved: bool,
    ) -> Self {
        Data {
            bytes,
            sample_format,
            channels,
            frames,
            interleaved,
        }
    }

    /// The sample format of the internal audio data.
    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// `false` when the samples are laid out one channel plane after another.
    pub fn is_interleaved(&self) -> bool {
        self.interleaved
    }

    /// The full length of the buffer in samples.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.sample_format.sample_size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The raw slice of memory representing the underlying audio data as a slice of bytes.
    ///
    /// It is up to the user to interpret the slice of memory based on [`Data::sample_format`].
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// Access the data as a slice of sample type `T`.
    ///
    /// Returns `None` if the sample type does not match the expected sample format.
    pub fn as_slice<T>(&self) -> Option<&[T]>
    where
        T: SizedSample,
    {
        if T::FORMAT != self.sample_format {
            return None;
        }
        // SAFETY: every `SizedSample` is plain old data valid for any bit pattern.
        let (head, samples, tail) = unsafe { self.bytes.align_to::<T>() };
        (head.is_empty() && tail.is_empty()).then_some(samples)
    }

    /// Access the data as a mutable slice of sample type `T`.
    ///
    /// Returns `None` if the sample type does not match the expected sample format.
    pub fn as_slice_mut<T>(&mut self) -> Option<&mut [T]>
    where
        T: SizedSample,
    {
        if T::FORMAT != self.sample_format {
            return None;
        }
        // SAFETY: as above.
        let (head, samples, tail) = unsafe { self.bytes.align_to_mut::<T>() };
        (head.is_empty() && tail.is_empty()).then_some(samples)
    }
}

/// The data callback: output buffer to fill (output and duplex streams), captured input (input
/// and duplex streams) and timing.
pub type DataCallback =
    Box<dyn FnMut(Option<&mut Data>, Option<&Data>, &CallbackInfo) -> CallbackResult + Send>;

/// Receives errors raised by a stream once it is open.
pub type ErrorCallback = Box<dyn FnMut(Error) + Send>;

/// A description of one device, as reported by a host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    /// `false` if the device could not be queried; the remaining fields are then unreliable.
    pub probed: bool,
    pub output_channels: usize,
    pub input_channels: usize,
    /// The channel count usable in both directions at once.
    pub duplex_channels: usize,
    pub is_default_output: bool,
    pub is_default_input: bool,
    /// Supported rates, ascending and without duplicates.
    pub sample_rates: Vec<u32>,
    pub preferred_sample_rate: u32,
    pub native_formats: NativeFormats,
}

impl DeviceInfo {
    /// Sorts and dedups `sample_rates` and picks the preferred rate: the highest rate not above
    /// 48 kHz, or the lowest supported rate when all are higher.
    pub(crate) fn normalize_sample_rates(&mut self) {
        self.sample_rates.sort_unstable();
        self.sample_rates.dedup();
        self.preferred_sample_rate = self
            .sample_rates
            .iter()
            .rev()
            .find(|rate| **rate <= 48000)
            .or_else(|| self.sample_rates.first())
            .copied()
            .unwrap_or(0);
    }
}
