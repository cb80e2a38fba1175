//! The suite of traits allowing rtstream to abstract over hosts and their open streams.

use std::sync::mpsc::Receiver;

use crate::descriptor::{Direction, StreamDescriptor};
use crate::error::Result;
use crate::{DeviceInfo, SampleFormat, StreamOptions};

/// What the stream controller asks of a host for one direction of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeRequest {
    pub device: usize,
    pub direction: Direction,
    pub channels: usize,
    pub first_channel: usize,
    pub sample_rate: u32,
    pub format: SampleFormat,
    /// The requested period size. `0` lets the host pick.
    pub buffer_frames: usize,
}

/// A **Host** provides access to the audio devices of one native sound subsystem.
///
/// Devices are addressed by index. Indices are only meaningful until the next enumeration; the
/// controller validates them against [`device_count`](HostTrait::device_count) before opening a
/// stream.
pub trait HostTrait {
    /// The handle a host keeps for an open stream.
    type Stream: StreamTrait;

    /// The number of devices currently available. Enumerates the subsystem on every call.
    fn device_count(&self) -> usize;

    /// Describes the device at `index`.
    ///
    /// A device that could not be queried is still described, with `probed` set to `false`.
    fn device_info(&self, index: usize) -> Result<DeviceInfo>;

    /// The index of the system default output device.
    fn default_output_device(&self) -> usize {
        0
    }

    /// The index of the system default input device.
    fn default_input_device(&self) -> usize {
        0
    }

    /// Opens one direction of a stream.
    ///
    /// Called once per requested direction, output first. The first call creates `handle`, the
    /// second augments it. On failure, every native object created by this call is released and
    /// `handle` is left as it was found, so a failed input probe never leaves a half-built output.
    /// The negotiated buffer count is written back to `options`.
    fn probe_open(
        &self,
        handle: &mut Option<Self::Stream>,
        desc: &mut StreamDescriptor,
        request: &ProbeRequest,
        options: &mut StreamOptions,
    ) -> Result<()>;
}

/// The host's side of an open stream.
///
/// Every method receives the stream's descriptor; the controller and the worker thread never call
/// two of them concurrently.
pub trait StreamTrait: Send {
    /// Starts the hardware and moves the stream to `Running`.
    fn start(&mut self, desc: &mut StreamDescriptor) -> Result<()>;

    /// Arms a graceful drain.
    ///
    /// Returns a receiver that yields (or disconnects) once the worker has flushed the queued
    /// output, or `None` when there is nothing to wait for. The caller must release the engine
    /// lock before blocking on it and call [`stop`](StreamTrait::stop) afterwards.
    fn request_drain(&mut self, desc: &mut StreamDescriptor) -> Option<Receiver<()>>;

    /// Halts the hardware, clears its buffers and moves the stream to `Stopped`.
    fn stop(&mut self, desc: &mut StreamDescriptor) -> Result<()>;

    /// Halts immediately, discarding queued output.
    fn abort(&mut self, desc: &mut StreamDescriptor) -> Result<()>;

    /// Releases the native objects of both directions.
    fn close(&mut self, desc: &mut StreamDescriptor);

    /// The realtime unit of work: transfers one period between the callback and the hardware.
    ///
    /// Blocks for pacing as needed.
    fn service_one_period(&mut self, desc: &mut StreamDescriptor) -> Result<()>;

    /// Latency in frames, summed over both directions.
    fn latency(&self, desc: &StreamDescriptor) -> usize;
}
