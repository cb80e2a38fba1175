//! The seam between the ring-buffer stream logic and a concrete sound subsystem.

use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;
use crate::{NativeFormats, SampleFormat};

/// The two cursors a circular hardware buffer reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardwarePosition {
    /// Where the hardware is currently playing from or capturing into.
    pub current: usize,
    /// The boundary software may write from (playback) or read up to (capture).
    pub safe: usize,
}

/// The wave format a hardware buffer is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingFormat {
    pub channels: usize,
    pub sample_rate: u32,
    pub format: SampleFormat,
}

impl RingFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels * self.format.sample_size()
    }
}

/// What one endpoint supports in one direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities<Id> {
    pub id: Id,
    pub max_channels: usize,
    pub sample_rates: Vec<u32>,
    pub native_formats: NativeFormats,
    /// 8-bit samples are stored with an offset of 128.
    pub unsigned_8: bool,
}

/// A device as the ring-buffer host sees it: a name with a playback side, a capture side, or both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint<Id> {
    pub name: String,
    pub playback: Option<Capabilities<Id>>,
    pub capture: Option<Capabilities<Id>>,
    pub is_default_output: bool,
    pub is_default_input: bool,
}

/// Operations shared by playback and capture buffers.
pub trait RingBuffer: Send {
    /// Size of the circular buffer in bytes.
    fn size(&self) -> usize;

    fn position(&mut self) -> Result<HardwarePosition>;

    /// Starts looping over the buffer.
    fn start(&mut self) -> Result<()>;

    /// Stops the hardware. Positions restart from zero on the next `start`.
    fn halt(&mut self) -> Result<()>;

    /// Overwrites the whole buffer with `byte`.
    fn fill(&mut self, byte: u8) -> Result<()>;
}

pub trait PlaybackBuffer: RingBuffer {
    /// Copies `data` into the ring at `offset`, wrapping at the end of the buffer.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

pub trait CaptureBuffer: RingBuffer {
    /// Copies `data.len()` bytes out of the ring at `offset`, wrapping at the end of the buffer.
    fn read(&mut self, offset: usize, data: &mut [u8]) -> Result<()>;
}

/// A sound subsystem exposing devices as circular hardware buffers.
pub trait RingHardware: Clone + Send + 'static {
    type EndpointId: Clone + Debug + Send;
    type Playback: PlaybackBuffer;
    type Capture: CaptureBuffer;

    /// Enumerates the endpoints. The order defines the device indices.
    fn endpoints(&self) -> Result<Vec<Endpoint<Self::EndpointId>>>;

    fn create_playback(
        &self,
        id: &Self::EndpointId,
        format: &RingFormat,
        buffer_bytes: usize,
    ) -> Result<Self::Playback>;

    fn create_capture(
        &self,
        id: &Self::EndpointId,
        format: &RingFormat,
        buffer_bytes: usize,
    ) -> Result<Self::Capture>;

    /// Suspends the calling thread while waiting for a hardware cursor to advance.
    fn sleep(&self, duration: Duration);
}
