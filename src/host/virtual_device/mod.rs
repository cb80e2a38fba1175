//! Software ring-buffer hardware driven by a clock.
//!
//! Each virtual device owns plain memory buffers whose cursors advance with the elapsed time of a
//! [`Clock`]: `elapsed * bytes_per_second`, frame aligned, wrapped at the buffer size. The safe
//! position sits a fixed 10 ms margin ahead of the play cursor, or behind the capture cursor.
//! Capture buffers hold a 440 Hz tone so recorded audio is observable.
//!
//! With a [`ManualClock`], time only advances when the stream sleeps, which makes the ring-buffer
//! algorithm fully deterministic.

use std::f64::consts::TAU;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::ring::{
    CaptureBuffer, Capabilities, Endpoint, HardwarePosition, PlaybackBuffer, RingBuffer,
    RingFormat, RingHardware, RingHost,
};
use super::ring::sync::split_region;
use crate::conversions::{encode_float, signed_to_unsigned_8};
use crate::error::{Error, ErrorKind, Result};
use crate::{NativeFormats, SampleFormat};

/// A ring-buffer host backed by [`VirtualHardware`].
pub type VirtualHost = RingHost<VirtualHardware>;

/// The handle of a stream opened on a [`VirtualHost`].
pub type VirtualStream = super::ring::RingStream<VirtualHardware>;

pub use self::{VirtualHost as Host, VirtualStream as Stream};

pub(crate) fn open_host() -> Result<Host> {
    Ok(VirtualHost::new())
}

const TONE_HZ: f64 = 440.0;
const TONE_AMPLITUDE: f64 = 0.5;

/// A source of elapsed time for virtual hardware.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

/// Wall-clock time.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Time that only moves when someone sleeps on it or advances it.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        thread::yield_now();
    }
}

/// The description of one virtual device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualDevice {
    pub name: String,
    pub output_channels: usize,
    pub input_channels: usize,
    pub sample_rates: Vec<u32>,
    pub native_formats: NativeFormats,
    /// 8-bit samples are stored unsigned, like most consumer sound cards.
    pub unsigned_8: bool,
}

impl VirtualDevice {
    pub const SAMPLE_RATES: [u32; 4] = [22050, 44100, 48000, 96000];

    pub fn new(name: impl Into<String>, output_channels: usize, input_channels: usize) -> Self {
        VirtualDevice {
            name: name.into(),
            output_channels,
            input_channels,
            sample_rates: Self::SAMPLE_RATES.to_vec(),
            native_formats: NativeFormats::I8 | NativeFormats::I16,
            unsigned_8: true,
        }
    }

    pub fn with_native_formats(mut self, formats: NativeFormats) -> Self {
        self.native_formats = formats;
        self
    }

    pub fn with_sample_rates(mut self, rates: impl Into<Vec<u32>>) -> Self {
        self.sample_rates = rates.into();
        self
    }

    /// A stereo output, a stereo input and a stereo duplex device.
    pub fn defaults() -> Vec<VirtualDevice> {
        vec![
            VirtualDevice::new("Virtual Output", 2, 0),
            VirtualDevice::new("Virtual Input", 0, 2),
            VirtualDevice::new("Virtual Duplex", 2, 2),
        ]
    }

    fn capabilities(&self, id: usize, channels: usize) -> Option<Capabilities<usize>> {
        (channels > 0).then(|| Capabilities {
            id,
            max_channels: channels,
            sample_rates: self.sample_rates.clone(),
            native_formats: self.native_formats,
            unsigned_8: self.unsigned_8,
        })
    }
}

/// Counters of the traffic between streams and virtual hardware.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtualStats {
    pub writes: usize,
    pub bytes_written: usize,
    /// Writes that contained nothing but silence.
    pub silent_writes: usize,
    pub reads: usize,
    pub bytes_read: usize,
    pub last_write: Vec<u8>,
    pub last_read: Vec<u8>,
}

#[derive(Debug)]
struct Inner {
    devices: Vec<VirtualDevice>,
    clock: Arc<dyn Clock>,
    stats: Mutex<VirtualStats>,
}

/// Clock-driven ring-buffer hardware.
#[derive(Clone, Debug)]
pub struct VirtualHardware {
    inner: Arc<Inner>,
}

impl VirtualHardware {
    pub fn new(devices: Vec<VirtualDevice>, clock: Arc<dyn Clock>) -> Self {
        VirtualHardware {
            inner: Arc::new(Inner {
                devices,
                clock,
                stats: Mutex::new(VirtualStats::default()),
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// A snapshot of the traffic so far.
    pub fn stats(&self) -> VirtualStats {
        self.inner.stats.lock().clone()
    }

    fn device(&self, id: usize) -> Result<&VirtualDevice> {
        self.inner.devices.get(id).ok_or_else(|| {
            Error::new(
                ErrorKind::DeviceUnavailable,
                format!("virtual device {id} no longer exists"),
            )
        })
    }

    fn cursor(&self, format: &RingFormat, size: usize) -> Result<Cursor> {
        let bytes_per_frame = format.bytes_per_frame();
        if bytes_per_frame == 0 || size == 0 {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                "virtual buffers need at least one channel and one byte",
            ));
        }
        Ok(Cursor {
            clock: self.inner.clock.clone(),
            started_at: None,
            bytes_per_second: bytes_per_frame * format.sample_rate as usize,
            bytes_per_frame,
            size,
            margin: (format.sample_rate as usize / 100) * bytes_per_frame,
        })
    }

    fn check_format(&self, device: &VirtualDevice, format: &RingFormat) -> Result<()> {
        if !device.native_formats.contains(format.format) {
            return Err(Error::new(
                ErrorKind::DriverError,
                format!("({}) cannot run with {} samples", device.name, format.format),
            ));
        }
        Ok(())
    }
}

impl Default for VirtualHardware {
    fn default() -> Self {
        VirtualHardware::new(VirtualDevice::defaults(), Arc::new(SystemClock::default()))
    }
}

impl RingHost<VirtualHardware> {
    /// A virtual host with the default devices, running in real time.
    pub fn new() -> Self {
        RingHost::from_hardware(VirtualHardware::default())
    }

    pub fn with_devices(devices: Vec<VirtualDevice>, clock: Arc<dyn Clock>) -> Self {
        RingHost::from_hardware(VirtualHardware::new(devices, clock))
    }
}

impl Default for RingHost<VirtualHardware> {
    fn default() -> Self {
        RingHost::new()
    }
}

/// Tracks where a running virtual buffer's hardware cursor is.
#[derive(Debug)]
struct Cursor {
    clock: Arc<dyn Clock>,
    started_at: Option<Duration>,
    bytes_per_second: usize,
    bytes_per_frame: usize,
    size: usize,
    margin: usize,
}

impl Cursor {
    /// Bytes the hardware has consumed or produced since it was started.
    fn travelled(&self) -> usize {
        let Some(started_at) = self.started_at else {
            return 0;
        };
        let elapsed = self.clock.now().saturating_sub(started_at);
        let bytes = (elapsed.as_nanos() * self.bytes_per_second as u128 / 1_000_000_000) as usize;
        bytes - bytes % self.bytes_per_frame
    }

    fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(self.clock.now());
        }
    }

    fn halt(&mut self) {
        self.started_at = None;
    }
}

fn copy_in(memory: &mut [u8], offset: usize, data: &[u8]) {
    let [first, second] = split_region(offset, data.len(), memory.len());
    let split = first.len();
    memory[first].copy_from_slice(&data[..split]);
    memory[second].copy_from_slice(&data[split..]);
}

fn copy_out(memory: &[u8], offset: usize, data: &mut [u8]) {
    let [first, second] = split_region(offset, data.len(), memory.len());
    let split = first.len();
    data[..split].copy_from_slice(&memory[first]);
    data[split..].copy_from_slice(&memory[second]);
}

fn check_transfer(size: usize, offset: usize, len: usize) -> Result<()> {
    if offset >= size || len > size {
        return Err(Error::new(
            ErrorKind::DriverError,
            format!("cannot lock {len} bytes at offset {offset} of a {size} byte buffer"),
        ));
    }
    Ok(())
}

/// A looping virtual playback buffer.
#[derive(Debug)]
pub struct VirtualPlayback {
    memory: Vec<u8>,
    cursor: Cursor,
    silence: u8,
    hardware: VirtualHardware,
}

impl RingBuffer for VirtualPlayback {
    fn size(&self) -> usize {
        self.memory.len()
    }

    fn position(&mut self) -> Result<HardwarePosition> {
        let travelled = self.cursor.travelled();
        Ok(HardwarePosition {
            current: travelled % self.cursor.size,
            safe: (travelled + self.cursor.margin) % self.cursor.size,
        })
    }

    fn start(&mut self) -> Result<()> {
        self.cursor.start();
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        self.cursor.halt();
        Ok(())
    }

    fn fill(&mut self, byte: u8) -> Result<()> {
        self.memory.fill(byte);
        Ok(())
    }
}

impl PlaybackBuffer for VirtualPlayback {
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        check_transfer(self.memory.len(), offset, data.len())?;
        copy_in(&mut self.memory, offset, data);

        let mut stats = self.hardware.inner.stats.lock();
        stats.writes += 1;
        stats.bytes_written += data.len();
        if data.iter().all(|byte| *byte == self.silence) {
            stats.silent_writes += 1;
        }
        stats.last_write.clear();
        stats.last_write.extend_from_slice(data);
        Ok(())
    }
}

/// A looping virtual capture buffer.
#[derive(Debug)]
pub struct VirtualCapture {
    memory: Vec<u8>,
    cursor: Cursor,
    format: RingFormat,
    unsigned_8: bool,
    hardware: VirtualHardware,
}

impl VirtualCapture {
    /// Renders the tone the virtual microphone picks up.
    fn record_tone(&mut self) {
        let bytes_per_frame = self.format.bytes_per_frame();
        let sample_size = self.format.format.sample_size();
        let rate = self.format.sample_rate as f64;
        for (index, frame) in self.memory.chunks_exact_mut(bytes_per_frame).enumerate() {
            let value = TONE_AMPLITUDE * (TAU * TONE_HZ * index as f64 / rate).sin();
            for sample in frame.chunks_exact_mut(sample_size) {
                encode_float(value, self.format.format, sample);
            }
        }
        if self.unsigned_8 {
            signed_to_unsigned_8(&mut self.memory);
        }
    }
}

impl RingBuffer for VirtualCapture {
    fn size(&self) -> usize {
        self.memory.len()
    }

    fn position(&mut self) -> Result<HardwarePosition> {
        let travelled = self.cursor.travelled();
        Ok(HardwarePosition {
            current: travelled % self.cursor.size,
            safe: travelled.saturating_sub(self.cursor.margin) % self.cursor.size,
        })
    }

    fn start(&mut self) -> Result<()> {
        if self.cursor.started_at.is_none() {
            self.record_tone();
        }
        self.cursor.start();
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        self.cursor.halt();
        Ok(())
    }

    fn fill(&mut self, byte: u8) -> Result<()> {
        self.memory.fill(byte);
        Ok(())
    }
}

impl CaptureBuffer for VirtualCapture {
    fn read(&mut self, offset: usize, data: &mut [u8]) -> Result<()> {
        check_transfer(self.memory.len(), offset, data.len())?;
        copy_out(&self.memory, offset, data);

        let mut stats = self.hardware.inner.stats.lock();
        stats.reads += 1;
        stats.bytes_read += data.len();
        stats.last_read.clear();
        stats.last_read.extend_from_slice(data);
        Ok(())
    }
}

impl RingHardware for VirtualHardware {
    type EndpointId = usize;
    type Playback = VirtualPlayback;
    type Capture = VirtualCapture;

    fn endpoints(&self) -> Result<Vec<Endpoint<usize>>> {
        let default_output = self.inner.devices.iter().position(|d| d.output_channels > 0);
        let default_input = self.inner.devices.iter().position(|d| d.input_channels > 0);
        Ok(self
            .inner
            .devices
            .iter()
            .enumerate()
            .map(|(id, device)| Endpoint {
                name: device.name.clone(),
                playback: device.capabilities(id, device.output_channels),
                capture: device.capabilities(id, device.input_channels),
                is_default_output: default_output == Some(id),
                is_default_input: default_input == Some(id),
            })
            .collect())
    }

    fn create_playback(
        &self,
        id: &usize,
        format: &RingFormat,
        buffer_bytes: usize,
    ) -> Result<VirtualPlayback> {
        let device = self.device(*id)?;
        self.check_format(device, format)?;
        let unsigned_8 = device.unsigned_8 && format.format == SampleFormat::I8;
        Ok(VirtualPlayback {
            memory: vec![0; buffer_bytes],
            cursor: self.cursor(format, buffer_bytes)?,
            silence: if unsigned_8 { 0x80 } else { 0 },
            hardware: self.clone(),
        })
    }

    fn create_capture(
        &self,
        id: &usize,
        format: &RingFormat,
        buffer_bytes: usize,
    ) -> Result<VirtualCapture> {
        let device = self.device(*id)?;
        self.check_format(device, format)?;
        Ok(VirtualCapture {
            memory: vec![0; buffer_bytes],
            cursor: self.cursor(format, buffer_bytes)?,
            format: *format,
            unsigned_8: device.unsigned_8 && format.format == SampleFormat::I8,
            hardware: self.clone(),
        })
    }

    fn sleep(&self, duration: Duration) {
        self.inner.clock.sleep(duration);
    }
}
