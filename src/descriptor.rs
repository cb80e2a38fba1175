//! The record describing one open stream.
//!
//! A [`StreamDescriptor`] is created by the stream controller when a stream is opened, filled in
//! by the host while it probes each direction, and then shared between the controller and the
//! worker thread behind the controller's engine lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::conversions::{byte_swap_buffer, convert_buffer, ChannelLayout, ConversionInfo};
use crate::error::{Error, ErrorKind, Result};
use crate::traits::ProbeRequest;
use crate::{CallbackInfo, CallbackResult, Data, DataCallback, SampleFormat, StreamStatus};

/// One side of a stream. The discriminant doubles as the index into per-direction arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Output = 0,
    Input = 1,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Output, Direction::Input];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Which directions an open stream carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StreamMode {
    #[default]
    Uninitialized,
    Output,
    Input,
    /// Reached only by opening the input direction after the output direction.
    Duplex,
}

impl StreamMode {
    pub fn has(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (StreamMode::Duplex, _)
                | (StreamMode::Output, Direction::Output)
                | (StreamMode::Input, Direction::Input)
        )
    }
}

/// The lifecycle state of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StreamState {
    #[default]
    Closed,
    Stopped,
    Running,
    /// Transient: the final drain period has been serviced and the hardware is about to halt.
    Stopping,
}

/// A zero-initialised byte buffer aligned for the widest sample type.
///
/// User buffers are handed to the data callback as typed slices, so they must satisfy the
/// alignment of `f64` regardless of the format the stream runs with.
#[derive(Clone, Debug, Default)]
pub struct SampleBuffer {
    words: Vec<u64>,
    len: usize,
}

impl SampleBuffer {
    /// Allocates `len` zeroed bytes, reporting allocation failure as a memory error.
    pub fn zeroed(len: usize) -> Result<Self> {
        let mut words = Vec::new();
        words.try_reserve_exact(len.div_ceil(8)).map_err(|err| {
            Error::new(
                ErrorKind::MemoryError,
                format!("error allocating a {len} byte sample buffer: {err}"),
            )
        })?;
        words.resize(len.div_ceil(8), 0);
        Ok(SampleBuffer { words, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `u8` has no alignment requirement and every bit pattern is valid.
        let (_, bytes, _) = unsafe { self.words.align_to::<u8>() };
        &bytes[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above.
        let (_, bytes, _) = unsafe { self.words.align_to_mut::<u8>() };
        &mut bytes[..self.len]
    }
}

/// The device-side facts a host settled on for one direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceSide {
    pub channels: usize,
    pub format: SampleFormat,
    pub interleaved: bool,
    /// Whether the hardware word order differs from the host's.
    pub byte_swap: bool,
}

/// The negotiated parameters of one direction of an open stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamLeg {
    pub device: usize,
    pub user_channels: usize,
    pub device_channels: usize,
    pub first_channel: usize,
    pub user_format: SampleFormat,
    pub device_format: SampleFormat,
    pub user_interleaved: bool,
    pub device_interleaved: bool,
    pub do_byte_swap: bool,
    pub do_convert_buffer: bool,
    pub convert_info: ConversionInfo,
}

impl StreamLeg {
    /// Combines the caller's request with what the device runs with.
    pub fn negotiate(
        request: &ProbeRequest,
        user_interleaved: bool,
        device: DeviceSide,
        buffer_frames: usize,
    ) -> Self {
        let do_convert_buffer = request.format != device.format
            || request.channels < device.channels
            || (user_interleaved != device.interleaved && request.channels > 1);
        let convert_info = if do_convert_buffer {
            ConversionInfo::new(&ChannelLayout {
                direction: request.direction,
                user_channels: request.channels,
                device_channels: device.channels,
                user_format: request.format,
                device_format: device.format,
                user_interleaved,
                device_interleaved: device.interleaved,
                first_channel: request.first_channel,
                buffer_frames,
            })
        } else {
            ConversionInfo::default()
        };

        StreamLeg {
            device: request.device,
            user_channels: request.channels,
            device_channels: device.channels,
            first_channel: request.first_channel,
            user_format: request.format,
            device_format: device.format,
            user_interleaved,
            device_interleaved: device.interleaved,
            do_byte_swap: device.byte_swap,
            do_convert_buffer,
            convert_info,
        }
    }

    pub fn user_period_bytes(&self, frames: usize) -> usize {
        frames * self.user_channels * self.user_format.sample_size()
    }

    /// Bytes of one period in the device's layout; equal to the user size without conversion.
    pub fn device_period_bytes(&self, frames: usize) -> usize {
        if self.do_convert_buffer {
            frames * self.device_channels * self.device_format.sample_size()
        } else {
            self.user_period_bytes(frames)
        }
    }

    pub fn device_bytes_per_frame(&self) -> usize {
        self.device_channels * self.device_format.sample_size()
    }
}

/// The user callback and the worker's cancellation token.
pub struct CallbackContext {
    pub(crate) data_callback: DataCallback,
    pub(crate) is_running: Arc<AtomicBool>,
}

impl CallbackContext {
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}

/// The negotiated parameters and buffers of one open stream.
pub struct StreamDescriptor {
    pub mode: StreamMode,
    pub state: StreamState,
    pub sample_rate: u32,
    pub buffer_frames: usize,
    pub number_of_buffers: usize,
    pub legs: [Option<StreamLeg>; 2],
    pub user_buffers: [Option<SampleBuffer>; 2],
    /// Shared by both directions; sized for the larger device footprint.
    pub device_buffer: Option<SampleBuffer>,
    pub stream_time: f64,
    pub callback_info: CallbackContext,
}

impl StreamDescriptor {
    pub(crate) fn new(sample_rate: u32, data_callback: DataCallback) -> Self {
        StreamDescriptor {
            mode: StreamMode::Uninitialized,
            state: StreamState::Closed,
            sample_rate,
            buffer_frames: 0,
            number_of_buffers: 0,
            legs: [None, None],
            user_buffers: [None, None],
            device_buffer: None,
            stream_time: 0.0,
            callback_info: CallbackContext {
                data_callback,
                is_running: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub fn leg(&self, direction: Direction) -> Option<&StreamLeg> {
        self.legs[direction.index()].as_ref()
    }

    /// Installs a negotiated direction and allocates its buffers.
    ///
    /// Opening the input after the output turns the stream into a duplex stream. The shared
    /// device buffer is only grown, never shrunk, so a duplex stream keeps a single allocation.
    pub fn attach_leg(&mut self, direction: Direction, leg: StreamLeg) -> Result<()> {
        let mode = match (self.mode, direction) {
            (StreamMode::Uninitialized, Direction::Output) => StreamMode::Output,
            (StreamMode::Uninitialized, Direction::Input) => StreamMode::Input,
            (StreamMode::Output, Direction::Input) => StreamMode::Duplex,
            (mode, direction) => {
                return Err(Error::invalid_use(format!(
                    "cannot open the {direction:?} direction of a stream in {mode:?} mode"
                )))
            }
        };

        let frames = self.buffer_frames;
        let user_buffer = SampleBuffer::zeroed(leg.user_period_bytes(frames))?;
        if leg.do_convert_buffer {
            let needed = leg.device_period_bytes(frames);
            let current = self.device_buffer.as_ref().map_or(0, SampleBuffer::len);
            if needed > current {
                self.device_buffer = Some(SampleBuffer::zeroed(needed)?);
            }
        }

        self.user_buffers[direction.index()] = Some(user_buffer);
        self.legs[direction.index()] = Some(leg);
        self.mode = mode;
        self.state = StreamState::Stopped;
        Ok(())
    }

    /// Frees every buffer and returns the descriptor to its closed baseline.
    pub fn release(&mut self) {
        self.legs = [None, None];
        self.user_buffers = [None, None];
        self.device_buffer = None;
        self.mode = StreamMode::Uninitialized;
        self.state = StreamState::Closed;
    }

    /// Runs the user callback for the current period.
    pub fn invoke_callback(&mut self, status: StreamStatus) -> CallbackResult {
        let frames = self.buffer_frames;
        let info = CallbackInfo {
            frames,
            stream_time: self.stream_time,
            status,
        };
        let [output_buffer, input_buffer] = &mut self.user_buffers;
        let [output_leg, input_leg] = &self.legs;
        let mut output = match (output_leg, output_buffer) {
            (Some(leg), Some(buffer)) => Some(Data::new(
                buffer.as_bytes_mut(),
                leg.user_format,
                leg.user_channels,
                frames,
                leg.user_interleaved,
            )),
            _ => None,
        };
        let input = match (input_leg, input_buffer) {
            (Some(leg), Some(buffer)) => Some(Data::new(
                buffer.as_bytes_mut(),
                leg.user_format,
                leg.user_channels,
                frames,
                leg.user_interleaved,
            )),
            _ => None,
        };
        (self.callback_info.data_callback)(output.as_mut(), input.as_ref(), &info)
    }

    /// Produces this period's output bytes in the device's layout.
    ///
    /// With `silence` the device-format bytes are zeroed and the user buffer is left alone. A
    /// zeroed float sample does not convert to integer zero, so silence never passes through the
    /// conversion kernel.
    pub fn output_period(&mut self, silence: bool) -> Option<&mut [u8]> {
        let frames = self.buffer_frames;
        let leg = self.legs[Direction::Output.index()].as_ref()?;
        let user = self.user_buffers[Direction::Output.index()].as_mut()?;

        let bytes = leg.device_period_bytes(frames);
        let out = if leg.do_convert_buffer {
            let device = self.device_buffer.as_mut()?;
            let out = &mut device.as_bytes_mut()[..bytes];
            if silence {
                out.fill(0);
                return Some(out);
            }
            if leg.user_channels < leg.device_channels {
                out.fill(0);
            }
            convert_buffer(out, user.as_bytes(), &leg.convert_info, frames);
            out
        } else {
            let out = &mut user.as_bytes_mut()[..bytes];
            if silence {
                out.fill(0);
                return Some(out);
            }
            out
        };
        if leg.do_byte_swap {
            byte_swap_buffer(out, frames * leg.device_channels, leg.device_format);
        }
        Some(out)
    }

    /// The buffer a host fills with one period of captured device-format bytes.
    pub fn input_target(&mut self) -> Option<&mut [u8]> {
        let leg = self.legs[Direction::Input.index()].as_ref()?;
        let bytes = leg.device_period_bytes(self.buffer_frames);
        let target = if leg.do_convert_buffer {
            self.device_buffer.as_mut()?
        } else {
            self.user_buffers[Direction::Input.index()].as_mut()?
        };
        Some(&mut target.as_bytes_mut()[..bytes])
    }

    /// Converts the captured bytes in [`input_target`](Self::input_target) into the user buffer.
    pub fn finish_input(&mut self) {
        let frames = self.buffer_frames;
        let Some(leg) = self.legs[Direction::Input.index()].as_ref() else {
            return;
        };
        let Some(user) = self.user_buffers[Direction::Input.index()].as_mut() else {
            return;
        };
        let bytes = leg.device_period_bytes(frames);
        if leg.do_convert_buffer {
            let Some(device) = self.device_buffer.as_mut() else {
                return;
            };
            let captured = &mut device.as_bytes_mut()[..bytes];
            if leg.do_byte_swap {
                byte_swap_buffer(captured, frames * leg.device_channels, leg.device_format);
            }
            convert_buffer(user.as_bytes_mut(), captured, &leg.convert_info, frames);
        } else if leg.do_byte_swap {
            byte_swap_buffer(
                &mut user.as_bytes_mut()[..bytes],
                frames * leg.device_channels,
                leg.device_format,
            );
        }
    }

    /// Advances the stream clock by one period.
    pub fn tick_stream_time(&mut self) {
        self.stream_time += self.buffer_frames as f64 / self.sample_rate as f64;
    }

    pub fn is_running(&self) -> bool {
        self.callback_info.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(direction: Direction, channels: usize, format: SampleFormat) -> ProbeRequest {
        ProbeRequest {
            device: 0,
            direction,
            channels,
            first_channel: 0,
            sample_rate: 48000,
            format,
            buffer_frames: 4,
        }
    }

    fn descriptor(callback: DataCallback) -> StreamDescriptor {
        let mut desc = StreamDescriptor::new(48000, callback);
        desc.buffer_frames = 4;
        desc.number_of_buffers = 3;
        desc
    }

    fn i16_device(channels: usize) -> DeviceSide {
        DeviceSide {
            channels,
            format: SampleFormat::I16,
            interleaved: true,
            byte_swap: false,
        }
    }

    #[test]
    fn sample_buffers_are_aligned_and_zeroed() {
        let buffer = SampleBuffer::zeroed(13).unwrap();
        assert_eq!(buffer.len(), 13);
        assert!(buffer.as_bytes().iter().all(|b| *b == 0));
        assert_eq!(buffer.as_bytes().as_ptr() as usize % std::mem::align_of::<f64>(), 0);
    }

    #[test]
    fn matching_layouts_skip_conversion() {
        let leg = StreamLeg::negotiate(
            &request(Direction::Output, 2, SampleFormat::I16),
            true,
            i16_device(2),
            4,
        );
        assert!(!leg.do_convert_buffer);
        assert_eq!(leg.device_period_bytes(4), 16);

        let mono_planar = StreamLeg::negotiate(
            &request(Direction::Output, 1, SampleFormat::I16),
            false,
            i16_device(1),
            4,
        );
        assert!(!mono_planar.do_convert_buffer);
    }

    #[test]
    fn opening_input_after_output_is_duplex() {
        let mut desc = descriptor(Box::new(|_, _, _| CallbackResult::Continue));
        let output = StreamLeg::negotiate(
            &request(Direction::Output, 2, SampleFormat::F32),
            true,
            i16_device(2),
            4,
        );
        desc.attach_leg(Direction::Output, output).unwrap();
        assert_eq!(desc.mode, StreamMode::Output);
        assert_eq!(desc.device_buffer.as_ref().unwrap().len(), 16);

        let input = StreamLeg::negotiate(
            &request(Direction::Input, 1, SampleFormat::F32),
            true,
            i16_device(4),
            4,
        );
        desc.attach_leg(Direction::Input, input).unwrap();
        assert_eq!(desc.mode, StreamMode::Duplex);
        assert_eq!(desc.state, StreamState::Stopped);
        assert_eq!(desc.device_buffer.as_ref().unwrap().len(), 32);
        assert_eq!(desc.user_buffers[1].as_ref().unwrap().len(), 16);

        let again = desc.leg(Direction::Output).cloned().unwrap();
        let err = desc.attach_leg(Direction::Output, again).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUse);

        desc.release();
        assert_eq!(desc.mode, StreamMode::Uninitialized);
        assert_eq!(desc.state, StreamState::Closed);
        assert!(desc.device_buffer.is_none());
    }

    #[test]
    fn callback_output_is_converted_for_the_device() {
        let mut desc = descriptor(Box::new(|output, input, info| {
            assert!(input.is_none());
            assert_eq!(info.frames, 4);
            let output = output.unwrap();
            for (i, sample) in output.as_slice_mut::<f32>().unwrap().iter_mut().enumerate() {
                *sample = if i % 2 == 0 { 0.5 } else { -1.0 };
            }
            CallbackResult::Continue
        }));
        let device = i16_device(3);
        let mut req = request(Direction::Output, 2, SampleFormat::F32);
        req.first_channel = 1;
        let leg = StreamLeg::negotiate(&req, true, device, 4);
        desc.attach_leg(Direction::Output, leg).unwrap();

        assert_eq!(
            desc.invoke_callback(StreamStatus::empty()),
            CallbackResult::Continue
        );
        let bytes = desc.output_period(false).unwrap().to_vec();
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples.len(), 12);
        for frame in samples.chunks_exact(3) {
            assert_eq!(frame, &[0, 16383, -32768]);
        }

        let silent = desc.output_period(true).unwrap();
        assert!(silent.iter().all(|b| *b == 0));
    }

    #[test]
    fn captured_bytes_reach_the_user_buffer() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut desc = descriptor(Box::new(move |_, input, _| {
            let input = input.unwrap();
            sink.lock().extend_from_slice(input.as_slice::<i32>().unwrap());
            CallbackResult::Continue
        }));
        let leg = StreamLeg::negotiate(
            &request(Direction::Input, 1, SampleFormat::I32),
            true,
            i16_device(2),
            4,
        );
        desc.attach_leg(Direction::Input, leg).unwrap();

        let target = desc.input_target().unwrap();
        assert_eq!(target.len(), 16);
        for (i, frame) in target.chunks_exact_mut(4).enumerate() {
            frame[..2].copy_from_slice(&(i as i16 + 1).to_ne_bytes());
            frame[2..].copy_from_slice(&(-7i16).to_ne_bytes());
        }
        desc.finish_input();
        desc.invoke_callback(StreamStatus::empty());
        assert_eq!(*seen.lock(), vec![1 << 16, 2 << 16, 3 << 16, 4 << 16]);
    }

    #[test]
    fn stream_time_advances_by_whole_periods() {
        let mut desc = descriptor(Box::new(|_, _, _| CallbackResult::Continue));
        desc.sample_rate = 8;
        for _ in 0..4 {
            desc.tick_stream_time();
        }
        assert_eq!(desc.stream_time, 2.0);
    }
}
