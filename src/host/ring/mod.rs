//! A host for sound subsystems that expose each device as a looping circular buffer.
//!
//! Software keeps its own cursor into every hardware buffer and advances it by exactly one period
//! per serviced period, staying a fixed "lead time" ahead of the hardware's safe position on
//! playback and behind it on capture. Hardware specifics live behind [`RingHardware`].

use log::debug;

use crate::descriptor::{DeviceSide, Direction, StreamDescriptor, StreamLeg};
use crate::error::{Error, ErrorKind, Result};
use crate::traits::{HostTrait, ProbeRequest};
use crate::{DeviceInfo, SampleFormat, StreamFlags, StreamOptions};

pub use self::hardware::{
    CaptureBuffer, Capabilities, Endpoint, HardwarePosition, PlaybackBuffer, RingBuffer,
    RingFormat, RingHardware,
};
pub use self::stream::RingStream;
use self::stream::RingLeg;

pub mod hardware;
mod stream;
pub mod sync;

/// A host driving [`RingHardware`].
#[derive(Clone, Debug)]
pub struct RingHost<H> {
    hardware: H,
}

impl<H: RingHardware> RingHost<H> {
    pub fn from_hardware(hardware: H) -> Self {
        RingHost { hardware }
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    fn endpoint(&self, index: usize) -> Result<Endpoint<H::EndpointId>> {
        let mut endpoints = self.hardware.endpoints()?;
        if index >= endpoints.len() {
            return Err(Error::new(
                ErrorKind::InvalidDevice,
                format!("device ID {index} is invalid"),
            ));
        }
        Ok(endpoints.swap_remove(index))
    }
}

impl<H: RingHardware> HostTrait for RingHost<H> {
    type Stream = RingStream<H>;

    fn device_count(&self) -> usize {
        match self.hardware.endpoints() {
            Ok(endpoints) => endpoints.len(),
            Err(err) => {
                debug!("device enumeration failed: {err}");
                0
            }
        }
    }

    fn device_info(&self, index: usize) -> Result<DeviceInfo> {
        let endpoint = self.endpoint(index)?;
        let mut info = DeviceInfo {
            name: endpoint.name,
            probed: true,
            is_default_output: endpoint.is_default_output,
            is_default_input: endpoint.is_default_input,
            ..DeviceInfo::default()
        };
        for caps in [&endpoint.playback, &endpoint.capture].into_iter().flatten() {
            info.sample_rates.extend_from_slice(&caps.sample_rates);
            info.native_formats |= caps.native_formats;
        }
        if let Some(playback) = &endpoint.playback {
            info.output_channels = playback.max_channels;
        }
        if let Some(capture) = &endpoint.capture {
            info.input_channels = capture.max_channels;
        }
        if info.output_channels > 0 && info.input_channels > 0 {
            info.duplex_channels = info.output_channels.min(info.input_channels);
        }
        info.normalize_sample_rates();
        Ok(info)
    }

    fn default_output_device(&self) -> usize {
        self.hardware
            .endpoints()
            .ok()
            .and_then(|endpoints| endpoints.iter().position(|e| e.is_default_output))
            .unwrap_or(0)
    }

    fn default_input_device(&self) -> usize {
        self.hardware
            .endpoints()
            .ok()
            .and_then(|endpoints| endpoints.iter().position(|e| e.is_default_input))
            .unwrap_or(0)
    }

    fn probe_open(
        &self,
        handle: &mut Option<RingStream<H>>,
        desc: &mut StreamDescriptor,
        request: &ProbeRequest,
        options: &mut StreamOptions,
    ) -> Result<()> {
        let endpoint = self.endpoint(request.device)?;
        let caps = match request.direction {
            Direction::Output => endpoint.playback.as_ref(),
            Direction::Input => endpoint.capture.as_ref(),
        }
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidDevice,
                format!(
                    "device ({}) does not support {} streams",
                    endpoint.name,
                    match request.direction {
                        Direction::Output => "output",
                        Direction::Input => "input",
                    }
                ),
            )
        })?;

        let device_channels = request.channels + request.first_channel;
        if device_channels > caps.max_channels {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!(
                    "device ({}) supports {} channels, {} + {} first channel requested",
                    endpoint.name, caps.max_channels, request.channels, request.first_channel
                ),
            ));
        }
        if !caps.sample_rates.contains(&request.sample_rate) {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!(
                    "device ({}) does not support a sample rate of {}",
                    endpoint.name, request.sample_rate
                ),
            ));
        }
        let device_format = caps
            .native_formats
            .best_match(request.format)
            .ok_or_else(|| {
                Error::system(format!("device ({}) reports no native formats", endpoint.name))
            })?;

        let buffer_count = sync::buffer_count(options.number_of_buffers, options.flags);
        let buffer_frames = if desc.buffer_frames > 0 {
            desc.buffer_frames
        } else {
            sync::buffer_frames(request.buffer_frames)
        };
        let format = RingFormat {
            channels: device_channels,
            sample_rate: request.sample_rate,
            format: device_format,
        };
        let bytes_per_frame = format.bytes_per_frame();
        let lead_time = sync::lead_time_bytes(buffer_count, buffer_frames, bytes_per_frame);
        let buffer_bytes = sync::ring_buffer_size(lead_time);
        let unsigned_8 = caps.unsigned_8 && device_format == SampleFormat::I8;
        let silence = if unsigned_8 { 0x80 } else { 0 };

        debug!(
            "opening {:?} on ({}): {} channels {} {} Hz, {} frames x {} buffers, {} byte ring",
            request.direction,
            endpoint.name,
            device_channels,
            device_format,
            request.sample_rate,
            buffer_frames,
            buffer_count,
            buffer_bytes
        );

        // The descriptor and handle are only touched once the native buffer exists. A failure
        // drops the buffer and leaves both as they were.
        let user_interleaved = !options.flags.contains(StreamFlags::NONINTERLEAVED);
        let device = DeviceSide {
            channels: device_channels,
            format: device_format,
            interleaved: true,
            byte_swap: false,
        };
        let leg = StreamLeg::negotiate(request, user_interleaved, device, buffer_frames);

        match request.direction {
            Direction::Output => {
                let mut buffer = self
                    .hardware
                    .create_playback(&caps.id, &format, buffer_bytes)?;
                buffer.fill(silence)?;
                attach_leg(desc, Direction::Output, leg, buffer_frames)?;
                handle
                    .get_or_insert_with(|| RingStream::new(self.hardware.clone()))
                    .install_playback(RingLeg::new(buffer, lead_time, bytes_per_frame, unsigned_8));
            }
            Direction::Input => {
                let mut buffer = self
                    .hardware
                    .create_capture(&caps.id, &format, buffer_bytes)?;
                buffer.fill(silence)?;
                attach_leg(desc, Direction::Input, leg, buffer_frames)?;
                handle
                    .get_or_insert_with(|| RingStream::new(self.hardware.clone()))
                    .install_capture(RingLeg::new(buffer, lead_time, bytes_per_frame, unsigned_8));
            }
        }

        desc.number_of_buffers = buffer_count;
        options.number_of_buffers = buffer_count;
        Ok(())
    }
}

/// Installs a negotiated direction, restoring the period size if the descriptor rejects it.
fn attach_leg(
    desc: &mut StreamDescriptor,
    direction: Direction,
    leg: StreamLeg,
    buffer_frames: usize,
) -> Result<()> {
    let previous = desc.buffer_frames;
    desc.buffer_frames = buffer_frames;
    desc.attach_leg(direction, leg)
        .inspect_err(|_| desc.buffer_frames = previous)
}
