use std::sync::mpsc::{self, Receiver, SyncSender};
use std::time::Duration;

use log::{debug, trace};

use super::hardware::{CaptureBuffer, PlaybackBuffer, RingBuffer, RingHardware};
use super::sync;
use crate::conversions::{signed_to_unsigned_8, unsigned_to_signed_8};
use crate::descriptor::{Direction, StreamDescriptor, StreamMode, StreamState};
use crate::error::{Error, ErrorKind, Result};
use crate::traits::StreamTrait;
use crate::{CallbackResult, StreamStatus};

/// One direction of an open ring-buffer stream.
pub(crate) struct RingLeg<B> {
    buffer: B,
    lead_time: usize,
    bytes_per_frame: usize,
    unsigned_8: bool,
    /// Software position in the hardware buffer.
    cursor: usize,
    xrun: bool,
}

impl<B: RingBuffer> RingLeg<B> {
    pub(crate) fn new(buffer: B, lead_time: usize, bytes_per_frame: usize, unsigned_8: bool) -> Self {
        RingLeg {
            buffer,
            lead_time,
            bytes_per_frame,
            unsigned_8,
            cursor: 0,
            xrun: false,
        }
    }

    fn silence(&self) -> u8 {
        if self.unsigned_8 {
            0x80
        } else {
            0
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.buffer.halt()?;
        let silence = self.silence();
        self.buffer.fill(silence)?;
        self.cursor = 0;
        Ok(())
    }

    fn latency_frames(&self) -> usize {
        self.lead_time / self.bytes_per_frame
    }
}

/// The host handle of a stream on ring-buffer hardware.
pub struct RingStream<H: RingHardware> {
    hardware: H,
    playback: Option<RingLeg<H::Playback>>,
    capture: Option<RingLeg<H::Capture>>,
    drain_counter: usize,
    /// The drain was requested by the data callback, so nobody waits on `drain_signal`.
    internal_drain: bool,
    drain_signal: Option<SyncSender<()>>,
    buffers_rolling: bool,
    duplex_preroll: usize,
}

impl<H: RingHardware> RingStream<H> {
    pub(crate) fn new(hardware: H) -> Self {
        RingStream {
            hardware,
            playback: None,
            capture: None,
            drain_counter: 0,
            internal_drain: false,
            drain_signal: None,
            buffers_rolling: false,
            duplex_preroll: 0,
        }
    }

    pub(crate) fn install_playback(&mut self, leg: RingLeg<H::Playback>) {
        self.playback = Some(leg);
    }

    pub(crate) fn install_capture(&mut self, leg: RingLeg<H::Capture>) {
        self.capture = Some(leg);
    }

    /// Size in bytes of the hardware buffer of one direction.
    pub fn buffer_size(&self, direction: Direction) -> Option<usize> {
        match direction {
            Direction::Output => self.playback.as_ref().map(|leg| leg.buffer.size()),
            Direction::Input => self.capture.as_ref().map(|leg| leg.buffer.size()),
        }
    }

    /// The pointer lead time of one direction, in bytes.
    pub fn lead_time(&self, direction: Direction) -> Option<usize> {
        match direction {
            Direction::Output => self.playback.as_ref().map(|leg| leg.lead_time),
            Direction::Input => self.capture.as_ref().map(|leg| leg.lead_time),
        }
    }

    fn take_status(&mut self) -> StreamStatus {
        let mut status = StreamStatus::empty();
        if let Some(playback) = self.playback.as_mut() {
            if std::mem::take(&mut playback.xrun) {
                status |= StreamStatus::OUTPUT_UNDERFLOW;
            }
        }
        if let Some(capture) = self.capture.as_mut() {
            if std::mem::take(&mut capture.xrun) {
                status |= StreamStatus::INPUT_OVERFLOW;
            }
        }
        status
    }

    /// Places the software cursors relative to the hardware on the first period after `start`.
    fn synchronize_start(&mut self, mode: StreamMode) -> Result<()> {
        match (mode, self.playback.as_mut(), self.capture.as_mut()) {
            (StreamMode::Duplex, Some(playback), Some(capture)) => {
                // The two devices start asynchronously. Wait until both cursors have moved.
                let start_write = playback.buffer.position()?.safe;
                let start_read = capture.buffer.position()?.safe;
                let mut waited = Duration::ZERO;
                let (safe_write, safe_read) = loop {
                    let safe_write = playback.buffer.position()?.safe;
                    let safe_read = capture.buffer.position()?.safe;
                    if safe_write != start_write && safe_read != start_read {
                        break (safe_write, safe_read);
                    }
                    if waited >= sync::STARTUP_TIMEOUT {
                        return Err(Error::new(
                            ErrorKind::DriverError,
                            "the duplex hardware cursors did not start moving",
                        ));
                    }
                    self.hardware.sleep(sync::STARTUP_POLL);
                    waited += sync::STARTUP_POLL;
                };
                playback.cursor = (safe_write + playback.lead_time) % playback.buffer.size();
                capture.cursor = safe_read;
                debug!(
                    "duplex cursors synchronized: write {} read {}",
                    playback.cursor, capture.cursor
                );
            }
            (StreamMode::Output, Some(playback), _) => {
                let safe_write = playback.buffer.position()?.safe;
                playback.cursor = (safe_write + playback.lead_time) % playback.buffer.size();
            }
            _ => {}
        }
        Ok(())
    }

    fn write_output(&mut self, desc: &mut StreamDescriptor) -> Result<()> {
        let Some(playback) = self.playback.as_mut() else {
            return Ok(());
        };
        let bytes_per_second = playback.bytes_per_frame * desc.sample_rate as usize;
        let bytes = desc
            .leg(Direction::Output)
            .map(|leg| leg.device_period_bytes(desc.buffer_frames))
            .ok_or_else(|| Error::system("the output direction has no buffers"))?;

        let size = playback.buffer.size();
        let mut next = playback.cursor;
        let mut stall = sync::StallWatch::default();
        let position = loop {
            let position = playback.buffer.position()?;
            // Software may write up to `lead` once the region is clear of the hardware.
            let mut lead = position.safe + playback.lead_time;
            if lead > size {
                lead -= size;
            }
            if lead < next {
                lead += size;
            }
            let end_write = next + bytes;
            if lead >= end_write {
                break position;
            }
            if !desc.is_running() {
                return Ok(());
            }
            let delay = sync::pacing_delay(end_write - lead, bytes_per_second);
            if stall.waited(position.safe, delay) {
                return Err(Error::new(
                    ErrorKind::DriverError,
                    "the playback cursor stopped moving",
                ));
            }
            self.hardware.sleep(delay);
        };

        let silence = self.drain_counter > 1;
        let buffer = desc
            .output_period(silence)
            .ok_or_else(|| Error::system("the output direction has no buffers"))?;
        if playback.unsigned_8 {
            signed_to_unsigned_8(buffer);
        }

        if sync::pointer_between(next, position.safe, position.current, size)
            || sync::pointer_between(next + bytes, position.safe, position.current, size)
        {
            playback.xrun = true;
            next = sync::wrap(
                (position.safe + playback.lead_time) as isize - bytes as isize,
                size,
            );
            trace!("output underflow, write cursor moved to {next}");
        }

        playback.buffer.write(next, buffer)?;
        playback.cursor = (next + bytes) % size;
        Ok(())
    }

    fn read_input(&mut self, desc: &mut StreamDescriptor) -> Result<()> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(());
        };
        let bytes = desc
            .leg(Direction::Input)
            .map(|leg| leg.device_period_bytes(desc.buffer_frames))
            .ok_or_else(|| Error::system("the input direction has no buffers"))?;
        let bytes_per_second = capture.bytes_per_frame * desc.sample_rate as usize;
        let size = capture.buffer.size();

        let mut next = capture.cursor;
        let mut safe = capture.buffer.position()?.safe;
        if safe < next {
            safe += size;
        }
        let end_read = next + bytes;

        if desc.mode == StreamMode::Duplex {
            // Waiting here would push the output cursor into the forbidden zone, so move the
            // read cursor back instead.
            if safe < end_read {
                if self.duplex_preroll == 0 {
                    capture.xrun = true;
                    next = sync::overflow_resync(safe, end_read, bytes, size);
                    trace!("input overflow, read cursor moved to {next}");
                } else {
                    next = sync::wrap(safe as isize - bytes as isize, size);
                }
            }
        } else {
            let mut stall = sync::StallWatch::default();
            while safe < end_read && desc.is_running() {
                let delay = sync::pacing_delay(end_read - safe, bytes_per_second);
                if stall.waited(safe, delay) {
                    return Err(Error::new(
                        ErrorKind::DriverError,
                        "the capture cursor stopped moving",
                    ));
                }
                self.hardware.sleep(delay);
                safe = capture.buffer.position()?.safe;
                if safe < next {
                    safe += size;
                }
            }
        }

        let silence = capture.silence();
        let target = desc
            .input_target()
            .ok_or_else(|| Error::system("the input direction has no buffers"))?;
        if self.duplex_preroll == 0 {
            capture.buffer.read(next, target)?;
        } else {
            target.fill(silence);
            self.duplex_preroll = self.duplex_preroll.saturating_sub(bytes);
        }
        capture.cursor = (next + bytes) % size;

        if capture.unsigned_8 {
            unsigned_to_signed_8(target);
        }
        desc.finish_input();
        Ok(())
    }
}

impl<H: RingHardware> StreamTrait for RingStream<H> {
    fn start(&mut self, desc: &mut StreamDescriptor) -> Result<()> {
        self.buffers_rolling = false;
        self.duplex_preroll = match (desc.mode, self.capture.as_ref()) {
            (StreamMode::Duplex, Some(capture)) => {
                sync::duplex_preroll_bytes(desc.sample_rate, capture.bytes_per_frame)
            }
            _ => 0,
        };

        if let Some(playback) = self.playback.as_mut() {
            playback.xrun = false;
            playback.buffer.start()?;
        }
        if let Some(capture) = self.capture.as_mut() {
            capture.xrun = false;
            if let Err(err) = capture.buffer.start() {
                if let Some(playback) = self.playback.as_mut() {
                    let _ = playback.reset();
                }
                return Err(err);
            }
        }

        self.drain_counter = 0;
        self.internal_drain = false;
        self.drain_signal = None;
        desc.state = StreamState::Running;
        Ok(())
    }

    fn request_drain(&mut self, desc: &mut StreamDescriptor) -> Option<Receiver<()>> {
        if !desc.mode.has(Direction::Output) || self.drain_counter != 0 {
            return None;
        }
        let (signal, done) = mpsc::sync_channel(1);
        self.drain_signal = Some(signal);
        self.drain_counter = 2;
        Some(done)
    }

    fn stop(&mut self, desc: &mut StreamDescriptor) -> Result<()> {
        desc.state = StreamState::Stopped;
        // Dropping the sender releases a caller still waiting for the drain.
        self.drain_signal = None;
        self.buffers_rolling = false;

        let playback = self.playback.as_mut().map_or(Ok(()), RingLeg::reset);
        let capture = self.capture.as_mut().map_or(Ok(()), RingLeg::reset);
        playback.and(capture)
    }

    fn abort(&mut self, desc: &mut StreamDescriptor) -> Result<()> {
        self.drain_counter = 2;
        self.stop(desc)
    }

    fn close(&mut self, _desc: &mut StreamDescriptor) {
        if let Some(mut playback) = self.playback.take() {
            if let Err(err) = playback.buffer.halt() {
                debug!("error halting the playback buffer on close: {err}");
            }
        }
        if let Some(mut capture) = self.capture.take() {
            if let Err(err) = capture.buffer.halt() {
                debug!("error halting the capture buffer on close: {err}");
            }
        }
        self.drain_signal = None;
    }

    fn service_one_period(&mut self, desc: &mut StreamDescriptor) -> Result<()> {
        if desc.state != StreamState::Running {
            return Ok(());
        }

        if self.drain_counter > desc.number_of_buffers + 2 {
            desc.state = StreamState::Stopping;
            if self.internal_drain {
                debug!("drain requested by the data callback complete");
                return self.stop(desc);
            }
            if let Some(signal) = self.drain_signal.take() {
                let _ = signal.try_send(());
            }
            return Ok(());
        }

        if self.drain_counter == 0 {
            let status = self.take_status();
            match desc.invoke_callback(status) {
                CallbackResult::Continue => {}
                CallbackResult::Drain if desc.mode.has(Direction::Output) => {
                    self.drain_counter = 1;
                    self.internal_drain = true;
                }
                CallbackResult::Drain => {
                    // Nothing is queued on an input-only stream.
                    desc.state = StreamState::Stopping;
                    return self.stop(desc);
                }
                CallbackResult::Abort => {
                    desc.state = StreamState::Stopping;
                    debug!("abort requested by the data callback");
                    return self.abort(desc);
                }
            }
        }

        if !self.buffers_rolling {
            self.synchronize_start(desc.mode)?;
            self.buffers_rolling = true;
        }

        if desc.mode.has(Direction::Output) {
            self.write_output(desc)?;
            if self.drain_counter > 0 {
                self.drain_counter += 1;
                desc.tick_stream_time();
                return Ok(());
            }
        }

        if desc.mode.has(Direction::Input) {
            self.read_input(desc)?;
        }

        desc.tick_stream_time();
        Ok(())
    }

    fn latency(&self, _desc: &StreamDescriptor) -> usize {
        self.playback.as_ref().map_or(0, RingLeg::latency_frames)
            + self.capture.as_ref().map_or(0, RingLeg::latency_frames)
    }
}
