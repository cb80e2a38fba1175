#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rtstream::{
    CallbackInfo, CallbackResult, Clock, Data, ManualClock, SampleFormat, Stream, StreamConfig,
    StreamParameters, VirtualDevice, VirtualHardware, VirtualHost,
};

/// A controller on the default virtual devices, with time that only moves when the stream waits.
pub fn manual_stream() -> (Stream, VirtualHardware) {
    stream_on(VirtualDevice::defaults(), Arc::new(ManualClock::new()))
}

pub fn stream_on(devices: Vec<VirtualDevice>, clock: Arc<dyn Clock>) -> (Stream, VirtualHardware) {
    let host = VirtualHost::with_devices(devices, clock);
    let hardware = host.hardware().clone();
    let mut stream = Stream::with_host(host.into());
    stream.show_warnings(false);
    (stream, hardware)
}

pub fn params(device_id: usize, channels: usize) -> Option<StreamParameters> {
    Some(StreamParameters {
        device_id,
        channels,
        first_channel: 0,
    })
}

/// 16-bit stereo output on the virtual output device.
pub fn output_config() -> StreamConfig {
    StreamConfig {
        output: params(0, 2),
        format: SampleFormat::I16,
        sample_rate: 44100,
        buffer_frames: 512,
        ..StreamConfig::default()
    }
}

pub fn silence(_: Option<&mut Data>, _: Option<&Data>, _: &CallbackInfo) -> CallbackResult {
    CallbackResult::Continue
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn samples_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
        .collect()
}

/// A clock that never moves, so hardware cursors stay put.
#[derive(Debug, Default)]
pub struct FrozenClock;

impl Clock for FrozenClock {
    fn now(&self) -> Duration {
        Duration::ZERO
    }

    fn sleep(&self, _duration: Duration) {
        thread::yield_now();
    }
}
