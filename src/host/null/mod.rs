//! The dummy host: no devices, so every open fails. Always compiled and always tried last.

use std::sync::mpsc::Receiver;

use crate::descriptor::StreamDescriptor;
use crate::error::{Error, ErrorKind, Result};
use crate::traits::{HostTrait, ProbeRequest, StreamTrait};
use crate::{DeviceInfo, StreamOptions};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Host;

/// A stream of the dummy host. No value of this type can exist.
#[derive(Debug)]
pub enum Stream {}

impl Host {
    pub fn new() -> Self {
        Host
    }
}

pub(crate) fn open_host() -> Result<Host> {
    Ok(Host)
}

fn no_devices() -> Error {
    Error::new(ErrorKind::NoDevicesFound, "the dummy host has no devices")
}

impl HostTrait for Host {
    type Stream = Stream;

    fn device_count(&self) -> usize {
        0
    }

    fn device_info(&self, _index: usize) -> Result<DeviceInfo> {
        Err(no_devices())
    }

    fn probe_open(
        &self,
        _handle: &mut Option<Stream>,
        _desc: &mut StreamDescriptor,
        _request: &ProbeRequest,
        _options: &mut StreamOptions,
    ) -> Result<()> {
        Err(no_devices())
    }
}

impl StreamTrait for Stream {
    fn start(&mut self, _desc: &mut StreamDescriptor) -> Result<()> {
        match *self {}
    }

    fn request_drain(&mut self, _desc: &mut StreamDescriptor) -> Option<Receiver<()>> {
        match *self {}
    }

    fn stop(&mut self, _desc: &mut StreamDescriptor) -> Result<()> {
        match *self {}
    }

    fn abort(&mut self, _desc: &mut StreamDescriptor) -> Result<()> {
        match *self {}
    }

    fn close(&mut self, _desc: &mut StreamDescriptor) {
        match *self {}
    }

    fn service_one_period(&mut self, _desc: &mut StreamDescriptor) -> Result<()> {
        match *self {}
    }

    fn latency(&self, _desc: &StreamDescriptor) -> usize {
        match *self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Direction;
    use crate::{CallbackResult, SampleFormat};

    #[test]
    fn every_open_fails() {
        let host = Host::new();
        assert_eq!(host.device_count(), 0);
        assert_eq!(host.device_info(0).unwrap_err().kind(), ErrorKind::NoDevicesFound);

        let mut desc = StreamDescriptor::new(44100, Box::new(|_, _, _| CallbackResult::Continue));
        let mut handle = None;
        let request = ProbeRequest {
            device: 0,
            direction: Direction::Output,
            channels: 2,
            first_channel: 0,
            sample_rate: 44100,
            format: SampleFormat::F32,
            buffer_frames: 256,
        };
        let err = host
            .probe_open(&mut handle, &mut desc, &request, &mut StreamOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDevicesFound);
        assert!(handle.is_none());
    }
}
