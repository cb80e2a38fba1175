//! Platform-specific items.
//!
//! This module contains the platform's dynamically dispatched `Host` type and the `StreamHandle`
//! of the streams it opens. These types are what the [`Stream`](crate::Stream) controller holds,
//! so one controller can drive any host compiled for the platform.

#[doc(inline)]
pub use self::platform_impl::*;

// A macro to assist with implementing a platform's dynamically dispatched `Host` type.
//
// For example the invocation `impl_platform_host!(Virtual virtual_device "virtual" "Virtual",
// Dummy null "dummy" "Dummy")` should expand to:
//
// ```
// pub enum HostId {
//     Virtual,
//     Dummy,
// }
//
// pub struct Host(HostInner);
//
// enum HostInner {
//     Virtual(crate::host::virtual_device::Host),
//     Dummy(crate::host::null::Host),
// }
// ```
//
// And so on for `StreamHandle` and all the necessary trait implementations.
macro_rules! impl_platform_host {
    ($($HostVariant:ident $host_mod:ident $host_name:literal $display_name:literal),*) => {
        /// All hosts compiled for this platform, in the order a controller tries them. The dummy
        /// host is always last.
        pub const ALL_HOSTS: &[HostId] = &[
            $(
                HostId::$HostVariant,
            )*
        ];

        /// The platform's dynamically dispatched **Host** type.
        ///
        /// An instance of this **Host** type may represent any of the hosts compiled for the
        /// platform. It may be constructed via the **host_from_id** function, or converted from a
        /// concrete host such as a [`VirtualHost`](crate::VirtualHost).
        #[derive(Clone, Debug)]
        pub struct Host(HostInner);

        /// The handle of a stream opened through the dynamically dispatched **Host** type.
        pub struct StreamHandle(StreamInner);

        /// Unique identifier for the hosts compiled for this platform.
        #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
        pub enum HostId {
            $(
                $HostVariant,
            )*
        }

        #[derive(Clone, Debug)]
        enum HostInner {
            $(
                $HostVariant(crate::host::$host_mod::Host),
            )*
        }

        enum StreamInner {
            $(
                $HostVariant(crate::host::$host_mod::Stream),
            )*
        }

        impl HostId {
            /// A short lowercase identifier.
            pub fn name(&self) -> &'static str {
                match self {
                    $(
                        HostId::$HostVariant => $host_name,
                    )*
                }
            }

            pub fn display_name(&self) -> &'static str {
                match self {
                    $(
                        HostId::$HostVariant => $display_name,
                    )*
                }
            }

            /// The compiled host with the given short identifier.
            pub fn from_name(name: &str) -> Option<HostId> {
                ALL_HOSTS.iter().copied().find(|id| id.name() == name)
            }
        }

        impl std::fmt::Display for HostId {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.display_name())
            }
        }

        impl Host {
            /// The unique identifier associated with this host.
            pub fn id(&self) -> HostId {
                match self.0 {
                    $(
                        HostInner::$HostVariant(_) => HostId::$HostVariant,
                    )*
                }
            }
        }

        impl crate::traits::HostTrait for Host {
            type Stream = StreamHandle;

            fn device_count(&self) -> usize {
                match self.0 {
                    $(
                        HostInner::$HostVariant(ref h) => {
                            crate::traits::HostTrait::device_count(h)
                        }
                    )*
                }
            }

            fn device_info(&self, index: usize) -> crate::Result<crate::DeviceInfo> {
                match self.0 {
                    $(
                        HostInner::$HostVariant(ref h) => {
                            crate::traits::HostTrait::device_info(h, index)
                        }
                    )*
                }
            }

            fn default_output_device(&self) -> usize {
                match self.0 {
                    $(
                        HostInner::$HostVariant(ref h) => {
                            crate::traits::HostTrait::default_output_device(h)
                        }
                    )*
                }
            }

            fn default_input_device(&self) -> usize {
                match self.0 {
                    $(
                        HostInner::$HostVariant(ref h) => {
                            crate::traits::HostTrait::default_input_device(h)
                        }
                    )*
                }
            }

            fn probe_open(
                &self,
                handle: &mut Option<StreamHandle>,
                desc: &mut crate::descriptor::StreamDescriptor,
                request: &crate::traits::ProbeRequest,
                options: &mut crate::StreamOptions,
            ) -> crate::Result<()> {
                match self.0 {
                    $(
                        HostInner::$HostVariant(ref h) => {
                            let mut inner = match handle.take() {
                                Some(StreamHandle(StreamInner::$HostVariant(s))) => Some(s),
                                Some(other) => {
                                    *handle = Some(other);
                                    return Err(crate::Error::invalid_use(
                                        "the stream was opened by another host",
                                    ));
                                }
                                None => None,
                            };
                            let result =
                                crate::traits::HostTrait::probe_open(h, &mut inner, desc, request, options);
                            *handle = inner.map(|s| StreamHandle(StreamInner::$HostVariant(s)));
                            result
                        }
                    )*
                }
            }
        }

        impl crate::traits::StreamTrait for StreamHandle {
            fn start(
                &mut self,
                desc: &mut crate::descriptor::StreamDescriptor,
            ) -> crate::Result<()> {
                match self.0 {
                    $(
                        StreamInner::$HostVariant(ref mut s) => {
                            crate::traits::StreamTrait::start(s, desc)
                        }
                    )*
                }
            }

            fn request_drain(
                &mut self,
                desc: &mut crate::descriptor::StreamDescriptor,
            ) -> Option<std::sync::mpsc::Receiver<()>> {
                match self.0 {
                    $(
                        StreamInner::$HostVariant(ref mut s) => {
                            crate::traits::StreamTrait::request_drain(s, desc)
                        }
                    )*
                }
            }

            fn stop(
                &mut self,
                desc: &mut crate::descriptor::StreamDescriptor,
            ) -> crate::Result<()> {
                match self.0 {
                    $(
                        StreamInner::$HostVariant(ref mut s) => {
                            crate::traits::StreamTrait::stop(s, desc)
                        }
                    )*
                }
            }

            fn abort(
                &mut self,
                desc: &mut crate::descriptor::StreamDescriptor,
            ) -> crate::Result<()> {
                match self.0 {
                    $(
                        StreamInner::$HostVariant(ref mut s) => {
                            crate::traits::StreamTrait::abort(s, desc)
                        }
                    )*
                }
            }

            fn close(&mut self, desc: &mut crate::descriptor::StreamDescriptor) {
                match self.0 {
                    $(
                        StreamInner::$HostVariant(ref mut s) => {
                            crate::traits::StreamTrait::close(s, desc)
                        }
                    )*
                }
            }

            fn service_one_period(
                &mut self,
                desc: &mut crate::descriptor::StreamDescriptor,
            ) -> crate::Result<()> {
                match self.0 {
                    $(
                        StreamInner::$HostVariant(ref mut s) => {
                            crate::traits::StreamTrait::service_one_period(s, desc)
                        }
                    )*
                }
            }

            fn latency(&self, desc: &crate::descriptor::StreamDescriptor) -> usize {
                match self.0 {
                    $(
                        StreamInner::$HostVariant(ref s) => {
                            crate::traits::StreamTrait::latency(s, desc)
                        }
                    )*
                }
            }
        }

        $(
            impl From<crate::host::$host_mod::Host> for Host {
                fn from(h: crate::host::$host_mod::Host) -> Self {
                    Host(HostInner::$HostVariant(h))
                }
            }

            impl From<crate::host::$host_mod::Stream> for StreamHandle {
                fn from(s: crate::host::$host_mod::Stream) -> Self {
                    StreamHandle(StreamInner::$HostVariant(s))
                }
            }
        )*

        /// Initialises the host with the given identifier.
        pub fn host_from_id(id: HostId) -> crate::Result<Host> {
            match id {
                $(
                    HostId::$HostVariant => {
                        crate::host::$host_mod::open_host()
                            .map(HostInner::$HostVariant)
                            .map(Host)
                    }
                )*
            }
        }
    };
}

#[cfg(windows)]
mod platform_impl {
    pub use crate::host::dsound::{DirectSoundHardware, DirectSoundHost, DirectSoundStream};

    impl_platform_host!(
        DirectSound dsound "ds" "DirectSound",
        Virtual virtual_device "virtual" "Virtual",
        Dummy null "dummy" "Dummy"
    );
}

#[cfg(not(windows))]
mod platform_impl {
    impl_platform_host!(
        Virtual virtual_device "virtual" "Virtual",
        Dummy null "dummy" "Dummy"
    );
}

/// The hosts compiled for this platform, in the order a controller tries them.
pub fn compiled_hosts() -> Vec<HostId> {
    ALL_HOSTS.to_vec()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::descriptor::{Direction, StreamDescriptor};
    use crate::traits::{HostTrait, ProbeRequest, StreamTrait};
    use crate::{
        CallbackResult, ErrorKind, ManualClock, SampleFormat, StreamOptions, VirtualDevice,
        VirtualHost,
    };

    #[test]
    fn dummy_host_is_last() {
        let hosts = compiled_hosts();
        assert_eq!(hosts.last(), Some(&HostId::Dummy));
        assert!(hosts.contains(&HostId::Virtual));
    }

    #[test]
    fn names_round_trip() {
        for id in ALL_HOSTS {
            assert_eq!(HostId::from_name(id.name()), Some(*id));
            assert_eq!(id.to_string(), id.display_name());
        }
        assert_eq!(HostId::from_name("unknown"), None);
        assert_eq!(HostId::Virtual.name(), "virtual");
        assert_eq!(HostId::Dummy.display_name(), "Dummy");
    }

    #[test]
    fn dispatches_to_the_wrapped_host() -> crate::Result<()> {
        let virtual_host: Host = VirtualHost::new().into();
        assert_eq!(virtual_host.id(), HostId::Virtual);
        assert_eq!(virtual_host.device_count(), 3);
        assert_eq!(virtual_host.device_info(2)?.duplex_channels, 2);

        let dummy = host_from_id(HostId::Dummy)?;
        assert_eq!(dummy.id(), HostId::Dummy);
        assert_eq!(dummy.device_count(), 0);
        Ok(())
    }

    #[test]
    fn handles_stay_with_their_host() {
        let host: Host =
            VirtualHost::with_devices(VirtualDevice::defaults(), Arc::new(ManualClock::new()))
                .into();
        let mut desc = StreamDescriptor::new(44100, Box::new(|_, _, _| CallbackResult::Continue));
        let mut handle = None;
        let mut options = StreamOptions::default();
        let mut request = ProbeRequest {
            device: 2,
            direction: Direction::Output,
            channels: 2,
            first_channel: 0,
            sample_rate: 44100,
            format: SampleFormat::I16,
            buffer_frames: 512,
        };
        host.probe_open(&mut handle, &mut desc, &request, &mut options)
            .unwrap();
        assert!(handle.is_some());

        request.direction = Direction::Input;
        let dummy: Host = crate::host::null::Host::new().into();
        let err = dummy
            .probe_open(&mut handle, &mut desc, &request, &mut options)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUse);
        assert!(handle.is_some());

        host.probe_open(&mut handle, &mut desc, &request, &mut options)
            .unwrap();
        assert_eq!(handle.as_ref().map(|h| h.latency(&desc)), Some(2 * 1536));
    }
}
