//! Host implementations: the dummy host, the ring-buffer backend and the hardware it runs on.

#[cfg(windows)]
pub mod dsound;
pub mod null;
pub mod ring;
pub mod virtual_device;
