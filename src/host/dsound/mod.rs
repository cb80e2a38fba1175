//! DirectSound ring hardware.
//!
//! Playback and capture drivers are enumerated separately and merged by description, so a sound
//! card with both directions appears as one device. Every stream direction gets its own
//! DirectSound object and one looping secondary (or capture) buffer.

use std::ffi::c_void;
use std::ptr;
use std::thread;
use std::time::Duration;

use log::debug;
use windows::core::{BOOL, GUID, PCWSTR};
use windows::Win32::Media::Audio::DirectSound::{
    DirectSoundCaptureCreate, DirectSoundCaptureEnumerateW, DirectSoundCreate,
    DirectSoundEnumerateW, IDirectSound, IDirectSoundBuffer, IDirectSoundCapture,
    IDirectSoundCaptureBuffer, DSBCAPS, DSBCAPS_GETCURRENTPOSITION2, DSBCAPS_GLOBALFOCUS,
    DSBCAPS_LOCHARDWARE, DSBCAPS_LOCSOFTWARE, DSBCAPS_PRIMARYBUFFER, DSBCAPS_STICKYFOCUS,
    DSBLOCK_ENTIREBUFFER, DSBPLAY_LOOPING, DSBUFFERDESC, DSCAPS, DSCAPS_PRIMARY16BIT,
    DSCAPS_PRIMARY8BIT, DSCAPS_PRIMARYSTEREO, DSCBCAPS, DSCBLOCK_ENTIREBUFFER, DSCBSTART_LOOPING,
    DSCBUFFERDESC, DSCCAPS, DSSCL_PRIORITY,
};
use windows::Win32::Media::Audio::{WAVEFORMATEX, WAVE_FORMAT_PCM};
use windows::Win32::UI::WindowsAndMessaging::{GetDesktopWindow, GetForegroundWindow};

use self::com::com_initialized;
use super::ring::sync::split_region;
use super::ring::{
    CaptureBuffer, Capabilities, Endpoint, HardwarePosition, PlaybackBuffer, RingBuffer,
    RingFormat, RingHardware, RingHost, RingStream,
};
use crate::error::{Error, ErrorKind, Result};
use crate::{NativeFormats, SampleFormat};

mod com;

/// A ring-buffer host on top of DirectSound.
pub type DirectSoundHost = RingHost<DirectSoundHardware>;

pub type DirectSoundStream = RingStream<DirectSoundHardware>;

pub use self::{DirectSoundHost as Host, DirectSoundStream as Stream};

pub(crate) fn open_host() -> Result<Host> {
    com_initialized()?;
    Ok(RingHost::from_hardware(DirectSoundHardware))
}

/// Rates checked against a playback driver's secondary buffer range.
const SAMPLE_RATES: [u32; 14] = [
    4000, 5512, 8000, 9600, 11025, 16000, 22050, 32000, 44100, 48000, 88200, 96000, 176400,
    192000,
];

// `DSCCAPS::dwFormats` bits: rate family, then mono/stereo, 8/16-bit.
const WAVE_FORMAT_11K: u32 = 0x0000_000f;
const WAVE_FORMAT_22K: u32 = 0x0000_00f0;
const WAVE_FORMAT_44K: u32 = 0x0000_0f00;
const WAVE_FORMAT_96K: u32 = 0x000f_0000;
const WAVE_FORMAT_STEREO: u32 = 0x000a_0aaa;
const WAVE_FORMAT_8BIT: u32 = 0x0003_0333;
const WAVE_FORMAT_16BIT: u32 = 0x000c_0ccc;

fn driver_error(context: &str, err: windows::core::Error) -> Error {
    Error::new(ErrorKind::DriverError, format!("{context}: {err}"))
}

fn guid_ptr(id: &Option<GUID>) -> Option<*const GUID> {
    id.as_ref().map(|guid| guid as *const GUID)
}

/// DirectSound drivers. Holds no state: every call enumerates afresh.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectSoundHardware;

struct Driver {
    id: Option<GUID>,
    name: String,
}

unsafe extern "system" fn collect_driver(
    guid: *mut GUID,
    description: PCWSTR,
    _module: PCWSTR,
    context: *mut c_void,
) -> BOOL {
    let drivers = &mut *(context as *mut Vec<Driver>);
    drivers.push(Driver {
        id: guid.as_ref().copied(),
        name: description.to_string().unwrap_or_default(),
    });
    BOOL::from(true)
}

fn playback_drivers() -> Result<Vec<Driver>> {
    let mut drivers = Vec::new();
    unsafe {
        DirectSoundEnumerateW(
            Some(collect_driver),
            Some(&mut drivers as *mut Vec<Driver> as *const c_void),
        )
    }
    .map_err(|e| driver_error("unable to enumerate output devices", e))?;
    Ok(drivers)
}

fn capture_drivers() -> Result<Vec<Driver>> {
    let mut drivers = Vec::new();
    unsafe {
        DirectSoundCaptureEnumerateW(
            Some(collect_driver),
            Some(&mut drivers as *mut Vec<Driver> as *const c_void),
        )
    }
    .map_err(|e| driver_error("unable to enumerate input devices", e))?;
    Ok(drivers)
}

fn create_device(id: &Option<GUID>) -> Result<IDirectSound> {
    let mut device = None;
    unsafe { DirectSoundCreate(guid_ptr(id), &mut device, None) }
        .map_err(|e| driver_error("unable to create the output object", e))?;
    device.ok_or_else(|| Error::new(ErrorKind::DriverError, "no output object was created"))
}

fn create_capture_device(id: &Option<GUID>) -> Result<IDirectSoundCapture> {
    let mut device = None;
    unsafe { DirectSoundCaptureCreate(guid_ptr(id), &mut device, None) }
        .map_err(|e| driver_error("unable to create the input object", e))?;
    device.ok_or_else(|| Error::new(ErrorKind::DriverError, "no input object was created"))
}

fn playback_capabilities(id: Option<GUID>) -> Result<Capabilities<Option<GUID>>> {
    let device = create_device(&id)?;
    let mut caps = DSCAPS {
        dwSize: std::mem::size_of::<DSCAPS>() as u32,
        ..Default::default()
    };
    unsafe { device.GetCaps(&mut caps) }
        .map_err(|e| driver_error("unable to query the output capabilities", e))?;

    let mut native_formats = NativeFormats::empty();
    if caps.dwFlags & DSCAPS_PRIMARY16BIT != 0 {
        native_formats |= NativeFormats::I16;
    }
    if caps.dwFlags & DSCAPS_PRIMARY8BIT != 0 {
        native_formats |= NativeFormats::I8;
    }
    Ok(Capabilities {
        id,
        max_channels: if caps.dwFlags & DSCAPS_PRIMARYSTEREO != 0 { 2 } else { 1 },
        sample_rates: SAMPLE_RATES
            .into_iter()
            .filter(|rate| {
                (caps.dwMinSecondarySampleRate..=caps.dwMaxSecondarySampleRate).contains(rate)
            })
            .collect(),
        native_formats,
        unsigned_8: true,
    })
}

fn capture_capabilities(id: Option<GUID>) -> Result<Capabilities<Option<GUID>>> {
    let device = create_capture_device(&id)?;
    let mut caps = DSCCAPS {
        dwSize: std::mem::size_of::<DSCCAPS>() as u32,
        ..Default::default()
    };
    unsafe { device.GetCaps(&mut caps) }
        .map_err(|e| driver_error("unable to query the input capabilities", e))?;

    let formats = caps.dwFormats;
    let mut native_formats = NativeFormats::empty();
    if formats & WAVE_FORMAT_16BIT != 0 {
        native_formats |= NativeFormats::I16;
    }
    if formats & WAVE_FORMAT_8BIT != 0 {
        native_formats |= NativeFormats::I8;
    }
    let sample_rates = [
        (WAVE_FORMAT_11K, 11025),
        (WAVE_FORMAT_22K, 22050),
        (WAVE_FORMAT_44K, 44100),
        (WAVE_FORMAT_96K, 96000),
    ]
    .into_iter()
    .filter(|(mask, _)| formats & mask != 0)
    .map(|(_, rate)| rate)
    .collect();
    let max_channels = if caps.dwChannels >= 2 && formats & WAVE_FORMAT_STEREO != 0 {
        2
    } else {
        1
    };
    Ok(Capabilities {
        id,
        max_channels,
        sample_rates,
        native_formats,
        unsigned_8: true,
    })
}

fn wave_format(format: &RingFormat) -> Result<WAVEFORMATEX> {
    let bits = match format.format {
        SampleFormat::I8 => 8,
        SampleFormat::I16 => 16,
        other => {
            return Err(Error::new(
                ErrorKind::DriverError,
                format!("DirectSound buffers cannot hold {other} samples"),
            ))
        }
    };
    let block_align = format.bytes_per_frame() as u16;
    Ok(WAVEFORMATEX {
        wFormatTag: WAVE_FORMAT_PCM as u16,
        nChannels: format.channels as u16,
        nSamplesPerSec: format.sample_rate,
        nAvgBytesPerSec: format.sample_rate * block_align as u32,
        nBlockAlign: block_align,
        wBitsPerSample: bits,
        cbSize: 0,
    })
}

/// A region of a locked DirectSound buffer.
struct Locked {
    first: *mut c_void,
    first_len: u32,
    second: *mut c_void,
    second_len: u32,
}

impl Locked {
    fn new() -> Self {
        Locked {
            first: ptr::null_mut(),
            first_len: 0,
            second: ptr::null_mut(),
            second_len: 0,
        }
    }

    /// # Safety
    ///
    /// The buffer must still be locked.
    unsafe fn regions(&mut self) -> [&mut [u8]; 2] {
        [
            region(self.first, self.first_len),
            region(self.second, self.second_len),
        ]
    }
}

unsafe fn region<'a>(ptr: *mut c_void, len: u32) -> &'a mut [u8] {
    if ptr.is_null() {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(ptr as *mut u8, len as usize)
    }
}

fn check_regions(locked: &Locked, offset: usize, len: usize, size: usize) -> Result<()> {
    let [first, second] = split_region(offset, len, size);
    if locked.first_len as usize != first.len() || locked.second_len as usize != second.len() {
        return Err(Error::new(
            ErrorKind::DriverError,
            format!(
                "locked {} + {} bytes, expected {} + {}",
                locked.first_len,
                locked.second_len,
                first.len(),
                second.len()
            ),
        ));
    }
    Ok(())
}

/// A looping DirectSound secondary buffer.
pub struct DirectSoundPlayback {
    // Kept alive for as long as its buffer.
    _device: IDirectSound,
    buffer: IDirectSoundBuffer,
    size: usize,
}

// DirectSound objects are free threaded.
unsafe impl Send for DirectSoundPlayback {}

impl DirectSoundPlayback {
    fn lock(&mut self, offset: usize, len: usize, flags: u32) -> Result<Locked> {
        let mut locked = Locked::new();
        unsafe {
            self.buffer.Lock(
                offset as u32,
                len as u32,
                &mut locked.first,
                &mut locked.first_len,
                Some(&mut locked.second),
                Some(&mut locked.second_len),
                flags,
            )
        }
        .map_err(|e| driver_error("unable to lock the output buffer", e))?;
        Ok(locked)
    }

    fn unlock(&mut self, locked: Locked) -> Result<()> {
        unsafe {
            self.buffer.Unlock(
                locked.first,
                locked.first_len,
                Some(locked.second),
                locked.second_len,
            )
        }
        .map_err(|e| driver_error("unable to unlock the output buffer", e))
    }
}

impl RingBuffer for DirectSoundPlayback {
    fn size(&self) -> usize {
        self.size
    }

    fn position(&mut self) -> Result<HardwarePosition> {
        let (mut current, mut safe) = (0u32, 0u32);
        unsafe {
            self.buffer
                .GetCurrentPosition(Some(&mut current), Some(&mut safe))
        }
        .map_err(|e| driver_error("unable to get the output position", e))?;
        Ok(HardwarePosition {
            current: current as usize,
            safe: safe as usize,
        })
    }

    fn start(&mut self) -> Result<()> {
        unsafe { self.buffer.Play(0, 0, DSBPLAY_LOOPING) }
            .map_err(|e| driver_error("unable to start the output buffer", e))
    }

    fn halt(&mut self) -> Result<()> {
        unsafe { self.buffer.Stop() }
            .map_err(|e| driver_error("unable to stop the output buffer", e))?;
        unsafe { self.buffer.SetCurrentPosition(0) }
            .map_err(|e| driver_error("unable to rewind the output buffer", e))
    }

    fn fill(&mut self, byte: u8) -> Result<()> {
        let mut locked = self.lock(0, 0, DSBLOCK_ENTIREBUFFER)?;
        for region in unsafe { locked.regions() } {
            region.fill(byte);
        }
        self.unlock(locked)
    }
}

impl PlaybackBuffer for DirectSoundPlayback {
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mut locked = self.lock(offset, data.len(), 0)?;
        let checked = check_regions(&locked, offset, data.len(), self.size);
        if checked.is_ok() {
            let [first, second] = unsafe { locked.regions() };
            let split = first.len();
            first.copy_from_slice(&data[..split]);
            second.copy_from_slice(&data[split..]);
        }
        self.unlock(locked)?;
        checked
    }
}

/// A looping DirectSound capture buffer.
pub struct DirectSoundCapture {
    _device: IDirectSoundCapture,
    buffer: IDirectSoundCaptureBuffer,
    size: usize,
}

unsafe impl Send for DirectSoundCapture {}

impl DirectSoundCapture {
    fn lock(&mut self, offset: usize, len: usize, flags: u32) -> Result<Locked> {
        let mut locked = Locked::new();
        unsafe {
            self.buffer.Lock(
                offset as u32,
                len as u32,
                &mut locked.first,
                &mut locked.first_len,
                Some(&mut locked.second),
                Some(&mut locked.second_len),
                flags,
            )
        }
        .map_err(|e| driver_error("unable to lock the input buffer", e))?;
        Ok(locked)
    }

    fn unlock(&mut self, locked: Locked) -> Result<()> {
        unsafe {
            self.buffer.Unlock(
                locked.first,
                locked.first_len,
                Some(locked.second),
                locked.second_len,
            )
        }
        .map_err(|e| driver_error("unable to unlock the input buffer", e))
    }
}

impl RingBuffer for DirectSoundCapture {
    fn size(&self) -> usize {
        self.size
    }

    fn position(&mut self) -> Result<HardwarePosition> {
        let (mut current, mut safe) = (0u32, 0u32);
        unsafe {
            self.buffer
                .GetCurrentPosition(Some(&mut current), Some(&mut safe))
        }
        .map_err(|e| driver_error("unable to get the input position", e))?;
        Ok(HardwarePosition {
            current: current as usize,
            safe: safe as usize,
        })
    }

    fn start(&mut self) -> Result<()> {
        unsafe { self.buffer.Start(DSCBSTART_LOOPING) }
            .map_err(|e| driver_error("unable to start the input buffer", e))
    }

    fn halt(&mut self) -> Result<()> {
        unsafe { self.buffer.Stop() }.map_err(|e| driver_error("unable to stop the input buffer", e))
    }

    fn fill(&mut self, byte: u8) -> Result<()> {
        let mut locked = self.lock(0, 0, DSCBLOCK_ENTIREBUFFER)?;
        for region in unsafe { locked.regions() } {
            region.fill(byte);
        }
        self.unlock(locked)
    }
}

impl CaptureBuffer for DirectSoundCapture {
    fn read(&mut self, offset: usize, data: &mut [u8]) -> Result<()> {
        let mut locked = self.lock(offset, data.len(), 0)?;
        let checked = check_regions(&locked, offset, data.len(), self.size);
        if checked.is_ok() {
            let [first, second] = unsafe { locked.regions() };
            let split = first.len();
            data[..split].copy_from_slice(first);
            data[split..].copy_from_slice(second);
        }
        self.unlock(locked)?;
        checked
    }
}

impl RingHardware for DirectSoundHardware {
    type EndpointId = Option<GUID>;
    type Playback = DirectSoundPlayback;
    type Capture = DirectSoundCapture;

    fn endpoints(&self) -> Result<Vec<Endpoint<Option<GUID>>>> {
        com_initialized()?;
        let mut endpoints: Vec<Endpoint<Option<GUID>>> = Vec::new();

        for (index, driver) in playback_drivers()?.into_iter().enumerate() {
            let playback = playback_capabilities(driver.id)
                .inspect_err(|err| debug!("skipping output caps of ({}): {err}", driver.name))
                .ok();
            endpoints.push(Endpoint {
                name: driver.name,
                playback,
                capture: None,
                // The first driver is the primary sound driver.
                is_default_output: index == 0,
                is_default_input: false,
            });
        }

        for (index, driver) in capture_drivers()?.into_iter().enumerate() {
            let capture = capture_capabilities(driver.id)
                .inspect_err(|err| debug!("skipping input caps of ({}): {err}", driver.name))
                .ok();
            match endpoints
                .iter_mut()
                .find(|endpoint| endpoint.name == driver.name && endpoint.capture.is_none())
            {
                Some(endpoint) => {
                    endpoint.capture = capture;
                    endpoint.is_default_input = index == 0;
                }
                None => endpoints.push(Endpoint {
                    name: driver.name,
                    playback: None,
                    capture,
                    is_default_output: false,
                    is_default_input: index == 0,
                }),
            }
        }
        Ok(endpoints)
    }

    fn create_playback(
        &self,
        id: &Option<GUID>,
        format: &RingFormat,
        buffer_bytes: usize,
    ) -> Result<DirectSoundPlayback> {
        com_initialized()?;
        let mut wave = wave_format(format)?;
        let device = create_device(id)?;

        let mut window = unsafe { GetForegroundWindow() };
        if window.is_invalid() {
            window = unsafe { GetDesktopWindow() };
        }
        unsafe { device.SetCooperativeLevel(window, DSSCL_PRIORITY) }
            .map_err(|e| driver_error("unable to set the cooperative level", e))?;

        // The primary buffer decides the format the mixer runs at.
        let primary_desc = DSBUFFERDESC {
            dwSize: std::mem::size_of::<DSBUFFERDESC>() as u32,
            dwFlags: DSBCAPS_PRIMARYBUFFER,
            ..Default::default()
        };
        let mut primary = None;
        unsafe { device.CreateSoundBuffer(&primary_desc, &mut primary, None) }
            .map_err(|e| driver_error("unable to access the primary buffer", e))?;
        if let Some(primary) = primary {
            unsafe { primary.SetFormat(&wave) }
                .map_err(|e| driver_error("unable to set the primary buffer format", e))?;
        }

        let mut desc = DSBUFFERDESC {
            dwSize: std::mem::size_of::<DSBUFFERDESC>() as u32,
            dwFlags: DSBCAPS_STICKYFOCUS
                | DSBCAPS_GLOBALFOCUS
                | DSBCAPS_GETCURRENTPOSITION2
                | DSBCAPS_LOCHARDWARE,
            dwBufferBytes: buffer_bytes as u32,
            lpwfxFormat: &mut wave,
            ..Default::default()
        };
        let mut buffer = None;
        if unsafe { device.CreateSoundBuffer(&desc, &mut buffer, None) }.is_err() {
            desc.dwFlags = (desc.dwFlags & !DSBCAPS_LOCHARDWARE) | DSBCAPS_LOCSOFTWARE;
            unsafe { device.CreateSoundBuffer(&desc, &mut buffer, None) }
                .map_err(|e| driver_error("unable to create the output buffer", e))?;
        }
        let buffer = buffer
            .ok_or_else(|| Error::new(ErrorKind::DriverError, "no output buffer was created"))?;

        let mut caps = DSBCAPS {
            dwSize: std::mem::size_of::<DSBCAPS>() as u32,
            ..Default::default()
        };
        unsafe { buffer.GetCaps(&mut caps) }
            .map_err(|e| driver_error("unable to query the output buffer", e))?;

        Ok(DirectSoundPlayback {
            _device: device,
            buffer,
            size: caps.dwBufferBytes as usize,
        })
    }

    fn create_capture(
        &self,
        id: &Option<GUID>,
        format: &RingFormat,
        buffer_bytes: usize,
    ) -> Result<DirectSoundCapture> {
        com_initialized()?;
        let mut wave = wave_format(format)?;
        let device = create_capture_device(id)?;

        let desc = DSCBUFFERDESC {
            dwSize: std::mem::size_of::<DSCBUFFERDESC>() as u32,
            dwBufferBytes: buffer_bytes as u32,
            lpwfxFormat: &mut wave,
            ..Default::default()
        };
        let mut buffer = None;
        unsafe { device.CreateCaptureBuffer(&desc, &mut buffer, None) }
            .map_err(|e| driver_error("unable to create the input buffer", e))?;
        let buffer = buffer
            .ok_or_else(|| Error::new(ErrorKind::DriverError, "no input buffer was created"))?;

        let mut caps = DSCBCAPS {
            dwSize: std::mem::size_of::<DSCBCAPS>() as u32,
            ..Default::default()
        };
        unsafe { buffer.GetCaps(&mut caps) }
            .map_err(|e| driver_error("unable to query the input buffer", e))?;

        Ok(DirectSoundCapture {
            _device: device,
            buffer,
            size: caps.dwBufferBytes as usize,
        })
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
