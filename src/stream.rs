//! The stream controller: owns one host, at most one open stream and the worker thread that
//! services it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::descriptor::{Direction, StreamDescriptor, StreamState};
use crate::error::{Error, ErrorKind, Result};
use crate::host::null;
use crate::platform::{host_from_id, Host, HostId, StreamHandle, ALL_HOSTS};
use crate::traits::{HostTrait, ProbeRequest, StreamTrait};
use crate::{
    CallbackInfo, CallbackResult, Data, DeviceInfo, ErrorCallback, StreamConfig, StreamFlags,
    StreamParameters,
};

/// How long the worker sleeps between checks while the stream is not running.
const IDLE_SLEEP: Duration = Duration::from_millis(50);

const WORKER_NAME: &str = "rtstream-worker";

struct Engine {
    desc: StreamDescriptor,
    handle: StreamHandle,
}

/// State shared between the controller and the worker thread.
struct Shared {
    engine: Mutex<Engine>,
    /// Fixed for the lifetime of the open stream.
    error_callback: Option<Mutex<ErrorCallback>>,
    /// Set while an error is being delivered. Errors raised meanwhile, by the resulting teardown
    /// or by the other thread, are dropped instead of reported again.
    reporting: AtomicBool,
    show_warnings: Arc<AtomicBool>,
}

impl Shared {
    /// Delivers an error of any kind to the error callback. Returns the error back if there is
    /// none.
    fn deliver(&self, error: Error) -> Option<Error> {
        let Some(callback) = self.error_callback.as_ref() else {
            return Some(error);
        };
        if self.reporting.swap(true, Ordering::AcqRel) {
            debug!("dropping an error raised while reporting another: {error}");
            return None;
        }
        if !error.kind().is_warning() {
            let mut engine = self.engine.lock();
            let Engine { desc, handle } = &mut *engine;
            if desc.state != StreamState::Stopped {
                if let Err(err) = handle.abort(desc) {
                    debug!("error aborting the stream after an error: {err}");
                }
            }
        }
        let mut callback = callback.lock();
        (*callback)(error);
        self.reporting.store(false, Ordering::Release);
        None
    }
}

struct OpenStream {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    is_running: Arc<AtomicBool>,
}

/// The controller of one realtime audio stream.
///
/// A `Stream` owns a [`Host`] and at most one open stream on it. The stream's data callback runs
/// on a dedicated worker thread, once per period. Control operations follow the state machine
/// `Closed -> Stopped <-> Running`; calling `start` on a running stream, or `stop`/`abort` on a
/// stopped one, is only a warning.
///
/// Errors raised by an operation are returned from it unless an error callback was passed to
/// [`open`](Stream::open), in which case they are delivered to that callback and the operation
/// returns `Ok(())`.
pub struct Stream {
    host: Host,
    show_warnings: Arc<AtomicBool>,
    open: Option<OpenStream>,
}

impl Stream {
    /// Creates a controller on the given host, or on the first compiled host that has at least
    /// one device.
    ///
    /// The dummy host is always compiled and tried last, so this never fails. A host that cannot
    /// be initialised falls back to the same search, with a warning.
    pub fn new(host: Option<HostId>) -> Self {
        if let Some(id) = host {
            match host_from_id(id) {
                Ok(host) => return Stream::with_host(host),
                Err(err) => warn!("the {id} host is unavailable ({err}), searching for another"),
            }
        }

        let mut fallback = None;
        for id in ALL_HOSTS {
            match host_from_id(*id) {
                Ok(host) if host.device_count() > 0 => {
                    debug!("selected the {id} host");
                    return Stream::with_host(host);
                }
                Ok(host) => fallback = Some(host),
                Err(err) => debug!("the {id} host is unavailable: {err}"),
            }
        }
        let host = fallback.unwrap_or_else(|| null::Host::new().into());
        debug!("no host has devices, using the {} host", host.id());
        Stream::with_host(host)
    }

    /// Creates a controller on an explicitly constructed host.
    pub fn with_host(host: Host) -> Self {
        Stream {
            host,
            show_warnings: Arc::new(AtomicBool::new(true)),
            open: None,
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host.id()
    }

    /// The number of devices the host currently sees.
    pub fn device_count(&self) -> usize {
        self.host.device_count()
    }

    pub fn device_info(&self, index: usize) -> Result<DeviceInfo> {
        let count = self.host.device_count();
        if index >= count {
            return Err(Error::new(
                ErrorKind::InvalidUse,
                format!("device index {index} is out of range, {count} devices found"),
            ));
        }
        self.host.device_info(index)
    }

    pub fn default_output_device(&self) -> usize {
        self.host.default_output_device()
    }

    pub fn default_input_device(&self) -> usize {
        self.host.default_input_device()
    }

    /// Enables or disables printing warnings through the `log` crate. Enabled by default.
    ///
    /// Only warnings that are not delivered to an error callback are printed.
    pub fn show_warnings(&mut self, show: bool) {
        self.show_warnings.store(show, Ordering::Relaxed);
    }

    /// Opens a stream.
    ///
    /// `config.buffer_frames` and `config.options.number_of_buffers` are updated with the values
    /// the host negotiated. The stream is left stopped.
    pub fn open<D>(
        &mut self,
        config: &mut StreamConfig,
        data_callback: D,
        error_callback: Option<ErrorCallback>,
    ) -> Result<()>
    where
        D: FnMut(Option<&mut Data>, Option<&Data>, &CallbackInfo) -> CallbackResult
            + Send
            + 'static,
    {
        if self.open.is_some() {
            return self.report(Error::invalid_use("a stream is already open"));
        }
        if let Err(err) = self.validate(config) {
            return self.report(err);
        }

        let mut desc = StreamDescriptor::new(config.sample_rate, Box::new(data_callback));
        let mut options = config.options.clone();
        let mut handle = None;
        let directions = [
            (Direction::Output, config.output),
            (Direction::Input, config.input),
        ];
        for (direction, params) in directions {
            let Some(params) = params else {
                continue;
            };
            let request = ProbeRequest {
                device: params.device_id,
                direction,
                channels: params.channels,
                first_channel: params.first_channel,
                sample_rate: config.sample_rate,
                format: config.format,
                buffer_frames: config.buffer_frames,
            };
            if let Err(err) = self
                .host
                .probe_open(&mut handle, &mut desc, &request, &mut options)
            {
                // Never leave a half-open duplex stream behind.
                if let Some(handle) = handle.as_mut() {
                    handle.close(&mut desc);
                }
                desc.release();
                return self.report(err);
            }
        }
        let Some(handle) = handle else {
            return self.report(Error::system("the host did not open a stream"));
        };

        config.buffer_frames = desc.buffer_frames;
        config.options.number_of_buffers = options.number_of_buffers;
        let realtime = options.flags.contains(StreamFlags::SCHEDULE_REALTIME);
        let frames = desc.buffer_frames as u32;
        let sample_rate = desc.sample_rate;

        let is_running = desc.callback_info.is_running.clone();
        is_running.store(true, Ordering::Release);
        let shared = Arc::new(Shared {
            engine: Mutex::new(Engine { desc, handle }),
            error_callback: error_callback.map(Mutex::new),
            reporting: AtomicBool::new(false),
            show_warnings: self.show_warnings.clone(),
        });

        let worker = {
            let shared = shared.clone();
            let is_running = is_running.clone();
            thread::Builder::new()
                .name(WORKER_NAME.to_owned())
                .spawn(move || {
                    let _priority = realtime.then(|| promote_worker(frames, sample_rate));
                    run_worker(&shared, &is_running);
                })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                is_running.store(false, Ordering::Release);
                let mut engine = shared.engine.lock();
                let Engine { desc, handle } = &mut *engine;
                handle.close(desc);
                desc.release();
                drop(engine);
                return self.report(Error::new(
                    ErrorKind::ThreadError,
                    format!("unable to spawn the stream worker: {err}"),
                ));
            }
        };

        debug!(
            "stream opened on the {} host: {} Hz, {} frames x {} buffers",
            self.host.id(),
            sample_rate,
            frames,
            config.options.number_of_buffers
        );
        self.open = Some(OpenStream {
            shared,
            worker: Some(worker),
            is_running,
        });
        Ok(())
    }

    fn validate(&self, config: &StreamConfig) -> Result<()> {
        if config.output.is_none() && config.input.is_none() {
            return Err(Error::invalid_use(
                "an output or input direction must be requested",
            ));
        }
        let count = self.host.device_count();
        for (name, params) in [("output", config.output), ("input", config.input)] {
            let Some(StreamParameters {
                device_id,
                channels,
                ..
            }) = params
            else {
                continue;
            };
            if channels == 0 {
                return Err(Error::invalid_use(format!(
                    "the {name} direction requests zero channels"
                )));
            }
            if device_id >= count {
                return Err(Error::invalid_use(format!(
                    "{name} device index {device_id} is out of range, {count} devices found"
                )));
            }
        }
        Ok(())
    }

    /// Stops the worker, releases the host's stream and frees every buffer.
    pub fn close(&mut self) {
        let Some(mut open) = self.open.take() else {
            let _ = self.report(Error::warning("no open stream to close"));
            return;
        };
        open.is_running.store(false, Ordering::Release);
        if let Some(worker) = open.worker.take() {
            if worker.join().is_err() {
                error!("the stream worker panicked");
            }
        }

        let mut engine = open.shared.engine.lock();
        let Engine { desc, handle } = &mut *engine;
        handle.close(desc);
        desc.release();
        debug!("stream closed");
    }

    /// Starts the hardware and the data callback.
    pub fn start(&mut self) -> Result<()> {
        let result = self.with_engine(|engine| {
            let Engine { desc, handle } = engine;
            if desc.state == StreamState::Running {
                return Err(Error::warning("the stream is already running"));
            }
            handle.start(desc)
        });
        if result.is_ok() {
            debug!("stream started");
        }
        self.finish(result)
    }

    /// Lets the queued output play out, then stops the stream.
    ///
    /// Blocks until the worker thread has flushed the output.
    pub fn stop(&mut self) -> Result<()> {
        let drained = self.with_engine(|engine| {
            let Engine { desc, handle } = engine;
            if desc.state == StreamState::Stopped {
                return Err(Error::warning("the stream is already stopped"));
            }
            Ok(handle.request_drain(desc))
        });
        let done = match drained {
            Ok(done) => done,
            Err(err) => return self.report(err),
        };
        // The worker owns the engine while draining; wait with the lock released.
        if let Some(done) = done {
            let _ = done.recv();
        }

        let result = self.with_engine(|engine| {
            let Engine { desc, handle } = engine;
            if desc.state == StreamState::Stopped {
                return Ok(());
            }
            handle.stop(desc)
        });
        if result.is_ok() {
            debug!("stream stopped");
        }
        self.finish(result)
    }

    /// Stops the stream immediately, discarding queued output.
    pub fn abort(&mut self) -> Result<()> {
        let result = self.with_engine(|engine| {
            let Engine { desc, handle } = engine;
            if desc.state == StreamState::Stopped {
                return Err(Error::warning("the stream is already stopped"));
            }
            handle.abort(desc)
        });
        if result.is_ok() {
            debug!("stream aborted");
        }
        self.finish(result)
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.open.as_ref().is_some_and(|open| {
            open.shared.engine.lock().desc.state == StreamState::Running
        })
    }

    /// Seconds of audio the stream has processed since it was opened.
    pub fn stream_time(&self) -> Result<f64> {
        self.read_engine(|engine| engine.desc.stream_time)
    }

    pub fn set_stream_time(&mut self, seconds: f64) -> Result<()> {
        if seconds < 0.0 {
            let warning = Error::warning(format!("ignoring a negative stream time ({seconds})"));
            return match self.read_engine(|_| ()) {
                Ok(()) => self.report(warning),
                Err(err) => Err(err),
            };
        }
        self.with_engine(|engine| {
            engine.desc.stream_time = seconds;
            Ok(())
        })
    }

    /// The stream's latency in frames, summed over both directions.
    pub fn latency(&self) -> Result<usize> {
        self.read_engine(|engine| engine.handle.latency(&engine.desc))
    }

    pub fn sample_rate(&self) -> Result<u32> {
        self.read_engine(|engine| engine.desc.sample_rate)
    }

    fn read_engine<T>(&self, f: impl FnOnce(&Engine) -> T) -> Result<T> {
        let open = self.open.as_ref().ok_or_else(not_open)?;
        let engine = open.shared.engine.lock();
        Ok(f(&engine))
    }

    fn with_engine<T>(&self, f: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        let open = self.open.as_ref().ok_or_else(not_open)?;
        let mut engine = open.shared.engine.lock();
        f(&mut engine)
    }

    fn finish(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.report(err),
        }
    }

    /// Routes an error according to the propagation policy.
    ///
    /// With an error callback every error is delivered to it and `Ok(())` returned; non-warnings
    /// abort the stream first. Without one, warnings are logged and everything else returned.
    fn report(&self, error: Error) -> Result<()> {
        let error = match &self.open {
            Some(open) => match open.shared.deliver(error) {
                Some(error) => error,
                None => return Ok(()),
            },
            None => error,
        };
        if error.kind().is_warning() {
            if self.show_warnings.load(Ordering::Relaxed) {
                warn!("{}", error.message());
            }
            return Ok(());
        }
        Err(error)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.open.is_some() {
            self.close();
        }
    }
}

fn not_open() -> Error {
    Error::invalid_use("no stream is open")
}

/// The worker thread body: service one period at a time while the stream is open.
fn run_worker(shared: &Shared, is_running: &AtomicBool) {
    while is_running.load(Ordering::Acquire) {
        let mut engine = shared.engine.lock();
        if engine.desc.state != StreamState::Running {
            drop(engine);
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let Engine { desc, handle } = &mut *engine;
        if let Err(err) = handle.service_one_period(desc) {
            // The period is abandoned and the stream aborted; errors are never retried.
            if let Err(abort) = handle.abort(desc) {
                debug!("error aborting the stream after a failed period: {abort}");
            }
            drop(engine);
            match shared.deliver(err) {
                Some(err) if err.kind().is_warning() => {
                    if shared.show_warnings.load(Ordering::Relaxed) {
                        warn!("{}", err.message());
                    }
                }
                Some(err) => error!("stream aborted: {err}"),
                None => {}
            }
            continue;
        }
        MutexGuard::unlock_fair(engine);
    }
}

#[cfg(feature = "audio_thread_priority")]
struct RealtimePriority(Option<audio_thread_priority::RtPriorityHandle>);

#[cfg(feature = "audio_thread_priority")]
impl Drop for RealtimePriority {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            if let Err(err) = audio_thread_priority::demote_current_thread_from_real_time(handle) {
                warn!("failed to demote the stream worker from realtime priority: {err}");
            }
        }
    }
}

#[cfg(feature = "audio_thread_priority")]
fn promote_worker(frames: u32, sample_rate: u32) -> RealtimePriority {
    match audio_thread_priority::promote_current_thread_to_real_time(frames, sample_rate) {
        Ok(handle) => {
            debug!("stream worker promoted to realtime priority");
            RealtimePriority(Some(handle))
        }
        Err(err) => {
            warn!("failed to promote the stream worker to realtime priority: {err}");
            RealtimePriority(None)
        }
    }
}

#[cfg(not(feature = "audio_thread_priority"))]
fn promote_worker(_frames: u32, _sample_rate: u32) {
    warn!("realtime scheduling needs the `audio_thread_priority` feature");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{ManualClock, SampleFormat, VirtualDevice, VirtualHost};

    fn manual_stream() -> Stream {
        let host = VirtualHost::with_devices(VirtualDevice::defaults(), Arc::new(ManualClock::new()));
        Stream::with_host(host.into())
    }

    fn output_config() -> StreamConfig {
        StreamConfig {
            output: Some(StreamParameters {
                device_id: 0,
                channels: 2,
                first_channel: 0,
            }),
            format: SampleFormat::I16,
            sample_rate: 44100,
            buffer_frames: 512,
            ..StreamConfig::default()
        }
    }

    fn silence(_: Option<&mut Data>, _: Option<&Data>, _: &CallbackInfo) -> CallbackResult {
        CallbackResult::Continue
    }

    #[test]
    fn warnings_go_to_the_error_callback() {
        let mut stream = manual_stream();
        let (tx, rx) = mpsc::channel();
        let mut config = output_config();
        stream
            .open(
                &mut config,
                silence,
                Some(Box::new(move |err: Error| {
                    let _ = tx.send(err.kind());
                })),
            )
            .unwrap();

        stream.stop().unwrap();
        stream.abort().unwrap();
        assert_eq!(rx.try_recv(), Ok(ErrorKind::Warning));
        assert_eq!(rx.try_recv(), Ok(ErrorKind::Warning));

        // A second open is invalid use, delivered to the open stream's callback.
        stream.open(&mut output_config(), silence, None).unwrap();
        assert_eq!(rx.try_recv(), Ok(ErrorKind::InvalidUse));
        assert!(stream.is_open());
    }

    #[test]
    fn hidden_warnings_still_reach_the_error_callback() {
        let mut stream = manual_stream();
        stream.show_warnings(false);
        let (tx, rx) = mpsc::channel();
        stream
            .open(
                &mut output_config(),
                silence,
                Some(Box::new(move |err: Error| {
                    let _ = tx.send(err.kind());
                })),
            )
            .unwrap();

        stream.stop().unwrap();
        assert_eq!(rx.try_recv(), Ok(ErrorKind::Warning));

        // The worker sees the setting through the shared state.
        let shared = stream.open.as_ref().unwrap().shared.clone();
        assert!(!shared.show_warnings.load(Ordering::Relaxed));
        stream.show_warnings(true);
        assert!(shared.show_warnings.load(Ordering::Relaxed));
    }

    #[test]
    fn the_latch_drops_errors_raised_while_reporting() {
        let mut stream = manual_stream();
        stream
            .open(&mut output_config(), silence, Some(Box::new(|_| {})))
            .unwrap();
        let shared = stream.open.as_ref().unwrap().shared.clone();

        // The latch is checked before the callback lock, so a report racing a delivery in
        // progress returns instead of blocking.
        {
            let _delivering = shared.error_callback.as_ref().unwrap().lock();
            shared.reporting.store(true, Ordering::Release);
            assert!(shared.deliver(Error::system("nested")).is_none());
            shared.reporting.store(false, Ordering::Release);
        }

        stream.start().unwrap();
        assert!(stream.is_running());
        assert!(shared.deliver(Error::system("failed")).is_none());
        assert!(!stream.is_running());
        assert!(!shared.reporting.load(Ordering::Acquire));
    }

    #[test]
    fn without_a_callback_errors_are_returned() {
        let mut stream = manual_stream();
        let err = stream.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUse);
        assert!(stream.report(Error::warning("advice")).is_ok());
        assert_eq!(
            stream.report(Error::system("broken")).unwrap_err().kind(),
            ErrorKind::SystemError
        );
    }

    #[test]
    fn a_failed_open_registers_no_error_callback() {
        let mut stream = manual_stream();
        let mut config = output_config();
        config.sample_rate = 12345;
        let err = stream
            .open(&mut config, silence, Some(Box::new(|_| panic!("not registered"))))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert!(!stream.is_open());
    }
}
