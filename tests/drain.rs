mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use common::{manual_stream, output_config, params, stream_on, wait_until, FrozenClock};
use rtstream::{CallbackInfo, CallbackResult, Data, ErrorKind, VirtualDevice};

fn counting(
    calls: &Arc<AtomicUsize>,
    finish_at: usize,
    result: CallbackResult,
) -> impl FnMut(Option<&mut Data>, Option<&Data>, &CallbackInfo) -> CallbackResult + Send + 'static {
    let calls = calls.clone();
    move |output, _, _| {
        if let Some(samples) = output.and_then(|data| data.as_slice_mut::<i16>()) {
            samples.fill(1234);
        }
        if calls.fetch_add(1, Ordering::SeqCst) + 1 == finish_at {
            result
        } else {
            CallbackResult::Continue
        }
    }
}

#[test]
fn stop_plays_out_the_queued_periods() -> anyhow::Result<()> {
    let (mut stream, hardware) = manual_stream();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = output_config();
    stream.open(&mut config, counting(&calls, 0, CallbackResult::Continue), None)?;
    let buffers = config.options.number_of_buffers;

    stream.start()?;
    wait_until("ten periods ran", || calls.load(Ordering::SeqCst) >= 10);
    stream.stop()?;
    assert!(!stream.is_running());

    let stats = hardware.stats();
    let calls = calls.load(Ordering::SeqCst);
    assert_eq!(stats.silent_writes, buffers + 1);
    assert_eq!(stats.writes - stats.silent_writes, calls);
    assert!(calls >= buffers);

    // Nothing more is written once stop returns.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hardware.stats().writes, stats.writes);
    Ok(())
}

#[test]
fn callback_drain_stops_by_itself() -> anyhow::Result<()> {
    let (mut stream, hardware) = manual_stream();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = output_config();
    stream.open(&mut config, counting(&calls, 5, CallbackResult::Drain), None)?;
    let buffers = config.options.number_of_buffers;

    stream.start()?;
    wait_until("the stream stops", || !stream.is_running());

    let stats = hardware.stats();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(stats.writes, 5 + buffers + 1);
    assert_eq!(stats.silent_writes, buffers + 1);

    // The stream restarts normally after draining.
    stream.start()?;
    wait_until("the callback runs again", || calls.load(Ordering::SeqCst) > 5);
    stream.abort()?;
    Ok(())
}

#[test]
fn callback_abort_discards_the_period() -> anyhow::Result<()> {
    let (mut stream, hardware) = manual_stream();
    let calls = Arc::new(AtomicUsize::new(0));
    stream.open(
        &mut output_config(),
        counting(&calls, 1, CallbackResult::Abort),
        None,
    )?;
    stream.start()?;
    wait_until("the stream stops", || !stream.is_running());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(hardware.stats().writes, 0);
    Ok(())
}

#[test]
fn input_streams_deliver_captured_audio() -> anyhow::Result<()> {
    let (mut stream, hardware) = manual_stream();
    let (tx, rx) = mpsc::channel();
    let mut config = output_config();
    config.output = None;
    config.input = params(1, 2);
    stream.open(
        &mut config,
        move |output, input, info| {
            assert!(output.is_none());
            let peak = input
                .and_then(|data| data.as_slice::<i16>())
                .map(|samples| samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0))
                .unwrap_or(0);
            let _ = tx.send((peak, info.status));
            CallbackResult::Continue
        },
        None,
    )?;
    stream.start()?;
    let received: Vec<_> = (0..6)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)))
        .collect::<Result<_, _>>()?;
    stream.stop()?;

    assert!(received[1..].iter().all(|(peak, _)| *peak > 10000));
    assert!(received.iter().all(|(_, status)| status.is_empty()));
    assert!(hardware.stats().reads >= 5);
    Ok(())
}

#[test]
fn duplex_streams_fake_silence_while_prerolling() -> anyhow::Result<()> {
    let (mut stream, hardware) = manual_stream();
    let (tx, rx) = mpsc::channel();
    let mut config = output_config();
    config.output = params(2, 2);
    config.input = params(2, 2);
    stream.open(
        &mut config,
        move |_, input, _| {
            let silent = input
                .and_then(|data| data.as_slice::<i16>())
                .is_some_and(|samples| samples.iter().all(|s| *s == 0));
            let _ = tx.send(silent);
            CallbackResult::Continue
        },
        None,
    )?;
    stream.start()?;
    // 22050 frames of preroll at 512 frames per period, plus the first callback.
    let periods = 22050usize.div_ceil(512) + 1;
    let silent: Vec<bool> = (0..periods + 4)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)))
        .collect::<Result<_, _>>()?;
    stream.abort()?;

    assert!(silent[..periods].iter().all(|s| *s));
    assert!(silent[periods..].iter().all(|s| !*s));
    assert_eq!(hardware.stats().bytes_read % (512 * 4), 0);
    Ok(())
}

#[test]
fn realtime_errors_reach_the_error_callback() -> anyhow::Result<()> {
    let (mut stream, _) = stream_on(VirtualDevice::defaults(), Arc::new(FrozenClock));
    let (tx, rx) = mpsc::channel();
    let mut config = output_config();
    config.output = params(2, 2);
    config.input = params(2, 2);
    stream.open(
        &mut config,
        |_, _, _| CallbackResult::Continue,
        Some(Box::new(move |err: rtstream::Error| {
            let _ = tx.send(err.kind());
        })),
    )?;
    stream.start()?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, ErrorKind::DriverError);
    wait_until("the stream is aborted", || !stream.is_running());
    Ok(())
}

#[test]
fn realtime_errors_without_a_callback_abort_the_stream() -> anyhow::Result<()> {
    let (mut stream, _) = stream_on(VirtualDevice::defaults(), Arc::new(FrozenClock));
    let mut config = output_config();
    config.output = params(2, 2);
    config.input = params(2, 2);
    stream.open(&mut config, |_, _, _| CallbackResult::Continue, None)?;
    stream.start()?;
    wait_until("the stream is aborted", || !stream.is_running());
    assert!(stream.is_open());
    stream.close();
    Ok(())
}

#[test]
fn stalled_output_hardware_aborts_the_stream() -> anyhow::Result<()> {
    let (mut stream, hardware) = stream_on(VirtualDevice::defaults(), Arc::new(FrozenClock));
    let (tx, rx) = mpsc::channel();
    stream.open(
        &mut output_config(),
        |_, _, _| CallbackResult::Continue,
        Some(Box::new(move |err: rtstream::Error| {
            let _ = tx.send(err.kind());
        })),
    )?;
    stream.start()?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, ErrorKind::DriverError);
    wait_until("the stream is aborted", || !stream.is_running());
    assert_eq!(hardware.stats().writes, 0);
    stream.close();
    assert!(!stream.is_open());
    Ok(())
}

#[test]
fn float_streams_drain_with_true_silence() -> anyhow::Result<()> {
    let (mut stream, hardware) = manual_stream();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut config = output_config();
    config.format = rtstream::SampleFormat::F32;
    stream.open(
        &mut config,
        move |output, _, _| {
            if let Some(samples) = output.and_then(|data| data.as_slice_mut::<f32>()) {
                samples.fill(0.25);
            }
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                CallbackResult::Drain
            } else {
                CallbackResult::Continue
            }
        },
        None,
    )?;
    let buffers = config.options.number_of_buffers;
    stream.start()?;
    wait_until("the stream stops", || !stream.is_running());

    let stats = hardware.stats();
    assert_eq!(stats.writes, 3 + buffers + 1);
    assert_eq!(stats.silent_writes, buffers + 1);
    assert!(stats.last_write.iter().all(|byte| *byte == 0));
    Ok(())
}
