//! The sample conversion kernel.
//!
//! Converts blocks of samples between the user-facing layout of a stream and the layout a device
//! runs with: sample encoding, channel count, first-channel placement and interleaved/planar
//! arrangement. Everything here is a pure function over byte buffers; a stream computes its
//! [`ConversionInfo`] once when it is opened and reuses it for every period.

use crate::descriptor::Direction;
use crate::samples_formats::{Packed24, SampleFormat};

/// Describes how one direction of a stream maps user samples onto device samples.
///
/// Jumps and offsets are measured in samples, not bytes. The sample for channel `ch` of frame
/// `frame` is read from `frame * in_jump + in_offset[ch]` and written to
/// `frame * out_jump + out_offset[ch]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversionInfo {
    pub channels: usize,
    pub in_jump: usize,
    pub out_jump: usize,
    pub in_format: Option<SampleFormat>,
    pub out_format: Option<SampleFormat>,
    pub in_offset: Vec<usize>,
    pub out_offset: Vec<usize>,
}

/// The negotiated parameters of one stream direction that a [`ConversionInfo`] is derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelLayout {
    pub direction: Direction,
    pub user_channels: usize,
    pub device_channels: usize,
    pub user_format: SampleFormat,
    pub device_format: SampleFormat,
    pub user_interleaved: bool,
    pub device_interleaved: bool,
    pub first_channel: usize,
    pub buffer_frames: usize,
}

impl ConversionInfo {
    /// Computes the strides and per-channel offsets for one direction.
    ///
    /// Output streams convert the user buffer into the device buffer, input streams the other way
    /// around. The first-channel offset is always applied to the device side.
    pub fn new(layout: &ChannelLayout) -> Self {
        let frames = layout.buffer_frames;
        let (mut in_jump, mut out_jump, in_format, out_format) = match layout.direction {
            Direction::Output => (
                layout.user_channels,
                layout.device_channels,
                layout.user_format,
                layout.device_format,
            ),
            Direction::Input => (
                layout.device_channels,
                layout.user_channels,
                layout.device_format,
                layout.user_format,
            ),
        };
        let channels = in_jump.min(out_jump);

        let mut in_offset = Vec::with_capacity(channels);
        let mut out_offset = Vec::with_capacity(channels);
        if layout.user_interleaved != layout.device_interleaved {
            // Exactly one side is planar: it advances one sample per frame inside its channel
            // plane while the interleaved side keeps its frame stride.
            let in_is_planar = match layout.direction {
                Direction::Output => layout.device_interleaved,
                Direction::Input => layout.user_interleaved,
            };
            for k in 0..channels {
                if in_is_planar {
                    in_offset.push(k * frames);
                    out_offset.push(k);
                } else {
                    in_offset.push(k);
                    out_offset.push(k * frames);
                }
            }
            if in_is_planar {
                in_jump = 1;
            } else {
                out_jump = 1;
            }
        } else if layout.user_interleaved {
            in_offset.extend(0..channels);
            out_offset.extend(0..channels);
        } else {
            in_offset.extend((0..channels).map(|k| k * frames));
            out_offset.extend((0..channels).map(|k| k * frames));
            in_jump = 1;
            out_jump = 1;
        }

        if layout.first_channel > 0 {
            let shift = if layout.device_interleaved {
                layout.first_channel
            } else {
                layout.first_channel * frames
            };
            let device_offsets = match layout.direction {
                Direction::Output => &mut out_offset,
                Direction::Input => &mut in_offset,
            };
            for offset in device_offsets.iter_mut() {
                *offset += shift;
            }
        }

        ConversionInfo {
            channels,
            in_jump,
            out_jump,
            in_format: Some(in_format),
            out_format: Some(out_format),
            in_offset,
            out_offset,
        }
    }
}

/// A decoded sample: integers keep their native width, floats are widened to `f64`.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
}

fn read_sample(format: SampleFormat, bytes: &[u8]) -> Value {
    match format {
        SampleFormat::I8 => Value::Int(bytes[0] as i8 as i64),
        SampleFormat::I16 => Value::Int(i16::from_ne_bytes([bytes[0], bytes[1]]) as i64),
        SampleFormat::I24 => Value::Int(Packed24([bytes[0], bytes[1], bytes[2]]).to_i32() as i64),
        SampleFormat::I32 => {
            Value::Int(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64)
        }
        SampleFormat::F32 => {
            Value::Float(f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64)
        }
        SampleFormat::F64 => {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[..8]);
            Value::Float(f64::from_ne_bytes(word))
        }
    }
}

fn write_sample(format: SampleFormat, value: Value, bytes: &mut [u8]) {
    match (format, value) {
        (SampleFormat::I8, Value::Int(v)) => bytes[0] = (v as i8) as u8,
        (SampleFormat::I16, Value::Int(v)) => bytes[..2].copy_from_slice(&(v as i16).to_ne_bytes()),
        (SampleFormat::I24, Value::Int(v)) => {
            bytes[..3].copy_from_slice(&Packed24::from_i32(v as i32).0)
        }
        (SampleFormat::I32, Value::Int(v)) => bytes[..4].copy_from_slice(&(v as i32).to_ne_bytes()),
        (SampleFormat::F32, Value::Float(v)) => {
            bytes[..4].copy_from_slice(&(v as f32).to_ne_bytes())
        }
        (SampleFormat::F64, Value::Float(v)) => bytes[..8].copy_from_slice(&v.to_ne_bytes()),
        (format, value) => unreachable!("{value:?} was not converted to {format}"),
    }
}

/// Converts a float in `-1.0..=1.0` to an integer of `bits` width.
///
/// `round(x * (max + 0.5) - 0.5)`, rounding half away from zero, saturating at the format limits.
fn float_to_int(value: f64, bits: u32) -> i64 {
    let max = ((1i64 << (bits - 1)) - 1) as f64;
    let scaled = (value * (max + 0.5) - 0.5).round();
    scaled.clamp(-max - 1.0, max) as i64
}

fn convert_value(value: Value, from: SampleFormat, to: SampleFormat) -> Value {
    match (value, from.bits(), to.bits()) {
        (Value::Int(v), Some(from_bits), Some(to_bits)) => {
            if to_bits >= from_bits {
                Value::Int(v << (to_bits - from_bits))
            } else {
                Value::Int(v >> (from_bits - to_bits))
            }
        }
        (Value::Int(v), Some(from_bits), None) => {
            Value::Float(v as f64 / (1i64 << (from_bits - 1)) as f64)
        }
        (Value::Float(v), None, Some(to_bits)) => Value::Int(float_to_int(v, to_bits)),
        (value, _, _) => value,
    }
}

/// Converts `frames` frames from `input` into `output` as described by `info`.
///
/// Device channels that are not covered by `info` are left untouched.
pub fn convert_buffer(output: &mut [u8], input: &[u8], info: &ConversionInfo, frames: usize) {
    let (Some(in_format), Some(out_format)) = (info.in_format, info.out_format) else {
        return;
    };
    let in_size = in_format.sample_size();
    let out_size = out_format.sample_size();

    for frame in 0..frames {
        for ch in 0..info.channels {
            let src = (frame * info.in_jump + info.in_offset[ch]) * in_size;
            let dst = (frame * info.out_jump + info.out_offset[ch]) * out_size;
            let value = read_sample(in_format, &input[src..src + in_size]);
            let value = convert_value(value, in_format, out_format);
            write_sample(out_format, value, &mut output[dst..dst + out_size]);
        }
    }
}

/// Encodes one `-1.0..=1.0` value in `format` using the kernel's float rules.
pub(crate) fn encode_float(value: f64, format: SampleFormat, bytes: &mut [u8]) {
    let value = convert_value(Value::Float(value), SampleFormat::F64, format);
    write_sample(format, value, bytes);
}

/// Swaps the byte order of `samples` samples of `format` in place.
pub fn byte_swap_buffer(buffer: &mut [u8], samples: usize, format: SampleFormat) {
    let width = format.sample_size();
    if width == 1 {
        return;
    }
    for sample in buffer.chunks_exact_mut(width).take(samples) {
        sample.reverse();
    }
}

/// Biases signed 8-bit samples into the unsigned representation (`u = s + 128`).
pub fn signed_to_unsigned_8(buffer: &mut [u8]) {
    for byte in buffer.iter_mut() {
        *byte = byte.wrapping_add(128);
    }
}

/// Removes the unsigned 8-bit bias (`s = u - 128`).
pub fn unsigned_to_signed_8(buffer: &mut [u8]) {
    for byte in buffer.iter_mut() {
        *byte = byte.wrapping_sub(128);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn encode(format: SampleFormat, value: Value) -> Vec<u8> {
        let mut bytes = vec![0u8; format.sample_size()];
        write_sample(format, value, &mut bytes);
        bytes
    }

    fn convert_one(value: Value, from: SampleFormat, to: SampleFormat) -> Value {
        let info = ConversionInfo {
            channels: 1,
            in_jump: 1,
            out_jump: 1,
            in_format: Some(from),
            out_format: Some(to),
            in_offset: vec![0],
            out_offset: vec![0],
        };
        let input = encode(from, value);
        let mut output = vec![0u8; to.sample_size()];
        convert_buffer(&mut output, &input, &info, 1);
        read_sample(to, &output)
    }

    fn int(value: Value) -> i64 {
        match value {
            Value::Int(v) => v,
            Value::Float(v) => panic!("expected an integer sample, got {v}"),
        }
    }

    fn float(value: Value) -> f64 {
        match value {
            Value::Float(v) => v,
            Value::Int(v) => panic!("expected a float sample, got {v}"),
        }
    }

    #[test]
    fn widening_integers_shift_left() {
        let v = convert_one(Value::Int(-1234), SampleFormat::I16, SampleFormat::I32);
        assert_eq!(int(v), -1234 << 16);
        let v = convert_one(Value::Int(100), SampleFormat::I8, SampleFormat::I24);
        assert_eq!(int(v), 100 << 16);
    }

    #[test]
    fn narrowing_integers_truncate() {
        let v = convert_one(Value::Int(0x0001_ffff), SampleFormat::I32, SampleFormat::I16);
        assert_eq!(int(v), 1);
        let v = convert_one(Value::Int(-1), SampleFormat::I32, SampleFormat::I16);
        assert_eq!(int(v), -1);
        let v = convert_one(Value::Int(8388607), SampleFormat::I24, SampleFormat::I8);
        assert_eq!(int(v), 127);
    }

    #[test]
    fn integer_to_float_divides_by_full_range() {
        let v = convert_one(Value::Int(16384), SampleFormat::I16, SampleFormat::F32);
        assert_eq!(float(v), 0.5);
        let v = convert_one(Value::Int(-32768), SampleFormat::I16, SampleFormat::F64);
        assert_eq!(float(v), -1.0);
        let v = convert_one(Value::Int(-128), SampleFormat::I8, SampleFormat::F32);
        assert_eq!(float(v), -1.0);
    }

    #[test]
    fn float_to_integer_rounds_with_bias() {
        let to_i16 = |x: f64| int(convert_one(Value::Float(x), SampleFormat::F64, SampleFormat::I16));
        assert_eq!(to_i16(1.0), 32767);
        assert_eq!(to_i16(-1.0), -32768);
        assert_eq!(to_i16(0.5), 16383);
        assert_eq!(to_i16(2.0), 32767);
        assert_eq!(to_i16(-3.0), -32768);
        let to_i8 = |x: f64| int(convert_one(Value::Float(x), SampleFormat::F32, SampleFormat::I8));
        assert_eq!(to_i8(1.0), 127);
        assert_eq!(to_i8(-1.0), -128);
        let to_i32 = |x: f64| int(convert_one(Value::Float(x), SampleFormat::F64, SampleFormat::I32));
        assert_eq!(to_i32(1.0), 2147483647);
        assert_eq!(to_i32(-1.0), -2147483648);
    }

    /// Significant bits a format carries: its width for integers, the mantissa for floats.
    fn precision(format: SampleFormat) -> u32 {
        match format {
            SampleFormat::F32 => f32::MANTISSA_DIGITS,
            SampleFormat::F64 => f64::MANTISSA_DIGITS,
            other => other.bits().unwrap_or(0),
        }
    }

    #[test]
    fn round_trips_stay_within_the_narrower_precision() {
        let probes: [f64; 7] = [-1.0, -0.75, -0.001, 0.0, 0.25, 0.3333, 0.99];
        for from in SampleFormat::ALL {
            for to in SampleFormat::ALL {
                for probe in probes {
                    let mut start = [0u8; 8];
                    encode_float(probe, from, &mut start);
                    let original = read_sample(from, &start);
                    let there = convert_one(original, from, to);
                    let back = convert_one(there, to, from);

                    let widening = match (from.bits(), to.bits()) {
                        (Some(a), Some(b)) => b >= a,
                        (None, None) => to.sample_size() >= from.sample_size(),
                        _ => false,
                    };
                    match (original, back) {
                        (Value::Int(a), Value::Int(b)) if widening => {
                            assert_eq!(a, b, "{from} -> {to} -> {from}")
                        }
                        (Value::Int(a), Value::Int(b)) => {
                            // One step of the narrower format, plus one for the rounding bias.
                            let narrow = precision(to).min(precision(from));
                            let step = 1i64 << (precision(from) - narrow);
                            assert!((a - b).abs() <= step + 1, "{from} -> {to}: {a} vs {b}");
                        }
                        (Value::Float(a), Value::Float(b)) => {
                            let tolerance = match to.bits() {
                                Some(bits) => 2.0 / (1i64 << (bits - 1)) as f64,
                                None => 1e-6,
                            };
                            assert!((a - b).abs() <= tolerance, "{from} -> {to}: {a} vs {b}");
                        }
                        _ => panic!("value class changed for {from} -> {to} -> {from}"),
                    }
                }
            }
        }
    }

    fn layout(user_interleaved: bool, device_interleaved: bool, direction: Direction) -> ChannelLayout {
        ChannelLayout {
            direction,
            user_channels: 3,
            device_channels: 3,
            user_format: SampleFormat::I16,
            device_format: SampleFormat::I16,
            user_interleaved,
            device_interleaved,
            first_channel: 0,
            buffer_frames: 5,
        }
    }

    #[test]
    fn offsets_visit_every_sample_once() {
        for direction in [Direction::Output, Direction::Input] {
            for user in [true, false] {
                for device in [true, false] {
                    let layout = layout(user, device, direction);
                    let info = ConversionInfo::new(&layout);
                    let total = layout.user_channels * layout.buffer_frames;
                    let mut reads = HashSet::new();
                    let mut writes = HashSet::new();
                    for frame in 0..layout.buffer_frames {
                        for ch in 0..info.channels {
                            let src = frame * info.in_jump + info.in_offset[ch];
                            let dst = frame * info.out_jump + info.out_offset[ch];
                            assert!(src < total && dst < total);
                            assert!(reads.insert(src), "duplicate read {src}");
                            assert!(writes.insert(dst), "duplicate write {dst}");
                        }
                    }
                    assert_eq!(reads.len(), total);
                    assert_eq!(writes.len(), total);
                }
            }
        }
    }

    #[test]
    fn planar_user_to_interleaved_device() {
        let info = ConversionInfo::new(&ChannelLayout {
            buffer_frames: 3,
            user_channels: 2,
            device_channels: 2,
            ..layout(false, true, Direction::Output)
        });
        assert_eq!(info.in_jump, 1);
        assert_eq!(info.out_jump, 2);
        assert_eq!(info.in_offset, vec![0, 3]);
        assert_eq!(info.out_offset, vec![0, 1]);

        let planar: Vec<u8> = [1i16, 2, 3, -1, -2, -3]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        let mut interleaved = vec![0u8; planar.len()];
        convert_buffer(&mut interleaved, &planar, &info, 3);
        let samples: Vec<i16> = interleaved
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![1, -1, 2, -2, 3, -3]);
    }

    #[test]
    fn first_channel_shifts_device_side_only() {
        let output = ConversionInfo::new(&ChannelLayout {
            direction: Direction::Output,
            user_channels: 2,
            device_channels: 4,
            user_format: SampleFormat::I16,
            device_format: SampleFormat::I16,
            user_interleaved: true,
            device_interleaved: true,
            first_channel: 2,
            buffer_frames: 4,
        });
        assert_eq!(output.channels, 2);
        assert_eq!(output.in_offset, vec![0, 1]);
        assert_eq!(output.out_offset, vec![2, 3]);
        assert_eq!((output.in_jump, output.out_jump), (2, 4));

        let input = ConversionInfo::new(&ChannelLayout {
            direction: Direction::Input,
            device_interleaved: false,
            ..ChannelLayout {
                direction: Direction::Input,
                user_channels: 2,
                device_channels: 4,
                user_format: SampleFormat::I16,
                device_format: SampleFormat::I16,
                user_interleaved: true,
                device_interleaved: true,
                first_channel: 1,
                buffer_frames: 4,
            }
        });
        assert_eq!(input.in_offset, vec![4, 8]);
        assert_eq!(input.out_offset, vec![0, 1]);
        assert_eq!((input.in_jump, input.out_jump), (1, 2));
    }

    #[test]
    fn byte_swap_reverses_each_sample() {
        let mut buffer = vec![1, 2, 3, 4, 5, 6];
        byte_swap_buffer(&mut buffer, 2, SampleFormat::I24);
        assert_eq!(buffer, vec![3, 2, 1, 6, 5, 4]);
        let mut buffer = vec![1, 2, 3, 4, 5, 6, 7, 8];
        byte_swap_buffer(&mut buffer, 1, SampleFormat::F64);
        assert_eq!(buffer, vec![8, 7, 6, 5, 4, 3, 2, 1]);
        let mut buffer = vec![1, 2];
        byte_swap_buffer(&mut buffer, 2, SampleFormat::I8);
        assert_eq!(buffer, vec![1, 2]);
    }

    #[test]
    fn unsigned_8_bit_bias_wraps() {
        let mut buffer = vec![0u8, 127, (-128i8) as u8, (-1i8) as u8];
        signed_to_unsigned_8(&mut buffer);
        assert_eq!(buffer, vec![128, 255, 0, 127]);
        unsigned_to_signed_8(&mut buffer);
        assert_eq!(buffer, vec![0, 127, 128, 255]);
    }
}
