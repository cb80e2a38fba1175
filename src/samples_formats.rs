use std::fmt;
use std::ops::{BitOr, BitOrAssign};

pub use dasp_sample::I24;

/// Format that each sample has.
///
/// All integer formats are signed and stored in host byte order. `I24` samples are packed into
/// three bytes with no padding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// `i8` with a valid range of `-128..=127`.
    I8,
    /// `i16` with a valid range of `-32768..=32767`.
    I16,
    /// Packed 24-bit integer with a valid range of `-8388608..=8388607`.
    I24,
    /// `i32` with a valid range of `i32::MIN..=i32::MAX`.
    I32,
    /// `f32` with a valid range of `-1.0..1.0`.
    F32,
    /// `f64` with a valid range of `-1.0..1.0`.
    F64,
}

impl SampleFormat {
    /// Every format, from the narrowest integer to the widest float.
    pub const ALL: [SampleFormat; 6] = [
        SampleFormat::I8,
        SampleFormat::I16,
        SampleFormat::I24,
        SampleFormat::I32,
        SampleFormat::F32,
        SampleFormat::F64,
    ];

    /// Returns the size in bytes of a sample of this format.
    #[inline]
    pub fn sample_size(&self) -> usize {
        match *self {
            SampleFormat::I8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I24 => 3,
            SampleFormat::I32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    /// Number of significant bits of an integer format, `None` for floats.
    #[inline]
    pub fn bits(&self) -> Option<u32> {
        match *self {
            SampleFormat::I8 => Some(8),
            SampleFormat::I16 => Some(16),
            SampleFormat::I24 => Some(24),
            SampleFormat::I32 => Some(32),
            SampleFormat::F32 | SampleFormat::F64 => None,
        }
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(*self, SampleFormat::F32 | SampleFormat::F64)
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        !self.is_float()
    }

    /// The largest positive value of an integer format (`127` for `I8`, `32767` for `I16`, ...).
    #[inline]
    pub fn max_positive(&self) -> Option<i64> {
        self.bits().map(|bits| (1i64 << (bits - 1)) - 1)
    }

    /// The [`NativeFormats`] bit corresponding to this format.
    pub fn native_bit(&self) -> NativeFormats {
        match *self {
            SampleFormat::I8 => NativeFormats::I8,
            SampleFormat::I16 => NativeFormats::I16,
            SampleFormat::I24 => NativeFormats::I24,
            SampleFormat::I32 => NativeFormats::I32,
            SampleFormat::F32 => NativeFormats::F32,
            SampleFormat::F64 => NativeFormats::F64,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            SampleFormat::I8 => "i8",
            SampleFormat::I16 => "i16",
            SampleFormat::I24 => "i24",
            SampleFormat::I32 => "i32",
            SampleFormat::F32 => "f32",
            SampleFormat::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A set of sample formats a device endpoint supports natively.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NativeFormats(u32);

impl NativeFormats {
    pub const EMPTY: NativeFormats = NativeFormats(0);
    pub const I8: NativeFormats = NativeFormats(0x01);
    pub const I16: NativeFormats = NativeFormats(0x02);
    pub const I24: NativeFormats = NativeFormats(0x04);
    pub const I32: NativeFormats = NativeFormats(0x08);
    pub const F32: NativeFormats = NativeFormats(0x10);
    pub const F64: NativeFormats = NativeFormats(0x20);

    /// Preference order used when a requested format is not supported natively.
    const PREFERENCE: [SampleFormat; 6] = [
        SampleFormat::F64,
        SampleFormat::F32,
        SampleFormat::I32,
        SampleFormat::I24,
        SampleFormat::I16,
        SampleFormat::I8,
    ];

    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !0x3f == 0 {
            Some(NativeFormats(bits))
        } else {
            None
        }
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, format: SampleFormat) -> bool {
        self.0 & format.native_bit().0 != 0
    }

    pub fn insert(&mut self, format: SampleFormat) {
        self.0 |= format.native_bit().0;
    }

    /// Iterates over the contained formats in ascending width.
    pub fn iter(&self) -> impl Iterator<Item = SampleFormat> + '_ {
        SampleFormat::ALL.into_iter().filter(|f| self.contains(*f))
    }

    /// The format a device should run with when the user asks for `requested`.
    ///
    /// The requested format wins when supported, otherwise the highest resolution format that is.
    pub fn best_match(&self, requested: SampleFormat) -> Option<SampleFormat> {
        if self.contains(requested) {
            return Some(requested);
        }
        Self::PREFERENCE.into_iter().find(|f| self.contains(*f))
    }
}

impl BitOr for NativeFormats {
    type Output = NativeFormats;

    fn bitor(self, rhs: NativeFormats) -> NativeFormats {
        NativeFormats(self.0 | rhs.0)
    }
}

impl BitOrAssign for NativeFormats {
    fn bitor_assign(&mut self, rhs: NativeFormats) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for NativeFormats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A 24-bit signed sample packed into three bytes in host byte order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Packed24(pub [u8; 3]);

impl Packed24 {
    /// Packs the low 24 bits of `value`.
    pub fn from_i32(value: i32) -> Self {
        let b = value.to_ne_bytes();
        if cfg!(target_endian = "little") {
            Packed24([b[0], b[1], b[2]])
        } else {
            Packed24([b[1], b[2], b[3]])
        }
    }

    /// Sign-extends the packed value.
    pub fn to_i32(self) -> i32 {
        let [a, b, c] = self.0;
        let word = if cfg!(target_endian = "little") {
            i32::from_ne_bytes([a, b, c, 0])
        } else {
            i32::from_ne_bytes([0, a, b, c])
        };
        (word << 8) >> 8
    }

    pub fn to_i24(self) -> I24 {
        I24::new_unchecked(self.to_i32())
    }
}

impl From<I24> for Packed24 {
    fn from(value: I24) -> Self {
        Packed24::from_i32(value.inner())
    }
}

impl fmt::Debug for Packed24 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packed24({})", self.to_i32())
    }
}

/// A sample type whose in-memory layout matches one [`SampleFormat`].
pub trait SizedSample: Copy + Send + 'static {
    const FORMAT: SampleFormat;
}

impl SizedSample for i8 {
    const FORMAT: SampleFormat = SampleFormat::I8;
}

impl SizedSample for i16 {
    const FORMAT: SampleFormat = SampleFormat::I16;
}

impl SizedSample for Packed24 {
    const FORMAT: SampleFormat = SampleFormat::I24;
}

impl SizedSample for i32 {
    const FORMAT: SampleFormat = SampleFormat::I32;
}

impl SizedSample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;
}

impl SizedSample for f64 {
    const FORMAT: SampleFormat = SampleFormat::F64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_layouts() {
        assert_eq!(SampleFormat::I8.sample_size(), std::mem::size_of::<i8>());
        assert_eq!(SampleFormat::I16.sample_size(), std::mem::size_of::<i16>());
        assert_eq!(SampleFormat::I24.sample_size(), std::mem::size_of::<Packed24>());
        assert_eq!(SampleFormat::I32.sample_size(), std::mem::size_of::<i32>());
        assert_eq!(SampleFormat::F32.sample_size(), std::mem::size_of::<f32>());
        assert_eq!(SampleFormat::F64.sample_size(), std::mem::size_of::<f64>());
    }

    #[test]
    fn max_positive_values() {
        assert_eq!(SampleFormat::I8.max_positive(), Some(127));
        assert_eq!(SampleFormat::I16.max_positive(), Some(32767));
        assert_eq!(SampleFormat::I24.max_positive(), Some(8388607));
        assert_eq!(SampleFormat::I32.max_positive(), Some(2147483647));
        assert_eq!(SampleFormat::F32.max_positive(), None);
    }

    #[test]
    fn packed24_sign_extends() {
        for value in [0, 1, -1, 8388607, -8388608, 12345, -54321] {
            assert_eq!(Packed24::from_i32(value).to_i32(), value);
        }
        let i24 = I24::new(-4000).unwrap();
        assert_eq!(Packed24::from(i24).to_i24(), i24);
    }

    #[test]
    fn best_match_prefers_requested_then_resolution() {
        let formats = NativeFormats::I8 | NativeFormats::I16;
        assert_eq!(formats.best_match(SampleFormat::I8), Some(SampleFormat::I8));
        assert_eq!(formats.best_match(SampleFormat::F32), Some(SampleFormat::I16));
        assert_eq!(NativeFormats::EMPTY.best_match(SampleFormat::I16), None);
        assert_eq!(
            (NativeFormats::F32 | NativeFormats::I32).best_match(SampleFormat::I16),
            Some(SampleFormat::F32)
        );
    }

    #[test]
    fn native_formats_bits_round_trip() {
        let formats = NativeFormats::I16 | NativeFormats::F32;
        assert_eq!(NativeFormats::from_bits(formats.bits()), Some(formats));
        assert_eq!(NativeFormats::from_bits(0x100), None);
        assert_eq!(
            formats.iter().collect::<Vec<_>>(),
            vec![SampleFormat::I16, SampleFormat::F32]
        );
    }
}
