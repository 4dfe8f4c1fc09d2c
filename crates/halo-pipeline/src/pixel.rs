//! Owned raw pixel buffers.
//!
//! A [`PixelBuffer`] is a contiguous, row-major byte buffer with no
//! header, padding or compression. Row `r` occupies bytes
//! `[r * stride, (r + 1) * stride)` where `stride = width * channels`.
//! All access goes through bounds-checked accessors; each buffer has a
//! single owner and is only ever shared by copying its bytes.

use std::io::{Read, Write};

use crate::partition::RowBand;
use crate::types::{Dimensions, PipelineError};

/// A fixed-shape raw pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    dimensions: Dimensions,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Allocate a zero-filled buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidDimensions`] if any dimension is
    /// zero, or [`PipelineError::Allocation`] if the memory cannot be
    /// reserved.
    pub fn allocate(dimensions: Dimensions) -> Result<Self, PipelineError> {
        dimensions.validate()?;
        let len = dimensions
            .byte_len()
            .ok_or(PipelineError::Allocation { bytes: usize::MAX })?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| PipelineError::Allocation { bytes: len })?;
        data.resize(len, 0);

        Ok(Self { dimensions, data })
    }

    /// Decode a buffer from an in-memory byte slice.
    ///
    /// Only the first `width * height * channels` bytes are used; any
    /// trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TruncatedInput`] if `source` is shorter
    /// than the declared shape requires, plus any error from
    /// [`allocate`](Self::allocate).
    pub fn decode_from_bytes(source: &[u8], dimensions: Dimensions) -> Result<Self, PipelineError> {
        let mut buffer = Self::allocate(dimensions)?;
        let expected = buffer.data.len();
        let Some(bytes) = source.get(..expected) else {
            return Err(PipelineError::TruncatedInput {
                expected,
                actual: source.len(),
            });
        };
        buffer.data.copy_from_slice(bytes);
        Ok(buffer)
    }

    /// Decode a buffer by reading exactly the declared number of bytes
    /// from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TruncatedInput`] if the reader reaches
    /// end-of-file early, [`PipelineError::Io`] if reading fails, plus
    /// any error from [`allocate`](Self::allocate).
    pub fn read_from<R: Read>(source: R, dimensions: Dimensions) -> Result<Self, PipelineError> {
        let mut buffer = Self::allocate(dimensions)?;
        let expected = buffer.data.len();

        let mut filled = 0;
        let mut reader = source;
        while filled < expected {
            match reader.read(&mut buffer.data[filled..]) {
                Ok(0) => {
                    return Err(PipelineError::TruncatedInput {
                        expected,
                        actual: filled,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buffer)
    }

    /// Write the buffer verbatim, row-major.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if the sink fails.
    pub fn encode_to_bytes<W: Write>(&self, mut sink: W) -> Result<(), PipelineError> {
        sink.write_all(&self.data)?;
        sink.flush()?;
        Ok(())
    }

    /// Shape of the buffer.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.dimensions.width
    }

    /// Height in rows.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.dimensions.height
    }

    /// Bytes per pixel.
    #[must_use]
    pub const fn channels(&self) -> u32 {
        self.dimensions.channels
    }

    /// The whole buffer as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer and return its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Byte offset of `(row, column, channel)`, or `None` when outside.
    const fn offset(&self, row: u32, column: u32, channel: u32) -> Option<usize> {
        let d = self.dimensions;
        if row >= d.height || column >= d.width || channel >= d.channels {
            return None;
        }
        Some(row as usize * d.row_stride() + column as usize * d.channels as usize + channel as usize)
    }

    /// Read one channel byte.
    #[must_use]
    pub fn get(&self, row: u32, column: u32, channel: u32) -> Option<u8> {
        self.offset(row, column, channel).map(|i| self.data[i])
    }

    /// Write one channel byte.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::OutOfBounds`] if the coordinate is
    /// outside the buffer.
    pub fn set(&mut self, row: u32, column: u32, channel: u32, value: u8) -> Result<(), PipelineError> {
        let i = self.offset(row, column, channel).ok_or_else(|| {
            PipelineError::OutOfBounds(format!(
                "({row}, {column}, {channel}) outside {}",
                self.dimensions
            ))
        })?;
        self.data[i] = value;
        Ok(())
    }

    /// All channel bytes of one pixel.
    #[must_use]
    pub fn pixel(&self, row: u32, column: u32) -> Option<&[u8]> {
        let start = self.offset(row, column, 0)?;
        self.data.get(start..start + self.dimensions.channels as usize)
    }

    /// One full row.
    #[must_use]
    pub fn row(&self, row: u32) -> Option<&[u8]> {
        if row >= self.dimensions.height {
            return None;
        }
        let stride = self.dimensions.row_stride();
        let start = row as usize * stride;
        self.data.get(start..start + stride)
    }

    /// Mutable access to one full row.
    pub fn row_mut(&mut self, row: u32) -> Option<&mut [u8]> {
        if row >= self.dimensions.height {
            return None;
        }
        let stride = self.dimensions.row_stride();
        let start = row as usize * stride;
        self.data.get_mut(start..start + stride)
    }

    /// Bytes of the rows covered by `band`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::OutOfBounds`] if the band overruns the
    /// buffer.
    pub fn band_bytes(&self, band: RowBand) -> Result<&[u8], PipelineError> {
        let range = self.band_range(band)?;
        Ok(&self.data[range])
    }

    /// Mutable bytes of the rows covered by `band`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::OutOfBounds`] if the band overruns the
    /// buffer.
    pub fn band_bytes_mut(&mut self, band: RowBand) -> Result<&mut [u8], PipelineError> {
        let range = self.band_range(band)?;
        Ok(&mut self.data[range])
    }

    fn band_range(&self, band: RowBand) -> Result<std::ops::Range<usize>, PipelineError> {
        if u64::from(band.start) + u64::from(band.count) > u64::from(self.dimensions.height) {
            return Err(PipelineError::OutOfBounds(format!(
                "rows {band} exceed height {}",
                self.dimensions.height
            )));
        }
        let stride = self.dimensions.row_stride();
        let start = band.start as usize * stride;
        Ok(start..start + band.count as usize * stride)
    }

    /// Copy out a `width x height` rectangle whose top-left corner is
    /// at `(x_offset, y_offset)`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::OutOfBounds`] if the rectangle extends
    /// past the source, plus any error from
    /// [`allocate`](Self::allocate) (e.g. a zero-sized rectangle).
    pub fn crop(&self, width: u32, height: u32, x_offset: u32, y_offset: u32) -> Result<Self, PipelineError> {
        let d = self.dimensions;
        if u64::from(x_offset) + u64::from(width) > u64::from(d.width)
            || u64::from(y_offset) + u64::from(height) > u64::from(d.height)
        {
            return Err(PipelineError::OutOfBounds(format!(
                "crop {width}x{height}+{x_offset}+{y_offset} exceeds {d}"
            )));
        }

        let mut cropped = Self::allocate(Dimensions::new(width, height, d.channels))?;
        let channels = d.channels as usize;
        let first = x_offset as usize * channels;
        let len = width as usize * channels;
        for (dst_row, src_row) in (y_offset..y_offset + height).enumerate() {
            let src = &self.data[src_row as usize * d.row_stride()..][first..first + len];
            let dst_start = dst_row * cropped.dimensions.row_stride();
            cropped.data[dst_start..dst_start + len].copy_from_slice(src);
        }
        Ok(cropped)
    }

    /// Copy every pixel of `source` into this buffer with its top-left
    /// corner at `(x_offset, y_offset)`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if the channel
    /// counts differ, or [`PipelineError::OutOfBounds`] if `source` does
    /// not fit at that offset.
    pub fn paste(&mut self, source: &Self, x_offset: u32, y_offset: u32) -> Result<(), PipelineError> {
        let d = self.dimensions;
        let s = source.dimensions;
        if d.channels != s.channels {
            return Err(PipelineError::DimensionMismatch { left: d, right: s });
        }
        if u64::from(x_offset) + u64::from(s.width) > u64::from(d.width)
            || u64::from(y_offset) + u64::from(s.height) > u64::from(d.height)
        {
            return Err(PipelineError::OutOfBounds(format!(
                "paste {s} at +{x_offset}+{y_offset} exceeds {d}"
            )));
        }

        let first = x_offset as usize * d.channels as usize;
        let len = s.row_stride();
        for (src_row, src) in source.data.chunks_exact(len).enumerate() {
            let dst_start = (y_offset as usize + src_row) * d.row_stride() + first;
            self.data[dst_start..dst_start + len].copy_from_slice(src);
        }
        Ok(())
    }

    /// Euclidean distance between two buffers: the square root of the
    /// sum of squared per-byte differences.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] unless both buffers
    /// have the same width, height and channel count.
    pub fn euclidean_distance(&self, other: &Self) -> Result<f64, PipelineError> {
        if self.dimensions != other.dimensions {
            return Err(PipelineError::DimensionMismatch {
                left: self.dimensions,
                right: other.dimensions,
            });
        }

        let sum: u64 = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| {
                let diff = u64::from(a.abs_diff(b));
                diff * diff
            })
            .sum();

        #[allow(clippy::cast_precision_loss)]
        Ok((sum as f64).sqrt())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, channels: u32) -> PixelBuffer {
        let dims = Dimensions::new(width, height, channels);
        let bytes: Vec<u8> = (0..dims.byte_len().unwrap())
            .map(|i| u8::try_from(i % 251).unwrap())
            .collect();
        PixelBuffer::decode_from_bytes(&bytes, dims).unwrap()
    }

    #[test]
    fn allocate_is_zero_filled() {
        let buf = PixelBuffer::allocate(Dimensions::new(3, 2, 4)).unwrap();
        assert_eq!(buf.as_bytes().len(), 24);
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn allocate_rejects_zero_dimensions() {
        let result = PixelBuffer::allocate(Dimensions::new(0, 2, 1));
        assert!(matches!(result, Err(PipelineError::InvalidDimensions(_))));
    }

    #[test]
    fn allocate_reports_overflowing_size() {
        let result = PixelBuffer::allocate(Dimensions::new(u32::MAX, u32::MAX, u32::MAX));
        assert!(matches!(result, Err(PipelineError::Allocation { .. })));
    }

    #[test]
    fn decode_reports_truncation() {
        let result = PixelBuffer::decode_from_bytes(&[1, 2, 3], Dimensions::new(2, 2, 1));
        assert!(matches!(
            result,
            Err(PipelineError::TruncatedInput {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let buf = PixelBuffer::decode_from_bytes(&[1, 2, 3, 4, 5], Dimensions::new(2, 2, 1)).unwrap();
        assert_eq!(buf.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn read_from_reports_truncation() {
        let source: &[u8] = &[9; 5];
        let result = PixelBuffer::read_from(source, Dimensions::new(3, 2, 1));
        assert!(matches!(
            result,
            Err(PipelineError::TruncatedInput {
                expected: 6,
                actual: 5
            })
        ));
    }

    #[test]
    fn encode_writes_verbatim() {
        let buf = gradient(3, 3, 2);
        let mut out = Vec::new();
        buf.encode_to_bytes(&mut out).unwrap();
        assert_eq!(out, buf.as_bytes());

        let again = PixelBuffer::read_from(out.as_slice(), buf.dimensions()).unwrap();
        assert_eq!(again, buf);
    }

    #[test]
    fn accessors_follow_row_major_layout() {
        let buf = gradient(4, 3, 3);
        // Row 1, column 2, channel 1 -> 1 * 12 + 2 * 3 + 1 = 19.
        assert_eq!(buf.get(1, 2, 1), Some(19));
        assert_eq!(buf.pixel(1, 2), Some(&[18, 19, 20][..]));
        assert_eq!(buf.row(2).unwrap()[0], 24);
        assert_eq!(buf.get(3, 0, 0), None);
        assert_eq!(buf.get(0, 4, 0), None);
        assert_eq!(buf.get(0, 0, 3), None);
    }

    #[test]
    fn set_is_bounds_checked() {
        let mut buf = PixelBuffer::allocate(Dimensions::new(2, 2, 1)).unwrap();
        buf.set(1, 1, 0, 7).unwrap();
        assert_eq!(buf.get(1, 1, 0), Some(7));
        assert!(matches!(buf.set(2, 0, 0, 1), Err(PipelineError::OutOfBounds(_))));
    }

    #[test]
    fn band_bytes_cover_whole_rows() {
        let buf = gradient(2, 4, 1);
        let bytes = buf.band_bytes(RowBand::new(1, 2)).unwrap();
        assert_eq!(bytes, &[2, 3, 4, 5]);
        assert!(buf.band_bytes(RowBand::new(3, 2)).is_err());
    }

    #[test]
    fn crop_copies_rectangle() {
        let buf = gradient(4, 4, 1);
        let cropped = buf.crop(2, 2, 1, 2).unwrap();
        assert_eq!(cropped.dimensions(), Dimensions::new(2, 2, 1));
        assert_eq!(cropped.as_bytes(), &[9, 10, 13, 14]);
    }

    #[test]
    fn crop_out_of_bounds() {
        let buf = gradient(4, 4, 1);
        assert!(matches!(buf.crop(3, 1, 2, 0), Err(PipelineError::OutOfBounds(_))));
        assert!(matches!(buf.crop(1, 5, 0, 0), Err(PipelineError::OutOfBounds(_))));
    }

    #[test]
    fn crop_then_paste_into_zero_image() {
        let source = gradient(6, 5, 3);
        let cropped = source.crop(4, 3, 0, 0).unwrap();

        let mut canvas = PixelBuffer::allocate(source.dimensions()).unwrap();
        canvas.paste(&cropped, 0, 0).unwrap();

        for row in 0..5 {
            for col in 0..6 {
                for ch in 0..3 {
                    let expected = if row < 3 && col < 4 {
                        source.get(row, col, ch)
                    } else {
                        Some(0)
                    };
                    assert_eq!(canvas.get(row, col, ch), expected, "({row}, {col}, {ch})");
                }
            }
        }
    }

    #[test]
    fn paste_rejects_channel_mismatch() {
        let mut canvas = PixelBuffer::allocate(Dimensions::new(4, 4, 3)).unwrap();
        let gray = PixelBuffer::allocate(Dimensions::new(2, 2, 1)).unwrap();
        assert!(matches!(
            canvas.paste(&gray, 0, 0),
            Err(PipelineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn distance_to_self_is_zero() {
        let buf = gradient(5, 5, 2);
        assert!(buf.euclidean_distance(&buf).unwrap().abs() < f64::EPSILON);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = gradient(3, 3, 1);
        let mut b = a.clone();
        b.set(0, 0, 0, 3).unwrap();
        b.set(2, 2, 0, 255).unwrap();
        let ab = a.euclidean_distance(&b).unwrap();
        let ba = b.euclidean_distance(&a).unwrap();
        assert!((ab - ba).abs() < f64::EPSILON);
        // (3 - 0)^2 + (255 - 8)^2 = 9 + 61009
        assert!((ab - 61018f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn distance_rejects_mismatched_shapes() {
        let a = gradient(3, 3, 1);
        let b = gradient(3, 3, 2);
        assert!(matches!(
            a.euclidean_distance(&b),
            Err(PipelineError::DimensionMismatch { .. })
        ));
    }
}
