//! Conversion between bound buffers and plain `f32` tensors.
//!
//! Integer destinations round to nearest and saturate at the type's range;
//! `NaN` becomes zero. Moves between two buffers of the same element type go
//! through [`gather_raw`] and [`scatter_raw`] instead, which never convert.

use crate::memory::{DataType, MemoryDesc, for_each_index};

fn read(bytes: &[u8], data_type: DataType, offset: usize) -> f32 {
    let at = offset * data_type.size();
    let b = &bytes[at..at + data_type.size()];
    match data_type {
        DataType::F32 => f32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
        DataType::S32 => i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f32,
        DataType::S16 => f32::from(i16::from_ne_bytes([b[0], b[1]])),
        DataType::S8 => f32::from(b[0] as i8),
        DataType::U8 => f32::from(b[0]),
    }
}

fn write(bytes: &mut [u8], data_type: DataType, offset: usize, value: f32) {
    let at = offset * data_type.size();
    let b = &mut bytes[at..at + data_type.size()];
    // float to int `as` casts saturate
    match data_type {
        DataType::F32 => b.copy_from_slice(&value.to_ne_bytes()),
        DataType::S32 => b.copy_from_slice(&(value.round() as i32).to_ne_bytes()),
        DataType::S16 => b.copy_from_slice(&(value.round() as i16).to_ne_bytes()),
        DataType::S8 => b[0] = (value.round() as i8) as u8,
        DataType::U8 => b[0] = value.round() as u8,
    }
}

/// Element offsets of every logical index, in row-major order.
fn offsets(md: &MemoryDesc) -> Vec<usize> {
    let mut out = Vec::with_capacity(md.element_count());
    for_each_index(md.dims(), |idx| out.push(md.offset(idx)));
    out
}

/// Reads `bytes`, laid out as `md`, into a plain row-major tensor.
pub fn gather(bytes: &[u8], md: &MemoryDesc) -> Vec<f32> {
    offsets(md)
        .into_iter()
        .map(|off| read(bytes, md.data_type(), off))
        .collect()
}

/// Writes a plain row-major tensor into `bytes`, laid out as `md`.
///
/// Block padding is left untouched.
pub fn scatter(bytes: &mut [u8], md: &MemoryDesc, values: &[f32]) {
    for (off, &v) in offsets(md).into_iter().zip(values) {
        write(bytes, md.data_type(), off, v);
    }
}

/// Reads `bytes`, laid out as `md`, into packed row-major elements, unconverted.
pub fn gather_raw(bytes: &[u8], md: &MemoryDesc) -> Vec<u8> {
    let size = md.data_type().size();
    let mut out = Vec::with_capacity(md.element_count() * size);
    for off in offsets(md) {
        out.extend_from_slice(&bytes[off * size..(off + 1) * size]);
    }
    out
}

/// Writes packed row-major elements into `bytes`, laid out as `md`, unconverted.
pub fn scatter_raw(bytes: &mut [u8], md: &MemoryDesc, packed: &[u8]) {
    let size = md.data_type().size();
    for (off, element) in offsets(md).into_iter().zip(packed.chunks_exact(size)) {
        bytes[off * size..(off + 1) * size].copy_from_slice(element);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Format;

    #[test]
    fn blocked_round_trip_keeps_padding_zero() {
        let md = MemoryDesc::new(&[1, 3, 1, 2], DataType::F32, Format::NChw8c).unwrap();
        let mut bytes = vec![0u8; md.byte_size()];
        let plain: Vec<f32> = (1..=6).map(|v| v as f32).collect();
        scatter(&mut bytes, &md, &plain);
        assert_eq!(gather(&bytes, &md), plain);
        // (c=1, w=0) sits right after (c=0, w=0) inside the block
        assert_eq!(read(&bytes, DataType::F32, 1), 3.0);
        assert_eq!(read(&bytes, DataType::F32, 7), 0.0);
    }

    #[test]
    fn integer_targets_saturate() {
        let md = MemoryDesc::new(&[4], DataType::S8, Format::X).unwrap();
        let mut bytes = vec![0u8; 4];
        scatter(&mut bytes, &md, &[300.0, -300.0, 1.6, f32::NAN]);
        assert_eq!(gather(&bytes, &md), vec![127.0, -128.0, 2.0, 0.0]);
        let md = MemoryDesc::new(&[2], DataType::U8, Format::X).unwrap();
        let mut bytes = vec![0u8; 2];
        scatter(&mut bytes, &md, &[-4.0, 255.4]);
        assert_eq!(gather(&bytes, &md), vec![0.0, 255.0]);
    }

    #[test]
    fn raw_moves_keep_every_bit() {
        let values = [16_777_217i32, 123_456_789, i32::MIN, i32::MAX];
        let packed: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let nhwc = MemoryDesc::new(&[1, 2, 1, 2], DataType::S32, Format::Nhwc).unwrap();
        let mut bytes = vec![0u8; nhwc.byte_size()];
        scatter_raw(&mut bytes, &nhwc, &packed);
        assert_eq!(&bytes[4..8], &i32::MIN.to_ne_bytes());
        assert_eq!(gather_raw(&bytes, &nhwc), packed);
        // the converting path cannot represent the first two
        assert_ne!(gather(&bytes, &nhwc)[0] as i32, values[0]);
    }
}
