// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Payload-to-f32 conversion for monitoring.
//!
//! Monitors render everything as f32: integer types cast, f64 narrows,
//! and complex samples collapse to magnitude. Conversion is bounded by
//! both the declared sample count and the bytes actually present, so a
//! short or lying payload can never read out of bounds.

use crate::net::DType;

/// Element size in bytes for a wire dtype code (0 for unknown codes).
#[must_use]
pub fn dtype_sample_bytes(dtype: u8) -> usize {
    DType::from_code(dtype).map_or(0, DType::size)
}

/// Convert `payload` to f32 samples in `out`.
///
/// Emits `min(sample_count, payload.len() / dtype_size, out.len())`
/// samples and returns the count; unknown dtypes convert to nothing.
#[must_use]
pub fn convert_to_f32(payload: &[u8], sample_count: usize, dtype: u8, out: &mut [f32]) -> usize {
    let Some(dtype) = DType::from_code(dtype) else {
        return 0;
    };
    let sample_bytes = dtype.size();
    let n = sample_count
        .min(payload.len() / sample_bytes)
        .min(out.len());

    match dtype {
        DType::F32 => {
            for (i, chunk) in payload.chunks_exact(4).take(n).enumerate() {
                out[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        DType::I32 => {
            for (i, chunk) in payload.chunks_exact(4).take(n).enumerate() {
                out[i] = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f32;
            }
        }
        DType::Cf32 => {
            for (i, chunk) in payload.chunks_exact(8).take(n).enumerate() {
                let re = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let im = f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
                out[i] = (re * re + im * im).sqrt();
            }
        }
        DType::F64 => {
            for (i, chunk) in payload.chunks_exact(8).take(n).enumerate() {
                let mut b = [0u8; 8];
                b.copy_from_slice(chunk);
                out[i] = f64::from_le_bytes(b) as f32;
            }
        }
        DType::I16 => {
            for (i, chunk) in payload.chunks_exact(2).take(n).enumerate() {
                out[i] = f32::from(i16::from_le_bytes([chunk[0], chunk[1]]));
            }
        }
        DType::I8 => {
            for (i, &b) in payload.iter().take(n).enumerate() {
                out[i] = f32::from(b as i8);
            }
        }
    }

    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_copies_verbatim() {
        let payload: Vec<u8> = [1.5f32, -2.25, 0.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut out = [0.0f32; 8];
        let n = convert_to_f32(&payload, 3, DType::F32 as u8, &mut out);
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[1.5, -2.25, 0.0]);
    }

    #[test]
    fn integer_types_cast() {
        let payload: Vec<u8> = [-5i32, 1000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut out = [0.0f32; 4];
        assert_eq!(convert_to_f32(&payload, 2, DType::I32 as u8, &mut out), 2);
        assert_eq!(&out[..2], &[-5.0, 1000.0]);

        let payload: Vec<u8> = [-300i16, 42].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(convert_to_f32(&payload, 2, DType::I16 as u8, &mut out), 2);
        assert_eq!(&out[..2], &[-300.0, 42.0]);

        let payload = [0x80u8, 0x7F]; // -128, 127 as i8
        assert_eq!(convert_to_f32(&payload, 2, DType::I8 as u8, &mut out), 2);
        assert_eq!(&out[..2], &[-128.0, 127.0]);
    }

    #[test]
    fn f64_narrows() {
        let payload: Vec<u8> = [2.5f64, -0.125]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut out = [0.0f32; 4];
        assert_eq!(convert_to_f32(&payload, 2, DType::F64 as u8, &mut out), 2);
        assert_eq!(&out[..2], &[2.5, -0.125]);
    }

    #[test]
    fn cf32_collapses_to_magnitude() {
        let payload: Vec<u8> = [3.0f32, 4.0, 0.0, -1.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut out = [0.0f32; 4];
        assert_eq!(convert_to_f32(&payload, 2, DType::Cf32 as u8, &mut out), 2);
        assert_eq!(&out[..2], &[5.0, 1.0]);
    }

    #[test]
    fn short_payload_bounds_output() {
        // Declared 8 samples of f32 but only 10 bytes present: 2 emitted.
        let payload = [0u8; 10];
        let mut out = [9.0f32; 8];
        assert_eq!(convert_to_f32(&payload, 8, DType::F32 as u8, &mut out), 2);
        assert_eq!(out[2], 9.0);
    }

    #[test]
    fn unknown_dtype_converts_nothing() {
        let payload = [0u8; 16];
        let mut out = [0.0f32; 4];
        assert_eq!(convert_to_f32(&payload, 4, 9, &mut out), 0);
        assert_eq!(dtype_sample_bytes(9), 0);
        assert_eq!(dtype_sample_bytes(DType::Cf32 as u8), 8);
    }
}
