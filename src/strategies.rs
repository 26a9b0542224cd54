// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// Reconstruction kernels, generic flavor.
//
// Everything here is a plain scalar implementation behind the same seams
// an optimized build would use: cost functions (SAD/SATD), pixel blits,
// the integer DCT-II pair, scalar quantization and the sub-pel
// interpolation filters. Nothing in this file knows about CTUs or the
// job graph.

use std::sync::OnceLock;

use crate::picture::{Pixel, Plane};

// ----- Cost functions -----------------------------------------------------

pub fn sad(a: &[Pixel], a_stride: usize, b: &[Pixel], b_stride: usize,
           width: usize, height: usize) -> u64 {
  let mut sum = 0u64;
  for y in 0..height {
    let ra = &a[y * a_stride..y * a_stride + width];
    let rb = &b[y * b_stride..y * b_stride + width];
    for x in 0..width {
      sum += (ra[x] as i32 - rb[x] as i32).unsigned_abs() as u64;
    }
  }
  sum
}

// SAD against a reference plane with edge clamping, so motion vectors may
// point (partially) outside the picture.
pub fn sad_clamped(pic: &Plane, pic_x: usize, pic_y: usize,
                   reference: &Plane, ref_x: i32, ref_y: i32,
                   width: usize, height: usize) -> u64 {
  let mut sum = 0u64;
  for y in 0..height {
    for x in 0..width {
      let p = pic.at(pic_x + x, pic_y + y) as i32;
      let r = reference.at_clamped(ref_x + x as i32, ref_y + y as i32) as i32;
      sum += (p - r).unsigned_abs() as u64;
    }
  }
  sum
}

fn hadamard4(d: &mut [i32; 4]) {
  let a0 = d[0] + d[2];
  let a1 = d[1] + d[3];
  let a2 = d[0] - d[2];
  let a3 = d[1] - d[3];
  d[0] = a0 + a1;
  d[1] = a0 - a1;
  d[2] = a2 + a3;
  d[3] = a2 - a3;
}

fn satd_nxn<const N: usize>(diff: &[i32]) -> u64 {
  // Hadamard transform the difference block along rows then columns and
  // sum the magnitudes.
  let mut m = [0i32; 64];
  m[..N * N].copy_from_slice(&diff[..N * N]);

  for pass in 0..2 {
    for i in 0..N {
      let mut v = [0i32; 64];
      for j in 0..N {
        v[j] = if pass == 0 { m[i * N + j] } else { m[j * N + i] };
      }
      // N is 4 or 8: one or two butterfly layers over groups of four,
      // then a combine for N == 8.
      if N == 4 {
        let mut q = [v[0], v[1], v[2], v[3]];
        hadamard4(&mut q);
        v[..4].copy_from_slice(&q);
      } else {
        let mut lo = [v[0], v[1], v[2], v[3]];
        let mut hi = [v[4], v[5], v[6], v[7]];
        hadamard4(&mut lo);
        hadamard4(&mut hi);
        for k in 0..4 {
          v[k] = lo[k] + hi[k];
          v[k + 4] = lo[k] - hi[k];
        }
      }
      for j in 0..N {
        if pass == 0 {
          m[i * N + j] = v[j];
        } else {
          m[j * N + i] = v[j];
        }
      }
    }
  }

  let mut sum = 0u64;
  for i in 0..N * N {
    sum += m[i].unsigned_abs() as u64;
  }
  // Normalize towards SAD magnitude
  (sum + (N as u64)) / (2 * if N == 8 { 4 } else { 2 })
}

pub fn satd_any_size(width: usize, height: usize,
                     a: &[Pixel], a_stride: usize,
                     b: &[Pixel], b_stride: usize) -> u64 {
  if width % 8 == 0 && height % 8 == 0 {
    let mut total = 0u64;
    for by in (0..height).step_by(8) {
      for bx in (0..width).step_by(8) {
        let mut diff = [0i32; 64];
        for y in 0..8 {
          for x in 0..8 {
            let pa = a[(by + y) * a_stride + bx + x] as i32;
            let pb = b[(by + y) * b_stride + bx + x] as i32;
            diff[y * 8 + x] = pa - pb;
          }
        }
        total += satd_nxn::<8>(&diff);
      }
    }
    total
  } else if width % 4 == 0 && height % 4 == 0 {
    let mut total = 0u64;
    for by in (0..height).step_by(4) {
      for bx in (0..width).step_by(4) {
        let mut diff = [0i32; 16];
        for y in 0..4 {
          for x in 0..4 {
            let pa = a[(by + y) * a_stride + bx + x] as i32;
            let pb = b[(by + y) * b_stride + bx + x] as i32;
            diff[y * 4 + x] = pa - pb;
          }
        }
        total += satd_nxn::<4>(&diff);
      }
    }
    total
  } else {
    sad(a, a_stride, b, b_stride, width, height)
  }
}

// ----- Blits and statistics ----------------------------------------------

pub fn pixels_blit(src: &[Pixel], src_stride: usize,
                   dst: &mut [Pixel], dst_stride: usize,
                   width: usize, height: usize) {
  for y in 0..height {
    let s = &src[y * src_stride..y * src_stride + width];
    let d = &mut dst[y * dst_stride..y * dst_stride + width];
    d.copy_from_slice(s);
  }
}

pub fn pixel_var(data: &[Pixel]) -> f64 {
  if data.is_empty() {
    return 0.0;
  }
  let n = data.len() as f64;
  let mean = data.iter().map(|&p| p as f64).sum::<f64>() / n;
  data.iter().map(|&p| (p as f64 - mean) * (p as f64 - mean)).sum::<f64>() / n
}

pub fn pixels_calc_ssd(a: &[Pixel], a_stride: usize,
                       b: &[Pixel], b_stride: usize,
                       width: usize, height: usize) -> u64 {
  let mut sum = 0u64;
  for y in 0..height {
    for x in 0..width {
      let d = a[y * a_stride + x] as i64 - b[y * b_stride + x] as i64;
      sum += (d * d) as u64;
    }
  }
  sum
}

// ----- Transforms ---------------------------------------------------------

const MAX_TR_DYNAMIC_RANGE: i32 = 15;

// Integer DCT-II basis scaled so that the first row is all 64s,
// matching the usual video-codec normalization. Generated once per size.
fn dct_matrix(n: usize) -> &'static [i32] {
  static TABLES: OnceLock<[Vec<i32>; 5]> = OnceLock::new();
  let tables = TABLES.get_or_init(|| {
    let build = |n: usize| -> Vec<i32> {
      let mut t = vec![0i32; n * n];
      for k in 0..n {
        let norm = if k == 0 { (1.0 / n as f64).sqrt() } else { (2.0 / n as f64).sqrt() };
        for i in 0..n {
          let c = norm
            * ((std::f64::consts::PI * ((2 * i + 1) as f64) * (k as f64)) / (2.0 * n as f64))
              .cos();
          t[k * n + i] = (64.0 * (n as f64).sqrt() * c).round() as i32;
        }
      }
      t
    };
    [build(4), build(8), build(16), build(32), build(64)]
  });
  match n {
    4 => &tables[0],
    8 => &tables[1],
    16 => &tables[2],
    32 => &tables[3],
    64 => &tables[4],
    _ => panic!("unsupported transform size {}", n),
  }
}

/// Forward 2D DCT-II of an NxN residual block, output scaled into the
/// 15-bit coefficient range.
pub fn fwd_dct(residual: &[i32], n: usize, bitdepth: u32, coeff_out: &mut [i16]) {
  let t = dct_matrix(n);
  let log2n = n.trailing_zeros() as i32;
  let shift1 = log2n + bitdepth as i32 - 9;
  let shift2 = log2n + 6;

  let mut tmp = vec![0i64; n * n];
  // Rows
  for y in 0..n {
    for k in 0..n {
      let mut acc = 0i64;
      for x in 0..n {
        acc += t[k * n + x] as i64 * residual[y * n + x] as i64;
      }
      tmp[y * n + k] = (acc + (1 << (shift1 - 1))) >> shift1;
    }
  }
  // Columns
  for k in 0..n {
    for j in 0..n {
      let mut acc = 0i64;
      for y in 0..n {
        acc += t[j * n + y] as i64 * tmp[y * n + k];
      }
      let v = (acc + (1 << (shift2 - 1))) >> shift2;
      coeff_out[j * n + k] =
        v.clamp(-(1 << MAX_TR_DYNAMIC_RANGE), (1 << MAX_TR_DYNAMIC_RANGE) - 1) as i16;
    }
  }
}

/// Inverse 2D DCT-II; output is a pixel-domain residual.
pub fn inv_dct(coeff: &[i16], n: usize, bitdepth: u32, residual_out: &mut [i32]) {
  let t = dct_matrix(n);
  let shift1 = 7;
  let shift2 = 12 - (bitdepth as i32 - 8);

  let mut tmp = vec![0i64; n * n];
  // Columns (transposed basis)
  for k in 0..n {
    for y in 0..n {
      let mut acc = 0i64;
      for j in 0..n {
        acc += t[j * n + y] as i64 * coeff[j * n + k] as i64;
      }
      tmp[y * n + k] = (acc + (1 << (shift1 - 1))) >> shift1;
    }
  }
  // Rows
  for y in 0..n {
    for x in 0..n {
      let mut acc = 0i64;
      for k in 0..n {
        acc += t[k * n + x] as i64 * tmp[y * n + k];
      }
      residual_out[y * n + x] = ((acc + (1 << (shift2 - 1))) >> shift2) as i32;
    }
  }
}

// ----- Quantization -------------------------------------------------------

const QUANT_SCALES: [i32; 6] = [26214, 23302, 20560, 18396, 16384, 14564];
const DEQUANT_SCALES: [i32; 6] = [40, 45, 51, 57, 64, 72];

fn transform_shift(log2n: i32, bitdepth: u32) -> i32 {
  MAX_TR_DYNAMIC_RANGE - bitdepth as i32 - log2n
}

/// Scalar quantization. Returns the number of nonzero levels.
pub fn quantize(coeff: &mut [i16], n: usize, qp: i32, bitdepth: u32, intra: bool) -> usize {
  let log2n = n.trailing_zeros() as i32;
  let shift = 14 + qp / 6 + transform_shift(log2n, bitdepth);
  let scale = QUANT_SCALES[(qp % 6) as usize] as i64;
  // Smaller rounding offset for inter blocks; favors zeros slightly
  let offset: i64 = if intra { 171 << (shift - 9) } else { 85 << (shift - 9) };

  let mut nonzero = 0;
  for c in coeff.iter_mut() {
    let sign = if *c < 0 { -1 } else { 1 };
    let level = ((*c as i64).abs() * scale + offset) >> shift;
    let level = level.min(32767);
    if level != 0 {
      nonzero += 1;
    }
    *c = (sign as i64 * level) as i16;
  }
  nonzero
}

pub fn dequantize(coeff: &mut [i16], n: usize, qp: i32, bitdepth: u32) {
  let log2n = n.trailing_zeros() as i32;
  let ts = transform_shift(log2n, bitdepth);
  let scale = DEQUANT_SCALES[(qp % 6) as usize] as i64;
  let shift = 6 - ts;

  for c in coeff.iter_mut() {
    let v = (*c as i64 * scale) << (qp / 6);
    let v = if shift > 0 { (v + (1 << (shift - 1))) >> shift } else { v << -shift };
    *c = v.clamp(-32768, 32767) as i16;
  }
}

// ----- Sub-pel interpolation ---------------------------------------------

// 8-tap luma filters for quarter-pel phases 0..3
const LUMA_FILTER: [[i32; 8]; 4] = [
  [0, 0, 0, 64, 0, 0, 0, 0],
  [-1, 4, -10, 58, 17, -5, 1, 0],
  [-1, 4, -11, 40, 40, -11, 4, -1],
  [0, 1, -5, 17, 58, -10, 4, -1],
];
pub const LUMA_FILTER_OFFSET: i32 = 3;

/// One interpolated luma sample at quarter-pel resolution. `x` and `y`
/// are in quarter-pel units relative to the plane origin.
pub fn sample_luma_qpel(plane: &Plane, x_qpel: i32, y_qpel: i32, max_pixel: i32) -> Pixel {
  let xi = x_qpel >> 2;
  let yi = y_qpel >> 2;
  let fx = (x_qpel & 3) as usize;
  let fy = (y_qpel & 3) as usize;

  if fx == 0 && fy == 0 {
    return plane.at_clamped(xi, yi);
  }

  // Horizontal pass into an 8-row column, then vertical pass.
  let mut rows = [0i32; 8];
  for (r, row) in rows.iter_mut().enumerate() {
    let sy = yi + r as i32 - LUMA_FILTER_OFFSET;
    if fx == 0 {
      *row = plane.at_clamped(xi, sy) as i32 * 64;
    } else {
      let mut acc = 0i32;
      for (t, &w) in LUMA_FILTER[fx].iter().enumerate() {
        acc += w * plane.at_clamped(xi + t as i32 - LUMA_FILTER_OFFSET, sy) as i32;
      }
      *row = acc;
    }
  }

  let acc: i32 = if fy == 0 {
    rows[LUMA_FILTER_OFFSET as usize]
  } else {
    let mut a = 0i64;
    for (t, &w) in LUMA_FILTER[fy].iter().enumerate() {
      a += w as i64 * rows[t] as i64;
    }
    ((a + (1 << 5)) >> 6) as i32
  };

  ((acc + 32) >> 6).clamp(0, max_pixel) as Pixel
}

/// Bilinear chroma sample at 1/8-pel resolution.
pub fn sample_chroma_epel(plane: &Plane, x_epel: i32, y_epel: i32, max_pixel: i32) -> Pixel {
  let xi = x_epel >> 3;
  let yi = y_epel >> 3;
  let fx = (x_epel & 7) as i32;
  let fy = (y_epel & 7) as i32;

  let p00 = plane.at_clamped(xi, yi) as i32;
  let p10 = plane.at_clamped(xi + 1, yi) as i32;
  let p01 = plane.at_clamped(xi, yi + 1) as i32;
  let p11 = plane.at_clamped(xi + 1, yi + 1) as i32;

  let top = p00 * (8 - fx) + p10 * fx;
  let bot = p01 * (8 - fx) + p11 * fx;
  let v = (top * (8 - fy) + bot * fy + 32) >> 6;
  v.clamp(0, max_pixel) as Pixel
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dct_roundtrip_is_close() {
    for &n in &[4usize, 8, 16, 32] {
      let mut residual = vec![0i32; n * n];
      for (i, r) in residual.iter_mut().enumerate() {
        *r = ((i * 7919) % 255) as i32 - 127;
      }
      let mut coeff = vec![0i16; n * n];
      fwd_dct(&residual, n, 8, &mut coeff);
      let mut back = vec![0i32; n * n];
      inv_dct(&coeff, n, 8, &mut back);
      for i in 0..n * n {
        let err = (residual[i] - back[i]).abs();
        assert!(err <= 2, "n={} i={} {} vs {}", n, i, residual[i], back[i]);
      }
    }
  }

  #[test]
  fn flat_block_quantizes_to_dc_only() {
    let n = 8;
    let residual = vec![20i32; n * n];
    let mut coeff = vec![0i16; n * n];
    fwd_dct(&residual, n, 8, &mut coeff);
    quantize(&mut coeff, n, 27, 8, true);
    assert!(coeff[0] != 0);
    for &c in &coeff[1..] {
      assert_eq!(c, 0);
    }
  }

  #[test]
  fn satd_zero_for_identical_blocks() {
    let a: Vec<Pixel> = (0..64).map(|i| (i * 3) as Pixel).collect();
    assert_eq!(satd_any_size(8, 8, &a, 8, &a, 8), 0);
    assert!(satd_any_size(8, 8, &a, 8, &vec![0; 64], 8) > 0);
  }

  #[test]
  fn qpel_phase_zero_is_a_copy() {
    let mut p = Plane::new(16, 16, 0);
    for y in 0..16 {
      for x in 0..16 {
        p.set(x, y, (x * 16 + y) as Pixel);
      }
    }
    assert_eq!(sample_luma_qpel(&p, 5 << 2, 9 << 2, 255), p.at(5, 9));
    // Half-pel between two samples of a linear ramp lands between them
    let hp = sample_luma_qpel(&p, (5 << 2) + 2, 9 << 2, 255);
    assert!(hp >= p.at(5, 9).min(p.at(6, 9)) && hp <= p.at(5, 9).max(p.at(6, 9)));
  }
}
