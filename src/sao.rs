// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// Sample-adaptive offset.
//
// Parameter search runs on the deblocked CTU against the source; the
// reconstruction is delayed and happens in four parts per CTU because the
// filter reaches a few samples into the neighbors (see the pipeline
// module for the boundary bookkeeping).

use crate::cabac::Cabac;
use crate::context::{CTX_SAO_MERGE, CTX_SAO_TYPE};
use crate::picture::Pixel;
use crate::util::clip;

pub const SAO_DELAY_PX: usize = 5;
pub const DEBLOCK_DELAY_PX: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SaoMode {
  #[default]
  None,
  Band,
  Edge,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SaoInfo {
  pub mode: SaoMode,
  pub eo_class: u32,
  /// Categories 1..4 at indices 1..4 (first channel) and 6..9 (second)
  pub offsets: [i32; 10],
  pub band_position: [u32; 2],
  pub merge_left_flag: bool,
  pub merge_up_flag: bool,
}

pub fn sao_abs_offset_max(bitdepth: u32) -> u32 {
  (1 << (bitdepth.min(10) - 5)) - 1
}

// Relative neighbor positions for the four edge classes:
// horizontal, vertical, 135 degree, 45 degree
const EO_OFFSETS: [[(i32, i32); 2]; 4] = [
  [(-1, 0), (1, 0)],
  [(0, -1), (0, 1)],
  [(-1, -1), (1, 1)],
  [(1, -1), (-1, 1)],
];

fn eo_category(c: i32, a: i32, b: i32) -> usize {
  if c < a && c < b {
    1
  } else if (c < a && c == b) || (c == a && c < b) {
    2
  } else if (c > a && c == b) || (c == a && c > b) {
    3
  } else if c > a && c > b {
    4
  } else {
    0
  }
}

/// Apply SAO to a rectangle. `src` is a snapshot of the unfiltered
/// samples with at least a one-sample border around the rectangle (the
/// pipeline assembles it from the delayed boundary buffers); `dst` is
/// the reconstruction plane.
pub fn sao_reconstruct_region(
  src: &[Pixel],
  src_stride: usize,
  src_origin: usize, // index of the rectangle's top-left inside src
  dst: &mut [Pixel],
  dst_stride: usize,
  dst_origin: usize,
  width: usize,
  height: usize,
  sao: &SaoInfo,
  channel: usize, // 0 for Y/U offsets, 1 for V
  bitdepth: u32,
) {
  let max_pixel = (1i32 << bitdepth) - 1;
  let off_base = channel * 5;

  match sao.mode {
    SaoMode::None => {
      for y in 0..height {
        let s = src_origin + y * src_stride;
        let d = dst_origin + y * dst_stride;
        dst[d..d + width].copy_from_slice(&src[s..s + width]);
      }
    }
    SaoMode::Band => {
      let shift = bitdepth - 5;
      let band_pos = sao.band_position[channel] as i32;
      for y in 0..height {
        for x in 0..width {
          let v = src[src_origin + y * src_stride + x] as i32;
          let band = (v >> shift) - band_pos;
          let offset = if (0..4).contains(&band) {
            sao.offsets[off_base + 1 + band as usize]
          } else {
            0
          };
          dst[dst_origin + y * dst_stride + x] = clip(0, max_pixel, v + offset) as Pixel;
        }
      }
    }
    SaoMode::Edge => {
      let (d0, d1) = (EO_OFFSETS[sao.eo_class as usize][0], EO_OFFSETS[sao.eo_class as usize][1]);
      for y in 0..height {
        for x in 0..width {
          let at = |dx: i32, dy: i32| {
            let idx = src_origin as i32 + (y as i32 + dy) * src_stride as i32 + x as i32 + dx;
            src[idx as usize] as i32
          };
          let c = at(0, 0);
          let cat = eo_category(c, at(d0.0, d0.1), at(d1.0, d1.1));
          let offset = if cat > 0 { sao.offsets[off_base + cat] } else { 0 };
          dst[dst_origin + y * dst_stride + x] = clip(0, max_pixel, c + offset) as Pixel;
        }
      }
    }
  }
}

// Mean source-minus-recon difference per category, clamped to the
// signalled offset range and pushed towards zero like every SAO search
// does (categories 1/2 only get positive offsets, 3/4 only negative).
fn derive_offsets(
  sum: &[i64; 5],
  count: &[i64; 5],
  max_offset: i32,
  signs: [i32; 5],
) -> [i32; 5] {
  let mut offsets = [0i32; 5];
  for cat in 1..5 {
    if count[cat] == 0 {
      continue;
    }
    let mean = (sum[cat] as f64 / count[cat] as f64).round() as i32;
    let clamped = clip(-max_offset, max_offset, mean);
    // Wrong-signed offsets hurt more often than they help
    offsets[cat] = if clamped * signs[cat] >= 0 { clamped } else { 0 };
  }
  offsets
}

fn sse_delta(sum: &[i64; 5], count: &[i64; 5], offsets: &[i32; 5]) -> i64 {
  // For each category, applying offset h changes SSE by
  // count*h^2 - 2*h*sum.
  let mut delta = 0i64;
  for cat in 1..5 {
    let h = offsets[cat] as i64;
    delta += count[cat] * h * h - 2 * h * sum[cat];
  }
  delta
}

/// Pick the SAO parameters for one plane of one CTU: the best of "off",
/// the best band window, and the four edge classes, by SSE improvement
/// with a small lambda-weighted rate charge.
pub fn sao_search_plane(
  source: &[Pixel],
  source_stride: usize,
  recon: &[Pixel],
  recon_stride: usize,
  width: usize,
  height: usize,
  bitdepth: u32,
  lambda: f64,
  channel: usize,
) -> SaoInfo {
  let max_offset = sao_abs_offset_max(bitdepth) as i32;
  let mut best = SaoInfo::default();
  let mut best_cost = lambda; // cost of coding "off"

  // Edge classes. Border samples are excluded so the search never reads
  // outside the snapshot.
  for eo_class in 0..4u32 {
    let mut sum = [0i64; 5];
    let mut count = [0i64; 5];
    let (d0, d1) = (EO_OFFSETS[eo_class as usize][0], EO_OFFSETS[eo_class as usize][1]);

    for y in 1..height.saturating_sub(1) {
      for x in 1..width.saturating_sub(1) {
        let c = recon[y * recon_stride + x] as i32;
        let a = recon[(y as i32 + d0.1) as usize * recon_stride + (x as i32 + d0.0) as usize] as i32;
        let b = recon[(y as i32 + d1.1) as usize * recon_stride + (x as i32 + d1.0) as usize] as i32;
        let cat = eo_category(c, a, b);
        if cat > 0 {
          sum[cat] += source[y * source_stride + x] as i64 - c as i64;
          count[cat] += 1;
        }
      }
    }

    let offsets = derive_offsets(&sum, &count, max_offset, [0, 1, 1, -1, -1]);
    let rate = 2.0 + offsets.iter().map(|o| o.unsigned_abs() as f64 + 1.0).sum::<f64>();
    let cost = sse_delta(&sum, &count, &offsets) as f64 + lambda * rate;
    if cost < best_cost {
      best_cost = cost;
      best.mode = SaoMode::Edge;
      best.eo_class = eo_class;
      best.offsets = [0; 10];
      for cat in 1..5 {
        best.offsets[channel * 5 + cat] = offsets[cat];
      }
    }
  }

  // Band offset: accumulate per 32 bands, then slide a 4-band window
  let shift = bitdepth - 5;
  let mut band_sum = [0i64; 32];
  let mut band_count = [0i64; 32];
  for y in 0..height {
    for x in 0..width {
      let r = recon[y * recon_stride + x] as i32;
      let band = (r >> shift) as usize;
      band_sum[band] += source[y * source_stride + x] as i64 - r as i64;
      band_count[band] += 1;
    }
  }
  for pos in 0..29u32 {
    let mut sum = [0i64; 5];
    let mut count = [0i64; 5];
    for i in 0..4 {
      sum[i + 1] = band_sum[pos as usize + i];
      count[i + 1] = band_count[pos as usize + i];
    }
    let offsets = derive_offsets(&sum, &count, max_offset, [0; 5]);
    let rate = 7.0 + offsets.iter().map(|o| o.unsigned_abs() as f64 + 1.0).sum::<f64>();
    let cost = sse_delta(&sum, &count, &offsets) as f64 + lambda * rate;
    if cost < best_cost {
      best_cost = cost;
      best.mode = SaoMode::Band;
      best.band_position[channel] = pos;
      best.offsets = [0; 10];
      for cat in 1..5 {
        best.offsets[channel * 5 + cat] = offsets[cat];
      }
    }
  }

  best
}

// ----- Syntax -------------------------------------------------------------

fn encode_sao_color(cabac: &mut Cabac, sao: &SaoInfo, channel: usize, is_v: bool, bitdepth: u32) {
  let offset_index = if is_v { 5 } else { 0 };
  let _ = channel;

  // sao_type_idx is shared between U and V; V only codes offsets
  if !is_v {
    cabac.encode_bin_ctx(CTX_SAO_TYPE, (sao.mode != SaoMode::None) as u32);
    match sao.mode {
      SaoMode::Band => cabac.encode_bin_ep(0),
      SaoMode::Edge => cabac.encode_bin_ep(1),
      SaoMode::None => {}
    }
  }

  if sao.mode == SaoMode::None {
    return;
  }

  for i in 1..5 {
    cabac.write_unary_max_symbol_ep(
      sao.offsets[i + offset_index].unsigned_abs(),
      sao_abs_offset_max(bitdepth),
    );
  }

  if sao.mode == SaoMode::Band {
    for i in 1..5 {
      if sao.offsets[i + offset_index] != 0 {
        // Positive sign is coded as 0
        cabac.encode_bin_ep((sao.offsets[i + offset_index] < 0) as u32);
      }
    }
    cabac.encode_bins_ep(sao.band_position[is_v as usize], 5);
  } else if !is_v {
    cabac.encode_bins_ep(sao.eo_class, 2);
  }
}

/// SAO syntax for one CTU: merge flags, then per-channel parameters
/// unless merged.
pub fn encode_sao(
  cabac: &mut Cabac,
  x_lcu: usize,
  y_lcu: usize,
  sao_luma: &SaoInfo,
  sao_chroma: Option<&SaoInfo>,
  bitdepth: u32,
) {
  // Merge flags are not present on the first row / column
  if x_lcu > 0 {
    cabac.encode_bin_ctx(CTX_SAO_MERGE, sao_luma.merge_left_flag as u32);
  }
  if y_lcu > 0 && !sao_luma.merge_left_flag {
    cabac.encode_bin_ctx(CTX_SAO_MERGE, sao_luma.merge_up_flag as u32);
  }

  if !sao_luma.merge_left_flag && !sao_luma.merge_up_flag {
    encode_sao_color(cabac, sao_luma, 0, false, bitdepth);
    if let Some(chroma) = sao_chroma {
      encode_sao_color(cabac, chroma, 0, false, bitdepth);
      encode_sao_color(cabac, chroma, 1, true, bitdepth);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn edge_categories_partition_the_neighborhood() {
    assert_eq!(eo_category(1, 5, 5), 1); // local minimum
    assert_eq!(eo_category(5, 5, 7), 2); // flat-then-up valley side
    assert_eq!(eo_category(5, 5, 3), 3); // flat-then-down peak side
    assert_eq!(eo_category(9, 5, 5), 4); // local maximum
    assert_eq!(eo_category(5, 5, 5), 0); // flat
    assert_eq!(eo_category(5, 4, 6), 0); // monotone slope
  }

  #[test]
  fn search_finds_a_constant_bias() {
    // Recon is the source shifted down by 2: a band filter over the busy
    // bands recovers most of it
    let w = 32;
    let h = 32;
    let source: Vec<Pixel> = (0..w * h).map(|i| (100 + (i % 7)) as Pixel).collect();
    let recon: Vec<Pixel> = source.iter().map(|&s| s - 2).collect();

    let sao = sao_search_plane(&source, w, &recon, w, w, h, 8, 1.0, 0);
    assert!(sao.mode != SaoMode::None);

    let mut out = vec![0 as Pixel; w * h];
    sao_reconstruct_region(&recon, w, 0, &mut out, w, 0, w, h, &sao, 0, 8);
    let sse_before: i64 = source.iter().zip(&recon)
      .map(|(&s, &r)| (s as i64 - r as i64).pow(2)).sum();
    let sse_after: i64 = source.iter().zip(&out)
      .map(|(&s, &r)| (s as i64 - r as i64).pow(2)).sum();
    assert!(sse_after < sse_before, "{} !< {}", sse_after, sse_before);
  }

  #[test]
  fn none_mode_copies_through() {
    let src: Vec<Pixel> = (0..64).map(|i| i as Pixel).collect();
    let mut dst = vec![0 as Pixel; 64];
    let sao = SaoInfo::default();
    sao_reconstruct_region(&src, 8, 0, &mut dst, 8, 0, 8, 8, &sao, 0, 8);
    assert_eq!(src, dst);
  }
}
