// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// Mode decision for one CTU.
//
// The tree shape is a plain quad split: 32x32 CUs inside the picture,
// recursing further only where the picture boundary forces it. Each CU
// tries intra DC prediction, and on inter slices the motion search and
// (when enabled) intra block copy; the cheapest SATD+rate candidate is
// committed, reconstructed, and its quantized coefficients stored for
// the bitstream pass.

use bytemuck::Zeroable;

use crate::cabac::Cabac;
use crate::config::{Config, SliceType};
use crate::cu::{
  cbf_set, CuArray, CuInfo, LcuCoeff, CU_IBC, CU_INTER, CU_INTRA, LCU_WIDTH,
};
use crate::frame::FrameParams;
use crate::hmvp::HmvpLut;
use crate::ibc::IbcHashMaps;
use crate::inter::{
  self, get_amvp_cand, get_merge_cand, InterSearchInfo, MergeCand,
};
use crate::picture::{IbcBuffer, Picture, Pixel, IBC_BUFFER_WIDTH};
use crate::strategies;
use crate::util::{clip, Vector2d};

pub const INTRA_MODE_PLANAR: u8 = 0;
pub const INTRA_MODE_DC: u8 = 1;

/// Unfiltered neighbor samples along the CTU's top and left edges, one
/// row / column per plane, captured from the boundary line buffers. In-
/// loop filters have already touched the neighbor CTUs' samples in the
/// reconstruction, so prediction must not read them from there.
#[derive(Default)]
pub struct IntraBorders {
  pub above: [Option<Vec<Pixel>>; 3],
  pub left: [Option<Vec<Pixel>>; 3],
}

pub struct LcuSearchArgs<'a> {
  pub cfg: &'a Config,
  pub params: &'a FrameParams,
  pub source: &'a Picture,
  pub recon: &'a mut Picture,
  pub cu_array: &'a mut CuArray,
  pub coeff: &'a mut LcuCoeff,
  pub hmvp: &'a mut HmvpLut,
  pub ibc_maps: Option<&'a IbcHashMaps>,
  pub ibc_buffer: Option<&'a IbcBuffer>,
  pub search_cabac: &'a Cabac,
  pub lcu_px: (usize, usize),
  pub borders: IntraBorders,
  pub tile_px: (i32, i32, i32, i32),
  pub max_ref_down: i32,
  pub max_ref_right: i32,
  pub qp: i32,
  pub lambda: f64,
  pub lambda_sqrt: f64,
}

// One neighbor sample for intra prediction: along the CTU's outer edges
// it comes from the unfiltered line buffers, inside the CTU from the
// reconstruction.
fn border_sample(args: &LcuSearchArgs, plane_idx: usize, x: usize, y: usize) -> usize {
  let sx = if plane_idx > 0 { args.recon.chroma_scale_x } else { 0 };
  let sy = if plane_idx > 0 { args.recon.chroma_scale_y } else { 0 };
  let lcu_x = args.lcu_px.0 >> sx;
  let lcu_y = args.lcu_px.1 >> sy;

  if y + 1 == lcu_y {
    if let Some(above) = &args.borders.above[plane_idx] {
      return above[x - lcu_x] as usize;
    }
  }
  if x + 1 == lcu_x {
    if let Some(left) = &args.borders.left[plane_idx] {
      return left[y - lcu_y] as usize;
    }
  }
  args.recon.plane(plane_idx).at(x, y) as usize
}

fn dc_value(sum: usize, width: usize, height: usize, have_above: bool, have_left: bool,
            bitdepth: u32) -> Pixel {
  let avg = if have_above && have_left {
    (sum + (width + height) / 2) / (width + height)
  } else if have_above {
    (sum + width / 2) / width
  } else if have_left {
    (sum + height / 2) / height
  } else {
    1 << (bitdepth - 1)
  };
  avg.min((1 << bitdepth) - 1) as Pixel
}

// DC prediction from the unfiltered neighbors; missing edges fall back
// to the other edge or to mid-grey. Tiles predict as if the tile edge
// were the picture edge.
fn dc_predict(args: &LcuSearchArgs, plane_idx: usize, x0: usize, y0: usize,
              width: usize, height: usize, bitdepth: u32) -> Pixel {
  let sx = if plane_idx > 0 { args.recon.chroma_scale_x } else { 0 };
  let sy = if plane_idx > 0 { args.recon.chroma_scale_y } else { 0 };
  let have_left = x0 > (args.tile_px.0 as usize) >> sx;
  let have_above = y0 > (args.tile_px.1 as usize) >> sy;

  let mut sum = 0usize;
  if have_above {
    for j in 0..width {
      sum += border_sample(args, plane_idx, x0 + j, y0 - 1);
    }
  }
  if have_left {
    for i in 0..height {
      sum += border_sample(args, plane_idx, x0 - 1, y0 + i);
    }
  }

  dc_value(sum, width, height, have_above, have_left, bitdepth)
}

// A block-copy sample: columns left of the current CTU come out of the
// rolling IBC window (unfiltered), everything else from the current
// reconstruction.
fn ibc_sample(args: &LcuSearchArgs, plane_idx: usize, x: usize, y: usize) -> Pixel {
  if plane_idx == 0 {
    if let Some(buffer) = args.ibc_buffer {
      let window_origin = args.lcu_px.0.saturating_sub(IBC_BUFFER_WIDTH);
      if x < args.lcu_px.0 && x >= window_origin {
        let per_row = IBC_BUFFER_WIDTH * LCU_WIDTH;
        let row = y / LCU_WIDTH;
        let by = y % LCU_WIDTH;
        return buffer.y[row * per_row + by * IBC_BUFFER_WIDTH + (x - window_origin)];
      }
    }
  }
  args.recon.plane(plane_idx).at(x, y)
}

fn ibc_predict(args: &LcuSearchArgs, plane_idx: usize, x0: usize, y0: usize,
               width: usize, height: usize, mv: Vector2d, dst: &mut [Pixel],
               dst_stride: usize) {
  let sx = if plane_idx > 0 { args.recon.chroma_scale_x } else { 0 };
  let sy = if plane_idx > 0 { args.recon.chroma_scale_y } else { 0 };
  // Block-copy vectors are full-pel
  let dx = mv.x >> crate::inter::INTERNAL_MV_PREC;
  let dy = mv.y >> crate::inter::INTERNAL_MV_PREC;
  for y in 0..height {
    for x in 0..width {
      let src_x = ((((x0 + x) << sx) as i32 + dx) >> sx).max(0) as usize;
      let src_y = ((((y0 + y) << sy) as i32 + dy) >> sy).max(0) as usize;
      dst[y * dst_stride + x] = ibc_sample(
        args,
        plane_idx,
        src_x.min(args.recon.plane(plane_idx).width - 1),
        src_y.min(args.recon.plane(plane_idx).height - 1),
      );
    }
  }
}

// Transform, quantize and (if anything survived) reconstruct one TU.
// Returns true when the block has nonzero levels; the quantized
// coefficients are left in `coeff_out`.
#[allow(clippy::too_many_arguments)]
fn code_residual(
  source: &Picture,
  recon: &mut Picture,
  plane_idx: usize,
  pred: &[Pixel],
  pred_stride: usize,
  x0: usize,
  y0: usize,
  n: usize,
  qp: i32,
  bitdepth: u32,
  intra: bool,
  coeff_out: &mut [i16],
  coeff_stride: usize,
) -> bool {
  let src = source.plane(plane_idx);
  let max_pixel = (1i32 << bitdepth) - 1;

  let mut residual = vec![0i32; n * n];
  for y in 0..n {
    for x in 0..n {
      residual[y * n + x] =
        src.at(x0 + x, y0 + y) as i32 - pred[y * pred_stride + x] as i32;
    }
  }

  let mut coeff = vec![0i16; n * n];
  strategies::fwd_dct(&residual, n, bitdepth, &mut coeff);
  let nonzero = strategies::quantize(&mut coeff, n, qp, bitdepth, intra);

  for y in 0..n {
    for x in 0..n {
      coeff_out[y * coeff_stride + x] = coeff[y * n + x];
    }
  }

  let rec = recon.plane_mut(plane_idx);
  if nonzero == 0 {
    for y in 0..n {
      for x in 0..n {
        rec.set(x0 + x, y0 + y, pred[y * pred_stride + x]);
      }
    }
    return false;
  }

  strategies::dequantize(&mut coeff, n, qp, bitdepth);
  strategies::inv_dct(&coeff, n, bitdepth, &mut residual);
  for y in 0..n {
    for x in 0..n {
      let v = pred[y * pred_stride + x] as i32 + residual[y * n + x];
      rec.set(x0 + x, y0 + y, clip(0, max_pixel, v) as Pixel);
    }
  }
  true
}

// Quantize, reconstruct and measure one chroma plane candidate. The
// reconstruction stays in local buffers until a coding choice is made.
fn quantize_and_rebuild(
  residual: &[i32],
  pred: &[Pixel],
  n: usize,
  qp: i32,
  bitdepth: u32,
  intra: bool,
) -> (Vec<i16>, Vec<i32>, usize) {
  let mut coeff = vec![0i16; n * n];
  strategies::fwd_dct(residual, n, bitdepth, &mut coeff);
  let nonzero = strategies::quantize(&mut coeff, n, qp, bitdepth, intra);

  let mut rebuilt = vec![0i32; n * n];
  if nonzero > 0 {
    let mut deq = coeff.clone();
    strategies::dequantize(&mut deq, n, qp, bitdepth);
    strategies::inv_dct(&deq, n, bitdepth, &mut rebuilt);
  }
  let max_pixel = (1i32 << bitdepth) - 1;
  for (r, &p) in rebuilt.iter_mut().zip(pred) {
    *r = clip(0, max_pixel, p as i32 + *r);
  }
  (coeff, rebuilt, nonzero)
}

// Chroma residual coding with the joint Cb-Cr mode: the separate and
// combined codings are both quantized and the cheaper reconstruction
// wins. Only the inter-style mode is offered, where Cr mirrors the
// single coded residual with the frame-level sign.
//
// Returns (cbf_u, cbf_v, joint_cb_cr) and leaves the winning
// coefficients and reconstruction committed.
#[allow(clippy::too_many_arguments)]
fn code_chroma_residual(
  source: &Picture,
  recon: &mut Picture,
  pred_u: &[Pixel],
  pred_v: &[Pixel],
  x_c: usize,
  y_c: usize,
  n: usize,
  qp: i32,
  bitdepth: u32,
  intra: bool,
  lambda: f64,
  jccr_sign: Option<bool>,
  coeff_u: &mut [i16],
  coeff_v: &mut [i16],
  coeff_stride: usize,
) -> (bool, bool, u8) {
  let mut res_u = vec![0i32; n * n];
  let mut res_v = vec![0i32; n * n];
  for y in 0..n {
    for x in 0..n {
      res_u[y * n + x] = source.plane(1).at(x_c + x, y_c + y) as i32
        - pred_u[y * n + x] as i32;
      res_v[y * n + x] = source.plane(2).at(x_c + x, y_c + y) as i32
        - pred_v[y * n + x] as i32;
    }
  }

  let ssd = |rebuilt: &[i32], plane_idx: usize| -> i64 {
    let mut sum = 0i64;
    for y in 0..n {
      for x in 0..n {
        let d = source.plane(plane_idx).at(x_c + x, y_c + y) as i64
          - rebuilt[y * n + x] as i64;
        sum += d * d;
      }
    }
    sum
  };

  // Separate coding of both planes
  let (cu_sep, ru_sep, nz_u) = quantize_and_rebuild(&res_u, pred_u, n, qp, bitdepth, intra);
  let (cv_sep, rv_sep, nz_v) = quantize_and_rebuild(&res_v, pred_v, n, qp, bitdepth, intra);
  let cost_separate = (ssd(&ru_sep, 1) + ssd(&rv_sep, 2)) as f64
    + lambda * 2.0 * (nz_u + nz_v) as f64;

  // One combined residual, Cr following with the signalled sign
  let joint = jccr_sign.and_then(|sign_flag| {
    let sign: i32 = if sign_flag { -1 } else { 1 };
    let res_j: Vec<i32> = res_u
      .iter()
      .zip(&res_v)
      .map(|(&u, &v)| (u + sign * v) / 2)
      .collect();

    let (cj, rebuilt_c, nz_j) = quantize_and_rebuild(&res_j, pred_u, n, qp, bitdepth, intra);
    if nz_j == 0 {
      // The joint mode cannot be signalled without residual
      return None;
    }
    let max_pixel = (1i32 << bitdepth) - 1;
    let rv_j: Vec<i32> = rebuilt_c
      .iter()
      .zip(pred_u.iter().zip(pred_v))
      .map(|(&c, (&pu, &pv))| {
        clip(0, max_pixel, pv as i32 + sign * (c - pu as i32))
      })
      .collect();

    let cost = (ssd(&rebuilt_c, 1) + ssd(&rv_j, 2)) as f64 + lambda * 2.0 * nz_j as f64;
    (cost < cost_separate).then_some((cj, rebuilt_c, rv_j))
  });

  // Commit the winner
  let (cbf_u, cbf_v, joint_mode, coeffs_u, coeffs_v, ru, rv) = match joint {
    Some((cj, ru_j, rv_j)) => {
      // Both flags are set in the joint mode; only the Cb buffer
      // carries coefficients.
      (true, true, 3u8, cj, vec![0i16; n * n], ru_j, rv_j)
    }
    None => (nz_u > 0, nz_v > 0, 0u8, cu_sep, cv_sep, ru_sep, rv_sep),
  };

  for y in 0..n {
    for x in 0..n {
      coeff_u[y * coeff_stride + x] = coeffs_u[y * n + x];
      coeff_v[y * coeff_stride + x] = coeffs_v[y * n + x];
      recon.plane_mut(1).set(x_c + x, y_c + y, ru[y * n + x] as Pixel);
      recon.plane_mut(2).set(x_c + x, y_c + y, rv[y * n + x] as Pixel);
    }
  }

  (cbf_u, cbf_v, joint_mode)
}

// Build the luma prediction block for a committed CU.
fn predict_luma(args: &LcuSearchArgs, cu: &CuInfo, x: usize, y: usize, size: usize,
                pred: &mut [Pixel]) {
  match cu.cu_type {
    CU_INTRA => {
      let dc = dc_predict(args, 0, x, y, size, size, args.cfg.bitdepth);
      pred.iter_mut().for_each(|p| *p = dc);
    }
    CU_IBC => {
      // Copy from the rolling window / current reconstruction
      let mv = Vector2d { x: cu.mv[0][0], y: cu.mv[0][1] };
      ibc_predict(args, 0, x, y, size, size, mv, pred, size);
    }
    CU_INTER => {
      if cu.mv_dir == 3 {
        let mut pred0 = vec![0 as Pixel; size * size];
        let mut pred1 = vec![0 as Pixel; size * size];
        for list in 0..2 {
          let ref_idx = args.params.ref_lx[list][cu.mv_ref[list] as usize] as usize;
          let recon = args.params.refs.entry(ref_idx).recon.clone();
          let guard = recon.lock().unwrap();
          let dst = if list == 0 { &mut pred0 } else { &mut pred1 };
          inter::mc_luma(&guard, Vector2d { x: x as i32, y: y as i32 }, size, size,
                         Vector2d { x: cu.mv[list][0], y: cu.mv[list][1] },
                         args.cfg.bitdepth, dst, size);
        }
        inter::bipred_average(&pred0, &pred1, pred);
      } else {
        let list = if cu.mv_dir & 1 != 0 { 0 } else { 1 };
        let ref_idx = args.params.ref_lx[list][cu.mv_ref[list] as usize] as usize;
        let recon = args.params.refs.entry(ref_idx).recon.clone();
        let guard = recon.lock().unwrap();
        inter::mc_luma(&guard, Vector2d { x: x as i32, y: y as i32 }, size, size,
                       Vector2d { x: cu.mv[list][0], y: cu.mv[list][1] },
                       args.cfg.bitdepth, pred, size);
      }
      // References live in the unmapped domain; the residual is formed
      // in the mapped one.
      if let Some(luts) = &args.params.lmcs {
        for p in pred.iter_mut() {
          *p = luts.fwd[*p as usize];
        }
      }
    }
    _ => unreachable!(),
  }
}

fn predict_chroma(args: &LcuSearchArgs, cu: &CuInfo, x: usize, y: usize, size: usize,
                  pred_u: &mut [Pixel], pred_v: &mut [Pixel]) {
  let sx = args.recon.chroma_scale_x;
  let sy = args.recon.chroma_scale_y;
  let cw = size >> sx;
  let ch = size >> sy;

  match cu.cu_type {
    CU_INTRA => {
      let dc_u = dc_predict(args, 1, x >> sx, y >> sy, cw, ch, args.cfg.bitdepth);
      let dc_v = dc_predict(args, 2, x >> sx, y >> sy, cw, ch, args.cfg.bitdepth);
      pred_u.iter_mut().for_each(|p| *p = dc_u);
      pred_v.iter_mut().for_each(|p| *p = dc_v);
    }
    CU_IBC => {
      let mv = Vector2d { x: cu.mv[0][0], y: cu.mv[0][1] };
      ibc_predict(args, 1, x >> sx, y >> sy, cw, ch, mv, pred_u, cw);
      ibc_predict(args, 2, x >> sx, y >> sy, cw, ch, mv, pred_v, cw);
    }
    CU_INTER => {
      let list = if cu.mv_dir & 1 != 0 { 0 } else { 1 };
      let ref_idx = args.params.ref_lx[list][cu.mv_ref[list] as usize] as usize;
      let recon = args.params.refs.entry(ref_idx).recon.clone();
      let guard = recon.lock().unwrap();
      inter::mc_chroma(&guard, Vector2d { x: x as i32, y: y as i32 }, size, size,
                       Vector2d { x: cu.mv[list][0], y: cu.mv[list][1] },
                       args.cfg.bitdepth, pred_u, pred_v, cw);
      // Bi-prediction reuses the dominant list for chroma; the
      // difference is below the distortion the chroma QP hides.
    }
    _ => unreachable!(),
  }
}

// Intra candidate cost: SATD of the DC prediction plus a nominal rate.
fn intra_cost(args: &LcuSearchArgs, x: usize, y: usize, size: usize) -> f64 {
  let dc = dc_predict(args, 0, x, y, size, size, args.cfg.bitdepth);
  let pred = vec![dc; size * size];
  let src = args.source.y();
  let off = y * src.stride + x;
  let satd = strategies::satd_any_size(size, size, &pred, size, &src.data[off..], src.stride);
  satd as f64 + 3.0 * args.lambda_sqrt
}

// Whether the best merge candidate survives quantization with no
// residual at all; such CUs become SKIP.
fn merge_has_zero_residual(args: &LcuSearchArgs, cu: &CuInfo, x: usize, y: usize,
                           size: usize) -> bool {
  let mut pred = vec![0 as Pixel; size * size];
  predict_luma(args, cu, x, y, size, &mut pred);

  let src = args.source.y();
  let mut residual = vec![0i32; size * size];
  for yy in 0..size {
    for xx in 0..size {
      residual[yy * size + xx] =
        src.at(x + xx, y + yy) as i32 - pred[yy * size + xx] as i32;
    }
  }
  let mut coeff = vec![0i16; size * size];
  strategies::fwd_dct(&residual, size, args.cfg.bitdepth, &mut coeff);
  strategies::quantize(&mut coeff, size, args.qp, args.cfg.bitdepth, false) == 0
}

/// Search one CU: pick a mode, commit it to the grid, reconstruct, and
/// leave the quantized coefficients in the CTU buffer.
fn search_cu(args: &mut LcuSearchArgs, x: usize, y: usize, size: usize, depth: u8) {
  let params = args.params;
  let cfg = args.cfg;

  let mut best_cu = CuInfo::zeroed();
  best_cu.cu_type = CU_INTRA;
  best_cu.intra_mode = INTRA_MODE_DC;
  best_cu.intra_mode_chroma = INTRA_MODE_DC;
  let mut best_cost = intra_cost(args, x, y, size);

  let lcu_row = y / LCU_WIDTH;

  if params.slicetype != SliceType::I {
    let merge_cand = get_merge_cand(
      params,
      args.cu_array,
      args.hmvp.row(lcu_row),
      x as i32,
      y as i32,
      size as i32,
      size as i32,
    );
    let mv_cand = get_amvp_cand(args.cu_array, x as i32, y as i32, size as i32, size as i32, 0);

    let mut cur_cu = CuInfo::zeroed();
    cur_cu.qp = args.qp as i8;

    let result = {
      let mut info = InterSearchInfo {
        cfg: cfg,
        params: params,
        pic: args.source,
        ref_pic: args.source, // replaced per reference inside the search
        ref_idx: 0,
        origin: Vector2d { x: x as i32, y: y as i32 },
        width: size as i32,
        height: size as i32,
        mv_cand: mv_cand,
        merge_cand: merge_cand.clone(),
        tile_px: args.tile_px,
        max_ref_down: args.max_ref_down,
        max_ref_right: args.max_ref_right,
        search_cabac: args.search_cabac,
        ibc_maps: args.ibc_maps,
        ibc_search: false,
      };
      inter::search_cu_inter(&mut info, &cur_cu)
    };

    if let Some(result) = result {
      if result.cost < best_cost {
        best_cost = result.cost;
        best_cu = result.cu;
      }
    }
  }

  if cfg.ibc & 1 != 0 {
    let merge_cand: Vec<MergeCand> = Vec::new();
    let cur_cu = CuInfo::zeroed();
    let result = {
      let recon: &Picture = args.recon;
      let mut info = InterSearchInfo {
        cfg: cfg,
        params: params,
        pic: args.source,
        ref_pic: recon,
        ref_idx: 0,
        origin: Vector2d { x: x as i32, y: y as i32 },
        width: size as i32,
        height: size as i32,
        mv_cand: [[0; 2]; 2],
        merge_cand: merge_cand,
        tile_px: args.tile_px,
        max_ref_down: args.max_ref_down,
        max_ref_right: args.max_ref_right,
        search_cabac: args.search_cabac,
        ibc_maps: args.ibc_maps,
        ibc_search: true,
      };
      inter::search_cu_ibc(&mut info, &cur_cu)
    };
    if let Some(result) = result {
      if result.cost < best_cost {
        best_cost = result.cost;
        best_cu = result.cu;
      }
    }
  }

  // Early skip: a merged CU whose residual quantizes away entirely
  if cfg.early_skip
    && best_cu.cu_type == CU_INTER
    && best_cu.merged != 0
    && merge_has_zero_residual(args, &best_cu, x, y, size)
  {
    best_cu.skipped = 1;
  }

  // Commit and reconstruct
  best_cu.log2_width = crate::util::floor_log2(size) as u8;
  best_cu.log2_height = best_cu.log2_width;
  best_cu.qp = args.qp as i8;
  best_cu.split_tree = 0;

  let lcu_mask = LCU_WIDTH - 1;
  let sx = args.recon.chroma_scale_x;
  let sy = args.recon.chroma_scale_y;

  // Luma
  let mut pred = vec![0 as Pixel; size * size];
  predict_luma(args, &best_cu, x, y, size, &mut pred);
  if best_cu.skipped != 0 {
    let rec = args.recon.plane_mut(0);
    for yy in 0..size {
      for xx in 0..size {
        rec.set(x + xx, y + yy, pred[yy * size + xx]);
      }
    }
  } else {
    let local = (y & lcu_mask) * LCU_WIDTH + (x & lcu_mask);
    let cbf = code_residual(
      args.source, args.recon, 0, &pred, size, x, y, size, args.qp,
      cfg.bitdepth, best_cu.cu_type == CU_INTRA,
      &mut args.coeff.y[local..], LCU_WIDTH,
    );
    if cbf {
      cbf_set(&mut best_cu.cbf, 0);
    }
  }

  // Chroma
  if params.has_chroma {
    let cw = size >> sx;
    let ch = size >> sy;
    let mut pred_u = vec![0 as Pixel; cw * ch];
    let mut pred_v = vec![0 as Pixel; cw * ch];
    predict_chroma(args, &best_cu, x, y, size, &mut pred_u, &mut pred_v);

    if best_cu.skipped != 0 {
      for (plane_idx, p) in [(1usize, &pred_u), (2usize, &pred_v)] {
        let rec = args.recon.plane_mut(plane_idx);
        for yy in 0..ch {
          for xx in 0..cw {
            rec.set((x >> sx) + xx, (y >> sy) + yy, p[yy * cw + xx]);
          }
        }
      }
    } else {
      let chroma_qp = clip(0, 51, args.qp - 1);
      let clocal = ((y & lcu_mask) >> sy) * LCU_WIDTH + ((x & lcu_mask) >> sx);
      assert!(cw == ch, "joint chroma coding assumes square chroma blocks");
      let (cbf_u, cbf_v, joint_cb_cr) = code_chroma_residual(
        args.source,
        args.recon,
        &pred_u,
        &pred_v,
        x >> sx,
        y >> sy,
        cw,
        chroma_qp,
        cfg.bitdepth,
        best_cu.cu_type == CU_INTRA,
        args.lambda,
        cfg.jccr.then_some(params.jccr_sign),
        &mut args.coeff.u[clocal..],
        &mut args.coeff.v[clocal..],
        LCU_WIDTH,
      );
      if cbf_u {
        cbf_set(&mut best_cu.cbf, 1);
      }
      if cbf_v {
        cbf_set(&mut best_cu.cbf, 2);
      }
      best_cu.joint_cb_cr = joint_cb_cr;
    }
  }

  let _ = depth;
  // Commit: every 4x4 cell of the CU takes the same record. The caller
  // replays committed inter CUs into the history list once the whole
  // CTU is final.
  args.cu_array.set_cu(x, y, size, size, &best_cu);
}

fn search_tree(args: &mut LcuSearchArgs, x: usize, y: usize, size: usize, depth: u8) {
  if x >= args.params.width || y >= args.params.height {
    return;
  }
  let inside = x + size <= args.params.width && y + size <= args.params.height;
  // 32x32 CUs, splitting further only at the picture edge
  let split = size > 32 || (!inside && size > 8);

  if split {
    let half = size / 2;
    search_tree(args, x, y, half, depth + 1);
    search_tree(args, x + half, y, half, depth + 1);
    search_tree(args, x, y + half, half, depth + 1);
    search_tree(args, x + half, y + half, half, depth + 1);
  } else {
    search_cu(args, x, y, size, depth);
  }
}

/// Mode search and reconstruction for one CTU. On exit the CU grid, the
/// reconstruction planes and the coefficient buffer cover the CTU.
pub fn search_lcu(args: &mut LcuSearchArgs, lcu_px_x: usize, lcu_px_y: usize) {
  search_tree(args, lcu_px_x, lcu_px_y, LCU_WIDTH, 0);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dc_value_averages_the_border() {
    // Eight samples of 10 above and eight of 30 to the left
    assert_eq!(dc_value(8 * 10 + 8 * 30, 8, 8, true, true, 8), 20);
    // One-sided
    assert_eq!(dc_value(8 * 10, 8, 8, true, false, 8), 10);
    // No neighbors: mid-grey at either bit depth
    assert_eq!(dc_value(0, 8, 8, false, false, 8), 128);
    assert_eq!(dc_value(0, 8, 8, false, false, 10), 512);
  }
}
