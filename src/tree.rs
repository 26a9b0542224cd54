// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// Coding tree syntax.
//
// Walks the committed CU grid of one CTU and drives the CABAC coder over
// split flags, prediction syntax and residual coefficients. On I slices
// with the dual tree enabled the luma and chroma trees are walked
// separately.

use crate::cabac::Cabac;
use crate::config::{Config, SliceType};
use crate::context::*;
use crate::cu::{
  cbf_is_set, CuArray, CuInfo, LcuCoeff, SplitTree, CU_IBC, CU_INTER, CU_INTRA,
  LCU_WIDTH, SPLIT_QT,
};
use crate::frame::FrameParams;
use crate::inter::{get_amvp_cand, INTERNAL_MV_PREC, MRG_MAX_NUM_CANDS};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TreeType {
  Both,
  LumaOnly,
  ChromaOnly,
}

/// QP prediction state carried along a leaf's CTU sequence.
pub struct QpCoding {
  pub last_qp: i32,
  /// Set once the delta has been coded in the current quantization group
  pub qp_delta_coded: bool,
}

// ----- Last significant coefficient position ------------------------------

// Position class of a last-coefficient coordinate: 0..3 directly, then
// two classes per power of two (4-5, 6-7, 8-11, 12-15, ...).
const GROUP_IDX: [u32; 64] = {
  let mut t = [0u32; 64];
  let mut i = 0usize;
  while i < 64 {
    t[i] = if i < 4 {
      i as u32
    } else {
      let log = 31 - (i as u32).leading_zeros();
      2 * log + (((i as u32) >> (log - 1)) & 1)
    };
    i += 1;
  }
  t
};

const MIN_IN_GROUP: [u32; 12] = [0, 1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48];

fn encode_last_coord(cabac: &mut Cabac, pos: u32, log2_size: u32, luma: bool, ctx_base: usize) {
  let group_idx = GROUP_IDX[pos as usize];

  let (offset, shift) = if luma {
    (3 * (log2_size as usize - 2) + ((log2_size as usize - 1) >> 2), (log2_size + 1) >> 2)
  } else {
    (15, log2_size - 2)
  };

  let max_group_idx = 2 * (log2_size - 1);
  for bin in 0..group_idx {
    cabac.encode_bin_ctx(ctx_base + offset + (bin >> shift) as usize, 1);
  }
  if group_idx < max_group_idx {
    cabac.encode_bin_ctx(ctx_base + offset + (group_idx >> shift) as usize, 0);
  }

  if group_idx > 3 {
    let suffix_bits = (group_idx >> 1) - 1;
    let suffix = pos - MIN_IN_GROUP[group_idx as usize];
    cabac.encode_bins_ep(suffix, suffix_bits as i32);
  }
}

// Diagonal (up-right) scan over an NxN block, as (x, y) pairs from DC
// outwards.
fn diag_scan(n: usize) -> Vec<(u32, u32)> {
  let mut scan = Vec::with_capacity(n * n);
  for d in 0..(2 * n - 1) {
    // walk each anti-diagonal from bottom-left to top-right
    for x in 0..=d.min(n - 1) {
      let y = d - x;
      if y < n {
        scan.push((x as u32, y as u32));
      }
    }
  }
  scan
}

// ----- Residual coding ----------------------------------------------------

/// Residual coefficients of one TU: last position, significance map by
/// 4x4 groups, magnitude flags, Rice-coded remainders and bypass signs.
fn encode_residual(
  cabac: &mut Cabac,
  coeff: &[i16],
  coeff_stride: usize,
  log2_size: u32,
  luma: bool,
) {
  debug_assert!(log2_size <= 5, "transform too large for the last-position contexts");
  let n = 1usize << log2_size;
  let scan = diag_scan(n);
  let mut pos_of = vec![0usize; n * n];
  for (i, &(x, y)) in scan.iter().enumerate() {
    pos_of[y as usize * n + x as usize] = i;
  }

  // Locate the last significant coefficient in scan order
  let mut last_scan_pos = None;
  for (i, &(x, y)) in scan.iter().enumerate() {
    if coeff[y as usize * coeff_stride + x as usize] != 0 {
      last_scan_pos = Some(i);
    }
  }
  let Some(last_scan_pos) = last_scan_pos else {
    // A coded TU must have at least one nonzero coefficient; the cbf
    // said so.
    debug_assert!(false, "residual coding on an all-zero block");
    return;
  };
  let (last_x, last_y) = scan[last_scan_pos];

  encode_last_coord(cabac, last_x, log2_size, luma, CTX_LAST_X_PREFIX);
  encode_last_coord(cabac, last_y, log2_size, luma, CTX_LAST_Y_PREFIX);

  // Group significance per 4x4 sub-block, then coefficient data in
  // reverse scan order within each group.
  let groups_per_line = n / 4;
  let group_scan = diag_scan(groups_per_line);
  let last_group = {
    let gx = last_x / 4;
    let gy = last_y / 4;
    group_scan.iter().position(|&(x, y)| x == gx && y == gy).unwrap()
  };

  let mut group_nonzero = vec![false; groups_per_line * groups_per_line];
  for &(x, y) in scan.iter().take(last_scan_pos + 1) {
    if coeff[y as usize * coeff_stride + x as usize] != 0 {
      group_nonzero[(y / 4) as usize * groups_per_line + (x / 4) as usize] = true;
    }
  }

  let inner_scan = diag_scan(4);

  for gi in (0..=last_group).rev() {
    let (gx, gy) = group_scan[gi];
    let has_coeff = group_nonzero[gy as usize * groups_per_line + gx as usize];

    // First and last group significance is implicit
    if gi != 0 && gi != last_group {
      let right = gx + 1 < groups_per_line as u32
        && group_nonzero[gy as usize * groups_per_line + gx as usize + 1];
      let below = gy + 1 < groups_per_line as u32
        && group_nonzero[(gy as usize + 1) * groups_per_line + gx as usize];
      let ctx = CTX_SIG_GROUP + (!luma as usize) * 2 + (right || below) as usize;
      cabac.encode_bin_ctx(ctx, has_coeff as u32);
      if !has_coeff {
        continue;
      }
    } else if !has_coeff {
      continue;
    }

    // Collect the group's coefficients in reverse scan order
    let mut levels: Vec<(u32, u32, i32)> = Vec::with_capacity(16);
    for &(ix, iy) in inner_scan.iter().rev() {
      let x = gx * 4 + ix;
      let y = gy * 4 + iy;
      if pos_of[y as usize * n + x as usize] > last_scan_pos {
        continue;
      }
      levels.push((x, y, coeff[y as usize * coeff_stride + x as usize] as i32));
    }

    // Significance flags; the very last coefficient of the TU is
    // implicitly significant.
    for &(x, y, level) in &levels {
      if (x, y) == (last_x, last_y) {
        continue;
      }
      let diag = (x + y) as usize;
      let ctx = if luma {
        CTX_SIG_FLAG + diag.min(23)
      } else {
        CTX_SIG_FLAG + 24 + diag.min(11)
      };
      cabac.encode_bin_ctx(ctx, (level != 0) as u32);
    }

    // Magnitude flags: up to eight greater-1 flags and one greater-2
    // flag per group.
    let sig: Vec<(u32, u32, i32)> = levels.iter().copied().filter(|&(_, _, l)| l != 0).collect();
    let ctx_set = if !luma { 0 } else if gi == 0 { 0 } else { 2 };
    let mut c1 = 1usize;
    let mut first_gt1 = None;
    for (i, &(_, _, level)) in sig.iter().enumerate().take(8) {
      let base = if luma { CTX_COEFF_GT1 } else { CTX_COEFF_GT1 + 16 };
      let ctx = base + ctx_set * 4 + c1.min(3);
      let gt1 = level.abs() > 1;
      cabac.encode_bin_ctx(ctx, gt1 as u32);
      if gt1 {
        c1 = 0;
        if first_gt1.is_none() {
          first_gt1 = Some(i);
        }
      } else if c1 > 0 && c1 < 3 {
        c1 += 1;
      }
    }
    if let Some(first) = first_gt1 {
      let base = if luma { CTX_COEFF_GT2 } else { CTX_COEFF_GT2 + 4 };
      let ctx = base + ctx_set / 2;
      cabac.encode_bin_ctx(ctx, (sig[first].2.abs() > 2) as u32);
    }

    // Remainders with an adaptive Rice parameter
    let mut rice = 0u32;
    for (i, &(_, _, level)) in sig.iter().enumerate() {
      let abs_level = level.unsigned_abs();
      let base_level = if i < 8 {
        if Some(i) == first_gt1 { 3 } else { 2 }
      } else {
        1
      };
      if abs_level >= base_level {
        let remainder = abs_level - base_level;
        cabac.write_coeff_remain(remainder, rice, 3);
        if remainder > (3 << rice) && rice < 4 {
          rice += 1;
        }
      }
    }

    // Signs, bypass coded
    for &(_, _, level) in &sig {
      cabac.encode_bin_ep((level < 0) as u32);
    }
  }
}

// ----- CU syntax ----------------------------------------------------------

fn neighbor_flag(
  cu_array: &CuArray,
  x: i32,
  y: i32,
  f: impl Fn(&CuInfo) -> bool,
) -> bool {
  if x < 0 || y < 0 || x as usize >= cu_array.width || y as usize >= cu_array.height {
    return false;
  }
  f(cu_array.at(x as usize, y as usize))
}

fn encode_merge_index(cabac: &mut Cabac, merge_idx: u32) {
  // First bin context coded, the rest bypass
  cabac.encode_bin_ctx(CTX_MERGE_IDX, (merge_idx != 0) as u32);
  if merge_idx > 0 {
    cabac.write_unary_max_symbol_ep(merge_idx - 1, MRG_MAX_NUM_CANDS as u32 - 2);
  }
}

fn encode_mvd(cabac: &mut Cabac, mvd_x: i32, mvd_y: i32) {
  let abs = [mvd_x.unsigned_abs(), mvd_y.unsigned_abs()];
  cabac.encode_bin_ctx(CTX_MVD_GREATER0, (abs[0] > 0) as u32);
  cabac.encode_bin_ctx(CTX_MVD_GREATER0, (abs[1] > 0) as u32);
  for &a in &abs {
    if a > 0 {
      cabac.encode_bin_ctx(CTX_MVD_GREATER1, (a > 1) as u32);
    }
  }
  for &comp in &[mvd_x, mvd_y] {
    let a = comp.unsigned_abs();
    if a > 1 {
      cabac.write_ep_ex_golomb(a - 2, 1);
    }
    if a > 0 {
      cabac.encode_bin_ep((comp < 0) as u32);
    }
  }
}

fn encode_qp_delta(cabac: &mut Cabac, delta: i32) {
  let abs = delta.unsigned_abs();
  cabac.encode_bin_ctx(CTX_QP_DELTA_ABS, (abs > 0) as u32);
  if abs > 0 {
    // Unary prefix up to 5, order-0 Exp-Golomb tail
    let prefix = (abs - 1).min(4);
    cabac.cur_ctx = CTX_QP_DELTA_ABS + 1;
    for _ in 0..prefix {
      cabac.encode_bin(1);
    }
    if prefix < 4 {
      cabac.encode_bin(0);
    } else {
      cabac.write_ep_ex_golomb(abs - 5, 0);
    }
    cabac.encode_bin_ep((delta < 0) as u32);
  }
}

#[allow(clippy::too_many_arguments)]
fn encode_coding_unit(
  cabac: &mut Cabac,
  cfg: &Config,
  params: &FrameParams,
  cu_array: &CuArray,
  coeff: &LcuCoeff,
  x: usize,
  y: usize,
  size: usize,
  tree_type: TreeType,
  qp_coding: &mut QpCoding,
) {
  let cu = *cu_array.at(x, y);
  let has_chroma = tree_type != TreeType::LumaOnly;
  let has_luma = tree_type != TreeType::ChromaOnly;
  let sx = params.chroma_scale_x;
  let sy = params.chroma_scale_y;

  if params.slicetype != SliceType::I && has_luma {
    let skip_ctx = CTX_CU_SKIP_FLAG
      + neighbor_flag(cu_array, x as i32 - 1, y as i32, |c| c.skipped != 0) as usize
      + neighbor_flag(cu_array, x as i32, y as i32 - 1, |c| c.skipped != 0) as usize;
    cabac.encode_bin_ctx(skip_ctx, cu.skipped as u32);

    if cu.skipped != 0 {
      encode_merge_index(cabac, cu.merge_idx as u32);
      return;
    }

    // Prediction mode: intra or not, then block copy
    let pm_ctx = CTX_PRED_MODE
      + neighbor_flag(cu_array, x as i32 - 1, y as i32, |c| c.cu_type == CU_INTRA) as usize;
    cabac.encode_bin_ctx(pm_ctx.min(CTX_PRED_MODE + 1), (cu.cu_type == CU_INTRA) as u32);
  }

  if cfg.ibc & 1 != 0 && cu.cu_type != CU_INTRA && has_luma {
    let ibc_ctx = CTX_IBC_FLAG
      + neighbor_flag(cu_array, x as i32 - 1, y as i32, |c| c.cu_type == CU_IBC) as usize
      + neighbor_flag(cu_array, x as i32, y as i32 - 1, |c| c.cu_type == CU_IBC) as usize;
    cabac.encode_bin_ctx(ibc_ctx, (cu.cu_type == CU_IBC) as u32);
  }

  match cu.cu_type {
    CU_INTRA => {
      if has_luma {
        // Most-probable-mode flag and index; non-MPM modes go through
        // the truncated binary escape.
        let mpm = [0u8, 1, 50]; // planar, DC, vertical
        let mpm_idx = mpm.iter().position(|&m| m == cu.intra_mode);
        cabac.encode_bin_ctx(CTX_INTRA_MPM_FLAG, mpm_idx.is_some() as u32);
        if let Some(idx) = mpm_idx {
          cabac.encode_bin_ctx(CTX_INTRA_PLANAR, (idx == 0) as u32);
          if idx > 0 {
            cabac.encode_bin_ep((idx - 1) as u32);
          }
        } else {
          cabac.encode_trunc_bin(cu.intra_mode as u32, 64);
        }
      }
      if has_chroma && params.has_chroma {
        // Derived mode flag; 1 in this encoder
        cabac.encode_bin_ctx(CTX_INTRA_CHROMA, 1);
      }
    }
    CU_INTER | CU_IBC if has_luma => {
      cabac.encode_bin_ctx(CTX_MERGE_FLAG, cu.merged as u32);
      if cu.merged != 0 {
        encode_merge_index(cabac, cu.merge_idx as u32);
      } else if cu.cu_type == CU_IBC {
        // Block-copy vector, coded like an L0 MVD against (0, 0)
        encode_mvd(
          cabac,
          cu.mv[0][0] >> INTERNAL_MV_PREC,
          cu.mv[0][1] >> INTERNAL_MV_PREC,
        );
      } else {
        if params.slicetype == SliceType::B {
          let size_class = (crate::util::floor_log2(size) as usize - 3).min(5);
          cabac.encode_bin_ctx(CTX_INTER_DIR + size_class, (cu.mv_dir == 3) as u32);
          if cu.mv_dir != 3 {
            cabac.encode_bin_ep((cu.mv_dir == 2) as u32);
          }
        }
        for list in 0..2 {
          if cu.mv_dir & (1 << list) == 0 {
            continue;
          }
          let num_ref = params.ref_lx[list].len() as u32;
          if num_ref > 1 {
            cabac.write_unary_max_symbol(CTX_REF_IDX, 1, cu.mv_ref[list] as u32, num_ref - 1);
          }
          let amvp = get_amvp_cand(cu_array, x as i32, y as i32, size as i32, size as i32, list);
          let mvp = amvp[cu.mv_cand[list] as usize];
          encode_mvd(
            cabac,
            (cu.mv[list][0] - mvp[0]) >> (INTERNAL_MV_PREC - 2),
            (cu.mv[list][1] - mvp[1]) >> (INTERNAL_MV_PREC - 2),
          );
          cabac.encode_bin_ctx(CTX_MVP_IDX, cu.mv_cand[list] as u32);
        }
      }
    }
    CU_INTER | CU_IBC => {
      // The chroma pass of the dual tree; prediction was coded in the
      // luma pass.
    }
    _ => unreachable!("uncommitted CU at {},{}", x, y),
  }

  // Coded block flags
  let luma_cbf = cbf_is_set(cu.cbf, 0);
  let cb_cbf = cbf_is_set(cu.cbf, 1);
  let cr_cbf = cbf_is_set(cu.cbf, 2);

  if cu.is_inter() && cu.merged == 0 && has_luma {
    let root = (luma_cbf || cb_cbf || cr_cbf) as u32;
    cabac.encode_bin_ctx(CTX_QT_ROOT_CBF, root);
    if root == 0 {
      return;
    }
  }

  if has_chroma && params.has_chroma {
    cabac.encode_bin_ctx(CTX_CBF_CB, cb_cbf as u32);
    cabac.encode_bin_ctx(CTX_CBF_CR + cb_cbf as usize, cr_cbf as u32);
    if cfg.jccr && cb_cbf && cr_cbf {
      let ctx = CTX_JOINT_CBCR + (cu.joint_cb_cr.min(2)) as usize;
      cabac.encode_bin_ctx(ctx, (cu.joint_cb_cr != 0) as u32);
    }
  }
  if has_luma {
    let cbf_ctx = CTX_CBF_LUMA + (cu.is_inter() as usize);
    cabac.encode_bin_ctx(cbf_ctx, luma_cbf as u32);
  }

  // QP delta: coded by the first CU with any residual in each group
  // (on the luma pass only under the dual tree)
  if params.max_qp_delta_depth >= 0
    && has_luma
    && !qp_coding.qp_delta_coded
    && (luma_cbf || cb_cbf || cr_cbf)
  {
    encode_qp_delta(cabac, cu.qp as i32 - qp_coding.last_qp);
    qp_coding.last_qp = cu.qp as i32;
    qp_coding.qp_delta_coded = true;
  }

  // Residuals
  let lcu_mask = LCU_WIDTH - 1;
  if has_luma && luma_cbf {
    let log2 = crate::util::floor_log2(size);
    if cfg.rdo > 0 && size <= 32 {
      cabac.encode_bin_ctx(CTX_TRANSFORM_SKIP, (cu.tr_skip & 1) as u32);
    }
    let local = (y & lcu_mask) * LCU_WIDTH + (x & lcu_mask);
    encode_residual(cabac, &coeff.y[local..], LCU_WIDTH, log2, true);
  }
  if has_chroma && params.has_chroma {
    let cw_log2 = crate::util::floor_log2(size >> sx);
    let cx = (x & lcu_mask) >> sx;
    let cy = (y & lcu_mask) >> sy;
    let local = cy * LCU_WIDTH + cx;
    if cb_cbf {
      encode_residual(cabac, &coeff.u[local..], LCU_WIDTH, cw_log2, false);
    }
    if cr_cbf && !(cfg.jccr && cu.joint_cb_cr != 0) {
      encode_residual(cabac, &coeff.v[local..], LCU_WIDTH, cw_log2, false);
    }
  }
}

fn encode_tree_rec(
  cabac: &mut Cabac,
  cfg: &Config,
  params: &FrameParams,
  cu_array: &CuArray,
  coeff: &LcuCoeff,
  x: usize,
  y: usize,
  size: usize,
  split: SplitTree,
  tree_type: TreeType,
  qp_coding: &mut QpCoding,
) {
  if x >= params.width || y >= params.height {
    return;
  }

  let inside = x + size <= params.width && y + size <= params.height;
  let must_split = !inside && size > 8;
  let cu = cu_array.at(x, y);
  let do_split = must_split || (inside && cu.width() < size);

  if inside && size > 8 {
    // Explicit split flag with depth and neighbor context
    let left_deeper = neighbor_flag(cu_array, x as i32 - 1, y as i32, |c| c.width() < size);
    let above_deeper = neighbor_flag(cu_array, x as i32, y as i32 - 1, |c| c.width() < size);
    let ctx = CTX_SPLIT_CU_FLAG
      + left_deeper as usize
      + above_deeper as usize
      + 3 * (split.depth as usize).min(2);
    cabac.encode_bin_ctx(ctx, do_split as u32);
    if do_split {
      // Quad split against the multi-type alternatives
      let qt_ctx = CTX_SPLIT_QT_FLAG + (split.depth as usize).min(5);
      cabac.encode_bin_ctx(qt_ctx, 1);
    }
  }

  if do_split {
    let half = size / 2;
    let child = split.push(SPLIT_QT);
    encode_tree_rec(cabac, cfg, params, cu_array, coeff, x, y, half, child, tree_type, qp_coding);
    encode_tree_rec(cabac, cfg, params, cu_array, coeff, x + half, y, half, child, tree_type, qp_coding);
    encode_tree_rec(cabac, cfg, params, cu_array, coeff, x, y + half, half, child, tree_type, qp_coding);
    encode_tree_rec(cabac, cfg, params, cu_array, coeff, x + half, y + half, half, child, tree_type, qp_coding);
  } else {
    encode_coding_unit(cabac, cfg, params, cu_array, coeff, x, y, size, tree_type, qp_coding);
  }
}

/// Emit the coding-tree syntax of one CTU.
pub fn encode_coding_tree(
  cabac: &mut Cabac,
  cfg: &Config,
  params: &FrameParams,
  cu_array: &CuArray,
  coeff: &LcuCoeff,
  lcu_px_x: usize,
  lcu_px_y: usize,
  tree_type: TreeType,
  qp_coding: &mut QpCoding,
) {
  // Each quantization group (one CTU here) codes its delta once
  qp_coding.qp_delta_coded = false;
  encode_tree_rec(
    cabac,
    cfg,
    params,
    cu_array,
    coeff,
    lcu_px_x,
    lcu_px_y,
    LCU_WIDTH,
    SplitTree::default(),
    tree_type,
    qp_coding,
  );
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn group_idx_matches_the_log_shape() {
    assert_eq!(GROUP_IDX[0], 0);
    assert_eq!(GROUP_IDX[1], 1);
    assert_eq!(GROUP_IDX[2], 2);
    assert_eq!(GROUP_IDX[3], 3);
    assert_eq!(GROUP_IDX[4], 4);
    assert_eq!(GROUP_IDX[5], 4);
    assert_eq!(GROUP_IDX[6], 5);
    assert_eq!(GROUP_IDX[7], 5);
    assert_eq!(GROUP_IDX[8], 6);
    assert_eq!(GROUP_IDX[11], 6);
    assert_eq!(GROUP_IDX[12], 7);
    assert_eq!(GROUP_IDX[16], 8);
    assert_eq!(GROUP_IDX[31], 9);
    assert_eq!(GROUP_IDX[32], 10);
    assert_eq!(GROUP_IDX[63], 11);
  }

  #[test]
  fn min_in_group_inverts_group_idx() {
    for pos in 0..64u32 {
      let g = GROUP_IDX[pos as usize] as usize;
      assert!(MIN_IN_GROUP[g] <= pos);
      if g + 1 < MIN_IN_GROUP.len() {
        assert!(pos < MIN_IN_GROUP[g + 1]);
      }
    }
  }

  #[test]
  fn diag_scan_covers_every_position_once() {
    for n in [4usize, 8, 16, 32] {
      let scan = diag_scan(n);
      assert_eq!(scan.len(), n * n);
      let mut seen = vec![false; n * n];
      for &(x, y) in &scan {
        let idx = y as usize * n + x as usize;
        assert!(!seen[idx]);
        seen[idx] = true;
      }
      // DC comes first
      assert_eq!(scan[0], (0, 0));
    }
  }
}
