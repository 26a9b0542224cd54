// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// The per-CTU pipeline.
//
// Each CTU runs as two jobs. The search job assigns QP and lambda, runs
// the mode search and reconstruction, maintains the boundary line
// buffers, deblocks, and stages SAO. The bitstream job drives the CABAC
// coder over the committed syntax and handles substream trailing and the
// wavefront context hand-off. When ALF is enabled the search job
// additionally runs the bitstream pass in counting mode so the contexts
// advance before the frame-level ALF decision re-runs everything.
//
// Lock order inside jobs: leaf state, then tile work, then the CU array,
// then the reconstruction, then the rate-control counters; reference
// frames always last. A leaf may be locked on its own at any time (the
// search-context clone and the hand-off rely on this; the hand-off
// target row cannot have live bitstream jobs while its predecessor row
// is still emitting).

use std::sync::{Arc, Mutex};

use log::trace;

use crate::alf;
use crate::cabac::{copy_contexts, Cabac};
use crate::config::{AlfType, SaoType, SliceType};
use crate::cu::{
  cbf_is_set_any, CuArray, LcuCoeff, LCU_WIDTH,
};
use crate::frame::{EncoderControl, FrameEncode};
use crate::hmvp::HmvpLut;
use crate::ibc;
use crate::lmcs;
use crate::picture::{IbcBuffer, Picture, Pixel, YuvLineBuf, IBC_BUFFER_WIDTH};
use crate::sao::{self, SaoInfo, DEBLOCK_DELAY_PX, SAO_DELAY_PX};
use crate::search::{self, LcuSearchArgs};

use crate::tree::{self, QpCoding, TreeType};
use crate::Error;

/// One CTU's place in its tile: raster position, pixel position, clipped
/// size and the neighbors that exist.
pub struct LcuOrderElement {
  pub id: usize,
  /// Position in LCU units, tile-local
  pub position: (usize, usize),
  /// Absolute pixel position in the frame
  pub position_px: (usize, usize),
  /// Size in pixels, clipped at the frame edge
  pub size: (usize, usize),
  pub above: Option<usize>,
  pub left: Option<usize>,
  pub right: Option<usize>,
  pub below: Option<usize>,
  pub last_column: bool,
  pub last_row: bool,
}

/// CABAC engine plus per-leaf coding state. One per WPP row, or one per
/// tile when wavefronts are off.
pub struct LeafState {
  pub cabac: Cabac,
  /// Context states used for rate estimation during search; never emits.
  pub search_cabac: Cabac,
  pub qp_coding: QpCoding,
}

/// The mutable working set of one tile.
pub struct TileWork {
  /// Bottom pixel row of each CTU before any filtering; intra and IBC
  /// prediction of the row below reads these.
  pub hor_buf_search: YuvLineBuf,
  /// Rightmost pixel column of each CTU before filtering.
  pub ver_buf_search: YuvLineBuf,
  /// Deblocked-but-not-SAO-filtered edge pixels for delayed SAO.
  pub hor_buf_before_sao: YuvLineBuf,
  pub ver_buf_before_sao: YuvLineBuf,

  pub sao_luma: Vec<SaoInfo>,
  pub sao_chroma: Vec<SaoInfo>,

  pub hmvp: HmvpLut,
  pub ibc_maps: ibc::IbcHashMaps,
  pub ibc_buffer: IbcBuffer,

  pub coeffs: Vec<Option<LcuCoeff>>,
  pub lcu_qp: Vec<i32>,
  pub lcu_lambda: Vec<f64>,
  pub lcu_lambda_sqrt: Vec<f64>,
}

pub struct TileEncode {
  /// x, y, w, h in pixels
  pub rect_px: (usize, usize, usize, usize),
  /// x, y, w, h in LCUs
  pub rect_lcu: (usize, usize, usize, usize),
  pub lcu_order: Vec<LcuOrderElement>,
  pub work: Mutex<TileWork>,
  pub leaves: Vec<Arc<Mutex<LeafState>>>,
}

impl TileEncode {
  pub fn width_in_lcu(&self) -> usize {
    self.rect_lcu.2
  }

  pub fn height_in_lcu(&self) -> usize {
    self.rect_lcu.3
  }

  /// Leaf state that owns the given CTU: the row leaf under WPP, the
  /// single tile leaf otherwise.
  pub fn leaf_for(&self, lcu_id: usize, wpp: bool) -> &Arc<Mutex<LeafState>> {
    if wpp {
      &self.leaves[lcu_id / self.width_in_lcu()]
    } else {
      &self.leaves[0]
    }
  }
}

// ----- Boundary buffers ---------------------------------------------------

// Copy the CTU's bottom row and rightmost column of unfiltered samples
// into the tile buffers, then feed the IBC rolling window.
fn recdata_to_bufs(
  ctrl: &EncoderControl,
  fe: &FrameEncode,
  work: &mut TileWork,
  recon: &Picture,
  lcu: &LcuOrderElement,
) {
  let frame_w = fe.params.width;
  let frame_h = fe.params.height;
  let (px, py) = lcu.position_px;
  let (w, h) = lcu.size;

  let num_planes = if fe.params.has_chroma { 3 } else { 1 };
  for plane_idx in 0..num_planes {
    let sx = if plane_idx > 0 { recon.chroma_scale_x } else { 0 };
    let sy = if plane_idx > 0 { recon.chroma_scale_y } else { 0 };
    let plane = recon.plane(plane_idx);

    // Bottom row, indexed x_px + y_lcu * plane_width
    let bottom_y = ((py + h) >> sy).saturating_sub(1);
    let hor = work.hor_buf_search.plane_mut(plane_idx);
    let base = (px >> sx) + lcu.position.1 * (frame_w >> sx);
    for x in 0..(w >> sx) {
      hor[base + x] = plane.at((px >> sx) + x, bottom_y);
    }

    // Right column, indexed x_lcu * plane_height + y_px
    let right_x = ((px + w) >> sx).saturating_sub(1);
    let ver = work.ver_buf_search.plane_mut(plane_idx);
    let base = lcu.position.0 * (frame_h >> sy) + (py >> sy);
    for y in 0..(h >> sy) {
      ver[base + y] = plane.at(right_x, (py >> sy) + y);
    }
  }

  // IBC rolling window
  if ctrl.cfg.ibc != 0 {
    let lcu_row = py / LCU_WIDTH;
    let per_row = IBC_BUFFER_WIDTH * LCU_WIDTH;

    let buffer_pos_x = if px + LCU_WIDTH >= IBC_BUFFER_WIDTH {
      IBC_BUFFER_WIDTH - LCU_WIDTH
    } else {
      px
    };

    // Buffer full: shift the whole row strip one CTU to the left
    if px + LCU_WIDTH > IBC_BUFFER_WIDTH {
      let row = &mut work.ibc_buffer.y[lcu_row * per_row..(lcu_row + 1) * per_row];
      for line in 0..LCU_WIDTH {
        row.copy_within(
          line * IBC_BUFFER_WIDTH + LCU_WIDTH..(line + 1) * IBC_BUFFER_WIDTH,
          line * IBC_BUFFER_WIDTH,
        );
      }
    }

    let row = &mut work.ibc_buffer.y[lcu_row * per_row..(lcu_row + 1) * per_row];
    let plane = recon.plane(0);
    for y in 0..h.min(frame_h - py) {
      for x in 0..w.min(frame_w - px) {
        row[y * IBC_BUFFER_WIDTH + buffer_pos_x + x] = plane.at(px + x, py + y);
      }
    }
  }
}

// Save the deblocked samples that SAO will need after this CTU is gone:
// the bottommost row that will be filtered with the next CTU row, and
// the rightmost column likewise.
fn recdata_before_sao_to_bufs(
  fe: &FrameEncode,
  work: &mut TileWork,
  recon: &Picture,
  lcu: &LcuOrderElement,
) {
  let frame_w = fe.params.width;
  let frame_h = fe.params.height;
  let (px, py) = lcu.position_px;

  let num_planes = if fe.params.has_chroma { 3 } else { 1 };
  for plane_idx in 0..num_planes {
    let sx = if plane_idx > 0 { recon.chroma_scale_x } else { 0 };
    let sy = if plane_idx > 0 { recon.chroma_scale_y } else { 0 };
    let plane = recon.plane(plane_idx);
    let delay = SAO_DELAY_PX >> sy;
    let dblk = DEBLOCK_DELAY_PX >> sx;

    if lcu.below.is_some() {
      // Bottommost row that will be SAO-filtered together with the CTU
      // below, covering the deblocked span.
      let y = (py >> sy) + (LCU_WIDTH >> sy) - delay - 1;
      let mut x0 = px >> sx;
      let mut len = (lcu.size.0 >> sx) - dblk;
      if lcu.right.is_none() {
        len += dblk;
      }
      if lcu.left.is_some() {
        x0 -= dblk;
        len += dblk;
      }
      let hor = work.hor_buf_before_sao.plane_mut(plane_idx);
      let base = lcu.position.1 * (frame_w >> sx);
      for x in 0..len {
        hor[base + x0 + x] = plane.at(x0 + x, y);
      }
    }

    if lcu.right.is_some() {
      let x = (px >> sx) + (LCU_WIDTH >> sx) - (SAO_DELAY_PX >> sx) - 1;
      let mut y0 = py >> sy;
      let mut len = (lcu.size.1 >> sy) - (DEBLOCK_DELAY_PX >> sy);
      if lcu.below.is_none() {
        len += DEBLOCK_DELAY_PX >> sy;
      }
      if lcu.above.is_some() {
        y0 -= DEBLOCK_DELAY_PX >> sy;
        len += DEBLOCK_DELAY_PX >> sy;
      }
      let ver = work.ver_buf_before_sao.plane_mut(plane_idx);
      let base = lcu.position.0 * (frame_h >> sy);
      for y in 0..len {
        ver[base + y0 + y] = plane.at(x, y0 + y);
      }
    }
  }
}

// SAO reconstruction for everything that became final when this CTU was
// deblocked: the deferred strip of the CTU above, of the CTU to the
// left, their corner, and the interior of this CTU (minus its own
// deferred strips).
fn sao_reconstruct_lcu(
  fe: &FrameEncode,
  tile: &TileEncode,
  work: &TileWork,
  recon: &mut Picture,
  lcu: &LcuOrderElement,
) {
  let (px, py) = lcu.position_px;
  let num_planes = if fe.params.has_chroma { 3 } else { 1 };

  for plane_idx in 0..num_planes {
    let sx = if plane_idx > 0 { recon.chroma_scale_x } else { 0 };
    let sy = if plane_idx > 0 { recon.chroma_scale_y } else { 0 };
    let delay_x = SAO_DELAY_PX >> sx;
    let delay_y = SAO_DELAY_PX >> sy;
    let lcu_w = lcu.size.0 >> sx;
    let lcu_h = lcu.size.1 >> sy;
    let px_c = px >> sx;
    let py_c = py >> sy;
    let frame_w = fe.params.width >> sx;
    let frame_h = fe.params.height >> sy;

    // Snapshot buffer: the CTU plus the delayed strips and a one-sample
    // border for the edge classifier.
    let buf_w = 1 + delay_x + lcu_w + 1;
    let buf_h = 1 + delay_y + lcu_h + 1;
    let origin_x = 1 + delay_x; // buffer coords of this CTU's top-left
    let origin_y = 1 + delay_y;
    let mut buf = vec![0 as Pixel; buf_w * buf_h];

    let plane = recon.plane(plane_idx);
    let hor = work.hor_buf_before_sao.plane(plane_idx);
    let ver = work.ver_buf_before_sao.plane(plane_idx);

    for by in 0..buf_h {
      for bx in 0..buf_w {
        let ax = px_c as i32 + bx as i32 - origin_x as i32;
        let ay = py_c as i32 + by as i32 - origin_y as i32;
        let ax = ax.clamp(0, frame_w as i32 - 1) as usize;
        let ay = ay.clamp(0, frame_h as i32 - 1) as usize;

        // The deferred strips above and left are still unfiltered in
        // the reconstruction and are read from there. Only the border
        // row / column just outside the filtered area was already SAO
        // filtered in place when its CTU ran, so the classifier reads
        // its saved pre-SAO copy instead.
        let border_row = py_c as i32 - delay_y as i32 - 1;
        let border_col = px_c as i32 - delay_x as i32 - 1;
        let v = if ay as i32 == border_row && lcu.position.1 > 0 {
          hor[(lcu.position.1 - 1) * frame_w + ax]
        } else if ax as i32 == border_col && lcu.position.0 > 0 {
          ver[(lcu.position.0 - 1) * frame_h + ay]
        } else {
          plane.at(ax, ay)
        };
        buf[by * buf_w + bx] = v;
      }
    }

    // Filter the four parts; each belongs to the CTU that contains its
    // top-left sample.
    let x_parts = [
      if lcu.left.is_some() { -(delay_x as i32) } else { 0 },
      0,
      (lcu_w - if lcu.right.is_some() { delay_x } else { 0 }) as i32,
    ];
    let y_parts = [
      if lcu.above.is_some() { -(delay_y as i32) } else { 0 },
      0,
      (lcu_h - if lcu.below.is_some() { delay_y } else { 0 }) as i32,
    ];

    for yi in 0..2 {
      for xi in 0..2 {
        let x = x_parts[xi];
        let y = y_parts[yi];
        let w = (x_parts[xi + 1] - x) as usize;
        let h = (y_parts[yi + 1] - y) as usize;
        if w == 0 || h == 0 {
          continue;
        }

        // Owning CTU of this part, in tile-local LCU coordinates
        let owner_x = ((px_c as i32 + x) << sx) as usize / LCU_WIDTH - tile.rect_lcu.0;
        let owner_y = ((py_c as i32 + y) << sy) as usize / LCU_WIDTH - tile.rect_lcu.1;
        let owner_id = owner_y * tile.width_in_lcu() + owner_x;
        let sao = if plane_idx == 0 {
          &work.sao_luma[owner_id]
        } else {
          &work.sao_chroma[owner_id]
        };
        let sao = resolve_merges(work, tile, owner_id, plane_idx == 0, sao);

        let src_origin = (origin_y as i32 + y) as usize * buf_w + (origin_x as i32 + x) as usize;
        let dst_plane = recon.plane_mut(plane_idx);
        let dst_origin = (py_c as i32 + y) as usize * dst_plane.stride + (px_c as i32 + x) as usize;
        let dst_stride = dst_plane.stride;
        sao::sao_reconstruct_region(
          &buf,
          buf_w,
          src_origin,
          &mut dst_plane.data,
          dst_stride,
          dst_origin,
          w,
          h,
          &sao,
          (plane_idx == 2) as usize,
          fe.params.bitdepth,
        );
      }
    }
  }
}

// Follow SAO merge flags to the CTU that actually carries parameters.
fn resolve_merges(
  work: &TileWork,
  tile: &TileEncode,
  mut lcu_id: usize,
  luma: bool,
  sao: &SaoInfo,
) -> SaoInfo {
  let mut sao = *sao;
  let width = tile.width_in_lcu();
  let mut guard = 0;
  while (sao.merge_left_flag || sao.merge_up_flag) && guard < 2 * width {
    lcu_id = if sao.merge_left_flag { lcu_id - 1 } else { lcu_id - width };
    sao = if luma { work.sao_luma[lcu_id] } else { work.sao_chroma[lcu_id] };
    guard += 1;
  }
  sao
}

// ----- QP propagation -----------------------------------------------------

fn get_cu_ref_qp(cu_array: &CuArray, max_qp_delta_depth: i32, x: usize, y: usize,
                 last_qp: i32) -> i32 {
  let cu = cu_array.at(x, y);
  let qg_width = 1usize << (6 - max_qp_delta_depth).max(cu.log2_width as i32);
  let qg_height = 1usize << (6 - max_qp_delta_depth).max(cu.log2_height as i32);

  let x_qg = x & !(qg_width - 1);
  let y_qg = y & !(qg_height - 1);
  if x_qg == 0 && y_qg > 0 && y_qg % LCU_WIDTH == 0 {
    return cu_array.at(x_qg, y_qg - 1).qp as i32;
  }

  let qp_pred_a = if x_qg % LCU_WIDTH > 0 {
    cu_array.at(x_qg - 1, y_qg).qp as i32
  } else {
    last_qp
  };
  let qp_pred_b = if y_qg % LCU_WIDTH > 0 {
    cu_array.at(x_qg, y_qg - 1).qp as i32
  } else {
    last_qp
  };

  (qp_pred_a + qp_pred_b + 1) >> 1
}

/// Propagate the QP that deblocking and QP prediction will see: within a
/// quantization group, CUs before the first one with a coded residual
/// take the predicted QP, the rest take the signalled one.
pub fn set_cu_qps(
  cu_array: &mut CuArray,
  max_qp_delta_depth: i32,
  x: usize,
  y: usize,
  size: usize,
  frame_w: usize,
  frame_h: usize,
  last_qp: &mut i32,
  prev_qp: &mut i32,
  depth: i32,
) {
  if x >= frame_w || y >= frame_h {
    return;
  }

  if depth <= max_qp_delta_depth {
    *prev_qp = -1;
  }

  let cu_width = cu_array.at(x, y).width();
  if size > cu_width {
    let half = size / 2;
    set_cu_qps(cu_array, max_qp_delta_depth, x, y, half, frame_w, frame_h, last_qp, prev_qp, depth + 1);
    set_cu_qps(cu_array, max_qp_delta_depth, x + half, y, half, frame_w, frame_h, last_qp, prev_qp, depth + 1);
    set_cu_qps(cu_array, max_qp_delta_depth, x, y + half, half, frame_w, frame_h, last_qp, prev_qp, depth + 1);
    set_cu_qps(cu_array, max_qp_delta_depth, x + half, y + half, half, frame_w, frame_h, last_qp, prev_qp, depth + 1);
  } else {
    let cu = *cu_array.at(x, y);
    let cbf_found = *prev_qp >= 0 || cbf_is_set_any(cu.cbf);

    let qp = if cbf_found {
      if *prev_qp < 0 {
        *prev_qp = cu.qp as i32;
      }
      *prev_qp
    } else {
      get_cu_ref_qp(cu_array, max_qp_delta_depth, x, y, *last_qp)
    };

    let mut updated = cu;
    updated.qp = qp as i8;
    cu_array.set_cu(x, y, size.min(frame_w - x), size.min(frame_h - y), &updated);

    // Last CU of the quantization group updates the predictor chain
    let qg_size = 1usize << (6 - max_qp_delta_depth.max(0));
    if (x + size) % qg_size == 0 && (y + size) % qg_size == 0 {
      *last_qp = qp;
    }
  }
}

// ----- Workers ------------------------------------------------------------

/// The search half of one CTU.
pub fn worker_search_lcu(ctrl: &EncoderControl, fe: &Arc<FrameEncode>, tile: &Arc<TileEncode>,
                         lcu_id: usize) {
  if fe.error.lock().unwrap().is_some() {
    return;
  }
  let lcu = &tile.lcu_order[lcu_id];
  let params: &crate::frame::FrameParams = &fe.params;
  let cfg = &ctrl.cfg;
  trace!("search CTU {:?} of POC {}", lcu.position_px, params.poc);

  // Per-CTU QP and lambda from the frame baseline and the delta-QP maps
  let (qp, lambda) = params.lcu_qp_lambda(lcu.position_px, ctrl);

  // Clone the rate-estimation contexts; leaf locks never nest inside
  // work locks (see the module comment).
  let search_cabac = {
    let leaf = tile.leaf_for(lcu_id, cfg.wpp).lock().unwrap();
    leaf.search_cabac.clone()
  };

  let coeff = match LcuCoeff::alloc() {
    Ok(c) => c,
    Err(e) => {
      *fe.error.lock().unwrap() = Some(e);
      return;
    }
  };

  {
    let mut work = tile.work.lock().unwrap();
    let mut cu_array = fe.cu_array.lock().unwrap();
    let mut recon = fe.recon.lock().unwrap();

    work.lcu_qp[lcu_id] = qp;
    work.lcu_lambda[lcu_id] = lambda;
    work.lcu_lambda_sqrt[lcu_id] = lambda.sqrt();
    work.coeffs[lcu_id] = Some(coeff);

    let lcu_row = lcu.position_px.1 / LCU_WIDTH;

    // Hash this CTU's source blocks for the block-copy search
    if cfg.ibc & 2 != 0 {
      let chroma = if params.has_chroma { Some(cfg.chroma_format) } else { None };
      let TileWork { ref mut ibc_maps, .. } = *work;
      ibc::hash_lcu(
        ibc_maps,
        fe.search_source(),
        lcu.position_px.0,
        lcu.position_px.1,
        lcu.size.0,
        lcu.size.1,
        chroma,
      );
    }

    // Unfiltered neighbor rows/columns for intra prediction, captured
    // from the boundary line buffers of the CTUs above and to the left.
    let borders = {
      let mut b = search::IntraBorders::default();
      let num_planes = if params.has_chroma { 3 } else { 1 };
      for p in 0..num_planes {
        let sx = if p > 0 { recon.chroma_scale_x } else { 0 };
        let sy = if p > 0 { recon.chroma_scale_y } else { 0 };
        if lcu.above.is_some() {
          let hor = work.hor_buf_search.plane(p);
          let base = (lcu.position_px.0 >> sx) + (lcu.position.1 - 1) * (params.width >> sx);
          b.above[p] = Some(hor[base..base + (lcu.size.0 >> sx)].to_vec());
        }
        if lcu.left.is_some() {
          let ver = work.ver_buf_search.plane(p);
          let base = (lcu.position.0 - 1) * (params.height >> sy) + (lcu.position_px.1 >> sy);
          b.left[p] = Some(ver[base..base + (lcu.size.1 >> sy)].to_vec());
        }
      }
      b
    };

    {
      let TileWork {
        ref mut hmvp,
        ref mut coeffs,
        ref ibc_maps,
        ref ibc_buffer,
        ..
      } = *work;

      // The search is speculative; the scoped snapshot restores the
      // row's history on every exit path out of the closure.
      hmvp.with_snapshot(lcu_row, |hmvp| {
        let mut args = LcuSearchArgs {
          cfg: cfg,
          params: params,
          source: fe.search_source(),
          recon: &mut recon,
          cu_array: &mut cu_array,
          coeff: coeffs[lcu_id].as_mut().unwrap(),
          hmvp: hmvp,
          ibc_maps: if cfg.ibc & 2 != 0 { Some(ibc_maps) } else { None },
          ibc_buffer: if cfg.ibc != 0 { Some(ibc_buffer) } else { None },
          search_cabac: &search_cabac,
          lcu_px: lcu.position_px,
          borders: borders,
          tile_px: (
            tile.rect_px.0 as i32,
            tile.rect_px.1 as i32,
            tile.rect_px.2 as i32,
            tile.rect_px.3 as i32,
          ),
          max_ref_down: ctrl.max_inter_ref_lcu.0,
          max_ref_right: ctrl.max_inter_ref_lcu.1,
          qp: qp,
          lambda: lambda,
          lambda_sqrt: lambda.sqrt(),
        };
        search::search_lcu(&mut args, lcu.position_px.0, lcu.position_px.1);
      });

      // Replay the committed motion into the history list in coding
      // order; this is the one update that survives the snapshot.
      for y in (lcu.position_px.1..lcu.position_px.1 + lcu.size.1).step_by(32) {
        for x in (lcu.position_px.0..lcu.position_px.0 + lcu.size.0).step_by(32) {
          let cu = *cu_array.at(x.min(params.width - 1), y.min(params.height - 1));
          if cu.cu_type == crate::cu::CU_INTER {
            hmvp.add(lcu_row, &cu);
          }
        }
      }
    }

    // Unfiltered boundary lines for prediction, and the IBC window
    recdata_to_bufs(ctrl, fe, &mut work, &recon, lcu);

    if params.max_qp_delta_depth >= 0 {
      let mut last_qp = params.qp;
      let mut prev_qp = -1;
      set_cu_qps(
        &mut cu_array,
        params.max_qp_delta_depth,
        lcu.position_px.0,
        lcu.position_px.1,
        LCU_WIDTH,
        params.width,
        params.height,
        &mut last_qp,
        &mut prev_qp,
        0,
      );
    }

    // Reconstruction leaves the mapped domain before filtering
    if let Some(luts) = &params.lmcs {
      lmcs::inv_map_region(
        &luts.inv,
        recon.plane_mut(0),
        lcu.position_px.0,
        lcu.position_px.1,
        lcu.size.0,
        lcu.size.1,
      );
    }

    if cfg.deblock_enable {
      crate::filter::deblock_lcu(
        &mut recon,
        &cu_array,
        lcu.position_px.0,
        lcu.position_px.1,
        params.bitdepth,
      );
    }

    if cfg.sao_type != SaoType::Off {
      recdata_before_sao_to_bufs(fe, &mut work, &recon, lcu);

      // Parameter search on the deblocked CTU, against the original
      // source (the reconstruction is back in the unmapped domain).
      let src = &fe.source;
      let num_planes = if params.has_chroma { 3 } else { 1 };
      for plane_idx in 0..num_planes {
        let sx = if plane_idx > 0 { recon.chroma_scale_x } else { 0 };
        let sy = if plane_idx > 0 { recon.chroma_scale_y } else { 0 };
        let x0 = lcu.position_px.0 >> sx;
        let y0 = lcu.position_px.1 >> sy;
        let w = lcu.size.0 >> sx;
        let h = lcu.size.1 >> sy;
        let sp = src.plane(plane_idx);
        let rp = recon.plane(plane_idx);
        let info = sao::sao_search_plane(
          &sp.data[y0 * sp.stride + x0..],
          sp.stride,
          &rp.data[y0 * rp.stride + x0..],
          rp.stride,
          w,
          h,
          params.bitdepth,
          lambda,
          (plane_idx == 2) as usize,
        );
        if plane_idx == 0 {
          work.sao_luma[lcu_id] = info;
        } else if plane_idx == 1 {
          work.sao_chroma[lcu_id] = info;
        } else {
          // V shares the parameter set with U; merge the offsets in
          let mut combined = work.sao_chroma[lcu_id];
          for i in 5..10 {
            combined.offsets[i] = info.offsets[i];
          }
          combined.band_position[1] = info.band_position[1];
          work.sao_chroma[lcu_id] = combined;
        }
      }

      // Merge flags where the left/up CTU carries identical parameters
      if lcu.left.is_some() {
        let left_id = lcu.left.unwrap();
        if work.sao_luma[left_id] == work.sao_luma[lcu_id]
          && work.sao_chroma[left_id] == work.sao_chroma[lcu_id]
        {
          work.sao_luma[lcu_id].merge_left_flag = true;
        }
      }
      if !work.sao_luma[lcu_id].merge_left_flag && lcu.above.is_some() {
        let up_id = lcu.above.unwrap();
        if work.sao_luma[up_id] == work.sao_luma[lcu_id]
          && work.sao_chroma[up_id] == work.sao_chroma[lcu_id]
        {
          work.sao_luma[lcu_id].merge_up_flag = true;
        }
      }

      sao_reconstruct_lcu(fe, tile, &work, &mut recon, lcu);
    }
  }

  // With ALF enabled, run the bitstream pass in counting mode so the
  // contexts see the same bin sequence the real pass will.
  if cfg.alf_type != AlfType::Off {
    let leaf = tile.leaf_for(lcu_id, cfg.wpp).clone();
    let mut leaf = leaf.lock().unwrap();
    leaf.cabac.only_count = true;
    bitstream_lcu_inner(ctrl, fe, tile, lcu_id, &mut leaf);
  }
}

/// The bitstream half of one CTU; shared by the counting pass.
fn bitstream_lcu_inner(
  ctrl: &EncoderControl,
  fe: &Arc<FrameEncode>,
  tile: &Arc<TileEncode>,
  lcu_id: usize,
  leaf: &mut LeafState,
) {
  let lcu = &tile.lcu_order[lcu_id];
  let params = &fe.params;
  let cfg = &ctrl.cfg;

  let mut work = tile.work.lock().unwrap();
  let cu_array = fe.cu_array.lock().unwrap();

  let existing_bits = leaf.cabac.tell();
  leaf.cabac.update = true;

  if cfg.sao_type != SaoType::Off {
    // Merge flags are tile-local, like the merge decision itself
    let chroma = work.sao_chroma[lcu_id];
    sao::encode_sao(
      &mut leaf.cabac,
      lcu.position.0,
      lcu.position.1,
      &work.sao_luma[lcu_id],
      params.has_chroma.then_some(&chroma),
      params.bitdepth,
    );
  }

  if cfg.alf_type != AlfType::Off {
    let alf_info = fe.alf.lock().unwrap();
    let frame_lcu_index = (lcu.position.1 + tile.rect_lcu.1) * ctrl.width_in_lcu
      + lcu.position.0 + tile.rect_lcu.0;
    alf::encode_alf_bits(&mut leaf.cabac, &alf_info, frame_lcu_index, ctrl.width_in_lcu);
  }

  // Coding tree: luma-only plus a chroma pass under the dual tree on
  // intra frames, one joint pass otherwise.
  let coeff = work.coeffs[lcu_id].as_ref().unwrap();
  let dual_tree = cfg.dual_tree && params.slicetype == SliceType::I && params.has_chroma;
  let first_tree = if dual_tree { TreeType::LumaOnly } else { TreeType::Both };
  tree::encode_coding_tree(
    &mut leaf.cabac,
    cfg,
    params,
    &cu_array,
    coeff,
    lcu.position_px.0,
    lcu.position_px.1,
    first_tree,
    &mut leaf.qp_coding,
  );
  if dual_tree {
    tree::encode_coding_tree(
      &mut leaf.cabac,
      cfg,
      params,
      &cu_array,
      coeff,
      lcu.position_px.0,
      lcu.position_px.1,
      TreeType::ChromaOnly,
      &mut leaf.qp_coding,
    );
  }

  if !leaf.cabac.only_count {
    // Coefficients are not needed anymore
    work.coeffs[lcu_id] = None;
  }

  let end_of_tile = lcu.last_column && lcu.last_row;
  let end_of_wpp_row = cfg.wpp && lcu.last_column;
  if end_of_tile || end_of_wpp_row {
    // end_of_sub_stream_one_bit, then flush and byte-align. The same
    // trailing ends a slice after the final substream.
    leaf.cabac.encode_bin_trm(1);
    if !leaf.cabac.only_count {
      leaf.cabac.finish();
      leaf.cabac.stream.put(1, 1);
      leaf.cabac.stream.align_zero();
    }
    leaf.cabac.start();
  }
  leaf.cabac.update = false;

  // Rate bookkeeping, shared across the frame
  let bits = (leaf.cabac.tell() - existing_bits) as u32;
  {
    let mut rc = fe.rc.lock().unwrap();
    rc.cur_frame_bits_coded += bits as u64;
    let frame_lcu_index = (lcu.position.1 + tile.rect_lcu.1) * ctrl.width_in_lcu
      + lcu.position.0 + tile.rect_lcu.0;
    if !params.is_irap {
      let w = rc.lcu_stats[frame_lcu_index].original_weight;
      rc.remaining_weight -= w;
    }
    rc.lcu_stats[frame_lcu_index].bits = bits;

    let mut all_skipped = true;
    'scan: for y in (0..lcu.size.1).step_by(8) {
      for x in (0..lcu.size.0).step_by(8) {
        if cu_array
          .at(lcu.position_px.0 + x, lcu.position_px.1 + y)
          .skipped
          == 0
        {
          all_skipped = false;
          break 'scan;
        }
      }
    }
    rc.lcu_stats[frame_lcu_index].skipped = all_skipped;
  }

  drop(cu_array);
  drop(work);

  // Wavefront hand-off: after the second CTU of a row (or the only CTU
  // of a one-CTU row) the contexts seed the row below. The row below
  // has no live bitstream job yet; its first one waits on this one.
  let row_len = tile.width_in_lcu();
  let index_in_row = lcu_id % row_len;
  let handoff_index = 1.min(row_len - 1);
  if cfg.wpp && index_in_row == handoff_index {
    let row = lcu_id / row_len;
    if row + 1 < tile.height_in_lcu() {
      let next = tile.leaves[row + 1].clone();
      let mut next = next.lock().unwrap();
      // Only the coding contexts travel; the search estimates keep the
      // slice-start contexts so rate costs do not depend on job timing.
      copy_contexts(&mut next.cabac, &leaf.cabac);
    }
  }
}

/// The bitstream half of one CTU as its own job.
pub fn worker_bitstream_lcu(ctrl: &EncoderControl, fe: &Arc<FrameEncode>, tile: &Arc<TileEncode>,
                            lcu_id: usize) {
  if fe.error.lock().unwrap().is_some() {
    return;
  }
  let leaf = tile.leaf_for(lcu_id, ctrl.cfg.wpp).clone();
  let mut leaf = leaf.lock().unwrap();
  bitstream_lcu_inner(ctrl, fe, tile, lcu_id, &mut leaf);
}

/// Reset a leaf's CABAC for a fresh slice: new contexts, fresh engine,
/// empty stream.
pub fn reset_leaf(leaf: &mut LeafState, qp: i32, slice: SliceType) {
  leaf.cabac.ctx.init(qp, slice);
  leaf.cabac.start();
  leaf.cabac.stream.clear();
  leaf.search_cabac.ctx.init(qp, slice);
  leaf.search_cabac.start();
  leaf.search_cabac.stream.clear();
  leaf.qp_coding = QpCoding { last_qp: qp, qp_delta_coded: false };
}

pub fn error_of(fe: &FrameEncode) -> Option<Error> {
  fe.error.lock().unwrap().clone()
}

const _: () = {
  // The SAO snapshot reach must stay inside one CTU
  assert!(SAO_DELAY_PX + DEBLOCK_DELAY_PX < LCU_WIDTH);
};
