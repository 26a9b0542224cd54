// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// Frame-level control.
//
// Everything that happens once per picture lives here: POC and picture
// type assignment, reference list maintenance, QP / lambda selection and
// the delta-QP maps, and the construction and wiring of the per-CTU job
// graph, including the cross-frame dependencies that make output-window
// frame parallelism safe.

use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::alf::AlfFrameInfo;
use crate::cabac::Cabac;
use crate::config::{AlfType, ChromaFormat, Config, PicType, SliceType};
use crate::context::ContextSet;
use crate::ctu::{self, LcuOrderElement, LeafState, TileEncode, TileWork};
use crate::cu::{CuArray, LCU_WIDTH};
use crate::hmvp::HmvpLut;
use crate::ibc::IbcHashMaps;
use crate::lmcs::{self, LmcsLuts};
use crate::picture::{IbcBuffer, Picture, RoiMap, YuvLineBuf};
use crate::reflist::RefList;
use crate::scheduler::{Job, Scheduler};
use crate::sao::SaoInfo;
use crate::tree::QpCoding;
use crate::util::clip;
use crate::Error;

/// Strength of the QP adjustment for 360-degree equirectangular video.
/// Determined empirically.
const ERP_AQP_STRENGTH: f64 = 3.0;

pub struct EncoderControl {
  pub cfg: Config,
  pub width_in_lcu: usize,
  pub height_in_lcu: usize,
  /// How deep into the reference frame an MV may reach, in LCUs
  /// (down, right). Bounds the cross-frame job dependencies.
  pub max_inter_ref_lcu: (i32, i32),
  pub gop: Vec<crate::config::GopEntry>,
  pub threadqueue: Scheduler,
  pub roi_file: Option<Mutex<BufReader<File>>>,
}

impl EncoderControl {
  pub fn new(cfg: Config) -> Result<Self, Error> {
    cfg.validate()?;
    if cfg.width % 8 != 0 || cfg.height % 8 != 0 {
      // The coding tree bottoms out at 8x8; the caller pads.
      return Err(Error::BadConfig("dimensions must be multiples of 8"));
    }

    let roi_file = match &cfg.roi.file_path {
      Some(path) => {
        let file = File::open(path).map_err(|_| Error::BadConfig("cannot open ROI file"))?;
        Some(Mutex::new(BufReader::new(file)))
      }
      None => None,
    };

    let gop = cfg.gop_table();
    Ok(EncoderControl {
      width_in_lcu: cfg.width.div_ceil(LCU_WIDTH),
      height_in_lcu: cfg.height.div_ceil(LCU_WIDTH),
      max_inter_ref_lcu: (1, 1),
      gop: gop,
      threadqueue: Scheduler::new(cfg.threads),
      roi_file: roi_file,
      cfg: cfg,
    })
  }
}

/// Everything about one frame that is fixed before its jobs launch.
pub struct FrameParams {
  pub num: i64,
  pub poc: i32,
  pub gop_offset: usize,
  pub slicetype: SliceType,
  pub pictype: PicType,
  pub is_irap: bool,
  pub irap_poc: i32,

  pub width: usize,
  pub height: usize,
  pub bitdepth: u32,
  pub has_chroma: bool,
  pub chroma_scale_x: usize,
  pub chroma_scale_y: usize,

  pub qp: i32,
  pub lambda: f64,
  pub lambda_sqrt: f64,
  pub max_qp_delta_depth: i32,

  pub refs: RefList,
  pub ref_lx: [Vec<u8>; 2],

  pub roi: Option<RoiMap>,
  pub aq_offsets: Vec<f64>,
  pub jccr_sign: bool,
  pub lmcs: Option<LmcsLuts>,
}

impl FrameParams {
  /// QP and lambda for the CTU at the given pixel position, combining
  /// the frame baseline with the ROI / adaptive-QP maps.
  pub fn lcu_qp_lambda(&self, position_px: (usize, usize), ctrl: &EncoderControl) -> (i32, f64) {
    let lcu_x = position_px.0 / LCU_WIDTH;
    let lcu_y = position_px.1 / LCU_WIDTH;
    let lcu_index = lcu_y * ctrl.width_in_lcu + lcu_x;

    let mut qp = self.qp;

    if let Some(roi) = &self.roi {
      // Map the LCU grid onto the ROI grid
      let rx = lcu_x * roi.width / ctrl.width_in_lcu;
      let ry = lcu_y * roi.height / ctrl.height_in_lcu;
      qp += roi.dqp[ry * roi.width + rx] as i32;
    }

    if let Some(&offset) = self.aq_offsets.get(lcu_index) {
      qp += offset.round() as i32;
    }

    let qp = clip(0, 51, qp);
    (qp, lambda_from_qp(qp))
  }
}

#[derive(Clone, Copy, Default)]
pub struct LcuStats {
  pub bits: u32,
  pub skipped: bool,
  pub weight: f64,
  pub original_weight: f64,
}

/// Counters shared by all CTUs of one frame, touched under one lock.
pub struct RcState {
  pub cur_frame_bits_coded: u64,
  pub remaining_weight: f64,
  pub lcu_stats: Vec<LcuStats>,
}

/// The full working set of one frame in flight.
pub struct FrameEncode {
  pub params: Arc<FrameParams>,
  pub source: Arc<Picture>,
  /// Tone-mapped source when luma mapping is active
  pub source_mapped: Option<Arc<Picture>>,
  pub recon: Arc<Mutex<Picture>>,
  pub cu_array: Arc<Mutex<CuArray>>,
  pub tiles: Vec<Arc<TileEncode>>,
  pub rc: Mutex<RcState>,
  pub alf: Mutex<AlfFrameInfo>,
  pub error: Mutex<Option<Error>>,
}

impl FrameEncode {
  /// The picture distortion is measured against: the mapped source in
  /// the LMCS domain, the plain source otherwise.
  pub fn search_source(&self) -> &Picture {
    match &self.source_mapped {
      Some(mapped) => mapped,
      None => &self.source,
    }
  }
}

fn lambda_from_qp(qp: i32) -> f64 {
  0.57 * 2f64.powf((qp - 12) as f64 / 3.0)
}

// ----- Controller: POC, picture type, references --------------------------

pub struct ControllerState {
  pub frame_num: i64,
  pub poc: i32,
  pub irap_poc: i32,
  pub refs: RefList,
}

impl ControllerState {
  pub fn new() -> Self {
    ControllerState { frame_num: 0, poc: 0, irap_poc: 0, refs: RefList::new() }
  }
}

// The GOP table is laid out in coding order, so the entry for a frame
// is simply its position within the GOP.
pub fn gop_offset_for(ctrl: &EncoderControl, num: i64) -> usize {
  let cfg = &ctrl.cfg;
  if cfg.gop_len == 0 || num == 0 {
    return 0;
  }
  ((num - 1) % cfg.gop_len as i64) as usize
}

/// POC assignment plus IRAP bookkeeping.
///
/// A closed GOP inserts an extra IDR every intra_period + 1 frames and
/// resets the POC there; an open GOP derives the POC from the global
/// frame counter and the GOP reordering table; without a GOP the POC
/// follows the intra period directly. The is_closed_normal_gop flag
/// replicates the interaction between these paths: when the closed-GOP
/// branch below has already decided whether this picture is an IRAP, the
/// intra-period modulo check must not run.
pub fn assign_poc(ctrl: &EncoderControl, state: &mut ControllerState, gop_offset: usize)
                  -> (i32, bool, bool) {
  let cfg = &ctrl.cfg;
  let num = state.frame_num;

  let mut is_closed_normal_gop = false;
  let mut is_irap = false;

  let poc = if num == 0 {
    0
  } else if cfg.gop_len > 0 && !cfg.gop_lowdelay {
    let mut framenum = num - 1;
    if cfg.intra_period > 0 && !cfg.open_gop {
      is_closed_normal_gop = true;
      if framenum % (cfg.intra_period as i64 + 1) == cfg.intra_period as i64 {
        // Insert an IDR before each new GOP after the intra period
        0
      } else {
        framenum %= cfg.intra_period as i64 + 1;
        let poc_offset = ctrl.gop[gop_offset].poc_offset;
        // Explicitly not an IRAP in a closed GOP
        (framenum - framenum % cfg.gop_len as i64) as i32 + poc_offset
      }
    } else {
      let poc_offset = ctrl.gop[gop_offset].poc_offset;
      (framenum - framenum % cfg.gop_len as i64) as i32 + poc_offset
    }
  } else if cfg.intra_period > 1 {
    (num % cfg.intra_period as i64) as i32
  } else {
    num as i32
  };

  if num == 0 || poc == 0 {
    is_irap = true;
  } else if !is_closed_normal_gop {
    is_irap = cfg.intra_period > 0 && poc % cfg.intra_period == 0;
  }

  (poc, is_irap, is_closed_normal_gop)
}

pub fn assign_pictype(cfg: &Config, num: i64, poc: i32, is_irap: bool, irap_poc: i32) -> PicType {
  if is_irap {
    if num == 0
      || cfg.intra_period == 1
      || cfg.gop_len == 0
      || cfg.gop_lowdelay
      || !cfg.open_gop
    {
      // Closed GOPs use IDR pictures. An all-intra stream marks every
      // IDR after the first as usable with leading pictures.
      if cfg.intra_period == 1 && num > 0 {
        PicType::IdrWRadl
      } else {
        PicType::IdrNLp
      }
    } else {
      PicType::Cra
    }
  } else if poc < irap_poc {
    PicType::Rasl
  } else {
    PicType::Trail
  }
}

/// Drop references the current picture can no longer use.
pub fn remove_refs(
  ctrl: &EncoderControl,
  refs: &mut RefList,
  poc: i32,
  gop_offset: usize,
  pictype: PicType,
  irap_poc: i32,
) {
  let cfg = &ctrl.cfg;

  let (neg_refs, pos_refs) = if cfg.gop_len > 0 {
    let e = &ctrl.gop[gop_offset];
    (e.ref_neg.clone(), e.ref_pos.clone())
  } else {
    (Vec::new(), Vec::new())
  };

  let mut target_ref_num = if cfg.gop_len > 0 {
    neg_refs.len() + pos_refs.len()
  } else {
    cfg.ref_frames
  };

  if pictype.is_idr() {
    target_ref_num = 0;
  }

  if cfg.gop_len > 0 && target_ref_num > 0 {
    // Keep only pictures the GOP structure can still reach
    let mut idx = refs.used_size();
    while idx > 0 {
      idx -= 1;
      let ref_poc = refs.poc(idx);

      let mut is_referenced = neg_refs.iter().any(|&d| ref_poc == poc - d)
        || pos_refs.iter().any(|&d| ref_poc == poc + d);

      if ref_poc < irap_poc && irap_poc < poc {
        // Trailing frames cannot refer to leading frames
        is_referenced = false;
      }
      if cfg.intra_period > 0 && ref_poc < irap_poc - cfg.intra_period {
        // Nothing refers past the two preceding IRAPs
        is_referenced = false;
      }

      if !is_referenced {
        refs.remove(idx);
      }
    }
  } else {
    // No GOP: evict the oldest
    while refs.used_size() > target_ref_num {
      let oldest = refs.used_size() - 1;
      refs.remove(oldest);
    }
  }
}

// ----- Delta-QP maps ------------------------------------------------------

/// Area scaling factor of an equirectangular row towards the sphere.
fn ws_weight(y: usize, h: usize) -> f64 {
  ((y as f64 - 0.5 * h as f64 + 0.5) * (std::f64::consts::PI / h as f64)).cos()
}

/// Per-LCU-row delta QPs for 360-degree content; merges into an existing
/// ROI map when one is present.
pub fn init_erp_aqp_roi(ctrl: &EncoderControl, orig: Option<RoiMap>) -> RoiMap {
  let frame_height = ctrl.cfg.height;
  let new_height = ctrl.height_in_lcu;
  let new_width = orig.as_ref().map(|r| r.width).unwrap_or(1);

  let total_weight: f64 = (0..frame_height).map(|y| ws_weight(y, frame_height)).sum();

  let mut dqp = vec![0i8; new_width * new_height];
  for y_lcu in 0..new_height {
    let y_orig = LCU_WIDTH * y_lcu;
    let lcu_height = LCU_WIDTH.min(frame_height - y_orig);
    let lcu_weight: f64 = (y_orig..y_orig + lcu_height).map(|y| ws_weight(y, frame_height)).sum();
    let lcu_weight = (lcu_weight * frame_height as f64) / (total_weight * lcu_height as f64);

    let qp_delta = (-ERP_AQP_STRENGTH * lcu_weight.log2()).round() as i32;

    if let Some(orig) = &orig {
      let y_roi = y_lcu * orig.height / new_height;
      for x in 0..new_width {
        dqp[x + y_lcu * new_width] =
          clip(-51, 51, orig.dqp[x + y_roi * orig.width] as i32 + qp_delta) as i8;
      }
    } else {
      dqp[y_lcu] = clip(-51, 51, qp_delta) as i8;
    }
  }

  RoiMap { width: new_width, height: new_height, dqp: dqp }
}

/// Read the next delta-QP frame from the ROI file: width, height, then
/// width * height values.
pub fn next_roi_frame_from_file(
  reader: &mut BufReader<File>,
  format: crate::config::RoiFormat,
) -> Result<RoiMap, Error> {
  use crate::config::RoiFormat;

  let mut read_number = |reader: &mut BufReader<File>| -> Result<i32, Error> {
    let mut value = String::new();
    loop {
      let mut byte = [0u8; 1];
      match reader.read(&mut byte) {
        Ok(0) => break,
        Ok(_) => {
          let c = byte[0] as char;
          if c.is_ascii_whitespace() {
            if !value.is_empty() {
              break;
            }
          } else {
            value.push(c);
          }
        }
        Err(_) => return Err(Error::BadInput("reading ROI file failed")),
      }
    }
    value.parse().map_err(|_| Error::BadInput("malformed ROI file"))
  };

  let (width, height) = match format {
    RoiFormat::Txt => (read_number(reader)?, read_number(reader)?),
    RoiFormat::Bin => {
      let mut dims = [0u8; 8];
      reader
        .read_exact(&mut dims)
        .map_err(|_| Error::BadInput("failed to read ROI size"))?;
      (
        i32::from_le_bytes(dims[0..4].try_into().unwrap()),
        i32::from_le_bytes(dims[4..8].try_into().unwrap()),
      )
    }
  };

  if width <= 0 || height <= 0 {
    return Err(Error::BadInput("invalid ROI size"));
  }
  if width > 10000 || height > 10000 {
    return Err(Error::BadInput("ROI dimensions exceed 10000"));
  }

  let size = (width * height) as usize;
  let mut dqp = vec![0i8; size];
  match format {
    RoiFormat::Txt => {
      for v in dqp.iter_mut() {
        *v = clip(-51, 51, read_number(reader)?) as i8;
      }
    }
    RoiFormat::Bin => {
      let mut raw = vec![0u8; size];
      reader
        .read_exact(&mut raw)
        .map_err(|_| Error::BadInput("reading ROI file failed"))?;
      for (v, r) in dqp.iter_mut().zip(raw) {
        *v = r as i8;
      }
    }
  }

  Ok(RoiMap { width: width as usize, height: height as usize, dqp: dqp })
}

/// Variance-adaptive per-LCU QP offsets:
/// strength * (ln(lcu variance) - ln(frame variance)).
pub fn vaq_offsets(ctrl: &EncoderControl, source: &Picture) -> Vec<f64> {
  let cfg = &ctrl.cfg;
  let d = cfg.vaq as f64 * 0.1;
  let has_chroma = true;

  let mut frame_var = crate::strategies::pixel_var(&source.y().data);
  if has_chroma {
    frame_var += crate::strategies::pixel_var(&source.u().data);
    frame_var += crate::strategies::pixel_var(&source.v().data);
  }

  let mut offsets = Vec::with_capacity(ctrl.width_in_lcu * ctrl.height_in_lcu);
  for y in 0..ctrl.height_in_lcu {
    for x in 0..ctrl.width_in_lcu {
      // Edge CTUs are extended by repeating the border samples so the
      // variance is not biased by a short block.
      let mut samples = Vec::with_capacity(LCU_WIDTH * LCU_WIDTH);
      for yy in 0..LCU_WIDTH {
        for xx in 0..LCU_WIDTH {
          let sx = (x * LCU_WIDTH + xx).min(source.width - 1);
          let sy = (y * LCU_WIDTH + yy).min(source.height - 1);
          samples.push(source.y().at(sx, sy));
        }
      }
      let mut lcu_var = crate::strategies::pixel_var(&samples);
      if has_chroma {
        let mut chroma = Vec::with_capacity(samples.len() / 2);
        for plane in 1..3 {
          let p = source.plane(plane);
          for yy in 0..LCU_WIDTH >> source.chroma_scale_y {
            for xx in 0..LCU_WIDTH >> source.chroma_scale_x {
              let sx = ((x * LCU_WIDTH >> source.chroma_scale_x) + xx).min(p.width - 1);
              let sy = ((y * LCU_WIDTH >> source.chroma_scale_y) + yy).min(p.height - 1);
              chroma.push(p.at(sx, sy));
            }
          }
          lcu_var += crate::strategies::pixel_var(&chroma);
          chroma.clear();
        }
      }
      offsets.push(d * (lcu_var.max(1.0).ln() - frame_var.max(1.0).ln()));
    }
  }
  offsets
}

/// Frame-level joint Cb-Cr sign, from the correlation of high-pass
/// filtered chroma planes.
pub fn joint_cb_cr_sign(pic: &Picture) -> bool {
  let cb = pic.u();
  let cr = pic.v();
  if cb.width < 3 || cb.height < 3 {
    return true;
  }

  let mut sum_cb_cr = 0i64;
  for y in 1..cb.height - 1 {
    for x in 1..cb.width - 1 {
      let hp = |p: &crate::picture::Plane| {
        12 * p.at(x, y) as i64
          - 2 * (p.at(x - 1, y) as i64 + p.at(x + 1, y) as i64
               + p.at(x, y - 1) as i64 + p.at(x, y + 1) as i64)
          - (p.at(x - 1, y - 1) as i64 + p.at(x + 1, y - 1) as i64
           + p.at(x - 1, y + 1) as i64 + p.at(x + 1, y + 1) as i64)
      };
      sum_cb_cr += hp(cb) * hp(cr);
    }
  }
  sum_cb_cr < 0
}

// ----- Frame state construction -------------------------------------------

fn build_tiles(ctrl: &EncoderControl, params: &FrameParams) -> Vec<Arc<TileEncode>> {
  let cfg = &ctrl.cfg;
  let tiles_x = cfg.tiles_width_count;
  let tiles_y = cfg.tiles_height_count;
  let mut tiles = Vec::with_capacity(tiles_x * tiles_y);

  for ty in 0..tiles_y {
    for tx in 0..tiles_x {
      // Uniform split on the LCU grid
      let lcu_x0 = tx * ctrl.width_in_lcu / tiles_x;
      let lcu_x1 = (tx + 1) * ctrl.width_in_lcu / tiles_x;
      let lcu_y0 = ty * ctrl.height_in_lcu / tiles_y;
      let lcu_y1 = (ty + 1) * ctrl.height_in_lcu / tiles_y;
      let w_lcu = lcu_x1 - lcu_x0;
      let h_lcu = lcu_y1 - lcu_y0;

      let mut lcu_order = Vec::with_capacity(w_lcu * h_lcu);
      for row in 0..h_lcu {
        for col in 0..w_lcu {
          let id = row * w_lcu + col;
          let px = (lcu_x0 + col) * LCU_WIDTH;
          let py = (lcu_y0 + row) * LCU_WIDTH;
          lcu_order.push(LcuOrderElement {
            id: id,
            position: (col, row),
            position_px: (px, py),
            size: (
              LCU_WIDTH.min(params.width - px),
              LCU_WIDTH.min(params.height - py),
            ),
            above: (row > 0).then(|| id - w_lcu),
            left: (col > 0).then(|| id - 1),
            right: (col + 1 < w_lcu).then(|| id + 1),
            below: (row + 1 < h_lcu).then(|| id + w_lcu),
            last_column: col + 1 == w_lcu,
            last_row: row + 1 == h_lcu,
          });
        }
      }

      let num_leaves = if cfg.wpp { h_lcu } else { 1 };
      let leaves = (0..num_leaves)
        .map(|_| {
          let ctx = ContextSet::new(params.qp, params.slicetype);
          let mut leaf = LeafState {
            cabac: Cabac::new(ctx.clone()),
            search_cabac: Cabac::new(ctx),
            qp_coding: QpCoding { last_qp: params.qp, qp_delta_coded: false },
          };
          ctu::reset_leaf(&mut leaf, params.qp, params.slicetype);
          Arc::new(Mutex::new(leaf))
        })
        .collect();

      let num_lcus = w_lcu * h_lcu;
      let work = TileWork {
        hor_buf_search: YuvLineBuf::new_hor(params.width, ctrl.height_in_lcu, params.chroma_scale_x),
        ver_buf_search: YuvLineBuf::new_ver(params.height, ctrl.width_in_lcu, params.chroma_scale_y),
        hor_buf_before_sao: YuvLineBuf::new_hor(params.width, ctrl.height_in_lcu, params.chroma_scale_x),
        ver_buf_before_sao: YuvLineBuf::new_ver(params.height, ctrl.width_in_lcu, params.chroma_scale_y),
        sao_luma: vec![SaoInfo::default(); num_lcus],
        sao_chroma: vec![SaoInfo::default(); num_lcus],
        hmvp: HmvpLut::new(ctrl.height_in_lcu),
        ibc_maps: IbcHashMaps::new(params.width, params.height, ctrl.height_in_lcu),
        ibc_buffer: IbcBuffer::new(ctrl.height_in_lcu, params.chroma_scale_x),
        coeffs: (0..num_lcus).map(|_| None).collect(),
        lcu_qp: vec![params.qp; num_lcus],
        lcu_lambda: vec![params.lambda; num_lcus],
        lcu_lambda_sqrt: vec![params.lambda_sqrt; num_lcus],
      };

      tiles.push(Arc::new(TileEncode {
        rect_px: (
          lcu_x0 * LCU_WIDTH,
          lcu_y0 * LCU_WIDTH,
          (w_lcu * LCU_WIDTH).min(params.width - lcu_x0 * LCU_WIDTH),
          (h_lcu * LCU_WIDTH).min(params.height - lcu_y0 * LCU_WIDTH),
        ),
        rect_lcu: (lcu_x0, lcu_y0, w_lcu, h_lcu),
        lcu_order: lcu_order,
        work: Mutex::new(work),
        leaves: leaves,
      }));
    }
  }

  tiles
}

pub fn build_frame_encode(
  ctrl: &EncoderControl,
  params: Arc<FrameParams>,
  source: Arc<Picture>,
) -> Arc<FrameEncode> {
  let cfg = &ctrl.cfg;

  let source_mapped = params.lmcs.as_ref().filter(|l| l.enabled).map(|luts| {
    let mut mapped = Picture::new(source.width, source.height, cfg.chroma_format, 0);
    for plane in 0..3 {
      mapped.planes[plane].data.copy_from_slice(&source.planes[plane].data);
    }
    lmcs::map_plane(&luts.fwd, &mut mapped.planes[0]);
    Arc::new(mapped)
  });

  let mut recon = Picture::new(params.width, params.height, cfg.chroma_format,
                               1 << (params.bitdepth - 1));
  recon.poc = params.poc;
  recon.pts = source.pts;
  recon.dts = source.dts;

  let num_lcus = ctrl.width_in_lcu * ctrl.height_in_lcu;
  let tiles = build_tiles(ctrl, &params);

  Arc::new(FrameEncode {
    source: source,
    source_mapped: source_mapped,
    recon: Arc::new(Mutex::new(recon)),
    cu_array: Arc::new(Mutex::new(CuArray::new(params.width, params.height))),
    tiles: tiles,
    rc: Mutex::new(RcState {
      cur_frame_bits_coded: 0,
      remaining_weight: 1.0,
      lcu_stats: vec![LcuStats { weight: 1.0 / num_lcus as f64,
                                 original_weight: 1.0 / num_lcus as f64,
                                 ..LcuStats::default() }; num_lcus],
    }),
    alf: Mutex::new(AlfFrameInfo::new(num_lcus)),
    error: Mutex::new(None),
    params: params,
  })
}

// ----- Job graph ----------------------------------------------------------

pub struct EncodedFrame {
  pub data: Vec<u8>,
  pub pts: i64,
  pub dts: i64,
  pub poc: i32,
}

/// Handles to one submitted frame, kept while later frames may still
/// depend on it.
pub struct FrameJobs {
  pub num: i64,
  pub poc: i32,
  pub slicetype: SliceType,
  /// Search jobs indexed [tile][lcu]
  pub search_jobs: Vec<Vec<Job>>,
  pub emit_job: Job,
  pub output: Arc<Mutex<Option<EncodedFrame>>>,
  pub fe: Arc<FrameEncode>,
}

// Walk to the CTU whose reconstruction bounds all samples an MV from
// `lcu_id` may touch in the reference frame.
fn dependency_lcu(tile: &TileEncode, lcu_id: usize, down: i32, right: i32) -> usize {
  let mut dep = lcu_id;
  for _ in 0..down {
    match tile.lcu_order[dep].below {
      Some(next) => dep = next,
      None => break,
    }
  }
  for _ in 0..right {
    match tile.lcu_order[dep].right {
      Some(next) => dep = next,
      None => break,
    }
  }
  dep
}

/// Build, wire and submit every job of one frame: per-CTU search and
/// bitstream jobs, the optional frame-level ALF job, and the emit job
/// that concatenates the substreams in bitstream order.
pub fn submit_frame(
  ctrl: &Arc<EncoderControl>,
  fe: &Arc<FrameEncode>,
  history: &[Arc<FrameJobs>],
  prev_emit: Option<&Job>,
) -> FrameJobs {
  let cfg = &ctrl.cfg;
  let params = &fe.params;

  // Select the frame whose reconstruction this one's MVs may chase.
  let ref_index: Option<usize> = if params.slicetype == SliceType::I || history.is_empty() {
    None
  } else if cfg.gop_lowdelay && cfg.gop_len > 0 {
    // Depend on the first actual reference of the low-delay GOP
    let ref_neg = ctrl.gop[params.gop_offset].ref_neg[0] as usize;
    if ref_neg > cfg.owf {
      // Outside the output window: already finished
      None
    } else {
      history.len().checked_sub(ref_neg)
    }
  } else {
    Some(history.len() - 1)
  };
  let ref_jobs: Option<&FrameJobs> = ref_index.map(|i| &*history[i]);
  let ref_predecessor: Option<&FrameJobs> =
    ref_index.and_then(|i| i.checked_sub(1)).map(|i| &*history[i]);

  // ALF needs a frame-level decision point between search and emission
  let alf_job = (cfg.alf_type != AlfType::Off).then(|| {
    let ctrl = ctrl.clone();
    let fe = fe.clone();
    Job::new("alf_process", move || {
      if fe.error.lock().unwrap().is_some() {
        return;
      }
      let mut recon = fe.recon.lock().unwrap();
      let mut alf = fe.alf.lock().unwrap();
      // The reconstruction has left the mapped domain by now, so the
      // filter decision compares against the original source.
      let enabled = crate::alf::alf_enc_process(
        &fe.source,
        &mut recon,
        &mut alf,
        ctrl.width_in_lcu,
        ctrl.height_in_lcu,
        fe.params.bitdepth,
        fe.params.lambda,
      );
      debug!("ALF enabled {} CTU flags for POC {}", enabled, fe.params.poc);

      // The counting pass ran the contexts forward; restart every leaf
      // for the real emission.
      for tile in &fe.tiles {
        for leaf in &tile.leaves {
          let mut leaf = leaf.lock().unwrap();
          ctu::reset_leaf(&mut leaf, fe.params.qp, fe.params.slicetype);
        }
      }
    })
  });

  let mut search_jobs: Vec<Vec<Job>> = Vec::with_capacity(fe.tiles.len());
  let mut bitstream_jobs: Vec<Vec<Job>> = Vec::with_capacity(fe.tiles.len());

  for (tile_idx, tile) in fe.tiles.iter().enumerate() {
    let w = tile.width_in_lcu();
    let count = tile.lcu_order.len();
    let mut tile_search = Vec::with_capacity(count);
    let mut tile_bitstream = Vec::with_capacity(count);

    for lcu_id in 0..count {
      let (c, f, t) = (ctrl.clone(), fe.clone(), tile.clone());
      tile_search.push(Job::new("lcu_search", move || {
        ctu::worker_search_lcu(&c, &f, &t, lcu_id);
      }));
      let (c, f, t) = (ctrl.clone(), fe.clone(), tile.clone());
      tile_bitstream.push(Job::new("lcu_bitstream", move || {
        ctu::worker_bitstream_lcu(&c, &f, &t, lcu_id);
      }));
    }

    for lcu_id in 0..count {
      let lcu = &tile.lcu_order[lcu_id];
      let search = &tile_search[lcu_id];
      let bitstream = &tile_bitstream[lcu_id];

      // Wavefront shape: raster within a row, and a two-CTU stagger
      // against the row above (the above-right CTU must be searched for
      // its reconstruction to be readable).
      if let Some(left) = lcu.left {
        search.depend_on(&tile_search[left]);
      }
      if let Some(above) = lcu.above {
        let above_right = tile.lcu_order[above].right.unwrap_or(above);
        search.depend_on(&tile_search[above_right]);
      }

      // Cross-frame: wait until the CTUs whose samples an MV may read
      // are reconstructed in the reference frame.
      if let Some(ref_jobs) = ref_jobs {
        let dep = dependency_lcu(
          tile,
          lcu_id,
          ctrl.max_inter_ref_lcu.0,
          ctrl.max_inter_ref_lcu.1 + 1,
        );
        search.depend_on(&ref_jobs.search_jobs[tile_idx][dep]);

        // An IRAP reference inside the output window may itself still
        // be replacing the previous frame's reconstruction; hold the
        // search until that predecessor is finished too.
        if ref_jobs.slicetype == SliceType::I && ref_jobs.num > 0 && cfg.owf > 1 {
          if let Some(pred) = ref_predecessor {
            search.depend_on(&pred.search_jobs[tile_idx][dep]);
          }
        }

        // A deeper output window than the GOP can outrun an open-GOP
        // IRAP: the frame one GOP back is then still in flight.
        if !cfg.gop_lowdelay
          && cfg.open_gop
          && cfg.gop_len != 0
          && cfg.owf > cfg.gop_len
          && ref_jobs.slicetype == SliceType::I
          && ref_jobs.num > 0
        {
          let wanted_poc = params.poc - cfg.gop_len as i32;
          if let Some(older) = history.iter().rev().find(|h| h.poc == wanted_poc) {
            search.depend_on(&older.search_jobs[tile_idx][dep]);
          }
        }
      }

      // Bitstream jobs: after this CTU's search, then in strict stream
      // order. Under WPP each row has its own substream, so a row only
      // waits for the second CTU of the row above (the hand-off point);
      // without WPP the whole tile is one substream coded in raster
      // order.
      bitstream.depend_on(search);
      if cfg.wpp {
        if let Some(left) = lcu.left {
          bitstream.depend_on(&tile_bitstream[left]);
        }
        if let Some(above) = lcu.above {
          let above_handoff = (above - above % w) + 1.min(w - 1);
          bitstream.depend_on(&tile_bitstream[above_handoff]);
        }
      } else if lcu_id > 0 {
        bitstream.depend_on(&tile_bitstream[lcu_id - 1]);
      }
      if let Some(alf) = &alf_job {
        alf.depend_on(search);
        bitstream.depend_on(alf);
      }
    }

    search_jobs.push(tile_search);
    bitstream_jobs.push(tile_bitstream);
  }

  // The emit job gathers every leaf stream in bitstream order and
  // serializes against the previous frame's emission.
  let output = Arc::new(Mutex::new(None));
  let emit_job = {
    let fe = fe.clone();
    let cfg_wpp = cfg.wpp;
    let output = output.clone();
    Job::new("frame_emit", move || {
      if fe.error.lock().unwrap().is_some() {
        return;
      }
      let mut payload: Vec<u8> = Vec::new();
      let mut substreams: Vec<Vec<u8>> = Vec::new();
      for tile in &fe.tiles {
        let num_leaves = if cfg_wpp { tile.leaves.len() } else { 1 };
        for leaf in tile.leaves.iter().take(num_leaves) {
          let mut leaf = leaf.lock().unwrap();
          substreams.push(leaf.cabac.stream.take_bytes());
        }
      }
      // Entry-point offsets, then the concatenated substreams
      for sub in substreams.iter().skip(1) {
        crate::util::put_be_bytes(&mut payload, sub.len() as u64, 4);
      }
      for sub in &substreams {
        payload.extend_from_slice(sub);
      }

      let (pts, dts, poc) = {
        let recon = fe.recon.lock().unwrap();
        (recon.pts, recon.dts, recon.poc)
      };
      *output.lock().unwrap() = Some(EncodedFrame { data: payload, pts: pts, dts: dts, poc: poc });
    })
  };

  if cfg.wpp {
    // Each row's substream closes with the last CTU of the row
    for (tile_idx, tile) in fe.tiles.iter().enumerate() {
      let w = tile.width_in_lcu();
      for row in 0..tile.height_in_lcu() {
        emit_job.depend_on(&bitstream_jobs[tile_idx][row * w + w - 1]);
      }
    }
  } else {
    for tile_bitstream in &bitstream_jobs {
      if let Some(last) = tile_bitstream.last() {
        emit_job.depend_on(last);
      }
    }
  }
  if let Some(prev) = prev_emit {
    emit_job.depend_on(prev);
  }

  // Everything is wired; release the graph.
  let queue = &ctrl.threadqueue;
  if let Some(alf) = &alf_job {
    queue.submit(alf);
  }
  for tile_idx in 0..fe.tiles.len() {
    for job in &search_jobs[tile_idx] {
      queue.submit(job);
    }
    for job in &bitstream_jobs[tile_idx] {
      queue.submit(job);
    }
  }
  queue.submit(&emit_job);

  debug!(
    "submitted frame num {} poc {} ({:?}), {} CTUs",
    params.num,
    params.poc,
    params.slicetype,
    fe.tiles.iter().map(|t| t.lcu_order.len()).sum::<usize>()
  );

  FrameJobs {
    num: params.num,
    poc: params.poc,
    slicetype: params.slicetype,
    search_jobs: search_jobs,
    emit_job: emit_job,
    output: output,
    fe: fe.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ctrl_with(cfg: Config) -> EncoderControl {
    EncoderControl::new(cfg).unwrap()
  }

  fn base_cfg() -> Config {
    Config { width: 128, height: 128, ..Config::default() }
  }

  #[test]
  fn poc_counts_frames_without_gop() {
    let ctrl = ctrl_with(Config { intra_period: 0, ..base_cfg() });
    let mut state = ControllerState::new();
    for num in 0..5 {
      state.frame_num = num;
      let (poc, irap, _) = assign_poc(&ctrl, &mut state, 0);
      assert_eq!(poc, num as i32);
      assert_eq!(irap, num == 0);
    }
  }

  #[test]
  fn intra_period_resets_poc() {
    let ctrl = ctrl_with(Config { intra_period: 4, gop_len: 0, ..base_cfg() });
    let mut state = ControllerState::new();
    let pocs: Vec<i32> = (0..9)
      .map(|num| {
        state.frame_num = num;
        assign_poc(&ctrl, &mut state, 0).0
      })
      .collect();
    assert_eq!(pocs, vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
  }

  #[test]
  fn closed_gop_inserts_idr_every_period_plus_one() {
    let cfg = Config { gop_len: 8, intra_period: 16, open_gop: false, ..base_cfg() };
    let ctrl = ctrl_with(cfg);
    let mut state = ControllerState::new();

    // Frame 17 = 1 + 16: framenum 16 hits intra_period modulo
    state.frame_num = 17;
    let off = gop_offset_for(&ctrl, 17);
    let (poc, irap, closed) = assign_poc(&ctrl, &mut state, off);
    assert_eq!(poc, 0);
    assert!(irap);
    assert!(closed);

    // The next frame is inside the new GOP and must not be an IRAP,
    // even where the plain modulo check would fire.
    state.frame_num = 18;
    let off = gop_offset_for(&ctrl, 18);
    let (_, irap, closed) = assign_poc(&ctrl, &mut state, off);
    assert!(closed);
    assert!(!irap);
  }

  #[test]
  fn all_intra_idr_marking() {
    // With intra_period == 1 every picture is an IRAP; frame 0 is a
    // plain IDR, later ones allow leading pictures.
    let cfg = Config { intra_period: 1, ..base_cfg() };
    assert_eq!(assign_pictype(&cfg, 0, 0, true, 0), PicType::IdrNLp);
    assert_eq!(assign_pictype(&cfg, 3, 3, true, 0), PicType::IdrWRadl);
  }

  #[test]
  fn open_gop_irap_is_cra_and_leading_pictures_are_rasl() {
    let cfg = Config { gop_len: 8, open_gop: true, intra_period: 16, ..base_cfg() };
    assert_eq!(assign_pictype(&cfg, 20, 16, true, 16), PicType::Cra);
    assert_eq!(assign_pictype(&cfg, 21, 12, false, 16), PicType::Rasl);
    assert_eq!(assign_pictype(&cfg, 25, 20, false, 16), PicType::Trail);
  }

  #[test]
  fn without_gop_oldest_reference_is_evicted() {
    let cfg = Config { ref_frames: 2, intra_period: 0, ..base_cfg() };
    let ctrl = ctrl_with(cfg);
    let mut refs = RefList::new();
    for poc in 0..3 {
      let pic = Picture::new(16, 16, ChromaFormat::Csp420, 0);
      refs.add(crate::reflist::RefEntry {
        recon: Arc::new(Mutex::new(pic)),
        cu: Arc::new(Mutex::new(CuArray::new(16, 16))),
        poc: poc,
        ref_pocs: Vec::new(),
        ref_lx: [Vec::new(), Vec::new()],
      });
    }
    remove_refs(&ctrl, &mut refs, 3, 0, PicType::Trail, 0);
    assert_eq!(refs.used_size(), 2);
    assert_eq!(refs.poc(0), 2);
    assert_eq!(refs.poc(1), 1);
  }

  #[test]
  fn erp_map_raises_qp_at_the_poles() {
    let ctrl = ctrl_with(Config { height: 256, erp_aqp: true, ..base_cfg() });
    let roi = init_erp_aqp_roi(&ctrl, None);
    assert_eq!(roi.height, 4);
    // Top rows map to less spherical area: positive delta QP; the
    // equator rows stay at or below zero.
    assert!(roi.dqp[0] > roi.dqp[1]);
    assert!(roi.dqp[0] > 0);
    assert!(roi.dqp[1] <= roi.dqp[0]);
  }

  #[test]
  fn lambda_grows_with_qp() {
    assert!(lambda_from_qp(30) > lambda_from_qp(20));
    assert!((lambda_from_qp(12) - 0.57).abs() < 1e-9);
  }
}
