// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

//! A small VVC (H.266) encoder core.
//!
//! Raw YCbCr pictures go in through [`Encoder::encode_one_frame`];
//! compressed slice payloads come back out of [`Encoder::output_pull`]
//! in presentation-independent bitstream order. Encoding runs on a
//! worker pool with wavefront, tile and output-window (frame-level)
//! parallelism; the output path is serialized so pulling never reorders.

pub mod alf;
pub mod bitstream;
pub mod cabac;
pub mod config;
pub mod context;
pub mod ctu;
pub mod cu;
pub mod filter;
pub mod frame;
pub mod hmvp;
pub mod ibc;
pub mod inter;
pub mod lmcs;
pub mod picture;
pub mod reflist;
pub mod sao;
pub mod scheduler;
pub mod search;
pub mod strategies;
pub mod tree;
pub mod util;

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};

use config::{Config, SliceType};
use frame::{
  assign_pictype, assign_poc, build_frame_encode, gop_offset_for, init_erp_aqp_roi,
  joint_cb_cr_sign, next_roi_frame_from_file, remove_refs, submit_frame, vaq_offsets,
  ControllerState, EncodedFrame, EncoderControl, FrameJobs, FrameParams,
};
use picture::Picture;
use reflist::RefEntry;

/// Everything that can go wrong, sorted by whose fault it is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
  /// The configuration cannot be encoded with; rejected at creation.
  #[error("invalid configuration: {0}")]
  BadConfig(&'static str),
  /// A picture or side-channel input is malformed; fails the frame.
  #[error("invalid input: {0}")]
  BadInput(&'static str),
  /// An allocation failed; the frame is discarded.
  #[error("out of resources")]
  Resource,
  /// Byte-level write into an unaligned bitstream.
  #[error("bitstream writer is not byte aligned")]
  NotAligned,
}

// What the next frame needs to know about the one before it.
struct PrevFrame {
  recon: Arc<std::sync::Mutex<Picture>>,
  cu: Arc<std::sync::Mutex<cu::CuArray>>,
  poc: i32,
  gop_offset: usize,
  ref_lx: [Vec<u8>; 2],
  ref_pocs: Vec<i32>,
}

pub struct Encoder {
  ctrl: Arc<EncoderControl>,
  state: ControllerState,
  prev: Option<PrevFrame>,
  /// Recently submitted frames, newest last; cross-frame dependencies
  /// index into this.
  history: VecDeque<Arc<FrameJobs>>,
  /// Submitted but not yet pulled frames, oldest first.
  out_queue: VecDeque<Arc<FrameJobs>>,
  prepared: bool,
}

impl Encoder {
  pub fn new(cfg: Config) -> Result<Self, Error> {
    let ctrl = EncoderControl::new(cfg)?;
    Ok(Encoder {
      ctrl: Arc::new(ctrl),
      state: ControllerState::new(),
      prev: None,
      history: VecDeque::new(),
      out_queue: VecDeque::new(),
      prepared: false,
    })
  }

  pub fn config(&self) -> &Config {
    &self.ctrl.cfg
  }

  /// Advance to the next frame: retire the previous reconstruction into
  /// the reference list and prune references that fell out of reach.
  /// Called implicitly by [`Self::encode_one_frame`].
  pub fn prepare_frame(&mut self) {
    if self.prepared {
      return;
    }

    if let Some(prev) = self.prev.take() {
      let keep = {
        let cfg = &self.ctrl.cfg;
        cfg.gop_len == 0
          || prev.poc == 0
          || self.ctrl.gop[prev.gop_offset].is_ref
      };
      if keep {
        self.state.refs.add(RefEntry {
          recon: prev.recon,
          cu: prev.cu,
          poc: prev.poc,
          ref_pocs: prev.ref_pocs,
          ref_lx: prev.ref_lx,
        });
      }
    }

    self.prepared = true;
  }

  /// Encode one picture. Returns as soon as the frame's jobs are
  /// submitted; pull results with [`Self::output_pull`]. Blocks only
  /// when the output window is full.
  pub fn encode_one_frame(&mut self, mut pic: Picture) -> Result<(), Error> {
    let cfg = self.ctrl.cfg.clone();

    if pic.width != cfg.width || pic.height != cfg.height {
      return Err(Error::BadInput("picture size does not match the configuration"));
    }
    if pic.roi.is_some() && self.ctrl.roi_file.is_some() {
      // Two sources of delta-QP data cannot be reconciled
      warn!("ROI data supplied both via file and API");
      return Err(Error::BadConfig("ROI file conflicts with per-picture ROI data"));
    }

    self.prepare_frame();

    let num = self.state.frame_num;
    let ctrl = self.ctrl.clone();

    // ----- Frame controller ------------------------------------------------
    let gop_offset = gop_offset_for(&ctrl, num);
    let (poc, is_irap, _closed_gop) = assign_poc(&ctrl, &mut self.state, gop_offset);
    if is_irap {
      self.state.irap_poc = poc;
    }
    self.state.poc = poc;
    let pictype = assign_pictype(&cfg, num, poc, is_irap, self.state.irap_poc);

    remove_refs(&ctrl, &mut self.state.refs, poc, gop_offset, pictype, self.state.irap_poc);

    let l1_negative_refs = cfg.bipred && (cfg.gop_len == 0 || cfg.gop_lowdelay);
    let ref_lx = self.state.refs.build_ref_lx(poc, l1_negative_refs);

    let slicetype = if is_irap {
      SliceType::I
    } else if !ref_lx[1].is_empty() {
      SliceType::B
    } else {
      SliceType::P
    };

    let mut qp = cfg.qp;
    if cfg.gop_len > 0 && !is_irap {
      qp += ctrl.gop[gop_offset].qp_offset;
    }
    let qp = util::clip(0, 51, qp);
    let lambda = 0.57 * 2f64.powf((qp - 12) as f64 / 3.0);

    // Delta-QP map sources: file, per-picture data, 360-degree
    // weighting, variance adaptation.
    let mut roi = match (&self.ctrl.roi_file, cfg.roi.format) {
      (Some(file), Some(format)) => {
        let mut file = file.lock().unwrap();
        Some(next_roi_frame_from_file(&mut file, format)?)
      }
      _ => pic.roi.take(),
    };
    if cfg.erp_aqp {
      roi = Some(init_erp_aqp_roi(&ctrl, roi));
    }
    let aq_offsets = if cfg.vaq > 0 { vaq_offsets(&ctrl, &pic) } else { Vec::new() };

    let max_qp_delta_depth = if roi.is_some() || cfg.vaq > 0 { 0 } else { -1 };

    let lmcs = cfg.lmcs_enable.then(|| lmcs::build_luts(&pic, cfg.bitdepth));
    let jccr_sign = cfg.jccr && joint_cb_cr_sign(&pic);

    let (sx, sy) = match cfg.chroma_format {
      config::ChromaFormat::Csp420 => (1, 1),
      config::ChromaFormat::Csp444 => (0, 0),
    };

    let params = Arc::new(FrameParams {
      num: num,
      poc: poc,
      gop_offset: gop_offset,
      slicetype: slicetype,
      pictype: pictype,
      is_irap: is_irap,
      irap_poc: self.state.irap_poc,
      width: cfg.width,
      height: cfg.height,
      bitdepth: cfg.bitdepth,
      has_chroma: true,
      chroma_scale_x: sx,
      chroma_scale_y: sy,
      qp: qp,
      lambda: lambda,
      lambda_sqrt: lambda.sqrt(),
      max_qp_delta_depth: max_qp_delta_depth,
      refs: self.state.refs.clone(),
      ref_lx: ref_lx.clone(),
      roi: roi,
      aq_offsets: aq_offsets,
      jccr_sign: jccr_sign,
      lmcs: lmcs,
    });

    debug!(
      "frame num {} poc {} type {:?} slice {:?} qp {} refs {}",
      num, poc, pictype, slicetype, qp, params.refs.used_size(),
    );

    // Decode order timestamps follow submission order
    pic.dts = num;
    let ref_pocs_snapshot: Vec<i32> =
      (0..self.state.refs.used_size()).map(|i| self.state.refs.poc(i)).collect();

    let fe = build_frame_encode(&ctrl, params, Arc::new(pic));

    // ----- Job graph -------------------------------------------------------
    self.history.make_contiguous();
    let prev_emit = self.history.back().map(|h| h.emit_job.clone());
    let jobs = Arc::new(submit_frame(
      &ctrl,
      &fe,
      self.history.as_slices().0,
      prev_emit.as_ref(),
    ));

    self.prev = Some(PrevFrame {
      recon: fe.recon.clone(),
      cu: fe.cu_array.clone(),
      poc: poc,
      gop_offset: gop_offset,
      ref_lx: ref_lx,
      ref_pocs: ref_pocs_snapshot,
    });

    self.history.push_back(jobs.clone());
    let history_limit = cfg.owf.max(cfg.gop_len) + 2;
    while self.history.len() > history_limit {
      self.history.pop_front();
    }
    self.out_queue.push_back(jobs);

    self.state.frame_num += 1;
    self.prepared = false;

    // Bound the output window: with owf frames allowed in flight, the
    // frame owf+1 back must have finished before this call returns.
    if self.out_queue.len() > cfg.owf + 1 {
      let idx = self.out_queue.len() - 2 - cfg.owf;
      self.out_queue[idx].emit_job.wait();
    }

    Ok(())
  }

  /// Take the oldest finished frame, blocking until its bitstream job
  /// is done. Returns Ok(None) once nothing is in flight.
  pub fn output_pull(&mut self) -> Result<Option<EncodedFrame>, Error> {
    let Some(jobs) = self.out_queue.pop_front() else {
      return Ok(None);
    };
    jobs.emit_job.wait();

    if let Some(err) = ctu::error_of(&jobs.fe) {
      return Err(err);
    }

    let out = jobs.output.lock().unwrap().take();
    Ok(out)
  }

  /// Wait for every submitted frame to finish encoding. Frames remain
  /// queued for [`Self::output_pull`].
  pub fn flush(&mut self) {
    for jobs in &self.out_queue {
      jobs.emit_job.wait();
    }
  }
}
