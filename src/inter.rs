// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// Inter-picture motion search.
//
// For each PU the search assembles merge and AMVP candidates, runs an
// integer-pel pattern search per reference picture, optionally refines to
// quarter-pel, and scores bi-prediction pairs. Results are collected into
// small cost-sorted maps from which the mode decision picks the winner.
//
// Motion vectors are kept in 1/16-pel units throughout ("internal
// precision"); pattern searches operate on full-pel copies and convert on
// the way in and out.

use crate::cabac::Cabac;
use crate::config::{Config, EarlyTermination, ImeAlgorithm, MvConstraint, SliceType};
use crate::cu::{CuInfo, CU_IBC, CU_INTER, LCU_WIDTH};
use crate::frame::FrameParams;
use crate::context::{CTX_MVD_GREATER0, CTX_MVD_GREATER1};
use crate::ibc::{self, IbcHashMaps, HASH_BLOCK_SIZE};
use crate::picture::{Picture, Pixel, IBC_BUFFER_WIDTH};
use crate::strategies;
use crate::util::{clip, Vector2d};

pub const INTERNAL_MV_PREC: i32 = 4;
pub const MRG_MAX_NUM_CANDS: usize = 6;
pub const AMVP_MAX_NUM_CANDS: usize = 2;
pub const MAX_UNIT_STATS_MAP_SIZE: usize = 16;

const MAX_COST: f64 = f64::MAX / 4.0;

#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct MergeCand {
  /// [list][x/y], 1/16-pel
  pub mv: [[i32; 2]; 2],
  /// Bit 0: L0 valid, bit 1: L1 valid
  pub dir: u8,
  /// Per-list index into ref_LX
  pub ref_idx: [u8; 2],
}

/// Cost-sorted collection of candidate PUs, indexed through `keys`.
pub struct UnitStatsMap {
  pub unit: [CuInfo; MAX_UNIT_STATS_MAP_SIZE],
  pub cost: [f64; MAX_UNIT_STATS_MAP_SIZE],
  pub bits: [f64; MAX_UNIT_STATS_MAP_SIZE],
  pub keys: [usize; MAX_UNIT_STATS_MAP_SIZE],
  pub size: usize,
}

impl Default for UnitStatsMap {
  fn default() -> Self {
    UnitStatsMap {
      unit: [bytemuck::Zeroable::zeroed(); MAX_UNIT_STATS_MAP_SIZE],
      cost: [MAX_COST; MAX_UNIT_STATS_MAP_SIZE],
      bits: [0.0; MAX_UNIT_STATS_MAP_SIZE],
      keys: [0; MAX_UNIT_STATS_MAP_SIZE],
      size: 0,
    }
  }
}

impl UnitStatsMap {
  pub fn sort_keys_by_cost(&mut self) {
    let costs = &self.cost;
    self.keys[..self.size].sort_by(|&a, &b| costs[a].partial_cmp(&costs[b]).unwrap());
  }

  pub fn best_key(&self) -> usize {
    self.keys[0]
  }
}

/// Everything one PU search needs to know. `origin` is in frame pixels.
pub struct InterSearchInfo<'a> {
  pub cfg: &'a Config,
  pub params: &'a FrameParams,
  pub pic: &'a Picture,
  pub ref_pic: &'a Picture,
  pub ref_idx: usize,

  pub origin: Vector2d,
  pub width: i32,
  pub height: i32,

  pub mv_cand: [[i32; 2]; 2],
  pub merge_cand: Vec<MergeCand>,

  /// Tile rectangle in pixels (x, y, w, h); MV constraints are relative
  /// to it.
  pub tile_px: (i32, i32, i32, i32),
  pub max_ref_down: i32,
  pub max_ref_right: i32,

  /// Context states for fractional-bit rate estimates. Read-only; the
  /// RDO MVD cost forks off these states without updating them.
  pub search_cabac: &'a Cabac,

  /// Hash map of the current picture when searching block copies.
  pub ibc_maps: Option<&'a IbcHashMaps>,
  pub ibc_search: bool,
}

// ----- MV constraints -----------------------------------------------------

/// True if the block referenced by (x, y) (1/16-pel, relative) only uses
/// sample rows that are guaranteed final, and respects the configured MV
/// constraint. Filtering, not an error: candidates simply drop out.
pub fn fracmv_within_tile(info: &InterSearchInfo, x: i32, y: i32) -> bool {
  let frac_mask = (1 << INTERNAL_MV_PREC) - 1;
  let frac_mask_c = (1 << (INTERNAL_MV_PREC + 1)) - 1;

  let is_frac_luma = (x & frac_mask) != 0 || (y & frac_mask) != 0;
  let is_frac_chroma = (x & frac_mask_c) != 0 || (y & frac_mask_c) != 0;

  let cfg = info.cfg;

  if cfg.owf > 0 && cfg.wpp {
    // The referenced rows of the reference frame are only reconstructed
    // up to a diagonal front; stay far enough inside it.
    let mut margin = 2;
    if is_frac_luma {
      // Fractional motion needs up to 4 samples outside the block
      margin += 4;
    } else if is_frac_chroma {
      margin += 2;
    }

    if cfg.sao_type != crate::config::SaoType::Off {
      margin += crate::sao::SAO_DELAY_PX as i32;
    } else if cfg.deblock_enable {
      margin += crate::sao::DEBLOCK_DELAY_PX as i32;
    }

    let orig_lcu = Vector2d {
      x: info.origin.x / LCU_WIDTH as i32,
      y: info.origin.y / LCU_WIDTH as i32,
    };
    let lcu_span = (LCU_WIDTH as i32) << INTERNAL_MV_PREC;
    let mv_lcu = Vector2d {
      x: (((info.origin.x + info.width + margin) << INTERNAL_MV_PREC) + x) / lcu_span - orig_lcu.x,
      y: (((info.origin.y + info.height + margin) << INTERNAL_MV_PREC) + y) / lcu_span - orig_lcu.y,
    };

    if mv_lcu.y > info.max_ref_down {
      return false;
    }
    if mv_lcu.x + mv_lcu.y > info.max_ref_down + info.max_ref_right {
      return false;
    }
  }

  if cfg.mv_constraint == MvConstraint::None {
    return true;
  }

  let mut margin = 0;
  if cfg.mv_constraint == MvConstraint::FrameAndTileMargin {
    if is_frac_luma {
      margin = 4 << INTERNAL_MV_PREC;
    } else if is_frac_chroma {
      margin = 2 << INTERNAL_MV_PREC;
    }
  }

  let (tx, ty, tw, th) = info.tile_px;
  let abs_mv = Vector2d {
    x: ((info.origin.x - tx) << INTERNAL_MV_PREC) + x,
    y: ((info.origin.y - ty) << INTERNAL_MV_PREC) + y,
  };
  let from_right = (tw << INTERNAL_MV_PREC) - (abs_mv.x + (info.width << INTERNAL_MV_PREC));
  let from_bottom = (th << INTERNAL_MV_PREC) - (abs_mv.y + (info.height << INTERNAL_MV_PREC));

  abs_mv.x >= margin && abs_mv.y >= margin && from_right >= margin && from_bottom >= margin
}

pub fn intmv_within_tile(info: &InterSearchInfo, x: i32, y: i32) -> bool {
  fracmv_within_tile(info, x << INTERNAL_MV_PREC, y << INTERNAL_MV_PREC)
}

// ----- MVD rate estimates -------------------------------------------------

fn get_ep_ex_golomb_bitcost(mut symbol: u32) -> u32 {
  // Roughly 2 * log2(symbol)
  let mut bins = 0;
  if symbol >= 1 << 8 { bins += 16; symbol >>= 8; }
  if symbol >= 1 << 4 { bins += 8; symbol >>= 4; }
  if symbol >= 1 << 2 { bins += 4; symbol >>= 2; }
  if symbol >= 1 << 1 { bins += 2; }
  bins
}

fn get_mvd_coding_cost(_cabac: &Cabac, mvd_hor: i32, mvd_ver: i32) -> f64 {
  let mut bitcost = 4.0;
  let abs_x = mvd_hor.unsigned_abs();
  let abs_y = mvd_ver.unsigned_abs();
  bitcost += (abs_x == 1) as u32 as f64;
  bitcost += (abs_y == 1) as u32 as f64;
  bitcost += get_ep_ex_golomb_bitcost(abs_x) as f64;
  bitcost += get_ep_ex_golomb_bitcost(abs_y) as f64;
  bitcost
}

fn get_mvd_coding_cost_cabac(cabac: &Cabac, mvd_hor: i32, mvd_ver: i32) -> f64 {
  // Bit costs straight from the current context states; the real MVD
  // syntax is greater0 / greater1 flags plus an order-1 Exp-Golomb tail
  // and a sign per nonzero component.
  let mut bits = 0.0;
  for &comp in &[mvd_hor, mvd_ver] {
    let abs = comp.unsigned_abs();
    bits += cabac.ctx_bits(CTX_MVD_GREATER0, (abs > 0) as u8);
    if abs > 0 {
      bits += cabac.ctx_bits(CTX_MVD_GREATER1, (abs > 1) as u8);
      if abs > 1 {
        // order-1 Exp-Golomb length of abs - 2
        let v = abs - 2;
        let prefix = 32 - (v / 2 + 1).leading_zeros();
        bits += (2 * prefix) as f64;
      }
      bits += 1.0; // sign
    }
  }
  bits
}

/// Round an internal-precision MVD to the quarter-pel units it would be
/// coded in.
fn mvd_in_coded_precision(v: i32) -> i32 {
  let shift = INTERNAL_MV_PREC - 2;
  let offset = 1 << (shift - 1);
  if v >= 0 { (v + offset) >> shift } else { -((-v + offset) >> shift) }
}

/// Pick the better of the two AMVP candidates for the given MV.
pub fn select_mv_cand(
  cfg: &Config,
  cabac: &Cabac,
  mv_cand: [[i32; 2]; 2],
  mv_x: i32,
  mv_y: i32,
  cost_out: Option<&mut f64>,
) -> usize {
  let same_cand = mv_cand[0] == mv_cand[1];

  if same_cand && cost_out.is_none() {
    return 0;
  }

  let cost_fn = if cfg.mv_rdo { get_mvd_coding_cost_cabac } else { get_mvd_coding_cost };

  let cand1_cost = cost_fn(
    cabac,
    mvd_in_coded_precision(mv_x - mv_cand[0][0]),
    mvd_in_coded_precision(mv_y - mv_cand[0][1]),
  );
  let cand2_cost = if same_cand {
    cand1_cost
  } else {
    cost_fn(
      cabac,
      mvd_in_coded_precision(mv_x - mv_cand[1][0]),
      mvd_in_coded_precision(mv_y - mv_cand[1][1]),
    )
  };

  if let Some(out) = cost_out {
    *out = cand1_cost.min(cand2_cost);
  }
  (cand2_cost < cand1_cost) as usize
}

/// Rate-times-lambda cost of coding (x, y) at the given precision shift:
/// a matching merge candidate costs its index, anything else costs the
/// cheaper of the two AMVP-differential codings.
fn calc_mvd_cost(
  info: &InterSearchInfo,
  x: i32,
  y: i32,
  mv_shift: i32,
  bitcost: &mut f64,
) -> f64 {
  let x = x << mv_shift;
  let y = y << mv_shift;
  let mut temp_bitcost = 0.0;
  let mut merged = false;

  for (merge_idx, cand) in info.merge_cand.iter().enumerate() {
    if cand.dir == 3 {
      continue;
    }
    let list = (cand.dir - 1) as usize;
    if cand.mv[list][0] == x && cand.mv[list][1] == y
      && info.params.ref_lx[list].get(cand.ref_idx[list] as usize).copied()
        == Some(info.ref_idx as u8)
    {
      temp_bitcost += merge_idx as f64;
      merged = true;
      break;
    }
  }

  if !merged {
    let mut mvd_cost = 0.0;
    select_mv_cand(info.cfg, info.search_cabac, info.mv_cand, x, y, Some(&mut mvd_cost));
    temp_bitcost += mvd_cost;
  }
  *bitcost = temp_bitcost;
  temp_bitcost * info.params.lambda_sqrt
}

// ----- Integer search -----------------------------------------------------

struct BestMv {
  cost: f64,
  bits: f64,
  mv: Vector2d, // 1/16-pel
}

/// Probe one full-pel position; keeps `best` when it improves. Positions
/// violating the MV constraints are skipped without cost.
fn check_mv_cost(info: &InterSearchInfo, x: i32, y: i32, best: &mut BestMv) -> bool {
  if !intmv_within_tile(info, x, y) {
    return false;
  }

  let mut cost = strategies::sad_clamped(
    info.pic.y(),
    info.origin.x as usize,
    info.origin.y as usize,
    info.ref_pic.y(),
    info.origin.x + x,
    info.origin.y + y,
    info.width as usize,
    info.height as usize,
  ) as f64;

  if cost >= best.cost {
    return false;
  }

  let mut bitcost = 0.0;
  cost += calc_mvd_cost(info, x, y, INTERNAL_MV_PREC, &mut bitcost);

  if cost >= best.cost {
    return false;
  }

  best.mv.x = x << INTERNAL_MV_PREC;
  best.mv.y = y << INTERNAL_MV_PREC;
  best.cost = cost;
  best.bits = bitcost;
  true
}

fn mv_in_merge(info: &InterSearchInfo, mv: Vector2d) -> bool {
  info.merge_cand.iter().any(|cand| {
    if cand.dir == 3 {
      return false;
    }
    let list = (cand.dir - 1) as usize;
    cand.mv[list][0] == mv.x << INTERNAL_MV_PREC && cand.mv[list][1] == mv.y << INTERNAL_MV_PREC
  })
}

/// Seed the integer search: the zero vector, the extra vector carried
/// over from the co-located CU of the previous frame, any block-copy
/// hash hits, and the rounded merge candidates.
fn select_starting_point(info: &InterSearchInfo, extra_mv: Vector2d, best: &mut BestMv) {
  // The zero vector gets checked first so every 0-merge-candidate below
  // can be skipped.
  check_mv_cost(info, 0, 0, best);

  let extra = Vector2d {
    x: extra_mv.x >> INTERNAL_MV_PREC,
    y: extra_mv.y >> INTERNAL_MV_PREC,
  };
  if (extra.x != 0 || extra.y != 0) && !mv_in_merge(info, extra) {
    check_mv_cost(info, extra.x, extra.y, best);
  }

  if info.ibc_search && (info.cfg.ibc & 2) != 0 {
    if let Some(maps) = info.ibc_maps {
      let origin_x = info.origin.x as usize;
      let origin_y = info.origin.y as usize;
      let grid_x = origin_x / HASH_BLOCK_SIZE;
      let grid_y = origin_y / HASH_BLOCK_SIZE;
      let own_location = ibc::pack_pos(origin_x, origin_y);
      let lcu_row = origin_y / LCU_WIDTH;

      let crc = maps.pos_hash(grid_x, grid_y);
      for &hit in maps.lookup(lcu_row, crc) {
        if hit == own_location {
          continue;
        }
        let (pos_x, pos_y) = ibc::unpack_pos(hit);

        // Only copy from samples that are already reconstructed: blocks
        // fully above, or fully to the left within this CTU row.
        let causal = pos_y + info.height as usize <= origin_y
          || pos_x + info.width as usize <= origin_x;
        if !causal {
          continue;
        }

        // Accept the candidate only if the whole block matches hash by
        // hash, not just its first 8x8.
        let bw = info.width as usize / HASH_BLOCK_SIZE;
        let bh = info.height as usize / HASH_BLOCK_SIZE;
        let hit_gx = pos_x / HASH_BLOCK_SIZE;
        let hit_gy = pos_y / HASH_BLOCK_SIZE;
        let mut full_block = true;
        'outer: for by in 0..bh.max(1) {
          for bx in 0..bw.max(1) {
            if maps.pos_hash(hit_gx + bx, hit_gy + by)
              != maps.pos_hash(grid_x + bx, grid_y + by)
            {
              full_block = false;
              break 'outer;
            }
          }
        }
        if full_block {
          check_mv_cost(info, pos_x as i32 - origin_x as i32, pos_y as i32 - origin_y as i32, best);
        }
      }
    }
  }

  for cand in &info.merge_cand {
    if cand.dir == 3 {
      continue;
    }
    let list = (cand.dir - 1) as usize;
    let round = 1 << (INTERNAL_MV_PREC - 1);
    let x = (cand.mv[list][0] + round) >> INTERNAL_MV_PREC;
    let y = (cand.mv[list][1] + round) >> INTERNAL_MV_PREC;
    if x == 0 && y == 0 {
      continue;
    }
    check_mv_cost(info, x, y, best);
  }
}

/// Probe two rounds of small crosses around the current best. Returns
/// true when neither round improved enough, which ends the search early.
fn early_terminate(info: &InterSearchInfo, best: &mut BestMv) -> bool {
  static SMALL_HEXBS: [Vector2d; 7] = [
    Vector2d { x: 0, y: -1 }, Vector2d { x: -1, y: 0 },
    Vector2d { x: 0, y: 1 }, Vector2d { x: 1, y: 0 },
    Vector2d { x: 0, y: -1 }, Vector2d { x: -1, y: 0 },
    Vector2d { x: 0, y: 0 },
  ];

  let mut mv = Vector2d {
    x: best.mv.x >> INTERNAL_MV_PREC,
    y: best.mv.y >> INTERNAL_MV_PREC,
  };

  let mut first_index = 0;
  let mut last_index = 3;

  for _ in 0..2 {
    let threshold = if info.cfg.me_early_termination == EarlyTermination::Sensitive {
      best.cost * 0.95
    } else {
      best.cost
    };

    let mut best_index = 6;
    for i in first_index..=last_index {
      if check_mv_cost(info, mv.x + SMALL_HEXBS[i].x, mv.y + SMALL_HEXBS[i].y, best) {
        best_index = i;
      }
    }

    mv.x += SMALL_HEXBS[best_index].x;
    mv.y += SMALL_HEXBS[best_index].y;

    if best.cost >= threshold {
      return true;
    }

    first_index = (best_index + 3) % 4;
    last_index = first_index + 2;
  }
  false
}

/// Iterative hexagon-pattern search: a large hexagon walks towards the
/// minimum, then a small cross polishes the final position.
fn hexagon_search(info: &InterSearchInfo, mut steps: u32, best: &mut BestMv) {
  // The start of the pattern is repeated at the end so that indices 1-6
  // can open a 3-point wedge of new points.
  //   6--1,7
  //  /     \
  // 5   0  2,8
  //  \     /
  //   4---3
  static LARGE_HEXBS: [Vector2d; 9] = [
    Vector2d { x: 0, y: 0 },
    Vector2d { x: 1, y: -2 }, Vector2d { x: 2, y: 0 }, Vector2d { x: 1, y: 2 },
    Vector2d { x: -1, y: 2 }, Vector2d { x: -2, y: 0 }, Vector2d { x: -1, y: -2 },
    Vector2d { x: 1, y: -2 }, Vector2d { x: 2, y: 0 },
  ];
  static SMALL_HEXBS: [Vector2d; 9] = [
    Vector2d { x: 0, y: 0 },
    Vector2d { x: 0, y: -1 }, Vector2d { x: -1, y: 0 }, Vector2d { x: 1, y: 0 },
    Vector2d { x: 0, y: 1 }, Vector2d { x: -1, y: -1 }, Vector2d { x: 1, y: -1 },
    Vector2d { x: -1, y: 1 }, Vector2d { x: 1, y: 1 },
  ];

  let mut mv = Vector2d {
    x: best.mv.x >> INTERNAL_MV_PREC,
    y: best.mv.y >> INTERNAL_MV_PREC,
  };

  let mut best_index = 0usize;
  for i in 1..7 {
    if check_mv_cost(info, mv.x + LARGE_HEXBS[i].x, mv.y + LARGE_HEXBS[i].y, best) {
      best_index = i;
    }
  }

  while best_index != 0 && steps != 0 {
    steps -= 1;

    let start = if best_index == 1 {
      6
    } else if best_index == 8 {
      1
    } else {
      best_index - 1
    };

    mv.x += LARGE_HEXBS[best_index].x;
    mv.y += LARGE_HEXBS[best_index].y;
    best_index = 0;

    for i in 0..3 {
      let offset = LARGE_HEXBS[start + i];
      if check_mv_cost(info, mv.x + offset.x, mv.y + offset.y, best) {
        best_index = start + i;
      }
    }
  }

  for i in 1..9 {
    check_mv_cost(info, mv.x + SMALL_HEXBS[i].x, mv.y + SMALL_HEXBS[i].y, best);
  }
}

/// Iterative diamond search; the direction we came from is not
/// re-checked on the next round.
fn diamond_search(info: &InterSearchInfo, mut steps: u32, best: &mut BestMv) {
  const DIA_CENTER: usize = 4;
  static DIAMOND: [Vector2d; 5] = [
    Vector2d { x: 0, y: -1 }, Vector2d { x: 1, y: 0 },
    Vector2d { x: 0, y: 1 }, Vector2d { x: -1, y: 0 },
    Vector2d { x: 0, y: 0 },
  ];

  let mut mv = Vector2d {
    x: best.mv.x >> INTERNAL_MV_PREC,
    y: best.mv.y >> INTERNAL_MV_PREC,
  };

  let mut best_index = DIA_CENTER;
  for i in 0..5 {
    if check_mv_cost(info, mv.x + DIAMOND[i].x, mv.y + DIAMOND[i].y, best) {
      best_index = i;
    }
  }

  if best_index == DIA_CENTER {
    return;
  }
  mv.x += DIAMOND[best_index].x;
  mv.y += DIAMOND[best_index].y;

  let mut from_dir = DIA_CENTER;
  loop {
    let mut better_found = false;
    if steps > 0 {
      steps -= 1;
    }

    for i in 0..4 {
      if i == from_dir {
        continue;
      }
      if check_mv_cost(info, mv.x + DIAMOND[i].x, mv.y + DIAMOND[i].y, best) {
        best_index = i;
        better_found = true;
      }
    }

    if better_found {
      mv.x += DIAMOND[best_index].x;
      mv.y += DIAMOND[best_index].y;
      // flip the orientation to get the arrival direction
      from_dir = best_index ^ 0x3;
    }

    if !better_found || steps == 0 {
      break;
    }
  }
}

fn tz_pattern_search(
  info: &InterSearchInfo,
  pattern_type: usize,
  i_dist: i32,
  mv: Vector2d,
  best_dist: &mut i32,
  best: &mut BestMv,
) {
  assert!(pattern_type < 4);

  // 0: diamond, 1: square, 2: octagon, 3: hexagon
  let pattern: [[Vector2d; 8]; 4] = [
    [
      Vector2d { x: 0, y: i_dist }, Vector2d { x: i_dist, y: 0 },
      Vector2d { x: 0, y: -i_dist }, Vector2d { x: -i_dist, y: 0 },
      Vector2d { x: i_dist / 2, y: i_dist / 2 }, Vector2d { x: i_dist / 2, y: -i_dist / 2 },
      Vector2d { x: -i_dist / 2, y: -i_dist / 2 }, Vector2d { x: -i_dist / 2, y: i_dist / 2 },
    ],
    [
      Vector2d { x: 0, y: i_dist }, Vector2d { x: i_dist, y: i_dist },
      Vector2d { x: i_dist, y: 0 }, Vector2d { x: i_dist, y: -i_dist },
      Vector2d { x: 0, y: -i_dist }, Vector2d { x: -i_dist, y: -i_dist },
      Vector2d { x: -i_dist, y: 0 }, Vector2d { x: -i_dist, y: i_dist },
    ],
    [
      Vector2d { x: i_dist / 2, y: i_dist }, Vector2d { x: i_dist, y: i_dist / 2 },
      Vector2d { x: i_dist / 2, y: -i_dist }, Vector2d { x: -i_dist, y: i_dist / 2 },
      Vector2d { x: -i_dist / 2, y: i_dist }, Vector2d { x: i_dist, y: -i_dist / 2 },
      Vector2d { x: -i_dist / 2, y: -i_dist }, Vector2d { x: -i_dist, y: -i_dist / 2 },
    ],
    [
      Vector2d { x: i_dist / 2, y: i_dist }, Vector2d { x: i_dist, y: 0 },
      Vector2d { x: i_dist / 2, y: -i_dist }, Vector2d { x: -i_dist, y: 0 },
      Vector2d { x: i_dist / 2, y: i_dist }, Vector2d { x: -i_dist / 2, y: -i_dist },
      Vector2d { x: 0, y: 0 }, Vector2d { x: 0, y: 0 },
    ],
  ];

  let n_points = if i_dist == 1 {
    match pattern_type {
      0 | 2 | 3 => 4,
      _ => 8,
    }
  } else {
    match pattern_type {
      3 => 6,
      _ => 8,
    }
  };

  let mut improved = false;
  for i in 0..n_points {
    let offset = pattern[pattern_type][i];
    if check_mv_cost(info, mv.x + offset.x, mv.y + offset.y, best) {
      improved = true;
    }
  }
  if improved {
    *best_dist = i_dist;
  }
}

fn tz_search(info: &InterSearchInfo, best: &mut BestMv) {
  const SEARCH_RANGE: i32 = 96;
  const STEP2_TYPE: usize = 0;
  const STEP4_TYPE: usize = 0;
  const USE_STAR_REFINEMENT: bool = true;

  let mut best_dist = 0;
  let mut start = Vector2d {
    x: best.mv.x >> INTERNAL_MV_PREC,
    y: best.mv.y >> INTERNAL_MV_PREC,
  };

  // step 2: expanding grid around the start
  let mut rounds_without_improvement = 0;
  let mut i_dist = 1;
  while i_dist <= SEARCH_RANGE {
    tz_pattern_search(info, STEP2_TYPE, i_dist, start, &mut best_dist, best);
    if best_dist != i_dist {
      rounds_without_improvement += 1;
    }
    if rounds_without_improvement >= 3 {
      break;
    }
    i_dist *= 2;
  }

  if start.x != 0 || start.y != 0 {
    // repeat from the zero vector
    start = Vector2d { x: 0, y: 0 };
    rounds_without_improvement = 0;
    let mut i_dist = 1;
    while i_dist <= SEARCH_RANGE / 2 {
      tz_pattern_search(info, STEP2_TYPE, i_dist, start, &mut best_dist, best);
      if best_dist != i_dist {
        rounds_without_improvement += 1;
      }
      if rounds_without_improvement >= 3 {
        break;
      }
      i_dist *= 2;
    }
  }

  // star refinement: restart step 2 from the best point until stable
  while USE_STAR_REFINEMENT && best_dist > 0 {
    best_dist = 0;
    let start = Vector2d {
      x: best.mv.x >> INTERNAL_MV_PREC,
      y: best.mv.y >> INTERNAL_MV_PREC,
    };
    let mut i_dist = 1;
    while i_dist <= SEARCH_RANGE {
      tz_pattern_search(info, STEP4_TYPE, i_dist, start, &mut best_dist, best);
      i_dist *= 2;
    }
  }
}

fn search_mv_full(info: &InterSearchInfo, search_range: i32, extra_mv: Vector2d, best: &mut BestMv) {
  for y in -search_range..=search_range {
    for x in -search_range..=search_range {
      check_mv_cost(info, x, y, best);
    }
  }

  let extra = Vector2d {
    x: extra_mv.x >> INTERNAL_MV_PREC,
    y: extra_mv.y >> INTERNAL_MV_PREC,
  };
  if !mv_in_merge(info, extra) {
    for y in -search_range..=search_range {
      for x in -search_range..=search_range {
        check_mv_cost(info, extra.x + x, extra.y + y, best);
      }
    }
  }

  for (i, cand) in info.merge_cand.iter().enumerate() {
    if cand.dir == 3 {
      continue;
    }
    let list = (cand.dir - 1) as usize;
    let mv = Vector2d {
      x: cand.mv[list][0] >> INTERNAL_MV_PREC,
      y: cand.mv[list][1] >> INTERNAL_MV_PREC,
    };
    if mv.x == 0 && mv.y == 0 {
      continue;
    }

    for y in mv.y - search_range..=mv.y + search_range {
      'col: for x in mv.x - search_range..=mv.x + search_range {
        if !intmv_within_tile(info, x, y) {
          continue;
        }
        // Skip points covered by an earlier candidate's window (the
        // zero-centered windows count as candidate -1).
        for j in 0..i {
          let c = &info.merge_cand[j];
          let (xx, yy) = if c.dir == 3 {
            continue;
          } else {
            let l = (c.dir - 1) as usize;
            (c.mv[l][0] >> INTERNAL_MV_PREC, c.mv[l][1] >> INTERNAL_MV_PREC)
          };
          if x >= xx - search_range && x <= xx + search_range
            && y >= yy - search_range && y <= yy + search_range
          {
            continue 'col;
          }
        }
        if x.abs() <= search_range && y.abs() <= search_range {
          continue; // zero window already scanned
        }
        check_mv_cost(info, x, y, best);
      }
    }
  }
}

// ----- Fractional search --------------------------------------------------

fn frac_mc_satd(info: &InterSearchInfo, mv_qpel: Vector2d) -> u64 {
  let w = info.width as usize;
  let h = info.height as usize;
  let max_pixel = (1 << info.cfg.bitdepth) - 1;
  let mut pred = vec![0 as Pixel; w * h];

  for y in 0..h {
    for x in 0..w {
      let qx = ((info.origin.x + x as i32) << 2) + mv_qpel.x;
      let qy = ((info.origin.y + y as i32) << 2) + mv_qpel.y;
      pred[y * w + x] = strategies::sample_luma_qpel(info.ref_pic.y(), qx, qy, max_pixel);
    }
  }

  let src = info.pic.y();
  let src_off = info.origin.y as usize * src.stride + info.origin.x as usize;
  strategies::satd_any_size(w, h, &src.data[src_off..], src.stride, &pred, w)
}

/// Half-pel then quarter-pel refinement on a nine-point square around the
/// best integer position. SATD replaces SAD here. `fme_level` selects how
/// many of the four refinement passes run.
fn search_frac(info: &InterSearchInfo, best: &mut BestMv) {
  // 5 3 6
  // 1 0 2
  // 7 4 8
  static SQUARE: [Vector2d; 9] = [
    Vector2d { x: 0, y: 0 }, Vector2d { x: -1, y: 0 }, Vector2d { x: 1, y: 0 },
    Vector2d { x: 0, y: -1 }, Vector2d { x: 0, y: 1 }, Vector2d { x: -1, y: -1 },
    Vector2d { x: 1, y: -1 }, Vector2d { x: -1, y: 1 }, Vector2d { x: 1, y: 1 },
  ];

  let fme_level = info.cfg.fme_level as i32;

  // Full-pel position in quarter-pel units
  let mut mv = Vector2d {
    x: best.mv.x >> INTERNAL_MV_PREC,
    y: best.mv.y >> INTERNAL_MV_PREC,
  };

  let mut bitcost = 0.0;
  let mut cost = frac_mc_satd(info, Vector2d { x: mv.x << 2, y: mv.y << 2 }) as f64;
  cost += calc_mvd_cost(info, mv.x, mv.y, INTERNAL_MV_PREC, &mut bitcost);
  let mut best_bits = bitcost;

  // Half-pel precision
  mv.x *= 2;
  mv.y *= 2;

  let mut best_index = 0usize;
  let mut i = 1usize;
  for step in 0..fme_level {
    let mv_shift = if step < 2 { INTERNAL_MV_PREC - 1 } else { INTERNAL_MV_PREC - 2 };
    // In quarter-pel units one unit of `mv` is worth this much:
    let qpel_scale = 1 << (mv_shift - (INTERNAL_MV_PREC - 2));

    for j in 0..4 {
      let p = SQUARE[i + j];
      let cand = Vector2d { x: mv.x + p.x, y: mv.y + p.y };
      if !fracmv_within_tile(info, cand.x << mv_shift, cand.y << mv_shift) {
        continue;
      }
      let mut bits = 0.0;
      let mut c = frac_mc_satd(info, Vector2d { x: cand.x * qpel_scale, y: cand.y * qpel_scale }) as f64;
      c += calc_mvd_cost(info, cand.x, cand.y, mv_shift, &mut bits);
      if c < cost {
        cost = c;
        best_bits = bits;
        best_index = i + j;
      }
    }
    i += 4;

    if step == 1 || step == fme_level - 1 {
      mv.x += SQUARE[best_index].x;
      mv.y += SQUARE[best_index].y;

      if step == (fme_level - 1).min(1) && step < fme_level - 1 {
        // Continue at quarter-pel precision
        mv.x *= 2;
        mv.y *= 2;
        best_index = 0;
        i = 1;
      }
    }
  }

  // Back to internal precision
  let final_shift = if fme_level <= 2 { INTERNAL_MV_PREC - 1 } else { INTERNAL_MV_PREC - 2 };
  best.mv.x = mv.x << final_shift;
  best.mv.y = mv.y << final_shift;
  best.cost = cost;
  best.bits = best_bits;
}

// ----- MV scaling ---------------------------------------------------------

fn get_scaled_mv(mv: i32, scale: i32) -> i32 {
  let scaled = scale * mv;
  clip(-131072, 131071, (scaled + 127 + (scaled < 0) as i32) >> 8)
}

/// Scale a neighbor's MV by the ratio of POC distances.
pub fn apply_mv_scaling(
  current_poc: i32,
  current_ref_poc: i32,
  neighbor_poc: i32,
  neighbor_ref_poc: i32,
  mv: &mut Vector2d,
) {
  let diff_current = current_poc - current_ref_poc;
  let diff_neighbor = neighbor_poc - neighbor_ref_poc;

  if diff_current == diff_neighbor || diff_neighbor == 0 {
    return;
  }

  let diff_current = clip(-128, 127, diff_current);
  let diff_neighbor = clip(-128, 127, diff_neighbor);

  let scale = clip(
    -4096,
    4095,
    (diff_current * ((0x4000 + (diff_neighbor.abs() >> 1)) / diff_neighbor) + 32) >> 6,
  );

  mv.x = get_scaled_mv(mv.x, scale);
  mv.y = get_scaled_mv(mv.y, scale);
}

// ----- Candidate assembly -------------------------------------------------

fn spatial_neighbor_positions(x: i32, y: i32, w: i32, h: i32) -> [(i32, i32); 5] {
  [
    (x - 1, y + h - 1), // A1
    (x + w - 1, y - 1), // B1
    (x + w, y - 1),     // B0
    (x - 1, y + h),     // A0
    (x - 1, y - 1),     // B2
  ]
}

// Interleave the low bits of block coordinates into a z-order index.
fn z_index(x: usize, y: usize) -> u32 {
  let mut z = 0u32;
  for bit in 0..8 {
    z |= (((x >> bit) & 1) as u32) << (2 * bit);
    z |= (((y >> bit) & 1) as u32) << (2 * bit + 1);
  }
  z
}

/// Whether the 4x4 unit at (nx, ny) is coded before the CU at (x, y).
/// Candidate derivation must see exactly the neighbors a decoder would
/// have, both during search and when the syntax is emitted later; a
/// grid cell being filled in is not enough.
pub fn neighbor_available(x: i32, y: i32, nx: i32, ny: i32) -> bool {
  if nx < 0 || ny < 0 {
    return false;
  }
  let lcu = LCU_WIDTH as i32;
  let (cur_row, cur_col) = (y / lcu, x / lcu);
  let (n_row, n_col) = (ny / lcu, nx / lcu);
  if n_row != cur_row {
    return n_row < cur_row;
  }
  if n_col != cur_col {
    return n_col < cur_col;
  }
  // Same CTU: compare z-order of the containing quadtree blocks
  let local = |v: i32| ((v % lcu) / 4) as usize;
  z_index(local(nx), local(ny)) < z_index(local(x), local(y))
}

/// Merge candidate list: spatial neighbors, the temporal co-located
/// candidate, history entries, then zero vectors up to the cap.
pub fn get_merge_cand(
  params: &FrameParams,
  cu_array: &crate::cu::CuArray,
  hmvp: &[CuInfo],
  x: i32,
  y: i32,
  width: i32,
  height: i32,
) -> Vec<MergeCand> {
  let mut cands: Vec<MergeCand> = Vec::new();

  let mut push_unique = |cand: MergeCand, cands: &mut Vec<MergeCand>| {
    if cand.dir == 0 || cands.len() >= MRG_MAX_NUM_CANDS {
      return;
    }
    if !cands.contains(&cand) {
      cands.push(cand);
    }
  };

  let cand_from_cu = |cu: &CuInfo| MergeCand {
    mv: cu.mv,
    dir: cu.mv_dir,
    ref_idx: cu.mv_ref,
  };

  for (nx, ny) in spatial_neighbor_positions(x, y, width, height) {
    if nx < 0 || ny < 0 || nx as usize >= cu_array.width || ny as usize >= cu_array.height {
      continue;
    }
    if !neighbor_available(x, y, nx, ny) {
      continue;
    }
    let cu = cu_array.at(nx as usize, ny as usize);
    if cu.cu_type == CU_INTER {
      push_unique(cand_from_cu(cu), &mut cands);
    }
  }

  // Temporal candidate from the nearest L0 reference, scaled to this
  // picture's first reference distance.
  if cands.len() < MRG_MAX_NUM_CANDS && !params.ref_lx[0].is_empty() {
    let ref_idx = params.ref_lx[0][0] as usize;
    let entry = params.refs.entry(ref_idx);
    let col_cu = {
      let col = entry.cu.lock().unwrap();
      let cx = ((x + width / 2) as usize).min(col.width - 1);
      let cy = ((y + height / 2) as usize).min(col.height - 1);
      *col.at(cx, cy)
    };
    if col_cu.cu_type == CU_INTER {
      let col_list = if col_cu.mv_dir & 1 != 0 { 0 } else { 1 };
      let mut mv = Vector2d { x: col_cu.mv[col_list][0], y: col_cu.mv[col_list][1] };
      let neighbor_ref_poc = entry
        .ref_pocs
        .get(col_cu.mv_ref[col_list] as usize)
        .copied()
        .unwrap_or(entry.poc);
      apply_mv_scaling(params.poc, entry.poc, entry.poc, neighbor_ref_poc, &mut mv);
      push_unique(
        MergeCand { mv: [[mv.x, mv.y], [0, 0]], dir: 1, ref_idx: [0, 0] },
        &mut cands,
      );
    }
  }

  for cu in hmvp {
    if cands.len() >= MRG_MAX_NUM_CANDS {
      break;
    }
    if cu.cu_type == CU_INTER {
      push_unique(cand_from_cu(cu), &mut cands);
    }
  }

  // Pad with zero vectors over increasing reference indices
  let mut zero_ref = 0u8;
  while cands.len() < MRG_MAX_NUM_CANDS {
    let dir = if params.slicetype == SliceType::B && !params.ref_lx[1].is_empty() { 3 } else { 1 };
    let cand = MergeCand {
      mv: [[0, 0], [0, 0]],
      dir: dir,
      ref_idx: [
        zero_ref.min(params.ref_lx[0].len().saturating_sub(1) as u8),
        zero_ref.min(params.ref_lx[1].len().saturating_sub(1) as u8),
      ],
    };
    if cands.contains(&cand) {
      break;
    }
    cands.push(cand);
    zero_ref += 1;
  }

  cands
}

/// The two AMVP candidates for one list: left neighbor, then above
/// neighbor, padded with zero.
pub fn get_amvp_cand(
  cu_array: &crate::cu::CuArray,
  x: i32,
  y: i32,
  width: i32,
  height: i32,
  ref_list: usize,
) -> [[i32; 2]; 2] {
  let mut cand = [[0i32; 2]; 2];
  let mut found = 0usize;

  for (nx, ny) in spatial_neighbor_positions(x, y, width, height) {
    if found >= AMVP_MAX_NUM_CANDS {
      break;
    }
    if nx < 0 || ny < 0 || nx as usize >= cu_array.width || ny as usize >= cu_array.height {
      continue;
    }
    if !neighbor_available(x, y, nx, ny) {
      continue;
    }
    let cu = cu_array.at(nx as usize, ny as usize);
    if cu.cu_type == CU_INTER && (cu.mv_dir & (1 << ref_list)) != 0 {
      let mv = [cu.mv[ref_list][0], cu.mv[ref_list][1]];
      if found == 0 || cand[0] != mv {
        cand[found] = mv;
        found += 1;
      }
    }
  }

  cand
}

// ----- Motion compensation ------------------------------------------------

/// Predict a luma block from `reference` with an internal-precision MV.
pub fn mc_luma(
  reference: &Picture,
  origin: Vector2d,
  width: usize,
  height: usize,
  mv: Vector2d,
  bitdepth: u32,
  dst: &mut [Pixel],
  dst_stride: usize,
) {
  let max_pixel = (1 << bitdepth) - 1;
  for y in 0..height {
    for x in 0..width {
      let qx = ((origin.x + x as i32) << 2) + (mv.x >> 2);
      let qy = ((origin.y + y as i32) << 2) + (mv.y >> 2);
      dst[y * dst_stride + x] = strategies::sample_luma_qpel(reference.y(), qx, qy, max_pixel);
    }
  }
}

/// Predict both chroma blocks.
pub fn mc_chroma(
  reference: &Picture,
  origin: Vector2d, // luma coordinates
  width: usize,     // luma size
  height: usize,
  mv: Vector2d,
  bitdepth: u32,
  dst_u: &mut [Pixel],
  dst_v: &mut [Pixel],
  dst_stride: usize,
) {
  let max_pixel = (1 << bitdepth) - 1;
  let sx = reference.chroma_scale_x;
  let sy = reference.chroma_scale_y;
  let cw = width >> sx;
  let ch = height >> sy;
  let cx0 = origin.x >> sx;
  let cy0 = origin.y >> sy;

  for y in 0..ch {
    for x in 0..cw {
      // A 1/16-pel luma vector addresses chroma at 1/8-pel resolution in
      // the subsampled grid, which is what the bilinear kernel runs at.
      let qx = ((cx0 + x as i32) << 3) + (mv.x >> 1);
      let qy = ((cy0 + y as i32) << 3) + (mv.y >> 1);
      dst_u[y * dst_stride + x] = strategies::sample_chroma_epel(reference.u(), qx, qy, max_pixel);
      dst_v[y * dst_stride + x] = strategies::sample_chroma_epel(reference.v(), qx, qy, max_pixel);
    }
  }
}

/// Average two prediction blocks into `dst`.
pub fn bipred_average(a: &[Pixel], b: &[Pixel], dst: &mut [Pixel]) {
  for i in 0..dst.len() {
    dst[i] = ((a[i] as u32 + b[i] as u32 + 1) >> 1) as Pixel;
  }
}

// ----- Per-reference search ----------------------------------------------

/// Search one reference picture for the current PU and record the best
/// unipred entries in the L0/L1 AMVP maps.
fn search_pu_inter_ref(
  info: &mut InterSearchInfo,
  cur_cu: &CuInfo,
  amvp: &mut [UnitStatsMap; 3],
  extra_mv: Vector2d,
) {
  let cfg = info.cfg;

  // The reference picture can sit in either or both lists
  let mut ref_list_active = [false, false];
  let mut ref_list_idx = [0usize, 0usize];
  for list in 0..2 {
    if let Some(pos) = info.params.ref_lx[list].iter().position(|&i| i as usize == info.ref_idx) {
      ref_list_active[list] = true;
      ref_list_idx[list] = pos;
    }
  }
  if !ref_list_active[0] && !ref_list_active[1] {
    return;
  }
  let first_list = if ref_list_active[0] { 0 } else { 1 };

  let mut best = BestMv { cost: MAX_COST, bits: f64::MAX, mv: Vector2d::default() };
  let mut start_mv = Vector2d { x: 0, y: 0 };
  if fracmv_within_tile(info, extra_mv.x, extra_mv.y) {
    start_mv = extra_mv;
  }
  best.mv = start_mv;

  let search_range = match cfg.ime_algorithm {
    ImeAlgorithm::Full64 => 64,
    ImeAlgorithm::Full16 => 16,
    ImeAlgorithm::Full8 => 8,
    _ => 32,
  };

  select_starting_point(info, start_mv, &mut best);
  let skip_me = early_terminate(info, &mut best);

  if !(cfg.me_early_termination != EarlyTermination::Off && skip_me) {
    match cfg.ime_algorithm {
      ImeAlgorithm::Tz => tz_search(info, &mut best),
      ImeAlgorithm::Full8 | ImeAlgorithm::Full16 | ImeAlgorithm::Full32 | ImeAlgorithm::Full64 => {
        search_mv_full(info, search_range, start_mv, &mut best)
      }
      ImeAlgorithm::Diamond => diamond_search(info, cfg.me_max_steps, &mut best),
      ImeAlgorithm::Hexagon => hexagon_search(info, cfg.me_max_steps, &mut best),
    }
  }

  if best.cost >= MAX_COST {
    return;
  }

  if cfg.fme_level == 0 {
    // Re-score the integer winner with SATD so it compares fairly
    // against intra costs later.
    let satd = frac_mc_satd(info, Vector2d {
      x: best.mv.x >> (INTERNAL_MV_PREC - 2),
      y: best.mv.y >> (INTERNAL_MV_PREC - 2),
    });
    best.cost = satd as f64 + best.bits * info.params.lambda_sqrt;
  }

  for list in first_list..2 {
    if !ref_list_active[list] {
      continue;
    }
    let lx_idx = ref_list_idx[list];
    let mv_ref_coded = lx_idx as f64;
    let cu_mv_cand =
      select_mv_cand(cfg, info.search_cabac, info.mv_cand, best.mv.x, best.mv.y, None);
    let extra_bits = list as f64 + mv_ref_coded;
    let cost = best.cost + extra_bits * info.params.lambda_sqrt;
    let bits = best.bits + extra_bits;

    if !fracmv_within_tile(info, best.mv.x, best.mv.y) {
      continue;
    }

    let map = &mut amvp[list];
    if map.size >= MAX_UNIT_STATS_MAP_SIZE {
      continue;
    }
    let entry = map.size;
    let unipred_pu = &mut map.unit[entry];
    *unipred_pu = *cur_cu;
    unipred_pu.cu_type = CU_INTER;
    unipred_pu.merged = 0;
    unipred_pu.skipped = 0;
    unipred_pu.mv_dir = (list + 1) as u8;
    unipred_pu.mv_ref[list] = lx_idx as u8;
    unipred_pu.mv[list][0] = best.mv.x;
    unipred_pu.mv[list][1] = best.mv.y;
    unipred_pu.mv_cand[list] = cu_mv_cand as u8;

    map.cost[entry] = cost;
    map.bits[entry] = bits;
    map.keys[entry] = entry;
    map.size += 1;
  }
}

// Candidate pair orderings for bipred merge scoring
static PRIORITY_LIST0: [usize; 12] = [0, 1, 0, 2, 1, 2, 0, 3, 1, 3, 2, 3];
static PRIORITY_LIST1: [usize; 12] = [1, 0, 2, 0, 2, 1, 3, 0, 3, 1, 3, 2];

/// Score up to twelve (L0, L1) merge-candidate pairs by actually running
/// the bi-prediction interpolation and measuring SATD.
fn search_pu_inter_bipred(info: &mut InterSearchInfo, amvp_bipred: &mut UnitStatsMap) {
  let num_cand = info.merge_cand.len();
  let num_cand_pairs = (num_cand * num_cand.saturating_sub(1)).min(12);
  let w = info.width as usize;
  let h = info.height as usize;

  for idx in 0..num_cand_pairs {
    let i = PRIORITY_LIST0[idx];
    let j = PRIORITY_LIST1[idx];
    if i >= num_cand || j >= num_cand {
      break;
    }
    let (ci, cj) = (info.merge_cand[i], info.merge_cand[j]);
    if ci.dir & 0x1 == 0 || cj.dir & 0x2 == 0 {
      continue;
    }

    let l0_ref = info.params.ref_lx[0].get(ci.ref_idx[0] as usize).copied();
    let l1_ref = info.params.ref_lx[1].get(cj.ref_idx[1] as usize).copied();
    let (Some(l0_ref), Some(l1_ref)) = (l0_ref, l1_ref) else { continue };

    if l0_ref == l1_ref && ci.mv[0] == cj.mv[1] {
      continue;
    }

    let mv = [ci.mv[0], cj.mv[1]];
    if !fracmv_within_tile(info, mv[0][0], mv[0][1])
      || !fracmv_within_tile(info, mv[1][0], mv[1][1])
    {
      continue;
    }

    // Bi-prediction interpolation and SATD scoring
    let mut pred0 = vec![0 as Pixel; w * h];
    let mut pred1 = vec![0 as Pixel; w * h];
    let mut pred = vec![0 as Pixel; w * h];
    {
      let ref0 = info.params.refs.entry(l0_ref as usize).recon.clone();
      let ref0 = ref0.lock().unwrap();
      mc_luma(&ref0, info.origin, w, h, Vector2d { x: mv[0][0], y: mv[0][1] },
              info.cfg.bitdepth, &mut pred0, w);
    }
    {
      let ref1 = info.params.refs.entry(l1_ref as usize).recon.clone();
      let ref1 = ref1.lock().unwrap();
      mc_luma(&ref1, info.origin, w, h, Vector2d { x: mv[1][0], y: mv[1][1] },
              info.cfg.bitdepth, &mut pred1, w);
    }
    bipred_average(&pred0, &pred1, &mut pred);

    let src = info.pic.y();
    let src_off = info.origin.y as usize * src.stride + info.origin.x as usize;
    let mut cost =
      strategies::satd_any_size(w, h, &pred, w, &src.data[src_off..], src.stride) as f64;

    let mut bitcost = [0.0, 0.0];
    cost += calc_mvd_cost(info, ci.mv[0][0], ci.mv[0][1], 0, &mut bitcost[0]);
    cost += calc_mvd_cost(info, cj.mv[1][0], cj.mv[1][1], 0, &mut bitcost[1]);
    let extra_bits = (ci.ref_idx[0] + cj.ref_idx[1] + 2) as f64;
    cost += info.params.lambda_sqrt * extra_bits;

    let map = &mut *amvp_bipred;
    if map.size >= MAX_UNIT_STATS_MAP_SIZE {
      break;
    }
    let entry = map.size;
    let pu = &mut map.unit[entry];
    *pu = CuInfo { cu_type: CU_INTER, mv_dir: 3, ..bytemuck::Zeroable::zeroed() };
    pu.mv = mv;
    pu.mv_ref = [ci.ref_idx[0], cj.ref_idx[1]];
    for list in 0..2 {
      pu.mv_cand[list] = select_mv_cand(
        info.cfg, info.search_cabac, info.mv_cand, pu.mv[list][0], pu.mv[list][1], None,
      ) as u8;
    }
    map.cost[entry] = cost;
    map.bits[entry] = bitcost[0] + bitcost[1] + extra_bits;
    map.keys[entry] = entry;
    map.size += 1;
  }
}

/// Outcome of the PU search handed back to the mode decision.
pub struct InterSearchResult {
  pub cu: CuInfo,
  pub cost: f64,
  pub bits: f64,
}

/// Full merge + AMVP + bipred search for one PU. The TMVP-seeded extra
/// MV comes from the co-located CU of each reference frame.
pub fn search_cu_inter(
  info: &mut InterSearchInfo,
  cur_cu: &CuInfo,
) -> Option<InterSearchResult> {
  let cfg = info.cfg;
  let w = info.width as usize;
  let h = info.height as usize;

  // Merge analysis: validate each candidate against the MV constraints,
  // drop duplicates, score the survivors with SATD.
  let mut merge = UnitStatsMap::default();
  let merge_flag_cost = info.search_cabac.ctx_bits(crate::context::CTX_MERGE_FLAG, 1);

  let candidates = info.merge_cand.clone();
  for (merge_idx, cand) in candidates.iter().enumerate() {
    if cand.dir == 3 && !cfg.bipred {
      continue;
    }
    if cand.dir == 3 && !(info.width + info.height > 12) {
      continue;
    }

    let active_l0 = cand.dir & 1 != 0;
    let active_l1 = cand.dir & 2 != 0;
    if (active_l0 && !fracmv_within_tile(info, cand.mv[0][0], cand.mv[0][1]))
      || (active_l1 && !fracmv_within_tile(info, cand.mv[1][0], cand.mv[1][1]))
    {
      continue;
    }

    // Duplicate of an already-listed candidate?
    let duplicate = (0..merge.size).any(|k| {
      let u = &merge.unit[merge.keys[k]];
      let prev = &candidates[u.merge_idx as usize];
      prev == cand
    });
    if duplicate {
      continue;
    }

    // Predict and score
    let mut pred = vec![0 as Pixel; w * h];
    let satd = {
      let list = if active_l0 { 0 } else { 1 };
      let Some(&ref_i) = info.params.ref_lx[list].get(cand.ref_idx[list] as usize) else {
        continue;
      };
      if cand.dir == 3 {
        let Some(&ref1_i) = info.params.ref_lx[1].get(cand.ref_idx[1] as usize) else {
          continue;
        };
        let mut pred1 = vec![0 as Pixel; w * h];
        {
          let r = info.params.refs.entry(ref_i as usize).recon.clone();
          let r = r.lock().unwrap();
          mc_luma(&r, info.origin, w, h, Vector2d { x: cand.mv[0][0], y: cand.mv[0][1] },
                  cfg.bitdepth, &mut pred, w);
        }
        {
          let r = info.params.refs.entry(ref1_i as usize).recon.clone();
          let r = r.lock().unwrap();
          mc_luma(&r, info.origin, w, h, Vector2d { x: cand.mv[1][0], y: cand.mv[1][1] },
                  cfg.bitdepth, &mut pred1, w);
        }
        let merged: Vec<Pixel> = pred.iter().zip(&pred1).map(|(&a, &b)| ((a as u32 + b as u32 + 1) >> 1) as Pixel).collect();
        pred = merged;
      } else {
        let r = info.params.refs.entry(ref_i as usize).recon.clone();
        let r = r.lock().unwrap();
        mc_luma(&r, info.origin, w, h, Vector2d { x: cand.mv[list][0], y: cand.mv[list][1] },
                cfg.bitdepth, &mut pred, w);
      }
      let src = info.pic.y();
      let src_off = info.origin.y as usize * src.stride + info.origin.x as usize;
      strategies::satd_any_size(w, h, &pred, w, &src.data[src_off..], src.stride)
    };

    let entry = merge.size;
    if entry >= MAX_UNIT_STATS_MAP_SIZE {
      break;
    }
    let mut pu = *cur_cu;
    pu.cu_type = CU_INTER;
    pu.merged = 1;
    pu.skipped = 0;
    pu.merge_idx = merge_idx as u8;
    pu.mv_dir = cand.dir;
    pu.mv = cand.mv;
    pu.mv_ref = cand.ref_idx;

    let bits = merge_flag_cost
      + merge_idx as f64
      + info.search_cabac.ctx_bits(crate::context::CTX_MERGE_IDX, (merge_idx != 0) as u8);
    merge.unit[entry] = pu;
    merge.cost[entry] = satd as f64 + bits * info.params.lambda_sqrt;
    merge.bits[entry] = bits;
    merge.keys[entry] = entry;
    merge.size += 1;
  }
  merge.sort_keys_by_cost();

  // AMVP search over every active reference picture
  let mut amvp = [UnitStatsMap::default(), UnitStatsMap::default(), UnitStatsMap::default()];

  for ref_idx in 0..info.params.refs.used_size() {
    info.ref_idx = ref_idx;

    // TMVP-style start: co-located CU of this reference, scaled by POC
    // distance.
    let extra_mv = {
      let entry = info.params.refs.entry(ref_idx);
      let col_cu = {
        let col = entry.cu.lock().unwrap();
        let cx = ((info.origin.x + info.width / 2) as usize).min(col.width - 1);
        let cy = ((info.origin.y + info.height / 2) as usize).min(col.height - 1);
        *col.at(cx, cy)
      };
      if col_cu.cu_type == CU_INTER {
        let list = if col_cu.mv_dir & 1 != 0 { 0 } else { 1 };
        let mut mv = Vector2d { x: col_cu.mv[list][0], y: col_cu.mv[list][1] };
        let neighbor_ref_poc = entry
          .ref_pocs
          .get(col_cu.mv_ref[list] as usize)
          .copied()
          .unwrap_or(entry.poc);
        apply_mv_scaling(info.params.poc, entry.poc, entry.poc, neighbor_ref_poc, &mut mv);
        mv
      } else {
        Vector2d::default()
      }
    };

    let recon = info.params.refs.entry(ref_idx).recon.clone();
    let guard = recon.lock().unwrap();
    // Reborrow the info with this reference picture in place
    let mut ref_info = InterSearchInfo {
      ref_pic: &*guard,
      ref_idx: ref_idx,
      merge_cand: info.merge_cand.clone(),
      ..make_view(info)
    };
    search_pu_inter_ref(&mut ref_info, cur_cu, &mut amvp, extra_mv);
  }

  amvp[0].sort_keys_by_cost();
  amvp[1].sort_keys_by_cost();

  // Don't let both lists settle on the same picture; invalidate the one
  // whose runner-up is better.
  if cfg.bipred && amvp[0].size > 0 && amvp[1].size > 0 {
    let k0 = amvp[0].best_key();
    let k1 = amvp[1].best_key();
    let l0_ref = info.params.ref_lx[0][amvp[0].unit[k0].mv_ref[0] as usize];
    let l1_ref = info.params.ref_lx[1][amvp[1].unit[k1].mv_ref[1] as usize];
    if l0_ref == l1_ref {
      let l0_2nd = if amvp[0].size > 1 { amvp[0].cost[amvp[0].keys[1]] } else { MAX_COST };
      let l1_2nd = if amvp[1].size > 1 { amvp[1].cost[amvp[1].keys[1]] } else { MAX_COST };
      let list = if l0_2nd <= l1_2nd { 1 } else { 0 };
      if amvp[list].size > 1 {
        amvp[list].cost[amvp[list].keys[0]] = MAX_COST;
        amvp[list].sort_keys_by_cost();
        amvp[list].size -= 1;
      }
    }
  }

  // Fractional refinement of the best candidate of each list
  if cfg.fme_level > 0 {
    for list in 0..2 {
      if amvp[list].size == 0 {
        continue;
      }
      let key = amvp[list].best_key();
      let pu = amvp[list].unit[key];
      let lx_idx = pu.mv_ref[list] as usize;
      let ref_idx = info.params.ref_lx[list][lx_idx] as usize;

      let recon = info.params.refs.entry(ref_idx).recon.clone();
      let guard = recon.lock().unwrap();
      let mut ref_info = InterSearchInfo {
        ref_pic: &*guard,
        ref_idx: ref_idx,
        merge_cand: info.merge_cand.clone(),
        ..make_view(info)
      };

      let mut best = BestMv {
        cost: MAX_COST,
        bits: f64::MAX,
        mv: Vector2d { x: pu.mv[list][0], y: pu.mv[list][1] },
      };
      search_frac(&ref_info, &mut best);

      let extra_bits = (list + lx_idx) as f64;
      let frac_cost = best.cost + extra_bits * info.params.lambda_sqrt;
      let frac_bits = best.bits + extra_bits;

      if fracmv_within_tile(&ref_info, best.mv.x, best.mv.y) {
        let cu_mv_cand = select_mv_cand(
          cfg, info.search_cabac, ref_info.mv_cand, best.mv.x, best.mv.y, None,
        );
        let u = &mut amvp[list].unit[key];
        u.mv[list][0] = best.mv.x;
        u.mv[list][1] = best.mv.y;
        u.mv_cand[list] = cu_mv_cand as u8;
        amvp[list].cost[key] = frac_cost;
        amvp[list].bits[key] = frac_bits;
      }
      drop(guard);

      // Leave only the refined winner; everything else carries an
      // incomparable SAD-based cost.
      amvp[list].sort_keys_by_cost();
      amvp[list].size = amvp[list].size.min(1);
    }
  }

  // Bi-prediction from the best unipred pair plus the priority-list
  // merge pairs at high RDO levels.
  let can_use_bipred =
    info.params.slicetype == SliceType::B && cfg.bipred && info.width + info.height >= 16;

  if can_use_bipred {
    if amvp[0].size > 0 && amvp[1].size > 0 {
      let u0 = amvp[0].unit[amvp[0].best_key()];
      let u1 = amvp[1].unit[amvp[1].best_key()];
      let mv = [u0.mv[0], u1.mv[1]];
      if fracmv_within_tile(info, mv[0][0], mv[0][1])
        && fracmv_within_tile(info, mv[1][0], mv[1][1])
      {
        let l0_ref = info.params.ref_lx[0][u0.mv_ref[0] as usize] as usize;
        let l1_ref = info.params.ref_lx[1][u1.mv_ref[1] as usize] as usize;

        let mut pred0 = vec![0 as Pixel; w * h];
        let mut pred1 = vec![0 as Pixel; w * h];
        {
          let r = info.params.refs.entry(l0_ref).recon.clone();
          let r = r.lock().unwrap();
          mc_luma(&r, info.origin, w, h, Vector2d { x: mv[0][0], y: mv[0][1] },
                  cfg.bitdepth, &mut pred0, w);
        }
        {
          let r = info.params.refs.entry(l1_ref).recon.clone();
          let r = r.lock().unwrap();
          mc_luma(&r, info.origin, w, h, Vector2d { x: mv[1][0], y: mv[1][1] },
                  cfg.bitdepth, &mut pred1, w);
        }
        let mut pred = vec![0 as Pixel; w * h];
        bipred_average(&pred0, &pred1, &mut pred);

        let src = info.pic.y();
        let src_off = info.origin.y as usize * src.stride + info.origin.x as usize;
        let mut cost =
          strategies::satd_any_size(w, h, &pred, w, &src.data[src_off..], src.stride) as f64;
        let mut bitcost = [0.0, 0.0];
        cost += calc_mvd_cost(info, mv[0][0], mv[0][1], 0, &mut bitcost[0]);
        cost += calc_mvd_cost(info, mv[1][0], mv[1][1], 0, &mut bitcost[1]);
        let extra_bits = (u0.mv_ref[0] + u1.mv_ref[1] + 2) as f64;
        cost += info.params.lambda_sqrt * extra_bits;

        let map = &mut amvp[2];
        let entry = map.size;
        let pu = &mut map.unit[entry];
        *pu = *cur_cu;
        pu.cu_type = CU_INTER;
        pu.merged = 0;
        pu.skipped = 0;
        pu.mv_dir = 3;
        pu.mv = mv;
        pu.mv_ref = [u0.mv_ref[0], u1.mv_ref[1]];
        for list in 0..2 {
          pu.mv_cand[list] = select_mv_cand(
            cfg, info.search_cabac, info.mv_cand, mv[list][0], mv[list][1], None,
          ) as u8;
        }
        map.cost[entry] = cost;
        map.bits[entry] = bitcost[0] + bitcost[1] + extra_bits;
        map.keys[entry] = entry;
        map.size += 1;
      }
    }

    if cfg.rdo >= 3 {
      search_pu_inter_bipred(info, &mut amvp[2]);
    }
    amvp[2].sort_keys_by_cost();
  }

  // Winner selection across L0 / L1 / bipred and merge
  let mut best_cost = MAX_COST;
  let mut best_bits = 0.0;
  let mut best_pu: Option<CuInfo> = None;

  for map in &amvp {
    if map.size > 0 && map.cost[map.best_key()] < best_cost {
      best_cost = map.cost[map.best_key()];
      best_bits = map.bits[map.best_key()];
      best_pu = Some(map.unit[map.best_key()]);
    }
  }

  if merge.size > 0 && merge.cost[merge.best_key()] < best_cost {
    best_cost = merge.cost[merge.best_key()];
    best_bits = merge.bits[merge.best_key()];
    best_pu = Some(merge.unit[merge.best_key()]);
  }

  best_pu.map(|cu| InterSearchResult { cu: cu, cost: best_cost, bits: best_bits })
}

// Clone the non-reference parts of an InterSearchInfo so a scoped
// reborrow can swap in a locked reference picture.
fn make_view<'a>(info: &InterSearchInfo<'a>) -> InterSearchInfo<'a> {
  InterSearchInfo {
    cfg: info.cfg,
    params: info.params,
    pic: info.pic,
    ref_pic: info.pic, // placeholder; overwritten by the struct update
    ref_idx: info.ref_idx,
    origin: info.origin,
    width: info.width,
    height: info.height,
    mv_cand: info.mv_cand,
    merge_cand: Vec::new(),
    tile_px: info.tile_px,
    max_ref_down: info.max_ref_down,
    max_ref_right: info.max_ref_right,
    search_cabac: info.search_cabac,
    ibc_maps: info.ibc_maps,
    ibc_search: info.ibc_search,
  }
}

/// Block-copy search within the current picture: hash candidates plus a
/// small pattern search over the already-reconstructed area.
pub fn search_cu_ibc(
  info: &mut InterSearchInfo,
  cur_cu: &CuInfo,
) -> Option<InterSearchResult> {
  info.ibc_search = true;

  let mut best = BestMv { cost: MAX_COST, bits: f64::MAX, mv: Vector2d::default() };
  select_starting_point(info, Vector2d::default(), &mut best);

  // Constrain to the rolling window to the left and the current row
  let max_back = (IBC_BUFFER_WIDTH as i32).min(info.origin.x);
  if best.cost >= MAX_COST && max_back > 0 {
    // no hash hit; probe a short horizontal strip
    for dx in 1..=max_back.min(64) {
      check_mv_cost(info, -dx, 0, &mut best);
    }
  }

  if best.cost >= MAX_COST {
    return None;
  }

  let mut cu = *cur_cu;
  cu.cu_type = CU_IBC;
  cu.mv_dir = 1;
  cu.mv[0][0] = best.mv.x;
  cu.mv[0][1] = best.mv.y;
  cu.mv_ref[0] = 0;
  Some(InterSearchResult { cu: cu, cost: best.cost, bits: best.bits })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mv_scaling_matches_the_closed_form() {
    // d = 4, d' = 2 gives scale 512; (40, 0) maps to (80, 0)
    let mut mv = Vector2d { x: 40, y: 0 };
    apply_mv_scaling(4, 0, 4, 2, &mut mv);
    assert_eq!(mv, Vector2d { x: 80, y: 0 });

    // Same distances: identity, even for odd vectors
    let mut mv = Vector2d { x: -33, y: 7 };
    apply_mv_scaling(8, 4, 6, 2, &mut mv);
    assert_eq!(mv, Vector2d { x: -33, y: 7 });

    // Inverted direction flips the sign
    let mut mv = Vector2d { x: 16, y: -16 };
    apply_mv_scaling(2, 4, 2, 0, &mut mv);
    assert_eq!(mv.x, -16);
    assert_eq!(mv.y, 16);
  }

  #[test]
  fn scaled_mv_rounding_is_asymmetric_around_zero() {
    // (scaled + 127 + (scaled < 0)) >> 8 rounds towards nearest with
    // ties resolved away from the negative side
    assert_eq!(get_scaled_mv(1, 128), 1); // 128 + 127 >> 8
    assert_eq!(get_scaled_mv(-1, 128), 0); // -128 + 127 + 1 >> 8
    assert_eq!(get_scaled_mv(100, 4095), 1600);
  }

  #[test]
  fn ep_ex_golomb_bitcost_is_log_shaped() {
    assert_eq!(get_ep_ex_golomb_bitcost(0), 0);
    assert_eq!(get_ep_ex_golomb_bitcost(1), 0);
    assert!(get_ep_ex_golomb_bitcost(4) < get_ep_ex_golomb_bitcost(400));
  }
}
