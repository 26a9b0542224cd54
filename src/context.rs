// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// CABAC context models.
//
// Each context is one byte: the low bit is the MPS value and the upper
// six bits are the probability state index. State transitions are table
// lookups, so the whole model set is a plain 188-byte array that can be
// copied wholesale (wavefront rows seed the next row that way) and cloned
// cheaply for speculative search.

use std::sync::OnceLock;

use crate::config::SliceType;
use crate::util::clip;

pub const NUM_CONTEXTS: usize = 188;

// Context table layout. Each family gets a base index and a fixed count;
// the per-syntax context offset is added by the caller.
pub const CTX_SAO_MERGE: usize = 0;
pub const CTX_SAO_TYPE: usize = 1;
pub const CTX_ALF_CTB_FLAG: usize = 2; // 9: 3 per component, by neighbor flags
pub const CTX_ALF_ALTERNATIVE: usize = 11; // 3: one per component
pub const CTX_SPLIT_CU_FLAG: usize = 14; // 9
pub const CTX_SPLIT_QT_FLAG: usize = 23; // 6
pub const CTX_MTT_VERT_FLAG: usize = 29; // 5
pub const CTX_MTT_BINARY_FLAG: usize = 34; // 4
pub const CTX_CU_SKIP_FLAG: usize = 38; // 3: by neighbor skip flags
pub const CTX_PRED_MODE: usize = 41; // 2
pub const CTX_IBC_FLAG: usize = 43; // 3
pub const CTX_MERGE_FLAG: usize = 46;
pub const CTX_MERGE_IDX: usize = 47;
pub const CTX_MVP_IDX: usize = 48;
pub const CTX_INTER_DIR: usize = 49; // 6: by block size class
pub const CTX_REF_IDX: usize = 55; // 2
pub const CTX_MVD_GREATER0: usize = 57;
pub const CTX_MVD_GREATER1: usize = 58;
pub const CTX_INTRA_MPM_FLAG: usize = 59; // 2
pub const CTX_INTRA_PLANAR: usize = 61; // 2
pub const CTX_INTRA_CHROMA: usize = 63; // 2
pub const CTX_QT_ROOT_CBF: usize = 65;
pub const CTX_CBF_LUMA: usize = 66; // 4
pub const CTX_CBF_CB: usize = 70; // 2
pub const CTX_CBF_CR: usize = 72; // 3
pub const CTX_JOINT_CBCR: usize = 75; // 3
pub const CTX_QP_DELTA_ABS: usize = 78; // 2
pub const CTX_TRANSFORM_SKIP: usize = 80; // 2: luma, chroma
pub const CTX_LAST_X_PREFIX: usize = 82; // 18: 15 luma + 3 chroma
pub const CTX_LAST_Y_PREFIX: usize = 100; // 18
pub const CTX_SIG_GROUP: usize = 118; // 4: 2 luma + 2 chroma
pub const CTX_SIG_FLAG: usize = 122; // 36: 24 luma + 12 chroma
pub const CTX_COEFF_GT1: usize = 158; // 24: 16 luma + 8 chroma
pub const CTX_COEFF_GT2: usize = 182; // 6: 4 luma + 2 chroma

// The terminating bin is context-free; 188 covers everything above.
const _: () = assert!(CTX_COEFF_GT2 + 6 == NUM_CONTEXTS);

// Probability state machinery, shared with the H.264/H.265 lineage.
// 64 states per MPS value, interleaved as (state << 1) | mps.

pub const NEXT_STATE_MPS: [u8; 128] = [
  2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21,
  22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39,
  40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57,
  58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75,
  76, 77, 78, 79, 80, 81, 82, 83, 84, 85, 86, 87, 88, 89, 90, 91, 92, 93,
  94, 95, 96, 97, 98, 99, 100, 101, 102, 103, 104, 105, 106, 107, 108, 109,
  110, 111, 112, 113, 114, 115, 116, 117, 118, 119, 120, 121, 122, 123,
  124, 125, 124, 125, 126, 127,
];

pub const NEXT_STATE_LPS: [u8; 128] = [
  1, 0, 0, 1, 2, 3, 4, 5, 4, 5, 8, 9, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17,
  18, 19, 18, 19, 22, 23, 22, 23, 24, 25, 26, 27, 26, 27, 30, 31, 30, 31,
  32, 33, 32, 33, 36, 37, 36, 37, 38, 39, 38, 39, 42, 43, 42, 43, 44, 45,
  44, 45, 46, 47, 48, 49, 48, 49, 50, 51, 52, 53, 52, 53, 54, 55, 54, 55,
  56, 57, 58, 59, 58, 59, 60, 61, 60, 61, 60, 61, 62, 63, 64, 65, 64, 65,
  66, 67, 66, 67, 66, 67, 68, 69, 68, 69, 70, 71, 70, 71, 70, 71, 72, 73,
  72, 73, 72, 73, 74, 75, 74, 75, 74, 75, 76, 77, 76, 77, 126, 127,
];

// LPS range, indexed by [state][(range >> 6) & 3]
pub const LPS_TABLE: [[u8; 4]; 64] = [
  [128, 176, 208, 240], [128, 167, 197, 227], [128, 158, 187, 216],
  [123, 150, 178, 205], [116, 142, 169, 195], [111, 135, 160, 185],
  [105, 128, 152, 175], [100, 122, 144, 166], [95, 116, 137, 158],
  [90, 110, 130, 150], [85, 104, 123, 142], [81, 99, 117, 135],
  [77, 94, 111, 128], [73, 89, 105, 122], [69, 85, 100, 116],
  [66, 80, 95, 110], [62, 76, 90, 104], [59, 72, 86, 99],
  [56, 69, 81, 94], [53, 65, 77, 89], [51, 62, 73, 85],
  [48, 59, 69, 80], [46, 56, 66, 76], [43, 53, 63, 72],
  [41, 50, 59, 69], [39, 48, 56, 65], [37, 45, 54, 62],
  [35, 43, 51, 59], [33, 41, 48, 56], [32, 39, 46, 53],
  [30, 37, 43, 50], [29, 35, 41, 48], [27, 33, 39, 45],
  [26, 31, 37, 43], [24, 30, 35, 41], [23, 28, 33, 39],
  [22, 27, 32, 37], [21, 26, 30, 35], [20, 24, 29, 33],
  [19, 23, 27, 31], [18, 22, 26, 30], [17, 21, 25, 28],
  [16, 20, 23, 27], [15, 19, 22, 25], [14, 18, 21, 24],
  [14, 17, 20, 23], [13, 16, 19, 22], [12, 15, 18, 21],
  [12, 14, 17, 20], [11, 14, 16, 19], [11, 13, 15, 18],
  [10, 12, 15, 17], [10, 12, 14, 16], [9, 11, 13, 15],
  [9, 11, 12, 14], [8, 10, 12, 14], [8, 9, 11, 13],
  [7, 9, 11, 12], [7, 9, 10, 12], [7, 8, 10, 11],
  [6, 8, 9, 11], [6, 7, 9, 10], [6, 7, 8, 9], [2, 2, 2, 2],
];

// Renormalization shift, indexed by lps >> 3
pub const RENORM_TABLE: [u8; 32] = [
  6, 5, 4, 4, 3, 3, 3, 3, 2, 2, 2, 2, 2, 2, 2, 2,
  1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
];

/// A single context model byte: (probability state << 1) | mps.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct ContextModel {
  pub uc_state: u8,
}

impl ContextModel {
  pub fn state(self) -> u8 {
    self.uc_state >> 1
  }

  pub fn mps(self) -> u8 {
    self.uc_state & 1
  }

  pub fn update_mps(&mut self) {
    self.uc_state = NEXT_STATE_MPS[self.uc_state as usize];
  }

  pub fn update_lps(&mut self) {
    self.uc_state = NEXT_STATE_LPS[self.uc_state as usize];
  }
}

// Slice-type dependent initialization bytes. Each byte packs a QP slope in
// the high nibble and an offset in the low nibble; see init_state() below.
// 154 is the neutral "equiprobable at all QPs" value.
const CNU: u8 = 154;

struct CtxFamily {
  base: usize,
  // Init bytes for I, P and B slices, `count` entries each
  init: [&'static [u8]; 3],
}

const FAMILIES: &[CtxFamily] = &[
  CtxFamily { base: CTX_SAO_MERGE, init: [&[153], &[153], &[153]] },
  CtxFamily { base: CTX_SAO_TYPE, init: [&[200], &[185], &[160]] },
  CtxFamily {
    base: CTX_ALF_CTB_FLAG,
    init: [
      &[200, 185, 160, 200, 185, 160, 200, 185, 160],
      &[185, 160, 154, 185, 160, 154, 185, 160, 154],
      &[160, 154, 154, 160, 154, 154, 160, 154, 154],
    ],
  },
  CtxFamily { base: CTX_ALF_ALTERNATIVE, init: [&[CNU; 3], &[CNU; 3], &[CNU; 3]] },
  CtxFamily {
    base: CTX_SPLIT_CU_FLAG,
    init: [
      &[139, 141, 157, 139, 141, 157, 139, 141, 157],
      &[107, 139, 126, 107, 139, 126, 107, 139, 126],
      &[107, 139, 126, 107, 139, 126, 107, 139, 126],
    ],
  },
  CtxFamily {
    base: CTX_SPLIT_QT_FLAG,
    init: [
      &[138, 140, 142, 138, 140, 142],
      &[123, 125, 127, 123, 125, 127],
      &[123, 125, 127, 123, 125, 127],
    ],
  },
  CtxFamily {
    base: CTX_MTT_VERT_FLAG,
    init: [&[CNU; 5], &[151, 153, 155, 153, 151], &[151, 153, 155, 153, 151]],
  },
  CtxFamily {
    base: CTX_MTT_BINARY_FLAG,
    init: [&[CNU; 4], &[CNU; 4], &[CNU; 4]],
  },
  CtxFamily {
    base: CTX_CU_SKIP_FLAG,
    init: [&[CNU, CNU, CNU], &[197, 185, 201], &[197, 185, 201]],
  },
  CtxFamily { base: CTX_PRED_MODE, init: [&[CNU, CNU], &[149, 139], &[134, 139]] },
  CtxFamily {
    base: CTX_IBC_FLAG,
    init: [&[139, 155, 157], &[139, 155, 157], &[139, 155, 157]],
  },
  CtxFamily { base: CTX_MERGE_FLAG, init: [&[CNU], &[110], &[154]] },
  CtxFamily { base: CTX_MERGE_IDX, init: [&[CNU], &[122], &[137]] },
  CtxFamily { base: CTX_MVP_IDX, init: [&[CNU], &[168], &[168]] },
  CtxFamily {
    base: CTX_INTER_DIR,
    init: [
      &[CNU; 6],
      &[95, 79, 63, 31, 31, 73],
      &[95, 79, 63, 31, 31, 73],
    ],
  },
  CtxFamily { base: CTX_REF_IDX, init: [&[CNU, CNU], &[153, 153], &[153, 153]] },
  CtxFamily { base: CTX_MVD_GREATER0, init: [&[CNU], &[169], &[169]] },
  CtxFamily { base: CTX_MVD_GREATER1, init: [&[CNU], &[198], &[198]] },
  CtxFamily {
    base: CTX_INTRA_MPM_FLAG,
    init: [&[184, 184], &[154, 154], &[183, 183]],
  },
  CtxFamily { base: CTX_INTRA_PLANAR, init: [&[154, 142], &[154, 142], &[154, 142]] },
  CtxFamily { base: CTX_INTRA_CHROMA, init: [&[63, 139], &[152, 139], &[152, 139]] },
  CtxFamily { base: CTX_QT_ROOT_CBF, init: [&[CNU], &[79], &[79]] },
  CtxFamily {
    base: CTX_CBF_LUMA,
    init: [
      &[111, 141, 153, 154],
      &[153, 111, 153, 154],
      &[153, 111, 153, 154],
    ],
  },
  CtxFamily { base: CTX_CBF_CB, init: [&[94, 138], &[149, 107], &[149, 92]] },
  CtxFamily {
    base: CTX_CBF_CR,
    init: [&[138, 182, 154], &[107, 167, 154], &[92, 167, 154]],
  },
  CtxFamily {
    base: CTX_JOINT_CBCR,
    init: [&[156, 156, 156], &[156, 156, 156], &[156, 156, 156]],
  },
  CtxFamily { base: CTX_QP_DELTA_ABS, init: [&[154, 154], &[154, 154], &[154, 154]] },
  CtxFamily { base: CTX_TRANSFORM_SKIP, init: [&[139, 139], &[139, 139], &[139, 139]] },
  CtxFamily {
    base: CTX_LAST_X_PREFIX,
    init: [
      &[110, 110, 124, 125, 140, 153, 125, 127, 140, 109, 111, 143, 127, 111, 79, 108, 123, 63],
      &[125, 110, 94, 110, 95, 79, 125, 111, 110, 78, 110, 111, 111, 95, 94, 108, 123, 108],
      &[125, 110, 124, 110, 95, 94, 125, 111, 111, 79, 125, 126, 111, 111, 79, 108, 123, 93],
    ],
  },
  CtxFamily {
    base: CTX_LAST_Y_PREFIX,
    init: [
      &[110, 110, 124, 125, 140, 153, 125, 127, 140, 109, 111, 143, 127, 111, 79, 108, 123, 63],
      &[125, 110, 94, 110, 95, 79, 125, 111, 110, 78, 110, 111, 111, 95, 94, 108, 123, 108],
      &[125, 110, 124, 110, 95, 94, 125, 111, 111, 79, 125, 126, 111, 111, 79, 108, 123, 93],
    ],
  },
  CtxFamily {
    base: CTX_SIG_GROUP,
    init: [&[91, 171, 134, 141], &[121, 140, 61, 154], &[121, 140, 61, 154]],
  },
  CtxFamily {
    base: CTX_SIG_FLAG,
    init: [
      &[111, 111, 125, 110, 110, 94, 124, 108, 124, 107, 125, 141, 179, 153, 125, 107,
        125, 141, 179, 153, 125, 107, 125, 141, 140, 139, 182, 182, 152, 136, 152, 136,
        153, 136, 139, 111],
      &[155, 154, 139, 153, 139, 123, 123, 63, 153, 166, 183, 140, 136, 153, 154, 166,
        183, 140, 136, 153, 154, 166, 183, 140, 170, 153, 123, 123, 107, 121, 107, 121,
        167, 151, 183, 140],
      &[170, 154, 139, 153, 139, 123, 123, 63, 124, 166, 183, 140, 136, 153, 154, 166,
        183, 140, 136, 153, 154, 166, 183, 140, 170, 153, 138, 138, 122, 121, 122, 121,
        167, 151, 183, 140],
    ],
  },
  CtxFamily {
    base: CTX_COEFF_GT1,
    init: [
      &[140, 92, 137, 138, 140, 152, 138, 139, 153, 74, 149, 92, 139, 107, 122, 152,
        140, 179, 166, 182, 140, 227, 122, 197],
      &[154, 196, 196, 167, 154, 152, 167, 182, 182, 134, 149, 136, 153, 121, 136, 137,
        169, 194, 166, 167, 154, 167, 137, 182],
      &[154, 196, 167, 167, 154, 152, 167, 182, 182, 134, 149, 136, 153, 121, 136, 122,
        169, 208, 166, 167, 154, 152, 167, 182],
    ],
  },
  CtxFamily {
    base: CTX_COEFF_GT2,
    init: [
      &[138, 153, 136, 167, 152, 152],
      &[107, 167, 91, 122, 107, 167],
      &[107, 167, 91, 107, 107, 167],
    ],
  },
];

// Derive the initial probability state for one context at the given QP.
// The init byte packs a slope and an offset; the derived value picks both
// the state index and the MPS.
fn init_state(init_value: u8, qp: i32) -> u8 {
  let slope = (init_value >> 4) as i32 * 5 - 45;
  let offset = (((init_value & 15) as i32) << 3) - 16;
  let init_state = clip(1, 126, ((slope * clip(0, 51, qp)) >> 4) + offset);

  if init_state >= 64 {
    // MPS = 1
    (((init_state - 64) as u8) << 1) | 1
  } else {
    // MPS = 0
    ((63 - init_state as u8) << 1) | 0
  }
}

/// The full set of context models for one CABAC engine.
#[derive(Clone, PartialEq, Eq)]
pub struct ContextSet {
  pub models: [ContextModel; NUM_CONTEXTS],
}

impl ContextSet {
  pub fn new(qp: i32, slice: SliceType) -> Self {
    let mut set = ContextSet { models: [ContextModel::default(); NUM_CONTEXTS] };
    set.init(qp, slice);
    set
  }

  pub fn init(&mut self, qp: i32, slice: SliceType) {
    let s = match slice {
      SliceType::I => 0,
      SliceType::P => 1,
      SliceType::B => 2,
    };
    for fam in FAMILIES {
      let init = fam.init[s];
      for (i, &byte) in init.iter().enumerate() {
        self.models[fam.base + i] = ContextModel { uc_state: init_state(byte, qp) };
      }
    }
  }

  // Replace every model with those of `src`. Wavefront rows use this to
  // seed the next row's contexts.
  pub fn copy_from(&mut self, src: &ContextSet) {
    self.models = src.models;
  }
}

// Fractional bit cost of coding `bin` with a model in state `uc_state`,
// derived from the exponentially spaced LPS probabilities of the state
// machine. Used for rate estimation during search; never for coding.
pub fn entropy_bits(uc_state: u8, bin: u8) -> f64 {
  static TABLE: OnceLock<[[f64; 2]; 128]> = OnceLock::new();
  let table = TABLE.get_or_init(|| {
    let mut t = [[0.0f64; 2]; 128];
    let alpha = (0.01875f64 / 0.5).powf(1.0 / 63.0);
    for uc in 0..128u32 {
      let state = (uc >> 1) as i32;
      let mps = (uc & 1) as usize;
      let p_lps = 0.5 * alpha.powi(state);
      let lps_bits = -p_lps.log2();
      let mps_bits = -(1.0 - p_lps).log2();
      t[uc as usize][mps] = mps_bits;
      t[uc as usize][1 - mps] = lps_bits;
    }
    t
  });
  table[uc_state as usize][bin as usize]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn families_cover_table_exactly() {
    let mut covered = [false; NUM_CONTEXTS];
    for fam in FAMILIES {
      for i in 0..fam.init[0].len() {
        assert!(!covered[fam.base + i], "context {} doubly covered", fam.base + i);
        covered[fam.base + i] = true;
      }
      assert_eq!(fam.init[0].len(), fam.init[1].len());
      assert_eq!(fam.init[1].len(), fam.init[2].len());
    }
    assert!(covered.iter().all(|&c| c), "context table has holes");
  }

  #[test]
  fn neutral_init_is_equiprobable() {
    // CNU must land on state 0 regardless of QP
    for qp in [0, 22, 27, 37, 51] {
      let uc = init_state(CNU, qp);
      assert_eq!(uc >> 1, 0, "CNU at qp {} gave state {}", qp, uc >> 1);
    }
  }

  #[test]
  fn state_update_tables_are_consistent() {
    // MPS update never decreases the state; LPS update never increases it
    // (in probability terms), and the MPS flips only from state 0.
    for uc in 0..128u8 {
      let m = ContextModel { uc_state: uc };
      let mut lps = m;
      lps.update_lps();
      if m.state() == 0 && uc < 126 {
        assert_eq!(lps.mps(), 1 - m.mps(), "MPS must flip from state 0");
      } else if uc < 126 {
        assert_eq!(lps.mps(), m.mps(), "MPS must not flip from state {}", m.state());
      }
    }
  }

  #[test]
  fn entropy_bits_ordering() {
    // A confident state codes its MPS cheaper than an uncertain one
    let confident = (40 << 1) | 1;
    let uncertain = 0 << 1 | 1;
    assert!(entropy_bits(confident, 1) < entropy_bits(uncertain, 1));
    assert!(entropy_bits(confident, 0) > entropy_bits(uncertain, 0));
  }
}
