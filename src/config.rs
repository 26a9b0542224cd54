// Encoder configuration.
//
// Everything here is plain data filled in by the embedding application;
// validation happens once at encoder creation and conflicts are reported
// as BadConfig before any frame is accepted.

use std::path::PathBuf;

use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceType {
  I,
  P,
  B,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChromaFormat {
  Csp420,
  Csp444,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PicType {
  IdrWRadl,
  IdrNLp,
  Cra,
  Rasl,
  Trail,
}

impl PicType {
  pub fn is_idr(self) -> bool {
    matches!(self, PicType::IdrWRadl | PicType::IdrNLp)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MvConstraint {
  None,
  Frame,
  /// Experimental: known to interact nondeterministically with the
  /// tile-local scheduler shortcut, which therefore stays disabled.
  FrameAndTileMargin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImeAlgorithm {
  Hexagon,
  Diamond,
  Tz,
  Full8,
  Full16,
  Full32,
  Full64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EarlyTermination {
  Off,
  On,
  Sensitive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaoType {
  Off,
  Band,
  Edge,
  Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlfType {
  Off,
  NoCc,
  Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RcAlgorithm {
  NoRc,
  Lambda,
  Oba,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoiFormat {
  Txt,
  Bin,
}

#[derive(Clone, Debug, Default)]
pub struct RoiConfig {
  pub file_path: Option<PathBuf>,
  pub format: Option<RoiFormat>,
}

/// One entry of the GOP structure table.
#[derive(Clone, Debug)]
pub struct GopEntry {
  pub poc_offset: i32,
  pub layer: u32,
  pub qp_offset: i32,
  pub is_ref: bool,
  pub ref_neg: Vec<i32>,
  pub ref_pos: Vec<i32>,
}

#[derive(Clone, Debug)]
pub struct Config {
  pub width: usize,
  pub height: usize,
  pub qp: i32,
  pub bitdepth: u32,
  pub chroma_format: ChromaFormat,

  pub threads: usize,
  pub wpp: bool,
  pub owf: usize,
  pub tiles_width_count: usize,
  pub tiles_height_count: usize,

  pub deblock_enable: bool,
  pub sao_type: SaoType,
  pub alf_type: AlfType,
  pub lmcs_enable: bool,

  /// Bit 0 enables intra block copy, bit 1 additionally enables the
  /// hash-accelerated search.
  pub ibc: u8,
  pub mv_constraint: MvConstraint,
  pub ime_algorithm: ImeAlgorithm,
  pub me_early_termination: EarlyTermination,
  pub me_max_steps: u32,
  pub fme_level: u32,
  pub rdo: u32,
  pub mv_rdo: bool,
  pub early_skip: bool,
  pub bipred: bool,
  pub dual_tree: bool,
  pub jccr: bool,
  pub ref_frames: usize,

  pub gop_len: usize,
  pub gop_lowdelay: bool,
  pub open_gop: bool,
  pub intra_period: i32,

  pub target_bitrate: i64,
  pub rc_algorithm: RcAlgorithm,

  pub roi: RoiConfig,
  pub erp_aqp: bool,
  pub vaq: u32,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      width: 0,
      height: 0,
      qp: 22,
      bitdepth: 8,
      chroma_format: ChromaFormat::Csp420,
      threads: 4,
      wpp: true,
      owf: 0,
      tiles_width_count: 1,
      tiles_height_count: 1,
      deblock_enable: true,
      sao_type: SaoType::Full,
      alf_type: AlfType::Off,
      lmcs_enable: false,
      ibc: 0,
      mv_constraint: MvConstraint::None,
      ime_algorithm: ImeAlgorithm::Hexagon,
      me_early_termination: EarlyTermination::On,
      me_max_steps: u32::MAX,
      fme_level: 4,
      rdo: 1,
      mv_rdo: false,
      early_skip: true,
      bipred: false,
      dual_tree: false,
      jccr: false,
      ref_frames: 4,
      gop_len: 0,
      gop_lowdelay: false,
      open_gop: false,
      intra_period: 64,
      target_bitrate: 0,
      rc_algorithm: RcAlgorithm::NoRc,
      roi: RoiConfig::default(),
      erp_aqp: false,
      vaq: 0,
    }
  }
}

impl Config {
  pub fn validate(&self) -> Result<(), Error> {
    if self.width == 0 || self.height == 0 || self.width > 65536 || self.height > 65536 {
      return Err(Error::BadConfig("picture dimensions out of range"));
    }
    if self.chroma_format == ChromaFormat::Csp420 && (self.width % 2 != 0 || self.height % 2 != 0) {
      return Err(Error::BadConfig("4:2:0 requires even dimensions"));
    }
    if self.bitdepth != 8 && self.bitdepth != 10 {
      return Err(Error::BadConfig("only 8 and 10 bit depths are supported"));
    }
    if self.qp < 0 || self.qp > 51 {
      return Err(Error::BadConfig("qp outside 0..=51"));
    }
    if self.threads == 0 {
      return Err(Error::BadConfig("at least one thread is required"));
    }
    if self.fme_level > 4 {
      return Err(Error::BadConfig("fme_level outside 0..=4"));
    }
    if self.rdo > 3 {
      return Err(Error::BadConfig("rdo outside 0..=3"));
    }
    if self.target_bitrate > 0 || self.rc_algorithm != RcAlgorithm::NoRc {
      // Rate control algorithms plug in from outside this crate.
      return Err(Error::BadConfig("rate control is not available"));
    }
    if self.gop_len != 0 && !self.gop_lowdelay && self.gop_len != 4 && self.gop_len != 8 {
      return Err(Error::BadConfig("only the 4- and 8-frame reordering GOPs are built in"));
    }
    if self.gop_lowdelay && (self.gop_len == 0 || self.gop_len > 16) {
      return Err(Error::BadConfig("low-delay GOP length outside 1..=16"));
    }
    if self.tiles_width_count == 0 || self.tiles_height_count == 0 {
      return Err(Error::BadConfig("tile counts must be nonzero"));
    }
    let lcus_x = self.width.div_ceil(64);
    let lcus_y = self.height.div_ceil(64);
    if self.tiles_width_count > lcus_x || self.tiles_height_count > lcus_y {
      return Err(Error::BadConfig("more tiles than CTUs"));
    }
    if self.roi.file_path.is_some() && self.roi.format.is_none() {
      return Err(Error::BadConfig("ROI file requires a format"));
    }
    if self.ref_frames == 0 || self.ref_frames > 16 {
      return Err(Error::BadConfig("ref_frames outside 1..=16"));
    }
    Ok(())
  }

  /// The GOP structure table selected by gop_len / gop_lowdelay.
  pub fn gop_table(&self) -> Vec<GopEntry> {
    if self.gop_len == 0 {
      return Vec::new();
    }
    if self.gop_lowdelay {
      // Every frame references up to four previous frames, no reordering.
      return (0..self.gop_len)
        .map(|i| GopEntry {
          poc_offset: i as i32 + 1,
          layer: if i + 1 == self.gop_len { 1 } else { 2 },
          qp_offset: if i + 1 == self.gop_len { 1 } else { 3 },
          is_ref: true,
          ref_neg: (1..=4).map(|d| d as i32).collect(),
          ref_pos: Vec::new(),
        })
        .collect();
    }

    // The classic hierarchical-B structures.
    let entry = |poc_offset: i32, layer: u32, qp_offset: i32, is_ref: bool,
                 ref_neg: &[i32], ref_pos: &[i32]| GopEntry {
      poc_offset: poc_offset,
      layer: layer,
      qp_offset: qp_offset,
      is_ref: is_ref,
      ref_neg: ref_neg.to_vec(),
      ref_pos: ref_pos.to_vec(),
    };
    if self.gop_len == 4 {
      return vec![
        entry(4, 1, 1, true, &[4, 8], &[]),
        entry(2, 2, 2, true, &[2], &[2]),
        entry(1, 3, 3, false, &[1], &[1, 3]),
        entry(3, 3, 3, false, &[1, 3], &[1]),
      ];
    }
    vec![
      entry(8, 1, 1, true, &[8, 16], &[]),
      entry(4, 2, 2, true, &[4], &[4]),
      entry(2, 3, 3, true, &[2], &[2, 6]),
      entry(1, 4, 4, false, &[1], &[1, 3, 7]),
      entry(3, 4, 4, false, &[1, 3], &[1, 5]),
      entry(6, 3, 3, true, &[2, 6], &[2]),
      entry(5, 4, 4, false, &[1, 5], &[1, 3]),
      entry(7, 4, 4, false, &[1, 7], &[1]),
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn valid() -> Config {
    Config { width: 128, height: 128, ..Config::default() }
  }

  #[test]
  fn default_config_validates() {
    assert!(valid().validate().is_ok());
  }

  #[test]
  fn rate_control_is_rejected() {
    let cfg = Config { target_bitrate: 1_000_000, ..valid() };
    assert!(matches!(cfg.validate(), Err(Error::BadConfig(_))));
  }

  #[test]
  fn odd_dimensions_rejected_for_420() {
    let cfg = Config { width: 127, ..valid() };
    assert!(cfg.validate().is_err());
    let cfg = Config { width: 127, chroma_format: ChromaFormat::Csp444, ..valid() };
    assert!(cfg.validate().is_ok());
  }

  #[test]
  fn gop_table_poc_offsets_cover_the_gop() {
    let cfg = Config { gop_len: 8, ..valid() };
    let gop = cfg.gop_table();
    let mut offsets: Vec<i32> = gop.iter().map(|e| e.poc_offset).collect();
    offsets.sort();
    assert_eq!(offsets, vec![1, 2, 3, 4, 5, 6, 7, 8]);
  }
}
