// End-to-end encoding scenarios.

use std::io::Write;
use std::sync::Arc;

use tinyvvc::config::{ChromaFormat, Config, RoiFormat, SaoType};
use tinyvvc::cu::CU_IBC;
use tinyvvc::frame::{build_frame_encode, submit_frame, EncoderControl, FrameParams};
use tinyvvc::picture::{Picture, RoiMap};
use tinyvvc::{ctu, Encoder, Error};

fn make_picture(cfg: &Config, frame_idx: usize) -> Picture {
  let mut pic = Picture::new(cfg.width, cfg.height, cfg.chroma_format, 0);
  let shift = frame_idx * 2; // slow horizontal pan
  for y in 0..cfg.height {
    for x in 0..cfg.width {
      let v = ((x + shift) * 3 + y * 5 + (x * y) % 31) % 255;
      pic.planes[0].set(x, y, v as u16);
    }
  }
  for plane in 1..3 {
    let p = &mut pic.planes[plane];
    for y in 0..p.height {
      for x in 0..p.width {
        let v = ((x + shift / 2) * 7 + y * 2 + plane * 40) % 255;
        p.set(x, y, v as u16);
      }
    }
  }
  pic.pts = frame_idx as i64;
  pic
}

fn encode_sequence(cfg: &Config, frames: usize) -> Vec<Vec<u8>> {
  let mut enc = Encoder::new(cfg.clone()).unwrap();
  for i in 0..frames {
    enc.encode_one_frame(make_picture(cfg, i)).unwrap();
  }
  enc.flush();
  let mut out = Vec::new();
  while let Some(frame) = enc.output_pull().unwrap() {
    out.push(frame.data);
  }
  out
}

fn base_cfg() -> Config {
  Config {
    width: 128,
    height: 128,
    threads: 4,
    ..Config::default()
  }
}

#[test]
fn single_intra_frame_encodes_deterministically() {
  let cfg = base_cfg();
  let a = encode_sequence(&cfg, 1);
  let b = encode_sequence(&cfg, 1);
  assert_eq!(a.len(), 1);
  assert!(!a[0].is_empty());
  assert_eq!(a, b, "two identical runs must produce identical bytes");
}

#[test]
fn short_sequence_with_inter_frames() {
  let cfg = Config { owf: 2, intra_period: 8, ..base_cfg() };
  let out = encode_sequence(&cfg, 10);
  assert_eq!(out.len(), 10);
  for data in &out {
    assert!(!data.is_empty());
  }

  // Determinism across runs, inter prediction included
  let out2 = encode_sequence(&cfg, 10);
  assert_eq!(out, out2);
}

#[test]
fn output_order_and_timestamps_are_serialized() {
  let cfg = Config { owf: 3, intra_period: 16, ..base_cfg() };
  let mut enc = Encoder::new(cfg.clone()).unwrap();
  for i in 0..8 {
    enc.encode_one_frame(make_picture(&cfg, i)).unwrap();
  }
  enc.flush();

  let mut dts_prev = -1;
  while let Some(frame) = enc.output_pull().unwrap() {
    assert!(frame.dts > dts_prev, "emission must follow submission order");
    dts_prev = frame.dts;
  }
  assert_eq!(dts_prev, 7);
}

// Build a one-frame encode directly so the workers can be driven by
// hand and the internal state inspected between steps.
fn direct_frame(cfg: Config) -> (Arc<EncoderControl>, Arc<tinyvvc::frame::FrameEncode>) {
  let ctrl = Arc::new(EncoderControl::new(cfg).unwrap());
  let cfg = &ctrl.cfg;
  let qp = cfg.qp;
  let lambda = 0.57 * 2f64.powf((qp - 12) as f64 / 3.0);
  let params = Arc::new(FrameParams {
    num: 0,
    poc: 0,
    gop_offset: 0,
    slicetype: tinyvvc::config::SliceType::I,
    pictype: tinyvvc::config::PicType::IdrNLp,
    is_irap: true,
    irap_poc: 0,
    width: cfg.width,
    height: cfg.height,
    bitdepth: cfg.bitdepth,
    has_chroma: true,
    chroma_scale_x: 1,
    chroma_scale_y: 1,
    qp: qp,
    lambda: lambda,
    lambda_sqrt: lambda.sqrt(),
    max_qp_delta_depth: -1,
    refs: tinyvvc::reflist::RefList::new(),
    ref_lx: [Vec::new(), Vec::new()],
    roi: None,
    aq_offsets: Vec::new(),
    jccr_sign: false,
    lmcs: None,
  });
  let pic = make_picture(cfg, 0);
  let fe = build_frame_encode(&ctrl, params, Arc::new(pic));
  (ctrl, fe)
}

#[test]
fn wpp_seeds_next_row_from_second_ctu() {
  // 2x2 CTUs with wavefronts: after the second CTU of row 0 is emitted,
  // row 1 must start from exactly those contexts.
  let cfg = Config { wpp: true, threads: 1, ..base_cfg() };
  let (ctrl, fe) = direct_frame(cfg);
  let tile = fe.tiles[0].clone();
  assert_eq!(tile.lcu_order.len(), 4);
  assert_eq!(tile.leaves.len(), 2);

  // Searches in wavefront-legal order
  for id in [0usize, 1, 2, 3] {
    ctu::worker_search_lcu(&ctrl, &fe, &tile, id);
  }

  ctu::worker_bitstream_lcu(&ctrl, &fe, &tile, 0);
  ctu::worker_bitstream_lcu(&ctrl, &fe, &tile, 1);

  // Hand-off happened while emitting CTU (0, 1)
  let row0_ctx = tile.leaves[0].lock().unwrap().cabac.ctx.clone();
  let row1_ctx = tile.leaves[1].lock().unwrap().cabac.ctx.clone();
  assert!(row1_ctx == row0_ctx,
          "row 1 must start from the contexts after CTU (0, 1)");

  // Row 1 then encodes and diverges on its own
  ctu::worker_bitstream_lcu(&ctrl, &fe, &tile, 2);
  let row1_after = tile.leaves[1].lock().unwrap().cabac.ctx.clone();
  assert!(row1_after != row0_ctx);
}

#[test]
fn two_tiles_four_rows_produce_a_substream_per_row() {
  // 2 tiles of 2x4 CTUs each, WPP on: four substreams per tile, each
  // closed with the terminating trailing pattern.
  let cfg = Config {
    width: 256,
    height: 256,
    tiles_width_count: 2,
    wpp: true,
    threads: 1,
    ..base_cfg()
  };
  let (ctrl, fe) = direct_frame(cfg);
  assert_eq!(fe.tiles.len(), 2);

  for tile in &fe.tiles {
    assert_eq!(tile.width_in_lcu(), 2);
    assert_eq!(tile.height_in_lcu(), 4);
    for id in 0..tile.lcu_order.len() {
      ctu::worker_search_lcu(&ctrl, &fe, tile, id);
    }
    for id in 0..tile.lcu_order.len() {
      ctu::worker_bitstream_lcu(&ctrl, &fe, tile, id);
    }
  }

  let mut substreams = 0;
  for tile in &fe.tiles {
    for leaf in &tile.leaves {
      let leaf = leaf.lock().unwrap();
      let bytes = leaf.cabac.stream.as_bytes();
      assert!(!bytes.is_empty(), "every wavefront row emits a substream");
      // The stop bit and zero alignment leave a nonzero final byte
      assert_ne!(bytes.last().unwrap(), &0u8);
      substreams += 1;
    }
  }
  assert_eq!(substreams, 8, "4 substream endings per tile");
}

#[test]
fn deep_output_window_with_short_open_gop_completes() {
  // A deeper output window than the GOP used to be able to deadlock on
  // open-GOP IRAPs; the extra cross-frame edge keeps it live.
  let cfg = Config {
    owf: 8,
    gop_len: 4,
    open_gop: true,
    intra_period: 8,
    threads: 4,
    ..base_cfg()
  };
  let out = encode_sequence(&cfg, 16);
  assert_eq!(out.len(), 16);
  for data in &out {
    assert!(!data.is_empty());
  }
}

#[test]
fn ibc_copies_self_similar_content() {
  // A picture tiled from one 8x8 pattern: for blocks past the first the
  // hash search finds exact copies, so the mode decision should take
  // block copy over intra somewhere.
  let mut cfg = Config { ibc: 3, sao_type: SaoType::Off, deblock_enable: false,
                         threads: 1, ..base_cfg() };
  cfg.wpp = false;
  let ctrl = Arc::new(EncoderControl::new(cfg).unwrap());
  let cfg = &ctrl.cfg;

  let mut pic = Picture::new(cfg.width, cfg.height, ChromaFormat::Csp420, 0);
  for y in 0..cfg.height {
    for x in 0..cfg.width {
      pic.planes[0].set(x, y, (((x % 8) * 13 + (y % 8) * 29) % 200) as u16 + 20);
    }
  }
  for plane in 1..3 {
    for y in 0..cfg.height / 2 {
      for x in 0..cfg.width / 2 {
        pic.planes[plane].set(x, y, (((x % 4) * 11 + (y % 4) * 7) % 200) as u16 + 20);
      }
    }
  }

  let qp = cfg.qp;
  let lambda = 0.57 * 2f64.powf((qp - 12) as f64 / 3.0);
  let params = Arc::new(FrameParams {
    num: 0,
    poc: 0,
    gop_offset: 0,
    slicetype: tinyvvc::config::SliceType::I,
    pictype: tinyvvc::config::PicType::IdrNLp,
    is_irap: true,
    irap_poc: 0,
    width: cfg.width,
    height: cfg.height,
    bitdepth: cfg.bitdepth,
    has_chroma: true,
    chroma_scale_x: 1,
    chroma_scale_y: 1,
    qp: qp,
    lambda: lambda,
    lambda_sqrt: lambda.sqrt(),
    max_qp_delta_depth: -1,
    refs: tinyvvc::reflist::RefList::new(),
    ref_lx: [Vec::new(), Vec::new()],
    roi: None,
    aq_offsets: Vec::new(),
    jccr_sign: false,
    lmcs: None,
  });
  let fe = build_frame_encode(&ctrl, params, Arc::new(pic));
  let tile = fe.tiles[0].clone();
  for id in 0..tile.lcu_order.len() {
    ctu::worker_search_lcu(&ctrl, &fe, &tile, id);
  }

  let cu_array = fe.cu_array.lock().unwrap();
  let mut ibc_cus = 0;
  for y in (0..cfg.height).step_by(32) {
    for x in (0..cfg.width).step_by(32) {
      if cu_array.at(x, y).cu_type == CU_IBC {
        ibc_cus += 1;
      }
    }
  }
  assert!(ibc_cus > 0, "self-similar content should pick block copy somewhere");
}

#[test]
fn mismatched_picture_size_is_bad_input() {
  let cfg = base_cfg();
  let mut enc = Encoder::new(cfg).unwrap();
  let wrong = Picture::new(64, 64, ChromaFormat::Csp420, 0);
  assert!(matches!(enc.encode_one_frame(wrong), Err(Error::BadInput(_))));
}

#[test]
fn roi_file_and_api_roi_conflict() {
  let mut roi_file = tempfile::NamedTempFile::new().unwrap();
  // One delta per frame area: 2x2 map of +4
  writeln!(roi_file, "2 2 4 4 4 4").unwrap();

  let mut cfg = base_cfg();
  cfg.roi.file_path = Some(roi_file.path().to_path_buf());
  cfg.roi.format = Some(RoiFormat::Txt);

  let mut enc = Encoder::new(cfg.clone()).unwrap();
  let mut pic = make_picture(&cfg, 0);
  pic.roi = Some(RoiMap { width: 2, height: 2, dqp: vec![1; 4] });
  assert!(matches!(enc.encode_one_frame(pic), Err(Error::BadConfig(_))));

  // Without the API-side map the file path works
  let mut enc = Encoder::new(cfg.clone()).unwrap();
  enc.encode_one_frame(make_picture(&cfg, 0)).unwrap();
  enc.flush();
  assert!(enc.output_pull().unwrap().is_some());
}

#[test]
fn malformed_roi_file_fails_the_frame() {
  let mut roi_file = tempfile::NamedTempFile::new().unwrap();
  writeln!(roi_file, "not numbers").unwrap();

  let mut cfg = base_cfg();
  cfg.roi.file_path = Some(roi_file.path().to_path_buf());
  cfg.roi.format = Some(RoiFormat::Txt);

  let mut enc = Encoder::new(cfg.clone()).unwrap();
  assert!(matches!(
    enc.encode_one_frame(make_picture(&cfg, 0)),
    Err(Error::BadInput(_))
  ));
}

#[test]
fn alf_and_lmcs_paths_encode() {
  let cfg = Config {
    alf_type: tinyvvc::config::AlfType::Full,
    lmcs_enable: true,
    owf: 1,
    ..base_cfg()
  };
  let out = encode_sequence(&cfg, 4);
  assert_eq!(out.len(), 4);
  let out2 = encode_sequence(&cfg, 4);
  assert_eq!(out, out2);
}

#[test]
fn chroma_444_encodes() {
  let cfg = Config { chroma_format: ChromaFormat::Csp444, ..base_cfg() };
  let mut enc = Encoder::new(cfg.clone()).unwrap();
  let mut pic = Picture::new(cfg.width, cfg.height, ChromaFormat::Csp444, 0);
  for plane in 0..3 {
    let p = &mut pic.planes[plane];
    for y in 0..p.height {
      for x in 0..p.width {
        p.set(x, y, ((x * 3 + y * 7 + plane * 10) % 255) as u16);
      }
    }
  }
  enc.encode_one_frame(pic).unwrap();
  enc.flush();
  assert!(enc.output_pull().unwrap().is_some());
}
