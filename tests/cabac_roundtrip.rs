// Encode/decode identity for the arithmetic coder.
//
// The decoder here exists only for these tests. It is the standard
// H.265-family CABAC decoder driven by the same state tables as the
// encoder, so any sequence of bins the encoder emits must come back out
// bit for bit.

use proptest::prelude::*;

use tinyvvc::cabac::Cabac;
use tinyvvc::config::SliceType;
use tinyvvc::context::{ContextSet, LPS_TABLE, NUM_CONTEXTS, RENORM_TABLE};

struct CabacReader<'a> {
  data: &'a [u8],
  pos: usize,
  value: u32,
  range: u32,
  bits_needed: i32,
  ctx: ContextSet,
}

impl<'a> CabacReader<'a> {
  fn new(data: &'a [u8], ctx: ContextSet) -> Self {
    let mut r = CabacReader {
      data: data,
      pos: 0,
      value: 0,
      range: 510,
      bits_needed: 8,
      ctx: ctx,
    };
    r.value = (r.next_byte() as u32) << 8 | r.next_byte() as u32;
    r.bits_needed -= 16;
    r
  }

  // Reading past the end yields zero bytes, like a decoder running into
  // the next NAL's start code prefix.
  fn next_byte(&mut self) -> u8 {
    let b = self.data.get(self.pos).copied().unwrap_or(0);
    self.pos += 1;
    b
  }

  fn get(&mut self, ctx_idx: usize) -> u32 {
    let model = self.ctx.models[ctx_idx];
    let lps = LPS_TABLE[model.state() as usize][((self.range >> 6) & 3) as usize] as u32;
    self.range -= lps;

    let scaled_range = self.range << 7;
    let bin;
    if self.value < scaled_range {
      // MPS path
      bin = model.mps() as u32;
      self.ctx.models[ctx_idx].update_mps();

      if scaled_range < (256 << 7) {
        self.range = scaled_range >> 6;
        self.value <<= 1;
        self.bits_needed += 1;
        if self.bits_needed == 0 {
          self.bits_needed = -8;
          self.value |= self.next_byte() as u32;
        }
      }
    } else {
      // LPS path
      self.value -= scaled_range;
      let num_bits = RENORM_TABLE[(lps >> 3) as usize] as i32;
      self.value <<= num_bits;
      self.range = lps << num_bits;

      bin = (1 - model.mps()) as u32;
      self.ctx.models[ctx_idx].update_lps();

      self.bits_needed += num_bits;
      if self.bits_needed >= 0 {
        self.value |= (self.next_byte() as u32) << self.bits_needed;
        self.bits_needed -= 8;
      }
    }
    bin
  }

  fn get_bypass(&mut self) -> u32 {
    self.value <<= 1;
    self.bits_needed += 1;
    if self.bits_needed >= 0 {
      self.bits_needed = -8;
      self.value |= self.next_byte() as u32;
    }

    let scaled_range = self.range << 7;
    if self.value >= scaled_range {
      self.value -= scaled_range;
      1
    } else {
      0
    }
  }

  fn get_bypass_bits(&mut self, n: u32) -> u32 {
    let mut v = 0;
    for _ in 0..n {
      v = (v << 1) | self.get_bypass();
    }
    v
  }

  fn get_terminate(&mut self) -> u32 {
    self.range -= 2;
    let scaled_range = self.range << 7;
    if self.value >= scaled_range {
      1
    } else {
      if scaled_range < (256 << 7) {
        self.range = scaled_range >> 6;
        self.value <<= 1;
        self.bits_needed += 1;
        if self.bits_needed == 0 {
          self.bits_needed = -8;
          self.value |= self.next_byte() as u32;
        }
      }
      0
    }
  }

  // ----- Inverse binarizations ------------------------------------------

  fn get_unary_max_ep(&mut self, max_symbol: u32) -> u32 {
    // The first bin is present even for a zero cap
    if self.get_bypass() == 0 {
      return 0;
    }
    let mut symbol = 1;
    while symbol < max_symbol && self.get_bypass() == 1 {
      symbol += 1;
    }
    symbol
  }

  fn get_trunc_bin(&mut self, max_value: u32) -> u32 {
    let thresh = if max_value > 256 {
      let mut thresh_val = 1u32 << 8;
      let mut t = 8;
      while thresh_val <= max_value {
        t += 1;
        thresh_val <<= 1;
      }
      t - 1
    } else {
      let mut log = 0;
      while (1u32 << (log + 1)) <= max_value {
        log += 1;
      }
      log
    };

    let val = 1u32 << thresh;
    let b = max_value - val;
    let short_codewords = val - b;

    let v = self.get_bypass_bits(thresh);
    if v < short_codewords {
      v
    } else {
      let extra = self.get_bypass();
      v * 2 + extra - short_codewords
    }
  }

  fn get_ep_ex_golomb(&mut self, mut count: u32) -> u32 {
    let mut value = 0u32;
    while self.get_bypass() == 1 {
      value += 1 << count;
      count += 1;
    }
    value + self.get_bypass_bits(count)
  }
}

fn fresh_encoder() -> Cabac {
  let mut c = Cabac::new(ContextSet::new(30, SliceType::B));
  c.update = true;
  c
}

fn finish_to_bytes(mut cabac: Cabac) -> Vec<u8> {
  cabac.encode_bin_trm(1);
  cabac.finish();
  cabac.stream.put(1, 1);
  cabac.stream.align_zero();
  cabac.stream.take_bytes()
}

#[derive(Debug, Clone)]
enum Op {
  Regular { ctx: usize, bin: u32 },
  Bypass { bin: u32 },
  BypassBits { value: u32, n: u32 },
  UnaryMaxEp { symbol: u32, max: u32 },
  TruncBin { symbol: u32, max: u32 },
  ExGolomb { symbol: u32, k: u32 },
  CoeffRemain { value: u32, rice: u32 },
}

fn run_roundtrip(ops: &[Op]) {
  let mut enc = fresh_encoder();
  let start_ctx = enc.ctx.clone();

  for op in ops {
    match *op {
      Op::Regular { ctx, bin } => enc.encode_bin_ctx(ctx, bin),
      Op::Bypass { bin } => enc.encode_bin_ep(bin),
      Op::BypassBits { value, n } => enc.encode_bins_ep(value, n as i32),
      Op::UnaryMaxEp { symbol, max } => enc.write_unary_max_symbol_ep(symbol, max),
      Op::TruncBin { symbol, max } => enc.encode_trunc_bin(symbol, max),
      Op::ExGolomb { symbol, k } => enc.write_ep_ex_golomb(symbol, k),
      Op::CoeffRemain { value, rice } => enc.write_coeff_remain(value, rice, 3),
    }
  }

  let bytes = finish_to_bytes(enc);
  let mut dec = CabacReader::new(&bytes, start_ctx);

  for (i, op) in ops.iter().enumerate() {
    match *op {
      Op::Regular { ctx, bin } => {
        assert_eq!(dec.get(ctx), bin, "regular bin {} diverged", i);
      }
      Op::Bypass { bin } => {
        assert_eq!(dec.get_bypass(), bin, "bypass bin {} diverged", i);
      }
      Op::BypassBits { value, n } => {
        assert_eq!(dec.get_bypass_bits(n), value, "bypass chunk {} diverged", i);
      }
      Op::UnaryMaxEp { symbol, max } => {
        assert_eq!(dec.get_unary_max_ep(max), symbol, "unary {} diverged", i);
      }
      Op::TruncBin { symbol, max } => {
        assert_eq!(dec.get_trunc_bin(max), symbol, "trunc-bin {} diverged", i);
      }
      Op::ExGolomb { symbol, k } => {
        assert_eq!(dec.get_ep_ex_golomb(k), symbol, "exp-golomb {} diverged", i);
      }
      Op::CoeffRemain { value, rice } => {
        // Truncated-Rice prefix; above the cutoff the codeword grows
        // Exp-Golomb style, terminated by the guaranteed-zero MSB of
        // the suffix, with a hard prefix ceiling.
        let cutoff = 3u32;
        let max_prefix = 32 - cutoff - 15;
        let mut q = 0;
        while q < cutoff + max_prefix {
          if dec.get_bypass() == 0 {
            break;
          }
          q += 1;
        }
        let decoded = if q < cutoff {
          (q << rice) + dec.get_bypass_bits(rice)
        } else {
          let pl = q - cutoff;
          let remaining = if q == cutoff + max_prefix {
            dec.get_bypass_bits(15)
          } else {
            dec.get_bypass_bits(pl + rice)
          };
          remaining + ((((1u32 << pl) - 1 + cutoff) as u32) << rice)
        };
        assert_eq!(decoded, value, "coeff remainder {} diverged", i);
      }
    }
  }

  // The terminating bin closes the substream
  assert_eq!(dec.get_terminate(), 1, "terminating bin lost");
}

#[test]
fn lone_terminating_bin() {
  let enc = fresh_encoder();
  let bytes = finish_to_bytes(enc);
  assert_eq!(bytes, vec![0xFE, 0x80]);

  let mut dec = CabacReader::new(&bytes, ContextSet::new(30, SliceType::B));
  assert_eq!(dec.get_terminate(), 1);
}

#[test]
fn regular_bins_roundtrip_over_every_context() {
  let mut ops = Vec::new();
  let mut x: u32 = 987654321;
  for i in 0..5000 {
    x = x.wrapping_mul(1103515245).wrapping_add(12345);
    ops.push(Op::Regular {
      ctx: i % NUM_CONTEXTS,
      bin: (x >> 30) & 1,
    });
  }
  run_roundtrip(&ops);
}

#[test]
fn mixed_bin_kinds_roundtrip() {
  let mut ops = Vec::new();
  let mut x: u32 = 22222;
  for i in 0..2000 {
    x = x.wrapping_mul(1103515245).wrapping_add(12345);
    let r = (x >> 24) % 7;
    ops.push(match r {
      0 => Op::Regular { ctx: (x as usize >> 8) % NUM_CONTEXTS, bin: x & 1 },
      1 => Op::Bypass { bin: x & 1 },
      2 => Op::BypassBits { value: (x >> 9) & 0xFFFF, n: 16 },
      3 => Op::UnaryMaxEp { symbol: (x >> 9) % 8, max: 7 },
      4 => Op::TruncBin { symbol: (x >> 9) % 61, max: 61 },
      5 => Op::ExGolomb { symbol: (x >> 9) % 100_000, k: i as u32 % 3 },
      // Coefficient magnitudes stay inside the 15-bit dynamic range
      _ => Op::CoeffRemain { value: (x >> 9) % 32_768, rice: (x >> 7) & 3 },
    });
  }
  run_roundtrip(&ops);
}

#[test]
fn carry_chain_survives_long_ff_runs() {
  // Stack the odds towards emitting long runs of 0xFF: highly biased
  // contexts coding their MPS keep the interval tight.
  let mut ops = Vec::new();
  for i in 0..20000 {
    ops.push(Op::Regular { ctx: 0, bin: 1 });
    if i % 97 == 0 {
      ops.push(Op::Bypass { bin: 1 });
    }
  }
  run_roundtrip(&ops);
}

#[test]
fn pathological_coefficient_remainders() {
  // Values beyond the escape threshold exercise the prefix-ceiling
  // path (hit with a zero Rice parameter from 16386 upwards).
  let ops: Vec<Op> = [0u32, 1, 2, 3, 4, 30, 31, 32, 100, 4095, 20000, 32000]
    .iter()
    .flat_map(|&v| (0..4).map(move |rice| Op::CoeffRemain { value: v, rice: rice }))
    .collect();
  run_roundtrip(&ops);
}

proptest! {
  #[test]
  fn unary_max_roundtrips(max in 0u32..=32, sel in 0u32..=1000) {
    let symbol = if max == 0 { 0 } else { sel % (max + 1) };
    run_roundtrip(&[
      Op::UnaryMaxEp { symbol: symbol, max: max },
      // Trailing op so a truncated codeword would desynchronize
      Op::BypassBits { value: 0x5A, n: 8 },
    ]);
  }

  #[test]
  fn ex_golomb_roundtrips(symbol in 0u32..(1 << 20), k in 0u32..=3) {
    run_roundtrip(&[
      Op::ExGolomb { symbol: symbol, k: k },
      Op::BypassBits { value: 0xA5, n: 8 },
    ]);
  }

  #[test]
  fn trunc_bin_roundtrips(max in 1u32..=1024, sel in 0u32..=100_000) {
    let symbol = sel % max;
    run_roundtrip(&[
      Op::TruncBin { symbol: symbol, max: max },
      Op::BypassBits { value: 0x3C, n: 8 },
    ]);
  }
}
