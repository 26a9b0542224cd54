// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// Context-adaptive binary arithmetic coder.
//
// The engine keeps the arithmetic interval in (low, range) with range held
// in [256, 510] between bins. Completed bytes cannot be emitted eagerly
// because a later addition to `low` may carry into them, so the most
// recent byte (and any run of 0xFF bytes after it) is parked in
// buffered_byte / num_buffered_bytes until a byte that cannot be carried
// into comes along.
//
// In counting mode (`only_count`) nothing reaches the output stream; the
// byte counter still advances so that tell() reports the exact bit cost.
// The ALF decision pass runs entire CTUs through the coder this way.

use crate::bitstream::Bitstream;
use crate::context::{
  entropy_bits, ContextSet, LPS_TABLE, RENORM_TABLE,
};

// Truncated-binary prefix lengths for alphabet sizes up to 256;
// larger alphabets fall back to a loop.
const TB_MAX: [u8; 257] = {
  let mut t = [0u8; 257];
  let mut n = 2;
  while n <= 256 {
    let mut log = 0;
    while (1 << (log + 1)) <= n {
      log += 1;
    }
    t[n] = log as u8;
    n += 1;
  }
  t[1] = 0;
  t
};

#[derive(Clone)]
pub struct Cabac {
  low: u32,
  range: u32,
  bits_left: i32,
  num_buffered_bytes: u32,
  buffered_byte: u32,

  /// Index of the context model the next regular bin will use.
  pub cur_ctx: usize,
  pub ctx: ContextSet,

  /// Count bytes instead of emitting them.
  pub only_count: bool,
  /// Whether regular bins adapt their context model.
  pub update: bool,

  pub stream: Bitstream,
}

impl Cabac {
  pub fn new(ctx: ContextSet) -> Self {
    let mut cabac = Cabac {
      low: 0,
      range: 510,
      bits_left: 23,
      num_buffered_bytes: 0,
      buffered_byte: 0xFF,
      cur_ctx: 0,
      ctx: ctx,
      only_count: false,
      update: false,
      stream: Bitstream::new(),
    };
    cabac.start();
    cabac
  }

  /// Reset the arithmetic state for a new substream. Contexts and the
  /// output stream are left alone.
  pub fn start(&mut self) {
    self.low = 0;
    self.range = 510;
    self.bits_left = 23;
    self.num_buffered_bytes = 0;
    self.buffered_byte = 0xFF;
    self.only_count = false;
  }

  pub fn range(&self) -> u32 {
    self.range
  }

  /// Bits produced so far, including bytes still parked in the carry
  /// chain and the fraction pending in `low`.
  pub fn tell(&self) -> u64 {
    self.stream.tell()
      + 8 * self.num_buffered_bytes as u64
      + (23 - self.bits_left) as u64
  }

  fn emit_byte(&mut self, byte: u32) {
    // The stream is byte aligned for the whole life of a substream;
    // a failure here is a broken caller, not a recoverable condition.
    self.stream.put_byte(byte as u8).expect("CABAC output must stay byte aligned");
  }

  // Move completed bytes out of `low` into the carry chain and onwards
  // to the stream.
  fn write(&mut self) {
    let lead_byte = self.low >> (24 - self.bits_left);
    self.bits_left += 8;
    debug_assert!(self.bits_left < 32);
    self.low &= 0xFFFF_FFFFu32 >> self.bits_left;

    if self.only_count {
      self.num_buffered_bytes += 1;
      return;
    }

    if lead_byte == 0xFF {
      // This byte may still receive a carry, hold on to it.
      self.num_buffered_bytes += 1;
    } else if self.num_buffered_bytes > 0 {
      let carry = lead_byte >> 8;
      let byte = self.buffered_byte + carry;
      self.buffered_byte = lead_byte & 0xFF;
      self.emit_byte(byte);

      let byte = (0xFF + carry) & 0xFF;
      while self.num_buffered_bytes > 1 {
        self.emit_byte(byte);
        self.num_buffered_bytes -= 1;
      }
    } else {
      self.num_buffered_bytes = 1;
      self.buffered_byte = lead_byte;
    }
  }

  /// Encode one regular bin with the model selected by `cur_ctx`.
  pub fn encode_bin(&mut self, bin_value: u32) {
    let model = self.ctx.models[self.cur_ctx];
    let lps = LPS_TABLE[model.state() as usize][((self.range >> 6) & 3) as usize] as u32;

    self.range -= lps;

    if (bin_value != 0) as u8 != model.mps() {
      let num_bits = RENORM_TABLE[(lps >> 3) as usize] as i32;
      self.low = (self.low + self.range) << num_bits;
      self.range = lps << num_bits;

      self.bits_left -= num_bits;
      if self.bits_left < 12 {
        self.write();
      }
      if self.update {
        self.ctx.models[self.cur_ctx].update_lps();
      }
    } else {
      if self.range < 256 {
        self.low <<= 1;
        self.range <<= 1;
        self.bits_left -= 1;

        if self.bits_left < 12 {
          self.write();
        }
      }
      if self.update {
        self.ctx.models[self.cur_ctx].update_mps();
      }
    }
  }

  pub fn encode_bin_ctx(&mut self, ctx: usize, bin_value: u32) {
    self.cur_ctx = ctx;
    self.encode_bin(bin_value);
  }

  /// Encode one bypass (equiprobable) bin.
  pub fn encode_bin_ep(&mut self, bin_value: u32) {
    self.low <<= 1;
    if bin_value != 0 {
      self.low += self.range;
    }
    self.bits_left -= 1;

    if self.bits_left < 12 {
      self.write();
    }
  }

  // Fast path for a run of bypass bins when the interval is exactly a
  // power of two: whole bytes of bins can be placed into `low` at once.
  fn encode_aligned_bins_ep(&mut self, bin_values: u32, num_bins: i32) {
    let mut rem_bins = num_bins;
    while rem_bins > 0 {
      let bins_to_code = rem_bins.min(8);
      let bin_mask = (1u32 << bins_to_code) - 1;
      let new_bins = (bin_values >> (rem_bins - bins_to_code)) & bin_mask;
      // range is known to be 256
      self.low = (self.low << bins_to_code) + (new_bins << 8);
      rem_bins -= bins_to_code;
      self.bits_left -= bins_to_code;
      if self.bits_left < 12 {
        self.write();
      }
    }
  }

  /// Encode the `num_bins` low bits of `bin_values` as bypass bins,
  /// most significant first.
  pub fn encode_bins_ep(&mut self, mut bin_values: u32, mut num_bins: i32) {
    assert!(num_bins <= 32);
    if self.range == 256 {
      self.encode_aligned_bins_ep(bin_values, num_bins);
      return;
    }

    while num_bins > 8 {
      num_bins -= 8;
      let pattern = bin_values >> num_bins;
      self.low <<= 8;
      self.low += self.range * pattern;
      bin_values -= pattern << num_bins;
      self.bits_left -= 8;

      if self.bits_left < 12 {
        self.write();
      }
    }

    self.low <<= num_bins;
    self.low += self.range * bin_values;
    self.bits_left -= num_bins;

    if self.bits_left < 12 {
      self.write();
    }
  }

  /// Encode a terminating bin. A one-bin flushes seven bits so that the
  /// substream can be cut immediately after.
  pub fn encode_bin_trm(&mut self, bin_value: u32) {
    self.range -= 2;
    if bin_value != 0 {
      self.low += self.range;
      self.low <<= 7;
      self.range = 2 << 7;
      self.bits_left -= 7;
    } else if self.range >= 256 {
      return;
    } else {
      self.low <<= 1;
      self.range <<= 1;
      self.bits_left -= 1;
    }

    if self.bits_left < 12 {
      self.write();
    }
  }

  /// Flush the remaining interval state into the stream.
  pub fn finish(&mut self) {
    assert!(self.bits_left <= 32);

    if (self.low >> (32 - self.bits_left)) != 0 {
      self.emit_byte(self.buffered_byte + 1);
      while self.num_buffered_bytes > 1 {
        self.emit_byte(0);
        self.num_buffered_bytes -= 1;
      }
      self.low -= 1 << (32 - self.bits_left);
    } else {
      if self.num_buffered_bytes > 0 {
        self.emit_byte(self.buffered_byte);
      }
      while self.num_buffered_bytes > 1 {
        self.emit_byte(0xFF);
        self.num_buffered_bytes -= 1;
      }
    }

    let bits = (24 - self.bits_left) as u32;
    self.stream.put(self.low >> 8, bits);
  }

  // ----- Binarizations ---------------------------------------------------

  /// Unary code with a cap, regular-coded. The first bin uses `ctx`, the
  /// continuation bins use `ctx + ctx_offset`.
  pub fn write_unary_max_symbol(
    &mut self,
    ctx: usize,
    ctx_offset: usize,
    mut symbol: u32,
    max_symbol: u32,
  ) {
    let code_last = max_symbol > symbol;

    assert!(symbol <= max_symbol);

    if max_symbol == 0 {
      return;
    }

    self.encode_bin_ctx(ctx, (symbol != 0) as u32);

    if symbol == 0 {
      return;
    }

    self.cur_ctx = ctx + ctx_offset;
    while {
      symbol -= 1;
      symbol != 0
    } {
      self.encode_bin(1);
    }
    if code_last {
      self.encode_bin(0);
    }
  }

  /// Unary code with a cap, bypass-coded. This doubles as Truncated Rice
  /// with a zero Rice parameter.
  pub fn write_unary_max_symbol_ep(&mut self, mut symbol: u32, max_symbol: u32) {
    let code_last = max_symbol > symbol;

    assert!(symbol <= max_symbol);

    self.encode_bin_ep((symbol != 0) as u32);

    if symbol == 0 {
      return;
    }

    while {
      symbol -= 1;
      symbol != 0
    } {
      self.encode_bin_ep(1);
    }
    if code_last {
      self.encode_bin_ep(0);
    }
  }

  /// Truncated binary code over an alphabet of `max_value` symbols
  /// (`symbol` in 0..max_value). The short codewords go to the low
  /// symbols.
  pub fn encode_trunc_bin(&mut self, symbol: u32, max_value: u32) {
    assert!(max_value >= 1 && symbol < max_value.max(1));

    let thresh: i32;
    if max_value > 256 {
      let mut thresh_val = 1u32 << 8;
      let mut t = 8;
      while thresh_val <= max_value {
        t += 1;
        thresh_val <<= 1;
      }
      thresh = t - 1;
    } else {
      thresh = TB_MAX[max_value as usize] as i32;
    }

    let val = 1u32 << thresh;
    let b = max_value - val;

    if symbol < val - b {
      self.encode_bins_ep(symbol, thresh);
    } else {
      self.encode_bins_ep(symbol + (val - b), thresh + 1);
    }
  }

  /// Exp-Golomb of order `count`, bypass-coded.
  pub fn write_ep_ex_golomb(&mut self, mut symbol: u32, mut count: u32) {
    let mut bins = 0u32;
    let mut num_bins = 0i32;

    while symbol >= (1 << count) {
      bins = 2 * bins + 1;
      num_bins += 1;
      symbol -= 1 << count;
      count += 1;
    }
    bins *= 2;
    num_bins += 1;

    bins = (bins << count) | symbol;
    num_bins += count as i32;

    assert!(num_bins <= 32);
    self.encode_bins_ep(bins, num_bins);
  }

  /// Coefficient remainder with a Rice parameter: truncated-Rice prefix
  /// below `cutoff`, Exp-Golomb style escape above it, with a hard cap on
  /// the prefix length for pathological coefficients.
  pub fn write_coeff_remain(&mut self, remainder: u32, rice_param: u32, cutoff: u32) {
    let threshold = cutoff << rice_param;
    let bins = remainder;

    if bins < threshold {
      let length = (bins >> rice_param) + 1;
      self.encode_bins_ep((1 << length) - 2, length as i32);
      self.encode_bins_ep(bins & ((1 << rice_param) - 1), rice_param as i32);
    } else {
      const MAX_LOG2_TR_DYNAMIC_RANGE: u32 = 15;
      let max_prefix_length = 32 - cutoff - MAX_LOG2_TR_DYNAMIC_RANGE;
      let mut prefix_length = 0u32;
      let code_value = (bins >> rice_param) - cutoff;
      let suffix_length;
      if code_value >= (1 << max_prefix_length) - 1 {
        prefix_length = max_prefix_length;
        suffix_length = MAX_LOG2_TR_DYNAMIC_RANGE;
      } else {
        while code_value > (2 << prefix_length) - 2 {
          prefix_length += 1;
        }
        suffix_length = prefix_length + rice_param + 1;
      }
      let total_prefix_length = prefix_length + cutoff;
      let bit_mask = (1u32 << rice_param) - 1;
      let prefix = (1u32 << total_prefix_length) - 1;
      let suffix = ((code_value - ((1 << prefix_length) - 1)) << rice_param) | (bins & bit_mask);
      self.encode_bins_ep(prefix, total_prefix_length as i32);
      self.encode_bins_ep(suffix, suffix_length as i32);
    }
  }

  // ----- Rate estimation --------------------------------------------------

  /// Fractional bit cost of coding `bin` in context `ctx` without
  /// touching any state.
  pub fn ctx_bits(&self, ctx: usize, bin: u8) -> f64 {
    entropy_bits(self.ctx.models[ctx].uc_state, bin)
  }
}

/// Replace the destination's context models with the source's.
pub fn copy_contexts(dst: &mut Cabac, src: &Cabac) {
  dst.ctx.copy_from(&src.ctx);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::SliceType;
  use crate::context::{ContextModel, NEXT_STATE_LPS, NEXT_STATE_MPS};

  fn fresh() -> Cabac {
    let mut c = Cabac::new(ContextSet::new(26, SliceType::I));
    c.update = true;
    c
  }

  #[test]
  fn terminating_bin_flush_bytes() {
    let mut c = fresh();
    c.encode_bin_trm(1);
    // A one-valued terminating bin flushes seven bits and leaves the
    // interval at 2 << 7.
    assert_eq!(c.range(), 256);
    c.finish();
    assert_eq!(c.stream.as_bytes(), &[0xFE]);

    // Substream trailing: stop bit plus zero alignment
    c.stream.put(1, 1);
    c.stream.align_zero();
    assert_eq!(c.stream.as_bytes(), &[0xFE, 0x80]);
  }

  #[test]
  fn range_stays_in_bounds_across_regular_bins() {
    let mut c = fresh();
    c.cur_ctx = 0;
    let mut x: u32 = 12345;
    for _ in 0..10000 {
      // Cheap LCG for a fixed pseudo-random bin pattern
      x = x.wrapping_mul(1103515245).wrapping_add(12345);
      c.cur_ctx = (x >> 16) as usize % crate::context::NUM_CONTEXTS;
      c.encode_bin((x >> 30) & 1);
      assert!(c.range() >= 256 && c.range() <= 510, "range {} escaped", c.range());
    }
  }

  #[test]
  fn lps_state_transition_follows_table() {
    // Code an LPS from the most confident adaptive state and check the
    // transition against the shared table.
    let mut c = fresh();
    let uc = (62 << 1) | 1; // state 62, MPS 1
    c.ctx.models[0] = ContextModel { uc_state: uc };
    c.cur_ctx = 0;
    c.encode_bin(0); // LPS
    assert_eq!(c.ctx.models[0].uc_state, NEXT_STATE_LPS[uc as usize]);
    // and the MPS did not flip
    assert_eq!(c.ctx.models[0].mps(), 1);
  }

  #[test]
  fn mps_flips_only_from_state_zero() {
    let mut c = fresh();
    c.ctx.models[0] = ContextModel { uc_state: (0 << 1) | 1 }; // state 0, MPS 1
    c.cur_ctx = 0;
    c.encode_bin(0); // LPS from state 0
    assert_eq!(c.ctx.models[0].mps(), 0, "MPS must flip from state 0");
    assert_eq!(c.ctx.models[0].uc_state, NEXT_STATE_LPS[1]);

    c.ctx.models[0] = ContextModel { uc_state: (5 << 1) | 1 };
    c.encode_bin(1); // MPS
    assert_eq!(c.ctx.models[0].uc_state, NEXT_STATE_MPS[(5 << 1) | 1]);
  }

  #[test]
  fn trunc_bin_short_codewords() {
    // Alphabet of 1: nothing to signal
    let mut c = fresh();
    let before = c.tell();
    c.encode_trunc_bin(0, 1);
    assert_eq!(c.tell(), before);

    // Alphabet of 3: '0', '10', '11'
    let bits = |f: &dyn Fn(&mut Cabac)| {
      let mut c = fresh();
      let t0 = c.tell();
      f(&mut c);
      c.tell() - t0
    };
    assert_eq!(bits(&|c| c.encode_trunc_bin(0, 3)), 1);
    assert_eq!(bits(&|c| c.encode_trunc_bin(1, 3)), 2);
    assert_eq!(bits(&|c| c.encode_trunc_bin(2, 3)), 2);
  }

  #[test]
  fn counting_mode_emits_nothing_but_tracks_bits() {
    let mut a = fresh();
    let mut b = fresh();
    b.only_count = true;

    for i in 0..500u32 {
      a.cur_ctx = (i % 30) as usize;
      b.cur_ctx = (i % 30) as usize;
      a.encode_bin(i & 1);
      b.encode_bin(i & 1);
      a.encode_bin_ep(i >> 1 & 1);
      b.encode_bin_ep(i >> 1 & 1);
    }

    assert_eq!(b.stream.tell(), 0, "counting mode must not touch the stream");
    assert_eq!(a.tell(), b.tell(), "counting mode must track the bit position");
    assert!(a.stream.tell() > 0);
  }

  #[test]
  fn unary_max_symbol_bit_lengths() {
    let bits = |s: u32, max: u32| {
      let mut c = fresh();
      let t0 = c.tell();
      c.write_unary_max_symbol_ep(s, max);
      c.tell() - t0
    };
    assert_eq!(bits(0, 7), 1);
    assert_eq!(bits(3, 7), 4); // 1110
    assert_eq!(bits(7, 7), 7); // 1111111 with no trailing zero at the cap
  }
}
