// Intra block copy hash acceleration.
//
// Previously coded 8x8 blocks of the current picture are indexed by a
// CRC32C over their samples (luma plus both chroma blocks when present).
// Each CTU row keeps its own map so that lookups never race with inserts
// from other rows; the pixel data itself lives in the rolling IBC buffer.

use std::collections::HashMap;

use crate::config::ChromaFormat;
use crate::picture::Picture;

pub const HASH_BLOCK_SIZE: usize = 8;

// CRC32C (Castagnoli). Table-driven software version; a hardware build
// would swap this behind the same signature.
fn crc32c_table() -> &'static [u32; 256] {
  static TABLE: std::sync::OnceLock<[u32; 256]> = std::sync::OnceLock::new();
  TABLE.get_or_init(|| {
    let mut table = [0u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
      let mut crc = i as u32;
      for _ in 0..8 {
        crc = if crc & 1 != 0 { (crc >> 1) ^ 0x82F6_3B78 } else { crc >> 1 };
      }
      *entry = crc;
    }
    table
  })
}

fn crc32c_update(mut crc: u32, bytes: impl Iterator<Item = u8>) -> u32 {
  let table = crc32c_table();
  for b in bytes {
    crc = table[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
  }
  crc
}

/// CRC32C over an NxN sample block; both bytes of each sample go in so
/// that 10-bit content hashes fully.
pub fn crc32c_block(pic: &Picture, plane: usize, x: usize, y: usize, n: usize) -> u32 {
  let p = pic.plane(plane);
  let mut crc = !0u32;
  for row in 0..n {
    let samples = &p.data[(y + row) * p.stride + x..(y + row) * p.stride + x + n];
    crc = crc32c_update(crc, samples.iter().flat_map(|&s| s.to_le_bytes()));
  }
  !crc
}

/// Packed block position, x in the high half
pub fn pack_pos(x: usize, y: usize) -> u32 {
  (((x & 0xFFFF) as u32) << 16) | ((y & 0xFFFF) as u32)
}

pub fn unpack_pos(packed: u32) -> (usize, usize) {
  ((packed >> 16) as usize, (packed & 0xFFFF) as usize)
}

pub struct IbcHashMaps {
  /// One chained map per CTU row
  rows: Vec<HashMap<u32, Vec<u32>>>,
  /// Hash of the aligned 8x8 block at each grid position, for
  /// block-contiguity verification of larger matches
  pos_to_hash: Vec<u32>,
  pub pos_stride: usize,
}

impl IbcHashMaps {
  pub fn new(width: usize, height: usize, height_in_lcu: usize) -> Self {
    let pos_stride = width.div_ceil(HASH_BLOCK_SIZE);
    let pos_rows = height.div_ceil(HASH_BLOCK_SIZE);
    IbcHashMaps {
      rows: (0..height_in_lcu).map(|_| HashMap::new()).collect(),
      pos_to_hash: vec![0; pos_stride * pos_rows],
      pos_stride: pos_stride,
    }
  }

  pub fn clear(&mut self) {
    for m in &mut self.rows {
      m.clear();
    }
    self.pos_to_hash.iter_mut().for_each(|h| *h = 0);
  }

  pub fn insert(&mut self, lcu_row: usize, crc: u32, packed_pos: u32) {
    self.rows[lcu_row].entry(crc).or_default().push(packed_pos);
  }

  pub fn lookup(&self, lcu_row: usize, crc: u32) -> &[u32] {
    self.rows[lcu_row].get(&crc).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn pos_hash(&self, grid_x: usize, grid_y: usize) -> u32 {
    self.pos_to_hash[grid_y * self.pos_stride + grid_x]
  }

  fn set_pos_hash(&mut self, grid_x: usize, grid_y: usize, crc: u32) {
    self.pos_to_hash[grid_y * self.pos_stride + grid_x] = crc;
  }
}

/// Hash one CTU of the source picture into its row's map.
///
/// Flat blocks (every row identical) are skipped off the aligned grid:
/// they would flood the chains without telling positions apart. The
/// half-block phases are inserted so that arbitrary self-copies can
/// still be found.
pub fn hash_lcu(
  maps: &mut IbcHashMaps,
  source: &Picture,
  lcu_px_x: usize,
  lcu_px_y: usize,
  block_width: usize,
  block_height: usize,
  chroma: Option<ChromaFormat>,
) {
  let lcu_row = lcu_px_y / crate::cu::LCU_WIDTH;
  let sx = source.chroma_scale_x;
  let sy = source.chroma_scale_y;
  let step_x = HASH_BLOCK_SIZE >> sx;
  let step_y = HASH_BLOCK_SIZE >> sy;

  let mut yy = 0;
  while yy + HASH_BLOCK_SIZE <= block_height {
    let mut xx = 0;
    while xx + HASH_BLOCK_SIZE <= block_width {
      let cur_x = lcu_px_x + xx;
      let cur_y = lcu_px_y + yy;

      let luma = source.y();
      let first = luma.row(cur_y)[cur_x..cur_x + HASH_BLOCK_SIZE].to_vec();
      let mut same_data = true;
      for dy in 1..HASH_BLOCK_SIZE {
        if luma.row(cur_y + dy)[cur_x..cur_x + HASH_BLOCK_SIZE] != first[..] {
          same_data = false;
          break;
        }
      }

      let aligned = xx % HASH_BLOCK_SIZE == 0 && yy % HASH_BLOCK_SIZE == 0;
      if !same_data || aligned {
        let mut crc = crc32c_block(source, 0, cur_x, cur_y, HASH_BLOCK_SIZE);
        if chroma.is_some() {
          crc = crc.wrapping_add(crc32c_block(source, 1, cur_x >> sx, cur_y >> sy, 4));
          crc = crc.wrapping_add(crc32c_block(source, 2, cur_x >> sx, cur_y >> sy, 4));
        }
        if aligned {
          maps.set_pos_hash(cur_x / HASH_BLOCK_SIZE, cur_y / HASH_BLOCK_SIZE, crc);
        }
        maps.insert(lcu_row, crc, pack_pos(cur_x, cur_y));
      }

      xx += step_x;
    }
    yy += step_y;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cu::LCU_WIDTH;

  // A 64x64 picture tiled from one 8x8 pattern: every aligned 8x8 block
  // equals every other one.
  fn self_similar_picture() -> Picture {
    let mut pic = Picture::new(64, 64, ChromaFormat::Csp420, 0);
    for y in 0..64 {
      for x in 0..64 {
        let v = (((x % 8) * 8 + (y % 8) * 3) % 251) as u16;
        pic.planes[0].set(x, y, v);
      }
    }
    for plane in 1..3 {
      for y in 0..32 {
        for x in 0..32 {
          let v = (((x % 4) * 5 + (y % 4) * 7) % 251) as u16;
          pic.planes[plane].set(x, y, v);
        }
      }
    }
    pic
  }

  #[test]
  fn self_similar_source_hits_for_every_block_past_the_first() {
    let pic = self_similar_picture();
    let mut maps = IbcHashMaps::new(64, 64, 64 / LCU_WIDTH);
    hash_lcu(&mut maps, &pic, 0, 0, 64, 64, Some(ChromaFormat::Csp420));

    for by in (0..64).step_by(8) {
      for bx in (0..64).step_by(8) {
        if bx == 0 && by == 0 {
          continue;
        }
        let crc = maps.pos_hash(bx / 8, by / 8);
        let hits = maps.lookup(0, crc);
        // At least one hit that is not the block itself
        assert!(
          hits.iter().any(|&h| h != pack_pos(bx, by)),
          "no foreign hash hit for block {},{}", bx, by
        );
      }
    }
  }

  #[test]
  fn distinct_blocks_rarely_collide() {
    let mut pic = Picture::new(64, 64, ChromaFormat::Csp420, 0);
    for y in 0..64 {
      for x in 0..64 {
        pic.planes[0].set(x, y, ((x * 31 + y * 97) % 255) as u16);
      }
    }
    let a = crc32c_block(&pic, 0, 0, 0, 8);
    let b = crc32c_block(&pic, 0, 8, 0, 8);
    let c = crc32c_block(&pic, 0, 0, 8, 8);
    assert!(a != b && b != c && a != c);
  }

  #[test]
  fn pack_unpack_roundtrip() {
    let p = pack_pos(1234, 567);
    assert_eq!(unpack_pos(p), (1234, 567));
  }
}
