// Deblocking filter.
//
// Edges on the 8x8 grid that coincide with CU boundaries are smoothed
// with a strength derived from the coding modes and the QP of the two
// sides. Only the orchestration lives here; the per-edge kernel is the
// plain generic one.

use crate::cu::{CuArray, LCU_WIDTH};
use crate::picture::Picture;
use crate::util::clip;

// Beta / tc thresholds by QP, standard shape
const BETA_TABLE: [u8; 52] = [
  0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 6, 7, 8, 9, 10, 11, 12,
  13, 14, 15, 16, 17, 18, 20, 22, 24, 26, 28, 30, 32, 34, 36, 38, 40, 42,
  44, 46, 48, 50, 52, 54, 56, 58, 60, 62, 64,
];
const TC_TABLE: [u8; 54] = [
  0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1,
  1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 5, 5, 6, 6, 7, 8, 9, 10, 11,
  13, 14, 16, 18, 20, 22, 24,
];

fn filter_edge_luma(pic: &mut Picture, x: usize, y: usize, vertical: bool, len: usize,
                    qp: i32, bitdepth: u32) {
  let beta = (BETA_TABLE[clip(0, 51, qp) as usize] as i32) << (bitdepth - 8);
  let tc = (TC_TABLE[clip(0, 53, qp + 2) as usize] as i32) << (bitdepth - 8);
  if tc == 0 {
    return;
  }

  let plane = pic.plane_mut(0);
  let max_pixel = (1i32 << bitdepth) - 1;

  for i in 0..len {
    // Samples p1 p0 | q0 q1 across the edge
    let get = |d: i32, plane: &crate::picture::Plane| -> i32 {
      if vertical {
        plane.at((x as i32 + d - 1).clamp(0, plane.width as i32 - 1) as usize, y + i) as i32
      } else {
        plane.at(x + i, (y as i32 + d - 1).clamp(0, plane.height as i32 - 1) as usize) as i32
      }
    };
    let p1 = get(-1, plane);
    let p0 = get(0, plane);
    let q0 = get(1, plane);
    let q1 = get(2, plane);

    // Skip visually continuous edges
    if (p0 - q0).abs() >= beta {
      continue;
    }

    let delta = clip(-tc, tc, ((q0 - p0) * 4 + (p1 - q1) + 4) >> 3);
    let new_p0 = clip(0, max_pixel, p0 + delta);
    let new_q0 = clip(0, max_pixel, q0 - delta);

    if vertical {
      plane.set(x - 1, y + i, new_p0 as u16);
      plane.set(x, y + i, new_q0 as u16);
    } else {
      plane.set(x + i, y - 1, new_p0 as u16);
      plane.set(x + i, y, new_q0 as u16);
    }
  }
}

fn is_cu_boundary(cu_array: &CuArray, x: usize, y: usize, vertical: bool) -> bool {
  if vertical {
    if x == 0 {
      return false;
    }
    let cur = cu_array.at(x, y);
    let left = cu_array.at(x - 1, y);
    // Block edge, mode change or motion discontinuity
    cur.cu_type != left.cu_type
      || cur.mv != left.mv
      || x % cur.width() == 0
  } else {
    if y == 0 {
      return false;
    }
    let cur = cu_array.at(x, y);
    let above = cu_array.at(x, y - 1);
    cur.cu_type != above.cu_type
      || cur.mv != above.mv
      || y % cur.height() == 0
  }
}

/// Deblock one CTU. Runs after reconstruction, before the SAO edge
/// snapshot. The rightmost and bottommost edges of the CTU belong to the
/// next CTU over, exactly like every other edge that needs both sides.
pub fn deblock_lcu(
  pic: &mut Picture,
  cu_array: &CuArray,
  lcu_px_x: usize,
  lcu_px_y: usize,
  bitdepth: u32,
) {
  let width = pic.width;
  let height = pic.height;
  let x_end = (lcu_px_x + LCU_WIDTH).min(width);
  let y_end = (lcu_px_y + LCU_WIDTH).min(height);

  // Vertical edges first, then horizontal, both on the 8x8 grid
  for x in (lcu_px_x..x_end).step_by(8) {
    if x == 0 {
      continue;
    }
    for y in (lcu_px_y..y_end).step_by(8) {
      if is_cu_boundary(cu_array, x, y, true) {
        let qp = (cu_array.at(x, y).qp as i32 + cu_array.at(x - 1, y).qp as i32 + 1) >> 1;
        let len = (y_end - y).min(8);
        filter_edge_luma(pic, x, y, true, len, qp, bitdepth);
      }
    }
  }
  for y in (lcu_px_y..y_end).step_by(8) {
    if y == 0 {
      continue;
    }
    for x in (lcu_px_x..x_end).step_by(8) {
      if is_cu_boundary(cu_array, x, y, false) {
        let qp = (cu_array.at(x, y).qp as i32 + cu_array.at(x, y - 1).qp as i32 + 1) >> 1;
        let len = (x_end - x).min(8);
        filter_edge_luma(pic, x, y, false, len, qp, bitdepth);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ChromaFormat;
  use crate::cu::{CuInfo, CU_INTRA};
  use bytemuck::Zeroable;

  #[test]
  fn hard_edge_at_cu_boundary_is_softened() {
    let mut pic = Picture::new(128, 64, ChromaFormat::Csp420, 0);
    for y in 0..64 {
      for x in 0..128 {
        pic.planes[0].set(x, y, if x < 64 { 100 } else { 110 });
      }
    }
    let mut cu_array = CuArray::new(128, 64);
    let mut cu = CuInfo::zeroed();
    cu.cu_type = CU_INTRA;
    cu.log2_width = 6;
    cu.log2_height = 6;
    cu.qp = 37;
    cu_array.set_cu(0, 0, 64, 64, &cu);
    cu_array.set_cu(64, 0, 64, 64, &cu);

    deblock_lcu(&mut pic, &cu_array, 64, 0, 8);

    // The step across the boundary shrank
    let p0 = pic.planes[0].at(63, 10) as i32;
    let q0 = pic.planes[0].at(64, 10) as i32;
    assert!((q0 - p0).abs() < 10, "edge not filtered: {} {}", p0, q0);
    // Far away from the edge nothing changed
    assert_eq!(pic.planes[0].at(32, 10), 100);
    assert_eq!(pic.planes[0].at(100, 10), 110);
  }
}
