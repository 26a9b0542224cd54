// History-based motion vector prediction.
//
// One five-entry ring of recently coded inter CUs per CTU row. Search is
// speculative, so each CTU snapshots its row before searching and
// restores it afterwards; only the committed coding path may leave its
// updates in place.

use bytemuck::Zeroable;

use crate::cu::CuInfo;

pub const MAX_NUM_HMVP_CANDS: usize = 5;

#[derive(Clone)]
pub struct HmvpLut {
  lut: Vec<CuInfo>, // rows * MAX_NUM_HMVP_CANDS
  size: Vec<u8>,
}

#[derive(Clone)]
pub struct HmvpSnapshot {
  row: usize,
  lut: [CuInfo; MAX_NUM_HMVP_CANDS],
  size: u8,
}

impl HmvpLut {
  pub fn new(rows: usize) -> Self {
    HmvpLut {
      lut: vec![CuInfo::zeroed(); rows * MAX_NUM_HMVP_CANDS],
      size: vec![0; rows],
    }
  }

  pub fn reset_row(&mut self, row: usize) {
    self.size[row] = 0;
  }

  pub fn reset_all(&mut self) {
    self.size.iter_mut().for_each(|s| *s = 0);
  }

  pub fn row(&self, row: usize) -> &[CuInfo] {
    let base = row * MAX_NUM_HMVP_CANDS;
    &self.lut[base..base + self.size[row] as usize]
  }

  /// Append the motion of a just-coded inter CU. An identical existing
  /// entry is moved to the front instead of being duplicated; the oldest
  /// entry falls off when the ring is full.
  pub fn add(&mut self, row: usize, cu: &CuInfo) {
    let base = row * MAX_NUM_HMVP_CANDS;
    let size = self.size[row] as usize;

    let same = |a: &CuInfo, b: &CuInfo| {
      a.mv_dir == b.mv_dir && a.mv == b.mv && a.mv_ref == b.mv_ref
    };

    let mut insert_at = size;
    for i in 0..size {
      if same(&self.lut[base + i], cu) {
        insert_at = i;
        break;
      }
    }

    if insert_at == size && size == MAX_NUM_HMVP_CANDS {
      insert_at = MAX_NUM_HMVP_CANDS - 1;
    }

    // Shift newer entries down and put the new candidate at the front
    for i in (1..=insert_at.min(MAX_NUM_HMVP_CANDS - 1)).rev() {
      self.lut[base + i] = self.lut[base + i - 1];
    }
    self.lut[base] = *cu;
    self.size[row] = (size + (insert_at == size) as usize).min(MAX_NUM_HMVP_CANDS) as u8;
  }

  pub fn snapshot(&self, row: usize) -> HmvpSnapshot {
    let base = row * MAX_NUM_HMVP_CANDS;
    let mut lut = [CuInfo::zeroed(); MAX_NUM_HMVP_CANDS];
    lut.copy_from_slice(&self.lut[base..base + MAX_NUM_HMVP_CANDS]);
    HmvpSnapshot { row: row, lut: lut, size: self.size[row] }
  }

  pub fn restore(&mut self, snap: &HmvpSnapshot) {
    let base = snap.row * MAX_NUM_HMVP_CANDS;
    self.lut[base..base + MAX_NUM_HMVP_CANDS].copy_from_slice(&snap.lut);
    self.size[snap.row] = snap.size;
  }

  /// Run `f` with the row's state snapshotted; the snapshot is restored
  /// on every exit path out of `f`.
  pub fn with_snapshot<R>(&mut self, row: usize, f: impl FnOnce(&mut HmvpLut) -> R) -> R {
    let snap = self.snapshot(row);
    let result = f(self);
    self.restore(&snap);
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cu::CU_INTER;

  fn inter_cu(mv_x: i32) -> CuInfo {
    let mut cu = CuInfo::zeroed();
    cu.cu_type = CU_INTER;
    cu.mv_dir = 1;
    cu.mv[0][0] = mv_x;
    cu
  }

  #[test]
  fn ring_keeps_five_newest() {
    let mut lut = HmvpLut::new(2);
    for i in 0..7 {
      lut.add(1, &inter_cu(i * 16));
    }
    let row = lut.row(1);
    assert_eq!(row.len(), MAX_NUM_HMVP_CANDS);
    assert_eq!(row[0].mv[0][0], 6 * 16);
    assert_eq!(row[4].mv[0][0], 2 * 16);
    // Other rows untouched
    assert_eq!(lut.row(0).len(), 0);
  }

  #[test]
  fn duplicates_move_to_front() {
    let mut lut = HmvpLut::new(1);
    lut.add(0, &inter_cu(16));
    lut.add(0, &inter_cu(32));
    lut.add(0, &inter_cu(16));
    let row = lut.row(0);
    assert_eq!(row.len(), 2);
    assert_eq!(row[0].mv[0][0], 16);
    assert_eq!(row[1].mv[0][0], 32);
  }

  #[test]
  fn snapshot_restores_on_early_exit() {
    let mut lut = HmvpLut::new(1);
    lut.add(0, &inter_cu(16));

    let result: Result<(), ()> = lut.with_snapshot(0, |lut| {
      lut.add(0, &inter_cu(99));
      lut.add(0, &inter_cu(77));
      Err(())
    });
    assert!(result.is_err());
    let row = lut.row(0);
    assert_eq!(row.len(), 1);
    assert_eq!(row[0].mv[0][0], 16);
  }
}
