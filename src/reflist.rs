// Reference picture list.
//
// Entries pair a reconstructed picture with the CU grid that produced it;
// motion search reads both (the grid feeds temporal MV candidates). The
// newest reference sits at index 0.

use std::sync::{Arc, Mutex};

use crate::cu::CuArray;
use crate::picture::Picture;

pub const MAX_REF_PIC_COUNT: usize = 16;

#[derive(Clone)]
pub struct RefEntry {
  pub recon: Arc<Mutex<Picture>>,
  pub cu: Arc<Mutex<CuArray>>,
  pub poc: i32,
  /// POCs of the references that were active when this picture was
  /// coded; scaled temporal candidates need them.
  pub ref_pocs: Vec<i32>,
  /// That picture's own L0/L1 maps into ref_pocs.
  pub ref_lx: [Vec<u8>; 2],
}

#[derive(Clone, Default)]
pub struct RefList {
  entries: Vec<RefEntry>,
}

impl RefList {
  pub fn new() -> Self {
    RefList { entries: Vec::new() }
  }

  pub fn used_size(&self) -> usize {
    self.entries.len()
  }

  pub fn entry(&self, idx: usize) -> &RefEntry {
    &self.entries[idx]
  }

  pub fn poc(&self, idx: usize) -> i32 {
    self.entries[idx].poc
  }

  pub fn add(&mut self, entry: RefEntry) {
    assert!(self.entries.len() < MAX_REF_PIC_COUNT, "reference list overflow");
    assert!(
      self.entries.iter().all(|e| e.poc != entry.poc),
      "duplicate POC {} in reference list", entry.poc
    );
    // Newest first
    self.entries.insert(0, entry);
  }

  pub fn remove(&mut self, idx: usize) {
    self.entries.remove(idx);
  }

  pub fn iter(&self) -> impl Iterator<Item = &RefEntry> {
    self.entries.iter()
  }

  /// Build the L0/L1 index maps for a picture at `poc`.
  ///
  /// L1 takes the future references in ascending POC order; L0 the past
  /// ones in descending order. When bi-prediction runs without picture
  /// reordering, the past references are appended to L1 as well.
  pub fn build_ref_lx(&self, poc: i32, l1_negative_refs: bool) -> [Vec<u8>; 2] {
    let mut l0: Vec<u8> = Vec::new();
    let mut l1: Vec<u8> = Vec::new();

    for (i, e) in self.entries.iter().enumerate() {
      if e.poc > poc {
        l1.push(i as u8);
      }
    }
    let num_positive = l1.len();

    for (i, e) in self.entries.iter().enumerate() {
      if e.poc < poc {
        l0.push(i as u8);
        if l1_negative_refs {
          l1.push(i as u8);
        }
      }
    }

    let poc_of = |idx: &u8| self.entries[*idx as usize].poc;
    // Nearest first in both lists
    l0.sort_by_key(|i| -poc_of(i));
    l1[..num_positive].sort_by_key(poc_of);
    if l1_negative_refs {
      l1[num_positive..].sort_by_key(|i| -poc_of(i));
    }

    [l0, l1]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ChromaFormat;

  fn entry(poc: i32) -> RefEntry {
    RefEntry {
      recon: Arc::new(Mutex::new(Picture::new(16, 16, ChromaFormat::Csp420, 0))),
      cu: Arc::new(Mutex::new(CuArray::new(16, 16))),
      poc: poc,
      ref_pocs: Vec::new(),
      ref_lx: [Vec::new(), Vec::new()],
    }
  }

  #[test]
  fn lists_are_sorted_towards_the_current_poc() {
    let mut refs = RefList::new();
    for poc in [0, 2, 4, 8, 6] {
      refs.add(entry(poc));
    }
    // Coding POC 5: L0 = {4, 2, 0}, L1 = {6, 8}
    let lx = refs.build_ref_lx(5, false);
    let l0_pocs: Vec<i32> = lx[0].iter().map(|&i| refs.poc(i as usize)).collect();
    let l1_pocs: Vec<i32> = lx[1].iter().map(|&i| refs.poc(i as usize)).collect();
    assert_eq!(l0_pocs, vec![4, 2, 0]);
    assert_eq!(l1_pocs, vec![6, 8]);
  }

  #[test]
  fn low_delay_l1_repeats_the_past_references() {
    let mut refs = RefList::new();
    for poc in [0, 1, 2] {
      refs.add(entry(poc));
    }
    let lx = refs.build_ref_lx(3, true);
    let l1_pocs: Vec<i32> = lx[1].iter().map(|&i| refs.poc(i as usize)).collect();
    assert_eq!(l1_pocs, vec![2, 1, 0]);
  }

  #[test]
  #[should_panic(expected = "duplicate POC")]
  fn duplicate_poc_is_rejected() {
    let mut refs = RefList::new();
    refs.add(entry(3));
    refs.add(entry(3));
  }
}
