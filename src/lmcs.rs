// Luma mapping with chroma scaling, reduced to the part the encoder
// loop needs: a forward LUT applied to the source before search and an
// inverse LUT applied to the reconstruction before it becomes a
// reference. The mapping is a 16-piece piecewise-linear curve that
// redistributes codewords towards the busy part of the histogram.

use crate::picture::{Picture, Pixel};

pub const LMCS_BINS: usize = 16;

#[derive(Clone)]
pub struct LmcsLuts {
  pub fwd: Vec<Pixel>,
  pub inv: Vec<Pixel>,
  pub enabled: bool,
}

/// Build the mapping from the source luma histogram. Bins that hold
/// samples get at least one codeword chunk; empty bins give their
/// codewords away. A flat histogram produces (nearly) the identity.
pub fn build_luts(source: &Picture, bitdepth: u32) -> LmcsLuts {
  let range = 1usize << bitdepth;
  let bin_size = range / LMCS_BINS;

  let mut hist = [0u64; LMCS_BINS];
  let y = source.y();
  for row in 0..y.height {
    for &s in y.row(row) {
      hist[(s as usize / bin_size).min(LMCS_BINS - 1)] += 1;
    }
  }
  let total: u64 = hist.iter().sum();

  // Codeword budget per bin, proportional to occupancy but bounded to
  // keep the curve invertible.
  let mut codewords = [0usize; LMCS_BINS];
  let mut assigned = 0usize;
  for i in 0..LMCS_BINS {
    let share = if total > 0 {
      ((hist[i] as f64 / total as f64) * range as f64).round() as usize
    } else {
      bin_size
    };
    codewords[i] = share.clamp(bin_size / 4, bin_size * 2);
    assigned += codewords[i];
  }
  // Renormalize to exactly the full range
  let mut i = 0;
  while assigned != range {
    let step = if assigned < range { 1usize } else { usize::MAX }; // +1 or -1
    let cw = &mut codewords[i % LMCS_BINS];
    if step == 1 && *cw < bin_size * 2 {
      *cw += 1;
      assigned += 1;
    } else if step != 1 && *cw > bin_size / 4 {
      *cw -= 1;
      assigned -= 1;
    }
    i += 1;
  }

  let mut fwd = vec![0 as Pixel; range];
  let mut inv = vec![0 as Pixel; range];
  let mut out_base = 0usize;
  for bin in 0..LMCS_BINS {
    let in_base = bin * bin_size;
    for k in 0..bin_size {
      let mapped = out_base + (k * codewords[bin] + bin_size / 2) / bin_size;
      fwd[in_base + k] = mapped.min(range - 1) as Pixel;
    }
    out_base += codewords[bin];
  }

  // Invert by forward scan; ties resolve to the smallest source value
  let mut src = 0usize;
  for mapped in 0..range {
    while src + 1 < range && (fwd[src + 1] as usize) <= mapped {
      src += 1;
    }
    inv[mapped] = src as Pixel;
  }

  // The curve is only worth signalling if it moved anything
  let enabled = fwd.iter().enumerate().any(|(i, &m)| (m as i64 - i as i64).abs() > 2);
  LmcsLuts { fwd: fwd, inv: inv, enabled: enabled }
}

pub fn map_plane(lut: &[Pixel], plane: &mut crate::picture::Plane) {
  for s in plane.data.iter_mut() {
    *s = lut[*s as usize];
  }
}

/// Inverse-map a rectangle of the luma plane in place.
pub fn inv_map_region(lut: &[Pixel], plane: &mut crate::picture::Plane,
                      x0: usize, y0: usize, width: usize, height: usize) {
  for y in y0..(y0 + height).min(plane.height) {
    let row = y * plane.stride;
    for x in x0..(x0 + width).min(plane.width) {
      plane.data[row + x] = lut[plane.data[row + x] as usize];
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ChromaFormat;

  #[test]
  fn mapping_is_monotone_and_inverts() {
    let mut pic = Picture::new(64, 64, ChromaFormat::Csp420, 0);
    for y in 0..64 {
      for x in 0..64 {
        // Concentrated histogram: most samples in a narrow band
        pic.planes[0].set(x, y, 100 + ((x * y) % 40) as u16);
      }
    }
    let luts = build_luts(&pic, 8);

    for i in 1..256 {
      assert!(luts.fwd[i] >= luts.fwd[i - 1], "forward LUT must be monotone");
    }
    // Round trip within one codeword step on the occupied band
    for v in 100u16..140 {
      let back = luts.inv[luts.fwd[v as usize] as usize];
      assert!((back as i32 - v as i32).abs() <= 1, "{} -> {} -> {}", v, luts.fwd[v as usize], back);
    }
  }
}
