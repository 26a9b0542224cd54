// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// Pictures and sample planes.
//
// All sample storage is u16 so that 8 and 10 bit content share one code
// path; values are kept in the native range of the configured bit depth.

use crate::config::ChromaFormat;
use crate::cu::LCU_WIDTH;

pub type Pixel = u16;

pub struct Plane {
  pub width: usize,
  pub height: usize,
  pub stride: usize,
  pub data: Box<[Pixel]>,
}

impl Plane {
  pub fn new(width: usize, height: usize, fill: Pixel) -> Self {
    Plane {
      width: width,
      height: height,
      stride: width,
      data: vec![fill; width * height].into_boxed_slice(),
    }
  }

  pub fn row(&self, y: usize) -> &[Pixel] {
    let start = y * self.stride;
    &self.data[start..start + self.width]
  }

  pub fn row_mut(&mut self, y: usize) -> &mut [Pixel] {
    let start = y * self.stride;
    &mut self.data[start..start + self.width]
  }

  pub fn at(&self, x: usize, y: usize) -> Pixel {
    self.data[y * self.stride + x]
  }

  pub fn set(&mut self, x: usize, y: usize, value: Pixel) {
    self.data[y * self.stride + x] = value;
  }

  /// Clamping sample fetch: coordinates outside the plane are pinned to
  /// the nearest edge sample. Interpolation and edge CTUs rely on this.
  pub fn at_clamped(&self, x: i32, y: i32) -> Pixel {
    let cx = x.clamp(0, self.width as i32 - 1) as usize;
    let cy = y.clamp(0, self.height as i32 - 1) as usize;
    self.at(cx, cy)
  }
}

/// Delta-QP map covering the frame, from a file or supplied through the
/// API alongside the picture.
#[derive(Clone, Default)]
pub struct RoiMap {
  pub width: usize,
  pub height: usize,
  pub dqp: Vec<i8>,
}

/// A picture: either a source frame handed in through the API or a
/// reconstruction owned by the encoder.
pub struct Picture {
  pub planes: [Plane; 3],
  pub width: usize,
  pub height: usize,
  pub chroma_format: ChromaFormat,
  /// log2 subsampling factors for the chroma planes
  pub chroma_scale_x: usize,
  pub chroma_scale_y: usize,

  pub pts: i64,
  pub dts: i64,
  pub poc: i32,

  /// POCs of the reference pictures that were active when this picture
  /// was coded; temporal MV scaling reads these.
  pub ref_pocs: Vec<i32>,
  pub ref_lx: [Vec<u8>; 2],

  pub roi: Option<RoiMap>,
}

impl Picture {
  pub fn new(width: usize, height: usize, chroma_format: ChromaFormat, fill: Pixel) -> Self {
    let (sx, sy) = match chroma_format {
      ChromaFormat::Csp420 => (1, 1),
      ChromaFormat::Csp444 => (0, 0),
    };
    let cw = width >> sx;
    let ch = height >> sy;
    Picture {
      planes: [
        Plane::new(width, height, fill),
        Plane::new(cw, ch, fill),
        Plane::new(cw, ch, fill),
      ],
      width: width,
      height: height,
      chroma_format: chroma_format,
      chroma_scale_x: sx,
      chroma_scale_y: sy,
      pts: 0,
      dts: 0,
      poc: -1,
      ref_pocs: Vec::new(),
      ref_lx: [Vec::new(), Vec::new()],
      roi: None,
    }
  }

  pub fn y(&self) -> &Plane {
    &self.planes[0]
  }

  pub fn u(&self) -> &Plane {
    &self.planes[1]
  }

  pub fn v(&self) -> &Plane {
    &self.planes[2]
  }

  pub fn plane(&self, idx: usize) -> &Plane {
    &self.planes[idx]
  }

  pub fn plane_mut(&mut self, idx: usize) -> &mut Plane {
    &mut self.planes[idx]
  }
}

/// Single-row / single-column sample buffers carried between CTUs.
///
/// The horizontal buffer is indexed by x_px + y_lcu * width: one full
/// pixel row per LCU row. The vertical buffer likewise holds one pixel
/// column per LCU column, indexed by x_lcu * height + y_px.
pub struct YuvLineBuf {
  pub y: Vec<Pixel>,
  pub u: Vec<Pixel>,
  pub v: Vec<Pixel>,
}

impl YuvLineBuf {
  pub fn new_hor(width: usize, height_in_lcu: usize, sx: usize) -> Self {
    YuvLineBuf {
      y: vec![0; width * height_in_lcu],
      u: vec![0; (width >> sx) * height_in_lcu],
      v: vec![0; (width >> sx) * height_in_lcu],
    }
  }

  pub fn new_ver(height: usize, width_in_lcu: usize, sy: usize) -> Self {
    YuvLineBuf {
      y: vec![0; height * width_in_lcu],
      u: vec![0; (height >> sy) * width_in_lcu],
      v: vec![0; (height >> sy) * width_in_lcu],
    }
  }

  pub fn plane(&self, idx: usize) -> &[Pixel] {
    match idx {
      0 => &self.y,
      1 => &self.u,
      _ => &self.v,
    }
  }

  pub fn plane_mut(&mut self, idx: usize) -> &mut [Pixel] {
    match idx {
      0 => &mut self.y,
      1 => &mut self.u,
      _ => &mut self.v,
    }
  }
}

/// Rolling reconstruction window for intra block copy: one strip of
/// IBC_BUFFER_WIDTH x LCU_WIDTH luma (and subsampled chroma) per LCU row.
pub const IBC_BUFFER_WIDTH: usize = 4 * LCU_WIDTH;

pub struct IbcBuffer {
  pub y: Vec<Pixel>, // rows * (IBC_BUFFER_WIDTH * LCU_WIDTH)
  pub u: Vec<Pixel>,
  pub v: Vec<Pixel>,
  pub rows: usize,
  pub chroma_scale: usize,
}

impl IbcBuffer {
  pub fn new(height_in_lcu: usize, chroma_scale: usize) -> Self {
    let luma_per_row = IBC_BUFFER_WIDTH * LCU_WIDTH;
    let chroma_per_row = luma_per_row >> (2 * chroma_scale);
    IbcBuffer {
      y: vec![0; luma_per_row * height_in_lcu],
      u: vec![0; chroma_per_row * height_in_lcu],
      v: vec![0; chroma_per_row * height_in_lcu],
      rows: height_in_lcu,
      chroma_scale: chroma_scale,
    }
  }

  pub fn row_y(&mut self, lcu_row: usize) -> &mut [Pixel] {
    let per_row = IBC_BUFFER_WIDTH * LCU_WIDTH;
    &mut self.y[lcu_row * per_row..(lcu_row + 1) * per_row]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clamped_fetch_pins_to_edges() {
    let mut p = Plane::new(4, 4, 0);
    p.set(0, 0, 7);
    p.set(3, 3, 9);
    assert_eq!(p.at_clamped(-5, -5), 7);
    assert_eq!(p.at_clamped(10, 10), 9);
    assert_eq!(p.at_clamped(3, 3), 9);
  }

  #[test]
  fn chroma_geometry() {
    let pic = Picture::new(128, 64, ChromaFormat::Csp420, 512);
    assert_eq!(pic.u().width, 64);
    assert_eq!(pic.u().height, 32);
    let pic = Picture::new(128, 64, ChromaFormat::Csp444, 512);
    assert_eq!(pic.u().width, 128);
    assert_eq!(pic.v().height, 64);
  }
}
