//! WKB geometry cells rendered as WKT text.
//!
//! Only points and line strings are kept; every other geometry type reads
//! back as null. Z and M ordinates are dropped.

use geo_types::{Coord, Geometry, LineString, Point};
use wkt::ToWkt;

/// Binary column that holds WKB geometries.
pub const GEOMETRY_COLUMN: &str = "geometry";

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;

// EWKB flag bits on the type word.
const EWKB_Z: u32 = 0x8000_0000;
const EWKB_M: u32 = 0x4000_0000;
const EWKB_SRID: u32 = 0x2000_0000;
const EWKB_FLAGS: u32 = EWKB_Z | EWKB_M | EWKB_SRID;

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let chunk = self.bytes.get(self.pos..end)?;
        self.pos = end;
        chunk.try_into().ok()
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn u32(&mut self) -> Option<u32> {
        let raw = self.take::<4>()?;
        Some(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    fn f64(&mut self) -> Option<f64> {
        let raw = self.take::<8>()?;
        Some(if self.little_endian {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    }

    /// Reads one position of `dims` ordinates, keeping x and y.
    fn coord(&mut self, dims: usize) -> Option<Coord<f64>> {
        let x = self.f64()?;
        let y = self.f64()?;
        for _ in 2..dims {
            self.f64()?;
        }
        Some(Coord { x, y })
    }
}

/// Base geometry code and ordinate count, for both ISO (`1001`) and
/// EWKB (flag bit) dimension encodings.
fn split_type(raw: u32) -> (u32, usize) {
    let mut dims = 2;
    if raw & EWKB_Z != 0 {
        dims += 1;
    }
    if raw & EWKB_M != 0 {
        dims += 1;
    }
    let code = raw & !EWKB_FLAGS;
    dims += match code / 1000 {
        1 | 2 => 1,
        3 => 2,
        _ => 0,
    };
    (code % 1000, dims)
}

/// Decodes a WKB point or line string. Anything else, including truncated
/// input and empty points, gives `None`.
pub fn decode_wkb(bytes: &[u8]) -> Option<Geometry<f64>> {
    let mut cur = Cursor {
        bytes,
        pos: 0,
        little_endian: true,
    };
    cur.little_endian = match cur.take::<1>()?[0] {
        0 => false,
        1 => true,
        _ => return None,
    };
    let raw = cur.u32()?;
    if raw & EWKB_SRID != 0 {
        cur.u32()?;
    }
    let (kind, dims) = split_type(raw);

    match kind {
        WKB_POINT => {
            let c = cur.coord(dims)?;
            if c.x.is_nan() && c.y.is_nan() {
                return None;
            }
            Some(Geometry::Point(Point(c)))
        }
        WKB_LINESTRING => {
            let n = cur.u32()? as usize;
            if n.checked_mul(dims * 8)? > cur.remaining() {
                return None;
            }
            let coords = (0..n).map(|_| cur.coord(dims)).collect::<Option<Vec<_>>>()?;
            Some(Geometry::LineString(LineString(coords)))
        }
        _ => None,
    }
}

pub fn wkb_to_wkt(bytes: &[u8]) -> Option<String> {
    decode_wkb(bytes).map(|g| g.wkt_string())
}
