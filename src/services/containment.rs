//! Point-in-zone classification with inward padding

use crate::domain::types::Point;
use crate::domain::zone::ZoneRect;

/// Returns true if `point` lies inside `rect` shrunk by `padding` on every side
///
/// Padding keeps people walking along a zone edge from flickering in and out.
/// If the padded rectangle would be empty, the unpadded rectangle is used.
/// Boundaries are inclusive.
#[inline]
pub fn is_inside(point: Point, rect: &ZoneRect, padding: u32) -> bool {
    let pad = i64::from(padding);
    let (left, top) = (i64::from(rect.left()), i64::from(rect.top()));
    let (right, bottom) = (i64::from(rect.right()), i64::from(rect.bottom()));

    let (pl, pt, pr, pb) = (left + pad, top + pad, right - pad, bottom - pad);
    let (l, t, r, b) = if pl >= pr || pt >= pb { (left, top, right, bottom) } else { (pl, pt, pr, pb) };

    (l as f64) <= point.x && point.x <= (r as f64) && (t as f64) <= point.y && point.y <= (b as f64)
}
