//! NumPy-style basic indexing keys.
//!
//! A key is a list of [`SliceArg`]s applied left to right; axes the key does not
//! mention are taken whole. Keys resolve to `ndarray` slice descriptors, so a slice
//! always selects distinct elements and its gradient is a plain scatter.

use crate::error::{Result, TensorError};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn, SliceInfo, SliceInfoElem};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/// One component of an indexing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceArg {
    /// Select a single position and drop the axis. Negative counts from the end.
    Index(isize),
    /// `start:end:step` with NumPy defaults and clamping.
    Range {
        start: Option<isize>,
        end: Option<isize>,
        step: isize,
    },
    /// Insert a new axis of length 1.
    NewAxis,
    /// Keep the whole axis.
    Full,
}

impl SliceArg {
    pub fn range(start: isize, end: isize) -> Self {
        SliceArg::Range {
            start: Some(start),
            end: Some(end),
            step: 1,
        }
    }

    pub fn step(start: Option<isize>, end: Option<isize>, step: isize) -> Self {
        SliceArg::Range { start, end, step }
    }
}

impl From<isize> for SliceArg {
    fn from(i: isize) -> Self {
        SliceArg::Index(i)
    }
}

impl From<Range<isize>> for SliceArg {
    fn from(r: Range<isize>) -> Self {
        SliceArg::range(r.start, r.end)
    }
}

impl From<RangeFrom<isize>> for SliceArg {
    fn from(r: RangeFrom<isize>) -> Self {
        SliceArg::step(Some(r.start), None, 1)
    }
}

impl From<RangeTo<isize>> for SliceArg {
    fn from(r: RangeTo<isize>) -> Self {
        SliceArg::step(None, Some(r.end), 1)
    }
}

impl From<RangeFull> for SliceArg {
    fn from(_: RangeFull) -> Self {
        SliceArg::Full
    }
}

/// A key resolved against a concrete shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedKey {
    elems: Vec<SliceInfoElem>,
    out_shape: Vec<usize>,
}

impl ResolvedKey {
    pub fn out_shape(&self) -> &[usize] {
        &self.out_shape
    }

    fn info(&self) -> Result<SliceInfo<Vec<SliceInfoElem>, IxDyn, IxDyn>> {
        Ok(SliceInfo::try_from(self.elems.clone())?)
    }

    pub fn view<'a>(&self, a: &'a ArrayD<f32>) -> Result<ArrayViewD<'a, f32>> {
        Ok(a.slice(&self.info()?))
    }

    pub fn view_mut<'a>(&self, a: &'a mut ArrayD<f32>) -> Result<ArrayViewMutD<'a, f32>> {
        Ok(a.slice_mut(&self.info()?))
    }
}

/// Resolve `key` against `shape`, clamping ranges and bounds-checking indices.
pub fn resolve(key: &[SliceArg], shape: &[usize]) -> Result<ResolvedKey> {
    let consumed = key.iter().filter(|k| !matches!(k, SliceArg::NewAxis)).count();
    if consumed > shape.len() {
        return Err(TensorError::shape(format!(
            "too many indices ({}) for tensor of shape {:?}",
            consumed, shape
        )));
    }

    let mut elems = Vec::with_capacity(key.len() + shape.len() - consumed);
    let mut out_shape = Vec::new();
    let mut axis = 0usize;
    for arg in key.iter().copied().chain(std::iter::repeat(SliceArg::Full).take(shape.len() - consumed)) {
        match arg {
            SliceArg::NewAxis => {
                elems.push(SliceInfoElem::NewAxis);
                out_shape.push(1);
            }
            SliceArg::Index(i) => {
                let len = shape[axis] as isize;
                let idx = if i < 0 { i + len } else { i };
                if idx < 0 || idx >= len {
                    return Err(TensorError::shape(format!(
                        "index {} is out of bounds for axis {} with size {}",
                        i, axis, len
                    )));
                }
                elems.push(SliceInfoElem::Index(idx));
                axis += 1;
            }
            SliceArg::Full => {
                elems.push(SliceInfoElem::Slice {
                    start: 0,
                    end: None,
                    step: 1,
                });
                out_shape.push(shape[axis]);
                axis += 1;
            }
            SliceArg::Range { start, end, step } => {
                let (elem, count) = resolve_range(start, end, step, shape[axis])?;
                elems.push(elem);
                out_shape.push(count);
                axis += 1;
            }
        }
    }
    Ok(ResolvedKey { elems, out_shape })
}

/// Translate NumPy `start:end:step` into an `ndarray` slice plus its length.
///
/// `ndarray` walks a negative-step slice backwards from the end of `[start, end)`,
/// so the NumPy start becomes the exclusive upper bound.
fn resolve_range(
    start: Option<isize>,
    end: Option<isize>,
    step: isize,
    len: usize,
) -> Result<(SliceInfoElem, usize)> {
    if step == 0 {
        return Err(TensorError::invalid("slice step cannot be zero"));
    }
    let len = len as isize;
    let wrap = |v: isize| if v < 0 { v + len } else { v };
    if step > 0 {
        let lo = start.map(wrap).unwrap_or(0).clamp(0, len);
        let hi = end.map(wrap).unwrap_or(len).clamp(0, len);
        let count = if hi > lo { (hi - lo - 1) / step + 1 } else { 0 };
        let elem = SliceInfoElem::Slice {
            start: lo,
            end: Some(hi.max(lo)),
            step,
        };
        return Ok((elem, count as usize));
    }
    let s = step
        .checked_neg()
        .ok_or_else(|| TensorError::invalid(format!("slice step {} is out of range", step)))?;
    let first = start.map(wrap).unwrap_or(len - 1).clamp(-1, len - 1);
    let stop = end.map(wrap).unwrap_or(-1).clamp(-1, len - 1);
    let count = if first > stop { (first - stop - 1) / s + 1 } else { 0 };
    if count == 0 {
        let elem = SliceInfoElem::Slice {
            start: 0,
            end: Some(0),
            step: 1,
        };
        return Ok((elem, 0));
    }
    let last = first - (count - 1) * s;
    let elem = SliceInfoElem::Slice {
        start: last,
        end: Some(first + 1),
        step,
    };
    Ok((elem, count as usize))
}
