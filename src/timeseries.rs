//! Hooks for time-series documents
//!
//! The cache does not understand any time-series format. It only needs to
//! know which time extents a payload covers so it can chunk and reassemble
//! it; callers supply the series type and its marshal/unmarshal functions.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Inclusive span of time in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Extent {
    pub start: i64,
    pub end: i64,
}

impl Extent {
    pub fn new(start: i64, end: i64) -> Self {
        Extent { start, end }
    }

    pub fn includes(&self, ts: i64) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Sorted list of extents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentList(pub Vec<Extent>);

impl ExtentList {
    /// Sort and merge extents that overlap or sit within one `step` of each other
    pub fn compress(&self, step_ms: i64) -> ExtentList {
        let mut sorted = self.0.clone();
        sorted.sort();
        let mut out: Vec<Extent> = Vec::with_capacity(sorted.len());
        for e in sorted {
            match out.last_mut() {
                Some(prev) if e.start <= prev.end + step_ms => {
                    prev.end = prev.end.max(e.end);
                }
                _ => out.push(e),
            }
        }
        ExtentList(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Time window and resolution of a time-series request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRangeQuery {
    pub extent: Extent,
    pub step_ms: i64,
}

/// A time-series payload the cache can chunk by time
pub trait Timeseries: fmt::Debug + Send + Sync {
    fn extents(&self) -> ExtentList;
    fn set_extents(&mut self, extents: ExtentList);
    /// Merge another series of the same concrete type into this one
    fn merge(&mut self, other: &dyn Timeseries);
    /// Drop every point outside `extent`
    fn crop_to_range(&mut self, extent: Extent);
    fn clone_box(&self) -> Box<dyn Timeseries>;
    /// Approximate size in bytes
    fn size(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Timeseries> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Serializes a series into chunk bytes
pub type MarshalerFn = Arc<dyn Fn(&dyn Timeseries) -> Result<Vec<u8>> + Send + Sync>;

/// Rebuilds a series from chunk bytes
pub type UnmarshalerFn = Arc<dyn Fn(&[u8], Option<&TimeRangeQuery>) -> Result<Box<dyn Timeseries>> + Send + Sync>;

/// Minimal series of timestamped values, usable wherever a concrete series is needed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointSeries {
    pub points: Vec<(i64, f64)>,
    pub extents: ExtentList,
    pub step_ms: i64,
}

impl PointSeries {
    pub fn new(step_ms: i64, points: Vec<(i64, f64)>) -> Self {
        let extents = match (points.first(), points.last()) {
            (Some(first), Some(last)) => ExtentList(vec![Extent::new(first.0, last.0)]),
            _ => ExtentList::default(),
        };
        PointSeries { points, extents, step_ms }
    }

    pub fn marshaler() -> MarshalerFn {
        Arc::new(|ts: &dyn Timeseries| {
            let series = ts.as_any().downcast_ref::<PointSeries>().ok_or_else(|| {
                crate::error::CacheError::SerializationError("not a point series".to_string())
            })?;
            Ok(bincode::serialize(series)?)
        })
    }

    pub fn unmarshaler() -> UnmarshalerFn {
        Arc::new(|data: &[u8], _query: Option<&TimeRangeQuery>| {
            let series: PointSeries = bincode::deserialize(data)?;
            Ok(Box::new(series) as Box<dyn Timeseries>)
        })
    }
}

impl Timeseries for PointSeries {
    fn extents(&self) -> ExtentList {
        self.extents.clone()
    }

    fn set_extents(&mut self, extents: ExtentList) {
        self.extents = extents;
    }

    fn merge(&mut self, other: &dyn Timeseries) {
        let Some(other) = other.as_any().downcast_ref::<PointSeries>() else {
            return;
        };
        self.points.extend_from_slice(&other.points);
        self.points.sort_by_key(|p| p.0);
        self.points.dedup_by_key(|p| p.0);
        let mut extents = self.extents.0.clone();
        extents.extend_from_slice(&other.extents.0);
        self.extents = ExtentList(extents).compress(self.step_ms.max(other.step_ms));
    }

    fn crop_to_range(&mut self, extent: Extent) {
        self.points.retain(|p| extent.includes(p.0));
        self.extents = ExtentList(
            self.extents
                .0
                .iter()
                .filter(|e| e.overlaps(&extent))
                .map(|e| Extent::new(e.start.max(extent.start), e.end.min(extent.end)))
                .collect(),
        );
    }

    fn clone_box(&self) -> Box<dyn Timeseries> {
        Box::new(self.clone())
    }

    fn size(&self) -> usize {
        self.points.len() * std::mem::size_of::<(i64, f64)>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_compress() {
        let list = ExtentList(vec![
            Extent::new(200, 300),
            Extent::new(0, 100),
            Extent::new(110, 150),
            Extent::new(500, 600),
        ]);
        let compressed = list.compress(10);
        assert_eq!(
            compressed.0,
            vec![Extent::new(0, 150), Extent::new(200, 300), Extent::new(500, 600)]
        );
    }

    #[test]
    fn test_point_series_merge_and_crop() {
        let mut a = PointSeries::new(10, vec![(0, 1.0), (10, 2.0)]);
        let b = PointSeries::new(10, vec![(20, 3.0), (30, 4.0)]);
        a.merge(&b);
        assert_eq!(a.points.len(), 4);
        assert_eq!(a.extents().0, vec![Extent::new(0, 30)]);

        a.crop_to_range(Extent::new(10, 20));
        assert_eq!(a.points, vec![(10, 2.0), (20, 3.0)]);
        assert_eq!(a.extents().0, vec![Extent::new(10, 20)]);
    }

    #[test]
    fn test_marshal_roundtrip() {
        let series = PointSeries::new(10, vec![(0, 1.5), (10, 2.5)]);
        let bytes = (PointSeries::marshaler())(&series).unwrap();
        let back = (PointSeries::unmarshaler())(&bytes, None).unwrap();
        let back = back.as_any().downcast_ref::<PointSeries>().unwrap();
        assert_eq!(back, &series);
    }
}
