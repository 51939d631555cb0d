//! Ordered k-way merging of independently selected results.

use super::{SeriesSet, StorageError};
use crate::model::{Annotations, Sample, Series};
use std::cmp::Ordering;

/// Merges sorted sources into one sorted stream.
///
/// Items that compare equal are folded together with `reconcile`, earlier
/// sources first, so the first occurrence wins on conflicts.
pub struct MergeIter<T, I, C, R> {
    sources: Vec<I>,
    heads: Vec<Option<T>>,
    cmp: C,
    reconcile: R,
}

impl<T, I, C, R> MergeIter<T, I, C, R>
where
    I: Iterator<Item = T>,
    C: Fn(&T, &T) -> Ordering,
    R: Fn(T, T) -> T,
{
    pub fn new(sources: Vec<I>, cmp: C, reconcile: R) -> Self {
        let mut sources = sources;
        let heads = sources.iter_mut().map(|s| s.next()).collect();
        Self {
            sources,
            heads,
            cmp,
            reconcile,
        }
    }

    fn pop(&mut self, i: usize) -> Option<T> {
        let item = self.heads[i].take();
        if item.is_some() {
            self.heads[i] = self.sources[i].next();
        }
        item
    }
}

impl<T, I, C, R> Iterator for MergeIter<T, I, C, R>
where
    I: Iterator<Item = T>,
    C: Fn(&T, &T) -> Ordering,
    R: Fn(T, T) -> T,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(candidate) = head else { continue };
            match best.and_then(|b| self.heads[b].as_ref()) {
                Some(current) if (self.cmp)(candidate, current) != Ordering::Less => {}
                _ => best = Some(i),
            }
        }

        let best = best?;
        let mut item = self.pop(best)?;

        for i in 0..self.heads.len() {
            while self.heads[i]
                .as_ref()
                .is_some_and(|h| (self.cmp)(h, &item) == Ordering::Equal)
            {
                if let Some(dup) = self.pop(i) {
                    item = (self.reconcile)(item, dup);
                }
            }
        }

        Some(item)
    }
}

/// Combine two copies of the same series. Labels come from `first`; samples
/// are merged by timestamp, keeping `first`'s value on collisions.
pub fn chain_series(first: Series, second: Series) -> Series {
    let mut samples: Vec<Sample> = Vec::with_capacity(first.samples.len() + second.samples.len());
    let mut a = first.samples.into_iter().peekable();
    let mut b = second.samples.into_iter().peekable();

    loop {
        let next = match (a.peek().copied(), b.peek().copied()) {
            (Some(x), Some(y)) if x.t < y.t => a.next(),
            (Some(x), Some(y)) if x.t > y.t => b.next(),
            (Some(_), Some(_)) => {
                b.next();
                a.next()
            }
            (Some(_), None) => a.next(),
            (None, Some(_)) => b.next(),
            (None, None) => break,
        };
        if let Some(s) = next {
            samples.push(s);
        }
    }

    Series {
        labels: first.labels,
        samples,
    }
}

fn compare_series(a: &Series, b: &Series) -> Ordering {
    a.labels.cmp(&b.labels)
}

type SeriesMerge = MergeIter<
    Series,
    std::vec::IntoIter<Series>,
    fn(&Series, &Series) -> Ordering,
    fn(Series, Series) -> Series,
>;

/// Several sorted series sets merged into one, duplicates collapsed.
pub struct MergedSeriesSet {
    inner: SeriesMerge,
    warnings: Annotations,
}

impl Iterator for MergedSeriesSet {
    type Item = Result<Series, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Ok)
    }
}

impl SeriesSet for MergedSeriesSet {
    fn warnings(&self) -> Annotations {
        self.warnings.clone()
    }
}

/// Drain every set, then merge them in label order.
///
/// Each input must already be sorted. The first error from any set aborts
/// the merge.
pub fn merge_series_sets(sets: Vec<Box<dyn SeriesSet>>) -> Result<MergedSeriesSet, StorageError> {
    let mut warnings = Annotations::new();
    let mut drained = Vec::with_capacity(sets.len());

    for mut set in sets {
        let series = set.by_ref().collect::<Result<Vec<_>, _>>()?;
        warnings.merge(set.warnings());
        drained.push(series.into_iter());
    }

    Ok(MergedSeriesSet {
        inner: MergeIter::new(
            drained,
            compare_series as fn(&Series, &Series) -> Ordering,
            chain_series as fn(Series, Series) -> Series,
        ),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Labels;
    use crate::storage::VecSeriesSet;

    fn series(job: &str, samples: &[(i64, f64)]) -> Series {
        Series {
            labels: [("__name__", "up"), ("job", job)].into_iter().collect::<Labels>(),
            samples: samples.iter().map(|&(t, v)| Sample::new(t, v)).collect(),
        }
    }

    #[test]
    fn test_merge_iter_orders_and_dedups() {
        let merged: Vec<i32> = MergeIter::new(
            vec![vec![1, 3, 5].into_iter(), vec![2, 3, 6].into_iter(), vec![].into_iter()],
            |a: &i32, b: &i32| a.cmp(b),
            |a, _| a,
        )
        .collect();
        assert_eq!(merged, vec![1, 2, 3, 5, 6]);
    }

    #[test]
    fn test_merge_keeps_first() {
        let merged: Vec<(i32, &str)> = MergeIter::new(
            vec![vec![(1, "a")].into_iter(), vec![(1, "b")].into_iter()],
            |a: &(i32, &str), b: &(i32, &str)| a.0.cmp(&b.0),
            |a, _| a,
        )
        .collect();
        assert_eq!(merged, vec![(1, "a")]);
    }

    #[test]
    fn test_chain_series() {
        let merged = chain_series(
            series("a", &[(1, 1.0), (3, 3.0)]),
            series("a", &[(2, 2.0), (3, 9.0)]),
        );
        let values: Vec<f64> = merged.samples.iter().map(|s| s.v).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_merge_series_sets() {
        let a: Box<dyn SeriesSet> = Box::new(VecSeriesSet::new(
            vec![series("a", &[(1, 1.0)]), series("b", &[(1, 1.0)])],
            Annotations::new(),
        ));
        let mut w = Annotations::new();
        w.warn("from b");
        let b: Box<dyn SeriesSet> = Box::new(VecSeriesSet::new(
            vec![series("b", &[(2, 2.0)]), series("c", &[(1, 1.0)])],
            w,
        ));

        let merged = merge_series_sets(vec![a, b]).unwrap();
        assert_eq!(merged.warnings().len(), 1);

        let out: Vec<Series> = merged.map(|r| r.unwrap()).collect();
        let jobs: Vec<&str> = out.iter().map(|s| s.labels.get("job")).collect();
        assert_eq!(jobs, vec!["a", "b", "c"]);
        assert_eq!(out[1].samples.len(), 2);
    }
}
