//! SQLite database store implementation.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::model::{
    matches_all, Labels, MatchType, Matcher, Sample, Series, Timestamp, METRIC_NAME,
};
use crate::storage::{
    BlockMeta, BlockStats, Exemplar, ExemplarQueryResult, HeadStats, Stat, TsdbStats,
};

/// Rough number of samples per chunk, used to estimate chunk counts.
const SAMPLES_PER_CHUNK: u64 = 120;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Label encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Database lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Writes ---

    /// Append a sample, creating the series on first use. A sample at an
    /// existing timestamp replaces the old value.
    pub fn append(&self, labels: &Labels, t: Timestamp, v: f64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let id = upsert_series(&conn, labels)?;
        conn.execute(
            "INSERT OR REPLACE INTO samples (series_id, t, v) VALUES (?1, ?2, ?3)",
            params![id, t, v],
        )?;
        Ok(())
    }

    /// Attach an exemplar to a series.
    pub fn append_exemplar(
        &self,
        series: &Labels,
        exemplar: &Labels,
        t: Timestamp,
        v: f64,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        let id = upsert_series(&conn, series)?;
        conn.execute(
            "INSERT INTO exemplars (series_id, t, v, labels) VALUES (?1, ?2, ?3, ?4)",
            params![id, t, v, serde_json::to_string(exemplar)?],
        )?;
        Ok(())
    }

    // --- Reads ---

    /// Label names of series with samples in `[mint, maxt]`, sorted.
    pub fn label_names(
        &self,
        matchers: &[Matcher],
        mint: Timestamp,
        maxt: Timestamp,
        limit: usize,
    ) -> Result<Vec<String>, DbError> {
        let conn = self.conn()?;
        let mut names = BTreeSet::new();
        for row in series_matching(&conn, matchers, Some((mint, maxt)))? {
            names.extend(row.labels.names().map(str::to_string));
        }
        Ok(limited(names, limit))
    }

    /// Values of `name` across series with samples in `[mint, maxt]`, sorted.
    pub fn label_values(
        &self,
        name: &str,
        matchers: &[Matcher],
        mint: Timestamp,
        maxt: Timestamp,
        limit: usize,
    ) -> Result<Vec<String>, DbError> {
        let conn = self.conn()?;
        let mut values = BTreeSet::new();
        for row in series_matching(&conn, matchers, Some((mint, maxt)))? {
            let v = row.labels.get(name);
            if !v.is_empty() {
                values.insert(v.to_string());
            }
        }
        Ok(limited(values, limit))
    }

    /// Series matching `matchers` with their samples in `[mint, maxt]`,
    /// sorted by labels.
    pub fn select(
        &self,
        matchers: &[Matcher],
        mint: Timestamp,
        maxt: Timestamp,
        limit: usize,
    ) -> Result<Vec<Series>, DbError> {
        let conn = self.conn()?;
        let mut rows = series_matching(&conn, matchers, Some((mint, maxt)))?;
        rows.sort_by(|a, b| a.labels.cmp(&b.labels));
        if limit > 0 {
            rows.truncate(limit);
        }

        let mut stmt = conn.prepare(
            "SELECT s.t, s.v FROM samples s
             WHERE s.series_id = ?1 AND s.t BETWEEN ?2 AND ?3
               AND NOT EXISTS (SELECT 1 FROM tombstones tb
                               WHERE tb.series_id = s.series_id AND s.t BETWEEN tb.mint AND tb.maxt)
             ORDER BY s.t",
        )?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let samples = stmt
                .query_map(params![row.id, mint, maxt], |r| {
                    let v: Option<f64> = r.get(1)?;
                    Ok(Sample::new(r.get(0)?, v.unwrap_or(f64::NAN)))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            out.push(Series {
                labels: row.labels,
                samples,
            });
        }
        Ok(out)
    }

    /// Exemplars in `[start, end]` for series matching any matcher set.
    pub fn exemplars(
        &self,
        matcher_sets: &[Vec<Matcher>],
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<ExemplarQueryResult>, DbError> {
        let conn = self.conn()?;
        let mut series: BTreeMap<Labels, i64> = BTreeMap::new();
        for set in matcher_sets {
            for row in series_matching(&conn, set, None)? {
                series.entry(row.labels).or_insert(row.id);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT t, v, labels FROM exemplars WHERE series_id = ?1 AND t BETWEEN ?2 AND ?3 ORDER BY t",
        )?;

        let mut out = Vec::new();
        for (labels, id) in series {
            let raw = stmt
                .query_map(params![id, start, end], |r| {
                    let v: Option<f64> = r.get(1)?;
                    Ok((r.get::<_, i64>(0)?, v.unwrap_or(f64::NAN), r.get::<_, String>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            if raw.is_empty() {
                continue;
            }
            let mut exemplars = Vec::with_capacity(raw.len());
            for (t, v, json) in raw {
                exemplars.push(Exemplar {
                    labels: serde_json::from_str(&json)?,
                    value: v,
                    timestamp: t,
                });
            }
            out.push(ExemplarQueryResult {
                series_labels: labels,
                exemplars,
            });
        }
        Ok(out)
    }

    // --- Admin ---

    /// Record a tombstone over `[mint, maxt]` for every matching series.
    pub fn delete(&self, matchers: &[Matcher], mint: Timestamp, maxt: Timestamp) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let rows = series_matching(&conn, matchers, None)?;
        for row in &rows {
            conn.execute(
                "INSERT INTO tombstones (series_id, mint, maxt) VALUES (?1, ?2, ?3)",
                params![row.id, mint, maxt],
            )?;
        }
        Ok(rows.len())
    }

    /// Drop tombstoned samples, empty series and the tombstones themselves,
    /// then compact the file.
    pub fn clean_tombstones(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
             DELETE FROM samples WHERE EXISTS (
                 SELECT 1 FROM tombstones tb
                 WHERE tb.series_id = samples.series_id AND samples.t BETWEEN tb.mint AND tb.maxt);
             DELETE FROM tombstones;
             DELETE FROM exemplars WHERE series_id NOT IN (SELECT DISTINCT series_id FROM samples);
             DELETE FROM series WHERE id NOT IN (SELECT DISTINCT series_id FROM samples);
             COMMIT;
             VACUUM;",
        )?;
        Ok(())
    }

    /// Write a compacted copy of the database to `path`.
    pub fn snapshot_to(&self, path: &Path) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("VACUUM INTO ?1", params![path.to_string_lossy().to_string()])?;
        Ok(())
    }

    /// Head statistics and the top `limit` cardinality entries.
    pub fn stats(&self, limit: usize) -> Result<TsdbStats, DbError> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT se.labels, COUNT(sa.t) FROM series se
             JOIN samples sa ON sa.series_id = se.id
             GROUP BY se.id",
        )?;
        let counts = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(json, n)| -> Result<SeriesCount, DbError> {
                Ok(SeriesCount {
                    labels: serde_json::from_str(&json)?,
                    samples: n.max(0) as u64,
                })
            })
            .collect::<Result<Vec<_>, DbError>>()?;

        let (min_time, max_time): (Option<i64>, Option<i64>) =
            conn.query_row("SELECT MIN(t), MAX(t) FROM samples", [], |r| Ok((r.get(0)?, r.get(1)?)))?;

        let mut by_metric: HashMap<String, u64> = HashMap::new();
        let mut values_by_name: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut bytes_by_name: HashMap<String, u64> = HashMap::new();
        let mut by_pair: HashMap<String, u64> = HashMap::new();
        let mut chunk_count = 0u64;

        for c in &counts {
            chunk_count += c.samples.div_ceil(SAMPLES_PER_CHUNK);
            *by_metric
                .entry(c.labels.get(METRIC_NAME).to_string())
                .or_default() += 1;
            for (name, value) in c.labels.iter() {
                if values_by_name
                    .entry(name.to_string())
                    .or_default()
                    .insert(value.to_string())
                {
                    *bytes_by_name.entry(name.to_string()).or_default() += value.len() as u64;
                }
                *by_pair.entry(format!("{}={}", name, value)).or_default() += 1;
            }
        }

        let num_label_pairs = values_by_name.values().map(|v| v.len() as u64).sum();
        let value_counts = values_by_name
            .into_iter()
            .map(|(k, v)| (k, v.len() as u64))
            .collect();

        Ok(TsdbStats {
            head_stats: HeadStats {
                num_series: counts.len() as u64,
                num_label_pairs,
                chunk_count,
                min_time: min_time.unwrap_or(0),
                max_time: max_time.unwrap_or(0),
            },
            series_count_by_metric_name: top_n(by_metric, limit),
            label_value_count_by_label_name: top_n(value_counts, limit),
            memory_in_bytes_by_label_name: top_n(bytes_by_name, limit),
            series_count_by_label_value_pair: top_n(by_pair, limit),
        })
    }

    /// One block per UTC day of stored samples.
    pub fn block_metas(&self) -> Result<Vec<BlockMeta>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t / ?1 AS day, MIN(t), MAX(t), COUNT(*), COUNT(DISTINCT series_id)
             FROM samples GROUP BY day ORDER BY day",
        )?;
        let parts = stmt
            .query_map(params![DAY_MS], |r| {
                Ok(DayPartition {
                    day: r.get(0)?,
                    min_time: r.get(1)?,
                    max_time: r.get(2)?,
                    num_samples: r.get::<_, i64>(3)?.max(0) as u64,
                    num_series: r.get::<_, i64>(4)?.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(parts
            .into_iter()
            .map(|p| BlockMeta {
                ulid: block_id(p.day),
                min_time: p.min_time,
                max_time: p.max_time,
                stats: BlockStats {
                    num_samples: p.num_samples,
                    num_series: p.num_series,
                },
                version: 1,
            })
            .collect())
    }
}

/// Insert the series if new and return its id.
fn upsert_series(conn: &Connection, labels: &Labels) -> Result<i64, DbError> {
    let json = serde_json::to_string(labels)?;
    conn.execute(
        "INSERT OR IGNORE INTO series (metric_name, labels) VALUES (?1, ?2)",
        params![labels.get(METRIC_NAME), json],
    )?;
    let id = conn
        .query_row("SELECT id FROM series WHERE labels = ?1", params![json], |r| r.get(0))
        .optional()?;
    id.ok_or(DbError::NotFound)
}

/// Series accepted by every matcher. With a window, only series holding a
/// live (non-tombstoned) sample inside it.
fn series_matching(
    conn: &Connection,
    matchers: &[Matcher],
    window: Option<(Timestamp, Timestamp)>,
) -> Result<Vec<SeriesRow>, DbError> {
    let name = matchers
        .iter()
        .find(|m| m.kind == MatchType::Equal && m.name == METRIC_NAME)
        .map(|m| m.value.clone());

    let raw = match window {
        Some((mint, maxt)) => {
            let mut stmt = conn.prepare(
                "SELECT id, labels FROM series
                 WHERE (?1 IS NULL OR metric_name = ?1)
                   AND EXISTS (
                       SELECT 1 FROM samples s
                       WHERE s.series_id = series.id AND s.t BETWEEN ?2 AND ?3
                         AND NOT EXISTS (SELECT 1 FROM tombstones tb
                                         WHERE tb.series_id = s.series_id
                                           AND s.t BETWEEN tb.mint AND tb.maxt))
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![name, mint, maxt], |r| {
                    Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, labels FROM series WHERE (?1 IS NULL OR metric_name = ?1) ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![name], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };

    let mut out = Vec::with_capacity(raw.len());
    for (id, json) in raw {
        let labels: Labels = serde_json::from_str(&json)?;
        if matches_all(matchers, &labels) {
            out.push(SeriesRow { id, labels });
        }
    }
    Ok(out)
}

fn limited(set: BTreeSet<String>, limit: usize) -> Vec<String> {
    let mut out: Vec<String> = set.into_iter().collect();
    if limit > 0 {
        out.truncate(limit);
    }
    out
}

/// Highest counts first, ties by name.
fn top_n(counts: HashMap<String, u64>, limit: usize) -> Vec<Stat> {
    let mut stats: Vec<Stat> = counts
        .into_iter()
        .map(|(name, value)| Stat { name, value })
        .collect();
    stats.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.name.cmp(&b.name)));
    stats.truncate(limit);
    stats
}

fn block_id(day: i64) -> String {
    match crate::model::to_datetime(day * DAY_MS) {
        Some(dt) => format!("day-{}", dt.format("%Y%m%d")),
        None => format!("day-{}", day),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().copied().collect()
    }

    fn up(job: &str) -> Labels {
        labels(&[("__name__", "up"), ("job", job)])
    }

    #[test]
    fn test_append_and_select() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store.append(&up("b"), 1000, 1.0).unwrap();
        store.append(&up("a"), 1000, 2.0).unwrap();
        store.append(&up("a"), 2000, f64::NAN).unwrap();
        store.append(&labels(&[("__name__", "other")]), 1000, 3.0).unwrap();

        let series = store
            .select(&[Matcher::equal(METRIC_NAME, "up")], 0, 10_000, 0)
            .unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].labels.get("job"), "a");
        assert_eq!(series[0].samples.len(), 2);
        assert!(series[0].samples[1].v.is_nan());

        // Window excludes everything
        let series = store
            .select(&[Matcher::equal(METRIC_NAME, "up")], 5000, 10_000, 0)
            .unwrap();
        assert!(series.is_empty());

        // Limit
        let series = store
            .select(&[Matcher::equal(METRIC_NAME, "up")], 0, 10_000, 1)
            .unwrap();
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_label_names_and_values() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.append(&up("a"), 1000, 1.0).unwrap();
        store
            .append(&labels(&[("__name__", "node"), ("instance", "h1")]), 1000, 1.0)
            .unwrap();

        let names = store.label_names(&[], 0, 2000, 0).unwrap();
        assert_eq!(names, vec!["__name__", "instance", "job"]);

        let values = store.label_values(METRIC_NAME, &[], 0, 2000, 0).unwrap();
        assert_eq!(values, vec!["node", "up"]);

        let values = store.label_values(METRIC_NAME, &[], 0, 2000, 1).unwrap();
        assert_eq!(values, vec!["node"]);
    }

    #[test]
    fn test_delete_and_clean_tombstones() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.append(&up("a"), 1000, 1.0).unwrap();
        store.append(&up("a"), 2000, 2.0).unwrap();

        let deleted = store
            .delete(&[Matcher::equal("job", "a")], 0, 1500)
            .unwrap();
        assert_eq!(deleted, 1);

        let series = store.select(&[Matcher::equal("job", "a")], 0, 3000, 0).unwrap();
        assert_eq!(series[0].samples, vec![Sample::new(2000, 2.0)]);

        store.clean_tombstones().unwrap();
        let series = store.select(&[Matcher::equal("job", "a")], 0, 3000, 0).unwrap();
        assert_eq!(series[0].samples.len(), 1);
    }

    #[test]
    fn test_exemplars() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store
            .append_exemplar(&up("a"), &labels(&[("trace_id", "t1")]), 1500, 6.0)
            .unwrap();
        store
            .append_exemplar(&up("b"), &labels(&[("trace_id", "t2")]), 9000, 1.0)
            .unwrap();

        let sets = vec![vec![Matcher::equal(METRIC_NAME, "up")]];
        let results = store.exemplars(&sets, 0, 2000).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].series_labels.get("job"), "a");
        assert_eq!(results[0].exemplars[0].labels.get("trace_id"), "t1");
    }

    #[test]
    fn test_snapshot_and_stats() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.append(&up("a"), 1000, 1.0).unwrap();
        store.append(&up("b"), 2000, 1.0).unwrap();

        let dir = tempdir().unwrap();
        let target = dir.path().join("copy.db");
        store.snapshot_to(&target).unwrap();

        let copy = Store::new(&target).unwrap();
        assert_eq!(copy.select(&[], 0, 3000, 0).unwrap().len(), 2);

        let stats = store.stats(10).unwrap();
        assert_eq!(stats.head_stats.num_series, 2);
        assert_eq!(stats.head_stats.min_time, 1000);
        assert_eq!(stats.head_stats.max_time, 2000);
        assert_eq!(stats.head_stats.chunk_count, 2);
        assert_eq!(stats.series_count_by_metric_name[0].name, "up");
        assert_eq!(stats.series_count_by_metric_name[0].value, 2);

        let blocks = store.block_metas().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].stats.num_samples, 2);
        assert_eq!(blocks[0].ulid, "day-19700101");
    }
}
