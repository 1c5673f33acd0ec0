use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use super::{DetectionRecord, LOG_HEADER};
use crate::TimeBucket;

const HALF_DAY_SECS: u32 = 12 * 60 * 60;

/// What a verified log contains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSummary {
    pub rows: u64,
    /// Frames with at least one survivor.
    pub frames: u64,
    pub first_bucket: Option<TimeBucket>,
    pub last_bucket: Option<TimeBucket>,
    /// Times the buckets wrapped past 23:59:59.
    pub day_rollovers: u64,
    /// Row count per class label.
    pub classes: BTreeMap<String, u64>,
}

/// Check a detection log end to end and call `on_row` for every valid row.
///
/// Fails on the first violation:
/// - header differs from `LOG_HEADER`
/// - confidence not written as `d.dd` or outside `[threshold, 1]`
/// - a frame's rows are not adjacent, or their count disagrees with the
///   number of detections they declare
/// - time buckets decrease, unless the drop is a wrap past midnight (the
///   previous bucket is more than half a day ahead of the new one)
pub fn verify_log_with<F>(path: &Path, threshold: f32, mut on_row: F) -> Result<LogSummary>
where
    F: FnMut(u64, &DetectionRecord),
{
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("open detection log {}", path.display()))?;
    let headers = reader.headers().context("read log header")?.clone();
    if headers.iter().ne(LOG_HEADER.iter().copied()) {
        return Err(anyhow!("unexpected log header {:?}", headers));
    }

    let mut summary = LogSummary::default();
    // (bucket, declared count, rows still expected) for the frame being read
    let mut open_frame: Option<(TimeBucket, usize, usize)> = None;

    for (idx, row) in reader.records().enumerate() {
        let line = idx as u64 + 2;
        let row = row.with_context(|| format!("line {}: unreadable row", line))?;
        let record = DetectionRecord::from_row(&row).with_context(|| format!("line {}", line))?;

        if !is_two_decimal(&row[2]) {
            return Err(anyhow!(
                "line {}: confidence '{}' is not written with two decimals",
                line,
                &row[2]
            ));
        }
        if record.confidence < threshold || record.confidence > 1.0 {
            return Err(anyhow!(
                "line {}: confidence {:.2} outside [{:.2}, 1.00]",
                line,
                record.confidence,
                threshold
            ));
        }
        if let Some(last) = summary.last_bucket {
            if is_rollover(last, record.time_bucket) {
                summary.day_rollovers += 1;
            } else if record.time_bucket < last {
                return Err(anyhow!(
                    "line {}: time bucket {} precedes {}",
                    line,
                    record.time_bucket,
                    last
                ));
            }
        }

        open_frame = match open_frame {
            Some((bucket, count, remaining)) => {
                if record.time_bucket != bucket || record.detections_in_frame != count {
                    return Err(anyhow!(
                        "line {}: frame at {} declared {} detections but only {} rows were written",
                        line,
                        bucket,
                        count,
                        count - remaining
                    ));
                }
                (remaining > 1).then_some((bucket, count, remaining - 1))
            }
            None => {
                if record.detections_in_frame == 0 {
                    return Err(anyhow!("line {}: row declares zero detections", line));
                }
                summary.frames += 1;
                let count = record.detections_in_frame;
                (count > 1).then_some((record.time_bucket, count, count - 1))
            }
        };

        summary.rows += 1;
        summary.first_bucket.get_or_insert(record.time_bucket);
        summary.last_bucket = Some(record.time_bucket);
        *summary.classes.entry(record.class_label.clone()).or_insert(0) += 1;
        on_row(line, &record);
    }

    if let Some((bucket, count, remaining)) = open_frame {
        return Err(anyhow!(
            "frame at {} declared {} detections but the log ends after {}",
            bucket,
            count,
            count - remaining
        ));
    }
    Ok(summary)
}

fn is_rollover(last: TimeBucket, next: TimeBucket) -> bool {
    next < last && last.as_secs() - next.as_secs() > HALF_DAY_SECS
}

fn is_two_decimal(raw: &str) -> bool {
    match raw.split_once('.') {
        Some((whole, frac)) => {
            !whole.is_empty()
                && whole.bytes().all(|b| b.is_ascii_digit())
                && frac.len() == 2
                && frac.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::DetectionLog;
    use tempfile::tempdir;

    fn rec(secs: u64, label: &str, conf: f32, n: usize) -> DetectionRecord {
        DetectionRecord::new(TimeBucket::from_secs(secs), label, conf, n)
    }

    fn write_raw(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("raw.csv");
        let text = format!("{}\r\n{}", LOG_HEADER.join(","), body);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn summarises_a_valid_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut log = DetectionLog::initialize(&path).unwrap();
        log.append(&[rec(0, "person", 0.91, 2), rec(0, "car", 0.55, 2)])
            .unwrap();
        log.append(&[rec(0, "person", 0.88, 1)]).unwrap();
        log.append(&[rec(3, "person", 0.42, 1)]).unwrap();

        let mut lines = Vec::new();
        let summary = verify_log_with(&path, 0.30, |line, _| lines.push(line)).unwrap();
        assert_eq!(lines, vec![2, 3, 4, 5]);
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.classes["person"], 3);
        assert_eq!(summary.last_bucket, Some(TimeBucket::from_secs(3)));
    }

    #[test]
    fn rejects_truncated_frame() {
        let dir = tempdir().unwrap();
        let path = write_raw(&dir, "00:00:01,person,0.50,2\r\n");
        let err = verify_log_with(&path, 0.30, |_, _| {}).unwrap_err();
        assert!(err.to_string().contains("declared 2"));
    }

    #[test]
    fn rejects_interleaved_frames() {
        let dir = tempdir().unwrap();
        let path = write_raw(
            &dir,
            "00:00:01,person,0.50,2\r\n00:00:01,car,0.60,3\r\n00:00:01,dog,0.60,3\r\n",
        );
        assert!(verify_log_with(&path, 0.30, |_, _| {}).is_err());
    }

    #[test]
    fn rejects_low_or_unrounded_confidence() {
        let dir = tempdir().unwrap();
        let low = write_raw(&dir, "00:00:01,person,0.25,1\r\n");
        assert!(verify_log_with(&low, 0.30, |_, _| {}).is_err());
        let long = write_raw(&dir, "00:00:01,person,0.456,1\r\n");
        let err = verify_log_with(&long, 0.30, |_, _| {}).unwrap_err();
        assert!(err.to_string().contains("two decimals"));
    }

    #[test]
    fn rejects_decreasing_buckets() {
        let dir = tempdir().unwrap();
        let path = write_raw(&dir, "00:00:05,person,0.50,1\r\n00:00:04,person,0.50,1\r\n");
        let err = verify_log_with(&path, 0.30, |_, _| {}).unwrap_err();
        assert!(err.to_string().contains("precedes"));
    }

    #[test]
    fn accepts_wrap_past_midnight() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut log = DetectionLog::initialize(&path).unwrap();
        let before = TimeBucket::from_elapsed(std::time::Duration::from_secs(86_399));
        let after = TimeBucket::from_elapsed(std::time::Duration::from_secs(86_400));
        log.append(&[DetectionRecord::new(before, "person", 0.80, 1)])
            .unwrap();
        log.append(&[DetectionRecord::new(after, "person", 0.81, 1)])
            .unwrap();
        log.append(&[DetectionRecord::new(after, "car", 0.50, 1)])
            .unwrap();

        let summary = verify_log_with(&path, 0.30, |_, _| {}).unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.day_rollovers, 1);
        assert_eq!(summary.last_bucket, Some(TimeBucket::from_secs(0)));
    }

    #[test]
    fn rejects_regression_after_wrap() {
        let dir = tempdir().unwrap();
        let path = write_raw(
            &dir,
            "23:59:59,person,0.50,1\r\n00:00:10,person,0.50,1\r\n00:00:09,person,0.50,1\r\n",
        );
        let err = verify_log_with(&path, 0.30, |_, _| {}).unwrap_err();
        assert!(err.to_string().starts_with("line 4"));
    }

    #[test]
    fn two_decimal_format() {
        assert!(is_two_decimal("0.42"));
        assert!(is_two_decimal("1.00"));
        assert!(!is_two_decimal("1"));
        assert!(!is_two_decimal(".42"));
        assert!(!is_two_decimal("0.4"));
    }
}
