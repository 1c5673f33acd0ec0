use anyhow::{anyhow, Context, Result};

use crate::detect::Detection;
use crate::TimeBucket;

/// One row of the detection log: a single surviving detection of one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRecord {
    pub time_bucket: TimeBucket,
    pub class_label: String,
    /// Rounded to two decimals at construction.
    pub confidence: f32,
    /// Survivors in the originating frame; equal across that frame's rows.
    pub detections_in_frame: usize,
}

impl DetectionRecord {
    pub fn new(
        time_bucket: TimeBucket,
        class_label: impl Into<String>,
        confidence: f32,
        detections_in_frame: usize,
    ) -> Self {
        Self {
            time_bucket,
            class_label: class_label.into(),
            confidence: round_confidence(confidence),
            detections_in_frame,
        }
    }

    /// One record per survivor, all sharing `bucket` and the survivor count.
    /// Empty input yields no records.
    pub fn for_frame(bucket: TimeBucket, survivors: &[Detection]) -> Vec<Self> {
        survivors
            .iter()
            .map(|det| Self::new(bucket, det.label.clone(), det.confidence, survivors.len()))
            .collect()
    }

    pub(crate) fn to_row(&self) -> [String; 4] {
        [
            self.time_bucket.to_string(),
            self.class_label.clone(),
            format!("{:.2}", self.confidence),
            self.detections_in_frame.to_string(),
        ]
    }

    pub(crate) fn from_row(row: &csv::StringRecord) -> Result<Self> {
        if row.len() != 4 {
            return Err(anyhow!("expected 4 fields, found {}", row.len()));
        }
        let time_bucket: TimeBucket = row[0].parse()?;
        let confidence: f32 = row[2]
            .parse()
            .with_context(|| format!("invalid confidence '{}'", &row[2]))?;
        let detections_in_frame: usize = row[3]
            .parse()
            .with_context(|| format!("invalid detection count '{}'", &row[3]))?;
        Ok(Self {
            time_bucket,
            class_label: row[1].to_string(),
            confidence,
            detections_in_frame,
        })
    }
}

pub fn round_confidence(confidence: f32) -> f32 {
    (confidence * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn rounds_confidence_to_two_places() {
        assert_eq!(round_confidence(0.4249), 0.42);
        assert_eq!(round_confidence(0.425_1), 0.43);
        assert_eq!(round_confidence(1.0), 1.0);
        let rec = DetectionRecord::new(TimeBucket::from_secs(5), "person", 0.876, 1);
        assert_eq!(rec.to_row()[2], "0.88");
    }

    #[test]
    fn frame_records_share_bucket_and_count() {
        let bucket = TimeBucket::from_secs(12);
        let survivors = vec![
            Detection::new(BoundingBox::new(0.0, 0.0, 1.0, 1.0), "person", 0.9),
            Detection::new(BoundingBox::new(2.0, 2.0, 3.0, 3.0), "dog", 0.35),
        ];
        let records = DetectionRecord::for_frame(bucket, &survivors);
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.time_bucket == bucket && r.detections_in_frame == 2));
        assert!(DetectionRecord::for_frame(bucket, &[]).is_empty());
    }

    #[test]
    fn row_format_matches_log_columns() {
        let rec = DetectionRecord::new(TimeBucket::from_secs(3_661), "traffic light", 0.3, 3);
        assert_eq!(rec.to_row(), ["01:01:01", "traffic light", "0.30", "3"]);
        let parsed =
            DetectionRecord::from_row(&csv::StringRecord::from(rec.to_row().to_vec())).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn rejects_rows_with_wrong_shape() {
        let short = csv::StringRecord::from(vec!["00:00:01", "person", "0.50"]);
        assert!(DetectionRecord::from_row(&short).is_err());
        let bad = csv::StringRecord::from(vec!["00:00:01", "person", "high", "1"]);
        assert!(DetectionRecord::from_row(&bad).is_err());
    }
}
