use super::types::{IngestOutcome, Sample};

#[derive(Clone, Debug)]
struct Entry {
    bucket: i64,
    sample: Sample,
}

/// Per-channel sample sequence, kept sorted by time bucket.
///
/// A sample landing in an occupied bucket replaces the stored one, so
/// correlated fields that arrive as separate messages collapse onto one
/// point.
#[derive(Debug, Default)]
pub(crate) struct ChannelBuffer {
    entries: Vec<Entry>,
}

impl ChannelBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, bucket: i64, sample: Sample) -> IngestOutcome {
        match self.entries.last() {
            None => {
                self.entries.push(Entry { bucket, sample });
                return IngestOutcome::Appended;
            }
            Some(last) if last.bucket < bucket => {
                self.entries.push(Entry { bucket, sample });
                return IngestOutcome::Appended;
            }
            Some(_) => {}
        }

        match self.entries.binary_search_by_key(&bucket, |entry| entry.bucket) {
            Ok(idx) => {
                self.entries[idx].sample = sample;
                IngestOutcome::Overwritten
            }
            Err(idx) => {
                self.entries.insert(idx, Entry { bucket, sample });
                IngestOutcome::Appended
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Sample> {
        self.entries.iter().map(|entry| entry.sample.clone()).collect()
    }

    pub(crate) fn into_samples(self) -> Vec<Sample> {
        self.entries.into_iter().map(|entry| entry.sample).collect()
    }
}

pub(crate) fn bucket_of(elapsed_micros: i64, resolution_ms: u64) -> i64 {
    let resolution_micros = (resolution_ms.max(1) as i64).saturating_mul(1000);
    let half = resolution_micros / 2;
    (elapsed_micros + half).div_euclid(resolution_micros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{Channel, ChannelKind};
    use chrono::Utc;

    fn sample(elapsed_secs: f64, value: f64) -> Sample {
        Sample {
            channel: Channel::new("relay1", ChannelKind::Pressure),
            elapsed_secs,
            value,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn bucket_rounds_to_resolution() {
        assert_eq!(bucket_of(0, 10), 0);
        assert_eq!(bucket_of(4_999, 10), 0);
        assert_eq!(bucket_of(5_000, 10), 1);
        assert_eq!(bucket_of(1_234_000, 10), 123);
        assert_eq!(bucket_of(1_236_000, 10), 124);
        assert_eq!(bucket_of(1_000, 0), 1);
    }

    #[test]
    fn same_bucket_overwrites_in_place() {
        let mut buffer = ChannelBuffer::new();
        assert_eq!(buffer.insert(100, sample(1.0, 10.0)), IngestOutcome::Appended);
        assert_eq!(buffer.insert(101, sample(1.01, 11.0)), IngestOutcome::Appended);
        assert_eq!(
            buffer.insert(101, sample(1.012, 12.0)),
            IngestOutcome::Overwritten
        );

        let samples = buffer.snapshot();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].value, 12.0);
    }

    #[test]
    fn late_sample_is_inserted_in_order() {
        let mut buffer = ChannelBuffer::new();
        buffer.insert(300, sample(3.0, 3.0));
        buffer.insert(100, sample(1.0, 1.0));
        buffer.insert(200, sample(2.0, 2.0));

        let elapsed: Vec<f64> = buffer
            .into_samples()
            .iter()
            .map(|sample| sample.elapsed_secs)
            .collect();
        assert_eq!(elapsed, vec![1.0, 2.0, 3.0]);
    }
}
