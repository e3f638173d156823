use na::{DMatrix, DVector};

use crate::{Error, Result};

/// Fixed width vectors recorded against millisecond timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorLog {
    dim: usize,
    timestamps: Vec<i64>,
    values: Vec<DVector<f64>>,
}

impl VectorLog {
    pub fn new(dim: usize) -> Self {
        VectorLog {
            dim,
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Record `value` at `time`. Out of order records are inserted in place;
    /// a record at an existing timestamp replaces it.
    pub fn record(&mut self, time: i64, value: DVector<f64>) -> Result<()> {
        Error::check_size("logged vector", self.dim, value.len())?;
        match self.timestamps.last() {
            Some(&last) if last < time => {
                self.timestamps.push(time);
                self.values.push(value);
            }
            None => {
                self.timestamps.push(time);
                self.values.push(value);
            }
            Some(_) => match self.timestamps.binary_search(&time) {
                Ok(i) => self.values[i] = value,
                Err(i) => {
                    self.timestamps.insert(i, time);
                    self.values.insert(i, value);
                }
            },
        }
        Ok(())
    }

    /// The value in effect at `time`: the latest record at or before it, or
    /// the first record if `time` precedes the log.
    pub fn value_at(&self, time: i64) -> Option<&DVector<f64>> {
        if self.values.is_empty() {
            return None;
        }
        let i = self.timestamps.partition_point(|&t| t <= time);
        Some(&self.values[i.saturating_sub(1)])
    }

    /// Resample `steps` columns spaced `period` milliseconds apart, the first
    /// one at `start`. An empty log resamples to zeros.
    pub fn values_starting_at(&self, start: i64, steps: usize, period: i64) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.dim, steps);
        for i in 0..steps {
            let time = start + i as i64 * period;
            if let Some(value) = self.value_at(time) {
                out.column_mut(i).copy_from(value);
            }
        }
        out
    }

    /// Milliseconds of history recorded before `time`.
    pub fn available_history_before(&self, time: i64) -> i64 {
        match self.timestamps.first() {
            Some(&first) if first < time => time - first,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(x: f64) -> DVector<f64> {
        DVector::from_element(1, x)
    }

    #[test]
    fn resampling_takes_the_latest_record() {
        let mut log = VectorLog::new(1);
        for t in (0..=100).step_by(10) {
            log.record(t, scalar(t as f64)).unwrap();
        }
        let window = log.values_starting_at(20, 5, 20);
        assert_eq!(
            window,
            DMatrix::from_row_slice(1, 5, &[20.0, 40.0, 60.0, 80.0, 100.0])
        );

        // Between records the earlier one holds.
        let held = log.values_starting_at(25, 2, 10);
        assert_eq!(held, DMatrix::from_row_slice(1, 2, &[20.0, 30.0]));

        // Before the first record the first value is used, past the last
        // record the last value holds.
        assert_eq!(
            log.values_starting_at(-5, 2, 110),
            DMatrix::from_row_slice(1, 2, &[0.0, 100.0])
        );
    }

    #[test]
    fn available_history() {
        let mut log = VectorLog::new(2);
        assert_eq!(log.available_history_before(100), 0);
        log.record(40, DVector::zeros(2)).unwrap();
        log.record(90, DVector::zeros(2)).unwrap();
        assert_eq!(log.available_history_before(100), 60);
        assert_eq!(log.available_history_before(30), 0);
    }

    #[test]
    fn out_of_order_records_are_sorted() {
        let mut log = VectorLog::new(1);
        log.record(20, scalar(2.0)).unwrap();
        log.record(10, scalar(1.0)).unwrap();
        log.record(20, scalar(3.0)).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.value_at(15), Some(&scalar(1.0)));
        assert_eq!(log.value_at(25), Some(&scalar(3.0)));
        assert!(matches!(
            log.record(30, DVector::zeros(2)),
            Err(Error::SizeMismatch { .. })
        ));
    }
}
