//! Transform-applying range wrapper
//!
//! Wraps any [`DataRange`] and runs a parsed pipeline over each datapoint.
//! Datapoints dropped by a filter stage vanish from the output; a datapoint
//! whose evaluation fails is dropped as well, with the failure recorded on
//! the iterator and logged. Iteration itself never fails on an evaluation
//! error.

use crate::core::{Datapoint, DatapointArray, Error, Result};
use crate::range::DataRange;
use crate::transform::Pipeline;
use async_trait::async_trait;
use tracing::warn;

/// A range filtered and projected by a transform pipeline
pub struct TransformRange {
    inner: Box<dyn DataRange>,
    pipeline: Pipeline,
    last_error: Option<Error>,
    error_count: u64,
}

impl TransformRange {
    /// Parse `source` and wrap `inner` with the resulting pipeline
    pub fn new(inner: Box<dyn DataRange>, source: &str) -> Result<Self> {
        Ok(Self {
            inner,
            pipeline: crate::transform::parse(source)?,
            last_error: None,
            error_count: 0,
        })
    }

    /// Wrap `inner` with an already-parsed pipeline
    pub fn with_pipeline(inner: Box<dyn DataRange>, pipeline: Pipeline) -> Self {
        Self {
            inner,
            pipeline,
            last_error: None,
            error_count: 0,
        }
    }

    /// The most recent evaluation failure, if any
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// How many datapoints were dropped by evaluation failures
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Drain the remaining datapoints into an array
    pub async fn next_array(&mut self) -> Result<DatapointArray> {
        let mut out = DatapointArray::new();
        while let Some(dp) = self.next().await? {
            out.push(dp);
        }
        Ok(out)
    }
}

#[async_trait]
impl DataRange for TransformRange {
    async fn init(&mut self) -> Result<()> {
        self.inner.init().await
    }

    async fn next(&mut self) -> Result<Option<Datapoint>> {
        loop {
            let Some(dp) = self.inner.next().await? else {
                return Ok(None);
            };
            match self.pipeline.apply(&dp) {
                Ok(Some(out)) => return Ok(Some(out)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(timestamp = dp.timestamp, error = %e, "transform dropped datapoint");
                    self.last_error = Some(e);
                    self.error_count += 1;
                    continue;
                }
            }
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::DatapointArrayRange;
    use serde_json::json;

    fn json_points(values: &[serde_json::Value]) -> DatapointArray {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Datapoint::new(i as i64 + 1, serde_json::to_vec(v).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_filter_and_project() {
        let input = json_points(&[
            json!(1),
            json!(10),
            json!(7),
            json!(1.0),
            json!(3),
            json!(2.0),
            json!(3.14),
        ]);
        let inner = Box::new(DatapointArrayRange::new(input, 0));
        let mut tr = TransformRange::new(inner, "if get() < 5 : get() >= 3").unwrap();
        tr.init().await.unwrap();

        let expected = [
            json!(false),
            json!(false),
            json!(true),
            json!(false),
            json!(true),
        ];
        for want in &expected {
            let dp = tr.next().await.unwrap().expect("stream ended early");
            let got: serde_json::Value = serde_json::from_slice(&dp.data).unwrap();
            assert_eq!(&got, want);
        }
        assert_eq!(tr.next().await.unwrap(), None);
        tr.close();
    }

    #[tokio::test]
    async fn test_next_array() {
        let input = json_points(&[json!(1), json!(10), json!(7), json!(1.0), json!(3)]);
        let inner = Box::new(DatapointArrayRange::new(input, 0));
        let mut tr = TransformRange::new(inner, "if get() < 5 : get() >= 3").unwrap();
        tr.init().await.unwrap();

        let out = tr.next_array().await.unwrap();
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn test_eval_errors_drop_but_do_not_stop() {
        // The middle payload is a string; arithmetic on it fails
        let input = json_points(&[json!(1), json!("oops"), json!(2)]);
        let inner = Box::new(DatapointArrayRange::new(input, 0));
        let mut tr = TransformRange::new(inner, "$ + 1").unwrap();
        tr.init().await.unwrap();

        let out = tr.next_array().await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(tr.error_count(), 1);
        assert!(matches!(tr.last_error(), Some(Error::TransformEval(_))));
    }

    #[tokio::test]
    async fn test_timestamp_and_sender_pass_through() {
        let dp = Datapoint::new(42, serde_json::to_vec(&json!(5)).unwrap()).with_sender("probe");
        let inner = Box::new(DatapointArrayRange::new(DatapointArray(vec![dp]), 0));
        let mut tr = TransformRange::new(inner, "$ * 2").unwrap();
        tr.init().await.unwrap();

        let out = tr.next().await.unwrap().unwrap();
        assert_eq!(out.timestamp, 42);
        assert_eq!(out.sender, "probe");
        let v: serde_json::Value = serde_json::from_slice(&out.data).unwrap();
        assert_eq!(v, json!(10.0));
    }

    #[tokio::test]
    async fn test_parse_failure_surfaces() {
        let inner = Box::new(DatapointArrayRange::new(DatapointArray::new(), 0));
        assert!(TransformRange::new(inner, "if get() <").is_err());
    }
}
