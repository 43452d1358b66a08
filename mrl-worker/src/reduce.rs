use std::collections::{BTreeMap, HashSet};

use anyhow::Error;
use serde_json::{Map, Value};
use tracing::{debug, info};

use common::message::ReduceAssignment;
use common::{Record, Workload};

/// State of the reduce task running on this node.
///
/// Values are grouped by key as splits arrive. Once every map split of the
/// job has been added, [`ReduceContext::finish`] applies the reduce function
/// to each key, in key order.
pub struct ReduceContext {
    pub job_id: u64,
    pub bucket_id: u32,
    maps: u32,
    workload: Workload,
    aux: Vec<String>,
    groups: BTreeMap<String, Vec<Value>>,
    splits: HashSet<String>,
}

impl ReduceContext {
    pub fn new(assignment: &ReduceAssignment) -> Result<Self, Error> {
        let job = &assignment.job;
        let workload = workload::named(&job.workload)?;

        info!(
            "Received reduce task for job {} bucket {} with workload `{}`",
            job.job_id, assignment.reduce_status.bucket_id, job.workload
        );

        Ok(Self {
            job_id: job.job_id,
            bucket_id: assignment.reduce_status.bucket_id,
            maps: job.maps,
            workload,
            aux: job.aux().to_vec(),
            groups: BTreeMap::new(),
            splits: HashSet::new(),
        })
    }

    /// Whether `assignment` is about this reduce task.
    pub fn matches(&self, assignment: &ReduceAssignment) -> bool {
        assignment.job.job_id == self.job_id && assignment.reduce_status.bucket_id == self.bucket_id
    }

    pub fn has_split(&self, split_id: &str) -> bool {
        self.splits.contains(split_id)
    }

    /// Add the records of one map split.
    pub fn add_split(&mut self, split_id: impl Into<String>, records: Vec<Record>) {
        let split_id = split_id.into();
        debug!(
            "bucket {} received {} records from split `{split_id}`",
            self.bucket_id,
            records.len()
        );

        for record in records {
            let (key, value): (String, Value) = record.into();
            self.groups.entry(key).or_default().push(value);
        }
        self.splits.insert(split_id);
    }

    /// Whether every map split of the job has been added.
    pub fn is_complete(&self) -> bool {
        self.splits.len() >= self.maps as usize
    }

    /// Reduce every key. The output maps each key to its reduced value.
    pub fn finish(self) -> Result<Value, Error> {
        let reduce_fn = self.workload.reduce_fn;

        let mut output = Map::new();
        for (key, values) in self.groups {
            let reduced = reduce_fn(&key, Box::new(values.into_iter()), &self.aux)?;
            output.insert(key, reduced);
        }

        info!(
            "bucket {} of job {} reduced to {} keys",
            self.bucket_id,
            self.job_id,
            output.len()
        );
        Ok(Value::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use common::job::{Extra, JobSpec, ReduceStatus};

    use super::*;

    fn assignment(maps: u32, workload: &str) -> ReduceAssignment {
        ReduceAssignment {
            job: JobSpec::new(5, maps, 3, workload),
            reduce_status: ReduceStatus::new(1),
            extra: Extra::new(),
        }
    }

    #[test]
    fn groups_values_across_splits() {
        let mut context = ReduceContext::new(&assignment(2, "wc")).unwrap();
        assert!(!context.is_complete());

        context.add_split("s1", vec![Record::new("a", 1), Record::new("d", 1)]);
        assert!(context.has_split("s1"));
        assert!(!context.is_complete());

        context.add_split("s2", vec![Record::new("a", 1), Record::new("a", 1)]);
        assert!(context.is_complete());

        assert_eq!(context.finish().unwrap(), json!({"a": 3, "d": 1}));
    }

    #[test]
    fn no_maps_means_nothing_to_wait_for() {
        let context = ReduceContext::new(&assignment(0, "wc")).unwrap();
        assert!(context.is_complete());
        assert_eq!(context.finish().unwrap(), json!({}));
    }

    #[test]
    fn reduce_errors_surface() {
        let mut context = ReduceContext::new(&assignment(1, "wc")).unwrap();
        context.add_split("s1", vec![Record::new("a", "not a number")]);
        assert!(context.finish().is_err());
    }

    #[test]
    fn unknown_workload_is_rejected() {
        assert!(ReduceContext::new(&assignment(1, "nope")).is_err());
    }

    #[test]
    fn matches_only_its_own_bucket() {
        let context = ReduceContext::new(&assignment(1, "wc")).unwrap();
        let mut other = assignment(1, "wc");
        assert!(context.matches(&other));
        other.reduce_status.bucket_id = 2;
        assert!(!context.matches(&other));
    }
}
