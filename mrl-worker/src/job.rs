//! Bookkeeping for the tasks this node has been assigned.

use std::fmt;

use anyhow::{anyhow, bail, Error};
use fnv::{FnvHashMap, FnvHashSet};

use common::job::Role;
use common::message::{Ack, MapAssignment, ReduceAssignment, TaskFailure};

/// What a job asks of this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Map { split_id: String },
    Reduce { bucket_id: u32 },
}

/// The task this node is working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: u64,
    pub task: Task,

    /// Number of reduce buckets (`R`).
    pub reducers: u32,

    /// Number of map splits (`M`).
    pub maps: u32,

    /// Name of the MapReduce application.
    pub workload: String,
}

impl Job {
    pub fn from_map(assignment: &MapAssignment) -> Self {
        Self {
            job_id: assignment.job.job_id,
            task: Task::Map {
                split_id: assignment.map_status.split_id.clone(),
            },
            reducers: assignment.job.reducers,
            maps: assignment.job.maps,
            workload: assignment.job.workload.clone(),
        }
    }

    pub fn from_reduce(assignment: &ReduceAssignment) -> Self {
        Self {
            job_id: assignment.job.job_id,
            task: Task::Reduce {
                bucket_id: assignment.reduce_status.bucket_id,
            },
            reducers: assignment.job.reducers,
            maps: assignment.job.maps,
            workload: assignment.job.workload.clone(),
        }
    }

    pub fn role(&self) -> Role {
        match self.task {
            Task::Map { .. } => Role::Map,
            Task::Reduce { .. } => Role::Reduce,
        }
    }

    /// Build the typed failure report for this job.
    pub fn failure(&self, reason: impl Into<String>) -> TaskFailure {
        let (split_id, bucket_id) = match &self.task {
            Task::Map { split_id } => (Some(split_id.clone()), None),
            Task::Reduce { bucket_id } => (None, Some(*bucket_id)),
        };

        TaskFailure {
            job_id: self.job_id,
            role: self.role(),
            split_id,
            bucket_id,
            reason: reason.into(),
        }
    }

    fn is_map(&self, job_id: u64, split: &str) -> bool {
        matches!(&self.task, Task::Map { split_id } if self.job_id == job_id && split_id == split)
    }

    fn is_reduce(&self, job_id: u64, bucket: u32) -> bool {
        matches!(self.task, Task::Reduce { bucket_id } if self.job_id == job_id && bucket_id == bucket)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            Task::Map { split_id } => write!(f, "job {} map split `{split_id}`", self.job_id),
            Task::Reduce { bucket_id } => {
                write!(f, "job {} reduce bucket {bucket_id}", self.job_id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Assigned,
    Completed,
    Failed,
    Abandoned,
}

/// Outcome of an accepted acknowledgement.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The active job is over (completed or failed).
    Finished(Job),

    /// A reduce split was acknowledged; the reduce task goes on.
    Progress,
}

/// Tracks the active job and the fate of every task seen so far.
#[derive(Debug, Default)]
pub struct JobRegistry {
    active: Option<Job>,

    /// Map tasks by `(job, split)`.
    map_tasks: FnvHashMap<(u64, String), TaskState>,

    /// Reduce tasks by `(job, bucket)`.
    reduce_tasks: FnvHashMap<(u64, u32), TaskState>,

    /// Splits acknowledged for the active reduce task.
    reduce_splits: FnvHashSet<String>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&Job> {
        self.active.as_ref()
    }

    /// Last recorded state of `job`'s task.
    pub fn state(&self, job: &Job) -> Option<TaskState> {
        match &job.task {
            Task::Map { split_id } => self.map_tasks.get(&(job.job_id, split_id.clone())).copied(),
            Task::Reduce { bucket_id } => self.reduce_tasks.get(&(job.job_id, *bucket_id)).copied(),
        }
    }

    /// Splits acknowledged so far for the active reduce task.
    pub fn reduce_splits(&self) -> usize {
        self.reduce_splits.len()
    }

    /// Make `job` the active job. Fails when another job is active.
    ///
    /// Returns the state of an earlier attempt at the same task. Tasks of
    /// other jobs are forgotten.
    pub fn start(&mut self, job: Job) -> Result<Option<TaskState>, Error> {
        if let Some(active) = &self.active {
            bail!("cannot start {job} while {active} is active");
        }

        let job_id = job.job_id;
        self.map_tasks.retain(|(id, _), _| *id == job_id);
        self.reduce_tasks.retain(|(id, _), _| *id == job_id);

        let previous = self.state(&job);
        self.set_state(&job, TaskState::Assigned);
        self.reduce_splits.clear();
        self.active = Some(job);
        Ok(previous)
    }

    /// Whether a `reduceSplit` assignment belongs to the active reduce task.
    pub fn accepts_split(&self, assignment: &ReduceAssignment) -> bool {
        self.active.as_ref().is_some_and(|job| {
            job.is_reduce(assignment.job.job_id, assignment.reduce_status.bucket_id)
        })
    }

    /// Check an acknowledgement from the executor against the active job.
    ///
    /// Returns an error, and changes nothing, when the acknowledgement is not
    /// about the active job.
    pub fn acknowledge(&mut self, ack: &Ack) -> Result<AckOutcome, Error> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| anyhow!("`{}` acknowledgement without an active job", ack.action()))?;

        match ack {
            Ack::Socket(_) => bail!("socket acknowledgements are sent by the node itself"),
            Ack::MapTask(done) => {
                if !active.is_map(done.job_id, &done.map_status.split_id) {
                    bail!(
                        "map acknowledgement for job {} split `{}` does not match {active}",
                        done.job_id,
                        done.map_status.split_id
                    );
                }
                Ok(AckOutcome::Finished(self.finish(TaskState::Completed)?))
            }
            Ack::ReduceSplit(done) => {
                if !active.is_reduce(done.job_id, done.reduce_status.bucket_id) {
                    bail!(
                        "split acknowledgement for job {} bucket {} does not match {active}",
                        done.job_id,
                        done.reduce_status.bucket_id
                    );
                }
                let split_id = done
                    .reduce_status
                    .split_id
                    .as_ref()
                    .ok_or_else(|| anyhow!("split acknowledgement without a split id"))?;
                if !self.reduce_splits.insert(split_id.clone()) {
                    bail!("split `{split_id}` already acknowledged for {active}");
                }
                Ok(AckOutcome::Progress)
            }
            Ack::ReduceTask(done) => {
                if !active.is_reduce(done.job_id, done.reduce_status.bucket_id) {
                    bail!(
                        "reduce acknowledgement for job {} bucket {} does not match {active}",
                        done.job_id,
                        done.reduce_status.bucket_id
                    );
                }
                Ok(AckOutcome::Finished(self.finish(TaskState::Completed)?))
            }
            Ack::TaskFailed(failure) => {
                let matches = match (failure.role, &failure.split_id, failure.bucket_id) {
                    (Role::Map, Some(split), _) => active.is_map(failure.job_id, split),
                    (Role::Reduce, _, Some(bucket)) => active.is_reduce(failure.job_id, bucket),
                    _ => false,
                };
                if !matches {
                    bail!(
                        "failure report for job {} ({}) does not match {active}",
                        failure.job_id,
                        failure.role
                    );
                }
                Ok(AckOutcome::Finished(self.finish(TaskState::Failed)?))
            }
        }
    }

    /// Complete the active map task if it is writing `split_id`.
    pub fn complete_split(&mut self, split_id: &str) -> Option<Job> {
        let active = self.active.as_ref()?;
        if !matches!(&active.task, Task::Map { split_id: s } if s == split_id) {
            return None;
        }
        self.finish(TaskState::Completed).ok()
    }

    /// Mark the active job failed and drop it.
    pub fn fail(&mut self) -> Option<Job> {
        self.finish(TaskState::Failed).ok()
    }

    /// Drop the active job without an outcome.
    pub fn abandon(&mut self) -> Option<Job> {
        self.finish(TaskState::Abandoned).ok()
    }

    fn finish(&mut self, state: TaskState) -> Result<Job, Error> {
        let job = self.active.take().ok_or_else(|| anyhow!("no active job"))?;
        self.set_state(&job, state);
        self.reduce_splits.clear();
        Ok(job)
    }

    fn set_state(&mut self, job: &Job, state: TaskState) {
        match &job.task {
            Task::Map { split_id } => {
                self.map_tasks.insert((job.job_id, split_id.clone()), state);
            }
            Task::Reduce { bucket_id } => {
                self.reduce_tasks.insert((job.job_id, *bucket_id), state);
            }
        }
    }
}
