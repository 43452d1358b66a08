//! The executor shipped with the node: runs compiled-in workloads.
//!
//! Map output goes back to the node as `UPL mapOutput` chunks, where it is
//! partitioned; reduce input is fetched straight from peer nodes.

use std::collections::VecDeque;
use std::future;
use std::time::Duration;

use anyhow::{anyhow, bail, Error};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::debug;

use common::job::{ReduceStatus, Role};
use common::message::{
    Ack, Assign, Control, MapAssignment, Message, ReduceAck, ReduceAssignment, TaskFailure,
};
use common::Record;

use crate::job::Job;
use crate::map::{perform_map, read_split};
use crate::peer::PeerClient;
use crate::reduce::ReduceContext;

pub struct WorkloadExecutor {
    heartbeat: Duration,

    /// Queue assignments until a `CTL step` asks for them.
    interactive: bool,

    http: reqwest::Client,
    peers: PeerClient,
    queue: VecDeque<Assign>,
    reduce: Option<ReduceContext>,
}

impl WorkloadExecutor {
    pub fn new(heartbeat: Duration, resource: impl Into<String>) -> Self {
        Self {
            heartbeat,
            interactive: false,
            http: reqwest::Client::new(),
            peers: PeerClient::new(resource),
            queue: VecDeque::new(),
            reduce: None,
        }
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Serve `inbox` until it closes.
    pub async fn run(mut self, mut inbox: UnboundedReceiver<Message>, outbox: UnboundedSender<Message>) {
        let mut ticker: Option<Interval> = None;

        loop {
            tokio::select! {
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    self.handle(message, &outbox, &mut ticker).await;
                }
                _ = tick(&mut ticker) => {
                    if outbox.send(Message::heartbeat()).is_err() {
                        break;
                    }
                }
            }
        }

        debug!("executor inbox closed");
    }

    async fn handle(
        &mut self,
        message: Message,
        outbox: &UnboundedSender<Message>,
        ticker: &mut Option<Interval>,
    ) {
        match message {
            Message::Control(Control::Heartbeat) => {
                if ticker.is_none() {
                    let mut interval = time::interval(self.heartbeat);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    *ticker = Some(interval);
                }
            }
            Message::Control(Control::Step) => match self.queue.pop_front() {
                Some(assign) => self.perform(assign, outbox).await,
                None => log(outbox, "step requested but there is no pending work"),
            },
            Message::Assign(Assign::Idle(_)) => {
                if !self.queue.is_empty() || self.reduce.is_some() {
                    log(outbox, "going idle, dropping pending work");
                }
                self.queue.clear();
                self.reduce = None;
            }
            Message::Assign(assign) if self.interactive => self.queue.push_back(assign),
            Message::Assign(assign) => self.perform(assign, outbox).await,
            other => log(outbox, format!("executor ignores `{}` messages", other.kind())),
        }
    }

    async fn perform(&mut self, assign: Assign, outbox: &UnboundedSender<Message>) {
        match assign {
            Assign::MapTask(task) => self.map_task(task, outbox).await,
            Assign::ReduceTask(task) => self.reduce_task(task, outbox),
            Assign::ReduceSplit(task) => self.reduce_split(task, outbox).await,
            Assign::Idle(_) => {}
        }
    }

    async fn map_task(&mut self, task: MapAssignment, outbox: &UnboundedSender<Message>) {
        let split_id = task.map_status.split_id.clone();
        let result = match read_split(&task.map_status, &self.http).await {
            Ok(text) => perform_map(&task.job, &split_id, text, |message| {
                outbox.send(message).map_err(|_| anyhow!("node went away"))
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            fail(outbox, &Job::from_map(&task), e);
        }
    }

    fn reduce_task(&mut self, task: ReduceAssignment, outbox: &UnboundedSender<Message>) {
        match ReduceContext::new(&task) {
            Ok(context) if context.is_complete() => finish(outbox, context),
            Ok(context) => self.reduce = Some(context),
            Err(e) => fail(outbox, &Job::from_reduce(&task), e),
        }
    }

    async fn reduce_split(&mut self, task: ReduceAssignment, outbox: &UnboundedSender<Message>) {
        let Some(context) = self.reduce.as_mut().filter(|context| context.matches(&task)) else {
            log(
                outbox,
                format!(
                    "split for job {} bucket {} arrived without its reduce task",
                    task.job.job_id, task.reduce_status.bucket_id
                ),
            );
            return;
        };

        let Some(split_id) = task.reduce_status.split_id.clone() else {
            log(outbox, "reduce split assignment without a split id");
            return;
        };
        if context.has_split(&split_id) {
            log(outbox, format!("split `{split_id}` already reduced"));
            return;
        }

        let bucket_id = task.reduce_status.bucket_id;
        match fetch_split(&self.peers, &task.reduce_status, &split_id).await {
            Ok(records) => context.add_split(split_id.clone(), records),
            Err(e) => {
                self.reduce = None;
                fail(outbox, &Job::from_reduce(&task), e);
                return;
            }
        }

        let status = ReduceStatus::new(bucket_id).with_split(split_id);
        let _ = outbox.send(Message::Ack(Ack::ReduceSplit(ReduceAck::new(
            task.job.job_id,
            status,
        ))));

        if context.is_complete() {
            if let Some(context) = self.reduce.take() {
                finish(outbox, context);
            }
        }
    }
}

/// Resolves on the next heartbeat, or never when heartbeats are off.
async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

/// Fetch `split_id` from the first location that answers.
async fn fetch_split(
    peers: &PeerClient,
    status: &ReduceStatus,
    split_id: &str,
) -> Result<Vec<Record>, Error> {
    let locations = status.locations.as_deref().unwrap_or_default();
    if locations.is_empty() {
        bail!("no locations for split `{split_id}`");
    }

    let mut last_error = None;
    for location in locations {
        match peers.fetch(location, status.bucket_id, split_id).await {
            Ok(records) => return Ok(records),
            Err(e) => {
                debug!("fetch of split `{split_id}` from {location} failed: {e:#}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("split `{split_id}` unavailable")))
}

fn finish(outbox: &UnboundedSender<Message>, context: ReduceContext) {
    let (job_id, bucket_id) = (context.job_id, context.bucket_id);
    match context.finish() {
        Ok(output) => {
            let mut ack = ReduceAck::new(job_id, ReduceStatus::new(bucket_id));
            ack.output = Some(output);
            let _ = outbox.send(Message::Ack(Ack::ReduceTask(ack)));
        }
        Err(e) => {
            let failure = TaskFailure {
                job_id,
                role: Role::Reduce,
                split_id: None,
                bucket_id: Some(bucket_id),
                reason: format!("{e:#}"),
            };
            log(outbox, format!("reduce of bucket {bucket_id} failed: {e:#}"));
            let _ = outbox.send(Message::Ack(Ack::TaskFailed(failure)));
        }
    }
}

fn fail(outbox: &UnboundedSender<Message>, job: &Job, error: Error) {
    log(outbox, format!("{job} failed: {error:#}"));
    let _ = outbox.send(Message::Ack(Ack::TaskFailed(job.failure(format!("{error:#}")))));
}

fn log(outbox: &UnboundedSender<Message>, message: impl Into<String>) {
    let _ = outbox.send(Message::log(message));
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use common::job::{Extra, JobSpec, MapStatus};
    use common::message::Upload;

    use super::*;

    fn start(interactive: bool) -> (UnboundedSender<Message>, UnboundedReceiver<Message>) {
        let (to_executor, inbox) = mpsc::unbounded_channel();
        let (outbox, from_executor) = mpsc::unbounded_channel();
        let executor = WorkloadExecutor::new(Duration::from_millis(20), "/shuffle").interactive(interactive);
        tokio::spawn(executor.run(inbox, outbox));
        (to_executor, from_executor)
    }

    fn map_task(split: &str, input: &str) -> Message {
        let mut status = MapStatus::new(split);
        status.input = Some(input.into());
        Message::Assign(Assign::MapTask(MapAssignment {
            job: JobSpec::new(1, 1, 2, "wc"),
            map_status: status,
            extra: Extra::new(),
        }))
    }

    #[tokio::test]
    async fn heartbeats_start_on_request() {
        let (tx, mut rx) = start(false);
        tx.send(Message::Control(Control::Heartbeat)).unwrap();

        assert_eq!(rx.recv().await, Some(Message::heartbeat()));
        assert_eq!(rx.recv().await, Some(Message::heartbeat()));
    }

    #[tokio::test]
    async fn map_output_is_uploaded() {
        let (tx, mut rx) = start(false);
        tx.send(map_task("s1", "b a b")).unwrap();

        let Some(Message::Upload(Upload::MapOutput(chunk))) = rx.recv().await else {
            panic!("expected map output");
        };
        assert_eq!(chunk.split_id, "s1");
        assert!(!chunk.more);
        assert_eq!(
            chunk.records,
            vec![Record::new("b", 1), Record::new("a", 1), Record::new("b", 1)]
        );
    }

    #[tokio::test]
    async fn interactive_mode_waits_for_a_step() {
        let (tx, mut rx) = start(true);
        tx.send(map_task("s1", "x")).unwrap();
        tx.send(Message::Control(Control::Step)).unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.kind(), "UPL");

        tx.send(Message::Control(Control::Step)).unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.kind(), "LOG");
    }

    #[tokio::test]
    async fn failures_are_reported() {
        let (tx, mut rx) = start(false);
        let mut task = map_task("s1", "x");
        if let Message::Assign(Assign::MapTask(task)) = &mut task {
            task.job.workload = "nope".into();
        }
        tx.send(task).unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), "LOG");
        let Some(Message::Ack(Ack::TaskFailed(failure))) = rx.recv().await else {
            panic!("expected a failure report");
        };
        assert_eq!(failure.split_id.as_deref(), Some("s1"));
        assert!(failure.reason.contains("nope"));
    }

    #[tokio::test]
    async fn reduce_without_splits_finishes_at_once() {
        let (tx, mut rx) = start(false);
        tx.send(Message::Assign(Assign::ReduceTask(ReduceAssignment {
            job: JobSpec::new(2, 0, 2, "wc"),
            reduce_status: ReduceStatus::new(1),
            extra: Extra::new(),
        })))
        .unwrap();

        let Some(Message::Ack(Ack::ReduceTask(ack))) = rx.recv().await else {
            panic!("expected a reduce acknowledgement");
        };
        assert_eq!(ack.job_id, 2);
        assert_eq!(ack.output, Some(json!({})));
    }
}
