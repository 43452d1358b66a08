//! The node controller.
//!
//! One task owns the node's status, its active job and its three channels
//! (execution thread, master, peer listener) and reacts to their events one
//! at a time. Everything else reaches it through a [`NodeHandle`].

use std::fmt;
use std::future;

use anyhow::{anyhow, bail, Error};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use common::job::Extra;
use common::message::{
    Ack, Assign, Control, MapAck, MapOutputChunk, Message, SocketAnnouncement, Upload,
};

use crate::config::NodeConfig;
use crate::executor::{ExecutionChannel, WorkloadExecutor};
use crate::job::{AckOutcome, Job, JobRegistry, Task};
use crate::master::{MasterChannel, MasterEvent};
use crate::peer::{FetchFrame, FrameSink, PeerFetch, PeerListener};
use crate::retry::{self, ReconnectPolicy};
use crate::shuffle::{Partitioner, ReplaySink, ShuffleStore};

/// Protocol advertised for the peer listener.
pub const PEER_PROTOCOL: &str = "tcp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// Initialization failed, with the reason. Terminal.
    Error(String),

    /// Terminal.
    Stopped,

    Initializing,
    Idle,
    Mapping,
    Reducing,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Error(_) | NodeStatus::Stopped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Error(reason) => write!(f, "error ({reason})"),
            NodeStatus::Stopped => write!(f, "stopped"),
            NodeStatus::Initializing => write!(f, "initializing"),
            NodeStatus::Idle => write!(f, "idle"),
            NodeStatus::Mapping => write!(f, "mapping"),
            NodeStatus::Reducing => write!(f, "reducing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeCommand {
    Step,
    Stop,
}

/// Controls a running node.
///
/// Dropping the handle stops the node.
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<NodeCommand>,
    status: watch::Receiver<NodeStatus>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `f`.
    pub async fn wait_for(&mut self, f: impl FnMut(&NodeStatus) -> bool) -> Result<NodeStatus, Error> {
        let status = self
            .status
            .wait_for(f)
            .await
            .map_err(|_| anyhow!("node exited"))?;
        Ok(status.clone())
    }

    /// Ask the execution thread to perform one unit of work.
    pub fn step(&self) -> Result<(), Error> {
        self.commands
            .send(NodeCommand::Step)
            .map_err(|_| anyhow!("node is not running"))
    }

    pub fn stop(&self) -> Result<(), Error> {
        self.commands
            .send(NodeCommand::Stop)
            .map_err(|_| anyhow!("node is not running"))
    }

    /// Wait for the node to exit and return its final status.
    pub async fn join(self) -> NodeStatus {
        let NodeHandle {
            commands,
            status,
            task,
        } = self;
        if let Err(e) = task.await {
            error!("node task failed: {e}");
        }
        drop(commands);

        let final_status = status.borrow().clone();
        final_status
    }
}

/// Partitioner of the job whose map output this node holds.
struct Shuffle {
    job_id: u64,
    partitioner: Partitioner,
}

pub struct NodeController {
    config: NodeConfig,
    reconnect: Box<dyn ReconnectPolicy>,
    status: watch::Sender<NodeStatus>,

    executor: Option<ExecutionChannel>,
    master: Option<MasterChannel>,
    peers: Option<PeerListener>,

    jobs: JobRegistry,
    deadline: Option<Instant>,

    /// Store waiting for the first map job.
    store: Option<Box<dyn ShuffleStore>>,
    shuffle: Option<Shuffle>,

    completed_tx: mpsc::UnboundedSender<String>,
    completed: mpsc::UnboundedReceiver<String>,
    fetches_tx: mpsc::UnboundedSender<PeerFetch>,
    fetches: mpsc::UnboundedReceiver<PeerFetch>,
}

impl NodeController {
    pub fn new(config: NodeConfig) -> Self {
        let (status, _) = watch::channel(NodeStatus::Initializing);
        let (completed_tx, completed) = mpsc::unbounded_channel();
        let (fetches_tx, fetches) = mpsc::unbounded_channel();
        let reconnect = retry::from_attempts(config.reconnect_attempts);

        Self {
            config,
            reconnect,
            status,
            executor: None,
            master: None,
            peers: None,
            jobs: JobRegistry::new(),
            deadline: None,
            store: None,
            shuffle: None,
            completed_tx,
            completed,
            fetches_tx,
            fetches,
        }
    }

    pub fn with_reconnect(mut self, policy: Box<dyn ReconnectPolicy>) -> Self {
        self.reconnect = policy;
        self
    }

    /// Use an already opened execution channel instead of starting the
    /// workload executor.
    pub fn with_executor(mut self, executor: ExecutionChannel) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use `store` instead of the one the configuration asks for.
    pub fn with_store(mut self, store: Box<dyn ShuffleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start the node in the background.
    pub fn spawn(self) -> NodeHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let status = self.status.subscribe();
        let task = tokio::spawn(self.run(command_rx));

        NodeHandle {
            commands,
            status,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<NodeCommand>) {
        if let Err(e) = self.initialize().await {
            let reason = format!("{e:#}");
            error!("initialization failed: {reason}");
            self.teardown();
            self.set_status(NodeStatus::Error(reason), "initialization failed");
            return;
        }
        self.set_status(NodeStatus::Idle, "all channels open");
        self.greet();

        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(NodeCommand::Step) => self.step(),
                    Some(NodeCommand::Stop) => {
                        self.stop("stop requested");
                        break;
                    }
                    None => {
                        self.stop("node handle dropped");
                        break;
                    }
                },
                message = recv_executor(&mut self.executor) => match message {
                    Some(message) => self.route_from_executor(message),
                    None => {
                        self.stop("execution thread exited");
                        break;
                    }
                },
                event = recv_master(&mut self.master) => match event {
                    MasterEvent::Message(message) => self.route_from_master(message),
                    MasterEvent::Malformed(reason) => {
                        warn!("dropping malformed message from master: {reason}");
                    }
                    MasterEvent::Closed(reason) => {
                        let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                        if !self.reconnect(&reason).await {
                            self.stop(&format!("master went away: {reason}"));
                            break;
                        }
                    }
                },
                Some(split_id) = self.completed.recv() => self.split_complete(split_id),
                Some(fetch) = self.fetches.recv() => self.serve_fetch(fetch),
                _ = watchdog(deadline) => self.task_timed_out(),
            }
        }
    }

    /// Open the execution channel, the master channel and the peer listener,
    /// in that order.
    async fn initialize(&mut self) -> Result<(), Error> {
        self.config.validate()?;

        if self.store.is_none() {
            self.store = Some(self.config.open_store()?);
        }

        if self.executor.is_none() {
            let executor = WorkloadExecutor::new(self.config.heartbeat, self.config.resource.clone())
                .interactive(self.config.interactive);
            let channel =
                ExecutionChannel::spawn("mrl-executor", move |inbox, outbox| executor.run(inbox, outbox))
                    .await?;
            self.executor = Some(channel);
        }

        let master = MasterChannel::connect(&self.config.master, &self.config.protocol).await?;
        self.master = Some(master);

        let peers = PeerListener::bind(
            self.config.listen,
            self.config.resource.clone(),
            self.fetches_tx.clone(),
        )
        .await?;
        self.peers = Some(peers);

        Ok(())
    }

    /// Register with the master, then start the executor's heartbeat.
    fn greet(&mut self) {
        let Some(peers) = &self.peers else {
            warn!("cannot greet the master without a peer listener");
            return;
        };

        let announcement = SocketAnnouncement {
            protocol: PEER_PROTOCOL.to_string(),
            port: peers.port(),
            resource: peers.resource().to_string(),
        };
        self.send_to_master(Message::Ack(Ack::Socket(announcement)));
        self.send_to_executor(Message::Control(Control::Heartbeat));
    }

    fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    fn set_status(&self, status: NodeStatus, reason: &str) {
        let current = self.status();
        if current.is_terminal() {
            debug!("status stays {current}, ignoring {status} ({reason})");
            return;
        }
        if current != status {
            info!("status {current} -> {status}: {reason}");
        }
        self.status.send_replace(status);
    }

    fn step(&mut self) {
        debug!("step requested");
        self.send_to_executor(Message::Control(Control::Step));
    }

    fn stop(&mut self, reason: &str) {
        self.teardown();
        self.set_status(NodeStatus::Stopped, reason);
    }

    /// Close every channel that is open. Failures are logged and skipped.
    fn teardown(&mut self) {
        if let Some(mut executor) = self.executor.take() {
            if let Err(e) = executor.close() {
                warn!("failed to close execution channel: {e:#}");
            }
        }
        if let Some(mut master) = self.master.take() {
            if let Err(e) = master.close() {
                warn!("failed to close master channel: {e:#}");
            }
        }
        if let Some(mut peers) = self.peers.take() {
            if let Err(e) = peers.close() {
                warn!("failed to close peer listener: {e:#}");
            }
        }
    }

    /// Reconnect to the master as long as the policy allows it. Returns
    /// whether a new connection is up.
    async fn reconnect(&mut self, reason: &str) -> bool {
        warn!("lost master connection: {reason}");
        self.master = None;
        if let Some(job) = self.jobs.abandon() {
            self.deadline = None;
            self.discard_partial_output();
            self.send_to_executor(Message::Assign(Assign::Idle(Extra::new())));
            self.set_status(NodeStatus::Idle, &format!("abandoning {job}, master went away"));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(delay) = self.reconnect.next_delay(attempt) else {
                return false;
            };

            info!("reconnecting to master in {delay:?} (attempt {attempt})");
            time::sleep(delay).await;

            match MasterChannel::connect(&self.config.master, &self.config.protocol).await {
                Ok(master) => {
                    self.master = Some(master);
                    self.reconnect.reset();
                    self.greet();
                    return true;
                }
                Err(e) => warn!("reconnect attempt {attempt} failed: {e:#}"),
            }
        }
    }

    fn send_to_master(&self, message: Message) {
        let Some(master) = &self.master else {
            warn!("no master connection, dropping `{}` message", message.kind());
            return;
        };
        debug!("-> master: {} {:?}", message.kind(), message.action());
        if let Err(e) = master.send(message) {
            warn!("failed to send to master: {e:#}");
        }
    }

    fn send_to_executor(&self, message: Message) {
        let Some(executor) = &self.executor else {
            warn!("no execution thread, dropping `{}` message", message.kind());
            return;
        };
        debug!("-> executor: {} {:?}", message.kind(), message.action());
        if let Err(e) = executor.send(message) {
            warn!("failed to send to the execution thread: {e:#}");
        }
    }

    fn route_from_executor(&mut self, message: Message) {
        match message {
            Message::Heartbeat(_) => self.send_to_master(message),
            Message::Ack(Ack::Socket(_)) => {
                warn!("dropping socket acknowledgement from the execution thread");
            }
            Message::Ack(ack) => match self.jobs.acknowledge(&ack) {
                Ok(AckOutcome::Progress) => {
                    self.arm_watchdog();
                    self.send_to_master(Message::Ack(ack));
                }
                Ok(AckOutcome::Finished(job)) => {
                    self.deadline = None;
                    if matches!(ack, Ack::TaskFailed(_)) {
                        self.discard_partial_output();
                    }
                    let action = ack.action();
                    self.send_to_master(Message::Ack(ack));
                    self.set_status(NodeStatus::Idle, &format!("{job} acknowledged ({action})"));
                }
                Err(e) => warn!("dropping acknowledgement: {e:#}"),
            },
            Message::Log(line) => info!(target: "mrl_worker::executor", "{}", line.message),
            Message::Upload(Upload::MapOutput(chunk)) => self.partition(chunk),
            Message::Assign(_) | Message::Control(_) => {
                warn!("dropping `{}` message from the execution thread", message.kind());
            }
        }
    }

    fn route_from_master(&mut self, message: Message) {
        match message {
            Message::Assign(assign) => self.assign(assign),
            other => warn!("ignoring `{}` message from master", other.kind()),
        }
    }

    fn assign(&mut self, assign: Assign) {
        match &assign {
            Assign::MapTask(task) => {
                let job = Job::from_map(task);
                if !self.accepts_task(&job) {
                    return;
                }
                if let Err(e) = self.prepare_shuffle(&job) {
                    warn!("rejecting {job}: {e:#}");
                    self.send_to_master(Message::Ack(Ack::TaskFailed(job.failure(format!("{e:#}")))));
                    return;
                }
                match self.jobs.start(job.clone()) {
                    Ok(Some(previous)) => info!("rerunning {job}, last attempt {previous:?}"),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("{e:#}");
                        return;
                    }
                }
                self.arm_watchdog();
                self.set_status(NodeStatus::Mapping, &format!("assigned {job}"));
            }
            Assign::ReduceTask(task) => {
                let job = Job::from_reduce(task);
                if !self.accepts_task(&job) {
                    return;
                }
                match self.jobs.start(job.clone()) {
                    Ok(Some(previous)) => info!("rerunning {job}, last attempt {previous:?}"),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("{e:#}");
                        return;
                    }
                }
                self.arm_watchdog();
                self.set_status(NodeStatus::Reducing, &format!("assigned {job}"));
            }
            Assign::ReduceSplit(task) => {
                if !self.jobs.accepts_split(task) {
                    warn!(
                        "dropping split for job {} bucket {}: not the active reduce task",
                        task.job.job_id, task.reduce_status.bucket_id
                    );
                    return;
                }
            }
            Assign::Idle(_) => {
                if let Some(job) = self.jobs.abandon() {
                    self.deadline = None;
                    self.discard_partial_output();
                    self.set_status(NodeStatus::Idle, &format!("master sent idle, abandoning {job}"));
                }
            }
        }

        self.send_to_executor(Message::Assign(assign));
    }

    /// New tasks are only taken while idle.
    fn accepts_task(&self, job: &Job) -> bool {
        let status = self.status();
        if status != NodeStatus::Idle {
            warn!("busy ({status}), dropping {job}");
            return false;
        }
        true
    }

    /// Get the partitioner ready for `job`'s split: a partitioner for the
    /// job exists and nothing from an earlier attempt at the split is left.
    fn prepare_shuffle(&mut self, job: &Job) -> Result<(), Error> {
        let Task::Map { split_id } = &job.task else {
            return Ok(());
        };
        if job.reducers == 0 {
            bail!("job {} has no reducers", job.job_id);
        }

        let reducers = self
            .shuffle
            .as_ref()
            .filter(|shuffle| shuffle.job_id == job.job_id)
            .map(|shuffle| shuffle.partitioner.reducers());
        match reducers {
            Some(reducers) if reducers != job.reducers => bail!(
                "job {} changed its reducer count from {reducers} to {}",
                job.job_id,
                job.reducers
            ),
            Some(_) => {}
            None => self.start_shuffle(job)?,
        }

        let shuffle = self
            .shuffle
            .as_mut()
            .ok_or_else(|| anyhow!("shuffle store unavailable"))?;
        shuffle.partitioner.begin_write(split_id.clone())
    }

    /// Replace the partitioner with one for `job`. Map output of an earlier
    /// job is dropped.
    fn start_shuffle(&mut self, job: &Job) -> Result<(), Error> {
        let store = match self.shuffle.take() {
            Some(mut shuffle) => {
                if let Err(e) = shuffle.partitioner.clear() {
                    self.shuffle = Some(shuffle);
                    return Err(e);
                }
                shuffle.partitioner.into_store()
            }
            None => {
                let mut store = self
                    .store
                    .take()
                    .ok_or_else(|| anyhow!("shuffle store unavailable"))?;
                if let Err(e) = store.clear() {
                    self.store = Some(store);
                    return Err(e);
                }
                store
            }
        };

        info!("partitioning job {} into {} buckets", job.job_id, job.reducers);
        let partitioner = Partitioner::new(job.reducers, store, self.completed_tx.clone())?;
        self.shuffle = Some(Shuffle {
            job_id: job.job_id,
            partitioner,
        });
        Ok(())
    }

    /// Feed map output of the active map task to its partitioner.
    fn partition(&mut self, chunk: MapOutputChunk) {
        let active = matches!(
            self.jobs.active(),
            Some(Job { job_id, task: Task::Map { split_id }, .. })
                if *job_id == chunk.job_id && *split_id == chunk.split_id
        );
        let shuffle = self
            .shuffle
            .as_mut()
            .filter(|shuffle| shuffle.job_id == chunk.job_id);

        let Some(shuffle) = shuffle.filter(|_| active) else {
            warn!(
                "dropping map output of job {} split `{}`: not the active map task",
                chunk.job_id, chunk.split_id
            );
            return;
        };

        let partitioner = &mut shuffle.partitioner;
        if partitioner.current_split() != Some(chunk.split_id.as_str()) {
            warn!(
                "dropping map output of job {} split `{}`: split already complete",
                chunk.job_id, chunk.split_id
            );
            return;
        }

        if let Err(e) = partitioner.write(chunk.records, chunk.more) {
            error!("failed to store map output: {e:#}");
            self.fail_task(&format!("failed to store map output: {e:#}"));
        }
    }

    /// The partitioner has all output of `split_id`.
    fn split_complete(&mut self, split_id: String) {
        let Some(job) = self.jobs.complete_split(&split_id) else {
            debug!("split `{split_id}` complete, already acknowledged");
            return;
        };

        self.deadline = None;
        self.send_to_master(Message::Ack(Ack::MapTask(MapAck::new(job.job_id, split_id))));
        self.set_status(NodeStatus::Idle, &format!("{job} complete"));
    }

    fn serve_fetch(&self, fetch: PeerFetch) {
        let mut sink = FrameSink(fetch.reply.clone());
        let result = match &self.shuffle {
            Some(shuffle) => shuffle
                .partitioner
                .start_replay(fetch.partition, &fetch.split, &mut sink),
            None => sink.write(Vec::new(), false),
        };

        if let Err(e) = result {
            warn!(
                "failed to replay partition {} of split `{}`: {e:#}",
                fetch.partition, fetch.split
            );
            let _ = fetch.reply.send(FetchFrame::Error(format!("{e:#}")));
        }
    }

    fn arm_watchdog(&mut self) {
        self.deadline = self.config.task_timeout.map(|timeout| Instant::now() + timeout);
    }

    fn task_timed_out(&mut self) {
        warn!("task timed out");
        self.fail_task("timeout");
    }

    /// Report the active job as failed and go back to idle.
    fn fail_task(&mut self, reason: &str) {
        self.deadline = None;
        let Some(job) = self.jobs.fail() else {
            return;
        };
        self.discard_partial_output();

        self.send_to_master(Message::Ack(Ack::TaskFailed(job.failure(reason))));
        self.send_to_executor(Message::Assign(Assign::Idle(Extra::new())));
        self.set_status(NodeStatus::Idle, &format!("{job} failed: {reason}"));
    }

    /// Drop the stored output of a map task that will not finish.
    fn discard_partial_output(&mut self) {
        let Some(shuffle) = &mut self.shuffle else {
            return;
        };
        match shuffle.partitioner.discard() {
            Ok(Some(split_id)) => debug!("dropped partial output of split `{split_id}`"),
            Ok(None) => {}
            Err(e) => warn!("failed to drop partial map output: {e:#}"),
        }
    }
}

async fn recv_executor(executor: &mut Option<ExecutionChannel>) -> Option<Message> {
    match executor {
        Some(executor) => executor.recv().await,
        None => future::pending().await,
    }
}

async fn recv_master(master: &mut Option<MasterChannel>) -> MasterEvent {
    match master {
        Some(master) => master.recv().await,
        None => future::pending().await,
    }
}

async fn watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
