//! The boundary between the node controller and the thread running user code.
//!
//! Both directions carry [`Message`] values over unbounded channels. Nothing
//! else is shared with the execution thread.

use std::future::Future;
use std::thread;

use anyhow::{anyhow, Context, Error};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error};

use common::message::Message;

pub mod workload;
pub use workload::WorkloadExecutor;

pub struct ExecutionChannel {
    /// `None` once closed.
    to_executor: Option<UnboundedSender<Message>>,
    from_executor: UnboundedReceiver<Message>,
}

impl ExecutionChannel {
    /// Start `executor` on a dedicated thread with its own runtime.
    ///
    /// The executor is handed its inbox and outbox. The thread exits once the
    /// executor's future completes, which it should do when the inbox closes.
    pub async fn spawn<F, Fut>(name: &str, executor: F) -> Result<Self, Error>
    where
        F: FnOnce(UnboundedReceiver<Message>, UnboundedSender<Message>) -> Fut + Send + 'static,
        Fut: Future<Output = ()>,
    {
        let (to_executor, inbox) = mpsc::unbounded_channel();
        let (outbox, from_executor) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_name = name.to_string();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow!(e)));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok(()));
                runtime.block_on(executor(inbox, outbox));
                debug!("execution thread `{thread_name}` finished");
            })
            .with_context(|| format!("failed to start execution thread `{name}`"))?;

        ready_rx
            .await
            .map_err(|_| anyhow!("execution thread `{name}` died during startup"))?
            .with_context(|| format!("failed to build runtime for `{name}`"))?;

        Ok(Self::from_parts(to_executor, from_executor))
    }

    /// Wrap channel ends connected to an executor running elsewhere.
    pub fn from_parts(
        to_executor: UnboundedSender<Message>,
        from_executor: UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            to_executor: Some(to_executor),
            from_executor,
        }
    }

    /// Queue `message` for the executor.
    pub fn send(&self, message: Message) -> Result<(), Error> {
        let sender = self
            .to_executor
            .as_ref()
            .ok_or_else(|| anyhow!("execution channel is closed"))?;
        sender.send(message).map_err(|_| {
            error!("execution thread is gone");
            anyhow!("execution thread is gone")
        })
    }

    /// Next message from the executor; `None` once the executor has exited.
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_executor.recv().await
    }

    /// Close the executor's inbox. Messages it already sent stay readable.
    pub fn close(&mut self) -> Result<(), Error> {
        self.to_executor
            .take()
            .map(drop)
            .ok_or_else(|| anyhow!("execution channel already closed"))
    }
}

#[cfg(test)]
mod tests {
    use common::message::Control;

    use super::*;

    #[tokio::test]
    async fn spawned_executor_talks_back() {
        let mut channel = ExecutionChannel::spawn("echo", |mut inbox, outbox| async move {
            while let Some(message) = inbox.recv().await {
                let _ = outbox.send(Message::log(format!("got {}", message.kind())));
            }
        })
        .await
        .unwrap();

        channel.send(Message::Control(Control::Heartbeat)).unwrap();
        assert_eq!(channel.recv().await, Some(Message::log("got CTL")));

        channel.close().unwrap();
        assert!(channel.close().is_err());
        assert!(channel.send(Message::heartbeat()).is_err());

        // The executor ends once its inbox closes.
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test]
    async fn parts_preserve_order() {
        let (to_executor, mut inbox) = mpsc::unbounded_channel();
        let (outbox, from_executor) = mpsc::unbounded_channel();
        let mut channel = ExecutionChannel::from_parts(to_executor, from_executor);

        channel.send(Message::Control(Control::Heartbeat)).unwrap();
        channel.send(Message::Control(Control::Step)).unwrap();
        assert_eq!(inbox.recv().await, Some(Message::Control(Control::Heartbeat)));
        assert_eq!(inbox.recv().await, Some(Message::Control(Control::Step)));

        outbox.send(Message::log("one")).unwrap();
        outbox.send(Message::log("two")).unwrap();
        assert_eq!(channel.recv().await, Some(Message::log("one")));
        assert_eq!(channel.recv().await, Some(Message::log("two")));
    }
}
