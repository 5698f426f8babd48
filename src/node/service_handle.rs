use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Running node tasks plus the shutdown signal they observe.
/// Call `shutdown()` to stop them and collect the first failure.
pub struct ServiceHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl ServiceHandle {
    /// Create a new ServiceHandle and return it together with a Receiver clonable by tasks.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx, tasks: vec![] }, rx)
    }

    pub fn attach(&mut self, name: &'static str, h: JoinHandle<Result<()>>) {
        self.tasks.push((name, h));
    }

    /// True once any attached task has finished (normally or not).
    pub fn any_finished(&self) -> bool {
        self.tasks.iter().any(|(_, h)| h.is_finished())
    }

    /// Signal shutdown to all tasks and await them in attach order.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let mut first_err = None;
        for (name, h) in self.tasks {
            match h.await {
                Ok(Ok(())) => debug!(task = name, "service stopped"),
                Ok(Err(e)) => {
                    error!(task = name, error = %e, "service task returned error");
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    error!(task = name, error = %e, "task join error");
                    first_err.get_or_insert(anyhow::anyhow!("{} panicked: {}", name, e));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Return a cloneable shutdown receiver for tasks that need to observe shutdown state.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
