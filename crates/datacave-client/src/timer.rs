use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Deadline armed for one queued command.
///
/// When it fires, the command id is posted to the actor's timer channel. The
/// actor may already have replied to the command by then; ids are never reused
/// so a late event can be recognised and dropped.
#[derive(Debug)]
pub(crate) struct DeadlineTimer {
    handle: AbortHandle,
    timeout: Duration,
}

impl DeadlineTimer {
    pub(crate) fn arm(id: u64, timeout: Duration, fired: mpsc::UnboundedSender<u64>) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = fired.send(id);
        });
        Self {
            handle: task.abort_handle(),
            timeout,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}
