use crate::exchange::{Reply, Request};
use crate::timer::DeadlineTimer;
use datacave_core::Result;
use std::collections::VecDeque;
use tokio::sync::oneshot;

pub(crate) type ReplySender = oneshot::Sender<Result<Reply>>;

#[derive(Debug)]
pub(crate) struct PendingCommand {
    pub(crate) id: u64,
    pub(crate) request: Request,
    reply: ReplySender,
    timer: Option<DeadlineTimer>,
}

impl PendingCommand {
    pub(crate) fn new(id: u64, request: Request, reply: ReplySender, timer: Option<DeadlineTimer>) -> Self {
        Self {
            id,
            request,
            reply,
            timer,
        }
    }

    /// Cancel the deadline if it is still armed. Safe to call repeatedly.
    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Forget the deadline after it fired, so it is not cancelled a second time.
    pub(crate) fn timer_fired(&mut self) -> Option<std::time::Duration> {
        self.timer.take().map(|timer| timer.timeout())
    }

    pub(crate) fn reply(mut self, result: Result<Reply>) {
        self.cancel_timer();
        // The caller may have given up waiting; nothing to do then.
        let _ = self.reply.send(result);
    }

    /// Drop the command without replying; the caller sees its channel close.
    pub(crate) fn discard(mut self) {
        self.cancel_timer();
    }
}

/// FIFO of submitted commands.
///
/// The head stays queued while it is on the wire: `mark_in_flight` records
/// that it was sent and only `pop_in_flight` retires it. At most one command
/// is in flight, and it is always the head.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: VecDeque<PendingCommand>,
    in_flight: bool,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, command: PendingCommand) {
        self.commands.push_back(command);
    }

    pub(crate) fn peek(&self) -> Option<&PendingCommand> {
        self.commands.front()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut PendingCommand> {
        self.commands.front_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Whether the next command may be sent.
    pub(crate) fn is_idle(&self) -> bool {
        !self.in_flight
    }

    pub(crate) fn mark_in_flight(&mut self) {
        debug_assert!(!self.commands.is_empty(), "nothing to send");
        debug_assert!(!self.in_flight, "a command is already in flight");
        self.in_flight = !self.commands.is_empty();
    }

    /// Retire the in-flight head once its reply is complete.
    pub(crate) fn pop_in_flight(&mut self) -> Option<PendingCommand> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        self.commands.pop_front()
    }

    pub(crate) fn is_head_in_flight(&self, id: u64) -> bool {
        self.in_flight && self.commands.front().is_some_and(|head| head.id == id)
    }

    /// Remove a command that has not been sent yet.
    pub(crate) fn remove_waiting(&mut self, id: u64) -> Option<PendingCommand> {
        if self.is_head_in_flight(id) {
            return None;
        }
        let index = self.commands.iter().position(|command| command.id == id)?;
        self.commands.remove(index)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PendingCommand> + '_ {
        self.in_flight = false;
        self.commands.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandQueue, PendingCommand};
    use crate::exchange::{Reply, Request};
    use tokio::sync::oneshot;

    fn command(id: u64) -> (PendingCommand, oneshot::Receiver<datacave_core::Result<Reply>>) {
        let (tx, rx) = oneshot::channel();
        let request = Request::Query {
            sql: format!("SELECT {id}"),
            params: Vec::new(),
        };
        (PendingCommand::new(id, request, tx, None), rx)
    }

    #[test]
    fn peek_does_not_remove_head() {
        let mut queue = CommandQueue::new();
        let (first, _rx1) = command(1);
        let (second, _rx2) = command(2);
        queue.push(first);
        queue.push(second);

        assert_eq!(queue.peek().map(|c| c.id), Some(1));
        queue.mark_in_flight();
        assert_eq!(queue.peek().map(|c| c.id), Some(1));
        assert_eq!(queue.len(), 2);
        assert!(queue.is_head_in_flight(1));
        assert!(!queue.is_head_in_flight(2));
    }

    #[test]
    fn pop_requires_in_flight_head() {
        let mut queue = CommandQueue::new();
        let (first, _rx) = command(1);
        queue.push(first);
        assert!(queue.pop_in_flight().is_none());
        queue.mark_in_flight();
        assert_eq!(queue.pop_in_flight().map(|c| c.id), Some(1));
        assert!(queue.is_idle());
        assert!(queue.is_empty());
    }

    #[test]
    fn waiting_commands_can_be_removed_but_not_the_in_flight_head() {
        let mut queue = CommandQueue::new();
        for id in 1..=3 {
            let (cmd, _rx) = command(id);
            queue.push(cmd);
        }
        queue.mark_in_flight();
        assert!(queue.remove_waiting(1).is_none());
        assert_eq!(queue.remove_waiting(2).map(|c| c.id), Some(2));
        assert!(queue.remove_waiting(2).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remove_waiting(3).map(|c| c.id), Some(3));
        assert_eq!(queue.peek().map(|c| c.id), Some(1));
    }

    #[test]
    fn reply_and_discard_reach_the_caller_differently() {
        let (replied, mut replied_rx) = command(1);
        replied.reply(Ok(Reply::Closed));
        assert!(matches!(replied_rx.try_recv(), Ok(Ok(Reply::Closed))));

        let (discarded, mut discarded_rx) = command(2);
        discarded.discard();
        assert!(matches!(
            discarded_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
