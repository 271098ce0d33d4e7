use crate::cancel::Cancellable;
use crate::error::{Error, Result};

pub(crate) type Completion = Box<dyn FnOnce()>;

/// Resolved operations whose callbacks run once the driver releases its
/// borrow of the connection.
#[derive(Default)]
pub(crate) struct Completions {
    queue: Vec<Completion>,
}

impl Completions {
    pub(crate) fn push(&mut self, completion: Completion) {
        self.queue.push(completion);
    }

    pub(crate) fn take(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.queue)
    }
}

/// Pending asynchronous operation: a one-shot callback plus an optional
/// cancellation token.
pub(crate) struct Task<T> {
    callback: Box<dyn FnOnce(Result<T>)>,
    cancellable: Option<Cancellable>,
}

impl<T: 'static> Task<T> {
    pub(crate) fn new<F>(cancellable: Option<&Cancellable>, callback: F) -> Self
    where
        F: FnOnce(Result<T>) + 'static,
    {
        Self {
            callback: Box::new(callback),
            cancellable: cancellable.cloned(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellable
            .as_ref()
            .is_some_and(Cancellable::is_cancelled)
    }

    /// Queue the callback on the work-list.
    pub(crate) fn complete(self, result: Result<T>, out: &mut Completions) {
        let callback = self.callback;
        out.push(Box::new(move || callback(result)));
    }

    /// Invoke the callback right away. Only valid while no engine state
    /// is borrowed.
    pub(crate) fn resolve(self, result: Result<T>) {
        (self.callback)(result)
    }
}

/// Take the task out of `slot` when its caller cancelled it.
pub(crate) fn take_cancelled<T: 'static>(
    slot: &mut Option<Task<T>>,
) -> Option<Task<T>> {
    if slot.as_ref().is_some_and(Task::is_cancelled) {
        slot.take()
    } else {
        None
    }
}

/// Resolve a cancelled task in `slot` through the work-list.
pub(crate) fn reap_cancelled<T: 'static>(
    slot: &mut Option<Task<T>>,
    out: &mut Completions,
) {
    if let Some(task) = take_cancelled(slot) {
        task.complete(Err(Error::Cancelled), out);
    }
}
