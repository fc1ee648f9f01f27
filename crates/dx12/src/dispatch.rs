/// Runs work on a thread owned by someone else, such as the UI thread that owns a window.
///
/// `send` blocks until the task finished.
pub trait Dispatcher: Send + Sync {
    fn send(&self, task: &mut (dyn FnMut() + Send));
}

/// Runs tasks on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn send(&self, task: &mut (dyn FnMut() + Send)) {
        task()
    }
}
