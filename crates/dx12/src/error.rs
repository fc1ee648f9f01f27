use crate::backend::HeapKind;

/// Errors surfaced by the graphics core.
///
/// `DeviceLost` is the one condition callers are expected to recover from, by running
/// [`GraphicsContext::reset_device`](crate::GraphicsContext::reset_device) before the
/// next frame.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("graphics device was removed or reset")]
    DeviceLost,

    #[error("out of {kind:?} memory: {size} bytes aligned to {align}")]
    OutOfMemory { kind: HeapKind, size: u64, align: u64 },

    #[error("commands were recorded before the last device reset")]
    StaleCommands,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Backend(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Error::Backend(err),
        }
    }
}

impl Error {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Error::DeviceLost)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
