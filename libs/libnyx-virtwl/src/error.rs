//! Error taxonomy for the virtio wayland transport

use std::time::Duration;

use crate::protocol::CtrlType;
use crate::queue::QueueError;

/// Errors surfaced to callers of the VFD operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Out ring is full (non-blocking) or the inbox is empty (non-blocking recv)
    #[error("operation would block")]
    WouldBlock,
    /// Out ring stayed full for the whole capacity wait
    #[error("out ring stayed full for {0:?}")]
    Busy(Duration),
    /// A blocking wait was cancelled before anything was consumed
    #[error("wait interrupted")]
    Interrupted,
    /// Host answered with a generic error; the device is no longer reliable
    #[error("host reported a device error")]
    NoDevice,
    /// Transport was torn down while the request was outstanding
    #[error("transport disconnected")]
    Disconnected,
    /// Local allocation failed or the host ran out of memory
    #[error("out of memory")]
    OutOfMemory,
    /// Guest id range is exhausted
    #[error("no free vfd ids")]
    NoSpace,
    /// Bad id, bad type or bad range
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Mapping not permitted by the VFD's capability flags
    #[error("permission denied")]
    AccessDenied,
    /// Handle no longer refers to a live VFD
    #[error("bad vfd handle")]
    BadHandle,
    /// Ring refused a descriptor chain
    #[error("ring error: {0}")]
    Queue(#[from] QueueError),
}

impl Error {
    /// Map a host reply code onto the fixed error table.
    pub fn from_response(code: u32) -> Result<()> {
        match CtrlType::from_u32(code) {
            Some(CtrlType::RespOk) | Some(CtrlType::RespVfdNew) => Ok(()),
            Some(CtrlType::RespErr) => Err(Error::NoDevice),
            Some(CtrlType::RespOutOfMemory) => Err(Error::OutOfMemory),
            Some(CtrlType::RespInvalidId) => Err(Error::InvalidArgument("host rejected vfd id")),
            Some(CtrlType::RespInvalidType) => {
                Err(Error::InvalidArgument("host rejected request type"))
            }
            _ => Err(Error::InvalidArgument("unrecognized host reply")),
        }
    }

    /// POSIX error number a character-device front end would report.
    pub fn errno(&self) -> i32 {
        match self {
            Error::WouldBlock => libc::EAGAIN,
            Error::Busy(_) => libc::EBUSY,
            Error::Interrupted => libc::EINTR,
            Error::NoDevice | Error::Disconnected => libc::ENODEV,
            Error::OutOfMemory => libc::ENOMEM,
            Error::NoSpace => libc::ENOSPC,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::AccessDenied => libc::EACCES,
            Error::BadHandle => libc::EBADFD,
            Error::Queue(QueueError::NoSpace) => libc::ENOSPC,
            Error::Queue(_) => libc::EIO,
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::Busy(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_table() {
        assert_eq!(Error::from_response(CtrlType::RespOk as u32), Ok(()));
        assert_eq!(Error::from_response(CtrlType::RespVfdNew as u32), Ok(()));
        assert_eq!(
            Error::from_response(CtrlType::RespErr as u32),
            Err(Error::NoDevice)
        );
        assert_eq!(
            Error::from_response(CtrlType::RespOutOfMemory as u32),
            Err(Error::OutOfMemory)
        );
        for code in [
            CtrlType::RespInvalidId as u32,
            CtrlType::RespInvalidType as u32,
            CtrlType::VfdSend as u32,
            0xdead,
        ] {
            assert!(matches!(
                Error::from_response(code),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_errno_distinguishes_retry_paths() {
        assert_eq!(Error::WouldBlock.errno(), libc::EAGAIN);
        assert_eq!(Error::Busy(Duration::from_secs(1)).errno(), libc::EBUSY);
        assert_ne!(Error::WouldBlock, Error::Busy(Duration::from_secs(1)));
        assert!(Error::WouldBlock.is_retryable());
        assert!(!Error::Interrupted.is_retryable());
        assert_eq!(Error::Interrupted.errno(), libc::EINTR);
    }
}
