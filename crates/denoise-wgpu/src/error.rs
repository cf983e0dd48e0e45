//! Error taxonomy for denoise runs
//!
//! Every failure aborts the current run; the run releases all of its device
//! allocations before the error is returned to the caller.

/// Boxed error type used by external frame sources
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by denoise-wgpu
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device memory or slot limits were exceeded, or no memory type satisfies a request
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// A slot was accessed in a way its kind or residency does not allow
    #[error("invalid access: {0}")]
    InvalidAccess(String),
    /// A slot kind does not match what a kernel slot expects
    #[error("binding mismatch: {0}")]
    BindingMismatch(String),
    /// The device was lost or reported an unrecoverable error
    #[error("device lost: {0}")]
    DeviceLost(String),
    /// A submission did not complete within the configured wait bound
    #[error("submission timed out: {0}")]
    SubmissionTimeout(String),
    /// The run configuration is invalid
    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),
    /// No adapter or device could be acquired
    #[error("no suitable GPU adapter: {0}")]
    AdapterUnavailable(String),
    /// The external frame loader failed
    #[error("failed to load frame '{label}'")]
    FrameSource {
        label: String,
        #[source]
        source: BoxError,
    },
    /// Frame pixel data does not describe a valid image
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// A later frame differs from frame 0 in dimensions or pixel format
    #[error("frame {index} is {found} but frame 0 is {expected}")]
    FrameMismatch { index: usize, expected: String, found: String },
}

impl Error {
    /// Whether the error originated from the device rather than from input validation
    pub fn is_device_fault(&self) -> bool {
        matches!(self, Error::DeviceLost(_) | Error::SubmissionTimeout(_))
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_fault_classification() {
        assert!(Error::DeviceLost("lost".into()).is_device_fault());
        assert!(Error::SubmissionTimeout("slow".into()).is_device_fault());
        assert!(!Error::ResourceExhausted("full".into()).is_device_fault());
        assert!(!Error::FatalConfiguration("overlap".into()).is_device_fault());
        assert!(!Error::InvalidFrame("short".into()).is_device_fault());
    }

    #[test]
    fn test_frame_source_keeps_cause() {
        let cause: BoxError = "unsupported format".into();
        let error = Error::FrameSource { label: "a.png".into(), source: cause };
        assert_eq!(error.to_string(), "failed to load frame 'a.png'");
        assert_eq!(std::error::Error::source(&error).map(|s| s.to_string()), Some("unsupported format".to_string()));
    }
}
