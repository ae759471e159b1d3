//! Error types and error reporting for the presentation pipeline.
//!
//! Errors travel two ways. Fallible calls return [`RenderError`] through
//! [`DisplayResult`]. Capability and resource failures that the render thread
//! survives by degrading are additionally reported once to an [`ErrorSink`],
//! tagged with a stable [`ErrorCode`] and the source location of the report.

use std::collections::HashSet;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Result alias used throughout the display crate.
pub type DisplayResult<T> = Result<T, RenderError>;

/// Errors produced by the presentation pipeline.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The device could not provide a feature the selected renderer needs.
    #[error("Capability negotiation failed: {0}")]
    Capability(ErrorCode),

    /// A shader program failed to compile or link.
    #[error("Shader compilation failed for {program}: {log}")]
    ShaderCompile { program: String, log: String },

    /// No source exists for a shader program at any usable GLSL version.
    #[error("No shader source available for {0}")]
    ShaderSourceMissing(String),

    /// GPU memory or object allocation failed.
    #[error("GPU resource allocation failed: {0}")]
    ResourceExhausted(String),

    /// The requested display mode is not in the mode catalog.
    #[error("Unsupported display mode {width}x{height}@{bits_per_pixel}")]
    InvalidMode {
        width: u32,
        height: u32,
        bits_per_pixel: u32,
    },

    /// A rectangle lies outside the surface it addresses.
    #[error("Rectangle out of bounds: {0}")]
    OutOfBounds(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error (thread spawn, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation needs a display mode but none was set.
    #[error("No display mode has been set")]
    NoMode,

    /// Backend-specific device failure.
    #[error("Device error: {0}")]
    Device(#[from] anyhow::Error),
}

impl RenderError {
    /// Stable code used when the error is handed to an [`ErrorSink`].
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Capability(code) => *code,
            Self::ShaderCompile { .. } => ErrorCode::ShaderCompile,
            Self::ShaderSourceMissing(_) => ErrorCode::ShaderSourceMissing,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::Device(_) => ErrorCode::DeviceFailure,
            Self::InvalidMode { .. } | Self::NoMode => ErrorCode::InvalidMode,
            Self::OutOfBounds(_) | Self::Config(_) | Self::ConfigParse(_) | Self::Io(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Returns true if the render thread can keep going on a less capable renderer.
    #[must_use]
    pub fn is_capability(&self) -> bool {
        self.code().is_capability()
    }

    /// Returns true if GPU resources ran out.
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

/// Stable identifiers for reportable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No usable GL context is current, or it can draw neither with shaders
    /// nor with the fixed-function pipeline.
    ContextCreation,
    ShaderCompile,
    ShaderSourceMissing,
    ResourceExhausted,
    DeviceFailure,
    InvalidMode,
    Internal,
}

impl ErrorCode {
    /// Numeric id that stays stable across releases.
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Self::ContextCreation => 106,
            Self::ShaderCompile => 201,
            Self::ShaderSourceMissing => 202,
            Self::ResourceExhausted => 301,
            Self::DeviceFailure => 302,
            Self::InvalidMode => 401,
            Self::Internal => 901,
        }
    }

    /// Capability failures are survivable by selecting a less capable renderer.
    #[must_use]
    pub fn is_capability(&self) -> bool {
        matches!(self, Self::ShaderCompile | Self::ShaderSourceMissing)
    }

    /// Returns true if no renderer can run after this failure.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ContextCreation | Self::DeviceFailure)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ContextCreation => "GL context creation failed",
            Self::ShaderCompile => "shader compilation failed",
            Self::ShaderSourceMissing => "shader source missing",
            Self::ResourceExhausted => "GPU resources exhausted",
            Self::DeviceFailure => "graphics device failure",
            Self::InvalidMode => "invalid display mode",
            Self::Internal => "internal error",
        };
        write!(f, "E{} ({})", self.id(), text)
    }
}

/// Receives reportable failures from the render thread.
pub trait ErrorSink: Send + Sync {
    fn report(&self, code: ErrorCode, location: &'static Location<'static>);
}

/// Default sink: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, code: ErrorCode, location: &'static Location<'static>) {
        error!(code = code.id(), "{} at {}:{}", code, location.file(), location.line());
    }
}

/// Per-session reporter that forwards each code to the sink at most once.
pub struct ErrorReporter {
    sink: Arc<dyn ErrorSink>,
    seen: HashSet<ErrorCode>,
}

impl ErrorReporter {
    pub fn new(sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            sink,
            seen: HashSet::new(),
        }
    }

    /// Report `code` with the caller's location. Returns false if it was already reported.
    #[track_caller]
    pub fn report(&mut self, code: ErrorCode) -> bool {
        let location = Location::caller();
        if !self.seen.insert(code) {
            return false;
        }
        self.sink.report(code, location);
        true
    }

    /// Report the code of `err`.
    #[track_caller]
    pub fn report_error(&mut self, err: &RenderError) -> bool {
        self.report(err.code())
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("seen", &self.seen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(ErrorCode, u32)>>);

    impl ErrorSink for Collect {
        fn report(&self, code: ErrorCode, location: &'static Location<'static>) {
            self.0.lock().push((code, location.line()));
        }
    }

    #[test]
    fn test_error_categorization() {
        let err = RenderError::ShaderCompile {
            program: "cubic".into(),
            log: "syntax error".into(),
        };
        assert!(err.is_capability());
        assert!(!err.is_resource_exhaustion());

        let err = RenderError::ResourceExhausted("texture 4096x4096".into());
        assert!(err.is_resource_exhaustion());
        assert!(!err.is_capability());

        assert!(ErrorCode::ContextCreation.is_fatal());
        assert!(!ErrorCode::ShaderCompile.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = RenderError::InvalidMode {
            width: 1000,
            height: 10,
            bits_per_pixel: 16,
        };
        assert_eq!(err.to_string(), "Unsupported display mode 1000x10@16");
        assert_eq!(ErrorCode::ContextCreation.to_string(), "E106 (GL context creation failed)");
    }

    #[test]
    fn test_reporter_reports_once_with_location() {
        let sink = Arc::new(Collect::default());
        let mut reporter = ErrorReporter::new(sink.clone());

        let line = line!() + 1;
        assert!(reporter.report(ErrorCode::ShaderCompile));
        assert!(!reporter.report(ErrorCode::ShaderCompile));
        assert!(reporter.report(ErrorCode::ResourceExhausted));

        let reports = sink.0.lock();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], (ErrorCode::ShaderCompile, line));
    }
}
