//! Platform attach/suspend/backtrace/resume/detach state machines.
//!
//! One polymorphic capability with two concrete variants: ptrace plus
//! `/proc/<pid>/mem` on Linux, task ports plus `vm_read` on macOS. The
//! heap decoder never knows which variant backs its memory reads.

use thiserror::Error;

use crate::frames::Backtrace;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTracer;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacTracer;

/// Tracer variant for the host platform.
#[cfg(target_os = "linux")]
pub type HostTracer = LinuxTracer;
#[cfg(target_os = "macos")]
pub type HostTracer = MacTracer;

/// Captures are cut off past this many frames.
pub const MAX_STACK_DEPTH: usize = 200;

/// Return address slot relative to a frame pointer.
pub const FP_RETURN_ADDRESS_OFFSET: u64 = 0x08;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to attach to pid {pid}: {reason}")]
    Attach { pid: u32, reason: String },
    #[error("failed to detach from pid {pid}: {reason}")]
    Detach { pid: u32, reason: String },
    #[error("tracer is not attached")]
    NotAttached,
}

/// Attach/backtrace/detach over one target process.
///
/// State machine: Detached -> Attached -> (sampling)* -> Detached.
/// `backtrace` must leave the target resumed before it returns, whatever
/// the decode outcome, so the pause is bounded by one decode pass.
pub trait PlatformTracer {
    /// Suspend-capable attach. On failure nothing is retained: the
    /// caller must treat this as fatal for the session.
    fn attach(&mut self, pid: u32) -> Result<(), TraceError>;

    /// Freeze the target, capture and decode one call stack, resume.
    ///
    /// `None` means this tick produced no sample (transient capture
    /// failure); sampling continues on the next tick.
    fn backtrace(&mut self) -> Option<Backtrace>;

    /// Resume and release the target. Local state is torn down even when
    /// the underlying detach call reports failure.
    fn detach(&mut self) -> Result<(), TraceError>;
}
