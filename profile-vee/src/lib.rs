//! profile-vee: a non-invasive sampling CPU profiler for running
//! node.js processes.
//!
//! Attaches to a target by pid, periodically freezes it, walks the
//! native call stack and decodes V8 heap objects out of the remote
//! address space to recover function/file/line for each frame. The
//! target needs no instrumentation, debug build or cooperation.

pub mod frames;
pub mod heap;
pub mod layout;
pub mod mem;
pub mod output;
pub mod session;
pub mod symbols;
pub mod tracer;

pub use frames::{Backtrace, CpuProfile, FrameAnnotation};
pub use layout::V8Layout;
pub use session::{ProfileError, ProfileRequest, ProfilingSession, StopHandle};
