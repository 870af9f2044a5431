//! ptrace-based tracer: PTRACE_SEIZE to attach, PTRACE_INTERRUPT to
//! freeze around each capture, remote memory through `/proc/<pid>/mem`.

use std::ffi::c_void;

use nix::sys::ptrace;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use super::{PlatformTracer, TraceError, FP_RETURN_ADDRESS_OFFSET, MAX_STACK_DEPTH};
use crate::frames::Backtrace;
use crate::heap::{untag, HeapReader};
use crate::layout::V8Layout;
use crate::mem::ProcMemReader;

pub struct LinuxTracer {
    layout: &'static V8Layout,
    pid: Option<Pid>,
    heap: Option<HeapReader<ProcMemReader>>,
}

impl LinuxTracer {
    pub fn new(layout: &'static V8Layout) -> Self {
        LinuxTracer {
            layout,
            pid: None,
            heap: None,
        }
    }

    /// Stop the target and wait for it to report stopped.
    fn pause(pid: Pid) -> nix::Result<()> {
        ptrace::interrupt(pid)?;
        waitpid(pid, None)?;
        Ok(())
    }

    fn resume(pid: Pid) {
        if let Err(err) = ptrace::cont(pid, None) {
            tracing::warn!(%pid, %err, "failed to resume target");
        }
    }

    /// Peek one stack word; faults read as 0 so a bad frame pointer
    /// terminates the walk instead of failing the capture.
    fn peek_pointer(pid: Pid, addr: u64) -> u64 {
        match ptrace::read(pid, untag(addr) as *mut c_void) {
            Ok(word) => untag(word as u64),
            Err(_) => 0,
        }
    }

    /// Freeze the target and collect (pc, fp) pairs leaf to root.
    fn capture(pid: Pid) -> nix::Result<Vec<(u64, u64)>> {
        Self::pause(pid)?;

        let (mut pc, mut fp) = thread_state(pid)?;
        let mut pairs = Vec::with_capacity(32);
        while pairs.len() < MAX_STACK_DEPTH && fp != 0 {
            pairs.push((pc, fp));
            pc = Self::peek_pointer(pid, fp + FP_RETURN_ADDRESS_OFFSET);
            fp = Self::peek_pointer(pid, fp);
        }

        Ok(pairs)
    }

    fn comm(pid: u32) -> Option<String> {
        let stat = procfs::process::Process::new(pid as i32).ok()?.stat().ok()?;
        Some(stat.comm)
    }
}

impl PlatformTracer for LinuxTracer {
    fn attach(&mut self, pid: u32) -> Result<(), TraceError> {
        let target = Pid::from_raw(pid as i32);

        ptrace::seize(target, ptrace::Options::empty()).map_err(|err| TraceError::Attach {
            pid,
            reason: err.to_string(),
        })?;

        let mem = match ProcMemReader::open(pid) {
            Ok(mem) => mem,
            Err(err) => {
                // Nothing must be retained on a failed attach.
                let _ = ptrace::detach(target, None);
                return Err(TraceError::Attach {
                    pid,
                    reason: format!("cannot open /proc/{}/mem: {}", pid, err),
                });
            }
        };

        self.pid = Some(target);
        self.heap = Some(HeapReader::new(mem, self.layout));
        tracing::info!(
            pid,
            comm = Self::comm(pid).as_deref().unwrap_or("?"),
            "attached"
        );
        Ok(())
    }

    fn backtrace(&mut self) -> Option<Backtrace> {
        let pid = self.pid?;
        let heap = self.heap.as_ref()?;

        let pairs = match Self::capture(pid) {
            Ok(pairs) => pairs,
            Err(err) => {
                tracing::trace!(%pid, %err, "stack capture failed, skipping tick");
                Self::resume(pid);
                return None;
            }
        };

        let frames = pairs
            .into_iter()
            .filter_map(|(pc, fp)| heap.annotate_frame(pc, fp))
            .collect();

        Self::resume(pid);
        Some(Backtrace::new(frames))
    }

    fn detach(&mut self) -> Result<(), TraceError> {
        let pid = self.pid.take().ok_or(TraceError::NotAttached)?;
        // Drop the /proc/<pid>/mem handle whatever the detach outcome.
        self.heap = None;

        let _ = Self::pause(pid);
        ptrace::detach(pid, None).map_err(|err| TraceError::Detach {
            pid: pid.as_raw() as u32,
            reason: err.to_string(),
        })?;

        tracing::info!(%pid, "detached");
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
fn thread_state(pid: Pid) -> nix::Result<(u64, u64)> {
    let regs = ptrace::getregs(pid)?;
    Ok((regs.rip, regs.rbp))
}

#[cfg(target_arch = "aarch64")]
fn thread_state(pid: Pid) -> nix::Result<(u64, u64)> {
    let regs = ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(pid)?;
    Ok((regs.pc, regs.regs[29]))
}
