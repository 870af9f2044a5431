//! Timer-driven sampling session over one platform tracer.
//!
//! Single-threaded and cooperative: the end-of-duration timer and the
//! self-rescheduling sampling timer are the only suspension points, and
//! all decode work inside one backtrace call completes before either
//! timer callback returns. Under decode load the effective interval
//! lengthens; samples never pile up.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::frames::{Backtrace, CpuProfile, FrameAnnotation};
use crate::symbols::NativeSymbolResolver;
use crate::tracer::{PlatformTracer, TraceError};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("already profiling pid {0}")]
    AlreadyProfiling(u32),
    #[error("pid must be a positive integer")]
    InvalidPid,
    #[error("profiling duration in ms must be a positive integer")]
    InvalidDuration,
    #[error("sampling interval in ms must be a positive integer")]
    InvalidInterval,
    #[error("error attaching to process: {0}")]
    Attach(#[source] TraceError),
    #[error("error detaching from process: {0}")]
    Detach(#[source] TraceError),
}

/// One profiling request: how long to sample which process, and how
/// often. Duration caps are the caller's policy, not enforced here.
#[derive(Debug, Clone, Copy)]
pub struct ProfileRequest {
    pub pid: u32,
    pub duration_ms: u64,
    pub interval_ms: u64,
}

/// Requests cancellation of an in-flight run. Stopping a run that is
/// already stopping, or not running at all, is a no-op.
#[derive(Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Pids with a session currently attaching or sampling. At most one
/// live run per process id; a second request is rejected, not queued.
fn active_pids() -> &'static Mutex<HashSet<u32>> {
    static ACTIVE: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

struct PidClaim(u32);

impl PidClaim {
    fn take(pid: u32) -> Option<PidClaim> {
        let mut active = active_pids().lock().unwrap_or_else(|e| e.into_inner());
        active.insert(pid).then_some(PidClaim(pid))
    }
}

impl Drop for PidClaim {
    fn drop(&mut self) {
        let mut active = active_pids().lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.0);
    }
}

pub struct ProfilingSession<T, R> {
    tracer: T,
    resolver: R,
    stop_tx: mpsc::Sender<()>,
    stop_rx: mpsc::Receiver<()>,
}

impl<T: PlatformTracer, R: NativeSymbolResolver> ProfilingSession<T, R> {
    pub fn new(tracer: T, resolver: R) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        ProfilingSession {
            tracer,
            resolver,
            stop_tx,
            stop_rx,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Run one bounded profiling pass and deliver the decoded
    /// backtraces, with native frames batch-resolved after detach.
    ///
    /// A failed symbol batch does not discard the run: backtraces are
    /// delivered with raw native addresses and the error is reported on
    /// the profile. The session is reusable after this returns.
    pub async fn profile(&mut self, req: ProfileRequest) -> Result<CpuProfile, ProfileError> {
        let claim =
            PidClaim::take(req.pid).ok_or(ProfileError::AlreadyProfiling(req.pid))?;

        if req.pid == 0 {
            return Err(ProfileError::InvalidPid);
        }
        if req.duration_ms == 0 {
            return Err(ProfileError::InvalidDuration);
        }
        if req.interval_ms == 0 {
            return Err(ProfileError::InvalidInterval);
        }

        // A stop requested before this run must not cancel it.
        while self.stop_rx.try_recv().is_ok() {}

        self.tracer.attach(req.pid).map_err(ProfileError::Attach)?;

        let interval = Duration::from_millis(req.interval_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(req.duration_ms);

        let mut backtraces: Vec<Backtrace> = Vec::new();
        let mut dropped_samples = 0u64;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = self.stop_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {
                    match self.tracer.backtrace() {
                        Some(bt) => backtraces.push(bt),
                        None => dropped_samples += 1,
                    }
                }
            }
        }

        self.tracer.detach().map_err(ProfileError::Detach)?;

        let symbol_error = self.resolve_native_frames(req.pid, &mut backtraces);

        tracing::debug!(
            pid = req.pid,
            samples = backtraces.len(),
            dropped = dropped_samples,
            "profiling run complete"
        );

        drop(claim);
        Ok(CpuProfile {
            backtraces,
            dropped_samples,
            symbol_error,
        })
    }

    /// Deduplicate unresolved native addresses across all backtraces,
    /// resolve them in one batch and substitute the names in place.
    fn resolve_native_frames(&self, pid: u32, backtraces: &mut [Backtrace]) -> Option<String> {
        let addresses: BTreeSet<u64> = backtraces
            .iter()
            .flat_map(|bt| bt.frames.iter())
            .filter_map(FrameAnnotation::unresolved_native)
            .collect();

        if addresses.is_empty() {
            return None;
        }

        let addresses: Vec<u64> = addresses.into_iter().collect();
        match self.resolver.resolve_batch(pid, &addresses) {
            Ok(table) => {
                substitute_symbols(backtraces, &table);
                None
            }
            Err(err) => {
                tracing::warn!(pid, %err, "native symbol batch failed");
                Some(err.to_string())
            }
        }
    }
}

fn substitute_symbols(backtraces: &mut [Backtrace], table: &HashMap<u64, String>) {
    for frame in backtraces.iter_mut().flat_map(|bt| bt.frames.iter_mut()) {
        if let FrameAnnotation::Native {
            address,
            symbol: symbol @ None,
        } = frame
        {
            if let Some(name) = table.get(address) {
                *symbol = Some(name.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(address: u64) -> FrameAnnotation {
        FrameAnnotation::Native {
            address,
            symbol: None,
        }
    }

    #[test]
    fn substitution_only_touches_unresolved_native_frames() {
        let mut backtraces = vec![Backtrace::new(vec![
            native(0x10),
            native(0x20),
            FrameAnnotation::Builtin,
            FrameAnnotation::Native {
                address: 0x30,
                symbol: Some("already".into()),
            },
        ])];

        let mut table = HashMap::new();
        table.insert(0x10u64, "uv_run".to_string());
        table.insert(0x30u64, "clobber".to_string());

        substitute_symbols(&mut backtraces, &table);

        let frames = &backtraces[0].frames;
        assert_eq!(frames[0].to_string(), "uv_run:native");
        assert_eq!(frames[1].to_string(), "[native:20]");
        assert_eq!(frames[2], FrameAnnotation::Builtin);
        assert_eq!(frames[3].to_string(), "already:native");
    }

    #[test]
    fn pid_claims_are_exclusive_and_released() {
        let first = PidClaim::take(91999).expect("first claim");
        assert!(PidClaim::take(91999).is_none());
        drop(first);
        assert!(PidClaim::take(91999).is_some());
    }
}
