//! Session-level tests over mock tracer and resolver backends.
//!
//! Timers run on tokio's paused test clock, so the tick math is exact:
//! a 1000ms run at 100ms intervals produces nine or ten samples
//! depending on whether the final tick or the deadline wins the race.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use profile_vee::frames::{Backtrace, FrameAnnotation};
use profile_vee::session::{ProfileError, ProfileRequest, ProfilingSession};
use profile_vee::symbols::{NativeSymbolResolver, SymbolError};
use profile_vee::tracer::{PlatformTracer, TraceError};

#[derive(Default)]
struct TracerState {
    attach_calls: u32,
    detach_calls: u32,
    ticks: u32,
}

/// Scripted tracer: replays a fixed backtrace on every tick, with
/// optional attach/detach failures and periodic dropped ticks.
struct MockTracer {
    state: Arc<Mutex<TracerState>>,
    frames: Vec<FrameAnnotation>,
    fail_attach: bool,
    fail_detach: bool,
    drop_every: u32,
}

impl MockTracer {
    fn new(frames: Vec<FrameAnnotation>) -> (Self, Arc<Mutex<TracerState>>) {
        let state = Arc::new(Mutex::new(TracerState::default()));
        let tracer = MockTracer {
            state: state.clone(),
            frames,
            fail_attach: false,
            fail_detach: false,
            drop_every: 0,
        };
        (tracer, state)
    }
}

impl PlatformTracer for MockTracer {
    fn attach(&mut self, pid: u32) -> Result<(), TraceError> {
        self.state.lock().unwrap().attach_calls += 1;
        if self.fail_attach {
            return Err(TraceError::Attach {
                pid,
                reason: "permission denied".into(),
            });
        }
        Ok(())
    }

    fn backtrace(&mut self) -> Option<Backtrace> {
        let mut state = self.state.lock().unwrap();
        state.ticks += 1;
        if self.drop_every > 0 && state.ticks % self.drop_every == 0 {
            return None;
        }
        Some(Backtrace::new(self.frames.clone()))
    }

    fn detach(&mut self) -> Result<(), TraceError> {
        let mut state = self.state.lock().unwrap();
        state.detach_calls += 1;
        if self.fail_detach {
            return Err(TraceError::Detach {
                pid: 0,
                reason: "process gone".into(),
            });
        }
        Ok(())
    }
}

/// Resolver that records every batch it is asked for.
struct MockResolver {
    table: HashMap<u64, String>,
    fail: bool,
    batches: Arc<Mutex<Vec<Vec<u64>>>>,
}

impl MockResolver {
    fn new(table: HashMap<u64, String>) -> (Self, Arc<Mutex<Vec<Vec<u64>>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let resolver = MockResolver {
            table,
            fail: false,
            batches: batches.clone(),
        };
        (resolver, batches)
    }

    fn empty() -> Self {
        Self::new(HashMap::new()).0
    }
}

impl NativeSymbolResolver for MockResolver {
    fn resolve_batch(
        &self,
        _pid: u32,
        addresses: &[u64],
    ) -> Result<HashMap<u64, String>, SymbolError> {
        self.batches.lock().unwrap().push(addresses.to_vec());
        if self.fail {
            return Err(SymbolError::Backend("no symbol source".into()));
        }
        Ok(self.table.clone())
    }
}

fn managed(name: &str) -> FrameAnnotation {
    FrameAnnotation::Managed {
        function: Some(name.into()),
        file: Some("app.js".into()),
        line: Some(7),
    }
}

fn native(address: u64) -> FrameAnnotation {
    FrameAnnotation::Native {
        address,
        symbol: None,
    }
}

fn request(pid: u32, duration_ms: u64, interval_ms: u64) -> ProfileRequest {
    ProfileRequest {
        pid,
        duration_ms,
        interval_ms,
    }
}

#[tokio::test(start_paused = true)]
async fn samples_at_the_requested_interval_and_resolves_natives() {
    let (tracer, state) = MockTracer::new(vec![
        managed("onTick"),
        native(0x2000),
        native(0x1000),
        native(0x2000),
    ]);
    let mut table = HashMap::new();
    table.insert(0x1000u64, "uv_run".to_string());
    table.insert(0x2000u64, "epoll_wait".to_string());
    let (resolver, batches) = MockResolver::new(table);

    let mut session = ProfilingSession::new(tracer, resolver);
    let profile = session.profile(request(4242, 1000, 100)).await.unwrap();

    // ticks at 100..=900 always land; the tick at 1000 races the deadline
    assert!(
        (9..=10).contains(&profile.backtraces.len()),
        "got {} backtraces",
        profile.backtraces.len()
    );
    assert_eq!(profile.dropped_samples, 0);
    assert_eq!(profile.symbol_error, None);

    // one deduplicated, ordered batch despite repeated addresses
    assert_eq!(*batches.lock().unwrap(), vec![vec![0x1000u64, 0x2000]]);

    for bt in &profile.backtraces {
        assert!(bt.frames.iter().all(|f| f.unresolved_native().is_none()));
        assert_eq!(bt.frames[1].to_string(), "epoll_wait:native");
        assert_eq!(bt.frames[2].to_string(), "uv_run:native");
    }

    let state = state.lock().unwrap();
    assert_eq!(state.attach_calls, 1);
    assert_eq!(state.detach_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn attach_failure_aborts_without_detaching() {
    let (mut tracer, state) = MockTracer::new(vec![managed("f")]);
    tracer.fail_attach = true;

    let mut session = ProfilingSession::new(tracer, MockResolver::empty());
    let err = session.profile(request(4301, 500, 100)).await.unwrap_err();

    assert!(matches!(err, ProfileError::Attach(_)));
    let state = state.lock().unwrap();
    assert_eq!(state.detach_calls, 0);
    assert_eq!(state.ticks, 0);
}

#[tokio::test(start_paused = true)]
async fn detach_failure_surfaces_as_error() {
    let (mut tracer, _state) = MockTracer::new(vec![managed("f")]);
    tracer.fail_detach = true;

    let mut session = ProfilingSession::new(tracer, MockResolver::empty());
    let err = session.profile(request(4302, 300, 100)).await.unwrap_err();
    assert!(matches!(err, ProfileError::Detach(_)));
}

#[tokio::test(start_paused = true)]
async fn second_session_on_the_same_pid_is_rejected() {
    let (tracer_a, _) = MockTracer::new(vec![managed("a")]);
    let (tracer_b, state_b) = MockTracer::new(vec![managed("b")]);
    let mut session_a = ProfilingSession::new(tracer_a, MockResolver::empty());
    let mut session_b = ProfilingSession::new(tracer_b, MockResolver::empty());

    let (a, b) = tokio::join!(
        session_a.profile(request(4303, 300, 100)),
        session_b.profile(request(4303, 300, 100)),
    );

    assert!(a.is_ok());
    assert!(matches!(b, Err(ProfileError::AlreadyProfiling(4303))));
    assert_eq!(state_b.lock().unwrap().attach_calls, 0);

    // the pid is free again once the first run finished
    let second = session_b.profile(request(4303, 200, 100)).await;
    assert!(second.is_ok());
}

#[tokio::test(start_paused = true)]
async fn stop_ends_the_run_early_and_the_session_stays_usable() {
    let (tracer, _state) = MockTracer::new(vec![managed("f")]);
    let mut session = ProfilingSession::new(tracer, MockResolver::empty());

    let stop = session.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(350)).await;
        stop.stop();
        // stopping again is a no-op
        stop.stop();
    });

    let profile = session.profile(request(4304, 10_000, 100)).await.unwrap();
    assert_eq!(profile.backtraces.len(), 3);

    // a stop queued after the run must not cancel the next one
    session.stop_handle().stop();
    let profile = session.profile(request(4304, 200, 100)).await.unwrap();
    assert!(
        (1..=2).contains(&profile.backtraces.len()),
        "stale stop cancelled the run"
    );
}

#[tokio::test(start_paused = true)]
async fn resolver_failure_still_delivers_raw_addresses() {
    let (tracer, _state) = MockTracer::new(vec![native(0xabc)]);
    let mut resolver = MockResolver::empty();
    resolver.fail = true;

    let mut session = ProfilingSession::new(tracer, resolver);
    let profile = session.profile(request(4305, 300, 100)).await.unwrap();

    assert!(!profile.backtraces.is_empty());
    assert!(profile.symbol_error.is_some());
    for bt in &profile.backtraces {
        assert_eq!(bt.frames[0].to_string(), "[native:abc]");
    }
}

#[tokio::test(start_paused = true)]
async fn failed_ticks_are_counted_not_delivered() {
    let (mut tracer, state) = MockTracer::new(vec![managed("f")]);
    tracer.drop_every = 2;

    let mut session = ProfilingSession::new(tracer, MockResolver::empty());
    let profile = session.profile(request(4306, 1000, 100)).await.unwrap();

    let ticks = state.lock().unwrap().ticks as u64;
    assert!(ticks >= 9);
    assert_eq!(profile.dropped_samples, ticks / 2);
    assert_eq!(profile.backtraces.len() as u64 + profile.dropped_samples, ticks);
}

#[tokio::test(start_paused = true)]
async fn managed_only_profiles_skip_the_symbol_batch() {
    let (tracer, _state) = MockTracer::new(vec![managed("f"), FrameAnnotation::Builtin]);
    let (resolver, batches) = MockResolver::new(HashMap::new());

    let mut session = ProfilingSession::new(tracer, resolver);
    let profile = session.profile(request(4307, 300, 100)).await.unwrap();

    assert!(!profile.backtraces.is_empty());
    assert!(batches.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_requests_never_touch_the_tracer() {
    let cases = [
        (request(0, 300, 100), "pid"),
        (request(4308, 0, 100), "duration"),
        (request(4309, 300, 0), "interval"),
    ];

    for (req, what) in cases {
        let (tracer, state) = MockTracer::new(vec![]);
        let mut session = ProfilingSession::new(tracer, MockResolver::empty());
        let err = session.profile(req).await.unwrap_err();
        match what {
            "pid" => assert!(matches!(err, ProfileError::InvalidPid)),
            "duration" => assert!(matches!(err, ProfileError::InvalidDuration)),
            _ => assert!(matches!(err, ProfileError::InvalidInterval)),
        }
        assert_eq!(state.lock().unwrap().attach_calls, 0);
    }
}
