use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use profile_vee::output;
use profile_vee::session::{ProfileRequest, ProfilingSession};
use profile_vee::symbols::host_resolver;
use profile_vee::tracer::HostTracer;
use profile_vee::V8Layout;

/// Sampling for longer than this is refused, for safety.
const MAX_DURATION_SECONDS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Aggregated textual call stacks
    Text,
    /// SVG flamegraph
    Flame,
    /// Collapsed stacks for external FlameGraph tools
    Raw,
    /// JSON dump of every captured backtrace
    Fullraw,
}

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// PID of the node.js process to profile
    pid: u32,

    /// Output format
    #[arg(value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Profiling duration in seconds
    #[arg(default_value_t = 5.0)]
    duration: f64,

    /// Sampling interval in milliseconds
    #[arg(short, long, default_value_t = 8)]
    interval: u64,

    /// Target runtime (node.js) major version, selects the heap layout table
    #[arg(long, default_value_t = 4)]
    runtime_version: u32,

    /// Filename to write the flamegraph svg (format=flame)
    #[arg(short, long, default_value = "profile.svg")]
    svg: PathBuf,

    /// Also write the collapsed stacks to a file
    #[arg(short, long)]
    collapse: Option<PathBuf>,
}

fn pid_exists(pid: u32) -> bool {
    // signal 0 probes for existence without delivering anything
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();

    if !(opt.duration > 0.0) {
        bail!("duration must be positive");
    }
    if opt.duration > MAX_DURATION_SECONDS {
        bail!("sample for at most {}s (for safety)", MAX_DURATION_SECONDS);
    }
    if !pid_exists(opt.pid) {
        bail!("process {} does not exist", opt.pid);
    }

    let layout = V8Layout::for_node_major(opt.runtime_version)?;

    eprintln!(
        "Sampling {} for {}s at {}ms intervals, outputting {:?}.",
        opt.pid, opt.duration, opt.interval, opt.format
    );

    let mut session = ProfilingSession::new(HostTracer::new(layout), host_resolver());

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, stopping early");
            stop.stop();
        }
    });

    let profile = session
        .profile(ProfileRequest {
            pid: opt.pid,
            duration_ms: (opt.duration * 1000.0) as u64,
            interval_ms: opt.interval,
        })
        .await?;

    if profile.dropped_samples > 0 {
        tracing::warn!(dropped = profile.dropped_samples, "some ticks were skipped");
    }
    if let Some(err) = &profile.symbol_error {
        tracing::warn!(%err, "native frames left unresolved");
    }

    let stacks = output::collapse(&profile);

    if let Some(path) = &opt.collapse {
        std::fs::write(path, stacks.join("\n"))
            .with_context(|| format!("writing {}", path.display()))?;
    }

    match opt.format {
        Format::Text => print!("{}", output::render_text(&profile)),
        Format::Raw => println!("{}", stacks.join("\n")),
        Format::Fullraw => println!("{}", output::render_json(&profile)?),
        Format::Flame => {
            output::write_svg(&opt.svg, &stacks, &format!("pid {}", opt.pid))?;
            eprintln!("wrote {}", opt.svg.display());
        }
    }

    Ok(())
}
