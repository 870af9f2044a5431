//! Rendering of collected profiles: collapsed stacks, aggregated text,
//! SVG flamegraphs and a raw JSON dump.
//!
//! Everything here consumes a finished [`CpuProfile`]; none of it is
//! entangled with the sampling loop.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use inferno::flamegraph::{self, Options};

use crate::frames::CpuProfile;

/// Collapse a profile into sorted `root;..;leaf count` lines.
///
/// Backtraces arrive leaf to root; collapsed format wants root first,
/// so each stack is reversed before joining.
pub fn collapse(profile: &CpuProfile) -> Vec<String> {
    let mut counts: HashMap<String, u64> = HashMap::new();

    for bt in &profile.backtraces {
        if bt.is_empty() {
            continue;
        }
        let stack = bt
            .frames
            .iter()
            .rev()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(";");
        *counts.entry(stack).or_insert(0) += 1;
    }

    let mut lines: Vec<String> = counts
        .into_iter()
        .map(|(stack, count)| format!("{} {}", stack, count))
        .collect();
    lines.sort();
    lines
}

/// Aggregated textual view, heaviest stacks first.
pub fn render_text(profile: &CpuProfile) -> String {
    let mut lines: Vec<(u64, String)> = collapse(profile)
        .into_iter()
        .filter_map(|line| {
            let (stack, count) = line.rsplit_once(' ')?;
            Some((count.parse().ok()?, stack.to_string()))
        })
        .collect();
    lines.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let total: u64 = lines.iter().map(|(count, _)| count).sum();
    let mut out = String::new();
    out.push_str(&format!("Total samples: {}\n", total));
    for (count, stack) in lines {
        out.push_str(&format!("{:6}  {}\n", count, stack));
    }
    out
}

/// Write an SVG flamegraph from collapsed stack lines.
pub fn write_svg(path: &Path, stacks: &[String], title: &str) -> Result<()> {
    let mut opts = Options::default();
    opts.title = title.to_string();

    let mut writer = std::io::BufWriter::new(
        std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?,
    );
    flamegraph::from_lines(&mut opts, stacks.iter().map(|v| v.as_str()), &mut writer)
        .map_err(|err| anyhow::anyhow!("failed to write flamegraph: {}", err))?;
    Ok(())
}

/// Every captured backtrace, unaggregated, as JSON.
pub fn render_json(profile: &CpuProfile) -> Result<String> {
    serde_json::to_string_pretty(profile).context("serializing profile")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{Backtrace, FrameAnnotation};

    fn managed(name: &str) -> FrameAnnotation {
        FrameAnnotation::Managed {
            function: Some(name.into()),
            file: Some("app.js".into()),
            line: Some(1),
        }
    }

    fn profile_of(stacks: Vec<Vec<FrameAnnotation>>) -> CpuProfile {
        CpuProfile {
            backtraces: stacks.into_iter().map(Backtrace::new).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn collapse_counts_identical_stacks() {
        // leaf-to-root order as captured
        let profile = profile_of(vec![
            vec![managed("leaf"), managed("main")],
            vec![managed("leaf"), managed("main")],
            vec![managed("other"), managed("main")],
            vec![],
        ]);

        let lines = collapse(&profile);
        assert_eq!(
            lines,
            vec![
                "main:app.js:1;leaf:app.js:1 2".to_string(),
                "main:app.js:1;other:app.js:1 1".to_string(),
            ]
        );
    }

    #[test]
    fn text_orders_by_weight() {
        let profile = profile_of(vec![
            vec![managed("cold")],
            vec![managed("hot")],
            vec![managed("hot")],
        ]);

        let text = render_text(&profile);
        let hot = text.find("hot").unwrap();
        let cold = text.find("cold").unwrap();
        assert!(text.starts_with("Total samples: 3\n"));
        assert!(hot < cold);
    }
}
