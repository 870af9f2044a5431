//! Decoded stack frame and profile result types.

use serde::Serialize;
use std::fmt;

/// One decoded stack frame.
///
/// `Managed` fields are individually optional: each of name, file and
/// line can fail to decode on its own and is then rendered with a
/// placeholder rather than failing the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameAnnotation {
    Managed {
        function: Option<String>,
        file: Option<String>,
        line: Option<i32>,
    },
    Builtin,
    InternalRuntime,
    ConstructorEntry,
    Constructor,
    ArgumentsAdaptor,
    Exit,
    Entry,
    Native {
        address: u64,
        /// Filled in after the post-detach symbol batch; `None` keeps
        /// the raw-address rendering.
        symbol: Option<String>,
    },
    Unknown {
        address: u64,
    },
}

impl FrameAnnotation {
    /// Address of an unresolved native frame, if this is one.
    pub fn unresolved_native(&self) -> Option<u64> {
        match self {
            FrameAnnotation::Native {
                address,
                symbol: None,
            } => Some(*address),
            _ => None,
        }
    }
}

impl fmt::Display for FrameAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameAnnotation::Managed {
                function,
                file,
                line,
            } => {
                let function = function.as_deref().filter(|s| !s.is_empty());
                let file = file.as_deref().filter(|s| !s.is_empty());
                write!(
                    f,
                    "{}:{}:",
                    function.unwrap_or("[empty]"),
                    file.unwrap_or("[empty]"),
                )?;
                match line {
                    Some(line) => write!(f, "{}", line),
                    None => write!(f, "[unknown]"),
                }
            }
            FrameAnnotation::Builtin => write!(f, "[builtin]"),
            FrameAnnotation::InternalRuntime => write!(f, "[internal frame]"),
            FrameAnnotation::ConstructorEntry => write!(f, "[constructor entry]"),
            FrameAnnotation::Constructor => write!(f, "[constructor frame]"),
            FrameAnnotation::ArgumentsAdaptor => write!(f, "[arguments adaptor]"),
            FrameAnnotation::Exit => write!(f, "[exit frame]"),
            FrameAnnotation::Entry => write!(f, "[entry frame]"),
            FrameAnnotation::Native {
                address,
                symbol: None,
            } => write!(f, "[native:{:x}]", address),
            FrameAnnotation::Native {
                symbol: Some(symbol),
                ..
            } => write!(f, "{}:native", symbol),
            FrameAnnotation::Unknown { address } => write!(f, "[unknown:{:x}]", address),
        }
    }
}

/// One sampled call stack, ordered leaf to root as captured by the
/// low-level stack walk. Callers that want root-to-leaf reverse it
/// explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Backtrace {
    pub frames: Vec<FrameAnnotation>,
}

impl Backtrace {
    pub fn new(frames: Vec<FrameAnnotation>) -> Self {
        Backtrace { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Final result of one profiling run.
#[derive(Debug, Default, Serialize)]
pub struct CpuProfile {
    /// Captured backtraces in sampling order.
    pub backtraces: Vec<Backtrace>,
    /// Ticks skipped because the low-level capture reported a transient
    /// failure (negative frame count).
    pub dropped_samples: u64,
    /// Set when the post-detach native symbol batch failed; backtraces
    /// are still delivered with raw native addresses.
    pub symbol_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_display_with_placeholders() {
        let full = FrameAnnotation::Managed {
            function: Some("tick".into()),
            file: Some("app.js".into()),
            line: Some(42),
        };
        assert_eq!(full.to_string(), "tick:app.js:42");

        let partial = FrameAnnotation::Managed {
            function: None,
            file: Some("app.js".into()),
            line: None,
        };
        assert_eq!(partial.to_string(), "[empty]:app.js:[unknown]");

        let anonymous = FrameAnnotation::Managed {
            function: Some(String::new()),
            file: None,
            line: Some(1),
        };
        assert_eq!(anonymous.to_string(), "[empty]:[empty]:1");
    }

    #[test]
    fn native_display_before_and_after_resolution() {
        let raw = FrameAnnotation::Native {
            address: 0xdeadbeef,
            symbol: None,
        };
        assert_eq!(raw.to_string(), "[native:deadbeef]");
        assert_eq!(raw.unresolved_native(), Some(0xdeadbeef));

        let resolved = FrameAnnotation::Native {
            address: 0xdeadbeef,
            symbol: Some("uv_run".into()),
        };
        assert_eq!(resolved.to_string(), "uv_run:native");
        assert_eq!(resolved.unresolved_native(), None);
    }
}
