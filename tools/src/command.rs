//! Tool table: maps a validated request onto an executable and argv
//!
//! Each tool has one descriptor holding its executable path, its single
//! tunable parameter with a default, and an argument template that knows the
//! flag spelling of every supported host family. The target is always the
//! last argv entry.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ExecutionError;
use crate::types::Tool;

/// Host families whose tools disagree on flag spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    /// macOS and the BSDs
    Bsd,
    Windows,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostOs::Windows
        } else if cfg!(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly"
        )) {
            HostOs::Bsd
        } else {
            HostOs::Linux
        }
    }
}

/// Produces the flags for one tool, given the resolved parameter value.
type ArgTemplate = fn(HostOs, &str) -> Vec<String>;

/// Static descriptor for one allow-listed tool.
#[derive(Clone)]
pub struct ToolSpec {
    pub tool: Tool,
    pub executable: PathBuf,
    /// Request parameter consulted by the template, e.g. `count`.
    pub param: &'static str,
    pub default_value: &'static str,
    template: ArgTemplate,
}

impl ToolSpec {
    pub fn for_host(tool: Tool, os: HostOs) -> Self {
        match tool {
            Tool::Ping => Self {
                tool,
                executable: PathBuf::from(match os {
                    HostOs::Linux => "/usr/bin/ping",
                    HostOs::Bsd => "/sbin/ping",
                    HostOs::Windows => "ping.exe",
                }),
                param: "count",
                default_value: "4",
                template: ping_args,
            },
            Tool::Dig => Self {
                tool,
                executable: PathBuf::from(match os {
                    HostOs::Linux | HostOs::Bsd => "/usr/bin/dig",
                    HostOs::Windows => "dig.exe",
                }),
                param: "type",
                default_value: "A",
                template: dig_args,
            },
            Tool::Traceroute => Self {
                tool,
                executable: PathBuf::from(match os {
                    HostOs::Linux => "/usr/bin/traceroute",
                    HostOs::Bsd => "/usr/sbin/traceroute",
                    HostOs::Windows => "tracert.exe",
                }),
                param: "maxHops",
                default_value: "30",
                template: traceroute_args,
            },
        }
    }

    /// Full argv (without the program) for `target`.
    pub fn args(&self, os: HostOs, target: &str, params: &HashMap<String, String>) -> Vec<String> {
        let value = params
            .get(self.param)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .unwrap_or(self.default_value);

        let mut args = (self.template)(os, value);
        args.push(target.to_string());
        args
    }
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("tool", &self.tool)
            .field("executable", &self.executable)
            .field("param", &self.param)
            .field("default_value", &self.default_value)
            .finish_non_exhaustive()
    }
}

fn ping_args(os: HostOs, count: &str) -> Vec<String> {
    let flags: [&str; 4] = match os {
        HostOs::Linux => ["-c", count, "-W", "2"],
        // BSD ping takes the per-reply wait in milliseconds
        HostOs::Bsd => ["-c", count, "-W", "2000"],
        HostOs::Windows => ["-n", count, "-w", "2000"],
    };
    flags.iter().map(|s| s.to_string()).collect()
}

fn dig_args(_os: HostOs, record_type: &str) -> Vec<String> {
    vec![
        "+nocomments".to_string(),
        "+noquestion".to_string(),
        record_type.to_ascii_uppercase(),
    ]
}

fn traceroute_args(os: HostOs, max_hops: &str) -> Vec<String> {
    let flags: [&str; 4] = match os {
        HostOs::Linux | HostOs::Bsd => ["-m", max_hops, "-w", "2"],
        HostOs::Windows => ["-h", max_hops, "-w", "2000"],
    };
    flags.iter().map(|s| s.to_string()).collect()
}

/// A ready-to-spawn program and argv. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl BuiltCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// All tool descriptors for one host, built once at start-up.
#[derive(Debug, Clone)]
pub struct ToolTable {
    os: HostOs,
    specs: HashMap<Tool, ToolSpec>,
}

impl ToolTable {
    pub fn for_host() -> Self {
        Self::for_os(HostOs::current())
    }

    pub fn for_os(os: HostOs) -> Self {
        let specs = Tool::ALL
            .into_iter()
            .map(|tool| (tool, ToolSpec::for_host(tool, os)))
            .collect();
        Self { os, specs }
    }

    /// Point a tool at a different binary, e.g. from configuration.
    pub fn with_executable(mut self, tool: Tool, path: impl AsRef<Path>) -> Self {
        if let Some(spec) = self.specs.get_mut(&tool) {
            spec.executable = path.as_ref().to_path_buf();
        }
        self
    }

    pub fn os(&self) -> HostOs {
        self.os
    }

    pub fn spec(&self, tool: Tool) -> Option<&ToolSpec> {
        self.specs.get(&tool)
    }

    pub fn build(
        &self,
        tool: Tool,
        target: &str,
        params: &HashMap<String, String>,
    ) -> Result<BuiltCommand, ExecutionError> {
        let spec = self
            .specs
            .get(&tool)
            .ok_or(ExecutionError::UnsupportedTool(tool))?;

        Ok(BuiltCommand {
            program: spec.executable.clone(),
            args: spec.args(self.os, target.trim(), params),
        })
    }

    #[cfg(test)]
    pub(crate) fn without(mut self, tool: Tool) -> Self {
        self.specs.remove(&tool);
        self
    }
}

impl Default for ToolTable {
    fn default() -> Self {
        Self::for_host()
    }
}
