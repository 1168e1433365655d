//! The coordinated timeout hierarchy.
//!
//! Four nested layers govern every tool call: tool → daemon → shim → client.
//! The outer layers are derived from the workflow-tool timeout with fixed
//! multipliers so that each layer always has headroom over the one it wraps:
//!
//! ```text
//! daemon = workflow × 1.5    shim = workflow × 2.0    client = workflow × 2.5
//! ```
//!
//! Components request timeouts by name from a loaded [`TimeoutSet`]; nothing
//! outside this module reads the timeout environment variables directly.

use std::time::Duration;

use crate::error::{Error, Result};

const DAEMON_FACTOR: f64 = 1.5;
const SHIM_FACTOR: f64 = 2.0;
const CLIENT_FACTOR: f64 = 2.5;

/// The six base timeouts, loaded once at process start and immutable after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSet {
    /// Single-shot tools.
    pub simple_tool: Duration,
    /// Multi-step workflow tools; the root of the derived hierarchy.
    pub workflow_tool: Duration,
    /// Expert-validation calls; must sit strictly inside the workflow budget.
    pub expert: Duration,
    /// GLM provider calls.
    pub glm: Duration,
    /// Kimi provider calls.
    pub kimi: Duration,
    /// Kimi calls with web search enabled (slowest provider path).
    pub kimi_web_search: Duration,
}

impl Default for TimeoutSet {
    fn default() -> Self {
        Self {
            simple_tool: Duration::from_secs(60),
            workflow_tool: Duration::from_secs(120),
            expert: Duration::from_secs(90),
            glm: Duration::from_secs(90),
            kimi: Duration::from_secs(120),
            kimi_web_search: Duration::from_secs(150),
        }
    }
}

impl TimeoutSet {
    /// Load from the process environment and validate the hierarchy.
    pub fn load_env() -> Result<Self> {
        Self::load_from(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source (tests inject a closure
    /// instead of mutating the process environment).
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let set = Self {
            simple_tool: read_secs(&lookup, "SIMPLE_TOOL_TIMEOUT_SECS", defaults.simple_tool)?,
            workflow_tool: read_secs(
                &lookup,
                "WORKFLOW_TOOL_TIMEOUT_SECS",
                defaults.workflow_tool,
            )?,
            expert: read_secs(&lookup, "EXPERT_ANALYSIS_TIMEOUT_SECS", defaults.expert)?,
            glm: read_secs(&lookup, "GLM_TIMEOUT_SECS", defaults.glm)?,
            kimi: read_secs(&lookup, "KIMI_TIMEOUT_SECS", defaults.kimi)?,
            kimi_web_search: read_secs(
                &lookup,
                "KIMI_WEB_SEARCH_TIMEOUT_SECS",
                defaults.kimi_web_search,
            )?,
        };
        set.validate()?;
        Ok(set)
    }

    /// Daemon-side outer bound on a tool call: workflow × 1.5.
    pub fn daemon(&self) -> Duration {
        self.workflow_tool.mul_f64(DAEMON_FACTOR)
    }

    /// Shim-side bound, protecting against an unresponsive daemon: workflow × 2.0.
    pub fn shim(&self) -> Duration {
        self.workflow_tool.mul_f64(SHIM_FACTOR)
    }

    /// Client-facing final bound: workflow × 2.5.
    pub fn client(&self) -> Duration {
        self.workflow_tool.mul_f64(CLIENT_FACTOR)
    }

    /// Enforce `expert < workflow < daemon < shim < client`.
    ///
    /// The derived bounds are monotone in the factors, so it is enough to
    /// check the two hand-configured edges.
    pub fn validate(&self) -> Result<()> {
        if self.expert >= self.workflow_tool {
            return Err(Error::Config(format!(
                "EXPERT_ANALYSIS_TIMEOUT_SECS ({}s) must be strictly less than \
                 WORKFLOW_TOOL_TIMEOUT_SECS ({}s)",
                self.expert.as_secs(),
                self.workflow_tool.as_secs()
            )));
        }
        if self.workflow_tool >= self.daemon() {
            return Err(Error::Config(format!(
                "derived daemon timeout ({:?}) does not exceed the workflow timeout ({:?})",
                self.daemon(),
                self.workflow_tool
            )));
        }
        Ok(())
    }
}

fn read_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{name}: expected a positive integer, got {raw:?}"))
            })?;
            if secs == 0 {
                return Err(Error::Config(format!("{name}: must be positive")));
            }
            Ok(Duration::from_secs(secs))
        }
    }
}
