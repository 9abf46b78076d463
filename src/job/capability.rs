//! Capability seam between the execution engine and job implementations
//!
//! A capability is one supported `job_type`: it validates an incoming
//! spec and executes it inside a per-job workspace. Capabilities run
//! synchronously on a blocking thread and share no mutable state
//! between invocations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::job::JobSpec;

/// Errors surfaced by capability validation and execution.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// No capability is registered for the requested job type.
    #[error("unknown job type '{job_type}'")]
    UnknownType {
        /// The unrecognized type key.
        job_type: String,
    },

    /// A required parameter is absent.
    #[error("missing required parameter '{name}'")]
    MissingParameter {
        /// Parameter name.
        name: String,
    },

    /// A parameter is present but unusable.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// An external tool exited non-zero.
    #[error("{tool} failed with exit code {code}: {stderr}")]
    ToolFailed {
        /// Tool binary name.
        tool: String,
        /// Exit code, -1 when terminated by signal.
        code: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// Filesystem or process spawn failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Output serialization failure.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Runs an external tool to completion with captured output.
///
/// Non-zero exit becomes `ToolFailed` carrying the tool's stderr.
pub(crate) fn run_checked(
    command: &mut std::process::Command,
    tool: &str,
) -> Result<std::process::Output, CapabilityError> {
    tracing::debug!(tool, "running external tool");
    let output = command.output()?;

    if !output.status.success() {
        return Err(CapabilityError::ToolFailed {
            tool: tool.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// A job implementation for one `job_type`.
///
/// `validate` runs before a slot is allocated; a validation failure
/// produces an immediate failed result without consuming capacity.
/// `execute` runs on a blocking thread inside an allocated slot.
pub trait JobCapability: Send + Sync {
    /// The `job_type` key this capability serves.
    fn name(&self) -> &str;

    /// Checks the spec's parameters without side effects.
    ///
    /// # Errors
    ///
    /// Returns a `CapabilityError` describing the first rejected parameter.
    fn validate(&self, spec: &JobSpec) -> Result<(), CapabilityError>;

    /// Runs the job and returns its result payload.
    ///
    /// # Errors
    ///
    /// Returns a `CapabilityError` when a tool or the filesystem fails.
    fn execute(&self, ctx: &JobContext) -> Result<Value, CapabilityError>;
}

/// Progress callback wired to the ledger by the slot pool.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Everything a capability sees while executing one job.
pub struct JobContext {
    spec: JobSpec,
    workspace: JobWorkspace,
    progress: Option<ProgressFn>,
}

impl JobContext {
    /// Creates a context for one execution.
    #[must_use]
    pub fn new(spec: JobSpec, workspace: JobWorkspace) -> Self {
        Self {
            spec,
            workspace,
            progress: None,
        }
    }

    /// Attaches a progress callback.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The spec being executed.
    #[must_use]
    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// The job's scratch workspace.
    #[must_use]
    pub fn workspace(&self) -> &JobWorkspace {
        &self.workspace
    }

    /// Directory for staged inputs.
    #[must_use]
    pub fn input_dir(&self) -> &Path {
        self.workspace.input_dir()
    }

    /// Directory for produced outputs.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        self.workspace.output_dir()
    }

    /// Reports completion percentage to the ledger. Values above 100
    /// are clamped there.
    pub fn report_progress(&self, percent: u8) {
        if let Some(progress) = &self.progress {
            progress(percent);
        }
    }

    /// Fetches a string parameter.
    #[must_use]
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.spec.parameters.get(name).and_then(Value::as_str)
    }

    /// Fetches a required string parameter.
    ///
    /// # Errors
    ///
    /// Returns `MissingParameter` when absent or not a string.
    pub fn required_str(&self, name: &str) -> Result<&str, CapabilityError> {
        self.param_str(name)
            .ok_or_else(|| CapabilityError::MissingParameter {
                name: name.to_string(),
            })
    }

    /// Fetches an integer parameter, falling back to `default`.
    #[must_use]
    pub fn param_u64(&self, name: &str, default: u64) -> u64 {
        self.spec
            .parameters
            .get(name)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }

    /// Fetches a boolean parameter, falling back to `default`.
    #[must_use]
    pub fn param_bool(&self, name: &str, default: bool) -> bool {
        self.spec
            .parameters
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Fetches a nested object parameter ("advanced_options" and friends).
    #[must_use]
    pub fn param_object(&self, name: &str) -> Option<&serde_json::Map<String, Value>> {
        self.spec.parameters.get(name).and_then(Value::as_object)
    }
}

/// Per-job scratch directory tree: `<work_dir>/<job_id>/{input,output}`.
///
/// Created when a slot picks the job up and removed after execution when
/// cleanup is enabled, regardless of outcome.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    root: PathBuf,
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl JobWorkspace {
    /// Creates the workspace tree for a job.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` when the directories cannot be created.
    pub fn create(work_dir: &Path, job_id: &str) -> std::io::Result<Self> {
        let root = work_dir.join(job_id);
        let input_dir = root.join("input");
        let output_dir = root.join("output");

        fs::create_dir_all(&input_dir)?;
        fs::create_dir_all(&output_dir)?;

        Ok(Self {
            root,
            input_dir,
            output_dir,
        })
    }

    /// Workspace root, `<work_dir>/<job_id>`.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staged inputs directory.
    #[must_use]
    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    /// Produced outputs directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Removes the whole workspace tree.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` when deletion fails; callers treat this
    /// as best-effort and log it.
    pub fn remove(&self) -> std::io::Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

/// Lookup table from `job_type` to its capability.
///
/// Open for extension: embedders can register additional capabilities
/// next to the built-ins. An unregistered type is an admission-time
/// failure, not a panic.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: AHashMap<String, Arc<dyn JobCapability>>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in capabilities registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::job::OcrCapability::new()));
        registry.register(Arc::new(crate::job::PdfParseCapability::new()));
        registry
    }

    /// Registers a capability under its own name, replacing any previous
    /// entry for that type.
    pub fn register(&mut self, capability: Arc<dyn JobCapability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    /// Looks up the capability for a job type.
    #[must_use]
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobCapability>> {
        self.capabilities.get(job_type).cloned()
    }

    /// Supported type keys, sorted for stable wire payloads.
    #[must_use]
    pub fn supported(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.supported())
            .finish()
    }
}
