//! Consumed subset of the `scontrol --json` output
//!
//! The output is incredibly inconsistent across deployments: the same fields
//! are sometimes plain integers, sometimes floats, and sometimes structured
//! `{set, infinite, number}` objects; `job_state` is a single string on some
//! clusters and a string array on others. Parsing is strict only where the
//! contract requires (the `errors` list aborts decoding) and lenient
//! everywhere else.

use serde::Deserialize;
use tracing::warn;

use supernetes_common::{Error, Result};

/// Numeric value type in the `scontrol` JSON output
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(from = "NumberRepr")]
pub struct Number {
    /// Whether the value is set
    pub set: bool,
    /// Whether the value represents infinity
    pub infinite: bool,
    /// The numeric value
    pub number: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberRepr {
    Plain(f64),
    Object {
        #[serde(default)]
        set: bool,
        #[serde(default)]
        infinite: bool,
        #[serde(default)]
        number: f64,
    },
}

impl From<NumberRepr> for Number {
    fn from(repr: NumberRepr) -> Self {
        match repr {
            NumberRepr::Plain(number) => Number {
                set: number > 0.0, // Assume set if positive
                infinite: number.is_infinite() && number.is_sign_positive(),
                number,
            },
            NumberRepr::Object {
                set,
                infinite,
                number,
            } => Number {
                set,
                infinite,
                number,
            },
        }
    }
}

impl Number {
    /// Convert to a regular float, NaN when unset
    pub fn as_f64(&self) -> f64 {
        if !self.set {
            return f64::NAN;
        }

        if self.infinite {
            return if self.number < 0.0 {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            };
        }

        self.number
    }

    /// Convert to an integer, zero when unset or infinite
    pub fn as_i64(&self) -> i64 {
        if !self.set || self.infinite {
            return 0;
        }

        self.number as i64
    }
}

/// Job state code, a single string or the first entry of a string array
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "JobStateRepr")]
pub struct JobState(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum JobStateRepr {
    One(String),
    Many(Vec<String>),
}

impl From<JobStateRepr> for JobState {
    fn from(repr: JobStateRepr) -> Self {
        match repr {
            JobStateRepr::One(state) => JobState(state),
            JobStateRepr::Many(states) => JobState(states.into_iter().next().unwrap_or_default()),
        }
    }
}

impl JobState {
    /// The state code as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `scontrol show node` output
#[derive(Debug, Default, Deserialize)]
pub struct NodeData {
    /// Node entries
    #[serde(default)]
    pub nodes: Vec<SlurmNode>,
    /// Free-form warnings from the scheduler
    #[serde(default)]
    pub warnings: Vec<serde_json::Value>,
    /// Free-form errors from the scheduler
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

/// Consumed fields of a Slurm node entry
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SlurmNode {
    /// Node name
    #[serde(default)]
    pub name: String,
    /// CPU count
    #[serde(default)]
    pub cpus: u32,
    /// Total memory in MiB
    #[serde(default)]
    pub real_memory: u64,
    /// Free memory in MiB
    #[serde(default)]
    pub free_mem: Number,
    /// Allocated memory in MiB
    #[serde(default)]
    pub alloc_memory: u64,
    /// Fixed-point CPU load (percent times 100 on some deployments)
    #[serde(default)]
    pub cpu_load: Number,
    /// Partitions the node belongs to
    #[serde(default)]
    pub partitions: Vec<String>,
}

/// `scontrol show job` output
#[derive(Debug, Default, Deserialize)]
pub struct JobData {
    /// Job entries
    #[serde(default)]
    pub jobs: Vec<Job>,
    /// Free-form warnings from the scheduler
    #[serde(default)]
    pub warnings: Vec<serde_json::Value>,
    /// Free-form errors from the scheduler
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

/// Consumed fields of a Slurm job entry
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Job {
    /// Numeric job identifier
    #[serde(default)]
    pub job_id: u64,
    /// Job name
    #[serde(default)]
    pub name: String,
    /// Partition the job was submitted into
    #[serde(default)]
    pub partition: String,
    /// Current job state code
    #[serde(default)]
    pub job_state: JobState,
    /// UNIX timestamp of the job start
    #[serde(default)]
    pub start_time: Number,
    /// Resource allocation details
    #[serde(default)]
    pub job_resources: JobResources,
}

/// Consumed fields of a job's resource allocation
#[derive(Debug, Default, Clone, Deserialize)]
pub struct JobResources {
    /// Per-node allocation entries
    #[serde(default)]
    pub allocated_nodes: Vec<AllocatedNode>,
}

/// Consumed fields of a per-node allocation entry
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AllocatedNode {
    /// Name of the allocated node
    #[serde(default)]
    pub nodename: String,
}

/// Response types that expose scheduler warnings and errors
pub(crate) trait SchedulerOutput {
    fn warnings(&self) -> &[serde_json::Value];
    fn errors(&self) -> &[serde_json::Value];
}

impl SchedulerOutput for NodeData {
    fn warnings(&self) -> &[serde_json::Value] {
        &self.warnings
    }

    fn errors(&self) -> &[serde_json::Value] {
        &self.errors
    }
}

impl SchedulerOutput for JobData {
    fn warnings(&self) -> &[serde_json::Value] {
        &self.warnings
    }

    fn errors(&self) -> &[serde_json::Value] {
        &self.errors
    }
}

/// Decode an `scontrol --json` response, surfacing embedded errors and
/// logging embedded warnings.
pub(crate) fn decode<T>(input: &[u8]) -> Result<T>
where
    T: serde::de::DeserializeOwned + SchedulerOutput,
{
    let data: T = serde_json::from_slice(input)
        .map_err(|e| Error::serialization(format!("unable to decode scontrol output: {e}")))?;

    if !data.errors().is_empty() {
        return Err(Error::scheduler(
            "scontrol",
            format!("errors in response: {:?}", data.errors()),
        ));
    }

    if !data.warnings().is_empty() {
        warn!(warnings = ?data.warnings(), "warnings in scontrol response");
    }

    Ok(data)
}
