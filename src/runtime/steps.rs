//! The fixed profiling sequence, as data.
//!
//! Each step is a list of invocations. An invocation names its program, an
//! argument template, where its output goes and which artifacts of this run it
//! needs. The runner consumes the table with one generic routine.

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Config, ProfError, ProfResult, SessionConfig};

pub const PERF_DATA: &str = "perf.data";
pub const PERF_SCRIPT: &str = "perf.script";
pub const FOLDED: &str = "out.folded";
pub const MASSIF_OUT: &str = "massif.out";
pub const NSYS_REPORT: &str = "nsys_report";
pub const NSYS_REP: &str = "nsys_report.nsys-rep";

const GPU_QUERY: &str = concat!(
    "--query-gpu=index,name,driver_version,utilization.gpu,utilization.memory,",
    "memory.used,memory.total,temperature.gpu,power.draw"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Time,
    StaticInspection,
    GpuSnapshot,
    CpuSampling,
    FlameGraph,
    HeapProfile,
    GpuDisassembly,
    SystemTrace,
    SystemSnapshot,
}

impl StepId {
    pub fn name(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::StaticInspection => "static_inspection",
            Self::GpuSnapshot => "gpu_snapshot",
            Self::CpuSampling => "cpu_sampling",
            Self::FlameGraph => "flame_graph",
            Self::HeapProfile => "heap_profile",
            Self::GpuDisassembly => "gpu_disassembly",
            Self::SystemTrace => "system_trace",
            Self::SystemSnapshot => "system_snapshot",
        }
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Executable looked up on the search path (`perf` goes through perf resolution).
    Tool(&'static str),
    /// Script inside the FlameGraph checkout; run through `perl` when available.
    FlameGraphScript(&'static str),
    /// Copy a host file verbatim into the stdout capture.
    ReadFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Lit(String),
    Binary,
    /// The binary followed by its split arguments.
    Target,
    /// Path of a file inside the output directory.
    Artifact(&'static str),
    /// `<flag><path of artifact>`, e.g. `--massif-out-file=/out/massif.out`.
    ArtifactFlag(&'static str, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Artifact(&'static str),
    /// stderr only: into the stdout artifact.
    Merged,
    Discard,
}

/// Bound enforced by the `timeout` wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBox {
    /// Wrap only the `Target` argument: the tool survives and reports.
    Target(Duration),
    /// Wrap the whole command.
    Command(Duration),
}

#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub program: Program,
    pub args: Vec<Arg>,
    pub stdout: Capture,
    pub stderr: Capture,
    pub head_lines: Option<usize>,
    pub time_box: Option<TimeBox>,
    /// Hard limit after which the runner kills the process.
    pub deadline: Duration,
    /// Artifacts that must have been produced earlier in this run.
    pub requires: Vec<&'static str>,
    /// Files the tool writes itself; globs allowed.
    pub produces: Vec<String>,
}

impl InvocationSpec {
    fn new(program: Program, deadline: Duration) -> Self {
        Self {
            program,
            args: Vec::new(),
            stdout: Capture::Discard,
            stderr: Capture::Discard,
            head_lines: None,
            time_box: None,
            deadline,
            requires: Vec::new(),
            produces: Vec::new(),
        }
    }

    fn tool(name: &'static str, deadline: Duration) -> Self {
        Self::new(Program::Tool(name), deadline)
    }

    fn args(mut self, args: impl IntoIterator<Item = Arg>) -> Self {
        self.args.extend(args);
        self
    }

    fn stdout_to(mut self, name: &'static str) -> Self {
        self.stdout = Capture::Artifact(name);
        self
    }

    fn stderr_to(mut self, capture: Capture) -> Self {
        self.stderr = capture;
        self
    }

    fn head(mut self, lines: usize) -> Self {
        self.head_lines = Some(lines);
        self
    }

    fn time_box(mut self, time_box: TimeBox) -> Self {
        self.time_box = Some(time_box);
        self
    }

    fn requires(mut self, name: &'static str) -> Self {
        self.requires.push(name);
        self
    }

    fn produces(mut self, pattern: impl Into<String>) -> Self {
        self.produces.push(pattern.into());
        self
    }

    pub fn tool_name(&self) -> String {
        match &self.program {
            Program::Tool(name) | Program::FlameGraphScript(name) => (*name).to_string(),
            Program::ReadFile(path) => path.display().to_string(),
        }
    }

    /// Fixed output names this invocation writes.
    pub fn outputs(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if let Capture::Artifact(name) = self.stdout {
            out.push(name);
        }
        if let Capture::Artifact(name) = self.stderr {
            out.push(name);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct StepSpec {
    pub id: StepId,
    pub invocations: Vec<InvocationSpec>,
}

fn lit(s: impl Into<String>) -> Arg {
    Arg::Lit(s.into())
}

/// Builds the nine-step table for a session.
pub fn step_table(session: &SessionConfig, config: &Config) -> Vec<StepSpec> {
    let limits = &config.limits;
    let grace = Duration::from_secs(limits.kill_grace_secs);
    let duration = Duration::from_secs(session.duration_secs);
    let session_deadline = duration.saturating_add(grace);
    let inspect = Duration::from_secs(limits.inspect_timeout_secs);
    let massif = Duration::from_secs(limits.massif_timeout_secs);
    let secs = session.duration_secs.to_string();

    vec![
        StepSpec {
            id: StepId::Time,
            invocations: vec![
                InvocationSpec::tool("time", session_deadline)
                    .args([lit("-v"), Arg::Target])
                    .stdout_to("time.txt")
                    .stderr_to(Capture::Merged)
                    .time_box(TimeBox::Target(duration)),
            ],
        },
        StepSpec {
            id: StepId::StaticInspection,
            invocations: vec![
                InvocationSpec::tool("ldd", inspect)
                    .args([Arg::Binary])
                    .stdout_to("ldd.txt")
                    .stderr_to(Capture::Merged),
                InvocationSpec::tool("file", inspect)
                    .args([Arg::Binary])
                    .stdout_to("file.txt")
                    .stderr_to(Capture::Merged),
                InvocationSpec::tool("strings", inspect)
                    .args([Arg::Binary])
                    .stdout_to("strings_head.txt")
                    .head(limits.strings_head_lines),
            ],
        },
        StepSpec {
            id: StepId::GpuSnapshot,
            invocations: vec![
                InvocationSpec::tool("nvidia-smi", inspect)
                    .stdout_to("nvidia-smi.txt")
                    .stderr_to(Capture::Merged),
                InvocationSpec::tool("nvidia-smi", inspect)
                    .args([lit(GPU_QUERY), lit("--format=csv")])
                    .stdout_to("gpu_summary.csv"),
            ],
        },
        StepSpec {
            id: StepId::CpuSampling,
            invocations: vec![
                InvocationSpec::tool("perf", session_deadline.saturating_add(grace))
                    .args([
                        lit("record"),
                        lit("-F"),
                        lit(config.perf.frequency.to_string()),
                        lit("-g"),
                        lit("-o"),
                        Arg::Artifact(PERF_DATA),
                        lit("--"),
                        Arg::Target,
                    ])
                    .time_box(TimeBox::Target(duration))
                    .produces(PERF_DATA),
                InvocationSpec::tool("perf", inspect.saturating_add(session_deadline))
                    .args([lit("report"), lit("--stdio"), lit("-i"), Arg::Artifact(PERF_DATA)])
                    .stdout_to("perf-report.txt")
                    .requires(PERF_DATA),
                InvocationSpec::tool("perf", inspect.saturating_add(session_deadline))
                    .args([lit("script"), lit("-i"), Arg::Artifact(PERF_DATA)])
                    .stdout_to(PERF_SCRIPT)
                    .requires(PERF_DATA),
            ],
        },
        StepSpec {
            id: StepId::FlameGraph,
            invocations: vec![
                InvocationSpec::new(Program::FlameGraphScript("stackcollapse-perf.pl"), inspect)
                    .args([Arg::Artifact(PERF_SCRIPT)])
                    .stdout_to(FOLDED)
                    .requires(PERF_SCRIPT),
                InvocationSpec::new(Program::FlameGraphScript("flamegraph.pl"), inspect)
                    .args([Arg::Artifact(FOLDED)])
                    .stdout_to("flamegraph.svg")
                    .requires(FOLDED),
            ],
        },
        StepSpec {
            id: StepId::HeapProfile,
            invocations: vec![
                InvocationSpec::tool("valgrind", massif.saturating_add(grace))
                    .args([
                        lit("--tool=massif"),
                        Arg::ArtifactFlag("--massif-out-file=", MASSIF_OUT),
                        Arg::Target,
                    ])
                    .time_box(TimeBox::Command(massif))
                    .produces(MASSIF_OUT),
                InvocationSpec::tool("ms_print", inspect)
                    .args([Arg::Artifact(MASSIF_OUT)])
                    .stdout_to("massif.txt")
                    .requires(MASSIF_OUT),
            ],
        },
        StepSpec {
            id: StepId::GpuDisassembly,
            invocations: vec![
                InvocationSpec::tool("cuobjdump", inspect)
                    .args([lit("-ptx"), Arg::Binary])
                    .stdout_to("ptx.txt")
                    .stderr_to(Capture::Merged),
                InvocationSpec::tool("cuobjdump", inspect)
                    .args([lit("-sass"), Arg::Binary])
                    .stdout_to("sass.txt")
                    .stderr_to(Capture::Merged),
            ],
        },
        StepSpec {
            id: StepId::SystemTrace,
            invocations: vec![
                InvocationSpec::tool("nsys", session_deadline.saturating_add(grace))
                    .args([
                        lit("profile"),
                        lit("--trace=cuda,nvtx,osrt"),
                        lit(format!("--duration={secs}")),
                        lit("--force-overwrite=true"),
                        lit("-o"),
                        Arg::Artifact(NSYS_REPORT),
                        Arg::Target,
                    ])
                    .produces(format!("{NSYS_REPORT}.*")),
                InvocationSpec::tool("nsys", inspect)
                    .args([lit("stats"), Arg::Artifact(NSYS_REP)])
                    .stdout_to("nsys_stats.txt")
                    .requires(NSYS_REP),
            ],
        },
        StepSpec {
            id: StepId::SystemSnapshot,
            invocations: vec![
                InvocationSpec::tool("uname", inspect)
                    .args([lit("-a")])
                    .stdout_to("uname.txt"),
                InvocationSpec::new(
                    Program::ReadFile(config.tools.os_release_path.clone()),
                    inspect,
                )
                .stdout_to("os-release.txt"),
                InvocationSpec::tool("ps", inspect)
                    .args([lit("aux"), lit("--sort=-%mem")])
                    .stdout_to("top_mem.txt")
                    .head(limits.top_lines.saturating_add(1)),
                InvocationSpec::tool("ps", inspect)
                    .args([lit("aux"), lit("--sort=-%cpu")])
                    .stdout_to("top_cpu.txt")
                    .head(limits.top_lines.saturating_add(1)),
            ],
        },
    ]
}

/// Checks that every fixed output has exactly one writer and that every
/// requirement is produced by an earlier invocation.
pub fn validate_table(steps: &[StepSpec]) -> ProfResult<()> {
    let mut written = BTreeSet::new();
    let mut patterns: Vec<GlobMatcher> = Vec::new();
    for step in steps {
        for inv in &step.invocations {
            for name in &inv.requires {
                let produced_earlier =
                    written.contains(*name) || patterns.iter().any(|m| m.is_match(name));
                if !produced_earlier {
                    return Err(ProfError::Config(format!(
                        "step {} requires {name} before any earlier invocation produces it",
                        step.id
                    )));
                }
            }
            for pattern in inv.produces.iter().filter(|p| p.contains('*')) {
                let glob = Glob::new(pattern)
                    .map_err(|e| {
                        ProfError::Config(format!("invalid output pattern {pattern:?}: {e}"))
                    })?;
                patterns.push(glob.compile_matcher());
            }
            let fixed_produces = inv
                .produces
                .iter()
                .filter(|p| !p.contains('*'))
                .map(String::as_str);
            for name in inv.outputs().into_iter().chain(fixed_produces) {
                if !written.insert(name.to_string()) {
                    return Err(ProfError::Config(format!(
                        "output {name} is written by more than one invocation (step {})",
                        step.id
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<StepSpec> {
        let session = SessionConfig::new(
            PathBuf::from("./ARM1"),
            "--threads 4".to_string(),
            10,
            PathBuf::from("out1"),
        )
        .expect("session");
        step_table(&session, &Config::default())
    }

    #[test]
    fn table_has_nine_steps_in_fixed_order() {
        let ids: Vec<StepId> = table().iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            [
                StepId::Time,
                StepId::StaticInspection,
                StepId::GpuSnapshot,
                StepId::CpuSampling,
                StepId::FlameGraph,
                StepId::HeapProfile,
                StepId::GpuDisassembly,
                StepId::SystemTrace,
                StepId::SystemSnapshot,
            ]
        );
    }

    #[test]
    fn default_table_is_valid() {
        validate_table(&table()).expect("valid table");
    }

    #[test]
    fn table_covers_every_documented_output() {
        let outputs: BTreeSet<&str> = table()
            .iter()
            .flat_map(|s| s.invocations.iter().flat_map(|i| i.outputs()))
            .collect();
        for name in [
            "time.txt",
            "ldd.txt",
            "file.txt",
            "strings_head.txt",
            "nvidia-smi.txt",
            "gpu_summary.csv",
            "perf-report.txt",
            "perf.script",
            "out.folded",
            "flamegraph.svg",
            "massif.txt",
            "ptx.txt",
            "sass.txt",
            "nsys_stats.txt",
            "uname.txt",
            "os-release.txt",
            "top_mem.txt",
            "top_cpu.txt",
        ] {
            assert!(outputs.contains(name), "missing {name}");
        }
    }

    #[test]
    fn flame_graph_depends_on_cpu_sampling_output() {
        let steps = table();
        let flame = steps
            .iter()
            .find(|s| s.id == StepId::FlameGraph)
            .expect("flame step");
        assert_eq!(flame.invocations[0].requires, vec![PERF_SCRIPT]);
        let producer = steps
            .iter()
            .position(|s| s.invocations.iter().any(|i| i.outputs().contains(&PERF_SCRIPT)))
            .expect("producer");
        let consumer = steps.iter().position(|s| s.id == StepId::FlameGraph).expect("consumer");
        assert!(producer < consumer);
    }

    #[test]
    fn duplicate_output_is_rejected() {
        let mut steps = table();
        let dup = steps[0].invocations[0].clone();
        steps[8].invocations.push(dup);
        let err = validate_table(&steps).expect_err("must fail");
        assert!(err.to_string().contains("time.txt"), "{err}");
    }

    #[test]
    fn forward_dependency_is_rejected() {
        let mut steps = table();
        steps.swap(3, 4);
        let err = validate_table(&steps).expect_err("must fail");
        assert!(err.to_string().contains(PERF_SCRIPT), "{err}");
    }

    #[test]
    fn glob_output_satisfies_requirement() {
        let steps = table();
        let trace = steps
            .iter()
            .find(|s| s.id == StepId::SystemTrace)
            .expect("trace step");
        assert_eq!(trace.invocations[0].produces, vec!["nsys_report.*".to_string()]);
        assert_eq!(trace.invocations[1].requires, vec![NSYS_REP]);
    }

    #[test]
    fn extreme_limits_saturate_instead_of_overflowing() {
        let mut cfg = Config::default();
        cfg.limits.kill_grace_secs = u64::MAX;
        cfg.limits.massif_timeout_secs = u64::MAX;
        cfg.limits.top_lines = usize::MAX;
        let session = SessionConfig::new(
            PathBuf::from("./ARM1"),
            String::new(),
            u64::MAX,
            PathBuf::from("o"),
        )
        .expect("session");
        let steps = step_table(&session, &cfg);
        validate_table(&steps).expect("valid table");
        let sampling = steps
            .iter()
            .find(|s| s.id == StepId::CpuSampling)
            .expect("sampling step");
        assert_eq!(sampling.invocations[0].deadline, Duration::MAX);
        let snapshot = steps
            .iter()
            .find(|s| s.id == StepId::SystemSnapshot)
            .expect("snapshot step");
        assert_eq!(snapshot.invocations[3].head_lines, Some(usize::MAX));
    }

    #[test]
    fn heap_profile_is_time_boxed_independently() {
        let mut cfg = Config::default();
        cfg.limits.massif_timeout_secs = 7;
        let session =
            SessionConfig::new(PathBuf::from("./ARM1"), String::new(), 300, PathBuf::from("o"))
                .expect("session");
        let steps = step_table(&session, &cfg);
        let heap = steps
            .iter()
            .find(|s| s.id == StepId::HeapProfile)
            .expect("heap step");
        assert_eq!(
            heap.invocations[0].time_box,
            Some(TimeBox::Command(Duration::from_secs(7)))
        );
    }
}
