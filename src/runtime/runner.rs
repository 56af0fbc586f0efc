//! Generic step execution and the session lifecycle.
//!
//! `Configured -> ToolResolution -> Steps -> Archived -> Done`. Every phase is
//! always reached: tool failures are recorded in the report and never abort
//! the run.

use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::{
    Arg, ArchiveOutcome, Capture, Config, InvocationRecord, InvocationSpec, InvocationStatus,
    PLAN_SCHEMA, PerfResolution, PerfResolver, PlannedInvocation, PlannedStep, ProcessSpec,
    Program, ProfResult, REPORT_FILE, REPORT_SCHEMA, RunReport, SessionConfig, SessionPlan, Sink,
    StepId, StepOutcome, StepRecord, StepSpec, TimeBox, ToolLocator, archive_outdir,
    archive_path, dir_artifacts, is_executable, kernel_release, match_artifacts, now_rfc3339,
    run, step_table, validate_table,
};

/// Exit status of GNU `timeout` when the bound elapsed.
const TIMEOUT_EXPIRED: i32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Configured,
    ToolResolution,
    Steps,
    Archived,
    Done,
}

#[derive(Debug)]
pub enum RunEvent<'a> {
    Phase(RunPhase),
    PerfResolved(&'a PerfResolution),
    StepStarted(StepId),
    InvocationSkipped { step: StepId, reason: &'a str },
    InvocationStarted { step: StepId, command: &'a str },
    StepFinished(&'a StepRecord),
    Archived(&'a ArchiveOutcome),
}

/// A resolved program plus any leading arguments (the script path when run through `perl`).
#[derive(Debug)]
enum Resolved {
    Exec { program: PathBuf, prefix: Vec<OsString> },
    ReadFile(PathBuf),
}

#[derive(Debug)]
pub struct SessionRunner<'a> {
    session: &'a SessionConfig,
    config: &'a Config,
    locator: &'a ToolLocator,
}

impl<'a> SessionRunner<'a> {
    pub fn new(session: &'a SessionConfig, config: &'a Config, locator: &'a ToolLocator) -> Self {
        Self {
            session,
            config,
            locator,
        }
    }

    fn outdir(&self) -> &Path {
        &self.session.outdir
    }

    /// Runs the whole session. Only failing to create the output directory is an error.
    pub fn run(&self, on_event: &mut dyn FnMut(&RunEvent<'_>)) -> ProfResult<RunReport> {
        let started_at = now_rfc3339();
        let session_id = uuid::Uuid::new_v4().to_string();
        on_event(&RunEvent::Phase(RunPhase::Configured));
        std::fs::create_dir_all(self.outdir())?;
        if !self.session.binary.exists() {
            tracing::warn!(
                "target binary {} does not exist; tools that run it will fail",
                self.session.binary.display()
            );
        }

        on_event(&RunEvent::Phase(RunPhase::ToolResolution));
        let kernel = kernel_release();
        let perf = PerfResolver::new(&self.config.perf, self.locator, kernel.as_str()).resolve();
        tracing::info!("perf resolution: {}", perf.label());
        on_event(&RunEvent::PerfResolved(&perf));

        let steps = step_table(self.session, self.config);
        validate_table(&steps)?;

        on_event(&RunEvent::Phase(RunPhase::Steps));
        let mut produced = BTreeSet::new();
        let mut records = Vec::with_capacity(steps.len());
        for step in &steps {
            let record = self.run_step(step, &perf, &mut produced, on_event);
            on_event(&RunEvent::StepFinished(&record));
            records.push(record);
        }

        let artifacts = dir_artifacts(self.outdir()).unwrap_or_else(|err| {
            tracing::warn!("could not enumerate {}: {err}", self.outdir().display());
            Vec::new()
        });
        let mut report = RunReport {
            schema_version: REPORT_SCHEMA.to_string(),
            session_id,
            started_at,
            finished_at: now_rfc3339(),
            session: self.session.clone(),
            kernel_release: kernel,
            perf,
            steps: records,
            artifacts,
            archive: None,
        };
        if let Err(err) = report.write_json(&self.outdir().join(REPORT_FILE)) {
            tracing::warn!("could not write {REPORT_FILE}: {err}");
        }

        let archive = archive_outdir(
            self.outdir(),
            self.config.archive,
            self.locator,
            Duration::from_secs(self.config.limits.inspect_timeout_secs),
        );
        on_event(&RunEvent::Archived(&archive));
        on_event(&RunEvent::Phase(RunPhase::Archived));
        report.archive = Some(archive);
        report.finished_at = now_rfc3339();
        on_event(&RunEvent::Phase(RunPhase::Done));
        Ok(report)
    }

    /// Resolves tools and renders every command without running anything.
    pub fn plan(&self) -> ProfResult<SessionPlan> {
        let kernel = kernel_release();
        let perf = PerfResolver::new(&self.config.perf, self.locator, kernel.as_str())
            .without_side_effects()
            .resolve();
        let steps = step_table(self.session, self.config);
        validate_table(&steps)?;

        let planned = steps
            .iter()
            .map(|step| PlannedStep {
                step: step.id,
                invocations: step
                    .invocations
                    .iter()
                    .map(|inv| {
                        let outputs = inv
                            .outputs()
                            .into_iter()
                            .map(str::to_string)
                            .chain(inv.produces.iter().cloned())
                            .collect();
                        match self.resolve_program(&inv.program, &perf) {
                            Ok(resolved) => PlannedInvocation {
                                tool: inv.tool_name(),
                                command: Some(match &resolved {
                                    Resolved::ReadFile(path) => format!("read {}", path.display()),
                                    Resolved::Exec { .. } => {
                                        self.render(inv, &resolved).0.display()
                                    }
                                }),
                                outputs,
                                skip_reason: None,
                            },
                            Err(reason) => PlannedInvocation {
                                tool: inv.tool_name(),
                                command: None,
                                outputs,
                                skip_reason: Some(reason),
                            },
                        }
                    })
                    .collect(),
            })
            .collect();

        let archive = if self.outdir().is_dir() {
            archive_path(self.outdir(), self.config.archive)
                .ok()
                .flatten()
                .map(|p| p.to_string_lossy().to_string())
        } else {
            self.config
                .archive
                .extension()
                .map(|ext| format!("{}.{ext}", self.outdir().display()))
        };

        Ok(SessionPlan {
            schema_version: PLAN_SCHEMA.to_string(),
            session: self.session.clone(),
            kernel_release: kernel,
            perf,
            steps: planned,
            archive,
        })
    }

    fn run_step(
        &self,
        step: &StepSpec,
        perf: &PerfResolution,
        produced: &mut BTreeSet<String>,
        on_event: &mut dyn FnMut(&RunEvent<'_>),
    ) -> StepRecord {
        let started = Instant::now();
        tracing::info!("step {} started", step.id);
        on_event(&RunEvent::StepStarted(step.id));

        let mut invocations = Vec::with_capacity(step.invocations.len());
        for inv in &step.invocations {
            let record = self.run_invocation(step.id, inv, perf, produced, on_event);
            produced.extend(record.artifacts.iter().cloned());
            invocations.push(record);
        }

        let outcome = StepOutcome::from_invocations(&invocations);
        match &outcome {
            StepOutcome::Failed { reason, .. } => {
                tracing::warn!("step {} completed with error: {reason}", step.id)
            }
            other => tracing::info!("step {} {}", step.id, other.label()),
        }
        StepRecord {
            step: step.id,
            outcome,
            invocations,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn run_invocation(
        &self,
        step: StepId,
        inv: &InvocationSpec,
        perf: &PerfResolution,
        produced: &BTreeSet<String>,
        on_event: &mut dyn FnMut(&RunEvent<'_>),
    ) -> InvocationRecord {
        let tool = inv.tool_name();
        let skipped = |command: String, reason: String| InvocationRecord {
            tool: tool.clone(),
            command,
            status: InvocationStatus::Skipped { reason },
            artifacts: Vec::new(),
            elapsed_ms: 0,
        };

        let resolved = match self.resolve_program(&inv.program, perf) {
            Ok(resolved) => resolved,
            Err(reason) => {
                on_event(&RunEvent::InvocationSkipped { step, reason: &reason });
                return skipped(String::new(), reason);
            }
        };
        if let Some(missing) = inv
            .requires
            .iter()
            .find(|name| !produced.contains(**name) || !self.outdir().join(name).is_file())
        {
            let reason = format!("{missing} was not produced in this run, skipping {tool}");
            on_event(&RunEvent::InvocationSkipped { step, reason: &reason });
            return skipped(String::new(), reason);
        }

        let started = Instant::now();
        let since = SystemTime::now();

        if let Resolved::ReadFile(src) = &resolved {
            let command = format!("read {}", src.display());
            on_event(&RunEvent::InvocationStarted { step, command: &command });
            let status = match inv.stdout {
                Capture::Artifact(name) => match std::fs::copy(src, self.outdir().join(name)) {
                    Ok(_) => InvocationStatus::Exited { code: Some(0) },
                    Err(err) => InvocationStatus::SpawnFailed {
                        error: format!("copy {}: {err}", src.display()),
                    },
                },
                Capture::Merged | Capture::Discard => InvocationStatus::Exited { code: Some(0) },
            };
            return InvocationRecord {
                tool,
                command,
                artifacts: self.collect_artifacts(inv, since),
                status,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }

        let (spec, wrapped) = self.render(inv, &resolved);
        let command = spec.display();
        tracing::debug!("[{step}] {command}");
        on_event(&RunEvent::InvocationStarted { step, command: &command });

        let status = match run(&spec) {
            Ok(outcome) if outcome.timed_out => {
                tracing::warn!("[{step}] {tool} killed after {:?}", inv.deadline);
                InvocationStatus::TimedOut
            }
            Ok(outcome) if wrapped && outcome.exit_code == Some(TIMEOUT_EXPIRED) => {
                InvocationStatus::DurationElapsed
            }
            Ok(outcome) => {
                if !outcome.success() {
                    tracing::warn!("[{step}] {tool} exited with {:?}", outcome.exit_code);
                }
                InvocationStatus::Exited {
                    code: outcome.exit_code,
                }
            }
            Err(err) => {
                tracing::warn!("[{step}] {err}");
                for name in inv.outputs() {
                    let _ = std::fs::remove_file(self.outdir().join(name));
                }
                InvocationStatus::SpawnFailed {
                    error: err.to_string(),
                }
            }
        };

        InvocationRecord {
            tool,
            command,
            artifacts: self.collect_artifacts(inv, since),
            status,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Skip reason when the program cannot run on this host.
    fn resolve_program(
        &self,
        program: &Program,
        perf: &PerfResolution,
    ) -> Result<Resolved, String> {
        match program {
            Program::Tool("perf") => match perf {
                PerfResolution::Unavailable { reason, .. } => {
                    Err(format!("perf not found, skipping ({reason})"))
                }
                found => found
                    .path()
                    .map(|p| Resolved::Exec {
                        program: p.to_path_buf(),
                        prefix: Vec::new(),
                    })
                    .ok_or_else(|| "perf not found, skipping".to_string()),
            },
            Program::Tool(name) => self
                .locator
                .locate(name)
                .map(|program| Resolved::Exec {
                    program,
                    prefix: Vec::new(),
                })
                .ok_or_else(|| format!("{name} not found, skipping")),
            Program::FlameGraphScript(name) => {
                let Some(dir) = self.config.tools.flamegraph_dir.as_deref() else {
                    return Err("FlameGraph directory not configured, skipping".to_string());
                };
                if !dir.is_dir() {
                    return Err(format!(
                        "FlameGraph directory {} not found, skipping",
                        dir.display()
                    ));
                }
                let script = dir.join(name);
                if !script.is_file() {
                    return Err(format!("{} not found, skipping", script.display()));
                }
                if is_executable(&script) {
                    return Ok(Resolved::Exec {
                        program: script,
                        prefix: Vec::new(),
                    });
                }
                self.locator
                    .locate("perl")
                    .map(|perl| Resolved::Exec {
                        program: perl,
                        prefix: vec![script.into_os_string()],
                    })
                    .ok_or_else(|| format!("perl not found, skipping {name}"))
            }
            Program::ReadFile(path) => {
                if path.is_file() {
                    Ok(Resolved::ReadFile(path.clone()))
                } else {
                    Err(format!("{} not found, skipping", path.display()))
                }
            }
        }
    }

    /// Expands the argument template. The flag is true when a `timeout` wrapper was applied.
    fn render(&self, inv: &InvocationSpec, resolved: &Resolved) -> (ProcessSpec, bool) {
        let (program, prefix) = match resolved {
            Resolved::Exec { program, prefix } => (program.clone(), prefix.clone()),
            Resolved::ReadFile(path) => (path.clone(), Vec::new()),
        };
        let timeout = inv.time_box.and_then(|_| self.locator.locate("timeout"));
        let mut wrapped = false;

        let mut args: Vec<OsString> = prefix;
        for arg in &inv.args {
            match arg {
                Arg::Lit(s) => args.push(s.into()),
                Arg::Binary => args.push(self.session.binary.clone().into_os_string()),
                Arg::Target => {
                    if let (Some(TimeBox::Target(bound)), Some(timeout)) =
                        (inv.time_box, &timeout)
                    {
                        args.push(timeout.clone().into_os_string());
                        args.push(bound.as_secs().to_string().into());
                        wrapped = true;
                    }
                    args.push(self.session.binary.clone().into_os_string());
                    args.extend(self.session.target_args().iter().map(OsString::from));
                }
                Arg::Artifact(name) => args.push(self.outdir().join(name).into_os_string()),
                Arg::ArtifactFlag(flag, name) => {
                    let mut s = OsString::from(flag);
                    s.push(self.outdir().join(name));
                    args.push(s);
                }
            }
        }

        let (program, args) = match (inv.time_box, timeout) {
            (Some(TimeBox::Command(bound)), Some(timeout)) => {
                wrapped = true;
                let mut wrapped_args: Vec<OsString> =
                    vec![bound.as_secs().to_string().into(), program.into_os_string()];
                wrapped_args.extend(args);
                (timeout, wrapped_args)
            }
            _ => (program, args),
        };

        let stdout = match inv.stdout {
            Capture::Artifact(name) => Sink::File(self.outdir().join(name)),
            Capture::Merged | Capture::Discard => Sink::Null,
        };
        let stderr = match inv.stderr {
            Capture::Artifact(name) => Sink::File(self.outdir().join(name)),
            Capture::Merged => Sink::Stdout,
            Capture::Discard => Sink::Null,
        };
        let spec = ProcessSpec::new(program)
            .args(args)
            .stdout(stdout)
            .stderr(stderr)
            .head_lines(inv.head_lines)
            .deadline(Some(inv.deadline));
        (spec, wrapped)
    }

    fn collect_artifacts(&self, inv: &InvocationSpec, since: SystemTime) -> Vec<String> {
        let mut out: Vec<String> = inv
            .outputs()
            .into_iter()
            .filter(|name| self.outdir().join(name).is_file())
            .map(str::to_string)
            .collect();
        if !inv.produces.is_empty() {
            match match_artifacts(self.outdir(), &inv.produces, Some(since)) {
                Ok(found) => out.extend(found),
                Err(err) => tracing::warn!("could not scan for {:?}: {err}", inv.produces),
            }
        }
        out
    }
}

pub fn run_session(
    session: &SessionConfig,
    config: &Config,
    locator: &ToolLocator,
    on_event: &mut dyn FnMut(&RunEvent<'_>),
) -> ProfResult<RunReport> {
    SessionRunner::new(session, config, locator).run(on_event)
}

pub fn plan_session(
    session: &SessionConfig,
    config: &Config,
    locator: &ToolLocator,
) -> ProfResult<SessionPlan> {
    SessionRunner::new(session, config, locator).plan()
}
