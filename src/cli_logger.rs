use anyhow::Result;
use profsession::{ArchiveStatus, RunEvent, RunReport, StepOutcome};
use serde::Serialize;
use serde_json::Value;

pub struct CliLogger {
    json: bool,
    no_color: bool,
}

impl CliLogger {
    pub fn new(json: bool, no_color: bool) -> Self {
        Self { json, no_color }
    }

    pub fn print_serialized<T: Serialize>(&self, value: &T) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(value)?);
            return Ok(());
        }

        let rendered = render_value(&serde_json::to_value(value)?, 0);
        println!("{rendered}");
        Ok(())
    }

    /// Progress output while the session runs. Skip notices always reach stdout.
    pub fn print_event(&self, event: &RunEvent<'_>) {
        if self.json {
            if let Some(line) = event_json(event) {
                println!("{line}");
            }
            return;
        }

        match event {
            RunEvent::Phase(_) => {}
            RunEvent::PerfResolved(perf) => {
                let detail = match perf.path() {
                    Some(path) => path.display().to_string(),
                    None => match perf {
                        profsession::PerfResolution::Unavailable { reason, .. } => reason.clone(),
                        _ => String::new(),
                    },
                };
                println!("{} {} {detail}", self.style("perf", "36;1"), perf.label());
            }
            RunEvent::StepStarted(step) => {
                println!("{} {step}", self.style("==>", "36;1"));
            }
            RunEvent::InvocationSkipped { reason, .. } => println!("{reason}"),
            RunEvent::InvocationStarted { command, .. } => {
                println!("    {}", self.style(command, "90"));
            }
            RunEvent::StepFinished(record) => {
                let status = self.outcome_style(&record.outcome);
                match &record.outcome {
                    StepOutcome::Failed { reason, .. } => {
                        println!("    {status} {reason} ({}ms)", record.elapsed_ms)
                    }
                    _ => println!("    {status} ({}ms)", record.elapsed_ms),
                }
            }
            RunEvent::Archived(outcome) => match &outcome.status {
                ArchiveStatus::Created => println!(
                    "{} {}",
                    self.style("archive", "36;1"),
                    outcome.path.as_deref().unwrap_or_default()
                ),
                ArchiveStatus::Skipped { reason } => println!("{reason}"),
                ArchiveStatus::Failed { reason } => {
                    self.print_warning(&format!("archive failed: {reason}"))
                }
            },
        }
    }

    pub fn print_run_report(&self, report: &RunReport) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(report)?);
            return Ok(());
        }

        let count = |label: &str| {
            report
                .steps
                .iter()
                .filter(|s| s.outcome.label() == label)
                .count()
        };
        let mut out = String::new();
        out.push('\n');
        out.push_str(&format!(
            "{} {} ok={} skipped={} failed={}\n",
            self.style("profsession", "36;1"),
            self.style("done", "37;1"),
            count("ok"),
            count("skipped"),
            count("failed")
        ));
        out.push_str(&format!("{} {}\n", self.style("session", "90"), report.session_id));
        out.push_str(&format!(
            "{} {}\n",
            self.style("binary", "90"),
            report.session.binary.display()
        ));
        out.push_str(&format!("{} {}\n", self.style("kernel", "90"), report.kernel_release));
        out.push_str(&format!("{} {}\n", self.style("perf", "90"), report.perf.label()));
        out.push_str(&format!(
            "{} {}\n",
            self.style("outdir", "90"),
            report.session.outdir.display()
        ));
        out.push_str(&format!(
            "{} {} files\n",
            self.style("artifacts", "90"),
            report.artifacts.len()
        ));
        if let Some(path) = report.archive.as_ref().and_then(|a| a.path.as_ref()) {
            out.push_str(&format!("{} {}\n", self.style("archive", "90"), path));
        }

        out.push_str(&format!("{}\n", self.style("steps", "37;1")));
        for step in &report.steps {
            let detail = match &step.outcome {
                StepOutcome::Skipped { reason } => reason.clone(),
                StepOutcome::Succeeded { artifacts } => artifacts.join(", "),
                StepOutcome::Failed { reason, .. } => reason.clone(),
            };
            out.push_str(&format!(
                "  - {:<18} {} {detail}\n",
                step.step.name(),
                self.outcome_style(&step.outcome)
            ));
        }

        println!("{}", out.trim_end());
        Ok(())
    }

    pub fn print_error(&self, msg: &str) {
        if self.json {
            let out = serde_json::json!({
                "status": "error",
                "code": "error",
                "message": msg,
            });
            println!("{out}");
            return;
        }
        eprintln!("{} {msg}", self.style("error", "31;1"));
    }

    pub fn print_warning(&self, msg: &str) {
        if self.json {
            let out = serde_json::json!({
                "status": "warning",
                "code": "warning",
                "message": msg,
            });
            eprintln!("{out}");
            return;
        }
        eprintln!("{} {msg}", self.style("warn", "33;1"));
    }

    fn outcome_style(&self, outcome: &StepOutcome) -> String {
        match outcome {
            StepOutcome::Succeeded { .. } => self.style("OK", "32;1"),
            StepOutcome::Skipped { .. } => self.style("SKIP", "33;1"),
            StepOutcome::Failed { .. } => self.style("FAIL", "31;1"),
        }
    }

    fn style(&self, text: &str, ansi: &str) -> String {
        if self.no_color {
            return text.to_string();
        }
        format!("\x1b[{ansi}m{text}\x1b[0m")
    }
}

fn event_json(event: &RunEvent<'_>) -> Option<Value> {
    let value = match event {
        RunEvent::Phase(phase) => serde_json::json!({ "event": "phase", "phase": phase }),
        RunEvent::PerfResolved(perf) => serde_json::json!({ "event": "perf", "perf": perf }),
        RunEvent::StepStarted(step) => serde_json::json!({ "event": "step_started", "step": step }),
        RunEvent::InvocationSkipped { step, reason } => {
            serde_json::json!({ "event": "skipped", "step": step, "reason": reason })
        }
        RunEvent::InvocationStarted { .. } => return None,
        RunEvent::StepFinished(record) => serde_json::json!({
            "event": "step_finished",
            "step": record.step,
            "outcome": record.outcome,
            "elapsedMs": record.elapsed_ms,
        }),
        RunEvent::Archived(outcome) => {
            serde_json::json!({ "event": "archived", "archive": outcome })
        }
    };
    Some(value)
}

fn render_value(value: &Value, indent: usize) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Number(v) => v.to_string(),
        Value::String(v) => v.clone(),
        Value::Array(items) => render_array(items, indent),
        Value::Object(map) => render_object(map, indent),
    }
}

fn render_array(items: &[Value], indent: usize) -> String {
    if items.is_empty() {
        return "[]".to_string();
    }

    let pad = " ".repeat(indent);
    let mut out = String::new();
    for item in items {
        match item {
            Value::Object(_) | Value::Array(_) => {
                out.push_str(&format!("{pad}-\n{}\n", render_value(item, indent + 2)));
            }
            _ => out.push_str(&format!("{pad}- {}\n", render_value(item, indent + 2))),
        }
    }
    out.trim_end().to_string()
}

fn render_object(map: &serde_json::Map<String, Value>, indent: usize) -> String {
    if map.is_empty() {
        return "{}".to_string();
    }

    let pad = " ".repeat(indent);
    let mut out = String::new();
    for (key, value) in map {
        match value {
            Value::Object(_) | Value::Array(_) => {
                out.push_str(&format!("{pad}{key}:\n{}\n", render_value(value, indent + 2)));
            }
            _ => out.push_str(&format!("{pad}{key}: {}\n", render_value(value, indent + 2))),
        }
    }
    out.trim_end().to_string()
}
