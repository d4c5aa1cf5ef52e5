//! External process adapter for the graph-based orthorectification,
//! calibration and despeckling tool.
//!
//! The adapter is a pure boundary: it renders the parameter set into a
//! processing-graph template, invokes the tool as a blocking child
//! process, classifies failures into the pipeline error taxonomy and
//! validates that the declared output artifact exists and is
//! non-empty. It never interprets pixel values.

use crate::config::GraphTemplates;
use crate::types::{
    DemReference, PipelineError, PipelineResult, ProcessingStep, METERS_PER_DEGREE,
};
use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// How often a running child is polled for completion
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Contract for running one external processing step.
/// `fallback` selects the documented alternate parameter set for the
/// one bounded retry (currently: calibration without the radiometric
/// step); implementations without a fallback must fail, not improvise.
pub trait GraphTool: Send + Sync {
    fn run(
        &self,
        step: &ProcessingStep,
        band: &str,
        product: &str,
        input: &Path,
        output: &Path,
        fallback: bool,
    ) -> PipelineResult<()>;
}

/// Production adapter for a SNAP-style graph processing tool
pub struct SnapGraphAdapter {
    tool_path: PathBuf,
    templates: GraphTemplates,
    timeout: Duration,
}

impl SnapGraphAdapter {
    pub fn new(tool_path: impl Into<PathBuf>, templates: GraphTemplates, timeout: Duration) -> Self {
        Self {
            tool_path: tool_path.into(),
            templates,
            timeout,
        }
    }

    fn template_for(&self, step: &ProcessingStep, fallback: bool) -> PipelineResult<&Path> {
        match step {
            ProcessingStep::Calibrate { .. } => {
                if fallback {
                    self.templates
                        .calibrate_fallback
                        .as_deref()
                        .ok_or_else(|| PipelineError::Processing(
                            "no fallback calibration graph configured".to_string(),
                        ))
                } else {
                    Ok(&self.templates.calibrate)
                }
            }
            ProcessingStep::Orthorectify { .. } => Ok(&self.templates.orthorectify),
            ProcessingStep::Despeckle { .. } => Ok(&self.templates.despeckle),
            other => Err(PipelineError::Processing(format!(
                "step '{}' is not an external tool step",
                other.name()
            ))),
        }
    }

    /// Substitute the named placeholders of one graph template
    fn render(template: &str, step: &ProcessingStep, input: &Path, output: &Path) -> String {
        let mut graph = template
            .replace("{{input}}", &input.display().to_string())
            .replace("{{output}}", &output.display().to_string());

        match step {
            ProcessingStep::Calibrate { polarization } => {
                graph = graph.replace("{{polarization}}", &polarization.to_string());
            }
            ProcessingStep::Orthorectify {
                pixel_size_m,
                epsg,
                dem,
            } => {
                let dem_value = match dem {
                    DemReference::Path(p) => p.display().to_string(),
                    DemReference::Url(u) => u.clone(),
                    DemReference::Named(n) => n.clone(),
                };
                graph = graph
                    .replace("{{pixel_size_m}}", &format!("{}", pixel_size_m))
                    .replace(
                        "{{pixel_size_deg}}",
                        &format!("{}", pixel_size_m / METERS_PER_DEGREE),
                    )
                    .replace("{{crs}}", &format!("EPSG:{}", epsg))
                    .replace("{{dem}}", &dem_value);
            }
            ProcessingStep::Despeckle { filter } => {
                graph = graph.replace("{{filter}}", filter.token());
            }
            _ => {}
        }
        graph
    }

    /// Last part of the captured stderr, for error messages
    fn stderr_tail(stderr_file: &mut fs::File) -> String {
        const TAIL: u64 = 2048;
        let len = stderr_file.metadata().map(|m| m.len()).unwrap_or(0);
        let start = len.saturating_sub(TAIL);
        let mut tail = String::new();
        if stderr_file.seek(SeekFrom::Start(start)).is_ok() {
            let _ = stderr_file.read_to_string(&mut tail);
        }
        tail.trim().to_string()
    }
}

impl GraphTool for SnapGraphAdapter {
    fn run(
        &self,
        step: &ProcessingStep,
        band: &str,
        product: &str,
        input: &Path,
        output: &Path,
        fallback: bool,
    ) -> PipelineResult<()> {
        let template_path = self.template_for(step, fallback)?;
        let template = fs::read_to_string(template_path).map_err(|e| {
            PipelineError::MissingDependency {
                what: format!("graph template '{}'", template_path.display()),
                hint: format!("check PipelineConfig.graph_templates ({})", e),
            }
        })?;
        let graph = Self::render(&template, step, input, output);

        let mut graph_file = tempfile::Builder::new()
            .prefix("eoband_graph_")
            .suffix(".xml")
            .tempfile()?;
        std::io::Write::write_all(&mut graph_file, graph.as_bytes())?;

        log::info!(
            "running external {} for band '{}' of product '{}'",
            step.name(),
            band,
            product
        );
        log::debug!("tool: {} graph: {}", self.tool_path.display(), graph_file.path().display());

        let mut stderr_file = tempfile::tempfile()?;
        let mut child = Command::new(&self.tool_path)
            .arg(graph_file.path())
            .stdout(Stdio::null())
            .stderr(stderr_file.try_clone()?)
            .spawn()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    PipelineError::MissingDependency {
                        what: format!("external tool '{}'", self.tool_path.display()),
                        hint: "install the graph processing tool or fix PipelineConfig.tool_path"
                            .to_string(),
                    }
                } else {
                    PipelineError::Io(e)
                }
            })?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if started.elapsed() > self.timeout {
                        // Best-effort kill; the uncommitted output is
                        // never promoted to a cache entry
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(PipelineError::ToolTimeout {
                            step: step.name().to_string(),
                            band: band.to_string(),
                            product: product.to_string(),
                            seconds: self.timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        };

        if !status.success() {
            return Err(PipelineError::ToolExecution {
                step: step.name().to_string(),
                band: band.to_string(),
                product: product.to_string(),
                message: format!(
                    "exit status {}: {}",
                    status.code().map(|c| c.to_string()).unwrap_or_else(|| "killed".to_string()),
                    Self::stderr_tail(&mut stderr_file)
                ),
            });
        }

        // The tool declared this output; hold it to that
        let produced = fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        if produced == 0 {
            return Err(PipelineError::ToolExecution {
                step: step.name().to_string(),
                band: band.to_string(),
                product: product.to_string(),
                message: format!("declared output '{}' missing or empty", output.display()),
            });
        }

        log::info!(
            "external {} finished for band '{}' in {:.1}s",
            step.name(),
            band,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }
}
