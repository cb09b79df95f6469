mod batch;
mod shell;

pub use batch::BatchPrinter;
pub use shell::ShellPrinter;

use crate::{
    config::{ResultCheck, SimqConfig},
    executors::template::CommandTemplate,
    job::{JobGroup, Stage},
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::{error, info, warn};

/// Output flavour of a generated control script
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptFormat {
    /// bash, optionally with a PBS or SLURM header
    Sh,
    /// Windows cmd
    Bat,
}

impl ScriptFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Sh => "sh",
            Self::Bat => "bat",
        }
    }

    fn printer(&self) -> &'static dyn Printer {
        match self {
            Self::Sh => &ShellPrinter,
            Self::Bat => &BatchPrinter,
        }
    }
}

/// Cluster queue submission header, printed verbatim at the top of shell scripts
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueueHeader {
    Pbs(PbsHeader),
    Slurm(SlurmHeader),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PbsHeader {
    pub queue: String,
    pub nodes: u32,
    pub ncpus: u32,
    pub memory: String,
    pub walltime: String,
    pub output: String,
    pub error: String,
    // environment modules loaded before the first stage
    pub modules: Vec<String>,
}

impl Default for PbsHeader {
    fn default() -> Self {
        Self {
            queue: "qintel_wfly".into(),
            nodes: 1,
            ncpus: 8,
            memory: "64gb".into(),
            walltime: "168:00:00".into(),
            output: "simq_execution.log".into(),
            error: "simq_execution.err".into(),
            modules: vec!["abaqus".into()],
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SlurmHeader {
    pub partition: String,
    pub nodes: u32,
    pub ntasks: u32,
    pub cpus_per_task: u32,
    pub memory: String,
    pub time: String,
    pub output: String,
    pub error: String,
    pub modules: Vec<String>,
}

impl Default for SlurmHeader {
    fn default() -> Self {
        Self {
            partition: "default".into(),
            nodes: 1,
            ntasks: 1,
            cpus_per_task: 8,
            memory: "64G".into(),
            time: "72:00:00".into(),
            output: "simq_execution_%j.log".into(),
            error: "simq_execution_%j.err".into(),
            modules: vec!["abaqus".into()],
        }
    }
}

impl QueueHeader {
    /// scheduler directives, these have to directly follow the shebang
    pub fn directives(&self, job_name: &str) -> Vec<String> {
        match self {
            Self::Pbs(pbs) => vec![
                format!("#PBS -N {job_name}"),
                format!("#PBS -o {}", pbs.output),
                format!("#PBS -e {}", pbs.error),
                format!("#PBS -l walltime={}", pbs.walltime),
                format!("#PBS -q {}", pbs.queue),
                format!("#PBS -l nodes={}:ppn={}", pbs.nodes, pbs.ncpus),
                format!("#PBS -l mem={}", pbs.memory),
            ],
            Self::Slurm(slurm) => vec![
                format!("#SBATCH --job-name={job_name}"),
                format!("#SBATCH --output={}", slurm.output),
                format!("#SBATCH --error={}", slurm.error),
                format!("#SBATCH --time={}", slurm.time),
                format!("#SBATCH --partition={}", slurm.partition),
                format!("#SBATCH --nodes={}", slurm.nodes),
                format!("#SBATCH --ntasks={}", slurm.ntasks),
                format!("#SBATCH --cpus-per-task={}", slurm.cpus_per_task),
                format!("#SBATCH --mem={}", slurm.memory),
            ],
        }
    }

    /// environment setup that runs once the job landed on a node
    pub fn setup(&self) -> Vec<String> {
        let (modules, workdir) = match self {
            Self::Pbs(pbs) => (&pbs.modules, Some("cd \"$PBS_O_WORKDIR\"")),
            Self::Slurm(slurm) => (&slurm.modules, None),
        };

        workdir
            .map(String::from)
            .into_iter()
            .chain(modules.iter().map(|module| format!("module load {module}")))
            .collect()
    }

    /// returns true if the header is unusable, every problem is logged
    pub fn preflight_checks(&self) -> bool {
        let (nodes, cpus) = match self {
            Self::Pbs(pbs) => (pbs.nodes, pbs.ncpus),
            Self::Slurm(slurm) => (slurm.nodes, slurm.cpus_per_task),
        };
        let mut contains_error = false;

        if nodes == 0 {
            error!("queue.nodes cannot be 0");
            contains_error = true;
        }

        if cpus == 0 {
            error!("queue cpus per node cannot be 0");
            contains_error = true;
        }

        contains_error
    }
}

/// One instruction of a control script, independent of the shell it is printed for
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Echo(String),
    Phase {
        number: u8,
        title: &'static str,
        jobs: usize,
    },
    /// Phase 1 prepare, skipped when the job already has a valid result
    Prepare {
        name: String,
        index: usize,
        total: usize,
        work_dir: PathBuf,
        input: PathBuf,
        result_file: PathBuf,
        command: Vec<String>,
    },
    /// opens the Phase 2 block of one job
    BeginJob {
        name: String,
        index: usize,
        total: usize,
    },
    /// jumps to the end of the job block when its Phase 1 prepare failed, nothing is cleaned up
    SkipIfPrepareFailed {
        name: String,
        index: usize,
    },
    /// reclaims leftovers and jumps to the end of the job block
    SkipIfValidResult {
        name: String,
        index: usize,
        result_file: PathBuf,
        output_file: PathBuf,
        work_folder: PathBuf,
    },
    RemoveLock {
        lock_file: PathBuf,
    },
    Compute {
        name: String,
        work_dir: PathBuf,
        input: PathBuf,
        output_file: PathBuf,
        command: Vec<String>,
    },
    /// only runs if the compute of the same job succeeded
    Extract {
        name: String,
        work_dir: PathBuf,
        result_file: PathBuf,
        command: Vec<String>,
    },
    /// unconditional, whatever compute and extract did
    Cleanup {
        name: String,
        output_file: PathBuf,
        work_folder: PathBuf,
    },
    EndJob {
        index: usize,
    },
}

/// Turns steps into lines of one particular shell dialect
pub trait Printer: Sync {
    fn preamble(&self, script: &ControlScript) -> Vec<String>;
    fn step(&self, script: &ControlScript, step: &Step) -> Vec<String>;
    fn epilogue(&self, script: &ControlScript) -> Vec<String>;
    fn line_ending(&self) -> &'static str {
        "\n"
    }
}

/// Standalone replay of the two phase schedule of one group, for batch queues without simq
#[derive(Clone, Debug)]
pub struct ControlScript {
    pub group: String,
    pub header: Option<QueueHeader>,
    pub result: ResultCheck,
    pub log_dir: PathBuf,
    pub steps: Vec<Step>,
}

impl ControlScript {
    pub fn build(group: &JobGroup, config: &SimqConfig) -> Self {
        let template = CommandTemplate::new(config.engine.clone());
        let total = group.len();
        let mut steps = vec![Step::Echo(format!(
            "simq control script for group {} ({total} jobs)",
            group.name()
        ))];

        steps.push(Step::Phase {
            number: 1,
            title: "prepare",
            jobs: total,
        });

        for (index, job) in group.jobs().iter().enumerate() {
            steps.push(Step::Prepare {
                name: job.name.clone(),
                index: index + 1,
                total,
                work_dir: job.work_dir.clone(),
                input: job.compute_script.clone(),
                result_file: job.artifacts.result_file.clone(),
                command: template.render(Stage::Prepare, job),
            });
        }

        steps.push(Step::Phase {
            number: 2,
            title: "compute and extract, one job at a time",
            jobs: total,
        });

        for (index, job) in group.jobs().iter().enumerate() {
            let index = index + 1;

            steps.extend([
                Step::BeginJob {
                    name: job.name.clone(),
                    index,
                    total,
                },
                Step::SkipIfPrepareFailed {
                    name: job.name.clone(),
                    index,
                },
                Step::SkipIfValidResult {
                    name: job.name.clone(),
                    index,
                    result_file: job.artifacts.result_file.clone(),
                    output_file: job.artifacts.output_file.clone(),
                    work_folder: job.artifacts.work_folder.clone(),
                },
                Step::RemoveLock {
                    lock_file: job.artifacts.lock_file.clone(),
                },
                Step::Compute {
                    name: job.name.clone(),
                    work_dir: job.work_dir.clone(),
                    input: job.compute_script.clone(),
                    output_file: job.artifacts.output_file.clone(),
                    command: template.render(Stage::Compute, job),
                },
                Step::Extract {
                    name: job.name.clone(),
                    work_dir: job.work_dir.clone(),
                    result_file: job.artifacts.result_file.clone(),
                    command: template.render(Stage::Extract, job),
                },
                Step::Cleanup {
                    name: job.name.clone(),
                    output_file: job.artifacts.output_file.clone(),
                    work_folder: job.artifacts.work_folder.clone(),
                },
                Step::EndJob { index },
            ]);
        }

        steps.push(Step::Echo(format!("group {} completed", group.name())));

        Self {
            group: group.name().to_owned(),
            header: config.queue.clone(),
            result: config.result.clone(),
            log_dir: config.log_dir(),
            steps,
        }
    }

    /// failure log of a stage, shared with the in-process scheduler
    pub fn failure_log(&self, stage: Stage) -> PathBuf {
        self.log_dir.join(stage.failure_log())
    }

    pub fn render(&self, format: ScriptFormat) -> String {
        let printer = format.printer();
        let mut lines = printer.preamble(self);

        for step in self.steps.iter() {
            lines.extend(printer.step(self, step));
        }

        lines.extend(printer.epilogue(self));

        let line_ending = printer.line_ending();
        lines.join(line_ending) + line_ending
    }

    pub fn file_name(&self, format: ScriptFormat) -> String {
        let group: String = self
            .group
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        format!("run_{group}.{}", format.extension())
    }

    /// write the script into `out`, shell scripts are made executable
    pub fn write(&self, format: ScriptFormat, out: &Path) -> io::Result<PathBuf> {
        let path = out.join(self.file_name(format));
        fs::write(&path, self.render(format))?;

        if format == ScriptFormat::Sh {
            let mut permissions = fs::metadata(&path)?.permissions();
            permissions.set_mode(0o755);
            fs::set_permissions(&path, permissions)?;
        }

        info!(group = %self.group, path = ?path, "Wrote control script");

        Ok(path)
    }
}

/// emit one control script per group into `out`
pub fn emit_all(
    groups: &[JobGroup],
    config: &SimqConfig,
    format: ScriptFormat,
    out: &Path,
) -> io::Result<Vec<PathBuf>> {
    if format == ScriptFormat::Bat && config.queue.is_some() {
        warn!("Queue headers only apply to sh scripts, ignoring it for bat");
    }

    fs::create_dir_all(out)?;

    groups
        .iter()
        .map(|group| ControlScript::build(group, config).write(format, out))
        .collect()
}

#[cfg(test)]
#[path = "script_test.rs"]
mod script_test;
