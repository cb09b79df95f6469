use super::{template::CommandTemplate, LaunchError, StageExecutor, StageHandle};
use crate::{
    config::EngineConfig,
    job::{Job, Stage},
    poller::Clock,
};
use std::{
    fs::OpenOptions,
    io,
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Child, Command, ExitStatus, Stdio},
    time::Duration,
};
use tracing::{debug, instrument};
use wait_timeout::ChildExt;

/// Executor that spawns stages as local child processes
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    template: CommandTemplate,
}

impl LocalExecutor {
    pub fn load(engine: EngineConfig) -> Self {
        Self {
            template: CommandTemplate::new(engine),
        }
    }
}

impl StageExecutor for LocalExecutor {
    /// spawn the stage detached from our process group, output goes to the job's stage log
    #[instrument(skip(self, job), fields(job = %job.name), level = "debug")]
    fn launch(&self, stage: Stage, job: &Job) -> Result<Box<dyn StageHandle>, LaunchError> {
        if !job.work_dir.is_dir() {
            return Err(LaunchError::MissingWorkDir(job.work_dir.clone()));
        }

        let script = job.script(stage);
        if !script.is_file() {
            return Err(LaunchError::MissingScript {
                stage,
                path: script.to_path_buf(),
            });
        }

        let argv = self.template.render(stage, job);
        let (program, args) = argv
            .split_first()
            .ok_or(LaunchError::EmptyTemplate(stage))?;

        let log_path = job.stage_log(stage);
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| LaunchError::StageLog {
                path: log_path.clone(),
                source,
            })?;
        let stderr = stdout
            .try_clone()
            .map_err(|source| LaunchError::StageLog {
                path: log_path.clone(),
                source,
            })?;

        // a fresh process group keeps SIGINT on the orchestrator's terminal away from the
        // engine, it has to release its license on its own
        match Command::new(program)
            .args(args)
            .current_dir(&job.work_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
        {
            Ok(child) => {
                debug!(pid = child.id(), command = ?argv, log = ?log_path, "Launched stage");

                Ok(Box::new(LocalHandle::new(child)))
            }
            // spawn reports a vanished current_dir as NotFound too
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                if job.work_dir.is_dir() {
                    Err(LaunchError::ExecutableNotFound(program.clone()))
                } else {
                    Err(LaunchError::MissingWorkDir(job.work_dir.clone()))
                }
            }
            Err(source) => Err(LaunchError::Spawn {
                program: program.clone(),
                source,
            }),
        }
    }
}

/// shell convention, a process killed by signal N reports 128 + N
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[derive(Debug)]
pub struct LocalHandle {
    child: Child,
    exit: Option<i32>,
}

impl LocalHandle {
    pub fn new(child: Child) -> Self {
        Self { child, exit: None }
    }
}

impl StageHandle for LocalHandle {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn wait_tick(&mut self, interval: Duration, clock: &dyn Clock) -> io::Result<Option<i32>> {
        if let Some(code) = self.exit {
            clock.sleep(interval);

            return Ok(Some(code));
        }

        // returns early if the child exits within the interval
        match self.child.wait_timeout(interval)? {
            Some(status) => {
                let code = exit_code(status);
                self.exit = Some(code);

                Ok(Some(code))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[path = "local_test.rs"]
mod local_test;
