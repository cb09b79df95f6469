use crate::{
    config::EngineConfig,
    job::{Job, Stage},
};

/// Builds the argv of a stage from the engine config
///
/// This is the only place that knows about the engine's invocation syntax. Supported
/// placeholders in every template argument:
///
/// - `{job}`: job name
/// - `{script}`: absolute path of the stage script
/// - `{input}`: file name of the compute input, relative to the job directory
/// - `{cpus}`: parallelism hint
/// - `{work_dir}`: absolute job directory
#[derive(Clone, Debug)]
pub struct CommandTemplate {
    engine: EngineConfig,
}

impl CommandTemplate {
    pub fn new(engine: EngineConfig) -> Self {
        Self { engine }
    }

    fn arguments(&self, stage: Stage) -> &[String] {
        match stage {
            Stage::Prepare => &self.engine.prepare,
            Stage::Compute => &self.engine.compute,
            Stage::Extract => &self.engine.extract,
        }
    }

    pub fn render(&self, stage: Stage, job: &Job) -> Vec<String> {
        let script = job.script(stage).to_string_lossy();
        let input = job
            .compute_script
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        let work_dir = job.work_dir.to_string_lossy();
        let cpus = self.engine.cpus.to_string();

        self.arguments(stage)
            .iter()
            .map(|argument| {
                argument
                    .replace("{job}", &job.name)
                    .replace("{script}", &script)
                    .replace("{input}", &input)
                    .replace("{cpus}", &cpus)
                    .replace("{work_dir}", &work_dir)
            })
            .collect()
    }
}
