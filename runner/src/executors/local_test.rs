use super::LocalExecutor;
use crate::{
    config::{EngineConfig, Naming},
    executors::{LaunchError, StageExecutor, StageHandle},
    job::{Job, Stage},
    poller::SystemClock,
};
use std::{fs, path::Path, time::Duration};
use tempfile::TempDir;

fn sh_engine() -> EngineConfig {
    EngineConfig {
        prepare: vec!["sh".into(), "{script}".into()],
        compute: vec!["sh".into(), "{input}".into()],
        extract: vec!["sh".into(), "{script}".into()],
        cpus: 1,
    }
}

fn job_with_prepare(dir: &Path, body: &str) -> Job {
    let job = Job::new("lattice", dir, &Naming::default());
    fs::write(&job.prepare_script, body).unwrap();

    job
}

fn wait_exit(handle: &mut Box<dyn StageHandle>) -> i32 {
    let clock = SystemClock::new();

    for _ in 0..400 {
        if let Some(code) = handle
            .wait_tick(Duration::from_millis(25), &clock)
            .unwrap()
        {
            return code;
        }
    }

    panic!("stage did not exit within 10s");
}

#[test]
pub fn reports_the_exit_code() {
    let dir = TempDir::new().unwrap();
    let job = job_with_prepare(dir.path(), "exit 3\n");

    let mut handle = LocalExecutor::load(sh_engine())
        .launch(Stage::Prepare, &job)
        .unwrap();

    assert!(handle.id().is_some());
    assert_eq!(wait_exit(&mut handle), 3);
    // the exit code sticks once observed
    assert_eq!(
        handle
            .wait_tick(Duration::from_millis(1), &SystemClock::new())
            .unwrap(),
        Some(3)
    );
}

#[test]
pub fn output_goes_to_the_stage_log() {
    let dir = TempDir::new().unwrap();
    let job = job_with_prepare(dir.path(), "echo hello from prepare\necho oops >&2\n");

    let mut handle = LocalExecutor::load(sh_engine())
        .launch(Stage::Prepare, &job)
        .unwrap();
    assert_eq!(wait_exit(&mut handle), 0);

    let log = fs::read_to_string(job.stage_log(Stage::Prepare)).unwrap();
    assert!(log.contains("hello from prepare"));
    assert!(log.contains("oops"));
}

#[test]
pub fn stages_run_inside_the_job_directory() {
    let dir = TempDir::new().unwrap();
    let job = job_with_prepare(dir.path(), "echo marker > here.txt\n");

    let mut handle = LocalExecutor::load(sh_engine())
        .launch(Stage::Prepare, &job)
        .unwrap();
    assert_eq!(wait_exit(&mut handle), 0);

    assert!(dir.path().join("here.txt").is_file());
}

#[test]
pub fn compute_is_started_with_the_relative_input() {
    let dir = TempDir::new().unwrap();
    let job = job_with_prepare(dir.path(), "exit 0\n");
    fs::write(&job.compute_script, "touch lattice.odb\n").unwrap();

    let mut handle = LocalExecutor::load(sh_engine())
        .launch(Stage::Compute, &job)
        .unwrap();
    assert_eq!(wait_exit(&mut handle), 0);

    assert!(job.artifacts.output_file.is_file());
}

#[test]
pub fn running_stage_has_no_exit_code_yet() {
    let dir = TempDir::new().unwrap();
    let job = job_with_prepare(dir.path(), "sleep 1\n");

    let mut handle = LocalExecutor::load(sh_engine())
        .launch(Stage::Prepare, &job)
        .unwrap();

    assert_eq!(
        handle
            .wait_tick(Duration::from_millis(10), &SystemClock::new())
            .unwrap(),
        None
    );
    assert_eq!(wait_exit(&mut handle), 0);
}

#[test]
pub fn killed_stage_reports_the_signal() {
    let dir = TempDir::new().unwrap();
    let job = job_with_prepare(dir.path(), "kill -9 $$\n");

    let mut handle = LocalExecutor::load(sh_engine())
        .launch(Stage::Prepare, &job)
        .unwrap();

    assert_eq!(wait_exit(&mut handle), 128 + 9);
}

#[test]
pub fn missing_script_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let job = job_with_prepare(dir.path(), "exit 0\n");

    // the compute input is only written by prepare
    let result = LocalExecutor::load(sh_engine()).launch(Stage::Compute, &job);

    assert!(matches!(
        result,
        Err(LaunchError::MissingScript { stage: Stage::Compute, .. })
    ));
}

#[test]
pub fn unknown_program_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let job = job_with_prepare(dir.path(), "exit 0\n");
    let engine = EngineConfig {
        prepare: vec!["simq-no-such-engine".into(), "{script}".into()],
        ..sh_engine()
    };

    let result = LocalExecutor::load(engine).launch(Stage::Prepare, &job);

    assert!(matches!(
        result,
        Err(LaunchError::ExecutableNotFound(program)) if program == "simq-no-such-engine"
    ));
}

#[test]
pub fn empty_template_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let job = job_with_prepare(dir.path(), "exit 0\n");
    let engine = EngineConfig {
        prepare: Vec::new(),
        ..sh_engine()
    };

    let result = LocalExecutor::load(engine).launch(Stage::Prepare, &job);

    assert!(matches!(
        result,
        Err(LaunchError::EmptyTemplate(Stage::Prepare))
    ));
}

#[test]
pub fn missing_job_directory_is_not_a_missing_program() {
    let dir = TempDir::new().unwrap();
    let gone = dir.path().join("removed");
    let job = Job::new("lattice", &gone, &Naming::default());

    let result = LocalExecutor::load(sh_engine()).launch(Stage::Prepare, &job);

    assert!(matches!(
        result,
        Err(LaunchError::MissingWorkDir(path)) if path == gone
    ));
}
