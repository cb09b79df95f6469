use super::{shell::quote, ControlScript, PbsHeader, QueueHeader, ScriptFormat, SlurmHeader, Step};
use crate::{
    config::{EngineConfig, Naming, ResultCheck, SchedulerConfig, SimqConfig},
    job::JobGroup,
    registry::{self, Grouping},
};
use std::{
    env, fs,
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
    process::Command,
};
use tempfile::TempDir;

fn config(root: &Path) -> SimqConfig {
    SimqConfig {
        root: root.to_path_buf(),
        naming: Naming::default(),
        engine: EngineConfig {
            prepare: vec!["sh".into(), "{script}".into()],
            compute: vec!["sh".into(), "{input}".into()],
            extract: vec!["sh".into(), "{script}".into()],
            cpus: 1,
        },
        scheduler: SchedulerConfig::default(),
        result: ResultCheck {
            min_size: 16,
            markers: vec!["RESULT".into()],
        },
        grouping: Grouping::Single,
        queue: None,
        log_dir: PathBuf::from("logs"),
        ledger: None,
    }
}

fn write_job(root: &Path, name: &str, prepare: &str, extract: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{name}_prepare.py")), prepare).unwrap();
    fs::write(dir.join(format!("{name}_extract.py")), extract).unwrap();

    dir
}

fn engine_prepare(name: &str) -> String {
    format!("echo ran > prepared.txt\nprintf 'touch {name}.odb\\nmkdir -p {name}.abq\\n' > {name}.inp\n")
}

const ENGINE_EXTRACT: &str = "printf 'RESULT\\nvalue 1234567890\\n' > result.txt\n";

/// `target` spelled relative to the current directory, through `..` up to `/`
fn relative_to_cwd(target: &Path) -> PathBuf {
    let cwd = env::current_dir().unwrap();
    let mut relative = PathBuf::new();

    for component in cwd.components() {
        if let Component::Normal(_) = component {
            relative.push("..");
        }
    }

    relative.join(target.strip_prefix("/").unwrap())
}

fn single_group(root: &Path, config: &SimqConfig) -> JobGroup {
    let mut groups = registry::discover(root, &config.naming, &config.grouping).unwrap();
    assert_eq!(groups.len(), 1);

    groups.remove(0)
}

#[test]
pub fn steps_follow_the_two_phase_schedule() {
    let root = TempDir::new().unwrap();
    write_job(root.path(), "a", "", "");
    write_job(root.path(), "b", "", "");
    let config = config(root.path());

    let script = ControlScript::build(&single_group(root.path(), &config), &config);
    let kinds: Vec<&str> = script
        .steps
        .iter()
        .map(|step| match step {
            Step::Echo(_) => "echo",
            Step::Phase { .. } => "phase",
            Step::Prepare { .. } => "prepare",
            Step::BeginJob { .. } => "begin",
            Step::SkipIfPrepareFailed { .. } => "skip_failed",
            Step::SkipIfValidResult { .. } => "skip",
            Step::RemoveLock { .. } => "unlock",
            Step::Compute { .. } => "compute",
            Step::Extract { .. } => "extract",
            Step::Cleanup { .. } => "cleanup",
            Step::EndJob { .. } => "end",
        })
        .collect();

    let job = [
        "begin",
        "skip_failed",
        "skip",
        "unlock",
        "compute",
        "extract",
        "cleanup",
        "end",
    ];
    let mut expected = vec!["echo", "phase", "prepare", "prepare", "phase"];
    expected.extend(job);
    expected.extend(job);
    expected.push("echo");

    assert_eq!(kinds, expected);
}

#[test]
pub fn shell_scripts_start_with_the_queue_header() {
    let root = TempDir::new().unwrap();
    write_job(root.path(), "a", "", "");
    let mut config = config(root.path());
    config.queue = Some(QueueHeader::Pbs(PbsHeader::default()));

    let rendered =
        ControlScript::build(&single_group(root.path(), &config), &config).render(ScriptFormat::Sh);
    let lines: Vec<&str> = rendered.lines().collect();

    assert_eq!(lines[0], "#!/bin/bash");
    assert_eq!(lines[1], "#PBS -N simq_all");
    assert!(lines.contains(&"#PBS -q qintel_wfly"));
    assert!(lines.contains(&"#PBS -l nodes=1:ppn=8"));
    assert!(lines.contains(&"#PBS -l walltime=168:00:00"));
    assert!(lines.contains(&"module load abaqus"));
    assert!(rendered.contains("-ge 16 ] || return 1"));
    assert!(rendered.contains("grep -qF -e RESULT"));
    assert!(rendered.contains("job_1() {"));
    assert!(lines.contains(&"job_1"));
}

#[test]
pub fn batch_scripts_use_labels_and_crlf() {
    let root = TempDir::new().unwrap();
    write_job(root.path(), "a", "", "");
    let mut config = config(root.path());
    config.queue = Some(QueueHeader::Slurm(SlurmHeader::default()));

    let rendered =
        ControlScript::build(&single_group(root.path(), &config), &config).render(ScriptFormat::Bat);

    assert!(rendered.starts_with("@echo off\r\n"));
    assert!(rendered.contains("goto :next_job1\r\n"));
    assert!(rendered.contains("\r\nif defined prep_failed1 (\r\n"));
    assert!(rendered.contains("set prep_failed1=1\r\n"));
    assert!(rendered.contains("\r\n:next_job1\r\n"));
    assert!(rendered.contains("if %~z1 LSS 16 goto :eof"));
    assert!(rendered.contains("findstr /L /C:\"RESULT\""));
    assert!(rendered.contains("failed_compute.log"));
    assert!(!rendered.contains("#SBATCH"));
}

#[test]
pub fn shell_quoting_survives_odd_names() {
    assert_eq!(quote("plain/path.inp"), "plain/path.inp");
    assert_eq!(quote("two words"), "'two words'");
    assert_eq!(quote("it's"), "'it'\\''s'");
    assert_eq!(quote(""), "''");
}

#[test]
pub fn written_file_names_are_sanitized() {
    let root = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let config = config(root.path());
    let script = ControlScript {
        group: "lane 1/x".into(),
        header: None,
        result: config.result.clone(),
        log_dir: config.log_dir(),
        steps: vec![Step::Echo("hi".into())],
    };

    let path = script.write(ScriptFormat::Sh, out.path()).unwrap();

    assert_eq!(path, out.path().join("run_lane_1_x.sh"));
    let mode = fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
pub fn queue_headers_are_read_from_yaml() {
    let header: QueueHeader = serde_yaml::from_str("kind: slurm\npartition: gpu\n").unwrap();

    assert_eq!(
        header,
        QueueHeader::Slurm(SlurmHeader {
            partition: "gpu".into(),
            ..SlurmHeader::default()
        })
    );
    assert!(header
        .directives("simq_all")
        .contains(&"#SBATCH --time=72:00:00".to_string()));
}

#[test]
pub fn emitted_shell_script_runs_the_schedule() {
    let root = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let fresh = write_job(root.path(), "a", &engine_prepare("a"), ENGINE_EXTRACT);
    let done = write_job(root.path(), "b", &engine_prepare("b"), ENGINE_EXTRACT);
    let broken = write_job(root.path(), "c", &engine_prepare("c"), "exit 3\n");
    fs::write(done.join("result.txt"), "RESULT\nalready computed\n").unwrap();
    fs::write(done.join("b.odb"), "stale").unwrap();
    let config = config(root.path());
    let groups = registry::discover(root.path(), &config.naming, &config.grouping).unwrap();

    let paths = super::emit_all(&groups, &config, ScriptFormat::Sh, out.path()).unwrap();
    let status = Command::new("bash").arg(&paths[0]).status().unwrap();

    assert!(status.success());

    assert!(fresh.join("prepared.txt").is_file());
    assert!(fs::read_to_string(fresh.join("result.txt"))
        .unwrap()
        .starts_with("RESULT"));
    assert!(!fresh.join("a.odb").exists());
    assert!(!fresh.join("a.abq").exists());

    assert!(!done.join("prepared.txt").exists());
    assert!(!done.join("b.odb").exists());

    assert!(!broken.join("c.odb").exists());
    let failed = fs::read_to_string(root.path().join("logs/failed_extract.log")).unwrap();
    assert!(failed.contains("\tc\texit code 3"));
    assert!(!root.path().join("logs/failed_compute.log").exists());
}

#[test]
pub fn emitted_scripts_log_failures_with_a_relative_root() {
    let root = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_job(root.path(), "c", &engine_prepare("c"), "exit 3\n");
    let config = config(&relative_to_cwd(root.path()));
    assert!(config.root.is_relative());
    let groups = registry::discover(&config.root, &config.naming, &config.grouping).unwrap();

    let paths = super::emit_all(&groups, &config, ScriptFormat::Sh, out.path()).unwrap();
    let status = Command::new("bash")
        .arg(&paths[0])
        .current_dir(out.path())
        .status()
        .unwrap();

    assert!(status.success());
    let failed = fs::read_to_string(root.path().join("logs/failed_extract.log")).unwrap();
    assert!(failed.contains("\tc\texit code 3"));
}

#[test]
pub fn failed_prepare_keeps_the_job_out_of_phase_two() {
    let root = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    // writes the compute input and still fails
    let broken = write_job(
        root.path(),
        "p",
        &format!("{}exit 1\n", engine_prepare("p")),
        ENGINE_EXTRACT,
    );
    let fine = write_job(root.path(), "q", &engine_prepare("q"), ENGINE_EXTRACT);
    let config = config(root.path());
    let groups = registry::discover(root.path(), &config.naming, &config.grouping).unwrap();

    let paths = super::emit_all(&groups, &config, ScriptFormat::Sh, out.path()).unwrap();
    let status = Command::new("bash").arg(&paths[0]).status().unwrap();

    assert!(status.success());
    assert!(broken.join("p.inp").is_file());
    assert!(!broken.join("p.odb").exists());
    assert!(!broken.join("result.txt").exists());
    assert!(fine.join("result.txt").is_file());

    let failed = fs::read_to_string(root.path().join("logs/failed_prepare.log")).unwrap();
    assert_eq!(failed.lines().count(), 1);
    assert!(failed.contains("\tp\texit code 1"));
    assert!(!root.path().join("logs/failed_compute.log").exists());
    assert!(!root.path().join("logs/failed_extract.log").exists());
}
