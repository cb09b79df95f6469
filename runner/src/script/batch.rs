use super::{ControlScript, Printer, Step};
use crate::job::Stage;
use std::path::Path;

/// Windows cmd printer, a resume skip jumps to the `:next_job` label closing the job block
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchPrinter;

const INDENT: &str = "    ";

/// escape text for cmd, `%` is doubled and metacharacters are caret escaped
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%%"),
            '^' | '&' | '|' | '<' | '>' | '(' | ')' => {
                escaped.push('^');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }

    escaped
}

fn quote_path(path: &Path) -> String {
    format!("\"{}\"", path.to_string_lossy().replace('%', "%%"))
}

fn command(arguments: &[String]) -> String {
    arguments
        .iter()
        .map(|argument| {
            let argument = argument.replace('%', "%%");
            if argument.contains([' ', '\t', '&', '|', '<', '>', '(', ')', '^']) {
                format!("\"{argument}\"")
            } else {
                argument
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn log_failure(script: &ControlScript, stage: Stage, name: &str, detail: &str) -> String {
    format!(
        "call :log_failure {} \"{}\" \"{detail}\"",
        quote_path(&script.failure_log(stage)),
        name.replace('%', "%%")
    )
}

fn reclaim(output_file: &Path, work_folder: &Path) -> Vec<String> {
    vec![
        format!(
            "if exist {} del /Q {}",
            quote_path(output_file),
            quote_path(output_file)
        ),
        format!(
            "if exist {} rd /S /Q {}",
            quote_path(work_folder),
            quote_path(work_folder)
        ),
    ]
}

impl Printer for BatchPrinter {
    fn preamble(&self, script: &ControlScript) -> Vec<String> {
        vec![
            "@echo off".to_string(),
            "setlocal enabledelayedexpansion".to_string(),
            String::new(),
            format!(
                "if not exist {} mkdir {}",
                quote_path(&script.log_dir),
                quote_path(&script.log_dir)
            ),
            String::new(),
        ]
    }

    fn step(&self, script: &ControlScript, step: &Step) -> Vec<String> {
        match step {
            Step::Echo(message) => vec![format!("echo {}", escape(message))],
            Step::Phase {
                number,
                title,
                jobs,
            } => vec![
                String::new(),
                "rem ========================================".to_string(),
                format!("rem Phase {number}: {title}"),
                "rem ========================================".to_string(),
                format!("echo {}", escape(&format!("Phase {number}: {title} ({jobs} jobs)"))),
                "echo.".to_string(),
            ],
            Step::Prepare {
                name,
                index,
                total,
                work_dir,
                input,
                result_file,
                command: arguments,
            } => vec![
                format!("echo {}", escape(&format!("[{index}/{total}] prepare: {name}"))),
                format!("set \"prep_failed{index}=\""),
                format!("call :result_valid {}", quote_path(result_file)),
                "if \"!valid!\"==\"1\" (".to_string(),
                format!("{INDENT}echo {}", escape(&format!("{name} already has a valid result"))),
                ") else (".to_string(),
                format!("{INDENT}pushd {}", quote_path(work_dir)),
                format!("{INDENT}call {}", command(arguments)),
                format!("{INDENT}set rc=!errorlevel!"),
                format!("{INDENT}popd"),
                format!("{INDENT}set ok=1"),
                format!("{INDENT}if not \"!rc!\"==\"0\" set ok=0"),
                format!("{INDENT}if not exist {} set ok=0", quote_path(input)),
                format!("{INDENT}if \"!ok!\"==\"0\" ("),
                format!("{INDENT}{INDENT}echo {}", escape(&format!("ERROR: prepare failed for {name}"))),
                format!(
                    "{INDENT}{INDENT}{}",
                    log_failure(script, Stage::Prepare, name, "exit code !rc!")
                ),
                format!("{INDENT}{INDENT}set prep_failed{index}=1"),
                format!("{INDENT})"),
                ")".to_string(),
                "echo.".to_string(),
            ],
            Step::BeginJob { name, index, total } => vec![
                "echo ========================================".to_string(),
                format!(
                    "echo {}",
                    escape(&format!("[{index}/{total}] compute and extract: {name}"))
                ),
                "echo ========================================".to_string(),
                "set ok=1".to_string(),
            ],
            Step::SkipIfPrepareFailed { name, index } => vec![
                format!("if defined prep_failed{index} ("),
                format!(
                    "{INDENT}echo {}",
                    escape(&format!("{name} skipped, prepare failed"))
                ),
                format!("{INDENT}goto :next_job{index}"),
                ")".to_string(),
            ],
            Step::SkipIfValidResult {
                name,
                index,
                result_file,
                output_file,
                work_folder,
            } => {
                let mut lines = vec![
                    format!("call :result_valid {}", quote_path(result_file)),
                    "if \"!valid!\"==\"1\" (".to_string(),
                    format!(
                        "{INDENT}echo {}",
                        escape(&format!("{name} already has a valid result, skipping"))
                    ),
                ];
                lines.extend(
                    reclaim(output_file, work_folder)
                        .into_iter()
                        .map(|line| format!("{INDENT}{line}")),
                );
                lines.push(format!("{INDENT}goto :next_job{index}"));
                lines.push(")".to_string());

                lines
            }
            Step::RemoveLock { lock_file } => vec![format!(
                "if exist {} del /Q {}",
                quote_path(lock_file),
                quote_path(lock_file)
            )],
            Step::Compute {
                name,
                work_dir,
                input,
                output_file,
                command: arguments,
            } => vec![
                format!("if exist {} (", quote_path(input)),
                format!("{INDENT}pushd {}", quote_path(work_dir)),
                format!("{INDENT}call {}", command(arguments)),
                format!("{INDENT}set rc=!errorlevel!"),
                format!("{INDENT}popd"),
                format!("{INDENT}if not \"!rc!\"==\"0\" set ok=0"),
                format!("{INDENT}if not exist {} set ok=0", quote_path(output_file)),
                ") else (".to_string(),
                format!("{INDENT}set rc=missing input"),
                format!("{INDENT}set ok=0"),
                ")".to_string(),
                "if \"!ok!\"==\"0\" (".to_string(),
                format!("{INDENT}echo {}", escape(&format!("ERROR: compute failed for {name}"))),
                format!(
                    "{INDENT}{}",
                    log_failure(script, Stage::Compute, name, "exit code !rc!")
                ),
                ")".to_string(),
            ],
            Step::Extract {
                name,
                work_dir,
                result_file,
                command: arguments,
            } => vec![
                "if \"!ok!\"==\"1\" (".to_string(),
                format!("{INDENT}pushd {}", quote_path(work_dir)),
                format!("{INDENT}call {}", command(arguments)),
                format!("{INDENT}set rc=!errorlevel!"),
                format!("{INDENT}popd"),
                format!("{INDENT}call :result_valid {}", quote_path(result_file)),
                format!("{INDENT}if not \"!rc!\"==\"0\" set valid=0"),
                format!("{INDENT}if \"!valid!\"==\"0\" ("),
                format!("{INDENT}{INDENT}echo {}", escape(&format!("ERROR: extract failed for {name}"))),
                format!(
                    "{INDENT}{INDENT}{}",
                    log_failure(script, Stage::Extract, name, "exit code !rc!")
                ),
                format!("{INDENT})"),
                ")".to_string(),
            ],
            Step::Cleanup {
                name,
                output_file,
                work_folder,
            } => {
                let mut lines = reclaim(output_file, work_folder);
                lines.push(format!("echo {}", escape(&format!("cleanup done for {name}"))));

                lines
            }
            Step::EndJob { index } => vec![
                String::new(),
                format!(":next_job{index}"),
                "echo.".to_string(),
            ],
        }
    }

    fn epilogue(&self, script: &ControlScript) -> Vec<String> {
        let mut lines = vec![
            "echo All jobs completed".to_string(),
            "exit /b 0".to_string(),
            String::new(),
            ":result_valid".to_string(),
            "set valid=0".to_string(),
            "if not exist \"%~1\" goto :eof".to_string(),
            format!("if %~z1 LSS {} goto :eof", script.result.min_size),
        ];

        if !script.result.markers.is_empty() {
            let patterns = script
                .result
                .markers
                .iter()
                .map(|marker| format!("/C:\"{}\"", marker.replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(format!("findstr /L {patterns} \"%~1\" >nul || goto :eof"));
        }

        lines.extend([
            "set valid=1".to_string(),
            "goto :eof".to_string(),
            String::new(),
            ":log_failure".to_string(),
            "echo %date% %time%\t%~2\t%~3>> \"%~1\"".to_string(),
            "goto :eof".to_string(),
        ]);

        lines
    }

    fn line_ending(&self) -> &'static str {
        "\r\n"
    }
}
