use super::{ControlScript, Printer, Step};
use crate::job::Stage;
use std::path::Path;

/// bash printer, every Phase 2 job is a function so a resume skip is a plain `return`
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellPrinter;

const INDENT: &str = "    ";

/// POSIX single quote escaping, plain words are left alone
pub fn quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }

    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return value.to_string();
    }

    format!("'{}'", value.replace('\'', "'\\''"))
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

fn command(arguments: &[String]) -> String {
    arguments
        .iter()
        .map(|argument| quote(argument))
        .collect::<Vec<_>>()
        .join(" ")
}

fn indent(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .map(|line| {
            if line.is_empty() {
                line
            } else {
                format!("{INDENT}{line}")
            }
        })
        .collect()
}

fn log_failure(script: &ControlScript, stage: Stage, name: &str, detail: &str) -> String {
    format!(
        "log_failure {} {} {detail}",
        quote_path(&script.failure_log(stage)),
        quote(name)
    )
}

fn reclaim(output_file: &Path, work_folder: &Path) -> Vec<String> {
    vec![
        format!("rm -f {}", quote_path(output_file)),
        format!("rm -rf {}", quote_path(work_folder)),
    ]
}

impl Printer for ShellPrinter {
    fn preamble(&self, script: &ControlScript) -> Vec<String> {
        let mut lines = vec!["#!/bin/bash".to_string()];

        if let Some(header) = &script.header {
            lines.extend(header.directives(&format!("simq_{}", script.group)));
            lines.push(String::new());
            lines.extend(header.setup());
        }

        lines.push(String::new());
        lines.push(format!("mkdir -p {}", quote_path(&script.log_dir)));
        lines.push(String::new());

        // size threshold and any-of marker match, same rule as the in-process probe
        lines.push("result_valid() {".to_string());
        lines.push(format!("{INDENT}[ -f \"$1\" ] || return 1"));
        lines.push(format!(
            "{INDENT}[ \"$(wc -c < \"$1\")\" -ge {} ] || return 1",
            script.result.min_size
        ));
        if !script.result.markers.is_empty() {
            let patterns = script
                .result
                .markers
                .iter()
                .map(|marker| format!("-e {}", quote(marker)))
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(format!("{INDENT}grep -qF {patterns} \"$1\" || return 1"));
        }
        lines.push(format!("{INDENT}return 0"));
        lines.push("}".to_string());
        lines.push(String::new());

        lines.push("log_failure() {".to_string());
        lines.push(format!(
            "{INDENT}printf '%s\\t%s\\t%s\\n' \"$(date '+%Y-%m-%d %H:%M:%S')\" \"$2\" \"$3\" >> \"$1\""
        ));
        lines.push("}".to_string());
        lines.push(String::new());

        lines
    }

    fn step(&self, script: &ControlScript, step: &Step) -> Vec<String> {
        match step {
            Step::Echo(message) => vec![format!("echo {}", quote(message))],
            Step::Phase {
                number,
                title,
                jobs,
            } => vec![
                String::new(),
                "# ========================================".to_string(),
                format!("# Phase {number}: {title}"),
                "# ========================================".to_string(),
                format!("echo {}", quote(&format!("Phase {number}: {title} ({jobs} jobs)"))),
                String::new(),
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
                format!("echo {}", quote(&format!("[{index}/{total}] prepare: {name}"))),
                format!("prep_failed_{index}=0"),
                format!("if result_valid {}; then", quote_path(result_file)),
                format!("{INDENT}echo {}", quote(&format!("{name} already has a valid result"))),
                "else".to_string(),
                format!(
                    "{INDENT}(cd {} && {})",
                    quote_path(work_dir),
                    command(arguments)
                ),
                format!("{INDENT}rc=$?"),
                format!(
                    "{INDENT}if [ $rc -ne 0 ] || [ ! -f {} ]; then",
                    quote_path(input)
                ),
                format!("{INDENT}{INDENT}echo {}", quote(&format!("ERROR: prepare failed for {name}"))),
                format!(
                    "{INDENT}{INDENT}{}",
                    log_failure(script, Stage::Prepare, name, "\"exit code $rc\"")
                ),
                format!("{INDENT}{INDENT}prep_failed_{index}=1"),
                format!("{INDENT}fi"),
                "fi".to_string(),
                String::new(),
            ],
            Step::BeginJob { name, index, total } => vec![
                format!("job_{index}() {{"),
                format!("{INDENT}local ok=1"),
                format!(
                    "{INDENT}echo {}",
                    quote(&format!("[{index}/{total}] compute and extract: {name}"))
                ),
            ],
            Step::SkipIfPrepareFailed { name, index } => indent(vec![
                format!("if [ \"$prep_failed_{index}\" -eq 1 ]; then"),
                format!(
                    "{INDENT}echo {}",
                    quote(&format!("{name} skipped, prepare failed"))
                ),
                format!("{INDENT}return 0"),
                "fi".to_string(),
            ]),
            Step::SkipIfValidResult {
                name,
                index: _,
                result_file,
                output_file,
                work_folder,
            } => {
                let mut lines = vec![
                    format!("if result_valid {}; then", quote_path(result_file)),
                    format!("{INDENT}echo {}", quote(&format!("{name} already has a valid result, skipping"))),
                ];
                lines.extend(indent(reclaim(output_file, work_folder)));
                lines.push(format!("{INDENT}return 0"));
                lines.push("fi".to_string());

                indent(lines)
            }
            Step::RemoveLock { lock_file } => {
                indent(vec![format!("rm -f {}", quote_path(lock_file))])
            }
            Step::Compute {
                name,
                work_dir,
                input,
                output_file,
                command: arguments,
            } => indent(vec![
                format!("cd {} || return 1", quote_path(work_dir)),
                format!("if [ -f {} ]; then", quote_path(input)),
                format!("{INDENT}{}", command(arguments)),
                format!("{INDENT}rc=$?"),
                format!(
                    "{INDENT}if [ $rc -ne 0 ] || [ ! -f {} ]; then",
                    quote_path(output_file)
                ),
                format!("{INDENT}{INDENT}echo {}", quote(&format!("ERROR: compute failed for {name}"))),
                format!(
                    "{INDENT}{INDENT}{}",
                    log_failure(script, Stage::Compute, name, "\"exit code $rc\"")
                ),
                format!("{INDENT}{INDENT}ok=0"),
                format!("{INDENT}fi"),
                "else".to_string(),
                format!(
                    "{INDENT}echo {}",
                    quote(&format!("ERROR: input not found for {name}"))
                ),
                format!(
                    "{INDENT}{}",
                    log_failure(script, Stage::Compute, name, "'input file missing'")
                ),
                format!("{INDENT}ok=0"),
                "fi".to_string(),
            ]),
            Step::Extract {
                name,
                work_dir,
                result_file,
                command: arguments,
            } => indent(vec![
                "if [ $ok -eq 1 ]; then".to_string(),
                format!("{INDENT}(cd {} && {})", quote_path(work_dir), command(arguments)),
                format!("{INDENT}rc=$?"),
                format!(
                    "{INDENT}if [ $rc -ne 0 ] || ! result_valid {}; then",
                    quote_path(result_file)
                ),
                format!("{INDENT}{INDENT}echo {}", quote(&format!("ERROR: extract failed for {name}"))),
                format!(
                    "{INDENT}{INDENT}{}",
                    log_failure(script, Stage::Extract, name, "\"exit code $rc\"")
                ),
                format!("{INDENT}fi"),
                "fi".to_string(),
            ]),
            Step::Cleanup {
                name,
                output_file,
                work_folder,
            } => {
                let mut lines = reclaim(output_file, work_folder);
                lines.push(format!("echo {}", quote(&format!("cleanup done for {name}"))));

                indent(lines)
            }
            Step::EndJob { index } => vec![
                "}".to_string(),
                format!("job_{index}"),
                String::new(),
            ],
        }
    }

    fn epilogue(&self, _script: &ControlScript) -> Vec<String> {
        vec!["echo 'All jobs completed'".to_string()]
    }
}
