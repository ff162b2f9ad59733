//! Out-of-process compilation driver.
//!
//! Runs `latexmk` in a job's working directory under a wall-clock timeout.
//! The toolchain executes as its own process group so the whole tree can be
//! killed on timeout, and the driver takes every input by value so it holds
//! no shared state with the scheduler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

/// Number of trailing log lines returned on failure.
pub const LOG_TAIL_LINES: usize = 50;

/// Toolchain engine selector. Unknown names coerce to pdflatex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Engine {
    #[default]
    Pdflatex,
    Xelatex,
    Lualatex,
}

impl Engine {
    pub fn from_name(name: &str) -> Self {
        match name {
            "xelatex" => Engine::Xelatex,
            "lualatex" => Engine::Lualatex,
            _ => Engine::Pdflatex,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Engine::Pdflatex => "pdflatex",
            Engine::Xelatex => "xelatex",
            Engine::Lualatex => "lualatex",
        }
    }

    fn latexmk_flag(self) -> &'static str {
        match self {
            Engine::Pdflatex => "-pdf",
            Engine::Xelatex => "-xelatex",
            Engine::Lualatex => "-lualatex",
        }
    }
}

/// By-value description of one compilation. Everything a worker needs.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub work_dir: PathBuf,
    pub entrypoint: String,
    pub timeout_secs: u64,
    pub engine: Engine,
    pub halt_on_error: bool,
}

#[derive(Debug)]
pub enum CompileOutcome {
    Success { pdf: Vec<u8> },
    Failure { log_tail: String },
}

impl CompileOutcome {
    fn failure(log_tail: impl Into<String>) -> Self {
        CompileOutcome::Failure {
            log_tail: log_tail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Success { .. })
    }
}

/// Drop guard that kills the entire process group (not just the leader PID).
///
/// The child is spawned with `process_group(0)`, so latexmk's own children
/// (the TeX engine, bibtex) live in the same group. Killing the negative PID
/// reaches all of them; killing only the leader would leave orphans running
/// after a timeout.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
}

fn latexmk_args(engine: Engine, halt_on_error: bool, entry_file: &str) -> Vec<String> {
    let mut args = vec![
        engine.latexmk_flag().to_string(),
        "-interaction=nonstopmode".to_string(),
        "-outdir=.".to_string(),
    ];
    if halt_on_error {
        args.push("-halt-on-error".to_string());
    }
    args.push(entry_file.to_string());
    args
}

/// Run latexmk for `req` and normalize the result.
///
/// Absence of the output PDF is the authoritative failure signal: a non-zero
/// exit with a PDF on disk is still a success. Toolchain problems short of a
/// produced PDF (missing entrypoint, timeout, spawn failure) come back as
/// `Failure` with a diagnostic log tail, never as an error.
pub async fn compile_latex(req: CompileRequest) -> CompileOutcome {
    let entrypoint_path = req.work_dir.join(&req.entrypoint);
    if !entrypoint_path.exists() {
        return CompileOutcome::failure(format!("Entrypoint not found: {}", req.entrypoint));
    }

    // latexmk runs in the entrypoint's parent with the bare file name as its
    // input and "." as its output directory.
    let compile_cwd = entrypoint_path
        .parent()
        .map_or_else(|| req.work_dir.clone(), Path::to_path_buf);
    let entry_file = entrypoint_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| req.entrypoint.clone());

    fix_flat_references(&compile_cwd);

    let args = latexmk_args(req.engine, req.halt_on_error, &entry_file);
    tracing::info!(
        engine = req.engine.name(),
        cwd = %compile_cwd.display(),
        timeout_secs = req.timeout_secs,
        "running latexmk"
    );

    let mut cmd = Command::new("latexmk");
    cmd.args(&args)
        .current_dir(&compile_cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return CompileOutcome::failure(format!("failed to spawn latexmk: {e}")),
    };
    let _pg_guard = ProcessGroupGuard { pid: child.id() };

    let timeout = Duration::from_secs(req.timeout_secs);
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return CompileOutcome::failure(format!("failed to run latexmk: {e}")),
        Err(_) => {
            // The guard SIGKILLs the process group on return.
            return CompileOutcome::failure(format!(
                "Compilation timed out after {}s",
                req.timeout_secs
            ));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    tracing::debug!(code = output.status.code().unwrap_or(-1), "latexmk exited");

    let stem = entrypoint_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| entry_file.clone());

    let pdf_path = compile_cwd.join(format!("{stem}.pdf"));
    if pdf_path.exists() {
        return match std::fs::read(&pdf_path) {
            Ok(pdf) => CompileOutcome::Success { pdf },
            Err(e) => CompileOutcome::failure(format!("failed to read output pdf: {e}")),
        };
    }

    // Prefer the toolchain's own log file; fall back to captured output.
    let log_path = compile_cwd.join(format!("{stem}.log"));
    let log_text = match std::fs::read(&log_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => format!("{stdout}\n{stderr}"),
    };
    CompileOutcome::failure(tail_lines(&log_text, LOG_TAIL_LINES))
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

static REF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\\(?:includegraphics|input|include|bibliography|addbibresource)(?:\[[^\]]*\])?\{([^}]+)\}",
    )
    .expect("reference pattern is valid")
});

/// Repair flat file layouts before invoking the toolchain.
///
/// Naive packers flatten `images/logo.png` to a root-level `logo.png` while
/// the sources keep referencing the subdirectory path. For every reference in
/// a root-level `.tex` file that is missing on disk but whose basename exists
/// at the root, create the parent directories and a symlink at the referenced
/// path. The pass only creates directories and links: it never writes
/// content, never overwrites, and ignores references escaping the working
/// directory (the toolchain reports those itself).
fn fix_flat_references(work_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return;
    };
    let mut root_files: HashMap<String, PathBuf> = HashMap::new();
    let mut tex_files: Vec<PathBuf> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            root_files.insert(name.to_string(), path.clone());
        }
        if path.extension().is_some_and(|ext| ext == "tex") {
            tex_files.push(path);
        }
    }

    for tex_file in tex_files {
        let Ok(bytes) = std::fs::read(&tex_file) else {
            continue;
        };
        let text = String::from_utf8_lossy(&bytes);
        for cap in REF_PATTERN.captures_iter(&text) {
            let reference = cap[1].trim();
            let ref_path = Path::new(reference);
            if ref_path.is_absolute()
                || ref_path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                continue;
            }
            let link = work_dir.join(ref_path);
            // symlink_metadata rather than exists: a dangling link at the
            // referenced path still counts as present.
            if link.symlink_metadata().is_ok() {
                continue;
            }
            let Some(basename) = ref_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(root_file) = root_files.get(basename) else {
                continue;
            };
            if let Some(parent) = link.parent()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                tracing::warn!("reference repair: cannot create {}: {e}", parent.display());
                continue;
            }
            match std::os::unix::fs::symlink(root_file, &link) {
                Ok(()) => tracing::info!(
                    "reference repair: symlinked {reference} -> {}",
                    root_file.display()
                ),
                Err(e) => tracing::warn!("reference repair: cannot link {reference}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_engine_names_coerce_to_pdflatex() {
        assert_eq!(Engine::from_name("xelatex"), Engine::Xelatex);
        assert_eq!(Engine::from_name("lualatex"), Engine::Lualatex);
        assert_eq!(Engine::from_name("pdflatex"), Engine::Pdflatex);
        assert_eq!(Engine::from_name("tectonic"), Engine::Pdflatex);
        assert_eq!(Engine::from_name(""), Engine::Pdflatex);
    }

    #[test]
    fn halt_on_error_flag_sits_before_the_entrypoint() {
        let args = latexmk_args(Engine::Xelatex, true, "main.tex");
        assert_eq!(
            args,
            vec![
                "-xelatex",
                "-interaction=nonstopmode",
                "-outdir=.",
                "-halt-on-error",
                "main.tex",
            ]
        );

        let args = latexmk_args(Engine::Pdflatex, false, "paper.tex");
        assert_eq!(
            args,
            vec!["-pdf", "-interaction=nonstopmode", "-outdir=.", "paper.tex"]
        );
    }

    #[test]
    fn tail_keeps_only_the_last_lines() {
        let text: String = (0..80).map(|i| format!("line {i}\n")).collect();
        let tail = tail_lines(&text, LOG_TAIL_LINES);
        assert_eq!(tail.lines().count(), LOG_TAIL_LINES);
        assert!(tail.starts_with("line 30"));
        assert!(tail.ends_with("line 79"));

        assert_eq!(tail_lines("  one\ntwo  ", 50), "one\ntwo");
    }

    #[tokio::test]
    async fn missing_entrypoint_is_a_failure_with_a_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = compile_latex(CompileRequest {
            work_dir: dir.path().to_path_buf(),
            entrypoint: "main.tex".to_string(),
            timeout_secs: 5,
            engine: Engine::Pdflatex,
            halt_on_error: false,
        })
        .await;
        match outcome {
            CompileOutcome::Failure { log_tail } => {
                assert_eq!(log_tail, "Entrypoint not found: main.tex");
            }
            CompileOutcome::Success { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn repair_links_flat_files_to_referenced_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.tex"),
            r"\documentclass{article}\begin{document}\includegraphics[width=1cm]{images/logo.png}\end{document}",
        )
        .unwrap();
        std::fs::write(dir.path().join("logo.png"), b"png").unwrap();

        fix_flat_references(dir.path());

        let link = dir.path().join("images/logo.png");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&link).unwrap(), b"png");

        // Running again must not fail or replace the link.
        fix_flat_references(dir.path());
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn repair_ignores_escaping_and_satisfied_references() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.tex"),
            r"\input{../outside.tex}\include{chapters/one}\bibliography{refs.bib}",
        )
        .unwrap();
        std::fs::write(dir.path().join("refs.bib"), b"@misc{x}").unwrap();
        std::fs::create_dir_all(dir.path().join("chapters")).unwrap();
        std::fs::write(dir.path().join("chapters/one"), b"ch").unwrap();

        fix_flat_references(dir.path());

        // Escaping reference untouched, satisfied reference untouched,
        // root-level reference needs no link.
        assert!(!dir.path().join("../outside.tex").exists());
        assert!(
            !dir
                .path()
                .join("chapters/one")
                .symlink_metadata()
                .unwrap()
                .file_type()
                .is_symlink()
        );
    }
}
