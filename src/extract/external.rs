use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::ArchiveKind;
use crate::errors::PipelineError;
use crate::utils::find_executable;

/// Which tool unpacks an archive, and how it is invoked.
#[derive(Debug)]
enum Tool {
    Unrar(PathBuf),
    SevenZip(PathBuf),
}

impl Tool {
    fn locate(kind: ArchiveKind) -> Option<Self> {
        if kind == ArchiveKind::Rar {
            if let Some(path) = find_executable(&["unrar"]) {
                return Some(Tool::Unrar(path));
            }
        }
        find_executable(&["7z", "7za", "7zz"]).map(Tool::SevenZip)
    }

    fn command(&self, archive_path: &Path, destination: &Path) -> Command {
        match self {
            Tool::Unrar(path) => {
                let mut cmd = Command::new(path);
                // -p- never prompts for a password; protected archives fail instead.
                cmd.arg("x").arg("-o+").arg("-p-").arg("-y").arg(archive_path);
                let mut target = destination.as_os_str().to_os_string();
                target.push("/");
                cmd.arg(target);
                cmd
            }
            Tool::SevenZip(path) => {
                let mut cmd = Command::new(path);
                let mut output_flag = std::ffi::OsString::from("-o");
                output_flag.push(destination.as_os_str());
                cmd.arg("x").arg("-y").arg("-bd").arg(output_flag).arg(archive_path);
                cmd
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Tool::Unrar(_) => "unrar",
            Tool::SevenZip(_) => "7z",
        }
    }
}

/// Extracts rar and 7z archives with the first available command-line tool.
///
/// Standard input is closed, so a password prompt reads EOF and the tool
/// exits with an error that is surfaced as the diagnostic.
pub async fn extract_with_tool(
    kind: ArchiveKind,
    archive_path: &Path,
    destination: &Path,
) -> Result<(), PipelineError> {
    let failed = |message: String, diagnostic: Option<String>| PipelineError::Extraction {
        path: archive_path.to_path_buf(),
        message,
        diagnostic,
    };

    let tool = Tool::locate(kind).ok_or_else(|| {
        failed(
            format!("no extraction tool found for {} archives (install unrar or 7z)", kind),
            None,
        )
    })?;
    run_tool(&tool, archive_path, destination).await
}

async fn run_tool(tool: &Tool, archive_path: &Path, destination: &Path) -> Result<(), PipelineError> {
    let failed = |message: String, diagnostic: Option<String>| PipelineError::Extraction {
        path: archive_path.to_path_buf(),
        message,
        diagnostic,
    };

    tokio::fs::create_dir_all(destination).await.map_err(|e| {
        failed(
            format!(
                "failed to create extraction directory {}: {}",
                destination.display(),
                e
            ),
            None,
        )
    })?;

    debug!("Running {} on {}", tool.name(), archive_path.display());
    let output = tool
        .command(archive_path, destination)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| failed(format!("failed to execute {}: {}", tool.name(), e), None))?;

    if !output.status.success() {
        let mut diagnostic = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout);
        // unrar reports password and CRC problems on stdout.
        if let Some(tail) = stdout.lines().rev().find(|l| !l.trim().is_empty()) {
            if !diagnostic.is_empty() {
                diagnostic.push('\n');
            }
            diagnostic.push_str(tail.trim());
        }
        return Err(failed(
            format!("{} exited with {}", tool.name(), output.status),
            Some(diagnostic),
        ));
    }
    Ok(())
}
