//! `devcontainer` CLI invocation and output parsing.

use serde::Deserialize;

use super::{BuildRequest, CONFIG_DIR, VOLUME_MOUNT, run_command};
use crate::errors::{PreflightError, RuntimeError};

pub const DEVCONTAINER_CMD_ENV: &str = "DEVCONTAINER_CMD";
const DEFAULT_DEVCONTAINER_CMD: &str = "devcontainer";

/// The CLI to invoke: `DEVCONTAINER_CMD`, or `devcontainer` on `PATH`.
pub fn devcontainer_cmd() -> String {
    std::env::var(DEVCONTAINER_CMD_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DEVCONTAINER_CMD.to_string())
}

/// Pre-flight: the CLI must run. Returns its version string.
pub async fn check_available(cmd: &str) -> Result<String, PreflightError> {
    let missing = || PreflightError::BuildToolMissing {
        command: cmd.to_string(),
    };
    let output = run_command(cmd, &["--version".to_string()], None, None)
        .await
        .map_err(|_| missing())?;
    if !output.success() {
        return Err(missing());
    }
    Ok(output.stdout.trim().to_string())
}

/// Arguments for `devcontainer up`.
///
/// Identity labels go through `--id-label` so they are applied at container
/// creation; a failed build never leaves a container carrying the new hash.
pub fn up_args(request: &BuildRequest) -> Vec<String> {
    let mut args = vec![
        "up".to_string(),
        "--workspace-folder".to_string(),
        request.workspace_folder.display().to_string(),
        "--config".to_string(),
        request
            .workspace_folder
            .join(CONFIG_DIR)
            .join("devcontainer.json")
            .display()
            .to_string(),
    ];
    for (key, value) in request.labels() {
        args.push("--id-label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push("--mount".to_string());
    args.push(format!(
        "type=volume,source={},target={}",
        request.volume, VOLUME_MOUNT
    ));
    if request.remove_existing {
        args.push("--remove-existing-container".to_string());
    }
    args
}

/// Final JSON line printed by `devcontainer up`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpResult {
    pub outcome: String,
    pub container_id: Option<String>,
    pub remote_workspace_folder: Option<String>,
    pub message: Option<String>,
}

/// Parse the last JSON object line of `devcontainer up` stdout.
pub fn parse_up_output(stdout: &str) -> Result<UpResult, RuntimeError> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<UpResult>(line).ok())
        .ok_or_else(|| {
            RuntimeError::UnexpectedOutput("no result line in devcontainer up output".into())
        })
}
