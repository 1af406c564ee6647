//! Best-effort publishing of the output directory to a hub model repository over git

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::{self, JoinHandle};

const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
const IGNORED_PATTERNS: [&str; 2] = ["step_*", "epoch_*"];

pub struct HubRepository {
    repo_dir: PathBuf,
    repo_id: String,
}

/// `hub_model_id` when given, otherwise the output directory's name
pub fn repo_id(hub_model_id: Option<&str>, output_dir: &Path) -> String {
    match hub_model_id {
        Some(id) => id.to_string(),
        None => output_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "dreambooth-model".to_string()),
    }
}

fn remote_url(repo_id: &str, token: Option<&str>) -> String {
    let endpoint = std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
    match (token, endpoint.strip_prefix("https://")) {
        (Some(token), Some(host)) => format!("https://user:{}@{}/{}", token, host, repo_id),
        _ => format!("{}/{}", endpoint, repo_id),
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("Failed to run git {}", args.first().copied().unwrap_or_default()))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Append the ignore patterns that are not already listed
pub fn ensure_gitignore(repo_dir: &Path) -> Result<()> {
    let path = repo_dir.join(".gitignore");
    let existing = if path.exists() { fs::read_to_string(&path)? } else { String::new() };
    let mut content = existing.clone();
    for pattern in IGNORED_PATTERNS {
        if !existing.lines().any(|line| line.trim() == pattern) {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(pattern);
            content.push('\n');
        }
    }
    if content != existing {
        fs::write(&path, content)?;
    }
    Ok(())
}

impl HubRepository {
    /// Make `output_dir` a clone of the hub repository. Runs once, on the main
    /// process, before training starts.
    pub fn prepare(output_dir: &Path, repo_id: &str, token: Option<&str>) -> Result<Self> {
        Self::prepare_with_remote(output_dir, repo_id, &remote_url(repo_id, token))
    }

    /// Same as [`HubRepository::prepare`] with an explicit git remote
    pub fn prepare_with_remote(output_dir: &Path, repo_id: &str, url: &str) -> Result<Self> {
        let is_empty = !output_dir.exists() || fs::read_dir(output_dir)?.next().is_none();

        if output_dir.join(".git").exists() {
            info!("Reusing existing git checkout in {}", output_dir.display());
        } else if is_empty {
            fs::create_dir_all(output_dir)?;
            git(output_dir, &["clone", url, "."])
                .with_context(|| format!("Failed to clone hub repository {}", repo_id))?;
        } else {
            git(output_dir, &["init"])?;
            git(output_dir, &["remote", "add", "origin", url])?;
            warn!(
                "{} was not empty; initialised it as a git repository pointing at {}",
                output_dir.display(),
                repo_id
            );
        }

        ensure_gitignore(output_dir)?;
        Ok(Self {
            repo_dir: output_dir.to_path_buf(),
            repo_id: repo_id.to_string(),
        })
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    /// Commit and push on a background thread. Failures are logged and never
    /// retried; callers need not join the handle.
    pub fn push_in_background(&self, commit_message: &str) -> JoinHandle<()> {
        let repo_dir = self.repo_dir.clone();
        let repo_id = self.repo_id.clone();
        let message = commit_message.to_string();
        thread::spawn(move || match push(&repo_dir, &message) {
            Ok(()) => info!("Pushed {} to the hub", repo_id),
            Err(e) => error!("Push to {} failed: {:#}", repo_id, e),
        })
    }
}

fn push(repo_dir: &Path, message: &str) -> Result<()> {
    git(repo_dir, &["add", "--all"])?;
    git(repo_dir, &["commit", "-m", message])?;
    git(repo_dir, &["push", "origin", "HEAD"])?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn git_available() -> bool {
        Command::new("git").arg("--version").output().map_or(false, |o| o.status.success())
    }

    /// Bare repository standing in for the hub remote
    pub(crate) fn bare_remote(root: &Path) -> Result<String> {
        let remote = root.join("remote.git");
        fs::create_dir_all(&remote)?;
        git(&remote, &["init", "--bare", "--quiet"])?;
        Ok(remote.display().to_string())
    }

    pub(crate) fn set_identity(repo_dir: &Path) -> Result<()> {
        git(repo_dir, &["config", "user.name", "dreamtrainer"])?;
        git(repo_dir, &["config", "user.email", "dreamtrainer@localhost"])?;
        Ok(())
    }

    /// Commit subjects on every ref of `remote`
    pub(crate) fn remote_subjects(remote: &str) -> Result<String> {
        let output = Command::new("git")
            .args(["--git-dir", remote, "log", "--all", "--format=%s"])
            .output()?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    #[test]
    fn test_push_reaches_remote() -> Result<()> {
        if !git_available() {
            return Ok(());
        }
        let root = tempfile::tempdir()?;
        let remote = bare_remote(root.path())?;
        let output_dir = root.path().join("out");

        let repo = HubRepository::prepare_with_remote(&output_dir, "me/sks-dog", &remote)?;
        set_identity(&output_dir)?;
        fs::write(output_dir.join("model_index.json"), "{}")?;

        assert!(repo.push_in_background("End of training").join().is_ok());
        assert!(remote_subjects(&remote)?.lines().any(|s| s == "End of training"));
        Ok(())
    }

    #[test]
    fn test_repo_id_defaults_to_output_dir_name() {
        assert_eq!(repo_id(Some("me/sks-dog"), Path::new("out")), "me/sks-dog");
        assert_eq!(repo_id(None, Path::new("/tmp/runs/sks-dog")), "sks-dog");
    }

    #[test]
    fn test_gitignore_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(".gitignore"), "*.log")?;
        ensure_gitignore(dir.path())?;
        ensure_gitignore(dir.path())?;
        let content = fs::read_to_string(dir.path().join(".gitignore"))?;
        assert_eq!(content, "*.log\nstep_*\nepoch_*\n");
        Ok(())
    }

    #[test]
    fn test_failed_push_does_not_panic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = HubRepository {
            repo_dir: dir.path().join("missing"),
            repo_id: "me/nothing".to_string(),
        };
        assert!(repo.push_in_background("End of training").join().is_ok());
        Ok(())
    }
}
