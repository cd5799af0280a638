//! Custom package repositories
//!
//! Repositories are set up in the target before the main transaction. A
//! descriptor URL is one of:
//!
//! - a `.repo` file, downloaded into the target's `yum.repos.d`
//! - a `.rpm` release package, installed into the target root
//! - anything else, used as `baseurl` of a synthesized `.repo` file
//!
//! Every failure here is a warning; the base install can proceed without
//! the extra repositories.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{CommandRunner, CommandSpec};
use crate::config_file::RepositoryConfig;
use crate::error::Outcome;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const RELEASE_RPM_TIMEOUT: Duration = Duration::from_secs(900);

/// How a repository descriptor is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryKind {
    RepoFile,
    ReleasePackage,
    BaseUrl,
}

impl RepositoryKind {
    pub fn of(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if path.ends_with(".repo") {
            Self::RepoFile
        } else if path.ends_with(".rpm") {
            Self::ReleasePackage
        } else {
            Self::BaseUrl
        }
    }
}

/// `etc/yum.repos.d` inside the target
pub fn repos_dir(target_root: &Path) -> PathBuf {
    target_root.join("etc/yum.repos.d")
}

/// Contents of a synthesized `.repo` file
pub fn repo_file_contents(repo: &RepositoryConfig) -> String {
    let name = if repo.name.trim().is_empty() { &repo.id } else { &repo.name };
    format!(
        "[{id}]\nname={name}\nbaseurl={url}\nenabled=1\ngpgcheck=0\nskip_if_unavailable=True\n",
        id = repo.id,
        name = name,
        url = repo.url
    )
}

/// Apply every repository descriptor; failures become warnings
pub fn setup_repositories(
    runner: &dyn CommandRunner,
    target_root: &Path,
    releasever: &str,
    repos: &[RepositoryConfig],
) -> Outcome {
    let mut outcome = Outcome::clean();
    if repos.is_empty() {
        return outcome;
    }

    let dir = repos_dir(target_root);
    if let Err(e) = fs::create_dir_all(&dir) {
        outcome.warn(format!("Cannot create {}: {}", dir.display(), e));
        return outcome;
    }

    for repo in repos {
        let kind = RepositoryKind::of(&repo.url);
        tracing::info!(id = %repo.id, ?kind, "Adding repository {}", repo.url);
        let result = match kind {
            RepositoryKind::RepoFile => {
                let dest = dir.join(format!("{}.repo", repo.id));
                let spec = CommandSpec::new(
                    [
                        "curl".to_string(),
                        "-fsSL".to_string(),
                        "-o".to_string(),
                        dest.to_string_lossy().into_owned(),
                        repo.url.clone(),
                    ],
                    format!("Download repository file {}", repo.id),
                )
                .timeout(DOWNLOAD_TIMEOUT);
                runner.run(&spec).map(|_| ()).map_err(|e| e.to_string())
            }
            RepositoryKind::ReleasePackage => {
                let spec = CommandSpec::new(
                    [
                        "dnf".to_string(),
                        "install".to_string(),
                        "-y".to_string(),
                        format!("--installroot={}", target_root.display()),
                        format!("--releasever={}", releasever),
                        repo.url.clone(),
                    ],
                    format!("Install repository package {}", repo.id),
                )
                .timeout(RELEASE_RPM_TIMEOUT);
                runner.run(&spec).map(|_| ()).map_err(|e| e.to_string())
            }
            RepositoryKind::BaseUrl => {
                let dest = dir.join(format!("{}.repo", repo.id));
                fs::write(&dest, repo_file_contents(repo)).map_err(|e| e.to_string())
            }
        };

        if let Err(e) = result {
            outcome.warn(format!("Repository '{}' could not be added: {}", repo.id, e));
        }
    }
    outcome
}
