//! Buildspec retrieval.
//!
//! The buildspec lives at the root of the project repository; it is
//! fetched over HTTP from the host's raw-content endpoint at the
//! requested commit. Any failure on this path surfaces to callers as
//! `BuildspecNotFound`.

use anyhow::{Context, Result};
use async_trait::async_trait;

use ipd_core::buildspec::BUILDSPEC_FILE;

/// Fetches the buildspec document for a repository at a commit.
#[async_trait]
pub trait BuildspecFetcher: Send + Sync {
    async fn fetch(&self, repo_url: &str, commit_id: &str) -> Result<String>;
}

/// Derive the raw-content URL for a repository's buildspec, dispatching
/// on the repository host: GitHub, GitLab-style, or a generic `/raw/`
/// layout.
pub fn raw_buildspec_url(repo_url: &str, commit_id: &str) -> Result<String> {
    let url = reqwest::Url::parse(repo_url)
        .with_context(|| format!("Invalid repository URL: {}", repo_url))?;
    let host = url
        .host_str()
        .with_context(|| format!("Repository URL has no host: {}", repo_url))?;

    let path = url.path().trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);

    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    if host == "github.com" || host == "www.github.com" {
        Ok(format!(
            "https://raw.githubusercontent.com{}/{}/{}",
            path, commit_id, BUILDSPEC_FILE
        ))
    } else if host == "gitlab.com" || host.starts_with("gitlab.") {
        Ok(format!(
            "{}://{}{}/-/raw/{}/{}",
            url.scheme(),
            authority,
            path,
            commit_id,
            BUILDSPEC_FILE
        ))
    } else {
        Ok(format!(
            "{}://{}{}/raw/{}/{}",
            url.scheme(),
            authority,
            path,
            commit_id,
            BUILDSPEC_FILE
        ))
    }
}

/// HTTP buildspec fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ipd/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildspecFetcher for HttpFetcher {
    async fn fetch(&self, repo_url: &str, commit_id: &str) -> Result<String> {
        let url = raw_buildspec_url(repo_url, commit_id)?;
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("HTTP request failed: {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status, url);
        }

        resp.text()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_url() {
        let url = raw_buildspec_url("https://github.com/ex/demo.git", "abc123").unwrap();
        assert_eq!(
            url,
            "https://raw.githubusercontent.com/ex/demo/abc123/Buildspec"
        );
    }

    #[test]
    fn test_github_url_without_git_suffix() {
        let url = raw_buildspec_url("https://github.com/ex/demo", "abc").unwrap();
        assert_eq!(url, "https://raw.githubusercontent.com/ex/demo/abc/Buildspec");
    }

    #[test]
    fn test_gitlab_url() {
        let url = raw_buildspec_url("https://gitlab.com/group/demo.git", "abc").unwrap();
        assert_eq!(url, "https://gitlab.com/group/demo/-/raw/abc/Buildspec");
    }

    #[test]
    fn test_self_hosted_gitlab_url() {
        let url = raw_buildspec_url("https://gitlab.corp.net/team/demo", "c0ffee").unwrap();
        assert_eq!(
            url,
            "https://gitlab.corp.net/team/demo/-/raw/c0ffee/Buildspec"
        );
    }

    #[test]
    fn test_generic_url_keeps_port_and_scheme() {
        let url = raw_buildspec_url("http://git.internal:8443/demo.git", "abc").unwrap();
        assert_eq!(url, "http://git.internal:8443/demo/raw/abc/Buildspec");
    }

    #[test]
    fn test_trailing_slash_stripped() {
        let url = raw_buildspec_url("https://github.com/ex/demo/", "abc").unwrap();
        assert_eq!(url, "https://raw.githubusercontent.com/ex/demo/abc/Buildspec");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(raw_buildspec_url("not a url", "abc").is_err());
    }
}
