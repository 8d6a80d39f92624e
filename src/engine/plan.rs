use anyhow::Result;

use crate::config::AzudConfig;

/// Resolved intent for one `azud deploy` invocation: which image/version,
/// which roles/hosts, who's running it. Built once up front so every
/// downstream step (hooks, history, per-host state machine) reads from the
/// same immutable snapshot instead of re-deriving it.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub service: String,
    pub image: String,
    pub version: String,
    pub roles: Vec<String>,
    pub hosts: Vec<String>,
    pub performer: String,
}

impl DeploymentPlan {
    pub fn resolve(
        config: &AzudConfig,
        version_override: Option<&str>,
        roles_filter: Option<&[String]>,
    ) -> Result<Self> {
        let (repo, default_tag) = split_tag(&config.image.repository);
        // append provided version, else fall back to "latest" rather than
        // erroring — a deploy with no tag anywhere is still a valid deploy.
        let version = version_override
            .map(|v| v.to_string())
            .or(default_tag)
            .unwrap_or_else(|| "latest".to_string());

        let image = format!("{}:{}", repo, version);

        let roles: Vec<String> = match roles_filter {
            Some(filter) => filter.to_vec(),
            None => config.servers.keys().cloned().collect(),
        };

        let hosts = config.hosts_for_roles(&roles)?;
        if hosts.is_empty() {
            anyhow::bail!("no hosts resolved for roles {:?}", roles);
        }

        let performer = resolve_performer();

        Ok(Self {
            service: config.service.clone(),
            image,
            version,
            roles,
            hosts,
            performer,
        })
    }
}

/// Performer attribution for hooks/history: `$USER`, falling back to
/// `$LOGNAME`, falling back to `"unknown"`.
pub fn resolve_performer() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn split_tag(repository: &str) -> (&str, Option<String>) {
    match repository.rsplit_once(':') {
        // Guard against mistaking a registry port (`host:5000/repo`) for a tag.
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag.to_string())),
        _ => (repository, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_tag_from_repository() {
        assert_eq!(
            split_tag("registry.example.com/app:v2"),
            ("registry.example.com/app", Some("v2".to_string()))
        );
    }

    #[test]
    fn does_not_mistake_registry_port_for_tag() {
        assert_eq!(
            split_tag("registry.example.com:5000/app"),
            ("registry.example.com:5000/app", None)
        );
    }
}
