use anyhow::{bail, Result};

use super::AzudConfig;

pub fn validate(config: &AzudConfig) -> Result<()> {
    if config.service.is_empty() {
        bail!("service cannot be empty");
    }

    if config.image.repository.is_empty() {
        bail!("image.repository cannot be empty");
    }

    if config.servers.is_empty() {
        bail!("at least one role must be defined under [servers]");
    }

    let mut any_host = false;
    for (name, role) in &config.servers {
        if role.hosts.is_empty() {
            bail!("role '{}' has no hosts", name);
        }
        any_host = true;
        if let Some(cpus) = role.cpus {
            if cpus <= 0.0 {
                bail!("role '{}' has non-positive cpus limit {}", name, cpus);
            }
        }
    }
    if !any_host {
        bail!("at least one role with at least one host is required");
    }

    if config.proxy.host.is_empty() {
        bail!("proxy.host cannot be empty");
    }

    if config.proxy.ssl && config.proxy.acme_email.is_none() {
        bail!("proxy.ssl is enabled but no proxy.acme_email is configured");
    }

    let canary = &config.deploy.canary;
    if canary.initial_weight > 100 {
        bail!(
            "deploy.canary.initial_weight must be in 0..=100, got {}",
            canary.initial_weight
        );
    }
    if canary.step_weight == 0 || canary.step_weight > 100 {
        bail!(
            "deploy.canary.step_weight must be in 1..=100, got {}",
            canary.step_weight
        );
    }

    if config.ssh.require_trusted_fingerprints {
        for host in config.all_hosts() {
            if !config.ssh.fingerprints.contains_key(&host) {
                bail!(
                    "ssh.require_trusted_fingerprints is set but host '{}' has no entry under ssh.fingerprints",
                    host
                );
            }
        }
    }

    if let Some(bastion) = &config.ssh.bastion {
        if bastion.host.is_empty() {
            bail!("ssh.bastion.host cannot be empty when [ssh.bastion] is present");
        }
    }

    for secret_key in &config.env.secret {
        if secret_key.is_empty() {
            bail!("env.secret contains an empty key name");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_config() -> AzudConfig {
        let mut servers = HashMap::new();
        servers.insert(
            "web".to_string(),
            super::super::RoleConfig {
                hosts: vec!["10.0.0.1".to_string()],
                ..Default::default()
            },
        );
        AzudConfig {
            service: "api".to_string(),
            image: super::super::ImageConfig {
                repository: "registry.example.com/api:latest".to_string(),
            },
            registry: None,
            servers,
            proxy: super::super::ProxyConfig {
                host: "api.example.com".to_string(),
                alternate_hosts: vec![],
                ssl: false,
                acme_email: None,
                app_port: 3000,
                readiness_path: "/up".to_string(),
                liveness_path: Some("/up".to_string()),
                liveness_command: None,
                interval_secs: 2,
                timeout_secs: 5,
                helper_image: "curlimages/curl:latest".to_string(),
                helper_pull_policy: "missing".to_string(),
            },
            env: Default::default(),
            deploy: Default::default(),
            ssh: Default::default(),
            hooks: Default::default(),
            secrets: Default::default(),
        }
    }

    #[test]
    fn rejects_empty_servers() {
        let mut config = base_config();
        config.servers.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_ssl_without_acme_email() {
        let mut config = base_config();
        config.proxy.ssl = true;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn accepts_ssl_with_acme_email() {
        let mut config = base_config();
        config.proxy.ssl = true;
        config.proxy.acme_email = Some("ops@example.com".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn rejects_out_of_range_canary_weight() {
        let mut config = base_config();
        config.deploy.canary.initial_weight = 150;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_missing_fingerprint_when_required() {
        let mut config = base_config();
        config.ssh.require_trusted_fingerprints = true;
        assert!(validate(&config).is_err());
        config
            .ssh
            .fingerprints
            .insert("10.0.0.1".to_string(), "SHA256:abc".to_string());
        assert!(validate(&config).is_ok());
    }
}
