use anyhow::{bail, Context, Result};
use dialoguer::{Confirm, Input};
use std::path::Path;

pub fn run() -> Result<()> {
    let config_path = Path::new("azud.toml");
    if config_path.exists() {
        bail!("azud.toml already exists in this directory");
    }

    let default_service = std::env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "myapp".to_string());

    let service: String = Input::new()
        .with_prompt("Service name")
        .default(default_service)
        .interact_text()?;

    let repository: String = Input::new()
        .with_prompt("Image repository (e.g. registry.example.com/myapp)")
        .interact_text()?;

    let proxy_host: String = Input::new()
        .with_prompt("Public hostname")
        .interact_text()?;

    let host: String = Input::new()
        .with_prompt("First deploy target host")
        .interact_text()?;

    let ssl = Confirm::new()
        .with_prompt("Terminate TLS at the proxy?")
        .default(true)
        .interact()?;

    let content = render(&service, &repository, &proxy_host, &host, ssl);
    std::fs::write(config_path, content).context("failed to write azud.toml")?;

    crate::output::success("Created azud.toml");
    crate::output::info("Edit the file to add roles, hooks, and canary settings.");
    crate::output::info("Run `azud secrets push` once you've added a [secrets] recipients list.");

    Ok(())
}

fn render(service: &str, repository: &str, proxy_host: &str, host: &str, ssl: bool) -> String {
    format!(
        r#"service = "{service}"

[image]
repository = "{repository}"

[proxy]
host = "{proxy_host}"
ssl = {ssl}
app_port = 3000
readiness_path = "/up"

[servers.web]
hosts = ["{host}"]

[ssh]
user = "deploy"

[deploy]
rollback_on_failure = true

[secrets]
recipients = []
"#
    )
}
