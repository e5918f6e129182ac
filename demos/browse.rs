// demos/browse.rs
// Run with: cargo run --example browse -- <user@host[:port]> [directory]

use std::sync::Arc;

use anyhow::{Context, anyhow};
use sftp_provider::{
    AuthMethod, Consumer, Credential, CredentialRequest, HostKey, ProviderConfig, RemotePath,
    SftpProvider, async_trait,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Answers provider prompts on the terminal.
struct ConsoleConsumer {
    key: Option<std::path::PathBuf>,
}

async fn ask(question: &str) -> Option<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(question.as_bytes()).await.ok()?;
    stdout.flush().await.ok()?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .ok()?;
    Some(line.trim().to_string())
}

#[async_trait]
impl Consumer for ConsoleConsumer {
    async fn confirm_host_key(&self, host: &str, port: u16, key: &HostKey) -> bool {
        let question = format!(
            "Host {host}:{port} presented {} key {}.\nTrust it? [y/N] ",
            key.algorithm, key.fingerprint
        );
        matches!(ask(&question).await.as_deref(), Some("y" | "Y" | "yes"))
    }

    async fn provide_credentials(&self, request: &CredentialRequest) -> Option<Credential> {
        match request.method {
            AuthMethod::PublicKey => self.key.clone().map(|path| Credential::PrivateKey {
                path,
                passphrase: None,
            }),
            AuthMethod::Password => {
                let question = format!("Password for {}@{}: ", request.user, request.host);
                ask(&question)
                    .await
                    .filter(|p| !p.is_empty())
                    .map(Credential::Password)
            }
        }
    }

    async fn confirm_overwrite(&self, from: &RemotePath, to: &RemotePath) -> bool {
        let question = format!("Replace {to} with {from}? [y/N] ");
        matches!(ask(&question).await.as_deref(), Some("y" | "Y" | "yes"))
    }
}

fn parse_target(arg: &str) -> anyhow::Result<(String, String, u16)> {
    let (user, rest) = arg
        .split_once('@')
        .ok_or_else(|| anyhow!("expected user@host[:port], got {arg}"))?;
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().context("invalid port")?),
        None => (rest, 22),
    };
    Ok((user.to_string(), host.to_string(), port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let target = args
        .next()
        .ok_or_else(|| anyhow!("usage: browse <user@host[:port]> [directory]"))?;
    let directory = RemotePath::new(&args.next().unwrap_or_else(|| "/".to_string()))?;
    let (user, host, port) = parse_target(&target)?;

    let config = match std::env::var("SFTP_PROVIDER_CONFIG") {
        Ok(file) => ProviderConfig::from_json(&tokio::fs::read_to_string(&file).await?)?,
        Err(_) => ProviderConfig::default(),
    };
    let consumer = Arc::new(ConsoleConsumer {
        key: std::env::var_os("HOME")
            .map(|home| std::path::Path::new(&home).join(".ssh/id_ed25519"))
            .filter(|key| key.exists()),
    });

    let mut provider = SftpProvider::with_russh(config);
    provider.initialize(consumer, &user, &host, port).await?;

    println!("📂 Listing {directory}...");
    for entry in provider.list(&directory).await? {
        let kind = if entry.is_directory() { 'd' } else { '-' };
        println!(
            "  {kind} {:>8} {:<8} {:>10}  {}",
            entry.owner, entry.group, entry.size, entry.filename
        );
    }

    provider.disconnect().await;
    println!("✅ Disconnected");
    Ok(())
}
