use crate::session::{parse_size, Session};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gdedupe_core::DedupeConfig;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "gdedupectl")]
#[command(about = "Create, configure and exercise in-line dedupe devices", long_about = None)]
pub struct Cli {
    /// Class configuration file (.toml or .json)
    #[arg(short, long, env = "GDEDUPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Name of the content store's backing provider
    #[arg(long, default_value = "pool0")]
    pub store: String,

    /// Size of the content store's backing provider (K/M/G/T suffixes)
    #[arg(long, default_value = "256M")]
    pub store_size: String,

    /// Back the content store with this file instead of memory
    #[arg(long)]
    pub store_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every line of a script
    Exec {
        script: PathBuf,
    },
    /// Read commands from stdin
    Shell,
}

impl Cli {
    /// Load the class configuration, falling back to defaults.
    pub fn load_config(&self) -> Result<DedupeConfig> {
        match &self.config {
            Some(path) => DedupeConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => Ok(DedupeConfig::default()),
        }
    }

    /// Build the session the subcommand runs in.
    pub async fn session(&self) -> Result<Session> {
        let config = self.load_config()?;
        let size = parse_size(&self.store_size)?;
        Session::new(config, &self.store, size, self.store_file.as_deref()).await
    }

    pub async fn run(self) -> Result<()> {
        let mut session = self.session().await?;
        let result = match self.command {
            Command::Exec { ref script } => self.exec(&mut session, script).await,
            Command::Shell => self.shell(&mut session).await,
        };
        session.shutdown().await?;
        result
    }

    async fn exec(&self, session: &mut Session, script: &PathBuf) -> Result<()> {
        let text = tokio::fs::read_to_string(script)
            .await
            .with_context(|| format!("reading {}", script.display()))?;
        let mut out = std::io::stdout();
        let errors = session.run_script(&text, &mut out).await?;
        if errors > 0 {
            tracing::warn!(errors, script = %script.display(), "script finished with errors");
        }
        Ok(())
    }

    async fn shell(&self, session: &mut Session) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut out = std::io::stdout();
        while let Some(line) = lines.next_line().await? {
            if line.trim() == "quit" || line.trim() == "exit" {
                break;
            }
            session.run_line(&line, &mut out).await?;
        }
        Ok(())
    }
}
