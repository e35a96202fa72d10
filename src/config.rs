use anyhow::{Context, Result};
use std::{net::SocketAddr, path::PathBuf};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_MAX_CONTENT_CHARS: usize = 4000;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub max_content_chars: usize,
    /// Recompute the thread index from the message table before serving.
    pub rebuild_thread_index: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = lookup("HANAPP_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("HANAPP_BIND_ADDR must be a socket address like 0.0.0.0:3000")?;

        // We use ~/.hanapp/messages.db unless told otherwise
        let database_path = match lookup("HANAPP_DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let home_dir = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(".hanapp").join("messages.db")
            }
        };

        let max_content_chars = match lookup("HANAPP_MAX_CONTENT_CHARS") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .context("HANAPP_MAX_CONTENT_CHARS must be a positive integer")?,
            None => DEFAULT_MAX_CONTENT_CHARS,
        };

        let rebuild_thread_index = match lookup("HANAPP_REBUILD_THREAD_INDEX").as_deref() {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => anyhow::bail!(
                "HANAPP_REBUILD_THREAD_INDEX must be true/false/1/0, got {:?}",
                other
            ),
        };

        Ok(Self {
            bind_addr,
            database_path,
            max_content_chars,
            rebuild_thread_index,
        })
    }
}
