use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::cache::CacheStore;
use crate::config::Settings;
use crate::session::SessionRegistry;
use crate::util::Result;

const HELP: &str = "\n=== commands ===\n\
set-dynamic-expiration <milliseconds> : set the ttl of dynamic pages\n\
set-static-expiration <milliseconds> : set the ttl of static pages\n\
clear-all : remove every cached entry\n\
stats : show cache statistics\n\
help : show this message\n\
exit : stop the server\n\
================\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetDynamicExpiration(u64),
    SetStaticExpiration(u64),
    ClearAll,
    Stats,
    Help,
    Exit,
    /// a known command with a bad argument, carries the usage line
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    /// parses one console line. blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Command> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        let arg = parts.next();

        let command = match name {
            "set-dynamic-expiration" => match arg.and_then(|a| a.parse().ok()) {
                Some(ms) => Command::SetDynamicExpiration(ms),
                None => Command::Usage("usage: set-dynamic-expiration <milliseconds>"),
            },
            "set-static-expiration" => match arg.and_then(|a| a.parse().ok()) {
                Some(ms) => Command::SetStaticExpiration(ms),
                None => Command::Usage("usage: set-static-expiration <milliseconds>"),
            },
            "clear-all" => Command::ClearAll,
            "stats" => Command::Stats,
            "help" => Command::Help,
            "exit" => Command::Exit,
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }
}

/// operator command loop over the shared cache and settings
pub struct Console {
    settings: Arc<Settings>,
    cache: Arc<CacheStore>,
    sessions: Arc<SessionRegistry>,
    shutdown: watch::Sender<bool>,
}

impl Console {
    pub fn new(
        settings: Arc<Settings>,
        cache: Arc<CacheStore>,
        sessions: Arc<SessionRegistry>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            settings,
            cache,
            sessions,
            shutdown,
        }
    }

    /// runs one command, returning the text for the operator and whether
    /// the loop should keep going
    pub fn execute(&self, command: Command) -> (String, bool) {
        match command {
            Command::SetDynamicExpiration(ms) => {
                self.settings.set_dynamic_ttl(Duration::from_millis(ms));
                info!("dynamic ttl set to {}ms", ms);
                (format!("dynamic page expiration set to {}ms\n", ms), true)
            }
            Command::SetStaticExpiration(ms) => {
                self.settings.set_static_ttl(Duration::from_millis(ms));
                info!("static ttl set to {}ms", ms);
                (format!("static page expiration set to {}ms\n", ms), true)
            }
            Command::ClearAll => {
                let removed = self.cache.len();
                self.cache.clear();
                info!("cache cleared from console, {} entries removed", removed);
                (format!("all caches cleared ({} entries)\n", removed), true)
            }
            Command::Stats => (self.stats(), true),
            Command::Help => (HELP.to_string(), true),
            Command::Exit => {
                // the receivers may already be gone during teardown
                let _ = self.shutdown.send(true);
                info!("shutdown requested from console");
                ("stopping server...\n".to_string(), false)
            }
            Command::Usage(usage) => (format!("{}\n", usage), true),
            Command::Unknown(name) => (
                format!("unknown command '{}'. type 'help' for the command list\n", name),
                true,
            ),
        }
    }

    fn stats(&self) -> String {
        let rows = self.cache.list_all();
        let dynamic = rows.iter().filter(|r| r.entry.is_dynamic()).count();
        let counters = self.cache.stats();
        format!(
            "\n=== cache statistics ===\n\
             total entries: {}\n\
             dynamic pages: {}\n\
             static pages: {}\n\
             clients: {}\n\
             dynamic expiration: {}ms\n\
             static expiration: {}ms\n\
             hits: {}\n\
             misses: {}\n\
             sessions: {}\n\
             ========================\n",
            rows.len(),
            dynamic,
            rows.len() - dynamic,
            self.cache.bucket_count(),
            self.settings.dynamic_ttl().as_millis(),
            self.settings.static_ttl().as_millis(),
            counters.hits,
            counters.misses,
            self.sessions.len(),
        )
    }

    /// reads commands line by line until `exit` or end of input. end of
    /// input leaves the server running.
    pub async fn run<R, W>(self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        output
            .write_all(b"cache console ready, type 'help' for commands\n")
            .await?;
        output.flush().await?;

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let Some(command) = Command::parse(&line) else {
                continue;
            };
            let (text, keep_going) = self.execute(command);
            output.write_all(text.as_bytes()).await?;
            output.flush().await?;
            if !keep_going {
                return Ok(());
            }
        }

        warn!("console input closed, commands are no longer accepted");
        Ok(())
    }
}
