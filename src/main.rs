use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tandem::config::{self, Opts, Resolved};
use tandem::document::OverlayKey;
use tandem::{connect, start_server, Host};

/// Headless host: renders the replicated state into the log.
struct LogHost;

impl Host for LogHost {
    fn logged_in(&mut self, site: u16, session: &str) {
        info!(site, session, "logged in");
    }

    fn buffer_synced(&mut self, buffer: &str, mode: Option<&str>, content: &str) {
        info!(buffer, mode, chars = content.chars().count(), "buffer synced");
    }

    fn buffer_desynced(&mut self, buffer: &str) {
        info!(buffer, "buffer withdrawn");
    }

    fn remote_insert(&mut self, buffer: &str, pos: usize, text: &str) {
        debug!(buffer, pos, text, "remote insert");
    }

    fn remote_delete(&mut self, buffer: &str, pos: usize, len: usize) {
        debug!(buffer, pos, len, "remote delete");
    }

    fn remote_cursor(&mut self, buffer: &str, site: u16, point: Option<usize>, mark: Option<usize>) {
        debug!(buffer, site, point, mark, "remote cursor");
    }

    fn contact_update(&mut self, site: u16, name: Option<&str>) {
        match name {
            Some(name) => info!(site, name, "peer joined"),
            None => info!(site, "peer left"),
        }
    }

    fn focus_update(&mut self, site: u16, buffer: &str) {
        debug!(site, buffer, "peer focused buffer");
    }

    fn overlay_update(&mut self, buffer: &str, key: OverlayKey, range: Option<(usize, usize)>) {
        debug!(buffer, key.site, key.clock, ?range, "overlay changed");
    }

    fn session_ended(&mut self) {
        info!("session ended");
    }
}

#[tokio::main]
async fn main() -> Result<(), tandem::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    match config::resolve(opts)? {
        Resolved::Serve(cfg) => {
            let session =
                start_server(&format!("0.0.0.0:{}", cfg.port), cfg.options, LogHost).await?;
            for path in &cfg.shares {
                let content = std::fs::read_to_string(path)?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                session.share_buffer(name, None, content)?;
            }
            tokio::signal::ctrl_c().await?;
            session.stop();
        }
        Resolved::Join(cfg) => {
            let session = connect(&cfg.addr, cfg.options, LogHost).await?;
            tokio::signal::ctrl_c().await?;
            session.stop();
        }
    }
    Ok(())
}
