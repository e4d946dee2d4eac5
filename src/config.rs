use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::{BadConfigSnafu, Result};
use crate::session::SessionOptions;

pub const DEFAULT_PORT: u16 = 6530;

#[derive(Debug, Parser)]
#[command(
    name = "tandem",
    version,
    about = "Collaborative text editing over a star topology"
)]
pub struct Opts {
    /**
    Path to a TOML config file.
    Command-line flags take precedence over values from the file.
    */
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Host a session and share files as buffers.
    Serve {
        /// Port to listen on.
        #[arg(short, long)]
        port: Option<u16>,

        /// Name announced to joining peers.
        #[arg(long)]
        session_name: Option<String>,

        /// Name shown in peer contact lists.
        #[arg(long)]
        display_name: Option<String>,

        /// Require this password from joining peers.
        #[arg(long)]
        password: Option<String>,

        /// Files to share; buffer names are the file names.
        #[arg(value_name = "FILE")]
        shares: Vec<PathBuf>,
    },
    /// Join a session hosted elsewhere.
    Join {
        /// host:port of the serving peer.
        addr: String,

        /// Name shown in peer contact lists.
        #[arg(long)]
        display_name: Option<String>,

        /// Password for the session, if it has one.
        #[arg(long)]
        password: Option<String>,
    },
}

/**
Contents of a config file. Every field is optional; the command line wins
whenever both specify a value.
*/
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub session_name: Option<String>,
    pub display_name: Option<String>,
    pub password: Option<String>,
    pub shares: Vec<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<FileConfig> {
        let text = read_to_string(path)?;
        toml::from_str(&text).map_err(|err| {
            BadConfigSnafu {
                detail: err.to_string(),
            }
            .build()
        })
    }
}

#[derive(Debug)]
pub struct ServeConfig {
    pub port: u16,
    pub options: SessionOptions,
    pub shares: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct JoinConfig {
    pub addr: String,
    pub options: SessionOptions,
}

#[derive(Debug)]
pub enum Resolved {
    Serve(ServeConfig),
    Join(JoinConfig),
}

/// Merges the command line with the config file, if any.
pub fn resolve(opts: Opts) -> Result<Resolved> {
    let file = match &opts.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    match opts.command {
        Cmd::Serve {
            port,
            session_name,
            display_name,
            password,
            shares,
        } => Ok(Resolved::Serve(ServeConfig {
            port: port.or(file.port).unwrap_or(DEFAULT_PORT),
            options: SessionOptions {
                session_name: session_name
                    .or(file.session_name)
                    .unwrap_or_else(|| "tandem".to_owned()),
                display_name: display_name
                    .or(file.display_name)
                    .unwrap_or_else(|| "host".to_owned()),
                password: password.or(file.password),
            },
            shares: if shares.is_empty() {
                file.shares
            } else {
                shares
            },
        })),
        Cmd::Join {
            addr,
            display_name,
            password,
        } => Ok(Resolved::Join(JoinConfig {
            addr,
            options: SessionOptions {
                session_name: String::new(),
                display_name: display_name
                    .or(file.display_name)
                    .unwrap_or_else(|| "guest".to_owned()),
                password: password.or(file.password),
            },
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_parses() {
        let parsed: FileConfig = toml::from_str(
            r#"
            port = 7000
            session_name = "standup"
            password = "pw"
            shares = ["notes.txt", "todo.txt"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.port, Some(7000));
        assert_eq!(parsed.session_name.as_deref(), Some("standup"));
        assert_eq!(parsed.display_name, None);
        assert_eq!(parsed.shares.len(), 2);
    }

    #[test]
    fn file_config_rejects_unknown_keys() {
        assert!(toml::from_str::<FileConfig>("listen_port = 7000").is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let opts = Opts::parse_from([
            "tandem",
            "serve",
            "--port",
            "9000",
            "--session-name",
            "standup",
            "notes.txt",
        ]);
        match resolve(opts).unwrap() {
            Resolved::Serve(cfg) => {
                assert_eq!(cfg.port, 9000);
                assert_eq!(cfg.options.session_name, "standup");
                assert_eq!(cfg.options.display_name, "host");
                assert_eq!(cfg.options.password, None);
                assert_eq!(cfg.shares, vec![PathBuf::from("notes.txt")]);
            }
            other => panic!("expected serve config, got {other:?}"),
        }
    }

    #[test]
    fn join_takes_an_address() {
        let opts = Opts::parse_from(["tandem", "join", "127.0.0.1:6530", "--password", "pw"]);
        match resolve(opts).unwrap() {
            Resolved::Join(cfg) => {
                assert_eq!(cfg.addr, "127.0.0.1:6530");
                assert_eq!(cfg.options.password.as_deref(), Some("pw"));
            }
            other => panic!("expected join config, got {other:?}"),
        }
    }
}
