//! Shared CLI helpers and small reusable Clap fragments

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::admin::AdminRequest;
use crate::config::MasterConfig;

/// Options of the master daemon
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "fleetsync master: keeps workers in line with the golden tree")]
pub struct MasterOpts {
    /// Configuration file (TOML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Bind address for worker connections (host:port); overrides the config
    #[arg(long)]
    pub bind: Option<String>,

    /// Managed root directory; overrides the config
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl MasterOpts {
    /// Config file (or defaults) with command-line overrides applied
    pub fn load_config(&self) -> anyhow::Result<MasterConfig> {
        let mut config = match &self.config {
            Some(path) => MasterConfig::load(path)?,
            None => MasterConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Options of the admin client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Query a running fleetsync master")]
pub struct CtlOpts {
    /// Admin socket of the master; defaults to the config default
    #[arg(long, short = 's')]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum CtlCommand {
    /// Connected nodes, including the master
    Nodes {
        /// Only these nodes
        names: Vec<String>,
    },
    /// Integrity records per node
    Files {
        /// Only these nodes
        #[arg(long = "node")]
        nodes: Vec<String>,
        /// Only these paths
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Agent inventory
    Agents {
        #[arg(long)]
        status: Option<String>,
    },
    /// Ask workers to start a sync
    Sync {
        /// Only these nodes; all when empty
        names: Vec<String>,
    },
    /// Relay a raw command to one node or to "all"
    Forward {
        target: String,
        request: String,
        #[arg(default_value = "")]
        payload: String,
    },
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
    if v.is_empty() {
        None
    } else {
        Some(v.to_vec())
    }
}

impl CtlCommand {
    pub fn to_request(&self) -> AdminRequest {
        match self {
            CtlCommand::Nodes { names } => AdminRequest::GetNodes {
                nodes: non_empty(names),
            },
            CtlCommand::Files { nodes, files } => AdminRequest::GetFiles {
                files: non_empty(files),
                nodes: non_empty(nodes),
            },
            CtlCommand::Agents { status } => AdminRequest::GetAgents {
                status: status.clone(),
            },
            CtlCommand::Sync { names } => AdminRequest::Sync {
                nodes: non_empty(names),
            },
            CtlCommand::Forward {
                target,
                request,
                payload,
            } => AdminRequest::Forward {
                request: request.clone(),
                target: target.clone(),
                payload: payload.clone(),
            },
        }
    }
}

/// Default tracing filter for a `-v` count
pub fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_commands_map_to_admin_requests() {
        let opts = CtlOpts::parse_from(["fleetctl", "files", "--node", "worker-1", "--file", "etc/shared/agent.conf"]);
        assert_eq!(
            opts.command.to_request(),
            AdminRequest::GetFiles {
                files: Some(vec!["etc/shared/agent.conf".into()]),
                nodes: Some(vec!["worker-1".into()]),
            }
        );

        let opts = CtlOpts::parse_from(["fleetctl", "--socket", "/tmp/a.sock", "sync"]);
        assert_eq!(opts.socket.as_deref(), Some(std::path::Path::new("/tmp/a.sock")));
        assert_eq!(opts.command.to_request(), AdminRequest::Sync { nodes: None });
    }

    #[test]
    fn master_overrides_apply() {
        let opts = MasterOpts::parse_from(["fleetsyncd", "--bind", "127.0.0.1:9000", "--root", "/srv/tree", "-vv"]);
        let config = opts.load_config().unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.root, PathBuf::from("/srv/tree"));
        assert_eq!(log_filter(opts.verbose), "trace");
    }
}
