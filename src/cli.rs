use std::path::PathBuf;
use structopt::StructOpt;

use crate::transport::BackendAddress;

/// An interruption-transparent WebSocket reverse proxy.
#[derive(Debug, StructOpt)]
#[structopt(name = "pontoond")]
pub enum Pontoon {
    /// Run the proxy.
    Run(Run),
    /// Open the configuration file in an editor.
    Configure(Configure),
}

#[derive(Debug, StructOpt)]
pub struct Run {
    /// Path to the configuration file.
    #[structopt(long)]
    pub config: Option<PathBuf>,
    /// Backend addresses to register at startup, in addition to the
    /// configured ones.
    #[structopt(long = "backend")]
    pub backends: Vec<BackendAddress>,
}

#[derive(Debug, StructOpt)]
pub struct Configure {
    /// Path to the configuration file.
    #[structopt(long)]
    pub config: Option<PathBuf>,
}
