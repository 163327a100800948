use std::path::PathBuf;

use clap::Parser;

use rosterd_kubernetes::reconciler::server::{self, Config, DEFAULT_NAMESPACE};
use rosterd_trace::init::TraceConfig;

#[derive(Debug, Clone, Parser)]
pub struct ReconcilerCmd {
    #[arg(
        short = 'f',
        long = "config",
        default_value = "/etc/rosterd/config",
        help = "IPAM configuration file, watched for cron schedule changes"
    )]
    pub config: PathBuf,

    #[arg(
        short = 'n',
        long,
        default_value = DEFAULT_NAMESPACE,
        help = "Namespace holding IPPool and overlap reservations"
    )]
    pub namespace: String,

    #[arg(
        short = 'p',
        long = "http-port",
        default_value_t = 8080,
        help = "Port for the healthz/readyz/metrics endpoints"
    )]
    pub http_port: u16,
}

impl ReconcilerCmd {
    pub fn run(&self, trace: TraceConfig) {
        server::start(
            Config {
                config_file: self.config.clone(),
                namespace: self.namespace.clone(),
                http_port: self.http_port,
            },
            trace,
        );
    }
}
