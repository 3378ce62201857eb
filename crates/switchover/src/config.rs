use super::DeadlineConfig;
use derivative::Derivative;

/// Arguments of a process which participates in switchovers.
#[derive(Derivative, Clone, clap::Args)]
#[derivative(Debug)]
pub struct HandlerArgs {
    /// URL of the current postgres database.
    #[derivative(Debug = "ignore")]
    #[clap(long = "database", env = "DATABASE_URL")]
    pub database_url: url::Url,
    /// URL of the postgres database to switch over to.
    #[derivative(Debug = "ignore")]
    #[clap(long = "database-next", env = "DATABASE_URL_NEXT")]
    pub database_next_url: url::Url,
    /// Path to CA certificate of the databases.
    #[clap(long = "database-ca", env = "DATABASE_CA")]
    pub database_ca: Option<String>,
    /// Unique ID of this node. Defaults to a random UUID.
    #[clap(long = "node-id", env = "SWITCHOVER_NODE_ID")]
    pub node_id: Option<String>,
    /// Maximum number of pooled database connections.
    #[clap(long = "max-connections", default_value = "16")]
    pub max_connections: usize,
    /// Application name reported to the databases.
    #[clap(long = "application-name", default_value = "switchover")]
    pub application_name: String,
}

/// Arguments of an operator starting a switchover.
#[derive(Debug, Clone, clap::Args)]
pub struct DeadlineArgs {
    /// Time allowed for every node to arm.
    #[clap(long = "consensus-timeout", default_value = "3s")]
    #[arg(value_parser = humantime::parse_duration)]
    pub consensus_timeout: std::time::Duration,
    /// Delay from the start of the switchover until nodes pause.
    #[clap(long = "pause-delay", default_value = "5s")]
    #[arg(value_parser = humantime::parse_duration)]
    pub pause_delay: std::time::Duration,
    /// Time allowed for each node to pause.
    #[clap(long = "pause-timeout", default_value = "10s")]
    #[arg(value_parser = humantime::parse_duration)]
    pub pause_timeout: std::time::Duration,
    /// Maximum time the fleet may remain paused.
    #[clap(long = "max-pause", default_value = "13s")]
    #[arg(value_parser = humantime::parse_duration)]
    pub max_pause: std::time::Duration,
    /// Keep serving the API while paused.
    #[clap(long = "allow-api")]
    pub allow_api: bool,
}

impl DeadlineArgs {
    /// Deadlines of a switchover beginning now.
    pub fn config(&self) -> DeadlineConfig {
        DeadlineConfig {
            consensus_timeout: self.consensus_timeout,
            pause_delay: self.pause_delay,
            pause_timeout: self.pause_timeout,
            max_pause: self.max_pause,
            no_pause_api: self.allow_api,
            ..Default::default()
        }
    }
}
