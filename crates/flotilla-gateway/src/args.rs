use clap::Parser;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, short = 'c', env = "FLOTILLA_CONFIG", default_value = "flotilla.json")]
    pub config: String,

    /// Override the listen address from the config file.
    #[arg(long, env = "FLOTILLA_LISTEN_ADDR")]
    pub listen_addr: Option<String>,
}
