use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use stoneamqp::{setup_tracing, AppResult, Broker, BrokerConfig};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let _log_guard = setup_tracing(&commandline.log_dir, commandline.verbose);

    //setup config
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let broker_config = BrokerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", broker_config);
        return Ok(());
    }

    let mut broker = Broker::new(broker_config);
    broker.start()?;

    Ok(())
}
