use clap::Parser;

use postgate::{
    config::Config,
    controller::{self, Controller, Settings},
    internal, logging,
};

#[derive(Parser)]
#[command(name = "postgate", version, about = "An asynchronous SMTP policy daemon")]
struct Cli {
    /// Address to listen on
    #[arg(short = 'l', long = "listen-address", default_value = "0.0.0.0")]
    listen_address: std::net::IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 2525)]
    port: u16,

    /// Worker processes; 1 runs everything in this process
    #[arg(short = 'j', long, default_value_t = 1)]
    procs: u32,

    /// Drop privileges to this user after binding
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Verbose logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Accepted for compatibility with older init scripts
    #[arg(long = "use-poll")]
    use_poll: bool,

    /// Configuration file
    #[arg(short = 'c', long = "config", default_value = "postgate.toml")]
    config: std::path::PathBuf,
}

fn main() {
    let cli = Cli::parse();

    controller::sanitize_env();
    logging::init(cli.debug);

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            internal!(level = ERROR, "{err}");
            std::process::exit(2);
        }
    };

    let controller = Controller::new(
        Settings {
            listen: cli.listen_address,
            port: cli.port,
            procs: cli.procs,
            user: cli.user,
            use_poll: cli.use_poll,
            config_path: cli.config,
        },
        config,
    );

    if let Err(err) = controller.run() {
        internal!(level = ERROR, "{err:#}");
        std::process::exit(1);
    }
}
