use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab")]
struct Opts {
    /// Server config file location
    #[structopt(short, long)]
    config: PathBuf,

    /// Run in foreground without daemonising
    #[structopt(short, long)]
    foreground: bool,
}

pub fn main() -> Result<(), anyhow::Error> {
    let opts = Opts::from_args();

    portico_server::run::run_server(opts.config, opts.foreground)
}
