mod fit_pddbm;

use fit_pddbm::*;

use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LUPIN",
    long_about = "Layered spike-and-slab coding Under a Partially directed deep boltzmann machINe\n\
		  Learns an S3C dictionary with a DBM prior over its spikes\n\
		  by mean-field inference and stochastic gradient ascent."
)]
struct Cli {
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train a PD-DBM on a data matrix",
        long_about = "Train a PD-DBM in minibatches: \n\
		      (1) Read a delimited data matrix or simulate one\n\
		      (2) Run mean-field inference on each minibatch\n\
		      (3) Step the parameters along the variational bound\n\
		      (4) Write the visible and projected weights.\n"
    )]
    Train(TrainArgs),

    /// Print a configuration file with every default filled in
    Config(ConfigArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Train(args) => {
            fit_pddbm(args)?;
        }
        Commands::Config(args) => {
            write_default_config(args)?;
        }
    }

    info!("Done");
    Ok(())
}
