//! Defines the bridge's CLI through clap types.

mod serve;

use clap::Parser;

pub use self::serve::ServeCommand;

/// Command line options, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "affine-bridge", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Serve(subcommand) => subcommand.run(),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Disable ANSI color in log output. Color is otherwise used whenever
    /// stderr is a terminal; container logs never get escape codes.
    #[clap(long("no-color"), global(true))]
    pub no_color: bool,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    Serve(ServeCommand),
}
