use std::{panic, process};

use clap::Parser;

use affine_bridge::cli::Options;
use affine_bridge::logging;

fn main() {
    // A panic anywhere in the bridge is a bug, not a recoverable request
    // failure. Let the default hook report it (including RUST_BACKTRACE
    // handling), then exit non-zero instead of unwinding a half-dead
    // process.
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        log::error!(
            "affine-bridge {} crashed. This is probably a bug, please consider filing an issue.",
            env!("CARGO_PKG_VERSION")
        );
        default_hook(panic_info);
        process::exit(1);
    }));

    let options = Options::parse();

    logging::init_logging(options.global.verbosity, options.global.no_color);

    if let Err(err) = options.run() {
        log::error!("{:?}", err);
        process::exit(1);
    }
}
