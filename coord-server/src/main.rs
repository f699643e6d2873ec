// SPDX-License-Identifier: Apache-2.0

use clap::Parser as _;

use coord_server::{args::Args, logging, run};

#[tokio::main]
async fn main() {
    logging::init();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("coord-server failed: {e:?}");
        std::process::exit(1);
    }
}
