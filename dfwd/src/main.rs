// Copyright 2024 Yann Prado
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod config;
mod external;
mod supervisor;
mod worker;

use anyhow::Result;
use log::*;
use simple_logger::SimpleLogger;
use std::{path::PathBuf, process};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(
    name = "dfwd",
    about = "Regex-routed DNS forwarder with response caching and dynamic upstreams."
)]
enum Opt {
    /// Run the forwarder.
    #[structopt(name = "serve")]
    Serve {
        /// Path to the configuration file.
        #[structopt(short = "c", long = "config", default_value = "./config.yaml")]
        config: PathBuf,
    },
    /// Check the configuration file and exit.
    #[structopt(name = "checkConfig")]
    CheckConfig {
        /// Path to the configuration file.
        #[structopt(short = "c", long = "config", default_value = "./config.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // The logger allows everything; the effective level is driven through
    // log::set_max_level, so a config reload can change it at runtime.
    SimpleLogger::new().init()?;
    log::set_max_level(LevelFilter::Info);

    match Opt::from_args() {
        Opt::CheckConfig { config } => match config::Config::from_file(&config) {
            Ok(_) => info!("configuration file is valid"),
            Err(e) => {
                error!("error reading the configuration file: {}", e);
                process::exit(1);
            }
        },
        Opt::Serve { config } => supervisor::run(config).await?,
    }

    Ok(())
}
