//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Game master server executable
//!
//! Runs until interrupted or until `quit` is typed on the console. Log output is
//! controlled with `RUST_LOG`.

mod args;
mod console;

use args::Args;
use clap::Parser;
use console::ConsoleCommands;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use umaster_service::{MasterServer, Result};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Master server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let server = MasterServer::new(args.config(), args.modules()?).await?;
    server.start().await?;
    info!(snapshot = %server.snapshot(), "Ready");

    let stop = CancellationToken::new();
    server
        .commands()
        .register(Arc::new(ConsoleCommands::new(stop.clone())));
    let console = tokio::spawn(console::run(
        BufReader::new(tokio::io::stdin()),
        server.commands(),
        stop.clone(),
    ));

    tokio::select! {
        _ = stop.cancelled() => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "Signal handler failed, shutting down");
            }
        }
    }
    stop.cancel();
    console.abort();

    server.shutdown().await
}
