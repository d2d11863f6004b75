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

//! Operator console on standard input

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use umaster_service::{Command, CommandListener, CommandRegistry, CommandResponse};

/// Console-only commands
#[derive(Debug)]
pub struct ConsoleCommands {
    stop: CancellationToken,
}

impl ConsoleCommands {
    /// `quit` cancels `stop`
    pub fn new(stop: CancellationToken) -> Self {
        Self { stop }
    }
}

impl CommandListener for ConsoleCommands {
    fn execute(&self, command: &Command) -> Option<CommandResponse> {
        match command.name.as_str() {
            "quit" | "exit" => {
                self.stop.cancel();
                Some(CommandResponse::Done(vec!["shutting down".to_string()]))
            }
            _ => None,
        }
    }

    fn help(&self) -> Vec<String> {
        vec!["quit".to_string()]
    }
}

/// Feed lines from `input` to `commands` until `stop` fires or input ends
pub async fn run<R>(input: R, commands: Arc<CommandRegistry>, stop: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if let Some(response) = commands.execute_line(&line) {
                    println!("{response}");
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "Console input failed");
                break;
            }
        }
    }
}
