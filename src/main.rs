//! Binary entrypoint that loads a chat history database and prints its topic tree.

use std::process::ExitCode;

use chat_history::start_chat_history;

/// Load the database named on the command line (or in `CHAT_HISTORY_DB`).
fn main() -> ExitCode {
    start_chat_history::run()
}
