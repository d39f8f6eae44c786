//! Folio proxy binary: rate-limited session and relay endpoints for the chat widget.
//! Run with: cargo run --bin folio-proxy

use std::process::ExitCode;

use folio_chat::start_folio;

fn main() -> ExitCode {
    start_folio::run()
}
