// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;

mod auth;
mod cli;
mod config;
mod logging;
mod sandbox;
mod server;
mod services;
mod state;
mod telemetry;
mod ws;

#[tokio::main]
async fn main() {
    // Install default crypto provider for Rustls (required for HTTPS/TLS support)
    // This must be done before any TLS operations
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = cli::Cli::parse();
    cli::handle_command(&cli, |log_config| logging::init_logging(log_config)).await;
}
