//! Remote Command Example
//!
//! Runs one command on an SSH server and streams its output, similar to
//! `ssh user@host command`.
//!
//! Usage:
//!   cargo run --example run_command <host:port> <username> <password> <command> [fingerprint]
//!
//! Example:
//!   RUST_LOG=sluice_proto=debug cargo run --example run_command 127.0.0.1:22 admin secret "uname -a"
//!
//! When a `SHA256:...` fingerprint is given, the server's host key must match
//! it. Otherwise any host key is accepted.

use sluice_proto::ssh::auth::Credential;
use sluice_proto::ssh::channel::ChannelData;
use sluice_proto::ssh::client::{event_channel, SshClient};
use sluice_proto::ssh::config::{ClientConfig, ConnectOptions};
use sluice_proto::ssh::engine::Event;
use sluice_proto::ssh::hostkey::FingerprintVerifier;
use std::env;
use std::io::Write;
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        eprintln!(
            "Usage: {} <host:port> <username> <password> <command> [fingerprint]",
            args[0]
        );
        std::process::exit(1);
    }

    let server_addr = &args[1];
    let mut config =
        ClientConfig::new(args[2].as_str(), Credential::password(args[3].as_str()))
            .with_command(args[4].as_str());
    if let Some(fingerprint) = args.get(5) {
        config = config.with_host_key_verifier(FingerprintVerifier::new([fingerprint.as_str()]));
    }

    let options = ConnectOptions::default().with_connect_timeout(Duration::from_secs(10));
    let (handler, mut events) = event_channel();
    let session = SshClient::connect(server_addr.as_str(), config, options, handler).await?;

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    loop {
        let event = match timeout(Duration::from_secs(60), events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                eprintln!("No output for 60 seconds, closing");
                session.close()?;
                break;
            }
        };

        match event {
            Event::Established => eprintln!("Connected to {}", server_addr),
            Event::Data(ChannelData::Stdout(data)) => stdout.write_all(&data)?,
            Event::Data(ChannelData::Extended(_, data)) => stderr.write_all(&data)?,
            Event::Closed => break,
            Event::Failed(e) => {
                eprintln!("Session failed ({:?}): {}", e.category(), e);
                session.join().await;
                std::process::exit(1);
            }
        }
    }
    stdout.flush()?;

    session.join().await;
    Ok(())
}
