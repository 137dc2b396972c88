use chrono::Local;
use clap::Parser;
use log::{error, info};
use ringline::relay::{RelayConfig, RelayServer};

/// Signaling relay for ringline clients.
#[derive(Parser, Debug)]
#[command(name = "ringline-relay", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:7070")]
    bind: String,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let server = RelayServer::new(RelayConfig {
            bind_addr: args.bind,
        });
        let serving = tokio::spawn(server.run());
        tokio::select! {
            result = serving => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("relay failed: {e}"),
                Err(e) => error!("relay task panicked: {e}"),
            },
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
    });
}
