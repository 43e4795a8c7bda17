mod workers;

use peerbeam::utils::logging;
use peerbeam::utils::sos::SignalOfStop;
use workers::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    logging::init(args.verbose, args.log_file.as_deref())?;

    let config = args.session_config()?;

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command {
        Command::Send { file, session, .. } => workers::transfer::send(config, file, session, sos).await,
        Command::Receive { output, session } => {
            workers::transfer::receive(config, output, session, sos).await
        }
    }
}
