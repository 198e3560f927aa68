use std::error::Error;

use tracing::{error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    // Setup the CryptoProvider (controls core cryptography used by rustls) for the process
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        return Err("Installing default CryptoProvider".into());
    }

    if let Err(e) = logwindow_core::run().await {
        error!("{e:?}");
        return Err(e.into());
    }
    info!("Exiting...");

    Ok(())
}
