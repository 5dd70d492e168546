pub mod connector;
pub mod server;
pub mod static_files;

/// Re-export commonly used types from adapters
pub use connector::HyperConnector;
pub use server::Server;
pub use static_files::static_dir_dispatcher;

use once_cell::sync::Lazy;

static CRYPTO_PROVIDER: Lazy<()> = Lazy::new(|| {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
});

/// Install the process-wide rustls crypto provider once.
pub(crate) fn ensure_crypto_provider() {
    Lazy::force(&CRYPTO_PROVIDER);
}
