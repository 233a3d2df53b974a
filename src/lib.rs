pub mod buffer;
pub mod command_pipe;
pub mod commands;
pub mod connection;
pub mod error;
pub mod eth_envelope;
pub mod eth_throttle;
pub mod frame;
pub mod listfile;
pub mod readout_parser;
pub mod readout_worker;
pub mod registers;
pub mod stack_errors;
pub mod sync;
pub mod transaction;
pub mod transport;

pub use connection::{Connection, ConnectionConfig};
pub use error::{Error, Result};
pub use transport::{ConnectionType, EthBackend, Pipe, Transport, UsbBackend, UsbStreamPipePolicy};

use std::sync::Once;

static INIT: Once = Once::new();

/// Process-wide setup: nothing the core itself needs today beyond making
/// repeated calls safe, but callers get one place to hook in instead of
/// relying on static constructors. The transport backend's own driver/socket
/// init is out of scope here; this only covers what this crate owns.
pub fn init() {
    INIT.call_once(|| {
        tracing::debug!("mvlc-core initialized");
    });
}

/// Counterpart to `init()`. A no-op today: every stateful resource this
/// crate creates (reader threads, throttle threads, pending cells) is owned
/// by a `Connection` value and torn down by its `Drop`, not by global state.
pub fn shutdown() {
    tracing::debug!("mvlc-core shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_shutdown_are_idempotent() {
        init();
        init();
        shutdown();
        shutdown();
    }
}
