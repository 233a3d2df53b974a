// ABOUTME: The owning handle callers actually hold: wires a transport into a running
// ABOUTME: command-pipe reader (and, for ETH, a throttle controller), and tears both down
// ABOUTME: in signal-quit, join, close order on disconnect.

use std::sync::mpsc::{Sender, SyncSender};
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::command_pipe::{self, CommandPipeCounters, CommandPipeShared};
use crate::commands::StackCommandBuilder;
use crate::error::Result;
use crate::eth_throttle::{self, EthThrottleConfig, EthThrottleCounters, SharedEthThrottleCounters};
use crate::readout_worker::{BufferPool, ReadoutBuffer, ReadoutWorker, ReadoutWorkerConfig};
use crate::stack_errors::StackErrorCounters;
use crate::transaction::{TransactionConfig, TransactionEngine};
use crate::transport::{ConnectionType, Transport};

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionConfig {
    pub transaction: TransactionConfig,
    /// Only consulted for ETH transports; ignored for USB.
    pub eth_throttle: Option<EthThrottleConfig>,
}

/// Top-level owning handle. Construction spawns the command-pipe reader
/// thread and, for ETH transports, the throttle controller thread;
/// `disconnect` (and `Drop`) signal quit and join both before returning.
pub struct Connection {
    shared: Arc<CommandPipeShared>,
    engine: Arc<TransactionEngine>,
    reader_thread: Option<thread::JoinHandle<()>>,
    throttle_thread: Option<thread::JoinHandle<()>>,
    throttle_counters: Option<Arc<SharedEthThrottleCounters>>,
}

impl Connection {
    /// Takes ownership of an already-opened transport (opening the USB/ETH
    /// handle itself is the transport backend's job, out of scope here) and
    /// starts its background tasks.
    pub fn connect(transport: Transport, config: ConnectionConfig) -> Self {
        let connection_type = transport.connection_type();
        let shared = CommandPipeShared::new(transport);
        let engine = Arc::new(TransactionEngine::new(Arc::clone(&shared), config.transaction));

        let reader_shared = Arc::clone(&shared);
        let reader_thread = thread::Builder::new()
            .name("command-pipe-reader".into())
            .spawn(move || command_pipe::run(reader_shared))
            .expect("spawn command pipe reader thread");

        let (throttle_thread, throttle_counters) = if connection_type == ConnectionType::Eth {
            let throttle_config = config.eth_throttle.unwrap_or_default();
            let counters = Arc::new(SharedEthThrottleCounters::new());
            let throttle_shared = Arc::clone(&shared);
            let throttle_counters_for_thread = Arc::clone(&counters);
            let t = thread::Builder::new()
                .name("eth-throttle".into())
                .spawn(move || eth_throttle::run(throttle_shared, throttle_config, throttle_counters_for_thread))
                .expect("spawn eth throttle thread");
            (Some(t), Some(counters))
        } else {
            (None, None)
        };

        Self {
            shared,
            engine,
            reader_thread: Some(reader_thread),
            throttle_thread,
            throttle_counters,
        }
    }

    /// Signals quit, then joins the reader and (if running) throttle
    /// threads, in that order. Idempotent: calling twice, or dropping
    /// afterward, is a no-op the second time.
    pub fn disconnect(&mut self) {
        self.shared.request_quit();
        if let Some(t) = self.reader_thread.take() {
            debug!("joining command pipe reader thread");
            let _ = t.join();
        }
        if let Some(t) = self.throttle_thread.take() {
            debug!("joining eth throttle thread");
            let _ = t.join();
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.shared.transport.lock().unwrap().connection_type()
    }

    /// A fresh reference to the transaction engine, for building a readout
    /// worker or any other caller-owned helper that needs to issue
    /// super/stack transactions.
    pub fn engine(&self) -> Arc<TransactionEngine> {
        Arc::clone(&self.engine)
    }

    pub fn super_transaction(&self, words: &[u32]) -> Result<Vec<u32>> {
        self.engine.super_transaction(words)
    }

    pub fn stack_transaction(
        &self,
        commands: &StackCommandBuilder,
        stack_memory_offset_words: u16,
        stack_offset_bytes: u16,
    ) -> Result<Vec<u32>> {
        self.engine.stack_transaction(commands, stack_memory_offset_words, stack_offset_bytes)
    }

    pub fn command_pipe_counters(&self) -> CommandPipeCounters {
        self.shared.counters_snapshot()
    }

    pub fn stack_error_counters(&self) -> StackErrorCounters {
        self.shared.stack_errors.lock().unwrap().clone()
    }

    pub fn eth_throttle_counters(&self) -> Option<EthThrottleCounters> {
        self.throttle_counters.as_ref().map(|c| c.snapshot())
    }

    /// Builds a readout worker sharing this connection's transport and
    /// transaction engine. The worker is a separate, independently spawned
    /// task — the connection does not own its lifecycle.
    pub fn build_readout_worker(
        &self,
        pool: Arc<BufferPool>,
        filled_tx: Sender<ReadoutBuffer>,
        snoop_tx: Option<SyncSender<ReadoutBuffer>>,
        config: ReadoutWorkerConfig,
    ) -> ReadoutWorker {
        ReadoutWorker::new(Arc::clone(&self.shared), self.engine(), pool, filled_tx, snoop_tx, config)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockUsbBackend;
    use crate::transport::UsbStreamPipePolicy;

    #[test]
    fn connect_spawns_reader_and_disconnect_joins_it() {
        let transport = Transport::Usb {
            backend: Box::new(MockUsbBackend::new()),
            stream_pipe_policy: UsbStreamPipePolicy::Default,
        };
        let mut conn = Connection::connect(transport, ConnectionConfig::default());
        assert_eq!(conn.connection_type(), ConnectionType::Usb);
        conn.disconnect();
        assert!(conn.reader_thread.is_none());
        assert!(conn.throttle_thread.is_none());
    }

    #[test]
    fn usb_connection_does_not_start_a_throttle_thread() {
        let transport = Transport::Usb {
            backend: Box::new(MockUsbBackend::new()),
            stream_pipe_policy: UsbStreamPipePolicy::Default,
        };
        let conn = Connection::connect(transport, ConnectionConfig::default());
        assert!(conn.eth_throttle_counters().is_none());
    }
}
