// ABOUTME: The byte/datagram transport contract the core is generic over.
// ABOUTME: Modeled as a variant-matched sum type, not trait-object upcasting.

use crate::eth_envelope::{Header0, Header1};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    Command,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Usb,
    Eth,
}

/// Result of a single ETH `read_packet` call: the two envelope headers plus
/// where the frame payload starts and how many packets were lost since the
/// last read on this channel.
#[derive(Debug, Clone, Copy)]
pub struct PacketReadResult {
    pub header0: Header0,
    pub header1: Header1,
    /// Number of payload words available after the two envelope header words.
    pub payload_words: u16,
    pub lost_packets: u32,
}

/// Byte-oriented backend capability (USB).
pub trait UsbBackend: Send {
    fn read(&mut self, pipe: Pipe, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, pipe: Pipe, buf: &[u8]) -> Result<usize>;
}

/// Datagram-oriented backend capability (ETH), including the write-only delay port.
pub trait EthBackend: Send {
    fn read(&mut self, pipe: Pipe, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, pipe: Pipe, buf: &[u8]) -> Result<usize>;
    fn read_packet(&mut self, pipe: Pipe, buf: &mut [u8]) -> Result<PacketReadResult>;
    fn write_delay(&mut self, word: u32) -> Result<()>;
    /// Receive-buffer fill snapshot for the data pipe socket, used by the
    /// throttle controller (component F). `(used_bytes, capacity_bytes)`.
    fn data_socket_buffer_level(&self) -> Result<(usize, usize)>;
}

/// Runtime-selectable USB stream-pipe sizing policy (see DESIGN.md: Windows
/// FTDI stream-pipe Open Question). The core only records and applies the
/// caller's choice; it does not guess intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbStreamPipePolicy {
    /// Modern FTDI D3XX driver: read in chunks up to `USBSingleTransferMaxBytes`.
    Default,
    /// Legacy driver versions needing the stream pipe sized exactly to
    /// `USBSingleTransferMaxBytes` regardless of requested read size.
    LegacyFixedStreamSize,
}

pub const USB_SINGLE_TRANSFER_MAX_BYTES: usize = 1024 * 1024;

/// Either backend, matched at the call site rather than up-cast through a
/// shared trait object.
pub enum Transport {
    Usb {
        backend: Box<dyn UsbBackend>,
        stream_pipe_policy: UsbStreamPipePolicy,
    },
    Eth {
        backend: Box<dyn EthBackend>,
    },
}

impl Transport {
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Transport::Usb { .. } => ConnectionType::Usb,
            Transport::Eth { .. } => ConnectionType::Eth,
        }
    }

    pub fn write(&mut self, pipe: Pipe, buf: &[u8]) -> Result<usize> {
        match self {
            Transport::Usb { backend, .. } => backend.write(pipe, buf),
            Transport::Eth { backend } => backend.write(pipe, buf),
        }
    }

    pub fn read(&mut self, pipe: Pipe, buf: &mut [u8]) -> Result<usize> {
        match self {
            Transport::Usb { backend, .. } => backend.read(pipe, buf),
            Transport::Eth { backend } => backend.read(pipe, buf),
        }
    }

    /// `None` when this transport is USB — callers must not reach for
    /// `read_packet` on a byte-oriented backend.
    pub fn as_eth_mut(&mut self) -> Option<&mut dyn EthBackend> {
        match self {
            Transport::Eth { backend } => Some(backend.as_mut()),
            Transport::Usb { .. } => None,
        }
    }

    pub fn as_eth(&self) -> Option<&dyn EthBackend> {
        match self {
            Transport::Eth { backend } => Some(backend.as_ref()),
            Transport::Usb { .. } => None,
        }
    }

    pub fn usb_stream_pipe_policy(&self) -> Option<UsbStreamPipePolicy> {
        match self {
            Transport::Usb {
                stream_pipe_policy, ..
            } => Some(*stream_pipe_policy),
            Transport::Eth { .. } => None,
        }
    }
}

/// Error raised by a backend read/write when the other side is gone. Kept
/// separate from `Error::ConnectionError` so callers can distinguish a
/// recoverable timeout from a fatal disconnect without downcasting `io::Error`.
pub fn is_fatal(err: &Error) -> bool {
    matches!(err, Error::ConnectionError(_) | Error::IsDisconnected)
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory USB backend for unit tests: reads drain a preloaded queue of
    /// byte chunks, writes are recorded for inspection.
    pub struct MockUsbBackend {
        pub command_rx: VecDeque<Vec<u8>>,
        pub data_rx: VecDeque<Vec<u8>>,
        pub command_tx: Vec<Vec<u8>>,
        pub data_tx: Vec<Vec<u8>>,
    }

    impl MockUsbBackend {
        pub fn new() -> Self {
            Self {
                command_rx: VecDeque::new(),
                data_rx: VecDeque::new(),
                command_tx: Vec::new(),
                data_tx: Vec::new(),
            }
        }
    }

    impl UsbBackend for MockUsbBackend {
        fn read(&mut self, pipe: Pipe, buf: &mut [u8]) -> Result<usize> {
            let queue = match pipe {
                Pipe::Command => &mut self.command_rx,
                Pipe::Data => &mut self.data_rx,
            };
            match queue.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Err(Error::Timeout),
            }
        }

        fn write(&mut self, pipe: Pipe, buf: &[u8]) -> Result<usize> {
            match pipe {
                Pipe::Command => self.command_tx.push(buf.to_vec()),
                Pipe::Data => self.data_tx.push(buf.to_vec()),
            }
            Ok(buf.len())
        }
    }
}
