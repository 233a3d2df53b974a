// ABOUTME: ETH-only throttle controller: samples the data-pipe socket's receive-buffer
// ABOUTME: fill and sends EthDelay datagrams to apply back-pressure.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::command_pipe::CommandPipeShared;
use crate::error::Result;

/// Number of exponential scaling steps between `threshold` and
/// `threshold + range`.
const THROTTLE_STEPS: u32 = 16;

/// EMA smoothing factor for the rolling average delay.
const AVG_SMOOTHING: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
pub struct EthThrottleConfig {
    /// How often to sample the buffer fill level.
    pub query_delay: Duration,
    /// Fill fraction at which throttling begins.
    pub threshold: f64,
    /// Fill fraction range over which the curve scales from a delay of 1 up
    /// to the maximum (65535).
    pub range: f64,
}

impl Default for EthThrottleConfig {
    fn default() -> Self {
        Self {
            query_delay: Duration::from_millis(1),
            threshold: 0.5,
            range: 0.45,
        }
    }
}

/// Computes the exponential throttle delay for a given buffer fill fraction.
pub fn throttle_exponential(config: &EthThrottleConfig, fill: f64) -> u16 {
    if fill < config.threshold {
        return 0;
    }

    let above_threshold = fill - config.threshold;
    let throttle_increment = config.range / THROTTLE_STEPS as f64;
    let mut increments = (above_threshold / throttle_increment).floor() as u32;
    if increments > THROTTLE_STEPS {
        increments = THROTTLE_STEPS;
    }

    let delay = 1u32.checked_shl(increments).unwrap_or(u32::MAX);
    delay.min(u16::MAX as u32) as u16
}

fn calc_avg_delay(current: u16, last_avg: f64) -> f64 {
    AVG_SMOOTHING * current as f64 + (1.0 - AVG_SMOOTHING) * last_avg
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EthThrottleCounters {
    pub current_delay: u16,
    pub max_delay: u16,
    pub avg_delay: f64,
    pub rcv_buffer_capacity: usize,
    pub rcv_buffer_used: usize,
    pub samples: u64,
}

#[derive(Default)]
pub struct SharedEthThrottleCounters {
    inner: Mutex<EthThrottleCounters>,
}

impl SharedEthThrottleCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> EthThrottleCounters {
        *self.inner.lock().unwrap()
    }
}

/// The super-command opcode for `EthDelay`, matching `SuperCommandType::EthDelay`.
const ETH_DELAY_OPCODE: u32 = 0x0207;

/// Encodes a single-word `EthDelay` datagram: bits[31:16] = opcode,
/// bits[15:0] = delay in microseconds (0xFFFF stops transmission).
fn encode_eth_delay(delay: u16) -> u32 {
    (ETH_DELAY_OPCODE << 16) | delay as u32
}

/// Runs the throttle loop until `shared.quit` is set. Intended to run on its
/// own thread, spawned only for ETH connections.
/// Samples and, when needed, writes through the same transport mutex the
/// command-pipe reader uses, each lock held only for the duration of one
/// sample (+ optional write).
pub fn run(shared: Arc<CommandPipeShared>, config: EthThrottleConfig, counters: Arc<SharedEthThrottleCounters>) {
    let mut last_sent_delay: Option<u16> = None;

    while !shared.quit.load(Ordering::SeqCst) {
        match sample_and_throttle(&shared, &config, &mut last_sent_delay, &counters) {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "eth throttle sample failed, continuing");
            }
        }
        std::thread::sleep(config.query_delay);
    }
}

fn sample_and_throttle(
    shared: &Arc<CommandPipeShared>,
    config: &EthThrottleConfig,
    last_sent_delay: &mut Option<u16>,
    counters: &Arc<SharedEthThrottleCounters>,
) -> Result<()> {
    let (used, capacity) = {
        let mut transport = shared.transport.lock().unwrap();
        let eth = transport.as_eth_mut().expect("eth throttle requires an ETH transport");
        eth.data_socket_buffer_level()?
    };

    let fill = if capacity == 0 { 0.0 } else { used as f64 / capacity as f64 };
    let delay = throttle_exponential(config, fill);

    if *last_sent_delay != Some(delay) {
        debug!(last = ?last_sent_delay, new = delay, "sending eth delay command");
        let mut transport = shared.transport.lock().unwrap();
        let eth = transport.as_eth_mut().expect("eth throttle requires an ETH transport");
        eth.write_delay(encode_eth_delay(delay))?;
        *last_sent_delay = Some(delay);
    } else {
        trace!(fill, delay, "eth throttle sample unchanged");
    }

    let mut c = counters.inner.lock().unwrap();
    c.current_delay = delay;
    c.max_delay = c.max_delay.max(delay);
    c.avg_delay = calc_avg_delay(delay, c.avg_delay);
    c.rcv_buffer_capacity = capacity;
    c.rcv_buffer_used = used;
    c.samples += 1;

    Ok(())
}

/// Portable receive-buffer fill sampler for the data-pipe socket: `SO_RCVBUF`
/// for capacity, `FIONREAD` for the used-byte count. Substitutes for the
/// original's Linux-only netlink `SOCK_DIAG_BY_FAMILY` query (see
/// DESIGN.md's ETH throttle Open Question).
pub struct SocketBufferLevel {
    fd: std::os::unix::io::RawFd,
}

impl SocketBufferLevel {
    pub fn new(fd: std::os::unix::io::RawFd) -> Self {
        Self { fd }
    }

    pub fn read(&self) -> Result<(usize, usize)> {
        let mut capacity: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &mut capacity as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut used: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(self.fd, libc::FIONREAD, &mut used as *mut libc::c_int) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok((used.max(0) as usize, capacity.max(0) as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EthThrottleConfig {
        EthThrottleConfig {
            query_delay: Duration::from_millis(1),
            threshold: 0.5,
            range: 0.45,
        }
    }

    #[test]
    fn throttle_curve_matches_expected_delay_steps() {
        let config = cfg();
        assert_eq!(throttle_exponential(&config, 0.40), 0);
        assert_eq!(throttle_exponential(&config, 0.50), 1);
        assert_eq!(throttle_exponential(&config, 0.725), 256);
        assert_eq!(throttle_exponential(&config, 0.95), 65535);
    }

    #[test]
    fn exactly_at_saturation_is_capped_not_overflowed() {
        let config = cfg();
        assert_eq!(throttle_exponential(&config, config.threshold + config.range + 10.0), 65535);
    }

    #[test]
    fn avg_delay_converges_toward_steady_input() {
        let mut avg = 0.0;
        for _ in 0..50 {
            avg = calc_avg_delay(100, avg);
        }
        assert!((avg - 100.0).abs() < 0.01);
    }

    #[test]
    fn eth_delay_word_encodes_opcode_and_microseconds() {
        let word = encode_eth_delay(1234);
        assert_eq!(word >> 16, 0x0207);
        assert_eq!(word & 0xffff, 1234);
    }
}
