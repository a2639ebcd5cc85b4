//! Time-ordered job identifiers.
//!
//! Sonyflake layout over a process-local epoch: 39 bits of 10 ms ticks,
//! 8 bits of sequence, 16 bits of machine ID taken from the host address.
//! When no usable address exists the machine ID is random; either way the
//! IDs are unique per process and sortable by issue time. Rendered in
//! base 24 for compact task UUIDs.

use std::net::IpAddr;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

const SEQUENCE_BITS: u32 = 8;
const MACHINE_BITS: u32 = 16;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const TICK_MS: u64 = 10;

const BASE24_DIGITS: &[u8; 24] = b"0123456789abcdefghijklmn";

pub(crate) struct FlakeGenerator {
    started: Instant,
    machine_id: u16,
    state: Mutex<FlakeState>,
}

struct FlakeState {
    last_tick: u64,
    sequence: u64,
}

impl FlakeGenerator {
    pub(crate) fn new() -> Self {
        let machine_id = machine_id_from_host().unwrap_or_else(|| {
            tracing::warn!("unable to derive a machine id, using a random one");
            rand::random::<u16>()
        });

        FlakeGenerator {
            started: Instant::now(),
            machine_id,
            state: Mutex::new(FlakeState {
                last_tick: 0,
                sequence: 0,
            }),
        }
    }

    /// Next monotonic ID. Within one tick the sequence differentiates;
    /// when a tick's sequence space is exhausted we wait the tick out.
    pub(crate) fn next_id(&self) -> u64 {
        loop {
            let tick = (self.started.elapsed().as_millis() / TICK_MS as u128) as u64;
            let mut state = self.state.lock().expect("flake state lock");

            if tick > state.last_tick {
                state.last_tick = tick;
                state.sequence = 0;
            } else {
                if state.sequence >= SEQUENCE_MASK {
                    drop(state);
                    std::thread::yield_now();
                    continue;
                }
                state.sequence += 1;
            }

            let id = (state.last_tick << (SEQUENCE_BITS + MACHINE_BITS))
                | (state.sequence << MACHINE_BITS)
                | self.machine_id as u64;
            return id;
        }
    }

    pub(crate) fn next_uuid(&self) -> String {
        to_base24(self.next_id())
    }
}

/// Lower 16 bits of the host's primary IPv4, per the Sonyflake convention.
fn machine_id_from_host() -> Option<u16> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("1.2.3.4:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            Some(u16::from_be_bytes([octets[2], octets[3]]))
        }
        IpAddr::V6(_) => None,
    }
}

/// Process-wide generator, seeded on first use.
pub(crate) fn next_uuid() -> String {
    static GENERATOR: OnceLock<FlakeGenerator> = OnceLock::new();
    GENERATOR.get_or_init(FlakeGenerator::new).next_uuid()
}

fn to_base24(mut n: u64) -> String {
    if n == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE24_DIGITS[(n % 24) as usize]);
        n /= 24;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base24 digits are ascii")
}
