/*!
 * Memoization Cell Driver - Main Entry Point
 *
 * Producer/consumer throughput harness:
 * - Producers publish short random byte payloads at a configurable rate
 * - Consumers hammer reads against an expensive decode transform
 * - Per-role ns/op is reported over a configurable number of rounds
 */

use anyhow::{Context, Result};
use memocell::MemoCell;
use rand::Rng;
use std::env;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Multiplication count burned by the decode transform, per invocation.
const DECODE_WORK: u32 = 10_000;

/// Multiplication count burned by producers between publishes.
const PRODUCER_WORK: u32 = 10_000;

#[derive(Debug, Error)]
enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    Invalid {
        name: &'static str,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("{name} must be nonzero")]
    Zero { name: &'static str },
}

/// Workload shape, read from the environment
#[derive(Debug, Clone)]
struct DriverConfig {
    producers: usize,
    consumers: usize,
    produce_iters: u64,
    consume_iters: u64,
    payload_len: usize,
    rounds: u32,
}

impl DriverConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            producers: env_parse("DRIVER_PRODUCERS", 1)?,
            consumers: env_parse("DRIVER_CONSUMERS", 8)?,
            produce_iters: env_parse("DRIVER_PRODUCE_ITERS", 200_000)?,
            consume_iters: env_parse("DRIVER_CONSUME_ITERS", 2_000_000)?,
            payload_len: env_parse("DRIVER_PAYLOAD_LEN", 3)?,
            rounds: env_parse("DRIVER_ROUNDS", 3)?,
        };
        for (name, value) in [
            ("DRIVER_PRODUCERS", config.producers),
            ("DRIVER_CONSUMERS", config.consumers),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        Ok(config)
    }
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|source| ConfigError::Invalid {
                name,
                value: raw,
                source,
            }),
        Err(_) => Ok(default),
    }
}

/// Output of the expensive transform the cell is asked to memoize.
#[derive(Debug)]
struct Decoded {
    text: String,
    weight: f64,
}

/// Decode a raw payload, burning a deterministic amount of float work to
/// stand in for a real parse
fn decode(raw: Box<[u8]>) -> Decoded {
    let text = String::from_utf8_lossy(&raw).into_owned();
    let mut weight = 1.0f64;
    for _ in 0..DECODE_WORK {
        weight *= 1.000_01;
    }
    Decoded { text, weight }
}

/// Producer-side pacing between publishes, mirroring an upstream source that
/// does real work to obtain each input
#[inline]
fn simulate_work() {
    let mut acc = 1.0f64;
    for _ in 0..PRODUCER_WORK {
        acc *= 1.000_01;
    }
    std::hint::black_box(acc);
}

struct RoleStats {
    ops: u64,
    elapsed: Duration,
    matches: u64,
}

impl RoleStats {
    fn ns_per_op(&self) -> f64 {
        self.elapsed.as_nanos() as f64 / self.ops.max(1) as f64
    }
}

type BenchCell = MemoCell<Box<[u8]>, Decoded, fn(Box<[u8]>) -> Decoded>;

fn produce(cell: &BenchCell, iters: u64, payload_len: usize) -> RoleStats {
    let mut rng = rand::thread_rng();
    let start = Instant::now();
    for _ in 0..iters {
        let payload: Box<[u8]> = (0..payload_len)
            .map(|_| b'A' + rng.gen_range(0..10))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        cell.publish(payload);
        simulate_work();
    }
    RoleStats {
        ops: iters,
        elapsed: start.elapsed(),
        matches: 0,
    }
}

fn consume(cell: &BenchCell, iters: u64) -> RoleStats {
    let start = Instant::now();
    let mut matches = 0u64;
    for _ in 0..iters {
        if let Some(out) = cell.read() {
            // Payload equality stays a driver concern; the cell contract
            // ignores output values entirely.
            if out.text.as_bytes().first() == Some(&b'A') {
                matches += 1;
            }
        }
    }
    RoleStats {
        ops: iters,
        elapsed: start.elapsed(),
        matches,
    }
}

fn run_round(round: u32, cell: &BenchCell, config: &DriverConfig) {
    thread::scope(|scope| {
        let consumers: Vec<_> = (0..config.consumers)
            .map(|id| {
                let iters = config.consume_iters;
                scope.spawn(move || (id, consume(cell, iters)))
            })
            .collect();

        let producers: Vec<_> = (0..config.producers)
            .map(|id| {
                let iters = config.produce_iters;
                let payload_len = config.payload_len;
                scope.spawn(move || (id, produce(cell, iters, payload_len)))
            })
            .collect();

        for handle in producers {
            let (id, stats) = handle.join().expect("producer thread panicked");
            info!(
                round,
                producer = id,
                ns_per_op = stats.ns_per_op(),
                elapsed_s = stats.elapsed.as_secs_f64(),
                "Producer finished"
            );
        }
        for handle in consumers {
            let (id, stats) = handle.join().expect("consumer thread panicked");
            info!(
                round,
                consumer = id,
                ns_per_op = stats.ns_per_op(),
                elapsed_s = stats.elapsed.as_secs_f64(),
                matches = stats.matches,
                "Consumer finished"
            );
        }
    });
}

fn main() -> Result<()> {
    // Initialize structured tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DriverConfig::from_env().context("reading driver configuration")?;

    info!("Memoization cell driver starting...");
    info!(
        producers = config.producers,
        consumers = config.consumers,
        produce_iters = config.produce_iters,
        consume_iters = config.consume_iters,
        payload_len = config.payload_len,
        rounds = config.rounds,
        "Configuration loaded"
    );

    let cell: BenchCell = MemoCell::new(decode as fn(Box<[u8]>) -> Decoded);

    for round in 1..=config.rounds {
        info!(round, "Round starting");
        run_round(round, &cell, &config);
        if let Some(out) = cell.latest() {
            info!(round, latest = %out.text, weight = out.weight, "Round complete");
        }
    }

    info!("Driver complete");
    Ok(())
}
