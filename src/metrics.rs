use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry,
};
use std::sync::Once;
use std::time::{Duration, Instant};

use crate::emulator::CpuSnapshot;
use crate::instruction::decode;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Counter for total CPU instructions executed by opcode
    pub static ref CPU_INSTRUCTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cpu_instructions_total", "Total number of CPU instructions executed by opcode"),
        &["opcode", "instruction"]
    ).expect("Failed to create CPU instructions counter");

    /// Counter for emulated CPU cycles
    pub static ref CPU_CYCLES_TOTAL: IntCounter = IntCounter::new(
        "cpu_cycles_total", "Total number of CPU cycles executed"
    ).expect("Failed to create CPU cycles counter");

    /// Counter for hardware interrupts delivered, by vector
    pub static ref CPU_INTERRUPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cpu_interrupts_total", "Total number of hardware interrupts delivered"),
        &["vector"]
    ).expect("Failed to create CPU interrupts counter");

    /// Counter for writes dropped by the memory guard
    pub static ref MEMORY_REJECTED_WRITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("memory_rejected_writes_total", "Writes rejected by the memory write guard"),
        &["region"]
    ).expect("Failed to create rejected writes counter");

    /// Counter for OUT instructions by port
    pub static ref IO_PORT_WRITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("io_port_writes_total", "Total number of OUT instructions by port"),
        &["port"]
    ).expect("Failed to create port writes counter");

    /// Wall time the scheduler spent sleeping to hold the clock rate
    pub static ref THROTTLE_SLEEP_SECONDS: Counter = Counter::new(
        "scheduler_throttle_sleep_seconds_total", "Time spent sleeping to stay on the target clock rate"
    ).expect("Failed to create throttle sleep counter");

    /// Gauge for CPU register values
    pub static ref CPU_REGISTER_VALUES: GaugeVec = GaugeVec::new(
        Opts::new("cpu_register_value", "Current CPU register values"),
        &["register"]
    ).expect("Failed to create CPU register values gauge");

    /// Gauge for CPU flags
    pub static ref CPU_FLAGS: GaugeVec = GaugeVec::new(
        Opts::new("cpu_flags", "Current CPU flag states (0 or 1)"),
        &["flag"]
    ).expect("Failed to create CPU flags gauge");

    /// Counter for API requests by endpoint and method
    pub static ref API_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("api_requests_total", "Total number of API requests"),
        &["method", "endpoint", "status"]
    ).expect("Failed to create API requests counter");

    /// Histogram for API request duration
    pub static ref API_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("api_request_duration_seconds", "API request duration")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "endpoint"]
    ).expect("Failed to create API request duration histogram");

    // One resolved child per opcode so the executor never formats labels.
    static ref INSTRUCTION_COUNTERS: Vec<IntCounter> = (0..=255u8)
        .map(|opcode| {
            CPU_INSTRUCTIONS_TOTAL.with_label_values(&[
                &format!("0x{:02X}", opcode),
                decode(opcode).mnemonic(),
            ])
        })
        .collect();
}

static INIT: Once = Once::new();

/// Initialize Prometheus metrics by registering them with the global registry.
/// Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(CPU_INSTRUCTIONS_TOTAL.clone()))
            .expect("Failed to register CPU instructions counter");

        REGISTRY
            .register(Box::new(CPU_CYCLES_TOTAL.clone()))
            .expect("Failed to register CPU cycles counter");

        REGISTRY
            .register(Box::new(CPU_INTERRUPTS_TOTAL.clone()))
            .expect("Failed to register CPU interrupts counter");

        REGISTRY
            .register(Box::new(MEMORY_REJECTED_WRITES_TOTAL.clone()))
            .expect("Failed to register rejected writes counter");

        REGISTRY
            .register(Box::new(IO_PORT_WRITES_TOTAL.clone()))
            .expect("Failed to register port writes counter");

        REGISTRY
            .register(Box::new(THROTTLE_SLEEP_SECONDS.clone()))
            .expect("Failed to register throttle sleep counter");

        REGISTRY
            .register(Box::new(CPU_REGISTER_VALUES.clone()))
            .expect("Failed to register CPU register values gauge");

        REGISTRY
            .register(Box::new(CPU_FLAGS.clone()))
            .expect("Failed to register CPU flags gauge");

        REGISTRY
            .register(Box::new(API_REQUESTS_TOTAL.clone()))
            .expect("Failed to register API requests counter");

        REGISTRY
            .register(Box::new(API_REQUEST_DURATION.clone()))
            .expect("Failed to register API request duration histogram");
    });
}

/// Record one executed instruction and the cycles it cost
pub fn record_instruction(opcode: u8, cycles: u32) {
    INSTRUCTION_COUNTERS[opcode as usize].inc();
    CPU_CYCLES_TOTAL.inc_by(cycles as u64);
}

pub fn record_interrupt(vector: u8) {
    CPU_INTERRUPTS_TOTAL
        .with_label_values(&[&vector.to_string()])
        .inc();
}

pub fn record_rejected_write(region: &str) {
    MEMORY_REJECTED_WRITES_TOTAL
        .with_label_values(&[region])
        .inc();
}

pub fn record_port_write(port: u8) {
    IO_PORT_WRITES_TOTAL
        .with_label_values(&[&port.to_string()])
        .inc();
}

pub fn record_throttle_sleep(duration: Duration) {
    THROTTLE_SLEEP_SECONDS.inc_by(duration.as_secs_f64());
}

/// Record an API request
pub fn record_api_request(method: &str, endpoint: &str, status: u16, duration: Duration) {
    API_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();

    API_REQUEST_DURATION
        .with_label_values(&[method, endpoint])
        .observe(duration.as_secs_f64());
}

/// Update register and flag gauges from a published snapshot
pub fn update_cpu_state(snapshot: &CpuSnapshot) {
    let registers: [(&str, f64); 9] = [
        ("A", snapshot.a as f64),
        ("B", snapshot.b as f64),
        ("C", snapshot.c as f64),
        ("D", snapshot.d as f64),
        ("E", snapshot.e as f64),
        ("H", snapshot.h as f64),
        ("L", snapshot.l as f64),
        ("SP", snapshot.sp as f64),
        ("PC", snapshot.pc as f64),
    ];
    for (name, value) in registers {
        CPU_REGISTER_VALUES.with_label_values(&[name]).set(value);
    }

    let flags = &snapshot.flags;
    let states = [
        ("zero", flags.zero),
        ("sign", flags.sign),
        ("parity", flags.parity),
        ("carry", flags.carry),
        ("aux_carry", flags.aux_carry),
        ("interrupts_enabled", snapshot.interrupts_enabled),
    ];
    for (name, set) in states {
        CPU_FLAGS
            .with_label_values(&[name])
            .set(if set { 1.0 } else { 0.0 });
    }
}

/// Render every registered metric in the Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    init_metrics();
    let encoder = prometheus::TextEncoder::new();
    encoder.encode_to_string(&REGISTRY.gather())
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
