//! Diagnostic hex dump of the object region
//!
//! Enabled process-wide with [`set_print_mem`] or per context through
//! `ContextConfig::print_mem`. Output goes to the `offload_runtime::dump`
//! target at debug level, so it also needs a subscriber that lets it through:
//!
//! ```text
//! OFFLOAD_TRACING_DIRECTIVES=offload_runtime::dump=debug
//! ```

use crate::memory::MemoryRegion;
use std::sync::atomic::{AtomicBool, Ordering};

/// Bytes dumped from the start of the object region
pub const DUMP_BYTES: usize = 896;

const BYTES_PER_LINE: usize = 16;

static PRINT_MEM: AtomicBool = AtomicBool::new(false);

/// Turn the process-wide dump on or off
pub fn set_print_mem(enabled: bool) {
    PRINT_MEM.store(enabled, Ordering::Relaxed);
}

/// Whether the process-wide dump is on
pub fn print_mem_enabled() -> bool {
    PRINT_MEM.load(Ordering::Relaxed)
}

/// Format `bytes` as hex lines of 16 bytes, each prefixed with its offset
pub fn format_dump(bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(BYTES_PER_LINE)
        .enumerate()
        .map(|(line, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            format!("{:08x}: {}", line * BYTES_PER_LINE, hex.join(" "))
        })
        .collect()
}

/// Log the first [`DUMP_BYTES`] bytes of `region`
pub fn dump_region(region: &MemoryRegion, phase: &str) {
    let bytes = region.as_bytes();
    let shown = &bytes[..bytes.len().min(DUMP_BYTES)];
    tracing::debug!(
        target: "offload_runtime::dump",
        phase,
        region = %region.kind(),
        heap_end = region.heap_end_ptr(),
        "memory dump"
    );
    for line in format_dump(shown) {
        tracing::debug!(target: "offload_runtime::dump", "{line}");
    }
}
