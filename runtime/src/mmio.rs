//! MMIO dispatch for the 0x7F000000 window.
//!
//! A single process-wide handler services every access; it is installed
//! once at startup before any guest thread runs. Accesses with no handler
//! installed are logged and read as zero, which keeps bring-up of images
//! that poke the GPU early from crashing outright.

use std::sync::OnceLock;

/// Device-side handler for guest MMIO loads and stores. Addresses are guest
/// addresses inside the MMIO window; values are host-order words.
pub trait MmioHandler: Send + Sync {
    fn load(&self, addr: u32) -> u32;
    fn store(&self, addr: u32, value: u32);
}

static HANDLER: OnceLock<Box<dyn MmioHandler>> = OnceLock::new();

/// Install the process MMIO handler. May only be called once.
pub fn install(handler: Box<dyn MmioHandler>) {
    if HANDLER.set(handler).is_err() {
        panic!("MMIO handler installed twice");
    }
}

pub fn check_load(addr: u32) -> u32 {
    match HANDLER.get() {
        Some(h) => h.load(addr),
        None => {
            log::warn!("MMIO load {addr:#010x} with no handler installed");
            0
        }
    }
}

pub fn check_store(addr: u32, value: u32) {
    match HANDLER.get() {
        Some(h) => h.store(addr, value),
        None => {
            log::warn!("MMIO store {addr:#010x} = {value:#010x} with no handler installed");
        }
    }
}
