//! # Kernel Tracing helpers

use crate::boot::{self, BootInfo};
use kernel_info::boot::MultibootInfo;
use kernel_registers::LoadRegisterUnsafe;
use kernel_registers::cr0::Cr0;
use log::{debug, info};

pub fn trace_boot_info(raw: &MultibootInfo, boot_info: &BootInfo) {
    info!(
        concat!(
            "Boot Info in Kernel:\n",
            "  flags    = {flags:#010x}\n",
            "  memory   = {lower} KiB low, {upper} KiB high\n",
            "  cmdline  = {cmdline:?}\n",
            "  mmap     = {mmap_addr:#010x}, len = {mmap_len}, {regions} regions\n",
            "  modules  = {mods_addr:#010x}, count = {mods}"
        ),
        flags = raw.flags,
        lower = raw.mem_lower,
        upper = raw.mem_upper,
        cmdline = boot_info.cmdline,
        mmap_addr = raw.mmap_addr,
        mmap_len = raw.mmap_length,
        regions = boot_info.regions.len(),
        mods_addr = raw.mods_addr,
        mods = raw.mods_count,
    );
    for region in &boot_info.regions {
        debug!("  {region:?}");
    }
    for module in boot_info.modules() {
        // SAFETY: the entry comes from the loader's list.
        let name = unsafe { boot::module_cmdline(&module) };
        debug!(
            "  module {:#010x}..{:#010x} {name:?}",
            module.start, module.end
        );
    }
}

pub fn log_ctrl_bits() {
    // SAFETY: ring 0.
    let cr0 = unsafe { Cr0::load_unsafe() };
    info!(
        "CR0={:08x} (PG={} WP={} PE={})",
        cr0.into_bits(),
        u8::from(cr0.pg_paging()),
        u8::from(cr0.wp_write_protect()),
        u8::from(cr0.pe_protection_enable()),
    );
}
