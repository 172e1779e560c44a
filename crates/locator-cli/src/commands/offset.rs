//! Offset command implementation.

use anyhow::{Result, bail};
use locator_core::offset::searcher::constants::SCAN_STRIDE;

/// Parse a hex address string (with or without 0x prefix)
pub fn parse_hex_address(s: &str) -> Result<u64> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(s, 16).map_err(|e| anyhow::anyhow!("Invalid hex address: {}", e))
}

/// Chain offset from `from` to `to`, if it fits a candidate offset
pub fn chain_offset(from: u64, to: u64) -> Option<u32> {
    to.checked_sub(from).and_then(|diff| u32::try_from(diff).ok())
}

/// Run the offset command
pub fn run(from: &str, to: &str) -> Result<()> {
    let from_addr = parse_hex_address(from)?;
    let to_addr = parse_hex_address(to)?;

    println!("From: 0x{:X}", from_addr);
    println!("To:   0x{:X}", to_addr);
    println!();

    let Some(offset) = chain_offset(from_addr, to_addr) else {
        bail!("0x{:X} is not a chain offset from 0x{:X}", to_addr, from_addr);
    };
    println!("Offset: 0x{:X} ({})", offset, offset);
    if offset % SCAN_STRIDE != 0 {
        println!("Note: not on a {}-byte scan stride", SCAN_STRIDE);
    }
    Ok(())
}
