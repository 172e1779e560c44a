//! Plan command implementation.

use std::path::Path;

use anyhow::{Result, bail};
use locator_core::{PointerWidth, builtin_plan, save_plan};

/// Run the plan command
pub fn run(bits: u32, output: Option<&Path>) -> Result<()> {
    let Some(width) = PointerWidth::from_bytes(bits as usize / 8).filter(|_| bits % 8 == 0) else {
        bail!("Unsupported pointer width: {} bits (expected 32 or 64)", bits);
    };

    let plan = builtin_plan(width);
    match output {
        Some(path) => {
            save_plan(&plan, path)?;
            println!(
                "Saved plan '{}' ({} variants, {}) to {}",
                plan.name,
                plan.variants.len(),
                width,
                path.display()
            );
        }
        None => println!("{}", serde_json::to_string_pretty(&plan)?),
    }
    Ok(())
}
