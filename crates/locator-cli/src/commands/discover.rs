//! Discover command implementation.

use std::path::Path;

use anyhow::Result;
use locator_core::{Locator, Profile, ProfileStore, ReadAs, ReadMemory};
use owo_colors::OwoColorize;

use super::{load_capture, load_config, resolve_plan};

/// Run the discover command
pub fn run(capture_path: &Path, plan_path: Option<&Path>, config_path: Option<&Path>, store_path: &Path) -> Result<()> {
    let capture = load_capture(capture_path)?;
    let plan = resolve_plan(plan_path, capture.pointer_width())?;
    let config = load_config(config_path)?;

    println!(
        "Capture: {} samples, {} instances, {}",
        capture.samples.len(),
        capture.instances.len(),
        capture.pointer_width()
    );
    println!("Plan: {} ({} variants)", plan.name, plan.variants.len());
    println!();

    let locator = Locator::new(&capture, &capture, &capture, plan, config)?;
    let profiles = locator.profiles()?;
    for profile in &profiles {
        print_profile(profile);
        println!();
    }

    let store = ProfileStore::new(
        locator.plan().clone(),
        profiles.iter().map(|p| (**p).clone()).collect(),
    );
    store.save_to_path(store_path)?;
    println!(
        "Saved {} profiles to {}",
        profiles.len(),
        store_path.display()
    );
    Ok(())
}

fn print_profile(profile: &Profile) {
    println!(
        "{} {} (discriminator 0x{:X})",
        "Variant".bold(),
        profile.variant.cyan(),
        profile.discriminator
    );
    for (name, field) in &profile.fields {
        let offsets: Vec<String> = field
            .chain
            .offsets
            .iter()
            .map(|o| format!("0x{:X}", o))
            .collect();
        println!(
            "  {:<16} [{}] as {}",
            name,
            offsets.join(", "),
            describe_read(&field.read)
        );
    }
}

fn describe_read(read: &ReadAs) -> String {
    match read {
        ReadAs::Slot => "slot".to_string(),
        ReadAs::Pointer => "pointer".to_string(),
        ReadAs::U32 => "u32".to_string(),
        ReadAs::U64 => "u64".to_string(),
        ReadAs::Text { encoding } => format!("{} text", encoding),
        ReadAs::Record { layout } => format!("record {}", layout),
    }
}
