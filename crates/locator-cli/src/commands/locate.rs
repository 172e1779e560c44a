//! Locate command implementation.

use std::path::Path;

use anyhow::{Result, bail};
use locator_core::{FieldValue, Locator, Outcome, ProfileStore, ReadMemory, ResultRecord};
use owo_colors::OwoColorize;
use tracing::{error, info, warn};

use super::offset::parse_hex_address;
use super::{load_capture, load_config, resolve_plan};

pub struct LocateArgs<'a> {
    pub capture: &'a Path,
    pub bases: &'a [String],
    pub plan: Option<&'a Path>,
    pub config: Option<&'a Path>,
    pub store: Option<&'a Path>,
    pub max_age_hours: Option<i64>,
    pub json: bool,
}

/// Run the locate command
pub fn run(args: LocateArgs<'_>) -> Result<()> {
    let capture = load_capture(args.capture)?;
    let plan = resolve_plan(args.plan, capture.pointer_width())?;
    let config = load_config(args.config)?;
    let locator = Locator::new(&capture, &capture, &capture, plan, config)?;

    if let Some(store) = args.store.and_then(ProfileStore::load_from_path) {
        let max_age = args.max_age_hours.map(chrono::Duration::hours);
        if store.is_valid_for(locator.plan(), max_age) {
            let mut loaded = 0;
            for profile in store.profiles {
                if locator.preload(profile)? {
                    loaded += 1;
                }
            }
            info!("Using {} stored profiles", loaded);
        } else {
            warn!("Stored profiles do not match the plan, discovering again");
        }
    }

    let bases: Vec<u64> = if args.bases.is_empty() {
        capture.instances.clone()
    } else {
        args.bases
            .iter()
            .map(|b| parse_hex_address(b))
            .collect::<Result<_>>()?
    };
    if bases.is_empty() {
        bail!("No instances to locate: the capture lists none and no --base was given");
    }

    let mut failures = 0;
    for base in bases {
        let outcome = match locator.locate(base) {
            Ok(outcome) => outcome,
            Err(e) if e.is_build_failure() => {
                error!("Instance 0x{:X}: {}", base, e);
                failures += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if args.json {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else {
            print_outcome(base, &outcome);
        }
    }

    if failures > 0 {
        bail!("{} instances could not be located", failures);
    }
    Ok(())
}

fn print_outcome(base: u64, outcome: &Outcome) {
    match outcome {
        Outcome::Located(record) => print_record(base, record),
        Outcome::Unsupported {
            discriminator: Some(discriminator),
        } => println!(
            "0x{:X}: {} (discriminator 0x{:X})",
            base,
            "unsupported".yellow(),
            discriminator
        ),
        Outcome::Unsupported { discriminator: None } => {
            println!("0x{:X}: {} (no discriminator)", base, "unsupported".yellow())
        }
    }
}

fn print_record(base: u64, record: &ResultRecord) {
    println!("0x{:X}: {} as {}", base, "located".green(), record.variant.cyan());
    for (name, value) in &record.fields {
        match value {
            FieldValue::Record(fields) => {
                println!("  {:<16}", name);
                for (field, value) in fields {
                    println!("    {:<28} 0x{:X}", field, value);
                }
            }
            other => println!("  {:<16} {}", name, format_value(other)),
        }
    }
    println!();
}

fn format_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Absent => "absent".dimmed().to_string(),
        FieldValue::Address(address) => format!("0x{:X}", address),
        FieldValue::Int(value) => format!("{} (0x{:X})", value, value),
        FieldValue::Text(text) => format!("{:?}", text),
        FieldValue::Record(fields) => format!("{} fields", fields.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&FieldValue::Address(0x1000)), "0x1000");
        assert_eq!(format_value(&FieldValue::Int(72)), "72 (0x48)");
        assert_eq!(format_value(&FieldValue::Text("a.dll".into())), "\"a.dll\"");
        assert!(format_value(&FieldValue::Absent).contains("absent"));
    }
}
