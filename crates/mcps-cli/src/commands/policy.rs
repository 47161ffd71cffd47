//! Policy command implementation.

use anyhow::{bail, Context, Result};
use clap::Args;
use mcps_core::{ArpsStore, McpsConfig, Policy, PolicyChange};
use serde_json::json;

use super::OutputFormat;

/// Arguments for the policy command.
#[derive(Args)]
pub struct PolicyArgs {
    /// Policy assignment applied after the configuration, e.g. "dynamic=0f"
    #[arg(short, long = "set", value_name = "NAME=MASK")]
    pub assignments: Vec<String>,

    /// Reserved IRQ CPU set, applied before the assignments
    #[arg(long)]
    pub reserved_irq: Option<String>,
}

/// Executes the policy command.
pub fn execute(args: PolicyArgs, config: McpsConfig, format: OutputFormat) -> Result<()> {
    let store = ArpsStore::from_config(&config)?;
    if let Some(reserved) = &args.reserved_irq {
        store.set_reserved_irq_mask(reserved);
    }

    for assignment in &args.assignments {
        let Some((name, value)) = assignment.split_once('=') else {
            bail!("expected NAME=MASK, got '{assignment}'");
        };
        let policy: Policy = name.parse()?;
        let change = store
            .update(policy, value)
            .with_context(|| format!("failed to set {policy}"))?;
        if format == OutputFormat::Table {
            match change {
                PolicyChange::Installed { generation } => {
                    println!("{policy}: installed (generation {generation})");
                }
                PolicyChange::Removed => println!("{policy}: removed"),
            }
        }
    }

    match format {
        OutputFormat::Table => {
            print!("reserved_irq\n{}", store.reserved_irq_report());
            for policy in Policy::ALL {
                print!("{policy}\n{}", store.get(policy));
            }
        }
        OutputFormat::Json => {
            let slots: serde_json::Map<String, serde_json::Value> = Policy::ALL
                .into_iter()
                .map(|policy| (policy.as_str().to_string(), json!(store.get(policy))))
                .collect();
            let out = json!({
                "reserved_irq": store.reserved_irq_report().trim_end(),
                "policies": slots,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    store.release_all();
    Ok(())
}
