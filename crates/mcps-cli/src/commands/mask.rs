//! Mask command implementation.

use anyhow::Result;
use clap::Args;
use mcps_core::{ArpsMeta, Cluster, CpuMask, McpsConfig, Policy, Topology};
use serde_json::json;

use super::OutputFormat;

/// Arguments for the mask command.
#[derive(Args)]
pub struct MaskArgs {
    /// CPU set in hex bitmap form, e.g. "f0" or "1,00000000"
    pub value: String,

    /// Policy slot to label the snapshot with
    #[arg(short, long, default_value = "static")]
    pub policy: String,
}

/// Executes the mask command.
pub fn execute(args: MaskArgs, config: &McpsConfig, format: OutputFormat) -> Result<()> {
    let policy: Policy = args.policy.parse()?;
    let topology = Topology::from_config(config)?;
    let mask = CpuMask::parse(&args.value, topology.nr_cpus)?;
    let meta = ArpsMeta::build(policy, mask, &topology, 0)?;

    match format {
        OutputFormat::Table => {
            print!("{}", meta.report());
            println!();
            println!("{:<8} {:<24} {:<24}", "CLUSTER", "CPUS", "FILTERED");
            for cluster in Cluster::ALL {
                println!(
                    "{:<8} {:<24} {:<24}",
                    cluster.as_str(),
                    cpu_list(meta.map(cluster).iter()),
                    cpu_list(meta.map_filtered(cluster).iter()),
                );
            }
        }
        OutputFormat::Json => {
            let maps: serde_json::Map<String, serde_json::Value> = Cluster::ALL
                .into_iter()
                .map(|cluster| {
                    let value = json!({
                        "cpus": meta.map(cluster).iter().collect::<Vec<_>>(),
                        "filtered": meta.map_filtered(cluster).iter().collect::<Vec<_>>(),
                    });
                    (cluster.as_str().to_string(), value)
                })
                .collect();
            let out = json!({
                "policy": policy.as_str(),
                "mask": meta.mask().to_hex(topology.nr_cpus),
                "filtered": meta.mask_filtered().to_hex(topology.nr_cpus),
                "maps": maps,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

fn cpu_list(cpus: impl Iterator<Item = usize>) -> String {
    let list: Vec<String> = cpus.map(|cpu| cpu.to_string()).collect();
    if list.is_empty() {
        "-".to_string()
    } else {
        list.join(",")
    }
}
