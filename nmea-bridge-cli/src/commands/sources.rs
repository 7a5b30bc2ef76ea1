//! `nmea-bridge sources`: one-shot look at what ModemManager offers.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::json;
use tabled::{settings::Style, Table, Tabled};

use nmea_bridge_core::DiscoveredSource;
use nmea_bridge_daemon::list_sources_blocking;

#[derive(Args, Debug)]
pub struct SourcesArgs {
    /// Emit JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct SourceTableRow {
    #[tabled(rename = "object")]
    identity: String,
    #[tabled(rename = "modem")]
    modem: String,
    #[tabled(rename = "capabilities")]
    capabilities: String,
    #[tabled(rename = "nmea")]
    nmea: String,
}

impl SourcesArgs {
    pub fn run(self) -> Result<()> {
        let sources = list_sources_blocking().context("failed to enumerate ModemManager modems")?;

        if self.json {
            let rows: Vec<_> = sources.iter().map(source_json).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&rows).context("failed to render sources JSON")?
            );
            return Ok(());
        }

        if sources.is_empty() {
            println!("no modems with a Location interface");
            return Ok(());
        }
        let mut table = Table::new(sources.iter().map(table_row));
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn source_json(source: &DiscoveredSource) -> serde_json::Value {
    json!({
        "identity": source.identity.as_str(),
        "modem": source.identity.modem_index(),
        "capabilities": source.capabilities.bits(),
        "nmea": source.capabilities.supports_nmea(),
    })
}

fn table_row(source: &DiscoveredSource) -> SourceTableRow {
    SourceTableRow {
        identity: source.identity.to_string(),
        modem: source
            .identity
            .modem_index()
            .map_or_else(|| "-".to_string(), |index| index.to_string()),
        capabilities: source.capabilities.to_string(),
        nmea: if source.capabilities.supports_nmea() {
            "yes".green().bold().to_string()
        } else {
            "no".red().to_string()
        },
    }
}
