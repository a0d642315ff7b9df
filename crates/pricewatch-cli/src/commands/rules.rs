use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};
use pricewatch_core::RuleSet;
use serde::Serialize;

use crate::cli::OutputFormat;
use crate::output::{print_json, print_table};

#[derive(Serialize)]
struct RuleSummary<'a> {
    name: &'a str,
    source: u32,
    currency: u32,
    patterns: usize,
    chains: usize,
    scripts: Vec<&'a str>,
    origin: &'a str,
}

pub fn run(dir: &Path, format: OutputFormat) -> Result<()> {
    let rules = RuleSet::load(dir).with_context(|| format!("Invalid rules in {:?}", dir))?;
    let summaries: Vec<RuleSummary> = rules
        .rules()
        .iter()
        .map(|rule| RuleSummary {
            name: &rule.name,
            source: rule.source,
            currency: rule.currency,
            patterns: rule.matches.len(),
            chains: rule.chains.len(),
            scripts: rule.scripts.iter().map(|script| script.name.as_str()).collect(),
            origin: &rule.origin,
        })
        .collect();

    if format.is_json() {
        return print_json(&summaries);
    }

    if summaries.is_empty() {
        println!("No rules found in {}.", dir.display());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Name", "Source", "Currency", "Chains", "Scripts", "File"]);
    for summary in &summaries {
        table.add_row(vec![
            Cell::new(summary.name),
            Cell::new(summary.source),
            Cell::new(summary.currency),
            Cell::new(summary.chains),
            Cell::new(summary.scripts.join(", ")),
            Cell::new(summary.origin),
        ]);
    }
    print_table(table);
    println!("{} rules OK", summaries.len());
    Ok(())
}
