use anyhow::Result;
use comfy_table::Table;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value)?;
    println!("{output}");
    Ok(())
}

/// One compact JSON document per line.
pub fn print_json_line<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub fn print_table(table: Table) {
    println!("{table}");
}
