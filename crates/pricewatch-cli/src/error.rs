use colored::Colorize;

pub fn handle_error(err: anyhow::Error) -> ! {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let msg = format!("{:#}", err).to_lowercase();

    if msg.contains("failed to read config file") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Point to a configuration file with:");
        eprintln!("  {} pricewatch --config <FILE> ...", "$".dimmed());
    }

    if msg.contains("not answering") || msg.contains("connection refused") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Start the browser with remote debugging enabled, e.g.:");
        eprintln!(
            "  {} chromium --headless --remote-debugging-port=9222",
            "$".dimmed()
        );
    }

    if msg.contains("rules") && msg.contains("invalid") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Check the rule directory with:");
        eprintln!("  {} pricewatch rules <DIR>", "$".dimmed());
    }

    std::process::exit(1);
}
