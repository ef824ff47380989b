use driftfix_config::AppConfig;

/// Print the startup banner with the serve summary.
pub fn print_banner(host: &str, port: u16, config: &AppConfig, steps: usize, latest: &str) {
    let version = env!("CARGO_PKG_VERSION");

    let database = config
        .database
        .path
        .as_ref()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| "none".to_string());
    let database = match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => database.replace(&home, "~"),
        _ => database,
    };

    let mode = if config.database.multisite {
        "multisite"
    } else {
        "single site"
    };
    let geocoder = if config.geocoder.enabled {
        config.geocoder.base_url.as_str()
    } else {
        "disabled"
    };
    let admins = config.security.admins.len();

    let url = format!("http://{host}:{port}");

    // Layout
    let width = 70;
    let left_w = 27;
    let right_w = width - left_w - 3; // 3 for "│ " + "│"

    let title = format!("driftfix v{version}");
    let title_dashes = width - 2 - title.len() - 5; // 2 for ╭╮, 5 for "─── " + " "
    let top = format!("╭─── {title} {}╮", "─".repeat(title_dashes));
    let bottom = format!("╰{}╯", "─".repeat(width - 2));

    let fit = |s: &str| {
        if s.chars().count() > right_w {
            let tail: String = s.chars().rev().take(right_w - 1).collect();
            format!("…{}", tail.chars().rev().collect::<String>())
        } else {
            s.to_string()
        }
    };
    let row = |l: &str, r: &str| format!("│ {:<left_w$}│  {:<right_w$}│", l, fit(r));

    println!("{top}");
    println!("{}", row("", ""));
    println!("{}", row("  Migration trigger", &url));
    println!("{}", row("", &"─".repeat(right_w - 2)));
    println!("{}", row("      _~^~^~_", &format!("Database  {database}")));
    println!("{}", row("  \\) /  o o  \\ (/", &format!("Mode      {mode}")));
    println!(
        "{}",
        row("    '_   -   _'", &format!("Steps     {steps} (latest {latest})"))
    );
    println!("{}", row("    / '-----' \\", &format!("Geocoder  {geocoder}")));
    println!("{}", row("", &format!("Admins    {admins}")));
    println!("{}", row("", "Press Ctrl+C to stop"));
    println!("{}", row("", ""));
    println!("{bottom}");
}
