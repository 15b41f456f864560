use std::{env, env::VarError};

/// There's no real CLI for the server, so just do quick 'n dirty
pub fn handle_command_line_args() -> bool {
    let has_cli_args = env::args().count() > 1;
    if has_cli_args {
        // We don't expect any CLI args, so always print the help
        display_readme();
        display_envs();
    }
    has_cli_args
}

fn display_readme() {
    const README: &str = include_str!("./cli-help.txt");
    println!("\n{README}\n");
}

fn display_envs() {
    // Be explicit about which envars to print, so as to avoid accidentally exposing secrets
    const DISPLAY_ENVS: [&str; 17] = [
        "RUST_LOG",
        "MKT_HOST",
        "MKT_PORT",
        "MKT_DATABASE_URL",
        "MKT_HOLDING_PERIOD_DAYS",
        "MKT_STUCK_PAYMENT_MINUTES",
        "MKT_RECONCILIATION_INTERVAL_SECS",
        "MKT_GATEWAY_TIMEOUT_MS",
        "MKT_DEFAULT_FEE_BPS",
        "MKT_MINIMUM_FEE_BPS",
        "MKT_LEGIT_DISCOUNT_BPS",
        "MKT_MEMBERSHIP_DISCOUNT_BPS",
        "MKT_CARD_ENABLED",
        "MKT_CARD_API_URL",
        "MKT_QR_ENABLED",
        "MKT_QR_API_URL",
        "MKT_QR_CLIENT_ID",
    ];

    println!("Current environment values (EXCLUDING variables that contain secrets):");
    DISPLAY_ENVS.iter().for_each(|&name| {
        let val = match env::var(name) {
            Ok(s) => s,
            Err(VarError::NotPresent) => "Not set".into(),
            Err(VarError::NotUnicode(s)) => format!("Invalid value: {}", s.to_string_lossy()),
        };
        println!("  {name:<35} {val:<15}");
    })
}
