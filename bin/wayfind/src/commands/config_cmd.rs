use std::path::PathBuf;

use wayfind_core::{Config, Paths};

/// Show the effective configuration as pretty-printed JSON.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let source = if paths.config_file().exists() {
        paths.config_file().display().to_string()
    } else {
        "(defaults, no config file)".to_string()
    };

    println!();
    println!("📋 Current Configuration");
    println!("  File:     {}", source);
    println!("  Database: {}", paths.selector_db().display());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Write the default config and create the data directories.
pub async fn init(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    match write_default(&paths, force)? {
        Some(path) => println!("✓ Created config: {}", path.display()),
        None => println!(
            "Config already exists: {} (use --force to overwrite)",
            paths.config_file().display()
        ),
    }
    Ok(())
}

fn write_default(paths: &Paths, force: bool) -> anyhow::Result<Option<PathBuf>> {
    let path = paths.config_file();
    if path.exists() && !force {
        return Ok(None);
    }
    paths.ensure_dirs()?;
    Config::default().save(&path)?;
    Ok(Some(path))
}
