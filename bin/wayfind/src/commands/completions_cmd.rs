use clap_complete::{generate, Shell};

/// Generate shell completion scripts.
///
/// A minimal CLI definition is rebuilt here so this module does not depend
/// on the `Cli` struct in main.rs.
pub async fn run(shell: &str) -> anyhow::Result<()> {
    let shell = match shell.to_lowercase().as_str() {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" | "ps" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            anyhow::bail!(
                "Unsupported shell: {}. Options: bash, zsh, fish, powershell, elvish",
                shell
            );
        }
    };

    let mut cmd = build_cli();
    generate(shell, &mut cmd, "wayfind", &mut std::io::stdout());

    eprintln!();
    eprintln!("# Usage:");
    match shell {
        Shell::Bash => {
            eprintln!("#   wayfind completions bash > ~/.local/share/bash-completion/completions/wayfind");
            eprintln!("#   or: eval \"$(wayfind completions bash)\"");
        }
        Shell::Zsh => {
            eprintln!("#   wayfind completions zsh > ~/.zfunc/_wayfind");
            eprintln!("#   Make sure fpath includes ~/.zfunc and run compinit");
        }
        Shell::Fish => {
            eprintln!("#   wayfind completions fish > ~/.config/fish/completions/wayfind.fish");
        }
        _ => {}
    }

    Ok(())
}

fn build_cli() -> clap::Command {
    clap::Command::new("wayfind")
        .about("Inspect and maintain the wayfind selector cache")
        .subcommand(clap::Command::new("stats").about("Show cache and store statistics"))
        .subcommand(clap::Command::new("query").about("List stored selectors for a url or domain"))
        .subcommand(clap::Command::new("lookup").about("Resolve the best selector for a test id"))
        .subcommand(clap::Command::new("predict").about("Predict the next pages after a url"))
        .subcommand(clap::Command::new("cleanup").about("Remove expired selectors"))
        .subcommand(clap::Command::new("delete").about("Delete a selector by id"))
        .subcommand(
            clap::Command::new("navigation")
                .about("Manage navigation history")
                .subcommand(clap::Command::new("reset").about("Forget recorded transitions")),
        )
        .subcommand(
            clap::Command::new("config")
                .about("Manage configuration")
                .subcommand(clap::Command::new("show").about("Show the effective configuration"))
                .subcommand(clap::Command::new("init").about("Write a default config file")),
        )
        .subcommand(clap::Command::new("completions").about("Generate shell completions"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_cli_lists_commands() {
        let cmd = build_cli();
        let names: Vec<&str> = cmd.get_subcommands().map(|c| c.get_name()).collect();
        assert!(names.contains(&"lookup"));
        assert!(names.contains(&"navigation"));
    }
}
