use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "emote-tracker",
    version,
    about = "Tracks emote usage across Discord guilds and reports on it"
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Drop every table before migrating
    #[arg(long, conflicts_with = "skip_migrations")]
    pub drop_tables: bool,

    /// Delete all stored rows after migrating, keeping the schema
    #[arg(long)]
    pub wipe_data: bool,

    /// Forget crawl cursors so every channel is backfilled again
    #[arg(long)]
    pub reset_crawl: bool,

    #[arg(long)]
    pub skip_migrations: bool,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::Cli;

    #[test]
    fn maintenance_flags_parse() {
        let cli = Cli::try_parse_from([
            "emote-tracker",
            "--config",
            "/etc/emote-tracker.yaml",
            "--wipe-data",
            "--reset-crawl",
        ])
        .expect("valid arguments");

        assert_eq!(cli.config, PathBuf::from("/etc/emote-tracker.yaml"));
        assert!(cli.wipe_data);
        assert!(cli.reset_crawl);
        assert!(!cli.drop_tables);
        assert!(!cli.skip_migrations);
    }

    #[test]
    fn dropping_tables_requires_migrations() {
        let result = Cli::try_parse_from(["emote-tracker", "--drop-tables", "--skip-migrations"]);
        assert!(result.is_err());
    }
}
