//! Command-line argument parsing

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "registry-migrator")]
#[command(about = "Migrate container images between registries with architecture filtering")]
#[command(version)]
pub struct Args {
    /// HTTP/HTTPS proxy for all registry traffic
    #[arg(long, global = true, help = "Proxy address, e.g. http://127.0.0.1:7890")]
    pub proxy: Option<String>,

    /// Hosts that bypass the proxy
    #[arg(
        long = "no-proxy",
        global = true,
        help = "Comma separated hosts, domains or CIDR ranges that bypass the proxy"
    )]
    pub no_proxy: Option<String>,

    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(
        long,
        short = 'q',
        global = true,
        conflicts_with = "verbose",
        help = "Only print warnings and errors"
    )]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List every repository of a registry
    ListImages(RegistryArgs),

    /// List the tags of a repository with architecture, size and creation time
    ListTags {
        #[command(flatten)]
        registry: RegistryArgs,

        #[arg(long, help = "Repository name, e.g. library/nginx")]
        repo: String,
    },

    /// Copy images as described by a plan file
    Migrate {
        #[arg(
            long,
            short = 'c',
            default_value = "config.yaml",
            help = "Migration plan (YAML, or JSON when the name ends in .json)"
        )]
        config: PathBuf,
    },
}

/// Connection flags shared by the listing commands
#[derive(ClapArgs, Debug, Clone)]
pub struct RegistryArgs {
    #[arg(long, help = "Registry address, e.g. localhost:5000")]
    pub registry: String,

    #[arg(long, short = 'u', help = "Username for registry authentication")]
    pub username: Option<String>,

    #[arg(long, short = 'p', help = "Password for registry authentication")]
    pub password: Option<String>,

    #[arg(long, help = "Allow plain HTTP and skip TLS certificate verification")]
    pub insecure: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "registry-migrator",
            "list-tags",
            "--registry",
            "harbor.local",
            "--repo",
            "team/app",
            "--proxy",
            "http://127.0.0.1:7890",
            "-v",
        ])
        .unwrap();
        assert!(args.verbose);
        assert_eq!(args.proxy.as_deref(), Some("http://127.0.0.1:7890"));
        match args.command {
            Command::ListTags { registry, repo } => {
                assert_eq!(registry.registry, "harbor.local");
                assert_eq!(repo, "team/app");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn migrate_defaults_to_config_yaml() {
        let args = Args::try_parse_from(["registry-migrator", "migrate"]).unwrap();
        match args.command {
            Command::Migrate { config } => assert_eq!(config, PathBuf::from("config.yaml")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["registry-migrator", "-v", "-q", "migrate"]).is_err());
    }
}
