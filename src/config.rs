//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::path::PathBuf;

use crate::build;
use crate::executor::DEFAULT_RUN_AS;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024 * 1024;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "formrun", version = VERSION_INFO, about = "Web forms in front of scripts")]
pub struct Args {
    #[arg(env = "FORMRUN_CONFIG", help = "Form configuration file (JSON)")]
    pub config_file: PathBuf,
    #[arg(
        short = 'b',
        long,
        env = "FORMRUN_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub bind: String,
    #[arg(
        short = 'p',
        long,
        env = "FORMRUN_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'r',
        long,
        env = "FORMRUN_RELOAD",
        help = "Reload the configuration on every request"
    )]
    pub reload: bool,
    #[arg(
        long,
        env = "FORMRUN_UPLOAD_DIR",
        help = "Directory for uploaded temp files (defaults to the system temp dir)"
    )]
    pub upload_dir: Option<PathBuf>,
    #[arg(
        long,
        env = "FORMRUN_MAX_BODY_SIZE",
        default_value_t = DEFAULT_MAX_BODY_SIZE,
        help = "Max request body size in bytes (0 to disable)"
    )]
    pub max_body_size: u64,
    #[arg(
        long,
        env = "FORMRUN_DEFAULT_RUN_AS",
        default_value = DEFAULT_RUN_AS,
        help = "Account scripts run as when started as root and the form sets no run_as"
    )]
    pub default_run_as: String,
    #[arg(
        long,
        env = "FORMRUN_TRUSTED_USER_HEADER",
        help = "Request header carrying a user name set by a trusted reverse proxy"
    )]
    pub trusted_user_header: Option<String>,
    #[arg(long, env = "FORMRUN_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}

impl Args {
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_optional_flags() {
        let args = Args::try_parse_from(["formrun", "forms.json"]).expect("parse");
        assert_eq!(args.config_file, PathBuf::from("forms.json"));
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.bind, "0.0.0.0");
        assert_eq!(args.default_run_as, "nobody");
        assert!(!args.reload);
        assert!(args.trusted_user_header.is_none());
    }

    #[test]
    fn short_flags_are_accepted() {
        let args = Args::try_parse_from(["formrun", "-r", "-p", "9000", "-b", "127.0.0.1", "f.json"])
            .expect("parse");
        assert!(args.reload);
        assert_eq!(args.port, 9000);
        assert_eq!(args.bind, "127.0.0.1");
    }
}
