use std::path::PathBuf;

use clap::Parser;

use crate::protocol::Dialect;
use crate::transport::ClientAuthMode;

/// Command-line surface (§6). Field defaults mirror the flags' documented defaults so a
/// bare invocation comes up in a safe, conservative configuration.
#[derive(Parser, Clone, Debug)]
#[command(name = "acra-server", about = "Transparent decryption gateway")]
pub struct ProxyServerArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub db_host: String,

    #[arg(long, default_value_t = 5432)]
    pub db_port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    pub incoming_connection_host: String,

    #[arg(long, default_value_t = 9393)]
    pub incoming_connection_port: u16,

    #[arg(long, default_value_t = 9090)]
    pub incoming_connection_api_port: u16,

    /// Starts the admin HTTP listener. Zone mode implies it too (§9): key generation and
    /// zone management need the admin surface even when it wasn't asked for explicitly.
    #[arg(long, default_value_t = false)]
    pub enable_http_api: bool,

    #[arg(long, default_value = "/var/lib/proxy/keys")]
    pub keys_dir: PathBuf,

    /// `-1` disables the decrypted-key cache, `0` makes it unbounded, `n>0` bounds it.
    /// Defaults to unbounded (§6).
    #[arg(long, default_value_t = 0)]
    pub keystore_cache_size: i64,

    #[arg(long)]
    pub securesession_id: Option<String>,

    #[arg(long, default_value_t = false)]
    pub acraconnector_tls_transport_enable: bool,

    #[arg(long, default_value_t = false)]
    pub acraconnector_transport_encryption_disable: bool,

    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    #[arg(long)]
    pub tls_ca: Option<PathBuf>,

    #[arg(long)]
    pub tls_db_sni: Option<String>,

    /// Numeric `ClientAuthMode`: 0=none, 1=request, 2=require-any, 3=verify-if-given,
    /// 4=require-and-verify.
    #[arg(long, default_value_t = 0)]
    pub tls_auth: u8,

    #[arg(long)]
    pub client_id: Option<String>,

    #[arg(long, default_value_t = false)]
    pub mysql_enable: bool,

    #[arg(long, default_value_t = false)]
    pub postgresql_enable: bool,

    #[arg(long)]
    pub acracensor_config_file: Option<PathBuf>,

    #[arg(long, default_value_t = true)]
    pub poison_detect_enable: bool,

    #[arg(long, default_value_t = false)]
    pub poison_shutdown_enable: bool,

    #[arg(long)]
    pub poison_run_script_file: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub zonemode_enable: bool,

    #[arg(long, default_value_t = false)]
    pub acrastruct_injectedcell_enable: bool,

    #[arg(long, default_value_t = 10)]
    pub incoming_connection_close_timeout: u64,

    #[arg(long, default_value_t = true)]
    pub pgsql_hex_bytea: bool,

    #[arg(long, default_value_t = false)]
    pub pgsql_escape_bytea: bool,

    #[arg(short = 'v', long, default_value_t = false)]
    pub verbose: bool,

    #[arg(short = 'd', long, default_value_t = false)]
    pub debug: bool,
}

impl ProxyServerArgs {
    /// `--postgresql-enable`/`--mysql-enable` select the wire dialect; neither given
    /// defaults to Postgres (§6), so only setting both at once is rejected.
    pub fn dialect(&self) -> Result<Dialect, String> {
        match (self.mysql_enable, self.postgresql_enable) {
            (true, false) => Ok(Dialect::MySql),
            (false, true) => Ok(Dialect::Postgres),
            (false, false) => Ok(Dialect::Postgres),
            (true, true) => Err("--mysql-enable and --postgresql-enable are mutually exclusive".to_string()),
        }
    }

    pub fn client_auth_mode(&self) -> ClientAuthMode {
        ClientAuthMode::from_u8(self.tls_auth)
    }

    /// `-d` wins over `-v`; neither flag keeps the default quiet-ish level (§10.1).
    pub fn log_level(&self) -> String {
        if self.debug {
            "DEBUG".to_string()
        } else if self.verbose {
            "INFO".to_string()
        } else {
            "WARN".to_string()
        }
    }

    pub fn data_listener_addr(&self) -> String {
        format!("{}:{}", self.incoming_connection_host, self.incoming_connection_port)
    }

    pub fn api_listener_addr(&self) -> String {
        format!("{}:{}", self.incoming_connection_host, self.incoming_connection_api_port)
    }

    /// Whether the admin listener should be bound at all (§9 resolved open question).
    pub fn api_listener_enabled(&self) -> bool {
        self.enable_http_api || self.zonemode_enable
    }

    pub fn db_addr(&self) -> String {
        format!("{}:{}", self.db_host, self.db_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_defaults_to_postgres() {
        let mut args = ProxyServerArgs::parse_from(["acra-server"]);
        assert!(matches!(args.dialect(), Ok(Dialect::Postgres)));

        args.mysql_enable = true;
        assert!(matches!(args.dialect(), Ok(Dialect::MySql)));

        args.postgresql_enable = true;
        assert!(args.dialect().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = ProxyServerArgs::parse_from(["acra-server", "--postgresql-enable"]);
        assert_eq!(args.incoming_connection_port, 9393);
        assert_eq!(args.incoming_connection_api_port, 9090);
        assert_eq!(args.keystore_cache_size, 0);
        assert!(args.pgsql_hex_bytea);
        assert!(!args.pgsql_escape_bytea);
        assert!(args.poison_detect_enable);
        assert!(!args.poison_shutdown_enable);
    }
}
