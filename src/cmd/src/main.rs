use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use common::metrics::process_unix::ProcessRecorder;
use proxy::config::ProxyServerArgs;
use proxy::decryptor::{Mode, PoisonPolicy};
use proxy::error::ProxyError;
use proxy::keystore::envelope::MasterKey;
use proxy::keystore::{KeyKind, Keystore};
use proxy::pipeline::PipelineConfig;
use proxy::protocol::ByteaFormat;
use proxy::server::{ServerLifecycle, ServerState};
use proxy::transport::raw::RawConfig;
use proxy::transport::secure_session::SecureSessionConfig;
use proxy::transport::tls::{DbTlsConfig, TlsConfig};
use proxy::transport::TransportWrapper;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;
use x25519_dalek::{PublicKey, StaticSecret};

/// The companion authentication-manager utility: a thin `keys` subcommand reusing the
/// same `Keystore` code path the running server reads from, rather than a separate tool.
#[derive(Parser, Clone, Debug)]
#[command(name = "acra-server", about = "Transparent decryption gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ProxyServerArgs,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Keystore provisioning: generate a new key, or derive and print a stored key's
    /// public half.
    Keys(KeysArgs),
}

#[derive(Parser, Clone, Debug)]
struct KeysArgs {
    #[command(subcommand)]
    action: KeysAction,
}

#[derive(Subcommand, Clone, Debug)]
enum KeysAction {
    /// Generates a fresh key under `--kind`/`--id` and stores it, envelope-sealed.
    Generate {
        #[arg(long)]
        kind: KeyKindArg,
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = false)]
        overwrite: bool,
        #[arg(long, default_value = "/var/lib/proxy/keys")]
        keys_dir: std::path::PathBuf,
    },
    /// Reads a stored private key and prints the X25519 public key derived from it, hex
    /// encoded. Not meaningful for the symmetric-only kinds (poison, auth-entry).
    ExportPublic {
        #[arg(long)]
        kind: KeyKindArg,
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "/var/lib/proxy/keys")]
        keys_dir: std::path::PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KeyKindArg {
    ClientStorage,
    Zone,
    Connector,
    Server,
    Poison,
    Auth,
}

impl KeyKindArg {
    fn as_key_kind(self) -> KeyKind {
        match self {
            KeyKindArg::ClientStorage => KeyKind::ClientStoragePrivate,
            KeyKindArg::Zone => KeyKind::ZonePrivate,
            KeyKindArg::Connector => KeyKind::ConnectorTransport,
            KeyKindArg::Server => KeyKind::ServerTransport,
            KeyKindArg::Poison => KeyKind::PoisonPrivate,
            KeyKindArg::Auth => KeyKind::AuthEntry,
        }
    }

    fn supports_public_export(self) -> bool {
        !matches!(self, KeyKindArg::Poison | KeyKindArg::Auth)
    }
}

fn run_keys_command(args: KeysArgs) -> Result<(), Box<dyn std::error::Error>> {
    match args.action {
        KeysAction::Generate {
            kind,
            id,
            overwrite,
            keys_dir,
        } => {
            let master_key = MasterKey::from_env("ACRA_MASTER_KEY")?;
            let keystore = Keystore::open(keys_dir, master_key, 0);
            keystore.generate_key_pair(kind.as_key_kind(), &id, overwrite)?;
            info!(?kind, %id, "key generated");
            Ok(())
        }
        KeysAction::ExportPublic { kind, id, keys_dir } => {
            if !kind.supports_public_export() {
                return Err(format!("{kind:?} has no derivable public half").into());
            }
            let master_key = MasterKey::from_env("ACRA_MASTER_KEY")?;
            let keystore = Keystore::open(keys_dir, master_key, 0);
            let private_bytes = keystore.get_private_key(kind.as_key_kind(), &id)?;
            let secret = static_secret_from(private_bytes)?;
            let public = PublicKey::from(&secret);
            println!("{}", hex::encode(public.as_bytes()));
            Ok(())
        }
    }
}

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn static_secret_from(bytes: Vec<u8>) -> Result<StaticSecret, Box<dyn std::error::Error>> {
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| "key material is not 32 bytes")?;
    Ok(StaticSecret::from(arr))
}

fn public_key_from(bytes: Vec<u8>) -> Result<PublicKey, Box<dyn std::error::Error>> {
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| "key material is not 32 bytes")?;
    Ok(PublicKey::from(arr))
}

/// Scans `keys_dir` for `*_connector` public-key files and loads them into the secure
/// session wrapper's known-peers table, mirroring the `_connector` suffix the keystore
/// itself uses for `KeyKind::ConnectorTransport` (§4.1).
fn load_known_peers(
    keystore: &Keystore,
    keys_dir: &Path,
) -> Result<HashMap<String, PublicKey>, Box<dyn std::error::Error>> {
    let mut peers = HashMap::new();
    let entries = match std::fs::read_dir(keys_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("reading keys dir {keys_dir:?} for known peers: {e}");
            return Ok(peers);
        }
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(client_id) = name.strip_suffix("_connector") else {
            continue;
        };
        match keystore.get_public_key(KeyKind::ConnectorTransport, client_id) {
            Ok(bytes) => match public_key_from(bytes) {
                Ok(pk) => {
                    peers.insert(client_id.to_string(), pk);
                }
                Err(e) => warn!("skipping malformed connector key for {client_id:?}: {e}"),
            },
            Err(e) => warn!("reading connector key for {client_id:?}: {e}"),
        }
    }
    Ok(peers)
}

fn build_transport(
    args: &ProxyServerArgs,
    keystore: &Keystore,
) -> Result<TransportWrapper, Box<dyn std::error::Error>> {
    if args.acraconnector_tls_transport_enable {
        let key_path = args
            .tls_key
            .clone()
            .ok_or("--tls-key is required when --acraconnector-tls-transport-enable is set")?;
        let cert_path = args
            .tls_cert
            .clone()
            .ok_or("--tls-cert is required when --acraconnector-tls-transport-enable is set")?;
        return Ok(TransportWrapper::Tls(Box::new(TlsConfig {
            key_path,
            cert_path,
            ca_path: args.tls_ca.clone(),
            client_auth: args.client_auth_mode(),
            client_id_override: args.client_id.clone(),
        })));
    }

    if args.acraconnector_transport_encryption_disable {
        let client_id = args
            .client_id
            .clone()
            .ok_or("--client-id is required when transport encryption is disabled")?;
        return Ok(TransportWrapper::Raw(RawConfig { client_id }));
    }

    let own_id = args
        .securesession_id
        .clone()
        .unwrap_or_else(|| "acra_server".to_string());
    let own_key_bytes = keystore.get_private_key(KeyKind::ServerTransport, &own_id)?;
    let own_static_key = static_secret_from(own_key_bytes)?;
    let known_peers = load_known_peers(keystore, &args.keys_dir)?;
    Ok(TransportWrapper::SecureSession(SecureSessionConfig {
        own_id,
        own_static_key,
        known_peers,
    }))
}

fn init_logging(args: &ProxyServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let log_level_string = args.log_level();
    let level = Level::from_str(&log_level_string)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse()?)
        .add_directive("h2=INFO".parse()?)
        .add_directive("tower=INFO".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if let Some(Command::Keys(keys_args)) = cli.command {
        return run_keys_command(keys_args);
    }
    let args = cli.serve;
    init_logging(&args)?;

    let dialect = match args.dialect() {
        Ok(d) => d,
        Err(e) => {
            error!(code = 1000, "{e}");
            std::process::exit(1);
        }
    };

    let master_key = match MasterKey::from_env("ACRA_MASTER_KEY") {
        Ok(k) => k,
        Err(e) => {
            error!(code = 1100, "loading ACRA_MASTER_KEY: {e}");
            std::process::exit(1);
        }
    };
    let keystore = Arc::new(Keystore::open(
        args.keys_dir.clone(),
        master_key,
        args.keystore_cache_size,
    ));

    let censor = match proxy::censor::Censor::load(args.acracensor_config_file.as_deref()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(code = 1000, "loading censor policy: {e}");
            std::process::exit(1);
        }
    };

    let transport = match build_transport(&args, &keystore) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(code = 1000, "building transport wrapper: {e}");
            std::process::exit(1);
        }
    };

    let decrypt_mode = if args.acrastruct_injectedcell_enable {
        Mode::InjectedCell
    } else {
        Mode::WholeCell
    };

    let bytea_format = if args.pgsql_escape_bytea {
        ByteaFormat::Escape
    } else {
        ByteaFormat::Hex
    };

    let poison_policy = PoisonPolicy {
        detect: args.poison_detect_enable,
        shutdown: args.poison_shutdown_enable,
        run_script: args.poison_run_script_file.clone(),
    };

    let db_tls = args.tls_db_sni.clone().map(|sni| DbTlsConfig {
        sni,
        ca_path: args.tls_ca.clone(),
        cert_path: args.tls_cert.clone(),
        key_path: args.tls_key.clone(),
        client_auth: args.client_auth_mode(),
    });

    let pipeline_cfg = Arc::new(PipelineConfig {
        dialect,
        bytea_format,
        decrypt_mode,
        poison_policy,
        zonemode_enable: args.zonemode_enable,
        db_addr: args.db_addr(),
        db_tls,
        keystore: keystore.clone(),
        censor,
        transport,
    });

    let data_addr: SocketAddr = args.data_listener_addr().parse().map_err(|e| {
        format!("invalid data listener address {:?}: {e}", args.data_listener_addr())
    })?;
    let api_addr: Option<SocketAddr> = if args.api_listener_enabled() {
        Some(
            args.api_listener_addr()
                .parse()
                .map_err(|e| format!("invalid api listener address {:?}: {e}", args.api_listener_addr()))?,
        )
    } else {
        None
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("proxy-worker")
        .build()?;

    info!(?dialect, data_addr = %args.data_listener_addr(), "proxy starting");

    let exit_code = runtime.block_on(async move {
        common::metrics::init_metrics_context();

        let (lifecycle, mut error_rx) = ServerLifecycle::new();

        let process_recorder_lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let mut recorder = ProcessRecorder::new(
                common::metrics::common_labels().clone(),
                process_recorder_lifecycle.subscribe_shutdown(),
            );
            recorder.start_auto_collect().await;
        });

        let error_lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            while let Some(err) = error_rx.recv().await {
                warn!(code = err.code(), "fatal error signaled: {err}");
                error_lifecycle.begin_shutdown(format!("error: {err}"));
                if matches!(err, ProxyError::System(_)) {
                    break;
                }
            }
        });

        let admin: Option<Arc<dyn proxy::server::AdminHandler>> = if api_addr.is_some() {
            Some(Arc::new(web_service::admin::WebAdminHandler::new(true)))
        } else {
            None
        };

        let server = ServerState {
            lifecycle,
            pipeline_cfg,
            admin,
            drain_timeout: std::time::Duration::from_secs(args.incoming_connection_close_timeout),
        };

        server.run(data_addr, api_addr).await
    });

    std::process::exit(exit_code);
}
