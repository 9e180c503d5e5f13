//! Canopy CLI
//!
//! Runs the control-plane server and performs agent-side enrollment and
//! status checks against it.

use anyhow::{Context, Result};
use canopy_cert::{write_pem_file, AuthoritySettings, CertificateAuthority};
use canopy_client::{ClientConfig, ControlPlaneClient};
use canopy_control::{BrokerConfig, IdentityPolicy};
use canopy_proto::{ApprovedCredentials, CredentialsRequest, ServingStatus};
use canopy_server::{ControlPlaneServer, ServerConfig};
use canopy_transport::ClientAuthMode;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Canopy - control plane for a fleet of remote cluster agents
#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(about = "Canopy - control plane for a fleet of remote cluster agents")]
#[command(version = env!("CANOPY_RELEASE"))]
#[command(long_version = concat!(env!("CANOPY_RELEASE"), "\nCommit: ", env!("CANOPY_REVISION"), "\nBuilt: ", env!("CANOPY_BUILT_AT")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-plane server
    #[command(long_about = r#"
Run the control-plane server. Agents enroll over TLS, receive a client
certificate signed by the platform CA, then open an agent stream with it.

EXAMPLES:
  # Development: generated CA, token-bearing agents approved automatically
  canopy serve --listen 0.0.0.0:9090

  # Persist the CA and require client certificates on the main listener,
  # serving enrollment on a separate port
  canopy serve --ca-cert /etc/canopy/ca.crt --ca-key /etc/canopy/ca.key --save-ca \
    --require-client-cert --enrollment-listen 0.0.0.0:9091 --no-auto-approve

ENVIRONMENT VARIABLES:
  CANOPY_LISTEN_ADDR       Main listener address
  CANOPY_ENROLLMENT_ADDR   Enrollment listener address (optional)
  CANOPY_CA_CERT           CA certificate path
  CANOPY_CA_KEY            CA private key path
    "#)]
    Serve(ServeArgs),

    /// Request credentials for a cluster and write them to disk
    Enroll(EnrollArgs),

    /// Show the credential and connection status of a cluster
    Status {
        #[command(flatten)]
        server: ServerArgs,

        /// Cluster identifier
        #[arg(long, env = "CANOPY_CLUSTER_ID")]
        cluster_id: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check that the control plane is serving
    Health {
        #[command(flatten)]
        server: ServerArgs,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Main listener address
    #[arg(long, env = "CANOPY_LISTEN_ADDR", default_value = "0.0.0.0:9090")]
    listen: SocketAddr,

    /// Enrollment-only listener address (client certificates never required)
    #[arg(long, env = "CANOPY_ENROLLMENT_ADDR")]
    enrollment_listen: Option<SocketAddr>,

    /// CA certificate path; loaded when it exists together with --ca-key
    #[arg(long, env = "CANOPY_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// CA private key path
    #[arg(long, env = "CANOPY_CA_KEY")]
    ca_key: Option<PathBuf>,

    /// Write a newly generated CA to --ca-cert/--ca-key
    #[arg(long, env = "CANOPY_SAVE_CA")]
    save_ca: bool,

    /// Organization in the CA and issued certificate subjects
    #[arg(long, env = "CANOPY_ORGANIZATION", default_value = "Canopy Platform")]
    organization: String,

    /// DNS names for the server certificate (comma separated)
    #[arg(long, env = "CANOPY_SERVER_DNS_NAMES", value_delimiter = ',')]
    server_dns_names: Vec<String>,

    /// Reject connections without a client certificate on the main listener
    #[arg(long, env = "CANOPY_REQUIRE_CLIENT_CERT")]
    require_client_cert: bool,

    /// Accept the cluster an agent declares without checking its certificate
    /// (insecure, for development only)
    #[arg(long, env = "CANOPY_TRUST_DECLARED_IDENTITY")]
    trust_declared_identity: bool,

    /// Hold token-bearing requests for admin approval instead of approving them
    #[arg(long, env = "CANOPY_NO_AUTO_APPROVE")]
    no_auto_approve: bool,

    /// Seconds without a heartbeat before an agent is marked unhealthy
    #[arg(long, env = "CANOPY_HEARTBEAT_TIMEOUT", default_value = "90")]
    heartbeat_timeout: u64,

    /// Seconds between health sweeps
    #[arg(long, env = "CANOPY_HEALTH_CHECK_INTERVAL", default_value = "30")]
    health_check_interval: u64,
}

#[derive(Args, Debug)]
struct EnrollArgs {
    #[command(flatten)]
    server: ServerArgs,

    /// Cluster identifier
    #[arg(long, env = "CANOPY_CLUSTER_ID")]
    cluster_id: String,

    /// Human-readable cluster name
    #[arg(long, env = "CANOPY_CLUSTER_NAME")]
    cluster_name: String,

    /// API token (development servers approve token-bearing requests)
    #[arg(long, env = "CANOPY_API_TOKEN")]
    token: Option<String>,

    /// Runtime version reported to the control plane
    #[arg(long, env = "CANOPY_RUNTIME_VERSION", default_value = "")]
    runtime_version: String,

    /// Directory receiving client.crt, client.key, ca.crt and credentials.json
    #[arg(long, env = "CANOPY_CREDENTIALS_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Poll interval in seconds while pending (defaults to the server's advice)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Give up after this many seconds (0 = wait indefinitely)
    #[arg(long, default_value = "0")]
    timeout: u64,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Control-plane address (host:port)
    #[arg(long, env = "CANOPY_SERVER", default_value = "localhost:9090")]
    server: String,

    /// Name expected in the server certificate
    #[arg(long, env = "CANOPY_SERVER_NAME", default_value = "canopy-server")]
    server_name: String,

    /// Platform CA certificate used to verify the server
    #[arg(long, env = "CANOPY_CA_CERT")]
    ca_cert: PathBuf,
}

impl ServerArgs {
    fn client(&self) -> Result<ControlPlaneClient> {
        let ca_pem = std::fs::read_to_string(&self.ca_cert)
            .with_context(|| format!("Failed to read CA certificate {}", self.ca_cert.display()))?;
        let config = ClientConfig::new(&self.server, ca_pem).with_server_name(&self.server_name);
        ControlPlaneClient::new(config).context("Failed to configure client")
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Load the CA from disk, or generate one (and optionally persist it)
fn load_or_generate_ca(args: &ServeArgs, settings: AuthoritySettings) -> Result<CertificateAuthority> {
    if let (Some(cert_path), Some(key_path)) = (&args.ca_cert, &args.ca_key) {
        if cert_path.exists() && key_path.exists() {
            info!("Loading CA from {}", cert_path.display());
            return CertificateAuthority::load_from_files(cert_path, key_path, settings)
                .context("Failed to load CA");
        }
    }

    info!("Generating new root CA");
    let ca = CertificateAuthority::generate(settings).context("Failed to generate CA")?;

    if args.save_ca {
        match (&args.ca_cert, &args.ca_key) {
            (Some(cert_path), Some(key_path)) => {
                ca.save_to_files(cert_path, key_path)
                    .context("Failed to save CA")?;
                info!("CA saved to {} and {}", cert_path.display(), key_path.display());
            }
            _ => warn!("--save-ca needs both --ca-cert and --ca-key; CA not saved"),
        }
    } else {
        warn!("CA is not persisted; issued agent certificates become invalid on restart");
    }

    Ok(ca)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut settings = AuthoritySettings::default().with_organization(&args.organization);
    if !args.server_dns_names.is_empty() {
        settings = settings.with_server_dns_names(args.server_dns_names.clone());
    }
    let authority = Arc::new(load_or_generate_ca(&args, settings)?);

    let mut config = ServerConfig::default()
        .with_listen_addr(args.listen)
        .with_heartbeat_timeout(Duration::from_secs(args.heartbeat_timeout))
        .with_health_check_interval(Duration::from_secs(args.health_check_interval))
        .with_broker(BrokerConfig::default().with_auto_approve(!args.no_auto_approve));
    if let Some(addr) = args.enrollment_listen {
        config = config.with_enrollment_addr(addr);
    }
    if args.require_client_cert {
        config = config.with_client_auth(ClientAuthMode::Required);
    }
    if args.trust_declared_identity {
        warn!("⚠️  Trusting declared agent identities (insecure mode)");
        config = config.with_identity_policy(IdentityPolicy::TrustDeclared);
    }

    let server = ControlPlaneServer::new(config, authority).context("Failed to create server")?;
    let bound = server.bind().await?;
    info!("🌳 Canopy control plane listening on {}", bound.local_addr()?);
    if let Some(addr) = bound.enrollment_addr()? {
        info!("Enrollment listener on {}", addr);
    }

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(bound.serve(shutdown.clone()));

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping server..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }
    shutdown.cancel();

    server_task.await.context("Server task panicked")??;
    info!("Canopy stopped");
    Ok(())
}

async fn enroll(args: EnrollArgs) -> Result<()> {
    let client = args.server.client()?;
    let request = CredentialsRequest {
        cluster_id: args.cluster_id.clone(),
        cluster_name: args.cluster_name.clone(),
        api_token: args.token.clone(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        runtime_version: args.runtime_version.clone(),
    };

    info!("Requesting credentials for cluster {}", args.cluster_id);
    let enrollment = client.enroll(&request, args.poll_interval.map(Duration::from_secs));
    let credentials = if args.timeout > 0 {
        tokio::time::timeout(Duration::from_secs(args.timeout), enrollment)
            .await
            .context("Timed out waiting for approval")??
    } else {
        enrollment.await?
    };

    write_credentials(&args.output_dir, &credentials)?;
    info!(
        "✅ Enrolled as agent {}; credentials written to {}",
        credentials.agent_id,
        args.output_dir.display()
    );
    Ok(())
}

fn write_credentials(dir: &Path, credentials: &ApprovedCredentials) -> Result<()> {
    let write = |name: &str, contents: &str, mode: u32| {
        let path = dir.join(name);
        write_pem_file(&path, contents, mode)
            .with_context(|| format!("Failed to write {}", path.display()))
    };

    write("client.crt", &credentials.client_cert_pem, 0o644)?;
    write("client.key", &credentials.client_key_pem, 0o600)?;
    write("ca.crt", &credentials.ca_cert_pem, 0o644)?;

    let identity = serde_json::json!({
        "agent_id": credentials.agent_id,
        "agent_secret": credentials.agent_secret,
    });
    write(
        "credentials.json",
        &serde_json::to_string_pretty(&identity)?,
        0o600,
    )?;
    Ok(())
}

async fn status(server: ServerArgs, cluster_id: String, json: bool) -> Result<()> {
    let client = server.client()?;
    let credentials = client.check_status(&cluster_id).await?;
    let connection = match client.get_agent_status(&cluster_id).await {
        Ok(connection) => Some(connection),
        Err(e) => {
            warn!("Connection status unavailable: {}", e);
            None
        }
    };

    if json {
        let output = serde_json::json!({
            "cluster_id": cluster_id,
            "credential_status": credentials.status.to_string(),
            "message": credentials.message,
            "connection": connection.map(|c| serde_json::json!({
                "status": format!("{:?}", c.status).to_uppercase(),
                "session_id": c.session_id,
                "last_seen": c.last_seen.map(|t| t.to_rfc3339()),
                "health": c.health_status.map(|h| h.to_string()),
            })),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Cluster:     {}", cluster_id);
    println!("Credentials: {} ({})", credentials.status, credentials.message);
    if let Some(connection) = connection {
        println!(
            "Connection:  {}",
            format!("{:?}", connection.status).to_uppercase()
        );
        if let Some(session_id) = connection.session_id {
            println!("Session:     {}", session_id);
        }
        if let Some(last_seen) = connection.last_seen {
            println!("Last seen:   {}", last_seen.to_rfc3339());
        }
        if let Some(health) = connection.health_status {
            println!("Health:      {}", health);
        }
    }
    Ok(())
}

async fn health(server: ServerArgs) -> Result<()> {
    let health = server.client()?.health_check().await?;
    match health.status {
        ServingStatus::Serving => {
            println!("{}: SERVING", server.server);
            Ok(())
        }
        ServingStatus::NotServing => anyhow::bail!("{}: NOT_SERVING", server.server),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Enroll(args) => enroll(args).await,
        Commands::Status {
            server,
            cluster_id,
            json,
        } => status(server, cluster_id, json).await,
        Commands::Health { server } => health(server).await,
    }
}
