// tinysqliteapiserver: the SQL access broker process.
//
// Launched by the first client with that client's id as the sole required
// argument.  Singleton per host: a losing contender exits with code 0
// without touching the request channel.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use broker::{BrokerConfig, singleton};

#[derive(Debug, Parser)]
#[command(name = "tinysqliteapiserver", version, about = "TinySQL API broker")]
struct Args {
    /// Id of the client that launched the broker.
    client_id: i32,

    /// Directory for the request/response sockets (defaults to the
    /// TINYSQLAPI_SOCKET_DIR environment variable, then the temp dir).
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Directory database files are created in (defaults to the working
    /// directory).
    #[arg(long)]
    db_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        version = sqlapi_protocol::VERSION,
        client_id = args.client_id,
        "broker starting"
    );

    let socket_dir = args.socket_dir.unwrap_or_else(sqlapi_protocol::socket_dir);

    let _guard = match singleton::acquire(&socket_dir) {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            info!("broker already running; exiting");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("FATAL: singleton election failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.client_id <= 0 {
        error!(client_id = args.client_id, "client id must be positive; not starting");
        return ExitCode::SUCCESS;
    }

    let cfg = BrokerConfig {
        socket_dir,
        db_dir: args.db_dir.unwrap_or_else(|| PathBuf::from(".")),
        first_client: Some(args.client_id),
    };

    match broker::run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("FATAL: broker failed: {e}");
            ExitCode::FAILURE
        }
    }
}
