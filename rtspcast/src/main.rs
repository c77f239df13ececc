mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use rtspcast_core::{
    bootstrap::{load_config, validate_config},
    logging, Config,
};

use server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "rtspcast")]
#[command(about = "Relay one RTSP source to WebRTC viewers through Kurento", long_about = None)]
struct Args {
    /// Config file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Kurento control channel address
    #[arg(short, long, env = "KURENTO")]
    kurento: Option<String>,

    /// RTSP source URI
    #[arg(short, long, env = "RTSP")]
    rtsp: Option<String>,

    /// Path of the viewer signaling WebSocket
    #[arg(short, long, env = "WS")]
    ws: Option<String>,

    /// Directory served to browsers
    #[arg(long, env = "STATIC_DIR")]
    static_dir: Option<String>,
}

impl Args {
    /// Apply command line and environment overrides on top of `config`
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(kurento) = &self.kurento {
            config.media.kurento_url.clone_from(kurento);
        }
        if let Some(rtsp) = &self.rtsp {
            config.media.source_uri.clone_from(rtsp);
        }
        if let Some(ws) = &self.ws {
            config.server.ws_path.clone_from(ws);
        }
        if let Some(static_dir) = &self.static_dir {
            config.server.static_dir.clone_from(static_dir);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, then command line overrides
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);

    // 2. Validate configuration (fail fast on misconfigurations)
    validate_config(&config)?;

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("rtspcast starting...");
    info!("HTTP address: {}", config.http_address());
    info!(kurento = %config.media.kurento_url, source = %config.media.source_uri, "Media configuration");

    // 4. Run until a signal or a fatal ingest failure
    RelayServer::new(config).run().await
}
