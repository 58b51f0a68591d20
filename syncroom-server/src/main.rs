use anyhow::Result;
use clap::Parser;
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use syncroom_server::{
    accept_connection, init_log, ClientManager, Config, FixedExtractor, FixedUserDirectory,
    HttpExtractor, HttpUserDirectory, InfoExtractor, LocalBus, MessageBus, RedisBus, RoomManager,
    UserDirectory,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(
        short,
        long,
        default_value_t = 3300,
        help = "Specify the port number to use for client connections"
    )]
    port: u16,

    #[clap(short, long, help = "Path to the YAML configuration file")]
    config: Option<PathBuf>,
}

fn bind_dual_stack(port: u16) -> std::io::Result<std::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port).into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let _guard = init_log(&config)?;

    let bus: Arc<dyn MessageBus> = match &config.bus {
        Some(url) => Arc::new(RedisBus::connect(url).await?),
        None => {
            warn!("no bus configured, cross-node sync is disabled");
            LocalBus::new()
        }
    };
    let (extractor, users): (Arc<dyn InfoExtractor>, Arc<dyn UserDirectory>) =
        match &config.api_base {
            Some(base) => (
                Arc::new(HttpExtractor::new(base.clone())),
                Arc::new(HttpUserDirectory::new(base.clone())),
            ),
            None => {
                warn!("no api configured, using fixed catalogs");
                (
                    Arc::new(FixedExtractor::default()),
                    Arc::new(FixedUserDirectory::default()),
                )
            }
        };

    let rooms = RoomManager::new(Arc::clone(&bus), extractor, users);
    let _update_loop = rooms.spawn_update_loop();

    let manager = ClientManager::new(rooms, bus);
    manager.start().await;
    let _keepalive = manager.spawn_keepalive();

    let listener = match bind_dual_stack(args.port) {
        Ok(listener) => {
            println!("Listening on [::]:{} (IPv4 and IPv6)", args.port);
            TcpListener::from_std(listener)?
        }
        Err(err) => {
            warn!("failed to bind dual-stack: {err}");
            println!("Falling back to IPv4 only");
            TcpListener::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), args.port)).await?
        }
    };

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("received connection from {addr}");
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    if let Err(err) = accept_connection(manager, stream).await {
                        warn!("connection failed: {err:?}");
                    }
                });
            }
            Err(err) => warn!("failed to accept: {err:?}"),
        }
    }
}
