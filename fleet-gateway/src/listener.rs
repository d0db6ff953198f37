use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::extract::connect_info::ConnectInfo;
use fleet_gateway_task::{ChildTask, ShutdownSignal, Task};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;
use url::Url;

use crate::FgwState;

#[derive(Debug, Clone, Serialize)]
pub struct ListenerUrls {
    /// URL to use on local network
    pub internal_url: Url,

    /// URL to use from external networks
    pub external_url: Url,
}

pub struct GatewayListener {
    addr: SocketAddr,
    listener_url: Url,
    listener: TcpListener,
    state: FgwState,
}

impl GatewayListener {
    pub fn init_and_bind(url: &Url, state: FgwState) -> anyhow::Result<Self> {
        info!(%url, "Initiating listener…");

        anyhow::ensure!(url.scheme() == "http", "unsupported listener scheme: {}", url.scheme());

        let socket_addr = url_to_socket_addr(url).context("invalid listener URL")?;

        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };
        socket.bind(socket_addr).context("failed to bind TCP socket")?;

        let listener = socket
            .listen(64)
            .context("failed to listen with the bound TCP socket")?;

        info!(addr = %socket_addr, "Listener started successfully");

        Ok(Self {
            addr: socket_addr,
            listener_url: url.clone(),
            listener,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[instrument("listener", skip(self), fields(port = self.listener_url.port().unwrap_or(80)))]
    pub async fn run(self) -> anyhow::Result<()> {
        run_http_listener(self.listener, self.state).await
    }
}

#[async_trait]
impl Task for GatewayListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "gateway listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn run_http_listener(listener: TcpListener, state: FgwState) -> anyhow::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = state.clone();

                let fut = async move {
                    if let Err(e) = handle_http_peer(stream, state, peer_addr).await {
                        error!(error = format!("{e:#}"), "handle_http_peer failed");
                    }
                }
                .instrument(info_span!("http", client = %peer_addr));

                ChildTask::spawn(fut).detach();
            }
            Err(error) => {
                error!(%error, "failed to accept connection");
            }
        }
    }
}

pub(crate) async fn handle_http_peer(stream: TcpStream, state: FgwState, peer_addr: SocketAddr) -> anyhow::Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay on TcpStream failed");
    }

    let app = crate::make_http_service(state).layer(axum::Extension(ConnectInfo(peer_addr)));

    let service = hyper_util::service::TowerToHyperService::new(app);

    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
        .map_err(|error| anyhow::anyhow!("HTTP connection failed: {error}"))
}

pub fn url_to_socket_addr(url: &Url) -> anyhow::Result<SocketAddr> {
    let host = url.host_str().context("bad URL: host missing")?;
    let port = url
        .port_or_known_default()
        .context("bad URL: port missing")?;

    // Config files use `*` for "all interfaces".
    let ip: IpAddr = if host == "*" {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse().context("listener host must be an IP address or `*`")?
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_host_binds_all_interfaces() {
        let url: Url = "http://*:7171".parse().unwrap();
        let addr = url_to_socket_addr(&url).unwrap();

        assert_eq!(addr, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7171));
    }

    #[test]
    fn explicit_host_is_parsed() {
        let url: Url = "http://127.0.0.1:8080".parse().unwrap();
        let addr = url_to_socket_addr(&url).unwrap();

        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }
}
