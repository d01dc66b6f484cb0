//! Entry point for `p2p-over-udp`.
//!
//! Small demo front-end over [`p2p_over_udp::NetStack`]: send or receive
//! virtual datagrams, or open a stream listener / client.  Set `RUST_LOG`
//! to see what the stack does underneath.

use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use p2p_over_udp::{
    CallerId, NetConfig, NetStack, RecvFlags, VirtualAddr, AF_INET, SOCK_DGRAM_P2P, SOCK_STREAM_P2P,
};

/// Virtual sockets over shared UDP ports.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    net: NetArgs,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct NetArgs {
    /// Host address every real UDP socket binds to.
    #[arg(long, default_value = "0.0.0.0", global = true)]
    bind_ip: IpAddr,
    /// Real port used by sockets that never bind explicitly (0 = any).
    #[arg(long, default_value_t = 3658, global = true)]
    default_port: u16,
    /// Resends before a stream connection is declared dead.
    #[arg(long, default_value_t = 10, global = true)]
    max_retries: u32,
}

#[derive(Subcommand)]
enum Mode {
    /// Bind a datagram socket and print whatever arrives.
    DgramRecv {
        #[arg(short, long, default_value_t = 3658)]
        port: u16,
        #[arg(short, long)]
        vport: u16,
    },
    /// Send one datagram.
    DgramSend {
        /// Real address of the receiver (e.g. 127.0.0.1:3658).
        #[arg(short, long)]
        to: SocketAddr,
        #[arg(short, long)]
        vport: u16,
        #[arg(short, long)]
        message: String,
    },
    /// Accept stream connections and print what they send.
    Listen {
        #[arg(short, long, default_value_t = 3658)]
        port: u16,
        #[arg(short, long)]
        vport: u16,
    },
    /// Connect a stream, send a message, and print the reply.
    Connect {
        #[arg(short, long)]
        to: SocketAddr,
        #[arg(short, long)]
        vport: u16,
        #[arg(short, long)]
        message: String,
    },
}

impl NetArgs {
    fn config(&self) -> NetConfig {
        let mut config = NetConfig {
            bind_ip: self.bind_ip,
            default_port: self.default_port,
            ..NetConfig::default()
        };
        config.retransmit.max_retries = self.max_retries;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let stack = NetStack::start(cli.net.config());
    let me = CallerId::next();

    match cli.mode {
        Mode::DgramRecv { port, vport } => {
            let id = stack.socket(AF_INET, SOCK_DGRAM_P2P, 0)?;
            let local = VirtualAddr::new(SocketAddr::new(cli.net.bind_ip, port), vport);
            stack.bind(id, local).with_context(|| format!("binding {local}"))?;
            log::info!("datagram socket listening on {}", stack.getsockname(id)?);
            let mut buf = vec![0u8; 2048];
            loop {
                let (n, from) = stack.recv_from(me, id, &mut buf, RecvFlags::empty()).await?;
                log::info!("{n} bytes from {from}: {}", String::from_utf8_lossy(&buf[..n]));
            }
        }
        Mode::DgramSend { to, vport, message } => {
            let id = stack.socket(AF_INET, SOCK_DGRAM_P2P, 0)?;
            let dest = VirtualAddr::new(to, vport);
            let n = stack.send_to(id, message.as_bytes(), Some(dest))?;
            log::info!("sent {n} bytes from {} to {dest}", stack.getsockname(id)?);
        }
        Mode::Listen { port, vport } => {
            let listener = stack.socket(AF_INET, SOCK_STREAM_P2P, 0)?;
            stack.bind(listener, VirtualAddr::new(SocketAddr::new(cli.net.bind_ip, port), vport))?;
            stack.listen(listener, 16)?;
            log::info!("stream listener on {}", stack.getsockname(listener)?);
            loop {
                let (conn, peer) = stack.accept(me, listener).await?;
                log::info!("connection from {peer}");
                let mut buf = vec![0u8; 4096];
                loop {
                    match stack.recv(me, conn, &mut buf, RecvFlags::empty()).await {
                        Ok(n) => {
                            log::info!("{peer}: {}", String::from_utf8_lossy(&buf[..n]));
                            stack.send(conn, &buf[..n])?;
                        }
                        Err(e) => {
                            log::info!("{peer}: {e}");
                            break;
                        }
                    }
                }
                stack.close(conn).await?;
            }
        }
        Mode::Connect { to, vport, message } => {
            let id = stack.socket(AF_INET, SOCK_STREAM_P2P, 0)?;
            let peer = VirtualAddr::new(to, vport);
            stack.connect(me, id, peer).await.with_context(|| format!("connecting to {peer}"))?;
            log::info!("connected {} → {peer}", stack.getsockname(id)?);
            stack.send(id, message.as_bytes())?;
            let mut buf = vec![0u8; 4096];
            let n = stack.recv(me, id, &mut buf, RecvFlags::empty()).await?;
            if n == 0 {
                bail!("connection closed before a reply arrived");
            }
            log::info!("reply: {}", String::from_utf8_lossy(&buf[..n]));
            stack.close(id).await?;
        }
    }

    stack.shutdown();
    Ok(())
}
